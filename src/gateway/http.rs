//! HTTP client for the internal authorized-keys API

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use tracing::debug;

use super::{AuthorizationGateway, AuthorizedKey, GatewayError};
use crate::config::Config;
use crate::error::ServerError;

const API_PREFIX: &str = "/api/v4/internal";
const SECRET_HEADER: &str = "Gitlab-Shared-Secret";

/// [`AuthorizationGateway`] backed by the backend's internal REST API
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: reqwest::Url,
    secret_header: String,
    basic_auth: Option<(String, String)>,
}

impl HttpGateway {
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        let base_url = reqwest::Url::parse(config.gitlab_url.trim_end_matches('/'))
            .map_err(|e| ServerError::DependencyInit(format!("invalid gitlab_url: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ServerError::DependencyInit(format!(
                "unsupported gitlab_url scheme {:?}",
                base_url.scheme()
            )));
        }

        let settings = &config.http_settings;
        let client = reqwest::Client::builder()
            .timeout(settings.read_timeout())
            .danger_accept_invalid_certs(settings.self_signed_cert)
            .build()
            .map_err(|e| ServerError::DependencyInit(e.to_string()))?;

        let basic_auth = if settings.user.is_empty() {
            None
        } else {
            Some((settings.user.clone(), settings.password.clone()))
        };

        Ok(Self {
            client,
            base_url,
            secret_header: base64::engine::general_purpose::STANDARD.encode(config.secret.trim()),
            basic_auth,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url.as_str().trim_end_matches('/'), API_PREFIX, path)
    }
}

#[async_trait]
impl AuthorizationGateway for HttpGateway {
    async fn get_by_key(&self, fingerprint: &str) -> Result<AuthorizedKey, GatewayError> {
        let mut request = self
            .client
            .get(self.endpoint("/authorized_keys"))
            .query(&[("key", fingerprint)])
            .header(SECRET_HEADER, &self.secret_header);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => {
                let key: AuthorizedKey = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Decode(e.to_string()))?;
                debug!(key_id = key.id, "backend authorized key");
                Ok(key)
            }
            StatusCode::NOT_FOUND => Err(GatewayError::Denied),
            status => Err(GatewayError::Status(status.as_u16())),
        }
    }
}
