//! PROXY protocol (v1 and v2) header reader
//!
//! Consumes exactly the header bytes from the stream so the SSH
//! negotiation that follows sees an untouched byte stream.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Bound on waiting for the header after accept
pub const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(90);

const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";
const V1_MAX_LEN: usize = 107;

#[derive(Debug, thiserror::Error)]
pub enum ProxyHeaderError {
    #[error("timed out waiting for proxy header")]
    Timeout,

    #[error("malformed proxy header: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read a PROXY header and return the original client address, if the
/// header carried one (`UNKNOWN` and `LOCAL` do not).
pub async fn read_header<S>(
    stream: &mut S,
    timeout: Duration,
) -> Result<Option<SocketAddr>, ProxyHeaderError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_any(stream))
        .await
        .map_err(|_| ProxyHeaderError::Timeout)?
}

async fn read_any<S>(stream: &mut S) -> Result<Option<SocketAddr>, ProxyHeaderError>
where
    S: AsyncRead + Unpin,
{
    // v1 starts with "PROXY", v2 with the 12-byte signature; 5 bytes tell them apart.
    let mut prefix = [0u8; 5];
    stream.read_exact(&mut prefix).await?;
    if &prefix == b"PROXY" {
        read_v1(stream).await
    } else if prefix[..] == V2_SIGNATURE[..5] {
        read_v2(stream).await
    } else {
        Err(ProxyHeaderError::Malformed("missing signature"))
    }
}

async fn read_v1<S>(stream: &mut S) -> Result<Option<SocketAddr>, ProxyHeaderError>
where
    S: AsyncRead + Unpin,
{
    let mut line = b"PROXY".to_vec();
    while !line.ends_with(b"\r\n") {
        if line.len() >= V1_MAX_LEN {
            return Err(ProxyHeaderError::Malformed("v1 header too long"));
        }
        line.push(stream.read_u8().await?);
    }

    let line = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| ProxyHeaderError::Malformed("v1 header is not ascii"))?;
    parse_v1(line)
}

fn parse_v1(line: &str) -> Result<Option<SocketAddr>, ProxyHeaderError> {
    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(ProxyHeaderError::Malformed("v1 header must start with PROXY"));
    }
    match parts.next() {
        Some("UNKNOWN") => return Ok(None),
        Some("TCP4") | Some("TCP6") => {}
        _ => return Err(ProxyHeaderError::Malformed("unsupported v1 protocol")),
    }

    let fields: Vec<&str> = parts.collect();
    let [src, _dst, src_port, _dst_port] = fields[..] else {
        return Err(ProxyHeaderError::Malformed("v1 header needs four address fields"));
    };
    let ip: IpAddr = src
        .parse()
        .map_err(|_| ProxyHeaderError::Malformed("bad v1 source address"))?;
    let port: u16 = src_port
        .parse()
        .map_err(|_| ProxyHeaderError::Malformed("bad v1 source port"))?;
    Ok(Some(SocketAddr::new(ip, port)))
}

async fn read_v2<S>(stream: &mut S) -> Result<Option<SocketAddr>, ProxyHeaderError>
where
    S: AsyncRead + Unpin,
{
    let mut rest = [0u8; 11];
    stream.read_exact(&mut rest).await?;
    if rest[..7] != V2_SIGNATURE[5..] {
        return Err(ProxyHeaderError::Malformed("bad v2 signature"));
    }

    let version_command = rest[7];
    let family = rest[8];
    let len = u16::from_be_bytes([rest[9], rest[10]]) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    if version_command >> 4 != 2 {
        return Err(ProxyHeaderError::Malformed("unsupported v2 version"));
    }
    match version_command & 0x0f {
        // LOCAL: health checks from the proxy itself
        0x0 => return Ok(None),
        0x1 => {}
        _ => return Err(ProxyHeaderError::Malformed("unsupported v2 command")),
    }
    parse_v2_addresses(family, &payload)
}

fn parse_v2_addresses(family: u8, payload: &[u8]) -> Result<Option<SocketAddr>, ProxyHeaderError> {
    match family >> 4 {
        0x1 => {
            let Some(addr) = payload.get(..12) else {
                return Err(ProxyHeaderError::Malformed("short v2 ipv4 block"));
            };
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            let port = u16::from_be_bytes([addr[8], addr[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        0x2 => {
            let Some(addr) = payload.get(..36) else {
                return Err(ProxyHeaderError::Malformed("short v2 ipv6 block"));
            };
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr[..16]);
            let port = u16::from_be_bytes([addr[32], addr[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        // AF_UNSPEC or AF_UNIX: nothing useful for logging
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read(bytes: &[u8]) -> (Result<Option<SocketAddr>, ProxyHeaderError>, Vec<u8>) {
        let mut stream = bytes;
        let result = read_header(&mut stream, Duration::from_secs(1)).await;
        (result, stream.to_vec())
    }

    #[tokio::test]
    async fn test_v1_tcp4() {
        let (addr, rest) = read(b"PROXY TCP4 192.0.2.1 198.51.100.2 56324 22\r\nSSH-2.0-OpenSSH").await;
        assert_eq!(addr.unwrap(), Some("192.0.2.1:56324".parse().unwrap()));
        assert_eq!(rest, b"SSH-2.0-OpenSSH");
    }

    #[tokio::test]
    async fn test_v1_tcp6_and_unknown() {
        let (addr, _) = read(b"PROXY TCP6 2001:db8::1 2001:db8::2 4000 22\r\n").await;
        assert_eq!(addr.unwrap(), Some("[2001:db8::1]:4000".parse().unwrap()));

        let (addr, rest) = read(b"PROXY UNKNOWN\r\nSSH").await;
        assert_eq!(addr.unwrap(), None);
        assert_eq!(rest, b"SSH");
    }

    #[tokio::test]
    async fn test_v1_rejects_garbage() {
        let (addr, _) = read(b"PROXY TCP4 nope 1.2.3.4 1 2\r\n").await;
        assert!(matches!(addr, Err(ProxyHeaderError::Malformed(_))));

        let long = format!("PROXY TCP4 {}\r\n", "1".repeat(200));
        let (addr, _) = read(long.as_bytes()).await;
        assert!(matches!(addr, Err(ProxyHeaderError::Malformed(_))));

        let (addr, _) = read(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        assert!(matches!(addr, Err(ProxyHeaderError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_v2_proxy_ipv4() {
        let mut header = V2_SIGNATURE.to_vec();
        header.extend_from_slice(&[0x21, 0x11, 0x00, 0x0c]);
        header.extend_from_slice(&[10, 0, 0, 7, 10, 0, 0, 1]);
        header.extend_from_slice(&40000u16.to_be_bytes());
        header.extend_from_slice(&22u16.to_be_bytes());
        header.extend_from_slice(b"SSH-2.0");

        let (addr, rest) = read(&header).await;
        assert_eq!(addr.unwrap(), Some("10.0.0.7:40000".parse().unwrap()));
        assert_eq!(rest, b"SSH-2.0");
    }

    #[tokio::test]
    async fn test_v2_local_command() {
        let mut header = V2_SIGNATURE.to_vec();
        header.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);

        let (addr, rest) = read(&header).await;
        assert_eq!(addr.unwrap(), None);
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (_client, mut server) = tokio::io::duplex(64);
        let result = read_header(&mut server, PROXY_HEADER_TIMEOUT).await;
        assert!(matches!(result, Err(ProxyHeaderError::Timeout)));
    }
}
