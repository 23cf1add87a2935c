//! Per-connection session admission
//!
//! A counting semaphore acquired without waiting: a channel either gets a
//! slot right away or is refused. The slot goes back when the permit drops,
//! whichever way the session ends.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("concurrent sessions limit of {limit} reached")]
pub struct LimitReached {
    pub limit: usize,
}

/// Bounded pool of session slots for one connection
#[derive(Debug, Clone)]
pub struct SessionLimiter {
    slots: Option<Arc<Semaphore>>,
    limit: usize,
}

/// One admitted session's slot
#[derive(Debug)]
pub struct SessionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl SessionLimiter {
    /// A limit of zero or less admits everything.
    pub fn new(limit: i64) -> Self {
        match usize::try_from(limit) {
            Ok(limit) if limit > 0 => Self {
                slots: Some(Arc::new(Semaphore::new(limit))),
                limit,
            },
            _ => Self::unbounded(),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            slots: None,
            limit: 0,
        }
    }

    /// Slots currently free; `None` when unbounded
    pub fn available(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.available_permits())
    }

    pub fn try_acquire(&self) -> Result<SessionPermit, LimitReached> {
        let Some(slots) = &self.slots else {
            return Ok(SessionPermit { _permit: None });
        };
        slots
            .clone()
            .try_acquire_owned()
            .map(|permit| SessionPermit {
                _permit: Some(permit),
            })
            .map_err(|_| LimitReached { limit: self.limit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_non_positive_limit_is_unbounded() {
        for limit in [0, -1, i64::MIN] {
            let limiter = SessionLimiter::new(limit);
            assert_eq!(limiter.available(), None);
            let permits: Vec<_> = (0..1000).map(|_| limiter.try_acquire()).collect();
            assert!(permits.iter().all(Result::is_ok));
        }
    }

    #[test]
    fn test_rejects_beyond_limit() {
        let limiter = SessionLimiter::new(3);
        let first = assert_ok!(limiter.try_acquire());
        let _second = assert_ok!(limiter.try_acquire());
        let _third = assert_ok!(limiter.try_acquire());

        let err = assert_err!(limiter.try_acquire());
        assert_eq!(err, LimitReached { limit: 3 });
        assert_err!(limiter.try_acquire());

        drop(first);
        assert_eq!(limiter.available(), Some(1));
        assert_ok!(limiter.try_acquire());
    }

    #[test]
    fn test_clones_share_slots() {
        let limiter = SessionLimiter::new(1);
        let other = limiter.clone();
        let _permit = assert_ok!(limiter.try_acquire());
        assert_err!(other.try_acquire());
    }

    #[tokio::test]
    async fn test_permit_released_when_task_panics() {
        let limiter = SessionLimiter::new(1);
        let permit = assert_ok!(limiter.try_acquire());

        let task = tokio::spawn(async move {
            let _permit = permit;
            panic!("session blew up");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(limiter.available(), Some(1));
    }
}
