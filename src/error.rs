use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a caller of the pool can observe.
///
/// Liveness failures on release and overload are absorbed by the pool and
/// never show up here.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed settings or an alias nobody configured.
    #[error("improperly configured: {0}")]
    Config(String),

    /// The driver rejected the target outright (credentials, missing database,
    /// unreachable at pool creation). Never retried.
    #[error("fatal error for alias `{alias}`: {source}")]
    Fatal {
        alias: String,
        #[source]
        source: BoxError,
    },

    /// A failure worth trying again (refused connection, network blip,
    /// server connection ceiling).
    #[error("transient error for alias `{alias}`: {source}")]
    Transient {
        alias: String,
        #[source]
        source: BoxError,
    },

    /// No connection or slot freed up before the deadline.
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    /// The pool stopped accepting acquisitions while the call was in flight.
    #[error("pool for alias `{0}` is draining")]
    Draining(String),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Fatal { .. })
    }

    /// Timeouts are retried only when [`crate::retry::RetryPolicy`] asks for it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::Draining(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub(crate) fn connect<E>(alias: &str, fatal: bool, e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let source: BoxError = Box::new(e);
        if fatal {
            Error::Fatal {
                alias: alias.to_string(),
                source,
            }
        } else {
            Error::Transient {
                alias: alias.to_string(),
                source,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    #[test]
    fn test_classification() {
        let e = Error::connect("default", false, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(e.is_retryable());
        assert!(!e.is_fatal());

        let e = Error::connect("default", true, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(e.is_fatal());
        assert!(!e.is_retryable());

        assert!(Error::Draining("default".into()).is_retryable());
        assert!(Error::Config("x".into()).is_fatal());
        assert!(!Error::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(Error::Timeout(Duration::from_millis(5)).is_timeout());
    }

    #[test]
    fn test_display() {
        let e = Error::RetriesExhausted {
            attempts: 3,
            source: Box::new(Error::Draining("replica".into())),
        };
        assert_eq!(
            e.to_string(),
            "gave up after 3 attempts: pool for alias `replica` is draining"
        );
    }
}
