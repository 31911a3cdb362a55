use thiserror::Error;

/// Low-level network failures. Every variant is retryable; the transport
/// layer exhausts its retry budget before surfacing one of these as
/// [`EngineError::TargetUnreachable`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:.1}s")]
    Timeout(f64),

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("network error: {0}")]
    Network(String),
}

/// Engine-level error taxonomy. Transport retries live below this layer;
/// everything here bubbles to the per-parameter pipeline, which logs and
/// moves on to the next parameter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("target unreachable after retries: {0}")]
    TargetUnreachable(#[source] TransportError),

    #[error("oracle cannot distinguish true from false responses: {0}")]
    OracleAmbiguous(String),

    #[error("unable to fingerprint back-end DBMS")]
    DbmsUnknown,

    #[error("all comparison operators appear filtered, extraction impossible")]
    ExtractionImpossible,

    #[error("extraction incomplete: retrieved {got} of {expected} characters")]
    ExtractionIncomplete { value: String, got: usize, expected: usize },

    #[error("HTTP 401 received; supply credentials or add 401 to ignore_code")]
    AuthRequired,

    #[error("endpoint started returning HTTP {status} after a healthy baseline")]
    HttpBreak { status: u16 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("aborted by user")]
    UserAbort,

    #[error("payload template left placeholder {0} unsubstituted")]
    Template(String),

    #[error("session store failure: {0}")]
    Store(#[from] sqlx::Error),

    #[error("record serialization failure: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Soft errors leave the parameter usable for other vectors; hard errors
    /// abort the whole target.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::AuthRequired
                | EngineError::Config(_)
                | EngineError::HttpBreak { .. }
                | EngineError::TargetUnreachable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(EngineError::AuthRequired.is_fatal());
        assert!(EngineError::Config("bad ignore_code".into()).is_fatal());
        assert!(!EngineError::DbmsUnknown.is_fatal());
        assert!(!EngineError::ExtractionIncomplete {
            value: "tes".into(),
            got: 3,
            expected: 6
        }
        .is_fatal());
    }
}
