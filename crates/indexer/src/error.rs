use thiserror::Error;

/// Errors raised by the ingestion-and-aggregation pipeline.
///
/// The variants follow how the caller must react: transient source failures
/// are retried, consistency and malformed-input failures halt the affected
/// contract, persistence failures abort the current block.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("block source error: {0}")]
    Source(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("data consistency error for {contract}: {reason}")]
    Consistency { contract: String, reason: String },

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl IndexerError {
    pub fn consistency(contract: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Consistency {
            contract: contract.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    /// Source failures and blocks the source does not have yet are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Source(_) | Self::NotFound(_))
    }

    pub fn halts_contract(&self) -> bool {
        matches!(self, Self::Consistency { .. } | Self::Malformed(_))
    }
}

impl From<diesel::result::Error> for IndexerError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<diesel_async::pooled_connection::bb8::RunError> for IndexerError {
    fn from(err: diesel_async::pooled_connection::bb8::RunError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Source(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for IndexerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Source(err.to_string())
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<url::ParseError> for IndexerError {
    fn from(err: url::ParseError) -> Self {
        Self::Malformed(err.to_string())
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
