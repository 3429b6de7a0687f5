use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid mnemonic phrase: {0}")]
    InvalidMnemonic(String),

    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No aggregators configured")]
    NoAggregators,

    #[error("No endpoints to register for API {api_id}")]
    NoEndpoints { api_id: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Aggregator rejected request ({status}): {body}")]
    AggregatorRejected { status: u16, body: String },

    #[error("Transaction already used: {0}")]
    TransactionAlreadyUsed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error should stop node startup rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidMnemonic(_)
                | Error::InvalidSecretKey(_)
                | Error::Config(_)
                | Error::NoAggregators
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
