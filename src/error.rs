use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("api request failed: {0}")]
    ApiRequest(String),

    #[error("api returned http {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("api payload malformed: {0}")]
    ApiPayload(String),

    #[error("could not resolve source reference: {0}")]
    SourceUnresolved(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transfer failed for {name}: {reason}")]
    TransferFailed { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
