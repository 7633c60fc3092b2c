use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONNECTION_FAILED: {0}")]
    Connection(String),
    #[error("TIMEOUT: no response within {0} ms")]
    Timeout(u64),
    #[error("QUERY_REJECTED: {0}")]
    Query(String),
    #[error("NORMALIZATION_FAILED: {0}")]
    Normalization(String),
    #[error("ALREADY_RUNNING: {0}")]
    AlreadyRunning(String),
    #[error("PERSISTENCE_FAILURE: {0}")]
    Persistence(String),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
