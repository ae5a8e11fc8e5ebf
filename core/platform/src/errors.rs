use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PlatformResult<T> = Result<T, PlatformError>;
