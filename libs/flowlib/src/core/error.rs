use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Structural error: {0}")]
    Structure(String),

    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
