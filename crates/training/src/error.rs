use registry::BuildError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}
