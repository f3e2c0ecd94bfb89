use core_offline::OfflineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Offline cache error: {0}")]
    Offline(#[from] OfflineError),
}

impl CoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Offline(err) => err.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
