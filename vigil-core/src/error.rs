use thiserror::Error;
use vigil_model::{ModelError, ModuleId, ScanId, ScanStatus};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Scan {scan_id} is not cancellable (status {status})")]
    NotCancellable { scan_id: ScanId, status: ScanStatus },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Module {0} is disabled")]
    ModuleDisabled(ModuleId),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidTransition { .. } => EngineError::InvalidTransition(err.to_string()),
            ModelError::InvalidAsset(_) | ModelError::InvalidSeverity(_) => {
                EngineError::InvalidReference(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
