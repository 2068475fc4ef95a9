use thiserror::Error;

use crate::scan::ScanStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid asset value: {0}")]
    InvalidAsset(String),

    #[error("invalid scan transition {from} -> {to}")]
    InvalidTransition { from: ScanStatus, to: ScanStatus },

    #[error("invalid severity: {0}")]
    InvalidSeverity(String),
}
