use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    /// The remote side understood the request and refused it. Retrying the
    /// same payload will not succeed.
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the failure may go away on its own and the call is worth
    /// repeating later.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Rejected(_) | BridgeError::NotAvailable(_) => false,
            BridgeError::OperationFailed(_)
            | BridgeError::Timeout(_)
            | BridgeError::Network(_)
            | BridgeError::Io(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
