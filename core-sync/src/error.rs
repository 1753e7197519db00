use bridge_traits::BridgeError;
use core_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync already in progress for device {device_id}")]
    SyncInProgress { device_id: String },

    #[error("Network not available")]
    Offline,

    /// Transient remote failure (network, 5xx, per-call timeout)
    #[error("Remote store error: {0}")]
    Remote(String),

    /// The remote store refused the request; retrying will not help
    #[error("Rejected by remote store: {0}")]
    Rejected(String),

    #[error("Sync timeout after {0} seconds")]
    Timeout(u64),

    #[error("Sync cancelled")]
    Cancelled,

    /// Local store failure; fatal for the current run
    #[error("Local storage error: {0}")]
    LocalStorage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sync job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Outbox entry {entry_id} not found")]
    EntryNotFound { entry_id: String },

    #[error("{entity_type} {entity_id} not found")]
    EntityNotFound {
        entity_type: String,
        entity_id: String,
    },

    #[error("Unknown entity family: {0}")]
    UnknownFamily(String),

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Invalid ID: {0}")]
    InvalidId(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },
}

impl SyncError {
    /// Errors that abort the whole run instead of a single entry or family.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::LocalStorage(_) | SyncError::Timeout(_))
    }

    /// Errors a later run may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Remote(_)
                | SyncError::Offline
                | SyncError::SyncInProgress { .. }
                | SyncError::Timeout(_)
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(e) => SyncError::Serialization(e.to_string()),
            StoreError::InvalidInput { field, message } => {
                SyncError::InvalidInput { field, message }
            }
            StoreError::UnknownFamily(name) | StoreError::InvalidFamily(name) => {
                SyncError::UnknownFamily(name)
            }
            StoreError::NotFound { entity_type, id } => SyncError::EntityNotFound {
                entity_type,
                entity_id: id,
            },
            other => SyncError::LocalStorage(other.to_string()),
        }
    }
}

impl From<BridgeError> for SyncError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Rejected(msg) => SyncError::Rejected(msg),
            other => SyncError::Remote(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_local_storage() {
        let err: SyncError = StoreError::Migration("boom".to_string()).into();
        assert!(matches!(err, SyncError::LocalStorage(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bridge_rejection_is_permanent() {
        let err: SyncError = BridgeError::Rejected("title required".to_string()).into();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert!(!err.is_transient());

        let err: SyncError = BridgeError::Timeout(30_000).into();
        assert!(matches!(err, SyncError::Remote(_)));
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }
}
