use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Unknown entity family: {0}")]
    UnknownFamily(String),

    /// The family's table name is not a safe SQL identifier.
    #[error("Invalid entity family table name: {0}")]
    InvalidFamily(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
