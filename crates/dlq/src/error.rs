use thiserror::Error;

#[derive(Error, Debug)]
pub enum DlqError {
    #[error("DLQ entry not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DlqError>;
