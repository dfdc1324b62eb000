use thiserror::Error;

use crate::database::{DocumentId, RepositoryError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Document {0} not found")]
    NotFound(DocumentId),
    #[error("Store error: {0}")]
    Store(#[from] RepositoryError),
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl ServiceError {
    pub fn upstream(context: &str, error: anyhow::Error) -> Self {
        ServiceError::Upstream(format!("{}: {:#}", context, error))
    }
}
