use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    /// Raised both for tokens the store does not know and for payloads that
    /// can no longer be decoded.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No active scope")]
    NoActiveScope,

    #[error("Binding '{0}' holds a value of a different type")]
    BindingType(&'static str),

    #[error("Invalid scope state: {0}")]
    InvalidState(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Change callback failed: {0}")]
    Callback(anyhow::Error),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, ContextError>;

impl<T> From<std::sync::PoisonError<T>> for ContextError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ContextError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
