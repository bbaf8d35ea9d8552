use thiserror::Error;

/// Error taxonomy of the object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("name must not be empty")]
    NameEmpty,
    #[error("namespace must not be empty")]
    NamespaceEmpty,
    #[error("invalid identity: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("object changed: {0}")]
    ObjectChanged(String),
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::ObjectChanged(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
}

/// Classify an `anyhow` chain that may carry a store error.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.downcast_ref::<StoreError>().is_some_and(StoreError::is_not_found))
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.downcast_ref::<StoreError>().is_some_and(StoreError::is_conflict))
}
