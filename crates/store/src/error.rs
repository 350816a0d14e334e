//! Store error taxonomy. Not-found, conflict, and immutable-field
//! rejections are distinguishable so callers can branch on them;
//! everything else is treated as transient and retried by the caller's
//! scheduling cadence.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("conflict updating {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
        message: String,
    },

    /// The API server rejected an update because an immutable field
    /// changed; the object needs replacement, not mutation.
    #[error("immutable field on {kind} {namespace}/{name}: {message}")]
    Immutable {
        kind: String,
        namespace: String,
        name: String,
        message: String,
    },

    /// Transport or API-server failure; transient from the reconciler's
    /// point of view.
    #[error("api error: {0}")]
    Api(String),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_immutable(&self) -> bool {
        matches!(self, StoreError::Immutable { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
