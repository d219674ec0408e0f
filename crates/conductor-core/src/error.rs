use thiserror::Error;

/// Errors surfaced by the engine's public operations. Bus subscribers handle
/// everything else internally: malformed payloads are logged and dropped,
/// unknown references are denied silently.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Inactive(String),

    #[error("transport: {0}")]
    Transport(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}
