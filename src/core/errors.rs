use thiserror::Error;

/// Error taxonomy for the orchestration core.
///
/// `Retrieval` errors never fail a turn — the retriever swallows them and
/// degrades the result set. `CompletionTransport` and `Persistence` errors
/// always surface to the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("retrieval: {0}")]
    Retrieval(String),
    #[error("completion transport: {0}")]
    CompletionTransport(String),
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config: {0}")]
    Config(String),
}

impl CoreError {
    pub fn retrieval<E: std::fmt::Display>(err: E) -> Self {
        CoreError::Retrieval(err.to_string())
    }

    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        CoreError::CompletionTransport(err.to_string())
    }

    pub fn persistence<E: std::fmt::Display>(err: E) -> Self {
        CoreError::Persistence(err.to_string())
    }
}
