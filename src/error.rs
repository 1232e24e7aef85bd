use crate::identity::ContextId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("lock unavailable after {attempts} attempts (held by {holder:?})")]
    Unavailable {
        attempts: u32,
        holder: Option<ContextId>,
    },

    #[error("backend not ready after {polls} readiness polls")]
    BackendNotReady { polls: u32 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
