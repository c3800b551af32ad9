use super::*;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure talking to the store. Transient; the caller
    /// may retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// A record with this id already exists, or a concurrent writer won a
    /// guarded write. Expected under concurrency; caller-recoverable.
    #[error("server {0} is already registered")]
    AlreadyRegistered(ServerId),

    /// No record with this id exists.
    #[error("server {0} is not registered")]
    NotRegistered(ServerId),

    /// A stored record or textual encoding failed to decode.
    #[error("malformed {what}: {reason}")]
    Malformed { what: String, reason: String },

    /// The registry holds no members; there is nothing to connect to.
    #[error("no members in the registry")]
    NoMembers,
}

impl Error {
    pub(crate) fn malformed(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Malformed {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}
