use thiserror::Error;

/// Failure to decode or integrate an incremental update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

impl From<yrs::encoding::read::Error> for MergeError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        MergeError::Decode(e.to_string())
    }
}

/// Errors on the optimistic-concurrency path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// The client's base version is not the stored version.
    #[error("version conflict: client at {client_version}, server at {server_version}")]
    VersionConflict {
        client_version: u64,
        server_version: u64,
    },
    /// Patch operations failed to apply to the current content.
    #[error("patch failed to apply: {0}")]
    InvalidPatch(String),
    /// Patch payload is not a JSON patch array.
    #[error("malformed patch payload: {0}")]
    Malformed(String),
}
