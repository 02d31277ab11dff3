use thiserror::Error;

/// Error surface of the kernel LB-table binding.
///
/// Both the netlink implementation and the in-memory one report through the
/// same variants so the reconciler behaves identically against either.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(String),
}
