use thiserror::Error;

/// Error surface of the source-rewrite rule binding.
#[derive(Debug, Error)]
pub enum SnatError {
    #[error("failed to run {program}: {reason}")]
    Exec { program: String, reason: String },

    #[error("{program} {args} exited with {code}: {stderr}")]
    CommandFailed {
        program: String,
        args: String,
        code: i32,
        stderr: String,
    },

    #[error("snat reconcile: {0} rule(s) failed to apply")]
    Partial(usize),
}
