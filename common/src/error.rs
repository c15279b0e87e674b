use thiserror::Error;

/// Error taxonomy shared by the job server, the task servers and the client.
///
/// - [`Error::InvalidArgument`]: precondition violations reported to the caller
/// - [`Error::NotFound`]: unknown job, task, worker or file
/// - [`Error::Protocol`]: malformed shuffle frames or corrupt index sidecars
/// - [`Error::RemoteFailure`]: a shuffle source answered with the failure sentinel
/// - [`Error::Cancelled`]: a cooperative cancellation was observed
/// - [`Error::Io`]: raw filesystem/network failures
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The serving side hit an error and wrote `-1` instead of a response.
    /// Callers retry against another source or fail the attempt.
    #[error("shuffle source reported a failure")]
    RemoteFailure,

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
