//! The error taxonomy described in spec §7/§4.8.
//!
//! One enum, `thiserror`-derived, rather than a family of types: callers
//! that care about a specific kind match on the variant; callers that don't
//! just propagate with `?`.

use std::process::ExitStatus;

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input from the consumer: null/empty where forbidden, out of
    /// range, or two mutually-exclusive settings given at once.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A mutating setter was called while `connect`ed.
    #[error("core is busy (connected): cannot change {0} now")]
    Busy(&'static str),

    /// Allocation failure, surfaced from the ring buffer or elsewhere.
    #[error("out of memory")]
    OutOfMemory,

    /// A system call failed.
    #[error("os error: {0}")]
    OsError(#[from] Errno),

    /// The mux server produced something the parser or reconciler could
    /// not make sense of: an unrecognised event name, a malformed layout
    /// string, or (at connect time) a version string below the threshold.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A bounded wait (`wait_pid`, `cc_exec`) elapsed without completing.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A one-shot command's child process exited with a non-zero status.
    #[error("child exited with {status:?}: {stderr}")]
    ChildFailed { status: ExitStatus, stderr: String },

    /// `std::io::Error` encountered while plumbing stdio pipes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArg(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::ParseError(msg.into())
    }
}
