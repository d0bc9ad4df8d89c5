//! Error types for mvirt-pull.

use nix::errno::Errno;
use std::collections::TryReserveError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a transfer job or its transport.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP request failed with status {0}")]
    Status(u16),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Failed to write payload: {0}")]
    Write(#[source] io::Error),

    #[error("Transfer cancelled")]
    Cancelled,
}

/// Errors surfaced by a pull.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("A pull is already in progress")]
    Busy,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Failed to set up event loop: {0}")]
    EventLoopInit(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Network(#[from] TransferError),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Extractor failed: {0}")]
    ChildProcessFailure(String),

    #[error("Local image {} already exists", .0.display())]
    AlreadyExists(PathBuf),
}

impl PullError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        PullError::Io {
            context: context.into(),
            source,
        }
    }

    /// Map to the errno the pull reports to its owner.
    pub fn errno(&self) -> Errno {
        match self {
            PullError::InvalidArgument(_) => Errno::EINVAL,
            PullError::Busy => Errno::EBUSY,
            PullError::OutOfMemory => Errno::ENOMEM,
            PullError::EventLoopInit(_) => Errno::ENXIO,
            PullError::Io { source, .. } => source
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
            PullError::Network(TransferError::Status(404)) => Errno::ENOMEDIUM,
            PullError::Network(TransferError::BodyTooLarge(_)) => Errno::EFBIG,
            PullError::Network(TransferError::Cancelled) => Errno::ECANCELED,
            PullError::Network(_) => Errno::EIO,
            PullError::Discovery(_) => Errno::EBADMSG,
            PullError::ChildProcessFailure(_) => Errno::EPROTO,
            PullError::AlreadyExists(_) => Errno::EEXIST,
        }
    }

    /// Process exit status used when no completion callback is registered.
    pub fn exit_code(&self) -> i32 {
        self.errno() as i32
    }
}

impl From<TryReserveError> for PullError {
    fn from(_: TryReserveError) -> Self {
        PullError::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, PullError>;
