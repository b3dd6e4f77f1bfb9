//! Error type shared by the client engine and the filesystem adapter.

use std::io;

/// Filesystem error.
///
/// Lane faults are absorbed by the read engine where parity allows; anything
/// that reaches the adapter surfaces to the shim as an errno.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("lane {0} is down")]
    LaneFault(usize),
    #[error("unrecoverable read: {0} lanes down")]
    Unrecoverable(usize),
    #[error("not found")]
    NotFound,
    #[error("invalid file descriptor")]
    NoSuchFd,
    #[error("read-write open is not supported")]
    AccessDenied,
    #[error("a read session is already active")]
    Busy,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FsError {
    /// errno the adapter reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::Config(_) => libc::EINVAL,
            FsError::Connect { .. } => libc::EIO,
            FsError::LaneFault(_) => libc::EIO,
            FsError::Unrecoverable(_) => libc::EIO,
            FsError::NotFound => libc::ENOENT,
            FsError::NoSuchFd => libc::EBADF,
            FsError::AccessDenied => libc::EACCES,
            FsError::Busy => libc::EBUSY,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
