//! Crate-wide error type.
//!
//! Only object- and loop-level failures live here. Per-descriptor I/O (read, write,
//! send, recv) reports through `io::Result` and never crosses the loop boundary.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use crate::address::AddressError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Creating or opening a descriptor failed (socket, open, timerfd, epoll, io_uring).
    Acquisition { op: &'static str, source: io::Error },
    /// The backend rejected an add, modify or delete.
    Registration {
        op: &'static str,
        fd: RawFd,
        source: io::Error,
    },
    /// Waiting for readiness failed for a reason other than signal interruption.
    Wait(io::Error),
    /// Device configuration (termios) failed.
    Device { op: &'static str, source: io::Error },
    Address(AddressError),
    UnsupportedBaudRate(u32),
}

impl Error {
    pub(crate) fn acquisition(op: &'static str) -> Self {
        Error::Acquisition {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn device(op: &'static str) -> Self {
        Error::Device {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn registration(op: &'static str, fd: RawFd, source: io::Error) -> Self {
        Error::Registration { op, fd, source }
    }

    /// OS error code carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Acquisition { source, .. }
            | Error::Registration { source, .. }
            | Error::Wait(source)
            | Error::Device { source, .. } => source.raw_os_error(),
            Error::Address(_) | Error::UnsupportedBaudRate(_) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Acquisition { op, source } => write!(f, "{op} failed: {source}"),
            Error::Registration { op, fd, source } => write!(f, "{op} on fd {fd} failed: {source}"),
            Error::Wait(source) => write!(f, "readiness wait failed: {source}"),
            Error::Device { op, source } => write!(f, "{op} failed: {source}"),
            Error::Address(e) => write!(f, "{e}"),
            Error::UnsupportedBaudRate(speed) => write!(f, "unsupported baud rate {speed}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Acquisition { source, .. }
            | Error::Registration { source, .. }
            | Error::Wait(source)
            | Error::Device { source, .. } => Some(source),
            Error::Address(e) => Some(e),
            Error::UnsupportedBaudRate(_) => None,
        }
    }
}

impl From<AddressError> for Error {
    fn from(e: AddressError) -> Self {
        Error::Address(e)
    }
}
