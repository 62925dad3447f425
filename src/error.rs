//! Error codes returned by every fallible operation.
//!
//! Errors are a small closed set. Outcomes of transfers that were accepted by
//! the backend are not errors: they are reported once through the transfer
//! callback as a [`TransferStatus`](crate::TransferStatus).
use crate::descriptors::DecodeError;
use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Input/output error reported by the backend, or a malformed descriptor.
    #[error("Input/Output Error")]
    Io,
    #[error("Invalid parameter")]
    InvalidParam,
    #[error("Access denied (insufficient permissions)")]
    Access,
    /// The device was detached underneath the call.
    #[error("No such device (it may have been disconnected)")]
    NoDevice,
    #[error("Entity not found")]
    NotFound,
    /// A transfer is already in flight, an interface is claimed elsewhere, ...
    #[error("Resource busy")]
    Busy,
    #[error("Operation timed out")]
    Timeout,
    /// The caller's buffer is too small.
    #[error("Overflow")]
    Overflow,
    /// Endpoint stalled.
    #[error("Pipe error")]
    Pipe,
    /// Polling was interrupted, safe to retry.
    #[error("System call interrupted (perhaps due to signal)")]
    Interrupted,
    #[error("Insufficient memory")]
    NoMem,
    /// The capability is absent on this backend or platform.
    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,
    #[error("Other error")]
    Other,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable symbolic name, e.g. `"LIBUSB_ERROR_NO_DEVICE"`.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Io => "LIBUSB_ERROR_IO",
            Error::InvalidParam => "LIBUSB_ERROR_INVALID_PARAM",
            Error::Access => "LIBUSB_ERROR_ACCESS",
            Error::NoDevice => "LIBUSB_ERROR_NO_DEVICE",
            Error::NotFound => "LIBUSB_ERROR_NOT_FOUND",
            Error::Busy => "LIBUSB_ERROR_BUSY",
            Error::Timeout => "LIBUSB_ERROR_TIMEOUT",
            Error::Overflow => "LIBUSB_ERROR_OVERFLOW",
            Error::Pipe => "LIBUSB_ERROR_PIPE",
            Error::Interrupted => "LIBUSB_ERROR_INTERRUPTED",
            Error::NoMem => "LIBUSB_ERROR_NO_MEM",
            Error::NotSupported => "LIBUSB_ERROR_NOT_SUPPORTED",
            Error::Other => "LIBUSB_ERROR_OTHER",
        }
    }

    /// Numeric code compatible with the C library's `libusb_error`.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io => -1,
            Error::InvalidParam => -2,
            Error::Access => -3,
            Error::NoDevice => -4,
            Error::NotFound => -5,
            Error::Busy => -6,
            Error::Timeout => -7,
            Error::Overflow => -8,
            Error::Pipe => -9,
            Error::Interrupted => -10,
            Error::NoMem => -11,
            Error::NotSupported => -12,
            Error::Other => -99,
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ENODEV | Errno::ESHUTDOWN => Error::NoDevice,
            Errno::EBUSY => Error::Busy,
            Errno::ENOENT => Error::NotFound,
            Errno::EACCES | Errno::EPERM => Error::Access,
            Errno::EINTR => Error::Interrupted,
            Errno::ENOMEM => Error::NoMem,
            Errno::EINVAL => Error::InvalidParam,
            Errno::ETIMEDOUT => Error::Timeout,
            Errno::EPIPE => Error::Pipe,
            Errno::EOVERFLOW => Error::Overflow,
            Errno::ENOSYS | Errno::ENOTTY => Error::NotSupported,
            _ => Error::Io,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => Error::from(Errno::from_i32(raw)),
            None => match err.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound,
                std::io::ErrorKind::PermissionDenied => Error::Access,
                std::io::ErrorKind::TimedOut => Error::Timeout,
                std::io::ErrorKind::Interrupted => Error::Interrupted,
                std::io::ErrorKind::InvalidInput => Error::InvalidParam,
                _ => Error::Io,
            },
        }
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        log::debug!("descriptor decode failed: {}", err);
        Error::Io
    }
}
