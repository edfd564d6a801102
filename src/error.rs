use alloc_counter::no_alloc;
use std::ffi::c_int;

use crate::channel::ErrorReport;

/// Result type for our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error type which can track cause (reason the error happened) and context (what we were
/// doing when the error happened) without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub errno: c_int,
    pub cause: Option<&'static str>,
    pub context: Option<&'static str>,
}

impl Error {
    /// Create an empty error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new() -> Error {
        Error {
            errno: 0,
            cause: None,
            context: None,
        }
    }

    /// Create an error from the last OS error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn last_os_error() -> Error {
        Error {
            errno: unsafe { *libc::__errno_location() },
            cause: None,
            context: None,
        }
    }

    /// Replace the cause of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn cause(self, msg: &'static str) -> Error {
        Error {
            errno: self.errno,
            cause: Some(msg),
            context: self.context,
        }
    }

    /// Replace the context of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn context(self, msg: &'static str) -> Error {
        Error {
            errno: self.errno,
            cause: self.cause,
            context: Some(msg),
        }
    }
}

impl Default for Error {
    fn default() -> Self {
        Self::new()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            errno: e.raw_os_error().unwrap_or(0),
            cause: None,
            context: None,
        }
    }
}

/// The `strerror(3)` text for an errno, borrowed from libc's static table.
pub(crate) fn strerror(errno: c_int) -> &'static str {
    let error_msg = unsafe { libc::strerror(errno) };
    if error_msg.is_null() {
        return "unknown error";
    }
    let error_msg_len = unsafe { libc::strlen(error_msg) };
    let bytes = unsafe { std::slice::from_raw_parts(error_msg as *const u8, error_msg_len) };
    std::str::from_utf8(bytes).unwrap_or("unknown error")
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let error_msg_str = strerror(self.errno);

        match (self.context, self.cause) {
            (Some(context), None) => {
                write!(f, "{}: {} (errno {})", context, error_msg_str, self.errno)
            }
            (None, Some(cause)) => write!(f, "{}: {} (errno {})", cause, error_msg_str, self.errno),
            (Some(context), Some(cause)) => write!(
                f,
                "{}: {}: {} (errno {})",
                context, cause, error_msg_str, self.errno
            ),
            (None, None) => write!(f, "{} (errno {})", error_msg_str, self.errno),
        }
    }
}

impl std::error::Error for Error {}

/// Errors surfaced to the caller of a spawn.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The clone itself failed; no child exists.
    #[error("failed to spawn child: {0}")]
    Spawn(Error),

    /// The child reported a failed action through the error channel, and has exited.
    #[error("child action `{}` failed: {}", .0.label, .0.message)]
    Action(ErrorReport),

    /// The error channel could not be created, read, or decoded.
    #[error("error channel failure: {0}")]
    Channel(Error),

    /// A string passed to the builder cannot be handed to the kernel.
    #[error("{0} contains an interior NUL byte")]
    Nul(&'static str),
}

// Define a macro, bail!, which returns an error with no errno and a custom message.
macro_rules! bail {
    ($msg:expr) => {
        return Err(Error {
            errno: 0,
            cause: Some($msg),
            context: None,
        })
    };
}
pub(crate) use bail;

// Define a macro, bail_errno!, which returns an error with the last OS error:
//
// - `bail_errno!()` returns an error with the last OS error.
// - `bail_errno!(msg)` returns an error with the last OS error and a context message.
macro_rules! bail_errno {
    () => {
        return Err(Error::last_os_error());
    };
    ($msg:expr) => {
        return Err(Error::last_os_error().cause($msg));
    };
}
pub(crate) use bail_errno;
