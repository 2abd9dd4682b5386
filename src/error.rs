//! Error types shared across the binding.
//!
//! Every native entry point returns an integer status where non-zero means
//! failure and the failure text sits in a thread-local buffer reachable
//! through `MXGetLastError`. [`check`] turns that protocol into a `Result`.
//! Validation failures detected before a native call gets issued use the
//! more specific variants so the message can name the offending argument
//! instead of whatever the native side would have printed.

use std::ffi::CStr;

use libc::c_int;
use thiserror::Error;

use crate::api::MxApi;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The shared library was not found on any candidate path.
    #[error("Unable to find MXNet shared library. The list of candidates:\n{}", candidates.join("\n"))]
    LibraryNotFound { candidates: Vec<String> },

    /// A candidate path existed but the dynamic loader rejected it.
    #[error("Unable to load MXNet shared library from {path}: {reason}")]
    LibraryLoadFailed { path: String, reason: String },

    /// A required native entry point is absent. Fatal at initialization;
    /// a partially-capable table is never constructed.
    #[error("Unable to find the required symbol in libmxnet: {0}")]
    MissingSymbol(&'static str),

    /// A second attempt to install the process-wide API table.
    #[error("the MXNet API table is already initialized")]
    AlreadyInitialized,

    /// Non-zero status from a native call. The message is the native
    /// library's own last-error text, verbatim.
    #[error("{0}")]
    NativeCallFailed(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    ArgumentMismatch(String),

    #[error("Shape not match! Argument {name}, need: {expected:?}, received: {received:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        received: Vec<usize>,
    },

    /// A count would be narrowed past the native integer width.
    #[error("{what} is too large for the native call: {count} exceeds {limit}")]
    ArgumentTooLarge {
        what: &'static str,
        count: usize,
        limit: u64,
    },

    #[error("missing required argument: {0}")]
    ArgumentMissing(&'static str),

    #[error("{0}")]
    TypeError(String),

    /// A native-side string (name, attribute, JSON blob) was not UTF-8.
    #[error("native string is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Converts a native status code into a `Result`, capturing the native
/// last-error text on failure.
pub(crate) fn check(api: &MxApi, status: c_int) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::NativeCallFailed(last_error(api)))
    }
}

/// Copies the native library's thread-local last-error string.
pub(crate) fn last_error(api: &MxApi) -> String {
    let ptr = unsafe { (api.mx_get_last_error)() };
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
