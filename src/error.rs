use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Unified error type for the WebAssembly backend.
///
/// Every fatal condition the emitter can hit is a programmer error in an
/// upstream pass, so the taxonomy stays small: `Codegen` for malformed or
/// unsupported input shapes, `Internal` for broken emitter invariants.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Codegen {
        message: String,
        backtrace: Option<Backtrace>,
    },
    Internal {
        message: String,
        backtrace: Option<Backtrace>,
    },
}

/// Convenience result alias used across the backend.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Construct a new code generation error.
    pub fn codegen(message: impl Into<String>) -> Self {
        Self::Codegen {
            message: message.into(),
            backtrace: capture_backtrace(),
        }
    }

    /// Construct a new internal emitter error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: capture_backtrace(),
        }
    }

    /// Return the captured backtrace, if any.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            Error::Codegen { backtrace, .. } | Error::Internal { backtrace, .. } => {
                backtrace.as_ref()
            }
            Error::Io(_) => None,
        }
    }
}

fn capture_backtrace() -> Option<Backtrace> {
    if cfg!(debug_assertions) {
        Some(Backtrace::force_capture())
    } else {
        None
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Codegen { message, .. } => write!(f, "codegen error: {message}"),
            Error::Internal { message, .. } => write!(f, "internal error: {message}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Codegen { .. } | Error::Internal { .. } => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::internal(message)
    }
}
