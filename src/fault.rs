//! Fault values handed to the recovery engine.
//!
//! A `Fault` is the engine's view of a failed operation: a closed `ErrorKind`
//! tag, the raw message, and an optional structured payload. Classification
//! works on this data directly rather than on the concrete error type that
//! produced it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kind of fault, the closed set of error shapes the classifier understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Generic connection failure.
    ConnectionError,
    /// Connection actively refused by the peer.
    ConnectionRefused,
    /// Connection reset or aborted mid-flight.
    ConnectionReset,
    /// Operation or request timed out.
    Timeout,
    /// Caller lacks permission for the operation.
    PermissionDenied,
    /// Process or host ran out of memory.
    OutOfMemory,
    /// A file or directory does not exist.
    FileNotFound,
    /// Generic operating-system error.
    OsError,
    /// A module could not be located.
    ModuleNotFound,
    /// A module was found but failed to import or load.
    ImportError,
    /// A value had the right type but an invalid content.
    ValueError,
    /// A value had the wrong type.
    TypeError,
    /// An attribute or field was missing.
    AttributeError,
    /// A lookup key was missing.
    KeyError,
    /// Generic runtime failure.
    RuntimeError,
    /// Anything else, carrying the originating type name.
    Unknown(String),
}

impl ErrorKind {
    /// Name of the kind, used in error codes and signatures.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::ConnectionRefused => "ConnectionRefused",
            ErrorKind::ConnectionReset => "ConnectionReset",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::OsError => "OsError",
            ErrorKind::ModuleNotFound => "ModuleNotFound",
            ErrorKind::ImportError => "ImportError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::AttributeError => "AttributeError",
            ErrorKind::KeyError => "KeyError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Unknown(name) => name,
        }
    }

    /// Parse a kind from its name. Unrecognized names become `Unknown`.
    pub fn parse(name: &str) -> Self {
        match name {
            "ConnectionError" => ErrorKind::ConnectionError,
            "ConnectionRefused" | "ConnectionRefusedError" => ErrorKind::ConnectionRefused,
            "ConnectionReset" | "ConnectionResetError" => ErrorKind::ConnectionReset,
            "Timeout" | "TimeoutError" => ErrorKind::Timeout,
            "PermissionDenied" | "PermissionError" => ErrorKind::PermissionDenied,
            "OutOfMemory" | "MemoryError" => ErrorKind::OutOfMemory,
            "FileNotFound" | "FileNotFoundError" => ErrorKind::FileNotFound,
            "OsError" | "OSError" | "IoError" => ErrorKind::OsError,
            "ModuleNotFound" | "ModuleNotFoundError" => ErrorKind::ModuleNotFound,
            "ImportError" => ErrorKind::ImportError,
            "ValueError" => ErrorKind::ValueError,
            "TypeError" => ErrorKind::TypeError,
            "AttributeError" => ErrorKind::AttributeError,
            "KeyError" => ErrorKind::KeyError,
            "RuntimeError" => ErrorKind::RuntimeError,
            other => ErrorKind::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as Io;
        match kind {
            Io::ConnectionRefused => ErrorKind::ConnectionRefused,
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe => {
                ErrorKind::ConnectionReset
            }
            Io::NotConnected | Io::AddrNotAvailable => ErrorKind::ConnectionError,
            Io::TimedOut => ErrorKind::Timeout,
            Io::PermissionDenied => ErrorKind::PermissionDenied,
            Io::NotFound => ErrorKind::FileNotFound,
            Io::OutOfMemory => ErrorKind::OutOfMemory,
            Io::InvalidInput | Io::InvalidData => ErrorKind::ValueError,
            _ => ErrorKind::OsError,
        }
    }
}

/// Structured data attached to a fault beyond its message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPayload {
    /// HTTP status code, when the fault came from an HTTP exchange.
    pub http_status: Option<u16>,
    /// Subsystem tag of the component that raised the fault (e.g. "mcp").
    pub subsystem: Option<String>,
    /// Source file or module the fault points at, if known.
    pub file_context: Option<String>,
}

/// A failed operation as seen by the recovery engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    kind: ErrorKind,
    message: String,
    payload: FaultPayload,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Fault {
    /// Create a fault of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: FaultPayload::default(),
            source: None,
        }
    }

    /// Create an `Unknown` fault carrying the originating type name.
    pub fn unknown(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown(type_name.into()), message)
    }

    /// Wrap any error, keeping it as the source.
    pub fn from_error<E>(kind: ErrorKind, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: error.to_string(),
            payload: FaultPayload::default(),
            source: Some(Arc::new(error)),
        }
    }

    /// Attach an HTTP status code.
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.payload.http_status = Some(status);
        self
    }

    /// Attach a subsystem tag.
    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.payload.subsystem = Some(subsystem.into());
        self
    }

    /// Attach the file or module the fault refers to.
    pub fn with_file_context(mut self, file: impl Into<String>) -> Self {
        self.payload.file_context = Some(file.into());
        self
    }

    /// The fault kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The raw message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The structured payload.
    pub fn payload(&self) -> &FaultPayload {
        &self.payload
    }
}

impl From<std::io::Error> for Fault {
    fn from(error: std::io::Error) -> Self {
        let kind = ErrorKind::from(error.kind());
        Fault::from_error(kind, error)
    }
}
