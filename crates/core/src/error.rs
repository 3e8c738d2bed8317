//! Error types shared by every moonlink crate
//!
//! Errors fall into three families:
//!
//! - **Usage** errors (`InvalidArgument`, `InvalidOperation`, `Disposed`) are
//!   precondition violations detected before the interpreter is touched.
//! - **Marshaling** errors (`InvalidCast`, `StackOverflow`, `Encoding`) come
//!   from converting between values and interpreter stack slots. Capacity
//!   is always checked before the stack is mutated.
//! - **Foreign** errors (`Load`, `Runtime`) carry the message the interpreter
//!   produced. The message is copied off the interpreter stack before it is
//!   unwound, so it is never lost to a later pop.

/// Error type for every moonlink operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required argument was missing or malformed
    InvalidArgument(String),
    /// The object is in the wrong state for the requested operation
    InvalidOperation(String),
    /// The named object (environment, table, ...) was already disposed
    Disposed(&'static str),
    /// A strict conversion found a different variant than requested
    InvalidCast {
        expected: &'static str,
        actual: &'static str,
    },
    /// The interpreter stack could not grow by `requested` slots
    StackOverflow { requested: usize },
    /// Text crossing the boundary was not valid UTF-8
    Encoding(String),
    /// A chunk failed to compile
    Load(String),
    /// A protected call or resume reported an error
    Runtime(String),
    /// Configuration could not be parsed
    Config(String),
}

impl Error {
    /// Precondition violations that are safe to retry with corrected input
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::InvalidOperation(_) | Error::Disposed(_)
        )
    }

    /// Failures converting values to or from the interpreter stack
    pub fn is_marshaling(&self) -> bool {
        matches!(
            self,
            Error::InvalidCast { .. } | Error::StackOverflow { .. } | Error::Encoding(_)
        )
    }

    /// Errors raised by the interpreter itself
    pub fn is_foreign(&self) -> bool {
        matches!(self, Error::Load(_) | Error::Runtime(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            Error::Disposed(what) => write!(f, "cannot access a disposed {}", what),
            Error::InvalidCast { expected, actual } => {
                write!(f, "invalid cast: expected {}, found {}", expected, actual)
            }
            Error::StackOverflow { requested } => write!(
                f,
                "interpreter stack cannot grow by {} slots",
                requested
            ),
            Error::Encoding(msg) => write!(f, "encoding error: {}", msg),
            Error::Load(msg) => write!(f, "load error: {}", msg),
            Error::Runtime(msg) => write!(f, "runtime error: {}", msg),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

/// Result alias used throughout moonlink
pub type Result<T> = std::result::Result<T, Error>;

/// Format a panic payload into an error message
///
/// Used where a panic is caught at an interpreter callback boundary and can
/// only be reported, not propagated.
pub fn format_panic_payload(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
