use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the embedding API itself. Script-level outcomes are reported
/// through [`crate::ExecutionResult`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad configuration or snapshot; the isolate was never created.
    EngineInit(String),
    /// Disposal refused because executions are still queued or running.
    Busy { active: usize },
    /// The isolate or context has been disposed.
    Disposed,
    /// The isolate hit its heap ceiling or an internal fault and must be replaced.
    Unusable(String),
    InvalidHandle(String),
    InvalidArgument(String),
    /// A blocking call into an isolate was made from that isolate's own engine thread.
    WouldDeadlock,
    Platform(String),
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EngineInit(msg) => write!(f, "engine initialisation failed: {}", msg),
            Self::Busy { active } => {
                write!(f, "isolate is busy with {} in-flight execution(s)", active)
            }
            Self::Disposed => f.write_str("handle has been disposed"),
            Self::Unusable(reason) => write!(f, "isolate is unusable: {}", reason),
            Self::InvalidHandle(msg) => write!(f, "invalid handle: {}", msg),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::WouldDeadlock => {
                f.write_str("blocking call into an isolate from its own engine thread")
            }
            Self::Platform(msg) => write!(f, "engine platform: {}", msg),
            Self::Io(msg) => write!(f, "io: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
