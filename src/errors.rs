//! Error taxonomy for tasks, the pump and connections

use pxengine_runtime::ArenaError;
use std::fmt;
use std::io;

/// Every failure the engine reports.
#[derive(Debug, Clone, PartialEq)]
pub enum PxError {
    /// An arena could not grow, or memory load is above the hard limit.
    AllocationFailure(String),
    /// A callback returned something unusable or broke a precondition.
    ProtocolViolation(String),
    /// Peer reset or abort; the connection is recycled.
    TransientIo {
        op: &'static str,
        kind: io::ErrorKind,
        message: String,
    },
    /// Unrecoverable I/O failure; the connection's task ends.
    FatalIo {
        op: &'static str,
        kind: io::ErrorKind,
        message: String,
    },
    /// A blocking wait gave up.
    WaitTimeout,
    /// The other side of a blocking wait went away.
    WaitAbandoned,
    /// Error raised by user code.
    Callback(String),
    /// An I/O completion reported a byte count other than the one requested.
    CompletionLength {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    /// `run_once` with nothing submitted, active or persisted.
    RunWithoutEvents,
    /// Invalid configuration.
    Config(String),
    /// The runtime is shutting down.
    Shutdown,
}

impl PxError {
    /// Error raised by user code.
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback(message.into())
    }

    pub fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Classify an OS error raised by `op`.
    pub fn io(op: &'static str, err: io::Error) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        if is_transient_kind(kind) {
            Self::TransientIo { op, kind, message }
        } else {
            Self::FatalIo { op, kind, message }
        }
    }

    /// Peer resets and aborts; recovered by recycling the connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    /// Errors that indicate a bug rather than an environmental failure.
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::CompletionLength { .. } | Self::ProtocolViolation(_))
    }
}

fn is_transient_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl fmt::Display for PxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure(msg) => write!(f, "Allocation failure: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::TransientIo { op, message, .. } => {
                write!(f, "Transient I/O error in {}: {}", op, message)
            }
            Self::FatalIo { op, message, .. } => {
                write!(f, "Fatal I/O error in {}: {}", op, message)
            }
            Self::WaitTimeout => write!(f, "Wait timed out"),
            Self::WaitAbandoned => write!(f, "Wait abandoned"),
            Self::Callback(msg) => write!(f, "Callback error: {}", msg),
            Self::CompletionLength { op, expected, actual } => {
                write!(
                    f,
                    "{} completed with {} bytes, expected {}",
                    op, actual, expected
                )
            }
            Self::RunWithoutEvents => write!(f, "run called without any events"),
            Self::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Shutdown => write!(f, "Runtime is shutting down"),
        }
    }
}

impl std::error::Error for PxError {}

impl From<ArenaError> for PxError {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::OutOfMemory { .. }
            | ArenaError::SnapshotsExhausted
            | ArenaError::InvalidLayout { .. } => Self::AllocationFailure(err.to_string()),
            ArenaError::SnapshotNotNewest { .. }
            | ArenaError::UnknownSnapshot { .. }
            | ArenaError::StaleBlock { .. }
            | ArenaError::ForeignBlock
            | ArenaError::Busy => Self::ProtocolViolation(err.to_string()),
        }
    }
}

impl From<io::Error> for PxError {
    fn from(err: io::Error) -> Self {
        Self::io("io", err)
    }
}

impl From<toml::de::Error> for PxError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PxError>;
