use std::fmt::{Display, Formatter};

use crate::config::{Asn, StreamId};

/// Why an operation was suspended instead of completing immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendKind {
    /// Waiting for the process-wide buffer allocator.
    Allocation,
    /// Waiting for the per-stream dedicated write throttle.
    Throttle,
    /// Waiting out a transient shared-log-full condition.
    LogFull,
    /// Waiting for a coalesced flush to land.
    Flush,
}

impl Display for SuspendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SuspendKind::Allocation => write!(f, "allocation"),
            SuspendKind::Throttle => write!(f, "throttle"),
            SuspendKind::LogFull => write!(f, "log-full"),
            SuspendKind::Flush => write!(f, "flush"),
        }
    }
}

/// A specialized error type for overlay operations.
///
/// Errors are `Clone` so a single flush outcome can be fanned out to every
/// write that was coalesced into the failed block.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverlayError {
    /// No record satisfies the read request.
    #[error("no record satisfies the request")]
    NotFound,
    /// Shared and dedicated content cannot be reconciled.
    #[error("structure fault in stream {stream}: {detail}")]
    StructureFault { stream: StreamId, detail: String },
    /// The shared log is temporarily out of space.
    #[error("shared log full")]
    LogFull,
    /// A dedicated write failed terminally; the stream accepts no more writes.
    #[error("dedicated write failed permanently for stream {stream} at asn {asn}")]
    PermanentWriteFailure { stream: StreamId, asn: Asn },
    /// A caller supplied argument is out of range or inconsistent.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The stream or container is shutting down.
    #[error("operation cancelled: closing")]
    Closing,
    /// The caller's wait expired; the underlying operation may still complete.
    #[error("timed out waiting for {0}")]
    Timeout(SuspendKind),
    /// A record failed its integrity check.
    #[error("corrupted record: {0}")]
    Corrupted(String),
    /// The container could not be opened.
    #[error("container corrupted: {0}")]
    ContainerCorrupted(String),
    /// A stream or alias with this identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Failure reported by the physical log collaborator.
    #[error("physical log error (transient: {transient}): {message}")]
    Physical { message: String, transient: bool },
}

impl OverlayError {
    pub fn invalid_parameter<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidParameter(msg.to_string())
    }

    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    pub fn corrupted<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corrupted(msg.to_string())
    }

    pub fn structure_fault<T>(stream: StreamId, detail: T) -> Self
    where
        T: Display,
    {
        Self::StructureFault {
            stream,
            detail: detail.to_string(),
        }
    }

    /// A collaborator failure worth retrying.
    pub fn transient<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Physical {
            message: msg.to_string(),
            transient: true,
        }
    }

    /// A collaborator failure that will not go away on retry.
    pub fn permanent<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Physical {
            message: msg.to_string(),
            transient: false,
        }
    }

    /// Whether a retry of the same physical operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OverlayError::LogFull | OverlayError::Physical { transient: true, .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OverlayError::NotFound)
    }
}

/// A Result type alias for overlay operations.
pub type OverlayResult<T> = Result<T, OverlayError>;
