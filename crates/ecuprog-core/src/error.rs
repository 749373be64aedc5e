//! Programming engine errors

use serde::Serialize;
use thiserror::Error;

use crate::layout::LayoutError;
use crate::security::SecurityError;
use crate::session::SessionState;
use crate::transport::TransportError;

/// Result type for engine operations
pub type ProgramResult<T> = Result<T, ProgramError>;

/// Coarse classification of a [`ProgramError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Security,
    Compatibility,
    Validation,
    Io,
    Verification,
    Protocol,
    InvalidState,
    Aborted,
}

/// Errors surfaced to the caller of a programming operation
///
/// Validation and compatibility failures are raised before any mutating
/// command reaches the ECU. Only block-level I/O failures are retried; every
/// other category ends the session.
#[derive(Debug, Error)]
pub enum ProgramError {
    /// No response within the exchange or operation deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Authentication or seed/key failure
    #[error("Security access failed: {0}")]
    Security(String),

    /// ECU protocol set or memory layout cannot be driven
    #[error("Incompatible ECU: {0}")]
    Compatibility(String),

    /// Image rejected before any write (size or checksum)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Transport-level failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Readback after programming does not match the source image
    #[error("Verification failed at 0x{address:08X}: {message}")]
    Verification { address: u32, message: String },

    /// Unexpected status or malformed response from the ECU
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation called in a state that does not allow it
    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// Caller requested an abort between blocks
    #[error("Operation aborted by caller")]
    Aborted,
}

impl ProgramError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProgramError::Timeout(_) => ErrorKind::Timeout,
            ProgramError::Security(_) => ErrorKind::Security,
            ProgramError::Compatibility(_) => ErrorKind::Compatibility,
            ProgramError::Validation(_) => ErrorKind::Validation,
            ProgramError::Io(_) => ErrorKind::Io,
            ProgramError::Verification { .. } => ErrorKind::Verification,
            ProgramError::Protocol(_) => ErrorKind::Protocol,
            ProgramError::InvalidState { .. } => ErrorKind::InvalidState,
            ProgramError::Aborted => ErrorKind::Aborted,
        }
    }

    /// Whether the engine may retry the failed step
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProgramError::Io(_))
    }
}

impl From<TransportError> for ProgramError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => ProgramError::Timeout(msg),
            other => ProgramError::Io(other.to_string()),
        }
    }
}

impl From<LayoutError> for ProgramError {
    fn from(err: LayoutError) -> Self {
        match err {
            LayoutError::Truncated { .. } => ProgramError::Protocol(err.to_string()),
            other => ProgramError::Compatibility(other.to_string()),
        }
    }
}

impl From<SecurityError> for ProgramError {
    fn from(err: SecurityError) -> Self {
        ProgramError::Security(err.to_string())
    }
}
