//! Typed error taxonomy for the box lifecycle subsystem.
//!
//! Everything a caller needs to branch on (retry? surface 409? surface 503?)
//! lives in [`IsolateError`]. Contextual, one-off failures elsewhere in the
//! crate (tests, the reference binary) just propagate with `anyhow`.

use crate::BoxId;
use thiserror::Error;

/// Errors raised by the box registry, acquisition scope, and isolator session.
#[derive(Debug, Error)]
pub enum IsolateError {
    /// The per-box mutex could not be acquired within the caller's timeout.
    /// No lock is held when this is returned.
    #[error("box {box_id} is busy")]
    BoxBusy { box_id: BoxId },

    /// Init failed even after the one retry `acquisition` grants it.
    #[error("box {box_id} is unavailable: {reason}")]
    BoxUnavailable { box_id: BoxId, reason: String },

    /// The isolator exited with a code >= 2, or its stdout/stderr could not
    /// be read back after a run.
    #[error("isolator internal error running `{command}`: {stderr}")]
    IsolatorInternal {
        command: String,
        stdout: String,
        stderr: String,
    },

    /// Terminal cleanup failed. Swallowed (logged) in explicit mode; raised
    /// here only by auto-allocation mode, which retains the legacy behavior.
    #[error("cleanup of box {box_id} failed: {reason}")]
    CleanupFailure { box_id: BoxId, reason: String },

    /// The isolator's own config file (box_root / num_boxes) is missing or
    /// malformed.
    #[error("isolator configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What an HTTP façade (out of scope here) would map an [`IsolateError`] to.
/// This is the seam the spec calls out in §6 — we expose it, we don't build
/// the server around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    Conflict,
    ServiceUnavailable,
    InternalServerError,
}

impl IsolateError {
    pub fn status_hint(&self) -> StatusHint {
        match self {
            IsolateError::BoxBusy { .. } => StatusHint::Conflict,
            IsolateError::BoxUnavailable { .. } => StatusHint::ServiceUnavailable,
            IsolateError::IsolatorInternal { .. } => StatusHint::InternalServerError,
            IsolateError::CleanupFailure { .. } => StatusHint::InternalServerError,
            IsolateError::Config(_) => StatusHint::InternalServerError,
            IsolateError::Io(_) => StatusHint::InternalServerError,
        }
    }

    /// The short machine-readable code the HTTP façade would put in its
    /// error payload (`error_code` field in the source system).
    pub fn error_code(&self) -> &'static str {
        match self {
            IsolateError::BoxBusy { .. } => "BOX_BUSY",
            IsolateError::BoxUnavailable { .. } => "BOX_UNAVAILABLE",
            IsolateError::IsolatorInternal { .. } => "ISOLATOR_INTERNAL",
            IsolateError::CleanupFailure { .. } => "CLEANUP_FAILURE",
            IsolateError::Config(_) => "CONFIG_ERROR",
            IsolateError::Io(_) => "IO_ERROR",
        }
    }
}
