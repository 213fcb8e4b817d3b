//! Error taxonomy shared by every engine component.
//!
//! Each variant maps to exactly one result code of the external command
//! surface, so callers can tell fatal session errors apart from local,
//! retryable ones.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, DebugError>;

/// Engine-wide error classes
#[derive(Error, Debug)]
pub enum DebugError {
    /// Attach target is missing or already exited. Fatal to the session.
    #[error("target unreachable (pid {pid}): {reason}")]
    TargetUnreachable { pid: u32, reason: String },

    /// The operating system refused the operation. Fatal to that operation only.
    #[error("permission denied during {operation}")]
    PermissionDenied { operation: &'static str },

    /// Memory operation outside any mapped region.
    #[error("invalid address {address:#x}")]
    InvalidAddress { address: u64 },

    /// Operation is not valid for the current execution state.
    #[error("state violation: {operation} while {state}")]
    StateViolation {
        operation: &'static str,
        state: String,
    },

    /// No free hardware debug-register slot.
    #[error("resource exhausted: no free {resource}")]
    ResourceExhausted { resource: &'static str },

    /// An enabled trap already occupies this (address, kind) pair.
    #[error("a {kind} trap is already set at {address:#x}")]
    DuplicateTrap { address: u64, kind: String },

    /// No breakpoint, watchpoint, or hook with this id.
    #[error("unknown id {id}")]
    UnknownId { id: u32 },

    /// Trace or exploration budget exceeded where a complete result was required.
    #[error("analysis budget exceeded during {operation}")]
    AnalysisTimeout { operation: &'static str },

    /// Crash artifact is missing required fields or malformed.
    #[error("corrupt crash artifact: {reason}")]
    CorruptArtifact { reason: String },

    /// Raw backend failure, propagated verbatim.
    #[error("target backend failed during {operation}: {reason}")]
    Backend {
        operation: &'static str,
        reason: String,
    },
}

impl DebugError {
    /// Result code for the external command surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            DebugError::TargetUnreachable { .. } => 1,
            DebugError::Backend { .. } => 1,
            DebugError::PermissionDenied { .. } => 2,
            DebugError::InvalidAddress { .. } => 3,
            DebugError::UnknownId { .. } => 3,
            DebugError::StateViolation { .. } => 4,
            DebugError::DuplicateTrap { .. } => 4,
            DebugError::ResourceExhausted { .. } => 5,
            DebugError::CorruptArtifact { .. } => 6,
            DebugError::AnalysisTimeout { .. } => 7,
        }
    }

    /// True when the error forces the owning session into `Terminated`.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, DebugError::TargetUnreachable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_command_surface() {
        assert_eq!(
            DebugError::TargetUnreachable {
                pid: 1,
                reason: "gone".into()
            }
            .exit_code(),
            1
        );
        assert_eq!(
            DebugError::PermissionDenied { operation: "attach" }.exit_code(),
            2
        );
        assert_eq!(DebugError::InvalidAddress { address: 0 }.exit_code(), 3);
        assert_eq!(
            DebugError::StateViolation {
                operation: "continue",
                state: "Running".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            DebugError::ResourceExhausted {
                resource: "debug-register slots"
            }
            .exit_code(),
            5
        );
        assert_eq!(
            DebugError::CorruptArtifact {
                reason: "truncated".into()
            }
            .exit_code(),
            6
        );
        assert_eq!(
            DebugError::AnalysisTimeout { operation: "trace" }.exit_code(),
            7
        );
    }
}
