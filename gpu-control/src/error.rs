//! Centralized error types and recovery strategies for gpu-control.
//!
//! Every failure mode of the clock arbiter and the submission core has a
//! defined recovery action:
//!
//! | Error                 | Recovery                                      |
//! |-----------------------|-----------------------------------------------|
//! | OutOfMemory           | Fatal to the call, never retried              |
//! | InvalidRange          | Keep the stale VF table, raise sticky alarm   |
//! | EmptyFrequencyTable   | Keep the stale VF table, raise sticky alarm   |
//! | WouldBlock            | Caller retries (ring or job ring full)        |
//! | InvalidArgument       | Caller fixes arguments                        |
//! | ResourceExhausted     | Caller retries later or releases resources    |
//! | Unserviceable         | Channel is dead, drop it                      |
//! | Aborted               | Channel is dead, drop it                      |
//! | NoDevice              | Fatal: device is going away                   |
//! | Timeout               | Caller retries                                |
//! | Backend               | Fatal to the call                             |
//! | Config                | Fix configuration file                        |

use crate::clk_arb::types::ClockDomain;

/// Central error type for all gpu-control operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuControlError {
    /// Allocation failed, or a request can never fit the allocated resource.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Clock range query failed or returned an unusable range.
    #[error("invalid clock range for {domain:?}: {reason}")]
    InvalidRange { domain: ClockDomain, reason: String },

    /// The backend reported no frequency points for the primary domain.
    #[error("empty frequency table for {0:?}")]
    EmptyFrequencyTable(ClockDomain),

    /// Transient shortage; no state was mutated.
    #[error("resource temporarily unavailable: {0}")]
    WouldBlock(String),

    /// Policy or flag violation by the caller; no state was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A finite pool (syncpoints, sessions, handles) is used up.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Channel has faulted and refuses further work.
    #[error("channel {chid} is unserviceable")]
    Unserviceable { chid: u32 },

    /// Channel was aborted while work was pending.
    #[error("channel {chid} aborted")]
    Aborted { chid: u32 },

    /// Device is shutting down or not present.
    #[error("no device: {0}")]
    NoDevice(String),

    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An external collaborator (clock, power, sync backend) failed.
    #[error("backend failure: {0}")]
    Backend(String),

    /// Configuration could not be read or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for Results using GpuControlError.
pub type Result<T> = std::result::Result<T, GpuControlError>;

// ============================================================================
// Recovery actions
// ============================================================================

/// Describes how the caller should recover from a given error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Fatal error, the operation cannot be completed.
    Fatal,
    /// Try the same call again later.
    Retry,
    /// The caller passed something invalid; retrying unchanged will fail again.
    FixArguments,
    /// The previously published table stays authoritative.
    KeepStale,
    /// The channel is dead; close it.
    DropChannel,
}

impl GpuControlError {
    /// Determine the appropriate recovery action for this error.
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            GpuControlError::OutOfMemory(_) => RecoveryAction::Fatal,
            GpuControlError::InvalidRange { .. } => RecoveryAction::KeepStale,
            GpuControlError::EmptyFrequencyTable(_) => RecoveryAction::KeepStale,
            GpuControlError::WouldBlock(_) => RecoveryAction::Retry,
            GpuControlError::InvalidArgument(_) => RecoveryAction::FixArguments,
            GpuControlError::ResourceExhausted(_) => RecoveryAction::Retry,
            GpuControlError::Unserviceable { .. } => RecoveryAction::DropChannel,
            GpuControlError::Aborted { .. } => RecoveryAction::DropChannel,
            GpuControlError::NoDevice(_) => RecoveryAction::Fatal,
            GpuControlError::Timeout(_) => RecoveryAction::Retry,
            GpuControlError::Backend(_) => RecoveryAction::Fatal,
            GpuControlError::Config(_) => RecoveryAction::FixArguments,
        }
    }

    /// Whether the caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.recovery_action(), RecoveryAction::Retry)
    }

    /// Whether this error is fatal (no recovery possible).
    pub fn is_fatal(&self) -> bool {
        matches!(self.recovery_action(), RecoveryAction::Fatal)
    }

    /// Whether the channel that produced this error should be torn down.
    pub fn is_channel_dead(&self) -> bool {
        matches!(self.recovery_action(), RecoveryAction::DropChannel)
    }

    /// Errno-style code, as the ioctl layer reports it.
    pub fn errno(&self) -> i32 {
        match self {
            GpuControlError::OutOfMemory(_) => -12,
            GpuControlError::InvalidRange { .. } => -22,
            GpuControlError::EmptyFrequencyTable(_) => -22,
            GpuControlError::WouldBlock(_) => -11,
            GpuControlError::InvalidArgument(_) => -22,
            GpuControlError::ResourceExhausted(_) => -28,
            GpuControlError::Unserviceable { .. } => -110,
            GpuControlError::Aborted { .. } => -5,
            GpuControlError::NoDevice(_) => -19,
            GpuControlError::Timeout(_) => -110,
            GpuControlError::Backend(_) => -5,
            GpuControlError::Config(_) => -22,
        }
    }
}

// ============================================================================
// From impls for common error sources
// ============================================================================

impl From<std::io::Error> for GpuControlError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::OutOfMemory => GpuControlError::OutOfMemory(err.to_string()),
            _ => GpuControlError::Config(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for GpuControlError {
    fn from(err: serde_json::Error) -> Self {
        GpuControlError::Config(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for GpuControlError {
    fn from(err: std::collections::TryReserveError) -> Self {
        GpuControlError::OutOfMemory(err.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
