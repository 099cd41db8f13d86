//! Error types for the blockprobe crate

use nix::errno::Errno;
use thiserror::Error;

/// Result type alias for probe operations
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Probe errors
///
/// `InvalidArgument` is the fixable class: the driver answers it by
/// randomising the initial registers and retrying. Everything else ends
/// the run.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("block not runnable: {reason}")]
    InvalidArgument { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },

    #[error("{context}: {source}")]
    Os {
        context: &'static str,
        #[source]
        source: Errno,
    },
}

impl ProbeError {
    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn os(context: &'static str, source: Errno) -> Self {
        Self::Os { context, source }
    }

    /// Whether retrying with different initial registers may clear this error
    pub fn is_fixable(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::ProbeError;

    #[test]
    fn test_only_invalid_argument_is_fixable() {
        assert!(ProbeError::invalid_argument("floating point exception").is_fixable());
        assert!(!ProbeError::internal("short read").is_fixable());
        assert!(!ProbeError::os("fork", nix::errno::Errno::EAGAIN).is_fixable());
    }

    #[test]
    fn test_os_error_keeps_errno() {
        let err = ProbeError::os("failed to fork", nix::errno::Errno::ENOMEM);
        let message = err.to_string();
        assert!(message.contains("failed to fork"), "got: {message}");
    }
}
