//! Bridge error taxonomy.
//!
//! Every guest call is wrapped at the boundary: abort signals are translated
//! into [`VmError::Aborted`] with decoded diagnostics, everything else passes
//! through unchanged as [`VmError::Engine`]. This layer performs no retries.

use crate::codec::CodecError;
use crate::engine::EngineError;
use rampart_core::GuestPtr;

/// Bridge result type
pub type VmResult<T> = Result<T, VmError>;

/// Errors produced by the contract bridge
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// The guest explicitly aborted execution. The owning handle is disposed
    /// as a side effect before this error is returned.
    #[error("Execution aborted: {message} at {file_name}:{line}:{column}")]
    Aborted {
        /// Decoded abort message
        message: String,
        /// Decoded guest source file
        file_name: String,
        /// Guest source line
        line: u32,
        /// Guest source column
        column: u32,
    },

    /// A second operation entered an instance whose prior call is still in
    /// flight, or the instance lock was contended during disposal.
    #[error("reentrancy detected: {context}")]
    Reentrancy {
        /// Where the contention was observed
        context: String,
    },

    /// `release` was called on a pointer that was never retained. This is a
    /// retain/release imbalance in the caller, never recoverable by retrying.
    #[error("released untracked pointer {pointer}")]
    Refcount {
        /// The untracked pointer
        pointer: GuestPtr,
    },

    /// Operation other than `dispose` on a disposed handle
    #[error("contract instance disposed")]
    Disposed,

    /// Any other guest-originated failure, passed through unchanged
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<CodecError> for VmError {
    fn from(err: CodecError) -> Self {
        Self::Engine(EngineError::Runtime(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborted_display() {
        let err = VmError::Aborted {
            message: "index out of range".to_string(),
            file_name: "contract.ts".to_string(),
            line: 12,
            column: 7,
        };
        assert_eq!(
            err.to_string(),
            "Execution aborted: index out of range at contract.ts:12:7"
        );
    }

    #[test]
    fn test_refcount_display() {
        let err = VmError::Refcount {
            pointer: GuestPtr::from_raw(0xBEEF),
        };
        assert!(err.to_string().contains("0xBEEF"));
    }

    #[test]
    fn test_engine_passthrough_display() {
        let err = VmError::Engine(EngineError::OutOfGas);
        assert_eq!(err.to_string(), "out of gas");
    }
}
