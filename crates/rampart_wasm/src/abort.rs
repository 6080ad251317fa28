//! Guest abort translation.
//!
//! An abort is the guest explicitly ending execution through its abort
//! handler, as opposed to any other trap. The engine signals it with a
//! structured [`EngineError::AbortSignal`](crate::engine::EngineError) kind;
//! the handle then fetches the pending [`AbortRecord`], lifts its two string
//! pointers, and builds the structured error here. Guest state after an
//! uncaught abort is not assumed safely reusable, so the owning handle is
//! disposed immediately after translation.

use crate::engine::AbortRecord;
use crate::error::VmError;

/// Fallback file name when the guest abort carried a null file pointer
pub const UNKNOWN_FILE: &str = "<unknown>";

/// Build the structured abort error from a record and its lifted strings.
///
/// Null string pointers lift to `None`; the message falls back to empty and
/// the file name to [`UNKNOWN_FILE`].
#[must_use]
pub fn aborted(message: Option<String>, file_name: Option<String>, record: &AbortRecord) -> VmError {
    VmError::Aborted {
        message: message.unwrap_or_default(),
        file_name: file_name.unwrap_or_else(|| UNKNOWN_FILE.to_string()),
        line: record.line,
        column: record.column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::GuestPtr;

    fn record(line: u32, column: u32) -> AbortRecord {
        AbortRecord {
            message_ptr: GuestPtr::from_raw(64),
            file_ptr: GuestPtr::from_raw(128),
            line,
            column,
        }
    }

    #[test]
    fn test_full_record() {
        let err = aborted(
            Some("overflow".to_string()),
            Some("math.ts".to_string()),
            &record(42, 9),
        );
        assert_eq!(
            err.to_string(),
            "Execution aborted: overflow at math.ts:42:9"
        );
    }

    #[test]
    fn test_null_pointers_fall_back() {
        let err = aborted(None, None, &record(1, 1));
        assert_eq!(err.to_string(), "Execution aborted:  at <unknown>:1:1");
        match err {
            VmError::Aborted { message, file_name, .. } => {
                assert!(message.is_empty());
                assert_eq!(file_name, UNKNOWN_FILE);
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }
}
