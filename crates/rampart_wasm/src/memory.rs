//! Lifting host values out of guest linear memory.
//!
//! Lifting is pure memory traffic - no guest export runs - so these
//! functions work directly against the engine's read primitive. Lowering
//! allocates through gas-metered `__new`/`__pin` calls and therefore lives
//! on the contract handles. Both the synchronous and the asynchronous
//! shape decode through [`codec`](crate::codec), so the byte layouts exist
//! in exactly one place.
//!
//! Lifted arrays are always owned copies, never views into guest memory:
//! the guest heap may be reused or collected after the call returns.

use crate::codec::{self, CodecError};
use crate::engine::{AsyncContractEngine, ContractEngine};
use crate::error::VmResult;
use rampart_core::{GuestPtr, InstanceId};

/// Byte span holding the UTF-16 payload of a guest string.
///
/// The 4-byte length prefix sits immediately below the data pointer; the
/// payload spans the code-unit range `[ptr/2, (ptr + len)/2)`.
fn string_prefix_offset(ptr: GuestPtr) -> Result<u64, CodecError> {
    ptr.checked_sub(codec::STRING_LENGTH_PREFIX_BYTES)
        .map(|p| u64::from(p.as_raw()))
        .ok_or(CodecError::PointerUnderflow { pointer: ptr })
}

fn array_view_offset(ptr: GuestPtr) -> Result<u64, CodecError> {
    ptr.checked_add(codec::ARRAY_VIEW_OFFSET)
        .map(|p| u64::from(p.as_raw()))
        .ok_or(CodecError::PointerOverflow { pointer: ptr })
}

/// Even byte count actually lifted for a string of `byte_len` raw bytes
fn string_payload_bytes(byte_len: u32) -> u64 {
    u64::from(byte_len / 2) * 2
}

/// Lift a guest string. Returns `None` for the null pointer.
pub(crate) fn lift_string<E: ContractEngine>(
    engine: &E,
    id: InstanceId,
    ptr: GuestPtr,
) -> VmResult<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let prefix = engine.read_memory(id, string_prefix_offset(ptr)?, 4)?;
    let byte_len = codec::read_u32_le(&prefix, 0)?;
    let mut units: Vec<u16> = Vec::with_capacity((byte_len / 2) as usize);
    for (offset, len) in codec::chunk_spans(
        u64::from(ptr.as_raw()),
        string_payload_bytes(byte_len),
    ) {
        let chunk = engine.read_memory(id, offset, len)?;
        units.extend(codec::bytes_to_code_units(&chunk)?);
    }
    Ok(Some(String::from_utf16_lossy(&units)))
}

/// Lift a guest byte array as an owned copy. Returns `None` for the null
/// pointer.
pub(crate) fn lift_typed_array<E: ContractEngine>(
    engine: &E,
    id: InstanceId,
    ptr: GuestPtr,
) -> VmResult<Option<Vec<u8>>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let view = engine.read_memory(id, array_view_offset(ptr)?, 8)?;
    let (data_ptr, byte_len) = codec::decode_array_view(&view)?;
    let payload = engine.read_memory(id, u64::from(data_ptr.as_raw()), u64::from(byte_len))?;
    Ok(Some(payload))
}

/// Asynchronous twin of [`lift_string`]; every chunk read is individually
/// awaited.
pub(crate) async fn lift_string_async<E: AsyncContractEngine>(
    engine: &E,
    id: InstanceId,
    ptr: GuestPtr,
) -> VmResult<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let prefix = engine.read_memory(id, string_prefix_offset(ptr)?, 4).await?;
    let byte_len = codec::read_u32_le(&prefix, 0)?;
    let mut units: Vec<u16> = Vec::with_capacity((byte_len / 2) as usize);
    for (offset, len) in codec::chunk_spans(
        u64::from(ptr.as_raw()),
        string_payload_bytes(byte_len),
    ) {
        let chunk = engine.read_memory(id, offset, len).await?;
        units.extend(codec::bytes_to_code_units(&chunk)?);
    }
    Ok(Some(String::from_utf16_lossy(&units)))
}

/// Asynchronous twin of [`lift_typed_array`].
pub(crate) async fn lift_typed_array_async<E: AsyncContractEngine>(
    engine: &E,
    id: InstanceId,
    ptr: GuestPtr,
) -> VmResult<Option<Vec<u8>>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let view = engine.read_memory(id, array_view_offset(ptr)?, 8).await?;
    let (data_ptr, byte_len) = codec::decode_array_view(&view)?;
    let payload = engine
        .read_memory(id, u64::from(data_ptr.as_raw()), u64::from(byte_len))
        .await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::StateBindings;
    use crate::engine::{AbortRecord, CallOutcome, EngineError, ExportValue, GuestExport};
    use rampart_core::NetworkTag;
    use std::sync::Arc;

    /// Read-only memory image standing in for a live instance
    struct MemoryImage {
        bytes: Vec<u8>,
        reads: std::sync::Mutex<Vec<u64>>,
    }

    impl MemoryImage {
        fn new(bytes: Vec<u8>) -> Self {
            Self {
                bytes,
                reads: std::sync::Mutex::new(Vec::new()),
            }
        }

        /// Image with a guest string laid out at `ptr`: length prefix at
        /// `ptr - 4`, UTF-16LE payload at `ptr`
        fn with_string(ptr: u32, s: &str) -> Self {
            let payload = codec::encode_utf16_le(s);
            let mut bytes = vec![0u8; ptr as usize + payload.len()];
            let len = u32::try_from(payload.len()).unwrap();
            bytes[ptr as usize - 4..ptr as usize].copy_from_slice(&len.to_le_bytes());
            bytes[ptr as usize..].copy_from_slice(&payload);
            Self::new(bytes)
        }

        /// Image with an array header at `header` and payload at `data`
        fn with_array(header: u32, data: u32, payload: &[u8]) -> Self {
            let mut bytes = vec![0u8; data as usize + payload.len()];
            let encoded =
                codec::encode_array_header(GuestPtr::from_raw(data), payload.len() as u32);
            bytes[header as usize..header as usize + 12].copy_from_slice(&encoded);
            bytes[data as usize..].copy_from_slice(payload);
            Self::new(bytes)
        }
    }

    impl ContractEngine for MemoryImage {
        fn reserve_instance(&self) -> Result<InstanceId, EngineError> {
            unreachable!("memory image has no lifecycle")
        }

        fn instantiate(
            &self,
            _id: InstanceId,
            _bytecode: &[u8],
            _gas_limit: u64,
            _network: NetworkTag,
        ) -> Result<(), EngineError> {
            unreachable!("memory image has no lifecycle")
        }

        fn destroy(&self, _id: InstanceId) -> Result<(), EngineError> {
            unreachable!("memory image has no lifecycle")
        }

        fn call(
            &self,
            _id: InstanceId,
            _export: GuestExport,
            _args: &[ExportValue],
        ) -> Result<CallOutcome, EngineError> {
            unreachable!("memory image has no exports")
        }

        fn read_memory(
            &self,
            _id: InstanceId,
            offset: u64,
            len: u64,
        ) -> Result<Vec<u8>, EngineError> {
            self.reads.lock().unwrap().push(len);
            let start = usize::try_from(offset).unwrap();
            let end = start + usize::try_from(len).unwrap();
            self.bytes
                .get(start..end)
                .map(<[u8]>::to_vec)
                .ok_or(EngineError::MemoryAccess { offset, len })
        }

        fn write_memory(
            &self,
            _id: InstanceId,
            offset: u64,
            bytes: &[u8],
        ) -> Result<(), EngineError> {
            Err(EngineError::MemoryAccess {
                offset,
                len: bytes.len() as u64,
            })
        }

        fn gas_used(&self, _id: InstanceId) -> Result<u64, EngineError> {
            Ok(0)
        }

        fn set_gas_used(&self, _id: InstanceId, _gas: u64) -> Result<(), EngineError> {
            Ok(())
        }

        fn use_gas(&self, _id: InstanceId, _amount: u64) -> Result<(), EngineError> {
            Ok(())
        }

        fn remaining_gas(&self, _id: InstanceId) -> Result<u64, EngineError> {
            Ok(0)
        }

        fn set_remaining_gas(&self, _id: InstanceId, _gas: u64) -> Result<(), EngineError> {
            Ok(())
        }

        fn abort_record(&self, _id: InstanceId) -> Result<AbortRecord, EngineError> {
            Err(EngineError::Runtime("no abort pending".to_string()))
        }

        fn register_bindings(
            &self,
            _id: InstanceId,
            _bindings: Arc<dyn StateBindings>,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn unregister_bindings(&self, _id: InstanceId) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn id() -> InstanceId {
        InstanceId::from_raw(1)
    }

    #[test]
    fn test_lift_string_null() {
        let image = MemoryImage::new(Vec::new());
        assert_eq!(lift_string(&image, id(), GuestPtr::NULL).unwrap(), None);
    }

    #[test]
    fn test_lift_string_short() {
        let image = MemoryImage::with_string(16, "swap");
        let lifted = lift_string(&image, id(), GuestPtr::from_raw(16)).unwrap();
        assert_eq!(lifted.as_deref(), Some("swap"));
    }

    #[test]
    fn test_lift_string_empty() {
        let image = MemoryImage::with_string(16, "");
        let lifted = lift_string(&image, id(), GuestPtr::from_raw(16)).unwrap();
        assert_eq!(lifted.as_deref(), Some(""));
    }

    #[test]
    fn test_lift_string_multi_chunk() {
        // 1025 code units forces the second chunk read
        let s = "g".repeat(1025);
        let image = MemoryImage::with_string(16, &s);
        let lifted = lift_string(&image, id(), GuestPtr::from_raw(16)).unwrap();
        assert_eq!(lifted.as_deref(), Some(s.as_str()));
        let reads = image.reads.lock().unwrap().clone();
        // prefix read + two bounded payload reads
        assert_eq!(reads, vec![4, 2048, 2]);
    }

    #[test]
    fn test_lift_string_underflow_pointer() {
        let image = MemoryImage::new(vec![0u8; 64]);
        let err = lift_string(&image, id(), GuestPtr::from_raw(2)).unwrap_err();
        assert!(err.to_string().contains("underflow"));
    }

    #[test]
    fn test_lift_typed_array_null() {
        let image = MemoryImage::new(Vec::new());
        assert_eq!(lift_typed_array(&image, id(), GuestPtr::NULL).unwrap(), None);
    }

    #[test]
    fn test_lift_typed_array_owned_copy() {
        let payload = [0xAAu8; 32];
        let image = MemoryImage::with_array(16, 64, &payload);
        let lifted = lift_typed_array(&image, id(), GuestPtr::from_raw(16))
            .unwrap()
            .unwrap();
        assert_eq!(lifted, payload);
    }

    #[test]
    fn test_lift_typed_array_empty() {
        let image = MemoryImage::with_array(16, 64, &[]);
        let lifted = lift_typed_array(&image, id(), GuestPtr::from_raw(16))
            .unwrap()
            .unwrap();
        assert!(lifted.is_empty());
    }

    #[test]
    fn test_lift_typed_array_out_of_bounds() {
        let image = MemoryImage::new(vec![0u8; 8]);
        let err = lift_typed_array(&image, id(), GuestPtr::from_raw(16)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VmError::Engine(EngineError::MemoryAccess { .. })
        ));
    }
}
