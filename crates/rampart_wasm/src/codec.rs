//! Guest memory layouts.
//!
//! The guest convention fixes exactly two data shapes, and both are
//! byte-exact requirements for interoperability with unmodified bytecode:
//!
//! - **String**: UTF-16LE code units, with a 4-byte length-in-bytes field
//!   stored immediately before the string's data pointer.
//! - **Typed-array header**: 12 bytes, little-endian,
//!   `[u32 data_ptr][u32 data_ptr duplicate][u32 byte_len]`; guest code
//!   reads both pointer words, so the duplicate is load-bearing.

use rampart_core::GuestPtr;

/// Bytes in the typed-array header
pub const ARRAY_HEADER_BYTES: u32 = 12;

/// Offset into a typed-array header where `[data_ptr][byte_len]` is read
/// back when lifting
pub const ARRAY_VIEW_OFFSET: u32 = 4;

/// Bytes in the string length prefix at `ptr - 4`
pub const STRING_LENGTH_PREFIX_BYTES: u32 = 4;

/// Upper bound on one lift read, in UTF-16 code units
pub const LIFT_CHUNK_CODE_UNITS: u32 = 1024;

/// Upper bound on one lift read, in bytes
pub const LIFT_CHUNK_BYTES: u32 = LIFT_CHUNK_CODE_UNITS * 2;

/// Guest class id for raw array buffers (`__new` second argument)
pub const ARRAY_BUFFER_ID: u32 = 1;

/// Guest class id for strings
pub const STRING_ID: u32 = 2;

/// Guest class id for byte arrays
pub const UINT8_ARRAY_ID: u32 = 10;

/// Layout decode failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Engine returned fewer bytes than requested
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead {
        /// Bytes required by the layout
        expected: usize,
        /// Bytes actually available
        got: usize,
    },

    /// UTF-16 payload with an odd byte count
    #[error("odd UTF-16 byte length: {len}")]
    OddLength {
        /// Offending byte count
        len: usize,
    },

    /// A layout field would sit below offset zero
    #[error("pointer underflow at {pointer}")]
    PointerUnderflow {
        /// Offending pointer
        pointer: GuestPtr,
    },

    /// A layout field would wrap the 32-bit address space
    #[error("pointer overflow at {pointer}")]
    PointerOverflow {
        /// Offending pointer
        pointer: GuestPtr,
    },

    /// Host value too large for a u32 guest length field
    #[error("payload of {len} bytes exceeds the guest length field")]
    Oversize {
        /// Offending byte count
        len: usize,
    },
}

/// Encode the 12-byte typed-array header.
///
/// The payload pointer appears twice by design of the guest layout.
#[must_use]
pub fn encode_array_header(payload: GuestPtr, byte_len: u32) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&payload.as_raw().to_le_bytes());
    header[4..8].copy_from_slice(&payload.as_raw().to_le_bytes());
    header[8..12].copy_from_slice(&byte_len.to_le_bytes());
    header
}

/// Decode `[data_ptr][byte_len]` as read at `header + 4`
///
/// # Errors
///
/// Returns error if fewer than 8 bytes are available
pub fn decode_array_view(bytes: &[u8]) -> Result<(GuestPtr, u32), CodecError> {
    let data_ptr = read_u32_le(bytes, 0)?;
    let byte_len = read_u32_le(bytes, 4)?;
    Ok((GuestPtr::from_raw(data_ptr), byte_len))
}

/// Read a little-endian u32 at `at`
///
/// # Errors
///
/// Returns error if the slice is too short
pub fn read_u32_le(bytes: &[u8], at: usize) -> Result<u32, CodecError> {
    let end = at.checked_add(4).ok_or(CodecError::ShortRead {
        expected: at.saturating_add(4),
        got: bytes.len(),
    })?;
    let field: [u8; 4] = bytes
        .get(at..end)
        .and_then(|s| s.try_into().ok())
        .ok_or(CodecError::ShortRead {
            expected: end,
            got: bytes.len(),
        })?;
    Ok(u32::from_le_bytes(field))
}

/// Reinterpret raw bytes as UTF-16LE code units
///
/// # Errors
///
/// Returns error on an odd byte count
pub fn bytes_to_code_units(bytes: &[u8]) -> Result<Vec<u16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode a host string as UTF-16LE bytes
#[must_use]
pub fn encode_utf16_le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Byte spans of ≤[`LIFT_CHUNK_BYTES`] covering a lift of `total_bytes`
/// starting at `start`.
///
/// Bounding each read avoids a single unbounded bulk transfer from guest
/// memory; chunks concatenate in order.
#[must_use]
pub fn chunk_spans(start: u64, total_bytes: u64) -> Vec<(u64, u64)> {
    let mut spans = Vec::new();
    let mut offset = start;
    let mut remaining = total_bytes;
    while remaining > 0 {
        let take = remaining.min(u64::from(LIFT_CHUNK_BYTES));
        spans.push((offset, take));
        offset += take;
        remaining -= take;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_array_header_layout() {
        let header = encode_array_header(GuestPtr::from_raw(0x1000), 32);
        assert_eq!(&header[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&header[4..8], &0x1000u32.to_le_bytes());
        assert_eq!(&header[8..12], &32u32.to_le_bytes());
    }

    #[test]
    fn test_array_header_roundtrip() {
        let header = encode_array_header(GuestPtr::from_raw(640), 77);
        // Lifting reads the view pair at header + 4
        let (data_ptr, byte_len) = decode_array_view(&header[4..]).unwrap();
        assert_eq!(data_ptr, GuestPtr::from_raw(640));
        assert_eq!(byte_len, 77);
    }

    #[test]
    fn test_decode_view_short_read() {
        let err = decode_array_view(&[0u8; 7]).unwrap_err();
        assert!(matches!(err, CodecError::ShortRead { .. }));
    }

    #[test]
    fn test_utf16_roundtrip() {
        let s = "gas metered \u{1F980} bridge";
        let bytes = encode_utf16_le(s);
        let units = bytes_to_code_units(&bytes).unwrap();
        assert_eq!(String::from_utf16(&units).unwrap(), s);
    }

    #[test]
    fn test_odd_length_rejected() {
        let err = bytes_to_code_units(&[0u8; 3]).unwrap_err();
        assert_eq!(err, CodecError::OddLength { len: 3 });
    }

    #[test]
    fn test_chunk_spans_exact_boundary() {
        let spans = chunk_spans(0, u64::from(LIFT_CHUNK_BYTES) * 2);
        assert_eq!(
            spans,
            vec![
                (0, u64::from(LIFT_CHUNK_BYTES)),
                (u64::from(LIFT_CHUNK_BYTES), u64::from(LIFT_CHUNK_BYTES)),
            ]
        );
    }

    #[test]
    fn test_chunk_spans_forces_multi_chunk_at_1025_units() {
        // 1025 code units = 2050 bytes: one full chunk plus a 2-byte tail
        let spans = chunk_spans(8, 2050);
        assert_eq!(spans, vec![(8, 2048), (2056, 2)]);
    }

    #[test]
    fn test_chunk_spans_empty() {
        assert!(chunk_spans(16, 0).is_empty());
    }

    proptest! {
        #[test]
        fn prop_chunk_spans_cover_range(start in 0u64..1_000_000, total in 0u64..100_000) {
            let spans = chunk_spans(start, total);
            let mut expected = start;
            let mut sum = 0u64;
            for (offset, len) in &spans {
                prop_assert_eq!(*offset, expected);
                prop_assert!(*len <= u64::from(LIFT_CHUNK_BYTES));
                prop_assert!(*len > 0);
                expected += len;
                sum += len;
            }
            prop_assert_eq!(sum, total);
        }

        #[test]
        fn prop_utf16_roundtrip(s in ".{0,200}") {
            let bytes = encode_utf16_le(&s);
            let units = bytes_to_code_units(&bytes).unwrap();
            prop_assert_eq!(String::from_utf16_lossy(&units), s);
        }
    }
}
