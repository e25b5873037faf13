//! Compact binary encoding for canvas edits and update frames.
//!
//! Packed edit (3 bytes, 10-bit x, 10-bit y, 4-bit color):
//! ```text
//! ┌────────────────┬──────────────────────────┬──────────────────────────┐
//! │ byte 0         │ byte 1                   │ byte 2                   │
//! │ x[0..8]        │ x[8..10] | y[0..6] << 2  │ y[6..10] | color << 4    │
//! └────────────────┴──────────────────────────┴──────────────────────────┘
//! ```
//!
//! Update frame (identical for catch-up replay and live broadcast):
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ version (u32 LE) │ N × packed edit (N ≥ 1)      │
//! │ 4 bytes          │ 3N bytes                     │
//! └──────────────────┴──────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canvas width in cells.
pub const WIDTH: u16 = 1000;
/// Canvas height in cells.
pub const HEIGHT: u16 = 1000;
/// Number of palette entries.
pub const PALETTE_SIZE: u8 = 16;
/// Size of one packed edit.
pub const EDIT_LEN: usize = 3;
/// Size of the version prefix of a frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Codec errors. All of them are validation failures at an ingress point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("{field} out of range: {value} (must be in 0..{limit})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        limit: u16,
    },
    #[error("packed edit buffer has {0} bytes, not a multiple of 3")]
    TrailingBytes(usize),
    #[error("version {0} does not fit in a 32-bit frame header")]
    VersionOverflow(u64),
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

fn check(field: &'static str, value: i64, limit: u16) -> Result<(), CodecError> {
    if (0..i64::from(limit)).contains(&value) {
        Ok(())
    } else {
        Err(CodecError::OutOfRange { field, value, limit })
    }
}

/// A single cell mutation. Only constructible with in-range values.
///
/// Serialized (serde) as its packed 3-byte form, so deserializing runs the
/// same range checks as [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u8; 3]", into = "[u8; 3]")]
pub struct Edit {
    x: u16,
    y: u16,
    color: u8,
}

impl Edit {
    /// Create a validated edit.
    pub fn new(x: u16, y: u16, color: u8) -> Result<Self, CodecError> {
        Self::from_signed(i64::from(x), i64::from(y), i64::from(color))
    }

    /// Create a validated edit from untrusted signed input (wire requests).
    pub fn from_signed(x: i64, y: i64, color: i64) -> Result<Self, CodecError> {
        check("x", x, WIDTH)?;
        check("y", y, HEIGHT)?;
        check("color", color, u16::from(PALETTE_SIZE))?;
        Ok(Self {
            x: x as u16,
            y: y as u16,
            color: color as u8,
        })
    }

    pub fn x(&self) -> u16 {
        self.x
    }

    pub fn y(&self) -> u16 {
        self.y
    }

    pub fn color(&self) -> u8 {
        self.color
    }

    /// Pack into the 3-byte wire form.
    pub fn pack(&self) -> [u8; EDIT_LEN] {
        [
            (self.x & 0xff) as u8,
            ((self.x >> 8) & 0x03) as u8 | (((self.y & 0x3f) as u8) << 2),
            ((self.y >> 6) & 0x0f) as u8 | (self.color << 4),
        ]
    }

    /// Append the packed form to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.pack());
    }
}

impl TryFrom<[u8; EDIT_LEN]> for Edit {
    type Error = CodecError;

    fn try_from(bytes: [u8; EDIT_LEN]) -> Result<Self, Self::Error> {
        decode(bytes)
    }
}

impl From<Edit> for [u8; EDIT_LEN] {
    fn from(edit: Edit) -> Self {
        edit.pack()
    }
}

/// Pack `(x, y, color)`, rejecting out-of-range operands.
pub fn encode(x: u16, y: u16, color: u8) -> Result<[u8; EDIT_LEN], CodecError> {
    Ok(Edit::new(x, y, color)?.pack())
}

/// Unpack a 3-byte edit. Values representable in 10 bits but outside the
/// canvas (x or y ≥ 1000) are rejected.
pub fn decode(bytes: [u8; EDIT_LEN]) -> Result<Edit, CodecError> {
    let x = u16::from(bytes[0]) | (u16::from(bytes[1] & 0x03) << 8);
    let y = u16::from(bytes[1] >> 2) | (u16::from(bytes[2] & 0x0f) << 6);
    let color = bytes[2] >> 4;
    Edit::new(x, y, color)
}

/// Unpack a concatenation of packed edits, in order.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Edit>, CodecError> {
    if bytes.len() % EDIT_LEN != 0 {
        return Err(CodecError::TrailingBytes(bytes.len()));
    }
    bytes
        .chunks_exact(EDIT_LEN)
        .map(|c| decode([c[0], c[1], c[2]]))
        .collect()
}

/// Prefix `payload` with the 4-byte little-endian version.
pub fn frame(version: u64, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let header = u32::try_from(version).map_err(|_| CodecError::VersionOverflow(version))?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&header.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a frame into its version and decoded edits.
pub fn parse_frame(bytes: &[u8]) -> Result<(u64, Vec<Edit>), CodecError> {
    if bytes.len() < FRAME_HEADER_LEN + EDIT_LEN {
        return Err(CodecError::FrameTooShort(bytes.len()));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&bytes[..FRAME_HEADER_LEN]);
    let version = u64::from(u32::from_le_bytes(header));
    let edits = decode_batch(&bytes[FRAME_HEADER_LEN..])?;
    Ok((version, edits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_byte_layout() {
        assert_eq!(encode(5, 5, 3).unwrap(), [0x05, 0x14, 0x30]);
        assert_eq!(encode(999, 999, 15).unwrap(), [0xE7, 0x9F, 0xFF]);
        assert_eq!(encode(0, 0, 0).unwrap(), [0, 0, 0]);
    }

    #[test]
    fn test_roundtrip_along_each_axis() {
        for x in 0..WIDTH {
            let e = decode(encode(x, 999 - x, (x % 16) as u8).unwrap()).unwrap();
            assert_eq!((e.x(), e.y(), e.color()), (x, 999 - x, (x % 16) as u8));
        }
        for y in 0..HEIGHT {
            let e = decode(encode(y / 2, y, 15 - (y % 16) as u8).unwrap()).unwrap();
            assert_eq!((e.x(), e.y(), e.color()), (y / 2, y, 15 - (y % 16) as u8));
        }
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        assert!(matches!(
            encode(1000, 0, 0),
            Err(CodecError::OutOfRange { field: "x", value: 1000, .. })
        ));
        assert!(matches!(
            encode(0, 1000, 0),
            Err(CodecError::OutOfRange { field: "y", .. })
        ));
        assert!(matches!(
            encode(0, 0, 16),
            Err(CodecError::OutOfRange { field: "color", .. })
        ));
    }

    #[test]
    fn test_signed_input_rejects_negatives() {
        assert!(Edit::from_signed(-1, 0, 0).is_err());
        assert!(Edit::from_signed(0, -1, 0).is_err());
        assert!(Edit::from_signed(0, 0, -1).is_err());
        assert!(Edit::from_signed(999, 999, 15).is_ok());
    }

    #[test]
    fn test_decode_rejects_representable_but_off_canvas() {
        // x = 1000 fits in 10 bits
        assert!(decode([0xE8, 0x03, 0x00]).is_err());
        // y = 1023
        assert!(decode([0x00, 0xFC, 0x0F]).is_err());
    }

    #[test]
    fn test_decode_batch_order_and_length() {
        let mut buf = Vec::new();
        Edit::new(1, 2, 3).unwrap().encode_into(&mut buf);
        Edit::new(4, 5, 6).unwrap().encode_into(&mut buf);
        let edits = decode_batch(&buf).unwrap();
        assert_eq!(edits, vec![Edit::new(1, 2, 3).unwrap(), Edit::new(4, 5, 6).unwrap()]);

        buf.push(0);
        assert_eq!(decode_batch(&buf), Err(CodecError::TrailingBytes(7)));
    }

    #[test]
    fn test_frame_layout() {
        let payload = encode(5, 5, 7).unwrap();
        let framed = frame(1, &payload).unwrap();
        assert_eq!(framed, vec![1, 0, 0, 0, 0x05, 0x14, 0x70]);

        let (version, edits) = parse_frame(&framed).unwrap();
        assert_eq!(version, 1);
        assert_eq!(edits, vec![Edit::new(5, 5, 7).unwrap()]);
    }

    #[test]
    fn test_frame_version_overflow() {
        let too_big = u64::from(u32::MAX) + 1;
        assert_eq!(frame(too_big, &[0, 0, 0]), Err(CodecError::VersionOverflow(too_big)));
    }

    #[test]
    fn test_parse_frame_too_short() {
        assert_eq!(parse_frame(&[1, 0, 0, 0]), Err(CodecError::FrameTooShort(4)));
    }

    #[test]
    fn test_edit_serde_validates() {
        let edit = Edit::new(10, 20, 5).unwrap();
        let bytes = bincode::serde::encode_to_vec(edit, bincode::config::standard()).unwrap();
        let (back, _): (Edit, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, edit);

        let bad = bincode::serde::encode_to_vec([0xE8u8, 0x03, 0x00], bincode::config::standard())
            .unwrap();
        let result: Result<(Edit, usize), _> =
            bincode::serde::decode_from_slice(&bad, bincode::config::standard());
        assert!(result.is_err());
    }
}
