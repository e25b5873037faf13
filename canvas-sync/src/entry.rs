//! Log entries: the unit stored in the ordered log.
//!
//! Both variants occupy exactly one version slot, however many edits a
//! batch carries. Entries are bincode-encoded on the log.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::codec::{self, CodecError, Edit, EDIT_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// One edit.
    Single(Edit),
    /// Concatenated packed edits, applied in listed order.
    Batch(Vec<u8>),
}

impl LogEntry {
    /// Build the entry for a group of edits: `Single` for one, `Batch` otherwise.
    pub fn from_edits(edits: &[Edit]) -> Self {
        match edits {
            [edit] => LogEntry::Single(*edit),
            _ => {
                let mut packed = Vec::with_capacity(edits.len() * EDIT_LEN);
                for edit in edits {
                    edit.encode_into(&mut packed);
                }
                LogEntry::Batch(packed)
            }
        }
    }

    /// Decode the contained edits in order, validating every one.
    pub fn edits(&self) -> Result<Vec<Edit>, CodecError> {
        match self {
            LogEntry::Single(edit) => Ok(vec![*edit]),
            LogEntry::Batch(packed) => codec::decode_batch(packed),
        }
    }

    /// The packed edit bytes, as they appear in a frame payload.
    pub fn packed(&self) -> Cow<'_, [u8]> {
        match self {
            LogEntry::Single(edit) => Cow::Owned(edit.pack().to_vec()),
            LogEntry::Batch(packed) => Cow::Borrowed(packed),
        }
    }

    /// Number of edits carried.
    pub fn edit_count(&self) -> usize {
        match self {
            LogEntry::Single(_) => 1,
            LogEntry::Batch(packed) => packed.len() / EDIT_LEN,
        }
    }

    /// Frame this entry for replay under its own version.
    pub fn frame(&self, version: u64) -> Result<Vec<u8>, CodecError> {
        codec::frame(version, &self.packed())
    }

    /// Serialize for the log.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Deserialize a log payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Deserialization(e.to_string()))?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(x: u16, y: u16, c: u8) -> Edit {
        Edit::new(x, y, c).unwrap()
    }

    #[test]
    fn test_from_edits_picks_variant() {
        assert_eq!(LogEntry::from_edits(&[edit(1, 1, 1)]), LogEntry::Single(edit(1, 1, 1)));

        let batch = LogEntry::from_edits(&[edit(1, 1, 1), edit(2, 2, 2)]);
        assert!(matches!(batch, LogEntry::Batch(ref b) if b.len() == 6));
        assert_eq!(batch.edit_count(), 2);
    }

    #[test]
    fn test_batch_preserves_order() {
        let edits = vec![edit(5, 5, 3), edit(5, 5, 7), edit(0, 999, 15)];
        let entry = LogEntry::from_edits(&edits);
        assert_eq!(entry.edits().unwrap(), edits);
    }

    #[test]
    fn test_log_payload_roundtrip() {
        let entry = LogEntry::from_edits(&[edit(3, 4, 5), edit(6, 7, 8)]);
        let decoded = LogEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);

        let single = LogEntry::Single(edit(999, 0, 2));
        assert_eq!(LogEntry::decode(&single.encode().unwrap()).unwrap(), single);
    }

    #[test]
    fn test_corrupt_batch_is_rejected_on_decode() {
        let entry = LogEntry::Batch(vec![0xE8, 0x03, 0x00]);
        assert!(entry.edits().is_err());

        let truncated = LogEntry::Batch(vec![1, 2]);
        assert!(matches!(truncated.edits(), Err(CodecError::TrailingBytes(2))));
    }

    #[test]
    fn test_garbage_payload() {
        assert!(LogEntry::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_frame_uses_entry_version() {
        let entry = LogEntry::Single(edit(5, 5, 7));
        assert_eq!(entry.frame(1).unwrap(), vec![1, 0, 0, 0, 0x05, 0x14, 0x70]);
    }
}
