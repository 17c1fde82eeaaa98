//! Name-keyed index of payloads appended to a host file.
//!
//! The index is persisted as a trailer at the very end of the host file so an
//! artifact carries everything needed to find its own payloads.
//!
//! ## Structure
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Original host content              │  offset 0 .. original end
//! ├────────────────────────────────────┤
//! │ Payload 0 (plain or gzip)          │  [offset, offset + length)
//! ├────────────────────────────────────┤
//! │ Payload 1                          │
//! ├────────────────────────────────────┤
//! │ ... more payloads                  │
//! ├────────────────────────────────────┤
//! │ Index body (JSON)                  │
//! ├────────────────────────────────────┤
//! │ Trailer (16 bytes)                 │
//! │  - body length: u64 big-endian     │
//! │  - magic: "PRVIDX01"               │
//! └────────────────────────────────────┘
//! ```

use crate::compression::Codec;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};

/// Schema version written into every index body.
pub const INDEX_VERSION: &str = "1";

/// Magic bytes closing a host file that carries an index.
pub const TRAILER_MAGIC: &[u8; 8] = b"PRVIDX01";

/// Size of the fixed trailer (body length + magic).
pub const TRAILER_SIZE: u64 = 16;

/// Upper bound on the index body; anything larger is treated as corruption.
const MAX_INDEX_SIZE: u64 = 16 * 1024 * 1024;

/// One payload previously written onto the end of a host file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendedFile {
    /// Name the payload is looked up by.
    pub name: String,
    /// How the stored bytes are encoded.
    pub codec: Codec,
    /// Offset of the first stored byte in the host file.
    pub offset: u64,
    /// Number of stored (possibly compressed) bytes.
    pub length: u64,
}

impl AppendedFile {
    /// Offset one past the last stored byte, or `None` if the recorded
    /// range does not fit in a `u64`.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Versioned mapping from payload name to its stored byte range.
///
/// Entries are kept in append order. Appending a name twice replaces the
/// mapping; the earlier byte range stays in the file but is no longer
/// reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendIndex {
    version: String,
    files: Vec<AppendedFile>,
}

impl AppendIndex {
    /// Creates an empty index tagged with [`INDEX_VERSION`].
    pub fn new() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            files: Vec::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Looks up a payload by name.
    pub fn get(&self, name: &str) -> Option<&AppendedFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// All reachable payloads in the order they were appended.
    pub fn entries(&self) -> &[AppendedFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Records an entry, returning the one it replaced if the name was taken.
    pub(crate) fn insert(&mut self, entry: AppendedFile) -> Option<AppendedFile> {
        let replaced = self
            .files
            .iter()
            .position(|f| f.name == entry.name)
            .map(|pos| self.files.remove(pos));
        self.files.push(entry);
        replaced
    }

    /// Serializes the index body followed by the fixed trailer.
    pub(crate) fn encode_trailer(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self).map_err(|e| Error::SinkWrite(e.into()))?;
        let body_len = buf.len() as u64;
        buf.extend(&body_len.to_be_bytes());
        buf.extend(TRAILER_MAGIC);
        Ok(buf)
    }

    /// Reads the index trailer of a host file.
    ///
    /// Returns `None` when the file does not end with [`TRAILER_MAGIC`];
    /// otherwise the decoded index and the offset where the index body starts,
    /// which is also where payload data ends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptData`] if the trailer is present but the body
    /// length, JSON, version or recorded ranges are invalid.
    pub(crate) fn read_trailer<R: Read + Seek>(reader: &mut R) -> Result<Option<(Self, u64)>> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        if file_len < TRAILER_SIZE {
            return Ok(None);
        }

        reader.seek(SeekFrom::Start(file_len - TRAILER_SIZE))?;
        let mut trailer = [0u8; TRAILER_SIZE as usize];
        reader.read_exact(&mut trailer)?;

        if &trailer[8..] != TRAILER_MAGIC {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&trailer[..8]);
        let body_len = u64::from_be_bytes(len_bytes);

        if body_len > MAX_INDEX_SIZE || body_len > file_len - TRAILER_SIZE {
            return Err(Error::CorruptData(format!(
                "index length {} exceeds file size {}",
                body_len, file_len
            )));
        }

        let body_start = file_len - TRAILER_SIZE - body_len;
        reader.seek(SeekFrom::Start(body_start))?;
        let mut body = vec![0u8; body_len as usize];
        reader.read_exact(&mut body)?;

        let index: AppendIndex = serde_json::from_slice(&body)
            .map_err(|e| Error::CorruptData(format!("unreadable index: {}", e)))?;

        if index.version != INDEX_VERSION {
            return Err(Error::CorruptData(format!(
                "unsupported index version {:?}",
                index.version
            )));
        }

        let out_of_range = |f: &&AppendedFile| f.end().map_or(true, |end| end > body_start);
        if let Some(bad) = index.files.iter().find(out_of_range) {
            return Err(Error::CorruptData(format!(
                "payload {:?} extends past the end of payload data",
                bad.name
            )));
        }

        Ok(Some((index, body_start)))
    }
}

impl Default for AppendIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry(name: &str, offset: u64, length: u64) -> AppendedFile {
        AppendedFile {
            name: name.to_string(),
            codec: Codec::Gzip,
            offset,
            length,
        }
    }

    #[test]
    fn test_insert_replaces_existing_name() {
        let mut index = AppendIndex::new();
        assert!(index.insert(entry("a", 10, 5)).is_none());
        assert!(index.insert(entry("b", 15, 5)).is_none());

        let replaced = index.insert(entry("a", 20, 7)).unwrap();
        assert_eq!(replaced.offset, 10);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("a").unwrap().offset, 20);
        assert_eq!(index.entries()[0].name, "b");
    }

    #[test]
    fn test_trailer_round_trip() {
        let mut index = AppendIndex::new();
        index.insert(entry("client.crt", 4, 6));

        let mut file = b"HOST".to_vec();
        file.extend_from_slice(b"abcdef");
        file.extend(index.encode_trailer().unwrap());

        let (decoded, data_end) = AppendIndex::read_trailer(&mut Cursor::new(&file))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, index);
        assert_eq!(data_end, 10);
        assert_eq!(decoded.version(), INDEX_VERSION);
    }

    #[test]
    fn test_no_trailer() {
        let mut cursor = Cursor::new(b"plain executable bytes".to_vec());
        assert!(AppendIndex::read_trailer(&mut cursor).unwrap().is_none());

        let mut tiny = Cursor::new(b"short".to_vec());
        assert!(AppendIndex::read_trailer(&mut tiny).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_is_corrupt() {
        let mut file = b"HOST".to_vec();
        file.extend(&u64::MAX.to_be_bytes());
        file.extend(TRAILER_MAGIC);

        let result = AppendIndex::read_trailer(&mut Cursor::new(&file));
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }

    #[test]
    fn test_garbage_body_is_corrupt() {
        let mut file = b"not json".to_vec();
        file.extend(&8u64.to_be_bytes());
        file.extend(TRAILER_MAGIC);

        let result = AppendIndex::read_trailer(&mut Cursor::new(&file));
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }

    #[test]
    fn test_range_past_data_is_corrupt() {
        let mut index = AppendIndex::new();
        index.insert(entry("x", 0, 100));

        let mut file = b"tiny".to_vec();
        file.extend(index.encode_trailer().unwrap());

        let result = AppendIndex::read_trailer(&mut Cursor::new(&file));
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }

    #[test]
    fn test_overflowing_range_is_corrupt() {
        let body = br#"{"version":"1","files":[{"name":"x","codec":"none","offset":18446744073709551615,"length":2}]}"#;
        let mut file = b"HOST".to_vec();
        file.extend_from_slice(body);
        file.extend(&(body.len() as u64).to_be_bytes());
        file.extend(TRAILER_MAGIC);

        let result = AppendIndex::read_trailer(&mut Cursor::new(&file));
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }

    #[test]
    fn test_end_overflow() {
        assert_eq!(entry("a", 4, 6).end(), Some(10));
        assert_eq!(entry("a", u64::MAX, 2).end(), None);
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let body = br#"{"version":"99","files":[]}"#;
        let mut file = body.to_vec();
        file.extend(&(body.len() as u64).to_be_bytes());
        file.extend(TRAILER_MAGIC);

        let result = AppendIndex::read_trailer(&mut Cursor::new(&file));
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }
}
