//! In-memory directory snapshot, its self-describing binary wire format, and
//! diffing between two snapshots.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const INDEX_VERSION: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFileChunk {
    pub url: String,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub relative_path: String,
    pub length: u64,
    pub mtime: DateTime<Utc>,
    pub hash: [u8; 16],
    pub chunks: Vec<IndexFileChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub version: u8,
    pub built_at: DateTime<Utc>,
    entries: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexDiff {
    pub added: Vec<IndexEntry>,
    pub deleted: Vec<IndexEntry>,
    pub modified: Vec<IndexEntry>,
}

/// Normalizes a path for use as an index key: forward slashes, no leading
/// slash, lower-cased for case-insensitive comparison.
fn normalize_key(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches('/')
        .to_lowercase()
}

impl Index {
    pub fn new(built_at: DateTime<Utc>) -> Self {
        Self {
            version: INDEX_VERSION,
            built_at,
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entry: IndexEntry) {
        let key = normalize_key(&entry.relative_path);
        self.entries.insert(key, entry);
    }

    pub fn get_file(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(&normalize_key(path))
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize_key(path))
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walks `root` and builds an index with a whole-file MD5 hash per
    /// regular file. Chunk lists are left empty; they are populated once a
    /// file is actually uploaded.
    pub fn build_for_directory(root: &Path) -> Result<Self, Error> {
        let mut index = Index::new(Utc::now());
        for entry in walkdir::WalkDir::new(root).into_iter() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            let bytes = std::fs::read(entry.path())?;
            let meta = entry.metadata()?;
            let mtime: DateTime<Utc> = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap());

            let mut hasher = Md5::new();
            hasher.update(&bytes);
            let hash: [u8; 16] = hasher.finalize().into();

            index.insert(IndexEntry {
                relative_path: relative,
                length: bytes.len() as u64,
                mtime,
                hash,
                chunks: Vec::new(),
            });
        }
        Ok(index)
    }

    /// Diffs `self` (treated as local) against `remote`. `added` are present
    /// locally but not remotely, `deleted` are present remotely but not
    /// locally, `modified` share a path but differ in hash or length.
    pub fn diff(&self, remote: &Index) -> IndexDiff {
        let mut diff = IndexDiff::default();
        for (key, entry) in &self.entries {
            match remote.entries.get(key) {
                None => diff.added.push(entry.clone()),
                Some(remote_entry) => {
                    if remote_entry.hash != entry.hash || remote_entry.length != entry.length {
                        diff.modified.push(entry.clone());
                    }
                }
            }
        }
        for (key, entry) in &remote.entries {
            if !self.entries.contains_key(key) {
                diff.deleted.push(entry.clone());
            }
        }
        diff
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.version);
        out.extend_from_slice(&self.built_at.timestamp().to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in self.entries.values() {
            write_string(&mut out, &entry.relative_path);
            out.extend_from_slice(&entry.length.to_le_bytes());
            out.extend_from_slice(&entry.mtime.timestamp().to_le_bytes());
            out.extend_from_slice(&entry.hash);
            out.extend_from_slice(&(entry.chunks.len() as u32).to_le_bytes());
            for chunk in &entry.chunks {
                write_string(&mut out, &chunk.url);
                out.extend_from_slice(&chunk.size.to_le_bytes());
            }
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(bytes);
        let version = cursor.read_u8()?;
        if version != INDEX_VERSION {
            return Err(Error::UnsupportedIndexVersion(version));
        }
        let built_at_secs = cursor.read_i64()?;
        let built_at = Utc
            .timestamp_opt(built_at_secs, 0)
            .single()
            .ok_or_else(|| Error::IndexDecodeFailed {
                message: "invalid built_at timestamp".to_string(),
            })?;

        let entry_count = cursor.read_u32()?;
        let mut index = Index::new(built_at);
        index.version = version;

        for _ in 0..entry_count {
            let relative_path = cursor.read_string()?;
            let length = cursor.read_u64()?;
            let mtime_secs = cursor.read_i64()?;
            let mtime =
                Utc.timestamp_opt(mtime_secs, 0)
                    .single()
                    .ok_or_else(|| Error::IndexDecodeFailed {
                        message: "invalid mtime timestamp".to_string(),
                    })?;
            let mut hash = [0u8; 16];
            hash.copy_from_slice(cursor.read_bytes(16)?);

            let chunk_count = cursor.read_u32()?;
            let mut chunks = Vec::with_capacity(chunk_count as usize);
            for _ in 0..chunk_count {
                let url = cursor.read_string()?;
                let size = cursor.read_u32()?;
                chunks.push(IndexFileChunk { url, size });
            }

            index.insert(IndexEntry {
                relative_path,
                length,
                mtime,
                hash,
                chunks,
            });
        }

        Ok(index)
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let have = self.bytes.len() - self.pos;
        if len > have {
            return Err(Error::Truncated { needed: len, have });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        self.take(len)
    }

    fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::IndexDecodeFailed {
            message: format!("invalid UTF-8 in index string: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, hash_byte: u8, length: u64) -> IndexEntry {
        IndexEntry {
            relative_path: path.to_string(),
            length,
            mtime: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            hash: [hash_byte; 16],
            chunks: vec![IndexFileChunk {
                url: format!("https://example.invalid/{path}"),
                size: 128,
            }],
        }
    }

    #[test]
    fn serialize_round_trip() {
        let mut index = Index::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        index.insert(entry("a/b.txt", 1, 10));
        index.insert(entry("C.bin", 2, 20));

        let bytes = index.serialize();
        let decoded = Index::deserialize(&bytes).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn diff_detects_added_deleted_modified() {
        let mut local = Index::new(Utc::now());
        local.insert(entry("a", 1, 10));
        local.insert(entry("b", 2, 20));

        let mut remote = Index::new(Utc::now());
        remote.insert(entry("a", 1, 10));
        remote.insert(entry("c", 3, 30));

        let diff = local.diff(&remote);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].relative_path, "b");
        assert_eq!(diff.deleted.len(), 1);
        assert_eq!(diff.deleted[0].relative_path, "c");
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn diff_is_symmetric_for_added_deleted() {
        let mut local = Index::new(Utc::now());
        local.insert(entry("only-local", 1, 10));
        let remote = Index::new(Utc::now());

        let forward = local.diff(&remote);
        let backward = remote.diff(&local);
        assert_eq!(forward.added.len(), backward.deleted.len());
    }

    #[test]
    fn diff_against_self_is_empty() {
        let mut index = Index::new(Utc::now());
        index.insert(entry("a", 1, 10));
        let diff = index.diff(&index);
        assert!(diff.added.is_empty() && diff.deleted.is_empty() && diff.modified.is_empty());
    }

    #[test]
    fn path_comparison_is_case_insensitive() {
        let mut index = Index::new(Utc::now());
        index.insert(entry("Docs/Readme.TXT", 1, 10));
        assert!(index.file_exists("docs/readme.txt"));
    }

    #[test]
    fn modified_detected_on_hash_change() {
        let mut local = Index::new(Utc::now());
        local.insert(entry("a", 9, 10));
        let mut remote = Index::new(Utc::now());
        remote.insert(entry("a", 1, 10));

        let diff = local.diff(&remote);
        assert_eq!(diff.modified.len(), 1);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let err = Index::deserialize(&[INDEX_VERSION, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut index = Index::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        index.insert(entry("a", 1, 10));
        let mut bytes = index.serialize();
        bytes[0] = 0x02;
        let err = Index::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedIndexVersion(0x02)));
    }
}
