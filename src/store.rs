//! Append-only binary persistence for pattern nodes.
//!
//! Two files back a store: a *data* file of fixed 92-byte node records,
//! addressed by byte offset, and an *index* file of fixed 40-byte entries
//! recording each node's key, data offset, and parent key (blank parent =
//! root). Records never move and are never deleted; the only in-place
//! mutation is the frequency counter.
//!
//! All multi-byte fields are little-endian so files are portable across
//! hosts. A parent→children offset map is rebuilt from the index at open, so
//! enumerating roots or one node's children never rescans the files.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::{CandleData, Error, Result};

// ============================================================
// BINARY LAYOUT
// ============================================================

/// Fixed width of a node key on disk.
pub const KEY_LEN: usize = 16;
/// Index entry: key[16] + data_offset i64 + parent[16].
pub const INDEX_RECORD_LEN: u64 = 40;
/// Data record: key[16] + frequency i32 + 9 × f64.
pub const DATA_RECORD_LEN: u64 = 92;

const FREQUENCY_AT: usize = KEY_LEN;
const FIELDS_AT: usize = KEY_LEN + 4;

/// Keys are drawn from this alphabet, base-36 big-endian, zero-padded.
const KEY_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

// ============================================================
// NODE KEY
// ============================================================

/// Fixed-width node identifier: 16 ASCII characters from `0-9A-Z`.
///
/// Keys are minted from a per-store monotonic sequence number, so uniqueness
/// within a store is deterministic, and a reopened store resumes the
/// sequence where it left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey([u8; KEY_LEN]);

impl NodeKey {
    /// The all-zero key used as the parent field of root nodes.
    pub const BLANK: NodeKey = NodeKey([0u8; KEY_LEN]);

    /// Encodes a sequence number as a fixed-width base-36 key.
    pub fn from_seq(seq: u64) -> Self {
        let mut buf = [b'0'; KEY_LEN];
        let mut n = seq;
        let mut i = KEY_LEN;
        while n > 0 && i > 0 {
            i -= 1;
            buf[i] = KEY_ALPHABET[(n % 36) as usize];
            n /= 36;
        }
        NodeKey(buf)
    }

    pub fn is_blank(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    /// Key text with trailing null/space padding trimmed.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(KEY_LEN);
        std::str::from_utf8(&self.0[..end])
            .unwrap_or("")
            .trim_end()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        NodeKey(bytes)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================
// RECORDS
// ============================================================

/// A persisted pattern node, decoded from the data file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeRecord {
    pub key: NodeKey,
    /// Byte offset of this record in the data file (assigned at append,
    /// never changes).
    pub offset: u64,
    /// Times this node has been matched; starts at 1, only increases.
    pub frequency: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub top_wick: f64,
    pub bottom_wick: f64,
    pub delta: f64,
    pub percent_change: f64,
}

impl NodeRecord {
    fn decode(offset: u64, buf: &[u8; DATA_RECORD_LEN as usize]) -> Self {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[..KEY_LEN]);
        Self {
            key: NodeKey::from_bytes(key),
            offset,
            frequency: i32_at(buf, FREQUENCY_AT) as u32,
            open: f64_at(buf, FIELDS_AT),
            high: f64_at(buf, FIELDS_AT + 8),
            low: f64_at(buf, FIELDS_AT + 16),
            close: f64_at(buf, FIELDS_AT + 24),
            volume: f64_at(buf, FIELDS_AT + 32),
            top_wick: f64_at(buf, FIELDS_AT + 40),
            bottom_wick: f64_at(buf, FIELDS_AT + 48),
            delta: f64_at(buf, FIELDS_AT + 56),
            percent_change: f64_at(buf, FIELDS_AT + 64),
        }
    }
}

impl CandleData for NodeRecord {
    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    // Wicks come back from disk rather than being re-derived.
    fn top_wick(&self) -> f64 {
        self.top_wick
    }

    fn bottom_wick(&self) -> f64 {
        self.bottom_wick
    }

    fn delta(&self) -> Option<f64> {
        Some(self.delta)
    }

    fn percent_change(&self) -> Option<f64> {
        Some(self.percent_change)
    }
}

/// One entry of the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: NodeKey,
    pub data_offset: i64,
    /// Blank for root nodes.
    pub parent: NodeKey,
}

impl IndexEntry {
    fn decode(buf: &[u8; INDEX_RECORD_LEN as usize]) -> Self {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[..KEY_LEN]);
        let mut parent = [0u8; KEY_LEN];
        parent.copy_from_slice(&buf[24..40]);
        Self {
            key: NodeKey::from_bytes(key),
            data_offset: i64_at(buf, 16),
            parent: NodeKey::from_bytes(parent),
        }
    }
}

#[inline]
fn f64_at(buf: &[u8], at: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    f64::from_le_bytes(b)
}

#[inline]
fn i64_at(buf: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(b)
}

#[inline]
fn i32_at(buf: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(b)
}

// ============================================================
// STORE
// ============================================================

/// Durable, append-only store of pattern nodes.
///
/// Owns both file handles exclusively for its lifetime; single-process,
/// single-writer. Handles are released on every exit path via `Drop`, and a
/// failure while opening the second file drops the first automatically.
pub struct NodeStore {
    index: File,
    data: File,
    index_len: u64,
    data_len: u64,
    next_seq: u64,
    /// Data offsets of root nodes, in append order.
    roots: Vec<u64>,
    /// Parent key → data offsets of its children, in append order.
    children: HashMap<NodeKey, Vec<u64>>,
}

impl NodeStore {
    /// Opens (creating if absent) the index/data file pair.
    ///
    /// Rejects files whose length is not a whole number of records, then
    /// scans the index once to rebuild the root list and parent→children
    /// map and to resume the key sequence.
    pub fn open(index_path: impl AsRef<Path>, data_path: impl AsRef<Path>) -> Result<Self> {
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(index_path.as_ref())?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(data_path.as_ref())?;

        let index_len = index.metadata()?.len();
        let data_len = data.metadata()?.len();
        if index_len % INDEX_RECORD_LEN != 0 {
            return Err(Error::CorruptStore(format!(
                "index file length {index_len} is not a multiple of {INDEX_RECORD_LEN}"
            )));
        }
        if data_len % DATA_RECORD_LEN != 0 {
            return Err(Error::CorruptStore(format!(
                "data file length {data_len} is not a multiple of {DATA_RECORD_LEN}"
            )));
        }

        let mut store = Self {
            index,
            data,
            index_len,
            data_len,
            next_seq: index_len / INDEX_RECORD_LEN,
            roots: Vec::new(),
            children: HashMap::new(),
        };
        store.rebuild_link_map()?;
        debug!(
            nodes = store.len(),
            roots = store.roots.len(),
            "opened node store"
        );
        Ok(store)
    }

    fn rebuild_link_map(&mut self) -> Result<()> {
        let mut reader = &self.index;
        reader.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; INDEX_RECORD_LEN as usize];
        for _ in 0..self.index_len / INDEX_RECORD_LEN {
            reader.read_exact(&mut buf)?;
            let entry = IndexEntry::decode(&buf);
            if entry.parent.is_blank() {
                self.roots.push(entry.data_offset as u64);
            } else {
                self.children
                    .entry(entry.parent)
                    .or_default()
                    .push(entry.data_offset as u64);
            }
        }
        Ok(())
    }

    /// Appends a new node and its index entry, durably.
    ///
    /// Returns the freshly minted key and the data-file offset. `parent` of
    /// `None` records a root node.
    pub fn append_node<T: CandleData>(
        &mut self,
        candle: &T,
        parent: Option<NodeKey>,
    ) -> Result<(NodeKey, u64)> {
        let key = NodeKey::from_seq(self.next_seq);
        let offset = self.data_len;

        let mut record = [0u8; DATA_RECORD_LEN as usize];
        record[..KEY_LEN].copy_from_slice(key.as_bytes());
        record[FREQUENCY_AT..FIELDS_AT].copy_from_slice(&1i32.to_le_bytes());
        let fields = [
            candle.open(),
            candle.high(),
            candle.low(),
            candle.close(),
            candle.volume(),
            candle.top_wick(),
            candle.bottom_wick(),
            candle.delta().unwrap_or(0.0),
            candle.percent_change().unwrap_or(0.0),
        ];
        for (i, value) in fields.iter().enumerate() {
            let at = FIELDS_AT + i * 8;
            record[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }

        let mut entry = [0u8; INDEX_RECORD_LEN as usize];
        entry[..KEY_LEN].copy_from_slice(key.as_bytes());
        entry[16..24].copy_from_slice(&(offset as i64).to_le_bytes());
        if let Some(p) = parent {
            entry[24..40].copy_from_slice(p.as_bytes());
        }

        self.data.seek(SeekFrom::Start(self.data_len))?;
        self.data.write_all(&record)?;
        self.data.sync_data()?;

        self.index.seek(SeekFrom::Start(self.index_len))?;
        self.index.write_all(&entry)?;
        self.index.sync_data()?;

        self.data_len += DATA_RECORD_LEN;
        self.index_len += INDEX_RECORD_LEN;
        self.next_seq += 1;
        match parent {
            None => self.roots.push(offset),
            Some(p) => self.children.entry(p).or_default().push(offset),
        }

        debug!(key = %key, parent = %parent.map(|p| p.to_string()).unwrap_or_default(), offset, "appended node");
        Ok((key, offset))
    }

    /// Reads the node record at `offset` in the data file.
    pub fn read_node_at(&self, offset: u64) -> Result<NodeRecord> {
        self.check_offset(offset)?;
        let mut reader = &self.data;
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; DATA_RECORD_LEN as usize];
        reader.read_exact(&mut buf)?;
        Ok(NodeRecord::decode(offset, &buf))
    }

    /// Increments the persisted frequency of the node at `offset` and
    /// returns the new count. The only in-place mutation the store performs.
    pub fn bump_frequency(&mut self, offset: u64) -> Result<u32> {
        self.check_offset(offset)?;
        let at = offset + FREQUENCY_AT as u64;

        let mut reader = &self.data;
        reader.seek(SeekFrom::Start(at))?;
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        let next = i32::from_le_bytes(buf).saturating_add(1);

        self.data.seek(SeekFrom::Start(at))?;
        self.data.write_all(&next.to_le_bytes())?;
        Ok(next as u32)
    }

    fn check_offset(&self, offset: u64) -> Result<()> {
        if offset >= self.data_len || offset % DATA_RECORD_LEN != 0 {
            return Err(Error::OffsetOutOfRange {
                offset,
                len: self.data_len,
            });
        }
        Ok(())
    }

    /// Enumerates root nodes in append order.
    ///
    /// Lazy and restartable: each call snapshots the current root set and
    /// reads records on demand, bounded by the store size at call time.
    pub fn roots(&self) -> Nodes<'_> {
        Nodes {
            store: self,
            offsets: self.roots.clone(),
            at: 0,
        }
    }

    /// Enumerates `parent`'s children in append order. Same contract as
    /// [`roots`](Self::roots).
    pub fn children(&self, parent: NodeKey) -> Nodes<'_> {
        Nodes {
            store: self,
            offsets: self.child_offsets(parent),
            at: 0,
        }
    }

    /// Snapshot of root data offsets, in append order.
    pub fn root_offsets(&self) -> Vec<u64> {
        self.roots.clone()
    }

    /// Snapshot of `parent`'s child data offsets, in append order.
    pub fn child_offsets(&self, parent: NodeKey) -> Vec<u64> {
        self.children.get(&parent).cloned().unwrap_or_default()
    }

    /// Total number of persisted nodes.
    pub fn len(&self) -> u64 {
        self.index_len / INDEX_RECORD_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.index_len == 0
    }

    /// Flushes everything to disk and releases both handles.
    pub fn close(self) -> Result<()> {
        self.data.sync_all()?;
        self.index.sync_all()?;
        Ok(())
    }
}

/// Lazy enumeration over a snapshot of node offsets.
pub struct Nodes<'a> {
    store: &'a NodeStore,
    offsets: Vec<u64>,
    at: usize,
}

impl Iterator for Nodes<'_> {
    type Item = Result<NodeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = *self.offsets.get(self.at)?;
        self.at += 1;
        Some(self.store.read_node_at(offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.offsets.len() - self.at;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Nodes<'_> {}

// ============================================================
// TESTS
// ============================================================
