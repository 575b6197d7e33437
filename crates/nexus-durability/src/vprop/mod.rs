//! Virtual property log
//!
//! Append-mostly file holding large string property values outside the object
//! heap. Records are addressed by [`RecordRef`] (file offset).
//!
//! Records at or after the commit watermark may be rewritten in place when the
//! new key and value fit the record's allotment. Records before the watermark
//! are sealed: changing one appends a new record. Erased records are zeroed but
//! their space is never reclaimed online; a forced snapshot that rewrites the
//! log is the only way to shrink it.
//!
//! File I/O happens under a dedicated mutex, never under a graph lock.

pub mod record;

pub use record::{
    DELIM_BYTES, HEADER_BYTES, RECORD_HEAD_BYTES, RecordHead, RecordRef, VALUE_TYPE_STRING,
    VPROP_DELIM, VpropHeader, padding_words,
};

use crate::codec::{WORD_SIZE, WordWriter, words_for};
use crate::error::IoResultExt;
use crate::graph::GraphId;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A decoded virtual property record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualProperty {
    /// Owning vertex id
    pub vertex: u128,
    /// Property key
    pub key: String,
    /// Property value
    pub value: String,
}

/// Operation counters
#[derive(Debug, Default)]
pub struct VpropMetrics {
    appends: AtomicU64,
    in_place_updates: AtomicU64,
    erased: AtomicU64,
    reads: AtomicU64,
    commits: AtomicU64,
}

/// Snapshot of log counters and header state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VpropStats {
    /// Records appended
    pub appends: u64,
    /// Records rewritten in place
    pub in_place_updates: u64,
    /// Records zeroed
    pub erased: u64,
    /// Records read
    pub reads: u64,
    /// Commits performed
    pub commits: u64,
    /// Commit watermark
    pub commit: u64,
    /// Value bytes written, less erased
    pub bytes: u64,
    /// Records written, less erased
    pub count: u64,
    /// Current file length
    pub file_len: u64,
}

struct LogFile {
    path: PathBuf,
    file: Option<File>,
    header: VpropHeader,
    end: u64,
}

impl LogFile {
    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::state("Virtual property log is closed"))
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset)).fs_context("seek", &path)?;
        file.write_all(buf).fs_context("write", &path)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset)).fs_context("seek", &path)?;
        file.read_exact(buf).fs_context("read", &path)
    }

    fn tail(&self) -> u64 {
        self.end - DELIM_BYTES
    }

    fn read_head(&mut self, r: RecordRef) -> Result<RecordHead> {
        if r.offset() + RECORD_HEAD_BYTES > self.tail() {
            return Err(Error::corruption(format!(
                "Virtual property offset {} beyond end of data ({})",
                r.offset(),
                self.tail()
            )));
        }
        let mut buf = [0u8; RECORD_HEAD_BYTES as usize];
        self.read_at(r.offset(), &mut buf)?;
        RecordHead::decode(&buf, r.offset())
    }

    fn write_record(
        &mut self,
        at: u64,
        head: &RecordHead,
        key: &[u8],
        value: &[u8],
        trailer: bool,
    ) -> Result<u64> {
        let kw = words_for(key.len());
        let vw = words_for(value.len());
        let mut w = WordWriter::new(Vec::with_capacity(
            RECORD_HEAD_BYTES as usize + head.allotted as usize * WORD_SIZE + DELIM_BYTES as usize,
        ));
        head.write_to(&mut w)?;
        w.write_padded(key, kw)?;
        w.write_padded(value, vw)?;
        if trailer {
            w.write_zeros(head.allotted as usize - kw - vw)?;
            w.write_words(&VPROP_DELIM)?;
        }
        let buf = w.into_inner();
        self.write_at(at, &buf)?;
        Ok(buf.len() as u64)
    }

    fn append(&mut self, vertex: u128, key: &str, value: &str) -> Result<RecordRef> {
        let at = RecordRef::new(self.tail())?;
        let kw = words_for(key.len()) as u64;
        let vw = words_for(value.len()) as u64;
        let head = RecordHead {
            vertex,
            allotted: kw + vw + padding_words(vw),
            key_len: key.len() as u64,
            value_len: value.len() as u64,
            value_type: VALUE_TYPE_STRING,
            attr: 0,
        };
        let written = self.write_record(at.offset(), &head, key.as_bytes(), value.as_bytes(), true)?;
        self.end = at.offset() + written;
        self.header.bytes += value.len() as u64;
        self.header.count += 1;
        Ok(at)
    }

    fn erase(&mut self, r: RecordRef) -> Result<bool> {
        let head = self.read_head(r)?;
        if head.is_erased() {
            return Ok(false);
        }
        let zeroed = r.offset() >= self.header.commit;
        if zeroed {
            let mut w = WordWriter::new(Vec::with_capacity(RECORD_HEAD_BYTES as usize));
            head.erased().write_to(&mut w)?;
            self.write_at(r.offset(), &w.into_inner())?;
        }
        self.header.bytes = self.header.bytes.saturating_sub(head.value_len);
        self.header.count = self.header.count.saturating_sub(1);
        Ok(zeroed)
    }

    fn store_header(&mut self) -> Result<()> {
        let buf = self.header.encode()?;
        self.write_at(0, &buf)?;
        let path = self.path.clone();
        self.file()?.sync_data().fs_context("sync", &path)
    }
}

fn open_rw(path: &Path, create: bool) -> Result<File> {
    if create {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).fs_context("create_dir", parent)?;
        }
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)
        .fs_context("open", path)
}

/// Per-graph virtual property log
pub struct VirtualPropertyLog {
    graph: GraphId,
    inner: Mutex<LogFile>,
    metrics: VpropMetrics,
}

impl VirtualPropertyLog {
    /// Open or create the log at `path` for `graph`
    ///
    /// Anything written after the last commit is discarded.
    pub fn open(path: &Path, graph: GraphId) -> Result<Self> {
        let file = open_rw(path, true)?;
        let len = file.metadata().fs_context("stat", path)?.len();
        let mut log = LogFile {
            path: path.to_path_buf(),
            file: Some(file),
            header: VpropHeader::new(graph),
            end: HEADER_BYTES + DELIM_BYTES,
        };

        if len == 0 {
            let mut w = WordWriter::new(Vec::with_capacity((HEADER_BYTES + DELIM_BYTES) as usize));
            let header = log.header.encode()?;
            w.get_mut().extend_from_slice(&header);
            w.write_words(&VPROP_DELIM)?;
            log.write_at(0, &w.into_inner())?;
            log.store_header()?;
            tracing::info!("Created virtual property file {}", path.display());
        } else {
            if len < HEADER_BYTES + DELIM_BYTES {
                return Err(Error::corruption(format!(
                    "Virtual property file {} too short ({} bytes)",
                    path.display(),
                    len
                )));
            }
            let mut buf = vec![0u8; HEADER_BYTES as usize];
            log.read_at(0, &mut buf)?;
            let header = VpropHeader::decode(&buf)?;
            if header.graph != graph {
                return Err(Error::corruption(format!(
                    "Virtual properties graph mismatch: file {} belongs to {}, expected {}",
                    path.display(),
                    header.graph,
                    graph
                )));
            }
            let end = header.commit + DELIM_BYTES;
            if len < end {
                return Err(Error::corruption(format!(
                    "Virtual property commit {} beyond end of file ({} bytes)",
                    header.commit, len
                )));
            }
            let mut delim = [0u8; DELIM_BYTES as usize];
            log.read_at(header.commit, &mut delim)?;
            let lo = u64::from_le_bytes(delim[..8].try_into().unwrap_or_default());
            let hi = u64::from_le_bytes(delim[8..].try_into().unwrap_or_default());
            if [lo, hi] != VPROP_DELIM {
                return Err(Error::corruption(format!(
                    "Virtual property delimiter missing at commit offset {}",
                    header.commit
                )));
            }
            if len > end {
                log.file()?.set_len(end).fs_context("truncate", path)?;
                // The first uncommitted record overwrote the tail delimiter
                // with its own leading delimiter, so the tail is still valid.
                tracing::info!(
                    "Discarded {} uncommitted bytes from {}",
                    len - end,
                    path.display()
                );
            }
            log.header = header;
            log.end = end;
        }

        Ok(Self {
            graph,
            inner: Mutex::new(log),
            metrics: VpropMetrics::default(),
        })
    }

    /// Owning graph
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    /// Current file path
    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Commit watermark
    pub fn commit_watermark(&self) -> u64 {
        self.inner.lock().header.commit
    }

    /// Write a property value
    ///
    /// With `existing`, the previous record is rewritten in place when it is
    /// past the watermark and the new payload fits its allotment. Otherwise a
    /// new record is appended and the previous one erased.
    pub fn write(
        &self,
        vertex: u128,
        key: &str,
        value: &str,
        existing: Option<RecordRef>,
    ) -> Result<RecordRef> {
        let mut log = self.inner.lock();
        if let Some(prev) = existing {
            if prev.offset() >= log.header.commit {
                let head = log.read_head(prev)?;
                let needed = (words_for(key.len()) + words_for(value.len())) as u64;
                if !head.is_erased() && needed <= head.allotted {
                    let updated = RecordHead {
                        vertex,
                        allotted: head.allotted,
                        key_len: key.len() as u64,
                        value_len: value.len() as u64,
                        value_type: VALUE_TYPE_STRING,
                        attr: 0,
                    };
                    log.write_record(prev.offset(), &updated, key.as_bytes(), value.as_bytes(), false)?;
                    // Counted like any other write; only erasure decrements
                    log.header.bytes += value.len() as u64;
                    log.header.count += 1;
                    self.metrics.in_place_updates.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(offset = prev.offset(), bytes = value.len(), "vprop in-place update");
                    return Ok(prev);
                }
            }
        }

        let at = log.append(vertex, key, value)?;
        self.metrics.appends.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(offset = at.offset(), bytes = value.len(), "vprop append");
        if let Some(prev) = existing {
            if log.erase(prev)? {
                self.metrics.erased.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(at)
    }

    /// Read a property value
    pub fn read(&self, r: RecordRef) -> Result<String> {
        Ok(self.read_property(r)?.value)
    }

    /// Read a full record
    pub fn read_property(&self, r: RecordRef) -> Result<VirtualProperty> {
        let mut log = self.inner.lock();
        let head = log.read_head(r)?;
        if head.value_type != VALUE_TYPE_STRING {
            return Err(Error::corruption(format!(
                "Virtual property at offset {} is not a string (type {:#x})",
                r.offset(),
                head.value_type
            )));
        }
        let kw = words_for(head.key_len as usize);
        let vw = words_for(head.value_len as usize);
        if (kw + vw) as u64 > head.allotted {
            return Err(Error::corruption(format!(
                "Virtual property at offset {} exceeds its allotment",
                r.offset()
            )));
        }
        let mut buf = vec![0u8; (kw + vw) * WORD_SIZE];
        log.read_at(r.offset() + RECORD_HEAD_BYTES, &mut buf)?;
        drop(log);
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);

        let key_end = head.key_len as usize;
        let value_start = kw * WORD_SIZE;
        let value_end = value_start + head.value_len as usize;
        let key = String::from_utf8(buf[..key_end].to_vec())
            .map_err(|e| Error::corruption(format!("Virtual property key: {}", e)))?;
        let value = String::from_utf8(buf[value_start..value_end].to_vec())
            .map_err(|e| Error::corruption(format!("Virtual property value: {}", e)))?;
        Ok(VirtualProperty {
            vertex: head.vertex,
            key,
            value,
        })
    }

    /// True if the record has been erased
    pub fn is_erased(&self, r: RecordRef) -> Result<bool> {
        Ok(self.inner.lock().read_head(r)?.is_erased())
    }

    /// Erase a record
    ///
    /// Sealed records (before the watermark) are left intact on disk; only the
    /// counters are adjusted.
    pub fn erase(&self, r: RecordRef) -> Result<()> {
        if self.inner.lock().erase(r)? {
            self.metrics.erased.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Advance the commit watermark to end of data and persist the header
    pub fn commit(&self) -> Result<u64> {
        let mut log = self.inner.lock();
        let point = log.tail();
        if point < log.header.commit {
            return Err(Error::corruption(format!(
                "Failed to commit virtual properties: commit point {} before watermark {}",
                point, log.header.commit
            )));
        }
        log.header.commit = point;
        log.store_header()?;
        self.metrics.commits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Committed virtual properties at {} ({} records, {} bytes)",
            point,
            log.header.count,
            log.header.bytes
        );
        Ok(point)
    }

    /// Close the file handle; the log must be reopened before further use
    pub fn close(&self) {
        self.inner.lock().file = None;
    }

    /// Point the log at a file that was moved externally
    pub fn reopen_at(&self, path: &Path) -> Result<()> {
        let mut log = self.inner.lock();
        log.file = None;
        let file = open_rw(path, false)?;
        let len = file.metadata().fs_context("stat", path)?.len();
        if len < log.end {
            return Err(Error::corruption(format!(
                "Virtual property file {} shorter than expected ({} < {})",
                path.display(),
                len,
                log.end
            )));
        }
        log.file = Some(file);
        log.path = path.to_path_buf();
        Ok(())
    }

    /// Move the file to `path` and reopen it there
    pub fn move_to(&self, path: &Path) -> Result<()> {
        let mut log = self.inner.lock();
        log.file = None;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).fs_context("create_dir", parent)?;
        }
        let from = log.path.clone();
        std::fs::rename(&from, path).fs_context("rename", &from)?;
        log.file = Some(open_rw(path, false)?);
        log.path = path.to_path_buf();
        tracing::debug!("Moved virtual property file {} -> {}", from.display(), path.display());
        Ok(())
    }

    /// Counters and header state
    pub fn stats(&self) -> VpropStats {
        let log = self.inner.lock();
        VpropStats {
            appends: self.metrics.appends.load(Ordering::Relaxed),
            in_place_updates: self.metrics.in_place_updates.load(Ordering::Relaxed),
            erased: self.metrics.erased.load(Ordering::Relaxed),
            reads: self.metrics.reads.load(Ordering::Relaxed),
            commits: self.metrics.commits.load(Ordering::Relaxed),
            commit: log.header.commit,
            bytes: log.header.bytes,
            count: log.header.count,
            file_len: log.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testing::TestContext;
    use proptest::prelude::*;

    const G: GraphId = GraphId(0x1234_5678);

    fn open(ctx: &TestContext) -> VirtualPropertyLog {
        VirtualPropertyLog::open(&ctx.path().join("property/virtual/g.0.dat"), G).unwrap()
    }

    #[test]
    fn test_new_file_layout() {
        let ctx = TestContext::new();
        let log = open(&ctx);
        let len = std::fs::metadata(log.path()).unwrap().len();
        assert_eq!(len, HEADER_BYTES + DELIM_BYTES);
        assert_eq!(log.commit_watermark(), HEADER_BYTES);
    }

    #[test]
    fn test_write_read() {
        let ctx = TestContext::new();
        let log = open(&ctx);
        let value = "x".repeat(1000);
        let r = log.write(7, "description", &value, None).unwrap();
        assert_eq!(r.offset(), HEADER_BYTES);
        assert_eq!(log.read(r).unwrap(), value);
        let prop = log.read_property(r).unwrap();
        assert_eq!(prop.vertex, 7);
        assert_eq!(prop.key, "description");

        let r2 = log.write(8, "k", "second", None).unwrap();
        assert!(r2.offset() > r.offset());
        let stats = log.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.bytes, 1006);
    }

    #[test]
    fn test_in_place_update_keeps_offset() {
        let ctx = TestContext::new();
        let log = open(&ctx);
        let r = log.write(1, "k", &"a".repeat(40), None).unwrap();
        // 40 bytes -> 5 words + 2 padding words; 56 bytes still fits
        let r2 = log.write(1, "k", &"b".repeat(56), Some(r)).unwrap();
        assert_eq!(r2, r);
        assert_eq!(log.read(r).unwrap(), "b".repeat(56));
        assert_eq!(log.stats().in_place_updates, 1);
    }

    #[test]
    fn test_in_place_update_counts_as_write() {
        let ctx = TestContext::new();
        let log = open(&ctx);
        let r = log.write(1, "k", &"a".repeat(40), None).unwrap();
        let before = log.stats();
        assert_eq!((before.count, before.bytes), (1, 40));

        log.write(1, "k", &"b".repeat(16), Some(r)).unwrap();
        let after = log.stats();
        assert_eq!(after.in_place_updates, 1);
        assert_eq!(after.appends, 1);
        assert_eq!((after.count, after.bytes), (2, 56));

        // Committing persists the counters with the header
        log.commit().unwrap();
        drop(log);
        let log = VirtualPropertyLog::open(&ctx.path().join("property/virtual/g.0.dat"), G).unwrap();
        assert_eq!(log.stats().count, 2);
    }

    #[test]
    fn test_larger_value_moves_and_erases_old() {
        let ctx = TestContext::new();
        let log = open(&ctx);
        let r = log.write(1, "k", &"a".repeat(40), None).unwrap();
        let r2 = log.write(1, "k", &"b".repeat(200), Some(r)).unwrap();
        assert_ne!(r2, r);
        assert!(log.is_erased(r).unwrap());
        assert_eq!(log.read(r).unwrap_err().kind(), ErrorKind::Corruption);
        assert_eq!(log.read(r2).unwrap(), "b".repeat(200));
        assert_eq!(log.stats().count, 1);
    }

    #[test]
    fn test_sealed_record_is_not_rewritten() {
        let ctx = TestContext::new();
        let log = open(&ctx);
        let r = log.write(1, "k", "original value", None).unwrap();
        log.commit().unwrap();
        let r2 = log.write(1, "k", "tiny", Some(r)).unwrap();
        assert_ne!(r2, r);
        // Sealed records stay intact until a full rewrite
        assert!(!log.is_erased(r).unwrap());
        assert_eq!(log.read(r).unwrap(), "original value");
        assert_eq!(log.read(r2).unwrap(), "tiny");
        assert_eq!(log.stats().count, 1);
    }

    #[test]
    fn test_reopen_discards_uncommitted() {
        let ctx = TestContext::new();
        let path = ctx.path().join("property/virtual/g.0.dat");
        let (committed, pending) = {
            let log = VirtualPropertyLog::open(&path, G).unwrap();
            let a = log.write(1, "k", "kept", None).unwrap();
            log.commit().unwrap();
            let b = log.write(2, "k", "lost", None).unwrap();
            (a, b)
        };
        let log = VirtualPropertyLog::open(&path, G).unwrap();
        assert_eq!(log.read(committed).unwrap(), "kept");
        assert!(log.read(pending).is_err());
        assert_eq!(log.stats().count, 1);
        // Appends continue at the old tail
        let c = log.write(3, "k", "new", None).unwrap();
        assert_eq!(c, pending);
    }

    #[test]
    fn test_graph_mismatch() {
        let ctx = TestContext::new();
        let path = ctx.path().join("v.dat");
        drop(VirtualPropertyLog::open(&path, G).unwrap());
        let err = VirtualPropertyLog::open(&path, GraphId(99)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert!(err.to_string().contains("Virtual properties graph mismatch"));
    }

    #[test]
    fn test_misaligned_read_is_corruption() {
        let ctx = TestContext::new();
        let log = open(&ctx);
        let r = log.write(1, "key", &"v".repeat(300), None).unwrap();
        let inside = RecordRef::new(r.offset() + 64).unwrap();
        assert_eq!(log.read(inside).unwrap_err().kind(), ErrorKind::Corruption);
        let beyond = RecordRef::new(r.offset() + (1 << 20)).unwrap();
        assert_eq!(log.read(beyond).unwrap_err().kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_move_to() {
        let ctx = TestContext::new();
        let log = open(&ctx);
        let r = log.write(1, "k", "moving", None).unwrap();
        log.commit().unwrap();
        let target = ctx.path().join("elsewhere/g.0.dat");
        log.move_to(&target).unwrap();
        assert_eq!(log.path(), target);
        assert_eq!(log.read(r).unwrap(), "moving");
        log.close();
        assert_eq!(log.read(r).unwrap_err().kind(), ErrorKind::State);
        log.reopen_at(&target).unwrap();
        assert_eq!(log.read(r).unwrap(), "moving");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_in_place_bound(first in 0usize..600, second in 0usize..800) {
            let ctx = TestContext::new();
            let log = open(&ctx);
            let r = log.write(1, "key", &"a".repeat(first), None).unwrap();
            let vw = words_for(first) as u64;
            let allotted = words_for(3) as u64 + vw + padding_words(vw);
            let fits = words_for(3) as u64 + words_for(second) as u64 <= allotted;

            let r2 = log.write(1, "key", &"b".repeat(second), Some(r)).unwrap();
            prop_assert_eq!(r2 == r, fits);
            prop_assert_eq!(log.read(r2).unwrap(), "b".repeat(second));
            if !fits {
                prop_assert!(log.is_erased(r).unwrap());
            }
        }
    }
}
