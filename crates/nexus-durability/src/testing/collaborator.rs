//! File-backed collaborator for snapshot tests

use crate::codec::{WordReader, WordWriter, words_for};
use crate::error::IoResultExt;
use crate::graph::Collaborator;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Collaborator holding byte items, persisted to `<dir>/<name>.dat`
///
/// A non-forced snapshot with no change since the last write leaves the file
/// untouched.
pub struct MemoryCollaborator {
    name: String,
    path: PathBuf,
    items: Mutex<Vec<Vec<u8>>>,
    dirty: AtomicBool,
    fail_next: AtomicBool,
}

impl MemoryCollaborator {
    /// Create an empty collaborator storing into `dir`
    pub fn new(name: &str, dir: impl AsRef<Path>) -> Self {
        Self {
            name: name.to_string(),
            path: dir.as_ref().join(format!("{}.dat", name)),
            items: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(true),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Replace the held items
    pub fn set_items(&self, items: Vec<Vec<u8>>) {
        *self.items.lock() = items;
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Held items
    pub fn items(&self) -> Vec<Vec<u8>> {
        self.items.lock().clone()
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the next `bulk_serialize` fail
    pub fn fail_next_serialize(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Collaborator for MemoryCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_used(&self) -> u64 {
        self.items.lock().iter().map(|i| i.len() as u64).sum()
    }

    fn item_count(&self) -> u64 {
        self.items.lock().len() as u64
    }

    fn bulk_serialize(&self, force: bool) -> Result<u64> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::state(format!("Injected failure in '{}'", self.name)));
        }
        if !force && !self.dirty.load(Ordering::SeqCst) && self.path.exists() {
            return Ok(0);
        }
        let items = self.items.lock().clone();
        let file = File::create(&self.path).fs_context("create", &self.path)?;
        let mut w = WordWriter::new(BufWriter::new(file));
        w.write_begin_file(&self.name)?;
        w.write_word(items.len() as u64)?;
        for item in &items {
            w.write_word(item.len() as u64)?;
            w.write_padded(item, words_for(item.len()))?;
        }
        w.write_end_file()?;
        w.flush()?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(w.words_written())
    }

    fn restore_objects(&self) -> Result<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let file = File::open(&self.path).fs_context("open", &self.path)?;
        let mut r = WordReader::new(BufReader::new(file));
        r.expect_begin_file(&self.name)?;
        let n = r.read_word()?;
        let mut items = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let len = r.read_word()? as usize;
            let mut bytes = r.read_padded(words_for(len))?;
            bytes.truncate(len);
            items.push(bytes);
        }
        r.expect_end_file()?;
        *self.items.lock() = items;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(r.words_read())
    }

    fn erase(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::fs("remove", &self.path, e)),
        }
    }
}
