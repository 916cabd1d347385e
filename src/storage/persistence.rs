//! Journal + snapshot file store
//!
//! Writes land in an in-memory sorted map and a buffered journal. Nothing
//! is durable until `flush()`, which fsyncs the journal and, once enough
//! records have piled up, compacts them into a fresh snapshot.

use super::engine::PersistentStore;
use crate::core::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub const DEFAULT_CHECKPOINT_THRESHOLD: usize = 1000;
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Journal Records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    Put { key: String, value: Vec<u8> },
    Remove { key: String },
}

impl JournalRecord {
    fn apply(self, entries: &mut BTreeMap<String, Vec<u8>>) {
        match self {
            JournalRecord::Put { key, value } => {
                entries.insert(key, value);
            }
            JournalRecord::Remove { key } => {
                entries.remove(&key);
            }
        }
    }
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub entries: BTreeMap<String, Vec<u8>>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub entry_count: usize,
}

impl StoreSnapshot {
    pub fn new(entries: BTreeMap<String, Vec<u8>>) -> Self {
        let entry_count = entries.len();
        Self {
            version: SNAPSHOT_VERSION,
            entries,
            metadata: SnapshotMetadata {
                created_at: Utc::now(),
                entry_count,
            },
        }
    }
}

// ============================================================================
// Journal Writer
// ============================================================================

/// Outcome of reading a journal back.
pub struct JournalReplay {
    pub records: Vec<JournalRecord>,
    /// A trailing record was cut short (crash mid-append)
    pub torn_tail: bool,
}

/// Byte sink the journal appends frames to.
pub trait JournalSink: Write {
    /// Cuts the sink back to `len` bytes.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl JournalSink for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Length-prefixed (u32 LE) MessagePack frame for one record.
fn encode_frame(record: &JournalRecord) -> StoreResult<Vec<u8>> {
    let payload = rmp_serde::to_vec(record)
        .map_err(|e| StoreError::Codec(format!("Failed to serialize journal record: {}", e)))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Codec(format!("Journal record of {} bytes too large", payload.len())))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Appends one whole frame or none of it.
///
/// Small frames are only ever copied into the buffer. A frame too large for
/// the buffer goes straight to the sink, and a write that fails part way is
/// cut back to `committed`, the length of the complete frames before it.
fn append_frame<S: JournalSink>(
    writer: &mut BufWriter<S>,
    frame: &[u8],
    committed: u64,
) -> io::Result<()> {
    if frame.len() < writer.capacity() - writer.buffer().len() {
        return writer.write_all(frame);
    }
    writer.flush()?;
    if frame.len() < writer.capacity() {
        return writer.write_all(frame);
    }
    if let Err(err) = writer.get_mut().write_all(frame) {
        if let Err(cut) = writer.get_mut().truncate_to(committed) {
            warn!("could not cut torn journal frame: {}", cut);
        }
        return Err(err);
    }
    Ok(())
}

pub struct JournalWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    /// Bytes of complete frames, buffered or on disk
    committed: u64,
    records_since_checkpoint: usize,
}

impl JournalWriter {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Io(format!("Failed to open journal {}: {}", path.display(), e)))?;
        let committed = file
            .metadata()
            .map_err(|e| StoreError::Io(format!("Failed to stat journal {}: {}", path.display(), e)))?
            .len();
        Ok(Self {
            path,
            file: Some(BufWriter::new(file)),
            committed,
            records_since_checkpoint: 0,
        })
    }

    /// Buffered append; not durable until `sync`.
    pub fn append(&mut self, record: &JournalRecord) -> StoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Closed(self.path.display().to_string()))?;
        let frame = encode_frame(record)?;
        append_frame(file, &frame, self.committed)
            .map_err(|e| StoreError::Io(format!("Failed to write journal: {}", e)))?;
        self.committed += frame.len() as u64;
        self.records_since_checkpoint += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> StoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Closed(self.path.display().to_string()))?;
        file.flush()
            .map_err(|e| StoreError::Io(format!("Failed to flush journal: {}", e)))?;
        file.get_mut()
            .sync_all()
            .map_err(|e| StoreError::Io(format!("Failed to sync journal: {}", e)))?;
        Ok(())
    }

    pub fn read_all<P: AsRef<Path>>(path: P) -> StoreResult<JournalReplay> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(JournalReplay { records: Vec::new(), torn_tail: false });
        }
        let file = File::open(path)
            .map_err(|e| StoreError::Io(format!("Failed to open journal for reading: {}", e)))?;
        read_records(BufReader::new(file))
    }

    pub fn truncate(&mut self) -> StoreResult<()> {
        self.file = None;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| StoreError::Io(format!("Failed to truncate journal: {}", e)))?;
        file.sync_all()
            .map_err(|e| StoreError::Io(format!("Failed to sync truncated journal: {}", e)))?;
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::Io(format!("Failed to reopen journal: {}", e)))?;
        self.file = Some(BufWriter::new(file));
        self.committed = 0;
        self.records_since_checkpoint = 0;
        Ok(())
    }

    pub fn close(&mut self) -> StoreResult<()> {
        if self.file.is_some() {
            self.sync()?;
        }
        self.file = None;
        Ok(())
    }

    pub fn records_since_checkpoint(&self) -> usize {
        self.records_since_checkpoint
    }
}

/// Decodes frames until the end of `reader`.
fn read_records<R: Read>(mut reader: R) -> StoreResult<JournalReplay> {
    let mut records = Vec::new();
    let mut torn_tail = false;
    loop {
        let mut len_bytes = [0u8; 4];
        match read_fully(&mut reader, &mut len_bytes)? {
            ReadOutcome::Complete => {}
            ReadOutcome::Empty => break,
            ReadOutcome::Partial => {
                torn_tail = true;
                break;
            }
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut data = vec![0u8; len];
        match read_fully(&mut reader, &mut data)? {
            ReadOutcome::Complete => {}
            ReadOutcome::Empty | ReadOutcome::Partial => {
                torn_tail = true;
                break;
            }
        }
        let record: JournalRecord = rmp_serde::from_slice(&data)
            .map_err(|e| StoreError::Corrupt(format!("Failed to decode journal record: {}", e)))?;
        records.push(record);
    }
    Ok(JournalReplay { records, torn_tail })
}

enum ReadOutcome {
    Complete,
    Empty,
    Partial,
}

/// Like `read_exact`, but tells a clean end of file apart from a torn read.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> StoreResult<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::Io(format!("Failed to read journal: {}", e))),
        }
    }
    Ok(match filled {
        0 if !buf.is_empty() => ReadOutcome::Empty,
        n if n == buf.len() => ReadOutcome::Complete,
        _ => ReadOutcome::Partial,
    })
}

// ============================================================================
// Snapshot File
// ============================================================================

pub struct SnapshotFile {
    snapshot_path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Atomic replace: temp file in the same directory, fsync, rename.
    pub fn save(&self, snapshot: &StoreSnapshot) -> StoreResult<()> {
        let parent = self
            .snapshot_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)
            .map_err(|e| StoreError::Io(format!("Failed to create snapshot directory: {}", e)))?;
        let serialized = rmp_serde::to_vec(snapshot)
            .map_err(|e| StoreError::Codec(format!("Failed to serialize snapshot: {}", e)))?;
        let mut temp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| StoreError::Io(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| StoreError::Io(format!("Failed to write snapshot: {}", e)))?;
        temp.flush()
            .map_err(|e| StoreError::Io(format!("Failed to flush snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| StoreError::Io(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| StoreError::Io(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> StoreResult<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| StoreError::Io(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| StoreError::Io(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)
            .map_err(|e| StoreError::Corrupt(format!("Failed to decode snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn delete(&self) -> StoreResult<()> {
        if self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)
                .map_err(|e| StoreError::Io(format!("Failed to delete snapshot: {}", e)))?;
        }
        Ok(())
    }
}

// ============================================================================
// File Store
// ============================================================================

struct FileStoreState {
    entries: BTreeMap<String, Vec<u8>>,
    journal: JournalWriter,
    snapshot: SnapshotFile,
    checkpoint_threshold: usize,
}

impl FileStoreState {
    fn record(&mut self, record: JournalRecord) -> StoreResult<()> {
        self.journal.append(&record)?;
        record.apply(&mut self.entries);
        Ok(())
    }

    fn checkpoint(&mut self) -> StoreResult<()> {
        let snapshot = StoreSnapshot::new(self.entries.clone());
        self.snapshot.save(&snapshot)?;
        self.journal.truncate()
    }
}

/// Durable sorted store backed by `<dir>/<name>.snapshot` and `<dir>/<name>.journal`.
pub struct FileStore {
    name: String,
    state: Mutex<FileStoreState>,
    closed: AtomicBool,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(dir: P, name: &str) -> StoreResult<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StoreError::Io(format!("Invalid store name '{}'", name)));
        }
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("Failed to create store directory: {}", e)))?;
        let journal_path = dir.join(format!("{}.journal", name));
        let snapshot = SnapshotFile::new(dir.join(format!("{}.snapshot", name)));

        let mut entries = match snapshot.load()? {
            Some(loaded) => loaded.entries,
            None => BTreeMap::new(),
        };
        let replay = JournalWriter::read_all(&journal_path)?;
        let replayed = replay.records.len();
        for record in replay.records {
            record.apply(&mut entries);
        }

        let journal = JournalWriter::open(&journal_path)?;
        let mut state = FileStoreState {
            entries,
            journal,
            snapshot,
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
        };
        if replay.torn_tail {
            warn!(store = name, "journal ends in a torn record; compacting");
            state.checkpoint()?;
        }
        debug!(store = name, keys = state.entries.len(), replayed, "opened file store");

        Ok(Self {
            name: name.to_string(),
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_checkpoint_threshold(&self, threshold: usize) {
        self.state.lock().checkpoint_threshold = threshold.max(1);
    }

    /// Compact the journal into a new snapshot.
    pub fn checkpoint(&self) -> StoreResult<()> {
        self.check_open()?;
        self.state.lock().checkpoint()
    }

    pub fn journal_records(&self) -> usize {
        self.state.lock().journal.records_since_checkpoint()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.name.clone()));
        }
        Ok(())
    }
}

impl PersistentStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.state.lock().entries.get(key).cloned())
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(key) {
            return Ok(Some(existing.clone()));
        }
        state.record(JournalRecord::Put {
            key: key.to_string(),
            value,
        })?;
        Ok(None)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        let mut state = self.state.lock();
        let previous = state.entries.get(key).cloned();
        state.record(JournalRecord::Put {
            key: key.to_string(),
            value,
        })?;
        Ok(previous)
    }

    fn remove(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        let mut state = self.state.lock();
        let previous = state.entries.get(key).cloned();
        if previous.is_some() {
            state.record(JournalRecord::Remove { key: key.to_string() })?;
        }
        Ok(previous)
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        self.check_open()?;
        Ok(self.state.lock().entries.keys().cloned().collect())
    }

    fn len(&self) -> StoreResult<usize> {
        self.check_open()?;
        Ok(self.state.lock().entries.len())
    }

    fn flush(&self) -> StoreResult<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.journal.sync()?;
        if state.journal.records_since_checkpoint() >= state.checkpoint_threshold {
            state.checkpoint()?;
        }
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.entries.clear();
        state.snapshot.delete()?;
        state.journal.truncate()
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.journal.close()
    }
}
