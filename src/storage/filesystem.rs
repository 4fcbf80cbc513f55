use super::{DurableStore, StorageStats};
use crate::eviction::EvictionCandidate;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rocksdb::{Options, WriteBatch, DB};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const TOUCH_BATCH_SIZE: usize = 100;
const TOUCH_BATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-entry metadata kept in RocksDB.
///
/// Binary layout, little-endian:
/// - size: u64
/// - created_at: i64 (Unix millis)
/// - accessed_at: i64 (Unix millis)
/// - access_count: u64
#[derive(Debug, Clone)]
struct EntryMetadata {
    size: u64,
    created_at: i64,
    accessed_at: i64,
    access_count: u64,
}

impl EntryMetadata {
    const ENCODED_LEN: usize = 32;

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::ENCODED_LEN);
        bytes.extend_from_slice(&self.size.to_le_bytes());
        bytes.extend_from_slice(&self.created_at.to_le_bytes());
        bytes.extend_from_slice(&self.accessed_at.to_le_bytes());
        bytes.extend_from_slice(&self.access_count.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            anyhow::bail!(
                "Invalid metadata size: expected {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            );
        }

        Ok(Self {
            size: u64::from_le_bytes(bytes[0..8].try_into()?),
            created_at: i64::from_le_bytes(bytes[8..16].try_into()?),
            accessed_at: i64::from_le_bytes(bytes[16..24].try_into()?),
            access_count: u64::from_le_bytes(bytes[24..32].try_into()?),
        })
    }
}

#[derive(Debug, Clone)]
struct TouchMessage {
    id: Vec<u8>,
    timestamp: i64,
}

/// Durable cache entries on local disk.
///
/// Layout under the cache directory:
/// - `entries/ab/cd1234...`: serialized entries, sharded by the first key byte
/// - `metadata/`: RocksDB database with size and access tracking per entry
///
/// Reads hand access updates to a background worker that applies them to
/// RocksDB in batches, so a hit never waits on a metadata write.
pub struct FilesystemStore {
    root: PathBuf,
    entries_dir: PathBuf,
    db: Arc<DB>,
    touch_sender: Sender<TouchMessage>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FilesystemStore {
    /// Open (or create) a store rooted at `cache_dir`
    pub fn open<P: AsRef<Path>>(cache_dir: P) -> Result<Self> {
        let root = cache_dir.as_ref().to_path_buf();
        let entries_dir = root.join("entries");
        let db_path = root.join("metadata");

        fs::create_dir_all(&entries_dir).with_context(|| {
            format!(
                "Failed to create entries directory: {}",
                entries_dir.display()
            )
        })?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(2);
        opts.set_statistics_level(rocksdb::statistics::StatsLevel::DisableAll);

        let db = DB::open(&opts, &db_path)
            .with_context(|| format!("Failed to open metadata database: {}", db_path.display()))?;
        let db = Arc::new(db);

        let (touch_sender, touch_receiver) = bounded::<TouchMessage>(1000);
        let worker_db = Arc::clone(&db);
        let worker_handle = thread::Builder::new()
            .name("tscache-touch".to_string())
            .spawn(move || Self::touch_worker(worker_db, touch_receiver))
            .context("Failed to spawn access tracking worker")?;

        debug!("Opened durable store at {}", root.display());

        Ok(Self {
            root,
            entries_dir,
            db,
            touch_sender,
            worker_handle: Mutex::new(Some(worker_handle)),
        })
    }

    /// Directory the store lives in
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn touch_worker(db: Arc<DB>, receiver: Receiver<TouchMessage>) {
        let mut batch = Vec::with_capacity(TOUCH_BATCH_SIZE);

        loop {
            match receiver.recv_timeout(TOUCH_BATCH_TIMEOUT) {
                Ok(msg) => {
                    batch.push(msg);
                    while batch.len() < TOUCH_BATCH_SIZE {
                        match receiver.try_recv() {
                            Ok(msg) => batch.push(msg),
                            Err(_) => break,
                        }
                    }
                    Self::flush_touches(&db, &mut batch);
                }
                Err(RecvTimeoutError::Timeout) => Self::flush_touches(&db, &mut batch),
                Err(RecvTimeoutError::Disconnected) => {
                    Self::flush_touches(&db, &mut batch);
                    break;
                }
            }
        }
    }

    fn flush_touches(db: &DB, batch: &mut Vec<TouchMessage>) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = Self::batch_touch(db, batch) {
            debug!("Failed to batch update access tracking: {}", e);
        }
        batch.clear();
    }

    fn batch_touch(db: &DB, batch: &[TouchMessage]) -> Result<()> {
        let mut write_batch = WriteBatch::default();

        for msg in batch {
            // Entry may have been evicted since the read
            let Some(existing) = db.get(&msg.id)? else {
                continue;
            };
            if let Ok(mut metadata) = EntryMetadata::from_bytes(&existing) {
                metadata.accessed_at = metadata.accessed_at.max(msg.timestamp);
                metadata.access_count += 1;
                write_batch.put(&msg.id, metadata.to_bytes());
            }
        }

        db.write(write_batch)
            .context("Failed to write batch update")?;
        debug!("Batched {} access tracking updates", batch.len());

        Ok(())
    }

    /// Git-style sharding: first two hex chars as subdirectory
    fn id_to_path(&self, id: &[u8]) -> PathBuf {
        let hex_id = hex::encode(id);
        if hex_id.len() <= 2 {
            return self.entries_dir.join("_").join(hex_id);
        }
        let (prefix, suffix) = hex_id.split_at(2);
        self.entries_dir.join(prefix).join(suffix)
    }

    fn current_timestamp() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn read_metadata(&self, id: &[u8]) -> Result<Option<EntryMetadata>> {
        match self.db.get(id).context("Failed to read metadata")? {
            Some(bytes) => Ok(Some(EntryMetadata::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn touch(&self, id: &[u8]) {
        let msg = TouchMessage {
            id: id.to_vec(),
            timestamp: Self::current_timestamp(),
        };
        // A full channel drops the update; access tracking is advisory
        let _ = self.touch_sender.try_send(msg);
    }
}

impl Drop for FilesystemStore {
    fn drop(&mut self) {
        let handle = match self.worker_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            // Swap in a dead sender so the worker sees the channel close
            let sender = std::mem::replace(&mut self.touch_sender, bounded(0).0);
            drop(sender);
            let _ = handle.join();
        }

        if let Err(e) = self.db.flush() {
            warn!("Failed to flush metadata database on shutdown: {}", e);
        }
        self.db.cancel_all_background_work(true);
    }
}

impl DurableStore for FilesystemStore {
    fn put(&self, id: &[u8], data: &[u8]) -> Result<()> {
        let path = self.id_to_path(id);
        let parent = path
            .parent()
            .context("Entry path has no parent directory")?;
        fs::create_dir_all(parent).context("Failed to create shard directory")?;

        // Write to a temp file, then rename over the final path
        let temp_path = parent.join(format!(
            "{}.tmp.{}.{:?}",
            hex::encode(id),
            std::process::id(),
            thread::current().id()
        ));
        let mut file = fs::File::create(&temp_path).context("Failed to create temp file")?;
        file.write_all(data).context("Failed to write entry")?;
        file.sync_all().context("Failed to sync entry")?;
        fs::rename(&temp_path, &path).context("Failed to rename temp file")?;

        let now = Self::current_timestamp();
        let access_count = self
            .read_metadata(id)
            .ok()
            .flatten()
            .map(|m| m.access_count)
            .unwrap_or(0);

        let metadata = EntryMetadata {
            size: data.len() as u64,
            created_at: now,
            accessed_at: now,
            access_count,
        };
        self.db
            .put(id, metadata.to_bytes())
            .context("Failed to update metadata")?;

        Ok(())
    }

    fn get(&self, id: &[u8]) -> Result<Option<Vec<u8>>> {
        let path = self.id_to_path(id);

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read entry {}", path.display()))
            }
        };

        self.touch(id);
        Ok(Some(data))
    }

    fn exists(&self, id: &[u8]) -> Result<bool> {
        Ok(self.id_to_path(id).exists())
    }

    fn delete(&self, id: &[u8]) -> Result<()> {
        let path = self.id_to_path(id);

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to delete entry"),
        }

        self.db.delete(id).context("Failed to delete metadata")?;
        Ok(())
    }

    fn size(&self, id: &[u8]) -> Result<Option<u64>> {
        Ok(self.read_metadata(id)?.map(|m| m.size))
    }

    fn stats(&self) -> Result<StorageStats> {
        let mut total_objects = 0u64;
        let mut total_bytes = 0u64;

        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            if let Ok(metadata) = EntryMetadata::from_bytes(&value) {
                total_objects += 1;
                total_bytes += metadata.size;
            }
        }

        Ok(StorageStats {
            total_objects,
            total_bytes,
            location: Some(self.root.clone()),
        })
    }

    fn eviction_candidates(&self) -> Result<Vec<EvictionCandidate>> {
        let mut candidates = Vec::new();

        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            match EntryMetadata::from_bytes(&value) {
                Ok(metadata) => candidates.push(EvictionCandidate {
                    id: key.to_vec(),
                    size: metadata.size,
                    accessed_at: metadata.accessed_at,
                    access_count: metadata.access_count,
                    created_at: metadata.created_at,
                }),
                Err(e) => debug!("Skipping unreadable metadata: {}", e),
            }
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use tempfile::TempDir;

    #[test]
    fn test_filesystem_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemStore::open(temp_dir.path()).unwrap();

        let id = Fingerprint::of(b"hello");
        store.put(id.as_bytes(), b"hello world").unwrap();

        let data = store.get(id.as_bytes()).unwrap();
        assert_eq!(data, Some(b"hello world".to_vec()));
        assert!(store.exists(id.as_bytes()).unwrap());
        assert_eq!(store.size(id.as_bytes()).unwrap(), Some(11));

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_objects, 1);
        assert_eq!(stats.total_bytes, 11);
        assert_eq!(stats.location.as_deref(), Some(temp_dir.path()));

        store.delete(id.as_bytes()).unwrap();
        assert!(!store.exists(id.as_bytes()).unwrap());
        assert_eq!(store.get(id.as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_entries_are_sharded() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemStore::open(temp_dir.path()).unwrap();

        let id = Fingerprint::of(b"sharded");
        store.put(id.as_bytes(), b"x").unwrap();

        let hex_id = id.to_hex();
        let expected = temp_dir
            .path()
            .join("entries")
            .join(&hex_id[..2])
            .join(&hex_id[2..]);
        assert!(expected.exists());
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let temp_dir = TempDir::new().unwrap();
        let id = Fingerprint::of(b"persist");

        {
            let store = FilesystemStore::open(temp_dir.path()).unwrap();
            store.put(id.as_bytes(), b"compiled output").unwrap();
        }

        let store = FilesystemStore::open(temp_dir.path()).unwrap();
        assert_eq!(
            store.get(id.as_bytes()).unwrap(),
            Some(b"compiled output".to_vec())
        );
        let candidates = store.eviction_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].size, 15);
    }

    #[test]
    fn test_metadata_rejects_bad_length() {
        assert!(EntryMetadata::from_bytes(&[0u8; 7]).is_err());
    }
}
