//! File-backed save store.
//!
//! Layout inside the store directory:
//! ```text
//! world.meta.json      - format version and integrity manifest
//! saves/
//!   <name>.wsav        - one save file per name, optionally zstd compressed
//!   <name>.wsav.<n>.tmp - in-flight write number n, renamed over <name>.wsav on commit
//! ```
//!
//! A save file body starts with the `WSAV` magic and a `u32` format version, followed by
//! whatever the host's write callback produced. The manifest records the SHA-256 of the
//! bytes as they sit on disk, so loads and [`SaveStore::verify_integrity`] fail closed on
//! any corruption.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::{BinaryReader, BinaryWriter};
use crate::config::PersistConfig;
use crate::error::{PersistError, Result};
use crate::queue::{PersistenceQueue, ScheduleOutcome, WriteTarget};

pub const SAVE_MAGIC: [u8; 4] = *b"WSAV";
pub const SAVE_FORMAT_VERSION: u32 = 1;
pub const STORE_SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "world.meta.json";
const SAVES_DIR: &str = "saves";
const SAVE_EXT: &str = "wsav";
const TMP_SUFFIX: &str = ".tmp";

/// One committed save file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
    pub compressed: bool,
}

/// Contents of `world.meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub schema_version: u32,
    pub save_format_version: u32,
    #[serde(default)]
    pub saves: BTreeMap<String, ManifestEntry>,
}

impl Default for StoreMeta {
    fn default() -> Self {
        Self {
            schema_version: STORE_SCHEMA_VERSION,
            save_format_version: SAVE_FORMAT_VERSION,
            saves: BTreeMap::new(),
        }
    }
}

/// Save directory with an attached [`PersistenceQueue`].
#[derive(Debug)]
pub struct SaveStore {
    root: PathBuf,
    config: PersistConfig,
    queue: PersistenceQueue,
    meta: Arc<Mutex<StoreMeta>>,
    next_write: AtomicU64,
}

impl SaveStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, config: PersistConfig) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(SAVES_DIR))?;

        let meta_path = root.join(META_FILE);
        let meta = if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_reader(File::open(&meta_path)?)?;
            if meta.schema_version != STORE_SCHEMA_VERSION {
                return Err(PersistError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: STORE_SCHEMA_VERSION,
                });
            }
            meta
        } else {
            let meta = StoreMeta::default();
            write_meta(&meta_path, &meta)?;
            meta
        };

        remove_stale_temp_files(&root.join(SAVES_DIR))?;
        tracing::info!(root = %root.display(), saves = meta.saves.len(), "opened save store");

        Ok(Self {
            root,
            queue: PersistenceQueue::new(&config),
            config,
            meta: Arc::new(Mutex::new(meta)),
            next_write: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn queue(&self) -> &PersistenceQueue {
        &self.queue
    }

    pub fn meta(&self) -> StoreMeta {
        self.meta.lock().clone()
    }

    /// Names of all committed saves.
    pub fn saves(&self) -> Vec<String> {
        self.meta.lock().saves.keys().cloned().collect()
    }

    pub fn save_path(&self, name: &str) -> PathBuf {
        self.root.join(SAVES_DIR).join(format!("{name}.{SAVE_EXT}"))
    }

    /// Schedule a write of save `name`. The header is written before `write_fn` runs.
    ///
    /// The previous file under this name stays in place until the new one is fully
    /// written and synced. Overlapping saves of one name each write their own temp file;
    /// whichever commits last is the one on disk and in the manifest.
    pub fn save<F>(&self, name: &str, write_fn: F) -> Result<ScheduleOutcome>
    where
        F: FnOnce(&mut BinaryWriter<SaveWriter>) -> Result<()> + Send + 'static,
    {
        validate_name(name)?;
        let path = self.save_path(name);
        let write_no = self.next_write.fetch_add(1, Ordering::Relaxed);
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(format!(".{write_no}{TMP_SUFFIX}"));
        let target = FileTarget {
            name: name.to_string(),
            path,
            tmp_path: PathBuf::from(tmp_path),
            meta_path: self.root.join(META_FILE),
            compression_level: self.config.compression_level,
            meta: Arc::clone(&self.meta),
        };
        Ok(self.queue.schedule_write(target, move |w| {
            w.write_bytes(&SAVE_MAGIC)?;
            w.write_u32(SAVE_FORMAT_VERSION)?;
            write_fn(w)
        }))
    }

    /// Load save `name`, handing `read_fn` a reader positioned after the header.
    pub fn load<T, F>(&self, name: &str, read_fn: F) -> Result<T>
    where
        F: FnOnce(&mut BinaryReader<Cursor<Vec<u8>>>) -> Result<T>,
    {
        let entry = self
            .meta
            .lock()
            .saves
            .get(name)
            .cloned()
            .ok_or_else(|| PersistError::NotFound(name.to_string()))?;

        let raw = std::fs::read(self.save_path(name))?;
        check_hash(&entry, &raw)?;

        let body = if entry.compressed {
            zstd::decode_all(raw.as_slice())?
        } else {
            raw
        };

        let mut reader = BinaryReader::with_chunk_size(Cursor::new(body), self.config.block_chunk_size);
        if reader.read_bytes(SAVE_MAGIC.len() as u64)? != SAVE_MAGIC {
            return Err(PersistError::BadMagic);
        }
        let version = reader.read_u32()?;
        if version != SAVE_FORMAT_VERSION {
            return Err(PersistError::SchemaMismatch {
                file_version: version,
                expected_version: SAVE_FORMAT_VERSION,
            });
        }
        tracing::debug!(name, bytes = entry.bytes, "loading save");
        read_fn(&mut reader)
    }

    /// Re-hash every save in the manifest. Returns how many were checked.
    pub fn verify_integrity(&self) -> Result<usize> {
        let entries: Vec<ManifestEntry> = self.meta.lock().saves.values().cloned().collect();
        for entry in &entries {
            let data = std::fs::read(self.root.join(SAVES_DIR).join(&entry.filename))?;
            check_hash(entry, &data)?;
        }
        Ok(entries.len())
    }

    /// Wait for all scheduled saves to finish.
    pub fn drain(&self) {
        self.queue.wait_for_drain();
    }

    /// Switch to synchronous saving and wait for in-flight saves.
    pub fn shutdown(&self) {
        self.queue.begin_shutdown();
        self.queue.wait_for_drain();
    }
}

/// Writer handed to save callbacks: the temp file, optionally behind a zstd encoder.
pub enum SaveWriter {
    Plain(HashingWriter<BufWriter<File>>),
    Compressed(zstd::Encoder<'static, HashingWriter<BufWriter<File>>>),
}

impl Write for SaveWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Compressed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Compressed(w) => w.flush(),
        }
    }
}

/// Hashes and counts everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct FileTarget {
    name: String,
    path: PathBuf,
    tmp_path: PathBuf,
    meta_path: PathBuf,
    compression_level: Option<i32>,
    meta: Arc<Mutex<StoreMeta>>,
}

impl WriteTarget for FileTarget {
    type Writer = SaveWriter;

    fn label(&self) -> String {
        self.name.clone()
    }

    fn open(&mut self) -> Result<SaveWriter> {
        let file = HashingWriter::new(BufWriter::new(File::create(&self.tmp_path)?));
        Ok(match self.compression_level {
            Some(level) => SaveWriter::Compressed(zstd::Encoder::new(file, level)?),
            None => SaveWriter::Plain(file),
        })
    }

    fn commit(self, writer: SaveWriter) -> Result<()> {
        let hashing = match writer {
            SaveWriter::Plain(w) => w,
            SaveWriter::Compressed(encoder) => encoder.finish()?,
        };
        let (buffered, sha256, bytes) = hashing.finish();
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        let filename = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        // File and manifest entry change together so they always describe the same commit.
        let mut meta = self.meta.lock();
        std::fs::rename(&self.tmp_path, &self.path)?;
        meta.saves.insert(
            self.name.clone(),
            ManifestEntry {
                filename,
                sha256,
                bytes,
                compressed: self.compression_level.is_some(),
            },
        );
        write_meta(&self.meta_path, &meta)?;
        tracing::info!(name = %self.name, bytes, "save committed");
        Ok(())
    }

    fn discard(self) {
        match std::fs::remove_file(&self.tmp_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.tmp_path.display(), error = %e, "failed to remove temp save"),
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PersistError::invalid(format!("invalid save name {name:?}")))
    }
}

fn check_hash(entry: &ManifestEntry, data: &[u8]) -> Result<()> {
    let actual = sha256_hex(data);
    if actual != entry.sha256 {
        tracing::error!(file = %entry.filename, expected = %entry.sha256, %actual, "save integrity check failed");
        return Err(PersistError::IntegrityMismatch {
            expected: entry.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

/// Rewrite the meta file through a temp file so a crash never leaves it half written.
fn write_meta(path: &Path, meta: &StoreMeta) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut file, meta)?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_stale_temp_files(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.to_string_lossy().ends_with(TMP_SUFFIX) {
            tracing::warn!(path = %path.display(), "removing interrupted save");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
