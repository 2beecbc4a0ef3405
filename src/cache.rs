//! Content-addressed result cache.
//!
//! Each entry is one JSON file named after its SHA-256 key. The key covers
//! the task id, action text, verify command and the bytes of every input
//! file in declared order, so editing an input only misses for the tasks
//! that read it.
//!
//! A success also keeps the bytes of the task's produced file, so a hit can
//! put a deleted or modified output back before dependents read it.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::task::{Task, TaskId};
use crate::Result;

const KEY_DOMAIN: &[u8] = b"waverun-cache-v1";

/// Contents of one declared input file at lookup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: String,
    /// `None` when the file does not exist yet.
    pub bytes: Option<Vec<u8>>,
}

/// Read every input file of `task`, relative to `root`, in declared order.
pub fn read_input_bytes(root: &Path, task: &Task) -> Result<Vec<InputFile>> {
    task.input_files()
        .iter()
        .map(|path| {
            let bytes = match fs::read(root.join(path)) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            Ok(InputFile {
                path: path.clone(),
                bytes,
            })
        })
        .collect()
}

/// Hex SHA-256 digest identifying one (task definition, inputs) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(task: &Task, inputs: &[InputFile]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        update_field(&mut hasher, task.id.as_str().as_bytes());
        update_field(&mut hasher, task.action.as_bytes());
        update_field(&mut hasher, task.verify.as_bytes());
        hasher.update((inputs.len() as u64).to_le_bytes());
        for input in inputs {
            update_field(&mut hasher, input.path.as_bytes());
            match &input.bytes {
                Some(bytes) => {
                    hasher.update([1u8]);
                    update_field(&mut hasher, bytes);
                }
                None => hasher.update([0u8]),
            }
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length-prefix each field so adjacent fields cannot run together.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub task_id: TaskId,
    pub outcome: CacheOutcome,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    /// Produced file contents at store time.
    #[serde(default)]
    pub output: Option<Vec<u8>>,
}

impl CacheEntry {
    /// Whether replaying this entry leaves the task's produced file in place:
    /// either the entry carries its bytes or the file already exists.
    pub fn is_restorable(&self, root: &Path, task: &Task) -> bool {
        match task.produced_file() {
            Some(produced) => self.output.is_some() || root.join(produced).exists(),
            None => true,
        }
    }
}

/// Read the task's produced file, if it declares one and it exists.
pub fn read_output_bytes(root: &Path, task: &Task) -> Result<Option<Vec<u8>>> {
    let Some(produced) = task.produced_file() else {
        return Ok(None);
    };
    match fs::read(root.join(produced)) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write the cached output back when the file on disk is missing or differs.
///
/// Returns `false` when the output can't be put in place, in which case the
/// hit must not be replayed.
pub fn restore_output(root: &Path, task: &Task, entry: &CacheEntry) -> Result<bool> {
    let Some(produced) = task.produced_file() else {
        return Ok(true);
    };
    let path = root.join(produced);
    let Some(bytes) = &entry.output else {
        return Ok(path.exists());
    };
    if read_output_bytes(root, task)?.as_ref() == Some(bytes) {
        return Ok(true);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, bytes)?;
    debug!(task_id = %task.id, path = %path.display(), "produced file restored from cache");
    Ok(true)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// On-disk cache with an in-memory index.
///
/// Safe to share between workers; the index sits behind a mutex and every
/// entry file is written to a temp name and renamed into place.
pub struct CacheStore {
    dir: PathBuf,
    index: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl CacheStore {
    /// Open (creating if needed) the cache directory and load its entries.
    ///
    /// Unreadable entry files are skipped with a warning.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut index = HashMap::new();
        for path in entry_files(dir)? {
            match fs::read_to_string(&path)
                .map_err(crate::Error::from)
                .and_then(|s| serde_json::from_str::<CacheEntry>(&s).map_err(Into::into))
            {
                Ok(entry) => {
                    index.insert(entry.key.clone(), entry);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable cache entry"),
            }
        }
        debug!(dir = %dir.display(), entries = index.len(), "cache opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn lookup(&self, task: &Task, inputs: &[InputFile]) -> CacheLookup {
        let key = CacheKey::compute(task, inputs);
        match self.index().get(&key) {
            Some(entry) => {
                debug!(task_id = %task.id, key = %key, "cache hit");
                CacheLookup::Hit(entry.clone())
            }
            None => {
                debug!(task_id = %task.id, key = %key, "cache miss");
                CacheLookup::Miss
            }
        }
    }

    /// Persist an outcome for the task's current inputs.
    pub fn store(
        &self,
        task: &Task,
        inputs: &[InputFile],
        outcome: CacheOutcome,
        summary: &str,
    ) -> Result<CacheEntry> {
        self.store_with_output(task, inputs, outcome, summary, None)
    }

    /// Like [`CacheStore::store`], keeping the produced file's bytes.
    pub fn store_with_output(
        &self,
        task: &Task,
        inputs: &[InputFile],
        outcome: CacheOutcome,
        summary: &str,
        output: Option<Vec<u8>>,
    ) -> Result<CacheEntry> {
        let key = CacheKey::compute(task, inputs);
        let entry = CacheEntry {
            key: key.clone(),
            task_id: task.id.clone(),
            outcome,
            summary: summary.to_string(),
            created_at: Utc::now(),
            output,
        };

        let path = self.entry_path(&key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec_pretty(&entry)?)?;
        fs::rename(&tmp, &path)?;

        self.index().insert(key, entry.clone());
        debug!(task_id = %task.id, path = %path.display(), "cache entry stored");
        Ok(entry)
    }

    /// Remove every entry recorded for `task_id`. Returns how many went.
    pub fn invalidate(&self, task_id: &TaskId) -> Result<usize> {
        let mut index = self.index();
        let keys: Vec<CacheKey> = index
            .values()
            .filter(|e| &e.task_id == task_id)
            .map(|e| e.key.clone())
            .collect();
        for key in &keys {
            remove_if_present(&self.entry_path(key))?;
            index.remove(key);
        }
        Ok(keys.len())
    }

    /// Remove all entries. Returns how many files were deleted.
    pub fn clear(&self) -> Result<usize> {
        let mut index = self.index();
        let mut removed = 0;
        for path in entry_files(&self.dir)? {
            remove_if_present(&path)?;
            removed += 1;
        }
        index.clear();
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for path in entry_files(&self.dir)? {
            stats.entries += 1;
            stats.total_bytes += fs::metadata(&path)?.len();
        }
        Ok(stats)
    }

    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entry_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
