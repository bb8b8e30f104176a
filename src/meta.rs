//! File-backed metadata for runs and workers.
//!
//! Every document is a small JSON object stored one file per entity. All writes made by
//! this process go through one lock and land via write-to-temp-then-rename, so the
//! services never interleave a read-modify-write on the same path. Other processes
//! (the training job updating `step`) are not locked out.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{CoordError, Result};
use crate::protocol::ExperimentId;

pub const RUN_META: &str = "run.meta";
pub const RUN_SCRIPT: &str = "run.sh";
pub const EVAL_HISTORY: &str = "eval_res_hist.csv";

pub type Document = Map<String, Value>;

/// Persisted state of one experiment. Absent keys stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunMeta {
    pub status: Option<String>,
    pub step: Option<String>,
    pub machine: Option<String>,
}

impl RunMeta {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            status: doc.get("status").and_then(value_text),
            step: doc.get("step").and_then(value_text),
            machine: doc.get("machine").and_then(value_text),
        }
    }
}

/// Fields to overlay onto a run's metadata. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct RunMetaUpdate {
    pub status: Option<String>,
    pub step: Option<String>,
    pub machine: Option<String>,
}

impl RunMetaUpdate {
    fn into_document(self) -> Document {
        let mut doc = Document::new();
        for (key, value) in [
            ("status", self.status),
            ("step", self.step),
            ("machine", self.machine),
        ] {
            if let Some(v) = value {
                doc.insert(key.to_string(), Value::String(v));
            }
        }
        doc
    }
}

/// Latest resource snapshot of one worker. Always written whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMeta {
    pub cpu: String,
    pub mem: String,
    pub dsk: String,
    pub running_queuing: String,
    pub time: String,
}

/// Text form of a scalar: strings as-is, `null` as nothing, anything else as JSON text.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Outcome of clearing a run directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOutcome {
    pub removed: usize,
    pub kept: usize,
}

#[derive(Debug, Clone)]
pub struct MetaStore {
    runs_dir: PathBuf,
    workers_meta_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl MetaStore {
    pub fn new(runs_dir: impl Into<PathBuf>, workers_meta_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            workers_meta_dir: workers_meta_dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn run_dir(&self, exp: &ExperimentId) -> PathBuf {
        exp.run_dir(&self.runs_dir)
    }

    pub fn run_meta_path(&self, exp: &ExperimentId) -> PathBuf {
        self.run_dir(exp).join(RUN_META)
    }

    pub fn worker_meta_path(&self, host: &str) -> PathBuf {
        self.workers_meta_dir.join(format!("{}.meta", host))
    }

    /// Read a document. A missing file is `None`; a present but malformed file is an error.
    pub async fn read(&self, path: &Path) -> Result<Option<Document>> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice::<Document>(&raw)
            .map(Some)
            .map_err(|source| CoordError::MalformedMeta {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Overlay `fields` onto the document at `path`, creating it if absent.
    ///
    /// Keys not in `fields` are kept. Returns the document as written.
    pub async fn upsert(&self, path: &Path, fields: Document) -> Result<Document> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read(path).await?.unwrap_or_default();
        for (key, value) in fields {
            doc.insert(key, value);
        }
        write_atomic(path, &serde_json::to_vec(&doc)?).await?;
        Ok(doc)
    }

    /// Replace the document at `path` entirely.
    pub async fn overwrite<T: Serialize>(&self, path: &Path, doc: &T) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(path, &serde_json::to_vec(doc)?).await
    }

    pub async fn read_run_meta(&self, exp: &ExperimentId) -> Result<Option<RunMeta>> {
        let doc = self.read(&self.run_meta_path(exp)).await?;
        Ok(doc.as_ref().map(RunMeta::from_document))
    }

    pub async fn upsert_run_meta(&self, exp: &ExperimentId, update: RunMetaUpdate) -> Result<Document> {
        self.upsert(&self.run_meta_path(exp), update.into_document())
            .await
    }

    pub async fn write_worker_meta(&self, host: &str, meta: &WorkerMeta) -> Result<()> {
        self.overwrite(&self.worker_meta_path(host), meta).await
    }

    /// Write raw bytes to a file inside a run directory, creating the directory.
    pub async fn write_run_file(&self, exp: &ExperimentId, name: &str, contents: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.run_dir(exp).join(name), contents).await
    }

    /// Read a file from a run directory. A missing file reads as empty.
    pub async fn read_run_file(&self, exp: &ExperimentId, name: &str) -> Result<Vec<u8>> {
        match fs::read(self.run_dir(exp).join(name)).await {
            Ok(raw) => Ok(raw),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove everything in a run directory except a regular `run.sh` file.
    ///
    /// Subdirectories go in full. A missing directory has nothing to clear. A failure
    /// part-way leaves whatever was already removed removed.
    pub async fn clear_run(&self, exp: &ExperimentId) -> Result<ClearOutcome> {
        let _guard = self.write_lock.lock().await;
        let dir = self.run_dir(exp);
        let mut outcome = ClearOutcome { removed: 0, kept: 0 };

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(outcome),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if entry.file_name() == RUN_SCRIPT && file_type.is_file() {
                outcome.kept += 1;
                continue;
            }
            if file_type.is_dir() {
                fs::remove_dir_all(entry.path()).await?;
            } else {
                fs::remove_file(entry.path()).await?;
            }
            outcome.removed += 1;
        }
        Ok(outcome)
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    if let Err(e) = fs::write(&tmp, contents).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
