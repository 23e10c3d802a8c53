//! A backend that keeps everything in a local directory.
//!
//! Layout under the root:
//!
//! - `objects/<bucket>/<key>`: object store.
//! - `records/<job>/<handle>.json`: page records.
//! - `claims/<document>.json`: aggregation claims.
//! - `queue/*.json`: pending messages. Received messages move to
//!   `queue/inflight/` until deleted. Any left there longer than the
//!   visibility timeout go back to `queue/` and are delivered again.
//! - `resumes/<handle>.json` and `reviews/<name>.json`: one marker per
//!   resumed workflow or started review.
//!
//! Identifiers are mapped to file names with UUIDv5, so they may contain any
//! characters. Creates use [`tempfile::NamedTempFile::persist_noclobber`], which
//! gives us an atomic create-if-absent with complete contents.

use std::{
    fs, io,
    io::Write as _,
    path::Component,
    time::{Duration, SystemTime},
};

use tempfile::NamedTempFile;
use tokio::task::spawn_blocking;
use uuid::Uuid;

use super::{
    MessageQueue, ObjectStore, ObjectUri, QueueMessage, ResumeOutcome, ReviewService,
    ReviewStart, StateStore, WorkflowResumer,
};
use crate::{prelude::*, tracker::PageRecord};

/// How long a received message stays hidden before it is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// All of our stores, backed by one directory.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    visibility_timeout: Duration,
}

impl LocalStore {
    /// Use `root`, which will be created as needed.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_owned(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// Redeliver received messages that haven't been deleted after `timeout`.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket.starts_with('.') {
            return Err(anyhow!("unsupported bucket name: {bucket:?}"));
        }
        Ok(self.root.join("objects").join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("unsupported object key: {key:?}"));
        }
        Ok(self.bucket_dir(bucket)?.join(relative))
    }

    fn record_dir(&self, job_id: &str) -> PathBuf {
        self.root.join("records").join(file_stem(job_id))
    }

    fn record_path(&self, job_id: &str, callback_handle: &str) -> PathBuf {
        self.record_dir(job_id)
            .join(format!("{}.json", file_stem(callback_handle)))
    }

    fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }
}

/// A stable file name for an arbitrary identifier.
fn file_stem(id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()).to_string()
}

/// Atomically create `path` with `body`. Returns `false` if it already exists.
async fn create_new(path: PathBuf, body: Vec<u8>) -> Result<bool> {
    spawn_blocking(move || -> Result<bool> {
        let tmp = temp_file_beside(&path, &body)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => {
                Err(err.error).with_context(|| format!("failed to create {path:?}"))
            }
        }
    })
    .await
    .context("file creation task panicked")?
}

/// Atomically replace `path` with `body`.
async fn replace(path: PathBuf, body: Vec<u8>) -> Result<()> {
    spawn_blocking(move || -> Result<()> {
        let tmp = temp_file_beside(&path, &body)?;
        tmp.persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to write {path:?}"))?;
        Ok(())
    })
    .await
    .context("file write task panicked")?
}

fn temp_file_beside(path: &Path, body: &[u8]) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {path:?}"))?;
    fs::create_dir_all(dir).with_context(|| format!("failed to create {dir:?}"))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in {dir:?}"))?;
    tmp.write_all(body)
        .with_context(|| format!("failed to write temporary file for {path:?}"))?;
    Ok(tmp)
}

/// Read a file, or `None` if it doesn't exist.
async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(body) => Ok(Some(body)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {path:?}")),
    }
}

/// List regular `*.json` files directly inside `dir`, sorted by name.
async fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err).with_context(|| format!("failed to list {dir:?}")),
    };
    let mut paths = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file()
            && path.extension().is_some_and(|ext| ext == "json")
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

async fn read_records(dir: &Path) -> Result<Vec<PageRecord>> {
    let mut records = vec![];
    for path in list_json_files(dir).await? {
        let body = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {path:?}"))?;
        let record = serde_json::from_slice(&body)
            .with_context(|| format!("failed to parse page record {path:?}"))?;
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl StateStore for LocalStore {
    async fn put_if_absent(&self, record: &PageRecord) -> Result<bool> {
        let body = serde_json::to_vec_pretty(record)?;
        create_new(
            self.record_path(&record.job_id, &record.callback_handle),
            body,
        )
        .await
    }

    async fn get_by_job_id(&self, job_id: &str) -> Result<Vec<PageRecord>> {
        read_records(&self.record_dir(job_id)).await
    }

    async fn mark_complete(&self, job_id: &str, callback_handle: &str) -> Result<bool> {
        let path = self.record_path(job_id, callback_handle);
        let Some(body) = read_optional(&path).await? else {
            return Ok(false);
        };
        let mut record: PageRecord = serde_json::from_slice(&body)
            .with_context(|| format!("failed to parse page record {path:?}"))?;
        if !record.is_complete {
            record.is_complete = true;
            replace(path, serde_json::to_vec_pretty(&record)?).await?;
        }
        Ok(true)
    }

    async fn query_by_document(&self, document_id: &str) -> Result<Vec<PageRecord>> {
        let records_dir = self.root.join("records");
        let mut entries = match tokio::fs::read_dir(&records_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {records_dir:?}"));
            }
        };
        let mut matching = vec![];
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            for record in read_records(&entry.path()).await? {
                if record.document_id == document_id {
                    matching.push(record);
                }
            }
        }
        Ok(matching)
    }

    async fn claim_document(&self, document_id: &str, owner: &str) -> Result<bool> {
        let path = self
            .root
            .join("claims")
            .join(format!("{}.json", file_stem(document_id)));
        let body = serde_json::to_vec_pretty(&serde_json::json!({
            "document_id": document_id,
            "owner": owner,
        }))?;
        create_new(path, body).await
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, uri: &ObjectUri) -> Result<Option<Vec<u8>>> {
        read_optional(&self.object_path(&uri.bucket, &uri.key)?).await
    }

    async fn put(&self, uri: &ObjectUri, body: Vec<u8>, _content_type: &str) -> Result<()> {
        replace(self.object_path(&uri.bucket, &uri.key)?, body).await
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let prefix = prefix.to_owned();
        spawn_blocking(move || delete_matching(&bucket_dir, &bucket_dir, &prefix))
            .await
            .context("delete task panicked")?
    }
}

/// Recursively delete files under `dir` whose bucket-relative key starts with
/// `prefix`.
fn delete_matching(bucket_dir: &Path, dir: &Path, prefix: &str) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("failed to list {dir:?}")),
    };
    let mut deleted = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            deleted += delete_matching(bucket_dir, &path, prefix)?;
            // Only succeeds if the directory is now empty.
            let _ = fs::remove_dir(&path);
            continue;
        }
        let key = path
            .strip_prefix(bucket_dir)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.starts_with(prefix) {
            fs::remove_file(&path).with_context(|| format!("failed to delete {path:?}"))?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

impl LocalStore {
    /// Move messages that have been in flight too long back to the queue.
    async fn requeue_expired(&self, inflight: &Path) -> Result<()> {
        for path in list_json_files(inflight).await? {
            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|metadata| metadata.modified())
                .with_context(|| format!("failed to check {path:?}"))?;
            let expired = modified
                .elapsed()
                .is_ok_and(|age| age >= self.visibility_timeout);
            let Some(name) = path.file_name() else {
                continue;
            };
            if expired {
                debug!(?path, "Redelivering message");
                tokio::fs::rename(&path, self.queue_dir().join(name))
                    .await
                    .with_context(|| format!("failed to requeue {path:?}"))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for LocalStore {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let inflight = self.queue_dir().join("inflight");
        tokio::fs::create_dir_all(&inflight)
            .await
            .with_context(|| format!("failed to create {inflight:?}"))?;
        self.requeue_expired(&inflight).await?;

        let mut messages = vec![];
        for path in list_json_files(&self.queue_dir()).await?.into_iter().take(max) {
            let Some(name) = path.file_name() else {
                continue;
            };
            let receipt = inflight.join(name);
            tokio::fs::rename(&path, &receipt)
                .await
                .with_context(|| format!("failed to receive {path:?}"))?;
            // The visibility timeout counts from now, not from when it was sent.
            tokio::fs::OpenOptions::new()
                .write(true)
                .open(&receipt)
                .await
                .with_context(|| format!("failed to open {receipt:?}"))?
                .into_std()
                .await
                .set_modified(SystemTime::now())
                .with_context(|| format!("failed to touch {receipt:?}"))?;
            let body = tokio::fs::read_to_string(&receipt)
                .await
                .with_context(|| format!("failed to read {receipt:?}"))?;
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            messages.push(QueueMessage {
                id,
                body,
                receipt: receipt.to_string_lossy().into_owned(),
            });
        }
        Ok(messages)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        match tokio::fs::remove_file(receipt).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete {receipt:?}")),
        }
    }
}

#[async_trait]
impl WorkflowResumer for LocalStore {
    async fn resume(&self, handle: &str, output: &Value) -> Result<ResumeOutcome> {
        let path = self
            .root
            .join("resumes")
            .join(format!("{}.json", file_stem(handle)));
        let body = serde_json::to_vec_pretty(&serde_json::json!({
            "callback_handle": handle,
            "output": output,
        }))?;
        if create_new(path, body).await? {
            Ok(ResumeOutcome::Resumed)
        } else {
            Ok(ResumeOutcome::AlreadyResumed)
        }
    }
}

#[async_trait]
impl ReviewService for LocalStore {
    async fn start_review(&self, name: &str, input: &Value) -> Result<ReviewStart> {
        let path = self
            .root
            .join("reviews")
            .join(format!("{}.json", file_stem(name)));
        let body = serde_json::to_vec_pretty(&serde_json::json!({
            "human_loop_name": name,
            "input": input,
        }))?;
        if create_new(path, body).await? {
            Ok(ReviewStart::Started)
        } else {
            Ok(ReviewStart::AlreadyStarted)
        }
    }
}
