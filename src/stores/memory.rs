//! In-memory implementations of every store, for tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
};

use super::{
    MessageQueue, ObjectStore, ObjectUri, QueueMessage, ResumeOutcome, ReviewService,
    ReviewStart, StateStore, WorkflowResumer,
};
use crate::{prelude::*, tracker::PageRecord};

/// Everything a test might want to inspect afterwards.
#[derive(Debug, Default)]
pub struct MemoryState {
    pub records: BTreeMap<(String, String), PageRecord>,
    pub claims: HashMap<String, String>,
    pub objects: BTreeMap<ObjectUri, Vec<u8>>,
    pub queue: Vec<QueueMessage>,
    pub receive_calls: usize,
    pub deleted_receipts: Vec<String>,
    pub resumed: Vec<(String, Value)>,
    pub reviews: Vec<(String, Value)>,
    pub started_reviews: HashSet<String>,
    pub used_handles: HashSet<String>,
}

/// A single in-memory store implementing all our service traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Lock our state. Panics if a previous test thread panicked.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock poisoned")
    }

    /// Store a JSON object.
    pub fn insert_json(&self, uri: &ObjectUri, value: &Value) {
        let body = serde_json::to_vec(value).expect("JSON should serialize");
        self.lock().objects.insert(uri.clone(), body);
    }

    /// Fetch a stored JSON object.
    pub fn json(&self, uri: &ObjectUri) -> Option<Value> {
        self.lock()
            .objects
            .get(uri)
            .map(|body| serde_json::from_slice(body).expect("stored object should be JSON"))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put_if_absent(&self, record: &PageRecord) -> Result<bool> {
        let key = (record.job_id.clone(), record.callback_handle.clone());
        let mut state = self.lock();
        if state.records.contains_key(&key) {
            return Ok(false);
        }
        state.records.insert(key, record.clone());
        Ok(true)
    }

    async fn get_by_job_id(&self, job_id: &str) -> Result<Vec<PageRecord>> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn mark_complete(&self, job_id: &str, callback_handle: &str) -> Result<bool> {
        let key = (job_id.to_owned(), callback_handle.to_owned());
        match self.lock().records.get_mut(&key) {
            Some(record) => {
                record.is_complete = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query_by_document(&self, document_id: &str) -> Result<Vec<PageRecord>> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn claim_document(&self, document_id: &str, owner: &str) -> Result<bool> {
        let mut state = self.lock();
        if state.claims.contains_key(document_id) {
            return Ok(false);
        }
        state
            .claims
            .insert(document_id.to_owned(), owner.to_owned());
        Ok(true)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, uri: &ObjectUri) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().objects.get(uri).cloned())
    }

    async fn put(&self, uri: &ObjectUri, body: Vec<u8>, _content_type: &str) -> Result<()> {
        self.lock().objects.insert(uri.clone(), body);
        Ok(())
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize> {
        let mut state = self.lock();
        let before = state.objects.len();
        state
            .objects
            .retain(|uri, _| !(uri.bucket == bucket && uri.key.starts_with(prefix)));
        Ok(before - state.objects.len())
    }
}

#[async_trait]
impl MessageQueue for MemoryStore {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let mut state = self.lock();
        state.receive_calls += 1;
        let count = max.min(state.queue.len());
        Ok(state.queue.drain(..count).collect())
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        self.lock().deleted_receipts.push(receipt.to_owned());
        Ok(())
    }
}

#[async_trait]
impl WorkflowResumer for MemoryStore {
    async fn resume(&self, handle: &str, output: &Value) -> Result<ResumeOutcome> {
        let mut state = self.lock();
        if !state.used_handles.insert(handle.to_owned()) {
            return Ok(ResumeOutcome::AlreadyResumed);
        }
        state.resumed.push((handle.to_owned(), output.clone()));
        Ok(ResumeOutcome::Resumed)
    }
}

#[async_trait]
impl ReviewService for MemoryStore {
    async fn start_review(&self, name: &str, input: &Value) -> Result<ReviewStart> {
        let mut state = self.lock();
        if !state.started_reviews.insert(name.to_owned()) {
            return Ok(ReviewStart::AlreadyStarted);
        }
        state.reviews.push((name.to_owned(), input.clone()));
        Ok(ReviewStart::Started)
    }
}
