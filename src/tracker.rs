//! Tracking which pages of a document have finished human review.
//!
//! Each page gets its own [`PageRecord`]. Completion handlers flip one record
//! at a time, then read every record for the document to decide whether the
//! whole document is done. Nothing here holds a lock: each operation is safe
//! to repeat, and two handlers racing to the "all complete" state will both
//! see it. Callers deal with that by resuming idempotently, or by claiming
//! the document with [`PageCompletionTracker::claim_aggregation`].

use std::{collections::BTreeSet, error, fmt, sync::Arc};

use schemars::JsonSchema;

use crate::{prelude::*, stores::StateStore};

/// One reviewed page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    /// `{document_id}i{page_index}`.
    pub job_id: String,

    /// Token used to resume the workflow that is waiting on this page.
    pub callback_handle: String,

    /// The document this page belongs to.
    pub document_id: String,

    /// The file extension of the page artifacts, like `.png`.
    pub extension: String,

    /// How many pages the document had when this page was registered.
    pub total_pages: u32,

    /// Informational only.
    #[serde(default)]
    pub completed_pages: u32,

    /// Has a human finished reviewing this page?
    #[serde(default)]
    pub is_complete: bool,

    /// Where the page image lives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

/// Errors from [`PageCompletionTracker::mark_page_complete`].
#[derive(Debug)]
pub enum TrackerError {
    /// No page was ever registered for this job. We never create one.
    NotFound { job_id: String },

    /// The state store failed.
    Store(anyhow::Error),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::NotFound { job_id } => {
                write!(f, "no page record found for job {job_id:?}")
            }
            TrackerError::Store(err) => write!(f, "page record store failed: {err:#}"),
        }
    }
}

impl error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TrackerError::NotFound { .. } => None,
            TrackerError::Store(err) => Some(err.as_ref()),
        }
    }
}

/// The result of [`PageCompletionTracker::query_document_completion`].
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
pub struct DocumentCompletion {
    /// The document we looked at.
    pub document_id: String,

    /// Has every page been reviewed?
    pub complete: bool,

    /// Distinct handles to resume. Empty unless `complete`.
    pub callback_handles: BTreeSet<String>,

    /// The extension shared by the document's pages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,

    /// How many distinct pages are registered.
    pub page_count: usize,

    /// How many of them are complete.
    pub completed_count: usize,
}

/// Page-completion state machine, on top of a [`StateStore`].
#[derive(Clone)]
pub struct PageCompletionTracker {
    store: Arc<dyn StateStore>,
}

impl PageCompletionTracker {
    /// Create a tracker using `store`.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Register a page whose review is about to start.
    ///
    /// If any record already exists for `record.job_id`, this does nothing and
    /// returns `false`, so a redelivered request never resets a page.
    #[instrument(level = "debug", skip_all, fields(job_id = %record.job_id))]
    pub async fn register_page(&self, record: &PageRecord) -> Result<bool> {
        let existing = self.store.get_by_job_id(&record.job_id).await?;
        if !existing.is_empty() {
            debug!("Page already registered");
            return Ok(false);
        }
        let created = self.store.put_if_absent(record).await?;
        if created {
            debug!(document_id = %record.document_id, "Registered page");
        }
        Ok(created)
    }

    /// Every record for `job_id`, one per callback handle.
    pub async fn page_records(&self, job_id: &str) -> Result<Vec<PageRecord>> {
        self.store.get_by_job_id(job_id).await
    }

    /// Mark every record for `job_id` as complete.
    ///
    /// Marking an already-complete page does nothing.
    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    pub async fn mark_page_complete(&self, job_id: &str) -> Result<(), TrackerError> {
        let records = self
            .store
            .get_by_job_id(job_id)
            .await
            .map_err(TrackerError::Store)?;
        if records.is_empty() {
            return Err(TrackerError::NotFound {
                job_id: job_id.to_owned(),
            });
        }
        for record in records.iter().filter(|r| !r.is_complete) {
            let updated = self
                .store
                .mark_complete(job_id, &record.callback_handle)
                .await
                .map_err(TrackerError::Store)?;
            if !updated {
                warn!("Page record disappeared while marking it complete");
            }
        }
        debug!("Marked page complete");
        Ok(())
    }

    /// Check whether every page of `document_id` is complete.
    ///
    /// A document with no records is never complete. Neither is one with fewer
    /// distinct pages than its records declare in `total_pages`, since the
    /// missing pages may not have registered yet.
    #[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
    pub async fn query_document_completion(
        &self,
        document_id: &str,
    ) -> Result<DocumentCompletion> {
        let records = self.store.query_by_document(document_id).await?;

        let mut pages = BTreeSet::new();
        let mut completed_pages = BTreeSet::new();
        let mut declared_pages = 0;
        let mut extension: Option<&str> = None;
        for record in &records {
            pages.insert(record.job_id.as_str());
            if record.is_complete {
                completed_pages.insert(record.job_id.as_str());
            }
            declared_pages = declared_pages.max(record.total_pages);
            match extension {
                None => extension = Some(&record.extension),
                Some(ext) if ext != record.extension => warn!(
                    job_id = %record.job_id,
                    expected = ext,
                    found = %record.extension,
                    "Pages disagree about the document extension"
                ),
                Some(_) => {}
            }
        }

        let all_records_complete = records.iter().all(|r| r.is_complete);
        let declared_pages = usize::try_from(declared_pages).unwrap_or(usize::MAX);
        let complete =
            !records.is_empty() && all_records_complete && pages.len() >= declared_pages;
        let callback_handles = if complete {
            records.iter().map(|r| r.callback_handle.clone()).collect()
        } else {
            BTreeSet::new()
        };
        debug!(
            complete,
            pages = pages.len(),
            completed = completed_pages.len(),
            declared_pages,
            "Checked document completion"
        );

        Ok(DocumentCompletion {
            document_id: document_id.to_owned(),
            complete,
            callback_handles,
            extension: extension.map(ToOwned::to_owned),
            page_count: pages.len(),
            completed_count: completed_pages.len(),
        })
    }

    /// Try to become the one handler that aggregates `document_id`.
    #[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
    pub async fn claim_aggregation(&self, document_id: &str, owner: &str) -> Result<bool> {
        let claimed = self.store.claim_document(document_id, owner).await?;
        if !claimed {
            info!("Another handler already claimed this document");
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use crate::stores::memory::MemoryStore;

    use super::*;

    fn page(document_id: &str, page: u32, handle: &str, total_pages: u32) -> PageRecord {
        PageRecord {
            job_id: format!("{document_id}i{page}"),
            callback_handle: handle.to_owned(),
            document_id: document_id.to_owned(),
            extension: ".png".to_owned(),
            total_pages,
            completed_pages: 0,
            is_complete: false,
            image_path: Some(format!("wip/{document_id}/{page}.png")),
        }
    }

    fn tracker() -> (Arc<MemoryStore>, PageCompletionTracker) {
        let store = Arc::new(MemoryStore::default());
        (store.clone(), PageCompletionTracker::new(store))
    }

    #[tokio::test]
    async fn register_is_idempotent() -> Result<()> {
        let (store, tracker) = tracker();
        assert!(tracker.register_page(&page("doc", 0, "t1", 1)).await?);
        tracker.mark_page_complete("doci0").await?;

        // A redelivered registration, even with a new handle, changes nothing.
        assert!(!tracker.register_page(&page("doc", 0, "t2", 1)).await?);
        let records = store.get_by_job_id("doci0").await?;
        assert_eq!(records.len(), 1);
        assert!(records[0].is_complete);
        assert_eq!(records[0].callback_handle, "t1");
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_page_is_not_found() -> Result<()> {
        let (store, tracker) = tracker();
        let err = tracker.mark_page_complete("missingi0").await.unwrap_err();
        assert!(matches!(err, TrackerError::NotFound { ref job_id } if job_id == "missingi0"));
        assert!(store.get_by_job_id("missingi0").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn marking_twice_equals_marking_once() -> Result<()> {
        let (store, tracker) = tracker();
        tracker.register_page(&page("doc", 0, "t", 2)).await?;
        tracker.register_page(&page("doc", 1, "t", 2)).await?;

        tracker.mark_page_complete("doci0").await?;
        let once = store.query_by_document("doc").await?;
        tracker.mark_page_complete("doci0").await?;
        let twice = store.query_by_document("doc").await?;
        assert_eq!(once, twice);

        let first = tracker.query_document_completion("doc").await?;
        let second = tracker.query_document_completion("doc").await?;
        assert_eq!(first, second);
        assert!(!first.complete);
        assert_eq!(first.completed_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_document_is_not_complete() -> Result<()> {
        let (_store, tracker) = tracker();
        let completion = tracker.query_document_completion("nothing").await?;
        assert!(!completion.complete);
        assert!(completion.callback_handles.is_empty());
        assert_eq!(completion.extension, None);
        Ok(())
    }

    #[tokio::test]
    async fn shared_handles_are_deduplicated() -> Result<()> {
        let (_store, tracker) = tracker();
        for p in 0..3 {
            tracker.register_page(&page("shared", p, "one", 3)).await?;
            tracker.register_page(&page("distinct", p, &format!("h{p}"), 3)).await?;
        }
        for p in 0..3 {
            tracker.mark_page_complete(&format!("sharedi{p}")).await?;
            tracker.mark_page_complete(&format!("distincti{p}")).await?;
        }

        let shared = tracker.query_document_completion("shared").await?;
        assert!(shared.complete);
        assert_eq!(shared.callback_handles.len(), 1);
        assert_eq!(shared.extension.as_deref(), Some(".png"));

        let distinct = tracker.query_document_completion("distinct").await?;
        assert!(distinct.complete);
        assert_eq!(distinct.callback_handles.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn two_pages_complete_once_in_either_order() -> Result<()> {
        for order in [[0, 1], [1, 0]] {
            let (_store, tracker) = tracker();
            tracker.register_page(&page("doc", 0, "t", 2)).await?;
            tracker.register_page(&page("doc", 1, "t", 2)).await?;

            let mut transitions = 0;
            let mut was_complete = false;
            for p in order {
                tracker.mark_page_complete(&format!("doci{p}")).await?;
                let completion = tracker.query_document_completion("doc").await?;
                if completion.complete && !was_complete {
                    transitions += 1;
                }
                was_complete = completion.complete;
            }
            assert_eq!(transitions, 1, "order {order:?}");
            assert!(was_complete);
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_page_keeps_document_incomplete() -> Result<()> {
        let (_store, tracker) = tracker();
        // Page 1 of 2 never registers.
        tracker.register_page(&page("doc", 0, "t", 2)).await?;
        tracker.mark_page_complete("doci0").await?;
        for _ in 0..3 {
            let completion = tracker.query_document_completion("doc").await?;
            assert!(!completion.complete);
            assert!(completion.callback_handles.is_empty());
        }
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_completions_all_land() -> Result<()> {
        let (_store, tracker) = tracker();
        let pages = 8;
        for p in 0..pages {
            tracker.register_page(&page("doc", p, "t", pages)).await?;
        }
        let mut handles = vec![];
        for p in 0..pages {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.mark_page_complete(&format!("doci{p}")).await?;
                tracker.query_document_completion("doc").await
            }));
        }
        let mut saw_complete = 0;
        for handle in handles {
            if handle.await??.complete {
                saw_complete += 1;
            }
        }
        // At least the last writer sees completion. Others may, too.
        assert!(saw_complete >= 1);
        assert!(tracker.query_document_completion("doc").await?.complete);
        Ok(())
    }

    #[tokio::test]
    async fn only_one_claim_wins() -> Result<()> {
        let (_store, tracker) = tracker();
        assert!(tracker.claim_aggregation("doc", "a").await?);
        assert!(!tracker.claim_aggregation("doc", "b").await?);
        assert!(tracker.claim_aggregation("other", "b").await?);
        Ok(())
    }
}
