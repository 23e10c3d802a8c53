//! Page requests: store machine output, then start review or resume.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use serde_json::Map;

use super::{
    PageKey, WorkStatus, ai_output_key, job_id, output_extension, page_key_from_json,
    page_prefix, review_context_key,
};
use crate::{
    confidence::{ReviewInput, review_input_or_none},
    fields::{FieldDescriptor, StructureMap},
    prelude::*,
    stores::{
        MessageQueue, ObjectStore, ObjectUri, ResumeOutcome, ReviewService, ReviewStart,
        WorkflowResumer, write_json,
    },
    tracker::{PageCompletionTracker, PageRecord},
    ui::{ProgressConfig, Ui},
};

/// A request to process the pages of one document.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct PageRequest {
    /// The document ID.
    pub id: String,

    /// The bucket holding the document and its artifacts.
    pub bucket: String,

    /// The key of the original upload.
    pub key: String,

    /// The page being processed, when `image_keys` is absent. A number or a
    /// string of digits. Anything else means page 0.
    #[serde(default)]
    pub wip_key: Option<Value>,

    /// Every page to process.
    #[serde(default, alias = "multi_page_indices")]
    pub image_keys: Vec<PageKey>,

    /// The workflow's callback handle.
    pub token: String,

    /// What to send to the reviewer, or `"none"` if no review is needed.
    #[serde(
        default,
        alias = "review_input",
        deserialize_with = "review_input_or_none"
    )]
    pub a2iinput: Option<ReviewInput>,

    /// Set by confidence evaluation. A page that needs review is always
    /// reviewed, even when there is nothing to put in front of the reviewer
    /// but the page itself.
    #[serde(default)]
    pub needs_review: bool,

    /// The machine extraction output.
    #[serde(default)]
    pub inference_result: Option<Value>,

    /// Reviewable fields, from confidence evaluation.
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,

    /// The shape of the extraction result, from confidence evaluation.
    #[serde(default)]
    pub structure_map: StructureMap,
}

impl PageRequest {
    /// The pages this request covers, without duplicates.
    pub fn pages(&self) -> Vec<PageKey> {
        if !self.image_keys.is_empty() {
            return self
                .image_keys
                .iter()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
        }
        let page = self
            .wip_key
            .as_ref()
            .and_then(page_key_from_json)
            .unwrap_or(PageKey::Index(0));
        vec![page]
    }

    /// How many pages the document has, for completion tracking.
    pub fn total_pages(&self) -> u32 {
        u32::try_from(self.pages().len()).unwrap_or(u32::MAX).max(1)
    }

    /// What to send to the reviewer, if this request needs review.
    pub fn review_input(&self) -> Option<ReviewInput> {
        match &self.a2iinput {
            Some(input) => Some(input.clone()),
            None if self.needs_review => Some(ReviewInput {
                task_object: ObjectUri::new(&self.bucket, &self.key).to_string(),
                labels: vec![],
            }),
            None => None,
        }
    }
}

/// Everything a reviewer saw for one page, kept so their answers can be
/// applied to the right fields.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ReviewContext {
    pub document_id: String,
    pub page: u32,

    /// The fields on this page.
    pub fields: Vec<FieldDescriptor>,

    /// The shape of the whole extraction result.
    pub structure_map: StructureMap,
}

/// What we did with one page.
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageAction {
    ReviewStarted,
    ReviewAlreadyStarted,
    Resumed,
    AlreadyResumed,
}

/// The result of processing one page.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct PageOutcome {
    pub page: PageKey,
    pub job_id: String,

    /// Where this page's artifacts live.
    pub process_key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<PageAction>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The result of processing one [`PageRequest`].
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct PageRequestOutput {
    /// The document ID, if the request could be parsed.
    pub id: Value,

    pub status: WorkStatus,

    pub errors: Vec<String>,

    pub pages: Vec<PageOutcome>,
}

impl PageRequestOutput {
    fn new_failed(id: Value, error: String) -> Self {
        Self {
            id,
            status: WorkStatus::Failed,
            errors: vec![error],
            pages: vec![],
        }
    }
}

/// Processes page requests.
#[derive(Clone)]
pub struct PageProcessor {
    objects: Arc<dyn ObjectStore>,
    tracker: PageCompletionTracker,
    resumer: Arc<dyn WorkflowResumer>,
    reviews: Arc<dyn ReviewService>,
}

impl PageProcessor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        tracker: PageCompletionTracker,
        resumer: Arc<dyn WorkflowResumer>,
        reviews: Arc<dyn ReviewService>,
    ) -> Self {
        Self {
            objects,
            tracker,
            resumer,
            reviews,
        }
    }

    /// Process every page in `body`. Each page succeeds or fails on its own.
    #[instrument(level = "debug", skip_all, fields(id = ?body.get("id")))]
    pub async fn process_request(&self, body: &Value) -> PageRequestOutput {
        let id = body.get("id").cloned().unwrap_or(Value::Null);
        let request = match PageRequest::deserialize(body) {
            Ok(request) => request,
            Err(err) => {
                warn!("Invalid page request: {err}");
                return PageRequestOutput::new_failed(id, format!("invalid page request: {err}"));
            }
        };

        let extension = output_extension(&request.key);
        let mut pages = vec![];
        let mut errors = vec![];
        for page in request.pages() {
            let process_key = page_prefix(&request.id, page, &extension);
            let job_id = job_id(&request.id, page.number());
            let result = self
                .process_page(&request, body, page, &process_key, &job_id, &extension)
                .await;
            let (action, error) = match result {
                Ok(action) => (Some(action), None),
                Err(err) => {
                    let error = format!("page {page}: {err:#}");
                    error!(%job_id, "Failed to process page: {err:#}");
                    errors.push(error.clone());
                    (None, Some(error))
                }
            };
            pages.push(PageOutcome {
                page,
                job_id,
                process_key,
                action,
                error,
            });
        }

        let failed = errors.len();
        PageRequestOutput {
            id,
            status: WorkStatus::from_counts(pages.len() - failed, failed),
            errors,
            pages,
        }
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    async fn process_page(
        &self,
        request: &PageRequest,
        body: &Value,
        page: PageKey,
        process_key: &str,
        job_id: &str,
        extension: &str,
    ) -> Result<PageAction> {
        let page_uri = ObjectUri::new(&request.bucket, process_key);

        if let Some(inference_result) = &request.inference_result {
            let ai_uri = ObjectUri::new(&request.bucket, ai_output_key(process_key));
            write_json(self.objects.as_ref(), &ai_uri, inference_result).await?;
        } else {
            warn!("Request has no inference_result to store");
        }

        let Some(review_input) = request.review_input() else {
            let page_body = page_body(body, page, process_key, job_id, extension, &page_uri);
            let outcome = self.resumer.resume(&request.token, &page_body).await?;
            info!(?outcome, "No review needed, resumed workflow");
            return Ok(match outcome {
                ResumeOutcome::Resumed => PageAction::Resumed,
                ResumeOutcome::AlreadyResumed => PageAction::AlreadyResumed,
            });
        };

        let context = ReviewContext {
            document_id: request.id.clone(),
            page: page.number(),
            fields: request
                .fields
                .iter()
                .filter(|field| field.page == page.number())
                .cloned()
                .collect(),
            structure_map: request.structure_map.clone(),
        };
        let context_uri = ObjectUri::new(&request.bucket, review_context_key(process_key));
        write_json(self.objects.as_ref(), &context_uri, &context).await?;

        self.tracker
            .register_page(&PageRecord {
                job_id: job_id.to_owned(),
                callback_handle: request.token.clone(),
                document_id: request.id.clone(),
                extension: extension.to_owned(),
                total_pages: request.total_pages(),
                completed_pages: 0,
                is_complete: false,
                image_path: Some(process_key.to_owned()),
            })
            .await?;

        let page_input = review_input.for_page(page.number(), page_uri.to_string());
        debug!(labels = page_input.labels.len(), "Starting review");
        let page_input =
            serde_json::to_value(&page_input).context("failed to serialize review input")?;
        let started = self.reviews.start_review(job_id, &page_input).await?;
        info!(?started, "Sent page to review");
        Ok(match started {
            ReviewStart::Started => PageAction::ReviewStarted,
            ReviewStart::AlreadyStarted => PageAction::ReviewAlreadyStarted,
        })
    }
}

/// The request body, annotated with where this page's artifacts live.
fn page_body(
    body: &Value,
    page: PageKey,
    process_key: &str,
    job_id: &str,
    extension: &str,
    page_uri: &ObjectUri,
) -> Value {
    let mut page_body = body.as_object().cloned().unwrap_or_else(Map::new);
    let page_value = match page {
        PageKey::Index(page) => Value::from(page),
        PageKey::SingleImage => Value::from("single_image"),
    };
    page_body.insert("page".to_owned(), page_value);
    page_body.insert("process_key".to_owned(), Value::from(process_key));
    page_body.insert("human_loop_id".to_owned(), Value::from(job_id));
    page_body.insert("s3_location".to_owned(), Value::from(ai_output_key(process_key)));
    page_body.insert("extension".to_owned(), Value::from(extension));
    page_body.insert("input_s3_uri".to_owned(), Value::from(page_uri.to_string()));
    Value::Object(page_body)
}

/// How long to wait after a receive that returned nothing.
const EMPTY_RECEIVE_DELAY: Duration = Duration::from_secs(1);

/// Options for [`serve_pages`].
#[derive(Clone, Copy, Debug)]
pub struct ServeOpts {
    /// How many messages to process at once.
    pub jobs: usize,

    /// Stop as soon as a receive returns nothing.
    pub until_empty: bool,
}

/// Running totals for [`serve_pages`].
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
pub struct ServeSummary {
    pub received: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Receive and process page requests until the queue is empty (with
/// `until_empty`) or forever.
///
/// A message is only deleted once every one of its pages succeeded. Anything
/// else stays on the queue, which redelivers it once its visibility timeout
/// runs out.
#[instrument(level = "debug", skip_all)]
pub async fn serve_pages(
    ui: &Ui,
    queue: Arc<dyn MessageQueue>,
    processor: PageProcessor,
    opts: ServeOpts,
) -> Result<ServeSummary> {
    let jobs = opts.jobs.max(1);
    let mut summary = ServeSummary::default();
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "📨",
        msg: "Processing page requests",
        done_msg: "Processed page requests",
    });
    loop {
        let messages = queue.receive(jobs).await?;
        if messages.is_empty() {
            if opts.until_empty {
                break;
            }
            tokio::time::sleep(EMPTY_RECEIVE_DELAY).await;
            continue;
        }
        summary.received += messages.len();

        let results = stream::iter(messages)
            .map(|message| {
                let queue = queue.clone();
                let processor = processor.clone();
                async move {
                    let output = match serde_json::from_str::<Value>(&message.body) {
                        Ok(body) => processor.process_request(&body).await,
                        Err(err) => PageRequestOutput::new_failed(
                            Value::Null,
                            format!("message body is not JSON: {err}"),
                        ),
                    };
                    if output.status != WorkStatus::Ok {
                        warn!(
                            message_id = %message.id,
                            errors = ?output.errors,
                            "Leaving message for redelivery"
                        );
                        return false;
                    }
                    match queue.delete(&message.receipt).await {
                        Ok(()) => true,
                        Err(err) => {
                            error!(message_id = %message.id, "Failed to delete message: {err:#}");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(jobs)
            .collect::<Vec<bool>>()
            .await;

        let succeeded = results.iter().filter(|ok| **ok).count();
        summary.succeeded += succeeded;
        summary.failed += results.len() - succeeded;
        spinner.inc(u64::try_from(results.len()).unwrap_or(u64::MAX));
        debug!(?summary, "Processed batch");
    }
    spinner.finish_using_style();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        confidence::evaluate_artifact,
        stores::{QueueMessage, memory::MemoryStore, read_json},
    };

    fn processor(store: &Arc<MemoryStore>) -> PageProcessor {
        PageProcessor::new(
            store.clone(),
            PageCompletionTracker::new(store.clone()),
            store.clone(),
            store.clone(),
        )
    }

    fn review_request() -> Value {
        json!({
            "id": "doc",
            "bucket": "bucket",
            "key": "uploads/form.pdf",
            "wip_key": 0,
            "image_keys": [0, 1],
            "token": "handle-1",
            "inference_result": { "name": "Jane" },
            "a2iinput": {
                "taskObject": "s3://bucket/uploads/form.pdf",
                "labels": [
                    { "name": "name", "value": "Jane", "confidence": 0.5, "page": 0 },
                    { "name": "dob", "value": "2001", "confidence": 0.9, "page": 1 },
                ],
            },
            "fields": [
                {
                    "field_path": "name", "display_name": "name", "value": "Jane",
                    "confidence": 0.5, "page": 0, "path_components": { "root": "name" },
                },
                {
                    "field_path": "dob", "display_name": "dob", "value": "2001",
                    "confidence": 0.9, "page": 1, "path_components": { "root": "dob" },
                },
            ],
            "structure_map": {
                "section_count": 1,
                "roots": {
                    "name": { "section_idx": 0, "type": "simple" },
                    "dob": { "section_idx": 0, "type": "simple" },
                },
            },
        })
    }

    #[test]
    fn pages_default_to_wip_key() {
        let request: PageRequest = serde_json::from_value(json!({
            "id": "doc", "bucket": "b", "key": "k.png", "token": "t", "wip_key": "4",
            "a2iinput": "none",
        }))
        .unwrap();
        assert_eq!(request.pages(), vec![PageKey::Index(4)]);
        assert_eq!(request.total_pages(), 1);
        assert!(request.a2iinput.is_none());

        let request: PageRequest = serde_json::from_value(json!({
            "id": "doc", "bucket": "b", "key": "k.png", "token": "t", "wip_key": "x",
        }))
        .unwrap();
        assert_eq!(request.pages(), vec![PageKey::Index(0)]);
    }

    #[tokio::test]
    async fn review_pages_are_registered_and_sent_to_review() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        let output = processor(&store).process_request(&review_request()).await;
        assert_eq!(output.status, WorkStatus::Ok, "{:?}", output.errors);
        assert_eq!(output.pages.len(), 2);
        assert_eq!(output.pages[1].process_key, "wip/doc/1.png");
        assert_eq!(output.pages[1].action, Some(PageAction::ReviewStarted));

        let ai = ObjectUri::new("bucket", "wip/doc/1.png/ai/output.json");
        assert_eq!(store.json(&ai), Some(json!({ "name": "Jane" })));

        let context_uri = ObjectUri::new("bucket", "wip/doc/1.png/review/context.json");
        let context: ReviewContext = read_json(store.as_ref(), &context_uri).await?.unwrap();
        assert_eq!(context.page, 1);
        assert_eq!(context.fields.len(), 1);
        assert_eq!(context.fields[0].field_path, "dob");

        let state = store.lock();
        assert_eq!(state.records.len(), 2);
        assert!(state.records.values().all(|r| r.total_pages == 2 && r.extension == ".png"));
        let (name, input) = &state.reviews[1];
        assert_eq!(name, "doci1");
        assert_eq!(input["taskObject"], json!("s3://bucket/wip/doc/1.png"));
        assert_eq!(input["labels"].as_array().unwrap().len(), 1);
        assert_eq!(input["labels"][0]["name"], json!("dob"));
        assert_eq!(input["labels"][0]["page"], json!(0));
        assert!(state.resumed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn redelivered_requests_do_not_restart_reviews() {
        let store = Arc::new(MemoryStore::default());
        let processor = processor(&store);
        processor.process_request(&review_request()).await;
        let output = processor.process_request(&review_request()).await;
        assert_eq!(output.status, WorkStatus::Ok);
        assert!(
            output
                .pages
                .iter()
                .all(|p| p.action == Some(PageAction::ReviewAlreadyStarted))
        );
        assert_eq!(store.lock().records.len(), 2);
    }

    #[tokio::test]
    async fn confident_pages_resume_immediately() {
        let store = Arc::new(MemoryStore::default());
        let request = json!({
            "id": "doc", "bucket": "bucket", "key": "uploads/scan.JPG", "wip_key": 2,
            "token": "handle", "a2iinput": "none", "inference_result": { "a": 1 },
        });
        let output = processor(&store).process_request(&request).await;
        assert_eq!(output.status, WorkStatus::Ok);
        assert_eq!(output.pages[0].action, Some(PageAction::Resumed));

        let state = store.lock();
        assert!(state.records.is_empty());
        assert!(state.reviews.is_empty());
        let (handle, body) = &state.resumed[0];
        assert_eq!(handle, "handle");
        assert_eq!(body["process_key"], json!("wip/doc/2.jpg"));
        assert_eq!(body["human_loop_id"], json!("doci2"));
        assert_eq!(body["input_s3_uri"], json!("s3://bucket/wip/doc/2.jpg"));
        assert_eq!(body["inference_result"], json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn invalid_requests_fail_without_side_effects() {
        let store = Arc::new(MemoryStore::default());
        let output = processor(&store)
            .process_request(&json!({ "id": "doc" }))
            .await;
        assert_eq!(output.status, WorkStatus::Failed);
        assert_eq!(output.id, json!("doc"));
        assert!(store.lock().objects.is_empty());
    }

    #[tokio::test]
    async fn only_successful_messages_are_deleted() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        store.lock().queue = vec![
            QueueMessage {
                id: "1".to_owned(),
                body: review_request().to_string(),
                receipt: "r1".to_owned(),
            },
            QueueMessage {
                id: "2".to_owned(),
                body: "not json".to_owned(),
                receipt: "r2".to_owned(),
            },
        ];
        let summary = serve_pages(
            &Ui::init_for_tests(),
            store.clone(),
            processor(&store),
            ServeOpts {
                jobs: 4,
                until_empty: true,
            },
        )
        .await?;
        assert_eq!(summary.received, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.lock().deleted_receipts, vec!["r1".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn idle_servers_wait_between_receives() {
        let store = Arc::new(MemoryStore::default());
        let ui = Ui::init_for_tests();
        let serve = serve_pages(
            &ui,
            store.clone(),
            processor(&store),
            ServeOpts {
                jobs: 1,
                until_empty: false,
            },
        );
        let result = tokio::time::timeout(Duration::from_millis(200), serve).await;
        assert!(result.is_err(), "serving should run until stopped");
        let receives = store.lock().receive_calls;
        assert!((1..=2).contains(&receives), "received {receives} times");
    }

    #[test]
    fn duplicate_image_keys_count_once() {
        let request: PageRequest = serde_json::from_value(json!({
            "id": "doc", "bucket": "b", "key": "k.pdf", "token": "t",
            "image_keys": [1, 0, 1, "1"],
        }))
        .unwrap();
        assert_eq!(request.pages(), vec![PageKey::Index(0), PageKey::Index(1)]);
        assert_eq!(request.total_pages(), 2);
    }

    #[tokio::test]
    async fn duplicate_image_keys_still_complete() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        let mut request = review_request();
        request["image_keys"] = json!([0, 0]);
        let output = processor(&store).process_request(&request).await;
        assert_eq!(output.status, WorkStatus::Ok, "{:?}", output.errors);
        assert_eq!(output.pages.len(), 1);

        let tracker = PageCompletionTracker::new(store.clone());
        assert!(store.lock().records.values().all(|r| r.total_pages == 1));
        tracker.mark_page_complete("doci0").await?;
        let completion = tracker.query_document_completion("doc").await?;
        assert!(completion.complete);
        Ok(())
    }

    #[tokio::test]
    async fn failed_evaluations_still_go_to_review() -> Result<()> {
        let document = ObjectUri::new("bucket", "uploads/form.pdf");
        let artifact = json!({ "explainability_info": "garbage" });
        let evaluation = evaluate_artifact(&artifact, 0.9, 0, Some(&document));

        let mut request = serde_json::to_value(&evaluation)?;
        let body = request.as_object_mut().unwrap();
        body.insert("id".to_owned(), json!("doc"));
        body.insert("bucket".to_owned(), json!("bucket"));
        body.insert("key".to_owned(), json!("uploads/form.pdf"));
        body.insert("token".to_owned(), json!("handle"));

        let store = Arc::new(MemoryStore::default());
        let output = processor(&store).process_request(&request).await;
        assert_eq!(output.status, WorkStatus::Ok, "{:?}", output.errors);
        assert_eq!(output.pages[0].action, Some(PageAction::ReviewStarted));
        {
            let state = store.lock();
            assert!(state.resumed.is_empty());
            assert_eq!(state.records.len(), 1);
            assert_eq!(state.reviews[0].1["taskObject"], json!("s3://bucket/wip/doc/0.png"));
        }

        // Even without a payload, `needs_review` alone is enough.
        body_without_payload(&mut request);
        let store = Arc::new(MemoryStore::default());
        let output = processor(&store).process_request(&request).await;
        assert_eq!(output.pages[0].action, Some(PageAction::ReviewStarted));
        assert!(store.lock().resumed.is_empty());
        Ok(())
    }

    fn body_without_payload(request: &mut Value) {
        let body = request.as_object_mut().unwrap();
        body.remove("review_input");
        body.insert("a2iinput".to_owned(), json!("none"));
    }
}
