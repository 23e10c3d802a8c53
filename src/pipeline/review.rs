//! Human review completion: store the answers, track the page, and resume the
//! workflow once the whole document has been reviewed.

use std::sync::Arc;

use schemars::JsonSchema;
use serde_json::Map;

use super::{
    PageKey, human_output_key, output_extension, page_prefix, pages::ReviewContext,
    parse_job_id, review_context_key,
};
use crate::{
    fields::{FieldDescriptor, StructureMap},
    prelude::*,
    stores::{ObjectStore, ObjectUri, ResumeOutcome, WorkflowResumer, read_json, write_json},
    tracker::PageCompletionTracker,
};

/// A review status-change event.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct HumanLoopEvent {
    pub detail: HumanLoopDetail,
}

#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HumanLoopDetail {
    pub human_loop_status: String,

    #[serde(default)]
    pub human_loop_name: Option<String>,

    #[serde(default)]
    pub human_loop_output: Option<HumanLoopOutputRef>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HumanLoopOutputRef {
    pub output_s3_uri: String,
}

/// The output document written by the review service.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanLoopOutput {
    pub human_loop_name: String,

    pub input_content: HumanLoopInputContent,

    #[serde(default)]
    pub human_answers: Vec<HumanAnswer>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanLoopInputContent {
    #[serde(default)]
    pub task_object: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanAnswer {
    #[serde(default)]
    pub answer_content: Map<String, Value>,
}

/// What we store for a reviewed page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct HumanPageOutput {
    pub job_id: String,
    pub document_id: String,
    pub page: u32,

    /// The reviewer's answers, exactly as submitted.
    pub answers: Map<String, Value>,

    /// The page's fields with the answers applied.
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,

    #[serde(default)]
    pub structure_map: StructureMap,
}

/// Apply a reviewer's answers to `fields`, matching answers by field path.
///
/// Answers may be bare values or `{"value": ...}` objects. Fields without an
/// answer keep their machine value. Confidence is left alone.
pub fn apply_answers(
    fields: &[FieldDescriptor],
    answers: &Map<String, Value>,
) -> Vec<FieldDescriptor> {
    fields
        .iter()
        .map(|field| {
            let mut field = field.clone();
            if let Some(answer) = answers.get(&field.field_path) {
                field.value = match answer {
                    Value::Object(obj) if obj.contains_key("value") => obj["value"].clone(),
                    other => other.clone(),
                };
            }
            field
        })
        .collect()
}

/// What [`HumanCompletionHandler::handle`] did.
#[derive(Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The event was not a completed review.
    Ignored,
    /// We recorded the page, but other pages are still in review.
    PageRecorded,
    /// Every page was reviewed, and we resumed the workflow.
    DocumentComplete,
    /// Every page was reviewed, but another handler is resuming the workflow.
    AlreadyClaimed,
}

/// The result of handling one review event.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct HumanCompletionOutput {
    pub status: CompletionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,

    /// Where we wrote the reviewed output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dest: Option<String>,

    /// Handles we resumed.
    pub resumed: usize,

    /// Handles someone else had already resumed.
    pub already_resumed: usize,
}

impl HumanCompletionOutput {
    fn ignored() -> Self {
        Self {
            status: CompletionStatus::Ignored,
            job_id: None,
            document_id: None,
            output_dest: None,
            resumed: 0,
            already_resumed: 0,
        }
    }
}

/// Handles completed human reviews.
#[derive(Clone)]
pub struct HumanCompletionHandler {
    objects: Arc<dyn ObjectStore>,
    tracker: PageCompletionTracker,
    resumer: Arc<dyn WorkflowResumer>,
    claim_aggregation: bool,
}

impl HumanCompletionHandler {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        tracker: PageCompletionTracker,
        resumer: Arc<dyn WorkflowResumer>,
        claim_aggregation: bool,
    ) -> Self {
        Self {
            objects,
            tracker,
            resumer,
            claim_aggregation,
        }
    }

    /// Handle one review event.
    ///
    /// Safe to call more than once for the same event: the output is simply
    /// rewritten, and workflows that were already resumed are skipped.
    #[instrument(level = "debug", skip_all)]
    pub async fn handle(&self, event: &HumanLoopEvent) -> Result<HumanCompletionOutput> {
        let detail = &event.detail;
        if detail.human_loop_status != "Completed" {
            debug!(status = %detail.human_loop_status, "Ignoring review event");
            return Ok(HumanCompletionOutput::ignored());
        }
        let output_ref = detail
            .human_loop_output
            .as_ref()
            .ok_or_else(|| anyhow!("completed review event has no humanLoopOutput"))?;
        let output_uri: ObjectUri = output_ref.output_s3_uri.parse()?;
        let review = read_json::<HumanLoopOutput>(self.objects.as_ref(), &output_uri)
            .await?
            .ok_or_else(|| anyhow!("review output not found: {output_uri}"))?;
        self.handle_output(&output_uri, &review).await
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %review.human_loop_name))]
    async fn handle_output(
        &self,
        output_uri: &ObjectUri,
        review: &HumanLoopOutput,
    ) -> Result<HumanCompletionOutput> {
        let job_id = review.human_loop_name.as_str();
        let (document_id, page) = parse_job_id(job_id)
            .ok_or_else(|| anyhow!("cannot parse review name {job_id:?}"))?;

        // Write the reviewed page next to its machine output.
        let task_object: Option<ObjectUri> = review.input_content.task_object.parse().ok();
        let extension = match self.tracker.page_records(job_id).await?.first() {
            Some(record) => record.extension.clone(),
            None => task_object
                .as_ref()
                .map(|uri| output_extension(&uri.key))
                .unwrap_or_default(),
        };
        let prefix = match &task_object {
            Some(uri) if uri.key.starts_with("wip/") => uri.key.clone(),
            _ => page_prefix(document_id, PageKey::Index(page), &extension),
        };
        let bucket = task_object
            .as_ref()
            .map(|uri| uri.bucket.clone())
            .unwrap_or_else(|| output_uri.bucket.clone());

        let context_uri = ObjectUri::new(&bucket, review_context_key(&prefix));
        let context = match read_json::<ReviewContext>(self.objects.as_ref(), &context_uri)
            .await?
        {
            Some(context) => context,
            None => {
                warn!(%context_uri, "No review context, storing answers only");
                ReviewContext::default()
            }
        };
        let answers = review
            .human_answers
            .first()
            .map(|answer| answer.answer_content.clone())
            .unwrap_or_default();
        let output = HumanPageOutput {
            job_id: job_id.to_owned(),
            document_id: document_id.to_owned(),
            page,
            fields: apply_answers(&context.fields, &answers),
            answers,
            structure_map: context.structure_map,
        };
        let output_dest = human_output_key(&prefix);
        write_json(
            self.objects.as_ref(),
            &ObjectUri::new(&bucket, &output_dest),
            &output,
        )
        .await?;
        info!(%output_dest, "Stored reviewed page");

        self.tracker.mark_page_complete(job_id).await?;
        let completion = self.tracker.query_document_completion(document_id).await?;
        let mut result = HumanCompletionOutput {
            status: CompletionStatus::PageRecorded,
            job_id: Some(job_id.to_owned()),
            document_id: Some(document_id.to_owned()),
            output_dest: Some(output_dest.clone()),
            resumed: 0,
            already_resumed: 0,
        };
        if !completion.complete {
            info!(
                completed = completion.completed_count,
                pages = completion.page_count,
                "Waiting for remaining pages"
            );
            return Ok(result);
        }

        if self.claim_aggregation && !self.tracker.claim_aggregation(document_id, job_id).await?
        {
            result.status = CompletionStatus::AlreadyClaimed;
            return Ok(result);
        }

        let resume_payload = serde_json::json!({
            "includes_human": "yes",
            "output_dest": output_dest,
            "bucket": output_uri.bucket,
            "id": document_id,
            "key": output_uri.key,
        });
        for handle in &completion.callback_handles {
            match self.resumer.resume(handle, &resume_payload).await? {
                ResumeOutcome::Resumed => result.resumed += 1,
                ResumeOutcome::AlreadyResumed => result.already_resumed += 1,
            }
        }
        info!(
            resumed = result.resumed,
            already_resumed = result.already_resumed,
            "All pages reviewed"
        );
        result.status = CompletionStatus::DocumentComplete;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        stores::memory::MemoryStore,
        tracker::{PageRecord, TrackerError},
    };

    fn field(path: &str, value: Value, page: u32) -> FieldDescriptor {
        serde_json::from_value(json!({
            "field_path": path,
            "display_name": path,
            "value": value,
            "confidence": 0.5,
            "page": page,
            "path_components": { "root": path },
        }))
        .unwrap()
    }

    async fn setup(store: &Arc<MemoryStore>, pages: u32, claim: bool) -> HumanCompletionHandler {
        let tracker = PageCompletionTracker::new(store.clone());
        for page in 0..pages {
            tracker
                .register_page(&PageRecord {
                    job_id: format!("doci{page}"),
                    callback_handle: "handle".to_owned(),
                    document_id: "doc".to_owned(),
                    extension: ".png".to_owned(),
                    total_pages: pages,
                    completed_pages: 0,
                    is_complete: false,
                    image_path: None,
                })
                .await
                .unwrap();
            store.insert_json(
                &ObjectUri::new("bucket", format!("wip/doc/{page}.png/review/context.json")),
                &serde_json::to_value(ReviewContext {
                    document_id: "doc".to_owned(),
                    page,
                    fields: vec![field("name", json!("Jnae"), page)],
                    structure_map: StructureMap::default(),
                })
                .unwrap(),
            );
            store.insert_json(
                &ObjectUri::new("bucket", format!("reviews/doci{page}/output.json")),
                &json!({
                    "humanLoopName": format!("doci{page}"),
                    "inputContent": { "taskObject": format!("s3://bucket/wip/doc/{page}.png") },
                    "humanAnswers": [{ "answerContent": { "name": { "value": "Jane" } } }],
                }),
            );
        }
        HumanCompletionHandler::new(store.clone(), tracker, store.clone(), claim)
    }

    fn event(page: u32) -> HumanLoopEvent {
        serde_json::from_value(json!({
            "detail": {
                "humanLoopStatus": "Completed",
                "humanLoopOutput": {
                    "outputS3Uri": format!("s3://bucket/reviews/doci{page}/output.json"),
                },
            },
        }))
        .unwrap()
    }

    #[test]
    fn answers_replace_values_by_path() {
        let fields = vec![field("a", json!("x"), 0), field("b", json!("y"), 0)];
        let mut answers = Map::new();
        answers.insert("a".to_owned(), json!({ "value": "X" }));
        answers.insert("b".to_owned(), json!(7));
        answers.insert("unknown".to_owned(), json!("z"));
        let applied = apply_answers(&fields, &answers);
        assert_eq!(applied[0].value, json!("X"));
        assert_eq!(applied[1].value, json!(7));
        assert_eq!(applied[1].confidence, 0.5);
    }

    #[tokio::test]
    async fn other_statuses_are_ignored() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        let handler = setup(&store, 1, false).await;
        let event: HumanLoopEvent = serde_json::from_value(json!({
            "detail": { "humanLoopStatus": "Stopped" },
        }))?;
        let output = handler.handle(&event).await?;
        assert_eq!(output.status, CompletionStatus::Ignored);
        assert!(store.lock().resumed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn document_resumes_after_last_page() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        let handler = setup(&store, 2, false).await;

        let first = handler.handle(&event(1)).await?;
        assert_eq!(first.status, CompletionStatus::PageRecorded);
        assert_eq!(first.output_dest.as_deref(), Some("wip/doc/1.png/human/output.json"));
        assert!(store.lock().resumed.is_empty());

        let stored = store
            .json(&ObjectUri::new("bucket", "wip/doc/1.png/human/output.json"))
            .unwrap();
        assert_eq!(stored["fields"][0]["value"], json!("Jane"));
        assert_eq!(stored["answers"]["name"], json!({ "value": "Jane" }));

        let second = handler.handle(&event(0)).await?;
        assert_eq!(second.status, CompletionStatus::DocumentComplete);
        assert_eq!(second.resumed, 1);

        let state = store.lock();
        assert_eq!(state.resumed.len(), 1);
        let (handle, payload) = &state.resumed[0];
        assert_eq!(handle, "handle");
        assert_eq!(
            payload,
            &json!({
                "includes_human": "yes",
                "output_dest": "wip/doc/0.png/human/output.json",
                "bucket": "bucket",
                "id": "doc",
                "key": "reviews/doci0/output.json",
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn redelivered_completions_resume_once() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        let handler = setup(&store, 1, false).await;
        let first = handler.handle(&event(0)).await?;
        let second = handler.handle(&event(0)).await?;
        assert_eq!(first.resumed, 1);
        assert_eq!(second.status, CompletionStatus::DocumentComplete);
        assert_eq!(second.already_resumed, 1);
        assert_eq!(store.lock().resumed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn claims_stop_duplicate_resumes() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        let handler = setup(&store, 1, true).await;
        handler.handle(&event(0)).await?;
        let second = handler.handle(&event(0)).await?;
        assert_eq!(second.status, CompletionStatus::AlreadyClaimed);
        assert_eq!(store.lock().resumed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_pages_are_reported() {
        let store = Arc::new(MemoryStore::default());
        let tracker = PageCompletionTracker::new(store.clone());
        let handler = HumanCompletionHandler::new(store.clone(), tracker, store.clone(), false);
        store.insert_json(
            &ObjectUri::new("bucket", "reviews/x/output.json"),
            &json!({
                "humanLoopName": "lostI3i0",
                "inputContent": { "taskObject": "s3://bucket/uploads/lost.png" },
                "humanAnswers": [],
            }),
        );
        let event: HumanLoopEvent = serde_json::from_value(json!({
            "detail": {
                "humanLoopStatus": "Completed",
                "humanLoopOutput": { "outputS3Uri": "s3://bucket/reviews/x/output.json" },
            },
        }))
        .unwrap();
        let err = handler.handle(&event).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrackerError>(),
            Some(TrackerError::NotFound { .. })
        ));
        // The answers are still stored, under the page's usual prefix.
        assert!(
            store
                .json(&ObjectUri::new("bucket", "wip/lostI3/0.png/human/output.json"))
                .is_some()
        );
    }
}
