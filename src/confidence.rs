//! Deciding whether a page needs human review.
//!
//! The input is one segment's extraction artifact, which looks like:
//!
//! ```json
//! {
//!   "explainability_info": [ { "name": { "value": "Jane", "confidence": 0.6 } } ],
//!   "inference_result": { "name": "Jane" },
//!   "split_document": { "page_indices": [3, 4] }
//! }
//! ```
//!
//! Any field below the threshold sends the whole page to review. If we can't
//! load or parse the artifact, we also send it to review: we never skip review
//! because of a bug or a bad file.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserializer, de};

use crate::{
    fields::{FieldDescriptor, StructureMap, flatten::flatten_json},
    prelude::*,
    stores::{ObjectStore, ObjectUri, read_json},
};

/// Default threshold below which a field needs review.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Finds the segment index in a key like `.../custom_output/3/result.json`.
static SEGMENT_INDEX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|/)custom_output/(\d+)(?:/|$)").expect("failed to compile regex")
});

/// One field, as shown to a human reviewer.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ReviewLabel {
    /// The field's path, which is also how answers are matched back.
    pub name: String,
    pub value: Value,
    pub confidence: f64,

    /// Zero-based page.
    #[serde(default)]
    pub page: u32,

    #[serde(
        rename = "boundingBox",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bounding_box: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertices: Option<Value>,
}

impl ReviewLabel {
    /// Build a label from a field, using its first geometry entry.
    pub fn from_field(field: &FieldDescriptor) -> Self {
        let first_geometry = field.geometry.as_ref().and_then(|g| g.first());
        let from_geometry = |name: &str| {
            first_geometry
                .and_then(|g| g.get(name))
                .filter(|v| !v.is_null())
                .cloned()
        };
        Self {
            name: field.field_path.clone(),
            value: field.value.clone(),
            confidence: field.confidence,
            page: field.page,
            bounding_box: from_geometry("boundingBox"),
            vertices: from_geometry("vertices"),
        }
    }
}

/// The payload sent to the human review service.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ReviewInput {
    /// The document or page image being reviewed, as an `s3://` URI.
    #[serde(rename = "taskObject", default)]
    pub task_object: String,

    #[serde(default)]
    pub labels: Vec<ReviewLabel>,
}

impl ReviewInput {
    /// Restrict to the labels on `page`, re-based to page 0, and point at that
    /// page's image.
    pub fn for_page(&self, page: u32, task_object: String) -> Self {
        let labels = self
            .labels
            .iter()
            .filter(|label| label.page == page)
            .map(|label| ReviewLabel {
                page: 0,
                ..label.clone()
            })
            .collect();
        Self {
            task_object,
            labels,
        }
    }
}

/// Parse an optional [`ReviewInput`], where the string `"none"` also means no
/// review.
pub fn review_input_or_none<'de, D>(deserializer: D) -> Result<Option<ReviewInput>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) if s == "none" => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(de::Error::custom),
    }
}

/// The result of evaluating one segment.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ConfidenceEvaluation {
    /// Does a human need to look at this page?
    pub needs_review: bool,

    /// Why we sent the page to review without looking at its fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Every reviewable field.
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,

    /// The shape of the extraction result.
    #[serde(default)]
    pub structure_map: StructureMap,

    /// The first page of this segment.
    pub page_index: u32,

    /// The segment number from the artifact's path.
    pub segment_index: u32,

    /// Every page in this segment, when the segment spans several pages.
    #[serde(default)]
    pub multi_page_indices: Vec<u32>,

    /// The machine extraction output, passed through for storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_result: Option<Value>,

    /// What to send to the reviewer. Present whenever review is needed. When
    /// the fields couldn't be read, it has no labels and the reviewer sees the
    /// whole document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_input: Option<ReviewInput>,
}

impl ConfidenceEvaluation {
    /// An evaluation that fails open to review.
    fn needs_review_because(
        reason: String,
        segment_index: u32,
        task_object: Option<&ObjectUri>,
    ) -> Self {
        Self {
            needs_review: true,
            reason: Some(reason),
            fields: vec![],
            structure_map: StructureMap::default(),
            page_index: segment_index,
            segment_index,
            multi_page_indices: vec![],
            inference_result: None,
            review_input: Some(ReviewInput {
                task_object: task_object.map(ToString::to_string).unwrap_or_default(),
                labels: vec![],
            }),
        }
    }
}

/// Extract the segment index from an artifact key. Defaults to 0.
pub fn segment_index_from_key(key: &str) -> u32 {
    SEGMENT_INDEX_REGEX
        .captures(key)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

/// Evaluate an already-loaded artifact.
///
/// `task_object` is the source document, used as the review target.
pub fn evaluate_artifact(
    artifact: &Value,
    threshold: f64,
    segment_index: u32,
    task_object: Option<&ObjectUri>,
) -> ConfidenceEvaluation {
    let Some(artifact) = artifact.as_object() else {
        return ConfidenceEvaluation::needs_review_because(
            "extraction artifact is not a JSON object".to_owned(),
            segment_index,
            task_object,
        );
    };

    let multi_page_indices = match artifact.pointer_page_indices() {
        Ok(indices) => indices,
        Err(err) => {
            return ConfidenceEvaluation::needs_review_because(
                format!("invalid split_document: {err:#}"),
                segment_index,
                task_object,
            );
        }
    };
    let page_index = multi_page_indices.first().copied().unwrap_or(segment_index);

    let (fields, structure_map, needs_review) = match artifact.get("explainability_info") {
        Some(info) => match flatten_json(info, threshold) {
            Ok(flattened) => (
                flattened.fields,
                flattened.structure_map,
                flattened.has_low_confidence,
            ),
            Err(err) => {
                warn!(segment_index, "Could not flatten extraction result: {err:#}");
                let mut evaluation = ConfidenceEvaluation::needs_review_because(
                    format!("invalid explainability_info: {err:#}"),
                    segment_index,
                    task_object,
                );
                evaluation.page_index = page_index;
                evaluation.multi_page_indices = multi_page_indices;
                return evaluation;
            }
        },
        None => (vec![], StructureMap::default(), false),
    };

    let review_input = needs_review.then(|| ReviewInput {
        task_object: task_object.map(ToString::to_string).unwrap_or_default(),
        labels: fields.iter().map(ReviewLabel::from_field).collect(),
    });
    debug!(
        segment_index,
        page_index,
        field_count = fields.len(),
        needs_review,
        "Evaluated segment"
    );

    ConfidenceEvaluation {
        needs_review,
        reason: None,
        fields,
        structure_map,
        page_index,
        segment_index,
        multi_page_indices,
        inference_result: artifact.get("inference_result").cloned(),
        review_input,
    }
}

/// Load and evaluate the artifact at `segment_uri`. Never fails: problems
/// loading the artifact produce an evaluation that needs review.
#[instrument(level = "debug", skip_all, fields(segment_uri = %segment_uri))]
pub async fn evaluate_segment(
    objects: &dyn ObjectStore,
    segment_uri: &ObjectUri,
    threshold: f64,
    task_object: Option<&ObjectUri>,
) -> ConfidenceEvaluation {
    let segment_index = segment_index_from_key(&segment_uri.key);
    match read_json::<Value>(objects, segment_uri).await {
        Ok(Some(artifact)) => {
            evaluate_artifact(&artifact, threshold, segment_index, task_object)
        }
        Ok(None) => {
            warn!("Extraction artifact does not exist");
            ConfidenceEvaluation::needs_review_because(
                format!("extraction artifact not found: {segment_uri}"),
                segment_index,
                task_object,
            )
        }
        Err(err) => {
            warn!("Could not load extraction artifact: {err:#}");
            ConfidenceEvaluation::needs_review_because(
                format!("error loading extraction artifact: {err:#}"),
                segment_index,
                task_object,
            )
        }
    }
}

/// Access to `split_document.page_indices`.
trait PageIndices {
    fn pointer_page_indices(&self) -> Result<Vec<u32>>;
}

impl PageIndices for serde_json::Map<String, Value> {
    fn pointer_page_indices(&self) -> Result<Vec<u32>> {
        match self.get("split_document").and_then(|s| s.get("page_indices")) {
            None | Some(Value::Null) => Ok(vec![]),
            Some(indices) => serde_json::from_value(indices.clone())
                .context("page_indices must be a list of page numbers"),
        }
    }
}
