//! Finding the per-segment artifacts of an extraction job.

use schemars::JsonSchema;

use crate::{
    prelude::*,
    stores::{ObjectStore, ObjectUri, read_json},
};

/// The parts of an extraction job's `job_metadata.json` we care about.
#[derive(Clone, Debug, Default, Deserialize)]
struct JobMetadata {
    #[serde(default)]
    output_metadata: Vec<OutputMetadata>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct OutputMetadata {
    #[serde(default)]
    segment_metadata: Vec<SegmentMetadata>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct SegmentMetadata {
    #[serde(default)]
    custom_output_status: Option<String>,

    #[serde(default)]
    custom_output_path: Option<String>,
}

/// Segments found by [`find_segments`].
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Serialize)]
pub struct SegmentsOutput {
    pub segment_uris: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every segment whose custom output matched a blueprint, in job order.
pub fn matching_segments(job_metadata: &Value) -> Result<Vec<String>> {
    let metadata = JobMetadata::deserialize(job_metadata)
        .context("job metadata has an unexpected shape")?;
    Ok(metadata
        .output_metadata
        .into_iter()
        .flat_map(|output| output.segment_metadata)
        .filter(|segment| segment.custom_output_status.as_deref() == Some("MATCH"))
        .filter_map(|segment| segment.custom_output_path)
        .collect())
}

/// Load job metadata and list its matching segments. Problems are reported
/// in [`SegmentsOutput::error`] with an empty list.
#[instrument(level = "debug", skip_all, fields(job_metadata = %job_metadata))]
pub async fn find_segments(objects: &dyn ObjectStore, job_metadata: &ObjectUri) -> SegmentsOutput {
    let result = match read_json::<Value>(objects, job_metadata).await {
        Ok(Some(metadata)) => matching_segments(&metadata),
        Ok(None) => Err(anyhow!("job metadata not found: {job_metadata}")),
        Err(err) => Err(err),
    };
    match result {
        Ok(segment_uris) => {
            debug!(count = segment_uris.len(), "Found segments");
            SegmentsOutput {
                segment_uris,
                error: None,
            }
        }
        Err(err) => {
            warn!("Could not read job metadata: {err:#}");
            SegmentsOutput {
                segment_uris: vec![],
                error: Some(format!("error retrieving job metadata: {err:#}")),
            }
        }
    }
}
