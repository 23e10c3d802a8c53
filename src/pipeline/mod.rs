//! The review pipeline: page requests, human completions, and cleanup.
//!
//! Every stage stores its artifacts under a per-page prefix in the document's
//! bucket:
//!
//! ```text
//! wip/{document_id}/{page}{ext}/ai/output.json
//! wip/{document_id}/{page}{ext}/review/context.json
//! wip/{document_id}/{page}{ext}/human/output.json
//! ```
//!
//! where `{ext}` is `.png` for PDFs (which are rasterized upstream) and the
//! source extension otherwise.

use std::fmt;

use schemars::{
    JsonSchema,
    r#gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject, SingleOrVec},
};
use serde::{Deserializer, Serializer, de};

use crate::{
    prelude::*,
    stores::{ObjectStore, ObjectUri},
};

pub mod pages;
pub mod review;
pub mod segments;

/// Output status of a unit of work.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    // Everything succeeded.
    Ok,

    // Some pieces failed.
    Incomplete,

    // Nothing useful was produced.
    Failed,
}

impl WorkStatus {
    /// Summarize `succeeded` successes and `failed` failures.
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => WorkStatus::Ok,
            (0, _) => WorkStatus::Failed,
            _ => WorkStatus::Incomplete,
        }
    }
}

/// One page of a document, as named by upstream page splitting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageKey {
    /// A numbered, zero-based page.
    Index(u32),
    /// The only page of a document that was never split.
    SingleImage,
}

impl PageKey {
    /// The zero-based page number. A single image is page 0.
    pub fn number(self) -> u32 {
        match self {
            PageKey::Index(page) => page,
            PageKey::SingleImage => 0,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageKey::Index(page) => write!(f, "{page}"),
            PageKey::SingleImage => write!(f, "single_image"),
        }
    }
}

impl Serialize for PageKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PageKey::Index(page) => serializer.serialize_u32(*page),
            PageKey::SingleImage => serializer.serialize_str("single_image"),
        }
    }
}

impl<'de> Deserialize<'de> for PageKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        page_key_from_json(&value).ok_or_else(|| {
            de::Error::custom(format!(
                "expected a page number or \"single_image\", found {value}"
            ))
        })
    }
}

impl JsonSchema for PageKey {
    fn schema_name() -> String {
        "PageKey".to_owned()
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        SchemaObject {
            instance_type: Some(SingleOrVec::Vec(vec![
                InstanceType::Integer,
                InstanceType::String,
            ])),
            ..Default::default()
        }
        .into()
    }
}

/// Parse a page key from a number, a string of digits, or `"single_image"`.
pub fn page_key_from_json(value: &Value) -> Option<PageKey> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(PageKey::Index),
        Value::String(s) if s == "single_image" => Some(PageKey::SingleImage),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse().ok().map(PageKey::Index)
        }
        _ => None,
    }
}

/// The extension used for per-page artifacts, including the leading dot.
///
/// PDFs are rasterized to PNG before review. Anything else keeps its own
/// (lowercased) extension. Returns an empty string if `key` has none.
pub fn output_extension(key: &str) -> String {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    match Path::new(file_name).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("pdf") => ".png".to_owned(),
        Some(ext) => format!(".{}", ext.to_ascii_lowercase()),
        None => String::new(),
    }
}

/// The file name of `key` up to its first `.`.
pub fn file_stem(key: &str) -> &str {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    file_name.split('.').next().unwrap_or(file_name)
}

/// Every per-page artifact for `document_id` lives under this prefix.
pub fn work_prefix(document_id: &str) -> String {
    format!("wip/{document_id}/")
}

/// The artifact prefix for one page, which is also the page image's key.
pub fn page_prefix(document_id: &str, page: PageKey, extension: &str) -> String {
    match page {
        PageKey::Index(page) => format!("wip/{document_id}/{page}{extension}"),
        PageKey::SingleImage => format!("wip/{document_id}/single_image/0{extension}"),
    }
}

/// Where the machine extraction output for a page is stored.
pub fn ai_output_key(page_prefix: &str) -> String {
    format!("{page_prefix}/ai/output.json")
}

/// Where the reviewed output for a page is stored.
pub fn human_output_key(page_prefix: &str) -> String {
    format!("{page_prefix}/human/output.json")
}

/// Where we keep what a reviewer saw, so we can apply their answers.
pub fn review_context_key(page_prefix: &str) -> String {
    format!("{page_prefix}/review/context.json")
}

/// The review job ID for one page of a document.
pub fn job_id(document_id: &str, page: u32) -> String {
    format!("{document_id}i{page}")
}

/// Split a job ID into its document ID and page number.
///
/// Document IDs may themselves contain `i`, so we split at the last one.
pub fn parse_job_id(job_id: &str) -> Option<(&str, u32)> {
    let (document_id, page) = job_id.rsplit_once('i')?;
    if document_id.is_empty() || page.is_empty() || !page.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some((document_id, page.parse().ok()?))
}

/// The folder an extraction job wrote its output to, given the URI of its
/// `job_metadata.json`.
pub fn job_output_prefix(job_metadata: &ObjectUri) -> Option<String> {
    let (folder, _file) = job_metadata.key.rsplit_once('/')?;
    (!folder.is_empty()).then(|| format!("{folder}/"))
}

/// What [`cleanup`] removed.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct CleanupOutput {
    pub bucket: String,
    pub document_id: String,

    /// The prefixes we deleted.
    pub prefixes: Vec<String>,

    /// How many objects we deleted.
    pub deleted_objects: usize,
}

/// Delete every intermediate artifact for a document, and optionally the
/// extraction job's output folder.
#[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
pub async fn cleanup(
    objects: &dyn ObjectStore,
    bucket: &str,
    document_id: &str,
    job_metadata: Option<&ObjectUri>,
) -> Result<CleanupOutput> {
    if document_id.is_empty() || document_id.contains('/') {
        return Err(anyhow!("invalid document ID: {document_id:?}"));
    }

    let mut targets = vec![(bucket.to_owned(), work_prefix(document_id))];
    if let Some(job_metadata) = job_metadata {
        let prefix = job_output_prefix(job_metadata).ok_or_else(|| {
            anyhow!("cannot find a job folder above {job_metadata}")
        })?;
        targets.push((job_metadata.bucket.clone(), prefix));
    }

    let mut deleted_objects = 0;
    let mut prefixes = vec![];
    for (bucket, prefix) in targets {
        let deleted = objects
            .delete_prefix(&bucket, &prefix)
            .await
            .with_context(|| format!("failed to delete s3://{bucket}/{prefix}"))?;
        info!(%bucket, %prefix, deleted, "Deleted objects");
        deleted_objects += deleted;
        prefixes.push(format!("s3://{bucket}/{prefix}"));
    }

    Ok(CleanupOutput {
        bucket: bucket.to_owned(),
        document_id: document_id.to_owned(),
        prefixes,
        deleted_objects,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::stores::memory::MemoryStore;

    #[test]
    fn extensions_follow_rasterization() {
        assert_eq!(output_extension("uploads/Form.PDF"), ".png");
        assert_eq!(output_extension("uploads/scan.JPG"), ".jpg");
        assert_eq!(output_extension("uploads/v1.2/scan.tiff"), ".tiff");
        assert_eq!(output_extension("uploads/README"), "");
    }

    #[test]
    fn stems_stop_at_the_first_dot() {
        assert_eq!(file_stem("uploads/form.v2.pdf"), "form");
        assert_eq!(file_stem("form.pdf"), "form");
        assert_eq!(file_stem("a.b/noext"), "noext");
    }

    #[test]
    fn page_prefixes_and_job_ids() {
        assert_eq!(page_prefix("doc", PageKey::Index(3), ".png"), "wip/doc/3.png");
        assert_eq!(
            page_prefix("doc", PageKey::SingleImage, ".png"),
            "wip/doc/single_image/0.png"
        );
        assert_eq!(ai_output_key("wip/doc/3.png"), "wip/doc/3.png/ai/output.json");
        assert_eq!(job_id("invoice", 12), "invoicei12");
        assert_eq!(parse_job_id("invoicei12"), Some(("invoice", 12)));
        assert_eq!(parse_job_id("i3"), None);
        assert_eq!(parse_job_id("doci"), None);
        assert_eq!(parse_job_id("docix"), None);
    }

    #[test]
    fn page_keys_accept_numbers_and_strings() {
        let keys: Vec<PageKey> =
            serde_json::from_value(json!([0, "2", "single_image"])).unwrap();
        assert_eq!(
            keys,
            vec![PageKey::Index(0), PageKey::Index(2), PageKey::SingleImage]
        );
        assert_eq!(serde_json::to_value(&keys).unwrap(), json!([0, 2, "single_image"]));
        assert!(serde_json::from_value::<PageKey>(json!("two")).is_err());
        assert!(serde_json::from_value::<PageKey>(json!(-1)).is_err());
    }

    #[test]
    fn statuses_summarize_counts() {
        assert_eq!(WorkStatus::from_counts(3, 0), WorkStatus::Ok);
        assert_eq!(WorkStatus::from_counts(0, 0), WorkStatus::Ok);
        assert_eq!(WorkStatus::from_counts(2, 1), WorkStatus::Incomplete);
        assert_eq!(WorkStatus::from_counts(0, 1), WorkStatus::Failed);
    }

    #[tokio::test]
    async fn cleanup_removes_only_this_document() -> Result<()> {
        let store = MemoryStore::default();
        for key in [
            "wip/doc/0.png/ai/output.json",
            "wip/doc/1.png/human/output.json",
            "wip/doc2/0.png/ai/output.json",
            "output/job-1/job_metadata.json",
            "output/job-1/0/custom_output/0/result.json",
            "output/job-10/job_metadata.json",
        ] {
            store.insert_json(&ObjectUri::new("bucket", key), &json!({}));
        }

        let metadata: ObjectUri = "s3://bucket/output/job-1/job_metadata.json".parse()?;
        let output = cleanup(&store, "bucket", "doc", Some(&metadata)).await?;
        assert_eq!(output.deleted_objects, 4);
        assert_eq!(
            output.prefixes,
            vec!["s3://bucket/wip/doc/", "s3://bucket/output/job-1/"]
        );

        let remaining: Vec<String> =
            store.lock().objects.keys().map(|uri| uri.key.clone()).collect();
        assert_eq!(
            remaining,
            vec!["output/job-10/job_metadata.json", "wip/doc2/0.png/ai/output.json"]
        );

        assert!(cleanup(&store, "bucket", "", None).await.is_err());
        assert!(cleanup(&store, "bucket", "a/b", None).await.is_err());
        Ok(())
    }
}
