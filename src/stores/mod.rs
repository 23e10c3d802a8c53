//! Narrow interfaces to the external services we depend on.
//!
//! Everything that touches shared state goes through one of these traits, so
//! the review pipeline can run against AWS, a local directory, or an
//! in-memory double in tests. Implementations are held as `Arc<dyn _>`.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use serde::de::DeserializeOwned;

use crate::{aws::load_aws_config, prelude::*, retry::CallOpts, tracker::PageRecord};

pub mod dynamodb;
pub mod local;
#[cfg(test)]
pub mod memory;
pub mod s3;
pub mod sagemaker;
pub mod sqs;
pub mod step_functions;

/// The location of an object, as a bucket and key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectUri {
    pub bucket: String,
    pub key: String,
}

impl ObjectUri {
    /// Create a new URI.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl FromStr for ObjectUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("s3://")
            .ok_or_else(|| anyhow!("expected an s3:// URI, found {s:?}"))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| anyhow!("URI has no object key: {s:?}"))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(anyhow!("URI needs both a bucket and a key: {s:?}"));
        }
        Ok(Self::new(bucket, key))
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Shared page-record storage.
///
/// Records are keyed by `(job_id, callback_handle)` and can also be looked up
/// by `document_id`. Writes must be conditional: a create never replaces an
/// existing record, and an update never creates one.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Create `record` unless one with the same key exists. Returns `true` if
    /// we created it.
    async fn put_if_absent(&self, record: &PageRecord) -> Result<bool>;

    /// All records for `job_id`, one per callback handle.
    async fn get_by_job_id(&self, job_id: &str) -> Result<Vec<PageRecord>>;

    /// Set `is_complete` on an existing record. Returns `false` if there was
    /// no such record.
    async fn mark_complete(&self, job_id: &str, callback_handle: &str) -> Result<bool>;

    /// All records for `document_id`.
    async fn query_by_document(&self, document_id: &str) -> Result<Vec<PageRecord>>;

    /// Create a claim on aggregating `document_id`. Returns `true` for exactly
    /// one caller per document.
    async fn claim_document(&self, document_id: &str, owner: &str) -> Result<bool>;
}

/// Blob storage for documents and intermediate artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch an object, or `None` if it does not exist.
    async fn get(&self, uri: &ObjectUri) -> Result<Option<Vec<u8>>>;

    /// Write an object, replacing any previous version.
    async fn put(&self, uri: &ObjectUri, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Delete every object whose key starts with `prefix`. Returns how many
    /// objects were removed.
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize>;
}

/// Read and parse a JSON object. Returns `None` if it does not exist.
pub async fn read_json<T>(store: &dyn ObjectStore, uri: &ObjectUri) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    match store.get(uri).await? {
        Some(body) => {
            let value = serde_json::from_slice(&body)
                .with_context(|| format!("failed to parse JSON from {uri}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize `value` as pretty-printed JSON and write it.
pub async fn write_json<T>(store: &dyn ObjectStore, uri: &ObjectUri, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize JSON for {uri}"))?;
    store.put(uri, body, "application/json").await
}

/// A message received from a [`MessageQueue`].
#[derive(Clone, Debug)]
pub struct QueueMessage {
    /// The queue's ID for this message.
    pub id: String,

    /// The raw message body.
    pub body: String,

    /// Opaque token needed to delete the message.
    pub receipt: String,
}

/// An at-least-once message queue.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Receive up to `max` messages. May wait a while if none are available,
    /// and may return an empty list.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Acknowledge a message, so it will not be delivered again.
    async fn delete(&self, receipt: &str) -> Result<()>;
}

/// What happened when we tried to resume a workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    Resumed,
    /// The handle was already used, or has expired.
    AlreadyResumed,
}

/// Resumes suspended workflow executions.
#[async_trait]
pub trait WorkflowResumer: Send + Sync + 'static {
    /// Resume the execution that issued `handle`, passing it `output`.
    ///
    /// Resuming twice with the same handle must return
    /// [`ResumeOutcome::AlreadyResumed`], not an error.
    async fn resume(&self, handle: &str, output: &Value) -> Result<ResumeOutcome>;
}

/// What happened when we tried to start a human review.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStart {
    Started,
    AlreadyStarted,
}

/// Starts human review tasks.
#[async_trait]
pub trait ReviewService: Send + Sync + 'static {
    /// Start a review named `name`. Names are unique, so starting the same
    /// review twice returns [`ReviewStart::AlreadyStarted`].
    async fn start_review(&self, name: &str, input: &Value) -> Result<ReviewStart>;
}

/// Which implementation of our external services should we use?
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendType {
    /// DynamoDB, S3, SQS, Step Functions and SageMaker A2I.
    #[default]
    Aws,
    /// A directory on the local file system.
    Local,
}

/// Options for connecting to external services.
#[derive(Clone, Debug, Args)]
pub struct BackendOpts {
    /// Which backend to use.
    #[clap(long, value_enum, env = "REVIEW_BACKEND", default_value = "aws")]
    pub backend: BackendType,

    /// Root directory for the `local` backend.
    #[clap(long, env = "REVIEW_LOCAL_ROOT", default_value = ".page-review")]
    pub local_root: PathBuf,

    /// How long the `local` backend waits before redelivering a received
    /// message that was never deleted, in seconds.
    #[clap(
        long = "visibility-timeout",
        env = "REVIEW_VISIBILITY_TIMEOUT",
        value_name = "SECONDS",
        default_value = "300"
    )]
    pub visibility_timeout_secs: u64,

    /// DynamoDB table holding page records.
    #[clap(long, env = "DDB_TABLENAME")]
    pub table_name: Option<String>,

    /// DynamoDB secondary index on `document_id`.
    #[clap(long, env = "DDB_DOCUMENT_INDEX", default_value = "document_id-index")]
    pub document_index: String,

    /// SQS queue delivering page requests.
    #[clap(long, env = "SQS_URL")]
    pub queue_url: Option<String>,

    /// SageMaker A2I flow definition used for human review.
    #[clap(long, env = "HUMAN_WORKFLOW_ARN")]
    pub human_workflow_arn: Option<String>,

    /// Timeout for each call to an external service, in seconds.
    #[clap(
        long = "timeout",
        env = "STORE_TIMEOUT",
        value_name = "SECONDS",
        default_value = "30"
    )]
    pub timeout_secs: u64,

    /// Only let one completion handler per document resume the workflow.
    #[clap(long)]
    pub claim_aggregation: bool,
}

impl BackendOpts {
    /// Connect to our backend. For AWS, this loads credentials and region.
    pub async fn connect(&self) -> Result<Backend> {
        let kind = match self.backend {
            BackendType::Aws => BackendKind::Aws(load_aws_config().await?),
            BackendType::Local => BackendKind::Local(Arc::new(
                local::LocalStore::new(&self.local_root).with_visibility_timeout(
                    Duration::from_secs(self.visibility_timeout_secs),
                ),
            )),
        };
        Ok(Backend {
            opts: self.clone(),
            kind,
        })
    }

    /// Options applied to every external call.
    pub fn call_opts(&self) -> CallOpts {
        CallOpts {
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// A connected backend, able to build each kind of store.
pub struct Backend {
    opts: BackendOpts,
    kind: BackendKind,
}

enum BackendKind {
    Aws(aws_config::SdkConfig),
    Local(Arc<local::LocalStore>),
}

impl Backend {
    /// Should completion handlers claim a document before resuming?
    pub fn claim_aggregation(&self) -> bool {
        self.opts.claim_aggregation
    }

    /// Page-record storage.
    pub fn state_store(&self) -> Result<Arc<dyn StateStore>> {
        match &self.kind {
            BackendKind::Aws(config) => {
                let table_name = self
                    .opts
                    .table_name
                    .clone()
                    .ok_or_else(|| anyhow!("--table-name or DDB_TABLENAME is required"))?;
                Ok(Arc::new(dynamodb::DynamoStateStore::new(
                    config,
                    table_name,
                    self.opts.document_index.clone(),
                    self.opts.call_opts(),
                )))
            }
            BackendKind::Local(store) => Ok(store.clone()),
        }
    }

    /// Blob storage.
    pub fn object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        match &self.kind {
            BackendKind::Aws(config) => Ok(Arc::new(s3::S3ObjectStore::new(
                config,
                self.opts.call_opts(),
            ))),
            BackendKind::Local(store) => Ok(store.clone()),
        }
    }

    /// The inbound page-request queue.
    pub fn queue(&self) -> Result<Arc<dyn MessageQueue>> {
        match &self.kind {
            BackendKind::Aws(config) => {
                let queue_url = self
                    .opts
                    .queue_url
                    .clone()
                    .ok_or_else(|| anyhow!("--queue-url or SQS_URL is required"))?;
                Ok(Arc::new(sqs::SqsQueue::new(
                    config,
                    queue_url,
                    self.opts.call_opts(),
                )))
            }
            BackendKind::Local(store) => Ok(store.clone()),
        }
    }

    /// Workflow resumption.
    pub fn resumer(&self) -> Result<Arc<dyn WorkflowResumer>> {
        match &self.kind {
            BackendKind::Aws(config) => Ok(Arc::new(
                step_functions::StepFunctionsResumer::new(config, self.opts.call_opts()),
            )),
            BackendKind::Local(store) => Ok(store.clone()),
        }
    }

    /// Human review tasks.
    pub fn review_service(&self) -> Result<Arc<dyn ReviewService>> {
        match &self.kind {
            BackendKind::Aws(config) => {
                let flow_definition_arn =
                    self.opts.human_workflow_arn.clone().ok_or_else(|| {
                        anyhow!("--human-workflow-arn or HUMAN_WORKFLOW_ARN is required")
                    })?;
                Ok(Arc::new(sagemaker::A2iReviewService::new(
                    config,
                    flow_definition_arn,
                    self.opts.call_opts(),
                )))
            }
            BackendKind::Local(store) => Ok(store.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_uris() {
        let uri = "s3://bucket/wip/doc/0.png/ai/output.json"
            .parse::<ObjectUri>()
            .unwrap();
        assert_eq!(uri.bucket, "bucket");
        assert_eq!(uri.key, "wip/doc/0.png/ai/output.json");
        assert_eq!(uri.to_string(), "s3://bucket/wip/doc/0.png/ai/output.json");

        assert!("bucket/key".parse::<ObjectUri>().is_err());
        assert!("s3://bucket".parse::<ObjectUri>().is_err());
        assert!("s3://bucket/".parse::<ObjectUri>().is_err());
    }
}
