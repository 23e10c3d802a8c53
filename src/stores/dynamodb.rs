//! Page records in DynamoDB.
//!
//! The table has partition key `jobid` and sort key `callback_token`, plus a
//! global secondary index on `document_id`. GSI reads are eventually
//! consistent, so completion queries re-read each record with a consistent
//! `GetItem` before trusting its `is_complete` flag.

use std::collections::HashMap;

use aws_sdk_dynamodb::{Client, types::AttributeValue};

use super::StateStore;
use crate::{
    prelude::*,
    retry::{CallError, CallOpts, retry_result_from_error, retry_result_ok, with_retries},
    tracker::PageRecord,
};

type Item = HashMap<String, AttributeValue>;

/// Sort key used for aggregation claims. Claim items carry no `document_id`,
/// so they never show up in the document index.
const CLAIM_SORT_KEY: &str = "claim";

/// A [`StateStore`] backed by a DynamoDB table.
pub struct DynamoStateStore {
    client: Client,
    table_name: String,
    document_index: String,
    call_opts: CallOpts,
}

impl DynamoStateStore {
    /// Create a new store.
    pub fn new(
        config: &aws_config::SdkConfig,
        table_name: String,
        document_index: String,
        call_opts: CallOpts,
    ) -> Self {
        Self {
            client: Client::new(config),
            table_name,
            document_index,
            call_opts,
        }
    }

    /// Query every item with partition key `job_id`.
    async fn query_job(&self, job_id: &str) -> Result<Vec<Item>> {
        with_retries("query page records", || async move {
            let request = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("jobid = :j")
                .expression_attribute_values(":j", AttributeValue::S(job_id.to_owned()))
                .consistent_read(true);
            match self.call_opts.call(request.send()).await {
                Ok(output) => retry_result_ok(output.items().to_vec()),
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }

    /// Query one page of the document index.
    async fn query_index_page(
        &self,
        document_id: &str,
        start_key: Option<Item>,
    ) -> Result<(Vec<Item>, Option<Item>)> {
        let start_key = &start_key;
        with_retries("query document index", || async move {
            let request = self
                .client
                .query()
                .table_name(&self.table_name)
                .index_name(&self.document_index)
                .key_condition_expression("document_id = :d")
                .expression_attribute_values(
                    ":d",
                    AttributeValue::S(document_id.to_owned()),
                )
                .set_exclusive_start_key(start_key.clone());
            match self.call_opts.call(request.send()).await {
                Ok(output) => retry_result_ok((
                    output.items().to_vec(),
                    output.last_evaluated_key().cloned(),
                )),
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }

    /// Read one item with strong consistency.
    async fn get_consistent(&self, job_id: &str, callback_token: &str) -> Result<Option<Item>> {
        with_retries("read page record", || async move {
            let request = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .key("jobid", AttributeValue::S(job_id.to_owned()))
                .key("callback_token", AttributeValue::S(callback_token.to_owned()))
                .consistent_read(true);
            match self.call_opts.call(request.send()).await {
                Ok(output) => retry_result_ok(output.item().cloned()),
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }
}

#[async_trait]
impl StateStore for DynamoStateStore {
    #[instrument(level = "debug", skip_all, fields(job_id = %record.job_id))]
    async fn put_if_absent(&self, record: &PageRecord) -> Result<bool> {
        let item = &record_to_item(record);
        with_retries("create page record", || async move {
            let request = self
                .client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(item.clone()))
                .condition_expression("attribute_not_exists(jobid)");
            match self.call_opts.call(request.send()).await {
                Ok(_) => retry_result_ok(true),
                Err(CallError::Native(err))
                    if err
                        .as_service_error()
                        .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
                {
                    retry_result_ok(false)
                }
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    async fn get_by_job_id(&self, job_id: &str) -> Result<Vec<PageRecord>> {
        self.query_job(job_id)
            .await?
            .iter()
            .filter(|item| !is_claim(item))
            .map(item_to_record)
            .collect()
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    async fn mark_complete(&self, job_id: &str, callback_handle: &str) -> Result<bool> {
        with_retries("mark page complete", || async move {
            let request = self
                .client
                .update_item()
                .table_name(&self.table_name)
                .key("jobid", AttributeValue::S(job_id.to_owned()))
                .key("callback_token", AttributeValue::S(callback_handle.to_owned()))
                .update_expression("SET is_complete = :c")
                .condition_expression("attribute_exists(jobid)")
                .expression_attribute_values(":c", AttributeValue::Bool(true));
            match self.call_opts.call(request.send()).await {
                Ok(_) => retry_result_ok(true),
                Err(CallError::Native(err))
                    if err
                        .as_service_error()
                        .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
                {
                    retry_result_ok(false)
                }
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }

    #[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
    async fn query_by_document(&self, document_id: &str) -> Result<Vec<PageRecord>> {
        let mut indexed = vec![];
        let mut start_key = None;
        loop {
            let (items, next) = self.query_index_page(document_id, start_key).await?;
            indexed.extend(items);
            match next {
                Some(next) => start_key = Some(next),
                None => break,
            }
        }

        let mut records = Vec::with_capacity(indexed.len());
        for item in &indexed {
            let job_id = string_attr(item, "jobid")?;
            let callback_token = string_attr(item, "callback_token")?;
            match self.get_consistent(&job_id, &callback_token).await? {
                Some(fresh) => records.push(item_to_record(&fresh)?),
                None => warn!(%job_id, "Indexed page record has disappeared"),
            }
        }
        Ok(records)
    }

    #[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
    async fn claim_document(&self, document_id: &str, owner: &str) -> Result<bool> {
        with_retries("claim document", || async move {
            let request = self
                .client
                .put_item()
                .table_name(&self.table_name)
                .item("jobid", AttributeValue::S(claim_job_id(document_id)))
                .item("callback_token", AttributeValue::S(CLAIM_SORT_KEY.to_owned()))
                .item("owner", AttributeValue::S(owner.to_owned()))
                .condition_expression("attribute_not_exists(jobid)");
            match self.call_opts.call(request.send()).await {
                Ok(_) => retry_result_ok(true),
                Err(CallError::Native(err))
                    if err
                        .as_service_error()
                        .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
                {
                    retry_result_ok(false)
                }
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }
}

fn claim_job_id(document_id: &str) -> String {
    format!("{document_id}#aggregation")
}

fn is_claim(item: &Item) -> bool {
    matches!(item.get("callback_token"), Some(AttributeValue::S(s)) if s == CLAIM_SORT_KEY)
        && !item.contains_key("document_id")
}

fn record_to_item(record: &PageRecord) -> Item {
    let mut item = HashMap::from([
        ("jobid".to_owned(), AttributeValue::S(record.job_id.clone())),
        (
            "callback_token".to_owned(),
            AttributeValue::S(record.callback_handle.clone()),
        ),
        (
            "document_id".to_owned(),
            AttributeValue::S(record.document_id.clone()),
        ),
        (
            "extension".to_owned(),
            AttributeValue::S(record.extension.clone()),
        ),
        (
            "total_pages".to_owned(),
            AttributeValue::N(record.total_pages.to_string()),
        ),
        (
            "completed_pages".to_owned(),
            AttributeValue::N(record.completed_pages.to_string()),
        ),
        (
            "is_complete".to_owned(),
            AttributeValue::Bool(record.is_complete),
        ),
    ]);
    if let Some(image_path) = &record.image_path {
        item.insert("imagepath".to_owned(), AttributeValue::S(image_path.clone()));
    }
    item
}

fn item_to_record(item: &Item) -> Result<PageRecord> {
    Ok(PageRecord {
        job_id: string_attr(item, "jobid")?,
        callback_handle: string_attr(item, "callback_token")?,
        document_id: string_attr(item, "document_id")?,
        extension: match item.get("extension") {
            Some(AttributeValue::S(ext)) => ext.clone(),
            _ => String::new(),
        },
        total_pages: number_attr(item, "total_pages")?.unwrap_or(1),
        completed_pages: number_attr(item, "completed_pages")?.unwrap_or(0),
        is_complete: matches!(item.get("is_complete"), Some(AttributeValue::Bool(true))),
        image_path: match item.get("imagepath") {
            Some(AttributeValue::S(path)) => Some(path.clone()),
            _ => None,
        },
    })
}

fn string_attr(item: &Item, name: &str) -> Result<String> {
    match item.get(name) {
        Some(AttributeValue::S(value)) => Ok(value.clone()),
        other => Err(anyhow!("page record has invalid {name}: {other:?}")),
    }
}

fn number_attr(item: &Item, name: &str) -> Result<Option<u32>> {
    match item.get(name) {
        Some(AttributeValue::N(value)) => value
            .parse()
            .map(Some)
            .with_context(|| format!("page record has invalid {name}: {value:?}")),
        None => Ok(None),
        other => Err(anyhow!("page record has invalid {name}: {other:?}")),
    }
}
