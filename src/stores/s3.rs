//! Objects in S3.

use aws_sdk_s3::{Client, operation::get_object::GetObjectError, primitives::ByteStream};
use aws_smithy_runtime_api::client::{orchestrator::HttpResponse, result::SdkError};

use super::{ObjectStore, ObjectUri};
use crate::{
    prelude::*,
    retry::{
        CallError, CallOpts, CallRetryResult, retry_result_from_error, retry_result_ok,
        try_fatal, try_potentially_transient, with_retries,
    },
};

/// An [`ObjectStore`] backed by S3.
pub struct S3ObjectStore {
    client: Client,
    call_opts: CallOpts,
}

impl S3ObjectStore {
    pub fn new(config: &aws_config::SdkConfig, call_opts: CallOpts) -> Self {
        Self {
            client: Client::new(config),
            call_opts,
        }
    }

    /// One attempt at reading an object.
    async fn get_once(&self, uri: &ObjectUri) -> CallRetryResult<Option<Vec<u8>>> {
        let request = self.client.get_object().bucket(&uri.bucket).key(&uri.key);
        let output = match self.call_opts.call(request.send()).await {
            Err(CallError::Native(err)) if is_missing_object(&err) => {
                return retry_result_ok(None);
            }
            result => try_potentially_transient!(result),
        };
        let body = try_fatal!(output.body.collect().await);
        retry_result_ok(Some(body.into_bytes().to_vec()))
    }

    /// List one page of keys under `prefix`.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        with_retries("list objects", || async move {
            let request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.map(ToOwned::to_owned));
            match self.call_opts.call(request.send()).await {
                Ok(output) => {
                    let keys = output
                        .contents()
                        .iter()
                        .filter_map(|object| object.key().map(ToOwned::to_owned))
                        .collect();
                    let next = output
                        .is_truncated()
                        .unwrap_or(false)
                        .then(|| output.next_continuation_token().map(ToOwned::to_owned))
                        .flatten();
                    retry_result_ok((keys, next))
                }
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    /// Read an object.
    ///
    /// Without `s3:ListBucket`, S3 answers a read of a missing key with
    /// `403 Forbidden` instead of `NoSuchKey`. Our optional artifacts (human
    /// output, review context) are often read under exactly that policy, so
    /// we treat a 403 as "not there". A real permissions problem then shows
    /// up as a missing object, which is logged.
    #[instrument(level = "debug", skip_all, fields(uri = %uri))]
    async fn get(&self, uri: &ObjectUri) -> Result<Option<Vec<u8>>> {
        with_retries("read object", || self.get_once(uri)).await
    }

    #[instrument(level = "debug", skip_all, fields(uri = %uri))]
    async fn put(&self, uri: &ObjectUri, body: Vec<u8>, content_type: &str) -> Result<()> {
        let body = &body;
        with_retries("write object", || async move {
            let request = self
                .client
                .put_object()
                .bucket(&uri.bucket)
                .key(&uri.key)
                .content_type(content_type)
                .body(ByteStream::from(body.clone()));
            match self.call_opts.call(request.send()).await {
                Ok(_) => retry_result_ok(()),
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }

    #[instrument(level = "debug", skip_all, fields(bucket = %bucket, prefix = %prefix))]
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize> {
        let mut keys = vec![];
        let mut continuation_token = None;
        loop {
            let (page, next) = self
                .list_page(bucket, prefix, continuation_token.as_deref())
                .await?;
            keys.extend(page);
            match next {
                Some(next) => continuation_token = Some(next),
                None => break,
            }
        }

        for key in &keys {
            with_retries("delete object", || async move {
                let request = self.client.delete_object().bucket(bucket).key(key);
                match self.call_opts.call(request.send()).await {
                    Ok(_) => retry_result_ok(()),
                    Err(err) => retry_result_from_error(err),
                }
            })
            .await?;
            debug!(%key, "Deleted object");
        }
        Ok(keys.len())
    }
}

/// Does this error mean the object isn't there, or that we can't tell?
fn is_missing_object(err: &SdkError<GetObjectError, HttpResponse>) -> bool {
    if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
        return true;
    }
    let forbidden = err
        .raw_response()
        .is_some_and(|response| response.status().as_u16() == 403);
    if forbidden {
        debug!("Access denied, treating object as missing");
    }
    forbidden
}
