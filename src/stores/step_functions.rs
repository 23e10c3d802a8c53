//! Resuming Step Functions executions with task tokens.

use aws_sdk_sfn::Client;

use super::{ResumeOutcome, WorkflowResumer};
use crate::{
    prelude::*,
    retry::{CallError, CallOpts, retry_result_from_error, retry_result_ok, with_retries},
};

/// A [`WorkflowResumer`] that calls `SendTaskSuccess`.
pub struct StepFunctionsResumer {
    client: Client,
    call_opts: CallOpts,
}

impl StepFunctionsResumer {
    pub fn new(config: &aws_config::SdkConfig, call_opts: CallOpts) -> Self {
        Self {
            client: Client::new(config),
            call_opts,
        }
    }
}

#[async_trait]
impl WorkflowResumer for StepFunctionsResumer {
    async fn resume(&self, handle: &str, output: &Value) -> Result<ResumeOutcome> {
        let output = &serde_json::to_string(output).context("failed to serialize task output")?;
        with_retries("resume workflow", || async move {
            let request = self
                .client
                .send_task_success()
                .task_token(handle)
                .output(output);
            match self.call_opts.call(request.send()).await {
                Ok(_) => retry_result_ok(ResumeOutcome::Resumed),
                // A token that has already been used, or whose task has timed
                // out, cannot be resumed again.
                Err(CallError::Native(err))
                    if err.as_service_error().is_some_and(|e| {
                        e.is_task_timed_out() || e.is_task_does_not_exist()
                    }) =>
                {
                    debug!("Task token was already used: {err:?}");
                    retry_result_ok(ResumeOutcome::AlreadyResumed)
                }
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }
}
