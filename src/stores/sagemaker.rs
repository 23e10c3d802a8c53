//! Human review with SageMaker Augmented AI.

use aws_sdk_sagemakera2iruntime::{Client, types::HumanLoopInput};

use super::{ReviewService, ReviewStart};
use crate::{
    prelude::*,
    retry::{CallError, CallOpts, retry_result_from_error, retry_result_ok, with_retries},
};

/// A [`ReviewService`] that starts A2I human loops.
pub struct A2iReviewService {
    client: Client,
    flow_definition_arn: String,
    call_opts: CallOpts,
}

impl A2iReviewService {
    pub fn new(
        config: &aws_config::SdkConfig,
        flow_definition_arn: String,
        call_opts: CallOpts,
    ) -> Self {
        Self {
            client: Client::new(config),
            flow_definition_arn,
            call_opts,
        }
    }
}

#[async_trait]
impl ReviewService for A2iReviewService {
    #[instrument(level = "debug", skip_all, fields(human_loop_name = %name))]
    async fn start_review(&self, name: &str, input: &Value) -> Result<ReviewStart> {
        let input_content =
            serde_json::to_string(input).context("failed to serialize review input")?;
        let loop_input = &HumanLoopInput::builder()
            .input_content(input_content)
            .build();
        with_retries("start human loop", || async move {
            let request = self
                .client
                .start_human_loop()
                .human_loop_name(name)
                .flow_definition_arn(&self.flow_definition_arn)
                .human_loop_input(loop_input.clone());
            match self.call_opts.call(request.send()).await {
                Ok(_) => retry_result_ok(ReviewStart::Started),
                // Loop names are unique, so this is a redelivered request.
                Err(CallError::Native(err))
                    if err.as_service_error().is_some_and(|e| e.is_conflict_exception()) =>
                {
                    retry_result_ok(ReviewStart::AlreadyStarted)
                }
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }
}
