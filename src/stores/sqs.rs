//! Page requests from SQS.

use aws_sdk_sqs::Client;

use super::{MessageQueue, QueueMessage};
use crate::{
    prelude::*,
    retry::{CallOpts, retry_result_from_error, retry_result_ok, with_retries},
};

/// SQS allows at most 10 messages per receive.
const MAX_BATCH: usize = 10;

/// Long-poll wait, in seconds.
const WAIT_TIME_SECONDS: i32 = 20;

/// A [`MessageQueue`] backed by SQS.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    call_opts: CallOpts,
}

impl SqsQueue {
    pub fn new(config: &aws_config::SdkConfig, queue_url: String, call_opts: CallOpts) -> Self {
        // Long polling has to fit inside our timeout.
        let min_timeout = std::time::Duration::from_secs(WAIT_TIME_SECONDS as u64 + 5);
        let call_opts = CallOpts {
            timeout: call_opts.timeout.max(min_timeout),
        };
        Self {
            client: Client::new(config),
            queue_url,
            call_opts,
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let max = i32::try_from(max.clamp(1, MAX_BATCH)).unwrap_or(1);
        with_retries("receive messages", || async move {
            let request = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(max)
                .wait_time_seconds(WAIT_TIME_SECONDS);
            match self.call_opts.call(request.send()).await {
                Ok(output) => {
                    let messages = output
                        .messages()
                        .iter()
                        .filter_map(|message| {
                            let Some(receipt) = message.receipt_handle() else {
                                warn!(id = ?message.message_id(), "Message has no receipt handle");
                                return None;
                            };
                            Some(QueueMessage {
                                id: message.message_id().unwrap_or_default().to_owned(),
                                body: message.body().unwrap_or_default().to_owned(),
                                receipt: receipt.to_owned(),
                            })
                        })
                        .collect();
                    retry_result_ok(messages)
                }
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        with_retries("delete message", || async move {
            let request = self
                .client
                .delete_message()
                .queue_url(&self.queue_url)
                .receipt_handle(receipt);
            match self.call_opts.call(request.send()).await {
                Ok(_) => retry_result_ok(()),
                Err(err) => retry_result_from_error(err),
            }
        })
        .await
    }
}
