use crate::domain::tasks::{LeaseToken, NewTask, Task, TaskEnvelope, TaskId};
use crate::ports::queue::{QueueError, QueueResult, TaskQueue};
use async_trait::async_trait;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{Message, MessageAttributeValue, MessageSystemAttributeName};
use aws_sdk_sqs::Client;
use std::time::Duration;
use tracing::warn;

/// Longest long-poll SQS accepts.
const MAX_WAIT_SECS: u64 = 20;
/// Longest visibility timeout SQS accepts.
const MAX_VISIBILITY_SECS: u64 = 12 * 60 * 60;

/// SqsAdapter implements TaskQueue for AWS SQS.
///
/// The receipt handle is the lease token and the visibility timeout is the
/// lease: on receive it is stretched to the task's own timeout, `fail`
/// shortens it to the retry delay and `complete` deletes the message.
#[derive(Clone)]
pub struct SqsAdapter {
    client: Client,
    queue_url: String,
}

impl SqsAdapter {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }

    async fn set_visibility(&self, task: &Task, timeout: Duration) -> QueueResult<()> {
        let secs = timeout.as_secs().min(MAX_VISIBILITY_SECS) as i32;
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(task.lease.as_str())
            .visibility_timeout(secs)
            .send()
            .await
            .map_err(|e| lease_error(e, &task.id))?;
        Ok(())
    }

    async fn drop_unreadable(&self, message_id: &str, receipt_handle: &str) {
        warn!(message_id, "deleting message with unreadable task envelope");
        if let Err(e) = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
        {
            warn!(message_id, error = %DisplayErrorContext(&e), "failed to delete unreadable message");
        }
    }
}

#[async_trait]
impl TaskQueue for SqsAdapter {
    async fn enqueue(&self, task: NewTask) -> QueueResult<TaskId> {
        let body = serde_json::to_string(&TaskEnvelope::from_new(&task))?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_attributes("TaskType", attribute("String", task.task_type.clone())?);
        if let Some(video_id) = task.video_id() {
            request = request.message_attributes("VideoID", attribute("Number", video_id.to_string())?);
        }

        let resp = request.send().await.map_err(unavailable)?;
        resp.message_id()
            .map(TaskId::new)
            .ok_or_else(|| QueueError::Unavailable("SQS returned no message id".to_string()))
    }

    async fn receive(&self, wait: Duration) -> QueueResult<Option<Task>> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECS) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(unavailable)?;

        let Some(message) = resp.messages().first() else {
            return Ok(None);
        };
        let (Some(message_id), Some(receipt_handle)) =
            (message.message_id(), message.receipt_handle())
        else {
            warn!("ignoring SQS message without id or receipt handle");
            return Ok(None);
        };

        let envelope = match message.body().map(serde_json::from_str::<TaskEnvelope>) {
            Some(Ok(envelope)) => envelope,
            _ => {
                self.drop_unreadable(message_id, receipt_handle).await;
                return Ok(None);
            }
        };

        let task = envelope.into_task(
            TaskId::new(message_id),
            receive_count(message),
            LeaseToken::new(receipt_handle),
        );
        // the queue default may be shorter than this task needs
        if let Err(e) = self.set_visibility(&task, task.timeout).await {
            warn!(task_id = %task.id, error = %e, "could not extend visibility to the task timeout");
        }
        Ok(Some(task))
    }

    async fn complete(&self, task: &Task) -> QueueResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(task.lease.as_str())
            .send()
            .await
            .map_err(|e| lease_error(e, &task.id))?;
        Ok(())
    }

    async fn fail(&self, task: &Task, delay: Duration) -> QueueResult<()> {
        self.set_visibility(task, delay).await
    }
}

fn attribute(data_type: &str, value: String) -> QueueResult<MessageAttributeValue> {
    MessageAttributeValue::builder()
        .data_type(data_type)
        .string_value(value)
        .build()
        .map_err(|e| QueueError::InvalidTask(e.to_string()))
}

fn receive_count(message: &Message) -> u32 {
    message
        .attributes()
        .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse().ok())
        .unwrap_or(1)
}

/// Whether an SQS error code means the receipt handle no longer grants the
/// message: it expired, the message was redelivered, or it was deleted.
fn lease_lost(code: Option<&str>, message: Option<&str>) -> bool {
    match code {
        Some("ReceiptHandleIsInvalid")
        | Some("MessageNotInflight")
        | Some("AWS.SimpleQueueService.MessageNotInflight") => true,
        Some("InvalidParameterValue") => {
            message.map_or(false, |m| m.to_ascii_lowercase().contains("receipt handle"))
        }
        _ => false,
    }
}

fn lease_error<E, R>(err: SdkError<E, R>, task_id: &TaskId) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if lease_lost(err.code(), err.message()) {
        QueueError::LeaseNotFound(task_id.clone())
    } else {
        unavailable(err)
    }
}

fn unavailable<E: std::error::Error>(err: E) -> QueueError {
    QueueError::Unavailable(DisplayErrorContext(err).to_string())
}
