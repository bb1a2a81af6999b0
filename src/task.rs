mod sqs;

use dyn_clone::{clone_trait_object, DynClone};
use serde::Deserialize;
use std::{
    fmt,
    fmt::{Debug, Display},
    time::Duration,
};
use uuid::Uuid;

pub use sqs::AwsSqsTaskQueue;

use anyhow::Result;

/// A queue of deliveries to be forwarded
pub trait TaskQueue<T: Task>: Debug + DynClone + Send + Sync + 'static {
    /// Get a task to execute. If a task to run is found, returns
    /// Ok(Some(T)). If a task is successfully checked for but there is no
    /// work available, returns Ok(None). Returns Err(e) if something goes
    /// wrong. Once the task has been successfully completed, the TaskHandle
    /// should be passed to acknowledge_task to permanently remove the task.
    /// If acknowledge_task is never called, the task will eventually be
    /// re-delivered via dequeue(), which is what gives the forwarder its
    /// at-least-once semantics.
    fn dequeue(&self) -> Result<Option<TaskHandle<T>>>;

    /// Signal to the task queue that the task has been handled and should be
    /// removed from the queue.
    fn acknowledge_task(&self, handle: TaskHandle<T>) -> Result<()>;

    /// Signal to the task queue that the task was not handled and should be
    /// retried later.
    fn nacknowledge_task(&self, handle: TaskHandle<T>) -> Result<()>;

    /// Signal to the task queue that more time is needed to handle the task.
    fn extend_task_deadline(&self, handle: &TaskHandle<T>, increment: &Duration) -> Result<()>;
}

clone_trait_object!(<T: Task> TaskQueue<T>);

impl<T: Task> TaskQueue<T> for Box<dyn TaskQueue<T>> {
    fn dequeue(&self) -> Result<Option<TaskHandle<T>>> {
        (**self).dequeue()
    }

    fn acknowledge_task(&self, handle: TaskHandle<T>) -> Result<()> {
        (**self).acknowledge_task(handle)
    }

    fn nacknowledge_task(&self, handle: TaskHandle<T>) -> Result<()> {
        (**self).nacknowledge_task(handle)
    }

    fn extend_task_deadline(&self, handle: &TaskHandle<T>, increment: &Duration) -> Result<()> {
        (**self).extend_task_deadline(handle, increment)
    }
}

/// Represents a task that can be assigned to a worker
pub trait Task:
    Debug + Display + PartialEq + Clone + Send + Sized + Sync + serde::de::DeserializeOwned + 'static
{
}

/// One delivery for the forwarder to process: either a logs-stream event
/// payload or a pointer at a staged object.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DeliveryTask {
    /// The trace identifier for the delivery
    pub trace_id: Option<Uuid>,
    /// The base64-gzipped logs payload, when the delivery came off the logs
    /// stream
    pub awslogs_data: Option<String>,
    /// Bucket holding a staged newline-delimited JSON object
    pub bucket: Option<String>,
    /// Key of the staged object within the bucket
    pub object: Option<String>,
}

impl Task for DeliveryTask {}

impl Display for DeliveryTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(id) = self.trace_id {
            writeln!(f, "trace ID: {}", id)?;
        }
        match (&self.bucket, &self.object) {
            (Some(bucket), Some(object)) => write!(f, "staged object: {}/{}", bucket, object),
            _ => write!(
                f,
                "logs payload: {} bytes",
                self.awslogs_data.as_deref().map(str::len).unwrap_or(0)
            ),
        }
    }
}

/// A TaskHandle wraps a Task along with whatever metadata is needed by a
/// TaskQueue implementation
#[derive(Clone, Debug, PartialEq)]
pub struct TaskHandle<T: Task> {
    /// The acknowledgment ID for the task
    pub(crate) acknowledgment_id: String,
    /// The task
    pub task: T,
}

impl<T: Task> Display for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ack ID: {}\ntask: {}", self.acknowledgment_id, self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_task_deserializes_kebab_case() {
        let task: DeliveryTask = serde_json::from_str(
            r#"{"trace-id": "7f1c1a4f-8e1a-4b0e-bd7e-f2ab1c3d4e5f",
                "awslogs-data": "H4sIAAAA"}"#,
        )
        .unwrap();
        assert!(task.trace_id.is_some());
        assert_eq!(task.awslogs_data.as_deref(), Some("H4sIAAAA"));
        assert_eq!(task.bucket, None);

        let task: DeliveryTask = serde_json::from_str(
            r#"{"bucket": "staging-bucket", "object": "batch/0001.ndjson"}"#,
        )
        .unwrap();
        assert_eq!(task.bucket.as_deref(), Some("staging-bucket"));
        assert_eq!(task.object.as_deref(), Some("batch/0001.ndjson"));
        assert_eq!(task.trace_id, None);
    }

    #[test]
    fn delivery_task_display() {
        let staged = DeliveryTask {
            trace_id: None,
            awslogs_data: None,
            bucket: Some("b".to_owned()),
            object: Some("o".to_owned()),
        };
        assert_eq!(staged.to_string(), "staged object: b/o");

        let stream = DeliveryTask {
            trace_id: None,
            awslogs_data: Some("abcd".to_owned()),
            bucket: None,
            object: None,
        };
        assert_eq!(stream.to_string(), "logs payload: 4 bytes");
    }
}
