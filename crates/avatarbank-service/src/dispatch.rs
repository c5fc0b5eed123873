//! Task dispatch.
//!
//! The settlement layer writes a task row and hands a [`TaskMessage`] to a
//! [`TaskDispatcher`]. The in-process dispatcher is a bounded channel drained
//! by a small worker pool; external workers can instead drive the same task
//! rows through the signed `/v1/worker` callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use avatarbank_core::{GenerationId, TaskId};

use crate::settlement::Settlement;

/// Default capacity of the in-process task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Errors raised when handing a task off.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The queue is at capacity.
    #[error("task queue is full")]
    QueueFull,

    /// No worker is listening.
    #[error("task queue is closed")]
    Closed,
}

/// Work handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    /// Task row to drive.
    pub task_id: TaskId,
    /// Generation the task belongs to.
    pub generation_id: GenerationId,
    /// Prompt to send to the provider.
    pub prompt: String,
}

/// Hands tasks to workers.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue one task. Must not block on the work itself.
    async fn dispatch(&self, message: TaskMessage) -> Result<(), DispatchError>;
}

/// Dispatcher backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<TaskMessage>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiving end for the worker pool.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TaskMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TaskDispatcher for ChannelDispatcher {
    async fn dispatch(&self, message: TaskMessage) -> Result<(), DispatchError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

/// Start `count` workers draining `receiver`.
///
/// Each worker runs one task at a time. The pool stops when every
/// dispatcher has been dropped and the queue is empty.
pub fn spawn_workers(
    count: usize,
    receiver: mpsc::Receiver<TaskMessage>,
    settlement: Arc<Settlement>,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));

    (0..count.max(1))
        .map(|n| {
            let receiver = Arc::clone(&receiver);
            let settlement = Arc::clone(&settlement);
            let worker_id = format!("local-{n}");
            tokio::spawn(async move {
                tracing::debug!(worker_id = %worker_id, "Worker started");
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(message) = next else { break };
                    settlement.execute_task(&message, &worker_id).await;
                }
                tracing::debug!(worker_id = %worker_id, "Worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> TaskMessage {
        TaskMessage {
            task_id: TaskId::generate(),
            generation_id: GenerationId::generate(),
            prompt: "a red fox".into(),
        }
    }

    #[tokio::test]
    async fn channel_dispatcher_delivers_in_order() {
        let (dispatcher, mut receiver) = ChannelDispatcher::new(4);
        let first = message();
        let second = message();
        dispatcher.dispatch(first.clone()).await.unwrap();
        dispatcher.dispatch(second.clone()).await.unwrap();
        assert_eq!(receiver.recv().await, Some(first));
        assert_eq!(receiver.recv().await, Some(second));
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (dispatcher, _receiver) = ChannelDispatcher::new(1);
        dispatcher.dispatch(message()).await.unwrap();
        assert!(matches!(
            dispatcher.dispatch(message()).await,
            Err(DispatchError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (dispatcher, receiver) = ChannelDispatcher::new(1);
        drop(receiver);
        assert!(matches!(
            dispatcher.dispatch(message()).await,
            Err(DispatchError::Closed)
        ));
    }
}
