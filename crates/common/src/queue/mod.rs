//! Task queue integration for async job processing
//!
//! Provides:
//! - The [`TaskMessage`] wire format for index and query tasks
//! - The [`TaskQueue`] abstraction (enqueue, receive, ack)
//! - An SQS implementation with retried sends
//! - An in-memory implementation for tests and local runs

use crate::config::QueueConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use aws_sdk_sqs::Client as SqsClient;
use backoff::{future::retry, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where an index task reads documentation from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoSource {
    /// "owner/name"
    pub full_name: String,
    pub branch: String,
    /// Credential embedded in the clone URL, if the repository is private
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// A unit of work on the task queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskMessage {
    Index {
        task_id: String,
        repo_id: Uuid,
        source: RepoSource,
        docs_directory: String,
        #[serde(default)]
        soft_reindex: bool,
    },
    Query {
        task_id: String,
        query: String,
        repo_id: Uuid,
        reviewer_id: Uuid,
    },
}

impl TaskMessage {
    pub fn task_id(&self) -> &str {
        match self {
            TaskMessage::Index { task_id, .. } | TaskMessage::Query { task_id, .. } => task_id,
        }
    }

    /// Job kind recorded on the job row
    pub fn kind(&self) -> &'static str {
        match self {
            TaskMessage::Index { .. } => "index",
            TaskMessage::Query { .. } => "query",
        }
    }
}

/// A received task and the handle needed to acknowledge it
#[derive(Debug, Clone)]
pub struct ReceivedTask {
    pub message: TaskMessage,
    pub receipt: String,
}

/// Task queue abstraction
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task. Returns the queue's message id.
    async fn enqueue(&self, message: &TaskMessage) -> Result<String>;

    /// Receive a batch of tasks; may return an empty batch
    async fn receive(&self) -> Result<Vec<ReceivedTask>>;

    /// Remove a processed task from the queue
    async fn ack(&self, receipt: &str) -> Result<()>;
}

fn parse_body(body: &str) -> Result<TaskMessage> {
    serde_json::from_str(body).map_err(|e| AppError::QueueError {
        message: format!("Failed to parse message: {}", e),
    })
}

fn encode_body(message: &TaskMessage) -> Result<String> {
    serde_json::to_string(message).map_err(|e| AppError::QueueError {
        message: format!("Failed to serialize message: {}", e),
    })
}

/// SQS queue client wrapper
pub struct SqsTaskQueue {
    client: SqsClient,
    url: String,
    max_messages: i32,
    wait_time_seconds: i32,
    visibility_timeout: i32,
}

impl SqsTaskQueue {
    /// Create a new queue client from the ambient AWS configuration
    pub async fn new(config: &QueueConfig) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::with_client(SqsClient::new(&aws_config), config)
    }

    /// Create with an existing SQS client
    pub fn with_client(client: SqsClient, config: &QueueConfig) -> Result<Self> {
        let url = config
            .task_queue_url
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: "queue.task_queue_url is required".to_string(),
            })?;

        Ok(Self {
            client,
            url,
            max_messages: config.batch_size.clamp(1, 10) as i32,
            wait_time_seconds: config.poll_timeout_secs.min(20) as i32,
            visibility_timeout: config.visibility_timeout_secs as i32,
        })
    }
}

#[async_trait]
impl TaskQueue for SqsTaskQueue {
    async fn enqueue(&self, message: &TaskMessage) -> Result<String> {
        let body = encode_body(message)?;

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..ExponentialBackoff::default()
        };

        let result = retry(policy, || async {
            self.client
                .send_message()
                .queue_url(&self.url)
                .message_body(&body)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "Send to task queue failed, retrying");
                    backoff::Error::transient(e)
                })
        })
        .await
        .map_err(|e| AppError::QueueError {
            message: format!("Failed to send message: {}", e),
        })?;

        let message_id = result.message_id.unwrap_or_default();
        debug!(message_id = %message_id, task_id = message.task_id(), "Message sent to queue");

        Ok(message_id)
    }

    async fn receive(&self) -> Result<Vec<ReceivedTask>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(self.max_messages)
            .visibility_timeout(self.visibility_timeout)
            .wait_time_seconds(self.wait_time_seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to receive messages: {}", e),
            })?;

        let messages = result.messages.unwrap_or_default();
        debug!(count = messages.len(), "Received messages from queue");

        let mut tasks = Vec::with_capacity(messages.len());
        for message in messages {
            let Some(receipt) = message.receipt_handle else {
                continue;
            };
            let body = message.body.unwrap_or_default();
            match parse_body(&body) {
                Ok(task) => tasks.push(ReceivedTask {
                    message: task,
                    receipt,
                }),
                Err(e) => {
                    // Leave it for the redrive policy to move to the DLQ
                    warn!(error = %e, "Skipping malformed queue message");
                }
            }
        }

        Ok(tasks)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to delete message: {}", e),
            })?;

        debug!("Message deleted from queue");
        Ok(())
    }
}

/// In-memory FIFO queue. Received tasks stay in flight until acked.
#[derive(Default)]
pub struct MemoryTaskQueue {
    pending: Mutex<VecDeque<String>>,
    in_flight: Mutex<HashMap<String, String>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks waiting to be received
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Tasks received but not yet acked
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn poisoned(_: impl std::fmt::Display) -> AppError {
    AppError::QueueError {
        message: "task queue lock poisoned".to_string(),
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, message: &TaskMessage) -> Result<String> {
        let body = encode_body(message)?;
        self.pending.lock().map_err(poisoned)?.push_back(body);
        Ok(Uuid::new_v4().to_string())
    }

    async fn receive(&self) -> Result<Vec<ReceivedTask>> {
        let bodies: Vec<String> = self.pending.lock().map_err(poisoned)?.drain(..).collect();
        let mut in_flight = self.in_flight.lock().map_err(poisoned)?;

        let mut tasks = Vec::with_capacity(bodies.len());
        for body in bodies {
            let receipt = Uuid::new_v4().to_string();
            let message = parse_body(&body)?;
            in_flight.insert(receipt.clone(), body);
            tasks.push(ReceivedTask { message, receipt });
        }
        Ok(tasks)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        self.in_flight
            .lock()
            .map_err(poisoned)?
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| AppError::QueueError {
                message: format!("Unknown receipt: {}", receipt),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_message() -> TaskMessage {
        TaskMessage::Index {
            task_id: "t-1".to_string(),
            repo_id: Uuid::new_v4(),
            source: RepoSource {
                full_name: "acme/docs".to_string(),
                branch: "main".to_string(),
                access_token: None,
            },
            docs_directory: "docs".to_string(),
            soft_reindex: true,
        }
    }

    #[test]
    fn test_task_message_is_tagged() {
        let json = serde_json::to_value(index_message()).unwrap();
        assert_eq!(json["type"], "index");
        assert_eq!(json["soft_reindex"], true);
        assert!(json["source"].get("access_token").is_none());

        let query = serde_json::json!({
            "type": "query",
            "task_id": "t-2",
            "query": "rename the CLI flag",
            "repo_id": Uuid::nil(),
            "reviewer_id": Uuid::nil(),
        });
        let parsed: TaskMessage = serde_json::from_value(query).unwrap();
        assert_eq!(parsed.kind(), "query");
        assert_eq!(parsed.task_id(), "t-2");
    }

    #[tokio::test]
    async fn test_memory_queue_round_trip() {
        let queue = MemoryTaskQueue::new();
        let message = index_message();
        queue.enqueue(&message).await.unwrap();
        assert_eq!(queue.pending_count(), 1);

        let tasks = queue.receive().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].message, message);
        assert_eq!(queue.in_flight_count(), 1);

        queue.ack(&tasks[0].receipt).await.unwrap();
        assert_eq!(queue.in_flight_count(), 0);
        assert!(queue.ack(&tasks[0].receipt).await.is_err());
    }
}
