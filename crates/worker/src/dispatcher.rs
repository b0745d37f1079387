//! Task dispatch and the queue polling loop

use docflow_common::errors::Result;
use docflow_common::queue::{ReceivedTask, TaskMessage, TaskQueue};
use docflow_context::{QueryProcessor, QueryRequest};
use docflow_ingestion::{IndexRequest, IndexingOrchestrator};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pause after a failed receive
const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// Opens after a run of consecutive failures and pauses polling
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    max_failures: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            max_failures: max_failures.max(1),
            cooldown,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= self.max_failures
    }

    /// Sleep out the cooldown if open, then close
    pub async fn wait_if_open(&mut self) {
        if !self.is_open() {
            return;
        }
        warn!(failures = self.consecutive_failures, "Circuit breaker open, pausing...");
        tokio::time::sleep(self.cooldown).await;
        self.consecutive_failures = 0;
        info!("Circuit breaker reset, resuming...");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

/// Routes a task to its pipeline
pub struct TaskDispatcher {
    indexing: IndexingOrchestrator,
    queries: QueryProcessor,
}

impl TaskDispatcher {
    pub fn new(indexing: IndexingOrchestrator, queries: QueryProcessor) -> Self {
        Self { indexing, queries }
    }

    /// Run a task to a terminal job state.
    ///
    /// Both pipelines record the failure on the job row before returning
    /// the error.
    pub async fn dispatch(&self, message: &TaskMessage) -> anyhow::Result<()> {
        if let Some(request) = IndexRequest::from_message(message) {
            let outcome = self.indexing.run(request).await?;
            info!(
                task_id = message.task_id(),
                files = outcome.files_processed,
                unchanged = outcome.unchanged,
                "Index task finished"
            );
        } else if let Some(request) = QueryRequest::from_message(message) {
            let outcome = self.queries.run(request).await?;
            info!(
                task_id = message.task_id(),
                suggestions = outcome.suggestions_created,
                "Query task finished"
            );
        }
        Ok(())
    }
}

/// Polls the task queue and hands each task to the dispatcher
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    dispatcher: TaskDispatcher,
    breaker: CircuitBreaker,
}

impl Worker {
    pub fn new(queue: Arc<dyn TaskQueue>, dispatcher: TaskDispatcher) -> Self {
        Self {
            queue,
            dispatcher,
            breaker: CircuitBreaker::default(),
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Poll until `shutdown` resolves. A task already being processed runs
    /// to completion first.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let queue = self.queue.clone();

        loop {
            self.breaker.wait_if_open().await;

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                result = queue.receive() => {
                    if let Err(e) = self.handle_batch(result).await {
                        error!(error = %e, "Failed to receive messages from queue");
                        tokio::time::sleep(RECEIVE_BACKOFF).await;
                    }
                }
            }
        }
    }

    /// Receive once and process the batch. Returns the number of tasks seen.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let result = self.queue.receive().await;
        self.handle_batch(result).await
    }

    async fn handle_batch(&mut self, received: Result<Vec<ReceivedTask>>) -> Result<usize> {
        let tasks = match received {
            Ok(tasks) => tasks,
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        };

        let count = tasks.len();
        for task in tasks {
            self.process(task).await;
        }
        Ok(count)
    }

    async fn process(&mut self, task: ReceivedTask) {
        let ReceivedTask { message, receipt } = task;
        info!(task_id = message.task_id(), kind = message.kind(), "Received task");

        match self.dispatcher.dispatch(&message).await {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                self.breaker.record_failure();
                error!(
                    task_id = message.task_id(),
                    error = %e,
                    failures = self.breaker.failures(),
                    "Task failed"
                );
            }
        }

        // The job row is terminal either way
        if let Err(e) = self.queue.ack(&receipt).await {
            error!(task_id = message.task_id(), error = %e, "Failed to ack task");
        }
    }
}
