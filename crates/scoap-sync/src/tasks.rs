//! In-process task dispatch: a queue handle for producers and a bounded tokio worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use scoap_core::ArticleId;
use scoap_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    EvaluateCompliance { article_id: ArticleId },
    /// Import the records at sorted positions `[lower, upper)` under `prefix`.
    ImportRange { prefix: String, lower: usize, upper: usize },
    /// Re-link author affiliations for already imported records at `[lower, upper)` under `prefix`.
    LinkAffiliations { prefix: String, lower: usize, upper: usize },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EvaluateCompliance { .. } => "evaluate_compliance",
            Self::ImportRange { .. } => "import_range",
            Self::LinkAffiliations { .. } => "link_affiliations",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task queue is closed")]
    Closed,
}

/// At-least-once delivery of tasks to whatever executes them.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn submit(&self, task: Task) -> Result<(), DispatchError>;
}

/// Executes one task. Errors are retried by the pool.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<()>;
}

/// Producer side of the in-process queue. Tracks submitted-but-unfinished tasks so callers can wait for quiescence.
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Task>,
    outstanding: watch::Sender<usize>,
}

impl TaskQueue {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Task>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0);
        (Arc::new(Self { sender, outstanding }), receiver)
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Resolves once every submitted task, including tasks submitted by running tasks, has finished.
    pub async fn wait_idle(&self) {
        let mut idle = self.outstanding.subscribe();
        let _ = idle.wait_for(|count| *count == 0).await;
    }

    fn finish_one(&self) {
        self.outstanding.send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[async_trait]
impl TaskDispatcher for TaskQueue {
    async fn submit(&self, task: Task) -> Result<(), DispatchError> {
        self.outstanding.send_modify(|count| *count += 1);
        debug!(task = task.name(), "task submitted");
        self.sender.send(task).map_err(|_| {
            self.finish_one();
            DispatchError::Closed
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Consumer side: runs queued tasks with bounded concurrency, retrying failures with backoff.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    worker: JoinHandle<()>,
}

impl WorkerPool {
    pub fn start(
        queue: Arc<TaskQueue>,
        mut receiver: mpsc::UnboundedReceiver<Task>,
        handler: Arc<dyn TaskHandler>,
        config: WorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let tracker = queue.clone();
        let worker = tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let handler = handler.clone();
                let tracker = tracker.clone();
                let span = info_span!("task", kind = task.name());
                tokio::spawn(
                    async move {
                        run_with_retries(handler.as_ref(), &task, config.backoff).await;
                        drop(permit);
                        tracker.finish_one();
                    }
                    .instrument(span),
                );
            }
        });
        Self { queue, worker }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Waits for queued work to drain, then stops the pool.
    pub async fn shutdown(self) {
        self.queue.wait_idle().await;
        self.worker.abort();
    }
}

async fn run_with_retries(handler: &dyn TaskHandler, task: &Task, backoff: BackoffPolicy) {
    let mut attempt = 0usize;
    loop {
        match handler.handle(task).await {
            Ok(()) => return,
            Err(err) if attempt < backoff.max_retries => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %err, "task failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!(?task, error = %err, "task failed; giving up");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Flaky {
        failures_left: AtomicUsize,
        seen: Mutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, task: &Task) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(task.clone());
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("transient");
            }
            Ok(())
        }
    }

    fn fast_backoff(max_retries: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let handler = Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let (queue, receiver) = TaskQueue::new();
        let pool = WorkerPool::start(queue.clone(), receiver, handler.clone(), fast_backoff(3));

        queue.submit(Task::EvaluateCompliance { article_id: 7 }).await.unwrap();
        pool.shutdown().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 3);
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn gives_up_after_the_retry_budget() {
        let handler = Arc::new(Flaky {
            failures_left: AtomicUsize::new(10),
            ..Default::default()
        });
        let (queue, receiver) = TaskQueue::new();
        let pool = WorkerPool::start(queue.clone(), receiver, handler.clone(), fast_backoff(1));

        queue
            .submit(Task::ImportRange {
                prefix: "legacy/".into(),
                lower: 0,
                upper: 10,
            })
            .await
            .unwrap();
        pool.shutdown().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn closed_queue_rejects_and_stays_balanced() {
        let (queue, receiver) = TaskQueue::new();
        drop(receiver);
        let err = queue.submit(Task::EvaluateCompliance { article_id: 1 }).await.unwrap_err();
        assert!(matches!(err, DispatchError::Closed));
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn tasks_serialize_with_a_kind_tag() {
        let json = serde_json::to_value(Task::LinkAffiliations {
            prefix: "legacy/".into(),
            lower: 0,
            upper: 1000,
        })
        .unwrap();
        assert_eq!(json["kind"], "link_affiliations");
        assert_eq!(json["upper"], 1000);
    }
}
