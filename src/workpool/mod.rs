//! Workpool: partitioned, at-least-once, retrying task dispatcher with
//! bounded global parallelism and FIFO-per-partition ordering.

pub mod retry;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{error, warn};

pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum WorkpoolError {
    #[error("task handler failed: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, WorkpoolError>;

/// Opaque payload passed to a [`TaskHandler`]; the runtime does not
/// interpret it, only routes and retries it.
pub type TaskArgs = serde_json::Value;

/// Status of a durable task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Dead,
    Cancelled,
}

/// A durable record of one enqueued task.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub target_ref: String,
    pub args: TaskArgs,
    pub partition_key: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

/// Options accepted by [`Workpool::enqueue`]; unset fields fall back to the
/// pool's [`retry::RetryPolicy`] defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub partition_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub base: Option<f64>,
}

/// A handler invoked for each attempt of a task. Handlers must be
/// idempotent: the pool resumes the *attempt*, not a partial mutation,
/// after a crash.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, target_ref: &str, args: &TaskArgs) -> Result<()>;
}

/// Invoked once a task is dead-lettered (retries exhausted) or cancelled,
/// so the owning subsystem (projection engine, saga runtime, ...) can
/// record a dead-letter row for its own domain.
#[async_trait]
pub trait OnComplete: Send + Sync {
    async fn on_dead(&self, task: &Task);
}

struct PartitionQueue {
    tasks: VecDeque<Task>,
    notify: Arc<Notify>,
}

struct Inner {
    partitions: Mutex<std::collections::HashMap<String, Arc<Mutex<PartitionQueue>>>>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    handler: Arc<dyn TaskHandler>,
    on_complete: Arc<dyn OnComplete>,
}

/// In-process [`Workpool`]: cooperative, single-writer per partition key,
/// bounded global parallelism via a semaphore.
#[derive(Clone)]
pub struct Workpool {
    inner: Arc<Inner>,
}

impl Workpool {
    pub fn new(
        max_parallelism: usize,
        policy: RetryPolicy,
        handler: Arc<dyn TaskHandler>,
        on_complete: Arc<dyn OnComplete>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: Mutex::new(std::collections::HashMap::new()),
                semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
                policy,
                handler,
                on_complete,
            }),
        }
    }

    /// Enqueue a task and spawn its partition worker if one isn't already
    /// running for this key.
    pub async fn enqueue(
        &self,
        target_ref: impl Into<String>,
        args: TaskArgs,
        opts: EnqueueOptions,
    ) -> String {
        let task_id = crate::ids::new_id();
        let partition_key = opts.partition_key.unwrap_or_else(|| task_id.clone());
        let task = Task {
            task_id: task_id.clone(),
            target_ref: target_ref.into(),
            args,
            partition_key: partition_key.clone(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: opts.max_attempts.unwrap_or(self.inner.policy.max_attempts),
            last_error: None,
        };

        let policy = RetryPolicy {
            max_attempts: task.max_attempts,
            initial_backoff_ms: opts
                .initial_backoff_ms
                .unwrap_or(self.inner.policy.initial_backoff_ms),
            base: opts.base.unwrap_or(self.inner.policy.base),
            max_backoff_ms: self.inner.policy.max_backoff_ms,
        };

        let mut partitions = self.inner.partitions.lock().await;
        let spawn_worker = !partitions.contains_key(&partition_key);
        let queue = partitions
            .entry(partition_key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PartitionQueue {
                    tasks: VecDeque::new(),
                    notify: Arc::new(Notify::new()),
                }))
            })
            .clone();
        drop(partitions);

        {
            let mut q = queue.lock().await;
            q.tasks.push_back(task);
            q.notify.notify_one();
        }

        if spawn_worker {
            let inner = self.inner.clone();
            tokio::spawn(run_partition(inner, queue, policy));
        }

        task_id
    }
}

async fn run_partition(inner: Arc<Inner>, queue: Arc<Mutex<PartitionQueue>>, policy: RetryPolicy) {
    loop {
        let task = {
            let mut q = queue.lock().await;
            match q.tasks.pop_front() {
                Some(t) => t,
                None => {
                    let notify = q.notify.clone();
                    drop(q);
                    // Park briefly; a fresh enqueue on this key notifies us.
                    tokio::select! {
                        _ = notify.notified() => continue,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => return,
                    }
                }
            }
        };

        run_task_with_retries(&inner, task, &policy).await;
    }
}

async fn run_task_with_retries(inner: &Arc<Inner>, mut task: Task, policy: &RetryPolicy) {
    let _permit = inner.semaphore.acquire().await;
    let mut attempt = 0u32;
    let start = std::time::Instant::now();

    loop {
        task.status = TaskStatus::Running;
        task.attempt_count = attempt + 1;

        match inner.handler.handle(&task.target_ref, &task.args).await {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                #[cfg(feature = "otel")]
                {
                    use crate::metrics::{self, WORKPOOL_TASK_DURATION};
                    WORKPOOL_TASK_DURATION.record(
                        start.elapsed().as_secs_f64(),
                        &[metrics::outcome_attr("success"), metrics::component_attr(&task.target_ref)],
                    );
                }
                return;
            }
            Err(e) => {
                task.last_error = Some(e.to_string());
                attempt += 1;
                #[cfg(feature = "otel")]
                {
                    use crate::metrics::{self, WORKPOOL_TASK_RETRY_TOTAL};
                    WORKPOOL_TASK_RETRY_TOTAL.add(1, &[metrics::component_attr(&task.target_ref)]);
                }
                if attempt >= task.max_attempts {
                    task.status = TaskStatus::Dead;
                    error!(
                        task_id = %task.task_id,
                        target = %task.target_ref,
                        attempts = attempt,
                        error = %e,
                        "task exhausted retries, dead-lettering"
                    );
                    #[cfg(feature = "otel")]
                    {
                        use crate::metrics::{self, WORKPOOL_TASK_DEAD_TOTAL, WORKPOOL_TASK_DURATION};
                        WORKPOOL_TASK_DEAD_TOTAL.add(1, &[metrics::component_attr(&task.target_ref)]);
                        WORKPOOL_TASK_DURATION.record(
                            start.elapsed().as_secs_f64(),
                            &[metrics::outcome_attr("dead"), metrics::component_attr(&task.target_ref)],
                        );
                    }
                    inner.on_complete.on_dead(&task).await;
                    return;
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    task_id = %task.task_id,
                    target = %task.target_ref,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "task failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicU32>,
        fail_first_n: u32,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _target_ref: &str, _args: &TaskArgs) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first_n {
                return Err(WorkpoolError::Handler("transient".to_string()));
            }
            Ok(())
        }
    }

    struct RecordingOnComplete {
        dead: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OnComplete for RecordingOnComplete {
        async fn on_dead(&self, task: &Task) {
            self.dead.lock().await.push(task.task_id.clone());
        }
    }

    #[tokio::test]
    async fn task_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let dead = Arc::new(Mutex::new(Vec::new()));
        let pool = Workpool::new(
            4,
            RetryPolicy {
                max_attempts: 5,
                initial_backoff_ms: 1,
                base: 1.0,
                max_backoff_ms: 10,
            },
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_first_n: 2,
            }),
            Arc::new(RecordingOnComplete { dead: dead.clone() }),
        );

        pool.enqueue("orders.project", serde_json::json!({}), EnqueueOptions::default())
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(dead.lock().await.is_empty());
    }

    #[tokio::test]
    async fn task_dead_letters_after_exhausting_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let dead = Arc::new(Mutex::new(Vec::new()));
        let pool = Workpool::new(
            4,
            RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 1,
                base: 1.0,
                max_backoff_ms: 10,
            },
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_first_n: 100,
            }),
            Arc::new(RecordingOnComplete { dead: dead.clone() }),
        );

        pool.enqueue("orders.project", serde_json::json!({}), EnqueueOptions::default())
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dead.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_partitions_run_independently() {
        let calls = Arc::new(AtomicU32::new(0));
        let dead = Arc::new(Mutex::new(Vec::new()));
        let pool = Workpool::new(
            4,
            RetryPolicy::default(),
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_first_n: 0,
            }),
            Arc::new(RecordingOnComplete { dead }),
        );

        for key in ["a", "b", "c"] {
            pool.enqueue(
                "orders.project",
                serde_json::json!({}),
                EnqueueOptions {
                    partition_key: Some(key.to_string()),
                    ..Default::default()
                },
            )
            .await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
