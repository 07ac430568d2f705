//! Single-flight FIFO executor for relay tasks.
//!
//! All queue and lock state is owned by one actor task; callers only send it
//! messages. A task runs on its own tokio task so a panic is contained, and
//! the actor is told when it finishes. The lock is a busy-since timestamp: a
//! start request that finds it younger than `lock_timeout` is dropped (the
//! running task drains the queue when done), one that finds it older assumes
//! the holder died and overrides it.
//!
//! The override is a heuristic, not mutual exclusion. A task that is merely
//! slower than `lock_timeout` will overlap with the next one, and its own
//! completion still clears the lock.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::stats::RelayStats;

/// How long a running task may hold the lock before it is presumed dead.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type BoxedTask = Box<dyn FnOnce() -> TaskFuture + Send>;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub lock_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lock_timeout: LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("executor is shut down")]
pub struct ExecutorClosed;

struct QueuedTask {
    label: String,
    run: BoxedTask,
}

enum Command {
    Enqueue(QueuedTask),
    /// A task finished (successfully or not).
    Finished { label: String },
    /// Re-trigger sent after a task finished with work still queued.
    Resume,
}

/// Handle to the executor actor. Cheap to clone.
#[derive(Clone)]
pub struct SequentialExecutor {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for SequentialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialExecutor")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SequentialExecutor {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(config: ExecutorConfig, stats: Arc<RelayStats>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ExecutorActor {
            config,
            stats,
            tx: tx.downgrade(),
            lock: None,
            queue: VecDeque::new(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Append `task` to the queue and try to start it right away.
    pub fn enqueue<F, Fut>(&self, label: impl Into<String>, task: F) -> Result<(), ExecutorClosed>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let run: BoxedTask = Box::new(move || Box::pin(task()) as TaskFuture);
        self.tx
            .send(Command::Enqueue(QueuedTask {
                label: label.into(),
                run,
            }))
            .map_err(|_| ExecutorClosed)
    }
}

struct ExecutorActor {
    config: ExecutorConfig,
    stats: Arc<RelayStats>,
    // Weak so the actor exits once every handle is dropped and no task is in flight.
    tx: mpsc::WeakUnboundedSender<Command>,
    lock: Option<Instant>,
    queue: VecDeque<QueuedTask>,
}

impl ExecutorActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Enqueue(task) => {
                    RelayStats::inc(&self.stats.tasks_enqueued);
                    self.queue.push_back(task);
                    self.try_start();
                }
                Command::Finished { label } => {
                    tracing::debug!(task=%label, queued = self.queue.len(), "task finished");
                    self.lock = None;
                    if !self.queue.is_empty() {
                        if let Some(tx) = self.tx.upgrade() {
                            let _ = tx.send(Command::Resume);
                        }
                    }
                }
                Command::Resume => self.try_start(),
            }
        }
        tracing::debug!("executor stopped");
    }

    fn try_start(&mut self) {
        if let Some(since) = self.lock {
            let age = since.elapsed();
            if age < self.config.lock_timeout {
                return;
            }
            tracing::warn!(
                lock_age_ms = age.as_millis() as u64,
                "stale processing lock detected, overriding"
            );
            RelayStats::inc(&self.stats.stale_lock_overrides);
        }

        let Some(task) = self.queue.pop_front() else {
            return;
        };
        let Some(tx) = self.tx.upgrade() else {
            return;
        };

        self.lock = Some(Instant::now());
        let stats = self.stats.clone();
        let QueuedTask { label, run } = task;
        tracing::debug!(task=%label, "task started");

        tokio::spawn(async move {
            // The closure itself runs in the guarded task so a panic while
            // building the future is caught too.
            match tokio::spawn(async move { run().await }).await {
                Ok(Ok(())) => RelayStats::inc(&stats.tasks_succeeded),
                Ok(Err(e)) => {
                    RelayStats::inc(&stats.tasks_failed);
                    tracing::error!(task=%label, error=%format!("{e:#}"), "task processing failed");
                }
                Err(e) => {
                    RelayStats::inc(&stats.tasks_failed);
                    tracing::error!(task=%label, error=%e, "task panicked");
                }
            }
            let _ = tx.send(Command::Finished { label });
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use super::*;

    type Spans = Arc<Mutex<Vec<(&'static str, Instant, Instant)>>>;

    fn executor() -> (SequentialExecutor, Arc<RelayStats>) {
        let stats = Arc::new(RelayStats::default());
        (
            SequentialExecutor::spawn(ExecutorConfig::default(), stats.clone()),
            stats,
        )
    }

    fn timed_task(
        name: &'static str,
        spans: Spans,
        work: Duration,
        done: mpsc::UnboundedSender<&'static str>,
    ) -> impl FnOnce() -> TaskFuture {
        move || {
            Box::pin(async move {
                let start = Instant::now();
                tokio::time::sleep(work).await;
                spans.lock().unwrap().push((name, start, Instant::now()));
                let _ = done.send(name);
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_never_overlap_and_keep_order() {
        let (exec, stats) = executor();
        let spans: Spans = Arc::default();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for name in ["a", "b", "c"] {
            exec.enqueue(
                name,
                timed_task(name, spans.clone(), Duration::from_millis(200), done_tx.clone()),
            )
            .unwrap();
        }
        for _ in 0..3 {
            done_rx.recv().await.unwrap();
        }

        let spans = spans.lock().unwrap().clone();
        let order: Vec<&str> = spans.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        for pair in spans.windows(2) {
            let (_, _, prev_end) = pair[0];
            let (_, next_start, _) = pair[1];
            assert!(next_start >= prev_end, "tasks overlapped: {spans:?}");
        }
        assert_eq!(stats.stale_lock_overrides.load(Ordering::Relaxed), 0);
    }

    fn panic_requested() -> bool {
        true
    }

    #[tokio::test]
    async fn test_failures_do_not_halt_queue() {
        let (exec, stats) = executor();
        let (done_tx, done_rx) = oneshot::channel();

        exec.enqueue("fails", || async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .unwrap();
        exec.enqueue("panics", || async {
            if panic_requested() {
                panic!("task blew up");
            }
            Ok(())
        })
        .unwrap();
        exec.enqueue("runs", move || async move {
            let _ = done_tx.send(());
            Ok(())
        })
        .unwrap();

        done_rx.await.unwrap();
        assert_eq!(stats.tasks_failed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_before_future_releases_lock() {
        let (exec, stats) = executor();
        let (next_tx, next_rx) = oneshot::channel();

        exec.enqueue("panics-building", || {
            let empty: Vec<u8> = Vec::new();
            let _ = empty[3];
            async { Ok::<(), anyhow::Error>(()) }
        })
        .unwrap();
        exec.enqueue("next", move || async move {
            let _ = next_tx.send(());
            Ok(())
        })
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), next_rx)
            .await
            .expect("queued task stalled behind a panicking closure")
            .unwrap();
        assert_eq!(stats.tasks_failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.stale_lock_overrides.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_young_lock_defers_next_task() {
        let (exec, _stats) = executor();
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (second_tx, mut second_rx) = oneshot::channel();

        exec.enqueue("slow", move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        })
        .unwrap();
        started_rx.await.unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        exec.enqueue("next", move || async move {
            let _ = second_tx.send(());
            Ok(())
        })
        .unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), &mut second_rx).await;
        assert!(waited.is_err(), "second task started while lock was held");

        release_tx.send(()).unwrap();
        second_rx.await.unwrap();
    }

    /// A task hung past the lock timeout is presumed dead: the next enqueue
    /// overrides the lock and runs while the first is still pending.
    #[tokio::test(start_paused = true)]
    async fn test_stale_lock_is_overridden() {
        let (exec, stats) = executor();
        let (started_tx, started_rx) = oneshot::channel();
        let (_hold, never) = oneshot::channel::<()>();
        let first_finished = Arc::new(AtomicBool::new(false));
        let (second_tx, second_rx) = oneshot::channel();

        let flag = first_finished.clone();
        exec.enqueue("hung", move || async move {
            let _ = started_tx.send(());
            let _ = never.await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        started_rx.await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        exec.enqueue("rescuer", move || async move {
            let _ = second_tx.send(());
            Ok(())
        })
        .unwrap();

        second_rx.await.unwrap();
        assert!(!first_finished.load(Ordering::SeqCst));
        assert_eq!(stats.stale_lock_overrides.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_idle_starts_immediately() {
        let (exec, stats) = executor();
        for _ in 0..2 {
            let (tx, rx) = oneshot::channel();
            exec.enqueue("one-shot", move || async move {
                let _ = tx.send(());
                Ok(())
            })
            .unwrap();
            rx.await.unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(stats.tasks_enqueued.load(Ordering::Relaxed), 2);
    }
}
