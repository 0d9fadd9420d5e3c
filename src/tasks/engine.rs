//! Producer/worker-pool task engine.
//!
//! One producer per node polls for `pending` tasks, runs the handler's
//! pre-check, and claims each claimable task with a conditional update
//! that exactly one node can win.  Claimed tasks go onto a bounded
//! queue; a full queue back-pressures the producer.  A fixed pool of
//! workers executes jobs, appending a log row per attempt.  Failures
//! are requeued until the retry budget is exhausted, then the task
//! fails permanently.
//!
//! Ordered shutdown stops the producer, lets workers finish their
//! current jobs, and resets every task still `running` under this
//! node's name back to `pending` so nothing is lost across a restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::HandlerTable;
use crate::config::TaskConfig;
use crate::metadata::{MetadataStore, TaskRecord, TaskStatus};

struct EngineInner {
    store: Arc<dyn MetadataStore>,
    handlers: HandlerTable,
    node: String,
    retry_budget: i64,
}

/// Running task engine.  Call [`Engine::shutdown`] for an ordered stop.
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown_tx: watch::Sender<bool>,
    producer: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Spawn the producer and worker pool.
    pub fn start(
        store: Arc<dyn MetadataStore>,
        handlers: HandlerTable,
        node: impl Into<String>,
        config: &TaskConfig,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            store,
            handlers,
            node: node.into(),
            retry_budget: config.retry_budget,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (job_tx, job_rx) = mpsc::channel::<TaskRecord>(config.queue_depth);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let producer = tokio::spawn(run_producer(
            inner.clone(),
            job_tx,
            Duration::from_millis(config.poll_interval_ms),
            shutdown_rx.clone(),
        ));

        let workers = (0..config.workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    inner.clone(),
                    job_rx.clone(),
                    shutdown_rx.clone(),
                    worker_id,
                ))
            })
            .collect();

        Self {
            inner,
            shutdown_tx,
            producer,
            workers,
        }
    }

    /// Ordered shutdown.  Returns the number of tasks reset to `pending`.
    pub async fn shutdown(self) -> anyhow::Result<usize> {
        let _ = self.shutdown_tx.send(true);
        let _ = self.producer.await;
        for worker in self.workers {
            let _ = worker.await;
        }
        // Claimed-but-unfinished tasks must not stay `running` forever.
        let reset = self.inner.store.reset_node_tasks(&self.inner.node).await?;
        if reset > 0 {
            info!(reset, "requeued tasks owned by this node");
        }
        Ok(reset)
    }
}

async fn run_producer(
    inner: Arc<EngineInner>,
    job_tx: mpsc::Sender<TaskRecord>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {
                info!("task producer stopping");
                return;
            }
        }

        let pending = match inner.store.list_tasks_by_status(TaskStatus::Pending).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "listing pending tasks failed");
                continue;
            }
        };

        for task in pending {
            // Unknown kinds are still claimed so a worker can fail them
            // with a recorded error instead of leaving them invisible.
            if let Some(handler) = inner.handlers.get(&task.kind) {
                match handler.pre_check(&task).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(task_id = task.id, error = %e, "pre-check failed");
                        continue;
                    }
                }
            }

            match inner.store.claim_task(task.id, &inner.node).await {
                Ok(true) => {
                    // A full queue blocks here, throttling the producer.
                    if job_tx.send(task).await.is_err() {
                        return;
                    }
                }
                Ok(false) => {} // another node won the claim
                Err(e) => warn!(task_id = task.id, error = %e, "task claim failed"),
            }
        }
    }
}

async fn run_worker(
    inner: Arc<EngineInner>,
    job_rx: Arc<Mutex<mpsc::Receiver<TaskRecord>>>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: usize,
) {
    loop {
        let task = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else {
            info!(worker_id, "task worker stopping");
            return;
        };
        execute(&inner, task).await;
    }
}

/// Run one claimed task to completion, recording the attempt.
async fn execute(inner: &EngineInner, task: TaskRecord) {
    let log_id = match inner
        .store
        .insert_task_log(task.id, TaskStatus::Running)
        .await
    {
        Ok(id) => {
            if let Err(e) = inner.store.set_task_log(task.id, id).await {
                warn!(task_id = task.id, error = %e, "linking task log failed");
            }
            Some(id)
        }
        Err(e) => {
            warn!(task_id = task.id, error = %e, "appending task log failed");
            None
        }
    };

    let outcome = match inner.handlers.get(&task.kind) {
        Some(handler) => handler.run(&task).await,
        None => Err(anyhow::anyhow!("no handler registered for kind {}", task.kind)),
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = inner.store.finish_task(task.id).await {
                error!(task_id = task.id, error = %e, "marking task done failed");
            }
            if let Some(log_id) = log_id {
                let _ = inner
                    .store
                    .update_task_log(log_id, TaskStatus::Done, "")
                    .await;
            }
        }
        Err(run_err) => {
            // An unregistered kind fails permanently without retries.
            let retryable = inner.handlers.get(&task.kind).is_some()
                && task.execute_count + 1 < inner.retry_budget;
            let result = if retryable {
                inner.store.requeue_task(task.id).await
            } else {
                inner.store.fail_task(task.id).await
            };
            if let Err(e) = result {
                error!(task_id = task.id, error = %e, "recording task failure failed");
            }
            warn!(
                task_id = task.id,
                kind = %task.kind,
                attempt = task.execute_count + 1,
                retryable,
                error = %run_err,
                "task attempt failed"
            );
            if let Some(log_id) = log_id {
                let _ = inner
                    .store
                    .update_task_log(log_id, TaskStatus::Failed, &run_err.to_string())
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::tasks::TaskHandler;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Handler that fails its first `fail_first` attempts, then succeeds.
    struct FlakyHandler {
        attempts: AtomicI64,
        fail_first: i64,
        delay: Duration,
    }

    impl FlakyHandler {
        fn new(fail_first: i64) -> Self {
            Self {
                attempts: AtomicI64::new(0),
                fail_first,
                delay: Duration::ZERO,
            }
        }
    }

    impl TaskHandler for FlakyHandler {
        fn pre_check(
            &self,
            _task: &TaskRecord,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
            Box::pin(async move { Ok(true) })
        }

        fn run(
            &self,
            _task: &TaskRecord,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= self.fail_first {
                    anyhow::bail!("induced failure on attempt {attempt}");
                }
                Ok(())
            })
        }
    }

    fn test_config() -> TaskConfig {
        TaskConfig {
            workers: 2,
            queue_depth: 16,
            poll_interval_ms: 10,
            retry_budget: 5,
        }
    }

    fn store() -> Arc<dyn MetadataStore> {
        Arc::new(SqliteMetadataStore::new(":memory:").unwrap())
    }

    async fn wait_for_status(
        store: &Arc<dyn MetadataStore>,
        id: i64,
        status: TaskStatus,
    ) -> TaskRecord {
        for _ in 0..300 {
            let task = store.get_task(id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_successful_task_runs_once() {
        let store = store();
        store.insert_task(1, "merge", "{}").await.unwrap();

        let handlers =
            HandlerTable::new().with("merge", Arc::new(FlakyHandler::new(0)));
        let engine = Engine::start(store.clone(), handlers, "node-a", &test_config());

        let task = wait_for_status(&store, 1, TaskStatus::Done).await;
        assert_eq!(task.execute_count, 1);
        assert_eq!(task.node, "node-a");
        engine.shutdown().await.unwrap();

        let logs = store.list_task_logs(1).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, TaskStatus::Done);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_budget_exhaustion_fails_permanently() {
        let store = store();
        store.insert_task(1, "merge", "{}").await.unwrap();

        let handlers =
            HandlerTable::new().with("merge", Arc::new(FlakyHandler::new(i64::MAX)));
        let engine = Engine::start(store.clone(), handlers, "node-a", &test_config());

        let task = wait_for_status(&store, 1, TaskStatus::Failed).await;
        assert_eq!(task.execute_count, 5);
        engine.shutdown().await.unwrap();

        // Permanently failed: never picked up again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = store.get_task(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.execute_count, 5);
        let logs = store.list_task_logs(1).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert!(logs.iter().all(|l| l.status == TaskStatus::Failed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recovery_on_last_allowed_attempt() {
        let store = store();
        store.insert_task(1, "merge", "{}").await.unwrap();

        // Fails four times, succeeds on the fifth and final attempt.
        let handlers =
            HandlerTable::new().with("merge", Arc::new(FlakyHandler::new(4)));
        let engine = Engine::start(store.clone(), handlers, "node-a", &test_config());

        let task = wait_for_status(&store, 1, TaskStatus::Done).await;
        assert_eq!(task.execute_count, 5);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_kind_fails_without_retries() {
        let store = store();
        store.insert_task(1, "defrag", "{}").await.unwrap();

        let handlers =
            HandlerTable::new().with("merge", Arc::new(FlakyHandler::new(0)));
        let engine = Engine::start(store.clone(), handlers, "node-a", &test_config());

        let task = wait_for_status(&store, 1, TaskStatus::Failed).await;
        // One attempt, no retry loop for an unregistered kind.
        assert_eq!(task.execute_count, 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pre_check_false_leaves_task_pending() {
        struct NeverMine;
        impl TaskHandler for NeverMine {
            fn pre_check(
                &self,
                _task: &TaskRecord,
            ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
                Box::pin(async move { Ok(false) })
            }
            fn run(
                &self,
                _task: &TaskRecord,
            ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
                Box::pin(async move { Ok(()) })
            }
        }

        let store = store();
        store.insert_task(1, "merge", "{}").await.unwrap();

        let handlers = HandlerTable::new().with("merge", Arc::new(NeverMine));
        let engine = Engine::start(store.clone(), handlers, "node-a", &test_config());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let task = store.get_task(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.execute_count, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_never_leaves_running_tasks() {
        let store = store();
        for id in 1..=6 {
            store.insert_task(id, "merge", "{}").await.unwrap();
        }

        let slow = FlakyHandler {
            attempts: AtomicI64::new(0),
            fail_first: 0,
            delay: Duration::from_millis(100),
        };
        let handlers = HandlerTable::new().with("merge", Arc::new(slow));
        let config = TaskConfig {
            workers: 1,
            ..test_config()
        };
        let engine = Engine::start(store.clone(), handlers, "node-a", &config);

        // Let the producer claim a batch, then stop mid-flight.
        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.shutdown().await.unwrap();

        for id in 1..=6 {
            let task = store.get_task(id).await.unwrap().unwrap();
            assert_ne!(
                task.status,
                TaskStatus::Running,
                "task {id} stuck running after ordered shutdown"
            );
            if task.status == TaskStatus::Pending {
                assert_eq!(task.node, "", "requeued task {id} must have owner cleared");
            }
        }
    }
}
