//! Deferred Task Queue
//!
//! handler 和 Provider 在请求期间注册的任务，只有在传输层确认响应已经交出
//! （`PendingTasks::on_response_sent`）之后才会按注册顺序依次执行。
//! 每个任务的失败或 panic 都被单独捕获并记录，不会影响后续任务，也不会返回给客户端。

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::error::TaskError;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// 一个延迟任务
pub struct DeferredTask {
    name: String,
    job: Job,
}

impl DeferredTask {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTask").field("name", &self.name).finish()
    }
}

#[derive(Default)]
struct QueueState {
    tasks: Vec<DeferredTask>,
    sealed: bool,
}

/// 任务注册句柄，可以在请求内任意克隆传递
#[derive(Clone, Default)]
pub struct DeferredQueue {
    state: Arc<Mutex<QueueState>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册同步任务
    ///
    /// 队列已经封存（请求已结束）时返回 `false`，任务被丢弃。
    pub fn add_task<F>(&self, name: impl Into<String>, task: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.push(DeferredTask {
            name: name.into(),
            job: Box::new(move || async move { task() }.boxed()),
        })
    }

    /// 注册异步任务
    pub fn add_async_task<Fut>(&self, name: impl Into<String>, task: Fut) -> bool
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(DeferredTask {
            name: name.into(),
            job: Box::new(move || task.boxed()),
        })
    }

    fn push(&self, task: DeferredTask) -> bool {
        let mut state = self.state.lock();
        if state.sealed {
            tracing::warn!(
                "Deferred task '{}' registered after the request completed, discarding",
                task.name
            );
            return false;
        }
        tracing::debug!("Deferred task registered: '{}'", task.name);
        state.tasks.push(task);
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    /// 封存队列，取出所有已注册任务
    pub(crate) fn seal(&self) -> PendingTasks {
        let mut state = self.state.lock();
        state.sealed = true;
        PendingTasks {
            tasks: std::mem::take(&mut state.tasks),
            fired: false,
        }
    }
}

impl std::fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeferredQueue")
            .field("tasks", &state.tasks.len())
            .field("sealed", &state.sealed)
            .finish()
    }
}

/// 等待"响应已发送"信号的任务
///
/// 如果传输层在触发信号之前就丢弃了它（例如 hyper 写完响应体后直接丢弃流），
/// 任务会被转交给当前的 tokio runtime 执行。请求被取消时调用 [`discard`](Self::discard)。
#[derive(Debug)]
pub struct PendingTasks {
    tasks: Vec<DeferredTask>,
    fired: bool,
}

impl PendingTasks {
    pub fn empty() -> Self {
        Self {
            tasks: Vec::new(),
            fired: false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(DeferredTask::name).collect()
    }

    /// 响应已交给传输层，按注册顺序执行所有任务
    pub async fn on_response_sent(mut self) -> TaskReport {
        self.fired = true;
        let tasks = std::mem::take(&mut self.tasks);
        run_tasks(tasks).await
    }

    /// 响应不会再发送，丢弃所有任务
    pub fn discard(&mut self) {
        self.fired = true;
        let tasks = std::mem::take(&mut self.tasks);
        if !tasks.is_empty() {
            tracing::debug!("Request was cancelled, discarding {} deferred task(s)", tasks.len());
        }
    }
}

impl Drop for PendingTasks {
    fn drop(&mut self) {
        if self.fired || self.tasks.is_empty() {
            return;
        }

        let tasks = std::mem::take(&mut self.tasks);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(
                    "Response hook never fired, spawning {} deferred task(s)",
                    tasks.len()
                );
                handle.spawn(run_tasks(tasks));
            }
            Err(_) => {
                tracing::warn!(
                    "No tokio runtime available, dropping {} deferred task(s)",
                    tasks.len()
                );
            }
        }
    }
}

/// 任务执行结果
#[derive(Debug, Default)]
pub struct TaskReport {
    pub completed: Vec<String>,
    pub failures: Vec<TaskError>,
}

impl TaskReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

async fn run_tasks(tasks: Vec<DeferredTask>) -> TaskReport {
    let mut report = TaskReport::default();

    for task in tasks {
        let DeferredTask { name, job } = task;
        tracing::trace!("Running deferred task '{}'", name);

        match AssertUnwindSafe(async move { job().await }).catch_unwind().await {
            Ok(Ok(())) => report.completed.push(name),
            Ok(Err(error)) => {
                tracing::warn!("Deferred task '{}' failed: {:#}", name, error);
                report.failures.push(TaskError::Failed { task: name, error });
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Deferred task '{}' panicked: {}", name, message);
                report.failures.push(TaskError::Panicked {
                    task: name,
                    message,
                });
            }
        }
    }

    report
}

/// 从 panic 负载中提取消息
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic occurred".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_tasks_run_in_registration_order() {
        let queue = DeferredQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            queue.add_task(format!("task-{}", i), move || {
                log.lock().push(i);
                Ok(())
            });
        }

        let pending = queue.seal();
        assert_eq!(pending.names(), vec!["task-0", "task-1", "task-2"]);
        assert!(log.lock().is_empty());

        let report = pending.on_response_sent().await;
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(report.completed.len(), 3);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_tasks() {
        let queue = DeferredQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.add_task("fails", || Err(anyhow::anyhow!("disk full")));
        let c = Arc::clone(&counter);
        queue.add_async_task("counts", async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = queue.seal().on_response_sent().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(report.completed, vec!["counts"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].task(), "fails");
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated() {
        let queue = DeferredQueue::new();
        queue.add_task("panics", || panic!("boom"));
        queue.add_task("after", || Ok(()));

        let report = queue.seal().on_response_sent().await;
        assert_eq!(report.completed, vec!["after"]);
        match &report.failures[0] {
            TaskError::Panicked { message, .. } => assert_eq!(message, "boom"),
            other => panic!("expected panic failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sealed_queue_rejects_tasks() {
        let queue = DeferredQueue::new();
        assert!(queue.add_task("first", || Ok(())));

        let pending = queue.seal();
        assert!(!queue.add_task("late", || Ok(())));
        assert_eq!(pending.len(), 1);
        pending.on_response_sent().await;
    }

    #[tokio::test]
    async fn test_dropped_tasks_are_spawned() {
        let queue = DeferredQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        queue.add_task("orphan", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        drop(queue.seal());
        for _ in 0..10 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discarded_tasks_never_run() {
        let queue = DeferredQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        queue.add_task("unsent", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut pending = queue.seal();
        pending.discard();
        assert!(pending.is_empty());
        drop(pending);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
