//! 请求生命周期
//!
//! 把一次请求串起来：创建作用域 → 解析依赖 → 执行 handler → teardown → 封存延迟任务。
//! 延迟任务不会在这里执行，调用方在响应交给传输层之后触发
//! [`PendingTasks::on_response_sent`]。

use std::future::Future;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::Instrument;

use crate::config::ResolverProperties;
use crate::error::{RequestError, ResolutionError};
use crate::graph::EvaluationPlan;
use crate::inputs::RequestInputs;
use crate::provider::Bindings;
use crate::resolver::{ResolutionMode, ScopedResolver};
use crate::scope::{next_request_id, CancellationFlag, RequestScope};
use crate::storage::KeyValueStore;
use crate::tasks::{panic_message, DeferredQueue, PendingTasks};
use crate::teardown::{TeardownCoordinator, TeardownReport};

/// handler 收到的上下文
///
/// 通过 `Deref` 直接按绑定名取值：`ctx.get::<FakeDb>("db")?`
pub struct HandlerContext {
    request_id: u64,
    operation: String,
    bindings: Bindings,
    deferred: DeferredQueue,
    storage: Option<Arc<dyn KeyValueStore>>,
    inputs: Arc<RequestInputs>,
}

impl HandlerContext {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// 注册在响应发送之后执行的任务
    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn storage(&self) -> anyhow::Result<&Arc<dyn KeyValueStore>> {
        self.storage
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no storage configured for '{}'", self.operation))
    }

    pub fn inputs(&self) -> &RequestInputs {
        &self.inputs
    }
}

impl Deref for HandlerContext {
    type Target = Bindings;

    fn deref(&self) -> &Self::Target {
        &self.bindings
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("request_id", &self.request_id)
            .field("operation", &self.operation)
            .field("bindings", &self.bindings)
            .finish()
    }
}

/// 一次请求的最终结果
#[derive(Debug)]
pub struct Completion<R> {
    pub request_id: u64,
    pub result: Result<R, RequestError>,
    pub teardown: TeardownReport,

    /// 等待传输层发送响应后触发
    pub tasks: PendingTasks,
}

/// 请求生命周期编排
#[derive(Clone, Default)]
pub struct RequestLifecycle {
    resolver: ScopedResolver,
    storage: Option<Arc<dyn KeyValueStore>>,
}

impl RequestLifecycle {
    pub fn new(mode: ResolutionMode) -> Self {
        Self {
            resolver: ScopedResolver::new(mode),
            storage: None,
        }
    }

    pub fn from_properties(properties: &ResolverProperties) -> Self {
        Self::new(properties.mode)
    }

    /// 注入存储，所有请求共享同一个实例
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn storage(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.storage.as_ref()
    }

    pub fn mode(&self) -> ResolutionMode {
        self.resolver.mode()
    }

    /// 执行一次请求
    pub async fn execute<R, F, Fut>(
        &self,
        operation: &str,
        plan: &EvaluationPlan,
        inputs: RequestInputs,
        cancellation: CancellationFlag,
        handler: F,
    ) -> Completion<R>
    where
        F: FnOnce(HandlerContext) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let request_id = next_request_id();
        let span = tracing::info_span!("request", id = request_id, operation = %operation);

        async move {
            let inputs = Arc::new(inputs);
            let mut scope = RequestScope::new(request_id, plan)
                .with_storage(self.storage.clone())
                .with_cancellation(cancellation);

            tracing::debug!("Resolving {} provider(s)", plan.len());
            let resolved = self.resolver.resolve(plan, &inputs, &mut scope).await;

            let result = match resolved {
                Err(ResolutionError::Cancelled) => Err(RequestError::Cancelled),
                Err(e) => Err(RequestError::Resolution(e)),
                Ok(()) if scope.cancellation().is_cancelled() => Err(RequestError::Cancelled),
                Ok(()) => {
                    let context = HandlerContext {
                        request_id,
                        operation: operation.to_string(),
                        bindings: scope.bindings(plan),
                        deferred: scope.deferred().clone(),
                        storage: scope.storage().cloned(),
                        inputs: Arc::clone(&inputs),
                    };
                    run_handler(handler, context).await
                }
            };

            let (result, teardown) = TeardownCoordinator::run(&mut scope, result).await;
            let mut tasks = scope.deferred().seal();
            if matches!(result, Err(RequestError::Cancelled)) {
                tasks.discard();
            }

            match &result {
                Ok(_) => tracing::debug!(
                    "Request completed ({} deferred task(s))",
                    tasks.len()
                ),
                Err(e) => tracing::debug!("Request failed: {}", e),
            }

            Completion {
                request_id,
                result,
                teardown,
                tasks,
            }
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("mode", &self.resolver.mode())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

async fn run_handler<R, F, Fut>(handler: F, context: HandlerContext) -> Result<R, RequestError>
where
    F: FnOnce(HandlerContext) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    match AssertUnwindSafe(async move { handler(context).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(response)) => Ok(response),
        // handler 内部取值失败（`ctx.get()?`）按解析错误处理
        Ok(Err(error)) => match error.downcast::<ResolutionError>() {
            Ok(resolution) => Err(RequestError::Resolution(resolution)),
            Err(error) => Err(RequestError::Handler(error)),
        },
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!("Handler panicked: {}", message);
            Err(RequestError::Handler(anyhow::anyhow!(
                "handler panicked: {}",
                message
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, TeardownError};
    use crate::graph::{Dependency, DependencyGraphBuilder};
    use crate::provider::{provider_fn, yielding, Param, ProviderDefinition};
    use crate::registry::ProviderRegistry;
    use crate::storage::MemoryStore;
    use crate::teardown::Outcome;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("Owner error: {0}")]
    struct OwnerError(String);

    /// 模拟数据库会话
    struct FakeSession {
        open: AtomicBool,
    }

    fn plan(defs: Vec<ProviderDefinition>, deps: &[Dependency]) -> EvaluationPlan {
        let mut registry = ProviderRegistry::new();
        for d in defs {
            registry.register(d).unwrap();
        }
        registry.validate().unwrap();
        DependencyGraphBuilder::build(&registry, deps).unwrap()
    }

    fn session_provider(log: Arc<Mutex<Vec<String>>>) -> ProviderDefinition {
        ProviderDefinition::new(
            "get_db",
            yielding(
                |_args| async move {
                    Ok(FakeSession {
                        open: AtomicBool::new(true),
                    })
                },
                move |session: Arc<FakeSession>, outcome: &Outcome<'_>| {
                    session.open.store(false, Ordering::SeqCst);
                    log.lock().push(format!("closed (success={})", outcome.is_success()));
                    Ok(())
                },
            ),
        )
    }

    #[tokio::test]
    async fn test_deferred_tasks_wait_for_response_hook() {
        let plan = EvaluationPlan::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let completion = RequestLifecycle::default()
            .execute("send_notification", &plan, RequestInputs::new(), CancellationFlag::new(), |ctx| async move {
                ctx.deferred().add_task("write_notification", move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok("Notification sent in the background")
            })
            .await;

        assert_eq!(completion.result.unwrap(), "Notification sent in the background");
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let report = completion.tasks.on_response_sent().await;
        assert!(report.is_clean());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_reach_client() {
        let plan = EvaluationPlan::default();
        let ran = Arc::new(AtomicBool::new(false));

        let r = Arc::clone(&ran);
        let completion = RequestLifecycle::default()
            .execute("two_tasks", &plan, RequestInputs::new(), CancellationFlag::new(), |ctx| async move {
                ctx.deferred()
                    .add_task("first", || Err(anyhow::anyhow!("log file missing")));
                ctx.deferred().add_async_task("second", async move {
                    r.store(true, Ordering::SeqCst);
                    Ok(())
                });
                Ok(())
            })
            .await;

        assert!(completion.result.is_ok());
        let report = completion.tasks.on_response_sent().await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(report.completed, vec!["second"]);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_yielding_session_closed_after_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = plan(
            vec![session_provider(Arc::clone(&log))],
            &[Dependency::bound("db", "get_db")],
        );

        let completion = RequestLifecycle::default()
            .execute("read_items", &plan, RequestInputs::new(), CancellationFlag::new(), |ctx| async move {
                let db = ctx.get::<FakeSession>("db")?;
                Ok::<_, anyhow::Error>(db.open.load(Ordering::SeqCst))
            })
            .await;

        assert!(completion.result.unwrap(), "session must be open inside the handler");
        assert_eq!(*log.lock(), vec!["closed (success=true)"]);
        assert_eq!(completion.teardown.executed, vec!["get_db"]);
    }

    #[tokio::test]
    async fn test_teardown_runs_when_later_provider_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_ran = Arc::new(AtomicBool::new(false));
        let plan = plan(
            vec![
                session_provider(Arc::clone(&log)),
                ProviderDefinition::new(
                    "verify_key",
                    provider_fn(|args| async move {
                        match args.str("x_key") {
                            Some(key) if key == "fake-super-secret-key" => Ok(key),
                            _ => Err(ResolutionError::from(ClientError::bad_request(
                                "X-Key header invalid",
                            ))),
                        }
                    }),
                )
                .with_param(Param::header("x_key")),
            ],
            &[Dependency::bound("db", "get_db"), Dependency::guard("verify_key")],
        );

        let flag = Arc::clone(&handler_ran);
        let completion = RequestLifecycle::default()
            .execute(
                "read_items",
                &plan,
                RequestInputs::new().with_header("X-Key", "wrong"),
                CancellationFlag::new(),
                |_ctx| async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;

        let err = completion.result.unwrap_err();
        assert_eq!(err.client_error().map(|e| e.status), Some(400));
        assert!(!handler_ran.load(Ordering::SeqCst));
        assert_eq!(*log.lock(), vec!["closed (success=false)"]);
    }

    #[tokio::test]
    async fn test_teardown_translates_handler_error() {
        let plan = plan(
            vec![ProviderDefinition::new(
                "get_username",
                yielding(
                    |_args| async move { Ok(String::from("Rick")) },
                    |_name: Arc<String>, outcome: &Outcome<'_>| match outcome.domain_error::<OwnerError>() {
                        Some(e) => Err(TeardownError::Translate(ClientError::bad_request(format!(
                            "Owner error: {}",
                            e.0
                        )))),
                        None => Ok(()),
                    },
                ),
            )],
            &[Dependency::bound("username", "get_username")],
        );

        let completion = RequestLifecycle::default()
            .execute("get_item", &plan, RequestInputs::new(), CancellationFlag::new(), |ctx| async move {
                let username = ctx.get::<String>("username")?;
                Err::<(), anyhow::Error>(OwnerError(username.to_string()).into())
            })
            .await;

        match completion.result {
            Err(RequestError::Translated { provider, error }) => {
                assert_eq!(provider, "get_username");
                assert_eq!(error.status, 400);
                assert_eq!(error.detail, "Owner error: Rick");
            }
            other => panic!("expected translated error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_skips_handler_but_not_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let flag = CancellationFlag::new();

        let trigger = flag.clone();
        let plan = plan(
            vec![
                session_provider(Arc::clone(&log)),
                ProviderDefinition::new(
                    "disconnect",
                    provider_fn(move |args| {
                        let trigger = trigger.clone();
                        async move {
                            args.deferred().add_task("audit", || Ok(()));
                            trigger.cancel();
                            Ok(())
                        }
                    }),
                )
                .with_param(Param::depends("db", "get_db")),
            ],
            &[Dependency::guard("disconnect")],
        );

        let completion = RequestLifecycle::default()
            .execute("slow", &plan, RequestInputs::new(), flag, |_ctx| async move {
                if true {
                    panic!("handler must not run after cancellation");
                }
                Ok(())
            })
            .await;

        assert!(matches!(completion.result, Err(RequestError::Cancelled)));
        assert_eq!(*log.lock(), vec!["closed (success=false)"]);
        assert!(completion.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_is_reported() {
        let completion = RequestLifecycle::default()
            .execute(
                "explode",
                &EvaluationPlan::default(),
                RequestInputs::new(),
                CancellationFlag::new(),
                |_ctx| async move {
                    if true {
                        panic!("division by zero");
                    }
                    Ok(())
                },
            )
            .await;

        let err = completion.result.unwrap_err();
        assert!(matches!(err, RequestError::Handler(_)));
        assert!(err.to_string().contains("division by zero"));
    }

    #[tokio::test]
    async fn test_storage_is_injected() {
        let store: Arc<dyn KeyValueStore> =
            Arc::new(MemoryStore::new().with_entry("foo", serde_json::json!({"name": "Foo"})));
        let lifecycle = RequestLifecycle::default().with_storage(store);

        let completion = lifecycle
            .execute("read_item", &EvaluationPlan::default(), RequestInputs::new(), CancellationFlag::new(), |ctx| async move {
                let item = ctx.storage()?.get("foo").await?;
                Ok::<_, anyhow::Error>(item)
            })
            .await;

        assert_eq!(
            completion.result.unwrap(),
            Some(serde_json::json!({"name": "Foo"}))
        );
    }
}
