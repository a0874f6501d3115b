//! Scoped Resolver
//!
//! 按求值计划为一次请求执行 Provider，结果缓存在 [`RequestScope`] 中。
//! 任何一个 Provider 失败都会立即停止解析，已经完成 setup 的 yielding Provider
//! 仍然会在之后得到 teardown。

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;

use crate::error::{ConfigurationError, ResolutionError};
use crate::graph::{ArgSource, EvaluationPlan, PlanStep};
use crate::inputs::RequestInputs;
use crate::provider::{value, Bindings, Provider, ProviderArgs, Value};
use crate::scope::RequestScope;
use crate::tasks::panic_message;

/// 解析模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionMode {
    /// 严格按计划顺序逐个执行
    #[default]
    Sequential,

    /// 同一层级内没有依赖关系的 Provider 并发执行，层级之间保持顺序
    Leveled,
}

impl FromStr for ResolutionMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(ResolutionMode::Sequential),
            "leveled" | "concurrent" => Ok(ResolutionMode::Leveled),
            other => Err(ConfigurationError::InvalidProperty {
                key: "resolver.mode".to_string(),
                message: format!("unknown resolution mode '{}'", other),
            }),
        }
    }
}

/// 请求作用域内的解析器
#[derive(Debug, Clone, Default)]
pub struct ScopedResolver {
    mode: ResolutionMode,
}

impl ScopedResolver {
    pub fn new(mode: ResolutionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    /// 执行求值计划，把结果写入作用域
    pub async fn resolve(
        &self,
        plan: &EvaluationPlan,
        inputs: &RequestInputs,
        scope: &mut RequestScope,
    ) -> Result<(), ResolutionError> {
        match self.mode {
            ResolutionMode::Sequential => resolve_sequential(plan, inputs, scope).await,
            ResolutionMode::Leveled => resolve_leveled(plan, inputs, scope).await,
        }
    }
}

async fn resolve_sequential(
    plan: &EvaluationPlan,
    inputs: &RequestInputs,
    scope: &mut RequestScope,
) -> Result<(), ResolutionError> {
    for step in plan.steps() {
        if scope.cancellation().is_cancelled() {
            tracing::debug!("Resolution cancelled before '{}'", step.provider_id());
            return Err(ResolutionError::Cancelled);
        }

        let args = match prepare(step, inputs, scope) {
            Ok(args) => args,
            Err(e) => {
                scope.fail(step.index);
                return Err(e);
            }
        };

        scope.begin(step.index);
        match invoke(step, args).await {
            Ok(v) => scope.complete(step.index, v, teardown_handle(step)),
            Err(e) => {
                tracing::debug!("Provider '{}' failed: {}", step.provider_id(), e);
                scope.fail(step.index);
                return Err(e);
            }
        }
    }

    Ok(())
}

async fn resolve_leveled(
    plan: &EvaluationPlan,
    inputs: &RequestInputs,
    scope: &mut RequestScope,
) -> Result<(), ResolutionError> {
    for (level, indices) in plan.levels().into_iter().enumerate() {
        if scope.cancellation().is_cancelled() {
            tracing::debug!("Resolution cancelled before level {}", level);
            return Err(ResolutionError::Cancelled);
        }

        let mut prepared = Vec::with_capacity(indices.len());
        for &index in &indices {
            let Some(step) = plan.step(index) else {
                continue;
            };
            match prepare(step, inputs, scope) {
                Ok(args) => prepared.push((step, args)),
                Err(e) => {
                    scope.fail(step.index);
                    return Err(e);
                }
            }
        }

        tracing::trace!("Resolving level {} ({} provider(s))", level, prepared.len());

        let mut running: FuturesUnordered<_> = prepared
            .into_iter()
            .map(|(step, args)| async move { (step, invoke(step, args).await) })
            .collect();

        for &index in &indices {
            scope.begin(index);
        }

        // 按实际完成顺序记录，teardown 依赖这个顺序
        let mut first_error = None;
        while let Some((step, result)) = running.next().await {
            match result {
                Ok(v) => scope.complete(step.index, v, teardown_handle(step)),
                Err(e) => {
                    tracing::debug!("Provider '{}' failed: {}", step.provider_id(), e);
                    scope.fail(step.index);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
    }

    Ok(())
}

/// 为一个步骤收集参数
fn prepare(
    step: &PlanStep,
    inputs: &RequestInputs,
    scope: &RequestScope,
) -> Result<ProviderArgs, ResolutionError> {
    let mut bindings = Bindings::new();

    for (name, source) in &step.args {
        match source {
            ArgSource::Input {
                kind,
                key,
                required,
                default,
            } => {
                let found = inputs.lookup(*kind, key).filter(|v| !v.is_null());
                let slot = match (found, default) {
                    (Some(v), _) => Some(value(v.clone())),
                    (None, Some(d)) => Some(value(d.clone())),
                    (None, None) if *required => {
                        return Err(ResolutionError::MissingInput {
                            kind: *kind,
                            name: key.clone(),
                        });
                    }
                    (None, None) => None,
                };
                bindings.insert(name.clone(), slot);
            }
            ArgSource::Step(index) => {
                let resolved = scope
                    .value(*index)
                    .cloned()
                    .ok_or_else(|| ResolutionError::MissingValue { name: name.clone() })?;
                bindings.insert(name.clone(), Some(resolved));
            }
        }
    }

    Ok(ProviderArgs::new(
        step.provider_id(),
        bindings,
        scope.deferred().clone(),
        scope.storage().cloned(),
    ))
}

async fn invoke(step: &PlanStep, args: ProviderArgs) -> Result<Value, ResolutionError> {
    tracing::trace!("Resolving provider '{}'", step.provider_id());

    match AssertUnwindSafe(step.definition.provider.setup(args))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!("Provider '{}' panicked during setup: {}", step.provider_id(), message);
            Err(ResolutionError::Domain(anyhow::anyhow!(
                "provider '{}' panicked: {}",
                step.provider_id(),
                message
            )))
        }
    }
}

fn teardown_handle(step: &PlanStep) -> Option<Arc<dyn Provider>> {
    step.definition
        .provider
        .is_yielding()
        .then(|| Arc::clone(&step.definition.provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::graph::{Dependency, DependencyGraphBuilder};
    use crate::provider::{provider_fn, yielding, Param, ProviderDefinition};
    use crate::registry::ProviderRegistry;
    use crate::scope::{CancellationFlag, NodeState};
    use crate::teardown::Outcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(id: &str, counter: Arc<AtomicUsize>) -> ProviderDefinition {
        ProviderDefinition::new(
            id,
            provider_fn(move |_args| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
    }

    fn plan(defs: Vec<ProviderDefinition>, deps: &[Dependency]) -> EvaluationPlan {
        let mut registry = ProviderRegistry::new();
        for d in defs {
            registry.register(d).unwrap();
        }
        DependencyGraphBuilder::build(&registry, deps).unwrap()
    }

    /// query_extractor + query_or_cookie_extractor
    fn query_or_cookie_plan() -> EvaluationPlan {
        let query = ProviderDefinition::new(
            "query_extractor",
            provider_fn(|args| async move { Ok(args.str("q")) }),
        )
        .with_param(Param::query("q").optional());

        let query_or_cookie = ProviderDefinition::new(
            "query_or_cookie_extractor",
            provider_fn(|args| async move {
                let q = args.get::<Option<String>>("q")?;
                Ok::<_, ResolutionError>(match q.as_ref() {
                    Some(q) => Some(q.clone()),
                    None => args.str("last_query"),
                })
            }),
        )
        .with_param(Param::depends("q", "query_extractor"))
        .with_param(Param::cookie("last_query").optional());

        plan(
            vec![query, query_or_cookie],
            &[Dependency::bound("query_or_default", "query_or_cookie_extractor")],
        )
    }

    #[tokio::test]
    async fn test_shared_provider_runs_once() {
        for mode in [ResolutionMode::Sequential, ResolutionMode::Leveled] {
            let counter = Arc::new(AtomicUsize::new(0));
            let plan = plan(
                vec![
                    counting("x", Arc::clone(&counter)),
                    counting("a", Arc::new(AtomicUsize::new(0))).with_param(Param::depends("x", "x")),
                    counting("b", Arc::new(AtomicUsize::new(0))).with_param(Param::depends("x", "x")),
                ],
                &[Dependency::guard("a"), Dependency::guard("b")],
            );

            let mut scope = RequestScope::new(1, &plan);
            ScopedResolver::new(mode)
                .resolve(&plan, &RequestInputs::new(), &mut scope)
                .await
                .unwrap();

            assert_eq!(counter.load(Ordering::SeqCst), 1, "mode {:?}", mode);
        }
    }

    #[tokio::test]
    async fn test_cookie_used_when_query_absent() {
        let plan = query_or_cookie_plan();
        let inputs = RequestInputs::new().with_cookie("last_query", "from-cookie");

        let mut scope = RequestScope::new(1, &plan);
        ScopedResolver::default()
            .resolve(&plan, &inputs, &mut scope)
            .await
            .unwrap();

        let bindings = scope.bindings(&plan);
        let value = bindings.get::<Option<String>>("query_or_default").unwrap();
        assert_eq!(value.as_deref(), Some("from-cookie"));
    }

    #[tokio::test]
    async fn test_query_wins_over_cookie() {
        let plan = query_or_cookie_plan();
        let inputs = RequestInputs::new()
            .with_query("q", "from-query")
            .with_cookie("last_query", "from-cookie");

        let mut scope = RequestScope::new(1, &plan);
        ScopedResolver::default()
            .resolve(&plan, &inputs, &mut scope)
            .await
            .unwrap();

        assert_eq!(
            scope.bindings(&plan).str("query_or_default").as_deref(),
            Some("from-query")
        );
    }

    #[tokio::test]
    async fn test_failure_stops_resolution() {
        let later = Arc::new(AtomicUsize::new(0));
        let plan = plan(
            vec![
                ProviderDefinition::new(
                    "session",
                    yielding(|_args| async move { Ok(()) }, |_v: Arc<()>, _o: &Outcome<'_>| Ok(())),
                ),
                ProviderDefinition::new(
                    "token",
                    provider_fn(|_args| async move {
                        Err::<(), ResolutionError>(ClientError::bad_request("X-Token header invalid").into())
                    }),
                ),
                counting("later", Arc::clone(&later)),
            ],
            &[
                Dependency::guard("session"),
                Dependency::guard("token"),
                Dependency::guard("later"),
            ],
        );

        let mut scope = RequestScope::new(1, &plan);
        let err = ScopedResolver::default()
            .resolve(&plan, &RequestInputs::new(), &mut scope)
            .await
            .unwrap_err();

        assert!(matches!(err, ResolutionError::Rejected(ref e) if e.status == 400));
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(scope.setup_order(), vec!["session"]);
        assert_eq!(scope.node(1).unwrap().state, NodeState::Failed);
        assert_eq!(scope.node(2).unwrap().state, NodeState::Unresolved);
    }

    #[tokio::test]
    async fn test_missing_required_input() {
        let plan = plan(
            vec![ProviderDefinition::new(
                "verify_token",
                provider_fn(|args| async move { Ok(args.str("x_token")) }),
            )
            .with_param(Param::header("x_token"))],
            &[Dependency::guard("verify_token")],
        );

        let mut scope = RequestScope::new(1, &plan);
        let err = ScopedResolver::default()
            .resolve(&plan, &RequestInputs::new(), &mut scope)
            .await
            .unwrap_err();

        match err {
            ResolutionError::MissingInput { kind, name } => {
                assert_eq!(kind, crate::provider::InputKind::Header);
                assert_eq!(name, "x-token");
            }
            other => panic!("expected MissingInput, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_body_field_is_not_the_whole_body() {
        let plan = plan(
            vec![
                ProviderDefinition::new(
                    "item_name",
                    provider_fn(|args| async move { Ok(args.str("name")) }),
                )
                .with_param(Param::body("name")),
                ProviderDefinition::new(
                    "item",
                    provider_fn(|args| async move {
                        let item = args.get::<serde_json::Value>("item")?;
                        Ok::<_, ResolutionError>(item["price"].clone())
                    }),
                )
                .with_param(Param::whole_body("item")),
            ],
            &[
                Dependency::bound("price", "item"),
                Dependency::bound("name", "item_name"),
            ],
        );
        let inputs = RequestInputs::new().with_body(serde_json::json!({ "price": 3 }));

        let mut scope = RequestScope::new(1, &plan);
        let err = ScopedResolver::default()
            .resolve(&plan, &inputs, &mut scope)
            .await
            .unwrap_err();

        match err {
            ResolutionError::MissingInput { kind, name } => {
                assert_eq!(kind, crate::provider::InputKind::Body);
                assert_eq!(name, "name");
            }
            other => panic!("expected MissingInput, got {:?}", other),
        }

        // 整体绑定的参数拿到完整请求体
        let price = scope.bindings(&plan).get::<serde_json::Value>("price").unwrap();
        assert_eq!(*price, serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_defaults_fill_missing_inputs() {
        let plan = plan(
            vec![ProviderDefinition::new(
                "common_parameters",
                provider_fn(|args| async move {
                    let skip: u32 = args.deserialize("skip")?;
                    let limit: u32 = args.deserialize("limit")?;
                    Ok::<_, ResolutionError>((skip, limit))
                }),
            )
            .with_param(Param::query("skip").with_default(0))
            .with_param(Param::query("limit").with_default(100))],
            &[Dependency::bound("commons", "common_parameters")],
        );

        let mut scope = RequestScope::new(1, &plan);
        ScopedResolver::default()
            .resolve(&plan, &RequestInputs::new().with_query("limit", 5), &mut scope)
            .await
            .unwrap();

        let commons = scope.bindings(&plan).get::<(u32, u32)>("commons").unwrap();
        assert_eq!(*commons, (0, 5));
    }

    #[tokio::test]
    async fn test_cancelled_scope_resolves_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let plan = plan(
            vec![counting("a", Arc::clone(&counter))],
            &[Dependency::guard("a")],
        );

        let flag = CancellationFlag::new();
        flag.cancel();
        let mut scope = RequestScope::new(1, &plan).with_cancellation(flag);
        let err = ScopedResolver::new(ResolutionMode::Leveled)
            .resolve(&plan, &RequestInputs::new(), &mut scope)
            .await
            .unwrap_err();

        assert!(matches!(err, ResolutionError::Cancelled));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_leveled_failure_keeps_completed_siblings() {
        let plan = plan(
            vec![
                ProviderDefinition::new(
                    "db",
                    yielding(|_args| async move { Ok(()) }, |_v: Arc<()>, _o: &Outcome<'_>| Ok(())),
                ),
                ProviderDefinition::new(
                    "key",
                    provider_fn(|_args| async move {
                        Err::<(), ResolutionError>(ClientError::bad_request("X-Key header invalid").into())
                    }),
                ),
                counting("user", Arc::new(AtomicUsize::new(0)))
                    .with_param(Param::depends("db", "db"))
                    .with_param(Param::depends("key", "key")),
            ],
            &[Dependency::guard("user")],
        );

        let mut scope = RequestScope::new(1, &plan);
        let err = ScopedResolver::new(ResolutionMode::Leveled)
            .resolve(&plan, &RequestInputs::new(), &mut scope)
            .await
            .unwrap_err();

        assert!(matches!(err, ResolutionError::Rejected(_)));
        assert_eq!(scope.setup_order(), vec!["db"]);
        assert_eq!(scope.node(2).unwrap().state, NodeState::Unresolved);
    }

    #[tokio::test]
    async fn test_panicking_setup_becomes_domain_error() {
        let plan = plan(
            vec![ProviderDefinition::new(
                "broken",
                provider_fn(|_args| async move {
                    if true {
                        panic!("connection pool exhausted");
                    }
                    Ok(())
                }),
            )],
            &[Dependency::guard("broken")],
        );

        let mut scope = RequestScope::new(1, &plan);
        let err = ScopedResolver::default()
            .resolve(&plan, &RequestInputs::new(), &mut scope)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("connection pool exhausted"));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Leveled".parse::<ResolutionMode>().unwrap(), ResolutionMode::Leveled);
        assert_eq!(
            "sequential".parse::<ResolutionMode>().unwrap(),
            ResolutionMode::Sequential
        );
        assert!("parallel".parse::<ResolutionMode>().is_err());
    }
}
