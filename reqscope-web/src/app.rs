//! 应用组装
//!
//! [`Application`] 收集 Provider、全局/路由组/operation 三级依赖和错误处理器，
//! `build()` 时一次性完成静态校验并为每个 operation 生成求值计划。
//! 生成的 [`CompiledApplication`] 不可变，可以在任意多个请求之间共享。

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::Method;
use reqscope_core::{
    CancellationFlag, ConfigurationError, Dependency, DependencyGraphBuilder, EvaluationPlan,
    HandlerContext, KeyValueStore, PendingTasks, ProviderDefinition, ProviderRegistry,
    RequestError, RequestInputs, RequestLifecycle, ResolutionMode, ResolverProperties,
    TeardownReport,
};

use crate::exception_handler::{ErrorResponse, ErrorTranslator, ExceptionHandler};
use crate::response::{HttpResponse, IntoHttpResponse};
use crate::routing::{join_paths, RouteMatch, RouteTable};

type BoxedHandler =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, anyhow::Result<HttpResponse>> + Send + Sync>;

/// 一个 HTTP operation：方法 + 路径 + 依赖 + handler
pub struct Operation {
    method: Method,
    path: String,
    name: Option<String>,
    dependencies: Vec<Dependency>,
    handler: BoxedHandler,
}

impl Operation {
    pub fn new<F, Fut, R>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoHttpResponse,
    {
        let handler: BoxedHandler = Arc::new(move |ctx| {
            let fut = handler(ctx);
            async move { fut.await?.into_http_response() }.boxed()
        });

        Self {
            method,
            path: path.into(),
            name: None,
            dependencies: Vec::new(),
            handler,
        }
    }

    pub fn get<F, Fut, R>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoHttpResponse,
    {
        Self::new(Method::GET, path, handler)
    }

    pub fn post<F, Fut, R>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoHttpResponse,
    {
        Self::new(Method::POST, path, handler)
    }

    pub fn put<F, Fut, R>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoHttpResponse,
    {
        Self::new(Method::PUT, path, handler)
    }

    pub fn delete<F, Fut, R>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoHttpResponse,
    {
        Self::new(Method::DELETE, path, handler)
    }

    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// 默认名称是 `"GET /items/{item_id}"`
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// 共享前缀和依赖的一组 operation
#[derive(Debug)]
pub struct RouterGroup {
    prefix: String,
    dependencies: Vec<Dependency>,
    operations: Vec<Operation>,
}

impl RouterGroup {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            dependencies: Vec::new(),
            operations: Vec::new(),
        }
    }

    /// 组内每个 operation 都会先执行的依赖
    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn route(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }
}

/// 应用构建器
pub struct Application {
    definitions: Vec<ProviderDefinition>,
    overrides: Vec<ProviderDefinition>,
    dependencies: Vec<Dependency>,
    root: RouterGroup,
    groups: Vec<RouterGroup>,
    translator: ErrorTranslator,
    storage: Option<Arc<dyn KeyValueStore>>,
    mode: ResolutionMode,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    pub fn new() -> Self {
        Self {
            definitions: Vec::new(),
            overrides: Vec::new(),
            dependencies: Vec::new(),
            root: RouterGroup::new(""),
            groups: Vec::new(),
            translator: ErrorTranslator::new(),
            storage: None,
            mode: ResolutionMode::default(),
        }
    }

    /// 注册 Provider
    pub fn provide(mut self, definition: ProviderDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// 全局依赖，所有 operation 都会先执行
    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn route(mut self, operation: Operation) -> Self {
        self.root.operations.push(operation);
        self
    }

    pub fn group(mut self, group: RouterGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn exception_handler<H: ExceptionHandler + 'static>(mut self, handler: H) -> Self {
        self.translator.register(handler);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn resolution_mode(mut self, mode: ResolutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn resolver_properties(self, properties: &ResolverProperties) -> Self {
        self.resolution_mode(properties.mode)
    }

    /// 用另一个实现替换同名 Provider，常用于测试
    pub fn override_provider(mut self, definition: ProviderDefinition) -> Self {
        self.overrides.push(definition);
        self
    }

    /// 校验依赖并生成所有 operation 的求值计划
    pub fn build(self) -> Result<CompiledApplication, ConfigurationError> {
        let mut registry = ProviderRegistry::new();
        for definition in self.definitions {
            registry.register(definition)?;
        }
        for definition in self.overrides {
            registry.override_provider(definition);
        }
        registry.validate()?;

        let mut routes = Vec::new();
        let mut table = RouteTable::new();
        let mut names = HashSet::new();
        let mut signatures = HashSet::new();

        for group in std::iter::once(self.root).chain(self.groups) {
            for operation in group.operations {
                let template = join_paths(&group.prefix, &operation.path);
                let name = operation
                    .name
                    .unwrap_or_else(|| format!("{} {}", operation.method, template));

                let signature = format!("{} {}", operation.method, template);
                if !names.insert(name.clone()) || !signatures.insert(signature) {
                    return Err(ConfigurationError::DuplicateOperation(name));
                }
                table.add(&template, operation.method.clone(), routes.len())?;

                let dependencies: Vec<Dependency> = self
                    .dependencies
                    .iter()
                    .chain(&group.dependencies)
                    .chain(&operation.dependencies)
                    .cloned()
                    .collect();
                let plan = DependencyGraphBuilder::build(&registry, &dependencies)?;

                tracing::debug!(
                    operation = %name,
                    "Operation compiled: {}",
                    plan.order().join(" -> ")
                );

                routes.push(CompiledRoute {
                    name,
                    plan,
                    handler: operation.handler,
                });
            }
        }
        let table = table.freeze()?;

        let mut lifecycle = RequestLifecycle::new(self.mode);
        if let Some(storage) = self.storage {
            lifecycle = lifecycle.with_storage(storage);
        }

        tracing::info!(
            "Application built: {} provider(s), {} operation(s), {:?} resolution",
            registry.len(),
            routes.len(),
            self.mode
        );

        Ok(CompiledApplication {
            inner: Arc::new(Inner {
                routes,
                table,
                lifecycle,
                translator: self.translator,
            }),
        })
    }
}

struct CompiledRoute {
    name: String,
    plan: EvaluationPlan,
    handler: BoxedHandler,
}

struct Inner {
    routes: Vec<CompiledRoute>,
    table: RouteTable<usize>,
    lifecycle: RequestLifecycle,
    translator: ErrorTranslator,
}

/// 一次分发的结果
///
/// `tasks` 必须在响应交给传输层之后再触发。
#[derive(Debug)]
pub struct Dispatched {
    /// 没有匹配到 operation 时为 `None`
    pub request_id: Option<u64>,
    pub operation: Option<String>,
    pub response: HttpResponse,
    pub teardown: TeardownReport,
    pub tasks: PendingTasks,
}

/// 构建完成、可共享的应用
#[derive(Clone)]
pub struct CompiledApplication {
    inner: Arc<Inner>,
}

impl CompiledApplication {
    /// 已注册的 operation 名称，按注册顺序排列
    pub fn operations(&self) -> Vec<&str> {
        self.inner.routes.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn plan(&self, operation: &str) -> Option<&EvaluationPlan> {
        self.inner
            .routes
            .iter()
            .find(|r| r.name == operation)
            .map(|r| &r.plan)
    }

    /// 用注册的错误处理器把错误转换成响应
    pub async fn translate(&self, error: &RequestError, path: &str) -> HttpResponse {
        self.inner
            .translator
            .translate(error, path)
            .await
            .into_http_response()
    }

    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        mut inputs: RequestInputs,
        cancellation: CancellationFlag,
    ) -> Dispatched {
        let (route, params) = match self.inner.table.find(method, path) {
            RouteMatch::Found { route, params } => (&self.inner.routes[*route], params),
            RouteMatch::MethodNotAllowed(allowed) => {
                let allowed: Vec<&str> = allowed.iter().map(Method::as_str).collect();
                let response = ErrorResponse::new(405, "Method Not Allowed", path)
                    .with_header("Allow", allowed.join(", "));
                return Self::unmatched(method, path, response);
            }
            RouteMatch::NotFound => {
                return Self::unmatched(method, path, ErrorResponse::new(404, "Not Found", path));
            }
        };

        for (key, value) in params {
            inputs.set_path(key, value);
        }

        let handler = Arc::clone(&route.handler);
        let completion = self
            .inner
            .lifecycle
            .execute(&route.name, &route.plan, inputs, cancellation, move |ctx| {
                handler(ctx)
            })
            .await;

        let response = match completion.result {
            Ok(response) => response,
            Err(error) => self.translate(&error, path).await,
        };

        Dispatched {
            request_id: Some(completion.request_id),
            operation: Some(route.name.clone()),
            response,
            teardown: completion.teardown,
            tasks: completion.tasks,
        }
    }
}

impl CompiledApplication {
    fn unmatched(method: &Method, path: &str, response: ErrorResponse) -> Dispatched {
        tracing::debug!(method = %method, path, status = response.status, "No operation matched");
        Dispatched {
            request_id: None,
            operation: None,
            response: response.into_http_response(),
            teardown: TeardownReport::default(),
            tasks: PendingTasks::empty(),
        }
    }
}

impl std::fmt::Debug for CompiledApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledApplication")
            .field("operations", &self.operations())
            .field("lifecycle", &self.inner.lifecycle)
            .field("translator", &self.inner.translator)
            .finish()
    }
}
