// reqscope-core: 请求作用域的依赖解析与生命周期
//
// 提供：
// - Provider 注册表和启动期的依赖图分析（循环检测、去重、求值计划）
// - 每个请求独立的作用域缓存，yielding Provider 的 setup/teardown
// - 逆序 teardown 和错误翻译
// - 响应发送之后才执行的延迟任务

pub mod config;
pub mod error;
pub mod graph;
pub mod inputs;
pub mod lifecycle;
pub mod logging;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod scope;
pub mod storage;
pub mod tasks;
pub mod teardown;

// 重新导出常用类型
pub use config::{
    ConfigValue, Environment, EnvironmentPropertySource, MapPropertySource, PropertySource,
    ResolverProperties, TomlPropertySource,
};
pub use error::{
    ClientError, ConfigurationError, RequestError, ResolutionError, Result, TaskError,
    TeardownError,
};
pub use graph::{Dependency, DependencyGraphBuilder, EvaluationPlan, PlanStep};
pub use inputs::{RequestInputs, WHOLE_BODY};
pub use lifecycle::{Completion, HandlerContext, RequestLifecycle};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use provider::{
    provider_fn, value, yielding, Bindings, CachePolicy, InputKind, Param, Provider,
    ProviderArgs, ProviderDefinition, Value,
};
pub use registry::ProviderRegistry;
pub use resolver::{ResolutionMode, ScopedResolver};
pub use scope::{CancellationFlag, NodeState, RequestScope};
pub use storage::{KeyValueStore, MemoryStore};
pub use tasks::{DeferredQueue, PendingTasks, TaskReport};
pub use teardown::{Outcome, TeardownCoordinator, TeardownReport};

// 导出 async_trait，实现 Provider / KeyValueStore 时使用
pub use async_trait;

/// Prelude 模块，包含常用的 traits 和类型
pub mod prelude {
    pub use crate::error::{ClientError, RequestError, ResolutionError, Result, TeardownError};
    pub use crate::graph::Dependency;
    pub use crate::lifecycle::HandlerContext;
    pub use crate::provider::{
        provider_fn, value, yielding, CachePolicy, Param, Provider, ProviderArgs,
        ProviderDefinition, Value,
    };
    pub use crate::registry::ProviderRegistry;
    pub use crate::storage::{KeyValueStore, MemoryStore};
    pub use crate::tasks::DeferredQueue;
    pub use crate::teardown::Outcome;
    pub use anyhow::{anyhow, Context};
    pub use async_trait::async_trait;
}
