//! 统一的错误类型
//!
//! 框架内部的边界使用 `thiserror` 定义的枚举，Provider 和 Handler 的业务错误
//! 统一使用 `anyhow::Error` 承载，需要时可以通过 `downcast_ref` 还原具体类型。
//!
//! 错误分为四类：
//! - [`ConfigurationError`] - 启动阶段的静态配置错误（循环依赖、未绑定参数等），对启动是致命的
//! - [`ResolutionError`] - Provider 在请求期间拒绝输入或前置条件不满足
//! - [`TeardownError`] - 清理阶段的错误，可以被 Provider 主动转换为客户端错误
//! - [`TaskError`] - 延迟任务的失败，只记录日志，不会返回给客户端

use thiserror::Error;

use crate::provider::InputKind;

/// 应用层统一的结果类型
pub use anyhow::Result;

/// 静态配置错误，在第一个请求到来之前检测
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// 依赖声明中存在环（A -> B -> A）
    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// 参数引用了一个没有注册的 Provider
    #[error("Provider '{owner}' parameter '{parameter}' depends on '{provider}' which is not registered")]
    UnknownProvider {
        owner: String,
        parameter: String,
        provider: String,
    },

    /// 参数既没有输入源也没有 Provider
    #[error("Provider '{owner}' parameter '{parameter}' is not bound to any input source")]
    UnboundParameter { owner: String, parameter: String },

    #[error("Provider '{0}' already exists")]
    DuplicateProvider(String),

    #[error("Operation '{0}' already registered")]
    DuplicateOperation(String),

    /// 同一个 operation 中两个依赖绑定到了同一个名字
    #[error("Binding '{0}' is declared more than once")]
    DuplicateBinding(String),

    #[error("Invalid property '{key}': {message}")]
    InvalidProperty { key: String, message: String },

    #[error("Invalid route '{route}': {message}")]
    InvalidRoute { route: String, message: String },
}

/// 面向客户端的错误（状态码 + 详情）
///
/// Provider 在 setup 阶段返回它表示拒绝请求，在 teardown 阶段返回它表示
/// 把 handler 的失败翻译成客户端可见的错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {detail}")]
pub struct ClientError {
    pub status: u16,
    pub detail: String,
    pub headers: Vec<(String, String)>,
}

impl ClientError {
    pub fn new(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            headers: Vec::new(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, detail)
    }

    /// 401，附带 `WWW-Authenticate: Bearer`
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(401, detail).with_header("WWW-Authenticate", "Bearer")
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(403, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(404, detail)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// 请求期间依赖解析失败
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Missing required {kind} parameter '{name}'")]
    MissingInput { kind: InputKind, name: String },

    #[error("Invalid {kind} parameter '{name}': {message}")]
    InvalidInput {
        kind: InputKind,
        name: String,
        message: String,
    },

    /// Provider 主动拒绝请求
    #[error(transparent)]
    Rejected(#[from] ClientError),

    /// 输入存在但无法转换为需要的类型
    #[error("Value '{name}' could not be parsed: {message}")]
    InvalidValue { name: String, message: String },

    #[error("No value bound under '{name}'")]
    MissingValue { name: String },

    #[error("Value '{name}' is not of type {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
    },

    #[error("Resolution cancelled")]
    Cancelled,

    /// Provider 的业务错误，原样交给错误翻译层
    #[error(transparent)]
    Domain(#[from] anyhow::Error),
}

/// 一次请求最终向外暴露的失败
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Handler(anyhow::Error),

    /// 某个 yielding Provider 在 teardown 阶段把失败翻译成了客户端错误
    #[error("{error} (translated by '{provider}')")]
    Translated { provider: String, error: ClientError },

    #[error("Request cancelled")]
    Cancelled,
}

impl RequestError {
    /// 如果失败最终可以表示为客户端错误，返回它
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            RequestError::Resolution(ResolutionError::Rejected(e)) => Some(e),
            RequestError::Translated { error, .. } => Some(error),
            RequestError::Handler(e) | RequestError::Resolution(ResolutionError::Domain(e)) => {
                e.downcast_ref::<ClientError>()
            }
            _ => None,
        }
    }

    /// 尝试把 handler 或 Provider 的业务错误还原为具体类型
    pub fn domain_error<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            RequestError::Handler(e) => e.downcast_ref::<E>(),
            RequestError::Resolution(ResolutionError::Domain(e)) => e.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Provider teardown 的返回错误
#[derive(Debug, Error)]
pub enum TeardownError {
    /// Provider 明确处理了失败并翻译成客户端错误
    #[error("translated to client error {0}")]
    Translate(ClientError),

    /// 未处理的清理失败
    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

/// 延迟任务失败
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Deferred task '{task}' failed: {error:#}")]
    Failed { task: String, error: anyhow::Error },

    #[error("Deferred task '{task}' panicked: {message}")]
    Panicked { task: String, message: String },
}

impl TaskError {
    pub fn task(&self) -> &str {
        match self {
            TaskError::Failed { task, .. } | TaskError::Panicked { task, .. } => task,
        }
    }
}
