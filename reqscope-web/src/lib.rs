//! # reqscope-web
//!
//! reqscope 的 HTTP 组合层，基于 Axum 构建
//!
//! ## 核心特性
//!
//! - **三级依赖** - 全局、路由组、operation 依赖按顺序合并成一个求值计划
//! - **启动期校验** - 循环依赖、未注册 Provider、重复 operation 在 `build()` 时报告
//! - **错误翻译** - 输入错误 422，客户端错误保留状态码和头部，其余 500
//! - **延迟任务** - 响应体交给传输层之后才执行

pub mod app;
pub mod exception_handler;
pub mod extract;
pub mod middleware;
pub mod response;
pub mod routing;
pub mod server;

pub use app::{Application, CompiledApplication, Dispatched, Operation, RouterGroup};
pub use exception_handler::{DomainErrorHandler, ErrorResponse, ErrorTranslator, ExceptionHandler};
pub use extract::{extract_inputs, ExtractError};
pub use response::{HttpResponse, IntoHttpResponse, Json};
pub use routing::{RouteMatch, RouteTable};
pub use server::{ServerProperties, WebServer};

pub mod prelude {
    //! 预导入模块

    pub use crate::app::{Application, CompiledApplication, Operation, RouterGroup};
    pub use crate::exception_handler::{DomainErrorHandler, ErrorResponse, ExceptionHandler};
    pub use crate::response::{HttpResponse, IntoHttpResponse, Json};
    pub use crate::server::{ServerProperties, WebServer};

    pub use reqscope_core::prelude::*;
    pub use reqscope_core::{Environment, LoggingConfig, ResolutionMode, ResolverProperties};

    pub use http::Method;
    pub use serde_json::json;
}
