//! Web 服务器
//!
//! 基于 Axum 的传输层：所有请求都进入同一个 fallback，由
//! [`CompiledApplication::dispatch`] 完成路由和依赖解析。

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use futures_util::{future, stream, StreamExt};
use http::{header, HeaderName, HeaderValue, StatusCode};
use reqscope_core::{
    CancellationFlag, ConfigValue, ConfigurationError, Environment, PendingTasks, RequestError,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::app::CompiledApplication;
use crate::exception_handler::ErrorResponse;
use crate::extract::{extract_inputs, DEFAULT_BODY_LIMIT};
use crate::middleware;
use crate::response::HttpResponse;

/// Web 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProperties {
    pub host: String,
    pub port: u16,

    /// 是否启用请求日志
    pub enable_request_logging: bool,

    /// 请求体上限（字节）
    pub body_limit: usize,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_request_logging: true,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

impl ServerProperties {
    /// 从 Environment 加载配置，存在但无法解析的配置项报 `InvalidProperty`
    pub fn from_environment(env: &Environment) -> Result<Self, ConfigurationError> {
        let defaults = Self::default();
        Ok(Self {
            host: env
                .get_typed("server.host", "a host name", |v| {
                    v.as_str()
                        .filter(|h| !h.trim().is_empty() && !h.contains(['/', ' ']))
                        .map(String::from)
                })?
                .unwrap_or(defaults.host),
            port: env
                .get_typed("server.port", "a port number", |v| {
                    v.as_i64().and_then(|p| u16::try_from(p).ok())
                })?
                .unwrap_or(defaults.port),
            enable_request_logging: env
                .get_typed("server.enable-request-logging", "a boolean", ConfigValue::as_bool)?
                .unwrap_or(defaults.enable_request_logging),
            body_limit: env
                .get_typed("server.body-limit", "a size in bytes", |v| {
                    v.as_i64().and_then(|l| usize::try_from(l).ok())
                })?
                .unwrap_or(defaults.body_limit),
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct ServerState {
    app: CompiledApplication,
    body_limit: usize,
}

/// Web 服务器
pub struct WebServer {
    config: ServerProperties,
    app: CompiledApplication,
}

impl WebServer {
    pub fn new(app: CompiledApplication, config: ServerProperties) -> Self {
        Self { config, app }
    }

    pub fn config(&self) -> &ServerProperties {
        &self.config
    }

    /// 生成 axum 路由，可以直接用于测试
    pub fn into_router(self) -> Router {
        let state = Arc::new(ServerState {
            app: self.app,
            body_limit: self.config.body_limit,
        });

        let mut router = Router::new()
            .fallback(handle_request)
            .with_state(state)
            .layer(axum::middleware::from_fn(middleware::request_id));

        if self.config.enable_request_logging {
            router = router.layer(axum::middleware::from_fn(middleware::request_logging));
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// 启动服务器，收到 Ctrl+C 后优雅退出
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.address();
        let router = self.into_router();

        tracing::info!("Starting reqscope server on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

        tracing::info!("Server listening on http://{}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// 连接断开时 axum 会丢弃 handler 的 future，此时通知正在解析的请求
struct CancelOnDrop {
    flag: CancellationFlag,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Client went away, cancelling request");
            self.flag.cancel();
        }
    }
}

async fn handle_request(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let inputs = match extract_inputs(request, state.body_limit).await {
        Ok(inputs) => inputs,
        Err(e) => {
            let error = RequestError::Resolution(e.into());
            let response = state.app.translate(&error, &path).await;
            return into_response(response, PendingTasks::empty());
        }
    };

    let cancellation = CancellationFlag::new();
    let mut guard = CancelOnDrop {
        flag: cancellation.clone(),
        armed: true,
    };

    // 在独立任务中执行，保证客户端断开后 teardown 仍然会跑完
    let app = state.app.clone();
    let dispatch_path = path.clone();
    let task = tokio::spawn(async move {
        let mut dispatched = app
            .dispatch(&method, &dispatch_path, inputs, cancellation.clone())
            .await;
        // 客户端已经断开，响应不会再发送
        if cancellation.is_cancelled() {
            dispatched.tasks.discard();
        }
        dispatched
    });

    let dispatched = match task.await {
        Ok(dispatched) => dispatched,
        Err(e) => {
            tracing::error!(path = %path, "Dispatch task failed: {}", e);
            guard.armed = false;
            let response = ErrorResponse::new(500, "Internal Server Error", path);
            return into_response(response.into_http_response(), PendingTasks::empty());
        }
    };
    guard.armed = false;

    if !dispatched.teardown.is_clean() {
        tracing::warn!(
            path = %path,
            "{} teardown fault(s) after response was decided",
            dispatched.teardown.faults.len()
        );
    }

    into_response(dispatched.response, dispatched.tasks)
}

/// 转换为 axum 响应
///
/// 响应体是一个流：先产出 JSON，再执行延迟任务。设置了 `Content-Length`，
/// hyper 写完全部字节后会直接丢弃流，这时 [`PendingTasks`] 的 `Drop`
/// 把任务交给 runtime；如果流被继续读取（例如测试里 `to_bytes`），任务在读取末尾执行。
fn into_response(response: HttpResponse, tasks: PendingTasks) -> Response {
    let payload = match serde_json::to_vec(&response.body) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            tracing::error!("Failed to serialize response body: {}", e);
            Bytes::from_static(b"null")
        }
    };
    let content_length = payload.len();

    let head = stream::once(future::ready(Ok::<_, Infallible>(payload)));
    let tail = stream::once(async move {
        let report = tasks.on_response_sent().await;
        if !report.is_clean() {
            tracing::warn!("{} deferred task(s) failed", report.failures.len());
        }
    })
    .filter_map(|()| future::ready(None::<Result<Bytes, Infallible>>));

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, content_length);

    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => tracing::warn!("Dropping invalid response header '{}'", name),
        }
    }

    builder
        .body(Body::from_stream(head.chain(tail)))
        .unwrap_or_else(|e| {
            tracing::error!("Failed to build response: {}", e);
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}
