//! 错误翻译
//!
//! 把 [`RequestError`] 转换为线上的错误响应（状态码 + JSON 体）。
//!
//! ## 默认映射
//!
//! 1. **输入错误** - 缺失或无法解析的 path/query/header/cookie/body 参数，422
//! 2. **客户端错误** - Provider 拒绝请求或 teardown 翻译出的 [`ClientError`]，使用它自己的状态码
//! 3. **取消** - 连接在解析完成前断开，503
//! 4. **其他** - 业务错误、panic、内部故障，500
//!
//! 用户注册的 [`ExceptionHandler`] 按优先级先于默认映射执行。

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use reqscope_core::{ClientError, RequestError, ResolutionError};
use serde::Serialize;
use serde_json::{json, Value};

use crate::response::HttpResponse;

/// 标准错误响应格式
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub timestamp: String,
    pub status: u16,
    pub error: String,
    pub message: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    /// 额外的响应头，不进入 JSON 体
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
}

impl ErrorResponse {
    pub fn new(status: u16, message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            status,
            error: reason(status),
            message: message.into(),
            path: path.into(),
            details: None,
            headers: Vec::new(),
        }
    }

    pub fn from_client_error(error: &ClientError, path: impl Into<String>) -> Self {
        let mut response = Self::new(error.status, error.detail.clone(), path);
        response.headers = error.headers.clone();
        response
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn into_http_response(self) -> HttpResponse {
        let status = self.status;
        let headers = self.headers.clone();
        let body = serde_json::to_value(&self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize error response: {}", e);
            json!({ "status": status, "error": reason(status) })
        });

        headers
            .into_iter()
            .fold(HttpResponse::new(status, body), |response, (name, value)| {
                response.with_header(name, value)
            })
    }
}

fn reason(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Error")
        .to_string()
}

/// 自定义异常处理器
#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// 优先级，数字越小优先级越高
    fn priority(&self) -> i32 {
        100
    }

    fn can_handle(&self, error: &RequestError) -> bool;

    /// 返回 `None` 表示交给下一个处理器
    async fn handle_error(&self, error: &RequestError, path: &str) -> Option<ErrorResponse>;
}

/// 把某个业务错误类型映射为固定的状态码，消息取错误的 `Display`
pub struct DomainErrorHandler<E> {
    name: String,
    status: u16,
    priority: i32,
    _phantom: PhantomData<fn() -> E>,
}

impl<E> DomainErrorHandler<E>
where
    E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new(status: u16) -> Self {
        Self {
            name: format!("DomainErrorHandler<{}>", std::any::type_name::<E>()),
            status,
            priority: 100,
            _phantom: PhantomData,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl<E> ExceptionHandler for DomainErrorHandler<E>
where
    E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_handle(&self, error: &RequestError) -> bool {
        error.domain_error::<E>().is_some()
    }

    async fn handle_error(&self, error: &RequestError, path: &str) -> Option<ErrorResponse> {
        let domain = error.domain_error::<E>()?;
        Some(ErrorResponse::new(self.status, domain.to_string(), path))
    }
}

/// 错误翻译器
#[derive(Clone, Default)]
pub struct ErrorTranslator {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl ErrorTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: ExceptionHandler + 'static>(&mut self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn ExceptionHandler>) {
        tracing::debug!("Exception handler registered: {}", handler.name());
        self.handlers.push(handler);
        self.handlers.sort_by_key(|h| h.priority());
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 翻译错误：先尝试自定义处理器，都不处理时使用默认映射
    pub async fn translate(&self, error: &RequestError, path: &str) -> ErrorResponse {
        for handler in &self.handlers {
            if handler.can_handle(error) {
                if let Some(response) = handler.handle_error(error, path).await {
                    tracing::debug!(
                        handler = handler.name(),
                        error = %error,
                        "Error handled by custom handler"
                    );
                    return response;
                }
            }
        }

        self.default_response(error, path)
    }

    fn default_response(&self, error: &RequestError, path: &str) -> ErrorResponse {
        if let Some(client) = error.client_error() {
            tracing::debug!(status = client.status, path, "Client error: {}", client.detail);
            return ErrorResponse::from_client_error(client, path);
        }

        match error {
            RequestError::Resolution(
                e @ (ResolutionError::MissingInput { .. }
                | ResolutionError::InvalidInput { .. }
                | ResolutionError::InvalidValue { .. }),
            ) => {
                tracing::debug!(path, "Request validation failed: {}", e);
                ErrorResponse::new(422, e.to_string(), path).with_details(validation_details(e))
            }
            RequestError::Cancelled | RequestError::Resolution(ResolutionError::Cancelled) => {
                tracing::warn!(path, "Request cancelled before completion");
                ErrorResponse::new(503, "Request cancelled", path)
            }
            other => {
                tracing::error!(error = %other, path, "Unhandled request error");
                ErrorResponse::new(500, "Internal Server Error", path)
            }
        }
    }
}

impl std::fmt::Debug for ErrorTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("ErrorTranslator").field("handlers", &names).finish()
    }
}

fn validation_details(error: &ResolutionError) -> Value {
    match error {
        ResolutionError::MissingInput { kind, name } => json!([{
            "type": "missing",
            "loc": [kind.to_string(), name],
            "msg": "Field required",
        }]),
        ResolutionError::InvalidInput {
            kind,
            name,
            message,
        } => json!([{
            "type": "invalid",
            "loc": [kind.to_string(), name],
            "msg": message,
        }]),
        ResolutionError::InvalidValue { name, message } => json!([{
            "type": "parsing",
            "loc": [name],
            "msg": message,
        }]),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqscope_core::InputKind;

    #[derive(Debug, thiserror::Error)]
    #[error("Oops! {0} did something. There goes a rainbow...")]
    struct UnicornError(String);

    #[tokio::test]
    async fn test_default_status_mapping() {
        let translator = ErrorTranslator::new();

        let missing = RequestError::Resolution(ResolutionError::MissingInput {
            kind: InputKind::Header,
            name: "x-token".into(),
        });
        let response = translator.translate(&missing, "/items").await;
        assert_eq!(response.status, 422);
        assert_eq!(response.details.unwrap()[0]["loc"], json!(["header", "x-token"]));

        let rejected = RequestError::Resolution(ClientError::unauthorized("Not authenticated").into());
        let response = translator.translate(&rejected, "/users/me").await;
        assert_eq!(response.status, 401);
        assert_eq!(response.message, "Not authenticated");
        assert_eq!(response.headers[0].0, "WWW-Authenticate");

        let cancelled = translator.translate(&RequestError::Cancelled, "/").await;
        assert_eq!(cancelled.status, 503);

        let internal = RequestError::Handler(anyhow::anyhow!("db password is hunter2"));
        let response = translator.translate(&internal, "/").await;
        assert_eq!(response.status, 500);
        assert_eq!(response.message, "Internal Server Error");
    }

    #[tokio::test]
    async fn test_domain_handler_claims_error() {
        let mut translator = ErrorTranslator::new();
        translator.register(DomainErrorHandler::<UnicornError>::new(418));

        let error = RequestError::Handler(anyhow::Error::new(UnicornError("yolo".into())));
        let response = translator.translate(&error, "/unicorns/yolo").await;
        assert_eq!(response.status, 418);
        assert_eq!(response.error, "I'm a teapot");
        assert_eq!(response.message, "Oops! yolo did something. There goes a rainbow...");

        let other = RequestError::Handler(anyhow::anyhow!("plain"));
        assert_eq!(translator.translate(&other, "/").await.status, 500);
    }

    #[test]
    fn test_error_response_body_excludes_headers() {
        let response = ErrorResponse::new(401, "Not authenticated", "/me")
            .with_header("WWW-Authenticate", "Bearer")
            .into_http_response();

        assert_eq!(response.status, 401);
        assert_eq!(response.body["message"], "Not authenticated");
        assert!(response.body.get("headers").is_none());
        assert_eq!(
            response.headers,
            vec![("WWW-Authenticate".to_string(), "Bearer".to_string())]
        );
    }
}
