//! 响应模型
//!
//! handler 返回与传输层无关的 [`HttpResponse`]，由 server 模块转换成 axum 的响应。

use serde::Serialize;
use serde_json::Value;

/// 与传输层无关的响应
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn created(body: Value) -> Self {
        Self::new(201, body)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 可以作为 handler 返回值的类型
pub trait IntoHttpResponse {
    fn into_http_response(self) -> anyhow::Result<HttpResponse>;
}

impl IntoHttpResponse for HttpResponse {
    fn into_http_response(self) -> anyhow::Result<HttpResponse> {
        Ok(self)
    }
}

impl IntoHttpResponse for Value {
    fn into_http_response(self) -> anyhow::Result<HttpResponse> {
        Ok(HttpResponse::ok(self))
    }
}

impl IntoHttpResponse for () {
    fn into_http_response(self) -> anyhow::Result<HttpResponse> {
        Ok(HttpResponse::ok(Value::Null))
    }
}

/// 任意可序列化的值，按 200 返回
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoHttpResponse for Json<T> {
    fn into_http_response(self) -> anyhow::Result<HttpResponse> {
        Ok(HttpResponse::ok(serde_json::to_value(self.0)?))
    }
}
