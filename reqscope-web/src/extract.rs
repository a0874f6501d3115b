//! 从 HTTP 请求中提取输入
//!
//! query 参数重复出现时收集成数组；头部名称统一小写；
//! cookie 从 `Cookie` 头部解析；body 按 JSON 解析，非 JSON 内容按字符串保存。

use axum::body::Body;
use axum::extract::Query;
use http::{header, HeaderMap, Request};
use reqscope_core::{InputKind, RequestInputs, ResolutionError};
use serde_json::Value;
use thiserror::Error;

/// 默认请求体上限：2MB
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to read request body: {0}")]
    Body(String),

    #[error("Invalid query string: {0}")]
    Query(String),

    #[error("Request body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ExtractError> for ResolutionError {
    fn from(error: ExtractError) -> Self {
        let (kind, name) = match &error {
            ExtractError::Query(_) => (InputKind::Query, "<query>"),
            ExtractError::Body(_) | ExtractError::Json(_) => (InputKind::Body, "<body>"),
        };
        ResolutionError::InvalidInput {
            kind,
            name: name.to_string(),
            message: error.to_string(),
        }
    }
}

/// 读取整个请求并转换为 [`RequestInputs`]
pub async fn extract_inputs(
    request: Request<Body>,
    body_limit: usize,
) -> Result<RequestInputs, ExtractError> {
    let (parts, body) = request.into_parts();
    let mut inputs = RequestInputs::new();

    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
        .map_err(|e| ExtractError::Query(e.to_string()))?;
    for (key, value) in group_repeated(pairs) {
        inputs.set_query(key, value);
    }

    for (name, value) in header_values(&parts.headers) {
        inputs.set_header(name, value);
    }

    for (name, value) in parse_cookies(&parts.headers) {
        inputs.set_cookie(name, value);
    }

    let bytes = axum::body::to_bytes(body, body_limit)
        .await
        .map_err(|e| ExtractError::Body(e.to_string()))?;
    if !bytes.is_empty() {
        let parsed = if is_json(&parts.headers) {
            serde_json::from_slice::<Value>(&bytes)?
        } else {
            match std::str::from_utf8(&bytes) {
                Ok(text) => Value::String(text.to_string()),
                Err(e) => return Err(ExtractError::Body(e.to_string())),
            }
        };
        inputs.set_body(Some(parsed));
    }

    Ok(inputs)
}

fn group_repeated(pairs: Vec<(String, String)>) -> Vec<(String, Value)> {
    let mut grouped: Vec<(String, Value)> = Vec::new();
    for (key, value) in pairs {
        match grouped.iter_mut().find(|(k, _)| *k == key) {
            Some((_, Value::Array(values))) => values.push(Value::String(value)),
            Some((_, existing)) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => grouped.push((key, Value::String(value))),
        }
    }
    grouped
}

/// 同名头部用 `", "` 连接
fn header_values(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut values: Vec<(String, String)> = Vec::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            tracing::debug!("Skipping non-ASCII header '{}'", name);
            continue;
        };
        match values.iter_mut().find(|(n, _)| n == name.as_str()) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => values.push((name.as_str().to_string(), value.to_string())),
        }
    }
    values
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

fn is_json(headers: &HeaderMap) -> bool {
    match headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(content_type) => content_type.contains("json"),
        // 没有声明类型时按 JSON 处理
        None => true,
    }
}
