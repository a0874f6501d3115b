//! 请求输入
//!
//! 由外部的传输/序列化层提取并完成类型转换，解析器只负责按键查找。

use std::collections::HashMap;

use serde_json::Value;

use crate::provider::InputKind;

/// 绑定整个请求体的输入键
pub const WHOLE_BODY: &str = "*";

/// 一次请求已经提取好的输入
#[derive(Debug, Clone, Default)]
pub struct RequestInputs {
    path: HashMap<String, Value>,
    query: HashMap<String, Value>,
    headers: HashMap<String, Value>,
    cookies: HashMap<String, Value>,
    body: Option<Value>,
}

impl RequestInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_path(key, value);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_query(key, value);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_header(key, value);
        self
    }

    pub fn with_cookie(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_cookie(key, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn set_path(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.path.insert(key.into(), value.into());
    }

    pub fn set_query(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.query.insert(key.into(), value.into());
    }

    /// 头部名称统一转成小写
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key.into().to_lowercase(), value.into());
    }

    pub fn set_cookie(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.cookies.insert(key.into(), value.into());
    }

    pub fn set_body(&mut self, body: Option<Value>) {
        self.body = body;
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// 按来源和键查找输入
    ///
    /// 请求体只有在键为 [`WHOLE_BODY`] 时才整体返回，其余键取对象中的字段。
    pub fn lookup(&self, kind: InputKind, key: &str) -> Option<&Value> {
        match kind {
            InputKind::Path => self.path.get(key),
            InputKind::Query => self.query.get(key),
            InputKind::Header => self.headers.get(&key.to_lowercase()),
            InputKind::Cookie => self.cookies.get(key),
            InputKind::Body => {
                let body = self.body.as_ref()?;
                if key == WHOLE_BODY {
                    Some(body)
                } else {
                    body.as_object()?.get(key)
                }
            }
        }
    }
}
