//! 路由表
//!
//! 基于 `matchit` 的路由表，支持 `{name}` 形式的路径参数，例如
//! `/users/{user_id}/items/{item_id}`。静态段优先于参数段匹配，
//! 参数值在交给解析器之前做百分号解码。

use http::Method;
use matchit::{Match, Router as MatchRouter};
use percent_encoding::percent_decode_str;
use reqscope_core::ConfigurationError;

/// 一次查找的结果
#[derive(Debug, PartialEq)]
pub enum RouteMatch<'a, T> {
    Found {
        route: &'a T,
        params: Vec<(String, String)>,
    },
    /// 路径存在，但没有这个方法
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

/// 路径 -> (方法 -> 路由) 的查找表
pub struct RouteTable<T> {
    router: MatchRouter<Vec<(Method, T)>>,
    templates: Vec<(String, Vec<(Method, T)>)>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self {
            router: MatchRouter::new(),
            templates: Vec::new(),
        }
    }
}

impl<T> RouteTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 暂存一个路由，`freeze()` 时统一插入
    pub fn add(&mut self, template: &str, method: Method, route: T) -> Result<(), ConfigurationError> {
        let template = normalize(template);
        check_template(&template)?;

        match self.templates.iter_mut().find(|(t, _)| *t == template) {
            Some((_, methods)) => methods.push((method, route)),
            None => self.templates.push((template, vec![(method, route)])),
        }
        Ok(())
    }

    /// 把暂存的路由插入 matchit，冲突的模板报 `InvalidRoute`
    pub fn freeze(mut self) -> Result<Self, ConfigurationError> {
        for (template, methods) in std::mem::take(&mut self.templates) {
            self.router
                .insert(template.as_str(), methods)
                .map_err(|e| ConfigurationError::InvalidRoute {
                    route: template.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok(self)
    }

    pub fn find(&self, method: &Method, path: &str) -> RouteMatch<'_, T> {
        let path = normalize(path);
        let Ok(Match { value, params }) = self.router.at(&path) else {
            return RouteMatch::NotFound;
        };

        match value.iter().find(|(m, _)| m == method) {
            Some((_, route)) => RouteMatch::Found {
                route,
                params: params
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.to_string(),
                            percent_decode_str(v).decode_utf8_lossy().into_owned(),
                        )
                    })
                    .collect(),
            },
            None => RouteMatch::MethodNotAllowed(value.iter().map(|(m, _)| m.clone()).collect()),
        }
    }
}

/// 参数必须占满整个路径段，且同一模板内不能重名
fn check_template(template: &str) -> Result<(), ConfigurationError> {
    let invalid = |message: &str| ConfigurationError::InvalidRoute {
        route: template.to_string(),
        message: message.to_string(),
    };

    let mut names: Vec<&str> = Vec::new();
    for part in template.split('/').filter(|s| !s.is_empty()) {
        if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            if name.is_empty() || name.contains(['{', '}', '*']) {
                return Err(invalid("empty, nested or catch-all path parameter"));
            }
            if names.contains(&name) {
                return Err(invalid("path parameter declared twice"));
            }
            names.push(name);
        } else if part.contains(['{', '}']) {
            return Err(invalid("path parameters must span a whole segment"));
        }
    }
    Ok(())
}

/// 拼接路由前缀和路径
pub fn join_paths(prefix: &str, path: &str) -> String {
    let joined = format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    normalize(&joined)
}

/// 去掉末尾的 `/`，保证以 `/` 开头
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
