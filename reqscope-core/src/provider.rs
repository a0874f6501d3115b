//! Provider 模型
//!
//! Provider 是一个带有参数声明的计算单元：每个参数要么来自请求输入
//! （path/query/header/cookie/body），要么来自另一个 Provider。
//! yielding Provider 把逻辑拆成 `setup` 和 `teardown` 两个阶段，
//! handler 在两者之间执行。

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{ResolutionError, TeardownError};
use crate::inputs::WHOLE_BODY;
use crate::storage::KeyValueStore;
use crate::tasks::DeferredQueue;
use crate::teardown::Outcome;

/// 解析后的值（类型擦除的共享句柄）
pub type Value = Arc<dyn Any + Send + Sync>;

/// 把任意值包装为 [`Value`]
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

/// 请求输入的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Path,
    Query,
    Header,
    Cookie,
    Body,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Path => write!(f, "path"),
            InputKind::Query => write!(f, "query"),
            InputKind::Header => write!(f, "header"),
            InputKind::Cookie => write!(f, "cookie"),
            InputKind::Body => write!(f, "body"),
        }
    }
}

/// 缓存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// 每个请求最多求值一次
    PerRequest,

    /// 每个引用它的地方都重新求值
    Never,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::PerRequest
    }
}

/// 参数的绑定来源
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSource {
    Input {
        kind: InputKind,
        key: String,
        required: bool,
        default: Option<serde_json::Value>,
    },
    Provider {
        id: String,
        use_cache: bool,
    },
}

/// Provider 的一个参数声明
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub source: ParamSource,
}

impl Param {
    fn input(kind: InputKind, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = match kind {
            InputKind::Header => header_key(&name),
            _ => name.clone(),
        };
        Self {
            name,
            source: ParamSource::Input {
                kind,
                key,
                required: true,
                default: None,
            },
        }
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self::input(InputKind::Path, name)
    }

    pub fn query(name: impl Into<String>) -> Self {
        Self::input(InputKind::Query, name)
    }

    /// 头部参数，`x_token` 会匹配 `x-token`（大小写不敏感）
    pub fn header(name: impl Into<String>) -> Self {
        Self::input(InputKind::Header, name)
    }

    pub fn cookie(name: impl Into<String>) -> Self {
        Self::input(InputKind::Cookie, name)
    }

    /// 请求体对象中的一个字段
    pub fn body(name: impl Into<String>) -> Self {
        Self::input(InputKind::Body, name)
    }

    /// 整个请求体
    pub fn whole_body(name: impl Into<String>) -> Self {
        Self::input(InputKind::Body, name).alias(WHOLE_BODY)
    }

    /// 依赖另一个 Provider
    pub fn depends(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Provider {
                id: provider.into(),
                use_cache: true,
            },
        }
    }

    /// 使用不同于参数名的输入键
    pub fn alias(mut self, key: impl Into<String>) -> Self {
        if let ParamSource::Input { kind, key: k, .. } = &mut self.source {
            let key = key.into();
            *k = match kind {
                InputKind::Header => header_key(&key),
                _ => key,
            };
        }
        self
    }

    /// 头部键保持原样，不做 `_` -> `-` 转换
    pub fn raw_header(mut self) -> Self {
        if let ParamSource::Input { kind: InputKind::Header, key, .. } = &mut self.source {
            *key = self.name.to_lowercase();
        }
        self
    }

    pub fn optional(mut self) -> Self {
        if let ParamSource::Input { required, .. } = &mut self.source {
            *required = false;
        }
        self
    }

    pub fn with_default(mut self, value: impl Into<serde_json::Value>) -> Self {
        if let ParamSource::Input {
            required, default, ..
        } = &mut self.source
        {
            *required = false;
            *default = Some(value.into());
        }
        self
    }

    /// 这条依赖边不使用请求缓存
    pub fn no_cache(mut self) -> Self {
        if let ParamSource::Provider { use_cache, .. } = &mut self.source {
            *use_cache = false;
        }
        self
    }
}

fn header_key(name: &str) -> String {
    name.to_lowercase().replace('_', "-")
}

/// Provider trait
///
/// 普通 Provider 只实现 `setup`；yielding Provider 还需要实现 `teardown`
/// 并让 `is_yielding` 返回 true。`teardown` 收到 setup 产生的值和请求结果。
#[async_trait]
pub trait Provider: Send + Sync {
    async fn setup(&self, args: ProviderArgs) -> Result<Value, ResolutionError>;

    async fn teardown(&self, _value: Value, _outcome: &Outcome<'_>) -> Result<(), TeardownError> {
        Ok(())
    }

    fn is_yielding(&self) -> bool {
        false
    }
}

/// 由异步闭包构造的普通 Provider
pub struct FnProvider<F, T> {
    setup_fn: F,
    _phantom: PhantomData<fn() -> T>,
}

/// 由闭包创建 Provider
///
/// ```rust,ignore
/// let extractor = provider_fn(|args| async move { Ok(args.str("q")) });
/// ```
pub fn provider_fn<F, Fut, T>(setup_fn: F) -> FnProvider<F, T>
where
    F: Fn(ProviderArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ResolutionError>> + Send,
    T: Any + Send + Sync,
{
    FnProvider {
        setup_fn,
        _phantom: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> Provider for FnProvider<F, T>
where
    F: Fn(ProviderArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ResolutionError>> + Send,
    T: Any + Send + Sync,
{
    async fn setup(&self, args: ProviderArgs) -> Result<Value, ResolutionError> {
        let instance = (self.setup_fn)(args).await?;
        Ok(Arc::new(instance))
    }
}

/// 由两个闭包构造的 yielding Provider，teardown 是同步的
///
/// 需要异步清理时直接实现 [`Provider`]。
pub struct YieldingFn<S, D, T> {
    setup_fn: S,
    teardown_fn: D,
    _phantom: PhantomData<fn() -> T>,
}

pub fn yielding<S, Fut, D, T>(setup_fn: S, teardown_fn: D) -> YieldingFn<S, D, T>
where
    S: Fn(ProviderArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ResolutionError>> + Send,
    D: Fn(Arc<T>, &Outcome<'_>) -> Result<(), TeardownError> + Send + Sync,
    T: Any + Send + Sync,
{
    YieldingFn {
        setup_fn,
        teardown_fn,
        _phantom: PhantomData,
    }
}

#[async_trait]
impl<S, Fut, D, T> Provider for YieldingFn<S, D, T>
where
    S: Fn(ProviderArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ResolutionError>> + Send,
    D: Fn(Arc<T>, &Outcome<'_>) -> Result<(), TeardownError> + Send + Sync,
    T: Any + Send + Sync,
{
    async fn setup(&self, args: ProviderArgs) -> Result<Value, ResolutionError> {
        let instance = (self.setup_fn)(args).await?;
        Ok(Arc::new(instance))
    }

    async fn teardown(&self, value: Value, outcome: &Outcome<'_>) -> Result<(), TeardownError> {
        let typed = value.downcast::<T>().map_err(|_| {
            TeardownError::Fault(anyhow::anyhow!(
                "teardown received a value that is not {}",
                std::any::type_name::<T>()
            ))
        })?;
        (self.teardown_fn)(typed, outcome)
    }

    fn is_yielding(&self) -> bool {
        true
    }
}

/// Provider 定义 - 描述参数绑定和缓存策略
#[derive(Clone)]
pub struct ProviderDefinition {
    /// Provider 的标识（用于去重和缓存）
    pub id: String,

    /// 参数声明
    pub params: Vec<Param>,

    pub cache: CachePolicy,

    pub provider: Arc<dyn Provider>,
}

impl ProviderDefinition {
    pub fn new<P>(id: impl Into<String>, provider: P) -> Self
    where
        P: Provider + 'static,
    {
        Self::from_arc(id, Arc::new(provider))
    }

    pub fn from_arc(id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        Self {
            id: id.into(),
            params: Vec::new(),
            cache: CachePolicy::default(),
            provider,
        }
    }

    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    /// 依赖的 Provider 标识（参数名, Provider 标识）
    pub fn provider_dependencies(&self) -> Vec<(&str, &str)> {
        self.params
            .iter()
            .filter_map(|p| match &p.source {
                ParamSource::Provider { id, .. } => Some((p.name.as_str(), id.as_str())),
                ParamSource::Input { .. } => None,
            })
            .collect()
    }
}

impl fmt::Debug for ProviderDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDefinition")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("cache", &self.cache)
            .field("yielding", &self.provider.is_yielding())
            .finish()
    }
}

/// 按名称寻址的解析结果
///
/// 值为 `None` 表示可选输入缺失。
#[derive(Clone, Default)]
pub struct Bindings {
    values: HashMap<String, Option<Value>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Option<Value>) {
        self.values.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name).and_then(Option::as_ref)
    }

    /// 获取必需的值
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ResolutionError> {
        self.optional::<T>(name)?
            .ok_or_else(|| ResolutionError::MissingValue {
                name: name.to_string(),
            })
    }

    /// 获取可选的值，名称未绑定时报错，绑定为空时返回 `None`
    pub fn optional<T: Any + Send + Sync>(
        &self,
        name: &str,
    ) -> Result<Option<Arc<T>>, ResolutionError> {
        let slot = self
            .values
            .get(name)
            .ok_or_else(|| ResolutionError::MissingValue {
                name: name.to_string(),
            })?;

        match slot {
            None => Ok(None),
            Some(v) => Arc::clone(v)
                .downcast::<T>()
                .map(Some)
                .map_err(|_| ResolutionError::TypeMismatch {
                    name: name.to_string(),
                    expected: std::any::type_name::<T>(),
                }),
        }
    }

    /// 输入参数的原始 JSON 值
    pub fn input(&self, name: &str) -> Option<&serde_json::Value> {
        self.raw(name)
            .and_then(|v| v.downcast_ref::<serde_json::Value>())
            .filter(|v| !v.is_null())
    }

    /// 输入参数或 `String`/`Option<String>` 类型的 Provider 结果，转为字符串
    pub fn str(&self, name: &str) -> Option<String> {
        let raw = self.raw(name)?;
        if let Some(json) = raw.downcast_ref::<serde_json::Value>() {
            return match json {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
        }
        if let Some(s) = raw.downcast_ref::<String>() {
            return Some(s.clone());
        }
        raw.downcast_ref::<Option<String>>().cloned().flatten()
    }

    /// 把输入参数反序列化为具体类型，缺失的可选输入按 `null` 处理
    ///
    /// 字符串形式的标量（`"5"`、`"true"`）会再按 JSON 解析一次，
    /// 这样 query/header 中的数字和布尔值可以直接反序列化。
    pub fn deserialize<T: DeserializeOwned>(&self, name: &str) -> Result<T, ResolutionError> {
        if !self.contains(name) {
            return Err(ResolutionError::MissingValue {
                name: name.to_string(),
            });
        }
        let json = self
            .raw(name)
            .and_then(|v| v.downcast_ref::<serde_json::Value>())
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let error = match serde_json::from_value::<T>(json.clone()) {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if let serde_json::Value::String(s) = &json {
            if let Ok(v) = serde_json::from_str::<T>(s) {
                return Ok(v);
            }
        }
        Err(ResolutionError::InvalidValue {
            name: name.to_string(),
            message: error.to_string(),
        })
    }

    /// 值的实际类型是否为 `T`
    pub fn is<T: Any>(&self, name: &str) -> bool {
        self.raw(name)
            .map(|v| (**v).type_id() == TypeId::of::<T>())
            .unwrap_or(false)
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort();
        f.debug_struct("Bindings").field("names", &names).finish()
    }
}

/// Provider setup 阶段收到的参数
#[derive(Clone)]
pub struct ProviderArgs {
    owner: String,
    bindings: Bindings,
    deferred: DeferredQueue,
    storage: Option<Arc<dyn KeyValueStore>>,
}

impl ProviderArgs {
    pub(crate) fn new(
        owner: impl Into<String>,
        bindings: Bindings,
        deferred: DeferredQueue,
        storage: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        Self {
            owner: owner.into(),
            bindings,
            deferred,
            storage,
        }
    }

    /// 正在求值的 Provider 标识
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// 注册在响应发送之后执行的任务
    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn storage(&self) -> Result<&Arc<dyn KeyValueStore>, ResolutionError> {
        self.storage.as_ref().ok_or_else(|| {
            ResolutionError::Domain(anyhow::anyhow!(
                "provider '{}' requires a storage but none is configured",
                self.owner
            ))
        })
    }
}

impl Deref for ProviderArgs {
    type Target = Bindings;

    fn deref(&self) -> &Self::Target {
        &self.bindings
    }
}
