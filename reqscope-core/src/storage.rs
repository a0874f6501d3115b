//! 注入式存储
//!
//! 请求内的 Provider 和 handler 通过作用域拿到存储句柄，
//! 不再依赖进程级的全局字典。

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

/// 键值存储能力：按键读取、写入、删除
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// 写入并返回旧值
    async fn put(&self, key: &str, value: Value) -> anyhow::Result<Option<Value>>;

    /// 删除并返回旧值
    async fn delete(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// 所有键（有序）
    async fn keys(&self) -> anyhow::Result<Vec<String>>;
}

/// 内存实现，适合测试和示例
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, key: impl Into<String>, value: Value) -> Self {
        self.entries.write().insert(key.into(), value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> anyhow::Result<Option<Value>> {
        tracing::trace!("Storing entry '{}'", key);
        Ok(self.entries.write().insert(key.to_string(), value))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<Option<Value>> {
        tracing::trace!("Deleting entry '{}'", key);
        Ok(self.entries.write().remove(key))
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}
