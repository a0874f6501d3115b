//! Provider 注册表
//!
//! 启动时构建的显式注册表：Provider 标识 -> 定义（参数绑定 + 实现）。
//! 注册完成后整体冻结在 `Arc` 中，请求期间只读。

use std::collections::{HashMap, HashSet};

use crate::error::ConfigurationError;
use crate::provider::ProviderDefinition;

/// Provider 注册表
#[derive(Debug, Default, Clone)]
pub struct ProviderRegistry {
    definitions: HashMap<String, ProviderDefinition>,

    /// 依赖覆盖（测试时替换实现），优先于原始定义
    overrides: HashMap<String, ProviderDefinition>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 Provider 定义
    pub fn register(&mut self, definition: ProviderDefinition) -> Result<(), ConfigurationError> {
        if self.definitions.contains_key(&definition.id) {
            tracing::warn!("Provider '{}' already exists, registration failed", definition.id);
            return Err(ConfigurationError::DuplicateProvider(definition.id));
        }

        tracing::debug!(
            "Provider registered: '{}' ({} param(s), cache={:?}, yielding={})",
            definition.id,
            definition.params.len(),
            definition.cache,
            definition.provider.is_yielding()
        );
        self.definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// 覆盖某个 Provider 的实现
    ///
    /// 覆盖只影响之后构建的执行计划；覆盖定义可以声明不同的参数。
    pub fn override_provider(&mut self, definition: ProviderDefinition) {
        tracing::debug!("Provider '{}' overridden", definition.id);
        self.overrides.insert(definition.id.clone(), definition);
    }

    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }

    pub fn get(&self, id: &str) -> Option<&ProviderDefinition> {
        self.overrides.get(id).or_else(|| self.definitions.get(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// 所有 Provider 标识（排序后）
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .definitions
            .keys()
            .chain(self.overrides.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty() && self.overrides.is_empty()
    }

    /// 验证所有 Provider 的依赖关系
    ///
    /// 检查：
    /// - 引用了未注册的 Provider
    /// - 空的输入键
    /// - 循环依赖（A -> B -> C -> A）
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let ids = self.ids();
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &ids {
            let Some(definition) = self.get(id) else {
                continue;
            };

            for param in &definition.params {
                if let crate::provider::ParamSource::Input { key, .. } = &param.source {
                    if key.is_empty() {
                        return Err(ConfigurationError::UnboundParameter {
                            owner: id.clone(),
                            parameter: param.name.clone(),
                        });
                    }
                }
            }

            let mut deps = Vec::new();
            for (parameter, dep) in definition.provider_dependencies() {
                if !self.contains(dep) {
                    return Err(ConfigurationError::UnknownProvider {
                        owner: id.clone(),
                        parameter: parameter.to_string(),
                        provider: dep.to_string(),
                    });
                }
                deps.push(dep);
            }
            graph.insert(id.as_str(), deps);
        }

        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        for id in &ids {
            if !visited.contains(id.as_str()) {
                if let Some(cycle) = detect_cycle(id, &graph, &mut visited, &mut stack) {
                    return Err(ConfigurationError::CircularDependency { cycle });
                }
            }
        }

        tracing::info!("Dependency validation passed for {} provider(s)", ids.len());
        Ok(())
    }
}

/// DFS 检测环，返回环上的路径
fn detect_cycle<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    stack.push(node);

    if let Some(deps) = graph.get(node) {
        for &dep in deps {
            if let Some(start) = stack.iter().position(|&n| n == dep) {
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = detect_cycle(dep, graph, visited, stack) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.pop();
    None
}
