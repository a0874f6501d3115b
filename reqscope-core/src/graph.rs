//! Dependency Graph Builder
//!
//! 在注册 operation 时执行一次的纯静态分析：从 operation 声明的顶层依赖出发，
//! 计算出覆盖所有传递依赖的求值计划（后序遍历，依赖总在被依赖者之前），
//! 缓存的 Provider 按标识去重，禁用缓存的依赖边各自得到独立的步骤。

use std::collections::HashMap;

use crate::error::ConfigurationError;
use crate::provider::{CachePolicy, InputKind, ParamSource, ProviderDefinition};
use crate::registry::ProviderRegistry;

/// operation 顶层的依赖声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub provider: String,

    /// handler 通过这个名字取值；`None` 表示只为副作用执行（如鉴权检查）
    pub bind_as: Option<String>,

    pub use_cache: bool,
}

impl Dependency {
    /// 绑定到名字的依赖
    pub fn bound(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            bind_as: Some(name.into()),
            use_cache: true,
        }
    }

    /// 只执行不取值的依赖
    pub fn guard(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            bind_as: None,
            use_cache: true,
        }
    }

    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// 参数值的来源
#[derive(Debug, Clone, PartialEq)]
pub enum ArgSource {
    Input {
        kind: InputKind,
        key: String,
        required: bool,
        default: Option<serde_json::Value>,
    },

    /// 计划中另一个步骤的结果
    Step(usize),
}

/// 计划中的一个步骤
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub index: usize,
    pub definition: ProviderDefinition,
    pub args: Vec<(String, ArgSource)>,

    /// 并发层级：叶子为 0，其余为依赖的最大层级 + 1
    pub level: usize,
}

impl PlanStep {
    pub fn provider_id(&self) -> &str {
        &self.definition.id
    }

    /// 依赖的步骤下标
    pub fn dependencies(&self) -> impl Iterator<Item = usize> + '_ {
        self.args.iter().filter_map(|(_, src)| match src {
            ArgSource::Step(idx) => Some(*idx),
            ArgSource::Input { .. } => None,
        })
    }
}

/// 求值计划
#[derive(Debug, Clone, Default)]
pub struct EvaluationPlan {
    steps: Vec<PlanStep>,
    bindings: Vec<(String, usize)>,
}

impl EvaluationPlan {
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    /// handler 可见的绑定（名字 -> 步骤下标）
    pub fn bindings(&self) -> &[(String, usize)] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 按求值顺序排列的 Provider 标识
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(PlanStep::provider_id).collect()
    }

    /// 按层级分组的步骤下标，同一层之间没有依赖关系
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut levels: Vec<Vec<usize>> = Vec::new();
        for step in &self.steps {
            while levels.len() <= step.level {
                levels.push(Vec::new());
            }
            levels[step.level].push(step.index);
        }
        levels
    }
}

/// 依赖图构建器
pub struct DependencyGraphBuilder<'a> {
    registry: &'a ProviderRegistry,
    steps: Vec<PlanStep>,
    cached: HashMap<String, usize>,
    path: Vec<String>,
}

impl<'a> DependencyGraphBuilder<'a> {
    pub fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            steps: Vec::new(),
            cached: HashMap::new(),
            path: Vec::new(),
        }
    }

    /// 为一组顶层依赖构建求值计划
    pub fn build(
        registry: &'a ProviderRegistry,
        dependencies: &[Dependency],
    ) -> Result<EvaluationPlan, ConfigurationError> {
        let mut builder = Self::new(registry);
        let mut bindings: Vec<(String, usize)> = Vec::new();

        for dependency in dependencies {
            let parameter = dependency.bind_as.as_deref().unwrap_or("<guard>");
            let index = builder.visit(
                "<operation>",
                parameter,
                &dependency.provider,
                dependency.use_cache,
            )?;

            if let Some(name) = &dependency.bind_as {
                if bindings.iter().any(|(n, _)| n == name) {
                    return Err(ConfigurationError::DuplicateBinding(name.clone()));
                }
                bindings.push((name.clone(), index));
            }
        }

        tracing::trace!(
            "Evaluation plan built: {}",
            builder
                .steps
                .iter()
                .map(|s| s.definition.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(EvaluationPlan {
            steps: builder.steps,
            bindings,
        })
    }

    fn visit(
        &mut self,
        owner: &str,
        parameter: &str,
        id: &str,
        use_cache: bool,
    ) -> Result<usize, ConfigurationError> {
        let definition = self
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownProvider {
                owner: owner.to_string(),
                parameter: parameter.to_string(),
                provider: id.to_string(),
            })?;

        let cacheable = use_cache && definition.cache == CachePolicy::PerRequest;
        if cacheable {
            if let Some(&index) = self.cached.get(id) {
                return Ok(index);
            }
        }

        if let Some(start) = self.path.iter().position(|p| p == id) {
            let mut cycle = self.path[start..].to_vec();
            cycle.push(id.to_string());
            return Err(ConfigurationError::CircularDependency { cycle });
        }

        self.path.push(id.to_string());

        let mut args = Vec::with_capacity(definition.params.len());
        let mut level = 0;
        for param in &definition.params {
            match &param.source {
                ParamSource::Input {
                    kind,
                    key,
                    required,
                    default,
                } => {
                    if key.is_empty() {
                        return Err(ConfigurationError::UnboundParameter {
                            owner: id.to_string(),
                            parameter: param.name.clone(),
                        });
                    }
                    args.push((
                        param.name.clone(),
                        ArgSource::Input {
                            kind: *kind,
                            key: key.clone(),
                            required: *required,
                            default: default.clone(),
                        },
                    ));
                }
                ParamSource::Provider {
                    id: dep,
                    use_cache: edge_cache,
                } => {
                    let dep_index = self.visit(id, &param.name, dep, *edge_cache)?;
                    level = level.max(self.steps[dep_index].level + 1);
                    args.push((param.name.clone(), ArgSource::Step(dep_index)));
                }
            }
        }

        self.path.pop();

        let index = self.steps.len();
        self.steps.push(PlanStep {
            index,
            definition,
            args,
            level,
        });
        if cacheable {
            self.cached.insert(id.to_string(), index);
        }

        Ok(index)
    }
}
