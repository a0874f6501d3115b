//! RequestScope - 一次请求的解析缓存和生命周期
//!
//! 作用域只属于处理该请求的调用，从请求开始存活到响应（包括 teardown 和延迟任务）结束，
//! 从不在请求之间共享。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::graph::EvaluationPlan;
use crate::provider::{Bindings, Provider, Value};
use crate::storage::KeyValueStore;
use crate::tasks::DeferredQueue;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// 分配一个进程内唯一的请求 ID
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// 节点的求值状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unresolved,
    Resolving,
    Resolved,
    Failed,
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Unresolved
    }
}

/// 一个 Provider 在本次请求中的实例
#[derive(Default)]
pub struct ResolutionNode {
    pub provider: String,
    pub state: NodeState,
    pub value: Option<Value>,

    /// 仅 yielding Provider 在 setup 完成后持有
    pub teardown: Option<Arc<dyn Provider>>,
}

impl std::fmt::Debug for ResolutionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionNode")
            .field("provider", &self.provider)
            .field("state", &self.state)
            .field("teardown_pending", &self.teardown.is_some())
            .finish()
    }
}

/// 协作式取消标记，在每个挂起点检查
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 一次请求的作用域
pub struct RequestScope {
    id: u64,
    nodes: Vec<ResolutionNode>,

    /// setup 完成的顺序（步骤下标）
    setup_order: Vec<usize>,

    deferred: DeferredQueue,
    storage: Option<Arc<dyn KeyValueStore>>,
    cancellation: CancellationFlag,
}

impl RequestScope {
    pub fn new(id: u64, plan: &EvaluationPlan) -> Self {
        let nodes = plan
            .steps()
            .iter()
            .map(|step| ResolutionNode {
                provider: step.definition.id.clone(),
                ..Default::default()
            })
            .collect();

        Self {
            id,
            nodes,
            setup_order: Vec::new(),
            deferred: DeferredQueue::new(),
            storage: None,
            cancellation: CancellationFlag::new(),
        }
    }

    pub fn with_storage(mut self, storage: Option<Arc<dyn KeyValueStore>>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn storage(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.storage.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    pub fn node(&self, index: usize) -> Option<&ResolutionNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[ResolutionNode] {
        &self.nodes
    }

    /// 已解析的值
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.nodes
            .get(index)
            .filter(|n| n.state == NodeState::Resolved)
            .and_then(|n| n.value.as_ref())
    }

    /// setup 完成的顺序（Provider 标识）
    pub fn setup_order(&self) -> Vec<&str> {
        self.setup_order
            .iter()
            .map(|&i| self.nodes[i].provider.as_str())
            .collect()
    }

    pub(crate) fn begin(&mut self, index: usize) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = NodeState::Resolving;
        }
    }

    pub(crate) fn complete(&mut self, index: usize, value: Value, teardown: Option<Arc<dyn Provider>>) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = NodeState::Resolved;
            node.value = Some(value);
            node.teardown = teardown;
            self.setup_order.push(index);
        }
    }

    pub(crate) fn fail(&mut self, index: usize) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.state = NodeState::Failed;
        }
    }

    /// 取出所有待执行的 teardown，按 setup 完成顺序的逆序排列
    ///
    /// 取出后节点不再持有 teardown 句柄，保证每个 teardown 只执行一次。
    pub(crate) fn take_teardowns(&mut self) -> Vec<(String, Value, Arc<dyn Provider>)> {
        let order = std::mem::take(&mut self.setup_order);
        let mut pending = Vec::new();

        for &index in order.iter().rev() {
            let node = &mut self.nodes[index];
            if let (Some(provider), Some(value)) = (node.teardown.take(), node.value.clone()) {
                pending.push((node.provider.clone(), value, provider));
            }
        }

        self.setup_order = order;
        pending
    }

    /// handler 可见的绑定
    pub fn bindings(&self, plan: &EvaluationPlan) -> Bindings {
        let mut bindings = Bindings::new();
        for (name, index) in plan.bindings() {
            bindings.insert(name.clone(), self.value(*index).cloned());
        }
        bindings
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .field("setup_order", &self.setup_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Dependency, DependencyGraphBuilder};
    use crate::provider::{provider_fn, value, Param, ProviderDefinition};
    use crate::registry::ProviderRegistry;

    fn plan() -> EvaluationPlan {
        let mut registry = ProviderRegistry::new();
        registry
            .register(ProviderDefinition::new("a", provider_fn(|_args| async move { Ok(1u32) })))
            .unwrap();
        registry
            .register(
                ProviderDefinition::new("b", provider_fn(|_args| async move { Ok(2u32) }))
                    .with_param(Param::depends("a", "a")),
            )
            .unwrap();
        DependencyGraphBuilder::build(&registry, &[Dependency::bound("b", "b")]).unwrap()
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_take_teardowns_is_lifo_and_once() {
        let plan = plan();
        let mut scope = RequestScope::new(1, &plan);
        let provider = Arc::clone(&plan.steps()[0].definition.provider);

        scope.begin(0);
        scope.complete(0, value(1u32), Some(Arc::clone(&provider)));
        scope.begin(1);
        scope.complete(1, value(2u32), Some(provider));

        let order: Vec<String> = scope.take_teardowns().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert!(scope.take_teardowns().is_empty());
        assert_eq!(scope.setup_order(), vec!["a", "b"]);
    }

    #[test]
    fn test_failed_node_has_no_value() {
        let plan = plan();
        let mut scope = RequestScope::new(1, &plan);
        scope.begin(0);
        scope.fail(0);
        assert_eq!(scope.node(0).unwrap().state, NodeState::Failed);
        assert!(scope.value(0).is_none());
        assert!(scope.bindings(&plan).optional::<u32>("b").unwrap().is_none());
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
