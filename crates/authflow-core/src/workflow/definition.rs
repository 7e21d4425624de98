//! Workflow definitions: an immutable graph of nodes and routing edges.
//!
//! Definitions are assembled with a `DefinitionBuilder` and validated once in
//! `build()`. After that the graph is fixed: the executor only looks nodes up
//! and evaluates routing rows.

use std::collections::HashMap;
use std::sync::Arc;

use authflow_types::workflow::NodeKind;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use uuid::Uuid;

use super::decision::{DEFAULT_CONFIDENCE_THRESHOLD, DecisionExtractor, DecisionInput, DecisionPolicy};
use super::error::EngineError;
use super::node::NodeHandler;
use super::routing::{Edge, RoutingTable, Target};

// ---------------------------------------------------------------------------
// Sub-workflow spec
// ---------------------------------------------------------------------------

/// Final result of one child, handed to the aggregator in declaration order.
#[derive(Debug, Clone)]
pub struct ChildResult<P> {
    pub index: usize,
    pub child_instance_id: Uuid,
    /// Final state of a completed child, or the reason it did not complete.
    pub outcome: Result<P, String>,
}

/// Merges the parent state with every child result into the fan-in state.
pub type Aggregator<P> = Arc<dyn Fn(P, Vec<ChildResult<P>>) -> Result<P, String> + Send + Sync>;

/// What to do when some children did not complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartialFailurePolicy {
    /// Aggregate what is there; failed children show up as `Err` results.
    #[default]
    ProceedWithGaps,
    /// Fail the parent if any child failed.
    FailFanIn,
}

/// Fan-out configuration of a sub-workflow node.
#[derive(Clone)]
pub struct SubworkflowSpec<P> {
    pub child_definition: String,
    /// Node of the parent that runs once every child finished.
    pub fan_in: String,
    pub aggregator: Aggregator<P>,
    pub failure_policy: PartialFailurePolicy,
}

impl<P> SubworkflowSpec<P> {
    pub fn new<F>(child_definition: impl Into<String>, fan_in: impl Into<String>, aggregator: F) -> Self
    where
        F: Fn(P, Vec<ChildResult<P>>) -> Result<P, String> + Send + Sync + 'static,
    {
        Self {
            child_definition: child_definition.into(),
            fan_in: fan_in.into(),
            aggregator: Arc::new(aggregator),
            failure_policy: PartialFailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: PartialFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

impl<P> std::fmt::Debug for SubworkflowSpec<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubworkflowSpec")
            .field("child_definition", &self.child_definition)
            .field("fan_in", &self.fan_in)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A node of a definition.
pub struct NodeSpec<P> {
    pub id: String,
    pub kind: NodeKind,
    pub handler: Arc<dyn NodeHandler<P>>,
    pub policy: Option<Arc<DecisionPolicy>>,
    pub subworkflow: Option<SubworkflowSpec<P>>,
}

impl<P> std::fmt::Debug for NodeSpec<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .field("subworkflow", &self.subworkflow)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// Validated, immutable workflow graph.
pub struct WorkflowDefinition<P> {
    id: String,
    version: u32,
    entry: String,
    nodes: HashMap<String, NodeSpec<P>>,
    routes: RoutingTable<P>,
    step_limit: u32,
}

impl<P> WorkflowDefinition<P> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Maximum number of node executions per instance.
    pub fn step_limit(&self) -> u32 {
        self.step_limit
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec<P>> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn routes(&self) -> &RoutingTable<P> {
        &self.routes
    }

    /// Route from `from` over `state` using the routing table.
    pub fn route(&self, from: &str, state: &P) -> Result<Target, EngineError> {
        self.routes.route(from, state)
    }

    /// Whether a handler at `from` may jump straight to `to`.
    ///
    /// Explicit jumps must follow a declared edge; re-entering the same node is
    /// always allowed.
    pub fn allows_jump(&self, from: &str, to: &str) -> bool {
        from == to || self.routes.has_edge(from, to)
    }
}

impl<P> std::fmt::Debug for WorkflowDefinition<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("entry", &self.entry)
            .field("nodes", &self.nodes.len())
            .field("step_limit", &self.step_limit)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// DefinitionBuilder
// ---------------------------------------------------------------------------

struct PendingDecision<P> {
    node: String,
    policy: DecisionPolicy,
    extract: DecisionExtractor<P>,
}

/// Assembles and validates a `WorkflowDefinition`.
pub struct DefinitionBuilder<P> {
    id: String,
    version: u32,
    entry: String,
    step_limit: Option<u32>,
    default_step_limit: u32,
    default_threshold: f64,
    nodes: Vec<NodeSpec<P>>,
    edges: Vec<Edge<P>>,
    decisions: Vec<PendingDecision<P>>,
}

/// Step ceiling used when neither the definition nor the engine config sets one.
pub const DEFAULT_STEP_LIMIT: u32 = 50;

impl<P: 'static> DefinitionBuilder<P> {
    pub fn new(id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            entry: entry.into(),
            step_limit: None,
            default_step_limit: DEFAULT_STEP_LIMIT,
            default_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nodes: Vec::new(),
            edges: Vec::new(),
            decisions: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Step ceiling for this definition.
    pub fn step_limit(mut self, limit: u32) -> Self {
        self.step_limit = Some(limit);
        self
    }

    /// Defaults applied when the definition does not set its own values.
    pub fn defaults(mut self, step_limit: u32, threshold: f64) -> Self {
        self.default_step_limit = step_limit;
        self.default_threshold = threshold;
        self
    }

    fn push_node(
        mut self,
        id: impl Into<String>,
        kind: NodeKind,
        handler: Arc<dyn NodeHandler<P>>,
        subworkflow: Option<SubworkflowSpec<P>>,
    ) -> Self {
        self.nodes.push(NodeSpec {
            id: id.into(),
            kind,
            handler,
            policy: None,
            subworkflow,
        });
        self
    }

    /// Sequential node.
    pub fn node(self, id: impl Into<String>, handler: Arc<dyn NodeHandler<P>>) -> Self {
        self.push_node(id, NodeKind::Sequential, handler, None)
    }

    /// Node allowed to suspend on a human task or a status watch.
    pub fn pause_node(self, id: impl Into<String>, handler: Arc<dyn NodeHandler<P>>) -> Self {
        self.push_node(id, NodeKind::Pause, handler, None)
    }

    /// Node that fans out children and resumes at `spec.fan_in`.
    pub fn subworkflow_node(
        self,
        id: impl Into<String>,
        handler: Arc<dyn NodeHandler<P>>,
        spec: SubworkflowSpec<P>,
    ) -> Self {
        self.push_node(id, NodeKind::Subworkflow, handler, Some(spec))
    }

    /// Decision node routed by `policy` over what `extract` reads from the state.
    pub fn decision_node<F>(
        mut self,
        id: impl Into<String>,
        handler: Arc<dyn NodeHandler<P>>,
        policy: DecisionPolicy,
        extract: F,
    ) -> Self
    where
        F: Fn(&P) -> Option<DecisionInput> + Send + Sync + 'static,
    {
        let id = id.into();
        self.decisions.push(PendingDecision {
            node: id.clone(),
            policy,
            extract: Arc::new(extract),
        });
        self.push_node(id, NodeKind::Decision, handler, None)
    }

    /// Unconditional edge.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let (from, to) = (from.into(), to.into());
        let label = format!("{from} -> {to}");
        self.edges.push(Edge::always(from, Target::Node(to), label));
        self
    }

    /// Edge taken when `predicate` holds.
    pub fn edge_if<F>(mut self, from: impl Into<String>, to: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        let (from, to) = (from.into(), to.into());
        let label = format!("{from} -> {to} (conditional)");
        self.edges
            .push(Edge::when(from, Target::Node(to), label, predicate));
        self
    }

    /// Unconditional edge to completion.
    pub fn end(mut self, from: impl Into<String>) -> Self {
        let from = from.into();
        let label = format!("{from} -> end");
        self.edges.push(Edge::always(from, Target::End, label));
        self
    }

    /// Edge to completion taken when `predicate` holds.
    pub fn end_if<F>(mut self, from: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        let from = from.into();
        let label = format!("{from} -> end (conditional)");
        self.edges.push(Edge::when(from, Target::End, label, predicate));
        self
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<WorkflowDefinition<P>, EngineError> {
        let invalid = |msg: String| EngineError::Validation(format!("definition '{}': {msg}", self.id));

        if self.id.trim().is_empty() {
            return Err(EngineError::Validation("definition id must not be blank".to_string()));
        }
        let step_limit = self.step_limit.unwrap_or(self.default_step_limit);
        if step_limit == 0 {
            return Err(invalid("step limit must be greater than 0".to_string()));
        }

        let mut nodes: HashMap<String, NodeSpec<P>> = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
            nodes.insert(node.id.clone(), node);
        }
        if !nodes.contains_key(&self.entry) {
            return Err(invalid(format!("entry node '{}' does not exist", self.entry)));
        }

        let mut routes = RoutingTable::new();
        for edge in self.edges {
            if !nodes.contains_key(&edge.from) {
                return Err(invalid(format!("edge from unknown node '{}'", edge.from)));
            }
            if let Target::Node(to) = &edge.to {
                if !nodes.contains_key(to) {
                    return Err(invalid(format!("edge to unknown node '{to}'")));
                }
            }
            if self.decisions.iter().any(|d| d.node == edge.from) {
                return Err(invalid(format!(
                    "decision node '{}' routes through its policy, not explicit edges",
                    edge.from
                )));
            }
            routes.push(edge);
        }

        for decision in self.decisions {
            let policy = decision.policy.resolve_threshold(self.default_threshold);
            if !(0.0..=1.0).contains(&policy.threshold()) {
                return Err(invalid(format!(
                    "decision node '{}' threshold {} is outside [0, 1]",
                    decision.node,
                    policy.threshold()
                )));
            }
            for target in policy.targets() {
                if !nodes.contains_key(target) {
                    return Err(invalid(format!(
                        "decision node '{}' routes to unknown node '{target}'",
                        decision.node
                    )));
                }
            }
            for edge in policy.edges(&decision.node, decision.extract) {
                routes.push(edge);
            }
            if let Some(node) = nodes.get_mut(&decision.node) {
                node.policy = Some(Arc::new(policy));
            }
        }

        for node in nodes.values() {
            match (node.kind, &node.subworkflow) {
                (NodeKind::Subworkflow, Some(spec)) => {
                    if !nodes.contains_key(&spec.fan_in) {
                        return Err(invalid(format!(
                            "sub-workflow node '{}' fans in at unknown node '{}'",
                            node.id, spec.fan_in
                        )));
                    }
                    if spec.child_definition.trim().is_empty() {
                        return Err(invalid(format!(
                            "sub-workflow node '{}' has no child definition",
                            node.id
                        )));
                    }
                }
                (NodeKind::Subworkflow, None) => {
                    return Err(invalid(format!(
                        "sub-workflow node '{}' has no sub-workflow spec",
                        node.id
                    )));
                }
                (NodeKind::Decision, _) if node.policy.is_none() => {
                    return Err(invalid(format!("decision node '{}' has no policy", node.id)));
                }
                _ => {}
            }
        }

        check_reachability(&self.entry, &nodes, &routes).map_err(invalid)?;

        Ok(WorkflowDefinition {
            id: self.id,
            version: self.version,
            entry: self.entry,
            nodes,
            routes,
            step_limit,
        })
    }
}

/// Every node must be reachable from the entry over edges and fan-in links.
fn check_reachability<P>(
    entry: &str,
    nodes: &HashMap<String, NodeSpec<P>>,
    routes: &RoutingTable<P>,
) -> Result<(), String> {
    let mut graph: DiGraph<&str, ()> = DiGraph::with_capacity(nodes.len(), nodes.len());
    let index: HashMap<&str, NodeIndex> = nodes
        .keys()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();

    for edge in routes.all_edges() {
        if let (Some(&from), Some(to)) = (index.get(edge.from.as_str()), edge.to.node_id()) {
            if let Some(&to) = index.get(to) {
                graph.update_edge(from, to, ());
            }
        }
    }
    for node in nodes.values() {
        if let Some(spec) = &node.subworkflow {
            if let (Some(&from), Some(&to)) =
                (index.get(node.id.as_str()), index.get(spec.fan_in.as_str()))
            {
                graph.update_edge(from, to, ());
            }
        }
    }

    let Some(&start) = index.get(entry) else {
        return Err(format!("entry node '{entry}' does not exist"));
    };
    let mut seen = vec![false; graph.node_count()];
    let mut dfs = Dfs::new(&graph, start);
    while let Some(ix) = dfs.next(&graph) {
        seen[ix.index()] = true;
    }

    let mut unreachable: Vec<&str> = graph
        .node_indices()
        .filter(|ix| !seen[ix.index()])
        .map(|ix| graph[ix])
        .collect();
    if unreachable.is_empty() {
        return Ok(());
    }
    unreachable.sort_unstable();
    Err(format!(
        "nodes unreachable from entry: {}",
        unreachable.join(", ")
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node::{NodeContext, Transition, handler_fn};
    use authflow_types::decision::RecommendedAction;

    fn noop() -> Arc<dyn NodeHandler<i64>> {
        handler_fn(|s: i64, _ctx: NodeContext| async move { Ok(Transition::next(s)) })
    }

    fn linear() -> DefinitionBuilder<i64> {
        DefinitionBuilder::new("linear", "a")
            .node("a", noop())
            .node("b", noop())
            .edge("a", "b")
            .end("b")
    }

    fn err_text(result: Result<WorkflowDefinition<i64>, EngineError>) -> String {
        match result {
            Ok(_) => panic!("expected validation failure"),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn test_build_linear() {
        let def = linear().build().unwrap();
        assert_eq!(def.entry(), "a");
        assert_eq!(def.step_limit(), DEFAULT_STEP_LIMIT);
        assert_eq!(def.route("a", &0).unwrap(), Target::node("b"));
        assert_eq!(def.route("b", &0).unwrap(), Target::End);
        assert!(def.allows_jump("a", "b"));
        assert!(def.allows_jump("a", "a"));
        assert!(!def.allows_jump("b", "a"));
    }

    #[test]
    fn test_defaults_and_override() {
        let def = linear().defaults(20, 0.8).build().unwrap();
        assert_eq!(def.step_limit(), 20);
        let def = linear().defaults(20, 0.8).step_limit(5).build().unwrap();
        assert_eq!(def.step_limit(), 5);
        assert!(err_text(linear().step_limit(0).build()).contains("step limit"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let result = linear().node("a", noop()).build();
        assert!(err_text(result).contains("duplicate node id 'a'"));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let result = DefinitionBuilder::new("x", "ghost").node("a", noop()).build();
        assert!(err_text(result).contains("entry node 'ghost'"));
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let result = linear().edge("b", "nowhere").build();
        assert!(err_text(result).contains("unknown node 'nowhere'"));
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let result = linear().node("island", noop()).end("island").build();
        assert!(err_text(result).contains("unreachable from entry: island"));
    }

    #[test]
    fn test_fan_in_link_counts_for_reachability() {
        let def = DefinitionBuilder::new("fan", "split")
            .subworkflow_node(
                "split",
                noop(),
                SubworkflowSpec::new("child", "merge", |parent: i64, _results| Ok(parent)),
            )
            .node("merge", noop())
            .end("merge")
            .build()
            .unwrap();
        let spec = def.node("split").unwrap().subworkflow.as_ref().unwrap();
        assert_eq!(spec.fan_in, "merge");
        assert_eq!(spec.failure_policy, PartialFailurePolicy::ProceedWithGaps);
    }

    #[test]
    fn test_unknown_fan_in_rejected() {
        let result = DefinitionBuilder::new("fan", "split")
            .subworkflow_node(
                "split",
                noop(),
                SubworkflowSpec::new("child", "merge", |parent: i64, _results| Ok(parent)),
            )
            .build();
        assert!(err_text(result).contains("unknown node 'merge'"));
    }

    fn decision_builder(policy: DecisionPolicy) -> DefinitionBuilder<i64> {
        DefinitionBuilder::new("decide", "analyze")
            .decision_node("analyze", noop(), policy, |s: &i64| {
                Some((RecommendedAction::Appeal, *s as f64 / 100.0))
            })
            .pause_node("review", noop())
            .node("appeal", noop())
            .end("review")
            .end("appeal")
    }

    #[test]
    fn test_decision_edges_generated() {
        let def = decision_builder(
            DecisionPolicy::new("review").route(RecommendedAction::Appeal, "appeal"),
        )
        .defaults(50, 0.7)
        .build()
        .unwrap();
        assert_eq!(def.route("analyze", &40).unwrap(), Target::node("review"));
        assert_eq!(def.route("analyze", &90).unwrap(), Target::node("appeal"));
        let policy = def.node("analyze").unwrap().policy.as_ref().unwrap();
        assert!((policy.threshold() - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decision_threshold_from_defaults() {
        let def = decision_builder(
            DecisionPolicy::new("review").route(RecommendedAction::Appeal, "appeal"),
        )
        .defaults(50, 0.95)
        .build()
        .unwrap();
        assert_eq!(def.route("analyze", &90).unwrap(), Target::node("review"));
    }

    #[test]
    fn test_decision_unknown_target_rejected() {
        let result = decision_builder(
            DecisionPolicy::new("review").route(RecommendedAction::FinalDenial, "deny"),
        )
        .build();
        assert!(err_text(result).contains("unknown node 'deny'"));
    }

    #[test]
    fn test_decision_explicit_edge_rejected() {
        let result = decision_builder(
            DecisionPolicy::new("review").route(RecommendedAction::Appeal, "appeal"),
        )
        .edge("analyze", "appeal")
        .build();
        assert!(err_text(result).contains("routes through its policy"));
    }
}
