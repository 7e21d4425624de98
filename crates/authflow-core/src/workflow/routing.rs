//! Table-driven routing between nodes.
//!
//! Each node owns an ordered list of outgoing edges. Routing evaluates them in
//! declaration order and takes the first whose predicate holds; an edge without
//! a predicate always matches. No match is a routing error.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::EngineError;

/// Predicate over the state payload.
pub type Predicate<P> = Arc<dyn Fn(&P) -> bool + Send + Sync>;

/// Where an edge leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    /// The instance completes.
    End,
}

impl Target {
    pub fn node(id: impl Into<String>) -> Self {
        Target::Node(id.into())
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Target::Node(id) => Some(id),
            Target::End => None,
        }
    }
}

/// One routing row.
pub struct Edge<P> {
    pub from: String,
    pub to: Target,
    pub predicate: Option<Predicate<P>>,
    pub label: String,
}

impl<P> Edge<P> {
    /// Unconditional edge.
    pub fn always(from: impl Into<String>, to: Target, label: String) -> Self {
        Self {
            from: from.into(),
            to,
            predicate: None,
            label,
        }
    }

    /// Edge taken when `predicate` holds.
    pub fn when<F>(from: impl Into<String>, to: Target, label: String, predicate: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            to,
            predicate: Some(Arc::new(predicate)),
            label,
        }
    }

    pub fn matches(&self, state: &P) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(state))
    }
}

impl<P> Clone for Edge<P> {
    fn clone(&self) -> Self {
        Self {
            from: self.from.clone(),
            to: self.to.clone(),
            predicate: self.predicate.clone(),
            label: self.label.clone(),
        }
    }
}

impl<P> std::fmt::Debug for Edge<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("conditional", &self.predicate.is_some())
            .field("label", &self.label)
            .finish()
    }
}

/// Outgoing edges per node, in declaration order.
pub struct RoutingTable<P> {
    rows: HashMap<String, Vec<Edge<P>>>,
}

impl<P> RoutingTable<P> {
    pub fn new() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }

    pub fn push(&mut self, edge: Edge<P>) {
        self.rows.entry(edge.from.clone()).or_default().push(edge);
    }

    pub fn edges_from(&self, from: &str) -> &[Edge<P>] {
        self.rows.get(from).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_edges(&self) -> impl Iterator<Item = &Edge<P>> {
        self.rows.values().flatten()
    }

    /// Whether some edge (conditional or not) leads from `from` to node `to`.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges_from(from)
            .iter()
            .any(|e| e.to.node_id() == Some(to))
    }

    /// First matching edge target from `from`.
    pub fn route(&self, from: &str, state: &P) -> Result<Target, EngineError> {
        let edges = self.edges_from(from);
        if edges.is_empty() {
            return Err(EngineError::Routing {
                node: from.to_string(),
                reason: "node has no outgoing edges".to_string(),
            });
        }
        edges
            .iter()
            .find(|e| e.matches(state))
            .map(|e| e.to.clone())
            .ok_or_else(|| EngineError::Routing {
                node: from.to_string(),
                reason: format!("none of {} edges matched", edges.len()),
            })
    }
}

impl<P> Default for RoutingTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable<i32> {
        let mut t = RoutingTable::new();
        t.push(Edge::when("a", Target::node("neg"), "negative".into(), |s: &i32| *s < 0));
        t.push(Edge::when("a", Target::node("big"), "big".into(), |s: &i32| *s > 100));
        t.push(Edge::when("a", Target::node("even"), "even".into(), |s: &i32| s % 2 == 0));
        t.push(Edge::always("b", Target::End, "done".into()));
        t
    }

    #[test]
    fn test_first_match_wins() {
        let t = table();
        // 200 is both big and even; big is declared first
        assert_eq!(t.route("a", &200).unwrap(), Target::node("big"));
        assert_eq!(t.route("a", &-4).unwrap(), Target::node("neg"));
        assert_eq!(t.route("a", &8).unwrap(), Target::node("even"));
    }

    #[test]
    fn test_no_match_is_routing_error() {
        let err = table().route("a", &7).unwrap_err();
        assert!(matches!(err, EngineError::Routing { ref node, .. } if node == "a"));
    }

    #[test]
    fn test_no_edges_is_routing_error() {
        assert!(table().route("zzz", &1).is_err());
    }

    #[test]
    fn test_unconditional_edge_to_end() {
        assert_eq!(table().route("b", &0).unwrap(), Target::End);
    }

    #[test]
    fn test_has_edge() {
        let t = table();
        assert!(t.has_edge("a", "even"));
        assert!(!t.has_edge("a", "b"));
        assert!(!t.has_edge("b", "a"));
    }
}
