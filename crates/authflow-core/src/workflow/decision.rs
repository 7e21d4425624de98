//! Confidence-gated branch selection for decision points.
//!
//! A `DecisionPolicy` turns a recommended action and its confidence into a
//! node: confident answers go to the node mapped to the action, anything else
//! goes to the escalation node. The policy is expressed as ordinary routing
//! rows so decision points route through the same table as every other node.

use std::sync::Arc;

use authflow_types::decision::{ReasoningResult, RecommendedAction};

use super::routing::{Edge, Target};

/// Threshold used when neither the decision point nor the engine config sets one.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// What a decision point reads out of the state: the action and its confidence.
pub type DecisionInput = (RecommendedAction, f64);

/// Pulls the decision input out of a state payload, `None` when absent.
pub type DecisionExtractor<P> = Arc<dyn Fn(&P) -> Option<DecisionInput> + Send + Sync>;

/// Per-decision-point routing policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPolicy {
    threshold: Option<f64>,
    escalation_node: String,
    routes: Vec<(RecommendedAction, String)>,
}

impl DecisionPolicy {
    /// Policy escalating to `escalation_node`, threshold taken from the default.
    pub fn new(escalation_node: impl Into<String>) -> Self {
        Self {
            threshold: None,
            escalation_node: escalation_node.into(),
            routes: Vec::new(),
        }
    }

    /// Override the threshold for this decision point.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Route a confident `action` to `node`.
    pub fn route(mut self, action: RecommendedAction, node: impl Into<String>) -> Self {
        self.routes.retain(|(a, _)| *a != action);
        self.routes.push((action, node.into()));
        self
    }

    /// Fill in the threshold if this decision point did not set one.
    pub fn resolve_threshold(mut self, default: f64) -> Self {
        self.threshold.get_or_insert(default);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold.unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD)
    }

    pub fn escalation_node(&self) -> &str {
        &self.escalation_node
    }

    pub fn routes(&self) -> &[(RecommendedAction, String)] {
        &self.routes
    }

    /// Every node this policy can route to.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.escalation_node.as_str())
            .chain(self.routes.iter().map(|(_, n)| n.as_str()))
    }

    /// Whether `confidence` clears the threshold. NaN never does.
    pub fn is_confident(&self, confidence: f64) -> bool {
        confidence >= self.threshold()
    }

    /// Pick the node for a decision input.
    ///
    /// Missing input, low or NaN confidence, and confident actions without a
    /// mapped node all escalate.
    pub fn decide(&self, input: Option<DecisionInput>) -> &str {
        match input {
            Some((action, confidence)) if self.is_confident(confidence) => self
                .routes
                .iter()
                .find(|(a, _)| *a == action)
                .map(|(_, node)| node.as_str())
                .unwrap_or(self.escalation_node.as_str()),
            _ => self.escalation_node.as_str(),
        }
    }

    pub fn decide_result(&self, result: &ReasoningResult) -> &str {
        self.decide(Some((result.recommended_action, result.confidence)))
    }

    /// Routing rows from `from` for this policy, in evaluation order:
    /// escalation on low or missing confidence, one row per mapped action,
    /// then a catch-all escalation.
    pub fn edges<P: 'static>(&self, from: &str, extract: DecisionExtractor<P>) -> Vec<Edge<P>> {
        let threshold = self.threshold();
        let mut edges = Vec::with_capacity(self.routes.len() + 2);

        let low = extract.clone();
        edges.push(Edge::when(
            from,
            Target::node(&self.escalation_node),
            format!("confidence < {threshold}"),
            move |state: &P| match low(state) {
                Some((_, confidence)) => confidence.is_nan() || confidence < threshold,
                None => true,
            },
        ));

        for (action, node) in &self.routes {
            let action = *action;
            let extract = extract.clone();
            edges.push(Edge::when(
                from,
                Target::node(node),
                action.as_str().to_string(),
                move |state: &P| matches!(extract(state), Some((a, _)) if a == action),
            ));
        }

        edges.push(Edge::always(
            from,
            Target::node(&self.escalation_node),
            "unmapped action".to_string(),
        ));
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::routing::RoutingTable;

    fn policy() -> DecisionPolicy {
        DecisionPolicy::new("ambiguous_response")
            .with_threshold(0.7)
            .route(RecommendedAction::Appeal, "appeal")
            .route(RecommendedAction::ReviseAndResubmit, "revise")
            .route(RecommendedAction::FinalDenial, "final_denial")
    }

    #[test]
    fn test_low_confidence_escalates_regardless_of_action() {
        let p = policy();
        for action in RecommendedAction::ALL {
            assert_eq!(p.decide(Some((action, 0.4))), "ambiguous_response");
        }
    }

    #[test]
    fn test_high_confidence_follows_action() {
        let p = policy();
        assert_eq!(p.decide(Some((RecommendedAction::Appeal, 0.9))), "appeal");
        assert_eq!(
            p.decide(Some((RecommendedAction::FinalDenial, 0.9))),
            "final_denial"
        );
        // at the threshold counts as confident
        assert_eq!(
            p.decide(Some((RecommendedAction::ReviseAndResubmit, 0.7))),
            "revise"
        );
    }

    #[test]
    fn test_missing_or_nan_escalates() {
        let p = policy();
        assert_eq!(p.decide(None), "ambiguous_response");
        assert_eq!(
            p.decide(Some((RecommendedAction::Appeal, f64::NAN))),
            "ambiguous_response"
        );
    }

    #[test]
    fn test_unmapped_action_escalates() {
        let p = DecisionPolicy::new("review").route(RecommendedAction::Appeal, "appeal");
        assert_eq!(p.decide(Some((RecommendedAction::FinalDenial, 0.99))), "review");
    }

    #[test]
    fn test_threshold_resolution() {
        let p = DecisionPolicy::new("review");
        assert!((p.threshold() - DEFAULT_CONFIDENCE_THRESHOLD).abs() < f64::EPSILON);
        let p = p.resolve_threshold(0.85);
        assert!((p.threshold() - 0.85).abs() < f64::EPSILON);
        let p = p.with_threshold(0.5).resolve_threshold(0.85);
        assert!((p.threshold() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_edges_match_decide() {
        let p = policy();
        let extract: DecisionExtractor<Option<DecisionInput>> =
            Arc::new(|s: &Option<DecisionInput>| *s);
        let mut table = RoutingTable::new();
        for edge in p.edges("analyze", extract) {
            table.push(edge);
        }

        let cases = [
            None,
            Some((RecommendedAction::Appeal, 0.4)),
            Some((RecommendedAction::Appeal, 0.9)),
            Some((RecommendedAction::ReviseAndResubmit, 0.75)),
            Some((RecommendedAction::FinalDenial, 0.69)),
            Some((RecommendedAction::FinalDenial, f64::NAN)),
        ];
        for input in cases {
            let routed = table.route("analyze", &input).unwrap();
            assert_eq!(routed, Target::node(p.decide(input)), "input {input:?}");
        }
    }
}
