//! Structured reasoning output consumed by decision points.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Closed set of actions a denial analysis can recommend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    Appeal,
    ReviseAndResubmit,
    FinalDenial,
}

impl RecommendedAction {
    pub const ALL: [RecommendedAction; 3] = [
        RecommendedAction::Appeal,
        RecommendedAction::ReviseAndResubmit,
        RecommendedAction::FinalDenial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::Appeal => "APPEAL",
            RecommendedAction::ReviseAndResubmit => "REVISE_AND_RESUBMIT",
            RecommendedAction::FinalDenial => "FINAL_DENIAL",
        }
    }
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of a reasoning step at a decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReasoningResult {
    pub recommended_action: RecommendedAction,
    /// Confidence in `recommended_action`, in `[0, 1]`.
    pub confidence: f64,
    pub justification: String,
    #[serde(default)]
    pub supporting_evidence: Vec<String>,
}
