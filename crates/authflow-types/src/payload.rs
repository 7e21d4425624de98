//! State payloads carried between workflow nodes.
//!
//! The engine is generic over any `WorkflowState`. `StagePayload` is the
//! prior-authorization shape: one variant per stage, each with a fixed set of
//! fields, validated every time it crosses a node boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decision::ReasoningResult;

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// A state payload the executor can checkpoint and hand to node handlers.
pub trait WorkflowState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Structural checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Short label for logs.
    fn stage(&self) -> &'static str {
        "state"
    }
}

impl WorkflowState for Value {}

// ---------------------------------------------------------------------------
// Stage shapes
// ---------------------------------------------------------------------------

/// The request as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeData {
    pub intake_id: String,
    pub patient_id: String,
    pub payer_id: String,
    /// Procedure or medication code being authorized.
    pub service_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis_code: Option<String>,
}

/// Coverage determination for the requested service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageData {
    pub intake: IntakeData,
    pub covered: bool,
    pub pa_required: bool,
}

/// A document or data item the payer requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
}

/// One gathered requirement, as produced by a gather child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatheredItem {
    pub name: String,
    pub content: Value,
}

/// Requirement discovery and gathering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementsData {
    pub intake: IntakeData,
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub gathered: Vec<GatheredItem>,
    /// Non-optional requirements that could not be gathered.
    #[serde(default)]
    pub gaps: Vec<String>,
}

impl RequirementsData {
    /// Fold per-requirement results (declaration order) into `gathered` and `gaps`.
    ///
    /// `results[i]` belongs to `requirements[i]`; `None` means the item could
    /// not be gathered. Missing optional items are dropped without a gap.
    pub fn apply_gathered(&mut self, results: Vec<Option<GatheredItem>>) {
        self.gathered.clear();
        self.gaps.clear();
        for (requirement, result) in self.requirements.iter().zip(results) {
            match result {
                Some(item) => self.gathered.push(item),
                None if !requirement.optional => self.gaps.push(requirement.name.clone()),
                None => {}
            }
        }
    }
}

/// Payload of a single requirement-gathering child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherItemData {
    pub intake_id: String,
    pub requirement: Requirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GatheredItem>,
}

/// The request was submitted to the payer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedData {
    pub intake: IntakeData,
    pub submission_id: String,
    #[serde(default)]
    pub gaps: Vec<String>,
    /// Last status reported by the payer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_status: Option<String>,
}

/// The payer denied the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeniedData {
    pub intake: IntakeData,
    pub submission_id: String,
    pub denial_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ReasoningResult>,
}

/// Final disposition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    NotRequired,
    Approved,
    Appealed,
    Resubmitted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedData {
    pub intake: IntakeData,
    pub disposition: Disposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// StagePayload
// ---------------------------------------------------------------------------

/// Prior-authorization state, one variant per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    Intake(IntakeData),
    Coverage(CoverageData),
    Requirements(RequirementsData),
    GatherItem(GatherItemData),
    Submitted(SubmittedData),
    Denied(DeniedData),
    Resolved(ResolvedData),
}

impl StagePayload {
    /// The intake id every stage traces back to.
    pub fn intake_id(&self) -> &str {
        match self {
            StagePayload::Intake(d) => &d.intake_id,
            StagePayload::Coverage(d) => &d.intake.intake_id,
            StagePayload::Requirements(d) => &d.intake.intake_id,
            StagePayload::GatherItem(d) => &d.intake_id,
            StagePayload::Submitted(d) => &d.intake.intake_id,
            StagePayload::Denied(d) => &d.intake.intake_id,
            StagePayload::Resolved(d) => &d.intake.intake_id,
        }
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} must not be blank"));
    }
    Ok(())
}

fn validate_intake(intake: &IntakeData) -> Result<(), String> {
    require_non_blank("intake_id", &intake.intake_id)?;
    require_non_blank("patient_id", &intake.patient_id)?;
    require_non_blank("payer_id", &intake.payer_id)?;
    require_non_blank("service_code", &intake.service_code)
}

impl WorkflowState for StagePayload {
    fn validate(&self) -> Result<(), String> {
        match self {
            StagePayload::Intake(d) => validate_intake(d),
            StagePayload::Coverage(d) => validate_intake(&d.intake),
            StagePayload::Requirements(d) => {
                validate_intake(&d.intake)?;
                for gap in &d.gaps {
                    if !d.requirements.iter().any(|r| &r.name == gap) {
                        return Err(format!("gap '{gap}' is not a known requirement"));
                    }
                }
                Ok(())
            }
            StagePayload::GatherItem(d) => {
                require_non_blank("intake_id", &d.intake_id)?;
                require_non_blank("requirement.name", &d.requirement.name)
            }
            StagePayload::Submitted(d) => {
                validate_intake(&d.intake)?;
                require_non_blank("submission_id", &d.submission_id)
            }
            StagePayload::Denied(d) => {
                validate_intake(&d.intake)?;
                require_non_blank("submission_id", &d.submission_id)?;
                if let Some(analysis) = &d.analysis {
                    if !(0.0..=1.0).contains(&analysis.confidence) {
                        return Err(format!(
                            "analysis confidence {} is outside [0, 1]",
                            analysis.confidence
                        ));
                    }
                }
                Ok(())
            }
            StagePayload::Resolved(d) => validate_intake(&d.intake),
        }
    }

    fn stage(&self) -> &'static str {
        match self {
            StagePayload::Intake(_) => "intake",
            StagePayload::Coverage(_) => "coverage",
            StagePayload::Requirements(_) => "requirements",
            StagePayload::GatherItem(_) => "gather_item",
            StagePayload::Submitted(_) => "submitted",
            StagePayload::Denied(_) => "denied",
            StagePayload::Resolved(_) => "resolved",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
