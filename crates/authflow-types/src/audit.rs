//! Protected-data access audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum length of a justification for touching protected data.
pub const MIN_JUSTIFICATION_LEN: usize = 10;

/// Declares that a tool call touches protected personal or health data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiAccess {
    pub actor_id: String,
    /// Kind of record being read or written (e.g. "patient").
    pub resource_type: String,
    pub resource_id: String,
    pub justification: String,
}

impl PhiAccess {
    pub fn new(
        actor_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            justification: justification.into(),
        }
    }

    /// Whether the justification is long enough to be recorded.
    pub fn is_justified(&self) -> bool {
        self.justification.trim().chars().count() >= MIN_JUSTIFICATION_LEN
    }
}

/// One row handed to the audit collaborator before a protected call runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub actor_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub justification: String,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn for_access(access: &PhiAccess, tool_name: impl Into<String>) -> Self {
        Self {
            actor_id: access.actor_id.clone(),
            resource_type: access.resource_type.clone(),
            resource_id: access.resource_id.clone(),
            justification: access.justification.clone(),
            tool_name: tool_name.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_justification_threshold() {
        let short = PhiAccess::new("agent", "patient", "P-1", "   needed  ");
        assert!(!short.is_justified());
        let ok = PhiAccess::new("agent", "patient", "P-1", "chart review");
        assert!(ok.is_justified());
    }

    #[test]
    fn test_record_copies_access() {
        let access = PhiAccess::new("agent", "patient", "P-1", "gather lab results");
        let record = AuditRecord::for_access(&access, "search_documents");
        assert_eq!(record.resource_id, "P-1");
        assert_eq!(record.tool_name, "search_documents");
        assert_eq!(record.justification, "gather lab results");
    }
}
