//! Audit trail vocabulary and export
//!
//! Every state-changing pipeline action is recorded as one [`AuditEntry`] in
//! the policy store. This module defines the fixed action vocabulary and the
//! JSON-lines export format used by `fpe audit --json`.

use crate::core::policy::PolicyId;
use crate::utils::truncate_string;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Width of the detail column in [`AuditEntry::summary_line`]
const SUMMARY_DETAIL_LEN: usize = 100;

/// Types of auditable actions
///
/// Stored as their `snake_case` name; the set may grow but each entry is
/// always exactly one of these symbols.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    Save,
    Simulate,
    Deploy,
    DeployFailed,
    Delete,
}

/// A single audit trail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,

    pub action: AuditAction,

    /// Non-owning reference; survives deletion of the policy it names
    pub policy_id: Option<PolicyId>,

    pub detail: String,

    /// When the entry was recorded (UTC)
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// One-line rendering for terminal listings
    pub fn summary_line(&self) -> String {
        let policy = self
            .policy_id
            .map_or_else(|| "-".to_string(), |id| format!("#{id}"));
        format!(
            "[{}] {:<13} {:>6}  {}",
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.action,
            policy,
            truncate_string(self.detail.lines().next().unwrap_or_default(), SUMMARY_DETAIL_LEN)
        )
    }
}

/// Writes entries as JSON lines (one JSON object per line)
///
/// # Errors
///
/// Returns `Err` if serialization or the underlying writer fails
pub fn write_jsonl<W: Write>(entries: &[AuditEntry], mut out: W) -> std::io::Result<()> {
    for entry in entries {
        serde_json::to_writer(&mut out, entry)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn entry(action: AuditAction, policy_id: Option<PolicyId>) -> AuditEntry {
        AuditEntry {
            id: 7,
            action,
            policy_id,
            detail: "Deployed via CLI".to_string(),
            created_at: "2024-01-01T12:30:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn test_action_names_are_snake_case() {
        assert_eq!(AuditAction::DeployFailed.to_string(), "deploy_failed");
        assert_eq!(
            "deploy_failed".parse::<AuditAction>().unwrap(),
            AuditAction::DeployFailed
        );
        assert!("deploy failed".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_every_action_round_trips_through_its_name() {
        for action in AuditAction::iter() {
            assert_eq!(action.as_ref().parse::<AuditAction>().unwrap(), action);
        }
    }

    #[test]
    fn test_summary_line_without_policy() {
        let line = entry(AuditAction::DeployFailed, None).summary_line();
        assert!(line.starts_with("[2024-01-01 12:30:00] deploy_failed"));
        assert!(line.contains(" - "));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&entry(AuditAction::Deploy, Some(3))).unwrap();
        assert!(json.contains("\"action\":\"deploy\""));
        assert!(json.contains("\"policy_id\":3"));
    }

    #[test]
    fn test_jsonl_export_one_object_per_line() {
        let entries = vec![
            entry(AuditAction::Save, Some(1)),
            entry(AuditAction::DeployFailed, None),
        ];
        let mut buf = Vec::new();
        write_jsonl(&entries, &mut buf).unwrap();

        let text = String::from_utf8(buf).unwrap();
        let parsed: Vec<AuditEntry> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed, entries);
    }
}
