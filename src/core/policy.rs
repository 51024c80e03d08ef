//! Policy snapshots
//!
//! A policy is an immutable, named copy of ruleset text. Edits never update a
//! policy in place; they produce a new one with a new id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Surrogate key assigned by the store, never reused
pub type PolicyId = i64;

/// A stored ruleset version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub content: String,
    /// SHA-256 of `content`, taken at insertion
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Listing row (no content)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub id: PolicyId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Why a snapshot was taken; decides its generated name
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SnapshotKind {
    #[strum(serialize = "policy")]
    Manual,
    #[strum(serialize = "sim")]
    Simulation,
    Deployed,
}

/// Generates `<kind>-YYYYmmdd-HHMMSS` (UTC)
pub fn snapshot_name(kind: SnapshotKind, at: DateTime<Utc>) -> String {
    format!("{kind}-{}", at.format("%Y%m%d-%H%M%S"))
}

/// Computes the hex SHA-256 checksum of ruleset text.
pub fn compute_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Renders a unified-style line diff between two ruleset versions.
///
/// Returns `None` when the texts are identical.
pub fn render_diff(old_text: &str, new_text: &str) -> Option<String> {
    use std::fmt::Write;

    if old_text == new_text {
        return None;
    }

    let diff = similar::TextDiff::from_lines(old_text, new_text);
    let mut result = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
        if change.missing_newline() {
            result.push('\n');
        }
    }

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_names() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(snapshot_name(SnapshotKind::Deployed, at), "deployed-20240309-070501");
        assert_eq!(snapshot_name(SnapshotKind::Simulation, at), "sim-20240309-070501");
        assert_eq!(snapshot_name(SnapshotKind::Manual, at), "policy-20240309-070501");
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let sum = compute_checksum("table inet filter {}");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, compute_checksum("table inet filter {}"));
        assert_ne!(sum, compute_checksum("table inet filter { }"));
    }

    #[test]
    fn test_render_diff_marks_changes() {
        let old = "policy drop;\ntcp dport 22 accept\n";
        let new = "policy drop;\ntcp dport 2222 accept\n";
        let diff = render_diff(old, new).unwrap();

        assert!(diff.contains("  policy drop;"));
        assert!(diff.contains("- tcp dport 22 accept"));
        assert!(diff.contains("+ tcp dport 2222 accept"));
    }

    #[test]
    fn test_render_diff_identical_is_none() {
        assert!(render_diff("a\n", "a\n").is_none());
    }

    #[test]
    fn test_render_diff_without_trailing_newline() {
        let diff = render_diff("a", "b").unwrap();
        assert_eq!(diff, "- a\n+ b\n");
    }
}
