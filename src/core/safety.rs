//! Lockout safety heuristics
//!
//! Decides whether a ruleset is likely to cut off administrative (SSH) access
//! once applied. This is a small ordered set of case-insensitive substring
//! checks, not a rule-engine simulation: negation, comments and line
//! continuations are not understood. When unsure it warns.
//!
//! Checks, in order:
//!
//! 1. No `policy drop` / `policy deny` anywhere: safe.
//! 2. An explicit accept for the admin port in one of the phrasings of
//!    [`AdminAllowPhrasing`]: safe.
//! 3. `ct state established,related accept`: safe.
//! 4. Otherwise: warn about possible lockout.

use serde::{Deserialize, Serialize};

/// Port checked by [`analyze`]
pub const DEFAULT_ADMIN_PORT: u16 = 22;

const DENY_POLICY_TOKENS: [&str; 2] = ["policy drop", "policy deny"];
const ESTABLISHED_ACCEPT: &str = "ct state established,related accept";

/// Which admin-port phrasing matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminAllowPhrasing {
    /// `tcp dport 22 accept`
    DirectAccept,
    /// `tcp dport 22 ct state established,related accept`
    StatefulAccept,
    /// `tcp dport ssh accept`
    ServiceName,
    /// `tcp dport 22` and `accept` both present somewhere
    PortWithAccept,
}

/// The rule that decided the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyFinding {
    NoDenyPolicy,
    AdminPortAccept(AdminAllowPhrasing),
    EstablishedAccept,
    LockoutRisk,
}

/// Result of safety analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    pub reason: String,
    pub finding: SafetyFinding,
}

impl SafetyVerdict {
    fn pass(finding: SafetyFinding, reason: String) -> Self {
        Self {
            safe: true,
            reason,
            finding,
        }
    }

    /// "PASS" or "WARN", for operator-facing summaries
    pub fn label(&self) -> &'static str {
        if self.safe { "PASS" } else { "WARN" }
    }
}

/// Heuristic lockout checker for one administrative port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyAnalyzer {
    admin_port: u16,
}

impl Default for SafetyAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_ADMIN_PORT)
    }
}

impl SafetyAnalyzer {
    pub fn new(admin_port: u16) -> Self {
        Self { admin_port }
    }

    pub fn admin_port(&self) -> u16 {
        self.admin_port
    }

    fn port_label(&self) -> String {
        if self.admin_port == DEFAULT_ADMIN_PORT {
            format!("SSH port {}", self.admin_port)
        } else {
            format!("admin port {}", self.admin_port)
        }
    }

    /// Analyzes ruleset text. Pure; never touches the system.
    pub fn analyze(&self, ruleset: &str) -> SafetyVerdict {
        let lowered = ruleset.to_lowercase();

        if !DENY_POLICY_TOKENS.iter().any(|t| lowered.contains(t)) {
            return SafetyVerdict::pass(
                SafetyFinding::NoDenyPolicy,
                "No global drop/deny policy detected; likely safe.".to_string(),
            );
        }

        if let Some((phrasing, matched)) = self.find_admin_accept(&lowered) {
            return SafetyVerdict::pass(
                SafetyFinding::AdminPortAccept(phrasing),
                format!(
                    "Found explicit accept for {} (`{matched}`).",
                    self.port_label()
                ),
            );
        }

        if lowered.contains(ESTABLISHED_ACCEPT) {
            return SafetyVerdict::pass(
                SafetyFinding::EstablishedAccept,
                format!(
                    "Has '{ESTABLISHED_ACCEPT}'; established connections stay allowed."
                ),
            );
        }

        SafetyVerdict {
            safe: false,
            reason: format!(
                "Global drop/deny policy present and no explicit accept for {} detected. \
                 This may lock you out.",
                self.port_label()
            ),
            finding: SafetyFinding::LockoutRisk,
        }
    }

    fn find_admin_accept(&self, lowered: &str) -> Option<(AdminAllowPhrasing, String)> {
        let port = self.admin_port;

        let direct = format!("tcp dport {port} accept");
        if lowered.contains(&direct) {
            return Some((AdminAllowPhrasing::DirectAccept, direct));
        }

        let stateful = format!("tcp dport {port} {ESTABLISHED_ACCEPT}");
        if lowered.contains(&stateful) {
            return Some((AdminAllowPhrasing::StatefulAccept, stateful));
        }

        if port == DEFAULT_ADMIN_PORT {
            let service = "tcp dport ssh accept";
            if lowered.contains(service) {
                return Some((AdminAllowPhrasing::ServiceName, service.to_string()));
            }
        }

        let port_match = format!("tcp dport {port}");
        if contains_port_token(lowered, &port_match) && lowered.contains("accept") {
            return Some((AdminAllowPhrasing::PortWithAccept, port_match));
        }

        None
    }
}

/// True if `needle` occurs and is not immediately followed by another digit,
/// so `tcp dport 22` never matches inside `tcp dport 2222`.
fn contains_port_token(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(idx, _)| {
        !haystack[idx + needle.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// Analyzes `ruleset` for the default SSH port.
pub fn analyze(ruleset: &str) -> SafetyVerdict {
    SafetyAnalyzer::default().analyze(ruleset)
}
