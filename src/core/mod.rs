//! Deployment pipeline core
//!
//! - [`safety`]: lockout heuristics over ruleset text
//! - [`applier`]: dry-run and apply through the `nft` binary
//! - [`store`]: versioned policy history and audit trail (`SQLite`)
//! - [`orchestrator`]: the confirm-gated deploy flow tying the above together
//! - [`policy`]: policy records, snapshot naming, checksums and diffs
//! - [`error`]: error types shared by all of the above

pub mod applier;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod safety;
pub mod store;

#[cfg(test)]
pub mod test_helpers;
