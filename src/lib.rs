//! FPE - Firewall Policy Engine
//!
//! Guarded deployment of nftables rulesets: every change is checked for
//! lockout risk, dry-run by the rule engine, confirmed by the operator and
//! recorded in a local policy history before and after it touches the host.
//!
//! # Architecture
//!
//! - [`core`] - Safety analysis, rule-engine invocation, storage and the deploy pipeline
//! - [`audit`] - Audit trail records and export
//! - [`elevation`] - Privilege elevation for the apply step
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Lockout heuristics before anything reaches the rule engine
//! - Dry-run with `nft --check` on every deployment attempt
//! - Explicit operator confirmation before apply
//! - One apply in flight at a time
//! - SHA-256 checksums on stored policies

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::applier::{ApplyMode, ApplyOutcome, RulesetApplier};
pub use core::error::{Error, Result};
pub use core::orchestrator::{Confirmer, DeployStage, DeploymentOrchestrator, Proposal};
pub use core::safety::{SafetyAnalyzer, SafetyVerdict};
pub use core::store::PolicyStore;
