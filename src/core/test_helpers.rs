//! Shared test utilities for core module tests
//!
//! Provides a mock `nft` script and ready-made components so no test touches
//! real nftables or requires elevation. This module is only compiled in test mode.

use crate::core::applier::{ApplyMode, RulesetApplier};
use crate::core::orchestrator::DeploymentOrchestrator;
use crate::core::safety::SafetyAnalyzer;
use crate::core::store::PolicyStore;
use crate::elevation::ElevationMethod;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("FPE_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FPE_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Ruleset marker: mock nft rejects the text in both check and apply
pub const MOCK_SYNTAX_ERROR: &str = "MOCK_SYNTAX_ERROR";

/// Ruleset marker: mock nft passes `--check` but fails the real apply
pub const MOCK_APPLY_FAIL: &str = "MOCK_APPLY_FAIL";

/// Ruleset marker: mock nft sleeps for five seconds
pub const MOCK_SLOW: &str = "MOCK_SLOW";

const MOCK_NFT_SCRIPT: &str = r#"#!/bin/sh
# Mock nft for tests: behaviour is driven by markers in the ruleset text
if [ "$1" = "list" ] && [ "$2" = "ruleset" ]; then
    printf 'table inet filter {\n\tchain input {\n\t\ttype filter hook input priority 0; policy accept;\n\t}\n}\n'
    exit 0
fi
check=0
if [ "$1" = "--check" ]; then
    check=1
    shift
fi
if [ "$1" != "-f" ] || [ "$2" != "-" ]; then
    echo "Error: unsupported arguments: $*" >&2
    exit 2
fi
input=$(cat)
case "$input" in
    *MOCK_SLOW*) sleep 5 ;;
esac
case "$input" in
    *MOCK_SYNTAX_ERROR*)
        echo "Error: syntax error, unexpected junk" >&2
        echo "nft: could not process rule" >&2
        exit 1
        ;;
esac
if [ "$check" = 1 ]; then
    echo "check ok"
    exit 0
fi
case "$input" in
    *MOCK_APPLY_FAIL*)
        echo "Error: Could not process rule: Operation not permitted" >&2
        exit 1
        ;;
esac
echo "apply ok"
exit 0
"#;

static MOCK_NFT: OnceLock<PathBuf> = OnceLock::new();

/// Path to the mock nft script, written once per test process.
pub fn mock_nft_path() -> PathBuf {
    MOCK_NFT
        .get_or_init(|| {
            use std::os::unix::fs::PermissionsExt;

            let dir = std::env::temp_dir().join(format!("fpe-mock-nft-{}", std::process::id()));
            std::fs::create_dir_all(&dir).expect("create mock nft dir");
            let path = dir.join("nft");
            std::fs::write(&path, MOCK_NFT_SCRIPT).expect("write mock nft");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod mock nft");
            path
        })
        .clone()
}

/// Live-mode applier pointed at the mock script, never elevating
pub fn mock_applier() -> RulesetApplier {
    RulesetApplier::new(mock_nft_path(), ApplyMode::Live, Some(ElevationMethod::Direct))
}

/// Fresh in-memory store
pub fn memory_store() -> Arc<PolicyStore> {
    Arc::new(PolicyStore::open_in_memory().expect("open in-memory store"))
}

/// Orchestrator wired to the mock applier and a fresh in-memory store
pub fn mock_orchestrator() -> DeploymentOrchestrator {
    DeploymentOrchestrator::new(mock_applier(), SafetyAnalyzer::default(), memory_store())
}

/// A deny-by-default ruleset that keeps SSH reachable
pub const SAFE_RULESET: &str = "\
table inet filter {
  chain input {
    type filter hook input priority 0;
    policy drop;
    iif lo accept
    tcp dport 22 accept
  }
}
";

/// A deny-by-default ruleset with no way back in
pub const LOCKOUT_RULESET: &str = "\
table inet filter {
  chain input {
    type filter hook input priority 0;
    policy drop;
    iif lo accept
  }
}
";
