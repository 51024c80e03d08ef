//! Rule-engine invocation
//!
//! Wraps the external `nft` binary:
//!
//! - `list ruleset` reads live state
//! - `--check -f -` validates text from stdin without touching live state
//! - `-f -` applies text from stdin, through the elevation wrapper
//!
//! A non-zero exit is an ordinary [`ApplyOutcome`] with `ok == false`. Only a
//! failure to start the process (or a timeout) is an `Err`.
//!
//! In [`ApplyMode::Simulated`] nothing is spawned and every call reports a
//! fixed simulated success.

use crate::core::error::{Error, Result};
use crate::elevation::{self, ElevationMethod};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub const SIMULATED_APPLY_MESSAGE: &str = "Simulation mode: deploy simulated (no changes).";
pub const SIMULATED_CHECK_MESSAGE: &str = "Simulated nft output (simulation mode).";
pub const SIMULATED_LIST_MESSAGE: &str = "Simulated list ruleset (simulation mode).";

/// Whether the applier talks to the real rule engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    #[default]
    Live,
    Simulated,
}

/// Result of a dry-run or apply that actually ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub ok: bool,
    /// stdout on success, stderr on failure
    pub output: String,
    pub exit_code: Option<i32>,
}

impl ApplyOutcome {
    fn simulated(message: &str) -> Self {
        Self {
            ok: true,
            output: message.to_string(),
            exit_code: Some(0),
        }
    }

    /// Cleaned-up diagnostic lines from the tool's output
    pub fn diagnostics(&self) -> Vec<String> {
        parse_nft_errors(&self.output)
    }

    /// Output, or a placeholder naming the exit status when the tool printed nothing
    pub fn detail(&self) -> String {
        let trimmed = self.output.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
        match self.exit_code {
            Some(code) => format!("rule engine exited with status {code}"),
            None => "rule engine terminated by signal".to_string(),
        }
    }
}

/// Invokes the rule engine for validation and application
#[derive(Debug, Clone)]
pub struct RulesetApplier {
    nft_binary: PathBuf,
    mode: ApplyMode,
    elevation: Option<ElevationMethod>,
    timeout: Option<Duration>,
}

impl RulesetApplier {
    /// `elevation: None` resolves the wrapper at apply time (see [`crate::elevation`]).
    pub fn new(
        nft_binary: impl Into<PathBuf>,
        mode: ApplyMode,
        elevation: Option<ElevationMethod>,
    ) -> Self {
        Self {
            nft_binary: nft_binary.into(),
            mode,
            elevation,
            timeout: None,
        }
    }

    /// Applier that never spawns anything
    pub fn simulated() -> Self {
        Self::new("nft", ApplyMode::Simulated, None)
    }

    /// Bounds every external call; `None` waits indefinitely
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(&self) -> ApplyMode {
        self.mode
    }

    pub fn is_simulated(&self) -> bool {
        self.mode == ApplyMode::Simulated
    }

    pub fn nft_binary(&self) -> &Path {
        &self.nft_binary
    }

    /// Reads the live ruleset (`nft list ruleset`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Nftables` on non-zero exit, `Error::Launch` if nft
    /// cannot be started.
    pub async fn list_ruleset(&self) -> Result<String> {
        if self.is_simulated() {
            return Ok(SIMULATED_LIST_MESSAGE.to_string());
        }

        let mut cmd = Command::new(&self.nft_binary);
        cmd.args(["list", "ruleset"]);
        let outcome = self.run(cmd, None, self.timeout).await?;

        if outcome.ok {
            Ok(outcome.output)
        } else {
            let detail = outcome.detail();
            Err(Error::Nftables {
                message: detail.clone(),
                stderr: Some(outcome.output),
                exit_code: outcome.exit_code,
            })
        }
    }

    /// Validates ruleset text without privileges and without changing live state.
    ///
    /// # Errors
    ///
    /// Returns `Err` only if nft cannot be launched or times out.
    pub async fn dry_run(&self, ruleset: &str) -> Result<ApplyOutcome> {
        if self.is_simulated() {
            return Ok(ApplyOutcome::simulated(SIMULATED_CHECK_MESSAGE));
        }

        info!("Dry-running ruleset via nft --check");
        let mut cmd = Command::new(&self.nft_binary);
        cmd.args(["--check", "-f", "-"]);
        let outcome = self.run(cmd, Some(ruleset), self.timeout).await?;

        if outcome.ok {
            info!("Dry-run passed");
        } else {
            warn!("Dry-run rejected ruleset: {}", outcome.detail());
        }
        Ok(outcome)
    }

    /// Applies ruleset text to live firewall state, elevated.
    ///
    /// Callers must have a passing dry-run for the same text first; the
    /// orchestrator enforces that.
    ///
    /// # Errors
    ///
    /// Returns `Err` if elevation is unavailable, nft cannot be launched, or
    /// the call times out.
    pub async fn apply(&self, ruleset: &str) -> Result<ApplyOutcome> {
        if self.is_simulated() {
            info!("Simulation mode: skipping apply");
            return Ok(ApplyOutcome::simulated(SIMULATED_APPLY_MESSAGE));
        }

        let method = elevation::resolve_method(self.elevation)?;
        info!("Applying ruleset via nft -f - ({method})");
        let cmd = elevation::create_elevated_command(&self.nft_binary, &["-f", "-"], Some(method))?;
        let outcome = self.run(cmd, Some(ruleset), self.apply_timeout(method)).await?;

        if outcome.ok {
            info!("Apply successful");
        } else {
            error!("Apply failed: {}", outcome.detail());
        }
        Ok(outcome)
    }

    /// The wrapper may prompt for authentication, so only direct applies are timed
    fn apply_timeout(&self, method: ElevationMethod) -> Option<Duration> {
        match method.wrapper() {
            Some(_) => None,
            None => self.timeout,
        }
    }

    async fn run(
        &self,
        mut cmd: Command,
        input: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ApplyOutcome> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        debug!("Spawning {program}");

        let mut child = cmd
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                error!("Failed to spawn {program}: {source}");
                Error::Launch {
                    program: program.clone(),
                    source,
                }
            })?;

        let interaction = async {
            if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
                match stdin.write_all(text.as_bytes()).await {
                    Ok(()) => {}
                    // The tool stopped reading early; its exit status tells the story
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!("{program} closed stdin early");
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
                // stdin dropped here so the tool sees EOF
            }
            child.wait_with_output().await.map_err(Error::Io)
        };

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, interaction)
                .await
                .map_err(|_| {
                    error!("{program} timed out after {}s", limit.as_secs());
                    Error::Timeout {
                        secs: limit.as_secs(),
                    }
                })??,
            None => interaction.await?,
        };

        let ok = output.status.success();
        let text = if ok {
            String::from_utf8_lossy(&output.stdout).into_owned()
        } else {
            String::from_utf8_lossy(&output.stderr).into_owned()
        };

        Ok(ApplyOutcome {
            ok,
            output: text,
            exit_code: output.status.code(),
        })
    }
}

/// Parses nft error output into user-friendly lines
///
/// Strips the `Error: ` / `nft: ` prefixes nft puts on each diagnostic.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{
        MOCK_APPLY_FAIL, MOCK_SLOW, MOCK_SYNTAX_ERROR, mock_applier, mock_nft_path,
    };

    #[test]
    fn test_parse_nft_errors_plain_text() {
        let stderr = "Error: syntax error, unexpected $end\nError: invalid expression\n";
        let errors = parse_nft_errors(stderr);

        assert_eq!(errors, ["syntax error, unexpected $end", "invalid expression"]);
    }

    #[test]
    fn test_parse_nft_errors_empty() {
        assert!(parse_nft_errors("").is_empty());
        assert!(parse_nft_errors("\n  \n").is_empty());
    }

    #[test]
    fn test_parse_nft_errors_with_nft_prefix() {
        assert_eq!(parse_nft_errors("nft: syntax error\n"), ["syntax error"]);
    }

    #[test]
    fn test_outcome_detail_placeholder() {
        let outcome = ApplyOutcome {
            ok: false,
            output: "  ".into(),
            exit_code: Some(3),
        };
        assert_eq!(outcome.detail(), "rule engine exited with status 3");
    }

    #[tokio::test]
    async fn test_simulated_apply_never_spawns() {
        // A binary that cannot exist proves nothing is launched
        let applier = RulesetApplier::new(
            "/nonexistent/fpe-nft",
            ApplyMode::Simulated,
            Some(ElevationMethod::Sudo),
        );

        let outcome = applier.apply("policy drop;").await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.output, SIMULATED_APPLY_MESSAGE);

        let check = applier.dry_run("anything").await.unwrap();
        assert!(check.ok);
        assert_eq!(applier.list_ruleset().await.unwrap(), SIMULATED_LIST_MESSAGE);
    }

    #[tokio::test]
    async fn test_dry_run_success_returns_stdout() {
        let applier = mock_applier();
        let outcome = applier.dry_run("table inet filter {}").await.unwrap();
        assert!(outcome.ok, "{}", outcome.output);
        assert!(outcome.output.contains("check ok"));
    }

    #[tokio::test]
    async fn test_dry_run_failure_is_not_an_error() {
        let applier = mock_applier();
        let outcome = applier
            .dry_run(&format!("table inet filter {{ {MOCK_SYNTAX_ERROR} }}"))
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.diagnostics().iter().any(|l| l.starts_with("syntax error")));
    }

    #[tokio::test]
    async fn test_apply_failure_after_passing_check() {
        let applier = mock_applier();
        let text = format!("table inet filter {{}} # {MOCK_APPLY_FAIL}");

        assert!(applier.dry_run(&text).await.unwrap().ok);
        let outcome = applier.apply(&text).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.output.contains("Operation not permitted"));
    }

    #[tokio::test]
    async fn test_list_ruleset_reads_stdout() {
        let live = mock_applier().list_ruleset().await.unwrap();
        assert!(live.contains("table inet filter"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let applier = RulesetApplier::new(
            "/nonexistent/fpe-nft",
            ApplyMode::Live,
            Some(ElevationMethod::Direct),
        );
        let result = applier.dry_run("table inet filter {}").await;
        assert!(matches!(result, Err(Error::Launch { .. })));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let applier =
            RulesetApplier::new(mock_nft_path(), ApplyMode::Live, Some(ElevationMethod::Direct))
                .with_timeout(Some(Duration::from_millis(200)));
        let result = applier.dry_run(MOCK_SLOW).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_direct_apply_is_timed() {
        let applier =
            RulesetApplier::new(mock_nft_path(), ApplyMode::Live, Some(ElevationMethod::Direct))
                .with_timeout(Some(Duration::from_millis(200)));
        let result = applier.apply(MOCK_SLOW).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[test]
    fn test_elevated_apply_waits_for_authentication() {
        let applier = mock_applier().with_timeout(Some(Duration::from_secs(30)));

        assert_eq!(
            applier.apply_timeout(ElevationMethod::Direct),
            Some(Duration::from_secs(30))
        );
        for method in [
            ElevationMethod::Sudo,
            ElevationMethod::Run0,
            ElevationMethod::Pkexec,
        ] {
            assert_eq!(applier.apply_timeout(method), None, "{method}");
        }
    }
}
