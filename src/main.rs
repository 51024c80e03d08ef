//! FPE - Firewall Policy Engine
//!
//! Command-line front end for guarded nftables deployments.
//!
//! # Usage
//!
//! ```bash
//! fpe check rules.nft               # Safety heuristics only
//! fpe dry-run rules.nft             # Ask nft to validate (nft --check)
//! fpe simulate rules.nft            # Safety + dry-run, recorded in history
//! fpe deploy rules.nft              # Full pipeline with confirmations
//! fpe deploy --policy 12            # Re-deploy a stored version
//! fpe list                          # Policy history, newest first
//! fpe audit --json > audit.jsonl    # Export the audit trail
//! fpe --demo deploy rules.nft       # Simulation mode, nothing is applied
//! ```

use clap::{Parser, Subcommand};
use fpe::audit;
use fpe::config::{self, AppConfig};
use fpe::core::error::{Error, NftablesErrorPattern};
use fpe::core::orchestrator::{Confirmer, DeploymentOrchestrator, Proposal};
use fpe::core::policy::{PolicyId, render_diff};
use fpe::core::safety::SafetyVerdict;
use fpe::core::store::PolicyStore;
use fpe::utils;
use std::io::Write;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fpe", version)]
#[command(about = "Firewall Policy Engine - guarded nftables deployments", long_about = None)]
struct Cli {
    /// Simulation mode: never run the rule engine
    #[arg(long, global = true)]
    demo: bool,
    /// Policy database file
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    /// nft binary to invoke
    #[arg(long, global = true, value_name = "PATH")]
    nft: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored policy versions, newest first
    List {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print one stored policy and its audit entries
    Show { id: PolicyId },
    /// Store a ruleset as a new version
    Save {
        /// Ruleset file, `-` for stdin
        file: PathBuf,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Delete a stored version (its audit entries are kept)
    Delete { id: PolicyId },
    /// Show the audit trail, newest first
    Audit {
        #[arg(short, long)]
        limit: Option<usize>,
        /// Only entries about this policy
        #[arg(short, long)]
        policy: Option<PolicyId>,
        /// Export as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Run the lockout heuristics on a ruleset
    Check { file: PathBuf },
    /// Validate a ruleset with the rule engine without applying it
    DryRun { file: PathBuf },
    /// Safety check and dry-run, recorded in history
    Simulate { file: PathBuf },
    /// Check, dry-run, confirm and apply a ruleset
    Deploy {
        /// Ruleset file, `-` for stdin
        #[arg(required_unless_present = "policy", conflicts_with = "policy")]
        file: Option<PathBuf>,
        /// Re-deploy a stored version
        #[arg(short, long)]
        policy: Option<PolicyId>,
        /// Apply without asking for confirmation
        #[arg(short, long)]
        yes: bool,
        /// Override a lockout warning without asking
        #[arg(long)]
        force: bool,
    },
    /// Print the live ruleset
    Current,
    /// Diff a stored version against another one, or against the live ruleset
    Diff { old: PolicyId, new: Option<PolicyId> },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to config.json
        #[arg(long)]
        init: bool,
    },
}

/// Asks the operator on the terminal, honouring `--yes` and `--force`
struct TerminalConfirmer {
    assume_yes: bool,
    force: bool,
    interactive: bool,
}

impl TerminalConfirmer {
    fn new(assume_yes: bool, force: bool) -> Self {
        Self {
            assume_yes,
            force,
            interactive: nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false),
        }
    }
}

impl Confirmer for TerminalConfirmer {
    fn acknowledge_risk(&self, verdict: &SafetyVerdict) -> bool {
        println!("⚠ Safety: {}", verdict.reason);
        if self.force {
            println!("  Overridden by --force.");
            return true;
        }
        if !self.interactive {
            println!("  Not a terminal; use --force to override.");
            return false;
        }
        prompt_yes_no("Deploy anyway?")
    }

    fn confirm_apply(&self, proposal: &Proposal) -> bool {
        println!(
            "Safety: {} - {}",
            proposal.verdict().label(),
            proposal.verdict().reason
        );
        if let Some(outcome) = proposal.dry_run() {
            println!("Dry-run: OK");
            let output = outcome.output.trim();
            if !output.is_empty() {
                println!("{output}");
            }
        }
        if self.assume_yes {
            return true;
        }
        if !self.interactive {
            println!("Not a terminal; use --yes to apply.");
            return false;
        }
        prompt_yes_no("Apply this ruleset now?")
    }
}

/// Reads a single y/n keypress in raw mode. Anything but `y` is no.
fn prompt_yes_no(question: &str) -> bool {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind};

    print!("{question} [y/N] ");
    std::io::stdout().flush().ok();

    if let Err(e) = crossterm::terminal::enable_raw_mode() {
        eprintln!("\nFailed to enable raw mode: {e}");
        return false;
    }
    let answer = loop {
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                break matches!(key.code, KeyCode::Char('y' | 'Y'));
            }
            Ok(_) => {}
            Err(_) => break false,
        }
    };
    // Always restore terminal to normal mode
    let _ = crossterm::terminal::disable_raw_mode();

    println!("{}", if answer { "y" } else { "n" });
    answer
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file = utils::get_state_dir()
        .map(|dir| dir.join("fpe.log"))
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(error: &Error) {
    eprintln!("✗ {error}");
    if let Some(output) = error.diagnostic_output() {
        let translation = NftablesErrorPattern::match_error(output);
        eprintln!("  {}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  • {suggestion}");
        }
        if let Some(url) = &translation.help_url {
            eprintln!("  See {url}");
        }
        eprintln!("\nRaw output:\n{}", output.trim_end());
    }
}

async fn read_ruleset(file: &Path) -> fpe::Result<String> {
    if file == Path::new("-") {
        use tokio::io::AsyncReadExt;
        let mut text = String::new();
        tokio::io::stdin().read_to_string(&mut text).await?;
        Ok(text)
    } else {
        Ok(tokio::fs::read_to_string(file).await?)
    }
}

fn effective_config(cli: &Cli, mut config: AppConfig) -> AppConfig {
    if cli.demo {
        config.simulate = true;
    }
    if let Some(db) = &cli.db {
        config.database_path = Some(db.clone());
    }
    if let Some(nft) = &cli.nft {
        config.nft_binary = nft.clone();
    }
    config
}

fn build_orchestrator(config: &AppConfig) -> fpe::Result<DeploymentOrchestrator> {
    let path = config
        .resolved_database_path()
        .ok_or_else(|| Error::Internal("no data directory for the policy database".into()))?;
    let store = Arc::new(PolicyStore::open(&path)?);
    Ok(DeploymentOrchestrator::new(
        config.applier(),
        config.analyzer(),
        store,
    ))
}

async fn handle_cli(cli: Cli) -> fpe::Result<()> {
    let config = effective_config(&cli, config::load_config().await);
    if config.simulate {
        println!("(demo mode: the rule engine is never invoked)");
    }

    if let Commands::Config { init } = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        if init {
            config::save_config(&config).await?;
            if let Some(path) = config::config_path() {
                println!("✓ Wrote {}", path.display());
            }
        }
        return Ok(());
    }

    let orch = build_orchestrator(&config)?;
    let limit = |requested: Option<usize>| requested.unwrap_or(config.history_limit);

    match cli.command {
        Commands::List { limit: requested } => {
            let policies = orch.store().list_policies(limit(requested))?;
            if policies.is_empty() {
                println!("No stored policies.");
            }
            for p in policies {
                println!(
                    "{:>6}  {}  {}",
                    p.id,
                    p.created_at.format("%Y-%m-%d %H:%M:%S"),
                    p.name
                );
            }
        }
        Commands::Show { id } => {
            let policy = orch.store().get_policy(id)?.ok_or(Error::PolicyNotFound(id))?;
            println!("Policy #{}: {}", policy.id, policy.name);
            println!("Created: {}", policy.created_at.to_rfc3339());
            println!("SHA-256: {}", policy.checksum);
            println!();
            println!("{}", policy.content.trim_end());
            let entries = orch.store().list_audit_for_policy(id, limit(None))?;
            if !entries.is_empty() {
                println!();
                for entry in entries {
                    println!("{}", entry.summary_line());
                }
            }
        }
        Commands::Save { file, name } => {
            let text = read_ruleset(&file).await?;
            let id = orch.save(name.as_deref(), &text)?;
            println!("✓ Saved as policy #{id}");
        }
        Commands::Delete { id } => {
            orch.delete(id)?;
            println!("✓ Deleted policy #{id}");
        }
        Commands::Audit {
            limit: requested,
            policy,
            json,
        } => {
            let entries = match policy {
                Some(id) => orch.store().list_audit_for_policy(id, limit(requested))?,
                None => orch.store().list_audit(limit(requested))?,
            };
            if json {
                audit::write_jsonl(&entries, std::io::stdout().lock())?;
            } else {
                for entry in entries {
                    println!("{}", entry.summary_line());
                }
            }
        }
        Commands::Check { file } => {
            let text = read_ruleset(&file).await?;
            let verdict = orch.analyze(&text);
            println!("Safety: {} - {}", verdict.label(), verdict.reason);
            if !verdict.safe {
                return Err(Error::SafetyWarning {
                    reason: verdict.reason,
                });
            }
        }
        Commands::DryRun { file } => {
            let text = read_ruleset(&file).await?;
            let outcome = orch.dry_run(&text).await?;
            if !outcome.ok {
                return Err(Error::ValidationFailed {
                    output: outcome.detail(),
                });
            }
            println!("✓ Dry-run passed");
            let output = outcome.output.trim();
            if !output.is_empty() {
                println!("{output}");
            }
        }
        Commands::Simulate { file } => {
            let text = read_ruleset(&file).await?;
            let report = orch.simulate(&text).await?;
            println!(
                "Safety: {} - {}",
                report.verdict.label(),
                report.verdict.reason
            );
            if report.dry_run.ok {
                println!("Dry-run: OK");
            } else {
                println!("Dry-run: FAILED");
                for line in report.dry_run.diagnostics() {
                    println!("  {line}");
                }
            }
            println!("✓ Recorded as policy #{}", report.policy_id);
        }
        Commands::Deploy {
            file,
            policy,
            yes,
            force,
        } => {
            let confirmer = TerminalConfirmer::new(yes, force);
            let deployment = match (policy, file) {
                (Some(id), _) => orch.deploy_policy_with(id, &confirmer).await?,
                (None, Some(file)) => {
                    let text = read_ruleset(&file).await?;
                    orch.deploy_with(text, &confirmer).await?
                }
                (None, None) => {
                    return Err(Error::InvalidInput(
                        "deploy needs a ruleset file or --policy".into(),
                    ));
                }
            };
            println!(
                "✓ Deployed; recorded as policy #{}",
                deployment.policy_id
            );
        }
        Commands::Current => {
            println!("{}", orch.applier().list_ruleset().await?.trim_end());
        }
        Commands::Diff { old, new } => {
            let old_policy = orch.store().get_policy(old)?.ok_or(Error::PolicyNotFound(old))?;
            let new_text = match new {
                Some(id) => {
                    orch.store()
                        .get_policy(id)?
                        .ok_or(Error::PolicyNotFound(id))?
                        .content
                }
                None => orch.applier().list_ruleset().await?,
            };
            match render_diff(&old_policy.content, &new_text) {
                Some(diff) => print!("{diff}"),
                None => println!("No differences."),
            }
        }
        // Answered before the store is opened
        Commands::Config { .. } => {}
    }
    Ok(())
}
