use crate::core::policy::PolicyId;
use crate::elevation::ElevationError;
use thiserror::Error;

/// Core error types for FPE
///
/// The pipeline-level variants (`SafetyWarning`, `ValidationFailed`,
/// `ApplyFailed`) are what an operator sees when a deployment stops; the rest
/// are infrastructure failures that propagate unchanged to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable storage failed; an audit record may not have been written
    #[error("Storage error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Safety analysis warned and the operator did not override
    #[error("Deployment aborted (safety): {reason}")]
    SafetyWarning { reason: String },

    /// Dry-run rejected the ruleset
    #[error("Validation failed: the rule engine rejected the ruleset")]
    ValidationFailed { output: String },

    /// Apply ran and the rule engine reported failure
    #[error("Apply failed: the rule engine did not accept the ruleset")]
    ApplyFailed { output: String },

    /// The external binary could not be started at all
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Privilege escalation unavailable
    #[error("Elevation error: {0}")]
    Elevation(#[from] ElevationError),

    /// External command exceeded the configured timeout
    #[error("Rule engine did not finish within {secs}s")]
    Timeout { secs: u64 },

    /// Read-only nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Policy #{0} not found")]
    PolicyNotFound(PolicyId),

    /// Stored content no longer matches the checksum taken at insertion
    #[error("Policy #{id} is corrupted: checksum expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: PolicyId,
        expected: String,
        actual: String,
    },

    #[error("Deployment not confirmed by operator")]
    Unconfirmed,

    /// Apply requested before a passing dry-run
    #[error("Ruleset has not passed a dry-run in this deployment attempt")]
    NotValidated,

    #[error("Another deployment is already in progress")]
    DeployInFlight,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Raw diagnostic text from the rule engine, when the error carries any
    pub fn diagnostic_output(&self) -> Option<&str> {
        match self {
            Self::ValidationFailed { output } | Self::ApplyFailed { output } => Some(output),
            Self::Nftables { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Known nft diagnostic patterns and their operator-facing explanations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches rule-engine output against known patterns.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to change firewall state")
                .with_suggestion("Deploy elevates through sudo, run0 or pkexec; check that one is installed")
                .with_suggestion("Set \"elevation\" in config.json to force a specific method")
                .with_suggestion("Use --demo to explore without privileges");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "The rule engine could not read kernel state without privileges",
            )
            .with_suggestion("Dry-run runs unprivileged; some rulesets need root even to check")
            .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables with your distribution's package manager")
                .with_suggestion("Or point \"nft_binary\" in config.json at the binary");
        }

        if lower.contains("syntax error") || lower.contains("could not process rule") {
            return ErrorTranslation::new("Ruleset syntax error")
                .with_suggestion("The line and column in the raw output point at the problem")
                .with_suggestion("Check for unbalanced braces and missing semicolons")
                .with_help(
                    "https://wiki.nftables.org/wiki-nftables/index.php/Simple_rule_management",
                );
        }

        if lower.contains("does not exist") || lower.contains("not found") {
            return ErrorTranslation::new("The ruleset refers to a table, chain or set that does not exist")
                .with_suggestion("Declare tables and chains before adding rules to them")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Configuring_chains");
        }

        if lower.contains("resource busy") || lower.contains("conflict") {
            return ErrorTranslation::new("Firewall state is busy or conflicting")
                .with_suggestion("Another firewall manager may be running (firewalld, ufw)")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with the kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        ErrorTranslation::new(format!("Rule engine error: {msg}"))
            .with_suggestion("Check the raw output for details")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
