//! Privilege elevation for ruleset application
//!
//! FPE runs as an unprivileged user and only elevates to apply a ruleset.
//! Dry-runs and `list ruleset` always run with the caller's own privileges.
//!
//! # Elevation Strategy
//!
//! 1. An explicit method from `config.json` (`"elevation"`)
//! 2. `FPE_ELEVATION_METHOD` environment variable (`sudo`, `run0`, `pkexec`, `direct`)
//! 3. Direct execution when already running as root
//! 4. `run0` when available (systemd v256+, no SUID)
//! 5. `sudo` on a terminal, `pkexec` otherwise
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - Wrapper binaries are checked for availability before use
//!
//! # Example
//!
//! ```no_run
//! use fpe::elevation::{create_elevated_command, ElevationMethod};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_command(Path::new("nft"), &["-f", "-"], Some(ElevationMethod::Sudo))?;
//! cmd.stdin(std::process::Stdio::piped());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tokio::process::Command;

/// Environment override consulted when the config leaves the method unset
pub const ELEVATION_ENV: &str = "FPE_ELEVATION_METHOD";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `FPE_ELEVATION_METHOD`
    #[error("Invalid FPE_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec, direct")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a privileged command is wrapped
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    Sudo,
    Run0,
    Pkexec,
    /// Run the program as-is (already privileged, or tests)
    Direct,
}

impl ElevationMethod {
    /// Wrapper binary for this method, `None` for [`ElevationMethod::Direct`]
    pub fn wrapper(self) -> Option<&'static str> {
        match self {
            Self::Sudo => Some("sudo"),
            Self::Run0 => Some("run0"),
            Self::Pkexec => Some("pkexec"),
            Self::Direct => None,
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Reads the method from `FPE_ELEVATION_METHOD`, if set and non-empty.
fn method_from_env() -> Result<Option<ElevationMethod>, ElevationError> {
    match std::env::var(ELEVATION_ENV) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<ElevationMethod>()
            .map(Some)
            .map_err(|_| ElevationError::InvalidMethod(value)),
        _ => Ok(None),
    }
}

/// Picks a method when neither config nor environment names one.
fn detect_method() -> Result<ElevationMethod, ElevationError> {
    use std::os::fd::AsFd;

    if nix::unistd::getuid().is_root() {
        return Ok(ElevationMethod::Direct);
    }

    if binary_exists("run0") {
        return Ok(ElevationMethod::Run0);
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(ElevationMethod::Sudo)
    } else if binary_exists("pkexec") {
        Ok(ElevationMethod::Pkexec)
    } else {
        Err(ElevationError::PkexecNotFound)
    }
}

/// Resolves the effective elevation method.
///
/// `configured` wins over the environment, which wins over auto-detection.
///
/// # Errors
///
/// Returns `Err` if the environment names an unknown method, or if
/// auto-detection finds no usable wrapper.
pub fn resolve_method(
    configured: Option<ElevationMethod>,
) -> Result<ElevationMethod, ElevationError> {
    if let Some(method) = configured {
        return Ok(method);
    }
    if let Some(method) = method_from_env()? {
        return Ok(method);
    }
    detect_method()
}

/// Wraps `program args...` with the given method.
///
/// # Errors
///
/// Returns `ElevationError::MethodNotAvailable` if the wrapper binary is not in PATH.
pub fn wrap_command(
    method: ElevationMethod,
    program: &Path,
    args: &[&str],
) -> Result<Command, ElevationError> {
    match method.wrapper() {
        None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        Some(wrapper) => {
            if !binary_exists(wrapper) {
                return Err(ElevationError::MethodNotAvailable(wrapper.into()));
            }
            let mut cmd = Command::new(wrapper);
            cmd.arg(program).args(args);
            Ok(cmd)
        }
    }
}

/// Creates an elevated command for the rule-engine binary
///
/// Arguments are passed directly without shell interpretation, preventing
/// command injection. See the module docs for the resolution order.
///
/// # Errors
///
/// Returns `Err` if no elevation method can be resolved or the chosen
/// wrapper is missing.
pub fn create_elevated_command(
    program: &Path,
    args: &[&str],
    configured: Option<ElevationMethod>,
) -> Result<Command, ElevationError> {
    let method = resolve_method(configured)?;
    tracing::debug!("Elevating {} via {method}", program.display());
    wrap_command(method, program, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        assert!(!binary_exists("fpe_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_method_parsing_is_case_insensitive() {
        assert_eq!("SUDO".parse::<ElevationMethod>().unwrap(), ElevationMethod::Sudo);
        assert_eq!("run0".parse::<ElevationMethod>().unwrap(), ElevationMethod::Run0);
        assert_eq!(ElevationMethod::Pkexec.to_string(), "pkexec");
        assert!("doas".parse::<ElevationMethod>().is_err());
    }

    #[test]
    fn test_configured_method_wins_over_env() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(ELEVATION_ENV, "pkexec");
        }

        let method = resolve_method(Some(ElevationMethod::Direct));

        unsafe {
            std::env::remove_var(ELEVATION_ENV);
        }
        assert_eq!(method.unwrap(), ElevationMethod::Direct);
    }

    #[test]
    fn test_invalid_env_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(ELEVATION_ENV, "invalid_method");
        }

        let result = resolve_method(None);

        unsafe {
            std::env::remove_var(ELEVATION_ENV);
        }
        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }

    #[test]
    fn test_env_method_used_when_unconfigured() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(ELEVATION_ENV, "Direct");
        }

        let result = resolve_method(None);

        unsafe {
            std::env::remove_var(ELEVATION_ENV);
        }
        assert_eq!(result.unwrap(), ElevationMethod::Direct);
    }

    #[test]
    fn test_direct_command_runs_program_itself() {
        let cmd = wrap_command(ElevationMethod::Direct, Path::new("nft"), &["-f", "-"]).unwrap();
        assert_eq!(cmd.as_std().get_program(), "nft");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["-f", "-"]);
    }

    #[test]
    fn test_wrapped_command_prefixes_program() {
        // sudo may be absent in minimal containers; either outcome is valid but never InvalidMethod
        match wrap_command(ElevationMethod::Sudo, Path::new("nft"), &["-f", "-"]) {
            Ok(cmd) => {
                assert_eq!(cmd.as_std().get_program(), "sudo");
                let args: Vec<_> = cmd.as_std().get_args().collect();
                assert_eq!(args, ["nft", "-f", "-"]);
            }
            Err(e) => assert!(matches!(e, ElevationError::MethodNotAvailable(_))),
        }
    }
}
