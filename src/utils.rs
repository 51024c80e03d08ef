//! Utility functions for directory management
//!
//! This module provides helper functions following the XDG Base Directory specification
//! for portable configuration and data storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/fpe/` - Configuration and the policy database
//! - State: `~/.local/state/fpe/` - Runtime state (log file)
//!
//! # Example
//!
//! ```
//! use fpe::utils::{get_data_dir, ensure_dirs};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     let _db = data_path.join("policies.db");
//! }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

/// File name of the policy database inside the data directory
pub const DATABASE_FILE: &str = "policies.db";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "fpe", "fpe")
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Default location of the policy database
pub fn default_database_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(DATABASE_FILE))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_data_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_data_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Find the nearest character boundary to avoid splitting multi-byte characters
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string_unchanged() {
        assert_eq!(truncate_string("deploy", 10), "deploy");
    }

    #[test]
    fn test_truncate_adds_ellipsis() {
        let out = truncate_string("Error: syntax error, unexpected newline", 16);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 16);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let out = truncate_string("ééééééééé", 8);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_default_database_path_file_name() {
        if let Some(path) = default_database_path() {
            assert!(path.ends_with(DATABASE_FILE));
        }
    }
}
