//! Input validation and sanitization functions for FPE
//!
//! Everything an operator types (policy names, ruleset text, ports) passes
//! through here before it reaches the store or the rule engine.

/// Maximum accepted ruleset size (1 MiB)
pub const MAX_RULESET_BYTES: usize = 1024 * 1024;

/// Maximum policy name length in characters
pub const MAX_NAME_LEN: usize = 64;

/// Sanitizes a policy name for display in listings and audit details.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 ASCII characters.
///
/// # Examples
///
/// ```
/// use fpe::validators::sanitize_name;
///
/// assert_eq!(sanitize_name("deployed-20240101"), "deployed-20240101");
///
/// let cleaned = sanitize_name("web\nfarm\"v2");
/// assert!(!cleaned.contains('\n'));
/// assert!(!cleaned.contains('"'));
/// ```
pub fn sanitize_name(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':'))
        .take(MAX_NAME_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Validates and sanitizes a policy name.
///
/// # Errors
///
/// Returns `Err` if:
/// - Name exceeds 64 characters
/// - Name is empty, or becomes empty after sanitization
pub fn validate_policy_name(input: &str) -> Result<String, String> {
    if input.chars().count() > MAX_NAME_LEN {
        return Err(format!("Name too long (max {MAX_NAME_LEN} characters)"));
    }

    let sanitized = sanitize_name(input);

    if sanitized.is_empty() {
        return Err("Name is empty or contains only invalid characters".to_string());
    }

    Ok(sanitized)
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port 0 is reserved".to_string())
    } else {
        Ok(port)
    }
}

/// Validates ruleset text before it is stored or handed to the rule engine.
///
/// The text itself stays opaque; only shape is checked.
///
/// # Errors
///
/// Returns `Err` if the text is blank, larger than [`MAX_RULESET_BYTES`],
/// or contains NUL bytes.
pub fn validate_ruleset_text(text: &str) -> Result<(), String> {
    if text.trim().is_empty() {
        return Err("Ruleset is empty".to_string());
    }

    if text.len() > MAX_RULESET_BYTES {
        return Err(format!(
            "Ruleset too large ({} bytes, max {MAX_RULESET_BYTES})",
            text.len()
        ));
    }

    if text.contains('\0') {
        return Err("Ruleset contains NUL bytes".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name_strips_metacharacters() {
        assert_eq!(sanitize_name("prod;rm -rf $HOME"), "prodrm -rf HOME");
        assert_eq!(sanitize_name("  padded  "), "padded");
    }

    #[test]
    fn test_sanitize_name_truncates() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_name(&long).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_validate_policy_name() {
        assert_eq!(validate_policy_name("web v2").unwrap(), "web v2");
        assert!(validate_policy_name("").is_err());
        assert!(validate_policy_name("\"\"\"").is_err());
        assert!(validate_policy_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_port() {
        assert!(validate_port(0).is_err());
        assert_eq!(validate_port(22), Ok(22));
    }

    #[test]
    fn test_validate_ruleset_text() {
        assert!(validate_ruleset_text("table inet filter {}").is_ok());
        assert!(validate_ruleset_text("   \n\t").is_err());
        assert!(validate_ruleset_text("table\0").is_err());

        let huge = "#".repeat(MAX_RULESET_BYTES + 1);
        assert!(validate_ruleset_text(&huge).is_err());
    }
}
