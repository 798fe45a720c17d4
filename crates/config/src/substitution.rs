use anyhow::Result;
use regex::{Captures, Regex};
use std::env;
use tracing::{debug, warn};

/// `${VAR}` or `${VAR:-default}`
const PLACEHOLDER_PATTERN: &str = r"\$\{(\w+)(?::-([^}]*))?\}";

/// Substitute environment variables written as `${VAR_NAME}` or
/// `${VAR_NAME:-default}`.
///
/// Unset variables without a default keep their placeholder so the
/// validator can report them.
pub fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(PLACEHOLDER_PATTERN)?;
    let mut missing_vars = Vec::new();

    let result = re.replace_all(content, |caps: &Captures| {
        let var_name = &caps[1];
        match (env::var(var_name), caps.get(2)) {
            (Ok(value), _) => {
                debug!("Substituting environment variable: {}", var_name);
                value
            }
            (Err(_), Some(default)) => {
                debug!("Environment variable '{}' not set, using default", var_name);
                default.as_str().to_string()
            }
            (Err(_), None) => {
                warn!("Environment variable '{}' not set", var_name);
                missing_vars.push(var_name.to_string());
                caps[0].to_string()
            }
        }
    });

    if !missing_vars.is_empty() {
        debug!(
            "Environment variables not set (validation will flag them): {:?}",
            missing_vars
        );
    }

    Ok(result.into_owned())
}

/// Get environment variable with a default value
pub fn get_env_or_default(var_name: &str, default: &str) -> String {
    match env::var(var_name) {
        Ok(value) => value,
        Err(_) => {
            warn!(
                "Environment variable '{}' not set, using default: \"{}\"",
                var_name, default
            );
            default.to_string()
        }
    }
}

/// Names of unresolved `${VAR}` placeholders left in a string
pub fn unresolved_env_vars(content: &str) -> Vec<String> {
    match Regex::new(PLACEHOLDER_PATTERN) {
        Ok(re) => re
            .captures_iter(content)
            .map(|caps| caps[1].to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Check if a string contains unresolved environment variable placeholders
pub fn has_unresolved_env_vars(content: &str) -> bool {
    !unresolved_env_vars(content).is_empty()
}
