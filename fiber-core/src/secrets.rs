// fiber-core: Secret resolution
// File-first (Docker/K8s secret mounts), then environment, then default.

use std::path::PathBuf;

use crate::{CoreError, CoreResult};

/// Resolve a secret by key.
///
/// Priority: `/run/secrets/<key_lower>` file, then the `<KEY>` environment
/// variable, then the default. A missing required secret is a startup error;
/// callers exit with code 1.
pub fn get_secret(key: &str, default: Option<&str>, required: bool) -> CoreResult<String> {
    let path = PathBuf::from(format!("/run/secrets/{}", key.to_lowercase()));
    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(contents) => return Ok(contents.trim().to_string()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read secret file");
            }
        }
    }

    if let Ok(val) = std::env::var(key) {
        return Ok(val);
    }

    if let Some(default) = default {
        return Ok(default.to_string());
    }

    if required {
        return Err(CoreError::Config(format!(
            "missing required configuration for {}",
            key
        )));
    }

    Ok(String::new())
}

/// Environment variable with a default, parsed on demand by callers.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Comma-separated environment list, trimmed, empties dropped.
pub fn env_list(key: &str, default: &str) -> Vec<String> {
    env_or(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_secret_errors() {
        assert!(get_secret("FIBER_TEST_NO_SUCH_SECRET", None, true).is_err());
    }

    #[test]
    fn test_default_applies() {
        let v = get_secret("FIBER_TEST_NO_SUCH_SECRET_2", Some("fallback"), true).unwrap();
        assert_eq!(v, "fallback");
    }

    #[test]
    fn test_env_list_trims_and_drops_empties() {
        std::env::set_var("FIBER_TEST_LIST", "a, b ,,c");
        assert_eq!(env_list("FIBER_TEST_LIST", ""), vec!["a", "b", "c"]);
        std::env::remove_var("FIBER_TEST_LIST");
    }
}
