use crate::error::AppError;
use std::env;

/// Read an environment variable with prod-required / dev-default semantics.
///
/// In production (`ENVIRONMENT=prod`) a missing variable without a value is a
/// configuration error; in development the provided default is used.
pub fn get_env(key: &str, default: Option<&str>) -> Result<String, AppError> {
    let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Read a boolean flag from the environment, defaulting when unset or invalid.
pub fn get_env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read a parseable value from the environment with a default.
pub fn get_env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_uses_default_in_dev() {
        let value = get_env("SERVICE_CORE_TEST_UNSET_VAR", Some("fallback")).unwrap();
        assert_eq!(value, "fallback");
    }

    #[test]
    fn flag_parses_true() {
        std::env::set_var("SERVICE_CORE_TEST_FLAG", "true");
        assert!(get_env_flag("SERVICE_CORE_TEST_FLAG", false));
        std::env::remove_var("SERVICE_CORE_TEST_FLAG");
    }
}
