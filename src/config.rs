//! Daemon configuration
//!
//! Everything comes from environment variables (optionally seeded from a
//! `.env` file by `main`). Durations use humantime syntax such as `90s`,
//! `5m` or `1h`.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DurableCache;
use crate::notion::client::{DEFAULT_BASE_URL, REQUEST_TIMEOUT};

const DEFAULT_TYPE_FIELD: &str = "Type";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_DURABLE_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_WARM_TIMEOUT: Duration = Duration::from_secs(60);
/// Log filter used when neither `LOG_LEVEL` nor `RUST_LOG` is set
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid value for {var} ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Notion integration token
    pub api_key: String,
    pub database_id: String,
    /// Select property that marks items as "resource" or "prompt"
    pub type_field: String,
    pub base_url: String,
    /// Fast-tier TTL; also the lifetime of entries promoted from disk
    pub cache_ttl: Duration,
    /// TTL of warm-up and refresh writes
    pub durable_ttl: Duration,
    pub cache_dir: PathBuf,
    pub refresh_interval: Duration,
    pub refresh_on_start: bool,
    /// Upper bound on startup warm-up
    pub warm_timeout: Duration,
    pub request_timeout: Duration,
    /// Tracing filter directives
    pub log_level: String,
}

impl Config {
    /// Load from the process environment and validate
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|var| env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load using `lookup` to resolve variables; does not validate
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let duration = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(var) {
                Some(value) => humantime::parse_duration(&value).map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                }),
                None => Ok(default),
            }
        };

        let refresh_on_start = match get("REFRESH_ON_START") {
            Some(value) => parse_bool(&value).ok_or_else(|| ConfigError::Invalid {
                var: "REFRESH_ON_START",
                reason: "expected true or false".to_string(),
                value,
            })?,
            None => true,
        };

        let cache_dir = get("CACHE_DIR")
            .map(|dir| expand_home(&dir))
            .unwrap_or_else(DurableCache::default_dir);

        Ok(Self {
            api_key: get("NOTION_API_KEY").ok_or(ConfigError::Missing("NOTION_API_KEY"))?,
            database_id: get("NOTION_DATABASE_ID")
                .ok_or(ConfigError::Missing("NOTION_DATABASE_ID"))?,
            type_field: get("NOTION_TYPE_FIELD").unwrap_or_else(|| DEFAULT_TYPE_FIELD.to_string()),
            base_url: get("NOTION_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            cache_ttl: duration("CACHE_TTL", DEFAULT_CACHE_TTL)?,
            durable_ttl: duration("CACHE_DURABLE_TTL", DEFAULT_DURABLE_TTL)?,
            cache_dir,
            refresh_interval: duration("CACHE_REFRESH_INTERVAL", DEFAULT_REFRESH_INTERVAL)?,
            refresh_on_start,
            warm_timeout: duration("WARM_TIMEOUT", DEFAULT_WARM_TIMEOUT)?,
            request_timeout: duration("REQUEST_TIMEOUT", REQUEST_TIMEOUT)?,
            log_level: get("LOG_LEVEL")
                .or_else(|| get("RUST_LOG"))
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }

    /// Reject empty credentials and zero durations
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_empty() {
            return Err(ConfigError::Missing("NOTION_API_KEY"));
        }
        if self.database_id.is_empty() {
            return Err(ConfigError::Missing("NOTION_DATABASE_ID"));
        }
        for (var, value) in [
            ("CACHE_TTL", self.cache_ttl),
            ("CACHE_DURABLE_TTL", self.durable_ttl),
            ("CACHE_REFRESH_INTERVAL", self.refresh_interval),
            ("WARM_TIMEOUT", self.warm_timeout),
            ("REQUEST_TIMEOUT", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(var));
            }
        }
        Ok(())
    }

    /// How long one collection fetch is shared between the two keys
    pub fn snapshot_max_age(&self) -> Duration {
        self.refresh_interval / 2
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => Path::new(path).to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    const REQUIRED: [(&str, &str); 2] =
        [("NOTION_API_KEY", "secret"), ("NOTION_DATABASE_ID", "db1")];

    #[test]
    fn test_defaults() {
        let config = load(&REQUIRED).unwrap();
        config.validate().unwrap();

        assert_eq!(config.type_field, "Type");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.durable_ttl, Duration::from_secs(3600));
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.snapshot_max_age(), Duration::from_secs(150));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.refresh_on_start);
        assert_eq!(config.log_level, "info");
        assert!(config.cache_dir.ends_with("notion-cache"));
    }

    #[test]
    fn test_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("NOTION_TYPE_FIELD", "Kind"),
            ("CACHE_TTL", "90s"),
            ("CACHE_DURABLE_TTL", "2h"),
            ("CACHE_REFRESH_INTERVAL", "1m"),
            ("REFRESH_ON_START", "false"),
            ("CACHE_DIR", "/var/cache/notion"),
            ("LOG_LEVEL", "debug"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.type_field, "Kind");
        assert_eq!(config.cache_ttl, Duration::from_secs(90));
        assert_eq!(config.durable_ttl, Duration::from_secs(7200));
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert!(!config.refresh_on_start);
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/notion"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_log_level_falls_back_to_rust_log() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("RUST_LOG", "notion_cache_daemon=trace"));
        assert_eq!(load(&vars).unwrap().log_level, "notion_cache_daemon=trace");

        vars.push(("LOG_LEVEL", "warn"));
        assert_eq!(load(&vars).unwrap().log_level, "warn");
    }

    #[test]
    fn test_missing_credentials() {
        let err = load(&[("NOTION_DATABASE_ID", "db1")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("NOTION_API_KEY")));

        // Blank counts as missing
        let err = load(&[("NOTION_API_KEY", "  "), ("NOTION_DATABASE_ID", "db1")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("NOTION_API_KEY")));
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("CACHE_TTL", "soon"));
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("CACHE_TTL"));

        let mut vars = REQUIRED.to_vec();
        vars.push(("REFRESH_ON_START", "maybe"));
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("REFRESH_ON_START"));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("CACHE_REFRESH_INTERVAL", "0s"));
        let config = load(&vars).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("CACHE_REFRESH_INTERVAL"))
        ));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/dir"), PathBuf::from("/abs/dir"));
        assert_eq!(expand_home("~user/x"), PathBuf::from("~user/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/cache"), home.join("cache"));
            assert_eq!(expand_home("~"), home);
        }
    }
}
