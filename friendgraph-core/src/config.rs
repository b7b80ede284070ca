use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Keys every service needs.
pub const REQUIRED_KEYS: [&str; 6] = [
    "STEAM_API_KEY",
    "API_PORT",
    "NODE_NAME",
    "NODE_DC",
    "SERVICE",
    "DATABASE_PATH",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Service configuration, read once at start-up from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub steam_api_key: String,

    // Web server
    pub api_host: String,
    pub api_port: u16,

    // Logging identity
    pub node_name: String,
    pub node_dc: String,
    pub service: String,
    pub log_path: Option<PathBuf>,
    pub log_format: LogFormat,

    pub database_path: PathBuf,

    // Crawling
    pub crawl_workers: usize,
    pub fetch_timeout: Duration,
    pub retry_attempts: u32,
    /// Reuse profiles stored by earlier jobs within this window; `None`
    /// fetches every profile afresh.
    pub profile_max_age: Option<Duration>,
}

/// Every missing or malformed key found while loading a [`Config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigError {
    pub missing: Vec<String>,
    pub invalid: Vec<(String, String)>,
}

impl ConfigError {
    fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!(
                "missing environment variables: {}",
                self.missing.join(", ")
            ));
        }
        for (key, reason) in &self.invalid {
            parts.push(format!("{} {}", key, reason));
        }
        write!(f, "invalid configuration: {}", parts.join("; "))
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Builds a config from any key lookup. Empty values count as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut errors = ConfigError::default();

        for key in REQUIRED_KEYS {
            if get(key).is_none() {
                errors.missing.push(key.to_string());
            }
        }

        let api_port = parse_or(&get, &mut errors, "API_PORT", 0u16);
        let crawl_workers = parse_or(&get, &mut errors, "CRAWL_WORKERS", 4usize);
        let fetch_timeout_secs = parse_or(&get, &mut errors, "FETCH_TIMEOUT_SECS", 10u64);
        let retry_attempts = parse_or(&get, &mut errors, "RETRY_ATTEMPTS", 3u32);
        let profile_max_age_secs = parse_or(&get, &mut errors, "PROFILE_MAX_AGE_SECS", 0u64);

        if crawl_workers == 0 {
            errors
                .invalid
                .push(("CRAWL_WORKERS".to_string(), "must be at least 1".to_string()));
        }
        if retry_attempts == 0 {
            errors
                .invalid
                .push(("RETRY_ATTEMPTS".to_string(), "must be at least 1".to_string()));
        }

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                errors.invalid.push((
                    "LOG_FORMAT".to_string(),
                    format!("must be 'text' or 'json', got '{}'", other),
                ));
                LogFormat::Text
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            steam_api_key: get("STEAM_API_KEY").unwrap_or_default(),
            api_host: get("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port,
            node_name: get("NODE_NAME").unwrap_or_default(),
            node_dc: get("NODE_DC").unwrap_or_default(),
            service: get("SERVICE").unwrap_or_default(),
            log_path: get("LOG_PATH").map(PathBuf::from),
            log_format,
            database_path: get("DATABASE_PATH").map(PathBuf::from).unwrap_or_default(),
            crawl_workers,
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            retry_attempts,
            profile_max_age: (profile_max_age_secs > 0)
                .then(|| Duration::from_secs(profile_max_age_secs)),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    errors: &mut ConfigError,
    key: &str,
    default: T,
) -> T {
    match get(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                errors
                    .invalid
                    .push((key.to_string(), format!("is not a valid number: '{}'", raw)));
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> HashMap<String, String> {
        [
            ("STEAM_API_KEY", "secret"),
            ("API_PORT", "8080"),
            ("NODE_NAME", "crawler-1"),
            ("NODE_DC", "ams"),
            ("SERVICE", "crawler"),
            ("DATABASE_PATH", "/var/lib/friendgraph/db.sqlite"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_complete_config_uses_defaults() {
        let config = Config::from_map(&complete()).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.crawl_workers, 4);
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.log_path.is_none());
        assert!(config.profile_max_age.is_none());
    }

    #[test]
    fn test_all_missing_keys_reported_together() {
        let mut vars = complete();
        vars.remove("STEAM_API_KEY");
        vars.remove("NODE_DC");
        vars.insert("SERVICE".to_string(), "   ".to_string());

        let err = Config::from_map(&vars).unwrap_err();
        assert_eq!(err.missing, vec!["STEAM_API_KEY", "NODE_DC", "SERVICE"]);
        let message = err.to_string();
        assert!(message.contains("STEAM_API_KEY"));
        assert!(message.contains("NODE_DC"));
        assert!(message.contains("SERVICE"));
    }

    #[test]
    fn test_invalid_values_reported_with_missing_ones() {
        let mut vars = complete();
        vars.remove("NODE_NAME");
        vars.insert("API_PORT".to_string(), "eighty".to_string());
        vars.insert("LOG_FORMAT".to_string(), "xml".to_string());

        let err = Config::from_map(&vars).unwrap_err();
        assert_eq!(err.missing, vec!["NODE_NAME"]);
        let keys: Vec<&str> = err.invalid.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["API_PORT", "LOG_FORMAT"]);
    }

    #[test]
    fn test_optional_overrides() {
        let mut vars = complete();
        vars.insert("LOG_FORMAT".to_string(), "json".to_string());
        vars.insert("LOG_PATH".to_string(), "/tmp/fg.log".to_string());
        vars.insert("CRAWL_WORKERS".to_string(), "16".to_string());
        vars.insert("API_HOST".to_string(), "127.0.0.1".to_string());
        vars.insert("PROFILE_MAX_AGE_SECS".to_string(), "86400".to_string());

        let config = Config::from_map(&vars).unwrap();
        assert_eq!(config.profile_max_age, Some(Duration::from_secs(86400)));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_path, Some(PathBuf::from("/tmp/fg.log")));
        assert_eq!(config.crawl_workers, 16);
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut vars = complete();
        vars.insert("CRAWL_WORKERS".to_string(), "0".to_string());
        let err = Config::from_map(&vars).unwrap_err();
        assert_eq!(err.invalid[0].0, "CRAWL_WORKERS");
    }
}
