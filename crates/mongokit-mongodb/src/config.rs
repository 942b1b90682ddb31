//! Connection settings: environment lookup, defaults and caller overrides

use mongokit_common::{MongoKitError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Connection string for normal runs
pub const CONNECTION_STRING_VAR: &str = "MONGO_CONNECTION_STRING";
/// Connection string used when running under a test harness
pub const TEST_CONNECTION_STRING_VAR: &str = "MONGO_TEST_CONNECTION_STRING";

pub const KEEP_ALIVE_VAR: &str = "MONGO_KEEP_ALIVE_MS";
pub const CONNECT_TIMEOUT_VAR: &str = "MONGO_CONNECT_TIMEOUT_MS";
pub const RECONNECT_TRIES_VAR: &str = "MONGO_RECONNECT_TRIES";

/// Which connection string variable to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Default,
    Test,
}

impl Environment {
    /// Name of the variable holding the connection string for this environment
    pub fn connection_string_var(&self) -> &'static str {
        match self {
            Environment::Default => CONNECTION_STRING_VAR,
            Environment::Test => TEST_CONNECTION_STRING_VAR,
        }
    }
}

/// Effective connection options
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    /// Server monitoring interval; mapped onto the driver heartbeat frequency
    pub keep_alive: Duration,
    /// Timeout for establishing the connection and selecting a server
    pub connect_timeout: Duration,
    /// Non-fatal connect failures tolerated before the handle gives up
    pub reconnect_tries: u32,
    /// Pause between connect attempts
    pub reconnect_interval: Duration,
    /// Upper bound for a best-effort shutdown
    pub shutdown_timeout: Duration,
    /// Application name reported in server logs
    pub app_name: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(30_000),
            reconnect_tries: u32::MAX,
            reconnect_interval: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(10),
            app_name: Some("mongokit".to_string()),
        }
    }
}

impl ConnectOptions {
    /// Returns a copy of `self` with every override that is set applied on top
    pub fn merged(&self, overrides: &ConnectOverrides) -> Self {
        let mut options = self.clone();
        if let Some(ms) = overrides.keep_alive {
            options.keep_alive = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.connect_timeout_ms {
            options.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(tries) = overrides.reconnect_tries {
            options.reconnect_tries = tries;
        }
        if let Some(ms) = overrides.reconnect_interval {
            options.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.shutdown_timeout_ms {
            options.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(name) = &overrides.app_name {
            options.app_name = Some(name.clone());
        }
        options
    }
}

/// Caller-suppliable overrides, in milliseconds where a duration is expected.
///
/// Accepts the same keys as the JSON options object passed by harness
/// scripts, e.g. `{"keepAlive": 500, "connectTimeoutMS": 2000}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectOverrides {
    pub keep_alive: Option<u64>,
    #[serde(rename = "connectTimeoutMS")]
    pub connect_timeout_ms: Option<u64>,
    pub reconnect_tries: Option<u32>,
    pub reconnect_interval: Option<u64>,
    #[serde(rename = "shutdownTimeoutMS")]
    pub shutdown_timeout_ms: Option<u64>,
    pub app_name: Option<String>,
}

impl ConnectOverrides {
    /// Parse overrides from a JSON object
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            MongoKitError::InvalidConfiguration(format!("invalid connection options: {}", e))
        })
    }

    pub fn keep_alive(mut self, ms: u64) -> Self {
        self.keep_alive = Some(ms);
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    pub fn reconnect_tries(mut self, tries: u32) -> Self {
        self.reconnect_tries = Some(tries);
        self
    }

    pub fn reconnect_interval(mut self, ms: u64) -> Self {
        self.reconnect_interval = Some(ms);
        self
    }

    pub fn shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = Some(ms);
        self
    }

    /// Fields set on `self` win, unset ones fall back to `other`
    pub fn or(self, other: Self) -> Self {
        Self {
            keep_alive: self.keep_alive.or(other.keep_alive),
            connect_timeout_ms: self.connect_timeout_ms.or(other.connect_timeout_ms),
            reconnect_tries: self.reconnect_tries.or(other.reconnect_tries),
            reconnect_interval: self.reconnect_interval.or(other.reconnect_interval),
            shutdown_timeout_ms: self.shutdown_timeout_ms.or(other.shutdown_timeout_ms),
            app_name: self.app_name.or(other.app_name),
        }
    }
}

/// Connection string plus overrides resolved from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub uri: String,
    pub overrides: ConnectOverrides,
}

impl DatabaseConfig {
    /// Read the configuration from the process environment
    pub fn from_env(environment: Environment) -> Result<Self> {
        Self::from_lookup(environment, |key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup<F>(environment: Environment, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = environment.connection_string_var();
        let uri = lookup(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                MongoKitError::InvalidConfiguration(format!("{} is not set", var))
            })?;

        let overrides = ConnectOverrides {
            keep_alive: parse_var(&lookup, KEEP_ALIVE_VAR)?,
            connect_timeout_ms: parse_var(&lookup, CONNECT_TIMEOUT_VAR)?,
            reconnect_tries: parse_var(&lookup, RECONNECT_TRIES_VAR)?,
            ..ConnectOverrides::default()
        };

        Ok(Self { uri, overrides })
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            MongoKitError::InvalidConfiguration(format!("{} '{}' is invalid: {}", key, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_options() {
        let options = ConnectOptions::default();
        assert_eq!(options.keep_alive, Duration::from_millis(2000));
        assert_eq!(options.connect_timeout, Duration::from_millis(30_000));
        assert_eq!(options.reconnect_tries, u32::MAX);
        assert_eq!(options.app_name.as_deref(), Some("mongokit"));
    }

    #[test]
    fn test_merge_leaves_defaults_untouched() {
        let defaults = ConnectOptions::default();
        let merged = defaults.merged(&ConnectOverrides::default().keep_alive(500).reconnect_tries(3));

        assert_eq!(merged.keep_alive, Duration::from_millis(500));
        assert_eq!(merged.reconnect_tries, 3);
        assert_eq!(merged.connect_timeout, defaults.connect_timeout);
        assert_eq!(defaults, ConnectOptions::default());
    }

    #[test]
    fn test_overrides_from_json() {
        let overrides =
            ConnectOverrides::from_json(r#"{"keepAlive": 100, "connectTimeoutMS": 2000, "reconnectTries": 5}"#)
                .unwrap();
        assert_eq!(overrides.keep_alive, Some(100));
        assert_eq!(overrides.connect_timeout_ms, Some(2000));
        assert_eq!(overrides.reconnect_tries, Some(5));
        assert!(overrides.app_name.is_none());
    }

    #[test]
    fn test_overrides_from_json_rejects_unknown_keys() {
        let err = ConnectOverrides::from_json(r#"{"useMongoClient": true}"#).unwrap_err();
        assert!(matches!(err, MongoKitError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_config_selects_variable_by_environment() {
        let vars = lookup(&[
            (CONNECTION_STRING_VAR, "mongodb://prod:27017/app"),
            (TEST_CONNECTION_STRING_VAR, "mongodb://localhost:27017/app_test"),
        ]);

        let default = DatabaseConfig::from_lookup(Environment::Default, &vars).unwrap();
        assert_eq!(default.uri, "mongodb://prod:27017/app");

        let test = DatabaseConfig::from_lookup(Environment::Test, &vars).unwrap();
        assert_eq!(test.uri, "mongodb://localhost:27017/app_test");
    }

    #[test]
    fn test_missing_or_blank_uri_is_invalid_configuration() {
        let err = DatabaseConfig::from_lookup(Environment::Default, lookup(&[])).unwrap_err();
        assert_eq!(
            err,
            MongoKitError::InvalidConfiguration("MONGO_CONNECTION_STRING is not set".to_string())
        );

        let err = DatabaseConfig::from_lookup(
            Environment::Test,
            lookup(&[(TEST_CONNECTION_STRING_VAR, "   ")]),
        )
        .unwrap_err();
        assert!(matches!(err, MongoKitError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_numeric_overrides_from_env() {
        let config = DatabaseConfig::from_lookup(
            Environment::Default,
            lookup(&[
                (CONNECTION_STRING_VAR, "mongodb://localhost/app"),
                (KEEP_ALIVE_VAR, "750"),
                (RECONNECT_TRIES_VAR, "4"),
            ]),
        )
        .unwrap();
        assert_eq!(config.overrides.keep_alive, Some(750));
        assert_eq!(config.overrides.reconnect_tries, Some(4));
        assert_eq!(config.overrides.connect_timeout_ms, None);
    }

    #[test]
    fn test_unparseable_override_is_rejected() {
        let err = DatabaseConfig::from_lookup(
            Environment::Default,
            lookup(&[
                (CONNECTION_STRING_VAR, "mongodb://localhost/app"),
                (CONNECT_TIMEOUT_VAR, "soon"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, MongoKitError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_overrides_layering() {
        let env = ConnectOverrides::default().keep_alive(750).reconnect_tries(4);
        let cli = ConnectOverrides::from_json(r#"{"reconnectTries": 1}"#).unwrap();
        let layered = cli.or(env);
        assert_eq!(layered.reconnect_tries, Some(1));
        assert_eq!(layered.keep_alive, Some(750));
        assert_eq!(layered.connect_timeout_ms, None);
    }
}
