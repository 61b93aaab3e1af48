//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional; an empty file runs with the defaults below
//! except for the acquirer command, which must come from the file or from
//! `SESSION_ACQUIRER_COMMAND`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use session_refresh::{CoordinatorSettings, ScheduleWindow};

use crate::proxy::RetryPolicy;

/// Env var overriding `[acquirer] command`.
pub const ACQUIRER_COMMAND_ENV: &str = "SESSION_ACQUIRER_COMMAND";

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub schedule: ScheduleConfig,
    pub refresh: RefreshConfig,
    pub proxy: ProxyConfig,
    pub acquirer: AcquirerConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    /// Answer CORS preflights and allow any origin (browser callers)
    pub enable_cors: bool,
}

/// Upstream session settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub credentials_path: PathBuf,
    pub required_cookie: String,
    pub expiry_cookie: String,
    /// Cookies whose domain does not contain this are discarded
    pub cookie_domain: Option<String>,
    /// Sent as Origin, and with a trailing slash as Referer
    pub origin: String,
    /// Assumed expiry (local `HH:MM`) when the expiry cookie carries no claim
    pub fallback_expiry_time: String,
}

/// Proactive refresh windows
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub maintenance_time: String,
    pub preventive_time: String,
    pub pre_expiry_lead_secs: u64,
    pub tick_secs: u64,
}

/// Acquisition limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub acquire_timeout_secs: u64,
    pub cooldown_secs: u64,
}

/// Outbound call retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
}

/// External login helper
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AcquirerConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            max_connections: 1000,
            enable_cors: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from("session.json"),
            required_cookie: session_store::DEFAULT_REQUIRED_COOKIE.into(),
            expiry_cookie: session_store::DEFAULT_EXPIRY_COOKIE.into(),
            cookie_domain: Some("zt-express.com".into()),
            origin: "https://www.zt-express.com".into(),
            fallback_expiry_time: "20:00".into(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            maintenance_time: "00:05".into(),
            preventive_time: "19:30".into(),
            pre_expiry_lead_secs: 30 * 60,
            tick_secs: 60,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 150,
            cooldown_secs: 5,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(command) = std::env::var(ACQUIRER_COMMAND_ENV) {
            config.acquirer.command = command;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Zero("max_connections"));
        }

        let origin = &self.session.origin;
        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "origin must start with http:// or https://, got: {}",
                self.session.origin
            )));
        }

        if self.session.required_cookie.trim().is_empty() {
            return Err(common::Error::Config("required_cookie must not be empty".into()));
        }

        parse_time_of_day("fallback_expiry_time", &self.session.fallback_expiry_time)?;
        parse_time_of_day("maintenance_time", &self.schedule.maintenance_time)?;
        parse_time_of_day("preventive_time", &self.schedule.preventive_time)?;

        for (name, value) in [
            ("tick_secs", self.schedule.tick_secs),
            ("acquire_timeout_secs", self.refresh.acquire_timeout_secs),
            ("request_timeout_secs", self.proxy.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Zero(name));
            }
        }

        if self.acquirer.command.trim().is_empty() {
            return Err(common::Error::Config(format!(
                "acquirer command must be set in [acquirer] or {ACQUIRER_COMMAND_ENV}"
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-proxy.toml")
    }

    pub fn schedule_window(&self) -> common::Result<ScheduleWindow> {
        Ok(ScheduleWindow {
            maintenance: parse_time_of_day("maintenance_time", &self.schedule.maintenance_time)?,
            preventive: parse_time_of_day("preventive_time", &self.schedule.preventive_time)?,
            lead_time: Duration::from_secs(self.schedule.pre_expiry_lead_secs),
        })
    }

    pub fn fallback_expiry(&self) -> common::Result<NaiveTime> {
        parse_time_of_day("fallback_expiry_time", &self.session.fallback_expiry_time)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            acquire_timeout: Duration::from_secs(self.refresh.acquire_timeout_secs),
            cooldown: Duration::from_secs(self.refresh.cooldown_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.proxy.max_retries,
            retry_delay: Duration::from_millis(self.proxy.retry_delay_ms),
            request_timeout: Duration::from_secs(self.proxy.request_timeout_secs),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.schedule.tick_secs)
    }
}

/// Parse a `HH:MM` time of day.
fn parse_time_of_day(field: &'static str, value: &str) -> common::Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| common::Error::TimeOfDay {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("session-proxy.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:9000"

[session]
credentials_path = "/var/lib/session-proxy/session.json"

[acquirer]
command = "/usr/local/bin/login-helper"
args = ["--headless"]
"#
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(ACQUIRER_COMMAND_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, valid_toml())).unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.server.max_connections, 1000);
        assert!(config.server.enable_cors);
        assert_eq!(config.session.required_cookie, "wyzdzjxhdnh");
        assert_eq!(config.session.expiry_cookie, "wyandyy");
        assert_eq!(config.session.cookie_domain.as_deref(), Some("zt-express.com"));
        assert_eq!(config.proxy.max_retries, 3);
        assert_eq!(config.proxy.retry_delay_ms, 1000);
        assert_eq!(config.proxy.request_timeout_secs, 30);
        assert_eq!(config.refresh.acquire_timeout_secs, 150);
        assert_eq!(config.acquirer.args, vec!["--headless".to_string()]);

        let window = config.schedule_window().unwrap();
        assert_eq!(window.maintenance, NaiveTime::from_hms_opt(0, 5, 0).unwrap());
        assert_eq!(window.preventive, NaiveTime::from_hms_opt(19, 30, 0).unwrap());
        assert_eq!(window.lead_time, Duration::from_secs(1800));
        assert_eq!(
            config.fallback_expiry().unwrap(),
            NaiveTime::from_hms_opt(20, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_default_listen_port() {
        assert_eq!(Config::default().server.listen_addr.port(), 8765);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert!(matches!(err, common::Error::Read { .. }), "got: {err:?}");
        assert!(err.to_string().contains("/nonexistent/path/config.toml"));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&write_config(&dir, "not valid {{{{ toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_acquirer_command_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(ACQUIRER_COMMAND_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&write_config(&dir, "[server]\nmax_connections = 10\n"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("acquirer command"), "got: {err}");
    }

    #[test]
    fn test_acquirer_command_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env(ACQUIRER_COMMAND_ENV, "/opt/other-helper") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(ACQUIRER_COMMAND_ENV) };

        assert_eq!(config.acquirer.command, "/opt/other-helper");
    }

    #[test]
    fn test_malformed_time_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(ACQUIRER_COMMAND_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let toml = format!("{}\n[schedule]\nmaintenance_time = \"25:00\"\n", valid_toml());

        let err = Config::load(&write_config(&dir, &toml)).unwrap_err().to_string();
        assert!(err.contains("maintenance_time must be HH:MM"), "got: {err}");
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(ACQUIRER_COMMAND_ENV) };
        for (section, field) in [
            ("schedule", "tick_secs"),
            ("refresh", "acquire_timeout_secs"),
            ("proxy", "request_timeout_secs"),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let toml = format!("{}\n[{section}]\n{field} = 0\n", valid_toml());
            let err = Config::load(&write_config(&dir, &toml)).unwrap_err().to_string();
            assert!(err.contains(field), "{field} = 0 must be rejected, got: {err}");
        }
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(ACQUIRER_COMMAND_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let toml = valid_toml().replace("listen_addr = \"127.0.0.1:9000\"", "max_connections = 0");
        assert!(Config::load(&write_config(&dir, &toml)).is_err());
    }

    #[test]
    fn test_invalid_origin_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(ACQUIRER_COMMAND_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let toml = valid_toml().replace(
            "credentials_path = \"/var/lib/session-proxy/session.json\"",
            "origin = \"www.zt-express.com\"",
        );
        let err = Config::load(&write_config(&dir, &toml)).unwrap_err().to_string();
        assert!(err.contains("origin must start with http"), "got: {err}");
    }

    #[test]
    fn test_zero_retries_allowed() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(ACQUIRER_COMMAND_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let toml = format!("{}\n[proxy]\nmax_retries = 0\nretry_delay_ms = 0\n", valid_toml());
        let config = Config::load(&write_config(&dir, &toml)).unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.retry_delay, Duration::ZERO);
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("session-proxy.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
