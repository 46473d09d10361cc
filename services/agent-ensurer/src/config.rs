//! Configuration for the ensurer.
//!
//! Every setting is a command-line flag with an environment fallback. The
//! raw flags are validated and resolved into a [`Config`] once, before the
//! loop starts, so the loop itself never touches the environment.

use std::fmt;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;

/// Prefix marking an auth token value as the name of an environment variable.
pub const TOKEN_ENV_PREFIX: char = '$';

/// Keeps a floor of alive idle build agents by launching cloud instances.
#[derive(Debug, Clone, Parser)]
#[command(name = "agent-ensurer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server base URL, e.g. https://ci.example.com/
    #[arg(long, env = "ENSURER_BASE_URL")]
    pub base_url: String,

    /// Bearer token, or `$NAME` to read it from environment variable NAME.
    #[arg(long, env = "ENSURER_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: String,

    /// Cloud profile used as the template for new instances.
    #[arg(long, env = "ENSURER_CLOUD_PROFILE_ID")]
    pub cloud_profile_id: String,

    /// Minimum number of alive idle agents to keep.
    #[arg(long, env = "ENSURER_MIN_IDLE_AGENTS", default_value_t = 1)]
    pub min_idle_agents: u32,

    /// Seconds to sleep between reconciliation cycles.
    #[arg(long, env = "ENSURER_WATCH_INTERVAL_SEC", default_value_t = 60)]
    pub watch_interval_sec: u64,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, env = "ENSURER_REQUEST_TIMEOUT_SEC", default_value_t = 30)]
    pub request_timeout_sec: u64,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "ENSURER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "ENSURER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// What to do when a reconciliation cycle fails.
    #[arg(
        long,
        env = "ENSURER_ON_CYCLE_ERROR",
        value_enum,
        default_value_t = CycleErrorPolicy::Continue
    )]
    pub on_cycle_error: CycleErrorPolicy,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Behaviour of the loop when a cycle fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CycleErrorPolicy {
    /// Log the error and try again on the next tick.
    Continue,
    /// Stop the loop and exit non-zero.
    Exit,
}

/// Validated ensurer configuration.
#[derive(Clone)]
pub struct Config {
    /// Server base URL, always ending in `/`.
    pub base_url: String,

    /// Resolved bearer token.
    pub auth_token: String,

    pub cloud_profile_id: String,

    pub min_idle_agents: u32,

    pub watch_interval: Duration,

    pub request_timeout: Duration,

    pub log_level: String,

    pub log_format: LogFormat,

    pub on_cycle_error: CycleErrorPolicy,
}

impl Config {
    /// Validate parsed flags, resolving the token from the process environment.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        Self::from_cli_with_env(cli, |name| std::env::var(name).ok())
    }

    /// Validate parsed flags, resolving the token through `lookup`.
    pub fn from_cli_with_env<F>(cli: Cli, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = normalize_base_url(&cli.base_url)?;
        let auth_token = resolve_token(&cli.auth_token, lookup)?;

        let cloud_profile_id = cli.cloud_profile_id.trim().to_string();
        if cloud_profile_id.is_empty() {
            return Err(ConfigError::EmptyCloudProfileId);
        }

        if cli.watch_interval_sec == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "watch interval",
            });
        }
        if cli.request_timeout_sec == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "request timeout",
            });
        }

        Ok(Self {
            base_url,
            auth_token,
            cloud_profile_id,
            min_idle_agents: cli.min_idle_agents,
            watch_interval: Duration::from_secs(cli.watch_interval_sec),
            request_timeout: Duration::from_secs(cli.request_timeout_sec),
            log_level: cli.log_level,
            log_format: cli.log_format,
            on_cycle_error: cli.on_cycle_error,
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("auth_token", &"<redacted>")
            .field("cloud_profile_id", &self.cloud_profile_id)
            .field("min_idle_agents", &self.min_idle_agents)
            .field("watch_interval", &self.watch_interval)
            .field("request_timeout", &self.request_timeout)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("on_cycle_error", &self.on_cycle_error)
            .finish()
    }
}

/// Resolve `$NAME` token indirection; any other value is the token itself.
pub fn resolve_token<F>(raw: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let token = match raw.strip_prefix(TOKEN_ENV_PREFIX) {
        Some(name) => lookup(name).ok_or_else(|| ConfigError::MissingTokenVariable {
            name: name.to_string(),
        })?,
        None => raw.to_string(),
    };

    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(ConfigError::EmptyToken);
    }
    Ok(token)
}

/// Check the URL is http(s) and make it end in exactly one `/`.
pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };

    let url = reqwest::Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("must not carry a query or fragment".to_string()));
    }

    Ok(format!("{}/", url.as_str().trim_end_matches('/')))
}
