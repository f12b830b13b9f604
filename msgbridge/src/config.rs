//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `MSGBRIDGE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `MSGBRIDGE_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `MSGBRIDGE_ADMISSION__RATE_LIMIT=50` sets the `admission.rate_limit` field.
//!
//! ## Example
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 3000
//! upstream:
//!   url: https://api.openai.com/v1
//!   api_key: sk-provider-key
//! admission:
//!   allowed_keys: [team-a-key]
//!   dev_key: null          # disable the development key
//!   key_ttl: 5m
//!   rate_limit: 100
//!   rate_window: 60s
//!   sweep_interval: 60s
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "MSGBRIDGE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty (or missing) YAML file yields a runnable
/// development configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Chat-completions provider that requests are forwarded to
    pub upstream: UpstreamConfig,
    /// Key validation and rate limiting
    pub admission: AdmissionConfig,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            upstream: UpstreamConfig::default(),
            admission: AdmissionConfig::default(),
            enable_otel_export: false,
        }
    }
}

/// Upstream provider connection settings.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of the provider API; `/chat/completions` is appended to it
    pub url: Url,
    /// Bearer token sent to the provider, if it needs one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Maximum time to establish a connection. Streaming bodies are not time-limited.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("https://api.openai.com/v1").expect("static URL is valid"),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// Configs are logged at startup, so key material is replaced before formatting.
const REDACTED: &str = "<redacted>";

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| REDACTED))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl fmt::Debug for AdmissionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionConfig")
            .field("allowed_keys", &format_args!("[{} keys]", self.allowed_keys.len()))
            .field("dev_key", &self.dev_key.as_ref().map(|_| REDACTED))
            .field("key_ttl", &self.key_ttl)
            .field("rate_limit", &self.rate_limit)
            .field("rate_window", &self.rate_window)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl UpstreamConfig {
    /// Full URL of the provider's chat completions endpoint
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.url.as_str().trim_end_matches('/'))
    }
}

/// Admission layer settings: which keys are accepted and how often they may be used.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Keys accepted regardless of their format
    pub allowed_keys: Vec<String>,
    /// Development key accepted as-is. Set to null to disable.
    pub dev_key: Option<String>,
    /// How long a validation result is remembered
    #[serde(with = "humantime_serde")]
    pub key_ttl: Duration,
    /// Requests allowed per key per window
    pub rate_limit: u32,
    /// Length of a fixed rate-limit window
    #[serde(with = "humantime_serde")]
    pub rate_window: Duration,
    /// How often expired cache entries and windows are evicted
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allowed_keys: Vec::new(),
            dev_key: Some("dev-key".to_string()),
            key_ttl: Duration::from_secs(5 * 60),
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let admission = &self.admission;

        if admission.rate_limit == 0 {
            return Err(Error::Internal {
                operation: "Config validation: admission.rate_limit must be greater than 0".to_string(),
            });
        }

        for (name, value) in [
            ("key_ttl", admission.key_ttl),
            ("rate_window", admission.rate_window),
            ("sweep_interval", admission.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Internal {
                    operation: format!("Config validation: admission.{name} must be greater than 0"),
                });
            }
        }

        if !matches!(self.upstream.url.scheme(), "http" | "https") {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: upstream.url must use http or https, got '{}'",
                    self.upstream.url.scheme()
                ),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values.
            // MSGBRIDGE_CONFIG names the file itself and is not a config key.
            .merge(Env::prefixed("MSGBRIDGE_").ignore(&["CONFIG"]).split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
