//! Configuration loading and defaults.
//!
//! Resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `BROKER_LISTEN`, `BROKER_LOG_LEVEL`,
//!    `BROKER_DOCKER_HOST`
//! 2. **Config file** — path via `--config <path>`, or `broker.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! ```toml
//! listen = "0.0.0.0:7420"
//! logLevel = "info"
//! sweepIntervalSeconds = 10
//! healthCacheSeconds = 30
//!
//! [broker]
//! maxSessionsPerConnection = 5
//! maxGlobalSessions = 256
//! idleTimeoutSeconds = 1800
//! maxLifetimeSeconds = 3600
//! backoffBaseSeconds = 5
//! backoffMaxSeconds = 300
//! adapterCreateTimeoutSeconds = 10
//! maxInputBytes = 65536
//! maxOutboundQueueBytes = 1048576
//! preserveAnsi = true
//! preserveControlChars = true
//!
//! [sandbox]
//! dockerHost = "unix:///var/run/docker.sock"
//! cpuLimit = 1.0
//! memoryLimitBytes = 268435456
//!
//! [sandbox.images]
//! python = "codebroker/python:3.12"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::health_gate::BackoffPolicy;
use crate::registry::RegistryLimits;
use crate::sandbox::docker::LanguageImage;
use crate::session::SessionTimeouts;
use crate::stream::StreamPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_log_level")]
    #[serde(rename = "logLevel")]
    pub log_level: String,
    #[serde(default = "default_sweep_interval")]
    #[serde(rename = "sweepIntervalSeconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_health_cache_seconds")]
    #[serde(rename = "healthCacheSeconds")]
    pub health_cache_seconds: u64,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Resource caps and protocol options from spec §6.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_max_sessions_per_connection")]
    #[serde(rename = "maxSessionsPerConnection")]
    pub max_sessions_per_connection: usize,
    #[serde(default = "default_max_global_sessions")]
    #[serde(rename = "maxGlobalSessions")]
    pub max_global_sessions: usize,
    #[serde(default = "default_idle_timeout_seconds")]
    #[serde(rename = "idleTimeoutSeconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_max_lifetime_seconds")]
    #[serde(rename = "maxLifetimeSeconds")]
    pub max_lifetime_seconds: u64,
    #[serde(default = "default_backoff_base_seconds")]
    #[serde(rename = "backoffBaseSeconds")]
    pub backoff_base_seconds: u64,
    #[serde(default = "default_backoff_max_seconds")]
    #[serde(rename = "backoffMaxSeconds")]
    pub backoff_max_seconds: u64,
    #[serde(default = "default_adapter_create_timeout_seconds")]
    #[serde(rename = "adapterCreateTimeoutSeconds")]
    pub adapter_create_timeout_seconds: u64,
    #[serde(default = "default_max_input_bytes")]
    #[serde(rename = "maxInputBytes")]
    pub max_input_bytes: usize,
    #[serde(default = "default_max_outbound_queue_bytes")]
    #[serde(rename = "maxOutboundQueueBytes")]
    pub max_outbound_queue_bytes: usize,
    #[serde(default = "default_true")]
    #[serde(rename = "preserveAnsi")]
    pub preserve_ansi: bool,
    #[serde(default = "default_true")]
    #[serde(rename = "preserveControlChars")]
    pub preserve_control_chars: bool,
}

/// Sandbox adapter connection and resource settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(rename = "dockerHost")]
    pub docker_host: Option<String>,
    #[serde(default = "default_images")]
    pub images: HashMap<String, String>,
    #[serde(default = "default_cpu_limit")]
    #[serde(rename = "cpuLimit")]
    pub cpu_limit: f64,
    #[serde(default = "default_memory_limit_bytes")]
    #[serde(rename = "memoryLimitBytes")]
    pub memory_limit_bytes: i64,
}

fn default_listen() -> String {
    "0.0.0.0:7420".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_sweep_interval() -> u64 {
    10
}
fn default_health_cache_seconds() -> u64 {
    30
}
fn default_max_sessions_per_connection() -> usize {
    5
}
fn default_max_global_sessions() -> usize {
    256
}
fn default_idle_timeout_seconds() -> u64 {
    1800
}
fn default_max_lifetime_seconds() -> u64 {
    3600
}
fn default_backoff_base_seconds() -> u64 {
    5
}
fn default_backoff_max_seconds() -> u64 {
    300
}
fn default_adapter_create_timeout_seconds() -> u64 {
    10
}
fn default_max_input_bytes() -> usize {
    65536
}
fn default_max_outbound_queue_bytes() -> usize {
    1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_cpu_limit() -> f64 {
    1.0
}
fn default_memory_limit_bytes() -> i64 {
    256 * 1024 * 1024
}
fn default_images() -> HashMap<String, String> {
    [
        ("python", "codebroker/python:3.12"),
        ("javascript", "codebroker/node:20"),
        ("typescript", "codebroker/node:20"),
        ("java", "codebroker/java:21"),
        ("c", "codebroker/gcc:13"),
        ("cpp", "codebroker/gcc:13"),
        ("go", "codebroker/go:1.22"),
        ("rust", "codebroker/rust:1.82"),
        ("bash", "codebroker/bash:5"),
        ("sql", "codebroker/postgres-client:16"),
        ("csharp", "codebroker/dotnet:8"),
        ("swift", "codebroker/swift:5.10"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_connection: default_max_sessions_per_connection(),
            max_global_sessions: default_max_global_sessions(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            max_lifetime_seconds: default_max_lifetime_seconds(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_max_seconds: default_backoff_max_seconds(),
            adapter_create_timeout_seconds: default_adapter_create_timeout_seconds(),
            max_input_bytes: default_max_input_bytes(),
            max_outbound_queue_bytes: default_max_outbound_queue_bytes(),
            preserve_ansi: true,
            preserve_control_chars: true,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            images: default_images(),
            cpu_limit: default_cpu_limit(),
            memory_limit_bytes: default_memory_limit_bytes(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("broker.toml").exists() {
            let content = std::fs::read_to_string("broker.toml").expect("Failed to read broker.toml");
            toml::from_str(&content).expect("Failed to parse broker.toml")
        } else {
            Self {
                listen: default_listen(),
                log_level: default_log_level(),
                sweep_interval_seconds: default_sweep_interval(),
                health_cache_seconds: default_health_cache_seconds(),
                broker: BrokerConfig::default(),
                sandbox: SandboxConfig::default(),
            }
        };

        if let Ok(listen) = std::env::var("BROKER_LISTEN") {
            config.listen = listen;
        }
        if let Ok(level) = std::env::var("BROKER_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(host) = std::env::var("BROKER_DOCKER_HOST") {
            config.sandbox.docker_host = Some(host);
        }

        config
    }

    /// Abort-at-startup validation (§1.1): non-empty listen address, non-zero caps.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.listen.trim().is_empty() {
            errors.push("listen must not be empty".to_string());
        }
        if self.broker.max_sessions_per_connection == 0 {
            errors.push("broker.maxSessionsPerConnection must be > 0".to_string());
        }
        if self.broker.max_global_sessions == 0 {
            errors.push("broker.maxGlobalSessions must be > 0".to_string());
        }
        if self.broker.max_input_bytes == 0 {
            errors.push("broker.maxInputBytes must be > 0".to_string());
        }
        if self.sandbox.images.is_empty() {
            errors.push("sandbox.images must declare at least one language".to_string());
        }
        errors
    }

    #[must_use]
    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_sessions_per_connection: self.broker.max_sessions_per_connection,
            max_global_sessions: self.broker.max_global_sessions,
        }
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_secs: self.broker.backoff_base_seconds,
            max_secs: self.broker.backoff_max_seconds,
        }
    }

    #[must_use]
    pub fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy {
            preserve_ansi: self.broker.preserve_ansi,
            preserve_control_chars: self.broker.preserve_control_chars,
            max_chunk_bytes: 4096,
        }
    }

    #[must_use]
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            idle: Duration::from_secs(self.broker.idle_timeout_seconds),
            max_lifetime: Duration::from_secs(self.broker.max_lifetime_seconds),
            adapter_create: Duration::from_secs(self.broker.adapter_create_timeout_seconds),
        }
    }

    #[must_use]
    pub fn language_images(&self) -> HashMap<String, LanguageImage> {
        self.sandbox
            .images
            .iter()
            .map(|(lang, image)| {
                let cmd = default_command_for(lang);
                (lang.clone(), LanguageImage { image: image.clone(), cmd })
            })
            .collect()
    }
}

fn default_command_for(language: &str) -> Vec<String> {
    match language {
        "python" => vec!["python3".into()],
        "javascript" | "typescript" => vec!["node".into()],
        "bash" => vec!["bash".into()],
        "go" => vec!["gosh".into()],
        _ => vec!["sh".into()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = Config {
            listen: default_listen(),
            log_level: default_log_level(),
            sweep_interval_seconds: default_sweep_interval(),
            health_cache_seconds: default_health_cache_seconds(),
            broker: BrokerConfig::default(),
            sandbox: SandboxConfig::default(),
        };
        assert!(config.validate().is_empty());
    }

    #[test]
    fn zero_caps_rejected() {
        let mut broker = BrokerConfig::default();
        broker.max_global_sessions = 0;
        let config = Config {
            listen: default_listen(),
            log_level: default_log_level(),
            sweep_interval_seconds: default_sweep_interval(),
            health_cache_seconds: default_health_cache_seconds(),
            broker,
            sandbox: SandboxConfig::default(),
        };
        assert!(!config.validate().is_empty());
    }
}
