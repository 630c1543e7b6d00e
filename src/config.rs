//! Firewall configuration: a validated TOML file with environment-variable
//! overrides, and a shared handle supporting hot-reload.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use validator::Validate;

use crate::firewall::patterns::EMAIL_EXPOSURE_THRESHOLD;
use crate::firewall::reputation::StrikePolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FirewallConfig {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub rate_limit_requests: u64,
    #[validate(range(min = 1))]
    pub rate_limit_window_secs: u64,
    #[validate(range(min = 1))]
    pub max_strikes: u64,
    #[validate(range(min = 1))]
    pub ban_duration_secs: u64,
    /// Strike decay: how long strikes persist without a new violation.
    /// Defaults to the ban duration when unset.
    pub strike_ttl_secs: Option<u64>,
    pub pattern_detection_enabled: bool,
    pub data_leak_detection_enabled: bool,
    #[validate(range(min = 1))]
    pub email_exposure_threshold: usize,
    pub excluded_path_prefixes: Vec<String>,
    pub security_log_path: PathBuf,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit_requests: 200,
            rate_limit_window_secs: 60,
            max_strikes: 5,
            ban_duration_secs: 900,
            strike_ttl_secs: None,
            pattern_detection_enabled: true,
            data_leak_detection_enabled: true,
            email_exposure_threshold: EMAIL_EXPOSURE_THRESHOLD,
            excluded_path_prefixes: vec![
                "/static/".to_string(),
                "/media/".to_string(),
                "/favicon.ico".to_string(),
                "/health".to_string(),
                "/metrics".to_string(),
            ],
            security_log_path: PathBuf::from("logs/security.log"),
        }
    }
}

impl FirewallConfig {
    /// Load from a TOML file (when present), apply `WAF_*` environment
    /// overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config
            .validate()
            .context("firewall configuration failed validation")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        env_bool("WAF_ENABLED", &mut self.enabled);
        env_u64("WAF_RATE_LIMIT_REQUESTS", &mut self.rate_limit_requests);
        env_u64("WAF_RATE_LIMIT_WINDOW", &mut self.rate_limit_window_secs);
        env_u64("WAF_MAX_STRIKES", &mut self.max_strikes);
        env_u64("WAF_BAN_DURATION", &mut self.ban_duration_secs);
        env_bool("WAF_PATTERN_DETECTION", &mut self.pattern_detection_enabled);
        env_bool(
            "WAF_DATA_LEAK_DETECTION",
            &mut self.data_leak_detection_enabled,
        );
        if let Ok(paths) = std::env::var("WAF_EXCLUDED_PATHS") {
            self.excluded_path_prefixes = paths
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Ok(path) = std::env::var("WAF_LOG_PATH") {
            self.security_log_path = PathBuf::from(path);
        }
    }

    pub fn is_path_excluded(&self, path: &str) -> bool {
        self.excluded_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn strike_policy(&self) -> StrikePolicy {
        StrikePolicy {
            max_strikes: self.max_strikes,
            ban_duration_secs: self.ban_duration_secs,
            strike_ttl_secs: self.strike_ttl_secs.unwrap_or(self.ban_duration_secs),
        }
    }
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(raw) = std::env::var(name) {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" => *target = false,
            _ => tracing::warn!(var = name, value = raw, "ignoring unparseable boolean"),
        }
    }
}

fn env_u64(name: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(var = name, value = raw, "ignoring unparseable integer"),
        }
    }
}

/// Shared current-config accessor. Request handlers take a short read lock
/// and clone; the reload task is the only writer.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<FirewallConfig>>,
}

impl ConfigHandle {
    pub fn new(config: FirewallConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub async fn current(&self) -> FirewallConfig {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, config: FirewallConfig) {
        *self.inner.write().await = config;
    }
}

/// Watch the config file and reload on change. A reload that fails to parse
/// or validate is logged and discarded, keeping the last good config. The
/// returned watcher must be kept alive for the life of the process.
pub fn spawn_reload_watcher(handle: ConfigHandle, path: PathBuf) -> Result<RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(8);

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            if event.kind.is_modify() || event.kind.is_create() {
                let _ = tx.try_send(());
            }
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match FirewallConfig::load(Some(&path)) {
                Ok(config) => {
                    handle.replace(config).await;
                    tracing::info!(path = %path.display(), "firewall configuration reloaded");
                }
                Err(e) => {
                    tracing::error!(error = %e, "config reload failed, keeping previous config");
                }
            }
        }
    });

    Ok(watcher)
}
