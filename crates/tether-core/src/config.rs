//! Harness timing configuration.
//!
//! Resolution chain: explicit value > env var > config file > default.
//! The config file lives at `$XDG_CONFIG_HOME/tether/config.toml` (or
//! `~/.config/tether/config.toml`) and only needs the keys it overrides:
//!
//! ```toml
//! [harness]
//! poll_interval_ms = 100
//! deadline_ms = 10000
//! grace_period_ms = 5000
//! probe_timeout_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const ENV_POLL_INTERVAL_MS: &str = "TETHER_POLL_INTERVAL_MS";
pub const ENV_DEADLINE_MS: &str = "TETHER_DEADLINE_MS";
pub const ENV_GRACE_PERIOD_MS: &str = "TETHER_GRACE_PERIOD_MS";
pub const ENV_PROBE_TIMEOUT_MS: &str = "TETHER_PROBE_TIMEOUT_MS";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub harness: HarnessSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HarnessSection {
    pub poll_interval_ms: Option<u64>,
    pub deadline_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// `$XDG_CONFIG_HOME/tether`, or `~/.config/tether`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tether");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tether")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load a config file. A missing file is `Ok(None)`; an unreadable or
/// malformed one is an error.
pub fn load_config_file(path: &Path) -> Result<Option<ConfigFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Timing knobs shared by every acquisition of a harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Pause between two probe invocations.
    pub poll_interval: Duration,
    /// Total time the subordinate gets to become ready.
    pub deadline: Duration,
    /// How long a SIGTERM-ed subordinate may take to exit before SIGKILL.
    pub grace_period: Duration,
    /// Per-request timeout for network probes.
    pub probe_timeout: Duration,
}

impl HarnessConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

    /// Resolve from the process environment and the default config file.
    pub fn from_env() -> Result<Self> {
        let file = load_config_file(&config_path())?;
        Self::resolve(file.as_ref(), |key| std::env::var(key).ok())
    }

    /// Resolve from an explicit config file (may be absent) and an env
    /// lookup function.
    pub fn resolve<F>(file: Option<&ConfigFile>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = file.map(|f| &f.harness);

        let pick = |key: &str, from_file: Option<u64>, default: Duration| -> Result<Duration> {
            if let Some(raw) = env(key) {
                let ms: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a number of milliseconds, got {raw:?}"))?;
                return Ok(Duration::from_millis(ms));
            }
            Ok(from_file.map(Duration::from_millis).unwrap_or(default))
        };

        let config = Self {
            poll_interval: pick(
                ENV_POLL_INTERVAL_MS,
                section.and_then(|s| s.poll_interval_ms),
                Self::DEFAULT_POLL_INTERVAL,
            )?,
            deadline: pick(
                ENV_DEADLINE_MS,
                section.and_then(|s| s.deadline_ms),
                Self::DEFAULT_DEADLINE,
            )?,
            grace_period: pick(
                ENV_GRACE_PERIOD_MS,
                section.and_then(|s| s.grace_period_ms),
                Self::DEFAULT_GRACE_PERIOD,
            )?,
            probe_timeout: pick(
                ENV_PROBE_TIMEOUT_MS,
                section.and_then(|s| s.probe_timeout_ms),
                Self::DEFAULT_PROBE_TIMEOUT,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }
        if self.deadline.is_zero() {
            bail!("readiness deadline must be greater than zero");
        }
        if self.probe_timeout.is_zero() {
            bail!("probe timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            deadline: Self::DEFAULT_DEADLINE,
            grace_period: Self::DEFAULT_GRACE_PERIOD,
            probe_timeout: Self::DEFAULT_PROBE_TIMEOUT,
        }
    }
}
