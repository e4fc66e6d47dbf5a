//! Configuration for the reshard phase engine.
//!
//! Settings are layered: `reshard.toml` → environment (`RESHARD_*`, after
//! loading `.env`) → CLI flags. Every field has a default, so an absent file
//! is equivalent to an empty one.
//!
//! # Configuration File Format
//!
//! ```toml
//! [watchdog]
//! stall_timeout_secs = 600
//! check_interval_ms = 1000
//! transport_timeout_secs = 300
//!
//! [restart]
//! retry_delay_secs = 15
//! max_attempts = 20
//! service = "electric-moray"
//!
//! [artifacts]
//! name = "manta-hash-ring"
//! plan_tag = "manta_reshard_plan"
//!
//! [templates]
//! dir = "/opt/reshard/templates"
//!
//! [progress]
//! bind = "127.0.0.1:0"
//! advertise_host = "10.0.0.5"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "reshard.toml";

/// Stall watchdog and remote execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Abort a remote step after this long without a progress message
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// How often the watchdog checks for a stall
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Transport budget for a single remote execution call
    #[serde(default = "default_transport_timeout_secs")]
    pub transport_timeout_secs: u64,
}

fn default_stall_timeout_secs() -> u64 {
    600
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_transport_timeout_secs() -> u64 {
    300
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: default_stall_timeout_secs(),
            check_interval_ms: default_check_interval_ms(),
            transport_timeout_secs: default_transport_timeout_secs(),
        }
    }
}

impl WatchdogConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }
}

/// Fleet restart settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Delay before retrying a failed instance
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Attempts per instance before the restart phase gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Routing-tier service whose instances are restarted
    #[serde(default = "default_service")]
    pub service: String,
}

fn default_retry_delay_secs() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    20
}

fn default_service() -> String {
    "electric-moray".to_string()
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay_secs(),
            max_attempts: default_max_attempts(),
            service: default_service(),
        }
    }
}

impl RestartConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Artifact repository naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Image name of hash ring artifacts
    #[serde(default = "default_artifact_name")]
    pub name: String,
    /// Tag carrying the owning plan id
    #[serde(default = "default_plan_tag")]
    pub plan_tag: String,
}

fn default_artifact_name() -> String {
    "manta-hash-ring".to_string()
}

fn default_plan_tag() -> String {
    "manta_reshard_plan".to_string()
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            name: default_artifact_name(),
            plan_tag: default_plan_tag(),
        }
    }
}

/// Script template location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplatesConfig {
    /// Directory whose templates override the embedded defaults
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Progress callback server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Address the progress server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Host placed in callback URLs when the bind address is not reachable
    /// from remote targets
    #[serde(default)]
    pub advertise_host: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:0".to_string()
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            advertise_host: None,
        }
    }
}

impl ProgressConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("Invalid progress bind address '{}'", self.bind))
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardConfig {
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
}

impl ReshardConfig {
    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse reshard configuration")
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load from `path` and apply `RESHARD_*` environment overrides.
    pub fn load_layered(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup. Split out from `load_layered` so the
    /// mapping can be exercised without touching the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .parse()
                .with_context(|| format!("Invalid value '{}' for {}", value, key))
        }

        if let Some(v) = lookup("RESHARD_STALL_TIMEOUT_SECS") {
            self.watchdog.stall_timeout_secs = parsed("RESHARD_STALL_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("RESHARD_TRANSPORT_TIMEOUT_SECS") {
            self.watchdog.transport_timeout_secs = parsed("RESHARD_TRANSPORT_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("RESHARD_RETRY_DELAY_SECS") {
            self.restart.retry_delay_secs = parsed("RESHARD_RETRY_DELAY_SECS", v)?;
        }
        if let Some(v) = lookup("RESHARD_MAX_ATTEMPTS") {
            self.restart.max_attempts = parsed("RESHARD_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("RESHARD_SERVICE") {
            self.restart.service = v;
        }
        if let Some(v) = lookup("RESHARD_TEMPLATE_DIR") {
            self.templates.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RESHARD_PROGRESS_BIND") {
            self.progress.bind = v;
        }
        if let Some(v) = lookup("RESHARD_ADVERTISE_HOST") {
            self.progress.advertise_host = Some(v);
        }
        Ok(())
    }

    /// Check for values that would make the engine misbehave.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.restart.max_attempts == 0 {
            warnings.push("restart.max_attempts is 0; no instance would ever be restarted".to_string());
        }
        if self.watchdog.stall_timeout_secs == 0 {
            warnings.push("watchdog.stall_timeout_secs is 0; every remote step would stall immediately".to_string());
        }
        if self.progress.bind_addr().is_err() {
            warnings.push(format!("progress.bind '{}' is not a socket address", self.progress.bind));
        }
        warnings
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
