//! Configuration loading and defaults for presenced.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// Where session idleness is read from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdleBackend {
    /// GNOME session manager `StatusChanged` signal (default).
    #[default]
    Gnome,
    /// Poll systemd-logind's `IdleHint`.
    Logind,
    /// Never detect idleness.
    None,
}

/// Main configuration for presenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Go away when the session becomes idle (default: true).
    pub auto_away: bool,

    /// Seconds idle before away escalates to extended away (default: 1800).
    pub ext_away_delay_seconds: u64,

    /// Follow network connectivity: go offline when the network drops and
    /// restore the previous presence when it returns (default: true).
    pub use_connectivity: bool,

    /// Source of session idle notifications.
    pub idle_backend: IdleBackend,

    /// Idle poll interval in seconds, logind only (default: 10).
    pub idle_check_interval_seconds: u64,

    /// Cancel a pending extended away when the user manually picks a
    /// non-away presence while idle (default: false).
    pub manual_change_cancels_ext_away: bool,

    /// Export the control interface on the session bus (default: true).
    pub control_interface: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_away: true,
            ext_away_delay_seconds: 30 * 60,
            use_connectivity: true,
            idle_backend: IdleBackend::default(),
            idle_check_interval_seconds: 10,
            manual_change_cancels_ext_away: false,
            control_interface: true,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        // Try default config path
        if let Some(config_dir) = dirs::config_dir() {
            let default_path = config_dir.join("presenced").join("config.toml");
            if default_path.exists() {
                return Self::load(&default_path);
            }
        }

        Ok(Self::default())
    }

    /// Delay before away escalates to extended away.
    pub fn ext_away_delay(&self) -> Duration {
        Duration::from_secs(self.ext_away_delay_seconds)
    }

    /// Logind poll interval, never shorter than a second.
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_seconds.max(1))
    }
}
