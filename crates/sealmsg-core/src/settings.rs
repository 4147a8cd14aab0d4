use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SettingsError;

pub const SETTINGS_FILE: &str = "settings.json";

/// Ceiling for `max_hide_after_secs`: one year.
pub const HIDE_AFTER_CEILING_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    /// Period of the expiry sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    /// Inactivity before the hidden section relocks. 0 disables.
    #[serde(default = "default_auto_lock")]
    pub hidden_auto_lock_secs: u64,
    /// Longest hide timer a sender may set.
    #[serde(default = "default_max_hide_after")]
    pub max_hide_after_secs: u64,
    #[serde(default = "default_event_log_max_bytes")]
    pub event_log_max_bytes: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval(),
            hidden_auto_lock_secs: default_auto_lock(),
            max_hide_after_secs: default_max_hide_after(),
            event_log_max_bytes: default_event_log_max_bytes(),
        }
    }
}

impl EngineSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn max_hide_after(&self) -> Duration {
        Duration::from_secs(self.max_hide_after_secs)
    }

    pub fn hidden_auto_lock(&self) -> Option<Duration> {
        (self.hidden_auto_lock_secs > 0).then(|| Duration::from_secs(self.hidden_auto_lock_secs))
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(10..=60_000).contains(&self.sweep_interval_ms) {
            return Err(SettingsError::Invalid(
                "sweep interval must be between 10 ms and 60 s".into(),
            ));
        }
        if !(1..=HIDE_AFTER_CEILING_SECS).contains(&self.max_hide_after_secs) {
            return Err(SettingsError::Invalid(
                "maximum hide delay must be between one second and one year".into(),
            ));
        }
        if self.event_log_max_bytes < 4096 {
            return Err(SettingsError::Invalid(
                "event log rotation size must be at least 4 KiB".into(),
            ));
        }
        Ok(())
    }
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_auto_lock() -> u64 {
    300
}

fn default_max_hide_after() -> u64 {
    24 * 60 * 60
}

fn default_event_log_max_bytes() -> u64 {
    5 * 1024 * 1024
}

/// Read `settings.json` from `dir`; a missing file yields the defaults.
pub fn load_settings(dir: &Path) -> Result<EngineSettings, SettingsError> {
    let path = dir.join(SETTINGS_FILE);
    if !path.exists() {
        return Ok(EngineSettings::default());
    }
    let data = std::fs::read(&path)?;
    let settings: EngineSettings = serde_json::from_slice(&data)?;
    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(dir: &Path, settings: &EngineSettings) -> Result<(), SettingsError> {
    settings.validate()?;
    let data = serde_json::to_vec_pretty(settings)?;
    std::fs::write(dir.join(SETTINGS_FILE), data)?;
    Ok(())
}

/// Render a hide delay the way the timer picker labels it: `45s`, `5m`,
/// `3h`, `2d`.
pub fn format_hide_timer(delay: Duration) -> String {
    let ms = delay.as_millis() as f64;
    if ms < 60_000.0 {
        format!("{}s", (ms / 1000.0).round())
    } else if ms < 3_600_000.0 {
        format!("{}m", (ms / 60_000.0).round())
    } else if ms < 86_400_000.0 {
        format!("{}h", (ms / 3_600_000.0).round())
    } else {
        format!("{}d", (ms / 86_400_000.0).round())
    }
}
