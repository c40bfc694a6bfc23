//! Persistent settings
//!
//! Tunables for format negotiation, linking and Bluetooth profile switching.
//! Stored as pretty-printed JSON under the user's config directory; any
//! missing field falls back to its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Used for DSP port configuration when the server does not advertise
    /// `default.clock.rate`
    pub default_clock_rate: u32,
    /// Channel preference for adapters configured with `preferred.n.channels = 0`
    pub channels_preference: u32,
    /// Minimum time between two Bluetooth profile switches
    pub profile_switch_cooldown_ms: u64,
    /// Value written to `link.passive` on created links
    pub passive_links: bool,
    /// Value written to `object.linger` on created links
    pub link_linger: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_clock_rate: 48000,
            channels_preference: 34,
            profile_switch_cooldown_ms: 1000,
            passive_links: true,
            link_linger: false,
        }
    }
}

impl Settings {
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sessionbay").join("settings.json"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => {
                log::debug!("No config directory, using default settings");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                log::debug!("Settings {}: {}, using defaults", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str::<Settings>(&text) {
            Ok(settings) => {
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                log::warn!("Settings {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn profile_switch_cooldown(&self) -> Duration {
        Duration::from_millis(self.profile_switch_cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "default_clock_rate": 44100 }"#).unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.default_clock_rate, 44100);
        assert_eq!(settings.channels_preference, 34);
        assert!(settings.passive_links);
    }

    #[test]
    fn test_missing_or_broken_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert_eq!(Settings::load_from(&missing), Settings::default());

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert_eq!(Settings::load_from(&broken), Settings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            profile_switch_cooldown_ms: 250,
            link_linger: true,
            ..Settings::default()
        };
        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path);
        assert_eq!(loaded, settings);
        assert_eq!(loaded.profile_switch_cooldown(), Duration::from_millis(250));
    }
}
