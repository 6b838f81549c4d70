//! Configuration loading.
//!
//! Strongly-typed settings loaded with Figment from a TOML file plus
//! environment-variable overrides (prefixed `SAXS_CTRL_`, sections
//! separated with `__`, e.g. `SAXS_CTRL_EXPOSURE__IMAGE_TIMEOUT_SECS=5`).
//! Every field has a default, so a missing file yields a usable
//! configuration.

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default configuration file path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Top-level application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Exposure sequencing settings.
    #[serde(default)]
    pub exposure: ExposureSettings,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name, used in log output.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Timing knobs of the exposure sequencing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureSettings {
    /// Grace period after a frame's nominal end time to locate its image.
    #[serde(default = "default_image_timeout")]
    pub image_timeout_secs: f64,
    /// Period between image-lookup attempts while waiting for a frame.
    #[serde(default = "default_image_poll")]
    pub image_poll_secs: f64,
    /// Period of the batch progress report.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: f64,
    /// Inter-frame delay used when a request does not specify one. Must
    /// cover the detector readout time.
    #[serde(default = "default_frame_delay")]
    pub default_delay_secs: f64,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            image_timeout_secs: default_image_timeout(),
            image_poll_secs: default_image_poll(),
            progress_interval_secs: default_progress_interval(),
            default_delay_secs: default_frame_delay(),
        }
    }
}

impl ExposureSettings {
    /// Progress report period as a [`Duration`].
    pub fn progress_period(&self) -> Duration {
        Duration::from_secs_f64(self.progress_interval_secs)
    }
}

fn default_app_name() -> String {
    "saxs-ctrl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_image_timeout() -> f64 {
    2.0
}

fn default_image_poll() -> f64 {
    0.1
}

fn default_progress_interval() -> f64 {
    0.5
}

fn default_frame_delay() -> f64 {
    0.003
}

impl Settings {
    /// Loads settings from the default file and environment overrides.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads settings from a specific file path plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SAXS_CTRL_").split("__"))
            .extract()
    }

    /// Validates settings after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        let exposure = &self.exposure;
        for (name, value) in [
            ("image_timeout_secs", exposure.image_timeout_secs),
            ("image_poll_secs", exposure.image_poll_secs),
            ("progress_interval_secs", exposure.progress_interval_secs),
        ] {
            if value <= 0.0 || value.is_nan() {
                return Err(format!("{name} must be positive, got {value}"));
            }
        }
        if exposure.default_delay_secs < 0.0 {
            return Err(format!(
                "default_delay_secs must not be negative, got {}",
                exposure.default_delay_secs
            ));
        }
        if exposure.image_poll_secs >= exposure.image_timeout_secs {
            return Err(
                "image_poll_secs must be shorter than image_timeout_secs".to_string(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.exposure.image_timeout_secs, 2.0);
        assert_eq!(settings.exposure.image_poll_secs, 0.1);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.application.log_level, "info");
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[exposure]\nimage_timeout_secs = 5.0\n\n[application]\nlog_level = \"debug\""
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.exposure.image_timeout_secs, 5.0);
        assert_eq!(settings.application.log_level, "debug");
        // Untouched fields keep their defaults.
        assert_eq!(settings.exposure.image_poll_secs, 0.1);
    }

    #[test]
    fn invalid_values_fail_validation() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.exposure.image_timeout_secs = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.exposure.image_poll_secs = 3.0;
        assert!(settings.validate().is_err());
    }
}
