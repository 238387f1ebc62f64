use crate::services::{DeliveryMode, VoiceMode};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApiSettings {
    #[serde(rename = "BaseUrl", default = "default_base_url")]
    pub base_url: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(rename = "ApiSettings", default)]
    pub api: ApiSettings,

    /// Upper bound for one call, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub recordings_dir: Option<PathBuf>,

    #[serde(default)]
    pub voice_mode: VoiceMode,

    #[serde(default)]
    pub delivery: DeliveryMode,
}

fn default_base_url() -> String {
    "http://localhost:7860".to_string()
}

fn default_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            timeout: default_timeout(),
            recordings_dir: None,
            voice_mode: VoiceMode::default(),
            delivery: DeliveryMode::default(),
        }
    }
}

impl Config {
    /// Load configuration, writing defaults if the file is missing or unusable
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config = match serde_json::from_str::<Self>(&contents) {
            Ok(config) if !config.api.base_url.trim().is_empty() => config,
            Ok(_) => {
                tracing::warn!("No API URL in {:?}, writing default config", config_path);
                let config = Self::default();
                config.save_to(config_path)?;
                config
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config file {:?} ({}), writing default config",
                    config_path,
                    e
                );
                let config = Self::default();
                config.save_to(config_path)?;
                config
            }
        };

        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    /// Save configuration to the given location
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Rewrite `ApiSettings.BaseUrl` in place, keeping every other key in the file
    pub fn update_base_url(config_path: &Path, base_url: &str) -> Result<()> {
        if !config_path.exists() {
            Self::default().save_to(config_path)?;
        }

        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let mut root = match serde_json::from_str::<serde_json::Value>(&contents) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            _ => serde_json::Value::Object(Default::default()),
        };

        if !root["ApiSettings"].is_object() {
            root["ApiSettings"] = serde_json::json!({});
        }
        root["ApiSettings"]["BaseUrl"] = serde_json::Value::String(base_url.to_string());

        let contents = serde_json::to_string_pretty(&root).context("Failed to serialize config")?;
        std::fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("API URL updated to {}", base_url);
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("voxask").join("config.json"))
    }

    /// Where recordings are written
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("voxask"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_base_url(&self.api.base_url)?;

        if self.timeout == 0 {
            return Err(anyhow::anyhow!("timeout must be greater than zero"));
        }

        Ok(())
    }
}

pub fn validate_base_url(base_url: &str) -> Result<()> {
    let base_url = base_url.trim();
    if base_url.is_empty() {
        return Err(anyhow::anyhow!("API URL cannot be empty"));
    }

    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(anyhow::anyhow!(
            "API URL must start with http:// or https://"
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voxask").join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.api.base_url, "http://localhost:7860");

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["ApiSettings"]["BaseUrl"], "http://localhost:7860");
    }

    #[test]
    fn unparsable_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(serde_json::from_str::<Config>(&std::fs::read_to_string(&path).unwrap()).is_ok());
    }

    #[test]
    fn empty_base_url_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"ApiSettings":{"BaseUrl":""}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api.base_url, "http://localhost:7860");
    }

    #[test]
    fn reads_existing_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"ApiSettings":{"BaseUrl":"http://assistant:8000"},"timeout":5,"voice_mode":"transcribe_and_respond","delivery":"immediate"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api.base_url, "http://assistant:8000");
        assert_eq!(config.timeout, 5);
        assert_eq!(config.voice_mode, VoiceMode::TranscribeAndRespond);
        assert_eq!(config.delivery, DeliveryMode::Immediate);
    }

    #[test]
    fn update_preserves_other_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"ApiSettings":{"BaseUrl":"http://old:1","ApiKey":"keep"},"Logging":{"Level":"Debug"},"timeout":9}"#,
        )
        .unwrap();

        Config::update_base_url(&path, "http://new:2").unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["ApiSettings"]["BaseUrl"], "http://new:2");
        assert_eq!(written["ApiSettings"]["ApiKey"], "keep");
        assert_eq!(written["Logging"]["Level"], "Debug");
        assert_eq!(written["timeout"], 9);

        assert_eq!(Config::load_from(&path).unwrap().api.base_url, "http://new:2");
    }

    #[test]
    fn update_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        Config::update_base_url(&path, "http://new:2").unwrap();
        assert_eq!(Config::load_from(&path).unwrap().api.base_url, "http://new:2");
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.api.base_url = "localhost:7860".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timeout = 0;
        assert!(config.validate().is_err());
    }
}
