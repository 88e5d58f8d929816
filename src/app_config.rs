use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{
    CONFIG_DIR_ENV, DEFAULT_AGENT_TIMEOUT_SECS, DEFAULT_CONFIG_DIR, DEFAULT_CRITIC_TIMEOUT_SECS,
};
use crate::errors::ConfigurationError;
use crate::pipeline::catalog::StageCatalog;
use crate::qa::reflection::Limits;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub agent: CommandConfig,
    pub critic: CommandConfig,
    pub notifier: NotifierConfig,
}

impl AppConfig {
    /// `$REELRS_HOME/config.json`, else `.reelrs/config.json`.
    pub fn default_path() -> PathBuf {
        let dir = std::env::var_os(CONFIG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));
        dir.join(CONFIG_FILE)
    }

    pub fn load() -> Result<Self, ConfigurationError> {
        Self::load_at(&Self::default_path())
    }

    /// Missing file means defaults; a present but unreadable file is an error.
    pub fn load_at(path: &Path) -> Result<Self, ConfigurationError> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Everything a run needs. Fatal at startup when it fails.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.agent.validate("agent")?;
        self.critic.validate("critic")?;
        if let Some(url) = &self.notifier.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigurationError::InvalidWebhook(url.clone()));
            }
        }
        self.catalog()?;
        Ok(())
    }

    /// Built-in stage catalog, overlaid with `paths.stage_catalog` when set.
    pub fn catalog(&self) -> Result<StageCatalog, ConfigurationError> {
        match &self.paths.stage_catalog {
            Some(path) => StageCatalog::load(Path::new(path)),
            None => Ok(StageCatalog::default()),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            agent_timeout: self.agent.timeout(DEFAULT_AGENT_TIMEOUT_SECS),
            critic_timeout: self.critic.timeout(DEFAULT_CRITIC_TIMEOUT_SECS),
        }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.checkpoints)
    }

    pub fn event_log_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.event_log)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub checkpoints: String,
    pub event_log: String,
    pub stage_catalog: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoints: ".reelrs/checkpoints".to_string(),
            event_log: ".reelrs/logs".to_string(),
            stage_catalog: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Falls back to the per-section default when unset.
    pub timeout_seconds: Option<u64>,
}

impl CommandConfig {
    pub fn timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(default_secs))
    }

    fn validate(&self, section: &'static str) -> Result<(), ConfigurationError> {
        if self.program.trim().is_empty() {
            return Err(ConfigurationError::EmptyProgram { section });
        }
        if self.timeout_seconds == Some(0) {
            return Err(ConfigurationError::ZeroTimeout { section });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_at(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.paths.checkpoints, ".reelrs/checkpoints");
        assert_eq!(
            config.limits().agent_timeout,
            Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS)
        );
        assert_eq!(
            config.limits().critic_timeout,
            Duration::from_secs(DEFAULT_CRITIC_TIMEOUT_SECS)
        );
        assert!(config.notifier.webhook_url.is_none());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let file = write_config(
            r#"{"agent": {"program": "clip-agent", "args": ["--stage-mode"]},
                "critic": {"program": "clip-critic", "timeout_seconds": 60}}"#,
        );
        let config = AppConfig::load_at(file.path()).unwrap();
        assert_eq!(config.agent.args, vec!["--stage-mode".to_string()]);
        assert_eq!(
            config.limits().agent_timeout,
            Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS)
        );
        assert_eq!(config.limits().critic_timeout, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn empty_program_is_fatal() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::EmptyProgram { section: "agent" })
        ));
    }

    #[test]
    fn zero_timeout_is_fatal() {
        let file = write_config(
            r#"{"agent": {"program": "a"}, "critic": {"program": "c", "timeout_seconds": 0}}"#,
        );
        let config = AppConfig::load_at(file.path()).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::ZeroTimeout { section: "critic" })
        ));
    }

    #[test]
    fn bad_webhook_and_missing_catalog_are_fatal() {
        let mut config = AppConfig::default();
        config.agent.program = "a".into();
        config.critic.program = "c".into();
        config.notifier.webhook_url = Some("ftp://hooks".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidWebhook(_))
        ));

        config.notifier.webhook_url = None;
        config.paths.stage_catalog = Some("/nonexistent/stages.yaml".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::CatalogRead { .. })
        ));
    }

    #[test]
    fn malformed_json_is_reported() {
        let file = write_config("{ not json");
        assert!(matches!(
            AppConfig::load_at(file.path()),
            Err(ConfigurationError::Parse { .. })
        ));
    }
}
