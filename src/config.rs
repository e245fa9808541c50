//! Configuration loader and validator for the listing sync service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub gbp: Gbp,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
}

/// Google Business Profile API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gbp {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub account_api_base: String,
    pub business_info_api_base: String,
    pub page_size: u32,
    pub timeout_seconds: u64,
}

/// Reconciliation behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    /// Fall back to display-name matching for listings not yet linked to a
    /// Business Profile location. Kept for rows created before linking existed.
    pub match_display_name: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            match_display_name: true,
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// SQLite URL used when `DATABASE_URL` is not set.
    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/gbp-sync.db", self.app.resolved_data_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.bind_addr must be a socket address"));
    }

    if cfg.gbp.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("gbp.client_id must be non-empty"));
    }
    if cfg.gbp.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("gbp.client_secret must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.gbp.token_url).is_err() {
        return Err(ConfigError::Invalid("gbp.token_url must be a valid URL"));
    }
    if reqwest::Url::parse(&cfg.gbp.account_api_base).is_err() {
        return Err(ConfigError::Invalid("gbp.account_api_base must be a valid URL"));
    }
    if reqwest::Url::parse(&cfg.gbp.business_info_api_base).is_err() {
        return Err(ConfigError::Invalid(
            "gbp.business_info_api_base must be a valid URL",
        ));
    }
    if cfg.gbp.page_size == 0 || cfg.gbp.page_size > 100 {
        return Err(ConfigError::Invalid("gbp.page_size must be within 1..=100"));
    }
    if cfg.gbp.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("gbp.timeout_seconds must be > 0"));
    }

    Ok(())
}

/// Example configuration, also used as the test fixture.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "127.0.0.1:8080"

gbp:
  client_id: "YOUR_OAUTH_CLIENT_ID"
  client_secret: "YOUR_OAUTH_CLIENT_SECRET"
  token_url: "https://oauth2.googleapis.com/token"
  account_api_base: "https://mybusinessaccountmanagement.googleapis.com/"
  business_info_api_base: "https://mybusinessbusinessinformation.googleapis.com/"
  page_size: 100
  timeout_seconds: 30

sync:
  match_display_name: true
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_config() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_config();
        validate(&cfg).unwrap();
        assert!(cfg.sync.match_display_name);
    }

    #[test]
    fn sync_section_defaults_when_absent() {
        let trimmed = example().split("sync:").next().unwrap();
        let cfg: Config = serde_yaml::from_str(trimmed).unwrap();
        assert_eq!(cfg.sync, SyncSettings::default());
    }

    #[test]
    fn invalid_bind_addr() {
        let mut cfg = example_config();
        cfg.app.bind_addr = "localhost".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("bind_addr")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_credentials() {
        let mut cfg = example_config();
        cfg.gbp.client_id = " ".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("client_id")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_config();
        cfg.gbp.client_secret = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_api_settings() {
        let mut cfg = example_config();
        cfg.gbp.token_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_config();
        cfg.gbp.page_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_config();
        cfg.gbp.page_size = 500;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_config();
        cfg.gbp.timeout_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_config();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(cfg.default_database_url().ends_with("/data/gbp-sync.db"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.gbp.page_size, 100);
    }
}
