use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::SessionIdentity;
use crate::oauth::DelegatedCredential;

const DEFAULT_ENV_PREFIX: &str = "PERCH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn credential(&self) -> DelegatedCredential {
        DelegatedCredential::new(
            self.account.consumer_key.clone(),
            self.account.consumer_secret.clone(),
            self.account.access_token.clone(),
            self.account.access_secret.clone(),
        )
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            user_id: self.account.user_id,
            screen_name: self.account.screen_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AccountConfig {
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub access_secret: String,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub screen_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_api_timeout(),
        }
    }
}

fn default_base_url() -> String {
    crate::api::DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("perch/{}", crate::VERSION)
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub imgur_client_id: String,
    #[serde(default)]
    pub mobypicture_api_key: String,
    #[serde(default = "default_upload_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            imgur_client_id: String::new(),
            mobypicture_api_key: String::new(),
            timeout: default_upload_timeout(),
        }
    }
}

fn default_backend() -> String {
    "imgur".into()
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(120)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "perch=info".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    let account = other.account;
    if !account.consumer_key.is_empty() {
        base.account.consumer_key = account.consumer_key;
    }
    if !account.consumer_secret.is_empty() {
        base.account.consumer_secret = account.consumer_secret;
    }
    if !account.access_token.is_empty() {
        base.account.access_token = account.access_token;
    }
    if !account.access_secret.is_empty() {
        base.account.access_secret = account.access_secret;
    }
    if account.user_id != 0 {
        base.account.user_id = account.user_id;
    }
    if !account.screen_name.is_empty() {
        base.account.screen_name = account.screen_name;
    }

    if !other.api.base_url.is_empty() {
        base.api.base_url = other.api.base_url;
    }
    if !other.api.user_agent.is_empty() {
        base.api.user_agent = other.api.user_agent;
    }
    base.api.timeout = other.api.timeout;

    if !other.upload.backend.is_empty() {
        base.upload.backend = other.upload.backend;
    }
    if !other.upload.imgur_client_id.is_empty() {
        base.upload.imgur_client_id = other.upload.imgur_client_id;
    }
    if !other.upload.mobypicture_api_key.is_empty() {
        base.upload.mobypicture_api_key = other.upload.mobypicture_api_key;
    }
    base.upload.timeout = other.upload.timeout;

    if !other.log.filter.is_empty() {
        base.log.filter = other.log.filter;
    }

    base
}

/// Applies `PREFIX_SECTION__KEY=value` variables on top of `cfg`.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "account.consumer_key" => cfg.account.consumer_key = value,
        "account.consumer_secret" => cfg.account.consumer_secret = value,
        "account.access_token" => cfg.account.access_token = value,
        "account.access_secret" => cfg.account.access_secret = value,
        "account.user_id" => {
            if let Ok(parsed) = value.parse::<u64>() {
                cfg.account.user_id = parsed;
            }
        }
        "account.screen_name" => cfg.account.screen_name = value,
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.api.timeout = duration;
            }
        }
        "upload.backend" => cfg.upload.backend = value.trim().to_ascii_lowercase(),
        "upload.imgur_client_id" => cfg.upload.imgur_client_id = value,
        "upload.mobypicture_api_key" => cfg.upload.mobypicture_api_key = value,
        "upload.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.upload.timeout = duration;
            }
        }
        "log.filter" => cfg.log.filter = value,
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("perch").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn isolated(prefix: &str) -> LoadOptions {
        LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/perch.yaml")),
            env_prefix: Some(prefix.into()),
        }
    }

    #[test]
    fn load_defaults_without_files() {
        let cfg = load(isolated("PERCH_TEST_DEFAULTS")).unwrap();
        assert_eq!(cfg.upload.backend, "imgur");
        assert_eq!(cfg.api.base_url, crate::api::DEFAULT_BASE_URL);
        assert_eq!(cfg.api.timeout, Duration::from_secs(20));
        assert!(cfg.api.user_agent.starts_with("perch/"));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "account:\n  consumer_key: ck\n  consumer_secret: cs\n  access_token: at\n  access_secret: as\n  user_id: 42\n  screen_name: perch\nupload:\n  backend: mobypicture\n  timeout: 30s\n",
        )
        .unwrap();

        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("PERCH_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.upload.backend, "mobypicture");
        assert_eq!(cfg.upload.timeout, Duration::from_secs(30));
        assert_eq!(cfg.identity().user_id, 42);
        assert!(cfg.credential().validate().is_ok());
        assert_eq!(cfg.credential().consumer_key(), "ck");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "upload: [not, a, map").unwrap();
        let err = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("PERCH_TEST_BAD".into()),
        })
        .unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn env_overrides() {
        env::set_var("PERCH_TEST_ENV_UPLOAD__BACKEND", "MobyPicture");
        env::set_var("PERCH_TEST_ENV_API__TIMEOUT", "5s");
        env::set_var("PERCH_TEST_ENV_ACCOUNT__USER_ID", "not-a-number");
        let cfg = load(isolated("PERCH_TEST_ENV")).unwrap();
        assert_eq!(cfg.upload.backend, "mobypicture");
        assert_eq!(cfg.api.timeout, Duration::from_secs(5));
        assert_eq!(cfg.account.user_id, 0);
        env::remove_var("PERCH_TEST_ENV_UPLOAD__BACKEND");
        env::remove_var("PERCH_TEST_ENV_API__TIMEOUT");
        env::remove_var("PERCH_TEST_ENV_ACCOUNT__USER_ID");
    }
}
