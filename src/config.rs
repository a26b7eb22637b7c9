use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api;

const DEFAULT_ENV_PREFIX: &str = "MURMUR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: String::new(),
            timeout: default_timeout(),
        }
    }
}

impl ApiConfig {
    pub fn client_config(&self) -> api::ClientConfig {
        api::ClientConfig {
            base_url: Some(self.base_url.clone()),
            user_agent: self.user_agent.clone(),
            timeout: Some(self.timeout),
            http_client: None,
        }
    }
}

fn default_base_url() -> String {
    api::DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_initial_pages")]
    pub initial_pages: u32,
    #[serde(default = "default_wait_timeout", with = "humantime_serde")]
    pub wait_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            initial_pages: default_initial_pages(),
            wait_timeout: default_wait_timeout(),
        }
    }
}

fn default_initial_pages() -> u32 {
    1
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => crate::storage::default_path()
                .context("config: unable to determine default storage path"),
        }
    }
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
    if !other.api.base_url.trim().is_empty() {
        base.api.base_url = other.api.base_url;
    }
    if !other.api.user_agent.trim().is_empty() {
        base.api.user_agent = other.api.user_agent;
    }
    if !other.api.timeout.is_zero() {
        base.api.timeout = other.api.timeout;
    }

    if other.feed.initial_pages != 0 {
        base.feed.initial_pages = other.feed.initial_pages;
    }
    if !other.feed.wait_timeout.is_zero() {
        base.feed.wait_timeout = other.feed.wait_timeout;
    }

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    base
}

// Applied on top of the merged file so an unset variable never resets a
// value the file chose.
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
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.api.timeout = duration;
            }
        }
        "feed.initial_pages" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.feed.initial_pages = parsed;
            }
        }
        "feed.wait_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.feed.wait_timeout = duration;
            }
        }
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("murmur").join("config.yaml"))
}

/// Writes `base_url` into the config file, keeping everything else in it.
pub fn save_base_url(path: Option<PathBuf>, base_url: &str) -> Result<PathBuf> {
    let base_url = base_url.trim();
    anyhow::ensure!(!base_url.is_empty(), "config: api.base_url is required");
    url::Url::parse(base_url)
        .with_context(|| format!("config: api.base_url is not a valid url: {base_url}"))?;

    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };
    cfg.api.base_url = base_url.to_string();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    fn isolated(prefix: &str, dir: &Path) -> LoadOptions {
        LoadOptions {
            config_file: Some(dir.join("missing.yaml")),
            env_prefix: Some(prefix.to_string()),
        }
    }

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let cfg = load(isolated("MURMUR_TEST_DEFAULTS", dir.path())).unwrap();
        assert_eq!(cfg.api.base_url, api::DEFAULT_BASE_URL);
        assert_eq!(cfg.api.timeout, Duration::from_secs(20));
        assert_eq!(cfg.feed.initial_pages, 1);
        assert_eq!(cfg.feed.wait_timeout, Duration::from_secs(10));
        assert!(cfg.storage.path.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "api:\n  base_url: https://murmur.example/api\n  timeout: 5s\nfeed:\n  initial_pages: 3\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("MURMUR_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.api.base_url, "https://murmur.example/api");
        assert_eq!(cfg.api.timeout, Duration::from_secs(5));
        assert_eq!(cfg.feed.initial_pages, 3);
        assert_eq!(cfg.feed.wait_timeout, Duration::from_secs(10));
    }

    #[test]
    fn save_base_url_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        save_base_url(Some(path.clone()), "https://murmur.example/api/").unwrap();
        let saved = read_config_file(&path).unwrap();
        assert_eq!(saved.api.base_url, "https://murmur.example/api/");
        assert!(save_base_url(Some(path), "not a url").is_err());
    }

    #[test]
    fn env_overrides() {
        let dir = tempdir().unwrap();
        env::set_var("MURMUR_TEST_ENV_FEED__INITIAL_PAGES", "4");
        env::set_var("MURMUR_TEST_ENV_API__TIMEOUT", "750ms");
        let cfg = load(isolated("MURMUR_TEST_ENV", dir.path())).unwrap();
        assert_eq!(cfg.feed.initial_pages, 4);
        assert_eq!(cfg.api.timeout, Duration::from_millis(750));
        env::remove_var("MURMUR_TEST_ENV_FEED__INITIAL_PAGES");
        env::remove_var("MURMUR_TEST_ENV_API__TIMEOUT");
    }
}
