//! Configuration for trainflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TRAINFLOW_HOME, TRAINFLOW_WEBHOOK_URL,
//!    TRAINFLOW_TELEGRAM_TOKEN, TRAINFLOW_TELEGRAM_CHAT_ID)
//! 2. Config file (.trainflow/config.yaml)
//! 3. Defaults (~/.trainflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .trainflow/config.yaml
//! - Paths in config file are relative to the .trainflow/ directory

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{TelegramConfig, TelegramSubscriber, WebhookSubscriber};
use crate::notify::{LogSubscriber, Topic};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".trainflow";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .trainflow/)
    pub home: Option<String>,
    /// Directory searched for `<name>.yaml` workflow files
    pub workflows: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub max_inline_wait_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub telegram: Option<TelegramConfig>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to trainflow home (run state)
    pub home: PathBuf,
    /// Directory holding workflow definitions
    pub workflows: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub executor: ExecutorSettingsConfig,
    pub notify: NotifySettings,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettingsConfig {
    pub max_inline_wait_seconds: u64,
}

impl Default for ExecutorSettingsConfig {
    fn default() -> Self {
        Self {
            max_inline_wait_seconds: 300,
        }
    }
}

/// Where outcome notifications go, beyond the log
#[derive(Debug, Clone, Default)]
pub struct NotifySettings {
    pub webhook_url: Option<String>,
    pub telegram: Option<TelegramConfig>,
}

impl NotifySettings {
    /// Topic with the log subscriber plus every configured destination
    pub fn topic(&self, name: &str) -> Topic {
        let mut topic = Topic::new(name).subscribe(Arc::new(LogSubscriber));

        if let Some(ref url) = self.webhook_url {
            topic = topic.subscribe(Arc::new(WebhookSubscriber::new(url.clone())));
        }
        if let Some(ref telegram) = self.telegram {
            topic = topic.subscribe(Arc::new(TelegramSubscriber::from_config(telegram.clone())));
        }

        topic
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Merge a parsed config file (if any) with environment and defaults
fn resolve(
    file: Option<(&Path, ConfigFile)>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_dir, file) = match file {
        Some((path, file)) => (path.parent().map(Path::to_path_buf), file),
        None => (None, ConfigFile::default()),
    };

    let home = env_var("TRAINFLOW_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            let dir = config_dir.as_deref()?;
            file.paths.home.as_deref().map(|p| resolve_path(dir, p))
        })
        .unwrap_or(default_home);

    let workflows = match (config_dir.as_deref(), file.paths.workflows.as_deref()) {
        (Some(dir), Some(p)) => resolve_path(dir, p),
        _ => PathBuf::from("workflows"),
    };

    let executor = ExecutorSettingsConfig {
        max_inline_wait_seconds: file
            .executor
            .as_ref()
            .and_then(|e| e.max_inline_wait_seconds)
            .unwrap_or(300),
    };

    let notify_file = file.notify.unwrap_or_default();
    let telegram = match (
        env_var("TRAINFLOW_TELEGRAM_TOKEN"),
        env_var("TRAINFLOW_TELEGRAM_CHAT_ID"),
    ) {
        (Some(bot_token), Some(chat_id)) => Some(TelegramConfig { bot_token, chat_id }),
        _ => notify_file.telegram,
    };
    let notify = NotifySettings {
        webhook_url: env_var("TRAINFLOW_WEBHOOK_URL").or(notify_file.webhook_url),
        telegram,
    };

    ResolvedConfig {
        home,
        workflows,
        config_file: None,
        executor,
        notify,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = find_config_file();
    let mut resolved = match config_file {
        Some(ref path) => {
            let file = load_config_file(path)?;
            resolve(Some((path, file)), default_home)
        }
        None => resolve(None, default_home),
    };
    resolved.config_file = config_file;

    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the runs directory ($TRAINFLOW_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}

/// Get the workflow definitions directory
pub fn workflows_dir() -> Result<PathBuf> {
    Ok(config()?.workflows.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
paths:
  home: ./state
  workflows: ../workflows
executor:
  max_inline_wait_seconds: 60
notify:
  webhook_url: https://hooks.example.com/chat
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.paths.home, Some("./state".to_string()));
        assert_eq!(config.paths.workflows, Some("../workflows".to_string()));
        assert_eq!(config.executor.unwrap().max_inline_wait_seconds, Some(60));
        assert_eq!(
            config.notify.unwrap().webhook_url.as_deref(),
            Some("https://hooks.example.com/chat")
        );
    }

    #[test]
    fn test_resolve_without_file_uses_defaults() {
        let resolved = resolve(None, PathBuf::from("/home/user/.trainflow"));

        if std::env::var("TRAINFLOW_HOME").is_err() {
            assert_eq!(resolved.home, PathBuf::from("/home/user/.trainflow"));
        }
        assert_eq!(resolved.workflows, PathBuf::from("workflows"));
        assert_eq!(resolved.executor.max_inline_wait_seconds, 300);
    }

    #[test]
    fn test_resolve_paths_against_config_dir() {
        let file = ConfigFile {
            paths: PathsConfig {
                home: Some("/var/lib/trainflow".to_string()),
                workflows: Some("./flows".to_string()),
            },
            executor: Some(ExecutorConfig {
                max_inline_wait_seconds: Some(5),
            }),
            notify: None,
        };
        let config_path = PathBuf::from("/nonexistent/project/.trainflow/config.yaml");

        let resolved = resolve(Some((&config_path, file)), PathBuf::from("/unused"));

        if std::env::var("TRAINFLOW_HOME").is_err() {
            assert_eq!(resolved.home, PathBuf::from("/var/lib/trainflow"));
        }
        assert_eq!(
            resolved.workflows,
            PathBuf::from("/nonexistent/project/.trainflow/./flows")
        );
        assert_eq!(resolved.executor.max_inline_wait_seconds, 5);
    }

    #[test]
    fn test_topic_always_has_log_subscriber() {
        let topic = NotifySettings::default().topic("outcomes");
        assert_eq!(topic.subscriber_count(), 1);

        let settings = NotifySettings {
            webhook_url: Some("https://hooks.example.com/chat".to_string()),
            telegram: Some(TelegramConfig {
                bot_token: "TOKEN".to_string(),
                chat_id: "123".to_string(),
            }),
        };
        assert_eq!(settings.topic("outcomes").subscriber_count(), 3);
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/./subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
