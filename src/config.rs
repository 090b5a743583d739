use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::PollConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub github: GithubConfig,
  #[serde(default)]
  pub poll: PollSettings,
  /// Log file path; logs go to stderr when unset
  #[serde(default)]
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
  /// API base URL; override for GitHub Enterprise Server
  #[serde(default = "default_api_url")]
  pub url: String,
  pub owner: String,
  pub repo: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollSettings {
  /// Delay after an unchanged cycle (cheap conditional no-op)
  #[serde(default = "default_fast_retry_ms")]
  pub fast_retry_ms: u64,
  /// Delay after a cycle that delivered changes
  #[serde(default = "default_steady_ms")]
  pub steady_ms: u64,
  /// Consecutive failures before the first sync is reported as failed
  #[serde(default = "default_first_sync_failures")]
  pub first_sync_failures: u32,
}

fn default_api_url() -> String {
  "https://api.github.com".to_string()
}

fn default_fast_retry_ms() -> u64 {
  1000
}

fn default_steady_ms() -> u64 {
  5000
}

fn default_first_sync_failures() -> u32 {
  5
}

impl Default for PollSettings {
  fn default() -> Self {
    Self {
      fast_retry_ms: default_fast_retry_ms(),
      steady_ms: default_steady_ms(),
      first_sync_failures: default_first_sync_failures(),
    }
  }
}

impl PollSettings {
  pub fn to_poll_config(&self) -> PollConfig {
    PollConfig {
      fast_retry: Duration::from_millis(self.fast_retry_ms),
      steady: Duration::from_millis(self.steady_ms),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gha-watch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gha-watch/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/gha-watch/config.yaml\n\
                 with at least a github.owner and github.repo."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("gha-watch.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gha-watch").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks GHA_WATCH_TOKEN first, then GITHUB_TOKEN as fallback.
  pub fn api_token() -> Result<String> {
    std::env::var("GHA_WATCH_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set GHA_WATCH_TOKEN or GITHUB_TOKEN environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn minimal_config_gets_defaults() {
    let config: Config = serde_yaml::from_str("github:\n  owner: octo\n  repo: demo\n").unwrap();

    assert_eq!(config.github.url, "https://api.github.com");
    assert_eq!(config.poll.fast_retry_ms, 1000);
    assert_eq!(config.poll.steady_ms, 5000);
    assert_eq!(config.poll.first_sync_failures, 5);
    assert!(config.log_file.is_none());
  }

  #[test]
  fn poll_settings_convert_to_durations() {
    let settings = PollSettings {
      fast_retry_ms: 250,
      steady_ms: 2000,
      first_sync_failures: 3,
    };
    let poll = settings.to_poll_config();
    assert_eq!(poll.fast_retry, Duration::from_millis(250));
    assert_eq!(poll.steady, Duration::from_millis(2000));
  }
}
