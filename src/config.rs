use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Model ids keyed by thinking mode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelMap {
  pub default: String,
  pub thinking: String,
}

impl ModelMap {
  pub fn select(&self, thinking_mode: bool) -> &str {
    if thinking_mode {
      &self.thinking
    } else {
      &self.default
    }
  }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AppConfig {
  pub upstream_url: String,
  pub api_key: String,
  pub models: ModelMap,
  pub referer: String,
  pub title: String,
  pub system_prompt: String,
  pub timeout_secs: u64,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      upstream_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
      api_key: String::new(),
      models: ModelMap {
        default: "google/gemini-2.0-flash-001".to_string(),
        thinking: "qwen/qwq-32b:free".to_string(),
      },
      referer: "https://senterosai.app".to_string(),
      title: "SenterosAI Chat".to_string(),
      system_prompt: "You are SenterosAI, a model created by Slavik company. You are a super friendly and helpful assistant! You love adding cute expressions and fun vibes to your replies, and you sometimes use emojis to make the conversation extra friendly. ^_^ (✿◡‿◡) You're like a helpful friend who's always here to listen, make suggestions, and offer solutions, all while keeping things lighthearted and fun!".to_string(),
      timeout_secs: 60,
    }
  }
}

impl AppConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  /// Replaces the credential with `OPENROUTER_API_KEY` when that is set.
  pub fn with_env_overrides(self) -> Self {
    self.with_api_key_override(std::env::var(API_KEY_ENV).ok())
  }

  fn with_api_key_override(mut self, key: Option<String>) -> Self {
    if let Some(key) = key {
      if !key.trim().is_empty() {
        self.api_key = key.trim().to_string();
      }
    }
    self
  }
}

pub fn load_or_init(path: &Path) -> anyhow::Result<AppConfig> {
  if path.exists() {
    let data = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&data)?;
    Ok(config)
  } else {
    let config = AppConfig::default();
    save_config(path, &config)?;
    Ok(config)
  }
}

pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(config)?;
  std::fs::write(path, json)?;
  Ok(())
}
