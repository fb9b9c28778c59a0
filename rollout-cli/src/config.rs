use std::env;

use serde::Deserialize;

/// Top-level rollout.toml configuration
#[derive(Debug, Deserialize, Default)]
pub struct RolloutConfig {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

// ── Default value functions ──────────────────────────

fn default_path() -> String {
    "rollout.json".to_string()
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_filter() -> String {
    "rollout=info,rollout_cli=info".to_string()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl RolloutConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: failed to parse {}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ROLLOUT_PATH") {
            if !val.trim().is_empty() {
                self.watch.path = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("ROLLOUT_BACKOFF_MS") {
            match val.parse::<u64>() {
                Ok(ms) => self.watch.backoff_ms = ms,
                Err(_) => eprintln!("Warning: invalid ROLLOUT_BACKOFF_MS value: {}", val),
            }
        }

        if let Ok(val) = env::var("ROLLOUT_LOG_FILTER") {
            self.log.filter = val;
        }

        if let Ok(val) = env::var("ROLLOUT_LOG_JSON") {
            match parse_bool(&val) {
                Some(json) => self.log.json = json,
                None => eprintln!("Warning: invalid ROLLOUT_LOG_JSON value: {}", val),
            }
        }
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
