use crate::storage::StorageConfig;
use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "callbridge.toml")]
    pub conf: Option<String>,

    /// Place an outbound call to this E.164 number once started
    #[clap(long)]
    pub dial: Option<String>,

    /// Originate the call as this bot instead of the configured initiator
    #[clap(long)]
    pub bot: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub engine: EngineConfig,
    pub dialer: DialerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub timeout_secs: u64,
    /// Only list calls in this direction (`inbound` / `outbound`).
    pub direction: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub snapshot_freshness_ms: u64,
    pub poll_interval_secs: u64,
    pub room_watch_interval_secs: u64,
    pub attempt_monitor_interval_secs: u64,
    pub attempt_timeout_secs: u64,
    pub bot_attempt_timeout_secs: u64,
    pub max_consecutive_failures: u32,
    pub max_history: usize,
    pub detach_grace_ms: u64,
    pub switch_suppression_ms: u64,
    pub room_duration_secs: u64,
    pub room_capacity: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct DialerConfig {
    pub caller_id_number: Option<String>,
    pub initiator_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            engine: EngineConfig::default(),
            dialer: DialerConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            headers: None,
            timeout_secs: 10,
            direction: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_freshness_ms: 3_000,
            poll_interval_secs: 6,
            room_watch_interval_secs: 4,
            attempt_monitor_interval_secs: 5,
            attempt_timeout_secs: 45,
            bot_attempt_timeout_secs: 60,
            max_consecutive_failures: 3,
            max_history: crate::history::DEFAULT_MAX_HISTORY,
            detach_grace_ms: 1_000,
            switch_suppression_ms: 2_000,
            room_duration_secs: 3_600,
            room_capacity: 4,
        }
    }
}

impl EngineConfig {
    pub fn snapshot_freshness(&self) -> Duration {
        Duration::from_millis(self.snapshot_freshness_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn room_watch_interval(&self) -> Duration {
        Duration::from_secs(self.room_watch_interval_secs.max(1))
    }

    pub fn attempt_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.attempt_monitor_interval_secs.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn bot_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.bot_attempt_timeout_secs)
    }

    pub fn detach_grace(&self) -> Duration {
        Duration::from_millis(self.detach_grace_ms)
    }

    pub fn switch_suppression(&self) -> Duration {
        Duration::from_millis(self.switch_suppression_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
