/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_FRESHNESS_SECS: u64 = 5 * 60;

/// Synchronization core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// A peer seen within this window counts as online
    pub freshness_window: Duration,

    /// How often the presence ticker re-evaluates last-seen timestamps
    pub presence_tick: Duration,

    /// First delay before resubscribing after a dropped feed
    pub resubscribe_delay: Duration,

    /// Upper bound for the resubscribe backoff
    pub max_resubscribe_delay: Duration,

    /// Capacity of the sync event broadcast channel
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(DEFAULT_FRESHNESS_SECS),
            presence_tick: Duration::from_secs(30),
            resubscribe_delay: Duration::from_millis(500),
            max_resubscribe_delay: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Create config from command line arguments
    ///
    /// Accepted flags: `--freshness-secs <n>`, `--tick-secs <n>`, `--resubscribe-ms <n>`.
    /// Unknown arguments are returned untouched so the caller can treat them as positionals.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut rest = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--freshness-secs" => {
                    config.freshness_window = Duration::from_secs(flag_value(args, i)?);
                    i += 2;
                }
                "--tick-secs" => {
                    config.presence_tick = Duration::from_secs(flag_value(args, i)?);
                    i += 2;
                }
                "--resubscribe-ms" => {
                    config.resubscribe_delay = Duration::from_millis(flag_value(args, i)?);
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok((config, rest))
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env(&mut self) {
        if let Some(secs) = std::env::var("DMSYNC_FRESHNESS_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.freshness_window = Duration::from_secs(secs);
        }
        if let Some(secs) = std::env::var("DMSYNC_TICK_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.presence_tick = Duration::from_secs(secs);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.freshness_window.is_zero() {
            return Err(SyncError::Config("freshness window must be positive".to_string()));
        }
        if self.presence_tick.is_zero() {
            return Err(SyncError::Config("presence tick must be positive".to_string()));
        }
        if self.resubscribe_delay > self.max_resubscribe_delay {
            return Err(SyncError::Config(
                "resubscribe delay exceeds its maximum".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event capacity must be positive".to_string()));
        }
        Ok(())
    }
}

fn flag_value(args: &[String], i: usize) -> Result<u64> {
    let flag = &args[i];
    let raw = args
        .get(i + 1)
        .ok_or_else(|| SyncError::Config(format!("{} requires a numeric argument", flag)))?;
    raw.parse::<u64>()
        .map_err(|_| SyncError::Config(format!("{} must be a non-negative number", flag)))
}
