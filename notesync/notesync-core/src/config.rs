//! Runtime settings for a sync session.
//!
//! Every field has a default; `from_env` overrides them from `NOTESYNC_*`
//! variables.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Reconnect attempts before live sync is declared unavailable.
    pub max_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            connect_timeout_ms: 10_000,
        }
    }
}

impl RealtimeConfig {
    /// Delay before reconnect attempt `attempt` (1-based): the base delay
    /// doubled per previous attempt, capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Age after which a cached view is served stale and refreshed.
    pub ttl_secs: u64,
    pub page_size: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            page_size: 50,
        }
    }
}

impl ViewConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub realtime: RealtimeConfig,
    pub views: ViewConfig,
    /// Reject a mutation on an id that already has one in flight instead of
    /// letting the last write win.
    pub serialize_same_entity: bool,
    pub seed_on_first_login: bool,
    pub seed_template: Option<PathBuf>,
    pub generation_daily_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            realtime: RealtimeConfig::default(),
            views: ViewConfig::default(),
            serialize_same_entity: false,
            seed_on_first_login: true,
            seed_template: None,
            generation_daily_limit: 20,
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{name}: {e}")),
        Err(_) => Ok(None),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("NOTESYNC_REALTIME_BASE_DELAY_MS")? {
            config.realtime.base_delay_ms = v;
        }
        if let Some(v) = env_parse("NOTESYNC_REALTIME_MAX_DELAY_MS")? {
            config.realtime.max_delay_ms = v;
        }
        if let Some(v) = env_parse("NOTESYNC_REALTIME_MAX_ATTEMPTS")? {
            config.realtime.max_attempts = v;
        }
        if let Some(v) = env_parse("NOTESYNC_REALTIME_CONNECT_TIMEOUT_MS")? {
            config.realtime.connect_timeout_ms = v;
        }
        if let Some(v) = env_parse("NOTESYNC_VIEW_TTL_SECS")? {
            config.views.ttl_secs = v;
        }
        if let Some(v) = env_parse("NOTESYNC_VIEW_PAGE_SIZE")? {
            config.views.page_size = v;
        }
        if let Some(v) = env_parse("NOTESYNC_SERIALIZE_SAME_ENTITY")? {
            config.serialize_same_entity = v;
        }
        if let Some(v) = env_parse("NOTESYNC_SEED_ON_FIRST_LOGIN")? {
            config.seed_on_first_login = v;
        }
        if let Ok(path) = std::env::var("NOTESYNC_SEED_TEMPLATE") {
            config.seed_template = Some(PathBuf::from(path));
        }
        if let Some(v) = env_parse("NOTESYNC_GENERATION_DAILY_LIMIT")? {
            config.generation_daily_limit = v;
        }
        Ok(config)
    }
}
