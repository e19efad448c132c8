//! Environment-driven configuration.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::channel::{ChannelOptions, OverflowPolicy};
use crate::stomp::HeartBeat;
use crate::store::PendingPolicy;
use crate::sync::PlanId;

/// Errors that can occur while reading configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything needed to run a plan session
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// STOMP WebSocket endpoint
    pub ws_url: String,
    /// REST base URL for baselines
    pub api_url: String,
    pub token: Option<String>,
    pub plan_id: Option<PlanId>,
    /// Local user name, used to drop our own cursor echo
    pub user_name: String,
    pub reconnect_delay: Duration,
    pub heartbeat_ms: u64,
    pub outbox_capacity: usize,
    pub outbox_policy: OverflowPolicy,
    pub pending: PendingPolicy,
    pub cursor_buffer: Duration,
    pub cursor_max_samples: usize,
    pub cursor_throttle: Duration,
    /// Port of the agent status endpoints
    pub status_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/ws/websocket".to_string(),
            api_url: "http://localhost:8080/api/v1".to_string(),
            token: None,
            plan_id: None,
            user_name: "anonymous".to_string(),
            reconnect_delay: Duration::from_millis(5_000),
            heartbeat_ms: 10_000,
            outbox_capacity: 512,
            outbox_policy: OverflowPolicy::Reject,
            pending: PendingPolicy::default(),
            cursor_buffer: Duration::from_millis(60),
            cursor_max_samples: 8,
            cursor_throttle: Duration::from_millis(60),
            status_port: 5050,
        }
    }
}

impl SyncConfig {
    /// Read `PLAN_SYNC_*` variables (after loading `.env`, if any)
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            info!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let ms = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(var, get(var), default.as_millis() as u64).map(Duration::from_millis)
        };

        Ok(Self {
            ws_url: get("PLAN_SYNC_WS_URL").unwrap_or(defaults.ws_url),
            api_url: get("PLAN_SYNC_API_URL").unwrap_or(defaults.api_url),
            token: get("PLAN_SYNC_TOKEN"),
            plan_id: match get("PLAN_SYNC_PLAN_ID") {
                Some(value) => Some(parse("PLAN_SYNC_PLAN_ID", value)?),
                None => {
                    info!("PLAN_SYNC_PLAN_ID not set, starting without a plan");
                    None
                }
            },
            user_name: get("PLAN_SYNC_USER_NAME").unwrap_or(defaults.user_name),
            reconnect_delay: ms("PLAN_SYNC_RECONNECT_DELAY_MS", defaults.reconnect_delay)?,
            heartbeat_ms: parse_or(
                "PLAN_SYNC_HEARTBEAT_MS",
                get("PLAN_SYNC_HEARTBEAT_MS"),
                defaults.heartbeat_ms,
            )?,
            outbox_capacity: parse_or(
                "PLAN_SYNC_OUTBOX_CAPACITY",
                get("PLAN_SYNC_OUTBOX_CAPACITY"),
                defaults.outbox_capacity,
            )?,
            outbox_policy: parse_or(
                "PLAN_SYNC_OUTBOX_POLICY",
                get("PLAN_SYNC_OUTBOX_POLICY"),
                defaults.outbox_policy,
            )?,
            pending: PendingPolicy {
                timeout: ms("PLAN_SYNC_PENDING_TIMEOUT_MS", defaults.pending.timeout)?,
                max_retries: parse_or(
                    "PLAN_SYNC_PENDING_RETRIES",
                    get("PLAN_SYNC_PENDING_RETRIES"),
                    defaults.pending.max_retries,
                )?,
            },
            cursor_buffer: ms("PLAN_SYNC_CURSOR_BUFFER_MS", defaults.cursor_buffer)?,
            cursor_max_samples: parse_or(
                "PLAN_SYNC_CURSOR_MAX_QUEUE",
                get("PLAN_SYNC_CURSOR_MAX_QUEUE"),
                defaults.cursor_max_samples,
            )?,
            cursor_throttle: ms("PLAN_SYNC_CURSOR_THROTTLE_MS", defaults.cursor_throttle)?,
            status_port: parse_or(
                "PLAN_SYNC_STATUS_PORT",
                get("PLAN_SYNC_STATUS_PORT"),
                defaults.status_port,
            )?,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_plan(mut self, plan_id: PlanId) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat_ms(mut self, ms: u64) -> Self {
        self.heartbeat_ms = ms;
        self
    }

    pub fn with_outbox(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.outbox_capacity = capacity;
        self.outbox_policy = policy;
        self
    }

    pub fn with_pending(mut self, pending: PendingPolicy) -> Self {
        self.pending = pending;
        self
    }

    /// Options shared by the five channel managers
    pub fn channel_options(&self) -> ChannelOptions {
        let host = reqwest::Url::parse(&self.ws_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        ChannelOptions {
            url: self.ws_url.clone(),
            host,
            heart_beat: HeartBeat::new(self.heartbeat_ms, self.heartbeat_ms),
            reconnect_delay: self.reconnect_delay,
            outbox_capacity: self.outbox_capacity,
            outbox_policy: self.outbox_policy,
        }
    }
}

fn parse<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
        value,
    })
}

fn parse_or<T>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.map_or(Ok(default), |v| parse(var, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.outbox_capacity, 512);
        assert_eq!(config.pending.max_retries, 2);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("PLAN_SYNC_TOKEN", "abcdefghijkl"),
            ("PLAN_SYNC_PLAN_ID", "42"),
            ("PLAN_SYNC_OUTBOX_POLICY", "drop-oldest"),
            ("PLAN_SYNC_RECONNECT_DELAY_MS", "250"),
            ("PLAN_SYNC_CURSOR_MAX_QUEUE", "4"),
            ("PLAN_SYNC_USER_NAME", "kim"),
        ]))
        .unwrap();

        assert_eq!(config.token.as_deref(), Some("abcdefghijkl"));
        assert_eq!(config.plan_id, Some(42));
        assert_eq!(config.outbox_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.cursor_max_samples, 4);
        assert_eq!(config.user_name, "kim");
    }

    #[test]
    fn test_invalid_number() {
        let err = SyncConfig::from_lookup(lookup(&[("PLAN_SYNC_OUTBOX_CAPACITY", "lots")]))
            .unwrap_err();
        let ConfigError::Invalid { var, value, .. } = err;
        assert_eq!(var, "PLAN_SYNC_OUTBOX_CAPACITY");
        assert_eq!(value, "lots");

        assert!(SyncConfig::from_lookup(lookup(&[("PLAN_SYNC_OUTBOX_POLICY", "spill")])).is_err());
    }

    #[test]
    fn test_blank_values_fall_back() {
        let config = SyncConfig::from_lookup(lookup(&[("PLAN_SYNC_WS_URL", "  ")])).unwrap();
        assert_eq!(config.ws_url, SyncConfig::default().ws_url);
    }

    #[test]
    fn test_channel_options_host() {
        let options = SyncConfig::default()
            .with_ws_url("wss://plans.example.com:8443/ws/websocket")
            .with_heartbeat_ms(0)
            .channel_options();
        assert_eq!(options.host, "plans.example.com");
        assert_eq!(options.heart_beat, HeartBeat::new(0, 0));
        assert_eq!(options.outbox_capacity, 512);
    }
}
