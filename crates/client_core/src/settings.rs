use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use peer_integration::IceServer;
use serde::Deserialize;

use crate::{
    call::CallSettings, channel::ChannelSettings, messages::MessageSettings, retry::RetryPolicy,
};

const ENV_PREFIX: &str = "REALTIME__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub api_url: String,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_miss_threshold: u32,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub ack_timeout_ms: u64,
    pub typing_debounce_ms: u64,
    pub typing_grace_ms: u64,
    pub ring_timeout_secs: u64,
    pub ice_servers: Vec<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5001".into(),
            api_url: "http://localhost:5001/api".into(),
            handshake_timeout_ms: 20_000,
            heartbeat_interval_secs: 30,
            heartbeat_miss_threshold: 3,
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            ack_timeout_ms: 10_000,
            typing_debounce_ms: 2_000,
            typing_grace_ms: 1_000,
            ring_timeout_secs: 45,
            ice_servers: peer_integration::default_ice_servers()
                .into_iter()
                .map(|server| server.urls)
                .collect(),
        }
    }
}

impl ClientSettings {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid client settings")
    }

    /// Apply `REALTIME__*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("API_URL") {
            self.api_url = v;
        }
        if let Some(v) = var("ICE_SERVERS") {
            self.ice_servers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }

        override_number(&mut self.handshake_timeout_ms, var("HANDSHAKE_TIMEOUT_MS"));
        override_number(&mut self.heartbeat_interval_secs, var("HEARTBEAT_INTERVAL_SECS"));
        override_number(
            &mut self.heartbeat_miss_threshold,
            var("HEARTBEAT_MISS_THRESHOLD"),
        );
        override_number(&mut self.reconnect_attempts, var("RECONNECT_ATTEMPTS"));
        override_number(
            &mut self.reconnect_base_delay_ms,
            var("RECONNECT_BASE_DELAY_MS"),
        );
        override_number(&mut self.reconnect_max_delay_ms, var("RECONNECT_MAX_DELAY_MS"));
        override_number(&mut self.ack_timeout_ms, var("ACK_TIMEOUT_MS"));
        override_number(&mut self.typing_debounce_ms, var("TYPING_DEBOUNCE_MS"));
        override_number(&mut self.typing_grace_ms, var("TYPING_GRACE_MS"));
        override_number(&mut self.ring_timeout_secs, var("RING_TIMEOUT_SECS"));
    }

    pub fn channel(&self) -> ChannelSettings {
        ChannelSettings {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            heartbeat_miss_threshold: self.heartbeat_miss_threshold.max(1),
            reconnect: RetryPolicy::new(
                self.reconnect_base_delay_ms,
                self.reconnect_max_delay_ms,
                self.reconnect_attempts,
            ),
        }
    }

    pub fn messages(&self) -> MessageSettings {
        MessageSettings {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            typing_debounce: Duration::from_millis(self.typing_debounce_ms),
            typing_grace: Duration::from_millis(self.typing_grace_ms),
        }
    }

    pub fn calls(&self) -> CallSettings {
        CallSettings {
            ring_timeout: Duration::from_secs(self.ring_timeout_secs),
            ice_servers: self
                .ice_servers
                .iter()
                .map(|urls| IceServer { urls: urls.clone() })
                .collect(),
            ..CallSettings::default()
        }
    }
}

fn override_number<T: std::str::FromStr>(target: &mut T, raw: Option<String>) {
    if let Some(parsed) = raw.and_then(|v| v.trim().parse::<T>().ok()) {
        *target = parsed;
    }
}

/// Load settings from an optional TOML file, then apply environment overrides.
///
/// A missing file falls back to defaults; an unreadable or invalid one is an
/// error.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = match path {
        Some(path) if path.exists() => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
            ClientSettings::from_toml_str(&raw)?
        }
        _ => ClientSettings::default(),
    };
    settings.apply_env_overrides(|name| std::env::var(name).ok());
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let settings = ClientSettings::from_toml_str(
            r#"
            server_url = "https://social.example"
            ack_timeout_ms = 2500
            "#,
        )
        .expect("parse settings");

        assert_eq!(settings.server_url, "https://social.example");
        assert_eq!(settings.ack_timeout_ms, 2_500);
        assert_eq!(settings.heartbeat_interval_secs, 30);
        assert_eq!(settings.ice_servers.len(), 3);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(ClientSettings::from_toml_str("ack_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn env_overrides_win_and_ignore_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("REALTIME__SERVER_URL", "http://10.0.0.2:5001"),
            ("REALTIME__RECONNECT_ATTEMPTS", "9"),
            ("REALTIME__RING_TIMEOUT_SECS", "never"),
            ("REALTIME__ICE_SERVERS", "stun:a.example:3478, stun:b.example:3478"),
        ]);
        let mut settings = ClientSettings::default();
        settings.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(settings.server_url, "http://10.0.0.2:5001");
        assert_eq!(settings.reconnect_attempts, 9);
        assert_eq!(settings.ring_timeout_secs, 45);
        assert_eq!(
            settings.ice_servers,
            vec!["stun:a.example:3478", "stun:b.example:3478"]
        );
    }

    #[test]
    fn derives_engine_settings() {
        let settings = ClientSettings::default();
        let channel = settings.channel();
        assert_eq!(channel.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(channel.reconnect.max_attempts(), 5);
        assert_eq!(settings.messages().typing_debounce, Duration::from_secs(2));
        assert_eq!(settings.calls().ice_servers.len(), 3);
    }

    #[test]
    fn missing_settings_file_falls_back_to_defaults() {
        let settings =
            load_settings(Some(Path::new("/nonexistent/realtime.toml"))).expect("defaults");
        assert_eq!(settings.typing_debounce_ms, 2_000);
    }
}
