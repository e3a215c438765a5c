use livecore::ResourceKind;
use log::warn;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(1);
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// WebSocket endpoint of the chat server.
    pub socket_url: String,
    /// Server-sent events endpoint for push notifications.
    pub sse_url: String,
    /// Base URL of the REST API.
    pub api_url: String,
    /// Delay between the last release of a key and its teardown.
    pub grace_window: Duration,
    /// Per-resource overrides of `grace_window`.
    pub grace_overrides: HashMap<ResourceKind, Duration>,
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut grace_overrides = HashMap::new();
        grace_overrides.insert(ResourceKind::MessageInfo, Duration::ZERO);
        grace_overrides.insert(ResourceKind::UserNotifications, Duration::ZERO);
        grace_overrides.insert(ResourceKind::MessageNotifications, Duration::from_secs(60));

        Self {
            socket_url: "ws://localhost:3000".to_string(),
            sse_url: "http://localhost:3000/sse".to_string(),
            api_url: "http://localhost:3000".to_string(),
            grace_window: DEFAULT_GRACE_WINDOW,
            grace_overrides,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `LIVESYNC_SOCKET_URL`, `LIVESYNC_SSE_URL`,
    /// `LIVESYNC_API_URL` and `LIVESYNC_GRACE_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("LIVESYNC_SOCKET_URL") {
            config.socket_url = url;
        }
        if let Ok(url) = std::env::var("LIVESYNC_SSE_URL") {
            config.sse_url = url;
        }
        if let Ok(url) = std::env::var("LIVESYNC_API_URL") {
            config.api_url = url;
        }
        if let Ok(raw) = std::env::var("LIVESYNC_GRACE_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.grace_window = Duration::from_millis(ms),
                Err(e) => warn!(target: "Config", "Ignoring LIVESYNC_GRACE_MS={raw:?}: {e}"),
            }
        }
        config
    }

    pub fn with_socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = url.into();
        self
    }

    pub fn with_sse_url(mut self, url: impl Into<String>) -> Self {
        self.sse_url = url.into();
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace_window = grace;
        self
    }

    pub fn with_grace_for(mut self, kind: ResourceKind, grace: Duration) -> Self {
        self.grace_overrides.insert(kind, grace);
        self
    }

    pub fn grace_for(&self, kind: ResourceKind) -> Duration {
        self.grace_overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.grace_window)
    }
}
