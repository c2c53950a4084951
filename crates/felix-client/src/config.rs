// Publisher defaults and env/YAML configuration overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::ErrorHandler;

/// Default bound on unacknowledged publishes.
pub const DEFAULT_MAX_PENDING: usize = 1024;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a submission may wait for a free slot before failing.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_millis(200);
pub(crate) const DEFAULT_WRITER_QUEUE_DEPTH: usize = 1024;

/// Hard cap for any single inbound frame.
///
/// `read_frame_into` allocates a buffer sized by the advertised length, so a
/// buggy or hostile peer could otherwise force an arbitrary allocation.
/// Override with `FELIX_MAX_FRAME_BYTES`.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct ClientConfig {
    /// Upper bound on requests that are submitted but not yet resolved.
    pub max_pending_async: usize,
    /// Per-call deadline for synchronous publishes.
    pub publish_timeout: Duration,
    pub backpressure_timeout: Duration,
    /// When set, async publishes older than this are resolved with `AckTimeout` by a sweeper.
    pub async_ack_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
    pub writer_queue_depth: usize,
    pub error_handler: Option<ErrorHandler>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_pending_async", &self.max_pending_async)
            .field("publish_timeout", &self.publish_timeout)
            .field("backpressure_timeout", &self.backpressure_timeout)
            .field("async_ack_timeout", &self.async_ack_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("writer_queue_depth", &self.writer_queue_depth)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::optimized_defaults()
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    max_pending_async: Option<usize>,
    publish_timeout_ms: Option<u64>,
    backpressure_timeout_ms: Option<u64>,
    async_ack_timeout_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    writer_queue_depth: Option<usize>,
}

impl ClientConfig {
    pub fn optimized_defaults() -> Self {
        Self {
            max_pending_async: DEFAULT_MAX_PENDING,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            async_ack_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            writer_queue_depth: DEFAULT_WRITER_QUEUE_DEPTH,
            error_handler: None,
        }
    }

    /// Defaults overlaid with `FELIX_PUB_*` environment variables, then an
    /// optional YAML file (`config_path` or `FELIX_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("FELIX_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::optimized_defaults();
        if let Some(value) = read_usize_env("FELIX_PUB_MAX_PENDING") {
            config.max_pending_async = value;
        }
        if let Some(value) = read_u64_env("FELIX_PUB_TIMEOUT_MS") {
            config.publish_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("FELIX_PUB_STALL_WAIT_MS") {
            config.backpressure_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("FELIX_PUB_ASYNC_ACK_TIMEOUT_MS") {
            config.async_ack_timeout = Some(Duration::from_millis(value));
        }
        if let Some(value) = read_usize_env("FELIX_MAX_FRAME_BYTES") {
            config.max_frame_bytes = value;
        }
        config
    }

    pub fn with_max_pending(mut self, max_pending_async: usize) -> Self {
        self.max_pending_async = max_pending_async;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    pub fn with_async_ack_timeout(mut self, timeout: Duration) -> Self {
        self.async_ack_timeout = Some(timeout);
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(crate::FailedPublish) + Send + Sync + 'static,
    {
        self.error_handler = Some(std::sync::Arc::new(handler));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pending_async == 0 {
            anyhow::bail!("max_pending_async must be positive");
        }
        if self.publish_timeout.is_zero() {
            anyhow::bail!("publish_timeout must be positive");
        }
        if self.max_frame_bytes == 0 || self.writer_queue_depth == 0 {
            anyhow::bail!("frame and queue limits must be positive");
        }
        if self.async_ack_timeout.is_some_and(|timeout| timeout.is_zero()) {
            anyhow::bail!("async_ack_timeout must be positive when set");
        }
        Ok(())
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.max_pending_async
            && value > 0
        {
            config.max_pending_async = value;
        }
        if let Some(value) = self.publish_timeout_ms
            && value > 0
        {
            config.publish_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.backpressure_timeout_ms
            && value > 0
        {
            config.backpressure_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.async_ack_timeout_ms
            && value > 0
        {
            config.async_ack_timeout = Some(Duration::from_millis(value));
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            config.max_frame_bytes = value;
        }
        if let Some(value) = self.writer_queue_depth
            && value > 0
        {
            config.writer_queue_depth = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
