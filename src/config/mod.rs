use anyhow::{Result, bail};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub run: RunConfig,
    pub session: SessionConfig,
    pub injector: InjectorConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TargetConfig {
    pub backend_url: String,
    pub ws_url: String,
    pub channel_namespace: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    pub client_count: usize,
    pub channel_count: usize,
    pub duration_secs: u64,
    pub drain_timeout_secs: u64,
    pub progress_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub max_attempts: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub handshake_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub idle_threshold_secs: u64,
    pub disruption_probability: f64,
    pub client_label_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InjectorConfig {
    pub messages_per_channel: Option<u32>,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8787".to_string(),
            ws_url: "ws://localhost:3000/centrifugo/connection/websocket".to_string(),
            channel_namespace: "chat:".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            client_count: 10,
            channel_count: 3,
            duration_secs: 300,
            drain_timeout_secs: 45,
            progress_interval_secs: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_min_ms: 1_000,
            backoff_max_ms: 3_000,
            handshake_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            idle_threshold_secs: 30,
            disruption_probability: 0.01,
            client_label_prefix: "stress_client_".to_string(),
        }
    }
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            messages_per_channel: None,
            delay_min_ms: 2_000,
            delay_max_ms: 5_000,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_scheme("target.backend_url", &self.target.backend_url, "http://")?;
        check_scheme("target.ws_url", &self.target.ws_url, "ws://")?;

        let session = &self.session;
        if session.max_attempts == 0 {
            bail!("session.max_attempts must be at least 1");
        }
        if session.backoff_min_ms == 0 {
            bail!("session.backoff_min_ms must be greater than zero");
        }
        if session.backoff_min_ms > session.backoff_max_ms {
            bail!("session.backoff_min_ms must not exceed session.backoff_max_ms");
        }
        if session.poll_interval_ms == 0 {
            bail!("session.poll_interval_ms must be greater than zero");
        }
        if session.poll_interval() > session.idle_threshold() {
            bail!("session.poll_interval_ms must not exceed the idle threshold");
        }
        if !(0.0..=1.0).contains(&session.disruption_probability) {
            bail!("session.disruption_probability must be within [0, 1]");
        }
        if self.injector.delay_min_ms > self.injector.delay_max_ms {
            bail!("injector.delay_min_ms must not exceed injector.delay_max_ms");
        }
        if self.run.channel_count == 0 && self.run.client_count > 0 {
            bail!("run.channel_count must be at least 1 when clients are configured");
        }
        Ok(())
    }
}

impl RunConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

impl SessionConfig {
    pub fn backoff_range(&self) -> RangeInclusive<Duration> {
        Duration::from_millis(self.backoff_min_ms)..=Duration::from_millis(self.backoff_max_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

impl InjectorConfig {
    pub fn delay_range(&self) -> RangeInclusive<Duration> {
        Duration::from_millis(self.delay_min_ms)..=Duration::from_millis(self.delay_max_ms)
    }

    /// One message per ten seconds of run time unless set explicitly.
    pub fn message_count(&self, run_duration: Duration) -> u32 {
        self.messages_per_channel
            .unwrap_or((run_duration.as_secs() / 10) as u32)
    }
}

fn check_scheme(field: &str, url: &str, scheme: &str) -> Result<()> {
    if !url.starts_with(scheme) {
        bail!("{} must start with {} (got {})", field, scheme, url);
    }
    Ok(())
}
