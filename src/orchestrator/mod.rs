use anyhow::{Result, bail};
use rand::seq::IndexedRandom;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ChatSubmitter, TokenProvider};
use crate::config::Config;
use crate::injector::MessageInjector;
use crate::session::{ConnectionState, Session, SessionIdentity, SessionOutcome, SessionSettings};
use crate::signal::{StopHandle, StopSignal, stop_channel};
use crate::stats::{Counter, SharedStats, StatsSnapshot, StressStats};
use crate::transport::Connector;

/// Run-level knobs that are not part of a single session.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub drain_timeout: Duration,
    pub progress_interval: Duration,
    pub messages_per_channel: u32,
    pub injector_delay: RangeInclusive<Duration>,
}

impl RunPlan {
    pub fn from_config(config: &Config) -> Self {
        Self {
            drain_timeout: config.run.drain_timeout(),
            progress_interval: config.run.progress_interval(),
            messages_per_channel: config.injector.message_count(config.run.duration()),
            injector_delay: config.injector.delay_range(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub snapshot: StatsSnapshot,
    pub connection_success_rate: Option<f64>,
    pub delivery_rate: Option<f64>,
    #[serde(skip)]
    pub outcomes: Vec<SessionOutcome>,
    /// Tasks still running at the drain deadline.
    pub aborted: usize,
}

impl StressReport {
    fn new(snapshot: StatsSnapshot, outcomes: Vec<SessionOutcome>, aborted: usize) -> Self {
        Self {
            connection_success_rate: snapshot.connection_success_rate(),
            delivery_rate: snapshot.delivery_rate(),
            snapshot,
            outcomes,
            aborted,
        }
    }

    pub fn failed_sessions(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.final_state == ConnectionState::Failed)
            .count()
    }

    pub fn log_summary(&self) {
        let s = &self.snapshot;
        info!("Stress test finished");
        info!(
            "Connections: {} created, {} failed, {} attempts, {} reconnections",
            s.connections_created, s.connections_failed, s.connection_attempts, s.reconnections
        );
        info!(
            "Messages: {} sent, {} received, {} errors",
            s.messages_sent, s.messages_received, s.errors
        );
        info!(
            "Connection success rate: {}",
            format_rate(self.connection_success_rate)
        );
        info!("Message delivery rate: {}", format_rate(self.delivery_rate));
        info!(
            "Sessions: {} finished, {} failed",
            self.outcomes.len(),
            self.failed_sessions()
        );
        for outcome in self
            .outcomes
            .iter()
            .filter(|o| o.final_state == ConnectionState::Failed)
        {
            debug!(
                "Client {} gave up after {}/{} attempts",
                outcome.client_id, outcome.attempts_made, outcome.max_attempts
            );
        }
        if self.aborted > 0 {
            warn!("{} tasks did not drain in time and were aborted", self.aborted);
        }
    }
}

fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:.1}%", r * 100.0),
        None => "n/a".to_string(),
    }
}

/// Spawns the session population and one injector per channel, lets them
/// run for the requested duration, then stops and drains them.
///
/// One orchestrator drives one run: `run` consumes it, so the counters and
/// the stop signal never carry over into another run.
pub struct StressOrchestrator {
    settings: Arc<SessionSettings>,
    plan: RunPlan,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<dyn Connector>,
    chat: Arc<dyn ChatSubmitter>,
    stats: SharedStats,
    stop: StopHandle,
}

impl StressOrchestrator {
    pub fn new(
        settings: SessionSettings,
        plan: RunPlan,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn Connector>,
        chat: Arc<dyn ChatSubmitter>,
    ) -> Self {
        let (stop, _) = stop_channel();
        Self {
            settings: Arc::new(settings),
            plan,
            tokens,
            connector,
            chat,
            stats: Arc::new(StressStats::new()),
            stop,
        }
    }

    /// Raising this handle ends the run early; it still drains and reports.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub async fn run(
        self,
        client_count: usize,
        channel_count: usize,
        duration: Duration,
    ) -> Result<StressReport> {
        if client_count > 0 && channel_count == 0 {
            bail!("{} clients need at least one channel", client_count);
        }

        let channels: Vec<String> = (0..channel_count)
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        info!(
            "Starting stress test: {} clients, {} channels, {:?}",
            client_count, channel_count, duration
        );

        let mut sessions: Vec<JoinHandle<SessionOutcome>> = Vec::with_capacity(client_count);
        for i in 0..client_count {
            let Some(channel_id) = channels.choose(&mut rand::rng()).cloned() else {
                break;
            };
            let session = Session::new(
                SessionIdentity::new(format!("client_{}", i), channel_id),
                self.settings.clone(),
                self.tokens.clone(),
                self.connector.clone(),
                self.stats.clone(),
                self.stop.subscribe(),
            );
            sessions.push(tokio::spawn(session.run()));
        }
        info!("{} sessions started", sessions.len());

        let mut injectors: Vec<JoinHandle<u32>> = Vec::with_capacity(channels.len());
        for channel_id in &channels {
            let injector =
                MessageInjector::new(self.chat.clone(), self.stats.clone(), self.stop.subscribe());
            injectors.push(tokio::spawn(injector.run(
                channel_id.clone(),
                self.plan.messages_per_channel,
                self.plan.injector_delay.clone(),
            )));
        }
        info!("{} injectors started", injectors.len());

        let reporter = (!self.plan.progress_interval.is_zero()).then(|| {
            tokio::spawn(report_progress(
                self.stats.clone(),
                self.stop.subscribe(),
                self.plan.progress_interval,
            ))
        });

        if !self.stop.subscribe().sleep(duration).await {
            info!("Stop requested before the run finished");
        }
        self.stop.raise();
        info!("Stop signal raised, draining");

        let deadline = Instant::now() + self.plan.drain_timeout;
        let mut aborted = 0;

        let mut outcomes = Vec::with_capacity(sessions.len());
        for handle in sessions {
            if let Some(outcome) = self.drain(handle, deadline, &mut aborted).await {
                outcomes.push(outcome);
            }
        }
        for handle in injectors {
            self.drain(handle, deadline, &mut aborted).await;
        }
        if let Some(reporter) = reporter {
            reporter.abort();
        }

        Ok(StressReport::new(self.stats.snapshot(), outcomes, aborted))
    }

    /// Waits for one task until `deadline`. A panicked or timed-out task is
    /// recorded as an error and never aborts the rest of the drain.
    async fn drain<T>(
        &self,
        mut handle: JoinHandle<T>,
        deadline: Instant,
        aborted: &mut usize,
    ) -> Option<T> {
        match time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                error!("Task failed: {}", e);
                self.stats.increment(Counter::Errors);
                None
            }
            Err(_) => {
                handle.abort();
                *aborted += 1;
                self.stats.increment(Counter::Errors);
                None
            }
        }
    }
}

async fn report_progress(stats: SharedStats, mut stop: StopSignal, every: Duration) {
    let mut interval = time::interval(every);
    interval.tick().await;
    loop {
        if stop.guard(interval.tick()).await.is_none() {
            break;
        }
        let s = stats.snapshot();
        info!(
            "Progress: {} active-ever, {} failed, {} sent, {} received, {} reconnections, {} errors",
            s.connections_created,
            s.connections_failed,
            s.messages_sent,
            s.messages_received,
            s.reconnections,
            s.errors
        );
    }
    debug!("Progress reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ChatReceipt;
    use crate::api::testing::ScriptedTokens;
    use crate::error::Result as StressResult;
    use crate::session::{Backoff, DisruptionPolicy};
    use crate::transport::mock::{Ack, Feed, MockLink, Script, ScriptedConnector};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedSender;

    fn settings() -> SessionSettings {
        SessionSettings {
            max_attempts: 5,
            backoff: Backoff::new(Duration::from_secs(1)..=Duration::from_secs(3)),
            handshake_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            idle_threshold: Duration::from_secs(30),
            disruption: DisruptionPolicy::never(),
            client_label_prefix: "stress_client_".to_string(),
            channel_namespace: "chat:".to_string(),
        }
    }

    fn plan(messages_per_channel: u32) -> RunPlan {
        RunPlan {
            drain_timeout: Duration::from_secs(45),
            progress_interval: Duration::from_secs(10),
            messages_per_channel,
            injector_delay: Duration::from_secs(2)..=Duration::from_secs(5),
        }
    }

    /// Chat endpoint that pushes every accepted message to all subscribers.
    struct FanoutChat {
        subscribers: Vec<UnboundedSender<Feed>>,
        channels: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatSubmitter for FanoutChat {
        async fn submit(&self, channel_id: &str, text: &str) -> StressResult<ChatReceipt> {
            self.channels.lock().unwrap().push(channel_id.to_string());
            let push = serde_json::json!({"push": {"pub": {"data": {"text": text}}}});
            for feed in &self.subscribers {
                let _ = feed.send(Feed::Frame(push.to_string()));
            }
            Ok(ChatReceipt {
                channel: format!("chat:{}", channel_id),
                message_id: Uuid::new_v4().to_string(),
            })
        }
    }

    struct NoChat;

    #[async_trait]
    impl ChatSubmitter for NoChat {
        async fn submit(&self, _: &str, _: &str) -> StressResult<ChatReceipt> {
            Err(crate::error::StressError::Submission("unreachable".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_subscriber_receives_every_message() {
        let mut scripts = Vec::new();
        let mut subscribers = Vec::new();
        for _ in 0..3 {
            let (link, feed) = MockLink::new(Ack::Reply);
            scripts.push(Script::Accept(link));
            subscribers.push(feed);
        }
        let chat = Arc::new(FanoutChat {
            subscribers,
            channels: Mutex::new(Vec::new()),
        });
        let orchestrator = StressOrchestrator::new(
            settings(),
            plan(2),
            Arc::new(ScriptedTokens::accepting()),
            Arc::new(ScriptedConnector::new(scripts)),
            chat.clone(),
        );

        let report = orchestrator
            .run(3, 1, Duration::from_secs(30))
            .await
            .unwrap();
        let s = report.snapshot;

        assert_eq!(s.messages_sent, 2);
        assert_eq!(s.messages_received, 6);
        assert_eq!(s.connections_created, 3);
        assert_eq!(s.connections_failed, 0);
        assert_eq!(s.errors, 0);
        assert_eq!(report.delivery_rate, Some(3.0));
        assert_eq!(report.connection_success_rate, Some(1.0));
        assert_eq!(report.aborted, 0);
        assert_eq!(report.outcomes.len(), 3);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.final_state == ConnectionState::Draining)
        );

        let channels = chat.channels.lock().unwrap().clone();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0], channels[1]);
        assert!(Uuid::parse_str(&channels[0]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sessions_are_counted_not_fatal() {
        let orchestrator = StressOrchestrator::new(
            settings(),
            plan(0),
            Arc::new(ScriptedTokens::rejecting()),
            Arc::new(ScriptedConnector::new(vec![])),
            Arc::new(NoChat),
        );

        let report = orchestrator
            .run(4, 2, Duration::from_secs(60))
            .await
            .unwrap();
        let s = report.snapshot;

        assert_eq!(report.failed_sessions(), 4);
        assert_eq!(s.connections_failed, 4);
        assert_eq!(s.errors, 20);
        assert!(s.connections_failed <= s.connection_attempts);
        assert_eq!(report.connection_success_rate, None);
        assert_eq!(report.delivery_rate, None);
        for outcome in &report.outcomes {
            assert_eq!(outcome.attempts_made, outcome.max_attempts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn early_stop_still_drains_and_reports() {
        let (link, _feed) = MockLink::new(Ack::Reply);
        let orchestrator = StressOrchestrator::new(
            settings(),
            plan(0),
            Arc::new(ScriptedTokens::accepting()),
            Arc::new(ScriptedConnector::new(vec![Script::Accept(link)])),
            Arc::new(NoChat),
        );
        let stop = orchestrator.stop_handle();

        let started = Instant::now();
        let (report, ()) = tokio::join!(orchestrator.run(1, 1, Duration::from_secs(3_600)), async {
            time::sleep(Duration::from_secs(5)).await;
            stop.raise();
        });
        let report = report.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.snapshot.connections_created, 1);
        assert_eq!(report.outcomes[0].final_state, ConnectionState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn each_run_starts_from_zero() {
        let tokens: Arc<dyn TokenProvider> = Arc::new(ScriptedTokens::rejecting());
        let connector: Arc<dyn Connector> = Arc::new(ScriptedConnector::new(vec![]));
        let orchestrator = || {
            StressOrchestrator::new(
                settings(),
                plan(0),
                tokens.clone(),
                connector.clone(),
                Arc::new(NoChat),
            )
        };

        for _ in 0..2 {
            let started = Instant::now();
            let report = orchestrator()
                .run(2, 1, Duration::from_secs(60))
                .await
                .unwrap();

            assert!(started.elapsed() >= Duration::from_secs(60));
            assert_eq!(report.snapshot.connection_attempts, 10);
            assert_eq!(report.snapshot.connections_failed, 2);
            assert_eq!(report.snapshot.errors, 10);
        }
    }

    #[tokio::test]
    async fn clients_without_channels_are_rejected() {
        let orchestrator = StressOrchestrator::new(
            settings(),
            plan(0),
            Arc::new(ScriptedTokens::accepting()),
            Arc::new(ScriptedConnector::new(vec![])),
            Arc::new(NoChat),
        );

        assert!(orchestrator.run(3, 0, Duration::from_secs(1)).await.is_err());
    }
}
