mod backoff;
mod state;

pub use backoff::{Backoff, DisruptionPolicy, jitter};
pub use state::{ConnectionState, RetryBudget};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::api::{Credential, TokenProvider};
use crate::config::Config;
use crate::error::{Result, StressError};
use crate::signal::StopSignal;
use crate::stats::{Counter, SharedStats};
use crate::transport::frames::{self, CommandIds};
use crate::transport::{Connector, Frame, Transport};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub client_id: String,
    pub channel_id: String,
}

impl SessionIdentity {
    pub fn new(client_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub handshake_timeout: Duration,
    pub poll_interval: Duration,
    pub idle_threshold: Duration,
    pub disruption: DisruptionPolicy,
    pub client_label_prefix: String,
    pub channel_namespace: String,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let session = &config.session;
        Self {
            max_attempts: session.max_attempts,
            backoff: Backoff::new(session.backoff_range()),
            handshake_timeout: session.handshake_timeout(),
            poll_interval: session.poll_interval(),
            idle_threshold: session.idle_threshold(),
            disruption: DisruptionPolicy::new(session.disruption_probability),
            client_label_prefix: session.client_label_prefix.clone(),
            channel_namespace: config.target.channel_namespace.clone(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub client_id: String,
    pub final_state: ConnectionState,
    pub attempts_made: u32,
    pub max_attempts: u32,
}

/// One simulated client: connect, authenticate, subscribe, listen, and
/// reconnect against its retry budget until the stop signal fires.
pub struct Session {
    identity: SessionIdentity,
    label: String,
    channel: String,
    settings: Arc<SessionSettings>,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<dyn Connector>,
    stats: SharedStats,
    stop: StopSignal,
    state: ConnectionState,
    budget: RetryBudget,
}

impl Session {
    pub fn new(
        identity: SessionIdentity,
        settings: Arc<SessionSettings>,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn Connector>,
        stats: SharedStats,
        stop: StopSignal,
    ) -> Self {
        let label = format!("{}{}", settings.client_label_prefix, identity.client_id);
        let channel = format!("{}{}", settings.channel_namespace, identity.channel_id);
        let budget = RetryBudget::new(settings.max_attempts);

        Self {
            identity,
            label,
            channel,
            settings,
            tokens,
            connector,
            stats,
            stop,
            state: ConnectionState::Disconnected,
            budget,
        }
    }

    pub async fn run(mut self) -> SessionOutcome {
        debug!("Client {}: assigned to {}", self.identity.client_id, self.channel);

        loop {
            let err = match self.connect_and_listen().await {
                Ok(()) => break,
                Err(err) => err,
            };

            self.set_state(ConnectionState::Disconnected);
            self.stats.increment(err.counter());
            let attempts = self.budget.record_failure();
            warn!(
                "Client {}: {} (attempt {}/{})",
                self.identity.client_id,
                err,
                attempts,
                self.budget.max_attempts()
            );

            if self.budget.is_exhausted() {
                error!(
                    "Client {}: max reconnection attempts reached",
                    self.identity.client_id
                );
                self.set_state(ConnectionState::Failed);
                self.stats.increment(Counter::ConnectionsFailed);
                return self.outcome();
            }

            let delay = self.settings.backoff.delay();
            debug!("Client {}: retrying in {:?}", self.identity.client_id, delay);
            if !self.stop.sleep(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Draining);
        self.outcome()
    }

    /// One pass through the connection lifecycle. `Ok` means the stop signal
    /// was observed; any error sends the session back to `Disconnected`.
    async fn connect_and_listen(&mut self) -> Result<()> {
        if self.stop.is_raised() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        self.stats.increment(Counter::ConnectionAttempts);
        info!(
            "Client {}: connecting (attempt {})",
            self.identity.client_id,
            self.budget.attempts_made() + 1
        );

        let Some(credential) = self
            .stop
            .guard(self.tokens.fetch_token(&self.identity.client_id))
            .await
        else {
            return Ok(());
        };
        let credential = credential?;
        debug!(
            "Client {}: token issued for {}",
            self.identity.client_id, credential.issued_for
        );

        let connect_timeout = self.settings.handshake_timeout;
        let Some(connected) = self
            .stop
            .guard(timeout(connect_timeout, self.connector.connect()))
            .await
        else {
            return Ok(());
        };
        let mut transport = connected.map_err(|_| {
            StressError::Connect(format!("no connection within {:?}", connect_timeout))
        })??;

        let result = self.handshake_and_listen(&mut *transport, &credential).await;
        let _ = timeout(CLOSE_TIMEOUT, transport.close()).await;
        result
    }

    async fn handshake_and_listen(
        &mut self,
        transport: &mut dyn Transport,
        credential: &Credential,
    ) -> Result<()> {
        let mut ids = CommandIds::default();

        self.set_state(ConnectionState::Authenticating);
        let id = ids.next();
        let connect = frames::connect_frame(id, &credential.token, &self.label);
        let Some(early) = self.request(transport, id, &connect).await? else {
            return Ok(());
        };

        self.set_state(ConnectionState::Subscribing);
        let id = ids.next();
        let subscribe = frames::subscribe_frame(id, &self.channel);
        let Some(batched) = self.request(transport, id, &subscribe).await? else {
            return Ok(());
        };

        self.set_state(ConnectionState::Active);
        self.stats.increment(Counter::ConnectionsCreated);
        info!("Client {}: subscribed to {}", self.identity.client_id, self.channel);

        // publications that rode along with the handshake replies
        let pending = (early + batched) as u64;
        if pending > 0 {
            self.stats.add(Counter::MessagesReceived, pending);
        }

        self.listen(transport, pending).await
    }

    /// Sends one command and waits for its reply. Yields the number of
    /// publications batched with the reply, or `None` if stopped.
    async fn request(
        &mut self,
        transport: &mut dyn Transport,
        id: u32,
        frame: &str,
    ) -> Result<Option<usize>> {
        let wait = self.settings.handshake_timeout;
        match self.stop.guard(timeout(wait, exchange(transport, id, frame))).await {
            None => Ok(None),
            Some(Ok(reply)) => reply.map(Some),
            Some(Err(_)) => Err(StressError::Protocol(format!(
                "no reply to command {} within {:?}",
                id, wait
            ))),
        }
    }

    /// Receive loop. Waits are bounded by the poll interval so the stop
    /// signal and the idle check are both seen promptly; a ping goes out
    /// once nothing has arrived for the idle threshold.
    async fn listen(&mut self, transport: &mut dyn Transport, mut received: u64) -> Result<()> {
        let poll = self.settings.poll_interval;
        let idle = self.settings.idle_threshold;
        let mut last_activity = Instant::now();

        loop {
            let Some(polled) = self.stop.guard(timeout(poll, transport.recv())).await else {
                return Ok(());
            };

            match polled {
                Err(_) => {
                    if last_activity.elapsed() >= idle {
                        warn!(
                            "Client {}: no messages for {:?}, sending ping",
                            self.identity.client_id, idle
                        );
                        if !self.bounded_send("ping", transport.ping()).await? {
                            return Ok(());
                        }
                        last_activity = Instant::now();
                    }
                }
                Ok(Err(err)) => return Err(into_closed(err)),
                Ok(Ok(None)) => {
                    return Err(StressError::TransportClosed("closed by peer".to_string()));
                }
                Ok(Ok(Some(frame))) => {
                    last_activity = Instant::now();
                    let batch = match &frame {
                        Frame::Text(text) => frames::classify(text),
                        Frame::Binary(_) => frames::Batch {
                            messages: 1,
                            heartbeat: false,
                        },
                    };

                    if batch.heartbeat {
                        let reply = transport.send_text(frames::HEARTBEAT_REPLY);
                        if !self.bounded_send("heartbeat reply", reply).await? {
                            return Ok(());
                        }
                    }
                    if batch.messages == 0 {
                        continue;
                    }

                    received += batch.messages as u64;
                    self.stats.add(Counter::MessagesReceived, batch.messages as u64);
                    debug!(
                        "Client {}: received {} message(s), {} total",
                        self.identity.client_id, batch.messages, received
                    );

                    let rolled = (0..batch.messages).find_map(|_| self.settings.disruption.roll());
                    if let Some(disruption) = rolled {
                        let pause = disruption.pause();
                        info!(
                            "Client {}: simulating {} for {:?}",
                            self.identity.client_id,
                            disruption.label(),
                            pause
                        );
                        if !self.stop.sleep(pause).await {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Runs a write on the live connection. A write that stalls past the
    /// handshake timeout counts as a dead connection. `Ok(false)` if stopped.
    async fn bounded_send<F>(&mut self, what: &str, send: F) -> Result<bool>
    where
        F: Future<Output = Result<()>>,
    {
        let wait = self.settings.handshake_timeout;
        match self.stop.guard(timeout(wait, send)).await {
            None => Ok(false),
            Some(Ok(sent)) => sent.map(|()| true).map_err(into_closed),
            Some(Err(_)) => Err(StressError::TransportClosed(format!(
                "{} stalled for {:?}",
                what, wait
            ))),
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(
                "Client {}: {} -> {}",
                self.identity.client_id, self.state, next
            );
            self.state = next;
        }
    }

    fn outcome(&self) -> SessionOutcome {
        debug_assert!(self.state.is_terminal());
        SessionOutcome {
            client_id: self.identity.client_id.clone(),
            final_state: self.state,
            attempts_made: self.budget.attempts_made(),
            max_attempts: self.budget.max_attempts(),
        }
    }
}

/// Handshake round trip. Anything short of a matching ack is a protocol
/// error, including transport failures mid-handshake.
async fn exchange(transport: &mut dyn Transport, id: u32, frame: &str) -> Result<usize> {
    transport.send_text(frame).await.map_err(into_protocol)?;
    loop {
        match transport.recv().await.map_err(into_protocol)? {
            None => {
                return Err(StressError::Protocol(format!(
                    "connection closed before reply to command {}",
                    id
                )));
            }
            Some(Frame::Text(text)) if frames::is_heartbeat(&text) => {
                transport
                    .send_text(frames::HEARTBEAT_REPLY)
                    .await
                    .map_err(into_protocol)?;
            }
            Some(Frame::Text(text)) => return frames::check_reply(id, &text),
            Some(Frame::Binary(_)) => {
                return Err(StressError::Protocol(format!(
                    "binary reply to command {}",
                    id
                )));
            }
        }
    }
}

fn into_protocol(err: StressError) -> StressError {
    match err {
        StressError::Protocol(_) => err,
        other => StressError::Protocol(other.to_string()),
    }
}

fn into_closed(err: StressError) -> StressError {
    match err {
        StressError::TransportClosed(_) => err,
        other => StressError::TransportClosed(other.to_string()),
    }
}
