use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::ChatSubmitter;
use crate::session::jitter;
use crate::signal::StopSignal;
use crate::stats::{Counter, SharedStats};

/// Posts chat messages into one channel, independent of any session.
pub struct MessageInjector {
    chat: Arc<dyn ChatSubmitter>,
    stats: SharedStats,
    stop: StopSignal,
}

impl MessageInjector {
    pub fn new(chat: Arc<dyn ChatSubmitter>, stats: SharedStats, stop: StopSignal) -> Self {
        Self { chat, stats, stop }
    }

    /// Submits up to `message_count` messages with a jittered pause between
    /// them. Failures are counted and skipped. Returns how many were sent.
    pub async fn run(
        mut self,
        channel_id: String,
        message_count: u32,
        delay_range: RangeInclusive<Duration>,
    ) -> u32 {
        info!(
            "Injector for {}: sending {} messages",
            channel_id, message_count
        );
        let mut sent = 0;

        for n in 1..=message_count {
            let text = format!("Stress test message {}", n);
            let Some(result) = self.stop.guard(self.chat.submit(&channel_id, &text)).await else {
                break;
            };

            match result {
                Ok(receipt) => {
                    sent += 1;
                    self.stats.increment(Counter::MessagesSent);
                    debug!(
                        "Injector for {}: message {} accepted into {} as {}",
                        channel_id, n, receipt.channel, receipt.message_id
                    );
                }
                Err(err) => {
                    self.stats.increment(err.counter());
                    warn!("Injector for {}: message {}: {}", channel_id, n, err);
                }
            }

            if n < message_count && !self.stop.sleep(jitter(&delay_range)).await {
                break;
            }
        }

        info!(
            "Injector for {}: done, {}/{} messages sent",
            channel_id, sent, message_count
        );
        sent
    }
}
