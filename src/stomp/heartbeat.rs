// Keep-alive while connected
//
// Outgoing: a bare EOL every `keepalive_interval_ms`, on a timer that is
// aborted as soon as the link ends.
// Incoming: if `server_silence_timeout_ms` is set, a link that delivers
// nothing for that long is treated as dropped.

use log::{debug, warn};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::transport::{FrameSource, TransportEvent};
use super::{ClientError, StompClient};

impl StompClient {
    pub(crate) fn start_heartbeat(&self, generation: u64) {
        let period = self.inner.config.keepalive_interval();
        if period.is_zero() {
            debug!("Keep-alive disabled");
            return;
        }

        let client = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !client.is_current(generation) || !client.is_connected() {
                    debug!("Stopping heartbeat");
                    break;
                }
                match client.send_heartbeat(generation).await {
                    Ok(()) => debug!("Heartbeat sent"),
                    Err(e) => warn!("Error sending heartbeat: {}", e),
                }
            }
        });

        let mut shared = self.shared();
        if shared.generation == generation {
            shared.tasks.push(task);
        } else {
            task.abort();
        }
    }

    /// Next transport event, bounded by the silence watchdog when enabled
    pub(crate) async fn next_event(
        &self,
        source: &mut dyn FrameSource,
    ) -> Result<Option<TransportEvent>, ClientError> {
        match self.inner.config.server_silence_timeout() {
            Some(limit) => tokio::time::timeout(limit, source.next_event())
                .await
                .map_err(|_| ClientError::Timeout(format!("no data from broker for {:?}", limit))),
            None => Ok(source.next_event().await),
        }
    }
}
