//! Container event watcher.
//!
//! Turns container lifecycle events into debounced pass requests, requests a
//! pass after every re-subscription and after a first subscription that
//! only succeeded on retry (events may have been missed while the stream was
//! down), and requests a periodic pass for drift that produces no
//! events at all.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::metrics::{self, ReconnectReason, TriggerReason};
use crate::reconciler::PassTrigger;
use crate::source::ContainerSource;

/// Timing knobs for the watcher.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Quiet period after the last relevant event before a pass is requested.
    pub debounce: Duration,
    /// Interval between periodic passes.
    pub resync_interval: Duration,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            resync_interval: Duration::from_secs(300),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&ReconcileConfig> for WatcherSettings {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            debounce: config.debounce(),
            resync_interval: config.resync_interval(),
            ..Self::default()
        }
    }
}

/// Watches a [`ContainerSource`] and requests passes.
pub struct EventWatcher {
    source: Arc<dyn ContainerSource>,
    trigger: PassTrigger,
    settings: WatcherSettings,
}

impl EventWatcher {
    /// Create a watcher.
    pub fn new(
        source: Arc<dyn ContainerSource>,
        trigger: PassTrigger,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            source,
            trigger,
            settings,
        }
    }

    /// Watch events and run the periodic timer until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tokio::join!(self.watch_events(&cancel), self.resync(&cancel));
    }

    async fn watch_events(&self, cancel: &CancellationToken) {
        let mut backoff = self.settings.initial_backoff;
        let mut connected_once = false;
        // Set once a subscription is lost or an attempt fails; the next
        // successful subscribe then requests a pass.
        let mut missed_events = false;

        let debounce = sleep(Duration::ZERO);
        tokio::pin!(debounce);
        let mut armed = false;

        loop {
            if cancel.is_cancelled() {
                info!("Event watcher shutting down");
                return;
            }

            let mut stream = match self.source.subscribe().await {
                Ok(stream) => {
                    backoff = self.settings.initial_backoff;
                    if connected_once {
                        info!("Resubscribed to container events");
                    } else {
                        info!("Subscribed to container events");
                        metrics::record_watcher_reconnect(ReconnectReason::InitialConnect);
                        connected_once = true;
                    }
                    if missed_events {
                        missed_events = false;
                        // A pending burst is covered by the reconnect pass.
                        armed = false;
                        self.trigger.request(TriggerReason::Reconnect);
                    }
                    stream
                }
                Err(e) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Failed to subscribe to container events");
                    metrics::record_watcher_reconnect(ReconnectReason::Error);
                    missed_events = true;
                    if !self.back_off(cancel, &mut backoff).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!("Event watcher received shutdown signal");
                        return;
                    }

                    _ = &mut debounce, if armed => {
                        armed = false;
                        self.trigger.request(TriggerReason::Event);
                    }

                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => {
                                metrics::record_event(event.action.as_str());
                                if event.action.is_relevant() {
                                    debug!(
                                        container = %event.container_id,
                                        action = event.action.as_str(),
                                        "container event"
                                    );
                                    debounce
                                        .as_mut()
                                        .reset(Instant::now() + self.settings.debounce);
                                    armed = true;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Container event stream failed");
                                metrics::record_watcher_reconnect(ReconnectReason::Error);
                                break;
                            }
                            None => {
                                info!("Container event stream ended");
                                metrics::record_watcher_reconnect(ReconnectReason::StreamEnded);
                                break;
                            }
                        }
                    }
                }
            }

            missed_events = true;
            if !self.back_off(cancel, &mut backoff).await {
                return;
            }
        }
    }

    /// Sleep for `backoff` and double it. Returns false when cancelled first.
    async fn back_off(&self, cancel: &CancellationToken, backoff: &mut Duration) -> bool {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Event watcher shutting down");
                false
            }

            _ = sleep(*backoff) => {
                *backoff = (*backoff * 2).min(self.settings.max_backoff);
                true
            }
        }
    }

    async fn resync(&self, cancel: &CancellationToken) {
        let period = self.settings.resync_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return,

                _ = ticker.tick() => {
                    self.trigger.request(TriggerReason::Periodic);
                }
            }
        }
    }
}
