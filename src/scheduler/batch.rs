//! The batch scheduler task.
//!
//! One task owns all sending. It reacts to [`SchedulerMessage`]s and runs at
//! most one drain pass at a time; a pass that decides not to send, or that
//! leaves requests behind, arms exactly one deferred pass through the
//! [`Clock`].
//!
//! # Pass criteria
//!
//! A pass drains when any of these hold:
//!
//! - it was started forced (explicit flush, app backgrounded, reconnect)
//! - queue depth is at least `flush_depth`
//! - the flush interval has elapsed since the pass was armed
//!
//! Otherwise it defers itself by the remaining interval. While a rate-limit
//! backoff is armed, reaching `flush_depth` does not start a pass early;
//! only the backoff timer or a forced pass does.
//!
//! # Draining
//!
//! The head is popped and sent until the queue is empty, connectivity is
//! lost, or a send ends in `PendingRetry` (rate limited). A rate-limited
//! request goes back to the head and stretches the next interval via
//! [`Backoff`]. Going offline leaves the queue and the interval untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use super::backoff::Backoff;
use super::message::{SchedulerHandle, SchedulerMessage};
use crate::config::CourierConfig;
use crate::host::{ActivityEvent, Cancellable, Clock, NetworkMonitor};
use crate::queue::RequestQueue;
use crate::request::{ApiRequest, RequestStatus, SendContext};
use crate::transport::Transport;

/// The armed or running pass.
#[derive(Debug, Clone, Copy)]
struct Runner {
    force: bool,
    armed_at: DateTime<Utc>,
    flush_interval: Duration,
    /// `flush_interval` came from a retryable failure.
    backing_off: bool,
}

/// Drains the [`RequestQueue`] through a [`Transport`].
pub struct BatchScheduler<T> {
    queue: Arc<RequestQueue>,
    transport: T,
    clock: Arc<dyn Clock>,
    network: Arc<dyn NetworkMonitor>,
    config: Arc<CourierConfig>,
    backoff: Backoff,
    handle: SchedulerHandle,

    /// `None` while idle: nothing armed, nothing running.
    runner: Option<Runner>,
    deferred: Option<(u64, Cancellable)>,
    next_ticket: u64,
    last_scheduled_delay: Option<Duration>,
}

impl<T: Transport> BatchScheduler<T> {
    /// `handle` must feed the receiver later passed to
    /// [`BatchScheduler::run`]; deferred passes are delivered through it.
    pub fn new(
        queue: Arc<RequestQueue>,
        transport: T,
        clock: Arc<dyn Clock>,
        network: Arc<dyn NetworkMonitor>,
        config: Arc<CourierConfig>,
        handle: SchedulerHandle,
    ) -> Self {
        BatchScheduler {
            backoff: Backoff::from_config(&config),
            queue,
            transport,
            clock,
            network,
            config,
            handle,
            runner: None,
            deferred: None,
            next_ticket: 0,
            last_scheduled_delay: None,
        }
    }

    /// The interval the next deferred pass waits, or the base interval for
    /// the current network class while idle.
    pub fn current_interval(&self) -> Duration {
        self.runner
            .map(|r| r.flush_interval)
            .unwrap_or_else(|| self.base_interval())
    }

    /// Delay given to the most recently armed deferred pass.
    pub fn last_scheduled_delay(&self) -> Option<Duration> {
        self.last_scheduled_delay
    }

    /// True when no pass is armed or running.
    pub fn is_idle(&self) -> bool {
        self.runner.is_none()
    }

    fn base_interval(&self) -> Duration {
        self.backoff.base_interval(self.network.network_class())
    }

    // ─── Event Loop ──────────────────────────────────────────────────────────────

    /// Processes messages until shutdown, then persists the queue index.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<SchedulerMessage>,
        shutdown: CancellationToken,
    ) {
        info!(queued = self.queue.len(), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }

                msg = rx.recv() => {
                    match msg {
                        Some(SchedulerMessage::Shutdown) => {
                            info!("Shutdown message received");
                            break;
                        }
                        Some(msg) => self.handle_message(msg).await,
                        None => {
                            info!("Scheduler channel closed");
                            break;
                        }
                    }
                }
            }
        }

        self.cancel_deferred();
        if let Err(e) = self.queue.persist_index() {
            error!(error = %e, "Failed to persist queue index on shutdown");
        }
        info!(queued = self.queue.len(), "Scheduler stopped");
    }

    /// Handles one message. Exposed to the crate so tests can drive the
    /// scheduler without spawning it.
    pub(crate) async fn handle_message(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Enqueued { depth } => {
                let backing_off = self.runner.is_some_and(|r| r.backing_off);
                if self.runner.is_none() {
                    debug!(depth, "Activating scheduler");
                    self.start_pass(false).await;
                } else if backing_off {
                    trace!(depth, "Enqueued during retry backoff, waiting");
                } else if depth >= self.config.flush_depth {
                    debug!(depth, "Flush depth reached");
                    self.start_pass(false).await;
                } else {
                    trace!(depth, "Enqueued, pass already armed");
                }
            }
            SchedulerMessage::Flush => {
                debug!("Flush requested");
                self.start_pass(true).await;
            }
            SchedulerMessage::Tick { ticket } => {
                let armed = self.deferred.as_ref().map(|(armed, _)| *armed);
                if armed == Some(ticket) {
                    self.deferred = None;
                    self.run_pass(true).await;
                } else {
                    trace!(ticket, ?armed, "Stale tick ignored");
                }
            }
            SchedulerMessage::NetworkChanged { connected: true } => {
                debug!("Network connected, flushing");
                self.start_pass(true).await;
            }
            SchedulerMessage::NetworkChanged { connected: false } => {
                debug!("Network lost, pausing until reconnect or enqueue");
                self.cancel_deferred();
                self.runner = None;
            }
            SchedulerMessage::Lifecycle(ActivityEvent::AllStopped) => {
                debug!("App backgrounded, flushing");
                self.start_pass(true).await;
            }
            SchedulerMessage::Lifecycle(ActivityEvent::FirstStarted) => {
                debug!("App foregrounded");
            }
            SchedulerMessage::Shutdown => {
                // Handled in run()
            }
        }
    }

    /// Cancels any armed pass and runs one now.
    ///
    /// An existing backoff interval is kept so a forced pass that finds the
    /// network gone does not forget a rate limit.
    async fn start_pass(&mut self, force: bool) {
        self.cancel_deferred();
        let flush_interval = self.current_interval();
        let backing_off = self.runner.is_some_and(|r| r.backing_off);
        self.runner = Some(Runner {
            force,
            armed_at: self.clock.now(),
            flush_interval,
            backing_off,
        });
        self.run_pass(false).await;
    }

    /// Evaluates the criteria and, if they hold, drains.
    ///
    /// `timer_fired` is set for deferred passes: their wait is the interval
    /// by construction.
    #[instrument(skip_all, fields(timer_fired = timer_fired))]
    async fn run_pass(&mut self, timer_fired: bool) {
        let Some(runner) = self.runner else {
            trace!("No pass armed");
            return;
        };

        let elapsed = (self.clock.now() - runner.armed_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let depth = self.queue.len();
        let due = runner.force
            || timer_fired
            || depth >= self.config.flush_depth
            || elapsed >= runner.flush_interval;

        if !due {
            let remaining = runner.flush_interval.saturating_sub(elapsed);
            trace!(depth, remaining_ms = remaining.as_millis() as u64, "Flush criteria not met");
            self.defer(remaining);
            return;
        }

        let class = self.network.network_class();
        let mut interval = runner.flush_interval;
        let mut backing_off = runner.backing_off;
        let mut sent = 0usize;
        {
            let ctx = SendContext {
                transport: &self.transport,
                network: self.network.as_ref(),
                clock: self.clock.as_ref(),
                max_retries: self.config.max_retries,
            };
            let queue = Arc::clone(&self.queue);
            let observer = move |request: &ApiRequest| queue.broadcast(request);

            loop {
                if !self.network.is_connected() {
                    debug!(queued = self.queue.len(), "Offline, ending pass");
                    break;
                }
                let Some(mut request) = self.queue.pop_front() else {
                    break;
                };
                let status = request.send(&ctx, &observer).await;
                match status {
                    RequestStatus::Unsent => {
                        debug!(request_id = %request.id, "Offline, ending pass");
                        self.queue.push_front(request);
                        break;
                    }
                    RequestStatus::Complete | RequestStatus::Failed => {
                        sent += 1;
                        self.queue.forget(&request);
                        interval = self.backoff.base_interval(class);
                        backing_off = false;
                    }
                    RequestStatus::PendingRetry => {
                        interval = self.backoff.retry_interval(&request, class);
                        backing_off = true;
                        debug!(
                            request_id = %request.id,
                            attempts = request.attempts,
                            retry_in_ms = interval.as_millis() as u64,
                            "Rate limited, backing off"
                        );
                        self.queue.push_front(request);
                        break;
                    }
                    RequestStatus::Inflight => {
                        error!(
                            request_id = %request.id,
                            "Request still inflight after send, dropping it"
                        );
                        self.queue.forget(&request);
                    }
                }
            }
        }

        if let Err(e) = self.queue.persist_index() {
            error!(error = %e, "Failed to persist queue index after pass");
        }

        if self.queue.is_empty() {
            debug!(sent, "Queue drained");
            self.runner = None;
        } else {
            debug!(sent, remaining = self.queue.len(), "Pass ended with requests queued");
            self.runner = Some(Runner {
                force: false,
                armed_at: self.clock.now(),
                flush_interval: interval,
                backing_off,
            });
            self.defer(interval);
        }
    }

    /// Arms the single deferred pass, replacing any previous one.
    fn defer(&mut self, delay: Duration) {
        self.cancel_deferred();
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let handle = self.handle.clone();
        let cancellable = self
            .clock
            .schedule(delay, Box::new(move || handle.tick(ticket)));
        self.deferred = Some((ticket, cancellable));
        self.last_scheduled_delay = Some(delay);
        trace!(ticket, delay_ms = delay.as_millis() as u64, "Deferred next pass");
    }

    fn cancel_deferred(&mut self) {
        if let Some((ticket, cancellable)) = self.deferred.take() {
            cancellable.cancel();
            trace!(ticket, "Cancelled deferred pass");
        }
    }
}
