//! End-to-end scenarios for the batch scheduler.
//!
//! The scheduler is driven without spawning: messages are pumped from the
//! channel into `handle_message`, and deferred passes fire when the manual
//! clock is advanced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{CourierConfig, FlushIntervals};
use crate::host::{ActivityEvent, ManualClock, ManualNetworkMonitor, NetworkMonitor};
use crate::queue::{INDEX_KEY, RequestQueue};
use crate::request::{ApiRequest, RequestStatus};
use crate::store::{DataStore, InMemoryDataStore};
use crate::test_utils::{MockReply, MockTransport, test_request};
use crate::types::RequestId;

use super::{BatchScheduler, SchedulerHandle, SchedulerMessage};

// ─── Test Helpers ───

struct Harness {
    store: Arc<InMemoryDataStore>,
    queue: Arc<RequestQueue>,
    transport: Arc<MockTransport>,
    clock: ManualClock,
    network: Arc<ManualNetworkMonitor>,
    handle: SchedulerHandle,
    scheduler: BatchScheduler<Arc<MockTransport>>,
    rx: mpsc::UnboundedReceiver<SchedulerMessage>,
}

impl Harness {
    fn new(config: CourierConfig) -> Self {
        let store = Arc::new(InMemoryDataStore::new());
        let queue = Arc::new(RequestQueue::new(store.clone()));
        queue.restore(false);
        let transport = Arc::new(MockTransport::new());
        let clock = ManualClock::new();
        let network = Arc::new(ManualNetworkMonitor::new(true));
        let (handle, rx) = SchedulerHandle::channel();
        let scheduler = BatchScheduler::new(
            queue.clone(),
            transport.clone(),
            Arc::new(clock.clone()),
            network.clone(),
            Arc::new(config),
            handle.clone(),
        );
        Harness {
            store,
            queue,
            transport,
            clock,
            network,
            handle,
            scheduler,
            rx,
        }
    }

    fn with_defaults() -> Self {
        Self::new(base_config())
    }

    /// Queues `request` and tells the scheduler, as the client does.
    fn enqueue(&self, request: ApiRequest) -> RequestId {
        let id = request.id;
        let outcome = self.queue.enqueue(vec![request], false);
        self.handle.notify_enqueued(outcome.depth);
        id
    }

    /// Feeds every waiting message to the scheduler.
    async fn pump(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.scheduler.handle_message(msg).await;
        }
    }

    /// Moves time forward, then handles whatever came due.
    async fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.pump().await;
    }
}

fn base_config() -> CourierConfig {
    CourierConfig::new("Xr5bFG").with_jitter_max(Duration::ZERO)
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ─── Flush triggers ───

#[tokio::test]
async fn flush_depth_drains_whole_queue() {
    let config = base_config()
        .with_flush_depth(10)
        .with_flush_intervals(FlushIntervals::uniform(secs(365 * 24 * 3600)));
    let mut h = Harness::new(config);

    let mut ids = Vec::new();
    for _ in 0..9 {
        ids.push(h.enqueue(test_request()));
        h.pump().await;
    }
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.queue.len(), 9);

    ids.push(h.enqueue(test_request()));
    h.pump().await;

    assert_eq!(h.transport.sent_ids(), ids);
    assert!(h.queue.is_empty());
    assert!(h.scheduler.is_idle());
    for id in &ids {
        assert_eq!(h.store.fetch(&id.to_key()).unwrap(), None);
    }
}

#[tokio::test]
async fn activation_defers_until_interval_elapses() {
    let mut h = Harness::with_defaults();

    h.enqueue(test_request());
    h.pump().await;
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.clock.next_due_in(), Some(secs(10)));

    h.advance(secs(9)).await;
    assert!(h.transport.sent().is_empty());

    h.advance(secs(1)).await;
    assert_eq!(h.transport.sent().len(), 1);
    assert!(h.queue.is_empty());
    assert_eq!(h.clock.pending_count(), 0);
}

#[tokio::test]
async fn explicit_flush_drains_immediately() {
    let mut h = Harness::with_defaults();
    let a = h.enqueue(test_request());
    let b = h.enqueue(test_request());

    h.handle.flush();
    h.pump().await;

    assert_eq!(h.transport.sent_ids(), vec![a, b]);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn all_stopped_forces_pass_and_first_started_does_not() {
    let mut h = Harness::with_defaults();
    h.enqueue(test_request());
    h.pump().await;

    h.handle.lifecycle(ActivityEvent::FirstStarted);
    h.pump().await;
    assert!(h.transport.sent().is_empty());

    h.handle.lifecycle(ActivityEvent::AllStopped);
    h.pump().await;
    assert_eq!(h.transport.sent().len(), 1);
}

// ─── Backoff ───

#[tokio::test]
async fn rate_limit_backoff_grows_then_resets() {
    let mut h = Harness::with_defaults();
    let a = test_request();
    let a_id = a.id;
    h.transport.script(
        a_id,
        [
            MockReply::Status(429),
            MockReply::Status(429),
            MockReply::Status(429),
            MockReply::Status(202),
        ],
    );
    // Losing the network right as A finally succeeds leaves B queued, so
    // the interval after the success is observable.
    let network = h.network.clone();
    h.transport.set_hook(move |request: &ApiRequest| {
        if request.id == a_id && request.attempts == 4 {
            network.set_connected(false);
        }
    });

    h.enqueue(a);
    let b = h.enqueue(test_request());
    h.pump().await;

    h.advance(secs(10)).await;
    assert_eq!(h.scheduler.last_scheduled_delay(), Some(secs(10)));
    h.advance(secs(10)).await;
    assert_eq!(h.scheduler.last_scheduled_delay(), Some(secs(20)));
    h.advance(secs(20)).await;
    assert_eq!(h.scheduler.last_scheduled_delay(), Some(secs(30)));
    h.advance(secs(30)).await;

    assert_eq!(
        h.clock.scheduled_delays(),
        vec![secs(10), secs(10), secs(20), secs(30), secs(10)]
    );
    assert_eq!(h.transport.sent_ids(), vec![a_id; 4]);
    assert_eq!(h.queue.ids(), vec![b]);
    assert_eq!(h.queue.snapshot()[0].attempts, 0);
    assert_eq!(h.scheduler.current_interval(), secs(10));
}

#[tokio::test]
async fn retry_after_header_sets_next_interval() {
    let mut h = Harness::with_defaults();
    let request = test_request();
    h.transport.script(
        request.id,
        [MockReply::WithHeaders(
            429,
            vec![("Retry-After".to_string(), "42".to_string())],
        )],
    );
    let id = h.enqueue(request);

    h.handle.flush();
    h.pump().await;

    assert_eq!(h.scheduler.last_scheduled_delay(), Some(secs(42)));
    assert_eq!(h.clock.next_due_in(), Some(secs(42)));
    assert_eq!(h.queue.ids(), vec![id]);
    assert_eq!(h.queue.snapshot()[0].status(), RequestStatus::PendingRetry);

    h.advance(secs(42)).await;
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn flush_depth_waits_out_retry_backoff() {
    let mut h = Harness::new(base_config().with_flush_depth(2));
    let head = test_request();
    h.transport.script(
        head.id,
        [MockReply::WithHeaders(
            429,
            vec![("Retry-After".to_string(), "60".to_string())],
        )],
    );
    let head_id = h.enqueue(head);
    h.handle.flush();
    h.pump().await;
    assert_eq!(h.transport.sent_ids(), vec![head_id]);

    let b = h.enqueue(test_request());
    let c = h.enqueue(test_request());
    h.pump().await;

    assert_eq!(h.transport.sent_ids(), vec![head_id]);
    assert_eq!(h.queue.ids(), vec![head_id, b, c]);
    assert_eq!(h.queue.snapshot()[0].attempts, 1);
    assert_eq!(h.clock.next_due_in(), Some(secs(60)));

    h.advance(secs(59)).await;
    h.enqueue(test_request());
    h.pump().await;
    assert_eq!(h.transport.sent().len(), 1);

    h.advance(secs(1)).await;
    assert_eq!(h.transport.sent().len(), 5);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn explicit_flush_overrides_retry_backoff() {
    let mut h = Harness::new(base_config().with_flush_depth(2));
    let head = test_request();
    h.transport.script(head.id, [MockReply::Status(429)]);
    let head_id = h.enqueue(head);
    h.handle.flush();
    h.pump().await;

    let b = h.enqueue(test_request());
    h.pump().await;
    assert_eq!(h.transport.sent_ids(), vec![head_id]);

    h.handle.flush();
    h.pump().await;

    assert_eq!(h.transport.sent_ids(), vec![head_id, head_id, b]);
    assert!(h.queue.is_empty());
    assert!(h.scheduler.is_idle());
}

#[tokio::test]
async fn offline_pass_keeps_pending_retry_untouched() {
    let mut h = Harness::with_defaults();
    let request = test_request();
    h.transport.script(request.id, [MockReply::Status(429), MockReply::Status(429)]);
    let id = h.enqueue(request);
    h.handle.flush();
    h.pump().await;
    h.advance(secs(10)).await;
    assert_eq!(h.scheduler.last_scheduled_delay(), Some(secs(20)));

    h.network.set_connected(false);
    h.handle.flush();
    h.pump().await;

    assert_eq!(h.transport.sent().len(), 2);
    let queued = h.queue.snapshot();
    assert_eq!(queued[0].id, id);
    assert_eq!(queued[0].status(), RequestStatus::PendingRetry);
    assert_eq!(queued[0].attempts, 2);
    assert_eq!(h.scheduler.current_interval(), secs(20));

    h.network.set_connected(true);
    h.handle.network_changed(true);
    h.pump().await;
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn retries_exhausted_fails_request() {
    let mut h = Harness::new(base_config().with_max_retries(2));
    let request = test_request();
    h.transport.script(request.id, vec![MockReply::Status(429); 3]);
    let id = h.enqueue(request);

    h.handle.flush();
    h.pump().await;
    h.advance(secs(10)).await;
    assert_eq!(h.queue.ids(), vec![id]);

    h.advance(secs(20)).await;

    assert!(h.queue.is_empty());
    assert_eq!(h.transport.sent_ids(), vec![id; 3]);
    assert_eq!(h.store.fetch(&id.to_key()).unwrap(), None);
}

#[tokio::test]
async fn failed_request_is_removed_and_drain_continues() {
    let mut h = Harness::with_defaults();
    let bad = test_request();
    h.transport.script(bad.id, [MockReply::Status(500)]);
    let bad = h.enqueue(bad);
    let good = h.enqueue(test_request());

    h.handle.flush();
    h.pump().await;

    assert_eq!(h.transport.sent_ids(), vec![bad, good]);
    assert!(h.queue.is_empty());
    assert_eq!(h.store.fetch(&bad.to_key()).unwrap(), None);
    assert_eq!(h.store.fetch(INDEX_KEY).unwrap().as_deref(), Some("[]"));
}

#[tokio::test]
async fn transport_error_fails_request() {
    let mut h = Harness::with_defaults();
    let request = test_request();
    h.transport.script(request.id, [MockReply::Error]);
    h.enqueue(request);

    h.handle.flush();
    h.pump().await;

    assert!(h.queue.is_empty());
    assert!(h.scheduler.is_idle());
}

// ─── Connectivity ───

#[tokio::test]
async fn offline_pass_keeps_order_and_attempts() {
    let mut h = Harness::with_defaults();
    h.network.set_connected(false);
    let ids: Vec<_> = (0..3).map(|_| h.enqueue(test_request())).collect();

    h.handle.flush();
    h.pump().await;

    assert!(h.transport.sent().is_empty());
    assert_eq!(h.queue.ids(), ids);
    for request in h.queue.snapshot() {
        assert_eq!(request.status(), RequestStatus::Unsent);
        assert_eq!(request.attempts, 0);
    }
}

#[tokio::test]
async fn disconnect_cancels_deferred_pass_and_reconnect_flushes() {
    let mut h = Harness::with_defaults();
    h.enqueue(test_request());
    h.pump().await;
    assert_eq!(h.clock.pending_count(), 1);

    h.network.set_connected(false);
    h.handle.network_changed(false);
    h.pump().await;
    assert_eq!(h.clock.pending_count(), 0);
    assert!(h.scheduler.is_idle());

    h.advance(secs(60)).await;
    assert!(h.transport.sent().is_empty());

    h.network.set_connected(true);
    h.handle.network_changed(true);
    h.pump().await;
    assert_eq!(h.transport.sent().len(), 1);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn stale_tick_is_ignored() {
    let mut h = Harness::with_defaults();
    h.network.set_connected(false);
    h.enqueue(test_request());
    h.pump().await;

    // The forced pass finds no network and re-arms, superseding ticket 1.
    h.handle.flush();
    h.pump().await;
    h.network.set_connected(true);

    h.scheduler
        .handle_message(SchedulerMessage::Tick { ticket: 1 })
        .await;
    assert!(h.transport.sent().is_empty());

    h.scheduler
        .handle_message(SchedulerMessage::Tick { ticket: 2 })
        .await;
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn metered_network_uses_its_interval() {
    let mut h = Harness::with_defaults();
    h.network.set_class(crate::host::NetworkClass::Metered);

    h.enqueue(test_request());
    h.pump().await;

    assert_eq!(h.network.network_class(), crate::host::NetworkClass::Metered);
    assert_eq!(h.clock.next_due_in(), Some(secs(30)));
}

// ─── Event loop ───

#[tokio::test]
async fn run_persists_index_on_shutdown() {
    let h = Harness::with_defaults();
    h.network.set_connected(false);
    let id = h.enqueue(test_request());
    h.store.clear(INDEX_KEY).unwrap();

    let Harness {
        store,
        handle,
        scheduler,
        rx,
        ..
    } = h;
    let task = tokio::spawn(scheduler.run(rx, CancellationToken::new()));
    handle.shutdown();
    task.await.unwrap();

    let index = store.fetch(INDEX_KEY).unwrap().unwrap();
    assert!(index.contains(&id.to_key()));
}

#[tokio::test]
async fn run_stops_on_cancellation() {
    let h = Harness::with_defaults();
    let Harness { scheduler, rx, handle, .. } = h;
    let token = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(rx, token.clone()));

    token.cancel();
    task.await.unwrap();

    assert!(handle.is_closed());
}
