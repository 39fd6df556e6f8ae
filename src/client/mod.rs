//! The producer-facing API.
//!
//! [`ApiClient`] is what producers (the coalescer, the [`Courier`] facade)
//! use to hand requests to the engine. Every method returns immediately;
//! sending happens later on the scheduler task.
//!
//! [`Courier`]: crate::courier::Courier

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::config::CourierConfig;
use crate::observers::{Listener, ObserverHandle};
use crate::profile::ProfileState;
use crate::queue::RequestQueue;
use crate::request::{ApiRequest, RequestFactory, RequestStatus};
use crate::scheduler::SchedulerHandle;
use crate::types::{ApiKey, Event, Profile};

/// Enqueues requests and exposes their lifecycle broadcasts.
pub trait ApiClient: Send + Sync {
    fn enqueue_profile(&self, profile: &Profile) -> ApiRequest;

    fn enqueue_push_token(&self, token: &str, profile: &Profile) -> ApiRequest;

    fn enqueue_event(&self, event: &Event, profile: &Profile) -> ApiRequest;

    /// Unregisters `token` from the account identified by `old_key`.
    fn enqueue_unregister_push_token(
        &self,
        old_key: &ApiKey,
        token: &str,
        profile: &Profile,
    ) -> ApiRequest;

    /// Forces a drain pass regardless of the flush criteria.
    fn flush_now(&self);

    /// Subscribes to request broadcasts. With `include_history`, the
    /// listener first sees every request currently queued.
    fn on_request_observed(
        &self,
        listener: Listener<ApiRequest>,
        include_history: bool,
    ) -> ObserverHandle;

    fn off_request_observed(&self, handle: ObserverHandle);
}

/// [`ApiClient`] backed by the persistent queue and the batch scheduler.
pub struct DeliveryClient {
    queue: Arc<RequestQueue>,
    scheduler: SchedulerHandle,
    factory: RequestFactory,
    state: Arc<ProfileState>,
    config: Arc<CourierConfig>,
    logger: ObserverHandle,
}

impl DeliveryClient {
    pub fn new(
        queue: Arc<RequestQueue>,
        scheduler: SchedulerHandle,
        factory: RequestFactory,
        state: Arc<ProfileState>,
        config: Arc<CourierConfig>,
    ) -> Self {
        let max_retries = config.max_retries;
        let logger = queue.on_observe(
            Box::new(move |request: &ApiRequest| log_request(request, max_retries)),
            false,
        );
        DeliveryClient {
            queue,
            scheduler,
            factory,
            state,
            config,
            logger,
        }
    }

    /// The key requests are attributed to: the stored one, else the
    /// configured one.
    fn api_key(&self) -> ApiKey {
        self.state
            .api_key()
            .unwrap_or_else(|| self.config.api_key.clone())
    }

    fn enqueue(&self, request: ApiRequest) -> ApiRequest {
        let outcome = self.queue.enqueue(vec![request.clone()], false);
        if outcome.added > 0 {
            debug!(
                request_id = %request.id,
                kind = %request.kind,
                depth = outcome.depth,
                "Request enqueued"
            );
            self.scheduler.notify_enqueued(outcome.depth);
        } else {
            trace!(request_id = %request.id, "Request already queued");
        }
        request
    }
}

impl ApiClient for DeliveryClient {
    fn enqueue_profile(&self, profile: &Profile) -> ApiRequest {
        self.enqueue(self.factory.profile(&self.api_key(), profile))
    }

    fn enqueue_push_token(&self, token: &str, profile: &Profile) -> ApiRequest {
        self.enqueue(self.factory.push_token(&self.api_key(), token, profile))
    }

    fn enqueue_event(&self, event: &Event, profile: &Profile) -> ApiRequest {
        self.enqueue(self.factory.event(&self.api_key(), event, profile))
    }

    fn enqueue_unregister_push_token(
        &self,
        old_key: &ApiKey,
        token: &str,
        profile: &Profile,
    ) -> ApiRequest {
        self.enqueue(self.factory.unregister_push_token(old_key, token, profile))
    }

    fn flush_now(&self) {
        self.scheduler.flush();
    }

    fn on_request_observed(
        &self,
        listener: Listener<ApiRequest>,
        include_history: bool,
    ) -> ObserverHandle {
        self.queue.on_observe(listener, include_history)
    }

    fn off_request_observed(&self, handle: ObserverHandle) {
        self.queue.off_observe(handle);
    }
}

impl Drop for DeliveryClient {
    fn drop(&mut self) {
        self.queue.off_observe(self.logger);
    }
}

impl fmt::Debug for DeliveryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryClient")
            .field("queue", &self.queue)
            .field("logger", &self.logger)
            .finish_non_exhaustive()
    }
}

fn log_request(request: &ApiRequest, max_retries: u32) {
    match request.status() {
        RequestStatus::Unsent => {
            debug!(request_id = %request.id, kind = %request.kind, "Request queued");
        }
        RequestStatus::Inflight => debug!(
            request_id = %request.id,
            kind = %request.kind,
            attempt = request.attempts,
            "Request sending"
        ),
        RequestStatus::Complete => debug!(
            request_id = %request.id,
            kind = %request.kind,
            code = ?request.response_code,
            "Request complete"
        ),
        RequestStatus::PendingRetry => warn!(
            request_id = %request.id,
            kind = %request.kind,
            code = ?request.response_code,
            attempts_remaining = max_retries.saturating_sub(request.attempts),
            "Request will be retried"
        ),
        RequestStatus::Failed => error!(
            request_id = %request.id,
            kind = %request.kind,
            code = ?request.response_code,
            body = request.response_body.as_deref().unwrap_or_default(),
            "Request failed"
        ),
    }
}
