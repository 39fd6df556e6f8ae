//! The service object hosts construct once and talk to.
//!
//! [`Courier::start`] wires the pieces together:
//!
//! 1. Restores the request queue from the store.
//! 2. Builds the profile state and the [`DeliveryClient`].
//! 3. Attaches the [`StateCoalescer`] and adopts the configured API key.
//! 4. Spawns the [`BatchScheduler`] task.
//! 5. Forwards host network and lifecycle events to the scheduler.
//!
//! Everything after `start` is fire-and-forget: no method on the returned
//! [`Courier`] fails, and failures surface only through request broadcasts
//! and logs.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{ApiClient, DeliveryClient};
use crate::config::{ConfigError, CourierConfig};
use crate::host::{ActivityEvent, Clock, LifecycleMonitor, NetworkMonitor};
use crate::observers::{Listener, ObserverHandle};
use crate::profile::{ProfileState, StateCoalescer};
use crate::queue::RequestQueue;
use crate::request::{ApiRequest, RequestFactory};
use crate::scheduler::{BatchScheduler, SchedulerHandle};
use crate::store::DataStore;
use crate::transport::Transport;
use crate::types::{ApiKey, Event, Profile, ProfileKey};

/// Errors that can occur while starting a [`Courier`].
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// `start` was called outside a Tokio runtime.
    #[error("no Tokio runtime: {0}")]
    Runtime(#[from] TryCurrentError),
}

pub type Result<T> = std::result::Result<T, CourierError>;

/// Capabilities the host provides.
#[derive(Clone)]
pub struct HostCapabilities {
    pub store: Arc<dyn DataStore>,
    pub clock: Arc<dyn Clock>,
    pub network: Arc<dyn NetworkMonitor>,
    pub lifecycle: Arc<dyn LifecycleMonitor>,
}

impl fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCapabilities").finish_non_exhaustive()
    }
}

/// A running delivery engine.
pub struct Courier {
    config: Arc<CourierConfig>,
    host: HostCapabilities,
    queue: Arc<RequestQueue>,
    state: Arc<ProfileState>,
    client: Arc<DeliveryClient>,
    coalescer: StateCoalescer,
    scheduler: SchedulerHandle,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    network_handle: ObserverHandle,
    lifecycle_handle: ObserverHandle,
}

impl Courier {
    /// Starts the engine. Must be called from within a Tokio runtime.
    pub fn start<T>(config: CourierConfig, host: HostCapabilities, transport: T) -> Result<Self>
    where
        T: Transport + 'static,
    {
        config.validate()?;
        let runtime = Handle::try_current()?;
        let config = Arc::new(config);

        let queue = Arc::new(RequestQueue::new(host.store.clone()));
        let restored = queue.restore(false);

        let state = ProfileState::new(host.store.clone());

        let (scheduler, rx) = SchedulerHandle::channel();
        let client = Arc::new(DeliveryClient::new(
            queue.clone(),
            scheduler.clone(),
            RequestFactory::new(config.clone(), host.clock.clone()),
            state.clone(),
            config.clone(),
        ));
        let coalescer =
            StateCoalescer::attach(state.clone(), client.clone(), host.clock.clone(), &config);
        // A key different from the stored one moves the push token over.
        state.set_api_key(config.api_key.clone());

        let shutdown = CancellationToken::new();
        let batch = BatchScheduler::new(
            queue.clone(),
            transport,
            host.clock.clone(),
            host.network.clone(),
            config.clone(),
            scheduler.clone(),
        );
        let task = runtime.spawn(batch.run(rx, shutdown.clone()));

        let handle = scheduler.clone();
        let network_handle = host
            .network
            .on_network_change(Box::new(move |connected: &bool| {
                handle.network_changed(*connected);
            }));
        let handle = scheduler.clone();
        let lifecycle_handle =
            host.lifecycle
                .on_activity_event(Box::new(move |event: &ActivityEvent| {
                    handle.lifecycle(*event);
                }));

        if restored > 0 {
            scheduler.notify_enqueued(queue.len());
        }
        info!(restored, "Courier started");

        Ok(Courier {
            config,
            host,
            queue,
            state,
            client,
            coalescer,
            scheduler,
            shutdown,
            task: Mutex::new(Some(task)),
            network_handle,
            lifecycle_handle,
        })
    }

    // ─── Producers ───────────────────────────────────────────────────────────────

    /// Queues `event` for the current profile.
    pub fn track(&self, event: Event) -> ApiRequest {
        self.client
            .enqueue_event(&event, &self.state.as_profile(false))
    }

    pub fn set_external_id(&self, id: impl Into<String>) {
        self.state.set_external_id(id);
    }

    pub fn set_email(&self, email: impl Into<String>) {
        self.state.set_email(email);
    }

    pub fn set_phone_number(&self, phone: impl Into<String>) {
        self.state.set_phone_number(phone);
    }

    pub fn set_attribute(&self, key: ProfileKey, value: impl Into<Value>) {
        self.state.set_attribute(key, value);
    }

    pub fn set_profile(&self, profile: Profile) {
        self.state.set_profile(profile);
    }

    pub fn set_push_token(&self, token: impl Into<String>) {
        self.state.set_push_token(token);
    }

    /// Switches account. A registered push token moves to the new account.
    pub fn set_api_key(&self, key: impl Into<ApiKey>) {
        self.state.set_api_key(key);
    }

    /// Sends whatever is pending for the current user, then forgets them.
    pub fn reset_profile(&self) {
        self.coalescer.flush();
        self.state.reset();
    }

    /// Sends the pending profile update and drains the queue now.
    pub fn flush(&self) {
        self.coalescer.flush();
        self.client.flush_now();
    }

    // ─── Observation ─────────────────────────────────────────────────────────────

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn on_request_observed(
        &self,
        listener: Listener<ApiRequest>,
        include_history: bool,
    ) -> ObserverHandle {
        self.client.on_request_observed(listener, include_history)
    }

    pub fn off_request_observed(&self, handle: ObserverHandle) {
        self.client.off_request_observed(handle);
    }

    pub fn state(&self) -> &Arc<ProfileState> {
        &self.state
    }

    pub fn client(&self) -> Arc<dyn ApiClient> {
        self.client.clone()
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    // ─── Shutdown ────────────────────────────────────────────────────────────────

    /// Enqueues the pending profile update, stops the scheduler and waits
    /// for it to persist the queue index.
    pub async fn shutdown(&self) {
        self.coalescer.flush();
        self.coalescer.detach();
        self.host.network.off_network_change(self.network_handle);
        self.host.lifecycle.off_activity_event(self.lifecycle_handle);

        self.scheduler.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        } else {
            debug!("Courier already shut down");
        }
        self.shutdown.cancel();
        info!(queued = self.queue.len(), "Courier stopped");
    }
}

impl Drop for Courier {
    fn drop(&mut self) {
        self.host.network.off_network_change(self.network_handle);
        self.host.lifecycle.off_activity_event(self.lifecycle_handle);
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Courier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Courier")
            .field("queue", &self.queue)
            .field("coalescer", &self.coalescer)
            .finish_non_exhaustive()
    }
}
