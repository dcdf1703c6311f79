//! BaseService / service framework (spec.md §4.2).
//!
//! Concrete services embed a [`ServiceCore`] and implement the [`Service`]
//! trait's three hooks (`setup_subscriptions`, `on_start`, `on_stop` — the
//! spec's `_setup_subscriptions`/`_start`/`_stop`). [`start_service`] and
//! [`stop_service`] drive the shared lifecycle: grace period, reentrancy
//! guard, tracked-subscription teardown, and `SERVICE_STATUS_UPDATE`
//! emission, grounded on the mutex-guarded shared-state pattern used
//! throughout this workspace's plugin state modules.

use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cantina_bus::{EventBus, Subscription};
use cantina_events::{topics, BadTopic, ServiceErrorPayload, ServiceStatus, ServiceStatusPayload};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Default grace period after `_start` before a service is marked RUNNING.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to start: {0}")]
    StartFailed(String),
    #[error("bad topic: {0}")]
    BadTopic(#[from] BadTopic),
}

/// Cheap-to-clone emit/status handle, independent of a service's tracked
/// subscriptions. Handlers registered with [`ServiceCore::subscribe`] close
/// over a `ServiceHandle` (plus whatever `Arc<Mutex<_>>` state they need)
/// rather than over the owning service itself, since `Service::setup_subscriptions`
/// only ever sees `&self` and building a `'static` closure from a borrow
/// does not work. This mirrors how this workspace's plugin state modules
/// pass around `Arc<Mutex<SharedState>>` rather than `&self`.
#[derive(Clone)]
pub struct ServiceHandle {
    name: Arc<str>,
    bus: Arc<EventBus>,
    status: Arc<RwLock<ServiceStatus>>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read().expect("service status lock poisoned")
    }

    fn set_status(&self, status: ServiceStatus) {
        *self.status.write().expect("service status lock poisoned") = status;
    }

    /// Emit `payload` on `topic`, logging (not raising) any bus-level error.
    pub async fn emit(&self, topic: &str, payload: Value) {
        if let Err(err) = self.bus.emit(topic, payload).await {
            warn!(service = %self.name, topic, error = %err, "emit failed");
        }
    }

    pub async fn emit_status(&self, status: ServiceStatus, message: Option<String>) {
        self.set_status(status);
        let payload = ServiceStatusPayload {
            service: self.name.to_string(),
            status,
            message,
        };
        let value = serde_json::to_value(payload).expect("status payload always serializes");
        self.emit(topics::SERVICE_STATUS_UPDATE, value).await;
    }

    pub async fn emit_error(&self, message: impl Into<String>) {
        let payload = ServiceErrorPayload {
            source: self.name.to_string(),
            message: message.into(),
            topic: None,
        };
        let value = serde_json::to_value(payload).expect("error payload always serializes");
        self.emit(topics::SERVICE_ERROR, value).await;
    }
}

/// Shared machinery every service embeds: name, bus handle, tracked
/// subscriptions, and status.
pub struct ServiceCore {
    handle: ServiceHandle,
    subscriptions: Mutex<Vec<Subscription>>,
    grace_period: Duration,
}

impl ServiceCore {
    pub fn new(name: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            handle: ServiceHandle {
                name: Arc::from(name.into()),
                bus,
                status: Arc::new(RwLock::new(ServiceStatus::Initializing)),
            },
            subscriptions: Mutex::new(Vec::new()),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.handle.bus
    }

    pub fn status(&self) -> ServiceStatus {
        self.handle.status()
    }

    /// A cheap, `'static`-friendly clone of this service's emit/status
    /// surface, for closing over in bus handlers.
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    fn set_status(&self, status: ServiceStatus) {
        self.handle.set_status(status);
    }

    /// Subscribe and remember the [`Subscription`] so `stop_service` can
    /// release it automatically.
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<(), ServiceError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let sub = self.handle.bus.subscribe_sync(topic, handler)?;
        self.subscriptions
            .lock()
            .expect("service subscriptions lock poisoned")
            .push(sub);
        Ok(())
    }

    /// Emit `payload` on `topic`, logging (not raising) any bus-level error.
    pub async fn emit(&self, topic: &str, payload: Value) {
        self.handle.emit(topic, payload).await;
    }

    pub async fn emit_status(&self, status: ServiceStatus, message: Option<String>) {
        self.handle.emit_status(status, message).await;
    }

    pub async fn emit_error(&self, message: impl Into<String>) {
        self.handle.emit_error(message).await;
    }

    fn unsubscribe_all(&self) {
        let mut subs = self
            .subscriptions
            .lock()
            .expect("service subscriptions lock poisoned");
        for sub in subs.drain(..) {
            self.handle.bus.unsubscribe(&sub);
        }
    }
}

/// The three hooks every CantinaOS service implements.
#[async_trait]
pub trait Service: Send + Sync {
    fn core(&self) -> &ServiceCore;

    /// Register bus subscriptions. Runs before `on_start`.
    async fn setup_subscriptions(&self) -> Result<(), ServiceError>;

    /// Service-specific startup (spin up resources, background tasks).
    async fn on_start(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Service-specific teardown. Must not raise: errors are logged and the
    /// service is forced to STOPPED regardless (spec.md §4.2).
    async fn on_stop(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Start `service`, following the grace-period/reentrancy contract of
/// spec.md §4.2. A no-op if already running or starting.
pub async fn start_service(service: &dyn Service) -> Result<(), ServiceError> {
    let core = service.core();
    match core.status() {
        ServiceStatus::Running | ServiceStatus::Initializing => return Ok(()),
        _ => {}
    }

    core.set_status(ServiceStatus::Initializing);

    if let Err(err) = service.setup_subscriptions().await {
        core.emit_error(err.to_string()).await;
        core.set_status(ServiceStatus::Error);
        return Err(err);
    }

    if let Err(err) = service.on_start().await {
        core.emit_error(err.to_string()).await;
        core.set_status(ServiceStatus::Error);
        return Err(err);
    }

    tokio::time::sleep(core.grace_period).await;
    info!(service = %core.name, "service running");
    core.emit_status(ServiceStatus::Running, None).await;
    Ok(())
}

/// Stop `service`. A no-op if already stopped or stopping. Never panics or
/// returns an error: a failing `on_stop` is logged and the service is
/// forced to STOPPED anyway.
pub async fn stop_service(service: &dyn Service) {
    let core = service.core();
    match core.status() {
        ServiceStatus::Stopped | ServiceStatus::Stopping => return,
        _ => {}
    }

    core.set_status(ServiceStatus::Stopping);

    if let Err(err) = service.on_stop().await {
        error!(service = %core.name, error = %err, "on_stop failed, forcing STOPPED");
    }

    core.unsubscribe_all();
    core.set_status(ServiceStatus::Stopped);
    core.emit_status(ServiceStatus::Stopped, None).await;
}
