//! ModeManager: the IDLE/AMBIENT/INTERACTIVE finite-state mode controller
//! (spec.md §4.4).
//!
//! Transitions happen only in response to `SYSTEM_SET_MODE_REQUEST` and are
//! serialized under a single mutex so that "a transition is atomic w.r.t.
//! other mode requests" holds even though request handling spans an await
//! (the `SYSTEM_MODE_CHANGE` emission). This is a deliberate, narrow
//! exception to the bus's general "never hold a lock across an await"
//! discipline: the mode table's atomicity requirement is explicit in
//! spec.md §4.4, and the lock guards only this manager's own state, never
//! another service's.
//!
//! Side effects of a transition ("start ambient plan", "enable mic
//! capture", ...) are not performed here: they are reactions other
//! services (TimelineExecutor, SpeechCoordinator) take upon observing
//! `SYSTEM_MODE_CHANGE`, per the "services never call each other directly"
//! rule (spec.md §2).

use std::sync::Arc;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{
    topics, SystemMode, SystemModeChangePayload, SystemSetModeRequestPayload,
};
use cantina_service::{start_service, Service, ServiceCore, ServiceError, ServiceHandle};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Allowed transition table (spec.md §4.4).
fn is_allowed(from: SystemMode, to: SystemMode) -> bool {
    use SystemMode::*;
    match to {
        Idle => true,
        Ambient => matches!(from, Idle | Interactive),
        Interactive => matches!(from, Idle | Ambient),
    }
}

pub struct ModeManager {
    core: ServiceCore,
    mode: Arc<Mutex<SystemMode>>,
}

impl ModeManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            core: ServiceCore::new("mode_manager", bus),
            mode: Arc::new(Mutex::new(SystemMode::Idle)),
        }
    }

    pub async fn current_mode(&self) -> SystemMode {
        *self.mode.lock().await
    }

    async fn handle_set_mode_request(
        handle: ServiceHandle,
        mode: Arc<Mutex<SystemMode>>,
        payload: serde_json::Value,
    ) -> Result<(), String> {
        let request: SystemSetModeRequestPayload =
            serde_json::from_value(payload).map_err(|e| e.to_string())?;

        // Held across the SYSTEM_MODE_CHANGE emit: see module docs.
        let mut guard = mode.lock().await;
        let from = *guard;
        let to = request.mode;

        if !is_allowed(from, to) {
            drop(guard);
            warn!(%from, %to, "rejected invalid mode transition");
            handle
                .emit_error(format!("invalid mode transition {from} -> {to}"))
                .await;
            return Ok(());
        }

        *guard = to;
        drop(guard);

        info!(%from, %to, "mode transition");
        let value = serde_json::to_value(SystemModeChangePayload { from, to })
            .expect("mode change payload always serializes");
        handle.emit(topics::SYSTEM_MODE_CHANGE, value).await;
        Ok(())
    }
}

#[async_trait]
impl Service for ModeManager {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        let handle = self.core.handle();
        let mode = Arc::clone(&self.mode);
        self.core
            .subscribe(topics::SYSTEM_SET_MODE_REQUEST, move |payload| {
                let handle = handle.clone();
                let mode = Arc::clone(&mode);
                async move { Self::handle_set_mode_request(handle, mode, payload).await }
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_events::topics;

    async fn request_mode(bus: &EventBus, mode: SystemMode) {
        let value = serde_json::to_value(SystemSetModeRequestPayload { mode }).unwrap();
        bus.emit(topics::SYSTEM_SET_MODE_REQUEST, value).await.unwrap();
    }

    async fn running_manager(bus: Arc<EventBus>) -> ModeManager {
        let manager = ModeManager::new(Arc::clone(&bus));
        start_service(&manager).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn idle_to_interactive_then_ambient_round_trip() {
        let bus = Arc::new(EventBus::new());
        let manager = running_manager(Arc::clone(&bus)).await;

        request_mode(&bus, SystemMode::Interactive).await;
        assert_eq!(manager.current_mode().await, SystemMode::Interactive);

        request_mode(&bus, SystemMode::Ambient).await;
        assert_eq!(manager.current_mode().await, SystemMode::Ambient);
    }

    #[tokio::test]
    async fn ambient_to_ambient_is_rejected_and_state_preserved() {
        let bus = Arc::new(EventBus::new());
        let manager = running_manager(Arc::clone(&bus)).await;

        request_mode(&bus, SystemMode::Ambient).await;
        assert_eq!(manager.current_mode().await, SystemMode::Ambient);

        request_mode(&bus, SystemMode::Ambient).await;
        assert_eq!(manager.current_mode().await, SystemMode::Ambient);
    }

    #[tokio::test]
    async fn any_mode_can_return_to_idle() {
        let bus = Arc::new(EventBus::new());
        let manager = running_manager(Arc::clone(&bus)).await;

        request_mode(&bus, SystemMode::Interactive).await;
        request_mode(&bus, SystemMode::Idle).await;
        assert_eq!(manager.current_mode().await, SystemMode::Idle);
    }

    #[tokio::test]
    async fn exactly_one_mode_change_event_per_accepted_request() {
        let bus = Arc::new(EventBus::new());
        let manager = running_manager(Arc::clone(&bus)).await;

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe_sync(topics::SYSTEM_MODE_CHANGE, move |_v| {
            let count = Arc::clone(&count2);
            async move {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        request_mode(&bus, SystemMode::Interactive).await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Rejected transition: no additional SYSTEM_MODE_CHANGE.
        request_mode(&bus, SystemMode::Interactive).await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
        let _ = manager;
    }
}
