//! TimelineExecutor: layered Plan/Step runner (spec.md §4.5, §5, §9).
//!
//! Three independent layers (`ambient` < `foreground` < `override`) each run
//! at most one Plan at a time. Submitting to `override` cancels whatever is
//! running on `foreground`/`ambient` (they each emit `STEP_CANCELLED` for
//! their in-flight step); submitting to `foreground` only pauses `ambient`,
//! which keeps its cursor and resumes once `foreground` ends. Per-layer
//! concurrency is one spawned task per layer with a small supervisor
//! enforcing precedence and cancellation (spec.md §9), grounded on this
//! workspace's `CancellationToken`-per-key tracker
//! (`plugins/stt-worker/src/download_tracker.rs`) generalized from a single
//! download key to a fixed set of three layer keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{
    topics, AudioDuckingPayload, Layer, MusicCommandPayload, Plan, PlanLifecyclePayload,
    PlanReadyPayload, PlanStep, StepLifecyclePayload, StepType, TtsGenerateRequestPayload,
};
use cantina_service::{Service, ServiceCore, ServiceError, ServiceHandle};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default timeout for a `wait_for_event` step (spec.md §9 leaves this as an
/// open question; resolved here as a configurable default, see DESIGN.md).
pub const DEFAULT_WAIT_FOR_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a `speak` step's `SPEECH_SYNTHESIS_ENDED` wait.
pub const DEFAULT_SPEAK_TIMEOUT: Duration = Duration::from_secs(20);

struct RunSlot {
    plan_id: String,
    cancel: CancellationToken,
}

/// Tracks which plan, if any, currently occupies each layer. All methods
/// are synchronous and fast: never held across an `.await`.
struct Supervisor {
    override_slot: Option<RunSlot>,
    foreground_slot: Option<RunSlot>,
    ambient_slot: Option<RunSlot>,
    foreground_active_tx: watch::Sender<bool>,
}

impl Supervisor {
    fn new(foreground_active_tx: watch::Sender<bool>) -> Self {
        Self {
            override_slot: None,
            foreground_slot: None,
            ambient_slot: None,
            foreground_active_tx,
        }
    }

    /// Admit a new plan onto `layer`, cancelling whatever precedence rules
    /// say must yield. Returns the [`CancellationToken`] the caller's run
    /// loop should observe.
    fn admit(&mut self, layer: Layer, plan_id: String) -> CancellationToken {
        let cancel = CancellationToken::new();
        match layer {
            Layer::Override => {
                if let Some(slot) = self.foreground_slot.take() {
                    slot.cancel.cancel();
                }
                if let Some(slot) = self.ambient_slot.take() {
                    slot.cancel.cancel();
                }
                if let Some(slot) = self.override_slot.take() {
                    slot.cancel.cancel();
                }
                self.override_slot = Some(RunSlot {
                    plan_id,
                    cancel: cancel.clone(),
                });
            }
            Layer::Foreground => {
                if let Some(slot) = self.foreground_slot.take() {
                    slot.cancel.cancel();
                }
                self.foreground_slot = Some(RunSlot {
                    plan_id,
                    cancel: cancel.clone(),
                });
                let _ = self.foreground_active_tx.send(true);
            }
            Layer::Ambient => {
                if let Some(slot) = self.ambient_slot.take() {
                    slot.cancel.cancel();
                }
                self.ambient_slot = Some(RunSlot {
                    plan_id,
                    cancel: cancel.clone(),
                });
            }
        }
        cancel
    }

    /// Release `layer`'s slot once its run loop finishes, provided it's
    /// still the same plan (a replaced slot already cleaned itself up).
    fn clear_slot(&mut self, layer: Layer, plan_id: &str) {
        let slot = match layer {
            Layer::Override => &mut self.override_slot,
            Layer::Foreground => &mut self.foreground_slot,
            Layer::Ambient => &mut self.ambient_slot,
        };
        if slot.as_ref().map(|s| s.plan_id.as_str()) == Some(plan_id) {
            *slot = None;
        }
        if layer == Layer::Foreground {
            let _ = self.foreground_active_tx.send(self.foreground_slot.is_some());
        }
    }
}

pub struct TimelineExecutor {
    core: ServiceCore,
    supervisor: Arc<Mutex<Supervisor>>,
    foreground_active_rx: watch::Receiver<bool>,
    wait_for_event_timeout: Duration,
    speak_timeout: Duration,
}

impl TimelineExecutor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_timeouts(bus, DEFAULT_WAIT_FOR_EVENT_TIMEOUT, DEFAULT_SPEAK_TIMEOUT)
    }

    pub fn with_timeouts(
        bus: Arc<EventBus>,
        wait_for_event_timeout: Duration,
        speak_timeout: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            core: ServiceCore::new("timeline_executor", bus),
            supervisor: Arc::new(Mutex::new(Supervisor::new(tx))),
            foreground_active_rx: rx,
            wait_for_event_timeout,
            speak_timeout,
        }
    }

    async fn handle_plan_ready(
        handle: ServiceHandle,
        supervisor: Arc<Mutex<Supervisor>>,
        foreground_active_rx: watch::Receiver<bool>,
        wait_for_event_timeout: Duration,
        speak_timeout: Duration,
        payload: Value,
    ) -> Result<(), String> {
        let ready: PlanReadyPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        let plan = ready.plan;
        let layer = plan.layer;
        let plan_id = plan.plan_id.clone();

        let cancel = {
            let mut guard = supervisor.lock().expect("timeline supervisor lock poisoned");
            guard.admit(layer, plan_id.clone())
        };

        info!(plan_id = %plan_id, %layer, steps = plan.steps.len(), "plan admitted");
        tokio::spawn(run_plan(
            handle,
            supervisor,
            foreground_active_rx,
            layer,
            plan,
            cancel,
            wait_for_event_timeout,
            speak_timeout,
        ));
        Ok(())
    }
}

#[async_trait]
impl Service for TimelineExecutor {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        let handle = self.core.handle();
        let supervisor = Arc::clone(&self.supervisor);
        let foreground_active_rx = self.foreground_active_rx.clone();
        let wait_for_event_timeout = self.wait_for_event_timeout;
        let speak_timeout = self.speak_timeout;
        self.core.subscribe(topics::PLAN_READY, move |payload| {
            let handle = handle.clone();
            let supervisor = Arc::clone(&supervisor);
            let foreground_active_rx = foreground_active_rx.clone();
            async move {
                Self::handle_plan_ready(
                    handle,
                    supervisor,
                    foreground_active_rx,
                    wait_for_event_timeout,
                    speak_timeout,
                    payload,
                )
                .await
            }
        })?;
        Ok(())
    }
}

enum StepOutcome {
    Done,
    Cancelled,
    Failed(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_plan(
    handle: ServiceHandle,
    supervisor: Arc<Mutex<Supervisor>>,
    foreground_active_rx: watch::Receiver<bool>,
    layer: Layer,
    plan: Plan,
    cancel: CancellationToken,
    wait_for_event_timeout: Duration,
    speak_timeout: Duration,
) {
    let plan_id = plan.plan_id.clone();
    handle
        .emit(
            topics::PLAN_STARTED,
            serde_json::to_value(PlanLifecyclePayload {
                plan_id: plan_id.clone(),
                layer,
            })
            .expect("plan lifecycle payload always serializes"),
        )
        .await;

    let mut ended_reason = "completed";

    'steps: for step in &plan.steps {
        if cancel.is_cancelled() {
            emit_step_cancelled(&handle, &plan_id, &step.id).await;
            ended_reason = "cancelled";
            break;
        }

        if layer == Layer::Ambient {
            let mut rx = foreground_active_rx.clone();
            while *rx.borrow() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            if cancel.is_cancelled() {
                emit_step_cancelled(&handle, &plan_id, &step.id).await;
                ended_reason = "cancelled";
                break 'steps;
            }
        }

        handle
            .emit(
                topics::STEP_READY,
                serde_json::to_value(StepLifecyclePayload {
                    plan_id: plan_id.clone(),
                    step_id: step.id.clone(),
                    reason: None,
                })
                .expect("step lifecycle payload always serializes"),
            )
            .await;

        let outcome = execute_step(
            &handle,
            step,
            plan.conversation_id.as_deref(),
            &cancel,
            wait_for_event_timeout,
            speak_timeout,
        )
        .await;

        match outcome {
            StepOutcome::Done => {
                handle
                    .emit(
                        topics::STEP_EXECUTED,
                        serde_json::to_value(StepLifecyclePayload {
                            plan_id: plan_id.clone(),
                            step_id: step.id.clone(),
                            reason: None,
                        })
                        .expect("step lifecycle payload always serializes"),
                    )
                    .await;
            }
            StepOutcome::Cancelled => {
                emit_step_cancelled(&handle, &plan_id, &step.id).await;
                ended_reason = "cancelled";
                break;
            }
            StepOutcome::Failed(reason) => {
                handle
                    .emit(
                        topics::STEP_FAILED,
                        serde_json::to_value(StepLifecyclePayload {
                            plan_id: plan_id.clone(),
                            step_id: step.id.clone(),
                            reason: Some(reason),
                        })
                        .expect("step lifecycle payload always serializes"),
                    )
                    .await;
                ended_reason = "failed";
                break;
            }
        }
    }

    debug!(plan_id = %plan_id, %layer, reason = ended_reason, "plan ended");
    handle
        .emit(
            topics::PLAN_ENDED,
            serde_json::to_value(PlanLifecyclePayload {
                plan_id: plan_id.clone(),
                layer,
            })
            .expect("plan lifecycle payload always serializes"),
        )
        .await;

    supervisor
        .lock()
        .expect("timeline supervisor lock poisoned")
        .clear_slot(layer, &plan_id);
}

async fn emit_step_cancelled(handle: &ServiceHandle, plan_id: &str, step_id: &str) {
    let payload = StepLifecyclePayload {
        plan_id: plan_id.to_string(),
        step_id: step_id.to_string(),
        reason: Some("preempted".to_string()),
    };
    handle
        .emit(
            topics::STEP_CANCELLED,
            serde_json::to_value(payload).expect("step lifecycle payload always serializes"),
        )
        .await;
}

async fn execute_step(
    handle: &ServiceHandle,
    step: &PlanStep,
    conversation_id: Option<&str>,
    cancel: &CancellationToken,
    wait_for_event_timeout: Duration,
    speak_timeout: Duration,
) -> StepOutcome {
    match step.step_type {
        StepType::Delay => {
            let seconds = step.delay_seconds.unwrap_or(0.0).max(0.0);
            tokio::select! {
                _ = cancel.cancelled() => StepOutcome::Cancelled,
                _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => StepOutcome::Done,
            }
        }
        StepType::WaitForEvent => {
            let Some(event) = step.event.clone() else {
                return StepOutcome::Failed("wait_for_event step missing event".to_string());
            };
            let predicate_value = step.event_predicate.clone();
            let predicate = move |payload: &Value| matches_predicate(payload, predicate_value.as_ref());
            match await_topic_once(handle.bus(), &event, predicate, wait_for_event_timeout, cancel).await {
                AwaitOutcome::Matched(_) => StepOutcome::Done,
                AwaitOutcome::TimedOut => StepOutcome::Failed(format!("timed out waiting for {event}")),
                AwaitOutcome::Cancelled => StepOutcome::Cancelled,
            }
        }
        StepType::PlayMusic => {
            let Some(track_query) = step.track_query.clone() else {
                return StepOutcome::Failed("play_music step missing track_query".to_string());
            };
            let command = MusicCommandPayload {
                action: "play".to_string(),
                track_query: Some(track_query),
                conversation_id: conversation_id.map(str::to_string),
            };
            let value = serde_json::to_value(command).expect("music command payload always serializes");
            handle.emit(topics::MUSIC_COMMAND, value).await;
            StepOutcome::Done
        }
        StepType::Speak => {
            let Some(text) = step.text.clone() else {
                return StepOutcome::Failed("speak step missing text".to_string());
            };
            let request_id = Uuid::new_v4().to_string();
            let conversation_id = conversation_id.unwrap_or_default().to_string();

            handle
                .emit(
                    topics::AUDIO_DUCKING_START,
                    serde_json::to_value(AudioDuckingPayload {
                        reason: "speak".to_string(),
                    })
                    .expect("ducking payload always serializes"),
                )
                .await;

            let request = TtsGenerateRequestPayload {
                request_id: request_id.clone(),
                conversation_id,
                text,
                voice_id: None,
            };
            handle
                .emit(
                    topics::TTS_GENERATE_REQUEST,
                    serde_json::to_value(request).expect("tts request payload always serializes"),
                )
                .await;

            let matched_request_id = request_id.clone();
            let predicate = move |payload: &Value| {
                payload.get("request_id").and_then(Value::as_str) == Some(matched_request_id.as_str())
            };
            let outcome = await_topic_once(
                handle.bus(),
                topics::SPEECH_SYNTHESIS_ENDED,
                predicate,
                speak_timeout,
                cancel,
            )
            .await;

            handle
                .emit(
                    topics::AUDIO_DUCKING_STOP,
                    serde_json::to_value(AudioDuckingPayload {
                        reason: "speak".to_string(),
                    })
                    .expect("ducking payload always serializes"),
                )
                .await;

            match outcome {
                AwaitOutcome::Matched(_) => StepOutcome::Done,
                AwaitOutcome::TimedOut => {
                    StepOutcome::Failed(format!("speech synthesis timed out for request {request_id}"))
                }
                AwaitOutcome::Cancelled => StepOutcome::Cancelled,
            }
        }
        // LED hardware is out of scope (spec.md Non-goals); these steps are
        // contract-only placeholders that complete immediately.
        StepType::EyePattern | StepType::Move => StepOutcome::Done,
    }
}

fn matches_predicate(payload: &Value, predicate: Option<&Value>) -> bool {
    match predicate {
        None => true,
        Some(Value::Object(expected)) => match payload {
            Value::Object(actual) => expected.iter().all(|(k, v)| actual.get(k) == Some(v)),
            _ => false,
        },
        Some(_) => false,
    }
}

enum AwaitOutcome {
    Matched(Value),
    TimedOut,
    Cancelled,
}

/// Subscribe to `topic`, resolve on the first payload matching `predicate`,
/// and unsubscribe either way. Races the match against `timeout` and
/// `cancel`.
async fn await_topic_once<F>(
    bus: &Arc<EventBus>,
    topic: &str,
    predicate: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> AwaitOutcome
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel::<Value>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let tx_for_handler = Arc::clone(&tx);

    let sub = match bus.subscribe_sync(topic, move |payload| {
        let tx = Arc::clone(&tx_for_handler);
        let matched = predicate(&payload);
        async move {
            if matched {
                if let Some(sender) = tx.lock().expect("await_topic_once sender lock poisoned").take() {
                    let _ = sender.send(payload);
                }
            }
            Ok(())
        }
    }) {
        Ok(sub) => sub,
        Err(err) => {
            warn!(topic, error = %err, "await_topic_once failed to subscribe");
            return AwaitOutcome::TimedOut;
        }
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => AwaitOutcome::Cancelled,
        result = rx => match result {
            Ok(value) => AwaitOutcome::Matched(value),
            Err(_) => AwaitOutcome::TimedOut,
        },
        _ = tokio::time::sleep(timeout) => AwaitOutcome::TimedOut,
    };

    bus.unsubscribe(&sub);
    outcome
}
