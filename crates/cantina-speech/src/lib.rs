//! SpeechCoordinator: ASR/TTS capability contracts and voice lifecycle
//! events (spec.md §4.7).
//!
//! The concrete streaming ASR and TTS engines are out-of-scope vendor
//! collaborators (spec.md §1); this crate defines only the trait boundary
//! ([`StreamingAsr`], [`TtsSynthesizer`]) plus the coordinator that enforces
//! "one active capture session per process" and turns collaborator calls
//! into the bus events spec.md §4.7 names. Grounded on the capability-trait
//! shape of `gibberish-stt::SttEngine` and `gibberish-turn::TurnDetector`
//! (a narrow trait the concrete ONNX/whisper backend implements, kept out
//! of this crate), generalized from a synchronous batch call to an
//! async streaming session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{
    topics, SpeechSynthesisEventPayload, SystemMode, SystemModeChangePayload, TranscriptionPayload,
    TtsGenerateRequestPayload, VoiceBeatPayload, VoiceListeningPayload,
};
use cantina_service::{Service, ServiceCore, ServiceError, ServiceHandle};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Minimum spacing between forwarded `VOICE_BEAT` events — caps the
/// collaborator's amplitude stream at the 50 Hz ceiling spec.md §4.7 names,
/// even if a misbehaving TTS backend emits faster.
const VOICE_BEAT_MIN_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("capture session already active")]
    SessionAlreadyActive,
    #[error("no capture session is active")]
    NoActiveSession,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),
}

/// One streaming ASR session handed to a collaborator's [`StreamingAsr::start`].
pub struct AsrSession {
    pub session_id: String,
    pub conversation_id: String,
    pub sink: TranscriptSink,
}

/// Lets a streaming ASR collaborator push transcripts back onto the bus
/// without depending on `cantina-bus` directly for topic names.
///
/// Enforces "exactly one `TRANSCRIPTION_FINAL` per session" (spec.md §4.7):
/// a second `finalize` call is logged and dropped rather than re-emitted.
#[derive(Clone)]
pub struct TranscriptSink {
    handle: ServiceHandle,
    session_id: String,
    conversation_id: String,
    finalized: Arc<std::sync::atomic::AtomicBool>,
}

impl TranscriptSink {
    fn new(handle: ServiceHandle, session_id: String, conversation_id: String) -> Self {
        Self {
            handle,
            session_id,
            conversation_id,
            finalized: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub async fn interim(&self, text: impl Into<String>) {
        let payload = TranscriptionPayload {
            conversation_id: self.conversation_id.clone(),
            session_id: self.session_id.clone(),
            text: text.into(),
        };
        let value = serde_json::to_value(payload).expect("transcription payload always serializes");
        self.handle.emit(topics::TRANSCRIPTION_INTERIM, value).await;
    }

    pub async fn finalize(&self, text: impl Into<String>) {
        if self
            .finalized
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            warn!(session_id = %self.session_id, "duplicate TRANSCRIPTION_FINAL suppressed");
            return;
        }
        let payload = TranscriptionPayload {
            conversation_id: self.conversation_id.clone(),
            session_id: self.session_id.clone(),
            text: text.into(),
        };
        let value = serde_json::to_value(payload).expect("transcription payload always serializes");
        self.handle.emit(topics::TRANSCRIPTION_FINAL, value).await;
    }
}

/// Streaming ASR capability the coordinator drives (spec.md §4.7).
#[async_trait]
pub trait StreamingAsr: Send + Sync {
    async fn start(&self, session: AsrSession) -> Result<(), SpeechError>;
    async fn stop(&self, session_id: &str) -> Result<(), SpeechError>;
}

/// Request handed to [`TtsSynthesizer::synthesize`].
pub struct TtsRequest {
    pub request_id: String,
    pub conversation_id: String,
    pub text: String,
    pub voice_id: Option<String>,
}

/// Lets a TTS collaborator stream amplitude samples back as `VOICE_BEAT`,
/// throttled to the spec's 50 Hz ceiling regardless of call rate.
#[derive(Clone)]
pub struct BeatSink {
    handle: ServiceHandle,
    request_id: String,
    last_emit_millis: Arc<Mutex<Option<Instant>>>,
}

impl BeatSink {
    fn new(handle: ServiceHandle, request_id: String) -> Self {
        Self {
            handle,
            request_id,
            last_emit_millis: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn emit(&self, amplitude: f32) {
        let now = Instant::now();
        {
            let mut last = self.last_emit_millis.lock().expect("beat sink lock poisoned");
            if let Some(prev) = *last {
                if now.duration_since(prev) < VOICE_BEAT_MIN_INTERVAL {
                    return;
                }
            }
            *last = Some(now);
        }
        let payload = VoiceBeatPayload {
            request_id: self.request_id.clone(),
            amplitude,
        };
        let value = serde_json::to_value(payload).expect("voice beat payload always serializes");
        self.handle.emit(topics::VOICE_BEAT, value).await;
    }
}

/// TTS capability the coordinator drives (spec.md §4.7).
#[async_trait]
pub trait TtsSynthesizer: Send + Sync {
    async fn synthesize(&self, request: TtsRequest, beats: BeatSink) -> Result<(), SpeechError>;
}

struct ActiveSession {
    session_id: String,
}

pub struct SpeechCoordinator {
    core: ServiceCore,
    asr: Arc<dyn StreamingAsr>,
    tts: Arc<dyn TtsSynthesizer>,
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl SpeechCoordinator {
    pub fn new(bus: Arc<EventBus>, asr: Arc<dyn StreamingAsr>, tts: Arc<dyn TtsSynthesizer>) -> Self {
        Self {
            core: ServiceCore::new("speech_coordinator", bus),
            asr,
            tts,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a new capture session, rejecting with [`SpeechError::SessionAlreadyActive`]
    /// if one is already running (spec.md §4.7: "one active capture session
    /// per process").
    pub async fn start_capture(&self, conversation_id: impl Into<String>) -> Result<String, SpeechError> {
        let session_id = Uuid::new_v4().to_string();
        {
            let mut guard = self.active.lock().expect("speech active session lock poisoned");
            if guard.is_some() {
                self.core
                    .emit_error("rejected overlapping ASR capture request")
                    .await;
                return Err(SpeechError::SessionAlreadyActive);
            }
            *guard = Some(ActiveSession {
                session_id: session_id.clone(),
            });
        }

        let conversation_id = conversation_id.into();
        let sink = TranscriptSink::new(self.core.handle(), session_id.clone(), conversation_id.clone());
        let payload = VoiceListeningPayload {
            session_id: session_id.clone(),
            conversation_id: conversation_id.clone(),
        };
        self.core
            .emit(
                topics::VOICE_LISTENING_STARTED,
                serde_json::to_value(payload).expect("voice listening payload always serializes"),
            )
            .await;

        if let Err(err) = self
            .asr
            .start(AsrSession {
                session_id: session_id.clone(),
                conversation_id,
                sink,
            })
            .await
        {
            *self.active.lock().expect("speech active session lock poisoned") = None;
            self.core.emit_error(err.to_string()).await;
            return Err(err);
        }

        Ok(session_id)
    }

    /// Stop the active capture session, if any.
    pub async fn stop_capture(&self) -> Result<(), SpeechError> {
        let session_id = {
            let mut guard = self.active.lock().expect("speech active session lock poisoned");
            match guard.take() {
                Some(session) => session.session_id,
                None => return Err(SpeechError::NoActiveSession),
            }
        };

        let result = self.asr.stop(&session_id).await;
        self.core
            .emit(
                topics::VOICE_LISTENING_STOPPED,
                serde_json::to_value(VoiceListeningPayload {
                    session_id,
                    conversation_id: String::new(),
                })
                .expect("voice listening payload always serializes"),
            )
            .await;
        result
    }

    async fn handle_mode_change(
        this_active: Arc<Mutex<Option<ActiveSession>>>,
        handle: ServiceHandle,
        asr: Arc<dyn StreamingAsr>,
        payload: serde_json::Value,
    ) -> Result<(), String> {
        let change: SystemModeChangePayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;

        if change.to == SystemMode::Interactive {
            let session_id = Uuid::new_v4().to_string();
            let conversation_id = Uuid::new_v4().to_string();
            {
                let mut guard = this_active.lock().expect("speech active session lock poisoned");
                if guard.is_some() {
                    warn!("mode change to INTERACTIVE but a capture session is already active");
                    return Ok(());
                }
                *guard = Some(ActiveSession {
                    session_id: session_id.clone(),
                });
            }
            let sink = TranscriptSink::new(handle.clone(), session_id.clone(), conversation_id.clone());
            handle
                .emit(
                    topics::VOICE_LISTENING_STARTED,
                    serde_json::to_value(VoiceListeningPayload {
                        session_id: session_id.clone(),
                        conversation_id: conversation_id.clone(),
                    })
                    .expect("voice listening payload always serializes"),
                )
                .await;
            if let Err(err) = asr
                .start(AsrSession {
                    session_id,
                    conversation_id,
                    sink,
                })
                .await
            {
                *this_active.lock().expect("speech active session lock poisoned") = None;
                handle.emit_error(err.to_string()).await;
            }
        } else if change.from == SystemMode::Interactive {
            let session_id = {
                let mut guard = this_active.lock().expect("speech active session lock poisoned");
                guard.take().map(|s| s.session_id)
            };
            if let Some(session_id) = session_id {
                if let Err(err) = asr.stop(&session_id).await {
                    handle.emit_error(err.to_string()).await;
                }
                handle
                    .emit(
                        topics::VOICE_LISTENING_STOPPED,
                        serde_json::to_value(VoiceListeningPayload {
                            session_id,
                            conversation_id: String::new(),
                        })
                        .expect("voice listening payload always serializes"),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn handle_tts_request(handle: ServiceHandle, tts: Arc<dyn TtsSynthesizer>, payload: serde_json::Value) -> Result<(), String> {
        let request: TtsGenerateRequestPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;

        handle
            .emit(
                topics::SPEECH_SYNTHESIS_STARTED,
                serde_json::to_value(SpeechSynthesisEventPayload {
                    request_id: request.request_id.clone(),
                    conversation_id: request.conversation_id.clone(),
                })
                .expect("speech synthesis payload always serializes"),
            )
            .await;

        // Synthesis runs for as long as the TTS backend takes, which may
        // exceed the bus's per-handler emit timeout (spec.md §5 default
        // 2s) — run it on its own task so the TTS_GENERATE_REQUEST handler
        // returns immediately, same as TimelineExecutor spawning run_plan
        // instead of awaiting a whole plan inline.
        let request_id = request.request_id.clone();
        tokio::spawn(async move {
            let beats = BeatSink::new(handle.clone(), request_id.clone());
            let tts_request = TtsRequest {
                request_id: request_id.clone(),
                conversation_id: request.conversation_id.clone(),
                text: request.text,
                voice_id: request.voice_id,
            };
            if let Err(err) = tts.synthesize(tts_request, beats).await {
                warn!(request_id = %request_id, error = %err, "tts synthesis failed");
                handle.emit_error(err.to_string()).await;
            }
            handle
                .emit(
                    topics::SPEECH_SYNTHESIS_ENDED,
                    serde_json::to_value(SpeechSynthesisEventPayload {
                        request_id,
                        conversation_id: request.conversation_id.clone(),
                    })
                    .expect("speech synthesis payload always serializes"),
                )
                .await;
        });
        Ok(())
    }
}

#[async_trait]
impl Service for SpeechCoordinator {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        let handle = self.core.handle();
        let active = Arc::clone(&self.active);
        let asr = Arc::clone(&self.asr);
        self.core.subscribe(topics::SYSTEM_MODE_CHANGE, move |payload| {
            let handle = handle.clone();
            let active = Arc::clone(&active);
            let asr = Arc::clone(&asr);
            async move { Self::handle_mode_change(active, handle, asr, payload).await }
        })?;

        let handle = self.core.handle();
        let tts = Arc::clone(&self.tts);
        self.core.subscribe(topics::TTS_GENERATE_REQUEST, move |payload| {
            let handle = handle.clone();
            let tts = Arc::clone(&tts);
            async move { Self::handle_tts_request(handle, tts, payload).await }
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_service::start_service;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    struct StubAsr {
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StreamingAsr for StubAsr {
        async fn start(&self, session: AsrSession) -> Result<(), SpeechError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            session.sink.interim("play some").await;
            session.sink.finalize("play some funky music").await;
            Ok(())
        }

        async fn stop(&self, _session_id: &str) -> Result<(), SpeechError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubTts {
        notify: Arc<Notify>,
    }

    #[async_trait]
    impl TtsSynthesizer for StubTts {
        async fn synthesize(&self, request: TtsRequest, beats: BeatSink) -> Result<(), SpeechError> {
            beats.emit(0.5).await;
            let _ = request;
            self.notify.notify_one();
            Ok(())
        }
    }

    struct FailingTts;

    #[async_trait]
    impl TtsSynthesizer for FailingTts {
        async fn synthesize(&self, _request: TtsRequest, _beats: BeatSink) -> Result<(), SpeechError> {
            Err(SpeechError::SynthesisFailed("backend offline".into()))
        }
    }

    #[tokio::test]
    async fn start_capture_emits_listening_started_and_drives_asr() {
        let bus = Arc::new(EventBus::new());
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let asr = Arc::new(StubAsr {
            started: Arc::clone(&started),
            stopped: Arc::clone(&stopped),
        });
        let tts = Arc::new(StubTts { notify: Arc::new(Notify::new()) });
        let coordinator = SpeechCoordinator::new(Arc::clone(&bus), asr, tts);
        start_service(&coordinator).await.unwrap();

        let finals: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let f = Arc::clone(&finals);
        bus.subscribe_sync(topics::TRANSCRIPTION_FINAL, move |v| {
            let f = Arc::clone(&f);
            async move {
                let p: TranscriptionPayload = serde_json::from_value(v).unwrap();
                f.lock().unwrap().push(p.text);
                Ok(())
            }
        })
        .unwrap();

        coordinator.start_capture("c1").await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finals.lock().unwrap().as_slice(), ["play some funky music"]);
    }

    #[tokio::test]
    async fn overlapping_capture_is_rejected() {
        let bus = Arc::new(EventBus::new());
        let asr = Arc::new(StubAsr {
            started: Arc::new(AtomicUsize::new(0)),
            stopped: Arc::new(AtomicUsize::new(0)),
        });
        let tts = Arc::new(StubTts { notify: Arc::new(Notify::new()) });
        let coordinator = SpeechCoordinator::new(Arc::clone(&bus), asr, tts);
        start_service(&coordinator).await.unwrap();

        coordinator.start_capture("c1").await.unwrap();
        let err = coordinator.start_capture("c2").await.unwrap_err();
        assert!(matches!(err, SpeechError::SessionAlreadyActive));
    }

    #[tokio::test]
    async fn duplicate_finalize_is_suppressed() {
        let bus = Arc::new(EventBus::new());
        let handle = ServiceCore::new("test", Arc::clone(&bus)).handle();
        let sink = TranscriptSink::new(handle, "s1".into(), "c1".into());

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe_sync(topics::TRANSCRIPTION_FINAL, move |_| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        sink.finalize("first").await;
        sink.finalize("second").await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tts_generate_request_emits_started_then_ended() {
        let bus = Arc::new(EventBus::new());
        let asr = Arc::new(StubAsr {
            started: Arc::new(AtomicUsize::new(0)),
            stopped: Arc::new(AtomicUsize::new(0)),
        });
        let notify = Arc::new(Notify::new());
        let tts = Arc::new(StubTts { notify: Arc::clone(&notify) });
        let coordinator = SpeechCoordinator::new(Arc::clone(&bus), asr, tts);
        start_service(&coordinator).await.unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&started);
        bus.subscribe_sync(topics::SPEECH_SYNTHESIS_STARTED, move |_| {
            let s = Arc::clone(&s);
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        let ended = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&ended);
        bus.subscribe_sync(topics::SPEECH_SYNTHESIS_ENDED, move |_| {
            let e = Arc::clone(&e);
            async move {
                e.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        let request = TtsGenerateRequestPayload {
            request_id: "r1".into(),
            conversation_id: "c1".into(),
            text: "hello".into(),
            voice_id: None,
        };
        bus.emit(topics::TTS_GENERATE_REQUEST, serde_json::to_value(request).unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_synthesis_still_emits_ended_and_service_error() {
        let bus = Arc::new(EventBus::new());
        let asr = Arc::new(StubAsr {
            started: Arc::new(AtomicUsize::new(0)),
            stopped: Arc::new(AtomicUsize::new(0)),
        });
        let coordinator = SpeechCoordinator::new(Arc::clone(&bus), asr, Arc::new(FailingTts));
        start_service(&coordinator).await.unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        bus.subscribe_sync(topics::SERVICE_ERROR, move |_| {
            let e = Arc::clone(&e);
            async move {
                e.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        let ended = Arc::new(AtomicUsize::new(0));
        let e2 = Arc::clone(&ended);
        bus.subscribe_sync(topics::SPEECH_SYNTHESIS_ENDED, move |_| {
            let e2 = Arc::clone(&e2);
            async move {
                e2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        let request = TtsGenerateRequestPayload {
            request_id: "r2".into(),
            conversation_id: "c1".into(),
            text: "hello".into(),
            voice_id: None,
        };
        bus.emit(topics::TTS_GENERATE_REQUEST, serde_json::to_value(request).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mode_change_to_interactive_starts_capture_and_back_stops_it() {
        let bus = Arc::new(EventBus::new());
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let asr = Arc::new(StubAsr {
            started: Arc::clone(&started),
            stopped: Arc::clone(&stopped),
        });
        let tts = Arc::new(StubTts { notify: Arc::new(Notify::new()) });
        let coordinator = SpeechCoordinator::new(Arc::clone(&bus), asr, tts);
        start_service(&coordinator).await.unwrap();

        let change = SystemModeChangePayload {
            from: SystemMode::Idle,
            to: SystemMode::Interactive,
        };
        bus.emit(topics::SYSTEM_MODE_CHANGE, serde_json::to_value(change).unwrap())
            .await
            .unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);

        let change = SystemModeChangePayload {
            from: SystemMode::Interactive,
            to: SystemMode::Idle,
        };
        bus.emit(topics::SYSTEM_MODE_CHANGE, serde_json::to_value(change).unwrap())
            .await
            .unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
