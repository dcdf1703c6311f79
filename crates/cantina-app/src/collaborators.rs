//! Placeholder collaborators for the three vendor boundaries this runtime
//! keeps out of scope (ASR, TTS, LLM dialog). CantinaOS defines the trait
//! contract; a real deployment swaps these for vendor-backed
//! implementations without touching any other service. These exist so the
//! composition root can actually construct and run `BrainService` and
//! `SpeechCoordinator` without a vendor dependency.

use async_trait::async_trait;
use cantina_brain::{CollaboratorError, DialogCollaborator};
use cantina_events::Track;
use cantina_speech::{AsrSession, BeatSink, SpeechError, StreamingAsr, TtsRequest, TtsSynthesizer};

/// Echoes the triggering utterance back as the "introduction" line.
pub struct EchoCollaborator;

#[async_trait]
impl DialogCollaborator for EchoCollaborator {
    async fn introduce_track(&self, track: &Track, utterance: &str) -> Result<String, CollaboratorError> {
        Ok(format!("Now playing {} (you said: {utterance})", track.title))
    }
}

/// Accepts a capture session and immediately drops it: no audio pipeline
/// is attached, so no transcript ever arrives.
pub struct NullAsr;

#[async_trait]
impl StreamingAsr for NullAsr {
    async fn start(&self, _session: AsrSession) -> Result<(), SpeechError> {
        Ok(())
    }

    async fn stop(&self, _session_id: &str) -> Result<(), SpeechError> {
        Ok(())
    }
}

/// Synthesizes nothing and emits no beats: a real TTS collaborator
/// streams audio frames through `beats.emit`.
pub struct NullTts;

#[async_trait]
impl TtsSynthesizer for NullTts {
    async fn synthesize(&self, _request: TtsRequest, _beats: BeatSink) -> Result<(), SpeechError> {
        Ok(())
    }
}
