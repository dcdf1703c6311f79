//! MusicCoordinator: track registry + STOPPED/PLAYING/PAUSED state machine,
//! ducking, and crossfade (spec.md §4.6).
//!
//! The track registry is discovered from a local directory at startup
//! (`LOCAL_MUSIC_DIRECTORY`, spec.md §6); actual audio decoding/output is the
//! out-of-scope VLC/driver collaborator (spec.md §1), so duration is left at
//! `0.0` for locally discovered tracks and ducking/crossfade are modeled as
//! real, observable state transitions rather than audio rendering.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{
    topics, AudioDuckingPayload, CliResponsePayload, MusicCommandPayload, MusicPlaybackEventPayload, Track,
    TrackProvider,
};
use cantina_service::{Service, ServiceCore, ServiceError, ServiceHandle};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

/// Default attenuation applied while `duck_count > 0` (spec.md §4.6).
pub const DEFAULT_DUCK_RATIO: f32 = 0.25;

/// Default crossfade ramp length when switching tracks mid-playback.
pub const DEFAULT_CROSSFADE: Duration = Duration::from_millis(400);

const CROSSFADE_STEPS: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
enum PlaybackState {
    Stopped,
    Playing { track: Track, started_at: Instant, position_offset: f64 },
    Paused { track: Track, position_seconds: f64 },
}

/// Scan `dir` for audio files and build a stable track registry.
///
/// No metadata/ID3 parsing (out of scope): title is the humanized file
/// stem, artist is left blank, duration is unknown (`0.0`).
fn discover_tracks(dir: &Path) -> Vec<Track> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "music directory unreadable, starting with an empty registry");
            return Vec::new();
        }
    };

    let mut tracks = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_audio = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "mp3" | "wav" | "flac" | "ogg"))
            .unwrap_or(false);
        if !is_audio {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let title = stem.replace(['_', '-'], " ");
        tracks.push(Track {
            track_id: stem.to_string(),
            title,
            artist: String::new(),
            duration_seconds: 0.0,
            provider: TrackProvider::Local,
            source_path: path.to_string_lossy().into_owned(),
        });
    }
    tracks.sort_by(|a, b| a.track_id.cmp(&b.track_id));
    tracks
}

pub struct MusicCoordinator {
    core: ServiceCore,
    tracks: Arc<Vec<Track>>,
    duck_ratio: f32,
    crossfade_duration: Duration,
    state: Arc<Mutex<PlaybackState>>,
    duck_count: Arc<AtomicI64>,
    crossfade_progress: Arc<AtomicU32>,
}

impl MusicCoordinator {
    pub fn new(bus: Arc<EventBus>, music_directory: impl AsRef<Path>) -> Self {
        let tracks = discover_tracks(music_directory.as_ref());
        Self::with_tracks(bus, tracks)
    }

    /// Construct with an explicit track list, bypassing directory discovery
    /// (used by tests and by callers that already have a catalog).
    pub fn with_tracks(bus: Arc<EventBus>, tracks: Vec<Track>) -> Self {
        Self {
            core: ServiceCore::new("music_coordinator", bus),
            tracks: Arc::new(tracks),
            duck_ratio: DEFAULT_DUCK_RATIO,
            crossfade_duration: DEFAULT_CROSSFADE,
            state: Arc::new(Mutex::new(PlaybackState::Stopped)),
            duck_count: Arc::new(AtomicI64::new(0)),
            crossfade_progress: Arc::new(AtomicU32::new(0f32.to_bits())),
        }
    }

    pub fn with_crossfade_duration(mut self, duration: Duration) -> Self {
        self.crossfade_duration = duration;
        self
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Current effective volume multiplier: `1.0` normally, `duck_ratio`
    /// while ducked (spec.md §4.6).
    pub fn volume_ratio(&self) -> f32 {
        if self.duck_count.load(Ordering::SeqCst) > 0 {
            self.duck_ratio
        } else {
            1.0
        }
    }

    /// `0.0..=1.0` progress of the most recent crossfade ramp.
    pub fn crossfade_progress(&self) -> f32 {
        f32::from_bits(self.crossfade_progress.load(Ordering::SeqCst))
    }

    async fn crossfade_ramp(progress: &AtomicU32, duration: Duration) {
        progress.store(0f32.to_bits(), Ordering::SeqCst);
        if duration.is_zero() {
            progress.store(1f32.to_bits(), Ordering::SeqCst);
            return;
        }
        let step_duration = duration / CROSSFADE_STEPS;
        for step in 1..=CROSSFADE_STEPS {
            tokio::time::sleep(step_duration).await;
            let value = step as f32 / CROSSFADE_STEPS as f32;
            progress.store(value.to_bits(), Ordering::SeqCst);
        }
    }

    fn increment_duck(&self) {
        increment_duck(&self.duck_count);
    }

    fn decrement_duck(&self) {
        decrement_duck(&self.duck_count);
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_music_command(
        handle: ServiceHandle,
        tracks: Arc<Vec<Track>>,
        state: Arc<Mutex<PlaybackState>>,
        crossfade_progress: Arc<AtomicU32>,
        crossfade_duration: Duration,
        payload: Value,
    ) -> Result<(), String> {
        let command: MusicCommandPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        match command.action.as_str() {
            "play" => {
                Self::handle_play(&handle, &tracks, &state, &crossfade_progress, crossfade_duration, command).await
            }
            "pause" => Self::handle_pause(&handle, &state, command.conversation_id).await,
            "resume" => Self::handle_resume(&handle, &state, command.conversation_id).await,
            "stop" => Self::handle_stop(&handle, &state, command.conversation_id).await,
            "list" => {
                let message = if tracks.is_empty() {
                    "no tracks available".to_string()
                } else {
                    tracks.iter().map(|t| t.title.as_str()).collect::<Vec<_>>().join(", ")
                };
                handle
                    .emit(
                        topics::CLI_RESPONSE,
                        serde_json::to_value(CliResponsePayload { message, is_error: false })
                            .expect("cli response payload always serializes"),
                    )
                    .await;
                Ok(())
            }
            other => {
                handle.emit_error(format!("unknown music action: {other}")).await;
                Ok(())
            }
        }
    }

    async fn handle_play(
        handle: &ServiceHandle,
        tracks: &Arc<Vec<Track>>,
        state: &Arc<Mutex<PlaybackState>>,
        crossfade_progress: &Arc<AtomicU32>,
        crossfade_duration: Duration,
        command: MusicCommandPayload,
    ) -> Result<(), String> {
        let needle = command.track_query.as_deref();
        let track = match find_track(tracks, needle) {
            Some(track) => track,
            None => {
                handle.emit_error("no tracks available to play".to_string()).await;
                return Ok(());
            }
        };

        let was_playing = matches!(
            *state.lock().expect("music state lock poisoned"),
            PlaybackState::Playing { .. }
        );
        if was_playing {
            Self::crossfade_ramp(crossfade_progress, crossfade_duration).await;
        }

        {
            let mut guard = state.lock().expect("music state lock poisoned");
            *guard = PlaybackState::Playing {
                track: track.clone(),
                started_at: Instant::now(),
                position_offset: 0.0,
            };
        }

        let duration_seconds = track.duration_seconds;
        let payload = MusicPlaybackEventPayload {
            track,
            start_timestamp: chrono::Utc::now().timestamp(),
            duration_seconds,
            position_seconds: None,
            conversation_id: command.conversation_id,
        };
        handle
            .emit(
                topics::MUSIC_PLAYBACK_STARTED,
                serde_json::to_value(payload).expect("music payload always serializes"),
            )
            .await;
        Ok(())
    }

    async fn handle_pause(
        handle: &ServiceHandle,
        state: &Arc<Mutex<PlaybackState>>,
        conversation_id: Option<String>,
    ) -> Result<(), String> {
        let transition = {
            let mut guard = state.lock().expect("music state lock poisoned");
            match guard.clone() {
                PlaybackState::Playing { track, started_at, position_offset } => {
                    let position = position_offset + started_at.elapsed().as_secs_f64();
                    *guard = PlaybackState::Paused {
                        track: track.clone(),
                        position_seconds: position,
                    };
                    Some((track, position))
                }
                _ => None,
            }
        };

        match transition {
            Some((track, position)) => {
                let duration_seconds = track.duration_seconds;
                let payload = MusicPlaybackEventPayload {
                    track,
                    start_timestamp: chrono::Utc::now().timestamp(),
                    duration_seconds,
                    position_seconds: Some(position),
                    conversation_id,
                };
                handle
                    .emit(
                        topics::MUSIC_PLAYBACK_PAUSED,
                        serde_json::to_value(payload).expect("music payload always serializes"),
                    )
                    .await;
            }
            None => warn!("pause requested with nothing playing, ignored"),
        }
        Ok(())
    }

    async fn handle_resume(
        handle: &ServiceHandle,
        state: &Arc<Mutex<PlaybackState>>,
        conversation_id: Option<String>,
    ) -> Result<(), String> {
        let transition = {
            let mut guard = state.lock().expect("music state lock poisoned");
            match guard.clone() {
                PlaybackState::Paused { track, position_seconds } => {
                    *guard = PlaybackState::Playing {
                        track: track.clone(),
                        started_at: Instant::now(),
                        position_offset: position_seconds,
                    };
                    Some((track, position_seconds))
                }
                _ => None,
            }
        };

        match transition {
            Some((track, position)) => {
                let duration_seconds = track.duration_seconds;
                let payload = MusicPlaybackEventPayload {
                    track,
                    start_timestamp: chrono::Utc::now().timestamp(),
                    duration_seconds,
                    position_seconds: Some(position),
                    conversation_id,
                };
                handle
                    .emit(
                        topics::MUSIC_PLAYBACK_RESUMED,
                        serde_json::to_value(payload).expect("music payload always serializes"),
                    )
                    .await;
            }
            None => warn!("resume requested with nothing paused, ignored"),
        }
        Ok(())
    }

    async fn handle_stop(
        handle: &ServiceHandle,
        state: &Arc<Mutex<PlaybackState>>,
        conversation_id: Option<String>,
    ) -> Result<(), String> {
        let stopped = {
            let mut guard = state.lock().expect("music state lock poisoned");
            let result = match guard.clone() {
                PlaybackState::Playing { track, started_at, position_offset } => {
                    Some((track, position_offset + started_at.elapsed().as_secs_f64()))
                }
                PlaybackState::Paused { track, position_seconds } => Some((track, position_seconds)),
                PlaybackState::Stopped => None,
            };
            *guard = PlaybackState::Stopped;
            result
        };

        match stopped {
            Some((track, position)) => {
                let duration_seconds = track.duration_seconds;
                let payload = MusicPlaybackEventPayload {
                    track,
                    start_timestamp: chrono::Utc::now().timestamp(),
                    duration_seconds,
                    position_seconds: Some(position),
                    conversation_id,
                };
                handle
                    .emit(
                        topics::MUSIC_PLAYBACK_STOPPED,
                        serde_json::to_value(payload).expect("music payload always serializes"),
                    )
                    .await;
            }
            None => warn!("stop requested with nothing playing or paused, ignored"),
        }
        Ok(())
    }
}

fn increment_duck(duck_count: &AtomicI64) {
    duck_count.fetch_add(1, Ordering::SeqCst);
}

fn decrement_duck(duck_count: &AtomicI64) {
    let previous = duck_count
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| Some((count - 1).max(0)))
        .expect("closure always returns Some");
    if previous == 0 {
        warn!("AUDIO_DUCKING_STOP received with duck_count already at 0, clamping");
    }
}

fn find_track(tracks: &[Track], query: Option<&str>) -> Option<Track> {
    match query {
        None => tracks.first().cloned(),
        Some(query) => {
            let needle = query.to_ascii_lowercase();
            tracks
                .iter()
                .find(|t| t.title.to_ascii_lowercase().contains(&needle) || t.artist.to_ascii_lowercase().contains(&needle))
                .or_else(|| tracks.first())
                .cloned()
        }
    }
}

#[async_trait]
impl Service for MusicCoordinator {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        // Every handler closes over `Arc::clone`s of the coordinator's own
        // fields, so state observed via `self` (e.g. `crossfade_progress()`,
        // `volume_ratio()`) is the same state the handlers mutate — same
        // sharing idiom as `cantina-mode`'s `Arc<Mutex<SystemMode>>`.
        let handle = self.core.handle();
        let crossfade_duration = self.crossfade_duration;
        {
            let handle = handle.clone();
            let tracks = Arc::clone(&self.tracks);
            let state = Arc::clone(&self.state);
            let crossfade_progress = Arc::clone(&self.crossfade_progress);
            self.core.subscribe(topics::MUSIC_COMMAND, move |payload| {
                let handle = handle.clone();
                let tracks = Arc::clone(&tracks);
                let state = Arc::clone(&state);
                let crossfade_progress = Arc::clone(&crossfade_progress);
                async move {
                    Self::handle_music_command(handle, tracks, state, crossfade_progress, crossfade_duration, payload)
                        .await
                }
            })?;
        }

        {
            let duck_count = Arc::clone(&self.duck_count);
            self.core.subscribe(topics::AUDIO_DUCKING_START, move |payload| {
                let duck_count = Arc::clone(&duck_count);
                async move {
                    let _: AudioDuckingPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
                    increment_duck(&duck_count);
                    Ok(())
                }
            })?;
        }

        {
            let duck_count = Arc::clone(&self.duck_count);
            self.core.subscribe(topics::AUDIO_DUCKING_STOP, move |payload| {
                let duck_count = Arc::clone(&duck_count);
                async move {
                    let _: AudioDuckingPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
                    decrement_duck(&duck_count);
                    Ok(())
                }
            })?;
        }

        Ok(())
    }
}
