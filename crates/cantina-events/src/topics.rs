//! Central topic registry. Every topic string the bus will accept is listed
//! here; `emit`/`subscribe` against anything else is rejected (spec.md §3/§4.1).

// Command pipeline
pub const CLI_COMMAND: &str = "/cli/command";
pub const CLI_RESPONSE: &str = "/cli/response";

// Service lifecycle
pub const SERVICE_STATUS_UPDATE: &str = "/system/service/status";
pub const SERVICE_ERROR: &str = "/system/service/error";

// Mode
pub const SYSTEM_COMMAND: &str = "/system/command";
pub const SYSTEM_SET_MODE_REQUEST: &str = "/system/mode/set_request";
pub const SYSTEM_MODE_CHANGE: &str = "/system/mode/change";

// Voice capture / transcription
pub const VOICE_LISTENING_STARTED: &str = "/voice/listening/started";
pub const VOICE_LISTENING_STOPPED: &str = "/voice/listening/stopped";
pub const TRANSCRIPTION_INTERIM: &str = "/voice/transcription/interim";
pub const TRANSCRIPTION_FINAL: &str = "/voice/transcription/final";

// Dialog / intent
pub const INTENT_DETECTED: &str = "/dialog/intent/detected";

// Speech synthesis
pub const TTS_GENERATE_REQUEST: &str = "/speech/tts/generate_request";
pub const SPEECH_SYNTHESIS_STARTED: &str = "/speech/synthesis/started";
pub const SPEECH_SYNTHESIS_ENDED: &str = "/speech/synthesis/ended";
pub const VOICE_BEAT: &str = "/speech/voice_beat";

// Music
pub const MUSIC_COMMAND: &str = "/music/command";
pub const DJ_COMMAND: &str = "/dj/command";
pub const MUSIC_PLAYBACK_STARTED: &str = "/music/playback/started";
pub const MUSIC_PLAYBACK_PAUSED: &str = "/music/playback/paused";
pub const MUSIC_PLAYBACK_RESUMED: &str = "/music/playback/resumed";
pub const MUSIC_PLAYBACK_STOPPED: &str = "/music/playback/stopped";
pub const AUDIO_DUCKING_START: &str = "/audio/ducking/start";
pub const AUDIO_DUCKING_STOP: &str = "/audio/ducking/stop";

// Plan / timeline
pub const PLAN_READY: &str = "/timeline/plan/ready";
pub const PLAN_STARTED: &str = "/timeline/plan/started";
pub const PLAN_ENDED: &str = "/timeline/plan/ended";
pub const STEP_READY: &str = "/timeline/step/ready";
pub const STEP_EXECUTED: &str = "/timeline/step/executed";
pub const STEP_CANCELLED: &str = "/timeline/step/cancelled";
pub const STEP_FAILED: &str = "/timeline/step/failed";

// Memory
pub const MEMORY_UPDATED: &str = "/memory/updated";

// Debug
pub const DEBUG_COMMAND: &str = "/debug/command";
pub const DEBUG_LOG: &str = "/debug/log";
pub const DEBUG_TRACE: &str = "/debug/trace";

// CLI bridge (composition root internal routing, spec.md §6 CLI surface)
pub const CLI_BRIDGE_MODE: &str = "/cli/bridge/mode";
pub const CLI_BRIDGE_MUSIC: &str = "/cli/bridge/music";
pub const CLI_BRIDGE_EYE: &str = "/cli/bridge/eye";

/// All registered topics, used to build the lookup set at startup.
pub const ALL: &[&str] = &[
    CLI_COMMAND,
    CLI_RESPONSE,
    SERVICE_STATUS_UPDATE,
    SERVICE_ERROR,
    SYSTEM_COMMAND,
    SYSTEM_SET_MODE_REQUEST,
    SYSTEM_MODE_CHANGE,
    VOICE_LISTENING_STARTED,
    VOICE_LISTENING_STOPPED,
    TRANSCRIPTION_INTERIM,
    TRANSCRIPTION_FINAL,
    INTENT_DETECTED,
    TTS_GENERATE_REQUEST,
    SPEECH_SYNTHESIS_STARTED,
    SPEECH_SYNTHESIS_ENDED,
    VOICE_BEAT,
    MUSIC_COMMAND,
    DJ_COMMAND,
    MUSIC_PLAYBACK_STARTED,
    MUSIC_PLAYBACK_PAUSED,
    MUSIC_PLAYBACK_RESUMED,
    MUSIC_PLAYBACK_STOPPED,
    AUDIO_DUCKING_START,
    AUDIO_DUCKING_STOP,
    PLAN_READY,
    PLAN_STARTED,
    PLAN_ENDED,
    STEP_READY,
    STEP_EXECUTED,
    STEP_CANCELLED,
    STEP_FAILED,
    MEMORY_UPDATED,
    DEBUG_COMMAND,
    DEBUG_LOG,
    DEBUG_TRACE,
    CLI_BRIDGE_MODE,
    CLI_BRIDGE_MUSIC,
    CLI_BRIDGE_EYE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_contains_no_duplicates() {
        let mut sorted: Vec<&&str> = ALL.iter().collect();
        let len_before = sorted.len();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), len_before, "duplicate topic constant found");
    }
}
