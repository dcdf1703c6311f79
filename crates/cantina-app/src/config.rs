//! Runtime configuration, read once at startup from environment variables.
//! Every concrete vendor collaborator (ASR/TTS/LLM/LED
//! firmware) is out of scope for this runtime, so API keys are collected
//! generically rather than named per-vendor: CantinaOS itself never reads
//! them, it only hands the map to whichever collaborator implementation is
//! wired in at the boundary.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub local_music_directory: PathBuf,
    pub mock_led_controller: bool,
    pub led_serial_port: Option<PathBuf>,
    pub led_baud_rate: u32,
    pub disable_audio_processing: bool,
    pub web_bridge_addr: String,
    pub collaborator_api_keys: HashMap<String, String>,
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("{name} must be an integer, got {raw:?}")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("{name} is not valid unicode")),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("{name} must be a boolean, got {other:?}"),
        },
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("{name} is not valid unicode")),
    }
}

/// Collaborator API keys are any env var ending in `_API_KEY`, collected
/// without CantinaOS knowing which vendors exist.
fn collaborator_api_keys() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.ends_with("_API_KEY"))
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            audio_sample_rate: env_u32("AUDIO_SAMPLE_RATE", 16_000)?,
            audio_channels: env_u32("AUDIO_CHANNELS", 1)? as u16,
            local_music_directory: std::env::var("LOCAL_MUSIC_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./music")),
            mock_led_controller: env_bool("MOCK_LED_CONTROLLER", true)?,
            led_serial_port: std::env::var("LED_SERIAL_PORT").ok().map(PathBuf::from),
            led_baud_rate: env_u32("LED_BAUD_RATE", 9_600)?,
            disable_audio_processing: env_bool("DISABLE_AUDIO_PROCESSING", false)?,
            web_bridge_addr: std::env::var("WEB_BRIDGE_ADDR").unwrap_or_else(|_| "127.0.0.1:9001".to_string()),
            collaborator_api_keys: collaborator_api_keys(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u32_falls_back_to_default_when_unset() {
        std::env::remove_var("CANTINA_TEST_MISSING_U32");
        assert_eq!(env_u32("CANTINA_TEST_MISSING_U32", 42).unwrap(), 42);
    }

    #[test]
    fn env_u32_rejects_non_numeric_values() {
        std::env::set_var("CANTINA_TEST_BAD_U32", "not-a-number");
        assert!(env_u32("CANTINA_TEST_BAD_U32", 0).is_err());
        std::env::remove_var("CANTINA_TEST_BAD_U32");
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        std::env::set_var("CANTINA_TEST_BOOL", "Yes");
        assert!(env_bool("CANTINA_TEST_BOOL", false).unwrap());
        std::env::set_var("CANTINA_TEST_BOOL", "0");
        assert!(!env_bool("CANTINA_TEST_BOOL", true).unwrap());
        std::env::remove_var("CANTINA_TEST_BOOL");
    }
}
