use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{CaptureConfig, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::audio::capture::DEFAULT_BLOCK_SIZE;
use crate::controller::SessionOptions;
use crate::live::{LiveConfig, DEFAULT_MODEL, DEFAULT_VOICE};

/// Directory name under the platform config/data dirs
pub const APP_DIR_NAME: &str = "live-interview";

const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Live API model id (with or without the `models/` prefix).
    pub model: String,

    /// Prebuilt voice of the interviewer.
    pub voice: String,

    /// Rate of the PCM frames sent upstream. The live API expects 16kHz.
    pub capture_sample_rate: u32,

    /// Rate of the voice audio coming back.
    pub playback_sample_rate: u32,

    /// Samples per captured frame (4096 at 16kHz is 256ms).
    pub block_size: usize,

    /// Give up on the WebSocket handshake after this many seconds.
    pub connect_timeout_secs: u64,

    /// Give up waiting for `setupComplete` after this many seconds.
    pub setup_timeout_secs: u64,

    /// Frames buffered for the socket before new ones are dropped.
    pub outgoing_queue_depth: usize,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            connect_timeout_secs: 10,
            setup_timeout_secs: 10,
            outgoing_queue_depth: 32,
        }
    }
}

impl LiveSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs.max(1))
    }

    /// Session parameters for an interview on `topic`
    pub fn session_options(&self, topic: &str) -> SessionOptions {
        let base = LiveConfig::for_topic(topic);
        SessionOptions {
            live: LiveConfig {
                model: self.model.clone(),
                voice: self.voice.clone(),
                outgoing_capacity: self.outgoing_queue_depth.max(1),
                ..base
            },
            capture: CaptureConfig {
                target_sample_rate: self.capture_sample_rate,
                block_size: self.block_size.max(1),
            },
            playback_sample_rate: self.playback_sample_rate,
            playback_channels: 1,
        }
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir()
        .ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> LiveSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            LiveSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> LiveSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<LiveSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                LiveSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => LiveSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            LiveSettings::default()
        }
    }
}

pub fn save_settings(settings: &LiveSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &LiveSettings) -> Result<(), String> {
    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;
    write_atomic(path, &contents)
}

/// Write `contents` to a temp file next to `path`, then rename over it.
/// A crash mid-write never leaves a truncated file behind.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create directory {:?}: {}", parent, e))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents)
        .map_err(|e| format!("Write temp file {:?}: {}", tmp_path, e))?;

    // Windows refuses to rename over an existing file
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename {:?} to {:?}: {}", tmp_path, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = LiveSettings::default();
        assert_eq!(settings.model, "gemini-2.5-flash-native-audio-preview-09-2025");
        assert_eq!(settings.voice, "Puck");
        assert_eq!(settings.capture_sample_rate, 16_000);
        assert_eq!(settings.playback_sample_rate, 24_000);
        assert_eq!(settings.block_size, 4096);
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(settings, LiveSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"voice": "Kore", "block_size": 2048}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.voice, "Kore");
        assert_eq!(settings.block_size, 2048);
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(load_settings_from(&path), LiveSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = LiveSettings {
            voice: "Charon".to_string(),
            connect_timeout_secs: 3,
            ..LiveSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_session_options_follow_settings() {
        let settings = LiveSettings {
            voice: "Kore".to_string(),
            block_size: 1024,
            outgoing_queue_depth: 0,
            ..LiveSettings::default()
        };
        let options = settings.session_options("Traits");

        assert_eq!(options.live.voice, "Kore");
        assert_eq!(options.live.outgoing_capacity, 1);
        assert_eq!(options.capture.block_size, 1024);
        assert!(options.live.system_instruction.contains("\"Traits\""));
    }

    #[test]
    fn test_capture_rate_sets_upstream_descriptor() {
        let settings = LiveSettings {
            capture_sample_rate: 8_000,
            block_size: 4,
            ..LiveSettings::default()
        };
        let options = settings.session_options("Traits");
        assert_eq!(options.capture.target_sample_rate, 8_000);

        let mut assembler =
            crate::audio::FrameAssembler::new(8_000, 1, &options.capture).unwrap();
        let frames = assembler.push(&[0.0; 4]);
        assert_eq!(frames[0].mime_type, "audio/pcm;rate=8000");
    }
}
