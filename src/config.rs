//! Configuration management for crabcapture
//!
//! Provides loading, saving and validation of the timing and sizing knobs used
//! by the capture sequencer, the ZSL queue, the streaming processor and the
//! frame processor.

use crate::errors::CameraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrabCaptureConfig {
    pub sequencer: SequencerConfig,
    pub zsl: ZslConfig,
    pub streaming: StreamingConfig,
    pub frame: FrameConfig,
    pub client: ClientConfig,
}

/// Still-capture state machine timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Length of one bounded wait in milliseconds
    pub wait_duration_ms: u64,
    /// Waits allowed before precapture metering is seen to start
    pub max_timeouts_precapture_start: u32,
    /// Waits allowed before precapture metering is seen to finish
    pub max_timeouts_precapture_end: u32,
    /// Waits allowed for the result frame and compressed image
    pub max_timeouts_capture_end: u32,
    /// How long stopping preview waits for an in-flight capture
    pub stop_capture_timeout_ms: u64,
}

/// Zero-shutter-lag queue sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZslConfig {
    /// Number of buffered images kept in the ring
    pub buffer_depth: usize,
    /// Number of recent result frames kept for matching
    pub frame_list_depth: usize,
    /// Largest buffer/frame timestamp difference still treated as a match
    pub match_tolerance_ns: i64,
    /// Worker wait for new buffers in milliseconds
    pub wait_duration_ms: u64,
}

/// Streaming and recording settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Recording frames that may be outstanding with the client
    pub recording_heap_count: usize,
    /// Upper bound accepted for the recording heap
    pub max_recording_heap_count: usize,
    /// Worker wait in milliseconds
    pub wait_duration_ms: u64,
}

/// Result frame processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Wait for the next result frame in milliseconds
    pub wait_duration_ms: u64,
}

/// Client-level timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Wait for the device to pick up the active streaming request
    pub sync_timeout_ms: u64,
    /// Wait for each worker thread to finish on disconnect
    pub join_timeout_ms: u64,
}

impl Default for CrabCaptureConfig {
    fn default() -> Self {
        Self {
            sequencer: SequencerConfig {
                wait_duration_ms: 100,
                max_timeouts_precapture_start: 10,
                max_timeouts_precapture_end: 20,
                max_timeouts_capture_end: 40,
                stop_capture_timeout_ms: 3000,
            },
            zsl: ZslConfig {
                buffer_depth: 4,
                frame_list_depth: 8,
                match_tolerance_ns: 1_000_000,
                wait_duration_ms: 10,
            },
            streaming: StreamingConfig {
                recording_heap_count: 8,
                max_recording_heap_count: 32,
                wait_duration_ms: 100,
            },
            frame: FrameConfig { wait_duration_ms: 10 },
            client: ClientConfig {
                sync_timeout_ms: 500,
                join_timeout_ms: 1000,
            },
        }
    }
}

impl SequencerConfig {
    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_ms)
    }

    pub fn stop_capture_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_capture_timeout_ms)
    }
}

impl StreamingConfig {
    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_ms)
    }
}

impl ZslConfig {
    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_ms)
    }
}

impl FrameConfig {
    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_ms)
    }
}

impl ClientConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl CrabCaptureConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CameraError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;

        let config: CrabCaptureConfig = toml::from_str(&contents)
            .map_err(|e| CameraError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate().map_err(CameraError::Config)?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| CameraError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabcapture.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.sequencer.wait_duration_ms == 0 {
            return Err("Sequencer wait duration must be non-zero".to_string());
        }
        if self.sequencer.max_timeouts_precapture_start == 0
            || self.sequencer.max_timeouts_precapture_end == 0
            || self.sequencer.max_timeouts_capture_end == 0
        {
            return Err("Sequencer timeout counts must be non-zero".to_string());
        }

        if self.zsl.buffer_depth == 0 {
            return Err("ZSL buffer depth must be non-zero".to_string());
        }
        if self.zsl.frame_list_depth < self.zsl.buffer_depth {
            return Err("ZSL frame list must be at least as deep as the buffer ring".to_string());
        }
        if self.zsl.match_tolerance_ns < 0 {
            return Err("ZSL match tolerance cannot be negative".to_string());
        }

        if self.streaming.recording_heap_count == 0
            || self.streaming.recording_heap_count > self.streaming.max_recording_heap_count
        {
            return Err(format!(
                "Recording heap count must be between 1 and {}",
                self.streaming.max_recording_heap_count
            ));
        }
        if self.streaming.wait_duration_ms == 0 || self.frame.wait_duration_ms == 0 || self.zsl.wait_duration_ms == 0 {
            return Err("Worker wait durations must be non-zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CrabCaptureConfig::default();
        assert_eq!(config.sequencer.wait_duration_ms, 100);
        assert_eq!(config.sequencer.max_timeouts_capture_end, 40);
        assert_eq!(config.zsl.buffer_depth, 4);
        assert_eq!(config.zsl.frame_list_depth, 8);
    }

    #[test]
    fn test_config_validation() {
        let config = CrabCaptureConfig::default();
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.zsl.buffer_depth = 0;
        assert!(bad.validate().is_err());

        let mut shallow = CrabCaptureConfig::default();
        shallow.zsl.frame_list_depth = 2;
        assert!(shallow.validate().is_err());

        let mut heap = CrabCaptureConfig::default();
        heap.streaming.recording_heap_count = 64;
        assert!(heap.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("nested").join("crabcapture.toml");

        let mut config = CrabCaptureConfig::default();
        config.sequencer.wait_duration_ms = 20;
        config.save_to_file(&config_path).unwrap();

        let loaded = CrabCaptureConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_toml_format() {
        let config = CrabCaptureConfig::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[sequencer]"));
        assert!(toml_string.contains("[zsl]"));
        assert!(toml_string.contains("[streaming]"));
        assert!(toml_string.contains("[frame]"));
        assert!(toml_string.contains("[client]"));
        assert!(toml_string.contains("match_tolerance_ns"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = CrabCaptureConfig::load_from_file("nonexistent_crabcapture.toml");
        assert_eq!(result.unwrap().sequencer.wait_duration_ms, 100);
    }

    #[test]
    fn test_load_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        let mut config = CrabCaptureConfig::default();
        config.zsl.buffer_depth = 0;
        fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let err = CrabCaptureConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, CameraError::Config(_)));
    }
}
