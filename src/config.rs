//! Runtime configuration
//!
//! TOML file with serde defaults on every field so partial configs work.
//! A missing file falls back to defaults; a malformed one is an error.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the HTTP server
    pub bind: SocketAddr,
    /// Capture and stream rate; 0 is clamped to 1
    pub stream_fps: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    pub temp_dir: PathBuf,
    /// Consecutive capture failures tolerated before the pipeline stops
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Command line of the external model worker
    pub command: Vec<String>,
    /// Detections below this confidence are dropped
    pub min_confidence: f32,
    /// How long /detect waits for the model before giving up
    pub response_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            stream_fps: 30,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            jpeg_quality: 80,
            temp_dir: PathBuf::from("/tmp/countcam_capture"),
            max_consecutive_failures: 30,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "scripts/detector.py".to_string()],
            min_confidence: 0.25,
            response_timeout_ms: 5000,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            tracing::info!("no config file at {}, using defaults", path.display());
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.server.stream_fps == 0 {
            tracing::warn!("stream_fps = 0 makes no sense, clamping to 1");
            self.server.stream_fps = 1;
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            bail!(
                "camera resolution {}x{} is invalid",
                self.camera.width,
                self.camera.height
            );
        }
        // YUYV packs two pixels per group, odd widths would tear every row
        if self.camera.width % 2 != 0 {
            bail!("camera width must be even for YUYV capture");
        }
        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            bail!(
                "min_confidence {} is outside [0, 1]",
                self.detector.min_confidence
            );
        }
        if self.detector.command.is_empty() {
            bail!("detector command must not be empty");
        }
        Ok(())
    }
}
