//! Session tuning and tool locations.
//!
//! Every field has a default, so a TOML file only needs the keys it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// How PCM reaches the output queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Pipe PCM live from a long-running ffmpeg process.
    #[default]
    Stream,
    /// Extract the whole track to a temporary file first, then stream the file.
    Extract,
}

/// Playback tuning parameters shared by the worker, pump and output stages.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Transcoder binary (name on `PATH` or full path).
    pub ffmpeg: PathBuf,
    /// Media inspection binary.
    pub ffprobe: PathBuf,
    pub mode: SourceMode,
    /// PCM queue capacity, in seconds of audio at the probed rate.
    pub buffer_seconds: f32,
    /// Bytes per read from the decoder pipe.
    pub pump_chunk_bytes: usize,
    /// Log min/max amplitude every N pulls (0 disables).
    pub diagnostics_every: u64,
    /// Bounded wait for the worker in `stop()`.
    pub join_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout_ms: u64,
    /// Bounded wait for the first PCM bytes after launch.
    pub test_read_timeout_ms: u64,
    /// How often the worker re-checks the cancel flag while streaming.
    pub poll_interval_ms: u64,
    /// Close the device once the decoder output is drained instead of playing silence.
    pub release_on_eof: bool,
    pub backend: BackendConfig,
}

/// Output route auto-detection settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub enabled: bool,
    /// Process lookup utility, invoked as `<program> -f <shared_server>`.
    pub probe_program: PathBuf,
    /// Process name of the shared audio server.
    pub shared_server: String,
    /// Device identifier used when the shared server is running.
    pub shared_device: String,
    /// Device identifier used otherwise (first card, first device).
    pub direct_device: String,
    /// Environment variable the device binding reads.
    pub env_var: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            mode: SourceMode::Stream,
            buffer_seconds: 1.0,
            pump_chunk_bytes: 4096,
            diagnostics_every: 10,
            join_timeout_ms: 1000,
            terminate_timeout_ms: 2000,
            test_read_timeout_ms: 250,
            poll_interval_ms: 100,
            release_on_eof: false,
            backend: BackendConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_program: PathBuf::from("pgrep"),
            shared_server: "pipewire".to_string(),
            shared_device: "pipewire".to_string(),
            direct_device: "plughw:0,0".to_string(),
            env_var: "ALSA_PCM_DEVICE".to_string(),
        }
    }
}

impl SessionConfig {
    /// Load a config file, falling back to defaults for missing keys.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn test_read_timeout(&self) -> Duration {
        Duration::from_millis(self.test_read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: SessionConfig = toml::from_str(
            r#"
            mode = "extract"
            join_timeout_ms = 500

            [backend]
            direct_device = "plughw:1,0"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.mode, SourceMode::Extract);
        assert_eq!(cfg.join_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.terminate_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.backend.direct_device, "plughw:1,0");
        assert_eq!(cfg.backend.env_var, "ALSA_PCM_DEVICE");
        assert_eq!(cfg.ffmpeg, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.toml");
        std::fs::write(&path, "ffmpeg = \"/opt/ffmpeg/bin/ffmpeg\"\n").unwrap();
        let cfg = SessionConfig::load(&path).unwrap();
        assert_eq!(cfg.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(cfg.mode, SourceMode::Stream);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = SessionConfig::load(Path::new("/nonexistent/audio.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }

    #[test]
    fn poll_interval_never_zero() {
        let cfg = SessionConfig {
            poll_interval_ms: 0,
            ..SessionConfig::default()
        };
        assert_eq!(cfg.poll_interval(), Duration::from_millis(1));
    }
}
