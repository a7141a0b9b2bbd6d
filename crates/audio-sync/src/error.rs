//! Error taxonomy for the playback engine.
//!
//! None of these reach the caller of `start()`/`stop()`: the background worker logs
//! them (with their [`ErrorKind`]) and exits quietly so video playback carries on.

use std::process::ExitStatus;

use thiserror::Error;

/// Coarse classification used in log lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    SubsystemUnavailable,
    NoAudioStream,
    ProbeFailure,
    LaunchFailure,
    DeviceOpenFailure,
    RuntimeStreamError,
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio output subsystem unavailable")]
    SubsystemUnavailable,

    #[error("no audio stream detected")]
    NoAudioStream,

    #[error("failed to run {program}: {source}")]
    ProbeSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream probe exited with {status}: {stderr}")]
    ProbeStatus { status: ExitStatus, stderr: String },

    #[error("unreadable probe output: {0}")]
    ProbeParse(#[from] serde_json::Error),

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited immediately ({status})")]
    EarlyExit { program: String, status: ExitStatus },

    #[error("{program} failed while extracting audio ({status})")]
    Extraction { program: String, status: ExitStatus },

    #[error("extraction file error: {0}")]
    ExtractionFile(#[source] std::io::Error),

    #[error("no output device available")]
    NoDevice,

    #[error("failed to open output device {device}: {message}")]
    DeviceOpen { device: String, message: String },

    #[error("output stream error: {0}")]
    RuntimeStream(String),
}

impl AudioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AudioError::SubsystemUnavailable => ErrorKind::SubsystemUnavailable,
            AudioError::NoAudioStream => ErrorKind::NoAudioStream,
            AudioError::ProbeSpawn { .. }
            | AudioError::ProbeStatus { .. }
            | AudioError::ProbeParse(_) => ErrorKind::ProbeFailure,
            AudioError::Launch { .. }
            | AudioError::EarlyExit { .. }
            | AudioError::Extraction { .. }
            | AudioError::ExtractionFile(_) => ErrorKind::LaunchFailure,
            AudioError::NoDevice | AudioError::DeviceOpen { .. } => ErrorKind::DeviceOpenFailure,
            AudioError::RuntimeStream(_) => ErrorKind::RuntimeStreamError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(AudioError::NoAudioStream.kind(), ErrorKind::NoAudioStream);
        assert_eq!(AudioError::NoDevice.kind(), ErrorKind::DeviceOpenFailure);
        let spawn = AudioError::Launch {
            program: "ffmpeg".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(spawn.kind(), ErrorKind::LaunchFailure);
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(AudioError::from(parse).kind(), ErrorKind::ProbeFailure);
    }

    #[test]
    fn launch_error_names_program() {
        let err = AudioError::Launch {
            program: "ffmpeg".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().starts_with("failed to launch ffmpeg"));
    }
}
