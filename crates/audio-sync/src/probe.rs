//! Stream parameter discovery via `ffprobe`.
//!
//! Only the first audio stream is inspected. Every failure mode collapses to
//! "no audio" with default numbers; the caller decides what to do with that.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::error::AudioError;

pub const DEFAULT_CHANNELS: u16 = 2;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Bytes per sample of the fixed s16le output format.
pub const SAMPLE_BYTES: usize = 2;

/// Audio layout shared by the decoder launch, the PCM queue and the output device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamParameters {
    pub channels: u16,
    pub sample_rate: u32,
    pub has_audio: bool,
    /// Codec name as reported by the probe (diagnostic only).
    pub codec: Option<String>,
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
            sample_rate: DEFAULT_SAMPLE_RATE,
            has_audio: false,
            codec: None,
        }
    }
}

impl StreamParameters {
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * SAMPLE_BYTES
    }

    /// Exact response size for a request of `frames` frames.
    pub fn bytes_for_frames(&self, frames: usize) -> usize {
        frames * self.frame_bytes()
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    streams: Option<Vec<ProbeStream>>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    channels: Option<u16>,
    /// ffprobe reports the rate as a string.
    sample_rate: Option<String>,
    codec_name: Option<String>,
}

/// Probe `path` with `ffprobe`, never failing.
///
/// Errors are logged and yield `has_audio = false` with default numbers.
pub fn probe(ffprobe: &Path, path: &Path) -> StreamParameters {
    match try_probe(ffprobe, path) {
        Ok(params) => {
            if params.has_audio {
                tracing::info!(
                    channels = params.channels,
                    rate_hz = params.sample_rate,
                    codec = params.codec.as_deref().unwrap_or("unknown"),
                    "audio stream probed"
                );
            } else {
                tracing::debug!("probe reported no audio streams");
            }
            params
        }
        Err(e) => {
            tracing::warn!(kind = ?e.kind(), "stream probe failed: {e}");
            StreamParameters::default()
        }
    }
}

fn try_probe(ffprobe: &Path, path: &Path) -> Result<StreamParameters, AudioError> {
    let program = ffprobe.display().to_string();
    let args = probe_args(path);
    tracing::debug!(program = %program, ?args, "running stream probe");

    let output = Command::new(ffprobe)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| AudioError::ProbeSpawn { program, source })?;

    if !output.status.success() {
        return Err(AudioError::ProbeStatus {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    tracing::debug!(stdout = %truncate(&stdout, 200), "stream probe output");
    parse_probe_output(&stdout)
}

fn probe_args(path: &Path) -> Vec<&OsStr> {
    let mut args: Vec<&OsStr> = [
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-select_streams",
        "a:0",
    ]
    .into_iter()
    .map(OsStr::new)
    .collect();
    args.push(path.as_os_str());
    args
}

/// Parse ffprobe JSON into stream parameters.
///
/// A missing or empty `streams` array is not an error: it means there is no audio.
pub fn parse_probe_output(json: &str) -> Result<StreamParameters, AudioError> {
    let parsed: ProbeOutput = serde_json::from_str(json)?;
    let Some(stream) = parsed.streams.and_then(|s| s.into_iter().next()) else {
        return Ok(StreamParameters::default());
    };

    let channels = stream
        .channels
        .filter(|c| *c > 0)
        .unwrap_or(DEFAULT_CHANNELS);
    let sample_rate = stream
        .sample_rate
        .as_deref()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|r| *r > 0)
        .unwrap_or(DEFAULT_SAMPLE_RATE);

    Ok(StreamParameters {
        channels,
        sample_rate,
        has_audio: true,
        codec: stream.codec_name,
    })
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_audio_stream() {
        let json = r#"{"streams":[{"index":1,"codec_name":"aac","channels":2,"sample_rate":"44100"}]}"#;
        let params = parse_probe_output(json).unwrap();
        assert_eq!(
            params,
            StreamParameters {
                channels: 2,
                sample_rate: 44_100,
                has_audio: true,
                codec: Some("aac".to_string()),
            }
        );
        assert_eq!(params.frame_bytes(), 4);
        assert_eq!(params.bytes_for_frames(512), 2048);
    }

    #[test]
    fn empty_stream_list_means_no_audio() {
        let params = parse_probe_output(r#"{"streams":[]}"#).unwrap();
        assert!(!params.has_audio);
        assert_eq!(params.channels, DEFAULT_CHANNELS);
        assert_eq!(params.sample_rate, DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn missing_streams_field_means_no_audio() {
        let params = parse_probe_output("{}").unwrap();
        assert!(!params.has_audio);
    }

    #[test]
    fn missing_numeric_fields_fall_back() {
        let json = r#"{"streams":[{"codec_name":"opus","channels":0}]}"#;
        let params = parse_probe_output(json).unwrap();
        assert!(params.has_audio);
        assert_eq!(params.channels, 2);
        assert_eq!(params.sample_rate, 44_100);
    }

    #[test]
    fn six_channel_48k() {
        let json = r#"{"streams":[{"channels":6,"sample_rate":"48000"}]}"#;
        let params = parse_probe_output(json).unwrap();
        assert_eq!(params.channels, 6);
        assert_eq!(params.sample_rate, 48_000);
        assert!(params.codec.is_none());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_probe_output("not json").unwrap_err();
        assert!(matches!(err, AudioError::ProbeParse(_)));
    }

    #[test]
    fn absent_tool_yields_defaults() {
        let params = probe(
            Path::new("/nonexistent/ffprobe"),
            Path::new("/tmp/video.mp4"),
        );
        assert_eq!(params, StreamParameters::default());
    }

    #[test]
    fn probe_args_select_first_audio_stream() {
        let args = probe_args(Path::new("clip.mkv"));
        let joined: Vec<_> = args.iter().map(|a| a.to_string_lossy()).collect();
        assert_eq!(joined[joined.len() - 2], "a:0");
        assert_eq!(joined.last().unwrap(), "clip.mkv");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
