use std::path::PathBuf;

use audio_sync::{SessionConfig, SourceMode};
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "sync-play", version)]
pub struct Args {
    /// Video (or any media) file whose audio track should be played
    #[arg(required_unless_present = "list_devices")]
    pub video: Option<PathBuf>,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long)]
    pub duration: Option<f64>,

    /// How PCM reaches the output: piped live, or extracted to a temp file first
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// ffmpeg binary
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,

    /// ffprobe binary
    #[arg(long)]
    pub ffprobe: Option<PathBuf>,

    /// TOML session config; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Pull audio at real-time pace without a sound card
    #[arg(long)]
    pub null_output: bool,

    /// Also append timestamped log lines to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Stream,
    Extract,
}

impl From<ModeArg> for SourceMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Stream => SourceMode::Stream,
            ModeArg::Extract => SourceMode::Extract,
        }
    }
}

impl Args {
    /// Overlay command-line overrides onto `config`.
    pub fn apply(&self, config: &mut SessionConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.ffmpeg = ffmpeg.clone();
        }
        if let Some(ffprobe) = &self.ffprobe {
            config.ffprobe = ffprobe.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "sync-play",
            "movie.mkv",
            "--mode",
            "extract",
            "--ffmpeg",
            "/opt/ffmpeg",
        ]);
        let mut config = SessionConfig::default();
        args.apply(&mut config);
        assert_eq!(config.mode, SourceMode::Extract);
        assert_eq!(config.ffmpeg, PathBuf::from("/opt/ffmpeg"));
        assert_eq!(config.ffprobe, PathBuf::from("ffprobe"));
    }

    #[test]
    fn video_required_unless_listing() {
        assert!(Args::try_parse_from(["sync-play"]).is_err());
        let args = Args::try_parse_from(["sync-play", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.video.is_none());
    }
}
