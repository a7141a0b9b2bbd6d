//! Audio playback synchronized with video playback.
//!
//! A [`PlaybackSession`] decodes the first audio stream of a media file through an
//! external `ffmpeg` process and plays it on an output device, starting and stopping
//! alongside the video.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod log_sink;
pub mod probe;
pub mod process;
pub mod queue;
pub mod session;
pub mod status;
pub mod supply;

pub use config::{BackendConfig, SessionConfig, SourceMode};
pub use error::{AudioError, ErrorKind};
pub use probe::StreamParameters;
pub use session::PlaybackSession;
pub use status::{EndReason, SessionState, SessionStatus};
