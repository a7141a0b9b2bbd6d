use std::fmt;

use crate::error::ErrorKind;
use crate::probe::StreamParameters;

/// Lifecycle position of a playback session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Probing,
    Launching,
    /// The file has no audio; nothing was launched.
    Skipped,
    Streaming,
    Stopping,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Probing => "probing",
            SessionState::Launching => "launching",
            SessionState::Skipped => "skipped",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the most recent run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// `stop()` was requested.
    Stopped,
    /// Decoder output drained with `release_on_eof` set.
    Exhausted,
    /// The file has no audio stream.
    NoAudio,
    Failed(ErrorKind),
}

/// Shared session status updated by the worker thread.
#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Parameters from the most recent probe.
    pub params: Option<StreamParameters>,
    /// Output device name while bound.
    pub device: Option<String>,
    /// Decoder pid while running.
    pub decoder_pid: Option<u32>,
    /// Terminal reason of the previous run; cleared by the next `start()`.
    pub end_reason: Option<EndReason>,
}

impl SessionStatus {
    /// Record a terminal reason unless one is already set.
    pub fn finish(&mut self, reason: EndReason) {
        self.end_reason.get_or_insert(reason);
    }

    /// Clear run-specific fields ahead of a new run.
    pub fn reset_run(&mut self) {
        self.params = None;
        self.device = None;
        self.decoder_pid = None;
        self.end_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_lowercase() {
        assert_eq!(SessionState::Streaming.to_string(), "streaming");
        assert_eq!(SessionState::default(), SessionState::Idle);
    }

    #[test]
    fn first_end_reason_wins() {
        let mut status = SessionStatus::default();
        status.finish(EndReason::Failed(ErrorKind::DeviceOpenFailure));
        status.finish(EndReason::Stopped);
        assert_eq!(
            status.end_reason,
            Some(EndReason::Failed(ErrorKind::DeviceOpenFailure))
        );
    }

    #[test]
    fn reset_run_clears_run_fields() {
        let mut status = SessionStatus {
            state: SessionState::Idle,
            params: Some(StreamParameters::default()),
            device: Some("paced-sink".to_string()),
            decoder_pid: Some(42),
            end_reason: Some(EndReason::Stopped),
        };
        status.reset_run();
        assert!(status.params.is_none());
        assert!(status.device.is_none());
        assert!(status.decoder_pid.is_none());
        assert!(status.end_reason.is_none());
    }
}
