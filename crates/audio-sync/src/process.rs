//! External decoder process management.
//!
//! ffmpeg turns the container's first audio stream into raw interleaved s16le at
//! exactly the probed channel count and rate. Teardown is always the bounded
//! SIGTERM → wait → SIGKILL sequence, including on drop.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::AudioError;
use crate::probe::StreamParameters;

const EXIT_POLL: Duration = Duration::from_millis(20);
const DROP_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// How a [`DecodeProcess`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Had already exited (EOF or error) before teardown.
    AlreadyExited,
    /// Exited after the graceful stop signal.
    Graceful,
    /// Had to be force-killed.
    Killed,
}

/// Running ffmpeg child. Terminated on drop if still owned.
pub struct DecodeProcess {
    child: Option<Child>,
    program: String,
}

impl DecodeProcess {
    /// Spawn a decoder streaming PCM to its stdout.
    ///
    /// Fails if the binary cannot be spawned or the process is already gone by the
    /// time it is polled.
    pub fn launch(
        ffmpeg: &Path,
        path: &Path,
        params: &StreamParameters,
    ) -> Result<(Self, ChildStdout), AudioError> {
        let mut process = Self::spawn(ffmpeg, decode_args(path, params, None), Stdio::piped())?;
        tracing::debug!(pid = ?process.id(), "decoder spawned");

        if let Some(status) = process.try_exit_status() {
            return Err(AudioError::EarlyExit {
                program: process.program.clone(),
                status,
            });
        }

        let stdout = process
            .child
            .as_mut()
            .and_then(|c| c.stdout.take())
            .ok_or_else(|| AudioError::Launch {
                program: process.program.clone(),
                source: std::io::Error::other("decoder stdout not captured"),
            })?;
        Ok((process, stdout))
    }

    /// Spawn a decoder writing the whole PCM track to `dest`.
    ///
    /// Completion is observed with [`DecodeProcess::try_exit_status`].
    pub fn extract(
        ffmpeg: &Path,
        path: &Path,
        params: &StreamParameters,
        dest: &Path,
    ) -> Result<Self, AudioError> {
        let process = Self::spawn(ffmpeg, decode_args(path, params, Some(dest)), Stdio::null())?;
        tracing::debug!(pid = ?process.id(), dest = %dest.display(), "extraction spawned");
        Ok(process)
    }

    fn spawn(ffmpeg: &Path, args: Vec<OsString>, stdout: Stdio) -> Result<Self, AudioError> {
        let program = ffmpeg.display().to_string();
        tracing::debug!(program = %program, ?args, "launching decoder");
        let child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| AudioError::Launch {
                program: program.clone(),
                source,
            })?;
        Ok(Self {
            child: Some(child),
            program,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit status if the process has finished, without blocking.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    /// Stop the process: graceful signal, bounded wait, then force kill.
    ///
    /// Idempotent; later calls report [`TerminateOutcome::AlreadyExited`].
    pub fn terminate(&mut self, timeout: Duration) -> TerminateOutcome {
        match self.child.take() {
            Some(mut child) => {
                let outcome = terminate_child(&mut child, timeout);
                tracing::debug!(program = %self.program, ?outcome, "decoder terminated");
                outcome
            }
            None => TerminateOutcome::AlreadyExited,
        }
    }
}

impl Drop for DecodeProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.terminate(DROP_TERMINATE_TIMEOUT);
        }
    }
}

/// Arguments for a quiet, non-interactive s16le decode of the first audio stream.
///
/// `dest = None` writes to stdout.
pub fn decode_args(path: &Path, params: &StreamParameters, dest: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-v".into(), "quiet".into(), "-nostdin".into()];
    if dest.is_some() {
        args.push("-y".into());
    }
    args.push("-i".into());
    args.push(path.as_os_str().to_owned());
    for arg in ["-vn", "-f", "s16le", "-acodec", "pcm_s16le"] {
        args.push(arg.into());
    }
    args.push("-ac".into());
    args.push(params.channels.to_string().into());
    args.push("-ar".into());
    args.push(params.sample_rate.to_string().into());
    match dest {
        Some(dest) => args.push(dest.as_os_str().to_owned()),
        None => args.push("-".into()),
    }
    args
}

fn terminate_child(child: &mut Child, timeout: Duration) -> TerminateOutcome {
    if let Ok(Some(_)) = child.try_wait() {
        return TerminateOutcome::AlreadyExited;
    }

    request_stop(child);

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return TerminateOutcome::Graceful,
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("decoder wait failed: {e}");
                break;
            }
        }
    }

    if let Err(e) = child.kill() {
        tracing::warn!("decoder kill failed: {e}");
    }
    let _ = child.wait();
    TerminateOutcome::Killed
}

#[cfg(unix)]
fn request_stop(child: &Child) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: the child has not been reaped yet, so `pid` still names our process.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(pid, "SIGTERM delivery failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) {}
