//! Playback session lifecycle.
//!
//! The output route is detected when the session is constructed. `start()`
//! returns immediately; a background worker probes the file, launches the
//! decoder, fills the PCM queue and binds the output device. Nothing it does can fail the caller: every error is logged with its
//! [`ErrorKind`](crate::error::ErrorKind) and the worker winds down to [`SessionState::Idle`].
//!
//! Releasable resources (decoder process, pump thread, queue, extraction file) live
//! behind one mutex per run and are taken out before release, so the worker's own
//! teardown and `stop()` never release the same thing twice. The output device is
//! owned by the worker thread itself and closed there.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tempfile::TempPath;

use crate::backend;
use crate::config::{SessionConfig, SourceMode};
use crate::device::{AudioOutput, default_output};
use crate::error::AudioError;
use crate::probe::{self, StreamParameters};
use crate::process::DecodeProcess;
use crate::queue::{PcmQueue, calc_max_buffered_bytes};
use crate::status::{EndReason, SessionState, SessionStatus};
use crate::supply::{FrameSupply, SupplySnapshot, SupplyStats, spawn_pump};

/// Number of leading bytes inspected by the post-launch test read.
const TEST_READ_BYTES: usize = 20;

/// Audio playback tied to one video file.
pub struct PlaybackSession {
    path: PathBuf,
    config: SessionConfig,
    output: Option<Arc<dyn AudioOutput>>,
    shared: Arc<SessionShared>,
    worker: Mutex<Option<Worker>>,
}

struct SessionShared {
    status: Mutex<SessionStatus>,
    stats: Arc<SupplyStats>,
    /// Id of the current run. Status writes from older runs are ignored.
    generation: AtomicU64,
}

impl SessionShared {
    fn status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Worker {
    run: Arc<Run>,
    handle: JoinHandle<()>,
    /// Disconnects when the worker thread exits.
    done: Receiver<()>,
}

/// State of one `start()`..`stop()` cycle.
struct Run {
    id: u64,
    cancel: AtomicBool,
    resources: Mutex<Resources>,
    /// Held for the whole of a teardown, so a second caller returns only once
    /// the first has finished releasing.
    releasing: Mutex<()>,
    terminate_timeout: Duration,
    shared: Arc<SessionShared>,
}

#[derive(Default)]
struct Resources {
    process: Option<DecodeProcess>,
    pump: Option<JoinHandle<()>>,
    queue: Option<Arc<PcmQueue>>,
    temp_path: Option<TempPath>,
}

impl PlaybackSession {
    /// Session on the platform output (none when built without `cpal-output`).
    ///
    /// Like [`PlaybackSession::with_output`], detects the output route on the
    /// calling thread.
    pub fn new(path: impl Into<PathBuf>, config: SessionConfig) -> Self {
        let output = default_output(&config.backend);
        Self::with_output(path, config, output)
    }

    pub fn with_output(
        path: impl Into<PathBuf>,
        config: SessionConfig,
        output: Option<Arc<dyn AudioOutput>>,
    ) -> Self {
        backend::detect_cached(&config.backend);
        Self {
            path: path.into(),
            config,
            output,
            shared: Arc::new(SessionShared {
                status: Mutex::new(SessionStatus::default()),
                stats: SupplyStats::shared(),
                generation: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin playback in the background.
    ///
    /// Returns `false` when there is no output subsystem, the worker thread cannot
    /// be spawned, or a stopped run has not finished closing its device yet. A
    /// session that is already running returns `true`.
    pub fn start(&self) -> bool {
        let Some(output) = self.output.clone() else {
            let err = AudioError::SubsystemUnavailable;
            tracing::warn!(kind = ?err.kind(), "{err}");
            return false;
        };

        let mut slot = self.worker_slot();
        if let Some(worker) = slot.as_ref() {
            if !worker.handle.is_finished() {
                if worker.run.cancelled() {
                    tracing::warn!("previous audio session still shutting down");
                    return false;
                }
                tracing::debug!("audio session already running");
                return true;
            }
        }
        if let Some(previous) = slot.take() {
            let _ = previous.handle.join();
            previous.run.cleanup();
        }

        let id = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut status = self.shared.status();
            status.reset_run();
            status.state = SessionState::Idle;
        }
        self.shared.stats.reset();

        let run = Arc::new(Run {
            id,
            cancel: AtomicBool::new(false),
            resources: Mutex::new(Resources::default()),
            releasing: Mutex::new(()),
            terminate_timeout: self.config.terminate_timeout(),
            shared: self.shared.clone(),
        });

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let worker_run = run.clone();
        let path = self.path.clone();
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name("audio-session".to_string())
            .spawn(move || {
                let _done = done_tx;
                tracing::dispatcher::with_default(&dispatch, || {
                    run_session(&worker_run, &path, &config, &*output);
                });
            });

        match spawned {
            Ok(handle) => {
                tracing::info!(path = %self.path.display(), run = id, "audio session started");
                *slot = Some(Worker {
                    run,
                    handle,
                    done: done_rx,
                });
                true
            }
            Err(e) => {
                tracing::error!("failed to spawn audio session thread: {e}");
                false
            }
        }
    }

    /// Stop playback and release everything. No-op when nothing is running.
    ///
    /// Waits at most the join timeout for the worker; on timeout the worker is
    /// left to close its device on its own while the decoder is still killed here.
    /// A later `stop()` waits for such a worker again.
    pub fn stop(&self) {
        let Some(worker) = self.worker_slot().take() else {
            tracing::debug!("stop: no audio session");
            return;
        };

        worker.run.cancel.store(true, Ordering::SeqCst);
        worker.run.set_state(SessionState::Stopping);

        let exited = match worker.done.recv_timeout(self.config.join_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = self.config.join_timeout_ms,
                    "audio session thread did not exit in time; detaching"
                );
                false
            }
        };

        worker.run.cleanup();
        worker.run.update(|s| s.finish(EndReason::Stopped));
        worker.run.set_state(SessionState::Idle);
        tracing::info!(run = worker.run.id, "audio session stopped");

        if exited {
            if worker.handle.join().is_err() {
                tracing::error!("audio session thread panicked");
            }
        } else {
            // Still owns its device; kept so a new run cannot open a second one.
            *self.worker_slot() = Some(worker);
        }
    }

    /// Cancel the current run and release its decoder, pump, queue and
    /// extraction file.
    ///
    /// Idempotent, and safe whether or not those were ever acquired. The worker
    /// sees the cancel flag, closes the output device and winds down to `Idle`.
    pub fn cleanup(&self) {
        let run = self.worker_slot().as_ref().map(|w| w.run.clone());
        if let Some(run) = run {
            run.cancel.store(true, Ordering::SeqCst);
            run.cleanup();
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.status().state
    }

    /// Parameters of the most recent probe, once it has run.
    pub fn params(&self) -> Option<StreamParameters> {
        self.shared.status().params.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status().clone()
    }

    pub fn stats(&self) -> SupplySnapshot {
        self.shared.stats.snapshot()
    }

    /// Whether the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker_slot()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Run {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn update(&self, f: impl FnOnce(&mut SessionStatus)) {
        if self.shared.generation.load(Ordering::SeqCst) != self.id {
            return;
        }
        f(&mut self.shared.status());
    }

    fn set_state(&self, state: SessionState) {
        self.update(|s| {
            if s.state != state {
                tracing::debug!(from = %s.state, to = %state, "session state");
                s.state = state;
            }
        });
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a resource for cleanup; returns `false` if the run was cancelled meanwhile.
    fn register(&self, f: impl FnOnce(&mut Resources)) -> bool {
        f(&mut self.resources());
        !self.cancelled()
    }

    fn cleanup(&self) {
        let _releasing = self.releasing.lock().unwrap_or_else(PoisonError::into_inner);
        let (process, pump, queue, temp_path) = {
            let mut r = self.resources();
            (r.process.take(), r.pump.take(), r.queue.take(), r.temp_path.take())
        };

        // Closing first unblocks a pump stuck on a full queue.
        if let Some(queue) = queue {
            queue.close();
        }
        if let Some(mut process) = process {
            let outcome = process.terminate(self.terminate_timeout);
            tracing::info!(program = process.program(), ?outcome, "decoder released");
        }
        if let Some(pump) = pump {
            if pump.join().is_err() {
                tracing::error!("pcm pump thread panicked");
            }
        }
        if let Some(temp_path) = temp_path {
            let shown = temp_path.display().to_string();
            if let Err(e) = temp_path.close() {
                tracing::warn!(path = %shown, "failed to remove extraction file: {e}");
            }
        }
        self.update(|s| s.decoder_pid = None);
    }
}

fn run_session(run: &Run, path: &Path, config: &SessionConfig, output: &dyn AudioOutput) {
    let reason = match play(run, path, config, output) {
        Ok(reason) => reason,
        Err(AudioError::NoAudioStream) => {
            tracing::info!(path = %path.display(), "no audio stream detected");
            EndReason::NoAudio
        }
        Err(err) => {
            let kind = err.kind();
            tracing::error!(?kind, path = %path.display(), "audio playback failed: {err}");
            EndReason::Failed(kind)
        }
    };
    run.cleanup();
    run.update(|s| {
        s.device = None;
        s.finish(reason);
    });
    run.set_state(SessionState::Idle);
}

fn play(
    run: &Run,
    path: &Path,
    config: &SessionConfig,
    output: &dyn AudioOutput,
) -> Result<EndReason, AudioError> {
    if run.cancelled() {
        return Ok(EndReason::Stopped);
    }

    run.set_state(SessionState::Probing);
    let params = probe::probe(&config.ffprobe, path);
    run.update(|s| s.params = Some(params.clone()));
    if !params.has_audio {
        run.set_state(SessionState::Skipped);
        return Err(AudioError::NoAudioStream);
    }
    if run.cancelled() {
        return Ok(EndReason::Stopped);
    }

    run.set_state(SessionState::Launching);
    let capacity = calc_max_buffered_bytes(params.sample_rate, params.channels, config.buffer_seconds);
    let queue = Arc::new(PcmQueue::new(params.frame_bytes(), capacity));
    run.register(|r| r.queue = Some(queue.clone()));

    let pump = match config.mode {
        SourceMode::Stream => {
            let (process, stdout) = DecodeProcess::launch(&config.ffmpeg, path, &params)?;
            let pid = process.id();
            if !run.register(|r| r.process = Some(process)) {
                return Ok(EndReason::Stopped);
            }
            run.update(|s| s.decoder_pid = pid);
            tracing::info!(pid = ?pid, "decoder launched");
            spawn_pump(stdout, queue.clone(), config.pump_chunk_bytes)
        }
        SourceMode::Extract => {
            let Some(file) = extract(run, path, config, &params)? else {
                return Ok(EndReason::Stopped);
            };
            spawn_pump(file, queue.clone(), config.pump_chunk_bytes)
        }
    }
    .map_err(|source| AudioError::Launch {
        program: "pcm-pump".to_string(),
        source,
    })?;
    if !run.register(|r| r.pump = Some(pump)) {
        return Ok(EndReason::Stopped);
    }

    test_read(&queue, config.test_read_timeout());
    if run.cancelled() {
        return Ok(EndReason::Stopped);
    }

    let mut device = output.open(&params)?;
    let name = device.name();
    let supply = FrameSupply::new(
        queue.clone(),
        &params,
        run.shared.stats.clone(),
        config.diagnostics_every,
    );
    device.bind(supply)?;
    run.update(|s| s.device = Some(name.clone()));
    run.set_state(SessionState::Streaming);
    tracing::info!(
        device = %name,
        channels = params.channels,
        rate_hz = params.sample_rate,
        "audio playback started"
    );

    let poll = config.poll_interval();
    let mut drained_logged = false;
    let outcome = loop {
        if run.cancelled() {
            break Ok(EndReason::Stopped);
        }
        if let Some(err) = device.take_error() {
            break Err(err);
        }
        if queue.wait_drained(poll) {
            if config.release_on_eof {
                tracing::info!("decoder output drained; releasing device");
                break Ok(EndReason::Exhausted);
            }
            if !drained_logged {
                tracing::info!("decoder output drained; playing silence");
                drained_logged = true;
            }
            thread::sleep(poll);
        }
    };

    device.close();
    tracing::info!(device = %name, "audio playback stopped");
    outcome
}

/// Decode the whole track into a temporary file and open it for reading.
///
/// `Ok(None)` means the run was cancelled before the file was complete.
fn extract(
    run: &Run,
    path: &Path,
    config: &SessionConfig,
    params: &StreamParameters,
) -> Result<Option<File>, AudioError> {
    let temp_path = tempfile::Builder::new()
        .prefix("audio-sync-")
        .suffix(".pcm")
        .tempfile()
        .map_err(AudioError::ExtractionFile)?
        .into_temp_path();
    let dest = temp_path.to_path_buf();
    run.register(|r| r.temp_path = Some(temp_path));

    let process = DecodeProcess::extract(&config.ffmpeg, path, params, &dest)?;
    let program = process.program().to_string();
    let pid = process.id();
    if !run.register(|r| r.process = Some(process)) {
        return Ok(None);
    }
    run.update(|s| s.decoder_pid = pid);
    tracing::info!(pid = ?pid, dest = %dest.display(), "extracting audio");

    let poll = config.poll_interval();
    loop {
        if run.cancelled() {
            return Ok(None);
        }
        let status = match run.resources().process.as_mut() {
            Some(process) => process.try_exit_status(),
            None => return Ok(None),
        };
        match status {
            Some(status) if status.success() => break,
            Some(status) => return Err(AudioError::Extraction { program, status }),
            None => thread::sleep(poll),
        }
    }

    let file = File::open(&dest).map_err(AudioError::ExtractionFile)?;
    let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
    tracing::info!(bytes, "audio extracted");
    run.update(|s| s.decoder_pid = None);
    Ok(Some(file))
}

/// Wait briefly for the first decoded bytes and report what they look like.
fn test_read(queue: &PcmQueue, timeout: Duration) {
    if queue.wait_for_any(timeout) {
        let head = queue.peek(TEST_READ_BYTES);
        if head.iter().all(|b| *b == 0) {
            tracing::debug!(bytes = head.len(), "decoder output starts with silence");
        } else {
            tracing::debug!(bytes = head.len(), "decoder output flowing");
        }
    } else if queue.is_done() {
        tracing::warn!("decoder produced no output");
    } else {
        tracing::debug!(
            timeout_ms = timeout.as_millis() as u64,
            "no decoder output yet; starting anyway"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PacedSink;

    fn quiet_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.backend.enabled = false;
        config.ffprobe = PathBuf::from("/nonexistent/ffprobe");
        config.ffmpeg = PathBuf::from("/nonexistent/ffmpeg");
        config
    }

    #[test]
    fn stop_before_start_is_noop() {
        let session = PlaybackSession::with_output(
            "movie.mp4",
            quiet_config(),
            Some(Arc::new(PacedSink::new(64))),
        );
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_running());
    }

    #[test]
    fn start_without_output_fails() {
        let session = PlaybackSession::with_output("movie.mp4", quiet_config(), None);
        assert!(!session.start());
        assert!(!session.is_running());
    }

    #[test]
    fn failed_probe_ends_as_no_audio() {
        let sink = PacedSink::new(64);
        let probe = sink.probe();
        let session =
            PlaybackSession::with_output("movie.mp4", quiet_config(), Some(Arc::new(sink)));
        assert!(session.start());
        for _ in 0..200 {
            if !session.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!session.is_running());
        let status = session.status();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.end_reason, Some(EndReason::NoAudio));
        assert_eq!(status.params.map(|p| p.has_audio), Some(false));
        assert_eq!(probe.opened.load(Ordering::Relaxed), 0);
        session.stop();
    }

    #[test]
    fn construction_detects_output_route() {
        let _session = PlaybackSession::with_output("movie.mp4", quiet_config(), None);
        assert!(backend::cached().is_some());
    }

    #[test]
    fn cleanup_without_resources_is_safe() {
        let session = PlaybackSession::with_output("movie.mp4", quiet_config(), None);
        session.cleanup();
        session.cleanup();
    }
}
