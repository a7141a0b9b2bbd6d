//! Output device binding.
//!
//! An [`AudioOutput`] opens an [`OutputDevice`] for a given [`StreamParameters`];
//! binding a [`FrameSupply`] starts playback and `close()` releases the device.
//! The device format is always interleaved `i16` at exactly the probed channel
//! count and rate, matching what the decoder was launched with.
//!
//! Devices are not `Send` (CPAL streams are pinned to their creating thread), so
//! they live and die on the session worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::AudioError;
use crate::probe::StreamParameters;
use crate::supply::{FrameSupply, sample_range};

/// Factory for output devices.
pub trait AudioOutput: Send + Sync {
    fn open(&self, params: &StreamParameters) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// An opened output device.
pub trait OutputDevice {
    /// Human-readable device name for logs.
    fn name(&self) -> String;

    /// Start pulling frames from `supply`.
    fn bind(&mut self, supply: FrameSupply) -> Result<(), AudioError>;

    /// Asynchronous failure reported by the device since `bind`, if any.
    fn take_error(&mut self) -> Option<AudioError> {
        None
    }

    /// Stop playback and release the device. Idempotent.
    fn close(&mut self);
}

/// The platform output, when this build has one.
///
/// The device is chosen through the route variable named in `backend`.
pub fn default_output(backend: &BackendConfig) -> Option<Arc<dyn AudioOutput>> {
    #[cfg(feature = "cpal-output")]
    {
        Some(Arc::new(cpal_output::CpalOutput {
            device: None,
            env_var: backend.env_var.clone(),
        }))
    }
    #[cfg(not(feature = "cpal-output"))]
    {
        let _ = backend;
        None
    }
}

#[cfg(feature = "cpal-output")]
pub use cpal_output::{CpalOutput, list_devices};

#[cfg(feature = "cpal-output")]
mod cpal_output {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    use super::{AudioOutput, OutputDevice, matches_device_name};
    use crate::config::BackendConfig;
    use crate::error::AudioError;
    use crate::probe::StreamParameters;
    use crate::supply::FrameSupply;

    /// CPAL-backed output.
    ///
    /// Device selection: explicit `device` substring, else the route published in
    /// `env_var` by backend detection, else the host default.
    #[derive(Clone, Debug)]
    pub struct CpalOutput {
        pub device: Option<String>,
        pub env_var: String,
    }

    impl Default for CpalOutput {
        fn default() -> Self {
            Self {
                device: None,
                env_var: BackendConfig::default().env_var,
            }
        }
    }

    impl CpalOutput {
        pub fn with_device(device: Option<String>) -> Self {
            Self {
                device,
                ..Self::default()
            }
        }

        fn preferred_name(&self) -> Option<String> {
            self.device
                .clone()
                .or_else(|| std::env::var(&self.env_var).ok())
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
        }
    }

    impl AudioOutput for CpalOutput {
        fn open(&self, params: &StreamParameters) -> Result<Box<dyn OutputDevice>, AudioError> {
            let host = cpal::default_host();
            let device = pick_device(&host, self.preferred_name().as_deref())?;
            let name = device
                .description()
                .map(|d| d.to_string())
                .unwrap_or_else(|_| "unknown".to_string());

            if !supports_i16(&device, params) {
                tracing::warn!(
                    device = %name,
                    channels = params.channels,
                    rate_hz = params.sample_rate,
                    "device does not advertise a matching i16 config; trying anyway"
                );
            }

            let config = cpal::StreamConfig {
                channels: params.channels,
                sample_rate: params.sample_rate,
                buffer_size: cpal::BufferSize::Default,
            };
            tracing::info!(
                device = %name,
                channels = params.channels,
                rate_hz = params.sample_rate,
                "output device opened"
            );
            Ok(Box::new(CpalDevice {
                device,
                config,
                name,
                stream: None,
                failure: Arc::new(Mutex::new(None)),
                failed: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    struct CpalDevice {
        device: cpal::Device,
        config: cpal::StreamConfig,
        name: String,
        stream: Option<cpal::Stream>,
        failure: Arc<Mutex<Option<String>>>,
        failed: Arc<AtomicBool>,
    }

    impl OutputDevice for CpalDevice {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn bind(&mut self, mut supply: FrameSupply) -> Result<(), AudioError> {
            let failure = self.failure.clone();
            let failed = self.failed.clone();
            let err_fn = move |err: cpal::StreamError| {
                tracing::warn!("stream error: {err}");
                if let Ok(mut slot) = failure.lock() {
                    slot.get_or_insert_with(|| err.to_string());
                }
                failed.store(true, Ordering::Relaxed);
            };

            let stream = self
                .device
                .build_output_stream(
                    &self.config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        supply.fill_samples(data);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::DeviceOpen {
                    device: self.name.clone(),
                    message: e.to_string(),
                })?;
            stream.play().map_err(|e| AudioError::DeviceOpen {
                device: self.name.clone(),
                message: e.to_string(),
            })?;
            self.stream = Some(stream);
            Ok(())
        }

        fn take_error(&mut self) -> Option<AudioError> {
            if !self.failed.swap(false, Ordering::Relaxed) {
                return None;
            }
            let message = self
                .failure
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .unwrap_or_else(|| "unknown stream error".to_string());
            Some(AudioError::RuntimeStream(message))
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.pause();
                drop(stream);
                tracing::debug!(device = %self.name, "output stream closed");
            }
        }
    }

    impl Drop for CpalDevice {
        fn drop(&mut self) {
            self.close();
        }
    }

    /// Pick the first output device matching `needle` (case-insensitive), or the default device.
    ///
    /// An unmatched needle falls back to the default device with a warning.
    pub(super) fn pick_device(
        host: &cpal::Host,
        needle: Option<&str>,
    ) -> Result<cpal::Device, AudioError> {
        if let Some(needle) = needle {
            let found = host.output_devices().ok().and_then(|mut devices| {
                devices.find(|d| {
                    d.description()
                        .ok()
                        .map(|n| matches_device_name(&n.name(), needle))
                        .unwrap_or(false)
                })
            });
            if let Some(d) = found {
                return Ok(d);
            }
            tracing::warn!(needle, "no output device matched; using default");
        }

        host.default_output_device().ok_or(AudioError::NoDevice)
    }

    fn supports_i16(device: &cpal::Device, params: &StreamParameters) -> bool {
        match device.supported_output_configs() {
            Ok(ranges) => ranges.into_iter().any(|r| {
                r.sample_format() == cpal::SampleFormat::I16
                    && r.channels() == params.channels
                    && r.min_sample_rate() <= params.sample_rate
                    && params.sample_rate <= r.max_sample_rate()
            }),
            Err(_) => false,
        }
    }

    /// Names of the output devices on the current host.
    pub fn list_devices() -> anyhow::Result<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for d in host.output_devices()? {
            names.push(d.description()?.to_string());
        }
        Ok(names)
    }
}

/// Silent output that pulls at real-time pace from its own thread.
///
/// Useful for hosts without a sound card and for exercising sessions headlessly.
#[derive(Clone, Debug)]
pub struct PacedSink {
    frames_per_pull: usize,
    probe: Arc<SinkProbe>,
}

/// Observations shared by a [`PacedSink`] and its devices.
#[derive(Debug, Default)]
pub struct SinkProbe {
    pub opened: AtomicU64,
    pub closed: AtomicU64,
    pub pulls: AtomicU64,
    /// Pulls whose response was entirely zero.
    pub silent_pulls: AtomicU64,
    /// Pulls whose response length differed from `frames * channels * 2`.
    pub wrong_length_pulls: AtomicU64,
    pub active: AtomicBool,
}

impl PacedSink {
    pub fn new(frames_per_pull: usize) -> Self {
        Self {
            frames_per_pull: frames_per_pull.max(1),
            probe: Arc::new(SinkProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<SinkProbe> {
        self.probe.clone()
    }
}

impl AudioOutput for PacedSink {
    fn open(&self, params: &StreamParameters) -> Result<Box<dyn OutputDevice>, AudioError> {
        let period = Duration::from_secs_f64(self.frames_per_pull as f64 / params.sample_rate.max(1) as f64);
        self.probe.opened.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            channels = params.channels,
            rate_hz = params.sample_rate,
            "paced sink opened"
        );
        Ok(Box::new(PacedDevice {
            frames_per_pull: self.frames_per_pull,
            expected_len: params.bytes_for_frames(self.frames_per_pull),
            period,
            probe: self.probe.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            closed: false,
        }))
    }
}

struct PacedDevice {
    frames_per_pull: usize,
    expected_len: usize,
    period: Duration,
    probe: Arc<SinkProbe>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

impl OutputDevice for PacedDevice {
    fn name(&self) -> String {
        "paced-sink".to_string()
    }

    fn bind(&mut self, mut supply: FrameSupply) -> Result<(), AudioError> {
        let frames = self.frames_per_pull;
        let expected_len = self.expected_len;
        let period = self.period;
        let probe = self.probe.clone();
        let stop = self.stop.clone();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        let worker = thread::Builder::new()
            .name("paced-sink".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    probe.active.store(true, Ordering::Relaxed);
                    while !stop.load(Ordering::Relaxed) {
                        let chunk = supply.pull(frames);
                        if chunk.len() != expected_len {
                            probe.wrong_length_pulls.fetch_add(1, Ordering::Relaxed);
                        }
                        if sample_range(chunk).is_none_or(|(lo, hi)| lo == 0 && hi == 0) {
                            probe.silent_pulls.fetch_add(1, Ordering::Relaxed);
                        }
                        probe.pulls.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(period);
                    }
                    probe.active.store(false, Ordering::Relaxed);
                })
            })
            .map_err(|e| AudioError::DeviceOpen {
                device: self.name(),
                message: e.to_string(),
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.probe.closed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("paced sink closed");
    }
}

impl Drop for PacedDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
