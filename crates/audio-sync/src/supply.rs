//! Demand-driven PCM supply for the output callback.
//!
//! A pump thread moves decoder output into a bounded [`PcmQueue`]; the output
//! callback asks a [`FrameSupply`] for N frames and always gets exactly
//! `N * channels * 2` bytes back, zero-filled where the decoder has not caught up
//! (or has finished). The callback never waits on the decoder.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crate::probe::{SAMPLE_BYTES, StreamParameters};
use crate::queue::PcmQueue;

/// Counters updated from the output callback.
#[derive(Debug, Default)]
pub struct SupplyStats {
    pulls: AtomicU64,
    frames: AtomicU64,
    padded_frames: AtomicU64,
    underrun_events: AtomicU64,
}

/// Point-in-time copy of [`SupplyStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupplySnapshot {
    pub pulls: u64,
    pub frames: u64,
    /// Frames (possibly fractional ones rounded up) filled with silence.
    pub padded_frames: u64,
    /// Pulls that needed any padding.
    pub underrun_events: u64,
}

impl SupplyStats {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> SupplySnapshot {
        SupplySnapshot {
            pulls: self.pulls.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            padded_frames: self.padded_frames.load(Ordering::Relaxed),
            underrun_events: self.underrun_events.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.pulls.store(0, Ordering::Relaxed);
        self.frames.store(0, Ordering::Relaxed);
        self.padded_frames.store(0, Ordering::Relaxed);
        self.underrun_events.store(0, Ordering::Relaxed);
    }
}

/// Pull adapter owned by the output callback.
///
/// Purely reactive: it never looks at the session's cancel flag.
pub struct FrameSupply {
    queue: Arc<PcmQueue>,
    frame_bytes: usize,
    buf: Vec<u8>,
    pulls: u64,
    diagnostics_every: u64,
    stats: Arc<SupplyStats>,
}

impl FrameSupply {
    pub fn new(
        queue: Arc<PcmQueue>,
        params: &StreamParameters,
        stats: Arc<SupplyStats>,
        diagnostics_every: u64,
    ) -> Self {
        Self {
            queue,
            frame_bytes: params.frame_bytes(),
            buf: Vec::new(),
            pulls: 0,
            diagnostics_every,
            stats,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Produce exactly `frames` frames of s16le audio.
    ///
    /// Whatever the queue holds is used; the rest is silence.
    pub fn pull(&mut self, frames: usize) -> &[u8] {
        let want = frames * self.frame_bytes;
        self.buf.resize(want, 0);

        let got = self.queue.pop_into(&mut self.buf);
        if got < want {
            self.buf[got..].fill(0);
            let missing = (want - got).div_ceil(self.frame_bytes) as u64;
            self.stats.padded_frames.fetch_add(missing, Ordering::Relaxed);
            self.stats.underrun_events.fetch_add(1, Ordering::Relaxed);
        }

        self.pulls += 1;
        self.stats.pulls.fetch_add(1, Ordering::Relaxed);
        self.stats.frames.fetch_add(frames as u64, Ordering::Relaxed);

        if self.diagnostics_every > 0 && self.pulls % self.diagnostics_every == 0 {
            if let Some((min, max)) = sample_range(&self.buf) {
                tracing::debug!(
                    pull = self.pulls,
                    requested_frames = frames,
                    read_bytes = got,
                    min,
                    max,
                    "sample range"
                );
            }
        }

        &self.buf
    }

    /// Fill an interleaved `i16` output buffer, as handed over by the device.
    pub fn fill_samples(&mut self, out: &mut [i16]) {
        let channels = self.frame_bytes / SAMPLE_BYTES;
        let frames = out.len() / channels.max(1);
        let bytes = self.pull(frames);
        for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(SAMPLE_BYTES)) {
            *dst = i16::from_le_bytes([src[0], src[1]]);
        }
        let filled = frames * channels;
        out[filled..].fill(0);
    }
}

/// Min and max of the s16le samples in `bytes`.
pub fn sample_range(bytes: &[u8]) -> Option<(i16, i16)> {
    bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .fold(None, |acc, s| match acc {
            None => Some((s, s)),
            Some((lo, hi)) => Some((lo.min(s), hi.max(s))),
        })
}

/// Copy `reader` into `queue` on a dedicated thread until EOF, error, or close.
///
/// The queue is closed when the pump ends, so the consumer drains and then pads.
pub fn spawn_pump<R>(
    mut reader: R,
    queue: Arc<PcmQueue>,
    chunk_bytes: usize,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    thread::Builder::new()
        .name("pcm-pump".to_string())
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                let mut chunk = vec![0u8; chunk_bytes.max(queue.frame_bytes())];
                let mut total: u64 = 0;
                loop {
                    match reader.read(&mut chunk) {
                        Ok(0) => {
                            tracing::debug!(total_bytes = total, "decoder output exhausted");
                            break;
                        }
                        Ok(n) => {
                            total += n as u64;
                            if !queue.push_blocking(&chunk[..n]) {
                                tracing::debug!(total_bytes = total, "pcm queue closed; pump stopping");
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::warn!("decoder read failed: {e}");
                            break;
                        }
                    }
                }
                queue.close();
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn params(channels: u16) -> StreamParameters {
        StreamParameters {
            channels,
            sample_rate: 44_100,
            has_audio: true,
            codec: None,
        }
    }

    fn supply_with(bytes: &[u8], close: bool, channels: u16) -> (FrameSupply, Arc<SupplyStats>) {
        let queue = Arc::new(PcmQueue::new(channels as usize * 2, 1 << 16));
        queue.push_blocking(bytes);
        if close {
            queue.close();
        }
        let stats = SupplyStats::shared();
        let supply = FrameSupply::new(queue, &params(channels), stats.clone(), 0);
        (supply, stats)
    }

    #[test]
    fn response_length_is_exact_for_any_request() {
        let (mut supply, _) = supply_with(&[7u8; 100], false, 2);
        for frames in [0usize, 1, 3, 64, 1024] {
            assert_eq!(supply.pull(frames).len(), frames * 4);
        }
    }

    #[test]
    fn shortfall_is_zero_padded() {
        let (mut supply, stats) = supply_with(&[1, 2, 3, 4, 5, 6, 7, 8], false, 2);
        let out = supply.pull(4).to_vec();
        assert_eq!(&out[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(out[8..].iter().all(|b| *b == 0));
        let snap = stats.snapshot();
        assert_eq!(snap.padded_frames, 2);
        assert_eq!(snap.underrun_events, 1);
        assert_eq!(snap.frames, 4);
    }

    #[test]
    fn exhausted_source_yields_silence() {
        let (mut supply, _) = supply_with(&[9u8; 6], true, 2);
        let first = supply.pull(2).to_vec();
        assert_eq!(&first[..6], &[9u8; 6]);
        assert_eq!(&first[6..], &[0, 0]);
        for _ in 0..5 {
            let next = supply.pull(256);
            assert_eq!(next.len(), 1024);
            assert!(next.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn partial_frames_stay_queued_while_producer_runs() {
        let (mut supply, _) = supply_with(&[1, 1, 1, 1, 2, 2], false, 2);
        let out = supply.pull(2).to_vec();
        assert_eq!(&out[..4], &[1, 1, 1, 1]);
        assert_eq!(&out[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn fill_samples_decodes_little_endian() {
        let mut bytes = Vec::new();
        for s in [1i16, -1, i16::MAX, i16::MIN] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let (mut supply, _) = supply_with(&bytes, true, 2);
        let mut out = [5i16; 6];
        supply.fill_samples(&mut out);
        assert_eq!(out, [1, -1, i16::MAX, i16::MIN, 0, 0]);
    }

    #[test]
    fn sample_range_reports_extremes() {
        let mut bytes = Vec::new();
        for s in [3i16, -200, 150, 0] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(sample_range(&bytes), Some((-200, 150)));
        assert_eq!(sample_range(&[]), None);
    }

    #[test]
    fn pump_copies_reader_and_closes_queue() {
        let queue = Arc::new(PcmQueue::new(4, 1 << 12));
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let handle = spawn_pump(Cursor::new(data.clone()), queue.clone(), 64).unwrap();
        handle.join().unwrap();
        assert!(queue.is_done());
        assert_eq!(queue.len_bytes(), 1000);
        assert_eq!(queue.peek(1000), data);
    }

    #[test]
    fn pump_stops_when_queue_closes() {
        let queue = Arc::new(PcmQueue::new(2, 8));
        let endless = std::io::repeat(1);
        let handle = spawn_pump(endless, queue.clone(), 4).unwrap();
        assert!(queue.wait_for_any(Duration::from_secs(1)));
        queue.close();
        handle.join().unwrap();
    }
}
