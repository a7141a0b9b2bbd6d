//! Thread-safe bounded queue for raw s16le PCM bytes.
//!
//! The pump thread pushes decoder output here (blocking when full, which paces the
//! decoder); the output callback drains it without ever waiting. `close()` ends
//! the stream: pushes stop, pops drain what is left.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bounded byte queue carrying interleaved 16-bit PCM.
///
/// ## Design
/// - **Single producer / single consumer** in practice, but safe from any thread.
/// - **Bounded** by `max_bytes` to cap memory and producer lead.
/// - A `done` flag is stored *under the same mutex* as the queue to avoid races.
///
/// Non-blocking pops only hand out whole frames while the producer is alive, so a
/// short read never shifts sample alignment for the next pull.
pub struct PcmQueue {
    frame_bytes: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_bytes: usize,
    low_watermark_ms: AtomicU64,
}

struct QueueInner {
    bytes: VecDeque<u8>,
    done: bool,
}

/// Queue capacity in **bytes** for `seconds` of s16 audio.
///
/// Non-finite or non-positive `seconds` falls back to one second.
pub fn calc_max_buffered_bytes(rate_hz: u32, channels: u16, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        1.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames
        .saturating_mul(channels as usize)
        .saturating_mul(2)
        .max(2)
}

impl PcmQueue {
    /// `frame_bytes` is `channels * 2`; capacity is rounded up to a whole frame.
    pub fn new(frame_bytes: usize, max_bytes: usize) -> Self {
        let frame_bytes = frame_bytes.max(1);
        let max_bytes = max_bytes.max(frame_bytes).div_ceil(frame_bytes) * frame_bytes;
        Self {
            frame_bytes,
            inner: Mutex::new(QueueInner {
                bytes: VecDeque::with_capacity(max_bytes),
                done: false,
            }),
            cv: Condvar::new(),
            max_bytes,
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current buffered bytes (best-effort snapshot).
    pub fn len_bytes(&self) -> usize {
        self.lock().bytes.len()
    }

    /// Whether the producer has closed the queue. Buffered bytes may remain.
    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Closed and fully drained.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.done && g.bytes.is_empty()
    }

    /// Mark the queue as finished and wake all waiters.
    ///
    /// Blocked pushes return early and drop what they could not store. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Push bytes, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before everything was stored.
    pub fn push_blocking(&self, data: &[u8]) -> bool {
        let mut offset = 0;

        while offset < data.len() {
            let mut g = self.lock();

            while g.bytes.len() >= self.max_bytes && !g.done {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.done {
                return false;
            }

            let room = self.max_bytes - g.bytes.len();
            let take = room.min(data.len() - offset);
            g.bytes.extend(&data[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Copy up to `out.len()` bytes into `out` without waiting; returns the count.
    ///
    /// While the producer is alive only whole frames are taken. After `close()` the
    /// remaining tail (including a partial frame) is handed out as-is.
    pub fn pop_into(&self, out: &mut [u8]) -> usize {
        let mut g = self.lock();
        let available = g.bytes.len().min(out.len());
        let take = if g.done {
            available
        } else {
            available - available % self.frame_bytes
        };
        if take == 0 {
            return 0;
        }

        for (dst, src) in out[..take].iter_mut().zip(g.bytes.drain(..take)) {
            *dst = src;
        }
        let queued = g.bytes.len();
        let done = g.done;
        drop(g);
        self.cv.notify_all();
        if !done {
            self.log_low_watermark(queued);
        }
        take
    }

    /// Copy of the first `n` buffered bytes without consuming them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        let g = self.lock();
        g.bytes.iter().take(n).copied().collect()
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_bytes / 8).max(self.frame_bytes * 16);
        if queued > 0 && queued < threshold {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_millis(0))
                .as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::info!(
                    queued_bytes = queued,
                    threshold_bytes = threshold,
                    "pcm queue low watermark"
                );
            }
        }
    }

    /// Wait briefly for any buffered bytes to appear.
    ///
    /// Returns `true` if data is available before `timeout` elapses.
    pub fn wait_for_any(&self, timeout: Duration) -> bool {
        let g = self.lock();
        let (g, _timeout) = self
            .cv
            .wait_timeout_while(g, timeout, |inner| inner.bytes.is_empty() && !inner.done)
            .unwrap_or_else(PoisonError::into_inner);
        !g.bytes.is_empty()
    }

    /// Block up to `timeout` for the queue to become closed and empty.
    ///
    /// Returns `true` once drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let g = self.lock();
        let (g, _timeout) = self
            .cv
            .wait_timeout_while(g, timeout, |inner| !(inner.done && inner.bytes.is_empty()))
            .unwrap_or_else(PoisonError::into_inner);
        g.done && g.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn calc_max_buffered_bytes_fallbacks() {
        assert_eq!(calc_max_buffered_bytes(44_100, 2, 1.0), 176_400);
        assert_eq!(calc_max_buffered_bytes(44_100, 2, -1.0), 176_400);
        assert_eq!(calc_max_buffered_bytes(44_100, 2, f32::NAN), 176_400);
        assert_eq!(calc_max_buffered_bytes(48_000, 1, 0.5), 48_000);
    }

    #[test]
    fn capacity_rounds_to_whole_frames() {
        let q = PcmQueue::new(4, 10);
        assert_eq!(q.max_bytes(), 12);
    }

    #[test]
    fn pop_empty_returns_zero() {
        let q = PcmQueue::new(4, 64);
        let mut out = [0u8; 8];
        assert_eq!(q.pop_into(&mut out), 0);
    }

    #[test]
    fn pop_takes_whole_frames_while_open() {
        let q = PcmQueue::new(4, 64);
        assert!(q.push_blocking(&[1, 2, 3, 4, 5, 6]));
        let mut out = [0u8; 8];
        assert_eq!(q.pop_into(&mut out), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(q.len_bytes(), 2);
    }

    #[test]
    fn pop_drains_partial_tail_after_close() {
        let q = PcmQueue::new(4, 64);
        q.push_blocking(&[9, 8, 7]);
        q.close();
        let mut out = [0u8; 8];
        assert_eq!(q.pop_into(&mut out), 3);
        assert!(q.is_drained());
    }

    #[test]
    fn push_blocks_until_consumer_makes_room() {
        let q = Arc::new(PcmQueue::new(2, 4));
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push_blocking(&[1, 1, 2, 2, 3, 3]))
        };

        let mut seen = Vec::new();
        let mut out = [0u8; 2];
        while seen.len() < 6 {
            let n = q.pop_into(&mut out);
            seen.extend_from_slice(&out[..n]);
            if n == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert!(producer.join().unwrap());
        assert_eq!(seen, vec![1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn close_releases_blocked_push() {
        let q = Arc::new(PcmQueue::new(2, 2));
        q.push_blocking(&[0, 0]);
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push_blocking(&[1, 1]))
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn wait_for_any_returns_true_when_data_arrives() {
        let q = Arc::new(PcmQueue::new(2, 64));
        let q_push = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            q_push.push_blocking(&[1, 2]);
        });
        assert!(q.wait_for_any(Duration::from_secs(1)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_any_returns_false_on_timeout() {
        let q = PcmQueue::new(2, 64);
        assert!(!q.wait_for_any(Duration::from_millis(10)));
    }

    #[test]
    fn wait_drained_tracks_close_and_empty() {
        let q = PcmQueue::new(2, 64);
        q.push_blocking(&[1, 2]);
        q.close();
        assert!(!q.wait_drained(Duration::from_millis(5)));
        let mut out = [0u8; 2];
        q.pop_into(&mut out);
        assert!(q.wait_drained(Duration::from_millis(5)));
    }

    #[test]
    fn peek_does_not_consume() {
        let q = PcmQueue::new(2, 64);
        q.push_blocking(&[5, 6, 7, 8]);
        assert_eq!(q.peek(3), vec![5, 6, 7]);
        assert_eq!(q.len_bytes(), 4);
    }
}
