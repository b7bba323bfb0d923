//! Thread-safe sample ring buffer
//!
//! Fixed-capacity circular buffer of f32 samples shared between producer
//! and consumer threads. Writers without a timeout never block: when the
//! buffer is full the oldest samples are dropped so the stream stays
//! biased toward fresh data. Readers without a timeout get a short read.
//!
//! One mutex guards the ring state; two condition variables (`not_empty`,
//! `not_full`) wake blocked readers and timed writers.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;

/// How long after an overrun/underrun the buffer keeps reporting it.
const HEALTH_WINDOW: Duration = Duration::from_millis(100);

/// Ring buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer is closed")]
    Closed,
}

/// Buffer health as seen by the stats snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    Healthy,
    Overrun,
    Underrun,
    Error,
}

/// Point-in-time snapshot of a buffer's state and counters
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub size: usize,
    pub utilization: f64,
    pub status: BufferStatus,
    /// Write events that had to drop old data
    pub overruns: u64,
    /// Read events that found the buffer empty
    pub underruns: u64,
    /// Samples discarded by the drop-oldest policy
    pub dropped: u64,
    pub total_written: u64,
    pub total_read: u64,
    pub latency_samples: usize,
    pub latency_ms: f64,
}

struct Ring {
    data: Vec<f32>,
    read_pos: usize,
    write_pos: usize,
    size: usize,
    total_written: u64,
    total_read: u64,
    overruns: u64,
    underruns: u64,
    dropped: u64,
    last_overrun: Option<Instant>,
    last_underrun: Option<Instant>,
    closed: bool,
}

/// Fixed-capacity circular buffer of interleaved float samples.
pub struct RingBuffer {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    sample_rate: u32,
}

impl RingBuffer {
    /// Create a buffer holding `capacity` samples at the given rate.
    ///
    /// The sample rate is only used to express latency in milliseconds.
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        Self {
            ring: Mutex::new(Ring {
                data: vec![0.0; capacity.max(1)],
                read_pos: 0,
                write_pos: 0,
                size: 0,
                total_written: 0,
                total_read: 0,
                overruns: 0,
                underruns: 0,
                dropped: 0,
                last_overrun: None,
                last_underrun: None,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            sample_rate,
        }
    }

    /// Write samples with the drop-oldest overrun policy.
    ///
    /// Every input sample is accepted; when the buffer is full the oldest
    /// buffered samples are discarded to make room. Returns the accepted
    /// count (the input length). Discards are tracked separately in the
    /// `dropped` and `overruns` counters.
    pub fn write(&self, samples: &[f32]) -> Result<usize, BufferError> {
        let mut ring = self.ring.lock();
        if ring.closed {
            return Err(BufferError::Closed);
        }

        let mut dropped_now = 0u64;
        for &sample in samples {
            if ring.size == self.capacity {
                ring.read_pos = (ring.read_pos + 1) % self.capacity;
                ring.size -= 1;
                dropped_now += 1;
            }
            let pos = ring.write_pos;
            ring.data[pos] = sample;
            ring.write_pos = (pos + 1) % self.capacity;
            ring.size += 1;
        }

        ring.total_written += samples.len() as u64;
        if dropped_now > 0 {
            ring.overruns += 1;
            ring.dropped += dropped_now;
            ring.last_overrun = Some(Instant::now());
        }
        let wrote = !samples.is_empty();
        drop(ring);
        if wrote {
            self.not_empty.notify_all();
        }
        Ok(samples.len())
    }

    /// Write samples, blocking for free space up to `timeout`.
    ///
    /// Never drops buffered data. Returns the count actually retained,
    /// which may be short if the deadline expires first.
    pub fn write_timeout(&self, samples: &[f32], timeout: Duration) -> Result<usize, BufferError> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        let mut ring = self.ring.lock();
        loop {
            if ring.closed {
                return Err(BufferError::Closed);
            }
            while written < samples.len() && ring.size < self.capacity {
                let pos = ring.write_pos;
                ring.data[pos] = samples[written];
                ring.write_pos = (pos + 1) % self.capacity;
                ring.size += 1;
                ring.total_written += 1;
                written += 1;
            }
            if written > 0 {
                self.not_empty.notify_all();
            }
            if written == samples.len() {
                return Ok(written);
            }
            if self.not_full.wait_until(&mut ring, deadline).timed_out() {
                return Ok(written);
            }
        }
    }

    /// Read up to `count` samples in FIFO order without blocking.
    ///
    /// An empty buffer yields an empty vector and counts as an underrun.
    pub fn read(&self, count: usize) -> Vec<f32> {
        let mut ring = self.ring.lock();
        self.take(&mut ring, count, true)
    }

    /// Read up to `count` samples, blocking until at least one sample is
    /// available or the deadline expires.
    ///
    /// A deadline expiring on an empty buffer is not an underrun; the
    /// caller asked to wait and nothing arrived.
    pub fn read_timeout(&self, count: usize, timeout: Duration) -> Vec<f32> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        while ring.size == 0 && !ring.closed {
            if self.not_empty.wait_until(&mut ring, deadline).timed_out() {
                break;
            }
        }
        self.take(&mut ring, count, false)
    }

    fn take(&self, ring: &mut Ring, count: usize, count_underrun: bool) -> Vec<f32> {
        if ring.size == 0 {
            if count_underrun {
                ring.underruns += 1;
                ring.last_underrun = Some(Instant::now());
            }
            return Vec::new();
        }
        let n = count.min(ring.size);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(ring.data[ring.read_pos]);
            ring.read_pos = (ring.read_pos + 1) % self.capacity;
        }
        ring.size -= n;
        ring.total_read += n as u64;
        self.not_full.notify_all();
        out
    }

    /// Copy up to `count` samples without consuming them. Never blocks.
    pub fn peek(&self, count: usize) -> Vec<f32> {
        let ring = self.ring.lock();
        let n = count.min(ring.size);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(ring.data[(ring.read_pos + i) % self.capacity]);
        }
        out
    }

    /// Reset positions, size and health markers; counters survive.
    /// Wakes blocked producers.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.read_pos = 0;
        ring.write_pos = 0;
        ring.size = 0;
        ring.last_overrun = None;
        ring.last_underrun = None;
        drop(ring);
        self.not_full.notify_all();
    }

    /// Shut the buffer down. Subsequent writes fail with [`BufferError::Closed`];
    /// readers may drain what is left. Wakes all waiters.
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Number of samples currently buffered.
    pub fn len(&self) -> usize {
        self.ring.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Snapshot of state, counters and health.
    pub fn stats(&self) -> BufferStats {
        let ring = self.ring.lock();
        let now = Instant::now();
        let recent = |t: Option<Instant>| {
            t.map(|at| now.duration_since(at) <= HEALTH_WINDOW)
                .unwrap_or(false)
        };
        let status = if ring.closed {
            BufferStatus::Error
        } else if recent(ring.last_overrun) {
            BufferStatus::Overrun
        } else if recent(ring.last_underrun) {
            BufferStatus::Underrun
        } else {
            BufferStatus::Healthy
        };
        BufferStats {
            capacity: self.capacity,
            size: ring.size,
            utilization: ring.size as f64 / self.capacity as f64,
            status,
            overruns: ring.overruns,
            underruns: ring.underruns,
            dropped: ring.dropped,
            total_written: ring.total_written,
            total_read: ring.total_read,
            latency_samples: ring.size,
            latency_ms: ring.size as f64 * 1000.0 / self.sample_rate.max(1) as f64,
        }
    }
}

/// Buffer size holding `latency_ms` worth of interleaved audio.
pub fn size_for_latency(latency_ms: u64, sample_rate: u32, channels: u16) -> usize {
    let frames = (latency_ms as f64 / 1000.0 * sample_rate as f64).ceil() as usize;
    frames * channels.max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn overrun_drops_oldest_and_keeps_freshest() {
        let buf = RingBuffer::new(8, 44_100);
        let input: Vec<f32> = (1..=10).map(|i| i as f32).collect();
        assert_eq!(buf.write(&input).unwrap(), 10);
        let stats = buf.stats();
        assert_eq!(stats.size, 8);
        assert!(stats.overruns >= 1);
        assert_eq!(stats.dropped, 2);
        let got = buf.read(8);
        assert_eq!(got, vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn empty_read_is_short_and_counts_underrun() {
        let buf = RingBuffer::new(16, 44_100);
        assert!(buf.read(5).is_empty());
        assert_eq!(buf.stats().underruns, 1);
    }

    #[test]
    fn accounting_invariant_holds_across_overruns() {
        let buf = RingBuffer::new(4, 48_000);
        buf.write(&[1.0, 2.0, 3.0]).unwrap();
        buf.read(2);
        buf.write(&[4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
        buf.read(1);
        let s = buf.stats();
        assert_eq!(s.total_written, s.total_read + s.size as u64 + s.dropped);
        assert!(s.size <= s.capacity);
    }

    #[test]
    fn peek_is_non_destructive() {
        let buf = RingBuffer::new(8, 44_100);
        buf.write(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(buf.peek(2), vec![1.0, 2.0]);
        assert_eq!(buf.peek(10), vec![1.0, 2.0, 3.0]);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.read(3), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn clear_resets_state_and_health() {
        let buf = RingBuffer::new(4, 44_100);
        buf.write(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(buf.stats().status, BufferStatus::Overrun);
        buf.clear();
        let s = buf.stats();
        assert_eq!(s.size, 0);
        assert_eq!(s.status, BufferStatus::Healthy);
        // Counters survive a clear
        assert!(s.overruns >= 1);
    }

    #[test]
    fn health_recovers_after_window() {
        let buf = RingBuffer::new(2, 44_100);
        buf.write(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(buf.stats().status, BufferStatus::Overrun);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(buf.stats().status, BufferStatus::Healthy);
    }

    #[test]
    fn write_after_close_fails() {
        let buf = RingBuffer::new(8, 44_100);
        buf.write(&[1.0]).unwrap();
        buf.close();
        assert_eq!(buf.write(&[2.0]), Err(BufferError::Closed));
        // Remaining data can still be drained
        assert_eq!(buf.read(4), vec![1.0]);
    }

    #[test]
    fn timed_write_does_not_drop_and_returns_short_count() {
        let buf = RingBuffer::new(4, 44_100);
        buf.write(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let n = buf
            .write_timeout(&[5.0, 6.0], Duration::from_millis(30))
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(buf.read(4), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn timed_write_resumes_when_space_frees_up() {
        let buf = Arc::new(RingBuffer::new(4, 44_100));
        buf.write(&[1.0, 2.0, 3.0, 4.0]).unwrap();

        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                buf.write_timeout(&[5.0, 6.0], Duration::from_millis(500))
                    .unwrap()
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(buf.read(2), vec![1.0, 2.0]);
        assert_eq!(writer.join().unwrap(), 2);
        assert_eq!(buf.read(4), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn timed_read_wakes_on_write() {
        let buf = Arc::new(RingBuffer::new(8, 44_100));
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.read_timeout(4, Duration::from_millis(500)))
        };
        thread::sleep(Duration::from_millis(50));
        buf.write(&[7.0, 8.0]).unwrap();
        assert_eq!(reader.join().unwrap(), vec![7.0, 8.0]);
    }

    #[test]
    fn timed_read_returns_empty_at_deadline_without_underrun() {
        let buf = RingBuffer::new(8, 44_100);
        let start = Instant::now();
        assert!(buf.read_timeout(4, Duration::from_millis(40)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(buf.stats().underruns, 0);
    }

    #[test]
    fn latency_reflects_buffered_samples() {
        let capacity = size_for_latency(50, 48_000, 1);
        let buf = RingBuffer::new(capacity, 48_000);
        buf.write(&vec![0.0; capacity]).unwrap();
        let s = buf.stats();
        assert!(s.latency_ms <= 51.0);
        assert_eq!(s.latency_samples, capacity);
    }

    #[test]
    fn size_for_latency_rounds_up_and_scales_by_channels() {
        assert_eq!(size_for_latency(50, 44_100, 1), 2205);
        assert_eq!(size_for_latency(50, 44_100, 2), 4410);
        assert_eq!(size_for_latency(1, 48_000, 1), 48);
        // 1 ms at 22050 Hz is 22.05 frames, rounded up to 23
        assert_eq!(size_for_latency(1, 22_050, 1), 23);
    }
}
