//! Bounded ring buffer between the player and the output driver (spec §4.2,
//! component C2).
//!
//! Plain `Mutex`/`Condvar`, not tokio: this buffer is shared between the
//! player's decode thread and the driver's playback thread, both of which
//! are expected to block on it, which is exactly what `out_buf.c`'s
//! `pthread_cond_wait` pairing does.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::util::RingByteBuffer;

struct Inner {
    ring: RingByteBuffer,
    /// Wall-clock time (seconds) the ring's contents started at — set by
    /// `time_set` on seek/track-start (spec §3: `time_origin`).
    time_origin: f64,
    /// Bytes drained to the device since `time_origin` was last set (spec
    /// §3: `samples_since_origin`, here tracked in bytes since conversion
    /// already fixed the sample format by the time bytes reach this ring).
    bytes_drained: u64,
    /// Bytes/second of whatever's currently in the ring, so `time_get` can
    /// convert `bytes_drained` into seconds (spec §3's
    /// `bytes_per_second(current_params)`). Zero means "unknown": report
    /// just `time_origin`.
    bytes_per_second: usize,
    stopped: bool,
    paused: bool,
    /// Called once under the lock whenever bytes are consumed, so the
    /// player can refill opportunistically (spec §4.2 "free callback").
    free_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

pub struct OutputBuffer {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: RingByteBuffer::new(capacity),
                time_origin: 0.0,
                bytes_drained: 0,
                bytes_per_second: 0,
                stopped: false,
                paused: false,
                free_callback: None,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn set_free_callback(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.inner.lock().unwrap().free_callback = Some(callback);
    }

    /// Blocks until there's room for all of `data`, then appends it.
    /// Returns `false` if the buffer was stopped while waiting.
    pub fn put(&self, data: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut offset = 0;
        while offset < data.len() {
            if inner.stopped {
                return false;
            }
            let free = inner.ring.free();
            if free == 0 {
                inner = self.not_full.wait(inner).unwrap();
                continue;
            }
            let take = free.min(data.len() - offset);
            inner.ring.push(&data[offset..offset + take]);
            offset += take;
            self.not_empty.notify_all();
        }
        true
    }

    /// Pops up to `count` bytes for the driver to play, or blocks (with a
    /// timeout so the driver can still poll `stopped`) until some are
    /// available.
    pub fn get(&self, count: usize, timeout: Duration) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        while inner.ring.is_empty() && !inner.stopped && !inner.paused {
            let (guard, result) = self.not_empty.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() {
                break;
            }
        }
        if inner.stopped || inner.paused {
            return Vec::new();
        }
        let popped = inner.ring.pop(count);
        inner.bytes_drained += popped.len() as u64;
        if let Some(callback) = inner.free_callback.clone() {
            drop(inner);
            callback();
        } else {
            drop(inner);
        }
        self.not_full.notify_all();
        popped
    }

    /// Wall-clock playback position: `time_origin` plus however many
    /// seconds of audio have been drained to the device since (spec §3).
    /// `buff_fill_bytes`, when given, is the driver's own unheard buffer
    /// (its `get_buff_fill`); those bytes are subtracted first so the
    /// reported time tracks what's audible, not what's merely been handed
    /// to the driver (spec §4.2's "accounts only for the audible portion").
    pub fn time_get(&self) -> f64 {
        self.time_get_with_driver_fill(0)
    }

    pub fn time_get_with_driver_fill(&self, buff_fill_bytes: usize) -> f64 {
        let inner = self.inner.lock().unwrap();
        if inner.bytes_per_second == 0 {
            return inner.time_origin;
        }
        let audible = inner.bytes_drained.saturating_sub(buff_fill_bytes as u64);
        inner.time_origin + audible as f64 / inner.bytes_per_second as f64
    }

    /// Sets `time_origin` and resets the drained-byte counter, used on
    /// track start and after a successful seek (spec §4.6 step 5).
    pub fn time_set(&self, time: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.time_origin = time;
        inner.bytes_drained = 0;
    }

    /// Declares the byte rate of whatever's about to be pushed, so
    /// `time_get` can convert drained bytes into seconds (spec §3).
    pub fn set_bytes_per_second(&self, bytes_per_second: usize) {
        self.inner.lock().unwrap().bytes_per_second = bytes_per_second;
    }

    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
        self.not_empty.notify_all();
    }

    pub fn unpause(&self) {
        self.inner.lock().unwrap().paused = false;
        self.not_empty.notify_all();
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ring = RingByteBuffer::new(inner.ring.free() + inner.ring.fill());
        inner.stopped = false;
        inner.time_origin = 0.0;
        inner.bytes_drained = 0;
        self.not_full.notify_all();
    }

    pub fn get_fill(&self) -> usize {
        self.inner.lock().unwrap().ring.fill()
    }

    pub fn get_free(&self) -> usize {
        self.inner.lock().unwrap().ring.free()
    }

    /// Total ring capacity in bytes, fixed at construction (spec §3).
    pub fn capacity_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ring.free() + inner.ring.fill()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let buf = OutputBuffer::new(16);
        assert!(buf.put(b"hello"));
        assert_eq!(buf.get_fill(), 5);
        let out = buf.get(5, Duration::from_millis(10));
        assert_eq!(out, b"hello");
        assert_eq!(buf.get_fill(), 0);
    }

    #[test]
    fn stop_unblocks_get() {
        let buf = Arc::new(OutputBuffer::new(16));
        buf.stop();
        let out = buf.get(5, Duration::from_millis(10));
        assert!(out.is_empty());
    }

    #[test]
    fn time_get_set() {
        let buf = OutputBuffer::new(16);
        buf.time_set(12.5);
        assert_eq!(buf.time_get(), 12.5);
    }

    /// Spec §3/§8 invariant 4: `time_get` advances by exactly the seconds
    /// of audio drained, not merely by bytes pushed.
    #[test]
    fn time_get_advances_by_drained_bytes() {
        let buf = OutputBuffer::new(64);
        buf.set_bytes_per_second(8); // 8 bytes = 1 second, for round numbers.
        buf.time_set(10.0);
        buf.put(&[0u8; 16]);
        assert_eq!(buf.time_get(), 10.0, "time doesn't move until bytes drain");
        buf.get(8, Duration::from_millis(10));
        assert_eq!(buf.time_get(), 11.0);
        buf.get(8, Duration::from_millis(10));
        assert_eq!(buf.time_get(), 12.0);
    }

    #[test]
    fn time_get_subtracts_driver_unheard_fill() {
        let buf = OutputBuffer::new(64);
        buf.set_bytes_per_second(8);
        buf.time_set(0.0);
        buf.put(&[0u8; 16]);
        buf.get(16, Duration::from_millis(10));
        // All 16 bytes handed to the driver, but 8 are still unheard.
        assert_eq!(buf.time_get_with_driver_fill(8), 1.0);
    }

    #[test]
    fn free_callback_runs_on_get() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let buf = OutputBuffer::new(16);
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        buf.set_free_callback(Arc::new(move || called_clone.store(true, Ordering::SeqCst)));
        buf.put(b"x");
        buf.get(1, Duration::from_millis(10));
        assert!(called.load(Ordering::SeqCst));
    }
}
