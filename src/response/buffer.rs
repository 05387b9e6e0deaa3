//! Size-capped append buffer shared by the response pipeline.
//!
//! # Responsibilities
//! - Accept writes up to a fixed capacity, reporting how much was taken
//! - Track every byte *offered*, accepted or not, for observability
//! - Hand out isolated copies of its contents
//!
//! # Design Decisions
//! - All operations serialise on one internal mutex; callers never observe
//!   torn state
//! - A write that does not fit keeps the fitting prefix and flags overflow
//! - Capacity zero means "capture nothing": every write overflows

use std::io::{Read, Write};
use std::sync::Mutex;

/// Outcome of an operation that may hit the capacity limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Everything offered was stored.
    Accepted,
    /// The buffer is (now) full; only a prefix, possibly empty, was stored.
    Full,
}

/// Error for operations that refuse to run rather than partially succeed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer size limit exceeded")]
    Full,
    #[error("write would exceed buffer maximum size")]
    Overflow,
}

#[derive(Debug, Default)]
struct Inner {
    data: Vec<u8>,
    overflow: bool,
    /// Total bytes offered via `write`/`read_from`, accepted or not.
    total_offered: u64,
}

/// Thread-safe buffer with a hard size cap.
#[derive(Debug)]
pub struct LimitedBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl LimitedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Append as much of `buf` as fits. Returns the number of bytes stored
    /// and whether the buffer is full.
    pub fn write(&self, buf: &[u8]) -> (usize, BufferStatus) {
        let mut inner = self.lock();
        inner.total_offered += buf.len() as u64;

        if self.capacity == 0 {
            inner.overflow = true;
            return (0, BufferStatus::Full);
        }

        let available = self.capacity.saturating_sub(inner.data.len());
        if buf.len() > available {
            inner.overflow = true;
            inner.data.extend_from_slice(&buf[..available]);
            return (available, BufferStatus::Full);
        }

        inner.data.extend_from_slice(buf);
        (buf.len(), BufferStatus::Accepted)
    }

    /// Consume buffered bytes from the front into `dst`.
    pub fn read_into(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.lock();
        let n = dst.len().min(inner.data.len());
        dst[..n].copy_from_slice(&inner.data[..n]);
        inner.data.drain(..n);
        n
    }

    /// Copy of the current contents, isolated from future writes.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Current contents as a string, lossily decoded.
    pub fn snapshot_string(&self) -> String {
        String::from_utf8_lossy(&self.lock().data).into_owned()
    }

    pub fn length(&self) -> usize {
        self.lock().data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.length())
    }

    pub fn is_overflow(&self) -> bool {
        self.lock().overflow
    }

    /// Total bytes offered to the buffer, whether or not they were stored.
    pub fn total_attempted_bytes(&self) -> u64 {
        self.lock().total_offered
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.data.clear();
        inner.overflow = false;
        inner.total_offered = 0;
    }

    /// Drain the buffer into `sink`, leaving it empty.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> std::io::Result<u64> {
        let mut inner = self.lock();
        sink.write_all(&inner.data)?;
        let n = inner.data.len() as u64;
        inner.data.clear();
        Ok(n)
    }

    /// Keep only the first `n` bytes. Total-offered accounting is unchanged.
    pub fn truncate(&self, n: usize) {
        let mut inner = self.lock();
        if n < inner.data.len() {
            inner.data.truncate(n);
        }
    }

    /// Reserve space for `n` more bytes, refusing if that can never fit.
    pub fn grow(&self, n: usize) -> Result<(), BufferError> {
        let mut inner = self.lock();
        if inner.data.len() + n > self.capacity {
            return Err(BufferError::Overflow);
        }
        inner.data.reserve(n);
        Ok(())
    }

    /// Read from `source` until EOF or capacity. If the source still has
    /// data once the buffer is full, overflow is flagged.
    pub fn read_from<R: Read>(&self, source: &mut R) -> std::io::Result<(u64, BufferStatus)> {
        let mut inner = self.lock();
        let available = self.capacity.saturating_sub(inner.data.len());
        if available == 0 {
            inner.overflow = true;
            return Ok((0, BufferStatus::Full));
        }

        let mut taken = source.take(available as u64);
        let n = taken.read_to_end(&mut inner.data)? as u64;
        inner.total_offered += n;

        if n == available as u64 {
            // The cap was reached exactly; probe for one more byte to tell
            // "fit exactly" apart from "source had more".
            let mut probe = [0u8; 1];
            let extra = taken.into_inner().read(&mut probe)?;
            if extra > 0 {
                inner.overflow = true;
                inner.total_offered += extra as u64;
                return Ok((n, BufferStatus::Full));
            }
        }

        Ok((n, BufferStatus::Accepted))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned buffer mutex means a panic mid-append; the contents are
        // still structurally valid bytes, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clone for LimitedBuffer {
    /// Independent copy. Overflow is recomputed from the cloned contents
    /// against the capacity, not inherited, so the clone's state always
    /// reflects what it actually holds.
    fn clone(&self) -> Self {
        let inner = self.lock();
        let overflow = self.capacity > 0 && inner.data.len() >= self.capacity;
        Self {
            capacity: self.capacity,
            inner: Mutex::new(Inner {
                data: inner.data.clone(),
                overflow,
                total_offered: inner.total_offered,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn write_within_capacity() {
        let buf = LimitedBuffer::new(16);
        let (n, status) = buf.write(b"hello");
        assert_eq!(n, 5);
        assert_eq!(status, BufferStatus::Accepted);
        assert_eq!(buf.length(), 5);
        assert_eq!(buf.available(), 11);
        assert!(!buf.is_overflow());
    }

    #[test]
    fn write_partial_on_overflow() {
        let buf = LimitedBuffer::new(8);
        let (n, status) = buf.write(b"0123456789");
        assert_eq!(n, 8);
        assert_eq!(status, BufferStatus::Full);
        assert!(buf.is_overflow());
        assert_eq!(buf.snapshot_bytes(), b"01234567");
        assert_eq!(buf.total_attempted_bytes(), 10);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let buf = LimitedBuffer::new(0);
        let (n, status) = buf.write(b"data");
        assert_eq!(n, 0);
        assert_eq!(status, BufferStatus::Full);
        assert!(buf.is_overflow());
        assert_eq!(buf.total_attempted_bytes(), 4);
    }

    #[test]
    fn accepted_is_min_of_input_and_space() {
        // The accounting invariant: accepted == min(len, cap - len_before),
        // length never exceeds cap, total_offered always grows by len.
        let buf = LimitedBuffer::new(32);
        let inputs: &[&[u8]] = &[b"0123456789", b"abcdefghijklmnop", b"XYZ", b"0123456789"];
        let mut expected_total = 0u64;
        for input in inputs {
            let before = buf.length();
            let (accepted, _) = buf.write(input);
            expected_total += input.len() as u64;
            assert_eq!(accepted, input.len().min(32 - before));
            assert!(buf.length() <= 32);
            assert_eq!(buf.total_attempted_bytes(), expected_total);
        }
    }

    #[test]
    fn snapshot_is_isolated() {
        let buf = LimitedBuffer::new(64);
        buf.write(b"before");
        let snap = buf.snapshot_bytes();
        buf.write(b"-after");
        assert_eq!(snap, b"before");
        assert_eq!(buf.snapshot_string(), "before-after");
    }

    #[test]
    fn write_to_drains() {
        let buf = LimitedBuffer::new(64);
        buf.write(b"payload");
        let mut out = Vec::new();
        let n = buf.write_to(&mut out).unwrap();
        assert_eq!(n, 7);
        assert_eq!(out, b"payload");
        assert_eq!(buf.length(), 0);
    }

    #[test]
    fn snapshot_then_write_to_match() {
        let buf = LimitedBuffer::new(64);
        buf.write(b"same bytes either way");
        let snap = buf.snapshot_bytes();
        let mut out = Vec::new();
        buf.write_to(&mut out).unwrap();
        assert_eq!(snap, out);
    }

    #[test]
    fn clone_recomputes_overflow() {
        let buf = LimitedBuffer::new(4);
        buf.write(b"0123456789");
        assert!(buf.is_overflow());

        let clone = buf.clone();
        // Clone holds exactly capacity bytes, so it is full.
        assert!(clone.is_overflow());
        assert_eq!(clone.snapshot_bytes(), buf.snapshot_bytes());

        // A truncated-then-cloned buffer is not full.
        buf.truncate(2);
        let clone = buf.clone();
        assert!(!clone.is_overflow());
        assert_eq!(clone.length(), 2);
    }

    #[test]
    fn clone_tracks_same_future_writes() {
        let original = LimitedBuffer::new(10);
        original.write(b"abc");
        let clone = original.clone();

        original.write(b"0123456789");
        clone.write(b"0123456789");

        assert_eq!(original.length(), clone.length());
        assert_eq!(original.is_overflow(), clone.is_overflow());
    }

    #[test]
    fn read_into_consumes() {
        let buf = LimitedBuffer::new(16);
        buf.write(b"abcdef");
        let mut dst = [0u8; 4];
        assert_eq!(buf.read_into(&mut dst), 4);
        assert_eq!(&dst, b"abcd");
        assert_eq!(buf.snapshot_bytes(), b"ef");
    }

    #[test]
    fn read_from_flags_remaining_source_data() {
        let buf = LimitedBuffer::new(4);
        let mut source: &[u8] = b"0123456789";
        let (n, status) = buf.read_from(&mut source).unwrap();
        assert_eq!(n, 4);
        assert_eq!(status, BufferStatus::Full);
        assert!(buf.is_overflow());
    }

    #[test]
    fn read_from_exact_fit_is_not_overflow() {
        let buf = LimitedBuffer::new(4);
        let mut source: &[u8] = b"0123";
        let (n, status) = buf.read_from(&mut source).unwrap();
        assert_eq!(n, 4);
        assert_eq!(status, BufferStatus::Accepted);
        assert!(!buf.is_overflow());
    }

    #[test]
    fn grow_refuses_past_capacity() {
        let buf = LimitedBuffer::new(8);
        buf.write(b"abcd");
        assert_eq!(buf.grow(4), Ok(()));
        assert_eq!(buf.grow(5), Err(BufferError::Overflow));
    }

    #[test]
    fn reset_clears_everything() {
        let buf = LimitedBuffer::new(4);
        buf.write(b"too much data");
        buf.reset();
        assert_eq!(buf.length(), 0);
        assert!(!buf.is_overflow());
        assert_eq!(buf.total_attempted_bytes(), 0);
    }

    #[test]
    fn concurrent_writes_never_exceed_capacity() {
        let buf = Arc::new(LimitedBuffer::new(1000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let buf = Arc::clone(&buf);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    buf.write(b"0123456789");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.length(), 1000);
        assert!(buf.is_overflow());
        assert_eq!(buf.total_attempted_bytes(), 8 * 50 * 10);
    }
}
