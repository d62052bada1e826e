//! Bounded byte ring shared by a connector (writer) and a decode worker
//! (reader).
//!
//! The writer blocks while the ring is full. The reader waits at most one
//! poll interval per attempt and gives up on a full read after
//! `timeout / poll` empty attempts. Closing either side wakes the other;
//! dropping the reader or the last writer closes the ring.

use super::context::ByteStream;
use super::error::ReadError;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct State {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
    writers: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// Create a ring of `capacity` bytes
pub fn ring_buffer(capacity: usize, timeout: Duration, poll: Duration) -> (RingWriter, RingReader) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
        capacity,
        writers: AtomicUsize::new(1),
    });

    let poll = poll.max(Duration::from_millis(1));
    let max_empty_reads = (timeout.as_millis() / poll.as_millis()).max(1) as usize;

    (
        RingWriter {
            shared: Arc::clone(&shared),
        },
        RingReader {
            shared,
            poll,
            max_empty_reads,
        },
    )
}

/// Write side of the ring
#[derive(Debug)]
pub struct RingWriter {
    shared: Arc<Shared>,
}

impl Clone for RingWriter {
    fn clone(&self) -> Self {
        self.shared.writers.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        if self.shared.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close();
        }
    }
}

impl RingWriter {
    /// Mark the stream finished; the reader drains what is left
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Bytes waiting to be read
    pub fn len(&self) -> usize {
        self.shared.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl io::Write for RingWriter {
    /// Block until there is room, then write as much as fits
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let shared = &self.shared;
        let mut state = shared.lock();
        while state.buf.len() >= shared.capacity && !state.closed {
            state = shared
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "ring buffer closed"));
        }

        let n = data.len().min(shared.capacity - state.buf.len());
        state.buf.extend(&data[..n]);
        drop(state);
        shared.readable.notify_one();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read side of the ring; closes the ring when dropped
#[derive(Debug)]
pub struct RingReader {
    shared: Arc<Shared>,
    poll: Duration,
    max_empty_reads: usize,
}

impl RingReader {
    /// Read what is available, waiting at most one poll interval.
    ///
    /// `Ok(0)` means nothing arrived in time; `Closed` means nothing ever will.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let shared = &self.shared;
        let mut state = shared.lock();
        if state.buf.is_empty() && !state.closed {
            state = shared
                .readable
                .wait_timeout(state, self.poll)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }

        if state.buf.is_empty() {
            return if state.closed {
                Err(ReadError::Closed)
            } else {
                Ok(0)
            };
        }

        let n = buf.len().min(state.buf.len());
        for (dst, src) in buf.iter_mut().zip(state.buf.drain(..n)) {
            *dst = src;
        }
        drop(state);
        shared.writable.notify_one();
        Ok(n)
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl ByteStream for RingReader {
    fn read_full(&mut self, buf: &mut [u8]) -> Result<(), ReadError> {
        let mut filled = 0;
        let mut empty_reads = 0;

        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => {
                    empty_reads += 1;
                    if empty_reads >= self.max_empty_reads {
                        return Err(if filled == 0 {
                            ReadError::Timeout
                        } else {
                            ReadError::UnexpectedEof { read: filled }
                        });
                    }
                }
                Ok(n) => filled += n,
                Err(ReadError::Closed) if filled > 0 => {
                    return Err(ReadError::UnexpectedEof { read: filled });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn discard(&mut self, count: usize) -> Result<(), ReadError> {
        let mut chunk = [0u8; 256];
        let mut left = count;
        while left > 0 {
            let n = left.min(chunk.len());
            self.read_full(&mut chunk[..n]).map_err(|e| match e {
                ReadError::UnexpectedEof { read } => ReadError::UnexpectedEof {
                    read: count - left + read,
                },
                ReadError::Timeout | ReadError::Closed if left < count => {
                    ReadError::UnexpectedEof { read: count - left }
                }
                other => other,
            })?;
            left -= n;
        }
        Ok(())
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;

    fn ring(capacity: usize) -> (RingWriter, RingReader) {
        ring_buffer(capacity, Duration::from_millis(50), Duration::from_millis(5))
    }

    #[test]
    fn test_write_then_read_full() {
        let (mut w, mut r) = ring(16);
        w.write_all(&[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        r.read_full(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(w.is_empty());
    }

    #[test]
    fn test_read_full_times_out_when_empty() {
        let (_w, mut r) = ring(16);
        let mut buf = [0u8; 2];
        assert_eq!(r.read_full(&mut buf), Err(ReadError::Timeout));
    }

    #[test]
    fn test_partial_then_timeout_is_unexpected_eof() {
        let (mut w, mut r) = ring(16);
        w.write_all(&[1]).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(
            r.read_full(&mut buf),
            Err(ReadError::UnexpectedEof { read: 1 })
        );
    }

    #[test]
    fn test_closed_after_drain() {
        let (mut w, mut r) = ring(16);
        w.write_all(&[9]).unwrap();
        w.close();
        let mut one = [0u8; 1];
        r.read_full(&mut one).unwrap();
        assert_eq!(one, [9]);
        assert_eq!(r.read_full(&mut one), Err(ReadError::Closed));
    }

    #[test]
    fn test_last_writer_drop_closes() {
        let (w, mut r) = ring(4);
        let w2 = w.clone();
        drop(w);
        assert!(!w2.is_closed());
        drop(w2);
        let mut one = [0u8; 1];
        assert_eq!(r.read_full(&mut one), Err(ReadError::Closed));
    }

    #[test]
    fn test_write_after_reader_dropped() {
        let (mut w, r) = ring(4);
        drop(r);
        assert!(w.is_closed());
        let err = w.write(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_writer_blocks_until_reader_drains() {
        let (mut w, mut r) = ring_buffer(4, Duration::from_secs(2), Duration::from_millis(5));
        let writer = thread::spawn(move || {
            w.write_all(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
            w.close();
        });

        let mut out = [0u8; 10];
        r.read_full(&mut out).unwrap();
        writer.join().unwrap();
        assert_eq!(out, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_discard() {
        let (mut w, mut r) = ring(1024);
        let data: Vec<u8> = (0..=255u8).chain(0..10).collect();
        w.write_all(&data).unwrap();
        r.discard(260).unwrap();
        let mut rest = [0u8; 6];
        r.read_full(&mut rest).unwrap();
        assert_eq!(rest, [4, 5, 6, 7, 8, 9]);
    }
}
