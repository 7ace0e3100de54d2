//! Single-writer / single-reader byte pipe over one append-only buffer.
//!
//! The encoder thread appends PCM bytes through a [`WriteHandle`] while the device callback
//! drains them through a [`ReadHandle`]:
//! - encoder thread → `WriteHandle::write` (append, never waits on the reader)
//! - device callback → `ReadHandle::read_into` (non-blocking, short reads allowed)
//!
//! Both handles share one [`SharedByteBuffer`]. Each handle owns its own cursor; neither can
//! see or move the other's. The store is never truncated, so a slow reader never observes
//! lost history and a fast reader simply sees [`ReadStatus::Pending`].

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Append-only byte store shared by one writer and one reader.
///
/// ## Design
/// - One [`Mutex`] covers the bytes and the `closed` flag, so a reader never sees a torn append.
/// - A [`Condvar`] signals "state changed" (append or close) for callers that want to wait.
/// - `len()` is the write cursor: every write is an append at the end.
#[derive(Debug, Default)]
pub struct SharedByteBuffer {
    inner: Mutex<BufferInner>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct BufferInner {
    data: Vec<u8>,
    closed: bool,
}

impl SharedByteBuffer {
    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        // Appends happen entirely under the guard, so a poisoned buffer is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current backing length (equal to the write cursor).
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the writer has marked end-of-stream.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn append(&self, bytes: &[u8]) -> usize {
        let mut g = self.lock();
        if g.closed {
            return g.data.len();
        }
        g.data.extend_from_slice(bytes);
        let len = g.data.len();
        drop(g);
        if !bytes.is_empty() {
            self.cv.notify_all();
        }
        len
    }

    fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }
}

/// Result of a non-blocking read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were copied (may be fewer than requested).
    Data(usize),
    /// Nothing to read right now; the writer is still open.
    Pending,
    /// Everything written has been read and the writer has closed.
    EndOfStream,
}

impl ReadStatus {
    /// Bytes copied by this read (0 for `Pending`/`EndOfStream`).
    pub fn bytes(self) -> usize {
        match self {
            ReadStatus::Data(n) => n,
            ReadStatus::Pending | ReadStatus::EndOfStream => 0,
        }
    }
}

/// Create a fresh pipe: one append-only writer and one reader over an empty buffer.
pub fn stream_pipe() -> (WriteHandle, ReadHandle) {
    let buffer = Arc::new(SharedByteBuffer::default());
    (
        WriteHandle {
            buffer: buffer.clone(),
            position: 0,
        },
        ReadHandle {
            buffer,
            position: 0,
        },
    )
}

/// Append-only capability over a [`SharedByteBuffer`].
///
/// Dropping the handle closes the stream, so a writer that unwinds early still
/// lets the reader observe [`ReadStatus::EndOfStream`].
#[derive(Debug)]
pub struct WriteHandle {
    buffer: Arc<SharedByteBuffer>,
    position: usize,
}

impl WriteHandle {
    /// Append `bytes`, advancing the write cursor by `bytes.len()`.
    ///
    /// Writes after [`close`](Self::close) are discarded.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.position = self.buffer.append(bytes);
        bytes.len()
    }

    /// Write cursor (bytes appended so far).
    pub fn position(&self) -> usize {
        self.position
    }

    /// Mark end-of-stream. Idempotent.
    pub fn close(&self) {
        self.buffer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        self.buffer.close();
    }
}

impl io::Write for WriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buffer.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        Ok(WriteHandle::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for WriteHandle {
    /// The writer only ever sits at the end; seeking anywhere else is rejected.
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let len = self.buffer.len() as u64;
        let target = match pos {
            io::SeekFrom::Start(n) => Some(n),
            io::SeekFrom::End(off) => len.checked_add_signed(off),
            io::SeekFrom::Current(off) => (self.position as u64).checked_add_signed(off),
        };
        match target {
            Some(t) if t == len => Ok(t),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "write handle cannot move away from the end of the stream",
            )),
        }
    }
}

/// Read-only capability over a [`SharedByteBuffer`].
#[derive(Debug)]
pub struct ReadHandle {
    buffer: Arc<SharedByteBuffer>,
    position: usize,
}

impl ReadHandle {
    /// Copy up to `buf.len()` available bytes starting at the read cursor.
    ///
    /// Never blocks. An empty `buf` returns `Data(0)`.
    pub fn read_into(&mut self, buf: &mut [u8]) -> ReadStatus {
        if buf.is_empty() {
            return ReadStatus::Data(0);
        }
        let g = self.buffer.lock();
        let available = g.data.len().saturating_sub(self.position);
        if available == 0 {
            return if g.closed {
                ReadStatus::EndOfStream
            } else {
                ReadStatus::Pending
            };
        }
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&g.data[self.position..self.position + n]);
        self.position += n;
        ReadStatus::Data(n)
    }

    /// Read up to `max_count` bytes into a new vector.
    ///
    /// The vector is empty when nothing is available; use [`is_drained`](Self::is_drained)
    /// to tell end-of-stream from "not yet".
    pub fn read(&mut self, max_count: usize) -> Vec<u8> {
        let mut out = vec![0u8; max_count.min(self.available())];
        let n = self.read_into(&mut out).bytes();
        out.truncate(n);
        out
    }

    /// Read cursor.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes written but not yet read.
    pub fn available(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Writer closed and every written byte has been read.
    pub fn is_drained(&self) -> bool {
        let g = self.buffer.lock();
        g.closed && self.position >= g.data.len()
    }

    /// Wait up to `timeout` for unread bytes or end-of-stream.
    ///
    /// Returns `true` if there is something to act on (data or close) before the timeout.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.buffer.lock();
        loop {
            if g.data.len() > self.position || g.closed {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _timeout) = self
                .buffer
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            g = ng;
        }
    }
}

impl io::Read for ReadHandle {
    /// `Ok(0)` only at end-of-stream; "no data yet" surfaces as [`io::ErrorKind::WouldBlock`].
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_into(buf) {
            ReadStatus::Data(n) => Ok(n),
            ReadStatus::EndOfStream => Ok(0),
            ReadStatus::Pending => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no data written yet",
            )),
        }
    }
}

impl io::Seek for ReadHandle {
    /// Moves this handle's cursor only, within `[0, written length]`.
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let len = self.buffer.len() as u64;
        let target = match pos {
            io::SeekFrom::Start(n) => Some(n),
            io::SeekFrom::End(off) => len.checked_add_signed(off),
            io::SeekFrom::Current(off) => (self.position as u64).checked_add_signed(off),
        };
        match target {
            Some(t) if t <= len => {
                self.position = t as usize;
                Ok(t)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside written data",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::thread;

    #[test]
    fn short_reads_follow_write_order() {
        let (mut w, mut r) = stream_pipe();
        w.write(b"AB");
        w.write(b"CDE");

        assert_eq!(r.read(4), b"ABCD");
        assert_eq!(r.position(), 4);
        assert_eq!(r.read(4), b"E");
        assert_eq!(r.position(), 5);

        let mut buf = [0u8; 4];
        assert_eq!(r.read_into(&mut buf), ReadStatus::Pending);

        w.close();
        assert_eq!(r.read_into(&mut buf), ReadStatus::EndOfStream);
        assert!(r.is_drained());
    }

    #[test]
    fn empty_read_is_not_an_error_before_or_after_close() {
        let (w, mut r) = stream_pipe();
        assert!(r.read(8).is_empty());
        w.close();
        assert!(r.read(8).is_empty());
        assert!(r.is_drained());
    }

    #[test]
    fn tail_is_readable_after_close() {
        let (mut w, mut r) = stream_pipe();
        w.write(b"tail");
        w.close();
        assert!(!r.is_drained());
        let mut buf = [0u8; 16];
        assert_eq!(r.read_into(&mut buf), ReadStatus::Data(4));
        assert_eq!(&buf[..4], b"tail");
        assert_eq!(r.read_into(&mut buf), ReadStatus::EndOfStream);
    }

    #[test]
    fn dropping_writer_closes_stream() {
        let (mut w, mut r) = stream_pipe();
        w.write(b"x");
        drop(w);
        assert_eq!(r.read(4), b"x");
        assert!(r.is_drained());
    }

    #[test]
    fn writes_after_close_are_discarded() {
        let (mut w, mut r) = stream_pipe();
        w.write(b"ab");
        w.close();
        w.write(b"cd");
        assert_eq!(w.position(), 2);
        assert!(Write::write(&mut w, b"ef").is_err());
        assert_eq!(r.read(8), b"ab");
    }

    #[test]
    fn io_read_maps_pending_to_would_block() {
        let (mut w, mut r) = stream_pipe();
        let mut buf = [0u8; 4];
        let err = Read::read(&mut r, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        w.write(b"hi");
        assert_eq!(Read::read(&mut r, &mut buf).unwrap(), 2);
        w.close();
        assert_eq!(Read::read(&mut r, &mut buf).unwrap(), 0);
    }

    #[test]
    fn reader_seek_stays_within_written_range() {
        let (mut w, mut r) = stream_pipe();
        w.write(b"hello");
        assert!(r.seek(SeekFrom::Start(6)).is_err());
        assert!(r.seek(SeekFrom::Current(-1)).is_err());
        assert_eq!(r.seek(SeekFrom::End(-2)).unwrap(), 3);
        assert_eq!(r.read(8), b"lo");
        assert_eq!(r.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert_eq!(r.read(2), b"he");
    }

    #[test]
    fn writer_seek_cannot_rewrite_history() {
        let (mut w, _r) = stream_pipe();
        w.write(b"abc");
        assert_eq!(w.seek(SeekFrom::End(0)).unwrap(), 3);
        assert_eq!(w.seek(SeekFrom::Current(0)).unwrap(), 3);
        assert_eq!(
            w.seek(SeekFrom::Start(0)).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
    }

    #[test]
    fn wait_for_data_wakes_on_append() {
        let (mut w, r) = stream_pipe();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let _ = rx.recv();
            w.write(b"z");
            w
        });
        let _ = tx.send(());
        assert!(r.wait_for_data(Duration::from_secs(2)));
        let _w = handle.join().unwrap();
    }

    #[test]
    fn wait_for_data_times_out_when_idle() {
        let (_w, r) = stream_pipe();
        assert!(!r.wait_for_data(Duration::from_millis(10)));
    }

    #[test]
    fn concurrent_reader_sees_exact_concatenation() {
        let (mut w, mut r) = stream_pipe();
        let chunks: Vec<Vec<u8>> = (0..200u32)
            .map(|i| (0..(i % 13 + 1)).map(|j| (i * 7 + j) as u8).collect())
            .collect();
        let expected: Vec<u8> = chunks.iter().flatten().copied().collect();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();
        let writer = thread::spawn(move || {
            start.wait();
            for c in &chunks {
                w.write(c);
                if c.len() % 5 == 0 {
                    thread::yield_now();
                }
            }
            w.close();
        });

        barrier.wait();
        let mut got = Vec::new();
        let mut buf = [0u8; 7];
        let mut sizes = [1usize, 3, 7, 2].iter().cycle();
        loop {
            let want = *sizes.next().unwrap();
            match r.read_into(&mut buf[..want]) {
                ReadStatus::Data(n) => got.extend_from_slice(&buf[..n]),
                ReadStatus::Pending => {
                    r.wait_for_data(Duration::from_millis(5));
                }
                ReadStatus::EndOfStream => break,
            }
        }
        writer.join().unwrap();
        assert_eq!(got, expected);
    }
}
