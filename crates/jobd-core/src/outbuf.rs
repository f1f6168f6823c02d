//! Fan-out output buffer.
//!
//! An append-only byte log with a single writer and any number of
//! independent readers. Every reader starts at offset zero and observes a
//! prefix of the same byte sequence, so subscribers created after the
//! process has already produced output still receive the full history.
//!
//! Readers suspend while they are caught up with the writer and wake on the
//! next append or on [`OutputBuffer::close`]. The read future is
//! cancel-safe, which is what lets the RPC layer race it against the
//! per-call cancellation signal.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

/// Errors produced by buffer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The buffer was closed before the write.
    #[error("output buffer is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    data: Vec<u8>,
    closed: bool,
}

/// Shared append-only byte log.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    inner: Mutex<Inner>,
    readable: Notify,
}

impl OutputBuffer {
    /// Create an empty, open buffer.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `bytes` and wake all waiting readers.
    ///
    /// A zero-length write succeeds without waking anyone.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Closed`] if the buffer has been closed.
    pub fn write(&self, bytes: &[u8]) -> Result<(), BufferError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BufferError::Closed);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        inner.data.extend_from_slice(bytes);
        drop(inner);
        self.readable.notify_waiters();
        Ok(())
    }

    /// Mark the buffer closed and wake all waiting readers. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.readable.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Total bytes appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Whether nothing has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a reader positioned at offset zero.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> OutputReader {
        OutputReader {
            buf: Arc::clone(self),
            offset: 0,
        }
    }
}

/// Cursor over an [`OutputBuffer`].
///
/// Readers never block each other and never consume data; each tracks its
/// own offset into the shared log.
#[derive(Debug)]
pub struct OutputReader {
    buf: Arc<OutputBuffer>,
    offset: usize,
}

impl OutputReader {
    /// Copy the next available bytes into `dst`, waiting for the writer if
    /// the reader is caught up.
    ///
    /// Returns the number of bytes copied. `0` means end-of-stream: the
    /// buffer is closed and this reader has observed every byte. The
    /// returned future is cancel-safe; dropping it between wakeups loses no
    /// data.
    pub async fn read(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        loop {
            // Register for the wakeup before inspecting state so an append
            // between the check and the await cannot be missed.
            let readable = self.buf.readable.notified();
            {
                let inner = self.buf.lock();
                let available = inner.data.len() - self.offset;
                if available > 0 {
                    let n = available.min(dst.len());
                    dst[..n].copy_from_slice(&inner.data[self.offset..self.offset + n]);
                    self.offset += n;
                    return n;
                }
                if inner.closed {
                    return 0;
                }
            }
            readable.await;
        }
    }

    /// Bytes this reader has consumed so far.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}
