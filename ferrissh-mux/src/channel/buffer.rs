//! Producer/consumer byte buffer with idle-timeout detection.
//!
//! The network side appends owned segments with [`Buffer::write`] and never
//! blocks. Readers block in [`Buffer::read`] until data arrives, the buffer
//! is closed, the idle timer expires or the connection shuts down.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes};
use log::{trace, warn};
use thiserror::Error;
use tokio::sync::Notify;

use crate::halt::{Shutdown, ShutdownCause};
use crate::idle::{IdleTimeout, IdleTimer};

/// Why a read returned without data.
#[derive(Error, Debug)]
pub enum BufferError {
    /// No consumer activity within the idle interval. The buffer is still
    /// open and may be read again.
    #[error("{0}")]
    Timeout(#[from] IdleTimeout),

    /// A shutdown signal fired while waiting for data.
    #[error("read interrupted: {0}")]
    Shutdown(ShutdownCause),
}

impl BufferError {
    /// Whether this is an idle timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BufferError::Timeout(_))
    }

    /// Whether retrying the read may succeed.
    pub fn is_temporary(&self) -> bool {
        match self {
            BufferError::Timeout(e) => e.is_temporary(),
            BufferError::Shutdown(_) => false,
        }
    }
}

impl From<BufferError> for io::Error {
    fn from(err: BufferError) -> Self {
        let kind = match err {
            BufferError::Timeout(_) => io::ErrorKind::TimedOut,
            BufferError::Shutdown(_) => io::ErrorKind::ConnectionAborted,
        };
        io::Error::new(kind, err)
    }
}

/// Unbounded FIFO of byte segments shared by one producer and its readers.
#[derive(Debug)]
pub struct Buffer {
    inner: Mutex<Inner>,
    readable: Notify,
    idle: Arc<IdleTimer>,
    shutdown: Shutdown,
}

#[derive(Debug, Default)]
struct Inner {
    segments: VecDeque<Bytes>,
    buffered: usize,
    closed: bool,
}

impl Inner {
    /// Copy as much as possible into `dst`, dropping drained segments.
    fn copy_to(&mut self, dst: &mut [u8]) -> usize {
        let mut n = 0;
        while n < dst.len() {
            let Some(head) = self.segments.front_mut() else {
                break;
            };
            let take = head.len().min(dst.len() - n);
            dst[n..n + take].copy_from_slice(&head[..take]);
            head.advance(take);
            n += take;
            if head.is_empty() {
                self.segments.pop_front();
            }
        }
        self.buffered -= n;
        n
    }
}

impl Buffer {
    /// Create an empty, open buffer.
    pub fn new(idle: Arc<IdleTimer>, shutdown: Shutdown) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            readable: Notify::new(),
            idle,
            shutdown,
        }
    }

    /// Make `segment` available to readers. Never blocks.
    ///
    /// Writes after [`close_for_write`](Self::close_for_write) are dropped.
    pub fn write(&self, segment: impl Into<Bytes>) {
        let segment = segment.into();
        if segment.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            if inner.closed {
                warn!("buffer: dropping {} byte write after close", segment.len());
                return;
            }
            inner.buffered += segment.len();
            inner.segments.push_back(segment);
        }
        self.readable.notify_one();
    }

    /// Mark the end of the stream. Readers drain what is left, then see EOF.
    pub fn close_for_write(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        trace!("buffer: closed for write");
        self.readable.notify_waiters();
    }

    /// Wake blocked readers so they re-check the idle timer. Does not close
    /// the buffer.
    pub fn notify_timeout(&self) {
        self.readable.notify_waiters();
    }

    /// Read into `dst`.
    ///
    /// Returns as soon as at least one byte was copied and nothing more is
    /// queued. Returns `Ok(0)` at end of stream (or for an empty `dst`).
    /// Blocks while the buffer is empty and open, until data arrives, the
    /// idle timer expires or a shutdown signal fires.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, BufferError> {
        if dst.is_empty() {
            return Ok(0);
        }

        loop {
            // Register interest before inspecting state so a write between
            // the check and the wait is not missed.
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut inner = self.lock();
                let n = inner.copy_to(dst);
                if n > 0 {
                    drop(inner);
                    self.idle.reset();
                    return Ok(n);
                }
                if inner.closed {
                    return Ok(0);
                }
            }

            tokio::select! {
                biased;
                _ = &mut readable => {}
                reason = self.idle.timed_out() => {
                    return Err(IdleTimeout::new(reason, &self.idle).into());
                }
                cause = self.shutdown.cancelled() => {
                    return Err(BufferError::Shutdown(cause));
                }
            }
        }
    }

    /// Read until end of stream, appending to `out`.
    ///
    /// Returns the number of bytes appended. On error everything read so
    /// far is already in `out`, and a later call picks up where this one
    /// stopped.
    pub async fn read_to_end(&self, out: &mut Vec<u8>) -> Result<usize, BufferError> {
        let start = out.len();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out.len() - start);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Bytes queued and not yet read.
    pub fn len(&self) -> usize {
        self.lock().buffered
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer closed the buffer.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// The idle timer reset by reads on this buffer.
    pub fn idle_timer(&self) -> &Arc<IdleTimer> {
        &self.idle
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
