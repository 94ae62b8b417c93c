//! Bounded producer-consumer stream buffer
//!
//! The network thread pushes demuxed audio, the proxy session pops it.
//! A full buffer blocks the producer, which stops reading from the socket
//! and lets TCP flow control slow the remote server down.
//!
//! Architecture:
//!   Network → IcyDemuxer
//!                  ↓ (push, blocks while full)
//!            StreamBuffer (`VecDeque<Bytes>` + Mutex + Condvar)
//!                  ↓ (pop, blocks while empty)
//!            ProxySession → local client socket

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{RelayError, Result};
use crate::stream::types::AudioChunk;

/// Snapshot of buffer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStatus {
    pub level_bytes: usize,
    pub capacity_bytes: usize,
    pub total_pushed: u64,
    pub total_popped: u64,
    pub closed: bool,
}

/// Shared mutable state behind Mutex
struct BufferInner {
    chunks: VecDeque<Bytes>,
    /// Sum of `chunks` lengths
    ready: usize,
    closed: bool,
    total_pushed: u64,
    total_popped: u64,
}

/// Bounded, ordered byte queue with one writer and one reader.
///
/// `ready_bytes() <= capacity()` holds at every observation point: oversized
/// pushes are admitted piecewise as the consumer frees space.
pub struct StreamBuffer {
    inner: Mutex<BufferInner>,
    data_available: Condvar,
    space_available: Condvar,
    capacity: usize,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                chunks: VecDeque::new(),
                ready: 0,
                closed: false,
                total_pushed: 0,
                total_popped: 0,
            }),
            data_available: Condvar::new(),
            space_available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a chunk only if it fits entirely.
    ///
    /// Fails with `BufferFull` when it doesn't, and with `StreamEnded` once the
    /// buffer is closed.
    pub fn try_push(&self, chunk: AudioChunk) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RelayError::StreamEnded);
        }
        if inner.ready + chunk.len() > self.capacity {
            return Err(RelayError::BufferFull);
        }
        Self::append(&mut inner, chunk.data);
        drop(inner);
        self.data_available.notify_all();
        Ok(())
    }

    /// Append a chunk, blocking while the buffer is full.
    ///
    /// Returns `StreamEnded` if the buffer is closed before the whole chunk
    /// was admitted; bytes admitted before that point stay queued.
    pub fn push(&self, chunk: AudioChunk) -> Result<()> {
        let mut remaining = chunk.data;
        while !remaining.is_empty() {
            let mut inner = self.lock();
            while inner.ready >= self.capacity && !inner.closed {
                inner = self
                    .space_available
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if inner.closed {
                return Err(RelayError::StreamEnded);
            }

            let n = (self.capacity - inner.ready).min(remaining.len());
            Self::append(&mut inner, remaining.split_to(n));
            drop(inner);
            self.data_available.notify_all();
        }
        Ok(())
    }

    /// Take up to `max_bytes`, blocking until at least one byte is available.
    ///
    /// Returns `None` once the buffer is closed and drained.
    pub fn pop(&self, max_bytes: usize) -> Option<Bytes> {
        let max_bytes = max_bytes.max(1);
        let mut inner = self.lock();
        loop {
            if let Some(bytes) = self.take(&mut inner, max_bytes) {
                return Some(bytes);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .data_available
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like `pop`, but gives up after `timeout`.
    ///
    /// Returns `None` on timeout or when closed and drained; use `is_closed`
    /// to tell them apart.
    pub fn pop_timeout(&self, max_bytes: usize, timeout: Duration) -> Option<Bytes> {
        let max_bytes = max_bytes.max(1);
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(bytes) = self.take(&mut inner, max_bytes) {
                return Some(bytes);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = self
                .data_available
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Drop all buffered content
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.chunks.clear();
        inner.ready = 0;
        drop(inner);
        self.space_available.notify_all();
    }

    /// Reject further pushes and wake every blocked producer and consumer
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        drop(inner);
        self.space_available.notify_all();
        self.data_available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn ready_bytes(&self) -> usize {
        self.lock().ready
    }

    pub fn status(&self) -> BufferStatus {
        let inner = self.lock();
        BufferStatus {
            level_bytes: inner.ready,
            capacity_bytes: self.capacity,
            total_pushed: inner.total_pushed,
            total_popped: inner.total_popped,
            closed: inner.closed,
        }
    }

    fn append(inner: &mut BufferInner, data: Bytes) {
        if data.is_empty() {
            return;
        }
        inner.ready += data.len();
        inner.total_pushed += data.len() as u64;
        inner.chunks.push_back(data);
    }

    fn take(&self, inner: &mut BufferInner, max_bytes: usize) -> Option<Bytes> {
        let front = inner.chunks.front_mut()?;
        let bytes = if front.len() <= max_bytes {
            inner.chunks.pop_front()?
        } else {
            front.split_to(max_bytes)
        };
        inner.ready -= bytes.len();
        inner.total_popped += bytes.len() as u64;
        self.space_available.notify_all();
        Some(bytes)
    }

    // Poisoning only happens if a holder panicked; the queue itself stays consistent.
    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
