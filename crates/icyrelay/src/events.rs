//! Event broadcasting
//!
//! `EventBus` fans discrete `RelayEvent`s out to any number of subscribers.
//! Each subscriber owns a channel receiver and drains it on its own thread.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::stream::metadata::MetadataRecord;
use crate::stream::types::{ConnectionState, NegotiatedStreamInfo};

/// Events published by the reader and the proxy façade
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A metadata record different from the last published one
    MetadataChanged(MetadataRecord),
    /// Total demuxed audio bytes of the session (monotonic, throttled)
    ProgressChanged(u64),
    StateChanged(ConnectionState),
    /// Negotiation finished; `true` if the server interleaves ICY metadata
    IcecastDetected(bool),
    /// Headers of the current upstream connection
    StreamInfo(NegotiatedStreamInfo),
    /// Enough audio is buffered for playback to start
    BufferReady,
    /// `true` while connecting, buffering or reconnecting
    LoadingChanged(bool),
    /// Local URL the playback component should open
    ProxyUrlReady(String),
}

/// Broadcast mechanism for relay events
pub struct EventBus<E = RelayEvent> {
    subscribers: Mutex<Vec<Sender<E>>>,
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> EventBus<E> {
    /// Create a new event bus with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to events. Returns a receiver that will get all future events.
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Emit an event to all subscribers. Removes disconnected subscribers.
    pub fn emit(&self, event: E) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Rate limiter for progress events: at most one per `interval`
pub(crate) struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
    last_value: u64,
}

impl ProgressThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            last_value: 0,
        }
    }

    /// Returns the value to publish, if this update is due
    pub(crate) fn update(&mut self, value: u64) -> Option<u64> {
        if value <= self.last_value {
            return None;
        }
        let due = self.last.map_or(true, |t| t.elapsed() >= self.interval);
        if !due {
            return None;
        }
        self.last = Some(Instant::now());
        self.last_value = value;
        Some(value)
    }

    /// Publish whatever is pending regardless of the interval
    pub(crate) fn flush(&mut self, value: u64) -> Option<u64> {
        if value <= self.last_value {
            return None;
        }
        self.last = Some(Instant::now());
        self.last_value = value;
        Some(value)
    }
}
