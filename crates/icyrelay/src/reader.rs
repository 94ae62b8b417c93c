//! Stream orchestration
//!
//! `IcecastReader` drives one upstream session at a time on a background
//! thread: negotiate, demux, fill the `StreamBuffer`, reconnect on faults.
//!
//! State machine:
//!   Idle → Connecting → Buffering → Streaming
//!              ↑                        │ (read fault / stream end)
//!              └──── Reconnecting ←─────┘
//!   Connecting (first attempt) / Reconnecting (retries exhausted) → Error
//!   any → Stopped on stop()
//!
//! Every session gets an id. The receive thread publishes state, snapshots
//! and events only while its id is current, so nothing from a stopped
//! session reaches observers once `stop()` returns.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, info, trace, warn};

use crate::config::network::{READ_CHUNK_SIZE, STOP_GRACE_MS};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::events::{EventBus, ProgressThrottle, RelayEvent};
use crate::stream::buffer::StreamBuffer;
use crate::stream::demux::{DemuxEvent, IcyDemuxer};
use crate::stream::metadata::{MetadataRecord, NowPlaying};
use crate::stream::negotiate::{classify_read_error, ConnectionNegotiator};
use crate::stream::sleep_unless_cancelled;
use crate::stream::types::{
    AudioChunk, ConnectionState, NegotiatedStreamInfo, SharedStreamInfo, StreamEndpoint,
};

/// Observable state of the current session
struct View {
    session: u64,
    state: ConnectionState,
    metadata: Option<MetadataRecord>,
    /// ICY classification from the session's last negotiation
    learned_hint: Option<bool>,
}

/// State shared between the control handle and the receive thread
struct Shared {
    view: Mutex<View>,
    stream_info: SharedStreamInfo,
    bytes_delivered: AtomicU64,
    bus: Arc<EventBus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` under the view lock and emit what it collected.
    ///
    /// Returns false without running `f` when `session` is no longer current.
    fn publish(&self, session: u64, f: impl FnOnce(&mut View, &mut Vec<RelayEvent>)) -> bool {
        let mut view = self.lock();
        if view.session != session {
            return false;
        }
        let mut events = Vec::new();
        f(&mut view, &mut events);
        for event in events {
            self.bus.emit(event);
        }
        true
    }

    fn transition(view: &mut View, next: ConnectionState, events: &mut Vec<RelayEvent>) {
        if view.state == next {
            return;
        }
        info!(from = %view.state, to = %next, "state change");
        let was_loading = view.state.is_loading();
        let loading = next.is_loading();
        view.state = next.clone();
        events.push(RelayEvent::StateChanged(next));
        if loading != was_loading {
            events.push(RelayEvent::LoadingChanged(loading));
        }
    }

    fn set_stream_info(&self, info: Option<NegotiatedStreamInfo>) {
        match self.stream_info.write() {
            Ok(mut guard) => *guard = info,
            Err(poisoned) => *poisoned.into_inner() = info,
        }
    }
}

/// Control-side handle of a running receive thread
struct Session {
    cancel: Arc<AtomicBool>,
    buffer: Arc<StreamBuffer>,
    /// Disconnects when the receive thread exits
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

/// Orchestrates negotiation, demuxing, buffering and reconnects for one
/// endpoint at a time.
///
/// Control methods take `&mut self` and never wait on the network: a receive
/// thread blocked in a socket read is cancelled and detached, and exits on
/// its own when the read returns.
pub struct IcecastReader {
    config: RelayConfig,
    shared: Arc<Shared>,
    endpoint: Option<StreamEndpoint>,
    session: Option<Session>,
}

impl IcecastReader {
    pub fn new(config: RelayConfig) -> Result<Self> {
        Self::with_bus(config, Arc::new(EventBus::new()))
    }

    /// Reader publishing on an existing bus
    pub(crate) fn with_bus(config: RelayConfig, bus: Arc<EventBus>) -> Result<Self> {
        let config = config.validate()?;
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                view: Mutex::new(View {
                    session: 0,
                    state: ConnectionState::Idle,
                    metadata: None,
                    learned_hint: None,
                }),
                stream_info: Arc::new(RwLock::new(None)),
                bytes_delivered: AtomicU64::new(0),
                bus,
            }),
            endpoint: None,
            session: None,
        })
    }

    /// Start reading `endpoint`, tearing down any current session first.
    ///
    /// Returns once the receive thread is running; progress is reported
    /// through events.
    pub fn start(&mut self, endpoint: StreamEndpoint) -> Result<()> {
        self.start_session(endpoint).map(|_| ())
    }

    /// `start`, returning the new session's buffer
    pub(crate) fn start_session(&mut self, endpoint: StreamEndpoint) -> Result<Arc<StreamBuffer>> {
        self.stop();

        let buffer = Arc::new(StreamBuffer::new(self.config.buffer_capacity));
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<()>(0);

        let session = {
            let mut view = self.shared.lock();
            view.session += 1;
            view.metadata = None;
            view.learned_hint = None;
            self.shared.bytes_delivered.store(0, Ordering::SeqCst);
            self.shared.set_stream_info(None);
            let mut events = Vec::new();
            Shared::transition(&mut view, ConnectionState::Connecting, &mut events);
            for event in events {
                self.shared.bus.emit(event);
            }
            view.session
        };
        info!(url = %endpoint.url, icecast_hint = endpoint.icecast_hint, session, "starting");

        let worker = Worker {
            session,
            shared: self.shared.clone(),
            cancel: cancel.clone(),
            buffer: buffer.clone(),
            config: self.config.clone(),
            endpoint: endpoint.clone(),
            last_metadata: None,
            throttle: ProgressThrottle::new(self.config.progress_interval),
            delivered: 0,
        };
        let spawned = thread::Builder::new()
            .name(format!("icy-reader-{}", session))
            .spawn(move || {
                let _done = done_tx;
                worker.run();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let err = RelayError::Io(e);
                self.shared.publish(session, |view, events| {
                    Shared::transition(view, ConnectionState::Error(err.to_string()), events);
                });
                return Err(err);
            }
        };

        self.endpoint = Some(endpoint);
        self.session = Some(Session {
            cancel,
            buffer: buffer.clone(),
            done: done_rx,
            handle: Some(handle),
        });
        Ok(buffer)
    }

    /// Stop the current session: cancel the network read, close and clear
    /// the buffer, publish `Stopped`. No-op without a session.
    pub fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        {
            let mut view = self.shared.lock();
            view.session += 1;
            session.cancel.store(true, Ordering::SeqCst);
            session.buffer.close();
            session.buffer.clear();
            self.shared.set_stream_info(None);
            let mut events = Vec::new();
            Shared::transition(&mut view, ConnectionState::Stopped, &mut events);
            for event in events {
                self.shared.bus.emit(event);
            }
        }

        match session
            .done
            .recv_timeout(Duration::from_millis(STOP_GRACE_MS))
        {
            Err(RecvTimeoutError::Timeout) => {
                debug!("receive thread still blocked in a read, detaching");
            }
            _ => {
                if let Some(handle) = session.handle.take() {
                    let _ = handle.join();
                }
            }
        }
    }

    /// Replace the endpoint. A live session restarts on the new endpoint;
    /// otherwise the endpoint is only remembered.
    pub fn set_endpoint(&mut self, endpoint: StreamEndpoint) -> Result<()> {
        let active = self.session.is_some() && !self.state().is_terminal();
        if !active {
            self.shared.lock().learned_hint = None;
            self.endpoint = Some(endpoint);
            return Ok(());
        }
        if self.endpoint.as_ref().map(|e| e.url.as_str()) == Some(endpoint.url.as_str()) {
            return Ok(());
        }
        self.start(endpoint)
    }

    /// Restart the last endpoint (after `Error`, `Stopped`, or `set_endpoint`
    /// while idle), keeping the ICY hint learned by its last negotiation
    pub fn restart(&mut self) -> Result<()> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| RelayError::Config("no endpoint to start".to_string()))?;
        self.start(endpoint)
    }

    pub fn subscribe(&self) -> Receiver<RelayEvent> {
        self.shared.bus.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    /// Last published metadata record of the session
    pub fn metadata(&self) -> Option<MetadataRecord> {
        self.shared.lock().metadata.clone()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.metadata().as_ref().and_then(NowPlaying::from_record)
    }

    /// Info of the live upstream connection
    pub fn stream_info(&self) -> Option<NegotiatedStreamInfo> {
        self.shared
            .stream_info
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Demuxed audio bytes pushed into the buffer during this session
    pub fn bytes_delivered(&self) -> u64 {
        self.shared.bytes_delivered.load(Ordering::SeqCst)
    }

    /// Current endpoint, with the ICY hint learned from the last
    /// negotiation once one has happened
    pub fn endpoint(&self) -> Option<StreamEndpoint> {
        let learned = self.shared.lock().learned_hint;
        self.endpoint.clone().map(|e| match learned {
            Some(hint) => e.with_icecast_hint(hint),
            None => e,
        })
    }

    /// Buffer of the current session, if any
    pub fn buffer(&self) -> Option<Arc<StreamBuffer>> {
        self.session.as_ref().map(|s| s.buffer.clone())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub(crate) fn stream_info_handle(&self) -> SharedStreamInfo {
        self.shared.stream_info.clone()
    }

    pub(crate) fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }
}

impl Drop for IcecastReader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The receive thread of one session
struct Worker {
    session: u64,
    shared: Arc<Shared>,
    cancel: Arc<AtomicBool>,
    buffer: Arc<StreamBuffer>,
    config: RelayConfig,
    /// Hint updated by each negotiation
    endpoint: StreamEndpoint,
    last_metadata: Option<MetadataRecord>,
    throttle: ProgressThrottle,
    delivered: u64,
}

/// Per-connection bookkeeping of the receive loop
struct Connection {
    pushed: usize,
    streaming: bool,
}

impl Worker {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        self.shared
            .publish(self.session, |view, events| Shared::transition(view, next, events))
    }

    /// Settle in `Error`. Closing the buffer ends the local client's body.
    fn fail(&self, err: &RelayError) {
        warn!(error = %err, "giving up");
        self.buffer.close();
        self.set_state(ConnectionState::Error(err.to_string()));
    }

    fn run(mut self) {
        let negotiator = match ConnectionNegotiator::new(&self.config) {
            Ok(n) => n,
            Err(e) => return self.fail(&e),
        };

        let mut connected_once = false;
        let mut failures: u32 = 0;
        loop {
            if self.cancelled() || !self.set_state(ConnectionState::Connecting) {
                return;
            }

            let err = match self.connect_and_stream(&negotiator, &mut connected_once, &mut failures)
            {
                Ok(()) => return,
                Err(e) => e,
            };
            if self.cancelled() {
                return;
            }

            self.flush_progress();
            let status = self.buffer.status();
            debug!(
                level = status.level_bytes,
                pushed = status.total_pushed,
                popped = status.total_popped,
                "dropping buffered audio of the lost connection"
            );
            self.buffer.clear();
            let shared = &self.shared;
            shared.publish(self.session, |_, _| shared.set_stream_info(None));

            if !err.is_connectivity() || !connected_once {
                return self.fail(&err);
            }
            failures += 1;
            if failures > self.config.max_retries {
                warn!(retries = self.config.max_retries, "reconnect attempts exhausted");
                return self.fail(&err);
            }
            warn!(
                attempt = failures,
                max_retries = self.config.max_retries,
                error = %err,
                "upstream lost, reconnecting"
            );
            if !self.set_state(ConnectionState::Reconnecting) {
                return;
            }
            if !sleep_unless_cancelled(self.config.retry_delay, &self.cancel) {
                return;
            }
        }
    }

    /// One upstream connection. `Ok` means the session was cancelled; `Err`
    /// is the fault that ended the connection.
    fn connect_and_stream(
        &mut self,
        negotiator: &ConnectionNegotiator,
        connected_once: &mut bool,
        failures: &mut u32,
    ) -> Result<()> {
        let (info, mut response) = negotiator.negotiate(&self.endpoint)?;
        if self.cancelled() {
            return Ok(());
        }
        *connected_once = true;
        self.endpoint.icecast_hint = info.is_icecast;

        let mut demuxer = IcyDemuxer::new(info.meta_interval);
        let shared = &self.shared;
        let published = shared.publish(self.session, |view, events| {
            view.learned_hint = Some(info.is_icecast);
            shared.set_stream_info(Some(info.clone()));
            events.push(RelayEvent::IcecastDetected(info.is_icecast));
            events.push(RelayEvent::StreamInfo(info));
            Shared::transition(view, ConnectionState::Buffering, events);
        });
        if !published {
            return Ok(());
        }

        let mut conn = Connection {
            pushed: 0,
            streaming: false,
        };
        let mut read_buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            if self.cancelled() {
                return Ok(());
            }
            let n = match response.read(&mut read_buf) {
                Ok(0) => {
                    close_connection(&mut demuxer);
                    return Err(RelayError::StreamEnded);
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    close_connection(&mut demuxer);
                    return Err(classify_read_error(e));
                }
            };

            for event in demuxer.feed(&read_buf[..n]) {
                match event {
                    DemuxEvent::Audio(audio) => {
                        if !self.deliver(audio, &mut conn, failures) {
                            return Ok(());
                        }
                    }
                    DemuxEvent::Metadata(record) => self.publish_metadata(record),
                }
            }
        }
    }

    /// Push demuxed audio, leaving `Buffering` exactly when the connection
    /// has buffered `ready_threshold` bytes. Returns false once the session
    /// is over.
    fn deliver(&mut self, mut audio: AudioChunk, conn: &mut Connection, failures: &mut u32) -> bool {
        if !conn.streaming {
            let needed = self.config.ready_threshold.saturating_sub(conn.pushed);
            if audio.len() >= needed {
                let head = AudioChunk::new(audio.offset, audio.data.split_to(needed));
                audio.offset += needed as u64;
                if !self.push(head, conn) || !self.enter_streaming() {
                    return false;
                }
                conn.streaming = true;
                *failures = 0;
            }
        }
        self.push(audio, conn)
    }

    fn push(&mut self, audio: AudioChunk, conn: &mut Connection) -> bool {
        if audio.is_empty() {
            return true;
        }
        let len = audio.len();
        // Fails only once stop() closed the buffer
        if self.buffer.push(audio).is_err() {
            return false;
        }
        conn.pushed += len;
        self.delivered += len as u64;

        let delivered = self.delivered;
        let progress = self.throttle.update(delivered);
        let shared = &self.shared;
        shared.publish(self.session, |_, events| {
            shared.bytes_delivered.store(delivered, Ordering::SeqCst);
            if let Some(bytes) = progress {
                events.push(RelayEvent::ProgressChanged(bytes));
            }
        })
    }

    fn enter_streaming(&self) -> bool {
        debug!(threshold = self.config.ready_threshold, "buffer ready");
        self.shared.publish(self.session, |view, events| {
            Shared::transition(view, ConnectionState::Streaming, events);
            events.push(RelayEvent::BufferReady);
        })
    }

    fn flush_progress(&mut self) {
        if let Some(bytes) = self.throttle.flush(self.delivered) {
            self.shared.publish(self.session, |_, events| {
                events.push(RelayEvent::ProgressChanged(bytes));
            });
        }
    }

    fn publish_metadata(&mut self, record: MetadataRecord) {
        if self.last_metadata.as_ref() == Some(&record) {
            trace!("metadata unchanged");
            return;
        }
        if let Some(np) = NowPlaying::from_record(&record) {
            info!(
                artist = np.artist.as_deref().unwrap_or(""),
                title = np.title.as_deref().unwrap_or(""),
                "now playing"
            );
        }
        self.last_metadata = Some(record.clone());
        self.shared.publish(self.session, |view, events| {
            view.metadata = Some(record.clone());
            events.push(RelayEvent::MetadataChanged(record));
        });
    }
}

fn close_connection(demuxer: &mut IcyDemuxer) {
    demuxer.finish();
    debug!(
        audio_bytes = demuxer.audio_bytes(),
        metadata_blocks = demuxer.metadata_blocks(),
        "upstream connection closed"
    );
}
