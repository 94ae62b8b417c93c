//! Loopback HTTP proxy
//!
//! Re-serves the demuxed audio in the `StreamBuffer` to one local client as
//! a plain, unframed HTTP body. The client never sees ICY framing or
//! `icy-*` headers.
//!
//! Architecture:
//!   accept thread (nonblocking listener, polls the shutdown flag)
//!        ↓ one thread per session; a newcomer replaces the current client
//!   ProxySession: request head → wait for stream info → 200 head → pop/write loop

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::buffer::WAIT_SLICE_MS;
use crate::config::network::READ_CHUNK_SIZE;
use crate::config::proxy::{ACCEPT_POLL_MS, MAX_REQUEST_HEAD_BYTES, REQUEST_READ_TIMEOUT_SECS};
use crate::config::{RelayConfig, SessionPolicy};
use crate::error::{RelayError, Result};
use crate::stream::buffer::StreamBuffer;
use crate::stream::types::SharedStreamInfo;

/// What every session of one server reads from
struct ProxyContext {
    buffer: Arc<StreamBuffer>,
    stream_info: SharedStreamInfo,
    fallback_content_type: String,
    policy: SessionPolicy,
}

impl ProxyContext {
    /// Content type of the live connection, `None` while disconnected
    fn content_type(&self) -> Option<String> {
        let guard = self
            .stream_info
            .read()
            .unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|info| {
            info.content_type
                .clone()
                .unwrap_or_else(|| self.fallback_content_type.clone())
        })
    }
}

/// The attached local client
struct ActiveSession {
    peer: SocketAddr,
    cancel: Arc<AtomicBool>,
    /// Clone of the client socket, used to interrupt blocked writes
    socket: TcpStream,
    handle: JoinHandle<()>,
}

impl ActiveSession {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the session, drop the client connection and wait for the thread
    fn close(self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.socket.shutdown(Shutdown::Both);
        let _ = self.handle.join();
    }
}

type SessionSlot = Arc<Mutex<Option<ActiveSession>>>;

fn lock_slot(slot: &SessionSlot) -> MutexGuard<'_, Option<ActiveSession>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Loopback HTTP server feeding one local client from a `StreamBuffer`.
///
/// Binds `127.0.0.1` on `bind_port` (0 picks an ephemeral port). The
/// listening port is released by `shutdown()` or on drop.
pub struct LocalProxyServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: SessionSlot,
    accept_handle: Option<JoinHandle<()>>,
}

impl LocalProxyServer {
    pub fn bind(
        config: &RelayConfig,
        buffer: Arc<StreamBuffer>,
        stream_info: SharedStreamInfo,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.bind_port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let context = Arc::new(ProxyContext {
            buffer,
            stream_info,
            fallback_content_type: config.fallback_content_type.clone(),
            policy: config.session_policy,
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let active: SessionSlot = Arc::new(Mutex::new(None));

        let accept_handle = {
            let shutdown = shutdown.clone();
            let active = active.clone();
            thread::Builder::new()
                .name("icy-proxy-accept".to_string())
                .spawn(move || accept_loop(listener, context, active, shutdown))?
        };
        info!(%addr, "local proxy listening");

        Ok(Self {
            addr,
            shutdown,
            active,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// URL the playback component should open
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Address of the attached client, if one is being served
    pub fn client_addr(&self) -> Option<SocketAddr> {
        lock_slot(&self.active)
            .as_ref()
            .filter(|s| s.is_live())
            .map(|s| s.peer)
    }

    pub fn has_client(&self) -> bool {
        self.client_addr().is_some()
    }

    /// Stop accepting, release the port and close the attached client
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
            info!(addr = %self.addr, "local proxy closed");
        }
        let session = lock_slot(&self.active).take();
        if let Some(session) = session {
            session.close();
        }
    }
}

impl Drop for LocalProxyServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    context: Arc<ProxyContext>,
    active: SessionSlot,
    shutdown: Arc<AtomicBool>,
) {
    let poll = Duration::from_millis(ACCEPT_POLL_MS);
    let mut next_id: u64 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                next_id += 1;
                if let Err(e) = attach(next_id, stream, peer, &context, &active) {
                    warn!(%peer, error = %e, "could not attach proxy client");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) => {
                warn!(error = %e, "proxy accept failed");
                thread::sleep(poll);
            }
        }
    }
    debug!("proxy accept loop finished");
}

fn attach(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    context: &Arc<ProxyContext>,
    active: &SessionSlot,
) -> Result<()> {
    // Accepted sockets may inherit the listener's nonblocking mode
    stream.set_nonblocking(false)?;

    let mut slot = lock_slot(active);
    if let Some(current) = slot.take() {
        if current.is_live() && context.policy == SessionPolicy::Reject {
            *slot = Some(current);
            drop(slot);
            warn!(%peer, "{}", RelayError::TooManyClients);
            thread::Builder::new()
                .name(format!("icy-proxy-reject-{}", id))
                .spawn(move || reject(stream))?;
            return Ok(());
        }
        if current.is_live() {
            info!(old = %current.peer, new = %peer, "replacing proxy client");
        }
        current.close();
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let socket = stream.try_clone()?;
    let handle = {
        let context = context.clone();
        let cancel = cancel.clone();
        thread::Builder::new()
            .name(format!("icy-proxy-{}", id))
            .spawn(move || {
                let mut stream = stream;
                let result = serve(&mut stream, &context, &cancel);
                // The slot keeps a clone of the socket, so dropping ours
                // alone would not end the connection
                let _ = stream.shutdown(Shutdown::Both);
                match result {
                    Ok(sent) => debug!(%peer, bytes = sent, "proxy client detached"),
                    Err(e) => debug!(%peer, error = %e, "proxy session ended"),
                }
            })?
    };
    debug!(%peer, id, "proxy client attached");
    *slot = Some(ActiveSession {
        peer,
        cancel,
        socket,
        handle,
    });
    Ok(())
}

/// Serve one client until it disconnects, the session is cancelled or the
/// buffer is closed. Returns the number of body bytes written.
fn serve(stream: &mut TcpStream, context: &ProxyContext, cancel: &AtomicBool) -> Result<u64> {
    stream.set_read_timeout(Some(Duration::from_secs(REQUEST_READ_TIMEOUT_SECS)))?;
    let request = read_request(stream)?;
    debug!(method = %request.method, path = %request.path, "proxy request");

    let head_only = match request.method.as_str() {
        "GET" => false,
        "HEAD" => true,
        _ => {
            write_status(stream, 405, "Method Not Allowed")?;
            return Ok(0);
        }
    };

    let Some(content_type) = wait_for_content_type(context, cancel) else {
        return Ok(0);
    };
    stream.write_all(response_head(&content_type).as_bytes())?;
    if head_only {
        return Ok(0);
    }

    let slice = Duration::from_millis(WAIT_SLICE_MS);
    let mut sent: u64 = 0;
    while !cancel.load(Ordering::SeqCst) {
        match context.buffer.pop_timeout(READ_CHUNK_SIZE, slice) {
            Some(bytes) => {
                if let Err(e) = stream.write_all(&bytes) {
                    // Client going away is a normal end of session
                    debug!(error = %e, "proxy client closed the connection");
                    return Ok(sent);
                }
                sent += bytes.len() as u64;
            }
            None if context.buffer.is_closed() => break,
            None => {}
        }
    }
    Ok(sent)
}

/// Wait until the upstream connection is negotiated so the response can
/// carry its content type.
fn wait_for_content_type(context: &ProxyContext, cancel: &AtomicBool) -> Option<String> {
    let slice = Duration::from_millis(WAIT_SLICE_MS);
    loop {
        if cancel.load(Ordering::SeqCst) || context.buffer.is_closed() {
            return None;
        }
        if let Some(content_type) = context.content_type() {
            return Some(content_type);
        }
        thread::sleep(slice);
    }
}

fn response_head(content_type: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store\r\nAccept-Ranges: none\r\n\r\n",
        content_type
    )
}

fn reject(mut stream: TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(REQUEST_READ_TIMEOUT_SECS)));
    let _ = read_request(&mut stream);
    let _ = write_status(&mut stream, 503, "Service Unavailable");
}

struct ProxyRequest {
    method: String,
    path: String,
}

fn read_request(stream: &mut TcpStream) -> io::Result<ProxyRequest> {
    let limited = stream.try_clone()?.take(MAX_REQUEST_HEAD_BYTES as u64);
    let mut reader = BufReader::new(limited);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "missing request line",
        ));
    }
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing method"))?
        .to_ascii_uppercase();
    let path = parts.next().unwrap_or("/").to_string();

    // Headers are not needed; read up to the blank line
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head truncated or too large",
            ));
        }
        if line.trim_end_matches(&['\r', '\n'][..]).is_empty() {
            break;
        }
    }

    Ok(ProxyRequest { method, path })
}

fn write_status(stream: &mut TcpStream, status: u16, message: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, message
    );
    stream.write_all(response.as_bytes())
}
