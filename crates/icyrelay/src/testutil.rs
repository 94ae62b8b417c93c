//! Loopback fixtures shared by the unit tests

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A scripted upstream HTTP server on `127.0.0.1:0`.
///
/// Every accepted connection gets its own thread; the handler receives the
/// connection index, the raw request head and the socket.
pub(crate) struct FakeUpstream {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeUpstream {
    pub(crate) fn spawn<F>(handler: F) -> Self
    where
        F: Fn(usize, String, TcpStream) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake upstream");
        let addr = listener.local_addr().expect("fake upstream addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let reqs = requests.clone();
        let conns = connections.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let index = conns.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                let reqs = reqs.clone();
                thread::spawn(move || {
                    let request = read_head(&mut stream);
                    reqs.lock().unwrap().push(request.clone());
                    handler(index, request, stream);
                });
            }
        });

        Self {
            addr,
            requests,
            connections,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}/stream", self.addr)
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Response head with the given status and headers
pub(crate) fn http_head(status: u16, headers: &[(&str, &str)]) -> String {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    head
}

/// Read an HTTP request or response head up to the blank line
pub(crate) fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// A port nothing listens on
pub(crate) fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    listener.local_addr().expect("probe addr").port()
}

/// Metadata block for `text`: length byte plus null padding
pub(crate) fn icy_block(text: &str) -> Vec<u8> {
    let blocks = text.len().div_ceil(16);
    let mut v = vec![blocks as u8];
    v.extend_from_slice(text.as_bytes());
    v.resize(1 + blocks * 16, 0);
    v
}

/// Deterministic audio-like bytes
pub(crate) fn audio_pattern(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((seed * 131 + i * 7) % 251) as u8).collect()
}

/// Local client for the proxy: sends a GET and returns the response head and socket
pub(crate) fn proxy_get(url: &str) -> (String, BufReader<TcpStream>) {
    let addr = url
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string();
    let mut stream = TcpStream::connect(&addr).expect("connect to proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    stream
        .write_all(format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", addr).as_bytes())
        .expect("send request");
    let mut reader = BufReader::new(stream);
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }
    (head, reader)
}

/// Read exactly `n` body bytes
pub(crate) fn read_exact_bytes(reader: &mut impl Read, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf).expect("read body bytes");
    buf
}

/// Poll `cond` until it holds or `timeout` passes
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
