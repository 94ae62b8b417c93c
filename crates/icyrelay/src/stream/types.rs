//! Stream types
//!
//! Core types shared by negotiation, demuxing, buffering and the reader.

use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

/// A remote stream plus whether it should be treated as ICY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub url: String,
    /// Request interleaved ICY metadata (`Icy-MetaData: 1`)
    pub icecast_hint: bool,
}

impl StreamEndpoint {
    /// Endpoint treated as ICY until negotiation says otherwise
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            icecast_hint: true,
        }
    }

    pub fn with_icecast_hint(mut self, hint: bool) -> Self {
        self.icecast_hint = hint;
        self
    }
}

/// What the server told us about the stream on connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedStreamInfo {
    /// Final URL after redirects
    pub url: String,
    /// Audio bytes between metadata blocks; 0 when the server is not ICY
    pub meta_interval: usize,
    pub is_icecast: bool,
    pub content_type: Option<String>,
    pub station_name: Option<String>,
    pub genre: Option<String>,
    /// Declared bitrate in kbps
    pub bitrate: Option<u32>,
}

impl NegotiatedStreamInfo {
    /// Short codec name derived from the declared content type
    pub fn format_hint(&self) -> Option<&'static str> {
        let ct = self.content_type.as_deref()?.to_ascii_lowercase();
        if ct.contains("audio/mpeg") || ct.contains("audio/mp3") {
            Some("mp3")
        } else if ct.contains("audio/aac") || ct.contains("audio/aacp") {
            Some("aac")
        } else if ct.contains("audio/ogg") || ct.contains("application/ogg") {
            Some("ogg")
        } else if ct.contains("audio/flac") {
            Some("flac")
        } else if ct.contains("audio/opus") {
            Some("opus")
        } else {
            None
        }
    }
}

/// Info of the live upstream connection, `None` while disconnected
pub type SharedStreamInfo = Arc<RwLock<Option<NegotiatedStreamInfo>>>;

/// A run of demuxed audio bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Position of the first byte within the demuxed audio stream
    pub offset: u64,
    pub data: Bytes,
}

impl AudioChunk {
    pub fn new(offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lifecycle of an `IcecastReader` session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Buffering,
    Streaming,
    Reconnecting,
    /// Retries exhausted; carries a human-readable reason
    Error(String),
    Stopped,
}

impl ConnectionState {
    /// `Error` and `Stopped` only leave through a new `start()`
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Error(_) | ConnectionState::Stopped)
    }

    /// Whether the session is waiting for audio
    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Buffering | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Buffering => write!(f, "Buffering"),
            ConnectionState::Streaming => write!(f, "Streaming"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Error(msg) => write!(f, "Error: {}", msg),
            ConnectionState::Stopped => write!(f, "Stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with_type(ct: Option<&str>) -> NegotiatedStreamInfo {
        NegotiatedStreamInfo {
            url: "http://example.com/stream".to_string(),
            meta_interval: 0,
            is_icecast: false,
            content_type: ct.map(str::to_string),
            station_name: None,
            genre: None,
            bitrate: None,
        }
    }

    #[test]
    fn endpoint_defaults_to_icy() {
        let e = StreamEndpoint::new("http://radio.test/live");
        assert!(e.icecast_hint);
        assert!(!e.with_icecast_hint(false).icecast_hint);
    }

    #[test]
    fn format_hint_from_content_type() {
        assert_eq!(info_with_type(Some("audio/mpeg")).format_hint(), Some("mp3"));
        assert_eq!(info_with_type(Some("audio/aacp")).format_hint(), Some("aac"));
        assert_eq!(info_with_type(Some("application/ogg")).format_hint(), Some("ogg"));
        assert_eq!(info_with_type(Some("Audio/FLAC")).format_hint(), Some("flac"));
        assert_eq!(info_with_type(Some("text/html")).format_hint(), None);
        assert_eq!(info_with_type(None).format_hint(), None);
    }

    #[test]
    fn audio_chunk_len() {
        let c = AudioChunk::new(10, vec![1u8, 2, 3]);
        assert_eq!(c.len(), 3);
        assert_eq!(c.offset, 10);
        assert!(!c.is_empty());
        assert!(AudioChunk::new(0, Vec::new()).is_empty());
    }

    #[test]
    fn state_classification() {
        assert!(ConnectionState::Stopped.is_terminal());
        assert!(ConnectionState::Error("x".into()).is_terminal());
        assert!(!ConnectionState::Streaming.is_terminal());
        assert!(ConnectionState::Reconnecting.is_loading());
        assert!(!ConnectionState::Idle.is_loading());
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Streaming.to_string(), "Streaming");
        assert_eq!(
            ConnectionState::Error("HTTP 404".into()).to_string(),
            "Error: HTTP 404"
        );
    }
}
