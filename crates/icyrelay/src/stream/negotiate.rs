//! Connection negotiation
//!
//! Opens the upstream HTTP connection, requests interleaved ICY metadata and
//! reads the `icy-*` response headers.

use std::io;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::stream::types::{NegotiatedStreamInfo, StreamEndpoint};

const ICY_METADATA_HEADER: &str = "Icy-MetaData";

/// Opens upstream connections with ICY negotiation headers
pub struct ConnectionNegotiator {
    client: Client,
}

impl ConnectionNegotiator {
    /// Build the HTTP client.
    ///
    /// `connect_timeout` bounds DNS + TCP setup; `read_timeout` bounds the
    /// wait for response headers and for each body read afterwards.
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Connect to the endpoint and classify the server.
    ///
    /// Returns the stream info and the response whose body is the raw
    /// (possibly ICY-framed) byte stream.
    pub fn negotiate(&self, endpoint: &StreamEndpoint) -> Result<(NegotiatedStreamInfo, Response)> {
        let mut request = self.client.get(&endpoint.url);
        if endpoint.icecast_hint {
            request = request.header(ICY_METADATA_HEADER, "1");
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                RelayError::Timeout(format!("no response from {}", endpoint.url))
            } else if e.is_connect() {
                RelayError::Connection(format!("could not reach {}", endpoint.url))
            } else {
                RelayError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::HttpStatus(status.as_u16()));
        }

        let info = parse_icy_headers(response.url().as_str(), response.headers());
        if info.is_icecast {
            info!(
                url = %info.url,
                metaint = info.meta_interval,
                station = info.station_name.as_deref().unwrap_or(""),
                "Icecast/Shoutcast station"
            );
        } else {
            info!(url = %info.url, "not an Icecast/Shoutcast station, passing audio through");
        }
        debug!(content_type = ?info.content_type, bitrate = ?info.bitrate, "negotiated");

        Ok((info, response))
    }
}

/// Read stream properties from response headers.
///
/// A missing, unparsable or zero `icy-metaint` means the stream carries no
/// interleaved metadata.
pub fn parse_icy_headers(url: &str, headers: &HeaderMap) -> NegotiatedStreamInfo {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let meta_interval = text("icy-metaint")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    // Some servers send "128,128" (per-channel) bitrates
    let bitrate = text("icy-br").and_then(|v| {
        v.split(',')
            .next()
            .and_then(|first| first.trim().parse::<u32>().ok())
    });

    NegotiatedStreamInfo {
        url: url.to_string(),
        meta_interval,
        is_icecast: meta_interval > 0,
        content_type: text(CONTENT_TYPE.as_str()),
        station_name: text("icy-name"),
        genre: text("icy-genre"),
        bitrate,
    }
}

/// Map a body read failure onto the relay taxonomy
pub(crate) fn classify_read_error(err: io::Error) -> RelayError {
    let reqwest_timeout = err
        .get_ref()
        .and_then(|e| e.downcast_ref::<reqwest::Error>())
        .is_some_and(|e| e.is_timeout());
    if reqwest_timeout {
        return RelayError::Timeout("no data from upstream".to_string());
    }
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            RelayError::Timeout("no data from upstream".to_string())
        }
        io::ErrorKind::UnexpectedEof => RelayError::StreamEnded,
        _ => RelayError::Io(err),
    }
}
