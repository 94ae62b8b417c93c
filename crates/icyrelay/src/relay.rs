//! Reader + proxy façade
//!
//! `IcecastProxy` pairs an `IcecastReader` with a `LocalProxyServer` so a
//! playback component only needs one local URL. Both halves publish on the
//! same event bus.

use crossbeam_channel::Receiver;
use tracing::info;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::events::RelayEvent;
use crate::proxy::LocalProxyServer;
use crate::reader::IcecastReader;
use crate::stream::metadata::{MetadataRecord, NowPlaying};
use crate::stream::types::{ConnectionState, NegotiatedStreamInfo, StreamEndpoint};

/// One remote station re-served on a loopback URL
pub struct IcecastProxy {
    reader: IcecastReader,
    proxy: Option<LocalProxyServer>,
}

impl IcecastProxy {
    pub fn new(config: RelayConfig) -> Result<Self> {
        Ok(Self {
            reader: IcecastReader::new(config)?,
            proxy: None,
        })
    }

    /// Start relaying `endpoint` and return the local URL.
    ///
    /// Any current session is stopped first; the new session gets a fresh
    /// buffer and listener, and `ProxyUrlReady` is published.
    pub fn start(&mut self, endpoint: StreamEndpoint) -> Result<String> {
        self.stop();

        let buffer = self.reader.start_session(endpoint)?;
        let proxy = match LocalProxyServer::bind(
            self.reader.config(),
            buffer,
            self.reader.stream_info_handle(),
        ) {
            Ok(proxy) => proxy,
            Err(e) => {
                self.reader.stop();
                return Err(e);
            }
        };

        let url = proxy.url();
        info!(%url, "proxy URL ready");
        self.reader.bus().emit(RelayEvent::ProxyUrlReady(url.clone()));
        self.proxy = Some(proxy);
        Ok(url)
    }

    /// `start` from a URL and an explicit ICY hint
    pub fn start_url(&mut self, url: impl Into<String>, icecast_hint: bool) -> Result<String> {
        self.start(StreamEndpoint::new(url).with_icecast_hint(icecast_hint))
    }

    /// Close the local client, release the port, stop the network read and
    /// clear the buffer.
    pub fn stop(&mut self) {
        if let Some(mut proxy) = self.proxy.take() {
            proxy.shutdown();
        }
        self.reader.stop();
    }

    /// Switch stations. A live relay restarts on the new endpoint (and may
    /// get a new local URL); otherwise the endpoint is only remembered.
    pub fn set_endpoint(&mut self, endpoint: StreamEndpoint) -> Result<()> {
        let active = self.proxy.is_some() && !self.reader.state().is_terminal();
        let same_url = self
            .reader
            .endpoint()
            .is_some_and(|current| current.url == endpoint.url);
        if active && !same_url {
            self.start(endpoint).map(|_| ())
        } else {
            self.reader.set_endpoint(endpoint)
        }
    }

    pub fn subscribe(&self) -> Receiver<RelayEvent> {
        self.reader.subscribe()
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.proxy.as_ref().map(LocalProxyServer::url)
    }

    pub fn port(&self) -> Option<u16> {
        self.proxy.as_ref().map(LocalProxyServer::port)
    }

    pub fn state(&self) -> ConnectionState {
        self.reader.state()
    }

    pub fn metadata(&self) -> Option<MetadataRecord> {
        self.reader.metadata()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.reader.now_playing()
    }

    pub fn stream_info(&self) -> Option<NegotiatedStreamInfo> {
        self.reader.stream_info()
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.reader.bytes_delivered()
    }

    pub fn reader(&self) -> &IcecastReader {
        &self.reader
    }
}

impl Drop for IcecastProxy {
    fn drop(&mut self) {
        self.stop();
    }
}
