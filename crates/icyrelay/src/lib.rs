//! icyrelay: Icecast/Shoutcast relay engine
//!
//! Connects to an ICY radio stream, strips the interleaved metadata, and
//! re-serves the clean audio on a loopback HTTP URL while publishing
//! now-playing, progress and connection-state events.
//!
//! ## Quick start
//!
//! ```no_run
//! use icyrelay::{IcecastProxy, RelayConfig, RelayEvent, StreamEndpoint};
//!
//! let mut relay = IcecastProxy::new(RelayConfig::default())?;
//! let events = relay.subscribe();
//! let url = relay.start(StreamEndpoint::new("http://radio.example/live"))?;
//! println!("play {}", url);
//! for event in events.iter() {
//!     if let RelayEvent::MetadataChanged(record) = event {
//!         println!("{:?}", record.stream_title());
//!     }
//! }
//! # Ok::<(), icyrelay::RelayError>(())
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod proxy;
pub mod reader;
pub mod relay;
pub mod stream;

#[cfg(test)]
mod testutil;

pub use config::{RelayConfig, SessionPolicy};
pub use error::{RelayError, Result};
pub use events::{EventBus, RelayEvent};
pub use proxy::LocalProxyServer;
pub use reader::IcecastReader;
pub use relay::IcecastProxy;
pub use stream::{
    AudioChunk, ConnectionState, MetadataRecord, NegotiatedStreamInfo, NowPlaying, StreamEndpoint,
};
