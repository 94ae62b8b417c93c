//! Stream handling
//!
//! Upstream negotiation, ICY demultiplexing, metadata parsing and the
//! bounded buffer between the network thread and the local proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::retry::CANCEL_CHECK_MS;

pub mod buffer;
pub mod demux;
pub mod metadata;
pub mod negotiate;
pub mod types;

pub use buffer::{BufferStatus, StreamBuffer};
pub use demux::{DemuxEvent, IcyDemuxer};
pub use metadata::{parse_icy_block, MetadataRecord, NowPlaying};
pub use negotiate::{parse_icy_headers, ConnectionNegotiator};
pub use types::{AudioChunk, ConnectionState, NegotiatedStreamInfo, StreamEndpoint};

/// Sleep for `total`, checking `cancel` every few milliseconds.
/// Returns true if the full duration elapsed, false if cancelled early.
pub(crate) fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let interval = Duration::from_millis(CANCEL_CHECK_MS);
    let start = Instant::now();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let elapsed = start.elapsed();
        if elapsed >= total {
            return true;
        }
        std::thread::sleep((total - elapsed).min(interval));
    }
}
