//! ICY demultiplexer
//!
//! Splits an interleaved ICY byte stream into audio chunks and metadata
//! records. Input may arrive in arbitrary fragments; partial audio runs,
//! length bytes and metadata blocks are carried over between `feed` calls.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::stream::metadata::{parse_icy_block, MetadataRecord};
use crate::stream::types::AudioChunk;

/// Output of the demuxer, in stream order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    Audio(AudioChunk),
    Metadata(MetadataRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Collecting the audio run before the next length byte
    Audio,
    /// Waiting for the metadata length byte
    Length,
    /// Collecting a metadata block of `len` bytes
    Metadata { len: usize },
}

/// Incremental ICY demuxer.
///
/// With `meta_interval == 0` every fragment is passed through as audio.
/// Otherwise each cycle consumes exactly `meta_interval` audio bytes (emitted
/// as one chunk), one length byte `L` and `L * 16` metadata bytes.
pub struct IcyDemuxer {
    meta_interval: usize,
    phase: Phase,
    audio: BytesMut,
    meta: Vec<u8>,
    /// Offset of the next audio byte to be emitted
    offset: u64,
    metadata_blocks: u64,
}

impl IcyDemuxer {
    pub fn new(meta_interval: usize) -> Self {
        Self {
            meta_interval,
            phase: Phase::Audio,
            audio: BytesMut::with_capacity(meta_interval),
            meta: Vec::new(),
            offset: 0,
            metadata_blocks: 0,
        }
    }

    pub fn meta_interval(&self) -> usize {
        self.meta_interval
    }

    /// Total audio bytes emitted so far
    pub fn audio_bytes(&self) -> u64 {
        self.offset
    }

    /// Metadata blocks with `L > 0` consumed so far (including malformed ones)
    pub fn metadata_blocks(&self) -> u64 {
        self.metadata_blocks
    }

    /// Consume one network fragment and return everything it completed.
    pub fn feed(&mut self, mut input: &[u8]) -> Vec<DemuxEvent> {
        let mut events = Vec::new();

        if self.meta_interval == 0 {
            if !input.is_empty() {
                events.push(DemuxEvent::Audio(self.emit_audio(Bytes::copy_from_slice(input))));
            }
            return events;
        }

        while !input.is_empty() {
            match self.phase {
                Phase::Audio => {
                    let wanted = self.meta_interval - self.audio.len();
                    let n = wanted.min(input.len());
                    self.audio.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    if self.audio.len() == self.meta_interval {
                        let run = self.audio.split().freeze();
                        events.push(DemuxEvent::Audio(self.emit_audio(run)));
                        self.phase = Phase::Length;
                    }
                }
                Phase::Length => {
                    let len = input[0] as usize * 16;
                    input = &input[1..];
                    if len == 0 {
                        self.phase = Phase::Audio;
                    } else {
                        self.meta.clear();
                        self.meta.reserve(len);
                        self.phase = Phase::Metadata { len };
                    }
                }
                Phase::Metadata { len } => {
                    let n = (len - self.meta.len()).min(input.len());
                    self.meta.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    if self.meta.len() == len {
                        self.metadata_blocks += 1;
                        match parse_icy_block(&self.meta) {
                            Ok(record) if !record.is_empty() => {
                                trace!(fields = record.len(), "metadata block parsed");
                                events.push(DemuxEvent::Metadata(record));
                            }
                            Ok(_) => {}
                            Err(e) => debug!("skipping metadata block: {}", e),
                        }
                        self.meta.clear();
                        self.phase = Phase::Audio;
                    }
                }
            }
        }

        events
    }

    /// Drop any partially assembled audio run or metadata block.
    ///
    /// Called when the byte source ends; returns how many buffered bytes
    /// were discarded. The demuxer is ready for a new cycle afterwards.
    pub fn finish(&mut self) -> usize {
        let discarded = match self.phase {
            Phase::Audio => self.audio.len(),
            Phase::Length => 0,
            Phase::Metadata { .. } => self.meta.len() + 1,
        };
        if discarded > 0 {
            debug!(discarded, "discarding partial ICY cycle");
        }
        self.audio.clear();
        self.meta.clear();
        self.phase = Phase::Audio;
        discarded
    }

    fn emit_audio(&mut self, data: Bytes) -> AudioChunk {
        let chunk = AudioChunk::new(self.offset, data);
        self.offset += chunk.len() as u64;
        chunk
    }
}
