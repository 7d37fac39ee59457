//! # Input Audio Buffer
//!
//! Bounded ring buffer holding the microphone audio of the utterance in
//! progress. When a client keeps streaming past the configured maximum
//! utterance length, the oldest audio is discarded in whole sample frames so
//! the buffer never grows without bound and never splits a sample.

use std::collections::VecDeque;

/// Audio format negotiated out of band (fixed by configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second (e.g. 16000)
    pub sample_rate: u32,
    /// Number of interleaved channels (1 for mono)
    pub channels: u8,
    /// Bits per sample (8 or 16)
    pub bit_depth: u8,
}

impl AudioFormat {
    /// Bytes in one sample frame (one sample for every channel).
    pub fn frame_bytes(&self) -> usize {
        (self.bit_depth as usize / 8).max(1) * self.channels.max(1) as usize
    }

    /// Bytes per second of audio in this format.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }

    /// Byte length of `duration_ms` of audio, rounded down to whole frames.
    pub fn bytes_for_ms(&self, duration_ms: u64) -> usize {
        let raw = (self.bytes_per_second() as u64 * duration_ms / 1000) as usize;
        raw - raw % self.frame_bytes()
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000, // 16kHz mono 16-bit PCM, what browsers downsample to
            channels: 1,
            bit_depth: 16,
        }
    }
}

/// Ring buffer of raw input audio bytes.
///
/// ## Ownership:
/// Owned by the session relay task alone, so there is no lock here (unlike
/// a buffer shared between a socket thread and a worker thread).
#[derive(Debug)]
pub struct AudioRingBuffer {
    data: VecDeque<u8>,
    format: AudioFormat,
    max_bytes: usize,
    dropped_bytes: u64,
}

impl AudioRingBuffer {
    /// Create a buffer that holds at most `max_utterance_ms` of audio.
    pub fn new(format: AudioFormat, max_utterance_ms: u64) -> Self {
        let max_bytes = format.bytes_for_ms(max_utterance_ms).max(format.frame_bytes());
        Self {
            data: VecDeque::with_capacity(max_bytes.min(64 * 1024)),
            format,
            max_bytes,
            dropped_bytes: 0,
        }
    }

    /// Append a chunk, returning how many old bytes were discarded to make room.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        self.data.extend(chunk.iter().copied());

        if self.data.len() <= self.max_bytes {
            return 0;
        }

        // Round the overflow up to whole frames
        let frame = self.format.frame_bytes();
        let overflow = self.data.len() - self.max_bytes;
        let to_drop = (overflow.div_ceil(frame) * frame).min(self.data.len());
        self.data.drain(..to_drop);
        self.dropped_bytes += to_drop as u64;
        to_drop
    }

    /// Drain the buffered utterance in arrival order.
    pub fn take(&mut self) -> Vec<u8> {
        self.data.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total bytes discarded over the buffer's lifetime.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }
}
