//! # Output Audio Batching
//!
//! Coalesces bursts of synthesized audio before they go to the client.
//! Each new chunk pushes the flush deadline out to `debounce` after its
//! arrival (a trailing debounce), and a batch is never held longer than
//! `max_delay` after its first chunk, so a provider that streams steadily
//! still reaches the client.
//!
//! ## Example (debounce = 300ms):
//! ```text
//! chunk @0ms   -> deadline 300ms
//! chunk @120ms -> deadline 420ms   => flush [1, 2] at 420ms
//! chunk @500ms -> deadline 800ms   => flush [3]    at 800ms
//! ```
//!
//! Chunks are concatenated in arrival order; batching never reorders audio.

use actix_web::web::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct OutputBatcher {
    debounce: Duration,
    max_delay: Duration,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl OutputBatcher {
    pub fn new(debounce: Duration, max_delay: Duration) -> Self {
        Self {
            debounce,
            max_delay: max_delay.max(debounce),
            pending: VecDeque::new(),
            pending_bytes: 0,
            first_at: None,
            last_at: None,
        }
    }

    /// Queue a chunk that arrived at `now`.
    pub fn push(&mut self, chunk: Bytes, now: Instant) {
        if chunk.is_empty() {
            return;
        }
        self.first_at.get_or_insert(now);
        self.last_at = Some(now);
        self.pending_bytes += chunk.len();
        self.pending.push_back(chunk);
    }

    /// When the pending batch should be flushed, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first_at?;
        let last = self.last_at?;
        Some((last + self.debounce).min(first + self.max_delay))
    }

    /// Take the pending chunks as one contiguous batch.
    pub fn take(&mut self) -> Option<Bytes> {
        self.first_at = None;
        self.last_at = None;

        match self.pending.len() {
            0 => None,
            1 => {
                self.pending_bytes = 0;
                self.pending.pop_front()
            }
            _ => {
                let mut batch = Vec::with_capacity(self.pending_bytes);
                for chunk in self.pending.drain(..) {
                    batch.extend_from_slice(&chunk);
                }
                self.pending_bytes = 0;
                Some(Bytes::from(batch))
            }
        }
    }

    /// Drop anything pending (used when the client cancels playback).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        self.first_at = None;
        self.last_at = None;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
