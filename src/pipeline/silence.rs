//! # Utterance Boundary Detection
//!
//! Optional energy-based end-of-utterance detection. When enabled, an
//! utterance ends once speech has been heard and the input then stays below
//! the RMS `threshold` for `silence_ms`. When disabled (the default), only an
//! explicit `stop` from the client ends an utterance.

use crate::session::buffer::AudioFormat;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilenceSettings {
    pub enabled: bool,
    /// RMS level (0.0 to 1.0) below which a chunk counts as silence
    pub threshold: f32,
    /// Silence needed after speech to close the utterance
    pub silence_ms: u64,
}

impl Default for SilenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.01,
            silence_ms: 800,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SilenceDetector {
    settings: SilenceSettings,
    format: AudioFormat,
    heard_speech: bool,
    silent_bytes: usize,
}

impl SilenceDetector {
    pub fn new(settings: SilenceSettings, format: AudioFormat) -> Self {
        Self {
            settings,
            format,
            heard_speech: false,
            silent_bytes: 0,
        }
    }

    /// Feed one input chunk. Returns true when the chunk completes an
    /// utterance; the detector then resets itself.
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        if !self.settings.enabled || chunk.is_empty() {
            return false;
        }

        let level = rms(chunk, &self.format);
        if level >= self.settings.threshold {
            self.heard_speech = true;
            self.silent_bytes = 0;
            return false;
        }

        if !self.heard_speech {
            return false;
        }

        // Counted in bytes so chunks shorter than a millisecond still add up
        self.silent_bytes += chunk.len();
        let needed = self.format.bytes_for_ms(self.settings.silence_ms).max(1);
        if self.silent_bytes >= needed {
            self.reset();
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.heard_speech = false;
        self.silent_bytes = 0;
    }
}

/// Root-mean-square level of a PCM chunk, normalized to 0.0..=1.0.
pub fn rms(chunk: &[u8], format: &AudioFormat) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;

    if format.bit_depth == 8 {
        // 8-bit PCM is unsigned, centered on 128
        for &byte in chunk {
            let sample = (byte as f64 - 128.0) / 128.0;
            sum += sample * sample;
            count += 1;
        }
    } else {
        let mut cursor = Cursor::new(chunk);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            let sample = sample as f64 / 32768.0;
            sum += sample * sample;
            count += 1;
        }
    }

    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn enabled() -> SilenceSettings {
        SilenceSettings { enabled: true, threshold: 0.05, silence_ms: 100 }
    }

    #[test]
    fn test_rms_levels() {
        let format = AudioFormat::default();
        assert_eq!(rms(&pcm(&[0; 160]), &format), 0.0);
        let loud = rms(&pcm(&[16384, -16384, 16384, -16384]), &format);
        assert!((loud - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_disabled_never_reports_a_boundary() {
        let mut detector = SilenceDetector::new(SilenceSettings::default(), AudioFormat::default());
        assert!(!detector.observe(&pcm(&[12000; 1600])));
        assert!(!detector.observe(&pcm(&[0; 16000])));
    }

    #[test]
    fn test_boundary_after_speech_then_silence() {
        let mut detector = SilenceDetector::new(enabled(), AudioFormat::default());
        // 50ms chunks at 16kHz = 800 samples
        assert!(!detector.observe(&pcm(&[10000; 800])));
        assert!(!detector.observe(&pcm(&[0; 800])));
        assert!(detector.observe(&pcm(&[0; 800])));
        // Reset after reporting
        assert!(!detector.observe(&pcm(&[0; 800])));
    }

    #[test]
    fn test_sub_millisecond_chunks_add_up() {
        let mut detector = SilenceDetector::new(enabled(), AudioFormat::default());
        assert!(!detector.observe(&pcm(&[10000; 800])));
        // 100ms of silence delivered as 8-sample (0.5ms) chunks
        for _ in 0..199 {
            assert!(!detector.observe(&pcm(&[0; 8])));
        }
        assert!(detector.observe(&pcm(&[0; 8])));
    }

    #[test]
    fn test_leading_silence_is_not_a_boundary() {
        let mut detector = SilenceDetector::new(enabled(), AudioFormat::default());
        for _ in 0..10 {
            assert!(!detector.observe(&pcm(&[0; 800])));
        }
    }
}
