//! Audio frame types and utilities

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Supported audio sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - telephony
    Hz8000,
    /// 16kHz - standard speech recognition
    #[default]
    Hz16000,
    /// 24kHz - common TTS output rate
    Hz24000,
    /// 48kHz - WebRTC native
    Hz48000,
}

impl SampleRate {
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Samples in a frame of the given duration
    pub fn samples_for(&self, frame: Duration) -> usize {
        (self.as_u32() as u128 * frame.as_millis() / 1000) as usize
    }
}

/// Which way a frame is travelling relative to the session.
///
/// Sequence numbers are strictly increasing per direction per session;
/// inbound and outbound counters are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Captured from the remote participant
    Inbound,
    /// Synthesized by the assistant, bound for the participant
    Outbound,
}

/// Immutable chunk of mono PCM samples with ordering metadata.
#[derive(Clone)]
pub struct AudioFrame {
    /// Samples as f32, normalized to [-1.0, 1.0]
    pub samples: Arc<[f32]>,
    pub sample_rate: SampleRate,
    /// Monotonic per-direction sequence number
    pub sequence: u64,
    /// Capture (or synthesis) timestamp
    pub timestamp: Instant,
    pub direction: Direction,
    /// Frame duration derived from sample count
    pub duration: Duration,
    /// RMS energy in dB, computed at construction
    pub energy_db: f32,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("sequence", &self.sequence)
            .field("direction", &self.direction)
            .field("duration", &self.duration)
            .field("energy_db", &self.energy_db)
            .finish()
    }
}

impl AudioFrame {
    pub fn new(
        samples: Vec<f32>,
        sample_rate: SampleRate,
        direction: Direction,
        sequence: u64,
    ) -> Self {
        let duration =
            Duration::from_secs_f64(samples.len() as f64 / sample_rate.as_u32() as f64);
        let energy_db = Self::energy_db(&samples);
        Self {
            samples: samples.into(),
            sample_rate,
            sequence,
            timestamp: Instant::now(),
            direction,
            duration,
            energy_db,
        }
    }

    /// RMS energy in decibels; -96 dB floor for silence
    fn energy_db(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return -96.0;
        }
        let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum_squares / samples.len() as f32).sqrt();
        if rms > 0.0 {
            20.0 * rms.log10()
        } else {
            -96.0
        }
    }

    /// Decode PCM16 little-endian bytes into a frame
    pub fn from_pcm16(
        bytes: &[u8],
        sample_rate: SampleRate,
        direction: Direction,
        sequence: u64,
    ) -> Self {
        const PCM16_NORMALIZE: f32 = 32768.0;
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|chunk| {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                sample as f32 / PCM16_NORMALIZE
            })
            .collect();
        Self::new(samples, sample_rate, direction, sequence)
    }

    /// Encode to PCM16 little-endian bytes
    pub fn to_pcm16(&self) -> Vec<u8> {
        const PCM16_SCALE: f32 = 32767.0;
        self.samples
            .iter()
            .flat_map(|&sample| {
                let clamped = sample.clamp(-1.0, 1.0);
                ((clamped * PCM16_SCALE) as i16).to_le_bytes()
            })
            .collect()
    }

    /// Resample to a different rate using rubato's FFT resampler.
    ///
    /// Very short frames fall back to linear interpolation, which rubato
    /// cannot handle well.
    pub fn resample(&self, target_rate: SampleRate) -> Self {
        use rubato::{FftFixedIn, Resampler};

        if self.sample_rate == target_rate {
            return self.clone();
        }
        if self.samples.len() < 64 {
            return self.resample_linear(target_rate);
        }

        let from_rate = self.sample_rate.as_u32() as usize;
        let to_rate = target_rate.as_u32() as usize;
        let samples_f64: Vec<f64> = self.samples.iter().map(|&s| s as f64).collect();
        let chunk_size = self.samples.len().min(1024);

        match FftFixedIn::<f64>::new(from_rate, to_rate, chunk_size, 2, 1) {
            Ok(mut resampler) => match resampler.process(&[samples_f64], None) {
                Ok(output) => {
                    let resampled: Vec<f32> = output[0].iter().map(|&s| s as f32).collect();
                    let mut frame =
                        Self::new(resampled, target_rate, self.direction, self.sequence);
                    frame.timestamp = self.timestamp;
                    frame
                },
                Err(e) => {
                    tracing::warn!(error = %e, "resampler failed, using linear fallback");
                    self.resample_linear(target_rate)
                },
            },
            Err(e) => {
                tracing::warn!(error = %e, "resampler init failed, using linear fallback");
                self.resample_linear(target_rate)
            },
        }
    }

    fn resample_linear(&self, target_rate: SampleRate) -> Self {
        let ratio = target_rate.as_u32() as f64 / self.sample_rate.as_u32() as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;

        let mut resampled = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = src_idx.floor() as usize;
            let idx_ceil = (idx_floor + 1).min(self.samples.len().saturating_sub(1));
            let frac = (src_idx - idx_floor as f64) as f32;
            resampled
                .push(self.samples[idx_floor] * (1.0 - frac) + self.samples[idx_ceil] * frac);
        }

        let mut frame = Self::new(resampled, target_rate, self.direction, self.sequence);
        frame.timestamp = self.timestamp;
        frame
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Accumulates frames into a contiguous sample buffer, bounded by duration.
#[derive(Debug)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: SampleRate,
    max_duration: Duration,
}

impl AudioBuffer {
    pub fn new(sample_rate: SampleRate, max_duration: Duration) -> Self {
        let max_samples =
            (sample_rate.as_u32() as f64 * max_duration.as_secs_f64()) as usize;
        Self {
            samples: Vec::with_capacity(max_samples),
            sample_rate,
            max_duration,
        }
    }

    /// Append a frame, resampling if rates differ. Oldest samples are
    /// trimmed once the buffer exceeds its maximum duration.
    pub fn push(&mut self, frame: &AudioFrame) {
        let frame = if frame.sample_rate != self.sample_rate {
            frame.resample(self.sample_rate)
        } else {
            frame.clone()
        };
        self.samples.extend(frame.samples.iter());

        let max_samples =
            (self.sample_rate.as_u32() as f64 * self.max_duration.as_secs_f64()) as usize;
        if self.samples.len() > max_samples {
            let excess = self.samples.len() - max_samples;
            self.samples.drain(0..excess);
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.as_u32() as f64)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_conversions() {
        assert_eq!(SampleRate::Hz16000.as_u32(), 16000);
        assert_eq!(
            SampleRate::Hz16000.samples_for(Duration::from_millis(20)),
            320
        );
        assert_eq!(SampleRate::Hz8000.samples_for(Duration::from_millis(10)), 80);
    }

    #[test]
    fn frame_from_pcm16() {
        let pcm16: Vec<u8> = vec![0x00, 0x40, 0x00, 0xC0]; // two samples
        let frame = AudioFrame::from_pcm16(&pcm16, SampleRate::Hz16000, Direction::Inbound, 0);

        assert_eq!(frame.samples.len(), 2);
        assert!(frame.samples[0] > 0.0);
        assert!(frame.samples[1] < 0.0);
    }

    #[test]
    fn pcm16_round_trip_preserves_sign() {
        let frame = AudioFrame::new(
            vec![0.5, -0.5, 0.0],
            SampleRate::Hz16000,
            Direction::Outbound,
            7,
        );
        let bytes = frame.to_pcm16();
        let back = AudioFrame::from_pcm16(&bytes, SampleRate::Hz16000, Direction::Outbound, 7);
        assert!(back.samples[0] > 0.49 && back.samples[0] < 0.51);
        assert!(back.samples[1] < -0.49);
    }

    #[test]
    fn energy_calculation() {
        let silent = AudioFrame::new(vec![0.0; 160], SampleRate::Hz16000, Direction::Inbound, 0);
        assert!(silent.energy_db < -90.0);

        let loud = AudioFrame::new(vec![0.5; 160], SampleRate::Hz16000, Direction::Inbound, 0);
        assert!(loud.energy_db > -10.0);
    }

    #[test]
    fn resample_halves_length() {
        let samples = vec![0.1f32; 320]; // 20ms at 16kHz
        let frame = AudioFrame::new(samples, SampleRate::Hz16000, Direction::Inbound, 0);

        let resampled = frame.resample(SampleRate::Hz8000);
        // FFT resampler may pad slightly; length should be close to half
        let expected = 160;
        assert!(
            (resampled.samples.len() as i64 - expected).abs() <= 16,
            "got {}",
            resampled.samples.len()
        );
    }

    #[test]
    fn buffer_trims_to_max_duration() {
        let mut buffer = AudioBuffer::new(SampleRate::Hz16000, Duration::from_millis(40));
        for seq in 0..10 {
            let frame =
                AudioFrame::new(vec![0.1; 320], SampleRate::Hz16000, Direction::Inbound, seq);
            buffer.push(&frame);
        }
        // 40ms at 16kHz = 640 samples max
        assert_eq!(buffer.samples().len(), 640);
    }
}
