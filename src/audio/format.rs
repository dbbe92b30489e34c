//! # Sample Format and Conversion
//!
//! Samples travel inside the process as interleaved `f32` in [-1.0, 1.0];
//! codecs convert to and from their wire representation.
//!
//! ## Key Functions:
//! - **Format description**: sample rate and channel count of a stream
//! - **Format conversion**: 16-bit PCM <-> float
//! - **Level measurement**: RMS energy, used to tell speech from silence

use crate::error::{SrError, SrResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSampleFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSampleFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 16kHz mono, what most recognizers want.
    pub fn speech() -> Self {
        Self::new(16_000, 1)
    }

    /// Parse codec parameters of the form `"<rate>"` or `"<rate>/<channels>"`.
    ///
    /// ## Examples:
    /// - `"16000"` → 16kHz mono
    /// - `"44100/2"` → 44.1kHz stereo
    pub fn parse_params(params: &str) -> SrResult<Self> {
        let params = params.trim();
        let (rate, channels) = match params.split_once('/') {
            Some((rate, channels)) => (rate, channels),
            None => (params, "1"),
        };

        let sample_rate: u32 = rate
            .trim()
            .parse()
            .map_err(|_| SrError::Protocol(format!("invalid sample rate in '{}'", params)))?;
        let channels: u16 = channels
            .trim()
            .parse()
            .map_err(|_| SrError::Protocol(format!("invalid channel count in '{}'", params)))?;

        let format = Self::new(sample_rate, channels);
        format.validate()?;
        Ok(format)
    }

    /// Inverse of [`AudioSampleFormat::parse_params`].
    pub fn to_params(&self) -> String {
        if self.channels == 1 {
            self.sample_rate.to_string()
        } else {
            format!("{}/{}", self.sample_rate, self.channels)
        }
    }

    pub fn validate(&self) -> SrResult<()> {
        if self.sample_rate == 0 || self.sample_rate > 384_000 {
            return Err(SrError::Protocol(format!(
                "sample rate {} out of range",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(SrError::Protocol(format!(
                "channel count {} out of range",
                self.channels
            )));
        }
        Ok(())
    }

    /// Interleaved samples per second of audio.
    pub fn samples_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize
    }
}

impl fmt::Display for AudioSampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// Scale 16-bit PCM into [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Scale float samples back to 16-bit PCM, clamping out-of-range input.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&sample| float_sample_to_pcm(sample)).collect()
}

pub fn float_sample_to_pcm(sample: f32) -> i16 {
    let scaled = sample * 32768.0;
    scaled.clamp(-32768.0, 32767.0) as i16
}

/// Root mean square level of a block of samples.
///
/// The DC offset is removed first so a biased microphone does not read as speech.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let dc_offset = samples.iter().sum::<f32>() / samples.len() as f32;
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let centered = s - dc_offset;
            centered * centered
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_conversion() {
        let pcm_samples = vec![0i16, 16384, -16384, 32767, -32768];
        let float_samples = pcm_to_float(&pcm_samples);
        let converted_back = float_to_pcm(&float_samples);

        for (original, converted) in pcm_samples.iter().zip(converted_back.iter()) {
            let diff = (original - converted).abs();
            assert!(diff <= 1, "Conversion error too large: {} vs {}", original, converted);
        }
        assert_eq!(float_sample_to_pcm(4.0), i16::MAX);
    }

    #[test]
    fn test_parse_params() {
        assert_eq!(
            AudioSampleFormat::parse_params("16000").unwrap(),
            AudioSampleFormat::speech()
        );
        let stereo = AudioSampleFormat::parse_params("44100/2").unwrap();
        assert_eq!(stereo.channels, 2);
        assert_eq!(stereo.to_params(), "44100/2");

        assert!(AudioSampleFormat::parse_params("").is_err());
        assert!(AudioSampleFormat::parse_params("fast").is_err());
        assert!(AudioSampleFormat::parse_params("16000/0").is_err());
    }

    #[test]
    fn test_rms_energy_ignores_dc_offset() {
        let silent_but_biased = vec![0.3f32; 160];
        assert!(rms_energy(&silent_but_biased) < 1e-6);

        let square: Vec<f32> = (0..160).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        assert!((rms_energy(&square) - 0.5).abs() < 1e-4);
        assert_eq!(rms_energy(&[]), 0.0);
    }
}
