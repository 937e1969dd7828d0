//! Compiled loudness patterns.
//!
//! A pattern is the loudness envelope of a marker clip, normalized to unit
//! L2 norm, time-reversed, zero-padded and transformed to the frequency
//! domain once at build time. Time-reversal turns the FFT product in the
//! matcher into cross-correlation instead of convolution.
//!
//! The serialized form is a private cache format: the prepared (normalized,
//! reversed) envelope as a flat array of little-endian f64 values, 8 bytes
//! each. It is not meant to move between machines.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::decode::FrameDecoder;
use crate::envelope::{FrameWalker, LoudnessExtractor, POINTS_PER_FRAME};
use crate::error::{Error, Result};
use crate::mpeg::sync;

pub struct Pattern {
    /// Prepared envelope: unit norm, reversed in time.
    prepared: Vec<f64>,
    padded_len: usize,
    transformed: Vec<Complex<f64>>,
    samples_per_frame: Option<usize>,
}

impl Pattern {
    fn build(prepared: Vec<f64>, samples_per_frame: Option<usize>) -> Result<Self> {
        if prepared.is_empty() {
            return Err(Error::format("empty pattern envelope"));
        }
        // Smallest power of two holding pattern, a 2L correlation window
        // and the linear-correlation tail without wraparound.
        let padded_len = (3 * prepared.len() + 1).next_power_of_two();
        let mut transformed: Vec<Complex<f64>> = prepared
            .iter()
            .map(|&x| Complex::new(x, 0.0))
            .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
            .take(padded_len)
            .collect();
        let mut planner = FftPlanner::new();
        planner.plan_fft_forward(padded_len).process(&mut transformed);
        Ok(Pattern {
            prepared,
            padded_len,
            transformed,
            samples_per_frame,
        })
    }

    /// Compile a raw (forward-time) envelope: normalize to unit L2 norm,
    /// reverse, pad and transform.
    pub fn from_envelope(mut envelope: Vec<f64>) -> Result<Self> {
        let norm = l2_norm(&envelope);
        if norm > 0.0 {
            for x in &mut envelope {
                *x /= norm;
            }
        }
        envelope.reverse();
        Self::build(envelope, None)
    }

    /// Compile a pattern from the bytes of a marker MP3.
    pub fn from_mp3<D: FrameDecoder + ?Sized>(data: &[u8], decoder: &mut D) -> Result<Self> {
        let sync = sync::locate(data, sync::DEFAULT_MIN_SYNC_RANGE)?;
        let walker = FrameWalker::new(data, &sync);
        let mut extractor = LoudnessExtractor::new(walker, decoder, None);
        let envelope = extractor.read_all()?;
        let samples_per_frame = extractor.samples_per_frame();
        let mut pattern = Self::from_envelope(envelope)?;
        pattern.samples_per_frame = samples_per_frame;
        Ok(pattern)
    }

    /// Read a previously serialized pattern. The stored envelope is already
    /// prepared; it is not normalized or reversed again.
    pub fn read_serialized<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        if bytes.is_empty() || bytes.len() % 8 != 0 {
            return Err(Error::format(format!(
                "serialized pattern has invalid length {}",
                bytes.len()
            )));
        }
        let prepared = bytes
            .chunks_exact(8)
            .map(|chunk| {
                f64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
                ])
            })
            .collect();
        Self::build(prepared, None)
    }

    pub fn write_serialized<W: Write>(&self, mut writer: W) -> Result<()> {
        for &x in &self.prepared {
            writer.write_all(&x.to_le_bytes())?;
        }
        Ok(())
    }

    /// Load a pattern from a path: `.mp3` compiles from audio, anything
    /// else reads the serialized cache format.
    pub fn load<D: FrameDecoder + ?Sized>(path: &Path, decoder: &mut D) -> Result<Self> {
        let is_mp3 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
        if is_mp3 {
            let data = std::fs::read(path)?;
            Self::from_mp3(&data, decoder)
        } else {
            Self::read_serialized(BufReader::new(File::open(path)?))
        }
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_serialized(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Pattern length in loudness points.
    pub fn len(&self) -> usize {
        self.prepared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty()
    }

    /// Pattern length in frames.
    pub fn frames(&self) -> u32 {
        (self.prepared.len() / POINTS_PER_FRAME) as u32
    }

    pub fn padded_len(&self) -> usize {
        self.padded_len
    }

    pub fn transformed(&self) -> &[Complex<f64>] {
        &self.transformed
    }

    pub fn prepared(&self) -> &[f64] {
        &self.prepared
    }

    /// Samples per decoded frame of the source clip, when compiled from
    /// audio. Serialized patterns do not carry it.
    pub fn samples_per_frame(&self) -> Option<usize> {
        self.samples_per_frame
    }
}

fn l2_norm(data: &[f64]) -> f64 {
    data.iter().map(|x| x * x).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_pad_law() {
        for len in [1usize, 2, 3, 5, 7, 64, 100, 333] {
            let pattern = Pattern::from_envelope(vec![1.0; len]).unwrap();
            let padded = pattern.padded_len();
            assert!(padded.is_power_of_two());
            assert!(padded >= 3 * len + 1);
            assert!(padded / 2 < 3 * len + 1, "padding not minimal for {len}");
        }
    }

    #[test]
    fn test_envelope_is_normalized_and_reversed() {
        let pattern = Pattern::from_envelope(vec![1.0, 2.0, 3.0]).unwrap();
        let norm = 14.0f64.sqrt();
        let prepared = pattern.prepared();
        assert!((prepared[0] - 3.0 / norm).abs() < 1e-12);
        assert!((prepared[1] - 2.0 / norm).abs() < 1e-12);
        assert!((prepared[2] - 1.0 / norm).abs() < 1e-12);
        assert!((l2_norm(prepared) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_envelope_rejected() {
        assert!(Pattern::from_envelope(Vec::new()).is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        for len in [1usize, 7, 64] {
            let envelope: Vec<f64> = (0..len).map(|i| (i as f64 * 0.37).sin()).collect();
            let pattern = Pattern::from_envelope(envelope).unwrap();
            let mut bytes = Vec::new();
            pattern.write_serialized(&mut bytes).unwrap();
            assert_eq!(bytes.len(), 8 * len);
            let restored = Pattern::read_serialized(bytes.as_slice()).unwrap();
            assert_eq!(restored.prepared(), pattern.prepared());
            assert_eq!(restored.padded_len(), pattern.padded_len());
        }
    }

    #[test]
    fn test_serialization_round_trip_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marker.pattern");
        let pattern = Pattern::from_envelope((0..40).map(f64::from).collect()).unwrap();
        pattern.store(&path).unwrap();
        let restored = Pattern::read_serialized(File::open(&path).unwrap()).unwrap();
        assert_eq!(restored.prepared(), pattern.prepared());
    }

    #[test]
    fn test_truncated_serialized_pattern_rejected() {
        assert!(Pattern::read_serialized(&[0u8; 12][..]).is_err());
        assert!(Pattern::read_serialized(&[][..]).is_err());
    }
}
