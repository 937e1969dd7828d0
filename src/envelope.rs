//! Loudness envelope extraction.
//!
//! Every frame is reduced to [`POINTS_PER_FRAME`] loudness points: the sum
//! of `ln(sample^2)` over the nonzero samples of each sub-block, scaled to
//! base-10. A silent sub-block would otherwise contribute 0.0 and correlate
//! with anything, so it receives the normalization constant as filler.

use crate::decode::FrameDecoder;
use crate::error::{Error, Result};
use crate::mpeg::frame::{Bitrate, FrameHeader};
use crate::mpeg::sync::SyncOutcome;

/// Loudness points per frame. Two sub-blocks keep the envelope coarse
/// enough for FFT correlation while still resolving half-frame offsets.
pub const POINTS_PER_FRAME: usize = 2;

const LN_10: f64 = std::f64::consts::LN_10;

/// Linear replay of the frame chain, tracking elapsed time, frame count and
/// byte offset as it goes. Positions reported between frames are the only
/// positions this crate ever hands out.
pub struct FrameWalker<'a> {
    data: &'a [u8],
    offset: usize,
    free_len: Option<usize>,
    frames: u32,
    millis: f64,
    done: bool,
}

impl<'a> FrameWalker<'a> {
    pub fn new(data: &'a [u8], sync: &SyncOutcome) -> Self {
        FrameWalker {
            data,
            offset: sync.offset,
            free_len: sync.free_format_len,
            frames: 0,
            millis: 0.0,
            done: false,
        }
    }

    /// Read the next frame, advancing time, frame count and offset.
    /// Returns `None` at the first offset that does not hold a complete
    /// valid frame; the walker stays exhausted from then on.
    pub fn next_frame(&mut self) -> Option<(FrameHeader, &'a [u8])> {
        if self.done {
            return None;
        }
        let header = match self.header_at(self.offset) {
            Some(h) => h,
            None => {
                self.done = true;
                return None;
            }
        };
        let unpadded = match header.bitrate {
            Bitrate::Kbps(kbps) => header.unpadded_len(kbps),
            Bitrate::Free => match self.free_len {
                Some(len) => len,
                None => {
                    self.done = true;
                    return None;
                }
            },
        };
        let len = unpadded + if header.padding { header.slot_len() } else { 0 };
        if self.offset + len > self.data.len() {
            // Truncated final frame.
            self.done = true;
            return None;
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        self.frames += 1;
        self.millis += header.ms_per_frame();
        Some((header, bytes))
    }

    fn header_at(&self, offset: usize) -> Option<FrameHeader> {
        let bytes = self.data.get(offset..offset + 4)?;
        FrameHeader::parse([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn has_more(&self) -> bool {
        !self.done
    }

    /// Frames consumed so far.
    pub fn frame_count(&self) -> u32 {
        self.frames
    }

    /// Elapsed playing time in whole milliseconds.
    pub fn millis(&self) -> u32 {
        self.millis as u32
    }

    /// Absolute byte offset of the next unread frame.
    pub fn byte_offset(&self) -> u64 {
        self.offset as u64
    }
}

/// Source of loudness points for the correlation sweep. Implemented by
/// [`LoudnessExtractor`]; tests drive the matcher with synthetic sources.
pub trait EnvelopeSource {
    /// Append up to `want` points to `out`, returning how many were added.
    /// Fewer than `want` means the stream is exhausted.
    fn fill(&mut self, out: &mut Vec<f64>, want: usize) -> Result<usize>;

    /// Advance past frames without decoding until `millis() >= ms`.
    fn skip_to_millis(&mut self, ms: u32) -> Result<()>;

    fn has_more(&self) -> bool;
    fn millis(&self) -> u32;
    fn frame_count(&self) -> u32;
}

/// Turns decoded frames into loudness points.
pub struct LoudnessExtractor<'a, D: FrameDecoder + ?Sized> {
    walker: FrameWalker<'a>,
    decoder: &'a mut D,
    /// Samples per decoded frame, fixed by the first decoded frame (or by
    /// the pattern the target is being matched against). A later mismatch
    /// is a fatal inconsistency, not bad input.
    expected_samples: Option<usize>,
    pending: Vec<f64>,
}

impl<'a, D: FrameDecoder + ?Sized> LoudnessExtractor<'a, D> {
    pub fn new(
        walker: FrameWalker<'a>,
        decoder: &'a mut D,
        expected_samples: Option<usize>,
    ) -> Self {
        LoudnessExtractor {
            walker,
            decoder,
            expected_samples,
            pending: Vec::with_capacity(POINTS_PER_FRAME),
        }
    }

    /// Samples per frame observed so far, when any frame has decoded.
    pub fn samples_per_frame(&self) -> Option<usize> {
        self.expected_samples
    }

    /// Drain the whole stream into one envelope.
    pub fn read_all(&mut self) -> Result<Vec<f64>> {
        let mut envelope = std::mem::take(&mut self.pending);
        while self.walker.has_more() {
            self.fill_points(&mut envelope)?;
        }
        Ok(envelope)
    }

    /// Decode the next frame and push its loudness points onto `out`.
    /// Frames that decode to no samples are walked over without emitting.
    fn fill_points(&mut self, out: &mut Vec<f64>) -> Result<()> {
        let (header, bytes) = match self.walker.next_frame() {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let samples = self.decoder.decode_frame(&header, bytes)?;
        if samples.is_empty() {
            return Ok(());
        }
        match self.expected_samples {
            None => self.expected_samples = Some(samples.len()),
            Some(expected) if expected != samples.len() => {
                return Err(Error::invariant(format!(
                    "decoded sample count changed from {expected} to {} at frame {}",
                    samples.len(),
                    self.walker.frame_count()
                )));
            }
            Some(_) => {}
        }

        let block = samples.len() as f64 / POINTS_PER_FRAME as f64;
        let mut loudness = [0.0f64; POINTS_PER_FRAME];
        for (k, &sample) in samples.iter().enumerate() {
            let sq = sample as f64 * sample as f64;
            if sq > 0.0 {
                loudness[(k as f64 / block) as usize] += sq.ln();
            }
        }
        let normalization = POINTS_PER_FRAME as f64 / samples.len() as f64;
        let factor = normalization / LN_10;
        for point in &mut loudness {
            if *point == 0.0 {
                *point = normalization;
            } else {
                *point *= factor;
            }
        }
        out.extend_from_slice(&loudness);
        Ok(())
    }
}

impl<D: FrameDecoder + ?Sized> EnvelopeSource for LoudnessExtractor<'_, D> {
    fn fill(&mut self, out: &mut Vec<f64>, want: usize) -> Result<usize> {
        let mut got = 0;
        while got < want && !self.pending.is_empty() {
            out.push(self.pending.remove(0));
            got += 1;
        }
        while got < want && self.walker.has_more() {
            let mut points = Vec::with_capacity(POINTS_PER_FRAME);
            self.fill_points(&mut points)?;
            for point in points {
                if got < want {
                    out.push(point);
                    got += 1;
                } else {
                    self.pending.push(point);
                }
            }
        }
        Ok(got)
    }

    fn skip_to_millis(&mut self, ms: u32) -> Result<()> {
        while self.walker.has_more() && self.walker.millis() < ms {
            self.walker.next_frame();
        }
        Ok(())
    }

    fn has_more(&self) -> bool {
        !self.pending.is_empty() || self.walker.has_more()
    }

    fn millis(&self) -> u32 {
        self.walker.millis()
    }

    fn frame_count(&self) -> u32 {
        self.walker.frame_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpeg::sync;

    /// Deterministic decoder: every frame yields the same preset block.
    struct StubDecoder {
        samples: Vec<i16>,
        /// When set, the sample count changes after this many frames.
        break_after: Option<u32>,
        decoded: u32,
    }

    impl StubDecoder {
        fn new(samples: Vec<i16>) -> Self {
            StubDecoder {
                samples,
                break_after: None,
                decoded: 0,
            }
        }
    }

    impl FrameDecoder for StubDecoder {
        fn decode_frame(&mut self, _: &FrameHeader, _: &[u8]) -> Result<&[i16]> {
            self.decoded += 1;
            if let Some(n) = self.break_after {
                if self.decoded > n {
                    self.samples.truncate(self.samples.len() / 2);
                }
            }
            Ok(&self.samples)
        }
    }

    const HDR_128: [u8; 4] = [0xFF, 0xFB, 0x90, 0x00];

    fn cbr_stream(frames: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for _ in 0..frames {
            let mut frame = vec![0u8; 417];
            frame[..4].copy_from_slice(&HDR_128);
            data.extend_from_slice(&frame);
        }
        data
    }

    fn synced(data: &[u8]) -> sync::SyncOutcome {
        sync::locate(data, data.len()).unwrap()
    }

    #[test]
    fn test_walker_positions_are_consistent() {
        let data = cbr_stream(10);
        let sync = synced(&data);
        let mut walker = FrameWalker::new(&data, &sync);
        let mut expected_offset = 0u64;
        while let Some((header, bytes)) = walker.next_frame() {
            expected_offset += bytes.len() as u64;
            assert_eq!(walker.byte_offset(), expected_offset);
            assert_eq!(bytes.len(), header.frame_len().unwrap());
        }
        assert_eq!(walker.frame_count(), 10);
        // 10 * 26.122 ms, truncated
        assert_eq!(walker.millis(), 261);
    }

    #[test]
    fn test_silent_frames_yield_normalization_filler() {
        let data = cbr_stream(4);
        let sync = synced(&data);
        let mut decoder = StubDecoder::new(vec![0i16; 1152]);
        let walker = FrameWalker::new(&data, &sync);
        let mut extractor = LoudnessExtractor::new(walker, &mut decoder, None);
        let envelope = extractor.read_all().unwrap();
        assert_eq!(envelope.len(), 4 * POINTS_PER_FRAME);
        let filler = POINTS_PER_FRAME as f64 / 1152.0;
        for point in envelope {
            assert_eq!(point, filler);
        }
    }

    #[test]
    fn test_loud_frames_scale_to_base_ten() {
        let data = cbr_stream(2);
        let sync = synced(&data);
        // Constant amplitude: every sample contributes ln(100^2).
        let mut decoder = StubDecoder::new(vec![100i16; 1152]);
        let walker = FrameWalker::new(&data, &sync);
        let mut extractor = LoudnessExtractor::new(walker, &mut decoder, None);
        let envelope = extractor.read_all().unwrap();
        let expected = 576.0 * (100.0f64 * 100.0).ln() * (2.0 / 1152.0) / LN_10;
        for point in envelope {
            assert!((point - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_sample_count_change_is_invariant_violation() {
        let data = cbr_stream(6);
        let sync = synced(&data);
        let mut decoder = StubDecoder::new(vec![5i16; 1152]);
        decoder.break_after = Some(3);
        let walker = FrameWalker::new(&data, &sync);
        let mut extractor = LoudnessExtractor::new(walker, &mut decoder, None);
        match extractor.read_all() {
            Err(Error::Invariant(_)) => {}
            other => panic!("expected invariant violation, got {other:?}"),
        }
    }

    #[test]
    fn test_expected_samples_enforced_from_start() {
        let data = cbr_stream(2);
        let sync = synced(&data);
        let mut decoder = StubDecoder::new(vec![5i16; 1152]);
        let walker = FrameWalker::new(&data, &sync);
        let mut extractor = LoudnessExtractor::new(walker, &mut decoder, Some(576));
        assert!(matches!(extractor.read_all(), Err(Error::Invariant(_))));
    }

    #[test]
    fn test_fill_respects_want_and_carries_over() {
        let data = cbr_stream(5);
        let sync = synced(&data);
        let mut decoder = StubDecoder::new(vec![7i16; 1152]);
        let walker = FrameWalker::new(&data, &sync);
        let mut extractor = LoudnessExtractor::new(walker, &mut decoder, None);
        let mut out = Vec::new();
        // Odd request leaves one point pending.
        assert_eq!(extractor.fill(&mut out, 3).unwrap(), 3);
        assert_eq!(out.len(), 3);
        let mut rest = Vec::new();
        assert_eq!(extractor.fill(&mut rest, 100).unwrap(), 7);
        assert_eq!(out.len() + rest.len(), 5 * POINTS_PER_FRAME);
    }
}
