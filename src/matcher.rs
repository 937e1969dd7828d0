//! FFT cross-correlation of a pattern against a target envelope.
//!
//! The target is consumed through a sliding window of 2L points (L being
//! the pattern length). Each round shifts the newest L points into the
//! front half, refills the back half, and scores every alignment of the
//! pattern inside the window via one forward FFT, a pointwise product with
//! the pattern's precomputed transform, and one inverse FFT. Scores are
//! normalized by the L2 norm of each L-point target window, computed
//! incrementally. The very first window is only half filled and is skipped;
//! a match starting at point zero is still seen one round later when the
//! window has slid over it.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::envelope::{EnvelopeSource, POINTS_PER_FRAME};
use crate::error::Result;
use crate::pattern::Pattern;

/// Best correlation seen by a sweep, in frame units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMatch {
    /// Normalized correlation in [-1, 1]; 0.0 when nothing scored.
    pub correlation: f32,
    /// Frame offset (from stream start) where the matched region begins.
    pub frame: u32,
}

impl Default for RawMatch {
    fn default() -> Self {
        RawMatch {
            correlation: 0.0,
            frame: 0,
        }
    }
}

/// Correlate `pattern` against `source` between `start_ms` and `end_ms` of
/// playing time. Exhausting the window or the stream is not an error; the
/// caller compares the returned correlation against its threshold.
pub fn sweep<S: EnvelopeSource>(
    pattern: &Pattern,
    source: &mut S,
    start_ms: u32,
    end_ms: u32,
) -> Result<RawMatch> {
    let l = pattern.len();
    let two_l = 2 * l;
    let padded = pattern.padded_len();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(padded);
    let ifft = planner.plan_fft_inverse(padded);

    source.skip_to_millis(start_ms)?;

    let mut window = vec![0.0f64; two_l];
    let mut fresh: Vec<f64> = Vec::with_capacity(l);
    let mut scratch: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); padded];
    let mut best = RawMatch::default();
    let mut initial_fill = true;

    while source.has_more() && source.millis() <= end_ms {
        fresh.clear();
        let got = source.fill(&mut fresh, l)?;
        window.copy_within(l.., 0);
        window[l..l + got].copy_from_slice(&fresh);
        for x in &mut window[l + got..] {
            *x = 0.0;
        }
        let points = l + got;

        if initial_fill {
            initial_fill = false;
        } else if let Some((score, delay)) =
            correlate_window(pattern, fft.as_ref(), ifft.as_ref(), &window, &mut scratch)
        {
            if score > best.correlation as f64 {
                let frame = source.frame_count() as i64
                    + (delay as i64 - points as i64) / POINTS_PER_FRAME as i64;
                best = RawMatch {
                    correlation: score as f32,
                    frame: frame.max(0) as u32,
                };
            }
        }

        if got < l {
            break;
        }
    }
    Ok(best)
}

/// Score one 2L window, returning the best (score, delay) over all L
/// pattern alignments. Alignments over an all-zero target window are
/// skipped rather than divided by a zero norm.
fn correlate_window(
    pattern: &Pattern,
    fft: &dyn rustfft::Fft<f64>,
    ifft: &dyn rustfft::Fft<f64>,
    window: &[f64],
    scratch: &mut [Complex<f64>],
) -> Option<(f64, usize)> {
    let l = pattern.len();
    let norms = window_norms(window, l);

    for (i, slot) in scratch.iter_mut().enumerate() {
        let re = if i < window.len() { window[i] } else { 0.0 };
        *slot = Complex::new(re, 0.0);
    }
    fft.process(scratch);
    for (c, p) in scratch.iter_mut().zip(pattern.transformed()) {
        *c *= *p;
    }
    ifft.process(scratch);
    // rustfft's inverse transform is unnormalized.
    let scale = 1.0 / scratch.len() as f64;

    let mut best: Option<(f64, usize)> = None;
    for (delay, &norm) in norms.iter().enumerate().take(l) {
        if norm <= 0.0 {
            continue;
        }
        let score = scratch[delay + l - 1].re * scale / norm;
        if best.map_or(true, |(b, _)| score > b) {
            best = Some((score, delay));
        }
    }
    best
}

/// L2 norms of every length-`l` window of `data`, front to back, computed
/// by one running sum of squares.
fn window_norms(data: &[f64], l: usize) -> Vec<f64> {
    let mut norms = Vec::with_capacity(data.len() - l + 1);
    let mut sum_sq: f64 = data[..l].iter().map(|x| x * x).sum();
    norms.push(sum_sq.sqrt());
    for j in l..data.len() {
        let out = data[j - l];
        sum_sq += data[j] * data[j] - out * out;
        norms.push(sum_sq.max(0.0).sqrt());
    }
    norms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    /// Envelope source over a preset point vector, two points per frame,
    /// with a configurable frame duration.
    struct VecSource {
        points: Vec<f64>,
        at: usize,
        ms_per_frame: f64,
    }

    impl VecSource {
        fn new(points: Vec<f64>) -> Self {
            VecSource {
                points,
                at: 0,
                ms_per_frame: 26.122,
            }
        }
    }

    impl EnvelopeSource for VecSource {
        fn fill(&mut self, out: &mut Vec<f64>, want: usize) -> Result<usize> {
            let got = want.min(self.points.len() - self.at);
            out.extend_from_slice(&self.points[self.at..self.at + got]);
            self.at += got;
            Ok(got)
        }

        fn skip_to_millis(&mut self, ms: u32) -> Result<()> {
            while self.at < self.points.len() && self.millis() < ms {
                self.at += POINTS_PER_FRAME;
            }
            Ok(())
        }

        fn has_more(&self) -> bool {
            self.at < self.points.len()
        }

        fn millis(&self) -> u32 {
            (self.frame_count() as f64 * self.ms_per_frame) as u32
        }

        fn frame_count(&self) -> u32 {
            (self.at / POINTS_PER_FRAME) as u32
        }
    }

    /// Sign-varying envelope so a flat background correlates poorly.
    fn marker_envelope(points: usize) -> Vec<f64> {
        (0..points)
            .map(|i| ((i * 37 % 17) as f64) - 8.0)
            .collect()
    }

    fn target_with_marker(
        total_frames: usize,
        marker: &[f64],
        at_frame: usize,
    ) -> Vec<f64> {
        let mut points = vec![0.01f64; total_frames * POINTS_PER_FRAME];
        let start = at_frame * POINTS_PER_FRAME;
        points[start..start + marker.len()].copy_from_slice(marker);
        points
    }

    #[test]
    fn test_exact_match_recovered_at_planted_frame() {
        let marker = marker_envelope(40); // 20 frames
        let pattern = Pattern::from_envelope(marker.clone()).unwrap();
        let mut source = VecSource::new(target_with_marker(200, &marker, 60));
        let m = sweep(&pattern, &mut source, 0, u32::MAX).unwrap();
        assert!(m.correlation > 0.99, "correlation {}", m.correlation);
        assert_eq!(m.frame, 60);
    }

    #[test]
    fn test_match_at_stream_start_is_found() {
        // The first window is excluded from scoring, but a match at frame
        // zero reappears at delay zero of the next window.
        let marker = marker_envelope(40);
        let pattern = Pattern::from_envelope(marker.clone()).unwrap();
        let mut source = VecSource::new(target_with_marker(200, &marker, 0));
        let m = sweep(&pattern, &mut source, 0, u32::MAX).unwrap();
        assert!(m.correlation > 0.99, "correlation {}", m.correlation);
        assert_eq!(m.frame, 0);
    }

    #[test]
    fn test_scaled_match_still_correlates() {
        // Normalized correlation is amplitude-invariant.
        let marker = marker_envelope(40);
        let scaled: Vec<f64> = marker.iter().map(|x| x * 3.5).collect();
        let pattern = Pattern::from_envelope(marker).unwrap();
        let mut source = VecSource::new(target_with_marker(200, &scaled, 80));
        let m = sweep(&pattern, &mut source, 0, u32::MAX).unwrap();
        assert!(m.correlation > 0.99, "correlation {}", m.correlation);
        assert_eq!(m.frame, 80);
    }

    #[test]
    fn test_absent_marker_scores_low() {
        let marker = marker_envelope(40);
        let pattern = Pattern::from_envelope(marker).unwrap();
        // Background with a different repeating structure.
        let points: Vec<f64> = (0..400).map(|i| ((i % 5) as f64) * 0.2 + 0.1).collect();
        let mut source = VecSource::new(points);
        let m = sweep(&pattern, &mut source, 0, u32::MAX).unwrap();
        assert!(m.correlation < 0.9, "correlation {}", m.correlation);
    }

    #[test]
    fn test_window_limits_restrict_search() {
        let marker = marker_envelope(40);
        let pattern = Pattern::from_envelope(marker.clone()).unwrap();
        // Marker at frame 150, search window closes around frame 76.
        let mut source = VecSource::new(target_with_marker(300, &marker, 150));
        let m = sweep(&pattern, &mut source, 0, 2000).unwrap();
        assert!(m.correlation < 0.9, "correlation {}", m.correlation);
    }

    #[test]
    fn test_target_shorter_than_pattern_scores_zero() {
        let marker = marker_envelope(80);
        let pattern = Pattern::from_envelope(marker).unwrap();
        let mut source = VecSource::new(vec![0.5; 20]);
        let m = sweep(&pattern, &mut source, 0, u32::MAX).unwrap();
        assert_eq!(m.correlation, 0.0);
    }

    #[test]
    fn test_window_norms_incremental() {
        let data = [3.0, 4.0, 0.0, 12.0, 5.0, 0.0];
        let norms = window_norms(&data, 2);
        assert_eq!(norms.len(), 5);
        assert!((norms[0] - 5.0).abs() < 1e-12);
        assert!((norms[1] - 4.0).abs() < 1e-12);
        assert!((norms[2] - 12.0).abs() < 1e-12);
        assert!((norms[3] - 13.0).abs() < 1e-12);
        assert!((norms[4] - 5.0).abs() < 1e-12);
    }
}
