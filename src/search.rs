//! Multi-step search and position resolution.
//!
//! A search runs an ordered ladder of steps, each pairing a correlation
//! threshold with a playing-time window. Cheap, tight windows go first;
//! the first step whose best correlation clears its threshold wins and no
//! further step runs. Exhausting the ladder is a no-match, not an error.
//!
//! Matching yields frame counts only. Byte offsets and timestamps come
//! from a second linear replay of the frame chain, so a `StreamPosition`
//! is always an internally consistent triple.

use std::sync::Arc;

use serde::Serialize;

use crate::envelope::FrameWalker;
use crate::error::{Error, Result};
use crate::matcher::RawMatch;
use crate::mpeg::sync::SyncOutcome;
use crate::pattern::Pattern;

/// One rung of the search ladder. Window bounds are playing-time
/// milliseconds; a negative bound is measured back from the stream end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchStep {
    pub threshold: f32,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

impl SearchStep {
    pub const fn new(threshold: f32, window_start_ms: i64, window_end_ms: i64) -> Self {
        SearchStep {
            threshold,
            window_start_ms,
            window_end_ms,
        }
    }
}

/// A consistent (time, frame, byte) triple produced by replaying the frame
/// chain, never by estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamPosition {
    pub time_ms: u32,
    pub frame: u32,
    pub byte_offset: u64,
}

/// Frame-level match before position resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawResult {
    pub start_frame: u32,
    pub end_frame: u32,
    pub correlation: f32,
}

/// Fully resolved match region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchResult {
    pub start: StreamPosition,
    pub end: StreamPosition,
    pub correlation: f32,
}

/// Default ladder for a start marker: expected early in the stream.
/// Windows overlap slightly so a match straddling a boundary is not lost.
pub fn in_strategy() -> Vec<SearchStep> {
    vec![
        SearchStep::new(0.8, 0, 300_000),
        SearchStep::new(0.9, 290_000, 600_000),
        SearchStep::new(0.7, 0, 300_000),
        SearchStep::new(0.8, 290_000, 600_000),
    ]
}

/// Default ladder for an end marker: expected near the stream end, so the
/// windows are anchored to negative offsets.
pub fn out_strategy() -> Vec<SearchStep> {
    vec![
        SearchStep::new(0.80, -600_000, i64::MAX),
        SearchStep::new(0.85, -1_200_000, -590_000),
        SearchStep::new(0.70, -900_000, i64::MAX),
    ]
}

fn resolve_bound(bound: i64, total_ms: u32) -> u32 {
    if bound >= 0 {
        bound.min(u32::MAX as i64) as u32
    } else {
        (total_ms as i64 + bound).max(0) as u32
    }
}

/// A compiled pattern with its search ladder.
pub struct MultiStepSearch {
    pattern: Arc<Pattern>,
    steps: Vec<SearchStep>,
}

impl MultiStepSearch {
    pub fn new(pattern: Arc<Pattern>, steps: Vec<SearchStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::invariant("search configured with no steps"));
        }
        Ok(MultiStepSearch { pattern, steps })
    }

    pub fn pattern(&self) -> &Arc<Pattern> {
        &self.pattern
    }

    pub fn steps(&self) -> &[SearchStep] {
        &self.steps
    }

    /// Run the ladder. `sweep` performs one windowed correlation sweep over
    /// resolved millisecond bounds; it is called once per step until a
    /// step's threshold is met. `None` means every step came up short.
    pub fn run<F>(&self, total_ms: u32, mut sweep: F) -> Result<Option<RawResult>>
    where
        F: FnMut(u32, u32) -> Result<RawMatch>,
    {
        for (i, step) in self.steps.iter().enumerate() {
            let from = resolve_bound(step.window_start_ms, total_ms);
            let to = resolve_bound(step.window_end_ms, total_ms);
            let m = sweep(from, to)?;
            log::debug!(
                "step {i}: correlation {:.3} in [{from} ms, {to} ms] (threshold {})",
                m.correlation,
                step.threshold
            );
            if m.correlation >= step.threshold {
                return Ok(Some(RawResult {
                    start_frame: m.frame,
                    end_frame: m.frame + self.pattern.frames(),
                    correlation: m.correlation,
                }));
            }
        }
        Ok(None)
    }
}

/// Replay the frame chain once, snapshotting a position the moment each
/// requested frame count is reached. `targets` must be ascending. Targets
/// beyond the end of the stream resolve to the final position.
pub fn resolve_positions(
    data: &[u8],
    sync: &SyncOutcome,
    targets: &[u32],
) -> Vec<StreamPosition> {
    let mut walker = FrameWalker::new(data, sync);
    let mut positions = Vec::with_capacity(targets.len());
    let mut i = 0;
    loop {
        while i < targets.len() && walker.frame_count() >= targets[i] {
            positions.push(snapshot(&walker));
            i += 1;
        }
        if i == targets.len() || walker.next_frame().is_none() {
            break;
        }
    }
    while i < targets.len() {
        positions.push(snapshot(&walker));
        i += 1;
    }
    positions
}

fn snapshot(walker: &FrameWalker<'_>) -> StreamPosition {
    StreamPosition {
        time_ms: walker.millis(),
        frame: walker.frame_count(),
        byte_offset: walker.byte_offset(),
    }
}

/// Resolve a frame-level result into byte/time positions.
pub fn resolve_result(data: &[u8], sync: &SyncOutcome, raw: &RawResult) -> SearchResult {
    let positions = resolve_positions(data, sync, &[raw.start_frame, raw.end_frame]);
    SearchResult {
        start: positions[0],
        end: positions[1],
        correlation: raw.correlation,
    }
}
