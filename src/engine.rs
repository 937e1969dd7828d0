//! Engine: marker lookup, pattern cache and the per-file search surface.
//!
//! Markers live in a directory as `<key>start` / `<key>end` clips, where
//! the key is derived from the target's file name. A marker is compiled to
//! a [`Pattern`] at most once per run; the compiled form is persisted next
//! to the clip so later runs skip compilation entirely.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::decode::{DecoderFactory, FrameDecoder, SymphoniaDecoder};
use crate::envelope::{FrameWalker, LoudnessExtractor};
use crate::error::{Error, Result};
use crate::matcher;
use crate::mpeg::frame::{Bitrate, ChannelMode, FrameHeader, Layer, MpegVersion};
use crate::mpeg::sync::{self, SyncOutcome};
use crate::mpeg::vbr::VbrHeader;
use crate::pattern::Pattern;
use crate::search::{
    self, in_strategy, out_strategy, MultiStepSearch, SearchResult, SearchStep, StreamPosition,
};

lazy_static! {
    // A broadcast file is named like "show2009-01-31.mp3"; every episode
    // shares the marker keyed by the date-less stem.
    static ref KEY_SUFFIX: Regex = Regex::new(r"(\d{4}-\d{2}-\d{2})?\.[mM][pP]3$").unwrap();
}

/// Which end of the kept region a marker delimits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Start,
    End,
}

impl Role {
    pub fn suffix(self) -> &'static str {
        match self {
            Role::Start => "start",
            Role::End => "end",
        }
    }

    /// Default search ladder for this role.
    pub fn strategy(self) -> Vec<SearchStep> {
        match self {
            Role::Start => in_strategy(),
            Role::End => out_strategy(),
        }
    }
}

/// One resolved cut point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CutPoint {
    pub position: StreamPosition,
    pub correlation: f32,
}

/// Cut points for one file. A missing side falls back to the stream
/// start or end when the region is extracted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CutPoints {
    pub start: Option<CutPoint>,
    pub end: Option<CutPoint>,
}

/// Machine-readable outcome of processing one file.
#[derive(Debug, Clone, Serialize)]
pub struct CutReport {
    pub file: PathBuf,
    pub found: bool,
    pub start_s: Option<f64>,
    pub end_s: Option<f64>,
    pub start_byte: u64,
    pub end_byte: u64,
    pub output: Option<PathBuf>,
}

/// Structural summary of one stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub header: FrameHeader,
    pub audio_offset: u64,
    pub file_len: u64,
    pub vbr: bool,
    pub vbr_header: VbrHeader,
    /// Table bitrate, or the measured bitrate for free-format streams.
    pub nominal_kbps: Option<u32>,
    pub duration_ms: Option<u64>,
    pub average_kbps: Option<u32>,
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = match self.header.version {
            MpegVersion::Mpeg1 => "MPEG1",
            MpegVersion::Mpeg2 => "MPEG2",
            MpegVersion::Mpeg25 => "MPEG2.5",
        };
        let layer = match self.header.layer {
            Layer::Layer1 => "Layer I",
            Layer::Layer2 => "Layer II",
            Layer::Layer3 => "Layer III",
        };
        let mode = match self.header.channel_mode {
            ChannelMode::Stereo => "stereo",
            ChannelMode::JointStereo => "joint stereo",
            ChannelMode::DualChannel => "dual channel",
            ChannelMode::Mono => "mono",
        };
        write!(f, "{version} {layer}, {} Hz, {mode}", self.header.sample_rate)?;
        match (self.vbr_header.frames(), self.average_kbps, self.nominal_kbps) {
            (Some(frames), Some(avg), _) => write!(f, ", VBR {avg} kbps avg, {frames} frames")?,
            (None, _, Some(kbps)) => write!(f, ", CBR {kbps} kbps")?,
            _ => write!(f, ", bitrate unknown")?,
        }
        if let Some(ms) = self.duration_ms {
            write!(f, ", {}:{:04.1}", ms / 60_000, (ms % 60_000) as f64 / 1000.0)?;
        }
        write!(
            f,
            ", {} bytes, audio at {:#x}",
            self.file_len, self.audio_offset
        )
    }
}

type CacheSlot = Arc<Mutex<Option<Option<Arc<MultiStepSearch>>>>>;

pub struct Engine {
    marker_dir: PathBuf,
    min_sync_range: usize,
    decoder_factory: DecoderFactory,
    searches: Mutex<HashMap<String, CacheSlot>>,
}

fn relock<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    // A panicked worker poisons the mutex; the cached data itself is
    // still coherent.
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Engine {
    pub fn new(marker_dir: impl Into<PathBuf>) -> Self {
        Engine {
            marker_dir: marker_dir.into(),
            min_sync_range: sync::DEFAULT_MIN_SYNC_RANGE,
            decoder_factory: Box::new(|| -> Result<Box<dyn FrameDecoder>> {
                let decoder = SymphoniaDecoder::new()?;
                Ok(Box::new(decoder))
            }),
            searches: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_min_sync_range(mut self, bytes: usize) -> Self {
        self.min_sync_range = bytes;
        self
    }

    /// Replace the decoder behind marker compilation and searches.
    pub fn with_decoder_factory(mut self, factory: DecoderFactory) -> Self {
        self.decoder_factory = factory;
        self
    }

    /// Marker key for a file: the stem with any trailing `YYYY-MM-DD.mp3`
    /// (or bare `.mp3`) removed, plus the role suffix.
    pub fn marker_key(&self, file_name: &str, role: Role) -> String {
        let stem = KEY_SUFFIX.replace(file_name, "");
        format!("{stem}{}", role.suffix())
    }

    /// Look up (and compile on first use) the search for one file/role.
    /// `None` means no marker exists for the key. Distinct keys compile
    /// concurrently; the same key compiles exactly once.
    pub fn get_search(&self, file_name: &str, role: Role) -> Result<Option<Arc<MultiStepSearch>>> {
        let key = self.marker_key(file_name, role);
        let slot = {
            let mut map = relock(self.searches.lock());
            map.entry(key.clone()).or_default().clone()
        };
        let mut entry = relock(slot.lock());
        if entry.is_none() {
            *entry = Some(self.load_search(&key, role)?);
        }
        Ok(entry.clone().unwrap_or(None))
    }

    fn load_search(&self, key: &str, role: Role) -> Result<Option<Arc<MultiStepSearch>>> {
        let pattern = match self.load_pattern(key)? {
            Some(pattern) => pattern,
            None => {
                log::debug!("no marker for key {key:?}");
                return Ok(None);
            }
        };
        let search = MultiStepSearch::new(Arc::new(pattern), role.strategy())?;
        Ok(Some(Arc::new(search)))
    }

    fn load_pattern(&self, key: &str) -> Result<Option<Pattern>> {
        let compiled = self.marker_dir.join(format!("{key}.pattern"));
        let clip = self.marker_dir.join(format!("{key}.mp3"));

        if compiled.is_file() {
            match fs::read(&compiled).map_err(Error::from).and_then(|bytes| {
                Pattern::read_serialized(bytes.as_slice())
            }) {
                Ok(pattern) => return Ok(Some(pattern)),
                Err(err) if clip.is_file() => {
                    log::warn!(
                        "unreadable compiled pattern {} ({err}), recompiling",
                        compiled.display()
                    );
                }
                Err(err) => return Err(err),
            }
        }
        if !clip.is_file() {
            return Ok(None);
        }

        log::info!("compiling marker {}", clip.display());
        let data = fs::read(&clip)?;
        let mut decoder = (self.decoder_factory)()?;
        let pattern = Pattern::from_mp3(&data, &mut *decoder)?;
        if let Err(err) = pattern.store(&compiled) {
            log::warn!("could not persist {} ({err})", compiled.display());
            let _ = fs::remove_file(&compiled);
        }
        Ok(Some(pattern))
    }

    /// Run a compiled search against raw stream bytes.
    pub fn find(&self, data: &[u8], search: &MultiStepSearch) -> Result<Option<SearchResult>> {
        let sync = sync::locate(data, self.min_sync_range)?;
        let info = self.info_from(data, &sync);
        let total_ms = info
            .duration_ms
            .unwrap_or(0)
            .min(u32::MAX as u64) as u32;

        let raw = search.run(total_ms, |from, to| {
            // Each step replays the stream from the start.
            let mut decoder = (self.decoder_factory)()?;
            let walker = FrameWalker::new(data, &sync);
            let mut extractor =
                LoudnessExtractor::new(walker, &mut *decoder, search.pattern().samples_per_frame());
            matcher::sweep(search.pattern(), &mut extractor, from, to)
        })?;
        Ok(raw.map(|r| search::resolve_result(data, &sync, &r)))
    }

    /// Correlate one marker over an explicit playing-time window instead of
    /// its step ladder. `None` when the best correlation stays below
    /// `threshold`.
    pub fn find_in_window(
        &self,
        data: &[u8],
        search: &MultiStepSearch,
        from_ms: u32,
        to_ms: u32,
        threshold: f32,
    ) -> Result<Option<SearchResult>> {
        let step = SearchStep::new(threshold, from_ms as i64, to_ms as i64);
        let single = MultiStepSearch::new(Arc::clone(search.pattern()), vec![step])?;
        self.find(data, &single)
    }

    /// VBR metadata for a stream (embedded header, measured pseudo header,
    /// or [`VbrHeader::Absent`] for plain CBR).
    pub fn vbr_info(&self, data: &[u8]) -> Result<VbrHeader> {
        Ok(self.stream_info(data)?.vbr_header)
    }

    /// Cut points for a stream, given the file name its markers key on.
    /// The start cut is the *end* of the start-marker match; the end cut is
    /// the *start* of the end-marker match. A start at or after the end is
    /// a format error for the file.
    pub fn cut_points_in(&self, data: &[u8], file_name: &str) -> Result<CutPoints> {
        let start = match self.get_search(file_name, Role::Start)? {
            Some(search) => self.find(data, &search)?.map(|r| CutPoint {
                position: r.end,
                correlation: r.correlation,
            }),
            None => None,
        };
        let end = match self.get_search(file_name, Role::End)? {
            Some(search) => self.find(data, &search)?.map(|r| CutPoint {
                position: r.start,
                correlation: r.correlation,
            }),
            None => None,
        };
        if let (Some(s), Some(e)) = (&start, &end) {
            if e.position.time_ms <= s.position.time_ms {
                return Err(Error::format(format!(
                    "cut start {} ms is not before cut end {} ms",
                    s.position.time_ms, e.position.time_ms
                )));
            }
        }
        Ok(CutPoints { start, end })
    }

    /// Process one file: locate cut points and, when an output directory is
    /// given and at least one marker matched, write the kept byte range to
    /// a file of the same name there.
    pub fn process_file(&self, path: &Path, output_dir: Option<&Path>) -> Result<CutReport> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::format(format!("unusable file name: {}", path.display())))?;
        let data = fs::read(path)?;
        let cut = self.cut_points_in(&data, file_name)?;

        let found = cut.start.is_some() || cut.end.is_some();
        let start_byte = cut.start.map_or(0, |p| p.position.byte_offset);
        let end_byte = cut
            .end
            .map_or(data.len() as u64, |p| p.position.byte_offset);

        let mut output = None;
        if found {
            if let Some(dir) = output_dir {
                let out_path = dir.join(file_name);
                fs::write(&out_path, &data[start_byte as usize..end_byte as usize])?;
                log::info!(
                    "{file_name}: kept bytes {start_byte}..{end_byte} -> {}",
                    out_path.display()
                );
                output = Some(out_path);
            }
        } else {
            log::info!("{file_name}: no cut points found");
        }

        Ok(CutReport {
            file: path.to_path_buf(),
            found,
            start_s: cut.start.map(|p| p.position.time_ms as f64 / 1000.0),
            end_s: cut.end.map(|p| p.position.time_ms as f64 / 1000.0),
            start_byte,
            end_byte,
            output,
        })
    }

    /// Structural summary of a stream: first header, audio offset, VBR
    /// metadata and derived duration/bitrate.
    pub fn stream_info(&self, data: &[u8]) -> Result<StreamInfo> {
        let sync = sync::locate(data, self.min_sync_range)?;
        Ok(self.info_from(data, &sync))
    }

    fn info_from(&self, data: &[u8], sync: &SyncOutcome) -> StreamInfo {
        let header = sync.header;
        let file_len = data.len() as u64;

        let frame_len = match (header.frame_len(), sync.free_format_len) {
            (Some(len), _) => Some(len),
            (None, Some(measured)) => {
                Some(measured + if header.padding { header.slot_len() } else { 0 })
            }
            (None, None) => None,
        };
        let first_frame = frame_len
            .map(|len| &data[sync.offset..data.len().min(sync.offset + len)])
            .unwrap_or(&[]);

        let mut vbr_header = VbrHeader::detect(&header, first_frame, file_len);
        if vbr_header == VbrHeader::Absent && sync.vbr {
            let stats = sync::full_sweep(data, sync);
            log::debug!(
                "no VBR header in drifting stream; measured {} frames over {} bytes",
                stats.frames,
                stats.bytes
            );
            vbr_header = VbrHeader::Pseudo {
                frames: stats.frames,
                bytes: stats.bytes,
            };
        }

        let nominal_kbps = match (header.bitrate, sync.free_format_len) {
            (Bitrate::Kbps(kbps), _) => Some(kbps),
            (Bitrate::Free, Some(len)) => Some(header.bitrate_for_len(len)),
            (Bitrate::Free, None) => None,
        };

        let (duration_ms, average_kbps) = match vbr_header.playing_time_secs(&header) {
            Some(secs) => (
                Some((secs * 1000.0).round() as u64),
                vbr_header.average_kbps(&header),
            ),
            None => match nominal_kbps {
                // CBR: duration from the audio byte span and the fixed rate.
                Some(kbps) if kbps > 0 => {
                    let audio_bytes = file_len.saturating_sub(sync.offset as u64);
                    (Some(audio_bytes * 8 / kbps as u64), Some(kbps))
                }
                _ => (None, None),
            },
        };

        StreamInfo {
            header,
            audio_offset: sync.offset as u64,
            file_len,
            vbr: sync.vbr,
            vbr_header,
            nominal_kbps,
            duration_ms,
            average_kbps,
        }
    }
}
