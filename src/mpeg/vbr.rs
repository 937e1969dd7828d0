//! VBR metadata headers embedded in the first audio frame.
//!
//! Three sources of whole-stream frame/byte counts exist: a Xing header, a
//! VBRI header, or a full-file counting sweep when a stream drifts without
//! carrying either (see [`super::sync::full_sweep`]). All of them feed the
//! same derived playing-time and average-bitrate arithmetic.

use crate::mpeg::frame::{ChannelMode, FrameHeader, Layer, MpegVersion};

const XING_ID: &[u8; 4] = b"Xing";
const VBRI_ID: &[u8; 4] = b"VBRI";

// Both header kinds sit within the first 40 bytes of the frame.
const SCAN_WINDOW: usize = 40;

const XING_FRAMES_FLAG: u32 = 0x01;
const XING_BYTES_FLAG: u32 = 0x02;
const XING_TOC_FLAG: u32 = 0x04;
const XING_QUALITY_FLAG: u32 = 0x08;

/// Seek-table data carried by a VBRI header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbriToc {
    pub entries: u16,
    pub scale: u16,
    pub bytes_per_entry: u16,
    pub frames_per_entry: u16,
}

/// VBR metadata found (or synthesized) for a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum VbrHeader {
    /// No VBR metadata; the stream is taken to be CBR.
    Absent,
    Xing {
        frames: Option<u32>,
        /// Byte count from the header, or the file length when the header
        /// omits it.
        bytes: Option<u64>,
        toc: Option<Vec<u8>>,
        quality: Option<u32>,
    },
    Vbri {
        version: u16,
        quality: u16,
        frames: u32,
        bytes: u64,
        toc: VbriToc,
        /// Total header length: 26 fixed bytes plus the seek table.
        header_len: u32,
    },
    /// Counts measured by a full-file sweep of a VBR stream that carries no
    /// embedded header.
    Pseudo { frames: u32, bytes: u64 },
}

fn read_u16_be(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32_be(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn find_marker(frame: &[u8], id: &[u8; 4]) -> Option<usize> {
    let window = &frame[..frame.len().min(SCAN_WINDOW)];
    window.windows(id.len()).position(|w| w == id)
}

/// Expected Xing offset from frame start: 4 header bytes plus the Layer III
/// side information, whose size depends on version and channel count.
fn expected_xing_offset(header: &FrameHeader) -> usize {
    let mono = header.channel_mode == ChannelMode::Mono;
    match (header.version == MpegVersion::Mpeg1, mono) {
        (true, true) => 21,
        (true, false) => 36,
        (false, true) => 13,
        (false, false) => 21,
    }
}

impl VbrHeader {
    /// Look for VBR metadata in the first audio frame. `frame` starts at
    /// the frame's own header bytes; `file_len` substitutes for a missing
    /// byte count. Returns [`VbrHeader::Absent`] when nothing parseable is
    /// found.
    pub fn detect(header: &FrameHeader, frame: &[u8], file_len: u64) -> VbrHeader {
        if let Some(at) = find_marker(frame, XING_ID) {
            let expected = expected_xing_offset(header);
            if at != expected {
                log::warn!("Xing header found at offset {at}, expected {expected}");
            }
            if let Some(parsed) = parse_xing(frame, at, file_len) {
                return parsed;
            }
            log::warn!("truncated Xing header ignored");
        }
        if let Some(at) = find_marker(frame, VBRI_ID) {
            if at != 36 {
                log::warn!("VBRI header found at offset {at}, expected 36");
            }
            if let Some(parsed) = parse_vbri(frame, at) {
                return parsed;
            }
            log::warn!("corrupt VBRI header ignored");
        }
        VbrHeader::Absent
    }

    /// Total frame count, when known.
    pub fn frames(&self) -> Option<u32> {
        match self {
            VbrHeader::Absent => None,
            VbrHeader::Xing { frames, .. } => *frames,
            VbrHeader::Vbri { frames, .. } => Some(*frames),
            VbrHeader::Pseudo { frames, .. } => Some(*frames),
        }
    }

    /// Total audio byte count, when known.
    pub fn bytes(&self) -> Option<u64> {
        match self {
            VbrHeader::Absent => None,
            VbrHeader::Xing { bytes, .. } => *bytes,
            VbrHeader::Vbri { bytes, .. } => Some(*bytes),
            VbrHeader::Pseudo { bytes, .. } => Some(*bytes),
        }
    }

    /// Playing time in seconds derived from the frame count.
    pub fn playing_time_secs(&self, header: &FrameHeader) -> Option<f64> {
        let frames = self.frames()? as f64;
        Some(frames * time_per_frame(header))
    }

    /// Average bitrate in kbps derived from frame and byte counts.
    pub fn average_kbps(&self, header: &FrameHeader) -> Option<u32> {
        let seconds = self.playing_time_secs(header)?;
        if seconds <= 0.0 {
            return None;
        }
        let bits = self.bytes()? as f64 * 8.0;
        Some((bits / seconds / 1000.0).round() as u32)
    }
}

/// Seconds of audio per frame. The per-layer sample counts are for MPEG1;
/// later versions carry half as many samples per frame.
fn time_per_frame(header: &FrameHeader) -> f64 {
    let samples = match header.layer {
        Layer::Layer1 => 384.0,
        Layer::Layer2 | Layer::Layer3 => 1152.0,
    };
    let tpf = samples / header.sample_rate as f64;
    if header.version == MpegVersion::Mpeg1 {
        tpf
    } else {
        tpf / 2.0
    }
}

fn parse_xing(frame: &[u8], marker_at: usize, file_len: u64) -> Option<VbrHeader> {
    let mut at = marker_at + 4;
    let flags = read_u32_be(frame, at)?;
    at += 4;

    let frames = if flags & XING_FRAMES_FLAG != 0 {
        let n = read_u32_be(frame, at)?;
        at += 4;
        Some(n)
    } else {
        None
    };
    let bytes = if flags & XING_BYTES_FLAG != 0 {
        let n = read_u32_be(frame, at)?;
        at += 4;
        Some(n as u64)
    } else {
        // The frame count is still usable for timing if the byte count is
        // missing; fall back to the file length.
        Some(file_len)
    };
    let toc = if flags & XING_TOC_FLAG != 0 {
        let table = frame.get(at..at + 100)?.to_vec();
        at += 100;
        Some(table)
    } else {
        None
    };
    let quality = if flags & XING_QUALITY_FLAG != 0 {
        read_u32_be(frame, at)
    } else {
        None
    };

    Some(VbrHeader::Xing {
        frames,
        bytes,
        toc,
        quality,
    })
}

fn parse_vbri(frame: &[u8], marker_at: usize) -> Option<VbrHeader> {
    let at = marker_at + 4;
    let version = read_u16_be(frame, at)?;
    // Two bytes of encoder delay are skipped.
    let quality = read_u16_be(frame, at + 4)?;
    let bytes = read_u32_be(frame, at + 6)? as u64;
    let frames = read_u32_be(frame, at + 10)?;
    let entries = read_u16_be(frame, at + 14)?;
    let scale = read_u16_be(frame, at + 16)?;
    let bytes_per_entry = read_u16_be(frame, at + 18)?;
    let frames_per_entry = read_u16_be(frame, at + 20)?;

    if bytes_per_entry > 4 {
        return None;
    }

    Some(VbrHeader::Vbri {
        version,
        quality,
        frames,
        bytes,
        toc: VbriToc {
            entries,
            scale,
            bytes_per_entry,
            frames_per_entry,
        },
        header_len: 26 + entries as u32 * bytes_per_entry as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // MPEG1 Layer III, 128 kbps, 44.1 kHz, stereo.
    fn stereo_header() -> FrameHeader {
        FrameHeader::parse([0xFF, 0xFB, 0x90, 0x00]).unwrap()
    }

    fn xing_frame(flags: u32, fields: &[u32]) -> Vec<u8> {
        let mut frame = vec![0u8; 417];
        frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        frame[36..40].copy_from_slice(XING_ID);
        frame[40..44].copy_from_slice(&flags.to_be_bytes());
        let mut at = 44;
        for f in fields {
            frame[at..at + 4].copy_from_slice(&f.to_be_bytes());
            at += 4;
        }
        frame
    }

    #[test]
    fn test_detect_absent() {
        let frame = vec![0u8; 417];
        let h = stereo_header();
        assert_eq!(VbrHeader::detect(&h, &frame, 417), VbrHeader::Absent);
    }

    #[test]
    fn test_xing_frames_and_bytes() {
        let frame = xing_frame(0x03, &[4096, 1_500_000]);
        let h = stereo_header();
        let vbr = VbrHeader::detect(&h, &frame, 2_000_000);
        assert_eq!(vbr.frames(), Some(4096));
        assert_eq!(vbr.bytes(), Some(1_500_000));
    }

    #[test]
    fn test_xing_missing_bytes_falls_back_to_file_len() {
        let frame = xing_frame(0x01, &[4096]);
        let h = stereo_header();
        let vbr = VbrHeader::detect(&h, &frame, 2_000_000);
        assert_eq!(vbr.frames(), Some(4096));
        assert_eq!(vbr.bytes(), Some(2_000_000));
    }

    #[test]
    fn test_xing_with_toc_and_quality() {
        let mut frame = xing_frame(0x0F, &[4096, 1_500_000]);
        for i in 0..100 {
            frame[52 + i] = i as u8;
        }
        frame[152..156].copy_from_slice(&57u32.to_be_bytes());
        let h = stereo_header();
        match VbrHeader::detect(&h, &frame, 2_000_000) {
            VbrHeader::Xing { toc, quality, .. } => {
                let toc = toc.unwrap();
                assert_eq!(toc.len(), 100);
                assert_eq!(toc[99], 99);
                assert_eq!(quality, Some(57));
            }
            other => panic!("expected Xing, got {other:?}"),
        }
    }

    #[test]
    fn test_xing_playing_time_and_average() {
        let frame = xing_frame(0x03, &[4096, 1_500_000]);
        let h = stereo_header();
        let vbr = VbrHeader::detect(&h, &frame, 2_000_000);
        // 4096 * 1152 / 44100 = 107.01 seconds
        let secs = vbr.playing_time_secs(&h).unwrap();
        assert!((secs - 107.01).abs() < 0.01);
        // 1_500_000 * 8 / 107.01 / 1000 = 112 kbps
        assert_eq!(vbr.average_kbps(&h), Some(112));
    }

    #[test]
    fn test_vbri_parse() {
        let mut frame = vec![0u8; 1044];
        frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        frame[36..40].copy_from_slice(VBRI_ID);
        frame[40..42].copy_from_slice(&1u16.to_be_bytes()); // version
        frame[42..44].copy_from_slice(&576u16.to_be_bytes()); // delay, skipped
        frame[44..46].copy_from_slice(&80u16.to_be_bytes()); // quality
        frame[46..50].copy_from_slice(&1_234_567u32.to_be_bytes()); // bytes
        frame[50..54].copy_from_slice(&3000u32.to_be_bytes()); // frames
        frame[54..56].copy_from_slice(&120u16.to_be_bytes()); // toc entries
        frame[56..58].copy_from_slice(&1u16.to_be_bytes()); // scale
        frame[58..60].copy_from_slice(&2u16.to_be_bytes()); // bytes/entry
        frame[60..62].copy_from_slice(&25u16.to_be_bytes()); // frames/entry
        let h = stereo_header();
        match VbrHeader::detect(&h, &frame, 2_000_000) {
            VbrHeader::Vbri {
                version,
                quality,
                frames,
                bytes,
                toc,
                header_len,
            } => {
                assert_eq!(version, 1);
                assert_eq!(quality, 80);
                assert_eq!(frames, 3000);
                assert_eq!(bytes, 1_234_567);
                assert_eq!(toc.entries, 120);
                assert_eq!(toc.bytes_per_entry, 2);
                assert_eq!(toc.frames_per_entry, 25);
                assert_eq!(header_len, 26 + 240);
            }
            other => panic!("expected Vbri, got {other:?}"),
        }
    }

    #[test]
    fn test_vbri_oversized_entries_rejected() {
        let mut frame = vec![0u8; 417];
        frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        frame[36..40].copy_from_slice(VBRI_ID);
        frame[58..60].copy_from_slice(&9u16.to_be_bytes()); // bytes/entry > 4
        let h = stereo_header();
        assert_eq!(VbrHeader::detect(&h, &frame, 417), VbrHeader::Absent);
    }

    #[test]
    fn test_pseudo_derivations() {
        let h = stereo_header();
        let vbr = VbrHeader::Pseudo {
            frames: 2000,
            bytes: 810_000,
        };
        // 2000 * 1152 / 44100 = 52.24 s; 810000*8/52.24/1000 = 124.03 kbps
        let secs = vbr.playing_time_secs(&h).unwrap();
        assert!((secs - 52.24).abs() < 0.01);
        assert_eq!(vbr.average_kbps(&h), Some(124));
    }
}
