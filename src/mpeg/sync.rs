//! Frame synchronization over a byte slice.
//!
//! A sync word alone is not proof of a frame: random data produces them
//! freely. A candidate offset is accepted only when a chain of
//! correctly-spaced valid headers follows it across the sync range. Frames
//! whose computed length drifts mark the stream as VBR; a length change that
//! still lands on a valid header is tracked, not treated as a contradiction.

use crate::error::{Error, Result};
use crate::mpeg::frame::{Bitrate, FrameHeader};

const HEADER_LEN: usize = 4;

/// Default number of bytes a candidate must stay synchronized over before
/// it is accepted as the start of audio.
pub const DEFAULT_MIN_SYNC_RANGE: usize = 0x4000;

/// Outcome of a successful [`locate`].
#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    /// Byte offset of the first audio frame.
    pub offset: usize,
    /// Header of the first audio frame.
    pub header: FrameHeader,
    /// Whether frame lengths drifted within the verified range.
    pub vbr: bool,
    /// Measured unpadded frame length for free-format streams.
    pub free_format_len: Option<usize>,
}

/// Frame count and byte span accumulated by a verification walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub frames: u32,
    pub bytes: u64,
}

struct Walk {
    /// True when the walk stayed synchronized past its goal offset.
    completed: bool,
    vbr: bool,
    stats: SweepStats,
}

/// Number of bytes occupied by a leading ID3v2 block, if present.
/// The tag size is a 28-bit syncsafe integer excluding the 10-byte header.
pub fn id3v2_len(data: &[u8]) -> usize {
    if data.len() < 10 || &data[..3] != b"ID3" {
        return 0;
    }
    let size = ((data[6] as usize & 0x7F) << 21)
        | ((data[7] as usize & 0x7F) << 14)
        | ((data[8] as usize & 0x7F) << 7)
        | (data[9] as usize & 0x7F);
    10 + size
}

fn header_at(data: &[u8], offset: usize) -> Option<FrameHeader> {
    if offset + HEADER_LEN > data.len() {
        return None;
    }
    FrameHeader::parse([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Scan forward from `from` for the next byte offset holding a parseable
/// header, optionally constrained to be compatible with `like`.
fn next_candidate(
    data: &[u8],
    from: usize,
    like: Option<&FrameHeader>,
) -> Option<(usize, FrameHeader)> {
    let mut at = from;
    while at + HEADER_LEN <= data.len() {
        if data[at] == 0xFF {
            if let Some(h) = header_at(data, at) {
                let ok = match like {
                    Some(first) => {
                        h.compatible_with(first)
                            && (first.bitrate != Bitrate::Free || h.bitrate == Bitrate::Free)
                    }
                    None => true,
                };
                if ok {
                    return Some((at, h));
                }
            }
        }
        at += 1;
    }
    None
}

/// Walk a chain of frames starting at `offset` with initial unpadded length
/// `start_len`. In CBR mode (free format) the length is held constant;
/// otherwise each frame's length is recomputed from its own header, and a
/// change flags VBR. The walk completes once it passes `goal`; running off
/// the end of the data first leaves `completed` false but the accumulated
/// stats valid.
fn walk(
    data: &[u8],
    offset: usize,
    first: &FrameHeader,
    start_len: usize,
    goal: usize,
    hold_len: bool,
) -> Walk {
    let mut at = offset;
    let mut len = start_len;
    let mut current = *first;
    let mut vbr = false;
    let mut frames: u32 = 1;

    loop {
        let padded = len + if current.padding { current.slot_len() } else { 0 };
        let next = at + padded;
        if next + HEADER_LEN > data.len() {
            return Walk {
                completed: false,
                vbr,
                stats: SweepStats {
                    frames,
                    bytes: (at + len - offset) as u64,
                },
            };
        }
        let header = match header_at(data, next) {
            Some(h) if h.compatible_with(first) => h,
            _ => {
                log::debug!("lost sync at {next:#x} after {frames} frames");
                return Walk {
                    completed: false,
                    vbr,
                    stats: SweepStats {
                        frames,
                        bytes: (at + len - offset) as u64,
                    },
                };
            }
        };
        frames += 1;
        at = next;
        current = header;
        if !hold_len {
            match header.bitrate {
                Bitrate::Kbps(kbps) => {
                    let new_len = header.unpadded_len(kbps);
                    if new_len != len {
                        vbr = true;
                    }
                    len = new_len;
                }
                Bitrate::Free => {
                    // A free-format frame inside a tabled-bitrate chain is
                    // a contradiction.
                    return Walk {
                        completed: false,
                        vbr,
                        stats: SweepStats {
                            frames,
                            bytes: (at + len - offset) as u64,
                        },
                    };
                }
            }
        }
        if at >= goal {
            return Walk {
                completed: true,
                vbr,
                stats: SweepStats {
                    frames,
                    bytes: (at + len - offset) as u64,
                },
            };
        }
    }
}

/// Locate the first audio frame. Candidates are tried in file order; each
/// must stay synchronized over `min_sync_range` bytes (clamped to three
/// quarters of the data) before being accepted. On contradiction the scan
/// resumes one byte past the failed candidate.
pub fn locate(data: &[u8], min_sync_range: usize) -> Result<SyncOutcome> {
    let start = id3v2_len(data);
    if start > 0 {
        log::debug!("skipping {start} bytes of ID3v2 data");
    }
    let goal = (data.len() * 3 / 4).min(start.saturating_add(min_sync_range));

    let mut at = start;
    while let Some((offset, header)) = next_candidate(data, at, None) {
        log::debug!("sync word candidate at {offset:#x}");
        match header.bitrate {
            Bitrate::Kbps(kbps) => {
                let w = walk(data, offset, &header, header.unpadded_len(kbps), goal, false);
                if w.completed {
                    return Ok(SyncOutcome {
                        offset,
                        header,
                        vbr: w.vbr,
                        free_format_len: None,
                    });
                }
            }
            Bitrate::Free => {
                if let Some(out) = verify_free_format(data, offset, &header, goal) {
                    return Ok(out);
                }
            }
        }
        at = offset + 1;
    }

    Err(Error::format("no MPEG frames found"))
}

/// Free-format verification: measure the frame length as the distance to
/// the next compatible sync word, then hold it constant for the sweep.
fn verify_free_format(
    data: &[u8],
    offset: usize,
    header: &FrameHeader,
    goal: usize,
) -> Option<SyncOutcome> {
    let (next, _) = next_candidate(data, offset + 1, Some(header))?;
    let pad = if header.padding { header.slot_len() } else { 0 };
    let len = next.checked_sub(offset + pad)?;
    if len < HEADER_LEN {
        return None;
    }
    let w = walk(data, offset, header, len, goal, true);
    if !w.completed {
        return None;
    }
    log::debug!("free format frame length measured as {len} bytes");
    Some(SyncOutcome {
        offset,
        header: *header,
        vbr: false,
        free_format_len: Some(len),
    })
}

/// Walk the entire stream from a verified start, counting frames and the
/// byte span they cover. Used to build pseudo VBR data for streams that
/// drift but carry no Xing/VBRI header.
pub fn full_sweep(data: &[u8], sync: &SyncOutcome) -> SweepStats {
    let len = match (sync.header.bitrate, sync.free_format_len) {
        (Bitrate::Kbps(kbps), _) => sync.header.unpadded_len(kbps),
        (Bitrate::Free, Some(measured)) => measured,
        (Bitrate::Free, None) => {
            return SweepStats { frames: 0, bytes: 0 };
        }
    };
    let hold = sync.header.bitrate == Bitrate::Free;
    walk(data, sync.offset, &sync.header, len, data.len(), hold).stats
}
