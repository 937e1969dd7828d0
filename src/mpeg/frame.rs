//! MPEG audio frame header parsing.
//!
//! A frame header is four bytes: 11 sync bits followed by version, layer,
//! bitrate index, sample-rate index, padding, channel mode and emphasis
//! fields. Parsing is pure; all stream walking lives in [`super::sync`].

/// MPEG version from header bits 19-20.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

/// Layer from header bits 17-18.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Layer1,
    Layer2,
    Layer3,
}

/// Channel mode from header bits 6-7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Stereo,
    JointStereo,
    DualChannel,
    Mono,
}

/// Nominal bitrate. Index 0 declares free format: the encoder used a fixed
/// bitrate outside the table, and the frame length must be measured from the
/// distance to the next sync word instead of computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitrate {
    Free,
    Kbps(u32),
}

// Bitrate tables in kbps, indexed by the 4-bit bitrate field (index 0 is
// free format, index 15 is invalid and rejected before lookup).
const BITRATES_V1_L1: [u32; 15] = [
    0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
];
const BITRATES_V1_L2: [u32; 15] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
];
const BITRATES_V1_L3: [u32; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const BITRATES_V2_L1: [u32; 15] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256,
];
const BITRATES_V2_L23: [u32; 15] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160,
];

const SAMPLE_RATES_V1: [u32; 3] = [44100, 48000, 32000];
const SAMPLE_RATES_V2: [u32; 3] = [22050, 24000, 16000];
const SAMPLE_RATES_V25: [u32; 3] = [11025, 12000, 8000];

/// Parsed MPEG audio frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub layer: Layer,
    pub bitrate: Bitrate,
    pub sample_rate: u32,
    pub padding: bool,
    pub protection: bool,
    pub channel_mode: ChannelMode,
    pub samples_per_frame: u32,
}

impl FrameHeader {
    /// Parse a 4-byte frame header. Returns `None` for anything that is not
    /// a syntactically valid header: bad sync word, reserved version/layer,
    /// invalid bitrate or sample-rate index, or the reserved emphasis value.
    pub fn parse(header: [u8; 4]) -> Option<Self> {
        // Sync word: 11 set bits.
        if header[0] != 0xFF || (header[1] & 0xE0) != 0xE0 {
            return None;
        }

        let version = match (header[1] >> 3) & 0x03 {
            0b00 => MpegVersion::Mpeg25,
            0b10 => MpegVersion::Mpeg2,
            0b11 => MpegVersion::Mpeg1,
            _ => return None,
        };

        let layer = match (header[1] >> 1) & 0x03 {
            0b01 => Layer::Layer3,
            0b10 => Layer::Layer2,
            0b11 => Layer::Layer1,
            _ => return None,
        };

        let protection = (header[1] & 0x01) == 0;

        let bitrate_index = (header[2] >> 4) as usize;
        if bitrate_index == 15 {
            return None;
        }
        let bitrate = if bitrate_index == 0 {
            Bitrate::Free
        } else {
            let table = match (version, layer) {
                (MpegVersion::Mpeg1, Layer::Layer1) => &BITRATES_V1_L1,
                (MpegVersion::Mpeg1, Layer::Layer2) => &BITRATES_V1_L2,
                (MpegVersion::Mpeg1, Layer::Layer3) => &BITRATES_V1_L3,
                (_, Layer::Layer1) => &BITRATES_V2_L1,
                (_, _) => &BITRATES_V2_L23,
            };
            Bitrate::Kbps(table[bitrate_index])
        };

        let rate_index = ((header[2] >> 2) & 0x03) as usize;
        if rate_index == 3 {
            return None;
        }
        let sample_rate = match version {
            MpegVersion::Mpeg1 => SAMPLE_RATES_V1[rate_index],
            MpegVersion::Mpeg2 => SAMPLE_RATES_V2[rate_index],
            MpegVersion::Mpeg25 => SAMPLE_RATES_V25[rate_index],
        };

        // Emphasis value 2 is reserved.
        if header[3] & 0x03 == 0x02 {
            return None;
        }

        let padding = (header[2] & 0x02) != 0;

        let channel_mode = match (header[3] >> 6) & 0x03 {
            0b00 => ChannelMode::Stereo,
            0b01 => ChannelMode::JointStereo,
            0b10 => ChannelMode::DualChannel,
            _ => ChannelMode::Mono,
        };

        let samples_per_frame = match (version, layer) {
            (_, Layer::Layer1) => 384,
            (_, Layer::Layer2) => 1152,
            (MpegVersion::Mpeg1, Layer::Layer3) => 1152,
            (_, Layer::Layer3) => 576,
        };

        Some(FrameHeader {
            version,
            layer,
            bitrate,
            sample_rate,
            padding,
            protection,
            channel_mode,
            samples_per_frame,
        })
    }

    /// Frame length in bytes including the header and any padding slot.
    /// `None` for free-format streams, whose length must be measured.
    pub fn frame_len(&self) -> Option<usize> {
        match self.bitrate {
            Bitrate::Free => None,
            Bitrate::Kbps(kbps) => {
                let len = self.unpadded_len(kbps)
                    + if self.padding { self.slot_len() } else { 0 };
                Some(len)
            }
        }
    }

    /// Frame length without the padding slot, for a given bitrate in kbps.
    pub fn unpadded_len(&self, kbps: u32) -> usize {
        let kbps = kbps as usize;
        let rate = self.sample_rate as usize;
        match self.layer {
            Layer::Layer1 => 12_000 * kbps / rate * 4,
            Layer::Layer2 => 144_000 * kbps / rate,
            Layer::Layer3 => {
                let coefficient = if self.version == MpegVersion::Mpeg1 {
                    144_000
                } else {
                    72_000
                };
                coefficient * kbps / rate
            }
        }
    }

    /// Size of the padding slot in bytes: one sample slot, which is four
    /// bytes in Layer I and one byte otherwise.
    pub fn slot_len(&self) -> usize {
        match self.layer {
            Layer::Layer1 => 4,
            _ => 1,
        }
    }

    /// Inverse of [`unpadded_len`](Self::unpadded_len): back-calculate the
    /// bitrate in kbps from a measured unpadded frame length. Used for
    /// free-format streams.
    pub fn bitrate_for_len(&self, unpadded_len: usize) -> u32 {
        let len = unpadded_len;
        let rate = self.sample_rate as usize;
        let kbps = match self.layer {
            Layer::Layer1 => len / 4 * rate / 12_000,
            Layer::Layer2 => len * rate / 144_000,
            Layer::Layer3 => {
                let coefficient = if self.version == MpegVersion::Mpeg1 {
                    144_000
                } else {
                    72_000
                };
                len * rate / coefficient
            }
        };
        kbps as u32
    }

    /// Playing time of one frame in milliseconds.
    pub fn ms_per_frame(&self) -> f64 {
        self.samples_per_frame as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Whether two headers may belong to the same stream. The verification
    /// sweep locks version and layer on the first candidate; bitrate and
    /// padding may change from frame to frame.
    pub fn compatible_with(&self, other: &FrameHeader) -> bool {
        self.version == other.version && self.layer == other.layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // MPEG1 Layer III, 128 kbps, 44.1 kHz, no padding, stereo.
    fn valid_header() -> [u8; 4] {
        [0xFF, 0xFB, 0x90, 0x00]
    }

    #[test]
    fn test_parse_valid_header() {
        let h = FrameHeader::parse(valid_header()).unwrap();
        assert_eq!(h.version, MpegVersion::Mpeg1);
        assert_eq!(h.layer, Layer::Layer3);
        assert_eq!(h.bitrate, Bitrate::Kbps(128));
        assert_eq!(h.sample_rate, 44100);
        assert_eq!(h.channel_mode, ChannelMode::Stereo);
        assert_eq!(h.samples_per_frame, 1152);
        assert!(!h.padding);
    }

    #[test]
    fn test_frame_len_128kbps() {
        let h = FrameHeader::parse(valid_header()).unwrap();
        // 144000 * 128 / 44100 = 417
        assert_eq!(h.frame_len(), Some(417));
    }

    #[test]
    fn test_frame_len_with_padding() {
        let mut header = valid_header();
        header[2] |= 0x02;
        let h = FrameHeader::parse(header).unwrap();
        assert!(h.padding);
        assert_eq!(h.frame_len(), Some(418));
    }

    #[test]
    fn test_free_format_header_accepted() {
        let h = FrameHeader::parse([0xFF, 0xFB, 0x00, 0x00]).unwrap();
        assert_eq!(h.bitrate, Bitrate::Free);
        assert_eq!(h.frame_len(), None);
    }

    #[test]
    fn test_invalid_sync_rejected() {
        assert!(FrameHeader::parse([0xFE, 0xFB, 0x90, 0x00]).is_none());
        assert!(FrameHeader::parse([0xFF, 0x1B, 0x90, 0x00]).is_none());
    }

    #[test]
    fn test_invalid_bitrate_index_rejected() {
        assert!(FrameHeader::parse([0xFF, 0xFB, 0xF0, 0x00]).is_none());
    }

    #[test]
    fn test_invalid_sample_rate_index_rejected() {
        assert!(FrameHeader::parse([0xFF, 0xFB, 0x9C, 0x00]).is_none());
    }

    #[test]
    fn test_reserved_emphasis_rejected() {
        assert!(FrameHeader::parse([0xFF, 0xFB, 0x90, 0x02]).is_none());
    }

    #[test]
    fn test_mpeg2_layer3_frame() {
        // MPEG2 Layer III, 64 kbps, 22.05 kHz.
        let h = FrameHeader::parse([0xFF, 0xF3, 0x80, 0x00]).unwrap();
        assert_eq!(h.version, MpegVersion::Mpeg2);
        assert_eq!(h.sample_rate, 22050);
        assert_eq!(h.samples_per_frame, 576);
        // 72000 * 64 / 22050 = 208
        assert_eq!(h.frame_len(), Some(208));
    }

    #[test]
    fn test_bitrate_back_calculation() {
        let h = FrameHeader::parse(valid_header()).unwrap();
        assert_eq!(h.bitrate_for_len(417), 127); // integer truncation
        assert_eq!(h.bitrate_for_len(418), 128);
    }

    #[test]
    fn test_ms_per_frame() {
        let h = FrameHeader::parse(valid_header()).unwrap();
        let ms = h.ms_per_frame();
        assert!((ms - 26.122).abs() < 0.001);
    }
}
