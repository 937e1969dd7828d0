//! Decoder seam.
//!
//! Loudness extraction treats the audio decoder as a black box that turns
//! one compressed frame into one block of downmixed PCM. The trait exists
//! so the envelope and matcher layers can be driven by a deterministic
//! stand-in in tests.

use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_MP3};
use symphonia::core::formats::Packet;

use crate::error::{Error, Result};
use crate::mpeg::FrameHeader;

/// Decodes one MPEG audio frame at a time into single-channel PCM.
pub trait FrameDecoder {
    /// Decode `frame` (header bytes included) to downmixed samples. The
    /// returned slice is valid until the next call. An empty slice means
    /// the frame produced no audio and should be skipped, not counted as
    /// silence.
    fn decode_frame(&mut self, header: &FrameHeader, frame: &[u8]) -> Result<&[i16]>;
}

/// Builds a fresh decoder. Every replay of a stream starts from a clean
/// decoder state, so the engine takes a factory rather than an instance.
pub type DecoderFactory = Box<dyn Fn() -> Result<Box<dyn FrameDecoder>> + Send + Sync>;

/// [`FrameDecoder`] backed by symphonia's MP3 codec.
pub struct SymphoniaDecoder {
    decoder: Box<dyn Decoder>,
    sample_buf: Option<SampleBuffer<i16>>,
    spec: Option<SignalSpec>,
    mono: Vec<i16>,
    ts: u64,
}

impl SymphoniaDecoder {
    pub fn new() -> Result<Self> {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_MP3);
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| Error::format(format!("mp3 decoder unavailable: {e}")))?;
        Ok(SymphoniaDecoder {
            decoder,
            sample_buf: None,
            spec: None,
            mono: Vec::new(),
            ts: 0,
        })
    }
}

impl FrameDecoder for SymphoniaDecoder {
    fn decode_frame(&mut self, header: &FrameHeader, frame: &[u8]) -> Result<&[i16]> {
        let duration = header.samples_per_frame as u64;
        let packet = Packet::new_from_slice(0, self.ts, duration, frame);
        self.ts += duration;

        let decoded = match self.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(err) => {
                // A frame referencing bit-reservoir data we never fed the
                // decoder (mid-stream start) cannot be reconstructed;
                // substitute silence of the nominal length so frame
                // accounting stays intact.
                log::debug!("frame decode failed ({err}), substituting silence");
                self.mono.clear();
                self.mono.resize(header.samples_per_frame as usize, 0);
                return Ok(&self.mono);
            }
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let capacity = decoded.capacity() as u64;
        if self.spec != Some(spec)
            || self
                .sample_buf
                .as_ref()
                .map_or(true, |b| (b.capacity() as u64) < capacity * channels as u64)
        {
            self.sample_buf = Some(SampleBuffer::new(capacity, spec));
            self.spec = Some(spec);
        }
        let sample_buf = match self.sample_buf.as_mut() {
            Some(buf) => buf,
            None => return Err(Error::format("sample buffer unavailable")),
        };
        sample_buf.copy_interleaved_ref(decoded);

        let interleaved = sample_buf.samples();
        self.mono.clear();
        if channels <= 1 {
            self.mono.extend_from_slice(interleaved);
        } else {
            for chunk in interleaved.chunks_exact(channels) {
                let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
                self.mono.push((sum / channels as i32) as i16);
            }
        }
        Ok(&self.mono)
    }
}
