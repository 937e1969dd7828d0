//! Locate marker clips inside MPEG audio streams and derive cut points.
//!
//! A short "marker" clip (a jingle, a station ID) is reduced to a loudness
//! envelope, compiled into a frequency-domain pattern, and slid across the
//! loudness envelope of a full recording by FFT cross-correlation. Matches
//! are reported as consistent (time, frame, byte) positions obtained by
//! replaying the frame chain, so the resulting byte ranges cut cleanly on
//! frame boundaries.
//!
//! The crate splits into stream structure ([`mpeg`]), envelope extraction
//! ([`envelope`] over the [`decode`] seam), pattern matching ([`pattern`],
//! [`matcher`], [`search`]) and the file-level surface ([`engine`],
//! [`batch`]).

pub mod batch;
pub mod decode;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod matcher;
pub mod mpeg;
pub mod pattern;
pub mod search;

pub use decode::{DecoderFactory, FrameDecoder};
pub use engine::{CutPoints, CutReport, Engine, Role, StreamInfo};
pub use error::{Error, Result};
pub use pattern::Pattern;
pub use search::{MultiStepSearch, SearchResult, SearchStep, StreamPosition};
