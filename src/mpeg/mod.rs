//! MPEG audio stream structure: frame headers, synchronization, VBR metadata.

pub mod frame;
pub mod sync;
pub mod vbr;

pub use frame::{Bitrate, ChannelMode, FrameHeader, Layer, MpegVersion};
pub use sync::{locate, SweepStats, SyncOutcome};
pub use vbr::VbrHeader;
