//! Decoded CAN frame types.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Index of the bus a frame was captured on. Assigned by the pipeline when
/// a bus is added; stable for the pipeline's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CAN arbitration identifier: 11-bit standard or 29-bit extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanId {
    Standard(u16),
    Extended(u32),
}

impl CanId {
    /// Maximum valid 11-bit identifier.
    pub const MAX_STANDARD: u16 = 0x7FF;
    /// Maximum valid 29-bit identifier.
    pub const MAX_EXTENDED: u32 = 0x1FFF_FFFF;

    /// Raw identifier value without the frame-format distinction.
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Standard(id) => u32::from(*id),
            CanId::Extended(id) => *id,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

impl std::fmt::Display for CanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanId::Standard(id) => write!(f, "{id:03X}"),
            CanId::Extended(id) => write!(f, "{id:08X}"),
        }
    }
}

/// Whether the frame was received from or transmitted onto the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Rx,
    Tx,
}

/// Per-frame status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// CAN FD frame (payload up to 64 bytes).
    pub const FD: u8 = 0x01;
    /// Error frame reported by the controller.
    pub const ERROR: u8 = 0x02;
    /// Synthetic gap marker recording adapter-side frame loss.
    pub const GAP: u8 = 0x04;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn has(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// One decoded CAN frame.
///
/// This is the fundamental unit that flows through the pipeline. Frames are
/// immutable once constructed and shared between sinks as [`Arc<Frame>`];
/// identity is `(channel, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Bus the frame was captured on.
    pub channel: ChannelId,
    /// Arbitration identifier.
    pub id: CanId,
    /// Payload: 0–8 bytes, or up to 64 with [`FrameFlags::FD`]. Empty for
    /// gap markers.
    pub payload: Vec<u8>,
    /// Capture direction.
    pub direction: Direction,
    /// Status flags.
    pub flags: FrameFlags,
    /// Wall-clock capture time.
    pub wall_clock: DateTime<Utc>,
    /// Nanoseconds since the pipeline started, from a monotonic clock.
    pub monotonic_ns: u64,
    /// Decoder-assigned sequence number: strictly increasing and contiguous
    /// per channel. Gap markers consume a number like any other frame.
    pub sequence: u64,
    /// For gap markers: how many frames the adapter dropped. Zero
    /// otherwise.
    pub dropped: u32,
}

impl Frame {
    /// True for synthetic gap markers emitted by the decoder.
    pub fn is_gap_marker(&self) -> bool {
        self.flags.has(FrameFlags::GAP)
    }

    /// Shared handle for dispatch.
    pub fn into_shared(self) -> Arc<Frame> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_id_raw_and_format() {
        assert_eq!(CanId::Standard(0x351).raw(), 0x351);
        assert_eq!(CanId::Extended(0x18FF_50E5).raw(), 0x18FF_50E5);
        assert!(!CanId::Standard(0x351).is_extended());
        assert!(CanId::Extended(0x18FF_50E5).is_extended());

        assert_eq!(CanId::Standard(0x42).to_string(), "042");
        assert_eq!(CanId::Extended(0x18FF_50E5).to_string(), "18FF50E5");
    }

    #[test]
    fn frame_flags_operations() {
        let flags = FrameFlags::default().with(FrameFlags::FD).with(FrameFlags::GAP);
        assert!(flags.has(FrameFlags::FD));
        assert!(flags.has(FrameFlags::GAP));
        assert!(!flags.has(FrameFlags::ERROR));
        assert_eq!(flags.bits(), 0x05);
    }
}
