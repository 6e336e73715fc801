//! Raw record decoding and per-channel sequencing.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use tracing::warn;

use crate::bus::{
    HEADER_LEN, ID_ERROR, ID_EXTENDED, RECORD_FD, RECORD_FLAG_MASK, RECORD_TX, RawRecord,
};
use crate::error::DecodeError;
use crate::types::{CanId, ChannelId, Direction, Frame, FrameFlags};

/// Maximum payload for a classic CAN frame.
const MAX_DLC: u8 = 8;
/// Maximum payload for a CAN FD frame.
const MAX_DLC_FD: u8 = 64;

/// Decodes [`RawRecord`]s into [`Frame`]s and assigns sequence numbers.
///
/// Decoding itself is pure: the same record always yields the same
/// identifier, payload, flags, and direction. The decoder's only state is
/// the per-channel sequence counter and the error tally. Sequence numbers
/// are strictly increasing and contiguous per channel; when the adapter
/// reports dropped frames, the decoder emits one synthetic gap-marker
/// frame (which consumes the next sequence number) ahead of the decoded
/// frame, so loss is recorded instead of silently resequenced.
///
/// The counter for a channel has exactly one writer, the decoder instance
/// in the pipeline's ingest task.
pub struct FrameDecoder {
    epoch: Instant,
    sequences: HashMap<ChannelId, u64>,
    decode_errors: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { epoch: Instant::now(), sequences: HashMap::new(), decode_errors: 0 }
    }

    /// Decode one raw record.
    ///
    /// Returns the decoded frames in dispatch order: a gap marker first if
    /// the record carries a dropped count, then the data frame. On error
    /// the record is counted and skipped; sequence counters are not
    /// advanced for undecodable records.
    pub fn decode(
        &mut self,
        channel: ChannelId,
        raw: &RawRecord,
    ) -> Result<Vec<Frame>, DecodeError> {
        match self.decode_inner(channel, raw) {
            Ok(frames) => Ok(frames),
            Err(err) => {
                self.decode_errors += 1;
                warn!(%channel, error = %err, total = self.decode_errors, "undecodable record");
                Err(err)
            }
        }
    }

    /// Number of records rejected so far.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    fn decode_inner(
        &mut self,
        channel: ChannelId,
        raw: &RawRecord,
    ) -> Result<Vec<Frame>, DecodeError> {
        let bytes = &raw.bytes;
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated { expected: HEADER_LEN, got: bytes.len() });
        }

        let id_word = u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice"));
        let len = bytes[4];
        let record_flags = bytes[5];
        let dropped_delta = u16::from_le_bytes(bytes[6..8].try_into().expect("2-byte slice"));

        if record_flags & !RECORD_FLAG_MASK != 0 {
            return Err(DecodeError::MalformedHeader { reason: "undefined record flag bits" });
        }

        let fd = record_flags & RECORD_FD != 0;
        let max = if fd { MAX_DLC_FD } else { MAX_DLC };
        if len > max {
            return Err(DecodeError::InvalidDlc { dlc: len, max });
        }

        let expected = HEADER_LEN + usize::from(len);
        if bytes.len() < expected {
            return Err(DecodeError::Truncated { expected, got: bytes.len() });
        }
        if bytes.len() > expected {
            return Err(DecodeError::MalformedHeader { reason: "record longer than declared DLC" });
        }

        let id_value = id_word & CanId::MAX_EXTENDED;
        let id = if id_word & ID_EXTENDED != 0 {
            CanId::Extended(id_value)
        } else if id_value <= u32::from(CanId::MAX_STANDARD) {
            CanId::Standard(id_value as u16)
        } else {
            return Err(DecodeError::MalformedHeader { reason: "standard id exceeds 11 bits" });
        };

        let direction =
            if record_flags & RECORD_TX != 0 { Direction::Tx } else { Direction::Rx };

        let mut flags = FrameFlags::default();
        if fd {
            flags = flags.with(FrameFlags::FD);
        }
        if id_word & ID_ERROR != 0 {
            flags = flags.with(FrameFlags::ERROR);
        }

        let mut frames = Vec::with_capacity(2);
        if dropped_delta > 0 {
            frames.push(self.gap_marker(channel, u32::from(dropped_delta)));
        }

        frames.push(Frame {
            channel,
            id,
            payload: bytes[HEADER_LEN..expected].to_vec(),
            direction,
            flags,
            wall_clock: Utc::now(),
            monotonic_ns: self.monotonic_ns(),
            sequence: self.next_sequence(channel),
            dropped: 0,
        });

        Ok(frames)
    }

    fn gap_marker(&mut self, channel: ChannelId, dropped: u32) -> Frame {
        Frame {
            channel,
            id: CanId::Standard(0),
            payload: Vec::new(),
            direction: Direction::Rx,
            flags: FrameFlags::default().with(FrameFlags::GAP),
            wall_clock: Utc::now(),
            monotonic_ns: self.monotonic_ns(),
            sequence: self.next_sequence(channel),
            dropped,
        }
    }

    fn next_sequence(&mut self, channel: ChannelId) -> u64 {
        let counter = self.sequences.entry(channel).or_insert(0);
        *counter += 1;
        *counter
    }

    fn monotonic_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CH: ChannelId = ChannelId(0);

    fn decode_one(decoder: &mut FrameDecoder, raw: &RawRecord) -> Frame {
        let mut frames = decoder.decode(CH, raw).expect("decode");
        assert_eq!(frames.len(), 1);
        frames.pop().unwrap()
    }

    #[test]
    fn decodes_standard_frame() {
        let mut decoder = FrameDecoder::new();
        let raw = RawRecord::encode(CanId::Standard(0x351), &[1, 2, 3], Direction::Rx, false, 0);

        let frame = decode_one(&mut decoder, &raw);
        assert_eq!(frame.id, CanId::Standard(0x351));
        assert_eq!(frame.payload, vec![1, 2, 3]);
        assert_eq!(frame.direction, Direction::Rx);
        assert_eq!(frame.sequence, 1);
        assert!(!frame.is_gap_marker());
    }

    #[test]
    fn sequences_are_contiguous_per_channel() {
        let mut decoder = FrameDecoder::new();
        let raw = RawRecord::encode(CanId::Standard(0x100), &[0], Direction::Rx, false, 0);

        for expected in 1..=5u64 {
            let frame = decode_one(&mut decoder, &raw);
            assert_eq!(frame.sequence, expected);
        }

        // A second channel counts independently
        let frames = decoder.decode(ChannelId(1), &raw).unwrap();
        assert_eq!(frames[0].sequence, 1);
    }

    #[test]
    fn dropped_count_yields_one_gap_marker() {
        let mut decoder = FrameDecoder::new();

        let raw = RawRecord::encode(CanId::Standard(0x200), &[9], Direction::Rx, false, 0);
        decode_one(&mut decoder, &raw);

        let raw = RawRecord::encode(CanId::Standard(0x200), &[9], Direction::Rx, false, 3);
        let frames = decoder.decode(CH, &raw).unwrap();
        assert_eq!(frames.len(), 2);

        let gap = &frames[0];
        assert!(gap.is_gap_marker());
        assert_eq!(gap.dropped, 3);
        assert!(gap.payload.is_empty());
        assert_eq!(gap.sequence, 2);

        let data = &frames[1];
        assert!(!data.is_gap_marker());
        assert_eq!(data.sequence, 3);
    }

    #[test]
    fn rejects_truncated_records() {
        let mut decoder = FrameDecoder::new();

        let err = decoder.decode(CH, &RawRecord { bytes: vec![0; 4] }).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { expected: HEADER_LEN, got: 4 });

        // Header declares 5 payload bytes, only 2 present
        let mut bytes = RawRecord::encode(CanId::Standard(1), &[0; 5], Direction::Rx, false, 0).bytes;
        bytes.truncate(HEADER_LEN + 2);
        let err = decoder.decode(CH, &RawRecord { bytes }).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { expected: HEADER_LEN + 5, got: HEADER_LEN + 2 });

        assert_eq!(decoder.decode_errors(), 2);
    }

    #[test]
    fn rejects_invalid_dlc() {
        let mut decoder = FrameDecoder::new();

        // Classic frame claiming 9 bytes
        let mut bytes = RawRecord::encode(CanId::Standard(1), &[0; 8], Direction::Rx, false, 0).bytes;
        bytes[4] = 9;
        bytes.push(0);
        let err = decoder.decode(CH, &RawRecord { bytes }).unwrap_err();
        assert_eq!(err, DecodeError::InvalidDlc { dlc: 9, max: 8 });

        // FD frame may carry up to 64
        let raw = RawRecord::encode(CanId::Standard(1), &[0; 64], Direction::Rx, true, 0);
        assert!(decoder.decode(CH, &raw).is_ok());
    }

    #[test]
    fn rejects_malformed_headers() {
        let mut decoder = FrameDecoder::new();

        // Undefined record flag bit
        let mut bytes = RawRecord::encode(CanId::Standard(1), &[], Direction::Rx, false, 0).bytes;
        bytes[5] = 0x80;
        let err = decoder.decode(CH, &RawRecord { bytes }).unwrap_err();
        assert_eq!(err, DecodeError::MalformedHeader { reason: "undefined record flag bits" });

        // Standard-format id outside 11 bits
        let mut bytes = RawRecord::encode(CanId::Standard(1), &[], Direction::Rx, false, 0).bytes;
        bytes[0..4].copy_from_slice(&0x800u32.to_le_bytes());
        let err = decoder.decode(CH, &RawRecord { bytes }).unwrap_err();
        assert_eq!(err, DecodeError::MalformedHeader { reason: "standard id exceeds 11 bits" });

        // Trailing bytes beyond the declared DLC
        let mut bytes = RawRecord::encode(CanId::Standard(1), &[1], Direction::Rx, false, 0).bytes;
        bytes.push(0xFF);
        let err = decoder.decode(CH, &RawRecord { bytes }).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MalformedHeader { reason: "record longer than declared DLC" }
        );

        // Errors never advance the sequence counter
        let raw = RawRecord::encode(CanId::Standard(1), &[], Direction::Rx, false, 0);
        let frame = decode_one(&mut decoder, &raw);
        assert_eq!(frame.sequence, 1);
    }

    proptest! {
        #[test]
        fn decode_is_deterministic(
            extended in any::<bool>(),
            id_bits in 0u32..=CanId::MAX_EXTENDED,
            payload in prop::collection::vec(any::<u8>(), 0..=8),
            tx in any::<bool>(),
            dropped in 0u16..4,
        ) {
            let id = if extended {
                CanId::Extended(id_bits)
            } else {
                CanId::Standard((id_bits & u32::from(CanId::MAX_STANDARD)) as u16)
            };
            let direction = if tx { Direction::Tx } else { Direction::Rx };
            let raw = RawRecord::encode(id, &payload, direction, false, dropped);

            let mut first = FrameDecoder::new();
            let mut second = FrameDecoder::new();
            let a = first.decode(CH, &raw).unwrap();
            let b = second.decode(CH, &raw).unwrap();

            prop_assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b.iter()) {
                prop_assert_eq!(x.id, y.id);
                prop_assert_eq!(&x.payload, &y.payload);
                prop_assert_eq!(x.direction, y.direction);
                prop_assert_eq!(x.flags, y.flags);
                prop_assert_eq!(x.dropped, y.dropped);
                prop_assert_eq!(x.sequence, y.sequence);
            }

            let data = a.last().unwrap();
            prop_assert_eq!(data.id, id);
            prop_assert_eq!(&data.payload, &payload);
        }
    }
}
