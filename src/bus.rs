//! Bus link abstraction.
//!
//! A [`BusConnector`] knows how to open one bus adapter; a [`BusLink`] is
//! an open adapter yielding raw records. The reconnect supervisor owns
//! both: it calls `open` (again after terminal failures, under backoff) and
//! drives the read loop. Implementations handle their own timing: the
//! hardware link waits on the socket, the virtual bus waits on injected
//! traffic.
//!
//! Links yield [`RawRecord`]s, a compact adapter wire format the decoder
//! parses into [`Frame`]s. The layout mirrors the Linux `can_frame`
//! identifier word so hardware capture is a near-passthrough:
//!
//! ```text
//! offset  size  field
//! 0       4     can_id, u32 LE; bit 31 = extended, bit 30 = RTR,
//!               bit 29 = error frame
//! 4       1     payload length
//! 5       1     record flags; bit 0 = FD, bit 1 = TX direction
//! 6       2     frames dropped by the adapter since the previous
//!               record, u16 LE
//! 8       n     payload
//! ```
//!
//! [`Frame`]: crate::types::Frame

use async_trait::async_trait;

use crate::error::{ConnectError, LinkError};
use crate::types::{CanId, Direction};

/// Extended (29-bit) identifier flag in the id word.
pub const ID_EXTENDED: u32 = 0x8000_0000;
/// Remote transmission request flag in the id word.
pub const ID_RTR: u32 = 0x4000_0000;
/// Error frame flag in the id word.
pub const ID_ERROR: u32 = 0x2000_0000;

/// Record flag: CAN FD payload (up to 64 bytes).
pub const RECORD_FD: u8 = 0x01;
/// Record flag: frame was transmitted by this node.
pub const RECORD_TX: u8 = 0x02;
/// All defined record flag bits; anything else is malformed.
pub const RECORD_FLAG_MASK: u8 = RECORD_FD | RECORD_TX;

/// Fixed header size preceding the payload.
pub const HEADER_LEN: usize = 8;

/// One raw record read from an adapter, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub bytes: Vec<u8>,
}

impl RawRecord {
    /// Build a record from decoded fields. Used by adapters and by tests;
    /// the inverse of [`FrameDecoder::decode`].
    ///
    /// [`FrameDecoder::decode`]: crate::decoder::FrameDecoder::decode
    pub fn encode(id: CanId, payload: &[u8], direction: Direction, fd: bool, dropped: u16) -> Self {
        let mut id_word = id.raw();
        if id.is_extended() {
            id_word |= ID_EXTENDED;
        }

        let mut flags = 0u8;
        if fd {
            flags |= RECORD_FD;
        }
        if direction == Direction::Tx {
            flags |= RECORD_TX;
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&id_word.to_le_bytes());
        bytes.push(payload.len() as u8);
        bytes.push(flags);
        bytes.extend_from_slice(&dropped.to_le_bytes());
        bytes.extend_from_slice(payload);
        Self { bytes }
    }
}

/// An open bus adapter.
#[async_trait]
pub trait BusLink: Send {
    /// Read the next raw record.
    ///
    /// Suspends until traffic arrives or the link fails. Returns
    /// [`LinkError::Timeout`] when the configured read timeout elapses
    /// without traffic; that one is recoverable and the caller may retry. Terminal
    /// errors ([`LinkError::is_terminal`]) mean the link is unusable and
    /// the session must close.
    async fn read_next(&mut self) -> Result<RawRecord, LinkError>;

    /// Release the adapter. Reading after close is a contract violation.
    async fn close(&mut self);
}

/// Factory for [`BusLink`]s over one configured adapter.
///
/// Owned by the reconnect supervisor, which calls [`open`](Self::open)
/// once per session.
#[async_trait]
pub trait BusConnector: Send + 'static {
    async fn open(&mut self) -> Result<Box<dyn BusLink>, ConnectError>;

    /// Interface name, for session records and logging.
    fn channel(&self) -> &str;

    /// Configured bitrate, for session records.
    fn bitrate(&self) -> u32;
}
