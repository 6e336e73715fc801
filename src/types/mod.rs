//! Core data types flowing through the pipeline.
//!
//! - [`Frame`] is the decoded unit every sink and subscriber sees, shared
//!   as `Arc<Frame>` after dispatch.
//! - [`BusSession`] is the audit record of one connected period, owned by
//!   the reconnect supervisor.
//! - [`ChannelId`], [`CanId`], [`Direction`], and [`FrameFlags`] are the
//!   frame's building blocks.

mod frame;
mod session;

pub use frame::{CanId, ChannelId, Direction, Frame, FrameFlags};
pub use session::BusSession;
