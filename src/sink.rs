//! Sink capability trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::types::Frame;

/// A frame consumer registered with the dispatcher.
///
/// This is the only interface the dispatcher knows: it holds a set of
/// `Arc<dyn FrameSink>` handles, never concrete sink types. Implementations
/// decide what "accept" means: a buffered SQLite insert, a line-protocol
/// point, a relay write.
///
/// Error contract: return a non-fatal [`SinkError`] to be treated as
/// degraded (the dispatcher re-offers the frame after a delay); return a
/// fatal one ([`SinkError::is_fatal`]) to be unregistered. Slow accepts are
/// tolerated (each sink runs on its own worker task), but an accept that
/// never returns permanently occupies the sink's queue, so sinks doing
/// network I/O should bound their own waits.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Consume one frame.
    async fn accept(&self, frame: &Arc<Frame>) -> Result<(), SinkError>;

    /// Flush any internal buffering. Called during shutdown drain; a sink
    /// with no buffering keeps the default no-op.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
