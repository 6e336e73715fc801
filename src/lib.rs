//! Reliable CAN bus capture with dual-sink recording.
//!
//! Canflow continuously reads a CAN bus (a physical SocketCAN interface
//! or an in-process virtual bus) and decodes the traffic into sequenced
//! frames, and fans them out to independent consumers: an SQLite audit
//! store, an InfluxDB-compatible time-series store, live subscribers, and
//! optional relays. Backpressure is per consumer, so one slow sink never
//! stalls ingestion or the other sinks.
//!
//! # Features
//!
//! - **Resilient capture**: auto-reconnect with exponential backoff after
//!   bus-off or device loss; explicit gap markers when the adapter drops
//!   frames
//! - **Dual persistence**: batched SQLite commits with online timestamped
//!   backups, plus line-protocol writes with retention-provisioned buckets
//! - **Isolation**: every sink has its own bounded queue and drop policy
//!   (block, drop-oldest, drop-newest)
//! - **Live feeds**: broadcast subscriber streams with drop-oldest lag
//!   semantics and latest-wins throttling for UIs
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use canflow::{Canflow, CanId, Config};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> canflow::Result<()> {
//!     let config = Config::default();
//!     let (pipeline, bus) = Canflow::virtual_bus(&config)?;
//!
//!     bus.inject(CanId::Standard(0x351), &[0x01, 0x02]);
//!
//!     let mut frames = pipeline.subscribe();
//!     if let Some(frame) = frames.next().await {
//!         println!("frame {} on channel {}", frame.sequence, frame.channel);
//!     }
//!
//!     pipeline.shutdown(std::time::Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
pub mod types;

// Capture pipeline
pub mod bus;
pub mod buses;
pub mod decoder;
pub mod dispatch;
pub mod pipeline;
pub mod stream;
pub mod supervisor;

// Persistence and fan-out targets
pub mod sink;
pub mod sinks;

// Core exports
pub use config::{Config, RetentionPolicy, init_tracing};
pub use error::*;
pub use types::*;

// Pipeline exports
pub use dispatch::{DropPolicy, RegistrationId, SinkOptions, SinkStatsSnapshot};
pub use pipeline::{PipelineBuilder, PipelineEvent, PipelineHandle};
pub use stream::{FrameStream, ThrottleLatest};
pub use supervisor::LinkState;

// Sink exports
pub use sink::FrameSink;
pub use sinks::{RelaySink, SeriesSink, SqliteSink};

// Bus exports
pub use buses::{VirtualBusHandle, VirtualConnector};

#[cfg(target_os = "linux")]
pub use buses::SocketCanConnector;

/// Unified entry point for capture pipelines.
///
/// The factory covers the two common setups; use
/// [`PipelineBuilder`] directly for multi-bus capture or custom sinks.
///
/// # Examples
///
/// ## Hardware capture (Linux)
/// ```rust,no_run
/// use canflow::{Canflow, Config};
///
/// #[tokio::main]
/// async fn main() -> canflow::Result<()> {
///     let config = Config::load("config/config.json")?;
///     let pipeline = Canflow::connect(&config)?;
///     // Use pipeline...
///     Ok(())
/// }
/// ```
///
/// ## Virtual bus (cross-platform)
/// ```rust,no_run
/// use canflow::{Canflow, Config};
///
/// #[tokio::main]
/// async fn main() -> canflow::Result<()> {
///     let (pipeline, bus) = Canflow::virtual_bus(&Config::default())?;
///     // Inject traffic through `bus`, observe through `pipeline`...
///     Ok(())
/// }
/// ```
pub struct Canflow;

impl Canflow {
    /// Capture from the configured SocketCAN interface.
    ///
    /// Builds the configured storage sinks and starts reading from the
    /// hardware bus. The interface must exist and be up (`ip link set
    /// can0 up type can bitrate 500000`).
    ///
    /// # Platform
    ///
    /// Only available on Linux, where the kernel provides SocketCAN.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the
    /// configuration is invalid. Bus connect failures are handled by the
    /// reconnect supervisor, not reported here.
    #[cfg(target_os = "linux")]
    pub fn connect(config: &Config) -> Result<PipelineHandle> {
        let connector = SocketCanConnector::new(
            &config.can.channel,
            config.can.bitrate,
            config.can.read_timeout,
        );
        Ok(PipelineBuilder::new(config.clone())
            .with_default_sinks()?
            .bus(Box::new(connector))
            .start())
    }

    /// Capture from an in-process virtual bus.
    ///
    /// Behaves identically to hardware capture; the returned
    /// [`VirtualBusHandle`] scripts the traffic. Works on every platform,
    /// which makes it the path for tests, demos, and development off the
    /// target device.
    pub fn virtual_bus(config: &Config) -> Result<(PipelineHandle, VirtualBusHandle)> {
        let (connector, handle) = VirtualConnector::new(
            &config.can.channel,
            config.can.bitrate,
            config.can.read_timeout,
        );
        let pipeline = PipelineBuilder::new(config.clone())
            .with_default_sinks()?
            .bus(Box::new(connector))
            .start();
        Ok((pipeline, handle))
    }
}
