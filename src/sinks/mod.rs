//! Bundled sink implementations.
//!
//! Anything implementing [`FrameSink`](crate::sink::FrameSink) can be
//! registered with the dispatcher; these are the sinks the pipeline
//! assembles from configuration.

pub mod influx;
pub mod relay;
pub mod sqlite;

pub use influx::{HttpBackend, Provisioning, SeriesBackend, SeriesOptions, SeriesSink};
pub use relay::RelaySink;
pub use sqlite::{SqliteOptions, SqliteSink};
