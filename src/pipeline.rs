//! Pipeline assembly.
//!
//! Wires the pieces together: one reconnect supervisor per bus feeds raw
//! records into a single ingest task, which decodes and sequences them and
//! hands every frame to the dispatcher and to live subscribers. The
//! returned [`PipelineHandle`] is the application's surface: subscribe to
//! frames, watch link state and events, register extra sinks, shut down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::BusConnector;
use crate::config::Config;
use crate::decoder::FrameDecoder;
use crate::dispatch::{
    Dispatcher, DropPolicy, RegistrationId, SinkOptions, SinkStatsSnapshot,
};
use crate::error::Result;
use crate::sink::FrameSink;
use crate::sinks::{SeriesSink, SqliteOptions, SqliteSink};
use crate::stream::{FrameStream, ThrottleLatest};
use crate::supervisor::{
    BusInput, LinkState, Supervisor, SupervisorChannels, SupervisorOptions,
};
use crate::types::{BusSession, ChannelId, Frame};

/// Capacity of the raw-record channel between supervisors and ingest.
const RECORD_CHANNEL_DEPTH: usize = 1024;
/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Status notifications surfaced to collaborators (UI, logging, operator
/// tooling). Dropping behind on these never affects the frame path.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SessionOpened(Arc<BusSession>),
    SessionClosed(Arc<BusSession>),
    LinkStateChanged { channel: ChannelId, state: LinkState },
    SinkDegraded { sink: String },
    SinkRecovered { sink: String },
    SinkFailed { sink: String, reason: String },
    BackupCompleted { path: PathBuf },
    BackupFailed { reason: String },
}

/// Builder for a capture pipeline.
pub struct PipelineBuilder {
    config: Config,
    connectors: Vec<Box<dyn BusConnector>>,
    sinks: Vec<(Arc<dyn FrameSink>, SinkOptions)>,
    durable: Option<Arc<SqliteSink>>,
    subscriber_depth: usize,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connectors: Vec::new(),
            sinks: Vec::new(),
            durable: None,
            subscriber_depth: 1024,
        }
    }

    /// Add a bus. Channel ids are assigned in call order, starting at 0.
    pub fn bus(mut self, connector: Box<dyn BusConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Register a sink at startup.
    pub fn sink(mut self, sink: Arc<dyn FrameSink>, opts: SinkOptions) -> Self {
        self.sinks.push((sink, opts));
        self
    }

    /// Register the configured durable store. The audit store must not
    /// lose frames, so it gets a blocking queue.
    pub fn durable_sink(mut self, sink: Arc<SqliteSink>) -> Self {
        self.durable = Some(Arc::clone(&sink));
        self.sinks.push((
            sink,
            SinkOptions::new(
                "sqlite",
                1024,
                DropPolicy::Block { timeout: Duration::from_secs(2) },
            ),
        ));
        self
    }

    /// Register a time-series sink. Dashboard data tolerates loss, so the
    /// queue evicts the oldest frames under pressure.
    pub fn series_sink(mut self, sink: Arc<SeriesSink>) -> Self {
        self.sinks.push((sink, SinkOptions::new("influx", 2048, DropPolicy::DropOldest)));
        self
    }

    /// Build the storage sinks described by the configuration: the SQLite
    /// store, and the InfluxDB sink when enabled.
    pub fn with_default_sinks(self) -> Result<Self> {
        let db = &self.config.database;
        let durable = Arc::new(SqliteSink::open(
            &db.path,
            SqliteOptions {
                batch_size: db.batch_size,
                flush_interval: db.flush_interval,
                backup_dir: None,
            },
        )?);

        let mut builder = self.durable_sink(durable);
        if builder.config.influxdb.enabled {
            let series = Arc::new(SeriesSink::from_config(&builder.config.influxdb)?);
            builder = builder.series_sink(series);
        }
        Ok(builder)
    }

    /// How many frames a live subscriber may fall behind before losing the
    /// oldest.
    pub fn subscriber_depth(mut self, depth: usize) -> Self {
        self.subscriber_depth = depth.max(16);
        self
    }

    /// Spawn the pipeline tasks.
    pub fn start(self) -> PipelineHandle {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (frames_tx, _) = broadcast::channel::<Arc<Frame>>(self.subscriber_depth);
        let (records_tx, records_rx) = mpsc::channel::<BusInput>(RECORD_CHANNEL_DEPTH);

        let dispatcher = Dispatcher::new(events_tx.clone());
        for (sink, opts) in self.sinks {
            dispatcher.register(sink, opts);
        }

        // Audit tasks subscribe before any supervisor can emit an event
        let cancel = CancellationToken::new();
        if let Some(durable) = &self.durable {
            spawn_session_recorder(Arc::clone(durable), events_tx.subscribe(), cancel.clone());

            if self.config.database.backup_enabled && self.config.database.backup_interval_hours > 0
            {
                spawn_backup_task(
                    Arc::clone(durable),
                    Duration::from_secs(u64::from(self.config.database.backup_interval_hours) * 3600),
                    events_tx.clone(),
                    cancel.clone(),
                );
            }
        }

        let ingest = tokio::spawn(ingest_loop(records_rx, dispatcher.clone(), frames_tx.clone()));

        // One supervisor per bus; channel ids follow registration order
        let mut supervisors = Vec::new();
        for (index, connector) in self.connectors.into_iter().enumerate() {
            let channel_id = ChannelId(index as u8);
            let channels = Supervisor::spawn(
                connector,
                SupervisorOptions::new(channel_id, self.config.can.enable_auto_restart),
                records_tx.clone(),
                events_tx.clone(),
            );
            supervisors.push((channel_id, channels));
        }
        // Ingest ends when the last supervisor drops its sender
        drop(records_tx);

        info!(
            buses = supervisors.len(),
            sinks = dispatcher.sink_count(),
            "capture pipeline started"
        );

        PipelineHandle {
            dispatcher,
            frames: frames_tx,
            events: events_tx,
            supervisors,
            durable: self.durable,
            ingest: Some(ingest),
            cancel,
            ui_refresh: self.config.ui.refresh_interval(),
        }
    }
}

/// Running pipeline.
///
/// Dropping the handle cancels the background tasks without draining;
/// call [`shutdown`](Self::shutdown) for an orderly stop.
pub struct PipelineHandle {
    dispatcher: Dispatcher,
    frames: broadcast::Sender<Arc<Frame>>,
    events: broadcast::Sender<PipelineEvent>,
    supervisors: Vec<(ChannelId, SupervisorChannels)>,
    durable: Option<Arc<SqliteSink>>,
    ingest: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    ui_refresh: Duration,
}

impl PipelineHandle {
    /// Subscribe to the live frame feed.
    ///
    /// Independent of the durable sinks; a slow subscriber loses the
    /// oldest frames and the stream reports the lag count.
    pub fn subscribe(&self) -> FrameStream {
        FrameStream::new(self.frames.subscribe())
    }

    /// Subscribe at the configured UI refresh rate (latest frame wins).
    pub fn subscribe_throttled(&self) -> ThrottleLatest<FrameStream> {
        self.subscribe().throttle_latest(self.ui_refresh)
    }

    /// Subscribe to status events.
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Connection state of one bus.
    pub fn link_state(&self, channel: ChannelId) -> Option<watch::Receiver<LinkState>> {
        self.supervisors
            .iter()
            .find(|(id, _)| *id == channel)
            .map(|(_, channels)| channels.state.clone())
    }

    /// Register an additional sink at runtime.
    pub fn register_sink(&self, sink: Arc<dyn FrameSink>, opts: SinkOptions) -> RegistrationId {
        self.dispatcher.register(sink, opts)
    }

    /// Unregister a sink. No frames are offered after this returns; an
    /// in-flight accept finishes on the sink's worker.
    pub fn unregister_sink(&self, id: RegistrationId) {
        self.dispatcher.unregister(id);
    }

    /// Counters for a registered sink.
    pub fn sink_stats(&self, id: RegistrationId) -> Option<SinkStatsSnapshot> {
        self.dispatcher.stats(id)
    }

    /// The configured durable store, when built via
    /// [`PipelineBuilder::with_default_sinks`] or
    /// [`PipelineBuilder::durable_sink`].
    pub fn durable(&self) -> Option<&Arc<SqliteSink>> {
        self.durable.as_ref()
    }

    /// Stop ingestion and drain the sinks.
    ///
    /// Supervisors stop reading immediately; frames already decoded are
    /// offered to the sinks, whose queues drain for up to `grace` before
    /// being dropped.
    pub async fn shutdown(mut self, grace: Duration) {
        info!("pipeline shutting down");
        for (_, channels) in &self.supervisors {
            channels.cancel.cancel();
        }
        self.cancel.cancel();

        if let Some(ingest) = self.ingest.take() {
            if tokio::time::timeout(grace, ingest).await.is_err() {
                warn!("ingest did not drain within the grace period");
            }
        }
        self.dispatcher.shutdown(grace).await;
        info!("pipeline stopped");
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        for (_, channels) in &self.supervisors {
            channels.cancel.cancel();
        }
        self.cancel.cancel();
    }
}

async fn ingest_loop(
    mut records: mpsc::Receiver<BusInput>,
    dispatcher: Dispatcher,
    frames: broadcast::Sender<Arc<Frame>>,
) {
    let mut decoder = FrameDecoder::new();
    debug!("ingest task started");

    while let Some(input) = records.recv().await {
        // Decode errors are logged and counted by the decoder; the stream
        // continues with the next record
        let Ok(decoded) = decoder.decode(input.channel, &input.record) else {
            continue;
        };

        for frame in decoded {
            let shared = frame.into_shared();
            dispatcher.dispatch(&shared).await;
            // No receivers is fine; subscribers come and go
            let _ = frames.send(shared);
        }
    }

    debug!(errors = decoder.decode_errors(), "ingest task ended");
}

fn spawn_session_recorder(
    durable: Arc<SqliteSink>,
    mut events: broadcast::Receiver<PipelineEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(PipelineEvent::SessionOpened(session))
                | Ok(PipelineEvent::SessionClosed(session)) => {
                    if let Err(err) = durable.record_session(&session) {
                        warn!(error = %err, "failed to record session");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "session recorder lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_backup_task(
    durable: Arc<SqliteSink>,
    period: Duration,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The immediate first tick would back up an empty store
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sink = Arc::clone(&durable);
            match tokio::task::spawn_blocking(move || sink.backup()).await {
                Ok(Ok(path)) => {
                    let _ = events.send(PipelineEvent::BackupCompleted { path });
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "scheduled backup failed");
                    let _ =
                        events.send(PipelineEvent::BackupFailed { reason: err.to_string() });
                }
                Err(join_err) => {
                    warn!(error = %join_err, "backup task panicked");
                }
            }
        }
    });
}
