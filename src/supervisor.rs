//! Bus connection lifecycle.
//!
//! The reconnect supervisor owns a [`BusConnector`] and the read loop over
//! whatever link it currently has open. It is the only component that
//! creates or closes [`BusSession`] records, and the only writer of the
//! link state channel.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Degraded
//!       ^              |            |
//!       |  (backoff)   |            | terminal link error
//!       +--------------+------------+
//! ```
//!
//! A terminal link error or failed connect re-enters `Disconnected`. From
//! there the supervisor schedules another attempt under exponential
//! backoff, and only when auto-restart is enabled; otherwise it parks in
//! [`LinkState::Failed`] and the failure is surfaced to collaborators.
//! Explicit cancellation parks in [`LinkState::Stopped`] from any state.
//!
//! The backoff attempt counter is supervisor state: it grows across failed
//! attempts, resets on a successful connect, and is never derived from the
//! session's restart count (that one is audit data).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusConnector, RawRecord};
use crate::error::LinkError;
use crate::pipeline::PipelineEvent;
use crate::types::{BusSession, ChannelId};

/// Connection state of one supervised bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected; a reconnect may be pending.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Link is up and reading.
    Connected,
    /// Link is up but the last read failed recoverably.
    Degraded,
    /// Explicitly stopped; no reconnects will follow.
    Stopped,
    /// Disconnected with auto-restart disabled. Terminal.
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
            LinkState::Stopped => "stopped",
            LinkState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One raw record tagged with the bus it came from.
#[derive(Debug)]
pub struct BusInput {
    pub channel: ChannelId,
    pub record: RawRecord,
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub channel_id: ChannelId,
    pub auto_restart: bool,
    /// First reconnect delay; doubles per failed attempt.
    pub backoff_base: Duration,
    /// Upper bound for the reconnect delay.
    pub backoff_ceiling: Duration,
}

impl SupervisorOptions {
    pub fn new(channel_id: ChannelId, auto_restart: bool) -> Self {
        Self {
            channel_id,
            auto_restart,
            backoff_base: Duration::from_millis(200),
            backoff_ceiling: Duration::from_secs(30),
        }
    }
}

/// Handles returned by [`Supervisor::spawn`].
pub struct SupervisorChannels {
    /// Observe connection state changes.
    pub state: watch::Receiver<LinkState>,
    /// Cancel to stop the supervisor (explicit stop; no reconnect).
    pub cancel: CancellationToken,
}

/// Spawns and manages the read task for one bus.
pub struct Supervisor;

impl Supervisor {
    /// Spawn the supervisor task.
    ///
    /// Raw records are pushed into `records`; state changes and session
    /// open/close notifications go out on the returned watch channel and
    /// the shared event channel.
    pub fn spawn(
        connector: Box<dyn BusConnector>,
        opts: SupervisorOptions,
        records: mpsc::Sender<BusInput>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> SupervisorChannels {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run(connector, opts, records, state_tx, events, task_cancel).await;
        });

        SupervisorChannels { state: state_rx, cancel }
    }
}

enum ReadOutcome {
    Cancelled,
    Terminal(LinkError),
}

async fn run(
    mut connector: Box<dyn BusConnector>,
    opts: SupervisorOptions,
    records: mpsc::Sender<BusInput>,
    state_tx: watch::Sender<LinkState>,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
) {
    let channel_name = connector.channel().to_string();
    let mut attempt: u32 = 0;
    let mut restarts: u32 = 0;
    let mut next_session_id: u64 = 1;

    let set_state = |state: LinkState| {
        if *state_tx.borrow() != state {
            debug!(channel = %channel_name, %state, "link state changed");
            let _ = state_tx.send(state);
            let _ = events
                .send(PipelineEvent::LinkStateChanged { channel: opts.channel_id, state });
        }
    };

    info!(channel = %channel_name, auto_restart = opts.auto_restart, "supervisor started");

    loop {
        set_state(LinkState::Connecting);

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                set_state(LinkState::Stopped);
                break;
            }
            result = connector.open() => result,
        };

        match opened {
            Ok(mut link) => {
                attempt = 0;

                let session = Arc::new(BusSession::open(
                    next_session_id,
                    connector.channel(),
                    connector.bitrate(),
                    restarts,
                ));
                next_session_id += 1;
                info!(
                    channel = %channel_name,
                    session = session.id,
                    restarts,
                    "bus session opened"
                );
                let _ = events.send(PipelineEvent::SessionOpened(Arc::clone(&session)));
                set_state(LinkState::Connected);

                let outcome =
                    read_loop(link.as_mut(), opts.channel_id, &records, &set_state, &cancel).await;
                link.close().await;

                let mut closed = (*session).clone();
                closed.close();
                info!(channel = %channel_name, session = closed.id, "bus session closed");
                let _ = events.send(PipelineEvent::SessionClosed(Arc::new(closed)));
                restarts += 1;

                match outcome {
                    ReadOutcome::Cancelled => {
                        set_state(LinkState::Stopped);
                        break;
                    }
                    ReadOutcome::Terminal(err) => {
                        warn!(channel = %channel_name, error = %err, "link lost");
                        set_state(LinkState::Disconnected);
                        if !opts.auto_restart {
                            error!(
                                channel = %channel_name,
                                "auto-restart disabled, giving up after link loss"
                            );
                            set_state(LinkState::Failed);
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(channel = %channel_name, error = %err, attempt, "connect failed");
                set_state(LinkState::Disconnected);
                if !opts.auto_restart {
                    error!(channel = %channel_name, "auto-restart disabled, giving up");
                    set_state(LinkState::Failed);
                    break;
                }
            }
        }

        let delay = backoff_delay(opts.backoff_base, opts.backoff_ceiling, attempt);
        attempt = attempt.saturating_add(1);
        debug!(channel = %channel_name, ?delay, attempt, "scheduling reconnect");

        tokio::select! {
            _ = cancel.cancelled() => {
                set_state(LinkState::Stopped);
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(channel = %channel_name, "supervisor stopped");
}

async fn read_loop(
    link: &mut dyn crate::bus::BusLink,
    channel: ChannelId,
    records: &mpsc::Sender<BusInput>,
    set_state: &impl Fn(LinkState),
    cancel: &CancellationToken,
) -> ReadOutcome {
    let mut degraded = false;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            result = link.read_next() => result,
        };

        match result {
            Ok(record) => {
                if degraded {
                    degraded = false;
                    debug!(%channel, "read resumed");
                    set_state(LinkState::Connected);
                }
                if records.send(BusInput { channel, record }).await.is_err() {
                    // Ingest side is gone; shutdown is in progress
                    return ReadOutcome::Cancelled;
                }
            }
            Err(err) if err.is_terminal() => return ReadOutcome::Terminal(err),
            Err(err) => {
                if !degraded {
                    degraded = true;
                    warn!(%channel, error = %err, "read degraded");
                    set_state(LinkState::Degraded);
                }
            }
        }
    }
}

fn backoff_delay(base: Duration, ceiling: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    ceiling.min(base.saturating_mul(factor))
}
