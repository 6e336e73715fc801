//! SocketCAN hardware link (Linux).
//!
//! Wraps a non-blocking `socketcan` socket and polls it from the
//! supervisor's read loop, converting kernel frames into [`RawRecord`]s.
//! Bitrate configuration stays with the interface (`ip link set can0 type
//! can bitrate ...`), matching how these adapters are provisioned; the
//! configured bitrate is carried into session records for audit.

use std::time::Duration;

use async_trait::async_trait;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::bus::{BusConnector, BusLink, RawRecord};
use crate::error::{ConnectError, LinkError};
use crate::types::{CanId, Direction};

/// Kernel error-frame class bit for bus-off.
const CAN_ERR_BUSOFF: u32 = 0x0000_0040;

/// Kernel error-frame class bit for controller restart.
const CAN_ERR_RESTARTED: u32 = 0x0000_0100;

/// Sleep between polls of the non-blocking socket.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// `errno` values indicating the underlying device disappeared.
const DEVICE_GONE: [i32; 3] = [6 /* ENXIO */, 19 /* ENODEV */, 100 /* ENETDOWN */];

/// Connector producing [`SocketCanLink`]s for one interface.
pub struct SocketCanConnector {
    channel: String,
    bitrate: u32,
    read_timeout: Duration,
}

impl SocketCanConnector {
    pub fn new(channel: &str, bitrate: u32, read_timeout: Duration) -> Self {
        Self { channel: channel.to_string(), bitrate, read_timeout }
    }
}

#[async_trait]
impl BusConnector for SocketCanConnector {
    async fn open(&mut self) -> Result<Box<dyn BusLink>, ConnectError> {
        let socket = CanSocket::open(&self.channel)
            .map_err(|e| ConnectError::from_open_io(&self.channel, &e))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| ConnectError::from_open_io(&self.channel, &e))?;

        info!(channel = %self.channel, bitrate = self.bitrate, "SocketCAN interface opened");
        Ok(Box::new(SocketCanLink {
            socket: Some(socket),
            channel: self.channel.clone(),
            read_timeout: self.read_timeout,
        }))
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn bitrate(&self) -> u32 {
        self.bitrate
    }
}

/// An open SocketCAN interface.
pub struct SocketCanLink {
    socket: Option<CanSocket>,
    channel: String,
    read_timeout: Duration,
}

impl SocketCanLink {
    fn convert(&self, frame: CanFrame) -> Option<Result<RawRecord, LinkError>> {
        match frame {
            CanFrame::Data(data) => {
                let id = if data.is_extended() {
                    CanId::Extended(data.raw_id())
                } else {
                    CanId::Standard(data.raw_id() as u16)
                };
                Some(Ok(RawRecord::encode(id, data.data(), Direction::Rx, false, 0)))
            }
            CanFrame::Remote(remote) => {
                // RTR frames carry no data; nothing to record
                trace!(channel = %self.channel, id = remote.raw_id(), "ignoring RTR frame");
                None
            }
            CanFrame::Error(err) => {
                let class = err.raw_id();
                if class & CAN_ERR_BUSOFF != 0 {
                    warn!(channel = %self.channel, "controller reported bus-off");
                    Some(Err(LinkError::BusOff))
                } else {
                    if class & CAN_ERR_RESTARTED != 0 {
                        info!(channel = %self.channel, "controller restarted");
                    } else {
                        debug!(channel = %self.channel, class = format!("{class:#x}"), "error frame");
                    }
                    None
                }
            }
        }
    }
}

#[async_trait]
impl BusLink for SocketCanLink {
    async fn read_next(&mut self) -> Result<RawRecord, LinkError> {
        let deadline = Instant::now() + self.read_timeout;

        loop {
            let socket = match self.socket.as_ref() {
                Some(socket) => socket,
                None => return Err(LinkError::DeviceRemoved),
            };

            match socket.read_frame() {
                Ok(frame) => {
                    if let Some(result) = self.convert(frame) {
                        return result;
                    }
                    // Non-recordable frame (RTR, recoverable error class):
                    // keep reading within the same timeout window
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(LinkError::Timeout { after: self.read_timeout });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    if e.raw_os_error().is_some_and(|code| DEVICE_GONE.contains(&code)) {
                        warn!(channel = %self.channel, error = %e, "CAN device removed");
                    } else {
                        // Anything else on a raw CAN socket means the
                        // adapter is unusable for this session too
                        warn!(channel = %self.channel, error = %e, "unrecoverable socket error");
                    }
                    return Err(LinkError::DeviceRemoved);
                }
            }
        }
    }

    async fn close(&mut self) {
        self.socket = None;
        debug!(channel = %self.channel, "SocketCAN interface closed");
    }
}
