//! In-process virtual bus.
//!
//! The virtual bus is the cross-platform twin of the hardware link: the
//! pipeline drives it through the same [`BusConnector`]/[`BusLink`] traits,
//! while a [`VirtualBusHandle`] lets tests and demos script the traffic:
//! inject frames, report adapter-side drops, force link failures, and take
//! the "device" away to exercise reconnect behavior.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::bus::{BusConnector, BusLink, RawRecord};
use crate::error::{ConnectError, LinkError};
use crate::types::{CanId, Direction};

enum BusEvent {
    Record(RawRecord),
    BusOff,
    DeviceRemoved,
}

struct Shared {
    queue: Mutex<SharedQueue>,
    notify: Notify,
}

struct SharedQueue {
    events: VecDeque<BusEvent>,
    available: bool,
    /// Bitrate the simulated interface claims to run at; `None` matches
    /// whatever the connector asks for.
    interface_bitrate: Option<u32>,
}

/// Scripting handle for a virtual bus. Clone freely; all clones feed the
/// same queue.
#[derive(Clone)]
pub struct VirtualBusHandle {
    shared: Arc<Shared>,
}

impl VirtualBusHandle {
    /// Inject a received data frame.
    pub fn inject(&self, id: CanId, payload: &[u8]) {
        self.push(BusEvent::Record(RawRecord::encode(id, payload, Direction::Rx, false, 0)));
    }

    /// Inject a frame whose record reports `dropped` frames lost by the
    /// adapter since the previous record.
    pub fn inject_after_drops(&self, id: CanId, payload: &[u8], dropped: u16) {
        self.push(BusEvent::Record(RawRecord::encode(id, payload, Direction::Rx, false, dropped)));
    }

    /// Inject a pre-built record, including malformed ones.
    pub fn inject_record(&self, record: RawRecord) {
        self.push(BusEvent::Record(record));
    }

    /// Inject raw adapter bytes verbatim.
    pub fn inject_raw(&self, bytes: Vec<u8>) {
        self.push(BusEvent::Record(RawRecord { bytes }));
    }

    /// Make the next read fail with bus-off (terminal).
    pub fn fail_bus_off(&self) {
        self.push(BusEvent::BusOff);
    }

    /// Make the next read fail with device-removed (terminal).
    pub fn fail_device_removed(&self) {
        self.push(BusEvent::DeviceRemoved);
    }

    /// Control whether connect attempts succeed. While unavailable, the
    /// connector reports device-not-found.
    pub fn set_available(&self, available: bool) {
        self.shared.queue.lock().expect("virtual bus lock").available = available;
    }

    /// Pretend the interface is configured at a different bitrate.
    /// Connects fail with a bitrate mismatch until cleared with `None`.
    pub fn set_interface_bitrate(&self, bitrate: Option<u32>) {
        self.shared.queue.lock().expect("virtual bus lock").interface_bitrate = bitrate;
    }

    fn push(&self, event: BusEvent) {
        self.shared.queue.lock().expect("virtual bus lock").events.push_back(event);
        self.shared.notify.notify_one();
    }
}

/// Connector producing [`VirtualBus`] links.
pub struct VirtualConnector {
    channel: String,
    bitrate: u32,
    read_timeout: Duration,
    shared: Arc<Shared>,
}

impl VirtualConnector {
    /// Create a virtual bus and its scripting handle.
    pub fn new(channel: &str, bitrate: u32, read_timeout: Duration) -> (Self, VirtualBusHandle) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(SharedQueue {
                events: VecDeque::new(),
                available: true,
                interface_bitrate: None,
            }),
            notify: Notify::new(),
        });
        let handle = VirtualBusHandle { shared: Arc::clone(&shared) };
        (Self { channel: channel.to_string(), bitrate, read_timeout, shared }, handle)
    }
}

#[async_trait]
impl BusConnector for VirtualConnector {
    async fn open(&mut self) -> Result<Box<dyn BusLink>, ConnectError> {
        let (available, interface_bitrate) = {
            let queue = self.shared.queue.lock().expect("virtual bus lock");
            (queue.available, queue.interface_bitrate)
        };
        if !available {
            return Err(ConnectError::DeviceNotFound { device: self.channel.clone() });
        }
        if let Some(active) = interface_bitrate {
            if active != self.bitrate {
                return Err(ConnectError::BitrateMismatch {
                    device: self.channel.clone(),
                    requested: self.bitrate,
                    active,
                });
            }
        }
        debug!(channel = %self.channel, "virtual bus opened");
        Ok(Box::new(VirtualBus {
            shared: Arc::clone(&self.shared),
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

/// An open virtual link.
pub struct VirtualBus {
    shared: Arc<Shared>,
    read_timeout: Duration,
}

#[async_trait]
impl BusLink for VirtualBus {
    async fn read_next(&mut self) -> Result<RawRecord, LinkError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.shared.queue.lock().expect("virtual bus lock").events.pop_front()
            {
                return match event {
                    BusEvent::Record(record) => Ok(record),
                    BusEvent::BusOff => Err(LinkError::BusOff),
                    BusEvent::DeviceRemoved => Err(LinkError::DeviceRemoved),
                };
            }

            if tokio::time::timeout(self.read_timeout, notified).await.is_err() {
                return Err(LinkError::Timeout { after: self.read_timeout });
            }
        }
    }

    async fn close(&mut self) {
        debug!("virtual bus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_injected_records_in_order() {
        let (mut connector, handle) =
            VirtualConnector::new("vcan0", 500_000, Duration::from_millis(200));
        let mut link = connector.open().await.unwrap();

        handle.inject(CanId::Standard(0x100), &[1]);
        handle.inject(CanId::Standard(0x101), &[2]);

        let first = link.read_next().await.unwrap();
        let second = link.read_next().await.unwrap();
        assert_eq!(first, RawRecord::encode(CanId::Standard(0x100), &[1], Direction::Rx, false, 0));
        assert_eq!(second, RawRecord::encode(CanId::Standard(0x101), &[2], Direction::Rx, false, 0));
    }

    #[tokio::test]
    async fn read_times_out_without_traffic() {
        let (mut connector, _handle) =
            VirtualConnector::new("vcan0", 500_000, Duration::from_millis(20));
        let mut link = connector.open().await.unwrap();

        match link.read_next().await {
            Err(LinkError::Timeout { .. }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_failures_are_terminal() {
        let (mut connector, handle) =
            VirtualConnector::new("vcan0", 500_000, Duration::from_millis(200));
        let mut link = connector.open().await.unwrap();

        handle.fail_bus_off();
        let err = link.read_next().await.unwrap_err();
        assert!(err.is_terminal());
        assert!(matches!(err, LinkError::BusOff));
    }

    #[tokio::test]
    async fn mismatched_interface_bitrate_rejects_connects() {
        let (mut connector, handle) =
            VirtualConnector::new("vcan0", 500_000, Duration::from_millis(200));

        handle.set_interface_bitrate(Some(250_000));
        match connector.open().await {
            Err(ConnectError::BitrateMismatch { requested, active, .. }) => {
                assert_eq!(requested, 500_000);
                assert_eq!(active, 250_000);
            }
            other => panic!("expected bitrate mismatch, got {:?}", other.is_ok()),
        }

        handle.set_interface_bitrate(None);
        assert!(connector.open().await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_device_rejects_connects() {
        let (mut connector, handle) =
            VirtualConnector::new("vcan0", 500_000, Duration::from_millis(200));

        handle.set_available(false);
        assert!(matches!(
            connector.open().await,
            Err(ConnectError::DeviceNotFound { .. })
        ));

        handle.set_available(true);
        assert!(connector.open().await.is_ok());
    }
}
