//! Bus link implementations.
//!
//! [`VirtualConnector`] is available everywhere; the SocketCAN hardware
//! link only exists on Linux, where the kernel provides the CAN socket
//! layer.

pub mod virtual_bus;

#[cfg(target_os = "linux")]
pub mod socketcan_bus;

pub use virtual_bus::{VirtualBus, VirtualBusHandle, VirtualConnector};

#[cfg(target_os = "linux")]
pub use socketcan_bus::{SocketCanConnector, SocketCanLink};
