//! Laser output streaming engine for network DACs.
//!
//! This crate finds laser-projector output devices ("DACs") on the local
//! network and streams time-critical point frames to them over their native
//! wire protocols, respecting each device's limited onboard buffer and
//! required output point rate.
//!
//! # Supported protocols
//!
//! - **IDN** (ILDA Digital Network) - stateless, fire-and-forget UDP frame
//!   messages with host-initiated broadcast discovery.
//! - **Ether Dream** - connection-oriented TCP streaming with ACK-windowed
//!   flow control; the DACs announce themselves via UDP broadcast.
//!
//! # Overview
//!
//! The [`OutputDispatcher`] is the public entry point: it routes frames to
//! the right adapter by device protocol, owns one streaming session per
//! Ether Dream device, and shares a single datagram socket across IDN
//! devices. Frames pass through the point-stream [`optimizer`] on the way
//! in; streamed sessions additionally pad short frames to the number of
//! points the device needs per refresh (see [`padding`]).
//!
//! ```no_run
//! use beamlink::{Frame, LaserPoint, OutputDispatcher, ProtocolKind};
//! use std::time::Duration;
//!
//! let dispatcher = OutputDispatcher::new();
//! for device in dispatcher.discover(Duration::from_secs(2), None) {
//!     println!("found {} at {}", device.name, device.ip);
//!
//!     let points = vec![LaserPoint::new(0.0, 0.0, 255, 0, 0)];
//!     dispatcher.send_frame(device.ip, 0, Frame::new(points, 12_000), device.protocol)?;
//! }
//! # Ok::<(), beamlink::Error>(())
//! ```
//!
//! # Coordinate system
//!
//! All points use normalized coordinates: -1.0 to 1.0 on both axes, 8-bit
//! color. Each adapter converts to its native wire format, forcing blanked
//! points to zero color on the wire.

pub mod discovery;
pub mod dispatcher;
mod error;
pub mod netif;
pub mod optimizer;
pub mod padding;
pub mod protocols;
pub mod types;

pub use discovery::discover;
pub use dispatcher::OutputDispatcher;
pub use error::{Error, Result};
pub use netif::{network_interfaces, NetworkInterface};
pub use optimizer::optimize;
pub use padding::pad;
pub use protocols::ether_dream::SessionConfig;
pub use types::{
    Channel, DeviceDescriptor, Frame, LaserPoint, OutputStatus, PlaybackState, ProtocolKind,
    StatusCallback,
};
