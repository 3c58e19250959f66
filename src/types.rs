//! Core data types shared across the output pipeline.
//!
//! Provides protocol-agnostic types for laser points and frames, the device
//! descriptors produced by discovery, and the status reports pushed by
//! streaming sessions.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// A single laser point in normalized device space.
///
/// Coordinates are normalized:
/// - x: -1.0 (left) to 1.0 (right)
/// - y: -1.0 (bottom) to 1.0 (top)
///
/// Colors are 8-bit. When `blanking` is set the beam is off; both wire
/// encoders force the color channels (and the intensity/on-off marker) to
/// zero for blanked points regardless of what the color fields carry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LaserPoint {
    /// X coordinate, -1.0 to 1.0
    pub x: f32,
    /// Y coordinate, -1.0 to 1.0
    pub y: f32,
    /// Red channel (0-255)
    pub r: u8,
    /// Green channel (0-255)
    pub g: u8,
    /// Blue channel (0-255)
    pub b: u8,
    /// Laser off for this point.
    pub blanking: bool,
}

impl LaserPoint {
    /// Creates a new lit laser point.
    pub fn new(x: f32, y: f32, r: u8, g: u8, b: u8) -> Self {
        Self {
            x,
            y,
            r,
            g,
            b,
            blanking: false,
        }
    }

    /// Creates a blanked point (laser off) at the given position.
    pub fn blanked(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            blanking: true,
            ..Default::default()
        }
    }

    /// Returns true if every color channel is zero.
    pub fn is_dark(&self) -> bool {
        self.r == 0 && self.g == 0 && self.b == 0
    }
}

/// An ordered sequence of points plus the intended playback rate.
///
/// Frames are immutable once submitted: the engine copies and transforms
/// them (optimize, pad) but never mutates a caller's buffer in place, so a
/// frame kept as "last known good" stays valid.
///
/// The meaning of `rate` follows the target protocol: points per second for
/// streamed devices, target frames per second for the datagram path (where
/// it determines the per-frame duration field on the wire).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    pub points: Vec<LaserPoint>,
    pub rate: u32,
}

impl Frame {
    pub fn new(points: Vec<LaserPoint>, rate: u32) -> Self {
        Self { points, rate }
    }
}

/// The wire protocol a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProtocolKind {
    /// Fire-and-forget UDP frame messages (ILDA Digital Network).
    Datagram,
    /// Connection-oriented, ACK-windowed TCP streaming (Ether Dream).
    Streamed,
}

impl ProtocolKind {
    /// Returns the display name for this protocol.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProtocolKind::Datagram => "IDN",
            ProtocolKind::Streamed => "Ether Dream",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// An independently addressable output head on a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Channel {
    pub service_id: u8,
    pub name: String,
}

/// A device found by discovery.
///
/// Deduplicated by `unit_id` for datagram devices and by IP for streamed
/// devices. Channels are populated where the discovery response carries
/// them; datagram devices report their channel map on demand via
/// [`crate::protocols::idn::get_services`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceDescriptor {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: ProtocolKind,
    /// Device-reported unique identifier.
    pub unit_id: String,
    /// Human-readable name.
    pub name: String,
    pub channels: Vec<Channel>,
}

/// Device playback state as reported in status replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PlaybackState {
    Idle,
    Prepared,
    Playing,
}

/// A status snapshot pushed while a streamed session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputStatus {
    pub playback: PlaybackState,
    /// Points queued on the device but not yet drawn.
    pub buffer_fullness: u16,
    pub buffer_capacity: u16,
    pub point_rate: u32,
}

/// Callback invoked with periodic status snapshots for a device.
pub type StatusCallback = Arc<dyn Fn(IpAddr, OutputStatus) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blanked_point_has_zero_color() {
        let point = LaserPoint::blanked(0.25, -0.75);
        assert_eq!(point.x, 0.25);
        assert_eq!(point.y, -0.75);
        assert!(point.blanking);
        assert!(point.is_dark());
    }

    #[test]
    fn protocol_display_names() {
        assert_eq!(format!("{}", ProtocolKind::Datagram), "IDN");
        assert_eq!(format!("{}", ProtocolKind::Streamed), "Ether Dream");
    }

    #[test]
    fn frame_clone_leaves_original_untouched() {
        let frame = Frame::new(vec![LaserPoint::new(0.0, 0.0, 255, 0, 0)], 30_000);
        let mut copy = frame.clone();
        copy.points.push(LaserPoint::blanked(1.0, 1.0));
        assert_eq!(frame.points.len(), 1);
    }
}
