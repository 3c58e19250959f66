//! Ether Dream protocol support: broadcast discovery plus the
//! connection-oriented streaming session.
//!
//! Ether Dream DACs announce themselves by broadcasting a status datagram
//! on UDP port 7654 once per second; discovery just listens. Streaming runs
//! over TCP with explicit flow control, handled by [`session`].

pub mod client;
pub mod flow;
pub mod protocol;
pub mod session;

pub use session::{SessionConfig, StreamedSession};

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::types::{Channel, DeviceDescriptor, ProtocolKind};
use protocol::{DacBroadcast, ReadBytes, SizeBytes, BROADCAST_PORT, COMMUNICATION_PORT};

/// Receive slice while collecting broadcasts.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Only one discovery session runs at a time; reentrant calls return empty.
static DISCOVERY_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Listen for DAC broadcasts until the timeout elapses.
///
/// Devices are deduplicated by source IP. Malformed datagrams are discarded
/// and listening continues.
pub fn discover(timeout: Duration) -> Vec<DeviceDescriptor> {
    if DISCOVERY_ACTIVE
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("ether dream: discovery already running, returning empty");
        return Vec::new();
    }

    let devices = match listen_for_broadcasts(timeout) {
        Ok(devices) => devices,
        Err(e) => {
            warn!("ether dream: discovery failed: {}", e);
            Vec::new()
        }
    };

    DISCOVERY_ACTIVE.store(false, Ordering::Release);
    devices
}

fn listen_for_broadcasts(timeout: Duration) -> io::Result<Vec<DeviceDescriptor>> {
    // Other processes may also be listening for DAC broadcasts, so the
    // port is bound with reuse enabled.
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, BROADCAST_PORT);
    socket.bind(&SockAddr::from(bind_addr))?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    let socket: UdpSocket = socket.into();

    let start = Instant::now();
    let mut found: HashMap<IpAddr, DeviceDescriptor> = HashMap::new();
    let mut buffer = [0u8; 512];

    while start.elapsed() < timeout {
        match socket.recv_from(&mut buffer) {
            Ok((len, src)) => {
                if found.contains_key(&src.ip()) {
                    continue;
                }
                let Some(descriptor) = parse_broadcast(&buffer[..len], src.ip()) else {
                    continue;
                };
                debug!("ether dream: found {} at {}", descriptor.name, src.ip());
                found.insert(src.ip(), descriptor);
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(found.into_values().collect())
}

/// Parse one broadcast datagram into a device descriptor.
///
/// Returns `None` for truncated or malformed datagrams.
pub(crate) fn parse_broadcast(bytes: &[u8], ip: IpAddr) -> Option<DeviceDescriptor> {
    if bytes.len() < DacBroadcast::SIZE_BYTES {
        return None;
    }
    let broadcast: DacBroadcast = (&bytes[..]).read_bytes().ok()?;

    Some(DeviceDescriptor {
        ip,
        port: COMMUNICATION_PORT,
        protocol: ProtocolKind::Streamed,
        unit_id: broadcast.mac_address.to_string(),
        name: format!("Ether Dream ({})", broadcast.mac_address),
        // The DAC itself is the single addressable output.
        channels: vec![Channel {
            service_id: 0,
            name: "Main".to_string(),
        }],
    })
}
