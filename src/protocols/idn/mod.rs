//! IDN (ILDA Digital Network) protocol support.
//!
//! Unlike Ether Dream, IDN devices stay quiet until asked: discovery
//! broadcasts scan requests and collects the responses. Frame output is
//! fire-and-forget UDP, handled by [`output`].

pub mod output;
pub mod protocol;

pub use output::DatagramOutput;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::types::{Channel, DeviceDescriptor, ProtocolKind};
use protocol::{
    PacketHeader, ReadBytes, ScanResponse, ServiceMapResponseHeader, SizeBytes, WriteBytes,
    IDNCMD_SCAN_REQUEST, IDNCMD_SCAN_RESPONSE, IDNCMD_SERVICEMAP_REQUEST,
    IDNCMD_SERVICEMAP_RESPONSE, IDN_PORT,
};

/// Requests sent back-to-back at the start of a scan to accelerate the
/// first response.
const SCAN_BURST_COUNT: usize = 10;

/// Spacing between burst requests; also the receive slice while waiting.
const SCAN_BURST_SPACING: Duration = Duration::from_millis(20);

/// Broadcast cadence after the initial burst.
const SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// A scan ends early once at least one device responded and this window
/// passes without a new unique device.
const SCAN_SETTLE_WINDOW: Duration = Duration::from_millis(500);

/// Only one discovery session runs at a time; reentrant calls return empty.
static DISCOVERY_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Broadcast scan requests and collect responding devices.
///
/// `interface` restricts the scan to one local interface; `None` binds to
/// any. Responses are deduplicated by the device-reported unit ID, so one
/// device answering from several source ports yields one descriptor.
/// Malformed datagrams are discarded and the scan continues.
pub fn discover(timeout: Duration, interface: Option<Ipv4Addr>) -> Vec<DeviceDescriptor> {
    if DISCOVERY_ACTIVE
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("idn: discovery already running, returning empty");
        return Vec::new();
    }

    let devices = match scan(timeout, interface) {
        Ok(devices) => devices,
        Err(e) => {
            warn!("idn: discovery failed: {}", e);
            Vec::new()
        }
    };

    DISCOVERY_ACTIVE.store(false, Ordering::Release);
    devices
}

fn scan(timeout: Duration, interface: Option<Ipv4Addr>) -> io::Result<Vec<DeviceDescriptor>> {
    let bind_ip = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let socket = UdpSocket::bind(SocketAddrV4::new(bind_ip, 0))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(SCAN_BURST_SPACING))?;

    let start = Instant::now();
    let mut sequence: u16 = 0;
    let mut collector = ScanCollector::new();

    // Initial burst; the receive slice between sends doubles as spacing.
    for _ in 0..SCAN_BURST_COUNT {
        send_scan_request(&socket, &mut sequence)?;
        collect_responses(&socket, &mut collector, SCAN_BURST_SPACING);
    }

    let mut last_broadcast = Instant::now();
    while start.elapsed() < timeout {
        if collector.settled(Instant::now(), SCAN_SETTLE_WINDOW) {
            debug!("idn: scan settled after {:?}", start.elapsed());
            break;
        }
        if last_broadcast.elapsed() >= SCAN_INTERVAL {
            send_scan_request(&socket, &mut sequence)?;
            last_broadcast = Instant::now();
        }
        collect_responses(&socket, &mut collector, SCAN_BURST_SPACING);
    }

    let devices = collector.into_devices();
    debug!("idn: scan complete, found {} devices", devices.len());
    Ok(devices)
}

fn send_scan_request(socket: &UdpSocket, sequence: &mut u16) -> io::Result<()> {
    let header = PacketHeader {
        command: IDNCMD_SCAN_REQUEST,
        flags: 0,
        sequence: *sequence,
    };
    *sequence = sequence.wrapping_add(1);

    let mut packet = Vec::with_capacity(PacketHeader::SIZE_BYTES);
    packet.write_bytes(header)?;

    let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, IDN_PORT);
    socket.send_to(&packet, broadcast)?;
    Ok(())
}

/// Receive responses for up to `window`, feeding them to the collector.
fn collect_responses(socket: &UdpSocket, collector: &mut ScanCollector, window: Duration) {
    let deadline = Instant::now() + window;
    let mut buffer = [0u8; 1500];
    loop {
        match socket.recv_from(&mut buffer) {
            Ok((len, src)) => {
                collector.ingest(&buffer[..len], src, Instant::now());
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("idn: receive error during scan: {}", e);
            }
        }
        if Instant::now() >= deadline {
            return;
        }
    }
}

/// Accumulates scan responses, deduplicating by unit ID.
pub(crate) struct ScanCollector {
    devices: HashMap<String, DeviceDescriptor>,
    last_new_device: Option<Instant>,
}

impl ScanCollector {
    pub(crate) fn new() -> Self {
        Self {
            devices: HashMap::new(),
            last_new_device: None,
        }
    }

    /// Feed one received datagram. Returns true if it added a new device;
    /// malformed or duplicate responses are discarded without error.
    pub(crate) fn ingest(&mut self, bytes: &[u8], src: SocketAddr, now: Instant) -> bool {
        let Some(descriptor) = parse_scan_response(bytes, src.ip()) else {
            return false;
        };
        if self.devices.contains_key(&descriptor.unit_id) {
            return false;
        }
        debug!("idn: found {} at {}", descriptor.name, src.ip());
        self.devices.insert(descriptor.unit_id.clone(), descriptor);
        self.last_new_device = Some(now);
        true
    }

    /// True once at least one device responded and `window` has passed
    /// without a new unique device.
    pub(crate) fn settled(&self, now: Instant, window: Duration) -> bool {
        match self.last_new_device {
            Some(at) => now.saturating_duration_since(at) >= window,
            None => false,
        }
    }

    pub(crate) fn into_devices(self) -> Vec<DeviceDescriptor> {
        self.devices.into_values().collect()
    }
}

/// Parse one scan-response datagram into a device descriptor.
fn parse_scan_response(bytes: &[u8], ip: IpAddr) -> Option<DeviceDescriptor> {
    if bytes.len() < PacketHeader::SIZE_BYTES + ScanResponse::SIZE_BYTES {
        return None;
    }
    let mut cursor = bytes;
    let header: PacketHeader = cursor.read_bytes().ok()?;
    if header.command != IDNCMD_SCAN_RESPONSE {
        return None;
    }
    let response: ScanResponse = cursor.read_bytes().ok()?;

    let unit_id = response.unit_id_str();
    if unit_id.is_empty() {
        return None;
    }
    let hostname = response.hostname_str();
    let name = if hostname.is_empty() {
        format!("IDN:{}", unit_id)
    } else {
        format!("IDN:{}", hostname)
    };

    Some(DeviceDescriptor {
        ip,
        port: IDN_PORT,
        protocol: ProtocolKind::Datagram,
        unit_id,
        name,
        // The channel map is requested on demand via get_services.
        channels: Vec::new(),
    })
}

/// Query a device's service map: one request/response round trip, no
/// retries. Returns an empty list on timeout or malformed response.
pub fn get_services(ip: IpAddr, local_ip: Option<Ipv4Addr>, timeout: Duration) -> Vec<Channel> {
    match query_service_map(ip, local_ip, timeout) {
        Ok(channels) => channels,
        Err(e) => {
            debug!("idn: service map query for {} failed: {}", ip, e);
            Vec::new()
        }
    }
}

fn query_service_map(
    ip: IpAddr,
    local_ip: Option<Ipv4Addr>,
    timeout: Duration,
) -> io::Result<Vec<Channel>> {
    let bind_ip = local_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let socket = UdpSocket::bind(SocketAddrV4::new(bind_ip, 0))?;
    socket.set_read_timeout(Some(timeout))?;

    let header = PacketHeader {
        command: IDNCMD_SERVICEMAP_REQUEST,
        flags: 0,
        sequence: 0,
    };
    let mut packet = Vec::with_capacity(PacketHeader::SIZE_BYTES);
    packet.write_bytes(header)?;
    socket.send_to(&packet, SocketAddr::new(ip, IDN_PORT))?;

    let deadline = Instant::now() + timeout;
    let mut buffer = [0u8; 1500];
    loop {
        match socket.recv_from(&mut buffer) {
            Ok((len, src)) if src.ip() == ip => {
                return Ok(parse_service_map(&buffer[..len]).unwrap_or_default());
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Ok(Vec::new());
        }
    }
}

/// Parse a service map response into the device's channel list.
///
/// Relay entries are skipped; each service entry contributes its ID and
/// name. Entry sizes come from the response header, so unknown future
/// fields are tolerated.
fn parse_service_map(bytes: &[u8]) -> Option<Vec<Channel>> {
    if bytes.len() < PacketHeader::SIZE_BYTES + ServiceMapResponseHeader::SIZE_BYTES {
        return None;
    }
    let mut cursor = bytes;
    let header: PacketHeader = cursor.read_bytes().ok()?;
    if header.command != IDNCMD_SERVICEMAP_RESPONSE {
        return None;
    }
    let map_header: ServiceMapResponseHeader = cursor.read_bytes().ok()?;
    let entry_size = map_header.entry_size as usize;
    if entry_size < 24 {
        return None;
    }

    let mut offset =
        PacketHeader::SIZE_BYTES + ServiceMapResponseHeader::SIZE_BYTES;
    offset += map_header.relay_entry_count as usize * entry_size;

    let mut channels = Vec::new();
    for _ in 0..map_header.service_entry_count {
        if offset + entry_size > bytes.len() {
            break;
        }
        let entry = &bytes[offset..offset + entry_size];
        let service_id = entry[0];
        let name_bytes = &entry[4..24];
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..end]).trim().to_string();
        channels.push(Channel { service_id, name });
        offset += entry_size;
    }
    Some(channels)
}
