//! Stateless datagram frame output.
//!
//! Each call serializes one frame into one UDP datagram and sends it. No
//! acknowledgement is expected or processed; reliability is the caller's
//! responsibility, typically by re-sending frames at the UI's own cadence.
//! A per-`(ip, channel)` sequence number is embedded for device-side
//! ordering and diagnostics only.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Instant;

use byteorder::{WriteBytesExt, BE};
use log::trace;

use super::protocol::{
    ChannelConfigHeader, ChannelMessageHeader, PacketHeader, SampleChunkHeader, SizeBytes,
    WriteBytes, IDNCMD_RT_CNLMSG, IDNCMD_RT_CNLMSG_CLOSE, IDNFLG_CHNCFG_CLOSE,
    IDNFLG_CHNCFG_ROUTING, IDNVAL_SMOD_LPGRF_DISCRETE, IDN_PORT, XYRGBI_DESCRIPTORS,
    XYRGBI_DESCRIPTOR_WORD_COUNT, XYRGBI_SAMPLE_SIZE,
};
use crate::types::Frame;

/// Frame duration used when the frame carries no usable rate.
const DEFAULT_FRAME_DURATION_US: u32 = 33_333;

/// Sends real-time channel messages to datagram DACs.
pub struct DatagramOutput {
    socket: UdpSocket,
    /// Monotonically increasing sequence per (ip, channel).
    sequences: HashMap<(IpAddr, u8), u16>,
    /// Basis for the coarse 32-bit microsecond timestamps.
    epoch: Instant,
}

impl DatagramOutput {
    pub fn new() -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        Ok(Self {
            socket,
            sequences: HashMap::new(),
            epoch: Instant::now(),
        })
    }

    /// Serialize and transmit one frame as a single datagram.
    pub fn send_frame(&mut self, ip: IpAddr, channel: u8, frame: &Frame) -> io::Result<()> {
        let sequence = self.next_sequence(ip, channel);
        let timestamp = self.timestamp_us();
        let packet = encode_frame_message(channel, sequence, timestamp, frame)?;
        trace!(
            "idn: frame to {} channel {} ({} points, {} bytes)",
            ip,
            channel,
            frame.points.len(),
            packet.len()
        );
        self.socket.send_to(&packet, SocketAddr::new(ip, IDN_PORT))?;
        Ok(())
    }

    /// Tell the device the channel is done, releasing its routing.
    pub fn close_channel(&mut self, ip: IpAddr, channel: u8) -> io::Result<()> {
        let sequence = self.next_sequence(ip, channel);
        let timestamp = self.timestamp_us();
        let packet = encode_close_message(channel, sequence, timestamp)?;
        self.socket.send_to(&packet, SocketAddr::new(ip, IDN_PORT))?;
        Ok(())
    }

    /// Close every channel this output has streamed to at `ip`.
    pub fn close_channels(&mut self, ip: IpAddr) -> io::Result<()> {
        let channels: Vec<u8> = self
            .sequences
            .keys()
            .filter(|(addr, _)| *addr == ip)
            .map(|&(_, channel)| channel)
            .collect();
        for channel in channels {
            self.close_channel(ip, channel)?;
        }
        Ok(())
    }

    /// Close every channel on every device this output has streamed to.
    /// Transport errors are swallowed; this runs during shutdown.
    pub fn close_all_channels(&mut self) {
        let targets: Vec<(IpAddr, u8)> = self.sequences.keys().copied().collect();
        for (ip, channel) in targets {
            if let Err(e) = self.close_channel(ip, channel) {
                log::debug!("idn: close channel {} on {} failed: {}", channel, ip, e);
            }
        }
    }

    fn next_sequence(&mut self, ip: IpAddr, channel: u8) -> u16 {
        let counter = self.sequences.entry((ip, channel)).or_insert(0);
        *counter = counter.wrapping_add(1);
        *counter
    }

    fn timestamp_us(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }
}

/// Encode one real-time frame message.
///
/// Layout: packet header, channel message header, channel configuration,
/// descriptor dictionary, sample chunk header, then one 8-byte XYRGBI
/// record per point. Blanked points carry zero color and a zero intensity
/// marker regardless of their input color.
pub(crate) fn encode_frame_message(
    channel: u8,
    sequence: u16,
    timestamp: u32,
    frame: &Frame,
) -> io::Result<Vec<u8>> {
    let sample_bytes = frame.points.len() * XYRGBI_SAMPLE_SIZE;
    let message_size = ChannelMessageHeader::SIZE_BYTES
        + ChannelConfigHeader::SIZE_BYTES
        + XYRGBI_DESCRIPTORS.len() * 2
        + SampleChunkHeader::SIZE_BYTES
        + sample_bytes;
    let total = PacketHeader::SIZE_BYTES + message_size;
    if message_size > u16::MAX as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }

    let mut packet = Vec::with_capacity(total);
    packet.write_bytes(PacketHeader {
        command: IDNCMD_RT_CNLMSG,
        flags: 0,
        sequence,
    })?;
    packet.write_bytes(ChannelMessageHeader {
        total_size: message_size as u16,
        content_id: ChannelMessageHeader::frame_content_id(channel),
        timestamp,
    })?;
    packet.write_bytes(ChannelConfigHeader {
        word_count: XYRGBI_DESCRIPTOR_WORD_COUNT,
        flags: IDNFLG_CHNCFG_ROUTING,
        service_id: channel,
        service_mode: IDNVAL_SMOD_LPGRF_DISCRETE,
    })?;
    for &word in &XYRGBI_DESCRIPTORS {
        packet.write_u16::<BE>(word)?;
    }
    packet.write_bytes(SampleChunkHeader::new(0, frame_duration_us(frame.rate)))?;

    for point in &frame.points {
        let x = (point.x.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        let y = (point.y.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        let (r, g, b, intensity) = if point.blanking {
            (0, 0, 0, 0)
        } else {
            (point.r, point.g, point.b, 255)
        };
        packet.write_i16::<BE>(x)?;
        packet.write_i16::<BE>(y)?;
        packet.write_u8(r)?;
        packet.write_u8(g)?;
        packet.write_u8(b)?;
        packet.write_u8(intensity)?;
    }

    Ok(packet)
}

/// Encode a close-channel message: an empty channel configuration with the
/// close flag set.
pub(crate) fn encode_close_message(
    channel: u8,
    sequence: u16,
    timestamp: u32,
) -> io::Result<Vec<u8>> {
    let message_size = ChannelMessageHeader::SIZE_BYTES + ChannelConfigHeader::SIZE_BYTES;

    let mut packet = Vec::with_capacity(PacketHeader::SIZE_BYTES + message_size);
    packet.write_bytes(PacketHeader {
        command: IDNCMD_RT_CNLMSG_CLOSE,
        flags: 0,
        sequence,
    })?;
    packet.write_bytes(ChannelMessageHeader {
        total_size: message_size as u16,
        content_id: ChannelMessageHeader::frame_content_id(channel),
        timestamp,
    })?;
    packet.write_bytes(ChannelConfigHeader {
        word_count: 0,
        flags: IDNFLG_CHNCFG_CLOSE,
        service_id: 0,
        service_mode: 0,
    })?;

    Ok(packet)
}

/// The on-wire frame duration: the frame's rate is the UI's refresh cadence
/// for datagram devices, so one frame lasts one refresh interval.
fn frame_duration_us(rate: u32) -> u32 {
    if rate == 0 {
        return DEFAULT_FRAME_DURATION_US;
    }
    (1_000_000 / rate).min(0x00FF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LaserPoint;

    const HEADERS_LEN: usize = 4 + 8 + 4 + 16 + 4;

    #[test]
    fn single_point_frame_produces_expected_length() {
        let frame = Frame::new(vec![LaserPoint::new(0.0, 0.0, 10, 20, 30)], 60);
        let packet = encode_frame_message(0, 1, 0, &frame).unwrap();

        // header + channel message header + config + dictionary + chunk
        // header + one 8-byte record
        assert_eq!(packet.len(), HEADERS_LEN + XYRGBI_SAMPLE_SIZE);
    }

    #[test]
    fn frame_message_layout() {
        let frame = Frame::new(vec![LaserPoint::new(1.0, -1.0, 1, 2, 3)], 60);
        let packet = encode_frame_message(5, 0x0203, 0xAABBCCDD, &frame).unwrap();

        // Packet header
        assert_eq!(packet[0], IDNCMD_RT_CNLMSG);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[2..4], &[0x02, 0x03]);

        // Channel message header: total size includes itself but not the
        // packet header.
        let total_size = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        assert_eq!(total_size, packet.len() - 4);
        let content_id = u16::from_be_bytes([packet[6], packet[7]]);
        assert_eq!(content_id, ChannelMessageHeader::frame_content_id(5));
        assert_eq!(&packet[8..12], &0xAABBCCDDu32.to_be_bytes());

        // Channel configuration routes onto the channel's service.
        assert_eq!(packet[12], XYRGBI_DESCRIPTOR_WORD_COUNT);
        assert_eq!(packet[13], IDNFLG_CHNCFG_ROUTING);
        assert_eq!(packet[14], 5);
        assert_eq!(packet[15], IDNVAL_SMOD_LPGRF_DISCRETE);

        // Dictionary
        assert_eq!(&packet[16..18], &0x4200u16.to_be_bytes());
        assert_eq!(&packet[30..32], &0x5C10u16.to_be_bytes());

        // Sample chunk header: 60 fps -> 16666 us per frame
        let flags_duration = u32::from_be_bytes([packet[32], packet[33], packet[34], packet[35]]);
        assert_eq!(flags_duration, 16_666);

        // Point record: +1/-1 map to the signed 16-bit extremes.
        assert_eq!(&packet[36..38], &32767i16.to_be_bytes());
        assert_eq!(&packet[38..40], &(-32767i16).to_be_bytes());
        assert_eq!(&packet[40..44], &[1, 2, 3, 255]);
    }

    #[test]
    fn blanked_points_are_zeroed_on_the_wire() {
        let mut point = LaserPoint::new(0.0, 0.0, 200, 100, 50);
        point.blanking = true;
        let frame = Frame::new(vec![point], 30);
        let packet = encode_frame_message(0, 1, 0, &frame).unwrap();

        assert_eq!(&packet[HEADERS_LEN + 4..HEADERS_LEN + 8], &[0, 0, 0, 0]);
    }

    #[test]
    fn zero_rate_falls_back_to_default_duration() {
        let frame = Frame::new(vec![LaserPoint::new(0.0, 0.0, 1, 1, 1)], 0);
        let packet = encode_frame_message(0, 1, 0, &frame).unwrap();
        let flags_duration = u32::from_be_bytes([packet[32], packet[33], packet[34], packet[35]]);
        assert_eq!(flags_duration, DEFAULT_FRAME_DURATION_US);
    }

    #[test]
    fn close_message_layout() {
        let packet = encode_close_message(3, 7, 0).unwrap();
        assert_eq!(packet.len(), 4 + 8 + 4);
        assert_eq!(packet[0], IDNCMD_RT_CNLMSG_CLOSE);
        let total_size = u16::from_be_bytes([packet[4], packet[5]]);
        assert_eq!(total_size, 12);
        assert_eq!(packet[13], IDNFLG_CHNCFG_CLOSE);
    }

    #[test]
    fn sequences_are_per_channel_and_increase() {
        let mut output = DatagramOutput::new().unwrap();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(output.next_sequence(ip, 0), 1);
        assert_eq!(output.next_sequence(ip, 0), 2);
        assert_eq!(output.next_sequence(ip, 1), 1);
        assert_eq!(output.next_sequence(ip, 0), 3);
    }
}
