//! TCP protocol client for a single Ether Dream DAC.
//!
//! The client owns both directions of the connection and the scratch buffer
//! used for serialization. Status replies are read one at a time with a
//! bounded window; a window that elapses yields `Ok(None)` rather than an
//! error, so callers can treat a missing reply as a null response and keep
//! their bookkeeping consistent.

use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use log::warn;

use super::protocol::{Command, DacResponse, ReadBytes, SizeBytes, WriteBytes, WriteToBytes};

/// A bi-directional command/status connection to a DAC.
pub struct ProtocolClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    bytes: Vec<u8>,
}

impl ProtocolClient {
    /// Establish a connection with a bounded timeout.
    ///
    /// The DAC greets every new connection with an unsolicited status reply;
    /// that reply is consumed here and returned so the caller starts with
    /// the device's actual playback state.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<(Self, DacResponse)> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;

        let writer = stream.try_clone()?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
            bytes: Vec::new(),
        };

        let hello = client.read_reply(timeout)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                "no status reply after connecting",
            )
        })?;

        Ok((client, hello))
    }

    /// Serialize and send one command.
    pub fn write_command<C>(&mut self, command: C) -> io::Result<()>
    where
        C: Command + WriteToBytes,
    {
        self.bytes.clear();
        self.bytes.write_bytes(command)?;
        self.writer.write_all(&self.bytes)
    }

    /// Read one fixed-size status reply.
    ///
    /// Returns `Ok(None)` when the window elapses without a reply.
    pub fn read_reply(&mut self, timeout: Duration) -> io::Result<Option<DacResponse>> {
        self.reader.get_ref().set_read_timeout(Some(timeout))?;

        let mut buf = [0u8; DacResponse::SIZE_BYTES];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => Ok(Some((&buf[..]).read_bytes::<DacResponse>()?)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a command and wait for its reply.
    ///
    /// A reply carrying an unexpected command byte is still returned after a
    /// warning; the DAC answers commands in order, so this only happens when
    /// an earlier reply window elapsed and its reply arrived late.
    pub fn request<C>(&mut self, command: C, timeout: Duration) -> io::Result<Option<DacResponse>>
    where
        C: Command + WriteToBytes,
    {
        let expected = C::START_BYTE;
        self.write_command(command)?;
        let reply = self.read_reply(timeout)?;
        if let Some(r) = &reply {
            if r.command != expected {
                warn!(
                    "reply for command 0x{:02x} while waiting on 0x{:02x}",
                    r.command, expected
                );
            }
        }
        Ok(reply)
    }
}
