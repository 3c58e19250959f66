//! Public entry point routing output calls to the protocol adapters.
//!
//! The dispatcher owns the per-device session registry for the streamed
//! protocol and a shared datagram output for the connectionless one.
//! Registry operations are serialized by a single mutex, so checking for an
//! existing session and creating one is atomic per IP: no two sessions for
//! the same device can be created concurrently.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::discovery;
use crate::error::Result;
use crate::netif::{self, NetworkInterface};
use crate::optimizer::optimize;
use crate::protocols::ether_dream::{SessionConfig, StreamedSession};
use crate::protocols::idn::{self, DatagramOutput};
use crate::types::{Channel, DeviceDescriptor, Frame, ProtocolKind, StatusCallback};

/// Owns one streaming session per device IP.
///
/// Sessions are created on first use and replaced when a previous session
/// has shut down (stopped or lost its connection); callers retry simply by
/// sending again.
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<IpAddr, Arc<StreamedSession>>>,
}

impl SessionRegistry {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the live session for `ip`, creating one if none exists or the
    /// existing one has shut down.
    fn get_or_create(
        &self,
        ip: IpAddr,
        config: &SessionConfig,
        status_callback: Option<StatusCallback>,
    ) -> Arc<StreamedSession> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&ip) {
            if session.is_active() {
                return Arc::clone(session);
            }
        }

        debug!("registry: creating session for {}", ip);
        let session = Arc::new(StreamedSession::spawn(ip, config.clone(), status_callback));
        sessions.insert(ip, Arc::clone(&session));
        session
    }

    /// Remove and tear down the session for `ip`. Returns true if one
    /// existed.
    fn remove(&self, ip: IpAddr) -> bool {
        let session = self.sessions.lock().unwrap().remove(&ip);
        match session {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    /// Tear down every session, joining each worker. Best-effort: underlying
    /// transport errors during teardown are swallowed by the sessions.
    fn close_all(&self) {
        let sessions: Vec<Arc<StreamedSession>> =
            self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop();
        }
    }
}

/// Routes `send_frame`/`start_output`/`stop_output` calls to the correct
/// protocol adapter and owns the session registry.
pub struct OutputDispatcher {
    config: SessionConfig,
    registry: SessionRegistry,
    datagram: Mutex<Option<DatagramOutput>>,
    status_callback: Mutex<Option<StatusCallback>>,
}

impl OutputDispatcher {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    /// Create a dispatcher with custom session tunables.
    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            datagram: Mutex::new(None),
            status_callback: Mutex::new(None),
        }
    }

    /// Install the callback receiving periodic status snapshots from active
    /// streamed sessions. Takes effect for sessions created afterwards.
    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.status_callback.lock().unwrap() = Some(callback);
    }

    /// Discover devices on the local network. See [`discovery::discover`].
    pub fn discover(
        &self,
        timeout: Duration,
        interface: Option<Ipv4Addr>,
    ) -> Vec<DeviceDescriptor> {
        discovery::discover(timeout, interface)
    }

    /// Query a device's channel map.
    ///
    /// Streamed devices expose a single output and are answered without a
    /// network round trip; datagram devices are queried on demand.
    pub fn get_services(
        &self,
        ip: IpAddr,
        local_ip: Option<Ipv4Addr>,
        timeout: Duration,
        protocol: ProtocolKind,
    ) -> Vec<Channel> {
        match protocol {
            ProtocolKind::Streamed => vec![Channel {
                service_id: 0,
                name: "Main".to_string(),
            }],
            ProtocolKind::Datagram => idn::get_services(ip, local_ip, timeout),
        }
    }

    /// Submit a frame for output on `channel` of the device at `ip`.
    ///
    /// The frame is optimized before it reaches the adapter. For streamed
    /// devices this queues onto (and if needed creates) the device session;
    /// for datagram devices it transmits immediately.
    pub fn send_frame(
        &self,
        ip: IpAddr,
        channel: u8,
        frame: Frame,
        protocol: ProtocolKind,
    ) -> Result<()> {
        let frame = Frame::new(optimize(&frame.points), frame.rate);

        match protocol {
            ProtocolKind::Datagram => {
                self.with_datagram(|output| output.send_frame(ip, channel, &frame))
            }
            ProtocolKind::Streamed => {
                let session =
                    self.registry
                        .get_or_create(ip, &self.config, self.status_callback());
                session.enqueue(frame);
                Ok(())
            }
        }
    }

    /// Start output to the device at `ip`.
    ///
    /// For streamed devices this connects (bounded by the configured connect
    /// timeout) and surfaces failure as a result; the caller may retry by
    /// calling again. Datagram devices are connectionless and always ready.
    pub fn start_output(&self, ip: IpAddr, protocol: ProtocolKind) -> Result<()> {
        match protocol {
            ProtocolKind::Streamed => {
                let session =
                    self.registry
                        .get_or_create(ip, &self.config, self.status_callback());
                // Allow a little slack past the worker's own connect timeout.
                let wait = self.config.connect_timeout + Duration::from_millis(500);
                session.wait_connected(wait)
            }
            ProtocolKind::Datagram => Ok(()),
        }
    }

    /// Stop output to the device at `ip` and release its resources.
    pub fn stop_output(&self, ip: IpAddr, protocol: ProtocolKind) -> Result<()> {
        match protocol {
            ProtocolKind::Streamed => {
                self.registry.remove(ip);
                Ok(())
            }
            ProtocolKind::Datagram => self.with_datagram(|output| output.close_channels(ip)),
        }
    }

    /// Synchronously tear down every active session. Required for clean
    /// process shutdown; transport errors during teardown are swallowed.
    pub fn close_all(&self) {
        self.registry.close_all();
        if let Some(output) = self.datagram.lock().unwrap().as_mut() {
            output.close_all_channels();
        }
    }

    /// Enumerate local network interfaces usable for discovery.
    pub fn network_interfaces(&self) -> Vec<NetworkInterface> {
        netif::network_interfaces()
    }

    fn status_callback(&self) -> Option<StatusCallback> {
        self.status_callback.lock().unwrap().clone()
    }

    /// Run an operation against the shared datagram output, creating its
    /// socket on first use.
    fn with_datagram<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&mut DatagramOutput) -> std::io::Result<()>,
    {
        let mut guard = self.datagram.lock().unwrap();
        if guard.is_none() {
            *guard = Some(DatagramOutput::new()?);
        }
        match guard.as_mut() {
            Some(output) => op(output).map_err(Into::into),
            None => Ok(()),
        }
    }
}

impl Default for OutputDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OutputDispatcher {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streamed_services_answer_without_network() {
        let dispatcher = OutputDispatcher::new();
        let channels = dispatcher.get_services(
            "10.0.0.1".parse().unwrap(),
            None,
            Duration::from_millis(1),
            ProtocolKind::Streamed,
        );
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].service_id, 0);
        assert_eq!(channels[0].name, "Main");
    }

    #[test]
    fn stop_output_without_session_is_a_no_op() {
        let dispatcher = OutputDispatcher::new();
        dispatcher
            .stop_output("10.0.0.2".parse().unwrap(), ProtocolKind::Streamed)
            .unwrap();
        dispatcher.close_all();
    }
}
