//! Unified device discovery across both wire protocols.

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use log::warn;

use crate::protocols::{ether_dream, idn};
use crate::types::DeviceDescriptor;

/// Discover devices speaking either protocol.
///
/// Both protocol discoveries run concurrently and their results are merged.
/// `interface` restricts the IDN scan's source interface; Ether Dream
/// discovery is passive (the DACs broadcast) and listens on all interfaces.
///
/// Each protocol runs at most one discovery session at a time: reentrant
/// calls while one is active contribute an empty result for that protocol
/// rather than queueing.
pub fn discover(timeout: Duration, interface: Option<Ipv4Addr>) -> Vec<DeviceDescriptor> {
    let idn_scan = thread::Builder::new()
        .name("beamlink-discover-idn".into())
        .spawn(move || idn::discover(timeout, interface));
    let ether_dream_scan = thread::Builder::new()
        .name("beamlink-discover-etherdream".into())
        .spawn(move || ether_dream::discover(timeout));

    let mut devices = Vec::new();
    for handle in [idn_scan, ether_dream_scan] {
        match handle {
            Ok(handle) => match handle.join() {
                Ok(found) => devices.extend(found),
                Err(_) => warn!("discovery worker panicked"),
            },
            Err(e) => warn!("failed to spawn discovery worker: {}", e),
        }
    }
    devices
}
