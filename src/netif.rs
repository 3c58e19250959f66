//! Local network interface enumeration.
//!
//! Hosts use this to offer an interface picker for discovery on multi-homed
//! machines. Only IPv4 interfaces are reported; loopback is skipped.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// A local network interface usable as a discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkInterface {
    pub name: String,
    pub address: Ipv4Addr,
}

/// Enumerate local IPv4 interfaces.
///
/// Returns an empty list when enumeration fails or is unsupported on the
/// platform.
pub fn network_interfaces() -> Vec<NetworkInterface> {
    list_interfaces().unwrap_or_default()
}

#[cfg(unix)]
fn list_interfaces() -> std::io::Result<Vec<NetworkInterface>> {
    use std::ffi::CStr;

    let mut interfaces = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;

            if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
                continue;
            }
            if (*ifa.ifa_addr).sa_family as i32 != libc::AF_INET {
                continue;
            }

            let addr = ifa.ifa_addr as *const libc::sockaddr_in;
            let ip_bytes = (*addr).sin_addr.s_addr.to_ne_bytes();
            let address = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);
            if address.is_loopback() {
                continue;
            }

            let Ok(name) = CStr::from_ptr(ifa.ifa_name).to_str() else {
                continue;
            };
            interfaces.push(NetworkInterface {
                name: name.to_string(),
                address,
            });
        }

        libc::freeifaddrs(ifaddrs);
    }

    Ok(interfaces)
}

#[cfg(not(unix))]
fn list_interfaces() -> std::io::Result<Vec<NetworkInterface>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_does_not_panic_and_skips_loopback() {
        for interface in network_interfaces() {
            assert!(!interface.address.is_loopback());
            assert!(!interface.name.is_empty());
        }
    }
}
