//! In-namespace network bring-up.
//!
//! Interface wiring (veth, bridge) belongs to the daemon; the one thing the
//! namespace cannot receive from outside is its own loopback state, so init
//! raises `lo` itself and logs what it can see.

use std::os::fd::AsRawFd;

use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use tracing::{debug, info};

use crate::error::{InitError, Result};

/// Bring the loopback interface up via SIOCSIFFLAGS.
pub fn setup() -> Result<()> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    let name = b"lo\0";
    // SAFETY: "lo" with its NUL fits well within IFNAMSIZ.
    unsafe {
        std::ptr::copy_nonoverlapping(
            name.as_ptr() as *const libc::c_char,
            req.ifr_name.as_mut_ptr(),
            name.len(),
        );
    }

    // SAFETY: SIOCGIFFLAGS reads ifr_name and writes ifr_ifru.ifru_flags;
    // the struct is valid for the whole call.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req) };
    if ret != 0 {
        return Err(InitError::Rootfs(format!(
            "SIOCGIFFLAGS on lo failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: ifru_flags is the active union member after SIOCGIFFLAGS.
    unsafe {
        req.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }

    // SAFETY: SIOCSIFFLAGS reads the whole request struct.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &req) };
    if ret != 0 {
        return Err(InitError::Rootfs(format!(
            "SIOCSIFFLAGS on lo failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    debug!("Loopback interface is up");
    Ok(())
}

/// Log the interfaces visible inside the namespace.
pub fn print_interfaces() {
    match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => {
            for ifaddr in addrs {
                match ifaddr.address {
                    Some(address) => {
                        info!("Interface {}: {:?}", ifaddr.interface_name, address);
                    }
                    None => {
                        info!("Interface {}", ifaddr.interface_name);
                    }
                }
            }
        }
        Err(e) => {
            debug!("Could not list interfaces: {}", e);
        }
    }
}
