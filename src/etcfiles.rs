//! Sandbox identity: hostname, domainname, and the synthesized /etc files.
//!
//! Runs after the chroot, so every path here is relative to the new root.

use std::ffi::CString;
use std::fs;

use nix::unistd::sethostname;
use tracing::{error, info, warn};

use crate::error::{InitError, Result};

const DOMAINNAME: &str = "local";

const HOSTS_TEMPLATE: &str = "127.0.0.1\tlocalhost
127.0.1.1\t%HOSTNAME% %HOSTNAME%.%DOMAINNAME%
::1     localhost ip6-localhost ip6-loopback
ff02::1 ip6-allnodes
ff02::2 ip6-allrouters
%ADDITIONAL%";

/// Render the /etc/hosts content. The `%ADDITIONAL%` marker is always
/// consumed; profile-provided entries are separated by a blank line.
fn hosts_content(hostname: &str, additional: &str) -> String {
    let additional = if additional.is_empty() {
        String::new()
    } else {
        format!("\n\n{additional}")
    };
    HOSTS_TEMPLATE
        .replace("%HOSTNAME%", hostname)
        .replace("%DOMAINNAME%", DOMAINNAME)
        .replace("\n%ADDITIONAL%", &additional)
}

/// Set the UTS names. A hostname failure is fatal; the domainname is only
/// logged because nothing in the sandbox depends on it.
pub fn set_host_identity(name: &str) -> Result<()> {
    sethostname(name).map_err(|_| InitError::HostnameSet(name.to_string()))?;
    let c_name = CString::new(DOMAINNAME).expect("static domainname");
    // SAFETY: setdomainname only reads the provided buffer for len bytes.
    let ret = unsafe { libc::setdomainname(c_name.as_ptr(), DOMAINNAME.len()) };
    if ret != 0 {
        error!("Failed to set domainname");
    }
    info!("Hostname set to ({}.{})", name, DOMAINNAME);
    Ok(())
}

/// Write `/etc/{hostname, domainname, hosts, machine-id, fstab}`. Each file
/// failure is a warning; the sandbox works without them.
pub fn write_etc_files(hostname: &str, dbus_uuid: &str, additional_hosts: &str) {
    let entries: &[(&str, String)] = &[
        ("hostname", hostname.to_string()),
        ("domainname", DOMAINNAME.to_string()),
        ("hosts", hosts_content(hostname, additional_hosts)),
        ("machine-id", dbus_uuid.to_string()),
        ("fstab", "# This fstab file is empty".to_string()),
    ];
    for (name, content) in entries {
        let path = format!("/etc/{name}");
        if let Err(e) = fs::write(&path, format!("{content}\n")) {
            warn!("Unable to setup etc file item: {}", e);
        }
    }
}

/// Record which profile owns this sandbox at `/tmp/oz-sandbox`.
pub fn write_sandbox_marker(profile_name: &str) {
    if let Err(e) = fs::write("/tmp/oz-sandbox", profile_name) {
        warn!("Failed to write sandbox marker: {}", e);
    }
}
