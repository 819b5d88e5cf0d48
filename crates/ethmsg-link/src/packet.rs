//! Linux raw-socket link and sysfs interface probing.

use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{LinkError, Result};
use crate::interface::PciLocation;
use crate::mac::MacAddr;
use crate::traits::{Link, ETH_HEADER_LEN};

/// Where the kernel publishes network interface attributes.
pub const SYSFS_NET: &str = "/sys/class/net";

/// `ARPHRD_LOOPBACK` as reported in `/sys/class/net/*/type`.
const ARPHRD_LOOPBACK: &str = "772";

/// `sll_pkttype` for frames this host sent.
const PACKET_OUTGOING: u8 = 4;

/// Interface attributes read from sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceProbe {
    pub name: String,
    pub mac: MacAddr,
    pub mtu: usize,
    /// Link rate in bits per second, when the driver reports one.
    pub rate_bps: Option<u64>,
    pub pci: Option<PciLocation>,
    pub loopback: bool,
    pub up: bool,
}

/// Probe `name` under `/sys/class/net`.
pub fn probe_interface(name: &str) -> Result<InterfaceProbe> {
    probe_interface_in(Path::new(SYSFS_NET), name)
}

/// Probe `name` under an arbitrary sysfs-shaped directory.
pub fn probe_interface_in(root: &Path, name: &str) -> Result<InterfaceProbe> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(LinkError::InvalidAttribute {
            attribute: "interface",
            value: name.to_string(),
        });
    }

    let dir = root.join(name);
    let read = |attr: &str| -> Result<String> {
        fs::read_to_string(dir.join(attr))
            .map(|s| s.trim().to_string())
            .map_err(|source| LinkError::Open {
                interface: name.to_string(),
                source,
            })
    };

    let mac: MacAddr = read("address")?.parse()?;
    let mtu_raw = read("mtu")?;
    let mtu = mtu_raw
        .parse::<usize>()
        .map_err(|_| LinkError::InvalidAttribute {
            attribute: "mtu",
            value: mtu_raw.clone(),
        })?;

    // `speed` is Mb/s, -1 or unreadable when the link is down.
    let rate_bps = read("speed")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|mbps| *mbps > 0)
        .map(|mbps| mbps as u64 * 1_000_000);

    let pci = fs::read_link(dir.join("device"))
        .ok()
        .and_then(|target| target.file_name()?.to_str()?.parse().ok());

    let loopback = read("type").is_ok_and(|t| t == ARPHRD_LOOPBACK);
    let up = read("operstate").is_ok_and(|s| s == "up" || s == "unknown");

    Ok(InterfaceProbe {
        name: name.to_string(),
        mac,
        mtu,
        rate_bps,
        pci,
        loopback,
        up,
    })
}

/// Raw `AF_PACKET` socket bound to one interface and one EtherType.
pub struct PacketLink {
    fd: OwnedFd,
    name: String,
    mac: MacAddr,
    mtu: usize,
    ifindex: i32,
}

impl PacketLink {
    /// Open a raw socket on `name` receiving only `ethertype` frames.
    ///
    /// Requires `CAP_NET_RAW`.
    pub fn open(name: &str, ethertype: u16) -> Result<Self> {
        let probe = probe_interface(name)?;
        let open_err = |source: io::Error| LinkError::Open {
            interface: name.to_string(),
            source,
        };

        let cname = CString::new(name).map_err(|_| LinkError::InvalidAttribute {
            attribute: "interface",
            value: name.to_string(),
        })?;

        // SAFETY: cname is a valid NUL-terminated string.
        let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if ifindex == 0 {
            return Err(open_err(io::Error::last_os_error()));
        }
        let ifindex = ifindex as i32;

        let protocol = ethertype.to_be();
        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                i32::from(protocol),
            )
        };
        if raw < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }
        // SAFETY: raw is a freshly created descriptor we exclusively own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex;

        // SAFETY: addr is a properly initialized sockaddr_ll and the length matches.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_ll).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        debug!(interface = name, ifindex, mac = %probe.mac, mtu = probe.mtu, "opened packet link");
        Ok(Self {
            fd,
            name: name.to_string(),
            mac: probe.mac,
            mtu: probe.mtu,
            ifindex,
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.name
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }
}

impl Link for PacketLink {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn transmit(&self, frame: &[u8]) -> Result<()> {
        if frame.len() < ETH_HEADER_LEN {
            return Err(LinkError::FrameTooShort(frame.len()));
        }
        if frame.len() > self.max_frame_len() {
            return Err(LinkError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_len(),
            });
        }

        // SAFETY: frame is a valid buffer of frame.len() bytes for the call.
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast::<libc::c_void>(),
                frame.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(LinkError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(self.max_frame_len());
        loop {
            // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
            let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
            let mut from_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

            // SAFETY: buf has buf.len() writable bytes; from/from_len describe a valid sockaddr_ll.
            let rc = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    libc::MSG_DONTWAIT | libc::MSG_TRUNC,
                    (&mut from as *mut libc::sockaddr_ll).cast::<libc::sockaddr>(),
                    &mut from_len,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                    _ => Err(LinkError::Io(err)),
                };
            }

            let len = rc as usize;
            if from.sll_pkttype == PACKET_OUTGOING {
                continue;
            }
            if len > buf.len() {
                trace!(interface = %self.name, len, "oversized frame truncated, dropped");
                continue;
            }
            buf.truncate(len);
            return Ok(Some(buf.freeze()));
        }
    }

    fn link_name(&self) -> &'static str {
        "af_packet"
    }
}

impl std::fmt::Debug for PacketLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketLink")
            .field("interface", &self.name)
            .field("ifindex", &self.ifindex)
            .field("mac", &self.mac)
            .field("mtu", &self.mtu)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fake_sysfs(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "ethmsg-sysfs-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn write_iface(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (attr, value) in attrs {
            fs::write(dir.join(attr), format!("{value}\n")).unwrap();
        }
    }

    #[test]
    fn probe_reads_attributes() {
        let root = fake_sysfs("full");
        write_iface(
            &root,
            "eth0",
            &[
                ("address", "aa:bb:cc:dd:ee:ff"),
                ("mtu", "9000"),
                ("speed", "25000"),
                ("type", "1"),
                ("operstate", "up"),
            ],
        );
        let pci_dir = root.join("devices").join("0000:3b:00.1");
        fs::create_dir_all(&pci_dir).unwrap();
        std::os::unix::fs::symlink(&pci_dir, root.join("eth0").join("device")).unwrap();

        let probe = probe_interface_in(&root, "eth0").unwrap();
        assert_eq!(probe.mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(probe.mtu, 9000);
        assert_eq!(probe.rate_bps, Some(25_000_000_000));
        assert_eq!(probe.pci.map(|p| p.to_string()).as_deref(), Some("0000:3b:00.1"));
        assert!(!probe.loopback);
        assert!(probe.up);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn probe_tolerates_missing_optional_attributes() {
        let root = fake_sysfs("lo");
        write_iface(
            &root,
            "lo",
            &[
                ("address", "00:00:00:00:00:00"),
                ("mtu", "65536"),
                ("speed", "-1"),
                ("type", "772"),
                ("operstate", "unknown"),
            ],
        );

        let probe = probe_interface_in(&root, "lo").unwrap();
        assert!(probe.loopback);
        assert!(probe.up);
        assert_eq!(probe.rate_bps, None);
        assert_eq!(probe.pci, None);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn probe_rejects_unknown_and_traversal() {
        let root = fake_sysfs("missing");
        assert!(matches!(
            probe_interface_in(&root, "nope0"),
            Err(LinkError::Open { .. })
        ));
        assert!(matches!(
            probe_interface_in(&root, "../etc"),
            Err(LinkError::InvalidAttribute { .. })
        ));
        let _ = fs::remove_dir_all(&root);
    }
}
