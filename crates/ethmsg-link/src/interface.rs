use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::LinkError;
use crate::mac::MacAddr;
use crate::traits::Link;

/// PCI bus location of the device behind an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciLocation {
    pub domain: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciLocation {
    type Err = LinkError;

    /// Parses the `dddd:bb:dd.f` form used by sysfs and ethtool bus info.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LinkError::InvalidAttribute {
            attribute: "pci",
            value: s.to_string(),
        };

        let (domain, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (device, function) = rest.split_once('.').ok_or_else(invalid)?;

        let hex = |part: &str, max_len: usize| -> Result<u32, LinkError> {
            if part.is_empty() || part.len() > max_len {
                return Err(invalid());
            }
            u32::from_str_radix(part, 16).map_err(|_| invalid())
        };

        Ok(Self {
            domain: hex(domain, 4)?,
            bus: hex(bus, 2)? as u8,
            device: hex(device, 2)? as u8,
            function: hex(function, 1)? as u8,
        })
    }
}

/// A network interface an endpoint can bind to.
///
/// Shared via `Arc`: endpoints keep their interface alive after it is
/// removed from the registry.
pub struct NetInterface {
    name: String,
    mac: MacAddr,
    mtu: usize,
    rate_bps: Option<u64>,
    pci: Option<PciLocation>,
    loopback: bool,
    up: AtomicBool,
    link: Arc<dyn Link>,
}

impl NetInterface {
    /// Describe an interface backed by `link`. MAC and MTU come from the link.
    pub fn new(name: impl Into<String>, link: Arc<dyn Link>) -> Self {
        Self {
            name: name.into(),
            mac: link.mac(),
            mtu: link.mtu(),
            rate_bps: None,
            pci: None,
            loopback: false,
            up: AtomicBool::new(true),
            link,
        }
    }

    /// Set the link rate in bits per second.
    pub fn with_rate(mut self, rate_bps: u64) -> Self {
        self.rate_bps = Some(rate_bps);
        self
    }

    /// Set the PCI bus location.
    pub fn with_pci(mut self, pci: PciLocation) -> Self {
        self.pci = Some(pci);
        self
    }

    /// Mark the interface as a loopback device.
    pub fn with_loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn rate_bps(&self) -> Option<u64> {
        self.rate_bps
    }

    pub fn pci(&self) -> Option<PciLocation> {
        self.pci
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }
}

impl fmt::Debug for NetInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetInterface")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .field("mtu", &self.mtu)
            .field("rate_bps", &self.rate_bps)
            .field("pci", &self.pci)
            .field("loopback", &self.loopback)
            .field("up", &self.is_up())
            .field("link", &self.link.link_name())
            .finish()
    }
}
