//! Registered network interfaces.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ethmsg_link::{LinkError, MacAddr, NetInterface};
use ethmsg_wire::max_send_size_for_mtu;
use serde::Serialize;
use tracing::info;

use crate::error::{CoreError, Result};

/// Snapshot of one interface as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: String,
    pub mtu: usize,
    /// `None` when the MTU is too small to carry messages.
    pub max_send_size: Option<usize>,
    pub rate_bps: Option<u64>,
    pub pci: Option<String>,
    pub loopback: bool,
    pub up: bool,
}

impl InterfaceInfo {
    pub fn of(iface: &NetInterface) -> Self {
        Self {
            name: iface.name().to_string(),
            mac: iface.mac().to_string(),
            mtu: iface.mtu(),
            max_send_size: max_send_size_for_mtu(iface.mtu()),
            rate_bps: iface.rate_bps(),
            pci: iface.pci().map(|pci| pci.to_string()),
            loopback: iface.is_loopback(),
            up: iface.is_up(),
        }
    }
}

/// Interfaces keyed by hardware address.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    interfaces: RwLock<BTreeMap<MacAddr, Arc<NetInterface>>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<MacAddr, Arc<NetInterface>>> {
        self.interfaces.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<MacAddr, Arc<NetInterface>>> {
        self.interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an interface. Two interfaces may not share an address.
    pub fn add(&self, iface: Arc<NetInterface>) -> Result<()> {
        let mac = iface.mac();
        let mut interfaces = self.write();
        if interfaces.contains_key(&mac) {
            return Err(LinkError::AddressInUse(mac).into());
        }
        info!(name = iface.name(), %mac, mtu = iface.mtu(), "interface added");
        interfaces.insert(mac, iface);
        Ok(())
    }

    pub fn remove(&self, mac: MacAddr) -> Result<Arc<NetInterface>> {
        let iface = self
            .write()
            .remove(&mac)
            .ok_or(CoreError::NoSuchDevice(mac))?;
        info!(name = iface.name(), %mac, "interface removed");
        Ok(iface)
    }

    pub fn get(&self, mac: MacAddr) -> Option<Arc<NetInterface>> {
        self.read().get(&mac).cloned()
    }

    /// All interfaces, ordered by address.
    pub fn list(&self) -> Vec<Arc<NetInterface>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Interface endpoints bind to when the client names none: a loopback
    /// interface if `allow_loopback`, otherwise the fastest physical one.
    /// Interfaces that are down or whose MTU cannot carry messages are skipped.
    pub fn default_interface(&self, allow_loopback: bool) -> Option<Arc<NetInterface>> {
        let interfaces = self.read();
        let usable = || {
            interfaces
                .values()
                .filter(|iface| iface.is_up() && max_send_size_for_mtu(iface.mtu()).is_some())
        };
        if allow_loopback {
            if let Some(lo) = usable().find(|iface| iface.is_loopback()) {
                return Some(Arc::clone(lo));
            }
        }
        usable()
            .filter(|iface| !iface.is_loopback())
            .fold(None::<&Arc<NetInterface>>, |best, iface| match best {
                Some(b) if b.rate_bps().unwrap_or(0) >= iface.rate_bps().unwrap_or(0) => Some(b),
                _ => Some(iface),
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethmsg_link::{Link, LoopbackFabric};

    fn iface(fabric: &LoopbackFabric, last: u8, mtu: usize) -> Arc<NetInterface> {
        let mac = MacAddr::new([2, 0, 0, 0, 0, last]);
        let link: Arc<dyn Link> = Arc::new(fabric.attach(mac, mtu).unwrap());
        Arc::new(NetInterface::new(format!("veth{last}"), link))
    }

    #[test]
    fn add_rejects_duplicate_address() {
        let fabric = LoopbackFabric::new();
        let registry = InterfaceRegistry::new();
        let first = iface(&fabric, 1, 1500);
        registry.add(Arc::clone(&first)).unwrap();
        assert!(matches!(
            registry.add(first),
            Err(CoreError::Link(LinkError::AddressInUse(_)))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_unknown_is_no_device() {
        let registry = InterfaceRegistry::new();
        let mac = MacAddr::new([2, 0, 0, 0, 0, 9]);
        assert!(matches!(registry.remove(mac), Err(CoreError::NoSuchDevice(m)) if m == mac));
    }

    #[test]
    fn default_skips_loopback_down_and_tiny_mtu() {
        let fabric = LoopbackFabric::new();
        let registry = InterfaceRegistry::new();

        let lo_link: Arc<dyn Link> =
            Arc::new(fabric.attach(MacAddr::new([2, 0, 0, 0, 0, 1]), 1500).unwrap());
        let lo = Arc::new(NetInterface::new("lo", lo_link).with_loopback(true));
        let tiny = iface(&fabric, 2, 80);
        let down = iface(&fabric, 3, 1500);
        down.set_up(false);
        let good = iface(&fabric, 4, 9000);
        let fast_link: Arc<dyn Link> =
            Arc::new(fabric.attach(MacAddr::new([2, 0, 0, 0, 0, 7]), 1500).unwrap());
        let fast = Arc::new(NetInterface::new("fast", fast_link).with_rate(100_000_000_000));
        for i in [&lo, &tiny, &down, &good, &fast] {
            registry.add(Arc::clone(i)).unwrap();
        }

        assert_eq!(registry.default_interface(false).unwrap().mac(), fast.mac());
        assert_eq!(registry.default_interface(true).unwrap().mac(), lo.mac());

        registry.remove(fast.mac()).unwrap();
        assert_eq!(registry.default_interface(false).unwrap().mac(), good.mac());
        registry.remove(good.mac()).unwrap();
        assert!(registry.default_interface(false).is_none());
    }

    #[test]
    fn info_reports_max_send() {
        let fabric = LoopbackFabric::new();
        let info = InterfaceInfo::of(&iface(&fabric, 5, 9000));
        assert_eq!(info.max_send_size, Some(8192));
        assert_eq!(info.mac, "02:00:00:00:00:05");
        let tiny = InterfaceInfo::of(&iface(&fabric, 6, 64));
        assert_eq!(tiny.max_send_size, None);
    }
}
