use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{LinkError, Result};
use crate::mac::MacAddr;
use crate::traits::{Link, ETH_HEADER_LEN};

/// Default number of frames a port buffers before it starts dropping.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 4096;

/// In-process Ethernet switch.
///
/// Links attach with a hardware address. Transmitted frames are copied into
/// the destination port's mailbox (every other port for broadcast). Frames
/// for addresses nobody attached are dropped, as on a real wire.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    ports: Mutex<HashMap<MacAddr, Arc<Port>>>,
    mailbox_capacity: usize,
}

struct Port {
    mailbox: Mutex<VecDeque<Bytes>>,
    dropped: AtomicU64,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::with_mailbox_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    /// Create a fabric whose ports buffer at most `capacity` frames each.
    pub fn with_mailbox_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                ports: Mutex::new(HashMap::new()),
                mailbox_capacity: capacity.max(1),
            }),
        }
    }

    /// Attach a new port. Fails if `mac` is already attached.
    pub fn attach(&self, mac: MacAddr, mtu: usize) -> Result<LoopbackLink> {
        let port = Arc::new(Port {
            mailbox: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        });

        {
            let mut ports = self.inner.lock_ports();
            if ports.contains_key(&mac) {
                return Err(LinkError::AddressInUse(mac));
            }
            ports.insert(mac, Arc::clone(&port));
        }

        debug!(%mac, mtu, "attached loopback port");
        Ok(LoopbackLink {
            mac,
            mtu,
            port,
            fabric: Arc::clone(&self.inner),
            sent: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        })
    }

    /// Number of attached ports.
    pub fn port_count(&self) -> usize {
        self.inner.lock_ports().len()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackFabric")
            .field("ports", &self.port_count())
            .finish()
    }
}

impl FabricInner {
    fn lock_ports(&self) -> MutexGuard<'_, HashMap<MacAddr, Arc<Port>>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn targets(&self, src: MacAddr, dst: MacAddr) -> Vec<Arc<Port>> {
        let ports = self.lock_ports();
        if dst.is_broadcast() {
            ports
                .iter()
                .filter(|(mac, _)| **mac != src)
                .map(|(_, port)| Arc::clone(port))
                .collect()
        } else {
            ports.get(&dst).map(Arc::clone).into_iter().collect()
        }
    }
}

impl Port {
    fn deliver(&self, frame: Bytes, capacity: usize) {
        let mut mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        if mailbox.len() >= capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        mailbox.push_back(frame);
    }

    fn take(&self) -> Option<Bytes> {
        self.mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// One port on a [`LoopbackFabric`]. Detaches on drop.
pub struct LoopbackLink {
    mac: MacAddr,
    mtu: usize,
    port: Arc<Port>,
    fabric: Arc<FabricInner>,
    sent: AtomicU64,
    detached: AtomicBool,
}

impl LoopbackLink {
    /// Frames accepted by `transmit` so far.
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames dropped at this port because its mailbox was full.
    pub fn frames_dropped(&self) -> u64 {
        self.port.dropped.load(Ordering::Relaxed)
    }

    /// Frames waiting in this port's mailbox.
    pub fn pending(&self) -> usize {
        self.port
            .mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Remove this port from the fabric. Later transmits fail with `Down`.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut ports = self.fabric.lock_ports();
        if ports
            .get(&self.mac)
            .is_some_and(|port| Arc::ptr_eq(port, &self.port))
        {
            ports.remove(&self.mac);
        }
        debug!(mac = %self.mac, "detached loopback port");
    }
}

impl Link for LoopbackLink {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn transmit(&self, frame: &[u8]) -> Result<()> {
        if self.detached.load(Ordering::Acquire) {
            return Err(LinkError::Down);
        }
        if frame.len() < ETH_HEADER_LEN {
            return Err(LinkError::FrameTooShort(frame.len()));
        }
        if frame.len() > self.max_frame_len() {
            return Err(LinkError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_len(),
            });
        }

        let dst = MacAddr::from_slice(&frame[..MacAddr::LEN]).unwrap_or_default();
        let targets = self.fabric.targets(self.mac, dst);
        if targets.is_empty() {
            trace!(src = %self.mac, %dst, "no port for destination, frame dropped");
        }

        let frame = Bytes::copy_from_slice(frame);
        for port in targets {
            port.deliver(frame.clone(), self.fabric.mailbox_capacity);
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<Bytes>> {
        Ok(self.port.take())
    }

    fn link_name(&self) -> &'static str {
        "loopback"
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLink")
            .field("mac", &self.mac)
            .field("mtu", &self.mtu)
            .field("sent", &self.frames_sent())
            .finish()
    }
}
