use bytes::Bytes;

use crate::error::Result;
use crate::mac::MacAddr;

/// Ethernet header: destination (6) + source (6) + EtherType (2).
pub const ETH_HEADER_LEN: usize = 14;

/// A link that carries whole Ethernet frames for one hardware address.
///
/// Frames passed to [`Link::transmit`] start with the Ethernet header.
/// Implementations must be usable from the control path and the receive
/// path at the same time.
pub trait Link: Send + Sync {
    /// Hardware address frames are sent from.
    fn mac(&self) -> MacAddr;

    /// Payload MTU (excludes the Ethernet header).
    fn mtu(&self) -> usize;

    /// Queue one frame for transmission. Never blocks on the peer.
    fn transmit(&self, frame: &[u8]) -> Result<()>;

    /// Take the next received frame, if any. Never blocks.
    fn try_receive(&self) -> Result<Option<Bytes>>;

    /// Link name for diagnostics.
    fn link_name(&self) -> &'static str;

    /// Largest frame this link accepts, header included.
    fn max_frame_len(&self) -> usize {
        self.mtu() + ETH_HEADER_LEN
    }
}

impl std::fmt::Debug for dyn Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("type", &self.link_name())
            .field("mac", &self.mac())
            .field("mtu", &self.mtu())
            .finish()
    }
}
