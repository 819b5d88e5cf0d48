//! RMA region registration.
//!
//! A region pins every page behind a client buffer for as long as it is
//! registered. Registration publishes the region id only after every page
//! is pinned; a failure part way releases the pins already taken and
//! withdraws the id, so a partial region is never visible.

use std::fmt;
use std::sync::Arc;

use ethmsg_wire::RmaOp;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::handle::HandleTable;
use crate::pin::{page_span, MemoryPinner, PinnedPage};

/// Pages per chunk once a region is large enough to be chunked.
const PAGE_CHUNK: usize = 1024;

/// Remote access allowed on a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

impl Protection {
    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite)
    }

    /// Control-plane encoding: bit 0 set means writable.
    pub fn from_flags(flags: u32) -> Self {
        if flags & 1 != 0 {
            Protection::ReadWrite
        } else {
            Protection::ReadOnly
        }
    }

    pub fn flags(self) -> u32 {
        u32::from(self.is_writable())
    }
}

/// Page list of a region. Large regions are split into fixed-size chunks
/// so registering them never needs one huge contiguous allocation.
enum PageArray {
    Contiguous(Vec<PinnedPage>),
    Chunked(Vec<Vec<PinnedPage>>),
}

impl PageArray {
    fn with_capacity(count: usize, threshold: usize) -> Self {
        if count > threshold {
            PageArray::Chunked(Vec::with_capacity(count.div_ceil(PAGE_CHUNK)))
        } else {
            PageArray::Contiguous(Vec::with_capacity(count))
        }
    }

    fn push(&mut self, page: PinnedPage) {
        match self {
            PageArray::Contiguous(pages) => pages.push(page),
            PageArray::Chunked(chunks) => match chunks.last_mut() {
                Some(chunk) if chunk.len() < PAGE_CHUNK => chunk.push(page),
                _ => {
                    let mut chunk = Vec::with_capacity(PAGE_CHUNK);
                    chunk.push(page);
                    chunks.push(chunk);
                }
            },
        }
    }

    fn chunks(&self) -> &[Vec<PinnedPage>] {
        match self {
            PageArray::Contiguous(pages) => std::slice::from_ref(pages),
            PageArray::Chunked(chunks) => chunks,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &PinnedPage> + '_ {
        self.chunks().iter().flatten()
    }

    fn len(&self) -> usize {
        self.chunks().iter().map(Vec::len).sum()
    }

    fn get(&self, index: usize) -> Option<&PinnedPage> {
        match self {
            PageArray::Contiguous(pages) => pages.get(index),
            PageArray::Chunked(chunks) => chunks.get(index / PAGE_CHUNK)?.get(index % PAGE_CHUNK),
        }
    }

    fn release(&self, pinner: &dyn MemoryPinner, dirty: bool) {
        for page in self.iter() {
            pinner.unpin_page(*page, dirty);
        }
    }
}

/// A registered memory range with every backing page pinned.
///
/// Pins are released when the last reference is dropped.
pub struct RmaRegion {
    id: u32,
    address: usize,
    length: usize,
    protection: Protection,
    first_page_offset: usize,
    pages: PageArray,
    pinner: Arc<dyn MemoryPinner>,
}

impl RmaRegion {
    fn pin(
        id: u32,
        address: usize,
        length: usize,
        protection: Protection,
        pinner: Arc<dyn MemoryPinner>,
        large_threshold: usize,
    ) -> Result<Self> {
        if length == 0 {
            return Err(CoreError::invalid_argument("RMA region length is zero"));
        }
        let page_size = pinner.page_size();
        let (first_page, first_page_offset, count) = page_span(address, length, page_size)
            .ok_or(CoreError::InvalidMemory { address, length })?;

        let writable = protection.is_writable();
        let mut pages = PageArray::with_capacity(count, large_threshold);
        for index in 0..count {
            let page_addr = first_page + index * page_size;
            match pinner.pin_page(page_addr, writable) {
                Ok(page) => pages.push(page),
                Err(err) => {
                    debug!(
                        address = format_args!("0x{address:x}"),
                        length,
                        page = format_args!("0x{page_addr:x}"),
                        error = %err,
                        "page pin failed, releasing partial region"
                    );
                    pages.release(pinner.as_ref(), false);
                    return Err(CoreError::InvalidMemory { address, length });
                }
            }
        }

        Ok(Self {
            id,
            address,
            length,
            protection,
            first_page_offset,
            pages,
            pinner,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Offset of `address` into the first pinned page.
    pub fn first_page_offset(&self) -> usize {
        self.first_page_offset
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Page-aligned address of the `index`th pinned page.
    pub fn page_addr(&self, index: usize) -> Option<usize> {
        self.pages.get(index).map(PinnedPage::addr)
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.pages, PageArray::Chunked(_))
    }

    /// Check that a remote `op` on `[offset, offset + len)` stays inside the
    /// region and respects its protection.
    pub fn check_access(&self, op: RmaOp, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .filter(|end| *end <= self.length as u64);
        if end.is_none() {
            return Err(CoreError::invalid_argument(format!(
                "RMA access {offset}+{len} outside region {} of {} bytes",
                self.id, self.length
            )));
        }
        if op == RmaOp::Write && !self.protection.is_writable() {
            return Err(CoreError::invalid_state(format!(
                "RMA region {} is read-only",
                self.id
            )));
        }
        Ok(())
    }
}

impl Drop for RmaRegion {
    fn drop(&mut self) {
        self.pages
            .release(self.pinner.as_ref(), self.protection.is_writable());
    }
}

impl fmt::Debug for RmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RmaRegion")
            .field("id", &self.id)
            .field("address", &format_args!("0x{:x}", self.address))
            .field("length", &self.length)
            .field("protection", &self.protection)
            .field("pages", &self.pages.len())
            .field("chunked", &self.is_chunked())
            .finish()
    }
}

/// Per-endpoint table of registered regions.
pub struct RegionTable {
    regions: HandleTable<Arc<RmaRegion>>,
    pinner: Arc<dyn MemoryPinner>,
    large_threshold: usize,
}

impl RegionTable {
    pub fn new(pinner: Arc<dyn MemoryPinner>, capacity: usize, large_threshold: usize) -> Self {
        Self {
            regions: HandleTable::new("RMA region table", capacity),
            pinner,
            large_threshold,
        }
    }

    /// Pin `[address, address + length)` and return the new region id.
    pub fn register(&self, address: usize, length: usize, protection: Protection) -> Result<u32> {
        let reservation = self.regions.reserve()?;
        let region = RmaRegion::pin(
            reservation.id(),
            address,
            length,
            protection,
            Arc::clone(&self.pinner),
            self.large_threshold,
        )?;
        let pages = region.page_count();
        // A table closed while pinning drops the region here, unpinning it.
        let id = reservation.publish(Arc::new(region))?;
        info!(
            region = id,
            address = format_args!("0x{address:x}"),
            length,
            pages,
            ?protection,
            "registered RMA region"
        );
        Ok(id)
    }

    /// Unregister a region. The id stops resolving before any page is unpinned.
    pub fn deregister(&self, id: u32) -> Result<()> {
        let region = self.regions.remove(id).ok_or(CoreError::RegionNotFound(id))?;
        debug!(region = id, pages = region.page_count(), "deregistered RMA region");
        drop(region);
        Ok(())
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<RmaRegion>> {
        self.regions.lookup(id)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Deregister every region and refuse new ones. Returns how many were released.
    pub fn close(&self) -> usize {
        let drained = self.regions.close();
        let count = drained.len();
        drop(drained);
        count
    }
}

impl fmt::Debug for RegionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionTable")
            .field("regions", &self.regions.len())
            .field("pinner", &self.pinner.name())
            .finish()
    }
}
