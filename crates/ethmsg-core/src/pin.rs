//! Page pinning backends.
//!
//! A region holds one pin per page for as long as it is registered. Pins
//! are counted per page so that overlapping regions can share pages.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

/// Fallback when the platform does not report a page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// One pinned page, identified by its page-aligned address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinnedPage {
    addr: usize,
    writable: bool,
}

impl PinnedPage {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

/// Keeps pages resident while they are registered for remote access.
pub trait MemoryPinner: Send + Sync + fmt::Debug {
    fn page_size(&self) -> usize;

    /// Pin the page starting at the page-aligned `addr`, with write intent
    /// if `writable`. Fails if the page is not mapped with that access.
    fn pin_page(&self, addr: usize, writable: bool) -> io::Result<PinnedPage>;

    /// Release one pin. `dirty` marks the page as modified.
    fn unpin_page(&self, page: PinnedPage, dirty: bool);

    fn name(&self) -> &'static str;
}

/// Page range covering `[addr, addr + len)`: first page address, offset of
/// `addr` into it, and page count. `None` on overflow.
pub fn page_span(addr: usize, len: usize, page_size: usize) -> Option<(usize, usize, usize)> {
    let end = addr.checked_add(len)?;
    let first = addr & !(page_size - 1);
    let last_end = end.checked_add(page_size - 1)? & !(page_size - 1);
    Some((first, addr - first, (last_end - first) / page_size))
}

/// The pinner endpoints use unless one is supplied.
pub fn default_pinner() -> Arc<dyn MemoryPinner> {
    #[cfg(unix)]
    {
        Arc::new(LockedPages::new())
    }
    #[cfg(not(unix))]
    {
        Arc::new(TrackedMemory::new())
    }
}

/// Pins pages of this process with `mlock(2)`.
#[cfg(unix)]
pub struct LockedPages {
    page_size: usize,
    pins: Mutex<HashMap<usize, usize>>,
}

#[cfg(unix)]
impl LockedPages {
    pub fn new() -> Self {
        // SAFETY: sysconf has no memory-safety preconditions.
        let reported = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if reported > 0 {
            reported as usize
        } else {
            DEFAULT_PAGE_SIZE
        };
        Self {
            page_size,
            pins: Mutex::new(HashMap::new()),
        }
    }

    /// Number of distinct pages currently locked.
    pub fn locked_pages(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, usize>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(unix)]
impl Default for LockedPages {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl fmt::Debug for LockedPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedPages")
            .field("page_size", &self.page_size)
            .field("locked_pages", &self.locked_pages())
            .finish()
    }
}

#[cfg(unix)]
impl MemoryPinner for LockedPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn pin_page(&self, addr: usize, writable: bool) -> io::Result<PinnedPage> {
        let mut pins = self.lock();
        let count = pins.get(&addr).copied().unwrap_or(0);
        if count == 0 {
            // SAFETY: mlock only changes residency; an unmapped range fails with ENOMEM.
            let rc = unsafe { libc::mlock(addr as *const libc::c_void, self.page_size) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        pins.insert(addr, count + 1);
        Ok(PinnedPage { addr, writable })
    }

    fn unpin_page(&self, page: PinnedPage, dirty: bool) {
        let mut pins = self.lock();
        let Some(count) = pins.get_mut(&page.addr) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            pins.remove(&page.addr);
            // SAFETY: the page was locked by us in pin_page.
            unsafe { libc::munlock(page.addr as *const libc::c_void, self.page_size) };
        }
        trace!(addr = page.addr, dirty, "unpinned page");
    }

    fn name(&self) -> &'static str {
        "mlock"
    }
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    start: usize,
    len: usize,
    writable: bool,
}

#[derive(Debug, Default)]
struct TrackedState {
    mappings: Vec<Mapping>,
    pins: HashMap<usize, usize>,
    dirty: HashSet<usize>,
}

/// Pin accounting over explicitly declared mappings.
///
/// Nothing is locked in memory. Used on the loopback fabric, where the peer
/// is this process, and wherever pin counts need to be observed.
pub struct TrackedMemory {
    page_size: usize,
    state: Mutex<TrackedState>,
}

impl TrackedMemory {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// `page_size` is rounded up to a power of two.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1).next_power_of_two(),
            state: Mutex::new(TrackedState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare `[start, start + len)` as mapped.
    pub fn map(&self, start: usize, len: usize, writable: bool) {
        self.lock().mappings.push(Mapping {
            start,
            len,
            writable,
        });
    }

    /// Pins currently held on the page containing `addr`.
    pub fn pin_count(&self, addr: usize) -> usize {
        let page = addr & !(self.page_size - 1);
        self.lock().pins.get(&page).copied().unwrap_or(0)
    }

    /// Pins currently held across all pages.
    pub fn total_pins(&self) -> usize {
        self.lock().pins.values().sum()
    }

    /// Whether the page containing `addr` was ever released dirty.
    pub fn is_dirty(&self, addr: usize) -> bool {
        let page = addr & !(self.page_size - 1);
        self.lock().dirty.contains(&page)
    }
}

impl Default for TrackedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrackedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TrackedMemory")
            .field("page_size", &self.page_size)
            .field("mappings", &state.mappings.len())
            .field("pinned_pages", &state.pins.len())
            .finish()
    }
}

impl MemoryPinner for TrackedMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn pin_page(&self, addr: usize, writable: bool) -> io::Result<PinnedPage> {
        let mut state = self.lock();
        let mapping = state
            .mappings
            .iter()
            .find(|m| addr >= m.start && addr - m.start < m.len)
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("page 0x{addr:x} is not mapped"),
                )
            })?;
        if writable && !mapping.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("page 0x{addr:x} is read-only"),
            ));
        }
        *state.pins.entry(addr).or_insert(0) += 1;
        Ok(PinnedPage { addr, writable })
    }

    fn unpin_page(&self, page: PinnedPage, dirty: bool) {
        let mut state = self.lock();
        if let Some(count) = state.pins.get_mut(&page.addr) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&page.addr);
            }
            if dirty {
                state.dirty.insert(page.addr);
            }
        }
    }

    fn name(&self) -> &'static str {
        "tracked"
    }
}
