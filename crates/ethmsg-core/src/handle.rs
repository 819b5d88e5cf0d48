//! Generation-tagged integer handles for endpoints, connections, and RMA regions.
//!
//! A handle packs a slot index into its low 16 bits and the slot's generation
//! into the high 16 bits. Indexes are reused lowest-first after removal so
//! tables stay compact, but every reuse bumps the generation: a handle held
//! past its object's removal (inside a queued event, say) never resolves to
//! a later object. A slot whose generations run out is retired for good.
//!
//! An id is reserved before its object exists and only becomes visible to
//! [`HandleTable::lookup`] once the finished object is published. Closing a
//! table refuses new reservations and turns late publishes into errors.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{CoreError, Result};

const INDEX_BITS: u32 = 16;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Most slots a single table can hold.
pub const MAX_SLOTS: usize = 1 << INDEX_BITS;

/// Last generation a slot may carry. Keeps every handle below `u32::MAX`.
const LAST_GENERATION: u16 = u16::MAX - 1;

fn handle(index: usize, generation: u16) -> u32 {
    (u32::from(generation) << INDEX_BITS) | index as u32
}

/// Slot index a handle refers to.
pub fn slot_index(id: u32) -> usize {
    (id & INDEX_MASK) as usize
}

fn generation_of(id: u32) -> u16 {
    (id >> INDEX_BITS) as u16
}

enum Slot<T> {
    Vacant,
    Reserved,
    Occupied(T),
}

struct Entry<T> {
    generation: u16,
    slot: Slot<T>,
}

struct Slots<T> {
    entries: Vec<Entry<T>>,
    free: BTreeSet<usize>,
    occupied: usize,
    closed: bool,
}

impl<T> Slots<T> {
    fn claim(&mut self, capacity: usize) -> Option<usize> {
        if let Some(index) = self.free.pop_first() {
            return Some(index);
        }
        if self.entries.len() >= capacity {
            return None;
        }
        self.entries.push(Entry {
            generation: 0,
            slot: Slot::Vacant,
        });
        Some(self.entries.len() - 1)
    }

    /// Entry for `id`, only while its generation is current.
    fn current(&self, id: u32) -> Option<&Entry<T>> {
        self.entries
            .get(slot_index(id))
            .filter(|entry| entry.generation == generation_of(id))
    }

    /// Empty the slot and move it to its next generation.
    fn release(&mut self, index: usize) -> Slot<T> {
        let entry = &mut self.entries[index];
        let previous = std::mem::replace(&mut entry.slot, Slot::Vacant);
        if entry.generation < LAST_GENERATION {
            entry.generation += 1;
            self.free.insert(index);
        }
        previous
    }
}

/// Concurrent id → object table with reserve-then-publish allocation.
pub struct HandleTable<T> {
    name: &'static str,
    capacity: usize,
    slots: Mutex<Slots<T>>,
}

impl<T: Clone> HandleTable<T> {
    /// Create an empty table holding at most `capacity` objects (capped at
    /// [`MAX_SLOTS`]). `name` appears in error messages.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.min(MAX_SLOTS),
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: BTreeSet::new(),
                occupied: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> CoreError {
        CoreError::invalid_state(format!("{} is closed", self.name))
    }

    fn claim(&self, slots: &mut Slots<T>) -> Result<usize> {
        if slots.closed {
            return Err(self.closed_error());
        }
        slots
            .claim(self.capacity)
            .ok_or(CoreError::ResourceExhausted(self.name))
    }

    /// Reserve an id. Lookups miss it until [`Reservation::publish`];
    /// dropping the reservation unpublished withdraws it.
    pub fn reserve(&self) -> Result<Reservation<'_, T>> {
        let mut slots = self.lock();
        let index = self.claim(&mut slots)?;
        let entry = &mut slots.entries[index];
        entry.slot = Slot::Reserved;
        Ok(Reservation {
            table: self,
            id: handle(index, entry.generation),
            published: false,
        })
    }

    /// Allocate an id for an already finished object.
    pub fn allocate(&self, value: T) -> Result<u32> {
        let mut slots = self.lock();
        let index = self.claim(&mut slots)?;
        let entry = &mut slots.entries[index];
        entry.slot = Slot::Occupied(value);
        let id = handle(index, entry.generation);
        slots.occupied += 1;
        Ok(id)
    }

    pub fn lookup(&self, id: u32) -> Option<T> {
        match self.lock().current(id) {
            Some(Entry {
                slot: Slot::Occupied(value),
                ..
            }) => Some(value.clone()),
            _ => None,
        }
    }

    /// Remove a published object. `None` for unknown, stale, reserved, or
    /// already removed ids.
    pub fn remove(&self, id: u32) -> Option<T> {
        self.remove_if(id, |_| true)
    }

    /// Remove a published object only if `pred` accepts it.
    pub fn remove_if(&self, id: u32, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut slots = self.lock();
        let accepted = match slots.current(id) {
            Some(Entry {
                slot: Slot::Occupied(value),
                ..
            }) => pred(value),
            _ => false,
        };
        if !accepted {
            return None;
        }
        slots.occupied -= 1;
        match slots.release(slot_index(id)) {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Close the table and remove every published object. Later
    /// reservations fail, and outstanding ones can no longer be published.
    pub fn close(&self) -> Vec<(u32, T)> {
        let mut slots = self.lock();
        slots.closed = true;
        let mut out = Vec::with_capacity(slots.occupied);
        for index in 0..slots.entries.len() {
            if !matches!(slots.entries[index].slot, Slot::Occupied(_)) {
                continue;
            }
            let id = handle(index, slots.entries[index].generation);
            if let Slot::Occupied(value) = slots.release(index) {
                out.push((id, value));
            }
        }
        slots.occupied = 0;
        out
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Snapshot of every published object.
    pub fn values(&self) -> Vec<(u32, T)> {
        self.lock()
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match &entry.slot {
                Slot::Occupied(value) => Some((handle(index, entry.generation), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of published objects.
    pub fn len(&self) -> usize {
        self.lock().occupied
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hands `value` back if the table closed after the reservation was made.
    fn publish(&self, id: u32, value: T) -> std::result::Result<(), T> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(value);
        }
        slots.entries[slot_index(id)].slot = Slot::Occupied(value);
        slots.occupied += 1;
        Ok(())
    }

    fn withdraw(&self, id: u32) {
        let mut slots = self.lock();
        if matches!(
            slots.current(id),
            Some(Entry {
                slot: Slot::Reserved,
                ..
            })
        ) {
            slots.release(slot_index(id));
        }
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HandleTable")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("occupied", &slots.occupied)
            .field("free", &slots.free.len())
            .field("closed", &slots.closed)
            .finish()
    }
}

/// A reserved id that is not yet visible to lookups.
#[must_use = "a reservation is withdrawn when dropped"]
pub struct Reservation<'a, T: Clone> {
    table: &'a HandleTable<T>,
    id: u32,
    published: bool,
}

impl<T: Clone> Reservation<'_, T> {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Make `value` visible under the reserved id. If the table was closed
    /// in the meantime, `value` is dropped and the id withdrawn.
    pub fn publish(mut self, value: T) -> Result<u32> {
        match self.table.publish(self.id, value) {
            Ok(()) => {
                self.published = true;
                Ok(self.id)
            }
            Err(value) => {
                drop(value);
                Err(self.table.closed_error())
            }
        }
    }
}

impl<T: Clone> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.published {
            self.table.withdraw(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    #[test]
    fn slots_are_dense_and_reused_lowest_first() {
        let table = HandleTable::new("test table", 16);
        assert_eq!(table.allocate("a").unwrap(), 0);
        assert_eq!(table.allocate("b").unwrap(), 1);
        assert_eq!(table.allocate("c").unwrap(), 2);

        assert_eq!(table.remove(2), Some("c"));
        assert_eq!(table.remove(0), Some("a"));
        let d = table.allocate("d").unwrap();
        let e = table.allocate("e").unwrap();
        assert_eq!(slot_index(d), 0);
        assert_eq!(slot_index(e), 2);
        assert_ne!(d, 0);
        assert_ne!(e, 2);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn stale_handle_never_reaches_the_next_occupant() {
        let table = HandleTable::new("test table", 1);
        let old = table.allocate("first").unwrap();
        assert_eq!(table.remove(old), Some("first"));

        let new = table.allocate("second").unwrap();
        assert_eq!(slot_index(new), slot_index(old));
        assert_eq!(table.lookup(old), None);
        assert_eq!(table.remove(old), None);
        assert_eq!(table.remove_if(old, |_| true), None);
        assert_eq!(table.lookup(new), Some("second"));
    }

    #[test]
    fn exhausted_generations_retire_the_slot() {
        let table = HandleTable::new("test table", 1);
        let mut ids = HashSet::new();
        loop {
            match table.allocate(()) {
                Ok(id) => {
                    assert_ne!(id, u32::MAX);
                    assert!(ids.insert(id), "id {id:#x} handed out twice");
                    table.remove(id);
                }
                Err(err) => {
                    assert!(matches!(err, CoreError::ResourceExhausted("test table")));
                    break;
                }
            }
        }
        assert_eq!(ids.len(), usize::from(LAST_GENERATION) + 1);
    }

    #[test]
    fn capacity_is_capped() {
        let table = HandleTable::<u8>::new("test table", usize::MAX);
        assert_eq!(table.capacity(), MAX_SLOTS);
    }

    #[test]
    fn exhaustion_is_reported() {
        let table = HandleTable::new("tiny table", 2);
        table.allocate(1).unwrap();
        let _held = table.reserve().unwrap();
        assert!(matches!(
            table.allocate(3),
            Err(CoreError::ResourceExhausted("tiny table"))
        ));
    }

    #[test]
    fn reserved_id_is_invisible_until_published() {
        let table = HandleTable::new("test table", 4);
        let reservation = table.reserve().unwrap();
        let id = reservation.id();
        assert_eq!(table.lookup(id), None);
        assert_eq!(table.remove(id), None);
        assert_eq!(table.len(), 0);

        assert_eq!(reservation.publish("ready").unwrap(), id);
        assert_eq!(table.lookup(id), Some("ready"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn dropped_reservation_is_withdrawn() {
        let table = HandleTable::<u8>::new("test table", 1);
        let withdrawn = {
            let r = table.reserve().unwrap();
            assert_eq!(r.id(), 0);
            r.id()
        };
        let id = table.allocate(9).unwrap();
        assert_eq!(slot_index(id), 0);
        assert_ne!(id, withdrawn);
    }

    #[test]
    fn double_remove_is_harmless() {
        let table = HandleTable::new("test table", 4);
        let id = table.allocate(5).unwrap();
        assert_eq!(table.remove(id), Some(5));
        assert_eq!(table.remove(id), None);
        assert_eq!(table.remove(99), None);
        assert_eq!(slot_index(table.allocate(6).unwrap()), slot_index(id));
        assert_eq!(table.allocate(7).unwrap(), 1);
    }

    #[test]
    fn remove_if_respects_predicate() {
        let table = HandleTable::new("test table", 4);
        let id = table.allocate(10).unwrap();
        assert_eq!(table.remove_if(id, |v| *v > 10), None);
        assert_eq!(table.remove_if(id, |v| *v == 10), Some(10));
    }

    #[test]
    fn closed_table_refuses_new_objects() {
        let table = HandleTable::new("test table", 8);
        table.allocate("a").unwrap();
        table.allocate("b").unwrap();
        let pending = table.reserve().unwrap();
        let pending_id = pending.id();

        let drained = table.close();
        assert_eq!(drained, vec![(0, "a"), (1, "b")]);
        assert!(table.is_empty());
        assert!(table.is_closed());

        assert!(matches!(pending.publish("c"), Err(CoreError::InvalidState(_))));
        assert_eq!(table.lookup(pending_id), None);
        assert!(matches!(table.reserve(), Err(CoreError::InvalidState(_))));
        assert!(matches!(table.allocate("d"), Err(CoreError::InvalidState(_))));
        assert!(table.is_empty());
    }

    #[test]
    fn late_publish_drops_the_value() {
        let table = HandleTable::new("test table", 8);
        let value = Arc::new(());
        let pending = table.reserve().unwrap();
        table.close();
        assert!(pending.publish(Arc::clone(&value)).is_err());
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn close_racing_publishers_leaves_nothing_behind() {
        let table = Arc::new(HandleTable::new("test table", 10_000));
        let value = Arc::new(());
        let start = Arc::new(Barrier::new(5));
        let publishers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let value = Arc::clone(&value);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    for _ in 0..500 {
                        let Ok(reservation) = table.reserve() else {
                            break;
                        };
                        if reservation.publish(Arc::clone(&value)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        start.wait();
        drop(table.close());
        for publisher in publishers {
            publisher.join().unwrap();
        }
        assert!(table.is_empty());
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let table = Arc::new(HandleTable::new("test table", 10_000));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..200 {
                        let r = table.reserve().unwrap();
                        let id = r.id();
                        assert_eq!(table.lookup(id), None);
                        r.publish((t, i)).unwrap();
                        mine.push(id);
                        if i % 3 == 0 {
                            assert_eq!(table.remove(id), Some((t, i)));
                            mine.pop();
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in threads {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), table.len());
    }
}
