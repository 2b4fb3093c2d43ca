//! Open-addressing table of tracked allocations.
//!
//! Linear probing with Robin-Hood displacement on insert and backward-shift
//! deletion, so there are no tombstones and a lookup can stop as soon as its
//! probe distance exceeds the displacement of the record it is looking at.

use crate::record::Record;
use crate::{policy, GcError};

#[inline]
fn hash(address: usize) -> usize {
    address.wrapping_mul(13) ^ (address >> 15)
}

/// Distance from `origin` to `index`, wrapping around the end of the table.
#[inline]
fn displacement(capacity: usize, index: usize, origin: usize) -> usize {
    if index >= origin {
        index - origin
    } else {
        capacity - origin + index
    }
}

pub(crate) struct Registry {
    slots: Vec<Option<Record>>,
    len: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn has_free_slot(&self) -> bool {
        self.len < self.capacity()
    }

    #[inline]
    fn origin(&self, address: usize) -> usize {
        hash(address) % self.capacity()
    }

    /// Slot index holding `address`, if it is tracked.
    pub fn find(&self, address: usize) -> Option<usize> {
        if self.len == 0 {
            return None;
        }

        let capacity = self.capacity();
        let mut index = self.origin(address);
        let mut distance = 0;

        loop {
            let record = self.slots[index].as_ref()?;

            if distance > displacement(capacity, index, record.origin) {
                return None;
            }

            if record.address == address {
                return Some(index);
            }

            index = (index + 1) % capacity;
            distance += 1;
        }
    }

    #[inline]
    pub fn get(&self, address: usize) -> Option<&Record> {
        let index = self.find(address)?;
        self.slots[index].as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, address: usize) -> Option<&mut Record> {
        let index = self.find(address)?;
        self.slots[index].as_mut()
    }

    #[inline]
    pub fn slot(&self, index: usize) -> Option<&Record> {
        self.slots[index].as_ref()
    }

    #[inline]
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.slots[index].as_mut()
    }

    /// Adds `record` to the table. Returns `false`, leaving the table as it
    /// was, when the address is already tracked.
    ///
    /// The caller must make sure a free slot exists.
    pub fn insert(&mut self, record: Record) -> bool {
        if self.find(record.address).is_some() {
            return false;
        }

        debug_assert!(self.has_free_slot(), "insert into a full registry");

        self.place(record);
        self.len += 1;
        true
    }

    fn place(&mut self, mut record: Record) {
        let capacity = self.capacity();
        let mut index = self.origin(record.address);
        let mut distance = 0;

        record.origin = index;

        loop {
            let slot = &mut self.slots[index];
            let occupant = match slot {
                None => {
                    *slot = Some(record);
                    return;
                },
                Some(occupant) => occupant,
            };

            // Rich record, poor candidate: the candidate takes the slot and
            // the occupant continues probing from here.
            let occupant_distance = displacement(capacity, index, occupant.origin);
            if occupant_distance < distance {
                std::mem::swap(occupant, &mut record);
                distance = occupant_distance;
            }

            index = (index + 1) % capacity;
            distance += 1;
        }
    }

    pub fn remove(&mut self, address: usize) -> Option<Record> {
        let index = self.find(address)?;
        self.remove_at(index)
    }

    /// Empties slot `index`, pulling the rest of its probe cluster back by one.
    pub fn remove_at(&mut self, index: usize) -> Option<Record> {
        let removed = self.slots[index].take()?;
        let capacity = self.capacity();
        let mut hole = index;

        loop {
            let next = (hole + 1) % capacity;
            let displaced = matches!(
                &self.slots[next],
                Some(record) if displacement(capacity, next, record.origin) > 0
            );
            if !displaced {
                break;
            }

            self.slots[hole] = self.slots[next].take();
            hole = next;
        }

        self.len -= 1;
        Some(removed)
    }

    /// Moves every record into a fresh table of `capacity` slots. On failure
    /// the current table is kept as is.
    pub fn rehash(&mut self, capacity: usize) -> Result<(), GcError> {
        debug_assert!(capacity > self.len);

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| GcError::RegistryAlloc { capacity })?;
        slots.resize(capacity, None);

        log::debug!("registry rehash {} -> {} slots ({} items)", self.capacity(), capacity, self.len);

        let old = std::mem::replace(&mut self.slots, slots);
        for record in old.into_iter().flatten() {
            self.place(record);
        }

        Ok(())
    }

    /// Resizes the table to the ideal capacity for `items` records.
    pub fn adjust(&mut self, items: usize, load_factor: f64) -> Result<(), GcError> {
        let capacity = policy::ideal_capacity(items, load_factor);
        if capacity != self.capacity() {
            self.rehash(capacity)?;
        }
        Ok(())
    }

    /// Drops the backing table. Records still in it are forgotten.
    pub fn release_storage(&mut self) {
        self.slots = Vec::new();
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.slots.iter().flatten()
    }

    pub fn clear_marks(&mut self) {
        for record in self.slots.iter_mut().flatten() {
            record.flags.remove(crate::Flags::MARK);
        }
    }

    #[cfg(test)]
    pub fn max_displacement(&self) -> usize {
        let capacity = self.capacity();
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|r| displacement(capacity, index, r.origin)))
            .max()
            .unwrap_or(0)
    }
}
