//! Generation-based, reference-counted object cache
//!
//! One generation is one complete population of the cache. Lookups and
//! inserts run against the active generation; a refresh builds its
//! replacement off to the side and swaps the active pointer atomically.
//! Handles checked out before the swap stay valid against their original
//! generation until released, so a refresh never invalidates a reader.

use crate::object::{ObjectRecord, ObjectType};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

struct Slot {
    address: u64,
    record: ObjectRecord,
    refs: AtomicU32,
}

struct Generation {
    id: u64,
    slots: RwLock<HashMap<u64, Arc<Slot>>>,
}

impl Generation {
    fn empty(id: u64) -> Self {
        Self {
            id,
            slots: RwLock::new(HashMap::new()),
        }
    }
}

/// Checkout token for one cache slot.
///
/// Holding a handle keeps the slot's refcount above zero and the record
/// alive across a concurrent refresh. Return it with [`ObjectHandle::release`]
/// or by dropping it; the protocol count is decremented either way.
pub struct ObjectHandle {
    slot: Arc<Slot>,
    generation: Arc<Generation>,
}

impl ObjectHandle {
    /// Wrap a slot whose initial reference the caller already owns.
    fn adopt(slot: Arc<Slot>, generation: Arc<Generation>) -> Self {
        Self { slot, generation }
    }

    /// Increment the slot refcount and wrap it.
    fn checkout(slot: Arc<Slot>, generation: Arc<Generation>) -> Self {
        slot.refs.fetch_add(1, Ordering::Relaxed);
        Self { slot, generation }
    }

    /// Virtual address this slot is keyed by.
    pub fn address(&self) -> u64 {
        self.slot.address
    }

    /// Generation the handle was checked out of.
    pub fn generation(&self) -> u64 {
        self.generation.id
    }

    /// Check another entry out of this handle's own generation, whether or
    /// not it is still the active one. A file handle resolves its shared
    /// section-pointers record through here so a concurrent refresh cannot
    /// swap the backing structure out from under an in-flight read.
    pub fn peer(&self, address: u64) -> Option<ObjectHandle> {
        let slots = self
            .generation
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(&address)?.clone();
        drop(slots);
        Some(ObjectHandle::checkout(slot, self.generation.clone()))
    }

    pub fn object_type(&self) -> ObjectType {
        self.slot.record.object_type()
    }

    pub fn record(&self) -> &ObjectRecord {
        &self.slot.record
    }

    /// Current protocol refcount of the slot.
    pub fn refcount(&self) -> u32 {
        self.slot.refs.load(Ordering::Acquire)
    }

    /// Explicitly return the handle. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        self.slot.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("address", &format_args!("{:#x}", self.slot.address))
            .field("generation", &self.generation.id)
            .field("refs", &self.refcount())
            .finish()
    }
}

/// Accumulates a new generation during a refresh.
pub struct GenerationBuilder {
    id: u64,
    slots: HashMap<u64, Arc<Slot>>,
}

impl GenerationBuilder {
    fn new(id: u64) -> Self {
        Self {
            id,
            slots: HashMap::new(),
        }
    }

    /// Generation id being built.
    pub fn generation(&self) -> u64 {
        self.id
    }

    /// Add a record. The first record for an address wins; a duplicate is
    /// dropped and reported as such.
    pub fn insert(&mut self, address: u64, record: ObjectRecord) -> bool {
        if self.slots.contains_key(&address) {
            return false;
        }
        self.slots.insert(
            address,
            Arc::new(Slot {
                address,
                record,
                refs: AtomicU32::new(0),
            }),
        );
        true
    }

    /// Look at a record already placed in this generation. Resolution
    /// memoization checks here before re-walking shared structures.
    pub fn get(&self, address: u64) -> Option<&ObjectRecord> {
        self.slots.get(&address).map(|s| &s.record)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.slots.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn finish(self) -> Generation {
        Generation {
            id: self.id,
            slots: RwLock::new(self.slots),
        }
    }
}

/// Iterates the generation that was active when the snapshot was taken,
/// checking out a transient handle per step.
pub struct Snapshot {
    slots: Vec<Arc<Slot>>,
    generation: Arc<Generation>,
    next: usize,
}

impl Snapshot {
    /// Generation this snapshot iterates.
    pub fn generation(&self) -> u64 {
        self.generation.id
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Iterator for Snapshot {
    type Item = ObjectHandle;

    fn next(&mut self) -> Option<ObjectHandle> {
        let slot = self.slots.get(self.next)?.clone();
        self.next += 1;
        Some(ObjectHandle::checkout(slot, self.generation.clone()))
    }
}

/// Reference-counted store keyed by virtual address.
pub struct ObjectCache {
    active: RwLock<Arc<Generation>>,
    generations: AtomicU64,
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectCache {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(Generation::empty(1))),
            generations: AtomicU64::new(1),
        }
    }

    fn active_generation(&self) -> Arc<Generation> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Id of the active generation.
    pub fn generation(&self) -> u64 {
        self.active_generation().id
    }

    /// Entries in the active generation.
    pub fn len(&self) -> usize {
        let generation = self.active_generation();
        let slots = generation
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of protocol refcounts across the active generation. Returns to
    /// baseline once every outstanding handle has been released.
    pub fn outstanding_refs(&self) -> u64 {
        let generation = self.active_generation();
        let slots = generation
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .map(|s| u64::from(s.refs.load(Ordering::Acquire)))
            .sum()
    }

    /// Insert into the active generation, get-or-insert. A fresh record
    /// comes back with refcount 1; an existing slot is checked out instead
    /// and the caller's record is dropped.
    pub fn insert(&self, address: u64, record: ObjectRecord) -> ObjectHandle {
        let generation = self.active_generation();
        let mut slots = generation
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slots.get(&address) {
            let existing = existing.clone();
            drop(slots);
            return ObjectHandle::checkout(existing, generation);
        }

        let slot = Arc::new(Slot {
            address,
            record,
            refs: AtomicU32::new(1),
        });
        slots.insert(address, slot.clone());
        drop(slots);
        ObjectHandle::adopt(slot, generation)
    }

    /// Check an entry out of the active generation.
    pub fn lookup(&self, address: u64) -> Option<ObjectHandle> {
        let generation = self.active_generation();
        let slots = generation
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(&address)?.clone();
        drop(slots);
        Some(ObjectHandle::checkout(slot, generation))
    }

    /// Iterable view of the active generation.
    pub fn snapshot(&self) -> Snapshot {
        let generation = self.active_generation();
        let slots = generation
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ordered: Vec<Arc<Slot>> = slots.values().cloned().collect();
        ordered.sort_by_key(|s| s.address);
        drop(slots);
        Snapshot {
            slots: ordered,
            generation,
            next: 0,
        }
    }

    /// Populate a brand-new generation and swap it in. If the builder
    /// fails the partial generation is discarded and the previous one
    /// stays active; the cache is untouched either way until the swap.
    pub fn refresh<F>(&self, populate: F) -> Result<u64>
    where
        F: FnOnce(&mut GenerationBuilder) -> Result<()>,
    {
        let id = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let mut builder = GenerationBuilder::new(id);
        populate(&mut builder)?;

        let fresh = Arc::new(builder.finish());
        let retired_id;
        {
            let mut active = self
                .active
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            retired_id = active.id;
            *active = fresh;
        }
        tracing::debug!(generation = id, retired = retired_id, "cache generation swapped");
        Ok(id)
    }
}
