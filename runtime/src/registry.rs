//! Per-object, per-device state.
//!
//! Every registered object owns one [`DeviceDataRegistry`] with a slot per
//! device ordinal of its context. Slots start vacant and are filled lazily by a
//! factory the first time a device needs them. Removing a device tombstones its
//! slot; slots are never compacted, so ordinals stay stable for the lifetime of
//! the context.
//!
//! # Locking
//!
//! The slot vector sits behind an `RwLock` that is only held long enough to
//! clone a slot's `Arc`. Each slot has its own mutex, held across the factory
//! call, so concurrent first touches of the same slot run the factory once while
//! different slots never block each other. Never lock a slot while holding the
//! vector lock.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use snafu::ensure;

use crate::error::{DeviceDataMissingSnafu, DeviceRetiredSnafu, OutOfRangeSnafu, Result};
use crate::object::{ObjectId, ObjectKind};

#[derive(Debug)]
enum Slot<T> {
    Vacant,
    Live(Arc<T>),
    Retired,
}

#[derive(Debug)]
pub struct DeviceDataRegistry<T> {
    object: ObjectId,
    kind: ObjectKind,
    slots: RwLock<Vec<Arc<Mutex<Slot<T>>>>>,
}

impl<T> DeviceDataRegistry<T> {
    /// Registry with one slot per entry of `active`; inactive slots start tombstoned.
    pub fn new(object: ObjectId, kind: ObjectKind, active: &[bool]) -> Self {
        let slots = active
            .iter()
            .map(|active| Arc::new(Mutex::new(if *active { Slot::Vacant } else { Slot::Retired })))
            .collect();
        Self { object, kind, slots: RwLock::new(slots) }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    fn slot(&self, ordinal: usize) -> Result<Arc<Mutex<Slot<T>>>> {
        let slots = self.slots.read();
        ensure!(ordinal < slots.len(), OutOfRangeSnafu { what: "device", index: ordinal, count: slots.len() });
        Ok(Arc::clone(&slots[ordinal]))
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<Slot<T>>>> {
        self.slots.read().clone()
    }

    /// Existing state of `ordinal`.
    pub fn get(&self, ordinal: usize) -> Result<Arc<T>> {
        let slot = self.slot(ordinal)?;
        match &*slot.lock() {
            Slot::Live(state) => Ok(Arc::clone(state)),
            Slot::Vacant => DeviceDataMissingSnafu { object: self.object, ordinal }.fail(),
            Slot::Retired => DeviceRetiredSnafu { ordinal }.fail(),
        }
    }

    /// State of `ordinal`, created by `factory` if the slot is vacant.
    pub fn ensure(&self, ordinal: usize, factory: impl FnOnce() -> Result<T>) -> Result<Arc<T>> {
        self.ensure_fresh(ordinal, |_| true, factory)
    }

    /// Like [`DeviceDataRegistry::ensure`], but also replaces live state for
    /// which `is_fresh` returns false. The old state is dropped after the new
    /// one is in place. A failing factory leaves the slot as it was.
    pub fn ensure_fresh(
        &self,
        ordinal: usize,
        is_fresh: impl FnOnce(&T) -> bool,
        factory: impl FnOnce() -> Result<T>,
    ) -> Result<Arc<T>> {
        let slot = self.slot(ordinal)?;
        let mut guard = slot.lock();
        match &*guard {
            Slot::Live(state) => {
                if is_fresh(state) {
                    tracing::trace!(object = %self.object, kind = %self.kind, device = ordinal, "device data hit");
                    return Ok(Arc::clone(state));
                }
            }
            Slot::Retired => return DeviceRetiredSnafu { ordinal }.fail(),
            Slot::Vacant => {}
        }

        let state = Arc::new(factory()?);
        tracing::debug!(object = %self.object, kind = %self.kind, device = ordinal, "device data created");
        let _previous = std::mem::replace(&mut *guard, Slot::Live(Arc::clone(&state)));
        Ok(state)
    }

    /// Reset `ordinal` to vacant, returning the state it held.
    pub fn invalidate(&self, ordinal: usize) -> Result<Option<Arc<T>>> {
        let slot = self.slot(ordinal)?;
        let mut guard = slot.lock();
        match std::mem::replace(&mut *guard, Slot::Vacant) {
            Slot::Live(state) => Ok(Some(state)),
            Slot::Vacant => Ok(None),
            Slot::Retired => {
                *guard = Slot::Retired;
                DeviceRetiredSnafu { ordinal }.fail()
            }
        }
    }

    /// Reset every live slot to vacant.
    pub fn invalidate_all(&self) {
        for slot in self.snapshot() {
            let mut guard = slot.lock();
            if matches!(*guard, Slot::Live(_)) {
                *guard = Slot::Vacant;
            }
        }
    }

    /// Extend the registry to `slots` entries. Never shrinks.
    pub fn grow(&self, slots: usize) {
        let mut current = self.slots.write();
        while current.len() < slots {
            current.push(Arc::new(Mutex::new(Slot::Vacant)));
        }
    }

    /// Tombstone `ordinal`, dropping its state. Returns whether state was dropped.
    ///
    /// Slots past the end are an error: they only appear through [`Self::grow`].
    pub fn retire(&self, ordinal: usize) -> Result<bool> {
        let slot = self.slot(ordinal)?;
        let previous = std::mem::replace(&mut *slot.lock(), Slot::Retired);
        Ok(matches!(previous, Slot::Live(_)))
    }

    pub fn is_materialized(&self, ordinal: usize) -> bool {
        self.slot(ordinal).is_ok_and(|slot| matches!(*slot.lock(), Slot::Live(_)))
    }

    pub fn is_retired(&self, ordinal: usize) -> bool {
        self.slot(ordinal).is_ok_and(|slot| matches!(*slot.lock(), Slot::Retired))
    }

    /// Ordinals that currently hold state.
    pub fn materialized(&self) -> Vec<usize> {
        self.snapshot()
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(*slot.lock(), Slot::Live(_)))
            .map(|(ordinal, _)| ordinal)
            .collect()
    }

    /// Live state of every materialized slot.
    pub fn live(&self) -> Vec<(usize, Arc<T>)> {
        self.snapshot()
            .iter()
            .enumerate()
            .filter_map(|(ordinal, slot)| match &*slot.lock() {
                Slot::Live(state) => Some((ordinal, Arc::clone(state))),
                Slot::Vacant | Slot::Retired => None,
            })
            .collect()
    }
}
