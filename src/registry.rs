//! Generation-checked arena mapping connection handles to dense slots.
//!
//! Each owning thread keeps its own registry: the coordinator for sessions, every lane for
//! the connections it hosts, every replication engine for per-connection replicas. Slots
//! are reused after `detach`; the generation bump makes stale slots resolve to nothing.

use std::collections::HashMap;

use crate::error::RegistryError;
use crate::types::ConnectionHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    occupant: Option<(ConnectionHandle, T)>,
}

#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    by_handle: HashMap<ConnectionHandle, Slot>,
    capacity: usize,
}

impl<T> ConnectionRegistry<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            by_handle: HashMap::new(),
            capacity,
        }
    }

    /// Binds `handle` to a slot.
    ///
    /// # Panics
    ///
    /// Attaching a handle that is already attached is a scheduling bug and panics.
    pub fn attach(&mut self, handle: ConnectionHandle, value: T) -> Result<Slot, RegistryError> {
        assert!(
            !self.by_handle.contains_key(&handle),
            "{handle} attached twice to the same registry"
        );
        if self.by_handle.len() >= self.capacity {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }

        let slot = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.occupant = Some((handle, value));
                Slot {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    occupant: Some((handle, value)),
                });
                Slot {
                    index,
                    generation: 0,
                }
            }
        };
        self.by_handle.insert(handle, slot);
        Ok(slot)
    }

    pub fn detach(&mut self, handle: ConnectionHandle) -> Option<T> {
        let slot = self.by_handle.remove(&handle)?;
        let entry = &mut self.entries[slot.index as usize];
        let (_, value) = entry.occupant.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot.index);
        Some(value)
    }

    pub fn slot_of(&self, handle: ConnectionHandle) -> Option<Slot> {
        self.by_handle.get(&handle).copied()
    }

    pub fn resolve(&self, slot: Slot) -> Option<(ConnectionHandle, &T)> {
        let entry = self.entries.get(slot.index as usize)?;
        if entry.generation != slot.generation {
            return None;
        }
        entry
            .occupant
            .as_ref()
            .map(|(handle, value)| (*handle, value))
    }

    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&T> {
        let slot = self.by_handle.get(&handle)?;
        self.entries[slot.index as usize]
            .occupant
            .as_ref()
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut T> {
        let slot = self.by_handle.get(&handle)?;
        self.entries[slot.index as usize]
            .occupant
            .as_mut()
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionHandle, &T)> {
        self.entries.iter().filter_map(|entry| {
            entry
                .occupant
                .as_ref()
                .map(|(handle, value)| (*handle, value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionHandle, &mut T)> {
        self.entries.iter_mut().filter_map(|entry| {
            entry
                .occupant
                .as_mut()
                .map(|(handle, value)| (*handle, value))
        })
    }

    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}
