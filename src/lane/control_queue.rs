use std::sync::{Mutex, PoisonError};

use crate::types::{ConnectionHandle, ControlMessage};

/// Control-plane payload addressed to one connection on the lane, or to the whole lane.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlEnvelope {
    pub target: Option<ConnectionHandle>,
    pub message: ControlMessage,
}

/// Double buffer: producers append to the back buffer under a short lock, the lane swaps
/// it out once per tick and reads the front buffer without holding the lock.
#[derive(Debug)]
pub struct ControlQueue<T> {
    back: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> ControlQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            back: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Hands the item back when the back buffer already holds `capacity` items.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut back = self.back.lock().unwrap_or_else(PoisonError::into_inner);
        if back.len() >= self.capacity {
            return Err(item);
        }
        back.push(item);
        Ok(())
    }

    /// Swaps the back buffer into `front`. `front` is expected to be drained already.
    pub fn swap_into(&self, front: &mut Vec<T>) {
        debug_assert!(front.is_empty(), "control front buffer was not drained");
        let mut back = self.back.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::swap(&mut *back, front);
    }

    pub fn len(&self) -> usize {
        self.back
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
