//! Generational arena backing the syntax tree.
//!
//! Parent links and scope keys are [`Idx`] values, never owning handles. A
//! freed slot bumps its generation, so a stale id can never address the
//! slot's next occupant.

use core::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::Error;

/// Typed generational index into an [`Arena<T>`].
pub struct Idx<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Idx<T> {
    #[inline]
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(index: u32) -> Self {
        Self::new(index, 0)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Idx<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Idx<T> {}

impl<T> PartialEq for Idx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Idx<T> {}

impl<T> PartialOrd for Idx<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Idx<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> Hash for Idx<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Idx<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with stable ids and slot reuse.
///
/// Ids are 32-bit, so an arena holds at most `u32::MAX` slots; past its
/// limit [`alloc`](Self::alloc) fails with [`Error::CapacityExceeded`].
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: u32,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::with_limit(u32::MAX)
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// An arena that never grows past `limit` slots.
    pub fn with_limit(limit: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit,
        }
    }

    /// An arena holding `value` under the first id it ever hands out.
    pub fn with_first(value: T) -> (Self, Idx<T>) {
        let mut arena = Self::new();
        let id = Idx::new(0, 0);
        arena.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        arena.len = 1;
        (arena, id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alloc(&mut self, value: T) -> Result<Idx<T>, Error> {
        self.alloc_with(|_| value)
    }

    /// Allocates a value that needs to know its own id.
    pub fn alloc_with(&mut self, make: impl FnOnce(Idx<T>) -> T) -> Result<Idx<T>, Error> {
        if let Some(index) = self.free.pop() {
            if let Some(slot) = self.slots.get_mut(index as usize) {
                let id = Idx::new(index, slot.generation);
                slot.value = Some(make(id));
                self.len += 1;
                return Ok(id);
            }
        }
        let index = u32::try_from(self.slots.len())
            .ok()
            .filter(|&index| index < self.limit)
            .ok_or(Error::CapacityExceeded {
                limit: self.limit as usize,
            })?;
        let id = Idx::new(index, 0);
        self.slots.push(Slot {
            generation: 0,
            value: Some(make(id)),
        });
        self.len += 1;
        Ok(id)
    }

    /// Removes the value and retires its id.
    pub fn remove(&mut self, id: Idx<T>) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub fn get(&self, id: Idx<T>) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: Idx<T>) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    #[inline]
    pub fn contains(&self, id: Idx<T>) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Idx<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            let value = slot.value.as_ref()?;
            Some((Idx::new(i as u32, slot.generation), value))
        })
    }
}
