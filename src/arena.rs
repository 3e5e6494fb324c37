//! Generational arena for heap objects
//!
//! Tables, functions, upvalue cells and userdata live in arenas and are
//! referenced by `Handle`s. A handle carries the generation of the slot it was
//! issued for, so a handle to a collected object never aliases a newer one.

/// A handle into a generational arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    /// Index into the arena
    pub index: u32,

    /// Generation count for detecting stale references
    pub generation: u32,
}

impl Handle {
    /// Create a new handle
    pub fn new(index: u32, generation: u32) -> Self {
        Handle { index, generation }
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// A generational arena for storing values
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    occupied: usize,
}

impl<T> Arena<T> {
    /// Create a new empty arena
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free_list: Vec::new(),
            occupied: 0,
        }
    }

    /// Insert a value, returning its handle
    pub fn insert(&mut self, value: T) -> Handle {
        self.occupied += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            Handle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                value: Some(value),
                generation: 0,
            });
            Handle::new(index, 0)
        }
    }

    /// Remove a value from the arena
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free_list.push(handle.index);
        self.occupied -= 1;
        Some(value)
    }

    /// Get a reference to a value
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Get a mutable reference to a value
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Check if a handle is live
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Check if the arena is empty
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Iterate over live values with their handles
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Drop every value for which `keep` returns false, returning how many
    /// were removed
    pub fn retain(&mut self, mut keep: impl FnMut(Handle, &T) -> bool) -> usize {
        let mut removed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let handle = Handle::new(index as u32, slot.generation);
            let drop_it = match slot.value.as_ref() {
                Some(value) => !keep(handle, value),
                None => false,
            };
            if drop_it {
                slot.value = None;
                self.free_list.push(index as u32);
                removed += 1;
            }
        }
        self.occupied -= removed;
        removed
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_basic() {
        let mut arena = Arena::new();

        let h1 = arena.insert("hello");
        let h2 = arena.insert("world");
        assert_eq!(arena.get(h1), Some(&"hello"));
        assert_eq!(arena.get(h2), Some(&"world"));

        assert_eq!(arena.remove(h1), Some("hello"));
        assert_eq!(arena.get(h1), None);

        // Slot is reused with a bumped generation
        let h3 = arena.insert("reused");
        assert_eq!(h3.index, h1.index);
        assert_ne!(h3.generation, h1.generation);
    }

    #[test]
    fn test_stale_handles() {
        let mut arena = Arena::new();

        let h1 = arena.insert(42);
        arena.remove(h1);
        let h2 = arena.insert(84);

        assert_eq!(arena.get(h1), None);
        assert_eq!(arena.get(h2), Some(&84));
        assert!(!arena.contains(h1));
    }

    #[test]
    fn test_retain() {
        let mut arena = Arena::new();
        let handles: Vec<_> = (0..6).map(|n| arena.insert(n)).collect();

        let removed = arena.retain(|_, n| n % 2 == 0);
        assert_eq!(removed, 3);
        assert_eq!(arena.len(), 3);
        assert!(arena.contains(handles[0]));
        assert!(!arena.contains(handles[1]));
        assert_eq!(arena.iter().map(|(_, n)| *n).collect::<Vec<_>>(), vec![0, 2, 4]);
    }
}
