//! Non-thread-safe object pool used as the backing storage for handle
//! control blocks.
//!
//! The pool hands out [`Ptr`]s, generation-checked indices. A `Ptr`
//! kept across a deallocation is detected at access time instead of
//! reaching a recycled slot, so linked structures built on top of the
//! pool stay within safe Rust.
//!
//! Free slots form a singly-linked free list, so allocation and
//! deallocation are O(1) and slots are reused before the backing
//! storage grows.
use alloc::vec::Vec;
use core::{mem, ops};

/// Object pool with O(1) allocation and deallocation.
#[derive(Debug, Clone)]
pub struct Pool<T> {
    storage: Vec<Entry<T>>,
    first_free: Option<u32>,
    len: usize,
}

/// A generation-checked pointer to an object in a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ptr {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    /// Incremented whenever the slot is vacated. A `Ptr` is valid only
    /// while its generation matches.
    generation: u32,
    state: State<T>,
}

#[derive(Debug, Clone)]
enum State<T> {
    Used(T),
    /// This slot is free. Points to the next free slot.
    Free(Option<u32>),
}

impl<T> Pool<T> {
    pub const fn new() -> Self {
        Self {
            storage: Vec::new(),
            first_free: None,
            len: 0,
        }
    }

    /// The number of live objects.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocate(&mut self, x: T) -> Ptr {
        self.len += 1;
        match self.first_free {
            None => {
                self.storage.push(Entry {
                    generation: 0,
                    state: State::Used(x),
                });
                Ptr {
                    index: (self.storage.len() - 1) as u32,
                    generation: 0,
                }
            }
            Some(i) => {
                let entry = &mut self.storage[i as usize];
                self.first_free = match entry.state {
                    State::Free(next) => next,
                    State::Used(_) => unreachable!("free list points to a used slot"),
                };
                entry.state = State::Used(x);
                Ptr {
                    index: i,
                    generation: entry.generation,
                }
            }
        }
    }

    /// Release the slot designated by `ptr`, returning the stored
    /// object. Returns `None` if `ptr` is stale.
    pub fn deallocate(&mut self, ptr: Ptr) -> Option<T> {
        let entry = self.storage.get_mut(ptr.index as usize)?;
        if entry.generation != ptr.generation || matches!(entry.state, State::Free(_)) {
            return None;
        }
        let x = match mem::replace(&mut entry.state, State::Free(self.first_free)) {
            State::Used(x) => x,
            State::Free(_) => unreachable!(),
        };
        entry.generation = entry.generation.wrapping_add(1);
        self.first_free = Some(ptr.index);
        self.len -= 1;
        Some(x)
    }

    pub fn get(&self, ptr: Ptr) -> Option<&T> {
        let entry = self.storage.get(ptr.index as usize)?;
        if entry.generation != ptr.generation {
            return None;
        }
        match &entry.state {
            State::Used(x) => Some(x),
            State::Free(_) => None,
        }
    }

    pub fn get_mut(&mut self, ptr: Ptr) -> Option<&mut T> {
        let entry = self.storage.get_mut(ptr.index as usize)?;
        if entry.generation != ptr.generation {
            return None;
        }
        match &mut entry.state {
            State::Used(x) => Some(x),
            State::Free(_) => None,
        }
    }

    /// Iterate over live objects and their pointers.
    pub fn ptr_iter(&self) -> impl Iterator<Item = (Ptr, &'_ T)> + '_ {
        self.storage
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match &entry.state {
                State::Free(_) => None,
                State::Used(x) => Some((
                    Ptr {
                        index: i as u32,
                        generation: entry.generation,
                    },
                    x,
                )),
            })
    }
}

impl<T> ops::Index<Ptr> for Pool<T> {
    type Output = T;

    fn index(&self, index: Ptr) -> &Self::Output {
        self.get(index).expect("dangling ptr")
    }
}

impl<T> ops::IndexMut<Ptr> for Pool<T> {
    fn index_mut(&mut self, index: Ptr) -> &mut Self::Output {
        self.get_mut(index).expect("dangling ptr")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{vec, vec::Vec};

    #[test]
    fn alloc_get() {
        let mut pool = Pool::new();
        let p1 = pool.allocate(1);
        let p2 = pool.allocate(2);
        assert_eq!(pool[p1], 1);
        assert_eq!(pool[p2], 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn stale_ptr_detected() {
        let mut pool = Pool::new();
        let p = pool.allocate(1);
        assert_eq!(pool.deallocate(p), Some(1));
        assert!(pool.get(p).is_none());
        assert_eq!(pool.deallocate(p), None);

        // The slot is reused with a new generation; the old pointer
        // must remain invalid.
        let p2 = pool.allocate(2);
        assert_eq!(p.index, p2.index);
        assert_ne!(p, p2);
        assert!(pool.get(p).is_none());
        assert_eq!(pool[p2], 2);
    }

    #[test]
    #[should_panic]
    fn dangling_ptr() {
        let mut pool = Pool::new();
        let p = pool.allocate(1);
        pool.deallocate(p);
        let _ = pool[p];
    }

    #[test]
    fn ptr_iter_skips_free() {
        let mut pool = Pool::new();
        let p1 = pool.allocate(1);
        let _p2 = pool.allocate(2);
        pool.deallocate(p1);
        let values: Vec<i32> = pool.ptr_iter().map(|(_, x)| *x).collect();
        assert_eq!(values, vec![2]);
    }
}
