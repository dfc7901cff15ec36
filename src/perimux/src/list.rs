//! Circular doubly-linked lists whose elements live in a [`Pool`] and
//! embed their own link state.
//!
//! The link fields are stored inside the elements, so queue membership
//! costs no allocation and removal by pointer is O(1). Unlike the
//! classical intrusive list, elements are addressed by generation-
//! checked [`Ptr`]s rather than raw pointers, which keeps the whole
//! structure in safe Rust and turns use of a stale element into a
//! detectable error instead of undefined behavior.
//!
//! A [`List`] only stores the entry point and bookkeeping; every
//! mutation goes through a [`ListAccessor`], which borrows both the
//! list header and the element pool.
use crate::utils::pool::{Pool, Ptr};

/// Identifies the list an element is currently a member of.
///
/// Tags must be unique among the lists sharing one pool. Membership
/// can then be tested in O(1) by comparing an element's owner tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListTag(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    prev: Ptr,
    next: Ptr,
}

/// Link state embedded in every pooled element. An element can be a
/// member of at most one list at a time.
#[derive(Debug, Clone, Copy)]
pub struct ListNode {
    link: Option<Link>,
    owner: Option<ListTag>,
}

impl ListNode {
    pub const fn new() -> Self {
        Self {
            link: None,
            owner: None,
        }
    }

    /// `true` if the element is currently a member of some list.
    pub fn is_linked(&self) -> bool {
        self.owner.is_some()
    }
}

impl Default for ListNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Provides access to the [`ListNode`] embedded in an element.
pub trait HasNode {
    fn node(&self) -> &ListNode;
    fn node_mut(&mut self) -> &mut ListNode;
}

/// List header.
#[derive(Debug)]
pub struct List {
    first: Option<Ptr>,
    len: usize,
    max: Option<usize>,
    tag: ListTag,
}

/// Error type for insertion operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The element is already a member of a list.
    AlreadyLinked,
    /// The list is at its configured capacity.
    CapacityExceeded,
    /// The `at` element is not a member of this list.
    BadAnchor,
}

/// Error type for operations addressing an existing member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemError {
    /// The element is not a member of this list.
    NotLinked,
}

impl List {
    pub const fn new(tag: ListTag) -> Self {
        Self {
            first: None,
            len: 0,
            max: None,
            tag,
        }
    }

    /// Create a list that refuses insertions beyond `max` elements.
    pub const fn with_capacity(tag: ListTag, max: usize) -> Self {
        Self {
            first: None,
            len: 0,
            max: Some(max),
            tag,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn front(&self) -> Option<Ptr> {
        self.first
    }

    /// The number of elements that can still be inserted, or `None`
    /// for a list without a capacity bound.
    pub fn available(&self) -> Option<usize> {
        self.max.map(|max| max.saturating_sub(self.len))
    }

    /// O(1) membership test.
    pub fn contains<T: HasNode>(&self, pool: &Pool<T>, item: Ptr) -> bool {
        pool.get(item)
            .map_or(false, |e| e.node().owner == Some(self.tag))
    }

    /// The member following `item`, or `None` if `item` is the last
    /// member or not a member at all.
    pub fn next_of<T: HasNode>(&self, pool: &Pool<T>, item: Ptr) -> Option<Ptr> {
        let node = pool.get(item)?.node();
        if node.owner != Some(self.tag) {
            return None;
        }
        let next = node.link?.next;
        if Some(next) == self.first {
            None
        } else {
            Some(next)
        }
    }

    /// The member preceding `item`, or `None` if `item` is the first
    /// member or not a member at all.
    pub fn prev_of<T: HasNode>(&self, pool: &Pool<T>, item: Ptr) -> Option<Ptr> {
        let node = pool.get(item)?.node();
        if node.owner != Some(self.tag) || Some(item) == self.first {
            return None;
        }
        Some(node.link?.prev)
    }

    pub fn iter<'a, T: HasNode>(&'a self, pool: &'a Pool<T>) -> Iter<'a, T> {
        Iter {
            pool,
            first: self.first,
            next: self.first,
        }
    }

    /// Borrow the header and the element pool together for mutation.
    pub fn accessor<'a, T: HasNode>(&'a mut self, pool: &'a mut Pool<T>) -> ListAccessor<'a, T> {
        ListAccessor { list: self, pool }
    }
}

/// A mutable view of a [`List`] and the [`Pool`] its elements live in.
pub struct ListAccessor<'a, T> {
    list: &'a mut List,
    pool: &'a mut Pool<T>,
}

impl<T: HasNode> ListAccessor<'_, T> {
    fn link_of(&self, p: Ptr) -> Link {
        self.pool[p].node().link.expect("inconsistent list")
    }

    pub fn push_back(&mut self, item: Ptr) -> Result<(), InsertError> {
        self.insert(item, None)
    }

    pub fn push_front(&mut self, item: Ptr) -> Result<(), InsertError> {
        self.insert(item, self.list.first)
    }

    /// Insert `item` before `at`. `None` inserts at the back.
    pub fn insert(&mut self, item: Ptr, at: Option<Ptr>) -> Result<(), InsertError> {
        if self.pool[item].node().owner.is_some() {
            return Err(InsertError::AlreadyLinked);
        }
        if let Some(max) = self.list.max {
            if self.list.len >= max {
                return Err(InsertError::CapacityExceeded);
            }
        }
        match self.list.first {
            None => {
                if at.is_some() {
                    return Err(InsertError::BadAnchor);
                }
                self.pool[item].node_mut().link = Some(Link {
                    prev: item,
                    next: item,
                });
                self.list.first = Some(item);
            }
            Some(first) => {
                let next = at.unwrap_or(first);
                if self.pool[next].node().owner != Some(self.list.tag) {
                    return Err(InsertError::BadAnchor);
                }
                let prev = self.link_of(next).prev;
                self.pool[item].node_mut().link = Some(Link { prev, next });
                if let Some(l) = self.pool[prev].node_mut().link.as_mut() {
                    l.next = item;
                }
                if let Some(l) = self.pool[next].node_mut().link.as_mut() {
                    l.prev = item;
                }
                if at == Some(first) {
                    self.list.first = Some(item);
                }
            }
        }
        self.pool[item].node_mut().owner = Some(self.list.tag);
        self.list.len += 1;
        Ok(())
    }

    /// Unlink `item` from the list.
    pub fn remove(&mut self, item: Ptr) -> Result<(), ItemError> {
        let node = self.pool.get(item).ok_or(ItemError::NotLinked)?.node();
        if node.owner != Some(self.list.tag) {
            return Err(ItemError::NotLinked);
        }
        let link = match node.link {
            Some(link) => link,
            None => return Err(ItemError::NotLinked),
        };
        if link.next == item {
            // Sole element
            self.list.first = None;
        } else {
            if self.list.first == Some(item) {
                self.list.first = Some(link.next);
            }
            if let Some(l) = self.pool[link.prev].node_mut().link.as_mut() {
                l.next = link.next;
            }
            if let Some(l) = self.pool[link.next].node_mut().link.as_mut() {
                l.prev = link.prev;
            }
        }
        let node = self.pool[item].node_mut();
        node.link = None;
        node.owner = None;
        self.list.len -= 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Ptr> {
        let first = self.list.first?;
        self.remove(first).ok()?;
        Some(first)
    }

    pub fn back(&self) -> Option<Ptr> {
        self.list.first.map(|first| self.link_of(first).prev)
    }
}

/// Iterator over the members of a [`List`] in list order.
pub struct Iter<'a, T> {
    pool: &'a Pool<T>,
    first: Option<Ptr>,
    next: Option<Ptr>,
}

impl<'a, T: HasNode> Iterator for Iter<'a, T> {
    type Item = (Ptr, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        let item = self.pool.get(cur)?;
        self.next = match item.node().link.map(|l| l.next) {
            Some(n) if Some(n) != self.first => Some(n),
            _ => None,
        };
        Some((cur, item))
    }
}
