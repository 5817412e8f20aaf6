//! Intrusive doubly linked list backed by a container implementing
//! `core::ops::Index`.
//!
//! The list itself is just a [`ListHead`] (a first/last pair of indices).
//! Each element embeds a [`Link`] cell; an element whose link cell is `None`
//! is not a member of any list. All accesses go through a
//! [`ListAccessorCell`], which combines the list head, the backing container,
//! a projection from an element to its link cell, and a [`CellLike`] key that
//! unlocks the cells.
use core::{fmt, ops};

use super::Init;

/// Linked list header.
#[derive(Copy, Clone)]
pub(crate) struct ListHead<Index> {
    pub first: Option<Index>,
    pub last: Option<Index>,
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?}, {:?})", &self.first, &self.last)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Link<Index> {
    pub prev: Option<Index>,
    pub next: Option<Index>,
}

/// A cell-like storage location, accessed by presenting a key.
///
/// The `Key` parameter decides what counts as a proof of access: `()` for a
/// plain `Cell`, a scheduler-lock token for the kernel's token-locked cells.
pub(crate) trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        let mut x = self.get(key);
        let result = f(&mut x);
        self.set(key, x);
        result
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        (*self).modify(key, f)
    }
}

/// Accessor to a linked list.
pub(crate) struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index>,
    MapLink: Fn(&Pool::Output) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: Copy + PartialEq,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        Self {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    /// Borrow the key used to access the cells, e.g. to read other cells
    /// guarded by the same key while the accessor is alive.
    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    fn link(&self, index: Index) -> Option<Link<Index>> {
        (self.map_link)(&self.pool[index]).get(&self.cell_key)
    }

    fn set_link(&mut self, index: Index, link: Option<Link<Index>>) {
        (self.map_link)(&self.pool[index]).set(&mut self.cell_key, link);
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    pub fn back(&self) -> Option<Index> {
        self.head().last
    }

    /// Get a flag indicating whether the element is a member of the list.
    ///
    /// This assumes the element is not a member of any *other* list using the
    /// same link cell, which the kernel upholds by construction.
    pub fn is_linked(&self, index: Index) -> bool {
        self.link(index).is_some()
    }

    /// Get the element that comes after `index` in the list, if any.
    pub fn next(&self, index: Index) -> Option<Index> {
        self.link(index).and_then(|link| link.next)
    }

    /// Get the element that comes before `index` in the list, if any.
    pub fn prev(&self, index: Index) -> Option<Index> {
        self.link(index).and_then(|link| link.prev)
    }

    /// Insert `index` at the back of the list.
    pub fn push_back(&mut self, index: Index) {
        self.insert(index, None);
    }

    /// Insert `index` before `at`. If `at` is `None`, insert at the back.
    ///
    /// `index` must not currently be a member of any list using the same link
    /// cell.
    pub fn insert(&mut self, index: Index, at: Option<Index>) {
        debug_assert!(!self.is_linked(index), "already linked");

        let mut head = self.head();
        match at {
            None => {
                let prev = head.last;
                self.set_link(index, Some(Link { prev, next: None }));
                match prev {
                    Some(prev) => {
                        self.set_link(
                            prev,
                            Some(Link {
                                next: Some(index),
                                ..self.link(prev).unwrap()
                            }),
                        );
                    }
                    None => head.first = Some(index),
                }
                head.last = Some(index);
            }
            Some(at) => {
                let at_link = self.link(at).unwrap();
                let prev = at_link.prev;
                self.set_link(
                    index,
                    Some(Link {
                        prev,
                        next: Some(at),
                    }),
                );
                self.set_link(
                    at,
                    Some(Link {
                        prev: Some(index),
                        ..at_link
                    }),
                );
                match prev {
                    Some(prev) => {
                        self.set_link(
                            prev,
                            Some(Link {
                                next: Some(index),
                                ..self.link(prev).unwrap()
                            }),
                        );
                    }
                    None => head.first = Some(index),
                }
            }
        }
        self.set_head(head);
    }

    /// Remove and return the first element.
    pub fn pop_front(&mut self) -> Option<Index> {
        let first = self.head().first?;
        self.remove(first);
        Some(first)
    }

    /// Remove `index` from the list. `index` must be a member.
    pub fn remove(&mut self, index: Index) {
        let link = self.link(index).expect("not linked");

        let mut head = self.head();
        match link.prev {
            Some(prev) => {
                self.set_link(
                    prev,
                    Some(Link {
                        next: link.next,
                        ..self.link(prev).unwrap()
                    }),
                );
            }
            None => {
                debug_assert!(head.first == Some(index));
                head.first = link.next;
            }
        }
        match link.next {
            Some(next) => {
                self.set_link(
                    next,
                    Some(Link {
                        prev: link.prev,
                        ..self.link(next).unwrap()
                    }),
                );
            }
            None => {
                debug_assert!(head.last == Some(index));
                head.last = link.prev;
            }
        }
        self.set_head(head);
        self.set_link(index, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use quickcheck_macros::quickcheck;
    use std::vec::Vec;

    struct Element {
        link: Cell<Option<Link<usize>>>,
    }

    fn build(len: usize) -> (Cell<ListHead<usize>>, Vec<Element>) {
        let head = Cell::new(ListHead::new());
        let pool = (0..len)
            .map(|_| Element {
                link: Cell::new(None),
            })
            .collect();
        (head, pool)
    }

    macro_rules! accessor {
        ($head:expr, $pool:expr) => {
            ListAccessorCell::new(&$head, &$pool, |e: &Element| &e.link, ())
        };
    }

    fn collect(
        accessor: &ListAccessorCell<'_, &Cell<ListHead<usize>>, Vec<Element>, impl Fn(&Element) -> &Cell<Option<Link<usize>>>, ()>,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = accessor.front();
        while let Some(i) = cursor {
            out.push(i);
            cursor = accessor.next(i);
        }
        out
    }

    #[test]
    fn push_pop_fifo() {
        let (head, pool) = build(3);
        let mut accessor = accessor!(head, pool);

        accessor.push_back(0);
        accessor.push_back(1);
        accessor.push_back(2);
        assert_eq!(collect(&accessor), [0, 1, 2]);

        assert_eq!(accessor.pop_front(), Some(0));
        assert_eq!(accessor.pop_front(), Some(1));
        assert_eq!(accessor.pop_front(), Some(2));
        assert_eq!(accessor.pop_front(), None);
        assert!(accessor.is_empty());
    }

    #[test]
    fn remove_middle() {
        let (head, pool) = build(3);
        let mut accessor = accessor!(head, pool);

        accessor.push_back(0);
        accessor.push_back(1);
        accessor.push_back(2);
        accessor.remove(1);
        assert_eq!(collect(&accessor), [0, 2]);
        assert!(!accessor.is_linked(1));

        accessor.remove(0);
        accessor.remove(2);
        assert!(accessor.is_empty());
    }

    #[test]
    fn insert_before() {
        let (head, pool) = build(4);
        let mut accessor = accessor!(head, pool);

        accessor.push_back(0);
        accessor.push_back(2);
        accessor.insert(1, Some(2));
        accessor.insert(3, Some(0));
        assert_eq!(collect(&accessor), [3, 0, 1, 2]);
    }

    #[quickcheck]
    fn qc_membership(ops: Vec<(bool, usize)>) {
        let (head, pool) = build(8);
        let mut accessor = accessor!(head, pool);
        let mut model: Vec<usize> = Vec::new();

        for (push, i) in ops {
            let i = i % 8;
            if push {
                if !model.contains(&i) {
                    accessor.push_back(i);
                    model.push(i);
                }
            } else if let Some(pos) = model.iter().position(|&x| x == i) {
                accessor.remove(i);
                model.remove(pos);
            }
            assert_eq!(collect(&accessor), model);
        }
    }
}
