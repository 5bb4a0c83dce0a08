// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive doubly-linked lists over a slot table.
//!
//! Elements are named by their index in a slice the caller owns (the task
//! table), and carry their own `Link`. An element has one `Link`, so it can be
//! on at most one list at a time; keeping track of *which* list is the owner's
//! job.

/// Per-element list linkage.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

impl Link {
    pub const UNLINKED: Self = Self {
        prev: None,
        next: None,
    };

    pub fn next(&self) -> Option<usize> {
        self.next
    }
}

/// Something that can sit on a `List`.
pub trait Linked {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl List {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<usize> {
        self.head
    }

    pub fn push_back<T: Linked>(&mut self, slots: &mut [T], i: usize) {
        *slots[i].link_mut() = Link {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(t) => slots[t].link_mut().next = Some(i),
            None => self.head = Some(i),
        }
        self.tail = Some(i);
        self.len += 1;
    }

    /// Inserts `i` immediately ahead of `at`, which must be on this list.
    pub fn insert_before<T: Linked>(
        &mut self,
        slots: &mut [T],
        at: usize,
        i: usize,
    ) {
        let prev = slots[at].link().prev;
        *slots[i].link_mut() = Link {
            prev,
            next: Some(at),
        };
        slots[at].link_mut().prev = Some(i);
        match prev {
            Some(p) => slots[p].link_mut().next = Some(i),
            None => self.head = Some(i),
        }
        self.len += 1;
    }

    /// Unlinks `i`, which must be on this list.
    pub fn remove<T: Linked>(&mut self, slots: &mut [T], i: usize) {
        let Link { prev, next } = *slots[i].link();
        match prev {
            Some(p) => slots[p].link_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => slots[n].link_mut().prev = prev,
            None => self.tail = prev,
        }
        *slots[i].link_mut() = Link::UNLINKED;
        self.len -= 1;
    }

    pub fn pop_front<T: Linked>(&mut self, slots: &mut [T]) -> Option<usize> {
        let i = self.head?;
        self.remove(slots, i);
        Some(i)
    }

    /// Walks the list front to back.
    pub fn iter<'a, T: Linked>(&self, slots: &'a [T]) -> Iter<'a, T> {
        Iter {
            slots,
            cursor: self.head,
        }
    }
}

pub struct Iter<'a, T> {
    slots: &'a [T],
    cursor: Option<usize>,
}

impl<T: Linked> Iterator for Iter<'_, T> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let i = self.cursor?;
        self.cursor = self.slots[i].link().next;
        Some(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Node(Link);

    impl Linked for Node {
        fn link(&self) -> &Link {
            &self.0
        }
        fn link_mut(&mut self) -> &mut Link {
            &mut self.0
        }
    }

    fn nodes() -> Vec<Node> {
        (0..6).map(|_| Node::default()).collect()
    }

    fn contents(l: &List, slots: &[Node]) -> Vec<usize> {
        l.iter(slots).collect()
    }

    #[test]
    fn push_and_pop_are_fifo() {
        let mut slots = nodes();
        let mut l = List::new();
        for i in [3, 1, 4] {
            l.push_back(&mut slots, i);
        }
        assert_eq!(contents(&l, &slots), [3, 1, 4]);
        assert_eq!(l.pop_front(&mut slots), Some(3));
        assert_eq!(l.pop_front(&mut slots), Some(1));
        assert_eq!(l.pop_front(&mut slots), Some(4));
        assert_eq!(l.pop_front(&mut slots), None);
        assert!(l.is_empty());
    }

    #[test]
    fn remove_from_middle_and_ends() {
        let mut slots = nodes();
        let mut l = List::new();
        for i in 0..5 {
            l.push_back(&mut slots, i);
        }
        l.remove(&mut slots, 2);
        l.remove(&mut slots, 0);
        l.remove(&mut slots, 4);
        assert_eq!(contents(&l, &slots), [1, 3]);
        assert_eq!(l.len(), 2);
        assert_eq!(*slots[2].link(), Link::UNLINKED);
        l.push_back(&mut slots, 2);
        assert_eq!(contents(&l, &slots), [1, 3, 2]);
    }

    #[test]
    fn insert_before_head_and_interior() {
        let mut slots = nodes();
        let mut l = List::new();
        l.push_back(&mut slots, 0);
        l.push_back(&mut slots, 1);
        l.insert_before(&mut slots, 0, 5);
        l.insert_before(&mut slots, 1, 3);
        assert_eq!(contents(&l, &slots), [5, 0, 3, 1]);
        assert_eq!(l.front(), Some(5));
        l.remove(&mut slots, 1);
        l.push_back(&mut slots, 4);
        assert_eq!(contents(&l, &slots), [5, 0, 3, 4]);
    }
}
