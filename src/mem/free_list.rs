//! Doubly linked free list over a descriptor table.
//!
//! The list does not own its nodes. Instead the links are stored inside the
//! [`PageDescriptor`]s themselves and refer to other descriptors by their
//! index, so a descriptor can be unlinked in `O(1)` if its index is known.

use super::page::{Link, PageDescriptor, PageFlags};

/// A list of free chunks that all have the same order.
#[derive(Debug, Clone, Copy)]
pub struct FreeList {
    head: Option<usize>,
    nr_free: usize,
}

impl FreeList {
    /// An empty list.
    pub const EMPTY: FreeList = FreeList {
        head: None,
        nr_free: 0,
    };

    /// Returns whether this list is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// The number of chunks inside this list.
    pub fn len(&self) -> usize {
        self.nr_free
    }

    /// The index of the first chunk in this list.
    pub fn first(&self) -> Option<usize> {
        self.head
    }

    /// Push the descriptor at `idx` to the front of the list.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor is already part of a list.
    pub fn push(&mut self, pages: &mut [PageDescriptor], idx: usize) {
        assert!(
            !pages[idx].is_linked(),
            "page {} is already on a free list",
            idx
        );

        if let Some(head) = self.head {
            pages[head].link.prev = Some(idx);
        }

        let page = &mut pages[idx];
        page.link = Link {
            prev: None,
            next: self.head,
        };
        page.flags.insert(PageFlags::LINKED);

        self.head = Some(idx);
        self.nr_free += 1;
    }

    /// Unlink the descriptor at `idx` from this list.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor is not linked, or this list is empty.
    pub fn remove(&mut self, pages: &mut [PageDescriptor], idx: usize) {
        assert!(self.nr_free > 0, "tried to remove page {} from an empty list", idx);
        assert!(pages[idx].is_linked(), "page {} is not on a free list", idx);

        let Link { prev, next } = pages[idx].link;

        match prev {
            Some(prev) => pages[prev].link.next = next,
            None => {
                assert_eq!(self.head, Some(idx), "page {} is on another list", idx);
                self.head = next;
            }
        }

        if let Some(next) = next {
            pages[next].link.prev = prev;
        }

        let page = &mut pages[idx];
        page.link = Link::UNLINKED;
        page.flags.remove(PageFlags::LINKED);

        self.nr_free -= 1;
    }

    /// Remove the first descriptor of this list and return its index.
    pub fn pop(&mut self, pages: &mut [PageDescriptor]) -> Option<usize> {
        let head = self.head?;
        self.remove(pages, head);
        Some(head)
    }

    /// Returns an iterator over the indices of all descriptors in this list.
    pub fn iter<'pages>(&self, pages: &'pages [PageDescriptor]) -> Iter<'pages> {
        Iter {
            pages,
            next: self.head,
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Iterator over the indices inside a [`FreeList`].
pub struct Iter<'pages> {
    pages: &'pages [PageDescriptor],
    next: Option<usize>,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        self.next = self.pages[idx].link.next;
        Some(idx)
    }
}
