//  Copyright 2026 Magpie Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::ptr::NonNull;

use crate::adapter::Adapter;

/// Link embedded by items that participate in a [`Dlist`].
#[derive(Debug, Default)]
pub struct DlistLink {
    prev: Option<NonNull<DlistLink>>,
    next: Option<NonNull<DlistLink>>,
    linked: bool,
}

impl DlistLink {
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Intrusive doubly-linked list.
///
/// All operations take and return item pointers; the embedded link is located
/// through the adapter. The list does not own its items.
pub struct Dlist<A>
where
    A: Adapter<Link = DlistLink>,
{
    head: Option<NonNull<DlistLink>>,
    tail: Option<NonNull<DlistLink>>,
    len: usize,

    _marker: std::marker::PhantomData<A>,
}

impl<A> Default for Dlist<A>
where
    A: Adapter<Link = DlistLink>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Dlist<A>
where
    A: Adapter<Link = DlistLink>,
{
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<NonNull<A::Item>> {
        self.head.map(|link| unsafe { A::link_to_item(link) })
    }

    pub fn back(&self) -> Option<NonNull<A::Item>> {
        self.tail.map(|link| unsafe { A::link_to_item(link) })
    }

    /// # Safety
    ///
    /// `item` must be live, unlinked, and stay live while linked here.
    pub unsafe fn push_front(&mut self, item: NonNull<A::Item>) {
        let mut link = A::item_to_link(item);
        debug_assert!(!link.as_ref().linked);

        link.as_mut().prev = None;
        link.as_mut().next = self.head;
        link.as_mut().linked = true;

        match self.head {
            Some(mut head) => head.as_mut().prev = Some(link),
            None => self.tail = Some(link),
        }
        self.head = Some(link);
        self.len += 1;
    }

    /// # Safety
    ///
    /// `item` must be live, unlinked, and stay live while linked here.
    pub unsafe fn push_back(&mut self, item: NonNull<A::Item>) {
        let mut link = A::item_to_link(item);
        debug_assert!(!link.as_ref().linked);

        link.as_mut().prev = self.tail;
        link.as_mut().next = None;
        link.as_mut().linked = true;

        match self.tail {
            Some(mut tail) => tail.as_mut().next = Some(link),
            None => self.head = Some(link),
        }
        self.tail = Some(link);
        self.len += 1;
    }

    /// Link `item` directly before `anchor`, or at the back when `anchor` is
    /// `None`.
    ///
    /// # Safety
    ///
    /// `item` must be live and unlinked; `anchor`, when given, must be linked
    /// in this list.
    pub unsafe fn insert_before(&mut self, anchor: Option<NonNull<A::Item>>, item: NonNull<A::Item>) {
        let mut anchor_link = match anchor {
            Some(anchor) => A::item_to_link(anchor),
            None => return self.push_back(item),
        };
        debug_assert!(anchor_link.as_ref().linked);

        let mut link = A::item_to_link(item);
        debug_assert!(!link.as_ref().linked);

        let prev = anchor_link.as_ref().prev;
        link.as_mut().prev = prev;
        link.as_mut().next = Some(anchor_link);
        link.as_mut().linked = true;

        match prev {
            Some(mut prev) => prev.as_mut().next = Some(link),
            None => self.head = Some(link),
        }
        anchor_link.as_mut().prev = Some(link);
        self.len += 1;
    }

    /// # Safety
    ///
    /// `item` must be linked in this list.
    pub unsafe fn remove(&mut self, item: NonNull<A::Item>) {
        let mut link = A::item_to_link(item);
        debug_assert!(link.as_ref().linked);

        let prev = link.as_ref().prev;
        let next = link.as_ref().next;

        match prev {
            Some(mut prev) => prev.as_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(mut next) => next.as_mut().prev = prev,
            None => self.tail = prev,
        }

        link.as_mut().prev = None;
        link.as_mut().next = None;
        link.as_mut().linked = false;
        self.len -= 1;
    }

    /// # Safety
    ///
    /// The list must outlive nothing; popped items are simply unlinked.
    pub unsafe fn pop_front(&mut self) -> Option<NonNull<A::Item>> {
        let item = self.front()?;
        self.remove(item);
        Some(item)
    }

    /// # Safety
    ///
    /// See [`Dlist::pop_front`].
    pub unsafe fn pop_back(&mut self) -> Option<NonNull<A::Item>> {
        let item = self.back()?;
        self.remove(item);
        Some(item)
    }

    /// # Safety
    ///
    /// `item` must be linked in this list.
    pub unsafe fn next_of(&self, item: NonNull<A::Item>) -> Option<NonNull<A::Item>> {
        let link = A::item_to_link(item);
        debug_assert!(link.as_ref().linked);
        link.as_ref().next.map(|next| A::link_to_item(next))
    }

    /// # Safety
    ///
    /// `item` must be linked in this list.
    pub unsafe fn prev_of(&self, item: NonNull<A::Item>) -> Option<NonNull<A::Item>> {
        let link = A::item_to_link(item);
        debug_assert!(link.as_ref().linked);
        link.as_ref().prev.map(|prev| A::link_to_item(prev))
    }

    pub fn iter(&self) -> DlistIter<'_, A> {
        DlistIter {
            cursor: self.head,
            _list: std::marker::PhantomData,
        }
    }
}

pub struct DlistIter<'a, A>
where
    A: Adapter<Link = DlistLink>,
{
    cursor: Option<NonNull<DlistLink>>,
    _list: std::marker::PhantomData<&'a Dlist<A>>,
}

impl<A> Iterator for DlistIter<'_, A>
where
    A: Adapter<Link = DlistLink>,
{
    type Item = NonNull<A::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.cursor?;
        unsafe {
            self.cursor = link.as_ref().next;
            Some(A::link_to_item(link))
        }
    }
}
