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

/// Translates between an intrusive link and the item embedding it.
///
/// Implementations are generated with [`intrusive_adapter!`], which derives
/// the translation from the link field's offset inside the item.
pub trait Adapter {
    type Item;
    type Link;

    /// # Safety
    ///
    /// `link` must point at the adapter's link field of a live item.
    unsafe fn link_to_item(link: NonNull<Self::Link>) -> NonNull<Self::Item>;

    /// # Safety
    ///
    /// `item` must point at a live item.
    unsafe fn item_to_link(item: NonNull<Self::Item>) -> NonNull<Self::Link>;
}

/// Generates an [`Adapter`] for one link field of an item type.
///
/// ```ignore
/// intrusive_adapter! {
///     pub ItemListAdapter<T> = Item<T> { list_link: DlistLink } where T: Send
/// }
/// ```
#[macro_export]
macro_rules! intrusive_adapter {
    (
        $vis:vis $name:ident $(<$($gp:ident),*>)? = $item:ty { $field:ident: $link:ty }
        $(where $($bounds:tt)*)?
    ) => {
        $vis struct $name $(<$($gp),*>)? (
            ::std::marker::PhantomData<fn() -> ($($($gp,)*)?)>,
        );

        impl $(<$($gp),*>)? $crate::adapter::Adapter for $name $(<$($gp),*>)?
        $(where $($bounds)*)?
        {
            type Item = $item;
            type Link = $link;

            unsafe fn link_to_item(
                link: ::std::ptr::NonNull<Self::Link>,
            ) -> ::std::ptr::NonNull<Self::Item> {
                let offset = ::std::mem::offset_of!($item, $field);
                ::std::ptr::NonNull::new_unchecked(
                    link.as_ptr().byte_sub(offset).cast::<$item>(),
                )
            }

            unsafe fn item_to_link(
                item: ::std::ptr::NonNull<Self::Item>,
            ) -> ::std::ptr::NonNull<Self::Link> {
                let offset = ::std::mem::offset_of!($item, $field);
                ::std::ptr::NonNull::new_unchecked(
                    item.as_ptr().byte_add(offset).cast::<$link>(),
                )
            }
        }
    };
}
