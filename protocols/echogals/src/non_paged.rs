// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Owner of object placed in non-paged memory.

use {
    super::{os_support::*, *},
    std::{
        alloc::Layout,
        ops::{Deref, DerefMut},
        ptr::NonNull,
    },
};

/// The box of object in memory allocated by `OsSupport::alloc_non_paged()`. The object is
/// dropped and the memory is returned to the operating system when the box is dropped.
pub struct NonPagedBox<'a, T, O: OsSupport> {
    ptr: NonNull<T>,
    os: &'a O,
}

impl<'a, T, O: OsSupport> NonPagedBox<'a, T, O> {
    pub fn new(os: &'a O, value: T) -> Result<Self, Error> {
        let layout = Layout::new::<T>();
        let ptr = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            os.alloc_non_paged(layout)
                .map_err(|_| {
                    let msg = format!("Fail to allocate {} bytes in non-paged memory", layout.size());
                    status_error(EchoStatusError::NoMem, &msg)
                })?
                .cast::<T>()
        };

        // SAFETY: the memory is allocated for the layout of T and not initialized yet.
        unsafe { ptr.as_ptr().write(value) };

        Ok(Self { ptr, os })
    }
}

impl<'a, T, O: OsSupport> Deref for NonPagedBox<'a, T, O> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the pointer is initialized in construction and exclusively owned.
        unsafe { self.ptr.as_ref() }
    }
}

impl<'a, T, O: OsSupport> DerefMut for NonPagedBox<'a, T, O> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the pointer is initialized in construction and exclusively owned.
        unsafe { self.ptr.as_mut() }
    }
}

impl<'a, T, O: OsSupport> Drop for NonPagedBox<'a, T, O> {
    fn drop(&mut self) {
        let layout = Layout::new::<T>();
        // SAFETY: the object is initialized and never used after here.
        unsafe {
            std::ptr::drop_in_place(self.ptr.as_ptr());
            if layout.size() > 0 {
                self.os.free_non_paged(self.ptr.cast::<u8>(), layout);
            }
        }
    }
}

// The box exclusively owns the object like std::boxed::Box.
unsafe impl<'a, T: Send, O: OsSupport + Sync> Send for NonPagedBox<'a, T, O> {}
unsafe impl<'a, T: Sync, O: OsSupport + Sync> Sync for NonPagedBox<'a, T, O> {}
