use core::cell::UnsafeCell;

use crate::utils::Init;

/// Like `UnsafeCell`, but implements `Sync`.
///
/// The user is responsible for synchronizing accesses to the contents. In
/// this kernel that synchronization is CPU Lock: the cell contents are only
/// touched by code that holds it.
#[derive(Debug)]
#[repr(transparent)]
pub(crate) struct RawCell<T: ?Sized>(UnsafeCell<T>);

unsafe impl<T: ?Sized> Sync for RawCell<T> {}

impl<T> RawCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsafeCell::new(x))
    }
}

impl<T: ?Sized> RawCell<T> {
    pub(crate) const fn get(&self) -> *mut T {
        self.0.get()
    }
}

impl<T: Init> Init for RawCell<T> {
    const INIT: Self = RawCell::new(T::INIT);
}
