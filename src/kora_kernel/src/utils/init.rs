use core::{
    cell::{Cell, UnsafeCell},
    mem,
    sync::atomic,
};

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl Init for () {
    const INIT: Self = ();
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init, const N: usize> Init for [T; N] {
    const INIT: Self = [const { T::INIT }; N];
}

impl<T: Init> Init for UnsafeCell<T> {
    const INIT: Self = UnsafeCell::new(T::INIT);
}

impl<T: Init> Init for Cell<T> {
    const INIT: Self = Cell::new(T::INIT);
}

impl<T: Init> Init for mem::MaybeUninit<T> {
    const INIT: Self = mem::MaybeUninit::uninit();
}

impl<T: Init, I: Init> Init for tokenlock::TokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

impl<const N: usize> Init for arrayvec::ArrayString<N> {
    const INIT: Self = Self::new_const();
}

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

impl Init for atomic::AtomicBool {
    const INIT: Self = atomic::AtomicBool::new(false);
}

impl Init for atomic::AtomicU32 {
    const INIT: Self = atomic::AtomicU32::new(0);
}

impl Init for atomic::AtomicUsize {
    const INIT: Self = atomic::AtomicUsize::new(0);
}

macro_rules! impl_init {
    ($($ty:ty => $value:expr,)*) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    char => '\0',
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    usize => 0,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    isize => 0,
}
