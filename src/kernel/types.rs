//! Defines types, traits and conversions for arguments and return values of
//! trapped library functions and system calls.

use crate::cpu::State;

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

/// A C `int`, passed in a 32-bit stack slot.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Int(pub i32);

impl From<u32> for Int {
    fn from(raw: u32) -> Self {
        Int(raw as i32)
    }
}

impl Deref for Int {
    type Target = i32;

    fn deref(&self) -> &i32 {
        &self.0
    }
}

/// Opaque guest `FILE` structure.
///
/// Only ever used behind a `GuestPtr`; the pointer identifies a slot of the
/// `_iob` table.
#[derive(Debug)]
pub enum File {}

/// Opaque guest `struct tm`.
#[derive(Debug)]
pub enum Tm {}

/// Guest address space pointer to a value of type `T`.
///
/// Might be null, improperly aligned or point into unbacked memory, since the
/// guest program controls the value.
pub struct GuestPtr<T> {
    addr: u32,
    _phantom: PhantomData<*const T>,
}

impl<T> GuestPtr<T> {
    pub const NULL: Self = GuestPtr { addr: 0, _phantom: PhantomData };

    pub fn new(addr: u32) -> Self {
        Self {
            addr,
            _phantom: PhantomData,
        }
    }

    /// The raw address as seen by the guest.
    pub fn raw_addr(&self) -> u32 {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

impl<T> Clone for GuestPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GuestPtr<T> {}

impl<T> PartialEq for GuestPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T> Eq for GuestPtr<T> {}

impl<T> From<u32> for GuestPtr<T> {
    fn from(raw: u32) -> Self {
        Self::new(raw)
    }
}

impl<T> fmt::Debug for GuestPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010X}", self.addr)
    }
}

/// Request to terminate the guest program with an exit code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Exit(pub u32);

/// How a trapped call finished.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Return to the guest.
    Return,
    /// Terminate the guest.
    Exit(u32),
}

/// Trait for types that can be returned from library functions and system
/// calls.
///
/// Values are passed back to the guest in `eax`.
pub trait ApiReturnValue {
    /// Stores the value in the register file.
    fn complete(self, state: &mut State) -> Completion;
}

impl ApiReturnValue for u32 {
    fn complete(self, state: &mut State) -> Completion {
        state.set_eax(self);
        Completion::Return
    }
}

impl ApiReturnValue for i32 {
    fn complete(self, state: &mut State) -> Completion {
        state.set_eax(self as u32);
        Completion::Return
    }
}

impl<T> ApiReturnValue for GuestPtr<T> {
    fn complete(self, state: &mut State) -> Completion {
        state.set_eax(self.raw_addr());
        Completion::Return
    }
}

/// `void` functions leave `eax` alone.
impl ApiReturnValue for () {
    fn complete(self, _state: &mut State) -> Completion {
        Completion::Return
    }
}

impl ApiReturnValue for Exit {
    fn complete(self, _state: &mut State) -> Completion {
        Completion::Exit(self.0)
    }
}

/// Trait for converting a slice of raw `u32` args to the right argument types
/// for library functions.
///
/// This is implemented for all tuples (up to a certain length) whose elements
/// implement `From<u32>`.
///
/// When dispatching a call, `from_args` is called to convert the arguments
/// pushed onto the stack by the program to the types the function expects.
/// None of these conversions can fail. Every function has to check its
/// arguments and report errors to the program itself.
pub trait FromRawArgs: fmt::Debug {
    /// Convert a raw slice of `u32`s to the argument tuple.
    ///
    /// Missing arguments are passed as 0, surplus ones are ignored.
    fn from_args(raw: &[u32]) -> Self;
}

macro_rules! tuple_impl {
    ($($tyvar:ident),*) => {
        impl<$($tyvar),*> FromRawArgs for ( $($tyvar,)* )
        where $($tyvar: From<u32> + fmt::Debug),*
        {
            fn from_args(raw: &[u32]) -> Self {
                let mut _i = raw.iter().cloned();
                (
                    $(
                        $tyvar::from(_i.next().unwrap_or(0))
                    ,)*
                )
            }
        }
    };
}

tuple_impl!();
tuple_impl!(T);
tuple_impl!(T, U);
tuple_impl!(T, U, V);
tuple_impl!(T, U, V, W);
tuple_impl!(T, U, V, W, X);
