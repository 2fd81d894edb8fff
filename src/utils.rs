use std::any;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Host-side value embedded in guest-facing structures (streams, tracers).
///
/// Its `Debug` output is just the type name, so that register dumps and error
/// reports stay readable even though closures and trait objects can't be
/// printed.
pub struct Opaque<T>(pub T);

impl<T> fmt::Debug for Opaque<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}>", any::type_name::<T>())
    }
}

impl<T> Deref for Opaque<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Opaque<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
