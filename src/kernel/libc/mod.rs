//! C runtime functions implemented on the host.
//!
//! Each function validates the guest memory it touches before using it. An
//! argument that can't be accessed at all fails the call (and with it the
//! run); conditions a real C library reports to the caller, like a file that
//! can't be opened, are returned to the guest as usual.

pub mod format;
pub mod stdio;
pub mod stdlib;
pub mod string;
pub mod time;
