//! A user-space 32-bit x86 interpreter.
//!
//! Guest programs run against a sparse, explicitly allocated address space
//! (`memory`). The `cpu` module decodes and executes instructions; anything
//! that leaves the sandbox (system calls, imported library functions) is
//! trapped and handled by a runtime from `kernel`. Images are brought into
//! memory by the `loader`.

#![doc(html_root_url = "https://docs.rs/sandbox86/0.1.0")]
#![warn(missing_debug_implementations)]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate bitpat;
#[macro_use] extern crate log;
#[macro_use] extern crate num_derive;
extern crate num_traits;
extern crate generational_arena;
extern crate goblin;
extern crate termcolor;

pub mod cpu;
pub mod kernel;
pub mod loader;
pub mod memory;
mod utils;
