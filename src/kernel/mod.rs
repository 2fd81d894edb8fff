//! Runtimes servicing the traps of a guest program.
//!
//! Guest code never leaves the sandbox by itself. Whenever it wants something
//! from the outside world, the interpreter hands control to a `Hooks`
//! implementation from this module:
//!
//! * `Xv6` implements the xv6 system call gate (`int 0x40`).
//! * `Win32` implements the functions a PE image imports from `msvcrt.dll`,
//!   `kernel32.dll` and `libintl3.dll`. Every import is bound to a trapped
//!   "thunk" address, and a call to one is dispatched to a Rust function
//!   instead of being executed.
//!
//! # Library Functions
//!
//! All library functions are methods of the `Syscall` type and are placed in
//! the module corresponding to the library they're part of (`libc` for the C
//! runtime, `win32` for the Windows-specific parts). They operate on guest
//! memory exclusively through the checked `VirtualMemory` accessors.
//!
//! ## Adding a new library function
//!
//! When the program calls an unimplemented function, the run stops with a trap
//! fault naming it. In order to implement the missing function:
//!
//! * Add the function to the export table in `kernel/win32/table.rs`, along
//!   with its calling convention and number of arguments.
//! * Implement it as a method of `Syscall` taking its arguments as a tuple of
//!   types from `kernel/types.rs`.
//! * Add a line to the `dispatch!` invocation in `kernel/win32/mod.rs`.
//!
//! Conditions a real C library would report to the program (a file that
//! can't be opened, say) are returned to the guest. Arguments that can't be
//! accessed at all are errors and terminate the run.

pub mod libc;
pub mod types;
pub mod win32;
pub mod xv6;

pub use self::win32::Win32;
pub use self::xv6::Xv6;

use self::libc::stdio::FileTable;
use self::libc::stdlib::Heap;
use self::types::GuestPtr;
use crate::cpu::State;
use crate::loader::Layout;
use crate::memory::{MemoryError, VirtualMemory};
use crate::utils::Opaque;

use std::io::{self, Read, Write};

/// Host streams standing in for the guest's standard input, output and error.
#[derive(Debug)]
pub struct Streams {
    stdin: Opaque<Box<dyn Read>>,
    stdout: Opaque<Box<dyn Write>>,
    stderr: Opaque<Box<dyn Write>>,
}

impl Streams {
    pub fn new(stdin: Box<dyn Read>, stdout: Box<dyn Write>, stderr: Box<dyn Write>) -> Self {
        Self {
            stdin: Opaque(stdin),
            stdout: Opaque(stdout),
            stderr: Opaque(stderr),
        }
    }

    /// Connects the guest to the emulator's own standard streams.
    pub fn host() -> Self {
        Self::new(Box::new(io::stdin()), Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn stdin(&mut self) -> &mut dyn Read {
        &mut **self.stdin
    }

    pub fn stdout(&mut self) -> &mut dyn Write {
        &mut **self.stdout
    }

    pub fn stderr(&mut self) -> &mut dyn Write {
        &mut **self.stderr
    }
}

/// `argc`/`argv` of the guest's `main`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MainArgs {
    pub argc: u32,
    pub argv: u32,
}

/// Guest memory owned by the runtime.
///
/// Holds the variables the C runtime exports to the program (`_fmode`,
/// `_iob`, a fallback `argv`/`environ`) and static buffers returned by
/// library functions.
#[derive(Debug, Copy, Clone)]
pub struct WorkArea {
    base: u32,
}

impl WorkArea {
    const ARGV0: u32 = 0x0000;
    const ARGV1: u32 = 0x0004;
    const ENV0: u32 = 0x0008;
    const PROGRAM_NAME: u32 = 0x000C;
    const FMODE: u32 = 0x0010;
    const ENVIRON: u32 = 0x0014;
    const TM: u32 = 0x0020;
    const IOB: u32 = 0x1000;
    /// Number of bytes occupied by the work area.
    pub const SIZE: u32 = 0x2000;

    /// `_O_TEXT`
    const DEFAULT_FMODE: u32 = 0x4000;

    /// Allocates and initializes the work area at `base`.
    pub fn create<M: VirtualMemory>(mem: &mut M, base: u32) -> Result<Self, MemoryError> {
        if u64::from(base) + u64::from(Self::SIZE) > 1 << 32 {
            return Err(MemoryError::Wrap { addr: base, size: Self::SIZE as usize });
        }
        mem.allocate(base, Self::SIZE);

        let work = WorkArea { base };
        mem.store_u32(work.argv(), base + Self::PROGRAM_NAME)?;
        mem.store_u32(base + Self::ARGV1, 0)?;
        mem.store_u32(work.environ(), 0)?;
        mem.write_checked(b"x\0\0\0", base + Self::PROGRAM_NAME)?;
        mem.store_u32(work.fmode(), Self::DEFAULT_FMODE)?;
        mem.store_u32(work.environ_var(), work.environ())?;
        Ok(work)
    }

    /// Fallback `argv` array: `{ "x", NULL }`.
    pub fn argv(&self) -> u32 {
        self.base + Self::ARGV0
    }

    /// Empty environment block.
    pub fn environ(&self) -> u32 {
        self.base + Self::ENV0
    }

    /// The `environ` variable, pointing to `environ()`.
    pub fn environ_var(&self) -> u32 {
        self.base + Self::ENVIRON
    }

    pub fn fmode(&self) -> u32 {
        self.base + Self::FMODE
    }

    /// Static `struct tm` returned by `localtime`.
    pub fn tm(&self) -> u32 {
        self.base + Self::TM
    }

    /// The `_iob` table of `FILE` structures.
    pub fn iob(&self) -> u32 {
        self.base + Self::IOB
    }
}

/// Host-side data of the guest process.
///
/// Everything the guest can't be trusted with (open host files, the heap's
/// block list) lives here, out of reach of the program.
#[derive(Debug)]
pub struct Process {
    files: FileTable,
    heap: Heap,
    work: WorkArea,
    main_args: MainArgs,
}

impl Process {
    /// Creates the runtime data and sets up the work area.
    ///
    /// If `main_args` is `None`, the program sees a single argument `"x"`.
    pub fn new<M: VirtualMemory>(
        mem: &mut M,
        layout: &Layout,
        main_args: Option<MainArgs>,
        io: Streams,
    ) -> Result<Self, MemoryError> {
        let work = WorkArea::create(mem, layout.work_area)?;
        let main_args = main_args.unwrap_or(MainArgs { argc: 1, argv: work.argv() });
        Ok(Self {
            files: FileTable::new(io, work.iob()),
            heap: Heap::new(layout.heap_base),
            work,
            main_args,
        })
    }

    pub fn work_area(&self) -> &WorkArea {
        &self.work
    }
}

/// Library call context.
///
/// All library functions are implemented as methods on this type, and an
/// instance is created whenever a trapped function is being called. This also
/// makes this type useful as a function index in the documentation.
#[derive(Debug)]
pub struct Syscall<'a, M: VirtualMemory> {
    process: &'a mut Process,
    mem: &'a mut M,
    cpu: &'a mut State,
    /// Address of the first variadic argument.
    varargs: u32,
}

impl<'a, M: VirtualMemory> Syscall<'a, M> {
    /// Reads a NUL-terminated string (without the terminator).
    fn string(&self, ptr: GuestPtr<u8>) -> Result<Vec<u8>, MemoryError> {
        self.mem.load_cstr(ptr.raw_addr(), u32::MAX)
    }

    /// Reads `len` bytes, failing before allocating anything if they're not
    /// all backed.
    fn bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        self.mem.check(addr, len as usize)?;
        let mut buf = vec![0; len as usize];
        self.mem.read(&mut buf, addr);
        Ok(buf)
    }
}

/// Reads `count` 32-bit stack arguments of a called function.
///
/// `[esp]` holds the return address, so the first argument is at `esp+4`.
pub fn stack_args<M: VirtualMemory>(state: &State, mem: &M, count: u32) -> Result<Vec<u32>, MemoryError> {
    let esp = state.esp();
    (1..=count)
        .map(|i| {
            let addr = esp
                .checked_add(4 * i)
                .ok_or(MemoryError::Wrap { addr: esp, size: 4 * (i as usize + 1) })?;
            mem.load_u32(addr)
        })
        .collect()
}
