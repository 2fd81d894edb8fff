//! Runtime for PE images importing functions from Windows libraries.
//!
//! The image's imports are bound to "thunks": addresses in a trapped range
//! that hold no code. When the program calls one, the interpreter hands the
//! call to `Win32`, which looks up the library function, runs it on the host
//! and returns to the caller.

mod kernel32;
mod libintl;
mod msvcrt;
pub mod table;

use self::table::{Export, ExportKind, Variable};
use crate::cpu::interpret::{HookAction, HookError, Hooks};
use crate::cpu::State;
use crate::kernel::types::*;
use crate::kernel::{stack_args, MainArgs, Process, Streams, Syscall};
use crate::loader::{Import, Layout, Symbol};
use crate::memory::{MemoryError, VirtualMemory};

/// An import of the image together with what it resolved to.
#[derive(Debug)]
struct Binding {
    import: Import,
    export: Option<&'static Export>,
}

/// The PE import runtime.
#[derive(Debug)]
pub struct Win32 {
    process: Process,
    bindings: Vec<Binding>,
    thunk_base: u32,
}

impl Win32 {
    /// Sets up the runtime's work area and binds `imports`.
    ///
    /// Each import's IAT slot is overwritten with the address of its thunk,
    /// or with the address of the variable for imported data. Imports that
    /// are unknown are still bound, and fail only when they're called.
    pub fn new<M: VirtualMemory>(
        mem: &mut M,
        imports: &[Import],
        layout: &Layout,
        main_args: Option<MainArgs>,
        io: Streams,
    ) -> Result<Self, MemoryError> {
        let thunk_base = layout.thunk_base;
        let thunks_size = imports.len().saturating_mul(4);
        if u64::from(thunk_base) + thunks_size as u64 > 1 << 32 {
            return Err(MemoryError::Wrap { addr: thunk_base, size: thunks_size });
        }

        let process = Process::new(mem, layout, main_args, io)?;
        let mut bindings = Vec::with_capacity(imports.len());
        let mut unknown = 0;
        for (i, import) in imports.iter().enumerate() {
            let export = match &import.symbol {
                Symbol::Name(name) => table::find(&import.dll, name),
                Symbol::Ordinal(_) => None,
            };

            let value = match export.map(|export| export.kind) {
                Some(ExportKind::Variable(Variable::Iob)) => process.work_area().iob(),
                _ => thunk_base + 4 * i as u32,
            };
            if export.is_none() {
                debug!("{} is not implemented", import);
                unknown += 1;
            }
            trace!("{} -> {:#010X} (IAT slot {:#010X})", import, value, import.iat);
            mem.store_u32(import.iat, value)?;

            bindings.push(Binding { import: import.clone(), export });
        }
        info!("bound {} imports ({} unimplemented)", imports.len(), unknown);

        Ok(Self {
            process,
            bindings,
            thunk_base,
        })
    }

    /// Address range of the thunks, as `(start, length in bytes)`.
    pub fn thunks(&self) -> (u32, u32) {
        (self.thunk_base, 4 * self.bindings.len() as u32)
    }
}

/// Finds the binding whose thunk is at `addr`.
fn lookup(bindings: &[Binding], thunk_base: u32, addr: u32) -> Option<&Binding> {
    let offset = addr.checked_sub(thunk_base)?;
    if offset % 4 != 0 {
        return None;
    }
    bindings.get((offset / 4) as usize)
}

/// Dispatches calls to the thunks of bound imports.
impl<M: VirtualMemory> Hooks<M> for Win32 {
    fn is_trapped(&self, addr: u32) -> bool {
        let (start, len) = self.thunks();
        addr.wrapping_sub(start) < len
    }

    fn import_call(&mut self, addr: u32, state: &mut State, mem: &mut M) -> Result<HookAction, HookError> {
        let binding = lookup(&self.bindings, self.thunk_base, addr).ok_or(HookError::NoImport(addr))?;
        let import = &binding.import;
        let name = match &import.symbol {
            Symbol::Name(name) => name.as_str(),
            Symbol::Ordinal(_) => {
                error!("{} called, but imports by ordinal are not supported", import);
                return Err(HookError::failed(format!("{} called (import by ordinal)", import)));
            }
        };
        let (abi, arity) = match binding.export.map(|export| export.kind) {
            Some(ExportKind::Function { abi, arity }) => (abi, arity),
            Some(ExportKind::Variable(_)) => {
                return Err(HookError::failed(format!("variable {} called", import)));
            }
            None => {
                error!("unimplemented function {} called", import);
                return Err(HookError::failed(format!("unimplemented function {} called", import)));
            }
        };

        // `[esp]` is the return address, the variadic part follows the fixed
        // arguments
        let raw = stack_args(state, mem, arity)?;
        let varargs = state.esp().wrapping_add(4 + 4 * arity);
        let mut syscall = Syscall {
            process: &mut self.process,
            mem,
            cpu: state,
            varargs,
        };

        macro_rules! dispatch {
            ( $( $name:tt => $func:ident, )* ) => {
                match name {
                    $( $name => {
                        let args = FromRawArgs::from_args(&raw);
                        debug!("{}{:?}", $name, args);
                        syscall.$func(args)?.complete(&mut *syscall.cpu)
                    } )*
                    _ => return Err(HookError::failed(format!("no implementation of {}", name))),
                }
            };
        }

        let completion = dispatch! {
            // msvcrt.dll
            "__set_app_type" => set_app_type,
            "__getmainargs" => getmainargs,
            "__p__fmode" => p_fmode,
            "__p__environ" => p_environ,
            "atexit" => atexit,
            "_cexit" => cexit,
            "exit" => exit,
            "getenv" => getenv,
            "setlocale" => setlocale,
            "_flsbuf" => flsbuf,
            "puts" => puts,
            "fputs" => fputs,
            "printf" => printf,
            "fprintf" => fprintf,
            "vfprintf" => vfprintf,
            "sprintf" => sprintf,
            "fopen" => fopen,
            "fclose" => fclose,
            "fflush" => fflush,
            "fread" => fread,
            "strchr" => strchr,
            "strcmp" => strcmp,
            "strncmp" => strncmp,
            "strlen" => strlen,
            "strcpy" => strcpy,
            "strncpy" => strncpy,
            "memcpy" => memcpy,
            "memset" => memset,
            "malloc" => malloc,
            "free" => free,
            "localtime" => localtime,
            "strftime" => strftime,
            // kernel32.dll
            "SetUnhandledExceptionFilter" => set_unhandled_exception_filter,
            "GetModuleHandleA" => get_module_handle_a,
            "ExitProcess" => exit_process,
            // libintl3.dll
            "libintl_bindtextdomain" => bindtextdomain,
            "libintl_textdomain" => textdomain,
            "libintl_gettext" => gettext,
        };

        Ok(match completion {
            Completion::Return => HookAction::Continue {
                pop: abi.callee_pops(arity),
            },
            Completion::Exit(code) => HookAction::Exit(code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::interpret::{Interpreter, Status};
    use crate::cpu::ExecutionEngine;
    use crate::kernel::testing::{streams, SharedBuf};
    use crate::memory::SparseMemory;

    const IAT: u32 = 0x3000;
    const STACK_TOP: u32 = 0x10_0000;

    fn import(dll: &str, symbol: Symbol, slot: u32) -> Import {
        Import {
            dll: dll.to_string(),
            symbol,
            iat: IAT + 4 * slot,
        }
    }

    fn name(name: &str) -> Symbol {
        Symbol::Name(name.to_string())
    }

    fn imports() -> Vec<Import> {
        vec![
            import("MSVCRT.dll", name("printf"), 0),
            import("KERNEL32.dll", name("ExitProcess"), 1),
            import("msvcrt.dll", name("_iob"), 2),
            import("user32.dll", name("MessageBoxA"), 3),
            import("msvcrt.dll", Symbol::Ordinal(12), 4),
            import("kernel32.dll", name("SetUnhandledExceptionFilter"), 5),
        ]
    }

    fn setup() -> (Win32, SparseMemory, SharedBuf) {
        let mut mem = SparseMemory::new();
        mem.allocate(0, 0x4000);
        mem.allocate(STACK_TOP - 0x1000, 0x1000);
        let (io, out, _) = streams(b"");
        let win32 = Win32::new(&mut mem, &imports(), &Layout::default(), None, io).unwrap();
        (win32, mem, out)
    }

    /// Sets up a call to the thunk of import `slot` with the given stack
    /// arguments, and returns the hook's result.
    fn call(win32: &mut Win32, mem: &mut SparseMemory, state: &mut State, slot: u32, args: &[u32]) -> Result<HookAction, HookError> {
        let esp = STACK_TOP - 0x100;
        state.set_esp(esp);
        mem.store_u32(esp, 0x1234).unwrap();
        for (i, arg) in args.iter().enumerate() {
            mem.store_u32(esp + 4 + 4 * i as u32, *arg).unwrap();
        }
        let thunk = mem.load_u32(IAT + 4 * slot).unwrap();
        assert!(Hooks::<SparseMemory>::is_trapped(win32, thunk));
        win32.import_call(thunk, state, mem)
    }

    #[test]
    fn binds_imports() {
        let (win32, mem, _) = setup();
        let base = Layout::default().thunk_base;
        assert_eq!(mem.load_u32(IAT).unwrap(), base);
        assert_eq!(mem.load_u32(IAT + 4).unwrap(), base + 4);
        assert_eq!(mem.load_u32(IAT + 8).unwrap(), win32.process.work_area().iob());
        assert_eq!(mem.load_u32(IAT + 12).unwrap(), base + 12);
        assert_eq!(win32.thunks(), (base, 24));

        let hooks: &dyn Hooks<SparseMemory> = &win32;
        assert!(hooks.is_trapped(base));
        assert!(hooks.is_trapped(base + 20));
        assert!(!hooks.is_trapped(base + 24));
        assert!(!hooks.is_trapped(base - 4));
    }

    #[test]
    fn unwritable_iat() {
        let mut mem = SparseMemory::new();
        let (io, _, _) = streams(b"");
        let err = Win32::new(&mut mem, &imports(), &Layout::default(), None, io).unwrap_err();
        assert_eq!(err, MemoryError::Unmapped { addr: IAT, size: 4 });
    }

    #[test]
    fn calling_conventions() {
        let (mut win32, mut mem, out) = setup();
        let mut state = State::new(0, 0);

        mem.write_checked(b"%d-%s\0", 0x100).unwrap();
        mem.write_checked(b"ok\0", 0x200).unwrap();
        let action = call(&mut win32, &mut mem, &mut state, 0, &[0x100, 42, 0x200]).unwrap();
        assert_eq!(action, HookAction::Continue { pop: 0 });
        assert_eq!(state.eax(), 5);
        assert_eq!(out.contents(), "42-ok");

        state.set_eax(0xDEAD);
        let action = call(&mut win32, &mut mem, &mut state, 5, &[0x5000]).unwrap();
        assert_eq!(action, HookAction::Continue { pop: 4 });
        assert_eq!(state.eax(), 0);

        let action = call(&mut win32, &mut mem, &mut state, 1, &[9]).unwrap();
        assert_eq!(action, HookAction::Exit(9));
    }

    #[test]
    fn unsupported_imports() {
        let (mut win32, mut mem, _) = setup();
        let mut state = State::new(0, 0);
        assert!(call(&mut win32, &mut mem, &mut state, 3, &[]).is_err());
        assert!(call(&mut win32, &mut mem, &mut state, 4, &[]).is_err());

        let base = Layout::default().thunk_base;
        let err = win32.import_call(base + 2, &mut state, &mut mem).unwrap_err();
        assert_eq!(err, HookError::NoImport(base + 2));
    }

    #[test]
    fn runs_program() {
        let (win32, mut mem, out) = setup();
        mem.write_checked(b"n=%d\n\0", 0x2000).unwrap();
        let code = [
            0x6A, 0x05, // push 5
            0x68, 0x00, 0x20, 0x00, 0x00, // push 0x2000
            0xFF, 0x15, 0x00, 0x30, 0x00, 0x00, // call [IAT+0] (printf)
            0x83, 0xC4, 0x08, // add esp, 8
            0x6A, 0x07, // push 7
            0xFF, 0x15, 0x04, 0x30, 0x00, 0x00, // call [IAT+4] (ExitProcess)
        ];
        mem.write_checked(&code, 0x1000).unwrap();

        let mut interp = Interpreter::new(mem, win32, 0x1000, STACK_TOP);
        assert_eq!(interp.run().unwrap(), Status::Exited(7));
        assert_eq!(out.contents(), "n=5\n");
    }
}
