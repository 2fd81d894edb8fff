//! xv6 system call gate.
//!
//! Programs built for xv6 enter the kernel with `int 0x40`, the call number in
//! `eax`. The arguments are those of the calling user-space stub, so they are
//! found at `esp+4`, `esp+8`, ... (`[esp]` is the stub's return address). The
//! result is returned in `eax`.

use crate::cpu::interpret::{HookAction, HookError, Hooks};
use crate::cpu::State;
use crate::kernel::types::*;
use crate::kernel::{stack_args, Streams};
use crate::memory::VirtualMemory;

use std::io::{Read, Write};

/// Implements the xv6 system calls on top of the host's streams.
///
/// Only the calls needed by simple filters are supported: `exit`, `read` from
/// standard input and `write` to standard output or error. Anything else
/// fails with -1.
#[derive(Debug)]
pub struct Xv6 {
    io: Streams,
}

impl Xv6 {
    pub fn new(io: Streams) -> Self {
        Self { io }
    }

    fn exit(&mut self, _mem: &mut impl VirtualMemory, (): ()) -> Exit {
        Exit(0)
    }

    /// Reads up to `n` bytes from `fd` 0. Only returns early at the end of the
    /// input.
    fn read(&mut self, mem: &mut impl VirtualMemory, (fd, buf, n): (Int, GuestPtr<u8>, u32)) -> i32 {
        if *fd != 0 {
            return -1;
        }

        let mut data = Vec::new();
        if let Err(e) = Read::take(self.io.stdin(), u64::from(n)).read_to_end(&mut data) {
            debug!("read from stdin failed: {}", e);
            return -1;
        }
        match mem.write_checked(&data, buf.raw_addr()) {
            Ok(()) => data.len() as i32,
            Err(_) => -1,
        }
    }

    fn write(&mut self, mem: &mut impl VirtualMemory, (fd, buf, n): (Int, GuestPtr<u8>, u32)) -> i32 {
        if mem.check(buf.raw_addr(), n as usize).is_err() {
            return -1;
        }
        let out = match *fd {
            1 => self.io.stdout(),
            2 => self.io.stderr(),
            _ => return -1,
        };
        let mut data = vec![0; n as usize];
        mem.read(&mut data, buf.raw_addr());
        match out.write_all(&data).and_then(|()| out.flush()) {
            Ok(()) => n as i32,
            Err(e) => {
                debug!("write to fd {} failed: {}", *fd, e);
                -1
            }
        }
    }
}

impl<M: VirtualMemory> Hooks<M> for Xv6 {
    fn syscall(&mut self, state: &mut State, mem: &mut M) -> Result<HookAction, HookError> {
        let num = state.eax();

        macro_rules! dispatch {
            ( $( $num:tt => $func:ident / $arity:tt, )* ) => {
                match num {
                    $( $num => {
                        let raw = match stack_args(state, mem, $arity) {
                            Ok(raw) => raw,
                            Err(e) => {
                                debug!("{}: cannot fetch arguments: {}", stringify!($func), e);
                                state.set_eax(-1i32 as u32);
                                return Ok(HookAction::CONTINUE);
                            }
                        };
                        let args = FromRawArgs::from_args(&raw);
                        debug!("{}{:?}", stringify!($func), args);
                        self.$func(mem, args).complete(state)
                    } )*
                    _ => {
                        warn!("unknown xv6 system call {}", num);
                        (-1i32).complete(state)
                    }
                }
            };
        }

        let completion = dispatch! {
            2 => exit / 0,
            5 => read / 3,
            16 => write / 3,
        };

        Ok(match completion {
            Completion::Return => HookAction::CONTINUE,
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

    const STACK_TOP: u32 = 0x1000;
    const BUF: u32 = 0x2000;

    fn setup(input: &[u8]) -> (Xv6, SparseMemory, State, SharedBuf, SharedBuf) {
        let (io, out, err) = streams(input);
        let mut mem = SparseMemory::new();
        mem.allocate(0, STACK_TOP);
        mem.allocate(BUF, 16);
        (Xv6::new(io), mem, State::new(0, STACK_TOP - 16), out, err)
    }

    /// Performs system call `num` with three arguments.
    fn call(xv6: &mut Xv6, mem: &mut SparseMemory, state: &mut State, num: u32, args: [u32; 3]) -> HookAction {
        let esp = state.esp();
        for (i, arg) in args.iter().enumerate() {
            mem.store_u32(esp + 4 + 4 * i as u32, *arg).unwrap();
        }
        state.set_eax(num);
        xv6.syscall(state, mem).unwrap()
    }

    #[test]
    fn write_to_standard_streams() {
        let (mut xv6, mut mem, mut state, out, err) = setup(b"");
        mem.write_checked(b"hello", BUF).unwrap();

        assert_eq!(call(&mut xv6, &mut mem, &mut state, 16, [1, BUF, 5]), HookAction::CONTINUE);
        assert_eq!(state.eax(), 5);
        call(&mut xv6, &mut mem, &mut state, 16, [2, BUF, 4]);
        assert_eq!(state.eax(), 4);
        assert_eq!(out.contents(), "hello");
        assert_eq!(err.contents(), "hell");

        call(&mut xv6, &mut mem, &mut state, 16, [3, BUF, 5]);
        assert_eq!(state.eax() as i32, -1);
        call(&mut xv6, &mut mem, &mut state, 16, [1, BUF + 0xFFC, 8]);
        assert_eq!(state.eax() as i32, -1);
        assert_eq!(out.contents(), "hello");
    }

    #[test]
    fn read_from_stdin() {
        let (mut xv6, mut mem, mut state, _, _) = setup(b"abcdef");

        call(&mut xv6, &mut mem, &mut state, 5, [0, BUF, 4]);
        assert_eq!(state.eax(), 4);
        call(&mut xv6, &mut mem, &mut state, 5, [0, BUF + 4, 10]);
        assert_eq!(state.eax(), 2);
        assert_eq!(mem.load_cstr(BUF, 16).unwrap(), b"abcdef");
        call(&mut xv6, &mut mem, &mut state, 5, [0, BUF, 10]);
        assert_eq!(state.eax(), 0);

        call(&mut xv6, &mut mem, &mut state, 5, [1, BUF, 1]);
        assert_eq!(state.eax() as i32, -1);
    }

    #[test]
    fn read_into_unallocated_buffer() {
        let (mut xv6, mut mem, mut state, _, _) = setup(b"0123456789ABCDEFGHIJ");
        // the buffer runs off the end of its page
        call(&mut xv6, &mut mem, &mut state, 5, [0, BUF + 0xFF8, 12]);
        assert_eq!(state.eax() as i32, -1);
        assert_eq!(mem.load(BUF + 0xFF8).unwrap(), 0);
    }

    #[test]
    fn exit_and_unknown_calls() {
        let (mut xv6, mut mem, mut state, _, _) = setup(b"");
        assert_eq!(call(&mut xv6, &mut mem, &mut state, 2, [0; 3]), HookAction::Exit(0));
        assert_eq!(call(&mut xv6, &mut mem, &mut state, 99, [0; 3]), HookAction::CONTINUE);
        assert_eq!(state.eax() as i32, -1);

        // arguments beyond the stack
        state.set_esp(STACK_TOP - 8);
        state.set_eax(16);
        assert_eq!(xv6.syscall(&mut state, &mut mem).unwrap(), HookAction::CONTINUE);
        assert_eq!(state.eax() as i32, -1);
    }

    #[test]
    fn hello_world_program() {
        let (io, out, _) = streams(b"");
        let mut mem = SparseMemory::new();
        mem.allocate(0, 0x100);
        mem.allocate(0x1000, 0x1000);
        // push 3; push 0x40; push 1; push 0 (fake return address)
        // mov eax, 16; int 0x40; mov eax, 2; int 0x40
        let code = [
            0x6A, 0x03, 0x6A, 0x40, 0x6A, 0x01, 0x6A, 0x00,
            0xB8, 0x10, 0x00, 0x00, 0x00, 0xCD, 0x40,
            0xB8, 0x02, 0x00, 0x00, 0x00, 0xCD, 0x40,
        ];
        mem.write_checked(&code, 0).unwrap();
        mem.write_checked(b"hi\n", 0x40).unwrap();

        let mut interp = Interpreter::new(mem, Xv6::new(io), 0, 0x2000);
        assert_eq!(interp.run().unwrap(), Status::Exited(0));
        assert_eq!(out.contents(), "hi\n");
    }
}
