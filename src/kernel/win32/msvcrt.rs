//! Start-up and environment functions of `msvcrt.dll`.
//!
//! The C library proper (`printf`, `strcmp`, ...) lives in `kernel::libc`.

use crate::cpu::interpret::HookError;
use crate::kernel::types::*;
use crate::kernel::Syscall;
use crate::memory::VirtualMemory;

impl<'a, M: VirtualMemory> Syscall<'a, M> {
    /// `__set_app_type`: console and GUI applications are treated the same.
    pub fn set_app_type(&mut self, (_kind,): (u32,)) -> Result<(), HookError> {
        Ok(())
    }

    /// `__getmainargs`: stores `argc`, `argv` and the (empty) environment.
    ///
    /// Returns -1 if one of the destinations can't be written.
    pub fn getmainargs(
        &mut self,
        (argc, argv, env, _expand_wildcards, _start_info): (GuestPtr<u32>, GuestPtr<u32>, GuestPtr<u32>, Int, u32),
    ) -> Result<i32, HookError> {
        let args = self.process.main_args;
        let environ = self.process.work_area().environ();
        let result = self
            .mem
            .store_u32(argc.raw_addr(), args.argc)
            .and_then(|()| self.mem.store_u32(argv.raw_addr(), args.argv))
            .and_then(|()| self.mem.store_u32(env.raw_addr(), environ));
        Ok(if result.is_ok() { 0 } else { -1 })
    }

    /// `__p__fmode`
    pub fn p_fmode(&mut self, (): ()) -> Result<GuestPtr<u32>, HookError> {
        Ok(GuestPtr::new(self.process.work_area().fmode()))
    }

    /// `__p__environ`
    pub fn p_environ(&mut self, (): ()) -> Result<GuestPtr<u32>, HookError> {
        Ok(GuestPtr::new(self.process.work_area().environ_var()))
    }

    /// Exit handlers are never run, so registering one trivially succeeds.
    pub fn atexit(&mut self, (_func,): (u32,)) -> Result<i32, HookError> {
        Ok(1)
    }

    /// `_cexit`
    pub fn cexit(&mut self, (): ()) -> Result<(), HookError> {
        Ok(())
    }

    pub fn exit(&mut self, (status,): (Int,)) -> Result<Exit, HookError> {
        self.process.files.flush(0);
        Ok(Exit(*status as u32))
    }

    /// There is no environment.
    pub fn getenv(&mut self, (_name,): (GuestPtr<u8>,)) -> Result<GuestPtr<u8>, HookError> {
        Ok(GuestPtr::NULL)
    }

    /// Locales can't be changed.
    pub fn setlocale(&mut self, (_category, _locale): (Int, GuestPtr<u8>)) -> Result<GuestPtr<u8>, HookError> {
        Ok(GuestPtr::NULL)
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::testing::Fixture;
    use crate::memory::VirtualMemory;
    use crate::kernel::types::*;

    #[test]
    fn getmainargs() {
        let mut fx = Fixture::new(b"");
        let out = fx.put(&[0xFF; 12]);
        let ptr = |offset: u32| GuestPtr::new(out + offset);
        let result = fx.syscall(0).getmainargs((ptr(0), ptr(4), ptr(8), Int(0), 0)).unwrap();
        assert_eq!(result, 0);

        let work = *fx.process.work_area();
        assert_eq!(fx.mem.load_u32(out).unwrap(), 1);
        assert_eq!(fx.mem.load_u32(out + 4).unwrap(), work.argv());
        assert_eq!(fx.mem.load_u32(out + 8).unwrap(), work.environ());

        let unmapped = GuestPtr::new(0x4000_0000);
        let result = fx.syscall(0).getmainargs((ptr(0), unmapped, ptr(8), Int(0), 0)).unwrap();
        assert_eq!(result, -1);
    }

    #[test]
    fn variables() {
        let mut fx = Fixture::new(b"");
        let work = *fx.process.work_area();
        assert_eq!(fx.syscall(0).p_fmode(()).unwrap().raw_addr(), work.fmode());
        let environ = fx.syscall(0).p_environ(()).unwrap();
        assert_eq!(fx.mem.load_u32(environ.raw_addr()).unwrap(), work.environ());
    }

    #[test]
    fn trivial_functions() {
        let mut fx = Fixture::new(b"");
        let name = fx.cstr("PATH");
        assert!(fx.syscall(0).getenv((name,)).unwrap().is_null());
        assert!(fx.syscall(0).setlocale((Int(0), name)).unwrap().is_null());
        assert_eq!(fx.syscall(0).atexit((0x1234,)).unwrap(), 1);
        assert_eq!(fx.syscall(0).exit((Int(3),)).unwrap(), Exit(3));
        assert_eq!(fx.syscall(0).exit((Int(-1),)).unwrap(), Exit(0xFFFF_FFFF));
    }
}
