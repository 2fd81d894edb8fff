//! `<string.h>` functions operating on guest memory.
//!
//! All of them fail the call if a byte they need to touch is not allocated.

use crate::cpu::interpret::HookError;
use crate::kernel::types::*;
use crate::kernel::Syscall;
use crate::memory::VirtualMemory;

use std::cmp::Ordering;

impl<'a, M: VirtualMemory> Syscall<'a, M> {
    pub fn memcpy(&mut self, (dest, src, n): (GuestPtr<u8>, GuestPtr<u8>, u32)) -> Result<GuestPtr<u8>, HookError> {
        self.mem.check(dest.raw_addr(), n as usize)?;
        let data = self.bytes(src.raw_addr(), n)?;
        self.mem.write_checked(&data, dest.raw_addr())?;
        Ok(dest)
    }

    pub fn memset(&mut self, (dest, c, n): (GuestPtr<u8>, u32, u32)) -> Result<GuestPtr<u8>, HookError> {
        self.mem.check(dest.raw_addr(), n as usize)?;
        let data = vec![c as u8; n as usize];
        self.mem.write_checked(&data, dest.raw_addr())?;
        Ok(dest)
    }

    pub fn strcpy(&mut self, (dest, src): (GuestPtr<u8>, GuestPtr<u8>)) -> Result<GuestPtr<u8>, HookError> {
        let mut s = self.string(src)?;
        s.push(0);
        self.mem.write_checked(&s, dest.raw_addr())?;
        Ok(dest)
    }

    /// Copies at most `n` bytes and pads the rest of `dest` with zeros.
    pub fn strncpy(&mut self, (dest, src, n): (GuestPtr<u8>, GuestPtr<u8>, u32)) -> Result<GuestPtr<u8>, HookError> {
        self.mem.check(dest.raw_addr(), n as usize)?;
        let mut s = self.mem.load_cstr(src.raw_addr(), n)?;
        s.resize(n as usize, 0);
        self.mem.write_checked(&s, dest.raw_addr())?;
        Ok(dest)
    }

    pub fn strcmp(&mut self, (a, b): (GuestPtr<u8>, GuestPtr<u8>)) -> Result<i32, HookError> {
        self.compare(a, b, u32::MAX)
    }

    pub fn strncmp(&mut self, (a, b, n): (GuestPtr<u8>, GuestPtr<u8>, u32)) -> Result<i32, HookError> {
        self.compare(a, b, n)
    }

    /// Compares up to `n` characters as unsigned bytes. Returns -1, 0 or 1.
    fn compare(&self, a: GuestPtr<u8>, b: GuestPtr<u8>, n: u32) -> Result<i32, HookError> {
        for i in 0..n {
            let ca = self.mem.load(offset(a, i)?)?;
            let cb = self.mem.load(offset(b, i)?)?;
            match ca.cmp(&cb) {
                Ordering::Less => return Ok(-1),
                Ordering::Greater => return Ok(1),
                Ordering::Equal if ca == 0 => break,
                Ordering::Equal => {}
            }
        }
        Ok(0)
    }

    /// Finds the first occurrence of `c` (converted to a byte). Searching for
    /// 0 finds the terminator.
    pub fn strchr(&mut self, (s, c): (GuestPtr<u8>, u32)) -> Result<GuestPtr<u8>, HookError> {
        let c = c as u8;
        let string = self.string(s)?;
        let pos = if c == 0 {
            Some(string.len())
        } else {
            string.iter().position(|&b| b == c)
        };
        Ok(match pos {
            Some(pos) => GuestPtr::new(s.raw_addr() + pos as u32),
            None => GuestPtr::NULL,
        })
    }

    pub fn strlen(&mut self, (s,): (GuestPtr<u8>,)) -> Result<u32, HookError> {
        Ok(self.string(s)?.len() as u32)
    }
}

fn offset(ptr: GuestPtr<u8>, i: u32) -> Result<u32, HookError> {
    ptr.raw_addr()
        .checked_add(i)
        .ok_or_else(|| HookError::failed(format!("string at {:?} wraps the address space", ptr)))
}

#[cfg(test)]
mod tests {
    use crate::kernel::testing::Fixture;
    use crate::memory::VirtualMemory;
    use crate::kernel::types::GuestPtr;

    #[test]
    fn copies() {
        let mut fx = Fixture::new(b"");
        let src = fx.cstr("source");
        let dest = fx.cstr("............");

        assert_eq!(fx.syscall(0).strcpy((dest, src)).unwrap(), dest);
        assert_eq!(fx.read_cstr(dest.raw_addr()), "source");

        let dest = fx.cstr("............");
        fx.syscall(0).strncpy((dest, src, 3)).unwrap();
        assert_eq!(fx.read_cstr(dest.raw_addr()), "sou.........");
        fx.syscall(0).strncpy((dest, src, 10)).unwrap();
        assert_eq!(fx.mem.load_cstr(dest.raw_addr(), 12).unwrap(), b"source");
        assert_eq!(fx.mem.load_u32(dest.raw_addr() + 6).unwrap(), 0);
        assert_eq!(fx.read_cstr(dest.raw_addr() + 10), "..");

        let dest = fx.cstr("........");
        fx.syscall(0).memcpy((dest, src, 4)).unwrap();
        fx.syscall(0).memset((GuestPtr::new(dest.raw_addr() + 4), u32::from(b'-'), 2)).unwrap();
        assert_eq!(fx.read_cstr(dest.raw_addr()), "sour--..");

        let unmapped = GuestPtr::new(0x4000_0000);
        assert!(fx.syscall(0).memcpy((unmapped, src, 4)).is_err());
        assert!(fx.syscall(0).memcpy((dest, unmapped, 4)).is_err());
        assert!(fx.syscall(0).strcpy((unmapped, src)).is_err());
        assert_eq!(fx.read_cstr(dest.raw_addr()), "sour--..");
    }

    #[test]
    fn comparisons() {
        let mut fx = Fixture::new(b"");
        let apple = fx.cstr("apple");
        let apply = fx.cstr("apply");
        let app = fx.cstr("app");
        let high = fx.put(&[0xE9, 0]);

        assert_eq!(fx.syscall(0).strcmp((apple, apply)).unwrap(), -1);
        assert_eq!(fx.syscall(0).strcmp((apply, apple)).unwrap(), 1);
        assert_eq!(fx.syscall(0).strcmp((apple, apple)).unwrap(), 0);
        assert_eq!(fx.syscall(0).strcmp((app, apple)).unwrap(), -1);
        assert_eq!(fx.syscall(0).strcmp((GuestPtr::new(high), apple)).unwrap(), 1);
        assert_eq!(fx.syscall(0).strncmp((apple, apply, 4)).unwrap(), 0);
        assert_eq!(fx.syscall(0).strncmp((apple, apply, 5)).unwrap(), -1);
        assert_eq!(fx.syscall(0).strncmp((apple, GuestPtr::new(0x4000_0000), 0)).unwrap(), 0);
        assert!(fx.syscall(0).strcmp((apple, GuestPtr::new(0x4000_0000))).is_err());
    }

    #[test]
    fn searching() {
        let mut fx = Fixture::new(b"");
        let s = fx.cstr("hello");
        let addr = s.raw_addr();
        assert_eq!(fx.syscall(0).strlen((s,)).unwrap(), 5);
        assert_eq!(fx.syscall(0).strchr((s, u32::from(b'l'))).unwrap().raw_addr(), addr + 2);
        assert_eq!(fx.syscall(0).strchr((s, 0)).unwrap().raw_addr(), addr + 5);
        assert!(fx.syscall(0).strchr((s, u32::from(b'z'))).unwrap().is_null());
        assert!(fx.syscall(0).strlen((GuestPtr::new(0x4000_0000),)).is_err());
    }
}
