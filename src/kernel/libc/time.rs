//! `<time.h>` functions.
//!
//! The guest always sees the same point in time, which keeps runs
//! reproducible.

use crate::cpu::interpret::HookError;
use crate::kernel::types::*;
use crate::kernel::Syscall;
use crate::memory::VirtualMemory;

/// Fields of the `struct tm` returned by `localtime`: 2000-01-01 03:34:00.
const FIXED_TM: [u32; 9] = [
    0,   // tm_sec
    34,  // tm_min
    3,   // tm_hour
    1,   // tm_mday
    0,   // tm_mon
    100, // tm_year
    0,   // tm_wday
    0,   // tm_yday
    0,   // tm_isdst
];

impl<'a, M: VirtualMemory> Syscall<'a, M> {
    /// Returns a pointer to a static `struct tm`, or NULL if `timer` can't be
    /// read.
    pub fn localtime(&mut self, (timer,): (GuestPtr<u32>,)) -> Result<GuestPtr<Tm>, HookError> {
        if self.mem.load_u32(timer.raw_addr()).is_err() {
            return Ok(GuestPtr::NULL);
        }
        let tm = self.process.work_area().tm();
        for (i, field) in FIXED_TM.iter().enumerate() {
            self.mem.store_u32(tm + 4 * i as u32, *field)?;
        }
        Ok(GuestPtr::new(tm))
    }

    /// Copies the format string without expanding any conversions.
    ///
    /// Returns the number of bytes written (excluding the terminator), or 0
    /// if the result does not fit in `max` bytes.
    pub fn strftime(&mut self, (dest, max, format, _tm): (GuestPtr<u8>, u32, GuestPtr<u8>, GuestPtr<Tm>)) -> Result<u32, HookError> {
        self.mem.check(dest.raw_addr(), max as usize)?;
        let mut out = self.string(format)?;
        if out.len() >= max as usize {
            return Ok(0);
        }
        let len = out.len() as u32;
        out.push(0);
        self.mem.write_checked(&out, dest.raw_addr())?;
        Ok(len)
    }
}
