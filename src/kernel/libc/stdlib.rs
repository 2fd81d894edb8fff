//! Heap management (`malloc`/`free`).

use crate::cpu::interpret::HookError;
use crate::kernel::types::*;
use crate::kernel::Syscall;
use crate::memory::VirtualMemory;

/// Allocation granularity of the heap.
const GRANULE: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    size: u32,
    used: bool,
}

/// A first-fit heap growing upwards from a base address.
///
/// The block list is kept on the host. Blocks are laid out back to back, so a
/// block's address is the base plus the sizes of all blocks before it. Guest
/// memory is only allocated when the heap grows past its current end, and is
/// never given back.
#[derive(Debug)]
pub struct Heap {
    base: u32,
    blocks: Vec<Block>,
}

impl Heap {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            blocks: Vec::new(),
        }
    }

    /// Allocates `size` bytes and returns their address, or 0 if the request
    /// can't be satisfied (or `size` is 0).
    pub fn alloc<M: VirtualMemory>(&mut self, mem: &mut M, size: u32) -> u32 {
        if size == 0 {
            return 0;
        }
        let size = match size.checked_add(GRANULE - 1) {
            Some(size) => size & !(GRANULE - 1),
            None => return 0,
        };

        let mut addr = u64::from(self.base);
        for i in 0..self.blocks.len() {
            let block = self.blocks[i].clone();
            if !block.used && block.size >= size {
                self.blocks[i] = Block { size, used: true };
                if block.size > size {
                    self.blocks.insert(i + 1, Block { size: block.size - size, used: false });
                }
                return addr as u32;
            }
            addr += u64::from(block.size);
        }

        if addr + u64::from(size) > 1 << 32 {
            debug!("heap exhausted ({} bytes requested)", size);
            return 0;
        }
        mem.allocate(addr as u32, size);
        self.blocks.push(Block { size, used: true });
        addr as u32
    }

    /// Releases the block starting at `addr` and merges it with the following
    /// block if that one is free as well.
    ///
    /// Returns `false` if `addr` is not the start of an allocated block.
    pub fn free(&mut self, addr: u32) -> bool {
        let mut start = u64::from(self.base);
        for i in 0..self.blocks.len() {
            if start == u64::from(addr) {
                if !self.blocks[i].used {
                    return false;
                }
                self.blocks[i].used = false;
                if self.blocks.get(i + 1).map_or(false, |next| !next.used) {
                    let next = self.blocks.remove(i + 1);
                    self.blocks[i].size += next.size;
                }
                return true;
            }
            start += u64::from(self.blocks[i].size);
        }
        false
    }
}

impl<'a, M: VirtualMemory> Syscall<'a, M> {
    pub fn malloc(&mut self, (size,): (u32,)) -> Result<GuestPtr<u8>, HookError> {
        Ok(GuestPtr::new(self.process.heap.alloc(&mut *self.mem, size)))
    }

    pub fn free(&mut self, (ptr,): (GuestPtr<u8>,)) -> Result<(), HookError> {
        if !ptr.is_null() && !self.process.heap.free(ptr.raw_addr()) {
            warn!("free of {:?}, which is not an allocated block", ptr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::Fixture;
    use crate::loader::Layout;
    use crate::memory::SparseMemory;

    const BASE: u32 = 0x6000_0000;

    #[test]
    fn first_fit_with_split() {
        let mut mem = SparseMemory::new();
        let mut heap = Heap::new(BASE);

        assert_eq!(heap.alloc(&mut mem, 0), 0);
        let a = heap.alloc(&mut mem, 1);
        let b = heap.alloc(&mut mem, 100);
        let c = heap.alloc(&mut mem, 64);
        assert_eq!((a, b, c), (BASE, BASE + 64, BASE + 192));
        assert!(mem.is_allocated(BASE, 256));
        assert!(!mem.is_allocated(BASE + 256, 1));

        // freeing `b` leaves a 128 byte hole that is reused and split
        assert!(heap.free(b));
        assert!(!heap.free(b));
        assert_eq!(heap.alloc(&mut mem, 10), BASE + 64);
        assert_eq!(heap.alloc(&mut mem, 64), BASE + 128);
        assert_eq!(heap.alloc(&mut mem, 1), BASE + 256);
        assert!(!heap.free(BASE + 1));
    }

    #[test]
    fn free_merges_with_successor() {
        let mut mem = SparseMemory::new();
        let mut heap = Heap::new(BASE);
        let a = heap.alloc(&mut mem, 64);
        let b = heap.alloc(&mut mem, 64);
        heap.alloc(&mut mem, 64);

        assert!(heap.free(b));
        assert!(heap.free(a));
        assert_eq!(heap.alloc(&mut mem, 128), BASE);
    }

    #[test]
    fn exhaustion() {
        let mut mem = SparseMemory::new();
        let mut heap = Heap::new(0xFFFF_FF00);
        assert_eq!(heap.alloc(&mut mem, 0xFFFF_FFF0), 0);
        assert_eq!(heap.alloc(&mut mem, 0x100), 0xFFFF_FF00);
        assert_eq!(heap.alloc(&mut mem, 1), 0);
    }

    #[test]
    fn malloc_and_free() {
        let mut fx = Fixture::new(b"");
        let base = Layout::default().heap_base;
        let p = fx.syscall(0).malloc((16,)).unwrap();
        assert_eq!(p.raw_addr(), base);
        fx.mem.store_u32(p.raw_addr(), 5).unwrap();
        assert!(fx.syscall(0).malloc((0,)).unwrap().is_null());
        fx.syscall(0).free((p,)).unwrap();
        fx.syscall(0).free((GuestPtr::NULL,)).unwrap();
        fx.syscall(0).free((GuestPtr::new(12),)).unwrap();
        assert_eq!(fx.syscall(0).malloc((8,)).unwrap().raw_addr(), base);
    }
}
