//! Sparse virtual memory for the guest's 32-bit address space.
//!
//! The guest can address 4 GiB, but programs only ever touch a few MiB of it.
//! Backing the whole space with host memory is wasteful, so memory is split
//! into 4 KiB pages that are only materialized when a loader or runtime
//! collaborator explicitly allocates them. Nothing executed by the guest ever
//! allocates memory implicitly.
//!
//! Pages are found through a two-level table indexed by fixed bit fields of the
//! address:
//!
//! ```notrust
//! 31          22 21          12 11           0
//! +-------------+--------------+-------------+
//! | table index | page index   | page offset |
//! +-------------+--------------+-------------+
//! ```
//!
//! The raw `read`/`write` methods are deliberately lax: bytes in unbacked pages
//! read as zero and writes to them are dropped. Everything the CPU does goes
//! through the checked helpers (`load`, `store_u32`, ...) instead, which fail
//! with a `MemoryError` when any byte of the access is not backed.

use generational_arena::{Arena, Index};

use std::fmt;
use std::error::Error;

const PAGE_BITS: u32 = 12;
const TABLE_BITS: u32 = 10;

/// Size of a single backing page in bytes.
pub const PAGE_SIZE: u32 = 1 << PAGE_BITS;

const TABLE_ENTRIES: usize = 1 << TABLE_BITS;
const ADDRESS_SPACE: u64 = 1 << 32;

type Page = [u8; PAGE_SIZE as usize];
type Table = [Option<Index>; TABLE_ENTRIES];

/// Interface of the guest's byte-addressable memory.
pub trait VirtualMemory {
    /// Backs `[addr, addr+size)` with zero-initialized memory.
    ///
    /// Bytes that are already backed keep their contents.
    fn allocate(&mut self, addr: u32, size: u32);

    /// Releases every page that lies completely inside `[addr, addr+size)`.
    ///
    /// Pages only partially covered by the range are left untouched.
    fn deallocate(&mut self, addr: u32, size: u32);

    /// Returns whether every byte in `[addr, addr+size)` is backed.
    ///
    /// An empty range is always allocated.
    fn is_allocated(&self, addr: u32, size: u32) -> bool;

    /// Copies guest memory starting at `addr` into `dest`.
    ///
    /// Bytes in unbacked pages read as 0. The range is truncated at the top of
    /// the address space; bytes of `dest` beyond it are left unchanged.
    fn read(&self, dest: &mut [u8], addr: u32);

    /// Copies `src` into guest memory starting at `addr`.
    ///
    /// Writes to unbacked pages are silently dropped. The range is truncated at
    /// the top of the address space.
    fn write(&mut self, src: &[u8], addr: u32);

    /// Checks that an access of `size` bytes at `addr` neither wraps around
    /// the address space nor touches unbacked memory.
    fn check(&self, addr: u32, size: usize) -> Result<(), MemoryError> {
        if size as u64 > ADDRESS_SPACE - u64::from(addr) {
            return Err(MemoryError::Wrap { addr, size });
        }
        if !self.is_allocated(addr, size as u32) {
            return Err(MemoryError::Unmapped { addr, size });
        }
        Ok(())
    }

    /// Reads `dest.len()` bytes, failing if any of them is not backed.
    fn read_checked(&self, dest: &mut [u8], addr: u32) -> Result<(), MemoryError> {
        self.check(addr, dest.len())?;
        self.read(dest, addr);
        Ok(())
    }

    /// Writes all of `src`, failing (without writing anything) if any target
    /// byte is not backed.
    fn write_checked(&mut self, src: &[u8], addr: u32) -> Result<(), MemoryError> {
        self.check(addr, src.len())?;
        self.write(src, addr);
        Ok(())
    }

    fn load(&self, addr: u32) -> Result<u8, MemoryError> {
        let mut buf = [0; 1];
        self.read_checked(&mut buf, addr)?;
        Ok(buf[0])
    }

    fn load_u16(&self, addr: u32) -> Result<u16, MemoryError> {
        let mut buf = [0; 2];
        self.read_checked(&mut buf, addr)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn load_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read_checked(&mut buf, addr)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn store(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.write_checked(&[value], addr)
    }

    fn store_u16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write_checked(&value.to_le_bytes(), addr)
    }

    fn store_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_checked(&value.to_le_bytes(), addr)
    }

    /// Reads a NUL-terminated string of at most `max` bytes (excluding the
    /// terminator).
    ///
    /// Every byte up to and including the terminator must be backed. If no
    /// terminator is found within `max` bytes, the first `max` bytes are
    /// returned.
    fn load_cstr(&self, addr: u32, max: u32) -> Result<Vec<u8>, MemoryError> {
        let mut s = Vec::new();
        for i in 0..max {
            let addr = addr.checked_add(i).ok_or(MemoryError::Wrap { addr, size: i as usize + 1 })?;
            match self.load(addr)? {
                0 => break,
                b => s.push(b),
            }
        }
        Ok(s)
    }
}

/// Sparse page-table backed memory.
///
/// Page buffers live in an arena; the two-level table stores arena indices.
/// An outer slot is only populated once a page inside its 4 MiB region is
/// allocated and is dropped again when its last page is released.
pub struct SparseMemory {
    pages: Arena<Box<Page>>,
    tables: Vec<Option<Box<Table>>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self {
            pages: Arena::new(),
            tables: (0..TABLE_ENTRIES).map(|_| None).collect(),
        }
    }

    /// Returns the number of pages currently backed by host memory.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    fn page_index(&self, addr: u32) -> Option<Index> {
        let (outer, inner) = split(addr);
        self.tables[outer].as_ref().and_then(|table| table[inner])
    }

    fn page(&self, addr: u32) -> Option<&Page> {
        self.page_index(addr).and_then(|idx| self.pages.get(idx)).map(|page| &**page)
    }

    fn page_mut(&mut self, addr: u32) -> Option<&mut Page> {
        let idx = self.page_index(addr)?;
        self.pages.get_mut(idx).map(|page| &mut **page)
    }
}

impl Default for SparseMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SparseMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SparseMemory")
            .field("resident_pages", &self.pages.len())
            .field("tables", &self.tables.iter().filter(|t| t.is_some()).count())
            .finish()
    }
}

impl VirtualMemory for SparseMemory {
    fn allocate(&mut self, addr: u32, size: u32) {
        for chunk in chunks(addr, size.into()) {
            let (outer, inner) = split(chunk.addr);
            let table = self.tables[outer].get_or_insert_with(|| Box::new([None; TABLE_ENTRIES]));
            if table[inner].is_none() {
                table[inner] = Some(self.pages.insert(Box::new([0; PAGE_SIZE as usize])));
            }
        }
    }

    fn deallocate(&mut self, addr: u32, size: u32) {
        let end = u64::from(addr) + clamp(addr, size.into());
        let mut page = (u64::from(addr) + u64::from(PAGE_SIZE) - 1) & !u64::from(PAGE_SIZE - 1);
        while page + u64::from(PAGE_SIZE) <= end {
            let (outer, inner) = split(page as u32);
            if let Some(table) = &mut self.tables[outer] {
                if let Some(idx) = table[inner].take() {
                    self.pages.remove(idx);
                }
                if table.iter().all(Option::is_none) {
                    self.tables[outer] = None;
                }
            }
            page += u64::from(PAGE_SIZE);
        }
    }

    fn is_allocated(&self, addr: u32, size: u32) -> bool {
        chunks(addr, size.into()).all(|chunk| self.page_index(chunk.addr).is_some())
    }

    fn read(&self, dest: &mut [u8], addr: u32) {
        let mut pos = 0;
        for chunk in chunks(addr, dest.len() as u64) {
            let dest = &mut dest[pos..pos + chunk.len];
            match self.page(chunk.addr) {
                Some(page) => dest.copy_from_slice(&page[chunk.offset..chunk.offset + chunk.len]),
                None => dest.iter_mut().for_each(|b| *b = 0),
            }
            pos += chunk.len;
        }
    }

    fn write(&mut self, src: &[u8], addr: u32) {
        let mut pos = 0;
        for chunk in chunks(addr, src.len() as u64) {
            if let Some(page) = self.page_mut(chunk.addr) {
                page[chunk.offset..chunk.offset + chunk.len].copy_from_slice(&src[pos..pos + chunk.len]);
            }
            pos += chunk.len;
        }
    }
}

/// Splits an address into outer table and page table indices.
fn split(addr: u32) -> (usize, usize) {
    (
        (addr >> (PAGE_BITS + TABLE_BITS)) as usize,
        (addr >> PAGE_BITS) as usize & (TABLE_ENTRIES - 1),
    )
}

/// Truncates `size` so that `addr + size - 1` does not exceed `0xFFFF_FFFF`.
fn clamp(addr: u32, size: u64) -> u64 {
    size.min(ADDRESS_SPACE - u64::from(addr))
}

/// The part of an access that falls into a single page.
#[derive(Debug)]
struct Chunk {
    addr: u32,
    offset: usize,
    len: usize,
}

/// Iterator splitting an address range at page boundaries.
struct Chunks {
    pos: u64,
    end: u64,
}

fn chunks(addr: u32, size: u64) -> Chunks {
    Chunks {
        pos: addr.into(),
        end: u64::from(addr) + clamp(addr, size),
    }
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.pos >= self.end {
            return None;
        }

        let offset = (self.pos & u64::from(PAGE_SIZE - 1)) as usize;
        let len = (self.end - self.pos).min(u64::from(PAGE_SIZE) - offset as u64) as usize;
        let chunk = Chunk { addr: self.pos as u32, offset, len };
        self.pos += len as u64;
        Some(chunk)
    }
}

/// An error that can occur when reading or writing guest memory.
///
/// Any of these is fatal for the running program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// At least one byte of the accessed range is not backed.
    Unmapped { addr: u32, size: usize },
    /// The access would wrap around the end of the address space.
    Wrap { addr: u32, size: usize },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::Unmapped { addr, size } => {
                write!(f, "access to unmapped memory ({} bytes at {:#010X})", size, addr)
            }
            MemoryError::Wrap { addr, size } => {
                write!(f, "access of {} bytes at {:#010X} wraps the address space", size, addr)
            }
        }
    }
}

impl Error for MemoryError {}
