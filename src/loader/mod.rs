//! Brings program images into guest memory.
//!
//! Three image formats are supported: raw binaries (copied to a fixed
//! address), 32-bit little-endian ELF executables (xv6 programs) and 32-bit PE
//! executables. Loading an image only allocates and fills memory; the stack,
//! program arguments and the runtime are set up separately.

mod elf;
mod pe;
mod raw;

pub use self::elf::load_elf;
pub use self::pe::load_pe;
pub use self::raw::load_raw;

use crate::memory::{MemoryError, VirtualMemory};

use std::error::Error;
use std::fmt;
use std::io;
use std::str::FromStr;

const ADDRESS_SPACE: u64 = 1 << 32;

/// Where things are placed in the guest address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Initial `esp`. The stack grows down from here.
    pub stack_top: u32,
    /// Stack size used when the image doesn't specify one.
    pub stack_size: u32,
    /// Base of the PE runtime's work area (`WorkArea::SIZE` bytes).
    pub work_area: u32,
    /// Start of the heap managed by `malloc`.
    pub heap_base: u32,
    /// First import thunk. Each import occupies 4 bytes of address space.
    pub thunk_base: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            stack_top: 0x8000_0000,
            stack_size: 1024 * 1024,
            work_area: 0x7FF0_0000,
            heap_base: 0x6000_0000,
            thunk_base: 0xFFFF_0000,
        }
    }
}

/// Image formats understood by the loader.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    Raw,
    Elf,
    Pe,
}

impl Format {
    /// Guesses the format from the magic number at the start of the image.
    /// Anything that is neither ELF nor PE is a raw binary.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(b"\x7FELF") {
            Format::Elf
        } else if bytes.starts_with(b"MZ") {
            Format::Pe
        } else {
            Format::Raw
        }
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "raw" => Ok(Format::Raw),
            "elf" => Ok(Format::Elf),
            "pe" => Ok(Format::Pe),
            _ => Err(format!("unknown image format '{}'", s)),
        }
    }
}

/// A symbol imported by a PE image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    Name(String),
    Ordinal(u16),
}

/// An entry of a PE image's import table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Name of the library the symbol is imported from.
    pub dll: String,
    pub symbol: Symbol,
    /// Address of the import's IAT slot, receiving the symbol's address.
    pub iat: u32,
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.symbol {
            Symbol::Name(name) => write!(f, "{}!{}", self.dll, name),
            Symbol::Ordinal(ord) => write!(f, "{}!#{}", self.dll, ord),
        }
    }
}

/// A loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Initial `eip`.
    pub entry: u32,
    /// Stack size requested by the image, if any.
    pub stack_size: Option<u32>,
    /// Symbols to bind before running (PE only).
    pub imports: Vec<Import>,
}

/// Loads an image of the given format. `base` is only used for raw images.
pub fn load<M: VirtualMemory>(mem: &mut M, bytes: &[u8], format: Format, base: u32) -> Result<Image, LoaderError> {
    match format {
        Format::Raw => load_raw(mem, bytes, base),
        Format::Elf => load_elf(mem, bytes),
        Format::Pe => load_pe(mem, bytes),
    }
}

/// A region of the image to be placed in memory.
#[derive(Debug)]
struct Segment<'a> {
    /// Name used in diagnostics.
    name: &'a str,
    addr: u64,
    /// Number of bytes to allocate.
    size: u64,
    /// Initial contents (at most `size` bytes). The rest is zero-filled.
    data: &'a [u8],
}

impl Segment<'_> {
    /// Allocates the segment and copies its data.
    fn map<M: VirtualMemory>(&self, mem: &mut M) -> Result<(), LoaderError> {
        if self.addr + self.size > ADDRESS_SPACE || self.data.len() as u64 > self.size {
            return Err(LoaderError::format(format!(
                "{} ({} bytes at {:#X}) is out of the address space",
                self.name, self.size, self.addr
            )));
        }
        info!(
            "mapping {} to {:#010X}-{:#010X}",
            self.name,
            self.addr,
            (self.addr + self.size).saturating_sub(1)
        );
        mem.allocate(self.addr as u32, self.size as u32);
        mem.write_checked(self.data, self.addr as u32)?;
        Ok(())
    }
}

/// Returns `len` bytes of the file at `offset`, or an error naming `what` if
/// they're not all there.
fn file_range<'a>(bytes: &'a [u8], offset: u64, len: u64, what: &str) -> Result<&'a [u8], LoaderError> {
    let end = offset.checked_add(len).filter(|&end| end <= bytes.len() as u64);
    match end {
        Some(end) => Ok(&bytes[offset as usize..end as usize]),
        None => Err(LoaderError::format(format!("{} is out of the file", what))),
    }
}

/// Allocates a stack of `size` bytes below `layout.stack_top` and returns the
/// initial stack pointer.
pub fn setup_stack<M: VirtualMemory>(mem: &mut M, layout: &Layout, size: u32) -> Result<u32, LoaderError> {
    let top = layout.stack_top;
    let bottom = top
        .checked_sub(size)
        .ok_or_else(|| LoaderError::format(format!("stack of {} bytes doesn't fit below {:#010X}", size, top)))?;
    info!("stack at {:#010X}-{:#010X}", bottom, top.wrapping_sub(1));
    mem.allocate(bottom, size);
    Ok(top)
}

/// The result of `push_args`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArgsFrame {
    /// New stack pointer.
    pub esp: u32,
    pub argc: u32,
    /// Address of the `argv` array.
    pub argv: u32,
}

/// Pushes program arguments like xv6's `exec` does.
///
/// The strings are copied to the stack first, each starting at a 4-byte
/// boundary. Below them the stack holds, from `esp` upwards: a fake return
/// address (`0xFFFFFFFF`), `argc`, `argv`, and the `argv` array terminated by
/// a null pointer.
pub fn push_args<M, S>(mem: &mut M, esp: u32, args: &[S]) -> Result<ArgsFrame, LoaderError>
where
    M: VirtualMemory,
    S: AsRef<[u8]>,
{
    let overflow = || LoaderError::format("program arguments don't fit on the stack".to_string());

    let mut sp = u64::from(esp);
    let mut pointers = Vec::with_capacity(args.len() + 1);
    for arg in args {
        let mut data = arg.as_ref().to_vec();
        data.push(0);
        sp = sp.checked_sub(data.len() as u64).ok_or_else(overflow)? & !3;
        mem.write_checked(&data, sp as u32)?;
        pointers.push(sp as u32);
    }
    pointers.push(0);

    let argc = args.len() as u32;
    let sp = sp.checked_sub(4 * (3 + pointers.len() as u64)).ok_or_else(overflow)? as u32;
    let argv = sp + 12;
    let header = [0xFFFF_FFFF, argc, argv];
    let frame = header.iter().chain(&pointers);
    for (i, value) in frame.enumerate() {
        mem.store_u32(sp + 4 * i as u32, *value)?;
    }
    Ok(ArgsFrame { esp: sp, argc, argv })
}

/// Errors that can occur while loading an image.
#[derive(Debug)]
pub enum LoaderError {
    /// The image file couldn't be read.
    Io(io::Error),
    /// The image is malformed.
    Parse(goblin::error::Error),
    /// The image is well-formed, but can't be loaded.
    Format(String),
    /// Writing to guest memory failed.
    Memory(MemoryError),
}

impl LoaderError {
    #[cold]
    fn format(msg: String) -> Self {
        LoaderError::Format(msg)
    }
}

impl From<io::Error> for LoaderError {
    fn from(e: io::Error) -> Self {
        LoaderError::Io(e)
    }
}

impl From<goblin::error::Error> for LoaderError {
    fn from(e: goblin::error::Error) -> Self {
        LoaderError::Parse(e)
    }
}

impl From<MemoryError> for LoaderError {
    fn from(e: MemoryError) -> Self {
        LoaderError::Memory(e)
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoaderError::Io(e) => write!(f, "cannot read image: {}", e),
            LoaderError::Parse(e) => write!(f, "malformed image: {}", e),
            LoaderError::Format(msg) => write!(f, "unsupported image: {}", msg),
            LoaderError::Memory(e) => write!(f, "{}", e),
        }
    }
}

impl Error for LoaderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LoaderError::Io(e) => Some(e),
            LoaderError::Parse(e) => Some(e),
            LoaderError::Memory(e) => Some(e),
            LoaderError::Format(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;

    #[test]
    fn format_detection() {
        assert_eq!(Format::detect(b"\x7FELF\x01\x01"), Format::Elf);
        assert_eq!(Format::detect(b"MZ\x90\x00"), Format::Pe);
        assert_eq!(Format::detect(b"\x7FEL"), Format::Raw);
        assert_eq!(Format::detect(b""), Format::Raw);
        assert_eq!("pe".parse::<Format>(), Ok(Format::Pe));
        assert!("exe".parse::<Format>().is_err());
    }

    #[test]
    fn segment_bounds() {
        let mut mem = SparseMemory::new();
        let segment = Segment { name: "top", addr: 0xFFFF_F000, size: 0x1000, data: b"abc" };
        segment.map(&mut mem).unwrap();
        assert!(mem.is_allocated(0xFFFF_F000, 0x1000));
        assert_eq!(mem.load_cstr(0xFFFF_F000, 8).unwrap(), b"abc");

        let segment = Segment { name: "beyond", addr: 0xFFFF_F000, size: 0x1001, data: b"" };
        assert!(matches!(segment.map(&mut mem), Err(LoaderError::Format(_))));
        let segment = Segment { name: "overfull", addr: 0, size: 2, data: b"abc" };
        assert!(matches!(segment.map(&mut mem), Err(LoaderError::Format(_))));
    }

    #[test]
    fn file_ranges() {
        let bytes = [1, 2, 3, 4];
        assert_eq!(file_range(&bytes, 1, 3, "x").unwrap(), &[2, 3, 4]);
        assert!(file_range(&bytes, 1, 4, "x").is_err());
        assert!(file_range(&bytes, u64::MAX, 2, "x").is_err());
    }

    #[test]
    fn stack() {
        let mut mem = SparseMemory::new();
        let layout = Layout::default();
        let esp = setup_stack(&mut mem, &layout, 0x2000).unwrap();
        assert_eq!(esp, 0x8000_0000);
        assert!(mem.is_allocated(0x7FFF_E000, 0x2000));
        assert!(!mem.is_allocated(0x7FFF_D000, 1));
        assert!(!mem.is_allocated(0x8000_0000, 1));

        let layout = Layout { stack_top: 0x1000, ..Layout::default() };
        assert!(setup_stack(&mut mem, &layout, 0x2000).is_err());
    }

    #[test]
    fn program_arguments() {
        let mut mem = SparseMemory::new();
        mem.allocate(0x1000, 0x1000);
        let frame = push_args(&mut mem, 0x2000, &["prog", "-x"]).unwrap();

        assert_eq!(frame.argc, 2);
        assert_eq!(frame.argv, frame.esp + 12);
        assert_eq!(mem.load_u32(frame.esp).unwrap(), 0xFFFF_FFFF);
        assert_eq!(mem.load_u32(frame.esp + 4).unwrap(), 2);
        assert_eq!(mem.load_u32(frame.esp + 8).unwrap(), frame.argv);

        let arg0 = mem.load_u32(frame.argv).unwrap();
        let arg1 = mem.load_u32(frame.argv + 4).unwrap();
        assert_eq!(mem.load_u32(frame.argv + 8).unwrap(), 0);
        assert_eq!(mem.load_cstr(arg0, 16).unwrap(), b"prog");
        assert_eq!(mem.load_cstr(arg1, 16).unwrap(), b"-x");
        assert_eq!((arg0 % 4, arg1 % 4), (0, 0));
        assert_eq!(arg0, 0x2000 - 8);
        assert_eq!(arg1, 0x2000 - 12);
        assert_eq!(frame.esp, arg1 - 24);

        let empty: &[&str] = &[];
        let frame = push_args(&mut mem, 0x2000, empty).unwrap();
        assert_eq!(frame.esp, 0x2000 - 16);
        assert_eq!(mem.load_u32(frame.argv).unwrap(), 0);

        // the stack is too small
        assert!(matches!(push_args(&mut mem, 0x1008, &["some argument"]), Err(LoaderError::Memory(_))));
    }
}
