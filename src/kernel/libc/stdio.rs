//! Standard I/O: `FILE` streams, formatted output and reading.

use super::format::{format, VaList};
use crate::cpu::interpret::HookError;
use crate::kernel::types::*;
use crate::kernel::{Streams, Syscall};
use crate::memory::VirtualMemory;

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};

/// Size of a guest `FILE` structure in the `_iob` table.
pub const FILE_SIZE: u32 = 32;
/// Number of `FILE` slots in the `_iob` table.
pub const FILE_SLOTS: usize = 128;

const STDIN: usize = 0;
const STDOUT: usize = 1;
const STDERR: usize = 2;
const FIRST_USER_SLOT: usize = 3;

#[derive(Debug)]
enum Stream {
    Stdin,
    Stdout,
    Stderr,
    File(fs::File),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LastOp {
    None,
    Read,
    Write,
}

#[derive(Debug)]
struct OpenFile {
    stream: Stream,
    can_read: bool,
    can_write: bool,
    last: LastOp,
}

impl OpenFile {
    fn standard(stream: Stream, can_read: bool) -> Self {
        Self {
            stream,
            can_read,
            can_write: !can_read,
            last: LastOp::None,
        }
    }
}

/// Host side of the `_iob` table.
///
/// A guest `FILE*` is the address of one of the 32-byte slots of `_iob`. The
/// guest memory of a slot is never looked at; the host keeps the actual state.
#[derive(Debug)]
pub struct FileTable {
    io: Streams,
    iob: u32,
    slots: Vec<Option<OpenFile>>,
}

impl FileTable {
    /// Creates a table with `stdin`, `stdout` and `stderr` open in slots 0-2.
    pub fn new(io: Streams, iob: u32) -> Self {
        let mut slots: Vec<Option<OpenFile>> = (0..FILE_SLOTS).map(|_| None).collect();
        slots[STDIN] = Some(OpenFile::standard(Stream::Stdin, true));
        slots[STDOUT] = Some(OpenFile::standard(Stream::Stdout, false));
        slots[STDERR] = Some(OpenFile::standard(Stream::Stderr, false));
        Self { io, iob, slots }
    }

    /// Guest address of the `FILE` in `slot`.
    pub fn address(&self, slot: usize) -> u32 {
        self.iob + FILE_SIZE * slot as u32
    }

    fn slot(&self, fp: u32) -> Option<usize> {
        let delta = fp.checked_sub(self.iob)?;
        if delta % FILE_SIZE != 0 {
            return None;
        }
        let slot = (delta / FILE_SIZE) as usize;
        if slot < FILE_SLOTS {
            Some(slot)
        } else {
            None
        }
    }

    /// Writes `data` to the stream `fp`.
    ///
    /// Returns the number of bytes written, or `None` if `fp` is not a stream
    /// open for writing.
    fn write(&mut self, fp: u32, data: &[u8]) -> Option<usize> {
        let slot = self.slot(fp)?;
        let io = &mut self.io;
        let file = self.slots[slot].as_mut().filter(|file| file.can_write)?;
        file.last = LastOp::Write;

        let result = match &mut file.stream {
            Stream::Stdout => io.stdout().write_all(data),
            Stream::Stderr => io.stderr().write_all(data),
            Stream::File(f) => f.write_all(data),
            Stream::Stdin => return None,
        };
        match result {
            Ok(()) => Some(data.len()),
            Err(e) => {
                debug!("write to FILE {:#010X} failed: {}", fp, e);
                Some(0)
            }
        }
    }

    /// Reads up to `len` bytes from the stream `fp`.
    ///
    /// Returns `None` if `fp` is not a stream open for reading.
    fn read(&mut self, fp: u32, len: u32) -> Option<Vec<u8>> {
        let slot = self.slot(fp)?;
        let io = &mut self.io;
        let file = self.slots[slot].as_mut().filter(|file| file.can_read)?;
        file.last = LastOp::Read;

        let mut data = Vec::new();
        let result = match &mut file.stream {
            Stream::Stdin => Read::take(io.stdin(), u64::from(len)).read_to_end(&mut data),
            Stream::File(f) => Read::take(f, u64::from(len)).read_to_end(&mut data),
            Stream::Stdout | Stream::Stderr => return None,
        };
        if let Err(e) = result {
            debug!("read from FILE {:#010X} failed: {}", fp, e);
        }
        Some(data)
    }

    fn flush_slot(&mut self, slot: usize) -> bool {
        let io = &mut self.io;
        let file = match self.slots[slot].as_mut() {
            Some(file) => file,
            None => return false,
        };
        if !file.can_write || file.last == LastOp::Read {
            return true;
        }
        let result = match &mut file.stream {
            Stream::Stdout => io.stdout().flush(),
            Stream::Stderr => io.stderr().flush(),
            Stream::File(f) => f.flush(),
            Stream::Stdin => Ok(()),
        };
        result.is_ok()
    }

    /// Flushes `fp`, or every open stream if `fp` is 0.
    pub fn flush(&mut self, fp: u32) -> bool {
        if fp == 0 {
            let mut all_ok = true;
            for slot in 0..FILE_SLOTS {
                if self.slots[slot].is_some() && !self.flush_slot(slot) {
                    all_ok = false;
                }
            }
            all_ok
        } else {
            match self.slot(fp) {
                Some(slot) => self.flush_slot(slot),
                None => false,
            }
        }
    }

    /// Opens a host file in the first free slot and returns its guest
    /// address, or 0 on failure.
    fn open(&mut self, path: &str, mode: &OpenMode) -> u32 {
        let slot = match (FIRST_USER_SLOT..FILE_SLOTS).find(|&slot| self.slots[slot].is_none()) {
            Some(slot) => slot,
            None => {
                debug!("fopen: no free FILE slot");
                return 0;
            }
        };

        match mode.options().open(path) {
            Ok(f) => {
                self.slots[slot] = Some(OpenFile {
                    stream: Stream::File(f),
                    can_read: mode.can_read(),
                    can_write: mode.can_write(),
                    last: LastOp::None,
                });
                self.address(slot)
            }
            Err(e) => {
                debug!("fopen: cannot open {:?}: {}", path, e);
                0
            }
        }
    }

    /// Flushes and releases `fp`. The host's standard streams stay open.
    fn close(&mut self, fp: u32) -> bool {
        let slot = match self.slot(fp) {
            Some(slot) if self.slots[slot].is_some() => slot,
            _ => return false,
        };
        let flushed = self.flush_slot(slot);
        // dropping a host file closes it
        self.slots[slot] = None;
        flushed
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Append,
}

/// A parsed `fopen` mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenMode {
    access: Access,
    plus: bool,
    exclusive: bool,
}

impl OpenMode {
    /// Parses `r`, `w` or `a`, followed or preceded by any of `b`, `x` and
    /// `+`. `x` is only allowed with `w`.
    fn parse(mode: &[u8]) -> Option<Self> {
        let mut access = None;
        let mut plus = false;
        let mut exclusive = false;

        for &c in mode {
            let new = match c {
                b'r' => Access::Read,
                b'w' => Access::Write,
                b'a' => Access::Append,
                b'b' => continue,
                b'x' => {
                    exclusive = true;
                    continue;
                }
                b'+' => {
                    plus = true;
                    continue;
                }
                _ => return None,
            };
            if access.replace(new).is_some() {
                return None;
            }
        }

        let access = access?;
        if exclusive && access != Access::Write {
            return None;
        }
        Some(Self { access, plus, exclusive })
    }

    fn can_read(&self) -> bool {
        self.access == Access::Read || self.plus
    }

    fn can_write(&self) -> bool {
        self.access != Access::Read || self.plus
    }

    fn options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(self.can_read());
        match self.access {
            Access::Read => {
                options.write(self.plus);
            }
            Access::Write => {
                options.write(true);
                if self.exclusive {
                    options.create_new(true);
                } else {
                    options.create(true).truncate(true);
                }
            }
            Access::Append => {
                options.append(true).create(true);
            }
        }
        options
    }
}

impl<'a, M: VirtualMemory> Syscall<'a, M> {
    fn format(&self, format_ptr: GuestPtr<u8>, va: u32) -> Result<Vec<u8>, HookError> {
        let fmt = self.string(format_ptr)?;
        Ok(format(&fmt, &mut VaList::new(&*self.mem, va))?)
    }

    /// Writes `data` to `fp` and returns the libc result: the number of bytes
    /// written, or -1.
    fn output(&mut self, fp: u32, data: &[u8]) -> i32 {
        match self.process.files.write(fp, data) {
            Some(n) if n == data.len() => data.len() as i32,
            _ => -1,
        }
    }

    fn stdout(&self) -> u32 {
        self.process.files.address(STDOUT)
    }

    pub fn printf(&mut self, (format,): (GuestPtr<u8>,)) -> Result<i32, HookError> {
        let text = self.format(format, self.varargs)?;
        let stdout = self.stdout();
        Ok(self.output(stdout, &text))
    }

    pub fn fprintf(&mut self, (fp, format): (GuestPtr<File>, GuestPtr<u8>)) -> Result<i32, HookError> {
        let text = self.format(format, self.varargs)?;
        Ok(self.output(fp.raw_addr(), &text))
    }

    /// Only supports `stdout` and `stderr`.
    pub fn vfprintf(&mut self, (fp, format, va): (GuestPtr<File>, GuestPtr<u8>, u32)) -> Result<i32, HookError> {
        let files = &self.process.files;
        if fp.raw_addr() != files.address(STDOUT) && fp.raw_addr() != files.address(STDERR) {
            return Ok(-1);
        }
        let text = self.format(format, va)?;
        Ok(self.output(fp.raw_addr(), &text))
    }

    /// Writes the formatted string and its terminator to `dest`.
    pub fn sprintf(&mut self, (dest, format): (GuestPtr<u8>, GuestPtr<u8>)) -> Result<i32, HookError> {
        let mut text = self.format(format, self.varargs)?;
        let len = text.len();
        text.push(0);
        self.mem.write_checked(&text, dest.raw_addr())?;
        Ok(len as i32)
    }

    pub fn fputs(&mut self, (s, fp): (GuestPtr<u8>, GuestPtr<File>)) -> Result<i32, HookError> {
        let s = self.string(s)?;
        Ok(if self.output(fp.raw_addr(), &s) < 0 { -1 } else { 1 })
    }

    /// Prints a string and a newline to `stdout`.
    pub fn puts(&mut self, (s,): (GuestPtr<u8>,)) -> Result<i32, HookError> {
        let mut s = self.string(s)?;
        s.push(b'\n');
        let stdout = self.stdout();
        Ok(if self.output(stdout, &s) < 0 { -1 } else { 1 })
    }

    /// Writes a character to `fp` when its buffer is full. There is no
    /// buffer, so this just writes the character.
    pub fn flsbuf(&mut self, (ch, fp): (u32, GuestPtr<File>)) -> Result<i32, HookError> {
        let ch = ch as u8;
        Ok(if self.output(fp.raw_addr(), &[ch]) < 0 { -1 } else { i32::from(ch) })
    }

    /// Opens a host file. Returns NULL if the name or mode can't be read, the
    /// mode is invalid, or the file can't be opened.
    pub fn fopen(&mut self, (path, mode): (GuestPtr<u8>, GuestPtr<u8>)) -> Result<GuestPtr<File>, HookError> {
        let (path, mode) = match (self.string(path), self.string(mode)) {
            (Ok(path), Ok(mode)) => (path, mode),
            _ => return Ok(GuestPtr::NULL),
        };
        let mode = match OpenMode::parse(&mode) {
            Some(mode) => mode,
            None => return Ok(GuestPtr::NULL),
        };
        let path = String::from_utf8_lossy(&path).into_owned();
        Ok(GuestPtr::new(self.process.files.open(&path, &mode)))
    }

    pub fn fclose(&mut self, (fp,): (GuestPtr<File>,)) -> Result<i32, HookError> {
        Ok(if self.process.files.close(fp.raw_addr()) { 0 } else { -1 })
    }

    /// Flushes `fp`, or all streams if it is NULL.
    pub fn fflush(&mut self, (fp,): (GuestPtr<File>,)) -> Result<i32, HookError> {
        Ok(if self.process.files.flush(fp.raw_addr()) { 0 } else { -1 })
    }

    /// Reads up to `count` elements of `size` bytes each. Returns the number
    /// of complete elements read.
    pub fn fread(&mut self, (dest, size, count, fp): (GuestPtr<u8>, u32, u32, GuestPtr<File>)) -> Result<u32, HookError> {
        if size == 0 || count == 0 {
            return Ok(0);
        }
        let total = match size.checked_mul(count) {
            Some(total) => total,
            None => return Ok(0),
        };
        self.mem.check(dest.raw_addr(), total as usize)?;

        match self.process.files.read(fp.raw_addr(), total) {
            Some(data) => {
                self.mem.write_checked(&data, dest.raw_addr())?;
                Ok(data.len() as u32 / size)
            }
            None => Ok(0),
        }
    }
}
