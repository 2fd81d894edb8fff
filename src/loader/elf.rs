use super::{file_range, Image, LoaderError, Segment};
use crate::memory::VirtualMemory;

use goblin::elf::header::{EI_VERSION, EV_CURRENT};
use goblin::elf::section_header::{SHF_ALLOC, SHT_NOBITS};
use goblin::elf::Elf;

/// Loads a 32-bit little-endian ELF executable.
///
/// Every section with the `SHF_ALLOC` flag is placed at its address; sections
/// without file data (`.bss`) are zero-filled.
pub fn load_elf<M: VirtualMemory>(mem: &mut M, bytes: &[u8]) -> Result<Image, LoaderError> {
    let elf = Elf::parse(bytes)?;
    if elf.is_64 {
        return Err(LoaderError::format("only 32-bit ELF files are supported".to_string()));
    }
    if !elf.little_endian {
        return Err(LoaderError::format("only little-endian ELF files are supported".to_string()));
    }
    if elf.header.e_ident[EI_VERSION] != EV_CURRENT {
        warn!("unknown ELF version {}", elf.header.e_ident[EI_VERSION]);
    }
    if elf.section_headers.is_empty() {
        warn!("no section header table in ELF");
    }

    for (i, section) in elf.section_headers.iter().enumerate() {
        if section.sh_flags & u64::from(SHF_ALLOC) == 0 {
            continue;
        }
        let name = format!("ELF section {} ({})", i, elf.shdr_strtab.get_at(section.sh_name).unwrap_or("?"));
        let data = if section.sh_type == SHT_NOBITS {
            &[][..]
        } else {
            file_range(bytes, section.sh_offset, section.sh_size, &name)?
        };
        Segment {
            name: &name,
            addr: section.sh_addr,
            size: section.sh_size,
            data,
        }
        .map(mem)?;
    }

    Ok(Image {
        entry: elf.entry as u32,
        stack_size: None,
        imports: Vec::new(),
    })
}
