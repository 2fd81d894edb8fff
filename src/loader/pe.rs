use super::{file_range, Image, Import, LoaderError, Segment, Symbol, ADDRESS_SPACE};
use crate::memory::VirtualMemory;

use goblin::pe::import::SyntheticImportLookupTableEntry;
use goblin::pe::section_table::SectionTable;
use goblin::pe::PE;

use std::convert::TryFrom;

/// Loads a 32-bit PE executable.
///
/// Sections are placed relative to the preferred image base (there is no
/// relocation), and the import table is collected for the runtime to bind.
pub fn load_pe<M: VirtualMemory>(mem: &mut M, bytes: &[u8]) -> Result<Image, LoaderError> {
    let pe = PE::parse(bytes)?;
    if pe.is_64 {
        return Err(LoaderError::format("64-bit PE files are not supported".to_string()));
    }
    let header = pe
        .header
        .optional_header
        .ok_or_else(|| LoaderError::format("PE file without optional header".to_string()))?;

    let image_base = pe.image_base as u64;
    let entry = address(image_base, header.standard_fields.address_of_entry_point as u64, "PE entry point")?;
    let stack_size = u32::try_from(header.windows_fields.size_of_stack_reserve)
        .map_err(|_| LoaderError::format("PE stack reserve exceeds the address space".to_string()))?;

    for (i, section) in pe.sections.iter().enumerate() {
        let name = format!("PE section {} ({})", i, section.name().unwrap_or("?"));
        section_segment(image_base, section, bytes, &name)?.map(mem)?;
    }

    let mut imports = Vec::new();
    if let Some(import_data) = &pe.import_data {
        for entry in &import_data.import_data {
            let table = match &entry.import_lookup_table {
                Some(table) => table,
                None => continue,
            };
            let iat = u64::from(entry.import_directory_entry.import_address_table_rva);
            for (i, lookup) in table.iter().enumerate() {
                let symbol = match lookup {
                    SyntheticImportLookupTableEntry::OrdinalNumber(ord) => Symbol::Ordinal(*ord),
                    SyntheticImportLookupTableEntry::HintNameTableRVA((_, hint)) => Symbol::Name(hint.name.to_string()),
                };
                imports.push(Import {
                    dll: entry.name.to_string(),
                    symbol,
                    iat: address(image_base, iat + 4 * i as u64, "PE import address table")?,
                });
            }
        }
    }
    debug!("{} imports", imports.len());

    Ok(Image {
        entry,
        stack_size: Some(stack_size),
        imports,
    })
}

/// Translates a relative virtual address.
fn address(image_base: u64, rva: u64, what: &str) -> Result<u32, LoaderError> {
    let addr = image_base + rva;
    if addr >= ADDRESS_SPACE {
        return Err(LoaderError::format(format!("{} is out of the address space", what)));
    }
    Ok(addr as u32)
}

/// Describes where `section` goes. `VirtualSize` bytes are allocated, and as
/// much of the raw data as fits is copied.
fn section_segment<'a>(
    image_base: u64,
    section: &SectionTable,
    bytes: &'a [u8],
    name: &'a str,
) -> Result<Segment<'a>, LoaderError> {
    let size = u64::from(section.virtual_size);
    let load_size = if section.pointer_to_raw_data == 0 {
        0
    } else {
        size.min(u64::from(section.size_of_raw_data))
    };
    let data = file_range(bytes, u64::from(section.pointer_to_raw_data), load_size, name)?;
    Ok(Segment {
        name,
        addr: image_base + u64::from(section.virtual_address),
        size,
        data,
    })
}
