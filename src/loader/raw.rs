use super::{Image, LoaderError, Segment};
use crate::memory::VirtualMemory;

/// Copies a raw binary to `base` and starts executing at its first byte.
pub fn load_raw<M: VirtualMemory>(mem: &mut M, bytes: &[u8], base: u32) -> Result<Image, LoaderError> {
    Segment {
        name: "raw image",
        addr: u64::from(base),
        size: bytes.len() as u64,
        data: bytes,
    }
    .map(mem)?;

    Ok(Image {
        entry: base,
        stack_size: None,
        imports: Vec::new(),
    })
}
