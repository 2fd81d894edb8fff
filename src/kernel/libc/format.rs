//! `printf`-style formatting against guest memory.
//!
//! Supports the conversions `%d %i %u %x %X %o %c %s %p %%` with the flags
//! `- 0 + space #`, field width and precision (both also as `*`), and the
//! length modifiers `hh h l ll`. Unknown conversions are copied to the output
//! unchanged.

use crate::memory::{MemoryError, VirtualMemory};

use std::fmt;

/// Field widths and precisions are clamped to this value, so a guest can't
/// make the host allocate gigabytes of padding.
const MAX_FIELD: usize = 1 << 20;

/// Cursor over the variadic arguments of a call, stored in guest memory.
pub struct VaList<'a, M: VirtualMemory> {
    mem: &'a M,
    next: u32,
}

impl<'a, M: VirtualMemory> VaList<'a, M> {
    /// Creates a cursor whose first argument is at `addr`.
    pub fn new(mem: &'a M, addr: u32) -> Self {
        Self { mem, next: addr }
    }

    pub fn next_u32(&mut self) -> Result<u32, MemoryError> {
        let value = self.mem.load_u32(self.next)?;
        self.next = self.next.wrapping_add(4);
        Ok(value)
    }

    /// Fetches a `long long`, passed in two consecutive slots.
    pub fn next_u64(&mut self) -> Result<u64, MemoryError> {
        let lo = self.next_u32()?;
        let hi = self.next_u32()?;
        Ok(u64::from(hi) << 32 | u64::from(lo))
    }
}

impl<M: VirtualMemory> fmt::Debug for VaList<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VaList({:#010X})", self.next)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Length {
    Char,
    Short,
    Int,
    LongLong,
}

#[derive(Debug, Default)]
struct Spec {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
}

/// Formats `fmt`, taking arguments from `args`.
///
/// Fails if an argument or a string argument can't be read.
pub fn format<M: VirtualMemory>(fmt: &[u8], args: &mut VaList<M>) -> Result<Vec<u8>, MemoryError> {
    let mut out = Vec::with_capacity(fmt.len());
    let mut i = 0;

    while i < fmt.len() {
        if fmt[i] != b'%' {
            out.push(fmt[i]);
            i += 1;
            continue;
        }

        let start = i;
        i += 1;
        let mut spec = Spec::default();

        while let Some(&c) = fmt.get(i) {
            match c {
                b'-' => spec.left = true,
                b'0' => spec.zero = true,
                b'+' => spec.plus = true,
                b' ' => spec.space = true,
                b'#' => spec.alt = true,
                _ => break,
            }
            i += 1;
        }

        if fmt.get(i) == Some(&b'*') {
            i += 1;
            let width = args.next_u32()? as i32;
            if width < 0 {
                spec.left = true;
            }
            spec.width = (width.unsigned_abs() as usize).min(MAX_FIELD);
        } else {
            spec.width = number(fmt, &mut i);
        }

        if fmt.get(i) == Some(&b'.') {
            i += 1;
            if fmt.get(i) == Some(&b'*') {
                i += 1;
                let precision = args.next_u32()? as i32;
                spec.precision = if precision < 0 { None } else { Some((precision as usize).min(MAX_FIELD)) };
            } else {
                spec.precision = Some(number(fmt, &mut i));
            }
        }

        let length = match (fmt.get(i), fmt.get(i + 1)) {
            (Some(b'h'), Some(b'h')) => { i += 2; Length::Char }
            (Some(b'l'), Some(b'l')) => { i += 2; Length::LongLong }
            (Some(b'h'), _) => { i += 1; Length::Short }
            (Some(b'l'), _) => { i += 1; Length::Int }
            _ => Length::Int,
        };

        let conv = match fmt.get(i) {
            Some(&conv) => conv,
            None => {
                out.extend_from_slice(&fmt[start..]);
                break;
            }
        };
        i += 1;

        match conv {
            b'd' | b'i' => {
                let value = signed(args, length)?;
                let sign = if value < 0 {
                    "-"
                } else if spec.plus {
                    "+"
                } else if spec.space {
                    " "
                } else {
                    ""
                };
                integer(&mut out, &spec, sign, "", value.unsigned_abs().to_string());
            }
            b'u' => {
                let value = unsigned(args, length)?;
                integer(&mut out, &spec, "", "", value.to_string());
            }
            b'x' | b'X' => {
                let value = unsigned(args, length)?;
                let (digits, prefix) = if conv == b'x' {
                    (format!("{:x}", value), "0x")
                } else {
                    (format!("{:X}", value), "0X")
                };
                let prefix = if spec.alt && value != 0 { prefix } else { "" };
                integer(&mut out, &spec, "", prefix, digits);
            }
            b'o' => {
                let value = unsigned(args, length)?;
                let mut digits = precise(format!("{:o}", value), spec.precision);
                if spec.alt && !digits.starts_with('0') {
                    digits.insert(0, '0');
                }
                // precision already applied
                let spec = Spec { precision: None, zero: spec.zero && spec.precision.is_none(), ..spec };
                integer(&mut out, &spec, "", "", digits);
            }
            b'p' => {
                let value = args.next_u32()?;
                pad(&mut out, &spec, format!("{:08X}", value).as_bytes());
            }
            b'c' => {
                let value = args.next_u32()?;
                pad(&mut out, &spec, &[value as u8]);
            }
            b's' => {
                let ptr = args.next_u32()?;
                let max = spec.precision.map_or(u32::MAX, |p| p as u32);
                if ptr == 0 {
                    let null = b"(null)";
                    pad(&mut out, &spec, &null[..null.len().min(max as usize)]);
                } else {
                    let s = args.mem.load_cstr(ptr, max)?;
                    pad(&mut out, &spec, &s);
                }
            }
            b'%' => out.push(b'%'),
            _ => out.extend_from_slice(&fmt[start..i]),
        }
    }

    Ok(out)
}

/// Parses a decimal number at `fmt[*i..]`, advancing `i` past it.
fn number(fmt: &[u8], i: &mut usize) -> usize {
    let mut n = 0usize;
    while let Some(&c) = fmt.get(*i) {
        if !c.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add(usize::from(c - b'0'));
        *i += 1;
    }
    n.min(MAX_FIELD)
}

fn signed<M: VirtualMemory>(args: &mut VaList<M>, length: Length) -> Result<i64, MemoryError> {
    Ok(match length {
        Length::LongLong => args.next_u64()? as i64,
        Length::Char => i64::from(args.next_u32()? as i8),
        Length::Short => i64::from(args.next_u32()? as i16),
        Length::Int => i64::from(args.next_u32()? as i32),
    })
}

fn unsigned<M: VirtualMemory>(args: &mut VaList<M>, length: Length) -> Result<u64, MemoryError> {
    Ok(match length {
        Length::LongLong => args.next_u64()?,
        Length::Char => u64::from(args.next_u32()? as u8),
        Length::Short => u64::from(args.next_u32()? as u16),
        Length::Int => u64::from(args.next_u32()?),
    })
}

/// Applies an integer precision: the minimum number of digits to print.
fn precise(digits: String, precision: Option<usize>) -> String {
    match precision {
        Some(0) if digits == "0" => String::new(),
        Some(p) if p > digits.len() => format!("{}{}", "0".repeat(p - digits.len()), digits),
        _ => digits,
    }
}

fn integer(out: &mut Vec<u8>, spec: &Spec, sign: &str, prefix: &str, digits: String) {
    let digits = precise(digits, spec.precision);
    let len = sign.len() + prefix.len() + digits.len();
    let fill = spec.width.saturating_sub(len);

    if spec.left {
        out.extend_from_slice(sign.as_bytes());
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(digits.as_bytes());
        out.resize(out.len() + fill, b' ');
    } else if spec.zero && spec.precision.is_none() {
        out.extend_from_slice(sign.as_bytes());
        out.extend_from_slice(prefix.as_bytes());
        out.resize(out.len() + fill, b'0');
        out.extend_from_slice(digits.as_bytes());
    } else {
        out.resize(out.len() + fill, b' ');
        out.extend_from_slice(sign.as_bytes());
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(digits.as_bytes());
    }
}

fn pad(out: &mut Vec<u8>, spec: &Spec, body: &[u8]) {
    let fill = spec.width.saturating_sub(body.len());
    if spec.left {
        out.extend_from_slice(body);
        out.resize(out.len() + fill, b' ');
    } else {
        out.resize(out.len() + fill, b' ');
        out.extend_from_slice(body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SparseMemory;

    const ARGS: u32 = 0x1000;
    const STRINGS: u32 = 0x2000;

    fn fmt(format_str: &str, args: &[u32]) -> String {
        let mut mem = SparseMemory::new();
        mem.allocate(ARGS, 0x100);
        mem.allocate(STRINGS, 0x100);
        mem.write_checked(b"hello\0", STRINGS).unwrap();
        for (i, arg) in args.iter().enumerate() {
            mem.store_u32(ARGS + 4 * i as u32, *arg).unwrap();
        }
        let out = format(format_str.as_bytes(), &mut VaList::new(&mem, ARGS)).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn decimal() {
        assert_eq!(fmt("%d|%5d|%-5d|%05d", &[42, 42, 42, -42i32 as u32]), "42|   42|42   |-0042");
        assert_eq!(fmt("%.3d|%+d|% d|%i", &[7, 5, 5, -1i32 as u32]), "007|+5| 5|-1");
        assert_eq!(fmt("%u", &[0xFFFF_FFFF]), "4294967295");
        assert_eq!(fmt("[%.0d]", &[0]), "[]");
    }

    #[test]
    fn radix() {
        assert_eq!(fmt("%x %X %#x %o %#o", &[255, 255, 255, 8, 8]), "ff FF 0xff 10 010");
        assert_eq!(fmt("%#x|%08x|%-6X|", &[0, 0xBEEF, 0xAB]), "0|0000beef|AB    |");
        assert_eq!(fmt("%p", &[0x1234]), "00001234");
    }

    #[test]
    fn length_modifiers() {
        assert_eq!(fmt("%lld", &[0xFFFF_FFFF, 0xFFFF_FFFF]), "-1");
        assert_eq!(fmt("%llu", &[0, 1]), "4294967296");
        assert_eq!(fmt("%hhd %hu %ld", &[0x1FF, 0x1_0001, 3]), "-1 1 3");
    }

    #[test]
    fn strings_and_chars() {
        assert_eq!(fmt("%s|%.2s|%c|%%", &[STRINGS, STRINGS, u32::from(b'A')]), "hello|he|A|%");
        assert_eq!(fmt("%7s|%-7s|", &[STRINGS, STRINGS]), "  hello|hello  |");
        assert_eq!(fmt("%s", &[0]), "(null)");
    }

    #[test]
    fn star_width_and_precision() {
        assert_eq!(fmt("%*d|%-*d|", &[4, 1, 3, 2]), "   1|2  |");
        assert_eq!(fmt("%*d|", &[-3i32 as u32, 9]), "9  |");
        assert_eq!(fmt("%.*s", &[3, STRINGS]), "hel");
    }

    #[test]
    fn unknown_conversions_are_copied() {
        assert_eq!(fmt("a%qb", &[]), "a%qb");
        assert_eq!(fmt("50%", &[]), "50%");
    }

    #[test]
    fn unreadable_arguments() {
        let mem = SparseMemory::new();
        assert!(format(b"plain", &mut VaList::new(&mem, 0)).is_ok());
        assert!(format(b"%d", &mut VaList::new(&mem, 0)).is_err());

        let mut mem = SparseMemory::new();
        mem.allocate(ARGS, 4);
        mem.store_u32(ARGS, 0x5000).unwrap();
        assert!(format(b"%s", &mut VaList::new(&mem, ARGS)).is_err());
    }
}
