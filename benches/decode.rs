//! Benchmarks instruction decoder performance.

#[macro_use] extern crate criterion;
extern crate sandbox86;

use criterion::{Criterion, Throughput};
use sandbox86::cpu::decode::Decoder;
use sandbox86::memory::{SparseMemory, VirtualMemory};

/// A `strdup`-like function as emitted by a C compiler: prologue, `strlen`
/// loop, call to `malloc`, `rep movs` copy and epilogue.
///
/// One instruction per line.
static DATA: &str = r#"
55
89 E5
83 EC 18
53
56
57
8B 75 08
31 C0
89 F7
B9 FF FF FF FF
F2 AE
F7 D1
89 4D FC
51
E8 45 1B 00 00
83 C4 04
85 C0
74 11
89 C7
8B 4D FC
89 CA
C1 E9 02
F3 A5
89 D1
83 E1 03
F3 A4
8D 65 F4
5F
5E
5B
C9
C3
"#;

fn decode_strdup(c: &mut Criterion) {
    // expected instr count
    let icount = DATA.lines().filter(|line| !line.trim().is_empty()).count();
    let data: Vec<_> = DATA.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).unwrap())
        .collect();
    let bytes = data.len() as u32;

    let mut mem = SparseMemory::new();
    mem.allocate(0, bytes);
    mem.write_checked(&data, 0).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(u64::from(bytes)));
    group.bench_function("strdup", move |b| {
        b.iter(|| {
            let mut decoder = Decoder::new(&mem, 0);
            for _ in 0..icount {
                criterion::black_box(&decoder.decode_next().unwrap());
            }
        })
    });
    group.finish();
}

criterion_group!(decode, decode_strdup);
criterion_main!(decode);
