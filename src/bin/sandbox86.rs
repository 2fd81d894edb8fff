extern crate env_logger;
extern crate log;
extern crate memmap;
extern crate sandbox86;
extern crate structopt;
extern crate termcolor;

use log::{info, warn};
use memmap::Mmap;
use sandbox86::cpu::disasm::{print_instr, TermPrinter};
use sandbox86::cpu::instr::Instr;
use sandbox86::cpu::interpret::{Hooks, Interpreter, NoHooks, Tracer};
use sandbox86::cpu::{ExecutionEngine, State, Status, REGISTER_NAMES};
use sandbox86::kernel::{MainArgs, Streams, Win32, Xv6};
use sandbox86::loader::{self, Format, Layout};
use sandbox86::memory::SparseMemory;

use structopt::StructOpt;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

/// Parse a number that might be hexadecimal.
fn parse_hex(src: &str) -> Result<u32, ParseIntError> {
    if src.starts_with("0x") || src.starts_with("0X") {
        u32::from_str_radix(&src[2..], 16)
    } else {
        u32::from_str(src)
    }
}

/// `--format`
#[derive(Debug, Copy, Clone, PartialEq)]
enum FormatArg {
    Auto,
    Fixed(Format),
}

impl FromStr for FormatArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "auto" => Ok(FormatArg::Auto),
            _ => s.parse().map(FormatArg::Fixed),
        }
    }
}

/// `--traps`: which runtime services the guest's requests.
#[derive(Debug, Copy, Clone, PartialEq)]
enum Traps {
    /// `pe` for PE images, `xv6` for everything else.
    Auto,
    Xv6,
    Pe,
    None,
}

impl FromStr for Traps {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "auto" => Ok(Traps::Auto),
            "xv6" => Ok(Traps::Xv6),
            "pe" => Ok(Traps::Pe),
            "none" => Ok(Traps::None),
            _ => Err(format!("unknown trap layer '{}'", s)),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "sandbox86", about = "Runs 32-bit x86 user-space programs in a sandbox.")]
struct Opt {
    /// Image format (auto, raw, elf or pe). `auto` recognizes ELF and PE
    /// files by their magic number and treats anything else as raw code.
    #[structopt(long = "format", default_value = "auto")]
    format: FormatArg,

    /// Start executing here instead of at the image's entry point (can also be
    /// a hexadecimal value starting with `0x`).
    #[structopt(long = "eip", parse(try_from_str = parse_hex))]
    eip: Option<u32>,

    /// Initial stack pointer, overriding the default stack setup.
    #[structopt(long = "esp", parse(try_from_str = parse_hex))]
    esp: Option<u32>,

    /// Stack size in bytes. Defaults to the PE header's stack reserve, or
    /// 1 MiB.
    #[structopt(long = "stack-size", parse(try_from_str = parse_hex))]
    stack_size: Option<u32>,

    /// Load address of raw images.
    #[structopt(long = "base", default_value = "0", parse(try_from_str = parse_hex))]
    base: u32,

    /// Runtime handling system calls and imports (auto, xv6, pe or none).
    #[structopt(long = "traps", default_value = "auto")]
    traps: Traps,

    /// Print the instruction and the registers after every step.
    #[structopt(long = "trace")]
    trace: bool,

    /// Let `ret imm16` remove its immediate from the stack.
    #[structopt(long = "ret-pops-imm")]
    ret_pops_imm: bool,

    /// Path to the image to run.
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    /// Arguments passed to the program.
    #[structopt(last = true)]
    args: Vec<String>,
}

/// Returns a tracer printing every instruction, followed by the registers.
/// Registers changed by the instruction are highlighted.
fn tracer() -> Tracer {
    let mut out = StandardStream::stderr(ColorChoice::Auto);
    let mut prev: Option<State> = None;
    Box::new(move |state: &State, instr: &Instr| {
        if let Err(e) = trace_step(&mut out, prev.as_ref(), state, instr) {
            warn!("tracer failed: {}", e);
        }
        prev = Some(state.clone());
    })
}

fn trace_step(out: &mut StandardStream, prev: Option<&State>, state: &State, instr: &Instr) -> io::Result<()> {
    let mut printer = TermPrinter::new(&mut *out);
    print_instr(instr, &mut printer);
    printer.finish()?;
    writeln!(out)?;

    let mut changed = ColorSpec::new();
    changed.set_fg(Some(Color::Red)).set_bold(true);
    for (i, (name, value)) in REGISTER_NAMES.iter().zip(state.regs()).enumerate() {
        if prev.map_or(false, |prev| prev.regs()[i] != *value) {
            out.set_color(&changed)?;
        }
        write!(out, "{}={:08X}", name, value)?;
        out.reset()?;
        write!(out, " ")?;
    }
    if prev.map_or(false, |prev| prev.flags() != state.flags()) {
        out.set_color(&changed)?;
    }
    write!(out, "flags={:?}", state.flags())?;
    out.reset()?;
    writeln!(out, " eip={:08X}", state.eip())
}

/// Runs the guest until it terminates and returns its exit code.
fn execute<H: Hooks<SparseMemory>>(opt: &Opt, mem: SparseMemory, hooks: H, eip: u32, esp: u32) -> Result<u32, Box<dyn Error>> {
    let mut interp = Interpreter::new(mem, hooks, eip, esp);
    interp.options_mut().ret_pops_imm = opt.ret_pops_imm;
    if opt.trace {
        interp.set_tracer(tracer());
    }

    info!("starting at {:#010X} (esp={:#010X})", eip, esp);
    match interp.run() {
        Ok(Status::Exited(code)) => Ok(code),
        Ok(Status::Halted) => {
            info!("guest halted");
            Ok(0)
        }
        Ok(Status::Running) => Ok(0),
        Err(e) => Err(format!("{}\n{}", e, e.state).into()),
    }
}

fn run() -> Result<u32, Box<dyn Error>> {
    let opt = Opt::from_args();

    let file = File::open(&opt.path)?;
    let map;
    let bytes: &[u8] = if file.metadata()?.len() == 0 {
        &[]
    } else {
        // the image file must not change while it's mapped
        map = unsafe { Mmap::map(&file)? };
        &map[..]
    };

    let format = match opt.format {
        FormatArg::Auto => Format::detect(bytes),
        FormatArg::Fixed(format) => format,
    };
    let traps = match opt.traps {
        Traps::Auto if format == Format::Pe => Traps::Pe,
        Traps::Auto => Traps::Xv6,
        traps => traps,
    };
    info!("loading {} as {:?} image", opt.path.display(), format);

    let mut mem = SparseMemory::new();
    let layout = Layout::default();
    let image = loader::load(&mut mem, bytes, format, opt.base)?;
    if traps != Traps::Pe && !image.imports.is_empty() {
        warn!("ignoring {} imports", image.imports.len());
    }

    let stack_size = opt.stack_size.or(image.stack_size).unwrap_or(layout.stack_size);
    let mut esp = loader::setup_stack(&mut mem, &layout, stack_size)?;
    let mut guest_args = vec![opt.path.display().to_string()];
    guest_args.extend(opt.args.iter().cloned());

    let eip = opt.eip.unwrap_or(image.entry);
    match traps {
        Traps::Xv6 => {
            esp = loader::push_args(&mut mem, esp, &guest_args)?.esp;
            let hooks = Xv6::new(Streams::host());
            execute(&opt, mem, hooks, eip, opt.esp.unwrap_or(esp))
        }
        Traps::Pe => {
            // without arguments, the runtime supplies a dummy `argv`
            let main_args = if opt.args.is_empty() {
                None
            } else {
                let frame = loader::push_args(&mut mem, esp, &guest_args)?;
                esp = frame.esp;
                Some(MainArgs {
                    argc: frame.argc,
                    argv: frame.argv,
                })
            };
            let hooks = Win32::new(&mut mem, &image.imports, &layout, main_args, Streams::host())?;
            execute(&opt, mem, hooks, eip, opt.esp.unwrap_or(esp))
        }
        Traps::None | Traps::Auto => execute(&opt, mem, NoHooks, eip, opt.esp.unwrap_or(esp)),
    }
}

fn main() {
    // By default, log all `info!` messages and higher
    env_logger::Builder::from_default_env()
        .filter(None, log::LevelFilter::Info)
        .init();

    let code = match run() {
        Ok(code) => code as i32,
        Err(e) => {
            eprintln!("exiting due to error: {}", e);
            1
        }
    };
    let _ = io::stdout().flush();
    process::exit(code);
}
