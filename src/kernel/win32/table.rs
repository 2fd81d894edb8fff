//! Stores static information about the functions and variables a PE image
//! can import.

/// A symbol exported by one of the emulated libraries.
#[derive(Debug)]
pub struct Export {
    /// Library name, lowercase.
    pub dll: &'static str,
    /// Symbol name.
    pub name: &'static str,
    pub kind: ExportKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExportKind {
    /// Callable library function.
    Function {
        /// The ABI used by the function.
        abi: Abi,
        /// Number of fixed (non-variadic) arguments the function takes.
        arity: u32,
    },
    /// Variable living in guest memory owned by the runtime. Its IAT slot
    /// receives the variable's address instead of a thunk.
    Variable(Variable),
}

/// Runtime-owned variables that can be imported.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Variable {
    /// The `_iob` array of `FILE` structures.
    Iob,
}

/// Library function ABI / calling convention.
///
/// Both pass arguments on the stack, pushed right-to-left, and return values
/// in `eax`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Abi {
    /// Caller cleans up the stack. Used by the C runtime.
    Cdecl,
    /// Callee cleans up the stack, usually via a `ret N` instruction. Used by
    /// the Windows API.
    Stdcall,
}

impl Abi {
    /// Number of argument bytes removed from the stack by the callee.
    pub fn callee_pops(&self, arity: u32) -> u32 {
        match self {
            Abi::Cdecl => 0,
            Abi::Stdcall => 4 * arity,
        }
    }
}

/// Defines an `Export` denoting a library function.
macro_rules! func {
    ($dll:tt: $name:ident abi=$abi:ident arity=$arity:tt) => {
        Export {
            dll: $dll,
            name: stringify!($name),
            kind: ExportKind::Function {
                abi: Abi::$abi,
                arity: $arity,
            },
        }
    };
}

macro_rules! var {
    ($dll:tt: $name:ident = $var:ident) => {
        Export {
            dll: $dll,
            name: stringify!($name),
            kind: ExportKind::Variable(Variable::$var),
        }
    };
}

const MSVCRT: &str = "msvcrt.dll";
const KERNEL32: &str = "kernel32.dll";
const LIBINTL: &str = "libintl3.dll";

static EXPORTS: &[Export] = &[
    func!(MSVCRT: __set_app_type abi=Cdecl arity=1),
    func!(MSVCRT: __getmainargs abi=Cdecl arity=5),
    func!(MSVCRT: __p__fmode abi=Cdecl arity=0),
    func!(MSVCRT: __p__environ abi=Cdecl arity=0),
    func!(MSVCRT: atexit abi=Cdecl arity=1),
    func!(MSVCRT: _cexit abi=Cdecl arity=0),
    func!(MSVCRT: exit abi=Cdecl arity=1),
    func!(MSVCRT: getenv abi=Cdecl arity=1),
    func!(MSVCRT: setlocale abi=Cdecl arity=2),
    func!(MSVCRT: _flsbuf abi=Cdecl arity=2),
    func!(MSVCRT: puts abi=Cdecl arity=1),
    func!(MSVCRT: fputs abi=Cdecl arity=2),
    func!(MSVCRT: printf abi=Cdecl arity=1),
    func!(MSVCRT: fprintf abi=Cdecl arity=2),
    func!(MSVCRT: vfprintf abi=Cdecl arity=3),
    func!(MSVCRT: sprintf abi=Cdecl arity=2),
    func!(MSVCRT: fopen abi=Cdecl arity=2),
    func!(MSVCRT: fclose abi=Cdecl arity=1),
    func!(MSVCRT: fflush abi=Cdecl arity=1),
    func!(MSVCRT: fread abi=Cdecl arity=4),
    func!(MSVCRT: strchr abi=Cdecl arity=2),
    func!(MSVCRT: strcmp abi=Cdecl arity=2),
    func!(MSVCRT: strncmp abi=Cdecl arity=3),
    func!(MSVCRT: strlen abi=Cdecl arity=1),
    func!(MSVCRT: strcpy abi=Cdecl arity=2),
    func!(MSVCRT: strncpy abi=Cdecl arity=3),
    func!(MSVCRT: memcpy abi=Cdecl arity=3),
    func!(MSVCRT: memset abi=Cdecl arity=3),
    func!(MSVCRT: malloc abi=Cdecl arity=1),
    func!(MSVCRT: free abi=Cdecl arity=1),
    func!(MSVCRT: localtime abi=Cdecl arity=1),
    func!(MSVCRT: strftime abi=Cdecl arity=4),
    var!(MSVCRT: _iob = Iob),
    func!(KERNEL32: SetUnhandledExceptionFilter abi=Stdcall arity=1),
    func!(KERNEL32: GetModuleHandleA abi=Stdcall arity=1),
    func!(KERNEL32: ExitProcess abi=Stdcall arity=1),
    func!(LIBINTL: libintl_bindtextdomain abi=Cdecl arity=2),
    func!(LIBINTL: libintl_textdomain abi=Cdecl arity=1),
    func!(LIBINTL: libintl_gettext abi=Cdecl arity=1),
];

/// Looks up the export `name` of library `dll`.
///
/// Library names are compared case-insensitively, symbol names exactly.
pub fn find(dll: &str, name: &str) -> Option<&'static Export> {
    EXPORTS
        .iter()
        .find(|export| export.dll.eq_ignore_ascii_case(dll) && export.name == name)
}
