//! Version-specific layout of CPython internals.
//!
//! All offsets are derived offline from the interpreter binary and
//! uploaded alongside its unwind table; nothing here hardcodes a Python
//! version.

pub const PYTHON_MAX_STACK_DEPTH: usize = 128;
pub const PYTHON_MAX_FUNCNAME_LENGTH: usize = 256;
pub const PYTHON_MAX_FILENAME_LENGTH: usize = 256;
pub const MAX_PYTHON_SYMBOLS: usize = 200_000;
pub const MAX_PYTHON_THREADS: usize = 16384;
pub const MAX_PYTHON_THREAD_STATE_WALK: usize = 32;

/// First-line sentinel of a synthetic frame marking a C-stack stub.
pub const PYTHON_CFRAME_LINENO: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PythonVersion {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

/// Who owns an interpreter frame; the discriminants match CPython's
/// `_frameowner` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PythonFrameOwner {
    Thread = 0,
    Generator = 1,
    FrameObject = 2,
    CStack = 3,
}

impl PythonFrameOwner {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PythonFrameOwner::Thread),
            1 => Some(PythonFrameOwner::Generator),
            2 => Some(PythonFrameOwner::FrameObject),
            3 => Some(PythonFrameOwner::CStack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonAsciiObjectOffsets {
    pub length: u32,
    pub data: u32,
    pub state: u32,
    pub ascii_bit: u8,
    pub compact_bit: u8,
    pub statically_allocated_bit: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonCodeObjectOffsets {
    pub co_firstlineno: u32,
    pub filename: u32,
    pub qualname: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonInterpreterFrameOffsets {
    pub f_code: u32,
    pub previous: u32,
    pub owner: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonCframeOffsets {
    pub current_frame: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonThreadStateOffsets {
    /// Versions that interpose a `_PyCFrame` between the thread state and
    /// the frame chain set this; on others the thread state points at the
    /// current frame directly.
    pub cframe: Option<u32>,
    pub current_frame: u32,
    pub native_thread_id: u32,
    pub prev_thread: u32,
    pub next_thread: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonInterpreterStateOffsets {
    pub next: u32,
    pub threads_head: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonRuntimeStateOffsets {
    pub interpreters_main: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonInternalsOffsets {
    pub runtime_state: PythonRuntimeStateOffsets,
    pub thread_state: PythonThreadStateOffsets,
    pub cframe: PythonCframeOffsets,
    pub interpreter_frame: PythonInterpreterFrameOffsets,
    pub interpreter_state: PythonInterpreterStateOffsets,
    pub code_object: PythonCodeObjectOffsets,
    pub ascii_object: PythonAsciiObjectOffsets,
}

/// Per-binary description of a CPython interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonConfig {
    pub version: PythonVersion,
    /// Offset of the current-thread-state slot below the thread image
    /// (subtracted from fsbase).
    pub py_thread_state_tls_offset: u64,
    /// Address of `_PyRuntime` relative to the binary's text start.
    pub py_runtime_relative_address: u64,
    pub offsets: PythonInternalsOffsets,
}
