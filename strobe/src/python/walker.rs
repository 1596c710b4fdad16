//! Reconstruction of Python-level call stacks.
//!
//! The walk follows `previous` links between interpreter frames, at most
//! [`PYTHON_MAX_STACK_DEPTH`] of them. Each frame is identified by its
//! code-object pointer (stable for the process lifetime), the first line
//! number (granularity safeguard) and the pid (disambiguation across
//! replaced processes); the expensive string reads happen at most once
//! per code object thanks to the symbol cache.

use schnellru::{ByLength, LruMap};

use crate::memory::UserMemory;
use crate::metrics::SamplerMetrics;
use crate::python::config::{
    PythonConfig, PythonFrameOwner, MAX_PYTHON_SYMBOLS, PYTHON_CFRAME_LINENO,
    PYTHON_MAX_FILENAME_LENGTH, PYTHON_MAX_FUNCNAME_LENGTH, PYTHON_MAX_STACK_DEPTH,
};
use crate::python::thread_state::{acquire_thread_state, PythonThreadStateCache};

/// Identity of one Python frame as carried in sample records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PythonSymbolKey {
    pub code_object: u64,
    pub pid: u32,
    pub co_firstlineno: i32,
}

impl PythonSymbolKey {
    /// Synthetic key of a C-stack stub frame.
    pub fn cstack_stub() -> Self {
        PythonSymbolKey {
            code_object: 0,
            pid: 0,
            co_firstlineno: PYTHON_CFRAME_LINENO,
        }
    }

    pub fn is_cstack_stub(&self) -> bool {
        self.co_firstlineno == PYTHON_CFRAME_LINENO
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PythonSymbol {
    pub file_name: String,
    pub qual_name: String,
}

/// Bounded symbol store shared by all sampled interpreters.
pub struct PythonSymbolCache {
    map: LruMap<PythonSymbolKey, PythonSymbol>,
}

impl PythonSymbolCache {
    pub fn new() -> Self {
        PythonSymbolCache {
            map: LruMap::new(ByLength::new(MAX_PYTHON_SYMBOLS as u32)),
        }
    }

    pub fn contains(&self, key: &PythonSymbolKey) -> bool {
        self.map.peek(key).is_some()
    }

    /// Read without promoting, for offline consumers of sample records.
    pub fn peek(&self, key: &PythonSymbolKey) -> Option<&PythonSymbol> {
        self.map.peek(key)
    }

    pub fn insert(&mut self, key: PythonSymbolKey, symbol: PythonSymbol) {
        self.map.insert(key, symbol);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PythonSymbolCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonFrame {
    pub symbol_key: PythonSymbolKey,
}

/// Per-CPU scratch state of one Python stack collection.
#[derive(Debug, Clone, Default)]
pub struct PythonState {
    pub pid: u32,
    pub frames: Vec<PythonFrame>,
}

impl PythonState {
    pub fn reset(&mut self, pid: u32) {
        self.pid = pid;
        self.frames.clear();
    }
}

fn read_current_frame_from_thread_state(
    config: &PythonConfig,
    thread_state: u64,
    memory: &impl UserMemory,
    metrics: &mut SamplerMetrics,
) -> Option<u64> {
    let offsets = &config.offsets;

    // On versions with a _PyCFrame the thread state points at the cframe
    // and the cframe at the executing frame.
    let (holder, current_frame_offset) = match offsets.thread_state.cframe {
        Some(cframe_offset) => {
            let cframe = match memory.read_ptr(thread_state + cframe_offset as u64) {
                Ok(cframe) => cframe,
                Err(err) => {
                    metrics.python_read_cframe_errors += 1;
                    log::trace!("python: failed to read cframe: {err}");
                    return None;
                }
            };
            if cframe == 0 {
                metrics.python_cframe_null += 1;
                return None;
            }
            (cframe, offsets.cframe.current_frame)
        }
        None => (thread_state, offsets.thread_state.current_frame),
    };

    let frame = match memory.read_ptr(holder + current_frame_offset as u64) {
        Ok(frame) => frame,
        Err(err) => {
            metrics.python_read_interpreter_frame_errors += 1;
            log::trace!("python: failed to read current frame: {err}");
            return None;
        }
    };
    if frame == 0 {
        metrics.python_interpreter_frame_null += 1;
        return None;
    }
    Some(frame)
}

fn read_frame_owner(
    config: &PythonConfig,
    frame: u64,
    memory: &impl UserMemory,
    metrics: &mut SamplerMetrics,
) -> Option<u8> {
    match memory.read_u8(frame + config.offsets.interpreter_frame.owner as u64) {
        Ok(owner) => Some(owner),
        Err(err) => {
            metrics.python_read_frame_owner_errors += 1;
            log::trace!("python: failed to read frame owner: {err}");
            None
        }
    }
}

fn read_previous_frame(
    config: &PythonConfig,
    frame: u64,
    memory: &impl UserMemory,
    metrics: &mut SamplerMetrics,
) -> Option<u64> {
    match memory.read_ptr(frame + config.offsets.interpreter_frame.previous as u64) {
        Ok(previous) => Some(previous),
        Err(err) => {
            metrics.python_read_previous_frame_errors += 1;
            log::trace!("python: failed to read previous frame: {err}");
            None
        }
    }
}

/// Reads a compact ASCII string object, verifying the compact and ascii
/// status bits first.
fn read_ascii_string(
    config: &PythonConfig,
    object: u64,
    max_length: usize,
    memory: &impl UserMemory,
    metrics: &mut SamplerMetrics,
) -> Option<String> {
    let offsets = &config.offsets.ascii_object;

    let length = memory.read_u64(object + offsets.length as u64).ok()?;
    let status = memory.read_u32(object + offsets.state as u64).ok()?;

    if status & (1 << offsets.ascii_bit) == 0 || status & (1 << offsets.compact_bit) == 0 {
        metrics.python_non_compact_ascii_strings += 1;
        return None;
    }

    let length = (length as usize).min(max_length);
    let mut buffer = vec![0u8; length];
    memory.read(object + offsets.data as u64, &mut buffer).ok()?;
    // Compact ASCII data is 7-bit by definition.
    String::from_utf8(buffer).ok()
}

/// Fills in the frame's symbol key, reading and caching the symbol
/// strings if this code object has not been seen yet.
fn process_frame(
    config: &PythonConfig,
    frame: u64,
    pid: u32,
    cache: &mut PythonSymbolCache,
    memory: &impl UserMemory,
    metrics: &mut SamplerMetrics,
) -> Option<PythonFrame> {
    let offsets = &config.offsets;

    let code = memory
        .read_ptr(frame + offsets.interpreter_frame.f_code as u64)
        .ok()?;
    if code == 0 {
        log::trace!("python: read NULL PyCodeObject pointer");
        return None;
    }

    let co_firstlineno = memory
        .read_u32(code + offsets.code_object.co_firstlineno as u64)
        .ok()? as i32;

    let symbol_key = PythonSymbolKey {
        code_object: code,
        pid,
        co_firstlineno,
    };

    if cache.contains(&symbol_key) {
        // The strings were read before; skip straight to the key.
        return Some(PythonFrame { symbol_key });
    }

    let qualname_ptr = memory
        .read_ptr(code + offsets.code_object.qualname as u64)
        .ok()?;
    let filename_ptr = memory
        .read_ptr(code + offsets.code_object.filename as u64)
        .ok()?;

    let mut symbol = PythonSymbol::default();
    if filename_ptr != 0 {
        symbol.file_name =
            read_ascii_string(config, filename_ptr, PYTHON_MAX_FILENAME_LENGTH, memory, metrics)?;
    }
    if qualname_ptr != 0 {
        symbol.qual_name =
            read_ascii_string(config, qualname_ptr, PYTHON_MAX_FUNCNAME_LENGTH, memory, metrics)?;
    }

    cache.insert(symbol_key, symbol);
    Some(PythonFrame { symbol_key })
}

fn walk_stack(
    config: &PythonConfig,
    start_frame: u64,
    state: &mut PythonState,
    cache: &mut PythonSymbolCache,
    memory: &impl UserMemory,
    metrics: &mut SamplerMetrics,
) {
    let mut frame = start_frame;
    let mut previous_was_cstack = false;

    for _ in 0..PYTHON_MAX_STACK_DEPTH {
        if frame == 0 {
            break;
        }

        let Some(owner) = read_frame_owner(config, frame, memory, metrics) else {
            break;
        };

        if owner == PythonFrameOwner::CStack as u8 {
            // Stub frame marking a section of C stack between Python
            // frames. Two of these in a row mean a malformed frame chain.
            if previous_was_cstack {
                log::trace!("python: two consecutive C-stack frames, stopping");
                break;
            }
            previous_was_cstack = true;
            state.frames.push(PythonFrame {
                symbol_key: PythonSymbolKey::cstack_stub(),
            });
        } else {
            previous_was_cstack = false;
            let Some(processed) =
                process_frame(config, frame, state.pid, cache, memory, metrics)
            else {
                break;
            };
            state.frames.push(processed);
        }

        let Some(previous) = read_previous_frame(config, frame, memory, metrics) else {
            break;
        };
        frame = previous;
    }

    log::trace!("python: collected {} frames", state.frames.len());
}

/// Collects the Python stack of the sampled thread into `state`.
pub fn collect_python_stack(
    config: &PythonConfig,
    pid: u32,
    native_tid: u32,
    fsbase: u64,
    mm_start_code: u64,
    memory: &impl UserMemory,
    thread_states: &mut PythonThreadStateCache,
    symbols: &mut PythonSymbolCache,
    state: &mut PythonState,
    metrics: &mut SamplerMetrics,
) {
    metrics.python_processed_stacks += 1;
    state.reset(pid);

    let Some(thread_state) = acquire_thread_state(
        config,
        fsbase,
        mm_start_code,
        native_tid,
        memory,
        thread_states,
        metrics,
    ) else {
        metrics.python_tls_thread_state_null += 1;
        return;
    };

    let Some(frame) = read_current_frame_from_thread_state(config, thread_state, memory, metrics)
    else {
        return;
    };

    walk_stack(config, frame, state, symbols, memory, metrics);
}
