//! Locating the sampled thread's `PyThreadState`.
//!
//! The fast path reads the thread-state pointer out of thread-local
//! storage. Either way the interpreter's thread list is walked (bounded in
//! both directions) to keep a `native_tid -> PyThreadState*` cache warm,
//! which covers binaries that do not expose the TLS slot and threads whose
//! TLS read fails.

use schnellru::{ByLength, LruMap};

use crate::memory::UserMemory;
use crate::metrics::SamplerMetrics;
use crate::python::config::{
    PythonConfig, PythonThreadStateOffsets, MAX_PYTHON_THREADS, MAX_PYTHON_THREAD_STATE_WALK,
};

pub struct PythonThreadStateCache {
    cache: LruMap<u32, u64>,
}

impl PythonThreadStateCache {
    pub fn new() -> Self {
        PythonThreadStateCache {
            cache: LruMap::new(ByLength::new(MAX_PYTHON_THREADS as u32)),
        }
    }

    pub fn get(&mut self, native_tid: u32) -> Option<u64> {
        self.cache.get(&native_tid).copied()
    }

    pub fn upsert(&mut self, native_tid: u32, thread_state: u64) {
        self.cache.insert(native_tid, thread_state);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PythonThreadStateCache {
    fn default() -> Self {
        Self::new()
    }
}

fn read_thread_state_from_tls(
    fsbase: u64,
    tls_offset: u64,
    memory: &impl UserMemory,
    metrics: &mut SamplerMetrics,
) -> Option<u64> {
    let uaddr = fsbase.wrapping_sub(tls_offset);
    match memory.read_ptr(uaddr) {
        Ok(thread_state) => Some(thread_state),
        Err(err) => {
            metrics.python_read_tls_thread_state_errors += 1;
            log::trace!("python: failed to read thread-local thread state: {err}");
            None
        }
    }
}

fn read_native_thread_id(
    thread_state: u64,
    offsets: &PythonThreadStateOffsets,
    memory: &impl UserMemory,
    metrics: &mut SamplerMetrics,
) -> Option<u32> {
    match memory.read_u32(thread_state + offsets.native_thread_id as u64) {
        Ok(0) => None,
        Ok(native_tid) => Some(native_tid),
        Err(err) => {
            metrics.python_read_native_thread_id_errors += 1;
            log::trace!("python: failed to read native thread id: {err}");
            None
        }
    }
}

fn read_linked_thread_state(
    thread_state: u64,
    offset: u32,
    memory: &impl UserMemory,
) -> Option<u64> {
    match memory.read_ptr(thread_state + offset as u64) {
        Ok(next) => Some(next),
        Err(err) => {
            log::trace!("python: failed to read linked thread state: {err}");
            None
        }
    }
}

/// The `_PyRuntime` singleton lives at a fixed offset from the binary's
/// text start, which sidesteps ASLR.
fn runtime_address(config: &PythonConfig, mm_start_code: u64) -> u64 {
    mm_start_code.wrapping_add(config.py_runtime_relative_address)
}

fn read_head_thread_state(
    config: &PythonConfig,
    mm_start_code: u64,
    memory: &impl UserMemory,
) -> Option<u64> {
    if config.py_runtime_relative_address == 0 {
        return None;
    }

    let runtime = runtime_address(config, mm_start_code);
    let main_interpreter = memory
        .read_ptr(runtime + config.offsets.runtime_state.interpreters_main as u64)
        .ok()?;
    if main_interpreter == 0 {
        log::trace!("python: main interpreter state is NULL");
        return None;
    }

    let head = memory
        .read_ptr(main_interpreter + config.offsets.interpreter_state.threads_head as u64)
        .ok()?;
    if head == 0 {
        log::trace!("python: head thread state is NULL");
        return None;
    }
    Some(head)
}

fn fill_threads_cache(
    start: u64,
    offsets: &PythonThreadStateOffsets,
    memory: &impl UserMemory,
    cache: &mut PythonThreadStateCache,
    metrics: &mut SamplerMetrics,
) {
    let mut upsert = |thread_state: u64| {
        if let Some(native_tid) = read_native_thread_id(thread_state, offsets, memory, metrics) {
            cache.upsert(native_tid, thread_state);
        }
    };

    let mut forward = Some(start);
    for _ in 0..MAX_PYTHON_THREAD_STATE_WALK {
        let Some(thread_state) = forward.filter(|ts| *ts != 0) else {
            break;
        };
        upsert(thread_state);
        forward = read_linked_thread_state(thread_state, offsets.next_thread, memory);
    }

    let mut backward = Some(start);
    for _ in 0..MAX_PYTHON_THREAD_STATE_WALK {
        let Some(thread_state) = backward.filter(|ts| *ts != 0) else {
            break;
        };
        upsert(thread_state);
        backward = read_linked_thread_state(thread_state, offsets.prev_thread, memory);
    }
}

/// Returns the sampled thread's `PyThreadState` pointer, refreshing the
/// thread cache along the way.
pub fn acquire_thread_state(
    config: &PythonConfig,
    fsbase: u64,
    mm_start_code: u64,
    native_tid: u32,
    memory: &impl UserMemory,
    cache: &mut PythonThreadStateCache,
    metrics: &mut SamplerMetrics,
) -> Option<u64> {
    let from_tls = read_thread_state_from_tls(
        fsbase,
        config.py_thread_state_tls_offset,
        memory,
        metrics,
    )
    .filter(|ts| *ts != 0);

    let cache_seed = match from_tls {
        Some(thread_state) => Some(thread_state),
        None => read_head_thread_state(config, mm_start_code, memory),
    };
    if let Some(seed) = cache_seed {
        fill_threads_cache(seed, &config.offsets.thread_state, memory, cache, metrics);
    }

    let current = from_tls.or_else(|| cache.get(native_tid));
    if current.is_none() {
        log::trace!("python: no thread state from either TLS or the cache");
    }
    current
}
