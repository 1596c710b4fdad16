//! Tracked thread-local variables.
//!
//! Instrumented binaries mark the variables they want sampled with an
//! 8-byte magic header directly below the thread image: a 7-byte shared
//! prefix plus one kind byte. The sampler verifies the prefix before
//! reading the payload that follows.

use crate::memory::UserMemory;

pub const MAX_TRACKED_THREAD_LOCALS_PER_BINARY: usize = 4;
pub const THREAD_LOCAL_MAGIC_BYTES: usize = 8;
pub const MAX_THREAD_LOCAL_STRING_LENGTH: usize = 128;

pub const TLS_MAGIC_PREFIX: [u8; 7] = [0x7e, 0x6f, 0x06, 0xa7, 0x06, 0x04, 0xa6];

pub const THREAD_LOCAL_UINT64_TYPE: u8 = 1;
pub const THREAD_LOCAL_STRING_TYPE: u8 = 2;

/// Offsets (below fsbase) of the tracked variables of one binary,
/// discovered by the offline analyzer.
#[derive(Debug, Clone, Default)]
pub struct TlsBinaryConfig {
    pub offsets: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsValue {
    Number(u64),
    String(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsVariableValue {
    pub offset: u64,
    pub value: TlsValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsCollectResult {
    pub values: Vec<TlsVariableValue>,
}

impl TlsCollectResult {
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

fn collect_tls_u64(address: u64, memory: &impl UserMemory) -> Option<TlsValue> {
    match memory.read_u64(address) {
        Ok(value) => Some(TlsValue::Number(value)),
        Err(err) => {
            log::trace!("failed to read thread-local u64: {err}");
            None
        }
    }
}

fn collect_tls_string(address: u64, memory: &impl UserMemory) -> Option<TlsValue> {
    let ptr = memory.read_u64(address).ok()?;
    let len = memory.read_u64(address + 8).ok()?;

    if ptr == 0 || len == 0 {
        return Some(TlsValue::String(Vec::new()));
    }

    let len = (len as usize).min(MAX_THREAD_LOCAL_STRING_LENGTH);
    let mut bytes = vec![0u8; len];
    if let Err(err) = memory.read(ptr, &mut bytes) {
        log::trace!("failed to read thread-local string data: {err}");
        return None;
    }
    Some(TlsValue::String(bytes))
}

fn collect_tls_value(
    uthread: u64,
    offset: u64,
    memory: &impl UserMemory,
) -> Option<TlsVariableValue> {
    let variable = uthread.wrapping_sub(offset);

    let mut magic = [0u8; THREAD_LOCAL_MAGIC_BYTES];
    if let Err(err) = memory.read(variable, &mut magic) {
        log::trace!("failed to read thread-local magic at {variable:#x}: {err}");
        return None;
    }
    if magic[..TLS_MAGIC_PREFIX.len()] != TLS_MAGIC_PREFIX {
        log::trace!("thread-local magic bytes are not valid at {variable:#x}");
        return None;
    }

    let payload = variable + THREAD_LOCAL_MAGIC_BYTES as u64;
    let value = match magic[THREAD_LOCAL_MAGIC_BYTES - 1] {
        THREAD_LOCAL_UINT64_TYPE => collect_tls_u64(payload, memory),
        THREAD_LOCAL_STRING_TYPE => collect_tls_string(payload, memory),
        kind => {
            log::trace!("unsupported thread-local kind {kind}");
            None
        }
    }?;

    Some(TlsVariableValue { offset, value })
}

/// Collects the tracked thread-local variables of the current binary,
/// at most [`MAX_TRACKED_THREAD_LOCALS_PER_BINARY`] of them.
pub fn collect_tls_values(
    config: &TlsBinaryConfig,
    fsbase: u64,
    memory: &impl UserMemory,
    result: &mut TlsCollectResult,
) {
    result.clear();

    for offset in config
        .offsets
        .iter()
        .take(MAX_TRACKED_THREAD_LOCALS_PER_BINARY)
    {
        if *offset == 0 {
            break;
        }
        if let Some(value) = collect_tls_value(fsbase, *offset, memory) {
            result.values.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;

    const FSBASE: u64 = 0x7000_0000;

    fn write_magic(memory: &mut FakeMemory, address: u64, kind: u8) {
        memory.write_bytes(address, &TLS_MAGIC_PREFIX);
        memory.write_u8(address + 7, kind);
    }

    #[test]
    fn collects_u64_and_string_variables() {
        let mut memory = FakeMemory::new();

        let number_offset = 0x100;
        write_magic(&mut memory, FSBASE - number_offset, THREAD_LOCAL_UINT64_TYPE);
        memory.write_u64(FSBASE - number_offset + 8, 424242);

        let string_offset = 0x200;
        let data_addr = 0x5000;
        write_magic(&mut memory, FSBASE - string_offset, THREAD_LOCAL_STRING_TYPE);
        memory.write_u64(FSBASE - string_offset + 8, data_addr);
        memory.write_u64(FSBASE - string_offset + 16, 5);
        memory.write_bytes(data_addr, b"hello");

        let config = TlsBinaryConfig {
            offsets: vec![number_offset, string_offset],
        };
        let mut result = TlsCollectResult::default();
        collect_tls_values(&config, FSBASE, &memory, &mut result);

        assert_eq!(
            result.values,
            vec![
                TlsVariableValue {
                    offset: number_offset,
                    value: TlsValue::Number(424242),
                },
                TlsVariableValue {
                    offset: string_offset,
                    value: TlsValue::String(b"hello".to_vec()),
                },
            ]
        );
    }

    #[test]
    fn long_strings_are_clamped() {
        let mut memory = FakeMemory::new();
        let offset = 0x100;
        let data_addr = 0x5000;
        write_magic(&mut memory, FSBASE - offset, THREAD_LOCAL_STRING_TYPE);
        memory.write_u64(FSBASE - offset + 8, data_addr);
        memory.write_u64(FSBASE - offset + 16, 1000);
        memory.write_bytes(data_addr, &[b'x'; 1000]);

        let config = TlsBinaryConfig {
            offsets: vec![offset],
        };
        let mut result = TlsCollectResult::default();
        collect_tls_values(&config, FSBASE, &memory, &mut result);

        assert_eq!(result.values.len(), 1);
        match &result.values[0].value {
            TlsValue::String(bytes) => {
                assert_eq!(bytes.len(), MAX_THREAD_LOCAL_STRING_LENGTH);
            }
            other => panic!("expected a string value, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_skipped() {
        let mut memory = FakeMemory::new();

        let bad_offset = 0x100;
        memory.write_bytes(FSBASE - bad_offset, &[0u8; 8]);

        let good_offset = 0x200;
        write_magic(&mut memory, FSBASE - good_offset, THREAD_LOCAL_UINT64_TYPE);
        memory.write_u64(FSBASE - good_offset + 8, 7);

        let config = TlsBinaryConfig {
            offsets: vec![bad_offset, good_offset],
        };
        let mut result = TlsCollectResult::default();
        collect_tls_values(&config, FSBASE, &memory, &mut result);

        assert_eq!(result.values.len(), 1);
        assert_eq!(result.values[0].offset, good_offset);
    }

    #[test]
    fn variable_count_is_capped() {
        let mut memory = FakeMemory::new();
        let mut offsets = Vec::new();
        for i in 0..6u64 {
            let offset = 0x100 * (i + 1);
            write_magic(&mut memory, FSBASE - offset, THREAD_LOCAL_UINT64_TYPE);
            memory.write_u64(FSBASE - offset + 8, i);
            offsets.push(offset);
        }

        let config = TlsBinaryConfig { offsets };
        let mut result = TlsCollectResult::default();
        collect_tls_values(&config, FSBASE, &memory, &mut result);

        assert_eq!(result.values.len(), MAX_TRACKED_THREAD_LOCALS_PER_BINARY);
    }
}
