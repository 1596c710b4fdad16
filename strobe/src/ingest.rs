//! Turning sample records into normalized profiles.
//!
//! The ingester resolves record stacks against the executable mappings
//! and the Python symbol cache and feeds a profile builder. Native frames
//! stay unsymbolized (binary plus offset; symbol resolution is a concern
//! of the symbolizer downstream), Python frames become named functions in
//! the `[python]` pseudo-binary, and kernel frames land in the `[kernel]`
//! pseudo-binary so that the pprof bridge can classify them back.

use columnar_profile::pprof::{KERNEL_SPECIAL_MAPPING, PYTHON_SPECIAL_MAPPING};
use columnar_profile::{
    BinaryId as ProfileBinaryId, BinaryInfo, FunctionInfo, InlineChainInfo, NumberLabelInfo,
    ProfileBuildError, ProfileBuilder, SampleInfo, SampleKeyInfo, SourceLineInfo, StackFrameInfo,
    StackInfo, StringId, StringLabelInfo, ThreadInfo, ValueTypeId,
};

use crate::binary::BinaryId;
use crate::cgroups::END_OF_CGROUP_LIST;
use crate::fast_hash_map::FastHashMap;
use crate::python::walker::{PythonSymbolCache, PythonSymbolKey};
use crate::sample::SampleRecord;
use crate::task::comm_to_str;
use crate::tls::TlsValue;
use crate::unwind::ProcessMappings;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub hostname: String,
    /// Type and unit of the event-count column.
    pub event_value_type: (String, String),
    /// Also emit a wall-time column from the per-thread time deltas.
    pub record_walltime: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            hostname: String::new(),
            event_value_type: ("cycles".to_string(), "count".to_string()),
            record_walltime: false,
        }
    }
}

pub struct RecordIngester {
    builder: ProfileBuilder,
    event_value_type: ValueTypeId,
    wall_value_type: Option<ValueTypeId>,
    kernel_binary: ProfileBinaryId,
    python_binary: ProfileBinaryId,
    binaries: FastHashMap<BinaryId, ProfileBinaryId>,
    tls_names: FastHashMap<u64, String>,
    cgroup_label_key: StringId,
}

impl RecordIngester {
    pub fn new(options: &IngestOptions) -> Result<Self, ProfileBuildError> {
        let mut builder = ProfileBuilder::new();
        builder.set_hostname(&options.hostname)?;

        let event_type = builder.add_string(&options.event_value_type.0)?;
        let event_unit = builder.add_string(&options.event_value_type.1)?;
        let event_value_type = builder.add_value_type(event_type, event_unit)?;
        builder.set_default_sample_type(event_type);

        let wall_value_type = if options.record_walltime {
            let wall_type = builder.add_string("wall")?;
            let wall_unit = builder.add_string("nanoseconds")?;
            Some(builder.add_value_type(wall_type, wall_unit)?)
        } else {
            None
        };

        let kernel_path = builder.add_string(KERNEL_SPECIAL_MAPPING)?;
        let kernel_binary = builder.add_binary(&BinaryInfo {
            build_id: StringId::ZERO,
            path: kernel_path,
        });
        let python_path = builder.add_string(PYTHON_SPECIAL_MAPPING)?;
        let python_binary = builder.add_binary(&BinaryInfo {
            build_id: StringId::ZERO,
            path: python_path,
        });

        let cgroup_label_key = builder.add_string("cgroup")?;

        Ok(RecordIngester {
            builder,
            event_value_type,
            wall_value_type,
            kernel_binary,
            python_binary,
            binaries: FastHashMap::default(),
            tls_names: FastHashMap::default(),
            cgroup_label_key,
        })
    }

    /// Associates a sampled binary id with its build id and path, so its
    /// frames carry real identity instead of a synthesized one.
    pub fn register_binary(
        &mut self,
        id: BinaryId,
        build_id: &str,
        path: &str,
    ) -> Result<(), ProfileBuildError> {
        let build_id = self.builder.add_string(build_id)?;
        let path = self.builder.add_string(path)?;
        let binary = self.builder.add_binary(&BinaryInfo { build_id, path });
        self.binaries.insert(id, binary);
        Ok(())
    }

    /// Names a tracked TLS variable (from the analysis artifact), used as
    /// the label key for its readings.
    pub fn register_tls_name(&mut self, offset: u64, name: &str) {
        self.tls_names.insert(offset, name.to_string());
    }

    pub fn ingest(
        &mut self,
        record: &SampleRecord,
        mappings: &ProcessMappings,
        symbols: &PythonSymbolCache,
    ) -> Result<(), ProfileBuildError> {
        let thread = self.ingest_thread(record)?;
        let kernel_stack = self.ingest_kernel_stack(record)?;
        let user_stack = self.ingest_user_stack(record, mappings, symbols)?;
        let labels = self.ingest_labels(record)?;

        let key = self.builder.add_sample_key(&SampleKeyInfo {
            thread,
            user_stack,
            kernel_stack,
            labels,
        });

        let mut values = vec![(self.event_value_type, record.value)];
        if let Some(wall) = self.wall_value_type {
            values.push((wall, record.timedelta));
        }

        self.builder.add_sample(&SampleInfo {
            key,
            timestamp: None,
            values,
        })?;
        Ok(())
    }

    pub fn finish(self) -> columnar_profile::proto::Profile {
        self.builder.finish()
    }

    fn ingest_thread(
        &mut self,
        record: &SampleRecord,
    ) -> Result<columnar_profile::ThreadId, ProfileBuildError> {
        let process_name = self.builder.add_string(comm_to_str(&record.process_comm))?;
        let thread_name = self.builder.add_string(comm_to_str(&record.thread_comm))?;
        Ok(self.builder.add_thread(&ThreadInfo {
            process_id: record.pid as u64,
            thread_id: record.tid as u64,
            process_name,
            thread_name,
            containers: Vec::new(),
        }))
    }

    fn ingest_kernel_stack(
        &mut self,
        record: &SampleRecord,
    ) -> Result<columnar_profile::StackId, ProfileBuildError> {
        let mut frames = Vec::with_capacity(record.kernel_stack.len());
        for ip in record.kernel_stack.ips() {
            frames.push(self.builder.add_stack_frame(&StackFrameInfo {
                binary: self.kernel_binary,
                binary_offset: *ip as i64,
                inline_chain: columnar_profile::InlineChainId::ZERO,
            }));
        }
        Ok(self.builder.add_stack(&StackInfo { frames }))
    }

    fn ingest_user_stack(
        &mut self,
        record: &SampleRecord,
        mappings: &ProcessMappings,
        symbols: &PythonSymbolCache,
    ) -> Result<columnar_profile::StackId, ProfileBuildError> {
        let mut frames = Vec::new();

        // The Python stack is the interpreted view of the leaf side of
        // the native stack, so its frames go first.
        for frame in &record.python_stack {
            if frame.symbol_key.is_cstack_stub() {
                continue;
            }
            frames.push(self.python_frame(&frame.symbol_key, symbols)?);
        }

        for ip in record.user_stack.ips() {
            frames.push(self.native_frame(record.pid, *ip, mappings)?);
        }

        Ok(self.builder.add_stack(&StackInfo { frames }))
    }

    fn python_frame(
        &mut self,
        key: &PythonSymbolKey,
        symbols: &PythonSymbolCache,
    ) -> Result<columnar_profile::StackFrameId, ProfileBuildError> {
        let (name, filename) = match symbols.peek(key) {
            Some(symbol) => (
                self.builder.add_string(&symbol.qual_name)?,
                self.builder.add_string(&symbol.file_name)?,
            ),
            None => {
                // The symbol was evicted between sampling and ingestion.
                let name = format!("<unknown python function {:#x}>", key.code_object);
                (self.builder.add_string(&name)?, StringId::ZERO)
            }
        };

        let start_line = u32::try_from(key.co_firstlineno).unwrap_or(0);
        let function = self.builder.add_function(&FunctionInfo {
            name,
            system_name: name,
            filename,
            start_line,
        });
        let inline_chain = self.builder.add_inline_chain(&InlineChainInfo {
            lines: vec![SourceLineInfo {
                function,
                line: start_line,
                column: 0,
            }],
        });
        Ok(self.builder.add_stack_frame(&StackFrameInfo {
            binary: self.python_binary,
            binary_offset: 0,
            inline_chain,
        }))
    }

    fn native_frame(
        &mut self,
        pid: u32,
        ip: u64,
        mappings: &ProcessMappings,
    ) -> Result<columnar_profile::StackFrameId, ProfileBuildError> {
        if let Some(mapping) = mappings.locate(pid, ip) {
            let binary = match self.binaries.get(&mapping.binary_id) {
                Some(binary) => *binary,
                None => {
                    // Unregistered binary: keep it distinguishable by its
                    // sampled id.
                    let path = format!("<binary {}>", mapping.binary_id);
                    let path = self.builder.add_string(&path)?;
                    let binary = self.builder.add_binary(&BinaryInfo {
                        build_id: StringId::ZERO,
                        path,
                    });
                    self.binaries.insert(mapping.binary_id, binary);
                    binary
                }
            };
            return Ok(self.builder.add_stack_frame(&StackFrameInfo {
                binary,
                binary_offset: ip.wrapping_sub(mapping.file_offset as u64) as i64,
                inline_chain: columnar_profile::InlineChainId::ZERO,
            }));
        }

        // No mapping covers the ip; keep the raw address as a name.
        let name = format!("{ip:#x}");
        let name = self.builder.add_string(&name)?;
        let function = self.builder.add_function(&FunctionInfo {
            name,
            system_name: name,
            filename: StringId::ZERO,
            start_line: 0,
        });
        let inline_chain = self.builder.add_inline_chain(&InlineChainInfo {
            lines: vec![SourceLineInfo {
                function,
                line: 0,
                column: 0,
            }],
        });
        Ok(self.builder.add_stack_frame(&StackFrameInfo {
            binary: ProfileBinaryId::ZERO,
            binary_offset: 0,
            inline_chain,
        }))
    }

    fn ingest_labels(
        &mut self,
        record: &SampleRecord,
    ) -> Result<Vec<columnar_profile::LabelId>, ProfileBuildError> {
        let mut labels = Vec::new();

        if record.parent_cgroup != END_OF_CGROUP_LIST {
            labels.push(self.builder.add_numeric_label(&NumberLabelInfo {
                key: self.cgroup_label_key,
                value: record.parent_cgroup as i64,
            }));
        }

        for variable in &record.tls_values.values {
            let key = match self.tls_names.get(&variable.offset) {
                Some(name) => self.builder.add_string(name)?,
                None => {
                    let name = format!("tls:{:#x}", variable.offset);
                    self.builder.add_string(&name)?
                }
            };
            let label = match &variable.value {
                TlsValue::Number(value) => self.builder.add_numeric_label(&NumberLabelInfo {
                    key,
                    value: *value as i64,
                }),
                TlsValue::String(bytes) => {
                    let value = String::from_utf8_lossy(bytes);
                    let value = self.builder.add_string(&value)?;
                    self.builder.add_string_label(&StringLabelInfo { key, value })
                }
            };
            labels.push(label);
        }

        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use columnar_profile::{
        validate_profile, ProfileView, SampleId, ValidationOptions,
    };

    use crate::python::walker::{PythonFrame, PythonSymbol};
    use crate::sample::SampleRecord;
    use crate::task::comm_from_str;
    use crate::tls::{TlsCollectResult, TlsVariableValue};
    use crate::unwind::mappings::ExecutableMapping;

    fn sample_record() -> SampleRecord {
        let mut record = SampleRecord::new();
        record.pid = 100;
        record.tid = 101;
        record.process_comm = comm_from_str("app");
        record.thread_comm = comm_from_str("worker");
        record.value = 7;
        record.timedelta = 1234;
        record.parent_cgroup = 42;
        record.kernel_stack.push(0xffff_ffff_8100_0000);
        record.user_stack.push(0x401000);
        record.user_stack.push(0x402000);
        record
    }

    fn mappings() -> ProcessMappings {
        let mut mappings = ProcessMappings::new();
        mappings
            .insert(
                100,
                ExecutableMapping {
                    begin: 0x400000,
                    end: 0x500000,
                    binary_id: 9,
                    file_offset: 0x400000,
                },
            )
            .unwrap();
        mappings
    }

    #[test]
    fn records_become_a_valid_profile() {
        let mut ingester = RecordIngester::new(&IngestOptions {
            record_walltime: true,
            ..Default::default()
        })
        .unwrap();
        ingester.register_binary(9, "abc123", "/usr/bin/app").unwrap();

        let mappings = mappings();
        let symbols = PythonSymbolCache::new();
        ingester
            .ingest(&sample_record(), &mappings, &symbols)
            .unwrap();
        ingester
            .ingest(&sample_record(), &mappings, &symbols)
            .unwrap();

        let profile = ingester.finish();
        validate_profile(&profile, ValidationOptions::default()).unwrap();

        // Identical records merged into one sample with doubled values.
        assert_eq!(profile.samples.key.len(), 1);
        assert_eq!(profile.samples.values[0].value, vec![14]);
        assert_eq!(profile.samples.values[1].value, vec![2468]);

        let view = ProfileView::new(&profile).unwrap();
        let sample = view.sample(SampleId::ZERO);
        let key = sample.key();
        assert_eq!(key.thread().process_id(), 100);
        assert_eq!(key.thread().process_name(), "app");
        assert_eq!(key.user_stack().frame_count(), 2);
        assert_eq!(key.user_stack().frame(0).binary().path(), "/usr/bin/app");
        assert_eq!(key.user_stack().frame(0).binary_offset(), 0x1000);
        assert_eq!(key.kernel_stack().frame_count(), 1);
        assert_eq!(key.kernel_stack().frame(0).binary().path(), "[kernel]");
    }

    #[test]
    fn python_frames_resolve_through_the_symbol_cache() {
        let mut ingester = RecordIngester::new(&IngestOptions::default()).unwrap();

        let key = PythonSymbolKey {
            code_object: 0xdead0000,
            pid: 100,
            co_firstlineno: 17,
        };
        let mut symbols = PythonSymbolCache::new();
        symbols.insert(
            key,
            PythonSymbol {
                file_name: "svc.py".to_string(),
                qual_name: "Service.run".to_string(),
            },
        );

        let mut record = sample_record();
        record.python_stack.push(PythonFrame { symbol_key: key });

        ingester.ingest(&record, &mappings(), &symbols).unwrap();
        let profile = ingester.finish();
        validate_profile(&profile, ValidationOptions::default()).unwrap();

        let view = ProfileView::new(&profile).unwrap();
        let key = view.sample(SampleId::ZERO).key();
        // Python frame first (leaf side), then the native frames.
        assert_eq!(key.user_stack().frame_count(), 3);
        let python_frame = key.user_stack().frame(0);
        assert_eq!(python_frame.binary().path(), "[python]");
        let line = python_frame.inline_chain().line(0);
        assert_eq!(line.function().name(), "Service.run");
        assert_eq!(line.function().filename(), "svc.py");
        assert_eq!(line.function().start_line(), 17);
    }

    #[test]
    fn tls_readings_become_labels() {
        let mut ingester = RecordIngester::new(&IngestOptions::default()).unwrap();
        ingester.register_tls_name(0x100, "request_id");

        let mut record = sample_record();
        record.parent_cgroup = END_OF_CGROUP_LIST;
        record.tls_values = TlsCollectResult {
            values: vec![
                TlsVariableValue {
                    offset: 0x100,
                    value: TlsValue::Number(5555),
                },
                TlsVariableValue {
                    offset: 0x200,
                    value: TlsValue::String(b"checkout".to_vec()),
                },
            ],
        };

        let symbols = PythonSymbolCache::new();
        ingester.ingest(&record, &mappings(), &symbols).unwrap();
        let profile = ingester.finish();

        let view = ProfileView::new(&profile).unwrap();
        let key = view.sample(SampleId::ZERO).key();
        let labels: Vec<(String, String)> = key
            .labels()
            .map(|label| {
                let value = match label.value() {
                    columnar_profile::LabelValue::String(s) => s.to_string(),
                    columnar_profile::LabelValue::Number(n) => n.to_string(),
                };
                (label.key().to_string(), value)
            })
            .collect();
        assert_eq!(
            labels,
            vec![
                ("request_id".to_string(), "5555".to_string()),
                ("tls:0x200".to_string(), "checkout".to_string()),
            ]
        );
    }
}
