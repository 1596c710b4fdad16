//! Lossy bidirectional conversion between the columnar profile and pprof.
//!
//! The inbound direction understands two special mapping path values:
//! `[kernel]` marks locations that belong on the kernel stack, `[python]`
//! marks locations that are dropped from the native stack (their symbols
//! travel as interpreter frames elsewhere). These strings are the de facto
//! contract with pprof producers, not an accident.
//!
//! The outbound direction synthesizes mapping address ranges (128 GiB
//! strides) so that locations in distinct binaries get distinct absolute
//! addresses; the round-trip is lossy on addresses and exact on symbol
//! names.

pub mod proto;

use thiserror::Error;

use self::proto as pprof;
use crate::builder::{
    BinaryInfo, FunctionInfo, InlineChainInfo, NumberLabelInfo, ProfileBuildError, ProfileBuilder,
    SampleInfo, SampleKeyInfo, SourceLineInfo, StackFrameInfo, StackInfo, StringLabelInfo,
    ThreadInfo,
};
use crate::fast_hash_map::{FastHashMap, FastHashSet};
use crate::index::{
    BinaryId, FunctionId, LabelId, StackFrameId, StackId, StringId, ValueTypeId,
};
use crate::profile::{LabelValue, ProfileView, StackRef};
use crate::validate::ValidationError;

pub const KERNEL_SPECIAL_MAPPING: &str = "[kernel]";
pub const PYTHON_SPECIAL_MAPPING: &str = "[python]";

/// The columnar profile does not know real mapping address ranges, so the
/// outbound conversion gives each binary its own 128 GiB stride.
const FAKE_MAPPING_SIZE: u64 = 128 << 30;

/// Well-known label keys carrying thread identity. They are lifted into
/// the dedicated thread entity on the way in and re-emitted as labels on
/// the way out.
pub mod thread_label_keys {
    pub const THREAD_ID: &str = "tid";
    pub const PROCESS_ID: &str = "pid";
    pub const PROCESS_NAME: &str = "process_comm";
    pub const THREAD_NAME: &str = "thread_comm";
    pub const THREAD_NAME_DEPRECATED: &str = "comm";
    pub const WORKLOAD_NAME: &str = "workload";

    pub const ALL: [&str; 6] = [
        THREAD_ID,
        PROCESS_ID,
        PROCESS_NAME,
        THREAD_NAME,
        THREAD_NAME_DEPRECATED,
        WORKLOAD_NAME,
    ];
}

#[derive(Debug, Error)]
pub enum PprofConvertError {
    #[error(transparent)]
    Build(#[from] ProfileBuildError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("pprof string table must start with the empty string")]
    BadStringTable,

    #[error("pprof string index {0} out of range")]
    StringIndexOutOfRange(i64),

    #[error("{0} id must be nonzero")]
    ZeroId(&'static str),

    #[error("duplicate {0} id {1}")]
    DuplicateId(&'static str, u64),

    #[error("unknown {0} id {1}")]
    UnknownId(&'static str, u64),

    #[error("found more than one {0} special mapping")]
    DuplicateSpecialMapping(&'static str),

    #[error("unexpected mixed userspace & kernelspace stack")]
    MixedKernelUserStack,

    #[error("stack frame without a binary carries a nonzero offset")]
    MalformedFrame,

    #[error("synthesized location address must be positive")]
    NegativeAddress,
}

/// Parses a pprof profile into the columnar representation.
pub fn convert_from_pprof(from: &pprof::Profile) -> Result<crate::proto::Profile, PprofConvertError> {
    FromPprofConverter::new(from).convert()
}

/// Writes a columnar profile as a pprof profile.
pub fn convert_to_pprof(from: &crate::proto::Profile) -> Result<pprof::Profile, PprofConvertError> {
    let view = ProfileView::new(from)?;
    ToPprofConverter::new(view).convert()
}

/// Indices that sort the string table by content; interning in this order
/// makes the blob friendlier to compression.
fn make_sorted_permutation(strings: &[String]) -> Vec<usize> {
    let mut permutation: Vec<usize> = (0..strings.len()).collect();
    permutation.sort_by(|&a, &b| strings[a].cmp(&strings[b]));
    permutation
}

struct FromPprofConverter<'a> {
    old: &'a pprof::Profile,
    builder: ProfileBuilder,
    strings: FastHashMap<i64, StringId>,
    binaries: FastHashMap<u64, (usize, BinaryId)>,
    functions: FastHashMap<u64, FunctionId>,
    locations: FastHashMap<u64, StackFrameId>,
    value_types: Vec<ValueTypeId>,
    kernel_location_ids: FastHashSet<u64>,
    python_location_ids: FastHashSet<u64>,
    kernel_mapping_id: Option<u64>,
    python_mapping_id: Option<u64>,
}

impl<'a> FromPprofConverter<'a> {
    fn new(old: &'a pprof::Profile) -> Self {
        FromPprofConverter {
            old,
            builder: ProfileBuilder::new(),
            strings: FastHashMap::default(),
            binaries: FastHashMap::default(),
            functions: FastHashMap::default(),
            locations: FastHashMap::default(),
            value_types: Vec::new(),
            kernel_location_ids: FastHashSet::default(),
            python_location_ids: FastHashSet::default(),
            kernel_mapping_id: None,
            python_mapping_id: None,
        }
    }

    fn convert(mut self) -> Result<crate::proto::Profile, PprofConvertError> {
        self.convert_strings()?;
        self.convert_binaries()?;
        self.convert_functions()?;
        self.convert_locations()?;
        self.convert_comments()?;
        self.convert_metadata()?;
        self.convert_samples()?;
        Ok(self.builder.finish())
    }

    fn old_string(&self, id: i64) -> Result<&'a str, PprofConvertError> {
        self.old
            .string_table
            .get(usize::try_from(id).map_err(|_| PprofConvertError::StringIndexOutOfRange(id))?)
            .map(|s| s.as_str())
            .ok_or(PprofConvertError::StringIndexOutOfRange(id))
    }

    fn convert_strings(&mut self) -> Result<(), PprofConvertError> {
        if self.old.string_table.first().map(|s| s.as_str()) != Some("") {
            return Err(PprofConvertError::BadStringTable);
        }

        for i in make_sorted_permutation(&self.old.string_table) {
            let id = self.builder.add_string(&self.old.string_table[i])?;
            self.strings.insert(i as i64, id);
        }
        Ok(())
    }

    fn convert_string(&self, id: i64) -> Result<StringId, PprofConvertError> {
        self.strings
            .get(&id)
            .copied()
            .ok_or(PprofConvertError::StringIndexOutOfRange(id))
    }

    fn convert_binaries(&mut self) -> Result<(), PprofConvertError> {
        let mut kernel_mapping_id = None;
        let mut python_mapping_id = None;

        for (i, mapping) in self.old.mapping.iter().enumerate() {
            if mapping.id == 0 {
                return Err(PprofConvertError::ZeroId("mapping"));
            }

            let info = BinaryInfo {
                build_id: self.convert_string(mapping.build_id)?,
                path: self.convert_string(mapping.filename)?,
            };
            let binary = self.builder.add_binary(&info);
            if self.binaries.insert(mapping.id, (i, binary)).is_some() {
                return Err(PprofConvertError::DuplicateId("mapping", mapping.id));
            }

            match self.old_string(mapping.filename)? {
                KERNEL_SPECIAL_MAPPING => {
                    if kernel_mapping_id.replace(mapping.id).is_some() {
                        return Err(PprofConvertError::DuplicateSpecialMapping(
                            KERNEL_SPECIAL_MAPPING,
                        ));
                    }
                }
                PYTHON_SPECIAL_MAPPING => {
                    if python_mapping_id.replace(mapping.id).is_some() {
                        return Err(PprofConvertError::DuplicateSpecialMapping(
                            PYTHON_SPECIAL_MAPPING,
                        ));
                    }
                }
                _ => {}
            }
        }

        self.kernel_mapping_id = kernel_mapping_id;
        self.python_mapping_id = python_mapping_id;
        Ok(())
    }

    fn convert_functions(&mut self) -> Result<(), PprofConvertError> {
        for function in &self.old.function {
            if function.id == 0 {
                return Err(PprofConvertError::ZeroId("function"));
            }

            let info = FunctionInfo {
                name: self.convert_string(function.name)?,
                system_name: self.convert_string(function.system_name)?,
                filename: self.convert_string(function.filename)?,
                start_line: function.start_line as u32,
            };
            let id = self.builder.add_function(&info);
            if self.functions.insert(function.id, id).is_some() {
                return Err(PprofConvertError::DuplicateId("function", function.id));
            }
        }
        Ok(())
    }

    fn convert_locations(&mut self) -> Result<(), PprofConvertError> {
        for location in &self.old.location {
            if location.id == 0 {
                return Err(PprofConvertError::ZeroId("location"));
            }

            let (binary, binary_offset) = if location.mapping_id != 0 {
                let (position, binary) = *self
                    .binaries
                    .get(&location.mapping_id)
                    .ok_or(PprofConvertError::UnknownId("mapping", location.mapping_id))?;
                let mapping = &self.old.mapping[position];
                let offset = location.address as i64 + mapping.file_offset as i64
                    - mapping.memory_start as i64;
                (binary, offset)
            } else {
                (BinaryId::ZERO, 0)
            };

            let mut lines = Vec::with_capacity(location.line.len());
            for line in &location.line {
                let function = *self
                    .functions
                    .get(&line.function_id)
                    .ok_or(PprofConvertError::UnknownId("function", line.function_id))?;
                lines.push(SourceLineInfo {
                    function,
                    line: line.line as u32,
                    column: line.column as u32,
                });
            }
            let inline_chain = self.builder.add_inline_chain(&InlineChainInfo { lines });

            let frame = self.builder.add_stack_frame(&StackFrameInfo {
                binary,
                binary_offset,
                inline_chain,
            });
            if self.locations.insert(location.id, frame).is_some() {
                return Err(PprofConvertError::DuplicateId("location", location.id));
            }

            if Some(location.mapping_id) == self.kernel_mapping_id {
                self.kernel_location_ids.insert(location.id);
            } else if Some(location.mapping_id) == self.python_mapping_id {
                self.python_location_ids.insert(location.id);
            }
        }
        Ok(())
    }

    fn convert_comments(&mut self) -> Result<(), PprofConvertError> {
        for comment in &self.old.comment {
            let string = self.convert_string(*comment)?;
            self.builder.add_comment(string);
        }
        Ok(())
    }

    fn convert_metadata(&mut self) -> Result<(), PprofConvertError> {
        if self.old.default_sample_type != 0 {
            let mapped = self.convert_string(self.old.default_sample_type)?;
            self.builder.set_default_sample_type(mapped);
        }
        Ok(())
    }

    fn convert_samples(&mut self) -> Result<(), PprofConvertError> {
        for value_type in &self.old.sample_type {
            let r#type = self.convert_string(value_type.r#type)?;
            let unit = self.convert_string(value_type.unit)?;
            let id = self.builder.add_value_type(r#type, unit)?;
            self.value_types.push(id);
        }

        for sample in &self.old.sample {
            self.convert_sample(sample)?;
        }
        Ok(())
    }

    fn convert_sample(&mut self, sample: &'a pprof::Sample) -> Result<(), PprofConvertError> {
        let (user_stack, kernel_stack) = self.convert_sample_stack(sample)?;
        let (thread, labels) = self.convert_sample_labels(sample)?;

        let key = self.builder.add_sample_key(&SampleKeyInfo {
            thread,
            user_stack,
            kernel_stack,
            labels,
        });

        let mut values = Vec::with_capacity(sample.value.len());
        for (i, value) in sample.value.iter().enumerate() {
            let value_type = *self
                .value_types
                .get(i)
                .ok_or(PprofConvertError::UnknownId("sample_type", i as u64))?;
            values.push((value_type, *value as u64));
        }

        self.builder.add_sample(&SampleInfo {
            key,
            timestamp: None,
            values,
        })?;
        Ok(())
    }

    fn convert_sample_stack(
        &mut self,
        sample: &pprof::Sample,
    ) -> Result<(StackId, StackId), PprofConvertError> {
        let mut kernel_frames = Vec::new();
        let mut user_frames = Vec::new();

        // Locations are ordered leaf first, and kernel frames precede
        // userspace ones.
        let mut inside_kernel = true;
        for location_id in &sample.location_id {
            let frame = *self
                .locations
                .get(location_id)
                .ok_or(PprofConvertError::UnknownId("location", *location_id))?;

            if self.python_location_ids.contains(location_id) {
                continue;
            }

            if self.kernel_location_ids.contains(location_id) {
                if !inside_kernel {
                    return Err(PprofConvertError::MixedKernelUserStack);
                }
                kernel_frames.push(frame);
            } else {
                inside_kernel = false;
                user_frames.push(frame);
            }
        }

        let kernel_stack = self.builder.add_stack(&StackInfo {
            frames: kernel_frames,
        });
        let user_stack = self.builder.add_stack(&StackInfo {
            frames: user_frames,
        });
        Ok((user_stack, kernel_stack))
    }

    fn convert_sample_labels(
        &mut self,
        sample: &'a pprof::Sample,
    ) -> Result<(crate::index::ThreadId, Vec<LabelId>), PprofConvertError> {
        let mut thread = ThreadInfo::default();
        let mut labels = Vec::new();

        for label in &sample.label {
            if self.consume_thread_label(&mut thread, label)? {
                continue;
            }

            let key = self.convert_string(label.key)?;
            let id = if label.num != 0 {
                self.builder.add_numeric_label(&NumberLabelInfo {
                    key,
                    value: label.num,
                })
            } else {
                let value = self.convert_string(label.str)?;
                self.builder.add_string_label(&StringLabelInfo { key, value })
            };
            labels.push(id);
        }

        Ok((self.builder.add_thread(&thread), labels))
    }

    fn consume_thread_label(
        &mut self,
        info: &mut ThreadInfo,
        label: &pprof::Label,
    ) -> Result<bool, PprofConvertError> {
        use thread_label_keys as keys;

        let key = self.old_string(label.key)?;
        match key {
            keys::THREAD_ID => info.thread_id = label.num as u64,
            keys::PROCESS_ID => info.process_id = label.num as u64,
            keys::PROCESS_NAME => info.process_name = self.convert_string(label.str)?,
            keys::THREAD_NAME | keys::THREAD_NAME_DEPRECATED => {
                info.thread_name = self.convert_string(label.str)?;
            }
            keys::WORKLOAD_NAME => info.containers.push(self.convert_string(label.str)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

struct ToPprofConverter<'a> {
    view: ProfileView<'a>,
    out: pprof::Profile,
    well_known_string_ids: FastHashMap<String, i64>,
}

impl<'a> ToPprofConverter<'a> {
    fn new(view: ProfileView<'a>) -> Self {
        ToPprofConverter {
            view,
            out: pprof::Profile::default(),
            well_known_string_ids: FastHashMap::default(),
        }
    }

    fn convert(mut self) -> Result<pprof::Profile, PprofConvertError> {
        self.convert_string_table();
        self.convert_value_types();
        self.convert_comments();
        self.convert_mappings();
        self.convert_functions();
        self.convert_locations()?;
        self.convert_samples();
        self.out.default_sample_type = self.view.metadata().default_sample_type as i64;
        Ok(self.out)
    }

    fn convert_string_table(&mut self) {
        for (_, s) in self.view.strings() {
            if thread_label_keys::ALL.contains(&s) {
                self.well_known_string_ids
                    .entry(s.to_string())
                    .or_insert(self.out.string_table.len() as i64);
            }
            self.out.string_table.push(s.to_string());
        }
    }

    fn string_index(&mut self, key: &str) -> i64 {
        if let Some(id) = self.well_known_string_ids.get(key) {
            return *id;
        }
        let id = self.out.string_table.len() as i64;
        self.well_known_string_ids.insert(key.to_string(), id);
        self.out.string_table.push(key.to_string());
        id
    }

    fn convert_value_types(&mut self) {
        for i in 0..self.view.value_type_count() {
            let value_type = self.view.value_type(ValueTypeId::from_u32(i as u32));
            // String ids were copied verbatim, so they double as pprof
            // string table indices.
            self.out.sample_type.push(pprof::ValueType {
                r#type: value_type.type_id().as_u32() as i64,
                unit: value_type.unit_id().as_u32() as i64,
            });
        }
    }

    fn convert_comments(&mut self) {
        for i in 0..self.view.comment_count() {
            let string = self.view.comment(crate::index::CommentId::from_u32(i as u32));
            self.out.comment.push(string.as_u32() as i64);
        }
    }

    fn convert_mappings(&mut self) {
        for i in 0..self.view.binary_count() {
            // The first binary is empty and must not be present in pprof.
            if i == 0 {
                continue;
            }
            let binary = self.view.binary(BinaryId::from_u32(i as u32));
            self.out.mapping.push(pprof::Mapping {
                id: i as u64,
                build_id: binary.build_id_id().as_u32() as i64,
                filename: binary.path_id().as_u32() as i64,
                memory_start: i as u64 * FAKE_MAPPING_SIZE,
                memory_limit: (i as u64 + 1) * FAKE_MAPPING_SIZE,
                file_offset: 0,
                ..Default::default()
            });
        }
    }

    fn convert_functions(&mut self) {
        for i in 0..self.view.function_count() {
            // Skip the first function, which must be empty.
            if i == 0 {
                continue;
            }
            let function = self.view.function(FunctionId::from_u32(i as u32));
            self.out.function.push(pprof::Function {
                id: i as u64,
                name: function.name_id().as_u32() as i64,
                system_name: function.system_name_id().as_u32() as i64,
                filename: function.filename_id().as_u32() as i64,
                start_line: function.start_line() as i64,
            });
        }
    }

    fn convert_locations(&mut self) -> Result<(), PprofConvertError> {
        for i in 0..self.view.stack_frame_count() {
            let frame = self.view.stack_frame(StackFrameId::from_u32(i as u32));

            // pprof expects nonzero location ids, so all ids shift by one.
            let mut location = pprof::Location {
                id: i as u64 + 1,
                ..Default::default()
            };

            for line in frame.inline_chain().lines() {
                location.line.push(pprof::Line {
                    function_id: line.function().index().as_u32() as u64,
                    line: line.line() as i64,
                    column: line.column() as i64,
                });
            }

            let binary_id = frame.binary().index().as_u32();
            let binary_offset = frame.binary_offset();
            if binary_id == 0 {
                if binary_offset != 0 {
                    return Err(PprofConvertError::MalformedFrame);
                }
                location.mapping_id = 0;
                location.address = 0;
            } else {
                // Build the artificial address against the synthesized
                // mapping range; the inbound direction reverses this.
                let address = binary_offset + (binary_id as u64 * FAKE_MAPPING_SIZE) as i64;
                if address <= 0 {
                    return Err(PprofConvertError::NegativeAddress);
                }
                location.mapping_id = binary_id as u64;
                location.address = address as u64;
            }

            self.out.location.push(location);
        }
        Ok(())
    }

    fn convert_samples(&mut self) {
        for sample in self.view.samples() {
            let mut out = pprof::Sample::default();

            for i in 0..sample.value_count() {
                out.value.push(sample.value(i) as i64);
            }

            let key = sample.key();
            push_stack_locations(&mut out, key.kernel_stack());
            push_stack_locations(&mut out, key.user_stack());

            self.convert_sample_thread_info(&mut out, key);
            for label in key.labels() {
                let key_index = label.key_id().as_u32() as i64;
                match label.value() {
                    LabelValue::Number(num) => out.label.push(pprof::Label {
                        key: key_index,
                        num,
                        ..Default::default()
                    }),
                    LabelValue::String(_) => {
                        let str_index =
                            label.string_value_id().map(|id| id.as_u32() as i64).unwrap_or(0);
                        out.label.push(pprof::Label {
                            key: key_index,
                            str: str_index,
                            ..Default::default()
                        });
                    }
                }
            }

            self.out.sample.push(out);
        }
    }

    fn convert_sample_thread_info(
        &mut self,
        sample: &mut pprof::Sample,
        key: crate::profile::SampleKeyRef<'a>,
    ) {
        use thread_label_keys as keys;

        let thread = key.thread();
        if thread.process_id() != 0 {
            let key_index = self.string_index(keys::PROCESS_ID);
            sample.label.push(pprof::Label {
                key: key_index,
                num: thread.process_id() as i64,
                ..Default::default()
            });
        }
        if thread.thread_id() != 0 {
            let key_index = self.string_index(keys::THREAD_ID);
            sample.label.push(pprof::Label {
                key: key_index,
                num: thread.thread_id() as i64,
                ..Default::default()
            });
        }
        if thread.process_name_id() != StringId::ZERO {
            let key_index = self.string_index(keys::PROCESS_NAME);
            sample.label.push(pprof::Label {
                key: key_index,
                str: thread.process_name_id().as_u32() as i64,
                ..Default::default()
            });
        }
        if thread.thread_name_id() != StringId::ZERO {
            let key_index = self.string_index(keys::THREAD_NAME);
            sample.label.push(pprof::Label {
                key: key_index,
                str: thread.thread_name_id().as_u32() as i64,
                ..Default::default()
            });
        }
        for container in thread.container_ids() {
            let key_index = self.string_index(keys::WORKLOAD_NAME);
            sample.label.push(pprof::Label {
                key: key_index,
                str: container.as_u32() as i64,
                ..Default::default()
            });
        }
    }
}

fn push_stack_locations(sample: &mut pprof::Sample, stack: StackRef<'_>) {
    for frame in stack.frames() {
        // Location ids are stack-frame indices shifted by one; see the
        // corresponding comment in convert_locations.
        sample.location_id.push(frame.index().as_u32() as u64 + 1);
    }
}
