//! Merging many profiles into one.
//!
//! For each source profile the merger walks entities in topological order
//! and re-adds them to a destination builder, keeping per-kind remapping
//! tables from source index to destination index. Entities reachable from
//! no sample are not carried over.
//!
//! A merger instance is not safe to share across threads; run one merger
//! per output profile and parallelize across mergers.

use thiserror::Error;

use crate::builder::{
    BinaryInfo, FunctionInfo, InlineChainInfo, NumberLabelInfo, ProfileBuildError, ProfileBuilder,
    SampleInfo, SampleKeyInfo, SourceLineInfo, StackFrameInfo, StackInfo, StringLabelInfo,
    ThreadInfo,
};
use crate::fast_hash_map::FastHashMap;
use crate::index::{
    BinaryId, EntityIndex, FunctionId, InlineChainId, LabelId, SampleKeyId, StackFrameId, StackId,
    StringId, ThreadId, ValueTypeId,
};
use crate::profile::{
    BinaryRef, FunctionRef, InlineChainRef, LabelRef, ProfileView, SampleKeyRef, SampleRef,
    StackFrameRef, StackRef, ThreadRef, ValueTypeRef,
};
use crate::proto;
use crate::validate::ValidationError;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Build(#[from] ProfileBuildError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("duplicate index {0} in remapping")]
    DuplicateIndex(u32),

    #[error("profiles with different feature flags cannot be merged")]
    FeatureMismatch,

    #[error("default sample type mismatch: {expected:?} vs {got:?}")]
    DefaultSampleTypeMismatch { expected: String, got: String },

    #[error("value type {value_type:?} has incompatible units {left:?} and {right:?}")]
    IncompatibleValueTypes {
        value_type: String,
        left: String,
        right: String,
    },

    #[error("cannot normalize unknown unit {0:?}")]
    UnknownUnit(String),
}

/// Options controlling what survives a merge.
pub struct MergeOptions {
    /// Keep thread/process identity. When off, samples with otherwise
    /// identical keys from different processes collapse into one.
    pub keep_processes: bool,

    /// Keep binary identity and binary offsets on stack frames. When off,
    /// merging relies on symbolic names only.
    pub keep_binaries: bool,

    /// When off, binaries with identical build ids but different paths
    /// merge into one.
    pub keep_binary_paths: bool,

    /// Keep sample timestamps. When off, timestamps are stripped so that
    /// duplicate samples can merge.
    pub keep_timestamps: bool,

    /// Keep exact source locations (line and column numbers).
    pub keep_line_numbers: bool,

    /// Reconcile well-known time units (e.g. nanoseconds vs microseconds)
    /// by rescaling incoming values into the destination unit. When off,
    /// differing units reject the merge.
    pub normalize_value_types: bool,

    /// Trim trailing digits from thread names, so that thread-pool workers
    /// like `pool-1`/`pool-2` merge.
    pub cleanup_thread_names: bool,

    /// Labels for which the filter returns false are dropped from sample
    /// keys. `None` keeps every label.
    pub label_filter: Option<Box<dyn Fn(LabelRef<'_>) -> bool>>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            keep_processes: true,
            keep_binaries: true,
            keep_binary_paths: true,
            keep_timestamps: false,
            keep_line_numbers: true,
            normalize_value_types: true,
            cleanup_thread_names: true,
            label_filter: None,
        }
    }
}

/// Nanoseconds per one unit, for the units the merger knows how to
/// reconcile.
fn time_unit_scale(unit: &str) -> Option<u64> {
    match unit {
        "ns" | "nanosecond" | "nanoseconds" => Some(1),
        "us" | "\u{b5}s" | "microsecond" | "microseconds" => Some(1_000),
        "ms" | "millisecond" | "milliseconds" => Some(1_000_000),
        "s" | "sec" | "second" | "seconds" => Some(1_000_000_000),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct ValueScale {
    mul: u64,
    div: u64,
}

impl ValueScale {
    const IDENTITY: ValueScale = ValueScale { mul: 1, div: 1 };

    fn apply(self, value: u64) -> u64 {
        (u128::from(value) * u128::from(self.mul) / u128::from(self.div)) as u64
    }
}

struct IndexRemapping<I> {
    mapping: Vec<Option<I>>,
}

impl<I: EntityIndex> IndexRemapping<I> {
    fn new(count: usize) -> Self {
        IndexRemapping {
            mapping: vec![None; count],
        }
    }

    fn get(&self, from: I) -> Option<I> {
        self.mapping.get(from.as_usize()).copied().flatten()
    }

    fn set(&mut self, from: I, to: I) -> Result<(), MergeError> {
        let slot = &mut self.mapping[from.as_usize()];
        if slot.is_some() {
            return Err(MergeError::DuplicateIndex(from.as_usize() as u32));
        }
        *slot = Some(to);
        Ok(())
    }
}

/// Merges N wire profiles into one.
pub struct ProfileMerger {
    builder: ProfileBuilder,
    options: MergeOptions,
    profile_count: u32,
}

impl ProfileMerger {
    pub fn new(options: MergeOptions) -> Self {
        ProfileMerger {
            builder: ProfileBuilder::new(),
            options,
            profile_count: 0,
        }
    }

    /// Merges one profile into the destination.
    pub fn add(&mut self, profile: &proto::Profile) -> Result<(), MergeError> {
        let view = ProfileView::new(profile)?;
        SingleProfileMerger::new(&mut self.builder, &self.options, view, self.profile_count)
            .merge()?;
        self.profile_count += 1;
        Ok(())
    }

    /// Finishes bookkeeping and returns the merged profile.
    pub fn finish(self) -> proto::Profile {
        self.builder.finish()
    }
}

/// Convenience wrapper for a small number of in-memory profiles. Prefer
/// driving [`ProfileMerger`] directly when profiles are large: it does not
/// require keeping all of them in memory at once.
pub fn merge_profiles(
    profiles: &[proto::Profile],
    options: MergeOptions,
) -> Result<proto::Profile, MergeError> {
    let mut merger = ProfileMerger::new(options);
    for profile in profiles {
        merger.add(profile)?;
    }
    Ok(merger.finish())
}

struct SingleProfileMerger<'a, 'b> {
    builder: &'b mut ProfileBuilder,
    options: &'b MergeOptions,
    profile: ProfileView<'a>,
    is_first_profile: bool,

    strings: IndexRemapping<StringId>,
    threads: IndexRemapping<ThreadId>,
    binaries: IndexRemapping<BinaryId>,
    functions: IndexRemapping<FunctionId>,
    inline_chains: IndexRemapping<InlineChainId>,
    stack_frames: IndexRemapping<StackFrameId>,
    stacks: IndexRemapping<StackId>,
    sample_keys: IndexRemapping<SampleKeyId>,
    labels: FastHashMap<LabelId, LabelId>,
    value_types: FastHashMap<ValueTypeId, (ValueTypeId, ValueScale)>,
}

impl<'a, 'b> SingleProfileMerger<'a, 'b> {
    fn new(
        builder: &'b mut ProfileBuilder,
        options: &'b MergeOptions,
        profile: ProfileView<'a>,
        profile_index: u32,
    ) -> Self {
        let proto = profile.proto();
        SingleProfileMerger {
            builder,
            options,
            profile,
            is_first_profile: profile_index == 0,
            strings: IndexRemapping::new(proto.strtab.length.len()),
            threads: IndexRemapping::new(proto.threads.thread_id.len()),
            binaries: IndexRemapping::new(proto.binaries.build_id.len()),
            functions: IndexRemapping::new(proto.functions.name.len()),
            inline_chains: IndexRemapping::new(proto.inline_chains.offset.len()),
            stack_frames: IndexRemapping::new(proto.stack_frames.binary_id.len()),
            stacks: IndexRemapping::new(proto.stacks.offset.len()),
            sample_keys: IndexRemapping::new(proto.sample_keys.thread_id.len()),
            labels: FastHashMap::default(),
            value_types: FastHashMap::default(),
        }
    }

    fn merge(mut self) -> Result<(), MergeError> {
        self.merge_features()?;
        self.merge_metadata()?;
        for sample in self.profile.samples() {
            self.merge_sample(sample)?;
        }
        Ok(())
    }

    fn merge_features(&mut self) -> Result<(), MergeError> {
        let current = self.profile.features();
        if self.is_first_profile {
            self.builder
                .set_has_skewed_binary_offsets(current.has_skewed_binary_offsets);
        } else if self.builder.features().has_skewed_binary_offsets
            != current.has_skewed_binary_offsets
        {
            return Err(MergeError::FeatureMismatch);
        }
        Ok(())
    }

    fn merge_metadata(&mut self) -> Result<(), MergeError> {
        let current = StringId::from_u32(self.profile.metadata().default_sample_type);
        let mapped = self.map_string(current)?;

        if self.is_first_profile {
            self.builder.set_default_sample_type(mapped);
        } else if self.builder.metadata().default_sample_type != mapped.as_u32() {
            let expected = StringId::from_u32(self.builder.metadata().default_sample_type);
            return Err(MergeError::DefaultSampleTypeMismatch {
                expected: self.builder.string(expected).to_string(),
                got: self.profile.string(current).to_string(),
            });
        }
        Ok(())
    }

    fn merge_sample(&mut self, sample: SampleRef<'a>) -> Result<(), MergeError> {
        let timestamp = if self.options.keep_timestamps {
            sample.timestamp()
        } else {
            None
        };

        let key = self.map_sample_key(sample.key())?;

        let mut values = Vec::with_capacity(sample.value_count());
        for i in 0..sample.value_count() {
            let (value_type, scale) = self.map_value_type(sample.value_type(i))?;
            values.push((value_type, scale.apply(sample.value(i))));
        }

        self.builder.add_sample(&SampleInfo {
            key,
            timestamp,
            values,
        })?;
        Ok(())
    }

    fn map_value_type(
        &mut self,
        value_type: ValueTypeRef<'a>,
    ) -> Result<(ValueTypeId, ValueScale), MergeError> {
        if let Some(mapped) = self.value_types.get(&value_type.index()) {
            return Ok(*mapped);
        }

        let type_str = value_type.type_str();
        let unit_str = value_type.unit();

        let existing = self
            .builder
            .value_type_infos()
            .find(|(_, info)| self.builder.string(info.r#type) == type_str)
            .map(|(id, info)| (id, info.unit));

        let mapped = match existing {
            None => {
                let type_id = self.map_string(value_type.type_id())?;
                let unit_id = self.map_string(value_type.unit_id())?;
                let id = self.builder.add_value_type(type_id, unit_id)?;
                (id, ValueScale::IDENTITY)
            }
            Some((id, dest_unit_id)) => {
                let dest_unit = self.builder.string(dest_unit_id).to_string();
                if dest_unit == unit_str {
                    (id, ValueScale::IDENTITY)
                } else if !self.options.normalize_value_types {
                    return Err(MergeError::IncompatibleValueTypes {
                        value_type: type_str.to_string(),
                        left: dest_unit,
                        right: unit_str.to_string(),
                    });
                } else {
                    let from = time_unit_scale(unit_str)
                        .ok_or_else(|| MergeError::UnknownUnit(unit_str.to_string()))?;
                    let to = time_unit_scale(&dest_unit)
                        .ok_or_else(|| MergeError::UnknownUnit(dest_unit.clone()))?;
                    (id, ValueScale { mul: from, div: to })
                }
            }
        };

        self.value_types.insert(value_type.index(), mapped);
        Ok(mapped)
    }

    fn map_sample_key(&mut self, key: SampleKeyRef<'a>) -> Result<SampleKeyId, MergeError> {
        if let Some(mapped) = self.sample_keys.get(key.index()) {
            return Ok(mapped);
        }

        let thread = if self.options.keep_processes {
            self.map_thread(key.thread())?
        } else {
            ThreadId::ZERO
        };
        let kernel_stack = self.map_stack(key.kernel_stack())?;
        let user_stack = self.map_stack(key.user_stack())?;

        let mut labels = Vec::with_capacity(key.label_count());
        for label in key.labels() {
            let keep = match &self.options.label_filter {
                Some(filter) => filter(label),
                None => true,
            };
            if keep {
                labels.push(self.map_label(label)?);
            }
        }

        let mapped = self.builder.add_sample_key(&SampleKeyInfo {
            thread,
            user_stack,
            kernel_stack,
            labels,
        });
        self.sample_keys.set(key.index(), mapped)?;
        Ok(mapped)
    }

    fn map_thread(&mut self, thread: ThreadRef<'a>) -> Result<ThreadId, MergeError> {
        if let Some(mapped) = self.threads.get(thread.index()) {
            return Ok(mapped);
        }

        let thread_name = if self.options.cleanup_thread_names {
            self.sanitize_thread_name(thread)?
        } else {
            self.map_string(thread.thread_name_id())?
        };
        let process_name = self.map_string(thread.process_name_id())?;
        let mut containers = Vec::new();
        for container in thread.container_ids() {
            containers.push(self.map_string(container)?);
        }

        let mapped = self.builder.add_thread(&ThreadInfo {
            process_id: thread.process_id(),
            thread_id: thread.thread_id(),
            process_name,
            thread_name,
            containers,
        });
        self.threads.set(thread.index(), mapped)?;
        Ok(mapped)
    }

    fn sanitize_thread_name(&mut self, thread: ThreadRef<'a>) -> Result<StringId, MergeError> {
        let name = thread.thread_name();

        let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());

        // No trailing digits: save the extra intern.
        if trimmed.len() == name.len() {
            return self.map_string(thread.thread_name_id());
        }

        Ok(self.builder.add_string(trimmed)?)
    }

    fn map_label(&mut self, label: LabelRef<'a>) -> Result<LabelId, MergeError> {
        if let Some(mapped) = self.labels.get(&label.index()) {
            return Ok(*mapped);
        }

        let key = self.map_string(label.key_id())?;
        let mapped = match label.string_value_id() {
            Some(value) => {
                let value = self.map_string(value)?;
                self.builder.add_string_label(&StringLabelInfo { key, value })
            }
            None => {
                let value = label.number_value().unwrap_or(0);
                self.builder.add_numeric_label(&NumberLabelInfo { key, value })
            }
        };
        self.labels.insert(label.index(), mapped);
        Ok(mapped)
    }

    fn map_stack(&mut self, stack: StackRef<'a>) -> Result<StackId, MergeError> {
        if let Some(mapped) = self.stacks.get(stack.index()) {
            return Ok(mapped);
        }

        let mut frames = Vec::with_capacity(stack.frame_count());
        for frame in stack.frames() {
            frames.push(self.map_stack_frame(frame)?);
        }

        let mapped = self.builder.add_stack(&StackInfo { frames });
        self.stacks.set(stack.index(), mapped)?;
        Ok(mapped)
    }

    fn map_stack_frame(&mut self, frame: StackFrameRef<'a>) -> Result<StackFrameId, MergeError> {
        if let Some(mapped) = self.stack_frames.get(frame.index()) {
            return Ok(mapped);
        }

        let (binary, binary_offset) = if self.options.keep_binaries {
            (self.map_binary(frame.binary())?, frame.binary_offset())
        } else {
            (BinaryId::ZERO, 0)
        };
        let inline_chain = self.map_inline_chain(frame.inline_chain())?;

        let mapped = self.builder.add_stack_frame(&StackFrameInfo {
            binary,
            binary_offset,
            inline_chain,
        });
        self.stack_frames.set(frame.index(), mapped)?;
        Ok(mapped)
    }

    fn map_binary(&mut self, binary: BinaryRef<'a>) -> Result<BinaryId, MergeError> {
        if let Some(mapped) = self.binaries.get(binary.index()) {
            return Ok(mapped);
        }

        let build_id = self.map_string(binary.build_id_id())?;
        let path = if self.options.keep_binary_paths {
            self.map_string(binary.path_id())?
        } else {
            StringId::ZERO
        };

        let mapped = self.builder.add_binary(&BinaryInfo { build_id, path });
        self.binaries.set(binary.index(), mapped)?;
        Ok(mapped)
    }

    fn map_inline_chain(&mut self, chain: InlineChainRef<'a>) -> Result<InlineChainId, MergeError> {
        if let Some(mapped) = self.inline_chains.get(chain.index()) {
            return Ok(mapped);
        }

        let mut lines = Vec::with_capacity(chain.line_count());
        for line in chain.lines() {
            let function = self.map_function(line.function())?;
            let (line_no, column) = if self.options.keep_line_numbers {
                (line.line(), line.column())
            } else {
                (0, 0)
            };
            lines.push(SourceLineInfo {
                function,
                line: line_no,
                column,
            });
        }

        let mapped = self.builder.add_inline_chain(&InlineChainInfo { lines });
        self.inline_chains.set(chain.index(), mapped)?;
        Ok(mapped)
    }

    fn map_function(&mut self, function: FunctionRef<'a>) -> Result<FunctionId, MergeError> {
        if let Some(mapped) = self.functions.get(function.index()) {
            return Ok(mapped);
        }

        let name = self.map_string(function.name_id())?;
        let system_name = self.map_string(function.system_name_id())?;
        let filename = self.map_string(function.filename_id())?;

        let mapped = self.builder.add_function(&FunctionInfo {
            name,
            system_name,
            filename,
            start_line: function.start_line(),
        });
        self.functions.set(function.index(), mapped)?;
        Ok(mapped)
    }

    fn map_string(&mut self, id: StringId) -> Result<StringId, MergeError> {
        if let Some(mapped) = self.strings.get(id) {
            return Ok(mapped);
        }
        let profile = self.profile;
        let mapped = self.builder.add_string(profile.string(id))?;
        self.strings.set(id, mapped)?;
        Ok(mapped)
    }
}
