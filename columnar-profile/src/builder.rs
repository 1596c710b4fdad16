//! Write-only low-level profile builder.
//!
//! Entities are created in insertion order and never mutated or deleted.
//! Every `add_*` call hash-conses: adding a structurally equal value twice
//! returns the same index. Value columns can only grow before the first
//! sample is emitted.

use thiserror::Error;

use crate::fast_hash_map::FastHashMap;
use crate::index::{
    BinaryId, CommentId, FunctionId, InlineChainId, LabelId, SampleId, SampleKeyId, StackFrameId,
    StackId, StringId, ThreadId, ValueTypeId,
};
use crate::profile::SampleTimestamp;
use crate::proto;
use crate::string_table::{get_string, StringTableBuilder};

#[derive(Debug, Error)]
pub enum ProfileBuildError {
    #[error("cannot declare a new value type after samples have been added")]
    ValueTypeAfterSamples,

    #[error("cannot mix timestamped and untimestamped samples in one profile")]
    MixedTimestampedSamples,

    #[error("string table overflow: {0} bytes do not fit")]
    StringTableOverflow(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValueTypeInfo {
    pub r#type: StringId,
    pub unit: StringId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StringLabelInfo {
    pub key: StringId,
    pub value: StringId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NumberLabelInfo {
    pub key: StringId,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ThreadInfo {
    pub process_id: u64,
    pub thread_id: u64,
    pub process_name: StringId,
    pub thread_name: StringId,
    pub containers: Vec<StringId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BinaryInfo {
    pub build_id: StringId,
    pub path: StringId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FunctionInfo {
    pub name: StringId,
    pub system_name: StringId,
    pub filename: StringId,
    pub start_line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceLineInfo {
    pub function: FunctionId,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InlineChainInfo {
    pub lines: Vec<SourceLineInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StackFrameInfo {
    pub binary: BinaryId,
    pub binary_offset: i64,
    pub inline_chain: InlineChainId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StackInfo {
    /// Frames ordered leaf first.
    pub frames: Vec<StackFrameId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SampleKeyInfo {
    pub thread: ThreadId,
    pub user_stack: StackId,
    pub kernel_stack: StackId,
    pub labels: Vec<LabelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SampleInfo {
    pub key: SampleKeyId,
    pub timestamp: Option<SampleTimestamp>,
    pub values: Vec<(ValueTypeId, u64)>,
}

#[derive(Debug)]
pub struct ProfileBuilder {
    profile: proto::Profile,
    strings: StringTableBuilder,
    value_types: FastHashMap<ValueTypeInfo, ValueTypeId>,
    string_labels: FastHashMap<StringLabelInfo, u32>,
    number_labels: FastHashMap<NumberLabelInfo, u32>,
    threads: FastHashMap<ThreadInfo, ThreadId>,
    binaries: FastHashMap<BinaryInfo, BinaryId>,
    functions: FastHashMap<FunctionInfo, FunctionId>,
    inline_chains: FastHashMap<InlineChainInfo, InlineChainId>,
    stack_frames: FastHashMap<StackFrameInfo, StackFrameId>,
    stacks: FastHashMap<StackInfo, StackId>,
    sample_keys: FastHashMap<SampleKeyInfo, SampleKeyId>,
    /// For every sample key, the sample that untimestamped samples with
    /// that key merge into.
    sample_by_key: Vec<Option<SampleId>>,
    /// 128-bit running sums, one per value type.
    value_sums: Vec<u128>,
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        ProfileBuilder::new()
    }
}

impl ProfileBuilder {
    pub fn new() -> Self {
        let mut profile = proto::Profile::default();
        let strings = StringTableBuilder::new(&mut profile.strtab);

        let mut builder = ProfileBuilder {
            profile,
            strings,
            value_types: FastHashMap::default(),
            string_labels: FastHashMap::default(),
            number_labels: FastHashMap::default(),
            threads: FastHashMap::default(),
            binaries: FastHashMap::default(),
            functions: FastHashMap::default(),
            inline_chains: FastHashMap::default(),
            stack_frames: FastHashMap::default(),
            stacks: FastHashMap::default(),
            sample_keys: FastHashMap::default(),
            sample_by_key: Vec::new(),
            value_sums: Vec::new(),
        };

        // Seed index 0 of every entity table with the empty sentinel.
        builder.add_thread(&ThreadInfo::default());
        builder.add_binary(&BinaryInfo::default());
        builder.add_function(&FunctionInfo::default());
        builder.add_inline_chain(&InlineChainInfo::default());
        builder.add_stack(&StackInfo::default());
        builder.add_stack_frame(&StackFrameInfo::default());
        builder
    }

    pub fn set_hostname(&mut self, hostname: &str) -> Result<(), ProfileBuildError> {
        let id = self.add_string(hostname)?;
        self.profile.metadata.hostname = id.as_u32();
        Ok(())
    }

    pub fn set_default_sample_type(&mut self, sample_type: StringId) {
        self.profile.metadata.default_sample_type = sample_type.as_u32();
    }

    pub fn set_has_skewed_binary_offsets(&mut self, has: bool) {
        self.profile.features.has_skewed_binary_offsets = has;
    }

    pub fn features(&self) -> &proto::Features {
        &self.profile.features
    }

    pub fn metadata(&self) -> &proto::Metadata {
        &self.profile.metadata
    }

    pub fn string(&self, id: StringId) -> &str {
        get_string(&self.profile.strtab, id)
    }

    pub fn sample_count(&self) -> usize {
        self.profile.samples.key.len()
    }

    pub fn value_type_unit(&self, id: ValueTypeId) -> StringId {
        StringId::from_u32(self.profile.samples.values[id.as_u32() as usize].r#type.unit)
    }

    pub fn value_type_infos(&self) -> impl Iterator<Item = (ValueTypeId, ValueTypeInfo)> + '_ {
        self.profile
            .samples
            .values
            .iter()
            .enumerate()
            .map(|(i, column)| {
                (
                    ValueTypeId::from_u32(i as u32),
                    ValueTypeInfo {
                        r#type: StringId::from_u32(column.r#type.r#type),
                        unit: StringId::from_u32(column.r#type.unit),
                    },
                )
            })
    }

    pub fn add_string(&mut self, s: &str) -> Result<StringId, ProfileBuildError> {
        let total = self.profile.strtab.strings.len() + s.len();
        if total > u32::MAX as usize {
            return Err(ProfileBuildError::StringTableOverflow(total));
        }
        Ok(self.strings.intern(&mut self.profile.strtab, s))
    }

    pub fn add_comment(&mut self, string: StringId) -> CommentId {
        let id = CommentId::from_u32(self.profile.comments.comment.len() as u32);
        self.profile.comments.comment.push(string.as_u32());
        id
    }

    pub fn add_value_type(
        &mut self,
        r#type: StringId,
        unit: StringId,
    ) -> Result<ValueTypeId, ProfileBuildError> {
        let info = ValueTypeInfo { r#type, unit };
        if let Some(id) = self.value_types.get(&info) {
            return Ok(*id);
        }

        // Value columns must stay congruent with the sample rows, so the
        // column set is frozen once the first sample lands.
        if !self.profile.samples.key.is_empty() {
            return Err(ProfileBuildError::ValueTypeAfterSamples);
        }

        let id = ValueTypeId::from_u32(self.profile.samples.values.len() as u32);
        self.profile.samples.values.push(proto::SampleValues {
            r#type: proto::ValueType {
                r#type: info.r#type.as_u32(),
                unit: info.unit.as_u32(),
            },
            value: Vec::new(),
            value_sum: proto::UInt128::default(),
        });
        self.value_sums.push(0);
        self.value_types.insert(info, id);
        Ok(id)
    }

    pub fn add_string_label(&mut self, info: &StringLabelInfo) -> LabelId {
        if let Some(position) = self.string_labels.get(info) {
            return LabelId::string(*position);
        }
        let position = self.profile.labels.strings.key.len() as u32;
        self.profile.labels.strings.key.push(info.key.as_u32());
        self.profile.labels.strings.value.push(info.value.as_u32());
        self.string_labels.insert(*info, position);
        LabelId::string(position)
    }

    pub fn add_numeric_label(&mut self, info: &NumberLabelInfo) -> LabelId {
        if let Some(position) = self.number_labels.get(info) {
            return LabelId::number(*position);
        }
        let position = self.profile.labels.numbers.key.len() as u32;
        self.profile.labels.numbers.key.push(info.key.as_u32());
        self.profile.labels.numbers.value.push(info.value);
        self.number_labels.insert(*info, position);
        LabelId::number(position)
    }

    pub fn add_thread(&mut self, info: &ThreadInfo) -> ThreadId {
        if let Some(id) = self.threads.get(info) {
            return *id;
        }
        let threads = &mut self.profile.threads;
        let id = ThreadId::from_u32(threads.thread_id.len() as u32);
        threads.thread_id.push(info.thread_id);
        threads.process_id.push(info.process_id);
        threads.thread_name.push(info.thread_name.as_u32());
        threads.process_name.push(info.process_name.as_u32());
        threads
            .container_offset
            .push(threads.container_names.len() as u32);
        for container in &info.containers {
            threads.container_names.push(container.as_u32());
        }
        self.threads.insert(info.clone(), id);
        id
    }

    pub fn add_binary(&mut self, info: &BinaryInfo) -> BinaryId {
        if let Some(id) = self.binaries.get(info) {
            return *id;
        }
        let binaries = &mut self.profile.binaries;
        let id = BinaryId::from_u32(binaries.build_id.len() as u32);
        binaries.build_id.push(info.build_id.as_u32());
        binaries.path.push(info.path.as_u32());
        self.binaries.insert(*info, id);
        id
    }

    pub fn add_function(&mut self, info: &FunctionInfo) -> FunctionId {
        if let Some(id) = self.functions.get(info) {
            return *id;
        }
        let functions = &mut self.profile.functions;
        let id = FunctionId::from_u32(functions.name.len() as u32);
        functions.name.push(info.name.as_u32());
        functions.system_name.push(info.system_name.as_u32());
        functions.filename.push(info.filename.as_u32());
        functions.start_line.push(info.start_line);
        self.functions.insert(*info, id);
        id
    }

    pub fn add_inline_chain(&mut self, info: &InlineChainInfo) -> InlineChainId {
        if let Some(id) = self.inline_chains.get(info) {
            return *id;
        }
        let chains = &mut self.profile.inline_chains;
        let id = InlineChainId::from_u32(chains.offset.len() as u32);
        chains.offset.push(chains.function_id.len() as u32);
        for line in &info.lines {
            chains.function_id.push(line.function.as_u32());
            chains.line.push(line.line);
            chains.column.push(line.column);
        }
        self.inline_chains.insert(info.clone(), id);
        id
    }

    pub fn add_stack_frame(&mut self, info: &StackFrameInfo) -> StackFrameId {
        if let Some(id) = self.stack_frames.get(info) {
            return *id;
        }
        let frames = &mut self.profile.stack_frames;
        let id = StackFrameId::from_u32(frames.binary_id.len() as u32);
        frames.binary_id.push(info.binary.as_u32());
        frames.binary_offset.push(info.binary_offset);
        frames.inline_chain_id.push(info.inline_chain.as_u32());
        self.stack_frames.insert(*info, id);
        id
    }

    pub fn add_stack(&mut self, info: &StackInfo) -> StackId {
        if let Some(id) = self.stacks.get(info) {
            return *id;
        }
        let stacks = &mut self.profile.stacks;
        let id = StackId::from_u32(stacks.offset.len() as u32);
        stacks.offset.push(stacks.frame_id.len() as u32);
        for frame in &info.frames {
            stacks.frame_id.push(frame.as_u32());
        }
        self.stacks.insert(info.clone(), id);
        id
    }

    pub fn add_sample_key(&mut self, info: &SampleKeyInfo) -> SampleKeyId {
        if let Some(id) = self.sample_keys.get(info) {
            return *id;
        }
        let keys = &mut self.profile.sample_keys;
        let id = SampleKeyId::from_u32(keys.thread_id.len() as u32);
        keys.thread_id.push(info.thread.as_u32());
        keys.user_stack_id.push(info.user_stack.as_u32());
        keys.kernel_stack_id.push(info.kernel_stack.as_u32());
        keys.first_label_id.push(keys.packed_label_id.len() as u32);
        for label in &info.labels {
            keys.packed_label_id.push(label.packed());
        }
        self.sample_keys.insert(info.clone(), id);
        self.sample_by_key.push(None);
        id
    }

    pub fn add_sample(&mut self, info: &SampleInfo) -> Result<SampleId, ProfileBuildError> {
        let id = self.prepare_sample(info)?;
        for (value_type, delta) in &info.values {
            let column = &mut self.profile.samples.values[value_type.as_u32() as usize];
            column.value[id.as_u32() as usize] += delta;
            self.value_sums[value_type.as_u32() as usize] += u128::from(*delta);
        }
        Ok(id)
    }

    /// Writes the accumulated per-column sums and returns the finished
    /// wire profile.
    pub fn finish(mut self) -> proto::Profile {
        for (column, sum) in self
            .profile
            .samples
            .values
            .iter_mut()
            .zip(self.value_sums.iter())
        {
            column.value_sum = proto::UInt128 {
                lo: *sum as u64,
                hi: (*sum >> 64) as u64,
            };
        }
        self.profile
    }

    fn prepare_sample(&mut self, info: &SampleInfo) -> Result<SampleId, ProfileBuildError> {
        let next_id = SampleId::from_u32(self.profile.samples.key.len() as u32);

        let id = match info.timestamp {
            // Timestamped samples are never merged.
            Some(_) => next_id,
            None => {
                if self.profile.samples.timestamps.is_some() {
                    return Err(ProfileBuildError::MixedTimestampedSamples);
                }
                let slot = &mut self.sample_by_key[info.key.as_u32() as usize];
                match slot {
                    Some(existing) => *existing,
                    None => {
                        *slot = Some(next_id);
                        next_id
                    }
                }
            }
        };

        if id == next_id {
            self.profile.samples.key.push(info.key.as_u32());
            if let Some(ts) = info.timestamp {
                self.fill_sample_timestamp(id, ts)?;
            }
            for column in &mut self.profile.samples.values {
                debug_assert_eq!(column.value.len(), id.as_u32() as usize);
                column.value.push(0);
            }
        }

        Ok(id)
    }

    fn fill_sample_timestamp(
        &mut self,
        id: SampleId,
        ts: SampleTimestamp,
    ) -> Result<(), ProfileBuildError> {
        if self.profile.samples.timestamps.is_none() {
            // The first timestamp becomes the epoch base; from then on
            // every sample must carry one.
            if id.as_u32() != 0 {
                return Err(ProfileBuildError::MixedTimestampedSamples);
            }
            self.profile.samples.timestamps = Some(proto::Timestamps {
                start_timestamp: proto::Timestamp {
                    seconds: ts.seconds,
                    nanos: ts.nanos,
                },
                delta_nanoseconds: Vec::new(),
            });
        }

        let timestamps = self
            .profile
            .samples
            .timestamps
            .as_mut()
            .ok_or(ProfileBuildError::MixedTimestampedSamples)?;
        let start = SampleTimestamp {
            seconds: timestamps.start_timestamp.seconds,
            nanos: timestamps.start_timestamp.nanos,
        };
        timestamps
            .delta_nanoseconds
            .push(ts.as_nanos() - start.as_nanos());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_hash_consed() {
        let mut builder = ProfileBuilder::new();
        let x = builder.add_string("x").unwrap();
        let y = builder.add_string("y").unwrap();
        let x2 = builder.add_string("x").unwrap();
        assert_eq!(x, StringId::from_u32(1));
        assert_eq!(y, StringId::from_u32(2));
        assert_eq!(x2, x);
    }

    #[test]
    fn sentinel_rows_are_seeded() {
        let profile = ProfileBuilder::new().finish();
        assert_eq!(profile.strtab.length[0], 0);
        assert_eq!(profile.threads.thread_id[0], 0);
        assert_eq!(profile.binaries.build_id[0], 0);
        assert_eq!(profile.functions.name[0], 0);
        assert_eq!(profile.inline_chains.offset[0], 0);
        assert_eq!(profile.stacks.offset[0], 0);
        assert_eq!(profile.stack_frames.binary_id[0], 0);
    }

    #[test]
    fn equal_entities_share_an_index() {
        let mut builder = ProfileBuilder::new();
        let name = builder.add_string("main").unwrap();
        let file = builder.add_string("main.rs").unwrap();
        let info = FunctionInfo {
            name,
            system_name: name,
            filename: file,
            start_line: 10,
        };
        let a = builder.add_function(&info);
        let b = builder.add_function(&info);
        assert_eq!(a, b);

        let other = FunctionInfo {
            start_line: 11,
            ..info
        };
        assert_ne!(builder.add_function(&other), a);
    }

    #[test]
    fn untimestamped_samples_with_equal_keys_merge() {
        let mut builder = ProfileBuilder::new();
        let cycles = builder.add_string("cpu.ns").unwrap();
        let unit = builder.add_string("nanoseconds").unwrap();
        let value_type = builder.add_value_type(cycles, unit).unwrap();
        let key = builder.add_sample_key(&SampleKeyInfo::default());

        let a = builder
            .add_sample(&SampleInfo {
                key,
                timestamp: None,
                values: vec![(value_type, 100)],
            })
            .unwrap();
        let b = builder
            .add_sample(&SampleInfo {
                key,
                timestamp: None,
                values: vec![(value_type, 50)],
            })
            .unwrap();
        assert_eq!(a, b);

        let profile = builder.finish();
        assert_eq!(profile.samples.key.len(), 1);
        assert_eq!(profile.samples.values[0].value, vec![150]);
        assert_eq!(profile.samples.values[0].value_sum.lo, 150);
        assert_eq!(profile.samples.values[0].value_sum.hi, 0);
    }

    #[test]
    fn timestamped_samples_stay_separate() {
        let mut builder = ProfileBuilder::new();
        let cycles = builder.add_string("cycles").unwrap();
        let count = builder.add_string("count").unwrap();
        let value_type = builder.add_value_type(cycles, count).unwrap();
        let key = builder.add_sample_key(&SampleKeyInfo::default());

        let base = SampleTimestamp {
            seconds: 100,
            nanos: 500,
        };
        let later = SampleTimestamp {
            seconds: 101,
            nanos: 0,
        };
        let a = builder
            .add_sample(&SampleInfo {
                key,
                timestamp: Some(base),
                values: vec![(value_type, 1)],
            })
            .unwrap();
        let b = builder
            .add_sample(&SampleInfo {
                key,
                timestamp: Some(later),
                values: vec![(value_type, 1)],
            })
            .unwrap();
        assert_ne!(a, b);

        let profile = builder.finish();
        let timestamps = profile.samples.timestamps.unwrap();
        assert_eq!(timestamps.start_timestamp.seconds, 100);
        assert_eq!(timestamps.start_timestamp.nanos, 500);
        assert_eq!(timestamps.delta_nanoseconds, vec![0, 999_999_500]);
    }

    #[test]
    fn mixing_timestamped_and_untimestamped_fails() {
        let mut builder = ProfileBuilder::new();
        let cycles = builder.add_string("cycles").unwrap();
        let count = builder.add_string("count").unwrap();
        let value_type = builder.add_value_type(cycles, count).unwrap();
        let key = builder.add_sample_key(&SampleKeyInfo::default());

        builder
            .add_sample(&SampleInfo {
                key,
                timestamp: Some(SampleTimestamp {
                    seconds: 1,
                    nanos: 0,
                }),
                values: vec![(value_type, 1)],
            })
            .unwrap();
        let err = builder.add_sample(&SampleInfo {
            key,
            timestamp: None,
            values: vec![(value_type, 1)],
        });
        assert!(matches!(
            err,
            Err(ProfileBuildError::MixedTimestampedSamples)
        ));
    }

    #[test]
    fn value_types_are_frozen_after_first_sample() {
        let mut builder = ProfileBuilder::new();
        let cycles = builder.add_string("cycles").unwrap();
        let count = builder.add_string("count").unwrap();
        let value_type = builder.add_value_type(cycles, count).unwrap();
        let key = builder.add_sample_key(&SampleKeyInfo::default());
        builder
            .add_sample(&SampleInfo {
                key,
                timestamp: None,
                values: vec![(value_type, 1)],
            })
            .unwrap();

        // Re-adding the existing value type is still fine.
        assert_eq!(builder.add_value_type(cycles, count).unwrap(), value_type);

        let wall = builder.add_string("wall").unwrap();
        let err = builder.add_value_type(wall, count);
        assert!(matches!(err, Err(ProfileBuildError::ValueTypeAfterSamples)));
    }
}
