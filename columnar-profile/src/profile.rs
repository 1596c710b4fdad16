//! Read-only typed accessors over a wire profile.
//!
//! The view is non-owning and must not outlive the profile. Accessors
//! index directly into the columns; constructing the view runs the cheap
//! structural checks, so out-of-range entity indices in untrusted input
//! should be rejected up front with
//! [`validate_profile`](crate::validate::validate_profile) with index
//! checking enabled.

use serde_json::json;

use crate::index::{
    BinaryId, CommentId, FunctionId, InlineChainId, LabelId, SampleId, SampleKeyId, StackFrameId,
    StackId, StringId, ThreadId, ValueTypeId,
};
use crate::proto;
use crate::string_table::get_string;
use crate::validate::{validate_profile, ValidationError, ValidationOptions};

pub const NANOSECONDS_IN_SECOND: i64 = 1_000_000_000;

/// A wall-clock instant, seconds plus nanoseconds-of-second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleTimestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl SampleTimestamp {
    pub fn as_nanos(self) -> i64 {
        self.seconds * NANOSECONDS_IN_SECOND + self.nanos as i64
    }

    pub fn from_nanos(nanos: i64) -> Self {
        SampleTimestamp {
            seconds: nanos.div_euclid(NANOSECONDS_IN_SECOND),
            nanos: nanos.rem_euclid(NANOSECONDS_IN_SECOND) as u32,
        }
    }
}

fn offset_range(offsets: &[u32], values_len: usize, id: usize) -> (usize, usize) {
    if id >= offsets.len() {
        return (0, 0);
    }
    let begin = offsets[id] as usize;
    let end = match offsets.get(id + 1) {
        Some(next) => *next as usize,
        None => values_len,
    };
    (begin, end)
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileView<'a> {
    proto: &'a proto::Profile,
}

impl<'a> ProfileView<'a> {
    /// Wraps a wire profile, first checking column congruence and the
    /// sentinel rows.
    pub fn new(profile: &'a proto::Profile) -> Result<Self, ValidationError> {
        validate_profile(profile, ValidationOptions { check_indices: false })?;
        Ok(ProfileView { proto: profile })
    }

    pub fn proto(&self) -> &'a proto::Profile {
        self.proto
    }

    pub fn features(&self) -> &'a proto::Features {
        &self.proto.features
    }

    pub fn metadata(&self) -> &'a proto::Metadata {
        &self.proto.metadata
    }

    pub fn string(&self, id: StringId) -> &'a str {
        get_string(&self.proto.strtab, id)
    }

    pub fn string_count(&self) -> usize {
        self.proto.strtab.length.len()
    }

    pub fn strings(&self) -> impl Iterator<Item = (StringId, &'a str)> + 'a {
        let view = *self;
        (0..self.string_count()).map(move |i| {
            let id = StringId::from_u32(i as u32);
            (id, view.string(id))
        })
    }

    pub fn comment_count(&self) -> usize {
        self.proto.comments.comment.len()
    }

    pub fn comment(&self, id: CommentId) -> StringId {
        StringId::from_u32(self.proto.comments.comment[id.as_u32() as usize])
    }

    pub fn value_type_count(&self) -> usize {
        self.proto.samples.values.len()
    }

    pub fn value_type(&self, id: ValueTypeId) -> ValueTypeRef<'a> {
        ValueTypeRef { profile: *self, id }
    }

    pub fn thread(&self, id: ThreadId) -> ThreadRef<'a> {
        ThreadRef { profile: *self, id }
    }

    pub fn binary(&self, id: BinaryId) -> BinaryRef<'a> {
        BinaryRef { profile: *self, id }
    }

    pub fn binary_count(&self) -> usize {
        self.proto.binaries.build_id.len()
    }

    pub fn function(&self, id: FunctionId) -> FunctionRef<'a> {
        FunctionRef { profile: *self, id }
    }

    pub fn function_count(&self) -> usize {
        self.proto.functions.name.len()
    }

    pub fn inline_chain(&self, id: InlineChainId) -> InlineChainRef<'a> {
        InlineChainRef { profile: *self, id }
    }

    pub fn stack_frame(&self, id: StackFrameId) -> StackFrameRef<'a> {
        StackFrameRef { profile: *self, id }
    }

    pub fn stack_frame_count(&self) -> usize {
        self.proto.stack_frames.binary_id.len()
    }

    pub fn stack(&self, id: StackId) -> StackRef<'a> {
        StackRef { profile: *self, id }
    }

    pub fn label(&self, id: LabelId) -> LabelRef<'a> {
        LabelRef { profile: *self, id }
    }

    pub fn sample_key(&self, id: SampleKeyId) -> SampleKeyRef<'a> {
        SampleKeyRef { profile: *self, id }
    }

    pub fn sample_count(&self) -> usize {
        self.proto.samples.key.len()
    }

    pub fn sample(&self, id: SampleId) -> SampleRef<'a> {
        SampleRef { profile: *self, id }
    }

    pub fn samples(&self) -> impl Iterator<Item = SampleRef<'a>> + 'a {
        let view = *self;
        (0..self.sample_count()).map(move |i| view.sample(SampleId::from_u32(i as u32)))
    }

    /// Human-readable dump of all samples with their keys resolved.
    pub fn dump_json(&self) -> serde_json::Value {
        let samples: Vec<_> = self.samples().map(|s| s.dump_json()).collect();
        json!({
            "hostname": self.string(StringId::from_u32(self.metadata().hostname)),
            "default_sample_type":
                self.string(StringId::from_u32(self.metadata().default_sample_type)),
            "has_skewed_binary_offsets": self.features().has_skewed_binary_offsets,
            "samples": samples,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValueTypeRef<'a> {
    profile: ProfileView<'a>,
    id: ValueTypeId,
}

impl<'a> ValueTypeRef<'a> {
    pub fn index(&self) -> ValueTypeId {
        self.id
    }

    pub fn type_id(&self) -> StringId {
        StringId::from_u32(self.proto().r#type)
    }

    pub fn unit_id(&self) -> StringId {
        StringId::from_u32(self.proto().unit)
    }

    pub fn type_str(&self) -> &'a str {
        self.profile.string(self.type_id())
    }

    pub fn unit(&self) -> &'a str {
        self.profile.string(self.unit_id())
    }

    fn proto(&self) -> &'a proto::ValueType {
        &self.profile.proto.samples.values[self.id.as_u32() as usize].r#type
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadRef<'a> {
    profile: ProfileView<'a>,
    id: ThreadId,
}

impl<'a> ThreadRef<'a> {
    pub fn index(&self) -> ThreadId {
        self.id
    }

    pub fn thread_id(&self) -> u64 {
        self.profile.proto.threads.thread_id[self.id.as_u32() as usize]
    }

    pub fn process_id(&self) -> u64 {
        self.profile.proto.threads.process_id[self.id.as_u32() as usize]
    }

    pub fn thread_name_id(&self) -> StringId {
        StringId::from_u32(self.profile.proto.threads.thread_name[self.id.as_u32() as usize])
    }

    pub fn process_name_id(&self) -> StringId {
        StringId::from_u32(self.profile.proto.threads.process_name[self.id.as_u32() as usize])
    }

    pub fn thread_name(&self) -> &'a str {
        self.profile.string(self.thread_name_id())
    }

    pub fn process_name(&self) -> &'a str {
        self.profile.string(self.process_name_id())
    }

    pub fn container_ids(&self) -> impl Iterator<Item = StringId> + 'a {
        let threads = &self.profile.proto.threads;
        let (begin, end) = offset_range(
            &threads.container_offset,
            threads.container_names.len(),
            self.id.as_u32() as usize,
        );
        threads.container_names[begin..end]
            .iter()
            .map(|&idx| StringId::from_u32(idx))
    }

    pub fn containers(&self) -> impl Iterator<Item = &'a str> + 'a {
        let profile = self.profile;
        self.container_ids().map(move |id| profile.string(id))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryRef<'a> {
    profile: ProfileView<'a>,
    id: BinaryId,
}

impl<'a> BinaryRef<'a> {
    pub fn index(&self) -> BinaryId {
        self.id
    }

    pub fn build_id_id(&self) -> StringId {
        StringId::from_u32(self.profile.proto.binaries.build_id[self.id.as_u32() as usize])
    }

    pub fn path_id(&self) -> StringId {
        StringId::from_u32(self.profile.proto.binaries.path[self.id.as_u32() as usize])
    }

    pub fn build_id(&self) -> &'a str {
        self.profile.string(self.build_id_id())
    }

    pub fn path(&self) -> &'a str {
        self.profile.string(self.path_id())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionRef<'a> {
    profile: ProfileView<'a>,
    id: FunctionId,
}

impl<'a> FunctionRef<'a> {
    pub fn index(&self) -> FunctionId {
        self.id
    }

    pub fn name_id(&self) -> StringId {
        StringId::from_u32(self.profile.proto.functions.name[self.id.as_u32() as usize])
    }

    pub fn system_name_id(&self) -> StringId {
        StringId::from_u32(self.profile.proto.functions.system_name[self.id.as_u32() as usize])
    }

    pub fn filename_id(&self) -> StringId {
        StringId::from_u32(self.profile.proto.functions.filename[self.id.as_u32() as usize])
    }

    pub fn name(&self) -> &'a str {
        self.profile.string(self.name_id())
    }

    pub fn system_name(&self) -> &'a str {
        self.profile.string(self.system_name_id())
    }

    pub fn filename(&self) -> &'a str {
        self.profile.string(self.filename_id())
    }

    pub fn start_line(&self) -> u32 {
        self.profile.proto.functions.start_line[self.id.as_u32() as usize]
    }
}

/// One source line of an inline chain.
#[derive(Debug, Clone, Copy)]
pub struct SourceLineRef<'a> {
    profile: ProfileView<'a>,
    position: usize,
}

impl<'a> SourceLineRef<'a> {
    pub fn function(&self) -> FunctionRef<'a> {
        let id = self.profile.proto.inline_chains.function_id[self.position];
        self.profile.function(FunctionId::from_u32(id))
    }

    pub fn line(&self) -> u32 {
        self.profile.proto.inline_chains.line[self.position]
    }

    pub fn column(&self) -> u32 {
        self.profile.proto.inline_chains.column[self.position]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InlineChainRef<'a> {
    profile: ProfileView<'a>,
    id: InlineChainId,
}

impl<'a> InlineChainRef<'a> {
    pub fn index(&self) -> InlineChainId {
        self.id
    }

    pub fn line_count(&self) -> usize {
        let chains = &self.profile.proto.inline_chains;
        let (begin, end) = offset_range(
            &chains.offset,
            chains.function_id.len(),
            self.id.as_u32() as usize,
        );
        end - begin
    }

    pub fn line(&self, index: usize) -> SourceLineRef<'a> {
        let offset = self.profile.proto.inline_chains.offset[self.id.as_u32() as usize] as usize;
        SourceLineRef {
            profile: self.profile,
            position: offset + index,
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = SourceLineRef<'a>> + 'a {
        let this = *self;
        (0..self.line_count()).map(move |i| this.line(i))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StackFrameRef<'a> {
    profile: ProfileView<'a>,
    id: StackFrameId,
}

impl<'a> StackFrameRef<'a> {
    pub fn index(&self) -> StackFrameId {
        self.id
    }

    pub fn binary(&self) -> BinaryRef<'a> {
        let id = self.profile.proto.stack_frames.binary_id[self.id.as_u32() as usize];
        self.profile.binary(BinaryId::from_u32(id))
    }

    pub fn binary_offset(&self) -> i64 {
        self.profile.proto.stack_frames.binary_offset[self.id.as_u32() as usize]
    }

    pub fn inline_chain(&self) -> InlineChainRef<'a> {
        let id = self.profile.proto.stack_frames.inline_chain_id[self.id.as_u32() as usize];
        self.profile.inline_chain(InlineChainId::from_u32(id))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StackRef<'a> {
    profile: ProfileView<'a>,
    id: StackId,
}

impl<'a> StackRef<'a> {
    pub fn index(&self) -> StackId {
        self.id
    }

    pub fn frame_count(&self) -> usize {
        let stacks = &self.profile.proto.stacks;
        let (begin, end) = offset_range(
            &stacks.offset,
            stacks.frame_id.len(),
            self.id.as_u32() as usize,
        );
        end - begin
    }

    pub fn frame(&self, index: usize) -> StackFrameRef<'a> {
        let offset = self.profile.proto.stacks.offset[self.id.as_u32() as usize] as usize;
        let frame_id = self.profile.proto.stacks.frame_id[offset + index];
        self.profile.stack_frame(StackFrameId::from_u32(frame_id))
    }

    pub fn frames(&self) -> impl Iterator<Item = StackFrameRef<'a>> + 'a {
        let this = *self;
        (0..self.frame_count()).map(move |i| this.frame(i))
    }
}

/// A label value: either an interned string or a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelValue<'a> {
    String(&'a str),
    Number(i64),
}

#[derive(Debug, Clone, Copy)]
pub struct LabelRef<'a> {
    profile: ProfileView<'a>,
    id: LabelId,
}

impl<'a> LabelRef<'a> {
    pub fn index(&self) -> LabelId {
        self.id
    }

    pub fn is_number(&self) -> bool {
        self.id.is_number()
    }

    pub fn key_id(&self) -> StringId {
        let labels = &self.profile.proto.labels;
        let key = if self.id.is_number() {
            labels.numbers.key[self.id.position()]
        } else {
            labels.strings.key[self.id.position()]
        };
        StringId::from_u32(key)
    }

    pub fn key(&self) -> &'a str {
        self.profile.string(self.key_id())
    }

    pub fn string_value_id(&self) -> Option<StringId> {
        if self.id.is_number() {
            return None;
        }
        Some(StringId::from_u32(
            self.profile.proto.labels.strings.value[self.id.position()],
        ))
    }

    pub fn number_value(&self) -> Option<i64> {
        if !self.id.is_number() {
            return None;
        }
        Some(self.profile.proto.labels.numbers.value[self.id.position()])
    }

    pub fn value(&self) -> LabelValue<'a> {
        match self.string_value_id() {
            Some(id) => LabelValue::String(self.profile.string(id)),
            None => LabelValue::Number(self.profile.proto.labels.numbers.value[self.id.position()]),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SampleKeyRef<'a> {
    profile: ProfileView<'a>,
    id: SampleKeyId,
}

impl<'a> SampleKeyRef<'a> {
    pub fn index(&self) -> SampleKeyId {
        self.id
    }

    pub fn thread(&self) -> ThreadRef<'a> {
        let id = self.profile.proto.sample_keys.thread_id[self.id.as_u32() as usize];
        self.profile.thread(ThreadId::from_u32(id))
    }

    pub fn user_stack(&self) -> StackRef<'a> {
        let id = self.profile.proto.sample_keys.user_stack_id[self.id.as_u32() as usize];
        self.profile.stack(StackId::from_u32(id))
    }

    pub fn kernel_stack(&self) -> StackRef<'a> {
        let id = self.profile.proto.sample_keys.kernel_stack_id[self.id.as_u32() as usize];
        self.profile.stack(StackId::from_u32(id))
    }

    pub fn label_count(&self) -> usize {
        let keys = &self.profile.proto.sample_keys;
        let (begin, end) = offset_range(
            &keys.first_label_id,
            keys.packed_label_id.len(),
            self.id.as_u32() as usize,
        );
        end - begin
    }

    pub fn label(&self, index: usize) -> LabelRef<'a> {
        let offset = self.profile.proto.sample_keys.first_label_id[self.id.as_u32() as usize];
        let packed = self.profile.proto.sample_keys.packed_label_id[offset as usize + index];
        self.profile.label(LabelId::from_packed(packed))
    }

    pub fn labels(&self) -> impl Iterator<Item = LabelRef<'a>> + 'a {
        let this = *self;
        (0..self.label_count()).map(move |i| this.label(i))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SampleRef<'a> {
    profile: ProfileView<'a>,
    id: SampleId,
}

impl<'a> SampleRef<'a> {
    pub fn index(&self) -> SampleId {
        self.id
    }

    pub fn key(&self) -> SampleKeyRef<'a> {
        let id = self.profile.proto.samples.key[self.id.as_u32() as usize];
        self.profile.sample_key(SampleKeyId::from_u32(id))
    }

    pub fn value_count(&self) -> usize {
        self.profile.proto.samples.values.len()
    }

    pub fn value(&self, index: usize) -> u64 {
        self.profile.proto.samples.values[index].value[self.id.as_u32() as usize]
    }

    pub fn value_type(&self, index: usize) -> ValueTypeRef<'a> {
        self.profile.value_type(ValueTypeId::from_u32(index as u32))
    }

    pub fn timestamp(&self) -> Option<SampleTimestamp> {
        let timestamps = self.profile.proto.samples.timestamps.as_ref()?;
        let delta = timestamps.delta_nanoseconds[self.id.as_u32() as usize];
        let start = timestamps.start_timestamp;
        let base = SampleTimestamp {
            seconds: start.seconds,
            nanos: start.nanos,
        };
        Some(SampleTimestamp::from_nanos(base.as_nanos() + delta))
    }

    fn dump_json(&self) -> serde_json::Value {
        let key = self.key();
        let values: Vec<_> = (0..self.value_count())
            .map(|i| {
                json!({
                    "type": self.value_type(i).type_str(),
                    "unit": self.value_type(i).unit(),
                    "value": self.value(i),
                })
            })
            .collect();
        let stack_json = |stack: StackRef<'a>| -> Vec<serde_json::Value> {
            stack
                .frames()
                .map(|frame| {
                    let names: Vec<_> =
                        frame.inline_chain().lines().map(|l| l.function().name()).collect();
                    json!({
                        "binary": frame.binary().path(),
                        "binary_offset": frame.binary_offset(),
                        "functions": names,
                    })
                })
                .collect()
        };
        let labels: Vec<_> = key
            .labels()
            .map(|label| match label.value() {
                LabelValue::String(s) => json!({ "key": label.key(), "value": s }),
                LabelValue::Number(n) => json!({ "key": label.key(), "value": n }),
            })
            .collect();
        json!({
            "thread": {
                "pid": key.thread().process_id(),
                "tid": key.thread().thread_id(),
                "process_name": key.thread().process_name(),
                "thread_name": key.thread().thread_name(),
            },
            "kernel_stack": stack_json(key.kernel_stack()),
            "user_stack": stack_json(key.user_stack()),
            "labels": labels,
            "values": values,
            "timestamp": self.timestamp().map(|ts| json!({
                "seconds": ts.seconds,
                "nanos": ts.nanos,
            })),
        })
    }
}
