//! Wire representation of the columnar profile.
//!
//! Every entity table is a set of parallel scalar columns; an entity is a
//! row index into its table. Row 0 of each table is reserved for the empty
//! sentinel, and the string at index 0 is the empty string. Writers must
//! emit referenced rows no later than the rows referencing them.

/// A single blob of string data plus parallel (offset, length) columns.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringTable {
    #[prost(string, required, tag = "1")]
    pub strings: ::prost::alloc::string::String,
    #[prost(uint32, repeated, tag = "2")]
    pub offset: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub length: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Comments {
    /// String indices, one per comment.
    #[prost(uint32, repeated, tag = "1")]
    pub comment: ::prost::alloc::vec::Vec<u32>,
}

/// String-valued labels. `key` and `value` are string indices.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringLabels {
    #[prost(uint32, repeated, tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "2")]
    pub value: ::prost::alloc::vec::Vec<u32>,
}

/// Number-valued labels. `key` is a string index.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NumberLabels {
    #[prost(uint32, repeated, tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u32>,
    #[prost(int64, repeated, tag = "2")]
    pub value: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Labels {
    #[prost(message, required, tag = "1")]
    pub strings: StringLabels,
    #[prost(message, required, tag = "2")]
    pub numbers: NumberLabels,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Threads {
    #[prost(uint64, repeated, tag = "1")]
    pub thread_id: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "2")]
    pub process_id: ::prost::alloc::vec::Vec<u64>,
    /// String indices.
    #[prost(uint32, repeated, tag = "3")]
    pub thread_name: ::prost::alloc::vec::Vec<u32>,
    /// String indices.
    #[prost(uint32, repeated, tag = "4")]
    pub process_name: ::prost::alloc::vec::Vec<u32>,
    /// Offsets into `container_names`, one per thread (flattened array).
    #[prost(uint32, repeated, tag = "5")]
    pub container_offset: ::prost::alloc::vec::Vec<u32>,
    /// String indices.
    #[prost(uint32, repeated, tag = "6")]
    pub container_names: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Binaries {
    /// String indices.
    #[prost(uint32, repeated, tag = "1")]
    pub build_id: ::prost::alloc::vec::Vec<u32>,
    /// String indices.
    #[prost(uint32, repeated, tag = "2")]
    pub path: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Functions {
    /// String indices.
    #[prost(uint32, repeated, tag = "1")]
    pub name: ::prost::alloc::vec::Vec<u32>,
    /// String indices.
    #[prost(uint32, repeated, tag = "2")]
    pub system_name: ::prost::alloc::vec::Vec<u32>,
    /// String indices.
    #[prost(uint32, repeated, tag = "3")]
    pub filename: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "4")]
    pub start_line: ::prost::alloc::vec::Vec<u32>,
}

/// Flattened source-line records. Each inline chain is the slice
/// `[offset[i], offset[i + 1])` of the `function_id`/`line`/`column`
/// columns; those three columns together are the source-line table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InlineChains {
    #[prost(uint32, repeated, tag = "1")]
    pub offset: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "2")]
    pub function_id: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub line: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "4")]
    pub column: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StackFrames {
    #[prost(uint32, repeated, tag = "1")]
    pub binary_id: ::prost::alloc::vec::Vec<u32>,
    #[prost(int64, repeated, tag = "2")]
    pub binary_offset: ::prost::alloc::vec::Vec<i64>,
    #[prost(uint32, repeated, tag = "3")]
    pub inline_chain_id: ::prost::alloc::vec::Vec<u32>,
}

/// Flattened stacks: stack `i` is the slice `[offset[i], offset[i + 1])`
/// of `frame_id`, ordered leaf first.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stacks {
    #[prost(uint32, repeated, tag = "1")]
    pub offset: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "2")]
    pub frame_id: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleKeys {
    #[prost(uint32, repeated, tag = "1")]
    pub thread_id: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "2")]
    pub user_stack_id: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub kernel_stack_id: ::prost::alloc::vec::Vec<u32>,
    /// Offsets into `packed_label_id`, one per key (flattened array).
    #[prost(uint32, repeated, tag = "4")]
    pub first_label_id: ::prost::alloc::vec::Vec<u32>,
    /// Packed label indices: `(position << 1) | tag`, tag 1 for number
    /// labels, tag 0 for string labels.
    #[prost(uint32, repeated, tag = "5")]
    pub packed_label_id: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueType {
    /// String index.
    #[prost(uint32, required, tag = "1")]
    pub r#type: u32,
    /// String index.
    #[prost(uint32, required, tag = "2")]
    pub unit: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UInt128 {
    #[prost(uint64, required, tag = "1")]
    pub lo: u64,
    #[prost(uint64, required, tag = "2")]
    pub hi: u64,
}

/// One value column. `value` is congruent with `Samples::key`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleValues {
    #[prost(message, required, tag = "1")]
    pub r#type: ValueType,
    #[prost(uint64, repeated, tag = "2")]
    pub value: ::prost::alloc::vec::Vec<u64>,
    /// Sum of the whole column, maintained by the builder.
    #[prost(message, required, tag = "3")]
    pub value_sum: UInt128,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Timestamp {
    #[prost(int64, required, tag = "1")]
    pub seconds: i64,
    #[prost(uint32, required, tag = "2")]
    pub nanos: u32,
}

/// Sample timestamps, stored as signed nanosecond deltas against the
/// epoch base (the first sample's timestamp).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Timestamps {
    #[prost(message, required, tag = "1")]
    pub start_timestamp: Timestamp,
    #[prost(int64, repeated, tag = "2")]
    pub delta_nanoseconds: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Samples {
    /// Sample-key indices, one per sample.
    #[prost(uint32, repeated, tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u32>,
    #[prost(message, repeated, tag = "2")]
    pub values: ::prost::alloc::vec::Vec<SampleValues>,
    #[prost(message, optional, tag = "3")]
    pub timestamps: ::core::option::Option<Timestamps>,
}

/// Flags that affect profile interpretation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Features {
    /// Binary offsets were produced from addresses without section bias
    /// correction and cannot be compared across binaries directly.
    #[prost(bool, required, tag = "1")]
    pub has_skewed_binary_offsets: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metadata {
    /// String index of the default sample type.
    #[prost(uint32, required, tag = "1")]
    pub default_sample_type: u32,
    /// String index.
    #[prost(uint32, required, tag = "2")]
    pub hostname: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Profile {
    #[prost(message, required, tag = "1")]
    pub strtab: StringTable,
    #[prost(message, required, tag = "2")]
    pub comments: Comments,
    #[prost(message, required, tag = "3")]
    pub labels: Labels,
    #[prost(message, required, tag = "4")]
    pub threads: Threads,
    #[prost(message, required, tag = "5")]
    pub binaries: Binaries,
    #[prost(message, required, tag = "6")]
    pub functions: Functions,
    #[prost(message, required, tag = "7")]
    pub inline_chains: InlineChains,
    #[prost(message, required, tag = "8")]
    pub stack_frames: StackFrames,
    #[prost(message, required, tag = "9")]
    pub stacks: Stacks,
    #[prost(message, required, tag = "10")]
    pub sample_keys: SampleKeys,
    #[prost(message, required, tag = "11")]
    pub samples: Samples,
    #[prost(message, required, tag = "12")]
    pub features: Features,
    #[prost(message, required, tag = "13")]
    pub metadata: Metadata,
}
