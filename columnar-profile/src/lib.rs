//! A compact, normalized profile representation.
//!
//! Profiles are columnar: every entity kind (strings, binaries, functions,
//! stack frames, stacks, threads, sample keys, samples, …) lives in its own
//! table of parallel scalar columns, and entities reference each other
//! through typed integer indices. Tables are filled in topological order
//! and every referenced index is defined no later than the reference, so a
//! profile is a DAG by construction.
//!
//! Use [`ProfileBuilder`] to produce a profile (equal values are
//! deduplicated automatically), [`ProfileMerger`] to coalesce many
//! profiles into one, [`validate_profile`] to check untrusted input, and
//! the [`pprof`] module to convert to and from the pprof format.
//!
//! The builder and merger are single-threaded by design; the intended way
//! to scale is to run many independent instances in parallel, one per
//! output profile.

pub mod proto;

mod builder;
mod fast_hash_map;
mod index;
mod merge;
pub mod pprof;
mod profile;
mod string_table;
mod validate;

pub use builder::{
    BinaryInfo, FunctionInfo, InlineChainInfo, NumberLabelInfo, ProfileBuildError, ProfileBuilder,
    SampleInfo, SampleKeyInfo, SourceLineInfo, StackFrameInfo, StackInfo, StringLabelInfo,
    ThreadInfo,
};
pub use index::{
    BinaryId, CommentId, EntityIndex, FunctionId, InlineChainId, LabelId, SampleId, SampleKeyId,
    SourceLineId, StackFrameId, StackId, StringId, ThreadId, ValueTypeId,
};
pub use merge::{merge_profiles, MergeError, MergeOptions, ProfileMerger};
pub use profile::{
    BinaryRef, FunctionRef, InlineChainRef, LabelRef, LabelValue, ProfileView, SampleKeyRef,
    SampleRef, SampleTimestamp, SourceLineRef, StackFrameRef, StackRef, ThreadRef, ValueTypeRef,
};
pub use validate::{validate_profile, ValidationError, ValidationOptions};
