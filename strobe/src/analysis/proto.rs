//! The per-binary preprocessing artifact.
//!
//! An offline tool parses an ELF object, encodes its unwind rules into a
//! dictionary-compressed table and discovers the TLS and Python layout;
//! the agent consumes the resulting message. This module is the wire
//! contract between the two.

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Unsupported {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CfaMinus8 {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CfaPlusOffset {
    #[prost(sint64, tag = "1")]
    pub offset: i64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RegisterOffset {
    #[prost(uint32, tag = "1")]
    pub register: u32,
    #[prost(sint64, tag = "2")]
    pub offset: i64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RegisterDerefOffset {
    #[prost(uint32, tag = "1")]
    pub register: u32,
    #[prost(sint64, tag = "2")]
    pub offset: i64,
    #[prost(uint64, tag = "3")]
    pub bias: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PltSection {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Constant {
    #[prost(uint64, tag = "1")]
    pub value: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnwindRule {
    #[prost(bool, tag = "1")]
    pub dereference: bool,
    #[prost(oneof = "unwind_rule::Kind", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub kind: ::core::option::Option<unwind_rule::Kind>,
}

pub mod unwind_rule {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        Unsupported(super::Unsupported),
        #[prost(message, tag = "3")]
        CfaMinus8(super::CfaMinus8),
        #[prost(message, tag = "4")]
        CfaPlusOffset(super::CfaPlusOffset),
        #[prost(message, tag = "5")]
        RegisterOffset(super::RegisterOffset),
        #[prost(message, tag = "6")]
        RegisterDerefOffset(super::RegisterDerefOffset),
        #[prost(message, tag = "7")]
        PltSection(super::PltSection),
        #[prost(message, tag = "8")]
        Constant(super::Constant),
    }
}

/// Parallel-array unwind table. `cfa`/`rbp`/`ra` are indices into `dict`.
/// For transmission `start_pc` is delta-encoded against the end of the
/// previous row; the receiver integrates it back before use.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnwindTable {
    #[prost(uint64, repeated, tag = "1")]
    pub start_pc: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "2")]
    pub pc_range: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint32, repeated, tag = "3")]
    pub cfa: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "4")]
    pub rbp: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "5")]
    pub ra: ::prost::alloc::vec::Vec<u32>,
    /// Deduplicated rules, most used first.
    #[prost(message, repeated, tag = "6")]
    pub dict: ::prost::alloc::vec::Vec<UnwindRule>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TlsVariable {
    /// Offset of the variable below the thread image.
    #[prost(int64, tag = "1")]
    pub offset: i64,
    /// Demangled symbol name.
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TlsConfig {
    #[prost(message, repeated, tag = "1")]
    pub variables: ::prost::alloc::vec::Vec<TlsVariable>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PythonVersion {
    #[prost(uint32, tag = "1")]
    pub major: u32,
    #[prost(uint32, tag = "2")]
    pub minor: u32,
    #[prost(uint32, tag = "3")]
    pub micro: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PythonConfig {
    #[prost(message, optional, tag = "1")]
    pub version: ::core::option::Option<PythonVersion>,
    /// Thread-image offset of the current-thread-state TLS slot.
    #[prost(uint64, tag = "2")]
    pub py_thread_state_tls_offset: u64,
    /// `_PyRuntime` address relative to the binary's text start.
    #[prost(uint64, tag = "3")]
    pub relative_py_runtime_address: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BinaryAnalysis {
    #[prost(message, required, tag = "1")]
    pub unwind_table: UnwindTable,
    #[prost(message, required, tag = "2")]
    pub tls_config: TlsConfig,
    #[prost(message, required, tag = "3")]
    pub python_config: PythonConfig,
}
