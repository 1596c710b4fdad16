//! The per-binary preprocessing artifact and its encodings.
//!
//! Producing the artifact from an ELF object is an offline concern; this
//! module owns the wire contract and the transforms needed on the
//! consuming side: delta decoding, the rule dictionary, and packing rules
//! into the sampling-time format.

pub mod proto;
pub mod serialize;
pub mod table;

pub use serialize::{deserialize_binary_analysis, serialize_binary_analysis, AnalysisError};
pub use table::{
    build_unwind_rows, delta_encode, differentiate_unwind_table, integrate_unwind_table,
    RuleDict, RuleDictBuilder, UnwindTableError,
};
