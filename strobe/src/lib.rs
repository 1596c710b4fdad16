//! Core of a whole-machine, always-on sampling profiler.
//!
//! The sampling side observes running processes and collects periodic
//! stack samples: native stacks are unwound from pre-baked rule tables
//! (with a frame-pointer fallback), Python stacks are reconstructed by
//! reading interpreter memory, and tracked thread-local variables are
//! captured alongside. Each event flows through the staged
//! [`pipeline::Profiler`] and comes out as one [`sample::SampleRecord`].
//!
//! The sampling domain is single-threaded per CPU, allocation-free per
//! sample, and every loop it runs is bounded by a named constant: the
//! fixed-depth page-table descent, the fixed-iteration leaf bisect, the
//! cgroup ascent, the pid-namespace walk, and the native and Python frame
//! budgets. Those bounds come from the restricted runtime this design
//! targets, and the tests pin them.
//!
//! The [`analysis`] module owns the wire contract with the offline binary
//! preprocessor, and [`ingest`] folds emitted records into the
//! `columnar-profile` representation.

pub mod analysis;
pub mod binary;
pub mod cgroups;
pub mod ingest;
pub mod memory;
pub mod metrics;
pub mod pidns;
pub mod pipeline;
pub mod python;
pub mod sample;
pub mod task;
pub mod tls;
pub mod unwind;

mod fast_hash_map;

pub use binary::{BinaryId, INVALID_BINARY_ID, MAX_BINARIES};
pub use memory::{MemoryReadError, UserMemory};
pub use metrics::SamplerMetrics;
pub use pipeline::{
    CgroupEngine, PerfCounterValue, PerfEventContext, ProcessInfo, Profiler, ProfilerConfig,
    SchedSwitchContext, SignalDeliverContext, UnwindType,
};
pub use sample::{NewProcessRecord, RecordSink, SampleRecord, SampleType, VecSink};
pub use task::TaskSnapshot;

#[cfg(test)]
mod limits_tests {
    //! The resource caps and loop bounds are part of the design contract;
    //! keep them pinned.

    #[test]
    fn resource_limits_match_the_design() {
        assert_eq!(crate::binary::MAX_BINARIES, 1024 * 1024);
        assert_eq!(crate::unwind::page_table::MAX_UNWIND_TABLE_PAGES, 1024 * 1024);
        assert_eq!(crate::unwind::page_table::PAGES_PER_PART, 16384);
        assert_eq!(crate::unwind::page_table::UNWIND_TABLE_PAGE_SIZE, 4128);
        assert_eq!(crate::unwind::page_table::LEAF_BISECT_ITERATIONS, 8);
        assert_eq!(
            crate::unwind::page_table::UNWIND_PAGE_TABLE_LEVEL_WIDTHS,
            [10, 10, 9]
        );
        assert_eq!(crate::cgroups::MAX_TRACED_CGROUPS, 16384);
        assert_eq!(crate::cgroups::MAX_TRACED_PROCESSES, 1024);
        assert_eq!(crate::cgroups::PARENT_CGROUP_MAX_LEVELS, 16);
        assert_eq!(crate::pidns::PIDNS_LOOKUP_MAX_DEPTH, 32);
        assert_eq!(crate::pipeline::MAX_TRACKED_PROCESS_INFOS, 65536);
        assert_eq!(crate::python::MAX_PYTHON_THREADS, 16384);
        assert_eq!(crate::python::MAX_PYTHON_SYMBOLS, 200_000);
        assert_eq!(crate::python::MAX_PYTHON_THREAD_STATE_WALK, 32);
        assert_eq!(crate::python::PYTHON_MAX_STACK_DEPTH, 128);
        assert_eq!(crate::unwind::MAX_STACK_DEPTH, 128);
        assert_eq!(crate::tls::MAX_TRACKED_THREAD_LOCALS_PER_BINARY, 4);
        assert_eq!(crate::tls::MAX_THREAD_LOCAL_STRING_LENGTH, 128);
        assert_eq!(crate::sample::MAX_BRANCH_RECORDS, 32);
    }
}
