//! Emitted records and the output ring.

use crate::cgroups::PARENT_CGROUP_MAX_LEVELS;
use crate::python::walker::PythonFrame;
use crate::python::PYTHON_MAX_STACK_DEPTH;
use crate::task::TASK_COMM_LEN;
use crate::tls::TlsCollectResult;
use crate::unwind::Stack;

/// Intel hardware captures at most 32 last-branch records.
pub const MAX_BRANCH_RECORDS: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchRecord {
    pub from: u64,
    pub to: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LastBranchRecords {
    pub nr: u32,
    pub entries: [BranchRecord; MAX_BRANCH_RECORDS],
}

impl LastBranchRecords {
    pub fn clear(&mut self) {
        self.nr = 0;
    }

    pub fn copy_from(&mut self, records: &[BranchRecord]) {
        self.nr = records.len().min(MAX_BRANCH_RECORDS) as u32;
        self.entries[..self.nr as usize].copy_from_slice(&records[..self.nr as usize]);
    }

    pub fn entries(&self) -> &[BranchRecord] {
        &self.entries[..self.nr as usize]
    }
}

impl Default for LastBranchRecords {
    fn default() -> Self {
        LastBranchRecords {
            nr: 0,
            entries: [BranchRecord::default(); MAX_BRANCH_RECORDS],
        }
    }
}

/// Which attach point produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleType {
    #[default]
    Undefined,
    PerfEvent,
    KprobeFinishTaskSwitch,
    TracepointSignalDeliver,
    TracepointSchedSwitch,
}

/// One sample, as submitted to the output ring.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub sample_type: SampleType,
    /// Perf event id for perf-event samples, signal number for
    /// signal-delivery samples.
    pub sample_config: u64,
    pub kthread: bool,
    pub cpu: u16,
    /// Nanoseconds the sampling code ran for, for self-profiling.
    pub runtime: u64,
    pub thread_comm: [u8; TASK_COMM_LEN],
    pub process_comm: [u8; TASK_COMM_LEN],
    pub pid: u32,
    pub tid: u32,
    pub parent_cgroup: u64,
    /// Untraced ancestor cgroups, innermost first, terminated by the
    /// end-of-list sentinel when short.
    pub cgroups_hierarchy: [u64; PARENT_CGROUP_MAX_LEVELS],
    pub starttime: u64,
    pub kernel_stack: Stack,
    pub user_stack: Stack,
    pub python_stack: Vec<PythonFrame>,
    pub tls_values: TlsCollectResult,
    pub lbr_values: LastBranchRecords,
    /// Sample value (e.g. scaled event count).
    pub value: u64,
    /// Nanoseconds since the previous sample of this thread; 0 for the
    /// first one.
    pub timedelta: u64,
}

impl SampleRecord {
    pub fn new() -> Self {
        SampleRecord {
            sample_type: SampleType::Undefined,
            sample_config: 0,
            kthread: false,
            cpu: 0,
            runtime: 0,
            thread_comm: [0; TASK_COMM_LEN],
            process_comm: [0; TASK_COMM_LEN],
            pid: 0,
            tid: 0,
            parent_cgroup: 0,
            cgroups_hierarchy: [0; PARENT_CGROUP_MAX_LEVELS],
            starttime: 0,
            kernel_stack: Stack::new(),
            user_stack: Stack::new(),
            python_stack: Vec::with_capacity(PYTHON_MAX_STACK_DEPTH),
            tls_values: TlsCollectResult::default(),
            lbr_values: LastBranchRecords::default(),
            value: 0,
            timedelta: 0,
        }
    }
}

impl Default for SampleRecord {
    fn default() -> Self {
        SampleRecord::new()
    }
}

/// Notification that an unknown process was sampled; the control plane
/// reacts by uploading its mappings and binary analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewProcessRecord {
    pub pid: u32,
    pub starttime: u64,
}

/// The output ring. Records are copied out on submit; implementations
/// must not hold on to the references.
pub trait RecordSink {
    fn submit_sample(&mut self, record: &SampleRecord);
    fn submit_new_process(&mut self, record: &NewProcessRecord);
}

/// Collects records into vectors; the default sink for tests and simple
/// embedders.
#[derive(Debug, Default)]
pub struct VecSink {
    pub samples: Vec<SampleRecord>,
    pub new_processes: Vec<NewProcessRecord>,
}

impl RecordSink for VecSink {
    fn submit_sample(&mut self, record: &SampleRecord) {
        self.samples.push(record.clone());
    }

    fn submit_new_process(&mut self, record: &NewProcessRecord) {
        self.new_processes.push(*record);
    }
}
