//! Snapshot of the sampled task.
//!
//! The sampling runtime reads these fields out of the kernel's task
//! structures at event time; in this crate they arrive as a snapshot
//! captured by the embedder, and the pipeline applies the same bounded
//! walks and filters to them.

pub const TASK_COMM_LEN: usize = 16;

/// The task's pid as seen from one pid namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidNamespacePid {
    /// Inode number of the pid namespace.
    pub ns_inode: u32,
    pub pid: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TaskSnapshot {
    /// Top-level thread-group id and thread id.
    pub pid: u32,
    pub tid: u32,
    /// Thread pid per namespace level, top level first.
    pub tid_levels: Vec<PidNamespacePid>,
    /// Process pid per namespace level, top level first.
    pub pid_levels: Vec<PidNamespacePid>,
    /// Process start time (boot-time clock).
    pub start_time: u64,
    pub kthread: bool,
    pub thread_comm: [u8; TASK_COMM_LEN],
    pub process_comm: [u8; TASK_COMM_LEN],
    /// FS segment base of the sampled thread.
    pub fsbase: u64,
    /// Start of the process text mapping, for ASLR-relative globals.
    pub mm_start_code: u64,
    /// Cgroup inode chain of the freezer (v1) hierarchy, innermost first.
    pub cgroups_v1: Vec<u64>,
    /// Cgroup inode chain of the unified (v2) hierarchy, innermost first.
    pub cgroups_v2: Vec<u64>,
}

/// Copies a comm string into the fixed-size record field.
pub fn comm_from_str(comm: &str) -> [u8; TASK_COMM_LEN] {
    let mut buf = [0u8; TASK_COMM_LEN];
    let bytes = comm.as_bytes();
    let len = bytes.len().min(TASK_COMM_LEN - 1);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// The printable prefix of a comm field.
pub fn comm_to_str(comm: &[u8; TASK_COMM_LEN]) -> &str {
    let len = comm.iter().position(|b| *b == 0).unwrap_or(TASK_COMM_LEN);
    std::str::from_utf8(&comm[..len]).unwrap_or("")
}
