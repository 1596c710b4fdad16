//! Cgroup-based tracee selection.

use crate::fast_hash_map::FastHashSet;

pub const PARENT_CGROUP_MAX_LEVELS: usize = 16;
pub const END_OF_CGROUP_LIST: u64 = u64::MAX;

pub const MAX_TRACED_CGROUPS: usize = 16 * 1024;
pub const MAX_TRACED_PROCESSES: usize = 1024;

/// Walks the task's cgroup chain (innermost first) looking for a traced
/// ancestor, recording up to [`PARENT_CGROUP_MAX_LEVELS`] untraced
/// ancestors into `out` on the way. Returns the traced ancestor's inode,
/// or [`END_OF_CGROUP_LIST`] if none is found within the bound. A short
/// hierarchy is terminated with the sentinel.
pub fn resolve_cgroup_hierarchy(
    chain: &[u64],
    traced: &FastHashSet<u64>,
    out: &mut [u64; PARENT_CGROUP_MAX_LEVELS],
) -> u64 {
    let mut parent = END_OF_CGROUP_LIST;
    let mut filled = 0;

    for inode in chain.iter().take(PARENT_CGROUP_MAX_LEVELS) {
        if traced.contains(inode) {
            parent = *inode;
            break;
        }
        out[filled] = *inode;
        filled += 1;
    }

    if filled < PARENT_CGROUP_MAX_LEVELS {
        out[filled] = END_OF_CGROUP_LIST;
    }
    parent
}
