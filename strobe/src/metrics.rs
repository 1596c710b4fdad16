//! Named counters for everything that can go wrong while sampling.
//!
//! Failures in the sampling domain never surface beyond these counters and
//! a diagnostic tag on the emitted record.

#[derive(Debug, Clone, Default)]
pub struct StageErrorCounters {
    pub start: u64,
    pub locate_tracee: u64,
    pub collect_stack: u64,
    pub collect_tls: u64,
    pub collect_python_stack: u64,
    pub collect_lbr_stack: u64,
    pub record_sample: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SamplerMetrics {
    // Native unwinder.
    pub dwarf_too_many_frames: u64,
    pub dwarf_no_rule_for_instruction: u64,
    pub dwarf_rule_evaluation_failed: u64,
    pub mapping_lookup_miss: u64,
    pub mapping_has_no_binary: u64,
    pub mapping_without_root: u64,
    pub unwind_table_lookup_failures: u64,
    pub fp_read_return_address_failures: u64,
    pub fp_read_base_pointer_failures: u64,
    pub stack_frames_total: u64,
    pub stack_frames_dwarf: u64,
    pub stack_frames_fp: u64,

    // Python walker.
    pub python_processed_stacks: u64,
    pub python_read_tls_thread_state_errors: u64,
    pub python_tls_thread_state_null: u64,
    pub python_read_native_thread_id_errors: u64,
    pub python_read_cframe_errors: u64,
    pub python_cframe_null: u64,
    pub python_read_interpreter_frame_errors: u64,
    pub python_interpreter_frame_null: u64,
    pub python_read_frame_owner_errors: u64,
    pub python_read_previous_frame_errors: u64,
    pub python_non_compact_ascii_strings: u64,

    // Pipeline.
    pub events_total: u64,
    pub samples_total: u64,
    pub samples_succeeded: u64,
    pub samples_failed: u64,
    pub filtered_kthreads: u64,
    pub filtered_processes: u64,
    pub unknown_processes: u64,
    pub process_notifications: u64,
    pub perf_event_multiplexed: u64,
    pub signal_deliver_triggered: u64,
    pub signal_deliver_sampled: u64,
    pub stage_errors: StageErrorCounters,
}
