//! The staged sampling pipeline.
//!
//! Every sampling event runs the same stage sequence: identify the
//! thread, locate the tracee, collect native stacks, thread-local
//! variables and the Python stack, then submit one record. A stage
//! failure increments its counter and aborts the rest of the sample
//! while leaving the scratch state valid for the next one.
//!
//! One `Profiler` instance corresponds to one CPU's sampling context and
//! is strictly single-threaded; the caches it holds are shared across
//! samples, not across threads.

use schnellru::{ByLength, LruMap};

use crate::binary::{BinaryId, INVALID_BINARY_ID};
use crate::cgroups::{
    resolve_cgroup_hierarchy, END_OF_CGROUP_LIST, MAX_TRACED_CGROUPS, MAX_TRACED_PROCESSES,
    PARENT_CGROUP_MAX_LEVELS,
};
use crate::fast_hash_map::{FastHashMap, FastHashSet};
use crate::memory::UserMemory;
use crate::metrics::SamplerMetrics;
use crate::pidns::current_pidns_pid_tid;
use crate::python::walker::collect_python_stack;
use crate::python::{PythonConfig, PythonState, PythonSymbolCache, PythonThreadStateCache};
use crate::sample::{
    BranchRecord, NewProcessRecord, RecordSink, SampleRecord, SampleType,
};
use crate::task::TaskSnapshot;
use crate::tls::{collect_tls_values, TlsBinaryConfig, TlsCollectResult};
use crate::unwind::{
    is_kernel_address, NativeUnwinder, ProcessMappings, RegisterTriple, Stack, UnwindPageTable,
    UnwinderConfig,
};
use crate::unwind::mappings::{ExecutableMapping, MappingInsertError};
use crate::unwind::page_table::{UnwindRow, UnwindTableBuildError};

pub const SIGNAL_MASK_BITS: u32 = 64;

pub const MAX_TRACKED_PROCESS_INFOS: usize = 65536;
pub const MAX_PERF_EVENT_VALUES: usize = 4096;
pub const MAX_THREAD_TIMESTAMPS: usize = 1024 * 1024;

/// Which cgroup hierarchy identifies tracees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CgroupEngine {
    #[default]
    Unspecified,
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnwindType {
    #[default]
    Disabled,
    FramePointers,
    Dwarf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub unwind_type: UnwindType,
    pub main_binary_id: BinaryId,
}

impl Default for ProcessInfo {
    fn default() -> Self {
        ProcessInfo {
            unwind_type: UnwindType::Disabled,
            main_binary_id: INVALID_BINARY_ID,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfilerConfig {
    /// Include samples from kernel threads in the output.
    pub trace_kthreads: bool,

    /// Trace the whole system, skipping the cgroup/process filter.
    pub trace_whole_system: bool,

    pub active_cgroup_engine: CgroupEngine,

    /// Collect samples from this process only; zero disables the filter.
    pub pid_filter: u32,

    /// Inode of the pid namespace to resolve pids in. Useful when the
    /// profiler itself runs inside a pid namespace; zero means top level.
    pub pidns_inode: u32,

    /// Analyze one in `sched_sample_modulo` scheduler-switch events.
    pub sched_sample_modulo: u64,

    /// Bit `n` set means signal `n` is sampled.
    pub signal_mask: u64,
}

/// A perf counter reading, with the enabled/running times that expose
/// multiplexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerfCounterValue {
    pub counter: u64,
    pub enabled: u64,
    pub running: u64,
}

pub struct PerfEventContext<'a> {
    pub task: &'a TaskSnapshot,
    pub cpu: u16,
    /// Registers at the sampling interrupt; may point into the kernel.
    pub regs: RegisterTriple,
    /// The task's saved userspace registers, when the interrupt hit
    /// kernel code.
    pub saved_user_regs: Option<RegisterTriple>,
    pub kernel_stack: &'a [u64],
    /// Runtime-collected user stack, used for frame-pointer processes.
    pub fp_user_stack: &'a [u64],
    pub event_id: u64,
    pub counter: PerfCounterValue,
    pub branch_records: &'a [BranchRecord],
}

pub struct SchedSwitchContext<'a> {
    pub task: &'a TaskSnapshot,
    pub cpu: u16,
    pub saved_user_regs: Option<RegisterTriple>,
    pub kernel_stack: &'a [u64],
    pub fp_user_stack: &'a [u64],
}

pub struct SignalDeliverContext<'a> {
    pub task: &'a TaskSnapshot,
    pub cpu: u16,
    pub saved_user_regs: Option<RegisterTriple>,
    pub kernel_stack: &'a [u64],
    pub fp_user_stack: &'a [u64],
    pub signal: u32,
    /// The registered handler; `SIG_IGN` deliveries are not sampled.
    pub sa_handler: u64,
}

struct SampleArgs {
    event_count: u64,
    starttime: u64,
    sample_type: SampleType,
    sample_config: u64,
    needs_lbr_stack: bool,
    normalize_walltime: bool,
    record_walltime: bool,
    skip_sample_recording: bool,
}

struct EventData<'a> {
    task: &'a TaskSnapshot,
    cpu: u16,
    user_regs: RegisterTriple,
    kernel_stack: &'a [u64],
    fp_user_stack: &'a [u64],
    branch_records: &'a [BranchRecord],
}

/// Per-sample scratch. Lives in the profiler rather than on the stack so
/// that a sample costs no allocations.
struct Scratch {
    task_cgroups: [u64; PARENT_CGROUP_MAX_LEVELS],
    traced_cgroup: u64,
    traced_process: Option<u32>,
    kernel_stack: Stack,
    user_stack: Stack,
    python_state: PythonState,
    tls: TlsCollectResult,
    sample: SampleRecord,
}

impl Scratch {
    fn new() -> Self {
        Scratch {
            task_cgroups: [0; PARENT_CGROUP_MAX_LEVELS],
            traced_cgroup: END_OF_CGROUP_LIST,
            traced_process: None,
            kernel_stack: Stack::new(),
            user_stack: Stack::new(),
            python_state: PythonState::default(),
            tls: TlsCollectResult::default(),
            sample: SampleRecord::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("traced cgroup set is full")]
    TooManyTracedCgroups,

    #[error("traced process set is full")]
    TooManyTracedProcesses,

    #[error("tracked process table is full")]
    TooManyProcesses,
}

/// Picks the userspace register set for the unwinder. When the sampled
/// instruction pointer is in kernel space the interrupt registers are
/// useless for the user stack and the task's saved registers are used
/// instead.
fn find_task_userspace_registers(
    regs: RegisterTriple,
    saved_user_regs: Option<RegisterTriple>,
) -> Option<RegisterTriple> {
    if is_kernel_address(regs.ip) {
        saved_user_regs
    } else {
        Some(regs)
    }
}

pub struct Profiler {
    config: ProfilerConfig,
    unwinder: NativeUnwinder,
    unwind_table: UnwindPageTable,
    mappings: ProcessMappings,

    process_info: FastHashMap<u32, ProcessInfo>,
    process_discovery: LruMap<u32, ()>,
    traced_cgroups: FastHashSet<u64>,
    traced_processes: FastHashSet<u32>,
    python_configs: FastHashMap<BinaryId, PythonConfig>,
    tls_configs: FastHashMap<BinaryId, TlsBinaryConfig>,
    python_thread_states: PythonThreadStateCache,
    python_symbols: PythonSymbolCache,
    perf_event_values: FastHashMap<u64, PerfCounterValue>,
    thread_last_sample_time: LruMap<u32, u64>,

    metrics: SamplerMetrics,
    scratch: Scratch,
    iteration: u64,
    prandom_state: u32,
    clock: Box<dyn Fn() -> u64>,
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> Self {
        let origin = std::time::Instant::now();
        Self::with_clock(config, Box::new(move || origin.elapsed().as_nanos() as u64))
    }

    /// Builds a profiler with an explicit monotonic clock, in
    /// nanoseconds.
    pub fn with_clock(config: ProfilerConfig, clock: Box<dyn Fn() -> u64>) -> Self {
        Profiler {
            config,
            unwinder: NativeUnwinder::new(UnwinderConfig::default()),
            unwind_table: UnwindPageTable::new(),
            mappings: ProcessMappings::new(),
            process_info: FastHashMap::default(),
            process_discovery: LruMap::new(ByLength::new(MAX_TRACKED_PROCESS_INFOS as u32)),
            traced_cgroups: FastHashSet::default(),
            traced_processes: FastHashSet::default(),
            python_configs: FastHashMap::default(),
            tls_configs: FastHashMap::default(),
            python_thread_states: PythonThreadStateCache::new(),
            python_symbols: PythonSymbolCache::new(),
            perf_event_values: FastHashMap::default(),
            thread_last_sample_time: LruMap::new(ByLength::new(MAX_THREAD_TIMESTAMPS as u32)),
            metrics: SamplerMetrics::default(),
            scratch: Scratch::new(),
            iteration: 0,
            prandom_state: 0x9e3779b9,
            clock,
        }
    }

    pub fn set_unwinder_config(&mut self, config: UnwinderConfig) {
        self.unwinder = NativeUnwinder::new(config);
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProfilerConfig {
        &mut self.config
    }

    pub fn metrics(&self) -> &SamplerMetrics {
        &self.metrics
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// The symbol cache, for offline record consumers.
    pub fn python_symbols(&self) -> &PythonSymbolCache {
        &self.python_symbols
    }

    pub fn mappings(&self) -> &ProcessMappings {
        &self.mappings
    }

    pub fn register_process(&mut self, pid: u32, info: ProcessInfo) -> Result<(), RegistrationError> {
        if self.process_info.len() >= MAX_TRACKED_PROCESS_INFOS
            && !self.process_info.contains_key(&pid)
        {
            return Err(RegistrationError::TooManyProcesses);
        }
        self.process_info.insert(pid, info);
        Ok(())
    }

    pub fn remove_process(&mut self, pid: u32) {
        self.process_info.remove(&pid);
        self.mappings.remove_process(pid);
    }

    pub fn add_mapping(&mut self, pid: u32, mapping: ExecutableMapping) -> Result<(), MappingInsertError> {
        self.mappings.insert(pid, mapping)
    }

    pub fn add_unwind_table(
        &mut self,
        binary: BinaryId,
        rows: &[UnwindRow],
    ) -> Result<(), UnwindTableBuildError> {
        self.unwind_table.add_binary(binary, rows)?;
        Ok(())
    }

    pub fn set_python_config(&mut self, binary: BinaryId, config: PythonConfig) {
        self.python_configs.insert(binary, config);
    }

    pub fn set_tls_config(&mut self, binary: BinaryId, config: TlsBinaryConfig) {
        self.tls_configs.insert(binary, config);
    }

    pub fn trace_cgroup(&mut self, inode: u64) -> Result<(), RegistrationError> {
        if self.traced_cgroups.len() >= MAX_TRACED_CGROUPS && !self.traced_cgroups.contains(&inode)
        {
            return Err(RegistrationError::TooManyTracedCgroups);
        }
        self.traced_cgroups.insert(inode);
        Ok(())
    }

    pub fn untrace_cgroup(&mut self, inode: u64) {
        self.traced_cgroups.remove(&inode);
    }

    pub fn trace_process(&mut self, pid: u32) -> Result<(), RegistrationError> {
        if self.traced_processes.len() >= MAX_TRACED_PROCESSES
            && !self.traced_processes.contains(&pid)
        {
            return Err(RegistrationError::TooManyTracedProcesses);
        }
        self.traced_processes.insert(pid);
        Ok(())
    }

    // Entry points.

    /// Hardware/software perf event sample.
    pub fn handle_perf_event<M: UserMemory, S: RecordSink>(
        &mut self,
        ctx: &PerfEventContext<'_>,
        memory: &M,
        sink: &mut S,
    ) {
        let starttime = self.now();

        let event_count = self.calculate_perf_counter_delta(ctx.event_id, ctx.counter);
        if event_count == 0 {
            return;
        }
        log::trace!("got event count {event_count}");

        let Some(user_regs) = find_task_userspace_registers(ctx.regs, ctx.saved_user_regs) else {
            log::trace!("failed to load perf user regs");
            return;
        };

        let args = SampleArgs {
            event_count,
            starttime,
            sample_type: SampleType::PerfEvent,
            sample_config: ctx.event_id,
            needs_lbr_stack: true,
            normalize_walltime: false,
            record_walltime: true,
            skip_sample_recording: false,
        };
        let event = EventData {
            task: ctx.task,
            cpu: ctx.cpu,
            user_regs,
            kernel_stack: ctx.kernel_stack,
            fp_user_stack: ctx.fp_user_stack,
            branch_records: ctx.branch_records,
        };
        let _ = self.do_sample(args, &event, memory, sink);
    }

    /// Scheduler-switch probe, sampled by the configured modulo.
    pub fn handle_sched_switch<M: UserMemory, S: RecordSink>(
        &mut self,
        ctx: &SchedSwitchContext<'_>,
        memory: &M,
        sink: &mut S,
    ) {
        let starttime = self.now();
        let skip_sample_recording = !self.sample_sched_event();

        let Some(user_regs) = ctx.saved_user_regs else {
            log::trace!("failed to load sched-switch user regs");
            return;
        };

        let args = SampleArgs {
            event_count: 0,
            starttime,
            sample_type: SampleType::KprobeFinishTaskSwitch,
            sample_config: 0,
            needs_lbr_stack: false,
            normalize_walltime: true,
            record_walltime: true,
            skip_sample_recording,
        };
        let event = EventData {
            task: ctx.task,
            cpu: ctx.cpu,
            user_regs,
            kernel_stack: ctx.kernel_stack,
            fp_user_stack: ctx.fp_user_stack,
            branch_records: &[],
        };
        let _ = self.do_sample(args, &event, memory, sink);
    }

    /// Signal-delivery tracepoint, filtered by the signal mask.
    pub fn handle_signal_deliver<M: UserMemory, S: RecordSink>(
        &mut self,
        ctx: &SignalDeliverContext<'_>,
        memory: &M,
        sink: &mut S,
    ) {
        self.metrics.signal_deliver_triggered += 1;
        if !self.sample_signal(ctx.signal, ctx.sa_handler) {
            return;
        }
        self.metrics.signal_deliver_sampled += 1;

        let starttime = self.now();
        let Some(user_regs) = ctx.saved_user_regs else {
            log::trace!("failed to load signal-delivery user regs");
            return;
        };

        let args = SampleArgs {
            event_count: 0,
            starttime,
            sample_type: SampleType::TracepointSignalDeliver,
            sample_config: ctx.signal as u64,
            needs_lbr_stack: false,
            normalize_walltime: false,
            record_walltime: false,
            skip_sample_recording: false,
        };
        let event = EventData {
            task: ctx.task,
            cpu: ctx.cpu,
            user_regs,
            kernel_stack: ctx.kernel_stack,
            fp_user_stack: ctx.fp_user_stack,
            branch_records: &[],
        };
        let _ = self.do_sample(args, &event, memory, sink);
    }

    // Stage machinery.

    fn do_sample<M: UserMemory, S: RecordSink>(
        &mut self,
        args: SampleArgs,
        event: &EventData<'_>,
        memory: &M,
        sink: &mut S,
    ) -> Result<(), i32> {
        self.metrics.events_total += args.event_count;
        self.metrics.samples_total += 1;

        let sample = &mut self.scratch.sample;
        sample.sample_type = args.sample_type;
        sample.sample_config = args.sample_config;
        sample.value = 0;
        sample.timedelta = 0;
        sample.lbr_values.clear();

        let result = self.run_stages(&args, event, memory, sink);
        match result {
            Ok(()) => self.metrics.samples_succeeded += 1,
            Err(code) => {
                log::trace!("sampling pipeline failed with error code {code}");
                self.metrics.samples_failed += 1;
            }
        }
        result
    }

    fn run_stages<M: UserMemory, S: RecordSink>(
        &mut self,
        args: &SampleArgs,
        event: &EventData<'_>,
        memory: &M,
        sink: &mut S,
    ) -> Result<(), i32> {
        if let Err(code) = self.stage_start(args, event.task) {
            self.metrics.stage_errors.start += 1;
            return Err(code);
        }
        if let Err(code) = self.stage_locate_tracee(event.task) {
            self.metrics.stage_errors.locate_tracee += 1;
            return Err(code);
        }
        if let Err(code) = self.stage_collect_stack(event, memory, sink) {
            self.metrics.stage_errors.collect_stack += 1;
            return Err(code);
        }
        if let Err(code) = self.stage_collect_tls(event.task, memory, sink) {
            self.metrics.stage_errors.collect_tls += 1;
            return Err(code);
        }
        if let Err(code) = self.stage_collect_python_stack(event.task, memory, sink) {
            self.metrics.stage_errors.collect_python_stack += 1;
            return Err(code);
        }
        if args.needs_lbr_stack {
            if let Err(code) = self.stage_collect_lbr_stack(event) {
                self.metrics.stage_errors.collect_lbr_stack += 1;
                return Err(code);
            }
        }
        if let Err(code) = self.stage_record_sample(args, event, sink) {
            self.metrics.stage_errors.record_sample += 1;
            return Err(code);
        }
        Ok(())
    }

    fn stage_start(&mut self, args: &SampleArgs, task: &TaskSnapshot) -> Result<(), i32> {
        self.iteration += 1;

        // Skip kernel threads.
        if task.kthread && !self.config.trace_kthreads {
            self.metrics.filtered_kthreads += 1;
            return Err(-102);
        }

        let (pid, tid) = current_pidns_pid_tid(task, self.config.pidns_inode);
        let sample = &mut self.scratch.sample;
        sample.pid = pid;
        sample.tid = tid;
        sample.starttime = task.start_time;
        sample.kthread = task.kthread;

        if self.config.pid_filter != 0 && self.config.pid_filter != pid {
            self.metrics.filtered_processes += 1;
            return Err(-103);
        }

        self.record_thread_walltime(args);

        if args.skip_sample_recording {
            return Err(-104);
        }
        Ok(())
    }

    fn record_thread_walltime(&mut self, args: &SampleArgs) {
        if !args.record_walltime {
            return;
        }

        let tid = self.scratch.sample.tid;
        let mut timedelta = match self.thread_last_sample_time.get(&tid) {
            Some(last) => args.starttime.saturating_sub(*last),
            None => 0,
        };
        if args.normalize_walltime {
            timedelta *= self.config.sched_sample_modulo;
        }
        self.scratch.sample.timedelta = timedelta;

        self.thread_last_sample_time.insert(tid, args.starttime);
    }

    fn stage_locate_tracee(&mut self, task: &TaskSnapshot) -> Result<(), i32> {
        let chain = match self.config.active_cgroup_engine {
            CgroupEngine::V1 => &task.cgroups_v1,
            CgroupEngine::V2 => &task.cgroups_v2,
            CgroupEngine::Unspecified => {
                log::trace!("invalid config: no cgroup engine selected");
                return Err(-203);
            }
        };
        self.scratch.traced_cgroup =
            resolve_cgroup_hierarchy(chain, &self.traced_cgroups, &mut self.scratch.task_cgroups);
        self.scratch.traced_process = self
            .traced_processes
            .get(&self.scratch.sample.pid)
            .copied();

        if self.config.trace_whole_system {
            return Ok(());
        }

        if self.scratch.traced_cgroup == END_OF_CGROUP_LIST && self.scratch.traced_process.is_none()
        {
            // Neither a traced cgroup nor a traced process.
            return Err(-202);
        }
        Ok(())
    }

    /// Resolves the sampled process's info, notifying userspace exactly
    /// once about processes it has never described. Unknown processes
    /// fall back to frame-pointer unwinding.
    fn lookup_process<S: RecordSink>(&mut self, sink: &mut S) -> ProcessInfo {
        let pid = self.scratch.sample.pid;
        if let Some(info) = self.process_info.get(&pid) {
            return *info;
        }

        self.metrics.unknown_processes += 1;
        if self.process_discovery.get(&pid).is_none() {
            self.process_discovery.insert(pid, ());
            self.metrics.process_notifications += 1;
            sink.submit_new_process(&NewProcessRecord {
                pid,
                starttime: self.scratch.sample.starttime,
            });
        }

        ProcessInfo {
            unwind_type: UnwindType::FramePointers,
            main_binary_id: INVALID_BINARY_ID,
        }
    }

    fn stage_collect_stack<M: UserMemory, S: RecordSink>(
        &mut self,
        event: &EventData<'_>,
        memory: &M,
        sink: &mut S,
    ) -> Result<(), i32> {
        let info = self.lookup_process(sink);

        // The kernel stack is always attempted.
        self.scratch.kernel_stack.copy_from(event.kernel_stack);

        self.scratch.user_stack.clear();
        match info.unwind_type {
            UnwindType::FramePointers => {
                self.scratch.user_stack.copy_from(event.fp_user_stack);
            }
            UnwindType::Dwarf => {
                // Errors already incremented their counters; a partial
                // stack is still worth recording.
                let _ = self.unwinder.collect_stack(
                    &self.unwind_table,
                    &self.mappings,
                    memory,
                    &mut self.metrics,
                    self.scratch.sample.pid,
                    event.user_regs,
                    &mut self.scratch.user_stack,
                );
            }
            UnwindType::Disabled => {}
        }
        Ok(())
    }

    fn stage_collect_tls<M: UserMemory, S: RecordSink>(
        &mut self,
        task: &TaskSnapshot,
        memory: &M,
        sink: &mut S,
    ) -> Result<(), i32> {
        let info = self.lookup_process(sink);

        self.scratch.tls.clear();
        if let Some(config) = self.tls_configs.get(&info.main_binary_id) {
            collect_tls_values(config, task.fsbase, memory, &mut self.scratch.tls);
        }
        Ok(())
    }

    fn stage_collect_python_stack<M: UserMemory, S: RecordSink>(
        &mut self,
        task: &TaskSnapshot,
        memory: &M,
        sink: &mut S,
    ) -> Result<(), i32> {
        let info = self.lookup_process(sink);
        let pid = self.scratch.sample.pid;

        self.scratch.python_state.reset(pid);
        let Some(config) = self.python_configs.get(&info.main_binary_id).copied() else {
            return Ok(());
        };

        collect_python_stack(
            &config,
            pid,
            // The thread-state cache is keyed by native thread id.
            task.tid,
            task.fsbase,
            task.mm_start_code,
            memory,
            &mut self.python_thread_states,
            &mut self.python_symbols,
            &mut self.scratch.python_state,
            &mut self.metrics,
        );
        Ok(())
    }

    fn stage_collect_lbr_stack(&mut self, event: &EventData<'_>) -> Result<(), i32> {
        self.scratch
            .sample
            .lbr_values
            .copy_from(event.branch_records);
        Ok(())
    }

    fn stage_record_sample<S: RecordSink>(
        &mut self,
        args: &SampleArgs,
        event: &EventData<'_>,
        sink: &mut S,
    ) -> Result<(), i32> {
        let sample = &mut self.scratch.sample;
        sample.thread_comm = event.task.thread_comm;
        sample.process_comm = event.task.process_comm;
        sample.cpu = event.cpu;
        sample.parent_cgroup = self.scratch.traced_cgroup;
        sample.cgroups_hierarchy = self.scratch.task_cgroups;
        sample.kernel_stack = self.scratch.kernel_stack;
        sample.user_stack = self.scratch.user_stack;
        sample.python_stack.clear();
        sample
            .python_stack
            .extend_from_slice(&self.scratch.python_state.frames);
        sample.tls_values = self.scratch.tls.clone();
        sample.value = args.event_count;
        sample.runtime = (self.clock)().saturating_sub(args.starttime);

        sink.submit_sample(sample);
        Ok(())
    }

    // Event bookkeeping.

    fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Scaled counter delta since the previous reading of this event,
    /// compensating for multiplexing via the enabled/running ratio.
    fn calculate_perf_counter_delta(&mut self, id: u64, value: PerfCounterValue) -> u64 {
        let mut prev = self.perf_event_values.get(&id).copied().unwrap_or_default();

        // A counter that moved backwards was reset; start over.
        if prev.counter > value.counter {
            prev = PerfCounterValue::default();
        }

        let delta = PerfCounterValue {
            counter: value.counter.wrapping_sub(prev.counter),
            enabled: value.enabled.wrapping_sub(prev.enabled),
            running: value.running.wrapping_sub(prev.running),
        };

        if self.perf_event_values.len() < MAX_PERF_EVENT_VALUES
            || self.perf_event_values.contains_key(&id)
        {
            self.perf_event_values.insert(id, value);
        }

        if delta.counter == 0 || delta.enabled == 0 || delta.running == 0 {
            log::trace!(
                "zero event: {}, {}, {}",
                delta.counter,
                delta.enabled,
                delta.running
            );
            return 0;
        }

        let ratio = delta.running * 100 / delta.enabled;
        let count =
            (delta.counter as u128 * delta.enabled as u128 / delta.running as u128) as u64;
        if ratio != 100 {
            self.metrics.perf_event_multiplexed += 1;
            log::trace!("multiplexed event, scaling {} -> {count}", delta.counter);
        }
        count
    }

    fn sample_sched_event(&mut self) -> bool {
        let modulo = self.config.sched_sample_modulo;
        if modulo == 0 {
            return false;
        }
        self.prandom_u32() as u64 % modulo == 0
    }

    fn sample_signal(&self, signal: u32, sa_handler: u64) -> bool {
        if sa_handler == libc::SIG_IGN as u64 {
            return false;
        }
        if signal >= SIGNAL_MASK_BITS {
            return false;
        }
        self.config.signal_mask & (1u64 << signal) != 0
    }

    /// xorshift32; the quality bar is "spread sched samples around", not
    /// cryptography.
    fn prandom_u32(&mut self) -> u32 {
        let mut x = self.prandom_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.prandom_state = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;
    use crate::sample::VecSink;
    use crate::task::comm_from_str;

    const PID: u32 = 1000;
    const TID: u32 = 1001;

    fn task() -> TaskSnapshot {
        TaskSnapshot {
            pid: PID,
            tid: TID,
            start_time: 555,
            thread_comm: comm_from_str("worker"),
            process_comm: comm_from_str("app"),
            cgroups_v2: vec![10, 20, 30],
            ..Default::default()
        }
    }

    fn profiler() -> Profiler {
        let mut profiler = Profiler::new(ProfilerConfig {
            trace_whole_system: true,
            active_cgroup_engine: CgroupEngine::V2,
            ..Default::default()
        });
        profiler
            .register_process(
                PID,
                ProcessInfo {
                    unwind_type: UnwindType::FramePointers,
                    main_binary_id: 1,
                },
            )
            .unwrap();
        profiler
    }

    fn perf_ctx<'a>(task: &'a TaskSnapshot, counter: u64) -> PerfEventContext<'a> {
        PerfEventContext {
            task,
            cpu: 3,
            regs: RegisterTriple {
                sp: 0x7000,
                bp: 0,
                ip: 0x400100,
            },
            saved_user_regs: None,
            kernel_stack: &[0xffff_ffff_8100_0000],
            fp_user_stack: &[0x400100, 0x400200],
            event_id: 42,
            counter: PerfCounterValue {
                counter,
                enabled: counter,
                running: counter,
            },
            branch_records: &[],
        }
    }

    #[test]
    fn perf_event_produces_a_record() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut profiler = profiler();
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        profiler.handle_perf_event(&perf_ctx(&task, 1000), &memory, &mut sink);

        assert_eq!(sink.samples.len(), 1);
        let record = &sink.samples[0];
        assert_eq!(record.sample_type, SampleType::PerfEvent);
        assert_eq!(record.sample_config, 42);
        assert_eq!(record.pid, PID);
        assert_eq!(record.tid, TID);
        assert_eq!(record.cpu, 3);
        assert_eq!(record.value, 1000);
        assert_eq!(record.user_stack.ips(), &[0x400100, 0x400200]);
        assert_eq!(record.kernel_stack.ips(), &[0xffff_ffff_8100_0000]);
        assert_eq!(crate::task::comm_to_str(&record.thread_comm), "worker");
        assert_eq!(crate::task::comm_to_str(&record.process_comm), "app");
        assert_eq!(profiler.metrics().samples_succeeded, 1);
    }

    #[test]
    fn perf_events_capture_branch_records() {
        let mut profiler = profiler();
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        let branches = [BranchRecord {
            from: 0x401000,
            to: 0x402000,
            flags: 1,
        }];
        let ctx = PerfEventContext {
            branch_records: &branches,
            ..perf_ctx(&task, 1000)
        };
        profiler.handle_perf_event(&ctx, &memory, &mut sink);

        assert_eq!(sink.samples.len(), 1);
        assert_eq!(sink.samples[0].lbr_values.entries(), &branches);

        // Scheduler samples do not carry branch records.
        profiler.config_mut().sched_sample_modulo = 1;
        let sched = SchedSwitchContext {
            task: &task,
            cpu: 0,
            saved_user_regs: Some(RegisterTriple {
                sp: 0x7000,
                bp: 0,
                ip: 0x400100,
            }),
            kernel_stack: &[],
            fp_user_stack: &[0x400100],
        };
        profiler.handle_sched_switch(&sched, &memory, &mut sink);
        assert!(sink.samples[1].lbr_values.entries().is_empty());
    }

    #[test]
    fn perf_counter_deltas_are_scaled() {
        let mut profiler = profiler();
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        let first = PerfEventContext {
            counter: PerfCounterValue {
                counter: 1000,
                enabled: 100,
                running: 100,
            },
            ..perf_ctx(&task, 0)
        };
        profiler.handle_perf_event(&first, &memory, &mut sink);
        assert_eq!(sink.samples[0].value, 1000);

        // Second reading: the counter advanced by 500 while the event ran
        // for only half of the enabled time, so the count scales to 1000.
        let second = PerfEventContext {
            counter: PerfCounterValue {
                counter: 1500,
                enabled: 300,
                running: 200,
            },
            ..perf_ctx(&task, 0)
        };
        profiler.handle_perf_event(&second, &memory, &mut sink);

        assert_eq!(sink.samples.len(), 2);
        assert_eq!(sink.samples[1].value, 1000);
        assert_eq!(profiler.metrics().perf_event_multiplexed, 1);
    }

    #[test]
    fn zero_counter_delta_drops_the_event() {
        let mut profiler = profiler();
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        profiler.handle_perf_event(&perf_ctx(&task, 1000), &memory, &mut sink);
        // Same reading again: delta is zero, no record.
        profiler.handle_perf_event(&perf_ctx(&task, 1000), &memory, &mut sink);

        assert_eq!(sink.samples.len(), 1);
    }

    #[test]
    fn kernel_threads_are_filtered_unless_enabled() {
        let mut profiler = profiler();
        let mut task = task();
        task.kthread = true;
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        profiler.handle_perf_event(&perf_ctx(&task, 1000), &memory, &mut sink);
        assert!(sink.samples.is_empty());
        assert_eq!(profiler.metrics().filtered_kthreads, 1);
        assert_eq!(profiler.metrics().stage_errors.start, 1);

        profiler.config_mut().trace_kthreads = true;
        profiler.handle_perf_event(&perf_ctx(&task, 2000), &memory, &mut sink);
        assert_eq!(sink.samples.len(), 1);
        assert!(sink.samples[0].kthread);
    }

    #[test]
    fn pid_filter_drops_other_processes() {
        let mut profiler = profiler();
        profiler.config_mut().pid_filter = PID + 1;
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        profiler.handle_perf_event(&perf_ctx(&task, 1000), &memory, &mut sink);
        assert!(sink.samples.is_empty());
        assert_eq!(profiler.metrics().filtered_processes, 1);
    }

    #[test]
    fn cgroup_filter_selects_tracees() {
        let mut profiler = profiler();
        profiler.config_mut().trace_whole_system = false;
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        // Not traced: dropped at the locate-tracee stage.
        profiler.handle_perf_event(&perf_ctx(&task, 1000), &memory, &mut sink);
        assert!(sink.samples.is_empty());
        assert_eq!(profiler.metrics().stage_errors.locate_tracee, 1);

        // Trace an ancestor cgroup: the sample goes through and records
        // the hierarchy below the traced ancestor.
        profiler.trace_cgroup(30).unwrap();
        profiler.handle_perf_event(&perf_ctx(&task, 2000), &memory, &mut sink);
        assert_eq!(sink.samples.len(), 1);
        assert_eq!(sink.samples[0].parent_cgroup, 30);
        assert_eq!(sink.samples[0].cgroups_hierarchy[0], 10);
        assert_eq!(sink.samples[0].cgroups_hierarchy[1], 20);
        assert_eq!(sink.samples[0].cgroups_hierarchy[2], END_OF_CGROUP_LIST);

        // Tracing by pid works too.
        profiler.untrace_cgroup(30);
        profiler.trace_process(PID).unwrap();
        profiler.handle_perf_event(&perf_ctx(&task, 3000), &memory, &mut sink);
        assert_eq!(sink.samples.len(), 2);
    }

    #[test]
    fn unknown_processes_notify_userspace_once() {
        let mut profiler = Profiler::new(ProfilerConfig {
            trace_whole_system: true,
            active_cgroup_engine: CgroupEngine::V2,
            ..Default::default()
        });
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        profiler.handle_perf_event(&perf_ctx(&task, 1000), &memory, &mut sink);
        profiler.handle_perf_event(&perf_ctx(&task, 2000), &memory, &mut sink);

        // Both samples recorded with the default frame-pointer policy,
        // but only one discovery notification.
        assert_eq!(sink.samples.len(), 2);
        assert_eq!(sink.new_processes.len(), 1);
        assert_eq!(
            sink.new_processes[0],
            NewProcessRecord {
                pid: PID,
                starttime: 555,
            }
        );
        assert_eq!(sink.samples[0].user_stack.ips(), &[0x400100, 0x400200]);
    }

    #[test]
    fn sched_switch_records_walltime_deltas() {
        let ticks = std::rc::Rc::new(std::cell::Cell::new(0u64));
        let clock_ticks = ticks.clone();
        let mut profiler = Profiler::with_clock(
            ProfilerConfig {
                trace_whole_system: true,
                active_cgroup_engine: CgroupEngine::V2,
                sched_sample_modulo: 1,
                ..Default::default()
            },
            Box::new(move || clock_ticks.get()),
        );
        profiler
            .register_process(
                PID,
                ProcessInfo {
                    unwind_type: UnwindType::FramePointers,
                    main_binary_id: 1,
                },
            )
            .unwrap();

        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();
        let ctx = SchedSwitchContext {
            task: &task,
            cpu: 0,
            saved_user_regs: Some(RegisterTriple {
                sp: 0x7000,
                bp: 0,
                ip: 0x400100,
            }),
            kernel_stack: &[],
            fp_user_stack: &[0x400100],
        };

        ticks.set(1_000);
        profiler.handle_sched_switch(&ctx, &memory, &mut sink);
        ticks.set(6_000);
        profiler.handle_sched_switch(&ctx, &memory, &mut sink);

        assert_eq!(sink.samples.len(), 2);
        assert_eq!(sink.samples[0].sample_type, SampleType::KprobeFinishTaskSwitch);
        assert_eq!(sink.samples[0].timedelta, 0);
        assert_eq!(sink.samples[1].timedelta, 5_000);
    }

    #[test]
    fn sched_sampling_requires_a_modulo() {
        let mut profiler = profiler();
        // Modulo zero: never sample scheduler events.
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();
        let ctx = SchedSwitchContext {
            task: &task,
            cpu: 0,
            saved_user_regs: Some(RegisterTriple {
                sp: 0x7000,
                bp: 0,
                ip: 0x400100,
            }),
            kernel_stack: &[],
            fp_user_stack: &[],
        };
        profiler.handle_sched_switch(&ctx, &memory, &mut sink);
        assert!(sink.samples.is_empty());
    }

    #[test]
    fn signal_deliveries_respect_mask_and_sig_ign() {
        let mut profiler = profiler();
        profiler.config_mut().signal_mask = 1 << 11; // SIGSEGV
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        let ctx = |signal: u32, sa_handler: u64| SignalDeliverContext {
            task: &task,
            cpu: 0,
            saved_user_regs: Some(RegisterTriple {
                sp: 0x7000,
                bp: 0,
                ip: 0x400100,
            }),
            kernel_stack: &[],
            fp_user_stack: &[0x400100],
            signal,
            sa_handler,
        };

        // Masked-out signal.
        profiler.handle_signal_deliver(&ctx(2, 0), &memory, &mut sink);
        assert!(sink.samples.is_empty());

        // Ignored signal.
        profiler.handle_signal_deliver(&ctx(11, libc::SIG_IGN as u64), &memory, &mut sink);
        assert!(sink.samples.is_empty());

        // Sampled signal.
        profiler.handle_signal_deliver(&ctx(11, 0), &memory, &mut sink);
        assert_eq!(sink.samples.len(), 1);
        assert_eq!(sink.samples[0].sample_type, SampleType::TracepointSignalDeliver);
        assert_eq!(sink.samples[0].sample_config, 11);

        assert_eq!(profiler.metrics().signal_deliver_triggered, 3);
        assert_eq!(profiler.metrics().signal_deliver_sampled, 1);
    }

    #[test]
    fn dwarf_processes_unwind_through_the_rule_table() {
        use crate::unwind::rule::{CfaUnwindRule, RbpUnwindRule, UnwindRule, REG_RSP};

        let mut profiler = profiler();
        profiler
            .register_process(
                PID,
                ProcessInfo {
                    unwind_type: UnwindType::Dwarf,
                    main_binary_id: 9,
                },
            )
            .unwrap();
        profiler
            .add_unwind_table(
                9,
                &[
                    UnwindRow {
                        start_pc: 0x1000,
                        pc_range: 0x100,
                        rule: UnwindRule {
                            cfa: CfaUnwindRule::register_offset(REG_RSP, 8),
                            rbp: RbpUnwindRule::UNDEFINED,
                        },
                    },
                    UnwindRow {
                        start_pc: 0x2000,
                        pc_range: 0x100,
                        rule: UnwindRule {
                            cfa: CfaUnwindRule::register_offset(REG_RSP, 8),
                            rbp: RbpUnwindRule::UNDEFINED,
                        },
                    },
                ],
            )
            .unwrap();
        profiler
            .add_mapping(
                PID,
                ExecutableMapping {
                    begin: 0x400000,
                    end: 0x500000,
                    binary_id: 9,
                    file_offset: 0x3ff000,
                },
            )
            .unwrap();

        let mut memory = FakeMemory::new();
        // Leaf frame at 0x401010 (pc 0x2010): CFA = sp + 8, caller is
        // 0x400020 (pc 0x1020); the caller's RA slot stops the walk.
        memory.write_u64(0x7000, 0x400021);
        memory.write_u64(0x7008, 0);

        let task = task();
        let mut sink = VecSink::default();
        let ctx = PerfEventContext {
            regs: RegisterTriple {
                sp: 0x7000,
                bp: 0,
                ip: 0x401010,
            },
            ..perf_ctx(&task, 1000)
        };
        profiler.handle_perf_event(&ctx, &memory, &mut sink);

        assert_eq!(sink.samples.len(), 1);
        assert_eq!(sink.samples[0].user_stack.ips(), &[0x401010, 0x400020]);
        assert_eq!(profiler.metrics().stack_frames_dwarf, 2);
    }

    /// When the sampled ip is in the kernel, the user stack must start
    /// from the task's saved userspace registers.
    #[test]
    fn kernel_mode_samples_use_saved_user_registers() {
        let mut profiler = profiler();
        let task = task();
        let memory = FakeMemory::new();
        let mut sink = VecSink::default();

        let ctx = PerfEventContext {
            regs: RegisterTriple {
                sp: 0xffff_8000_0000_0000,
                bp: 0,
                ip: 0xffff_ffff_8100_1234,
            },
            saved_user_regs: None,
            ..perf_ctx(&task, 1000)
        };
        // Without saved registers the event is dropped entirely.
        profiler.handle_perf_event(&ctx, &memory, &mut sink);
        assert!(sink.samples.is_empty());

        let ctx = PerfEventContext {
            regs: RegisterTriple {
                sp: 0xffff_8000_0000_0000,
                bp: 0,
                ip: 0xffff_ffff_8100_1234,
            },
            saved_user_regs: Some(RegisterTriple {
                sp: 0x7000,
                bp: 0,
                ip: 0x400100,
            }),
            ..perf_ctx(&task, 2000)
        };
        profiler.handle_perf_event(&ctx, &memory, &mut sink);
        assert_eq!(sink.samples.len(), 1);
    }
}
