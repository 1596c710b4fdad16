//! The native stack unwinder.
//!
//! Each step resolves the current instruction pointer to a binary, looks
//! the unwind rule up in the paged table and evaluates it. When rule
//! lookup fails the unwinder takes a single frame-pointer step and keeps
//! going, which supports binaries with mixed coverage.

use crate::binary::INVALID_BINARY_ID;
use crate::memory::UserMemory;
use crate::metrics::SamplerMetrics;
use crate::unwind::cfi::{self, RegisterTriple, STOP_IP};
use crate::unwind::mappings::ProcessMappings;
use crate::unwind::page_table::{UnwindPageTable, UnwindTableLookupError};
use crate::unwind::rule::UnwindRule;

/// Frame budget of one collected stack.
pub const MAX_STACK_DEPTH: usize = 128;

/// A fixed-capacity call stack, leaf first.
#[derive(Debug, Clone, Copy)]
pub struct Stack {
    len: u32,
    ips: [u64; MAX_STACK_DEPTH],
}

impl Stack {
    pub fn new() -> Self {
        Stack {
            len: 0,
            ips: [0; MAX_STACK_DEPTH],
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, ip: u64) -> bool {
        if self.len as usize >= MAX_STACK_DEPTH {
            return false;
        }
        self.ips[self.len as usize] = ip;
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ips(&self) -> &[u64] {
        &self.ips[..self.len as usize]
    }

    pub fn copy_from(&mut self, ips: &[u64]) {
        self.clear();
        for ip in ips.iter().take(MAX_STACK_DEPTH) {
            self.push(*ip);
        }
    }
}

impl Default for Stack {
    fn default() -> Self {
        Stack::new()
    }
}

/// Kernel text lives in the all-ones top byte of the address space.
pub fn is_kernel_address(ip: u64) -> bool {
    ip >> 56 == 0xff
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindError {
    TooManyFrames,
    NoRuleForInstruction,
    RuleEvaluationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepResult {
    Continue,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnwinderConfig {
    /// Treat a zero base pointer as the bottom of the stack, per the
    /// System V AMD64 initial-state convention. Many runtimes do not
    /// maintain the convention, so this is off by default.
    pub stop_at_zero_bp: bool,
}

struct UnwindContext {
    pid: u32,
    cfi: RegisterTriple,
    framepointers: u32,
    error: Option<UnwindError>,
}

pub struct NativeUnwinder {
    config: UnwinderConfig,
}

impl NativeUnwinder {
    pub fn new(config: UnwinderConfig) -> Self {
        NativeUnwinder { config }
    }

    /// Walks the user stack of `pid` starting from `regs`, appending
    /// frames to `stack`. The stack may be partially filled on error.
    pub fn collect_stack(
        &self,
        table: &UnwindPageTable,
        mappings: &ProcessMappings,
        memory: &impl UserMemory,
        metrics: &mut SamplerMetrics,
        pid: u32,
        regs: RegisterTriple,
        stack: &mut Stack,
    ) -> Result<(), UnwindError> {
        let mut ctx = UnwindContext {
            pid,
            cfi: regs,
            framepointers: 0,
            error: None,
        };
        stack.clear();

        let mut result = None;
        for _ in 0..MAX_STACK_DEPTH {
            match self.step(table, mappings, memory, metrics, &mut ctx, stack) {
                StepResult::Continue => continue,
                StepResult::Finished => {
                    result = Some(Ok(()));
                    break;
                }
                StepResult::Failed => {
                    result = Some(Err(ctx.error.unwrap_or(UnwindError::RuleEvaluationFailed)));
                    break;
                }
            }
        }
        let result = result.unwrap_or_else(|| {
            // The step budget ran out with the walk still going.
            metrics.dwarf_too_many_frames += 1;
            Err(UnwindError::TooManyFrames)
        });

        let frames = stack.len() as u64;
        metrics.stack_frames_total += frames;
        metrics.stack_frames_fp += ctx.framepointers as u64;
        metrics.stack_frames_dwarf += frames.saturating_sub(ctx.framepointers as u64);
        result
    }

    fn step(
        &self,
        table: &UnwindPageTable,
        mappings: &ProcessMappings,
        memory: &impl UserMemory,
        metrics: &mut SamplerMetrics,
        ctx: &mut UnwindContext,
        stack: &mut Stack,
    ) -> StepResult {
        if !stack.push(ctx.cfi.ip) {
            metrics.dwarf_too_many_frames += 1;
            ctx.error = Some(UnwindError::TooManyFrames);
            return StepResult::Failed;
        }

        if self.config.stop_at_zero_bp && ctx.cfi.bp == 0 {
            log::trace!("reached bottom of the stack");
            return StepResult::Finished;
        }

        let rule = match self.locate_rule(table, mappings, metrics, ctx) {
            Some(rule) => rule,
            None => {
                // No usable rule for this pc: try to unwind one frame
                // using frame pointers.
                metrics.dwarf_no_rule_for_instruction += 1;
                log::trace!("failed to locate rule for {:#x}, trying fp", ctx.cfi.ip);
                return self.step_fp(memory, metrics, ctx);
            }
        };

        let next = match cfi::evaluate(&ctx.cfi, &rule, memory) {
            Ok(next) => next,
            Err(err) => {
                log::trace!("failed to evaluate CFI rule: {err}");
                metrics.dwarf_rule_evaluation_failed += 1;
                ctx.error = Some(UnwindError::RuleEvaluationFailed);
                return StepResult::Failed;
            }
        };
        ctx.cfi = next;

        if ctx.cfi.ip == STOP_IP {
            return StepResult::Finished;
        }
        StepResult::Continue
    }

    /// One frame-pointer step, per the canonical prologue stack layout:
    /// the return address sits at BP + 8, the caller's BP at BP, and the
    /// caller's SP right above the return address.
    fn step_fp(
        &self,
        memory: &impl UserMemory,
        metrics: &mut SamplerMetrics,
        ctx: &mut UnwindContext,
    ) -> StepResult {
        ctx.framepointers += 1;

        match cfi::read_return_address(memory, ctx.cfi.bp.wrapping_add(8)) {
            Ok(ra) => ctx.cfi.ip = ra,
            Err(_) => {
                metrics.fp_read_return_address_failures += 1;
                ctx.error = Some(UnwindError::RuleEvaluationFailed);
                return StepResult::Failed;
            }
        }

        // Restore SP as well to keep mixed DWARF and frame-pointer
        // unwinding consistent.
        ctx.cfi.sp = ctx.cfi.bp.wrapping_add(16);

        match memory.read_u64(ctx.cfi.bp) {
            Ok(prev_bp) => ctx.cfi.bp = prev_bp,
            Err(_) => {
                metrics.fp_read_base_pointer_failures += 1;
                ctx.error = Some(UnwindError::RuleEvaluationFailed);
                return StepResult::Failed;
            }
        }

        StepResult::Continue
    }

    fn locate_rule(
        &self,
        table: &UnwindPageTable,
        mappings: &ProcessMappings,
        metrics: &mut SamplerMetrics,
        ctx: &UnwindContext,
    ) -> Option<UnwindRule> {
        let ip = ctx.cfi.ip;

        let mapping = match mappings.locate(ctx.pid, ip) {
            Some(mapping) => mapping,
            None => {
                metrics.mapping_lookup_miss += 1;
                return None;
            }
        };

        if mapping.binary_id == INVALID_BINARY_ID {
            metrics.mapping_has_no_binary += 1;
            return None;
        }

        let pc = ip.wrapping_sub(mapping.file_offset as u64);
        match table.lookup(mapping.binary_id, pc) {
            Ok(rule) => Some(rule),
            Err(UnwindTableLookupError::NoRoot) => {
                metrics.mapping_without_root += 1;
                None
            }
            Err(err) => {
                log::trace!("unwind table lookup failed: {err}");
                metrics.unwind_table_lookup_failures += 1;
                None
            }
        }
    }
}
