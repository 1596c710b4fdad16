//! Evaluation of unwind rules against a register triple.

use thiserror::Error;

use crate::memory::{MemoryReadError, UserMemory};
use crate::unwind::rule::{CfaUnwindRule, UnwindRule, UnwindRuleKind, REG_RBP, REG_RSP};

/// Value of a register whose contents could not be recovered. Consuming
/// an unknown register fails the evaluation.
pub const UNKNOWN_REGISTER: u64 = 0xfffffffffffffffd;

/// The return address that marks the outermost frame.
pub const STOP_IP: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterTriple {
    pub sp: u64,
    pub bp: u64,
    pub ip: u64,
}

impl RegisterTriple {
    pub const UNKNOWN: RegisterTriple = RegisterTriple {
        sp: UNKNOWN_REGISTER,
        bp: UNKNOWN_REGISTER,
        ip: UNKNOWN_REGISTER,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CfiEvalError {
    #[error("unsupported CFA rule kind {0:?}")]
    UnsupportedCfaRule(UnwindRuleKind),

    #[error("unsupported CFA rule register {0}")]
    UnsupportedCfaRegister(u8),

    #[error("source register value is unknown")]
    UnknownRegister,

    #[error(transparent)]
    MemoryRead(#[from] MemoryReadError),
}

fn evaluate_cfa(prev: &RegisterTriple, rule: &CfaUnwindRule) -> Result<u64, CfiEvalError> {
    match rule.kind {
        UnwindRuleKind::RegisterOffset => {
            let base = match rule.regno {
                REG_RSP => prev.sp,
                REG_RBP => prev.bp,
                regno => return Err(CfiEvalError::UnsupportedCfaRegister(regno)),
            };
            if base == UNKNOWN_REGISTER {
                return Err(CfiEvalError::UnknownRegister);
            }
            Ok(base.wrapping_add(rule.offset as i64 as u64))
        }
        kind => Err(CfiEvalError::UnsupportedCfaRule(kind)),
    }
}

fn evaluate_rbp(
    prev: &RegisterTriple,
    next_sp: u64,
    rule: &UnwindRule,
    memory: &impl UserMemory,
) -> Result<u64, CfiEvalError> {
    if rule.rbp.is_undefined() {
        return Ok(prev.bp);
    }
    let address = next_sp.wrapping_add(rule.rbp.offset as i64 as u64);
    Ok(memory.read_u64(address)?)
}

/// Reads a return address and shifts it from the instruction after the
/// call back onto the call itself.
pub fn read_return_address(
    memory: &impl UserMemory,
    location: u64,
) -> Result<u64, MemoryReadError> {
    Ok(memory.read_u64(location)?.wrapping_sub(1))
}

/// Applies `rule` to the previous register triple, producing the caller's
/// triple. The return address is always recovered from the canonical slot
/// at CFA − 8.
pub fn evaluate(
    prev: &RegisterTriple,
    rule: &UnwindRule,
    memory: &impl UserMemory,
) -> Result<RegisterTriple, CfiEvalError> {
    let sp = evaluate_cfa(prev, &rule.cfa)?;
    let bp = evaluate_rbp(prev, sp, rule, memory)?;
    let ip = read_return_address(memory, sp.wrapping_sub(8))?;
    Ok(RegisterTriple { sp, bp, ip })
}
