//! Compact unwind rules consumed by the sampling-time unwinder.
//!
//! A rule covers one code range and describes how to recover the caller's
//! CFA and saved RBP; the return address is always read from the canonical
//! slot at CFA − 8. The richer rule vocabulary of the preprocessing
//! artifact (see [`crate::analysis`]) is packed down into this form when a
//! binary's table is loaded.

/// DWARF register numbering for the registers the evaluator understands.
pub const REG_RBP: u8 = 6;
pub const REG_RSP: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UnwindRuleKind {
    #[default]
    Unsupported = 0,
    CfaMinus8 = 1,
    CfaPlusOffset = 2,
    RegisterOffset = 3,
    RegisterDerefOffset = 4,
    PltSection = 5,
    Constant = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CfaUnwindRule {
    pub kind: UnwindRuleKind,
    pub regno: u8,
    pub offset: i32,
}

impl CfaUnwindRule {
    pub fn register_offset(regno: u8, offset: i32) -> Self {
        CfaUnwindRule {
            kind: UnwindRuleKind::RegisterOffset,
            regno,
            offset,
        }
    }
}

/// The saved RBP, when defined, lives at CFA + offset. The distinguished
/// offset value means "undefined, reuse the caller's RBP".
pub const RBP_RULE_UNDEFINED: i8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbpUnwindRule {
    pub offset: i8,
}

impl RbpUnwindRule {
    pub const UNDEFINED: RbpUnwindRule = RbpUnwindRule {
        offset: RBP_RULE_UNDEFINED,
    };

    pub fn at_cfa_offset(offset: i8) -> Self {
        RbpUnwindRule { offset }
    }

    pub fn is_undefined(self) -> bool {
        self.offset == RBP_RULE_UNDEFINED
    }
}

impl Default for RbpUnwindRule {
    fn default() -> Self {
        RbpUnwindRule::UNDEFINED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindRule {
    pub cfa: CfaUnwindRule,
    pub rbp: RbpUnwindRule,
}
