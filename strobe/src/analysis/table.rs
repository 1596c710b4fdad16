//! Unwind-table encoding: rule dictionary, delta encoding, and packing
//! into the sampling-time rule format.

use prost::Message;
use thiserror::Error;

use crate::analysis::proto::{self, unwind_rule::Kind};
use crate::fast_hash_map::FastHashMap;
use crate::unwind::page_table::UnwindRow;
use crate::unwind::rule::{
    CfaUnwindRule, RbpUnwindRule, UnwindRule as PackedRule, UnwindRuleKind,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnwindTableError {
    #[error("unwind table columns have mismatched lengths")]
    MismatchedColumns,

    #[error("row {row} starts at {start_pc:#x}, before the previous row's end {prev_end:#x}")]
    OverlappingRows {
        row: usize,
        start_pc: u64,
        prev_end: u64,
    },

    #[error("rule index {0} is out of the dictionary")]
    BadRuleIndex(u32),

    #[error("row {0} has a pc range that does not fit 32 bits")]
    RangeTooWide(usize),
}

fn check_columns(table: &proto::UnwindTable) -> Result<(), UnwindTableError> {
    let len = table.start_pc.len();
    if table.pc_range.len() != len
        || table.cfa.len() != len
        || table.rbp.len() != len
        || table.ra.len() != len
    {
        return Err(UnwindTableError::MismatchedColumns);
    }
    Ok(())
}

/// Delta-encodes `start_pc` against the end of the previous row. Rows
/// whose end equals the next row's start are tolerated; overlap is not.
pub fn differentiate_unwind_table(table: &mut proto::UnwindTable) -> Result<(), UnwindTableError> {
    check_columns(table)?;

    let mut pc = 0u64;
    for i in 0..table.start_pc.len() {
        let start_pc = table.start_pc[i];
        let pc_range = table.pc_range[i];
        if start_pc < pc {
            return Err(UnwindTableError::OverlappingRows {
                row: i,
                start_pc,
                prev_end: pc,
            });
        }
        table.start_pc[i] = start_pc - pc;
        pc = start_pc + pc_range;
    }
    Ok(())
}

/// Inverse of [`differentiate_unwind_table`].
pub fn integrate_unwind_table(table: &mut proto::UnwindTable) -> Result<(), UnwindTableError> {
    check_columns(table)?;

    let mut pc = 0u64;
    for i in 0..table.start_pc.len() {
        table.start_pc[i] += pc;
        pc = table.start_pc[i] + table.pc_range[i];
    }
    Ok(())
}

/// Sorts the rows by `start_pc` and delta-encodes them for transmission.
pub fn delta_encode(table: &mut proto::UnwindTable) -> Result<(), UnwindTableError> {
    check_columns(table)?;

    let mut permutation: Vec<usize> = (0..table.start_pc.len()).collect();
    permutation.sort_by_key(|&i| table.start_pc[i]);
    apply_permutation(&mut table.start_pc, &permutation);
    apply_permutation(&mut table.pc_range, &permutation);
    apply_permutation(&mut table.cfa, &permutation);
    apply_permutation(&mut table.rbp, &permutation);
    apply_permutation(&mut table.ra, &permutation);

    differentiate_unwind_table(table)
}

fn apply_permutation<T: Copy>(values: &mut [T], permutation: &[usize]) {
    let reordered: Vec<T> = permutation.iter().map(|&i| values[i]).collect();
    values.copy_from_slice(&reordered);
}

/// Deduplicating rule dictionary builder. `finish` renumbers the rules
/// most-used-first, which keeps the hot dictionary prefix small.
#[derive(Default)]
pub struct RuleDictBuilder {
    ids: FastHashMap<Vec<u8>, RuleInfo>,
    rules: Vec<proto::UnwindRule>,
}

struct RuleInfo {
    id: u32,
    use_count: u32,
}

pub struct RuleDict {
    mapping: Vec<u32>,
    rules: Vec<proto::UnwindRule>,
}

impl RuleDictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: proto::UnwindRule) -> u32 {
        let serialized = rule.encode_to_vec();
        if let Some(info) = self.ids.get_mut(&serialized) {
            info.use_count += 1;
            return info.id;
        }

        let id = self.rules.len() as u32;
        self.rules.push(rule);
        self.ids.insert(
            serialized,
            RuleInfo {
                id,
                use_count: 1,
            },
        );
        id
    }

    pub fn finish(self) -> RuleDict {
        let mut infos: Vec<RuleInfo> = self.ids.into_values().collect();
        infos.sort_by_key(|info| std::cmp::Reverse(info.use_count));

        let mut mapping = vec![0u32; infos.len()];
        let mut rules = vec![proto::UnwindRule::default(); infos.len()];
        for (i, info) in infos.iter().enumerate() {
            mapping[info.id as usize] = i as u32;
            rules[i] = self.rules[info.id as usize].clone();
        }

        RuleDict { mapping, rules }
    }
}

impl RuleDict {
    pub fn remap_rule(&self, id: u32) -> u32 {
        self.mapping[id as usize]
    }

    pub fn remap_rules(&self, rules: &mut [u32]) {
        for rule in rules {
            *rule = self.remap_rule(*rule);
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[proto::UnwindRule] {
        &self.rules
    }

    pub fn into_rules(self) -> Vec<proto::UnwindRule> {
        self.rules
    }
}

fn pack_cfa(rule: &proto::UnwindRule) -> CfaUnwindRule {
    match &rule.kind {
        Some(Kind::CfaMinus8(_)) => CfaUnwindRule {
            kind: UnwindRuleKind::CfaMinus8,
            regno: 0,
            offset: -8,
        },
        Some(Kind::CfaPlusOffset(cfa)) => CfaUnwindRule {
            kind: UnwindRuleKind::CfaPlusOffset,
            regno: 0,
            offset: cfa.offset as i32,
        },
        Some(Kind::RegisterOffset(reg)) => CfaUnwindRule {
            kind: UnwindRuleKind::RegisterOffset,
            regno: reg.register as u8,
            offset: reg.offset as i32,
        },
        Some(Kind::RegisterDerefOffset(reg)) => CfaUnwindRule {
            kind: UnwindRuleKind::RegisterDerefOffset,
            regno: reg.register as u8,
            offset: reg.offset as i32,
        },
        Some(Kind::PltSection(_)) => CfaUnwindRule {
            kind: UnwindRuleKind::PltSection,
            regno: 0,
            offset: 0,
        },
        Some(Kind::Constant(constant)) => CfaUnwindRule {
            kind: UnwindRuleKind::Constant,
            regno: 0,
            offset: constant.value as i32,
        },
        Some(Kind::Unsupported(_)) | None => CfaUnwindRule::default(),
    }
}

fn pack_rbp(rule: &proto::UnwindRule) -> RbpUnwindRule {
    match &rule.kind {
        Some(Kind::CfaMinus8(_)) => RbpUnwindRule::at_cfa_offset(-8),
        Some(Kind::CfaPlusOffset(cfa)) => match i8::try_from(cfa.offset) {
            Ok(offset) => RbpUnwindRule::at_cfa_offset(offset),
            Err(_) => RbpUnwindRule::UNDEFINED,
        },
        _ => RbpUnwindRule::UNDEFINED,
    }
}

fn ra_is_canonical(rule: &proto::UnwindRule) -> bool {
    matches!(rule.kind, Some(Kind::CfaMinus8(_)))
}

/// Converts an integrated unwind table into the packed rows the paged
/// table is built from. Rows whose return address is not in the canonical
/// slot pack into an unsupported rule, which makes the unwinder fall back
/// to frame pointers for that range.
pub fn build_unwind_rows(table: &proto::UnwindTable) -> Result<Vec<UnwindRow>, UnwindTableError> {
    check_columns(table)?;

    let rule_at = |index: u32| -> Result<&proto::UnwindRule, UnwindTableError> {
        table
            .dict
            .get(index as usize)
            .ok_or(UnwindTableError::BadRuleIndex(index))
    };

    let mut rows = Vec::with_capacity(table.start_pc.len());
    for i in 0..table.start_pc.len() {
        let cfa = rule_at(table.cfa[i])?;
        let rbp = rule_at(table.rbp[i])?;
        let ra = rule_at(table.ra[i])?;

        let rule = if ra_is_canonical(ra) {
            PackedRule {
                cfa: pack_cfa(cfa),
                rbp: pack_rbp(rbp),
            }
        } else {
            PackedRule::default()
        };

        let pc_range = u32::try_from(table.pc_range[i])
            .map_err(|_| UnwindTableError::RangeTooWide(i))?;
        rows.push(UnwindRow {
            start_pc: table.start_pc[i],
            pc_range,
            rule,
        });
    }
    Ok(rows)
}
