//! Paged unwind tables.
//!
//! A binary's unwind rules are laid out as a three-level trie of
//! fixed-size pages keyed by bit-slices of the binary-relative pc, with
//! rule rows stored in linked leaves of 256 entries. The shape exists for
//! the restricted sampling runtime: descents have a fixed depth, the leaf
//! search is a fixed-iteration bisect, and pages live in parts of at most
//! 16384 entries to satisfy allocation limits.

use thiserror::Error;

use crate::binary::{BinaryId, MAX_BINARIES};
use crate::fast_hash_map::FastHashMap;
use crate::unwind::rule::UnwindRule;

pub type PageId = u32;

pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Serialized size of one page, header plus payload.
pub const UNWIND_TABLE_PAGE_SIZE: usize = 4128;
pub const UNWIND_TABLE_PAGE_HEADER_SIZE: usize = 32;

pub const UNWIND_PAGE_TABLE_DEPTH: usize = 3;
pub const UNWIND_PAGE_TABLE_LEVEL_WIDTHS: [u32; UNWIND_PAGE_TABLE_DEPTH] = [10, 10, 9];
pub const UNWIND_PAGE_TABLE_LEAF_WIDTH: u32 = 8;

pub const LEAF_CAPACITY: usize = 1 << UNWIND_PAGE_TABLE_LEAF_WIDTH;
pub const NODE_CHILDREN: usize = 1 << UNWIND_PAGE_TABLE_LEVEL_WIDTHS[0];

pub const PAGES_PER_PART: usize = 1 << 14;
pub const MAX_UNWIND_TABLE_PAGES: usize = 1024 * 1024;

/// Leaf search is a fixed-iteration bisect so that the loop bound is
/// statically known; 8 iterations cover the 256-entry capacity.
pub const LEAF_BISECT_ITERATIONS: u32 = 8;

#[derive(Clone)]
pub struct LeafPage {
    pub length: u32,
    pub pc: [u32; LEAF_CAPACITY],
    pub ranges: [u32; LEAF_CAPACITY],
    pub rules: [UnwindRule; LEAF_CAPACITY],
}

impl Default for LeafPage {
    fn default() -> Self {
        LeafPage {
            length: 0,
            pc: [0; LEAF_CAPACITY],
            ranges: [0; LEAF_CAPACITY],
            rules: [UnwindRule::default(); LEAF_CAPACITY],
        }
    }
}

#[derive(Clone)]
pub struct NodePage {
    pub children: [PageId; NODE_CHILDREN],
}

impl Default for NodePage {
    fn default() -> Self {
        NodePage {
            children: [INVALID_PAGE_ID; NODE_CHILDREN],
        }
    }
}

#[derive(Clone, Default)]
pub enum PageKind {
    #[default]
    Empty,
    Leaf(Box<LeafPage>),
    Node(Box<NodePage>),
}

#[derive(Clone, Default)]
pub struct UnwindTablePage {
    pub id: PageId,
    pub begin_address: u64,
    pub end_address: u64,
    pub next_page: PageId,
    pub kind: PageKind,
}

/// One row of a binary's unwind table: a code range and the rule that
/// unwinds out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindRow {
    pub start_pc: u64,
    pub pc_range: u32,
    pub rule: UnwindRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UnwindTableLookupError {
    #[error("no unwind table root for the binary")]
    NoRoot,

    #[error("referenced page does not exist")]
    UnknownPage,

    #[error("page id does not match its slot")]
    PageIdMismatch,

    #[error("unexpected page type")]
    UnexpectedPageType,

    #[error("no rule covers the instruction")]
    NoRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnwindTableBuildError {
    #[error("unwind rows must be sorted by start_pc")]
    UnsortedRows,

    #[error("row pc {0:#x} does not fit the 32-bit leaf pc column")]
    PcOutOfRange(u64),

    #[error("unwind table pages exhausted ({0} pages)")]
    TooManyPages(usize),

    #[error("too many binaries")]
    TooManyBinaries,
}

/// Process-wide store of unwind-table pages for all registered binaries.
#[derive(Default)]
pub struct UnwindPageTable {
    parts: Vec<Vec<UnwindTablePage>>,
    page_count: usize,
    roots: FastHashMap<BinaryId, PageId>,
}

impl UnwindPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn root(&self, binary: BinaryId) -> Option<PageId> {
        self.roots.get(&binary).copied()
    }

    /// Lays out the sorted rule rows of one binary as linked leaves plus
    /// a three-level node trie, and registers the root page.
    pub fn add_binary(
        &mut self,
        binary: BinaryId,
        rows: &[UnwindRow],
    ) -> Result<PageId, UnwindTableBuildError> {
        if self.roots.len() >= MAX_BINARIES {
            return Err(UnwindTableBuildError::TooManyBinaries);
        }
        if rows.windows(2).any(|pair| pair[0].start_pc > pair[1].start_pc) {
            return Err(UnwindTableBuildError::UnsortedRows);
        }

        let mut leaves = Vec::new();
        for chunk in rows.chunks(LEAF_CAPACITY) {
            let id = self.allocate_page()?;
            leaves.push((id, chunk));
        }

        for (i, (id, chunk)) in leaves.iter().enumerate() {
            let mut leaf = Box::new(LeafPage {
                length: chunk.len() as u32,
                ..Default::default()
            });
            for (j, row) in chunk.iter().enumerate() {
                let pc = u32::try_from(row.start_pc)
                    .map_err(|_| UnwindTableBuildError::PcOutOfRange(row.start_pc))?;
                leaf.pc[j] = pc;
                leaf.ranges[j] = row.pc_range;
                leaf.rules[j] = row.rule;
            }

            let begin_address = chunk.first().map_or(0, |row| row.start_pc);
            // A leaf ends where the next one begins; the last leaf ends at
            // its last row's exclusive end.
            let (end_address, next_page) = match leaves.get(i + 1) {
                Some((next_id, next_chunk)) => (next_chunk[0].start_pc, *next_id),
                None => (
                    chunk
                        .last()
                        .map_or(0, |row| row.start_pc + row.pc_range as u64),
                    INVALID_PAGE_ID,
                ),
            };

            *self.page_mut(*id) = UnwindTablePage {
                id: *id,
                begin_address,
                end_address,
                next_page,
                kind: PageKind::Leaf(leaf),
            };
        }

        let root = self.build_trie(&leaves)?;
        self.roots.insert(binary, root);
        Ok(root)
    }

    /// Returns the unwind rule covering the binary-relative `pc`.
    pub fn lookup(
        &self,
        binary: BinaryId,
        pc: u64,
    ) -> Result<UnwindRule, UnwindTableLookupError> {
        let root = self.root(binary).ok_or(UnwindTableLookupError::NoRoot)?;
        self.lookup_fast(root, pc)
    }

    pub fn lookup_fast(
        &self,
        root: PageId,
        pc: u64,
    ) -> Result<UnwindRule, UnwindTableLookupError> {
        let leaf = self.lookup_page(root, pc)?;
        locate_rule(leaf, pc).ok_or(UnwindTableLookupError::NoRule)
    }

    fn lookup_page(&self, root: PageId, pc: u64) -> Result<&LeafPage, UnwindTableLookupError> {
        let slices = [(pc >> 28) & 1023, (pc >> 18) & 1023, (pc >> 8) & 1023];

        let mut page_id = root;
        for slice in slices {
            let page = self
                .page(page_id)
                .ok_or(UnwindTableLookupError::UnknownPage)?;
            if page.id != page_id {
                log::trace!("unexpected page id: {} vs {}", page.id, page_id);
                return Err(UnwindTableLookupError::PageIdMismatch);
            }
            let node = match &page.kind {
                PageKind::Node(node) => node,
                _ => return Err(UnwindTableLookupError::UnexpectedPageType),
            };
            page_id = node.children[slice as usize];
        }

        let mut page = self
            .page(page_id)
            .ok_or(UnwindTableLookupError::UnknownPage)?;
        if !matches!(page.kind, PageKind::Leaf(_)) {
            return Err(UnwindTableLookupError::UnexpectedPageType);
        }

        // A pc at or past this leaf's exclusive end may still be covered
        // by the adjacent leaf; hop once.
        if page.end_address <= pc {
            log::trace!("trying next page {}", page.next_page);
            page = self
                .page(page.next_page)
                .ok_or(UnwindTableLookupError::UnknownPage)?;
            if !matches!(page.kind, PageKind::Leaf(_)) {
                return Err(UnwindTableLookupError::UnexpectedPageType);
            }
        }

        match &page.kind {
            PageKind::Leaf(leaf) => Ok(leaf),
            _ => Err(UnwindTableLookupError::UnexpectedPageType),
        }
    }

    fn page(&self, id: PageId) -> Option<&UnwindTablePage> {
        let part = (id as usize) / PAGES_PER_PART;
        let index = (id as usize) % PAGES_PER_PART;
        self.parts.get(part)?.get(index)
    }

    fn page_mut(&mut self, id: PageId) -> &mut UnwindTablePage {
        let part = (id as usize) / PAGES_PER_PART;
        let index = (id as usize) % PAGES_PER_PART;
        &mut self.parts[part][index]
    }

    fn allocate_page(&mut self) -> Result<PageId, UnwindTableBuildError> {
        if self.page_count >= MAX_UNWIND_TABLE_PAGES {
            return Err(UnwindTableBuildError::TooManyPages(self.page_count));
        }
        let id = self.page_count as PageId;
        let part = self.page_count / PAGES_PER_PART;
        if self.parts.len() <= part {
            self.parts.push(Vec::new());
        }
        self.parts[part].push(UnwindTablePage {
            id,
            ..Default::default()
        });
        self.page_count += 1;
        Ok(id)
    }

    fn build_trie(
        &mut self,
        leaves: &[(PageId, &[UnwindRow])],
    ) -> Result<PageId, UnwindTableBuildError> {
        let root = self.allocate_node()?;

        // The trie resolves pc down to 256-byte granules: the three
        // slices consume bits 8 and up, so each granule maps to exactly
        // one leaf. When a leaf boundary falls inside a granule, the
        // earlier leaf wins and the lookup's next-page hop covers the
        // tail; a full leaf always spans at least one granule, so one hop
        // is enough.
        for (i, (leaf_id, chunk)) in leaves.iter().enumerate() {
            if chunk.is_empty() {
                continue;
            }
            let begin = chunk[0].start_pc;
            let end = match leaves.get(i + 1) {
                Some((_, next_chunk)) => next_chunk[0].start_pc,
                None => {
                    let last = chunk[chunk.len() - 1];
                    last.start_pc + last.pc_range as u64
                }
            };
            if end <= begin {
                continue;
            }

            for granule in (begin >> 8)..=((end - 1) >> 8) {
                self.map_granule(root, granule, *leaf_id)?;
            }
        }

        Ok(root)
    }

    fn map_granule(
        &mut self,
        root: PageId,
        granule: u64,
        leaf: PageId,
    ) -> Result<(), UnwindTableBuildError> {
        let slices = [
            ((granule >> 20) & 1023) as usize,
            ((granule >> 10) & 1023) as usize,
            (granule & 1023) as usize,
        ];

        let mut node_id = root;
        for slice in &slices[..UNWIND_PAGE_TABLE_DEPTH - 1] {
            let child = match &self.page_mut(node_id).kind {
                PageKind::Node(node) => node.children[*slice],
                _ => INVALID_PAGE_ID,
            };
            let child = if child == INVALID_PAGE_ID {
                let new_node = self.allocate_node()?;
                match &mut self.page_mut(node_id).kind {
                    PageKind::Node(node) => node.children[*slice] = new_node,
                    _ => {}
                }
                new_node
            } else {
                child
            };
            node_id = child;
        }

        if let PageKind::Node(node) = &mut self.page_mut(node_id).kind {
            // First writer wins: granules straddling a leaf boundary stay
            // with the earlier leaf.
            if node.children[slices[2]] == INVALID_PAGE_ID {
                node.children[slices[2]] = leaf;
            }
        }
        Ok(())
    }

    fn allocate_node(&mut self) -> Result<PageId, UnwindTableBuildError> {
        let id = self.allocate_page()?;
        let page = self.page_mut(id);
        page.kind = PageKind::Node(Box::default());
        Ok(id)
    }
}

/// Bisects the leaf for `pc`. The loop runs a fixed number of iterations
/// regardless of the leaf's fill level.
pub fn locate_rule(leaf: &LeafPage, pc: u64) -> Option<UnwindRule> {
    let mut l: u32 = 0;
    let mut r: u32 = leaf.length;

    for _ in 0..LEAF_BISECT_ITERATIONS {
        let m = (r + l) / 2;
        if m >= LEAF_CAPACITY as u32 {
            return None;
        }
        let mpc = leaf.pc[m as usize] as u64;
        if mpc <= pc {
            l = m;
        } else {
            r = m;
        }
    }

    if l >= leaf.length {
        return None;
    }

    let entry_pc = leaf.pc[l as usize] as u64;
    let entry_range = leaf.ranges[l as usize] as u64;
    if pc < entry_pc || pc >= entry_pc + entry_range {
        return None;
    }

    Some(leaf.rules[l as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::rule::{CfaUnwindRule, RbpUnwindRule, REG_RSP};

    fn rule(offset: i32) -> UnwindRule {
        UnwindRule {
            cfa: CfaUnwindRule::register_offset(REG_RSP, offset),
            rbp: RbpUnwindRule::UNDEFINED,
        }
    }

    fn row(start_pc: u64, pc_range: u32, offset: i32) -> UnwindRow {
        UnwindRow {
            start_pc,
            pc_range,
            rule: rule(offset),
        }
    }

    fn single_leaf_table() -> (UnwindPageTable, BinaryId) {
        let mut table = UnwindPageTable::new();
        table
            .add_binary(
                7,
                &[row(0x1000, 0x10, 8), row(0x1010, 0x20, 16), row(0x1040, 0x8, 24)],
            )
            .unwrap();
        (table, 7)
    }

    #[test]
    fn page_size_constants_are_consistent() {
        assert_eq!(UNWIND_TABLE_PAGE_SIZE, 4128);
        // A node's children array fills the page payload exactly.
        assert_eq!(
            NODE_CHILDREN * std::mem::size_of::<PageId>() + UNWIND_TABLE_PAGE_HEADER_SIZE,
            UNWIND_TABLE_PAGE_SIZE
        );
        // The leaf payload must fit the same budget: length + pc column +
        // range column + 7 packed bytes per rule.
        let leaf_payload = 4 + LEAF_CAPACITY * 4 + LEAF_CAPACITY * 4 + LEAF_CAPACITY * 7;
        assert!(leaf_payload + UNWIND_TABLE_PAGE_HEADER_SIZE <= UNWIND_TABLE_PAGE_SIZE);
    }

    #[test]
    fn lookup_hits_the_covering_entry() {
        let (table, binary) = single_leaf_table();
        assert_eq!(table.lookup(binary, 0x1015).unwrap(), rule(16));
    }

    #[test]
    fn lookup_past_the_last_range_misses() {
        let (table, binary) = single_leaf_table();
        assert_eq!(
            table.lookup(binary, 0x1048),
            Err(UnwindTableLookupError::NoRule)
        );
    }

    #[test]
    fn boundary_pcs_resolve_to_the_right_entry() {
        let (table, binary) = single_leaf_table();

        // A pc exactly at an entry's start hits that entry.
        assert_eq!(table.lookup(binary, 0x1000).unwrap(), rule(8));
        assert_eq!(table.lookup(binary, 0x1040).unwrap(), rule(24));

        // A pc exactly at an entry's exclusive end hits the next entry,
        // or misses in a gap.
        assert_eq!(table.lookup(binary, 0x1010).unwrap(), rule(16));
        assert_eq!(
            table.lookup(binary, 0x1030),
            Err(UnwindTableLookupError::NoRule)
        );
    }

    #[test]
    fn single_entry_leaf_is_searchable() {
        let mut table = UnwindPageTable::new();
        table.add_binary(1, &[row(0x2000, 0x100, 8)]).unwrap();

        assert_eq!(table.lookup(1, 0x2000).unwrap(), rule(8));
        assert_eq!(table.lookup(1, 0x20ff).unwrap(), rule(8));
        assert_eq!(table.lookup(1, 0x2100), Err(UnwindTableLookupError::NoRule));
        assert_eq!(table.lookup(1, 0x1fff), Err(UnwindTableLookupError::NoRule));
    }

    #[test]
    fn unknown_binary_has_no_root() {
        let (table, _) = single_leaf_table();
        assert_eq!(
            table.lookup(999, 0x1000),
            Err(UnwindTableLookupError::NoRoot)
        );
    }

    #[test]
    fn multi_leaf_tables_follow_the_next_page_link() {
        // 300 contiguous rows. The first row is 6 bytes long so that the
        // first leaf's end (0x1000 + 6 + 255 * 10 = 0x19fc) falls inside a
        // 256-byte granule owned by that leaf; pcs in [0x19fc, 0x1a00)
        // resolve through the next-page hop.
        let mut rows = vec![row(0x1000, 6, 0)];
        rows.extend((1..300).map(|i| row(0x1006 + (i - 1) * 10, 10, i as i32)));

        let mut table = UnwindPageTable::new();
        table.add_binary(1, &rows).unwrap();

        // Leaf 0 proper.
        assert_eq!(table.lookup(1, 0x1000).unwrap(), rule(0));
        assert_eq!(table.lookup(1, 0x19f5).unwrap(), rule(255));
        // Past leaf 0's end, same granule: requires the hop.
        assert_eq!(table.lookup(1, 0x19fc).unwrap(), rule(256));
        assert_eq!(table.lookup(1, 0x19ff).unwrap(), rule(256));
        // Deep into leaf 1 through its own granules.
        let last = 0x1006 + 298 * 10;
        assert_eq!(table.lookup(1, last).unwrap(), rule(299));
        assert_eq!(
            table.lookup(1, last + 10),
            Err(UnwindTableLookupError::NoRule)
        );
    }

    #[test]
    fn unsorted_rows_are_rejected() {
        let mut table = UnwindPageTable::new();
        let result = table.add_binary(1, &[row(0x2000, 8, 0), row(0x1000, 8, 0)]);
        assert_eq!(result, Err(UnwindTableBuildError::UnsortedRows));
    }
}
