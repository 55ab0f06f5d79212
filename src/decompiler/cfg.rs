/// 制御フロー解析
/// 基本ブロックの構築と制御フローグラフ
///
/// 後続ブロックの並びの約束:
/// - if: [フォールスルー, 分岐先]（同じなら1つ）
/// - switch: [既定, ケース分岐先（キー順・重複除去）]
/// - goto: [分岐先]、return / throw: なし
/// 例外辺は `handlers` に別に持つ。

use crate::decompiler::insn::{Insn, InsnKind, Offset};
use crate::decompiler::loader::TryBlock;
use crate::decompiler::types::ArgType;
use crate::error::{DecompileError, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// 基本ブロックID（オフセット順の連番）
pub type BlockId = usize;

/// 辺の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Normal,
    Exception,
}

/// 基本ブロック
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub start_offset: Offset,
    pub insns: Vec<Insn>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
    /// 例外辺の行き先（ハンドラ入口）
    pub handlers: Vec<BlockId>,
    pub exception_preds: Vec<BlockId>,
}

impl BasicBlock {
    pub fn new(id: BlockId, start_offset: Offset) -> Self {
        Self {
            id,
            start_offset,
            insns: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            handlers: Vec::new(),
            exception_preds: Vec::new(),
        }
    }

    /// ブロック末尾の分岐命令
    pub fn terminator(&self) -> Option<&Insn> {
        self.insns.last().filter(|i| i.is_terminator())
    }

    /// 末尾の分岐命令を除いた文
    pub fn statements(&self) -> &[Insn] {
        match self.terminator() {
            Some(_) => &self.insns[..self.insns.len() - 1],
            None => &self.insns,
        }
    }

    /// メソッドを抜けるブロックか（return / throw）
    pub fn is_exit(&self) -> bool {
        matches!(
            self.terminator().map(|t| &t.kind),
            Some(InsnKind::Return) | Some(InsnKind::Throw)
        )
    }

    /// 条件分岐で終わるか
    pub fn ends_with_if(&self) -> bool {
        matches!(self.terminator().map(|t| &t.kind), Some(InsnKind::If { .. }))
    }

    /// ブロック先頭オフセット（文が空のときの注釈用）
    pub fn first_offset(&self) -> Offset {
        self.insns.first().map(|i| i.offset).unwrap_or(self.start_offset)
    }
}

/// 例外ハンドラ入口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerBlock {
    pub exception: Option<ArgType>,
    pub block: BlockId,
}

/// ブロック単位に変換した try 範囲
#[derive(Debug, Clone)]
pub struct TryRegion {
    pub start: Offset,
    pub end: Offset,
    pub handlers: Vec<HandlerBlock>,
    /// 範囲に含まれるブロック（昇順）
    pub covered: Vec<BlockId>,
}

/// 制御フローグラフ
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
    pub entry_block: BlockId,
    pub try_regions: Vec<TryRegion>,
}

impl ControlFlowGraph {
    /// 命令列から制御フローグラフを構築
    pub fn build(insns: Vec<Insn>, tries: &[TryBlock], code_len: Offset) -> Result<Self> {
        if insns.is_empty() {
            return Err(inconsistency!("method body has no instructions"));
        }

        // オフセット → 最初の命令インデックス
        let mut first_index: BTreeMap<Offset, usize> = BTreeMap::new();
        for (i, insn) in insns.iter().enumerate() {
            first_index.entry(insn.offset).or_insert(i);
        }
        let check_target = |target: Offset, from: Offset| -> Result<()> {
            if target >= code_len {
                return Err(inconsistency!(
                    "branch target 0x{:04x} at 0x{:04x} outside method",
                    target,
                    from
                ));
            }
            if !first_index.contains_key(&target) {
                return Err(inconsistency!(
                    "branch target 0x{:04x} at 0x{:04x} is not an instruction boundary",
                    target,
                    from
                ));
            }
            Ok(())
        };

        // リーダーの収集
        let mut leaders: BTreeSet<Offset> = BTreeSet::new();
        leaders.insert(insns[0].offset);
        for (i, insn) in insns.iter().enumerate() {
            for target in insn.branch_targets() {
                check_target(target, insn.offset)?;
                leaders.insert(target);
            }
            if insn.is_terminator() {
                if let Some(next) = insns.get(i + 1) {
                    leaders.insert(next.offset);
                }
            }
        }
        for t in tries {
            check_target(t.start, t.start)?;
            leaders.insert(t.start);
            if t.end < code_len {
                check_target(t.end, t.start)?;
                leaders.insert(t.end);
            }
            for h in &t.handlers {
                check_target(h.target, t.start)?;
                leaders.insert(h.target);
            }
        }

        // ブロック分割
        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut current = BasicBlock::new(0, insns[0].offset);
        for (i, insn) in insns.into_iter().enumerate() {
            let starts_block = leaders.contains(&insn.offset)
                && first_index.get(&insn.offset) == Some(&i)
                && !current.insns.is_empty();
            if starts_block {
                let next_id = blocks.len() + 1;
                let finished = std::mem::replace(&mut current, BasicBlock::new(next_id, insn.offset));
                blocks.push(finished);
            }
            current.insns.push(insn);
        }
        blocks.push(current);

        let block_of: BTreeMap<Offset, BlockId> =
            blocks.iter().map(|b| (b.start_offset, b.id)).collect();
        let lookup = |offset: Offset| -> Result<BlockId> {
            block_of
                .get(&offset)
                .copied()
                .ok_or_else(|| inconsistency!("no block starts at 0x{:04x}", offset))
        };

        // 通常辺
        // 末尾から落ちるブロックは、到達可能な場合だけエラーにする（ペイロード前の整列用 nop など）
        let count = blocks.len();
        let mut dangling: Vec<(BlockId, DecompileError)> = Vec::new();
        for b in 0..count {
            let next = if b + 1 < count { Some(b + 1) } else { None };
            let Some(last) = blocks[b].insns.last() else {
                continue;
            };
            let mut succs: Vec<BlockId> = Vec::new();
            match &last.kind {
                InsnKind::Goto { target } => succs.push(lookup(*target)?),
                InsnKind::If { target, .. } => {
                    match next {
                        Some(fall) => succs.push(fall),
                        None => dangling.push((
                            b,
                            inconsistency!("conditional branch at 0x{:04x} falls off the end", last.offset),
                        )),
                    }
                    succs.push(lookup(*target)?);
                }
                InsnKind::Switch {
                    targets, default, ..
                } => {
                    match default {
                        Some(d) => succs.push(lookup(*d)?),
                        None => match next {
                            Some(fall) => succs.push(fall),
                            None => dangling.push((
                                b,
                                inconsistency!("switch at 0x{:04x} falls off the end", last.offset),
                            )),
                        },
                    }
                    for t in targets {
                        succs.push(lookup(*t)?);
                    }
                }
                InsnKind::Return | InsnKind::Throw => {}
                _ => match next {
                    Some(fall) => succs.push(fall),
                    None => dangling.push((
                        b,
                        inconsistency!("execution falls off the end at 0x{:04x}", last.offset),
                    )),
                },
            }
            let mut seen = BTreeSet::new();
            succs.retain(|s| seen.insert(*s));
            blocks[b].successors = succs;
        }

        // 例外辺
        let mut try_regions = Vec::new();
        for t in tries {
            let covered: Vec<BlockId> = blocks
                .iter()
                .filter(|b| b.start_offset >= t.start && b.start_offset < t.end)
                .map(|b| b.id)
                .collect();
            let mut handlers = Vec::new();
            for h in &t.handlers {
                handlers.push(HandlerBlock {
                    exception: h.exception.clone(),
                    block: lookup(h.target)?,
                });
            }
            for &c in &covered {
                for h in &handlers {
                    if !blocks[c].handlers.contains(&h.block) {
                        blocks[c].handlers.push(h.block);
                    }
                }
            }
            try_regions.push(TryRegion {
                start: t.start,
                end: t.end,
                handlers,
                covered,
            });
        }

        let mut cfg = ControlFlowGraph {
            blocks,
            entry_block: 0,
            try_regions,
        };
        let reachable = cfg.reachable_blocks();
        if let Some((_, err)) = dangling.into_iter().find(|(b, _)| reachable[*b]) {
            return Err(err);
        }
        cfg.prune_unreachable();
        cfg.rebuild_predecessors();

        debug!(
            "Built CFG: {} blocks, {} try regions",
            cfg.blocks.len(),
            cfg.try_regions.len()
        );
        Ok(cfg)
    }

    /// エントリから通常辺・例外辺で到達できるブロック
    fn reachable_blocks(&self) -> Vec<bool> {
        let mut reachable = vec![false; self.blocks.len()];
        let mut queue = VecDeque::from([self.entry_block]);
        reachable[self.entry_block] = true;
        while let Some(b) = queue.pop_front() {
            let block = &self.blocks[b];
            for &s in block.successors.iter().chain(block.handlers.iter()) {
                if !reachable[s] {
                    reachable[s] = true;
                    queue.push_back(s);
                }
            }
        }
        reachable
    }

    /// 到達不能ブロックを除去し、IDを詰め直す
    fn prune_unreachable(&mut self) {
        let n = self.blocks.len();
        let reachable = self.reachable_blocks();
        if reachable.iter().all(|&r| r) {
            return;
        }

        let mut remap = vec![None; n];
        let mut next = 0;
        for (old, &keep) in reachable.iter().enumerate() {
            if keep {
                remap[old] = Some(next);
                next += 1;
            }
        }
        debug!("Pruned {} unreachable blocks", n - next);

        let map_list = |list: &[BlockId]| -> Vec<BlockId> {
            list.iter().filter_map(|&b| remap[b]).collect()
        };
        let old_blocks = std::mem::take(&mut self.blocks);
        for (old, mut block) in old_blocks.into_iter().enumerate() {
            let Some(id) = remap[old] else { continue };
            block.id = id;
            block.successors = map_list(&block.successors);
            block.handlers = map_list(&block.handlers);
            self.blocks.push(block);
        }

        for region in &mut self.try_regions {
            region.covered = map_list(&region.covered);
            region.handlers.retain_mut(|h| match remap[h.block] {
                Some(id) => {
                    h.block = id;
                    true
                }
                None => false,
            });
        }
        self.try_regions
            .retain(|r| !r.covered.is_empty() && !r.handlers.is_empty());
        self.entry_block = remap[self.entry_block].unwrap_or(0);
    }

    fn rebuild_predecessors(&mut self) {
        for block in &mut self.blocks {
            block.predecessors.clear();
            block.exception_preds.clear();
        }
        for b in 0..self.blocks.len() {
            let succs = self.blocks[b].successors.clone();
            for s in succs {
                self.blocks[s].predecessors.push(b);
            }
            let handlers = self.blocks[b].handlers.clone();
            for h in handlers {
                self.blocks[h].exception_preds.push(b);
            }
        }
    }

    /// エントリブロックを取得
    pub fn entry(&self) -> Option<&BasicBlock> {
        self.blocks.get(self.entry_block)
    }

    /// ブロック数を取得
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// 種類付きの後続（通常辺 → 例外辺の順）
    pub fn successors_with_kind(&self, block: BlockId) -> Vec<(BlockId, EdgeKind)> {
        let b = &self.blocks[block];
        b.successors
            .iter()
            .map(|&s| (s, EdgeKind::Normal))
            .chain(b.handlers.iter().map(|&h| (h, EdgeKind::Exception)))
            .collect()
    }

    /// 指定オフセットで始まるブロック
    pub fn block_at_offset(&self, offset: Offset) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|b| b.start_offset == offset)
            .map(|b| b.id)
    }

    /// ハンドラ入口ブロックか
    pub fn is_handler_entry(&self, block: BlockId) -> bool {
        !self.blocks[block].exception_preds.is_empty()
    }
}

impl std::fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Control Flow Graph:")?;
        writeln!(f, "  Entry Block: {}", self.entry_block)?;
        writeln!(f, "  Block Count: {}", self.block_count())?;
        for block in &self.blocks {
            writeln!(
                f,
                "  Block {} @0x{:04x}: succs={:?} handlers={:?}",
                block.id, block.start_offset, block.successors, block.handlers
            )?;
            for insn in &block.insns {
                writeln!(f, "    0x{:04x}: {}", insn.offset, insn)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::insn::{CmpOp, InsnArg, RegisterArg};
    use crate::decompiler::loader::CatchHandler;

    fn insn(kind: InsnKind, offset: Offset) -> Insn {
        Insn::new(kind, vec![], None, offset)
    }

    fn const_insn(reg: u16, offset: Offset) -> Insn {
        Insn::new(
            InsnKind::Const,
            vec![InsnArg::lit(1, ArgType::Int)],
            Some(RegisterArg::new(reg)),
            offset,
        )
    }

    fn diamond() -> Vec<Insn> {
        vec![
            Insn::new(
                InsnKind::If {
                    op: CmpOp::Eq,
                    target: 3,
                },
                vec![InsnArg::reg(0)],
                None,
                0,
            ),
            const_insn(1, 1),
            insn(InsnKind::Goto { target: 4 }, 2),
            const_insn(1, 3),
            insn(InsnKind::Return, 4),
        ]
    }

    #[test]
    fn test_build_diamond() {
        let cfg = ControlFlowGraph::build(diamond(), &[], 5).unwrap();
        assert_eq!(cfg.block_count(), 4);
        assert_eq!(cfg.blocks[0].successors, vec![1, 2]);
        assert_eq!(cfg.blocks[1].successors, vec![3]);
        assert_eq!(cfg.blocks[2].successors, vec![3]);
        assert_eq!(cfg.blocks[3].predecessors, vec![1, 2]);
        assert!(cfg.blocks[3].is_exit());
    }

    #[test]
    fn test_branch_outside_method_is_inconsistency() {
        let insns = vec![insn(InsnKind::Goto { target: 40 }, 0)];
        let err = ControlFlowGraph::build(insns, &[], 1).unwrap_err();
        assert!(err.is_inconsistency());
    }

    #[test]
    fn test_unreachable_blocks_pruned() {
        let insns = vec![
            insn(InsnKind::Return, 0),
            const_insn(0, 1),
            insn(InsnKind::Return, 2),
        ];
        let cfg = ControlFlowGraph::build(insns, &[], 3).unwrap();
        assert_eq!(cfg.block_count(), 1);
    }

    #[test]
    fn test_trailing_padding_nop_is_pruned() {
        // ペイロード前の整列用 nop は return の後ろにあり、どこからも到達しない
        let insns = vec![
            const_insn(0, 0),
            insn(InsnKind::Return, 1),
            insn(InsnKind::Nop, 2),
        ];
        let cfg = ControlFlowGraph::build(insns, &[], 3).unwrap();
        assert_eq!(cfg.block_count(), 1);
        assert!(cfg.blocks[0].is_exit());
    }

    #[test]
    fn test_reachable_fall_off_end_is_inconsistency() {
        let insns = vec![const_insn(0, 0), insn(InsnKind::Nop, 1)];
        let err = ControlFlowGraph::build(insns, &[], 2).unwrap_err();
        assert!(err.is_inconsistency());
    }

    #[test]
    fn test_exception_edges() {
        let insns = vec![
            const_insn(0, 0),
            insn(InsnKind::Return, 1),
            Insn::new(
                InsnKind::MoveException(None),
                vec![],
                Some(RegisterArg::new(1)),
                2,
            ),
            insn(InsnKind::Return, 3),
        ];
        let tries = vec![TryBlock {
            start: 0,
            end: 2,
            handlers: vec![CatchHandler {
                exception: None,
                target: 2,
            }],
        }];
        let cfg = ControlFlowGraph::build(insns, &tries, 4).unwrap();
        assert_eq!(cfg.blocks[0].handlers, vec![1]);
        assert!(cfg.is_handler_entry(1));
        assert_eq!(cfg.try_regions[0].covered, vec![0]);
        assert_eq!(
            cfg.successors_with_kind(0),
            vec![(1, EdgeKind::Exception)]
        );
    }
}
