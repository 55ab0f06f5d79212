/// 支配木とループ検出
///
/// 支配木は通常辺と例外辺の両方、後支配木は通常辺のみ（仮想出口ノード付き）で計算する。
/// どちらも petgraph の simple_fast（Cooper-Harvey-Kennedy）を使う。

use crate::decompiler::cfg::{BlockId, ControlFlowGraph};
use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::BTreeSet;
use tracing::debug;

/// ループ情報
#[derive(Debug, Clone)]
pub struct LoopInfo {
    /// ループヘッダー（バックエッジの行き先）
    pub header: BlockId,
    /// ループ本体（ヘッダーを含む）
    pub body: BTreeSet<BlockId>,
    /// バックエッジの元ブロック
    pub latches: Vec<BlockId>,
}

/// 支配木構造
#[derive(Debug, Clone)]
pub struct DominanceTree {
    /// 各ブロックの直接支配者（エントリは None）
    pub idom: Vec<Option<BlockId>>,
    /// 直接後支配者（出口へ到達しないブロックや出口直前は None）
    pub ipdom: Vec<Option<BlockId>>,
    /// 支配木の子ノード
    pub children: Vec<Vec<BlockId>>,
    /// 逆ポストオーダー
    pub rpo: Vec<BlockId>,
    rpo_index: Vec<usize>,
    /// ヘッダーごとにまとめた自然ループ（外側から）
    pub loops: Vec<LoopInfo>,
    /// 支配関係で説明できない後退辺があるか
    pub irreducible: bool,
}

impl DominanceTree {
    /// CFGから支配木・後支配木・ループを計算
    pub fn compute(cfg: &ControlFlowGraph) -> Self {
        let n = cfg.blocks.len();

        let mut graph: DiGraph<(), ()> = DiGraph::with_capacity(n, n * 2);
        for _ in 0..n {
            graph.add_node(());
        }
        for block in &cfg.blocks {
            for &s in block.successors.iter().chain(block.handlers.iter()) {
                graph.add_edge(NodeIndex::new(block.id), NodeIndex::new(s), ());
            }
        }
        let doms = simple_fast(&graph, NodeIndex::new(cfg.entry_block));
        let idom: Vec<Option<BlockId>> = (0..n)
            .map(|b| {
                doms.immediate_dominator(NodeIndex::new(b))
                    .map(|d| d.index())
            })
            .collect();

        // 後支配木: 辺を逆向きにし、出口ブロックへ仮想出口から辺を張る
        let mut reversed: DiGraph<(), ()> = DiGraph::with_capacity(n + 1, n * 2);
        for _ in 0..=n {
            reversed.add_node(());
        }
        let exit = NodeIndex::new(n);
        for block in &cfg.blocks {
            if block.successors.is_empty() {
                reversed.add_edge(exit, NodeIndex::new(block.id), ());
            }
            for &s in &block.successors {
                reversed.add_edge(NodeIndex::new(s), NodeIndex::new(block.id), ());
            }
        }
        let pdoms = simple_fast(&reversed, exit);
        let ipdom: Vec<Option<BlockId>> = (0..n)
            .map(|b| {
                pdoms
                    .immediate_dominator(NodeIndex::new(b))
                    .map(|d| d.index())
                    .filter(|&d| d != n)
            })
            .collect();

        let mut children = vec![Vec::new(); n];
        for (b, d) in idom.iter().enumerate() {
            if let Some(d) = d {
                children[*d].push(b);
            }
        }

        let (rpo, retreating) = depth_first(cfg);
        let mut rpo_index = vec![usize::MAX; n];
        for (i, &b) in rpo.iter().enumerate() {
            rpo_index[b] = i;
        }

        let mut tree = Self {
            idom,
            ipdom,
            children,
            rpo,
            rpo_index,
            loops: Vec::new(),
            irreducible: false,
        };

        let mut back_edges = Vec::new();
        for (from, to) in retreating {
            if tree.dominates(to, from) {
                back_edges.push((from, to));
            } else {
                tree.irreducible = true;
            }
        }
        tree.loops = natural_loops(cfg, &back_edges, &tree.rpo_index);

        debug!(
            "Dominance: {} blocks, {} loops, irreducible={}",
            n,
            tree.loops.len(),
            tree.irreducible
        );
        tree
    }

    /// a が b を支配するか（反射的）
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = Some(b);
        while let Some(c) = cur {
            if c == a {
                return true;
            }
            cur = self.idom[c];
        }
        false
    }

    /// 逆ポストオーダーでの順位
    pub fn rpo_index(&self, block: BlockId) -> usize {
        self.rpo_index[block]
    }

    /// block をヘッダーとするループ
    pub fn loop_at(&self, header: BlockId) -> Option<&LoopInfo> {
        self.loops.iter().find(|l| l.header == header)
    }
}

/// 反復DFS。逆ポストオーダーと後退辺（行き先が探索中のノード）を返す
fn depth_first(cfg: &ControlFlowGraph) -> (Vec<BlockId>, Vec<(BlockId, BlockId)>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let n = cfg.blocks.len();
    let mut color = vec![Color::White; n];
    let mut postorder = Vec::with_capacity(n);
    let mut retreating = Vec::new();

    let succs = |b: BlockId| -> Vec<BlockId> {
        let block = &cfg.blocks[b];
        block
            .successors
            .iter()
            .chain(block.handlers.iter())
            .copied()
            .collect()
    };

    let entry = cfg.entry_block;
    let mut stack: Vec<(BlockId, Vec<BlockId>, usize)> = vec![(entry, succs(entry), 0)];
    color[entry] = Color::Gray;
    while let Some((b, list, idx)) = stack.last_mut() {
        if *idx < list.len() {
            let s = list[*idx];
            *idx += 1;
            match color[s] {
                Color::White => {
                    color[s] = Color::Gray;
                    let next = succs(s);
                    stack.push((s, next, 0));
                }
                Color::Gray => retreating.push((*b, s)),
                Color::Black => {}
            }
        } else {
            color[*b] = Color::Black;
            postorder.push(*b);
            stack.pop();
        }
    }

    postorder.reverse();
    (postorder, retreating)
}

/// バックエッジから自然ループを作り、ヘッダーごとにまとめる
fn natural_loops(
    cfg: &ControlFlowGraph,
    back_edges: &[(BlockId, BlockId)],
    rpo_index: &[usize],
) -> Vec<LoopInfo> {
    let mut loops: Vec<LoopInfo> = Vec::new();
    for &(latch, header) in back_edges {
        let mut body = BTreeSet::from([header]);
        let mut work = vec![latch];
        while let Some(b) = work.pop() {
            if !body.insert(b) {
                continue;
            }
            let block = &cfg.blocks[b];
            for &p in block.predecessors.iter().chain(block.exception_preds.iter()) {
                if !body.contains(&p) {
                    work.push(p);
                }
            }
        }

        match loops.iter_mut().find(|l| l.header == header) {
            Some(existing) => {
                existing.body.extend(body);
                existing.latches.push(latch);
            }
            None => loops.push(LoopInfo {
                header,
                body,
                latches: vec![latch],
            }),
        }
    }
    loops.sort_by_key(|l| rpo_index[l.header]);
    loops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::insn::{CmpOp, Insn, InsnArg, InsnKind, Offset, RegisterArg};

    fn if_z(reg: u16, target: Offset, offset: Offset) -> Insn {
        Insn::new(
            InsnKind::If {
                op: CmpOp::Eq,
                target,
            },
            vec![InsnArg::reg(reg)],
            None,
            offset,
        )
    }

    fn konst(reg: u16, offset: Offset) -> Insn {
        Insn::new(
            InsnKind::Const,
            vec![InsnArg::lit(1, crate::decompiler::types::ArgType::Int)],
            Some(RegisterArg::new(reg)),
            offset,
        )
    }

    fn goto(target: Offset, offset: Offset) -> Insn {
        Insn::new(InsnKind::Goto { target }, vec![], None, offset)
    }

    fn ret(offset: Offset) -> Insn {
        Insn::new(InsnKind::Return, vec![], None, offset)
    }

    #[test]
    fn test_diamond_dominators() {
        // 0: if -> 3 | 1: const; 2: goto 4 | 3: const | 4: return
        let insns = vec![
            if_z(0, 3, 0),
            konst(1, 1),
            goto(4, 2),
            konst(1, 3),
            ret(4),
        ];
        let cfg = ControlFlowGraph::build(insns, &[], 5).unwrap();
        let dom = DominanceTree::compute(&cfg);

        assert_eq!(dom.idom[0], None);
        assert_eq!(dom.idom[1], Some(0));
        assert_eq!(dom.idom[2], Some(0));
        assert_eq!(dom.idom[3], Some(0));
        assert_eq!(dom.ipdom[0], Some(3));
        assert_eq!(dom.ipdom[1], Some(3));
        assert_eq!(dom.ipdom[3], None);
        assert!(dom.loops.is_empty());
        assert!(!dom.irreducible);
        assert_eq!(dom.rpo[0], 0);
    }

    #[test]
    fn test_while_loop_detected() {
        // 0: if r0 == 0 -> 3 | 1: const; 2: goto 0 | 3: return
        let insns = vec![if_z(0, 3, 0), konst(1, 1), goto(0, 2), ret(3)];
        let cfg = ControlFlowGraph::build(insns, &[], 4).unwrap();
        let dom = DominanceTree::compute(&cfg);

        assert_eq!(dom.loops.len(), 1);
        let l = &dom.loops[0];
        assert_eq!(l.header, 0);
        assert_eq!(l.latches, vec![1]);
        assert_eq!(l.body.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(dom.loop_at(0).is_some());
    }

    #[test]
    fn test_irreducible_graph() {
        // B0 -> B1, B0 -> B2, B1 -> B2, B2 -> B1 （入口が2つある循環）
        let insns = vec![
            if_z(0, 3, 0), // B0: succ [B1(1), B2(3)]
            konst(1, 1),   // B1
            goto(3, 2),
            if_z(1, 1, 3), // B2: succ [B3(4), B1(1)]
            ret(4),        // B3
        ];
        let cfg = ControlFlowGraph::build(insns, &[], 5).unwrap();
        let dom = DominanceTree::compute(&cfg);
        assert!(dom.irreducible);
    }
}
