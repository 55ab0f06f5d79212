/// データフロー解析基盤
///
/// 到達定義からレジスタ単位の Def-Use Chain を構築する。
/// - 例外辺ではブロック途中の定義もハンドラへ到達するとみなす
/// - ワイド値の定義は隣のレジスタ（reg+1）の定義も殺す
/// - ラップ済み命令の result は定義として扱わない（帳簿用）
///
/// 同じ使用に到達する定義を union-find でまとめたものを変数（web）とする。

use crate::decompiler::bitset::BitSet;
use crate::decompiler::cfg::{BlockId, ControlFlowGraph};
use crate::decompiler::insn::{ArgSlot, RegNum, RegisterArg, VarId};
use std::collections::HashMap;

/// 定義ID
pub type DefId = usize;
/// 使用ID
pub type UseId = usize;

/// 定義の場所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefSite {
    /// メソッド入口で定義される引数（受け取り側を含む）
    Entry,
    /// ブロック内の最上位命令の result
    Insn { block: BlockId, pos: usize },
}

#[derive(Debug, Clone)]
pub struct Def {
    pub reg: RegNum,
    pub wide: bool,
    pub site: DefSite,
}

#[derive(Debug, Clone)]
pub struct Use {
    pub reg: RegNum,
    pub block: BlockId,
    pub pos: usize,
    /// 命令木内の位置
    pub path: Vec<ArgSlot>,
    /// 到達する定義
    pub reaching: Vec<DefId>,
}

/// 変数（web）への割り当て
#[derive(Debug, Clone, Default)]
pub struct Webs {
    pub def_var: Vec<VarId>,
    pub use_var: Vec<Option<VarId>>,
    /// 変数 → レジスタ番号
    pub var_regs: Vec<RegNum>,
}

impl Webs {
    pub fn var_count(&self) -> usize {
        self.var_regs.len()
    }
}

/// Def-Use Chain
#[derive(Debug, Clone)]
pub struct DefUseChain {
    pub defs: Vec<Def>,
    pub uses: Vec<Use>,
    def_uses: Vec<Vec<UseId>>,
    def_at: HashMap<(BlockId, usize), DefId>,
    use_at: HashMap<(BlockId, usize, Vec<ArgSlot>), UseId>,
}

impl DefUseChain {
    /// CFGとメソッド入口の定義から構築
    pub fn build(cfg: &ControlFlowGraph, entry_defs: &[RegisterArg]) -> Self {
        let mut defs: Vec<Def> = entry_defs
            .iter()
            .map(|r| Def {
                reg: r.reg,
                wide: r.wide,
                site: DefSite::Entry,
            })
            .collect();
        let entry_count = defs.len();

        let mut def_at = HashMap::new();
        let mut block_defs: Vec<Vec<DefId>> = vec![Vec::new(); cfg.blocks.len()];
        for block in &cfg.blocks {
            for (pos, insn) in block.insns.iter().enumerate() {
                if let Some(r) = &insn.result {
                    let id = defs.len();
                    defs.push(Def {
                        reg: r.reg,
                        wide: r.wide,
                        site: DefSite::Insn {
                            block: block.id,
                            pos,
                        },
                    });
                    def_at.insert((block.id, pos), id);
                    block_defs[block.id].push(id);
                }
            }
        }

        let mut defs_by_reg: HashMap<RegNum, Vec<DefId>> = HashMap::new();
        for (id, d) in defs.iter().enumerate() {
            defs_by_reg.entry(d.reg).or_default().push(id);
        }
        let written = |d: &Def| {
            if d.wide {
                vec![d.reg, d.reg.wrapping_add(1)]
            } else {
                vec![d.reg]
            }
        };

        // ブロックごとの gen / kill
        let n = cfg.blocks.len();
        let mut gen = vec![BitSet::new(); n];
        let mut kill = vec![BitSet::new(); n];
        let mut all_defs = vec![BitSet::new(); n];
        for b in 0..n {
            for &d in &block_defs[b] {
                for r in written(&defs[d]) {
                    for &x in defs_by_reg.get(&r).map(|v| v.as_slice()).unwrap_or(&[]) {
                        kill[b].insert(x);
                        gen[b].remove(x);
                    }
                }
                gen[b].insert(d);
                all_defs[b].insert(d);
            }
        }

        // 到達定義の反復計算
        let entry_set: BitSet = (0..entry_count).collect();
        let mut ins = vec![BitSet::new(); n];
        let mut outs = vec![BitSet::new(); n];
        let mut changed = true;
        while changed {
            changed = false;
            for b in 0..n {
                let block = &cfg.blocks[b];
                let mut in_set = if b == cfg.entry_block {
                    entry_set.clone()
                } else {
                    BitSet::new()
                };
                for &p in &block.predecessors {
                    in_set.union_with(&outs[p]);
                }
                for &p in &block.exception_preds {
                    in_set.union_with(&ins[p]);
                    in_set.union_with(&all_defs[p]);
                }

                let mut out_set = in_set.clone();
                out_set.subtract(&kill[b]);
                out_set.union_with(&gen[b]);

                if out_set != outs[b] || in_set != ins[b] {
                    changed = true;
                    outs[b] = out_set;
                    ins[b] = in_set;
                }
            }
        }

        // 使用の収集
        let mut uses = Vec::new();
        let mut def_uses = vec![Vec::new(); defs.len()];
        let mut use_at = HashMap::new();
        for block in &cfg.blocks {
            let mut current: HashMap<RegNum, Vec<DefId>> = HashMap::new();
            for d in ins[block.id].iter() {
                current.entry(defs[d].reg).or_default().push(d);
            }
            for (pos, insn) in block.insns.iter().enumerate() {
                for (path, r) in insn.register_reads() {
                    let reaching = current.get(&r.reg).cloned().unwrap_or_default();
                    let id = uses.len();
                    for &d in &reaching {
                        def_uses[d].push(id);
                    }
                    use_at.insert((block.id, pos, path.clone()), id);
                    uses.push(Use {
                        reg: r.reg,
                        block: block.id,
                        pos,
                        path,
                        reaching,
                    });
                }
                if let Some(&d) = def_at.get(&(block.id, pos)) {
                    for r in written(&defs[d]) {
                        current.remove(&r);
                    }
                    current.insert(defs[d].reg, vec![d]);
                }
            }
        }

        Self {
            defs,
            uses,
            def_uses,
            def_at,
            use_at,
        }
    }

    pub fn def_at(&self, block: BlockId, pos: usize) -> Option<DefId> {
        self.def_at.get(&(block, pos)).copied()
    }

    pub fn use_at(&self, block: BlockId, pos: usize, path: &[ArgSlot]) -> Option<UseId> {
        self.use_at.get(&(block, pos, path.to_vec())).copied()
    }

    /// 定義を読む使用
    pub fn uses_of(&self, def: DefId) -> &[UseId] {
        &self.def_uses[def]
    }

    /// 定義が単一の使用だけに到達するか
    pub fn is_single_use(&self, def: DefId) -> bool {
        self.def_uses[def].len() == 1
    }

    /// インライン化の候補となる同一ブロック内の定義位置
    ///
    /// 使用に到達する定義がちょうど1つで、その定義の使用がこの1か所だけの場合に限る。
    pub fn inline_source(&self, block: BlockId, pos: usize, path: &[ArgSlot]) -> Option<usize> {
        let u = self.use_at(block, pos, path)?;
        let reaching = &self.uses[u].reaching;
        if reaching.len() != 1 {
            return None;
        }
        let d = reaching[0];
        match self.defs[d].site {
            DefSite::Insn {
                block: def_block,
                pos: def_pos,
            } if def_block == block && def_pos < pos && self.is_single_use(d) => Some(def_pos),
            _ => None,
        }
    }

    /// 同じ使用に到達する定義をまとめて変数を割り当てる
    pub fn webs(&self) -> Webs {
        let mut parent: Vec<usize> = (0..self.defs.len()).collect();
        fn find(parent: &mut [usize], x: usize) -> usize {
            let mut root = x;
            while parent[root] != root {
                root = parent[root];
            }
            let mut cur = x;
            while parent[cur] != root {
                let next = parent[cur];
                parent[cur] = root;
                cur = next;
            }
            root
        }

        for u in &self.uses {
            if let Some((&first, rest)) = u.reaching.split_first() {
                for &d in rest {
                    let a = find(&mut parent, first);
                    let b = find(&mut parent, d);
                    if a != b {
                        parent[b.max(a)] = a.min(b);
                    }
                }
            }
        }

        let mut root_var: HashMap<usize, VarId> = HashMap::new();
        let mut webs = Webs::default();
        for d in 0..self.defs.len() {
            let root = find(&mut parent, d);
            let var = *root_var.entry(root).or_insert_with(|| {
                webs.var_regs.push(self.defs[root].reg);
                (webs.var_regs.len() - 1) as VarId
            });
            webs.def_var.push(var);
        }
        webs.use_var = self
            .uses
            .iter()
            .map(|u| u.reaching.first().map(|&d| webs.def_var[d]))
            .collect();
        webs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::insn::{CmpOp, Insn, InsnArg, InsnKind, Offset};
    use crate::decompiler::types::ArgType;

    fn konst(reg: RegNum, value: i64, offset: Offset) -> Insn {
        Insn::new(
            InsnKind::Const,
            vec![InsnArg::lit(value, ArgType::Int)],
            Some(RegisterArg::new(reg)),
            offset,
        )
    }

    fn ret(reg: RegNum, offset: Offset) -> Insn {
        Insn::new(InsnKind::Return, vec![InsnArg::reg(reg)], None, offset)
    }

    #[test]
    fn test_reaching_definitions_merge_into_one_web() {
        // if (p0 == 0) r1 = 1 else r1 = 2; return r1
        let insns = vec![
            Insn::new(
                InsnKind::If {
                    op: CmpOp::Eq,
                    target: 3,
                },
                vec![InsnArg::reg(0)],
                None,
                0,
            ),
            konst(1, 1, 1),
            Insn::new(InsnKind::Goto { target: 4 }, vec![], None, 2),
            konst(1, 2, 3),
            ret(1, 4),
        ];
        let cfg = ControlFlowGraph::build(insns, &[], 5).unwrap();
        let chain = DefUseChain::build(&cfg, &[RegisterArg::new(0)]);

        let ret_use = chain.use_at(3, 0, &[ArgSlot::Arg(0)]).unwrap();
        assert_eq!(chain.uses[ret_use].reaching.len(), 2);
        // 引数 p0 は if で使われる
        assert_eq!(chain.uses_of(0).len(), 1);

        let webs = chain.webs();
        let d1 = chain.def_at(1, 0).unwrap();
        let d2 = chain.def_at(2, 0).unwrap();
        assert_eq!(webs.def_var[d1], webs.def_var[d2]);
        assert_ne!(webs.def_var[0], webs.def_var[d1]);
        assert_eq!(webs.var_regs[webs.def_var[d1] as usize], 1);
    }

    #[test]
    fn test_inline_source_requires_single_use() {
        let insns = vec![
            konst(0, 5, 0),
            Insn::new(
                InsnKind::Arith {
                    op: crate::decompiler::insn::ArithOp::Add,
                    ty: ArgType::Int,
                },
                vec![InsnArg::reg(0), InsnArg::reg(0)],
                Some(RegisterArg::new(1)),
                1,
            ),
            ret(1, 2),
        ];
        let cfg = ControlFlowGraph::build(insns, &[], 3).unwrap();
        let chain = DefUseChain::build(&cfg, &[]);

        // r0 は2回使われるのでインライン化できない
        assert_eq!(chain.inline_source(0, 1, &[ArgSlot::Arg(0)]), None);
        // r1 は return で1回だけ使われる
        assert_eq!(chain.inline_source(0, 2, &[ArgSlot::Arg(0)]), Some(1));
    }

    #[test]
    fn test_wide_definition_kills_high_half() {
        let insns = vec![
            konst(1, 7, 0),
            Insn::new(
                InsnKind::Const,
                vec![InsnArg::lit(0, ArgType::Long)],
                Some(RegisterArg::typed(0, ArgType::Long)),
                1,
            ),
            ret(1, 2),
        ];
        let cfg = ControlFlowGraph::build(insns, &[], 3).unwrap();
        let chain = DefUseChain::build(&cfg, &[]);
        let u = chain.use_at(0, 2, &[ArgSlot::Arg(0)]).unwrap();
        assert!(chain.uses[u].reaching.is_empty());
    }
}
