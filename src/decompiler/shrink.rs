/// レジスタインライナー
///
/// 単一使用の代入を、同じブロック内の使用箇所へ式としてラップする。
/// ブロックごとに命令位置 0..n を振り、位置のインデックスだけで状態を持つ:
///
/// - `border[p]`: 位置 p の命令へのインライン化が越えてはいけない最小位置
/// - `inlined_into[d]`: d をラップする予定の命令（経路圧縮つき）
/// - `pending[p]`: この走査で p にラップ予定の命令
///
/// ラップはブロックの走査が終わってから発見順に適用する。
/// 変化がなくなるまでパスを繰り返す（上限つき）。

use crate::decompiler::bitset::RegSet;
use crate::decompiler::cfg::{BlockId, ControlFlowGraph};
use crate::decompiler::dataflow::DefUseChain;
use crate::decompiler::insn::{ArgSlot, Insn, InsnArg, InsnKind, RegisterArg};
use crate::error::{Diagnostic, DiagnosticKind, Result};
use tracing::{debug, warn};

/// インライン化の統計
#[derive(Debug, Clone, Default)]
pub struct ShrinkStats {
    /// 実行したパス数（変化なしの最終パスを含む）
    pub passes: usize,
    /// ラップした命令数
    pub inlined: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// 確定したラップ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrap {
    pub def_pos: usize,
    pub use_pos: usize,
    pub path: Vec<ArgSlot>,
}

/// 1ブロック分のインライン化状態
pub struct BlockShrinker<'a> {
    insns: &'a [Insn],
    border: Vec<usize>,
    inlined_into: Vec<Option<usize>>,
    pending: Vec<Vec<usize>>,
    wraps: Vec<Wrap>,
}

impl<'a> BlockShrinker<'a> {
    pub fn new(insns: &'a [Insn]) -> Self {
        let n = insns.len();
        Self {
            insns,
            border: (0..n).collect(),
            inlined_into: vec![None; n],
            pending: vec![Vec::new(); n],
            wraps: Vec::new(),
        }
    }

    /// 発見順のラップ
    pub fn wraps(&self) -> &[Wrap] {
        &self.wraps
    }

    pub fn into_wraps(self) -> Vec<Wrap> {
        self.wraps
    }

    /// def_pos の命令を use_pos の path へ移せるか判定し、移せるなら記録する
    ///
    /// def_pos >= use_pos や範囲外の位置は呼び出し側の帳簿の不整合としてエラーにする。
    pub fn check_inline(&mut self, def_pos: usize, use_pos: usize, path: &[ArgSlot]) -> Result<bool> {
        if def_pos >= use_pos || use_pos >= self.insns.len() {
            return Err(inconsistency!(
                "invalid inline positions: {} -> {} (block size {})",
                def_pos,
                use_pos,
                self.insns.len()
            ));
        }
        if self.inlined_into[def_pos].is_some() {
            return Ok(false);
        }
        let border = self.border[use_pos];
        if def_pos >= border || !self.can_move(def_pos, border, use_pos)? {
            return Ok(false);
        }

        let target = &self.insns[use_pos];
        let into_branch = matches!(target.kind, InsnKind::Ternary(_))
            && matches!(path.first(), Some(ArgSlot::Arg(_)));
        if into_branch && !self.tree_can_reorder(def_pos) {
            return Ok(false);
        }
        if !self.crosses_wrapped(def_pos, use_pos, path) {
            return Ok(false);
        }

        self.border[use_pos] = def_pos;
        self.inlined_into[def_pos] = Some(use_pos);
        self.pending[use_pos].push(def_pos);
        self.wraps.push(Wrap {
            def_pos,
            use_pos,
            path: path.to_vec(),
        });
        Ok(true)
    }

    /// from の命令を to の直前まで動かせるか
    fn can_move(&mut self, from: usize, to: usize, target: usize) -> Result<bool> {
        let start = from + 1;
        if start == to {
            return Ok(true);
        }
        if start > to {
            return Err(inconsistency!("invalid inline positions: {} - {}", start, to));
        }
        let moved = self.moved_reads(from);
        if moved.is_empty() && self.insns[from].is_const() {
            return Ok(true);
        }
        let reorder = self.tree_can_reorder(from);
        for i in start..to {
            if self.inlined_root(i) == Some(target) {
                continue;
            }
            let cur = &self.insns[i];
            if writes_any(cur, &moved) || (!reorder && !cur.can_reorder()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 対象命令内の既存のラップ済み式を越えられるか
    ///
    /// 使用より前に評価される式は間にある命令として、後に評価される式は
    /// 副作用の順序だけを見る。
    fn crosses_wrapped(&self, def_pos: usize, use_pos: usize, path: &[ArgSlot]) -> bool {
        let mut before = Vec::new();
        let mut after = Vec::new();
        split_wrapped(&self.insns[use_pos], path, &mut before, &mut after);
        if before.is_empty() && after.is_empty() {
            return true;
        }
        let reorder = self.tree_can_reorder(def_pos);
        let moved = self.moved_reads(def_pos);
        let before_ok = before
            .iter()
            .all(|w| !writes_any(w, &moved) && (reorder || w.can_reorder()));
        let after_ok = after.iter().all(|w| reorder || w.can_reorder());
        before_ok && after_ok
    }

    /// 移動する式が読むレジスタ（ラップ予定の命令を含む）
    fn moved_reads(&self, pos: usize) -> RegSet {
        let mut set = RegSet::new();
        self.fill_reads(pos, &mut set);
        set
    }

    fn fill_reads(&self, pos: usize, set: &mut RegSet) {
        self.insns[pos].collect_reads(set);
        for &w in &self.pending[pos] {
            self.fill_reads(w, set);
        }
    }

    fn tree_can_reorder(&self, pos: usize) -> bool {
        self.insns[pos].can_reorder() && self.pending[pos].iter().all(|&w| self.tree_can_reorder(w))
    }

    /// ラップ先の連鎖の根（経路圧縮）
    fn inlined_root(&mut self, pos: usize) -> Option<usize> {
        let parent = self.inlined_into[pos]?;
        match self.inlined_root(parent) {
            Some(root) => {
                self.inlined_into[pos] = Some(root);
                Some(root)
            }
            None => Some(parent),
        }
    }
}

fn writes_any(insn: &Insn, regs: &RegSet) -> bool {
    if regs.is_empty() {
        return false;
    }
    let mut written = RegSet::new();
    insn.collect_writes(&mut written);
    written.intersects(regs)
}

/// path の外にあるラップ済み式を、使用より前に評価されるものと後のものに分ける
fn split_wrapped<'i>(
    insn: &'i Insn,
    path: &[ArgSlot],
    before: &mut Vec<&'i Insn>,
    after: &mut Vec<&'i Insn>,
) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let mut passed = false;
    for (slot, arg) in insn.slots() {
        if slot == *head {
            passed = true;
            if let InsnArg::Wrapped(inner) = arg {
                split_wrapped(inner, rest, before, after);
            }
            continue;
        }
        if let InsnArg::Wrapped(inner) = arg {
            if passed {
                after.push(inner);
            } else {
                before.push(inner);
            }
        }
    }
}

/// ブロックの候補を走査してラップを決める
fn plan_block(insns: &[Insn], chain: &DefUseChain, block: BlockId) -> Result<Vec<Wrap>> {
    let mut shrinker = BlockShrinker::new(insns);
    for (pos, insn) in insns.iter().enumerate() {
        let paths: Vec<Vec<ArgSlot>> = insn
            .register_reads()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        // 後に評価される引数ほど定義が近い
        for path in paths.iter().rev() {
            let Some(def_pos) = chain.inline_source(block, pos, path) else {
                continue;
            };
            if matches!(insns[def_pos].kind, InsnKind::MoveException(_)) {
                continue;
            }
            shrinker.check_inline(def_pos, pos, path)?;
        }
    }
    Ok(shrinker.into_wraps())
}

/// ラップを発見順に適用し、ラップされた命令を列から外す
pub fn apply_wraps(insns: &mut Vec<Insn>, wraps: &[Wrap]) -> Result<usize> {
    let mut slots: Vec<Option<Insn>> = std::mem::take(insns).into_iter().map(Some).collect();
    for wrap in wraps {
        let def = slots
            .get_mut(wrap.def_pos)
            .and_then(Option::take)
            .ok_or_else(|| inconsistency!("instruction at {} already wrapped", wrap.def_pos))?;
        let target = slots
            .get_mut(wrap.use_pos)
            .and_then(Option::as_mut)
            .ok_or_else(|| inconsistency!("wrap target {} missing", wrap.use_pos))?;
        match target.arg_at_path_mut(&wrap.path) {
            Some(arg) if matches!(arg, InsnArg::Register(_)) => *arg = InsnArg::Wrapped(Box::new(def)),
            _ => {
                return Err(inconsistency!(
                    "no register at {:?} in instruction {}",
                    wrap.path,
                    wrap.use_pos
                ))
            }
        }
    }
    *insns = slots.into_iter().flatten().collect();
    Ok(wraps.len())
}

/// メソッド全体のインライン化を変化がなくなるまで繰り返す
pub fn shrink_method(
    cfg: &mut ControlFlowGraph,
    entry_defs: &[RegisterArg],
    max_passes: usize,
) -> Result<ShrinkStats> {
    let mut stats = ShrinkStats::default();
    loop {
        if stats.passes >= max_passes {
            warn!("Inliner stopped after {} passes", max_passes);
            stats.diagnostics.push(Diagnostic::new(
                DiagnosticKind::InlinePassLimit,
                format!("inlining stopped after {} passes", max_passes),
            ));
            break;
        }
        stats.passes += 1;
        let chain = DefUseChain::build(cfg, entry_defs);
        let mut changed = 0;
        for b in 0..cfg.blocks.len() {
            let wraps = plan_block(&cfg.blocks[b].insns, &chain, b)?;
            if !wraps.is_empty() {
                changed += apply_wraps(&mut cfg.blocks[b].insns, &wraps)?;
            }
        }
        stats.inlined += changed;
        if changed == 0 {
            break;
        }
    }
    debug!(
        "Inliner: {} wrapped in {} passes",
        stats.inlined, stats.passes
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::insn::{ArithOp, InvokeKind, Offset};
    use crate::decompiler::pool::MethodRef;
    use crate::decompiler::types::ArgType;

    fn konst(reg: u16, value: i64, offset: Offset) -> Insn {
        Insn::new(
            InsnKind::Const,
            vec![InsnArg::lit(value, ArgType::Int)],
            Some(RegisterArg::typed(reg, ArgType::Int)),
            offset,
        )
    }

    fn call(name: &str, args: &[u16], result: Option<u16>, offset: Offset) -> Insn {
        let desc = format!("({}){}", "I".repeat(args.len()), if result.is_some() { "I" } else { "V" });
        Insn::new(
            InsnKind::Invoke {
                kind: InvokeKind::Static,
                method: MethodRef::parse("Foo", name, &desc).unwrap(),
            },
            args.iter().map(|&r| InsnArg::reg(r)).collect(),
            result.map(RegisterArg::new),
            offset,
        )
    }

    fn add(dst: u16, a: u16, b: u16, offset: Offset) -> Insn {
        Insn::new(
            InsnKind::Arith {
                op: ArithOp::Add,
                ty: ArgType::Int,
            },
            vec![InsnArg::reg(a), InsnArg::reg(b)],
            Some(RegisterArg::new(dst)),
            offset,
        )
    }

    fn ret(reg: Option<u16>, offset: Offset) -> Insn {
        Insn::new(
            InsnKind::Return,
            reg.map(InsnArg::reg).into_iter().collect(),
            None,
            offset,
        )
    }

    fn shrink(insns: Vec<Insn>, code_len: Offset, params: &[RegisterArg]) -> (ControlFlowGraph, ShrinkStats) {
        let mut cfg = ControlFlowGraph::build(insns, &[], code_len).unwrap();
        let stats = shrink_method(&mut cfg, params, 16).unwrap();
        (cfg, stats)
    }

    #[test]
    fn test_single_use_chain_collapses() {
        // const r0 = 5; r1 = f(r0); return r1
        let insns = vec![konst(0, 5, 0), call("f", &[0], Some(1), 1), ret(Some(1), 4)];
        let (cfg, stats) = shrink(insns, 5, &[]);
        assert_eq!(stats.inlined, 2);

        let block = &cfg.blocks[0];
        assert_eq!(block.insns.len(), 1);
        let call = block.insns[0].args[0].as_wrapped().unwrap();
        assert!(matches!(call.kind, InsnKind::Invoke { .. }));
        let lit = call.args[0].as_wrapped().unwrap();
        assert_eq!(lit.kind, InsnKind::Const);
    }

    #[test]
    fn test_side_effect_between_blocks_call() {
        // r1 = g(); r0 = h(); f(r0, r1): r1 cannot pass h()
        let insns = vec![
            call("g", &[], Some(1), 0),
            call("h", &[], Some(0), 3),
            call("f", &[0, 1], None, 6),
            ret(None, 9),
        ];
        let (cfg, _) = shrink(insns, 10, &[]);
        let block = &cfg.blocks[0];
        assert_eq!(block.insns.len(), 3);
        let f = &block.insns[1];
        assert!(f.args[0].as_wrapped().is_some());
        assert_eq!(f.args[1].as_register().map(|r| r.reg), Some(1));
    }

    #[test]
    fn test_arguments_in_order_both_inline() {
        // r0 = h(); r1 = g(); f(r0, r1)
        let insns = vec![
            call("h", &[], Some(0), 0),
            call("g", &[], Some(1), 3),
            call("f", &[0, 1], None, 6),
            ret(None, 9),
        ];
        let (cfg, stats) = shrink(insns, 10, &[]);
        assert_eq!(stats.inlined, 2);
        let f = &cfg.blocks[0].insns[0];
        assert!(f.args.iter().all(|a| a.as_wrapped().is_some()));
    }

    #[test]
    fn test_multi_use_register_stays_named() {
        // r0 = s(); r1 = g(r0); use(r0); use(r1)
        let insns = vec![
            call("s", &[], Some(0), 0),
            call("g", &[0], Some(1), 3),
            call("use", &[0], None, 6),
            call("use", &[1], None, 9),
            ret(None, 12),
        ];
        let (cfg, stats) = shrink(insns, 13, &[]);
        assert_eq!(stats.inlined, 0);
        assert_eq!(cfg.blocks[0].insns.len(), 5);
    }

    #[test]
    fn test_pure_expression_moves_over_call() {
        // r0 = s(); r1 = r0 + r0; use(r0); use(r1) -> use(r0); use(r0 + r0)
        let insns = vec![
            call("s", &[], Some(0), 0),
            add(1, 0, 0, 3),
            call("use", &[0], None, 5),
            call("use", &[1], None, 8),
            ret(None, 11),
        ];
        let (cfg, stats) = shrink(insns, 12, &[]);
        assert_eq!(stats.inlined, 1);
        let block = &cfg.blocks[0];
        assert_eq!(block.insns.len(), 4);
        let moved = block.insns[2].args[0].as_wrapped().unwrap();
        assert!(matches!(moved.kind, InsnKind::Arith { .. }));
    }

    #[test]
    fn test_write_to_read_register_blocks_move() {
        // r1 = p0 + p0; p0 = 7; use(p0); return r1 + p0 : r1 cannot pass the write to p0
        let insns = vec![
            add(1, 0, 0, 0),
            konst(0, 7, 2),
            call("use", &[0], None, 3),
            add(2, 1, 0, 6),
            ret(Some(2), 8),
        ];
        let (cfg, stats) = shrink(insns, 9, &[RegisterArg::new(0)]);
        assert_eq!(stats.inlined, 1);
        let block = &cfg.blocks[0];
        assert_eq!(block.insns.len(), 4);
        assert!(matches!(block.insns[0].kind, InsnKind::Arith { .. }));
        let sum = block.insns[3].args[0].as_wrapped().unwrap();
        assert_eq!(sum.args[0].as_register().map(|r| r.reg), Some(1));
    }

    #[test]
    fn test_constant_moves_over_side_effects() {
        // const r0 = 1; s(); f(r0)
        let insns = vec![
            konst(0, 1, 0),
            call("s", &[], None, 1),
            call("f", &[0], None, 4),
            ret(None, 7),
        ];
        let (cfg, stats) = shrink(insns, 8, &[]);
        assert_eq!(stats.inlined, 1);
        assert_eq!(cfg.blocks[0].insns.len(), 3);
    }

    #[test]
    fn test_parameters_are_never_inlined() {
        let insns = vec![call("f", &[0], None, 0), ret(None, 3)];
        let (cfg, stats) = shrink(insns, 4, &[RegisterArg::new(0)]);
        assert_eq!(stats.inlined, 0);
        assert!(cfg.blocks[0].insns[0].args[0].as_register().is_some());
    }

    #[test]
    fn test_out_of_order_positions_are_inconsistent() {
        let insns = vec![konst(0, 1, 0), call("f", &[0], None, 1)];
        let mut shrinker = BlockShrinker::new(&insns);
        let err = shrinker.check_inline(1, 1, &[ArgSlot::Arg(0)]).unwrap_err();
        assert!(err.is_inconsistency());
        let err = shrinker.check_inline(1, 0, &[ArgSlot::Arg(0)]).unwrap_err();
        assert!(err.is_inconsistency());
        assert!(shrinker.check_inline(0, 1, &[ArgSlot::Arg(0)]).unwrap());
        // 2回目は排他
        assert!(!shrinker.check_inline(0, 1, &[ArgSlot::Arg(0)]).unwrap());
    }

    #[test]
    fn test_second_run_is_noop() {
        let insns = vec![
            call("g", &[], Some(1), 0),
            call("h", &[], Some(0), 3),
            call("f", &[0, 1], Some(2), 6),
            ret(Some(2), 9),
        ];
        let (mut cfg, _) = shrink(insns, 10, &[]);
        let before = cfg.blocks[0].insns.clone();
        let again = shrink_method(&mut cfg, &[], 16).unwrap();
        assert_eq!(again.inlined, 0);
        assert_eq!(again.passes, 1);
        assert_eq!(cfg.blocks[0].insns, before);
    }

    #[test]
    fn test_pass_limit_reports_diagnostic() {
        let insns = vec![konst(0, 5, 0), call("f", &[0], Some(1), 1), ret(Some(1), 4)];
        let mut cfg = ControlFlowGraph::build(insns, &[], 5).unwrap();
        let stats = shrink_method(&mut cfg, &[], 1).unwrap();
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.diagnostics[0].kind, DiagnosticKind::InlinePassLimit);
    }
}
