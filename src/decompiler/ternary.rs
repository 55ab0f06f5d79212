/// 三項演算子への畳み込み
///
/// 両方の腕が同じレジスタへの代入1つだけの if/else を、
/// ヘッダーブロック内の `r = cond ? a : b` に置き換える。
/// 両方の腕が値を返すだけなら `return cond ? a : b` にする。
/// 合流先のブロックが腕からしか到達されない場合は、その文をヘッダーへ寄せる
/// （次のインライン化で `return cond ? a : b` になる）。

use crate::decompiler::cfg::{BlockId, ControlFlowGraph};
use crate::decompiler::control_flow::Region;
use crate::decompiler::insn::{Condition, Insn, InsnArg, InsnKind, RegisterArg};
use std::collections::HashMap;
use tracing::debug;

/// 領域木の if を畳み込み、畳み込んだ数を返す
pub fn fold_ternaries(cfg: &mut ControlFlowGraph, root: &mut Region) -> usize {
    let mut folded: HashMap<BlockId, [BlockId; 2]> = HashMap::new();
    root.visit_mut(&mut |region| match region {
        Region::If { .. } => {
            if let Some((header, arms)) = fold_assignment(cfg, region) {
                folded.insert(header, arms);
                *region = Region::Block(header);
            } else if let Some(header) = fold_return(cfg, region, None) {
                folded.insert(header, [header, header]);
                *region = Region::Block(header);
            }
        }
        Region::Sequence(items) => fold_sequence(cfg, items, &mut folded),
        _ => {}
    });
    if !folded.is_empty() {
        debug!("Folded {} ternary expressions", folded.len());
    }
    folded.len()
}

/// 値を返す腕: 命令が return 1つだけ
fn return_value(cfg: &ControlFlowGraph, block: BlockId, header: BlockId) -> Option<InsnArg> {
    let b = &cfg.blocks[block];
    if b.predecessors != [header] || !b.exception_preds.is_empty() {
        return None;
    }
    match b.insns.as_slice() {
        [insn] if insn.kind == InsnKind::Return && insn.args.len() == 1 => Some(insn.args[0].clone()),
        _ => None,
    }
}

/// 代入する腕: goto を除いて代入1つだけ
fn assignment<'c>(cfg: &'c ControlFlowGraph, block: BlockId, header: BlockId) -> Option<&'c Insn> {
    let b = &cfg.blocks[block];
    if b.predecessors != [header] || !b.exception_preds.is_empty() {
        return None;
    }
    if b.handlers != cfg.blocks[header].handlers || b.successors.len() != 1 {
        return None;
    }
    let body: Vec<&Insn> = b
        .insns
        .iter()
        .filter(|i| !matches!(i.kind, InsnKind::Goto { .. } | InsnKind::Nop))
        .collect();
    match body.as_slice() {
        [insn] if insn.result.is_some() && !insn.is_terminator() => match insn.kind {
            InsnKind::MoveException(_) => None,
            _ => Some(*insn),
        },
        _ => None,
    }
}

/// 代入の右辺
fn assigned_value(insn: &Insn) -> InsnArg {
    match (&insn.kind, insn.args.as_slice()) {
        (InsnKind::Move, [value]) => value.clone(),
        _ => InsnArg::Wrapped(Box::new(insn.clone())),
    }
}

/// ヘッダー末尾の if を外して三項演算子の条件にする
fn take_condition(cfg: &mut ControlFlowGraph, header: BlockId, negated: bool) -> Option<(Condition, Insn)> {
    let insns = &mut cfg.blocks[header].insns;
    let op = match insns.last().map(|i| &i.kind) {
        Some(InsnKind::If { op, .. }) => *op,
        _ => return None,
    };
    let branch = insns.pop()?;
    let cond = Condition {
        op: if negated { op.negate() } else { op },
        args: branch.args.clone(),
    };
    Some((cond, branch))
}

fn ternary(cond: Condition, branch: &Insn, values: [InsnArg; 2], result: Option<RegisterArg>) -> Insn {
    let mut insn = Insn::new(
        InsnKind::Ternary(Box::new(cond)),
        Vec::from(values),
        result,
        branch.offset,
    );
    insn.line = branch.line;
    insn
}

/// if/else の両腕が同じレジスタへ代入する形
fn fold_assignment(cfg: &mut ControlFlowGraph, region: &Region) -> Option<(BlockId, [BlockId; 2])> {
    let Region::If {
        header,
        negated,
        then_region,
        else_region: Some(else_region),
    } = region
    else {
        return None;
    };
    let (Region::Block(t), Region::Block(e)) = (then_region.as_ref(), else_region.as_ref()) else {
        return None;
    };
    let (header, t, e) = (*header, *t, *e);
    let then_insn = assignment(cfg, t, header)?;
    let else_insn = assignment(cfg, e, header)?;
    let then_result = then_insn.result.clone()?;
    if else_insn.result.as_ref().map(|r| r.reg) != Some(then_result.reg)
        || cfg.blocks[t].successors != cfg.blocks[e].successors
    {
        return None;
    }
    let values = [assigned_value(then_insn), assigned_value(else_insn)];

    let (cond, branch) = take_condition(cfg, header, *negated)?;
    let folded = ternary(cond, &branch, values, Some(then_result));
    cfg.blocks[header].insns.push(folded);
    cfg.blocks[t].insns.clear();
    cfg.blocks[e].insns.clear();
    Some((header, [t, e]))
}

/// 両腕が return する if（else なしで後続が他方の腕の場合を含む）
fn fold_return(cfg: &mut ControlFlowGraph, region: &Region, next: Option<&Region>) -> Option<BlockId> {
    let Region::If {
        header,
        negated,
        then_region,
        else_region,
    } = region
    else {
        return None;
    };
    let then_block = match then_region.as_ref() {
        Region::Block(b) => *b,
        _ => return None,
    };
    let else_block = match (else_region.as_deref(), next) {
        (Some(Region::Block(b)), _) => *b,
        (None, Some(Region::Block(b))) => *b,
        _ => return None,
    };
    let header = *header;
    let then_value = return_value(cfg, then_block, header)?;
    let else_value = return_value(cfg, else_block, header)?;

    let (cond, branch) = take_condition(cfg, header, *negated)?;
    let folded = ternary(cond, &branch, [then_value, else_value], None);
    let offset = cfg.blocks[then_block].insns[0].offset;
    let mut ret = Insn::new(InsnKind::Return, vec![InsnArg::Wrapped(Box::new(folded))], None, offset);
    ret.line = cfg.blocks[then_block].insns[0].line;
    cfg.blocks[header].insns.push(ret);
    cfg.blocks[then_block].insns.clear();
    cfg.blocks[else_block].insns.clear();
    Some(header)
}

/// 列の中で return の畳み込みと、合流ブロックの取り込みを行う
fn fold_sequence(cfg: &mut ControlFlowGraph, items: &mut Vec<Region>, folded: &mut HashMap<BlockId, [BlockId; 2]>) {
    let mut i = 0;
    while i < items.len() {
        let next = items.get(i + 1);
        let uses_next = matches!(&items[i], Region::If { else_region: None, .. });
        if let Some(header) = fold_return(cfg, &items[i], next) {
            folded.insert(header, [header, header]);
            items[i] = Region::Block(header);
            if uses_next {
                items.remove(i + 1);
            }
        }
        i += 1;
    }

    // 畳み込んだヘッダーの直後の合流ブロックを取り込む
    let mut i = 0;
    while i + 1 < items.len() {
        if let (Region::Block(h), Region::Block(m)) = (&items[i], &items[i + 1]) {
            let (h, m) = (*h, *m);
            if let Some(arms) = folded.get(&h) {
                if can_absorb(cfg, h, m, arms) {
                    let moved = std::mem::take(&mut cfg.blocks[m].insns);
                    cfg.blocks[h].insns.extend(moved);
                    items.remove(i + 1);
                    continue;
                }
            }
        }
        i += 1;
    }
}

fn can_absorb(cfg: &ControlFlowGraph, header: BlockId, merge: BlockId, arms: &[BlockId; 2]) -> bool {
    let m = &cfg.blocks[merge];
    let h = &cfg.blocks[header];
    let arms_only = !m.predecessors.is_empty() && m.predecessors.iter().all(|p| arms.contains(p));
    let arms_empty = arms.iter().all(|&a| a != header && cfg.blocks[a].insns.is_empty());
    arms_only
        && arms_empty
        && m.exception_preds.is_empty()
        && m.handlers == h.handlers
        && !h.insns.last().is_some_and(|i| i.is_terminator())
}
