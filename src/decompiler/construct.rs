/// コンストラクタ呼び出しの畳み込み
///
/// `new-instance r; [r' = r;] invoke-direct {r'|r, ...} T.<init>` を
/// 同一ブロック内で `r = new T(...)` の1命令にまとめる。
/// 受け取り側が `this` の `<init>` はここでは扱わない（super/this 呼び出しとして出力）。
///
/// 三項演算子の畳み込みで合流ブロックがまとまった後にもう一度走る。
/// そのときは型推論済みなので、結果レジスタの変数はそのまま引き継ぐ。
/// 受け取り側に `new-instance` がインライン化済みなら、結果のない `new T(...)` にする。

use crate::decompiler::cfg::{BlockId, ControlFlowGraph};
use crate::decompiler::dataflow::{DefId, DefSite, DefUseChain};
use crate::decompiler::insn::{ArgSlot, InsnArg, InsnKind, InvokeKind, RegisterArg};
use tracing::debug;

/// 畳み込み計画（位置はブロック内インデックス）
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConstructPlan {
    block: BlockId,
    /// None は受け取り側に new-instance が埋め込まれている形
    new_pos: Option<usize>,
    copy_pos: Option<usize>,
    init_pos: usize,
}

/// コンストラクタ呼び出しを畳み込み、畳み込んだ数を返す
pub fn fold_constructors(cfg: &mut ControlFlowGraph, chain: &DefUseChain) -> usize {
    let mut plans = Vec::new();
    for block in &cfg.blocks {
        for (pos, insn) in block.insns.iter().enumerate() {
            let is_init = matches!(
                &insn.kind,
                InsnKind::Invoke { kind: InvokeKind::Direct, method } if method.is_constructor()
            );
            if !is_init {
                continue;
            }
            if is_wrapped_new(insn.args.first()) {
                plans.push(ConstructPlan {
                    block: block.id,
                    new_pos: None,
                    copy_pos: None,
                    init_pos: pos,
                });
            } else if let Some(plan) = plan_fold(cfg, chain, block.id, pos) {
                plans.push(plan);
            }
        }
    }

    for plan in &plans {
        apply_init(cfg, plan);
    }

    // 削除はブロックごとに後ろから
    let mut removals: Vec<(BlockId, usize)> = plans
        .iter()
        .flat_map(|p| {
            p.new_pos
                .into_iter()
                .chain(p.copy_pos)
                .map(move |pos| (p.block, pos))
        })
        .collect();
    removals.sort_unstable_by(|a, b| b.cmp(a));
    for (block, pos) in removals {
        cfg.blocks[block].insns.remove(pos);
    }

    if !plans.is_empty() {
        debug!("Folded {} constructor calls", plans.len());
    }
    plans.len()
}

fn plan_fold(
    cfg: &ControlFlowGraph,
    chain: &DefUseChain,
    block: BlockId,
    init_pos: usize,
) -> Option<ConstructPlan> {
    let insns = &cfg.blocks[block].insns;
    let receiver_def = single_local_def(chain, block, init_pos, &[ArgSlot::Arg(0)])?;
    let receiver_pos = local_pos(chain, receiver_def, block)?;

    let (new_def, new_pos, copy_pos) = match &insns[receiver_pos].kind {
        InsnKind::NewInstance(_) => (receiver_def, receiver_pos, None),
        InsnKind::Move if chain.is_single_use(receiver_def) => {
            let source_def = single_local_def(chain, block, receiver_pos, &[ArgSlot::Arg(0)])?;
            let source_pos = local_pos(chain, source_def, block)?;
            if !matches!(insns[source_pos].kind, InsnKind::NewInstance(_)) {
                return None;
            }
            (source_def, source_pos, Some(receiver_pos))
        }
        _ => return None,
    };

    // 初期化前に新しい値を読む箇所があれば畳み込まない
    for &u in chain.uses_of(new_def) {
        let site = &chain.uses[u];
        if site.block != block {
            continue;
        }
        let is_receiver = site.pos == init_pos && site.path == [ArgSlot::Arg(0)];
        if is_receiver || Some(site.pos) == copy_pos {
            continue;
        }
        if site.pos <= init_pos {
            return None;
        }
    }

    Some(ConstructPlan {
        block,
        new_pos: Some(new_pos),
        copy_pos,
        init_pos,
    })
}

/// 受け取り側がインライン化された new-instance か
fn is_wrapped_new(receiver: Option<&InsnArg>) -> bool {
    matches!(
        receiver.and_then(|r| r.as_wrapped()).map(|i| &i.kind),
        Some(InsnKind::NewInstance(_))
    )
}

/// 使用に到達する唯一の定義
fn single_local_def(
    chain: &DefUseChain,
    block: BlockId,
    pos: usize,
    path: &[ArgSlot],
) -> Option<DefId> {
    let u = chain.use_at(block, pos, path)?;
    match chain.uses[u].reaching.as_slice() {
        [d] => Some(*d),
        _ => None,
    }
}

/// 同一ブロック内の定義位置
fn local_pos(chain: &DefUseChain, def: DefId, block: BlockId) -> Option<usize> {
    match chain.defs[def].site {
        DefSite::Insn { block: b, pos } if b == block => Some(pos),
        _ => None,
    }
}

fn apply_init(cfg: &mut ControlFlowGraph, plan: &ConstructPlan) {
    let insns = &mut cfg.blocks[plan.block].insns;
    let result = match plan.new_pos {
        Some(new_pos) => {
            let new_insn = &insns[new_pos];
            match (&new_insn.result, &new_insn.kind) {
                // 型推論後なら変数ごと引き継ぐ
                (Some(result), InsnKind::NewInstance(_)) if result.var.is_some() => Some(result.clone()),
                (Some(result), InsnKind::NewInstance(ty)) => Some(RegisterArg::typed(result.reg, ty.clone())),
                _ => return,
            }
        }
        None => None,
    };
    let init = &mut insns[plan.init_pos];
    let method = match &init.kind {
        InsnKind::Invoke { method, .. } => method.clone(),
        _ => return,
    };
    init.kind = InsnKind::Construct { method };
    if !init.args.is_empty() {
        init.args.remove(0);
    }
    init.result = result;
}
