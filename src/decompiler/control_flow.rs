/// 制御構造の復元
/// CFGから領域木（if/while/do-while/switch/try）を構築する
///
/// 支配木・後支配木・自然ループを使い、ブロックを先頭から辿りながら
/// 合流点（直接後支配者）で区切って入れ子の領域を作る。
/// 表現できない分岐は goto マーカーとラベルで残し、決して失敗しない。
/// 既約でないグラフはメソッド全体をラベル付きブロック列として出力する。

use crate::decompiler::cfg::{BlockId, ControlFlowGraph};
use crate::decompiler::dominance::DominanceTree;
use crate::decompiler::insn::{InsnKind, Offset};
use crate::decompiler::types::ArgType;
use crate::error::{Diagnostic, DiagnosticKind};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use tracing::{debug, warn};

/// ループの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// 前判定（ヘッダーの条件）
    While,
    /// 後判定（唯一のラッチの条件）
    DoWhile,
    /// 条件なし（break で抜ける）
    Endless,
}

/// switch の case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchCase {
    pub keys: Vec<i32>,
    pub is_default: bool,
    /// case の入口ブロック
    pub target: BlockId,
    pub body: Region,
}

/// catch 節
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchClause {
    /// None は catch-all
    pub exception: Option<ArgType>,
    pub block: BlockId,
    pub body: Region,
}

/// 領域木のノード
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    Sequence(Vec<Region>),
    /// ブロックの文（分岐命令を除く）
    Block(BlockId),
    /// header 末尾の if。negated なら条件を反転して then を実行
    If {
        header: BlockId,
        negated: bool,
        then_region: Box<Region>,
        else_region: Option<Box<Region>>,
    },
    /// cond_block の条件（negated なら反転）が真の間繰り返す
    Loop {
        kind: LoopKind,
        header: BlockId,
        cond_block: Option<BlockId>,
        negated: bool,
        body: Box<Region>,
    },
    Switch {
        header: BlockId,
        cases: Vec<SwitchCase>,
    },
    Try {
        body: Box<Region>,
        catches: Vec<CatchClause>,
    },
    /// label はループヘッダー
    Break { label: Option<BlockId> },
    Continue { label: Option<BlockId> },
    /// ラベルへの明示的なジャンプ
    Goto { target: BlockId },
    /// 構造化しないブロック（分岐命令も goto 形式で出力）
    Raw(BlockId),
}

impl Region {
    /// 領域の最初に実行されるブロック
    pub fn entry_block(&self) -> Option<BlockId> {
        match self {
            Region::Sequence(items) => items.first().and_then(|r| r.entry_block()),
            Region::Block(b) | Region::Raw(b) => Some(*b),
            Region::If { header, .. } | Region::Loop { header, .. } | Region::Switch { header, .. } => {
                Some(*header)
            }
            Region::Try { body, .. } => body.entry_block(),
            Region::Break { .. } | Region::Continue { .. } | Region::Goto { .. } => None,
        }
    }

    /// goto や Raw を含むか
    pub fn has_fallback(&self) -> bool {
        let mut found = false;
        self.visit(&mut |r| {
            if matches!(r, Region::Goto { .. } | Region::Raw(_)) {
                found = true;
            }
        });
        found
    }

    /// 前順で全ノードを訪問
    pub fn visit<F: FnMut(&Region)>(&self, f: &mut F) {
        f(self);
        match self {
            Region::Sequence(items) => items.iter().for_each(|r| r.visit(f)),
            Region::If {
                then_region,
                else_region,
                ..
            } => {
                then_region.visit(f);
                if let Some(e) = else_region {
                    e.visit(f);
                }
            }
            Region::Loop { body, .. } => body.visit(f),
            Region::Switch { cases, .. } => cases.iter().for_each(|c| c.body.visit(f)),
            Region::Try { body, catches } => {
                body.visit(f);
                catches.iter().for_each(|c| c.body.visit(f));
            }
            _ => {}
        }
    }

    /// 後順で全ノードを書き換え可能に訪問
    pub fn visit_mut<F: FnMut(&mut Region)>(&mut self, f: &mut F) {
        match self {
            Region::Sequence(items) => items.iter_mut().for_each(|r| r.visit_mut(f)),
            Region::If {
                then_region,
                else_region,
                ..
            } => {
                then_region.visit_mut(f);
                if let Some(e) = else_region {
                    e.visit_mut(f);
                }
            }
            Region::Loop { body, .. } => body.visit_mut(f),
            Region::Switch { cases, .. } => cases.iter_mut().for_each(|c| c.body.visit_mut(f)),
            Region::Try { body, catches } => {
                body.visit_mut(f);
                catches.iter_mut().for_each(|c| c.body.visit_mut(f));
            }
            _ => {}
        }
        f(self);
    }
}

/// 構造化結果
#[derive(Debug, Clone)]
pub struct StructuredMethod {
    pub root: Region,
    /// goto の行き先になるブロック
    pub labels: BTreeSet<BlockId>,
    /// ラベル付き break/continue の対象ループ
    pub labeled_loops: BTreeSet<BlockId>,
    pub diagnostics: Vec<Diagnostic>,
    pub irreducible: bool,
}

/// ラベル名
pub fn label_name(offset: Offset) -> String {
    format!("L_0x{:04x}", offset)
}

#[derive(Debug, Clone)]
enum Frame {
    Loop {
        header: BlockId,
        exit: Option<BlockId>,
        body: Rc<BTreeSet<BlockId>>,
        /// do-while の条件ブロック
        cond_latch: Option<BlockId>,
    },
    Switch {
        exit: Option<BlockId>,
    },
}

/// 辿るときの文脈
#[derive(Debug, Clone, Default)]
struct Ctx {
    follow: Option<BlockId>,
    frames: Vec<Frame>,
    /// try 本体の範囲
    allowed: Option<Rc<BTreeSet<BlockId>>>,
}

impl Ctx {
    fn with_follow(&self, follow: Option<BlockId>) -> Self {
        Ctx {
            follow,
            ..self.clone()
        }
    }

    fn innermost_loop_body(&self) -> Option<&Rc<BTreeSet<BlockId>>> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Loop { body, .. } => Some(body),
            Frame::Switch { .. } => None,
        })
    }

    /// 合流点として使えるブロックか
    fn accepts(&self, block: BlockId) -> bool {
        let in_loop = match self.innermost_loop_body() {
            Some(body) => body.contains(&block),
            None => true,
        };
        let in_try = match &self.allowed {
            Some(set) => set.contains(&block),
            None => true,
        };
        let is_header = self.frames.iter().any(|f| matches!(f, Frame::Loop { header, .. } if *header == block));
        in_loop && in_try && !is_header
    }
}

/// 1ブロック分の処理結果
enum Step {
    /// 続けて辿る
    Next(Option<BlockId>),
    /// この領域はここで終わる
    Stop,
}

/// 制御構造解析器
pub struct ControlFlowStructurer<'a> {
    cfg: &'a ControlFlowGraph,
    dom: &'a DominanceTree,
    emitted: Vec<bool>,
    tries_done: Vec<bool>,
    labels: BTreeSet<BlockId>,
    labeled_loops: BTreeSet<BlockId>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> ControlFlowStructurer<'a> {
    pub fn new(cfg: &'a ControlFlowGraph, dom: &'a DominanceTree) -> Self {
        Self {
            cfg,
            dom,
            emitted: vec![false; cfg.blocks.len()],
            tries_done: vec![false; cfg.try_regions.len()],
            labels: BTreeSet::new(),
            labeled_loops: BTreeSet::new(),
            diagnostics: Vec::new(),
        }
    }

    /// CFGから領域木を構築
    pub fn structure(mut self) -> StructuredMethod {
        if self.dom.irreducible {
            return self.raw_fallback();
        }

        let mut items = vec![self.walk(self.cfg.entry_block, &Ctx::default(), false).0];

        // 構造化の途中で goto 先として残ったブロック
        for b in 0..self.cfg.blocks.len() {
            if !self.emitted[b] {
                self.labels.insert(b);
                items.push(self.walk(b, &Ctx::default(), false).0);
            }
        }

        let root = flatten(Region::Sequence(items));
        debug!(
            "Structured {} blocks: {} labels, {} diagnostics",
            self.cfg.blocks.len(),
            self.labels.len(),
            self.diagnostics.len()
        );
        StructuredMethod {
            root,
            labels: self.labels,
            labeled_loops: self.labeled_loops,
            diagnostics: self.diagnostics,
            irreducible: false,
        }
    }

    /// 既約でないグラフ: 全ブロックをオフセット順に並べる
    fn raw_fallback(mut self) -> StructuredMethod {
        warn!("Irreducible control flow, emitting labelled blocks");
        self.diagnostics.push(Diagnostic::new(
            DiagnosticKind::StructuringFallback,
            "irreducible control flow rendered with explicit gotos",
        ));
        let mut order: Vec<BlockId> = (0..self.cfg.blocks.len()).collect();
        order.sort_by_key(|&b| self.cfg.blocks[b].start_offset);
        for block in &self.cfg.blocks {
            self.labels.extend(block.successors.iter().copied());
            self.labels.extend(block.handlers.iter().copied());
        }
        StructuredMethod {
            root: Region::Sequence(order.into_iter().map(Region::Raw).collect()),
            labels: self.labels,
            labeled_loops: self.labeled_loops,
            diagnostics: self.diagnostics,
            irreducible: true,
        }
    }

    /// start から辿って順次領域を作る。follow に到達して止まったかも返す
    fn walk(&mut self, start: BlockId, ctx: &Ctx, first_is_body: bool) -> (Region, bool) {
        let mut items = Vec::new();
        let mut cur = Some(start);
        let mut first = first_is_body;
        let mut reached_follow = false;

        while let Some(b) = cur {
            let step = if first {
                first = false;
                self.enter_block(b, ctx, &mut items, true)
            } else {
                if Some(b) == ctx.follow {
                    reached_follow = true;
                    break;
                }
                self.enter_block(b, ctx, &mut items, false)
            };
            match step {
                Step::Next(next) => cur = next,
                Step::Stop => break,
            }
        }
        (flatten(Region::Sequence(items)), reached_follow)
    }

    fn enter_block(&mut self, b: BlockId, ctx: &Ctx, items: &mut Vec<Region>, as_body: bool) -> Step {
        if !as_body {
            if let Some(jump) = self.frame_jump(b, ctx) {
                items.push(jump);
                return Step::Stop;
            }
            if let Some(Frame::Loop {
                cond_latch: Some(latch),
                ..
            }) = ctx.frames.iter().rev().find(|f| matches!(f, Frame::Loop { .. }))
            {
                if *latch == b && !self.emitted[b] {
                    self.emitted[b] = true;
                    items.push(Region::Block(b));
                    return Step::Stop;
                }
            }
            let outside_loop = ctx
                .innermost_loop_body()
                .map_or(false, |body| !body.contains(&b));
            let outside_try = ctx.allowed.as_ref().map_or(false, |set| !set.contains(&b));
            if outside_loop || outside_try {
                items.push(self.leave(b, outside_try));
                return Step::Stop;
            }
            if self.emitted[b] {
                items.push(self.goto(b, "block reached twice"));
                return Step::Stop;
            }

            if self.dom.loop_at(b).is_some() {
                if let Some(t) = self.try_at(b).filter(|&t| !self.try_inside_loop(t, b)) {
                    return self.structure_try(t, ctx, items, false);
                }
                return self.structure_loop(b, ctx, items);
            }
        }
        if let Some(t) = self.try_at(b) {
            return self.structure_try(t, ctx, items, as_body);
        }

        self.emitted[b] = true;
        let cfg = self.cfg;
        let block = &cfg.blocks[b];
        match block.terminator().map(|t| &t.kind) {
            Some(InsnKind::If { .. }) => {
                let (region, next) = self.structure_if(b, ctx);
                items.push(region);
                Step::Next(next)
            }
            Some(InsnKind::Switch { .. }) => {
                let (region, next) = self.structure_switch(b, ctx);
                items.push(region);
                Step::Next(next)
            }
            Some(InsnKind::Return) | Some(InsnKind::Throw) => {
                items.push(Region::Block(b));
                Step::Stop
            }
            _ => {
                items.push(Region::Block(b));
                Step::Next(block.successors.first().copied())
            }
        }
    }

    /// 外側の break / continue で表せるジャンプ
    fn frame_jump(&mut self, b: BlockId, ctx: &Ctx) -> Option<Region> {
        let mut inner_loops = 0;
        for (depth, frame) in ctx.frames.iter().rev().enumerate() {
            match frame {
                Frame::Loop { header, exit, .. } => {
                    let label = if inner_loops == 0 && !self.switch_between(ctx, depth) {
                        None
                    } else {
                        Some(*header)
                    };
                    if b == *header {
                        // continue はswitch を越えても最内ループを指す
                        let label = if inner_loops == 0 { None } else { Some(*header) };
                        if let Some(l) = label {
                            self.labeled_loops.insert(l);
                        }
                        return Some(Region::Continue { label });
                    }
                    if Some(b) == *exit {
                        if let Some(l) = label {
                            self.labeled_loops.insert(l);
                        }
                        return Some(Region::Break { label });
                    }
                    inner_loops += 1;
                }
                Frame::Switch { exit } => {
                    if Some(b) == *exit && depth == 0 {
                        return Some(Region::Break { label: None });
                    }
                }
            }
        }
        None
    }

    /// 内側から depth 番目のフレームより内側に switch があるか
    fn switch_between(&self, ctx: &Ctx, depth: usize) -> bool {
        ctx.frames
            .iter()
            .rev()
            .take(depth)
            .any(|f| matches!(f, Frame::Switch { .. }))
    }

    /// 現在の領域の外へ出るジャンプ
    fn leave(&mut self, b: BlockId, from_try: bool) -> Region {
        if !self.emitted[b] && self.is_terminal_path(b) && (!from_try || self.path_cannot_throw(b)) {
            return self.walk(b, &Ctx::default(), false).0;
        }
        self.goto(b, "jump out of structured region")
    }

    fn goto(&mut self, target: BlockId, reason: &str) -> Region {
        let offset = self.cfg.blocks[target].start_offset;
        warn!("Structuring fallback at {}: {}", label_name(offset), reason);
        self.diagnostics.push(Diagnostic::new(
            DiagnosticKind::StructuringFallback,
            format!("{} ({})", reason, label_name(offset)),
        ));
        self.labels.insert(target);
        Region::Goto { target }
    }

    /// b へは1本の辺でしか入らず、b から到達できるブロックがすべて b に支配され未出力か
    fn is_terminal_path(&self, b: BlockId) -> bool {
        let block = &self.cfg.blocks[b];
        if block.predecessors.len() != 1 || !block.exception_preds.is_empty() {
            return false;
        }
        self.reachable_from(b)
            .map(|set| set.iter().all(|&r| self.dom.dominates(b, r) && !self.emitted[r]))
            .unwrap_or(false)
    }

    fn path_cannot_throw(&self, b: BlockId) -> bool {
        self.reachable_from(b).map_or(false, |set| {
            set.iter().all(|&r| {
                self.cfg.blocks[r].insns.iter().all(|i| {
                    matches!(
                        i.kind,
                        InsnKind::Nop
                            | InsnKind::Const
                            | InsnKind::ConstString(_)
                            | InsnKind::Move
                            | InsnKind::Goto { .. }
                            | InsnKind::Return
                    )
                })
            })
        })
    }

    /// 到達可能ブロック（大きすぎる場合は None）
    fn reachable_from(&self, b: BlockId) -> Option<BTreeSet<BlockId>> {
        let mut seen = BTreeSet::from([b]);
        let mut queue = VecDeque::from([b]);
        while let Some(x) = queue.pop_front() {
            let block = &self.cfg.blocks[x];
            for &s in block.successors.iter().chain(block.handlers.iter()) {
                if seen.insert(s) {
                    if seen.len() > self.cfg.blocks.len() {
                        return None;
                    }
                    queue.push_back(s);
                }
            }
        }
        Some(seen)
    }

    fn structure_if(&mut self, b: BlockId, ctx: &Ctx) -> (Region, Option<BlockId>) {
        let succs = self.cfg.blocks[b].successors.clone();
        let (fall, target) = match succs.as_slice() {
            [fall, target] => (*fall, *target),
            [only] => {
                return (
                    Region::If {
                        header: b,
                        negated: false,
                        then_region: Box::new(Region::Sequence(Vec::new())),
                        else_region: None,
                    },
                    Some(*only),
                )
            }
            _ => return (Region::Block(b), None),
        };

        let merge = self.dom.ipdom[b].filter(|&m| ctx.accepts(m));
        if let Some(m) = merge {
            let arm_ctx = ctx.with_follow(Some(m));
            let region = if target == m {
                let (then_region, _) = self.walk(fall, &arm_ctx, false);
                Region::If {
                    header: b,
                    negated: true,
                    then_region: Box::new(then_region),
                    else_region: None,
                }
            } else if fall == m {
                let (then_region, _) = self.walk(target, &arm_ctx, false);
                Region::If {
                    header: b,
                    negated: false,
                    then_region: Box::new(then_region),
                    else_region: None,
                }
            } else {
                let (then_region, _) = self.walk(fall, &arm_ctx, false);
                let (else_region, _) = self.walk(target, &arm_ctx, false);
                Region::If {
                    header: b,
                    negated: true,
                    then_region: Box::new(then_region),
                    else_region: Some(Box::new(else_region)),
                }
            };
            return (region, Some(m));
        }

        // 合流しない分岐: 抜ける側を then にして残りを続ける
        let arm_ctx = ctx.with_follow(None);
        if self.is_exit_arm(target, ctx) {
            let (then_region, _) = self.walk(target, &arm_ctx, false);
            let region = Region::If {
                header: b,
                negated: false,
                then_region: Box::new(then_region),
                else_region: None,
            };
            return (region, Some(fall));
        }
        if self.is_exit_arm(fall, ctx) {
            let (then_region, _) = self.walk(fall, &arm_ctx, false);
            let region = Region::If {
                header: b,
                negated: true,
                then_region: Box::new(then_region),
                else_region: None,
            };
            return (region, Some(target));
        }
        let (then_region, _) = self.walk(fall, &arm_ctx, false);
        let (else_region, _) = self.walk(target, &arm_ctx, false);
        let region = Region::If {
            header: b,
            negated: true,
            then_region: Box::new(then_region),
            else_region: Some(Box::new(else_region)),
        };
        (region, None)
    }

    /// break / continue の行き先か、戻ってこない経路か
    fn is_exit_arm(&self, b: BlockId, ctx: &Ctx) -> bool {
        let jumps = ctx.frames.iter().any(|f| match f {
            Frame::Loop { header, exit, .. } => b == *header || Some(b) == *exit,
            Frame::Switch { exit } => Some(b) == *exit,
        });
        jumps || (!self.emitted[b] && self.is_terminal_path(b))
    }

    fn structure_switch(&mut self, b: BlockId, ctx: &Ctx) -> (Region, Option<BlockId>) {
        let cfg = self.cfg;
        let block = &cfg.blocks[b];
        let Some(InsnKind::Switch { keys, targets, .. }) = block.terminator().map(|t| &t.kind) else {
            return (Region::Block(b), None);
        };
        let Some(&default_block) = block.successors.first() else {
            return (Region::Block(b), None);
        };

        let mut case_keys: BTreeMap<BlockId, Vec<i32>> = BTreeMap::new();
        for (key, target) in keys.iter().zip(targets.iter()) {
            if let Some(t) = cfg.block_at_offset(*target) {
                case_keys.entry(t).or_default().push(*key);
            }
        }

        let merge = self.dom.ipdom[b].filter(|&m| ctx.accepts(m));
        let mut entries: Vec<BlockId> = case_keys.keys().copied().collect();
        if !entries.contains(&default_block) {
            entries.push(default_block);
        }
        if merge == Some(default_block) {
            // 既定が合流点なら、合流点へ直行する case も既定と同じ
            entries.retain(|&t| t != default_block);
        }
        entries.sort_by_key(|&t| cfg.blocks[t].start_offset);

        let mut frames = ctx.frames.clone();
        frames.push(Frame::Switch { exit: merge });
        let mut cases = Vec::with_capacity(entries.len());
        for (i, &target) in entries.iter().enumerate() {
            let next_case = entries.get(i + 1).copied();
            let case_ctx = Ctx {
                follow: next_case,
                frames: frames.clone(),
                allowed: ctx.allowed.clone(),
            };
            let body = if Some(target) == merge {
                Region::Break { label: None }
            } else if self.emitted[target] {
                self.goto(target, "switch case reached twice")
            } else {
                self.walk(target, &case_ctx, false).0
            };
            cases.push(SwitchCase {
                keys: case_keys.get(&target).cloned().unwrap_or_default(),
                is_default: target == default_block,
                target,
                body,
            });
        }

        (Region::Switch { header: b, cases }, merge)
    }

    /// b から始まる、未処理で最も外側の try 範囲
    fn try_at(&self, b: BlockId) -> Option<usize> {
        self.cfg
            .try_regions
            .iter()
            .enumerate()
            .filter(|(i, r)| !self.tries_done[*i] && r.covered.first() == Some(&b))
            .max_by_key(|(_, r)| r.covered.len())
            .map(|(i, _)| i)
    }

    fn try_inside_loop(&self, try_index: usize, header: BlockId) -> bool {
        match self.dom.loop_at(header) {
            Some(l) => self.cfg.try_regions[try_index]
                .covered
                .iter()
                .all(|c| l.body.contains(c)),
            None => false,
        }
    }

    fn structure_try(
        &mut self,
        index: usize,
        ctx: &Ctx,
        items: &mut Vec<Region>,
        start_is_body: bool,
    ) -> Step {
        self.tries_done[index] = true;
        let region = self.cfg.try_regions[index].clone();
        let covered: BTreeSet<BlockId> = region.covered.iter().copied().collect();
        let handler_blocks: BTreeSet<BlockId> = region.handlers.iter().map(|h| h.block).collect();

        // 合流点: 範囲外への通常辺のうち最も前のもの
        let mut exits: Vec<BlockId> = covered
            .iter()
            .flat_map(|&c| self.cfg.blocks[c].successors.iter().copied())
            .filter(|s| !covered.contains(s) && !handler_blocks.contains(s))
            .collect();
        exits.sort_by_key(|&s| self.cfg.blocks[s].start_offset);
        exits.dedup();
        let merge = exits.first().copied().filter(|&m| ctx.accepts(m));

        let allowed: BTreeSet<BlockId> = match &ctx.allowed {
            Some(outer) => covered.intersection(outer).copied().collect(),
            None => covered.clone(),
        };
        let body_ctx = Ctx {
            follow: merge,
            frames: ctx.frames.clone(),
            allowed: Some(Rc::new(allowed)),
        };
        let Some(&start) = region.covered.first() else {
            return Step::Stop;
        };
        let (body, _) = self.walk(start, &body_ctx, start_is_body);

        let handler_ctx = ctx.with_follow(merge);
        let mut catches = Vec::new();
        let mut seen = BTreeSet::new();
        for h in &region.handlers {
            if !seen.insert(h.block) {
                continue;
            }
            let body = if self.emitted[h.block] {
                self.goto(h.block, "handler shared with another try")
            } else {
                self.walk(h.block, &handler_ctx, false).0
            };
            catches.push(CatchClause {
                exception: h.exception.clone(),
                block: h.block,
                body,
            });
        }

        items.push(Region::Try {
            body: Box::new(body),
            catches,
        });
        Step::Next(merge)
    }

    fn structure_loop(&mut self, header: BlockId, ctx: &Ctx, items: &mut Vec<Region>) -> Step {
        let Some(info) = self.dom.loop_at(header).cloned() else {
            return Step::Stop;
        };
        let body_set = Rc::new(info.body.clone());
        let cfg = self.cfg;
        let block = &cfg.blocks[header];

        let mut kind = LoopKind::Endless;
        let mut cond_block = None;
        let mut negated = false;
        let mut exit = None;
        let mut body_start = header;
        let mut first_is_body = true;

        if let (true, [fall, target]) = (block.ends_with_if(), block.successors.as_slice()) {
            let fall_in = body_set.contains(fall);
            let target_in = body_set.contains(target);
            let inner = if fall_in { *fall } else { *target };
            if fall_in != target_in && inner != header {
                kind = LoopKind::While;
                cond_block = Some(header);
                // 分岐成立で本体へ入るなら条件そのまま
                negated = !target_in;
                exit = Some(if fall_in { *target } else { *fall });
                body_start = inner;
                first_is_body = false;
            }
        }
        if kind == LoopKind::Endless {
            if let [latch] = info.latches.as_slice() {
                let latch_block = &cfg.blocks[*latch];
                if let (true, [fall, target]) =
                    (latch_block.ends_with_if(), latch_block.successors.as_slice())
                {
                    let outside = if *target == header {
                        Some((*fall, true))
                    } else if *fall == header {
                        Some((*target, false))
                    } else {
                        None
                    };
                    if let Some((out, cond_is_target)) = outside {
                        if !body_set.contains(&out) {
                            kind = LoopKind::DoWhile;
                            cond_block = Some(*latch);
                            negated = !cond_is_target;
                            exit = Some(out);
                        }
                    }
                }
            }
        }
        if kind == LoopKind::Endless {
            exit = self.endless_exit(&info.body);
        }

        let mut frames = ctx.frames.clone();
        frames.push(Frame::Loop {
            header,
            exit,
            body: body_set,
            cond_latch: if kind == LoopKind::DoWhile { cond_block } else { None },
        });
        let body_ctx = Ctx {
            follow: None,
            frames,
            allowed: ctx.allowed.clone(),
        };

        let (body, _) = if first_is_body {
            self.walk_loop_body(header, &body_ctx)
        } else {
            self.emitted[header] = true;
            self.walk(body_start, &body_ctx, false)
        };

        items.push(Region::Loop {
            kind,
            header,
            cond_block,
            negated,
            body: Box::new(flatten(strip_trailing_continue(body))),
        });
        Step::Next(exit)
    }

    /// do-while / 無限ループの本体（ヘッダー自身から）
    fn walk_loop_body(&mut self, header: BlockId, ctx: &Ctx) -> (Region, bool) {
        if let Some(Frame::Loop {
            cond_latch: Some(latch),
            ..
        }) = ctx.frames.last()
        {
            if *latch == header {
                self.emitted[header] = true;
                return (Region::Block(header), false);
            }
        }
        self.walk(header, ctx, true)
    }

    /// 無限ループの出口: 戻ってこない経路を除いた最初のループ外後続
    fn endless_exit(&self, body: &BTreeSet<BlockId>) -> Option<BlockId> {
        let mut ordered: Vec<BlockId> = body.iter().copied().collect();
        ordered.sort_by_key(|&b| self.dom.rpo_index(b));
        for b in ordered {
            for &s in &self.cfg.blocks[b].successors {
                if !body.contains(&s) && !self.is_terminal_path(s) {
                    return Some(s);
                }
            }
        }
        None
    }
}

/// 入れ子の Sequence を平らにする
fn flatten(region: Region) -> Region {
    match region {
        Region::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match flatten(item) {
                    Region::Sequence(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            if out.len() == 1 {
                out.pop().unwrap_or(Region::Sequence(Vec::new()))
            } else {
                Region::Sequence(out)
            }
        }
        other => other,
    }
}

fn strip_trailing_continue(region: Region) -> Region {
    match region {
        Region::Continue { label: None } => Region::Sequence(Vec::new()),
        Region::Sequence(mut items) => {
            if matches!(items.last(), Some(Region::Continue { label: None })) {
                items.pop();
            }
            Region::Sequence(items)
        }
        other => other,
    }
}

/// CFGを構造化する
pub fn structure_method(cfg: &ControlFlowGraph) -> StructuredMethod {
    let dom = DominanceTree::compute(cfg);
    ControlFlowStructurer::new(cfg, &dom).structure()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::insn::{CmpOp, Insn, InsnArg, RegisterArg};
    use crate::decompiler::loader::{CatchHandler, TryBlock};

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
            vec![InsnArg::lit(1, ArgType::Int)],
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

    fn structure(insns: Vec<Insn>, tries: &[TryBlock], code_len: Offset) -> StructuredMethod {
        let cfg = ControlFlowGraph::build(insns, tries, code_len).unwrap();
        structure_method(&cfg)
    }

    #[test]
    fn test_if_else_reconverges() {
        let s = structure(
            vec![
                if_z(0, 3, 0),
                konst(1, 1),
                goto(4, 2),
                konst(1, 3),
                ret(4),
            ],
            &[],
            5,
        );
        assert!(!s.root.has_fallback());
        assert!(s.diagnostics.is_empty());
        match &s.root {
            Region::Sequence(items) => {
                assert!(matches!(
                    &items[0],
                    Region::If {
                        header: 0,
                        negated: true,
                        else_region: Some(_),
                        ..
                    }
                ));
                assert_eq!(items[1], Region::Block(3));
            }
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_if_without_else() {
        // if (r0 == 0) goto 2; r1 = 1; return
        let s = structure(vec![if_z(0, 2, 0), konst(1, 1), ret(2)], &[], 3);
        match &s.root {
            Region::Sequence(items) => match &items[0] {
                Region::If {
                    negated,
                    then_region,
                    else_region,
                    ..
                } => {
                    assert!(*negated);
                    assert_eq!(**then_region, Region::Block(1));
                    assert!(else_region.is_none());
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_while_loop() {
        // 0: if r0 == 0 -> 3 ; 1: const ; 2: goto 0 ; 3: return
        let s = structure(vec![if_z(0, 3, 0), konst(1, 1), goto(0, 2), ret(3)], &[], 4);
        assert!(!s.root.has_fallback());
        match &s.root {
            Region::Sequence(items) => {
                match &items[0] {
                    Region::Loop {
                        kind,
                        cond_block,
                        negated,
                        body,
                        ..
                    } => {
                        assert_eq!(*kind, LoopKind::While);
                        assert_eq!(*cond_block, Some(0));
                        // 分岐成立で抜けるので条件は反転
                        assert!(*negated);
                        assert_eq!(**body, Region::Block(1));
                    }
                    other => panic!("unexpected {:?}", other),
                }
                assert_eq!(items[1], Region::Block(2));
            }
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_do_while_loop() {
        // 0: const ; 1: if r0 == 0 -> 0 ; 2: return
        let s = structure(vec![konst(1, 0), if_z(0, 0, 1), ret(2)], &[], 3);
        match &s.root {
            Region::Sequence(items) => match &items[0] {
                Region::Loop {
                    kind,
                    cond_block,
                    negated,
                    body,
                    ..
                } => {
                    assert_eq!(*kind, LoopKind::DoWhile);
                    assert_eq!(*cond_block, Some(0));
                    assert!(!*negated);
                    assert_eq!(**body, Region::Block(0));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_break_out_of_endless_loop() {
        // ループ出口の return は入口の if からも到達する
        let s = structure(
            vec![
                if_z(0, 6, 0),
                konst(1, 1),
                goto(3, 2),
                if_z(1, 6, 3),
                konst(2, 4),
                goto(1, 5),
                ret(6),
            ],
            &[],
            7,
        );
        assert!(!s.root.has_fallback());
        let mut kinds = Vec::new();
        s.root.visit(&mut |r| {
            if let Region::Loop { kind, .. } = r {
                kinds.push(*kind);
            }
        });
        assert_eq!(kinds, vec![LoopKind::Endless]);
        let mut breaks = 0;
        s.root.visit(&mut |r| {
            if matches!(r, Region::Break { label: None }) {
                breaks += 1;
            }
        });
        assert_eq!(breaks, 1);
    }

    #[test]
    fn test_switch_cases_ordered_by_offset() {
        let switch = Insn::new(
            InsnKind::Switch {
                keys: vec![1, 2],
                targets: vec![4, 2],
                default: None,
            },
            vec![InsnArg::reg(0)],
            None,
            0,
        );
        // 0: switch ; 1: goto 6 ; 2: const ; 3: goto 6 ; 4: const ; 5: goto 6 ; 6: return
        let s = structure(
            vec![
                switch,
                goto(6, 1),
                konst(1, 2),
                goto(6, 3),
                konst(1, 4),
                goto(6, 5),
                ret(6),
            ],
            &[],
            7,
        );
        assert!(!s.root.has_fallback());
        let mut found = false;
        s.root.visit(&mut |r| {
            if let Region::Switch { cases, .. } = r {
                found = true;
                let keys: Vec<Vec<i32>> = cases.iter().map(|c| c.keys.clone()).collect();
                assert_eq!(keys, vec![vec![], vec![2], vec![1]]);
                assert!(cases[0].is_default);
            }
        });
        assert!(found);
    }

    #[test]
    fn test_try_catch_region() {
        let tries = vec![TryBlock {
            start: 0,
            end: 2,
            handlers: vec![CatchHandler {
                exception: Some(ArgType::object("java/lang/Exception")),
                target: 3,
            }],
        }];
        let exc = Insn::new(InsnKind::MoveException(None), vec![], Some(RegisterArg::new(2)), 3);
        // 0: const ; 1: goto 4 | 3: move-exception ; 4: return
        let s = structure(
            vec![konst(1, 0), goto(4, 1), Insn::new(InsnKind::Nop, vec![], None, 2), exc, ret(4)],
            &tries,
            5,
        );
        let mut found = false;
        s.root.visit(&mut |r| {
            if let Region::Try { catches, .. } = r {
                found = true;
                assert_eq!(catches.len(), 1);
            }
        });
        assert!(found);
        assert!(!s.root.has_fallback());
    }

    #[test]
    fn test_irreducible_falls_back_to_raw() {
        let s = structure(
            vec![if_z(0, 3, 0), konst(1, 1), goto(3, 2), if_z(1, 1, 3), ret(4)],
            &[],
            5,
        );
        assert!(s.irreducible);
        assert!(s.root.has_fallback());
        assert_eq!(s.diagnostics[0].kind, DiagnosticKind::StructuringFallback);
        assert!(s.labels.contains(&1));
    }
}
