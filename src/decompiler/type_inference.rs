/// 型推論エンジン
/// Def-Use の web ごとに型を決め、レジスタ引数へ書き戻す
///
/// - 定義側の型を昇格束で合流し（ワークリスト、反復回数の上限つき）
/// - 使用側のヒントは下界として交わりを取り、未確定（Narrow）の型の絞り込みにだけ使う
/// - 参照型の合流はクラス階層の共通上位型。見つからなければ Conflict として記録する

use crate::decompiler::cfg::ControlFlowGraph;
use crate::decompiler::dataflow::{DefSite, DefUseChain, UseId};
use crate::decompiler::hierarchy::ClassHierarchy;
use crate::decompiler::insn::{Insn, InsnArg, InsnKind, RegNum, VarId};
use crate::decompiler::types::{
    ArgType, PrimitiveSet, JAVA_LANG_CLASS, JAVA_LANG_OBJECT, JAVA_LANG_STRING, JAVA_LANG_THROWABLE,
};
use crate::error::{Diagnostic, DiagnosticKind};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// 型推論の結果
#[derive(Debug, Clone, Default)]
pub struct TypeInferenceResult {
    /// 変数ごとの確定型
    pub var_types: Vec<ArgType>,
    /// 変数ごとのレジスタ番号
    pub var_regs: Vec<RegNum>,
    /// 入口定義（受け取り側・引数）の変数
    pub entry_vars: Vec<VarId>,
    pub diagnostics: Vec<Diagnostic>,
    /// ワークリストの処理回数
    pub iterations: usize,
}

/// 定義の型の出どころ
#[derive(Debug, Clone)]
enum DefSource {
    Fixed(ArgType),
    /// 使用の変数の型をそのまま受け取る（move）
    Copy(UseId),
    /// 配列の要素型（ヒント付き）
    Element { array: UseId, hint: ArgType },
    /// 複数の値の合流（三項演算子）
    Join { uses: Vec<UseId>, fixed: Vec<ArgType> },
}

#[derive(Debug, Clone)]
struct DefItem {
    var: VarId,
    source: DefSource,
}

/// 型推論器
pub struct TypeInference<'a> {
    hierarchy: &'a ClassHierarchy,
    max_iterations: usize,
    conflicts: BTreeSet<VarId>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> TypeInference<'a> {
    pub fn new(hierarchy: &'a ClassHierarchy, max_iterations: usize) -> Self {
        Self {
            hierarchy,
            max_iterations,
            conflicts: BTreeSet::new(),
            diagnostics: Vec::new(),
        }
    }

    /// 型を推論して CFG のレジスタ引数へ書き戻す
    ///
    /// `entry_types` は Def-Use 構築時の入口定義と同じ順序。
    pub fn run(
        mut self,
        cfg: &mut ControlFlowGraph,
        chain: &DefUseChain,
        entry_types: &[ArgType],
        return_type: &ArgType,
    ) -> TypeInferenceResult {
        let webs = chain.webs();
        let var_count = webs.var_count();
        let mut types = vec![ArgType::Unknown; var_count];

        // 入口定義は宣言型で固定
        for (d, ty) in entry_types.iter().enumerate() {
            if let Some(&v) = webs.def_var.get(d) {
                types[v as usize] = ty.clone();
            }
        }

        let mut items = Vec::new();
        for (d, def) in chain.defs.iter().enumerate() {
            let DefSite::Insn { block, pos } = def.site else {
                continue;
            };
            let insn = &cfg.blocks[block].insns[pos];
            items.push(DefItem {
                var: webs.def_var[d],
                source: def_source(insn, chain, block, pos),
            });
        }

        // 依存: 変数 → その変数を読む定義項目
        let mut dependents: HashMap<VarId, Vec<usize>> = HashMap::new();
        for (i, item) in items.iter().enumerate() {
            for u in item.source.reads() {
                if let Some(v) = webs.use_var[u] {
                    dependents.entry(v).or_default().push(i);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..items.len()).collect();
        let mut queued = vec![true; items.len()];
        let mut iterations = 0;
        while let Some(i) = queue.pop_front() {
            queued[i] = false;
            iterations += 1;
            if iterations > self.max_iterations {
                warn!("Type inference stopped after {} iterations", self.max_iterations);
                self.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::TypeIterationLimit,
                    format!("type propagation stopped after {} steps", self.max_iterations),
                ));
                break;
            }
            let item = &items[i];
            let incoming = self.evaluate(&item.source, &types, &webs.use_var);
            let v = item.var as usize;
            let joined = self.join_var(item.var, &types[v], &incoming);
            if joined != types[v] {
                types[v] = joined;
                for &dep in dependents.get(&item.var).map(|d| d.as_slice()).unwrap_or(&[]) {
                    if !queued[dep] {
                        queued[dep] = true;
                        queue.push_back(dep);
                    }
                }
            }
        }

        // 使用側の下界
        let mut bounds = vec![ArgType::Unknown; var_count];
        for (u, site) in chain.uses.iter().enumerate() {
            let Some(v) = webs.use_var[u] else { continue };
            let insn = &cfg.blocks[site.block].insns[site.pos];
            let hint = use_hint(insn, &site.path, return_type);
            bounds[v as usize] = self.meet(&bounds[v as usize], &hint);
        }
        // move の行き先の下界を元へ戻す
        let copies: Vec<(VarId, VarId)> = items
            .iter()
            .filter_map(|item| match item.source {
                DefSource::Copy(u) => webs.use_var[u].map(|src| (src, item.var)),
                _ => None,
            })
            .collect();
        for _ in 0..copies.len().min(self.max_iterations) {
            let mut changed = false;
            for &(src, dst) in &copies {
                let merged = self.meet(&bounds[src as usize], &bounds[dst as usize]);
                if merged != bounds[src as usize] {
                    bounds[src as usize] = merged;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let var_types: Vec<ArgType> = (0..var_count)
            .map(|v| self.resolve(v as VarId, &types[v], &bounds[v]))
            .collect();

        write_back(cfg, chain, &webs.def_var, &webs.use_var, &var_types);

        debug!(
            "Type inference: {} vars, {} iterations, {} conflicts",
            var_count,
            iterations,
            self.conflicts.len()
        );
        TypeInferenceResult {
            var_types,
            var_regs: webs.var_regs.clone(),
            entry_vars: webs.def_var.iter().take(entry_types.len()).copied().collect(),
            diagnostics: self.diagnostics,
            iterations,
        }
    }

    fn evaluate(&mut self, source: &DefSource, types: &[ArgType], use_var: &[Option<VarId>]) -> ArgType {
        let var_type = |u: UseId| -> ArgType {
            use_var[u]
                .map(|v| types[v as usize].clone())
                .unwrap_or_default()
        };
        match source {
            DefSource::Fixed(ty) => ty.clone(),
            DefSource::Copy(u) => var_type(*u),
            DefSource::Element { array, hint } => match var_type(*array) {
                ArgType::Array(elem) => match hint {
                    ArgType::Narrow(set) if !set.intersects(elem.candidate_flag()) => hint.clone(),
                    _ => *elem,
                },
                _ => hint.clone(),
            },
            DefSource::Join { uses, fixed } => {
                let mut acc = ArgType::Unknown;
                for ty in uses.iter().map(|&u| var_type(u)).chain(fixed.iter().cloned()) {
                    acc = self.join(&acc, &ty);
                }
                acc
            }
        }
    }

    fn join_var(&mut self, var: VarId, a: &ArgType, b: &ArgType) -> ArgType {
        let joined = self.join(a, b);
        if joined == ArgType::Conflict && *a != ArgType::Conflict && *b != ArgType::Conflict {
            self.report_conflict(var, a, b);
        }
        joined
    }

    fn report_conflict(&mut self, var: VarId, a: &ArgType, b: &ArgType) {
        if self.conflicts.insert(var) {
            warn!("Type conflict for variable {}: {} vs {}", var, a, b);
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::TypeConflict,
                format!("variable {} has incompatible types {} and {}", var, a, b),
            ));
        }
    }

    /// 定義の合流（昇格束の上限）
    pub fn join(&self, a: &ArgType, b: &ArgType) -> ArgType {
        use ArgType::*;
        match (a, b) {
            (Unknown, x) | (x, Unknown) => x.clone(),
            (Conflict, _) | (_, Conflict) => Conflict,
            _ if a == b => a.clone(),
            (Narrow(x), Narrow(y)) => {
                let common = *x & *y;
                if common.is_empty() {
                    Conflict
                } else {
                    Narrow(common)
                }
            }
            (Narrow(set), t) | (t, Narrow(set)) => {
                if set.intersects(t.candidate_flag()) {
                    t.clone()
                } else if t.is_primitive() && set.intersects(PrimitiveSet::INTEGRAL | PrimitiveSet::WIDE | PrimitiveSet::FLOAT) {
                    join_primitive(&ArgType::default_for(*set), t)
                } else {
                    Conflict
                }
            }
            (Object(x), Object(y)) => self
                .hierarchy
                .common_supertype(x, y)
                .map(Object)
                .unwrap_or(Conflict),
            (Array(x), Array(y)) => {
                if x.is_reference() && y.is_reference() {
                    match self.join(x, y) {
                        Conflict => Object(JAVA_LANG_OBJECT.to_string()),
                        elem => ArgType::array_of(elem),
                    }
                } else {
                    Object(JAVA_LANG_OBJECT.to_string())
                }
            }
            (Array(_), Object(name)) | (Object(name), Array(_)) => match name.as_str() {
                JAVA_LANG_OBJECT | "java.lang.Cloneable" | "java.io.Serializable" => Object(name.clone()),
                _ => Conflict,
            },
            _ if a.is_primitive() && b.is_primitive() => join_primitive(a, b),
            _ => Conflict,
        }
    }

    /// 使用側の制約の交わり（より具体的な方）
    pub fn meet(&self, a: &ArgType, b: &ArgType) -> ArgType {
        use ArgType::*;
        match (a, b) {
            (Unknown, x) | (x, Unknown) => x.clone(),
            (Conflict, x) | (x, Conflict) => x.clone(),
            _ if a == b => a.clone(),
            (Narrow(x), Narrow(y)) => {
                let common = *x & *y;
                if common.is_empty() {
                    a.clone()
                } else {
                    Narrow(common)
                }
            }
            (Narrow(_), t) | (t, Narrow(_)) => t.clone(),
            (Object(x), Object(y)) => {
                if self.hierarchy.is_subtype(y, x) {
                    b.clone()
                } else {
                    a.clone()
                }
            }
            (Object(_), Array(_)) => b.clone(),
            _ => a.clone(),
        }
    }

    /// 定義の型と使用の下界から最終的な型を決める
    fn resolve(&mut self, var: VarId, def: &ArgType, bound: &ArgType) -> ArgType {
        match def {
            ArgType::Unknown => match bound {
                ArgType::Narrow(set) => ArgType::default_for(*set),
                other => other.clone(),
            },
            ArgType::Narrow(set) => match bound {
                ArgType::Narrow(b) if set.intersects(*b) => ArgType::default_for(*set & *b),
                t if t.is_known() => {
                    if set.intersects(t.candidate_flag()) {
                        t.clone()
                    } else {
                        self.report_conflict(var, def, t);
                        ArgType::default_for(*set)
                    }
                }
                _ => ArgType::default_for(*set),
            },
            other => other.clone(),
        }
    }
}

/// プリミティブの昇格
fn join_primitive(a: &ArgType, b: &ArgType) -> ArgType {
    use ArgType::*;
    fn rank(t: &ArgType) -> Option<u8> {
        Some(match t {
            Byte => 1,
            Short | Char => 2,
            Int => 3,
            Long => 4,
            Float => 5,
            Double => 6,
            _ => return None,
        })
    }
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (Boolean, _) | (_, Boolean) => Conflict,
        (Char, Byte | Short) | (Byte | Short, Char) => Int,
        _ => match (rank(a), rank(b)) {
            (Some(x), Some(y)) => {
                if x >= y {
                    a.clone()
                } else {
                    b.clone()
                }
            }
            _ => Conflict,
        },
    }
}

impl DefSource {
    fn reads(&self) -> Vec<UseId> {
        match self {
            DefSource::Fixed(_) => Vec::new(),
            DefSource::Copy(u) => vec![*u],
            DefSource::Element { array, .. } => vec![*array],
            DefSource::Join { uses, .. } => uses.clone(),
        }
    }
}

/// 命令が定義する値の型
fn def_source(insn: &Insn, chain: &DefUseChain, block: usize, pos: usize) -> DefSource {
    use crate::decompiler::insn::ArgSlot;
    let hint = insn.result.as_ref().map(|r| r.ty.clone()).unwrap_or_default();
    let use_of = |slot: ArgSlot| chain.use_at(block, pos, &[slot]);
    let fixed = match &insn.kind {
        InsnKind::Move => {
            return match use_of(ArgSlot::Arg(0)) {
                Some(u) if hint == ArgType::Unknown || matches!(hint, ArgType::Narrow(_)) => {
                    if hint == ArgType::Unknown {
                        DefSource::Copy(u)
                    } else {
                        DefSource::Join {
                            uses: vec![u],
                            fixed: vec![hint],
                        }
                    }
                }
                _ => DefSource::Fixed(hint),
            };
        }
        InsnKind::ArrayGet(elem) => {
            return match use_of(ArgSlot::Arg(0)) {
                Some(array) => DefSource::Element {
                    array,
                    hint: elem.clone(),
                },
                None => DefSource::Fixed(elem.clone()),
            };
        }
        InsnKind::Ternary(_) => {
            let mut uses = Vec::new();
            let mut fixed = Vec::new();
            for (i, arg) in insn.args.iter().enumerate() {
                match arg {
                    InsnArg::Register(_) => uses.extend(use_of(ArgSlot::Arg(i))),
                    other => fixed.push(other.arg_type()),
                }
            }
            return DefSource::Join { uses, fixed };
        }
        InsnKind::Const => insn.args.first().map(|a| a.arg_type()).unwrap_or(hint),
        InsnKind::ConstString(_) => ArgType::object(JAVA_LANG_STRING),
        InsnKind::ConstClass(_) => ArgType::object(JAVA_LANG_CLASS),
        InsnKind::MoveException(ty) => ty
            .clone()
            .unwrap_or_else(|| ArgType::object(JAVA_LANG_THROWABLE)),
        InsnKind::CheckCast(ty)
        | InsnKind::NewInstance(ty)
        | InsnKind::NewArray(ty)
        | InsnKind::FilledNewArray(ty) => ty.clone(),
        InsnKind::InstanceOf(_) => ArgType::Boolean,
        InsnKind::ArrayLength => ArgType::Int,
        InsnKind::Cmp(_) => ArgType::Int,
        InsnKind::Arith { op, ty } => {
            // and/or/xor の int は boolean の演算にも使われる
            if *ty == ArgType::Int && op.is_bitwise() {
                ArgType::Narrow(PrimitiveSet::NARROW_INTEGRAL)
            } else {
                ty.clone()
            }
        }
        InsnKind::Neg(ty) | InsnKind::Not(ty) => ty.clone(),
        InsnKind::Cast { to, .. } => to.clone(),
        InsnKind::InstanceGet(f) | InsnKind::StaticGet(f) => f.ty.clone(),
        InsnKind::Invoke { method, .. } => method.ret.clone(),
        InsnKind::Construct { method } => ArgType::object(&method.class),
        _ => hint,
    };
    DefSource::Fixed(fixed)
}

/// 使用箇所の期待型
fn use_hint(insn: &Insn, path: &[crate::decompiler::insn::ArgSlot], return_type: &ArgType) -> ArgType {
    let declared = insn
        .arg_at_path(path)
        .and_then(|a| a.as_register())
        .map(|r| r.ty.clone())
        .unwrap_or_default();
    if path.len() == 1 {
        match &insn.kind {
            InsnKind::Return => return return_type.clone(),
            InsnKind::Throw => return ArgType::object(JAVA_LANG_THROWABLE),
            InsnKind::MonitorEnter | InsnKind::MonitorExit => {
                return ArgType::object(JAVA_LANG_OBJECT)
            }
            _ => {}
        }
    }
    declared
}

/// 推論結果を定義・使用のレジスタ引数へ書き戻す
fn write_back(
    cfg: &mut ControlFlowGraph,
    chain: &DefUseChain,
    def_var: &[VarId],
    use_var: &[Option<VarId>],
    var_types: &[ArgType],
) {
    for (d, def) in chain.defs.iter().enumerate() {
        let DefSite::Insn { block, pos } = def.site else {
            continue;
        };
        let var = def_var[d];
        let ty = var_types[var as usize].clone();
        let insn = &mut cfg.blocks[block].insns[pos];
        if insn.kind == InsnKind::Const {
            if let Some(InsnArg::Literal(lit)) = insn.args.first_mut() {
                lit.ty = ty.clone();
            }
        }
        if let Some(result) = &mut insn.result {
            result.wide = result.wide || ty.is_wide();
            result.ty = ty;
            result.var = Some(var);
        }
    }

    for (u, site) in chain.uses.iter().enumerate() {
        let Some(var) = use_var[u] else { continue };
        let insn = &mut cfg.blocks[site.block].insns[site.pos];
        if let Some(InsnArg::Register(r)) = insn.arg_at_path_mut(&site.path) {
            r.ty = var_types[var as usize].clone();
            r.wide = r.wide || r.ty.is_wide();
            r.var = Some(var);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::insn::{ArgSlot, CmpOp, InvokeKind, Offset, RegisterArg};
    use crate::decompiler::pool::MethodRef;

    fn konst(reg: u16, value: i64, offset: Offset) -> Insn {
        let ty = ArgType::Narrow(crate::decompiler::types::literal_candidates(value, false));
        Insn::new(
            InsnKind::Const,
            vec![InsnArg::lit(value, ty.clone())],
            Some(RegisterArg::typed(reg, ty)),
            offset,
        )
    }

    fn infer(
        insns: Vec<Insn>,
        code_len: Offset,
        entry: &[(u16, ArgType)],
        ret: ArgType,
        hierarchy: &ClassHierarchy,
    ) -> (ControlFlowGraph, TypeInferenceResult) {
        let mut cfg = ControlFlowGraph::build(insns, &[], code_len).unwrap();
        let entry_args: Vec<RegisterArg> = entry
            .iter()
            .map(|(r, t)| RegisterArg::typed(*r, t.clone()))
            .collect();
        let entry_types: Vec<ArgType> = entry.iter().map(|(_, t)| t.clone()).collect();
        let chain = DefUseChain::build(&cfg, &entry_args);
        let result = TypeInference::new(hierarchy, 10_000).run(&mut cfg, &chain, &entry_types, &ret);
        (cfg, result)
    }

    #[test]
    fn test_literal_refined_by_return_type() {
        let h = ClassHierarchy::empty();
        let insns = vec![
            konst(0, 1, 0),
            Insn::new(InsnKind::Return, vec![InsnArg::reg(0)], None, 1),
        ];
        let (cfg, result) = infer(insns, 2, &[], ArgType::Boolean, &h);
        assert_eq!(result.var_types, vec![ArgType::Boolean]);
        let lit = match &cfg.blocks[0].insns[0].args[0] {
            InsnArg::Literal(l) => l.ty.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(lit, ArgType::Boolean);
        assert_eq!(cfg.blocks[0].insns[1].args[0].as_register().unwrap().var, Some(0));
    }

    #[test]
    fn test_zero_literal_becomes_null_reference() {
        let h = ClassHierarchy::empty();
        let method = MethodRef::parse("Foo", "use", "(Ljava/lang/String;)V").unwrap();
        let insns = vec![
            konst(0, 0, 0),
            Insn::new(
                InsnKind::Invoke {
                    kind: InvokeKind::Static,
                    method,
                },
                vec![InsnArg::typed_reg(0, ArgType::object("java/lang/String"))],
                None,
                1,
            ),
            Insn::new(InsnKind::Return, vec![], None, 4),
        ];
        let (_, result) = infer(insns, 5, &[], ArgType::Void, &h);
        assert_eq!(result.var_types[0], ArgType::object("java.lang.String"));
    }

    #[test]
    fn test_literal_without_bounds_defaults_to_int() {
        let h = ClassHierarchy::empty();
        let insns = vec![
            konst(0, 300, 0),
            Insn::new(
                InsnKind::If {
                    op: CmpOp::Eq,
                    target: 2,
                },
                vec![InsnArg::reg(0)],
                None,
                1,
            ),
            Insn::new(InsnKind::Return, vec![], None, 2),
        ];
        let (_, result) = infer(insns, 3, &[], ArgType::Void, &h);
        assert_eq!(result.var_types[0], ArgType::Int);
    }

    #[test]
    fn test_reference_merge_uses_common_supertype() {
        let h = ClassHierarchy::from_classes(vec![
            crate::decompiler::hierarchy::ClassInfo::new("a.Base", None),
            crate::decompiler::hierarchy::ClassInfo::new("a.Left", Some("a.Base")),
            crate::decompiler::hierarchy::ClassInfo::new("a.Right", Some("a.Base")),
        ]);
        // if (p0 == 0) r1 = new Left else r1 = new Right; return r1
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
            Insn::new(
                InsnKind::NewInstance(ArgType::object("a.Left")),
                vec![],
                Some(RegisterArg::new(1)),
                1,
            ),
            Insn::new(InsnKind::Goto { target: 4 }, vec![], None, 2),
            Insn::new(
                InsnKind::NewInstance(ArgType::object("a.Right")),
                vec![],
                Some(RegisterArg::new(1)),
                3,
            ),
            Insn::new(InsnKind::Return, vec![InsnArg::reg(1)], None, 4),
        ];
        let (_, result) = infer(insns, 5, &[(0, ArgType::Int)], ArgType::object("a.Base"), &h);
        assert_eq!(result.var_types[1], ArgType::object("a.Base"));
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_unrelated_references_conflict() {
        let h = ClassHierarchy::empty();
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
            Insn::new(
                InsnKind::NewInstance(ArgType::object("x.A")),
                vec![],
                Some(RegisterArg::new(1)),
                1,
            ),
            Insn::new(InsnKind::Goto { target: 4 }, vec![], None, 2),
            Insn::new(
                InsnKind::ConstString("s".into()),
                vec![],
                Some(RegisterArg::new(1)),
                3,
            ),
            Insn::new(InsnKind::Return, vec![InsnArg::reg(1)], None, 4),
        ];
        let (_, result) = infer(insns, 5, &[(0, ArgType::Int)], ArgType::object("x.A"), &h);
        assert_eq!(result.var_types[1], ArgType::Conflict);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].kind, DiagnosticKind::TypeConflict);
    }

    #[test]
    fn test_move_copies_type_and_widening() {
        let h = ClassHierarchy::empty();
        let t = TypeInference::new(&h, 10);
        assert_eq!(t.join(&ArgType::Byte, &ArgType::Int), ArgType::Int);
        assert_eq!(t.join(&ArgType::Char, &ArgType::Short), ArgType::Int);
        assert_eq!(t.join(&ArgType::Long, &ArgType::Float), ArgType::Float);
        assert_eq!(t.join(&ArgType::Boolean, &ArgType::Int), ArgType::Conflict);

        let insns = vec![
            Insn::new(
                InsnKind::StaticGet(crate::decompiler::pool::FieldRef {
                    class: "Foo".into(),
                    name: "x".into(),
                    ty: ArgType::Short,
                }),
                vec![],
                Some(RegisterArg::new(0)),
                0,
            ),
            Insn::new(InsnKind::Move, vec![InsnArg::reg(0)], Some(RegisterArg::new(1)), 2),
            Insn::new(InsnKind::Return, vec![InsnArg::reg(1)], None, 3),
        ];
        let (cfg, result) = infer(insns, 4, &[], ArgType::Short, &h);
        assert_eq!(result.var_types, vec![ArgType::Short, ArgType::Short]);
        let moved = cfg.blocks[0].insns[1].arg_at_path(&[ArgSlot::Arg(0)]).unwrap();
        assert_eq!(moved.as_register().unwrap().ty, ArgType::Short);
    }

    #[test]
    fn test_iteration_guard() {
        let h = ClassHierarchy::empty();
        let insns = vec![
            konst(0, 1, 0),
            Insn::new(InsnKind::Move, vec![InsnArg::reg(0)], Some(RegisterArg::new(1)), 1),
            Insn::new(InsnKind::Return, vec![InsnArg::reg(1)], None, 2),
        ];
        let mut cfg = ControlFlowGraph::build(insns, &[], 3).unwrap();
        let chain = DefUseChain::build(&cfg, &[]);
        let result = TypeInference::new(&h, 1).run(&mut cfg, &chain, &[], &ArgType::Int);
        assert_eq!(
            result.diagnostics.last().map(|d| d.kind),
            Some(DiagnosticKind::TypeIterationLimit)
        );
    }
}
