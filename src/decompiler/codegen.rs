/// コード生成
/// 構造化済みの領域木とインライン化済みの式木を Java 風のソースへ出力する
///
/// 出力は2パスで行う。1回目は捨てるライターに書きながら変数の出現位置
/// （スコープの経路）を集め、宣言位置を決める。2回目で実際に書く。
/// どちらのパスも同じ順でスコープ番号を振るので、宣言位置は2回目にそのまま使える。
/// 解析は一切しない。読み取れないもの（定義のないレジスタ、畳み込まれなかった
/// コンストラクタ）は診断として返す。

use crate::decompiler::cfg::{BlockId, ControlFlowGraph};
use crate::decompiler::control_flow::{
    label_name, CatchClause, LoopKind, Region, StructuredMethod, SwitchCase,
};
use crate::decompiler::insn::{ArithOp, CmpOp, Insn, InsnArg, InsnKind, InvokeKind, RegisterArg, VarId};
use crate::decompiler::pool::{access, MethodRef, MethodSignature};
use crate::decompiler::printer::{dump_raw, CodeAnnotation, CodeOutput, CodeWriter, DeclKind};
use crate::decompiler::type_inference::TypeInferenceResult;
use crate::decompiler::types::{
    short_class_name, simple_class_name, ArgType, JAVA_LANG_OBJECT, JAVA_LANG_THROWABLE,
};
use crate::error::{Diagnostic, DiagnosticKind};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

// 演算子の優先順位（大きいほど強く結合する）
const PREC_NONE: u8 = 0;
const PREC_TERNARY: u8 = 2;
const PREC_BIT_OR: u8 = 5;
const PREC_BIT_XOR: u8 = 6;
const PREC_BIT_AND: u8 = 7;
const PREC_EQUALITY: u8 = 8;
const PREC_RELATIONAL: u8 = 9;
const PREC_SHIFT: u8 = 10;
const PREC_ADDITIVE: u8 = 11;
const PREC_MULTIPLICATIVE: u8 = 12;
const PREC_UNARY: u8 = 13;
const PREC_POSTFIX: u8 = 15;

const JAVA_KEYWORDS: &[&str] = &[
    "abstract", "assert", "boolean", "break", "byte", "case", "catch", "char", "class", "const",
    "continue", "default", "do", "double", "else", "enum", "extends", "final", "finally", "float",
    "for", "goto", "if", "implements", "import", "instanceof", "int", "interface", "long", "native",
    "new", "package", "private", "protected", "public", "return", "short", "static", "strictfp",
    "super", "switch", "synchronized", "this", "throw", "throws", "transient", "try", "void",
    "volatile", "while", "true", "false", "null",
];

/// 出力するメソッドの文脈
#[derive(Debug, Clone)]
pub struct MethodContext<'a> {
    pub sig: &'a MethodSignature,
    /// 変数ごとの型
    pub var_types: &'a [ArgType],
    pub this_var: Option<VarId>,
    /// 宣言順の引数の変数
    pub param_vars: Vec<Option<VarId>>,
}

impl<'a> MethodContext<'a> {
    /// 型推論結果の入口変数（受け取り側、引数の順）から作る
    pub fn new(sig: &'a MethodSignature, types: &'a TypeInferenceResult) -> Self {
        let mut entry = types.entry_vars.iter().copied();
        let this_var = if sig.is_static() { None } else { entry.next() };
        let param_vars = sig.params.iter().map(|_| entry.next()).collect();
        Self {
            sig,
            var_types: &types.var_types,
            this_var,
            param_vars,
        }
    }

    fn is_entry(&self, var: VarId) -> bool {
        self.this_var == Some(var) || self.param_vars.contains(&Some(var))
    }
}

/// コード生成の設定
#[derive(Debug, Clone, Copy)]
pub struct CodegenOptions {
    pub indent: usize,
    pub emit_offsets: bool,
    /// 先頭のインデント段数（クラスのメンバーなら 1）
    pub base_indent: usize,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            indent: 4,
            emit_offsets: false,
            base_indent: 0,
        }
    }
}

/// メソッド本体を出力する（出力と、出力中に見つかった診断）
pub fn generate_method(
    cfg: &ControlFlowGraph,
    structured: &StructuredMethod,
    ctx: &MethodContext<'_>,
    options: &CodegenOptions,
) -> (CodeOutput, Vec<Diagnostic>) {
    let mut gen = MethodGen::new(cfg, structured, ctx, options);
    gen.render_method();
    gen.plan_declarations();
    gen.start_emit();
    gen.render_method();
    let diagnostics = std::mem::take(&mut gen.diagnostics);
    (gen.w.finish(), diagnostics)
}

/// 本体のないメソッド（abstract / native）の宣言
pub fn generate_declaration(sig: &MethodSignature, options: &CodegenOptions) -> CodeOutput {
    let mut w = new_writer(options);
    write_signature(&mut w, sig, &declared_param_names(sig));
    w.add(";");
    w.finish()
}

/// デコンパイルに失敗したメソッド: 宣言と、理由つきの生ダンプ
pub fn generate_fallback(
    sig: &MethodSignature,
    reason: &str,
    listing: &[String],
    options: &CodegenOptions,
) -> CodeOutput {
    let mut w = new_writer(options);
    write_signature(&mut w, sig, &declared_param_names(sig));
    w.add(" {");
    w.inc_indent();
    dump_raw(&mut w, reason, listing);
    w.dec_indent();
    w.add_line("}");
    w.finish()
}

fn declared_param_names(sig: &MethodSignature) -> Vec<String> {
    let mut names = NameAllocator::default();
    sig.params.iter().map(|ty| names.alloc(&base_name(ty))).collect()
}

/// クラス宣言の見出し行（波括弧まで）
pub fn class_header(name: &str, super_class: Option<&str>, interfaces: &[String], access_flags: u32) -> String {
    let is_interface = access_flags & access::INTERFACE != 0;
    let mut out = String::new();
    if access_flags & access::PUBLIC != 0 {
        out.push_str("public ");
    }
    if !is_interface {
        if access_flags & access::ABSTRACT != 0 {
            out.push_str("abstract ");
        }
        if access_flags & access::FINAL != 0 {
            out.push_str("final ");
        }
    }
    out.push_str(if is_interface { "interface " } else { "class " });
    out.push_str(simple_class_name(name));
    if let Some(sup) = super_class.filter(|s| *s != JAVA_LANG_OBJECT && !is_interface) {
        out.push_str(" extends ");
        out.push_str(short_class_name(sup));
    }
    if !interfaces.is_empty() {
        out.push_str(if is_interface { " extends " } else { " implements " });
        let names: Vec<&str> = interfaces.iter().map(|i| short_class_name(i)).collect();
        out.push_str(&names.join(", "));
    }
    out.push_str(" {");
    out
}

fn new_writer(options: &CodegenOptions) -> CodeWriter {
    let mut w = CodeWriter::new(options.indent);
    for _ in 0..options.base_indent {
        w.inc_indent();
    }
    w
}

fn modifiers(flags: u32) -> String {
    let mut out = String::new();
    for (flag, word) in [
        (access::PUBLIC, "public "),
        (access::PROTECTED, "protected "),
        (access::PRIVATE, "private "),
        (access::ABSTRACT, "abstract "),
        (access::STATIC, "static "),
        (access::FINAL, "final "),
        (access::SYNCHRONIZED, "synchronized "),
        (access::NATIVE, "native "),
    ] {
        if flags & flag != 0 {
            out.push_str(word);
        }
    }
    out
}

/// `public int foo(int i, String str)` まで書く
fn write_signature(w: &mut CodeWriter, sig: &MethodSignature, params: &[String]) {
    w.start_line();
    if sig.is_class_initializer() {
        w.add("static");
        return;
    }
    w.add(&modifiers(sig.access_flags));
    let name = if sig.is_constructor() {
        simple_class_name(&sig.class).to_string()
    } else {
        w.add(&sig.ret.java_name());
        w.add(" ");
        sig.name.clone()
    };
    w.add_annotated(
        &name,
        CodeAnnotation::Declaration {
            kind: DeclKind::Method,
            name: name.clone(),
        },
    );
    w.add("(");
    for (i, (ty, pname)) in sig.params.iter().zip(params).enumerate() {
        if i > 0 {
            w.add(", ");
        }
        w.add(&ty.java_name());
        w.add(" ");
        w.add_annotated(
            pname,
            CodeAnnotation::Declaration {
                kind: DeclKind::Parameter,
                name: pname.clone(),
            },
        );
    }
    w.add(")");
}

/// 型から変数名の元を作る
fn base_name(ty: &ArgType) -> String {
    match ty.resolved() {
        ArgType::Boolean => "z".into(),
        ArgType::Byte => "b".into(),
        ArgType::Short => "s".into(),
        ArgType::Char => "c".into(),
        ArgType::Int => "i".into(),
        ArgType::Long => "j".into(),
        ArgType::Float => "f".into(),
        ArgType::Double => "d".into(),
        ArgType::Array(elem) => format!("{}Arr", base_name(&elem)),
        ArgType::Object(name) => object_base_name(&name),
        _ => "obj".into(),
    }
}

fn object_base_name(class: &str) -> String {
    let simple = simple_class_name(class);
    match simple {
        "String" => "str".into(),
        "StringBuilder" | "StringBuffer" => "sb".into(),
        "Object" => "obj".into(),
        "Class" => "cls".into(),
        "Throwable" => "th".into(),
        s if s.ends_with("Exception") || s.ends_with("Error") => "e".into(),
        s => {
            let mut chars = s.chars();
            let lowered = match chars.next() {
                Some(first) if first.is_ascii_alphabetic() => {
                    first.to_ascii_lowercase().to_string() + chars.as_str()
                }
                _ => return "obj".into(),
            };
            if JAVA_KEYWORDS.contains(&lowered.as_str()) {
                format!("{}Var", lowered)
            } else {
                lowered
            }
        }
    }
}

/// 重複しない名前を払い出す（i, i2, i3 ...）
#[derive(Debug, Default)]
struct NameAllocator {
    taken: HashSet<String>,
}

impl NameAllocator {
    fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_string());
    }

    fn alloc(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}{}", base, n);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// リテラルを型に合わせて書く
pub fn literal_text(value: i64, ty: &ArgType) -> String {
    match ty.resolved() {
        ArgType::Boolean => if value == 0 { "false" } else { "true" }.into(),
        ArgType::Char => char_literal(value),
        ArgType::Long => format!("{}L", value),
        ArgType::Float => float_literal(f32::from_bits(value as u32)),
        ArgType::Double => double_literal(f64::from_bits(value as u64)),
        ArgType::Object(_) | ArgType::Array(_) if value == 0 => "null".into(),
        ArgType::Int => (value as i32).to_string(),
        _ => value.to_string(),
    }
}

/// boolean のリテラル（定数ロードを含む）
fn bool_literal(arg: &InsnArg) -> Option<bool> {
    match arg {
        InsnArg::Literal(l) if l.ty.resolved() == ArgType::Boolean => Some(l.value != 0),
        InsnArg::Wrapped(insn) if insn.kind == InsnKind::Const => insn.args.first().and_then(bool_literal),
        _ => None,
    }
}

fn char_literal(value: i64) -> String {
    match u8::try_from(value) {
        Ok(b'\'') => "'\\''".into(),
        Ok(b'\\') => "'\\\\'".into(),
        Ok(b) if (0x20..0x7f).contains(&b) => format!("'{}'", b as char),
        _ => format!("'\\u{:04x}'", value as u16),
    }
}

fn float_literal(v: f32) -> String {
    if v.is_nan() {
        "Float.NaN".into()
    } else if v == f32::INFINITY {
        "Float.POSITIVE_INFINITY".into()
    } else if v == f32::NEG_INFINITY {
        "Float.NEGATIVE_INFINITY".into()
    } else {
        format!("{:?}f", v)
    }
}

fn double_literal(v: f64) -> String {
    if v.is_nan() {
        "Double.NaN".into()
    } else if v == f64::INFINITY {
        "Double.POSITIVE_INFINITY".into()
    } else if v == f64::NEG_INFINITY {
        "Double.NEGATIVE_INFINITY".into()
    } else {
        format!("{:?}", v)
    }
}

/// Java の文字列リテラル
pub fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn arith_prec(op: ArithOp) -> u8 {
    match op {
        ArithOp::Add | ArithOp::Sub => PREC_ADDITIVE,
        ArithOp::Mul | ArithOp::Div | ArithOp::Rem => PREC_MULTIPLICATIVE,
        ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr => PREC_SHIFT,
        ArithOp::And => PREC_BIT_AND,
        ArithOp::Xor => PREC_BIT_XOR,
        ArithOp::Or => PREC_BIT_OR,
    }
}

fn cmp_prec(op: CmpOp) -> u8 {
    match op {
        CmpOp::Eq | CmpOp::Ne => PREC_EQUALITY,
        _ => PREC_RELATIONAL,
    }
}

/// 式の文字列と結合の強さ
#[derive(Debug, Clone)]
struct Expr {
    text: String,
    prec: u8,
}

impl Expr {
    fn new(text: impl Into<String>, prec: u8) -> Self {
        Self {
            text: text.into(),
            prec,
        }
    }

    fn primary(text: impl Into<String>) -> Self {
        Self::new(text, PREC_POSTFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Collect,
    Emit,
}

/// 変数の出現の集計
#[derive(Debug, Clone)]
struct VarUsage {
    first_is_def: bool,
    first_scope: Vec<usize>,
    common: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclPlan {
    /// 最初の代入で宣言する
    Inline,
    /// スコープの先頭で宣言だけ書く
    AtScope(usize),
}

/// 代入の左辺
enum Target {
    None,
    Assign(String),
    Declare(String, String),
}

struct MethodGen<'a> {
    cfg: &'a ControlFlowGraph,
    structured: &'a StructuredMethod,
    ctx: &'a MethodContext<'a>,
    emit_offsets: bool,
    options: CodegenOptions,
    pass: Pass,
    w: CodeWriter,
    names: IndexMap<VarId, String>,
    allocator: NameAllocator,
    param_names: Vec<String>,
    /// catch 引数の名前（ハンドラブロックごと）
    catch_names: HashMap<BlockId, String>,
    catch_vars: HashSet<VarId>,
    usage: HashMap<VarId, VarUsage>,
    plans: BTreeMap<VarId, DeclPlan>,
    declared: HashSet<VarId>,
    scopes: Vec<usize>,
    next_scope: usize,
    printed_labels: HashSet<BlockId>,
    /// void メソッドの末尾の return を省くブロック
    tail_block: Option<BlockId>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> MethodGen<'a> {
    fn new(
        cfg: &'a ControlFlowGraph,
        structured: &'a StructuredMethod,
        ctx: &'a MethodContext<'a>,
        options: &CodegenOptions,
    ) -> Self {
        let mut gen = Self {
            cfg,
            structured,
            ctx,
            emit_offsets: options.emit_offsets,
            options: *options,
            pass: Pass::Collect,
            w: new_writer(options),
            names: IndexMap::new(),
            allocator: NameAllocator::default(),
            param_names: Vec::new(),
            catch_names: HashMap::new(),
            catch_vars: HashSet::new(),
            usage: HashMap::new(),
            plans: BTreeMap::new(),
            declared: HashSet::new(),
            scopes: Vec::new(),
            next_scope: 0,
            printed_labels: HashSet::new(),
            tail_block: None,
            diagnostics: Vec::new(),
        };
        gen.allocator.reserve("this");
        if let Some(v) = ctx.this_var {
            gen.names.insert(v, "this".into());
        }
        for (i, ty) in ctx.sig.params.iter().enumerate() {
            let name = gen.allocator.alloc(&base_name(ty));
            if let Some(Some(v)) = ctx.param_vars.get(i) {
                gen.names.insert(*v, name.clone());
            }
            gen.param_names.push(name);
        }
        if ctx.sig.ret == ArgType::Void {
            gen.tail_block = tail_block(&structured.root);
        }
        gen
    }

    fn start_emit(&mut self) {
        self.pass = Pass::Emit;
        self.w = new_writer(&self.options);
        self.declared.clear();
        self.scopes.clear();
        self.next_scope = 0;
        self.printed_labels.clear();
    }

    fn render_method(&mut self) {
        write_signature(&mut self.w, self.ctx.sig, &self.param_names);
        self.w.add(" {");
        self.w.inc_indent();
        self.open_scope();
        let structured = self.structured;
        self.render_region(&structured.root);
        self.close_scope();
        self.w.dec_indent();
        self.w.add_line("}");
    }

    // ---- 宣言位置 ----

    fn note(&mut self, var: VarId, is_def: bool) {
        if self.pass != Pass::Collect || self.ctx.is_entry(var) || self.catch_vars.contains(&var) {
            return;
        }
        let scope = self.scopes.clone();
        match self.usage.get_mut(&var) {
            Some(u) => {
                let len = u
                    .common
                    .iter()
                    .zip(scope.iter())
                    .take_while(|(a, b)| a == b)
                    .count();
                u.common.truncate(len);
            }
            None => {
                self.usage.insert(
                    var,
                    VarUsage {
                        first_is_def: is_def,
                        first_scope: scope.clone(),
                        common: scope,
                    },
                );
            }
        }
    }

    fn plan_declarations(&mut self) {
        for (&var, u) in &self.usage {
            let plan = if u.first_is_def && u.first_scope == u.common {
                DeclPlan::Inline
            } else {
                DeclPlan::AtScope(u.common.last().copied().unwrap_or(0))
            };
            self.plans.insert(var, plan);
        }
    }

    fn scope_has_decls(&self, scope: usize) -> bool {
        self.plans.values().any(|p| *p == DeclPlan::AtScope(scope))
    }

    fn open_scope(&mut self) {
        let id = self.next_scope;
        self.next_scope += 1;
        self.scopes.push(id);
        if self.pass != Pass::Emit {
            return;
        }
        let vars: Vec<VarId> = self
            .plans
            .iter()
            .filter(|(_, p)| **p == DeclPlan::AtScope(id))
            .map(|(v, _)| *v)
            .collect();
        for v in vars {
            let ty = self.var_type(v).java_name();
            let name = self.var_name(v);
            self.declared.insert(v);
            self.w.start_line();
            self.w.add(&ty);
            self.w.add(" ");
            self.w.add_annotated(
                &name,
                CodeAnnotation::Declaration {
                    kind: DeclKind::Variable,
                    name: name.clone(),
                },
            );
            self.w.add(";");
        }
    }

    fn close_scope(&mut self) {
        self.scopes.pop();
    }

    // ---- 名前 ----

    fn var_type(&self, var: VarId) -> ArgType {
        self.ctx.var_types.get(var as usize).cloned().unwrap_or_default()
    }

    fn var_name(&mut self, var: VarId) -> String {
        if let Some(name) = self.names.get(&var) {
            return name.clone();
        }
        let name = self.allocator.alloc(&base_name(&self.var_type(var)));
        self.names.insert(var, name.clone());
        name
    }

    fn reg_name(&mut self, reg: &RegisterArg) -> String {
        match reg.var {
            Some(v) => {
                self.note(v, false);
                self.var_name(v)
            }
            None => {
                self.report(
                    DiagnosticKind::UndefinedRegister,
                    format!("register r{} is read without a reaching definition", reg.reg),
                );
                format!("r{}", reg.reg)
            }
        }
    }

    /// 出力パスでだけ診断を記録する（同じ内容は1回）
    fn report(&mut self, kind: DiagnosticKind, message: String) {
        if self.pass != Pass::Emit || self.diagnostics.iter().any(|d| d.kind == kind && d.message == message) {
            return;
        }
        warn!("{}: {}", self.ctx.sig.name, message);
        self.diagnostics.push(Diagnostic::new(kind, message));
    }

    fn is_this(&self, arg: &InsnArg) -> bool {
        match (arg.as_register().and_then(|r| r.var), self.ctx.this_var) {
            (Some(v), Some(this)) => v == this,
            _ => false,
        }
    }

    fn class_ref(&self, class: &str) -> String {
        if class == self.ctx.sig.class {
            simple_class_name(class).to_string()
        } else {
            short_class_name(class).to_string()
        }
    }

    fn label_of(&self, block: BlockId) -> String {
        label_name(self.cfg.blocks[block].start_offset)
    }

    fn emit_label(&mut self, block: BlockId) {
        if self.structured.labels.contains(&block) && self.printed_labels.insert(block) {
            let label = self.label_of(block);
            self.w.add_line(&format!("{}:", label));
        }
    }

    // ---- 領域 ----

    fn render_region(&mut self, region: &Region) {
        match region {
            Region::Sequence(items) => {
                for item in items {
                    self.render_region(item);
                }
            }
            Region::Block(b) => self.render_block(*b),
            Region::Raw(b) => self.render_raw(*b),
            Region::If {
                header,
                negated,
                then_region,
                else_region,
            } => self.render_if(*header, *negated, then_region, else_region.as_deref(), false),
            Region::Loop {
                kind,
                header,
                cond_block,
                negated,
                body,
            } => self.render_loop(*kind, *header, *cond_block, *negated, body),
            Region::Switch { header, cases } => self.render_switch(*header, cases),
            Region::Try { body, catches } => self.render_try(body, catches),
            Region::Break { label } => {
                let text = match label {
                    Some(h) => format!("break {};", self.label_of(*h)),
                    None => "break;".into(),
                };
                self.w.add_line(&text);
            }
            Region::Continue { label } => {
                let text = match label {
                    Some(h) => format!("continue {};", self.label_of(*h)),
                    None => "continue;".into(),
                };
                self.w.add_line(&text);
            }
            Region::Goto { target } => {
                let text = format!("goto {};", self.label_of(*target));
                self.w.add_line(&text);
            }
        }
    }

    fn render_block(&mut self, block: BlockId) {
        self.emit_label(block);
        let cfg = self.cfg;
        let insns = &cfg.blocks[block].insns;
        for (pos, insn) in insns.iter().enumerate() {
            if Some(block) == self.tail_block
                && pos + 1 == insns.len()
                && insn.kind == InsnKind::Return
                && insn.args.is_empty()
            {
                continue;
            }
            self.render_statement(insn);
        }
    }

    /// 構造化しないブロック: 分岐を goto で書く
    fn render_raw(&mut self, block: BlockId) {
        self.emit_label(block);
        let cfg = self.cfg;
        for insn in &cfg.blocks[block].insns {
            match &insn.kind {
                InsnKind::Goto { target } => {
                    let text = format!("goto {};", label_name(*target));
                    self.annotated_line(insn, &text);
                }
                InsnKind::If { op, target } => {
                    let cond = self.condition(*op, &insn.args);
                    let text = format!("if ({}) goto {};", cond.text, label_name(*target));
                    self.annotated_line(insn, &text);
                }
                InsnKind::Switch {
                    keys,
                    targets,
                    default,
                } => {
                    let selector = self.switch_selector(insn);
                    self.annotated_line(insn, &format!("switch ({}) {{", selector));
                    self.w.inc_indent();
                    for (key, target) in keys.iter().zip(targets) {
                        self.w.add_line(&format!("case {}: goto {};", key, label_name(*target)));
                    }
                    if let Some(d) = default {
                        self.w.add_line(&format!("default: goto {};", label_name(*d)));
                    }
                    self.w.dec_indent();
                    self.w.add_line("}");
                }
                _ => self.render_statement(insn),
            }
        }
    }

    /// 何も出力しない領域か（ラベルの付かない、文のないブロックだけ）
    fn region_is_empty(&self, region: &Region) -> bool {
        match region {
            Region::Sequence(items) => items.iter().all(|r| self.region_is_empty(r)),
            Region::Block(b) => {
                !self.structured.labels.contains(b)
                    && self.cfg.blocks[*b]
                        .insns
                        .iter()
                        .all(|i| matches!(i.kind, InsnKind::Nop | InsnKind::Goto { .. }))
            }
            _ => false,
        }
    }

    /// ヘッダーの分岐条件が副作用なしか
    fn condition_is_pure(&self, header: BlockId) -> bool {
        self.cfg.blocks[header]
            .terminator()
            .is_some_and(|t| t.args.iter().all(|a| a.as_wrapped().map_or(true, |i| i.can_reorder())))
    }

    /// 条件の前に文がない if ヘッダーか（else if に連結できる）
    fn is_bare_if_header(&self, block: BlockId) -> bool {
        let b = &self.cfg.blocks[block];
        !self.structured.labels.contains(&block)
            && b.ends_with_if()
            && b.statements().iter().all(|i| i.kind == InsnKind::Nop)
    }

    fn render_if(
        &mut self,
        header: BlockId,
        negated: bool,
        then_region: &Region,
        else_region: Option<&Region>,
        chained: bool,
    ) {
        if self.region_is_empty(then_region) {
            match else_region {
                Some(e) if !self.region_is_empty(e) => {
                    return self.render_if(header, !negated, e, None, chained);
                }
                _ if !chained && self.condition_is_pure(header) => {
                    self.render_block(header);
                    return;
                }
                _ => {}
            }
        } else if else_region.is_some_and(|e| self.region_is_empty(e)) {
            return self.render_if(header, negated, then_region, None, chained);
        }

        if !chained {
            self.render_block(header);
        }
        let cfg = self.cfg;
        let Some(term) = cfg.blocks[header].terminator().filter(|t| matches!(t.kind, InsnKind::If { .. })) else {
            self.render_region(then_region);
            if let Some(e) = else_region {
                self.render_region(e);
            }
            return;
        };
        let op = match term.kind {
            InsnKind::If { op, .. } if negated => op.negate(),
            InsnKind::If { op, .. } => op,
            _ => return,
        };
        let cond = self.condition(op, &term.args);
        if !chained {
            self.w.start_line();
        }
        self.w.begin(CodeAnnotation::Offset { offset: term.offset });
        self.w.add(&format!("if ({}) {{", cond.text));
        self.offset_comment(term.offset);
        self.w.end();
        if let Some(line) = term.line {
            self.w.attach_source_line(line);
        }

        self.w.inc_indent();
        self.open_scope();
        self.render_region(then_region);
        self.close_scope();
        self.w.dec_indent();

        match else_region {
            None => {
                self.w.add_line("}");
            }
            Some(Region::If {
                header: h2,
                negated: n2,
                then_region: t2,
                else_region: e2,
            }) if self.is_bare_if_header(*h2) && !self.scope_has_decls(self.next_scope) => {
                self.w.add_line("} else ");
                self.open_scope();
                self.render_if(*h2, *n2, t2, e2.as_deref(), true);
                self.close_scope();
            }
            Some(e) => {
                self.w.add_line("} else {");
                self.w.inc_indent();
                self.open_scope();
                self.render_region(e);
                self.close_scope();
                self.w.dec_indent();
                self.w.add_line("}");
            }
        }
    }

    fn render_loop(
        &mut self,
        kind: LoopKind,
        header: BlockId,
        cond_block: Option<BlockId>,
        negated: bool,
        body: &Region,
    ) {
        self.emit_label(header);
        let prefix = if self.structured.labeled_loops.contains(&header) {
            format!("{}: ", self.label_of(header))
        } else {
            String::new()
        };
        let cfg = self.cfg;
        let cond_insn = cond_block
            .and_then(|b| cfg.blocks[b].terminator())
            .filter(|t| matches!(t.kind, InsnKind::If { .. }));

        match (kind, cond_insn) {
            (LoopKind::While, Some(term)) => {
                let has_statements = cfg.blocks[header]
                    .statements()
                    .iter()
                    .any(|i| i.kind != InsnKind::Nop);
                if has_statements {
                    // 条件の前に文があるので while (true) の中で判定して抜ける
                    self.w.add_line(&format!("{}while (true) {{", prefix));
                    self.w.inc_indent();
                    self.open_scope();
                    self.render_block(header);
                    let exit = self.if_condition(term, !negated);
                    self.w.start_line();
                    self.w.begin(CodeAnnotation::Offset { offset: term.offset });
                    self.w.add(&format!("if ({}) {{", exit.text));
                    self.w.end();
                    self.w.inc_indent();
                    self.w.add_line("break;");
                    self.w.dec_indent();
                    self.w.add_line("}");
                    self.render_region(body);
                    self.close_scope();
                    self.w.dec_indent();
                    self.w.add_line("}");
                } else {
                    let cond = self.if_condition(term, negated);
                    self.w.start_line();
                    self.w.begin(CodeAnnotation::Offset { offset: term.offset });
                    self.w.add(&format!("{}while ({}) {{", prefix, cond.text));
                    self.offset_comment(term.offset);
                    self.w.end();
                    self.render_loop_body(body);
                }
            }
            (LoopKind::DoWhile, Some(term)) => {
                self.w.add_line(&format!("{}do {{", prefix));
                self.w.inc_indent();
                self.open_scope();
                self.render_region(body);
                self.close_scope();
                self.w.dec_indent();
                let cond = self.if_condition(term, negated);
                self.w.start_line();
                self.w.begin(CodeAnnotation::Offset { offset: term.offset });
                self.w.add(&format!("}} while ({});", cond.text));
                self.offset_comment(term.offset);
                self.w.end();
            }
            _ => {
                self.w.add_line(&format!("{}while (true) {{", prefix));
                self.render_loop_body(body);
            }
        }
    }

    fn render_loop_body(&mut self, body: &Region) {
        self.w.inc_indent();
        self.open_scope();
        self.render_region(body);
        self.close_scope();
        self.w.dec_indent();
        self.w.add_line("}");
    }

    fn render_switch(&mut self, header: BlockId, cases: &[SwitchCase]) {
        self.render_block(header);
        let cfg = self.cfg;
        let Some(term) = cfg.blocks[header].terminator().filter(|t| matches!(t.kind, InsnKind::Switch { .. })) else {
            for case in cases {
                self.render_region(&case.body);
            }
            return;
        };
        let selector = self.switch_selector(term);
        self.annotated_line(term, &format!("switch ({}) {{", selector));
        self.w.inc_indent();
        for case in cases {
            for key in &case.keys {
                self.w.add_line(&format!("case {}:", key));
            }
            if case.is_default {
                self.w.add_line("default:");
            }
            self.w.inc_indent();
            self.open_scope();
            self.render_region(&case.body);
            self.close_scope();
            self.w.dec_indent();
        }
        self.w.dec_indent();
        self.w.add_line("}");
    }

    fn render_try(&mut self, body: &Region, catches: &[CatchClause]) {
        self.w.add_line("try {");
        self.w.inc_indent();
        self.open_scope();
        self.render_region(body);
        self.close_scope();
        self.w.dec_indent();

        let cfg = self.cfg;
        for clause in catches {
            let ty = clause
                .exception
                .clone()
                .unwrap_or_else(|| ArgType::object(JAVA_LANG_THROWABLE));
            let handler = &cfg.blocks[clause.block];
            let caught = handler
                .insns
                .iter()
                .find(|i| matches!(i.kind, InsnKind::MoveException(_)));
            let name = match caught.and_then(|i| i.result.as_ref()).and_then(|r| r.var) {
                Some(v) => {
                    self.catch_vars.insert(v);
                    self.var_name(v)
                }
                None => match self.catch_names.get(&clause.block) {
                    Some(n) => n.clone(),
                    None => {
                        let n = self.allocator.alloc(&base_name(&ty));
                        self.catch_names.insert(clause.block, n.clone());
                        n
                    }
                },
            };
            self.w.start_line();
            self.w.begin(CodeAnnotation::Offset {
                offset: handler.first_offset(),
            });
            self.w.add(&format!("}} catch ({} ", ty.java_name()));
            self.w.add_annotated(
                &name,
                CodeAnnotation::Declaration {
                    kind: DeclKind::Variable,
                    name: name.clone(),
                },
            );
            self.w.add(") {");
            self.w.end();
            self.w.inc_indent();
            self.open_scope();
            self.render_region(&clause.body);
            self.close_scope();
            self.w.dec_indent();
        }
        self.w.add_line("}");
    }

    // ---- 文 ----

    fn annotated_line(&mut self, insn: &Insn, text: &str) {
        self.w.start_line();
        if let Some(line) = insn.line {
            self.w.attach_source_line(line);
        }
        self.w.begin(CodeAnnotation::Offset { offset: insn.offset });
        self.w.add(text);
        self.offset_comment(insn.offset);
        self.w.end();
    }

    fn offset_comment(&mut self, offset: u32) {
        if self.emit_offsets {
            self.w.add(&format!(" /* 0x{:04x} */", offset));
        }
    }

    fn render_statement(&mut self, insn: &Insn) {
        let args = &insn.args;
        let text = match &insn.kind {
            InsnKind::Nop
            | InsnKind::Goto { .. }
            | InsnKind::If { .. }
            | InsnKind::Switch { .. }
            | InsnKind::MoveException(_) => return,
            InsnKind::Return => match args.first() {
                Some(value) => format!("return {}", self.expr(value).text),
                None => "return".into(),
            },
            InsnKind::Throw if !args.is_empty() => format!("throw {}", self.expr_at(&args[0], PREC_NONE)),
            InsnKind::MonitorEnter if !args.is_empty() => {
                format!("monitor-enter({})", self.expr_at(&args[0], PREC_NONE))
            }
            InsnKind::MonitorExit if !args.is_empty() => {
                format!("monitor-exit({})", self.expr_at(&args[0], PREC_NONE))
            }
            InsnKind::ArrayPut(_) if args.len() == 3 => {
                let array = self.expr_at(&args[0], PREC_POSTFIX);
                let index = self.expr_at(&args[1], PREC_NONE);
                let value = self.expr_at(&args[2], PREC_NONE);
                format!("{}[{}] = {}", array, index, value)
            }
            InsnKind::InstancePut(field) if args.len() == 2 => {
                let object = self.expr_at(&args[0], PREC_POSTFIX);
                let value = self.expr_at(&args[1], PREC_NONE);
                format!("{}.{} = {}", object, field.name, value)
            }
            InsnKind::StaticPut(field) if !args.is_empty() => {
                let value = self.expr_at(&args[0], PREC_NONE);
                format!("{}.{} = {}", self.class_ref(&field.class), field.name, value)
            }
            InsnKind::FillArray { data, .. } if !args.is_empty() => {
                let elem = args[0].arg_type().element_type().cloned().unwrap_or(ArgType::Int);
                let array = self.expr_at(&args[0], PREC_NONE);
                let values: Vec<String> = data.iter().map(|v| literal_text(*v, &elem)).collect();
                format!(
                    "fillArrayData({}, new {}[]{{{}}})",
                    array,
                    elem.java_name(),
                    values.join(", ")
                )
            }
            InsnKind::Invoke { method, .. }
                if method.is_constructor()
                    && method.class == JAVA_LANG_OBJECT
                    && args.len() == 1
                    && self.is_this(&args[0]) =>
            {
                return;
            }
            _ => {
                let value = self.insn_expr(insn);
                let target = match &insn.result {
                    Some(r) => self.assign_target(r),
                    None => Target::None,
                };
                if let (InsnKind::Move, Target::Assign(name)) = (&insn.kind, &target) {
                    if *name == value.text {
                        return;
                    }
                }
                self.write_statement(insn, target, &value.text);
                return;
            }
        };
        self.write_statement(insn, Target::None, &text);
    }

    fn assign_target(&mut self, result: &RegisterArg) -> Target {
        let Some(v) = result.var else {
            return Target::Assign(format!("r{}", result.reg));
        };
        self.note(v, true);
        let name = self.var_name(v);
        let declare = self.pass == Pass::Emit
            && self.plans.get(&v) == Some(&DeclPlan::Inline)
            && self.declared.insert(v);
        if declare {
            Target::Declare(self.var_type(v).java_name(), name)
        } else {
            Target::Assign(name)
        }
    }

    fn write_statement(&mut self, insn: &Insn, target: Target, value: &str) {
        self.w.start_line();
        if let Some(line) = insn.line {
            self.w.attach_source_line(line);
        }
        self.w.begin(CodeAnnotation::Offset { offset: insn.offset });
        match target {
            Target::None => {}
            Target::Assign(name) => {
                self.w.add(&name);
                self.w.add(" = ");
            }
            Target::Declare(ty, name) => {
                self.w.add(&ty);
                self.w.add(" ");
                self.w.add_annotated(
                    &name,
                    CodeAnnotation::Declaration {
                        kind: DeclKind::Variable,
                        name: name.clone(),
                    },
                );
                self.w.add(" = ");
            }
        }
        self.w.add(value);
        self.w.add(";");
        self.offset_comment(insn.offset);
        self.w.end();
    }

    // ---- 式 ----

    fn expr_at(&mut self, arg: &InsnArg, min_prec: u8) -> String {
        let e = self.expr(arg);
        if e.prec < min_prec {
            format!("({})", e.text)
        } else {
            e.text
        }
    }

    fn expr(&mut self, arg: &InsnArg) -> Expr {
        match arg {
            InsnArg::Register(r) => Expr::primary(self.reg_name(r)),
            InsnArg::Literal(l) => {
                let text = literal_text(l.value, &l.ty);
                let prec = if text.starts_with('-') { PREC_UNARY } else { PREC_POSTFIX };
                Expr::new(text, prec)
            }
            InsnArg::Wrapped(insn) => self.insn_expr(insn),
        }
    }

    fn binary(&mut self, left: &InsnArg, symbol: &str, right: &InsnArg, prec: u8) -> Expr {
        let l = self.expr_at(left, prec);
        let r = self.expr_at(right, prec + 1);
        Expr::new(format!("{} {} {}", l, symbol, r), prec)
    }

    fn unary(&mut self, symbol: &str, operand: &InsnArg) -> Expr {
        let inner = self.expr_at(operand, PREC_UNARY);
        let text = if inner.starts_with(symbol) || (symbol == "-" && inner.starts_with('-')) {
            format!("{}({})", symbol, inner)
        } else {
            format!("{}{}", symbol, inner)
        };
        Expr::new(text, PREC_UNARY)
    }

    fn arg_list(&mut self, args: &[InsnArg]) -> String {
        let parts: Vec<String> = args.iter().map(|a| self.expr_at(a, PREC_NONE)).collect();
        parts.join(", ")
    }

    fn if_condition(&mut self, term: &Insn, negated: bool) -> Expr {
        match term.kind {
            InsnKind::If { op, .. } => {
                let op = if negated { op.negate() } else { op };
                self.condition(op, &term.args)
            }
            _ => Expr::primary("true"),
        }
    }

    /// 比較条件。ゼロとの比較は型に合わせて書き分ける
    fn condition(&mut self, op: CmpOp, args: &[InsnArg]) -> Expr {
        let prec = cmp_prec(op);
        match args {
            [left, right] => self.binary(left, op.symbol(), right, prec),
            [value] => {
                if let Some(inner) = value.as_wrapped() {
                    if let (InsnKind::Cmp(_), [x, y]) = (&inner.kind, inner.args.as_slice()) {
                        return self.binary(x, op.symbol(), y, prec);
                    }
                }
                let ty = value.arg_type().resolved();
                let is_boolean = ty == ArgType::Boolean
                    || matches!(value.as_wrapped().map(|i| &i.kind), Some(InsnKind::InstanceOf(_)));
                match op {
                    CmpOp::Eq if is_boolean => self.unary("!", value),
                    CmpOp::Ne if is_boolean => self.expr(value),
                    _ => {
                        let zero = if ty.is_reference() { "null" } else { "0" };
                        let left = self.expr_at(value, prec);
                        Expr::new(format!("{} {} {}", left, op.symbol(), zero), prec)
                    }
                }
            }
            _ => Expr::primary("false"),
        }
    }

    fn switch_selector(&mut self, insn: &Insn) -> String {
        match insn.args.first() {
            Some(arg) => self.expr_at(arg, PREC_NONE),
            None => "?".into(),
        }
    }

    fn invoke_expr(&mut self, kind: InvokeKind, method: &MethodRef, args: &[InsnArg]) -> Expr {
        let (receiver, params) = if kind.is_static() {
            (None, args)
        } else {
            match args.split_first() {
                Some((recv, rest)) => (Some(recv), rest),
                None => (None, args),
            }
        };
        let params = self.arg_list(params);
        if method.is_constructor() {
            if let Some(recv) = receiver {
                if self.is_this(recv) {
                    let word = if method.class == self.ctx.sig.class { "this" } else { "super" };
                    return Expr::primary(format!("{}({})", word, params));
                }
                self.report(
                    DiagnosticKind::UnfoldedConstructor,
                    format!("constructor {}.<init> is not attached to its allocation", method.class),
                );
                let target = self.expr_at(recv, PREC_POSTFIX);
                return Expr::primary(format!("{}.<init>({})", target, params));
            }
        }
        let text = match (kind, receiver) {
            (InvokeKind::Super, _) => format!("super.{}({})", method.name, params),
            (InvokeKind::Static, _) | (_, None) => {
                format!("{}.{}({})", self.class_ref(&method.class), method.name, params)
            }
            (_, Some(recv)) => {
                let target = self.expr_at(recv, PREC_POSTFIX);
                format!("{}.{}({})", target, method.name, params)
            }
        };
        Expr::primary(text)
    }

    fn insn_expr(&mut self, insn: &Insn) -> Expr {
        let args = &insn.args;
        match (&insn.kind, args.as_slice()) {
            (InsnKind::Const, [value]) | (InsnKind::Move, [value]) => self.expr(value),
            (InsnKind::ConstString(s), _) => Expr::primary(string_literal(s)),
            (InsnKind::ConstClass(ty), _) => Expr::primary(format!("{}.class", ty.java_name())),
            (InsnKind::CheckCast(ty), [value]) => {
                let inner = self.expr_at(value, PREC_UNARY);
                Expr::new(format!("({}) {}", ty.java_name(), inner), PREC_UNARY)
            }
            (InsnKind::InstanceOf(ty), [value]) => {
                let inner = self.expr_at(value, PREC_RELATIONAL);
                Expr::new(format!("{} instanceof {}", inner, ty.java_name()), PREC_RELATIONAL)
            }
            (InsnKind::ArrayLength, [array]) => {
                Expr::primary(format!("{}.length", self.expr_at(array, PREC_POSTFIX)))
            }
            // 畳み込めなかった割り当て。コンストラクタ呼び出しとしては書かない
            (InsnKind::NewInstance(ty), _) => {
                self.report(
                    DiagnosticKind::UnfoldedConstructor,
                    format!("allocation of {} is not followed by its constructor", ty.java_name()),
                );
                Expr::primary(format!("new {}", ty.java_name()))
            }
            (InsnKind::NewArray(ty), [size]) => {
                let size = self.expr_at(size, PREC_NONE);
                let mut elem = ty.element_type().cloned().unwrap_or(ArgType::Int);
                let mut dims = String::new();
                while let ArgType::Array(inner) = elem {
                    dims.push_str("[]");
                    elem = *inner;
                }
                Expr::primary(format!("new {}[{}]{}", elem.java_name(), size, dims))
            }
            (InsnKind::FilledNewArray(ty), _) => {
                let values = self.arg_list(args);
                Expr::primary(format!("new {}{{{}}}", ty.java_name(), values))
            }
            (InsnKind::Cmp(ty), [left, right]) => {
                let owner = match ty.resolved() {
                    ArgType::Float => "Float",
                    ArgType::Double => "Double",
                    _ => "Long",
                };
                let values = self.arg_list(&[left.clone(), right.clone()]);
                Expr::primary(format!("{}.compare({})", owner, values))
            }
            (InsnKind::Arith { op, .. }, [left, right]) => self.binary(left, op.symbol(), right, arith_prec(*op)),
            (InsnKind::Neg(_), [value]) => self.unary("-", value),
            (InsnKind::Not(ty), [value]) => {
                if ty.resolved() == ArgType::Boolean {
                    self.unary("!", value)
                } else {
                    self.unary("~", value)
                }
            }
            (InsnKind::Cast { to, .. }, [value]) => {
                let inner = self.expr_at(value, PREC_UNARY);
                Expr::new(format!("({}) {}", to.java_name(), inner), PREC_UNARY)
            }
            (InsnKind::ArrayGet(_), [array, index]) => {
                let array = self.expr_at(array, PREC_POSTFIX);
                let index = self.expr_at(index, PREC_NONE);
                Expr::primary(format!("{}[{}]", array, index))
            }
            (InsnKind::InstanceGet(field), [object]) => {
                let object = self.expr_at(object, PREC_POSTFIX);
                Expr::primary(format!("{}.{}", object, field.name))
            }
            (InsnKind::StaticGet(field), _) => {
                Expr::primary(format!("{}.{}", self.class_ref(&field.class), field.name))
            }
            (InsnKind::Invoke { kind, method }, _) => self.invoke_expr(*kind, method, args),
            (InsnKind::Construct { method }, _) => {
                let values = self.arg_list(args);
                Expr::primary(format!("new {}({})", self.class_ref(&method.class), values))
            }
            (InsnKind::Ternary(cond), [then_value, else_value]) => {
                match (bool_literal(then_value), bool_literal(else_value)) {
                    (Some(true), Some(false)) => return self.condition(cond.op, &cond.args),
                    (Some(false), Some(true)) => return self.condition(cond.op.negate(), &cond.args),
                    _ => {}
                }
                let c = self.condition(cond.op, &cond.args);
                let c = if c.prec <= PREC_TERNARY { format!("({})", c.text) } else { c.text };
                let a = self.expr_at(then_value, PREC_TERNARY + 1);
                let b = self.expr_at(else_value, PREC_TERNARY);
                Expr::new(format!("{} ? {} : {}", c, a, b), PREC_TERNARY)
            }
            _ => Expr::primary(insn.mnemonic()),
        }
    }
}

/// 領域木の最後に実行されるブロック
fn tail_block(region: &Region) -> Option<BlockId> {
    match region {
        Region::Sequence(items) => items.last().and_then(tail_block),
        Region::Block(b) => Some(*b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::control_flow::structure_method;
    use crate::decompiler::dataflow::DefUseChain;
    use crate::decompiler::hierarchy::ClassHierarchy;
    use crate::decompiler::insn::{Condition, Offset};
    use crate::decompiler::shrink::shrink_method;
    use crate::decompiler::type_inference::TypeInference;

    fn render(insns: Vec<Insn>, code_len: Offset, sig: &MethodSignature, entry: Vec<RegisterArg>) -> CodeOutput {
        render_with_diagnostics(insns, code_len, sig, entry).0
    }

    fn render_with_diagnostics(
        insns: Vec<Insn>,
        code_len: Offset,
        sig: &MethodSignature,
        entry: Vec<RegisterArg>,
    ) -> (CodeOutput, Vec<Diagnostic>) {
        let mut cfg = ControlFlowGraph::build(insns, &[], code_len).unwrap();
        let chain = DefUseChain::build(&cfg, &entry);
        let hierarchy = ClassHierarchy::empty();
        let entry_types: Vec<ArgType> = entry.iter().map(|r| r.ty.clone()).collect();
        let types = TypeInference::new(&hierarchy, 1000).run(&mut cfg, &chain, &entry_types, &sig.ret);
        let structured = structure_method(&cfg);
        shrink_method(&mut cfg, &entry, 8).unwrap();
        let ctx = MethodContext::new(sig, &types);
        generate_method(&cfg, &structured, &ctx, &CodegenOptions::default())
    }

    #[test]
    fn test_inlined_return_expression() {
        // 0: r0 = r1 + r2 | 2: return r0
        let sig = MethodSignature::new("a.B", "add", "(II)I", access::STATIC).unwrap();
        let insns = vec![
            Insn::new(
                InsnKind::Arith {
                    op: ArithOp::Add,
                    ty: ArgType::Int,
                },
                vec![InsnArg::reg(1), InsnArg::reg(2)],
                Some(RegisterArg::new(0)),
                0,
            ),
            Insn::new(InsnKind::Return, vec![InsnArg::reg(0)], None, 2),
        ];
        let entry = vec![
            RegisterArg::typed(1, ArgType::Int),
            RegisterArg::typed(2, ArgType::Int),
        ];
        let out = render(insns, 3, &sig, entry);
        assert_eq!(out.code, "static int add(int i, int i2) {\n    return i + i2;\n}");
        assert!(out.metadata.is_exact());
        assert!(out.metadata.position_of(2).is_some());
        assert!(out.metadata.position_of(0).is_none());
    }

    #[test]
    fn test_branch_assignment_is_predeclared() {
        // 0: if-eqz r1 -> 4 | 2: r0 = 1; 3: goto 5 | 4: r0 = 2 | 5: return r0
        let sig = MethodSignature::new("a.B", "pick", "(Z)I", access::STATIC).unwrap();
        let konst = |value, offset| {
            Insn::new(
                InsnKind::Const,
                vec![InsnArg::lit(value, ArgType::Int)],
                Some(RegisterArg::new(0)),
                offset,
            )
        };
        let insns = vec![
            Insn::new(
                InsnKind::If {
                    op: CmpOp::Eq,
                    target: 4,
                },
                vec![InsnArg::reg(1)],
                None,
                0,
            ),
            konst(1, 2),
            Insn::new(InsnKind::Goto { target: 5 }, vec![], None, 3),
            konst(2, 4),
            Insn::new(InsnKind::Return, vec![InsnArg::reg(0)], None, 5),
        ];
        let out = render(insns, 6, &sig, vec![RegisterArg::typed(1, ArgType::Boolean)]);
        let expected = "static int pick(boolean z) {\n    int i;\n    if (z) {\n        i = 1;\n    } else {\n        i = 2;\n    }\n    return i;\n}";
        assert_eq!(out.code, expected);
        assert!(out.metadata.is_exact());
    }

    #[test]
    fn test_boolean_ternary_collapses_to_condition() {
        // 0: r0 = r1 > 0 ? true : false | 2: return r0
        let sig = MethodSignature::new("a.B", "positive", "(I)Z", access::STATIC).unwrap();
        let cond = Condition {
            op: CmpOp::Gt,
            args: vec![InsnArg::reg(1)],
        };
        let insns = vec![
            Insn::new(
                InsnKind::Ternary(Box::new(cond)),
                vec![InsnArg::lit(1, ArgType::Boolean), InsnArg::lit(0, ArgType::Boolean)],
                Some(RegisterArg::new(0)),
                0,
            ),
            Insn::new(InsnKind::Return, vec![InsnArg::reg(0)], None, 2),
        ];
        let out = render(insns, 3, &sig, vec![RegisterArg::typed(1, ArgType::Int)]);
        assert!(out.code.contains("return i > 0;"), "{}", out.code);
        assert!(!out.code.contains('?'));
    }

    #[test]
    fn test_empty_then_arm_is_flipped() {
        // 0: if-eqz r1 -> 3 | 2: goto 6 | 3: tick() | 6: return-void
        let sig = MethodSignature::new("a.B", "maybe", "(Z)V", access::STATIC).unwrap();
        let method = MethodRef::parse("a.B", "tick", "()V").unwrap();
        let insns = vec![
            Insn::new(
                InsnKind::If {
                    op: CmpOp::Eq,
                    target: 3,
                },
                vec![InsnArg::reg(1)],
                None,
                0,
            ),
            Insn::new(InsnKind::Goto { target: 6 }, vec![], None, 2),
            Insn::new(
                InsnKind::Invoke {
                    kind: InvokeKind::Static,
                    method,
                },
                vec![],
                None,
                3,
            ),
            Insn::new(InsnKind::Return, vec![], None, 6),
        ];
        let out = render(insns, 7, &sig, vec![RegisterArg::typed(1, ArgType::Boolean)]);
        assert!(out.code.contains("if (!z) {"), "{}", out.code);
        assert!(out.code.contains("tick();"));
        assert!(!out.code.contains("else"));
    }

    #[test]
    fn test_if_without_statements_is_dropped() {
        // 0: if-eqz r1 -> 3 | 2: nop | 3: return-void
        let sig = MethodSignature::new("a.B", "idle", "(Z)V", access::STATIC).unwrap();
        let insns = vec![
            Insn::new(
                InsnKind::If {
                    op: CmpOp::Eq,
                    target: 3,
                },
                vec![InsnArg::reg(1)],
                None,
                0,
            ),
            Insn::new(InsnKind::Nop, vec![], None, 2),
            Insn::new(InsnKind::Return, vec![], None, 3),
        ];
        let out = render(insns, 4, &sig, vec![RegisterArg::typed(1, ArgType::Boolean)]);
        assert!(!out.code.contains("if ("), "{}", out.code);
        assert!(out.code.starts_with("static void idle(boolean z) {"));
    }

    #[test]
    fn test_undefined_register_is_reported() {
        // 0: return r0（r0 はどこでも定義されない）
        let sig = MethodSignature::new("a.B", "stray", "()I", access::STATIC).unwrap();
        let insns = vec![Insn::new(InsnKind::Return, vec![InsnArg::reg(0)], None, 0)];
        let (out, diagnostics) = render_with_diagnostics(insns, 1, &sig, Vec::new());
        assert!(out.code.contains("return r0;"));
        let undefined: Vec<_> = diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::UndefinedRegister)
            .collect();
        assert_eq!(undefined.len(), 1);
        assert!(undefined[0].message.contains("r0"));
    }

    #[test]
    fn test_void_tail_return_dropped() {
        let sig = MethodSignature::new("a.B", "run", "()V", access::PUBLIC).unwrap();
        let method = MethodRef::parse("a.B", "tick", "()V").unwrap();
        let insns = vec![
            Insn::new(
                InsnKind::Invoke {
                    kind: InvokeKind::Virtual,
                    method,
                },
                vec![InsnArg::reg(0)],
                None,
                0,
            ),
            Insn::new(InsnKind::Return, vec![], None, 3),
        ];
        let this = RegisterArg::typed(0, ArgType::object("a.B"));
        let out = render(insns, 4, &sig, vec![this]);
        assert_eq!(out.code, "public void run() {\n    this.tick();\n}");
        let decl = out
            .metadata
            .entries
            .iter()
            .find(|e| matches!(e.annotation, CodeAnnotation::Declaration { kind: DeclKind::Method, .. }))
            .unwrap();
        assert_eq!(&out.code[decl.start..decl.end], "run");
    }

    #[test]
    fn test_literals_by_type() {
        assert_eq!(literal_text(0, &ArgType::object("java.lang.String")), "null");
        assert_eq!(literal_text(1, &ArgType::Boolean), "true");
        assert_eq!(literal_text(65, &ArgType::Char), "'A'");
        assert_eq!(literal_text(10, &ArgType::Char), "'\\u000a'");
        assert_eq!(literal_text(5, &ArgType::Long), "5L");
        assert_eq!(literal_text(1.5f32.to_bits() as i64, &ArgType::Float), "1.5f");
        assert_eq!(literal_text(2.0f64.to_bits() as i64, &ArgType::Double), "2.0");
        assert_eq!(literal_text(0xffff_ffff, &ArgType::Int), "-1");
        assert_eq!(string_literal("a\"b\n"), "\"a\\\"b\\n\"");
    }

    #[test]
    fn test_names_follow_types() {
        let mut names = NameAllocator::default();
        assert_eq!(names.alloc(&base_name(&ArgType::Int)), "i");
        assert_eq!(names.alloc(&base_name(&ArgType::Int)), "i2");
        assert_eq!(base_name(&ArgType::array_of(ArgType::Int)), "iArr");
        assert_eq!(base_name(&ArgType::object("java.io.IOException")), "e");
        assert_eq!(base_name(&ArgType::object("com.example.Switch")), "switchVar");
        assert_eq!(base_name(&ArgType::object("java.util.ArrayList")), "arrayList");
    }

    #[test]
    fn test_fallback_keeps_signature() {
        let sig = MethodSignature::new("a.B", "broken", "(Ljava/lang/String;J)V", access::PRIVATE).unwrap();
        let out = generate_fallback(&sig, "unknown opcode", &["0000: ???".to_string()], &CodegenOptions::default());
        assert!(out.code.starts_with("private void broken(String str, long j) {\n    /*"));
        assert!(out.code.contains("unknown opcode"));
        assert!(out.code.ends_with("*/\n}"));
    }

    #[test]
    fn test_class_header() {
        let header = class_header(
            "com.example.Foo",
            Some("java.lang.Object"),
            &["java.lang.Runnable".to_string()],
            access::PUBLIC | access::FINAL,
        );
        assert_eq!(header, "public final class Foo implements Runnable {");
    }
}
