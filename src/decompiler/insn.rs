/// 命令IR
///
/// Dalvik・クラスファイルの両形式から変換される共通の命令表現。
/// 引数は レジスタ / リテラル / ラップされた命令（式木）のいずれか。
/// インライン化後は命令木になるが、ラップされた命令の result は
/// 帳簿用に保持したまま残す（代入としては出力しない）。

use crate::decompiler::bitset::RegSet;
use crate::decompiler::pool::{FieldRef, MethodRef};
use crate::decompiler::types::ArgType;
use std::fmt;

/// 命令オフセット（Dalvik はコード単位、クラスファイルはバイト）
pub type Offset = u32;
/// レジスタ番号
pub type RegNum = u16;
/// 型推論で割り当てる変数ID
pub type VarId = u32;

/// レジスタ引数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterArg {
    pub reg: RegNum,
    /// 2レジスタを占める値（long/double）か
    pub wide: bool,
    pub ty: ArgType,
    pub var: Option<VarId>,
}

impl RegisterArg {
    pub fn new(reg: RegNum) -> Self {
        Self {
            reg,
            wide: false,
            ty: ArgType::Unknown,
            var: None,
        }
    }

    /// 型ヒント付き（ワイド性は型から決める）
    pub fn typed(reg: RegNum, ty: ArgType) -> Self {
        Self {
            reg,
            wide: ty.is_wide(),
            ty,
            var: None,
        }
    }

    /// 占有するレジスタを集合へ追加
    pub fn add_to(&self, set: &mut RegSet) {
        set.insert(self.reg as usize);
        if self.wide {
            set.insert(self.reg as usize + 1);
        }
    }
}

/// 即値リテラル（浮動小数点はビット列で保持）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub value: i64,
    pub ty: ArgType,
}

/// 命令引数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsnArg {
    Register(RegisterArg),
    Literal(Literal),
    /// 式としてラップされた命令
    Wrapped(Box<Insn>),
}

impl InsnArg {
    pub fn reg(reg: RegNum) -> Self {
        InsnArg::Register(RegisterArg::new(reg))
    }

    pub fn typed_reg(reg: RegNum, ty: ArgType) -> Self {
        InsnArg::Register(RegisterArg::typed(reg, ty))
    }

    pub fn lit(value: i64, ty: ArgType) -> Self {
        InsnArg::Literal(Literal { value, ty })
    }

    pub fn as_register(&self) -> Option<&RegisterArg> {
        match self {
            InsnArg::Register(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_wrapped(&self) -> Option<&Insn> {
        match self {
            InsnArg::Wrapped(insn) => Some(insn),
            _ => None,
        }
    }

    /// 引数の値の型
    pub fn arg_type(&self) -> ArgType {
        match self {
            InsnArg::Register(r) => r.ty.clone(),
            InsnArg::Literal(l) => l.ty.clone(),
            InsnArg::Wrapped(insn) => insn
                .result
                .as_ref()
                .map(|r| r.ty.clone())
                .unwrap_or_default(),
        }
    }
}

/// 比較演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl CmpOp {
    /// Dalvik の if-test / if-testz と同じ並び
    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => CmpOp::Eq,
            1 => CmpOp::Ne,
            2 => CmpOp::Lt,
            3 => CmpOp::Ge,
            4 => CmpOp::Gt,
            5 => CmpOp::Le,
            _ => return None,
        })
    }

    pub fn index(self) -> u8 {
        match self {
            CmpOp::Eq => 0,
            CmpOp::Ne => 1,
            CmpOp::Lt => 2,
            CmpOp::Ge => 3,
            CmpOp::Gt => 4,
            CmpOp::Le => 5,
        }
    }

    pub fn negate(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Le => CmpOp::Gt,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
        }
    }
}

/// 二項算術・ビット演算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

impl ArithOp {
    /// Dalvik の binop 表の並び（add..ushr）
    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => ArithOp::Add,
            1 => ArithOp::Sub,
            2 => ArithOp::Mul,
            3 => ArithOp::Div,
            4 => ArithOp::Rem,
            5 => ArithOp::And,
            6 => ArithOp::Or,
            7 => ArithOp::Xor,
            8 => ArithOp::Shl,
            9 => ArithOp::Shr,
            10 => ArithOp::Ushr,
            _ => return None,
        })
    }

    pub fn index(self) -> u8 {
        match self {
            ArithOp::Add => 0,
            ArithOp::Sub => 1,
            ArithOp::Mul => 2,
            ArithOp::Div => 3,
            ArithOp::Rem => 4,
            ArithOp::And => 5,
            ArithOp::Or => 6,
            ArithOp::Xor => 7,
            ArithOp::Shl => 8,
            ArithOp::Shr => 9,
            ArithOp::Ushr => 10,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Rem => "%",
            ArithOp::And => "&",
            ArithOp::Or => "|",
            ArithOp::Xor => "^",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
            ArithOp::Ushr => ">>>",
        }
    }

    pub fn is_shift(self) -> bool {
        matches!(self, ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, ArithOp::And | ArithOp::Or | ArithOp::Xor)
    }

    pub fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Rem => "rem",
            ArithOp::And => "and",
            ArithOp::Or => "or",
            ArithOp::Xor => "xor",
            ArithOp::Shl => "shl",
            ArithOp::Shr => "shr",
            ArithOp::Ushr => "ushr",
        }
    }
}

/// 呼び出し種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Virtual,
    Super,
    Direct,
    Static,
    Interface,
}

impl InvokeKind {
    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => InvokeKind::Virtual,
            1 => InvokeKind::Super,
            2 => InvokeKind::Direct,
            3 => InvokeKind::Static,
            4 => InvokeKind::Interface,
            _ => return None,
        })
    }

    pub fn index(self) -> u8 {
        match self {
            InvokeKind::Virtual => 0,
            InvokeKind::Super => 1,
            InvokeKind::Direct => 2,
            InvokeKind::Static => 3,
            InvokeKind::Interface => 4,
        }
    }

    pub fn is_static(self) -> bool {
        self == InvokeKind::Static
    }

    pub fn name(self) -> &'static str {
        match self {
            InvokeKind::Virtual => "virtual",
            InvokeKind::Super => "super",
            InvokeKind::Direct => "direct",
            InvokeKind::Static => "static",
            InvokeKind::Interface => "interface",
        }
    }
}

/// 三項演算子の条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub op: CmpOp,
    /// 1つならゼロ（null）比較
    pub args: Vec<InsnArg>,
}

/// 命令木の中の引数位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgSlot {
    /// 三項演算子の条件引数
    Cond(usize),
    Arg(usize),
}

/// 命令の種類（閉じた集合）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsnKind {
    Nop,
    /// args[0] はリテラル
    Const,
    ConstString(String),
    ConstClass(ArgType),
    Move,
    /// 例外ハンドラ入口。None は全例外
    MoveException(Option<ArgType>),
    Return,
    Throw,
    MonitorEnter,
    MonitorExit,
    CheckCast(ArgType),
    InstanceOf(ArgType),
    ArrayLength,
    NewInstance(ArgType),
    /// 配列型, args[0] は要素数
    NewArray(ArgType),
    FilledNewArray(ArgType),
    FillArray { elem_width: u16, data: Vec<i64> },
    Goto { target: Offset },
    /// args が1つならゼロ比較
    If { op: CmpOp, target: Offset },
    /// default が None ならフォールスルーが既定
    Switch {
        keys: Vec<i32>,
        targets: Vec<Offset>,
        default: Option<Offset>,
    },
    /// long/float/double 比較。ty はオペランド型
    Cmp(ArgType),
    Arith { op: ArithOp, ty: ArgType },
    Neg(ArgType),
    Not(ArgType),
    Cast { from: ArgType, to: ArgType },
    /// 要素型ヒント, args = [array, index]
    ArrayGet(ArgType),
    /// args = [array, index, value]
    ArrayPut(ArgType),
    InstanceGet(FieldRef),
    InstancePut(FieldRef),
    StaticGet(FieldRef),
    StaticPut(FieldRef),
    Invoke { kind: InvokeKind, method: MethodRef },
    /// new T(args) に畳み込んだコンストラクタ呼び出し
    Construct { method: MethodRef },
    /// cond ? args[0] : args[1]
    Ternary(Box<Condition>),
}

/// 命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    pub kind: InsnKind,
    pub args: Vec<InsnArg>,
    pub result: Option<RegisterArg>,
    pub offset: Offset,
    pub line: Option<u32>,
}

impl Insn {
    pub fn new(kind: InsnKind, args: Vec<InsnArg>, result: Option<RegisterArg>, offset: Offset) -> Self {
        Self {
            kind,
            args,
            result,
            offset,
            line: None,
        }
    }

    /// 基本ブロックを終端する命令か
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InsnKind::Goto { .. }
                | InsnKind::If { .. }
                | InsnKind::Switch { .. }
                | InsnKind::Return
                | InsnKind::Throw
        )
    }

    /// 次の命令へ制御が流れうるか
    pub fn falls_through(&self) -> bool {
        match &self.kind {
            InsnKind::Goto { .. } | InsnKind::Return | InsnKind::Throw => false,
            InsnKind::Switch { default, .. } => default.is_none(),
            _ => true,
        }
    }

    /// 明示的な分岐先
    pub fn branch_targets(&self) -> Vec<Offset> {
        match &self.kind {
            InsnKind::Goto { target } | InsnKind::If { target, .. } => vec![*target],
            InsnKind::Switch {
                targets, default, ..
            } => {
                let mut all = targets.clone();
                all.extend(default.iter().copied());
                all
            }
            _ => Vec::new(),
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(
            self.kind,
            InsnKind::Const | InsnKind::ConstString(_) | InsnKind::ConstClass(_)
        )
    }

    /// この命令単体が副作用なしで評価順を入れ替えられるか
    pub fn kind_can_reorder(&self) -> bool {
        match &self.kind {
            InsnKind::Const
            | InsnKind::ConstString(_)
            | InsnKind::ConstClass(_)
            | InsnKind::Move
            | InsnKind::Neg(_)
            | InsnKind::Not(_)
            | InsnKind::Cast { .. }
            | InsnKind::Cmp(_)
            | InsnKind::InstanceOf(_)
            | InsnKind::NewArray(_)
            | InsnKind::Ternary(_) => true,
            InsnKind::Arith { op, ty } => {
                let integral_division = matches!(op, ArithOp::Div | ArithOp::Rem)
                    && !matches!(ty, ArgType::Float | ArgType::Double);
                !integral_division
            }
            _ => false,
        }
    }

    /// 命令木全体が並べ替え可能か
    pub fn can_reorder(&self) -> bool {
        if !self.kind_can_reorder() {
            return false;
        }
        let cond_ok = match &self.kind {
            InsnKind::Ternary(cond) => cond.args.iter().all(arg_can_reorder),
            _ => true,
        };
        cond_ok && self.args.iter().all(arg_can_reorder)
    }

    /// 評価順に並んだ直下の引数（三項演算子は条件が先）
    pub fn slots(&self) -> Vec<(ArgSlot, &InsnArg)> {
        let mut out = Vec::with_capacity(self.args.len() + 2);
        if let InsnKind::Ternary(cond) = &self.kind {
            for (i, arg) in cond.args.iter().enumerate() {
                out.push((ArgSlot::Cond(i), arg));
            }
        }
        for (i, arg) in self.args.iter().enumerate() {
            out.push((ArgSlot::Arg(i), arg));
        }
        out
    }

    fn slot(&self, slot: ArgSlot) -> Option<&InsnArg> {
        match slot {
            ArgSlot::Arg(i) => self.args.get(i),
            ArgSlot::Cond(i) => match &self.kind {
                InsnKind::Ternary(cond) => cond.args.get(i),
                _ => None,
            },
        }
    }

    fn slot_mut(&mut self, slot: ArgSlot) -> Option<&mut InsnArg> {
        match slot {
            ArgSlot::Arg(i) => self.args.get_mut(i),
            ArgSlot::Cond(i) => match &mut self.kind {
                InsnKind::Ternary(cond) => cond.args.get_mut(i),
                _ => None,
            },
        }
    }

    /// 根からの経路で引数を辿る
    pub fn arg_at_path(&self, path: &[ArgSlot]) -> Option<&InsnArg> {
        let (first, rest) = path.split_first()?;
        let arg = self.slot(*first)?;
        if rest.is_empty() {
            return Some(arg);
        }
        match arg {
            InsnArg::Wrapped(inner) => inner.arg_at_path(rest),
            _ => None,
        }
    }

    pub fn arg_at_path_mut(&mut self, path: &[ArgSlot]) -> Option<&mut InsnArg> {
        let (first, rest) = path.split_first()?;
        let arg = self.slot_mut(*first)?;
        if rest.is_empty() {
            return Some(arg);
        }
        match arg {
            InsnArg::Wrapped(inner) => inner.arg_at_path_mut(rest),
            _ => None,
        }
    }

    /// 命令木内のレジスタ読み出しを評価順に列挙する
    pub fn register_reads(&self) -> Vec<(Vec<ArgSlot>, &RegisterArg)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect_register_reads(&mut path, &mut out);
        out
    }

    fn collect_register_reads<'a>(
        &'a self,
        path: &mut Vec<ArgSlot>,
        out: &mut Vec<(Vec<ArgSlot>, &'a RegisterArg)>,
    ) {
        for (slot, arg) in self.slots() {
            path.push(slot);
            match arg {
                InsnArg::Register(r) => out.push((path.clone(), r)),
                InsnArg::Wrapped(inner) => inner.collect_register_reads(path, out),
                InsnArg::Literal(_) => {}
            }
            path.pop();
        }
    }

    /// 命令木が読むレジスタ集合（ワイドは2つ）
    pub fn collect_reads(&self, set: &mut RegSet) {
        for (_, r) in self.register_reads() {
            r.add_to(set);
        }
    }

    /// 命令木が書くレジスタ集合（ラップされた命令の result を含む）
    pub fn collect_writes(&self, set: &mut RegSet) {
        if let Some(r) = &self.result {
            r.add_to(set);
        }
        for (_, arg) in self.slots() {
            if let InsnArg::Wrapped(inner) = arg {
                inner.collect_writes(set);
            }
        }
    }

    /// ラップされた命令を含む全ノードを前順で訪問
    pub fn visit<F: FnMut(&Insn)>(&self, f: &mut F) {
        f(self);
        for (_, arg) in self.slots() {
            if let InsnArg::Wrapped(inner) = arg {
                inner.visit(f);
            }
        }
    }

    /// 表示用のニーモニック
    pub fn mnemonic(&self) -> String {
        match &self.kind {
            InsnKind::Nop => "nop".into(),
            InsnKind::Const => "const".into(),
            InsnKind::ConstString(s) => format!("const-string {:?}", s),
            InsnKind::ConstClass(ty) => format!("const-class {}", ty),
            InsnKind::Move => "move".into(),
            InsnKind::MoveException(ty) => match ty {
                Some(ty) => format!("move-exception {}", ty),
                None => "move-exception".into(),
            },
            InsnKind::Return => "return".into(),
            InsnKind::Throw => "throw".into(),
            InsnKind::MonitorEnter => "monitor-enter".into(),
            InsnKind::MonitorExit => "monitor-exit".into(),
            InsnKind::CheckCast(ty) => format!("check-cast {}", ty),
            InsnKind::InstanceOf(ty) => format!("instance-of {}", ty),
            InsnKind::ArrayLength => "array-length".into(),
            InsnKind::NewInstance(ty) => format!("new-instance {}", ty),
            InsnKind::NewArray(ty) => format!("new-array {}", ty),
            InsnKind::FilledNewArray(ty) => format!("filled-new-array {}", ty),
            InsnKind::FillArray { elem_width, data } => {
                format!("fill-array-data width={} {:?}", elem_width, data)
            }
            InsnKind::Goto { target } => format!("goto 0x{:04x}", target),
            InsnKind::If { op, target } => {
                format!("if-{:?} -> 0x{:04x}", op, target).to_lowercase()
            }
            InsnKind::Switch {
                keys,
                targets,
                default,
            } => {
                let cases: Vec<String> = keys
                    .iter()
                    .zip(targets.iter())
                    .map(|(k, t)| format!("{}: 0x{:04x}", k, t))
                    .collect();
                match default {
                    Some(d) => format!("switch {{{}}} default 0x{:04x}", cases.join(", "), d),
                    None => format!("switch {{{}}}", cases.join(", ")),
                }
            }
            InsnKind::Cmp(ty) => format!("cmp-{}", ty.java_name()),
            InsnKind::Arith { op, ty } => format!("{}-{}", op.name(), ty.java_name()),
            InsnKind::Neg(ty) => format!("neg-{}", ty.java_name()),
            InsnKind::Not(ty) => format!("not-{}", ty.java_name()),
            InsnKind::Cast { from, to } => {
                format!("{}-to-{}", from.java_name(), to.java_name())
            }
            InsnKind::ArrayGet(_) => "aget".into(),
            InsnKind::ArrayPut(_) => "aput".into(),
            InsnKind::InstanceGet(f) => format!("iget {}", f),
            InsnKind::InstancePut(f) => format!("iput {}", f),
            InsnKind::StaticGet(f) => format!("sget {}", f),
            InsnKind::StaticPut(f) => format!("sput {}", f),
            InsnKind::Invoke { kind, method } => format!("invoke-{} {}", kind.name(), method),
            InsnKind::Construct { method } => format!("construct {}", method),
            InsnKind::Ternary(cond) => {
                let args: Vec<String> = cond.args.iter().map(|a| a.to_string()).collect();
                format!("ternary if-{:?}({})", cond.op, args.join(", ")).to_lowercase()
            }
        }
    }
}

fn arg_can_reorder(arg: &InsnArg) -> bool {
    match arg {
        InsnArg::Wrapped(inner) => inner.can_reorder(),
        _ => true,
    }
}

impl fmt::Display for RegisterArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.reg)
    }
}

impl fmt::Display for InsnArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsnArg::Register(r) => write!(f, "{}", r),
            InsnArg::Literal(l) => write!(f, "#{}", l.value),
            InsnArg::Wrapped(insn) => write!(f, "({})", insn),
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = &self.result {
            write!(f, "{} = ", result)?;
        }
        write!(f, "{}", self.mnemonic())?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
            write!(f, " {}", args.join(", "))?;
        }
        Ok(())
    }
}
