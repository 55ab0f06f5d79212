/// Dalvik アセンブラ
///
/// テスト・ベンチマーク・デモ用に、ラベル付きで Dalvik コードユニット列を組み立てる。
/// 分岐先はラベルで書き、finish() で相対オフセットを埋める。
/// switch のペイロードは命令列の末尾（偶数位置）に置く。

use crate::decompiler::insn::{ArithOp, CmpOp, InvokeKind, Offset, RegNum};
use crate::decompiler::loader::{BytecodeFormat, CatchHandler, LineEntry, RawMethod, TryBlock};
use crate::decompiler::types::ArgType;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsmError {
    #[error("undefined label {0:?}")]
    UndefinedLabel(String),

    #[error("label {0:?} defined twice")]
    DuplicateLabel(String),

    #[error("branch to {label:?} at 0x{offset:04x} does not fit in {bits} bits")]
    OutOfRange {
        label: String,
        offset: Offset,
        bits: u32,
    },

    #[error("register v{reg} does not fit in {bits} bits at 0x{offset:04x}")]
    Register { reg: RegNum, bits: u32, offset: Offset },
}

/// 相対オフセットの埋め方
#[derive(Debug, Clone, Copy)]
enum FixupKind {
    /// 上位バイト（goto）
    High8,
    /// 次のユニット（goto/16, if-*）
    Unit16,
    /// 次の2ユニット（goto/32）
    Unit32,
    /// switch ペイロードの分岐先（基準は switch 命令）
    Payload32 { base: usize },
}

#[derive(Debug, Clone)]
struct Fixup {
    /// 命令の先頭
    insn: usize,
    /// 書き込み位置
    at: usize,
    label: String,
    kind: FixupKind,
}

#[derive(Debug, Clone)]
enum SwitchBody {
    Packed { first_key: i32 },
    Sparse { keys: Vec<i32> },
}

#[derive(Debug, Clone)]
struct PendingSwitch {
    insn: usize,
    body: SwitchBody,
    targets: Vec<String>,
}

#[derive(Debug, Clone)]
struct PendingTry {
    start: String,
    end: String,
    handlers: Vec<(Option<ArgType>, String)>,
}

/// ラベル付き Dalvik アセンブラ
#[derive(Debug, Clone, Default)]
pub struct DalvikAssembler {
    units: Vec<u16>,
    labels: HashMap<String, usize>,
    fixups: Vec<Fixup>,
    switches: Vec<PendingSwitch>,
    tries: Vec<PendingTry>,
    lines: Vec<LineEntry>,
    error: Option<AsmError>,
}

/// 組み立て済みのコード
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub units: Vec<u16>,
    pub tries: Vec<TryBlock>,
    pub lines: Vec<LineEntry>,
}

impl Assembled {
    /// リトルエンディアンのバイト列
    pub fn bytes(&self) -> Vec<u8> {
        self.units.iter().flat_map(|u| u.to_le_bytes()).collect()
    }

    pub fn into_raw(self, registers: u16) -> RawMethod {
        RawMethod {
            format: BytecodeFormat::Dalvik,
            registers,
            max_stack: 0,
            code: self.bytes(),
            tries: self.tries,
            lines: self.lines,
        }
    }
}

impl DalvikAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在位置（コードユニット）
    pub fn pc(&self) -> Offset {
        self.units.len() as Offset
    }

    fn fail(&mut self, error: AsmError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn nibble(&mut self, reg: RegNum) -> u16 {
        if reg > 0x0f {
            let offset = self.pc();
            self.fail(AsmError::Register { reg, bits: 4, offset });
        }
        reg & 0x0f
    }

    fn byte(&mut self, reg: RegNum) -> u16 {
        if reg > 0xff {
            let offset = self.pc();
            self.fail(AsmError::Register { reg, bits: 8, offset });
        }
        reg & 0xff
    }

    /// op | AA
    fn op_aa(&mut self, op: u8, aa: RegNum) -> &mut Self {
        let aa = self.byte(aa);
        self.units.push(op as u16 | aa << 8);
        self
    }

    /// op | B|A
    fn op_ba(&mut self, op: u8, a: RegNum, b: RegNum) -> &mut Self {
        let a = self.nibble(a);
        let b = self.nibble(b);
        self.units.push(op as u16 | a << 8 | b << 12);
        self
    }

    /// 生のコードユニット
    pub fn raw(&mut self, unit: u16) -> &mut Self {
        self.units.push(unit);
        self
    }

    /// 現在位置にラベルを付ける
    pub fn label(&mut self, name: &str) -> &mut Self {
        if self.labels.insert(name.to_string(), self.units.len()).is_some() {
            self.fail(AsmError::DuplicateLabel(name.to_string()));
        }
        self
    }

    /// 現在位置にソース行を付ける
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.lines.push(LineEntry {
            offset: self.pc(),
            line,
        });
        self
    }

    /// [start, end) を try 範囲にする（例外型 None は catch-all）
    pub fn try_range(&mut self, start: &str, end: &str, handlers: &[(Option<&str>, &str)]) -> &mut Self {
        self.tries.push(PendingTry {
            start: start.to_string(),
            end: end.to_string(),
            handlers: handlers
                .iter()
                .map(|(ty, target)| (ty.map(ArgType::object), target.to_string()))
                .collect(),
        });
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.raw(0x0000)
    }

    pub fn move_reg(&mut self, dst: RegNum, src: RegNum) -> &mut Self {
        self.op_ba(0x01, dst, src)
    }

    pub fn move_wide(&mut self, dst: RegNum, src: RegNum) -> &mut Self {
        self.op_ba(0x04, dst, src)
    }

    pub fn move_object(&mut self, dst: RegNum, src: RegNum) -> &mut Self {
        self.op_ba(0x07, dst, src)
    }

    pub fn move_result(&mut self, dst: RegNum) -> &mut Self {
        self.op_aa(0x0a, dst)
    }

    pub fn move_result_wide(&mut self, dst: RegNum) -> &mut Self {
        self.op_aa(0x0b, dst)
    }

    pub fn move_result_object(&mut self, dst: RegNum) -> &mut Self {
        self.op_aa(0x0c, dst)
    }

    pub fn move_exception(&mut self, dst: RegNum) -> &mut Self {
        self.op_aa(0x0d, dst)
    }

    pub fn return_void(&mut self) -> &mut Self {
        self.raw(0x000e)
    }

    pub fn return_value(&mut self, reg: RegNum) -> &mut Self {
        self.op_aa(0x0f, reg)
    }

    pub fn return_wide(&mut self, reg: RegNum) -> &mut Self {
        self.op_aa(0x10, reg)
    }

    pub fn return_object(&mut self, reg: RegNum) -> &mut Self {
        self.op_aa(0x11, reg)
    }

    /// 値の幅に合う最小の const 命令を選ぶ
    pub fn const_int(&mut self, dst: RegNum, value: i32) -> &mut Self {
        if (-8..8).contains(&value) && dst < 16 {
            let dst = self.nibble(dst);
            self.units.push(0x12 | dst << 8 | ((value as u16) & 0x0f) << 12);
            self
        } else if i16::try_from(value).is_ok() {
            self.op_aa(0x13, dst);
            self.raw(value as i16 as u16)
        } else if value & 0xffff == 0 {
            self.op_aa(0x15, dst);
            self.raw((value as u32 >> 16) as u16)
        } else {
            self.op_aa(0x14, dst);
            self.raw(value as u32 as u16);
            self.raw((value as u32 >> 16) as u16)
        }
    }

    pub fn const_wide(&mut self, dst: RegNum, value: i64) -> &mut Self {
        if let Ok(small) = i16::try_from(value) {
            self.op_aa(0x16, dst);
            self.raw(small as u16)
        } else if let Ok(mid) = i32::try_from(value) {
            self.op_aa(0x17, dst);
            self.raw(mid as u32 as u16);
            self.raw((mid as u32 >> 16) as u16)
        } else {
            self.op_aa(0x18, dst);
            let bits = value as u64;
            for shift in [0, 16, 32, 48] {
                self.raw((bits >> shift) as u16);
            }
            self
        }
    }

    pub fn const_string(&mut self, dst: RegNum, string_idx: u32) -> &mut Self {
        self.op_aa(0x1a, dst);
        self.raw(string_idx as u16)
    }

    pub fn const_class(&mut self, dst: RegNum, type_idx: u32) -> &mut Self {
        self.op_aa(0x1c, dst);
        self.raw(type_idx as u16)
    }

    pub fn monitor_enter(&mut self, reg: RegNum) -> &mut Self {
        self.op_aa(0x1d, reg)
    }

    pub fn monitor_exit(&mut self, reg: RegNum) -> &mut Self {
        self.op_aa(0x1e, reg)
    }

    pub fn check_cast(&mut self, reg: RegNum, type_idx: u32) -> &mut Self {
        self.op_aa(0x1f, reg);
        self.raw(type_idx as u16)
    }

    pub fn instance_of(&mut self, dst: RegNum, src: RegNum, type_idx: u32) -> &mut Self {
        self.op_ba(0x20, dst, src);
        self.raw(type_idx as u16)
    }

    pub fn array_length(&mut self, dst: RegNum, array: RegNum) -> &mut Self {
        self.op_ba(0x21, dst, array)
    }

    pub fn new_instance(&mut self, dst: RegNum, type_idx: u32) -> &mut Self {
        self.op_aa(0x22, dst);
        self.raw(type_idx as u16)
    }

    pub fn new_array(&mut self, dst: RegNum, size: RegNum, type_idx: u32) -> &mut Self {
        self.op_ba(0x23, dst, size);
        self.raw(type_idx as u16)
    }

    pub fn throw(&mut self, reg: RegNum) -> &mut Self {
        self.op_aa(0x27, reg)
    }

    fn branch(&mut self, label: &str, kind: FixupKind, insn: usize, at: usize) {
        self.fixups.push(Fixup {
            insn,
            at,
            label: label.to_string(),
            kind,
        });
    }

    /// goto（8ビット相対）
    pub fn goto(&mut self, label: &str) -> &mut Self {
        let insn = self.units.len();
        self.raw(0x0028);
        self.branch(label, FixupKind::High8, insn, insn);
        self
    }

    pub fn goto16(&mut self, label: &str) -> &mut Self {
        let insn = self.units.len();
        self.raw(0x0029).raw(0);
        self.branch(label, FixupKind::Unit16, insn, insn + 1);
        self
    }

    pub fn goto32(&mut self, label: &str) -> &mut Self {
        let insn = self.units.len();
        self.raw(0x002a).raw(0).raw(0);
        self.branch(label, FixupKind::Unit32, insn, insn + 1);
        self
    }

    /// if-test vA, vB
    pub fn if_cmp(&mut self, op: CmpOp, a: RegNum, b: RegNum, label: &str) -> &mut Self {
        let insn = self.units.len();
        self.op_ba(0x32 + op.index(), a, b);
        self.raw(0);
        self.branch(label, FixupKind::Unit16, insn, insn + 1);
        self
    }

    /// if-testz vAA
    pub fn if_zero(&mut self, op: CmpOp, reg: RegNum, label: &str) -> &mut Self {
        let insn = self.units.len();
        self.op_aa(0x38 + op.index(), reg);
        self.raw(0);
        self.branch(label, FixupKind::Unit16, insn, insn + 1);
        self
    }

    pub fn packed_switch(&mut self, reg: RegNum, first_key: i32, targets: &[&str]) -> &mut Self {
        self.switch(0x2b, reg, SwitchBody::Packed { first_key }, targets)
    }

    pub fn sparse_switch(&mut self, reg: RegNum, cases: &[(i32, &str)]) -> &mut Self {
        let keys = cases.iter().map(|(k, _)| *k).collect();
        let targets: Vec<&str> = cases.iter().map(|(_, t)| *t).collect();
        self.switch(0x2c, reg, SwitchBody::Sparse { keys }, &targets)
    }

    fn switch(&mut self, op: u8, reg: RegNum, body: SwitchBody, targets: &[&str]) -> &mut Self {
        let insn = self.units.len();
        self.op_aa(op, reg);
        self.raw(0).raw(0);
        self.switches.push(PendingSwitch {
            insn,
            body,
            targets: targets.iter().map(|t| t.to_string()).collect(),
        });
        self
    }

    /// cmpl-float / cmpg-float / cmpl-double / cmpg-double / cmp-long（0..=4）
    pub fn cmp(&mut self, variant: u8, dst: RegNum, a: RegNum, b: RegNum) -> &mut Self {
        let a = self.byte(a);
        let b = self.byte(b);
        self.op_aa(0x2d + variant.min(4), dst);
        self.raw(a | b << 8)
    }

    /// aget 系（variant 0..=6: 無印, wide, object, boolean, byte, char, short）
    pub fn aget(&mut self, variant: u8, dst: RegNum, array: RegNum, index: RegNum) -> &mut Self {
        let array = self.byte(array);
        let index = self.byte(index);
        self.op_aa(0x44 + variant.min(6), dst);
        self.raw(array | index << 8)
    }

    pub fn aput(&mut self, variant: u8, src: RegNum, array: RegNum, index: RegNum) -> &mut Self {
        let array = self.byte(array);
        let index = self.byte(index);
        self.op_aa(0x4b + variant.min(6), src);
        self.raw(array | index << 8)
    }

    pub fn iget(&mut self, dst: RegNum, object: RegNum, field_idx: u32) -> &mut Self {
        self.op_ba(0x52, dst, object);
        self.raw(field_idx as u16)
    }

    pub fn iget_object(&mut self, dst: RegNum, object: RegNum, field_idx: u32) -> &mut Self {
        self.op_ba(0x54, dst, object);
        self.raw(field_idx as u16)
    }

    pub fn iput(&mut self, src: RegNum, object: RegNum, field_idx: u32) -> &mut Self {
        self.op_ba(0x59, src, object);
        self.raw(field_idx as u16)
    }

    pub fn iput_object(&mut self, src: RegNum, object: RegNum, field_idx: u32) -> &mut Self {
        self.op_ba(0x5b, src, object);
        self.raw(field_idx as u16)
    }

    pub fn sget(&mut self, dst: RegNum, field_idx: u32) -> &mut Self {
        self.op_aa(0x60, dst);
        self.raw(field_idx as u16)
    }

    pub fn sget_object(&mut self, dst: RegNum, field_idx: u32) -> &mut Self {
        self.op_aa(0x62, dst);
        self.raw(field_idx as u16)
    }

    pub fn sput(&mut self, src: RegNum, field_idx: u32) -> &mut Self {
        self.op_aa(0x67, src);
        self.raw(field_idx as u16)
    }

    pub fn sput_object(&mut self, src: RegNum, field_idx: u32) -> &mut Self {
        self.op_aa(0x69, src);
        self.raw(field_idx as u16)
    }

    /// invoke-kind {regs}（最大5レジスタ）
    pub fn invoke(&mut self, kind: InvokeKind, method_idx: u32, regs: &[RegNum]) -> &mut Self {
        let mut packed = [0u16; 5];
        for (slot, reg) in packed.iter_mut().zip(regs) {
            *slot = self.nibble(*reg);
        }
        let count = regs.len().min(5) as u16;
        let u0 = (0x6e + kind.index()) as u16 | packed[4] << 8 | count << 12;
        let u2 = packed[0] | packed[1] << 4 | packed[2] << 8 | packed[3] << 12;
        self.raw(u0).raw(method_idx as u16).raw(u2)
    }

    /// invoke-kind/range {vFirst .. vFirst+count-1}
    pub fn invoke_range(&mut self, kind: InvokeKind, method_idx: u32, first: RegNum, count: u8) -> &mut Self {
        let u0 = (0x74 + kind.index()) as u16 | (count as u16) << 8;
        self.raw(u0).raw(method_idx as u16).raw(first)
    }

    pub fn invoke_static(&mut self, method_idx: u32, regs: &[RegNum]) -> &mut Self {
        self.invoke(InvokeKind::Static, method_idx, regs)
    }

    pub fn invoke_virtual(&mut self, method_idx: u32, regs: &[RegNum]) -> &mut Self {
        self.invoke(InvokeKind::Virtual, method_idx, regs)
    }

    pub fn invoke_direct(&mut self, method_idx: u32, regs: &[RegNum]) -> &mut Self {
        self.invoke(InvokeKind::Direct, method_idx, regs)
    }

    /// 単項演算・型変換（0x7b..=0x8f）
    pub fn unop(&mut self, op: u8, dst: RegNum, src: RegNum) -> &mut Self {
        self.op_ba(op, dst, src)
    }

    /// int の binop vAA, vBB, vCC
    pub fn binop_int(&mut self, op: ArithOp, dst: RegNum, a: RegNum, b: RegNum) -> &mut Self {
        let a = self.byte(a);
        let b = self.byte(b);
        self.op_aa(0x90 + op.index(), dst);
        self.raw(a | b << 8)
    }

    /// int の binop/2addr vA, vB
    pub fn binop_int_2addr(&mut self, op: ArithOp, dst: RegNum, src: RegNum) -> &mut Self {
        self.op_ba(0xb0 + op.index(), dst, src)
    }

    /// add-int/lit8 など（op は lit8 表の並び: add, rsub, mul, div, rem, and, or, xor, shl, shr, ushr）
    pub fn binop_lit8(&mut self, index: u8, dst: RegNum, src: RegNum, lit: i8) -> &mut Self {
        let src = self.byte(src);
        self.op_aa(0xd8 + index.min(10), dst);
        self.raw(src | (lit as u8 as u16) << 8)
    }

    pub fn add_int_lit8(&mut self, dst: RegNum, src: RegNum, lit: i8) -> &mut Self {
        self.binop_lit8(0, dst, src, lit)
    }

    fn resolve(&self, label: &str) -> Result<usize, AsmError> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| AsmError::UndefinedLabel(label.to_string()))
    }

    /// ラベルを解決してコードを返す
    pub fn finish(&self) -> Result<Assembled, AsmError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let mut units = self.units.clone();
        let mut fixups = self.fixups.clone();

        for sw in &self.switches {
            if units.len() % 2 != 0 {
                units.push(0x0000);
            }
            let payload = units.len();
            let rel = (payload as i64 - sw.insn as i64) as i32 as u32;
            units[sw.insn + 1] = rel as u16;
            units[sw.insn + 2] = (rel >> 16) as u16;

            let count = sw.targets.len() as u16;
            match &sw.body {
                SwitchBody::Packed { first_key } => {
                    units.extend([0x0100, count]);
                    units.extend([*first_key as u32 as u16, (*first_key as u32 >> 16) as u16]);
                }
                SwitchBody::Sparse { keys } => {
                    units.extend([0x0200, count]);
                    for k in keys {
                        units.extend([*k as u32 as u16, (*k as u32 >> 16) as u16]);
                    }
                }
            }
            for target in &sw.targets {
                let at = units.len();
                units.extend([0, 0]);
                fixups.push(Fixup {
                    insn: sw.insn,
                    at,
                    label: target.clone(),
                    kind: FixupKind::Payload32 { base: sw.insn },
                });
            }
        }

        for f in &fixups {
            let target = self.resolve(&f.label)?;
            let base = match f.kind {
                FixupKind::Payload32 { base } => base,
                _ => f.insn,
            };
            let rel = target as i64 - base as i64;
            let out_of_range = |bits: u32| AsmError::OutOfRange {
                label: f.label.clone(),
                offset: f.insn as Offset,
                bits,
            };
            match f.kind {
                FixupKind::High8 => {
                    let rel = i8::try_from(rel).map_err(|_| out_of_range(8))?;
                    if rel == 0 {
                        return Err(out_of_range(8));
                    }
                    units[f.at] = (units[f.at] & 0x00ff) | (rel as u8 as u16) << 8;
                }
                FixupKind::Unit16 => {
                    let rel = i16::try_from(rel).map_err(|_| out_of_range(16))?;
                    units[f.at] = rel as u16;
                }
                FixupKind::Unit32 | FixupKind::Payload32 { .. } => {
                    let rel = i32::try_from(rel).map_err(|_| out_of_range(32))? as u32;
                    units[f.at] = rel as u16;
                    units[f.at + 1] = (rel >> 16) as u16;
                }
            }
        }

        let mut tries = Vec::with_capacity(self.tries.len());
        for t in &self.tries {
            let mut handlers = Vec::with_capacity(t.handlers.len());
            for (exception, target) in &t.handlers {
                handlers.push(CatchHandler {
                    exception: exception.clone(),
                    target: self.resolve(target)? as Offset,
                });
            }
            tries.push(TryBlock {
                start: self.resolve(&t.start)? as Offset,
                end: self.resolve(&t.end)? as Offset,
                handlers,
            });
        }

        Ok(Assembled {
            units,
            tries,
            lines: self.lines.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_forms() {
        let mut asm = DalvikAssembler::new();
        asm.const_int(0, 5).const_int(1, 300).const_int(2, 0x10000).const_int(3, 0x12345);
        let out = asm.finish().unwrap();
        assert_eq!(
            out.units,
            vec![0x5012, 0x0113, 300, 0x0215, 0x0001, 0x0314, 0x2345, 0x0001]
        );
    }

    #[test]
    fn test_forward_and_backward_branches() {
        let mut asm = DalvikAssembler::new();
        asm.label("top")
            .if_zero(CmpOp::Eq, 0, "done")
            .goto("top")
            .label("done")
            .return_void();
        let out = asm.finish().unwrap();
        assert_eq!(out.units, vec![0x0038, 0x0003, 0xfe28, 0x000e]);
    }

    #[test]
    fn test_invoke_packing() {
        let mut asm = DalvikAssembler::new();
        asm.invoke_static(7, &[1, 2]);
        let out = asm.finish().unwrap();
        assert_eq!(out.units, vec![0x2071, 0x0007, 0x0021]);
    }

    #[test]
    fn test_packed_switch_payload_is_aligned() {
        let mut asm = DalvikAssembler::new();
        asm.packed_switch(0, 10, &["a", "b"])
            .label("a")
            .return_void()
            .label("b")
            .return_void();
        let out = asm.finish().unwrap();
        // 3 + 2 命令、1 ユニットの詰め物、ペイロード
        assert_eq!(&out.units[..3], &[0x002b, 0x0006, 0x0000]);
        assert_eq!(out.units[5], 0x0000);
        assert_eq!(&out.units[6..10], &[0x0100, 0x0002, 0x000a, 0x0000]);
        assert_eq!(&out.units[10..], &[0x0003, 0x0000, 0x0004, 0x0000]);
    }

    #[test]
    fn test_undefined_label() {
        let mut asm = DalvikAssembler::new();
        asm.goto("nowhere");
        assert_eq!(asm.finish(), Err(AsmError::UndefinedLabel("nowhere".into())));
    }

    #[test]
    fn test_try_range_resolves_labels() {
        let mut asm = DalvikAssembler::new();
        asm.label("s")
            .invoke_static(0, &[])
            .label("e")
            .return_void()
            .label("h")
            .move_exception(0)
            .return_void();
        asm.try_range("s", "e", &[(Some("java/io/IOException"), "h")]);
        let out = asm.finish().unwrap();
        assert_eq!(out.tries[0].start, 0);
        assert_eq!(out.tries[0].end, 3);
        assert_eq!(out.tries[0].handlers[0].target, 4);
        assert_eq!(
            out.tries[0].handlers[0].exception,
            Some(ArgType::object("java.io.IOException"))
        );
    }
}
