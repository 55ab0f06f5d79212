/// クラスファイル（JVM）バイトコードデコーダ
///
/// オペランドスタックを模擬してスタック値をレジスタへ割り当てる。
/// スタックの k 番目のスロットはレジスタ `max_locals + k` に対応する。
///
/// 1. 命令を線形に解析（RawOp）
/// 2. ワークリストで各命令の入口スタック形状を求める（合流点で一致を検査）
/// 3. 形状に従って共通IRを生成する

use crate::decompiler::insn::{
    ArithOp, CmpOp, Insn, InsnArg, InsnKind, InvokeKind, Offset, RegNum, RegisterArg,
};
use crate::decompiler::pool::{LoadableConstant, MethodRef, RefResolver};
use crate::decompiler::types::{literal_candidates, ArgType, PrimitiveSet};
use crate::error::DecodeError;
use std::collections::HashMap;

/// スワップ・dup 用の一時レジスタ数
pub const TEMP_SLOTS: u16 = 4;

/// スタック値のカテゴリ（1スロット / 2スロット）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cat {
    One,
    Two,
}

impl Cat {
    fn of(ty: &ArgType) -> Self {
        if ty.is_wide() {
            Cat::Two
        } else {
            Cat::One
        }
    }

    fn size(self) -> u16 {
        match self {
            Cat::One => 1,
            Cat::Two => 2,
        }
    }
}

/// 解析済みオペランド
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    None,
    Local(u16),
    Iinc { local: u16, delta: i32 },
    Int(i32),
    Pool(u32),
    Branch(Offset),
    Switch {
        keys: Vec<i32>,
        targets: Vec<Offset>,
        default: Offset,
    },
    ArrayType(u8),
}

#[derive(Debug, Clone)]
struct RawOp {
    offset: Offset,
    opcode: u8,
    operand: Operand,
    len: usize,
}

/// 制御の流れ
struct Flow {
    falls_through: bool,
    targets: Vec<Offset>,
}

impl Flow {
    fn next() -> Self {
        Flow {
            falls_through: true,
            targets: Vec::new(),
        }
    }

    fn stop() -> Self {
        Flow {
            falls_through: false,
            targets: Vec::new(),
        }
    }
}

/// クラスファイル命令デコーダ
pub struct JvmDecoder<'a> {
    code: &'a [u8],
    pool: &'a dyn RefResolver,
    class_name: &'a str,
    max_locals: u16,
    max_stack: u16,
    /// (ハンドラ開始オフセット, 捕捉型)
    handlers: Vec<(Offset, Option<ArgType>)>,
}

impl<'a> JvmDecoder<'a> {
    pub fn new(
        code: &'a [u8],
        pool: &'a dyn RefResolver,
        class_name: &'a str,
        max_locals: u16,
        max_stack: u16,
    ) -> Self {
        Self {
            code,
            pool,
            class_name,
            max_locals,
            max_stack,
            handlers: Vec::new(),
        }
    }

    pub fn with_handlers(mut self, handlers: Vec<(Offset, Option<ArgType>)>) -> Self {
        self.handlers = handlers;
        self
    }

    /// 必要なレジスタ総数
    pub fn register_count(&self) -> Result<u16, DecodeError> {
        self.max_locals
            .checked_add(self.max_stack)
            .and_then(|n| n.checked_add(TEMP_SLOTS))
            .ok_or(DecodeError::Malformed {
                offset: 0,
                message: "register count overflow".into(),
            })
    }

    pub fn decode_all(&self) -> Result<Vec<Insn>, DecodeError> {
        self.register_count()?;
        let ops = self.parse_ops()?;
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let index_of: HashMap<Offset, usize> =
            ops.iter().enumerate().map(|(i, op)| (op.offset, i)).collect();
        let lookup = |target: Offset, from: Offset| {
            index_of.get(&target).copied().ok_or(DecodeError::Malformed {
                offset: from,
                message: format!("branch target 0x{:04x} is not an instruction boundary", target),
            })
        };

        // 入口スタック形状の計算
        let mut states: Vec<Option<Vec<Cat>>> = vec![None; ops.len()];
        let mut work = vec![0usize];
        states[0] = Some(Vec::new());
        for (target, _) in &self.handlers {
            let idx = lookup(*target, *target)?;
            states[idx] = Some(vec![Cat::One]);
            work.push(idx);
        }

        let mut scratch = Vec::new();
        while let Some(i) = work.pop() {
            let mut stack = states[i].clone().unwrap_or_default();
            scratch.clear();
            let flow = self.step(&ops[i], &mut stack, &mut scratch)?;

            let mut succs = Vec::new();
            if flow.falls_through {
                if i + 1 >= ops.len() {
                    return Err(DecodeError::Malformed {
                        offset: ops[i].offset,
                        message: "execution falls off the end of the code".into(),
                    });
                }
                succs.push(i + 1);
            }
            for t in &flow.targets {
                succs.push(lookup(*t, ops[i].offset)?);
            }

            for s in succs {
                match &states[s] {
                    None => {
                        states[s] = Some(stack.clone());
                        work.push(s);
                    }
                    Some(existing) if *existing != stack => {
                        return Err(DecodeError::Malformed {
                            offset: ops[s].offset,
                            message: "inconsistent stack shape at merge point".into(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        // 命令生成（到達不能な命令は捨てる）
        let mut out = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            let Some(state) = &states[i] else { continue };
            if let Some((_, catch_type)) = self.handlers.iter().find(|(t, _)| *t == op.offset) {
                let exc_ty = catch_type
                    .clone()
                    .unwrap_or_else(|| ArgType::object("java.lang.Throwable"));
                out.push(Insn::new(
                    InsnKind::MoveException(catch_type.clone()),
                    vec![],
                    Some(RegisterArg::typed(self.max_locals, exc_ty)),
                    op.offset,
                ));
            }
            let mut stack = state.clone();
            self.step(op, &mut stack, &mut out)?;
        }
        Ok(out)
    }

    /// 寛容な命令リスト（解析できない残りは16進で出力）
    pub fn disassemble(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut pc = 0usize;
        while pc < self.code.len() {
            match self.parse_op(pc) {
                Ok(op) => {
                    lines.push(format!(
                        "0x{:04x}: opcode 0x{:02x} {:?}",
                        op.offset, op.opcode, op.operand
                    ));
                    pc += op.len;
                }
                Err(_) => {
                    for chunk in self.code[pc..].chunks(16) {
                        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                        lines.push(format!("0x{:04x}: .bytes {}", pc, hex.join(" ")));
                        pc += chunk.len();
                    }
                }
            }
        }
        lines
    }

    fn parse_ops(&self) -> Result<Vec<RawOp>, DecodeError> {
        let mut ops = Vec::new();
        let mut pc = 0usize;
        while pc < self.code.len() {
            let op = self.parse_op(pc)?;
            pc += op.len;
            ops.push(op);
        }
        Ok(ops)
    }

    fn byte(&self, at: usize, op_offset: usize) -> Result<u8, DecodeError> {
        self.code.get(at).copied().ok_or(DecodeError::Truncated {
            offset: op_offset as Offset,
        })
    }

    fn u16_at(&self, at: usize, op_offset: usize) -> Result<u16, DecodeError> {
        Ok(((self.byte(at, op_offset)? as u16) << 8) | self.byte(at + 1, op_offset)? as u16)
    }

    fn i32_at(&self, at: usize, op_offset: usize) -> Result<i32, DecodeError> {
        let hi = self.u16_at(at, op_offset)? as u32;
        let lo = self.u16_at(at + 2, op_offset)? as u32;
        Ok(((hi << 16) | lo) as i32)
    }

    fn branch(&self, pc: usize, rel: i32) -> Result<Offset, DecodeError> {
        u32::try_from(pc as i64 + rel as i64).map_err(|_| DecodeError::Malformed {
            offset: pc as Offset,
            message: format!("branch offset {} leaves the method", rel),
        })
    }

    fn parse_op(&self, pc: usize) -> Result<RawOp, DecodeError> {
        let opcode = self.byte(pc, pc)?;
        let unknown = DecodeError::UnknownOpcode {
            opcode: opcode as u16,
            offset: pc as Offset,
        };
        let (operand, len) = match opcode {
            0x10 => (Operand::Int(self.byte(pc + 1, pc)? as i8 as i32), 2),
            0x11 => (Operand::Int(self.u16_at(pc + 1, pc)? as i16 as i32), 3),
            0x12 => (Operand::Pool(self.byte(pc + 1, pc)? as u32), 2),
            0x13 | 0x14 => (Operand::Pool(self.u16_at(pc + 1, pc)? as u32), 3),
            0x15..=0x19 | 0x36..=0x3a => (Operand::Local(self.byte(pc + 1, pc)? as u16), 2),
            0x84 => (
                Operand::Iinc {
                    local: self.byte(pc + 1, pc)? as u16,
                    delta: self.byte(pc + 2, pc)? as i8 as i32,
                },
                3,
            ),
            0x99..=0xa7 | 0xc6 | 0xc7 => {
                let rel = self.u16_at(pc + 1, pc)? as i16 as i32;
                (Operand::Branch(self.branch(pc, rel)?), 3)
            }
            0xc8 => {
                let rel = self.i32_at(pc + 1, pc)?;
                (Operand::Branch(self.branch(pc, rel)?), 5)
            }
            0xaa | 0xab => self.parse_switch(pc, opcode)?,
            0xb2..=0xb8 | 0xbb | 0xbd | 0xc0 | 0xc1 => {
                (Operand::Pool(self.u16_at(pc + 1, pc)? as u32), 3)
            }
            0xb9 => (Operand::Pool(self.u16_at(pc + 1, pc)? as u32), 5),
            0xbc => (Operand::ArrayType(self.byte(pc + 1, pc)?), 2),
            0xc4 => return self.parse_wide(pc),
            // jsr / ret / invokedynamic / multianewarray / jsr_w は非対応
            0xa8 | 0xa9 | 0xba | 0xc5 | 0xc9 => return Err(unknown),
            0x00..=0x0f | 0x1a..=0x35 | 0x3b..=0x83 | 0x85..=0x98 | 0xac..=0xb1 => {
                (Operand::None, 1)
            }
            0xbe | 0xbf | 0xc2 | 0xc3 => (Operand::None, 1),
            _ => return Err(unknown),
        };
        Ok(RawOp {
            offset: pc as Offset,
            opcode,
            operand,
            len,
        })
    }

    fn parse_wide(&self, pc: usize) -> Result<RawOp, DecodeError> {
        let opcode = self.byte(pc + 1, pc)?;
        let local = self.u16_at(pc + 2, pc)?;
        let (operand, len) = match opcode {
            0x15..=0x19 | 0x36..=0x3a => (Operand::Local(local), 4),
            0x84 => (
                Operand::Iinc {
                    local,
                    delta: self.u16_at(pc + 4, pc)? as i16 as i32,
                },
                6,
            ),
            _ => {
                return Err(DecodeError::UnknownOpcode {
                    opcode: 0xc400 | opcode as u16,
                    offset: pc as Offset,
                })
            }
        };
        Ok(RawOp {
            offset: pc as Offset,
            opcode,
            operand,
            len,
        })
    }

    fn parse_switch(&self, pc: usize, opcode: u8) -> Result<(Operand, usize), DecodeError> {
        let pad = (4 - (pc + 1) % 4) % 4;
        let p = pc + 1 + pad;
        let default = self.branch(pc, self.i32_at(p, pc)?)?;
        let mut keys = Vec::new();
        let mut targets = Vec::new();

        let end = if opcode == 0xaa {
            let low = self.i32_at(p + 4, pc)?;
            let high = self.i32_at(p + 8, pc)?;
            if high < low {
                return Err(DecodeError::BadPayload {
                    offset: pc as Offset,
                    message: format!("tableswitch range {}..{}", low, high),
                });
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            for i in 0..count {
                keys.push(low.wrapping_add(i as i32));
                targets.push(self.branch(pc, self.i32_at(p + 12 + i * 4, pc)?)?);
            }
            p + 12 + count * 4
        } else {
            let npairs = self.i32_at(p + 4, pc)?;
            if npairs < 0 {
                return Err(DecodeError::BadPayload {
                    offset: pc as Offset,
                    message: format!("lookupswitch with {} pairs", npairs),
                });
            }
            for i in 0..npairs as usize {
                keys.push(self.i32_at(p + 8 + i * 8, pc)?);
                targets.push(self.branch(pc, self.i32_at(p + 12 + i * 8, pc)?)?);
            }
            p + 8 + npairs as usize * 8
        };

        Ok((
            Operand::Switch {
                keys,
                targets,
                default,
            },
            end - pc,
        ))
    }

    fn pool_method(&self, index: u32, offset: Offset) -> Result<MethodRef, DecodeError> {
        self.pool
            .method(index)
            .cloned()
            .ok_or(DecodeError::BadReference {
                kind: "method",
                index,
                offset,
            })
    }

    fn pool_type(&self, index: u32, offset: Offset) -> Result<ArgType, DecodeError> {
        self.pool
            .type_ref(index)
            .cloned()
            .ok_or(DecodeError::BadReference {
                kind: "class",
                index,
                offset,
            })
    }

    /// 1命令分のスタック効果を適用し、対応するIRを out へ追加する
    fn step(&self, op: &RawOp, stack: &mut Vec<Cat>, out: &mut Vec<Insn>) -> Result<Flow, DecodeError> {
        let off = op.offset;
        let mut frame = Frame {
            stack,
            base: self.max_locals,
            max_stack: self.max_stack,
            offset: off,
        };
        let emit = |out: &mut Vec<Insn>, kind: InsnKind, args: Vec<InsnArg>, result: Option<RegisterArg>| {
            out.push(Insn::new(kind, args, result, off));
        };
        let pool_index = || match op.operand {
            Operand::Pool(idx) => Ok(idx),
            _ => Err(DecodeError::Malformed {
                offset: off,
                message: "missing constant pool operand".into(),
            }),
        };

        match op.opcode {
            0x00 => {}

            // 定数
            0x01 => {
                let ty = ArgType::Narrow(PrimitiveSet::REFERENCE);
                let r = frame.push(Cat::One)?;
                emit(out, InsnKind::Const, vec![InsnArg::lit(0, ty.clone())], Some(RegisterArg::typed(r, ty)));
            }
            0x02..=0x08 => {
                let r = frame.push(Cat::One)?;
                out.push(int_const(off, r, op.opcode as i64 - 3));
            }
            0x09 | 0x0a => {
                let r = frame.push(Cat::Two)?;
                out.push(typed_const(off, r, op.opcode as i64 - 0x09, ArgType::Long));
            }
            0x0b..=0x0d => {
                let r = frame.push(Cat::One)?;
                let bits = ((op.opcode - 0x0b) as f32).to_bits() as i64;
                out.push(typed_const(off, r, bits, ArgType::Float));
            }
            0x0e | 0x0f => {
                let r = frame.push(Cat::Two)?;
                let bits = ((op.opcode - 0x0e) as f64).to_bits() as i64;
                out.push(typed_const(off, r, bits, ArgType::Double));
            }
            0x10 | 0x11 => {
                let Operand::Int(v) = op.operand else {
                    return Err(malformed(off, "missing immediate"));
                };
                let r = frame.push(Cat::One)?;
                out.push(int_const(off, r, v as i64));
            }
            0x12..=0x14 => {
                let idx = pool_index()?;
                let constant = self.pool.constant(idx).ok_or(DecodeError::BadReference {
                    kind: "constant",
                    index: idx,
                    offset: off,
                })?;
                match constant {
                    LoadableConstant::Int(v) => {
                        let r = frame.push(Cat::One)?;
                        out.push(int_const(off, r, v as i64));
                    }
                    LoadableConstant::Float(v) => {
                        let r = frame.push(Cat::One)?;
                        out.push(typed_const(off, r, v.to_bits() as i64, ArgType::Float));
                    }
                    LoadableConstant::Long(v) => {
                        let r = frame.push(Cat::Two)?;
                        out.push(typed_const(off, r, v, ArgType::Long));
                    }
                    LoadableConstant::Double(v) => {
                        let r = frame.push(Cat::Two)?;
                        out.push(typed_const(off, r, v.to_bits() as i64, ArgType::Double));
                    }
                    LoadableConstant::String(s) => {
                        let r = frame.push(Cat::One)?;
                        emit(
                            out,
                            InsnKind::ConstString(s),
                            vec![],
                            Some(RegisterArg::typed(r, ArgType::object("java.lang.String"))),
                        );
                    }
                    LoadableConstant::Class(ty) => {
                        let r = frame.push(Cat::One)?;
                        emit(
                            out,
                            InsnKind::ConstClass(ty),
                            vec![],
                            Some(RegisterArg::typed(r, ArgType::object("java.lang.Class"))),
                        );
                    }
                }
            }

            // ローカル変数の読み書き
            0x15..=0x19 | 0x1a..=0x2d => {
                let (local, ty) = match op.operand {
                    Operand::Local(n) => (n, local_type(op.opcode - 0x15)),
                    _ => {
                        let k = op.opcode - 0x1a;
                        ((k % 4) as u16, local_type(k / 4))
                    }
                };
                let r = frame.push(Cat::of(&ty))?;
                emit(
                    out,
                    InsnKind::Move,
                    vec![InsnArg::typed_reg(local, ty.clone())],
                    Some(RegisterArg::typed(r, ty)),
                );
            }
            0x36..=0x3a | 0x3b..=0x4e => {
                let (local, ty) = match op.operand {
                    Operand::Local(n) => (n, local_type(op.opcode - 0x36)),
                    _ => {
                        let k = op.opcode - 0x3b;
                        ((k % 4) as u16, local_type(k / 4))
                    }
                };
                if local >= self.max_locals {
                    return Err(malformed(off, "local variable index out of range"));
                }
                let r = frame.pop(Cat::of(&ty))?;
                emit(
                    out,
                    InsnKind::Move,
                    vec![InsnArg::typed_reg(r, ty.clone())],
                    Some(RegisterArg::typed(local, ty)),
                );
            }

            // 配列
            0x2e..=0x35 => {
                let elem = array_elem_type(op.opcode - 0x2e);
                let index = frame.pop(Cat::One)?;
                let array = frame.pop(Cat::One)?;
                let r = frame.push(Cat::of(&elem))?;
                emit(
                    out,
                    InsnKind::ArrayGet(elem.clone()),
                    vec![InsnArg::reg(array), InsnArg::typed_reg(index, ArgType::Int)],
                    Some(RegisterArg::typed(r, elem)),
                );
            }
            0x4f..=0x56 => {
                let elem = array_elem_type(op.opcode - 0x4f);
                let value = frame.pop(Cat::of(&elem))?;
                let index = frame.pop(Cat::One)?;
                let array = frame.pop(Cat::One)?;
                emit(
                    out,
                    InsnKind::ArrayPut(elem.clone()),
                    vec![
                        InsnArg::reg(array),
                        InsnArg::typed_reg(index, ArgType::Int),
                        InsnArg::typed_reg(value, elem),
                    ],
                    None,
                );
            }

            // スタック操作
            0x57 => {
                frame.pop(Cat::One)?;
            }
            0x58 => {
                frame.pop_slots(2)?;
            }
            0x59..=0x5f => self.stack_shuffle(op.opcode, &mut frame, out)?,

            // 算術
            0x60..=0x73 => {
                let arith = ArithOp::from_index((op.opcode - 0x60) / 4).ok_or_else(|| malformed(off, "bad arithmetic opcode"))?;
                let ty = numeric_type((op.opcode - 0x60) % 4);
                binary(&mut frame, out, off, arith, ty)?;
            }
            0x74..=0x77 => {
                let ty = numeric_type(op.opcode - 0x74);
                let r = frame.pop(Cat::of(&ty))?;
                let d = frame.push(Cat::of(&ty))?;
                emit(out, InsnKind::Neg(ty.clone()), vec![InsnArg::typed_reg(r, ty.clone())], Some(RegisterArg::typed(d, ty)));
            }
            0x78..=0x83 => {
                let k = op.opcode - 0x78;
                let arith = match k / 2 {
                    0 => ArithOp::Shl,
                    1 => ArithOp::Shr,
                    2 => ArithOp::Ushr,
                    3 => ArithOp::And,
                    4 => ArithOp::Or,
                    _ => ArithOp::Xor,
                };
                let ty = if k % 2 == 0 { ArgType::Int } else { ArgType::Long };
                binary(&mut frame, out, off, arith, ty)?;
            }
            0x84 => {
                let Operand::Iinc { local, delta } = op.operand else {
                    return Err(malformed(off, "missing iinc operands"));
                };
                emit(
                    out,
                    InsnKind::Arith {
                        op: ArithOp::Add,
                        ty: ArgType::Int,
                    },
                    vec![InsnArg::typed_reg(local, ArgType::Int), InsnArg::lit(delta as i64, ArgType::Int)],
                    Some(RegisterArg::typed(local, ArgType::Int)),
                );
            }
            0x85..=0x93 => {
                let (from, to) = conversion(op.opcode);
                let r = frame.pop(Cat::of(&from))?;
                let d = frame.push(Cat::of(&to))?;
                emit(
                    out,
                    InsnKind::Cast {
                        from: from.clone(),
                        to: to.clone(),
                    },
                    vec![InsnArg::typed_reg(r, from)],
                    Some(RegisterArg::typed(d, to)),
                );
            }
            0x94..=0x98 => {
                let ty = match op.opcode {
                    0x94 => ArgType::Long,
                    0x95 | 0x96 => ArgType::Float,
                    _ => ArgType::Double,
                };
                let b = frame.pop(Cat::of(&ty))?;
                let a = frame.pop(Cat::of(&ty))?;
                let d = frame.push(Cat::One)?;
                emit(
                    out,
                    InsnKind::Cmp(ty.clone()),
                    vec![InsnArg::typed_reg(a, ty.clone()), InsnArg::typed_reg(b, ty)],
                    Some(RegisterArg::typed(d, ArgType::Int)),
                );
            }

            // 分岐
            0x99..=0x9e | 0xc6 | 0xc7 => {
                let target = branch_target(op)?;
                let cmp = match op.opcode {
                    0xc6 => CmpOp::Eq,
                    0xc7 => CmpOp::Ne,
                    code => CmpOp::from_index(code - 0x99).ok_or_else(|| malformed(off, "bad condition"))?,
                };
                let r = frame.pop(Cat::One)?;
                emit(out, InsnKind::If { op: cmp, target }, vec![InsnArg::reg(r)], None);
                return Ok(Flow {
                    falls_through: true,
                    targets: vec![target],
                });
            }
            0x9f..=0xa6 => {
                let target = branch_target(op)?;
                let cmp = match op.opcode {
                    0xa5 => CmpOp::Eq,
                    0xa6 => CmpOp::Ne,
                    code => CmpOp::from_index(code - 0x9f).ok_or_else(|| malformed(off, "bad condition"))?,
                };
                let b = frame.pop(Cat::One)?;
                let a = frame.pop(Cat::One)?;
                emit(out, InsnKind::If { op: cmp, target }, vec![InsnArg::reg(a), InsnArg::reg(b)], None);
                return Ok(Flow {
                    falls_through: true,
                    targets: vec![target],
                });
            }
            0xa7 | 0xc8 => {
                let target = branch_target(op)?;
                emit(out, InsnKind::Goto { target }, vec![], None);
                return Ok(Flow {
                    falls_through: false,
                    targets: vec![target],
                });
            }
            0xaa | 0xab => {
                let Operand::Switch { keys, targets, default } = &op.operand else {
                    return Err(malformed(off, "missing switch table"));
                };
                let r = frame.pop(Cat::One)?;
                emit(
                    out,
                    InsnKind::Switch {
                        keys: keys.clone(),
                        targets: targets.clone(),
                        default: Some(*default),
                    },
                    vec![InsnArg::typed_reg(r, ArgType::Int)],
                    None,
                );
                let mut all = targets.clone();
                all.push(*default);
                return Ok(Flow {
                    falls_through: false,
                    targets: all,
                });
            }

            // return
            0xac..=0xb0 => {
                let ty = local_type(op.opcode - 0xac);
                let r = frame.pop(Cat::of(&ty))?;
                emit(out, InsnKind::Return, vec![InsnArg::typed_reg(r, ty)], None);
                return Ok(Flow::stop());
            }
            0xb1 => {
                emit(out, InsnKind::Return, vec![], None);
                return Ok(Flow::stop());
            }

            // フィールド
            0xb2..=0xb5 => {
                let idx = pool_index()?;
                let field = self.pool.field(idx).cloned().ok_or(DecodeError::BadReference {
                    kind: "field",
                    index: idx,
                    offset: off,
                })?;
                let cat = Cat::of(&field.ty);
                let object_ty = ArgType::object(&field.class);
                match op.opcode {
                    0xb2 => {
                        let r = frame.push(cat)?;
                        let ty = field.ty.clone();
                        emit(out, InsnKind::StaticGet(field), vec![], Some(RegisterArg::typed(r, ty)));
                    }
                    0xb3 => {
                        let v = frame.pop(cat)?;
                        let ty = field.ty.clone();
                        emit(out, InsnKind::StaticPut(field), vec![InsnArg::typed_reg(v, ty)], None);
                    }
                    0xb4 => {
                        let obj = frame.pop(Cat::One)?;
                        let r = frame.push(cat)?;
                        let ty = field.ty.clone();
                        emit(
                            out,
                            InsnKind::InstanceGet(field),
                            vec![InsnArg::typed_reg(obj, object_ty)],
                            Some(RegisterArg::typed(r, ty)),
                        );
                    }
                    _ => {
                        let v = frame.pop(cat)?;
                        let obj = frame.pop(Cat::One)?;
                        let ty = field.ty.clone();
                        emit(
                            out,
                            InsnKind::InstancePut(field),
                            vec![InsnArg::typed_reg(obj, object_ty), InsnArg::typed_reg(v, ty)],
                            None,
                        );
                    }
                }
            }

            // 呼び出し
            0xb6..=0xb9 => {
                let method = self.pool_method(pool_index()?, off)?;
                let kind = match op.opcode {
                    0xb6 => InvokeKind::Virtual,
                    0xb7 if method.is_constructor() || method.class == self.class_name => {
                        InvokeKind::Direct
                    }
                    0xb7 => InvokeKind::Super,
                    0xb8 => InvokeKind::Static,
                    _ => InvokeKind::Interface,
                };
                let mut params = Vec::with_capacity(method.params.len());
                for p in method.params.iter().rev() {
                    params.push(InsnArg::typed_reg(frame.pop(Cat::of(p))?, p.clone()));
                }
                params.reverse();
                let mut args = Vec::with_capacity(params.len() + 1);
                if !kind.is_static() {
                    let recv = frame.pop(Cat::One)?;
                    args.push(InsnArg::typed_reg(recv, ArgType::object(&method.class)));
                }
                args.extend(params);
                let result = if method.ret == ArgType::Void {
                    None
                } else {
                    let r = frame.push(Cat::of(&method.ret))?;
                    Some(RegisterArg::typed(r, method.ret.clone()))
                };
                emit(out, InsnKind::Invoke { kind, method }, args, result);
            }

            // オブジェクト生成・型検査
            0xbb => {
                let ty = self.pool_type(pool_index()?, off)?;
                let r = frame.push(Cat::One)?;
                emit(out, InsnKind::NewInstance(ty.clone()), vec![], Some(RegisterArg::typed(r, ty)));
            }
            0xbc | 0xbd => {
                let elem = match op.operand {
                    Operand::ArrayType(code) => primitive_array_type(code)
                        .ok_or_else(|| malformed(off, "bad newarray element type"))?,
                    _ => self.pool_type(pool_index()?, off)?,
                };
                let ty = ArgType::array_of(elem);
                let size = frame.pop(Cat::One)?;
                let r = frame.push(Cat::One)?;
                emit(
                    out,
                    InsnKind::NewArray(ty.clone()),
                    vec![InsnArg::typed_reg(size, ArgType::Int)],
                    Some(RegisterArg::typed(r, ty)),
                );
            }
            0xbe => {
                let a = frame.pop(Cat::One)?;
                let r = frame.push(Cat::One)?;
                emit(out, InsnKind::ArrayLength, vec![InsnArg::reg(a)], Some(RegisterArg::typed(r, ArgType::Int)));
            }
            0xbf => {
                let r = frame.pop(Cat::One)?;
                emit(out, InsnKind::Throw, vec![InsnArg::reg(r)], None);
                return Ok(Flow::stop());
            }
            0xc0 => {
                let ty = self.pool_type(pool_index()?, off)?;
                let a = frame.pop(Cat::One)?;
                let r = frame.push(Cat::One)?;
                emit(out, InsnKind::CheckCast(ty.clone()), vec![InsnArg::reg(a)], Some(RegisterArg::typed(r, ty)));
            }
            0xc1 => {
                let ty = self.pool_type(pool_index()?, off)?;
                let a = frame.pop(Cat::One)?;
                let r = frame.push(Cat::One)?;
                emit(out, InsnKind::InstanceOf(ty), vec![InsnArg::reg(a)], Some(RegisterArg::typed(r, ArgType::Boolean)));
            }
            0xc2 | 0xc3 => {
                let r = frame.pop(Cat::One)?;
                let kind = if op.opcode == 0xc2 {
                    InsnKind::MonitorEnter
                } else {
                    InsnKind::MonitorExit
                };
                emit(out, kind, vec![InsnArg::reg(r)], None);
            }

            other => {
                return Err(DecodeError::UnknownOpcode {
                    opcode: other as u16,
                    offset: off,
                })
            }
        }

        Ok(Flow::next())
    }

    /// dup / swap 系。入れ替えはスタック先頭の値の並べ替えとして扱う
    fn stack_shuffle(&self, opcode: u8, frame: &mut Frame<'_>, out: &mut Vec<Insn>) -> Result<(), DecodeError> {
        let top = |frame: &Frame<'_>, depth: usize| frame.peek(depth);
        let (take, pattern): (usize, Vec<usize>) = match opcode {
            0x59 => (1, vec![0, 0]),
            0x5a => (2, vec![1, 0, 1]),
            0x5b => {
                if top(frame, 1)? == Cat::Two {
                    (2, vec![1, 0, 1])
                } else {
                    (3, vec![2, 0, 1, 2])
                }
            }
            0x5c => {
                if top(frame, 0)? == Cat::Two {
                    (1, vec![0, 0])
                } else {
                    (2, vec![0, 1, 0, 1])
                }
            }
            0x5d => {
                if top(frame, 0)? == Cat::Two {
                    (2, vec![1, 0, 1])
                } else {
                    (3, vec![1, 2, 0, 1, 2])
                }
            }
            0x5e => match (top(frame, 0)?, top(frame, 1)?) {
                (Cat::Two, Cat::Two) => (2, vec![1, 0, 1]),
                (Cat::Two, Cat::One) => (3, vec![2, 0, 1, 2]),
                (Cat::One, _) if top(frame, 2)? == Cat::Two => (3, vec![1, 2, 0, 1, 2]),
                _ => (4, vec![2, 3, 0, 1, 2, 3]),
            },
            _ => (2, vec![1, 0]),
        };
        frame.permute(take, &pattern, out)
    }
}

/// スタック模擬の作業領域
struct Frame<'s> {
    stack: &'s mut Vec<Cat>,
    base: u16,
    max_stack: u16,
    offset: Offset,
}

impl Frame<'_> {
    fn slots(&self) -> u16 {
        self.stack.iter().map(|c| c.size()).sum()
    }

    fn push(&mut self, cat: Cat) -> Result<RegNum, DecodeError> {
        let slot = self.slots();
        if slot + cat.size() > self.max_stack {
            return Err(malformed(self.offset, "operand stack overflow"));
        }
        self.stack.push(cat);
        Ok(self.base + slot)
    }

    fn pop(&mut self, cat: Cat) -> Result<RegNum, DecodeError> {
        match self.stack.pop() {
            Some(found) if found == cat => Ok(self.base + self.slots()),
            Some(_) => Err(malformed(self.offset, "operand category mismatch")),
            None => Err(malformed(self.offset, "operand stack underflow")),
        }
    }

    fn pop_slots(&mut self, mut count: u16) -> Result<(), DecodeError> {
        while count > 0 {
            let cat = self
                .stack
                .pop()
                .ok_or_else(|| malformed(self.offset, "operand stack underflow"))?;
            count = count
                .checked_sub(cat.size())
                .ok_or_else(|| malformed(self.offset, "pop2 splits a wide value"))?;
        }
        Ok(())
    }

    fn peek(&self, depth: usize) -> Result<Cat, DecodeError> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| self.stack.get(i).copied())
            .ok_or_else(|| malformed(self.offset, "operand stack underflow"))
    }

    /// 先頭 take 個の値を pattern の並びへ置き換える（一時レジスタ経由で上書きを避ける）
    fn permute(&mut self, take: usize, pattern: &[usize], out: &mut Vec<Insn>) -> Result<(), DecodeError> {
        let max_stack = self.max_stack;
        if self.stack.len() < take {
            return Err(malformed(self.offset, "operand stack underflow"));
        }
        let keep = self.stack.len() - take;
        let old: Vec<Cat> = self.stack[keep..].to_vec();
        let base_slot: u16 = self.stack[..keep].iter().map(|c| c.size()).sum();

        let mut old_regs = Vec::with_capacity(old.len());
        let mut slot = base_slot;
        for cat in &old {
            old_regs.push(self.base + slot);
            slot += cat.size();
        }

        let mut writes = Vec::new();
        let mut slot = base_slot;
        for &k in pattern {
            let dest = self.base + slot;
            if dest != old_regs[k] {
                writes.push((dest, k));
            }
            slot += old[k].size();
        }
        if slot > max_stack {
            return Err(malformed(self.offset, "operand stack overflow"));
        }

        // 先行する書き込みで潰される値だけ一時レジスタへ退避する
        let overlaps = |a: RegNum, a_size: u16, b: RegNum, b_size: u16| a < b + b_size && b < a + a_size;
        let temp_base = self.base + max_stack;
        let mut source: Vec<RegNum> = old_regs.clone();
        let mut temp_slot = 0u16;
        for (j, &(_, k)) in writes.iter().enumerate() {
            if source[k] != old_regs[k] {
                continue;
            }
            let clobbered = writes[..j]
                .iter()
                .any(|&(d, kd)| overlaps(d, old[kd].size(), old_regs[k], old[k].size()));
            if clobbered {
                let temp = temp_base + temp_slot;
                temp_slot += old[k].size();
                out.push(move_insn(self.offset, temp, old_regs[k], old[k]));
                source[k] = temp;
            }
        }
        for (dest, k) in writes {
            out.push(move_insn(self.offset, dest, source[k], old[k]));
        }

        self.stack.truncate(keep);
        self.stack.extend(pattern.iter().map(|&k| old[k]));
        Ok(())
    }
}

fn move_insn(offset: Offset, dest: RegNum, src: RegNum, cat: Cat) -> Insn {
    let make = |reg| {
        if cat == Cat::Two {
            RegisterArg::typed(reg, ArgType::Narrow(PrimitiveSet::WIDE))
        } else {
            RegisterArg::new(reg)
        }
    };
    Insn::new(InsnKind::Move, vec![InsnArg::Register(make(src))], Some(make(dest)), offset)
}

fn binary(frame: &mut Frame<'_>, out: &mut Vec<Insn>, offset: Offset, op: ArithOp, ty: ArgType) -> Result<(), DecodeError> {
    let rhs_ty = if op.is_shift() { ArgType::Int } else { ty.clone() };
    let b = frame.pop(Cat::of(&rhs_ty))?;
    let a = frame.pop(Cat::of(&ty))?;
    let d = frame.push(Cat::of(&ty))?;
    out.push(Insn::new(
        InsnKind::Arith { op, ty: ty.clone() },
        vec![InsnArg::typed_reg(a, ty.clone()), InsnArg::typed_reg(b, rhs_ty)],
        Some(RegisterArg::typed(d, ty)),
        offset,
    ));
    Ok(())
}

fn int_const(offset: Offset, reg: RegNum, value: i64) -> Insn {
    let set = literal_candidates(value, false) - PrimitiveSet::FLOAT - PrimitiveSet::REFERENCE;
    typed_const(offset, reg, value, ArgType::Narrow(set))
}

fn typed_const(offset: Offset, reg: RegNum, value: i64, ty: ArgType) -> Insn {
    Insn::new(
        InsnKind::Const,
        vec![InsnArg::lit(value, ty.clone())],
        Some(RegisterArg::typed(reg, ty)),
        offset,
    )
}

fn branch_target(op: &RawOp) -> Result<Offset, DecodeError> {
    match op.operand {
        Operand::Branch(t) => Ok(t),
        _ => Err(malformed(op.offset, "missing branch target")),
    }
}

fn malformed(offset: Offset, message: &str) -> DecodeError {
    DecodeError::Malformed {
        offset,
        message: message.to_string(),
    }
}

/// i/l/f/d/a の並び
/// i 系は boolean/byte/short/char も同じ命令を使うので確定させない
fn local_type(index: u8) -> ArgType {
    match index {
        0 => ArgType::Narrow(PrimitiveSet::NARROW_INTEGRAL),
        1 => ArgType::Long,
        2 => ArgType::Float,
        3 => ArgType::Double,
        _ => ArgType::Unknown,
    }
}

fn numeric_type(index: u8) -> ArgType {
    match index {
        0 => ArgType::Int,
        1 => ArgType::Long,
        2 => ArgType::Float,
        _ => ArgType::Double,
    }
}

/// xaload / xastore の要素型（i l f d a b c s）
fn array_elem_type(index: u8) -> ArgType {
    match index {
        0 => ArgType::Int,
        1 => ArgType::Long,
        2 => ArgType::Float,
        3 => ArgType::Double,
        4 => ArgType::Unknown,
        5 => ArgType::Narrow(PrimitiveSet::BOOLEAN | PrimitiveSet::BYTE),
        6 => ArgType::Char,
        _ => ArgType::Short,
    }
}

fn primitive_array_type(code: u8) -> Option<ArgType> {
    Some(match code {
        4 => ArgType::Boolean,
        5 => ArgType::Char,
        6 => ArgType::Float,
        7 => ArgType::Double,
        8 => ArgType::Byte,
        9 => ArgType::Short,
        10 => ArgType::Int,
        11 => ArgType::Long,
        _ => return None,
    })
}

fn conversion(opcode: u8) -> (ArgType, ArgType) {
    use ArgType::*;
    match opcode {
        0x85 => (Int, Long),
        0x86 => (Int, Float),
        0x87 => (Int, Double),
        0x88 => (Long, Int),
        0x89 => (Long, Float),
        0x8a => (Long, Double),
        0x8b => (Float, Int),
        0x8c => (Float, Long),
        0x8d => (Float, Double),
        0x8e => (Double, Int),
        0x8f => (Double, Long),
        0x90 => (Double, Float),
        0x91 => (Int, Byte),
        0x92 => (Int, Char),
        _ => (Int, Short),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::pool::{ClassFilePool, PoolEntry};

    fn decode(code: &[u8], max_locals: u16, max_stack: u16, pool: &ClassFilePool) -> Result<Vec<Insn>, DecodeError> {
        JvmDecoder::new(code, pool, "Test", max_locals, max_stack).decode_all()
    }

    #[test]
    fn test_stack_slots_map_to_registers() {
        let pool = ClassFilePool::new();
        // iload_0 ; iload_1 ; iadd ; ireturn
        let insns = decode(&[0x1a, 0x1b, 0x60, 0xac], 2, 2, &pool).unwrap();
        assert_eq!(insns.len(), 4);

        // スタックスロット0 → r2, スロット1 → r3
        assert_eq!(insns[0].result.as_ref().map(|r| r.reg), Some(2));
        assert_eq!(insns[1].result.as_ref().map(|r| r.reg), Some(3));
        let add = &insns[2];
        assert!(matches!(add.kind, InsnKind::Arith { op: ArithOp::Add, .. }));
        assert_eq!(add.result.as_ref().map(|r| r.reg), Some(2));
        assert_eq!(insns[3].args[0].as_register().map(|r| r.reg), Some(2));
    }

    #[test]
    fn test_int_category_locals_stay_narrow() {
        let pool = ClassFilePool::new();
        // iload_0 ; istore_1 ; iload_1 ; ireturn
        let insns = decode(&[0x1a, 0x3c, 0x1b, 0xac], 2, 1, &pool).unwrap();
        let narrow = ArgType::Narrow(PrimitiveSet::NARROW_INTEGRAL);
        assert_eq!(insns[0].result.as_ref().map(|r| r.ty.clone()), Some(narrow.clone()));
        assert_eq!(insns[1].result.as_ref().map(|r| r.ty.clone()), Some(narrow.clone()));
        assert!(!insns[1].result.as_ref().unwrap().wide);
        assert_eq!(insns[3].args[0].arg_type(), narrow);
    }

    #[test]
    fn test_wide_values_take_two_slots() {
        let pool = ClassFilePool::new();
        // lload_0 ; lconst_1 ; ladd ; lreturn
        let insns = decode(&[0x1e, 0x0a, 0x61, 0xad], 2, 4, &pool).unwrap();
        assert_eq!(insns[1].result.as_ref().map(|r| r.reg), Some(4));
        assert!(insns[2].result.as_ref().unwrap().wide);
    }

    #[test]
    fn test_merge_requires_same_stack_shape() {
        let pool = ClassFilePool::new();
        // iload_0 ; ifeq +7 ; iconst_1 ; goto +3 ; (target) return
        // 分岐先でスタック深さが 0 と 1 になり一致しない
        let code = [0x1a, 0x99, 0x00, 0x07, 0x04, 0xa7, 0x00, 0x03, 0xb1];
        let err = decode(&code, 1, 2, &pool).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_dup_and_swap_emit_moves() {
        let pool = ClassFilePool::new();
        // iload_0 ; dup ; iadd ; ireturn
        let insns = decode(&[0x1a, 0x59, 0x60, 0xac], 1, 2, &pool).unwrap();
        let dup = &insns[1];
        assert!(matches!(dup.kind, InsnKind::Move));
        assert_eq!(dup.result.as_ref().map(|r| r.reg), Some(2));
        assert_eq!(dup.args[0].as_register().map(|r| r.reg), Some(1));

        // iload_0 ; iload_1 ; swap ; isub ; ireturn
        let insns = decode(&[0x1a, 0x1b, 0x5f, 0x64, 0xac], 2, 2, &pool).unwrap();
        let moves: Vec<_> = insns.iter().filter(|i| i.offset == 2).collect();
        assert_eq!(moves.len(), 3);
    }

    #[test]
    fn test_invoke_and_handler_entry() {
        let mut pool = ClassFilePool::new();
        pool.insert(
            1,
            PoolEntry::Method(MethodRef::parse("java/io/PrintStream", "println", "(I)V").unwrap()),
        );
        // aload_0 ; iload_1 ; invokevirtual #1 ; return ; (handler) astore_2 ; return
        let code = [0x2a, 0x1b, 0xb6, 0x00, 0x01, 0xb1, 0x4d, 0xb1];
        let insns = JvmDecoder::new(&code, &pool, "Test", 3, 2)
            .with_handlers(vec![(6, None)])
            .decode_all()
            .unwrap();

        let call = insns.iter().find(|i| matches!(i.kind, InsnKind::Invoke { .. })).unwrap();
        assert_eq!(call.args.len(), 2);
        assert!(call.result.is_none());

        let entry = insns.iter().position(|i| matches!(i.kind, InsnKind::MoveException(_))).unwrap();
        assert_eq!(insns[entry].offset, 6);
        assert_eq!(insns[entry].result.as_ref().map(|r| r.reg), Some(3));
    }

    #[test]
    fn test_unsupported_opcodes() {
        let pool = ClassFilePool::new();
        let err = decode(&[0xa8, 0x00, 0x03, 0xb1], 1, 1, &pool).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownOpcode { opcode: 0xa8, .. }));
    }
}
