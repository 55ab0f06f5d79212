/// Dalvik バイトコードデコーダ
///
/// 16bitコード単位の命令列を共通IRへ変換する。
/// - オフセットはコード単位
/// - ペイロード（packed/sparse switch, fill-array-data）は線形デコードでは読み飛ばし、
///   参照元の命令から解決する
/// - invoke / filled-new-array 直後の move-result は result として畳み込む

use crate::decompiler::insn::{
    ArithOp, CmpOp, Insn, InsnArg, InsnKind, InvokeKind, Offset, RegNum, RegisterArg,
};
use crate::decompiler::pool::{FieldRef, MethodRef, RefResolver};
use crate::decompiler::types::{literal_candidates, ArgType, PrimitiveSet};
use crate::error::DecodeError;

const PACKED_SWITCH_IDENT: u16 = 0x0100;
const SPARSE_SWITCH_IDENT: u16 = 0x0200;
const FILL_ARRAY_IDENT: u16 = 0x0300;

/// バイト列を16bitコード単位（リトルエンディアン）へ変換
pub fn code_units(bytes: &[u8]) -> Result<Vec<u16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::Truncated {
            offset: (bytes.len() / 2) as u32,
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// 1命令分のデコード結果
#[derive(Debug)]
enum Decoded {
    Insn(Insn),
    MoveResult {
        reg: RegNum,
        wide: bool,
        offset: Offset,
    },
    Payload,
}

/// Dalvik 命令デコーダ
pub struct DalvikDecoder<'a> {
    units: &'a [u16],
    pool: &'a dyn RefResolver,
}

impl<'a> DalvikDecoder<'a> {
    pub fn new(units: &'a [u16], pool: &'a dyn RefResolver) -> Self {
        Self { units, pool }
    }

    /// 全命令を線形にデコードし、move-result を畳み込む
    pub fn decode_all(&self) -> Result<Vec<Insn>, DecodeError> {
        let mut out: Vec<Insn> = Vec::new();
        let mut pc = 0usize;

        while pc < self.units.len() {
            let (decoded, size) = self.decode_at(pc)?;
            match decoded {
                Decoded::Insn(insn) => out.push(insn),
                Decoded::Payload => {}
                Decoded::MoveResult { reg, wide, offset } => {
                    let prev = out.last_mut().filter(|p| {
                        p.result.is_none()
                            && matches!(
                                p.kind,
                                InsnKind::Invoke { .. } | InsnKind::FilledNewArray(_)
                            )
                    });
                    let Some(prev) = prev else {
                        return Err(DecodeError::Malformed {
                            offset,
                            message: "move-result without preceding invoke".into(),
                        });
                    };
                    let ty = match &prev.kind {
                        InsnKind::Invoke { method, .. } => method.ret.clone(),
                        InsnKind::FilledNewArray(ty) => ty.clone(),
                        _ => ArgType::Unknown,
                    };
                    let mut result = RegisterArg::typed(reg, ty);
                    result.wide |= wide;
                    prev.result = Some(result);
                }
            }
            pc += size;
        }

        Ok(out)
    }

    /// 寛容な逆アセンブル（失敗した単位は .word で出力）
    pub fn disassemble(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut pc = 0usize;
        while pc < self.units.len() {
            match self.decode_at(pc) {
                Ok((decoded, size)) => {
                    match decoded {
                        Decoded::Insn(insn) => lines.push(format!("0x{:04x}: {}", pc, insn)),
                        Decoded::MoveResult { reg, .. } => {
                            lines.push(format!("0x{:04x}: move-result r{}", pc, reg))
                        }
                        Decoded::Payload => lines.push(format!("0x{:04x}: .payload", pc)),
                    }
                    pc += size;
                }
                Err(_) => {
                    lines.push(format!("0x{:04x}: .word 0x{:04x}", pc, self.units[pc]));
                    pc += 1;
                }
            }
        }
        lines
    }

    fn unit(&self, index: usize, insn_offset: Offset) -> Result<u16, DecodeError> {
        self.units
            .get(index)
            .copied()
            .ok_or(DecodeError::Truncated {
                offset: insn_offset,
            })
    }

    fn u32_at(&self, index: usize, insn_offset: Offset) -> Result<u32, DecodeError> {
        let lo = self.unit(index, insn_offset)? as u32;
        let hi = self.unit(index + 1, insn_offset)? as u32;
        Ok(lo | (hi << 16))
    }

    fn target(&self, pc: usize, rel: i32) -> Result<Offset, DecodeError> {
        let abs = pc as i64 + rel as i64;
        u32::try_from(abs).map_err(|_| DecodeError::Malformed {
            offset: pc as u32,
            message: format!("branch offset {} leaves the method", rel),
        })
    }

    fn string(&self, index: u32, offset: Offset) -> Result<String, DecodeError> {
        self.pool
            .string(index)
            .map(|s| s.to_string())
            .ok_or(DecodeError::BadReference {
                kind: "string",
                index,
                offset,
            })
    }

    fn type_ref(&self, index: u32, offset: Offset) -> Result<ArgType, DecodeError> {
        self.pool
            .type_ref(index)
            .cloned()
            .ok_or(DecodeError::BadReference {
                kind: "type",
                index,
                offset,
            })
    }

    fn field(&self, index: u32, offset: Offset) -> Result<FieldRef, DecodeError> {
        self.pool
            .field(index)
            .cloned()
            .ok_or(DecodeError::BadReference {
                kind: "field",
                index,
                offset,
            })
    }

    fn method(&self, index: u32, offset: Offset) -> Result<MethodRef, DecodeError> {
        self.pool
            .method(index)
            .cloned()
            .ok_or(DecodeError::BadReference {
                kind: "method",
                index,
                offset,
            })
    }

    /// pc の命令をデコードし、(結果, コード単位数) を返す
    fn decode_at(&self, pc: usize) -> Result<(Decoded, usize), DecodeError> {
        let off = pc as Offset;
        let u0 = self.unit(pc, off)?;
        let op = (u0 & 0xff) as u8;
        let hi = (u0 >> 8) as u8;
        let a4 = (hi & 0x0f) as RegNum;
        let b4 = (hi >> 4) as RegNum;
        let aa = hi as RegNum;

        let insn = |kind: InsnKind, args: Vec<InsnArg>, result: Option<RegisterArg>| {
            Decoded::Insn(Insn::new(kind, args, result, off))
        };

        let decoded = match op {
            0x00 => match hi {
                0x00 => (insn(InsnKind::Nop, vec![], None), 1),
                0x01..=0x03 => (Decoded::Payload, self.payload_size(pc)?),
                _ => {
                    return Err(DecodeError::UnknownOpcode {
                        opcode: u0,
                        offset: off,
                    })
                }
            },

            // move / move-wide / move-object（12x, 22x, 32x）
            0x01..=0x09 => {
                let family = (op - 0x01) / 3;
                let wide = family == 1;
                let (dst, src, size) = match (op - 0x01) % 3 {
                    0 => (a4, b4, 1),
                    1 => (aa, self.unit(pc + 1, off)?, 2),
                    _ => (self.unit(pc + 1, off)?, self.unit(pc + 2, off)?, 3),
                };
                (
                    insn(
                        InsnKind::Move,
                        vec![InsnArg::Register(wide_reg(src, wide))],
                        Some(wide_reg(dst, wide)),
                    ),
                    size,
                )
            }

            0x0a..=0x0c => (
                Decoded::MoveResult {
                    reg: aa,
                    wide: op == 0x0b,
                    offset: off,
                },
                1,
            ),

            0x0d => (
                insn(
                    InsnKind::MoveException(None),
                    vec![],
                    Some(RegisterArg::new(aa)),
                ),
                1,
            ),

            0x0e => (insn(InsnKind::Return, vec![], None), 1),
            0x0f..=0x11 => (
                insn(
                    InsnKind::Return,
                    vec![InsnArg::Register(wide_reg(aa, op == 0x10))],
                    None,
                ),
                1,
            ),

            // const 系
            0x12 => {
                let value = ((hi as i8) >> 4) as i64;
                (const_insn(off, a4, value, false), 1)
            }
            0x13 => {
                let value = self.unit(pc + 1, off)? as i16 as i64;
                (const_insn(off, aa, value, false), 2)
            }
            0x14 => {
                let value = self.u32_at(pc + 1, off)? as i32 as i64;
                (const_insn(off, aa, value, false), 3)
            }
            0x15 => {
                let value = ((self.unit(pc + 1, off)? as u32) << 16) as i32 as i64;
                (const_insn(off, aa, value, false), 2)
            }
            0x16 => {
                let value = self.unit(pc + 1, off)? as i16 as i64;
                (const_insn(off, aa, value, true), 2)
            }
            0x17 => {
                let value = self.u32_at(pc + 1, off)? as i32 as i64;
                (const_insn(off, aa, value, true), 3)
            }
            0x18 => {
                let lo = self.u32_at(pc + 1, off)? as u64;
                let hi_word = self.u32_at(pc + 3, off)? as u64;
                (const_insn(off, aa, (lo | (hi_word << 32)) as i64, true), 5)
            }
            0x19 => {
                let value = ((self.unit(pc + 1, off)? as u64) << 48) as i64;
                (const_insn(off, aa, value, true), 2)
            }
            0x1a => {
                let s = self.string(self.unit(pc + 1, off)? as u32, off)?;
                (
                    insn(
                        InsnKind::ConstString(s),
                        vec![],
                        Some(RegisterArg::typed(aa, ArgType::object("java.lang.String"))),
                    ),
                    2,
                )
            }
            0x1b => {
                let s = self.string(self.u32_at(pc + 1, off)?, off)?;
                (
                    insn(
                        InsnKind::ConstString(s),
                        vec![],
                        Some(RegisterArg::typed(aa, ArgType::object("java.lang.String"))),
                    ),
                    3,
                )
            }
            0x1c => {
                let ty = self.type_ref(self.unit(pc + 1, off)? as u32, off)?;
                (
                    insn(InsnKind::ConstClass(ty), vec![], Some(RegisterArg::new(aa))),
                    2,
                )
            }

            0x1d => (insn(InsnKind::MonitorEnter, vec![InsnArg::reg(aa)], None), 1),
            0x1e => (insn(InsnKind::MonitorExit, vec![InsnArg::reg(aa)], None), 1),

            0x1f => {
                let ty = self.type_ref(self.unit(pc + 1, off)? as u32, off)?;
                (
                    insn(
                        InsnKind::CheckCast(ty.clone()),
                        vec![InsnArg::reg(aa)],
                        Some(RegisterArg::typed(aa, ty)),
                    ),
                    2,
                )
            }
            0x20 => {
                let ty = self.type_ref(self.unit(pc + 1, off)? as u32, off)?;
                (
                    insn(
                        InsnKind::InstanceOf(ty),
                        vec![InsnArg::reg(b4)],
                        Some(RegisterArg::typed(a4, ArgType::Boolean)),
                    ),
                    2,
                )
            }
            0x21 => (
                insn(
                    InsnKind::ArrayLength,
                    vec![InsnArg::reg(b4)],
                    Some(RegisterArg::typed(a4, ArgType::Int)),
                ),
                1,
            ),
            0x22 => {
                let ty = self.type_ref(self.unit(pc + 1, off)? as u32, off)?;
                (
                    insn(
                        InsnKind::NewInstance(ty.clone()),
                        vec![],
                        Some(RegisterArg::typed(aa, ty)),
                    ),
                    2,
                )
            }
            0x23 => {
                let ty = self.type_ref(self.unit(pc + 1, off)? as u32, off)?;
                (
                    insn(
                        InsnKind::NewArray(ty.clone()),
                        vec![InsnArg::typed_reg(b4, ArgType::Int)],
                        Some(RegisterArg::typed(a4, ty)),
                    ),
                    2,
                )
            }
            0x24 | 0x25 => {
                let ty = self.type_ref(self.unit(pc + 1, off)? as u32, off)?;
                let regs = self.invoke_registers(pc, op == 0x25)?;
                let elem = ty.element_type().cloned().unwrap_or_default();
                let args = regs
                    .into_iter()
                    .map(|r| InsnArg::typed_reg(r, elem.clone()))
                    .collect();
                (insn(InsnKind::FilledNewArray(ty), args, None), 3)
            }
            0x26 => {
                let rel = self.u32_at(pc + 1, off)? as i32;
                let (elem_width, data) = self.read_fill_array(pc, rel)?;
                (
                    insn(
                        InsnKind::FillArray { elem_width, data },
                        vec![InsnArg::reg(aa)],
                        None,
                    ),
                    3,
                )
            }
            0x27 => (insn(InsnKind::Throw, vec![InsnArg::reg(aa)], None), 1),

            // goto
            0x28 => {
                let target = self.target(pc, hi as i8 as i32)?;
                (insn(InsnKind::Goto { target }, vec![], None), 1)
            }
            0x29 => {
                let target = self.target(pc, self.unit(pc + 1, off)? as i16 as i32)?;
                (insn(InsnKind::Goto { target }, vec![], None), 2)
            }
            0x2a => {
                let target = self.target(pc, self.u32_at(pc + 1, off)? as i32)?;
                (insn(InsnKind::Goto { target }, vec![], None), 3)
            }

            0x2b | 0x2c => {
                let rel = self.u32_at(pc + 1, off)? as i32;
                let (keys, targets) = self.read_switch(pc, rel)?;
                (
                    insn(
                        InsnKind::Switch {
                            keys,
                            targets,
                            default: None,
                        },
                        vec![InsnArg::typed_reg(aa, ArgType::Int)],
                        None,
                    ),
                    3,
                )
            }

            // cmpl/cmpg/cmp-long
            0x2d..=0x31 => {
                let u1 = self.unit(pc + 1, off)?;
                let (bb, cc) = ((u1 & 0xff) as RegNum, (u1 >> 8) as RegNum);
                let ty = match op {
                    0x2d | 0x2e => ArgType::Float,
                    0x2f | 0x30 => ArgType::Double,
                    _ => ArgType::Long,
                };
                (
                    insn(
                        InsnKind::Cmp(ty.clone()),
                        vec![
                            InsnArg::typed_reg(bb, ty.clone()),
                            InsnArg::typed_reg(cc, ty),
                        ],
                        Some(RegisterArg::typed(aa, ArgType::Int)),
                    ),
                    2,
                )
            }

            0x32..=0x37 => {
                let cmp = cmp_op(op - 0x32, off)?;
                let target = self.target(pc, self.unit(pc + 1, off)? as i16 as i32)?;
                (
                    insn(
                        InsnKind::If { op: cmp, target },
                        vec![InsnArg::reg(a4), InsnArg::reg(b4)],
                        None,
                    ),
                    2,
                )
            }
            0x38..=0x3d => {
                let cmp = cmp_op(op - 0x38, off)?;
                let target = self.target(pc, self.unit(pc + 1, off)? as i16 as i32)?;
                (
                    insn(
                        InsnKind::If { op: cmp, target },
                        vec![InsnArg::reg(aa)],
                        None,
                    ),
                    2,
                )
            }

            // aget / aput
            0x44..=0x51 => {
                let u1 = self.unit(pc + 1, off)?;
                let (bb, cc) = ((u1 & 0xff) as RegNum, (u1 >> 8) as RegNum);
                let variant = if op >= 0x4b { op - 0x4b } else { op - 0x44 };
                let elem = array_variant_type(variant);
                let array = InsnArg::reg(bb);
                let index = InsnArg::typed_reg(cc, ArgType::Int);
                if op < 0x4b {
                    (
                        insn(
                            InsnKind::ArrayGet(elem.clone()),
                            vec![array, index],
                            Some(RegisterArg::typed(aa, elem)),
                        ),
                        2,
                    )
                } else {
                    let value = InsnArg::typed_reg(aa, elem.clone());
                    (
                        insn(InsnKind::ArrayPut(elem), vec![array, index, value], None),
                        2,
                    )
                }
            }

            // iget / iput
            0x52..=0x5f => {
                let field = self.field(self.unit(pc + 1, off)? as u32, off)?;
                let object = InsnArg::typed_reg(b4, ArgType::object(&field.class));
                if op < 0x59 {
                    let result = RegisterArg::typed(a4, field.ty.clone());
                    (
                        insn(InsnKind::InstanceGet(field), vec![object], Some(result)),
                        2,
                    )
                } else {
                    let value = InsnArg::typed_reg(a4, field.ty.clone());
                    (
                        insn(InsnKind::InstancePut(field), vec![object, value], None),
                        2,
                    )
                }
            }

            // sget / sput
            0x60..=0x6d => {
                let field = self.field(self.unit(pc + 1, off)? as u32, off)?;
                if op < 0x67 {
                    let result = RegisterArg::typed(aa, field.ty.clone());
                    (insn(InsnKind::StaticGet(field), vec![], Some(result)), 2)
                } else {
                    let value = InsnArg::typed_reg(aa, field.ty.clone());
                    (insn(InsnKind::StaticPut(field), vec![value], None), 2)
                }
            }

            // invoke-kind / invoke-kind/range
            0x6e..=0x72 | 0x74..=0x78 => {
                let range = op >= 0x74;
                let kind_index = if range { op - 0x74 } else { op - 0x6e };
                let kind = InvokeKind::from_index(kind_index).ok_or(DecodeError::UnknownOpcode {
                    opcode: op as u16,
                    offset: off,
                })?;
                let method = self.method(self.unit(pc + 1, off)? as u32, off)?;
                let regs = self.invoke_registers(pc, range)?;
                let args = map_invoke_args(&regs, &method, kind.is_static(), off)?;
                (insn(InsnKind::Invoke { kind, method }, args, None), 3)
            }

            // 単項演算・型変換（12x）
            0x7b..=0x8f => {
                let (kind, from, to) = unary_kind(op, off)?;
                (
                    insn(
                        kind,
                        vec![InsnArg::typed_reg(b4, from)],
                        Some(RegisterArg::typed(a4, to)),
                    ),
                    1,
                )
            }

            // binop（23x）
            0x90..=0xaf => {
                let (arith, ty) = binop_kind(op - 0x90, off)?;
                let u1 = self.unit(pc + 1, off)?;
                let (bb, cc) = ((u1 & 0xff) as RegNum, (u1 >> 8) as RegNum);
                (binop_insn(off, arith, ty, aa, InsnArg::reg(bb), InsnArg::reg(cc)), 2)
            }

            // binop/2addr（12x）
            0xb0..=0xcf => {
                let (arith, ty) = binop_kind(op - 0xb0, off)?;
                (binop_insn(off, arith, ty, a4, InsnArg::reg(a4), InsnArg::reg(b4)), 1)
            }

            // binop/lit16（22s）
            0xd0..=0xd7 => {
                let lit = self.unit(pc + 1, off)? as i16 as i64;
                (lit_binop(off, op - 0xd0, a4, b4, lit)?, 2)
            }

            // binop/lit8（22b）
            0xd8..=0xe2 => {
                let u1 = self.unit(pc + 1, off)?;
                let bb = (u1 & 0xff) as RegNum;
                let lit = (u1 >> 8) as u8 as i8 as i64;
                (lit_binop(off, op - 0xd8, aa, bb, lit)?, 2)
            }

            _ => {
                return Err(DecodeError::UnknownOpcode {
                    opcode: op as u16,
                    offset: off,
                })
            }
        };

        Ok(decoded)
    }

    /// 35c / 3rc のレジスタ列
    fn invoke_registers(&self, pc: usize, range: bool) -> Result<Vec<RegNum>, DecodeError> {
        let off = pc as Offset;
        let u0 = self.unit(pc, off)?;
        let u2 = self.unit(pc + 2, off)?;
        if range {
            let count = (u0 >> 8) as RegNum;
            return Ok((0..count).map(|i| u2.wrapping_add(i)).collect());
        }
        let count = (u0 >> 12) as usize;
        let g = (u0 >> 8) & 0x0f;
        if count > 5 {
            return Err(DecodeError::Malformed {
                offset: off,
                message: format!("invoke with {} registers", count),
            });
        }
        let regs = [u2 & 0x0f, (u2 >> 4) & 0x0f, (u2 >> 8) & 0x0f, u2 >> 12, g];
        Ok(regs[..count].to_vec())
    }

    fn payload_size(&self, pc: usize) -> Result<usize, DecodeError> {
        let off = pc as Offset;
        let ident = self.unit(pc, off)?;
        let size = self.unit(pc + 1, off)? as usize;
        let len = match ident {
            PACKED_SWITCH_IDENT => size * 2 + 4,
            SPARSE_SWITCH_IDENT => size * 4 + 2,
            FILL_ARRAY_IDENT => {
                let count = self.u32_at(pc + 2, off)? as usize;
                (count * size).div_ceil(2) + 4
            }
            _ => {
                return Err(DecodeError::BadPayload {
                    offset: off,
                    message: format!("unknown payload ident 0x{:04x}", ident),
                })
            }
        };
        if pc + len > self.units.len() {
            return Err(DecodeError::Truncated { offset: off });
        }
        Ok(len)
    }

    fn payload_start(&self, pc: usize, rel: i32) -> Result<usize, DecodeError> {
        let base = pc as i64 + rel as i64;
        if base < 0 || base as usize >= self.units.len() {
            return Err(DecodeError::BadPayload {
                offset: pc as Offset,
                message: format!("payload offset {} out of range", rel),
            });
        }
        Ok(base as usize)
    }

    fn read_switch(&self, pc: usize, rel: i32) -> Result<(Vec<i32>, Vec<Offset>), DecodeError> {
        let off = pc as Offset;
        let p = self.payload_start(pc, rel)?;
        let bad = |message: &str| DecodeError::BadPayload {
            offset: off,
            message: message.to_string(),
        };
        let ident = self.unit(p, off).map_err(|_| bad("truncated switch payload"))?;
        let size = self.unit(p + 1, off).map_err(|_| bad("truncated switch payload"))? as usize;

        let mut keys = Vec::with_capacity(size);
        let mut targets = Vec::with_capacity(size);
        match ident {
            PACKED_SWITCH_IDENT => {
                let first = self
                    .u32_at(p + 2, off)
                    .map_err(|_| bad("truncated switch payload"))? as i32;
                for i in 0..size {
                    let rel_target = self
                        .u32_at(p + 4 + i * 2, off)
                        .map_err(|_| bad("truncated switch payload"))?
                        as i32;
                    keys.push(first.wrapping_add(i as i32));
                    targets.push(self.target(pc, rel_target)?);
                }
            }
            SPARSE_SWITCH_IDENT => {
                for i in 0..size {
                    let key = self
                        .u32_at(p + 2 + i * 2, off)
                        .map_err(|_| bad("truncated switch payload"))?
                        as i32;
                    let rel_target = self
                        .u32_at(p + 2 + size * 2 + i * 2, off)
                        .map_err(|_| bad("truncated switch payload"))?
                        as i32;
                    keys.push(key);
                    targets.push(self.target(pc, rel_target)?);
                }
            }
            _ => return Err(bad("expected switch payload")),
        }
        Ok((keys, targets))
    }

    fn read_fill_array(&self, pc: usize, rel: i32) -> Result<(u16, Vec<i64>), DecodeError> {
        let off = pc as Offset;
        let p = self.payload_start(pc, rel)?;
        let bad = |message: &str| DecodeError::BadPayload {
            offset: off,
            message: message.to_string(),
        };
        if self.unit(p, off).map_err(|_| bad("truncated array payload"))? != FILL_ARRAY_IDENT {
            return Err(bad("expected fill-array-data payload"));
        }
        let width = self.unit(p + 1, off).map_err(|_| bad("truncated array payload"))?;
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(bad("invalid element width"));
        }
        let count = self.u32_at(p + 2, off).map_err(|_| bad("truncated array payload"))? as usize;

        let byte_at = |i: usize| -> Result<u8, DecodeError> {
            let unit = self
                .unit(p + 4 + i / 2, off)
                .map_err(|_| bad("truncated array payload"))?;
            Ok(if i % 2 == 0 { unit as u8 } else { (unit >> 8) as u8 })
        };

        let w = width as usize;
        let mut data = Vec::with_capacity(count);
        for e in 0..count {
            let mut raw: u64 = 0;
            for b in 0..w {
                raw |= (byte_at(e * w + b)? as u64) << (8 * b);
            }
            let shift = 64 - 8 * w as u32;
            data.push(((raw << shift) as i64) >> shift);
        }
        Ok((width, data))
    }
}

fn wide_reg(reg: RegNum, wide: bool) -> RegisterArg {
    if wide {
        RegisterArg::typed(reg, ArgType::Narrow(PrimitiveSet::WIDE))
    } else {
        RegisterArg::new(reg)
    }
}

fn const_insn(offset: Offset, reg: RegNum, value: i64, wide: bool) -> Decoded {
    let ty = ArgType::Narrow(literal_candidates(value, wide));
    Decoded::Insn(Insn::new(
        InsnKind::Const,
        vec![InsnArg::lit(value, ty.clone())],
        Some(RegisterArg::typed(reg, ty)),
        offset,
    ))
}

fn cmp_op(index: u8, offset: Offset) -> Result<CmpOp, DecodeError> {
    CmpOp::from_index(index).ok_or(DecodeError::UnknownOpcode {
        opcode: index as u16,
        offset,
    })
}

/// aget/aput の変種ごとの要素型ヒント
fn array_variant_type(variant: u8) -> ArgType {
    match variant {
        0 => ArgType::Narrow(PrimitiveSet::INT | PrimitiveSet::FLOAT),
        1 => ArgType::Narrow(PrimitiveSet::WIDE),
        2 => ArgType::Unknown,
        3 => ArgType::Boolean,
        4 => ArgType::Byte,
        5 => ArgType::Char,
        _ => ArgType::Short,
    }
}

/// binop 表のインデックス（0..32）から演算と型
fn binop_kind(index: u8, offset: Offset) -> Result<(ArithOp, ArgType), DecodeError> {
    let (op_index, ty) = match index {
        0..=10 => (index, ArgType::Int),
        11..=21 => (index - 11, ArgType::Long),
        22..=26 => (index - 22, ArgType::Float),
        27..=31 => (index - 27, ArgType::Double),
        _ => {
            return Err(DecodeError::UnknownOpcode {
                opcode: index as u16,
                offset,
            })
        }
    };
    let op = ArithOp::from_index(op_index).ok_or(DecodeError::UnknownOpcode {
        opcode: index as u16,
        offset,
    })?;
    Ok((op, ty))
}

fn binop_insn(
    offset: Offset,
    op: ArithOp,
    ty: ArgType,
    dst: RegNum,
    lhs: InsnArg,
    rhs: InsnArg,
) -> Decoded {
    let retype = |arg: InsnArg, ty: ArgType| match arg {
        InsnArg::Register(r) => InsnArg::typed_reg(r.reg, ty),
        other => other,
    };
    let rhs_ty = if op.is_shift() { ArgType::Int } else { ty.clone() };
    Decoded::Insn(Insn::new(
        InsnKind::Arith { op, ty: ty.clone() },
        vec![retype(lhs, ty.clone()), retype(rhs, rhs_ty)],
        Some(RegisterArg::typed(dst, ty)),
        offset,
    ))
}

/// lit16 / lit8 演算（rsub はオペランドを入れ替えた減算）
fn lit_binop(
    offset: Offset,
    index: u8,
    dst: RegNum,
    src: RegNum,
    lit: i64,
) -> Result<Decoded, DecodeError> {
    let literal = InsnArg::lit(lit, ArgType::Int);
    let reg = InsnArg::typed_reg(src, ArgType::Int);
    let decoded = match index {
        0 => binop_insn(offset, ArithOp::Add, ArgType::Int, dst, reg, literal),
        1 => binop_insn(offset, ArithOp::Sub, ArgType::Int, dst, literal, reg),
        _ => {
            let op = ArithOp::from_index(index).ok_or(DecodeError::UnknownOpcode {
                opcode: index as u16,
                offset,
            })?;
            binop_insn(offset, op, ArgType::Int, dst, reg, literal)
        }
    };
    Ok(decoded)
}

/// 単項演算の種類と (入力型, 出力型)
fn unary_kind(op: u8, offset: Offset) -> Result<(InsnKind, ArgType, ArgType), DecodeError> {
    use ArgType::*;
    let cast = |from: ArgType, to: ArgType| {
        (
            InsnKind::Cast {
                from: from.clone(),
                to: to.clone(),
            },
            from,
            to,
        )
    };
    Ok(match op {
        0x7b => (InsnKind::Neg(Int), Int, Int),
        0x7c => (InsnKind::Not(Int), Int, Int),
        0x7d => (InsnKind::Neg(Long), Long, Long),
        0x7e => (InsnKind::Not(Long), Long, Long),
        0x7f => (InsnKind::Neg(Float), Float, Float),
        0x80 => (InsnKind::Neg(Double), Double, Double),
        0x81 => cast(Int, Long),
        0x82 => cast(Int, Float),
        0x83 => cast(Int, Double),
        0x84 => cast(Long, Int),
        0x85 => cast(Long, Float),
        0x86 => cast(Long, Double),
        0x87 => cast(Float, Int),
        0x88 => cast(Float, Long),
        0x89 => cast(Float, Double),
        0x8a => cast(Double, Int),
        0x8b => cast(Double, Long),
        0x8c => cast(Double, Float),
        0x8d => cast(Int, Byte),
        0x8e => cast(Int, Char),
        0x8f => cast(Int, Short),
        _ => {
            return Err(DecodeError::UnknownOpcode {
                opcode: op as u16,
                offset,
            })
        }
    })
}

/// 呼び出しのレジスタ列を引数へ割り当てる（ワイド引数は2レジスタ）
fn map_invoke_args(
    regs: &[RegNum],
    method: &MethodRef,
    is_static: bool,
    offset: Offset,
) -> Result<Vec<InsnArg>, DecodeError> {
    let expected = method.arg_register_count(is_static);
    if regs.len() != expected {
        return Err(DecodeError::OperandMismatch {
            offset,
            expected,
            found: regs.len(),
        });
    }

    let mut args = Vec::with_capacity(method.params.len() + 1);
    let mut idx = 0;
    if !is_static {
        args.push(InsnArg::typed_reg(regs[0], ArgType::object(&method.class)));
        idx = 1;
    }
    for param in &method.params {
        args.push(InsnArg::typed_reg(regs[idx], param.clone()));
        idx += if param.is_wide() { 2 } else { 1 };
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::pool::ConstPool;

    fn decode(units: &[u16], pool: &ConstPool) -> Result<Vec<Insn>, DecodeError> {
        DalvikDecoder::new(units, pool).decode_all()
    }

    #[test]
    fn test_decode_const_and_return() {
        let pool = ConstPool::new();
        // const/4 v0, -1 ; return v0
        let insns = decode(&[0xf012, 0x000f], &pool).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].kind, InsnKind::Const);
        match &insns[0].args[0] {
            InsnArg::Literal(lit) => assert_eq!(lit.value, -1),
            other => panic!("unexpected arg {other:?}"),
        }
        assert_eq!(insns[1].offset, 1);
        assert!(matches!(insns[1].kind, InsnKind::Return));
    }

    #[test]
    fn test_invoke_folds_move_result() {
        let mut pool = ConstPool::new();
        let idx = pool.add_method(MethodRef::parse("Foo", "max", "(JJ)J").unwrap());
        // invoke-static {v0, v1, v2, v3}, Foo.max ; move-result-wide v4 ; return-wide v4
        let units = [0x4071, idx as u16, 0x3210, 0x040b, 0x0410];
        let insns = decode(&units, &pool).unwrap();
        assert_eq!(insns.len(), 2);

        let call = &insns[0];
        assert_eq!(call.args.len(), 2);
        assert_eq!(call.args[1].as_register().map(|r| r.reg), Some(2));
        let result = call.result.as_ref().unwrap();
        assert_eq!(result.reg, 4);
        assert!(result.wide);
    }

    #[test]
    fn test_invoke_operand_mismatch() {
        let mut pool = ConstPool::new();
        let idx = pool.add_method(MethodRef::parse("Foo", "f", "(J)V").unwrap());
        // invoke-static {v0}, Foo.f(J) は2レジスタ必要
        let units = [0x1071, idx as u16, 0x0000, 0x000e];
        let err = decode(&units, &pool).unwrap_err();
        assert_eq!(
            err,
            DecodeError::OperandMismatch {
                offset: 0,
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_packed_switch_payload() {
        let pool = ConstPool::new();
        let units = [
            0x002b, 0x0006, 0x0000, // packed-switch v0, +6
            0x000e, // return-void
            0x000e, // return-void
            0x0000, // nop (padding)
            0x0100, 0x0002, 0x000a, 0x0000, // ident, size=2, first_key=10
            0x0003, 0x0000, 0x0004, 0x0000, // targets +3, +4
        ];
        let insns = decode(&units, &pool).unwrap();
        match &insns[0].kind {
            InsnKind::Switch { keys, targets, .. } => {
                assert_eq!(keys, &vec![10, 11]);
                assert_eq!(targets, &vec![3, 4]);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        // payload は命令列に現れない
        assert!(insns.iter().all(|i| i.offset < 6));
    }

    #[test]
    fn test_unknown_and_truncated() {
        let pool = ConstPool::new();
        assert_eq!(
            decode(&[0x003e], &pool).unwrap_err(),
            DecodeError::UnknownOpcode {
                opcode: 0x3e,
                offset: 0
            }
        );
        assert_eq!(
            decode(&[0x0013], &pool).unwrap_err(),
            DecodeError::Truncated { offset: 0 }
        );
        assert!(code_units(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_rsub_swaps_operands() {
        let pool = ConstPool::new();
        // rsub-int/lit8 v0, v1, #5 ; return v0
        let insns = decode(&[0x00d9, 0x0501, 0x000f], &pool).unwrap();
        match (&insns[0].kind, &insns[0].args[0]) {
            (InsnKind::Arith { op: ArithOp::Sub, .. }, InsnArg::Literal(lit)) => {
                assert_eq!(lit.value, 5)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_lenient_disassembly() {
        let pool = ConstPool::new();
        let units = [0x0012, 0x003e, 0x000e];
        let lines = DalvikDecoder::new(&units, &pool).disassemble();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains(".word 0x003e"));
    }
}
