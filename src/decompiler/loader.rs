/// 命令ローダー
///
/// メソッドの生バイトコード・例外表・行番号表を読み、
/// 形式（Dalvik / クラスファイル）ごとのデコーダで共通IRへ変換する。
/// 引数レジスタの割り当てもここで決める。

use crate::decompiler::dalvik::{code_units, DalvikDecoder};
use crate::decompiler::insn::{Insn, InsnKind, Offset, RegNum, RegisterArg};
use crate::decompiler::jvm::JvmDecoder;
use crate::decompiler::pool::{MethodSignature, RefResolver};
use crate::decompiler::types::ArgType;
use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// バイトコード形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BytecodeFormat {
    Dalvik,
    Jvm,
}

/// 例外ハンドラ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchHandler {
    /// None は catch-all
    pub exception: Option<ArgType>,
    pub target: Offset,
}

/// try 範囲 [start, end)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryBlock {
    pub start: Offset,
    pub end: Offset,
    pub handlers: Vec<CatchHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub offset: Offset,
    pub line: u32,
}

/// デコード前のメソッド本体
#[derive(Debug, Clone)]
pub struct RawMethod {
    pub format: BytecodeFormat,
    /// Dalvik は registers_size、クラスファイルは max_locals
    pub registers: u16,
    /// クラスファイルのみ
    pub max_stack: u16,
    pub code: Vec<u8>,
    pub tries: Vec<TryBlock>,
    pub lines: Vec<LineEntry>,
}

/// デコード済みのメソッド本体
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub insns: Vec<Insn>,
    pub registers: u16,
    /// インスタンスメソッドの受け取り側レジスタ
    pub this_reg: Option<RegNum>,
    /// 宣言順の引数レジスタ（受け取り側を除く）
    pub params: Vec<RegisterArg>,
    pub tries: Vec<TryBlock>,
    /// コード長（オフセット単位）
    pub code_len: Offset,
}

/// メソッドを共通IRへ読み込む
pub fn load_method(
    raw: &RawMethod,
    sig: &MethodSignature,
    pool: &dyn RefResolver,
) -> Result<MethodBody, DecodeError> {
    let mut body = match raw.format {
        BytecodeFormat::Dalvik => load_dalvik(raw, sig, pool)?,
        BytecodeFormat::Jvm => load_jvm(raw, sig, pool)?,
    };
    validate_tries(&body.tries, body.code_len)?;
    attach_lines(&mut body.insns, &raw.lines);

    debug!(
        "Loaded {}.{}: {} insns, {} registers",
        sig.class,
        sig.name,
        body.insns.len(),
        body.registers
    );
    Ok(body)
}

/// デコードに失敗したメソッド用の寛容な命令リスト
pub fn disassemble(raw: &RawMethod, sig: &MethodSignature, pool: &dyn RefResolver) -> Vec<String> {
    match raw.format {
        BytecodeFormat::Dalvik => match code_units(&raw.code) {
            Ok(units) => DalvikDecoder::new(&units, pool).disassemble(),
            Err(e) => vec![format!("// {}", e)],
        },
        BytecodeFormat::Jvm => {
            JvmDecoder::new(&raw.code, pool, &sig.class, raw.registers, raw.max_stack).disassemble()
        }
    }
}

fn load_dalvik(
    raw: &RawMethod,
    sig: &MethodSignature,
    pool: &dyn RefResolver,
) -> Result<MethodBody, DecodeError> {
    let units = code_units(&raw.code)?;
    let mut insns = DalvikDecoder::new(&units, pool).decode_all()?;

    // 引数は末尾の ins 個のレジスタに入る
    let ins = sig.ins_size();
    if ins > raw.registers as usize {
        return Err(DecodeError::Malformed {
            offset: 0,
            message: format!(
                "method needs {} argument registers but has {}",
                ins, raw.registers
            ),
        });
    }
    let first = raw.registers - ins as u16;
    let (this_reg, params) = assign_params(sig, first);

    // move-exception に捕捉型を付ける
    for t in &raw.tries {
        for h in &t.handlers {
            if let Some(insn) = insns.iter_mut().find(|i| i.offset == h.target) {
                if let InsnKind::MoveException(ty @ None) = &mut insn.kind {
                    *ty = h.exception.clone();
                    if let (Some(result), Some(exc)) = (&mut insn.result, &h.exception) {
                        result.ty = exc.clone();
                    }
                }
            }
        }
    }

    Ok(MethodBody {
        insns,
        registers: raw.registers,
        this_reg,
        params,
        tries: raw.tries.clone(),
        code_len: units.len() as Offset,
    })
}

fn load_jvm(
    raw: &RawMethod,
    sig: &MethodSignature,
    pool: &dyn RefResolver,
) -> Result<MethodBody, DecodeError> {
    let ins = sig.ins_size();
    if ins > raw.registers as usize {
        return Err(DecodeError::Malformed {
            offset: 0,
            message: format!("method needs {} locals but max_locals is {}", ins, raw.registers),
        });
    }

    let mut handlers: Vec<(Offset, Option<ArgType>)> = Vec::new();
    for t in &raw.tries {
        for h in &t.handlers {
            if !handlers.iter().any(|(target, _)| *target == h.target) {
                handlers.push((h.target, h.exception.clone()));
            }
        }
    }

    let decoder = JvmDecoder::new(&raw.code, pool, &sig.class, raw.registers, raw.max_stack)
        .with_handlers(handlers);
    let registers = decoder.register_count()?;
    let insns = decoder.decode_all()?;
    let (this_reg, params) = assign_params(sig, 0);

    Ok(MethodBody {
        insns,
        registers,
        this_reg,
        params,
        tries: raw.tries.clone(),
        code_len: raw.code.len() as Offset,
    })
}

/// 受け取り側と引数のレジスタ（ワイド引数は2つ）
fn assign_params(sig: &MethodSignature, first: RegNum) -> (Option<RegNum>, Vec<RegisterArg>) {
    let mut reg = first;
    let this_reg = if sig.is_static() {
        None
    } else {
        reg += 1;
        Some(first)
    };
    let mut params = Vec::with_capacity(sig.params.len());
    for p in &sig.params {
        params.push(RegisterArg::typed(reg, p.clone()));
        reg += if p.is_wide() { 2 } else { 1 };
    }
    (this_reg, params)
}

fn validate_tries(tries: &[TryBlock], code_len: Offset) -> Result<(), DecodeError> {
    for t in tries {
        if t.start >= t.end || t.end > code_len {
            return Err(DecodeError::Malformed {
                offset: t.start,
                message: format!("invalid try range 0x{:04x}..0x{:04x}", t.start, t.end),
            });
        }
        if let Some(h) = t.handlers.iter().find(|h| h.target >= code_len) {
            return Err(DecodeError::Malformed {
                offset: t.start,
                message: format!("handler 0x{:04x} outside the method", h.target),
            });
        }
    }
    Ok(())
}

/// 行番号表を命令へ反映（オフセット以前で最も近いエントリ）
fn attach_lines(insns: &mut [Insn], lines: &[LineEntry]) {
    if lines.is_empty() {
        return;
    }
    let mut sorted = lines.to_vec();
    sorted.sort_by_key(|e| e.offset);
    for insn in insns.iter_mut() {
        let idx = sorted.partition_point(|e| e.offset <= insn.offset);
        if idx > 0 {
            insn.line = Some(sorted[idx - 1].line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::pool::{access, ConstPool};

    fn dalvik_raw(units: &[u16], registers: u16) -> RawMethod {
        RawMethod {
            format: BytecodeFormat::Dalvik,
            registers,
            max_stack: 0,
            code: units.iter().flat_map(|u| u.to_le_bytes()).collect(),
            tries: Vec::new(),
            lines: Vec::new(),
        }
    }

    #[test]
    fn test_params_occupy_last_registers() {
        let sig = MethodSignature::new("Foo", "f", "(JI)V", 0).unwrap();
        let raw = dalvik_raw(&[0x000e], 6);
        let body = load_method(&raw, &sig, &ConstPool::new()).unwrap();

        // ins = this + long(2) + int = 4 → v2..v5
        assert_eq!(body.this_reg, Some(2));
        assert_eq!(body.params[0].reg, 3);
        assert!(body.params[0].wide);
        assert_eq!(body.params[1].reg, 5);
    }

    #[test]
    fn test_too_few_registers() {
        let sig = MethodSignature::new("Foo", "f", "(II)V", access::STATIC).unwrap();
        let raw = dalvik_raw(&[0x000e], 1);
        assert!(matches!(
            load_method(&raw, &sig, &ConstPool::new()),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_line_numbers_attached() {
        let sig = MethodSignature::new("Foo", "f", "()V", access::STATIC).unwrap();
        let mut raw = dalvik_raw(&[0x0012, 0x0000, 0x000e], 1);
        raw.lines = vec![
            LineEntry { offset: 2, line: 11 },
            LineEntry { offset: 0, line: 10 },
        ];
        let body = load_method(&raw, &sig, &ConstPool::new()).unwrap();
        assert_eq!(body.insns[0].line, Some(10));
        assert_eq!(body.insns[1].line, Some(10));
        assert_eq!(body.insns[2].line, Some(11));
    }

    #[test]
    fn test_catch_type_applied_to_move_exception() {
        let sig = MethodSignature::new("Foo", "f", "()V", access::STATIC).unwrap();
        // nop ; return-void ; move-exception v0 ; return-void
        let mut raw = dalvik_raw(&[0x0000, 0x000e, 0x000d, 0x000e], 1);
        raw.tries = vec![TryBlock {
            start: 0,
            end: 1,
            handlers: vec![CatchHandler {
                exception: Some(ArgType::object("java/io/IOException")),
                target: 2,
            }],
        }];
        let body = load_method(&raw, &sig, &ConstPool::new()).unwrap();
        assert_eq!(
            body.insns[2].kind,
            InsnKind::MoveException(Some(ArgType::object("java.io.IOException")))
        );
    }

    #[test]
    fn test_invalid_try_range() {
        let sig = MethodSignature::new("Foo", "f", "()V", access::STATIC).unwrap();
        let mut raw = dalvik_raw(&[0x000e], 1);
        raw.tries = vec![TryBlock {
            start: 0,
            end: 5,
            handlers: Vec::new(),
        }];
        assert!(load_method(&raw, &sig, &ConstPool::new()).is_err());
    }
}
