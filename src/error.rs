/// エラー分類
///
/// デコンパイルパイプラインで発生するエラーと非致命的な診断情報。
/// DecodeError / InconsistencyError はメソッド単位で処理を中断し、
/// TypeConflict / StructuringFallback は診断として記録して処理を継続する。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// パイプライン内部の不変条件違反を生成する
///
/// 発生箇所（ファイル・行）を記録する。
macro_rules! inconsistency {
    ($msg:expr) => {
        $crate::error::DecompileError::Inconsistency {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DecompileError::Inconsistency {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// バイトコード解析エラー（命令ローダー）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// 命令列が途中で終わっている
    #[error("truncated bytecode at offset 0x{offset:04x}")]
    Truncated { offset: u32 },

    /// 未知のオペコード
    #[error("unknown opcode 0x{opcode:02x} at offset 0x{offset:04x}")]
    UnknownOpcode { opcode: u16, offset: u32 },

    /// オペランド数が呼び出し先のプロトタイプと一致しない
    #[error("operand count mismatch at 0x{offset:04x}: expected {expected}, found {found}")]
    OperandMismatch {
        offset: u32,
        expected: usize,
        found: usize,
    },

    /// 定数プール参照が範囲外、または種類が違う
    #[error("bad {kind} reference #{index} at 0x{offset:04x}")]
    BadReference {
        kind: &'static str,
        index: u32,
        offset: u32,
    },

    /// switch / fill-array-data のペイロードが壊れている
    #[error("bad payload at 0x{offset:04x}: {message}")]
    BadPayload { offset: u32, message: String },

    /// その他の構造的な不整合
    #[error("malformed bytecode at 0x{offset:04x}: {message}")]
    Malformed { offset: u32, message: String },
}

/// パイプライン全体のエラー
#[derive(Error, Debug)]
pub enum DecompileError {
    /// バイトコードの解析に失敗
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// 内部不変条件の違反（パイプラインのバグを示す）
    #[error("inconsistency - {file}:{line}: {message}")]
    Inconsistency {
        message: String,
        file: &'static str,
        line: u32,
    },

    /// ジョブ全体がキャンセルされた
    #[error("decompilation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DecompileError>;

impl DecompileError {
    /// 内部不整合エラーかどうか
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, DecompileError::Inconsistency { .. })
    }
}

/// 非致命的な診断の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// 型の単一化に失敗し、トップ型に縮退した
    TypeConflict,
    /// 構造化できない制御フローを明示的なgotoで出力した
    StructuringFallback,
    /// インライン化の反復上限に達した
    InlinePassLimit,
    /// 型推論の反復上限に達した
    TypeIterationLimit,
    /// 到達する定義のないレジスタを読んだ
    UndefinedRegister,
    /// new と <init> をまとめられなかった
    UnfoldedConstructor,
}

/// メソッド単位で記録される診断
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistency_macro_records_location() {
        let err = inconsistency!("invalid inline positions: {} - {}", 3, 2);
        match &err {
            DecompileError::Inconsistency { message, file, line } => {
                assert_eq!(message, "invalid inline positions: 3 - 2");
                assert!(file.ends_with("error.rs"));
                assert!(*line > 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_inconsistency());
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::UnknownOpcode {
            opcode: 0x3e,
            offset: 4,
        };
        assert_eq!(err.to_string(), "unknown opcode 0x3e at offset 0x0004");

        let wrapped: DecompileError = err.into();
        assert!(matches!(wrapped, DecompileError::Decode(_)));
        assert!(!wrapped.is_inconsistency());
    }
}
