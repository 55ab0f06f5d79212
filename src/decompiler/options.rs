/// デコンパイラ設定
///
/// JSON ファイルから読み込み、CLI フラグで上書きする。
/// 全フィールドにデフォルト値があるので部分的な設定ファイルも受け付ける。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompilerOptions {
    /// ワーカープールのスレッド数（None = rayon のデフォルト）
    pub threads: Option<usize>,
    /// 式インライン化の最大パス数
    pub max_inline_passes: usize,
    /// 型推論ワークリストの最大処理数
    pub max_type_iterations: usize,
    /// 三項演算子への畳み込み
    pub fold_ternaries: bool,
    /// new-instance + <init> の畳み込み
    pub fold_constructors: bool,
    /// 失敗したメソッドを生ダンプで出力する
    pub raw_fallback: bool,
    /// 各文の後ろに命令オフセットのコメントを付ける
    pub emit_offsets: bool,
    /// インデント幅（スペース数）
    pub indent: usize,
}

impl Default for DecompilerOptions {
    fn default() -> Self {
        Self {
            threads: None,
            max_inline_passes: 16,
            max_type_iterations: 10_000,
            fold_ternaries: true,
            fold_constructors: true,
            raw_fallback: true,
            emit_offsets: false,
            indent: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let opts: DecompilerOptions =
            serde_json::from_str(r#"{ "emit_offsets": true, "threads": 2 }"#).unwrap();
        assert!(opts.emit_offsets);
        assert_eq!(opts.threads, Some(2));
        assert_eq!(opts.max_inline_passes, 16);
        assert_eq!(opts.indent, 4);
        assert!(opts.fold_ternaries);
    }

    #[test]
    fn test_empty_object_is_default() {
        let opts: DecompilerOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts, DecompilerOptions::default());
    }
}
