/// dexdec ライブラリ
///
/// Dalvik / JVM バイトコードを Java 風ソースへ戻すデコンパイラ

#[macro_use]
pub mod error;

pub mod decompiler;
