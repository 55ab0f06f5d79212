/// コード出力とメタデータ
///
/// CodeWriter はインデント付きでテキストを組み立てながら、
/// 出力範囲 → 注釈（宣言 / 命令オフセット）の対応を記録する。
/// 注釈は入れ子で開始・終了できるが、記録される範囲は内側優先で分割され、
/// 互いに重ならない連続区間になる。

use crate::decompiler::insn::Offset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 宣言の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclKind {
    Class,
    Method,
    Parameter,
    Variable,
}

/// 出力範囲に付く注釈
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeAnnotation {
    /// 宣言
    Declaration { kind: DeclKind, name: String },
    /// 元の命令オフセット
    Offset { offset: Offset },
}

/// メタデータの1区間 [start, end)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub start: usize,
    pub end: usize,
    pub annotation: CodeAnnotation,
}

/// 出力テキストのメタデータ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMetadata {
    /// 開始位置順、重なりなし
    pub entries: Vec<MetadataEntry>,
    /// 出力行（1始まり） → ソース行番号
    pub lines: BTreeMap<usize, u32>,
}

impl CodeMetadata {
    /// 位置 pos を含む区間
    pub fn at(&self, pos: usize) -> Option<&MetadataEntry> {
        let idx = self.entries.partition_point(|e| e.end <= pos);
        self.entries.get(idx).filter(|e| e.start <= pos)
    }

    /// 命令オフセットが出力された最初の位置
    pub fn position_of(&self, offset: Offset) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.annotation == CodeAnnotation::Offset { offset })
            .map(|e| e.start)
    }

    /// 区間が昇順で重なっていないか
    pub fn is_exact(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| w[0].start < w[0].end && w[0].end <= w[1].start)
            && self.entries.last().map_or(true, |e| e.start < e.end)
    }

    /// 全区間を base だけずらして追加する
    pub fn append(&mut self, other: CodeMetadata, base: usize, line_base: usize) {
        for mut e in other.entries {
            e.start += base;
            e.end += base;
            self.entries.push(e);
        }
        for (line, src) in other.lines {
            self.lines.insert(line + line_base, src);
        }
    }
}

/// 完成したコード
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeOutput {
    pub code: String,
    pub metadata: CodeMetadata,
}

/// インデント付きコードライター
pub struct CodeWriter {
    buf: String,
    indent_unit: String,
    indent_level: usize,
    line: usize,
    at_line_start: bool,
    open: Vec<CodeAnnotation>,
    segment_start: usize,
    metadata: CodeMetadata,
}

impl CodeWriter {
    pub fn new(indent: usize) -> Self {
        Self {
            buf: String::new(),
            indent_unit: " ".repeat(indent),
            indent_level: 0,
            line: 1,
            at_line_start: true,
            open: Vec::new(),
            segment_start: 0,
            metadata: CodeMetadata::default(),
        }
    }

    /// 現在位置（バイト）
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    /// 現在の行番号（1始まり）
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn inc_indent(&mut self) {
        self.indent_level += 1;
    }

    pub fn dec_indent(&mut self) {
        self.indent_level = self.indent_level.saturating_sub(1);
    }

    /// 新しい行を始めてインデントを書く
    pub fn start_line(&mut self) -> &mut Self {
        if !self.at_line_start {
            self.newline();
        }
        for _ in 0..self.indent_level {
            self.buf.push_str(&self.indent_unit);
        }
        self.at_line_start = false;
        self
    }

    pub fn add(&mut self, text: &str) -> &mut Self {
        if self.at_line_start && !text.is_empty() {
            self.start_line();
        }
        self.buf.push_str(text);
        self
    }

    /// 1行まるごと
    pub fn add_line(&mut self, text: &str) -> &mut Self {
        self.start_line();
        self.buf.push_str(text);
        self
    }

    pub fn newline(&mut self) -> &mut Self {
        self.buf.push('\n');
        self.line += 1;
        self.at_line_start = true;
        self
    }

    /// 注釈区間を開く
    pub fn begin(&mut self, annotation: CodeAnnotation) {
        self.flush_segment();
        self.open.push(annotation);
    }

    /// 直近に開いた注釈区間を閉じる
    pub fn end(&mut self) {
        self.flush_segment();
        self.open.pop();
    }

    /// text を注釈付きで書く
    pub fn add_annotated(&mut self, text: &str, annotation: CodeAnnotation) -> &mut Self {
        if self.at_line_start && !text.is_empty() {
            self.start_line();
        }
        self.begin(annotation);
        self.buf.push_str(text);
        self.end();
        self
    }

    /// 現在の行にソース行番号を対応付ける
    pub fn attach_source_line(&mut self, source_line: u32) {
        self.metadata.lines.entry(self.line).or_insert(source_line);
    }

    fn flush_segment(&mut self) {
        let pos = self.buf.len();
        if let Some(top) = self.open.last() {
            if pos > self.segment_start {
                match self.metadata.entries.last_mut() {
                    Some(last) if last.end == self.segment_start && last.annotation == *top => {
                        last.end = pos;
                    }
                    _ => self.metadata.entries.push(MetadataEntry {
                        start: self.segment_start,
                        end: pos,
                        annotation: top.clone(),
                    }),
                }
            }
        }
        self.segment_start = pos;
    }

    /// 書き込み済みのテキストとメタデータを取り出す
    pub fn finish(mut self) -> CodeOutput {
        while !self.open.is_empty() {
            self.end();
        }
        CodeOutput {
            code: self.buf,
            metadata: self.metadata,
        }
    }
}

/// デコンパイルに失敗したメソッドの生ダンプ
///
/// 失敗理由と逆アセンブル結果をコメントとして書く。
pub fn dump_raw(writer: &mut CodeWriter, reason: &str, listing: &[String]) {
    writer.add_line("/*");
    writer.add_line(&format!(" * Method decompilation failed: {}", reason));
    if !listing.is_empty() {
        writer.add_line(" *");
        for line in listing {
            writer.add_line(&format!(" *   {}", line));
        }
    }
    writer.add_line(" */");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indentation() {
        let mut w = CodeWriter::new(4);
        w.add_line("class A {");
        w.inc_indent();
        w.add_line("int x;");
        w.dec_indent();
        w.add_line("}");
        let out = w.finish();
        assert_eq!(out.code, "class A {\n    int x;\n}");
    }

    #[test]
    fn test_nested_annotations_are_split() {
        let mut w = CodeWriter::new(4);
        w.start_line();
        w.begin(CodeAnnotation::Offset { offset: 3 });
        w.add("int ");
        w.add_annotated(
            "x",
            CodeAnnotation::Declaration {
                kind: DeclKind::Variable,
                name: "x".into(),
            },
        );
        w.add(" = 1;");
        w.end();
        let out = w.finish();

        assert_eq!(out.code, "int x = 1;");
        let md = &out.metadata;
        assert!(md.is_exact());
        assert_eq!(md.entries.len(), 3);
        assert_eq!((md.entries[0].start, md.entries[0].end), (0, 4));
        assert_eq!((md.entries[1].start, md.entries[1].end), (4, 5));
        assert!(matches!(md.entries[1].annotation, CodeAnnotation::Declaration { .. }));
        assert_eq!((md.entries[2].start, md.entries[2].end), (5, 10));
        assert_eq!(md.at(7).map(|e| &e.annotation), Some(&CodeAnnotation::Offset { offset: 3 }));
        assert_eq!(md.position_of(3), Some(0));
        assert!(md.at(10).is_none());
    }

    #[test]
    fn test_adjacent_segments_merge() {
        let mut w = CodeWriter::new(2);
        let ann = CodeAnnotation::Offset { offset: 1 };
        w.add_annotated("a", ann.clone());
        w.add_annotated("b", ann);
        let out = w.finish();
        assert_eq!(out.metadata.entries.len(), 1);
        assert_eq!(out.metadata.entries[0].end, 2);
    }

    #[test]
    fn test_raw_dump_is_comment() {
        let mut w = CodeWriter::new(4);
        dump_raw(
            &mut w,
            "decode error: truncated bytecode at offset 0x0002",
            &["0000: const/4 v0, #5".to_string()],
        );
        let out = w.finish();
        assert!(out.code.starts_with("/*"));
        assert!(out.code.ends_with(" */"));
        assert!(out.code.contains("truncated bytecode"));
        assert!(out.code.contains(" *   0000: const/4 v0, #5"));
    }
}
