/// クラスダンプ（JSON）入力
///
/// CLI とデモが読む入力形式。外部ツールが .dex / .class から抽出した
/// クラス見出し・定数プール・メソッド本体（16進文字列）を持つ。
/// ファイルは単一クラスのオブジェクトか、その配列のどちらでもよい。

use crate::decompiler::hierarchy::ClassInfo;
use crate::decompiler::insn::Offset;
use crate::decompiler::loader::{BytecodeFormat, CatchHandler, LineEntry, RawMethod, TryBlock};
use crate::decompiler::parallel_analyzer::{ClassInput, MethodInput};
use crate::decompiler::pool::{
    ClassFilePool, ConstPool, FieldRef, MethodRef, MethodSignature, PoolEntry, RefResolver,
};
use crate::decompiler::types::ArgType;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// クラス1つ分のダンプ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDump {
    pub name: String,
    #[serde(default)]
    pub super_class: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub access_flags: u32,
    #[serde(default = "default_format")]
    pub format: BytecodeFormat,
    #[serde(default)]
    pub pool: PoolDump,
    #[serde(default)]
    pub methods: Vec<MethodDump>,
    /// 型推論が参照する周辺クラスの階層
    #[serde(default)]
    pub classes: Vec<ClassInfo>,
}

fn default_format() -> BytecodeFormat {
    BytecodeFormat::Dalvik
}

/// フィールド / メソッド参照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDump {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

/// 定数プール
///
/// Dalvik は種類ごとの表（strings / types / fields / methods）、
/// クラスファイルは番号付きの entries を使う。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolDump {
    #[serde(default)]
    pub strings: Vec<String>,
    /// 型記述子
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub fields: Vec<MemberDump>,
    #[serde(default)]
    pub methods: Vec<MemberDump>,
    #[serde(default)]
    pub entries: Vec<EntryDump>,
}

/// クラスファイル定数プールの1エントリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDump {
    pub index: u32,
    #[serde(flatten)]
    pub value: EntryValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryValue {
    /// 内部名（java/lang/String）または配列記述子
    Class { name: String },
    String { value: String },
    Int { value: i32 },
    Float { value: f32 },
    Long { value: i64 },
    Double { value: f64 },
    Field { class: String, name: String, descriptor: String },
    Method { class: String, name: String, descriptor: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDump {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub access_flags: u32,
    /// None は abstract / native
    #[serde(default)]
    pub code: Option<CodeDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeDump {
    pub registers: u16,
    #[serde(default)]
    pub max_stack: u16,
    /// バイトコードの16進文字列（空白は無視）
    pub code: String,
    #[serde(default)]
    pub tries: Vec<TryDump>,
    #[serde(default)]
    pub lines: Vec<LineDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryDump {
    pub start: Offset,
    pub end: Offset,
    pub handlers: Vec<HandlerDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerDump {
    /// 例外型の記述子（None は catch-all）
    #[serde(default)]
    pub exception: Option<String>,
    pub target: Offset,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineDump {
    pub offset: Offset,
    pub line: u32,
}

/// ファイルからクラスダンプを読む
pub fn load(path: &Path) -> Result<Vec<ClassDump>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read class dump {}", path.display()))?;
    from_json(&text).with_context(|| format!("Failed to parse class dump {}", path.display()))
}

/// JSON 文字列（オブジェクトまたは配列）からクラスダンプを読む
pub fn from_json(text: &str) -> Result<Vec<ClassDump>> {
    if text.trim_start().starts_with('[') {
        let dumps: Vec<ClassDump> = serde_json::from_str(text).context("Invalid class dump array")?;
        Ok(dumps)
    } else {
        let dump: ClassDump = serde_json::from_str(text).context("Invalid class dump")?;
        Ok(vec![dump])
    }
}

/// 16進文字列をバイト列にする
fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits ({})", digits.len());
    }
    digits
        .chunks(2)
        .map(|pair| -> Result<u8> {
            let hi = hex_value(pair[0])?;
            let lo = hex_value(pair[1])?;
            Ok(hi << 4 | lo)
        })
        .collect()
}

fn hex_value(digit: u8) -> Result<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(anyhow!("invalid hex digit {:?}", digit as char)),
    }
}

fn parse_type(desc: &str) -> Result<ArgType> {
    ArgType::from_descriptor(desc).ok_or_else(|| anyhow!("invalid type descriptor {:?}", desc))
}

/// クラス参照: 内部名・ドット名・配列記述子のどれでも受け付ける
fn parse_class_ref(name: &str) -> Result<ArgType> {
    if name.starts_with('[') {
        parse_type(name)
    } else {
        Ok(ArgType::object(name))
    }
}

fn parse_field(class: &str, name: &str, descriptor: &str) -> Result<FieldRef> {
    Ok(FieldRef {
        class: class.replace('/', "."),
        name: name.to_string(),
        ty: parse_type(descriptor)?,
    })
}

fn parse_method(class: &str, name: &str, descriptor: &str) -> Result<MethodRef> {
    MethodRef::parse(class, name, descriptor)
        .ok_or_else(|| anyhow!("invalid method descriptor {:?} for {}", descriptor, name))
}

impl PoolDump {
    /// 形式に応じた参照解決器を作る
    pub fn build(&self, format: BytecodeFormat) -> Result<Box<dyn RefResolver>> {
        match format {
            BytecodeFormat::Dalvik => Ok(Box::new(self.build_const_pool()?)),
            BytecodeFormat::Jvm => Ok(Box::new(self.build_class_file_pool()?)),
        }
    }

    fn build_const_pool(&self) -> Result<ConstPool> {
        let mut pool = ConstPool::new();
        for s in &self.strings {
            pool.add_string(s);
        }
        for (i, desc) in self.types.iter().enumerate() {
            let ty = parse_type(desc).with_context(|| format!("type #{}", i))?;
            pool.add_type(ty);
        }
        for (i, f) in self.fields.iter().enumerate() {
            let field = parse_field(&f.class, &f.name, &f.descriptor).with_context(|| format!("field #{}", i))?;
            pool.add_field(field);
        }
        for (i, m) in self.methods.iter().enumerate() {
            let method = parse_method(&m.class, &m.name, &m.descriptor).with_context(|| format!("method #{}", i))?;
            pool.add_method(method);
        }
        Ok(pool)
    }

    fn build_class_file_pool(&self) -> Result<ClassFilePool> {
        let mut pool = ClassFilePool::new();
        for e in &self.entries {
            let entry = match &e.value {
                EntryValue::Class { name } => PoolEntry::Class(parse_class_ref(name)?),
                EntryValue::String { value } => PoolEntry::String(value.clone()),
                EntryValue::Int { value } => PoolEntry::Int(*value),
                EntryValue::Float { value } => PoolEntry::Float(*value),
                EntryValue::Long { value } => PoolEntry::Long(*value),
                EntryValue::Double { value } => PoolEntry::Double(*value),
                EntryValue::Field { class, name, descriptor } => {
                    PoolEntry::Field(parse_field(class, name, descriptor)?)
                }
                EntryValue::Method { class, name, descriptor } => {
                    PoolEntry::Method(parse_method(class, name, descriptor)?)
                }
            };
            pool.insert(e.index, entry);
        }
        Ok(pool)
    }
}

impl CodeDump {
    fn into_raw(self, format: BytecodeFormat) -> Result<RawMethod> {
        let code = decode_hex(&self.code)?;
        if format == BytecodeFormat::Dalvik && code.len() % 2 != 0 {
            bail!("Dalvik code has odd byte length {}", code.len());
        }
        let tries = self
            .tries
            .into_iter()
            .map(|t| -> Result<TryBlock> {
                let handlers = t
                    .handlers
                    .into_iter()
                    .map(|h| -> Result<CatchHandler> {
                        let exception = h.exception.as_deref().map(parse_class_ref).transpose()?;
                        Ok(CatchHandler {
                            exception,
                            target: h.target,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(TryBlock {
                    start: t.start,
                    end: t.end,
                    handlers,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let lines = self
            .lines
            .into_iter()
            .map(|l| LineEntry {
                offset: l.offset,
                line: l.line,
            })
            .collect();
        Ok(RawMethod {
            format,
            registers: self.registers,
            max_stack: self.max_stack,
            code,
            tries,
            lines,
        })
    }
}

impl ClassDump {
    /// 階層情報（自クラスを含む）
    pub fn hierarchy_classes(&self) -> Vec<ClassInfo> {
        let mut out = self.classes.clone();
        let mut own = ClassInfo::new(&self.name, self.super_class.as_deref());
        own.interfaces = self.interfaces.iter().map(|i| i.replace('/', ".")).collect();
        out.push(own);
        out
    }

    /// デコンパイラの入力へ変換する
    pub fn into_class(self) -> Result<ClassInput> {
        let name = self.name.replace('/', ".");
        let pool = self
            .pool
            .build(self.format)
            .with_context(|| format!("Bad constant pool in {}", name))?;

        let mut methods = Vec::with_capacity(self.methods.len());
        for m in self.methods {
            let sig = MethodSignature::new(&name, &m.name, &m.descriptor, m.access_flags)
                .ok_or_else(|| anyhow!("invalid descriptor {:?} for {}.{}", m.descriptor, name, m.name))?;
            let raw = m
                .code
                .map(|c| c.into_raw(self.format))
                .transpose()
                .with_context(|| format!("Bad code in {}.{}", name, m.name))?;
            methods.push(MethodInput { sig, raw });
        }
        debug!("Loaded class dump {} ({} methods)", name, methods.len());

        Ok(ClassInput {
            name,
            super_class: self.super_class.map(|s| s.replace('/', ".")),
            interfaces: self.interfaces.iter().map(|i| i.replace('/', ".")).collect(),
            access_flags: self.access_flags,
            pool,
            methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::pool::LoadableConstant;

    const DALVIK_DUMP: &str = r#"{
        "name": "com/example/Counter",
        "super_class": "java/lang/Object",
        "access_flags": 1,
        "pool": {
            "strings": ["hi"],
            "types": ["Ljava/lang/String;"],
            "methods": [{ "class": "com/example/Counter", "name": "f", "descriptor": "(I)I" }]
        },
        "methods": [
            { "name": "g", "descriptor": "()I", "access_flags": 8,
              "code": { "registers": 1, "code": "1210 0f00", "lines": [{ "offset": 0, "line": 12 }] } },
            { "name": "run", "descriptor": "()V", "access_flags": 1025 }
        ]
    }"#;

    #[test]
    fn test_single_object_dump() {
        let dumps = from_json(DALVIK_DUMP).unwrap();
        assert_eq!(dumps.len(), 1);
        let class = dumps.into_iter().next().unwrap().into_class().unwrap();
        assert_eq!(class.name, "com.example.Counter");
        assert_eq!(class.super_class.as_deref(), Some("java.lang.Object"));
        assert_eq!(class.methods.len(), 2);

        let raw = class.methods[0].raw.as_ref().unwrap();
        assert_eq!(raw.code, vec![0x12, 0x10, 0x0f, 0x00]);
        assert_eq!(raw.lines, vec![LineEntry { offset: 0, line: 12 }]);
        assert!(class.methods[1].raw.is_none());

        assert_eq!(class.pool.string(0), Some("hi"));
        assert_eq!(class.pool.method(0).map(|m| m.name.as_str()), Some("f"));
    }

    #[test]
    fn test_array_dump_and_class_file_pool() {
        let text = r#"[{
            "name": "a.B",
            "format": "jvm",
            "pool": { "entries": [
                { "index": 2, "kind": "int", "value": 7 },
                { "index": 3, "kind": "class", "name": "java/util/List" }
            ] },
            "methods": []
        }, { "name": "a.C" }]"#;
        let dumps = from_json(text).unwrap();
        assert_eq!(dumps.len(), 2);
        let class = dumps.into_iter().next().unwrap().into_class().unwrap();
        assert_eq!(class.pool.constant(2), Some(LoadableConstant::Int(7)));
        assert_eq!(class.pool.type_ref(3), Some(&ArgType::object("java.util.List")));
    }

    #[test]
    fn test_bad_hex_is_reported() {
        let text = r#"{ "name": "a.B", "methods": [
            { "name": "g", "descriptor": "()V", "code": { "registers": 0, "code": "0e0" } } ] }"#;
        let dump = from_json(text).unwrap().remove(0);
        let err = dump.into_class().unwrap_err();
        assert!(format!("{:#}", err).contains("Bad code in a.B.g"));
    }

    #[test]
    fn test_hierarchy_includes_own_class() {
        let dump = from_json(DALVIK_DUMP).unwrap().remove(0);
        let classes = dump.hierarchy_classes();
        assert_eq!(classes.last().map(|c| c.name.as_str()), Some("com.example.Counter"));
    }
}
