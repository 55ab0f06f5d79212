/// 定数プール参照の解決
///
/// ローダーは命令のインデックスオペランドを RefResolver 経由で
/// 文字列・型・フィールド・メソッド・ロード可能定数へ解決する。
/// Dalvik 形式は種類ごとの表、クラスファイル形式は単一の番号空間を持つ。

use crate::decompiler::types::ArgType;
use indexmap::IndexMap;
use std::fmt;

/// フィールド参照
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    /// 宣言クラス（ドット区切り）
    pub class: String,
    pub name: String,
    pub ty: ArgType,
}

/// メソッド参照
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub class: String,
    pub name: String,
    pub params: Vec<ArgType>,
    pub ret: ArgType,
}

impl MethodRef {
    /// 記述子からメソッド参照を作る
    pub fn parse(class: &str, name: &str, descriptor: &str) -> Option<Self> {
        let (params, ret) = ArgType::parse_method_descriptor(descriptor)?;
        Some(Self {
            class: class.replace('/', "."),
            name: name.to_string(),
            params,
            ret,
        })
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    /// 引数が占めるレジスタ数（ワイド型は2つ）
    pub fn arg_register_count(&self, is_static: bool) -> usize {
        let receiver = if is_static { 0 } else { 1 };
        receiver
            + self
                .params
                .iter()
                .map(|p| if p.is_wide() { 2 } else { 1 })
                .sum::<usize>()
    }

    pub fn descriptor(&self) -> String {
        let params: String = self.params.iter().map(|p| p.descriptor()).collect();
        format!("({}){}", params, self.ret.descriptor())
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor())
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class, self.name, self.ty.descriptor())
    }
}

/// アクセスフラグ（クラスファイル / dex 共通のビット）
pub mod access {
    pub const PUBLIC: u32 = 0x0001;
    pub const PRIVATE: u32 = 0x0002;
    pub const PROTECTED: u32 = 0x0004;
    pub const STATIC: u32 = 0x0008;
    pub const FINAL: u32 = 0x0010;
    pub const SYNCHRONIZED: u32 = 0x0020;
    pub const NATIVE: u32 = 0x0100;
    pub const INTERFACE: u32 = 0x0200;
    pub const ABSTRACT: u32 = 0x0400;
}

/// デコンパイル対象メソッドのシグネチャ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub class: String,
    pub name: String,
    pub params: Vec<ArgType>,
    pub ret: ArgType,
    pub access_flags: u32,
}

impl MethodSignature {
    pub fn new(class: &str, name: &str, descriptor: &str, access_flags: u32) -> Option<Self> {
        let (params, ret) = ArgType::parse_method_descriptor(descriptor)?;
        Some(Self {
            class: class.replace('/', "."),
            name: name.to_string(),
            params,
            ret,
            access_flags,
        })
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_class_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    /// 受け取り側を含めた入力レジスタ数
    pub fn ins_size(&self) -> usize {
        let receiver = if self.is_static() { 0 } else { 1 };
        receiver
            + self
                .params
                .iter()
                .map(|p| if p.is_wide() { 2 } else { 1 })
                .sum::<usize>()
    }

    pub fn descriptor(&self) -> String {
        let params: String = self.params.iter().map(|p| p.descriptor()).collect();
        format!("({}){}", params, self.ret.descriptor())
    }
}

/// ldc 系命令で読み込める定数
#[derive(Debug, Clone, PartialEq)]
pub enum LoadableConstant {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(ArgType),
}

/// 定数プール参照を解決するインタフェース
pub trait RefResolver: Send + Sync {
    fn string(&self, index: u32) -> Option<&str>;
    fn type_ref(&self, index: u32) -> Option<&ArgType>;
    fn field(&self, index: u32) -> Option<&FieldRef>;
    fn method(&self, index: u32) -> Option<&MethodRef>;

    /// ldc 定数（クラスファイル形式のみ）
    fn constant(&self, _index: u32) -> Option<LoadableConstant> {
        None
    }
}

/// Dalvik 形式の定数プール（種類ごとの表）
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    pub strings: Vec<String>,
    pub types: Vec<ArgType>,
    pub fields: Vec<FieldRef>,
    pub methods: Vec<MethodRef>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_string(&mut self, s: &str) -> u32 {
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    pub fn add_type(&mut self, ty: ArgType) -> u32 {
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }

    pub fn add_field(&mut self, field: FieldRef) -> u32 {
        self.fields.push(field);
        (self.fields.len() - 1) as u32
    }

    pub fn add_method(&mut self, method: MethodRef) -> u32 {
        self.methods.push(method);
        (self.methods.len() - 1) as u32
    }
}

impl RefResolver for ConstPool {
    fn string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(|s| s.as_str())
    }

    fn type_ref(&self, index: u32) -> Option<&ArgType> {
        self.types.get(index as usize)
    }

    fn field(&self, index: u32) -> Option<&FieldRef> {
        self.fields.get(index as usize)
    }

    fn method(&self, index: u32) -> Option<&MethodRef> {
        self.methods.get(index as usize)
    }
}

/// クラスファイル定数プールのエントリ
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    Class(ArgType),
    String(String),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Field(FieldRef),
    Method(MethodRef),
}

/// クラスファイル形式の定数プール（単一の番号空間）
#[derive(Debug, Clone, Default)]
pub struct ClassFilePool {
    entries: IndexMap<u32, PoolEntry>,
}

impl ClassFilePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: u32, entry: PoolEntry) {
        self.entries.insert(index, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RefResolver for ClassFilePool {
    fn string(&self, index: u32) -> Option<&str> {
        match self.entries.get(&index)? {
            PoolEntry::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn type_ref(&self, index: u32) -> Option<&ArgType> {
        match self.entries.get(&index)? {
            PoolEntry::Class(ty) => Some(ty),
            _ => None,
        }
    }

    fn field(&self, index: u32) -> Option<&FieldRef> {
        match self.entries.get(&index)? {
            PoolEntry::Field(f) => Some(f),
            _ => None,
        }
    }

    fn method(&self, index: u32) -> Option<&MethodRef> {
        match self.entries.get(&index)? {
            PoolEntry::Method(m) => Some(m),
            _ => None,
        }
    }

    fn constant(&self, index: u32) -> Option<LoadableConstant> {
        match self.entries.get(&index)? {
            PoolEntry::Int(v) => Some(LoadableConstant::Int(*v)),
            PoolEntry::Float(v) => Some(LoadableConstant::Float(*v)),
            PoolEntry::Long(v) => Some(LoadableConstant::Long(*v)),
            PoolEntry::Double(v) => Some(LoadableConstant::Double(*v)),
            PoolEntry::String(s) => Some(LoadableConstant::String(s.clone())),
            PoolEntry::Class(ty) => Some(LoadableConstant::Class(ty.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_ref_register_count() {
        let m = MethodRef::parse("java/lang/Math", "max", "(JJ)J").unwrap();
        assert_eq!(m.class, "java.lang.Math");
        assert_eq!(m.arg_register_count(true), 4);
        assert_eq!(m.arg_register_count(false), 5);
        assert_eq!(m.descriptor(), "(JJ)J");
    }

    #[test]
    fn test_class_file_pool_kinds() {
        let mut pool = ClassFilePool::new();
        pool.insert(1, PoolEntry::String("hello".into()));
        pool.insert(2, PoolEntry::Int(42));

        assert_eq!(pool.string(1), Some("hello"));
        assert_eq!(pool.string(2), None);
        assert_eq!(pool.constant(2), Some(LoadableConstant::Int(42)));
        assert!(pool.method(1).is_none());
    }

    #[test]
    fn test_signature_ins_size() {
        let sig = MethodSignature::new("Foo", "f", "(IJLjava/lang/String;)V", 0).unwrap();
        assert!(!sig.is_static());
        assert_eq!(sig.ins_size(), 5);
    }
}
