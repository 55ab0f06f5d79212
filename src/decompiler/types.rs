/// 型表現
///
/// レジスタ・リテラル・式に付く型と、型推論で使う候補集合。
/// オブジェクト型の名前はドット区切り（java.lang.String）で保持する。

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// リテラルや未確定値が取りうるプリミティブ型の候補
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PrimitiveSet: u16 {
        const BOOLEAN = 1 << 0;
        const BYTE    = 1 << 1;
        const SHORT   = 1 << 2;
        const CHAR    = 1 << 3;
        const INT     = 1 << 4;
        const FLOAT   = 1 << 5;
        const LONG    = 1 << 6;
        const DOUBLE  = 1 << 7;
        const OBJECT  = 1 << 8;
        const ARRAY   = 1 << 9;

        const NARROW_INTEGRAL = Self::BOOLEAN.bits() | Self::BYTE.bits()
            | Self::SHORT.bits() | Self::CHAR.bits() | Self::INT.bits();
        const INTEGRAL = Self::BYTE.bits() | Self::SHORT.bits()
            | Self::CHAR.bits() | Self::INT.bits();
        const WIDE = Self::LONG.bits() | Self::DOUBLE.bits();
        const REFERENCE = Self::OBJECT.bits() | Self::ARRAY.bits();
    }
}

/// 値の型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ArgType {
    /// 未推論
    #[default]
    Unknown,
    Void,
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    /// クラス型（ドット区切りの完全修飾名）
    Object(String),
    /// 配列型
    Array(Box<ArgType>),
    /// 候補集合のまま確定していない型（主にリテラル）
    Narrow(PrimitiveSet),
    /// 単一化に失敗したトップ型
    Conflict,
}

pub const JAVA_LANG_OBJECT: &str = "java.lang.Object";
pub const JAVA_LANG_STRING: &str = "java.lang.String";
pub const JAVA_LANG_CLASS: &str = "java.lang.Class";
pub const JAVA_LANG_THROWABLE: &str = "java.lang.Throwable";

impl ArgType {
    /// 内部名（java/lang/String）またはドット名からクラス型を作る
    pub fn object(name: &str) -> Self {
        ArgType::Object(name.replace('/', "."))
    }

    pub fn array_of(elem: ArgType) -> Self {
        ArgType::Array(Box::new(elem))
    }

    /// 型記述子（I, Ljava/lang/String;, [I ...）を解析する
    pub fn from_descriptor(desc: &str) -> Option<Self> {
        let (ty, rest) = Self::parse_prefix(desc)?;
        if rest.is_empty() {
            Some(ty)
        } else {
            None
        }
    }

    /// メソッド記述子 (IJ)V を引数型と戻り値型に分解する
    pub fn parse_method_descriptor(desc: &str) -> Option<(Vec<ArgType>, ArgType)> {
        let mut rest = desc.strip_prefix('(')?;
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            let (ty, tail) = Self::parse_prefix(rest)?;
            params.push(ty);
            rest = tail;
        }
        let ret = Self::from_descriptor(&rest[1..])?;
        Some((params, ret))
    }

    fn parse_prefix(desc: &str) -> Option<(ArgType, &str)> {
        let first = desc.chars().next()?;
        let rest = &desc[1..];
        let ty = match first {
            'V' => ArgType::Void,
            'Z' => ArgType::Boolean,
            'B' => ArgType::Byte,
            'S' => ArgType::Short,
            'C' => ArgType::Char,
            'I' => ArgType::Int,
            'J' => ArgType::Long,
            'F' => ArgType::Float,
            'D' => ArgType::Double,
            'L' => {
                let end = rest.find(';')?;
                return Some((ArgType::object(&rest[..end]), &rest[end + 1..]));
            }
            '[' => {
                let (elem, tail) = Self::parse_prefix(rest)?;
                return Some((ArgType::array_of(elem), tail));
            }
            _ => return None,
        };
        Some((ty, rest))
    }

    /// 型記述子へ戻す
    pub fn descriptor(&self) -> String {
        match self {
            ArgType::Void => "V".into(),
            ArgType::Boolean => "Z".into(),
            ArgType::Byte => "B".into(),
            ArgType::Short => "S".into(),
            ArgType::Char => "C".into(),
            ArgType::Int => "I".into(),
            ArgType::Long => "J".into(),
            ArgType::Float => "F".into(),
            ArgType::Double => "D".into(),
            ArgType::Object(name) => format!("L{};", name.replace('.', "/")),
            ArgType::Array(elem) => format!("[{}", elem.descriptor()),
            ArgType::Narrow(set) => Self::default_for(*set).descriptor(),
            ArgType::Unknown | ArgType::Conflict => format!("L{};", "java/lang/Object"),
        }
    }

    /// 2レジスタ（2スロット）を占める型か
    pub fn is_wide(&self) -> bool {
        match self {
            ArgType::Long | ArgType::Double => true,
            ArgType::Narrow(set) => !set.is_empty() && PrimitiveSet::WIDE.contains(*set),
            _ => false,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, ArgType::Object(_) | ArgType::Array(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ArgType::Boolean
                | ArgType::Byte
                | ArgType::Short
                | ArgType::Char
                | ArgType::Int
                | ArgType::Long
                | ArgType::Float
                | ArgType::Double
        )
    }

    /// 確定した型か（Unknown / Narrow / Conflict 以外）
    pub fn is_known(&self) -> bool {
        !matches!(
            self,
            ArgType::Unknown | ArgType::Narrow(_) | ArgType::Conflict
        )
    }

    /// 確定型が属する候補フラグ
    pub fn candidate_flag(&self) -> PrimitiveSet {
        match self {
            ArgType::Boolean => PrimitiveSet::BOOLEAN,
            ArgType::Byte => PrimitiveSet::BYTE,
            ArgType::Short => PrimitiveSet::SHORT,
            ArgType::Char => PrimitiveSet::CHAR,
            ArgType::Int => PrimitiveSet::INT,
            ArgType::Long => PrimitiveSet::LONG,
            ArgType::Float => PrimitiveSet::FLOAT,
            ArgType::Double => PrimitiveSet::DOUBLE,
            ArgType::Object(_) => PrimitiveSet::OBJECT,
            ArgType::Array(_) => PrimitiveSet::ARRAY,
            ArgType::Narrow(set) => *set,
            _ => PrimitiveSet::empty(),
        }
    }

    /// 候補が1つだけならその型
    pub fn from_single(set: PrimitiveSet) -> Option<ArgType> {
        if set.bits().count_ones() != 1 {
            return None;
        }
        Some(Self::default_for(set))
    }

    /// 候補集合から既定の型を選ぶ
    pub fn default_for(set: PrimitiveSet) -> ArgType {
        if set.contains(PrimitiveSet::INT) {
            ArgType::Int
        } else if set.contains(PrimitiveSet::BOOLEAN) {
            ArgType::Boolean
        } else if set.contains(PrimitiveSet::LONG) {
            ArgType::Long
        } else if set.contains(PrimitiveSet::FLOAT) {
            ArgType::Float
        } else if set.contains(PrimitiveSet::DOUBLE) {
            ArgType::Double
        } else if set.contains(PrimitiveSet::CHAR) {
            ArgType::Char
        } else if set.contains(PrimitiveSet::SHORT) {
            ArgType::Short
        } else if set.contains(PrimitiveSet::BYTE) {
            ArgType::Byte
        } else {
            ArgType::Object(JAVA_LANG_OBJECT.to_string())
        }
    }

    /// 出力用に確定型へ落とす
    pub fn resolved(&self) -> ArgType {
        match self {
            ArgType::Narrow(set) => Self::default_for(*set),
            ArgType::Unknown | ArgType::Conflict => ArgType::Object(JAVA_LANG_OBJECT.to_string()),
            other => other.clone(),
        }
    }

    /// 配列の要素型
    pub fn element_type(&self) -> Option<&ArgType> {
        match self {
            ArgType::Array(elem) => Some(elem),
            _ => None,
        }
    }

    /// Javaソース上の型名
    pub fn java_name(&self) -> String {
        match self {
            ArgType::Void => "void".into(),
            ArgType::Boolean => "boolean".into(),
            ArgType::Byte => "byte".into(),
            ArgType::Short => "short".into(),
            ArgType::Char => "char".into(),
            ArgType::Int => "int".into(),
            ArgType::Long => "long".into(),
            ArgType::Float => "float".into(),
            ArgType::Double => "double".into(),
            ArgType::Object(name) => short_class_name(name).to_string(),
            ArgType::Array(elem) => format!("{}[]", elem.java_name()),
            ArgType::Narrow(set) => Self::default_for(*set).java_name(),
            ArgType::Unknown | ArgType::Conflict => "Object".into(),
        }
    }
}

/// java.lang 直下のクラスは単純名で表示する
pub fn short_class_name(name: &str) -> &str {
    match name.strip_prefix("java.lang.") {
        Some(simple) if !simple.contains('.') => simple,
        _ => name,
    }
}

/// クラス名の最後の要素（コンストラクタ名用）
pub fn simple_class_name(name: &str) -> &str {
    let tail = name.rsplit('.').next().unwrap_or(name);
    tail.rsplit('$').next().unwrap_or(tail)
}

/// 定数リテラルがとりうる型候補
///
/// 0 は null 参照にもなりうる。ワイド定数は long/double のどちらか。
pub fn literal_candidates(value: i64, wide: bool) -> PrimitiveSet {
    if wide {
        return PrimitiveSet::WIDE;
    }
    let mut set = PrimitiveSet::INT | PrimitiveSet::FLOAT;
    if value == 0 || value == 1 {
        set |= PrimitiveSet::BOOLEAN;
    }
    if value == 0 {
        set |= PrimitiveSet::REFERENCE;
    }
    if i8::try_from(value).is_ok() {
        set |= PrimitiveSet::BYTE;
    }
    if i16::try_from(value).is_ok() {
        set |= PrimitiveSet::SHORT;
    }
    if u16::try_from(value).is_ok() {
        set |= PrimitiveSet::CHAR;
    }
    set
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgType::Unknown => write!(f, "?"),
            ArgType::Conflict => write!(f, "<conflict>"),
            ArgType::Narrow(set) => write!(f, "{:?}", set),
            ArgType::Object(name) => write!(f, "{}", name),
            other => write!(f, "{}", other.java_name()),
        }
    }
}
