/// クラス階層の参照
///
/// 型推論が参照型の共通上位型を求めるために使う。
/// 実際のクラス情報は外部の TypeResolver が供給し、問い合わせ結果は
/// DashMap に一度だけ格納して以降はロックなしで読む。

use crate::decompiler::types::{JAVA_LANG_OBJECT, JAVA_LANG_THROWABLE};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// クラス情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    /// ドット区切りの完全修飾名
    pub name: String,
    /// None は java.lang.Object 直下
    #[serde(default)]
    pub super_class: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl ClassInfo {
    pub fn new(name: &str, super_class: Option<&str>) -> Self {
        Self {
            name: name.replace('/', "."),
            super_class: super_class.map(|s| s.replace('/', ".")),
            interfaces: Vec::new(),
        }
    }

    pub fn with_interfaces(mut self, interfaces: &[&str]) -> Self {
        self.interfaces = interfaces.iter().map(|i| i.replace('/', ".")).collect();
        self
    }
}

/// クラス名からクラス情報を引く外部インタフェース
pub trait TypeResolver: Send + Sync {
    fn resolve_type(&self, name: &str) -> Option<ClassInfo>;
}

impl<F> TypeResolver for F
where
    F: Fn(&str) -> Option<ClassInfo> + Send + Sync,
{
    fn resolve_type(&self, name: &str) -> Option<ClassInfo> {
        self(name)
    }
}

/// 固定のクラス表
struct StaticClasses(HashMap<String, ClassInfo>);

impl TypeResolver for StaticClasses {
    fn resolve_type(&self, name: &str) -> Option<ClassInfo> {
        self.0.get(name).cloned()
    }
}

/// よく使う java.lang の階層
fn builtin_class(name: &str) -> Option<ClassInfo> {
    let (super_class, interfaces): (&str, &[&str]) = match name {
        "java.lang.String" => (
            JAVA_LANG_OBJECT,
            &["java.lang.CharSequence", "java.lang.Comparable", "java.io.Serializable"],
        ),
        "java.lang.StringBuilder" => (JAVA_LANG_OBJECT, &["java.lang.CharSequence"]),
        JAVA_LANG_THROWABLE => (JAVA_LANG_OBJECT, &["java.io.Serializable"]),
        "java.lang.Exception" | "java.lang.Error" => (JAVA_LANG_THROWABLE, &[]),
        "java.lang.RuntimeException" | "java.io.IOException" => ("java.lang.Exception", &[]),
        "java.lang.IllegalArgumentException"
        | "java.lang.IllegalStateException"
        | "java.lang.NullPointerException"
        | "java.lang.ClassCastException"
        | "java.lang.ArithmeticException"
        | "java.lang.IndexOutOfBoundsException" => ("java.lang.RuntimeException", &[]),
        "java.lang.Integer" | "java.lang.Long" | "java.lang.Float" | "java.lang.Double"
        | "java.lang.Short" | "java.lang.Byte" => ("java.lang.Number", &["java.lang.Comparable"]),
        "java.lang.Number" => (JAVA_LANG_OBJECT, &["java.io.Serializable"]),
        "java.lang.Boolean" | "java.lang.Character" => {
            (JAVA_LANG_OBJECT, &["java.lang.Comparable", "java.io.Serializable"])
        }
        _ => return None,
    };
    Some(ClassInfo::new(name, Some(super_class)).with_interfaces(interfaces))
}

/// クラス階層（遅延読み込みキャッシュ付き）
pub struct ClassHierarchy {
    source: Box<dyn TypeResolver>,
    cache: DashMap<String, Option<Arc<ClassInfo>>>,
}

impl std::fmt::Debug for ClassHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassHierarchy")
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl ClassHierarchy {
    pub fn new(source: impl TypeResolver + 'static) -> Self {
        Self {
            source: Box::new(source),
            cache: DashMap::new(),
        }
    }

    /// クラス情報の一覧から作成
    pub fn from_classes(classes: impl IntoIterator<Item = ClassInfo>) -> Self {
        let table = classes.into_iter().map(|c| (c.name.clone(), c)).collect();
        Self::new(StaticClasses(table))
    }

    /// 組み込みの java.lang 階層だけを知る
    pub fn empty() -> Self {
        Self::from_classes(Vec::new())
    }

    /// クラス情報を引く（結果はキャッシュ）
    pub fn resolve(&self, name: &str) -> Option<Arc<ClassInfo>> {
        if let Some(hit) = self.cache.get(name) {
            return hit.value().clone();
        }
        self.cache
            .entry(name.to_string())
            .or_insert_with(|| {
                let found = self
                    .source
                    .resolve_type(name)
                    .or_else(|| builtin_class(name))
                    .map(Arc::new);
                if found.is_none() {
                    debug!("Class not found in hierarchy: {}", name);
                }
                found
            })
            .value()
            .clone()
    }

    /// 自身を含む上位型を近い順に列挙。途中で解決できないクラスがあれば完全でない
    fn ancestors(&self, name: &str) -> (Vec<String>, bool) {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        let mut complete = true;
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            order.push(current.clone());
            if current == JAVA_LANG_OBJECT {
                continue;
            }
            match self.resolve(&current) {
                Some(info) => {
                    queue.push_back(
                        info.super_class
                            .clone()
                            .unwrap_or_else(|| JAVA_LANG_OBJECT.to_string()),
                    );
                    queue.extend(info.interfaces.iter().cloned());
                }
                None => complete = false,
            }
        }
        if complete && !seen.contains(JAVA_LANG_OBJECT) {
            order.push(JAVA_LANG_OBJECT.to_string());
        }
        (order, complete)
    }

    /// sub が sup の部分型か
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        if sub == sup || sup == JAVA_LANG_OBJECT {
            return true;
        }
        self.ancestors(sub).0.iter().any(|a| a == sup)
    }

    /// 最も近い共通上位型（見つからなければ None）
    pub fn common_supertype(&self, a: &str, b: &str) -> Option<String> {
        if self.is_subtype(a, b) {
            return Some(b.to_string());
        }
        if self.is_subtype(b, a) {
            return Some(a.to_string());
        }
        let (left, _) = self.ancestors(a);
        let (right, _) = self.ancestors(b);
        let right: HashSet<&String> = right.iter().collect();
        left.into_iter().find(|c| right.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> ClassHierarchy {
        ClassHierarchy::from_classes(vec![
            ClassInfo::new("com/example/Animal", None),
            ClassInfo::new("com/example/Dog", Some("com/example/Animal")),
            ClassInfo::new("com/example/Cat", Some("com/example/Animal"))
                .with_interfaces(&["com/example/Pet"]),
        ])
    }

    #[test]
    fn test_common_supertype_of_siblings() {
        let h = sample();
        assert_eq!(
            h.common_supertype("com.example.Dog", "com.example.Cat"),
            Some("com.example.Animal".to_string())
        );
        assert!(h.is_subtype("com.example.Cat", "com.example.Pet"));
        assert!(!h.is_subtype("com.example.Dog", "com.example.Pet"));
    }

    #[test]
    fn test_resolved_chains_meet_at_object() {
        let h = sample();
        assert_eq!(
            h.common_supertype("com.example.Dog", "java.lang.String"),
            Some(JAVA_LANG_OBJECT.to_string())
        );
        assert_eq!(
            h.common_supertype("java.io.IOException", "java.lang.IllegalStateException"),
            Some("java.lang.Exception".to_string())
        );
    }

    #[test]
    fn test_unresolved_classes_have_no_common_type() {
        let h = sample();
        assert_eq!(h.common_supertype("com.other.A", "com.other.B"), None);
        assert_eq!(
            h.common_supertype("com.other.A", "com.other.A"),
            Some("com.other.A".to_string())
        );
    }

    #[test]
    fn test_resolution_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let h = ClassHierarchy::new(move |name: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            (name == "a.B").then(|| ClassInfo::new("a.B", None))
        });
        assert!(h.resolve("a.B").is_some());
        assert!(h.resolve("a.B").is_some());
        assert!(h.resolve("a.C").is_none());
        assert!(h.resolve("a.C").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
