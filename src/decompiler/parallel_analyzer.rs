/// 並列クラスデコンパイル
/// クラス内のメソッドを独立した単位としてワーカープールで処理する
///
/// メソッド同士は状態を共有しない。共有するのは読み取り専用の入力と
/// クラス階層（DashMap キャッシュ）だけ。キャンセルはメソッドの開始前に確認する。
/// 1つのメソッドの失敗はそのメソッドの生ダンプになり、クラス全体は出力を続ける。

use crate::decompiler::codegen::class_header;
use crate::decompiler::hierarchy::ClassHierarchy;
use crate::decompiler::loader::RawMethod;
use crate::decompiler::options::DecompilerOptions;
use crate::decompiler::pipeline::{MethodDecompiler, MethodOutput, MethodStats};
use crate::decompiler::pool::{MethodSignature, RefResolver};
use crate::decompiler::printer::{CodeAnnotation, CodeMetadata, CodeWriter, DeclKind};
use crate::error::{DecompileError, Diagnostic, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// デコンパイル対象のメソッド
#[derive(Debug, Clone)]
pub struct MethodInput {
    pub sig: MethodSignature,
    /// None は本体なし（abstract / native）
    pub raw: Option<RawMethod>,
}

/// デコンパイル対象のクラス
pub struct ClassInput {
    /// ドット区切りの完全修飾名
    pub name: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub access_flags: u32,
    pub pool: Box<dyn RefResolver>,
    pub methods: Vec<MethodInput>,
}

impl std::fmt::Debug for ClassInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassInput")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// メソッドごとの結果の要約（メタデータ出力用）
#[derive(Debug, Clone, Serialize)]
pub struct MethodSummary {
    pub key: String,
    /// クラス出力内の範囲 [start, end)
    pub start: usize,
    pub end: usize,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub stats: MethodStats,
}

/// クラス1つ分の出力
#[derive(Debug, Clone, Serialize)]
pub struct ClassOutput {
    pub name: String,
    pub code: String,
    pub metadata: CodeMetadata,
    pub methods: Vec<MethodSummary>,
}

impl ClassOutput {
    /// 生ダンプに落ちたメソッドの数
    pub fn fallback_count(&self) -> usize {
        self.methods.iter().filter(|m| m.failure.is_some()).count()
    }
}

/// 並列デコンパイラ
pub struct ParallelDecompiler {
    hierarchy: Arc<ClassHierarchy>,
    options: DecompilerOptions,
    cancel: Arc<AtomicBool>,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl ParallelDecompiler {
    pub fn new(hierarchy: Arc<ClassHierarchy>, options: DecompilerOptions) -> Self {
        #[cfg(feature = "parallel")]
        let pool = options.threads.and_then(|n| {
            match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("Failed to build worker pool with {} threads: {}", n, e);
                    None
                }
            }
        });
        #[cfg(not(feature = "parallel"))]
        if options.threads.is_some() {
            warn!("Built without the parallel feature; methods run sequentially");
        }

        Self {
            hierarchy,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "parallel")]
            pool,
        }
    }

    pub fn options(&self) -> &DecompilerOptions {
        &self.options
    }

    /// ジョブ全体のキャンセルフラグ（別スレッドから立てる）
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// メソッド1つ（キャンセル済みなら None）
    fn run_method(&self, class: &ClassInput, method: &MethodInput) -> Option<MethodOutput> {
        if self.is_cancelled() {
            return None;
        }
        let decompiler = MethodDecompiler::new(&self.hierarchy, &self.options).with_base_indent(1);
        Some(decompiler.decompile(&method.sig, method.raw.as_ref(), class.pool.as_ref()))
    }

    #[cfg(feature = "parallel")]
    fn run_methods(&self, class: &ClassInput) -> Vec<Option<MethodOutput>> {
        use rayon::prelude::*;

        let work = || -> Vec<Option<MethodOutput>> {
            class
                .methods
                .par_iter()
                .map(|m| self.run_method(class, m))
                .collect()
        };
        match &self.pool {
            Some(pool) => pool.install(work),
            None => work(),
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn run_methods(&self, class: &ClassInput) -> Vec<Option<MethodOutput>> {
        class.methods.iter().map(|m| self.run_method(class, m)).collect()
    }

    /// クラスをデコンパイルする
    pub fn decompile_class(&self, class: &ClassInput) -> Result<ClassOutput> {
        if self.is_cancelled() {
            return Err(DecompileError::Cancelled);
        }
        debug!("Decompiling class {} ({} methods)", class.name, class.methods.len());

        let outputs = self.run_methods(class);
        let outputs: Vec<MethodOutput> = match outputs.into_iter().collect::<Option<Vec<_>>>() {
            Some(outputs) => outputs,
            None => {
                info!("Decompilation of {} cancelled", class.name);
                return Err(DecompileError::Cancelled);
            }
        };

        let output = self.assemble(class, outputs);
        info!(
            "Decompiled class {}: {} methods, {} fallbacks",
            class.name,
            output.methods.len(),
            output.fallback_count()
        );
        Ok(output)
    }

    /// 複数クラス（クラス単位でも並列）
    #[cfg(feature = "parallel")]
    pub fn decompile_classes(&self, classes: &[ClassInput]) -> Vec<Result<ClassOutput>> {
        use rayon::prelude::*;

        let work = || -> Vec<Result<ClassOutput>> {
            classes.par_iter().map(|c| self.decompile_class(c)).collect()
        };
        match &self.pool {
            Some(pool) => pool.install(work),
            None => work(),
        }
    }

    #[cfg(not(feature = "parallel"))]
    pub fn decompile_classes(&self, classes: &[ClassInput]) -> Vec<Result<ClassOutput>> {
        classes.iter().map(|c| self.decompile_class(c)).collect()
    }

    /// クラス見出しとメソッド出力をつなぐ
    fn assemble(&self, class: &ClassInput, outputs: Vec<MethodOutput>) -> ClassOutput {
        let mut w = CodeWriter::new(self.options.indent);
        w.start_line();
        let header = class_header(
            &class.name,
            class.super_class.as_deref(),
            &class.interfaces,
            class.access_flags,
        );
        let simple = crate::decompiler::types::simple_class_name(&class.name).to_string();
        match header.find(&format!(" {} ", simple)) {
            Some(at) => {
                let name_start = at + 1;
                w.add(&header[..name_start]);
                w.add_annotated(
                    &simple,
                    CodeAnnotation::Declaration {
                        kind: DeclKind::Class,
                        name: class.name.clone(),
                    },
                );
                w.add(&header[name_start + simple.len()..]);
            }
            None => {
                w.add(&header);
            }
        }
        let head = w.finish();

        let mut code = head.code;
        let mut metadata = head.metadata;
        let mut methods = Vec::with_capacity(outputs.len());
        for (i, m) in outputs.into_iter().enumerate() {
            code.push('\n');
            if i > 0 {
                code.push('\n');
            }
            let base = code.len();
            let line_base = code.matches('\n').count();
            metadata.append(m.output.metadata, base, line_base);
            code.push_str(&m.output.code);
            methods.push(MethodSummary {
                key: m.key,
                start: base,
                end: code.len(),
                diagnostics: m.diagnostics,
                failure: m.failure,
                stats: m.stats,
            });
        }
        code.push_str("\n}");

        ClassOutput {
            name: class.name.clone(),
            code,
            metadata,
            methods,
        }
    }
}
