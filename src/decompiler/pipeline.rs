/// メソッド単位のデコンパイルパイプライン
///
/// 読み込み → CFG → コンストラクタ畳み込み → 型推論 → 構造化
/// → インライン化 → 三項演算子 → インライン化 → コード生成 の順に
/// 1つのメソッドを処理する。各段は前段の結果だけを使い、途中で中断しない。
/// 解析エラー・内部不整合はこのメソッドだけの失敗として生ダンプに落とす。

use crate::decompiler::cfg::ControlFlowGraph;
use crate::decompiler::codegen::{
    generate_declaration, generate_fallback, generate_method, CodegenOptions, MethodContext,
};
use crate::decompiler::construct::fold_constructors;
use crate::decompiler::control_flow::structure_method;
use crate::decompiler::dataflow::DefUseChain;
use crate::decompiler::hierarchy::ClassHierarchy;
use crate::decompiler::insn::RegisterArg;
use crate::decompiler::loader::{disassemble, load_method, RawMethod};
use crate::decompiler::options::DecompilerOptions;
use crate::decompiler::pool::{MethodSignature, RefResolver};
use crate::decompiler::printer::CodeOutput;
use crate::decompiler::shrink::shrink_method;
use crate::decompiler::ternary::fold_ternaries;
use crate::decompiler::type_inference::TypeInference;
use crate::decompiler::types::ArgType;
use crate::error::{DecompileError, Diagnostic, Result};
use serde::Serialize;
use tracing::{debug, error, warn};

/// メソッド1つ分の統計
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodStats {
    pub insns: usize,
    pub blocks: usize,
    pub variables: usize,
    pub constructors: usize,
    pub inlined: usize,
    pub inline_passes: usize,
    pub ternaries: usize,
    pub type_iterations: usize,
}

/// メソッド1つ分の出力
#[derive(Debug, Clone)]
pub struct MethodOutput {
    /// name + 記述子
    pub key: String,
    pub output: CodeOutput,
    pub diagnostics: Vec<Diagnostic>,
    /// 生ダンプに落ちた理由
    pub failure: Option<String>,
    pub stats: MethodStats,
}

impl MethodOutput {
    pub fn is_fallback(&self) -> bool {
        self.failure.is_some()
    }
}

/// メソッドデコンパイラ
pub struct MethodDecompiler<'a> {
    hierarchy: &'a ClassHierarchy,
    options: &'a DecompilerOptions,
    /// 出力の先頭インデント段数
    base_indent: usize,
}

impl<'a> MethodDecompiler<'a> {
    pub fn new(hierarchy: &'a ClassHierarchy, options: &'a DecompilerOptions) -> Self {
        Self {
            hierarchy,
            options,
            base_indent: 0,
        }
    }

    pub fn with_base_indent(mut self, base_indent: usize) -> Self {
        self.base_indent = base_indent;
        self
    }

    fn codegen_options(&self) -> CodegenOptions {
        CodegenOptions {
            indent: self.options.indent,
            emit_offsets: self.options.emit_offsets,
            base_indent: self.base_indent,
        }
    }

    /// メソッドをデコンパイルする。失敗したら生ダンプで返す
    pub fn decompile(
        &self,
        sig: &MethodSignature,
        raw: Option<&RawMethod>,
        pool: &dyn RefResolver,
    ) -> MethodOutput {
        let key = format!("{}{}", sig.name, sig.descriptor());
        let Some(raw) = raw else {
            return MethodOutput {
                key,
                output: generate_declaration(sig, &self.codegen_options()),
                diagnostics: Vec::new(),
                failure: None,
                stats: MethodStats::default(),
            };
        };

        match self.try_decompile(sig, raw, pool) {
            Ok(output) => output,
            Err(e) => {
                if e.is_inconsistency() {
                    error!("Internal inconsistency in {}.{}: {}", sig.class, key, e);
                } else {
                    warn!("Failed to decompile {}.{}: {}", sig.class, key, e);
                }
                let reason = e.to_string();
                let listing = if self.options.raw_fallback {
                    disassemble(raw, sig, pool)
                } else {
                    Vec::new()
                };
                MethodOutput {
                    key,
                    output: generate_fallback(sig, &reason, &listing, &self.codegen_options()),
                    diagnostics: Vec::new(),
                    failure: Some(reason),
                    stats: MethodStats::default(),
                }
            }
        }
    }

    /// パイプラインを実行する（失敗はそのまま返す）
    pub fn try_decompile(
        &self,
        sig: &MethodSignature,
        raw: &RawMethod,
        pool: &dyn RefResolver,
    ) -> Result<MethodOutput> {
        let key = format!("{}{}", sig.name, sig.descriptor());
        let body = load_method(raw, sig, pool).map_err(DecompileError::from)?;

        let mut entry_defs = Vec::with_capacity(body.params.len() + 1);
        if let Some(reg) = body.this_reg {
            entry_defs.push(RegisterArg::typed(reg, ArgType::object(&sig.class)));
        }
        entry_defs.extend(body.params.iter().cloned());
        let entry_types: Vec<ArgType> = entry_defs.iter().map(|r| r.ty.clone()).collect();

        let mut stats = MethodStats {
            insns: body.insns.len(),
            ..MethodStats::default()
        };
        let mut cfg = ControlFlowGraph::build(body.insns, &body.tries, body.code_len)?;
        stats.blocks = cfg.block_count();

        if self.options.fold_constructors {
            let chain = DefUseChain::build(&cfg, &entry_defs);
            stats.constructors = fold_constructors(&mut cfg, &chain);
        }

        let chain = DefUseChain::build(&cfg, &entry_defs);
        let types = TypeInference::new(self.hierarchy, self.options.max_type_iterations).run(
            &mut cfg,
            &chain,
            &entry_types,
            &sig.ret,
        );
        stats.variables = types.var_types.len();
        stats.type_iterations = types.iterations;

        let mut structured = structure_method(&cfg);

        let mut shrink = shrink_method(&mut cfg, &entry_defs, self.options.max_inline_passes)?;
        if self.options.fold_ternaries {
            stats.ternaries = fold_ternaries(&mut cfg, &mut structured.root);
            if stats.ternaries > 0 {
                let again = shrink_method(&mut cfg, &entry_defs, self.options.max_inline_passes)?;
                shrink.passes += again.passes;
                shrink.inlined += again.inlined;
                shrink.diagnostics.extend(again.diagnostics);
            }
        }
        // 三項演算子で合流した <init> の引数はここで初めて1ブロックにそろう
        if self.options.fold_constructors {
            let chain = DefUseChain::build(&cfg, &entry_defs);
            let late = fold_constructors(&mut cfg, &chain);
            if late > 0 {
                stats.constructors += late;
                let again = shrink_method(&mut cfg, &entry_defs, self.options.max_inline_passes)?;
                shrink.passes += again.passes;
                shrink.inlined += again.inlined;
                shrink.diagnostics.extend(again.diagnostics);
            }
        }
        stats.inlined = shrink.inlined;
        stats.inline_passes = shrink.passes;

        let ctx = MethodContext::new(sig, &types);
        let (output, emitted) = generate_method(&cfg, &structured, &ctx, &self.codegen_options());

        let mut diagnostics = types.diagnostics.clone();
        diagnostics.extend(structured.diagnostics);
        diagnostics.extend(shrink.diagnostics);
        diagnostics.extend(emitted);

        debug!(
            "Decompiled {}.{}: {} blocks, {} vars, {} inlined, {} diagnostics",
            sig.class,
            key,
            stats.blocks,
            stats.variables,
            stats.inlined,
            diagnostics.len()
        );
        Ok(MethodOutput {
            key,
            output,
            diagnostics,
            failure: None,
            stats,
        })
    }
}
