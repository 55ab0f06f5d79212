/// Dalvik / JVM バイトコードデコンパイラのコア
///
/// 段階1: 命令ローダー（Dalvik・クラスファイル → 共通IR）
/// 段階2: CFG 構築と構造化（支配木・ループ・switch・try）
/// 段階3: レジスタのインライン化と型推論
/// 段階4: Java 風ソースとメタデータの生成

pub mod insn;
pub mod types;
pub mod pool;
pub mod dalvik;
pub mod jvm;
pub mod loader;
pub mod cfg;
pub mod dominance;
pub mod control_flow;
pub mod bitset;
pub mod dataflow;
pub mod shrink;
pub mod hierarchy;
pub mod type_inference;
pub mod construct;
pub mod ternary;
pub mod printer;
pub mod codegen;
pub mod options;
pub mod pipeline;
pub mod parallel_analyzer;
pub mod class_dump;
pub mod asm;

pub use insn::{Insn, InsnArg, InsnKind, Offset, RegisterArg};
pub use types::ArgType;
pub use pool::{ClassFilePool, ConstPool, MethodRef, MethodSignature, RefResolver};
pub use loader::{BytecodeFormat, RawMethod};
pub use cfg::ControlFlowGraph;
pub use hierarchy::{ClassHierarchy, ClassInfo, TypeResolver};
pub use printer::{CodeMetadata, CodeOutput};
pub use options::DecompilerOptions;
pub use pipeline::{MethodDecompiler, MethodOutput};
pub use parallel_analyzer::{ClassInput, ClassOutput, MethodInput, ParallelDecompiler};
pub use asm::DalvikAssembler;
