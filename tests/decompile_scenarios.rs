//! メソッド単位・クラス単位のエンドツーエンドのシナリオ

use dexdec::decompiler::asm::DalvikAssembler;
use dexdec::decompiler::cfg::ControlFlowGraph;
use dexdec::decompiler::control_flow::{structure_method, LoopKind, Region};
use dexdec::decompiler::insn::{CmpOp, RegisterArg};
use dexdec::decompiler::loader::{load_method, BytecodeFormat, RawMethod};
use dexdec::decompiler::pool::{access, ClassFilePool, ConstPool, MethodRef, MethodSignature};
use dexdec::decompiler::shrink::shrink_method;
use dexdec::decompiler::{
    ArgType, ClassHierarchy, ClassInput, DecompilerOptions, MethodDecompiler, MethodInput, MethodOutput,
    ParallelDecompiler,
};
use dexdec::error::DiagnosticKind;
use std::sync::Arc;

fn static_sig(name: &str, desc: &str) -> MethodSignature {
    MethodSignature::new("a.B", name, desc, access::STATIC).unwrap()
}

fn assemble(asm: &DalvikAssembler, registers: u16) -> RawMethod {
    asm.finish().unwrap().into_raw(registers)
}

fn run(sig: &MethodSignature, raw: &RawMethod, pool: &ConstPool, options: &DecompilerOptions) -> MethodOutput {
    let hierarchy = ClassHierarchy::empty();
    MethodDecompiler::new(&hierarchy, options).decompile(sig, Some(raw), pool)
}

/// クラスファイルのメソッド本体（定数プールは使わない）
fn run_jvm(sig: &MethodSignature, code: &[u8], max_locals: u16, max_stack: u16) -> MethodOutput {
    let raw = RawMethod {
        format: BytecodeFormat::Jvm,
        registers: max_locals,
        max_stack,
        code: code.to_vec(),
        tries: Vec::new(),
        lines: Vec::new(),
    };
    let hierarchy = ClassHierarchy::empty();
    MethodDecompiler::new(&hierarchy, &DecompilerOptions::default()).decompile(sig, Some(&raw), &ClassFilePool::new())
}

fn has_region(root: &Region, pred: impl Fn(&Region) -> bool) -> bool {
    let mut found = false;
    root.visit(&mut |r| found |= pred(r));
    found
}

/// r0 = 5; r1 = f(r0); return r1
fn scenario_a(pool: &mut ConstPool) -> RawMethod {
    let f = pool.add_method(MethodRef::parse("a.B", "f", "(I)I").unwrap());
    let mut asm = DalvikAssembler::new();
    asm.const_int(0, 5).invoke_static(f, &[0]).move_result(1).return_value(1);
    assemble(&asm, 2)
}

#[test]
fn test_single_use_chain_collapses_into_return() {
    let mut pool = ConstPool::new();
    let raw = scenario_a(&mut pool);
    let out = run(&static_sig("g", "()I"), &raw, &pool, &DecompilerOptions::default());

    assert!(!out.is_fallback(), "{:?}", out.failure);
    assert_eq!(out.output.code, "static int g() {\n    return B.f(5);\n}");
    assert!(out.output.metadata.is_exact());
}

#[test]
fn test_multi_use_register_stays_named() {
    let mut pool = ConstPool::new();
    let a = pool.add_method(MethodRef::parse("a.B", "a", "()I").unwrap());
    let g = pool.add_method(MethodRef::parse("a.B", "g", "(I)I").unwrap());
    let use_ = pool.add_method(MethodRef::parse("a.B", "use", "(I)V").unwrap());

    // r0 = a(); r1 = g(r0); use(r0); use(r1)
    let mut asm = DalvikAssembler::new();
    asm.invoke_static(a, &[])
        .move_result(0)
        .invoke_static(g, &[0])
        .move_result(1)
        .invoke_static(use_, &[0])
        .invoke_static(use_, &[1])
        .return_void();
    let raw = assemble(&asm, 2);
    let out = run(&static_sig("run", "()V"), &raw, &pool, &DecompilerOptions::default());
    let code = &out.output.code;

    assert!(!out.is_fallback(), "{:?}", out.failure);
    assert_eq!(code.matches("B.a()").count(), 1, "{}", code);
    assert_eq!(code.matches("B.g(").count(), 1, "{}", code);
    assert!(!code.contains("B.g(B.a())"), "{}", code);
    // use(r0) は副作用があるので g(r0) はその先へ移動できない
    assert!(!code.contains("B.use(B.g("), "{}", code);
    assert_eq!(code.matches("B.use(").count(), 2, "{}", code);
}

/// if (z) r0 = 1 else r0 = 2; return r0
fn scenario_c() -> RawMethod {
    let mut asm = DalvikAssembler::new();
    asm.if_zero(CmpOp::Eq, 1, "else")
        .const_int(0, 1)
        .goto("end")
        .label("else")
        .const_int(0, 2)
        .label("end")
        .return_value(0);
    assemble(&asm, 2)
}

#[test]
fn test_reconverging_branch_is_structured_as_if() {
    let pool = ConstPool::new();
    let sig = static_sig("pick", "(Z)I");
    let raw = scenario_c();

    let body = load_method(&raw, &sig, &pool).unwrap();
    let cfg = ControlFlowGraph::build(body.insns, &body.tries, body.code_len).unwrap();
    let structured = structure_method(&cfg);
    assert!(!structured.irreducible);
    assert!(!structured.root.has_fallback());
    assert!(has_region(&structured.root, |r| matches!(
        r,
        Region::If { else_region: Some(_), .. }
    )));

    let options = DecompilerOptions {
        fold_ternaries: false,
        ..DecompilerOptions::default()
    };
    let out = run(&sig, &raw, &pool, &options);
    assert!(out.output.code.contains("if ("), "{}", out.output.code);
    assert!(out.output.code.contains("} else {"), "{}", out.output.code);
    assert!(!out.output.code.contains("goto"), "{}", out.output.code);
}

#[test]
fn test_reconverging_assignments_fold_to_ternary() {
    let pool = ConstPool::new();
    let out = run(&static_sig("pick", "(Z)I"), &scenario_c(), &pool, &DecompilerOptions::default());
    assert!(!out.is_fallback(), "{:?}", out.failure);
    assert_eq!(out.stats.ternaries, 1);
    assert!(out.output.code.contains(" ? "), "{}", out.output.code);
    assert!(!out.output.code.contains("if ("), "{}", out.output.code);
}

#[test]
fn test_constructor_with_ternary_argument_folds() {
    let mut pool = ConstPool::new();
    let t = pool.add_type(ArgType::object("a.T"));
    let init = pool.add_method(MethodRef::parse("a.T", "<init>", "(I)V").unwrap());
    // r0 = new T; r1 = z ? 1 : 2; r0.<init>(r1); return r0
    let mut asm = DalvikAssembler::new();
    asm.new_instance(0, t)
        .if_zero(CmpOp::Eq, 2, "two")
        .const_int(1, 1)
        .goto("call")
        .label("two")
        .const_int(1, 2)
        .label("call")
        .invoke_direct(init, &[0, 1])
        .return_object(0);
    let raw = assemble(&asm, 3);

    let out = run(&static_sig("make", "(Z)La/T;"), &raw, &pool, &DecompilerOptions::default());
    let code = &out.output.code;
    assert!(!out.is_fallback(), "{:?}", out.failure);
    assert_eq!(out.stats.constructors, 1);
    assert!(code.contains("(z ? 1 : 2)"), "{}", code);
    assert!(code.contains("return new "), "{}", code);
    assert!(!code.contains("<init>"), "{}", code);
    assert!(!code.contains("()"), "{}", code);
    assert!(!out
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::UnfoldedConstructor));
}

#[test]
fn test_jvm_boolean_parameter_reads_as_boolean() {
    // static int pick(boolean b) { return b ? 1 : 2; }
    // iload_0 ; ifeq 8 ; iconst_1 ; goto 9 ; iconst_2 ; ireturn
    let code = [0x1a, 0x99, 0x00, 0x07, 0x04, 0xa7, 0x00, 0x04, 0x05, 0xac];
    let out = run_jvm(&static_sig("pick", "(Z)I"), &code, 1, 1);
    let text = &out.output.code;
    assert!(!out.is_fallback(), "{:?}", out.failure);
    assert!(text.contains("z ? 1 : 2"), "{}", text);
    assert!(!text.contains("== 0") && !text.contains("!= 0"), "{}", text);
    assert!(!out.diagnostics.iter().any(|d| d.kind == DiagnosticKind::TypeConflict));
}

#[test]
fn test_jvm_boolean_local_keeps_its_type() {
    // static boolean copy(boolean b) { boolean c = b; if (c) return c; return false; }
    // iload_0 ; istore_1 ; iload_1 ; ifeq 8 ; iload_1 ; ireturn ; iconst_0 ; ireturn
    let code = [0x1a, 0x3c, 0x1b, 0x99, 0x00, 0x05, 0x1b, 0xac, 0x03, 0xac];
    let out = run_jvm(&static_sig("copy", "(Z)Z"), &code, 2, 1);
    let text = &out.output.code;
    assert!(!out.is_fallback(), "{:?}", out.failure);
    assert!(text.starts_with("static boolean copy(boolean z) {"), "{}", text);
    assert!(!text.contains("== 0") && !text.contains("!= 0"), "{}", text);
    assert!(!text.contains("int "), "{}", text);
    assert!(!out.diagnostics.iter().any(|d| d.kind == DiagnosticKind::TypeConflict));
}

#[test]
fn test_counting_loop_is_structured() {
    let pool = ConstPool::new();
    // r0 = 0; while (r0 < n) r0++; return r0
    let mut asm = DalvikAssembler::new();
    asm.const_int(0, 0)
        .label("head")
        .if_cmp(CmpOp::Ge, 0, 1, "done")
        .add_int_lit8(0, 0, 1)
        .goto("head")
        .label("done")
        .return_value(0);
    let raw = assemble(&asm, 2);
    let sig = static_sig("count", "(I)I");

    let body = load_method(&raw, &sig, &pool).unwrap();
    let cfg = ControlFlowGraph::build(body.insns, &body.tries, body.code_len).unwrap();
    let structured = structure_method(&cfg);
    assert!(!structured.root.has_fallback());
    assert!(has_region(&structured.root, |r| matches!(
        r,
        Region::Loop { kind: LoopKind::While, .. }
    )));

    let out = run(&sig, &raw, &pool, &DecompilerOptions::default());
    assert!(out.output.code.contains("while ("), "{}", out.output.code);
    assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
}

#[test]
fn test_switch_with_padded_payload_is_structured() {
    let pool = ConstPool::new();
    // 命令列が奇数ユニットで終わるので、ペイロードの前に整列用 nop が入る
    let mut asm = DalvikAssembler::new();
    asm.sparse_switch(1, &[(1, "one"), (10, "ten")])
        .const_int(0, 0)
        .return_value(0)
        .label("one")
        .const_int(0, 1)
        .return_value(0)
        .label("ten")
        .const_int(0, 2)
        .return_value(0);
    let assembled = asm.finish().unwrap();
    assert_eq!(assembled.units[9], 0x0000);
    assert_eq!(assembled.units[10], 0x0200);
    let raw = assembled.into_raw(2);

    let out = run(&static_sig("pick", "(I)I"), &raw, &pool, &DecompilerOptions::default());
    let code = &out.output.code;
    assert!(!out.is_fallback(), "{:?}", out.failure);
    assert!(code.contains("switch (i) {"), "{}", code);
    assert!(code.contains("case 10:"), "{}", code);
    assert!(!code.contains("goto "), "{}", code);
}

#[test]
fn test_irreducible_flow_uses_gotos_without_failing() {
    let mut pool = ConstPool::new();
    let s = pool.add_method(MethodRef::parse("a.B", "s", "()V").unwrap());
    let t = pool.add_method(MethodRef::parse("a.B", "t", "()V").unwrap());
    // 入口から a と b の両方へ入れるループ
    let mut asm = DalvikAssembler::new();
    asm.if_zero(CmpOp::Eq, 0, "b")
        .label("a")
        .invoke_static(s, &[])
        .label("b")
        .invoke_static(t, &[])
        .if_zero(CmpOp::Ne, 0, "a")
        .return_void();
    let raw = assemble(&asm, 1);
    let sig = static_sig("spin", "(I)V");

    let body = load_method(&raw, &sig, &pool).unwrap();
    let cfg = ControlFlowGraph::build(body.insns, &body.tries, body.code_len).unwrap();
    let structured = structure_method(&cfg);
    assert!(structured.irreducible);
    assert!(structured.root.has_fallback());

    let out = run(&sig, &raw, &pool, &DecompilerOptions::default());
    assert!(!out.is_fallback(), "{:?}", out.failure);
    assert!(out.output.code.contains("goto "), "{}", out.output.code);
    assert!(out
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::StructuringFallback));
}

#[test]
fn test_inliner_second_run_changes_nothing() {
    let mut pool = ConstPool::new();
    let raw = scenario_a(&mut pool);
    let sig = static_sig("g", "()I");

    let body = load_method(&raw, &sig, &pool).unwrap();
    let entry: Vec<RegisterArg> = body.params.clone();
    let mut cfg = ControlFlowGraph::build(body.insns, &body.tries, body.code_len).unwrap();
    let first = shrink_method(&mut cfg, &entry, 16).unwrap();
    assert_eq!(first.inlined, 2);
    let snapshot: Vec<_> = cfg.blocks.iter().map(|b| b.insns.clone()).collect();

    let second = shrink_method(&mut cfg, &entry, 16).unwrap();
    assert_eq!(second.inlined, 0);
    let after: Vec<_> = cfg.blocks.iter().map(|b| b.insns.clone()).collect();
    assert_eq!(snapshot, after);
}

#[test]
fn test_broken_method_does_not_stop_siblings() {
    let mut pool = ConstPool::new();
    let good = scenario_a(&mut pool);

    // goto が本体の外へ飛ぶ
    let mut asm = DalvikAssembler::new();
    asm.raw(0x4028).return_void();
    let broken = assemble(&asm, 1);

    let class = ClassInput {
        name: "a.B".into(),
        super_class: Some("java.lang.Object".into()),
        interfaces: Vec::new(),
        access_flags: access::PUBLIC,
        pool: Box::new(pool),
        methods: vec![
            MethodInput {
                sig: MethodSignature::new("a.B", "broken", "()V", access::PUBLIC | access::STATIC).unwrap(),
                raw: Some(broken),
            },
            MethodInput {
                sig: static_sig("g", "()I"),
                raw: Some(good),
            },
        ],
    };

    let decompiler = ParallelDecompiler::new(Arc::new(ClassHierarchy::empty()), DecompilerOptions::default());
    let out = decompiler.decompile_class(&class).unwrap();
    assert_eq!(out.fallback_count(), 1);
    assert!(out.methods[0].failure.is_some());
    assert!(out.methods[1].failure.is_none());
    assert!(out.code.contains("Method decompilation failed"));
    assert!(out.code.contains("        return B.f(5);"));
    assert!(out.metadata.is_exact());
}

#[test]
fn test_many_classes_decompile_in_parallel() {
    let classes: Vec<ClassInput> = (0..8)
        .map(|i| {
            let mut pool = ConstPool::new();
            let raw = scenario_a(&mut pool);
            ClassInput {
                name: format!("a.C{}", i),
                super_class: None,
                interfaces: Vec::new(),
                access_flags: access::PUBLIC | access::FINAL,
                pool: Box::new(pool),
                methods: vec![MethodInput {
                    sig: MethodSignature::new(&format!("a.C{}", i), "g", "()I", access::STATIC).unwrap(),
                    raw: Some(raw),
                }],
            }
        })
        .collect();

    let options = DecompilerOptions {
        threads: Some(2),
        ..DecompilerOptions::default()
    };
    let decompiler = ParallelDecompiler::new(Arc::new(ClassHierarchy::empty()), options);
    let results = decompiler.decompile_classes(&classes);
    assert_eq!(results.len(), 8);
    for (i, result) in results.into_iter().enumerate() {
        let out = result.unwrap();
        assert_eq!(out.name, format!("a.C{}", i));
        assert!(out.code.starts_with(&format!("public final class C{} {{", i)));
        assert_eq!(out.fallback_count(), 0);
    }
}

#[test]
fn test_catch_variable_comes_from_handler() {
    let mut pool = ConstPool::new();
    let risky = pool.add_method(MethodRef::parse("a.B", "risky", "()V").unwrap());
    let log = pool.add_method(MethodRef::parse("a.B", "log", "(Ljava/lang/Throwable;)V").unwrap());
    let mut asm = DalvikAssembler::new();
    asm.label("start")
        .invoke_static(risky, &[])
        .label("end")
        .return_void()
        .label("handler")
        .move_exception(0)
        .invoke_static(log, &[0])
        .return_void();
    asm.try_range("start", "end", &[(Some("java/io/IOException"), "handler")]);
    let raw = assemble(&asm, 1);
    let out = run(&static_sig("guarded", "()V"), &raw, &pool, &DecompilerOptions::default());

    assert!(!out.is_fallback(), "{:?}", out.failure);
    let code = &out.output.code;
    assert!(code.contains("try {"), "{}", code);
    assert!(code.contains("} catch (java.io.IOException e) {"), "{}", code);
    assert!(code.contains("B.log(e);"), "{}", code);
}
