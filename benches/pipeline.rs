//! メソッドパイプライン全体（読み込みからコード生成まで）のベンチマーク
//!
//! - 直線的な呼び出しの連鎖（インライン化の負荷）
//! - 分岐とループの多いメソッド（構造化・型推論の負荷）
//! - クラス単位の並列デコンパイル

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dexdec::decompiler::asm::DalvikAssembler;
use dexdec::decompiler::insn::CmpOp;
use dexdec::decompiler::pool::{access, ConstPool, MethodRef, MethodSignature};
use dexdec::decompiler::{
    ClassHierarchy, ClassInput, DecompilerOptions, MethodDecompiler, MethodInput, ParallelDecompiler,
    RawMethod,
};
use std::hint::black_box;
use std::sync::Arc;

/// r0 = f(r0) を n 回繰り返して返す
fn call_chain(pool: &mut ConstPool, n: usize) -> RawMethod {
    let f = pool.add_method(MethodRef::parse("bench.Chain", "f", "(I)I").unwrap());
    let mut asm = DalvikAssembler::new();
    asm.const_int(0, 1);
    for _ in 0..n {
        asm.invoke_static(f, &[0]).move_result(0);
    }
    asm.return_value(0);
    asm.finish().unwrap().into_raw(1)
}

/// n 個の if と外側のループ
fn branchy(pool: &mut ConstPool, n: usize) -> RawMethod {
    let f = pool.add_method(MethodRef::parse("bench.Branchy", "f", "(I)I").unwrap());
    let mut asm = DalvikAssembler::new();
    asm.const_int(0, 0).const_int(2, 0).label("head");
    asm.if_cmp(CmpOp::Ge, 2, 1, "done");
    for i in 0..n {
        let skip = format!("skip{}", i);
        asm.if_zero(CmpOp::Eq, 2, &skip)
            .invoke_static(f, &[0])
            .move_result(0)
            .label(&skip);
    }
    asm.add_int_lit8(2, 2, 1).goto16("head").label("done").return_value(0);
    asm.finish().unwrap().into_raw(3)
}

fn bench_call_chain(c: &mut Criterion) {
    let hierarchy = ClassHierarchy::empty();
    let options = DecompilerOptions::default();
    let sig = MethodSignature::new("bench.Chain", "run", "()I", access::STATIC).unwrap();

    let mut group = c.benchmark_group("pipeline_call_chain");
    for n in [8usize, 64, 256] {
        let mut pool = ConstPool::new();
        let raw = call_chain(&mut pool, n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &raw, |b, raw| {
            b.iter(|| {
                let out = MethodDecompiler::new(&hierarchy, &options).decompile(&sig, Some(black_box(raw)), &pool);
                black_box(out)
            });
        });
    }
    group.finish();
}

fn bench_branchy(c: &mut Criterion) {
    let hierarchy = ClassHierarchy::empty();
    let options = DecompilerOptions::default();
    let sig = MethodSignature::new("bench.Branchy", "run", "(I)I", access::STATIC).unwrap();

    let mut group = c.benchmark_group("pipeline_branchy");
    for n in [4usize, 32, 128] {
        let mut pool = ConstPool::new();
        let raw = branchy(&mut pool, n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &raw, |b, raw| {
            b.iter(|| {
                let out = MethodDecompiler::new(&hierarchy, &options).decompile(&sig, Some(black_box(raw)), &pool);
                black_box(out)
            });
        });
    }
    group.finish();
}

fn bench_class(c: &mut Criterion) {
    let mut pool = ConstPool::new();
    let methods: Vec<MethodInput> = (0..32)
        .map(|i| MethodInput {
            sig: MethodSignature::new("bench.Branchy", &format!("m{}", i), "(I)I", access::STATIC).unwrap(),
            raw: Some(branchy(&mut pool, 16)),
        })
        .collect();
    let class = ClassInput {
        name: "bench.Branchy".into(),
        super_class: None,
        interfaces: Vec::new(),
        access_flags: access::PUBLIC,
        pool: Box::new(pool),
        methods,
    };
    let decompiler = ParallelDecompiler::new(Arc::new(ClassHierarchy::empty()), DecompilerOptions::default());

    let mut group = c.benchmark_group("class_32_methods");
    group.throughput(Throughput::Elements(32));
    group.bench_function("decompile", |b| {
        b.iter(|| black_box(decompiler.decompile_class(black_box(&class)).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, bench_call_chain, bench_branchy, bench_class);
criterion_main!(benches);
