/// デコンパイラのデモプログラム
/// アセンブラで組んだ小さなクラスをデコンパイルして、ソースとメタデータを表示する

use anyhow::Result;
use dexdec::decompiler::asm::DalvikAssembler;
use dexdec::decompiler::insn::CmpOp;
use dexdec::decompiler::pool::{access, ConstPool, FieldRef, MethodRef, MethodSignature};
use dexdec::decompiler::printer::CodeAnnotation;
use dexdec::decompiler::types::ArgType;
use dexdec::decompiler::{ClassHierarchy, ClassInfo, ClassInput, DecompilerOptions, MethodInput, ParallelDecompiler};
use std::sync::Arc;

const CLASS: &str = "demo.Counter";

fn signature(name: &str, desc: &str, flags: u32) -> Result<MethodSignature> {
    MethodSignature::new(CLASS, name, desc, flags).ok_or_else(|| anyhow::anyhow!("bad descriptor {}", desc))
}

fn method_ref(class: &str, name: &str, desc: &str) -> Result<MethodRef> {
    MethodRef::parse(class, name, desc).ok_or_else(|| anyhow::anyhow!("bad descriptor {}", desc))
}

fn build_class() -> Result<ClassInput> {
    let mut pool = ConstPool::new();
    let count = pool.add_field(FieldRef {
        class: CLASS.into(),
        name: "count".into(),
        ty: ArgType::Int,
    });
    let object_init = pool.add_method(method_ref("java.lang.Object", "<init>", "()V")?);
    let print = pool.add_method(method_ref(CLASS, "print", "(Ljava/lang/String;)V")?);
    let greeting = pool.add_string("tick");

    let mut methods = Vec::new();

    // <init>: super(); this.count = 0;
    let mut asm = DalvikAssembler::new();
    asm.invoke_direct(object_init, &[1])
        .const_int(0, 0)
        .iput(0, 1, count)
        .return_void();
    methods.push(MethodInput {
        sig: signature("<init>", "()V", access::PUBLIC)?,
        raw: Some(asm.finish()?.into_raw(2)),
    });

    // tick(n): for i < n { print("tick"); count++ } return count
    let mut asm = DalvikAssembler::new();
    asm.line(10)
        .const_int(0, 0)
        .label("head")
        .if_cmp(CmpOp::Ge, 0, 3, "done")
        .line(11)
        .const_string(1, greeting)
        .invoke_static(print, &[1])
        .line(12)
        .iget(1, 2, count)
        .add_int_lit8(1, 1, 1)
        .iput(1, 2, count)
        .add_int_lit8(0, 0, 1)
        .goto("head")
        .label("done")
        .line(14)
        .iget(0, 2, count)
        .return_value(0);
    methods.push(MethodInput {
        sig: signature("tick", "(I)I", access::PUBLIC)?,
        raw: Some(asm.finish()?.into_raw(4)),
    });

    // pick(z): z ? 1 : 2
    let mut asm = DalvikAssembler::new();
    asm.if_zero(CmpOp::Eq, 1, "else")
        .const_int(0, 1)
        .goto("end")
        .label("else")
        .const_int(0, 2)
        .label("end")
        .return_value(0);
    methods.push(MethodInput {
        sig: signature("pick", "(Z)I", access::STATIC)?,
        raw: Some(asm.finish()?.into_raw(2)),
    });

    // broken: goto が本体の外へ飛ぶ
    let mut asm = DalvikAssembler::new();
    asm.raw(0x4028).return_void();
    methods.push(MethodInput {
        sig: signature("broken", "()V", access::PRIVATE)?,
        raw: Some(asm.finish()?.into_raw(1)),
    });

    methods.push(MethodInput {
        sig: signature("print", "(Ljava/lang/String;)V", access::STATIC | access::NATIVE)?,
        raw: None,
    });

    Ok(ClassInput {
        name: CLASS.into(),
        super_class: Some("java.lang.Object".into()),
        interfaces: vec!["java.lang.Runnable".into()],
        access_flags: access::PUBLIC,
        pool: Box::new(pool),
        methods,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    println!("🦀 dexdec - Decompiler Demo");
    println!("{}", "=".repeat(60));

    let class = build_class()?;
    let hierarchy = ClassHierarchy::from_classes([
        ClassInfo::new(CLASS, Some("java.lang.Object")).with_interfaces(&["java.lang.Runnable"]),
    ]);
    let decompiler = ParallelDecompiler::new(Arc::new(hierarchy), DecompilerOptions::default());

    println!("\n📂 Class: {} ({} methods)", class.name, class.methods.len());
    let output = decompiler.decompile_class(&class)?;

    println!("\n📝 Source:");
    println!("{}", "-".repeat(60));
    println!("{}", output.code);
    println!("{}", "-".repeat(60));

    println!("\n📊 Methods:");
    for m in &output.methods {
        let status = match &m.failure {
            Some(reason) => format!("❌ {}", reason),
            None => "✅".to_string(),
        };
        println!(
            "   {:<40} {:>3} insns {:>2} blocks {:>2} inlined  {}",
            m.key, m.stats.insns, m.stats.blocks, m.stats.inlined, status
        );
        for d in &m.diagnostics {
            println!("      ⚠️  {}", d);
        }
    }

    let metadata = &output.metadata;
    let declarations = metadata
        .entries
        .iter()
        .filter(|e| matches!(e.annotation, CodeAnnotation::Declaration { .. }))
        .count();
    println!("\n🗺️  Metadata:");
    println!("   Entries: {} ({} declarations)", metadata.entries.len(), declarations);
    println!("   Source lines mapped: {}", metadata.lines.len());
    println!("   Exact: {}", metadata.is_exact());

    Ok(())
}
