/// dexdec - Dalvik / JVM バイトコードデコンパイラ（デバッグ用 CLI）
///
/// Usage:
///   dexdec decompile classes.json
///   dexdec -v decompile classes.json -o Out.java --metadata out.json
///   dexdec disasm classes.json --method onCreate
///   dexdec config > dexdec.json

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dexdec::decompiler::class_dump::{self, ClassDump};
use dexdec::decompiler::loader::disassemble;
use dexdec::decompiler::{ClassHierarchy, ClassInput, ClassOutput, DecompilerOptions, ParallelDecompiler};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "dexdec")]
#[command(about = "Decompile Dalvik and JVM bytecode class dumps into Java-like source", long_about = None)]
struct Cli {
    /// Options file (JSON); CLI flags override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More log output (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompile every class in a dump
    Decompile {
        /// Class dump (JSON object or array)
        input: PathBuf,

        /// Write source here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Write code metadata (JSON) here
        #[arg(short, long, value_name = "FILE")]
        metadata: Option<PathBuf>,

        /// Worker threads
        #[arg(short, long)]
        threads: Option<usize>,

        /// Append instruction offsets as comments
        #[arg(long)]
        emit_offsets: bool,

        /// Keep if/else assignments instead of folding to ?:
        #[arg(long)]
        no_ternary: bool,

        /// Omit the disassembly from failed methods
        #[arg(long)]
        no_raw_fallback: bool,
    },

    /// Print the disassembly of each method
    Disasm {
        /// Class dump (JSON object or array)
        input: PathBuf,

        /// Only methods with this name
        #[arg(long, value_name = "NAME")]
        method: Option<String>,
    },

    /// Print the effective options as JSON
    Config,
}

fn log_level(cli: &Cli) -> Level {
    if let Some(name) = &cli.log_level {
        if let Ok(level) = Level::from_str(name) {
            return level;
        }
    }
    match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn load_options(path: Option<&Path>) -> Result<DecompilerOptions> {
    let Some(path) = path else {
        return Ok(DecompilerOptions::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read options {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid options {}", path.display()))
}

/// ダンプを読み、階層情報とデコンパイラ入力に分ける
fn load_classes(input: &Path) -> Result<(ClassHierarchy, Vec<ClassInput>)> {
    let dumps = class_dump::load(input)?;
    let infos: Vec<_> = dumps.iter().flat_map(ClassDump::hierarchy_classes).collect();
    let hierarchy = ClassHierarchy::from_classes(infos);
    let classes = dumps
        .into_iter()
        .map(ClassDump::into_class)
        .collect::<Result<Vec<_>>>()?;
    info!("Loaded {} classes from {}", classes.len(), input.display());
    Ok((hierarchy, classes))
}

fn decompile(input: &Path, options: DecompilerOptions) -> Result<Vec<ClassOutput>> {
    let (hierarchy, classes) = load_classes(input)?;
    let decompiler = ParallelDecompiler::new(Arc::new(hierarchy), options);

    let mut outputs = Vec::with_capacity(classes.len());
    for (class, result) in classes.iter().zip(decompiler.decompile_classes(&classes)) {
        let output = result.with_context(|| format!("Failed to decompile {}", class.name))?;
        for m in &output.methods {
            for d in &m.diagnostics {
                warn!("{}.{}: {}", output.name, m.key, d);
            }
            if let Some(reason) = &m.failure {
                error!("{}.{} fell back to raw dump: {}", output.name, m.key, reason);
            }
        }
        outputs.push(output);
    }
    Ok(outputs)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(log_level(&cli))
        .with_writer(std::io::stderr)
        .init();

    let mut options = load_options(cli.config.as_deref())?;

    match cli.command {
        Commands::Decompile {
            input,
            output,
            metadata,
            threads,
            emit_offsets,
            no_ternary,
            no_raw_fallback,
        } => {
            if threads.is_some() {
                options.threads = threads;
            }
            options.emit_offsets |= emit_offsets;
            if no_ternary {
                options.fold_ternaries = false;
            }
            if no_raw_fallback {
                options.raw_fallback = false;
            }

            let outputs = decompile(&input, options)?;
            let source = outputs
                .iter()
                .map(|o| o.code.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");

            match &output {
                Some(path) => {
                    std::fs::write(path, format!("{}\n", source))
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Wrote source to {}", path.display());
                }
                None => println!("{}", source),
            }

            if let Some(path) = &metadata {
                let json = serde_json::to_string_pretty(&outputs).context("Failed to serialize metadata")?;
                std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
                info!("Wrote metadata to {}", path.display());
            }

            let fallbacks: usize = outputs.iter().map(|o| o.fallback_count()).sum();
            info!("Done: {} classes, {} methods fell back", outputs.len(), fallbacks);
        }

        Commands::Disasm { input, method } => {
            let (_, classes) = load_classes(&input)?;
            for class in &classes {
                for m in &class.methods {
                    if method.as_deref().is_some_and(|name| name != m.sig.name) {
                        continue;
                    }
                    let Some(raw) = &m.raw else {
                        continue;
                    };
                    println!("{}.{}{}:", class.name, m.sig.name, m.sig.descriptor());
                    for line in disassemble(raw, &m.sig, class.pool.as_ref()) {
                        println!("    {}", line);
                    }
                    println!();
                }
            }
        }

        Commands::Config => {
            let json = serde_json::to_string_pretty(&options).context("Failed to serialize options")?;
            println!("{}", json);
        }
    }

    Ok(())
}
