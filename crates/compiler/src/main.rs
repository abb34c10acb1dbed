//! Bolt C++ Compiler CLI
//!
//! Thin driver over the library: argument parsing, project-file loading,
//! log initialization. All compilation logic lives in `boltc` the library.

use boltc::{CompileError, CompilerConfig, EmitKind, TargetAbi};
use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "boltc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bolt C++ compiler - compile a C++20 subset to x86-64 object files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmitArg {
    Obj,
    Tokens,
    Ast,
    Ir,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a translation unit to an object file
    Build {
        /// Input C++ source file
        input: PathBuf,

        /// Output path (defaults to the input with .o / .obj extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target ABI and container
        #[arg(long, default_value = "linux-elf")]
        target: String,

        /// Add an include search path (repeatable)
        #[arg(short = 'I', long = "include", value_name = "DIR")]
        include_paths: Vec<PathBuf>,

        /// Predefine a macro, NAME or NAME=VALUE (repeatable)
        #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
        defines: Vec<String>,

        /// Emit debug info (DWARF or CodeView per target)
        #[arg(short = 'g', long)]
        debug: bool,

        /// What to emit
        #[arg(long, value_enum, default_value = "obj")]
        emit: EmitArg,
    },

    /// Preprocess only: dump the expanded token stream
    Preprocess {
        /// Input C++ source file
        input: PathBuf,

        /// Add an include search path (repeatable)
        #[arg(short = 'I', long = "include", value_name = "DIR")]
        include_paths: Vec<PathBuf>,

        /// Predefine a macro (repeatable)
        #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
        defines: Vec<String>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("BOLTC_LOG"))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            output,
            target,
            include_paths,
            defines,
            debug,
            emit,
        } => {
            let Some(target) = TargetAbi::parse(&target) else {
                eprintln!("error: unknown target '{}' (expected linux-elf or windows-coff)", target);
                process::exit(1);
            };
            let config = build_config(&input, target, include_paths, defines, debug);
            let emit = match emit {
                EmitArg::Obj => EmitKind::Object,
                EmitArg::Tokens => EmitKind::Tokens,
                EmitArg::Ast => EmitKind::Ast,
                EmitArg::Ir => EmitKind::Ir,
            };
            if emit == EmitKind::Object {
                let output = output.unwrap_or_else(|| default_output(&input, target));
                if let Err(e) = boltc::compile_file(&input, &output, &config) {
                    report(e);
                }
                return;
            }
            // Textual emits go to stdout.
            let source = match std::fs::read_to_string(&input) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("error: cannot read {}: {}", input.display(), e);
                    process::exit(1);
                }
            };
            match boltc::compile_source(&source, &input, &config, emit) {
                Ok(out) => {
                    for w in &out.warnings {
                        eprintln!("{}", w.message);
                    }
                    print!("{}", String::from_utf8_lossy(&out.bytes));
                }
                Err(e) => report(e),
            }
        }
        Commands::Preprocess {
            input,
            include_paths,
            defines,
        } => {
            let config = build_config(&input, TargetAbi::LinuxElf, include_paths, defines, false);
            let source = match std::fs::read_to_string(&input) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("error: cannot read {}: {}", input.display(), e);
                    process::exit(1);
                }
            };
            match boltc::compile_source(&source, &input, &config, EmitKind::Tokens) {
                Ok(out) => print!("{}", String::from_utf8_lossy(&out.bytes)),
                Err(e) => report(e),
            }
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "boltc", &mut io::stdout());
        }
    }
}

fn build_config(
    input: &Path,
    target: TargetAbi,
    include_paths: Vec<PathBuf>,
    defines: Vec<String>,
    debug: bool,
) -> CompilerConfig {
    let mut config = CompilerConfig::new().with_target(target);
    // Project-file defaults sit under CLI flags.
    let project = input
        .parent()
        .map(|d| d.join("bolt.toml"))
        .unwrap_or_else(|| PathBuf::from("bolt.toml"));
    match CompilerConfig::load_project_file(&project) {
        Ok(Some(file)) => config.apply_project_file(&file),
        Ok(None) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
    for p in include_paths {
        config.include_paths.push(p);
    }
    for d in defines {
        match d.split_once('=') {
            Some((n, v)) => config.defines.push((n.to_string(), Some(v.to_string()))),
            None => config.defines.push((d, None)),
        }
    }
    config.debug_info = debug;
    config
}

fn default_output(input: &Path, target: TargetAbi) -> PathBuf {
    let ext = match target {
        TargetAbi::LinuxElf => "o",
        TargetAbi::WindowsCoff => "obj",
    };
    input.with_extension(ext)
}

fn report(e: CompileError) -> ! {
    eprint!("{}", e.rendered);
    process::exit(e.exit_code);
}
