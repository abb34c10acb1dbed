//! Bolt C++ Compiler Library
//!
//! Ahead-of-time compilation of a C++20 subset to relocatable x86-64
//! object files (ELF on Linux, COFF on Windows). The pipeline per
//! translation unit is strictly linear:
//!
//! source bytes → tokens (`lexer`) → preprocessed tokens (`pp`) → AST
//! (`parser`, with the template registry as a side table) → IR (`lower`,
//! triggering lazy template instantiation depth-first) → machine code
//! (`codegen`) → object bytes (`obj`).
//!
//! Template instantiation is a feedback loop inside the front half: when a
//! dependent type or value is needed, the registry re-instantiates stored
//! bodies against a substitution map, which may recurse.
//!
//! # Extending
//!
//! The driver threads one [`CompilerConfig`] value through every pass;
//! there are no global registries. The only process-global is the
//! diagnostics location seqlock in [`diag`], kept so a signal handler can
//! read a coherent source position.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod consteval;
pub mod diag;
pub mod ir;
pub mod lexer;
pub mod lower;
pub mod mangle;
pub mod obj;
pub mod parser;
pub mod pp;
pub mod strings;
pub mod templates;
pub mod types;

pub use config::{CompilerConfig, TargetAbi};
pub use diag::{Diagnostic, DiagnosticEngine, Severity, SourceLoc};
pub use lexer::Lexer;
pub use parser::Parser;
pub use pp::Preprocessor;
pub use strings::{StrId, StringTable};
pub use templates::TemplateRegistry;
pub use types::TypeRegistry;

use std::fmt;
use std::path::Path;

/// A failed compilation: rendered diagnostics plus the process exit code
/// (1 for user errors, 2 for internal invariant failures).
#[derive(Debug)]
pub struct CompileError {
    pub rendered: String,
    pub exit_code: i32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rendered)
    }
}

impl std::error::Error for CompileError {}

/// What the driver asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitKind {
    #[default]
    Object,
    Tokens,
    Ast,
    Ir,
}

/// Successful compilation artifacts.
#[derive(Debug)]
pub struct CompileOutput {
    /// Object bytes for `EmitKind::Object`; textual dump otherwise.
    pub bytes: Vec<u8>,
    pub warnings: Vec<Diagnostic>,
}

/// Compile one translation unit from a file to an object file on disk.
pub fn compile_file(
    input: &Path,
    output: &Path,
    config: &CompilerConfig,
) -> Result<(), CompileError> {
    let source = std::fs::read_to_string(input).map_err(|e| CompileError {
        rendered: format!("cannot read {}: {}", input.display(), e),
        exit_code: 1,
    })?;
    let artifacts = compile_source(&source, input, config, EmitKind::Object)?;
    std::fs::write(output, &artifacts.bytes).map_err(|e| CompileError {
        rendered: format!("cannot write {}: {}", output.display(), e),
        exit_code: 1,
    })?;
    Ok(())
}

/// Compile source text. `source_path` names the translation unit for
/// diagnostics and quoted-include resolution.
pub fn compile_source(
    source: &str,
    source_path: &Path,
    config: &CompilerConfig,
    emit: EmitKind,
) -> Result<CompileOutput, CompileError> {
    let mut strings = StringTable::new();
    let mut engine = DiagnosticEngine::new();
    let file = strings.intern(&source_path.display().to_string());

    // Lex.
    tracing::debug!(target: "lexer", "lexing {}", source_path.display());
    let raw_tokens = Lexer::new(source, file)
        .lex()
        .map_err(|d| fail(&strings, &mut engine, d))?;

    // Preprocess.
    tracing::debug!(target: "pp", "preprocessing {} tokens", raw_tokens.len());
    let mut pp = Preprocessor::new(config, &mut strings);
    let tokens = pp
        .preprocess(raw_tokens, source_path, &mut strings)
        .map_err(|d| fail(&strings, &mut engine, d))?;
    let warnings = std::mem::take(&mut pp.warnings);

    if emit == EmitKind::Tokens {
        let mut out = String::new();
        for t in &tokens {
            out.push_str(&format!("{:?}\t{}\n", t.kind, t.text));
        }
        return Ok(CompileOutput {
            bytes: out.into_bytes(),
            warnings,
        });
    }

    // Parse (with per-declaration recovery; all diagnostics surface).
    tracing::debug!(target: "parser", "parsing {} tokens", tokens.len());
    let parsed = Parser::new(tokens, &mut strings).parse();
    for d in &parsed.diags {
        engine.report(d.clone());
    }
    if engine.has_errors() {
        return Err(render_failure(&strings, engine));
    }

    if emit == EmitKind::Ast {
        let out = format!("{:#?}\n", parsed.arena.get(parsed.root));
        return Ok(CompileOutput {
            bytes: out.into_bytes(),
            warnings,
        });
    }

    // Lower to IR (instantiates templates on demand, runs static_asserts
    // and the constant evaluator).
    tracing::debug!(target: "lower", "lowering");
    let mut arena = parsed.arena;
    let mut registry = parsed.registry;
    registry.set_depth_limit(config.template_depth_limit);
    let mut types = TypeRegistry::new(config.target == TargetAbi::LinuxElf);
    let lowered = lower::Lowerer::new(
        &mut arena,
        &mut strings,
        &mut types,
        &mut registry,
        config,
    )
    .lower_translation_unit(parsed.root);
    for d in &lowered.diags {
        engine.report(d.clone());
    }
    if engine.has_errors() {
        return Err(render_failure(&strings, engine));
    }

    if emit == EmitKind::Ir {
        let mut out = String::new();
        for f in &lowered.functions {
            out.push_str(&format!(
                "function {} ({} instrs)\n",
                strings.resolve(f.display_name),
                f.instrs.len()
            ));
            for i in &f.instrs {
                out.push_str(&format!("  {:?} {:?}\n", i.op, i.payload));
            }
        }
        return Ok(CompileOutput {
            bytes: out.into_bytes(),
            warnings,
        });
    }

    // Generate machine code.
    tracing::debug!(target: "codegen", "generating code for {} functions", lowered.functions.len());
    let mut generator = codegen::CodeGenerator::new(&types, &mut strings, config.target);
    let module = match generator.generate(&lowered) {
        Ok(m) => m,
        Err(d) => return Err(fail(&strings, &mut engine, d)),
    };

    // Write the object container.
    tracing::debug!(target: "obj", "writing object ({} bytes of text)", module.text.len());
    let builder = obj::ObjectBuilder::build(
        &module,
        &lowered,
        &mut strings,
        config.target,
        config.debug_info,
    );
    let bytes = builder.write(config.target);

    Ok(CompileOutput { bytes, warnings })
}

fn fail(strings: &StringTable, engine: &mut DiagnosticEngine, d: Diagnostic) -> CompileError {
    engine.report(d);
    render_failure(strings, std::mem::take(engine))
}

fn render_failure(strings: &StringTable, engine: DiagnosticEngine) -> CompileError {
    CompileError {
        rendered: engine.render_all(strings),
        exit_code: engine.exit_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> CompileOutput {
        compile_source(
            src,
            Path::new("test.cpp"),
            &CompilerConfig::default(),
            EmitKind::Object,
        )
        .expect("compiles")
    }

    #[test]
    fn test_end_to_end_object() {
        let out = compile_ok("int main() { return 0; }");
        assert_eq!(&out.bytes[0..4], b"\x7fELF");
    }

    #[test]
    fn test_integer_promotion_scenario() {
        // char + char promotes to int; the static_assert proves 90.
        let out = compile_ok(
            "constexpr int f() { char a = 50; char b = 40; return (int)(a + b); }\n\
             static_assert(f() == 90);\n\
             int main() { return f(); }",
        );
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn test_template_partial_ordering_scenario() {
        let out = compile_ok(
            "template<typename T> struct S { static const int v = 0; };\n\
             template<typename T> struct S<T*> { static const int v = 1; };\n\
             int main() { S<int*> s; return 0; }",
        );
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn test_constexpr_new_delete_scenario() {
        let out = compile_ok(
            "constexpr int f() { int* p = new int(42); int r = *p; delete p; return r; }\n\
             static_assert(f() == 42);\n\
             int main() { return 0; }",
        );
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn test_virtual_dispatch_scenario() {
        let out = compile_ok(
            "struct Base {\n\
               virtual int getValue() { return 10; }\n\
               virtual ~Base() {}\n\
             };\n\
             struct Derived : public Base {\n\
               int getValue() override { return 30; }\n\
             };\n\
             int main() {\n\
               Derived d;\n\
               Base* p = &d;\n\
               return p->getValue();\n\
             }",
        );
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn test_windows_target_end_to_end() {
        let config = CompilerConfig::default().with_target(TargetAbi::WindowsCoff);
        let out = compile_source(
            "int main() { return 0; }",
            Path::new("test.cpp"),
            &config,
            EmitKind::Object,
        )
        .expect("compiles");
        assert_eq!(u16::from_le_bytes([out.bytes[0], out.bytes[1]]), 0x8664);
    }

    #[test]
    fn test_syntax_error_exits_1() {
        let err = compile_source(
            "int f( { return; }",
            Path::new("test.cpp"),
            &CompilerConfig::default(),
            EmitKind::Object,
        )
        .unwrap_err();
        assert_eq!(err.exit_code, 1);
        assert!(!err.rendered.is_empty());
    }

    #[test]
    fn test_static_assert_failure_exits_1() {
        let err = compile_source(
            "static_assert(false, \"doom\");",
            Path::new("test.cpp"),
            &CompilerConfig::default(),
            EmitKind::Object,
        )
        .unwrap_err();
        assert_eq!(err.exit_code, 1);
        assert!(err.rendered.contains("doom"));
    }

    #[test]
    fn test_emit_tokens_and_ir() {
        let toks = compile_source(
            "#define N 2\nint x = N;",
            Path::new("test.cpp"),
            &CompilerConfig::default(),
            EmitKind::Tokens,
        )
        .unwrap();
        let text = String::from_utf8(toks.bytes).unwrap();
        assert!(text.contains("Int"));

        let ir = compile_source(
            "int f() { return 1 + 2; }",
            Path::new("test.cpp"),
            &CompilerConfig::default(),
            EmitKind::Ir,
        )
        .unwrap();
        let text = String::from_utf8(ir.bytes).unwrap();
        assert!(text.contains("function f"));
    }

    #[test]
    fn test_preprocessor_warning_surfaces() {
        let out = compile_source(
            "#warning deprecated header\nint main() { return 0; }",
            Path::new("test.cpp"),
            &CompilerConfig::default(),
            EmitKind::Object,
        )
        .unwrap();
        assert_eq!(out.warnings.len(), 1);
    }
}
