//! Compilation-failure surface: diagnostics are collected across phases,
//! sorted by location, and gate bytecode emission.

use ace::{CompileFailure, DiagnosticCode, Level, MemLoader, Runner};

fn compile_err(src: &str) -> ace::ErrorList {
    let runner = Runner::new();
    let loader = MemLoader::new();
    match runner.compile_source(src, "main.ace", &loader) {
        Ok(_) => panic!("expected a compilation failure"),
        Err(CompileFailure::Diagnostics(errors)) => errors,
        Err(other) => panic!("unexpected failure kind: {other}"),
    }
}

#[test]
fn lex_parse_and_type_errors_accumulate() {
    let errors = compile_err("let x: Int = \"s\"\nlet = 2\nlet y = \"unterminated");
    assert!(errors.iter().any(|d| d.code == DiagnosticCode::MismatchedTypes));
    assert!(errors.iter().any(|d| d.code == DiagnosticCode::UnexpectedToken));
    assert!(errors.iter().any(|d| d.code == DiagnosticCode::UnterminatedString));
}

#[test]
fn diagnostics_are_sorted_by_location() {
    let errors = compile_err("print missing_late\nprint missing_early\nlet bad: Int = \"s\"");
    let lines: Vec<u32> = errors.iter().map(|d| d.loc.line).collect();
    let mut sorted = lines.clone();
    sorted.sort_unstable();
    assert_eq!(lines, sorted);
}

#[test]
fn import_failures_are_diagnostics() {
    let errors = compile_err("import \"does/not/exist.ace\"");
    assert!(errors.iter().any(|d| d.code == DiagnosticCode::ImportNotFound));
}

#[test]
fn warnings_do_not_gate_compilation() {
    let runner = Runner::new();
    let loader = MemLoader::new();
    let output = runner
        .compile_source("use shiny\nlet used = 1\nprint used", "main.ace", &loader)
        .expect("warnings only");
    assert!(
        output
            .diagnostics
            .iter()
            .any(|d| d.level == Level::Warning && d.code == DiagnosticCode::UnknownDirective)
    );
}

#[test]
fn unused_identifiers_warn_in_closed_scopes() {
    let runner = Runner::new();
    let loader = MemLoader::new();
    let output = runner
        .compile_source("func f() { let unused = 1 }\nf()", "main.ace", &loader)
        .expect("warnings only");
    assert!(
        output
            .diagnostics
            .iter()
            .any(|d| d.code == DiagnosticCode::UnusedIdentifier)
    );
}

#[test]
fn container_rejects_foreign_bytes() {
    let runner = Runner::new();
    let mut writer = ace::NoPrint;
    let mut tracer = ace::NoopTracer;
    let result = runner.run_bytecode(b"\x7fELF...", &mut writer, &mut tracer);
    assert!(result.is_err());
}
