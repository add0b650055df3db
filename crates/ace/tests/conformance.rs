//! End-to-end conformance: each program compiles, runs on a fresh VM, and
//! must produce the exact print output and exit code.

use ace::{CollectPrint, MemLoader, NoopTracer, Runner};
use pretty_assertions::assert_eq;

/// Compiles and runs a program, returning (exit code, print output).
fn run_program(src: &str) -> (i32, String) {
    run_with_loader(src, &MemLoader::new())
}

fn run_with_loader(src: &str, loader: &MemLoader) -> (i32, String) {
    let runner = Runner::new();
    let output = match runner.compile_source(src, "main.ace", loader) {
        Ok(output) => output,
        Err(failure) => panic!("compilation failed:\n{failure}"),
    };
    let mut writer = CollectPrint::new();
    let mut tracer = NoopTracer;
    let exit = runner
        .run_bytecode(&output.bytecode, &mut writer, &mut tracer)
        .expect("container loads");
    (exit, writer.into_output())
}

fn expect_output(src: &str, expected: &str) {
    let (exit, output) = run_program(src);
    assert_eq!(output, expected, "program output mismatch");
    assert_eq!(exit, 0, "program exit code");
}

#[test]
fn arithmetic_and_locals() {
    expect_output("let x = 3; let y = 4; print x * x + y * y", "25\n");
}

#[test]
fn closures_capture_a_local() {
    expect_output(
        "func make(n) { func inner() { return n + 1 } return inner } print make(41)()",
        "42\n",
    );
}

#[test]
fn try_catch_with_thrown_string() {
    expect_output("try { throw \"oops\" } catch { print \"caught\" }", "caught\n");
}

#[test]
fn array_for_each_lowering() {
    expect_output("let a = [1, 2, 3, 4]\nlet s = 0\nfor x in a { s = s + x }\nprint s", "10\n");
}

#[test]
fn generic_function_instantiation() {
    expect_output(
        "func id<T>(x: T) -> T { return x }\nprint id<Int>(7) + id<Int>(5)",
        "12\n",
    );
}

#[test]
fn division_by_nonconstant_zero_is_a_runtime_exception() {
    expect_output("let z = 0; try { print 10 / z } catch { print \"div0\" }", "div0\n");
}

// ================================================================
// Beyond the six core scenarios
// ================================================================

#[test]
fn while_loop_with_break_and_continue() {
    expect_output(
        "let i = 0\nlet total = 0\nwhile true { i = i + 1\nif i > 5 { break }\nif i == 3 { continue }\ntotal = total + i }\nprint total",
        "12\n",
    );
}

#[test]
fn recursive_function() {
    expect_output(
        "func fib(n: Int) -> Int { if n < 2 { return n } return fib(n - 1) + fib(n - 2) }\nprint fib(10)",
        "55\n",
    );
}

#[test]
fn closure_mutation_is_shared() {
    expect_output(
        "let count = 0\nfunc bump() { count = count + 1 }\nbump()\nbump()\nbump()\nprint count",
        "3\n",
    );
}

#[test]
fn object_members_and_defaults() {
    expect_output(
        "type Point { x: Float = 1.5, y: Float = 2.5 }\nlet p = new Point\np.x = 4.0\nprint p.x + p.y",
        "6.5\n",
    );
}

#[test]
fn string_concatenation() {
    expect_output("print \"foo\" + \"bar\"", "foobar\n");
    expect_output("let a = \"foo\"\nlet b = \"bar\"\nprint a + b", "foobar\n");
}

#[test]
fn array_index_assignment() {
    expect_output("let a = [1, 2, 3]\na[1] = 20\nprint a[0] + a[1] + a[2]", "24\n");
}

#[test]
fn exception_unwinds_through_calls() {
    expect_output(
        "func boom() { throw \"kaboom\" }\ntry { boom() }\ncatch (e) { print e }",
        "kaboom\n",
    );
}

#[test]
fn nested_try_catches_innermost_first() {
    expect_output(
        "try { try { throw \"inner\" } catch { print \"first\" }\nprint \"after\" } catch { print \"second\" }",
        "first\nafter\n",
    );
}

#[test]
fn generator_drives_the_for_loop() {
    expect_output(
        "func gen() { yield 1\nyield 2\nyield 3 }\nlet s = 0\nfor v in gen { s = s + v }\nprint s",
        "6\n",
    );
}

#[test]
fn natives_are_first_class() {
    expect_output("print length([1, 2, 3])", "3\n");
    expect_output("print length(\"hello\")", "5\n");
    expect_output("print fmt(\"x={} y={}\", 1, 2)", "x=1 y=2\n");
    expect_output("print to_string(42) + \"!\"", "42!\n");
}

#[test]
fn gc_collects_loop_garbage() {
    // Each iteration allocates an unreachable array; the default threshold
    // is crossed many times, so completion proves collection works.
    expect_output(
        "let i = 0\nwhile i < 200 { let _scratch = [i, i, i]\ni = i + 1 }\nprint i",
        "200\n",
    );
}

#[test]
fn heap_overflow_is_catchable() {
    expect_output(
        "let keep = []\ntry { let i = 0\nwhile i < 5000 { array_push(keep, [i])\ni = i + 1 }\nprint \"unreached\" } catch { print \"overflow\" }",
        "overflow\n",
    );
}

#[test]
fn unhandled_exception_exits_nonzero() {
    let (exit, output) = run_program("print \"before\"\nthrow \"fatal\"\nprint \"after\"");
    assert_eq!(output, "before\n");
    assert_eq!(exit, 1);
}

#[test]
fn imports_are_deduplicated() {
    let mut loader = MemLoader::new();
    loader.insert("lib.ace", "let shared = 7");
    let (exit, output) = run_with_loader("import \"lib.ace\"\nimport \"lib.ace\"\nprint shared", &loader);
    assert_eq!(output, "7\n");
    assert_eq!(exit, 0);
}

#[test]
fn module_imports_resolve_members() {
    let mut loader = MemLoader::new();
    loader.insert("math.ace", "module Math\nfunc square(x: Int) -> Int { return x * x }");
    let (exit, output) = run_with_loader("import \"math.ace\"\nprint Math.square(6)", &loader);
    assert_eq!(output, "36\n");
    assert_eq!(exit, 0);
}

#[test]
fn typeof_reports_the_static_type() {
    expect_output("let x = 1.5\nprint typeof x", "Float\n");
}

#[test]
fn has_expression_on_known_types() {
    expect_output(
        "type Point { x: Float = 0.0 }\nlet p = new Point\nprint p has x, p has nothere",
        "truefalse\n",
    );
}

#[test]
fn variadic_parameters_collect_extras() {
    expect_output(
        "func total(...values: Int) -> Int { let s = 0\nfor v in values { s = s + v }\nreturn s }\nprint total(1, 2, 3, 4)",
        "10\n",
    );
}

#[test]
fn default_parameters_fill_missing_arguments() {
    expect_output(
        "func scale(x: Int, factor: Int = 10) -> Int { return x * factor }\nprint scale(4) + scale(4, 2)",
        "48\n",
    );
}

// ================================================================
// Property-style sweeps
// ================================================================

/// Compile-time folding of `a op b` agrees with the runtime result for
/// every binary arithmetic and bitwise operator.
#[test]
fn constant_folding_agrees_with_runtime() {
    let pairs = [(7i64, 3i64), (10, 4), (-9, 2), (100, 7), (13, 13)];
    let ops = ["+", "-", "*", "/", "%", "&", "|", "^", "<<", ">>"];
    for (a, b) in pairs {
        for op in ops {
            // Literal operands fold at compile time; `let` bindings do not,
            // so the second program computes at runtime.
            let folded = format!("print ({a}) {op} ({b})");
            let runtime = format!("let a = {a}\nlet b = {b}\nprint a {op} b");
            let (_, folded_out) = run_program(&folded);
            let (_, runtime_out) = run_program(&runtime);
            assert_eq!(folded_out, runtime_out, "folding mismatch for {a} {op} {b}");
        }
    }
}

/// Generic instantiation agrees across argument types.
#[test]
fn generic_identity_round_trips_values() {
    let cases = [
        ("Int", "7", "7"),
        ("Float", "2.5", "2.5"),
        ("String", "\"s\"", "s"),
        ("Boolean", "true", "true"),
    ];
    for (ty, value, expected) in cases {
        let src = format!("func id<T>(x: T) -> T {{ return x }}\nprint id<{ty}>({value})");
        let (exit, output) = run_program(&src);
        assert_eq!(output, format!("{expected}\n"), "identity over {ty}");
        assert_eq!(exit, 0);
    }
}

/// Every emitted jump target is an instruction boundary in the code
/// section, and every function static addresses one.
#[test]
fn jump_targets_are_instruction_boundaries() {
    use ace::bytecode::{self, Opcode, Operand};
    use ace::emit::{FunctionFlags, StaticObject};

    let programs = [
        "let x = 3; let y = 4; print x * x + y * y",
        "func make(n) { func inner() { return n + 1 } return inner } print make(41)()",
        "try { throw \"oops\" } catch { print \"caught\" }",
        "let a = [1, 2, 3, 4]\nlet s = 0\nfor x in a { s = s + x }\nprint s",
        "func id<T>(x: T) -> T { return x }\nprint id<Int>(7) + id<Int>(5)",
        "let i = 0\nwhile i < 10 { if i == 5 { break }\ni = i + 1 }\nprint i",
    ];
    for src in programs {
        let runner = Runner::new();
        let loader = MemLoader::new();
        let output = runner.compile_source(src, "main.ace", &loader).expect("compiles");
        let program = bytecode::decode(&output.bytecode).expect("container decodes");

        // Walk the code section collecting instruction boundaries and jump
        // targets.
        let mut boundaries = std::collections::HashSet::new();
        let mut targets = Vec::new();
        let mut pc = 0usize;
        while pc < program.code.len() {
            boundaries.insert(pc);
            let opcode = Opcode::try_from(program.code[pc]).expect("valid opcode");
            let mut operand_at = pc + 1;
            for operand in opcode.operands() {
                if *operand == Operand::Target {
                    let raw = &program.code[operand_at..operand_at + 4];
                    targets.push(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize);
                }
                operand_at += operand.size();
            }
            pc += opcode.encoded_size();
        }
        for target in targets {
            assert!(boundaries.contains(&target), "jump target {target} in {src:?}");
        }
        for entry in &program.statics {
            match entry {
                StaticObject::Function(f) if !f.flags.contains(FunctionFlags::NATIVE) => {
                    assert!(boundaries.contains(&(f.addr as usize)), "function address {}", f.addr);
                }
                StaticObject::Label { position } => {
                    assert!(boundaries.contains(&(*position as usize)), "label position {position}");
                }
                _ => {}
            }
        }
    }
}
