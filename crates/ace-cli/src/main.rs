use std::{env, fs, process::ExitCode};

use ace::{CompileFailure, NoopTracer, OsLoader, Runner, StdPrint};

const USAGE: &str = "usage:
  ace build <file> [-o <out>]   compile a source file to a .abc container
  ace run <file>                run a source file or a compiled container
  ace check <file> [--json]     report diagnostics without emitting";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let (command, rest) = match args.split_first() {
        Some((command, rest)) => (command.as_str(), rest),
        None => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };
    match command {
        "build" => build(rest),
        "run" => run(rest),
        "check" => check(rest),
        other => {
            eprintln!("unknown command '{other}'\n{USAGE}");
            ExitCode::FAILURE
        }
    }
}

fn build(args: &[String]) -> ExitCode {
    let Some(input) = args.first() else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let output = match args.iter().position(|a| a == "-o") {
        Some(i) => match args.get(i + 1) {
            Some(path) => path.clone(),
            None => {
                eprintln!("-o requires a path");
                return ExitCode::FAILURE;
            }
        },
        None => {
            let mut path = std::path::PathBuf::from(input);
            path.set_extension("abc");
            path.to_string_lossy().into_owned()
        }
    };
    let runner = Runner::new();
    match runner.compile_file(input) {
        Ok(out) => {
            for diagnostic in out.diagnostics.iter() {
                eprintln!("{diagnostic}");
            }
            if let Err(err) = fs::write(&output, &out.bytecode) {
                eprintln!("cannot write '{output}': {err}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("{failure}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> ExitCode {
    let Some(input) = args.first() else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let runner = Runner::new();
    let mut writer = StdPrint;
    let mut tracer = NoopTracer;

    // A compiled container runs directly; anything else compiles first.
    if let Ok(bytes) = fs::read(input) {
        if bytes.starts_with(&ace::bytecode::MAGIC) {
            return match runner.run_bytecode(&bytes, &mut writer, &mut tracer) {
                Ok(code) => exit_code(code),
                Err(err) => {
                    eprintln!("{err}");
                    ExitCode::FAILURE
                }
            };
        }
    }
    let source = match fs::read_to_string(input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read '{input}': {err}");
            return ExitCode::FAILURE;
        }
    };
    match runner.run_source(&source, input, &OsLoader, &mut writer) {
        Ok(code) => exit_code(code),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn check(args: &[String]) -> ExitCode {
    let Some(input) = args.first() else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let json = args.iter().any(|a| a == "--json");
    let runner = Runner::new();
    match runner.compile_file(input) {
        Ok(out) => {
            report(&out.diagnostics, json);
            ExitCode::SUCCESS
        }
        Err(CompileFailure::Diagnostics(errors)) => {
            report(&errors, json);
            ExitCode::FAILURE
        }
        Err(failure) => {
            eprintln!("{failure}");
            ExitCode::FAILURE
        }
    }
}

fn report(errors: &ace::ErrorList, json: bool) {
    if json {
        let diagnostics: Vec<&ace::Diagnostic> = errors.iter().collect();
        match serde_json::to_string_pretty(&diagnostics) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("cannot render diagnostics: {err}"),
        }
    } else {
        for diagnostic in errors.iter() {
            eprintln!("{diagnostic}");
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
