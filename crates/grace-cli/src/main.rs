//! The `grace` command-line driver: parse flags, read the entry file,
//! compile, run, map the outcome to an exit code.

use std::{env, path::Path, process::ExitCode, time::Instant};

use grace::{CompileOptions, InterpretResult, StdPrint, Vm, compile_file};

const USAGE: &str = "usage: grace <file.gr> [args...] [flags]

  -v,  --verbose         print compile/run timing and warnings
  -we, --warnings-error  treat warnings as errors
  -V,  --version         print version
";

fn main() -> ExitCode {
    let mut verbose = false;
    let mut warnings_error = false;
    let mut file: Option<String> = None;
    let mut script_args: Vec<String> = Vec::new();

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "-we" | "--warnings-error" => warnings_error = true,
            "-V" | "--version" => {
                println!("grace {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            _ => {
                if file.is_none() {
                    file = Some(arg);
                } else {
                    script_args.push(arg);
                }
            }
        }
    }

    let Some(file) = file else {
        eprint!("{USAGE}");
        return ExitCode::FAILURE;
    };

    let path = Path::new(&file);
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => {
            eprintln!("error: {file} is not a file");
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("error reading {file}: {err}");
            return ExitCode::FAILURE;
        }
    }

    let options = CompileOptions {
        verbose,
        warnings_error,
    };

    let compile_start = Instant::now();
    let program = match compile_file(path, options) {
        Ok(program) => program,
        Err(failure) => {
            eprint!("{}", failure.rendered);
            return ExitCode::FAILURE;
        }
    };
    if verbose {
        println!("Compilation succeeded in {:?}.", compile_start.elapsed());
    }

    let run_start = Instant::now();
    let mut writer = StdPrint;
    let result = Vm::new(program).run(&script_args, &mut writer);
    match result {
        InterpretResult::RuntimeOk => {
            if verbose {
                println!("Program finished successfully in {:?}.", run_start.elapsed());
            }
            ExitCode::SUCCESS
        }
        InterpretResult::RuntimeError => ExitCode::FAILURE,
        InterpretResult::Exited(code) => {
            let code = u8::try_from(code.rem_euclid(256)).unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
