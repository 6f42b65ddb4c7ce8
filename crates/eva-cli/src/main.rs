use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::time::Instant;

use eva::{EvaError, Vm};

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut disasm = false;
    let mut file_path: Option<&str> = None;
    for arg in args.iter().skip(1) {
        if arg == "--disasm" {
            disasm = true;
        } else {
            file_path = Some(arg);
        }
    }

    match file_path {
        Some(path) => run_file(path, disasm),
        None => repl(),
    }
}

fn run_file(file_path: &str, disasm: bool) -> ExitCode {
    let source = match read_file(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if disasm {
        return match disassemble(&source) {
            Ok(listing) => {
                print!("{listing}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error:\n{err}");
                ExitCode::FAILURE
            }
        };
    }

    let start = Instant::now();
    match Vm::new().exec(&source) {
        Ok(value) => {
            let elapsed = start.elapsed();
            println!("{value}");
            log::debug!("{file_path} ran in {elapsed:?}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            let elapsed = start.elapsed();
            eprintln!("error after {elapsed:?}:\n{err}");
            ExitCode::FAILURE
        }
    }
}

/// Parses, analyzes, and compiles `source` without running it, returning a
/// disassembly of the generated "main" `Code`. Kept as a free function
/// rather than a `Vm` method: disassembly needs a `Heap` and `Global` to
/// resolve constants and cell references, but none of `Vm`'s runtime state
/// (stack, frames, tracker), so it builds its own instead of borrowing one
/// from a VM that would otherwise sit unused.
fn disassemble(source: &str) -> Result<String, EvaError> {
    let mut heap = eva::heap::Heap::new();
    let mut global = eva::global::Global::new();
    let program = eva::parse::parse_program(source)?;
    let scopes = eva::scope::analyze(&program)?;
    let main = eva::bytecode::compiler::compile(&mut heap, &mut global, &program, &scopes)?;
    let code = heap.get_code(main);
    Ok(eva::bytecode::disasm::disassemble(code, &heap))
}

/// A line-at-a-time REPL: each line is run as its own program against a
/// fresh `Vm`, so bindings don't persist across lines (matching `exec`'s
/// one-shot contract rather than pretending to be a stateful session).
fn repl() -> ExitCode {
    println!("eva {} (^D to exit)", env!("CARGO_PKG_VERSION"));
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        if stdout.flush().is_err() {
            return ExitCode::FAILURE;
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {}
            Err(err) => {
                eprintln!("error reading stdin: {err}");
                return ExitCode::FAILURE;
            }
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Vm::new().exec(line) {
            Ok(value) => println!("{value}"),
            Err(err) => eprintln!("error:\n{err}"),
        }
    }
}

fn read_file(file_path: &str) -> Result<String, String> {
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("reading {file_path}: {err}"));
        }
    }
    fs::read_to_string(file_path).map_err(|err| format!("reading {file_path}: {err}"))
}
