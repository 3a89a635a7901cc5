// File: src/main.rs
//
// Command-line entry point for the Curd language.
// With a file argument the script is compiled and executed; without one an
// interactive REPL starts. Exit codes: 0 on success, 65 for compile
// errors, 70 for runtime errors, 74 for I/O failures.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process;

use curd::repl::Repl;
use curd::vm::VM;

#[derive(Parser)]
#[command(
    name = "curd",
    about = "Curd: a small scripting language with a bytecode VM",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Print the disassembly of each compiled function
    #[arg(long)]
    bytecode: bool,

    /// Script to run; omit to start the REPL
    file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    match cli.file {
        Some(file) => run_file(&file, cli.bytecode),
        None => run_repl(),
    }
}

fn run_file(path: &PathBuf, bytecode: bool) -> ! {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("could not read file \"{}\": {}", path.display(), err);
            process::exit(74);
        }
    };

    let mut vm = VM::new();
    vm.set_disassemble(bytecode);
    match vm.interpret(&source) {
        Ok(()) => process::exit(0),
        Err(err) => process::exit(err.exit_code()),
    }
}

fn run_repl() -> ! {
    match Repl::new() {
        Ok(mut repl) => {
            if let Err(err) = repl.run() {
                eprintln!("REPL error: {}", err);
                process::exit(74);
            }
            process::exit(0);
        }
        Err(err) => {
            eprintln!("Failed to start REPL: {}", err);
            process::exit(74);
        }
    }
}
