// File: src/repl.rs
//
// Interactive REPL for the Curd language.
// One statement per line; compile and runtime errors are reported and the
// loop keeps going. The VM persists across lines, so globals, interned
// strings and defined functions carry over. Special commands start with
// ':'.

use crate::vm::VM;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: VM,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: VM::new(), editor })
    }

    fn show_banner(&self) {
        println!(
            "{}",
            format!("Curd {} — interactive shell", env!("CARGO_PKG_VERSION")).bright_cyan()
        );
        println!(
            "Type {} for commands, {} to leave.",
            ":help".bright_yellow(),
            ":quit".bright_yellow()
        );
        println!();
    }

    /// Starts the REPL loop.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        loop {
            match self.editor.readline(&"curd> ".bright_green().to_string()) {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(line.as_str());

                    if line.trim().starts_with(':') {
                        if !self.handle_command(line.trim()) {
                            break;
                        }
                        continue;
                    }

                    // Errors were already reported; the session continues.
                    let _ = self.vm.interpret(&line);
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (use :quit to exit)".bright_yellow());
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    // Returns false when the REPL should exit.
    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => false,
            ":globals" | ":g" => {
                self.show_globals();
                true
            }
            ":reset" | ":r" => {
                self.vm = VM::new();
                println!("{}", "environment reset".bright_green());
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {} for available commands.",
                    "Error:".bright_red(),
                    command.bright_yellow(),
                    ":help".bright_yellow()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!("Commands:");
        println!("  {}      show this help", ":help".bright_yellow());
        println!("  {}   list global bindings", ":globals".bright_yellow());
        println!("  {}     start over with a fresh VM", ":reset".bright_yellow());
        println!("  {}      leave the shell", ":quit".bright_yellow());
        println!();
        println!("Anything else is compiled and run as a statement.");
    }

    fn show_globals(&self) {
        let mut bindings = self.vm.global_bindings();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        if bindings.is_empty() {
            println!("no globals defined");
            return;
        }
        for (name, value) in bindings {
            println!("  {} = {}", name.bright_cyan(), self.vm.format_value(value));
        }
    }
}
