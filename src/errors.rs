// File: src/errors.rs
//
// Error handling and reporting for the Curd language.
// Compile-time diagnostics and runtime errors are values: the compiler and
// the VM build them, the driver (or a test) decides where they go.

use colored::Colorize;
use std::fmt;

/// The two failure categories of an interpretation run, mapped to the
/// process exit codes the driver uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

impl InterpretError {
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretError::Compile => 65,
            InterpretError::Runtime => 70,
        }
    }
}

/// A single compile-time diagnostic with its source position.
///
/// `lexeme` is the offending token's text when one is available; scanner
/// diagnostics carry none, and end-of-file diagnostics are flagged so they
/// render as `Error at end`.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub lexeme: Option<String>,
    pub message: String,
    pub at_end: bool,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = if self.at_end {
            format!("[at {}:{}] Error at end: {}.", self.line, self.column, self.message)
        } else if let Some(ref lexeme) = self.lexeme {
            format!("[at {}:{}] Error at '{}': {}.", self.line, self.column, lexeme, self.message)
        } else {
            format!("[at {}:{}] Error: {}.", self.line, self.column, self.message)
        };
        write!(f, "{}", text.red())
    }
}

/// One frame of a runtime stack trace. `name` is None for the top-level
/// script.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub name: Option<String>,
}

/// A runtime failure: the message plus the call stack at the point of the
/// error, innermost frame first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", "Runtime error: ".red().bold(), self.message)?;
        for frame in &self.trace {
            match &frame.name {
                Some(name) => write!(f, "\n[line {}] in {}()", frame.line, name)?,
                None => write!(f, "\n[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
