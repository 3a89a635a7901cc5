// File: src/vm.rs
//
// The Curd virtual machine.
// A stack VM: one operand stack, one call-frame stack, one global table,
// one heap. The dispatch loop reads a byte, advances the instruction
// pointer and acts; runtime failures surface as a RuntimeError value with
// the call stack attached so the driver decides where it goes.

use once_cell::sync::Lazy;
use std::time::Instant;

use crate::chunk::OpCode;
use crate::compiler::compile;
use crate::errors::{InterpretError, RuntimeError, TraceFrame};
use crate::object::{Heap, NativeFn, Obj, ObjClosure, ObjHandle, ObjNative, ObjUpvalue};
use crate::table::Table;
use crate::value::Value;

pub const STACK_MAX: usize = 65536;
pub const FRAME_MAX: usize = 256;

// One activation record. `closure` is None for a plain function call, in
// which case the frame has no upvalues.
struct CallFrame {
    function: ObjHandle,
    closure: Option<ObjHandle>,
    ip: usize,
    base: usize,
}

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds elapsed on a monotonic clock, as a number.
fn clock_native(_args: &[Value]) -> Value {
    Value::Number(CLOCK_EPOCH.elapsed().as_secs_f64())
}

pub struct VM {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    // Open upvalues sorted by descending stack slot, at most one per slot.
    open_upvalues: Vec<(usize, ObjHandle)>,
    globals: Table,
    pub heap: Heap,
    disassemble: bool,
}

impl VM {
    pub fn new() -> VM {
        let mut vm = VM {
            frames: Vec::with_capacity(FRAME_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            heap: Heap::new(),
            disassemble: false,
        };
        vm.define_native("clock", clock_native, 0);
        vm
    }

    pub fn set_disassemble(&mut self, disassemble: bool) {
        self.disassemble = disassemble;
    }

    /// Compile and run one source buffer. Diagnostics and runtime errors
    /// go to stderr; the returned error selects the exit code.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        match self.run_source(source) {
            Ok(()) => Ok(()),
            Err(InterpretedFailure::Compile(diagnostics)) => {
                for diagnostic in &diagnostics {
                    eprintln!("{}", diagnostic);
                }
                Err(InterpretError::Compile)
            }
            Err(InterpretedFailure::Runtime(error)) => {
                eprintln!("{}", error);
                Err(InterpretError::Runtime)
            }
        }
    }

    /// Like `interpret` but hands the failure back instead of printing.
    pub fn run_source(&mut self, source: &str) -> Result<(), InterpretedFailure> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let function =
            compile(source, &mut self.heap, self.disassemble).map_err(InterpretedFailure::Compile)?;

        self.stack.push(Value::Obj(function));
        self.call_function(function, None, 0).map_err(InterpretedFailure::Runtime)?;
        self.run().map_err(InterpretedFailure::Runtime)
    }

    /// Look up a global by name. Interning means a miss in the interner is
    /// a miss in the globals.
    pub fn global(&self, name: &str) -> Option<Value> {
        let handle = self.heap.find_interned(name)?;
        self.globals.get(self.heap.objects(), handle)
    }

    /// Snapshot of the global bindings, for the REPL.
    pub fn global_bindings(&self) -> Vec<(String, Value)> {
        self.globals
            .iter()
            .map(|(key, value)| (self.heap.string(key).chars.clone(), value))
            .collect()
    }

    pub fn format_value(&self, value: Value) -> String {
        self.heap.value_to_string(value)
    }

    fn define_native(&mut self, name: &str, fun: NativeFn, arity: i32) {
        let name_handle = self.heap.intern(name);
        let native = self.heap.alloc(Obj::Native(ObjNative { arity, name: name_handle, fun }));
        self.globals.set(self.heap.objects(), name_handle, Value::Obj(native));
    }

    // ---- stack and bytecode plumbing ----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        let index = self.frames.len() - 1;
        &self.frames[index]
    }

    fn read_byte(&mut self) -> u8 {
        let index = self.frames.len() - 1;
        let frame = &self.frames[index];
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        self.frames[index].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long { self.read_u16() as usize } else { self.read_byte() as usize };
        let frame = self.frame();
        self.heap.function(frame.function).chunk.constants[index]
    }

    // Constant operands of the global instructions are always interned
    // strings.
    fn read_global_name(&mut self, long: bool) -> ObjHandle {
        match self.read_constant(long) {
            Value::Obj(handle) => handle,
            other => panic!("global name constant is not a string: {:?}", other),
        }
    }

    // ---- errors ----

    fn runtime_error(&self, message: String) -> RuntimeError {
        RuntimeError { message, trace: self.stack_trace() }
    }

    // Innermost frame first. The IP has already moved past the faulting
    // instruction, so line lookup backs up one byte.
    fn stack_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.heap.function(frame.function);
                let line = function.chunk.line_of(frame.ip.saturating_sub(1));
                let name = function.name.map(|n| self.heap.string(n).chars.clone());
                TraceFrame { line, name }
            })
            .collect()
    }

    // ---- calls ----

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        if let Value::Obj(handle) = callee {
            match self.heap.get(handle) {
                Obj::Function(_) => return self.call_function(handle, None, arg_count),
                Obj::Closure(closure) => {
                    let function = closure.function;
                    return self.call_function(function, Some(handle), arg_count);
                }
                Obj::Native(_) => return self.call_native(handle, arg_count),
                _ => {}
            }
        }
        Err(self.runtime_error("Object is not callable".to_string()))
    }

    fn call_function(
        &mut self,
        function: ObjHandle,
        closure: Option<ObjHandle>,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {} arguments, but got {}", arity, arg_count))
            );
        }
        if self.frames.len() == FRAME_MAX {
            return Err(self.runtime_error("Stack overflow".to_string()));
        }
        self.frames.push(CallFrame {
            function,
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjHandle, arg_count: usize) -> Result<(), RuntimeError> {
        let (arity, fun) = {
            let native = self.heap.native(native);
            (native.arity, native.fun)
        };
        if arity != -1 && arg_count as i32 != arity {
            return Err(
                self.runtime_error(format!("Expected {} arguments, but got {}", arity, arg_count))
            );
        }
        let first_arg = self.stack.len() - arg_count;
        let result = fun(&self.stack[first_arg..]);
        // Drop the arguments and the callee.
        self.stack.truncate(first_arg - 1);
        self.push(result);
        Ok(())
    }

    // ---- upvalues ----

    // One open upvalue per slot: reuse an existing entry, otherwise splice
    // a new one in keeping the list sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjHandle {
        let mut index = 0;
        while index < self.open_upvalues.len() && self.open_upvalues[index].0 > slot {
            index += 1;
        }
        if index < self.open_upvalues.len() && self.open_upvalues[index].0 == slot {
            return self.open_upvalues[index].1;
        }
        let handle = self.heap.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(index, (slot, handle));
        handle
    }

    // Close every open upvalue at or above `last`: move the slot's value
    // into the upvalue itself.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&(slot, handle)) = self.open_upvalues.first() {
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(handle) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn frame_upvalue(&self, index: usize) -> ObjHandle {
        let closure = self.frame().closure.expect("frame has no upvalues");
        self.heap.closure(closure).upvalues[index]
    }

    // ---- dispatch ----

    fn run(&mut self) -> Result<(), RuntimeError> {
        macro_rules! binary_op {
            ($wrap:expr, $op:tt) => {{
                if !self.peek(0).is_number() || !self.peek(1).is_number() {
                    return Err(self.runtime_error(format!(
                        "Operands to '{}' must be numbers.",
                        stringify!($op)
                    )));
                }
                let b = match self.pop() {
                    Value::Number(n) => n,
                    _ => unreachable!(),
                };
                let a = match self.pop() {
                    Value::Number(n) => n,
                    _ => unreachable!(),
                };
                self.push($wrap(a $op b));
            }};
        }

        loop {
            let byte = self.read_byte();
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(format!("unknown opcode: {}", byte))),
            };

            match op {
                OpCode::Return => {
                    let value = self.pop();
                    let frame = self.frames.pop().expect("frame stack underflow");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // Pop the script function itself and halt.
                        self.stack.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(value);
                }
                OpCode::Constant => {
                    let value = self.read_constant(false);
                    self.push(value);
                }
                OpCode::LongConstant => {
                    let value = self.read_constant(true);
                    self.push(value);
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(
                            self.runtime_error("Operand to '-' must be a number.".to_string())
                        );
                    }
                    if let Value::Number(n) = self.pop() {
                        self.push(Value::Number(-n));
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    match (a, b) {
                        (Value::Obj(left), Value::Obj(right))
                            if self.heap.is_string(left) && self.heap.is_string(right) =>
                        {
                            self.pop();
                            self.pop();
                            let combined = format!(
                                "{}{}",
                                self.heap.string(left).chars,
                                self.heap.string(right).chars
                            );
                            let handle = self.heap.intern(&combined);
                            self.push(Value::Obj(handle));
                        }
                        (Value::Number(left), Value::Number(right)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(left + right));
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands to '+' must be two numbers or two strings.".to_string(),
                            ))
                        }
                    }
                }
                OpCode::Subtract => binary_op!(Value::Number, -),
                OpCode::Multiply => binary_op!(Value::Number, *),
                OpCode::Divide => binary_op!(Value::Number, /),
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Less => binary_op!(Value::Bool, <),
                OpCode::LessEqual => binary_op!(Value::Bool, <=),
                OpCode::More => binary_op!(Value::Bool, >),
                OpCode::MoreEqual => binary_op!(Value::Bool, >=),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Nil => self.push(Value::Nil),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::DefineGlobal | OpCode::DefineLongGlobal => {
                    let name = self.read_global_name(op == OpCode::DefineLongGlobal);
                    let value = self.pop();
                    self.globals.set(self.heap.objects(), name, value);
                }
                OpCode::GetGlobal | OpCode::GetLongGlobal => {
                    let name = self.read_global_name(op == OpCode::GetLongGlobal);
                    match self.globals.get(self.heap.objects(), name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.heap.string(name).chars
                            )))
                        }
                    }
                }
                OpCode::SetGlobal | OpCode::SetLongGlobal => {
                    let name = self.read_global_name(op == OpCode::SetLongGlobal);
                    // Check first: assignment must not create the binding.
                    if self.globals.get(self.heap.objects(), name).is_none() {
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.heap.string(name).chars
                        )));
                    }
                    let value = self.peek(0);
                    self.globals.set(self.heap.objects(), name, value);
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let index = self.frame().base + slot;
                    self.stack[index] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = match *self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(slot) => self.stack[slot],
                        ObjUpvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = self.peek(0);
                    match *self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(slot) => self.stack[slot] = value,
                        ObjUpvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    let index = self.frames.len() - 1;
                    self.frames[index].ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        let index = self.frames.len() - 1;
                        self.frames[index].ip += offset;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_falsey() {
                        let index = self.frames.len() - 1;
                        self.frames[index].ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    let index = self.frames.len() - 1;
                    self.frames[index].ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    let function = match self.pop() {
                        Value::Obj(handle) => handle,
                        other => panic!("CLOSURE on a non-function: {:?}", other),
                    };
                    let count = self.read_byte() as usize;
                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let slot = self.frame().base + index;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            upvalues.push(self.frame_upvalue(index));
                        }
                    }
                    let closure = self.heap.alloc(Obj::Closure(ObjClosure { function, upvalues }));
                    self.push(Value::Obj(closure));
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{}", self.heap.value_to_string(value));
                }
            }
        }
    }
}

impl Default for VM {
    fn default() -> VM {
        VM::new()
    }
}

/// The two ways a source run can fail, carrying the evidence.
#[derive(Debug)]
pub enum InterpretedFailure {
    Compile(Vec<crate::errors::Diagnostic>),
    Runtime(RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    // Run a program and hand back the VM for state inspection.
    fn run_code(source: &str) -> VM {
        let mut vm = VM::new();
        if let Err(failure) = vm.run_source(source) {
            match failure {
                InterpretedFailure::Compile(diagnostics) => {
                    panic!("compile error in {:?}: {:?}", source, diagnostics)
                }
                InterpretedFailure::Runtime(error) => {
                    panic!("runtime error in {:?}: {}", source, error)
                }
            }
        }
        vm
    }

    fn run_expect_runtime_error(source: &str) -> RuntimeError {
        let mut vm = VM::new();
        match vm.run_source(source) {
            Err(InterpretedFailure::Runtime(error)) => error,
            Err(InterpretedFailure::Compile(diagnostics)) => {
                panic!("expected runtime error, got compile error: {:?}", diagnostics)
            }
            Ok(()) => panic!("expected runtime error, got success"),
        }
    }

    fn number(vm: &VM, name: &str) -> f64 {
        match vm.global(name) {
            Some(Value::Number(n)) => n,
            other => panic!("expected number in global '{}', got {:?}", name, other),
        }
    }

    #[test]
    fn test_arithmetic_precedence() {
        let vm = run_code("var r = 1 + 2 * 3;");
        assert_eq!(number(&vm, "r"), 7.0);
    }

    #[test]
    fn test_grouping_and_negation() {
        let vm = run_code("var r = -(1 + 2) * 3;");
        assert_eq!(number(&vm, "r"), -9.0);
    }

    #[test]
    fn test_string_concatenation_interns_result() {
        let vm = run_code("var a = \"foo\"; var b = \"bar\"; var c = a + b; var d = \"foobar\";");
        let c = vm.global("c").expect("missing c");
        let d = vm.global("d").expect("missing d");
        // The concatenation and the literal are the same interned object.
        assert_eq!(c, d);
        assert_eq!(vm.format_value(c), "foobar");
    }

    #[test]
    fn test_comparisons_and_equality() {
        let vm = run_code(
            "var a = 1 < 2; var b = 2 <= 2; var c = 3 > 4; var d = 1 == 1; var e = 1 != 1; \
             var f = \"x\" == \"x\"; var g = nil == nil; var h = 0 == false;",
        );
        assert_eq!(vm.global("a"), Some(Value::Bool(true)));
        assert_eq!(vm.global("b"), Some(Value::Bool(true)));
        assert_eq!(vm.global("c"), Some(Value::Bool(false)));
        assert_eq!(vm.global("d"), Some(Value::Bool(true)));
        assert_eq!(vm.global("e"), Some(Value::Bool(false)));
        assert_eq!(vm.global("f"), Some(Value::Bool(true)));
        assert_eq!(vm.global("g"), Some(Value::Bool(true)));
        // Different kinds are never equal.
        assert_eq!(vm.global("h"), Some(Value::Bool(false)));
    }

    #[test]
    fn test_zero_is_falsey_in_conditions() {
        let vm = run_code("var r = if (0) \"then\" else \"else\";");
        assert_eq!(vm.format_value(vm.global("r").expect("missing r")), "else");
    }

    #[test]
    fn test_logical_operators_short_circuit() {
        let vm = run_code(
            "var a = false and undefined_is_never_read; var b = true or undefined_is_never_read; \
             var c = 1 and 2;",
        );
        assert_eq!(vm.global("a"), Some(Value::Bool(false)));
        assert_eq!(vm.global("b"), Some(Value::Bool(true)));
        assert_eq!(number(&vm, "c"), 2.0);
    }

    #[test]
    fn test_block_expression_value() {
        let vm = run_code("var r = { 1; 2 };");
        assert_eq!(number(&vm, "r"), 2.0);
    }

    #[test]
    fn test_block_ending_in_semicolon_is_nil() {
        let vm = run_code("var r = { 1; 2; };");
        assert_eq!(vm.global("r"), Some(Value::Nil));
    }

    #[test]
    fn test_empty_block_is_nil() {
        let vm = run_code("var r = {};");
        assert_eq!(vm.global("r"), Some(Value::Nil));
    }

    #[test]
    fn test_block_value_above_locals() {
        // The trailing expression wins even with locals beneath it.
        let vm = run_code("var y = { var a = 1; 99 };");
        assert_eq!(number(&vm, "y"), 99.0);

        let vm = run_code("var y = { var a = 3; a + 10 };");
        assert_eq!(number(&vm, "y"), 13.0);

        let vm = run_code("var y = { var a = 2; var b = 5; a * b };");
        assert_eq!(number(&vm, "y"), 10.0);
    }

    #[test]
    fn test_block_value_with_captured_local() {
        let vm = run_code(
            "var bump;\n\
             var r = { var i = 10; fun b() { i = i + 1; return i; } bump = b; i };\n\
             var after = bump();",
        );
        assert_eq!(number(&vm, "r"), 10.0);
        assert_eq!(number(&vm, "after"), 11.0);
    }

    #[test]
    fn test_if_without_else_is_nil() {
        let vm = run_code("var r = if (false) 1;");
        assert_eq!(vm.global("r"), Some(Value::Nil));
    }

    #[test]
    fn test_while_loop() {
        let vm = run_code("var i = 0; var x = 0; while (i < 5) { i = i + 1; x = x + i; }");
        assert_eq!(number(&vm, "i"), 5.0);
        assert_eq!(number(&vm, "x"), 15.0);
    }

    #[test]
    fn test_for_loop_sum() {
        let vm = run_code("var x = 0; for (var i = 0; i < 5; i = i + 1) { x = x + i; }");
        assert_eq!(number(&vm, "x"), 10.0);
    }

    #[test]
    fn test_for_loop_without_increment() {
        let vm = run_code("var x = 0; for (var i = 0; i < 3;) { i = i + 1; x = x + 1; }");
        assert_eq!(number(&vm, "x"), 3.0);
    }

    #[test]
    fn test_function_call_and_return() {
        let vm = run_code("fun add(a, b) { return a + b; } var r = add(2, 3);");
        assert_eq!(number(&vm, "r"), 5.0);
    }

    #[test]
    fn test_function_implicit_block_value() {
        let vm = run_code("fun three() { 3 } var r = three();");
        assert_eq!(number(&vm, "r"), 3.0);
    }

    #[test]
    fn test_function_implicit_value_above_locals() {
        let vm = run_code("fun f() { var a = 1; 99 } var r = f();");
        assert_eq!(number(&vm, "r"), 99.0);

        let vm = run_code("fun f(n) { var twice = n * 2; twice + 1 } var r = f(4);");
        assert_eq!(number(&vm, "r"), 9.0);
    }

    #[test]
    fn test_function_implicit_value_with_captured_local() {
        let vm = run_code(
            "fun outer() { var i = 5; fun get() { return i; } get() } var r = outer();",
        );
        assert_eq!(number(&vm, "r"), 5.0);
    }

    #[test]
    fn test_recursion() {
        let vm = run_code(
            "fun fib(n) { if (n < 2) n else fib(n - 1) + fib(n - 2) } var r = fib(10);",
        );
        assert_eq!(number(&vm, "r"), 55.0);
    }

    #[test]
    fn test_closure_counter() {
        let vm = run_code(
            "fun counter() { var i = 0; fun inc() { i = i + 1; return i; } return inc; } \
             var c = counter(); var a = c(); var b = c(); var d = c();",
        );
        assert_eq!(number(&vm, "a"), 1.0);
        assert_eq!(number(&vm, "b"), 2.0);
        assert_eq!(number(&vm, "d"), 3.0);
    }

    #[test]
    fn test_two_closures_share_one_upvalue() {
        let vm = run_code(
            "fun pair() { var x = 0; fun set(v) { x = v; return nil; } \
             fun get() { return x; } set(41); var before = get(); \
             return fun () { set(before + 1); return get(); }; } \
             var r = pair()();",
        );
        assert_eq!(number(&vm, "r"), 42.0);
    }

    #[test]
    fn test_capture_survives_scope_exit() {
        let vm = run_code(
            "var get; { var i = 7; fun f() { return i; } get = f; } \
             var a = 1; var b = 2; var r = get();",
        );
        assert_eq!(number(&vm, "r"), 7.0);
    }

    #[test]
    fn test_shared_capture_after_close() {
        let vm = run_code(
            "fun make() { var n = 0; fun bump() { n = n + 1; return n; } \
             fun read() { return n; } bump(); return read; } \
             var r = make()();",
        );
        assert_eq!(number(&vm, "r"), 1.0);
    }

    #[test]
    fn test_transitive_capture() {
        let vm = run_code(
            "fun a() { var x = 10; fun b() { fun c() { return x; } return c; } return b; } \
             var r = a()()();",
        );
        assert_eq!(number(&vm, "r"), 10.0);
    }

    #[test]
    fn test_anonymous_function_expression() {
        let vm = run_code("var twice = fun (x) { return x * 2; }; var r = twice(21);");
        assert_eq!(number(&vm, "r"), 42.0);
    }

    #[test]
    fn test_clock_native() {
        let vm = run_code("var t = clock();");
        match vm.global("t") {
            Some(Value::Number(n)) => assert!(n >= 0.0),
            other => panic!("expected clock() to produce a number, got {:?}", other),
        }
    }

    #[test]
    fn test_native_render() {
        let vm = run_code("var c = clock;");
        let c = vm.global("c").expect("missing c");
        assert_eq!(vm.format_value(c), "native function clock");
    }

    #[test]
    fn test_add_type_error() {
        let error = run_expect_runtime_error("var r = 1 + \"a\";");
        assert!(error.message.contains("Operands to '+' must be two numbers or two strings."));
        assert_eq!(error.trace.len(), 1);
        assert_eq!(error.trace[0].line, 1);
        assert!(error.trace[0].name.is_none());
    }

    #[test]
    fn test_subtract_type_error_names_operator() {
        let error = run_expect_runtime_error("true - 1;");
        assert!(error.message.contains("Operands to '-' must be numbers."));
    }

    #[test]
    fn test_negate_type_error() {
        let error = run_expect_runtime_error("-\"x\";");
        assert!(error.message.contains("Operand to '-' must be a number."));
    }

    #[test]
    fn test_undefined_global_read() {
        let error = run_expect_runtime_error("print missing;");
        assert!(error.message.contains("Undefined variable 'missing'."));
    }

    #[test]
    fn test_undefined_global_write_leaves_no_ghost() {
        let mut vm = VM::new();
        match vm.run_source("ghost = 1;") {
            Err(InterpretedFailure::Runtime(error)) => {
                assert!(error.message.contains("Undefined variable 'ghost'."))
            }
            other => panic!(
                "expected runtime error, got {:?}",
                match other {
                    Ok(()) => "success".to_string(),
                    Err(InterpretedFailure::Compile(d)) => format!("compile error {:?}", d),
                    Err(InterpretedFailure::Runtime(_)) => unreachable!(),
                }
            ),
        }
        // The failed assignment must not have defined the name.
        assert_eq!(vm.global("ghost"), None);
    }

    #[test]
    fn test_arity_mismatch() {
        let error = run_expect_runtime_error("fun f(a) { return a; } f(1, 2);");
        assert!(error.message.contains("Expected 1 arguments, but got 2"));
    }

    #[test]
    fn test_calling_a_non_function() {
        let error = run_expect_runtime_error("var x = 3; x();");
        assert!(error.message.contains("Object is not callable"));
    }

    #[test]
    fn test_stack_trace_names_frames() {
        let error = run_expect_runtime_error(
            "fun inner() {\n  return 1 + nil;\n}\nfun outer() {\n  return inner();\n}\nouter();",
        );
        assert_eq!(error.trace.len(), 3);
        assert_eq!(error.trace[0].name.as_deref(), Some("inner"));
        assert_eq!(error.trace[0].line, 2);
        assert_eq!(error.trace[1].name.as_deref(), Some("outer"));
        assert_eq!(error.trace[2].name, None);
    }

    #[test]
    fn test_unbounded_recursion_overflows_cleanly() {
        let error = run_expect_runtime_error("fun loop() { return loop(); } loop();");
        assert!(error.message.contains("Stack overflow"));
    }

    #[test]
    fn test_long_constant_pool() {
        // Push the pool past 256 entries so the 16-bit constant and global
        // instruction variants are exercised end to end.
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var g{} = {};\n", i, i * 2));
        }
        let vm = run_code(&source);
        assert_eq!(number(&vm, "g0"), 0.0);
        assert_eq!(number(&vm, "g299"), 598.0);
    }

    #[test]
    fn test_globals_persist_across_runs() {
        let mut vm = VM::new();
        vm.run_source("var carried = 12;").expect("first line failed");
        vm.run_source("var r = carried + 30;").expect("second line failed");
        assert_eq!(vm.global("r"), Some(Value::Number(42.0)));
    }

    #[test]
    fn test_vm_recovers_after_runtime_error() {
        let mut vm = VM::new();
        assert!(vm.run_source("print 1 + nil;").is_err());
        vm.run_source("var ok = 5;").expect("VM should recover after an error");
        assert_eq!(vm.global("ok"), Some(Value::Number(5.0)));
    }

    #[test]
    fn test_const_global_is_accepted() {
        // `const` carries no runtime enforcement on globals.
        let vm = run_code("const k = 3; var r = k + 1;");
        assert_eq!(number(&vm, "r"), 4.0);
    }

    #[test]
    fn test_function_render() {
        let vm = run_code("fun greet() { return nil; } var g = greet;");
        let g = vm.global("g").expect("missing g");
        assert_eq!(vm.format_value(g), "function greet");
    }
}
