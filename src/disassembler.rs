// File: src/disassembler.rs
//
// Human-readable bytecode listings, used by `--bytecode` and for
// debugging. Output is deterministic for a given chunk.

use crate::chunk::{Chunk, OpCode};
use crate::object::Heap;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) {
    println!("==== disassembly: {} | bytes: {} ====", name, chunk.code.len());
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset);
    }
    println!("============ end of disassembly ============");
    println!();
}

/// Print the instruction at `offset` and return the offset of the next one.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.line_of(offset) == chunk.line_of(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.line_of(offset));
    }

    let byte = chunk.code[offset];
    let op = match OpCode::from_byte(byte) {
        Some(op) => op,
        None => {
            println!("unknown opcode: {}", byte);
            return offset + 1;
        }
    };

    match op {
        OpCode::Return => simple("RETURN", offset),
        OpCode::Constant => constant("CONSTANT", heap, chunk, offset, false),
        OpCode::LongConstant => constant("LONG_CONSTANT", heap, chunk, offset, true),
        OpCode::Negate => simple("NEGATE", offset),
        OpCode::Not => simple("NOT", offset),
        OpCode::Add => simple("ADD", offset),
        OpCode::Subtract => simple("SUBTRACT", offset),
        OpCode::Multiply => simple("MULTIPLY", offset),
        OpCode::Divide => simple("DIVIDE", offset),
        OpCode::Equal => simple("EQUAL", offset),
        OpCode::NotEqual => simple("NOT_EQUAL", offset),
        OpCode::Less => simple("LESS", offset),
        OpCode::LessEqual => simple("LESS_EQUAL", offset),
        OpCode::More => simple("MORE", offset),
        OpCode::MoreEqual => simple("MORE_EQUAL", offset),
        OpCode::True => simple("TRUE", offset),
        OpCode::False => simple("FALSE", offset),
        OpCode::Nil => simple("NIL", offset),
        OpCode::Pop => simple("POP", offset),
        OpCode::DefineGlobal => constant("DEFINE_GLOBAL", heap, chunk, offset, false),
        OpCode::DefineLongGlobal => constant("DEFINE_LONG_GLOBAL", heap, chunk, offset, true),
        OpCode::GetGlobal => constant("GET_GLOBAL", heap, chunk, offset, false),
        OpCode::GetLongGlobal => constant("GET_LONG_GLOBAL", heap, chunk, offset, true),
        OpCode::SetGlobal => constant("SET_GLOBAL", heap, chunk, offset, false),
        OpCode::SetLongGlobal => constant("SET_LONG_GLOBAL", heap, chunk, offset, true),
        OpCode::GetLocal => byte_operand("GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_operand("SET_LOCAL", chunk, offset),
        OpCode::GetUpvalue => byte_operand("GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_operand("SET_UPVALUE", chunk, offset),
        OpCode::CloseUpvalue => simple("CLOSE_UPVALUE", offset),
        OpCode::Jump => jump("JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump("JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::JumpIfTrue => jump("JUMP_IF_TRUE", 1, chunk, offset),
        OpCode::Loop => jump("LOOP", -1, chunk, offset),
        OpCode::Call => byte_operand("CALL", chunk, offset),
        OpCode::Closure => closure(chunk, offset),
        OpCode::Print => simple("PRINT", offset),
    }
}

fn simple(name: &str, offset: usize) -> usize {
    println!("{}", name);
    offset + 1
}

fn constant(name: &str, heap: &Heap, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let (index, width) = if long {
        let hi = chunk.code[offset + 1] as usize;
        let lo = chunk.code[offset + 2] as usize;
        ((hi << 8) | lo, 3)
    } else {
        (chunk.code[offset + 1] as usize, 2)
    };
    let value = chunk.constants[index];
    println!("{} {} : {}", name, index, heap.value_to_string(value));
    offset + width
}

fn byte_operand(name: &str, chunk: &Chunk, offset: usize) -> usize {
    println!("{} {}", name, chunk.code[offset + 1]);
    offset + 2
}

fn jump(name: &str, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let hi = chunk.code[offset + 1] as i64;
    let lo = chunk.code[offset + 2] as i64;
    let distance = (hi << 8) | lo;
    let target = offset as i64 + 3 + sign * distance;
    println!("{} {} -> {}", name, distance, target);
    offset + 3
}

fn closure(chunk: &Chunk, offset: usize) -> usize {
    let count = chunk.code[offset + 1] as usize;
    print!("CLOSURE {}", count);
    let mut next = offset + 2;
    for _ in 0..count {
        let is_local = chunk.code[next] != 0;
        let index = chunk.code[next + 1];
        print!(" | {} {}", if is_local { "local" } else { "upvalue" }, index);
        next += 2;
    }
    println!();
    next
}
