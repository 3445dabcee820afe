//! Chunk disassembler. Debug aid only; wired to `tracing` debug output after
//! a successful compile.

use std::fmt::Write;

use crate::chunk::Chunk;
use crate::opcode::OpCode;
use crate::value::{Obj, Value};
use crate::vm::Vm;

pub fn disassemble_chunk(vm: &Vm, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(vm, chunk, offset, &mut out);
    }
    out
}

fn render_value(vm: &Vm, v: Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => crate::value::format_number(n),
        Value::Obj(r) => match vm.obj(r) {
            Obj::String(s) => s.clone(),
            Obj::Function(f) => match &f.name {
                Some(n) => format!("<fn {}>", n),
                None => "<script>".to_string(),
            },
            o => format!("<{} {}>", o.type_name(), r),
        },
    }
}

pub fn disassemble_instruction(vm: &Vm, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.get_line(offset) == chunk.get_line(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.get_line(offset));
    }

    let op = OpCode::from_u8(chunk.code[offset]);
    match op {
        OpCode::Constant => constant_instruction(vm, "Constant", chunk, offset, out),
        OpCode::ConstantLong => constant_long_instruction(vm, chunk, offset, out),
        OpCode::Nil => simple_instruction("Nil", offset, out),
        OpCode::True => simple_instruction("True", offset, out),
        OpCode::False => simple_instruction("False", offset, out),
        OpCode::Pop => simple_instruction("Pop", offset, out),
        OpCode::GetLocal => byte_instruction("GetLocal", chunk, offset, out),
        OpCode::SetLocal => byte_instruction("SetLocal", chunk, offset, out),
        OpCode::GetUpvalue => byte_instruction("GetUpvalue", chunk, offset, out),
        OpCode::SetUpvalue => byte_instruction("SetUpvalue", chunk, offset, out),
        OpCode::DefineGlobal => constant_instruction(vm, "DefineGlobal", chunk, offset, out),
        OpCode::GetGlobal => constant_instruction(vm, "GetGlobal", chunk, offset, out),
        OpCode::SetGlobal => constant_instruction(vm, "SetGlobal", chunk, offset, out),
        OpCode::GetProperty => constant_instruction(vm, "GetProperty", chunk, offset, out),
        OpCode::SetProperty => constant_instruction(vm, "SetProperty", chunk, offset, out),
        OpCode::GetSuper => constant_instruction(vm, "GetSuper", chunk, offset, out),
        OpCode::Equal => simple_instruction("Equal", offset, out),
        OpCode::Greater => simple_instruction("Greater", offset, out),
        OpCode::Less => simple_instruction("Less", offset, out),
        OpCode::Add => simple_instruction("Add", offset, out),
        OpCode::Subtract => simple_instruction("Subtract", offset, out),
        OpCode::Multiply => simple_instruction("Multiply", offset, out),
        OpCode::Divide => simple_instruction("Divide", offset, out),
        OpCode::Modulo => simple_instruction("Modulo", offset, out),
        OpCode::BitAnd => simple_instruction("BitAnd", offset, out),
        OpCode::BitOr => simple_instruction("BitOr", offset, out),
        OpCode::BitXor => simple_instruction("BitXor", offset, out),
        OpCode::BitShiftLeft => simple_instruction("BitShiftLeft", offset, out),
        OpCode::BitShiftRight => simple_instruction("BitShiftRight", offset, out),
        OpCode::BitNot => simple_instruction("BitNot", offset, out),
        OpCode::Not => simple_instruction("Not", offset, out),
        OpCode::Negate => simple_instruction("Negate", offset, out),
        OpCode::Out => simple_instruction("Out", offset, out),
        OpCode::Jump => jump_instruction("Jump", 1, chunk, offset, out),
        OpCode::JumpIfFalse => jump_instruction("JumpIfFalse", 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("Loop", -1, chunk, offset, out),
        OpCode::Call => byte_instruction("Call", chunk, offset, out),
        OpCode::Invoke => invoke_instruction(vm, "Invoke", chunk, offset, out),
        OpCode::SuperInvoke => invoke_instruction(vm, "SuperInvoke", chunk, offset, out),
        OpCode::Closure => closure_instruction(vm, chunk, offset, out),
        OpCode::CloseUpvalue => simple_instruction("CloseUpvalue", offset, out),
        OpCode::Return => simple_instruction("Return", offset, out),
        OpCode::Class => constant_instruction(vm, "Class", chunk, offset, out),
        OpCode::Inherit => simple_instruction("Inherit", offset, out),
        OpCode::Method => constant_instruction(vm, "Method", chunk, offset, out),
        OpCode::Array => byte_instruction("Array", chunk, offset, out),
        OpCode::ObjectGet => simple_instruction("ObjectGet", offset, out),
        OpCode::ObjectSet => simple_instruction("ObjectSet", offset, out),
        OpCode::Dict => byte_instruction("Dict", chunk, offset, out),
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{:<16} {:4}", name, chunk.code[offset + 1]);
    offset + 2
}

fn constant_instruction(vm: &Vm, name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let _ = writeln!(out, "{:<16} {:4} '{}'", name, idx, render_value(vm, chunk.constants[idx]));
    offset + 2
}

fn constant_long_instruction(vm: &Vm, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let idx = Chunk::read_u16(&chunk.code, offset + 1) as usize;
    let _ = writeln!(out, "{:<16} {:4} '{}'", "ConstantLong", idx, render_value(vm, chunk.constants[idx]));
    offset + 3
}

fn invoke_instruction(vm: &Vm, name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    let _ = writeln!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        name,
        argc,
        idx,
        render_value(vm, chunk.constants[idx])
    );
    offset + 3
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = Chunk::read_u16(&chunk.code, offset + 1) as i32;
    let _ = writeln!(out, "{:<16} {:4} -> {}", name, offset, offset as i32 + 3 + sign * jump);
    offset + 3
}

fn closure_instruction(vm: &Vm, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let mut offset = offset + 1;
    let idx = chunk.code[offset] as usize;
    offset += 1;
    let _ = writeln!(out, "{:<16} {:4} {}", "Closure", idx, render_value(vm, chunk.constants[idx]));

    let upvalue_count = match chunk.constants[idx] {
        Value::Obj(r) => match vm.obj(r) {
            Obj::Function(f) => f.upvalue_count,
            _ => 0,
        },
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}    |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
