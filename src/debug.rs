use crate::chunk::{Chunk, OpCode};
use crate::value::{as_function_object, print_value};

#[allow(dead_code)]
pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

#[allow(dead_code)]
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.read_line_from_offset(offset) == chunk.read_line_from_offset(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.read_line_from_offset(offset).unwrap_or(0));
    }

    let instruction = match chunk.read_from_offset(offset).and_then(OpCode::from_byte) {
        Some(instruction) => instruction,
        None => {
            println!("Unknown opcode {:?}", chunk.read_from_offset(offset));
            return offset + 1;
        }
    };

    match instruction {
        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(instruction, chunk, offset),

        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Inherit
        | OpCode::Throw
        | OpCode::Return => simple_instruction(instruction, offset),

        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(instruction, chunk, offset),

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            jump_instruction(instruction, 1, chunk, offset)
        }
        OpCode::Loop => jump_instruction(instruction, -1, chunk, offset),

        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(instruction, chunk, offset),

        OpCode::Closure => closure_instruction(chunk, offset),
    }
}

fn simple_instruction(instruction: OpCode, offset: usize) -> usize {
    println!("{}", instruction);
    offset + 1
}

fn constant_instruction(instruction: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.read_from_offset(offset + 1).unwrap_or(0);
    print!("{:<16} {:>4} '", instruction.to_string(), constant);
    print_value(chunk.get_constant(constant as usize));
    println!("'");
    offset + 2
}

fn byte_instruction(instruction: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.read_from_offset(offset + 1).unwrap_or(0);
    println!("{:<16} {:>4}", instruction.to_string(), slot);
    offset + 2
}

fn jump_instruction(instruction: OpCode, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let mut jump_offset = (chunk.read_from_offset(offset + 1).unwrap_or(0) as u16) << 8;
    jump_offset |= chunk.read_from_offset(offset + 2).unwrap_or(0) as u16;

    let target = (offset as isize + 3 + (sign as isize) * (jump_offset as isize)) as usize;
    println!("{:<16} {:>4} -> {}", instruction.to_string(), offset, target);
    offset + 3
}

fn invoke_instruction(instruction: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.read_from_offset(offset + 1).unwrap_or(0);
    let argument_count = chunk.read_from_offset(offset + 2).unwrap_or(0);
    print!("{:<16} ({} args) {:>4} '", instruction.to_string(), argument_count, constant);
    print_value(chunk.get_constant(constant as usize));
    println!("'");
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.read_from_offset(offset + 1).unwrap_or(0);
    print!("{:<16} {:>4} ", "Closure", constant);
    print_value(chunk.get_constant(constant as usize));
    println!();

    let mut offset = offset + 2;
    let function = as_function_object(chunk.get_constant(constant as usize));
    for _ in 0..unsafe { (*function).upvalue_count } {
        let is_local = chunk.read_from_offset(offset).unwrap_or(0);
        let index = chunk.read_from_offset(offset + 1).unwrap_or(0);
        println!(
            "{:04}    |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
