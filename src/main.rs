mod call_frame;
mod chunk;
mod compiler;
mod constants;
mod debug;
mod gc;
mod memory;
mod objects;
mod scanner;
mod std_mod;
mod table;
mod value;
mod vm;

use std::io::{BufRead, Write};
use std::process::exit;

use vm::{InterpretResult, VM};

fn repl(vm: &mut VM) {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush().expect("Failed to flush stdout");

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                vm.interpret(&line);
            }
            Err(_) => {
                println!();
                break;
            }
        }
    }
}

fn run_file(vm: &mut VM, path: &str) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read file \"{}\": {}.", path, error);
            exit(74);
        }
    };

    match vm.interpret(&source) {
        InterpretResult::InterpretOk => {}
        InterpretResult::InterpretCompileError => exit(65),
        InterpretResult::InterpretRuntimeError => exit(70),
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut vm = VM::new();

    match args.len() {
        1 => repl(&mut vm),
        2 => run_file(&mut vm, &args[1]),
        _ => {
            eprintln!("Usage: loxide [path]");
            exit(64);
        }
    }
}
