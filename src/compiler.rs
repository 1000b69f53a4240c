use std::io::Write;

use once_cell::sync::Lazy;

use crate::chunk::OpCode;
use crate::constants::UINT8_COUNT;
use crate::gc::GarbageCollector;
use crate::objects::object::Object;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_manager::ObjectManager;
use crate::scanner::{Scanner, Token, TokenType};
use crate::table::Table;
use crate::value::{make_number_value, make_object_value, make_string_value, Value};

pub struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    scanner: Option<Box<Scanner<'a>>>,
    has_error: bool,
    panic_mode: bool,
    compilers: Vec<Compiler<'a>>,
    class_compilers: Vec<ClassCompiler>,
    object_manager: &'a mut ObjectManager,
    intern_strings: &'a mut Table,
}

struct Local<'a> {
    name: Token<'a>,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone)]
struct Upvalue {
    index: usize,
    is_local: bool,
}

struct ClassCompiler {
    has_superclass: bool,
}

#[derive(PartialEq, Clone, Copy)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

struct Compiler<'a> {
    function: Box<ObjectFunction>,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'a> Compiler<'a> {
    fn new(function_type: FunctionType) -> Self {
        Compiler {
            function: Box::new(ObjectFunction::new(0, String::new())),
            function_type,
            locals: vec![],
            upvalues: vec![],
            scope_depth: 0,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Assignment,
            2 => Precedence::Or,
            3 => Precedence::And,
            4 => Precedence::Equality,
            5 => Precedence::Comparison,
            6 => Precedence::Term,
            7 => Precedence::Factor,
            8 => Precedence::Unary,
            9 => Precedence::Call,
            10 => Precedence::Primary,
            _ => unreachable!("Invalid precedence value: {}", value),
        }
    }
}

type ParserFn = fn(&mut Parser<'_>, bool);

#[derive(Debug, Clone, Copy)]
struct ParseRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParserFn>, infix: Option<ParserFn>, precedence: Precedence) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

static RULES: Lazy<[ParseRule; TokenType::Eof as usize + 1]> = Lazy::new(|| {
    let mut rules = [ParseRule::new(None, None, Precedence::None); TokenType::Eof as usize + 1];

    rules[TokenType::LeftParen as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.grouping()),
        Some(|parser, can_assign| parser.call(can_assign)),
        Precedence::Call,
    );

    rules[TokenType::Dot as usize] = ParseRule::new(
        None,
        Some(|parser, can_assign| parser.dot(can_assign)),
        Precedence::Call,
    );

    rules[TokenType::Minus as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Plus as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Term);

    rules[TokenType::Slash as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Factor);

    rules[TokenType::Star as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Factor);

    rules[TokenType::Bang as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.unary()), None, Precedence::None);

    rules[TokenType::BangEqual as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Equality);

    rules[TokenType::EqualEqual as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Equality);

    rules[TokenType::Greater as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Comparison);

    rules[TokenType::GreaterEqual as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Comparison);

    rules[TokenType::Less as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Comparison);

    rules[TokenType::LessEqual as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.binary()), Precedence::Comparison);

    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|parser, can_assign| parser.variable(can_assign)),
        None,
        Precedence::None,
    );

    rules[TokenType::String as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.string()), None, Precedence::None);

    rules[TokenType::Number as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.number()), None, Precedence::None);

    rules[TokenType::And as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.and()), Precedence::And);

    rules[TokenType::Or as usize] =
        ParseRule::new(None, Some(|parser, _can_assign| parser.or()), Precedence::Or);

    rules[TokenType::False as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::True as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::Nil as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::This as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.this()), None, Precedence::None);

    rules[TokenType::Super as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.super_()), None, Precedence::None);

    rules
});

fn synthetic_token(value: &'static str) -> Token<'static> {
    Token {
        token_type: TokenType::Identifier,
        value,
        line: 0,
    }
}

impl<'a> Parser<'a> {
    pub fn new(object_manager: &'a mut ObjectManager, intern_strings: &'a mut Table) -> Box<Parser<'a>> {
        let mut parser = Box::new(Parser {
            current: synthetic_token(""),
            previous: synthetic_token(""),
            scanner: None,
            has_error: false,
            panic_mode: false,
            compilers: vec![],
            class_compilers: vec![],
            object_manager,
            intern_strings,
        });
        parser.init_compiler(FunctionType::Script);
        parser
    }

    /// Front-end boundary: turns source into the top-level script function,
    /// or None when anything failed to parse.
    pub fn compile(&mut self, source: &'a str) -> Option<*mut ObjectFunction> {
        self.scanner = Some(Scanner::new(source));
        self.advance();

        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        let function = self.end_compiler();
        if self.has_error {
            None
        } else {
            Some(function)
        }
    }

    /// GC hook: keeps every in-progress function's constants alive should a
    /// collection run while compilation owns the object manager.
    pub fn mark_roots(&self, gc: &mut GarbageCollector) {
        for compiler in &self.compilers {
            for constant in compiler.function.chunk.iter_constants() {
                gc.mark_value(constant);
            }
        }
    }

    fn specific_compiler(&self, compiler_index: usize) -> &Compiler<'a> {
        self.compilers.get(compiler_index).expect("compiler index is invalid.")
    }

    fn specific_compiler_mut(&mut self, compiler_index: usize) -> &mut Compiler<'a> {
        self.compilers.get_mut(compiler_index).expect("compiler index is invalid.")
    }

    fn current_compiler(&self) -> &Compiler<'a> {
        self.compilers.last().expect("No compiler.")
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'a> {
        self.compilers.last_mut().expect("No compiler.")
    }

    fn current_function(&self) -> &ObjectFunction {
        &self.current_compiler().function
    }

    fn current_function_mut(&mut self) -> &mut ObjectFunction {
        &mut self.current_compiler_mut().function
    }

    fn current_locals(&self) -> &Vec<Local<'a>> {
        &self.current_compiler().locals
    }

    fn current_locals_mut(&mut self) -> &mut Vec<Local<'a>> {
        &mut self.current_compiler_mut().locals
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            let scanner = self.scanner.as_mut().expect("Compiler was not initialized correctly.");
            self.current = scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }
            self.error_at_current(self.current.value);
        }
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_function_mut().chunk.write(byte, line);
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_constant(&mut self, value: Value) {
        let byte = self.make_constant(value);
        self.emit_bytes(OpCode::Constant.to_byte(), byte);
    }

    fn emit_return(&mut self) {
        // An initializer's implicit return hands back the receiver.
        if self.current_compiler().function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal.to_byte(), 0);
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.emit_byte(OpCode::Return.to_byte());
    }

    fn init_compiler(&mut self, function_type: FunctionType) {
        let mut compiler = Compiler::new(function_type);
        // A function declaration's name is the token right before its body is
        // compiled, so grab it from `previous` here.
        if function_type != FunctionType::Script {
            compiler.function.name = self.previous.value.to_string();
        }

        // Slot zero belongs to the callee; methods expose it as `this`.
        let slot_zero = if matches!(function_type, FunctionType::Method | FunctionType::Initializer) {
            synthetic_token("this")
        } else {
            synthetic_token("")
        };
        compiler.locals.push(Local {
            name: slot_zero,
            depth: 0,
            is_captured: false,
        });
        self.compilers.push(compiler);
    }

    fn end_compiler(&mut self) -> *mut ObjectFunction {
        self.emit_return();
        let compiler = self.compilers.pop().expect("No compiler.");
        let (function, _) = self.object_manager.adopt_function(compiler.function);
        debug_feature::disassemble_function(self, function);
        function
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_function().chunk.find_constant(&value) {
            return index as u8;
        }

        let constant_index = self.current_function_mut().chunk.add_constant(value);
        if constant_index > u8::MAX.into() {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant_index as u8
    }

    fn identifier_constant(&mut self, token: Token) -> u8 {
        let value = make_string_value(self.object_manager, self.intern_strings, token.value);
        self.make_constant(value)
    }

    fn identifier_equal(left: &Token, right: &Token) -> bool {
        left.value == right.value
    }

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.function_declaration();
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.clone();
        let name_constant = self.identifier_constant(self.previous.clone());
        self.declare_variable();

        self.emit_bytes(OpCode::Class.to_byte(), name_constant);
        self.define_variable(name_constant);

        self.class_compilers.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);

            if Self::identifier_equal(&class_name, &self.previous) {
                self.error("A class can't inherit from itself.");
            }

            // The superclass stays reachable for `super` through a synthetic
            // local in its own scope.
            self.begin_scope();
            self.add_local(synthetic_token("super"));
            self.define_variable(0);

            self.named_variable(class_name.clone(), false);
            self.emit_byte(OpCode::Inherit.to_byte());
            self.class_compilers.last_mut().expect("No class compiler.").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop.to_byte());

        if self.class_compilers.last().expect("No class compiler.").has_superclass {
            self.end_scope();
        }
        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.clone());
        let function_type = if self.previous.value == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit_bytes(OpCode::Method.to_byte(), constant);
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        self.init_compiler(function_type);

        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                if self.current_function().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_function_mut().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = self.current_compiler().upvalues.clone();
        let function = self.end_compiler();
        let constant = self.make_constant(make_object_value(function as *mut Object));
        self.emit_bytes(OpCode::Closure.to_byte(), constant);

        for upvalue in upvalues.iter() {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index as u8);
        }
    }

    fn variable_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);

        self.declare_variable();
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.clone())
    }

    fn declare_variable(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }

        let variable_name = self.previous.clone();
        let scope_depth = self.current_compiler().scope_depth;
        let mut shadows_in_scope = false;
        for local in self.current_locals().iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if Self::identifier_equal(&variable_name, &local.name) {
                shadows_in_scope = true;
                break;
            }
        }
        if shadows_in_scope {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(variable_name);
    }

    fn add_local(&mut self, variable_name: Token<'a>) {
        if self.current_locals().len() >= UINT8_COUNT {
            self.error("Too many local variables in function.");
            return;
        }

        // Depth -1 marks the variable as declared but not yet initialized;
        // mark_initialized patches it once the initializer has been compiled.
        self.current_locals_mut().push(Local {
            name: variable_name,
            depth: -1,
            is_captured: false,
        });
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_bytes(OpCode::DefineGlobal.to_byte(), global);
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }
        self.current_locals_mut()
            .last_mut()
            .expect("No local to initialize.")
            .depth = scope_depth;
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.clone(), can_assign)
    }

    fn named_variable(&mut self, name: Token<'a>, can_assign: bool) {
        let mut opcode_get = OpCode::GetLocal.to_byte();
        let mut opcode_set = OpCode::SetLocal.to_byte();
        let current_compiler_index = self.compilers.len() - 1;
        let mut index = self.resolve_local(current_compiler_index, &name);
        if index == -1 {
            index = self.resolve_upvalue(current_compiler_index, &name);
            if index == -1 {
                index = self.identifier_constant(name) as i32;
                opcode_get = OpCode::GetGlobal.to_byte();
                opcode_set = OpCode::SetGlobal.to_byte();
            } else {
                opcode_get = OpCode::GetUpvalue.to_byte();
                opcode_set = OpCode::SetUpvalue.to_byte();
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(opcode_set, index as u8);
        } else {
            self.emit_bytes(opcode_get, index as u8);
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token) -> i32 {
        let mut found = -1;
        let mut in_own_initializer = false;
        for (index, local) in self.specific_compiler(compiler_index).locals.iter().enumerate().rev() {
            if Self::identifier_equal(name, &local.name) {
                found = index as i32;
                in_own_initializer = local.depth == -1;
                break;
            }
        }
        if in_own_initializer {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> i32 {
        if compiler_index == 0 {
            return -1;
        }

        let local = self.resolve_local(compiler_index - 1, name);
        if local != -1 {
            self.specific_compiler_mut(compiler_index - 1).locals[local as usize].is_captured = true;
            return self.add_upvalue(compiler_index, local as usize, true) as i32;
        }

        let upvalue = self.resolve_upvalue(compiler_index - 1, name);
        if upvalue != -1 {
            return self.add_upvalue(compiler_index, upvalue as usize, false) as i32;
        }

        -1
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: usize, is_local: bool) -> usize {
        let compiler = self.specific_compiler(compiler_index);
        for (existing_index, upvalue) in compiler.upvalues.iter().enumerate() {
            if upvalue.is_local == is_local && upvalue.index == index {
                return existing_index;
            }
        }

        if compiler.upvalues.len() >= UINT8_COUNT {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let compiler = self.specific_compiler_mut(compiler_index);
        compiler.upvalues.push(Upvalue { index, is_local });
        compiler.function.upvalue_count = compiler.upvalues.len();
        compiler.function.upvalue_count - 1
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::Throw) {
            self.throw_statement();
        } else {
            self.expression_statement();
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.statement();

        let else_jump = self.emit_jump_bytes(OpCode::Jump.to_byte());
        self.patch_jump_offset(then_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump_offset(else_jump);
    }

    fn emit_jump_bytes(&mut self, instruction: u8) -> u16 {
        self.emit_byte(instruction);
        // Two placeholder bytes for the offset operand.
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        (self.current_function().chunk.len() - 2) as u16
    }

    fn patch_jump_offset(&mut self, offset: u16) {
        // -2 to adjust for the offset operand itself.
        let jump_offset = self.current_function().chunk.len() - offset as usize - 2;
        if jump_offset > u16::MAX.into() {
            self.error("Too much code to jump over.");
        }

        let chunk = &mut self.current_function_mut().chunk;
        chunk.write_by_offset(offset as usize, ((jump_offset >> 8) & 0xff) as u8);
        chunk.write_by_offset(offset as usize + 1, (jump_offset & 0xff) as u8);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop.to_byte());

        // +2 to hop over the Loop operand as well.
        let offset = self.current_function().chunk.len() - loop_start + 2;
        if offset > u16::MAX.into() {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        let scope_depth = self.current_compiler().scope_depth;
        loop {
            let (depth, is_captured) = match self.current_locals().last() {
                Some(local) => (local.depth, local.is_captured),
                None => break,
            };
            if depth <= scope_depth {
                break;
            }

            // Captured locals are hoisted into their upvalues instead of
            // being discarded.
            if is_captured {
                self.emit_byte(OpCode::CloseUpvalue.to_byte());
            } else {
                self.emit_byte(OpCode::Pop.to_byte());
            }
            self.current_locals_mut().pop();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }

        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return.to_byte());
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print.to_byte());
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after thrown value.");
        self.emit_byte(OpCode::Throw.to_byte());
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_function().chunk.len();

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());

        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump_offset(exit_jump);
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_function().chunk.len();
        let mut exit_jump: i32 = -1;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            exit_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte()) as i32;
            self.emit_byte(OpCode::Pop.to_byte());
        }

        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump_bytes(OpCode::Jump.to_byte());
            let increment_start = self.current_function().chunk.len();
            self.expression();
            self.emit_byte(OpCode::Pop.to_byte());
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump_offset(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if exit_jump != -1 {
            self.patch_jump_offset(exit_jump as u16);
            self.emit_byte(OpCode::Pop.to_byte());
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn unary(&mut self) {
        let operator_type = self.previous.token_type;

        self.parse_precedence(Precedence::Unary);

        match operator_type {
            TokenType::Bang => self.emit_byte(OpCode::Not.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Negate.to_byte()),
            _ => unreachable!("Expect unary operator."),
        }
    }

    fn binary(&mut self) {
        let operator_type = self.previous.token_type;
        let rule = &RULES[operator_type as usize];
        self.parse_precedence((rule.precedence as u8 + 1).into());

        match operator_type {
            TokenType::BangEqual => self.emit_bytes(OpCode::Equal.to_byte(), OpCode::Not.to_byte()),
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal.to_byte()),
            TokenType::Greater => self.emit_byte(OpCode::Greater.to_byte()),
            TokenType::GreaterEqual => self.emit_bytes(OpCode::Less.to_byte(), OpCode::Not.to_byte()),
            TokenType::Less => self.emit_byte(OpCode::Less.to_byte()),
            TokenType::LessEqual => self.emit_bytes(OpCode::Greater.to_byte(), OpCode::Not.to_byte()),
            TokenType::Plus => self.emit_byte(OpCode::Add.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Subtract.to_byte()),
            TokenType::Star => self.emit_byte(OpCode::Multiply.to_byte()),
            TokenType::Slash => self.emit_byte(OpCode::Divide.to_byte()),
            _ => unreachable!("Unexpected binary operator: {}", operator_type),
        }
    }

    fn literal(&mut self) {
        match self.previous.token_type {
            TokenType::False => self.emit_byte(OpCode::False.to_byte()),
            TokenType::True => self.emit_byte(OpCode::True.to_byte()),
            TokenType::Nil => self.emit_byte(OpCode::Nil.to_byte()),
            _ => unreachable!("Unexpected literal operator: {}", self.previous.token_type),
        }
    }

    fn number(&mut self) {
        let value = self.previous.value.parse::<f64>().unwrap_or(0.0);
        self.emit_constant(make_number_value(value));
    }

    fn string(&mut self) {
        // Trim the surrounding quotation marks.
        let content = &self.previous.value[1..self.previous.value.len() - 1];
        let value = make_string_value(self.object_manager, self.intern_strings, content);
        self.emit_constant(value);
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::And);
        self.patch_jump_offset(end_jump);
    }

    fn or(&mut self) {
        let end_jump = self.emit_jump_bytes(OpCode::JumpIfTrue.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::Or);
        self.patch_jump_offset(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argument_count = self.argument_list();
        self.emit_bytes(OpCode::Call.to_byte(), argument_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.clone());

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty.to_byte(), name);
        } else if self.match_token(TokenType::LeftParen) {
            // Fused access-and-call avoids materialising a bound method.
            let argument_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke.to_byte(), name);
            self.emit_byte(argument_count);
        } else {
            self.emit_bytes(OpCode::GetProperty.to_byte(), name);
        }
    }

    fn this(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.class_compilers.last().expect("No class compiler.").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.clone());

        self.named_variable(synthetic_token("this"), false);
        if self.match_token(TokenType::LeftParen) {
            let argument_count = self.argument_list();
            self.named_variable(synthetic_token("super"), false);
            self.emit_bytes(OpCode::SuperInvoke.to_byte(), name);
            self.emit_byte(argument_count);
        } else {
            self.named_variable(synthetic_token("super"), false);
            self.emit_bytes(OpCode::GetSuper.to_byte(), name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argument_count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argument_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argument_count += 1;
                }

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        argument_count as u8
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        if let Some(prefix) = &RULES[self.previous.token_type as usize].prefix {
            prefix(self, can_assign);
        } else {
            self.error("Expect expression.");
            return;
        }

        while precedence as u8 <= RULES[self.current.token_type as usize].precedence as u8 {
            self.advance();
            if let Some(infix) = &RULES[self.previous.token_type as usize].infix {
                infix(self, can_assign);
            } else {
                self.error("Expect infix parse function.");
                return;
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }

            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => (),
            }

            self.advance()
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(&self.previous.clone(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(&self.current.clone(), message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        let mut stderr = std::io::stderr();
        write!(stderr, "[line {}] Error", token.line).expect("Failed to write to stderr");

        match token.token_type {
            TokenType::Eof => write!(stderr, " at end").expect("Failed to write to stderr"),
            TokenType::Error => {}
            _ => write!(stderr, " at '{}'", token.value).expect("Failed to write to stderr"),
        };

        writeln!(stderr, ": {}", message).expect("Failed to write to stderr");
        self.has_error = true;
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn disassemble_function(parser: &Parser, function: *mut ObjectFunction) {
        if parser.has_error {
            return;
        }
        let function = unsafe { &*function };
        let name = if function.name.is_empty() {
            "<script>"
        } else {
            function.name.as_str()
        };
        debug::disassemble_chunk(&function.chunk, name);
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble_function(_parser: &Parser, _function: *mut ObjectFunction) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, ValueType};

    fn compile_source(source: &str) -> (ObjectManager, Table, Option<*mut ObjectFunction>) {
        let mut object_manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let function = {
            let mut parser = Parser::new(&mut object_manager, &mut intern_strings);
            parser.compile(source)
        };
        (object_manager, intern_strings, function)
    }

    #[test]
    fn test_compile_expression_bytecode() {
        let (_manager, _strings, function) = compile_source("!(5 - 4 > 3 * 2 == !nil);");
        let function = function.expect("expression should compile");
        let chunk = unsafe { &(*function).chunk };

        assert_eq!(chunk.get_constant(0).value_type, ValueType::ValueNumber);
        assert_eq!(as_number(chunk.get_constant(0)), 5.0);
        assert_eq!(as_number(chunk.get_constant(1)), 4.0);

        let expected = [
            OpCode::Constant.to_byte(),
            0,
            OpCode::Constant.to_byte(),
            1,
            OpCode::Subtract.to_byte(),
            OpCode::Constant.to_byte(),
            2,
            OpCode::Constant.to_byte(),
            3,
            OpCode::Multiply.to_byte(),
            OpCode::Greater.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Equal.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Pop.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Return.to_byte(),
        ];
        for (offset, &byte) in expected.iter().enumerate() {
            assert_eq!(chunk.read_from_offset(offset), Some(byte), "mismatch at offset {}", offset);
        }
    }

    #[test]
    fn test_intern_strings_across_compiles() {
        let mut object_manager = ObjectManager::new();
        let mut intern_strings = Table::new();

        let result = {
            let mut parser = Parser::new(&mut object_manager, &mut intern_strings);
            parser.compile("\"this is a test string\";")
        };
        assert!(result.is_some());

        let result = {
            let mut parser = Parser::new(&mut object_manager, &mut intern_strings);
            parser.compile("\"this is a test string\";")
        };
        assert!(result.is_some());

        assert_eq!(intern_strings.len(), 1);
    }

    #[test]
    fn test_function_declaration_compiles() {
        let (_manager, _strings, function) = compile_source(
            "fun sum(a, b, c) {
                return a + b + c;
            }
            print sum(5, 6, 7);",
        );
        assert!(function.is_some());
    }

    #[test]
    fn test_closure_capture_compiles() {
        let (_manager, _strings, function) = compile_source(
            "fun outer() {
                var captured = 1;
                fun inner() {
                    captured = captured + 1;
                    return captured;
                }
                return inner;
            }",
        );
        assert!(function.is_some());
    }

    #[test]
    fn test_class_grammar_compiles() {
        let (_manager, _strings, function) = compile_source(
            "class Base {
                init(value) {
                    this.value = value;
                }
                describe() {
                    return this.value;
                }
            }
            class Derived < Base {
                describe() {
                    return super.describe() + 1;
                }
            }
            var d = Derived(41);
            print d.describe();",
        );
        assert!(function.is_some());
    }

    #[test]
    fn test_syntax_error_reports_none() {
        let (_manager, _strings, function) = compile_source("var 1 = 2;");
        assert!(function.is_none());
    }

    #[test]
    fn test_return_at_top_level_is_an_error() {
        let (_manager, _strings, function) = compile_source("return 1;");
        assert!(function.is_none());
    }

    #[test]
    fn test_this_outside_class_is_an_error() {
        let (_manager, _strings, function) = compile_source("print this;");
        assert!(function.is_none());
    }

    #[test]
    fn test_super_without_superclass_is_an_error() {
        let (_manager, _strings, function) = compile_source(
            "class Alone {
                method() {
                    return super.method();
                }
            }",
        );
        assert!(function.is_none());
    }

    #[test]
    fn test_initializer_cannot_return_a_value() {
        let (_manager, _strings, function) = compile_source(
            "class Broken {
                init() {
                    return 1;
                }
            }",
        );
        assert!(function.is_none());
    }

    #[test]
    fn test_constant_limit() {
        // 201 distinct numbers plus one identifier stay within the budget.
        let mut small = String::from("var pad = 0");
        for index in 1..=200 {
            small.push_str(&format!(" + {}", index));
        }
        small.push(';');
        let (_manager, _strings, function) = compile_source(&small);
        assert!(function.is_some());

        // 300 distinct numbers overflow the one-byte constant operand.
        let mut large = String::from("var pad = 0");
        for index in 1..300 {
            large.push_str(&format!(" + {}", index));
        }
        large.push(';');
        let (_manager, _strings, function) = compile_source(&large);
        assert!(function.is_none());
    }

    #[test]
    fn test_compiler_roots_are_markable() {
        let mut object_manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let mut parser = Parser::new(&mut object_manager, &mut intern_strings);
        // Mid-construction parser state must be markable without a crash.
        let mut gc = GarbageCollector::new();
        parser.mark_roots(&mut gc);
        let result = parser.compile("var greeting = \"hello\";");
        assert!(result.is_some());
    }
}
