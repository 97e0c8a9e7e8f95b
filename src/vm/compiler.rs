//! Single-pass Pratt compiler: scanner tokens in, bytecode out.
//!
//! The language is expression-oriented, so declaration and control-flow
//! forms are prefix parse rules like any other expression: each one leaves
//! exactly one value on the stack, and statement glue pops it. Blocks keep
//! the stack neutral with a `Pop` between units; the last dangling
//! expression before `}` becomes the block's value.
//!
//! Nested function bodies are compiled by a stack of per-function states
//! (locals, upvalue descriptors, scope depth); name resolution walks that
//! stack outward, capturing enclosing locals as upvalues on the way.

use std::fmt;

use crate::scanner::{Scanner, Token, TokenKind};

use super::chunk::{Chunk, OpCode};
use super::object::{Heap, Obj, ObjFunction, ObjRef};
use super::value::Value;

/// Local and upvalue slots are addressed by a single byte.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compilation failed; diagnostics already went to stderr.
#[derive(Debug)]
pub struct CompileError;

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compile error")
    }
}

// ---------------------------------------------------------------------------
// Precedence & parse rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // not -
    Call,       // . () []
    Primary,
}

impl Precedence {
    /// One level tighter; binary operators recurse here for
    /// left-associativity.
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn = for<'src, 'h> fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> ParseRule {
    ParseRule { prefix, infix, precedence }
}

fn get_rule(kind: TokenKind) -> ParseRule {
    use Precedence as P;
    use TokenKind as K;
    match kind {
        K::LeftParen => rule(Some(grouping), Some(call), P::Call),
        K::LeftBrace => rule(Some(block_expr), None, P::None),
        K::LeftSquare => rule(Some(list_literal), Some(index_expr), P::Call),
        K::Dot => rule(None, Some(dot), P::Call),
        K::Minus => rule(Some(unary), Some(binary), P::Term),
        K::Plus => rule(None, Some(binary), P::Term),
        K::Slash | K::Star => rule(None, Some(binary), P::Factor),
        K::Not => rule(Some(unary), None, P::None),
        K::BangEqual | K::EqualEqual => rule(None, Some(binary), P::Equality),
        K::Greater | K::GreaterEqual | K::Less | K::LessEqual => {
            rule(None, Some(binary), P::Comparison)
        }
        K::Identifier => rule(Some(variable), None, P::None),
        K::String => rule(Some(string_literal), None, P::None),
        K::Number => rule(Some(number_literal), None, P::None),
        K::And => rule(None, Some(and_expr), P::And),
        K::Or => rule(None, Some(or_expr), P::Or),
        K::False | K::Nil | K::None | K::True => rule(Some(literal), None, P::None),
        K::Some => rule(Some(some_expr), None, P::None),
        K::Class => rule(Some(class_declaration), None, P::None),
        K::For => rule(Some(for_statement), None, P::None),
        K::Func => rule(Some(func_declaration), None, P::None),
        K::If => rule(Some(if_statement), None, P::None),
        K::Print => rule(Some(print_statement), None, P::None),
        K::Return => rule(Some(return_statement), None, P::None),
        K::Super => rule(Some(super_expr), None, P::None),
        K::This => rule(Some(this_expr), None, P::None),
        K::Var => rule(Some(var_declaration), None, P::None),
        K::While => rule(Some(while_statement), None, P::None),
        _ => rule(None, None, P::None),
    }
}

// ---------------------------------------------------------------------------
// Per-function compile state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Initializer,
    Method,
    Script,
}

struct Local<'src> {
    name: &'src str,
    /// -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FuncState<'src> {
    kind: FunctionKind,
    arity: usize,
    chunk: Chunk,
    name: Option<ObjRef>,
    upvalues: Vec<UpvalueDesc>,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
}

struct ClassState {
    has_superclass: bool,
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'h mut Heap,
    funcs: Vec<FuncState<'src>>,
    classes: Vec<ClassState>,
}

/// Compile a source string into the top-level script function. Errors have
/// already been reported to stderr when this returns `Err`.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let eof = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        current: eof,
        previous: eof,
        had_error: false,
        panic_mode: false,
        heap,
        funcs: Vec::new(),
        classes: Vec::new(),
    };
    compiler.push_func(FunctionKind::Script, Option::None);

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.statement();
    }

    let function = compiler.end_func().0;
    if compiler.had_error {
        return Err(CompileError);
    }
    Ok(compiler.heap.allocate(Obj::Function(function)))
}

impl<'src, 'h> Compiler<'src, 'h> {
    // -- Function state stack --

    fn push_func(&mut self, kind: FunctionKind, name: Option<&str>) {
        let name = name.map(|n| self.heap.intern(n.as_bytes()));
        let mut locals = Vec::with_capacity(8);
        // Slot zero belongs to the callee; methods see it as `this`.
        locals.push(Local {
            name: if kind == FunctionKind::Function { "" } else { "this" },
            depth: 0,
            is_captured: false,
        });
        self.funcs.push(FuncState {
            kind,
            arity: 0,
            chunk: Chunk::new(),
            name,
            upvalues: Vec::new(),
            locals,
            scope_depth: 0,
        });
    }

    fn end_func(&mut self) -> (ObjFunction, Vec<UpvalueDesc>) {
        self.emit_return();
        let state = match self.funcs.pop() {
            Option::Some(state) => state,
            Option::None => unreachable!("function state stack underflow"),
        };
        let function = ObjFunction {
            arity: state.arity,
            upvalue_count: state.upvalues.len(),
            chunk: state.chunk,
            name: state.name,
        };
        (function, state.upvalues)
    }

    fn func(&self) -> &FuncState<'src> {
        &self.funcs[self.funcs.len() - 1]
    }

    fn func_mut(&mut self) -> &mut FuncState<'src> {
        let last = self.funcs.len() - 1;
        &mut self.funcs[last]
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.func_mut().chunk
    }

    // -- Token plumbing --

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // -- Errors --

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);
        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Func | Var | For | If | While | Print | Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- Emission --

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.func().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    /// Emit a jump with a placeholder offset; returns the offset's position
    /// for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.func().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the offset bytes themselves.
        let jump = self.func().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.chunk_mut();
        chunk.code[offset] = (jump >> 8) as u8;
        chunk.code[offset + 1] = jump as u8;
    }

    fn emit_return(&mut self) {
        if self.func().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let constant = self.chunk_mut().add_constant(value);
        if constant > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let s = self.heap.intern(name.as_bytes());
        self.make_constant(Value::obj(s))
    }

    // -- Scopes, locals, upvalues --

    fn begin_scope(&mut self) {
        self.func_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func_mut().scope_depth -= 1;
        loop {
            let func = self.func();
            let Option::Some(local) = func.locals.last() else { break };
            if local.depth <= func.scope_depth {
                break;
            }
            let captured = local.is_captured;
            self.func_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Close a scope whose last expression is the scope's value. The value
    /// sits above the dying locals, so it is parked in the reserve register
    /// while they are popped (or closed) off the top.
    fn end_scope_preserving(&mut self) {
        let depth = self.func().scope_depth;
        let has_locals = self.func().locals.last().is_some_and(|l| l.depth >= depth);
        if has_locals {
            self.emit_op(OpCode::SetReserve);
            self.end_scope();
            self.emit_op(OpCode::GetReserve);
        } else {
            self.end_scope();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.func().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.func_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.func().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let func = self.func();
        let mut duplicate = false;
        for local in func.locals.iter().rev() {
            if local.depth != -1 && local.depth < func.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.func().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let func = self.func_mut();
        if func.scope_depth == 0 {
            return;
        }
        let depth = func.scope_depth;
        if let Option::Some(local) = func.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.func().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, func_index: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = Option::None;
        for (i, local) in self.funcs[func_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Option::Some(i as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        if let Option::Some(existing) =
            self.funcs[func_index].upvalues.iter().position(|u| *u == desc)
        {
            return existing as u8;
        }
        if self.funcs[func_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.funcs[func_index].upvalues.push(desc);
        (self.funcs[func_index].upvalues.len() - 1) as u8
    }

    /// Resolve a name against enclosing functions, threading a chain of
    /// upvalues inward. Marks the captured local on the way.
    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return Option::None;
        }
        let enclosing = func_index - 1;

        if let Option::Some(local) = self.resolve_local(enclosing, name) {
            self.funcs[enclosing].locals[local as usize].is_captured = true;
            return Option::Some(self.add_upvalue(func_index, local, true));
        }

        if let Option::Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Option::Some(self.add_upvalue(func_index, upvalue, false));
        }

        Option::None
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let func_index = self.funcs.len() - 1;
        let (get_op, set_op, arg) = if let Option::Some(arg) = self.resolve_local(func_index, name)
        {
            (OpCode::GetLocal, OpCode::SetLocal, arg)
        } else if let Option::Some(arg) = self.resolve_upvalue(func_index, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, arg)
        } else {
            let arg = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, arg)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // -- Expression entry points --

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Option::Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            if let Option::Some(infix) = get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    // -- Statements & blocks --

    /// One unit inside a block or at top level that is introduced by a
    /// keyword; expression units are handled by the callers.
    fn statement(&mut self) {
        if self.match_token(TokenKind::Class) {
            class_declaration(self, false);
        } else if self.match_token(TokenKind::For) {
            for_statement(self, false);
        } else if self.match_token(TokenKind::Func) {
            func_declaration(self, false);
        } else if self.match_token(TokenKind::If) {
            if_statement(self, false);
        } else if self.match_token(TokenKind::Print) {
            print_statement(self, false);
        } else if self.match_token(TokenKind::Return) {
            return_statement(self, false);
        } else if self.match_token(TokenKind::Var) {
            var_declaration(self, false);
        } else if self.match_token(TokenKind::While) {
            while_statement(self, false);
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope_preserving();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        }

        // Every statement form leaves exactly one value; discard it here.
        self.emit_op(OpCode::Pop);

        if self.panic_mode {
            self.synchronize();
        }
    }

    /// The body of `{ ... }`: statements and expressions, one `Pop` between
    /// units, the last dangling expression is the block's value.
    fn block(&mut self) {
        if self.check(TokenKind::RightBrace) {
            self.emit_op(OpCode::Nil); // empty block
        }
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Class) {
                class_declaration(self, false);
            } else if self.match_token(TokenKind::For) {
                for_statement(self, false);
            } else if self.match_token(TokenKind::Func) {
                func_declaration(self, false);
            } else if self.match_token(TokenKind::If) {
                if_statement(self, false);
            } else if self.match_token(TokenKind::Print) {
                print_statement(self, false);
            } else if self.match_token(TokenKind::Return) {
                return_statement(self, false);
            } else if self.match_token(TokenKind::Var) {
                var_declaration(self, false);
            } else if self.match_token(TokenKind::While) {
                while_statement(self, false);
            } else if self.match_token(TokenKind::LeftBrace) {
                self.begin_scope();
                self.block();
                self.end_scope_preserving();
            } else {
                self.expression();
                if !self.match_token(TokenKind::Semicolon) && !self.check(TokenKind::RightBrace) {
                    self.error_at_current("Expect ';' or '}' at end of expression.");
                }
            }
            if !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
                self.emit_op(OpCode::Pop);
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    // -- Functions, methods, classes --

    fn function(&mut self, kind: FunctionKind, name: Option<&str>) {
        self.push_func(kind, name);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.func_mut().arity += 1;
                if self.func().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_func();
        let r = self.heap.allocate(Obj::Function(function));
        let constant = self.make_constant(Value::obj(r));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);

        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, Option::Some(name));
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn dict_literal(&mut self) {
        let mut entry_count: usize = 0;
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'dict'.");
        if !self.check(TokenKind::RightBrace) {
            loop {
                if entry_count == 255 {
                    self.error("Can't have more than 255 elements.");
                }
                entry_count += 1;
                self.expression();
                self.consume(TokenKind::FatArrow, "Expect '=>' after dict key.");
                self.expression();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after dict elements.");
        self.emit_op_byte(OpCode::Dict, entry_count.min(255) as u8);
    }
}

// ---------------------------------------------------------------------------
// Parse rule functions
// ---------------------------------------------------------------------------

fn grouping(c: &mut Compiler, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn call(c: &mut Compiler, _can_assign: bool) {
    let arg_count = c.argument_list();
    c.emit_op_byte(OpCode::Call, arg_count);
}

fn list_literal(c: &mut Compiler, _can_assign: bool) {
    let mut elem_count: usize = 0;
    if !c.check(TokenKind::RightSquare) {
        loop {
            c.expression();
            if elem_count == 255 {
                c.error("Can't have more than 255 elements.");
            }
            elem_count += 1;
            if !c.match_token(TokenKind::Comma) {
                break;
            }
        }
    }
    c.consume(TokenKind::RightSquare, "Expect ']' after list elements.");
    c.emit_op_byte(OpCode::List, elem_count.min(255) as u8);
}

fn index_expr(c: &mut Compiler, can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightSquare, "Expect ']' after index.");
    if can_assign && c.match_token(TokenKind::Equal) {
        c.expression();
        c.emit_op(OpCode::SetIndex);
    } else {
        c.emit_op(OpCode::GetIndex);
    }
}

fn dot(c: &mut Compiler, can_assign: bool) {
    c.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let name = c.identifier_constant(c.previous.lexeme);
    if can_assign && c.match_token(TokenKind::Equal) {
        c.expression();
        c.emit_op_byte(OpCode::SetProperty, name);
    } else if c.match_token(TokenKind::LeftParen) {
        let arg_count = c.argument_list();
        c.emit_op_byte(OpCode::Invoke, name);
        c.emit_byte(arg_count);
    } else {
        c.emit_op_byte(OpCode::GetProperty, name);
    }
}

fn unary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous.kind;
    c.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Not => c.emit_op(OpCode::Not),
        TokenKind::Minus => c.emit_op(OpCode::Negate),
        _ => unreachable!("unary dispatched on non-unary token"),
    }
}

fn some_expr(c: &mut Compiler, _can_assign: bool) {
    c.parse_precedence(Precedence::Unary);
    c.emit_op(OpCode::Some);
}

fn binary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous.kind;
    // One level higher gives left-associativity.
    c.parse_precedence(get_rule(operator).precedence.next());

    use OpCode::*;
    match operator {
        TokenKind::BangEqual => {
            c.emit_op(Equal);
            c.emit_op(Not);
        }
        TokenKind::EqualEqual => c.emit_op(Equal),
        TokenKind::Greater => c.emit_op(Greater),
        TokenKind::GreaterEqual => {
            c.emit_op(Less);
            c.emit_op(Not);
        }
        TokenKind::Less => c.emit_op(Less),
        TokenKind::LessEqual => {
            c.emit_op(Greater);
            c.emit_op(Not);
        }
        TokenKind::Plus => c.emit_op(Add),
        TokenKind::Minus => c.emit_op(Subtract),
        TokenKind::Star => c.emit_op(Multiply),
        TokenKind::Slash => c.emit_op(Divide),
        _ => unreachable!("binary dispatched on non-binary token"),
    }
}

fn and_expr(c: &mut Compiler, _can_assign: bool) {
    let end_jump = c.emit_jump(OpCode::JumpIfFalse);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::And);
    c.patch_jump(end_jump);
}

fn or_expr(c: &mut Compiler, _can_assign: bool) {
    let else_jump = c.emit_jump(OpCode::JumpIfFalse);
    let end_jump = c.emit_jump(OpCode::Jump);
    c.patch_jump(else_jump);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::Or);
    c.patch_jump(end_jump);
}

fn literal(c: &mut Compiler, _can_assign: bool) {
    match c.previous.kind {
        TokenKind::False => c.emit_op(OpCode::False),
        TokenKind::Nil => c.emit_op(OpCode::Nil),
        TokenKind::True => c.emit_op(OpCode::True),
        TokenKind::None => {
            let none = c.heap.none_option();
            c.emit_constant(Value::obj(none));
        }
        _ => unreachable!("literal dispatched on non-literal token"),
    }
}

fn number_literal(c: &mut Compiler, _can_assign: bool) {
    let value: f64 = c.previous.lexeme.parse().unwrap_or_default();
    c.emit_constant(Value::number(value));
}

fn string_literal(c: &mut Compiler, _can_assign: bool) {
    let lexeme = c.previous.lexeme;
    let s = c.heap.intern(lexeme[1..lexeme.len() - 1].as_bytes());
    c.emit_constant(Value::obj(s));
}

fn variable(c: &mut Compiler, can_assign: bool) {
    // `dict` is a soft keyword: only special directly before `{`.
    if c.previous.lexeme == "dict" && c.check(TokenKind::LeftBrace) {
        c.dict_literal();
    } else {
        let name = c.previous.lexeme;
        c.named_variable(name, can_assign);
    }
}

fn super_expr(c: &mut Compiler, _can_assign: bool) {
    match c.classes.last().map(|class| class.has_superclass) {
        Option::None => c.error("Can't use 'super' outside of a class."),
        Option::Some(false) => c.error("Can't use 'super' in a class with no superclass."),
        Option::Some(true) => {}
    }

    c.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    c.consume(TokenKind::Identifier, "Expect superclass method name.");
    let name = c.identifier_constant(c.previous.lexeme);

    c.named_variable("this", false);
    if c.match_token(TokenKind::LeftParen) {
        let arg_count = c.argument_list();
        c.named_variable("super", false);
        c.emit_op_byte(OpCode::SuperInvoke, name);
        c.emit_byte(arg_count);
    } else {
        c.named_variable("super", false);
        c.emit_op_byte(OpCode::GetSuper, name);
    }
}

fn this_expr(c: &mut Compiler, _can_assign: bool) {
    if c.classes.is_empty() {
        c.error("Can't use 'this' outside of a class.");
        return;
    }
    variable(c, false);
}

fn block_expr(c: &mut Compiler, _can_assign: bool) {
    c.begin_scope();
    c.block();
    c.end_scope_preserving();
}

// -- Declarations & control flow (expression-positioned) --

fn class_declaration(c: &mut Compiler, _can_assign: bool) {
    c.consume(TokenKind::Identifier, "Expect class name.");
    let class_name = c.previous.lexeme;
    let name_constant = c.identifier_constant(class_name);
    c.declare_variable();

    c.emit_op_byte(OpCode::Class, name_constant);
    c.define_variable(name_constant);

    c.classes.push(ClassState { has_superclass: false });

    if c.match_token(TokenKind::Less) {
        c.consume(TokenKind::Identifier, "Expect superclass name.");
        variable(c, false);

        if class_name == c.previous.lexeme {
            c.error("A class can't inherit from itself.");
        }

        c.begin_scope();
        c.add_local("super");
        c.define_variable(0);

        c.named_variable(class_name, false);
        c.emit_op(OpCode::Inherit);
        if let Option::Some(class) = c.classes.last_mut() {
            class.has_superclass = true;
        }
    }

    c.named_variable(class_name, false);
    c.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
    while !c.check(TokenKind::RightBrace) && !c.check(TokenKind::Eof) {
        c.method();
    }
    c.consume(TokenKind::RightBrace, "Expect '}' after class body.");

    let has_superclass = c.classes.last().map(|cl| cl.has_superclass).unwrap_or(false);
    if has_superclass {
        // The loaded class value sits above the `super` local.
        c.end_scope_preserving();
    }
    c.classes.pop();
}

fn func_declaration(c: &mut Compiler, _can_assign: bool) {
    if c.check(TokenKind::Identifier) {
        let global = c.parse_variable("Expect function name.");
        let func_name = c.previous.lexeme;
        c.mark_initialized();
        c.function(FunctionKind::Function, Option::Some(func_name));
        c.define_variable(global);
        c.named_variable(func_name, false);
    } else {
        c.function(FunctionKind::Function, Option::Some("anonymous"));
    }
}

fn var_declaration(c: &mut Compiler, _can_assign: bool) {
    let global = c.parse_variable("Expect variable name.");
    let var_name = c.previous.lexeme;
    if c.match_token(TokenKind::Equal) {
        c.expression();
    } else {
        c.emit_op(OpCode::Nil);
    }
    c.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
    c.define_variable(global);
    // The declaration is itself an expression: reload the defined value.
    c.named_variable(var_name, false);
}

fn if_statement(c: &mut Compiler, _can_assign: bool) {
    c.expression();

    let then_jump = c.emit_jump(OpCode::JumpIfFalse);
    c.emit_op(OpCode::Pop);
    c.consume(TokenKind::LeftBrace, "Expected '{' for 'if' body");
    c.block();
    let else_jump = c.emit_jump(OpCode::Jump);
    c.patch_jump(then_jump);
    c.emit_op(OpCode::Pop);

    if c.match_token(TokenKind::Else) {
        c.consume(TokenKind::LeftBrace, "Expected '{' for 'if' body");
        c.block();
    } else {
        // No else branch: the false edge still owes the expression a value.
        c.emit_op(OpCode::Nil);
    }
    c.patch_jump(else_jump);
}

fn while_statement(c: &mut Compiler, _can_assign: bool) {
    // Placeholder value of the loop expression as a whole.
    c.emit_op(OpCode::Nil);

    let loop_start = c.func().chunk.code.len();
    c.expression();

    let exit_jump = c.emit_jump(OpCode::JumpIfFalse);
    // Condition and the previous iteration's value.
    c.emit_op(OpCode::Pop);
    c.emit_op(OpCode::Pop);
    c.consume(TokenKind::LeftBrace, "Expected '{' for 'while' body");
    c.block();
    c.emit_loop(loop_start);

    c.patch_jump(exit_jump);
    c.emit_op(OpCode::Pop);
}

fn for_statement(c: &mut Compiler, _can_assign: bool) {
    c.begin_scope();
    let global = c.parse_variable("Expect variable name after 'for'.");
    let var_name = c.previous.lexeme;
    c.emit_op(OpCode::Nil);
    c.define_variable(global);
    c.consume(TokenKind::In, "Expect 'in' after variable name.");

    c.expression();
    c.emit_op_byte(OpCode::Int, 0);

    let loop_start = c.func().chunk.code.len();
    let exit_jump = c.emit_jump(OpCode::NextJump);

    // Store the element produced by NextJump into the loop variable.
    let func_index = c.funcs.len() - 1;
    if let Option::Some(arg) = c.resolve_local(func_index, var_name) {
        c.emit_op_byte(OpCode::SetLocal, arg);
    } else if let Option::Some(arg) = c.resolve_upvalue(func_index, var_name) {
        c.emit_op_byte(OpCode::SetUpvalue, arg);
    } else {
        let arg = c.identifier_constant(var_name);
        c.emit_op_byte(OpCode::SetGlobal, arg);
    }
    c.emit_op(OpCode::Pop);

    c.consume(TokenKind::LeftBrace, "Expected '{' for 'for' body");
    c.block();
    c.emit_op(OpCode::Pop);

    c.emit_loop(loop_start);
    c.patch_jump(exit_jump);
    c.end_scope();
}

fn print_statement(c: &mut Compiler, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::Semicolon, "Expect ';' after value.");
    c.emit_op(OpCode::Print);
}

fn return_statement(c: &mut Compiler, _can_assign: bool) {
    if c.func().kind == FunctionKind::Script {
        c.error("Can't return from top-level code.");
    }

    if c.match_token(TokenKind::Semicolon) {
        c.emit_return();
    } else {
        if c.func().kind == FunctionKind::Initializer {
            c.error("Can't return a value from an initializer.");
        }
        c.expression();
        c.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        c.emit_op(OpCode::Return);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
