use std::rc::Rc;

use tracing::debug;

use crate::chunk::Chunk;
use crate::error::{CompileErrors, Diagnostic};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::opcode::OpCode;
use crate::value::{FunctionObj, Obj, ReturnKind, Value};
use crate::vm::Vm;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + - %
    Factor,     // * /
    Bitwise,    // & | ^ << >>
    Unary,      // ! - ~
    Call,       // . ( [
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Bitwise,
            Precedence::Bitwise => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

struct ParseRule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

fn get_rule<'a>(kind: TokenKind) -> ParseRule<'a> {
    let (prefix, infix, precedence): (Option<ParseFn<'a>>, Option<ParseFn<'a>>, Precedence) = match kind {
        TokenKind::LParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        TokenKind::LBracket => {
            (Some(Compiler::array_literal), Some(Compiler::object_access), Precedence::Call)
        }
        TokenKind::LBrace => (Some(Compiler::dict_literal), None, Precedence::None),
        TokenKind::Dot => (None, Some(Compiler::dot), Precedence::Call),
        TokenKind::Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        TokenKind::Plus => (None, Some(Compiler::binary), Precedence::Term),
        TokenKind::Percent => (None, Some(Compiler::binary), Precedence::Term),
        TokenKind::Slash => (None, Some(Compiler::binary), Precedence::Factor),
        TokenKind::Star => (None, Some(Compiler::binary), Precedence::Factor),
        TokenKind::Amp => (None, Some(Compiler::binary), Precedence::Bitwise),
        TokenKind::Pipe => (None, Some(Compiler::binary), Precedence::Bitwise),
        TokenKind::Caret => (None, Some(Compiler::binary), Precedence::Bitwise),
        TokenKind::ShiftLeft => (None, Some(Compiler::binary), Precedence::Bitwise),
        TokenKind::ShiftRight => (None, Some(Compiler::binary), Precedence::Bitwise),
        TokenKind::Tilde => (Some(Compiler::unary), None, Precedence::None),
        TokenKind::Bang => (Some(Compiler::unary), None, Precedence::None),
        TokenKind::BangEqual => (None, Some(Compiler::binary), Precedence::Equality),
        TokenKind::EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        TokenKind::Greater => (None, Some(Compiler::binary), Precedence::Comparison),
        TokenKind::GreaterEqual => (None, Some(Compiler::binary), Precedence::Comparison),
        TokenKind::Less => (None, Some(Compiler::binary), Precedence::Comparison),
        TokenKind::LessEqual => (None, Some(Compiler::binary), Precedence::Comparison),
        TokenKind::Ident => (Some(Compiler::variable), None, Precedence::None),
        TokenKind::String => (Some(Compiler::string), None, Precedence::None),
        TokenKind::Number => (Some(Compiler::number), None, Precedence::None),
        TokenKind::And => (None, Some(Compiler::and_), Precedence::And),
        TokenKind::Or => (None, Some(Compiler::or_), Precedence::Or),
        TokenKind::True => (Some(Compiler::literal), None, Precedence::None),
        TokenKind::False => (Some(Compiler::literal), None, Precedence::None),
        TokenKind::Nil => (Some(Compiler::literal), None, Precedence::None),
        TokenKind::Super => (Some(Compiler::super_), None, Precedence::None),
        TokenKind::This => (Some(Compiler::this_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule { prefix, infix, precedence }
}

struct Local {
    name: String,
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy)]
struct CompUpvalue {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// One function (or the top-level script) being compiled. The compiler keeps
/// a stack of these; resolution walks it outward for upvalue capture.
struct FnCompiler {
    kind: FunctionKind,
    name: Option<String>,
    arity: usize,
    return_kind: ReturnKind,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<CompUpvalue>,
    scope_depth: i32,
    // Shallow return-kind checking keys off what was just emitted.
    last_op: Option<OpCode>,
    last_constant: Option<Value>,
}

impl FnCompiler {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        // Slot 0 is reserved: it holds the receiver in methods and is never
        // a user-visible local.
        let slot0 = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            kind,
            name,
            arity: 0,
            return_kind: ReturnKind::None,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot0.to_string(), depth: 0, captured: false }],
            upvalues: vec![],
            scope_depth: 0,
            last_op: None,
            last_constant: None,
        }
    }
}

struct ClassFrame {
    has_superclass: bool,
}

pub struct Compiler<'a> {
    src: &'a str,
    lexer: Lexer<'a>,
    cur: Token,
    prev: Token,
    panic_mode: bool,
    errors: Vec<Diagnostic>,
    frames: Vec<FnCompiler>,
    classes: Vec<ClassFrame>,
    vm: &'a mut Vm,
}

impl<'a> Compiler<'a> {
    /// Compiles `source` to the top-level script function. Strings and nested
    /// functions are interned/allocated straight into the VM heap, so the
    /// returned function is ready to wrap in a closure and call.
    pub fn compile(source: &'a str, vm: &'a mut Vm) -> Result<FunctionObj, CompileErrors> {
        let mut c = Compiler {
            src: source,
            lexer: Lexer::new(source),
            cur: Token { kind: TokenKind::Eof, start: 0, end: 0, line: 1 },
            prev: Token { kind: TokenKind::Eof, start: 0, end: 0, line: 1 },
            panic_mode: false,
            errors: vec![],
            frames: vec![FnCompiler::new(FunctionKind::Script, None)],
            classes: vec![],
            vm,
        };

        c.advance();
        while !c.matches(TokenKind::Eof) {
            c.declaration();
        }
        let (function, _) = c.end_fn();
        debug!(bytes = function.chunk.code.len(), errors = c.errors.len(), "compiled script");

        if c.errors.is_empty() {
            Ok(function)
        } else {
            Err(CompileErrors(c.errors))
        }
    }

    // ── token plumbing ──────────────────────────────────────────────────

    fn text(&self, t: Token) -> &str {
        &self.src[t.start..t.end]
    }

    fn advance(&mut self) {
        self.prev = self.cur;
        loop {
            self.cur = self.lexer.next();
            match self.cur.kind {
                TokenKind::Error(msg) => self.error_at_current(msg),
                _ => break,
            }
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // ── diagnostics ─────────────────────────────────────────────────────

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let lexeme = match token.kind {
            TokenKind::Error(_) => None,
            _ => Some(self.text(token).to_string()),
        };
        self.errors.push(Diagnostic { line: token.line, lexeme, message: message.to_string() });
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.prev, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.cur, message);
    }

    /// Discard tokens until a statement boundary, then leave panic mode.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.cur.kind != TokenKind::Eof {
            if self.prev.kind == TokenKind::Semicolon {
                return;
            }
            match self.cur.kind {
                TokenKind::Class
                | TokenKind::Fn
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Out
                | TokenKind::Return
                | TokenKind::Import => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ── emission ────────────────────────────────────────────────────────

    fn frame(&self) -> &FnCompiler {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut FnCompiler {
        self.frames.last_mut().unwrap()
    }

    fn emit_byte(&mut self, b: u8) {
        let line = self.prev.line;
        self.frame_mut().chunk.write_byte(b, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.prev.line;
        let frame = self.frame_mut();
        frame.chunk.write_op(op, line);
        frame.last_op = Some(op);
        frame.last_constant = None;
    }

    fn emit_constant(&mut self, v: Value) {
        let line = self.prev.line;
        let written = self.frame_mut().chunk.write_constant(v, line);
        match written {
            Ok(idx) => {
                let frame = self.frame_mut();
                frame.last_op = Some(if idx <= u8::MAX as usize {
                    OpCode::Constant
                } else {
                    OpCode::ConstantLong
                });
                frame.last_constant = Some(v);
            }
            Err(msg) => self.error(msg),
        }
    }

    /// Pool index for operands that only have room for an u8 (names, the
    /// function constant of a closure).
    fn make_constant(&mut self, v: Value) -> u8 {
        let idx = self.frame_mut().chunk.add_constant(v);
        if idx > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let r = self.vm.intern(name);
        self.make_constant(Value::Obj(r))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.frame().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, at: usize) {
        // -2 to step over the offset operand itself
        let jump = self.frame().chunk.code.len() - at - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.frame_mut().chunk.patch_u16(at, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.frame().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.frame().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn end_fn(&mut self) -> (FunctionObj, Vec<CompUpvalue>) {
        self.emit_return();
        let frame = self.frames.pop().unwrap();
        let function = FunctionObj {
            name: frame.name,
            arity: frame.arity,
            upvalue_count: frame.upvalues.len(),
            return_kind: frame.return_kind,
            chunk: Rc::new(frame.chunk),
        };
        (function, frame.upvalues)
    }

    // ── scopes and resolution ───────────────────────────────────────────

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame_mut().scope_depth -= 1;
        loop {
            let frame = self.frame();
            let Some(local) = frame.locals.last() else { break };
            if local.depth <= frame.scope_depth {
                break;
            }
            let captured = local.captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.frame_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: String) {
        if self.frame().locals.len() == 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame_mut().locals.push(Local { name, depth: -1, captured: false });
    }

    fn declare_variable(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let name = self.text(self.prev).to_string();
        let frame = self.frame();
        let mut duplicate = false;
        for local in frame.locals.iter().rev() {
            if local.depth != -1 && local.depth < frame.scope_depth {
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

    fn mark_initialized(&mut self) {
        let frame = self.frame_mut();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Ident, message);
        self.declare_variable();
        if self.frame().scope_depth > 0 {
            return 0;
        }
        let name = self.text(self.prev).to_string();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        for i in (0..self.frames[frame_idx].locals.len()).rev() {
            let (found, depth) = {
                let local = &self.frames[frame_idx].locals[i];
                (local.name == name, local.depth)
            };
            if found {
                if depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        for (i, uv) in self.frames[frame_idx].upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        if self.frames[frame_idx].upvalues.len() == 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.frames[frame_idx].upvalues.push(CompUpvalue { index, is_local });
        (self.frames[frame_idx].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(frame_idx - 1, name) {
            self.frames[frame_idx - 1].locals[local as usize].captured = true;
            return Some(self.add_upvalue(frame_idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(frame_idx - 1, name) {
            return Some(self.add_upvalue(frame_idx, upvalue, false));
        }
        None
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(upvalue) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let arg = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, arg)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg);
        }
    }

    // ── expressions ─────────────────────────────────────────────────────

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.prev.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.cur.kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.prev.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.text(self.prev).parse::<f64>() {
            Ok(n) => self.emit_constant(Value::Number(n)),
            Err(_) => self.error("Invalid number."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.text(self.prev);
        let inner = raw[1..raw.len() - 1].to_string();
        let r = self.vm.intern(&inner);
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.prev.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => {}
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.text(self.prev).to_string();
        self.named_variable(&name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Ident, "Expect superclass method name.");
        let method = self.text(self.prev).to_string();
        let name = self.identifier_constant(&method);

        self.named_variable("this", false);
        if self.matches(TokenKind::LParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.prev.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Tilde => self.emit_op(OpCode::BitNot),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.prev.kind;
        self.parse_precedence(get_rule(op).precedence.next());
        match op {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::Amp => self.emit_op(OpCode::BitAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitOr),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            TokenKind::ShiftLeft => self.emit_op(OpCode::BitShiftLeft),
            TokenKind::ShiftRight => self.emit_op(OpCode::BitShiftRight),
            _ => {}
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after arguments.");
        argc
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Ident, "Expect property name after '.'.");
        let property = self.text(self.prev).to_string();
        let name = self.identifier_constant(&property);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name);
        } else if self.matches(TokenKind::LParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name);
            self.emit_byte(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name);
        }
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 elements in an array literal.");
                } else {
                    count += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBracket, "Expect ']' after array elements.");
        self.emit_op(OpCode::Array);
        self.emit_byte(count);
    }

    fn dict_literal(&mut self, _can_assign: bool) {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after key.");
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 entries in a dict literal.");
                } else {
                    count += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBrace, "Expect '}' after dict elements.");
        self.emit_op(OpCode::Dict);
        self.emit_byte(count);
    }

    fn object_access(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::ObjectSet);
        } else {
            self.emit_op(OpCode::ObjectGet);
        }
    }

    // ── declarations and statements ─────────────────────────────────────

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fn) {
            self.fn_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Import) {
            self.import_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Out) {
            self.out_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::Until) {
            self.until_statement();
        } else if self.matches(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn parse_return_kind(&mut self) -> ReturnKind {
        if self.matches(TokenKind::At) {
            if self.matches(TokenKind::Ident) {
                match self.text(self.prev) {
                    "void" => return ReturnKind::Void,
                    "int" => return ReturnKind::Int,
                    "float" => return ReturnKind::Float,
                    "str" => return ReturnKind::Str,
                    "bool" => return ReturnKind::Bool,
                    _ => {}
                }
            }
            self.error("Invalid return type.");
        }
        ReturnKind::None
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.text(self.prev).to_string();
        self.frames.push(FnCompiler::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RParen) {
            loop {
                self.frame_mut().arity += 1;
                if self.frame().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after parameters.");

        let return_kind = self.parse_return_kind();
        self.frame_mut().return_kind = return_kind;

        self.consume(TokenKind::LBrace, "Expect '{' before function body.");
        self.block();

        // A declared return kind demands that control can't fall off the end.
        if self.frame().last_op != Some(OpCode::Return)
            && !matches!(return_kind, ReturnKind::Void | ReturnKind::None)
        {
            self.error("Function must have an explicit return.");
        }

        let (function, upvalues) = self.end_fn();
        let fref = self.vm.alloc(Obj::Function(function));
        let constant = self.make_constant(Value::Obj(fref));
        self.emit_op(OpCode::Closure);
        self.emit_byte(constant);
        for uv in upvalues {
            self.emit_byte(uv.is_local as u8);
            self.emit_byte(uv.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Ident, "Expect method name.");
        let method = self.text(self.prev).to_string();
        let constant = self.identifier_constant(&method);

        let kind = if method == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Ident, "Expect class name.");
        let class_name = self.prev;
        let name = self.text(class_name).to_string();
        let name_constant = self.identifier_constant(&name);
        self.declare_variable();

        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassFrame { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Ident, "Expect superclass name.");
            self.variable(false);

            if self.text(class_name) == self.text(self.prev) {
                self.error("A class can't inherit from itself.");
            }

            // Hidden scope so methods can close over 'super'.
            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&name, false);
        self.consume(TokenKind::LBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn import_declaration(&mut self) {
        self.consume(TokenKind::Ident, "Expect a file to import.");
        let name = self.text(self.prev).to_string();
        if let Err(msg) = self.vm.import_module(&name) {
            self.error(&msg);
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn out_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Out);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.frame().chunk.code.len();
        self.consume(TokenKind::LParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn until_statement(&mut self) {
        let loop_start = self.frame().chunk.code.len();
        self.consume(TokenKind::LParen, "Expect '(' after 'until'.");
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after condition.");

        // 'until' is 'while' with the condition negated.
        self.emit_op(OpCode::Not);

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.frame().chunk.code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RParen) {
            // The body runs before the increment: jump over it, and loop back
            // to it from the end of the body.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.frame().chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        let kind = self.frame().kind;
        let return_kind = self.frame().return_kind;

        if kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            if kind != FunctionKind::Initializer && return_kind != ReturnKind::Void {
                self.error("Function must return a value.");
            }
            self.emit_return();
        } else {
            if kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            if return_kind == ReturnKind::Void {
                self.error("Void function cannot return a value.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.check_return_value_kind();
            self.emit_op(OpCode::Return);
        }
    }

    /// Shallow check of a declared return kind against the last emitted
    /// opcode (and, for constant loads, the constant itself). Anything the
    /// compiler can't see, the VM re-checks after the call returns.
    fn check_return_value_kind(&mut self) {
        let frame = self.frame();
        let last_op = frame.last_op;
        let last_constant = frame.last_constant;
        let return_kind = frame.return_kind;

        let constant_load = matches!(last_op, Some(OpCode::Constant | OpCode::ConstantLong));
        let constant_is_string = match last_constant {
            Some(Value::Obj(r)) => matches!(self.vm.obj(r), Obj::String(_)),
            _ => false,
        };

        match return_kind {
            ReturnKind::Int | ReturnKind::Float => {
                let ok = if constant_load {
                    matches!(last_constant, Some(Value::Number(_)))
                } else {
                    matches!(
                        last_op,
                        Some(
                            OpCode::Add
                                | OpCode::Subtract
                                | OpCode::Multiply
                                | OpCode::Divide
                                | OpCode::Negate
                        )
                    )
                };
                if !ok {
                    self.error("Function must return a number.");
                }
            }
            ReturnKind::Str => {
                if !(constant_load && constant_is_string) {
                    self.error("Function must return a string.");
                }
            }
            ReturnKind::Bool => {
                let ok = matches!(
                    last_op,
                    Some(
                        OpCode::True
                            | OpCode::False
                            | OpCode::Equal
                            | OpCode::Greater
                            | OpCode::Less
                            | OpCode::Not
                    )
                );
                if !ok {
                    self.error("Function must return a boolean.");
                }
            }
            ReturnKind::None | ReturnKind::Void => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::TestHost;

    fn compile_src(src: &str) -> (Vm, Result<FunctionObj, CompileErrors>) {
        let mut vm = Vm::new(Box::new(TestHost::default()));
        let result = Compiler::compile(src, &mut vm);
        (vm, result)
    }

    fn compile_err(src: &str) -> String {
        let (_, result) = compile_src(src);
        result.expect_err("expected a compile error").to_string()
    }

    #[test]
    fn arithmetic_precedence_bytecode() {
        let (_, result) = compile_src("out 1 + 2 * 3;");
        let fun = result.unwrap();
        assert_eq!(
            fun.chunk.code,
            vec![
                OpCode::Constant as u8, 0,
                OpCode::Constant as u8, 1,
                OpCode::Constant as u8, 2,
                OpCode::Multiply as u8,
                OpCode::Add as u8,
                OpCode::Out as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
        assert_eq!(fun.chunk.constants[0], Value::Number(1.0));
        assert_eq!(fun.chunk.constants[2], Value::Number(3.0));
    }

    #[test]
    fn bitwise_binds_tighter_than_term() {
        let (_, result) = compile_src("out 1 + 2 & 3;");
        let fun = result.unwrap();
        assert_eq!(
            fun.chunk.code,
            vec![
                OpCode::Constant as u8, 0,
                OpCode::Constant as u8, 1,
                OpCode::Constant as u8, 2,
                OpCode::BitAnd as u8,
                OpCode::Add as u8,
                OpCode::Out as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn if_else_jump_offsets() {
        let (_, result) = compile_src("if (true) out 1; else out 2;");
        let fun = result.unwrap();
        let code = &fun.chunk.code;
        assert_eq!(code[0], OpCode::True as u8);
        assert_eq!(code[1], OpCode::JumpIfFalse as u8);
        // Lands on the Pop that opens the else arm.
        assert_eq!(Chunk::read_u16(code, 2), 7);
        assert_eq!(code[8], OpCode::Jump as u8);
        assert_eq!(Chunk::read_u16(code, 9), 4);
        assert_eq!(code[11], OpCode::Pop as u8);
    }

    #[test]
    fn equal_string_literals_share_one_interned_constant() {
        let (_, result) = compile_src("out \"hi\" == \"hi\";");
        let fun = result.unwrap();
        assert_eq!(fun.chunk.constants[0], fun.chunk.constants[1]);
    }

    #[test]
    fn closure_upvalue_metadata() {
        let src = "\
fn make() {
  var x = 0;
  fn inc() { x = x + 1; return x; }
  return inc;
}
";
        let (vm, result) = compile_src(src);
        result.unwrap();
        let mut saw_inc = false;
        for obj in vm.objects() {
            if let Obj::Function(f) = obj {
                if f.name.as_deref() == Some("inc") {
                    saw_inc = true;
                    assert_eq!(f.upvalue_count, 1);
                }
            }
        }
        assert!(saw_inc);
    }

    #[test]
    fn invalid_assignment_target() {
        assert!(compile_err("1 + 2 = 3;").contains("Invalid assignment target."));
    }

    #[test]
    fn duplicate_local_rejected() {
        let msg = compile_err("{ var a = 1; var a = 2; }");
        assert!(msg.contains("Already a variable with this name in this scope."));
    }

    #[test]
    fn self_referential_initializer_rejected() {
        let msg = compile_err("{ var a = a; }");
        assert!(msg.contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn this_and_super_require_a_class() {
        assert!(compile_err("out this;").contains("Can't use 'this' outside of a class."));
        let msg = compile_err("class A { m() { super.m(); } }");
        assert!(msg.contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn self_inheritance_rejected() {
        assert!(compile_err("class A < A {}").contains("A class can't inherit from itself."));
    }

    #[test]
    fn top_level_return_rejected() {
        assert!(compile_err("return 1;").contains("Can't return from top-level code."));
    }

    #[test]
    fn declared_int_rejects_string_return() {
        let msg = compile_err("fn bad() @int { return \"x\"; } out bad();");
        assert!(msg.contains("Function must return a number."));
    }

    #[test]
    fn declared_str_only_accepts_string_constants() {
        let msg = compile_err("fn s() @str { return \"a\" + \"b\"; }");
        assert!(msg.contains("Function must return a string."));
    }

    #[test]
    fn declared_bool_accepts_comparisons() {
        let (_, result) = compile_src("fn p(a, b) @bool { return a < b; }");
        assert!(result.is_ok());
    }

    #[test]
    fn declared_kind_requires_explicit_return() {
        let msg = compile_err("fn f() @int { out 1; }");
        assert!(msg.contains("Function must have an explicit return."));
    }

    #[test]
    fn void_function_cannot_return_a_value() {
        let msg = compile_err("fn f() @void { return 1; }");
        assert!(msg.contains("Void function cannot return a value."));
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        let msg = compile_err("class A { init() { return 1; } }");
        assert!(msg.contains("Can't return a value from an initializer."));
    }

    #[test]
    fn bare_return_is_allowed_in_initializers() {
        let (_, result) = compile_src("class A { init() { return; } }");
        assert!(result.is_ok());
    }

    #[test]
    fn panic_mode_recovers_at_statement_boundaries() {
        let (_, result) = compile_src("var = 1; var = 2;");
        let errors = result.expect_err("expected compile errors").0;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("Expect variable name."));
    }

    #[test]
    fn long_constant_form_past_256_entries() {
        let mut src = String::new();
        for i in 0..300 {
            src.push_str(&format!("out {};", i));
        }
        let (_, result) = compile_src(&src);
        let fun = result.unwrap();
        assert_eq!(fun.chunk.constants.len(), 300);

        // Walk instruction boundaries; operand bytes must not be mistaken
        // for opcodes.
        let code = &fun.chunk.code;
        let mut offset = 0;
        let mut saw_long = false;
        while offset < code.len() {
            offset += match OpCode::from_u8(code[offset]) {
                OpCode::Constant => 2,
                OpCode::ConstantLong => {
                    saw_long = true;
                    3
                }
                _ => 1,
            };
        }
        assert!(saw_long);
    }
}
