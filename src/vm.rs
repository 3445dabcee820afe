use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use tracing::debug;

use crate::chunk::Chunk;
use crate::compiler::Compiler;
use crate::error::{EmbrError, RuntimeError, TraceFrame};
use crate::opcode::OpCode;
use crate::value::{
    format_number, BoundMethodObj, ClassObj, ClosureObj, InstanceObj, NativeFn, NativeObj, Obj,
    ObjRef, ReturnKind, UpvalueObj, Value,
};

/// Everything the interpreter needs from the outside world. The CLI wires in
/// real clocks, `std::process`, and the filesystem; tests script all four.
pub trait Host {
    /// Seconds since an arbitrary epoch; only differences are meaningful.
    fn clock(&self) -> f64;
    /// Wall clock, seconds since the Unix epoch.
    fn time(&self) -> f64;
    /// Run a host command; resolves to its exit status.
    fn term(&mut self, cmd: &str) -> Result<f64, String>;
    /// Source text for `import name`.
    fn load(&mut self, name: &str) -> Result<String, String>;
}

struct CallFrame {
    closure: ObjRef,
    chunk: Rc<Chunk>,
    ip: usize,
    base: usize,
}

enum CallKind {
    Bound(BoundMethodObj),
    Class(Option<Value>),
    Closure,
    Native(usize, NativeFn, &'static str),
    Bad,
}

pub struct Vm {
    heap: Vec<Obj>,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Interning set: payload -> heap ref. Every string the VM or compiler
    /// creates goes through here, so equal strings share one ref.
    strings: HashMap<String, ObjRef>,
    globals: HashMap<ObjRef, Value>,
    /// Open upvalues ordered by descending stack slot; at most one per slot.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    host: Box<dyn Host>,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new(host: Box<dyn Host>) -> Self {
        Self::with_output(host, Box::new(io::stdout()))
    }

    pub fn with_output(host: Box<dyn Host>, out: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            heap: vec![],
            stack: vec![],
            frames: vec![],
            strings: HashMap::new(),
            globals: HashMap::new(),
            open_upvalues: vec![],
            init_string: 0,
            host,
            out,
        };
        vm.init_string = vm.intern("init");
        vm.define_natives();
        vm
    }

    /// Compiles and runs `source` against this VM's globals. Used both by the
    /// entry points and, mid-compile, by `import`.
    pub fn interpret(&mut self, source: &str) -> Result<(), EmbrError> {
        let function = Compiler::compile(source, self).map_err(EmbrError::Compile)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            let name = function.name.clone().unwrap_or_else(|| "<script>".to_string());
            debug!("\n{}", crate::dis::disassemble_chunk(self, &function.chunk, &name));
        }

        let fref = self.alloc(Obj::Function(function));
        let closure = self.alloc(Obj::Closure(ClosureObj { function: fref, upvalues: vec![] }));
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0).map_err(EmbrError::Runtime)?;
        self.run().map_err(EmbrError::Runtime)
    }

    // ── heap and interning ──────────────────────────────────────────────

    pub(crate) fn alloc(&mut self, o: Obj) -> ObjRef {
        self.heap.push(o);
        self.heap.len() - 1
    }

    pub(crate) fn obj(&self, r: ObjRef) -> &Obj {
        &self.heap[r]
    }

    #[cfg(test)]
    pub(crate) fn objects(&self) -> &[Obj] {
        &self.heap
    }

    pub(crate) fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(&r) = self.strings.get(s) {
            return r;
        }
        let r = self.alloc(Obj::String(s.to_string()));
        self.strings.insert(s.to_string(), r);
        r
    }

    fn string_text(&self, r: ObjRef) -> &str {
        match &self.heap[r] {
            Obj::String(s) => s,
            _ => "",
        }
    }

    /// Compile and run the named module in place. Reaches the VM through the
    /// compiler while the importing file is still being compiled, so the
    /// module's globals exist before any of the importer's code runs.
    pub(crate) fn import_module(&mut self, name: &str) -> Result<(), String> {
        debug!(module = name, "import");
        let source = self.host.load(name)?;
        self.interpret(&source).map_err(|e| format!("Error in module '{}': {}", name, e))
    }

    // ── stack plumbing ──────────────────────────────────────────────────

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => self.fail("Stack underflow."),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn fail<T>(&mut self, message: impl Into<String>) -> Result<T, RuntimeError> {
        Err(self.runtime_error(message.into()))
    }

    /// Captures the stack trace newest-first, then resets the machine so the
    /// next interpret starts clean.
    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let line = frame.chunk.get_line(frame.ip.saturating_sub(1));
            let function = match &self.heap[frame.closure] {
                Obj::Closure(c) => match &self.heap[c.function] {
                    Obj::Function(f) => f.name.clone(),
                    _ => None,
                },
                _ => None,
            };
            trace.push(TraceFrame { line, function });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError { message, trace }
    }

    // ── decoding ────────────────────────────────────────────────────────

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let b = frame.chunk.code[frame.ip];
        frame.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().unwrap();
        let v = Chunk::read_u16(&frame.chunk.code, frame.ip);
        frame.ip += 2;
        v
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.frames.last().unwrap().chunk.constants[idx]
    }

    fn read_constant_long(&mut self) -> Value {
        let idx = self.read_u16() as usize;
        self.frames.last().unwrap().chunk.constants[idx]
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("name operands are interned string constants"),
        }
    }

    // ── calls ───────────────────────────────────────────────────────────

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let info = match &self.heap[closure] {
            Obj::Closure(c) => match &self.heap[c.function] {
                Obj::Function(f) => Some((f.arity, Rc::clone(&f.chunk))),
                _ => None,
            },
            _ => None,
        };
        let Some((arity, chunk)) = info else {
            return self.fail("Can only call functions and classes.");
        };
        if argc != arity {
            return self.fail(format!("Expected {} arguments but got {}.", arity, argc));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure, chunk, ip: 0, base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let Value::Obj(r) = callee else {
            return self.fail("Can only call functions and classes.");
        };
        let kind = match &self.heap[r] {
            Obj::BoundMethod(b) => CallKind::Bound(*b),
            Obj::Class(c) => CallKind::Class(c.methods.get(&self.init_string).copied()),
            Obj::Closure(_) => CallKind::Closure,
            Obj::Native(n) => CallKind::Native(n.arity, n.fun, n.name),
            _ => CallKind::Bad,
        };
        match kind {
            CallKind::Bound(bound) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = bound.receiver;
                self.call_closure(bound.method, argc)
            }
            CallKind::Class(initializer) => {
                let instance =
                    self.alloc(Obj::Instance(InstanceObj { class: r, fields: HashMap::new() }));
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = Value::Obj(instance);
                match initializer {
                    Some(Value::Obj(init)) => self.call_closure(init, argc),
                    _ => {
                        if argc != 0 {
                            self.fail(format!("Expected 0 arguments but got {}.", argc))
                        } else {
                            Ok(())
                        }
                    }
                }
            }
            CallKind::Closure => self.call_closure(r, argc),
            CallKind::Native(arity, fun, name) => {
                if argc != arity {
                    return self
                        .fail(format!("{}() takes exactly {} arguments but got {}.", name, arity, argc));
                }
                let args_start = self.stack.len() - argc;
                let args = self.stack[args_start..].to_vec();
                self.stack.truncate(args_start - 1);
                match fun(self, args) {
                    Ok(v) => {
                        self.push(v);
                        Ok(())
                    }
                    Err(msg) => self.fail(msg),
                }
            }
            CallKind::Bad => self.fail("Can only call functions and classes."),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let Value::Obj(r) = receiver else {
            return self.fail("Only instances have methods.");
        };
        let (class, field) = match &self.heap[r] {
            Obj::Instance(inst) => (inst.class, inst.fields.get(&name).copied()),
            _ => return self.fail("Only instances have methods."),
        };
        if let Some(field) = field {
            // A callable field wins over methods; it replaces the receiver
            // slot outright, so the callee never sees the instance.
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let method = match &self.heap[class] {
            Obj::Class(c) => c.methods.get(&name).copied(),
            _ => None,
        };
        match method {
            Some(Value::Obj(m)) => self.call_closure(m, argc),
            _ => {
                let n = self.string_text(name).to_string();
                self.fail(format!("Undefined property '{}'.", n))
            }
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let method = match &self.heap[class] {
            Obj::Class(c) => c.methods.get(&name).copied(),
            _ => None,
        };
        let Some(Value::Obj(m)) = method else {
            let n = self.string_text(name).to_string();
            return self.fail(format!("Undefined property '{}'.", n));
        };
        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(BoundMethodObj { receiver, method: m }));
        self.pop()?;
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ── upvalues ────────────────────────────────────────────────────────

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            let open_slot = match &self.heap[r] {
                Obj::Upvalue(UpvalueObj::Open(s)) => *s,
                _ => 0,
            };
            if open_slot == slot {
                return r;
            }
            if open_slot < slot {
                break;
            }
            i += 1;
        }
        let created = self.alloc(Obj::Upvalue(UpvalueObj::Open(slot)));
        self.open_upvalues.insert(i, created);
        created
    }

    /// Closes every open upvalue at or above `from`, moving the stack value
    /// into the upvalue object itself.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let slot = match &self.heap[r] {
                Obj::Upvalue(UpvalueObj::Open(s)) => *s,
                _ => break,
            };
            if slot < from {
                break;
            }
            let v = self.stack[slot];
            self.heap[r] = Obj::Upvalue(UpvalueObj::Closed(v));
            self.open_upvalues.remove(0);
        }
    }

    fn current_upvalue(&self, index: usize) -> ObjRef {
        let closure = self.frames.last().unwrap().closure;
        match &self.heap[closure] {
            Obj::Closure(c) => c.upvalues[index],
            _ => unreachable!("frames always hold closures"),
        }
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn numeric_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.pop()?;
                self.pop()?;
                Ok((x, y))
            }
            _ => self.fail("Operands must be numbers."),
        }
    }

    pub fn value_to_string(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.obj_to_string(r),
        }
    }

    fn function_name(&self, fref: ObjRef) -> String {
        match &self.heap[fref] {
            Obj::Function(f) => match &f.name {
                Some(name) => format!("<fn {}>", name),
                None => "<script>".to_string(),
            },
            _ => "<fn>".to_string(),
        }
    }

    fn obj_to_string(&self, r: ObjRef) -> String {
        match &self.heap[r] {
            Obj::String(s) => s.clone(),
            Obj::Function(_) => self.function_name(r),
            Obj::Closure(c) => self.function_name(c.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.string_text(c.name).to_string(),
            Obj::Instance(inst) => {
                let class_name = match &self.heap[inst.class] {
                    Obj::Class(c) => self.string_text(c.name),
                    _ => "?",
                };
                format!("{} instance", class_name)
            }
            Obj::BoundMethod(b) => {
                let method = match &self.heap[b.method] {
                    Obj::Closure(c) => c.function,
                    _ => b.method,
                };
                self.function_name(method)
            }
            Obj::Array(items) => {
                let mut s = "[".to_string();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&self.value_to_string(*item));
                }
                s.push(']');
                s
            }
            Obj::Dict(items) => {
                let mut s = "{".to_string();
                let mut first = true;
                for (k, v) in items {
                    if !first {
                        s.push_str(", ");
                    }
                    first = false;
                    s.push_str(&format!("\"{}\": {}", self.string_text(*k), self.value_to_string(*v)));
                }
                s.push('}');
                s
            }
            Obj::Native(_) => "<native fn>".to_string(),
        }
    }

    // ── dispatch loop ───────────────────────────────────────────────────

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::ConstantLong => {
                    let v = self.read_constant_long();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let uv = self.current_upvalue(idx);
                    let v = match &self.heap[uv] {
                        Obj::Upvalue(UpvalueObj::Open(s)) => self.stack[*s],
                        Obj::Upvalue(UpvalueObj::Closed(v)) => *v,
                        _ => unreachable!("closures only reference upvalues"),
                    };
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let uv = self.current_upvalue(idx);
                    let v = self.peek(0);
                    let open_slot = match &self.heap[uv] {
                        Obj::Upvalue(UpvalueObj::Open(s)) => Some(*s),
                        _ => None,
                    };
                    match open_slot {
                        Some(s) => self.stack[s] = v,
                        None => self.heap[uv] = Obj::Upvalue(UpvalueObj::Closed(v)),
                    }
                }

                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let v = self.peek(0);
                    self.globals.insert(name, v);
                    self.pop()?;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name).copied() {
                        Some(v) => self.push(v),
                        None => {
                            let n = self.string_text(name).to_string();
                            return self.fail(format!("Undefined variable '{}'.", n));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains_key(&name) {
                        let n = self.string_text(name).to_string();
                        return self.fail(format!("Undefined variable '{}'.", n));
                    }
                    let v = self.peek(0);
                    self.globals.insert(name, v);
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let Value::Obj(r) = receiver else {
                        return self.fail("Only instances and dictionaries have properties.");
                    };
                    match &self.heap[r] {
                        Obj::Instance(inst) => {
                            let class = inst.class;
                            let field = inst.fields.get(&name).copied();
                            match field {
                                Some(v) => {
                                    self.pop()?;
                                    self.push(v);
                                }
                                None => self.bind_method(class, name)?,
                            }
                        }
                        Obj::Dict(items) => {
                            let v = items.get(&name).copied().unwrap_or(Value::Nil);
                            self.pop()?;
                            self.push(v);
                        }
                        _ => return self.fail("Only instances and dictionaries have properties."),
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(1);
                    let value = self.peek(0);
                    let Value::Obj(r) = receiver else {
                        return self.fail("Only instances and dictionaries have fields.");
                    };
                    match &mut self.heap[r] {
                        Obj::Instance(inst) => {
                            inst.fields.insert(name, value);
                        }
                        Obj::Dict(items) => {
                            items.insert(name, value);
                        }
                        _ => return self.fail("Only instances and dictionaries have fields."),
                    }
                    let value = self.pop()?;
                    self.pop()?;
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop()? {
                        Value::Obj(r) => r,
                        _ => return self.fail("Superclass must be a class."),
                    };
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a > b));
                }
                OpCode::Less => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a < b));
                }

                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => {
                            self.pop()?;
                            self.pop()?;
                            self.push(Value::Number(x + y));
                        }
                        (Value::Obj(x), Value::Obj(y))
                            if matches!(self.heap[x], Obj::String(_))
                                && matches!(self.heap[y], Obj::String(_)) =>
                        {
                            let mut s = self.string_text(x).to_string();
                            s.push_str(self.string_text(y));
                            let r = self.intern(&s);
                            self.pop()?;
                            self.pop()?;
                            self.push(Value::Obj(r));
                        }
                        _ => return self.fail("Operands must be two numbers or two strings."),
                    }
                }
                OpCode::Subtract => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a - b));
                }
                OpCode::Multiply => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a * b));
                }
                OpCode::Divide => {
                    // Division by zero is IEEE inf/nan, not an error.
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a / b));
                }
                OpCode::Modulo => {
                    let (a, b) = self.numeric_operands()?;
                    if b == 0.0 {
                        return self.fail("Division by zero.");
                    }
                    self.push(Value::Number(a % b));
                }

                OpCode::BitAnd => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(((a as i32) & (b as i32)) as f64));
                }
                OpCode::BitOr => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(((a as i32) | (b as i32)) as f64));
                }
                OpCode::BitXor => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(((a as i32) ^ (b as i32)) as f64));
                }
                OpCode::BitShiftLeft => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number((a as i32).wrapping_shl(b as i32 as u32) as f64));
                }
                OpCode::BitShiftRight => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number((a as i32).wrapping_shr(b as i32 as u32) as f64));
                }
                OpCode::BitNot => {
                    let v = self.pop()?;
                    let Value::Number(n) = v else {
                        return self.fail("Operand must be a number.");
                    };
                    self.push(Value::Number(!(n as i32) as f64));
                }

                OpCode::Not => {
                    let v = self.pop()?;
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.pop()?;
                    let Value::Number(n) = v else {
                        return self.fail("Operand must be a number.");
                    };
                    self.push(Value::Number(-n));
                }

                OpCode::Out => {
                    let v = self.pop()?;
                    let text = self.value_to_string(v);
                    let _ = writeln!(self.out, "{}", text);
                    let _ = self.out.flush();
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(self.peek(argc), argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = match self.pop()? {
                        Value::Obj(r) => r,
                        _ => return self.fail("Superclass must be a class."),
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                }

                OpCode::Closure => {
                    let fref = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure operand is a function constant"),
                    };
                    let upvalue_count = match &self.heap[fref] {
                        Obj::Function(f) => f.upvalue_count,
                        _ => 0,
                    };
                    let base = self.frames.last().unwrap().base;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(self.current_upvalue(index));
                        }
                    }
                    let closure = self.alloc(Obj::Closure(ClosureObj { function: fref, upvalues }));
                    self.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop()?;
                }

                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        self.pop()?;
                        return Ok(());
                    }

                    let return_kind = {
                        let fref = match &self.heap[frame.closure] {
                            Obj::Closure(c) => c.function,
                            _ => unreachable!("frames always hold closures"),
                        };
                        match &self.heap[fref] {
                            Obj::Function(f) => f.return_kind,
                            _ => ReturnKind::None,
                        }
                    };
                    let ok = match return_kind {
                        ReturnKind::None => true,
                        ReturnKind::Void => matches!(result, Value::Nil),
                        ReturnKind::Int | ReturnKind::Float => matches!(result, Value::Number(_)),
                        ReturnKind::Str => matches!(
                            result,
                            Value::Obj(r) if matches!(self.heap[r], Obj::String(_))
                        ),
                        ReturnKind::Bool => matches!(result, Value::Bool(_)),
                    };
                    if !ok {
                        return self.fail("Invalid return type.");
                    }

                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(ClassObj { name, methods: HashMap::new() }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let Value::Obj(sr) = superclass else {
                        return self.fail("Superclass must be a class.");
                    };
                    let methods = match &self.heap[sr] {
                        Obj::Class(c) => c.methods.clone(),
                        _ => return self.fail("Superclass must be a class."),
                    };
                    // Compile-time linearisation: copy everything down now;
                    // methods defined after this shadow the copies.
                    if let Value::Obj(subr) = self.peek(0) {
                        if let Obj::Class(sub) = &mut self.heap[subr] {
                            sub.methods = methods;
                        }
                    }
                    self.pop()?;
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    if let Value::Obj(cr) = self.peek(1) {
                        if let Obj::Class(class) = &mut self.heap[cr] {
                            class.methods.insert(name, method);
                        }
                    }
                    self.pop()?;
                }

                OpCode::Array => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let elements = self.stack.split_off(start);
                    let array = self.alloc(Obj::Array(elements));
                    self.push(Value::Obj(array));
                }
                OpCode::ObjectGet => {
                    let index = self.pop()?;
                    let receiver = self.pop()?;
                    let Value::Obj(r) = receiver else {
                        return self.fail("Can only index arrays and dictionaries.");
                    };
                    match &self.heap[r] {
                        Obj::Array(items) => {
                            let Value::Number(n) = index else {
                                return self.fail("Array access requires a number.");
                            };
                            // Out-of-range reads are lenient and yield nil.
                            let v = if n >= 0.0 {
                                items.get(n as usize).copied().unwrap_or(Value::Nil)
                            } else {
                                Value::Nil
                            };
                            self.push(v);
                        }
                        Obj::Dict(items) => {
                            let key = match index {
                                Value::Obj(k) if matches!(self.heap[k], Obj::String(_)) => k,
                                _ => return self.fail("Dictionary keys must be strings."),
                            };
                            let v = items.get(&key).copied().unwrap_or(Value::Nil);
                            self.push(v);
                        }
                        _ => return self.fail("Can only index arrays and dictionaries."),
                    }
                }
                OpCode::ObjectSet => {
                    let receiver = self.peek(2);
                    let index = self.peek(1);
                    let value = self.peek(0);
                    let Value::Obj(r) = receiver else {
                        return self.fail("Can only index arrays and dictionaries.");
                    };
                    if matches!(self.heap[r], Obj::Array(_)) {
                        let Value::Number(n) = index else {
                            return self.fail("Array access requires a number.");
                        };
                        let len = match &self.heap[r] {
                            Obj::Array(items) => items.len(),
                            _ => 0,
                        };
                        if n < 0.0 || n as usize >= len {
                            return self.fail("Array index out of range.");
                        }
                        if let Obj::Array(items) = &mut self.heap[r] {
                            items[n as usize] = value;
                        }
                    } else if matches!(self.heap[r], Obj::Dict(_)) {
                        let key = match index {
                            Value::Obj(k) if matches!(self.heap[k], Obj::String(_)) => k,
                            _ => return self.fail("Dictionary keys must be strings."),
                        };
                        if let Obj::Dict(items) = &mut self.heap[r] {
                            items.insert(key, value);
                        }
                    } else {
                        return self.fail("Can only index arrays and dictionaries.");
                    }
                    self.pop()?;
                    self.pop()?;
                    self.pop()?;
                    self.push(Value::Nil);
                }
                OpCode::Dict => {
                    let count = self.read_byte() as usize;
                    let mut items = HashMap::with_capacity(count);
                    for _ in 0..count {
                        let value = self.pop()?;
                        let key = self.pop()?;
                        let key = match key {
                            Value::Obj(k) if matches!(self.heap[k], Obj::String(_)) => k,
                            _ => return self.fail("Dictionary keys must be strings."),
                        };
                        items.insert(key, value);
                    }
                    let dict = self.alloc(Obj::Dict(items));
                    self.push(Value::Obj(dict));
                }
            }
        }
    }

    // ── natives ─────────────────────────────────────────────────────────

    fn define_native(&mut self, name: &'static str, arity: usize, fun: NativeFn) {
        let native = self.alloc(Obj::Native(NativeObj { name, arity, fun }));
        let global = self.intern(name);
        self.globals.insert(global, Value::Obj(native));
    }

    fn define_natives(&mut self) {
        self.define_native("clock", 0, native_clock);
        self.define_native("time", 0, native_time);
        self.define_native("term", 1, native_term);
        self.define_native("length", 1, native_length);
        self.define_native("append", 2, native_append);
        self.define_native("prepend", 2, native_prepend);
        self.define_native("head", 1, native_head);
        self.define_native("tail", 1, native_tail);
        self.define_native("rest", 1, native_rest);
        self.define_native("remove", 2, native_remove);
    }
}

fn as_array(vm: &Vm, v: Value, who: &str) -> Result<ObjRef, String> {
    match v {
        Value::Obj(r) if matches!(vm.heap[r], Obj::Array(_)) => Ok(r),
        _ => Err(format!("{}() argument must be an array.", who)),
    }
}

fn native_clock(vm: &mut Vm, _args: Vec<Value>) -> Result<Value, String> {
    Ok(Value::Number(vm.host.clock()))
}

fn native_time(vm: &mut Vm, _args: Vec<Value>) -> Result<Value, String> {
    Ok(Value::Number(vm.host.time()))
}

fn native_term(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let cmd = match args[0] {
        Value::Obj(r) => match &vm.heap[r] {
            Obj::String(s) => s.clone(),
            _ => return Err("term() argument must be a string.".to_string()),
        },
        _ => return Err("term() argument must be a string.".to_string()),
    };
    vm.host.term(&cmd).map(Value::Number)
}

fn native_length(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let len = match args[0] {
        Value::Obj(r) => match &vm.heap[r] {
            Obj::String(s) => s.len(),
            Obj::Array(items) => items.len(),
            Obj::Dict(items) => items.len(),
            _ => return Err("length() argument must be a string, array, or dict.".to_string()),
        },
        _ => return Err("length() argument must be a string, array, or dict.".to_string()),
    };
    Ok(Value::Number(len as f64))
}

fn native_append(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let r = as_array(vm, args[0], "append")?;
    if let Obj::Array(items) = &mut vm.heap[r] {
        items.push(args[1]);
    }
    Ok(Value::Nil)
}

fn native_prepend(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let r = as_array(vm, args[0], "prepend")?;
    if let Obj::Array(items) = &mut vm.heap[r] {
        items.insert(0, args[1]);
    }
    Ok(Value::Nil)
}

fn native_head(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let r = as_array(vm, args[0], "head")?;
    match &mut vm.heap[r] {
        Obj::Array(items) if items.is_empty() => Err("head() called on an empty array.".to_string()),
        Obj::Array(items) => Ok(items.remove(0)),
        _ => Err("head() argument must be an array.".to_string()),
    }
}

fn native_tail(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let r = as_array(vm, args[0], "tail")?;
    match &mut vm.heap[r] {
        Obj::Array(items) => {
            items.pop().ok_or_else(|| "tail() called on an empty array.".to_string())
        }
        _ => Err("tail() argument must be an array.".to_string()),
    }
}

fn native_rest(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let r = as_array(vm, args[0], "rest")?;
    let rest: Vec<Value> = match &vm.heap[r] {
        Obj::Array(items) if items.is_empty() => {
            return Err("rest() called on an empty array.".to_string())
        }
        Obj::Array(items) => items[1..].to_vec(),
        _ => return Err("rest() argument must be an array.".to_string()),
    };
    let array = vm.alloc(Obj::Array(rest));
    Ok(Value::Obj(array))
}

fn native_remove(vm: &mut Vm, args: Vec<Value>) -> Result<Value, String> {
    let d = match args[0] {
        Value::Obj(r) if matches!(vm.heap[r], Obj::Dict(_)) => r,
        _ => return Err("remove() takes a dict and a string key.".to_string()),
    };
    let key = match args[1] {
        Value::Obj(k) if matches!(vm.heap[k], Obj::String(_)) => k,
        _ => return Err("remove() takes a dict and a string key.".to_string()),
    };
    if let Obj::Dict(items) = &mut vm.heap[d] {
        items.remove(&key);
    }
    Ok(Value::Nil)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn out(src: &str) -> String {
        eval(src).expect("program should run")
    }

    fn runtime_message(src: &str) -> RuntimeError {
        match eval_err(src) {
            EmbrError::Runtime(e) => e,
            EmbrError::Compile(e) => panic!("expected runtime error, got compile error: {}", e),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(out("out 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn grouping_overrides_precedence() {
        assert_eq!(out("out (1 + 2) * 3;"), "9\n");
    }

    #[test]
    fn bitwise_and_shifts() {
        assert_eq!(out("out 1 << 3 | 1;"), "9\n");
        assert_eq!(out("out 5 & 3;"), "1\n");
        assert_eq!(out("out 5 ^ 3;"), "6\n");
        assert_eq!(out("out 16 >> 2;"), "4\n");
        assert_eq!(out("out ~0;"), "-1\n");
    }

    #[test]
    fn modulo_and_division() {
        assert_eq!(out("out 7 % 3;"), "1\n");
        assert_eq!(out("out 1 / 0;"), "inf\n");
        assert_eq!(runtime_message("out 1 % 0;").message, "Division by zero.");
    }

    #[test]
    fn truthiness_in_not() {
        assert_eq!(out("out !nil; out !0; out !\"\";"), "true\nfalse\nfalse\n");
    }

    #[test]
    fn short_circuit_and_or_yield_operands() {
        assert_eq!(out("out false and 1;"), "false\n");
        assert_eq!(out("out 1 and 2;"), "2\n");
        assert_eq!(out("out false or \"x\";"), "x\n");
        assert_eq!(out("out 1 or 2;"), "1\n");
    }

    #[test]
    fn string_concatenation_interns_the_result() {
        assert_eq!(out("out \"foo\" + \"bar\";"), "foobar\n");
        assert_eq!(out("out (\"foo\" + \"bar\") == \"foobar\";"), "true\n");
    }

    #[test]
    fn add_rejects_mixed_operands() {
        let e = runtime_message("out 1 + \"x\";");
        assert_eq!(e.message, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn comparison_requires_numbers() {
        let e = runtime_message("out 1 < \"a\";");
        assert_eq!(e.message, "Operands must be numbers.");
        assert_eq!(e.trace.len(), 1);
        assert_eq!(e.trace[0].line, 1);
        assert!(e.trace[0].function.is_none());
    }

    #[test]
    fn out_formats_values() {
        assert_eq!(out("out nil; out true; out 2.5;"), "nil\ntrue\n2.5\n");
        assert_eq!(out("class A {} out A; out A();"), "A\nA instance\n");
        assert_eq!(out("out clock;"), "<native fn>\n");
        assert_eq!(out("fn f() {} out f;"), "<fn f>\n");
        assert_eq!(out("out [1, \"x\", nil];"), "[1, x, nil]\n");
    }

    #[test]
    fn while_loop_counts() {
        assert_eq!(out("var i = 0; while (i < 3) { i = i + 1; } out i;"), "3\n");
    }

    #[test]
    fn until_loop_runs_while_condition_is_false() {
        assert_eq!(out("var i = 0; until (i == 3) { i = i + 1; } out i;"), "3\n");
    }

    #[test]
    fn for_loop_with_all_clauses() {
        assert_eq!(out("for (var i = 0; i < 3; i = i + 1) out i;"), "0\n1\n2\n");
    }

    #[test]
    fn globals_are_late_bound() {
        let src = "fn a() { return b(); } fn b() { return 5; } out a();";
        assert_eq!(out(src), "5\n");
    }

    #[test]
    fn undefined_global_get_and_set() {
        assert_eq!(runtime_message("out missing;").message, "Undefined variable 'missing'.");
        assert_eq!(runtime_message("missing = 1;").message, "Undefined variable 'missing'.");
    }

    #[test]
    fn globals_persist_across_interprets() {
        let (mut vm, sink) = vm_with(TestHost::default());
        vm.interpret("var x = 1;").unwrap();
        vm.interpret("out x;").unwrap();
        assert_eq!(String::from_utf8(sink.0.borrow().clone()).unwrap(), "1\n");
    }

    #[test]
    fn closure_counter() {
        let src = "\
fn make() { var x = 0; fn inc() { x = x + 1; return x; } return inc; }
var f = make();
out f(); out f(); out f();
";
        assert_eq!(out(src), "1\n2\n3\n");
    }

    #[test]
    fn closed_upvalue_is_shared_between_closures() {
        let src = "\
fn make() {
  var x = 0;
  fn get() { return x; }
  fn set(v) { x = v; }
  return [get, set];
}
var fns = make();
var g = fns[0];
var s = fns[1];
s(42);
out g();
";
        assert_eq!(out(src), "42\n");
    }

    #[test]
    fn arity_is_checked() {
        let e = runtime_message("fn f(a) { return a; } f();");
        assert_eq!(e.message, "Expected 1 arguments but got 0.");
    }

    #[test]
    fn calling_a_number_fails() {
        assert_eq!(runtime_message("1();").message, "Can only call functions and classes.");
    }

    #[test]
    fn class_inheritance_and_super() {
        let src = "\
class A { greet() { out \"A\"; } }
class B < A { greet() { super.greet(); out \"B\"; } }
B().greet();
";
        assert_eq!(out(src), "A\nB\n");
    }

    #[test]
    fn inherited_methods_resolve_without_override() {
        let src = "class A { m() { return 3; } } class B < A {} out B().m();";
        assert_eq!(out(src), "3\n");
    }

    #[test]
    fn initializer_runs_and_returns_the_instance() {
        let src = "\
class Point { init(x) { this.x = x; } getx() { return this.x; } }
out Point(7).getx();
";
        assert_eq!(out(src), "7\n");
    }

    #[test]
    fn default_constructor_rejects_arguments() {
        let e = runtime_message("class A {} A(1);");
        assert_eq!(e.message, "Expected 0 arguments but got 1.");
    }

    #[test]
    fn bound_method_remembers_its_receiver() {
        let src = "class A { m() { return this; } } var a = A(); var m = a.m; out m() == a;";
        assert_eq!(out(src), "true\n");
    }

    #[test]
    fn callable_field_replaces_the_receiver() {
        let src = "fn nine() { return 9; } class A {} var a = A(); a.f = nine; out a.f();";
        assert_eq!(out(src), "9\n");
    }

    #[test]
    fn undefined_property_errors() {
        let e = runtime_message("class A {} A().nope();");
        assert_eq!(e.message, "Undefined property 'nope'.");
    }

    #[test]
    fn dict_literals_properties_and_remove() {
        let src = "var d = {\"a\": 1, \"b\": 2}; remove(d, \"a\"); out length(d); out d.b;";
        assert_eq!(out(src), "1\n2\n");
    }

    #[test]
    fn dict_set_via_property_and_index_agree() {
        assert_eq!(out("var d = {}; d.k = 5; out d[\"k\"]; out d.missing;"), "5\nnil\n");
        assert_eq!(out("var d = {}; d[\"k\"] = 5; out d.k;"), "5\n");
    }

    #[test]
    fn array_natives() {
        let src = "var a = [10, 20, 30]; out head(a); out tail(a); out length(a); out a[0];";
        assert_eq!(out(src), "10\n30\n1\n20\n");
    }

    #[test]
    fn append_and_prepend_mutate_in_place() {
        let src = "\
var a = [2];
append(a, 3);
prepend(a, 1);
out length(a); out a[0]; out a[1]; out a[2];
";
        assert_eq!(out(src), "3\n1\n2\n3\n");
    }

    #[test]
    fn rest_leaves_the_original_untouched() {
        let src = "var a = [1, 2, 3]; var r = rest(a); out length(r); out length(a); out r[0];";
        assert_eq!(out(src), "2\n3\n2\n");
    }

    #[test]
    fn head_of_empty_array_errors() {
        assert_eq!(runtime_message("head([]);").message, "head() called on an empty array.");
    }

    #[test]
    fn array_reads_are_lenient_writes_are_not() {
        assert_eq!(out("var a = [1]; out a[5];"), "nil\n");
        let e = runtime_message("var a = [1]; a[5] = 2;");
        assert_eq!(e.message, "Array index out of range.");
    }

    #[test]
    fn array_set_evaluates_to_nil() {
        assert_eq!(out("var a = [1]; out a[0] = 9; out a[0];"), "nil\n9\n");
    }

    #[test]
    fn instance_property_assignment_evaluates_to_the_value() {
        assert_eq!(out("class A {} var a = A(); out a.x = 3;"), "3\n");
    }

    #[test]
    fn return_kind_is_checked_at_runtime_too() {
        let e = runtime_message("fn f(a, b) @int { return a + b; } out f(\"x\", \"y\");");
        assert_eq!(e.message, "Invalid return type.");
    }

    #[test]
    fn stack_trace_walks_frames_newest_first() {
        let src = "fn boom() { return 1 + \"x\"; }\nfn mid() { return boom(); }\nmid();";
        let e = runtime_message(src);
        assert_eq!(e.trace.len(), 3);
        assert_eq!(e.trace[0].function.as_deref(), Some("boom"));
        assert_eq!(e.trace[0].line, 1);
        assert_eq!(e.trace[1].function.as_deref(), Some("mid"));
        assert_eq!(e.trace[1].line, 2);
        assert!(e.trace[2].function.is_none());
        assert_eq!(e.trace[2].line, 3);
    }

    #[test]
    fn host_clocks_back_the_time_natives() {
        assert_eq!(out("out clock(); out time();"), "0\n0\n");
    }

    #[test]
    fn term_resolves_to_the_exit_status() {
        let host = TestHost { term_status: 7.0, ..Default::default() };
        assert_eq!(eval_with(host, "out term(\"ls\");").unwrap(), "7\n");
    }

    #[test]
    fn import_runs_the_module_before_the_importer() {
        let mut host = TestHost::default();
        host.modules
            .insert("mathx".to_string(), "fn double(x) { return x * 2; }".to_string());
        assert_eq!(eval_with(host, "import mathx\nout double(21);").unwrap(), "42\n");
    }

    #[test]
    fn missing_import_is_a_compile_error() {
        let e = match eval_err("import nope\n") {
            EmbrError::Compile(e) => e,
            EmbrError::Runtime(_) => panic!("expected compile error"),
        };
        assert!(e.to_string().contains("Failed to load module 'nope'."));
    }

    #[test]
    fn native_arity_mismatch() {
        let e = runtime_message("length();");
        assert_eq!(e.message, "length() takes exactly 1 arguments but got 0.");
    }

    #[test]
    fn length_covers_strings_arrays_and_dicts() {
        assert_eq!(out("out length(\"four\");"), "4\n");
        assert_eq!(out("out length([1, 2]);"), "2\n");
        assert_eq!(out("out length({\"a\": 1});"), "1\n");
        let e = runtime_message("length(1);");
        assert_eq!(e.message, "length() argument must be a string, array, or dict.");
    }
}
