//! The VM execution engine: call frames, the value stack, instruction
//! dispatch, and the protocols for calls, properties, and indexing.
//!
//! The dispatch loop fetches bytes through the current frame's instruction
//! pointer. Runtime errors print a message and an innermost-first stack
//! trace, reset the stack, and surface as `InterpretError::Runtime`. Fatal
//! conditions set the `kill` flag, which is honored at the next dispatch
//! boundary.
//!
//! Collection runs only at VM allocation sites (`alloc`/`intern`), where
//! every transient object is reachable from the value stack; code that
//! builds compound objects keeps operands on the stack until the new object
//! has been pushed.

use std::io::{self, Write};
use std::time::Instant;

use super::chunk::{Chunk, OpCode};
use super::compiler;
use super::natives::{self, Builtins};
use super::object::{Heap, NativeFn, Obj, ObjClass, ObjClosure, ObjInstance, ObjRef, ObjUpvalue};
use super::table::Table;
use super::value::Value;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

/// One call's view of the world: the closure being run, the instruction
/// pointer into its chunk, and the stack index of slot zero.
#[derive(Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

/// What a callee turned out to be; extracted up front so the heap borrow is
/// released before the call mutates anything.
enum Callee {
    BoundMethod(Value, ObjRef),
    BoundNative(Value, NativeFn),
    Class,
    Closure,
    Native(NativeFn),
    NotCallable,
}

pub struct Vm {
    pub(crate) stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub(crate) heap: Heap,
    globals: Table,
    builtins: Builtins,
    /// Open upvalues, sorted by strictly descending stack slot.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    /// One-slot scratch register, moved to and from the stack by
    /// `GetReserve`/`SetReserve`.
    reserve: Value,
    kill: bool,
    pub(crate) start: Instant,
    output: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Build a VM whose `print` output goes to the given sink; tests capture
    /// program output this way.
    pub fn with_output(output: Box<dyn Write>) -> Vm {
        let mut heap = Heap::new();
        let init_string = heap.intern(b"init");
        let builtins = natives::create_builtins(&mut heap);
        let mut globals = Table::new();
        natives::define_globals(&mut heap, &mut globals);
        Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            heap,
            globals,
            builtins,
            open_upvalues: Vec::new(),
            init_string,
            reserve: Value::nil(),
            kill: false,
            start: Instant::now(),
            output,
        }
    }

    /// Collect after every VM allocation instead of waiting for pressure.
    pub fn stress_gc(&mut self) {
        self.heap.stress = true;
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            compiler::compile(source, &mut self.heap).map_err(|_| InterpretError::Compile)?;

        self.kill = false;
        self.push(Value::obj(function))?;
        let closure =
            self.alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::obj(closure))?;
        let callee = self.peek(0);
        self.call_value(callee, 0)?;

        self.run()
    }

    // -- Stack primitives --

    pub(crate) fn push(&mut self, value: Value) -> Result<(), InterpretError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Value {
        debug_assert!(!self.stack.is_empty(), "stack underflow");
        match self.stack.pop() {
            Some(value) => value,
            None => Value::nil(),
        }
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // -- Errors --

    /// Report a runtime error with a stack trace and unwind. Returns the
    /// error value so call sites can `return Err(self.runtime_error(...))`.
    pub(crate) fn runtime_error(&mut self, message: &str) -> InterpretError {
        eprintln!("{}", message);
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            match function.name {
                Some(name) => {
                    eprintln!("[line {}] in {}()", line, self.heap.string_lossy(name))
                }
                None => eprintln!("[line {}] in script", line),
            }
        }
        self.reset_stack();
        InterpretError::Runtime
    }

    /// Irrecoverable condition: report like a runtime error and arrange for
    /// the dispatch loop to stop at the next boundary.
    pub(crate) fn fatal_error(&mut self, message: &str) {
        self.runtime_error(message);
        self.kill = true;
    }

    // -- Allocation (the only GC trigger points) --

    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.stress || self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(obj)
    }

    pub(crate) fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        if self.heap.stress || self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(bytes)
    }

    fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated();

        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for upvalue in &self.open_upvalues {
            self.heap.mark_object(*upvalue);
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_table(&self.builtins.string_members);
        self.heap.mark_table(&self.builtins.list_members);
        self.heap.mark_table(&self.builtins.dict_members);
        self.heap.mark_table(&self.builtins.option_members);
        self.heap.mark_value(self.reserve);
        self.heap.mark_object(self.init_string);

        self.heap.trace();
        self.heap.remove_white_strings();
        self.heap.sweep();

        log::debug!(
            "gc: {} -> {} bytes, {} objects live",
            before,
            self.heap.bytes_allocated(),
            self.heap.live_objects()
        );
    }

    // -- Instruction fetch --

    fn frame(&self) -> &CallFrame {
        debug_assert!(!self.frames.is_empty());
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        debug_assert!(!self.frames.is_empty());
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn current_chunk(&self) -> &Chunk {
        let closure = self.heap.closure(self.frame().closure);
        &self.heap.function(closure.function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let byte = self.current_chunk().code[self.frame().ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let ip = self.frame().ip;
        let chunk = self.current_chunk();
        let short = u16::from_be_bytes([chunk.code[ip], chunk.code[ip + 1]]);
        self.frame_mut().ip += 2;
        short
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.current_chunk().constants[index]
    }

    /// Read a constant that the compiler guarantees is an interned string.
    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj()
    }

    // -- Value predicates --

    /// Falsy: `nil`, `false`, the number zero, and the none option.
    fn is_falsey(&self, value: Value) -> bool {
        value.is_nil()
            || (value.is_bool() && !value.as_bool())
            || (value.is_number() && value.as_number() == 0.0)
            || (value.is_obj() && matches!(self.heap.get(value.as_obj()), Obj::Option(None)))
    }

    fn string_hash(&self, name: ObjRef) -> u32 {
        self.heap.string(name).hash
    }

    // -- Call protocol --

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let arity = self.heap.function(self.heap.closure(closure).function).arity;
        if arg_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, arg_count);
            return Err(self.runtime_error(&message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots });
        Ok(())
    }

    fn call_native(&mut self, native: NativeFn, arg_count: usize) -> Result<(), InterpretError> {
        let base = self.stack.len() - arg_count;
        if !native(self, arg_count, base) {
            return Err(InterpretError::Runtime);
        }
        let result = self.pop();
        self.stack.truncate(self.stack.len() - arg_count - 1);
        self.push(result)
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), InterpretError> {
        let kind = if callee.is_obj() {
            match self.heap.get(callee.as_obj()) {
                Obj::BoundMethod { receiver, method } => Callee::BoundMethod(*receiver, *method),
                Obj::BoundNative { receiver, native } => Callee::BoundNative(*receiver, *native),
                Obj::Class(_) => Callee::Class,
                Obj::Closure(_) => Callee::Closure,
                Obj::Native(native) => Callee::Native(*native),
                _ => Callee::NotCallable,
            }
        } else {
            Callee::NotCallable
        };

        match kind {
            Callee::BoundMethod(receiver, method) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::BoundNative(receiver, native) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_native(native, arg_count)
            }
            Callee::Class => {
                let class = callee.as_obj();
                let instance =
                    self.alloc(Obj::Instance(ObjInstance { class, fields: Table::new() }));
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::obj(instance);

                let hash = self.string_hash(self.init_string);
                let initializer =
                    self.heap.class(class).methods.get(Value::obj(self.init_string), hash);
                match initializer {
                    Some(init) => self.call_closure(init.as_obj(), arg_count),
                    None if arg_count != 0 => {
                        let message = format!("Expected 0 arguments but got {}.", arg_count);
                        Err(self.runtime_error(&message))
                    }
                    None => Ok(()),
                }
            }
            Callee::Closure => self.call_closure(callee.as_obj(), arg_count),
            Callee::Native(native) => self.call_native(native, arg_count),
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes."))
            }
        }
    }

    // -- Property protocol --

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), InterpretError> {
        let hash = self.string_hash(name);
        let method = self.heap.class(class).methods.get(Value::obj(name), hash);
        let Some(method) = method else {
            let message = format!("Undefined property '{}'.", self.heap.string_lossy(name));
            return Err(self.runtime_error(&message));
        };

        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod { receiver, method: method.as_obj() });
        self.pop();
        self.push(Value::obj(bound))
    }

    /// The member table for a built-in receiver type, if it has one.
    fn member_table(&self, receiver: Value) -> Option<&Table> {
        match self.heap.get(receiver.as_obj()) {
            Obj::String(_) => Some(&self.builtins.string_members),
            Obj::List(_) => Some(&self.builtins.list_members),
            Obj::Dict(_) => Some(&self.builtins.dict_members),
            Obj::Option(_) => Some(&self.builtins.option_members),
            _ => None,
        }
    }

    fn builtin_member(&self, receiver: Value, name: ObjRef) -> Option<NativeFn> {
        let table = self.member_table(receiver)?;
        let member = table.get(Value::obj(name), self.string_hash(name))?;
        match self.heap.get(member.as_obj()) {
            Obj::Native(native) => Some(*native),
            _ => None,
        }
    }

    fn get_property(&mut self, name: ObjRef) -> Result<(), InterpretError> {
        let receiver = self.peek(0);
        if receiver.is_obj() {
            if let Obj::Instance(instance) = self.heap.get(receiver.as_obj()) {
                let class = instance.class;
                let hash = self.string_hash(name);
                let field = self
                    .heap
                    .instance(receiver.as_obj())
                    .fields
                    .get(Value::obj(name), hash);
                if let Some(field) = field {
                    self.pop();
                    return self.push(field);
                }
                return self.bind_method(class, name);
            }

            if self.member_table(receiver).is_some() {
                // `length` reads as a plain property; other members bind so
                // they can be called (or passed around) later.
                if self.heap.string_bytes(name) == b"length" {
                    let len = match self.heap.get(receiver.as_obj()) {
                        Obj::String(s) => Some(s.chars.len()),
                        Obj::List(values) => Some(values.len()),
                        Obj::Dict(table) => Some(table.len()),
                        _ => None,
                    };
                    if let Some(len) = len {
                        self.pop();
                        return self.push(Value::number(len as f64));
                    }
                }
                if let Some(native) = self.builtin_member(receiver, name) {
                    let bound = self.alloc(Obj::BoundNative { receiver, native });
                    self.pop();
                    return self.push(Value::obj(bound));
                }
                let message =
                    format!("Undefined property '{}'.", self.heap.string_lossy(name));
                return Err(self.runtime_error(&message));
            }
        }
        Err(self.runtime_error("Value has no properties."))
    }

    fn set_property(&mut self, name: ObjRef) -> Result<(), InterpretError> {
        let object = self.peek(1);
        let value = self.peek(0);
        if object.is_obj() {
            if let Obj::Instance(_) = self.heap.get(object.as_obj()) {
                let hash = self.string_hash(name);
                self.heap
                    .instance_mut(object.as_obj())
                    .fields
                    .set(Value::obj(name), hash, value);
                self.pop();
                self.pop();
                return self.push(value);
            }
        }
        Err(self.runtime_error("Value has no fields."))
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let hash = self.string_hash(name);
        let method = self.heap.class(class).methods.get(Value::obj(name), hash);
        match method {
            Some(method) => self.call_closure(method.as_obj(), arg_count),
            None => {
                let message =
                    format!("Undefined property '{}'.", self.heap.string_lossy(name));
                Err(self.runtime_error(&message))
            }
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let receiver = self.peek(arg_count);
        if receiver.is_obj() {
            if let Obj::Instance(instance) = self.heap.get(receiver.as_obj()) {
                let class = instance.class;
                let hash = self.string_hash(name);
                let field = self
                    .heap
                    .instance(receiver.as_obj())
                    .fields
                    .get(Value::obj(name), hash);
                // A field shadows the method table and is called unbound.
                if let Some(field) = field {
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = field;
                    return self.call_value(field, arg_count);
                }
                return self.invoke_from_class(class, name, arg_count);
            }

            if self.member_table(receiver).is_some() {
                if let Some(native) = self.builtin_member(receiver, name) {
                    let bound = self.alloc(Obj::BoundNative { receiver, native });
                    return self.call_value(Value::obj(bound), arg_count);
                }
                let message = format!("Undefined method '{}'.", self.heap.string_lossy(name));
                return Err(self.runtime_error(&message));
            }
        }
        Err(self.runtime_error("Value has no properties."))
    }

    // -- Index protocol --

    fn check_index(&mut self, index: Value, len: usize, what: &str) -> Result<usize, InterpretError> {
        if !index.is_number() {
            let message = format!("{} index must be a number.", what);
            return Err(self.runtime_error(&message));
        }
        let n = index.as_number();
        if n != n.floor() {
            let message = format!("{} index must be a whole number.", what);
            return Err(self.runtime_error(&message));
        }
        if n < 0.0 || n >= len as f64 {
            let message = format!("{} index out of bounds.", what);
            return Err(self.runtime_error(&message));
        }
        Ok(n as usize)
    }

    fn get_index(&mut self, object: Value, index: Value) -> Result<(), InterpretError> {
        if object.is_obj() {
            match self.heap.get(object.as_obj()) {
                Obj::Dict(_) => {
                    let Some(hash) = self.heap.hash_value(index) else {
                        self.fatal_error("Unhashable type.");
                        return Err(InterpretError::Runtime);
                    };
                    let value = match self.heap.get(object.as_obj()) {
                        Obj::Dict(table) => table.get(index, hash),
                        _ => None,
                    };
                    return match value {
                        Some(value) => self.push(value),
                        None => Err(self.runtime_error("Dict key not present.")),
                    };
                }
                Obj::List(values) => {
                    let len = values.len();
                    let i = self.check_index(index, len, "List")?;
                    let value = match self.heap.get(object.as_obj()) {
                        Obj::List(values) => values[i],
                        _ => Value::nil(),
                    };
                    return self.push(value);
                }
                Obj::String(s) => {
                    let len = s.chars.len();
                    let i = self.check_index(index, len, "String")?;
                    // One raw byte, as a length-1 string.
                    let byte = match self.heap.get(object.as_obj()) {
                        Obj::String(s) => s.chars[i],
                        _ => 0,
                    };
                    let interned = self.intern(&[byte]);
                    return self.push(Value::obj(interned));
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only index lists and strings."))
    }

    fn set_index(
        &mut self,
        object: Value,
        index: Value,
        value: Value,
    ) -> Result<(), InterpretError> {
        if object.is_obj() {
            match self.heap.get(object.as_obj()) {
                Obj::Dict(_) => {
                    let Some(hash) = self.heap.hash_value(index) else {
                        self.fatal_error("Unhashable type.");
                        return Err(InterpretError::Runtime);
                    };
                    if let Obj::Dict(table) = self.heap.get_mut(object.as_obj()) {
                        table.set(index, hash, value);
                    }
                    return Ok(());
                }
                Obj::List(values) => {
                    let len = values.len();
                    let i = self.check_index(index, len, "List")?;
                    if let Obj::List(values) = self.heap.get_mut(object.as_obj()) {
                        values[i] = value;
                    }
                    return Ok(());
                }
                Obj::String(_) => {
                    return Err(self.runtime_error("Cannot assign to string indexes."));
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only index lists and strings."))
    }

    // -- Upvalues --

    /// Find or create the open upvalue for a stack slot; the list stays
    /// sorted by descending slot and holds at most one entry per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match self.heap.upvalue(upvalue) {
                ObjUpvalue::Open(s) if *s > slot => continue,
                ObjUpvalue::Open(s) if *s == slot => return upvalue,
                ObjUpvalue::Open(_) => {
                    insert_at = i;
                    break;
                }
                ObjUpvalue::Closed(_) => unreachable!("closed upvalue in the open list"),
            }
        }

        let created = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at or above `last`, moving the stack value
    /// into the upvalue's own cell.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(upvalue) {
                ObjUpvalue::Open(slot) => *slot,
                ObjUpvalue::Closed(_) => unreachable!("closed upvalue in the open list"),
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    /// How many upvalues are currently open; the GC invariant tests use it.
    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    pub fn stack_height(&self) -> usize {
        self.stack.len()
    }

    // -- String concatenation --

    fn concatenate(&mut self) -> Result<(), InterpretError> {
        let b = self.peek(0);
        let a = self.peek(1);
        let mut bytes = Vec::new();
        if let Some(s) = self.heap.as_string(a) {
            bytes.extend_from_slice(s);
        }
        if let Some(s) = self.heap.as_string(b) {
            bytes.extend_from_slice(s);
        }
        let result = self.intern(&bytes);
        self.pop();
        self.pop();
        self.push(Value::obj(result))
    }

    // -- Dispatch --

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(self.runtime_error("Unknown opcode."));
            };

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant)?;
                }
                OpCode::Nil => self.push(Value::nil())?,
                OpCode::True => self.push(Value::boolean(true))?,
                OpCode::False => self.push(Value::boolean(false))?,
                OpCode::Int => {
                    let n = self.read_byte();
                    self.push(Value::number(n as f64))?;
                }
                OpCode::List => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let values = self.stack[start..].to_vec();
                    let list = self.alloc(Obj::List(values));
                    self.stack.truncate(start);
                    self.push(Value::obj(list))?;
                }
                OpCode::Dict => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - 2 * count;
                    let mut table = Table::new();
                    for i in 0..count {
                        let key = self.stack[start + 2 * i];
                        let value = self.stack[start + 2 * i + 1];
                        let Some(hash) = self.heap.hash_value(key) else {
                            self.fatal_error("Unhashable type.");
                            return Err(InterpretError::Runtime);
                        };
                        table.set(key, hash, value);
                    }
                    let dict = self.alloc(Obj::Dict(table));
                    self.stack.truncate(start);
                    self.push(Value::obj(dict))?;
                }
                OpCode::Some => {
                    let value = self.peek(0);
                    let option = self.alloc(Obj::Option(Some(value)));
                    self.pop();
                    self.push(Value::obj(option))?;
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let index = self.frame().slots + slot;
                    let value = self.peek(0);
                    self.stack[index] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.string_hash(name);
                    match self.globals.get(Value::obj(name), hash) {
                        Some(value) => self.push(value)?,
                        None => {
                            let message = format!(
                                "Undefined variable '{}'.",
                                self.heap.string_lossy(name)
                            );
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.string_hash(name);
                    let value = self.pop();
                    self.globals.set(Value::obj(name), hash, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.string_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(Value::obj(name), hash, value) {
                        self.globals.delete(Value::obj(name), hash);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.string_lossy(name));
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(stack_slot) => self.stack[*stack_slot],
                        ObjUpvalue::Closed(value) => *value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    match self.heap.upvalue_mut(upvalue) {
                        ObjUpvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.stack[stack_slot] = value;
                        }
                        ObjUpvalue::Closed(cell) => *cell = value,
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    self.get_property(name)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    self.set_property(name)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop();
                    self.bind_method(superclass.as_obj(), name)?;
                }
                OpCode::GetIndex => {
                    let index = self.pop();
                    let object = self.pop();
                    self.get_index(object, index)?;
                }
                OpCode::SetIndex => {
                    let value = self.pop();
                    let index = self.pop();
                    let object = self.pop();
                    self.set_index(object, index, value)?;
                    self.push(value)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a.equals(b)))?;
                }
                OpCode::Greater | OpCode::Less | OpCode::Subtract | OpCode::Multiply
                | OpCode::Divide => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        return Err(self.runtime_error("Operands must be numbers."));
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    let result = match op {
                        OpCode::Greater => Value::boolean(a > b),
                        OpCode::Less => Value::boolean(a < b),
                        OpCode::Subtract => Value::number(a - b),
                        OpCode::Multiply => Value::number(a * b),
                        OpCode::Divide => Value::number(a / b),
                        _ => unreachable!(),
                    };
                    self.push(result)?;
                }
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if self.heap.as_string(a).is_some() && self.heap.as_string(b).is_some() {
                        self.concatenate()?;
                    } else if a.is_number() && b.is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::number(a + b))?;
                    } else {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    let falsey = self.is_falsey(value);
                    self.push(Value::boolean(falsey))?;
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(self.runtime_error("Operand must be a number."));
                    }
                    let n = self.pop().as_number();
                    self.push(Value::number(-n))?;
                }
                OpCode::Print => {
                    let text = self.heap.value_to_string(self.peek(0));
                    let _ = writeln!(self.output, "{}", text);
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    let condition = self.peek(0);
                    if self.is_falsey(condition) {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::NextJump => {
                    let offset = self.read_short() as usize;
                    let index = self.pop().as_number() as usize;
                    let iterable = self.peek(0);

                    enum Step {
                        NotIterable,
                        Exhausted,
                        Element(Value),
                        Char(u8),
                    }
                    let step = if iterable.is_obj() {
                        match self.heap.get(iterable.as_obj()) {
                            Obj::List(values) => match values.get(index) {
                                Some(&value) => Step::Element(value),
                                None => Step::Exhausted,
                            },
                            Obj::String(s) => match s.chars.get(index) {
                                Some(&byte) => Step::Char(byte),
                                None => Step::Exhausted,
                            },
                            _ => Step::NotIterable,
                        }
                    } else {
                        Step::NotIterable
                    };

                    match step {
                        Step::NotIterable => {
                            return Err(self.runtime_error("Can only iterate list or string."));
                        }
                        // On exhaustion nothing is pushed; the loop's exit
                        // edge leaves only the iterable behind.
                        Step::Exhausted => {
                            self.frame_mut().ip += offset;
                        }
                        Step::Element(value) => {
                            self.push(Value::number(index as f64 + 1.0))?;
                            self.push(value)?;
                        }
                        Step::Char(byte) => {
                            self.push(Value::number(index as f64 + 1.0))?;
                            // A single raw byte as a length-1 string.
                            let interned = self.intern(&[byte]);
                            self.push(Value::obj(interned))?;
                        }
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop();
                    self.invoke_from_class(superclass.as_obj(), name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = self.read_constant().as_obj();
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::obj(closure))?;

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        match self.heap.get_mut(closure) {
                            Obj::Closure(c) => c.upvalues.push(upvalue),
                            _ => unreachable!("closure slot changed type"),
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = *self.frame();
                    self.close_upvalues(frame.slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // Discard the script function itself and finish.
                        self.stack.truncate(frame.slots);
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result)?;
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class =
                        self.alloc(Obj::Class(ObjClass { name, methods: Table::new() }));
                    self.push(Value::obj(class))?;
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let is_class = superclass.is_obj()
                        && matches!(self.heap.get(superclass.as_obj()), Obj::Class(_));
                    if !is_class {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    let methods = self.heap.class(superclass.as_obj()).methods.clone();
                    let subclass = self.peek(0).as_obj();
                    Table::add_all(&methods, &mut self.heap.class_mut(subclass).methods);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let hash = self.string_hash(name);
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj();
                    self.heap.class_mut(class).methods.set(Value::obj(name), hash, method);
                    self.pop();
                }
                OpCode::GetReserve => {
                    let value = self.reserve;
                    self.push(value)?;
                }
                OpCode::SetReserve => {
                    self.reserve = self.pop();
                }
            }

            if self.kill {
                return Err(InterpretError::Runtime);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests (hand-assembled chunks and VM internals)
// ---------------------------------------------------------------------------
