//! # VM Module
//!
//! The register interpreter.
//!
//! An [`ExecState`] runs one instruction at a time for the frame on top of
//! its call stack. Script calls recurse into [`ExecState::call_script`], so
//! each Rust-level call owns exactly one frame and pops it on every exit
//! path; an error unwinds frame by frame up to the outermost `exec`.
//!
//! ## Register storage
//! Frames take their locals from a pre-sized arena, reclaimed in LIFO order.
//! When the arena is exhausted (and for coroutines, whose registers outlive
//! the call) a frame owns a heap vector instead.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{ExecError, ExecResult};
use crate::gc::{Array, Coroutine, Gc, GcHeap, HeapAudit};
use crate::instruction::{Instruction, Opcode, Operand, Scope, RETURN_LAST, RETURN_REGISTER};
use crate::runtime::Runtime;
use crate::script::Actor;
use crate::value::{InternedString, PublicType, Value};

// -----------------------------------------------------------------------------
// CONFIGURATION
// -----------------------------------------------------------------------------

/// Tunables for one execution state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    /// Size of the local register arena shared by stack frames.
    pub max_local_registers: usize,
    /// Cap on live GC objects; `None` is unbounded.
    pub max_gc_objects: Option<usize>,
    /// Deepest call nesting before calls fail with `RegisterOverflow`.
    pub max_call_depth: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_local_registers: 4096,
            max_gc_objects: None,
            max_call_depth: 256,
        }
    }
}

// -----------------------------------------------------------------------------
// CALL FRAMES
// -----------------------------------------------------------------------------

/// Outcome of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Continue,
    Return,
}

#[derive(Debug)]
enum Storage {
    /// Registers `start..start + n` of the arena.
    Stack { start: usize },
    Heap(Vec<Value>),
}

#[derive(Debug)]
struct FunctionCall {
    actor: Actor,
    storage: Storage,
    num_registers: usize,
    num_args: usize,
    ip: usize,
    return_value: Value,
    /// Where a coroutine continues after this frame's `Return`.
    resume_at: Option<usize>,
}

// -----------------------------------------------------------------------------
// EXEC STATE
// -----------------------------------------------------------------------------

/// One interpreter: call stack, local register arena and GC heap.
pub struct ExecState {
    runtime: Arc<Runtime>,
    config: ExecConfig,
    locals: Vec<Value>,
    used_locals: usize,
    calls: Vec<FunctionCall>,
    heap: GcHeap,
}

impl ExecState {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self::with_config(runtime, ExecConfig::default())
    }

    pub fn with_config(runtime: Arc<Runtime>, config: ExecConfig) -> Self {
        let mut locals = Vec::new();
        locals.resize_with(config.max_local_registers, Value::default);
        Self {
            runtime,
            heap: GcHeap::new(config.max_gc_objects),
            config,
            locals,
            used_locals: 0,
            calls: Vec::new(),
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    #[inline]
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn heap(&self) -> &GcHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut GcHeap {
        &mut self.heap
    }

    /// Prunes freed objects from the heap registry.
    pub fn collect_garbage(&mut self) -> usize {
        self.heap.collect()
    }

    pub fn audit_heap(&self) -> HeapAudit {
        self.heap.audit()
    }

    /// Number of active frames.
    pub fn call_depth(&self) -> usize {
        self.calls.len()
    }

    /// Arena registers in use by stack frames.
    pub fn used_locals(&self) -> usize {
        self.used_locals
    }

    /// Runs script function `address` of `actor` with `args` and returns its
    /// result. Every frame pushed during the call is gone when this returns.
    pub fn exec(&mut self, actor: &Actor, address: u32, args: &[Value]) -> ExecResult<Value> {
        let args = args.iter().map(Value::share).collect::<ExecResult<Vec<_>>>()?;
        self.call_script(actor.clone(), address, args, None)
    }

    pub fn exec_by_name(&mut self, actor: &Actor, name: &str, args: &[Value]) -> ExecResult<Value> {
        let address = actor
            .script()
            .function_address(name)
            .ok_or(ExecError::ScriptFunctionNotFound)?;
        self.exec(actor, address, args)
    }

    // -------------------------------------------------------------------------
    // NATIVE FUNCTION API
    // -------------------------------------------------------------------------

    /// Argument `index` of the running native function.
    pub fn argument(&self, index: usize) -> ExecResult<Value> {
        let call = self.calls.last().ok_or(ExecError::InternalBufferOverrun)?;
        if index >= call.num_args {
            return Err(ExecError::IndexOutOfBounds);
        }
        self.read(Operand::local(index as u32))
    }

    pub fn arg_count(&self) -> usize {
        self.calls.last().map_or(0, |call| call.num_args)
    }

    /// Sets the value the running function returns.
    pub fn set_return(&mut self, value: Value) -> ExecResult<()> {
        let call = self
            .calls
            .last_mut()
            .ok_or(ExecError::InternalBufferOverrun)?;
        call.return_value = value;
        Ok(())
    }

    /// The actor whose code is running.
    pub fn actor(&self) -> Option<Actor> {
        self.calls.last().map(|call| call.actor.clone())
    }

    pub fn intern(&self, s: &str) -> Value {
        Value::Str(self.runtime.intern(s))
    }

    pub fn new_array(&mut self, values: Vec<Value>) -> ExecResult<Value> {
        Ok(Value::Array(self.heap.alloc_array_from(values)?))
    }

    // -------------------------------------------------------------------------
    // CALLS
    // -------------------------------------------------------------------------

    fn check_depth(&self) -> ExecResult<()> {
        if self.calls.len() >= self.config.max_call_depth {
            return Err(ExecError::RegisterOverflow);
        }
        Ok(())
    }

    /// Reserves `n` registers, from the arena when it has room.
    fn alloc_storage(&mut self, n: usize) -> ExecResult<Storage> {
        if self.used_locals + n <= self.locals.len() {
            let start = self.used_locals;
            self.used_locals += n;
            return Ok(Storage::Stack { start });
        }
        debug!(registers = n, "local arena exhausted, frame on heap");
        let mut registers = Vec::new();
        registers
            .try_reserve_exact(n)
            .map_err(|_| ExecError::OutOfMemory)?;
        registers.resize_with(n, Value::default);
        Ok(Storage::Heap(registers))
    }

    fn push_call(&mut self, actor: Actor, storage: Storage, num_registers: usize, ip: usize, args: Vec<Value>) -> ExecResult<()> {
        let num_args = args.len();
        self.calls
            .try_reserve(1)
            .map_err(|_| ExecError::OutOfMemory)?;
        self.calls.push(FunctionCall {
            actor,
            storage,
            num_registers,
            num_args,
            ip,
            return_value: Value::Null,
            resume_at: None,
        });
        for (i, arg) in args.into_iter().enumerate() {
            self.write(Operand::local(i as u32), arg)?;
        }
        Ok(())
    }

    /// Pops the top frame, releasing its arena registers.
    fn pop_call(&mut self) -> ExecResult<FunctionCall> {
        let call = self.calls.pop().ok_or(ExecError::InternalBufferOverrun)?;
        if let Storage::Stack { start } = call.storage {
            let end = (start + call.num_registers).min(self.locals.len());
            for slot in &mut self.locals[start..end] {
                *slot = Value::Null;
            }
            self.used_locals = start;
        }
        Ok(call)
    }

    fn call_script(
        &mut self,
        actor: Actor,
        address: u32,
        args: Vec<Value>,
        coroutine: Option<Gc<Coroutine>>,
    ) -> ExecResult<Value> {
        self.check_depth()?;
        let function = actor
            .script()
            .function(address)
            .ok_or(ExecError::ScriptFunctionNotFound)?;
        let (start, registers_needed) = (function.start, function.registers_needed);

        let resumed = coroutine.as_ref().and_then(|co| {
            let mut co = co.borrow_mut();
            let ip = co.resume_at?;
            Some((std::mem::take(&mut co.registers), ip))
        });

        match resumed {
            Some((registers, ip)) => {
                // A started coroutine ignores the arguments of its resume.
                let n = registers.len();
                self.push_call(actor, Storage::Heap(registers), n, ip, Vec::new())?;
            }
            None => {
                if args.len() > registers_needed {
                    return Err(ExecError::RegisterOverflow);
                }
                let storage = match &coroutine {
                    Some(co) => {
                        co.borrow_mut().num_args = args.len();
                        let mut registers = Vec::new();
                        registers
                            .try_reserve_exact(registers_needed)
                            .map_err(|_| ExecError::OutOfMemory)?;
                        registers.resize_with(registers_needed, Value::default);
                        Storage::Heap(registers)
                    }
                    None => self.alloc_storage(registers_needed)?,
                };
                if let Err(e) = self.push_call(actor, storage, registers_needed, start, args) {
                    self.pop_call()?;
                    return Err(e);
                }
            }
        }

        let result = self.run();
        let call = self.pop_call()?;

        if let Some(co) = coroutine {
            let mut co = co.borrow_mut();
            match (&result, call.storage) {
                (Ok(()), Storage::Heap(registers)) if call.resume_at.is_some() => {
                    co.registers = registers;
                    co.resume_at = call.resume_at;
                }
                _ => {
                    co.registers = Vec::new();
                    co.resume_at = None;
                }
            }
        }

        result.map(|()| call.return_value)
    }

    fn call_native(&mut self, actor: Actor, address: u32, args: Vec<Value>) -> ExecResult<Value> {
        self.check_depth()?;
        let callback = self
            .runtime
            .native_function(address)
            .map_err(|_| ExecError::NativeFunctionNotFound)?;

        let n = args.len();
        let storage = self.alloc_storage(n)?;
        if let Err(e) = self.push_call(actor, storage, n, 0, args) {
            self.pop_call()?;
            return Err(e);
        }

        let result = callback(self);
        let call = self.pop_call()?;
        result.map(|()| call.return_value)
    }

    /// Calls whatever `callee` holds.
    fn invoke(&mut self, callee: Value, args: Vec<Value>) -> ExecResult<Value> {
        let actor = self.actor().ok_or(ExecError::InternalBufferOverrun)?;
        match callee {
            Value::ScriptFunction(address) => self.call_script(actor, address, args, None),
            Value::NativeFunction(address) => self.call_native(actor, address, args),
            Value::Coroutine(co) => {
                let function = co.borrow().function();
                self.call_script(actor, function, args, Some(co))
            }
            _ => Err(ExecError::UnexpectedDataType),
        }
    }

    /// Reads the `FunctionArg` run at the current instruction pointer and
    /// moves past it.
    fn take_call_args(&mut self) -> ExecResult<Vec<Value>> {
        let (script, ip) = {
            let call = self.calls.last().ok_or(ExecError::InternalBufferOverrun)?;
            (Arc::clone(call.actor.script()), call.ip)
        };
        let instructions = script.instructions();

        let count = match instructions.get(ip) {
            Some(ins) if ins.op() == Some(Opcode::FunctionArg) => ins.bx_unsigned() as usize,
            _ => return Ok(Vec::new()),
        };

        let mut args = Vec::new();
        args.try_reserve_exact(count)
            .map_err(|_| ExecError::OutOfMemory)?;
        for i in 0..count {
            let ins = instructions
                .get(ip + i)
                .filter(|ins| ins.op() == Some(Opcode::FunctionArg))
                .ok_or(ExecError::InstructionOverflow)?;
            args.push(self.read(ins.register_a())?);
        }

        self.set_ip(ip + count)?;
        Ok(args)
    }

    // -------------------------------------------------------------------------
    // REGISTERS
    // -------------------------------------------------------------------------

    fn read(&self, operand: Operand) -> ExecResult<Value> {
        let call = self.calls.last().ok_or(ExecError::InternalBufferOverrun)?;
        let index = operand.index as usize;
        match operand.scope {
            Scope::Local => {
                if index >= call.num_registers {
                    return Err(ExecError::InternalBufferOverrun);
                }
                let slot = match &call.storage {
                    Storage::Stack { start } => self.locals.get(start + index),
                    Storage::Heap(registers) => registers.get(index),
                };
                slot.ok_or(ExecError::InternalBufferOverrun)?.share()
            }
            Scope::Global => call
                .actor
                .globals()
                .get(index)
                .ok_or(ExecError::InternalBufferOverrun)?
                .share(),
        }
    }

    fn write(&mut self, operand: Operand, value: Value) -> ExecResult<()> {
        let Self { calls, locals, .. } = self;
        let call = calls.last_mut().ok_or(ExecError::InternalBufferOverrun)?;
        let index = operand.index as usize;
        let old = match operand.scope {
            Scope::Local => {
                if index >= call.num_registers {
                    return Err(ExecError::InternalBufferOverrun);
                }
                let slot = match &mut call.storage {
                    Storage::Stack { start } => locals.get_mut(*start + index),
                    Storage::Heap(registers) => registers.get_mut(index),
                };
                std::mem::replace(slot.ok_or(ExecError::InternalBufferOverrun)?, value)
            }
            Scope::Global => {
                let mut globals = call.actor.globals_mut();
                let slot = globals
                    .get_mut(index)
                    .ok_or(ExecError::InternalBufferOverrun)?;
                std::mem::replace(slot, value)
            }
        };
        drop(old);
        Ok(())
    }

    fn set_ip(&mut self, ip: usize) -> ExecResult<()> {
        let call = self
            .calls
            .last_mut()
            .ok_or(ExecError::InternalBufferOverrun)?;
        call.ip = ip;
        Ok(())
    }

    fn ip(&self) -> ExecResult<usize> {
        self.calls
            .last()
            .map(|call| call.ip)
            .ok_or(ExecError::InternalBufferOverrun)
    }

    #[inline]
    fn advance(&mut self) -> ExecResult<ExecStatus> {
        let ip = self.ip()?;
        self.set_ip(ip + 1)?;
        Ok(ExecStatus::Continue)
    }

    fn jump(&mut self, offset: i32) -> ExecResult<ExecStatus> {
        let ip = self.ip()? as i64 + offset as i64;
        let ip = usize::try_from(ip).map_err(|_| ExecError::InstructionOverflow)?;
        self.set_ip(ip)?;
        Ok(ExecStatus::Continue)
    }

    // -------------------------------------------------------------------------
    // DISPATCH
    // -------------------------------------------------------------------------

    fn run(&mut self) -> ExecResult<()> {
        loop {
            let (ins, ip) = {
                let call = self.calls.last().ok_or(ExecError::InternalBufferOverrun)?;
                let ins = call
                    .actor
                    .script()
                    .instructions()
                    .get(call.ip)
                    .copied()
                    .ok_or(ExecError::InstructionOverflow)?;
                (ins, call.ip)
            };
            trace!(ip, ins = ?ins, depth = self.calls.len(), "dispatch");

            if self.step(ins)? == ExecStatus::Return {
                return Ok(());
            }
        }
    }

    fn step(&mut self, ins: Instruction) -> ExecResult<ExecStatus> {
        let op = ins.op().ok_or(ExecError::UnrecognisedOperation)?;
        let (a, b, c) = (ins.register_a(), ins.register_b(), ins.register_c());

        match op {
            Opcode::Move => {
                let value = self.read(b)?;
                self.write(a, value)?;
                self.advance()
            }

            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Power => {
                let left = self.read(b)?;
                let right = self.read(c)?;
                let value = self.arithmetic(op, &left, &right)?;
                self.write(a, value)?;
                self.advance()
            }

            Opcode::Equals | Opcode::NotEquals => {
                let equal = self.read(b)? == self.read(c)?;
                let result = if op == Opcode::Equals { equal } else { !equal };
                self.write(a, Value::Int(result as i64))?;
                self.advance()
            }

            Opcode::LessThan
            | Opcode::LessThanEquals
            | Opcode::MoreThan
            | Opcode::MoreThanEquals => {
                let result = compare(op, &self.read(b)?, &self.read(c)?)?;
                self.write(a, Value::Int(result as i64))?;
                self.advance()
            }

            Opcode::LogicalAnd | Opcode::LogicalOr => {
                let left = self.read(b)?.is_truthy();
                let right = self.read(c)?.is_truthy();
                let result = if op == Opcode::LogicalAnd {
                    left && right
                } else {
                    left || right
                };
                self.write(a, Value::Int(result as i64))?;
                self.advance()
            }

            Opcode::ConditionalGoto => {
                if self.read(a)?.is_truthy() {
                    self.advance()
                } else {
                    self.jump(ins.bx_signed())
                }
            }

            Opcode::Goto => self.jump(ins.ax_signed()),

            Opcode::Return => {
                let flags = ins.bx_unsigned();
                let value = if flags & RETURN_REGISTER != 0 {
                    self.read(a)?
                } else {
                    Value::Null
                };
                let call = self
                    .calls
                    .last_mut()
                    .ok_or(ExecError::InternalBufferOverrun)?;
                call.return_value = value;
                call.resume_at = if flags & RETURN_LAST != 0 {
                    None
                } else {
                    Some(call.ip + 1)
                };
                Ok(ExecStatus::Return)
            }

            // Arguments are consumed by the call before them.
            Opcode::FunctionArg => self.advance(),

            Opcode::NativeFunction | Opcode::ScriptFunction => {
                self.advance()?;
                let args = self.take_call_args()?;
                let actor = self.actor().ok_or(ExecError::InternalBufferOverrun)?;
                let address = ins.bx_unsigned();
                let value = if op == Opcode::NativeFunction {
                    self.call_native(actor, address, args)?
                } else {
                    self.call_script(actor, address, args, None)?
                };
                self.write(a, value)?;
                Ok(ExecStatus::Continue)
            }

            Opcode::Invoke => {
                let callee = self.read(b)?;
                self.advance()?;
                let args = self.take_call_args()?;
                let value = self.invoke(callee, args)?;
                self.write(a, value)?;
                Ok(ExecStatus::Continue)
            }

            Opcode::NewArray => {
                let len = match self.read(b)? {
                    Value::Int(n) => usize::try_from(n).map_err(|_| ExecError::IndexOutOfBounds)?,
                    _ => return Err(ExecError::UnexpectedDataType),
                };
                let array = self.heap.alloc_array(len)?;
                self.write(a, Value::Array(array))?;
                self.advance()
            }

            Opcode::NewObject => {
                let object = self.heap.alloc_object()?;
                self.write(a, Value::Object(object))?;
                self.advance()
            }

            Opcode::ComplexGet => {
                let value = self.complex_get(&self.read(b)?, &self.read(c)?)?;
                self.write(a, value)?;
                self.advance()
            }

            Opcode::ComplexSet => {
                let container = self.read(a)?;
                let key = self.read(b)?;
                let value = self.read(c)?;
                complex_set(&container, &key, value)?;
                self.advance()
            }

            Opcode::ComplexShift => {
                let value = complex_shift(&self.read(b)?, &self.read(c)?)?;
                self.write(a, value)?;
                self.advance()
            }

            Opcode::Is => {
                let value = self.read(b)?;
                let ty = match self.read(c)? {
                    Value::Type(ty) => ty,
                    other => other.public_type(),
                };
                self.write(a, Value::Int((value.public_type() == ty) as i64))?;
                self.advance()
            }

            Opcode::As => {
                let value = self.read(b)?;
                let Value::Type(to) = self.read(c)? else {
                    return Err(ExecError::UnexpectedDataType);
                };
                let converted = self.convert(value, to)?;
                self.write(a, converted)?;
                self.advance()
            }
        }
    }

    // -------------------------------------------------------------------------
    // HANDLERS
    // -------------------------------------------------------------------------

    fn arithmetic(&mut self, op: Opcode, left: &Value, right: &Value) -> ExecResult<Value> {
        if op == Opcode::Divide && right.is_zero_payload() {
            return Err(ExecError::DivideByZero);
        }

        match (left, right) {
            (Value::Int(l), Value::Int(r)) => Ok(Value::Int(match op {
                Opcode::Add => l.wrapping_add(*r),
                Opcode::Subtract => l.wrapping_sub(*r),
                Opcode::Multiply => l.wrapping_mul(*r),
                Opcode::Divide => l.wrapping_div(*r),
                _ => (*l as f64).powf(*r as f64) as i64,
            })),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let (l, r) = (
                    left.as_number().unwrap_or_default(),
                    right.as_number().unwrap_or_default(),
                );
                Ok(Value::Float(match op {
                    Opcode::Add => l + r,
                    Opcode::Subtract => l - r,
                    Opcode::Multiply => l * r,
                    Opcode::Divide => l / r,
                    _ => l.powf(r),
                }))
            }
            (Value::Str(l), Value::Str(r)) if op == Opcode::Add => {
                let mut joined = String::with_capacity(l.len() + r.len());
                joined.push_str(l.as_str());
                joined.push_str(r.as_str());
                Ok(self.intern(&joined))
            }
            (Value::Array(l), Value::Array(r)) if op == Opcode::Add => {
                let values = {
                    let (l, r) = (l.borrow(), r.borrow());
                    l.iter()
                        .chain(r.iter())
                        .map(Value::share)
                        .collect::<ExecResult<Vec<_>>>()?
                };
                self.new_array(values)
            }
            _ => Err(ExecError::UnexpectedDataType),
        }
    }

    fn complex_get(&self, container: &Value, key: &Value) -> ExecResult<Value> {
        match container {
            Value::Str(s) => {
                let index = key.as_int().ok_or(ExecError::UnexpectedDataType)?;
                let index = usize::try_from(index).map_err(|_| ExecError::IndexOutOfBounds)?;
                let ch = s
                    .as_str()
                    .chars()
                    .nth(index)
                    .ok_or(ExecError::IndexOutOfBounds)?;
                let mut buf = [0u8; 4];
                Ok(self.intern(ch.encode_utf8(&mut buf)))
            }
            Value::Array(array) => {
                let index = array_index(key)?;
                array
                    .borrow()
                    .get(index)
                    .ok_or(ExecError::IndexOutOfBounds)?
                    .share()
            }
            Value::Object(object) => {
                let Value::Str(key) = key else {
                    return Err(ExecError::InvalidKey);
                };
                match object.borrow().get(key) {
                    Some(value) => value.share(),
                    None => Ok(Value::Null),
                }
            }
            _ => Err(ExecError::UnexpectedDataType),
        }
    }

    // -------------------------------------------------------------------------
    // TYPE CONVERSION
    // -------------------------------------------------------------------------

    /// `value as to`. Pairs without a defined conversion are
    /// `UnexpectedDataType`.
    pub fn convert(&mut self, value: Value, to: PublicType) -> ExecResult<Value> {
        use PublicType as T;

        match (value, to) {
            (value, T::Type) => Ok(Value::Type(value.public_type())),

            (Value::Array(array), T::Array) => {
                let values = array
                    .borrow()
                    .iter()
                    .map(Value::share)
                    .collect::<ExecResult<Vec<_>>>()?;
                self.new_array(values)
            }
            (Value::Str(s), T::Array) => {
                let mut buf = [0u8; 4];
                let values: Vec<Value> = s
                    .as_str()
                    .chars()
                    .map(|ch| self.intern(ch.encode_utf8(&mut buf)))
                    .collect();
                self.new_array(values)
            }
            (value, T::Array) => self.new_array(vec![value]),

            (Value::Int(i), T::Int) => Ok(Value::Int(i)),
            (Value::Int(i), T::Float) => Ok(Value::Float(i as f64)),
            (Value::Int(i), T::String) => Ok(self.intern(&i.to_string())),

            (Value::Float(f), T::Float) => Ok(Value::Float(f)),
            (Value::Float(f), T::Int) => Ok(Value::Int(f as i64)),
            (Value::Float(f), T::String) => Ok(self.intern(&f.to_string())),

            (Value::Array(array), T::Int) => Ok(Value::Int(array.borrow().len() as i64)),
            (Value::Array(array), T::Float) => Ok(Value::Float(array.borrow().len() as f64)),
            (Value::Array(array), T::String) => {
                let mut out = String::new();
                let mut path = Vec::new();
                self.array_to_string(&array, &mut path, &mut out)?;
                Ok(self.intern(&out))
            }

            (Value::Type(ty), T::String) => Ok(self.intern(ty.name())),

            (Value::Str(s), T::Int) => Ok(Value::Int(parse_int(s.as_str()))),
            (Value::Str(s), T::Float) => Ok(Value::Float(s.as_str().trim().parse().unwrap_or(0.0))),
            (Value::Str(s), T::String) => Ok(Value::Str(s)),
            (Value::Str(s), T::Function) => self.function_by_name(s.as_str()),

            (Value::NativeFunction(address), T::String) => {
                let name = self
                    .runtime
                    .native_function_name(address)
                    .ok_or(ExecError::NativeFunctionNotFound)?;
                Ok(self.intern(&name))
            }
            (Value::ScriptFunction(address), T::String) => {
                Ok(Value::Str(self.script_function_name(address)?))
            }
            (value @ (Value::NativeFunction(_) | Value::ScriptFunction(_)), T::Function) => Ok(value),
            (Value::ScriptFunction(address), T::Coroutine) => {
                let co = self.heap.alloc_coroutine(Coroutine::new(address))?;
                Ok(Value::Coroutine(co))
            }

            (Value::Coroutine(co), T::String) => {
                let function = co.borrow().function();
                Ok(Value::Str(self.script_function_name(function)?))
            }
            (Value::Coroutine(co), T::Function) => Ok(Value::ScriptFunction(co.borrow().function())),
            (Value::Coroutine(co), T::Coroutine) => {
                let function = co.borrow().function();
                let fresh = self.heap.alloc_coroutine(Coroutine::new(function))?;
                Ok(Value::Coroutine(fresh))
            }

            (Value::Object(object), T::Int) => Ok(Value::Int(object.borrow().len() as i64)),
            (Value::Object(object), T::Float) => Ok(Value::Float(object.borrow().len() as f64)),

            _ => Err(ExecError::UnexpectedDataType),
        }
    }

    /// Appends the string form of every element; arrays already being
    /// printed are skipped.
    fn array_to_string(&mut self, array: &Gc<Array>, path: &mut Vec<usize>, out: &mut String) -> ExecResult<()> {
        if path.contains(&array.addr()) {
            return Ok(());
        }
        path.push(array.addr());
        let elements = array
            .borrow()
            .iter()
            .map(Value::share)
            .collect::<ExecResult<Vec<_>>>()?;
        for element in elements {
            match element {
                Value::Array(inner) => self.array_to_string(&inner, path, out)?,
                other => {
                    if let Value::Str(s) = self.convert(other, PublicType::String)? {
                        out.push_str(s.as_str());
                    }
                }
            }
        }
        path.pop();
        Ok(())
    }

    fn script_function_name(&self, address: u32) -> ExecResult<InternedString> {
        let call = self.calls.last().ok_or(ExecError::InternalBufferOverrun)?;
        call.actor
            .script()
            .function(address)
            .map(|f| f.name.clone())
            .ok_or(ExecError::ScriptFunctionNotFound)
    }

    /// Native functions shadow script functions of the same name.
    fn function_by_name(&self, name: &str) -> ExecResult<Value> {
        if let Some(address) = self.runtime.native_function_address(name) {
            return Ok(Value::NativeFunction(address));
        }
        let call = self.calls.last().ok_or(ExecError::InternalBufferOverrun)?;
        call.actor
            .script()
            .function_address(name)
            .map(Value::ScriptFunction)
            .ok_or(ExecError::ScriptFunctionNotFound)
    }
}

// -----------------------------------------------------------------------------
// OPERAND HELPERS
// -----------------------------------------------------------------------------

fn compare(op: Opcode, left: &Value, right: &Value) -> ExecResult<bool> {
    let ordering = match (left, right) {
        (Value::Int(l), Value::Int(r)) => l.partial_cmp(r),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            match (left.as_number(), right.as_number()) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => None,
            }
        }
        _ => return Err(ExecError::UnexpectedDataType),
    };
    // NaN compares false under every operator.
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        Opcode::LessThan => ordering.is_lt(),
        Opcode::LessThanEquals => ordering.is_le(),
        Opcode::MoreThan => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn array_index(key: &Value) -> ExecResult<usize> {
    let index = key.as_int().ok_or(ExecError::UnexpectedDataType)?;
    usize::try_from(index).map_err(|_| ExecError::IndexOutOfBounds)
}

fn complex_set(container: &Value, key: &Value, value: Value) -> ExecResult<()> {
    match container {
        Value::Array(array) => {
            let index = array_index(key)?;
            let old = array.borrow_mut().replace(index, value)?;
            drop(old);
            Ok(())
        }
        Value::Object(object) => {
            let Value::Str(key) = key else {
                return Err(ExecError::InvalidKey);
            };
            object.borrow_mut().set(key.clone(), value)
        }
        _ => Err(ExecError::UnexpectedDataType),
    }
}

fn complex_shift(container: &Value, key: &Value) -> ExecResult<Value> {
    match container {
        Value::Array(array) => {
            let index = array_index(key)?;
            let old = array.borrow_mut().replace(index, Value::Int(0))?;
            Ok(old)
        }
        Value::Object(object) => {
            let Value::Str(key) = key else {
                return Err(ExecError::InvalidKey);
            };
            let removed = object.borrow_mut().remove(key);
            Ok(removed.unwrap_or(Value::Null))
        }
        _ => Err(ExecError::UnexpectedDataType),
    }
}

/// Integer parse with a float fallback; anything else is 0.
fn parse_int(s: &str) -> i64 {
    let s = s.trim();
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        .unwrap_or(0)
}
