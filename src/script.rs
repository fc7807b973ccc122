//! # Script Module
//!
//! Linking a [`BuildPrototype`] against a [`Runtime`], and the actors that
//! run the result.
//!
//! A [`Script`] is immutable once linked and can be shared between threads.
//! Each [`Actor`] owns a private copy of the script's global registers,
//! initialized from the linked constants.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::compiler::{BuildPrototype, FunctionPrototype};
use crate::error::{LinkError, LinkResult};
use crate::instruction::Instruction;
use crate::register::RegisterValue;
use crate::runtime::Runtime;
use crate::value::{InternedString, PublicType, Value};

/// A global register's value at link time. Only immutable data: GC objects
/// are created by running code, never by the linker.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Null,
    Int(i64),
    Float(f64),
    Str(InternedString),
    NativeFunction(u32),
    ScriptFunction(u32),
    Type(PublicType),
}

impl ConstantValue {
    pub fn to_value(&self) -> Value {
        match self {
            ConstantValue::Null => Value::Null,
            ConstantValue::Int(i) => Value::Int(*i),
            ConstantValue::Float(f) => Value::Float(*f),
            ConstantValue::Str(s) => Value::Str(s.clone()),
            ConstantValue::NativeFunction(a) => Value::NativeFunction(*a),
            ConstantValue::ScriptFunction(a) => Value::ScriptFunction(*a),
            ConstantValue::Type(t) => Value::Type(*t),
        }
    }
}

/// A linked script function.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub name: InternedString,
    pub start: usize,
    pub registers_needed: usize,
}

/// A compiled and linked program.
#[derive(Debug)]
pub struct Script {
    instructions: Vec<Instruction>,
    functions: Vec<ScriptFunction>,
    function_lookup: FxHashMap<String, u32>,
    globals: Vec<ConstantValue>,
    global_names: FxHashMap<String, u32>,
}

impl Script {
    /// Binds `build` to `runtime`: parses number literals, interns strings
    /// and resolves native function names.
    pub fn link(build: BuildPrototype, runtime: &Runtime) -> LinkResult<Script> {
        let BuildPrototype {
            instructions,
            functions,
            function_lookup,
            globals,
            global_names,
            string_data,
        } = build;

        for function in &functions {
            if runtime.native_function_address(&function.name).is_some() {
                return Err(LinkError::FunctionAlreadyDeclared(function.name.clone()));
            }
        }

        let mut constants = Vec::new();
        constants
            .try_reserve_exact(globals.len())
            .map_err(|_| LinkError::OutOfMemory)?;
        for register in &globals {
            let constant = match &register.value {
                RegisterValue::Variable | RegisterValue::Null => ConstantValue::Null,
                RegisterValue::Number(text) => parse_number(text)?,
                RegisterValue::Str { offset, len } => {
                    let text = string_data.get(*offset..*offset + *len).ok_or_else(|| {
                        LinkError::UnexpectedValueType(format!("string at {}+{}", offset, len))
                    })?;
                    ConstantValue::Str(runtime.intern(text))
                }
                RegisterValue::Type(ty) => ConstantValue::Type(*ty),
                RegisterValue::NativeFunction(name) => ConstantValue::NativeFunction(
                    runtime
                        .native_function_address(name)
                        .ok_or_else(|| LinkError::FunctionNotDeclared(name.clone()))?,
                ),
                RegisterValue::ScriptFunction(address) => {
                    if *address as usize >= functions.len() {
                        return Err(LinkError::FunctionNotDeclared(format!("#{}", address)));
                    }
                    ConstantValue::ScriptFunction(*address)
                }
            };
            constants.push(constant);
        }

        let functions = functions
            .into_iter()
            .map(|FunctionPrototype { name, start, registers_needed }| ScriptFunction {
                name: runtime.intern(&name),
                start,
                registers_needed,
            })
            .collect::<Vec<_>>();

        debug!(
            functions = functions.len(),
            globals = constants.len(),
            instructions = instructions.len(),
            "script linked"
        );

        Ok(Script {
            instructions,
            functions,
            function_lookup,
            globals: constants,
            global_names,
        })
    }

    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[inline]
    pub fn function(&self, address: u32) -> Option<&ScriptFunction> {
        self.functions.get(address as usize)
    }

    pub fn function_address(&self, name: &str) -> Option<u32> {
        self.function_lookup.get(name).copied()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Register index of the top-level variable `name`.
    pub fn global_address(&self, name: &str) -> Option<u32> {
        self.global_names.get(name).copied()
    }

    pub fn globals(&self) -> &[ConstantValue] {
        &self.globals
    }
}

fn parse_number(text: &str) -> LinkResult<ConstantValue> {
    if text.contains('.') {
        text.parse::<f64>()
            .map(ConstantValue::Float)
            .map_err(|_| LinkError::UnexpectedValueType(text.to_string()))
    } else {
        text.parse::<i64>()
            .map(ConstantValue::Int)
            .map_err(|_| LinkError::UnexpectedValueType(text.to_string()))
    }
}

// -----------------------------------------------------------------------------
// ACTOR
// -----------------------------------------------------------------------------

pub(crate) struct ActorInner {
    script: Arc<Script>,
    globals: RefCell<Vec<Value>>,
}

/// One instance of a script with its own global registers.
///
/// Cloning an actor yields another handle to the same instance.
#[derive(Clone)]
pub struct Actor(Rc<ActorInner>);

impl Actor {
    pub fn new(script: Arc<Script>) -> Self {
        let globals = script.globals.iter().map(ConstantValue::to_value).collect();
        Actor(Rc::new(ActorInner {
            script,
            globals: RefCell::new(globals),
        }))
    }

    #[inline]
    pub fn script(&self) -> &Arc<Script> {
        &self.0.script
    }

    pub fn global(&self, index: u32) -> Option<Value> {
        self.0.globals.borrow().get(index as usize).cloned()
    }

    pub fn global_by_name(&self, name: &str) -> Option<Value> {
        self.global(self.0.script.global_address(name)?)
    }

    pub(crate) fn globals(&self) -> Ref<'_, Vec<Value>> {
        self.0.globals.borrow()
    }

    pub(crate) fn globals_mut(&self) -> RefMut<'_, Vec<Value>> {
        self.0.globals.borrow_mut()
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("globals", &self.0.globals.borrow().len())
            .finish()
    }
}
