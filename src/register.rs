//! # Register Module
//!
//! Compile-time register lists: one for globals, one per function body.
//!
//! Each list hands out stable register indices for named variables and
//! deduplicated constants. Constants (numbers, strings, null, types and
//! function pointers) are only ever added to the global list so they are
//! materialized once, at link time.

use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;

use crate::error::{EvalError, EvalResult};
use crate::instruction::{Operand, Scope, MAX_REGISTERS};
use crate::value::PublicType;

/// What a register holds before the script runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValue {
    /// Runtime storage: a variable or temporary.
    Variable,
    Null,
    /// A number literal, by its canonical text.
    Number(String),
    /// A slice of the build's string buffer.
    Str { offset: usize, len: usize },
    Type(PublicType),
    NativeFunction(String),
    ScriptFunction(u32),
}

/// One register as seen by the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterPrototype {
    pub value: RegisterValue,
    pub is_const: bool,
    /// Set once a `const` register received its value.
    pub assigned: bool,
}

/// Key for deduplicated function pointer constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FunctionRef {
    Native(String),
    Script(u32),
}

/// The registers of one scope.
#[derive(Debug)]
pub struct RegisterList {
    scope: Scope,
    registers: Vec<RegisterPrototype>,
    variables: FxHashMap<String, u32>,
    numbers: FxHashMap<String, u32>,
    strings: FxHashMap<String, u32>,
    string_data: String,
    null: Option<u32>,
    types: FxHashMap<PublicType, u32>,
    functions: FxHashMap<FunctionRef, u32>,
}

impl RegisterList {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            registers: Vec::new(),
            variables: FxHashMap::default(),
            numbers: FxHashMap::default(),
            strings: FxHashMap::default(),
            string_data: String::new(),
            null: None,
            types: FxHashMap::default(),
            functions: FxHashMap::default(),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    #[inline]
    pub fn operand(&self, index: u32) -> Operand {
        Operand {
            scope: self.scope,
            index,
        }
    }

    pub fn get(&self, index: u32) -> Option<&RegisterPrototype> {
        self.registers.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut RegisterPrototype> {
        self.registers.get_mut(index as usize)
    }

    /// Appends a fresh register.
    pub fn add_register(&mut self, value: RegisterValue) -> EvalResult<u32> {
        Self::push(&mut self.registers, value)
    }

    /// A new anonymous register for an intermediate result.
    #[inline]
    pub fn add_temporary(&mut self) -> EvalResult<u32> {
        self.add_register(RegisterValue::Variable)
    }

    /// Binds `name`, returning the existing register if already bound.
    pub fn add_variable(&mut self, name: &str) -> EvalResult<u32> {
        if let Some(&index) = self.variables.get(name) {
            return Ok(index);
        }
        let index = self.add_register(RegisterValue::Variable)?;
        self.variables.insert(name.to_string(), index);
        Ok(index)
    }

    pub fn get_variable(&self, name: &str) -> Option<u32> {
        self.variables.get(name).copied()
    }

    /// Named variables and their registers.
    pub fn variables(&self) -> impl Iterator<Item = (&str, u32)> {
        self.variables.iter().map(|(name, &index)| (name.as_str(), index))
    }

    pub fn add_number_constant(&mut self, text: &str) -> EvalResult<u32> {
        if let Some(&index) = self.numbers.get(text) {
            return Ok(index);
        }
        let index = self.add_register(RegisterValue::Number(text.to_string()))?;
        self.numbers.insert(text.to_string(), index);
        Ok(index)
    }

    pub fn add_string_constant(&mut self, text: &str) -> EvalResult<u32> {
        if let Some(&index) = self.strings.get(text) {
            return Ok(index);
        }
        let offset = self.string_data.len();
        self.string_data
            .try_reserve(text.len())
            .map_err(|_| EvalError::OutOfMemory)?;
        let index = self.add_register(RegisterValue::Str {
            offset,
            len: text.len(),
        })?;
        self.string_data.push_str(text);
        self.strings.insert(text.to_string(), index);
        Ok(index)
    }

    pub fn add_null(&mut self) -> EvalResult<u32> {
        if let Some(index) = self.null {
            return Ok(index);
        }
        let index = self.add_register(RegisterValue::Null)?;
        self.null = Some(index);
        Ok(index)
    }

    pub fn add_type(&mut self, ty: PublicType) -> EvalResult<u32> {
        if let Some(&index) = self.types.get(&ty) {
            return Ok(index);
        }
        let index = self.add_register(RegisterValue::Type(ty))?;
        self.types.insert(ty, index);
        Ok(index)
    }

    pub fn add_function_pointer(&mut self, function: FunctionRef) -> EvalResult<u32> {
        let value = match &function {
            FunctionRef::Native(name) => RegisterValue::NativeFunction(name.clone()),
            FunctionRef::Script(address) => RegisterValue::ScriptFunction(*address),
        };
        match self.functions.entry(function) {
            Entry::Occupied(e) => Ok(*e.get()),
            Entry::Vacant(e) => {
                let index = Self::push(&mut self.registers, value)?;
                e.insert(index);
                Ok(index)
            }
        }
    }

    fn push(registers: &mut Vec<RegisterPrototype>, value: RegisterValue) -> EvalResult<u32> {
        if registers.len() >= MAX_REGISTERS {
            return Err(EvalError::TooManyRegisters);
        }
        registers
            .try_reserve(1)
            .map_err(|_| EvalError::OutOfMemory)?;
        registers.push(RegisterPrototype {
            value,
            is_const: false,
            assigned: false,
        });
        Ok(registers.len() as u32 - 1)
    }

    /// The string a `Str` register refers to.
    pub fn string_at(&self, offset: usize, len: usize) -> Option<&str> {
        self.string_data.get(offset..offset + len)
    }

    /// Consumes the list, yielding its registers, variable names and
    /// string buffer.
    pub fn into_parts(self) -> (Vec<RegisterPrototype>, FxHashMap<String, u32>, String) {
        (self.registers, self.variables, self.string_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_dedup_by_text() {
        let mut list = RegisterList::new(Scope::Global);
        let a = list.add_number_constant("1").unwrap();
        let b = list.add_number_constant("1").unwrap();
        let c = list.add_number_constant("1.0").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let s = list.add_string_constant("hello").unwrap();
        assert_eq!(list.add_string_constant("hello").unwrap(), s);
        let Some(RegisterPrototype {
            value: RegisterValue::Str { offset, len },
            ..
        }) = list.get(s).cloned()
        else {
            panic!("expected string register");
        };
        assert_eq!(list.string_at(offset, len), Some("hello"));

        assert_eq!(list.add_null().unwrap(), list.add_null().unwrap());
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn register_limit() {
        let mut list = RegisterList::new(Scope::Local);
        for _ in 0..MAX_REGISTERS {
            list.add_temporary().unwrap();
        }
        assert_eq!(list.add_temporary(), Err(EvalError::TooManyRegisters));
        assert_eq!(
            list.add_function_pointer(FunctionRef::Script(1)),
            Err(EvalError::TooManyRegisters)
        );
    }

    #[test]
    fn variables_are_stable() {
        let mut list = RegisterList::new(Scope::Local);
        let x = list.add_variable("x").unwrap();
        list.add_temporary().unwrap();
        assert_eq!(list.add_variable("x").unwrap(), x);
        assert_eq!(list.get_variable("y"), None);
        assert_eq!(list.operand(x), Operand::local(x));
    }
}
