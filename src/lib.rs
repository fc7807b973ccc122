//! # Totem: Register-Based Bytecode Compiler and VM
//!
//! Totem compiles a small dynamically typed scripting language into packed
//! 32-bit register instructions and runs them on a call-stack interpreter
//! with reference-counted garbage collection.
//!
//! ## Architecture
//! Source → Lexer → Parser → AST → Compiler → BuildPrototype → Linker →
//! Script → Actor → ExecState
//!
//! ## Key Features
//! - ABC / ABx / Ax instruction layouts with range-checked operand packing.
//! - Constant and variable dedup in two register spaces (global, local).
//! - Backpatched control flow for `if`, loops and `switch`.
//! - A shared [`runtime::Runtime`] holding natives and interned strings.
//! - `Rc`-backed arrays, objects and coroutines with a `Weak` heap audit.

pub mod ast;
pub mod builtin;
pub mod compiler;
pub mod error;
pub mod gc;
pub mod instruction;
pub mod lexer;
pub mod parser;
pub mod register;
pub mod runtime;
pub mod script;
pub mod token;
pub mod value;
pub mod vm;

#[cfg(test)]
mod tests;

use compiler::{BuildPrototype, Compiler};
use error::TotemResult;
use lexer::Lexer;
use parser::Parser;
use runtime::Runtime;
use script::Script;

/// Lexes, parses and compiles `source`.
pub fn build(source: &str, runtime: &Runtime) -> TotemResult<BuildPrototype> {
    let tokens = Lexer::new(source).tokenize()?;
    let stmts = Parser::new(tokens).parse()?;
    Ok(Compiler::compile(&stmts, runtime)?)
}

/// Compiles `source` and links it against `runtime`.
pub fn load(source: &str, runtime: &Runtime) -> TotemResult<Script> {
    let build = build(source, runtime)?;
    Ok(Script::link(build, runtime)?)
}
