//! # Builtin Module
//!
//! Trait-based system for registering native function modules into a
//! [`Runtime`]. Each module implements [`NativeModule`] and exposes named
//! callbacks; registration links them into the runtime's native table, after
//! which scripts compiled against that runtime can call them by name.
//!
//! ## Provided Modules
//! - `io`: `print`, `println`.
//! - `core`: `assert`, `collect`, `len`.
//! - `math`: `abs`, `floor`, `ceil`, `sqrt`, `min`, `max`.

use std::io::{self, Write};

use tracing::debug;

use crate::error::{ExecError, ExecResult, LinkResult};
use crate::runtime::{NativeFunction, Runtime};
use crate::value::Value;
use crate::vm::ExecState;

// -----------------------------------------------------------------------------
// NATIVE MODULE TRAIT
// -----------------------------------------------------------------------------

/// A named group of native functions.
pub trait NativeModule {
    /// Returns the module name (e.g., `"io"`).
    fn name(&self) -> &'static str;

    /// Returns `(function_name, callback)` pairs.
    fn functions(&self) -> Vec<(&'static str, NativeFunction)>;

    /// Links every function of this module into `runtime`.
    fn register(&self, runtime: &Runtime) -> LinkResult<()> {
        for (name, callback) in self.functions() {
            runtime.link_native_function(name, callback)?;
        }
        debug!(module = self.name(), "native module registered");
        Ok(())
    }
}

/// Registers `io`, `core` and `math`.
pub fn register_all(runtime: &Runtime) -> LinkResult<()> {
    IoModule.register(runtime)?;
    CoreModule.register(runtime)?;
    MathModule.register(runtime)
}

// -----------------------------------------------------------------------------
// IO MODULE
// -----------------------------------------------------------------------------

pub struct IoModule;

impl NativeModule for IoModule {
    fn name(&self) -> &'static str {
        "io"
    }

    fn functions(&self) -> Vec<(&'static str, NativeFunction)> {
        vec![
            ("print", io_print as NativeFunction),
            ("println", io_println as NativeFunction),
        ]
    }
}

/// Arguments joined by single spaces.
fn display_args(state: &ExecState) -> ExecResult<String> {
    let mut text = String::new();
    for i in 0..state.arg_count() {
        if i > 0 {
            text.push(' ');
        }
        text.push_str(&state.argument(i)?.to_string());
    }
    Ok(text)
}

/// Prints its arguments to stdout without a trailing newline.
fn io_print(state: &mut ExecState) -> ExecResult<()> {
    let text = display_args(state)?;
    print!("{}", text);
    // A closed stdout is not a script error.
    let _ = io::stdout().flush();
    Ok(())
}

fn io_println(state: &mut ExecState) -> ExecResult<()> {
    let text = display_args(state)?;
    println!("{}", text);
    Ok(())
}

// -----------------------------------------------------------------------------
// CORE MODULE
// -----------------------------------------------------------------------------

pub struct CoreModule;

impl NativeModule for CoreModule {
    fn name(&self) -> &'static str {
        "core"
    }

    fn functions(&self) -> Vec<(&'static str, NativeFunction)> {
        vec![
            ("assert", core_assert as NativeFunction),
            ("collect", core_collect as NativeFunction),
            ("len", core_len as NativeFunction),
        ]
    }
}

/// Fails with `FailedAssertion` unless every argument is truthy.
fn core_assert(state: &mut ExecState) -> ExecResult<()> {
    for i in 0..state.arg_count() {
        if !state.argument(i)?.is_truthy() {
            return Err(ExecError::FailedAssertion);
        }
    }
    Ok(())
}

/// Runs a heap collection pass; returns the number of entries pruned.
fn core_collect(state: &mut ExecState) -> ExecResult<()> {
    let freed = state.collect_garbage();
    state.set_return(Value::Int(freed as i64))
}

fn core_len(state: &mut ExecState) -> ExecResult<()> {
    let len = match state.argument(0)? {
        Value::Str(s) => s.as_str().chars().count(),
        Value::Array(array) => array.borrow().len(),
        Value::Object(object) => object.borrow().len(),
        _ => return Err(ExecError::UnexpectedDataType),
    };
    state.set_return(Value::Int(len as i64))
}

// -----------------------------------------------------------------------------
// MATH MODULE
// -----------------------------------------------------------------------------

pub struct MathModule;

impl NativeModule for MathModule {
    fn name(&self) -> &'static str {
        "math"
    }

    fn functions(&self) -> Vec<(&'static str, NativeFunction)> {
        vec![
            ("abs", math_abs as NativeFunction),
            ("floor", math_floor as NativeFunction),
            ("ceil", math_ceil as NativeFunction),
            ("sqrt", math_sqrt as NativeFunction),
            ("min", math_min as NativeFunction),
            ("max", math_max as NativeFunction),
        ]
    }
}

fn math_abs(state: &mut ExecState) -> ExecResult<()> {
    let value = match state.argument(0)? {
        Value::Int(i) => Value::Int(i.wrapping_abs()),
        Value::Float(f) => Value::Float(f.abs()),
        _ => return Err(ExecError::UnexpectedDataType),
    };
    state.set_return(value)
}

/// Applies `f` to a float argument; ints pass through unchanged.
fn round_with(state: &mut ExecState, f: fn(f64) -> f64) -> ExecResult<()> {
    let value = match state.argument(0)? {
        Value::Int(i) => Value::Int(i),
        Value::Float(x) => Value::Float(f(x)),
        _ => return Err(ExecError::UnexpectedDataType),
    };
    state.set_return(value)
}

fn math_floor(state: &mut ExecState) -> ExecResult<()> {
    round_with(state, f64::floor)
}

fn math_ceil(state: &mut ExecState) -> ExecResult<()> {
    round_with(state, f64::ceil)
}

fn math_sqrt(state: &mut ExecState) -> ExecResult<()> {
    let x = state
        .argument(0)?
        .as_number()
        .ok_or(ExecError::UnexpectedDataType)?;
    state.set_return(Value::Float(x.sqrt()))
}

/// Picks between two numbers; ints stay ints when both are ints.
fn pick(state: &mut ExecState, take_left: fn(f64, f64) -> bool) -> ExecResult<()> {
    let left = state.argument(0)?;
    let right = state.argument(1)?;
    let (l, r) = match (left.as_number(), right.as_number()) {
        (Some(l), Some(r)) => (l, r),
        _ => return Err(ExecError::UnexpectedDataType),
    };
    let both_int = left.as_int().and(right.as_int());
    let chosen = if take_left(l, r) { left } else { right };
    let value = match (&chosen, both_int) {
        (Value::Int(_), Some(_)) => chosen,
        _ => Value::Float(chosen.as_number().unwrap_or_default()),
    };
    state.set_return(value)
}

fn math_min(state: &mut ExecState) -> ExecResult<()> {
    pick(state, |l, r| l <= r)
}

fn math_max(state: &mut ExecState) -> ExecResult<()> {
    pick(state, |l, r| l >= r)
}
