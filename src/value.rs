//! # Value Module
//!
//! Runtime register values for the Totem VM.
//!
//! ## Key Design
//! - Scalars (`Int`, `Float`, type tags, function addresses) are stored inline.
//! - Strings are interned: up to [`MINI_STRING_MAX`] bytes live inline, longer
//!   ones share one `Arc<str>` per distinct content through the runtime table.
//! - Arrays, objects and coroutines are [`Gc`] handles. Cloning a value takes
//!   one strong reference and dropping it releases one, so a register's
//!   refcount bookkeeping is enforced by ownership alone.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{ExecError, ExecResult};
use crate::gc::{Array, Coroutine, Gc, Object};

// -----------------------------------------------------------------------------
// PUBLIC TYPE
// -----------------------------------------------------------------------------

/// The script-visible type of a value, itself a first-class value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PublicType {
    Null = 0,
    Int,
    Float,
    String,
    Array,
    Object,
    Function,
    Coroutine,
    Type,
}

impl PublicType {
    pub const ALL: [PublicType; 9] = [
        PublicType::Null,
        PublicType::Int,
        PublicType::Float,
        PublicType::String,
        PublicType::Array,
        PublicType::Object,
        PublicType::Function,
        PublicType::Coroutine,
        PublicType::Type,
    ];

    /// The keyword naming this type in source code.
    pub fn name(self) -> &'static str {
        match self {
            PublicType::Null => "null",
            PublicType::Int => "int",
            PublicType::Float => "float",
            PublicType::String => "string",
            PublicType::Array => "array",
            PublicType::Object => "object",
            PublicType::Function => "function",
            PublicType::Coroutine => "coroutine",
            PublicType::Type => "type",
        }
    }
}

impl fmt::Display for PublicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// -----------------------------------------------------------------------------
// INTERNED STRING
// -----------------------------------------------------------------------------

/// Longest string stored inline in a register.
pub const MINI_STRING_MAX: usize = 7;

/// An immutable script string.
///
/// Construct through [`Runtime::intern`](crate::runtime::Runtime::intern) so
/// shared strings stay deduplicated.
#[derive(Clone)]
pub enum InternedString {
    Mini {
        len: u8,
        bytes: [u8; MINI_STRING_MAX],
    },
    Shared(Arc<str>),
}

impl InternedString {
    /// Builds an inline string, or `None` if `s` is too long.
    pub fn mini(s: &str) -> Option<Self> {
        if s.len() > MINI_STRING_MAX {
            return None;
        }
        let mut bytes = [0u8; MINI_STRING_MAX];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Some(InternedString::Mini {
            len: s.len() as u8,
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            InternedString::Mini { len, bytes } => {
                std::str::from_utf8(&bytes[..*len as usize]).unwrap_or_default()
            }
            InternedString::Shared(s) => s,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            InternedString::Mini { len, .. } => *len as usize,
            InternedString::Shared(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mini(&self) -> bool {
        matches!(self, InternedString::Mini { .. })
    }

    /// Same storage (shared) or same inline bytes (mini).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (InternedString::Shared(a), InternedString::Shared(b)) => Arc::ptr_eq(a, b),
            (InternedString::Mini { .. }, InternedString::Mini { .. }) => self.as_str() == other.as_str(),
            _ => false,
        }
    }
}

impl PartialEq for InternedString {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.as_str() == other.as_str()
    }
}

impl Eq for InternedString {}

impl Hash for InternedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// VALUE
// -----------------------------------------------------------------------------

/// Refcounts above this are refused rather than risking a wrap.
pub const MAX_REFCOUNT: usize = u32::MAX as usize;

/// One VM register.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Str(InternedString),
    /// Address into the runtime's native function table.
    NativeFunction(u32),
    /// Address into the owning script's function table.
    ScriptFunction(u32),
    Array(Gc<Array>),
    Object(Gc<Object>),
    Coroutine(Gc<Coroutine>),
    Type(PublicType),
}

impl Value {
    pub fn public_type(&self) -> PublicType {
        match self {
            Value::Null => PublicType::Null,
            Value::Int(_) => PublicType::Int,
            Value::Float(_) => PublicType::Float,
            Value::Str(_) => PublicType::String,
            Value::NativeFunction(_) | Value::ScriptFunction(_) => PublicType::Function,
            Value::Array(_) => PublicType::Array,
            Value::Object(_) => PublicType::Object,
            Value::Coroutine(_) => PublicType::Coroutine,
            Value::Type(_) => PublicType::Type,
        }
    }

    /// Takes another reference to this value, refusing to overflow the
    /// refcount of a GC object.
    pub fn share(&self) -> ExecResult<Value> {
        let count = match self {
            Value::Array(gc) => gc.ref_count(),
            Value::Object(gc) => gc.ref_count(),
            Value::Coroutine(gc) => gc.ref_count(),
            _ => 0,
        };
        if count >= MAX_REFCOUNT {
            return Err(ExecError::RefCountOverflow);
        }
        Ok(self.clone())
    }

    /// Null, zero and the empty string are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Whether the raw 64-bit payload is all zeroes: null, `0` or `+0.0`.
    pub fn is_zero_payload(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Int(i) => *i == 0,
            Value::Float(f) => f.to_bits() == 0,
            _ => false,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric view with int-to-float promotion.
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Two values are equal when they carry the same tag and the same raw payload:
/// floats compare by bit pattern and GC objects by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::NativeFunction(a), Value::NativeFunction(b)) => a == b,
            (Value::ScriptFunction(a), Value::ScriptFunction(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Coroutine(a), Value::Coroutine(b)) => a.ptr_eq(b),
            (Value::Type(a), Value::Type(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s.as_str()),
            Value::NativeFunction(a) => write!(f, "NativeFunction({})", a),
            Value::ScriptFunction(a) => write!(f, "ScriptFunction({})", a),
            Value::Array(gc) => write!(f, "Array(len={}, rc={})", gc.borrow().len(), gc.ref_count()),
            Value::Object(gc) => write!(f, "Object(len={}, rc={})", gc.borrow().len(), gc.ref_count()),
            Value::Coroutine(gc) => write!(f, "Coroutine(fn={})", gc.borrow().function()),
            Value::Type(t) => write!(f, "Type({})", t),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, &mut Vec::new())
    }
}

/// Writes `value`, printing containers already on `open` as `[...]` or
/// `{...}` so cycles terminate.
fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, open: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::Null => write!(f, "null"),
        Value::Int(i) => write!(f, "{}", i),
        Value::Float(x) => write!(f, "{}", x),
        Value::Str(s) => write!(f, "{}", s),
        Value::NativeFunction(a) => write!(f, "<native {}>", a),
        Value::ScriptFunction(a) => write!(f, "<function {}>", a),
        Value::Array(gc) => {
            if open.contains(&gc.addr()) {
                return write!(f, "[...]");
            }
            open.push(gc.addr());
            write!(f, "[")?;
            for (i, v) in gc.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                match v {
                    Value::Str(s) => write!(f, "{:?}", s.as_str())?,
                    other => write_value(f, other, open)?,
                }
            }
            open.pop();
            write!(f, "]")
        }
        Value::Object(gc) => {
            if open.contains(&gc.addr()) {
                return write!(f, "{{...}}");
            }
            open.push(gc.addr());
            write!(f, "{{")?;
            for (i, (k, v)) in gc.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}: ", k.as_str())?;
                write_value(f, v, open)?;
            }
            open.pop();
            write!(f, "}}")
        }
        Value::Coroutine(gc) => write!(f, "<coroutine {}>", gc.borrow().function()),
        Value::Type(t) => write!(f, "{}", t),
    }
}
