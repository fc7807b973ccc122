//! # Error Module
//!
//! Error types for every stage of the Totem pipeline. Each phase owns its
//! own taxonomy so callers can match on precise failure causes:
//!
//! - [`EvalError`]: compilation (AST to bytecode) failures.
//! - [`LinkError`]: binding a build to a [`Runtime`](crate::runtime::Runtime).
//! - [`ExecError`]: failures raised while interpreting bytecode.
//!
//! [`TotemError`] folds all of them (plus lexer and parser failures) into a
//! single diagnostic carrying an optional source [`Span`].

use std::fmt;

use thiserror::Error;

// -----------------------------------------------------------------------------
// SPAN
// -----------------------------------------------------------------------------

/// Represents a position in source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// 1-based line number in the source file.
    pub line: u32,
    /// 1-based column number in the source file.
    pub col: u32,
    /// Length of the spanned region in bytes.
    pub len: u32,
}

impl Span {
    /// Creates a new span at the given location.
    #[inline]
    pub fn new(line: u32, col: u32, len: u32) -> Self {
        Self { line, col, len }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

// -----------------------------------------------------------------------------
// EVAL ERROR
// -----------------------------------------------------------------------------

/// Failures raised while compiling an AST into a build prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("function not defined")]
    FunctionNotDefined,
    /// A scope needs more registers than an operand can address.
    #[error("too many registers")]
    TooManyRegisters,
    /// An operand does not fit its bit field.
    #[error("instruction overflow")]
    InstructionOverflow,
    #[error("variable already defined")]
    VariableAlreadyDefined,
    #[error("variable not defined")]
    VariableNotDefined,
    #[error("script function already defined")]
    ScriptFunctionAlreadyDefined,
    #[error("native function already defined")]
    NativeFunctionAlreadyDefined,
    /// `break` used outside of a loop or switch.
    #[error("break outside of loop or switch")]
    UnexpectedBreak,
    /// `continue` used outside of a loop.
    #[error("continue outside of loop")]
    UnexpectedContinue,
}

impl EvalError {
    /// Returns the variant name, for diagnostics and logs.
    pub fn describe(&self) -> &'static str {
        match self {
            EvalError::OutOfMemory => "OutOfMemory",
            EvalError::InvalidArgument => "InvalidArgument",
            EvalError::FunctionNotDefined => "FunctionNotDefined",
            EvalError::TooManyRegisters => "TooManyRegisters",
            EvalError::InstructionOverflow => "InstructionOverflow",
            EvalError::VariableAlreadyDefined => "VariableAlreadyDefined",
            EvalError::VariableNotDefined => "VariableNotDefined",
            EvalError::ScriptFunctionAlreadyDefined => "ScriptFunctionAlreadyDefined",
            EvalError::NativeFunctionAlreadyDefined => "NativeFunctionAlreadyDefined",
            EvalError::UnexpectedBreak => "UnexpectedBreak",
            EvalError::UnexpectedContinue => "UnexpectedContinue",
        }
    }
}

/// Result alias for compiler-internal operations.
pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// An [`EvalError`] paired with the span of the AST node that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{error} [line {span}]")]
pub struct CompileError {
    pub error: EvalError,
    pub span: Span,
}

impl CompileError {
    pub fn new(error: EvalError, span: Span) -> Self {
        Self { error, span }
    }
}

// -----------------------------------------------------------------------------
// LINK ERROR
// -----------------------------------------------------------------------------

/// Failures raised while linking a build or registering native functions.
///
/// A script whose link failed is unusable and must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("out of memory")]
    OutOfMemory,
    /// A script function shares its name with a registered native function.
    #[error("function '{0}' already declared")]
    FunctionAlreadyDeclared(String),
    #[error("function '{0}' not declared")]
    FunctionNotDeclared(String),
    #[error("invalid native function address {0}")]
    InvalidNativeFunctionAddress(u32),
    #[error("invalid native function name '{0}'")]
    InvalidNativeFunctionName(String),
    #[error("too many native functions")]
    TooManyNativeFunctions,
    /// A global constant could not be turned into a runtime value.
    #[error("unexpected value type: {0}")]
    UnexpectedValueType(String),
}

impl LinkError {
    /// Returns the variant name, for diagnostics and logs.
    pub fn describe(&self) -> &'static str {
        match self {
            LinkError::OutOfMemory => "OutOfMemory",
            LinkError::FunctionAlreadyDeclared(_) => "FunctionAlreadyDeclared",
            LinkError::FunctionNotDeclared(_) => "FunctionNotDeclared",
            LinkError::InvalidNativeFunctionAddress(_) => "InvalidNativeFunctionAddress",
            LinkError::InvalidNativeFunctionName(_) => "InvalidNativeFunctionName",
            LinkError::TooManyNativeFunctions => "TooManyNativeFunctions",
            LinkError::UnexpectedValueType(_) => "UnexpectedValueType",
        }
    }
}

/// Result alias for linking and registration.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

// -----------------------------------------------------------------------------
// EXEC ERROR
// -----------------------------------------------------------------------------

/// Terminal statuses raised while interpreting bytecode.
///
/// An error unwinds every frame pushed by the current `exec` call and becomes
/// its result; scripts cannot trap their own runtime errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("script not found")]
    ScriptNotFound,
    #[error("script function not found")]
    ScriptFunctionNotFound,
    #[error("native function not found")]
    NativeFunctionNotFound,
    #[error("unexpected data type")]
    UnexpectedDataType,
    #[error("unrecognised operation")]
    UnrecognisedOperation,
    #[error("register overflow")]
    RegisterOverflow,
    #[error("instruction overflow")]
    InstructionOverflow,
    #[error("out of memory")]
    OutOfMemory,
    #[error("index out of bounds")]
    IndexOutOfBounds,
    #[error("reference count overflow")]
    RefCountOverflow,
    #[error("failed assertion")]
    FailedAssertion,
    #[error("divide by zero")]
    DivideByZero,
    #[error("internal buffer overrun")]
    InternalBufferOverrun,
    #[error("invalid key")]
    InvalidKey,
}

impl ExecError {
    /// Returns the variant name, for diagnostics and logs.
    pub fn describe(&self) -> &'static str {
        match self {
            ExecError::ScriptNotFound => "ScriptNotFound",
            ExecError::ScriptFunctionNotFound => "ScriptFunctionNotFound",
            ExecError::NativeFunctionNotFound => "NativeFunctionNotFound",
            ExecError::UnexpectedDataType => "UnexpectedDataType",
            ExecError::UnrecognisedOperation => "UnrecognisedOperation",
            ExecError::RegisterOverflow => "RegisterOverflow",
            ExecError::InstructionOverflow => "InstructionOverflow",
            ExecError::OutOfMemory => "OutOfMemory",
            ExecError::IndexOutOfBounds => "IndexOutOfBounds",
            ExecError::RefCountOverflow => "RefCountOverflow",
            ExecError::FailedAssertion => "FailedAssertion",
            ExecError::DivideByZero => "DivideByZero",
            ExecError::InternalBufferOverrun => "InternalBufferOverrun",
            ExecError::InvalidKey => "InvalidKey",
        }
    }
}

/// Result alias for the interpreter.
pub type ExecResult<T> = std::result::Result<T, ExecError>;

// -----------------------------------------------------------------------------
// ERROR KIND
// -----------------------------------------------------------------------------

/// Classifies which stage of the pipeline produced a [`TotemError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexer,
    Parser,
    Compiler,
    Linker,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Lexer => write!(f, "LexerError"),
            ErrorKind::Parser => write!(f, "ParseError"),
            ErrorKind::Compiler => write!(f, "CompileError"),
            ErrorKind::Linker => write!(f, "LinkError"),
            ErrorKind::Runtime => write!(f, "RuntimeError"),
        }
    }
}

// -----------------------------------------------------------------------------
// TOTEM ERROR
// -----------------------------------------------------------------------------

/// The unified error type for the whole source-to-result pipeline.
#[derive(Debug, Clone)]
pub struct TotemError {
    /// Which pipeline stage produced this error.
    pub kind: ErrorKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the error occurred, if available.
    pub span: Option<Span>,
}

impl TotemError {
    /// Creates a new error with a source location.
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span: Some(span),
        }
    }

    /// Creates a new error without source location information.
    pub fn no_span(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
        }
    }

    /// Creates a lexer error at the given span.
    #[inline]
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Lexer, message, span)
    }

    /// Creates a parser error at the given span.
    #[inline]
    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Parser, message, span)
    }
}

impl From<CompileError> for TotemError {
    fn from(e: CompileError) -> Self {
        Self::new(ErrorKind::Compiler, e.error.describe(), e.span)
    }
}

impl From<LinkError> for TotemError {
    fn from(e: LinkError) -> Self {
        Self::no_span(ErrorKind::Linker, format!("{} ({})", e.describe(), e))
    }
}

impl From<ExecError> for TotemError {
    fn from(e: ExecError) -> Self {
        Self::no_span(ErrorKind::Runtime, e.describe())
    }
}

impl fmt::Display for TotemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(
                f,
                "{} [line {}:{}]: {}",
                self.kind, span.line, span.col, self.message
            ),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TotemError {}

/// Convenience alias for whole-pipeline results.
pub type TotemResult<T> = std::result::Result<T, TotemError>;

/// Formats an error with the offending source line and a caret marker.
pub fn format_error(err: &TotemError, source: &str, path: &str) -> String {
    let Some(span) = err.span else {
        return format!("{}: {}", path, err);
    };
    let line_text = source
        .lines()
        .nth(span.line.saturating_sub(1) as usize)
        .unwrap_or("");
    let pad = " ".repeat(span.col.saturating_sub(1) as usize);
    let marks = "^".repeat(span.len.max(1) as usize);
    format!(
        "{}:{}:{}: {}\n  {}\n  {}{}",
        path, span.line, span.col, err, line_text, pad, marks
    )
}
