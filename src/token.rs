//! # Token Module
//!
//! Token kinds produced by the lexer and consumed by the parser. Each token
//! carries a [`Span`] for source location tracking.

use crate::error::Span;
use crate::value::PublicType;

// -----------------------------------------------------------------------------
// TOKEN KINDS
// -----------------------------------------------------------------------------

/// Every token type in the Totem language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // -- Literals --
    /// Numeric literal, kept as canonical decimal text. A `.` marks a float.
    Number(String),
    /// String literal with escapes resolved.
    Str(String),
    /// `true`
    True,
    /// `false`
    False,
    /// `null`
    Null,
    /// A type keyword such as `int` or `array`.
    Type(PublicType),

    // -- Identifiers & Keywords --
    Ident(String),
    /// `var`
    Var,
    /// `const`
    Const,
    /// `function`, either a declaration or the function type.
    Function,
    /// `if`
    If,
    /// `else`
    Else,
    /// `while`
    While,
    /// `do`
    Do,
    /// `for`
    For,
    /// `switch`
    Switch,
    /// `case`
    Case,
    /// `default`
    Default,
    /// `return`
    Return,
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `is`
    Is,
    /// `as`
    As,

    // -- Arithmetic Operators --
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `**`
    Power,

    // -- Compound Assignment --
    /// `+=`
    PlusEq,
    /// `-=`
    MinusEq,
    /// `*=`
    StarEq,
    /// `/=`
    SlashEq,

    // -- Comparison Operators --
    /// `==`
    EqEq,
    /// `!=`
    BangEq,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    LtEq,
    /// `>=`
    GtEq,

    // -- Logical Operators --
    /// `&&`
    AmpAmp,
    /// `||`
    PipePipe,
    /// `!`
    Bang,

    /// `<<`, shifts a value out of an array or object.
    Shl,

    // -- Increment/Decrement --
    /// `++`
    PlusPlus,
    /// `--`
    MinusMinus,

    /// `=`
    Eq,

    // -- Delimiters --
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `[`
    LBracket,
    /// `]`
    RBracket,

    // -- Punctuation --
    /// `,`
    Comma,
    /// `;`
    Semicolon,
    /// `:`
    Colon,
    /// `.`
    Dot,

    /// End of file marker.
    Eof,
}

// -----------------------------------------------------------------------------
// TOKENS
// -----------------------------------------------------------------------------

/// A single token produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    #[inline]
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}

// -----------------------------------------------------------------------------
// KEYWORD LOOKUP
// -----------------------------------------------------------------------------

/// Resolves an identifier to its keyword token kind, if it is reserved.
#[inline]
pub fn lookup_keyword(ident: &str) -> Option<TokenKind> {
    match ident {
        "var" => Some(TokenKind::Var),
        "const" => Some(TokenKind::Const),
        "function" => Some(TokenKind::Function),
        "if" => Some(TokenKind::If),
        "else" => Some(TokenKind::Else),
        "while" => Some(TokenKind::While),
        "do" => Some(TokenKind::Do),
        "for" => Some(TokenKind::For),
        "switch" => Some(TokenKind::Switch),
        "case" => Some(TokenKind::Case),
        "default" => Some(TokenKind::Default),
        "return" => Some(TokenKind::Return),
        "break" => Some(TokenKind::Break),
        "continue" => Some(TokenKind::Continue),
        "true" => Some(TokenKind::True),
        "false" => Some(TokenKind::False),
        "null" => Some(TokenKind::Null),
        "is" => Some(TokenKind::Is),
        "as" => Some(TokenKind::As),
        "int" => Some(TokenKind::Type(PublicType::Int)),
        "float" => Some(TokenKind::Type(PublicType::Float)),
        "string" => Some(TokenKind::Type(PublicType::String)),
        "array" => Some(TokenKind::Type(PublicType::Array)),
        "object" => Some(TokenKind::Type(PublicType::Object)),
        "coroutine" => Some(TokenKind::Type(PublicType::Coroutine)),
        "type" => Some(TokenKind::Type(PublicType::Type)),
        _ => None,
    }
}
