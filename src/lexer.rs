//! # Lexer Module
//!
//! Byte-oriented scanner turning Totem source text into a flat token stream.
//!
//! ## Key Features
//! - Number literals keep their canonical text so the compiler can dedup
//!   constants by literal; hex literals are normalized to decimal.
//! - `memchr` skips line comments and finds block-comment terminators.

use crate::error::{Span, TotemError, TotemResult};
use crate::token::{lookup_keyword, Token, TokenKind};

/// Scans one source string.
pub struct Lexer<'src> {
    source: &'src [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    /// Scans the whole source. The last token is always [`TokenKind::Eof`].
    pub fn tokenize(&mut self) -> TotemResult<Vec<Token>> {
        let mut tokens = Vec::with_capacity(self.source.len() / 4);

        loop {
            self.skip_whitespace_and_comments()?;

            if self.at_eof() {
                tokens.push(Token::new(TokenKind::Eof, Span::new(self.line, self.col, 0)));
                break;
            }

            let token = self.next_token()?;
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> TotemResult<Token> {
        let tok_line = self.line;
        let tok_col = self.col;
        let tok_pos = self.pos;

        let byte = self.advance();

        let kind = match byte {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semicolon,
            b':' => TokenKind::Colon,

            b'.' => {
                if !self.at_eof() && self.peek().is_ascii_digit() {
                    self.lex_number(byte, tok_line, tok_col)?
                } else {
                    TokenKind::Dot
                }
            }

            b'+' => {
                if self.eat_byte(b'=') {
                    TokenKind::PlusEq
                } else if self.eat_byte(b'+') {
                    TokenKind::PlusPlus
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.eat_byte(b'=') {
                    TokenKind::MinusEq
                } else if self.eat_byte(b'-') {
                    TokenKind::MinusMinus
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                if self.eat_byte(b'*') {
                    TokenKind::Power
                } else if self.eat_byte(b'=') {
                    TokenKind::StarEq
                } else {
                    TokenKind::Star
                }
            }
            b'/' => {
                if self.eat_byte(b'=') {
                    TokenKind::SlashEq
                } else {
                    TokenKind::Slash
                }
            }
            b'=' => {
                if self.eat_byte(b'=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            b'!' => {
                if self.eat_byte(b'=') {
                    TokenKind::BangEq
                } else {
                    TokenKind::Bang
                }
            }
            b'<' => {
                if self.eat_byte(b'<') {
                    TokenKind::Shl
                } else if self.eat_byte(b'=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat_byte(b'=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            b'&' if self.eat_byte(b'&') => TokenKind::AmpAmp,
            b'|' if self.eat_byte(b'|') => TokenKind::PipePipe,

            b'"' | b'\'' => return self.lex_string(byte, tok_line, tok_col, tok_pos),

            b'0'..=b'9' => self.lex_number(byte, tok_line, tok_col)?,

            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_word(tok_pos)?,

            _ => {
                return Err(TotemError::lexer(
                    format!("unexpected character: '{}'", byte as char),
                    Span::new(tok_line, tok_col, 1),
                ));
            }
        };

        let len = (self.pos - tok_pos) as u32;
        Ok(Token::new(kind, Span::new(tok_line, tok_col, len)))
    }

    fn lex_string(
        &mut self,
        quote: u8,
        tok_line: u32,
        tok_col: u32,
        tok_pos: usize,
    ) -> TotemResult<Token> {
        let mut buf: Vec<u8> = Vec::new();

        loop {
            if self.at_eof() {
                return Err(TotemError::lexer(
                    "unterminated string literal",
                    Span::new(tok_line, tok_col, 1),
                ));
            }

            let byte = self.peek();

            if byte == quote {
                self.advance();
                break;
            }

            if byte == b'\\' {
                self.advance();
                if self.at_eof() {
                    return Err(TotemError::lexer(
                        "unterminated escape sequence",
                        Span::new(self.line, self.col, 1),
                    ));
                }

                let esc = self.advance();
                match esc {
                    b'n' => buf.push(b'\n'),
                    b'r' => buf.push(b'\r'),
                    b't' => buf.push(b'\t'),
                    b'\\' => buf.push(b'\\'),
                    b'\'' => buf.push(b'\''),
                    b'"' => buf.push(b'"'),
                    b'0' => buf.push(0),
                    _ => {
                        buf.push(b'\\');
                        buf.push(esc);
                    }
                }
                continue;
            }

            self.advance();
            if byte == b'\n' {
                self.line += 1;
                self.col = 1;
            }
            buf.push(byte);
        }

        let text = String::from_utf8(buf).map_err(|_| {
            TotemError::lexer(
                "invalid UTF-8 in string literal",
                Span::new(tok_line, tok_col, 1),
            )
        })?;
        let total_len = (self.pos - tok_pos) as u32;
        Ok(Token::new(
            TokenKind::Str(text),
            Span::new(tok_line, tok_col, total_len),
        ))
    }

    fn lex_number(&mut self, first: u8, tok_line: u32, tok_col: u32) -> TotemResult<TokenKind> {
        if first == b'0' && !self.at_eof() && matches!(self.peek(), b'x' | b'X') {
            self.advance();
            return self.lex_hex_number(tok_line, tok_col);
        }

        let mut text = String::new();
        if first == b'.' {
            text.push('0');
        }
        text.push(first as char);

        while !self.at_eof() && (self.peek().is_ascii_digit() || self.peek() == b'_') {
            let b = self.advance();
            if b != b'_' {
                text.push(b as char);
            }
        }

        if first != b'.'
            && !self.at_eof()
            && self.peek() == b'.'
            && self.pos + 1 < self.source.len()
            && self.source[self.pos + 1].is_ascii_digit()
        {
            self.advance();
            text.push('.');
            while !self.at_eof() && (self.peek().is_ascii_digit() || self.peek() == b'_') {
                let b = self.advance();
                if b != b'_' {
                    text.push(b as char);
                }
            }
        }

        if !self.at_eof() && matches!(self.peek(), b'e' | b'E') {
            if !text.contains('.') {
                text.push_str(".0");
            }
            text.push(self.advance() as char);
            if !self.at_eof() && matches!(self.peek(), b'+' | b'-') {
                text.push(self.advance() as char);
            }
            while !self.at_eof() && self.peek().is_ascii_digit() {
                text.push(self.advance() as char);
            }
            if text.parse::<f64>().is_err() {
                return Err(TotemError::lexer(
                    format!("invalid number literal: {}", text),
                    Span::new(tok_line, tok_col, text.len() as u32),
                ));
            }
        }

        Ok(TokenKind::Number(text))
    }

    fn lex_hex_number(&mut self, tok_line: u32, tok_col: u32) -> TotemResult<TokenKind> {
        let mut digits = String::new();

        while !self.at_eof() && (self.peek().is_ascii_hexdigit() || self.peek() == b'_') {
            let b = self.advance();
            if b != b'_' {
                digits.push(b as char);
            }
        }

        if digits.is_empty() {
            return Err(TotemError::lexer(
                "expected hex digits after '0x'",
                Span::new(tok_line, tok_col, 2),
            ));
        }

        let value = i64::from_str_radix(&digits, 16).map_err(|_| {
            TotemError::lexer(
                format!("invalid hex literal: 0x{}", digits),
                Span::new(tok_line, tok_col, digits.len() as u32 + 2),
            )
        })?;

        Ok(TokenKind::Number(value.to_string()))
    }

    fn lex_word(&mut self, tok_pos: usize) -> TotemResult<TokenKind> {
        while !self.at_eof() && (self.peek().is_ascii_alphanumeric() || self.peek() == b'_') {
            self.advance();
        }

        let text = std::str::from_utf8(&self.source[tok_pos..self.pos]).map_err(|_| {
            TotemError::lexer(
                "invalid UTF-8 in identifier",
                Span::new(self.line, self.col, (self.pos - tok_pos) as u32),
            )
        })?;

        Ok(lookup_keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string())))
    }

    fn skip_whitespace_and_comments(&mut self) -> TotemResult<()> {
        loop {
            while !self.at_eof() {
                match self.peek() {
                    b' ' | b'\t' | b'\r' => {
                        self.advance();
                    }
                    b'\n' => {
                        self.advance();
                        self.line += 1;
                        self.col = 1;
                    }
                    _ => break,
                }
            }

            if self.starts_with(b"//") {
                let remaining = &self.source[self.pos..];
                match memchr::memchr(b'\n', remaining) {
                    Some(offset) => {
                        self.pos += offset;
                        self.col += offset as u32;
                    }
                    None => {
                        let skip = self.source.len() - self.pos;
                        self.col += skip as u32;
                        self.pos = self.source.len();
                    }
                }
                continue;
            }

            if self.starts_with(b"/*") {
                self.skip_block_comment()?;
                continue;
            }

            return Ok(());
        }
    }

    fn skip_block_comment(&mut self) -> TotemResult<()> {
        let span = Span::new(self.line, self.col, 2);
        self.pos += 2;
        self.col += 2;

        loop {
            let remaining = &self.source[self.pos..];
            let Some(offset) = memchr::memchr(b'*', remaining) else {
                return Err(TotemError::lexer("unterminated block comment", span));
            };

            for &b in &remaining[..offset] {
                if b == b'\n' {
                    self.line += 1;
                    self.col = 1;
                } else {
                    self.col += 1;
                }
            }
            self.pos += offset + 1;
            self.col += 1;

            if self.eat_byte(b'/') {
                return Ok(());
            }
        }
    }

    #[inline]
    fn starts_with(&self, prefix: &[u8]) -> bool {
        self.source[self.pos..].starts_with(prefix)
    }

    #[inline(always)]
    fn peek(&self) -> u8 {
        self.source[self.pos]
    }

    #[inline(always)]
    fn advance(&mut self) -> u8 {
        let byte = self.source[self.pos];
        self.pos += 1;
        self.col += 1;
        byte
    }

    #[inline]
    fn eat_byte(&mut self, expected: u8) -> bool {
        if !self.at_eof() && self.source[self.pos] == expected {
            self.pos += 1;
            self.col += 1;
            true
        } else {
            false
        }
    }

    #[inline(always)]
    fn at_eof(&self) -> bool {
        self.pos >= self.source.len()
    }
}
