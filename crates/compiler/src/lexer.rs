//! Lexer
//!
//! Turns source bytes into a token stream with exact positions. Multi-char
//! punctuators follow maximal munch, so `>>` and `>>=` come out as single
//! tokens; the parser splits them when closing template argument lists.
//! Alternative operator spellings (`and`, `bitor`, `compl`, ...) are mapped
//! to their symbolic kinds here, never surfacing as identifiers.
//!
//! Numeric literals: decimal, hex (`0x`), octal (leading `0`), binary
//! (`0b`), each with optional `'` digit separators, integer suffixes
//! `[uU][lL]{0,2}` and float suffixes `[fFlL]`. Character and string
//! literals accept the `u8`, `u`, `U`, `L` encoding prefixes and raw
//! string syntax `R"delim(...)delim"`.

use crate::diag::{Diagnostic, SourceLoc, update_current_location};
use crate::strings::StrId;
use std::fmt;

/// Integer literal suffix, already case-folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSuffix {
    None,
    U,
    L,
    Ul,
    Ll,
    Ull,
}

impl IntSuffix {
    pub fn is_unsigned(self) -> bool {
        matches!(self, IntSuffix::U | IntSuffix::Ul | IntSuffix::Ull)
    }
}

/// Float literal suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatSuffix {
    None,
    F,
    L,
}

/// Encoding prefix on a character or string literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingPrefix {
    None,
    Utf8,
    Utf16,
    Utf32,
    Wide,
}

/// C++20 keywords recognized by this subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Alignas,
    Alignof,
    Auto,
    Bool,
    Break,
    Case,
    Catch,
    Char,
    Char8T,
    Char16T,
    Char32T,
    Class,
    Concept,
    Const,
    Consteval,
    Constexpr,
    Constinit,
    ConstCast,
    Continue,
    Decltype,
    Default,
    Delete,
    Do,
    Double,
    DynamicCast,
    Else,
    Enum,
    Explicit,
    Extern,
    False,
    Float,
    For,
    Friend,
    Goto,
    If,
    Inline,
    Int,
    Long,
    Mutable,
    Namespace,
    New,
    Noexcept,
    Nullptr,
    Operator,
    Private,
    Protected,
    Public,
    ReinterpretCast,
    Requires,
    Return,
    Short,
    Signed,
    Sizeof,
    Static,
    StaticAssert,
    StaticCast,
    Struct,
    Switch,
    Template,
    This,
    ThreadLocal,
    Throw,
    True,
    Try,
    Typedef,
    Typeid,
    Typename,
    Union,
    Unsigned,
    Using,
    Virtual,
    Void,
    Volatile,
    WcharT,
    While,
}

/// Symbolic punctuator kinds. Alternative spellings map here at lex time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punct {
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Semi,
    Colon,
    ColonColon,
    Question,
    Dot,
    DotStar,
    Arrow,
    ArrowStar,
    Ellipsis,
    Tilde,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Amp,
    Pipe,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    CaretAssign,
    AmpAssign,
    PipeAssign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Spaceship,
    AmpAmp,
    PipePipe,
    Shl,
    Shr,
    ShlAssign,
    ShrAssign,
    PlusPlus,
    MinusMinus,
    Comma,
    Hash,
    HashHash,
}

/// Token kind with parsed literal payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident,
    Keyword(Keyword),
    Int {
        value: u64,
        suffix: IntSuffix,
        base: u32,
    },
    Float {
        value: f64,
        suffix: FloatSuffix,
    },
    Char {
        value: u32,
        prefix: EncodingPrefix,
    },
    Str {
        /// Cooked value with escapes processed.
        value: String,
        prefix: EncodingPrefix,
    },
    Punct(Punct),
    Eof,
}

/// A token with its original spelling and position.
///
/// `start_of_line` and `space_before` feed the preprocessor: directive
/// recognition needs the former, stringizing normalization the latter.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub loc: SourceLoc,
    pub start_of_line: bool,
    pub space_before: bool,
}

impl Token {
    pub fn eof(loc: SourceLoc) -> Self {
        Token {
            kind: TokenKind::Eof,
            text: String::new(),
            loc,
            start_of_line: true,
            space_before: false,
        }
    }

    pub fn is_punct(&self, p: Punct) -> bool {
        self.kind == TokenKind::Punct(p)
    }

    pub fn is_keyword(&self, k: Keyword) -> bool {
        self.kind == TokenKind::Keyword(k)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == name
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

fn keyword_from_str(s: &str) -> Option<Keyword> {
    use Keyword::*;
    let k = match s {
        "alignas" => Alignas,
        "alignof" => Alignof,
        "auto" => Auto,
        "bool" => Bool,
        "break" => Break,
        "case" => Case,
        "catch" => Catch,
        "char" => Char,
        "char8_t" => Char8T,
        "char16_t" => Char16T,
        "char32_t" => Char32T,
        "class" => Class,
        "concept" => Concept,
        "const" => Const,
        "consteval" => Consteval,
        "constexpr" => Constexpr,
        "constinit" => Constinit,
        "const_cast" => ConstCast,
        "continue" => Continue,
        "decltype" => Decltype,
        "default" => Default,
        "delete" => Delete,
        "do" => Do,
        "double" => Double,
        "dynamic_cast" => DynamicCast,
        "else" => Else,
        "enum" => Enum,
        "explicit" => Explicit,
        "extern" => Extern,
        "false" => False,
        "float" => Float,
        "for" => For,
        "friend" => Friend,
        "goto" => Goto,
        "if" => If,
        "inline" => Inline,
        "int" => Int,
        "long" => Long,
        "mutable" => Mutable,
        "namespace" => Namespace,
        "new" => New,
        "noexcept" => Noexcept,
        "nullptr" => Nullptr,
        "operator" => Operator,
        "private" => Private,
        "protected" => Protected,
        "public" => Public,
        "reinterpret_cast" => ReinterpretCast,
        "requires" => Requires,
        "return" => Return,
        "short" => Short,
        "signed" => Signed,
        "sizeof" => Sizeof,
        "static" => Static,
        "static_assert" => StaticAssert,
        "static_cast" => StaticCast,
        "struct" => Struct,
        "switch" => Switch,
        "template" => Template,
        "this" => This,
        "thread_local" => ThreadLocal,
        "throw" => Throw,
        "true" => True,
        "try" => Try,
        "typedef" => Typedef,
        "typeid" => Typeid,
        "typename" => Typename,
        "union" => Union,
        "unsigned" => Unsigned,
        "using" => Using,
        "virtual" => Virtual,
        "void" => Void,
        "volatile" => Volatile,
        "wchar_t" => WcharT,
        "while" => While,
        _ => return None,
    };
    Some(k)
}

/// Alternative operator spellings, mapped to symbolic punctuators at lex
/// time so the parser never sees them as identifiers.
fn alternative_token(s: &str) -> Option<Punct> {
    let p = match s {
        "and" => Punct::AmpAmp,
        "or" => Punct::PipePipe,
        "not" => Punct::Bang,
        "not_eq" => Punct::NotEq,
        "bitand" => Punct::Amp,
        "bitor" => Punct::Pipe,
        "xor" => Punct::Caret,
        "compl" => Punct::Tilde,
        "and_eq" => Punct::AmpAssign,
        "or_eq" => Punct::PipeAssign,
        "xor_eq" => Punct::CaretAssign,
        _ => return None,
    };
    Some(p)
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    file: StrId,
    at_line_start: bool,
    space_pending: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: StrId) -> Self {
        Lexer {
            src: source.as_bytes(),
            pos: 0,
            line: 0,
            column: 0,
            file,
            at_line_start: true,
            space_pending: false,
        }
    }

    /// Lex the whole source into a token vector terminated by `Eof`.
    pub fn lex(mut self) -> Result<Vec<Token>, Diagnostic> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.file, self.line, self.column)
    }

    fn peek(&self) -> Option<u8> {
        self.peek_at(0)
    }

    /// Peek past line splices (`\` newline joins physical lines).
    fn peek_at(&self, n: usize) -> Option<u8> {
        let mut i = self.pos;
        let mut remaining = n;
        loop {
            while i + 1 < self.src.len() && self.src[i] == b'\\' && is_splice_newline(&self.src[i + 1..])
            {
                i += 1 + splice_len(&self.src[i + 1..]);
            }
            if i >= self.src.len() {
                return None;
            }
            if remaining == 0 {
                return Some(self.src[i]);
            }
            remaining -= 1;
            i += 1;
        }
    }

    fn bump(&mut self) -> Option<u8> {
        loop {
            if self.pos + 1 < self.src.len()
                && self.src[self.pos] == b'\\'
                && is_splice_newline(&self.src[self.pos + 1..])
            {
                self.pos += 1 + splice_len(&self.src[self.pos + 1..]);
                self.line += 1;
                self.column = 0;
                continue;
            }
            let c = *self.src.get(self.pos)?;
            self.pos += 1;
            if c == b'\n' {
                self.line += 1;
                self.column = 0;
            } else {
                self.column += 1;
            }
            return Some(c);
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Result<Token, Diagnostic> {
        self.skip_trivia()?;
        let loc = self.loc();
        update_current_location(loc);
        let start_of_line = self.at_line_start;
        let space_before = self.space_pending;
        self.at_line_start = false;
        self.space_pending = false;

        let Some(c) = self.peek() else {
            let mut tok = Token::eof(loc);
            tok.start_of_line = start_of_line;
            return Ok(tok);
        };

        let mut tok = if c.is_ascii_digit() || (c == b'.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
            self.lex_number(loc)?
        } else if c == b'"' || c == b'\'' {
            self.lex_quoted(loc, EncodingPrefix::None, false)?
        } else if c.is_ascii_alphabetic() || c == b'_' {
            self.lex_word(loc)?
        } else {
            self.lex_punct(loc)?
        };
        tok.start_of_line = start_of_line;
        tok.space_before = space_before;
        Ok(tok)
    }

    /// Skip whitespace and comments, tracking line starts and pending space.
    fn skip_trivia(&mut self) -> Result<(), Diagnostic> {
        loop {
            match self.peek() {
                Some(b'\n') => {
                    self.bump();
                    self.at_line_start = true;
                    self.space_pending = false;
                }
                Some(c) if c == b' ' || c == b'\t' || c == b'\r' || c == 0x0b || c == 0x0c => {
                    self.bump();
                    self.space_pending = true;
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                    self.space_pending = true;
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let open = self.loc();
                    self.bump();
                    self.bump();
                    let mut closed = false;
                    while let Some(c) = self.bump() {
                        if c == b'*' && self.peek() == Some(b'/') {
                            self.bump();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(Diagnostic::error(open, "unterminated block comment"));
                    }
                    self.space_pending = true;
                }
                _ => return Ok(()),
            }
        }
    }

    fn lex_word(&mut self, loc: SourceLoc) -> Result<Token, Diagnostic> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                text.push(c as char);
                self.bump();
            } else {
                break;
            }
        }

        // Encoding prefixes glue onto an immediately following quote.
        let prefix = match text.as_str() {
            "u8" => Some(EncodingPrefix::Utf8),
            "u" => Some(EncodingPrefix::Utf16),
            "U" => Some(EncodingPrefix::Utf32),
            "L" => Some(EncodingPrefix::Wide),
            _ => None,
        };
        if let Some(p) = prefix
            && matches!(self.peek(), Some(b'"') | Some(b'\''))
        {
            return self.lex_quoted(loc, p, false);
        }
        // Raw strings: R"..." and prefixed u8R"..." etc.
        if (text == "R" || text == "u8R" || text == "uR" || text == "UR" || text == "LR")
            && self.peek() == Some(b'"')
        {
            let p = match text.as_str() {
                "u8R" => EncodingPrefix::Utf8,
                "uR" => EncodingPrefix::Utf16,
                "UR" => EncodingPrefix::Utf32,
                "LR" => EncodingPrefix::Wide,
                _ => EncodingPrefix::None,
            };
            return self.lex_quoted(loc, p, true);
        }

        let kind = if let Some(p) = alternative_token(&text) {
            TokenKind::Punct(p)
        } else if let Some(k) = keyword_from_str(&text) {
            TokenKind::Keyword(k)
        } else {
            TokenKind::Ident
        };
        Ok(Token {
            kind,
            text,
            loc,
            start_of_line: false,
            space_before: false,
        })
    }

    fn lex_number(&mut self, loc: SourceLoc) -> Result<Token, Diagnostic> {
        let mut text = String::new();
        let mut digits = String::new();

        let base = if self.peek() == Some(b'0') {
            match self.peek_at(1) {
                Some(b'x') | Some(b'X') => {
                    text.push(self.bump().unwrap() as char);
                    text.push(self.bump().unwrap() as char);
                    16
                }
                Some(b'b') | Some(b'B') => {
                    text.push(self.bump().unwrap() as char);
                    text.push(self.bump().unwrap() as char);
                    2
                }
                _ => 8, // leading zero; may still turn out to be a float
            }
        } else {
            10
        };

        let mut is_float = false;
        loop {
            match self.peek() {
                Some(b'\'') => {
                    // Digit separator, stripped from the parsed value.
                    text.push('\'');
                    self.bump();
                }
                Some(c) if c.is_ascii_hexdigit() => {
                    // Only valid digits for the base; 'e'/'E' in decimal is
                    // an exponent, handled below.
                    if base != 16 && (c == b'e' || c == b'E') {
                        break;
                    }
                    if base != 16 && !c.is_ascii_digit() {
                        break;
                    }
                    text.push(c as char);
                    digits.push(c as char);
                    self.bump();
                }
                Some(b'.') if base != 16 && base != 2 => {
                    is_float = true;
                    text.push('.');
                    digits.push('.');
                    self.bump();
                }
                _ => break,
            }
        }
        // Exponent part makes it a float.
        if base != 16 && matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            text.push(self.bump().unwrap() as char);
            digits.push('e');
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                let s = self.bump().unwrap() as char;
                text.push(s);
                digits.push(s);
            }
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c as char);
                    digits.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
        }

        if is_float {
            let suffix = match self.peek() {
                Some(b'f') | Some(b'F') => {
                    text.push(self.bump().unwrap() as char);
                    FloatSuffix::F
                }
                Some(b'l') | Some(b'L') => {
                    text.push(self.bump().unwrap() as char);
                    FloatSuffix::L
                }
                _ => FloatSuffix::None,
            };
            let value: f64 = digits
                .parse()
                .map_err(|_| Diagnostic::error(loc, format!("malformed float literal '{}'", text)))?;
            return Ok(Token {
                kind: TokenKind::Float { value, suffix },
                text,
                loc,
                start_of_line: false,
                space_before: false,
            });
        }

        // Integer suffix [uU][lL]{0,2} in either order.
        let mut has_u = false;
        let mut l_count = 0u8;
        loop {
            match self.peek() {
                Some(b'u') | Some(b'U') if !has_u => {
                    has_u = true;
                    text.push(self.bump().unwrap() as char);
                }
                Some(b'l') | Some(b'L') if l_count < 2 => {
                    l_count += 1;
                    text.push(self.bump().unwrap() as char);
                }
                Some(b'f') | Some(b'F') if base == 10 => {
                    // 1f is a float spelled without a dot
                    text.push(self.bump().unwrap() as char);
                    let value: f64 = digits.parse().map_err(|_| {
                        Diagnostic::error(loc, format!("malformed float literal '{}'", text))
                    })?;
                    return Ok(Token {
                        kind: TokenKind::Float {
                            value,
                            suffix: FloatSuffix::F,
                        },
                        text,
                        loc,
                        start_of_line: false,
                        space_before: false,
                    });
                }
                _ => break,
            }
        }
        let suffix = match (has_u, l_count) {
            (false, 0) => IntSuffix::None,
            (true, 0) => IntSuffix::U,
            (false, 1) => IntSuffix::L,
            (true, 1) => IntSuffix::Ul,
            (false, _) => IntSuffix::Ll,
            (true, _) => IntSuffix::Ull,
        };

        let digits_for_value = if digits.is_empty() { "0" } else { digits.as_str() };
        let value = u64::from_str_radix(digits_for_value, base).map_err(|_| {
            Diagnostic::error(
                loc,
                format!("integer literal '{}' too large for any integer type", text),
            )
        })?;
        Ok(Token {
            kind: TokenKind::Int {
                value,
                suffix,
                base,
            },
            text,
            loc,
            start_of_line: false,
            space_before: false,
        })
    }

    fn lex_quoted(
        &mut self,
        loc: SourceLoc,
        prefix: EncodingPrefix,
        raw: bool,
    ) -> Result<Token, Diagnostic> {
        let quote = self.bump().expect("caller checked quote");
        if raw {
            return self.lex_raw_string(loc, prefix);
        }
        let mut value = String::new();
        let mut text = String::new();
        text.push(quote as char);
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    let what = if quote == b'"' { "string" } else { "character" };
                    return Err(Diagnostic::error(
                        loc,
                        format!("unterminated {} literal", what),
                    ));
                }
                Some(c) if c == quote => {
                    text.push(c as char);
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    text.push('\\');
                    self.bump();
                    let (esc, spelled) = self.lex_escape(loc)?;
                    text.push_str(&spelled);
                    if let Some(ch) = char::from_u32(esc) {
                        value.push(ch);
                    }
                }
                Some(c) => {
                    text.push(c as char);
                    value.push(c as char);
                    self.bump();
                }
            }
        }
        if quote == b'\'' {
            let cv = value.chars().next().map(|c| c as u32).unwrap_or(0);
            if value.chars().count() != 1 {
                return Err(Diagnostic::error(
                    loc,
                    "character literal must contain exactly one character",
                ));
            }
            Ok(Token {
                kind: TokenKind::Char { value: cv, prefix },
                text,
                loc,
                start_of_line: false,
                space_before: false,
            })
        } else {
            Ok(Token {
                kind: TokenKind::Str { value, prefix },
                text,
                loc,
                start_of_line: false,
                space_before: false,
            })
        }
    }

    /// After the backslash: decode one escape, returning (codepoint, spelling).
    fn lex_escape(&mut self, loc: SourceLoc) -> Result<(u32, String), Diagnostic> {
        let Some(c) = self.bump() else {
            return Err(Diagnostic::error(loc, "unterminated escape sequence"));
        };
        let mut spelled = String::new();
        spelled.push(c as char);
        let v = match c {
            b'n' => b'\n' as u32,
            b't' => b'\t' as u32,
            b'r' => b'\r' as u32,
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'0'..=b'7' => {
                // Up to 3 octal digits total.
                let mut v = (c - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'7') => {
                            spelled.push(d as char);
                            v = v * 8 + (d - b'0') as u32;
                            self.bump();
                        }
                        _ => break,
                    }
                }
                v
            }
            b'x' => {
                let mut v = 0u32;
                let mut any = false;
                while let Some(d) = self.peek() {
                    if d.is_ascii_hexdigit() {
                        spelled.push(d as char);
                        v = v * 16 + (d as char).to_digit(16).unwrap();
                        self.bump();
                        any = true;
                    } else {
                        break;
                    }
                }
                if !any {
                    return Err(Diagnostic::error(loc, "\\x used with no hex digits"));
                }
                v
            }
            b'u' | b'U' => {
                let width = if c == b'u' { 4 } else { 8 };
                let mut v = 0u32;
                for _ in 0..width {
                    match self.peek() {
                        Some(d) if d.is_ascii_hexdigit() => {
                            spelled.push(d as char);
                            v = v * 16 + (d as char).to_digit(16).unwrap();
                            self.bump();
                        }
                        _ => {
                            return Err(Diagnostic::error(
                                loc,
                                "incomplete universal character name",
                            ));
                        }
                    }
                }
                v
            }
            b'\\' => b'\\' as u32,
            b'\'' => b'\'' as u32,
            b'"' => b'"' as u32,
            b'?' => b'?' as u32,
            other => {
                return Err(Diagnostic::error(
                    loc,
                    format!("unknown escape sequence '\\{}'", other as char),
                ));
            }
        };
        Ok((v, spelled))
    }

    /// `R"delim( ... )delim"`, no escape processing inside.
    fn lex_raw_string(
        &mut self,
        loc: SourceLoc,
        prefix: EncodingPrefix,
    ) -> Result<Token, Diagnostic> {
        let mut delim = String::new();
        loop {
            match self.bump() {
                Some(b'(') => break,
                Some(c) if !c.is_ascii_whitespace() && c != b')' && c != b'\\' && delim.len() < 16 => {
                    delim.push(c as char);
                }
                _ => return Err(Diagnostic::error(loc, "malformed raw string delimiter")),
            }
        }
        let closer = format!("){}\"", delim);
        let mut value = String::new();
        loop {
            if value.ends_with(&closer) {
                value.truncate(value.len() - closer.len());
                break;
            }
            match self.bump() {
                Some(c) => value.push(c as char),
                None => return Err(Diagnostic::error(loc, "unterminated raw string literal")),
            }
        }
        let text = format!("R\"{}({}){}\"", delim, value, delim);
        Ok(Token {
            kind: TokenKind::Str { value, prefix },
            text,
            loc,
            start_of_line: false,
            space_before: false,
        })
    }

    fn lex_punct(&mut self, loc: SourceLoc) -> Result<Token, Diagnostic> {
        use Punct::*;
        let c = self.bump().expect("caller checked non-empty");
        let mut text = String::new();
        text.push(c as char);
        let two = |lexer: &mut Self, text: &mut String, next: u8, yes: Punct, no: Punct| {
            if lexer.eat(next) {
                text.push(next as char);
                yes
            } else {
                no
            }
        };
        let p = match c {
            b'{' => LBrace,
            b'}' => RBrace,
            b'[' => LBracket,
            b']' => RBracket,
            b'(' => LParen,
            b')' => RParen,
            b';' => Semi,
            b',' => Comma,
            b'~' => Tilde,
            b'?' => Question,
            b':' => two(self, &mut text, b':', ColonColon, Colon),
            b'.' => {
                if self.peek() == Some(b'.') && self.peek_at(1) == Some(b'.') {
                    self.bump();
                    self.bump();
                    text.push_str("..");
                    Ellipsis
                } else if self.eat(b'*') {
                    text.push('*');
                    DotStar
                } else {
                    Dot
                }
            }
            b'#' => two(self, &mut text, b'#', HashHash, Hash),
            b'+' => {
                if self.eat(b'+') {
                    text.push('+');
                    PlusPlus
                } else {
                    two(self, &mut text, b'=', PlusAssign, Plus)
                }
            }
            b'-' => {
                if self.eat(b'-') {
                    text.push('-');
                    MinusMinus
                } else if self.eat(b'>') {
                    text.push('>');
                    if self.eat(b'*') {
                        text.push('*');
                        ArrowStar
                    } else {
                        Arrow
                    }
                } else {
                    two(self, &mut text, b'=', MinusAssign, Minus)
                }
            }
            b'*' => two(self, &mut text, b'=', StarAssign, Star),
            b'/' => two(self, &mut text, b'=', SlashAssign, Slash),
            b'%' => two(self, &mut text, b'=', PercentAssign, Percent),
            b'^' => two(self, &mut text, b'=', CaretAssign, Caret),
            b'=' => two(self, &mut text, b'=', EqEq, Assign),
            b'!' => two(self, &mut text, b'=', NotEq, Bang),
            b'&' => {
                if self.eat(b'&') {
                    text.push('&');
                    AmpAmp
                } else {
                    two(self, &mut text, b'=', AmpAssign, Amp)
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    text.push('|');
                    PipePipe
                } else {
                    two(self, &mut text, b'=', PipeAssign, Pipe)
                }
            }
            b'<' => {
                // Maximal munch: <=> then <<= then << then <= then <.
                if self.peek() == Some(b'=') && self.peek_at(1) == Some(b'>') {
                    self.bump();
                    self.bump();
                    text.push_str("=>");
                    Spaceship
                } else if self.peek() == Some(b'<') {
                    self.bump();
                    text.push('<');
                    two(self, &mut text, b'=', ShlAssign, Shl)
                } else {
                    two(self, &mut text, b'=', LtEq, Lt)
                }
            }
            b'>' => {
                // Maximal munch: >>= then >> then >= then >. The parser
                // splits >> when closing template argument lists.
                if self.peek() == Some(b'>') {
                    self.bump();
                    text.push('>');
                    two(self, &mut text, b'=', ShrAssign, Shr)
                } else {
                    two(self, &mut text, b'=', GtEq, Gt)
                }
            }
            other => {
                return Err(Diagnostic::error(
                    loc,
                    format!("unexpected character '{}'", other as char),
                ));
            }
        };
        Ok(Token {
            kind: TokenKind::Punct(p),
            text,
            loc,
            start_of_line: false,
            space_before: false,
        })
    }
}

fn is_splice_newline(rest: &[u8]) -> bool {
    matches!(rest.first(), Some(b'\n')) || (rest.starts_with(b"\r\n"))
}

fn splice_len(rest: &[u8]) -> usize {
    if rest.starts_with(b"\r\n") { 2 } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::StringTable;

    fn lex_all(src: &str) -> Vec<Token> {
        let mut strings = StringTable::new();
        let file = strings.intern("test.cpp");
        Lexer::new(src, file).lex().expect("lex ok")
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex_all(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_maximal_munch_shift() {
        let toks = lex_all("a >> b >>= c");
        assert!(toks[1].is_punct(Punct::Shr));
        assert!(toks[3].is_punct(Punct::ShrAssign));
    }

    #[test]
    fn test_spaceship_before_lteq() {
        let toks = lex_all("a <=> b <= c");
        assert!(toks[1].is_punct(Punct::Spaceship));
        assert!(toks[3].is_punct(Punct::LtEq));
    }

    #[test]
    fn test_alternative_tokens_map_to_punct() {
        let toks = lex_all("a and b bitor c compl d not_eq e");
        assert!(toks[1].is_punct(Punct::AmpAmp));
        assert!(toks[3].is_punct(Punct::Pipe));
        assert!(toks[5].is_punct(Punct::Tilde));
        assert!(toks[7].is_punct(Punct::NotEq));
    }

    #[test]
    fn test_digit_separators_stripped() {
        let toks = lex_all("1'000'000");
        match &toks[0].kind {
            TokenKind::Int { value, .. } => assert_eq!(*value, 1_000_000),
            other => panic!("expected int, got {:?}", other),
        }
        assert_eq!(toks[0].text, "1'000'000");
    }

    #[test]
    fn test_numeric_bases_and_suffixes() {
        match &kinds("0x2A")[0] {
            TokenKind::Int { value, base, .. } => {
                assert_eq!(*value, 42);
                assert_eq!(*base, 16);
            }
            other => panic!("{:?}", other),
        }
        match &kinds("0b1010")[0] {
            TokenKind::Int { value, base, .. } => {
                assert_eq!(*value, 10);
                assert_eq!(*base, 2);
            }
            other => panic!("{:?}", other),
        }
        match &kinds("052")[0] {
            TokenKind::Int { value, base, .. } => {
                assert_eq!(*value, 42);
                assert_eq!(*base, 8);
            }
            other => panic!("{:?}", other),
        }
        match &kinds("42ull")[0] {
            TokenKind::Int { suffix, .. } => assert_eq!(*suffix, IntSuffix::Ull),
            other => panic!("{:?}", other),
        }
        match &kinds("3.5f")[0] {
            TokenKind::Float { value, suffix } => {
                assert_eq!(*value, 3.5);
                assert_eq!(*suffix, FloatSuffix::F);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_raw_string() {
        let toks = lex_all("R\"xy(a \"quoted\" \\n)xy\"");
        match &toks[0].kind {
            TokenKind::Str { value, .. } => assert_eq!(value, "a \"quoted\" \\n"),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_string_prefixes() {
        let toks = lex_all("u8\"x\" u\"y\" U\"z\" L\"w\"");
        let prefixes: Vec<_> = toks
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Str { prefix, .. } => Some(*prefix),
                _ => None,
            })
            .collect();
        assert_eq!(
            prefixes,
            vec![
                EncodingPrefix::Utf8,
                EncodingPrefix::Utf16,
                EncodingPrefix::Utf32,
                EncodingPrefix::Wide
            ]
        );
    }

    #[test]
    fn test_line_splice() {
        let toks = lex_all("ab\\\ncd");
        assert_eq!(toks[0].text, "abcd");
        assert_eq!(toks[0].kind, TokenKind::Ident);
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let mut strings = StringTable::new();
        let file = strings.intern("t.cpp");
        let err = Lexer::new("\"abc", file).lex().unwrap_err();
        assert!(err.message.contains("unterminated string"));
    }

    #[test]
    fn test_too_large_literal_is_error() {
        let mut strings = StringTable::new();
        let file = strings.intern("t.cpp");
        let err = Lexer::new("99999999999999999999999999", file).lex().unwrap_err();
        assert!(err.message.contains("too large"));
    }

    #[test]
    fn test_start_of_line_flag_for_directives() {
        let toks = lex_all("#define X 1\nint y;");
        assert!(toks[0].is_punct(Punct::Hash));
        assert!(toks[0].start_of_line);
        assert!(!toks[2].start_of_line);
        assert!(toks[4].is_keyword(Keyword::Int));
        assert!(toks[4].start_of_line);
    }

    #[test]
    fn test_retokenize_roundtrip() {
        // Re-serializing the stream and re-lexing gives the same kinds
        // modulo whitespace.
        let src = "int main() { return 1'0 + 0x2A >> 2; }";
        let toks = lex_all(src);
        let joined: String = toks
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .map(|t| t.text.clone())
            .collect::<Vec<_>>()
            .join(" ");
        let again = lex_all(&joined);
        let a: Vec<_> = toks.iter().map(|t| &t.kind).collect();
        let b: Vec<_> = again.iter().map(|t| &t.kind).collect();
        assert_eq!(a, b);
    }
}
