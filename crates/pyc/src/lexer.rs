//! Tokenizer for the indentation-sensitive source language.
//!
//! `logos` produces the raw tokens; [`TokenStream`] layers the logical-line
//! structure on top: NEWLINE only at the end of a non-blank logical line,
//! no line breaks inside brackets, and INDENT/DEDENT computed from the
//! leading whitespace of each logical line.

use std::collections::VecDeque;
use std::fmt;

use logos::Logos;
use num_bigint::BigInt;

use crate::ast::Pos;
use crate::error::CompileError;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum LexFault {
    #[default]
    UnexpectedChar,
    UnterminatedString,
    InvalidPrefix(String),
    InvalidEscape(String),
    InvalidNumber(String),
}

impl fmt::Display for LexFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexFault::UnexpectedChar => f.write_str("unexpected character"),
            LexFault::UnterminatedString => f.write_str("unterminated string literal"),
            LexFault::InvalidPrefix(p) => write!(f, "invalid string prefix '{p}'"),
            LexFault::InvalidEscape(e) => write!(f, "invalid escape sequence {e}"),
            LexFault::InvalidNumber(msg) => write!(f, "invalid number literal: {msg}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrKind {
    Text,
    Bytes,
    Format,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrLit {
    pub kind: StrKind,
    pub value: String,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexFault)]
#[logos(skip r"[ \t\x0c]+")]
#[logos(skip r"#[^\r\n]*")]
#[logos(skip r"\\\r?\n")]
pub enum TokenKind {
    // Keywords
    #[token("False")]
    FalseLit,
    #[token("None")]
    NoneLit,
    #[token("True")]
    TrueLit,
    #[token("and")]
    And,
    #[token("as")]
    As,
    #[token("assert")]
    Assert,
    #[token("async")]
    Async,
    #[token("await")]
    Await,
    #[token("break")]
    Break,
    #[token("class")]
    Class,
    #[token("continue")]
    Continue,
    #[token("def")]
    Def,
    #[token("del")]
    Del,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("except")]
    Except,
    #[token("finally")]
    Finally,
    #[token("for")]
    For,
    #[token("from")]
    From,
    #[token("global")]
    Global,
    #[token("if")]
    If,
    #[token("import")]
    Import,
    #[token("in")]
    In,
    #[token("is")]
    Is,
    #[token("lambda")]
    Lambda,
    #[token("nonlocal")]
    Nonlocal,
    #[token("not")]
    Not,
    #[token("or")]
    Or,
    #[token("pass")]
    Pass,
    #[token("raise")]
    Raise,
    #[token("return")]
    Return,
    #[token("try")]
    Try,
    #[token("while")]
    While,
    #[token("with")]
    With,
    #[token("yield")]
    Yield,

    // Literals
    #[regex(r"[0-9][0-9_]*", decimal)]
    #[regex(r"0[xX][0-9a-fA-F_]+", |lex| radix(lex, 16))]
    #[regex(r"0[oO][0-7_]+", |lex| radix(lex, 8))]
    #[regex(r"0[bB][01_]+", |lex| radix(lex, 2))]
    Int(BigInt),
    #[regex(r"[0-9][0-9_]*\.[0-9_]*([eE][+-]?[0-9_]+)?", float)]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9_]+)?", float)]
    #[regex(r"[0-9][0-9_]*[eE][+-]?[0-9_]+", float)]
    Float(f64),
    #[regex(r"([0-9][0-9_]*(\.[0-9_]*)?|\.[0-9][0-9_]*)([eE][+-]?[0-9_]+)?[jJ]", |lex| lex.slice().to_string())]
    Imaginary(String),
    #[regex(r#"[rRbBuUfF]{0,2}["']"#, string)]
    Str(StrLit),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Name(String),

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    DoubleStar,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("@")]
    At,
    #[token("<<")]
    LShift,
    #[token(">>")]
    RShift,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("=")]
    Assign,
    #[token(":=")]
    Walrus,
    #[token("->")]
    Arrow,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("//=")]
    DoubleSlashEq,
    #[token("%=")]
    PercentEq,
    #[token("**=")]
    DoubleStarEq,
    #[token("@=")]
    AtEq,
    #[token("<<=")]
    LShiftEq,
    #[token(">>=")]
    RShiftEq,
    #[token("&=")]
    AmpEq,
    #[token("|=")]
    PipeEq,
    #[token("^=")]
    CaretEq,

    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token("...")]
    Ellipsis,
    #[token(";")]
    Semi,

    #[regex(r"\r?\n")]
    Newline,

    // Produced by the token stream, never by the raw lexer.
    Indent,
    Dedent,
    EndOfFile,
}

impl TokenKind {
    /// Human-readable rendering for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Imaginary(_) => "number".into(),
            TokenKind::Str(_) => "string".into(),
            TokenKind::Name(n) => format!("name '{n}'"),
            TokenKind::Newline => "newline".into(),
            TokenKind::Indent => "indent".into(),
            TokenKind::Dedent => "dedent".into(),
            TokenKind::EndOfFile => "end of file".into(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        use TokenKind::*;
        match self {
            FalseLit => "False",
            NoneLit => "None",
            TrueLit => "True",
            And => "and",
            As => "as",
            Assert => "assert",
            Async => "async",
            Await => "await",
            Break => "break",
            Class => "class",
            Continue => "continue",
            Def => "def",
            Del => "del",
            Elif => "elif",
            Else => "else",
            Except => "except",
            Finally => "finally",
            For => "for",
            From => "from",
            Global => "global",
            If => "if",
            Import => "import",
            In => "in",
            Is => "is",
            Lambda => "lambda",
            Nonlocal => "nonlocal",
            Not => "not",
            Or => "or",
            Pass => "pass",
            Raise => "raise",
            Return => "return",
            Try => "try",
            While => "while",
            With => "with",
            Yield => "yield",
            Plus => "+",
            Minus => "-",
            Star => "*",
            DoubleStar => "**",
            Slash => "/",
            DoubleSlash => "//",
            Percent => "%",
            At => "@",
            LShift => "<<",
            RShift => ">>",
            Amp => "&",
            Pipe => "|",
            Caret => "^",
            Tilde => "~",
            Lt => "<",
            Gt => ">",
            LtEq => "<=",
            GtEq => ">=",
            EqEq => "==",
            NotEq => "!=",
            Assign => "=",
            Walrus => ":=",
            Arrow => "->",
            PlusEq => "+=",
            MinusEq => "-=",
            StarEq => "*=",
            SlashEq => "/=",
            DoubleSlashEq => "//=",
            PercentEq => "%=",
            DoubleStarEq => "**=",
            AtEq => "@=",
            LShiftEq => "<<=",
            RShiftEq => ">>=",
            AmpEq => "&=",
            PipeEq => "|=",
            CaretEq => "^=",
            LParen => "(",
            RParen => ")",
            LBracket => "[",
            RBracket => "]",
            LBrace => "{",
            RBrace => "}",
            Comma => ",",
            Colon => ":",
            Dot => ".",
            Ellipsis => "...",
            Semi => ";",
            Int(_) | Float(_) | Imaginary(_) | Str(_) | Name(_) | Newline | Indent | Dedent | EndOfFile => "",
        }
    }
}

/// Remove digit separators, rejecting doubled or trailing underscores.
fn strip_separators(digits: &str) -> Result<String, LexFault> {
    if digits.contains("__") || digits.ends_with('_') || digits.contains("_.") || digits.contains("._") {
        return Err(LexFault::InvalidNumber(format!("misplaced '_' in '{digits}'")));
    }
    Ok(digits.replace('_', ""))
}

fn decimal(lex: &mut logos::Lexer<TokenKind>) -> Result<BigInt, LexFault> {
    let digits = strip_separators(lex.slice())?;
    if digits.len() > 1 && digits.starts_with('0') && digits.bytes().any(|b| b != b'0') {
        return Err(LexFault::InvalidNumber(
            "leading zeros in decimal integer literals are not permitted".into(),
        ));
    }
    digits
        .parse()
        .map_err(|_| LexFault::InvalidNumber(lex.slice().to_string()))
}

fn radix(lex: &mut logos::Lexer<TokenKind>, base: u32) -> Result<BigInt, LexFault> {
    let body = &lex.slice()[2..];
    let digits = strip_separators(body.strip_prefix('_').unwrap_or(body))?;
    BigInt::parse_bytes(digits.as_bytes(), base).ok_or_else(|| LexFault::InvalidNumber(lex.slice().to_string()))
}

fn float(lex: &mut logos::Lexer<TokenKind>) -> Result<f64, LexFault> {
    let digits = strip_separators(lex.slice())?;
    digits
        .parse()
        .map_err(|_| LexFault::InvalidNumber(lex.slice().to_string()))
}

const PREFIXES: &[&str] = &["", "r", "u", "b", "br", "rb", "f", "fr", "rf"];

fn string(lex: &mut logos::Lexer<TokenKind>) -> Result<StrLit, LexFault> {
    let head = lex.slice();
    let quote = head.chars().last().unwrap_or('"');
    let prefix = head[..head.len() - 1].to_ascii_lowercase();
    if !PREFIXES.contains(&prefix.as_str()) {
        return Err(LexFault::InvalidPrefix(prefix));
    }
    let raw = prefix.contains('r');
    let kind = if prefix.contains('b') {
        StrKind::Bytes
    } else if prefix.contains('f') {
        StrKind::Format
    } else {
        StrKind::Text
    };

    let rest = lex.remainder();
    let triple = rest.starts_with(quote) && rest[quote.len_utf8()..].starts_with(quote);
    let open = if triple { 2 * quote.len_utf8() } else { 0 };
    let body = &rest[open..];

    let mut chars = body.char_indices().peekable();
    let mut end = None;
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '\n' if !triple => break,
            c if c == quote => {
                if !triple {
                    end = Some((i, i + 1));
                    break;
                }
                if body[i..].starts_with(&quote.to_string().repeat(3)) {
                    end = Some((i, i + 3));
                    break;
                }
            }
            _ => {}
        }
    }
    let Some((close, after)) = end else {
        let skip = if triple { rest.len() } else { rest.find('\n').unwrap_or(rest.len()) };
        lex.bump(skip);
        return Err(LexFault::UnterminatedString);
    };
    lex.bump(open + after);
    let text = &body[..close];
    let value = if raw { text.to_string() } else { unescape(text)? };
    Ok(StrLit { kind, value })
}

fn unescape(text: &str) -> Result<String, LexFault> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(e) = chars.next() else {
            out.push('\\');
            break;
        };
        match e {
            '\n' => {}
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            '\\' | '\'' | '"' => out.push(e),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '0'..='7' => {
                let mut code = e.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            code = code * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code).ok_or_else(|| LexFault::InvalidEscape(format!("\\{code:o}")))?);
            }
            'x' | 'u' | 'U' => {
                let width = match e {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = (0..width).filter_map(|_| chars.next()).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == width)
                    .and_then(char::from_u32)
                    .ok_or_else(|| LexFault::InvalidEscape(format!("\\{e}{hex}")))?;
                out.push(code);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Source text of the token; empty for INDENT/DEDENT/end of file.
    pub text: String,
    pub pos: Pos,
}

/// Byte offsets of line starts, for offset to line/column conversion.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        LineIndex { starts }
    }

    fn line_start(&self, offset: usize) -> usize {
        let line = self.starts.partition_point(|&s| s <= offset).saturating_sub(1);
        self.starts[line]
    }

    fn pos(&self, source: &str, offset: usize) -> Pos {
        let line = self.starts.partition_point(|&s| s <= offset).saturating_sub(1);
        let start = self.starts[line];
        let col = source.get(start..offset).map_or(offset - start, |s| s.chars().count());
        Pos { line: line + 1, col: col + 1 }
    }
}

/// Stack of open indentation widths.
pub struct IndentationTracker {
    stack: Vec<usize>,
}

impl IndentationTracker {
    pub fn new() -> Self {
        IndentationTracker { stack: vec![0] }
    }

    /// INDENT/DEDENT tokens for a logical line starting at `width`; the
    /// error flag is set when a dedent lands between two open levels.
    pub fn process(&mut self, width: usize) -> (Vec<TokenKind>, bool) {
        let current = self.stack.last().copied().unwrap_or(0);
        let mut out = Vec::new();
        if width > current {
            self.stack.push(width);
            out.push(TokenKind::Indent);
            return (out, false);
        }
        while self.stack.last().is_some_and(|&level| level > width) {
            self.stack.pop();
            out.push(TokenKind::Dedent);
        }
        let mismatch = self.stack.last() != Some(&width);
        (out, mismatch)
    }

    /// DEDENTs closing every open block at end of input.
    pub fn finish(&mut self) -> Vec<TokenKind> {
        let open = self.stack.len().saturating_sub(1);
        self.stack.truncate(1);
        vec![TokenKind::Dedent; open]
    }
}

impl Default for IndentationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy token sequence for one module.
pub struct TokenStream<'src> {
    source: &'src str,
    raw: logos::Lexer<'src, TokenKind>,
    lines: LineIndex,
    indents: IndentationTracker,
    pending: VecDeque<Result<Token, CompileError>>,
    depth: usize,
    at_line_start: bool,
    line_has_content: bool,
    indent_char: Option<char>,
    done: bool,
}

impl<'src> TokenStream<'src> {
    pub fn new(source: &'src str) -> Self {
        TokenStream {
            source,
            raw: TokenKind::lexer(source),
            lines: LineIndex::new(source),
            indents: IndentationTracker::new(),
            pending: VecDeque::new(),
            depth: 0,
            at_line_start: true,
            line_has_content: false,
            indent_char: None,
            done: false,
        }
    }

    fn push(&mut self, kind: TokenKind, text: &str, pos: Pos) {
        self.pending.push_back(Ok(Token { kind, text: text.to_string(), pos }));
    }

    fn error(&mut self, pos: Pos, msg: impl Into<String>) {
        self.pending.push_back(Err(CompileError::lex(pos, msg)));
    }

    /// Compare the leading whitespace of the logical line that starts at
    /// `offset` against the open indentation levels.
    fn indentation(&mut self, offset: usize) {
        self.at_line_start = false;
        if self.depth > 0 {
            return;
        }
        let line_start = self.lines.line_start(offset);
        let prefix = &self.source[line_start..offset];
        let pos = self.lines.pos(self.source, offset);
        if prefix.contains(' ') && prefix.contains('\t') {
            self.error(pos, "inconsistent use of tabs and spaces in indentation");
        } else if let Some(c) = prefix.chars().find(|c| *c == ' ' || *c == '\t') {
            match self.indent_char {
                None => self.indent_char = Some(c),
                Some(style) if style != c => {
                    self.error(pos, "inconsistent use of tabs and spaces in indentation");
                }
                Some(_) => {}
            }
        }
        let width = prefix.chars().filter(|c| *c == ' ' || *c == '\t').count();
        let (tokens, mismatch) = self.indents.process(width);
        for kind in tokens {
            self.push(kind, "", pos);
        }
        if mismatch {
            self.error(pos, "unindent does not match any outer indentation level");
        }
    }

    fn fill(&mut self) {
        let Some(item) = self.raw.next() else {
            let pos = self.lines.pos(self.source, self.source.len());
            if self.line_has_content {
                self.push(TokenKind::Newline, "", pos);
            }
            for kind in self.indents.finish() {
                self.push(kind, "", pos);
            }
            self.push(TokenKind::EndOfFile, "", pos);
            self.done = true;
            return;
        };
        let span = self.raw.span();
        let text = self.raw.slice();
        let pos = self.lines.pos(self.source, span.start);
        if item == Ok(TokenKind::Newline) {
            if self.depth == 0 && self.line_has_content {
                self.push(TokenKind::Newline, text, pos);
                self.line_has_content = false;
                self.at_line_start = true;
            }
            return;
        }
        if self.at_line_start {
            self.indentation(span.start);
        }
        self.line_has_content = true;
        match item {
            Ok(kind) => {
                match kind {
                    TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => self.depth += 1,
                    TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                        self.depth = self.depth.saturating_sub(1);
                    }
                    _ => {}
                }
                self.push(kind, text, pos);
            }
            Err(fault) => {
                let msg = match fault {
                    LexFault::UnexpectedChar => format!("unexpected character '{text}'"),
                    other => other.to_string(),
                };
                self.error(pos, msg);
            }
        }
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<Token, CompileError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            self.fill();
        }
    }
}

/// Tokenize a whole module, collecting every lexical error.
pub fn lex(source: &str) -> (Vec<Token>, Vec<CompileError>) {
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    for item in TokenStream::new(source) {
        match item {
            Ok(token) => tokens.push(token),
            Err(e) => errors.push(e),
        }
    }
    (tokens, errors)
}
