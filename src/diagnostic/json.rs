//! Highlights for JSON sources addressed by JSON pointers.
//!
//! Config-file diagnostics (a bad field in `package.json`, an unknown option
//! in a pipeline config) want to point at a key, a value, or both. The
//! scanner below walks the source once and records where every pointer's key
//! and value start and end. Columns count characters, so a tab is always one
//! column no matter how a terminal would render it.

use std::collections::HashMap;

use thiserror::Error;

use crate::diagnostic::{CodeHighlight, Location};

/// Which part of a JSON member should be highlighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HighlightKind {
    /// From the start of the key to the end of the value. Falls back to the
    /// value when the pointer has no key (array items, the document root).
    #[default]
    Both,
    Key,
    Value,
}

/// A request for one highlight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonHighlight {
    /// JSON pointer, e.g. `/dependencies/react`.
    pub key: String,
    pub kind: HighlightKind,
    pub message: Option<String>,
}

impl JsonHighlight {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: HighlightKind::Both,
            message: None,
        }
    }

    pub fn kind(mut self, kind: HighlightKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JsonHighlightError {
    #[error("Invalid JSON at {line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: &'static str,
    },

    #[error("No value at JSON pointer '{0}'")]
    UnknownPointer(String),

    #[error("JSON pointer '{0}' does not address an object member, it has no key")]
    NoKey(String),
}

/// Escapes a raw object key so it can be embedded in a JSON pointer.
pub fn encode_json_key_component(component: &str) -> String {
    component.replace('~', "~0").replace('/', "~1")
}

/// Resolves each requested pointer to a code highlight.
pub fn generate_json_code_highlights(
    code: &str,
    ids: &[JsonHighlight],
) -> Result<Vec<CodeHighlight>, JsonHighlightError> {
    let pointers = Scanner::new(code).parse()?;

    ids.iter()
        .map(|id| {
            let pointer = pointers
                .get(&id.key)
                .ok_or_else(|| JsonHighlightError::UnknownPointer(id.key.clone()))?;

            let (start, end) = match (id.kind, &pointer.key) {
                (HighlightKind::Both, Some((key_start, _))) => (*key_start, pointer.value.1),
                (HighlightKind::Key, Some(key)) => *key,
                (HighlightKind::Key, None) => {
                    return Err(JsonHighlightError::NoKey(id.key.clone()));
                }
                (HighlightKind::Value | HighlightKind::Both, _) => pointer.value,
            };

            Ok(CodeHighlight {
                start: start.opening(),
                end: end.closing(),
                message: id.message.clone(),
            })
        })
        .collect()
}

/// 0-based cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    line: usize,
    column: usize,
}

impl Pos {
    /// Position of the first character of a token.
    fn opening(self) -> Location {
        Location::new(self.line + 1, self.column + 1)
    }

    /// `self` points one past the token, which is the last character of the
    /// token once converted to 1-based columns.
    fn closing(self) -> Location {
        Location::new(self.line + 1, self.column)
    }
}

type Span = (Pos, Pos);

/// Deepest nesting of objects and arrays the scanner follows.
const MAX_DEPTH: usize = 128;

#[derive(Debug)]
struct Pointer {
    key: Option<Span>,
    value: Span,
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    pos: Pos,
    depth: usize,
    pointers: HashMap<String, Pointer>,
}

impl<'a> Scanner<'a> {
    fn new(code: &'a str) -> Self {
        Self {
            chars: code.chars().peekable(),
            pos: Pos { line: 0, column: 0 },
            depth: 0,
            pointers: HashMap::new(),
        }
    }

    fn parse(mut self) -> Result<HashMap<String, Pointer>, JsonHighlightError> {
        self.whitespace();
        self.value(String::new(), None)?;
        self.whitespace();
        if self.chars.peek().is_some() {
            return Err(self.fail("unexpected trailing characters"));
        }
        Ok(self.pointers)
    }

    fn fail(&self, message: &'static str) -> JsonHighlightError {
        JsonHighlightError::Syntax {
            line: self.pos.line + 1,
            column: self.pos.column + 1,
            message,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let next = self.chars.next()?;
        if next == '\n' {
            self.pos.line += 1;
            self.pos.column = 0;
        } else {
            self.pos.column += 1;
        }
        Some(next)
    }

    fn expect(&mut self, expected: char, message: &'static str) -> Result<(), JsonHighlightError> {
        match self.chars.peek() {
            Some(&c) if c == expected => {
                self.bump();
                Ok(())
            }
            _ => Err(self.fail(message)),
        }
    }

    fn whitespace(&mut self) {
        while let Some(' ' | '\t' | '\n' | '\r') = self.chars.peek() {
            self.bump();
        }
    }

    fn value(&mut self, pointer: String, key: Option<Span>) -> Result<(), JsonHighlightError> {
        let start = self.pos;

        match self.chars.peek() {
            Some('{' | '[') if self.depth >= MAX_DEPTH => {
                return Err(self.fail("nesting too deep"));
            }
            Some('{') => {
                self.depth += 1;
                self.object(&pointer)?;
                self.depth -= 1;
            }
            Some('[') => {
                self.depth += 1;
                self.array(&pointer)?;
                self.depth -= 1;
            }
            Some('"') => {
                self.string()?;
            }
            Some('t') => self.literal("true")?,
            Some('f') => self.literal("false")?,
            Some('n') => self.literal("null")?,
            Some('-' | '0'..='9') => self.number()?,
            _ => return Err(self.fail("expected a value")),
        }

        let value = (start, self.pos);
        self.pointers.insert(pointer, Pointer { key, value });
        Ok(())
    }

    fn object(&mut self, pointer: &str) -> Result<(), JsonHighlightError> {
        self.bump();
        self.whitespace();

        if let Some('}') = self.chars.peek() {
            self.bump();
            return Ok(());
        }

        loop {
            self.whitespace();
            let key_start = self.pos;
            let name = self.string()?;
            let key = (key_start, self.pos);

            self.whitespace();
            self.expect(':', "expected ':' after object key")?;
            self.whitespace();

            let child = format!("{pointer}/{}", encode_json_key_component(&name));
            self.value(child, Some(key))?;
            self.whitespace();

            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(()),
                _ => return Err(self.fail("expected ',' or '}' in object")),
            }
        }
    }

    fn array(&mut self, pointer: &str) -> Result<(), JsonHighlightError> {
        self.bump();
        self.whitespace();

        if let Some(']') = self.chars.peek() {
            self.bump();
            return Ok(());
        }

        let mut index = 0;
        loop {
            self.whitespace();
            self.value(format!("{pointer}/{index}"), None)?;
            self.whitespace();
            index += 1;

            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(()),
                _ => return Err(self.fail("expected ',' or ']' in array")),
            }
        }
    }

    fn string(&mut self) -> Result<String, JsonHighlightError> {
        self.expect('"', "expected a string")?;
        let mut out = String::new();

        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('/') => out.push('/'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('u') => {
                        let mut code = 0u32;
                        for _ in 0..4 {
                            let digit = self
                                .bump()
                                .and_then(|c| c.to_digit(16))
                                .ok_or_else(|| self.fail("invalid unicode escape"))?;
                            code = code * 16 + digit;
                        }
                        out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                    }
                    _ => return Err(self.fail("invalid escape sequence")),
                },
                Some('\n') | None => return Err(self.fail("unterminated string")),
                Some(c) => out.push(c),
            }
        }
    }

    fn literal(&mut self, word: &'static str) -> Result<(), JsonHighlightError> {
        for expected in word.chars() {
            if self.bump() != Some(expected) {
                return Err(self.fail("invalid literal"));
            }
        }
        Ok(())
    }

    fn number(&mut self) -> Result<(), JsonHighlightError> {
        let mut digits = 0;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                digits += 1;
            } else if !matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                break;
            }
            self.bump();
        }

        if digits == 0 {
            return Err(self.fail("invalid number"));
        }
        Ok(())
    }
}
