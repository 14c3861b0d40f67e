//! Dependency scanner.
//!
//! Finds `require("x")`, `import ... from "x"`, `import "x"`,
//! `export ... from "x"` and `import("x")` in module source without a full
//! parse. Comments, string literals, template literals and regular
//! expression literals are skipped so specifier-like text inside them is
//! never reported.

use std::ops::Range;
use thiserror::Error;

/// How a dependency was referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Require,
    Static,
    ReExport,
    Dynamic,
}

/// One dependency reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub specifier: String,
    pub kind: ImportKind,
    /// Line of the referencing keyword (1-indexed).
    pub line: u32,
}

/// Malformed source. `partial` holds the references found before the error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at {line}:{column}")]
pub struct ScanError {
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub partial: Vec<ImportRef>,
}

/// Byte ranges of comments, string literals, template text and regular
/// expression literals in `source`, sorted and non-overlapping.
///
/// Everything outside the ranges is code. On malformed input the ranges
/// found before the error are returned.
pub fn literal_spans(source: &str) -> Vec<Range<usize>> {
    let mut scanner = Scanner::new(source);
    let _ = scanner.run();

    let mut offsets: Vec<usize> = source.char_indices().map(|(i, _)| i).collect();
    offsets.push(source.len());

    let mut chars = scanner.literals;
    chars.sort_by_key(|r| r.start);
    let mut spans: Vec<Range<usize>> = Vec::with_capacity(chars.len());
    for r in chars {
        let span = offsets[r.start]..offsets[r.end];
        match spans.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => spans.push(span),
        }
    }
    spans
}

/// Keywords after which a `/` starts a regular expression.
const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

/// Scan source for dependency references.
///
/// Returns references in first-appearance order, deduplicated by specifier.
pub fn scan_imports(source: &str) -> Result<Vec<ImportRef>, ScanError> {
    let mut scanner = Scanner::new(source);
    match scanner.run() {
        Ok(()) => Ok(scanner.found),
        Err((message, line, column)) => Err(ScanError {
            message,
            line,
            column,
            partial: scanner.found,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prev {
    Start,
    Punct(char),
    Word(String),
    Value,
}

type Failure = (String, u32, u32);

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    prev: Prev,
    found: Vec<ImportRef>,
    /// Char ranges skipped as literals or comments.
    literals: Vec<Range<usize>>,
}

#[derive(Clone, Copy)]
struct Mark {
    pos: usize,
    line: u32,
    col: u32,
}

impl Scanner {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            prev: Prev::Start,
            found: Vec::new(),
            literals: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek(0)?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            line: self.line,
            col: self.col,
        }
    }

    fn reset(&mut self, mark: Mark) {
        self.pos = mark.pos;
        self.line = mark.line;
        self.col = mark.col;
    }

    fn fail(mark: Mark, message: &str) -> Failure {
        (message.to_string(), mark.line, mark.col)
    }

    fn push(&mut self, specifier: String, kind: ImportKind, line: u32) {
        if !specifier.is_empty() && !self.found.iter().any(|r| r.specifier == specifier) {
            self.found.push(ImportRef {
                specifier,
                kind,
                line,
            });
        }
    }

    fn run(&mut self) -> Result<(), Failure> {
        if self.peek(0) == Some('#') && self.peek(1) == Some('!') {
            while self.peek(0).is_some_and(|c| c != '\n') {
                self.bump();
            }
        }

        while let Some(c) = self.peek(0) {
            match c {
                c if c.is_whitespace() => {
                    self.bump();
                }
                '/' if self.peek(1) == Some('/') => self.skip_line_comment(),
                '/' if self.peek(1) == Some('*') => self.skip_block_comment()?,
                '"' | '\'' => {
                    self.read_string()?;
                    self.prev = Prev::Value;
                }
                '`' => {
                    self.skip_template()?;
                    self.prev = Prev::Value;
                }
                '/' if self.regex_allowed() => {
                    self.skip_regex();
                    self.prev = Prev::Value;
                }
                c if is_ident_start(c) => self.word()?,
                c if c.is_ascii_digit() => {
                    while self.peek(0).is_some_and(|c| c.is_alphanumeric() || c == '.' || c == '_') {
                        self.bump();
                    }
                    self.prev = Prev::Value;
                }
                c => {
                    self.bump();
                    self.prev = if c == ')' || c == ']' {
                        Prev::Value
                    } else {
                        Prev::Punct(c)
                    };
                }
            }
        }
        Ok(())
    }

    fn regex_allowed(&self) -> bool {
        match &self.prev {
            Prev::Start => true,
            Prev::Punct(c) => *c != '}',
            Prev::Word(w) => REGEX_KEYWORDS.contains(&w.as_str()),
            Prev::Value => false,
        }
    }

    fn skip_line_comment(&mut self) {
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.bump();
        }
        self.literals.push(start..self.pos);
    }

    fn skip_block_comment(&mut self) -> Result<(), Failure> {
        let start = self.mark();
        self.bump();
        self.bump();
        loop {
            match self.peek(0) {
                None => return Err(Self::fail(start, "unterminated block comment")),
                Some('*') if self.peek(1) == Some('/') => {
                    self.bump();
                    self.bump();
                    self.literals.push(start.pos..self.pos);
                    return Ok(());
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    /// Skip whitespace and comments between tokens.
    fn skip_trivia(&mut self) -> Result<(), Failure> {
        loop {
            match self.peek(0) {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek(1) == Some('/') => self.skip_line_comment(),
                Some('/') if self.peek(1) == Some('*') => self.skip_block_comment()?,
                _ => return Ok(()),
            }
        }
    }

    /// Read a quoted string starting at the current quote character.
    fn read_string(&mut self) -> Result<String, Failure> {
        let start = self.mark();
        let Some(quote) = self.bump() else {
            return Err(Self::fail(start, "unterminated string literal"));
        };
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(Self::fail(start, "unterminated string literal")),
                Some('\\') => match self.bump() {
                    None => return Err(Self::fail(start, "unterminated string literal")),
                    Some('\n') => {}
                    Some(escaped) => value.push(escaped),
                },
                Some(c) if c == quote => {
                    self.literals.push(start.pos..self.pos);
                    return Ok(value);
                }
                Some(c) => value.push(c),
            }
        }
    }

    fn skip_template(&mut self) -> Result<(), Failure> {
        let start = self.mark();
        let mut text_start = self.pos;
        self.bump();
        loop {
            match self.bump() {
                None => return Err(Self::fail(start, "unterminated template literal")),
                Some('\\') => {
                    self.bump();
                }
                Some('`') => {
                    self.literals.push(text_start..self.pos);
                    return Ok(());
                }
                Some('$') if self.peek(0) == Some('{') => {
                    self.bump();
                    self.literals.push(text_start..self.pos);
                    self.skip_template_expr(start)?;
                    text_start = self.pos - 1;
                }
                Some(_) => {}
            }
        }
    }

    /// Skip a `${ ... }` substitution, including nested literals.
    fn skip_template_expr(&mut self, template_start: Mark) -> Result<(), Failure> {
        let mut depth = 1usize;
        loop {
            match self.peek(0) {
                None => return Err(Self::fail(template_start, "unterminated template literal")),
                Some('/') if self.peek(1) == Some('/') => self.skip_line_comment(),
                Some('/') if self.peek(1) == Some('*') => self.skip_block_comment()?,
                Some('"' | '\'') => {
                    self.read_string()?;
                }
                Some('`') => self.skip_template()?,
                Some('{') => {
                    depth += 1;
                    self.bump();
                }
                Some('}') => {
                    depth -= 1;
                    self.bump();
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    /// Skip a regular expression literal. A line break before the closing
    /// slash means the `/` was an operator after all.
    fn skip_regex(&mut self) {
        let start = self.mark();
        self.bump();
        let mut in_class = false;
        loop {
            match self.bump() {
                None | Some('\n') => {
                    self.reset(start);
                    self.bump();
                    return;
                }
                Some('\\') => {
                    if self.peek(0).is_some_and(|c| c != '\n') {
                        self.bump();
                    }
                }
                Some('[') => in_class = true,
                Some(']') => in_class = false,
                Some('/') if !in_class => break,
                Some(_) => {}
            }
        }
        while self.peek(0).is_some_and(is_ident_part) {
            self.bump();
        }
        self.literals.push(start.pos..self.pos);
    }

    fn read_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek(0).filter(|c| is_ident_part(*c)) {
            word.push(c);
            self.bump();
        }
        word
    }

    fn word(&mut self) -> Result<(), Failure> {
        let line = self.line;
        let member = self.prev == Prev::Punct('.');
        let word = self.read_word();

        if !member {
            match word.as_str() {
                "require" => self.require_call(line)?,
                "import" => self.import(line)?,
                "export" => self.export(line)?,
                _ => {}
            }
        }

        self.prev = Prev::Word(word);
        Ok(())
    }

    /// `require ( "x" )`
    fn require_call(&mut self, line: u32) -> Result<(), Failure> {
        let mark = self.mark();
        if let Some(specifier) = self.call_argument()? {
            self.push(specifier, ImportKind::Require, line);
        } else {
            self.reset(mark);
        }
        Ok(())
    }

    /// Parse `( "x" )` or `( "x", ...` and return the literal.
    fn call_argument(&mut self) -> Result<Option<String>, Failure> {
        self.skip_trivia()?;
        if self.peek(0) != Some('(') {
            return Ok(None);
        }
        self.bump();
        self.skip_trivia()?;
        if !matches!(self.peek(0), Some('"' | '\'')) {
            return Ok(None);
        }
        let specifier = self.read_string()?;
        self.skip_trivia()?;
        if matches!(self.peek(0), Some(')' | ',')) {
            Ok(Some(specifier))
        } else {
            Ok(None)
        }
    }

    fn import(&mut self, line: u32) -> Result<(), Failure> {
        let mark = self.mark();
        self.skip_trivia()?;
        match self.peek(0) {
            Some('(') => {
                if let Some(specifier) = self.call_argument()? {
                    self.push(specifier, ImportKind::Dynamic, line);
                    return Ok(());
                }
            }
            Some('"' | '\'') => {
                let specifier = self.read_string()?;
                self.push(specifier, ImportKind::Static, line);
                self.prev = Prev::Value;
                return Ok(());
            }
            Some('.') => {}
            Some(_) => {
                if let Some(specifier) = self.from_clause()? {
                    self.push(specifier, ImportKind::Static, line);
                    return Ok(());
                }
            }
            None => {}
        }
        self.reset(mark);
        Ok(())
    }

    fn export(&mut self, line: u32) -> Result<(), Failure> {
        let mark = self.mark();
        self.skip_trivia()?;
        if matches!(self.peek(0), Some('*' | '{')) {
            if let Some(specifier) = self.from_clause()? {
                self.push(specifier, ImportKind::ReExport, line);
                return Ok(());
            }
        }
        self.reset(mark);
        Ok(())
    }

    /// Walk an import/export clause (`a, { b as c }`, `* as ns`) up to
    /// `from "x"`. Anything else ends the attempt.
    fn from_clause(&mut self) -> Result<Option<String>, Failure> {
        loop {
            self.skip_trivia()?;
            match self.peek(0) {
                Some('{' | '}' | ',' | '*') => {
                    self.bump();
                }
                Some(c) if is_ident_start(c) => {
                    let word = self.read_word();
                    if word == "from" {
                        self.skip_trivia()?;
                        if matches!(self.peek(0), Some('"' | '\'')) {
                            let specifier = self.read_string()?;
                            self.prev = Prev::Value;
                            return Ok(Some(specifier));
                        }
                        return Ok(None);
                    }
                }
                _ => return Ok(None),
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
