//! SQL text model.
//!
//! SQL is parsed once into a tree of nodes (literals, comments, parameter
//! placeholders, parenthesised groups and `{...}` escapes), edited in place
//! and rendered back to text. Parsing is lossless: rendering an unedited
//! tree reproduces the input, except that `?` placeholders render as `$n`.

use std::fmt;

use super::error::{PgError, PgResult};

/// One segment of SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Unquoted identifier or keyword
    Word(String),
    /// `"ident"`, raw text including quotes
    QuotedIdent(String),
    /// String constant, raw text including prefix and quotes
    StringLit(String),
    /// `$tag$...$tag$`, raw text
    DollarQuoted(String),
    Number(String),
    Operator(String),
    Whitespace(String),
    Comment(String),
    /// 1-based placeholder, rendered as `$n`
    Parameter(usize),
    /// `( ... )`
    Paren(Vec<Node>),
    /// `{ ... }` driver escape
    Escape(Vec<Node>),
    /// Text produced by a rewrite
    Raw(String),
}

impl Node {
    pub fn is_trivia(&self) -> bool {
        matches!(self, Node::Whitespace(_) | Node::Comment(_))
    }

    /// Case-insensitive keyword match.
    pub fn is_word(&self, word: &str) -> bool {
        matches!(self, Node::Word(w) if w.eq_ignore_ascii_case(word))
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Node::Word(s)
            | Node::QuotedIdent(s)
            | Node::StringLit(s)
            | Node::DollarQuoted(s)
            | Node::Number(s)
            | Node::Operator(s)
            | Node::Whitespace(s)
            | Node::Comment(s)
            | Node::Raw(s) => out.push_str(s),
            Node::Parameter(n) => {
                out.push('$');
                out.push_str(&n.to_string());
            }
            Node::Paren(nodes) => {
                out.push('(');
                render_nodes(nodes, out);
                out.push(')');
            }
            Node::Escape(nodes) => {
                out.push('{');
                render_nodes(nodes, out);
                out.push('}');
            }
        }
    }
}

pub(crate) fn render_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        node.render_into(out);
    }
}

/// Apply `f` to every node, depth first, children before parents.
pub(crate) fn visit_mut(nodes: &mut [Node], f: &mut dyn FnMut(&mut Node)) {
    for node in nodes.iter_mut() {
        if let Node::Paren(children) | Node::Escape(children) = node {
            visit_mut(children, f);
        }
        f(node);
    }
}

fn visit(nodes: &[Node], f: &mut dyn FnMut(&Node)) {
    for node in nodes {
        if let Node::Paren(children) | Node::Escape(children) = node {
            visit(children, f);
        }
        f(node);
    }
}

/// Parsed SQL: one node list per `;`-separated statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SqlText {
    statements: Vec<Vec<Node>>,
}

impl SqlText {
    pub fn parse(text: &str) -> PgResult<Self> {
        Parser::new(text).parse()
    }

    pub fn statements(&self) -> &[Vec<Node>] {
        &self.statements
    }

    pub fn statements_mut(&mut self) -> &mut [Vec<Node>] {
        &mut self.statements
    }

    /// Statements that contain something besides whitespace and comments.
    pub fn statement_count(&self) -> usize {
        self.statements
            .iter()
            .filter(|s| s.iter().any(|n| !n.is_trivia()))
            .count()
    }

    /// Highest placeholder index; `?` and `$n` share the numbering.
    pub fn count_parameters(&self) -> usize {
        let mut max = 0;
        for statement in &self.statements {
            visit(statement, &mut |node| {
                if let Node::Parameter(n) = node {
                    max = max.max(*n);
                }
            });
        }
        max
    }

    pub fn has_escapes(&self) -> bool {
        let mut found = false;
        for statement in &self.statements {
            visit(statement, &mut |node| {
                if matches!(node, Node::Escape(_)) {
                    found = true;
                }
            });
        }
        found
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, statement) in self.statements.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            render_nodes(statement, &mut out);
        }
        out
    }

    /// The single non-blank statement, if there is exactly one.
    fn single_statement_mut(&mut self) -> Option<&mut Vec<Node>> {
        if self.statement_count() != 1 {
            return None;
        }
        self.statements
            .iter_mut()
            .find(|s| s.iter().any(|n| !n.is_trivia()))
    }

    /// Leading keyword of the single statement, uppercased.
    pub fn leading_keyword(&self) -> Option<String> {
        self.statements
            .iter()
            .find(|s| s.iter().any(|n| !n.is_trivia()))
            .and_then(|s| first_word(s))
            .map(|w| w.to_ascii_uppercase())
    }

    /// Append `RETURNING <columns>` (or `RETURNING *`) to a single
    /// INSERT, UPDATE or DELETE. Returns false for any other shape.
    pub fn append_returning_clause(&mut self, columns: &[&str]) -> bool {
        let Some(statement) = self.single_statement_mut() else {
            return false;
        };
        let Some(keyword) = first_word(statement) else {
            return false;
        };
        if !matches!(
            keyword.to_ascii_uppercase().as_str(),
            "INSERT" | "UPDATE" | "DELETE"
        ) {
            return false;
        }
        if statement.iter().any(|n| n.is_word("RETURNING")) {
            return true;
        }

        let list = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(", ")
        };
        let at = statement
            .iter()
            .rposition(|n| !n.is_trivia())
            .map(|p| p + 1)
            .unwrap_or(statement.len());
        statement.insert(at, Node::Raw(format!(" RETURNING {}", list)));
        true
    }

    /// Turn a single SELECT into `DECLARE <name> ... CURSOR FOR SELECT ...`.
    /// Returns false for any other shape.
    pub fn prepend_cursor_declaration(&mut self, name: &str, scrollable: bool, holdable: bool) -> bool {
        let Some(statement) = self.single_statement_mut() else {
            return false;
        };
        match first_word(statement) {
            Some(word) if word.eq_ignore_ascii_case("SELECT") => {}
            _ => return false,
        }

        let declaration = format!(
            "DECLARE {} {}SCROLL CURSOR {}FOR ",
            name,
            if scrollable { "" } else { "NO " },
            if holdable { "WITH HOLD " } else { "" },
        );
        let at = statement
            .iter()
            .position(|n| !n.is_trivia())
            .unwrap_or(0);
        statement.insert(at, Node::Raw(declaration));
        true
    }
}

impl fmt::Display for SqlText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn first_word(nodes: &[Node]) -> Option<&str> {
    nodes.iter().find(|n| !n.is_trivia()).and_then(|n| match n {
        Node::Word(w) => Some(w.as_str()),
        _ => None,
    })
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    next_param: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            next_param: 1,
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn parse(mut self) -> PgResult<SqlText> {
        let mut statements = Vec::new();
        loop {
            statements.push(self.sequence(None, 0)?);
            if self.peek(0) == Some(b';') {
                self.pos += 1;
                // placeholders are numbered per statement
                self.next_param = 1;
                continue;
            }
            break;
        }
        Ok(SqlText { statements })
    }

    fn sequence(&mut self, close: Option<u8>, open_at: usize) -> PgResult<Vec<Node>> {
        let mut nodes = Vec::new();
        while let Some(c) = self.peek(0) {
            match c {
                b')' | b'}' if Some(c) == close => {
                    self.pos += 1;
                    return Ok(nodes);
                }
                b')' => return Err(PgError::syntax("Mismatched parenthesis", self.pos)),
                b'}' => return Err(PgError::syntax("Mismatched curly brace", self.pos)),
                b';' if close.is_none() => return Ok(nodes),
                _ => {
                    let node = self.node()?;
                    nodes.push(node);
                }
            }
        }
        match close {
            None => Ok(nodes),
            Some(b')') => Err(PgError::syntax("Mismatched parenthesis", open_at)),
            Some(_) => Err(PgError::syntax("Mismatched curly brace", open_at)),
        }
    }

    fn node(&mut self) -> PgResult<Node> {
        let start = self.pos;
        let c = self.bytes[start];
        let next = self.peek(1);

        let node = match c {
            b'(' => {
                self.pos += 1;
                Node::Paren(self.sequence(Some(b')'), start)?)
            }
            b'{' => {
                self.pos += 1;
                Node::Escape(self.sequence(Some(b'}'), start)?)
            }
            b'\'' => self.string_literal(start, false)?,
            b'E' | b'e' if next == Some(b'\'') => {
                self.pos += 1;
                self.string_literal(start, true)?
            }
            b'B' | b'b' | b'X' | b'x' | b'N' | b'n' if next == Some(b'\'') => {
                self.pos += 1;
                self.string_literal(start, false)?
            }
            b'U' | b'u' if next == Some(b'&') && self.peek(2) == Some(b'\'') => {
                self.pos += 2;
                self.string_literal(start, false)?
            }
            b'"' => self.quoted_ident(start)?,
            b'-' if next == Some(b'-') => {
                while let Some(c) = self.peek(0) {
                    if c == b'\n' {
                        break;
                    }
                    self.pos += 1;
                }
                Node::Comment(self.src[start..self.pos].to_string())
            }
            b'/' if next == Some(b'*') => self.block_comment(start)?,
            b'?' if next == Some(b'?') => {
                self.pos += 2;
                Node::Operator("?".to_string())
            }
            b'?' => {
                self.pos += 1;
                let n = self.next_param;
                self.next_param += 1;
                Node::Parameter(n)
            }
            b'$' => self.dollar(start)?,
            b':' if next == Some(b':') => {
                self.pos += 2;
                Node::Operator("::".to_string())
            }
            c if c.is_ascii_whitespace() => {
                while self.peek(0).is_some_and(|c| c.is_ascii_whitespace()) {
                    self.pos += 1;
                }
                Node::Whitespace(self.src[start..self.pos].to_string())
            }
            c if c.is_ascii_digit() || (c == b'.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                self.number(start)
            }
            c if is_ident_start(c) => {
                while self.peek(0).is_some_and(is_ident_part) {
                    self.pos += 1;
                }
                Node::Word(self.src[start..self.pos].to_string())
            }
            _ => {
                self.pos += 1;
                Node::Operator(self.src[start..self.pos].to_string())
            }
        };
        Ok(node)
    }

    /// `pos` is at the opening quote.
    fn string_literal(&mut self, start: usize, backslash_escapes: bool) -> PgResult<Node> {
        self.pos += 1;
        loop {
            match self.peek(0) {
                None => return Err(PgError::syntax("Unterminated string literal", start)),
                Some(b'\\') if backslash_escapes => self.pos += 2,
                Some(b'\'') if self.peek(1) == Some(b'\'') => self.pos += 2,
                Some(b'\'') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        Ok(Node::StringLit(self.src[start..self.pos].to_string()))
    }

    fn quoted_ident(&mut self, start: usize) -> PgResult<Node> {
        self.pos += 1;
        loop {
            match self.peek(0) {
                None => return Err(PgError::syntax("Unterminated quoted identifier", start)),
                Some(b'"') if self.peek(1) == Some(b'"') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        Ok(Node::QuotedIdent(self.src[start..self.pos].to_string()))
    }

    fn block_comment(&mut self, start: usize) -> PgResult<Node> {
        self.pos += 2;
        let mut depth = 1;
        while depth > 0 {
            match (self.peek(0), self.peek(1)) {
                (None, _) => return Err(PgError::syntax("Unterminated comment", start)),
                (Some(b'/'), Some(b'*')) => {
                    depth += 1;
                    self.pos += 2;
                }
                (Some(b'*'), Some(b'/')) => {
                    depth -= 1;
                    self.pos += 2;
                }
                _ => self.pos += 1,
            }
        }
        Ok(Node::Comment(self.src[start..self.pos].to_string()))
    }

    /// `$n` placeholder, `$tag$...$tag$` quoting, or a lone `$`.
    fn dollar(&mut self, start: usize) -> PgResult<Node> {
        if self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            let digits_at = self.pos;
            while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            let n: usize = self.src[digits_at..self.pos]
                .parse()
                .map_err(|_| PgError::syntax("Invalid parameter number", start))?;
            if n == 0 {
                return Err(PgError::syntax("Invalid parameter number", start));
            }
            return Ok(Node::Parameter(n));
        }

        let mut end = start + 1;
        while self.bytes.get(end).is_some_and(|c| is_ident_part(*c) && *c != b'$') {
            end += 1;
        }
        if self.bytes.get(end) != Some(&b'$') {
            self.pos += 1;
            return Ok(Node::Operator("$".to_string()));
        }

        let tag = &self.src[start..=end];
        let body_at = end + 1;
        match self.src[body_at..].find(tag) {
            Some(offset) => {
                self.pos = body_at + offset + tag.len();
                Ok(Node::DollarQuoted(self.src[start..self.pos].to_string()))
            }
            None => Err(PgError::syntax("Unterminated dollar quote", start)),
        }
    }

    fn number(&mut self, start: usize) -> Node {
        while self.peek(0).is_some_and(|c| c.is_ascii_digit() || c == b'.') {
            self.pos += 1;
        }
        if matches!(self.peek(0), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(self.peek(1), Some(b'+' | b'-')));
            if self.peek(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1 + sign;
                while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        Node::Number(self.src[start..self.pos].to_string())
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c >= 0x80
}

fn is_ident_part(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c >= 0x80
}

/// Quote an identifier, doubling embedded double quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
