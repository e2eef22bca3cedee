//! Tokenizer for analysis scripts
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and
//! `Dedent` tokens. Newlines inside brackets and after a trailing `\` are
//! joined.

use super::error::{ScriptError, ScriptResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string, escapes already processed
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

const OPERATORS: &[&str] = &[
    "**=", "//=", "...", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->",
    "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", "&", "|",
    "~", "^", ";",
];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

pub fn tokenize(src: &str) -> ScriptResult<Vec<Token>> {
    let normalized = src.replace("\r\n", "\n").replace('\r', "\n");
    let mut lexer = Lexer {
        chars: normalized.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn newline(&mut self) {
        if matches!(self.tokens.last(), Some(t) if t.tok != Tok::Newline) {
            self.push(Tok::Newline);
        }
    }

    fn run(&mut self) -> ScriptResult<()> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                let mut col = 0;
                while let Some(c) = self.peek(0) {
                    match c {
                        ' ' => col += 1,
                        '\t' => col = (col / 8 + 1) * 8,
                        '\x0c' => col = 0,
                        _ => break,
                    }
                    self.pos += 1;
                }
                match self.peek(0) {
                    None => break,
                    Some('\n') => {
                        self.pos += 1;
                        self.line += 1;
                        continue;
                    }
                    Some('#') => {
                        self.skip_comment();
                        continue;
                    }
                    _ => {}
                }
                at_line_start = false;
                self.indent_to(col)?;
                continue;
            }

            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    if self.depth == 0 {
                        self.newline();
                        at_line_start = true;
                    }
                    self.pos += 1;
                    self.line += 1;
                }
                ' ' | '\t' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' => {
                    if self.peek(1) == Some('\n') {
                        self.pos += 2;
                        self.line += 1;
                    } else {
                        return Err(ScriptError::syntax(
                            self.line,
                            "unexpected character after line continuation character",
                        ));
                    }
                }
                '"' | '\'' => {
                    let body = self.string(false)?;
                    self.push(Tok::Str(body));
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.word()?,
                _ => self.operator()?,
            }
        }

        self.newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn indent_to(&mut self, col: usize) -> ScriptResult<()> {
        let top = self.indents.last().copied().unwrap_or(0);
        if col > top {
            self.indents.push(col);
            self.push(Tok::Indent);
            return Ok(());
        }
        while col < self.indents.last().copied().unwrap_or(0) {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        if col != self.indents.last().copied().unwrap_or(0) {
            return Err(ScriptError::syntax(
                self.line,
                "unindent does not match any outer indentation level",
            ));
        }
        Ok(())
    }

    fn word(&mut self) -> ScriptResult<()> {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        // String prefixes: f"..", r"..", rf"..", b"..", u".."
        if matches!(self.peek(0), Some('"') | Some('\'')) {
            let lower = word.to_ascii_lowercase();
            if matches!(lower.as_str(), "f" | "r" | "b" | "u" | "rf" | "fr" | "rb" | "br") {
                let raw = lower.contains('r');
                let body = self.string(raw)?;
                if lower.contains('f') {
                    self.push(Tok::FStr(body));
                } else {
                    self.push(Tok::Str(body));
                }
                return Ok(());
            }
        }

        self.push(Tok::Name(word));
        Ok(())
    }

    fn number(&mut self) -> ScriptResult<()> {
        let start = self.pos;
        let mut is_float = false;

        self.digits();
        if self.peek(0) == Some('.')
            && !self
                .peek(1)
                .is_some_and(|n| n.is_alphabetic() || n == '_' || n == '.')
        {
            is_float = true;
            self.pos += 1;
            self.digits();
        }
        if matches!(self.peek(0), Some('e') | Some('E')) {
            let sign = matches!(self.peek(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek(digit_at).is_some_and(|d| d.is_ascii_digit()) {
                is_float = true;
                self.pos += digit_at;
                self.digits();
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();

        if is_float {
            let value = text.parse::<f64>().map_err(|_| {
                ScriptError::syntax(self.line, format!("invalid number literal '{}'", text))
            })?;
            self.push(Tok::Float(value));
        } else {
            match text.parse::<i64>() {
                Ok(value) => self.push(Tok::Int(value)),
                Err(_) => {
                    let value = text.parse::<f64>().map_err(|_| {
                        ScriptError::syntax(self.line, format!("invalid number literal '{}'", text))
                    })?;
                    self.push(Tok::Float(value));
                }
            }
        }
        Ok(())
    }

    fn digits(&mut self) {
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn string(&mut self, raw: bool) -> ScriptResult<String> {
        let quote = self.chars[self.pos];
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        let start_line = self.line;
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(ScriptError::syntax(
                    start_line,
                    "unterminated string literal",
                ));
            };

            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
            }

            if c == '\n' {
                if !triple {
                    return Err(ScriptError::syntax(
                        start_line,
                        "unterminated string literal",
                    ));
                }
                self.line += 1;
            }

            if c == '\\' && !raw {
                let next = self.peek(1).ok_or_else(|| {
                    ScriptError::syntax(start_line, "unterminated string literal")
                })?;
                self.pos += 2;
                match next {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' => out.push('\\'),
                    '\'' => out.push('\''),
                    '"' => out.push('"'),
                    '\n' => self.line += 1,
                    'x' => out.push(self.hex_escape(2)?),
                    'u' => out.push(self.hex_escape(4)?),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                continue;
            }

            if c == '\\' && raw && self.peek(1) == Some(quote) {
                out.push('\\');
                out.push(quote);
                self.pos += 2;
                continue;
            }

            out.push(c);
            self.pos += 1;
        }
    }

    fn hex_escape(&mut self, len: usize) -> ScriptResult<char> {
        let digits: String = self.chars.iter().skip(self.pos).take(len).collect();
        let code = u32::from_str_radix(&digits, 16)
            .ok()
            .filter(|_| digits.len() == len)
            .and_then(char::from_u32)
            .ok_or_else(|| ScriptError::syntax(self.line, "invalid escape sequence"))?;
        self.pos += len;
        Ok(code)
    }

    fn operator(&mut self) -> ScriptResult<()> {
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, oc)| self.peek(i) == Some(oc));
            if matches {
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.pos += len;
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        Err(ScriptError::syntax(
            self.line,
            format!("invalid character '{}'", self.chars[self.pos]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            kinds("x = 1.5\n"),
            vec![
                Tok::Name("x".into()),
                Tok::Op("="),
                Tok::Float(1.5),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(toks.contains(&Tok::Indent));
        assert!(toks.contains(&Tok::Dedent));
        let dedent = toks.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert_eq!(toks[dedent + 1], Tok::Name("z".into()));
    }

    #[test]
    fn test_brackets_join_lines() {
        let toks = kinds("x = [1,\n     2]\n");
        let newlines = toks.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!toks.contains(&Tok::Indent));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let toks = kinds("# header\n\nx = 1  # trailing\n\n    # indented comment\ny = 2\n");
        assert!(!toks.contains(&Tok::Indent));
        assert_eq!(toks.iter().filter(|t| **t == Tok::Newline).count(), 2);
    }

    #[test]
    fn test_strings_and_fstrings() {
        assert_eq!(kinds("'a\\tb'")[0], Tok::Str("a\tb".into()));
        assert_eq!(kinds("f\"{x:.2f}\"")[0], Tok::FStr("{x:.2f}".into()));
        assert_eq!(kinds("r'\\d+'")[0], Tok::Str("\\d+".into()));
        assert_eq!(kinds("'''a\nb'''")[0], Tok::Str("a\nb".into()));
    }

    #[test]
    fn test_attribute_on_int_is_not_float() {
        let toks = kinds("1..real");
        assert_eq!(toks[0], Tok::Int(1));
    }

    #[test]
    fn test_line_numbers() {
        let tokens = tokenize("a = 1\nb = (\n2)\nc = 3\n").unwrap();
        let c = tokens
            .iter()
            .find(|t| t.tok == Tok::Name("c".into()))
            .unwrap();
        assert_eq!(c.line, 4);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("x = 'abc\n").unwrap_err();
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_bad_dedent() {
        assert!(tokenize("if x:\n    a = 1\n  b = 2\n").is_err());
    }
}
