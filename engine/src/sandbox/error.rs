//! Errors raised by analysis scripts

use std::fmt;

/// Python-style error class names, shown to the code generator on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Name,
    Type,
    Value,
    Key,
    Index,
    Attribute,
    ZeroDivision,
    Import,
    Recursion,
    Runtime,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Name => "NameError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Recursion => "RecursionError",
            ErrorKind::Runtime => "RuntimeError",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "SyntaxError" => ErrorKind::Syntax,
            "NameError" => ErrorKind::Name,
            "TypeError" => ErrorKind::Type,
            "ValueError" => ErrorKind::Value,
            "KeyError" => ErrorKind::Key,
            "IndexError" => ErrorKind::Index,
            "AttributeError" => ErrorKind::Attribute,
            "ZeroDivisionError" => ErrorKind::ZeroDivision,
            "ImportError" => ErrorKind::Import,
            "RecursionError" => ErrorKind::Recursion,
            "RuntimeError" | "Exception" => ErrorKind::Runtime,
            _ => return None,
        })
    }
}

/// An error raised while lexing, parsing or running a script.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: Option<usize>,
}

pub type ScriptResult<T> = Result<T, ScriptError>;

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Syntax,
            message: message.into(),
            line: Some(line),
        }
    }

    pub fn name(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Name, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Attribute, message)
    }

    pub fn zero_division() -> Self {
        Self::new(ErrorKind::ZeroDivision, "division by zero")
    }

    /// Attach a line number unless one is already set
    pub fn at_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {}): {}", self.kind.as_str(), line, self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_line() {
        let err = ScriptError::key("'Revenue'").at_line(4).at_line(9);
        assert_eq!(err.to_string(), "KeyError (line 4): 'Revenue'");
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [ErrorKind::Key, ErrorKind::Value, ErrorKind::ZeroDivision] {
            assert_eq!(ErrorKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_name("Exception"), Some(ErrorKind::Runtime));
    }
}
