//! Recursive-descent parser producing the script AST

use super::error::{ScriptError, ScriptResult};
use super::lexer::{tokenize, Tok, Token};
use std::rc::Rc;

/// Deepest allowed nesting of expressions and blocks
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FPart {
    Lit(String),
    Expr(Expr, Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub target: Target,
    pub iter: Expr,
    pub conditions: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<Param>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    NoneLit,
    FString(Vec<FPart>),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        other: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Slice(Option<Box<Expr>>, Option<Box<Expr>>, Option<Box<Expr>>),
    ListComp(Box<Expr>, Vec<Comprehension>),
    DictComp(Box<Expr>, Box<Expr>, Vec<Comprehension>),
    Lambda(Rc<Lambda>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Tuple(Vec<Target>),
    Index(Expr, Expr),
    Attr(Expr, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    Assign(Vec<Target>, Expr),
    AugAssign(Target, BinOp, Expr),
    If(Vec<(Expr, Vec<Stmt>)>, Option<Vec<Stmt>>),
    While(Expr, Vec<Stmt>),
    For(Target, Expr, Vec<Stmt>),
    Try {
        body: Vec<Stmt>,
        handlers: Vec<Handler>,
        finally: Option<Vec<Stmt>>,
    },
    Raise(Option<Expr>),
    Def(Rc<FunctionDef>),
    Return(Option<Expr>),
    Del(Vec<Target>),
    Pass,
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    pub kinds: Vec<String>,
    pub alias: Option<String>,
    pub body: Vec<Stmt>,
}

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "break", "class", "continue", "def", "del", "elif", "else", "except",
    "finally", "for", "from", "global", "if", "import", "in", "is", "lambda", "nonlocal", "not",
    "or", "pass", "raise", "return", "try", "while", "with", "yield", "True", "False", "None",
];

/// Modules whose import is accepted as a no-op
const PRELOADED_MODULES: &[&str] = &["pandas"];

/// Parse a complete script into statements
pub fn parse(src: &str) -> ScriptResult<Vec<Stmt>> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.module()
}

/// Parse a single expression (used for f-string fields)
pub fn parse_expression(src: &str, line: usize) -> ScriptResult<Expr> {
    let tokens = tokenize(src).map_err(|e| ScriptError::syntax(line, e.message))?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr_list()?;
    parser.skip_newlines();
    if !parser.at(&Tok::Eof) {
        return Err(ScriptError::syntax(line, "invalid f-string expression"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ScriptResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> ScriptResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", kw)))
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        let message = message.into();
        let found = match self.peek() {
            Tok::Name(n) => format!("'{}'", n),
            Tok::Op(o) => format!("'{}'", o),
            Tok::Int(i) => i.to_string(),
            Tok::Float(f) => f.to_string(),
            Tok::Str(_) | Tok::FStr(_) => "string".to_string(),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        };
        ScriptError::syntax(self.line(), format!("{}, found {}", message, found))
    }

    fn identifier(&mut self) -> ScriptResult<String> {
        match self.peek().clone() {
            Tok::Name(n) if !KEYWORDS.contains(&n.as_str()) => {
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn skip_newlines(&mut self) {
        while self.at(&Tok::Newline) {
            self.pos += 1;
        }
    }

    fn enter(&mut self) -> ScriptResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ScriptError::syntax(self.line(), "too many nested levels"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // ---- statements ----

    fn module(&mut self) -> ScriptResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.at(&Tok::Eof) {
                break;
            }
            if self.at(&Tok::Indent) {
                return Err(ScriptError::syntax(self.line(), "unexpected indent"));
            }
            stmts.extend(self.statement()?);
        }
        Ok(stmts)
    }

    fn block(&mut self) -> ScriptResult<Vec<Stmt>> {
        self.expect_op(":")?;
        self.enter()?;
        let body = if self.at(&Tok::Newline) {
            self.skip_newlines();
            if !self.at(&Tok::Indent) {
                return Err(ScriptError::syntax(self.line(), "expected an indented block"));
            }
            self.pos += 1;
            let mut stmts = Vec::new();
            loop {
                self.skip_newlines();
                if self.at(&Tok::Dedent) {
                    self.pos += 1;
                    break;
                }
                if self.at(&Tok::Eof) {
                    break;
                }
                stmts.extend(self.statement()?);
            }
            stmts
        } else {
            self.simple_statements()?
        };
        self.leave();
        Ok(body)
    }

    fn statement(&mut self) -> ScriptResult<Vec<Stmt>> {
        let line = self.line();
        let compound = match self.peek() {
            Tok::Name(n) => matches!(
                n.as_str(),
                "if" | "while" | "for" | "try" | "def" | "class" | "with"
            ),
            _ => false,
        };
        if !compound {
            return self.simple_statements();
        }

        let kind = if self.eat_keyword("if") {
            self.if_statement()?
        } else if self.eat_keyword("while") {
            let cond = self.expr()?;
            let body = self.block()?;
            StmtKind::While(cond, body)
        } else if self.eat_keyword("for") {
            let target = self.target_list()?;
            self.expect_keyword("in")?;
            let iter = self.expr_list()?;
            let body = self.block()?;
            if self.at_keyword("else") {
                return Err(self.error("for/else is not supported"));
            }
            StmtKind::For(target, iter, body)
        } else if self.eat_keyword("try") {
            self.try_statement()?
        } else if self.eat_keyword("def") {
            let name = self.identifier()?;
            self.expect_op("(")?;
            let params = self.params(")")?;
            self.expect_op(")")?;
            if self.eat_op("->") {
                self.expr()?;
            }
            let body = self.block()?;
            StmtKind::Def(Rc::new(FunctionDef { name, params, body }))
        } else {
            return Err(self.error("class and with statements are not supported"));
        };

        Ok(vec![Stmt { kind, line }])
    }

    fn if_statement(&mut self) -> ScriptResult<StmtKind> {
        let mut branches = Vec::new();
        let cond = self.expr()?;
        let body = self.block()?;
        branches.push((cond, body));
        let mut other = None;
        loop {
            self.skip_newlines_before_keyword(&["elif", "else"]);
            if self.eat_keyword("elif") {
                let cond = self.expr()?;
                let body = self.block()?;
                branches.push((cond, body));
            } else if self.eat_keyword("else") {
                other = Some(self.block()?);
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If(branches, other))
    }

    fn try_statement(&mut self) -> ScriptResult<StmtKind> {
        let body = self.block()?;
        let mut handlers = Vec::new();
        let mut finally = None;
        loop {
            self.skip_newlines_before_keyword(&["except", "finally", "else"]);
            if self.eat_keyword("except") {
                let mut kinds = Vec::new();
                let mut alias = None;
                if !self.at_op(":") {
                    if self.eat_op("(") {
                        loop {
                            kinds.push(self.dotted_name()?);
                            if !self.eat_op(",") || self.at_op(")") {
                                break;
                            }
                        }
                        self.expect_op(")")?;
                    } else {
                        kinds.push(self.dotted_name()?);
                    }
                    if self.eat_keyword("as") {
                        alias = Some(self.identifier()?);
                    }
                }
                let body = self.block()?;
                handlers.push(Handler { kinds, alias, body });
            } else if self.eat_keyword("finally") {
                finally = Some(self.block()?);
                break;
            } else if self.at_keyword("else") {
                return Err(self.error("try/else is not supported"));
            } else {
                break;
            }
        }
        if handlers.is_empty() && finally.is_none() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            finally,
        })
    }

    fn dotted_name(&mut self) -> ScriptResult<String> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name = self.identifier()?;
        }
        Ok(name)
    }

    /// After a dedent the continuation keyword follows directly, so only
    /// newlines need skipping here.
    fn skip_newlines_before_keyword(&mut self, keywords: &[&str]) {
        let mut offset = 0;
        while self.peek_at(offset) == &Tok::Newline {
            offset += 1;
        }
        if let Tok::Name(n) = self.peek_at(offset) {
            if keywords.contains(&n.as_str()) {
                self.pos += offset;
            }
        }
    }

    fn simple_statements(&mut self) -> ScriptResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            let line = self.line();
            if let Some(kind) = self.simple_statement()? {
                stmts.push(Stmt { kind, line });
            }
            if self.eat_op(";") {
                if self.at(&Tok::Newline) || self.at(&Tok::Eof) {
                    break;
                }
                continue;
            }
            break;
        }
        if !self.at(&Tok::Eof) && !self.at(&Tok::Dedent) {
            if !self.at(&Tok::Newline) {
                return Err(self.error("expected end of statement"));
            }
            self.pos += 1;
        }
        Ok(stmts)
    }

    fn simple_statement(&mut self) -> ScriptResult<Option<StmtKind>> {
        if let Tok::Name(n) = self.peek().clone() {
            match n.as_str() {
                "pass" => {
                    self.pos += 1;
                    return Ok(Some(StmtKind::Pass));
                }
                "break" => {
                    self.pos += 1;
                    return Ok(Some(StmtKind::Break));
                }
                "continue" => {
                    self.pos += 1;
                    return Ok(Some(StmtKind::Continue));
                }
                "return" => {
                    self.pos += 1;
                    let value = if self.at_statement_end() {
                        None
                    } else {
                        Some(self.expr_list()?)
                    };
                    return Ok(Some(StmtKind::Return(value)));
                }
                "raise" => {
                    self.pos += 1;
                    let value = if self.at_statement_end() {
                        None
                    } else {
                        Some(self.expr()?)
                    };
                    if self.eat_keyword("from") {
                        self.expr()?;
                    }
                    return Ok(Some(StmtKind::Raise(value)));
                }
                "del" => {
                    self.pos += 1;
                    let mut targets = vec![self.target()?];
                    while self.eat_op(",") {
                        targets.push(self.target()?);
                    }
                    return Ok(Some(StmtKind::Del(targets)));
                }
                "import" => {
                    self.pos += 1;
                    self.import_names()?;
                    return Ok(None);
                }
                "from" => {
                    return Err(ScriptError::syntax(
                        self.line(),
                        "module loading is not available; use the preloaded `pd` and datasets",
                    ));
                }
                "global" | "nonlocal" | "assert" | "yield" | "class" | "with" => {
                    return Err(self.error(format!("'{}' is not supported", n)));
                }
                _ => {}
            }
        }

        let first = self.expr_list()?;

        if let Some(op) = self.augmented_op() {
            let target = to_target(first).map_err(|m| ScriptError::syntax(self.line(), m))?;
            if matches!(target, Target::Tuple(_)) {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.expr_list()?;
            return Ok(Some(StmtKind::AugAssign(target, op, value)));
        }

        if self.at_op("=") {
            let mut targets = vec![first];
            let mut value = None;
            while self.eat_op("=") {
                let next = self.expr_list()?;
                if self.at_op("=") {
                    targets.push(next);
                } else {
                    value = Some(next);
                }
            }
            let value = value.ok_or_else(|| self.error("expected value after '='"))?;
            let targets = targets
                .into_iter()
                .map(to_target)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|m| ScriptError::syntax(self.line(), m))?;
            return Ok(Some(StmtKind::Assign(targets, value)));
        }

        Ok(Some(StmtKind::Expr(first)))
    }

    fn import_names(&mut self) -> ScriptResult<()> {
        loop {
            let line = self.line();
            let module = self.dotted_module()?;
            if !PRELOADED_MODULES.contains(&module.as_str()) {
                return Err(ScriptError::syntax(
                    line,
                    format!(
                        "module loading is not available (import {}); use the preloaded `pd` and datasets",
                        module
                    ),
                ));
            }
            if self.eat_keyword("as") {
                let alias = self.identifier()?;
                if alias != "pd" {
                    return Err(ScriptError::syntax(
                        line,
                        "pandas is only available as `pd`",
                    ));
                }
            }
            if !self.eat_op(",") {
                return Ok(());
            }
        }
    }

    fn dotted_module(&mut self) -> ScriptResult<String> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent) || self.at_op(";")
    }

    fn augmented_op(&mut self) -> Option<BinOp> {
        let op = match self.peek() {
            Tok::Op("+=") => BinOp::Add,
            Tok::Op("-=") => BinOp::Sub,
            Tok::Op("*=") => BinOp::Mul,
            Tok::Op("/=") => BinOp::Div,
            Tok::Op("//=") => BinOp::FloorDiv,
            Tok::Op("%=") => BinOp::Mod,
            Tok::Op("**=") => BinOp::Pow,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn target(&mut self) -> ScriptResult<Target> {
        let expr = self.postfix()?;
        to_target(expr).map_err(|m| ScriptError::syntax(self.line(), m))
    }

    /// Loop targets: `a`, `a, b`, `(a, b)`, `i, (k, v)`
    fn target_list(&mut self) -> ScriptResult<Target> {
        let mut items = vec![self.target()?];
        let mut trailing = false;
        while self.eat_op(",") {
            if self.at_keyword("in") || self.at_op("=") {
                trailing = true;
                break;
            }
            items.push(self.target()?);
        }
        if items.len() == 1 && !trailing {
            Ok(items.remove(0))
        } else {
            Ok(Target::Tuple(items))
        }
    }

    fn params(&mut self, close: &str) -> ScriptResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.at_op(close) {
            let name = self.identifier()?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error(format!("duplicate argument '{}'", name)));
            }
            if close == ")" && self.eat_op(":") {
                self.expr()?;
            }
            let default = if self.eat_op("=") {
                Some(self.expr()?)
            } else {
                None
            };
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    // ---- expressions ----

    /// Comma-separated expressions; more than one forms a tuple
    fn expr_list(&mut self) -> ScriptResult<Expr> {
        let first = self.expr()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expr_end() {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn at_expr_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent)
            || matches!(self.peek(), Tok::Op(o) if matches!(*o, "=" | ")" | "]" | "}" | ":" | ";"))
            || matches!(self.peek(), Tok::Op(o) if o.ends_with('=') && o.len() > 1 && *o != "==")
    }

    fn expr(&mut self) -> ScriptResult<Expr> {
        self.enter()?;
        let result = self.expr_inner();
        self.leave();
        result
    }

    fn expr_inner(&mut self) -> ScriptResult<Expr> {
        if self.eat_keyword("lambda") {
            let params = self.params(":")?;
            self.expect_op(":")?;
            let body = self.expr()?;
            return Ok(Expr::Lambda(Rc::new(Lambda { params, body })));
        }

        let value = self.or_expr()?;
        if self.eat_keyword("if") {
            let cond = self.or_expr()?;
            self.expect_keyword("else")?;
            let other = self.expr()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(value),
                other: Box::new(other),
            });
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> ScriptResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ScriptResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> ScriptResult<Expr> {
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.not_expr();
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ScriptResult<Expr> {
        let left = self.bit_or()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::Ne,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::Le,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::Ge,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Tok::Name(m) if m == "not") {
                        self.pos += 1;
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                Tok::Name(n) if n == "not" => {
                    if matches!(self.peek_at(1), Tok::Name(m) if m == "in") {
                        self.pos += 1;
                        CmpOp::NotIn
                    } else {
                        break;
                    }
                }
                _ => break,
            };
            self.pos += 1;
            let right = self.bit_or()?;
            ops.push((op, right));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), ops))
        }
    }

    fn bit_or(&mut self) -> ScriptResult<Expr> {
        let mut left = self.bit_xor()?;
        while self.eat_op("|") {
            let right = self.bit_xor()?;
            left = Expr::Binary(Box::new(left), BinOp::BitOr, Box::new(right));
        }
        Ok(left)
    }

    fn bit_xor(&mut self) -> ScriptResult<Expr> {
        let mut left = self.bit_and()?;
        while self.eat_op("^") {
            let right = self.bit_and()?;
            left = Expr::Binary(Box::new(left), BinOp::BitXor, Box::new(right));
        }
        Ok(left)
    }

    fn bit_and(&mut self) -> ScriptResult<Expr> {
        let mut left = self.arith()?;
        while self.eat_op("&") {
            let right = self.arith()?;
            left = Expr::Binary(Box::new(left), BinOp::BitAnd, Box::new(right));
        }
        Ok(left)
    }

    fn arith(&mut self) -> ScriptResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> ScriptResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> ScriptResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => UnaryOp::Invert,
            _ => return self.power(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.unary();
        self.leave();
        let operand = operand?;
        // Fold negative literals so `-1` stays a literal
        Ok(match (op, operand) {
            (UnaryOp::Neg, Expr::Int(i)) => Expr::Int(-i),
            (UnaryOp::Neg, Expr::Float(f)) => Expr::Float(-f),
            (op, operand) => Expr::Unary(op, Box::new(operand)),
        })
    }

    fn power(&mut self) -> ScriptResult<Expr> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            self.enter()?;
            let exponent = self.unary();
            self.leave();
            return Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent?)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> ScriptResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op(".") {
                let name = match self.advance() {
                    Tok::Name(n) => n,
                    _ => return Err(self.error("expected attribute name")),
                };
                expr = Expr::Attr(Box::new(expr), name);
            } else if self.eat_op("(") {
                expr = self.call(expr)?;
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call(&mut self, func: Expr) -> ScriptResult<Expr> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.error("argument unpacking is not supported"));
            }
            let is_keyword = matches!(self.peek(), Tok::Name(_))
                && matches!(self.peek_at(1), Tok::Op("="));
            if is_keyword {
                let name = self.identifier()?;
                self.expect_op("=")?;
                kwargs.push((name, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let value = self.expr()?;
                if self.at_keyword("for") {
                    // Generator argument: sum(x for x in xs)
                    let clauses = self.comprehension_clauses()?;
                    args.push(Expr::ListComp(Box::new(value), clauses));
                } else {
                    args.push(value);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(Expr::Call {
            func: Box::new(func),
            args,
            kwargs,
        })
    }

    fn subscript(&mut self) -> ScriptResult<Expr> {
        let first = self.slice_item()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.slice_item()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn slice_item(&mut self) -> ScriptResult<Expr> {
        let start = if self.at_op(":") {
            None
        } else {
            let value = self.expr()?;
            if !self.at_op(":") {
                return Ok(value);
            }
            Some(Box::new(value))
        };
        self.expect_op(":")?;
        let stop = if self.at_op(":") || self.at_op("]") || self.at_op(",") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        let step = if self.eat_op(":") && !self.at_op("]") && !self.at_op(",") {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        Ok(Expr::Slice(start, stop, step))
    }

    fn comprehension_clauses(&mut self) -> ScriptResult<Vec<Comprehension>> {
        let mut clauses = Vec::new();
        while self.eat_keyword("for") {
            let target = self.target_list()?;
            self.expect_keyword("in")?;
            let iter = self.or_expr()?;
            let mut conditions = Vec::new();
            while self.eat_keyword("if") {
                conditions.push(self.or_expr()?);
            }
            clauses.push(Comprehension {
                target,
                iter,
                conditions,
            });
        }
        Ok(clauses)
    }

    fn atom(&mut self) -> ScriptResult<Expr> {
        let line = self.line();
        match self.advance() {
            Tok::Int(i) => Ok(Expr::Int(i)),
            Tok::Float(f) => Ok(Expr::Float(f)),
            Tok::Str(s) => self.string_concat(vec![FPart::Lit(s)], line),
            Tok::FStr(s) => {
                let parts = parse_fstring(&s, line)?;
                self.string_concat(parts, line)
            }
            Tok::Name(n) => match n.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::NoneLit),
                _ if KEYWORDS.contains(&n.as_str()) => {
                    self.pos -= 1;
                    Err(self.error("invalid syntax"))
                }
                _ => Ok(Expr::Name(n)),
            },
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expr()?;
                if self.at_keyword("for") {
                    let clauses = self.comprehension_clauses()?;
                    self.expect_op(")")?;
                    return Ok(Expr::ListComp(Box::new(first), clauses));
                }
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op(")") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expr()?;
                if self.at_keyword("for") {
                    let clauses = self.comprehension_clauses()?;
                    self.expect_op("]")?;
                    return Ok(Expr::ListComp(Box::new(first), clauses));
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op("]") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                if self.eat_op("}") {
                    return Ok(Expr::Dict(Vec::new()));
                }
                let key = self.expr()?;
                if !self.at_op(":") {
                    return Err(self.error("set literals are not supported"));
                }
                self.expect_op(":")?;
                let value = self.expr()?;
                if self.at_keyword("for") {
                    let clauses = self.comprehension_clauses()?;
                    self.expect_op("}")?;
                    return Ok(Expr::DictComp(Box::new(key), Box::new(value), clauses));
                }
                let mut entries = vec![(key, value)];
                while self.eat_op(",") {
                    if self.at_op("}") {
                        break;
                    }
                    let key = self.expr()?;
                    self.expect_op(":")?;
                    entries.push((key, self.expr()?));
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(entries))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("invalid syntax"))
            }
        }
    }

    /// Adjacent string literals concatenate: `"a" "b"`, `"x" f"{y}"`
    fn string_concat(&mut self, mut parts: Vec<FPart>, line: usize) -> ScriptResult<Expr> {
        loop {
            match self.peek().clone() {
                Tok::Str(s) => {
                    self.pos += 1;
                    parts.push(FPart::Lit(s));
                }
                Tok::FStr(s) => {
                    self.pos += 1;
                    parts.extend(parse_fstring(&s, line)?);
                }
                _ => break,
            }
        }
        if parts.iter().all(|p| matches!(p, FPart::Lit(_))) {
            let text = parts
                .into_iter()
                .map(|p| match p {
                    FPart::Lit(s) => s,
                    FPart::Expr(..) => String::new(),
                })
                .collect();
            return Ok(Expr::Str(text));
        }
        Ok(Expr::FString(parts))
    }
}

fn to_target(expr: Expr) -> Result<Target, String> {
    match expr {
        Expr::Name(n) => Ok(Target::Name(n)),
        Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
            items.into_iter().map(to_target).collect::<Result<_, _>>()?,
        )),
        Expr::Index(base, index) => Ok(Target::Index(*base, *index)),
        Expr::Attr(base, name) => Ok(Target::Attr(*base, name)),
        _ => Err("cannot assign to expression".to_string()),
    }
}

/// Split an f-string body into literal and expression parts.
fn parse_fstring(body: &str, line: usize) -> ScriptResult<Vec<FPart>> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '{' {
            if chars.get(i + 1) == Some(&'{') {
                literal.push('{');
                i += 2;
                continue;
            }
            if !literal.is_empty() {
                parts.push(FPart::Lit(std::mem::take(&mut literal)));
            }

            // Find the matching close brace, honouring nested brackets and quotes
            let mut depth = 0usize;
            let mut quote: Option<char> = None;
            let mut j = i + 1;
            let mut spec_at = None;
            while j < chars.len() {
                let ch = chars[j];
                match quote {
                    Some(q) if ch == q => quote = None,
                    Some(_) => {}
                    None => match ch {
                        '\'' | '"' => quote = Some(ch),
                        '(' | '[' | '{' => depth += 1,
                        ')' | ']' => depth = depth.saturating_sub(1),
                        '}' if depth > 0 => depth -= 1,
                        '}' => break,
                        ':' if depth == 0 && spec_at.is_none() => spec_at = Some(j),
                        '!' if depth == 0
                            && spec_at.is_none()
                            && chars.get(j + 1) != Some(&'=') =>
                        {
                            spec_at = Some(j)
                        }
                        _ => {}
                    },
                }
                j += 1;
            }
            if j >= chars.len() {
                return Err(ScriptError::syntax(line, "f-string: expecting '}'"));
            }

            let expr_end = spec_at.unwrap_or(j);
            let expr_src: String = chars[i + 1..expr_end].iter().collect();
            let mut spec = spec_at.map(|s| chars[s + 1..j].iter().collect::<String>());
            // Conversions like !r / !s are accepted and ignored
            if let Some(s) = spec_at {
                if chars[s] == '!' {
                    spec = spec
                        .and_then(|rest| rest.split_once(':').map(|(_, f)| f.to_string()));
                }
            }
            if expr_src.trim().is_empty() {
                return Err(ScriptError::syntax(line, "f-string: empty expression not allowed"));
            }
            let expr = parse_expression(expr_src.trim(), line)?;
            parts.push(FPart::Expr(expr, spec));
            i = j + 1;
        } else if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
            } else {
                return Err(ScriptError::syntax(line, "f-string: single '}' is not allowed"));
            }
        } else {
            literal.push(c);
            i += 1;
        }
    }
    if !literal.is_empty() {
        parts.push(FPart::Lit(literal));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_groupby_chain() {
        let stmts =
            parse("result = df.groupby('Group')['X'].mean().reset_index()\n").unwrap();
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StmtKind::Assign(targets, Expr::Call { func, .. }) => {
                assert_eq!(targets[0], Target::Name("result".into()));
                assert!(matches!(func.as_ref(), Expr::Attr(_, name) if name == "reset_index"));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_precedence_of_mask_operators() {
        let stmts = parse("m = (df['a'] > 1) & (df['b'] < 2)\n").unwrap();
        match &stmts[0].kind {
            StmtKind::Assign(_, Expr::Binary(_, op, _)) => assert_eq!(*op, BinOp::BitAnd),
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_pandas_import_is_noop() {
        let stmts = parse("import pandas as pd\nresult = 1\n").unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn test_other_imports_rejected() {
        let err = parse("import os\n").unwrap_err();
        assert!(err.message.contains("module loading is not available"));
        assert!(parse("from pathlib import Path\n").is_err());
    }

    #[test]
    fn test_if_elif_else() {
        let src = "if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n";
        let stmts = parse(src).unwrap();
        match &stmts[0].kind {
            StmtKind::If(branches, other) => {
                assert_eq!(branches.len(), 2);
                assert!(other.is_some());
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_for_with_tuple_target() {
        let stmts = parse("for k, g in df.groupby('a'):\n    pass\n").unwrap();
        match &stmts[0].kind {
            StmtKind::For(Target::Tuple(items), _, body) => {
                assert_eq!(items.len(), 2);
                assert_eq!(body.len(), 1);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_fstring_parts() {
        let stmts = parse("s = f'Total: {total:,.2f} for {name!r}'\n").unwrap();
        match &stmts[0].kind {
            StmtKind::Assign(_, Expr::FString(parts)) => {
                assert_eq!(parts.len(), 4);
                assert!(
                    matches!(&parts[1], FPart::Expr(Expr::Name(n), Some(spec)) if n == "total" && spec == ",.2f")
                );
                assert!(matches!(&parts[3], FPart::Expr(Expr::Name(n), None) if n == "name"));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_comprehensions_and_lambda() {
        parse("xs = [x * 2 for x in range(10) if x % 2 == 0]\n").unwrap();
        parse("d = {k: v for k, v in pairs}\n").unwrap();
        parse("total = sum(x for x in xs)\n").unwrap();
        parse("ys = sorted(xs, key=lambda p: p[1], reverse=True)\n").unwrap();
    }

    #[test]
    fn test_def_and_try() {
        let src = "def f(a, b=2):\n    return a + b\ntry:\n    x = f(1)\nexcept KeyError as e:\n    x = 0\n";
        let stmts = parse(src).unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_slices() {
        let stmts = parse("a = xs[1:3]\nb = df.iloc[:, 0]\n").unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_chained_assignment_and_unpacking() {
        let stmts = parse("a = b = 0\nx, y = 1, 2\n").unwrap();
        match &stmts[0].kind {
            StmtKind::Assign(targets, _) => assert_eq!(targets.len(), 2),
            other => panic!("unexpected statement: {:?}", other),
        }
        assert!(matches!(&stmts[1].kind, StmtKind::Assign(t, Expr::Tuple(_)) if matches!(t[0], Target::Tuple(_))));
    }

    #[test]
    fn test_syntax_error_has_line() {
        let err = parse("x = 1\ny = (2 +\n").unwrap_err();
        assert!(err.line.is_some());
    }

    #[test]
    fn test_nesting_limit() {
        let src = format!("x = {}1{}\n", "(".repeat(200), ")".repeat(200));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nested"));
    }
}
