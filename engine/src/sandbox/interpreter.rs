//! Tree-walking interpreter for analysis scripts.

use super::builtins;
use super::error::{ErrorKind, ScriptError, ScriptResult};
use super::frame::DataFrame;
use super::methods;
use super::ops;
use super::parser::{self, Expr, FPart, Stmt, StmtKind, Target};
use super::value::{format_value, Function, FunctionBody, Key, Value};
use indexmap::IndexMap;
use sdk::{ResultValue, Table, TabularResult};
use std::collections::HashMap;
use std::rc::Rc;

/// Binding the script must assign its answer to
pub const RESULT_BINDING: &str = "result";

const MAX_CALL_DEPTH: usize = 200;
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Statements one script may execute. The wall-clock deadline usually
/// fires first; this bounds a worker that outlives its parent.
pub const STEP_LIMIT: u64 = 200_000_000;

/// Host facilities scripts commonly reach for. None of them is bound;
/// naming one fails with an explicit message instead of a bare NameError.
const STRIPPED_GLOBALS: &[&str] = &[
    "os", "sys", "io", "subprocess", "shutil", "socket", "open", "input", "eval", "exec",
    "compile", "__import__", "__builtins__", "globals", "locals", "vars", "getattr", "setattr",
    "delattr", "exit", "quit", "breakpoint",
];
/// Native stack for the script thread
const SCRIPT_STACK_BYTES: usize = 256 * 1024 * 1024;

/// Positional and keyword arguments of a call
#[derive(Debug, Default, Clone)]
pub struct Args {
    pub pos: Vec<Value>,
    pub kw: IndexMap<String, Value>,
}

impl Args {
    pub fn positional(pos: Vec<Value>) -> Self {
        Self {
            pos,
            kw: IndexMap::new(),
        }
    }

    /// Argument by position, falling back to its keyword name
    pub fn get(&self, pos: usize, name: &str) -> Option<&Value> {
        self.pos.get(pos).or_else(|| self.kw.get(name))
    }

    pub fn kw(&self, name: &str) -> Option<&Value> {
        self.kw.get(name)
    }

    pub fn required(&self, pos: usize, name: &str, func: &str) -> ScriptResult<&Value> {
        self.get(pos, name).ok_or_else(|| {
            ScriptError::type_error(format!(
                "{}() missing required argument: '{}'",
                func, name
            ))
        })
    }

    pub fn flag(&self, pos: usize, name: &str, default: bool) -> ScriptResult<bool> {
        match self.get(pos, name) {
            Some(v) => v.truthy(),
            None => Ok(default),
        }
    }

    pub fn int(&self, pos: usize, name: &str, default: i64) -> ScriptResult<i64> {
        match self.get(pos, name) {
            Some(Value::None) | None => Ok(default),
            Some(v) => v.as_int(),
        }
    }

    pub fn string(&self, pos: usize, name: &str) -> ScriptResult<Option<String>> {
        match self.get(pos, name) {
            Some(Value::None) | None => Ok(None),
            Some(v) => Ok(Some(v.as_str()?.to_string())),
        }
    }

    /// A string or list of strings, as a list
    pub fn names(&self, pos: usize, name: &str) -> ScriptResult<Option<Vec<String>>> {
        match self.get(pos, name) {
            Some(Value::None) | None => Ok(None),
            Some(v) => string_list(v).map(Some),
        }
    }
}

/// Interpret `"a"` or `["a", "b"]` as column names
pub fn string_list(value: &Value) -> ScriptResult<Vec<String>> {
    match value {
        Value::Str(s) => Ok(vec![s.clone()]),
        Value::List(_) | Value::Tuple(_) => value
            .iter_values()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        other => Err(ScriptError::type_error(format!(
            "expected a column name or list of names, got {}",
            other.type_name()
        ))),
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Scope {
    vars: HashMap<String, Value>,
    /// Comprehension scopes see through to the enclosing scope
    transparent: bool,
}

/// Output of a completed script
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub value: ResultValue,
    pub stdout: String,
}

/// A script that failed, with whatever it printed before failing
#[derive(Debug, Clone)]
pub struct ScriptFailure {
    pub error: ScriptError,
    pub stdout: String,
    /// The script ran but left `result` unbound or `None`
    pub missing_result: bool,
}

pub struct Interpreter {
    globals: HashMap<String, Value>,
    scopes: Vec<Scope>,
    output: String,
    depth: usize,
    handling: Vec<ScriptError>,
    steps: u64,
    step_limit: u64,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            globals: HashMap::new(),
            scopes: Vec::new(),
            output: String::new(),
            depth: 0,
            handling: Vec::new(),
            steps: 0,
            step_limit: STEP_LIMIT,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Bind the datasets: `datasets[name]`, bare names that are valid
    /// identifiers, and `df` when there is exactly one.
    pub fn bind_datasets(&mut self, datasets: &IndexMap<String, Table>) {
        let mut handles = IndexMap::new();
        for (name, table) in datasets {
            let frame = Value::frame(DataFrame::from_table(table));
            if is_identifier(name) && builtins::lookup(name).is_none() {
                self.globals.insert(name.clone(), frame.clone());
            }
            handles.insert(Key::Str(name.clone()), frame);
        }
        if handles.len() == 1 {
            if let Some(frame) = handles.values().next() {
                self.globals.insert("df".to_string(), frame.clone());
            }
        }
        self.globals
            .insert("datasets".to_string(), Value::dict(handles));
    }

    pub fn run(&mut self, program: &[Stmt]) -> ScriptResult<()> {
        match self.exec_block(program)? {
            Flow::Normal => Ok(()),
            Flow::Return(_) => Err(ScriptError::syntax(0, "'return' outside function")),
            Flow::Break | Flow::Continue => {
                Err(ScriptError::syntax(0, "'break' outside loop"))
            }
        }
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn print(&mut self, text: &str) {
        if self.output.len() >= MAX_OUTPUT_BYTES {
            return;
        }
        self.output.push_str(text);
        self.output.push('\n');
        if self.output.len() > MAX_OUTPUT_BYTES {
            let mut cut = MAX_OUTPUT_BYTES;
            while !self.output.is_char_boundary(cut) {
                cut -= 1;
            }
            self.output.truncate(cut);
            self.output.push_str("\n... (output truncated)\n");
        }
    }

    fn exec_block(&mut self, body: &[Stmt]) -> ScriptResult<Flow> {
        for stmt in body {
            let flow = self
                .exec_stmt(stmt)
                .map_err(|e| e.at_line(stmt.line))?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> ScriptResult<Flow> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(ScriptError::new(
                ErrorKind::Runtime,
                format!("step limit of {} statements exceeded", self.step_limit),
            ));
        }
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign(targets, expr) => {
                let value = self.eval(expr)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign(target, op, expr) => {
                let current = match target {
                    Target::Name(name) => self.lookup(name)?,
                    Target::Index(obj, index) => {
                        let obj = self.eval(obj)?;
                        let index = self.eval_subscript(index)?;
                        ops::get_item(&obj, &index)?
                    }
                    Target::Attr(obj, name) => {
                        let obj = self.eval(obj)?;
                        methods::get_attr(&obj, name)?
                    }
                    Target::Tuple(_) => {
                        return Err(ScriptError::syntax(
                            stmt.line,
                            "illegal expression for augmented assignment",
                        ))
                    }
                };
                let rhs = self.eval(expr)?;
                let value = ops::binary(&current, *op, &rhs)?;
                self.assign(target, value)?;
            }
            StmtKind::If(branches, otherwise) => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy()? {
                        return self.exec_block(body);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_block(body);
                }
            }
            StmtKind::While(cond, body) => {
                while self.eval(cond)?.truthy()? {
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For(target, iter, body) => {
                let items = self.eval(iter)?.iter_values()?;
                for item in items {
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::Try {
                body,
                handlers,
                finally,
            } => {
                let outcome = match self.exec_block(body) {
                    Ok(flow) => Ok(flow),
                    Err(err) if err.kind == ErrorKind::Recursion => Err(err),
                    Err(err) => {
                        let handler = handlers.iter().find(|h| {
                            h.kinds.is_empty()
                                || h.kinds.iter().any(|k| {
                                    k == "Exception"
                                        || ErrorKind::from_name(k) == Some(err.kind)
                                })
                        });
                        match handler {
                            Some(handler) => {
                                if let Some(alias) = &handler.alias {
                                    self.set_var(
                                        alias,
                                        Value::Error(err.kind, err.message.clone()),
                                    );
                                }
                                self.handling.push(err);
                                let flow = self.exec_block(&handler.body);
                                self.handling.pop();
                                flow
                            }
                            None => Err(err),
                        }
                    }
                };
                if let Some(finally) = finally {
                    let flow = self.exec_block(finally)?;
                    if !matches!(flow, Flow::Normal) {
                        return Ok(flow);
                    }
                }
                return outcome;
            }
            StmtKind::Raise(expr) => {
                return Err(match expr {
                    None => self.handling.last().cloned().unwrap_or_else(|| {
                        ScriptError::new(ErrorKind::Runtime, "No active exception to reraise")
                    }),
                    Some(expr) => match self.eval(expr)? {
                        Value::Error(kind, message) => ScriptError::new(kind, message),
                        Value::Builtin(name) => match ErrorKind::from_name(name) {
                            Some(kind) => ScriptError::new(kind, ""),
                            None => ScriptError::type_error(
                                "exceptions must derive from BaseException",
                            ),
                        },
                        _ => {
                            ScriptError::type_error("exceptions must derive from BaseException")
                        }
                    },
                });
            }
            StmtKind::Def(def) => {
                let defaults = def
                    .params
                    .iter()
                    .map(|p| p.default.as_ref().map(|d| self.eval(d)).transpose())
                    .collect::<ScriptResult<Vec<_>>>()?;
                let function = Function {
                    name: def.name.clone(),
                    body: FunctionBody::Block(Rc::clone(def)),
                    defaults,
                    captured: self.capture(),
                };
                self.set_var(&def.name, Value::Function(Rc::new(function)));
            }
            StmtKind::Return(expr) => {
                if self.depth == 0 {
                    return Err(ScriptError::syntax(stmt.line, "'return' outside function"));
                }
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    /// Visible locals, flattened for a closure
    fn capture(&self) -> HashMap<String, Value> {
        let mut captured = HashMap::new();
        for scope in self.visible_scopes().rev() {
            for (name, value) in &scope.vars {
                captured.insert(name.clone(), value.clone());
            }
        }
        captured
    }

    /// Innermost scope first, stopping after the first opaque scope
    fn visible_scopes(&self) -> impl DoubleEndedIterator<Item = &Scope> {
        let start = self
            .scopes
            .iter()
            .rposition(|s| !s.transparent)
            .unwrap_or(0);
        self.scopes[start..].iter().rev()
    }

    fn lookup(&self, name: &str) -> ScriptResult<Value> {
        for scope in self.visible_scopes() {
            if let Some(v) = scope.vars.get(name) {
                return Ok(v.clone());
            }
        }
        if let Some(v) = self.globals.get(name) {
            return Ok(v.clone());
        }
        if STRIPPED_GLOBALS.contains(&name) {
            return Err(ScriptError::name(format!(
                "'{}' is not available in analysis scripts",
                name
            )));
        }
        builtins::lookup(name)
            .ok_or_else(|| ScriptError::name(format!("name '{}' is not defined", name)))
    }

    fn set_var(&mut self, name: &str, value: Value) {
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.vars.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> ScriptResult<()> {
        match target {
            Target::Name(name) => {
                self.set_var(name, value);
                Ok(())
            }
            Target::Tuple(targets) => {
                let items = value.iter_values()?;
                if items.len() != targets.len() {
                    return Err(ScriptError::value(format!(
                        "expected {} values to unpack, got {}",
                        targets.len(),
                        items.len()
                    )));
                }
                for (t, v) in targets.iter().zip(items) {
                    self.assign(t, v)?;
                }
                Ok(())
            }
            Target::Index(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval_subscript(index)?;
                ops::set_item(&obj, &index, value)
            }
            Target::Attr(obj, name) => {
                let obj = self.eval(obj)?;
                methods::set_attr(&obj, name, value)
            }
        }
    }

    fn delete(&mut self, target: &Target) -> ScriptResult<()> {
        match target {
            Target::Name(name) => {
                let removed = match self.scopes.last_mut() {
                    Some(scope) => scope.vars.remove(name),
                    None => self.globals.remove(name),
                };
                removed
                    .map(|_| ())
                    .ok_or_else(|| ScriptError::name(format!("name '{}' is not defined", name)))
            }
            Target::Tuple(targets) => targets.iter().try_for_each(|t| self.delete(t)),
            Target::Index(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval_subscript(index)?;
                ops::del_item(&obj, &index)
            }
            Target::Attr(..) => Err(ScriptError::attribute("cannot delete attributes")),
        }
    }

    /// Evaluate a subscript, turning slice syntax into a slice value
    fn eval_subscript(&mut self, expr: &Expr) -> ScriptResult<Value> {
        match expr {
            Expr::Slice(start, stop, step) => {
                let mut bound = |e: &Option<Box<Expr>>| -> ScriptResult<Option<i64>> {
                    match e {
                        None => Ok(None),
                        Some(e) => match self.eval(e)? {
                            Value::None => Ok(None),
                            v => v.as_int().map(Some).map_err(|_| {
                                ScriptError::type_error(
                                    "slice indices must be integers or None",
                                )
                            }),
                        },
                    }
                };
                Ok(Value::Slice(bound(start)?, bound(stop)?, bound(step)?))
            }
            Expr::Tuple(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval_subscript(e))
                    .collect::<ScriptResult<Vec<_>>>()?;
                Ok(Value::tuple(values))
            }
            other => self.eval(other),
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> ScriptResult<Value> {
        match expr {
            Expr::Name(name) => self.lookup(name),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::NoneLit => Ok(Value::None),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FPart::Lit(s) => out.push_str(s),
                        FPart::Expr(e, spec) => {
                            let value = self.eval(e)?;
                            match spec.as_deref() {
                                Some("!r") => out.push_str(&value.repr()),
                                Some(spec) => out.push_str(&format_value(&value, spec)?),
                                None => out.push_str(&value.to_str()),
                            }
                        }
                    }
                }
                Ok(Value::Str(out))
            }
            Expr::List(items) => {
                let values = self.eval_all(items)?;
                Ok(Value::list(values))
            }
            Expr::Tuple(items) => {
                let values = self.eval_all(items)?;
                Ok(Value::tuple(values))
            }
            Expr::Dict(entries) => {
                let mut map = IndexMap::new();
                for (k, v) in entries {
                    let key = self.eval(k)?.to_key()?;
                    let value = self.eval(v)?;
                    map.insert(key, value);
                }
                Ok(Value::dict(map))
            }
            Expr::Binary(lhs, op, rhs) => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                ops::binary(&a, *op, &b)
            }
            Expr::Unary(op, operand) => {
                let v = self.eval(operand)?;
                ops::unary(*op, &v)
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                if rest.len() == 1 {
                    let right = self.eval(&rest[0].1)?;
                    return ops::compare(&left, rest[0].0, &right);
                }
                for (op, e) in rest {
                    let right = self.eval(e)?;
                    if !ops::compare(&left, *op, &right)?.truthy()? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(lhs, rhs) => {
                let a = self.eval(lhs)?;
                if !a.truthy()? {
                    return Ok(a);
                }
                self.eval(rhs)
            }
            Expr::Or(lhs, rhs) => {
                let a = self.eval(lhs)?;
                if a.truthy()? {
                    return Ok(a);
                }
                self.eval(rhs)
            }
            Expr::IfElse { cond, then, other } => {
                if self.eval(cond)?.truthy()? {
                    self.eval(then)
                } else {
                    self.eval(other)
                }
            }
            Expr::Call { func, args, kwargs } => {
                let callee = self.eval(func)?;
                let mut call_args = Args::positional(self.eval_all(args)?);
                for (name, e) in kwargs {
                    let v = self.eval(e)?;
                    call_args.kw.insert(name.clone(), v);
                }
                self.call(&callee, call_args)
            }
            Expr::Attr(obj, name) => {
                let obj = self.eval(obj)?;
                methods::get_attr(&obj, name)
            }
            Expr::Index(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval_subscript(index)?;
                ops::get_item(&obj, &index)
            }
            Expr::Slice(..) => self.eval_subscript(expr),
            Expr::ListComp(element, clauses) => {
                let mut out = Vec::new();
                self.push_scope(true);
                let res = self.comprehend(clauses, &mut |interp| {
                    out.push(interp.eval(element)?);
                    Ok(())
                });
                self.scopes.pop();
                res?;
                Ok(Value::list(out))
            }
            Expr::DictComp(key, value, clauses) => {
                let mut out = IndexMap::new();
                self.push_scope(true);
                let res = self.comprehend(clauses, &mut |interp| {
                    let k = interp.eval(key)?.to_key()?;
                    let v = interp.eval(value)?;
                    out.insert(k, v);
                    Ok(())
                });
                self.scopes.pop();
                res?;
                Ok(Value::dict(out))
            }
            Expr::Lambda(lambda) => {
                let defaults = lambda
                    .params
                    .iter()
                    .map(|p| p.default.as_ref().map(|d| self.eval(d)).transpose())
                    .collect::<ScriptResult<Vec<_>>>()?;
                Ok(Value::Function(Rc::new(Function {
                    name: "<lambda>".to_string(),
                    body: FunctionBody::Lambda(Rc::clone(lambda)),
                    defaults,
                    captured: self.capture(),
                })))
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> ScriptResult<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn push_scope(&mut self, transparent: bool) {
        self.scopes.push(Scope {
            vars: HashMap::new(),
            transparent,
        });
    }

    fn comprehend(
        &mut self,
        clauses: &[parser::Comprehension],
        emit: &mut dyn FnMut(&mut Self) -> ScriptResult<()>,
    ) -> ScriptResult<()> {
        let Some((clause, rest)) = clauses.split_first() else {
            return emit(self);
        };
        let items = self.eval(&clause.iter)?.iter_values()?;
        'items: for item in items {
            self.assign(&clause.target, item)?;
            for cond in &clause.conditions {
                if !self.eval(cond)?.truthy()? {
                    continue 'items;
                }
            }
            self.comprehend(rest, emit)?;
        }
        Ok(())
    }

    /// Call any callable value
    pub fn call(&mut self, callee: &Value, args: Args) -> ScriptResult<Value> {
        match callee {
            Value::Builtin(name) => builtins::call(self, name, args),
            Value::Method(recv, name) => methods::call_method(self, recv, name, args),
            Value::Function(function) => self.call_function(function, args),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(&mut self, function: &Rc<Function>, args: Args) -> ScriptResult<Value> {
        let params = match &function.body {
            FunctionBody::Block(def) => &def.params,
            FunctionBody::Lambda(lambda) => &lambda.params,
        };
        if args.pos.len() > params.len() {
            return Err(ScriptError::type_error(format!(
                "{}() takes {} positional arguments but {} were given",
                function.name,
                params.len(),
                args.pos.len()
            )));
        }
        if let Some(unknown) = args.kw.keys().find(|k| !params.iter().any(|p| &p.name == *k)) {
            return Err(ScriptError::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                function.name, unknown
            )));
        }
        let mut vars = function.captured.clone();
        for (i, param) in params.iter().enumerate() {
            let value = match args.pos.get(i).or_else(|| args.kw.get(&param.name)) {
                Some(v) => v.clone(),
                None => function
                    .defaults
                    .get(i)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| {
                        ScriptError::type_error(format!(
                            "{}() missing required argument: '{}'",
                            function.name, param.name
                        ))
                    })?,
            };
            vars.insert(param.name.clone(), value);
        }

        if self.depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::new(
                ErrorKind::Recursion,
                "maximum recursion depth exceeded",
            ));
        }
        self.depth += 1;
        self.scopes.push(Scope {
            vars,
            transparent: false,
        });
        let outcome = match &function.body {
            FunctionBody::Block(def) => self.exec_block(&def.body).map(|flow| match flow {
                Flow::Return(v) => v,
                _ => Value::None,
            }),
            FunctionBody::Lambda(lambda) => self.eval(&lambda.body),
        };
        self.scopes.pop();
        self.depth -= 1;
        outcome
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(name, "True" | "False" | "None" | "datasets" | "df" | "pd")
}

/// Convert the value bound to `result` into its serialized form
pub fn to_result_value(value: &Value) -> ScriptResult<ResultValue> {
    Ok(match value {
        Value::Frame(frame) => ResultValue::Table(TabularResult::from(&frame.borrow().to_table())),
        Value::Series(series) => ResultValue::Table(TabularResult::from(&series.to_table()?)),
        Value::GroupBy(_) => {
            return Err(ScriptError::type_error(
                "result is a grouping; apply an aggregation such as .sum() or .mean()",
            ))
        }
        Value::Dict(entries) => {
            let mut map = IndexMap::new();
            for (k, v) in entries.borrow().iter() {
                map.insert(k.label(), to_json(v)?);
            }
            ResultValue::Mapping(map)
        }
        Value::List(_) | Value::Tuple(_) | Value::Range(..) => ResultValue::List(
            value
                .iter_values()?
                .iter()
                .map(to_json)
                .collect::<ScriptResult<Vec<_>>>()?,
        ),
        other => ResultValue::Scalar(other.to_scalar().map_err(|_| {
            ScriptError::type_error(format!(
                "result of type '{}' cannot be returned",
                other.type_name()
            ))
        })?),
    })
}

fn to_json(value: &Value) -> ScriptResult<serde_json::Value> {
    Ok(match value {
        Value::List(_) | Value::Tuple(_) => serde_json::Value::Array(
            value
                .iter_values()?
                .iter()
                .map(to_json)
                .collect::<ScriptResult<Vec<_>>>()?,
        ),
        Value::Dict(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries.borrow().iter() {
                map.insert(k.label(), to_json(v)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Frame(_) | Value::Series(_) => {
            serde_json::to_value(to_result_value(value)?).map_err(|e| {
                ScriptError::type_error(format!("result is not serializable: {}", e))
            })?
        }
        other => other.to_scalar()?.to_json(),
    })
}

/// Parse and run a script against the datasets, returning its `result`.
///
/// The interpreter recurses on the native stack, so it runs on a dedicated
/// thread sized for `MAX_CALL_DEPTH` nested script calls.
pub fn run_script(
    code: &str,
    datasets: &IndexMap<String, Table>,
) -> Result<ScriptOutput, ScriptFailure> {
    let internal = |message: String| ScriptFailure {
        error: ScriptError::new(ErrorKind::Runtime, message),
        stdout: String::new(),
        missing_result: false,
    };
    std::thread::scope(|scope| {
        let handle = std::thread::Builder::new()
            .name("script".to_string())
            .stack_size(SCRIPT_STACK_BYTES)
            .spawn_scoped(scope, || execute(code, datasets))
            .map_err(|e| internal(format!("could not start the script thread: {}", e)))?;
        handle
            .join()
            .unwrap_or_else(|_| Err(internal("script execution aborted".to_string())))
    })
}

fn execute(
    code: &str,
    datasets: &IndexMap<String, Table>,
) -> Result<ScriptOutput, ScriptFailure> {
    let program = parser::parse(code).map_err(|error| ScriptFailure {
        error,
        stdout: String::new(),
        missing_result: false,
    })?;
    let mut interp = Interpreter::new();
    interp.bind_datasets(datasets);
    if let Err(error) = interp.run(&program) {
        return Err(ScriptFailure {
            error,
            stdout: interp.output,
            missing_result: false,
        });
    }
    let value = match interp.global(RESULT_BINDING) {
        None | Some(Value::None) => {
            return Err(ScriptFailure {
                error: ScriptError::name(format!(
                    "the script did not assign its answer to `{}`",
                    RESULT_BINDING
                )),
                stdout: interp.output,
                missing_result: true,
            })
        }
        Some(value) => value.clone(),
    };
    match to_result_value(&value) {
        Ok(value) => Ok(ScriptOutput {
            value,
            stdout: interp.output,
        }),
        Err(error) => Err(ScriptFailure {
            error,
            stdout: interp.output,
            missing_result: false,
        }),
    }
}

/// Evaluate `expr` in a scope where the given names are bound; used by
/// `DataFrame.query`.
pub fn eval_with_bindings(
    interp: &mut Interpreter,
    expr: &Expr,
    bindings: HashMap<String, Value>,
) -> ScriptResult<Value> {
    interp.scopes.push(Scope {
        vars: bindings,
        transparent: true,
    });
    let out = interp.eval(expr);
    interp.scopes.pop();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::Scalar;

    fn sales() -> IndexMap<String, Table> {
        let table = Table::from_rows(
            vec!["Group".into(), "X".into()],
            vec![
                vec![Scalar::Text("A".into()), Scalar::Int(100)],
                vec![Scalar::Text("B".into()), Scalar::Int(200)],
                vec![Scalar::Text("A".into()), Scalar::Int(300)],
            ],
        )
        .unwrap();
        let mut datasets = IndexMap::new();
        datasets.insert("sales".to_string(), table);
        datasets
    }

    fn run(code: &str) -> ScriptOutput {
        run_script(code, &sales()).map_err(|f| f.error).unwrap()
    }

    fn run_err(code: &str) -> ScriptError {
        run_script(code, &sales()).unwrap_err().error
    }

    #[test]
    fn test_average_by_group() {
        let out = run("result = df.groupby('Group')['X'].mean().reset_index()\n");
        let ResultValue::Table(table) = out.value else {
            panic!("expected a table");
        };
        assert_eq!(table.columns, vec!["Group", "X"]);
        assert_eq!(table.records.len(), 2);
        assert_eq!(table.records[0]["Group"], Scalar::Text("A".into()));
        assert_eq!(table.records[0]["X"], Scalar::Float(200.0));
        assert_eq!(table.records[1]["Group"], Scalar::Text("B".into()));
    }

    #[test]
    fn test_scalar_result_passes_through() {
        let out = run("result = int(datasets['sales']['X'].sum())\n");
        assert_eq!(out.value, ResultValue::Scalar(Scalar::Int(600)));
        let out = run("result = sales['X'].max() > 250\n");
        assert_eq!(out.value, ResultValue::Scalar(Scalar::Bool(true)));
    }

    #[test]
    fn test_missing_result_is_an_error() {
        let failure = run_script("x = 1\n", &sales()).unwrap_err();
        assert!(failure.missing_result);
        let err = run_err("x = 1\n");
        assert!(err.message.contains("result"));
        let err = run_err("result = None\n");
        assert!(err.message.contains("result"));
    }

    #[test]
    fn test_print_is_captured() {
        let out = run("total = 0\nfor v in df['X']:\n    total += v\nprint(f'total={total:,}')\nresult = total\n");
        assert_eq!(out.stdout, "total=600\n");
        assert_eq!(out.value, ResultValue::Scalar(Scalar::Int(600)));
    }

    #[test]
    fn test_functions_and_closures() {
        let code = "\
def scale(v, factor=2):
    return v * factor

bonus = 5
add = lambda v: v + bonus
result = [add(scale(v)) for v in [1, 2, 3]]
";
        let out = run(code);
        assert_eq!(
            out.value,
            ResultValue::List(vec![
                serde_json::json!(7),
                serde_json::json!(9),
                serde_json::json!(11)
            ])
        );
    }

    #[test]
    fn test_try_except_catches_key_error() {
        let code = "\
try:
    v = df['Missing']
except KeyError as e:
    v = 'missing'
result = v
";
        assert_eq!(
            run(code).value,
            ResultValue::Scalar(Scalar::Text("missing".into()))
        );
    }

    #[test]
    fn test_runtime_error_reports_line() {
        let err = run_err("a = 1\nb = a / 0\nresult = b\n");
        assert_eq!(err.kind, ErrorKind::ZeroDivision);
        assert_eq!(err.line, Some(2));
    }

    #[test]
    fn test_unbounded_recursion_is_stopped() {
        let err = run_err("def f(n):\n    return f(n + 1)\nresult = f(0)\n");
        assert_eq!(err.kind, ErrorKind::Recursion);
    }

    #[test]
    fn test_mask_filter_and_dict_result() {
        let code = "\
big = df[(df['X'] > 100) & (df['Group'] == 'A')]
result = {'rows': len(big), 'total': big['X'].sum()}
";
        let ResultValue::Mapping(map) = run(code).value else {
            panic!("expected a mapping");
        };
        assert_eq!(map["rows"], serde_json::json!(1));
        assert_eq!(map["total"], serde_json::json!(300));
    }

    #[test]
    fn test_nothing_outside_the_allow_list() {
        assert_eq!(run_err("result = open('x')\n").kind, ErrorKind::Name);
        assert_eq!(run_err("result = __builtins__\n").kind, ErrorKind::Name);
    }

    #[test]
    fn test_host_facilities_are_stripped() {
        for name in ["os", "open", "eval", "getattr"] {
            let err = run_err(&format!("result = {}\n", name));
            assert_eq!(err.kind, ErrorKind::Name);
            assert!(err.message.contains("not available"), "{}", err.message);
        }
        // Script bindings may still shadow a stripped name
        let out = run("input = 3\nresult = input\n");
        assert_eq!(out.value, ResultValue::Scalar(Scalar::Int(3)));
    }

    #[test]
    fn test_step_limit_stops_runaway_loop() {
        let program = parser::parse("n = 0\nwhile True:\n    n += 1\nresult = n\n").unwrap();
        let mut interp = Interpreter::new().with_step_limit(1_000);
        let err = interp.run(&program).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert!(err.message.contains("step limit"));
    }

    #[test]
    fn test_step_limit_allows_finite_work() {
        let program =
            parser::parse("total = 0\nfor i in range(100):\n    total += i\nresult = total\n")
                .unwrap();
        let mut interp = Interpreter::new().with_step_limit(1_000);
        interp.run(&program).unwrap();
        assert!(matches!(interp.global("result"), Some(Value::Int(4950))));
    }
}
