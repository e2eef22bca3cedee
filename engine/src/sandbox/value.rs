//! Runtime values of the script interpreter

use super::error::{ErrorKind, ScriptError, ScriptResult};
use super::frame::{DataFrame, GroupBy, Series};
use super::parser::{FunctionDef, Lambda};
use indexmap::IndexMap;
use sdk::Scalar;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

/// Hashable projection of a value, used for dict keys and group keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Tuple(Vec<Key>),
}

impl Key {
    pub fn from_scalar(scalar: &Scalar) -> Key {
        match scalar {
            Scalar::Null => Key::None,
            Scalar::Bool(b) => Key::Bool(*b),
            Scalar::Int(i) => Key::Int(*i),
            Scalar::Float(f) => float_key(*f),
            Scalar::Text(s) => Key::Str(s.clone()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Key::Str(s) => Value::Str(s.clone()),
            Key::Tuple(items) => Value::tuple(items.iter().map(Key::to_value).collect()),
        }
    }

    /// Text used when a key becomes a JSON object key
    pub fn label(&self) -> String {
        match self {
            Key::Str(s) => s.clone(),
            other => other.to_value().to_str(),
        }
    }
}

fn float_key(f: f64) -> Key {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Key::Int(f as i64)
    } else {
        Key::Float(f.to_bits())
    }
}

/// Which accessor namespace a `.str` / `.dt` value refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorKind {
    Str,
    Dt,
}

/// `.loc` / `.iloc` indexers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerKind {
    Loc,
    Iloc,
}

#[derive(Debug)]
pub enum FunctionBody {
    Block(Rc<FunctionDef>),
    Lambda(Rc<Lambda>),
}

/// A user-defined function or lambda with the locals it closed over
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub body: FunctionBody,
    pub defaults: Vec<Option<Value>>,
    pub captured: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<IndexMap<Key, Value>>>),
    Range(i64, i64, i64),
    Slice(Option<i64>, Option<i64>, Option<i64>),
    Frame(Rc<RefCell<DataFrame>>),
    Series(Rc<Series>),
    GroupBy(Rc<GroupBy>),
    Accessor(Rc<Series>, AccessorKind),
    Indexer(Box<Value>, IndexerKind),
    Builtin(&'static str),
    Method(Box<Value>, String),
    Function(Rc<Function>),
    Module(&'static str),
    Error(ErrorKind, String),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(entries: IndexMap<Key, Value>) -> Value {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn frame(frame: DataFrame) -> Value {
        Value::Frame(Rc::new(RefCell::new(frame)))
    }

    pub fn series(series: Series) -> Value {
        Value::Series(Rc::new(series))
    }

    pub fn from_scalar(scalar: &Scalar) -> Value {
        match scalar {
            Scalar::Null => Value::None,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::Int(*i),
            Scalar::Float(f) => Value::Float(*f),
            Scalar::Text(s) => Value::Str(s.clone()),
        }
    }

    /// Convert to a table cell. NaN is stored as a missing value.
    pub fn to_scalar(&self) -> ScriptResult<Scalar> {
        Ok(match self {
            Value::None => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Int(i) => Scalar::Int(*i),
            Value::Float(f) if f.is_nan() => Scalar::Null,
            Value::Float(f) => Scalar::Float(*f),
            Value::Str(s) => Scalar::Text(s.clone()),
            other => {
                return Err(ScriptError::type_error(format!(
                    "cannot store a {} value in a table cell",
                    other.type_name()
                )))
            }
        })
    }

    pub fn to_key(&self) -> ScriptResult<Key> {
        Ok(match self {
            Value::None => Key::None,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) => float_key(*f),
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(items) => Key::Tuple(
                items
                    .iter()
                    .map(Value::to_key)
                    .collect::<ScriptResult<Vec<_>>>()?,
            ),
            other => {
                return Err(ScriptError::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range(..) => "range",
            Value::Slice(..) => "slice",
            Value::Frame(_) => "DataFrame",
            Value::Series(_) => "Series",
            Value::GroupBy(_) => "DataFrameGroupBy",
            Value::Accessor(_, AccessorKind::Str) => "StringMethods",
            Value::Accessor(_, AccessorKind::Dt) => "DatetimeProperties",
            Value::Indexer(_, IndexerKind::Loc) => "_LocIndexer",
            Value::Indexer(_, IndexerKind::Iloc) => "_iLocIndexer",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Method(..) => "method",
            Value::Function(_) => "function",
            Value::Module(_) => "module",
            Value::Error(..) => "Exception",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    pub fn truthy(&self) -> ScriptResult<bool> {
        Ok(match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            Value::Range(start, stop, step) => range_len(*start, *stop, *step) > 0,
            Value::Frame(_) | Value::Series(_) => {
                return Err(ScriptError::value(format!(
                    "The truth value of a {} is ambiguous. Use a.empty, a.any() or a.all().",
                    self.type_name()
                )))
            }
            _ => true,
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_int(&self) -> ScriptResult<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(i64::from(*b)),
            other => Err(ScriptError::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            ))),
        }
    }

    pub fn as_str(&self) -> ScriptResult<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(ScriptError::type_error(format!(
                "expected str, got {}",
                other.type_name()
            ))),
        }
    }

    /// Materialize an iterable into its items
    pub fn iter_values(&self) -> ScriptResult<Vec<Value>> {
        Ok(match self {
            Value::List(items) => items.borrow().clone(),
            Value::Tuple(items) => items.as_ref().clone(),
            Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
            Value::Dict(entries) => entries.borrow().keys().map(Key::to_value).collect(),
            Value::Range(start, stop, step) => {
                let len = range_len(*start, *stop, *step);
                (0..len).map(|i| Value::Int(start + i * step)).collect()
            }
            Value::Series(series) => series.values.iter().map(Value::from_scalar).collect(),
            Value::Frame(frame) => frame
                .borrow()
                .value_columns()
                .iter()
                .map(|c| Value::Str(c.clone()))
                .collect(),
            Value::GroupBy(group_by) => group_by
                .groups()?
                .into_iter()
                .map(|(key, frame)| Value::tuple(vec![key, Value::frame(frame)]))
                .collect(),
            other => {
                return Err(ScriptError::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        })
    }

    /// `str(x)`
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Error(_, message) => message.clone(),
            other => other.repr(),
        }
    }

    /// `repr(x)`
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote(s),
            Value::List(items) => {
                let inner: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Value::Dict(entries) => {
                let inner: Vec<String> = entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.to_value().repr(), v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Range(start, stop, step) => {
                if *step == 1 {
                    format!("range({}, {})", start, stop)
                } else {
                    format!("range({}, {}, {})", start, stop, step)
                }
            }
            Value::Frame(frame) => frame.borrow().render(),
            Value::Series(series) => series.render(),
            Value::Builtin(name) => format!("<built-in function {}>", name),
            Value::Method(_, name) => format!("<bound method {}>", name),
            Value::Function(f) => format!("<function {}>", f.name),
            Value::Module(name) => format!("<module '{}'>", name),
            Value::Error(kind, message) => format!("{}({})", kind.as_str(), quote(message)),
            other => format!("<{} object>", other.type_name()),
        }
    }
}

pub fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 && start < stop {
        (stop - start + step - 1) / step
    } else if step < 0 && start > stop {
        (start - stop - step - 1) / (-step)
    } else {
        0
    }
}

/// Python-style float text: `200.0`, `0.5`, `inf`, `nan`
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    let delimiter = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push(delimiter);
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delimiter);
    out
}

/// Equality with numeric coercion (1 == 1.0 == True)
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (x, y) if x.is_number() && y.is_number() => x.as_f64() == y.as_f64(),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Frame(x), Value::Frame(y)) => Rc::ptr_eq(x, y),
        (Value::Series(x), Value::Series(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Ordering for `<`, `sorted`, `min`, `max`
pub fn compare_values(a: &Value, b: &Value) -> ScriptResult<Ordering> {
    match (a, b) {
        (x, y) if x.is_number() && y.is_number() => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal))
        }
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) => compare_sequences(&x.borrow(), &y.borrow()),
        (Value::Tuple(x), Value::Tuple(y)) => compare_sequences(x, y),
        _ => Err(ScriptError::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn compare_sequences(x: &[Value], y: &[Value]) -> ScriptResult<Ordering> {
    for (a, b) in x.iter().zip(y.iter()) {
        if values_equal(a, b) {
            continue;
        }
        return compare_values(a, b);
    }
    Ok(x.len().cmp(&y.len()))
}

/// Total order over table cells: numbers, then text, nulls last.
pub fn compare_scalars(a: &Scalar, b: &Scalar) -> Ordering {
    fn rank(s: &Scalar) -> u8 {
        match s {
            Scalar::Bool(_) | Scalar::Int(_) | Scalar::Float(_) => 0,
            Scalar::Text(_) => 1,
            Scalar::Null => 2,
        }
    }
    match (a, b) {
        (Scalar::Text(x), Scalar::Text(y)) => x.cmp(y),
        (x, y) if rank(x) == 0 && rank(y) == 0 => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (x, y) => rank(x).cmp(&rank(y)),
    }
}

/// Apply a Python format spec (`,.2f`, `>10`, `.1%`, `d`) to a value.
pub fn format_value(value: &Value, spec: &str) -> ScriptResult<String> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }

    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    let mut fill = ' ';
    let mut align = None;
    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^') {
        fill = chars[0];
        align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && matches!(chars[0], '<' | '>' | '^') {
        align = Some(chars[0]);
        i = 1;
    }
    let mut sign_plus = false;
    if chars.get(i) == Some(&'+') {
        sign_plus = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') && align.is_none() {
        fill = '0';
        align = Some('>');
        i += 1;
    }
    let mut width = 0usize;
    while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
        width = width * 10 + d as usize;
        i += 1;
    }
    let mut grouping = false;
    if chars.get(i) == Some(&',') || chars.get(i) == Some(&'_') {
        grouping = true;
        i += 1;
    }
    let mut precision = None;
    if chars.get(i) == Some(&'.') {
        i += 1;
        let mut p = 0usize;
        while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
            p = p * 10 + d as usize;
            i += 1;
        }
        precision = Some(p);
    }
    let kind = chars.get(i).copied();
    if i + usize::from(kind.is_some()) != chars.len() {
        return Err(ScriptError::value(format!(
            "Invalid format specifier '{}'",
            spec
        )));
    }

    let mut body = match (kind, value) {
        (Some('%'), v) if v.is_number() => {
            let f = v.as_f64().unwrap_or(0.0) * 100.0;
            format!("{}%", fixed(f, precision.unwrap_or(6), grouping))
        }
        (Some('f') | Some('F'), v) if v.is_number() => {
            fixed(v.as_f64().unwrap_or(0.0), precision.unwrap_or(6), grouping)
        }
        (Some('e'), v) if v.is_number() => {
            format!("{:.*e}", precision.unwrap_or(6), v.as_f64().unwrap_or(0.0))
        }
        (Some('d'), Value::Int(n)) => group_int(*n, grouping),
        (Some('d'), Value::Bool(b)) => i64::from(*b).to_string(),
        (Some('s'), Value::Str(s)) => s.clone(),
        (None, Value::Int(n)) => group_int(*n, grouping),
        (None, Value::Float(f)) => match precision {
            Some(p) => fixed(*f, p, grouping),
            None if grouping => fixed(*f, 1, true),
            None => format_float(*f),
        },
        (None, Value::Str(s)) => match precision {
            Some(p) => s.chars().take(p).collect(),
            None => s.clone(),
        },
        (None, v) => v.to_str(),
        _ => {
            return Err(ScriptError::value(format!(
                "Unknown format code '{}' for object of type '{}'",
                kind.unwrap_or(' '),
                value.type_name()
            )))
        }
    };

    if sign_plus && value.is_number() && !body.starts_with('-') {
        body.insert(0, '+');
    }

    let len = body.chars().count();
    if width > len {
        let pad = width - len;
        let default_align = if matches!(value, Value::Str(_)) { '<' } else { '>' };
        let padding = |n: usize| fill.to_string().repeat(n);
        body = match align.unwrap_or(default_align) {
            '<' => format!("{}{}", body, padding(pad)),
            '^' => format!("{}{}{}", padding(pad / 2), body, padding(pad - pad / 2)),
            _ => format!("{}{}", padding(pad), body),
        };
    }
    Ok(body)
}

fn fixed(f: f64, precision: usize, grouping: bool) -> String {
    let text = format!("{:.*}", precision, f);
    if !grouping {
        return text;
    }
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    let mut out = String::from(sign);
    out.push_str(&group_digits(int_part));
    if let Some(frac) = frac_part {
        let _ = write!(out, ".{}", frac);
    }
    out
}

fn group_int(n: i64, grouping: bool) -> String {
    if !grouping {
        return n.to_string();
    }
    let digits = n.unsigned_abs().to_string();
    let sign = if n < 0 { "-" } else { "" };
    format!("{}{}", sign, group_digits(&digits))
}

fn group_digits(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr_and_str() {
        assert_eq!(Value::Float(200.0).repr(), "200.0");
        assert_eq!(Value::Str("a'b".into()).repr(), "\"a'b\"");
        let list = Value::list(vec![Value::Int(1), Value::Str("x".into()), Value::None]);
        assert_eq!(list.repr(), "[1, 'x', None]");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
    }

    #[test]
    fn test_numeric_equality_and_keys() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
        assert_eq!(Value::Float(2.0).to_key().unwrap(), Key::Int(2));
        assert!(Value::list(vec![]).to_key().is_err());
    }

    #[test]
    fn test_truthiness_of_frames_is_ambiguous() {
        let frame = Value::frame(DataFrame::default());
        assert!(frame.truthy().is_err());
        assert!(!Value::Str(String::new()).truthy().unwrap());
        assert!(Value::Range(0, 3, 1).truthy().unwrap());
    }

    #[test]
    fn test_range_len() {
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -2), 5);
        assert_eq!(range_len(5, 5, 1), 0);
    }

    #[test]
    fn test_format_specs() {
        assert_eq!(format_value(&Value::Float(1234.5), ",.2f").unwrap(), "1,234.50");
        assert_eq!(format_value(&Value::Int(-1234567), ",").unwrap(), "-1,234,567");
        assert_eq!(format_value(&Value::Float(0.256), ".1%").unwrap(), "25.6%");
        assert_eq!(format_value(&Value::Str("ab".into()), ">4").unwrap(), "  ab");
        assert_eq!(format_value(&Value::Int(7), "03d").unwrap(), "007");
        assert!(format_value(&Value::Str("x".into()), ".2f").is_err());
    }

    #[test]
    fn test_scalar_ordering_puts_nulls_last() {
        let mut cells = vec![Scalar::Null, Scalar::Int(3), Scalar::Float(1.5)];
        cells.sort_by(compare_scalars);
        assert_eq!(cells, vec![Scalar::Float(1.5), Scalar::Int(3), Scalar::Null]);
    }
}
