//! Operators and subscription, including element-wise forms over series
//! and frames.

use super::error::{ErrorKind, ScriptError, ScriptResult};
use super::frame::{DataFrame, Index, Selection, Series};
use super::parser::{BinOp, CmpOp, UnaryOp};
use super::value::{compare_scalars, compare_values, values_equal, AccessorKind, IndexerKind, Key, Value};
use sdk::Scalar;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

// ---- arithmetic ----

pub fn binary(a: &Value, op: BinOp, b: &Value) -> ScriptResult<Value> {
    match (a, b) {
        (Value::Series(_) | Value::Frame(_), _) | (_, Value::Series(_) | Value::Frame(_)) => {
            elementwise(a, b, |x, y| scalar_binary(x, op, y))
        }
        _ => plain_binary(a, op, b),
    }
}

/// Arithmetic on one pair of cells; nulls and division by zero give null
fn scalar_binary(a: &Scalar, op: BinOp, b: &Scalar) -> ScriptResult<Scalar> {
    if a.is_null() || b.is_null() {
        return Ok(Scalar::Null);
    }
    match plain_binary(&Value::from_scalar(a), op, &Value::from_scalar(b)) {
        Ok(v) => v.to_scalar(),
        Err(e) if e.kind == ErrorKind::ZeroDivision => Ok(Scalar::Null),
        Err(e) => Err(e),
    }
}

fn unsupported(a: &Value, op: &str, b: &Value) -> ScriptError {
    ScriptError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        a.type_name(),
        b.type_name()
    ))
}

fn plain_binary(a: &Value, op: BinOp, b: &Value) -> ScriptResult<Value> {
    use BinOp::*;
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) if matches!(op, BitAnd | BitOr | BitXor) => {
            Ok(Value::Bool(match op {
                BitAnd => *x & *y,
                BitOr => *x | *y,
                _ => *x ^ *y,
            }))
        }
        (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => {
            let x = a.as_int()?;
            let y = b.as_int()?;
            int_binary(x, op, y)
        }
        (x, y) if x.is_number() && y.is_number() => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            float_binary(x, op, y).ok_or_else(|| unsupported(a, op.symbol(), b))?
        }
        (Value::Str(x), Value::Str(y)) if op == Add => Ok(Value::Str(format!("{}{}", x, y))),
        (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) if op == Mul => {
            Ok(Value::Str(s.repeat((*n).max(0) as usize)))
        }
        (Value::Str(fmt), args) if op == Mod => percent_format(fmt, args),
        (Value::List(x), Value::List(y)) if op == Add => {
            let mut items = x.borrow().clone();
            items.extend(y.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (Value::List(x), Value::Int(n)) if op == Mul => {
            let items = x.borrow();
            let mut out = Vec::new();
            for _ in 0..(*n).max(0) {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        (Value::Tuple(x), Value::Tuple(y)) if op == Add => {
            let mut items = x.as_ref().clone();
            items.extend(y.iter().cloned());
            Ok(Value::tuple(items))
        }
        _ => Err(unsupported(a, op.symbol(), b)),
    }
}

fn int_binary(x: i64, op: BinOp, y: i64) -> ScriptResult<Value> {
    use BinOp::*;
    let overflow = || float_binary(x as f64, op, y as f64);
    let value = match op {
        Add => x.checked_add(y).map(Value::Int),
        Sub => x.checked_sub(y).map(Value::Int),
        Mul => x.checked_mul(y).map(Value::Int),
        Div => {
            if y == 0 {
                return Err(ScriptError::zero_division());
            }
            Some(Value::Float(x as f64 / y as f64))
        }
        FloorDiv => {
            if y == 0 {
                return Err(ScriptError::new(
                    ErrorKind::ZeroDivision,
                    "integer division or modulo by zero",
                ));
            }
            let q = x / y;
            Some(Value::Int(if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q }))
        }
        Mod => {
            if y == 0 {
                return Err(ScriptError::new(
                    ErrorKind::ZeroDivision,
                    "integer division or modulo by zero",
                ));
            }
            let r = x % y;
            Some(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
        }
        Pow => {
            if y >= 0 {
                u32::try_from(y)
                    .ok()
                    .and_then(|e| x.checked_pow(e))
                    .map(Value::Int)
            } else {
                Some(Value::Float((x as f64).powf(y as f64)))
            }
        }
        BitAnd => Some(Value::Int(x & y)),
        BitOr => Some(Value::Int(x | y)),
        BitXor => Some(Value::Int(x ^ y)),
    };
    match value {
        Some(v) => Ok(v),
        None => overflow().unwrap_or_else(|| Err(ScriptError::value("integer overflow"))),
    }
}

fn float_binary(x: f64, op: BinOp, y: f64) -> Option<ScriptResult<Value>> {
    use BinOp::*;
    let zero = || Some(Err(ScriptError::new(ErrorKind::ZeroDivision, "float division by zero")));
    Some(Ok(Value::Float(match op {
        Add => x + y,
        Sub => x - y,
        Mul => x * y,
        Div => {
            if y == 0.0 {
                return zero();
            }
            x / y
        }
        FloorDiv => {
            if y == 0.0 {
                return zero();
            }
            (x / y).floor()
        }
        Mod => {
            if y == 0.0 {
                return zero();
            }
            x - y * (x / y).floor()
        }
        Pow => x.powf(y),
        BitAnd | BitOr | BitXor => return None,
    })))
}

/// `"%.2f" % value` style formatting
fn percent_format(fmt: &str, args: &Value) -> ScriptResult<Value> {
    let values: Vec<Value> = match args {
        Value::Tuple(items) => items.as_ref().clone(),
        other => vec![other.clone()],
    };
    let mut next = values.iter();
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() || d == '.' || d == ',' || d == '-' || d == '+' {
                spec.push(d);
                chars.next();
            } else {
                break;
            }
        }
        let Some(conv) = chars.next() else {
            return Err(ScriptError::value("incomplete format"));
        };
        if conv == '%' {
            out.push('%');
            continue;
        }
        let value = next
            .next()
            .ok_or_else(|| ScriptError::type_error("not enough arguments for format string"))?;
        let spec = match spec.strip_prefix('-') {
            Some(rest) => format!("<{}", rest),
            None => spec,
        };
        let text = match conv {
            's' => super::value::format_value(&Value::Str(value.to_str()), &spec)?,
            'r' => value.repr(),
            'd' | 'i' => {
                let n = match value {
                    Value::Float(f) => Value::Int(f.trunc() as i64),
                    other => other.clone(),
                };
                super::value::format_value(&n, &format!("{}d", spec))?
            }
            'f' | 'F' | 'e' | 'g' => {
                let kind = if conv == 'g' { 'f' } else { conv };
                super::value::format_value(value, &format!("{}{}", spec, kind))?
            }
            other => {
                return Err(ScriptError::value(format!(
                    "unsupported format character '{}'",
                    other
                )))
            }
        };
        out.push_str(&text);
    }
    if next.next().is_some() {
        return Err(ScriptError::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(Value::Str(out))
}

pub fn unary(op: UnaryOp, v: &Value) -> ScriptResult<Value> {
    match (op, v) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy()?)),
        (_, Value::Series(s)) => {
            let values = s
                .values
                .iter()
                .map(|c| {
                    if c.is_null() {
                        Ok(Scalar::Null)
                    } else {
                        unary(op, &Value::from_scalar(c))?.to_scalar()
                    }
                })
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(Value::series(s.with_values(values)))
        }
        (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, Value::Bool(b)) => Ok(Value::Int(-i64::from(*b))),
        (UnaryOp::Pos, v) if v.is_number() => Ok(v.clone()),
        (UnaryOp::Invert, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Invert, Value::Int(i)) => Ok(Value::Int(!i)),
        (op, v) => Err(ScriptError::type_error(format!(
            "bad operand type for unary {}: '{}'",
            match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                UnaryOp::Invert => "~",
                UnaryOp::Not => "not",
            },
            v.type_name()
        ))),
    }
}

// ---- comparison ----

pub fn compare(a: &Value, op: CmpOp, b: &Value) -> ScriptResult<Value> {
    match op {
        CmpOp::In => return contains(b, a).map(Value::Bool),
        CmpOp::NotIn => return contains(b, a).map(|c| Value::Bool(!c)),
        CmpOp::Is => return Ok(Value::Bool(identical(a, b))),
        CmpOp::IsNot => return Ok(Value::Bool(!identical(a, b))),
        _ => {}
    }
    match (a, b) {
        (Value::Series(_) | Value::Frame(_), _) | (_, Value::Series(_) | Value::Frame(_)) => {
            elementwise(a, b, |x, y| compare_cells(x, op, y).map(Scalar::Bool))
        }
        _ => Ok(Value::Bool(match op {
            CmpOp::Eq => values_equal(a, b),
            CmpOp::Ne => !values_equal(a, b),
            _ => {
                let ord = compare_values(a, b)?;
                ordering_matches(op, ord)
            }
        })),
    }
}

fn ordering_matches(op: CmpOp, ord: Ordering) -> bool {
    match op {
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        _ => false,
    }
}

/// Cell comparison: nulls compare unequal to everything
pub fn compare_cells(a: &Scalar, op: CmpOp, b: &Scalar) -> ScriptResult<bool> {
    if a.is_null() || b.is_null() {
        return Ok(op == CmpOp::Ne);
    }
    let same_kind = matches!(
        (a, b),
        (Scalar::Text(_), Scalar::Text(_))
    ) || (a.as_f64().is_some() && b.as_f64().is_some());
    match op {
        CmpOp::Eq => Ok(same_kind && compare_scalars(a, b) == Ordering::Equal),
        CmpOp::Ne => Ok(!same_kind || compare_scalars(a, b) != Ordering::Equal),
        _ if !same_kind => Err(ScriptError::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
        _ => Ok(ordering_matches(op, compare_scalars(a, b))),
    }
}

fn identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Frame(x), Value::Frame(y)) => Rc::ptr_eq(x, y),
        (Value::Series(x), Value::Series(y)) => Rc::ptr_eq(x, y),
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        _ => false,
    }
}

/// `item in container`
pub fn contains(container: &Value, item: &Value) -> ScriptResult<bool> {
    Ok(match container {
        Value::Str(s) => s.contains(item.as_str().map_err(|_| {
            ScriptError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                item.type_name()
            ))
        })?),
        Value::List(items) => items.borrow().iter().any(|v| values_equal(v, item)),
        Value::Tuple(items) => items.iter().any(|v| values_equal(v, item)),
        Value::Dict(entries) => entries.borrow().contains_key(&item.to_key()?),
        Value::Range(..) => container
            .iter_values()?
            .iter()
            .any(|v| values_equal(v, item)),
        Value::Frame(frame) => {
            let name = item.as_str().ok();
            name.is_some_and(|n| frame.borrow().columns.iter().any(|c| c == n))
        }
        Value::Series(series) => series.index.find(item)?.is_some(),
        other => {
            return Err(ScriptError::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            )))
        }
    })
}

// ---- element-wise broadcasting ----

fn elementwise(
    a: &Value,
    b: &Value,
    f: impl Fn(&Scalar, &Scalar) -> ScriptResult<Scalar>,
) -> ScriptResult<Value> {
    match (a, b) {
        (Value::Series(x), Value::Series(y)) => {
            let aligned = align(x, y);
            let values = x
                .values
                .iter()
                .zip(aligned.iter())
                .map(|(p, q)| f(p, q))
                .collect::<ScriptResult<Vec<_>>>()?;
            let mut out = x.with_values(values);
            if x.name != y.name {
                out.name = None;
            }
            Ok(Value::series(out))
        }
        (Value::Series(x), other) => {
            let right = broadcast(other, x.len())?;
            let values = x
                .values
                .iter()
                .zip(right.iter())
                .map(|(p, q)| f(p, q))
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(Value::series(x.with_values(values)))
        }
        (other, Value::Series(y)) => {
            let left = broadcast(other, y.len())?;
            let values = left
                .iter()
                .zip(y.values.iter())
                .map(|(p, q)| f(p, q))
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(Value::series(y.with_values(values)))
        }
        (Value::Frame(frame), other) => {
            let scalar = other.to_scalar()?;
            let frame = frame.borrow();
            let mut out = frame.clone();
            for col in out.data.iter_mut().skip(frame.key_columns) {
                for cell in col.iter_mut() {
                    *cell = f(cell, &scalar)?;
                }
            }
            Ok(Value::frame(out))
        }
        (other, Value::Frame(frame)) => {
            let scalar = other.to_scalar()?;
            let frame = frame.borrow();
            let mut out = frame.clone();
            for col in out.data.iter_mut().skip(frame.key_columns) {
                for cell in col.iter_mut() {
                    *cell = f(&scalar, cell)?;
                }
            }
            Ok(Value::frame(out))
        }
        _ => Err(ScriptError::type_error("element-wise operation needs a Series")),
    }
}

/// A scalar repeated, or a list of matching length
fn broadcast(value: &Value, len: usize) -> ScriptResult<Vec<Scalar>> {
    match value {
        Value::List(_) | Value::Tuple(_) => {
            let items = value.iter_values()?;
            if items.len() != len {
                return Err(ScriptError::value(format!(
                    "Lengths must match to compare ({} vs {})",
                    len,
                    items.len()
                )));
            }
            items.iter().map(Value::to_scalar).collect()
        }
        other => Ok(vec![other.to_scalar()?; len]),
    }
}

/// Values of `other` arranged to match `base`'s index. Identical indexes
/// line up by position; otherwise by label, with null where missing.
fn align(base: &Series, other: &Series) -> Vec<Scalar> {
    if base.index == other.index {
        return other.values.clone();
    }
    let mut positions: HashMap<Key, usize> = HashMap::new();
    for i in 0..other.index.len() {
        if let Ok(key) = other.index.label(i).to_key() {
            positions.entry(key).or_insert(i);
        }
    }
    (0..base.index.len())
        .map(|i| {
            base.index
                .label(i)
                .to_key()
                .ok()
                .and_then(|k| positions.get(&k))
                .map(|&p| other.values[p].clone())
                .unwrap_or(Scalar::Null)
        })
        .collect()
}

/// Cells for a frame column assignment: a series aligned to the frame's
/// rows, a list of matching length, or a broadcast scalar.
pub fn column_values(frame: &DataFrame, value: &Value) -> ScriptResult<Vec<Scalar>> {
    match value {
        Value::Series(series) => {
            let index = frame.series_index();
            if series.index == index {
                return Ok(series.values.clone());
            }
            let base = Series {
                name: None,
                values: vec![Scalar::Null; frame.nrows()],
                index,
            };
            Ok(align(&base, series))
        }
        Value::Frame(_) => Err(ScriptError::value(
            "cannot assign a DataFrame to a single column",
        )),
        Value::Range(..) => broadcast(&Value::list(value.iter_values()?), frame.nrows()),
        other => broadcast(other, frame.nrows()).map_err(|_| {
            ScriptError::value(format!(
                "Length of values does not match length of index ({})",
                frame.nrows()
            ))
        }),
    }
}

// ---- subscription ----

/// Python slice semantics over a sequence of `len`
pub fn slice_positions(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> ScriptResult<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(ScriptError::value("slice step cannot be zero"));
    }
    let len = len as i64;
    let clamp = |v: i64, lo: i64, hi: i64| v.max(lo).min(hi);
    let norm = |v: i64| if v < 0 { v + len } else { v };
    let mut out = Vec::new();
    if step > 0 {
        let start = clamp(start.map(norm).unwrap_or(0), 0, len);
        let stop = clamp(stop.map(norm).unwrap_or(len), 0, len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = clamp(start.map(norm).unwrap_or(len - 1), -1, len - 1);
        let stop = clamp(stop.map(norm).unwrap_or(-1), -1, len - 1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

fn position(len: usize, index: i64, what: &str) -> ScriptResult<usize> {
    let i = if index < 0 { index + len as i64 } else { index };
    if i < 0 || i >= len as i64 {
        return Err(ScriptError::index(format!("{} index out of range", what)));
    }
    Ok(i as usize)
}

/// Boolean mask from a series or list, or `None` if the value is not one
fn as_mask(value: &Value) -> ScriptResult<Option<Vec<bool>>> {
    let cells: Vec<Value> = match value {
        Value::Series(s) => s.values.iter().map(Value::from_scalar).collect(),
        Value::List(items) => items.borrow().clone(),
        _ => return Ok(None),
    };
    if cells.is_empty() || !cells.iter().all(|c| matches!(c, Value::Bool(_) | Value::None)) {
        return Ok(None);
    }
    Ok(Some(cells.iter().map(|c| matches!(c, Value::Bool(true))).collect()))
}

/// Mask aligned to a frame's rows by label when the series came from
/// a differently indexed frame
fn frame_mask(frame: &DataFrame, value: &Value) -> ScriptResult<Option<Vec<bool>>> {
    if let Value::Series(series) = value {
        if as_mask(value)?.is_some() && series.len() != frame.nrows() {
            let base = Series {
                name: None,
                values: vec![Scalar::Null; frame.nrows()],
                index: frame.series_index(),
            };
            let aligned = align(&base, series);
            return Ok(Some(
                aligned.iter().map(|c| matches!(c, Scalar::Bool(true))).collect(),
            ));
        }
    }
    as_mask(value)
}

pub fn get_item(obj: &Value, index: &Value) -> ScriptResult<Value> {
    match obj {
        Value::List(items) => sequence_item(&items.borrow(), index, "list", Value::list),
        Value::Tuple(items) => sequence_item(items, index, "tuple", Value::tuple),
        Value::Range(..) => sequence_item(&obj.iter_values()?, index, "range", Value::list),
        Value::Str(s) => {
            let chars: Vec<Value> = s.chars().map(|c| Value::Str(c.to_string())).collect();
            match sequence_item(&chars, index, "string", Value::list)? {
                Value::List(parts) => Ok(Value::Str(
                    parts.borrow().iter().map(Value::to_str).collect(),
                )),
                other => Ok(other),
            }
        }
        Value::Dict(entries) => {
            let key = index.to_key()?;
            entries
                .borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| ScriptError::key(index.repr()))
        }
        Value::Frame(frame) => frame_item(&frame.borrow(), index),
        Value::Series(series) => series_item(series, index),
        Value::GroupBy(group_by) => {
            let selection = match index {
                Value::Str(s) => Selection::One(s.clone()),
                Value::List(_) | Value::Tuple(_) => {
                    Selection::Many(super::interpreter::string_list(index)?)
                }
                other => {
                    return Err(ScriptError::key(format!(
                        "Column not found: {}",
                        other.repr()
                    )))
                }
            };
            Ok(Value::GroupBy(Rc::new(group_by.select(selection)?)))
        }
        Value::Indexer(recv, kind) => indexer_item(recv, *kind, index),
        Value::Accessor(series, AccessorKind::Str) => {
            let values = series
                .values
                .iter()
                .map(|cell| match cell {
                    Scalar::Text(s) => get_item(&Value::Str(s.clone()), index)
                        .and_then(|v| v.to_scalar())
                        .unwrap_or(Scalar::Null),
                    _ => Scalar::Null,
                })
                .collect();
            Ok(Value::series(series.with_values(values)))
        }
        other => Err(ScriptError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn sequence_item(
    items: &[Value],
    index: &Value,
    what: &str,
    build: fn(Vec<Value>) -> Value,
) -> ScriptResult<Value> {
    match index {
        Value::Slice(start, stop, step) => {
            let positions = slice_positions(items.len(), *start, *stop, *step)?;
            Ok(build(positions.iter().map(|&i| items[i].clone()).collect()))
        }
        other => {
            let i = other.as_int().map_err(|_| {
                ScriptError::type_error(format!(
                    "{} indices must be integers or slices, not {}",
                    what,
                    other.type_name()
                ))
            })?;
            Ok(items[position(items.len(), i, what)?].clone())
        }
    }
}

fn frame_item(frame: &DataFrame, index: &Value) -> ScriptResult<Value> {
    match index {
        Value::Str(name) => Ok(Value::series(frame.column(name)?)),
        Value::Slice(start, stop, step) => {
            let rows = slice_positions(frame.nrows(), *start, *stop, *step)?;
            Ok(Value::frame(frame.take(&rows)))
        }
        other => {
            if let Some(mask) = frame_mask(frame, other)? {
                return Ok(Value::frame(frame.filter(&mask)?));
            }
            match other {
                Value::List(_) | Value::Tuple(_) => {
                    let names = super::interpreter::string_list(other)?;
                    Ok(Value::frame(frame.select(&names)?))
                }
                Value::Series(series) => {
                    let names = series
                        .values
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>();
                    Ok(Value::frame(frame.select(&names)?))
                }
                other => Err(ScriptError::key(other.repr())),
            }
        }
    }
}

fn series_item(series: &Series, index: &Value) -> ScriptResult<Value> {
    if let Some(mask) = as_mask(index)? {
        let mask = match index {
            Value::Series(m) if m.index != series.index => {
                let aligned = align(series, m);
                aligned.iter().map(|c| matches!(c, Scalar::Bool(true))).collect()
            }
            _ => mask,
        };
        return Ok(Value::series(series.filter(&mask)?));
    }
    match index {
        Value::Slice(start, stop, step) => {
            let rows = slice_positions(series.len(), *start, *stop, *step)?;
            Ok(Value::series(series.take(&rows)))
        }
        Value::List(_) => {
            let rows = index
                .iter_values()?
                .iter()
                .map(|label| {
                    series
                        .index
                        .find(label)?
                        .ok_or_else(|| ScriptError::key(label.repr()))
                })
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(Value::series(series.take(&rows)))
        }
        label => match series.index.find(label)? {
            Some(pos) => Ok(Value::from_scalar(&series.values[pos])),
            None => match (label, &series.index) {
                // Positional fallback for keyed series
                (Value::Int(i), Index::Keys { .. }) => {
                    let pos = position(series.len(), *i, "Series")?;
                    Ok(Value::from_scalar(&series.values[pos]))
                }
                _ => Err(ScriptError::key(label.repr())),
            },
        },
    }
}

/// Row selection resolved to positions
enum Rows {
    One(usize),
    Many(Vec<usize>),
}

enum Cols {
    All,
    One(String),
    Many(Vec<String>),
}

fn split_indexer(index: &Value) -> (Value, Option<Value>) {
    match index {
        Value::Tuple(parts) if parts.len() == 2 => (parts[0].clone(), Some(parts[1].clone())),
        other => (other.clone(), None),
    }
}

fn loc_rows(frame: &DataFrame, sel: &Value) -> ScriptResult<Rows> {
    if let Some(mask) = frame_mask(frame, sel)? {
        if mask.len() != frame.nrows() {
            return Err(ScriptError::index("Boolean index has wrong length"));
        }
        return Ok(Rows::Many(
            mask.iter()
                .enumerate()
                .filter_map(|(i, m)| m.then_some(i))
                .collect(),
        ));
    }
    let labels = frame.series_index();
    let find = |label: &Value| -> ScriptResult<usize> {
        labels
            .find(label)?
            .ok_or_else(|| ScriptError::key(label.repr()))
    };
    match sel {
        Value::Slice(None, None, None) => Ok(Rows::Many((0..frame.nrows()).collect())),
        Value::Slice(start, stop, step) => {
            // Label slices include both ends
            let from = match start {
                Some(s) => find(&Value::Int(*s))?,
                None => 0,
            };
            let to = match stop {
                Some(s) => find(&Value::Int(*s))? as i64,
                None => frame.nrows() as i64 - 1,
            };
            let step = step.unwrap_or(1).max(1) as usize;
            Ok(Rows::Many(
                (from as i64..=to).step_by(step).map(|i| i as usize).collect(),
            ))
        }
        Value::List(_) => Ok(Rows::Many(
            sel.iter_values()?
                .iter()
                .map(&find)
                .collect::<ScriptResult<Vec<_>>>()?,
        )),
        label => Ok(Rows::One(find(label)?)),
    }
}

fn iloc_rows(frame: &DataFrame, sel: &Value) -> ScriptResult<Rows> {
    match sel {
        Value::Slice(start, stop, step) => Ok(Rows::Many(slice_positions(
            frame.nrows(),
            *start,
            *stop,
            *step,
        )?)),
        Value::List(_) => Ok(Rows::Many(
            sel.iter_values()?
                .iter()
                .map(|v| position(frame.nrows(), v.as_int()?, "iloc"))
                .collect::<ScriptResult<Vec<_>>>()?,
        )),
        other => Ok(Rows::One(position(frame.nrows(), other.as_int()?, "iloc")?)),
    }
}

fn loc_cols(frame: &DataFrame, sel: Option<&Value>) -> ScriptResult<Cols> {
    match sel {
        None | Some(Value::Slice(None, None, None)) => Ok(Cols::All),
        Some(Value::Str(s)) => {
            frame.position(s)?;
            Ok(Cols::One(s.clone()))
        }
        Some(other) => Ok(Cols::Many(super::interpreter::string_list(other)?)),
    }
}

fn iloc_cols(frame: &DataFrame, sel: Option<&Value>) -> ScriptResult<Cols> {
    let names = frame.value_columns();
    match sel {
        None => Ok(Cols::All),
        Some(Value::Slice(start, stop, step)) => Ok(Cols::Many(
            slice_positions(names.len(), *start, *stop, *step)?
                .into_iter()
                .map(|i| names[i].clone())
                .collect(),
        )),
        Some(list @ Value::List(_)) => Ok(Cols::Many(
            list.iter_values()?
                .iter()
                .map(|v| Ok(names[position(names.len(), v.as_int()?, "iloc")?].clone()))
                .collect::<ScriptResult<Vec<_>>>()?,
        )),
        Some(other) => Ok(Cols::One(
            names[position(names.len(), other.as_int()?, "iloc")?].clone(),
        )),
    }
}

fn indexer_item(recv: &Value, kind: IndexerKind, index: &Value) -> ScriptResult<Value> {
    match recv {
        Value::Series(series) => match kind {
            IndexerKind::Loc => series_item(series, index),
            IndexerKind::Iloc => match index {
                Value::Slice(..) => series_item(series, index),
                Value::List(_) => {
                    let rows = index
                        .iter_values()?
                        .iter()
                        .map(|v| position(series.len(), v.as_int()?, "iloc"))
                        .collect::<ScriptResult<Vec<_>>>()?;
                    Ok(Value::series(series.take(&rows)))
                }
                other => {
                    let pos = position(series.len(), other.as_int()?, "iloc")?;
                    Ok(Value::from_scalar(&series.values[pos]))
                }
            },
        },
        Value::Frame(frame) => {
            let frame = frame.borrow();
            let (row_sel, col_sel) = split_indexer(index);
            let (rows, cols) = match kind {
                IndexerKind::Loc => (
                    loc_rows(&frame, &row_sel)?,
                    loc_cols(&frame, col_sel.as_ref())?,
                ),
                IndexerKind::Iloc => (
                    iloc_rows(&frame, &row_sel)?,
                    iloc_cols(&frame, col_sel.as_ref())?,
                ),
            };
            match (rows, cols) {
                (Rows::One(r), Cols::One(c)) => {
                    Ok(Value::from_scalar(&frame.data[frame.position(&c)?][r]))
                }
                (Rows::One(r), Cols::All) => Ok(Value::series(frame.row(r))),
                (Rows::One(r), Cols::Many(names)) => {
                    Ok(Value::series(frame.select(&names)?.reset_index(true).row(r)))
                }
                (Rows::Many(rows), Cols::One(c)) => {
                    Ok(Value::series(frame.take(&rows).column(&c)?))
                }
                (Rows::Many(rows), Cols::All) => Ok(Value::frame(frame.take(&rows))),
                (Rows::Many(rows), Cols::Many(names)) => {
                    Ok(Value::frame(frame.take(&rows).select(&names)?))
                }
            }
        }
        other => Err(ScriptError::type_error(format!(
            "'{}' object has no indexer",
            other.type_name()
        ))),
    }
}

pub fn set_item(obj: &Value, index: &Value, value: Value) -> ScriptResult<()> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = position(items.len(), index.as_int()?, "list assignment")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(entries) => {
            entries.borrow_mut().insert(index.to_key()?, value);
            Ok(())
        }
        Value::Frame(frame) => {
            let name = index.as_str().map_err(|_| {
                ScriptError::type_error("column assignment needs a column name")
            })?;
            let values = column_values(&frame.borrow(), &value)?;
            frame.borrow_mut().set_column(name, values)
        }
        Value::Indexer(recv, kind) => {
            let Value::Frame(frame) = recv.as_ref() else {
                return Err(ScriptError::type_error(
                    "indexed assignment is only supported on DataFrames",
                ));
            };
            let (row_sel, col_sel) = split_indexer(index);
            let snapshot = frame.borrow().clone();
            let rows = match kind {
                IndexerKind::Loc => loc_rows(&snapshot, &row_sel)?,
                IndexerKind::Iloc => iloc_rows(&snapshot, &row_sel)?,
            };
            let rows = match rows {
                Rows::One(r) => vec![r],
                Rows::Many(rs) => rs,
            };
            let column = match (kind, col_sel.as_ref()) {
                (IndexerKind::Loc, Some(Value::Str(c))) => c.clone(),
                (IndexerKind::Iloc, Some(v)) => match iloc_cols(&snapshot, Some(v))? {
                    Cols::One(c) => c,
                    _ => {
                        return Err(ScriptError::value(
                            "assignment to several columns at once is not supported",
                        ))
                    }
                },
                _ => {
                    return Err(ScriptError::value(
                        "indexed assignment needs a row selector and one column",
                    ))
                }
            };
            let mut current = match snapshot.position(&column) {
                Ok(p) => snapshot.data[p].clone(),
                Err(_) => vec![Scalar::Null; snapshot.nrows()],
            };
            let replacement: Vec<Scalar> = match &value {
                Value::Series(series) if series.len() == snapshot.nrows() => {
                    rows.iter().map(|&r| series.values[r].clone()).collect()
                }
                Value::Series(series) => {
                    if series.len() != rows.len() {
                        return Err(ScriptError::value(
                            "shape mismatch: value cannot be broadcast to the selected rows",
                        ));
                    }
                    series.values.clone()
                }
                other => broadcast(other, rows.len())?,
            };
            for (r, v) in rows.iter().zip(replacement) {
                current[*r] = v;
            }
            frame.borrow_mut().set_column(&column, current)
        }
        Value::Series(_) => Err(ScriptError::type_error(
            "Series values cannot be modified in place; assign to a frame column instead",
        )),
        other => Err(ScriptError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

pub fn del_item(obj: &Value, index: &Value) -> ScriptResult<()> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = position(items.len(), index.as_int()?, "list assignment")?;
            items.remove(i);
            Ok(())
        }
        Value::Dict(entries) => entries
            .borrow_mut()
            .shift_remove(&index.to_key()?)
            .map(|_| ())
            .ok_or_else(|| ScriptError::key(index.repr())),
        Value::Frame(frame) => {
            let name = index.as_str()?.to_string();
            let dropped = frame.borrow().drop_columns(&[name])?;
            *frame.borrow_mut() = dropped;
            Ok(())
        }
        other => Err(ScriptError::type_error(format!(
            "'{}' object doesn't support item deletion",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: Vec<Scalar>) -> Value {
        Value::series(Series::new(Some("v".into()), values))
    }

    #[test]
    fn test_python_integer_semantics() {
        assert!(matches!(binary(&Value::Int(7), BinOp::FloorDiv, &Value::Int(-2)).unwrap(), Value::Int(-4)));
        assert!(matches!(binary(&Value::Int(-7), BinOp::Mod, &Value::Int(3)).unwrap(), Value::Int(2)));
        assert!(matches!(binary(&Value::Int(1), BinOp::Div, &Value::Int(4)).unwrap(), Value::Float(f) if f == 0.25));
        assert!(matches!(binary(&Value::Int(2), BinOp::Pow, &Value::Int(10)).unwrap(), Value::Int(1024)));
        let err = binary(&Value::Int(1), BinOp::Div, &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ZeroDivision);
    }

    #[test]
    fn test_series_arithmetic_propagates_nulls() {
        let s = series(vec![Scalar::Int(1), Scalar::Null, Scalar::Int(3)]);
        let Value::Series(out) = binary(&s, BinOp::Mul, &Value::Int(10)).unwrap() else {
            panic!("expected a series");
        };
        assert_eq!(out.values, vec![Scalar::Int(10), Scalar::Null, Scalar::Int(30)]);
        assert_eq!(out.name.as_deref(), Some("v"));
    }

    #[test]
    fn test_series_comparison_and_mask_ops() {
        let s = series(vec![Scalar::Int(1), Scalar::Int(5), Scalar::Null]);
        let gt = compare(&s, CmpOp::Gt, &Value::Int(2)).unwrap();
        let ne = compare(&s, CmpOp::Ne, &Value::Int(5)).unwrap();
        let Value::Series(both) = binary(&gt, BinOp::BitOr, &ne).unwrap() else {
            panic!("expected a series");
        };
        assert_eq!(
            both.values,
            vec![Scalar::Bool(true), Scalar::Bool(true), Scalar::Bool(true)]
        );
        let Value::Series(inverted) = unary(UnaryOp::Invert, &gt).unwrap() else {
            panic!("expected a series");
        };
        assert_eq!(
            inverted.values,
            vec![Scalar::Bool(true), Scalar::Bool(false), Scalar::Bool(true)]
        );
    }

    #[test]
    fn test_text_vs_number_ordering_is_type_error() {
        let s = series(vec![Scalar::Text("a".into())]);
        assert!(compare(&s, CmpOp::Lt, &Value::Int(1)).is_err());
        let Value::Series(eq) = compare(&s, CmpOp::Eq, &Value::Int(1)).unwrap() else {
            panic!("expected a series");
        };
        assert_eq!(eq.values, vec![Scalar::Bool(false)]);
    }

    #[test]
    fn test_slices() {
        assert_eq!(slice_positions(5, Some(1), Some(-1), None).unwrap(), vec![1, 2, 3]);
        assert_eq!(slice_positions(4, None, None, Some(-1)).unwrap(), vec![3, 2, 1, 0]);
        assert!(slice_positions(4, None, None, Some(0)).is_err());
        let word = Value::Str("2024-03-15".into());
        let month = get_item(&word, &Value::Slice(None, Some(7), None)).unwrap();
        assert_eq!(month.to_str(), "2024-03");
    }

    #[test]
    fn test_percent_format() {
        let out = binary(
            &Value::Str("%s: %.1f%%".into()),
            BinOp::Mod,
            &Value::tuple(vec![Value::Str("growth".into()), Value::Float(12.34)]),
        )
        .unwrap();
        assert_eq!(out.to_str(), "growth: 12.3%");
    }

    #[test]
    fn test_loc_mask_assignment() {
        let frame = DataFrame::new(
            vec!["x".into()],
            vec![vec![Scalar::Int(1), Scalar::Int(5)]],
        )
        .unwrap();
        let frame = Value::frame(frame);
        let column = get_item(&frame, &Value::Str("x".into())).unwrap();
        let mask = compare(&column, CmpOp::Gt, &Value::Int(2)).unwrap();
        let loc = Value::Indexer(Box::new(frame.clone()), IndexerKind::Loc);
        set_item(
            &loc,
            &Value::tuple(vec![mask, Value::Str("flag".into())]),
            Value::Str("big".into()),
        )
        .unwrap();
        let Value::Frame(frame) = frame else { unreachable!() };
        let frame = frame.borrow();
        assert_eq!(frame.columns, vec!["x", "flag"]);
        assert_eq!(frame.data[1], vec![Scalar::Null, Scalar::Text("big".into())]);
    }
}
