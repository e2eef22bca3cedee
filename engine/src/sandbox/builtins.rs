//! The allow-listed built-in functions and the `pd` namespace.
//!
//! Nothing outside these tables is reachable from a script: there is no
//! `open`, `__import__`, `getattr` or environment access.

use super::error::{ErrorKind, ScriptError, ScriptResult};
use super::frame::{concat_frames, DataFrame, Index, Series};
use super::interpreter::{Args, Interpreter};
use super::methods::sort_items;
use super::ops;
use super::parser::BinOp;
use super::table_methods;
use super::value::{compare_values, range_len, Key, Value};
use crate::datasets::{format_datetime, parse_datetime};
use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use sdk::Scalar;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Functions reachable by bare name
const BUILTINS: &[&str] = &[
    "len", "range", "list", "dict", "tuple", "set", "sum", "min", "max", "abs", "round", "sorted",
    "reversed", "enumerate", "zip", "print", "type", "isinstance", "str", "int", "float", "bool",
    "any", "all", "map", "filter", "repr", "concat", "merge", "DataFrame",
];

const EXCEPTIONS: &[&str] = &[
    "Exception", "ValueError", "TypeError", "KeyError", "IndexError", "AttributeError",
    "ZeroDivisionError", "NameError", "RuntimeError",
];

/// Attributes of the `pd` namespace
const PANDAS: &[&str] = &[
    "DataFrame", "Series", "concat", "merge", "to_datetime", "to_numeric", "isna", "isnull",
    "notna", "notnull",
];

pub fn lookup(name: &str) -> Option<Value> {
    if name == "pd" {
        return Some(Value::Module("pd"));
    }
    BUILTINS
        .iter()
        .chain(EXCEPTIONS.iter())
        .find(|b| **b == name)
        .map(|b| Value::Builtin(*b))
}

pub fn module_attr(module: &str, name: &str) -> ScriptResult<Value> {
    if let Some(found) = PANDAS.iter().find(|p| **p == name) {
        return Ok(Value::Builtin(*found));
    }
    match name {
        "NA" | "NaT" => Ok(Value::None),
        _ => Err(ScriptError::attribute(format!(
            "module '{}' has no attribute '{}'",
            module, name
        ))),
    }
}

fn arity(name: &str, args: &Args, min: usize, max: usize) -> ScriptResult<()> {
    let n = args.pos.len();
    if n < min || n > max {
        return Err(ScriptError::type_error(format!(
            "{}() takes {} positional arguments but {} were given",
            name,
            if min == max {
                min.to_string()
            } else {
                format!("{} to {}", min, max)
            },
            n
        )));
    }
    Ok(())
}

pub fn call(interp: &mut Interpreter, name: &str, args: Args) -> ScriptResult<Value> {
    if let Some(kind) = ErrorKind::from_name(name) {
        let message = args.pos.first().map(Value::to_str).unwrap_or_default();
        return Ok(Value::Error(kind, message));
    }
    match name {
        "len" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Int(length(&args.pos[0])? as i64))
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let ints = args
                .pos
                .iter()
                .map(Value::as_int)
                .collect::<ScriptResult<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => return Err(ScriptError::type_error("range expected at most 3 arguments")),
            };
            if step == 0 {
                return Err(ScriptError::value("range() arg 3 must not be zero"));
            }
            Ok(Value::Range(start, stop, step))
        }
        "list" => {
            arity(name, &args, 0, 1)?;
            match args.pos.first() {
                Some(v) => Ok(Value::list(v.iter_values()?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        "tuple" => {
            arity(name, &args, 0, 1)?;
            match args.pos.first() {
                Some(v) => Ok(Value::tuple(v.iter_values()?)),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        // Sets are represented as de-duplicated lists in first-seen order
        "set" => {
            arity(name, &args, 0, 1)?;
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            if let Some(v) = args.pos.first() {
                for item in v.iter_values()? {
                    if seen.insert(item.to_key()?) {
                        out.push(item);
                    }
                }
            }
            Ok(Value::list(out))
        }
        "dict" => {
            arity(name, &args, 0, 1)?;
            let mut entries = IndexMap::new();
            match args.pos.first() {
                Some(Value::Dict(other)) => entries.extend(other.borrow().clone()),
                Some(pairs) => {
                    for pair in pairs.iter_values()? {
                        let parts = pair.iter_values()?;
                        if parts.len() != 2 {
                            return Err(ScriptError::value(
                                "dictionary update sequence element has wrong length",
                            ));
                        }
                        entries.insert(parts[0].to_key()?, parts[1].clone());
                    }
                }
                None => {}
            }
            for (k, v) in args.kw {
                entries.insert(Key::Str(k), v);
            }
            Ok(Value::dict(entries))
        }
        "sum" => {
            arity(name, &args, 1, 2)?;
            if let Value::Series(series) = &args.pos[0] {
                return Ok(Value::from_scalar(&series.reduce(super::frame::AggFunc::Sum)?));
            }
            let mut total = args.get(1, "start").cloned().unwrap_or(Value::Int(0));
            for item in args.pos[0].iter_values()? {
                total = ops::binary(&total, BinOp::Add, &item)?;
            }
            Ok(total)
        }
        "min" | "max" => extreme(interp, name, &args),
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args.pos[0] {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| ScriptError::value("integer overflow")),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Series(series) => {
                    table_methods::series_method(interp, series, "abs", Args::default())
                }
                Value::Frame(frame) => {
                    table_methods::frame_method(interp, frame, "abs", Args::default())
                }
                other => Err(ScriptError::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let digits = args.get(1, "ndigits").filter(|v| !v.is_none());
            match &args.pos[0] {
                Value::Series(series) => {
                    let mut forwarded = Args::default();
                    if let Some(d) = digits {
                        forwarded.pos.push(d.clone());
                    }
                    table_methods::series_method(interp, series, "round", forwarded)
                }
                Value::Frame(frame) => {
                    let mut forwarded = Args::default();
                    if let Some(d) = digits {
                        forwarded.pos.push(d.clone());
                    }
                    table_methods::frame_method(interp, frame, "round", forwarded)
                }
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Float(f) => match digits {
                    None => {
                        let rounded = round_half_even(*f, 0);
                        if rounded.is_finite() {
                            Ok(Value::Int(rounded as i64))
                        } else {
                            Err(ScriptError::value("cannot convert float NaN or infinity to integer"))
                        }
                    }
                    Some(d) => Ok(Value::Float(round_half_even(*f, d.as_int()?))),
                },
                other => Err(ScriptError::type_error(format!(
                    "type {} doesn't define __round__ method",
                    other.type_name()
                ))),
            }
        }
        "sorted" => {
            arity(name, &args, 1, 1)?;
            let items = args.pos[0].iter_values()?;
            let reverse = args.flag(usize::MAX, "reverse", false)?;
            Ok(Value::list(sort_items(interp, items, args.kw("key"), reverse)?))
        }
        "reversed" => {
            arity(name, &args, 1, 1)?;
            let mut items = args.pos[0].iter_values()?;
            items.reverse();
            Ok(Value::list(items))
        }
        "enumerate" => {
            arity(name, &args, 1, 2)?;
            let start = args.int(1, "start", 0)?;
            Ok(Value::list(
                args.pos[0]
                    .iter_values()?
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                    .collect(),
            ))
        }
        "zip" => {
            let columns = args
                .pos
                .iter()
                .map(Value::iter_values)
                .collect::<ScriptResult<Vec<_>>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::list(
                (0..len)
                    .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                    .collect(),
            ))
        }
        "print" => {
            let sep = match args.kw("sep") {
                Some(Value::None) | None => " ".to_string(),
                Some(v) => v.as_str()?.to_string(),
            };
            let text: Vec<String> = args.pos.iter().map(Value::to_str).collect();
            interp.print(&text.join(&sep));
            Ok(Value::None)
        }
        "type" => {
            arity(name, &args, 1, 1)?;
            Ok(match &args.pos[0] {
                Value::Int(_) => Value::Builtin("int"),
                Value::Float(_) => Value::Builtin("float"),
                Value::Str(_) => Value::Builtin("str"),
                Value::Bool(_) => Value::Builtin("bool"),
                Value::List(_) => Value::Builtin("list"),
                Value::Tuple(_) => Value::Builtin("tuple"),
                Value::Dict(_) => Value::Builtin("dict"),
                Value::Frame(_) => Value::Builtin("DataFrame"),
                Value::Series(_) => Value::Builtin("Series"),
                other => Value::Str(format!("<class '{}'>", other.type_name())),
            })
        }
        "isinstance" => {
            arity(name, &args, 2, 2)?;
            let types = match &args.pos[1] {
                Value::Tuple(items) => items.as_ref().clone(),
                other => vec![other.clone()],
            };
            let value = &args.pos[0];
            let mut matched = false;
            for t in &types {
                let Value::Builtin(t) = t else {
                    return Err(ScriptError::type_error(
                        "isinstance() arg 2 must be a type or tuple of types",
                    ));
                };
                matched |= matches!(
                    (*t, value),
                    ("int", Value::Int(_) | Value::Bool(_))
                        | ("float", Value::Float(_))
                        | ("str", Value::Str(_))
                        | ("bool", Value::Bool(_))
                        | ("list", Value::List(_))
                        | ("tuple", Value::Tuple(_))
                        | ("dict", Value::Dict(_))
                        | ("DataFrame", Value::Frame(_))
                        | ("Series", Value::Series(_))
                ) || matches!(value, Value::Error(kind, _) if ErrorKind::from_name(t) == Some(*kind) || *t == "Exception");
            }
            Ok(Value::Bool(matched))
        }
        "str" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Str(args.pos.first().map(Value::to_str).unwrap_or_default()))
        }
        "repr" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args.pos[0].repr()))
        }
        "int" => {
            arity(name, &args, 0, 1)?;
            match args.pos.first() {
                None => Ok(Value::Int(0)),
                Some(v) => convert(v, "int"),
            }
        }
        "float" => {
            arity(name, &args, 0, 1)?;
            match args.pos.first() {
                None => Ok(Value::Float(0.0)),
                Some(v) => convert(v, "float"),
            }
        }
        "bool" => {
            arity(name, &args, 0, 1)?;
            match args.pos.first() {
                None => Ok(Value::Bool(false)),
                Some(v) => Ok(Value::Bool(v.truthy()?)),
            }
        }
        "any" | "all" => {
            arity(name, &args, 1, 1)?;
            let want_any = name == "any";
            for item in args.pos[0].iter_values()? {
                if item.truthy()? == want_any {
                    return Ok(Value::Bool(want_any));
                }
            }
            Ok(Value::Bool(!want_any))
        }
        "map" => {
            arity(name, &args, 2, 2)?;
            let func = args.pos[0].clone();
            let mut out = Vec::new();
            for item in args.pos[1].iter_values()? {
                out.push(interp.call(&func, Args::positional(vec![item]))?);
            }
            Ok(Value::list(out))
        }
        "filter" => {
            arity(name, &args, 2, 2)?;
            let func = args.pos[0].clone();
            let mut out = Vec::new();
            for item in args.pos[1].iter_values()? {
                let keep = if func.is_none() {
                    item.truthy()?
                } else {
                    interp.call(&func, Args::positional(vec![item.clone()]))?.truthy()?
                };
                if keep {
                    out.push(item);
                }
            }
            Ok(Value::list(out))
        }
        "concat" => concat(&args),
        "merge" => {
            let left = frame_arg(args.required(0, "left", "merge")?, "merge")?;
            let right = frame_arg(args.required(1, "right", "merge")?, "merge")?;
            table_methods::merge_frames(&left, &right, &args, 2)
        }
        "DataFrame" => build_frame(&args),
        "Series" => build_series(&args),
        "to_datetime" => to_datetime(&args),
        "to_numeric" => to_numeric(&args),
        "isna" | "isnull" | "notna" | "notnull" => {
            let want_null = name.starts_with("isn");
            match args.required(0, "obj", name)? {
                Value::Series(series) => table_methods::series_method(
                    interp,
                    series,
                    if want_null { "isna" } else { "notna" },
                    Args::default(),
                ),
                Value::Frame(frame) => table_methods::frame_method(
                    interp,
                    frame,
                    if want_null { "isna" } else { "notna" },
                    Args::default(),
                ),
                v => {
                    let null = v.is_none() || matches!(v, Value::Float(f) if f.is_nan());
                    Ok(Value::Bool(null == want_null))
                }
            }
        }
        other => Err(ScriptError::name(format!("name '{}' is not defined", other))),
    }
}

fn length(value: &Value) -> ScriptResult<usize> {
    Ok(match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(entries) => entries.borrow().len(),
        Value::Range(start, stop, step) => range_len(*start, *stop, *step) as usize,
        Value::Frame(frame) => frame.borrow().nrows(),
        Value::Series(series) => series.len(),
        Value::GroupBy(group_by) => group_by.ngroups()?,
        other => {
            return Err(ScriptError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    })
}

/// Round half to even at `digits` decimal places
fn round_half_even(value: f64, digits: i64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    if digits < 0 {
        let factor = 10f64.powi((-digits) as i32);
        return round_half_even(value / factor, 0) * factor;
    }
    format!("{:.*}", digits as usize, value)
        .parse()
        .unwrap_or(value)
}

fn extreme(interp: &mut Interpreter, name: &str, args: &Args) -> ScriptResult<Value> {
    let items = match args.pos.as_slice() {
        [] => {
            return Err(ScriptError::type_error(format!(
                "{} expected at least 1 argument, got 0",
                name
            )))
        }
        [Value::Series(series)] => {
            let func = if name == "min" {
                super::frame::AggFunc::Min
            } else {
                super::frame::AggFunc::Max
            };
            return Ok(Value::from_scalar(&series.reduce(func)?));
        }
        [single] => single.iter_values()?,
        many => many.to_vec(),
    };
    if items.is_empty() {
        return args.kw("default").cloned().ok_or_else(|| {
            ScriptError::value(format!("{}() arg is an empty sequence", name))
        });
    }
    let key = args.kw("key").filter(|k| !k.is_none()).cloned();
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let k = match &key {
            Some(func) => interp.call(func, Args::positional(vec![item.clone()]))?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_key, _)) => {
                let ord = compare_values(&k, best_key)?;
                if name == "min" {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                }
            }
        };
        if replace {
            best = Some((k, item));
        }
    }
    Ok(best.map(|(_, v)| v).unwrap_or(Value::None))
}

fn convert(value: &Value, target: &str) -> ScriptResult<Value> {
    match (target, value) {
        ("int", Value::Int(i)) => Ok(Value::Int(*i)),
        ("int", Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
        ("int", Value::Float(f)) => {
            if f.is_finite() {
                Ok(Value::Int(f.trunc() as i64))
            } else {
                Err(ScriptError::value("cannot convert float NaN or infinity to integer"))
            }
        }
        ("int", Value::Str(s)) => s
            .trim()
            .replace('_', "")
            .parse()
            .map(Value::Int)
            .map_err(|_| ScriptError::value(format!("invalid literal for int() with base 10: '{}'", s))),
        ("float", Value::Int(i)) => Ok(Value::Float(*i as f64)),
        ("float", Value::Bool(b)) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        ("float", Value::Float(f)) => Ok(Value::Float(*f)),
        ("float", Value::Str(s)) => {
            let t = s.trim().to_ascii_lowercase();
            match t.as_str() {
                "nan" => Ok(Value::Float(f64::NAN)),
                "inf" | "infinity" => Ok(Value::Float(f64::INFINITY)),
                "-inf" | "-infinity" => Ok(Value::Float(f64::NEG_INFINITY)),
                _ => t.parse().map(Value::Float).map_err(|_| {
                    ScriptError::value(format!("could not convert string to float: '{}'", s))
                }),
            }
        }
        (_, Value::None) => Err(ScriptError::type_error(format!(
            "{}() argument must be a string or a number, not 'NoneType'",
            target
        ))),
        (_, other) => Err(ScriptError::type_error(format!(
            "{}() argument must be a string or a number, not '{}'",
            target,
            other.type_name()
        ))),
    }
}

fn frame_arg(value: &Value, func: &str) -> ScriptResult<DataFrame> {
    match value {
        Value::Frame(frame) => Ok(frame.borrow().clone()),
        Value::Series(series) => Ok(series.to_frame()),
        other => Err(ScriptError::type_error(format!(
            "{}() expects DataFrame objects, got {}",
            func,
            other.type_name()
        ))),
    }
}

fn concat(args: &Args) -> ScriptResult<Value> {
    let objs = args.required(0, "objs", "concat")?.iter_values()?;
    if objs.is_empty() {
        return Err(ScriptError::value("No objects to concatenate"));
    }
    let ignore_index = args.flag(usize::MAX, "ignore_index", false)?;
    let by_columns = matches!(args.kw("axis"), Some(Value::Int(1)))
        || matches!(args.kw("axis"), Some(Value::Str(s)) if s == "columns");

    if by_columns {
        let mut out = DataFrame::default();
        let mut first = true;
        for obj in &objs {
            let frame = frame_arg(obj, "concat")?;
            if first {
                out = frame;
                first = false;
                continue;
            }
            if frame.nrows() != out.nrows() {
                return Err(ScriptError::value(
                    "concat along columns needs frames of equal length",
                ));
            }
            for (name, column) in frame.columns.iter().zip(frame.data.iter()) {
                out.set_column(name, column.clone())?;
            }
        }
        return Ok(Value::frame(out));
    }

    if objs.iter().all(|o| matches!(o, Value::Series(_))) {
        let mut values = Vec::new();
        let mut labels = Vec::new();
        let mut name = None;
        for (i, obj) in objs.iter().enumerate() {
            if let Value::Series(series) = obj {
                values.extend(series.values.iter().cloned());
                labels.extend(series.index.labels());
                if i == 0 {
                    name = series.name.clone();
                } else if name != series.name {
                    name = None;
                }
            }
        }
        let mut series = Series::new(name, values);
        if !ignore_index {
            if let Ok(cells) = labels.iter().map(Value::to_scalar).collect::<ScriptResult<Vec<_>>>() {
                series.index = Index::Rows(cells);
            }
        }
        return Ok(Value::series(series));
    }

    let frames = objs
        .iter()
        .map(|o| frame_arg(o, "concat"))
        .collect::<ScriptResult<Vec<_>>>()?;
    Ok(Value::frame(concat_frames(&frames, ignore_index)))
}

fn build_frame(args: &Args) -> ScriptResult<Value> {
    let wanted = args.names(1, "columns")?;
    let mut frame = match args.get(0, "data") {
        None | Some(Value::None) => DataFrame::default(),
        Some(Value::Dict(entries)) => {
            let entries = entries.borrow();
            let mut columns = Vec::new();
            let mut data = Vec::new();
            let len = entries
                .values()
                .filter(|v| !is_scalar_like(v))
                .map(|v| length(v).unwrap_or(1))
                .max()
                .unwrap_or(1);
            for (k, v) in entries.iter() {
                columns.push(k.label());
                let cells = if is_scalar_like(v) {
                    vec![v.to_scalar()?; len]
                } else {
                    v.iter_values()?
                        .iter()
                        .map(Value::to_scalar)
                        .collect::<ScriptResult<Vec<_>>>()?
                };
                if cells.len() != len {
                    return Err(ScriptError::value("All arrays must be of the same length"));
                }
                data.push(cells);
            }
            DataFrame::new(columns, data)?
        }
        Some(rows @ (Value::List(_) | Value::Tuple(_))) => {
            let rows = rows.iter_values()?;
            let mut columns: Vec<String> = Vec::new();
            let mut records: Vec<Vec<(String, Scalar)>> = Vec::new();
            for row in &rows {
                let cells = match row {
                    Value::Dict(entries) => entries
                        .borrow()
                        .iter()
                        .map(|(k, v)| Ok((k.label(), v.to_scalar()?)))
                        .collect::<ScriptResult<Vec<_>>>()?,
                    other => other
                        .iter_values()?
                        .iter()
                        .enumerate()
                        .map(|(i, v)| {
                            let name = wanted
                                .as_ref()
                                .and_then(|w| w.get(i).cloned())
                                .unwrap_or_else(|| i.to_string());
                            Ok((name, v.to_scalar()?))
                        })
                        .collect::<ScriptResult<Vec<_>>>()?,
                };
                for (name, _) in &cells {
                    if !columns.contains(name) {
                        columns.push(name.clone());
                    }
                }
                records.push(cells);
            }
            let data = columns
                .iter()
                .map(|c| {
                    records
                        .iter()
                        .map(|rec| {
                            rec.iter()
                                .find(|(n, _)| n == c)
                                .map(|(_, v)| v.clone())
                                .unwrap_or(Scalar::Null)
                        })
                        .collect()
                })
                .collect();
            DataFrame::new(columns, data)?
        }
        Some(Value::Frame(frame)) => frame.borrow().clone(),
        Some(other) => {
            return Err(ScriptError::type_error(format!(
                "DataFrame constructor not properly called with {}",
                other.type_name()
            )))
        }
    };
    if let Some(wanted) = wanted {
        if frame.columns.iter().all(|c| wanted.contains(c)) || frame.columns == wanted {
            let present: Vec<String> = wanted
                .iter()
                .filter(|c| frame.columns.contains(c))
                .cloned()
                .collect();
            frame = frame.select(&present)?;
        }
    }
    Ok(Value::frame(frame))
}

fn is_scalar_like(value: &Value) -> bool {
    matches!(
        value,
        Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
    )
}

fn build_series(args: &Args) -> ScriptResult<Value> {
    let name = args.string(usize::MAX, "name")?;
    let series = match args.get(0, "data") {
        None | Some(Value::None) => Series::new(name, Vec::new()),
        Some(Value::Dict(entries)) => {
            let entries = entries.borrow();
            let labels = entries
                .keys()
                .map(|k| k.to_value().to_scalar())
                .collect::<ScriptResult<Vec<_>>>()?;
            let values = entries
                .values()
                .map(Value::to_scalar)
                .collect::<ScriptResult<Vec<_>>>()?;
            let mut series = Series::new(name, values);
            series.index = Index::Rows(labels);
            series
        }
        Some(Value::Series(series)) => {
            let mut copy = series.as_ref().clone();
            if name.is_some() {
                copy.name = name;
            }
            copy
        }
        Some(data) => Series::new(
            name,
            data.iter_values()?
                .iter()
                .map(Value::to_scalar)
                .collect::<ScriptResult<Vec<_>>>()?,
        ),
    };
    let mut series = series;
    if let Some(index) = args.kw("index") {
        let labels = index
            .iter_values()?
            .iter()
            .map(Value::to_scalar)
            .collect::<ScriptResult<Vec<_>>>()?;
        if labels.len() != series.len() {
            return Err(ScriptError::value(format!(
                "Length of values ({}) does not match length of index ({})",
                series.len(),
                labels.len()
            )));
        }
        series.index = Index::Rows(labels);
    }
    Ok(Value::series(series))
}

fn parse_with_format(text: &str, format: Option<&str>) -> Option<NaiveDateTime> {
    match format {
        Some(fmt) => NaiveDateTime::parse_from_str(text.trim(), fmt).ok().or_else(|| {
            NaiveDate::parse_from_str(text.trim(), fmt)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        }),
        None => parse_datetime(text),
    }
}

fn to_datetime(args: &Args) -> ScriptResult<Value> {
    let coerce = matches!(args.kw("errors"), Some(Value::Str(s)) if s == "coerce");
    let format = args.string(usize::MAX, "format")?;
    let convert_cell = |cell: &Scalar| -> ScriptResult<Scalar> {
        match cell {
            Scalar::Null => Ok(Scalar::Null),
            Scalar::Text(s) => match parse_with_format(s, format.as_deref()) {
                Some(dt) => Ok(Scalar::Text(format_datetime(&dt))),
                None if coerce => Ok(Scalar::Null),
                None => Err(ScriptError::value(format!(
                    "Unknown datetime string format, unable to parse: {}",
                    s
                ))),
            },
            Scalar::Int(year) if (1000..=9999).contains(year) && format.as_deref() == Some("%Y") => {
                Ok(Scalar::Text(format!("{}-01-01", year)))
            }
            _ if coerce => Ok(Scalar::Null),
            other => Err(ScriptError::value(format!(
                "cannot convert {} to a datetime",
                Value::from_scalar(other).repr()
            ))),
        }
    };
    match args.required(0, "arg", "to_datetime")? {
        Value::Series(series) => {
            let values = series
                .values
                .iter()
                .map(&convert_cell)
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(Value::series(series.with_values(values)))
        }
        list @ (Value::List(_) | Value::Tuple(_)) => {
            let values = list
                .iter_values()?
                .iter()
                .map(|v| convert_cell(&v.to_scalar()?))
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(Value::series(Series::new(None, values)))
        }
        scalar => Ok(Value::from_scalar(&convert_cell(&scalar.to_scalar()?)?)),
    }
}

fn to_numeric(args: &Args) -> ScriptResult<Value> {
    let coerce = matches!(args.kw("errors"), Some(Value::Str(s)) if s == "coerce");
    let convert_cell = |cell: &Scalar| -> ScriptResult<Scalar> {
        match cell {
            Scalar::Text(s) => {
                let parsed = Scalar::parse_cell(s);
                if parsed.is_numeric() || parsed.is_null() {
                    Ok(parsed)
                } else if coerce {
                    Ok(Scalar::Null)
                } else {
                    Err(ScriptError::value(format!("Unable to parse string \"{}\"", s)))
                }
            }
            Scalar::Bool(b) => Ok(Scalar::Int(i64::from(*b))),
            other => Ok(other.clone()),
        }
    };
    match args.required(0, "arg", "to_numeric")? {
        Value::Series(series) => {
            let values = series
                .values
                .iter()
                .map(&convert_cell)
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(Value::series(series.with_values(values)))
        }
        scalar => Ok(Value::from_scalar(&convert_cell(&scalar.to_scalar()?)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::value::{format_float, values_equal};

    fn call_plain(name: &str, pos: Vec<Value>) -> ScriptResult<Value> {
        let mut interp = Interpreter::new();
        call(&mut interp, name, Args::positional(pos))
    }

    #[test]
    fn test_lookup_is_allow_list() {
        assert!(lookup("len").is_some());
        assert!(lookup("pd").is_some());
        for name in ["open", "eval", "exec", "__import__", "getattr", "globals", "input"] {
            assert!(lookup(name).is_none(), "{} should not be reachable", name);
        }
        assert!(module_attr("pd", "read_csv").is_err());
    }

    #[test]
    fn test_round_half_even() {
        assert!(matches!(call_plain("round", vec![Value::Float(2.5)]), Ok(Value::Int(2))));
        assert!(matches!(call_plain("round", vec![Value::Float(3.5)]), Ok(Value::Int(4))));
        match call_plain("round", vec![Value::Float(1.23456), Value::Int(2)]) {
            Ok(Value::Float(f)) => assert_eq!(format_float(f), "1.23"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_min_max_and_sum() {
        let list = Value::list(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert!(matches!(call_plain("min", vec![list.clone()]), Ok(Value::Int(1))));
        assert!(matches!(call_plain("max", vec![Value::Int(4), Value::Int(9)]), Ok(Value::Int(9))));
        assert!(matches!(call_plain("sum", vec![list]), Ok(Value::Int(6))));
        assert!(call_plain("max", vec![Value::list(Vec::new())]).is_err());
    }

    #[test]
    fn test_int_and_float_conversion() {
        assert!(matches!(call_plain("int", vec![Value::Str(" 42 ".into())]), Ok(Value::Int(42))));
        assert!(matches!(call_plain("int", vec![Value::Float(-2.7)]), Ok(Value::Int(-2))));
        let err = call_plain("float", vec![Value::Str("abc".into())]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Value);
    }

    #[test]
    fn test_set_dedups_in_order() {
        let list = Value::list(vec![Value::Int(2), Value::Int(1), Value::Int(2)]);
        let out = call_plain("set", vec![list]).unwrap();
        assert_eq!(out.repr(), "[2, 1]");
        assert!(values_equal(&out, &Value::list(vec![Value::Int(2), Value::Int(1)])));
    }

    #[test]
    fn test_exception_constructor() {
        match call_plain("ValueError", vec![Value::Str("bad".into())]) {
            Ok(Value::Error(ErrorKind::Value, msg)) => assert_eq!(msg, "bad"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_to_datetime_coerce() {
        let series = Value::series(Series::new(
            None,
            vec![Scalar::Text("2024-03-05".into()), Scalar::Text("soon".into())],
        ));
        let mut args = Args::positional(vec![series.clone()]);
        assert!(to_datetime(&args).is_err());
        args.kw.insert("errors".into(), Value::Str("coerce".into()));
        match to_datetime(&args).unwrap() {
            Value::Series(s) => assert_eq!(
                s.values,
                vec![Scalar::Text("2024-03-05".into()), Scalar::Null]
            ),
            other => panic!("unexpected {:?}", other),
        }
    }
}
