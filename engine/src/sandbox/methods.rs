//! Attribute access and methods of the non-tabular values, plus the
//! `.str` and `.dt` accessors.

use super::builtins;
use super::error::{ScriptError, ScriptResult};
use super::frame::{Selection, Series};
use super::interpreter::{string_list, Args, Interpreter};
use super::table_methods::{self, FRAME_METHODS, GROUPBY_METHODS, SERIES_METHODS};
use super::value::{compare_values, format_value, values_equal, AccessorKind, IndexerKind, Key, Value};
use crate::datasets::{format_datetime, parse_datetime};
use chrono::{Datelike, NaiveDateTime, Timelike};
use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};
use sdk::Scalar;
use std::rc::Rc;

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "title", "capitalize", "split", "join",
    "replace", "startswith", "endswith", "find", "count", "format", "isdigit", "isnumeric",
    "isalpha", "zfill",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "sort", "reverse", "copy",
    "tolist", "to_list",
];

const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "update", "pop", "setdefault", "copy",
];

const STR_ACCESSOR_METHODS: &[&str] = &[
    "contains", "lower", "upper", "strip", "lstrip", "rstrip", "title", "capitalize",
    "startswith", "endswith", "len", "replace", "slice", "get", "zfill", "count", "match", "find",
    "isdigit", "isnumeric", "isalpha",
];

const DT_METHODS: &[&str] = &["month_name", "day_name", "strftime", "to_period", "normalize"];

fn method(obj: &Value, name: &str) -> Value {
    Value::Method(Box::new(obj.clone()), name.to_string())
}

fn no_attribute(obj: &Value, name: &str) -> ScriptError {
    ScriptError::attribute(format!(
        "'{}' object has no attribute '{}'",
        obj.type_name(),
        name
    ))
}

/// pandas dtype name of a column
pub fn dtype_name(cells: &[Scalar]) -> &'static str {
    let present: Vec<&Scalar> = cells.iter().filter(|c| !c.is_null()).collect();
    if present.is_empty() {
        return "object";
    }
    if present.iter().all(|c| matches!(c, Scalar::Bool(_))) {
        "bool"
    } else if present.iter().all(|c| matches!(c, Scalar::Int(_))) {
        if present.len() == cells.len() {
            "int64"
        } else {
            "float64"
        }
    } else if present.iter().all(|c| c.is_numeric()) {
        "float64"
    } else {
        "object"
    }
}

fn index_value(series: &Series) -> Value {
    let labels = series.index.labels();
    if labels.iter().any(|l| matches!(l, Value::Tuple(_))) {
        return Value::list(labels);
    }
    let cells = labels
        .iter()
        .map(Value::to_scalar)
        .collect::<ScriptResult<Vec<_>>>()
        .unwrap_or_default();
    Value::series(Series::new(None, cells))
}

pub fn get_attr(obj: &Value, name: &str) -> ScriptResult<Value> {
    match obj {
        Value::Frame(frame) => {
            let df = frame.borrow();
            match name {
                "columns" => Ok(Value::list(
                    df.columns.iter().map(|c| Value::Str(c.clone())).collect(),
                )),
                "shape" => Ok(Value::tuple(vec![
                    Value::Int(df.nrows() as i64),
                    Value::Int(df.columns.len() as i64),
                ])),
                "empty" => Ok(Value::Bool(df.nrows() == 0 || df.columns.is_empty())),
                "size" => Ok(Value::Int((df.nrows() * df.columns.len()) as i64)),
                "ndim" => Ok(Value::Int(2)),
                "index" => Ok(index_value(&Series {
                    name: None,
                    values: Vec::new(),
                    index: df.series_index(),
                })),
                "dtypes" => {
                    let names: Vec<Scalar> =
                        df.columns.iter().map(|c| Scalar::Text(c.clone())).collect();
                    let kinds = df
                        .data
                        .iter()
                        .map(|col| Scalar::Text(dtype_name(col).to_string()))
                        .collect();
                    let mut series = Series::new(None, kinds);
                    series.index = super::frame::Index::Keys {
                        names: Vec::new(),
                        labels: names.into_iter().map(|n| vec![n]).collect(),
                    };
                    Ok(Value::series(series))
                }
                "values" => Ok(Value::list(
                    (0..df.nrows())
                        .map(|r| {
                            Value::list(df.data.iter().map(|c| Value::from_scalar(&c[r])).collect())
                        })
                        .collect(),
                )),
                "loc" => Ok(Value::Indexer(Box::new(obj.clone()), IndexerKind::Loc)),
                "iloc" => Ok(Value::Indexer(Box::new(obj.clone()), IndexerKind::Iloc)),
                _ if FRAME_METHODS.contains(&name) => Ok(method(obj, name)),
                _ if df.columns.iter().any(|c| c == name) => Ok(Value::series(df.column(name)?)),
                _ => Err(no_attribute(obj, name)),
            }
        }
        Value::Series(series) => match name {
            "name" => Ok(series.name.clone().map(Value::Str).unwrap_or(Value::None)),
            "values" => Ok(Value::list(
                series.values.iter().map(Value::from_scalar).collect(),
            )),
            "index" => Ok(index_value(series)),
            "shape" => Ok(Value::tuple(vec![Value::Int(series.len() as i64)])),
            "size" => Ok(Value::Int(series.len() as i64)),
            "empty" => Ok(Value::Bool(series.is_empty())),
            "ndim" => Ok(Value::Int(1)),
            "dtype" => Ok(Value::Str(dtype_name(&series.values).to_string())),
            "is_unique" => Ok(Value::Bool(series.unique().len() == series.len())),
            "str" => Ok(Value::Accessor(Rc::clone(series), AccessorKind::Str)),
            "dt" => {
                if series
                    .values
                    .iter()
                    .any(|c| !c.is_null() && datetime_of(c).is_none())
                {
                    return Err(ScriptError::attribute(
                        "Can only use .dt accessor with datetimelike values",
                    ));
                }
                Ok(Value::Accessor(Rc::clone(series), AccessorKind::Dt))
            }
            "loc" => Ok(Value::Indexer(Box::new(obj.clone()), IndexerKind::Loc)),
            "iloc" => Ok(Value::Indexer(Box::new(obj.clone()), IndexerKind::Iloc)),
            _ if SERIES_METHODS.contains(&name) => Ok(method(obj, name)),
            _ => Err(no_attribute(obj, name)),
        },
        Value::GroupBy(group_by) => match name {
            "ngroups" => Ok(Value::Int(group_by.ngroups()? as i64)),
            _ if GROUPBY_METHODS.contains(&name) => Ok(method(obj, name)),
            _ if group_by.frame.columns.iter().any(|c| c == name) => Ok(Value::GroupBy(Rc::new(
                group_by.select(Selection::One(name.to_string()))?,
            ))),
            _ => Err(no_attribute(obj, name)),
        },
        Value::Accessor(series, AccessorKind::Dt) => {
            if DT_METHODS.contains(&name) {
                return Ok(method(obj, name));
            }
            dt_property(series, name)
        }
        Value::Accessor(_, AccessorKind::Str) if STR_ACCESSOR_METHODS.contains(&name) => {
            Ok(method(obj, name))
        }
        Value::Str(_) if STR_METHODS.contains(&name) => Ok(method(obj, name)),
        Value::List(_) if LIST_METHODS.contains(&name) => Ok(method(obj, name)),
        Value::Dict(_) if DICT_METHODS.contains(&name) => Ok(method(obj, name)),
        Value::Module(module) => builtins::module_attr(module, name),
        Value::Error(_, message) if name == "args" => {
            Ok(Value::tuple(vec![Value::Str(message.clone())]))
        }
        Value::Float(f) if name == "is_integer" => Ok(Value::Bool(f.fract() == 0.0)),
        _ => Err(no_attribute(obj, name)),
    }
}

pub fn set_attr(obj: &Value, name: &str, value: Value) -> ScriptResult<()> {
    match obj {
        Value::Frame(frame) if name == "columns" => {
            let names = string_list(&value)?;
            let mut df = frame.borrow_mut();
            if names.len() != df.columns.len() {
                return Err(ScriptError::value(format!(
                    "Length mismatch: Expected axis has {} elements, new values have {} elements",
                    df.columns.len(),
                    names.len()
                )));
            }
            df.columns = names;
            Ok(())
        }
        Value::Frame(frame) if frame.borrow().columns.iter().any(|c| c == name) => {
            let cells = {
                let df = frame.borrow();
                super::ops::column_values(&df, &value)?
            };
            frame.borrow_mut().set_column(name, cells)
        }
        other => Err(ScriptError::attribute(format!(
            "cannot set attribute '{}' on '{}' object",
            name,
            other.type_name()
        ))),
    }
}

pub fn call_method(
    interp: &mut Interpreter,
    recv: &Value,
    name: &str,
    args: Args,
) -> ScriptResult<Value> {
    match recv {
        Value::Frame(frame) => table_methods::frame_method(interp, frame, name, args),
        Value::Series(series) => table_methods::series_method(interp, series, name, args),
        Value::GroupBy(group_by) => table_methods::groupby_method(interp, group_by, name, args),
        Value::Accessor(series, AccessorKind::Str) => str_accessor(series, name, &args),
        Value::Accessor(series, AccessorKind::Dt) => dt_method(series, name, &args),
        Value::Str(s) => str_method(s, name, &args),
        Value::List(_) => list_method(interp, recv, name, &args),
        Value::Dict(_) => dict_method(recv, name, &args),
        other => Err(no_attribute(other, name)),
    }
}

// ---- str ----

fn str_method(s: &str, name: &str, args: &Args) -> ScriptResult<Value> {
    let text = |pos: usize, arg: &str| -> ScriptResult<String> {
        Ok(args.required(pos, arg, name)?.as_str()?.to_string())
    };
    Ok(match name {
        "upper" => Value::Str(s.to_uppercase()),
        "lower" => Value::Str(s.to_lowercase()),
        "strip" | "lstrip" | "rstrip" => {
            let set = args.string(0, "chars")?;
            let strip = |c: char| match &set {
                Some(set) => set.contains(c),
                None => c.is_whitespace(),
            };
            Value::Str(match name {
                "lstrip" => s.trim_start_matches(strip),
                "rstrip" => s.trim_end_matches(strip),
                _ => s.trim_matches(strip),
            }
            .to_string())
        }
        "title" => Value::Str(title_case(s)),
        "capitalize" => {
            let mut chars = s.chars();
            Value::Str(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            })
        }
        "split" => {
            let max = args.int(1, "maxsplit", -1)?;
            let parts: Vec<String> = match args.string(0, "sep")? {
                Some(sep) if sep.is_empty() => return Err(ScriptError::value("empty separator")),
                Some(sep) if max >= 0 => s.splitn(max as usize + 1, sep.as_str()).map(str::to_string).collect(),
                Some(sep) => s.split(sep.as_str()).map(str::to_string).collect(),
                None => s.split_whitespace().map(str::to_string).collect(),
            };
            Value::list(parts.into_iter().map(Value::Str).collect())
        }
        "join" => {
            let items = args.required(0, "iterable", "join")?.iter_values()?;
            let parts = items
                .iter()
                .map(|v| match v {
                    Value::Str(s) => Ok(s.clone()),
                    other => Err(ScriptError::type_error(format!(
                        "sequence item: expected str instance, {} found",
                        other.type_name()
                    ))),
                })
                .collect::<ScriptResult<Vec<_>>>()?;
            Value::Str(parts.join(s))
        }
        "replace" => Value::Str(s.replace(&text(0, "old")?, &text(1, "new")?)),
        "startswith" => Value::Bool(s.starts_with(&text(0, "prefix")?)),
        "endswith" => Value::Bool(s.ends_with(&text(0, "suffix")?)),
        "find" => {
            let needle = text(0, "sub")?;
            Value::Int(
                s.find(&needle)
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            )
        }
        "count" => Value::Int(s.matches(&text(0, "sub")?).count() as i64),
        "format" => Value::Str(str_format(s, args)?),
        "isdigit" | "isnumeric" => {
            Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        }
        "isalpha" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)),
        "zfill" => Value::Str(zfill(s, args.int(0, "width", 0)?)),
        other => return Err(no_attribute(&Value::Str(s.to_string()), other)),
    })
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut start = true;
    for c in s.chars() {
        if c.is_alphabetic() {
            if start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            start = false;
        } else {
            out.push(c);
            start = true;
        }
    }
    out
}

fn zfill(s: &str, width: i64) -> String {
    let len = s.chars().count() as i64;
    if len >= width {
        return s.to_string();
    }
    let pad = "0".repeat((width - len) as usize);
    match s.strip_prefix('-') {
        Some(rest) => format!("-{}{}", pad, rest),
        None => format!("{}{}", pad, s),
    }
}

/// `"{} of {name:.2f}".format(...)`
fn str_format(template: &str, args: &Args) -> ScriptResult<String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut auto = 0;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => field.push(c),
                        None => return Err(ScriptError::value("Single '{' encountered in format string")),
                    }
                }
                let (key, spec) = match field.split_once(':') {
                    Some((k, s)) => (k.to_string(), s.to_string()),
                    None => (field, String::new()),
                };
                let value = if key.is_empty() {
                    auto += 1;
                    args.pos.get(auto - 1)
                } else if let Ok(i) = key.parse::<usize>() {
                    args.pos.get(i)
                } else {
                    args.kw(&key)
                };
                let value = value.ok_or_else(|| {
                    ScriptError::index("Replacement index out of range for positional args tuple")
                })?;
                out.push_str(&format_value(value, &spec)?);
            }
            '}' => return Err(ScriptError::value("Single '}' encountered in format string")),
            c => out.push(c),
        }
    }
    Ok(out)
}

// ---- list / dict ----

/// Sort values with an optional key function
pub fn sort_items(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> ScriptResult<Vec<Value>> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let k = match key {
            Some(func) if !func.is_none() => interp.call(func, Args::positional(vec![item.clone()]))?,
            _ => item.clone(),
        };
        keyed.push((k, item));
    }
    let mut failure = None;
    keyed.sort_by(|(a, _), (b, _)| {
        compare_values(a, b).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            std::cmp::Ordering::Equal
        })
    });
    if let Some(e) = failure {
        return Err(e);
    }
    if reverse {
        keyed.reverse();
    }
    Ok(keyed.into_iter().map(|(_, v)| v).collect())
}

fn list_method(
    interp: &mut Interpreter,
    recv: &Value,
    name: &str,
    args: &Args,
) -> ScriptResult<Value> {
    let Value::List(items) = recv else {
        return Err(no_attribute(recv, name));
    };
    match name {
        "append" => {
            let item = args.required(0, "object", "append")?.clone();
            items.borrow_mut().push(item);
            Ok(Value::None)
        }
        "extend" => {
            let more = args.required(0, "iterable", "extend")?.iter_values()?;
            items.borrow_mut().extend(more);
            Ok(Value::None)
        }
        "pop" => {
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(ScriptError::index("pop from empty list"));
            }
            let len = items.len() as i64;
            let at = args.int(0, "index", -1)?;
            let at = if at < 0 { at + len } else { at };
            if !(0..len).contains(&at) {
                return Err(ScriptError::index("pop index out of range"));
            }
            Ok(items.remove(at as usize))
        }
        "insert" => {
            let at = args.required(0, "index", "insert")?.as_int()?;
            let item = args.required(1, "object", "insert")?.clone();
            let mut items = items.borrow_mut();
            let len = items.len() as i64;
            let at = if at < 0 { (at + len).max(0) } else { at.min(len) };
            items.insert(at as usize, item);
            Ok(Value::None)
        }
        "remove" => {
            let target = args.required(0, "value", "remove")?;
            let mut items = items.borrow_mut();
            match items.iter().position(|v| values_equal(v, target)) {
                Some(pos) => {
                    items.remove(pos);
                    Ok(Value::None)
                }
                None => Err(ScriptError::value("list.remove(x): x not in list")),
            }
        }
        "index" => {
            let target = args.required(0, "value", "index")?;
            items
                .borrow()
                .iter()
                .position(|v| values_equal(v, target))
                .map(|p| Value::Int(p as i64))
                .ok_or_else(|| ScriptError::value(format!("{} is not in list", target.repr())))
        }
        "count" => {
            let target = args.required(0, "value", "count")?;
            Ok(Value::Int(
                items.borrow().iter().filter(|v| values_equal(v, target)).count() as i64,
            ))
        }
        "sort" => {
            let current = items.borrow().clone();
            let sorted = sort_items(interp, current, args.kw("key"), args.flag(usize::MAX, "reverse", false)?)?;
            *items.borrow_mut() = sorted;
            Ok(Value::None)
        }
        "reverse" => {
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        "copy" | "tolist" | "to_list" => Ok(Value::list(items.borrow().clone())),
        other => Err(no_attribute(recv, other)),
    }
}

fn dict_method(recv: &Value, name: &str, args: &Args) -> ScriptResult<Value> {
    let Value::Dict(entries) = recv else {
        return Err(no_attribute(recv, name));
    };
    match name {
        "get" => {
            let key = args.required(0, "key", "get")?.to_key()?;
            Ok(entries
                .borrow()
                .get(&key)
                .cloned()
                .or_else(|| args.get(1, "default").cloned())
                .unwrap_or(Value::None))
        }
        "keys" => Ok(Value::list(entries.borrow().keys().map(Key::to_value).collect())),
        "values" => Ok(Value::list(entries.borrow().values().cloned().collect())),
        "items" => Ok(Value::list(
            entries
                .borrow()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone()]))
                .collect(),
        )),
        "update" => {
            let mut updates: IndexMap<Key, Value> = match args.pos.first() {
                Some(Value::Dict(other)) => other.borrow().clone(),
                Some(other) => {
                    return Err(ScriptError::type_error(format!(
                        "'{}' object is not a mapping",
                        other.type_name()
                    )))
                }
                None => IndexMap::new(),
            };
            for (k, v) in &args.kw {
                updates.insert(Key::Str(k.clone()), v.clone());
            }
            entries.borrow_mut().extend(updates);
            Ok(Value::None)
        }
        "pop" => {
            let key = args.required(0, "key", "pop")?.to_key()?;
            match entries.borrow_mut().shift_remove(&key) {
                Some(v) => Ok(v),
                None => args
                    .get(1, "default")
                    .cloned()
                    .ok_or_else(|| ScriptError::key(key.label())),
            }
        }
        "setdefault" => {
            let key = args.required(0, "key", "setdefault")?.to_key()?;
            let default = args.get(1, "default").cloned().unwrap_or(Value::None);
            Ok(entries.borrow_mut().entry(key).or_insert(default).clone())
        }
        "copy" => Ok(Value::dict(entries.borrow().clone())),
        other => Err(no_attribute(recv, other)),
    }
}

// ---- .str accessor ----

fn build_regex(pattern: &str, case: bool) -> ScriptResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case)
        .build()
        .map_err(|e| ScriptError::value(format!("invalid regular expression: {}", e)))
}

fn str_accessor(series: &Series, name: &str, args: &Args) -> ScriptResult<Value> {
    let map_text = |f: &dyn Fn(&str) -> ScriptResult<Scalar>| -> ScriptResult<Value> {
        let values = series
            .values
            .iter()
            .map(|cell| match cell {
                Scalar::Text(s) => f(s),
                _ => Ok(Scalar::Null),
            })
            .collect::<ScriptResult<Vec<_>>>()?;
        Ok(Value::series(series.with_values(values)))
    };
    let text = |pos: usize, arg: &str| -> ScriptResult<String> {
        Ok(args.required(pos, arg, name)?.as_str()?.to_string())
    };

    match name {
        "contains" => {
            let pattern = text(0, "pat")?;
            let case = args.flag(1, "case", true)?;
            let regex = args.flag(usize::MAX, "regex", true)?;
            let na = match args.kw("na") {
                Some(v) => v.to_scalar()?,
                None => Scalar::Null,
            };
            let matcher: Box<dyn Fn(&str) -> bool> = if regex {
                let re = build_regex(&pattern, case)?;
                Box::new(move |s| re.is_match(s))
            } else if case {
                Box::new(move |s| s.contains(&pattern))
            } else {
                let lowered = pattern.to_lowercase();
                Box::new(move |s| s.to_lowercase().contains(&lowered))
            };
            let values = series
                .values
                .iter()
                .map(|cell| match cell {
                    Scalar::Text(s) => Scalar::Bool(matcher(s)),
                    _ => na.clone(),
                })
                .collect();
            Ok(Value::series(series.with_values(values)))
        }
        "match" => {
            let re = build_regex(&format!("^(?:{})", text(0, "pat")?), args.flag(1, "case", true)?)?;
            map_text(&|s| Ok(Scalar::Bool(re.is_match(s))))
        }
        "lower" => map_text(&|s| Ok(Scalar::Text(s.to_lowercase()))),
        "upper" => map_text(&|s| Ok(Scalar::Text(s.to_uppercase()))),
        "strip" => map_text(&|s| Ok(Scalar::Text(s.trim().to_string()))),
        "lstrip" => map_text(&|s| Ok(Scalar::Text(s.trim_start().to_string()))),
        "rstrip" => map_text(&|s| Ok(Scalar::Text(s.trim_end().to_string()))),
        "title" => map_text(&|s| Ok(Scalar::Text(title_case(s)))),
        "capitalize" => map_text(&|s| match str_method(s, "capitalize", &Args::default())? {
            Value::Str(out) => Ok(Scalar::Text(out)),
            _ => Ok(Scalar::Null),
        }),
        "startswith" => {
            let prefix = text(0, "pat")?;
            map_text(&|s| Ok(Scalar::Bool(s.starts_with(&prefix))))
        }
        "endswith" => {
            let suffix = text(0, "pat")?;
            map_text(&|s| Ok(Scalar::Bool(s.ends_with(&suffix))))
        }
        "len" => map_text(&|s| Ok(Scalar::Int(s.chars().count() as i64))),
        "replace" => {
            let pattern = text(0, "pat")?;
            let replacement = text(1, "repl")?;
            if args.flag(usize::MAX, "regex", false)? {
                let re = build_regex(&pattern, args.flag(usize::MAX, "case", true)?)?;
                map_text(&|s| Ok(Scalar::Text(re.replace_all(s, replacement.as_str()).into_owned())))
            } else {
                map_text(&|s| Ok(Scalar::Text(s.replace(&pattern, &replacement))))
            }
        }
        "slice" => {
            let start = args.get(0, "start").filter(|v| !v.is_none()).map(Value::as_int).transpose()?;
            let stop = args.get(1, "stop").filter(|v| !v.is_none()).map(Value::as_int).transpose()?;
            let slice = Value::Slice(start, stop, None);
            map_text(&|s| super::ops::get_item(&Value::Str(s.to_string()), &slice)?.to_scalar())
        }
        "get" => {
            let at = args.required(0, "i", "get")?.as_int()?;
            map_text(&|s| {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let pos = if at < 0 { at + len } else { at };
                Ok(if (0..len).contains(&pos) {
                    Scalar::Text(chars[pos as usize].to_string())
                } else {
                    Scalar::Null
                })
            })
        }
        "zfill" => {
            let width = args.int(0, "width", 0)?;
            map_text(&|s| Ok(Scalar::Text(zfill(s, width))))
        }
        "count" => {
            let re = build_regex(&text(0, "pat")?, true)?;
            map_text(&|s| Ok(Scalar::Int(re.find_iter(s).count() as i64)))
        }
        "find" => {
            let needle = text(0, "sub")?;
            map_text(&|s| {
                Ok(Scalar::Int(
                    s.find(&needle)
                        .map(|b| s[..b].chars().count() as i64)
                        .unwrap_or(-1),
                ))
            })
        }
        "isdigit" | "isnumeric" => {
            map_text(&|s| Ok(Scalar::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))))
        }
        "isalpha" => map_text(&|s| Ok(Scalar::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)))),
        other => Err(ScriptError::attribute(format!(
            "'StringMethods' object has no attribute '{}'",
            other
        ))),
    }
}

// ---- .dt accessor ----

fn datetime_of(cell: &Scalar) -> Option<NaiveDateTime> {
    match cell {
        Scalar::Text(s) => parse_datetime(s),
        _ => None,
    }
}

fn map_dates(series: &Series, f: impl Fn(&NaiveDateTime) -> Scalar) -> Value {
    let values = series
        .values
        .iter()
        .map(|cell| datetime_of(cell).map(|dt| f(&dt)).unwrap_or(Scalar::Null))
        .collect();
    Value::series(series.with_values(values))
}

fn dt_property(series: &Series, name: &str) -> ScriptResult<Value> {
    let int = |v: u32| Scalar::Int(i64::from(v));
    Ok(match name {
        "year" => map_dates(series, |d| Scalar::Int(i64::from(d.year()))),
        "month" => map_dates(series, |d| int(d.month())),
        "day" => map_dates(series, |d| int(d.day())),
        "hour" => map_dates(series, |d| int(d.hour())),
        "minute" => map_dates(series, |d| int(d.minute())),
        "second" => map_dates(series, |d| int(d.second())),
        "quarter" => map_dates(series, |d| int((d.month() - 1) / 3 + 1)),
        "dayofweek" | "weekday" | "day_of_week" => {
            map_dates(series, |d| int(d.weekday().num_days_from_monday()))
        }
        "dayofyear" | "day_of_year" => map_dates(series, |d| int(d.ordinal())),
        "date" => map_dates(series, |d| Scalar::Text(d.format("%Y-%m-%d").to_string())),
        other => {
            return Err(ScriptError::attribute(format!(
                "'DatetimeProperties' object has no attribute '{}'",
                other
            )))
        }
    })
}

const PERIOD_FREQS: &[&str] = &["M", "ME", "Q", "QE", "Y", "A", "YE", "D", "W"];

fn period_label(dt: &NaiveDateTime, freq: &str) -> ScriptResult<String> {
    Ok(match freq.to_ascii_uppercase().as_str() {
        "M" | "ME" => dt.format("%Y-%m").to_string(),
        "Q" | "QE" => format!("{}Q{}", dt.year(), (dt.month() - 1) / 3 + 1),
        "Y" | "A" | "YE" => dt.format("%Y").to_string(),
        "D" => dt.format("%Y-%m-%d").to_string(),
        "W" => {
            let start = dt.date()
                - chrono::Duration::days(i64::from(dt.weekday().num_days_from_monday()));
            let end = start + chrono::Duration::days(6);
            format!("{}/{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
        }
        other => {
            return Err(ScriptError::value(format!("Invalid frequency: {}", other)))
        }
    })
}

fn dt_method(series: &Series, name: &str, args: &Args) -> ScriptResult<Value> {
    match name {
        "month_name" => Ok(map_dates(series, |d| Scalar::Text(d.format("%B").to_string()))),
        "day_name" => Ok(map_dates(series, |d| Scalar::Text(d.format("%A").to_string()))),
        "normalize" => Ok(map_dates(series, |d| {
            d.date()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| Scalar::Text(format_datetime(&midnight)))
                .unwrap_or(Scalar::Null)
        })),
        "strftime" => {
            let fmt = args.required(0, "date_format", "strftime")?.as_str()?.to_string();
            let items: Vec<chrono::format::Item> = chrono::format::StrftimeItems::new(&fmt).collect();
            if items.contains(&chrono::format::Item::Error) {
                return Err(ScriptError::value(format!("invalid strftime format: {}", fmt)));
            }
            Ok(map_dates(series, |d| {
                Scalar::Text(d.format_with_items(items.iter()).to_string())
            }))
        }
        "to_period" => {
            let freq = args.string(0, "freq")?.unwrap_or_else(|| "M".to_string());
            if !PERIOD_FREQS.contains(&freq.to_ascii_uppercase().as_str()) {
                return Err(ScriptError::value(format!("Invalid frequency: {}", freq)));
            }
            Ok(map_dates(series, |d| {
                period_label(d, &freq).map(Scalar::Text).unwrap_or(Scalar::Null)
            }))
        }
        other => Err(ScriptError::attribute(format!(
            "'DatetimeProperties' object has no attribute '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_series(values: &[&str]) -> Rc<Series> {
        Rc::new(Series::new(
            Some("c".into()),
            values.iter().map(|v| Scalar::Text(v.to_string())).collect(),
        ))
    }

    fn cells(value: Value) -> Vec<Scalar> {
        match value {
            Value::Series(s) => s.values.clone(),
            other => panic!("expected series, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_str_contains_case_insensitive() {
        let series = text_series(&["North", "south", "Northeast"]);
        let mut args = Args::positional(vec![Value::Str("north".into())]);
        args.kw.insert("case".into(), Value::Bool(false));
        let out = cells(str_accessor(&series, "contains", &args).unwrap());
        assert_eq!(
            out,
            vec![Scalar::Bool(true), Scalar::Bool(false), Scalar::Bool(true)]
        );
    }

    #[test]
    fn test_dt_properties_and_period() {
        let series = text_series(&["2024-02-15", "2023-11-01 08:30:00"]);
        assert_eq!(
            cells(dt_property(&series, "quarter").unwrap()),
            vec![Scalar::Int(1), Scalar::Int(4)]
        );
        let args = Args::positional(vec![Value::Str("Q".into())]);
        assert_eq!(
            cells(dt_method(&series, "to_period", &args).unwrap()),
            vec![Scalar::Text("2024Q1".into()), Scalar::Text("2023Q4".into())]
        );
    }

    #[test]
    fn test_dt_requires_dates() {
        let series = Value::Series(text_series(&["not a date"]));
        let err = get_attr(&series, "dt").unwrap_err();
        assert_eq!(err.kind, super::super::error::ErrorKind::Attribute);
    }

    #[test]
    fn test_str_format() {
        let mut args = Args::positional(vec![Value::Int(3), Value::Float(2.5)]);
        args.kw.insert("unit".into(), Value::Str("kg".into()));
        assert_eq!(
            str_format("{} items, {:.2f} {unit}", &args).unwrap(),
            "3 items, 2.50 kg"
        );
    }

    #[test]
    fn test_title_and_zfill() {
        assert_eq!(title_case("hello wide world"), "Hello Wide World");
        assert_eq!(zfill("-42", 5), "-0042");
    }
}
