//! Methods of DataFrame, Series and GroupBy values.

use super::error::{ScriptError, ScriptResult};
use super::frame::{
    aggregate_cells, is_numeric_column, merge, AggFunc, AggSpec, DataFrame, GroupBy, Index,
    JoinHow, Selection, Series,
};
use super::interpreter::{eval_with_bindings, is_identifier, string_list, Args, Interpreter};
use super::ops;
use super::parser;
use super::value::{compare_scalars, values_equal, Key, Value};
use crate::datasets::{format_datetime, parse_datetime};
use indexmap::IndexMap;
use sdk::Scalar;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub const FRAME_METHODS: &[&str] = &[
    "head", "tail", "groupby", "sort_values", "sort_index", "reset_index", "set_index", "rename",
    "drop", "dropna", "fillna", "merge", "copy", "nlargest", "nsmallest", "to_dict", "iterrows",
    "items", "sum", "mean", "count", "min", "max", "median", "std", "var", "nunique", "prod",
    "describe", "apply", "assign", "query", "astype", "round", "isna", "isnull", "notna",
    "notnull", "drop_duplicates", "pivot_table", "pivot", "to_string", "agg", "aggregate",
    "idxmax", "idxmin", "insert", "select_dtypes", "abs",
];

pub const SERIES_METHODS: &[&str] = &[
    "sum", "mean", "count", "min", "max", "median", "std", "var", "nunique", "prod", "quantile",
    "unique", "tolist", "to_list", "to_dict", "items", "keys", "value_counts", "sort_values",
    "sort_index", "head", "tail", "reset_index", "to_frame", "idxmax", "idxmin", "nlargest",
    "nsmallest", "round", "abs", "astype", "isin", "isna", "isnull", "notna", "notnull", "fillna",
    "dropna", "apply", "map", "between", "cumsum", "diff", "shift", "pct_change", "rename", "any",
    "all", "copy", "clip", "replace", "to_string", "get", "agg", "aggregate", "first", "last",
];

pub const GROUPBY_METHODS: &[&str] = &[
    "sum", "mean", "count", "min", "max", "median", "std", "var", "nunique", "size", "first",
    "last", "prod", "agg", "aggregate", "apply", "get_group", "head", "transform",
];

/// Slot for arguments that are only accepted by keyword
const KW_ONLY: usize = usize::MAX;

fn frame_value(frame: DataFrame) -> Value {
    Value::frame(frame)
}

fn series_value(series: Series) -> Value {
    Value::series(series)
}

fn scalars(values: &[Scalar]) -> Vec<Value> {
    values.iter().map(Value::from_scalar).collect()
}

/// Aggregation named by a string or one of the reducing built-ins
pub fn agg_func(value: &Value) -> ScriptResult<AggFunc> {
    match value {
        Value::Str(name) => AggFunc::parse(name),
        Value::Builtin("sum") => Ok(AggFunc::Sum),
        Value::Builtin("min") => Ok(AggFunc::Min),
        Value::Builtin("max") => Ok(AggFunc::Max),
        Value::Builtin("len") => Ok(AggFunc::Size),
        other => Err(ScriptError::type_error(format!(
            "aggregation must be a function name, not {}",
            other.type_name()
        ))),
    }
}

fn reduction(name: &str) -> Option<AggFunc> {
    match name {
        "sum" | "mean" | "count" | "min" | "max" | "median" | "std" | "var" | "nunique"
        | "prod" | "size" | "first" | "last" => AggFunc::parse(name).ok(),
        _ => None,
    }
}

fn no_method(type_name: &str, name: &str) -> ScriptError {
    ScriptError::attribute(format!(
        "'{}' object has no attribute '{}'",
        type_name, name
    ))
}

/// Linear-interpolated quantile of the non-null numeric cells
fn quantile(cells: &[Scalar], q: f64) -> ScriptResult<Scalar> {
    if !(0.0..=1.0).contains(&q) {
        return Err(ScriptError::value("percentiles should all be in the interval [0, 1]"));
    }
    let mut values: Vec<f64> = cells.iter().filter_map(Scalar::as_f64).collect();
    if values.is_empty() {
        return Ok(Scalar::Null);
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Ok(Scalar::Float(values[lo] + (values[hi] - values[lo]) * (pos - lo as f64)))
}

fn round_cell(cell: &Scalar, digits: i64) -> Scalar {
    match cell {
        Scalar::Float(f) => {
            let factor = 10f64.powi(digits as i32);
            Scalar::Float((f * factor).round() / factor)
        }
        other => other.clone(),
    }
}

/// Target type of `astype`
fn cast_target(value: &Value) -> ScriptResult<&'static str> {
    let name = match value {
        Value::Builtin(name) => *name,
        Value::Str(s) => match s.as_str() {
            "int" | "int64" | "int32" | "Int64" => "int",
            "float" | "float64" | "float32" => "float",
            "str" | "string" => "str",
            "bool" => "bool",
            "category" | "object" => "object",
            s if s.starts_with("datetime64") => "datetime",
            other => {
                return Err(ScriptError::type_error(format!(
                    "data type '{}' not understood",
                    other
                )))
            }
        },
        other => {
            return Err(ScriptError::type_error(format!(
                "data type '{}' not understood",
                other.repr()
            )))
        }
    };
    match name {
        "int" | "float" | "str" | "bool" | "object" | "datetime" => Ok(name),
        other => Err(ScriptError::type_error(format!(
            "data type '{}' not understood",
            other
        ))),
    }
}

pub fn cast_cells(cells: &[Scalar], target: &str) -> ScriptResult<Vec<Scalar>> {
    cells
        .iter()
        .map(|cell| {
            Ok(match (target, cell) {
                (_, Scalar::Null) if target != "int" => Scalar::Null,
                ("int", Scalar::Null) => {
                    return Err(ScriptError::value(
                        "cannot convert non-finite values (NA or inf) to integer",
                    ))
                }
                ("int", Scalar::Int(i)) => Scalar::Int(*i),
                ("int", Scalar::Float(f)) => Scalar::Int(f.trunc() as i64),
                ("int", Scalar::Bool(b)) => Scalar::Int(i64::from(*b)),
                ("int", Scalar::Text(s)) => Scalar::Int(s.trim().parse().map_err(|_| {
                    ScriptError::value(format!("invalid literal for int(): '{}'", s))
                })?),
                ("float", Scalar::Text(s)) => Scalar::Float(s.trim().parse().map_err(|_| {
                    ScriptError::value(format!("could not convert string to float: '{}'", s))
                })?),
                ("float", c) => Scalar::Float(c.as_f64().unwrap_or(f64::NAN)),
                ("str", c) => Scalar::Text(c.to_string()),
                ("bool", c) => Scalar::Bool(match c {
                    Scalar::Text(s) => !s.is_empty(),
                    c => c.as_f64().is_some_and(|f| f != 0.0),
                }),
                ("datetime", Scalar::Text(s)) => match parse_datetime(s) {
                    Some(dt) => Scalar::Text(format_datetime(&dt)),
                    None => {
                        return Err(ScriptError::value(format!(
                            "Unknown datetime string format, unable to parse: {}",
                            s
                        )))
                    }
                },
                (_, c) => c.clone(),
            })
        })
        .collect()
}

fn null_mask(cells: &[Scalar], want_null: bool) -> Vec<Scalar> {
    cells
        .iter()
        .map(|c| Scalar::Bool(c.is_null() == want_null))
        .collect()
}

/// Reduce each row of the numeric value columns
fn row_reduce(df: &DataFrame, func: AggFunc) -> ScriptResult<Series> {
    let columns: Vec<&Vec<Scalar>> = df
        .data
        .iter()
        .skip(df.key_columns)
        .filter(|c| !func.numeric_only() || is_numeric_column(c))
        .collect();
    let values = (0..df.nrows())
        .map(|r| {
            let cells: Vec<&Scalar> = columns.iter().map(|c| &c[r]).collect();
            aggregate_cells(&cells, func)
        })
        .collect::<ScriptResult<Vec<_>>>()?;
    Ok(Series {
        name: None,
        values,
        index: df.series_index(),
    })
}

fn inplace(args: &Args) -> ScriptResult<bool> {
    match args.kw("inplace") {
        Some(v) => v.truthy(),
        None => Ok(false),
    }
}

// ---- DataFrame ----

pub fn frame_method(
    interp: &mut Interpreter,
    frame: &Rc<RefCell<DataFrame>>,
    name: &str,
    args: Args,
) -> ScriptResult<Value> {
    // Methods that call back into the script work on a snapshot
    match name {
        "apply" => {
            let df = frame.borrow().clone();
            return frame_apply(interp, &df, &args);
        }
        "assign" => {
            let mut df = frame.borrow().clone();
            for (column, value) in &args.kw {
                let value = match value {
                    Value::Function(_) | Value::Builtin(_) => interp.call(
                        value,
                        Args::positional(vec![frame_value(df.clone())]),
                    )?,
                    other => other.clone(),
                };
                let cells = ops::column_values(&df, &value)?;
                df.set_column(column, cells)?;
            }
            return Ok(frame_value(df));
        }
        "query" => {
            let df = frame.borrow().clone();
            let text = args.required(0, "expr", "query")?.as_str()?.replace('@', "");
            let expr = parser::parse_expression(&text, 0)?;
            let mut bindings = HashMap::new();
            for column in &df.columns {
                if is_identifier(column) {
                    bindings.insert(column.clone(), series_value(df.column(column)?));
                }
            }
            let mask = eval_with_bindings(interp, &expr, bindings)?;
            return ops::get_item(&frame_value(df), &mask);
        }
        _ => {}
    }

    let result = {
        let df = frame.borrow();
        frame_pure(&df, name, &args)?
    };
    let mutating = matches!(
        name,
        "drop" | "rename" | "fillna" | "dropna" | "sort_values" | "reset_index" | "set_index"
            | "drop_duplicates"
    );
    if name == "insert" {
        if let Value::Frame(updated) = result {
            let updated = updated.borrow().clone();
            *frame.borrow_mut() = updated;
        }
        return Ok(Value::None);
    }
    if mutating && inplace(&args)? {
        if let Value::Frame(updated) = result {
            let updated = updated.borrow().clone();
            *frame.borrow_mut() = updated;
        }
        return Ok(Value::None);
    }
    Ok(result)
}

fn frame_apply(interp: &mut Interpreter, df: &DataFrame, args: &Args) -> ScriptResult<Value> {
    let func = args.required(0, "func", "apply")?.clone();
    let by_row = match args.get(1, "axis") {
        Some(Value::Int(1)) => true,
        Some(Value::Str(s)) => s == "columns",
        _ => false,
    };
    if by_row {
        let mut values = Vec::with_capacity(df.nrows());
        for r in 0..df.nrows() {
            let row = series_value(df.row(r));
            values.push(interp.call(&func, Args::positional(vec![row]))?.to_scalar()?);
        }
        return Ok(series_value(Series {
            name: None,
            values,
            index: df.series_index(),
        }));
    }
    let mut labels = Vec::new();
    let mut values = Vec::new();
    for column in df.value_columns() {
        let col = series_value(df.column(column)?);
        labels.push(vec![Scalar::Text(column.clone())]);
        values.push(interp.call(&func, Args::positional(vec![col]))?.to_scalar()?);
    }
    Ok(series_value(Series {
        name: None,
        values,
        index: Index::Keys {
            names: Vec::new(),
            labels,
        },
    }))
}

fn frame_pure(df: &DataFrame, name: &str, args: &Args) -> ScriptResult<Value> {
    if let Some(func) = reduction(name) {
        let by_row = matches!(args.get(0, "axis"), Some(Value::Int(1)))
            || matches!(args.get(0, "axis"), Some(Value::Str(s)) if s == "columns");
        return if by_row {
            Ok(series_value(row_reduce(df, func)?))
        } else {
            Ok(series_value(df.reduce(func)?))
        };
    }

    match name {
        "head" => Ok(frame_value(df.head(args.int(0, "n", 5)?))),
        "tail" => Ok(frame_value(df.tail(args.int(0, "n", 5)?))),
        "copy" => Ok(frame_value(df.clone())),
        "to_string" => Ok(Value::Str(df.render())),
        "groupby" => {
            let keys = args
                .names(0, "by")?
                .ok_or_else(|| ScriptError::type_error("You have to supply one of 'by' and 'level'"))?;
            let mut group_by = GroupBy::new(df.clone(), keys, args.flag(KW_ONLY, "dropna", true)?)?;
            group_by.as_index = args.flag(KW_ONLY, "as_index", true)?;
            Ok(Value::GroupBy(Rc::new(group_by)))
        }
        "sort_values" => {
            let by = args
                .names(0, "by")?
                .ok_or_else(|| ScriptError::type_error("sort_values() missing required argument: 'by'"))?;
            let ascending = match args.get(1, "ascending") {
                None => vec![true],
                Some(v @ (Value::List(_) | Value::Tuple(_))) => v
                    .iter_values()?
                    .iter()
                    .map(Value::truthy)
                    .collect::<ScriptResult<Vec<_>>>()?,
                Some(v) => vec![v.truthy()?],
            };
            Ok(frame_value(df.sort_by(&by, &ascending)?))
        }
        "sort_index" => {
            let ascending = args.flag(0, "ascending", true)?;
            let keys = df.series_index().columns();
            let mut with_keys = df.clone();
            let mut names = Vec::new();
            for (i, key) in keys.into_iter().enumerate() {
                let name = format!("__sort_key_{}", i);
                with_keys.set_column(&name, key)?;
                names.push(name);
            }
            let sorted = with_keys.sort_by(&names, &[ascending])?;
            Ok(frame_value(sorted.drop_columns(&names)?))
        }
        "reset_index" => Ok(frame_value(df.reset_index(args.flag(KW_ONLY, "drop", false)?))),
        "set_index" => {
            let keys = args
                .names(0, "keys")?
                .ok_or_else(|| ScriptError::type_error("set_index() missing required argument: 'keys'"))?;
            Ok(frame_value(df.set_index(&keys)?))
        }
        "rename" => {
            let mapping = match args.kw("columns").or_else(|| args.pos.first()) {
                Some(Value::Dict(entries)) => entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| Ok((k.label(), v.as_str()?.to_string())))
                    .collect::<ScriptResult<HashMap<_, _>>>()?,
                Some(other) => {
                    return Err(ScriptError::type_error(format!(
                        "rename expects a dict of column names, got {}",
                        other.type_name()
                    )))
                }
                None => HashMap::new(),
            };
            Ok(frame_value(df.rename(&mapping)))
        }
        "drop" => {
            let by_columns = matches!(args.kw("axis"), Some(Value::Int(1)))
                || matches!(args.kw("axis"), Some(Value::Str(s)) if s == "columns");
            if let Some(columns) = args.kw("columns") {
                return Ok(frame_value(df.drop_columns(&string_list(columns)?)?));
            }
            if let Some(index) = args.kw("index") {
                return drop_rows(df, index);
            }
            match args.get(0, "labels") {
                Some(labels) if by_columns => {
                    Ok(frame_value(df.drop_columns(&string_list(labels)?)?))
                }
                Some(labels) => drop_rows(df, labels),
                None => Err(ScriptError::type_error(
                    "Need to specify at least one of 'labels', 'index' or 'columns'",
                )),
            }
        }
        "dropna" => {
            let subset = args.names(KW_ONLY, "subset")?;
            let how_all = matches!(args.kw("how"), Some(Value::Str(s)) if s == "all");
            Ok(frame_value(df.dropna(subset.as_deref(), how_all)?))
        }
        "fillna" => {
            let value = args.required(0, "value", "fillna")?;
            match value {
                Value::Dict(entries) => {
                    let fills = entries
                        .borrow()
                        .iter()
                        .map(|(k, v)| Ok((k.label(), v.to_scalar()?)))
                        .collect::<ScriptResult<HashMap<_, _>>>()?;
                    Ok(frame_value(df.fillna(&fills, None)))
                }
                other => Ok(frame_value(df.fillna(&HashMap::new(), Some(&other.to_scalar()?)))),
            }
        }
        "merge" => {
            let right = match args.required(0, "right", "merge")? {
                Value::Frame(f) => f.borrow().clone(),
                Value::Series(s) => s.to_frame(),
                other => {
                    return Err(ScriptError::type_error(format!(
                        "Can only merge Series or DataFrame objects, a {} was passed",
                        other.type_name()
                    )))
                }
            };
            merge_frames(df, &right, args, 1)
        }
        "nlargest" | "nsmallest" => {
            let n = args.int(0, "n", 5)?;
            let columns = args
                .names(1, "columns")?
                .ok_or_else(|| ScriptError::type_error(format!("{}() missing required argument: 'columns'", name)))?;
            let filtered = df.dropna(Some(&columns), false)?;
            let sorted = filtered.sort_by(&columns, &[name == "nsmallest"])?;
            Ok(frame_value(sorted.head(n)))
        }
        "drop_duplicates" => {
            let subset = args.names(0, "subset")?;
            Ok(frame_value(df.drop_duplicates(subset.as_deref())?))
        }
        "to_dict" => frame_to_dict(df, args.string(0, "orient")?.as_deref().unwrap_or("dict")),
        "iterrows" => Ok(Value::list(
            (0..df.nrows())
                .map(|r| {
                    Value::tuple(vec![
                        Value::from_scalar(&df.index[r]),
                        series_value(df.row(r)),
                    ])
                })
                .collect(),
        )),
        "items" => Ok(Value::list(
            df.value_columns()
                .iter()
                .map(|c| {
                    Ok(Value::tuple(vec![
                        Value::Str(c.clone()),
                        series_value(df.column(c)?),
                    ]))
                })
                .collect::<ScriptResult<Vec<_>>>()?,
        )),
        "describe" => describe(df),
        "astype" => {
            let mut out = df.clone();
            match args.required(0, "dtype", "astype")? {
                Value::Dict(entries) => {
                    for (column, target) in entries.borrow().iter() {
                        let column = column.label();
                        let pos = out.position(&column)?;
                        out.data[pos] = cast_cells(&out.data[pos], cast_target(target)?)?;
                    }
                }
                target => {
                    let target = cast_target(target)?;
                    for col in out.data.iter_mut().skip(df.key_columns) {
                        *col = cast_cells(col, target)?;
                    }
                }
            }
            Ok(frame_value(out))
        }
        "round" => {
            let digits = args.int(0, "decimals", 0)?;
            Ok(frame_value(df.map_cells(|c| round_cell(c, digits))))
        }
        "abs" => Ok(frame_value(df.map_cells(|c| match c {
            Scalar::Int(i) => Scalar::Int(i.abs()),
            Scalar::Float(f) => Scalar::Float(f.abs()),
            other => other.clone(),
        }))),
        "isna" | "isnull" => Ok(frame_value(df.map_cells(|c| Scalar::Bool(c.is_null())))),
        "notna" | "notnull" => Ok(frame_value(df.map_cells(|c| Scalar::Bool(!c.is_null())))),
        "pivot_table" | "pivot" => pivot_table(df, args, name == "pivot"),
        "agg" | "aggregate" => match args.required(0, "func", name)? {
            Value::Dict(entries) => {
                let mut labels = Vec::new();
                let mut values = Vec::new();
                for (column, func) in entries.borrow().iter() {
                    let column = column.label();
                    let series = df.column(&column)?;
                    labels.push(vec![Scalar::Text(column)]);
                    values.push(series.reduce(agg_func(func)?)?);
                }
                Ok(series_value(Series {
                    name: None,
                    values,
                    index: Index::Keys {
                        names: Vec::new(),
                        labels,
                    },
                }))
            }
            func => Ok(series_value(df.reduce(agg_func(func)?)?)),
        },
        "idxmax" | "idxmin" => {
            let mut labels = Vec::new();
            let mut values = Vec::new();
            for column in df.value_columns() {
                let series = df.column(column)?;
                if !is_numeric_column(&series.values) {
                    continue;
                }
                labels.push(vec![Scalar::Text(column.clone())]);
                values.push(series.idx_extreme(name == "idxmax")?.to_scalar()?);
            }
            Ok(series_value(Series {
                name: None,
                values,
                index: Index::Keys {
                    names: Vec::new(),
                    labels,
                },
            }))
        }
        "insert" => {
            let loc = args.required(0, "loc", "insert")?.as_int()?;
            let column = args.required(1, "column", "insert")?.as_str()?.to_string();
            let value = args.required(2, "value", "insert")?;
            if df.columns.contains(&column) {
                return Err(ScriptError::value(format!("cannot insert {}, already exists", column)));
            }
            let cells = ops::column_values(df, value)?;
            let mut out = df.clone();
            let at = (df.key_columns + loc.max(0) as usize).min(out.columns.len());
            out.columns.insert(at, column);
            out.data.insert(at, cells);
            Ok(frame_value(out))
        }
        "select_dtypes" => {
            let include = args.names(0, "include")?.unwrap_or_default();
            let numeric = include.iter().any(|t| matches!(t.as_str(), "number" | "int" | "float" | "int64" | "float64"));
            let text = include.iter().any(|t| matches!(t.as_str(), "object" | "category" | "string"));
            let keep: Vec<String> = df
                .value_columns()
                .iter()
                .zip(df.data.iter().skip(df.key_columns))
                .filter(|(_, col)| {
                    let is_num = is_numeric_column(col);
                    (numeric && is_num) || (text && !is_num)
                })
                .map(|(c, _)| c.clone())
                .collect();
            Ok(frame_value(df.select(&keep)?))
        }
        other => Err(no_method("DataFrame", other)),
    }
}

fn drop_rows(df: &DataFrame, labels: &Value) -> ScriptResult<Value> {
    let labels = match labels {
        Value::List(_) | Value::Tuple(_) => labels.iter_values()?,
        other => vec![other.clone()],
    };
    let index = df.series_index();
    let mut drop = HashSet::new();
    for label in &labels {
        let pos = index
            .find(label)?
            .ok_or_else(|| ScriptError::key(format!("{} not found in axis", label.repr())))?;
        drop.insert(pos);
    }
    let keep: Vec<usize> = (0..df.nrows()).filter(|r| !drop.contains(r)).collect();
    Ok(frame_value(df.take(&keep)))
}

/// `merge` with arguments starting at `first` (after the frames)
pub fn merge_frames(
    left: &DataFrame,
    right: &DataFrame,
    args: &Args,
    first: usize,
) -> ScriptResult<Value> {
    let how = JoinHow::parse(args.string(first, "how")?.as_deref().unwrap_or("inner"))?;
    let on = args.names(first + 1, "on")?;
    let (left_on, right_on) = match on {
        Some(on) => (on.clone(), on),
        None => match (args.names(KW_ONLY, "left_on")?, args.names(KW_ONLY, "right_on")?) {
            (Some(l), Some(r)) => (l, r),
            _ => {
                let shared: Vec<String> = left
                    .columns
                    .iter()
                    .filter(|c| right.columns.contains(c))
                    .cloned()
                    .collect();
                if shared.is_empty() {
                    return Err(ScriptError::value(
                        "No common columns to perform merge on",
                    ));
                }
                (shared.clone(), shared)
            }
        },
    };
    let suffixes = match args.kw("suffixes") {
        Some(v) => {
            let parts = v.iter_values()?;
            if parts.len() != 2 {
                return Err(ScriptError::value("suffixes must have two entries"));
            }
            (parts[0].to_str(), parts[1].to_str())
        }
        None => ("_x".to_string(), "_y".to_string()),
    };
    Ok(frame_value(merge(
        left,
        right,
        &left_on,
        &right_on,
        how,
        (&suffixes.0, &suffixes.1),
    )?))
}

fn frame_to_dict(df: &DataFrame, orient: &str) -> ScriptResult<Value> {
    let labels = df.series_index().labels();
    match orient {
        "records" => Ok(Value::list(
            (0..df.nrows())
                .map(|r| {
                    let mut row = IndexMap::new();
                    for (c, col) in df.columns.iter().zip(df.data.iter()) {
                        row.insert(Key::Str(c.clone()), Value::from_scalar(&col[r]));
                    }
                    Value::dict(row)
                })
                .collect(),
        )),
        "list" => {
            let mut out = IndexMap::new();
            for (c, col) in df.columns.iter().zip(df.data.iter()) {
                out.insert(Key::Str(c.clone()), Value::list(scalars(col)));
            }
            Ok(Value::dict(out))
        }
        "dict" => {
            let mut out = IndexMap::new();
            for (c, col) in df.columns.iter().zip(df.data.iter()).skip(df.key_columns) {
                let mut inner = IndexMap::new();
                for (label, cell) in labels.iter().zip(col.iter()) {
                    inner.insert(label.to_key()?, Value::from_scalar(cell));
                }
                out.insert(Key::Str(c.clone()), Value::dict(inner));
            }
            Ok(Value::dict(out))
        }
        "index" => {
            let mut out = IndexMap::new();
            for (r, label) in labels.iter().enumerate() {
                let mut inner = IndexMap::new();
                for (c, col) in df.columns.iter().zip(df.data.iter()).skip(df.key_columns) {
                    inner.insert(Key::Str(c.clone()), Value::from_scalar(&col[r]));
                }
                out.insert(label.to_key()?, Value::dict(inner));
            }
            Ok(Value::dict(out))
        }
        other => Err(ScriptError::value(format!(
            "orient '{}' not understood",
            other
        ))),
    }
}

fn describe(df: &DataFrame) -> ScriptResult<Value> {
    const STATS: [&str; 8] = ["count", "mean", "std", "min", "25%", "50%", "75%", "max"];
    let mut columns = vec!["index".to_string()];
    let mut data = vec![STATS.iter().map(|s| Scalar::Text(s.to_string())).collect::<Vec<_>>()];
    for (name, col) in df.columns.iter().zip(df.data.iter()).skip(df.key_columns) {
        if !is_numeric_column(col) || col.iter().all(Scalar::is_null) {
            continue;
        }
        let cells: Vec<&Scalar> = col.iter().collect();
        let count = aggregate_cells(&cells, AggFunc::Count)?;
        let as_float = |s: Scalar| match s {
            Scalar::Int(i) => Scalar::Float(i as f64),
            other => other,
        };
        columns.push(name.clone());
        data.push(vec![
            as_float(count),
            aggregate_cells(&cells, AggFunc::Mean)?,
            aggregate_cells(&cells, AggFunc::Std)?,
            as_float(aggregate_cells(&cells, AggFunc::Min)?),
            quantile(col, 0.25)?,
            quantile(col, 0.5)?,
            quantile(col, 0.75)?,
            as_float(aggregate_cells(&cells, AggFunc::Max)?),
        ]);
    }
    let mut out = DataFrame::new(columns, data)?;
    out.key_columns = 1;
    Ok(frame_value(out))
}

fn pivot_table(df: &DataFrame, args: &Args, strict: bool) -> ScriptResult<Value> {
    let index = args
        .names(KW_ONLY, "index")?
        .ok_or_else(|| ScriptError::type_error("pivot_table() missing required argument: 'index'"))?;
    let columns = args.names(KW_ONLY, "columns")?;
    let values = args.names(KW_ONLY, "values")?;
    let func = match args.kw("aggfunc") {
        Some(f) => agg_func(f)?,
        None if strict => AggFunc::First,
        None => AggFunc::Mean,
    };
    let fill = args.kw("fill_value").map(Value::to_scalar).transpose()?;

    let Some(columns) = columns else {
        let group_by = GroupBy::new(df.clone(), index, true)?;
        let group_by = match values {
            Some(values) => group_by.select(Selection::Many(values))?,
            None => group_by,
        };
        return group_by.aggregate(func).map(|v| match v {
            Value::Series(s) => frame_value(s.to_frame()),
            other => other,
        });
    };
    let value_column = match values.as_deref() {
        Some([one]) => one.clone(),
        Some(_) => {
            return Err(ScriptError::value(
                "pivot_table supports a single values column when columns are given",
            ))
        }
        None => df
            .value_columns()
            .iter()
            .find(|c| !index.contains(c) && !columns.contains(c))
            .cloned()
            .ok_or_else(|| ScriptError::value("no values column to aggregate"))?,
    };

    let mut keys = index.clone();
    keys.extend(columns.iter().cloned());
    let group_by = GroupBy::new(df.clone(), keys, true)?.select(Selection::One(value_column))?;
    let Value::Series(long) = group_by.aggregate(func)? else {
        return Err(ScriptError::value("pivot aggregation did not produce a series"));
    };
    let Index::Keys { labels, .. } = &long.index else {
        return Err(ScriptError::value("pivot aggregation lost its keys"));
    };

    let split = index.len();
    let mut row_keys: Vec<Vec<Scalar>> = Vec::new();
    let mut row_slots: HashMap<Vec<Key>, usize> = HashMap::new();
    let mut col_keys: Vec<Vec<Scalar>> = Vec::new();
    let mut col_slots: HashMap<Vec<Key>, usize> = HashMap::new();
    let mut cells: HashMap<(usize, usize), Scalar> = HashMap::new();
    for (label, value) in labels.iter().zip(long.values.iter()) {
        let (row, col) = label.split_at(split);
        let row_key: Vec<Key> = row.iter().map(Key::from_scalar).collect();
        let col_key: Vec<Key> = col.iter().map(Key::from_scalar).collect();
        let r = *row_slots.entry(row_key).or_insert_with(|| {
            row_keys.push(row.to_vec());
            row_keys.len() - 1
        });
        let c = *col_slots.entry(col_key).or_insert_with(|| {
            col_keys.push(col.to_vec());
            col_keys.len() - 1
        });
        if strict && cells.contains_key(&(r, c)) {
            return Err(ScriptError::value(
                "Index contains duplicate entries, cannot reshape",
            ));
        }
        cells.insert((r, c), value.clone());
    }

    let mut out_columns = index.clone();
    let mut data: Vec<Vec<Scalar>> = (0..split)
        .map(|k| row_keys.iter().map(|r| r[k].clone()).collect())
        .collect();
    for (c, key) in col_keys.iter().enumerate() {
        let name = key
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("_");
        out_columns.push(name);
        data.push(
            (0..row_keys.len())
                .map(|r| {
                    cells
                        .get(&(r, c))
                        .cloned()
                        .or_else(|| fill.clone())
                        .unwrap_or(Scalar::Null)
                })
                .collect(),
        );
    }
    let mut out = DataFrame::new(out_columns, data)?;
    out.key_columns = split;
    Ok(frame_value(out))
}

// ---- Series ----

pub fn series_method(
    interp: &mut Interpreter,
    series: &Rc<Series>,
    name: &str,
    args: Args,
) -> ScriptResult<Value> {
    if let Some(func) = reduction(name) {
        return Ok(Value::from_scalar(&series.reduce(func)?));
    }
    match name {
        "quantile" => {
            let q = args.get(0, "q").and_then(Value::as_f64).unwrap_or(0.5);
            Ok(Value::from_scalar(&quantile(&series.values, q)?))
        }
        "unique" => Ok(Value::list(scalars(&series.unique()))),
        "tolist" | "to_list" => Ok(Value::list(scalars(&series.values))),
        "to_dict" => {
            let mut out = IndexMap::new();
            for (i, cell) in series.values.iter().enumerate() {
                out.insert(series.index.label(i).to_key()?, Value::from_scalar(cell));
            }
            Ok(Value::dict(out))
        }
        "items" => Ok(Value::list(
            series
                .values
                .iter()
                .enumerate()
                .map(|(i, c)| Value::tuple(vec![series.index.label(i), Value::from_scalar(c)]))
                .collect(),
        )),
        "keys" => Ok(Value::list(series.index.labels())),
        "value_counts" => Ok(series_value(series.value_counts(
            args.flag(0, "normalize", false)?,
            args.flag(KW_ONLY, "ascending", false)?,
        ))),
        "sort_values" => Ok(series_value(
            series.sort_values(args.flag(0, "ascending", true)?),
        )),
        "sort_index" => Ok(series_value(
            series.sort_index(args.flag(0, "ascending", true)?),
        )),
        "head" => Ok(series_value(series.head(args.int(0, "n", 5)?))),
        "tail" => Ok(series_value(series.tail(args.int(0, "n", 5)?))),
        "reset_index" => {
            if args.flag(KW_ONLY, "drop", false)? {
                return Ok(series_value(Series::new(
                    series.name.clone(),
                    series.values.clone(),
                )));
            }
            let mut renamed = series.as_ref().clone();
            if let Some(name) = args.string(KW_ONLY, "name")? {
                renamed.name = Some(name);
            }
            Ok(frame_value(renamed.to_frame_with_index()?))
        }
        "to_frame" => {
            let mut renamed = series.as_ref().clone();
            if let Some(name) = args.string(0, "name")? {
                renamed.name = Some(name);
            }
            Ok(frame_value(renamed.to_frame()))
        }
        "idxmax" => series.idx_extreme(true),
        "idxmin" => series.idx_extreme(false),
        "nlargest" | "nsmallest" => {
            let n = args.int(0, "n", 5)?;
            let mask: Vec<bool> = series.values.iter().map(|c| !c.is_null()).collect();
            let present = series.filter(&mask)?;
            Ok(series_value(present.sort_values(name == "nsmallest").head(n)))
        }
        "round" => {
            let digits = args.int(0, "decimals", 0)?;
            Ok(series_value(series.with_values(
                series.values.iter().map(|c| round_cell(c, digits)).collect(),
            )))
        }
        "abs" => Ok(series_value(series.with_values(
            series
                .values
                .iter()
                .map(|c| match c {
                    Scalar::Int(i) => Scalar::Int(i.abs()),
                    Scalar::Float(f) => Scalar::Float(f.abs()),
                    other => other.clone(),
                })
                .collect(),
        ))),
        "astype" => {
            let target = cast_target(args.required(0, "dtype", "astype")?)?;
            Ok(series_value(
                series.with_values(cast_cells(&series.values, target)?),
            ))
        }
        "isin" => {
            let wanted: HashSet<Key> = args
                .required(0, "values", "isin")?
                .iter_values()?
                .iter()
                .map(Value::to_key)
                .collect::<ScriptResult<_>>()?;
            Ok(series_value(series.with_values(
                series
                    .values
                    .iter()
                    .map(|c| Scalar::Bool(!c.is_null() && wanted.contains(&Key::from_scalar(c))))
                    .collect(),
            )))
        }
        "isna" | "isnull" => Ok(series_value(series.with_values(null_mask(&series.values, true)))),
        "notna" | "notnull" => Ok(series_value(series.with_values(null_mask(&series.values, false)))),
        "fillna" => {
            let fill = args.required(0, "value", "fillna")?.to_scalar()?;
            Ok(series_value(series.with_values(
                series
                    .values
                    .iter()
                    .map(|c| if c.is_null() { fill.clone() } else { c.clone() })
                    .collect(),
            )))
        }
        "dropna" => {
            let mask: Vec<bool> = series.values.iter().map(|c| !c.is_null()).collect();
            Ok(series_value(series.filter(&mask)?))
        }
        "apply" | "map" => {
            let func = args.required(0, "func", name)?.clone();
            let values = match &func {
                Value::Dict(entries) => {
                    let entries = entries.borrow();
                    series
                        .values
                        .iter()
                        .map(|c| {
                            entries
                                .get(&Key::from_scalar(c))
                                .map(Value::to_scalar)
                                .unwrap_or(Ok(Scalar::Null))
                        })
                        .collect::<ScriptResult<Vec<_>>>()?
                }
                _ => {
                    let mut out = Vec::with_capacity(series.len());
                    for cell in &series.values {
                        let v = interp.call(&func, Args::positional(vec![Value::from_scalar(cell)]))?;
                        out.push(v.to_scalar()?);
                    }
                    out
                }
            };
            Ok(series_value(series.with_values(values)))
        }
        "between" => {
            let low = args.required(0, "left", "between")?.to_scalar()?;
            let high = args.required(1, "right", "between")?.to_scalar()?;
            let values = series
                .values
                .iter()
                .map(|c| {
                    Ok(Scalar::Bool(
                        ops::compare_cells(c, super::parser::CmpOp::Ge, &low)?
                            && ops::compare_cells(c, super::parser::CmpOp::Le, &high)?,
                    ))
                })
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(series_value(series.with_values(values)))
        }
        "cumsum" => Ok(series_value(series.cumsum())),
        "diff" => Ok(series_value(series.diff(args.int(0, "periods", 1)?))),
        "shift" => Ok(series_value(series.shift(args.int(0, "periods", 1)?))),
        "pct_change" => Ok(series_value(series.pct_change(args.int(0, "periods", 1)?))),
        "rename" => {
            let mut renamed = series.as_ref().clone();
            renamed.name = args.string(0, "index")?;
            Ok(series_value(renamed))
        }
        "any" => Ok(Value::Bool(series.values.iter().any(|c| {
            !c.is_null() && Value::from_scalar(c).truthy().unwrap_or(false)
        }))),
        "all" => Ok(Value::Bool(series.values.iter().all(|c| {
            c.is_null() || Value::from_scalar(c).truthy().unwrap_or(false)
        }))),
        "copy" => Ok(Value::Series(Rc::clone(series))),
        "clip" => {
            let lower = args.get(0, "lower").filter(|v| !v.is_none()).map(Value::to_scalar).transpose()?;
            let upper = args.get(1, "upper").filter(|v| !v.is_none()).map(Value::to_scalar).transpose()?;
            let values = series
                .values
                .iter()
                .map(|c| {
                    let mut c = c.clone();
                    if let Some(lo) = &lower {
                        if !c.is_null() && compare_scalars(&c, lo) == std::cmp::Ordering::Less {
                            c = lo.clone();
                        }
                    }
                    if let Some(hi) = &upper {
                        if !c.is_null() && compare_scalars(&c, hi) == std::cmp::Ordering::Greater {
                            c = hi.clone();
                        }
                    }
                    c
                })
                .collect();
            Ok(series_value(series.with_values(values)))
        }
        "replace" => {
            let pairs: Vec<(Value, Value)> = match args.required(0, "to_replace", "replace")? {
                Value::Dict(entries) => entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.to_value(), v.clone()))
                    .collect(),
                from => vec![(
                    from.clone(),
                    args.required(1, "value", "replace")?.clone(),
                )],
            };
            let values = series
                .values
                .iter()
                .map(|c| {
                    let cell = Value::from_scalar(c);
                    match pairs.iter().find(|(from, _)| values_equal(from, &cell)) {
                        Some((_, to)) => to.to_scalar(),
                        None => Ok(c.clone()),
                    }
                })
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(series_value(series.with_values(values)))
        }
        "to_string" => Ok(Value::Str(series.render())),
        "get" => {
            let key = args.required(0, "key", "get")?;
            match series.index.find(key)? {
                Some(pos) => Ok(Value::from_scalar(&series.values[pos])),
                None => Ok(args.get(1, "default").cloned().unwrap_or(Value::None)),
            }
        }
        "agg" | "aggregate" => match args.required(0, "func", name)? {
            list @ (Value::List(_) | Value::Tuple(_)) => {
                let mut labels = Vec::new();
                let mut values = Vec::new();
                for func in list.iter_values()? {
                    let func = agg_func(&func)?;
                    labels.push(vec![Scalar::Text(func.name().to_string())]);
                    values.push(series.reduce(func)?);
                }
                Ok(series_value(Series {
                    name: series.name.clone(),
                    values,
                    index: Index::Keys {
                        names: Vec::new(),
                        labels,
                    },
                }))
            }
            func => Ok(Value::from_scalar(&series.reduce(agg_func(func)?)?)),
        },
        other => Err(no_method("Series", other)),
    }
}

// ---- GroupBy ----

/// Apply `as_index=False`: keys become ordinary columns
fn finish_grouped(group_by: &GroupBy, value: Value) -> ScriptResult<Value> {
    if group_by.as_index {
        return Ok(value);
    }
    match value {
        Value::Series(s) => Ok(frame_value(s.to_frame_with_index()?)),
        Value::Frame(f) => {
            let mut frame = f.borrow().clone();
            frame.key_columns = 0;
            Ok(frame_value(frame))
        }
        other => Ok(other),
    }
}

pub fn groupby_method(
    interp: &mut Interpreter,
    group_by: &Rc<GroupBy>,
    name: &str,
    args: Args,
) -> ScriptResult<Value> {
    if let Some(func) = reduction(name) {
        let value = group_by.aggregate(func)?;
        return finish_grouped(group_by, value);
    }
    match name {
        "agg" | "aggregate" => {
            let value = groupby_agg(group_by, &args)?;
            finish_grouped(group_by, value)
        }
        "apply" => {
            let func = args.required(0, "func", "apply")?.clone();
            let mut labels = Vec::new();
            let mut values = Vec::new();
            for (key, rows) in group_by.partition()? {
                let sub = frame_value(group_by.frame.take(&rows));
                let out = interp.call(&func, Args::positional(vec![sub]))?;
                values.push(out.to_scalar().map_err(|_| {
                    ScriptError::type_error(
                        "groupby().apply() functions must return a single value per group",
                    )
                })?);
                labels.push(key);
            }
            let value = series_value(Series {
                name: None,
                values,
                index: Index::Keys {
                    names: group_by.keys.clone(),
                    labels,
                },
            });
            finish_grouped(group_by, value)
        }
        "get_group" => {
            let wanted = args.required(0, "name", "get_group")?;
            for (key, frame) in group_by.groups()? {
                if values_equal(&key, wanted) {
                    return Ok(frame_value(frame));
                }
            }
            Err(ScriptError::key(wanted.repr()))
        }
        "head" => {
            let n = args.int(0, "n", 5)?.max(0) as usize;
            let mut rows: Vec<usize> = group_by
                .partition()?
                .into_iter()
                .flat_map(|(_, rows)| rows.into_iter().take(n))
                .collect();
            rows.sort_unstable();
            Ok(frame_value(group_by.frame.take(&rows)))
        }
        "transform" => {
            let func = agg_func(args.required(0, "func", "transform")?)?;
            let Selection::One(column) = &group_by.selection else {
                return Err(ScriptError::value(
                    "transform needs a single selected column, e.g. df.groupby(k)[col]",
                ));
            };
            let pos = group_by.frame.position(column)?;
            let mut values = vec![Scalar::Null; group_by.frame.nrows()];
            for (_, rows) in group_by.partition()? {
                let cells: Vec<&Scalar> = rows.iter().map(|&r| &group_by.frame.data[pos][r]).collect();
                let agg = aggregate_cells(&cells, func)?;
                for r in rows {
                    values[r] = agg.clone();
                }
            }
            Ok(series_value(Series {
                name: Some(column.clone()),
                values,
                index: Index::Rows(group_by.frame.index.clone()),
            }))
        }
        other => Err(no_method("DataFrameGroupBy", other)),
    }
}

fn groupby_agg(group_by: &GroupBy, args: &Args) -> ScriptResult<Value> {
    // Named aggregation: out=("col", "func")
    if args.pos.is_empty() && !args.kw.is_empty() {
        let specs = args
            .kw
            .iter()
            .map(|(output, spec)| {
                let parts = spec.iter_values()?;
                if parts.len() != 2 {
                    return Err(ScriptError::type_error(
                        "named aggregation must be a (column, function) pair",
                    ));
                }
                Ok(AggSpec {
                    output: output.clone(),
                    column: parts[0].as_str()?.to_string(),
                    func: agg_func(&parts[1])?,
                })
            })
            .collect::<ScriptResult<Vec<_>>>()?;
        return Ok(frame_value(group_by.aggregate_specs(&specs)?));
    }
    match args.required(0, "func", "agg")? {
        Value::Dict(entries) => {
            let entries = entries.borrow();
            let multi = entries
                .values()
                .any(|v| matches!(v, Value::List(_) | Value::Tuple(_)));
            let mut specs = Vec::new();
            for (column, funcs) in entries.iter() {
                let column = column.label();
                match funcs {
                    Value::List(_) | Value::Tuple(_) => {
                        for func in funcs.iter_values()? {
                            let func = agg_func(&func)?;
                            specs.push(AggSpec {
                                output: format!("{}_{}", column, func.name()),
                                column: column.clone(),
                                func,
                            });
                        }
                    }
                    func => {
                        let func = agg_func(func)?;
                        specs.push(AggSpec {
                            output: if multi {
                                format!("{}_{}", column, func.name())
                            } else {
                                column.clone()
                            },
                            column: column.clone(),
                            func,
                        });
                    }
                }
            }
            Ok(frame_value(group_by.aggregate_specs(&specs)?))
        }
        list @ (Value::List(_) | Value::Tuple(_)) => {
            let funcs = list
                .iter_values()?
                .iter()
                .map(agg_func)
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(frame_value(group_by.aggregate_many(&funcs)?))
        }
        func => group_by.aggregate(agg_func(func)?),
    }
}
