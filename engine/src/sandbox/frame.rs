//! Column-oriented tables backing the script's DataFrame, Series and
//! GroupBy values.
//!
//! A frame may carry `key_columns`: leading columns produced by a grouping
//! that play the role of a row index. They stay visible as ordinary
//! columns when the frame is serialized.

use super::error::{ScriptError, ScriptResult};
use super::value::{compare_scalars, Key, Value};
use sdk::{Scalar, Table};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Rows shown when a frame or series is printed
const RENDER_ROWS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Sum,
    Mean,
    Count,
    Min,
    Max,
    Median,
    Std,
    Var,
    Nunique,
    Size,
    First,
    Last,
    Prod,
}

impl AggFunc {
    pub fn parse(name: &str) -> ScriptResult<Self> {
        Ok(match name {
            "sum" => AggFunc::Sum,
            "mean" | "average" | "avg" => AggFunc::Mean,
            "count" => AggFunc::Count,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            "median" => AggFunc::Median,
            "std" => AggFunc::Std,
            "var" => AggFunc::Var,
            "nunique" => AggFunc::Nunique,
            "size" => AggFunc::Size,
            "first" => AggFunc::First,
            "last" => AggFunc::Last,
            "prod" => AggFunc::Prod,
            other => {
                return Err(ScriptError::attribute(format!(
                    "'{}' is not a valid aggregation function",
                    other
                )))
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Count => "count",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Median => "median",
            AggFunc::Std => "std",
            AggFunc::Var => "var",
            AggFunc::Nunique => "nunique",
            AggFunc::Size => "size",
            AggFunc::First => "first",
            AggFunc::Last => "last",
            AggFunc::Prod => "prod",
        }
    }

    /// Aggregations that only make sense on numeric columns
    pub fn numeric_only(&self) -> bool {
        matches!(
            self,
            AggFunc::Sum
                | AggFunc::Mean
                | AggFunc::Median
                | AggFunc::Std
                | AggFunc::Var
                | AggFunc::Prod
        )
    }
}

/// True when every non-null cell is a number (or bool)
pub fn is_numeric_column(cells: &[Scalar]) -> bool {
    cells
        .iter()
        .all(|c| matches!(c, Scalar::Null | Scalar::Int(_) | Scalar::Float(_) | Scalar::Bool(_)))
}

/// Reduce a column of cells. Nulls are skipped; `mean` of integers is a
/// float while `sum` of integers stays an integer.
pub fn aggregate_cells(cells: &[&Scalar], func: AggFunc) -> ScriptResult<Scalar> {
    let present: Vec<&Scalar> = cells.iter().copied().filter(|c| !c.is_null()).collect();

    if func.numeric_only() {
        if let Some(bad) = present.iter().find(|c| !c.is_numeric() && !matches!(c, Scalar::Bool(_))) {
            return Err(ScriptError::type_error(format!(
                "cannot compute {} of non-numeric value '{}'",
                func.name(),
                bad
            )));
        }
    }

    let floats = || present.iter().filter_map(|c| c.as_f64()).collect::<Vec<f64>>();
    let all_int = present
        .iter()
        .all(|c| matches!(c, Scalar::Int(_) | Scalar::Bool(_)));

    Ok(match func {
        AggFunc::Sum => {
            if all_int {
                let mut total: i64 = 0;
                let mut overflow = false;
                for c in &present {
                    let v = c.as_f64().unwrap_or(0.0) as i64;
                    match total.checked_add(v) {
                        Some(t) => total = t,
                        None => overflow = true,
                    }
                }
                if overflow {
                    Scalar::Float(floats().iter().sum())
                } else {
                    Scalar::Int(total)
                }
            } else {
                Scalar::Float(floats().iter().sum())
            }
        }
        AggFunc::Prod => {
            if all_int {
                let mut total: i64 = 1;
                for c in &present {
                    let v = c.as_f64().unwrap_or(0.0) as i64;
                    match total.checked_mul(v) {
                        Some(t) => total = t,
                        None => return Ok(Scalar::Float(floats().iter().product())),
                    }
                }
                Scalar::Int(total)
            } else {
                Scalar::Float(floats().iter().product())
            }
        }
        AggFunc::Mean => {
            let values = floats();
            if values.is_empty() {
                Scalar::Null
            } else {
                Scalar::Float(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AggFunc::Median => {
            let mut values = floats();
            if values.is_empty() {
                Scalar::Null
            } else {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    Scalar::Float((values[mid - 1] + values[mid]) / 2.0)
                } else {
                    Scalar::Float(values[mid])
                }
            }
        }
        AggFunc::Std | AggFunc::Var => {
            let values = floats();
            if values.len() < 2 {
                Scalar::Null
            } else {
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                if func == AggFunc::Std {
                    Scalar::Float(var.sqrt())
                } else {
                    Scalar::Float(var)
                }
            }
        }
        AggFunc::Count => Scalar::Int(present.len() as i64),
        AggFunc::Size => Scalar::Int(cells.len() as i64),
        AggFunc::Nunique => {
            let distinct: HashSet<Key> = present.iter().map(|c| Key::from_scalar(c)).collect();
            Scalar::Int(distinct.len() as i64)
        }
        AggFunc::Min | AggFunc::Max => {
            let mut best: Option<&Scalar> = None;
            for c in &present {
                best = match best {
                    None => Some(c),
                    Some(b) => {
                        if mixed_types(b, c) {
                            return Err(ScriptError::type_error(format!(
                                "'<' not supported between instances of '{}' and '{}'",
                                b.type_name(),
                                c.type_name()
                            )));
                        }
                        let ord = compare_scalars(c, b);
                        let better = if func == AggFunc::Min {
                            ord == Ordering::Less
                        } else {
                            ord == Ordering::Greater
                        };
                        Some(if better { c } else { b })
                    }
                };
            }
            best.cloned().unwrap_or(Scalar::Null)
        }
        AggFunc::First => present.first().map(|c| (*c).clone()).unwrap_or(Scalar::Null),
        AggFunc::Last => present.last().map(|c| (*c).clone()).unwrap_or(Scalar::Null),
    })
}

fn mixed_types(a: &Scalar, b: &Scalar) -> bool {
    matches!(
        (a, b),
        (Scalar::Text(_), Scalar::Int(_) | Scalar::Float(_) | Scalar::Bool(_))
            | (Scalar::Int(_) | Scalar::Float(_) | Scalar::Bool(_), Scalar::Text(_))
    )
}

/// Stable ordering of row positions by one or more columns; nulls last in
/// both directions.
fn sorted_positions(columns: &[&[Scalar]], ascending: &[bool], len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.sort_by(|&a, &b| {
        for (col, asc) in columns.iter().zip(ascending.iter()) {
            let (x, y) = (&col[a], &col[b]);
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let ord = compare_scalars(x, y);
                    if *asc {
                        ord
                    } else {
                        ord.reverse()
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    order
}

fn default_labels(len: usize) -> Vec<Scalar> {
    (0..len as i64).map(Scalar::Int).collect()
}

fn take_cells(cells: &[Scalar], rows: &[usize]) -> Vec<Scalar> {
    rows.iter().map(|&r| cells[r].clone()).collect()
}

// ---- Index ----

#[derive(Debug, Clone, PartialEq)]
pub enum Index {
    /// Row labels inherited from a frame
    Rows(Vec<Scalar>),
    /// Group keys or column labels; each label is one cell per level
    Keys {
        names: Vec<String>,
        labels: Vec<Vec<Scalar>>,
    },
}

impl Index {
    pub fn range(len: usize) -> Index {
        Index::Rows(default_labels(len))
    }

    pub fn len(&self) -> usize {
        match self {
            Index::Rows(labels) => labels.len(),
            Index::Keys { labels, .. } => labels.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self, rows: &[usize]) -> Index {
        match self {
            Index::Rows(labels) => Index::Rows(take_cells(labels, rows)),
            Index::Keys { names, labels } => Index::Keys {
                names: names.clone(),
                labels: rows.iter().map(|&r| labels[r].clone()).collect(),
            },
        }
    }

    /// Label at a position: a scalar, or a tuple for multi-level keys
    pub fn label(&self, pos: usize) -> Value {
        match self {
            Index::Rows(labels) => Value::from_scalar(&labels[pos]),
            Index::Keys { labels, .. } => key_label(&labels[pos]),
        }
    }

    pub fn labels(&self) -> Vec<Value> {
        (0..self.len()).map(|i| self.label(i)).collect()
    }

    /// Position of a label, if present
    pub fn find(&self, label: &Value) -> ScriptResult<Option<usize>> {
        let wanted = label.to_key()?;
        Ok((0..self.len()).find(|&i| self.label(i).to_key().ok().as_ref() == Some(&wanted)))
    }

    /// Column names used when the index is turned back into columns
    pub fn column_names(&self) -> Vec<String> {
        match self {
            Index::Rows(_) => vec!["index".to_string()],
            Index::Keys { names, labels } => {
                let levels = labels.first().map(Vec::len).unwrap_or(names.len()).max(names.len());
                (0..levels)
                    .map(|i| match names.get(i) {
                        Some(n) => n.clone(),
                        None if levels == 1 => "index".to_string(),
                        None => format!("level_{}", i),
                    })
                    .collect()
            }
        }
    }

    /// Index levels as columns of cells
    pub fn columns(&self) -> Vec<Vec<Scalar>> {
        match self {
            Index::Rows(labels) => vec![labels.clone()],
            Index::Keys { labels, .. } => {
                let levels = self.column_names().len();
                (0..levels)
                    .map(|lvl| {
                        labels
                            .iter()
                            .map(|l| l.get(lvl).cloned().unwrap_or(Scalar::Null))
                            .collect()
                    })
                    .collect()
            }
        }
    }

    fn is_default(&self) -> bool {
        matches!(self, Index::Rows(labels) if labels.iter().enumerate().all(|(i, l)| *l == Scalar::Int(i as i64)))
    }
}

fn key_label(cells: &[Scalar]) -> Value {
    if cells.len() == 1 {
        Value::from_scalar(&cells[0])
    } else {
        Value::tuple(cells.iter().map(Value::from_scalar).collect())
    }
}

// ---- DataFrame ----

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    pub columns: Vec<String>,
    /// Column-major cells
    pub data: Vec<Vec<Scalar>>,
    /// Row labels
    pub index: Vec<Scalar>,
    /// Number of leading columns acting as the frame's index
    pub key_columns: usize,
}

impl DataFrame {
    pub fn new(columns: Vec<String>, data: Vec<Vec<Scalar>>) -> ScriptResult<Self> {
        let len = data.first().map(Vec::len).unwrap_or(0);
        if data.iter().any(|c| c.len() != len) {
            return Err(ScriptError::value("All arrays must be of the same length"));
        }
        if columns.len() != data.len() {
            return Err(ScriptError::value("column names do not match the data"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(ScriptError::value(format!("duplicate column name '{}'", dup)));
        }
        Ok(Self {
            columns,
            data,
            index: default_labels(len),
            key_columns: 0,
        })
    }

    pub fn from_table(table: &Table) -> Self {
        let data = (0..table.columns.len())
            .map(|c| table.rows.iter().map(|r| r[c].clone()).collect())
            .collect();
        Self {
            columns: table.columns.clone(),
            data,
            index: default_labels(table.rows.len()),
            key_columns: 0,
        }
    }

    pub fn to_table(&self) -> Table {
        let rows = (0..self.nrows())
            .map(|r| self.data.iter().map(|c| c[r].clone()).collect())
            .collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    pub fn nrows(&self) -> usize {
        self.index.len()
    }

    /// Columns excluding grouping keys
    pub fn value_columns(&self) -> &[String] {
        &self.columns[self.key_columns.min(self.columns.len())..]
    }

    pub fn position(&self, name: &str) -> ScriptResult<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ScriptError::key(format!("'{}'", name)))
    }

    /// Index used for series cut from this frame
    pub fn series_index(&self) -> Index {
        if self.key_columns == 0 {
            return Index::Rows(self.index.clone());
        }
        let names = self.columns[..self.key_columns].to_vec();
        let labels = (0..self.nrows())
            .map(|r| self.data[..self.key_columns].iter().map(|c| c[r].clone()).collect())
            .collect();
        Index::Keys { names, labels }
    }

    pub fn column(&self, name: &str) -> ScriptResult<Series> {
        let pos = self.position(name)?;
        Ok(Series {
            name: Some(name.to_string()),
            values: self.data[pos].clone(),
            index: self.series_index(),
        })
    }

    /// Column subset; grouping keys are always kept
    pub fn select(&self, names: &[String]) -> ScriptResult<DataFrame> {
        let mut columns: Vec<String> = self.columns[..self.key_columns].to_vec();
        for name in names {
            self.position(name)?;
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
        let data = columns
            .iter()
            .map(|c| self.position(c).map(|p| self.data[p].clone()))
            .collect::<ScriptResult<Vec<_>>>()?;
        Ok(DataFrame {
            columns,
            data,
            index: self.index.clone(),
            key_columns: self.key_columns,
        })
    }

    pub fn take(&self, rows: &[usize]) -> DataFrame {
        DataFrame {
            columns: self.columns.clone(),
            data: self.data.iter().map(|c| take_cells(c, rows)).collect(),
            index: take_cells(&self.index, rows),
            key_columns: self.key_columns,
        }
    }

    pub fn filter(&self, mask: &[bool]) -> ScriptResult<DataFrame> {
        if mask.len() != self.nrows() {
            return Err(ScriptError::index(format!(
                "Boolean index has wrong length: {} instead of {}",
                mask.len(),
                self.nrows()
            )));
        }
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        Ok(self.take(&rows))
    }

    pub fn set_column(&mut self, name: &str, values: Vec<Scalar>) -> ScriptResult<()> {
        if self.columns.is_empty() && self.nrows() == 0 {
            self.index = default_labels(values.len());
        }
        if values.len() != self.nrows() {
            return Err(ScriptError::value(format!(
                "Length of values ({}) does not match length of index ({})",
                values.len(),
                self.nrows()
            )));
        }
        match self.columns.iter().position(|c| c == name) {
            Some(pos) => self.data[pos] = values,
            None => {
                self.columns.push(name.to_string());
                self.data.push(values);
            }
        }
        Ok(())
    }

    pub fn drop_columns(&self, names: &[String]) -> ScriptResult<DataFrame> {
        for name in names {
            self.position(name)?;
        }
        let keep: Vec<usize> = (0..self.columns.len())
            .filter(|&i| !names.contains(&self.columns[i]))
            .collect();
        let dropped_keys = (0..self.key_columns).filter(|i| !keep.contains(i)).count();
        Ok(DataFrame {
            columns: keep.iter().map(|&i| self.columns[i].clone()).collect(),
            data: keep.iter().map(|&i| self.data[i].clone()).collect(),
            index: self.index.clone(),
            key_columns: self.key_columns - dropped_keys,
        })
    }

    pub fn rename(&self, mapping: &HashMap<String, String>) -> DataFrame {
        let mut out = self.clone();
        for column in &mut out.columns {
            if let Some(new) = mapping.get(column) {
                *column = new.clone();
            }
        }
        out
    }

    pub fn sort_by(&self, by: &[String], ascending: &[bool]) -> ScriptResult<DataFrame> {
        let cols = by
            .iter()
            .map(|c| self.position(c).map(|p| self.data[p].as_slice()))
            .collect::<ScriptResult<Vec<_>>>()?;
        let mut asc = ascending.to_vec();
        asc.resize(by.len(), *ascending.first().unwrap_or(&true));
        Ok(self.take(&sorted_positions(&cols, &asc, self.nrows())))
    }

    pub fn head(&self, n: i64) -> DataFrame {
        let rows = head_positions(self.nrows(), n);
        self.take(&rows)
    }

    pub fn tail(&self, n: i64) -> DataFrame {
        let rows = tail_positions(self.nrows(), n);
        self.take(&rows)
    }

    /// Grouping keys become ordinary columns. Without keys, the row labels
    /// are inserted as an `index` column unless `drop` is set.
    pub fn reset_index(&self, drop: bool) -> DataFrame {
        let mut out = self.clone();
        if self.key_columns > 0 {
            out.key_columns = 0;
        } else if !drop {
            let name = if out.columns.iter().any(|c| c == "index") {
                "level_0"
            } else {
                "index"
            };
            out.columns.insert(0, name.to_string());
            out.data.insert(0, self.index.clone());
        }
        out.index = default_labels(self.nrows());
        out
    }

    pub fn set_index(&self, names: &[String]) -> ScriptResult<DataFrame> {
        let mut columns = names.to_vec();
        for name in names {
            self.position(name)?;
        }
        columns.extend(
            self.columns
                .iter()
                .filter(|c| !names.contains(c))
                .cloned(),
        );
        let mut out = self.reset_index(true).select(&columns)?;
        out.key_columns = names.len();
        Ok(out)
    }

    pub fn dropna(&self, subset: Option<&[String]>, how_all: bool) -> ScriptResult<DataFrame> {
        let positions: Vec<usize> = match subset {
            Some(names) => names
                .iter()
                .map(|n| self.position(n))
                .collect::<ScriptResult<_>>()?,
            None => (0..self.columns.len()).collect(),
        };
        let mask: Vec<bool> = (0..self.nrows())
            .map(|r| {
                let mut nulls = positions.iter().map(|&p| self.data[p][r].is_null());
                if how_all {
                    !nulls.all(|n| n)
                } else {
                    !nulls.any(|n| n)
                }
            })
            .collect();
        self.filter(&mask)
    }

    pub fn fillna(&self, fills: &HashMap<String, Scalar>, default: Option<&Scalar>) -> DataFrame {
        let mut out = self.clone();
        for (name, col) in out.columns.iter().zip(out.data.iter_mut()) {
            let fill = fills.get(name).or(default);
            if let Some(fill) = fill {
                for cell in col.iter_mut().filter(|c| c.is_null()) {
                    *cell = fill.clone();
                }
            }
        }
        out
    }

    pub fn drop_duplicates(&self, subset: Option<&[String]>) -> ScriptResult<DataFrame> {
        let positions: Vec<usize> = match subset {
            Some(names) => names
                .iter()
                .map(|n| self.position(n))
                .collect::<ScriptResult<_>>()?,
            None => (0..self.columns.len()).collect(),
        };
        let mut seen = HashSet::new();
        let rows: Vec<usize> = (0..self.nrows())
            .filter(|&r| {
                let key: Vec<Key> = positions
                    .iter()
                    .map(|&p| Key::from_scalar(&self.data[p][r]))
                    .collect();
                seen.insert(key)
            })
            .collect();
        Ok(self.take(&rows))
    }

    /// One row as a series labelled by column name
    pub fn row(&self, pos: usize) -> Series {
        Series {
            name: Some(self.index[pos].to_string()),
            values: self.data.iter().map(|c| c[pos].clone()).collect(),
            index: Index::Keys {
                names: Vec::new(),
                labels: self
                    .columns
                    .iter()
                    .map(|c| vec![Scalar::Text(c.clone())])
                    .collect(),
            },
        }
    }

    /// Column-wise reduction over value columns
    pub fn reduce(&self, func: AggFunc) -> ScriptResult<Series> {
        let mut labels = Vec::new();
        let mut values = Vec::new();
        for (name, col) in self.columns.iter().zip(self.data.iter()).skip(self.key_columns) {
            if func.numeric_only() && !is_numeric_column(col) {
                continue;
            }
            let cells: Vec<&Scalar> = col.iter().collect();
            labels.push(vec![Scalar::Text(name.clone())]);
            values.push(aggregate_cells(&cells, func)?);
        }
        Ok(Series {
            name: None,
            values,
            index: Index::Keys {
                names: Vec::new(),
                labels,
            },
        })
    }

    pub fn map_cells(&self, f: impl Fn(&Scalar) -> Scalar) -> DataFrame {
        let mut out = self.clone();
        for col in out.data.iter_mut().skip(self.key_columns) {
            for cell in col.iter_mut() {
                *cell = f(cell);
            }
        }
        out
    }

    pub fn render(&self) -> String {
        let mut columns = vec![String::new()];
        columns.extend(self.columns.iter().cloned());
        let rows: Vec<Vec<String>> = render_positions(self.nrows())
            .into_iter()
            .map(|pos| match pos {
                Some(r) => {
                    let mut row = vec![self.index[r].to_string()];
                    row.extend(self.data.iter().map(|c| c[r].to_string()));
                    row
                }
                None => vec!["...".to_string(); columns.len()],
            })
            .collect();
        let mut out = render_grid(&columns, &rows);
        if self.nrows() > RENDER_ROWS {
            let _ = write!(out, "\n[{} rows x {} columns]", self.nrows(), self.columns.len());
        }
        out
    }
}

fn head_positions(len: usize, n: i64) -> Vec<usize> {
    let count = if n >= 0 {
        (n as usize).min(len)
    } else {
        len.saturating_sub(n.unsigned_abs() as usize)
    };
    (0..count).collect()
}

fn tail_positions(len: usize, n: i64) -> Vec<usize> {
    let count = if n >= 0 {
        (n as usize).min(len)
    } else {
        len.saturating_sub(n.unsigned_abs() as usize)
    };
    (len - count..len).collect()
}

fn render_positions(len: usize) -> Vec<Option<usize>> {
    if len <= RENDER_ROWS {
        return (0..len).map(Some).collect();
    }
    let half = RENDER_ROWS / 2;
    let mut out: Vec<Option<usize>> = (0..half).map(Some).collect();
    out.push(None);
    out.extend((len - half..len).map(Some));
    out
}

fn render_grid(header: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| format!("{:>width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
    };
    let mut out = line(header);
    for row in rows {
        out.push('\n');
        out.push_str(&line(row));
    }
    out
}

/// Row-bind frames, aligning columns by name in first-seen order
pub fn concat_frames(frames: &[DataFrame], ignore_index: bool) -> DataFrame {
    let mut columns: Vec<String> = Vec::new();
    for frame in frames {
        for c in &frame.columns {
            if !columns.contains(c) {
                columns.push(c.clone());
            }
        }
    }
    let mut data: Vec<Vec<Scalar>> = vec![Vec::new(); columns.len()];
    let mut index = Vec::new();
    for frame in frames {
        for (i, name) in columns.iter().enumerate() {
            match frame.columns.iter().position(|c| c == name) {
                Some(p) => data[i].extend(frame.data[p].iter().cloned()),
                None => data[i].extend(std::iter::repeat(Scalar::Null).take(frame.nrows())),
            }
        }
        index.extend(frame.index.iter().cloned());
    }
    if ignore_index {
        index = default_labels(index.len());
    }
    DataFrame {
        columns,
        data,
        index,
        key_columns: 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinHow {
    Inner,
    Left,
    Right,
    Outer,
}

impl JoinHow {
    pub fn parse(how: &str) -> ScriptResult<Self> {
        Ok(match how {
            "inner" => JoinHow::Inner,
            "left" => JoinHow::Left,
            "right" => JoinHow::Right,
            "outer" => JoinHow::Outer,
            other => {
                return Err(ScriptError::value(format!(
                    "do not recognize join method {}",
                    other
                )))
            }
        })
    }
}

/// Database-style join of two frames on key columns.
pub fn merge(
    left: &DataFrame,
    right: &DataFrame,
    left_on: &[String],
    right_on: &[String],
    how: JoinHow,
    suffixes: (&str, &str),
) -> ScriptResult<DataFrame> {
    if left_on.is_empty() || left_on.len() != right_on.len() {
        return Err(ScriptError::value("len(left_on) must equal len(right_on)"));
    }
    let left = left.reset_index(true);
    let right = right.reset_index(true);
    let lpos = left_on
        .iter()
        .map(|c| left.position(c))
        .collect::<ScriptResult<Vec<_>>>()?;
    let rpos = right_on
        .iter()
        .map(|c| right.position(c))
        .collect::<ScriptResult<Vec<_>>>()?;

    let shared_keys = left_on == right_on;
    let right_rest: Vec<usize> = (0..right.columns.len())
        .filter(|i| !(shared_keys && rpos.contains(i)))
        .collect();

    let mut columns = Vec::new();
    for name in &left.columns {
        let clash = right_rest.iter().any(|&i| right.columns[i] == *name)
            && !(shared_keys && left_on.contains(name));
        columns.push(if clash {
            format!("{}{}", name, suffixes.0)
        } else {
            name.clone()
        });
    }
    for &i in &right_rest {
        let name = &right.columns[i];
        let clash = left.columns.contains(name);
        columns.push(if clash {
            format!("{}{}", name, suffixes.1)
        } else {
            name.clone()
        });
    }

    let row_key = |frame: &DataFrame, pos: &[usize], r: usize| -> Option<Vec<Key>> {
        let key: Vec<Key> = pos.iter().map(|&p| Key::from_scalar(&frame.data[p][r])).collect();
        // Null keys never match
        if key.iter().any(|k| *k == Key::None) {
            None
        } else {
            Some(key)
        }
    };

    let mut right_rows: HashMap<Vec<Key>, Vec<usize>> = HashMap::new();
    for r in 0..right.nrows() {
        if let Some(key) = row_key(&right, &rpos, r) {
            right_rows.entry(key).or_default().push(r);
        }
    }

    let mut pairs: Vec<(Option<usize>, Option<usize>)> = Vec::new();
    let mut matched_right = vec![false; right.nrows()];
    if how == JoinHow::Right {
        let mut left_rows: HashMap<Vec<Key>, Vec<usize>> = HashMap::new();
        for l in 0..left.nrows() {
            if let Some(key) = row_key(&left, &lpos, l) {
                left_rows.entry(key).or_default().push(l);
            }
        }
        for r in 0..right.nrows() {
            match row_key(&right, &rpos, r).and_then(|k| left_rows.get(&k)) {
                Some(ls) => pairs.extend(ls.iter().map(|&l| (Some(l), Some(r)))),
                None => pairs.push((None, Some(r))),
            }
        }
    } else {
        for l in 0..left.nrows() {
            match row_key(&left, &lpos, l).and_then(|k| right_rows.get(&k)) {
                Some(rs) => {
                    for &r in rs {
                        matched_right[r] = true;
                        pairs.push((Some(l), Some(r)));
                    }
                }
                None if how != JoinHow::Inner => pairs.push((Some(l), None)),
                None => {}
            }
        }
        if how == JoinHow::Outer {
            pairs.extend(
                (0..right.nrows())
                    .filter(|&r| !matched_right[r])
                    .map(|r| (None, Some(r))),
            );
        }
    }

    let mut data: Vec<Vec<Scalar>> = vec![Vec::with_capacity(pairs.len()); columns.len()];
    for (l, r) in &pairs {
        for (ci, col) in left.data.iter().enumerate() {
            let cell = match (l, r) {
                (Some(l), _) => col[*l].clone(),
                // Unmatched right row: shared key columns take the right value
                (None, Some(r)) if shared_keys => match lpos.iter().position(|&p| p == ci) {
                    Some(k) => right.data[rpos[k]][*r].clone(),
                    None => Scalar::Null,
                },
                _ => Scalar::Null,
            };
            data[ci].push(cell);
        }
        for (offset, &ri) in right_rest.iter().enumerate() {
            let cell = r.map(|r| right.data[ri][r].clone()).unwrap_or(Scalar::Null);
            data[left.columns.len() + offset].push(cell);
        }
    }

    DataFrame::new(columns, data)
}

// ---- Series ----

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: Option<String>,
    pub values: Vec<Scalar>,
    pub index: Index,
}

impl Series {
    pub fn new(name: Option<String>, values: Vec<Scalar>) -> Self {
        let index = Index::range(values.len());
        Self {
            name,
            values,
            index,
        }
    }

    /// Same name and index, new values
    pub fn with_values(&self, values: Vec<Scalar>) -> Series {
        Series {
            name: self.name.clone(),
            values,
            index: self.index.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn take(&self, rows: &[usize]) -> Series {
        Series {
            name: self.name.clone(),
            values: take_cells(&self.values, rows),
            index: self.index.take(rows),
        }
    }

    pub fn filter(&self, mask: &[bool]) -> ScriptResult<Series> {
        if mask.len() != self.len() {
            return Err(ScriptError::index(format!(
                "Boolean index has wrong length: {} instead of {}",
                mask.len(),
                self.len()
            )));
        }
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        Ok(self.take(&rows))
    }

    pub fn reduce(&self, func: AggFunc) -> ScriptResult<Scalar> {
        let cells: Vec<&Scalar> = self.values.iter().collect();
        aggregate_cells(&cells, func)
    }

    pub fn sort_values(&self, ascending: bool) -> Series {
        let order = sorted_positions(&[&self.values], &[ascending], self.len());
        self.take(&order)
    }

    pub fn sort_index(&self, ascending: bool) -> Series {
        let columns = self.index.columns();
        let refs: Vec<&[Scalar]> = columns.iter().map(Vec::as_slice).collect();
        let asc = vec![ascending; refs.len()];
        let order = sorted_positions(&refs, &asc, self.len());
        self.take(&order)
    }

    pub fn head(&self, n: i64) -> Series {
        self.take(&head_positions(self.len(), n))
    }

    pub fn tail(&self, n: i64) -> Series {
        self.take(&tail_positions(self.len(), n))
    }

    /// Distinct non-null values in first-seen order
    pub fn unique(&self) -> Vec<Scalar> {
        let mut seen = HashSet::new();
        self.values
            .iter()
            .filter(|v| seen.insert(Key::from_scalar(v)))
            .cloned()
            .collect()
    }

    /// Occurrence counts, most frequent first; ties keep first-seen order
    pub fn value_counts(&self, normalize: bool, ascending: bool) -> Series {
        let mut counts: Vec<(Scalar, i64)> = Vec::new();
        let mut slots: HashMap<Key, usize> = HashMap::new();
        for v in self.values.iter().filter(|v| !v.is_null()) {
            let key = Key::from_scalar(v);
            match slots.get(&key) {
                Some(&slot) => counts[slot].1 += 1,
                None => {
                    slots.insert(key, counts.len());
                    counts.push((v.clone(), 1));
                }
            }
        }
        if ascending {
            counts.sort_by_key(|(_, c)| *c);
        } else {
            counts.sort_by_key(|(_, c)| std::cmp::Reverse(*c));
        }
        let total: i64 = counts.iter().map(|(_, c)| c).sum();
        let values = counts
            .iter()
            .map(|(_, c)| {
                if normalize {
                    Scalar::Float(*c as f64 / total.max(1) as f64)
                } else {
                    Scalar::Int(*c)
                }
            })
            .collect();
        Series {
            name: Some(if normalize { "proportion" } else { "count" }.to_string()),
            values,
            index: Index::Keys {
                names: self.name.iter().cloned().collect(),
                labels: counts.into_iter().map(|(v, _)| vec![v]).collect(),
            },
        }
    }

    /// Label of the largest (or smallest) non-null value
    pub fn idx_extreme(&self, max: bool) -> ScriptResult<Value> {
        let mut best: Option<usize> = None;
        for (i, v) in self.values.iter().enumerate() {
            if v.is_null() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let ord = compare_scalars(v, &self.values[b]);
                    let better = if max {
                        ord == Ordering::Greater
                    } else {
                        ord == Ordering::Less
                    };
                    Some(if better { i } else { b })
                }
            };
        }
        best.map(|i| self.index.label(i)).ok_or_else(|| {
            ScriptError::value(format!(
                "attempt to get {} of an empty sequence",
                if max { "argmax" } else { "argmin" }
            ))
        })
    }

    /// Running sums, keeping nulls in place
    pub fn cumsum(&self) -> Series {
        let mut total: Option<f64> = None;
        let all_int = self.values.iter().all(|v| matches!(v, Scalar::Int(_) | Scalar::Null));
        let values = self
            .values
            .iter()
            .map(|v| match v.as_f64() {
                Some(f) => {
                    let t = total.unwrap_or(0.0) + f;
                    total = Some(t);
                    if all_int {
                        Scalar::Int(t as i64)
                    } else {
                        Scalar::Float(t)
                    }
                }
                None => Scalar::Null,
            })
            .collect();
        self.with_values(values)
    }

    pub fn shift(&self, periods: i64) -> Series {
        let len = self.len() as i64;
        let values = (0..len)
            .map(|i| {
                let src = i - periods;
                if src >= 0 && src < len {
                    self.values[src as usize].clone()
                } else {
                    Scalar::Null
                }
            })
            .collect();
        self.with_values(values)
    }

    pub fn diff(&self, periods: i64) -> Series {
        let shifted = self.shift(periods);
        let values = self
            .values
            .iter()
            .zip(shifted.values.iter())
            .map(|(a, b)| match (a, b) {
                (Scalar::Int(x), Scalar::Int(y)) => Scalar::Int(x - y),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => Scalar::Float(x - y),
                    _ => Scalar::Null,
                },
            })
            .collect();
        self.with_values(values)
    }

    pub fn pct_change(&self, periods: i64) -> Series {
        let shifted = self.shift(periods);
        let values = self
            .values
            .iter()
            .zip(shifted.values.iter())
            .map(|(a, b)| match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) if y != 0.0 => Scalar::Float(x / y - 1.0),
                _ => Scalar::Null,
            })
            .collect();
        self.with_values(values)
    }

    /// Name used for the value column when the series becomes a frame
    pub fn value_column_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "0".to_string())
    }

    /// Index levels become columns followed by the values
    pub fn to_frame_with_index(&self) -> ScriptResult<DataFrame> {
        let mut columns = self.index.column_names();
        let mut data = self.index.columns();
        let mut value_name = self.value_column_name();
        if columns.contains(&value_name) {
            value_name = format!("{}_value", value_name);
        }
        columns.push(value_name);
        data.push(self.values.clone());
        DataFrame::new(columns, data)
    }

    /// Single-column frame keeping this series' index
    pub fn to_frame(&self) -> DataFrame {
        match &self.index {
            Index::Rows(labels) => DataFrame {
                columns: vec![self.value_column_name()],
                data: vec![self.values.clone()],
                index: labels.clone(),
                key_columns: 0,
            },
            Index::Keys { .. } => {
                let levels = self.index.column_names().len();
                match self.to_frame_with_index() {
                    Ok(mut frame) => {
                        frame.key_columns = levels;
                        frame
                    }
                    Err(_) => DataFrame::default(),
                }
            }
        }
    }

    /// Tabular form of a result series: keyed series keep their keys as
    /// columns; plain series become one column.
    pub fn to_table(&self) -> ScriptResult<Table> {
        match &self.index {
            Index::Keys { .. } => Ok(self.to_frame_with_index()?.to_table()),
            Index::Rows(_) => {
                let name = self.name.clone().unwrap_or_else(|| "value".to_string());
                Ok(Table {
                    columns: vec![name],
                    rows: self.values.iter().map(|v| vec![v.clone()]).collect(),
                })
            }
        }
    }

    pub fn render(&self) -> String {
        let rows: Vec<Vec<String>> = render_positions(self.len())
            .into_iter()
            .map(|pos| match pos {
                Some(i) => vec![self.index.label(i).to_str(), self.values[i].to_string()],
                None => vec!["...".to_string(), String::new()],
            })
            .collect();
        let mut out = render_grid(&[String::new(), String::new()], &rows);
        let out_trimmed = out.trim_start_matches([' ', '\n']).to_string();
        out = out_trimmed;
        if let Some(name) = &self.name {
            let _ = write!(out, "\nName: {}", name);
        }
        if self.index.is_default() && self.len() > RENDER_ROWS {
            let _ = write!(out, ", Length: {}", self.len());
        }
        out
    }
}

// ---- GroupBy ----

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    All,
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct GroupBy {
    pub frame: DataFrame,
    pub keys: Vec<String>,
    pub selection: Selection,
    pub dropna: bool,
    /// `as_index=False` returns keys as ordinary columns
    pub as_index: bool,
}

/// One output column of a grouped aggregation
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub output: String,
    pub column: String,
    pub func: AggFunc,
}

impl GroupBy {
    pub fn new(frame: DataFrame, keys: Vec<String>, dropna: bool) -> ScriptResult<Self> {
        if keys.is_empty() {
            return Err(ScriptError::value("No group keys passed!"));
        }
        let frame = frame.reset_index(true);
        for key in &keys {
            frame.position(key)?;
        }
        Ok(Self {
            frame,
            keys,
            selection: Selection::All,
            dropna,
            as_index: true,
        })
    }

    pub fn select(&self, selection: Selection) -> ScriptResult<GroupBy> {
        match &selection {
            Selection::One(c) => {
                self.frame.position(c)?;
            }
            Selection::Many(cs) => {
                for c in cs {
                    self.frame.position(c)?;
                }
            }
            Selection::All => {}
        }
        Ok(GroupBy {
            selection,
            ..self.clone()
        })
    }

    /// Groups in first-seen order of their key tuple
    pub fn partition(&self) -> ScriptResult<Vec<(Vec<Scalar>, Vec<usize>)>> {
        let positions = self
            .keys
            .iter()
            .map(|k| self.frame.position(k))
            .collect::<ScriptResult<Vec<_>>>()?;
        let mut groups: Vec<(Vec<Scalar>, Vec<usize>)> = Vec::new();
        let mut slots: HashMap<Vec<Key>, usize> = HashMap::new();
        for r in 0..self.frame.nrows() {
            let cells: Vec<Scalar> = positions
                .iter()
                .map(|&p| self.frame.data[p][r].clone())
                .collect();
            if self.dropna && cells.iter().any(Scalar::is_null) {
                continue;
            }
            let key: Vec<Key> = cells.iter().map(Key::from_scalar).collect();
            match slots.get(&key) {
                Some(&slot) => groups[slot].1.push(r),
                None => {
                    slots.insert(key, groups.len());
                    groups.push((cells, vec![r]));
                }
            }
        }
        Ok(groups)
    }

    /// `(key, sub-frame)` pairs for iteration
    pub fn groups(&self) -> ScriptResult<Vec<(Value, DataFrame)>> {
        Ok(self
            .partition()?
            .into_iter()
            .map(|(key, rows)| (key_label(&key), self.frame.take(&rows)))
            .collect())
    }

    pub fn ngroups(&self) -> ScriptResult<usize> {
        Ok(self.partition()?.len())
    }

    /// Columns an aggregation applies to
    fn target_columns(&self, func: AggFunc) -> Vec<String> {
        match &self.selection {
            Selection::One(c) => vec![c.clone()],
            Selection::Many(cs) => cs.clone(),
            Selection::All => self
                .frame
                .columns
                .iter()
                .zip(self.frame.data.iter())
                .filter(|(name, col)| {
                    !self.keys.contains(name) && (!func.numeric_only() || is_numeric_column(col))
                })
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }

    /// Apply one aggregation. A single selected column yields a series
    /// indexed by the group keys; otherwise a frame with the keys first.
    pub fn aggregate(&self, func: AggFunc) -> ScriptResult<Value> {
        let groups = self.partition()?;
        let names = self.keys.clone();
        let labels: Vec<Vec<Scalar>> = groups.iter().map(|(k, _)| k.clone()).collect();

        if func == AggFunc::Size {
            let values = groups
                .iter()
                .map(|(_, rows)| Scalar::Int(rows.len() as i64))
                .collect();
            return Ok(Value::series(Series {
                name: Some("size".to_string()),
                values,
                index: Index::Keys { names, labels },
            }));
        }

        if let Selection::One(column) = &self.selection {
            let values = self.aggregate_column(&groups, column, func)?;
            return Ok(Value::series(Series {
                name: Some(column.clone()),
                values,
                index: Index::Keys { names, labels },
            }));
        }

        let specs: Vec<AggSpec> = self
            .target_columns(func)
            .into_iter()
            .map(|c| AggSpec {
                output: c.clone(),
                column: c,
                func,
            })
            .collect();
        Ok(Value::frame(self.aggregate_specs_with(&groups, &specs)?))
    }

    /// Apply explicit `(output, column, func)` aggregations
    pub fn aggregate_specs(&self, specs: &[AggSpec]) -> ScriptResult<DataFrame> {
        let groups = self.partition()?;
        self.aggregate_specs_with(&groups, specs)
    }

    /// Each function applied to every selected column, named `col_func`
    /// (or just `func` when a single column is selected).
    pub fn aggregate_many(&self, funcs: &[AggFunc]) -> ScriptResult<DataFrame> {
        let mut specs = Vec::new();
        let single = matches!(self.selection, Selection::One(_));
        let mut columns = self.target_columns(AggFunc::Count);
        if !single {
            let numeric_only = funcs.iter().any(AggFunc::numeric_only);
            if numeric_only && self.selection == Selection::All {
                columns = self.target_columns(AggFunc::Sum);
            }
        }
        for column in &columns {
            for func in funcs {
                let output = if single {
                    func.name().to_string()
                } else {
                    format!("{}_{}", column, func.name())
                };
                specs.push(AggSpec {
                    output,
                    column: column.clone(),
                    func: *func,
                });
            }
        }
        self.aggregate_specs(&specs)
    }

    fn aggregate_specs_with(
        &self,
        groups: &[(Vec<Scalar>, Vec<usize>)],
        specs: &[AggSpec],
    ) -> ScriptResult<DataFrame> {
        let mut columns = self.keys.clone();
        let mut data: Vec<Vec<Scalar>> = (0..self.keys.len())
            .map(|k| groups.iter().map(|(key, _)| key[k].clone()).collect())
            .collect();
        for spec in specs {
            if columns.contains(&spec.output) {
                continue;
            }
            columns.push(spec.output.clone());
            data.push(self.aggregate_column(groups, &spec.column, spec.func)?);
        }
        let mut frame = DataFrame::new(columns, data)?;
        frame.key_columns = self.keys.len();
        Ok(frame)
    }

    fn aggregate_column(
        &self,
        groups: &[(Vec<Scalar>, Vec<usize>)],
        column: &str,
        func: AggFunc,
    ) -> ScriptResult<Vec<Scalar>> {
        let pos = self.frame.position(column)?;
        let col = &self.frame.data[pos];
        groups
            .iter()
            .map(|(_, rows)| {
                let cells: Vec<&Scalar> = rows.iter().map(|&r| &col[r]).collect();
                aggregate_cells(&cells, func)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.to_string())
    }

    fn sample() -> DataFrame {
        DataFrame::new(
            vec!["Group".into(), "X".into()],
            vec![
                vec![text("A"), text("B"), text("A")],
                vec![Scalar::Int(100), Scalar::Int(200), Scalar::Int(300)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_groupby_mean_first_seen_order() {
        let gb = GroupBy::new(sample(), vec!["Group".into()], true)
            .unwrap()
            .select(Selection::One("X".into()))
            .unwrap();
        let Value::Series(series) = gb.aggregate(AggFunc::Mean).unwrap() else {
            panic!("expected a series");
        };
        assert_eq!(series.values, vec![Scalar::Float(200.0), Scalar::Float(200.0)]);
        let table = series.to_table().unwrap();
        assert_eq!(table.columns, vec!["Group", "X"]);
        assert_eq!(table.rows[0], vec![text("A"), Scalar::Float(200.0)]);
        assert_eq!(table.rows[1], vec![text("B"), Scalar::Float(200.0)]);
    }

    #[test]
    fn test_groupby_sum_keeps_integers_and_skips_text() {
        let mut frame = sample();
        frame
            .set_column("Label", vec![text("x"), text("y"), text("z")])
            .unwrap();
        let gb = GroupBy::new(frame, vec!["Group".into()], true).unwrap();
        let Value::Frame(result) = gb.aggregate(AggFunc::Sum).unwrap() else {
            panic!("expected a frame");
        };
        let result = result.borrow();
        assert_eq!(result.columns, vec!["Group", "X"]);
        assert_eq!(result.data[1], vec![Scalar::Int(400), Scalar::Int(200)]);
        assert_eq!(result.key_columns, 1);
    }

    #[test]
    fn test_aggregations_skip_nulls() {
        let cells = [Scalar::Int(1), Scalar::Null, Scalar::Int(4)];
        let refs: Vec<&Scalar> = cells.iter().collect();
        assert_eq!(aggregate_cells(&refs, AggFunc::Mean).unwrap(), Scalar::Float(2.5));
        assert_eq!(aggregate_cells(&refs, AggFunc::Count).unwrap(), Scalar::Int(2));
        assert_eq!(aggregate_cells(&refs, AggFunc::Size).unwrap(), Scalar::Int(3));
        assert_eq!(aggregate_cells(&refs, AggFunc::Max).unwrap(), Scalar::Int(4));
        assert_eq!(aggregate_cells(&refs, AggFunc::Median).unwrap(), Scalar::Float(2.5));
    }

    #[test]
    fn test_mean_of_text_is_type_error() {
        let cells = [text("a")];
        let refs: Vec<&Scalar> = cells.iter().collect();
        assert!(aggregate_cells(&refs, AggFunc::Mean).is_err());
    }

    #[test]
    fn test_sort_by_descending_nulls_last() {
        let frame = DataFrame::new(
            vec!["v".into()],
            vec![vec![Scalar::Int(2), Scalar::Null, Scalar::Int(5)]],
        )
        .unwrap();
        let sorted = frame.sort_by(&["v".into()], &[false]).unwrap();
        assert_eq!(sorted.data[0], vec![Scalar::Int(5), Scalar::Int(2), Scalar::Null]);
        assert_eq!(sorted.index, vec![Scalar::Int(2), Scalar::Int(0), Scalar::Int(1)]);
    }

    #[test]
    fn test_value_counts() {
        let series = Series::new(
            Some("Region".into()),
            vec![text("N"), text("S"), text("S"), Scalar::Null],
        );
        let counts = series.value_counts(false, false);
        assert_eq!(counts.values, vec![Scalar::Int(2), Scalar::Int(1)]);
        assert_eq!(counts.index.label(0).to_str(), "S");
        let table = counts.to_table().unwrap();
        assert_eq!(table.columns, vec!["Region", "count"]);
    }

    #[test]
    fn test_merge_inner_with_suffixes() {
        let left = DataFrame::new(
            vec!["id".into(), "v".into()],
            vec![
                vec![Scalar::Int(1), Scalar::Int(2)],
                vec![Scalar::Int(10), Scalar::Int(20)],
            ],
        )
        .unwrap();
        let right = DataFrame::new(
            vec!["id".into(), "v".into()],
            vec![
                vec![Scalar::Int(2), Scalar::Int(3)],
                vec![Scalar::Int(200), Scalar::Int(300)],
            ],
        )
        .unwrap();
        let merged = merge(
            &left,
            &right,
            &["id".into()],
            &["id".into()],
            JoinHow::Inner,
            ("_x", "_y"),
        )
        .unwrap();
        assert_eq!(merged.columns, vec!["id", "v_x", "v_y"]);
        assert_eq!(merged.nrows(), 1);
        assert_eq!(merged.data[2], vec![Scalar::Int(200)]);

        let outer = merge(
            &left,
            &right,
            &["id".into()],
            &["id".into()],
            JoinHow::Outer,
            ("_x", "_y"),
        )
        .unwrap();
        assert_eq!(outer.nrows(), 3);
        assert_eq!(outer.data[0][2], Scalar::Int(3));
    }

    #[test]
    fn test_concat_aligns_columns() {
        let a = DataFrame::new(vec!["x".into()], vec![vec![Scalar::Int(1)]]).unwrap();
        let b = DataFrame::new(vec!["y".into()], vec![vec![Scalar::Int(2)]]).unwrap();
        let out = concat_frames(&[a, b], true);
        assert_eq!(out.columns, vec!["x", "y"]);
        assert_eq!(out.data[0], vec![Scalar::Int(1), Scalar::Null]);
        assert_eq!(out.index, vec![Scalar::Int(0), Scalar::Int(1)]);
    }

    #[test]
    fn test_reset_index_on_filtered_frame() {
        let frame = sample().filter(&[false, true, true]).unwrap();
        let dropped = frame.reset_index(true);
        assert_eq!(dropped.columns, vec!["Group", "X"]);
        let kept = frame.reset_index(false);
        assert_eq!(kept.columns, vec!["index", "Group", "X"]);
        assert_eq!(kept.data[0], vec![Scalar::Int(1), Scalar::Int(2)]);
    }

    #[test]
    fn test_pct_change_and_diff() {
        let s = Series::new(None, vec![Scalar::Int(100), Scalar::Int(110), Scalar::Int(99)]);
        assert_eq!(s.diff(1).values, vec![Scalar::Null, Scalar::Int(10), Scalar::Int(-11)]);
        let pct = s.pct_change(1);
        assert_eq!(pct.values[0], Scalar::Null);
        match pct.values[1] {
            Scalar::Float(f) => assert!((f - 0.1).abs() < 1e-9),
            ref other => panic!("unexpected {:?}", other),
        }
    }
}
