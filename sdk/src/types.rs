//! Tabular and dataset types

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A single cell of a table.
///
/// Serialized without a tag so that records read naturally as JSON:
/// `{"Group": "A", "X": 200.0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Parse a raw text cell (as read from a CSV file) into a typed value.
    ///
    /// Empty cells become `Null`. Only empty cells are treated as missing, so
    /// values like "NA" (North America) stay text.
    pub fn parse_cell(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Scalar::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Scalar::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Scalar::Float(f);
            }
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => Scalar::Bool(true),
            "false" => Scalar::Bool(false),
            _ => Scalar::Text(raw.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Float(_))
    }

    /// Numeric view of the value. Booleans count as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the value's type as shown to generated code.
    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Null => "NoneType",
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "int",
            Scalar::Float(_) => "float",
            Scalar::Text(_) => "str",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Null => serde_json::Value::Null,
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Int(i) => serde_json::Value::from(*i),
            Scalar::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Scalar::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "None"),
            Scalar::Bool(true) => write!(f, "True"),
            Scalar::Bool(false) => write!(f, "False"),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// Errors raised while building tables
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TableError {
    #[error("Row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),
}

/// Row-major table with ordered, uniquely named columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl Table {
    /// Create an empty table with the given columns
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table, checking that every row matches the column count and
    /// that column names are unique.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Scalar>>) -> Result<Self, TableError> {
        for (i, name) in columns.iter().enumerate() {
            if columns[..i].contains(name) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
        }
        for (row, cells) in rows.iter().enumerate() {
            if cells.len() != columns.len() {
                return Err(TableError::RaggedRow {
                    row,
                    found: cells.len(),
                    expected: columns.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, in row order
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &Scalar> + '_ {
        self.rows.iter().map(move |row| &row[index])
    }

    /// The first `n` rows
    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Rows as ordered column-name → value mappings.
    ///
    /// Column order and row order are preserved exactly.
    pub fn to_records(&self) -> Vec<IndexMap<String, Scalar>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<IndexMap<_, _>>()
            })
            .collect()
    }
}

/// Inferred type of a dataset column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Categorical,
    Date,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Numeric => write!(f, "numeric"),
            ColumnType::Categorical => write!(f, "categorical"),
            ColumnType::Date => write!(f, "date"),
        }
    }
}

/// Granularity of the period a file covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Monthly,
    Quarterly,
    Yearly,
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodType::Monthly => write!(f, "monthly"),
            PeriodType::Quarterly => write!(f, "quarterly"),
            PeriodType::Yearly => write!(f, "yearly"),
        }
    }
}

/// Description of one uploaded dataset as supplied by the dataset provider.
///
/// `version` changes whenever the file content changes, even if the name
/// stays the same.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Stable identifier of the upload
    pub id: String,

    /// Binding name exposed to generated code (e.g. "sales_q1")
    pub name: String,

    /// Column names in file order
    pub columns: Vec<String>,

    /// Inferred type per column
    pub column_types: IndexMap<String, ColumnType>,

    /// A light sample of rows for prompting
    #[serde(default)]
    pub sample_rows: Vec<IndexMap<String, Scalar>>,

    /// Total number of data rows
    #[serde(default)]
    pub row_count: usize,

    /// Content version (hash) of the file
    pub version: String,

    /// Where the provider can load the full table from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Period read from the file name, e.g. "Q1 2025"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_period: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_type: Option<PeriodType>,
}

impl DatasetDescriptor {
    /// "Period: Q1 2025 (quarterly)" when a period was detected
    pub fn period_note(&self) -> Option<String> {
        let period = self.time_period.as_deref()?;
        Some(match self.period_type {
            Some(kind) => format!("Period: {} ({})", period, kind),
            None => format!("Period: {}", period),
        })
    }

    /// Columns of the given type, in file order
    pub fn columns_of_type(&self, column_type: ColumnType) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| self.column_types.get(*c) == Some(&column_type))
            .map(String::as_str)
            .collect()
    }
}

/// Tabular result: ordered columns plus ordered records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub records: Vec<IndexMap<String, Scalar>>,
}

impl From<&Table> for TabularResult {
    fn from(table: &Table) -> Self {
        Self {
            columns: table.columns.clone(),
            records: table.to_records(),
        }
    }
}

/// Serialized output of a successful sandbox run.
///
/// Scalars pass through as bare typed values; anything table-shaped is a
/// `TabularResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Table(TabularResult),
    Scalar(Scalar),
    List(Vec<serde_json::Value>),
    Mapping(IndexMap<String, serde_json::Value>),
}

impl ResultValue {
    /// Number of rows for tables, items for lists, 1 otherwise
    pub fn row_count(&self) -> usize {
        match self {
            ResultValue::Table(t) => t.records.len(),
            ResultValue::List(items) => items.len(),
            ResultValue::Mapping(entries) => entries.len(),
            ResultValue::Scalar(_) => 1,
        }
    }

    pub fn as_table(&self) -> Option<&TabularResult> {
        match self {
            ResultValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Pretty JSON, truncated to at most `max_chars` characters.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = serde_json::to_string_pretty(self).unwrap_or_default();
        if text.chars().count() <= max_chars {
            text
        } else {
            let mut cut: String = text.chars().take(max_chars).collect();
            cut.push_str("\n... (truncated)");
            cut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_table() -> Table {
        Table::from_rows(
            vec!["Group".to_string(), "X".to_string()],
            vec![
                vec![Scalar::from("A"), Scalar::Int(100)],
                vec![Scalar::from("B"), Scalar::Int(200)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_cell() {
        assert_eq!(Scalar::parse_cell(""), Scalar::Null);
        assert_eq!(Scalar::parse_cell(" 42 "), Scalar::Int(42));
        assert_eq!(Scalar::parse_cell("3.5"), Scalar::Float(3.5));
        assert_eq!(Scalar::parse_cell("TRUE"), Scalar::Bool(true));
        assert_eq!(Scalar::parse_cell("NA"), Scalar::Text("NA".to_string()));
        assert_eq!(Scalar::parse_cell("inf"), Scalar::Text("inf".to_string()));
    }

    #[test]
    fn test_scalar_display() {
        assert_eq!(Scalar::Float(200.0).to_string(), "200.0");
        assert_eq!(Scalar::Float(2.5).to_string(), "2.5");
        assert_eq!(Scalar::Bool(true).to_string(), "True");
        assert_eq!(Scalar::Null.to_string(), "None");
    }

    #[test]
    fn test_scalar_untagged_serialization() {
        assert_eq!(serde_json::to_value(Scalar::Int(3)).unwrap(), json!(3));
        assert_eq!(serde_json::to_value(Scalar::Null).unwrap(), json!(null));
        let parsed: Scalar = serde_json::from_str("2.0").unwrap();
        assert_eq!(parsed, Scalar::Float(2.0));
        let parsed: Scalar = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, Scalar::Int(7));
    }

    #[test]
    fn test_from_rows_rejects_ragged_rows() {
        let err = Table::from_rows(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![Scalar::Int(1)]],
        )
        .unwrap_err();
        assert_eq!(
            err,
            TableError::RaggedRow {
                row: 0,
                found: 1,
                expected: 2
            }
        );
    }

    #[test]
    fn test_from_rows_rejects_duplicate_columns() {
        let err = Table::from_rows(vec!["a".to_string(), "a".to_string()], vec![]).unwrap_err();
        assert_eq!(err, TableError::DuplicateColumn("a".to_string()));
    }

    #[test]
    fn test_to_records_preserves_column_order() {
        let records = sample_table().to_records();
        assert_eq!(records.len(), 2);
        let keys: Vec<&String> = records[0].keys().collect();
        assert_eq!(keys, vec!["Group", "X"]);
        let json = serde_json::to_string(&records[1]).unwrap();
        assert_eq!(json, r#"{"Group":"B","X":200}"#);
    }

    #[test]
    fn test_result_value_table_shape() {
        let value = ResultValue::Table(TabularResult::from(&sample_table()));
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["columns"], json!(["Group", "X"]));
        assert_eq!(json["records"][0]["Group"], json!("A"));

        let back: ResultValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_result_value_scalar_is_unwrapped() {
        let value = ResultValue::Scalar(Scalar::Float(12.5));
        assert_eq!(serde_json::to_string(&value).unwrap(), "12.5");
        let mapping: ResultValue = serde_json::from_str(r#"{"total": 3}"#).unwrap();
        assert!(matches!(mapping, ResultValue::Mapping(_)));
    }

    #[test]
    fn test_preview_truncates() {
        let value = ResultValue::Scalar(Scalar::Text("x".repeat(100)));
        let preview = value.preview(20);
        assert!(preview.ends_with("(truncated)"));
    }
}
