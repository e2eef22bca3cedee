//! Dataset provider
//!
//! Loads uploaded CSV files into tables and describes them for prompting:
//! column names, inferred column types, a few sample rows and a content
//! version. The version is the SHA-256 of the file bytes, so re-uploading
//! changed content under the same name yields a new version and
//! invalidates cached results that referenced the old one.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use regex::Regex;
use sdk::{ColumnType, DatasetDescriptor, PeriodType, Scalar, Table};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};

/// Rows kept in a descriptor for prompting
pub const DEFAULT_SAMPLE_ROWS: usize = 5;

/// Candidate delimiters, in tie-break order
const DELIMITERS: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Full month names precede their abbreviations so the longest form wins
const MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec";

struct PeriodPatterns {
    quarter: Regex,
    year_quarter: Regex,
    month: Regex,
    year: Regex,
}

static PERIOD_PATTERNS: OnceLock<Option<PeriodPatterns>> = OnceLock::new();

fn period_patterns() -> Option<&'static PeriodPatterns> {
    PERIOD_PATTERNS
        .get_or_init(|| {
            Some(PeriodPatterns {
                quarter: Regex::new(r"q([1-4])[-_\s]?(\d{4})").ok()?,
                year_quarter: Regex::new(r"(\d{4})[-_\s]?q([1-4])").ok()?,
                month: Regex::new(&format!(r"({})[-_\s]?(\d{{4}})", MONTHS)).ok()?,
                year: Regex::new(r"(?:^|\D)(\d{4})(?:\D|$)").ok()?,
            })
        })
        .as_ref()
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Malformed table: {0}")]
    Table(#[from] sdk::TableError),

    #[error("File has no header row")]
    NoHeader,

    #[error("Dataset {0} has no source to load from")]
    MissingSource(String),

    #[error("Dataset {name} changed since it was described (expected version {expected})")]
    VersionMismatch { name: String, expected: String },
}

impl From<DatasetError> for sdk::EngineError {
    fn from(e: DatasetError) -> Self {
        sdk::EngineError::Dataset(e.to_string())
    }
}

/// Source of full tables for the datasets a run uses.
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    async fn load(&self, descriptor: &DatasetDescriptor) -> Result<Table, DatasetError>;
}

/// Reads CSV files from disk.
#[derive(Debug, Clone)]
pub struct CsvDatasetProvider {
    sample_rows: usize,
}

impl Default for CsvDatasetProvider {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_ROWS)
    }
}

impl CsvDatasetProvider {
    pub fn new(sample_rows: usize) -> Self {
        Self { sample_rows }
    }

    /// Describe a CSV file on disk. The dataset id defaults to the file name.
    pub async fn describe_path(
        &self,
        path: &Path,
        id: Option<&str>,
    ) -> Result<DatasetDescriptor, DatasetError> {
        let bytes = read_file(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        let mut descriptor =
            self.describe_bytes(id.unwrap_or(&file_name), &file_name, &bytes)?;
        descriptor.source = Some(path.to_path_buf());
        info!(
            "Described {} ({} rows, {} columns)",
            file_name,
            descriptor.row_count,
            descriptor.columns.len()
        );
        Ok(descriptor)
    }

    /// Describe in-memory CSV content
    pub fn describe_bytes(
        &self,
        id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<DatasetDescriptor, DatasetError> {
        let table = parse_csv(bytes)?;
        let column_types = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let cells: Vec<&Scalar> = table.column_values(i).collect();
                (name.clone(), infer_column_type(&cells))
            })
            .collect::<IndexMap<_, _>>();

        let period = detect_time_period(file_name);
        if let Some((label, kind)) = &period {
            debug!("{} covers {} ({})", file_name, label, kind);
        }
        let (time_period, period_type) = period.unzip();

        Ok(DatasetDescriptor {
            id: id.to_string(),
            name: binding_name(file_name),
            columns: table.columns.clone(),
            column_types,
            sample_rows: table.head(self.sample_rows).to_records(),
            row_count: table.len(),
            version: content_version(bytes),
            source: None,
            time_period,
            period_type,
        })
    }
}

#[async_trait]
impl DatasetProvider for CsvDatasetProvider {
    async fn load(&self, descriptor: &DatasetDescriptor) -> Result<Table, DatasetError> {
        let path = descriptor
            .source
            .as_ref()
            .ok_or_else(|| DatasetError::MissingSource(descriptor.id.clone()))?;
        let bytes = read_file(path).await?;
        if content_version(&bytes) != descriptor.version {
            return Err(DatasetError::VersionMismatch {
                name: descriptor.name.clone(),
                expected: descriptor.version.clone(),
            });
        }
        let table = parse_csv(&bytes)?;
        debug!("Loaded {} ({} rows)", descriptor.name, table.len());
        Ok(table)
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, DatasetError> {
    tokio::fs::read(path).await.map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// SHA-256 of the file content, hex encoded
pub fn content_version(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Identifier-safe binding name derived from a file name:
/// `"Sales Q1-2024.csv"` becomes `sales_q1_2024`.
pub fn binding_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('_') {
            name.push('_');
        }
    }
    let name = name.trim_matches('_').to_string();
    match name.chars().next() {
        None => "data".to_string(),
        Some(c) if c.is_ascii_digit() => format!("data_{}", name),
        Some(_) => name,
    }
}

/// Read the period a file covers from its name.
///
/// `sales_q1_2025.csv` is "Q1 2025" (quarterly), `sales_nov_2024.csv` and
/// `sales_november_2024.csv` are "Nov 2024" (monthly), `sales_2024.csv` is
/// "2024" (yearly). Years outside 2000-2099 are ignored.
pub fn detect_time_period(file_name: &str) -> Option<(String, PeriodType)> {
    let stem = Path::new(file_name)
        .file_stem()?
        .to_string_lossy()
        .to_lowercase();
    let patterns = period_patterns()?;

    if let Some(c) = patterns.quarter.captures(&stem) {
        return Some((format!("Q{} {}", &c[1], &c[2]), PeriodType::Quarterly));
    }
    if let Some(c) = patterns.year_quarter.captures(&stem) {
        return Some((format!("Q{} {}", &c[2], &c[1]), PeriodType::Quarterly));
    }
    if let Some(c) = patterns.month.captures(&stem) {
        let month = &c[1][..3];
        let label = format!("{}{} {}", month[..1].to_uppercase(), &month[1..], &c[2]);
        return Some((label, PeriodType::Monthly));
    }
    patterns
        .year
        .captures_iter(&stem)
        .map(|c| c[1].to_string())
        .find(|y| y.starts_with("20"))
        .map(|y| (y, PeriodType::Yearly))
}

/// Decode as UTF-8, falling back to Latin-1 (every byte is a code point)
fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Pick the delimiter that splits the first lines most consistently.
pub fn sniff_delimiter(text: &str) -> u8 {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).take(10).collect();
    let mut best = (b',', 0usize);
    for delimiter in DELIMITERS {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.bytes().filter(|b| *b == delimiter).count())
            .collect();
        let Some(&first) = counts.first() else {
            continue;
        };
        if first == 0 || counts.iter().any(|&c| c != first) {
            continue;
        }
        if first > best.1 {
            best = (delimiter, first);
        }
    }
    best.0
}

/// Parse CSV bytes with a header row into a typed table.
pub fn parse_csv(bytes: &[u8]) -> Result<Table, DatasetError> {
    let text = decode(bytes);
    let delimiter = sniff_delimiter(&text);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(DatasetError::NoHeader);
    }
    let columns = unique_headers(headers.iter());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let mut row: Vec<Scalar> = record.iter().map(Scalar::parse_cell).collect();
        // flexible() lets short and long rows through
        row.resize(columns.len(), Scalar::Null);
        rows.push(row);
    }
    Ok(Table::from_rows(columns, rows)?)
}

/// Blank headers become `Unnamed: i`; repeats get `.1`, `.2` suffixes.
fn unique_headers<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for (i, raw) in headers.enumerate() {
        let base = match raw.trim() {
            "" => format!("Unnamed: {}", i),
            name => name.to_string(),
        };
        let mut name = base.clone();
        let mut n = 1;
        while out.contains(&name) {
            name = format!("{}.{}", base, n);
            n += 1;
        }
        out.push(name);
    }
    out
}

/// numeric if every non-null cell is a number, date if every non-null cell
/// parses as a date, categorical otherwise
pub fn infer_column_type(cells: &[&Scalar]) -> ColumnType {
    let present: Vec<&Scalar> = cells.iter().copied().filter(|c| !c.is_null()).collect();
    if present.is_empty() {
        return ColumnType::Categorical;
    }
    if present.iter().all(|c| c.is_numeric()) {
        return ColumnType::Numeric;
    }
    if present
        .iter()
        .all(|c| c.as_str().is_some_and(|s| parse_datetime(s).is_some()))
    {
        return ColumnType::Date;
    }
    ColumnType::Categorical
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

// Day-first before month-first, so 03/04/2024 is the 3rd of April
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%m/%d/%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
];

/// Parse the date and datetime spellings found in uploaded files.
///
/// `YYYY-MM` month labels parse as the first day of the month. Bare years
/// and plain numbers are not dates.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.len() < 7 || !text.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let text = text.strip_suffix('Z').unwrap_or(text);
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    if text.len() == 7 {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d") {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Canonical text form of a datetime: date only at midnight.
pub fn format_datetime(dt: &NaiveDateTime) -> String {
    if dt.time() == chrono::NaiveTime::default() {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_infers_types_and_samples() {
        let csv = b"Region,Date,Sales\nNorth,2024-01-05,100\nSouth,2024-01-06,\nNorth,2024-02-01,250.5\n";
        let provider = CsvDatasetProvider::new(2);
        let d = provider.describe_bytes("f1", "Sales Q1.csv", csv).unwrap();
        assert_eq!(d.name, "sales_q1");
        assert_eq!(d.row_count, 3);
        assert_eq!(d.sample_rows.len(), 2);
        assert_eq!(d.column_types["Region"], ColumnType::Categorical);
        assert_eq!(d.column_types["Date"], ColumnType::Date);
        assert_eq!(d.column_types["Sales"], ColumnType::Numeric);
        assert_eq!(d.sample_rows[1]["Sales"], Scalar::Null);
    }

    #[test]
    fn test_period_from_quarter_names() {
        let quarterly = |label: &str| Some((label.to_string(), PeriodType::Quarterly));
        assert_eq!(detect_time_period("sales_q1_2025.csv"), quarterly("Q1 2025"));
        assert_eq!(detect_time_period("Revenue Q4-2024.csv"), quarterly("Q4 2024"));
        assert_eq!(detect_time_period("sales_2025_q2.csv"), quarterly("Q2 2025"));
        // q5 is not a quarter; the year still counts
        assert_eq!(
            detect_time_period("report_q5_2025.csv"),
            Some(("2025".to_string(), PeriodType::Yearly))
        );
    }

    #[test]
    fn test_period_from_month_names() {
        let monthly = |label: &str| Some((label.to_string(), PeriodType::Monthly));
        assert_eq!(detect_time_period("sales_nov_2024.csv"), monthly("Nov 2024"));
        assert_eq!(detect_time_period("sales_december_2024.csv"), monthly("Dec 2024"));
        assert_eq!(detect_time_period("SALES_Sept2024.csv"), monthly("Sep 2024"));
        assert_eq!(detect_time_period("orders-may-2023.csv"), monthly("May 2023"));
    }

    #[test]
    fn test_period_from_year_names() {
        assert_eq!(
            detect_time_period("sales_2024.csv"),
            Some(("2024".to_string(), PeriodType::Yearly))
        );
        assert_eq!(detect_time_period("sales_1999.csv"), None);
        assert_eq!(detect_time_period("id_123456.csv"), None);
        assert_eq!(detect_time_period("customers.csv"), None);
    }

    #[test]
    fn test_describe_records_period() {
        let provider = CsvDatasetProvider::default();
        let d = provider.describe_bytes("f", "sales_q1_2025.csv", b"x\n1\n").unwrap();
        assert_eq!(d.time_period.as_deref(), Some("Q1 2025"));
        assert_eq!(d.period_type, Some(PeriodType::Quarterly));

        let d = provider.describe_bytes("f", "customers.csv", b"x\n1\n").unwrap();
        assert_eq!(d.time_period, None);
        assert_eq!(d.period_type, None);
    }

    #[test]
    fn test_version_tracks_content() {
        let provider = CsvDatasetProvider::default();
        let a = provider.describe_bytes("f", "a.csv", b"x\n1\n").unwrap();
        let b = provider.describe_bytes("f", "a.csv", b"x\n2\n").unwrap();
        assert_ne!(a.version, b.version);
        assert_eq!(a.version.len(), 64);
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter("a;b;c\n1;2;3\n"), b';');
        assert_eq!(sniff_delimiter("a\tb\n1\t2\n"), b'\t');
        assert_eq!(sniff_delimiter("a,b\n1,2\n"), b',');
        assert_eq!(sniff_delimiter("single\n1\n"), b',');
    }

    #[test]
    fn test_duplicate_and_blank_headers() {
        let table = parse_csv(b"a,a,\n1,2,3\n").unwrap();
        assert_eq!(table.columns, vec!["a", "a.1", "Unnamed: 2"]);
    }

    #[test]
    fn test_latin1_fallback() {
        let table = parse_csv(b"city\nM\xfcnchen\n").unwrap();
        assert_eq!(table.rows[0][0], Scalar::Text("M\u{fc}nchen".to_string()));
    }

    #[test]
    fn test_parse_datetime_variants() {
        let d = |s: &str| parse_datetime(s).map(|dt| format_datetime(&dt));
        assert_eq!(d("2024-03-04"), Some("2024-03-04".to_string()));
        assert_eq!(d("04/03/2024"), Some("2024-03-04".to_string()));
        assert_eq!(d("2024-03-04T10:30:00"), Some("2024-03-04 10:30:00".to_string()));
        assert_eq!(d("2024-03"), Some("2024-03-01".to_string()));
        assert_eq!(d("Mar 4, 2024"), Some("2024-03-04".to_string()));
        assert_eq!(d("2024"), None);
        assert_eq!(d("North"), None);
        assert_eq!(d("12345678"), None);
    }

    #[test]
    fn test_binding_name() {
        assert_eq!(binding_name("2024 sales.csv"), "data_2024_sales");
        assert_eq!(binding_name("---.csv"), "data");
    }
}
