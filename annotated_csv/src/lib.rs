//! This crate contains a parser for annotated CSV, the delimited format
//! produced by the Flux CSV encoder
//! <https://docs.influxdata.com/influxdb/cloud/reference/syntax/annotated-csv/>
//!
//! Annotation rows (`#datatype`, `#group`, `#default`) precede a header row,
//! which precedes the data rows of a table block. A stream may carry several
//! table blocks; this parser concatenates them into a single
//! [`AnnotatedTable`] with one shared row space, registering columns in
//! first-seen order. When two blocks declare the same column name with
//! different types, the later column is keyed as `name ('type')` so that both
//! remain addressable.

use chrono::DateTime;
use csv::{ReaderBuilder, StringRecord};
use observability_deps::tracing::debug;
use snafu::{ResultExt, Snafu, ensure};
use std::fmt;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("malformed CSV: {source}"))]
    InvalidCsv { source: csv::Error },

    #[snafu(display("the annotated CSV contained no data rows"))]
    NoRows,

    #[snafu(display("no #datatype annotation precedes the data"))]
    MissingDatatype,

    #[snafu(display("unable to parse number '{value}' in column '{column}', row {row}"))]
    NumberValueInvalid {
        source: std::num::ParseFloatError,
        value: String,
        column: String,
        row: usize,
    },

    #[snafu(display("unable to parse timestamp '{value}' in column '{column}', row {row}"))]
    TimeValueInvalid {
        source: chrono::ParseError,
        value: String,
        column: String,
        row: usize,
    },

    #[snafu(display("unable to parse boolean '{value}' in column '{column}', row {row}"))]
    BoolValueInvalid {
        value: String,
        column: String,
        row: usize,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Semantic type of a column, folded down from its `#datatype` annotation.
///
/// `long`, `unsignedLong` and `double` all collapse to [`Number`]; the
/// `dateTime:*` annotations collapse to [`Time`]. Unrecognized datatypes are
/// carried as [`String`].
///
/// [`Number`]: Self::Number
/// [`Time`]: Self::Time
/// [`String`]: Self::String
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Number,
    Time,
    Boolean,
}

impl ColumnType {
    fn from_datatype(datatype: &str) -> Self {
        match datatype {
            "long" | "unsignedLong" | "double" => Self::Number,
            "boolean" => Self::Boolean,
            s if s.starts_with("dateTime") => Self::Time,
            _ => Self::String,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Time => "time",
            Self::Boolean => "boolean",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single parsed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    /// Milliseconds since the Unix epoch.
    Time(i64),
    Bool(bool),
}

impl Value {
    /// Whether this value counts as set when deciding tag membership.
    ///
    /// Empty strings, zero or NaN numbers, the zero timestamp and `false` do
    /// not count.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::String(s) => !s.is_empty(),
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Time(ms) => *ms != 0,
            Self::Bool(b) => *b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Time(ms) => write!(f, "{ms}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug)]
struct Column {
    key: String,
    name: String,
    column_type: ColumnType,
    group: Option<bool>,
    values: Vec<Option<Value>>,
}

/// The concatenation of every table block in an annotated CSV stream.
///
/// ```
/// let csv = "\
/// #datatype,string,long,dateTime:RFC3339,double,string,string
/// ,result,table,_time,_value,_field,_measurement
/// ,,0,2020-01-01T00:00:00Z,21.5,temp,sensor
/// ";
/// let table = annotated_csv::parse(csv).unwrap();
///
/// assert_eq!(table.row_count(), 1);
/// assert_eq!(
///     table.value("_value", 0),
///     Some(&annotated_csv::Value::Number(21.5))
/// );
/// ```
#[derive(Debug)]
pub struct AnnotatedTable {
    columns: Vec<Column>,
    row_count: usize,
}

impl AnnotatedTable {
    /// Column keys in first-seen order.
    pub fn column_keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.key.as_str())
    }

    /// The semantic type the column was declared with.
    pub fn column_type(&self, key: &str) -> Option<ColumnType> {
        self.column(key).map(|c| c.column_type)
    }

    /// The `#group` flag of the column, if one was annotated.
    pub fn group_key(&self, key: &str) -> Option<bool> {
        self.column(key).and_then(|c| c.group)
    }

    /// The value at `row` in the column keyed `key`.
    ///
    /// Returns `None` for empty cells, rows outside a column's originating
    /// block, and unknown keys.
    pub fn value(&self, key: &str, row: usize) -> Option<&Value> {
        self.column(key)
            .and_then(|c| c.values.get(row))
            .and_then(|v| v.as_ref())
    }

    /// Total number of data rows across all table blocks.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    fn column(&self, key: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.key == key)
    }
}

/// Parse annotated CSV into an [`AnnotatedTable`].
///
/// Fails when the underlying CSV is malformed, when data rows appear without
/// a preceding `#datatype` annotation, when a cell does not parse under its
/// declared type, or when the stream contains no data rows at all.
pub fn parse(input: &str) -> Result<AnnotatedTable> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input.as_bytes());

    let mut builder = TableBuilder::default();
    for record in reader.records() {
        let record = record.context(InvalidCsvSnafu)?;
        builder.push_record(&record)?;
    }

    builder.finish()
}

/// Annotations gathered for the next header row.
#[derive(Debug, Default)]
struct Annotations {
    datatypes: Vec<String>,
    groups: Vec<String>,
    defaults: Vec<String>,
}

/// Maps a CSV position of the current block to a registered column.
#[derive(Debug)]
struct Binding {
    position: usize,
    column: usize,
    column_type: ColumnType,
    default: Option<String>,
}

#[derive(Debug, Default)]
struct TableBuilder {
    columns: Vec<Column>,
    row_count: usize,
    pending: Option<Annotations>,
    bindings: Vec<Binding>,
    header_seen: bool,
}

impl TableBuilder {
    fn push_record(&mut self, record: &StringRecord) -> Result<()> {
        let first = record.get(0).unwrap_or("");
        if let Some(annotation) = first.strip_prefix('#') {
            let pending = self.pending.get_or_insert_with(Annotations::default);
            let values: Vec<String> = record.iter().map(str::to_string).collect();
            match annotation {
                "datatype" => pending.datatypes = values,
                "group" => pending.groups = values,
                "default" => pending.defaults = values,
                // Unknown annotations are skipped.
                _ => {}
            }
            return Ok(());
        }

        if let Some(annotations) = self.pending.take() {
            return self.bind_header(record, annotations);
        }

        ensure!(self.header_seen, MissingDatatypeSnafu);
        self.push_row(record)
    }

    fn bind_header(&mut self, record: &StringRecord, annotations: Annotations) -> Result<()> {
        ensure!(!annotations.datatypes.is_empty(), MissingDatatypeSnafu);

        self.bindings.clear();
        for (position, name) in record.iter().enumerate() {
            if position == 0 && name.is_empty() {
                // The annotation leader column carries the `#` markers.
                continue;
            }
            let datatype = annotations
                .datatypes
                .get(position)
                .map(String::as_str)
                .unwrap_or("string");
            let column_type = ColumnType::from_datatype(datatype);
            let group = annotations.groups.get(position).map(|g| g == "true");
            let default = annotations
                .defaults
                .get(position)
                .filter(|d| !d.is_empty())
                .cloned();
            let column = self.intern_column(name, column_type, group);
            self.bindings.push(Binding {
                position,
                column,
                column_type,
                default,
            });
        }
        self.header_seen = true;
        Ok(())
    }

    fn intern_column(&mut self, name: &str, column_type: ColumnType, group: Option<bool>) -> usize {
        if let Some(idx) = self
            .columns
            .iter()
            .position(|c| c.name == name && c.column_type == column_type)
        {
            if self.columns[idx].group.is_none() {
                self.columns[idx].group = group;
            }
            return idx;
        }

        let duplicate = self.columns.iter().any(|c| c.name == name);
        let key = if duplicate {
            format!("{name} ('{column_type}')")
        } else {
            name.to_string()
        };
        // Columns first declared by a later block backfill earlier rows as
        // absent.
        self.columns.push(Column {
            key,
            name: name.to_string(),
            column_type,
            group,
            values: vec![None; self.row_count],
        });
        self.columns.len() - 1
    }

    fn push_row(&mut self, record: &StringRecord) -> Result<()> {
        let row = self.row_count;
        for column in &mut self.columns {
            column.values.push(None);
        }
        for binding in &self.bindings {
            let cell = record.get(binding.position).unwrap_or("");
            let cell = if cell.is_empty() {
                match &binding.default {
                    Some(default) => default.as_str(),
                    None => continue,
                }
            } else {
                cell
            };
            let value = {
                let column = self.columns[binding.column].key.as_str();
                parse_value(cell, binding.column_type, column, row)?
            };
            self.columns[binding.column].values[row] = Some(value);
        }
        self.row_count += 1;
        Ok(())
    }

    fn finish(self) -> Result<AnnotatedTable> {
        ensure!(self.row_count > 0, NoRowsSnafu);
        debug!(
            columns = self.columns.len(),
            rows = self.row_count,
            "parsed annotated CSV"
        );
        Ok(AnnotatedTable {
            columns: self.columns,
            row_count: self.row_count,
        })
    }
}

fn parse_value(cell: &str, column_type: ColumnType, column: &str, row: usize) -> Result<Value> {
    let value = match column_type {
        ColumnType::String => Value::String(cell.to_string()),
        ColumnType::Number => {
            let number = cell.parse().context(NumberValueInvalidSnafu {
                value: cell,
                column,
                row,
            })?;
            Value::Number(number)
        }
        ColumnType::Time => {
            let time = DateTime::parse_from_rfc3339(cell).context(TimeValueInvalidSnafu {
                value: cell,
                column,
                row,
            })?;
            Value::Time(time.timestamp_millis())
        }
        ColumnType::Boolean => match cell {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => {
                return BoolValueInvalidSnafu {
                    value: cell,
                    column,
                    row,
                }
                .fail();
            }
        },
    };
    Ok(value)
}
