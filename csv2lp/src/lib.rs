//! Converts rows of an [`AnnotatedTable`] into InfluxDB line protocol
//! <https://docs.influxdata.com/influxdb/cloud/reference/syntax/line-protocol/>
//!
//! The well-known columns (`_measurement`, `_field`, `_value`, `_time`)
//! supply the measurement, the single field and the timestamp of each record;
//! every other column becomes a tag when its value is set for the row. The
//! crate also provides [`Chunk`] and the chunk partitioning arithmetic used
//! to split a table across concurrent write requests.

use annotated_csv::{AnnotatedTable, ColumnType, Value};
use std::fmt;

/// Errors for rows that cannot be rendered as line protocol.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum Error {
    #[error("the CSV is incorrectly formatted: row {row} must define a _measurement")]
    MissingMeasurement { row: usize },

    #[error("the CSV is incorrectly formatted: row {row} must define a _field")]
    MissingField { row: usize },

    #[error("the CSV is incorrectly formatted: row {row} must define a _value")]
    MissingValue { row: usize },

    #[error("timestamp {millis}ms in row {row} does not fit nanosecond precision")]
    TimestampOutOfRange { row: usize, millis: i64 },
}

pub type Result<T> = std::result::Result<T, Error>;

// https://docs.influxdata.com/influxdb/cloud/reference/syntax/line-protocol/#special-characters
const COMMA_EQ_SPACE: [char; 3] = [',', '=', ' '];
const COMMA_SPACE: [char; 2] = [',', ' '];
const DOUBLE_QUOTE: [char; 1] = ['"'];

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Column keys that never become tags. Keys starting with `_value` are
/// excluded as well.
const EXCLUDED_TAG_COLUMNS: [&str; 7] = [
    "_start",
    "_stop",
    "_time",
    "_measurement",
    "_field",
    "table",
    "result",
];

fn is_tag_column(key: &str) -> bool {
    !key.starts_with("_value") && !EXCLUDED_TAG_COLUMNS.contains(&key)
}

/// Matches `_value` as well as the type-suffixed keys (`_value ('string')`)
/// the parser assigns when table blocks disagree on the value type.
fn is_value_column(key: &str) -> bool {
    match key.strip_prefix("_value") {
        Some("") => true,
        Some(suffix) => suffix
            .strip_prefix(" ('")
            .and_then(|s| s.strip_suffix("')"))
            .is_some_and(|ty| ty.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')),
        None => false,
    }
}

/// Renders table rows as line protocol records.
///
/// Construction partitions the table's columns once; [`record`](Self::record)
/// is then called per row.
#[derive(Debug)]
pub struct RowConverter<'a> {
    table: &'a AnnotatedTable,
    tag_columns: Vec<&'a str>,
    value_columns: Vec<&'a str>,
}

impl<'a> RowConverter<'a> {
    pub fn new(table: &'a AnnotatedTable) -> Self {
        let tag_columns = table.column_keys().filter(|key| is_tag_column(key)).collect();
        let value_columns = table
            .column_keys()
            .filter(|key| is_value_column(key))
            .collect();
        Self {
            table,
            tag_columns,
            value_columns,
        }
    }

    /// Render the line protocol record for `row`.
    ///
    /// `default_time_ms` supplies the timestamp, in epoch milliseconds, for
    /// rows without a usable `_time` value. The rendered timestamp is always
    /// in nanoseconds.
    pub fn record(&self, row: usize, default_time_ms: i64) -> Result<String> {
        let measurement = self
            .present("_measurement", row)
            .ok_or(Error::MissingMeasurement { row })?
            .to_string();
        let measurement = escape(&measurement, COMMA_SPACE);

        let field_key = self
            .present("_field", row)
            .ok_or(Error::MissingField { row })?
            .to_string();
        let field_key = escape(&field_key, COMMA_EQ_SPACE);

        // The last value column with a set value supplies the field value;
        // its declared type decides whether the value is quoted.
        let (value_column, value) = self
            .value_columns
            .iter()
            .filter_map(|key| self.present(key, row).map(|v| (*key, v)))
            .last()
            .ok_or(Error::MissingValue { row })?;
        let field_value = if self.table.column_type(value_column) == Some(ColumnType::String) {
            format!("\"{}\"", escape(&value.to_string(), DOUBLE_QUOTE))
        } else {
            value.to_string()
        };

        let tags = self.tags(row);

        let millis = match self.table.value("_time", row) {
            Some(Value::Time(ms)) => *ms,
            Some(Value::Number(n)) => *n as i64,
            _ => default_time_ms,
        };
        let timestamp = millis
            .checked_mul(NANOS_PER_MILLI)
            .ok_or(Error::TimestampOutOfRange { row, millis })?;

        let record = if tags.is_empty() {
            format!("{measurement} {field_key}={field_value} {timestamp}")
        } else {
            format!("{measurement},{tags} {field_key}={field_value} {timestamp}")
        };
        Ok(record)
    }

    /// The comma-joined tag set of the row, in column order. Unset and falsy
    /// values are skipped.
    fn tags(&self, row: usize) -> String {
        let mut tags = String::new();
        for key in &self.tag_columns {
            let Some(value) = self.table.value(key, row) else {
                continue;
            };
            if !value.is_truthy() {
                continue;
            }
            if !tags.is_empty() {
                tags.push(',');
            }
            let tag_key = escape(key, COMMA_EQ_SPACE);
            match value {
                Value::String(s) => {
                    let cleaned = strip_line_breaks(s);
                    tags.push_str(&format!("{tag_key}={}", escape(&cleaned, COMMA_EQ_SPACE)));
                }
                other => {
                    tags.push_str(&format!("{tag_key}={other}"));
                }
            }
        }
        tags
    }

    fn present(&self, key: &str, row: usize) -> Option<&'a Value> {
        self.table
            .value(key, row)
            .filter(|v| !matches!(v, Value::String(s) if s.is_empty()))
    }
}

/// Tag values may not span lines; CR and LF are dropped before escaping.
fn strip_line_breaks(src: &str) -> String {
    src.replace(['\r', '\n'], "")
}

// Return a [`fmt::Display`] that renders `src` while escaping any characters
// in the `special_characters` array with a `\`
fn escape<const N: usize>(src: &str, special_characters: [char; N]) -> Escaped<'_, N> {
    Escaped {
        src,
        special_characters,
    }
}

struct Escaped<'a, const N: usize> {
    src: &'a str,
    special_characters: [char; N],
}

impl<const N: usize> fmt::Display for Escaped<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ch in self.src.chars() {
            if self.special_characters.contains(&ch) || ch == '\\' {
                write!(f, "\\")?;
            }
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

/// Accumulates the records of one write request.
///
/// The rendered body lists records in reverse push order, each terminated by
/// a newline.
#[derive(Debug, Default)]
pub struct Chunk {
    lines: Vec<String>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Render the request body and consume the chunk.
    pub fn into_body(self) -> String {
        let mut body = String::new();
        for line in self.lines.iter().rev() {
            body.push_str(line);
            body.push('\n');
        }
        body
    }
}

/// Number of rows between chunk boundaries when spreading `rows` over `limit`
/// concurrent requests.
///
/// A stride of zero means the row count is too small to split; everything
/// lands in a single chunk.
pub fn chunk_stride(rows: usize, limit: usize) -> usize {
    if limit == 0 {
        return 0;
    }
    (rows as f64 / limit as f64).round() as usize
}

/// Number of chunks dispatching `rows` with [`chunk_stride`] boundaries will
/// produce: one per full stride, plus the final partial chunk.
pub fn chunk_count(rows: usize, limit: usize) -> usize {
    if rows == 0 {
        return 0;
    }
    let stride = chunk_stride(rows, limit);
    if stride == 0 { 1 } else { (rows - 1) / stride + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table(csv: &str) -> AnnotatedTable {
        annotated_csv::parse(csv).unwrap()
    }

    #[test]
    fn renders_measurement_tags_field_and_timestamp() {
        // 2023-11-14T22:13:20Z is 1700000000000ms.
        let table = table(
            "\
#datatype,string,long,dateTime:RFC3339,long,string,string,string
,result,table,_time,_value,_field,_measurement,loc
,,0,2023-11-14T22:13:20Z,42,f=1,\"m,1\",ny ub
",
        );
        let converter = RowConverter::new(&table);

        assert_eq!(
            converter.record(0, 0).unwrap(),
            r"m\,1,loc=ny\ ub f\=1=42 1700000000000000000"
        );
    }

    #[test]
    fn escapes_every_special_character_occurrence() {
        let table = table(
            "\
#datatype,string,long,dateTime:RFC3339,long,string,string,string
,result,table,_time,_value,_field,_measurement,loc
,,0,2023-11-14T22:13:20Z,1,\"a=b c\",\"a,b,c d\",\"x=y=z\"
",
        );
        let converter = RowConverter::new(&table);

        assert_eq!(
            converter.record(0, 0).unwrap(),
            r"a\,b\,c\ d,loc=x\=y\=z a\=b\ c=1 1700000000000000000"
        );
    }

    #[test]
    fn quotes_and_escapes_string_values() {
        let table = table(
            "\
#datatype,string,long,dateTime:RFC3339,string,string,string
,result,table,_time,_value,_field,_measurement
,,0,2023-11-14T22:13:20Z,\"he said \"\"hi\"\"\\\",f,m
",
        );
        let converter = RowConverter::new(&table);

        assert_eq!(
            converter.record(0, 0).unwrap(),
            "m f=\"he said \\\"hi\\\"\\\\\" 1700000000000000000"
        );
    }

    #[test]
    fn last_set_value_column_wins() {
        let csv = "\
#datatype,string,long,double,string,string
,result,table,_value,_field,_measurement
,,0,1.5,temp,sensor
#datatype,string,long,string,string,string
,result,table,_value,_field,_measurement
,,1,warm,state,sensor
";
        let t = table(csv);
        let converter = RowConverter::new(&t);

        assert_eq!(converter.record(0, 7).unwrap(), "sensor temp=1.5 7000000");
        assert_eq!(
            converter.record(1, 7).unwrap(),
            "sensor state=\"warm\" 7000000"
        );
    }

    #[test]
    fn zero_is_a_set_field_value() {
        let t = table(
            "\
#datatype,string,long,double,string,string
,result,table,_value,_field,_measurement
,,0,0,count,sensor
",
        );
        let converter = RowConverter::new(&t);

        assert_eq!(converter.record(0, 1).unwrap(), "sensor count=0 1000000");
    }

    #[test]
    fn well_known_columns_do_not_become_tags() {
        let t = table(
            "\
#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,double,string,string,string
,result,table,_start,_stop,_time,_value,_field,_measurement,host
,_result,0,2020-01-01T00:00:00Z,2020-01-02T00:00:00Z,2023-11-14T22:13:20Z,1.5,temp,sensor,h1
",
        );
        let converter = RowConverter::new(&t);

        assert_eq!(
            converter.record(0, 0).unwrap(),
            "sensor,host=h1 temp=1.5 1700000000000000000"
        );
    }

    #[test]
    fn falsy_tag_values_are_skipped() {
        let t = table(
            "\
#datatype,string,long,double,string,string,string,long,boolean
,result,table,_value,_field,_measurement,empty,zero,off
,,0,1.5,temp,sensor,,0,false
",
        );
        let converter = RowConverter::new(&t);

        assert_eq!(converter.record(0, 3).unwrap(), "sensor temp=1.5 3000000");
    }

    #[test]
    fn numeric_and_boolean_tags_render_bare() {
        let t = table(
            "\
#datatype,string,long,double,string,string,long,boolean
,result,table,_value,_field,_measurement,slot,active
,,0,1.5,temp,sensor,7,true
",
        );
        let converter = RowConverter::new(&t);

        assert_eq!(
            converter.record(0, 3).unwrap(),
            "sensor,slot=7,active=true temp=1.5 3000000"
        );
    }

    #[test]
    fn line_breaks_are_stripped_from_string_tags() {
        let t = table(
            "\
#datatype,string,long,double,string,string,string
,result,table,_value,_field,_measurement,note
,,0,1.5,temp,sensor,\"a\r\nb\"
",
        );
        let converter = RowConverter::new(&t);

        assert_eq!(
            converter.record(0, 3).unwrap(),
            "sensor,note=ab temp=1.5 3000000"
        );
    }

    #[test]
    fn missing_measurement_errors() {
        let t = table(
            "\
#datatype,string,long,double,string,string
,result,table,_value,_field,extra
,,0,1.5,temp,x
",
        );
        let converter = RowConverter::new(&t);

        let err = converter.record(0, 0).unwrap_err();
        assert!(matches!(err, Error::MissingMeasurement { row: 0 }));
        assert!(err.to_string().contains("_measurement"));
    }

    #[test]
    fn empty_measurement_is_missing() {
        let t = table(
            "\
#datatype,string,long,double,string,string
,result,table,_value,_field,_measurement
,,0,1.5,temp,
",
        );
        let converter = RowConverter::new(&t);

        let err = converter.record(0, 0).unwrap_err();
        assert!(matches!(err, Error::MissingMeasurement { row: 0 }));
    }

    #[test]
    fn missing_field_errors() {
        let t = table(
            "\
#datatype,string,long,double,string,string
,result,table,_value,extra,_measurement
,,0,1.5,x,sensor
",
        );
        let converter = RowConverter::new(&t);

        let err = converter.record(0, 0).unwrap_err();
        assert!(matches!(err, Error::MissingField { row: 0 }));
        assert!(err.to_string().contains("_field"));
    }

    #[test]
    fn missing_value_errors() {
        let t = table(
            "\
#datatype,string,long,string,string,double
,result,table,_field,_measurement,reading
,,0,temp,sensor,1.5
",
        );
        let converter = RowConverter::new(&t);

        let err = converter.record(0, 0).unwrap_err();
        assert!(matches!(err, Error::MissingValue { row: 0 }));
        assert!(err.to_string().contains("_value"));
    }

    #[test]
    fn unset_time_uses_the_default() {
        let t = table(
            "\
#datatype,string,long,double,string,string
,result,table,_value,_field,_measurement
,,0,1.5,temp,sensor
",
        );
        let converter = RowConverter::new(&t);

        assert_eq!(
            converter.record(0, 1_700_000_000_000).unwrap(),
            "sensor temp=1.5 1700000000000000000"
        );
    }

    #[test]
    fn numeric_time_column_is_used_as_millis() {
        let t = table(
            "\
#datatype,string,long,long,double,string,string
,result,table,_time,_value,_field,_measurement
,,0,1700000000000,1.5,temp,sensor
",
        );
        let converter = RowConverter::new(&t);

        assert_eq!(
            converter.record(0, 0).unwrap(),
            "sensor temp=1.5 1700000000000000000"
        );
    }

    #[test]
    fn far_future_timestamps_error() {
        let t = table(
            "\
#datatype,string,long,dateTime:RFC3339,double,string,string
,result,table,_time,_value,_field,_measurement
,,0,3000-01-01T00:00:00Z,1.5,temp,sensor
",
        );
        let converter = RowConverter::new(&t);

        let err = converter.record(0, 0).unwrap_err();
        assert!(matches!(err, Error::TimestampOutOfRange { row: 0, .. }));
    }

    #[test]
    fn value_column_matching() {
        assert!(is_value_column("_value"));
        assert!(is_value_column("_value ('string')"));
        assert!(is_value_column("_value ('number')"));
        assert!(!is_value_column("_values"));
        assert!(!is_value_column("value"));
        assert!(!is_value_column("my_value"));
    }

    #[test]
    fn chunk_body_reverses_lines() {
        let mut chunk = Chunk::new();
        chunk.push("a f=1 1".to_string());
        chunk.push("b f=2 2".to_string());
        chunk.push("c f=3 3".to_string());

        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.into_body(), "c f=3 3\nb f=2 2\na f=1 1\n");
    }

    #[test]
    fn empty_chunk_renders_empty_body() {
        let chunk = Chunk::new();
        assert!(chunk.is_empty());
        assert_eq!(chunk.into_body(), "");
    }

    #[test]
    fn chunk_partitioning() {
        assert_eq!(chunk_stride(1200, 6), 200);
        assert_eq!(chunk_count(1200, 6), 6);

        assert_eq!(chunk_stride(100, 6), 17);
        assert_eq!(chunk_count(100, 6), 6);

        // Rounds half away from zero.
        assert_eq!(chunk_stride(3, 6), 1);
        assert_eq!(chunk_count(3, 6), 3);

        assert_eq!(chunk_stride(7, 6), 1);
        assert_eq!(chunk_count(7, 6), 7);

        // Too few rows to split.
        assert_eq!(chunk_stride(2, 6), 0);
        assert_eq!(chunk_count(2, 6), 1);

        assert_eq!(chunk_count(0, 6), 0);
        assert_eq!(chunk_stride(10, 0), 0);
    }
}
