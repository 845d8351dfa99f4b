use crate::ingest::schema::{TypedRow, TypedValue, ValueType};
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

/// Worker count used when none is configured.
pub const DEFAULT_PARSE_WORKERS: usize = 5;

// Below this many lines the pool costs more than it saves.
const PARALLEL_THRESHOLD: usize = 2048;

const FIELD_DELIMITER: u8 = b'\t';

static TIMESTAMP_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-5][0-9]\.[0-9]{1,6}$")
        .expect("timestamp pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowFailure {
    #[error("expected {expected} fields, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("'{value}' is not a valid {expected}")]
    TypeConversion { value: String, expected: ValueType },

    #[error("'{value}' does not match YYYY-MM-DD HH:MM:SS.ffffff")]
    TimestampFormat { value: String },
}

/// A line of the import file that could not be turned into a row.
///
/// `line_index` is the zero-based physical line of the input and `column` the
/// zero-based field, when the failure is tied to one.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {}: {reason}", .line_index + 1)]
pub struct RowParseError {
    pub line_index: usize,
    pub column: Option<usize>,
    pub reason: RowFailure,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Row(#[from] RowParseError),

    #[error("failed to open import file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read import file: {0}")]
    Csv(#[from] csv::Error),

    #[error("could not start parse workers: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Converts a single field according to its column type.
pub fn parse_value(field: &str, value_type: ValueType) -> Result<TypedValue, RowFailure> {
    let conversion_error = || RowFailure::TypeConversion {
        value: field.to_string(),
        expected: value_type,
    };

    match value_type {
        ValueType::Integer => field
            .trim()
            .parse::<i64>()
            .map(TypedValue::Integer)
            .map_err(|_| conversion_error()),
        ValueType::Float => field
            .trim()
            .parse::<f64>()
            .map(TypedValue::Float)
            .map_err(|_| conversion_error()),
        ValueType::Text => Ok(TypedValue::Text(field.to_string())),
        ValueType::Timestamp => parse_timestamp(field).map(TypedValue::Timestamp),
    }
}

fn parse_timestamp(field: &str) -> Result<NaiveDateTime, RowFailure> {
    let format_error = || RowFailure::TimestampFormat {
        value: field.to_string(),
    };
    if !TIMESTAMP_SHAPE.is_match(field) {
        return Err(format_error());
    }
    NaiveDateTime::parse_from_str(field, "%Y-%m-%d %H:%M:%S%.f").map_err(|_| format_error())
}

/// Converts the fields of one line into a typed row.
pub fn parse_fields(
    line_index: usize,
    fields: &[&str],
    column_types: &[ValueType],
) -> Result<TypedRow, RowParseError> {
    if fields.len() != column_types.len() {
        return Err(RowParseError {
            line_index,
            column: None,
            reason: RowFailure::ArityMismatch {
                expected: column_types.len(),
                found: fields.len(),
            },
        });
    }

    fields
        .iter()
        .zip(column_types)
        .enumerate()
        .map(|(column, (field, value_type))| {
            parse_value(field, *value_type).map_err(|reason| RowParseError {
                line_index,
                column: Some(column),
                reason,
            })
        })
        .collect()
}

/// Parses one raw line. Blank lines carry no row and yield `None`.
pub fn parse_line(
    line_index: usize,
    line: &str,
    column_types: &[ValueType],
) -> Result<Option<TypedRow>, RowParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split('\t').collect();
    parse_fields(line_index, &fields, column_types).map(Some)
}

/// Turns tab-delimited text into typed rows.
///
/// Parsing is all-or-nothing: either every line converts and the rows come
/// back in input order, or the failure on the earliest line is returned.
#[derive(Debug, Clone)]
pub struct RowParser {
    workers: usize,
}

impl RowParser {
    pub fn new() -> Self {
        Self {
            workers: DEFAULT_PARSE_WORKERS,
        }
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn parse_lines<S>(
        &self,
        lines: &[S],
        column_types: &[ValueType],
    ) -> Result<Vec<TypedRow>, ParseError>
    where
        S: AsRef<str> + Sync,
    {
        self.convert_all(lines, |line_index, line| {
            parse_line(line_index, line.as_ref(), column_types)
        })
    }

    pub fn parse_file(
        &self,
        path: &Path,
        column_types: &[ValueType],
    ) -> Result<Vec<TypedRow>, ParseError> {
        let contents = fs::read(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let lines = LineOffsets::new(&contents);

        // No quoting: a field runs from one tab to the next, quotes included.
        let mut reader = ReaderBuilder::new()
            .delimiter(FIELD_DELIMITER)
            .has_headers(false)
            .quoting(false)
            .flexible(true)
            .from_reader(contents.as_slice());

        let mut records: Vec<(usize, StringRecord)> = Vec::new();
        for (ordinal, record) in reader.records().enumerate() {
            let record = record?;
            let line_index = record
                .position()
                .map_or(ordinal, |pos| lines.line_of(pos.byte() as usize));
            records.push((line_index, record));
        }
        debug!("Read {} records from {}", records.len(), path.display());

        self.convert_all(&records, |_, (line_index, record)| {
            let fields: Vec<&str> = record.iter().collect();
            parse_fields(*line_index, &fields, column_types).map(Some)
        })
    }

    fn convert_all<T, F>(&self, items: &[T], convert: F) -> Result<Vec<TypedRow>, ParseError>
    where
        T: Sync,
        F: Fn(usize, &T) -> Result<Option<TypedRow>, RowParseError> + Sync + Send,
    {
        let results: Vec<Result<Option<TypedRow>, RowParseError>> =
            if self.workers <= 1 || items.len() < PARALLEL_THRESHOLD {
                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| convert(index, item))
                    .collect()
            } else {
                debug!("Parsing {} lines on {} workers", items.len(), self.workers);
                let pool = ThreadPoolBuilder::new().num_threads(self.workers).build()?;
                pool.install(|| {
                    items
                        .par_iter()
                        .enumerate()
                        .map(|(index, item)| convert(index, item))
                        .collect()
                })
            };

        // Walk results in input order so the earliest bad line is the one reported.
        let mut rows = Vec::with_capacity(results.len());
        for result in results {
            if let Some(row) = result? {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

// Maps byte offsets in a file to zero-based physical line numbers.
//
// A csv record's position is taken before the reader skips blank lines, so
// the offset may point at the terminators preceding the record.
struct LineOffsets<'a> {
    contents: &'a [u8],
    starts: Vec<usize>,
}

impl<'a> LineOffsets<'a> {
    fn new(contents: &'a [u8]) -> Self {
        let starts = std::iter::once(0)
            .chain(next_line_starts(contents))
            .collect();
        Self { contents, starts }
    }

    fn line_of(&self, byte: usize) -> usize {
        let byte = byte.min(self.contents.len());
        let start = self.contents[byte..]
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .map_or(self.contents.len(), |skipped| byte + skipped);
        self.starts.partition_point(|line_start| *line_start <= start) - 1
    }
}

fn next_line_starts(contents: &[u8]) -> impl Iterator<Item = usize> + '_ {
    contents
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i + 1)
}

impl Default for RowParser {
    fn default() -> Self {
        Self::new()
    }
}
