//! Reads raw postal code cells from an exported participant sheet.
//!
//! `.json` files hold either an array of row objects (the postal code sits
//! under a configurable column) or an array of bare values. Any other file
//! is read as one value per line; a first line equal to the column name is
//! treated as a header.

use crate::postal::RawPostalCode;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_COLUMN: &str = "postal_code";

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: expected a JSON array of rows or values", .path.display())]
    Shape { path: PathBuf },
}

pub fn load_raw_codes(path: &Path, column: &str) -> Result<Vec<RawPostalCode>, InputError> {
    let text = fs::read_to_string(path).map_err(|source| InputError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if !is_json {
        return Ok(parse_lines(&text, column));
    }

    let value: Value = serde_json::from_str(&text).map_err(|source| InputError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    parse_json_rows(value, column).ok_or_else(|| InputError::Shape {
        path: path.to_path_buf(),
    })
}

/// Extract the column from each row. Rows without the column count as
/// empty cells so indices stay aligned with the sheet.
pub fn parse_json_rows(value: Value, column: &str) -> Option<Vec<RawPostalCode>> {
    let Value::Array(rows) = value else {
        return None;
    };

    Some(
        rows.into_iter()
            .map(|row| match row {
                Value::Object(mut fields) => fields
                    .remove(column)
                    .map_or(RawPostalCode::Empty, RawPostalCode::from),
                scalar => RawPostalCode::from(scalar),
            })
            .collect(),
    )
}

pub fn parse_lines(text: &str, column: &str) -> Vec<RawPostalCode> {
    let mut lines = text.lines().map(str::trim).peekable();
    if lines.peek().is_some_and(|first| first.eq_ignore_ascii_case(column)) {
        lines.next();
    }

    lines
        .map(|line| match line {
            "" => RawPostalCode::Empty,
            cell => RawPostalCode::Text(cell.to_string()),
        })
        .collect()
}
