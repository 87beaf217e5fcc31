//! Core types for the postal pipeline.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A postal code cell exactly as the tabular source handed it over.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "serde_json::Value")]
pub enum RawPostalCode {
    /// Numeric cell. Spreadsheets store integers as floats (`569933.0`).
    Number(f64),
    Text(String),
    /// Missing or blank cell.
    Empty,
}

impl From<Value> for RawPostalCode {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Empty,
            Value::Number(n) => n.as_f64().map_or(Self::Empty, Self::Number),
            Value::String(s) if s.is_empty() => Self::Empty,
            Value::String(s) => Self::Text(s),
            other => Self::Text(other.to_string()),
        }
    }
}

impl From<&str> for RawPostalCode {
    fn from(s: &str) -> Self {
        Self::from(Value::String(s.to_string()))
    }
}

impl From<String> for RawPostalCode {
    fn from(s: String) -> Self {
        Self::from(Value::String(s))
    }
}

impl From<f64> for RawPostalCode {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl fmt::Display for RawPostalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
            Self::Empty => Ok(()),
        }
    }
}

/// A normalized postal code: exactly six ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostalCode(String);

impl PostalCode {
    pub const LEN: usize = 6;

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PostalCode {
    type Err = InvalidPostalCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate(&RawPostalCode::Text(s.to_string()))
    }
}

impl Serialize for PostalCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// A raw value that does not normalize to a six-digit postal code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid postal code '{raw}'")]
pub struct InvalidPostalCode {
    /// Textual form of the rejected value.
    pub raw: String,
}

/// Normalize a raw cell into a [`PostalCode`].
///
/// Anything from the first `.` onward is dropped, so `"123456.0"` and the
/// number `123456.0` both become `"123456"`. What remains must be exactly six
/// ASCII digits. Leading zeros are kept as-is.
pub fn validate(raw: &RawPostalCode) -> Result<PostalCode, InvalidPostalCode> {
    let text = raw.to_string();
    let digits = match text.find('.') {
        Some(dot) => &text[..dot],
        None => text.as_str(),
    };

    if digits.len() == PostalCode::LEN && digits.bytes().all(|b| b.is_ascii_digit()) {
        Ok(PostalCode(digits.to_string()))
    } else {
        Err(InvalidPostalCode { raw: text })
    }
}

/// A latitude/longitude pair inside the valid geographic range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    /// Returns `None` for non-finite or out-of-range coordinates.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let in_range = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
        (latitude.is_finite() && longitude.is_finite() && in_range)
            .then_some(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// A postal code placed on the map. The marker label is the postal code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLocation {
    pub postal_code: PostalCode,
    #[serde(flatten)]
    pub point: GeoPoint,
}

/// Outcome of a single geocoding lookup that did not yield a point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no result for postal code")]
    NotFound,
    /// Transport failure, timeout, 408/429 or 5xx. Worth retrying.
    #[error("geocoding service unavailable: {0}")]
    Unavailable(String),
    /// 429 with a usable `Retry-After`; the wait replaces the back-off.
    #[error("geocoding service throttled, retry after {retry_after_ms} ms")]
    Throttled { retry_after_ms: u64 },
    #[error("geocoding service rejected the credential (HTTP {0})")]
    CredentialRejected(u16),
    /// The endpoint cannot be requested at all (bad URL or scheme).
    #[error("geocoding client misconfigured: {0}")]
    Misconfigured(String),
    #[error("invalid geocoding response: {0}")]
    InvalidResponse(String),
}

impl LookupError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Throttled { .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Throttled { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Batch-level failures. Everything per-record stays inside [`BatchReport`].
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no geocoding credential configured (set --token or ONEMAP_TOKEN)")]
    MissingCredential,
    #[error("geocoding credential rejected (HTTP {status}); the API token is invalid or expired")]
    CredentialRejected { status: u16 },
    #[error("geocoding client error: {0}")]
    Client(String),
    #[error("resolution cancelled")]
    Cancelled,
}

/// Why an input entry produced no marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Invalid,
    NotFound,
    Unavailable,
    InvalidResponse,
}

impl From<&LookupError> for SkipReason {
    fn from(err: &LookupError) -> Self {
        match err {
            LookupError::NotFound => Self::NotFound,
            LookupError::InvalidResponse(_) => Self::InvalidResponse,
            LookupError::Unavailable(_)
            | LookupError::Throttled { .. }
            | LookupError::CredentialRejected(_)
            | LookupError::Misconfigured(_) => Self::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedEntry {
    /// Position in the input sequence.
    pub index: usize,
    pub raw: String,
    pub reason: SkipReason,
}

/// Full result of a batch pass: markers in input order plus what was dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub locations: Vec<ResolvedLocation>,
    pub skipped: Vec<SkippedEntry>,
}
