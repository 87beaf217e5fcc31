//! Postal code resolution pipeline.
//!
//! Validates raw spreadsheet values, geocodes valid postal codes through an
//! external search API with caching and retry, and produces map markers.

pub mod cache;
pub mod cancel;
pub mod providers;
pub mod resolver;
pub mod retry;
pub mod types;

pub use cache::GeoCache;
pub use cancel::CancelToken;
pub use providers::{Geocoder, OneMapClient, DEFAULT_ENDPOINT};
pub use resolver::PostalResolver;
pub use retry::RetryPolicy;
pub use types::{
    validate, BatchReport, GeoPoint, InvalidPostalCode, LookupError, PostalCode, RawPostalCode,
    ResolveError, ResolvedLocation, SkipReason, SkippedEntry,
};
