//! Geocoding providers: the OneMap search API and the [`Geocoder`] seam.

use super::types::{GeoPoint, LookupError, PostalCode, ResolveError};
use crate::config::ResolverConfig;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use ureq::ErrorKind;

pub const DEFAULT_ENDPOINT: &str = "https://www.onemap.gov.sg/api/common/elastic/search";

/// Turns a postal code into coordinates with a single lookup.
///
/// Implementations perform exactly one request per call; retries and
/// caching live in the resolver.
pub trait Geocoder: Send + Sync {
    fn lookup(&self, code: &PostalCode) -> Result<GeoPoint, LookupError>;
}

impl<G: Geocoder + ?Sized> Geocoder for Arc<G> {
    fn lookup(&self, code: &PostalCode) -> Result<GeoPoint, LookupError> {
        (**self).lookup(code)
    }
}

// ─── OneMap ──────────────────────────────────────────────────────

/// Client for a OneMap-style `elastic/search` endpoint.
pub struct OneMapClient {
    endpoint: String,
    token: String,
    agent: ureq::Agent,
}

impl fmt::Debug for OneMapClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneMapClient")
            .field("endpoint", &self.endpoint)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl OneMapClient {
    /// Build a client for `endpoint`. The endpoint must be an absolute
    /// http(s) URL.
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ResolveError> {
        let endpoint = endpoint.into();
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("KampungAtlas/", env!("CARGO_PKG_VERSION")))
            .build();

        let url = agent
            .get(&endpoint)
            .request_url()
            .map_err(|e| ResolveError::Client(format!("invalid endpoint {:?}: {}", endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ResolveError::Client(format!(
                "unsupported endpoint scheme {:?} in {:?}",
                url.scheme(),
                endpoint
            )));
        }

        Ok(Self {
            endpoint,
            token: token.into(),
            agent,
        })
    }

    pub fn from_config(config: &ResolverConfig) -> Result<Self, ResolveError> {
        Self::new(
            config.endpoint.clone(),
            config.token.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

impl Geocoder for OneMapClient {
    fn lookup(&self, code: &PostalCode) -> Result<GeoPoint, LookupError> {
        let result = self
            .agent
            .get(&self.endpoint)
            .query("searchVal", code.as_str())
            .query("returnGeom", "Y")
            .query("getAddrDetails", "Y")
            .query("pageNum", "1")
            .set("Authorization", &format!("Bearer {}", self.token))
            .call();

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let retry_after_ms = response.header("Retry-After").and_then(parse_retry_after_ms);
                return Err(classify_status(status, retry_after_ms));
            }
            Err(ureq::Error::Transport(transport)) => return Err(classify_transport(&transport)),
        };

        // Other 2xx codes carry no search results.
        if response.status() != 200 {
            return Err(LookupError::NotFound);
        }

        let body: SearchResponse = response
            .into_json()
            .map_err(|e| LookupError::InvalidResponse(e.to_string()))?;

        first_point(body)
    }
}

fn classify_status(status: u16, retry_after_ms: Option<u64>) -> LookupError {
    match (status, retry_after_ms) {
        (401 | 403, _) => LookupError::CredentialRejected(status),
        (429, Some(retry_after_ms)) => LookupError::Throttled { retry_after_ms },
        (408 | 429 | 500..=599, _) => LookupError::Unavailable(format!("HTTP {}", status)),
        _ => LookupError::NotFound,
    }
}

fn classify_transport(transport: &ureq::Transport) -> LookupError {
    match transport.kind() {
        ErrorKind::InvalidUrl | ErrorKind::UnknownScheme | ErrorKind::InvalidProxyUrl => {
            LookupError::Misconfigured(transport.to_string())
        }
        _ => LookupError::Unavailable(transport.to_string()),
    }
}

/// Delay-seconds form only; HTTP-date values fall back to back-off.
fn parse_retry_after_ms(value: &str) -> Option<u64> {
    let seconds = value.trim().parse::<u64>().ok()?;
    Some(seconds.saturating_mul(1000))
}

#[derive(Deserialize, Debug)]
struct SearchResponse {
    #[serde(default)]
    results: Option<Vec<SearchResult>>,
}

#[derive(Deserialize, Debug)]
struct SearchResult {
    #[serde(default, rename = "LATITUDE")]
    latitude: Option<Coordinate>,
    #[serde(default, rename = "LONGITUDE")]
    longitude: Option<Coordinate>,
}

/// OneMap sends coordinates as strings; other services send numbers.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum Coordinate {
    Number(f64),
    Text(String),
}

impl Coordinate {
    fn value(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// The service's best match is the first result. No re-ranking.
fn first_point(body: SearchResponse) -> Result<GeoPoint, LookupError> {
    let first = body
        .results
        .unwrap_or_default()
        .into_iter()
        .next()
        .ok_or(LookupError::NotFound)?;

    let lat = first.latitude.as_ref().and_then(Coordinate::value);
    let lon = first.longitude.as_ref().and_then(Coordinate::value);

    match (lat, lon) {
        (Some(lat), Some(lon)) => GeoPoint::new(lat, lon).ok_or_else(|| {
            LookupError::InvalidResponse(format!("coordinates out of range: {}, {}", lat, lon))
        }),
        _ => Err(LookupError::InvalidResponse(
            "result without usable LATITUDE/LONGITUDE".into(),
        )),
    }
}
