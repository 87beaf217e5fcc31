//! Resolver configuration, injected where the resolver is built.

use std::fmt;

use crate::postal::providers::DEFAULT_ENDPOINT;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 250;

/// Everything needed to talk to the geocoding service.
///
/// The token is never embedded in source; the CLI reads it from `--token`
/// or the `ONEMAP_TOKEN` environment variable.
#[derive(Clone)]
pub struct ResolverConfig {
    pub endpoint: String,
    pub token: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Number of lookup workers per batch.
    pub concurrency: usize,
    /// Total attempts for a transient failure, first try included.
    pub max_attempts: u32,
    /// Base delay of the exponential back-off.
    pub retry_delay_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl fmt::Debug for ResolverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .finish()
    }
}
