//! Postal resolver: validation → cache → geocoder (with retry) → markers.
//!
//! Batch flow: validate every entry, look up each distinct valid code once
//! on a bounded worker pool, then rebuild the output in input order.
//! Per-record failures are skipped; a rejected credential or an unusable
//! endpoint stops the batch.

use super::cache::GeoCache;
use super::cancel::CancelToken;
use super::providers::{Geocoder, OneMapClient};
use super::retry::RetryPolicy;
use super::types::{
    validate, BatchReport, GeoPoint, LookupError, PostalCode, RawPostalCode, ResolveError,
    ResolvedLocation, SkipReason, SkippedEntry,
};
use crate::config::{ResolverConfig, DEFAULT_CONCURRENCY};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::{debug, error, info, warn};

type Outcome = Result<GeoPoint, LookupError>;

pub struct PostalResolver {
    geocoder: Box<dyn Geocoder>,
    cache: Arc<GeoCache>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl PostalResolver {
    pub fn new(geocoder: impl Geocoder + 'static, cache: Arc<GeoCache>) -> Self {
        Self {
            geocoder: Box::new(geocoder),
            cache,
            retry: RetryPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Build a OneMap-backed resolver. Fails if no token is configured or
    /// the endpoint is not a usable http(s) URL.
    pub fn from_config(config: &ResolverConfig, cache: Arc<GeoCache>) -> Result<Self, ResolveError> {
        if config.token.trim().is_empty() {
            return Err(ResolveError::MissingCredential);
        }
        let client = OneMapClient::from_config(config)?;
        Ok(Self::new(client, cache)
            .with_retry(RetryPolicy::from_config(config))
            .with_concurrency(config.concurrency))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn cache(&self) -> &Arc<GeoCache> {
        &self.cache
    }

    /// Resolve one valid postal code. Cache hits issue no request.
    pub fn resolve(&self, code: &PostalCode) -> Result<GeoPoint, LookupError> {
        self.resolve_cancellable(code, &CancelToken::new())
    }

    fn resolve_cancellable(&self, code: &PostalCode, cancel: &CancelToken) -> Outcome {
        if let Some(point) = self.cache.get(code) {
            debug!(postal_code = %code, "cache hit");
            return Ok(point);
        }

        let point = self.lookup_with_retry(code, cancel)?;
        self.cache.insert(code.clone(), point);
        Ok(point)
    }

    fn lookup_with_retry(&self, code: &PostalCode, cancel: &CancelToken) -> Outcome {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            match self.geocoder.lookup(code) {
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for_retry(attempt, &err);
                    warn!(
                        postal_code = %code,
                        attempt,
                        max_attempts,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "lookup failed, retrying"
                    );
                    if !cancel.sleep(delay) {
                        return Err(err);
                    }
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// Resolve a batch and keep only the markers.
    pub fn resolve_all(&self, raw: &[RawPostalCode]) -> Result<Vec<ResolvedLocation>, ResolveError> {
        Ok(self.resolve_batch(raw, &CancelToken::new())?.locations)
    }

    /// Resolve a batch, reporting every skipped entry with its reason.
    ///
    /// Output order follows input order; an input that repeats a code
    /// gets one marker per occurrence.
    pub fn resolve_batch(
        &self,
        raw: &[RawPostalCode],
        cancel: &CancelToken,
    ) -> Result<BatchReport, ResolveError> {
        let checked: Vec<_> = raw.iter().map(validate).collect();

        let mut seen = HashSet::new();
        let distinct: Vec<PostalCode> = checked
            .iter()
            .flatten()
            .filter(|code| seen.insert(*code))
            .cloned()
            .collect();

        let outcomes = self.lookup_distinct(&distinct, cancel)?;

        let mut report = BatchReport::default();
        for (index, (entry, validated)) in raw.iter().zip(&checked).enumerate() {
            let code = match validated {
                Ok(code) => code,
                Err(invalid) => {
                    warn!(index, raw = %invalid.raw, "invalid postal code");
                    report.skipped.push(SkippedEntry {
                        index,
                        raw: invalid.raw.clone(),
                        reason: SkipReason::Invalid,
                    });
                    continue;
                }
            };

            let reason = match outcomes.get(code) {
                Some(Ok(point)) => {
                    report.locations.push(ResolvedLocation {
                        postal_code: code.clone(),
                        point: *point,
                    });
                    continue;
                }
                Some(Err(err)) => SkipReason::from(err),
                None => SkipReason::Unavailable,
            };
            warn!(index, postal_code = %code, ?reason, "postal code not placed");
            report.skipped.push(SkippedEntry {
                index,
                raw: entry.to_string(),
                reason,
            });
        }

        info!(
            total = raw.len(),
            distinct = distinct.len(),
            located = report.locations.len(),
            skipped = report.skipped.len(),
            "batch resolved"
        );
        Ok(report)
    }

    fn lookup_distinct(
        &self,
        codes: &[PostalCode],
        cancel: &CancelToken,
    ) -> Result<HashMap<PostalCode, Outcome>, ResolveError> {
        let next = AtomicUsize::new(0);
        let fatal = OnceLock::new();
        // Cancelled by the caller, or by a worker that hit a fatal error.
        let batch = cancel.child();
        let workers = self.concurrency.min(codes.len());

        let results: Vec<(usize, Outcome)> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| self.drain(codes, &next, &fatal, &batch)));
            }
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(done) => done,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        if let Some(err) = fatal.into_inner() {
            error!(error = %err, "aborting batch");
            return Err(err);
        }
        if cancel.is_cancelled() {
            info!(completed = results.len(), pending = codes.len() - results.len(), "batch cancelled");
            return Err(ResolveError::Cancelled);
        }

        Ok(results
            .into_iter()
            .map(|(i, outcome)| (codes[i].clone(), outcome))
            .collect())
    }

    /// Worker loop: claim the next unclaimed code until the queue is empty
    /// or the batch token is cancelled. A fatal lookup error cancels the
    /// batch token, which also cuts short other workers' back-off sleeps.
    fn drain(
        &self,
        codes: &[PostalCode],
        next: &AtomicUsize,
        fatal: &OnceLock<ResolveError>,
        batch: &CancelToken,
    ) -> Vec<(usize, Outcome)> {
        let mut done = Vec::new();
        loop {
            if batch.is_cancelled() {
                break;
            }
            let i = next.fetch_add(1, Ordering::SeqCst);
            let Some(code) = codes.get(i) else {
                break;
            };

            let outcome = self.resolve_cancellable(code, batch);
            if let Some(abort) = outcome.as_ref().err().and_then(batch_abort) {
                // First fatal error wins.
                let _ = fatal.set(abort);
                batch.cancel();
            }
            done.push((i, outcome));
        }
        done
    }
}

/// Lookup failures that make every other lookup in the batch pointless.
fn batch_abort(err: &LookupError) -> Option<ResolveError> {
    match err {
        LookupError::CredentialRejected(status) => {
            Some(ResolveError::CredentialRejected { status: *status })
        }
        LookupError::Misconfigured(msg) => Some(ResolveError::Client(msg.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{mpsc, Mutex};
    use std::time::{Duration, Instant};

    /// Scripted geocoder: each code pops its next scripted outcome (the last
    /// one repeats). Unknown codes are NotFound. Records every call.
    #[derive(Default)]
    struct StubGeocoder {
        script: Mutex<HashMap<String, VecDeque<Outcome>>>,
        calls: Mutex<Vec<String>>,
    }

    impl StubGeocoder {
        fn with(self, code: &str, outcomes: Vec<Outcome>) -> Self {
            self.script.lock().unwrap().insert(code.to_string(), outcomes.into());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, code: &str) -> usize {
            self.calls().iter().filter(|c| *c == code).count()
        }
    }

    impl Geocoder for StubGeocoder {
        fn lookup(&self, code: &PostalCode) -> Outcome {
            self.calls.lock().unwrap().push(code.to_string());
            let mut script = self.script.lock().unwrap();
            match script.get_mut(code.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or(Err(LookupError::NotFound)),
                None => Err(LookupError::NotFound),
            }
        }
    }

    fn point(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon).unwrap()
    }

    fn code(s: &str) -> PostalCode {
        s.parse().unwrap()
    }

    fn raws(values: &[&str]) -> Vec<RawPostalCode> {
        values.iter().map(|v| RawPostalCode::from(*v)).collect()
    }

    fn resolver(stub: &Arc<StubGeocoder>) -> PostalResolver {
        PostalResolver::new(Arc::clone(stub), Arc::new(GeoCache::in_memory()))
            .with_retry(RetryPolicy::new(3, 1))
            .with_concurrency(4)
    }

    #[test]
    fn test_scenario_duplicates_and_invalid() {
        let stub = Arc::new(StubGeocoder::default().with("569933", vec![Ok(point(1.3521, 103.8198))]));
        let resolver = resolver(&stub);

        let report = resolver
            .resolve_batch(&raws(&["569933", "56993", "569933.0", "ABCDEF"]), &CancelToken::new())
            .unwrap();

        assert_eq!(report.locations.len(), 2);
        for loc in &report.locations {
            assert_eq!(loc.postal_code.as_str(), "569933");
            assert_eq!(loc.point, point(1.3521, 103.8198));
        }
        let skipped: Vec<_> = report.skipped.iter().map(|s| (s.index, s.raw.as_str(), s.reason)).collect();
        assert_eq!(
            skipped,
            vec![(1, "56993", SkipReason::Invalid), (3, "ABCDEF", SkipReason::Invalid)]
        );
        // Looked up once even though it appears twice.
        assert_eq!(stub.calls_for("569933"), 1);
    }

    #[test]
    fn test_preserves_input_order() {
        let stub = Arc::new(
            StubGeocoder::default()
                .with("111111", vec![Ok(point(1.1, 103.1))])
                .with("333333", vec![Ok(point(1.3, 103.3))])
                .with("222222", vec![Ok(point(1.2, 103.2))]),
        );
        let resolver = resolver(&stub);

        let out = resolver
            .resolve_all(&raws(&["333333", "bogus", "111111", "222222", "333333"]))
            .unwrap();
        let codes: Vec<_> = out.iter().map(|l| l.postal_code.as_str()).collect();
        assert_eq!(codes, vec!["333333", "111111", "222222", "333333"]);
    }

    #[test]
    fn test_pre_populated_cache_issues_no_calls() {
        let stub = Arc::new(StubGeocoder::default());
        let cache = Arc::new(GeoCache::in_memory());
        cache.insert(code("569933"), point(1.3521, 103.8198));
        let resolver = PostalResolver::new(Arc::clone(&stub), cache);

        assert_eq!(resolver.resolve(&code("569933")), Ok(point(1.3521, 103.8198)));
        let out = resolver.resolve_all(&raws(&["569933"])).unwrap();
        assert_eq!(out.len(), 1);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn test_idempotent_across_calls() {
        let stub = Arc::new(
            StubGeocoder::default()
                .with("569933", vec![Ok(point(1.3521, 103.8198))])
                .with("238801", vec![Ok(point(1.3006, 103.8448))]),
        );
        let resolver = resolver(&stub);
        let input = raws(&["569933", "238801", "000000", "569933"]);

        let first = resolver.resolve_batch(&input, &CancelToken::new()).unwrap();
        let second = resolver.resolve_batch(&input, &CancelToken::new()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        // Hits are cached; only the unknown code is asked again.
        assert_eq!(stub.calls_for("569933"), 1);
        assert_eq!(stub.calls_for("000000"), 2);
    }

    #[test]
    fn test_fail_open_on_unavailable() {
        let stub = Arc::new(
            StubGeocoder::default()
                .with("111111", vec![Err(LookupError::Unavailable("HTTP 503".into()))])
                .with("222222", vec![Ok(point(1.2, 103.2))])
                .with("333333", vec![Err(LookupError::InvalidResponse("garbage".into()))]),
        );
        let resolver = resolver(&stub);

        let report = resolver
            .resolve_batch(&raws(&["111111", "222222", "333333", "444444"]), &CancelToken::new())
            .unwrap();

        assert_eq!(report.locations.len(), 1);
        assert_eq!(report.locations[0].postal_code.as_str(), "222222");
        let reasons: Vec<_> = report.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![SkipReason::Unavailable, SkipReason::InvalidResponse, SkipReason::NotFound]
        );
        // Transient failures exhaust the retry budget; the rest are tried once.
        assert_eq!(stub.calls_for("111111"), 3);
        assert_eq!(stub.calls_for("333333"), 1);
        assert_eq!(stub.calls_for("444444"), 1);
    }

    #[test]
    fn test_transient_failure_recovers_on_retry() {
        let stub = Arc::new(StubGeocoder::default().with(
            "569933",
            vec![
                Err(LookupError::Unavailable("timed out".into())),
                Ok(point(1.3521, 103.8198)),
            ],
        ));
        let resolver = resolver(&stub);

        assert_eq!(resolver.resolve(&code("569933")), Ok(point(1.3521, 103.8198)));
        assert_eq!(stub.calls_for("569933"), 2);
    }

    #[test]
    fn test_credential_rejection_aborts_batch() {
        let stub = Arc::new(
            StubGeocoder::default().with("111111", vec![Err(LookupError::CredentialRejected(401))]),
        );
        let resolver = PostalResolver::new(Arc::clone(&stub), Arc::new(GeoCache::in_memory()))
            .with_concurrency(1);

        let err = resolver
            .resolve_all(&raws(&["111111", "222222", "333333"]))
            .unwrap_err();
        assert!(matches!(err, ResolveError::CredentialRejected { status: 401 }));
        // Single worker stops right after the rejection.
        assert_eq!(stub.calls(), vec!["111111".to_string()]);
    }

    /// Fails transiently for every code except `reject`, which answers 401
    /// after a short delay.
    struct LateRejection {
        reject: &'static str,
        calls: AtomicUsize,
    }

    impl Geocoder for LateRejection {
        fn lookup(&self, code: &PostalCode) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if code.as_str() == self.reject {
                thread::sleep(Duration::from_millis(50));
                Err(LookupError::CredentialRejected(401))
            } else {
                Err(LookupError::Unavailable("HTTP 503".into()))
            }
        }
    }

    #[test]
    fn test_credential_rejection_cuts_other_workers_backoff() {
        let geocoder = Arc::new(LateRejection {
            reject: "222222",
            calls: AtomicUsize::new(0),
        });
        let resolver = PostalResolver::new(Arc::clone(&geocoder), Arc::new(GeoCache::in_memory()))
            .with_retry(RetryPolicy::new(3, 1_000))
            .with_concurrency(2);

        let start = Instant::now();
        let err = resolver.resolve_all(&raws(&["111111", "222222"])).unwrap_err();

        assert!(matches!(err, ResolveError::CredentialRejected { status: 401 }));
        // The first back-off alone is a full second.
        assert!(start.elapsed() < Duration::from_millis(900), "took {:?}", start.elapsed());
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_misconfigured_client_aborts_batch() {
        let stub = Arc::new(
            StubGeocoder::default()
                .with("111111", vec![Err(LookupError::Misconfigured("invalid url".into()))]),
        );
        let resolver = PostalResolver::new(Arc::clone(&stub), Arc::new(GeoCache::in_memory()))
            .with_concurrency(1);

        let err = resolver
            .resolve_all(&raws(&["111111", "222222"]))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Client(_)));
        // Not retried, and nothing else is attempted.
        assert_eq!(stub.calls(), vec!["111111".to_string()]);
    }

    /// Signals when a lookup starts, then holds it until `release` is
    /// cancelled and fails transiently.
    struct HeldGeocoder {
        started: Mutex<mpsc::Sender<String>>,
        release: CancelToken,
        calls: AtomicUsize,
    }

    impl Geocoder for HeldGeocoder {
        fn lookup(&self, code: &PostalCode) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.lock().unwrap().send(code.to_string());
            while !self.release.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(LookupError::Unavailable("HTTP 503".into()))
        }
    }

    #[test]
    fn test_cancel_during_batch() {
        let cancel = CancelToken::new();
        let (started_tx, started_rx) = mpsc::channel();
        let geocoder = Arc::new(HeldGeocoder {
            started: Mutex::new(started_tx),
            release: cancel.clone(),
            calls: AtomicUsize::new(0),
        });
        let resolver = PostalResolver::new(Arc::clone(&geocoder), Arc::new(GeoCache::in_memory()))
            .with_retry(RetryPolicy::new(3, 5_000))
            .with_concurrency(1);

        let canceller = cancel.clone();
        let watcher = thread::spawn(move || {
            started_rx.recv().unwrap();
            canceller.cancel();
        });

        let start = Instant::now();
        let input = raws(&["111111", "222222", "333333", "444444", "555555"]);
        let err = resolver.resolve_batch(&input, &cancel).unwrap_err();
        watcher.join().unwrap();

        assert!(matches!(err, ResolveError::Cancelled));
        // The held lookup ran; the back-off and the remaining codes did not.
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(resolver.cache().is_empty());
    }

    #[test]
    fn test_cancelled_batch() {
        let stub = Arc::new(StubGeocoder::default());
        let resolver = resolver(&stub);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = resolver.resolve_batch(&raws(&["569933", "238801"]), &cancel).unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn test_empty_and_all_invalid_input() {
        let stub = Arc::new(StubGeocoder::default());
        let resolver = resolver(&stub);

        assert!(resolver.resolve_all(&[]).unwrap().is_empty());

        let report = resolver
            .resolve_batch(&[RawPostalCode::Empty, RawPostalCode::Number(12.5)], &CancelToken::new())
            .unwrap();
        assert!(report.locations.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn test_many_distinct_codes_each_looked_up_once() {
        let mut stub = StubGeocoder::default();
        let mut input = Vec::new();
        for i in 0..60 {
            let key = format!("{:06}", 100_000 + i);
            stub = stub.with(&key, vec![Ok(point(1.0 + f64::from(i) / 100.0, 103.8))]);
            input.push(RawPostalCode::from(key.as_str()));
            input.push(RawPostalCode::Number(f64::from(100_000 + i)));
        }
        let stub = Arc::new(stub);
        let resolver = resolver(&stub).with_concurrency(8);

        let out = resolver.resolve_all(&input).unwrap();
        assert_eq!(out.len(), 120);
        assert_eq!(stub.calls().len(), 60);
        for (i, pair) in out.chunks(2).enumerate() {
            assert_eq!(pair[0], pair[1]);
            assert_eq!(pair[0].postal_code.to_string(), format!("{:06}", 100_000 + i));
        }
    }

    #[test]
    fn test_from_config_requires_token() {
        let config = ResolverConfig::default();
        let result = PostalResolver::from_config(&config, Arc::new(GeoCache::in_memory()));
        assert!(matches!(result, Err(ResolveError::MissingCredential)));

        let config = ResolverConfig {
            token: "jwt".into(),
            ..ResolverConfig::default()
        };
        assert!(PostalResolver::from_config(&config, Arc::new(GeoCache::in_memory())).is_ok());
    }

    #[test]
    fn test_from_config_rejects_bad_endpoint() {
        let config = ResolverConfig {
            token: "jwt".into(),
            endpoint: "not a url".into(),
            ..ResolverConfig::default()
        };
        let result = PostalResolver::from_config(&config, Arc::new(GeoCache::in_memory()));
        assert!(matches!(result, Err(ResolveError::Client(_))));
    }
}
