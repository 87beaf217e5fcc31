//! Postal code → coordinate cache shared by all lookup workers.
//!
//! In-memory unless built with a path, in which case entries are read on
//! load and written back by [`GeoCache::persist`]. Default file location is
//! ~/.kampung_atlas/cache.json.
//!
//! TTL: 30 days. Only successful lookups are cached.

use super::types::{GeoPoint, PostalCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const CACHE_TTL_MS: i64 = 30 * 24 * 3600 * 1000; // 30 days in ms

#[derive(Serialize, Deserialize, Clone, Copy)]
struct CacheEntry {
    lat: f64,
    lon: f64,
    timestamp: i64,
}

/// The coordinate cache. All methods take `&self`; share it through an `Arc`.
#[derive(Default)]
pub struct GeoCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<PostalCode, CacheEntry>>,
}

impl GeoCache {
    /// A cache that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load cache from the default location.
    pub fn load() -> Self {
        Self::load_from(Self::default_path())
    }

    /// Load cache from a specific path. A missing or unreadable file gives
    /// an empty cache that will be written to `path` on persist.
    pub fn load_from(path: PathBuf) -> Self {
        let entries = Self::read_file(&path).unwrap_or_default();
        tracing::debug!(path = %path.display(), entries = entries.len(), "loaded geocode cache");
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kampung_atlas")
            .join("cache.json")
    }

    fn read_file(path: &Path) -> Option<HashMap<PostalCode, CacheEntry>> {
        let data = fs::read_to_string(path).ok()?;
        let stored: HashMap<String, CacheEntry> = match serde_json::from_str(&data) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable geocode cache");
                return None;
            }
        };
        Some(
            stored
                .into_iter()
                .filter_map(|(key, entry)| Some((key.parse().ok()?, entry)))
                .collect(),
        )
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PostalCode, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a postal code. Returns None if missing or expired.
    pub fn get(&self, code: &PostalCode) -> Option<GeoPoint> {
        let entry = *self.entries().get(code)?;

        let now = chrono::Utc::now().timestamp_millis();
        if now - entry.timestamp > CACHE_TTL_MS {
            return None; // expired
        }

        GeoPoint::new(entry.lat, entry.lon)
    }

    pub fn insert(&self, code: PostalCode, point: GeoPoint) {
        let entry = CacheEntry {
            lat: point.latitude(),
            lon: point.longitude(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.entries().insert(code, entry);
    }

    /// Write all entries to the backing file. No-op for an in-memory cache.
    pub fn persist(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let snapshot: BTreeMap<String, CacheEntry> = self
            .entries()
            .iter()
            .map(|(code, entry)| (code.to_string(), *entry))
            .collect();
        let json = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path, json)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
