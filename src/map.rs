//! Standalone map exports for a resolved batch.
//!
//! HTML: a self-contained Leaflet page, one marker per location with the
//! postal code as popup. GeoJSON: a FeatureCollection of points.

use crate::postal::ResolvedLocation;
use serde_json::{json, Value};
use std::fs;
use std::io;
use std::path::Path;

/// Singapore, the default map centre.
pub const DEFAULT_CENTER: (f64, f64) = (1.3521, 103.8198);
pub const DEFAULT_ZOOM: u8 = 12;

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Participants by Postal Code</title>
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<style>
  html, body { margin: 0; height: 100%; }
  #map { width: 100%; height: 100%; }
</style>
</head>
<body>
<div id="map"></div>
<script>
  const markers = __MARKERS__;
  const map = L.map('map').setView([__CENTER_LAT__, __CENTER_LON__], __ZOOM__);
  L.tileLayer('https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png', {
    maxZoom: 19,
    attribution: '&copy; OpenStreetMap contributors'
  }).addTo(map);
  for (const m of markers) {
    L.marker([m.latitude, m.longitude]).bindPopup(m.postal_code).addTo(map);
  }
</script>
</body>
</html>
"#;

pub fn render_html(locations: &[ResolvedLocation]) -> String {
    let markers = json!(locations).to_string();
    HTML_TEMPLATE
        .replace("__MARKERS__", &markers)
        .replace("__CENTER_LAT__", &DEFAULT_CENTER.0.to_string())
        .replace("__CENTER_LON__", &DEFAULT_CENTER.1.to_string())
        .replace("__ZOOM__", &DEFAULT_ZOOM.to_string())
}

pub fn to_geojson(locations: &[ResolvedLocation]) -> Value {
    let features: Vec<Value> = locations
        .iter()
        .map(|loc| {
            json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    // GeoJSON order is [lon, lat].
                    "coordinates": [loc.point.longitude(), loc.point.latitude()],
                },
                "properties": { "postal_code": loc.postal_code },
            })
        })
        .collect();

    json!({ "type": "FeatureCollection", "features": features })
}

pub fn write_html(path: &Path, locations: &[ResolvedLocation]) -> io::Result<()> {
    fs::write(path, render_html(locations))
}

pub fn write_geojson(path: &Path, locations: &[ResolvedLocation]) -> io::Result<()> {
    let json = serde_json::to_string_pretty(&to_geojson(locations))?;
    fs::write(path, json)
}
