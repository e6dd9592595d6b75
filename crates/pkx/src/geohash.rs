//! 🗺️ Spatial index: proximity search on a database that only knows `==`.
//!
//! Relays can't do radius queries, bounding boxes, or even `LIKE 'u4pr%'`. So at
//! write time we stamp every record with ALL prefixes of its geohash (`g` tags,
//! lengths 1..=10), and at read time we compute the same fan-out for the search
//! center and ask for an exact match at one resolution. Same cell at level `p`
//! means "nearby, for some value of nearby". It's not geometry. It's equality
//! cosplaying as geometry. 🦆

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 📏 Finest precision we fan out to (≈ 1.2m × 0.6m cells, plenty for a parking spot).
pub const MAX_PRECISION: usize = 10;

/// Geohash stops being meaningful past this point, so requests are clamped here.
const HARD_PRECISION_CAP: usize = 12;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// 📍 A WGS84 coordinate. Validated, because latitude 4000 is not a place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinateError {
    #[error("💀 '{0}' is not a 'lat,lon' pair")]
    Malformed(String),
    #[error("💀 latitude {0} is off the planet")]
    LatitudeOutOfRange(String),
    #[error("💀 longitude {0} is off the planet")]
    LongitudeOutOfRange(String),
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self, CoordinateError> {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat.to_string()));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(CoordinateError::LongitudeOutOfRange(lon.to_string()));
        }
        Ok(Self { lat, lon })
    }

    /// Full-precision geohash for this point.
    pub fn geohash(&self) -> String {
        encode(*self, MAX_PRECISION)
    }
}

impl FromStr for Coordinate {
    type Err = CoordinateError;

    /// Accepts `"lat,lon"` with optional whitespace.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = raw
            .split_once(',')
            .ok_or_else(|| CoordinateError::Malformed(raw.to_string()))?;
        let lat: f64 = lat
            .trim()
            .parse()
            .map_err(|_| CoordinateError::Malformed(raw.to_string()))?;
        let lon: f64 = lon
            .trim()
            .parse()
            .map_err(|_| CoordinateError::Malformed(raw.to_string()))?;
        Coordinate::new(lat, lon)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lon)
    }
}

/// 🔢 Classic interleaved-bisection geohash. Longitude takes the even bits.
pub fn encode(coordinate: Coordinate, precision: usize) -> String {
    let precision = precision.min(HARD_PRECISION_CAP);
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut bits = 0u8;
    let mut bit_count = 0u8;
    let mut even = true;

    while hash.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if coordinate.lon >= mid {
                bits = (bits << 1) | 1;
                lon_lo = mid;
            } else {
                bits <<= 1;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if coordinate.lat >= mid {
                bits = (bits << 1) | 1;
                lat_lo = mid;
            } else {
                bits <<= 1;
                lat_hi = mid;
            }
        }
        even = !even;
        bit_count += 1;
        if bit_count == 5 {
            hash.push(BASE32[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }
    hash
}

/// 🌳 The fan-out: `[g1, g2, ..., gN]`, each a prefix of the next, `gN` the full hash.
///
/// Used identically when writing (attach as `g` tags) and reading (pick a level to query).
pub fn fanout(coordinate: Coordinate, max_precision: usize) -> Vec<String> {
    let full = encode(coordinate, max_precision);
    (1..=full.len()).map(|len| full[..len].to_string()).collect()
}

/// 🏷️ The fan-out rendered as `["g", prefix]` tags, ready to bolt onto a draft.
pub fn fanout_tags(coordinate: Coordinate) -> Vec<Vec<String>> {
    fanout(coordinate, MAX_PRECISION)
        .into_iter()
        .map(|prefix| vec!["g".to_string(), prefix])
        .collect()
}

/// ✅ The read-side rule: any stored prefix equal to any query prefix is a hit.
pub fn shares_cell(record_hashes: &[String], query_hashes: &[String]) -> bool {
    record_hashes
        .iter()
        .any(|stored| query_hashes.iter().any(|wanted| wanted == stored))
}

/// 🪜 The query ladder for a search center: finest level first, coarsest last.
///
/// Each rung is `(precision, prefix)`. Walking it top to bottom is fallback step (1).
/// Step (2), the unscoped global query, lives with the orchestrator because it has
/// no geohash at all.
pub fn search_ladder(center: Coordinate, max_precision: usize, min_precision: usize) -> Vec<(usize, String)> {
    let max_precision = max_precision.clamp(1, HARD_PRECISION_CAP);
    let min_precision = min_precision.clamp(1, max_precision);
    let hashes = fanout(center, max_precision);
    (min_precision..=max_precision)
        .rev()
        .map(|precision| (precision, hashes[precision - 1].clone()))
        .collect()
}
