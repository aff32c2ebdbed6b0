//! Geohash encoding and bucket enumeration.
//!
//! Vessels are indexed by a precision 7 geohash and its 5 character prefix.
//! The prefix ("bucket") is what viewport queries prune on.

use crate::models::BoundingBox;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Length of the stored full geohash (~150 m cells)
pub const FULL_PRECISION: usize = 7;

/// Length of the bucket prefix (~4.9 km x 4.9 km cells)
pub const BUCKET_PRECISION: usize = 5;

/// Longest supported geohash, both axes fit in a `u64`
pub const MAX_PRECISION: usize = 12;

/// Encode a position as a geohash of `precision` characters.
pub fn encode(lat: f64, lon: f64, precision: usize) -> String {
    let precision = precision.clamp(1, MAX_PRECISION);
    let (lat_bits, lon_bits) = axis_bits(precision);
    let lat_idx = cell_index(lat, -90.0, 90.0, lat_bits);
    let lon_idx = cell_index(lon, -180.0, 180.0, lon_bits);
    interleave(lat_idx, lon_idx, precision)
}

/// Bucket prefix of a full geohash.
pub fn bucket_of(geohash: &str) -> &str {
    &geohash[..geohash.len().min(BUCKET_PRECISION)]
}

/// The bbox needs more buckets than the caller is willing to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyBuckets {
    pub needed: u64,
    pub limit: usize,
}

/// Enumerate every geohash cell of `precision` that intersects `bbox`.
///
/// Cells touching the rectangle only on an edge are included, so the result
/// is a superset of the cells holding in-bbox points. Returned hashes are
/// sorted.
pub fn buckets_in(
    bbox: &BoundingBox,
    precision: usize,
    limit: usize,
) -> Result<Vec<String>, TooManyBuckets> {
    let precision = precision.clamp(1, MAX_PRECISION);
    let (lat_bits, lon_bits) = axis_bits(precision);

    let lat_lo = cell_index(bbox.min_lat, -90.0, 90.0, lat_bits);
    let lat_hi = cell_index(bbox.max_lat, -90.0, 90.0, lat_bits);
    let lon_lo = cell_index(bbox.min_lon, -180.0, 180.0, lon_bits);
    let lon_hi = cell_index(bbox.max_lon, -180.0, 180.0, lon_bits);

    let needed = (lat_hi - lat_lo + 1).saturating_mul(lon_hi - lon_lo + 1);
    if needed > limit as u64 {
        return Err(TooManyBuckets { needed, limit });
    }

    let mut buckets = Vec::with_capacity(needed as usize);
    for lat_idx in lat_lo..=lat_hi {
        for lon_idx in lon_lo..=lon_hi {
            buckets.push(interleave(lat_idx, lon_idx, precision));
        }
    }
    buckets.sort_unstable();
    Ok(buckets)
}

/// Bits per axis; longitude takes the extra bit on odd totals.
fn axis_bits(precision: usize) -> (u32, u32) {
    let total = (precision * 5) as u32;
    (total / 2, total.div_ceil(2))
}

/// Index of the cell holding `value` after `bits` bisections of `[lo, hi]`.
fn cell_index(value: f64, mut lo: f64, mut hi: f64, bits: u32) -> u64 {
    let mut idx = 0u64;
    for _ in 0..bits {
        let mid = (lo + hi) / 2.0;
        idx <<= 1;
        if value >= mid {
            idx |= 1;
            lo = mid;
        } else {
            hi = mid;
        }
    }
    idx
}

fn interleave(lat_idx: u64, lon_idx: u64, precision: usize) -> String {
    let (mut lat_left, mut lon_left) = axis_bits(precision);
    let mut out = String::with_capacity(precision);
    let mut ch = 0usize;

    for bit in 0..precision * 5 {
        // even bit positions carry longitude
        let b = if bit % 2 == 0 {
            lon_left -= 1;
            (lon_idx >> lon_left) & 1
        } else {
            lat_left -= 1;
            (lat_idx >> lat_left) & 1
        };
        ch = (ch << 1) | b as usize;
        if bit % 5 == 4 {
            out.push(BASE32[ch] as char);
            ch = 0;
        }
    }
    out
}
