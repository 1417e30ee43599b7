//! Pure geometry helpers: great-circle distance and canonical pair keys.
//! No I/O, no async — grounds on the `haversine_km` formula used for
//! distance-based match scoring, rewritten here in meters.

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two lat/lon points, in meters, using the
/// spherical-earth haversine formula. Inputs must be finite degrees; the
/// result is always non-negative.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    debug_assert!(lat1.is_finite() && lon1.is_finite() && lat2.is_finite() && lon2.is_finite());

    let (lat1_r, lat2_r) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_METERS * c
}

/// Canonical key for an unordered pair of ids: the two ids sorted
/// ascending and joined with `:`. Commutative by construction.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Sorts an unordered pair into canonical `(first, second)` order, the same
/// order `pair_key` uses. Used wherever a caller needs aligned ids, not just
/// the joined string (e.g. `user_i = owner(circle_i)` alignment).
pub fn canonical_order<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
