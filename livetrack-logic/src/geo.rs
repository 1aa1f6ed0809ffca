use serde::{Deserialize, Serialize};

use crate::location::{LocationSample, RestaurantLocation};

/// Mean earth radius used for all great-circle math
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A bare lat/lng pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl From<(f64, f64)> for Coordinate {
    fn from((lat, lng): (f64, f64)) -> Self {
        Self { lat, lng }
    }
}

impl From<&LocationSample> for Coordinate {
    fn from(value: &LocationSample) -> Self {
        Self {
            lat: value.lat,
            lng: value.lng,
        }
    }
}

impl From<&RestaurantLocation> for Coordinate {
    fn from(value: &RestaurantLocation) -> Self {
        Self {
            lat: value.lat,
            lng: value.lng,
        }
    }
}

/// Great-circle distance between two points in kilometers (haversine)
pub fn distance_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = f64::to_radians(lat2 - lat1);
    let d_lng = f64::to_radians(lng2 - lng1);
    let a = f64::powi(f64::sin(d_lat / 2.0), 2)
        + f64::cos(f64::to_radians(lat1))
            * f64::cos(f64::to_radians(lat2))
            * f64::powi(f64::sin(d_lng / 2.0), 2);
    // Rounding can push `a` past 1 for near antipodal points
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * f64::atan2(f64::sqrt(a), f64::sqrt(1.0 - a));
    EARTH_RADIUS_KM * c
}

/// Render a distance for display, meters below one kilometer and one decimal above
pub fn format_distance(km: f64) -> String {
    if !km.is_finite() || km <= 0.0 {
        "0 m".to_string()
    } else if (km * 1000.0).round() < 1000.0 {
        format!("{} m", (km * 1000.0).round() as u64)
    } else {
        format!("{km:.1} km")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, specta::Type)]
/// A distance along with how it should be shown to the user
pub struct DistanceResult {
    pub km: f64,
    pub formatted: String,
}

impl DistanceResult {
    pub fn from_km(km: f64) -> Self {
        Self {
            km,
            formatted: format_distance(km),
        }
    }

    pub fn between(a: impl Into<Coordinate>, b: impl Into<Coordinate>) -> Self {
        let (a, b) = (a.into(), b.into());
        Self::from_km(distance_km(a.lat, a.lng, b.lat, b.lng))
    }
}
