use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, FirestoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid_argument("Latitude must be between -90 and 90 degrees."));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid_argument("Longitude must be between -180 and 180 degrees."));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Latitude first, then longitude.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.latitude
            .total_cmp(&other.latitude)
            .then_with(|| self.longitude.total_cmp(&other.longitude))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_and_orders() {
        let a = GeoPoint::new(10.0, 20.0).unwrap();
        let b = GeoPoint::new(10.0, 30.0).unwrap();
        assert_eq!(a.compare(&b), Ordering::Less);
        assert!(GeoPoint::new(100.0, 0.0).is_err());
    }
}
