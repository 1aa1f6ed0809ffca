use std::sync::atomic::{AtomicU32, Ordering};

use livetrack_logic::{Coordinate, LocationSample, PositionProvider, prelude::*};

/// Fake platform fix that walks in a straight line from `from` to `to`, one step per fix,
/// and then stays at the destination
pub struct WalkingProvider {
    from: Coordinate,
    to: Coordinate,
    steps: u32,
    taken: AtomicU32,
    accuracy_meters: f64,
}

impl WalkingProvider {
    pub fn new(from: Coordinate, to: Coordinate, steps: u32, accuracy_meters: f64) -> Self {
        Self {
            from,
            to,
            steps: steps.max(1),
            taken: AtomicU32::new(0),
            accuracy_meters,
        }
    }

    fn position_at(&self, step: u32) -> Coordinate {
        let t = f64::from(step.min(self.steps)) / f64::from(self.steps);
        Coordinate {
            lat: self.from.lat + (self.to.lat - self.from.lat) * t,
            lng: self.from.lng + (self.to.lng - self.from.lng) * t,
        }
    }
}

impl PositionProvider for WalkingProvider {
    fn current_position(&self) -> Result<LocationSample> {
        let step = self.taken.fetch_add(1, Ordering::SeqCst);
        let pos = self.position_at(step);
        Ok(LocationSample::new(
            pos.lat,
            pos.lng,
            Some(self.accuracy_meters),
        ))
    }
}

/// Parse `LAT,LNG`
pub fn parse_coordinate(raw: &str) -> Result<Coordinate, String> {
    let (lat, lng) = raw
        .split_once(',')
        .ok_or_else(|| format!("Expected LAT,LNG, got {raw}"))?;
    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let lng = lng.trim().parse::<f64>().map_err(|e| e.to_string())?;
    if !LocationSample::new(lat, lng, None).is_valid() {
        return Err(format!("{raw} is not a valid coordinate"));
    }
    Ok(Coordinate { lat, lng })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walks_to_destination() {
        let walker = WalkingProvider::new(
            Coordinate { lat: 0.0, lng: 0.0 },
            Coordinate { lat: 1.0, lng: 2.0 },
            4,
            10.0,
        );
        let fixes = (0..6)
            .map(|_| walker.current_position().expect("Walker failed"))
            .collect::<Vec<_>>();

        assert_eq!((fixes[0].lat, fixes[0].lng), (0.0, 0.0));
        assert_eq!((fixes[2].lat, fixes[2].lng), (0.5, 1.0));
        assert_eq!((fixes[4].lat, fixes[4].lng), (1.0, 2.0));
        assert_eq!((fixes[5].lat, fixes[5].lng), (1.0, 2.0), "Walked past the end");
    }

    #[test]
    fn test_parse_coordinate() {
        let c = parse_coordinate("36.80, 10.18").expect("Failed to parse");
        assert_eq!((c.lat, c.lng), (36.80, 10.18));
        assert!(parse_coordinate("36.8").is_err());
        assert!(parse_coordinate("91,0").is_err());
        assert!(parse_coordinate("a,b").is_err());
    }
}
