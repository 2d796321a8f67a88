//! Per-vessel sliding windows of recent position reports.

use std::collections::{HashMap, VecDeque};

use crate::models::{AisPoint, Mmsi};

/// Bounded FIFO history of recent points, one ring per vessel.
///
/// Each replay session owns its own `TrackStore`; it is dropped when the
/// session ends. Eviction is strict FIFO by insertion order and the ring
/// never holds more than `window` points.
#[derive(Debug)]
pub struct TrackStore {
    window: usize,
    tracks: HashMap<Mmsi, VecDeque<AisPoint>>,
}

impl TrackStore {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            tracks: HashMap::new(),
        }
    }

    /// Append a point to its vessel's ring, evicting the oldest entry when
    /// the ring is full. Returns the window after insertion, oldest first.
    pub fn push(&mut self, point: AisPoint) -> &VecDeque<AisPoint> {
        let ring = self
            .tracks
            .entry(point.mmsi.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.window));
        if ring.len() == self.window {
            ring.pop_front();
        }
        ring.push_back(point);
        ring
    }

    /// The point received immediately before the most recent one, if any.
    pub fn previous(&self, mmsi: &Mmsi) -> Option<&AisPoint> {
        let ring = self.tracks.get(mmsi)?;
        if ring.len() >= 2 {
            ring.get(ring.len() - 2)
        } else {
            None
        }
    }

    /// Number of vessels currently tracked.
    pub fn vessel_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn point(mmsi: &str, secs: i64) -> AisPoint {
        AisPoint {
            mmsi: Mmsi::try_from(mmsi).unwrap(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            lat: 60.0,
            lon: 25.0,
            sog: None,
            cog: None,
            heading: None,
        }
    }

    #[test]
    fn window_is_bounded_and_fifo() {
        let mut store = TrackStore::new(5);
        for i in 0..8 {
            let ring = store.push(point("230123456", i));
            assert!(ring.len() <= 5);
        }
        let ring = store.push(point("230123456", 8));
        assert_eq!(ring.len(), 5);
        // oldest-first order, oldest entries evicted
        let times: Vec<i64> = ring.iter().map(|p| p.timestamp.timestamp()).collect();
        assert_eq!(times, vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn previous_returns_second_newest() {
        let mut store = TrackStore::new(5);
        let mmsi = Mmsi::try_from("230123456").unwrap();
        assert!(store.previous(&mmsi).is_none());

        store.push(point("230123456", 1));
        assert!(store.previous(&mmsi).is_none());

        store.push(point("230123456", 2));
        assert_eq!(store.previous(&mmsi).unwrap().timestamp.timestamp(), 1);

        store.push(point("230123456", 3));
        assert_eq!(store.previous(&mmsi).unwrap().timestamp.timestamp(), 2);
    }

    #[test]
    fn vessels_are_isolated() {
        let mut store = TrackStore::new(5);
        store.push(point("230123456", 1));
        store.push(point("230999999", 2));
        assert_eq!(store.vessel_count(), 2);
        assert!(store.previous(&Mmsi::try_from("230123456").unwrap()).is_none());
    }
}
