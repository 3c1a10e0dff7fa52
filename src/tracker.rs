//! Map view state: where the map is centred, why, and how it gets there.

use crate::location::PositionError;
use crate::models::{Coords, IpLookup, LocationFix};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Where the current centre came from.
///
/// Device fixes always win: once `DeviceDerived`, an IP result is ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CenterSource {
    Unset,
    IpDerived(Coords),
    DeviceDerived(Coords),
}

/// The most recent fixes in arrival order, oldest dropped first.
#[derive(Debug, Clone)]
pub struct FixHistory {
    fixes: VecDeque<LocationFix>,
    capacity: usize,
}

impl FixHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            fixes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, fix: LocationFix) {
        if self.capacity == 0 {
            return;
        }
        while self.fixes.len() >= self.capacity {
            self.fixes.pop_front();
        }
        self.fixes.push_back(fix);
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocationFix> {
        self.fixes.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FlyTo {
    from: Coords,
    from_zoom: f64,
    to: Coords,
    to_zoom: f64,
    started: Instant,
    duration: Duration,
}

/// Map centre and zoom, animated between targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pub center: Coords,
    pub zoom: f64,
    flight: Option<FlyTo>,
    fly_duration: Duration,
}

impl Viewport {
    pub fn new(zoom: f64, fly_duration: Duration) -> Self {
        Self {
            center: Coords::new(0.0, 0.0),
            zoom,
            flight: None,
            fly_duration,
        }
    }

    /// Starts a smooth transition towards `target`.
    ///
    /// The (0, 0) sentinel is never a destination.
    pub fn fly_to(&mut self, target: Coords, zoom: f64, now: Instant) -> bool {
        if target.is_sentinel() {
            return false;
        }

        if self.fly_duration.is_zero() {
            self.center = target;
            self.zoom = zoom;
            self.flight = None;
            return true;
        }

        self.flight = Some(FlyTo {
            from: self.center,
            from_zoom: self.zoom,
            to: target,
            to_zoom: zoom,
            started: now,
            duration: self.fly_duration,
        });
        true
    }

    /// Steps any running animation to `now`.
    pub fn advance(&mut self, now: Instant) {
        let Some(flight) = &self.flight else {
            return;
        };

        let elapsed = now.saturating_duration_since(flight.started);
        if elapsed >= flight.duration {
            self.center = flight.to;
            self.zoom = flight.to_zoom;
            self.flight = None;
            return;
        }

        let t = ease_in_out(elapsed.as_secs_f64() / flight.duration.as_secs_f64());
        self.center = Coords::new(
            lerp(flight.from.lat, flight.to.lat, t),
            lerp(flight.from.lon, flight.to.lon, t),
        );
        self.zoom = lerp(flight.from_zoom, flight.to_zoom, t);
    }

    pub fn is_animating(&self) -> bool {
        self.flight.is_some()
    }

    /// Where the viewport will settle once the animation finishes.
    pub fn target(&self) -> Coords {
        self.flight.as_ref().map_or(self.center, |f| f.to)
    }

    /// Zoom changes take effect immediately; a running flight jumps to its
    /// destination.
    pub fn set_zoom(&mut self, zoom: f64) {
        if let Some(flight) = self.flight.take() {
            self.center = flight.to;
        }
        self.zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
    }
}

pub const MIN_ZOOM: f64 = 0.0;
pub const MAX_ZOOM: f64 = 19.0;

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn ease_in_out(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

/// Everything the map view knows about the user's location.
#[derive(Debug, Clone)]
pub struct Tracker {
    pub source: CenterSource,
    pub viewport: Viewport,
    pub latest_fix: Option<LocationFix>,
    pub history: FixHistory,
    pub is_tracking: bool,
    pub last_error: String,
    zoom: f64,
}

impl Tracker {
    pub fn new(zoom: f64, fly_duration: Duration, history_len: usize) -> Self {
        Self {
            source: CenterSource::Unset,
            viewport: Viewport::new(zoom, fly_duration),
            latest_fix: None,
            history: FixHistory::new(history_len),
            is_tracking: false,
            last_error: String::new(),
            zoom,
        }
    }

    pub fn begin_tracking(&mut self) {
        self.is_tracking = true;
        self.last_error.clear();
    }

    /// No location capability at all. Terminal: tracking never starts.
    pub fn unsupported(&mut self, err: &PositionError) {
        self.is_tracking = false;
        self.last_error = err.to_string();
    }

    /// Seeds the centre from the IP lookup unless anything else set it first.
    /// Returns whether the viewport moved.
    pub fn on_ip_lookup(&mut self, lookup: &IpLookup, now: Instant) -> bool {
        if self.source != CenterSource::Unset {
            debug!("Ignoring IP location, centre already {:?}", self.source);
            return false;
        }
        let Some(center) = lookup.center() else {
            return false;
        };

        info!("Centering on IP location ({}, {})", center.lat, center.lon);
        self.source = CenterSource::IpDerived(center);
        self.viewport.fly_to(center, self.zoom, now)
    }

    pub fn on_ip_error(&mut self, message: &str) {
        self.last_error = message.to_string();
    }

    pub fn on_fix(&mut self, fix: LocationFix, now: Instant) {
        let center = fix.coords();
        self.history.push(fix.clone());
        self.latest_fix = Some(fix);
        self.source = CenterSource::DeviceDerived(center);
        self.viewport.fly_to(center, self.zoom, now);
    }

    /// The watch stays open after an error; a later fix may still arrive.
    pub fn on_position_error(&mut self, err: &PositionError) {
        self.last_error = format!("Location error: {}", err);
        self.is_tracking = false;
    }

    pub fn zoom_by(&mut self, delta: f64) {
        self.zoom = (self.zoom + delta).clamp(MIN_ZOOM, MAX_ZOOM);
        self.viewport.set_zoom(self.zoom);
    }

    /// Flies back to the latest device fix, if any.
    pub fn recenter(&mut self, now: Instant) -> bool {
        match &self.latest_fix {
            Some(fix) => self.viewport.fly_to(fix.coords(), self.zoom, now),
            None => false,
        }
    }

    pub fn tick(&mut self, now: Instant) {
        self.viewport.advance(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Locality;
    use chrono::{TimeZone, Utc};

    fn fix(lat: f64, lon: f64, ms: i64) -> LocationFix {
        LocationFix {
            lat,
            lon,
            accuracy: 12.0,
            timestamp: Utc.timestamp_millis_opt(ms).unwrap(),
        }
    }

    fn ip_lookup(lat: f64, lon: f64) -> IpLookup {
        IpLookup {
            ip: Some("203.0.113.5".into()),
            location: Some(Locality {
                status: Some("success".into()),
                lat: Some(lat),
                lon: Some(lon),
                ..Default::default()
            }),
        }
    }

    fn tracker() -> Tracker {
        Tracker::new(15.0, Duration::from_secs(2), 20)
    }

    #[test]
    fn localhost_fallback_leaves_center_unset() {
        let mut t = tracker();
        let body = serde_json::to_value(crate::models::LocalhostFallback::default()).unwrap();
        let fallback: IpLookup = serde_json::from_value(body).unwrap();

        assert!(!t.on_ip_lookup(&fallback, Instant::now()));
        assert_eq!(t.source, CenterSource::Unset);
        assert_eq!(t.viewport.center, Coords::new(0.0, 0.0));
    }

    #[test]
    fn ip_lookup_seeds_unset_center() {
        let mut t = tracker();
        let now = Instant::now();
        assert!(t.on_ip_lookup(&ip_lookup(48.85, 2.35), now));
        assert_eq!(t.source, CenterSource::IpDerived(Coords::new(48.85, 2.35)));

        t.tick(now + Duration::from_secs(3));
        assert_eq!(t.viewport.center, Coords::new(48.85, 2.35));
        assert_eq!(t.viewport.zoom, 15.0);
    }

    #[test]
    fn late_ip_lookup_never_moves_device_center() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_fix(fix(35.0, 139.0, 1), now);
        t.tick(now + Duration::from_secs(3));

        assert!(!t.on_ip_lookup(&ip_lookup(48.85, 2.35), now + Duration::from_secs(3)));
        t.tick(now + Duration::from_secs(10));
        assert_eq!(t.viewport.center, Coords::new(35.0, 139.0));
        assert_eq!(t.source, CenterSource::DeviceDerived(Coords::new(35.0, 139.0)));
    }

    #[test]
    fn device_fix_overrides_ip_center() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_ip_lookup(&ip_lookup(48.85, 2.35), now);
        t.on_fix(fix(35.0, 139.0, 1), now);
        assert_eq!(t.source, CenterSource::DeviceDerived(Coords::new(35.0, 139.0)));
        assert_eq!(t.viewport.target(), Coords::new(35.0, 139.0));
    }

    #[test]
    fn second_ip_lookup_is_ignored() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_ip_lookup(&ip_lookup(48.85, 2.35), now);
        assert!(!t.on_ip_lookup(&ip_lookup(1.0, 1.0), now));
        assert_eq!(t.source, CenterSource::IpDerived(Coords::new(48.85, 2.35)));
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let mut t = tracker();
        let now = Instant::now();
        for i in 0..45 {
            t.on_fix(fix(i as f64, 0.5, i), now);
            assert!(t.history.len() <= 20);
        }
        let kept: Vec<i64> = t.history.iter().map(|f| f.epoch_millis()).collect();
        assert_eq!(kept, (25..45).collect::<Vec<_>>());
        assert_eq!(t.latest_fix.as_ref().map(|f| f.epoch_millis()), Some(44));
    }

    #[test]
    fn fly_to_animates_and_settles() {
        let mut vp = Viewport::new(15.0, Duration::from_secs(2));
        let now = Instant::now();
        vp.center = Coords::new(10.0, 10.0);
        assert!(vp.fly_to(Coords::new(20.0, 30.0), 15.0, now));

        vp.advance(now + Duration::from_secs(1));
        assert!(vp.is_animating());
        // Halfway through an ease-in-out is the midpoint
        assert!((vp.center.lat - 15.0).abs() < 1e-9);
        assert!((vp.center.lon - 20.0).abs() < 1e-9);

        vp.advance(now + Duration::from_secs(2));
        assert!(!vp.is_animating());
        assert_eq!(vp.center, Coords::new(20.0, 30.0));
    }

    #[test]
    fn sentinel_target_is_skipped() {
        let mut vp = Viewport::new(15.0, Duration::from_secs(2));
        assert!(!vp.fly_to(Coords::new(0.0, 0.0), 15.0, Instant::now()));
        assert!(!vp.is_animating());
    }

    #[test]
    fn position_error_clears_tracking_and_keeps_fix() {
        let mut t = tracker();
        let now = Instant::now();
        t.begin_tracking();
        t.on_fix(fix(1.0, 2.0, 5), now);
        t.on_position_error(&PositionError::Timeout);

        assert!(!t.is_tracking);
        assert_eq!(t.last_error, "Location error: Timeout expired");
        assert!(t.latest_fix.is_some());

        t.begin_tracking();
        assert!(t.is_tracking);
        assert!(t.last_error.is_empty());
    }

    #[test]
    fn unsupported_sets_static_message() {
        let mut t = tracker();
        t.unsupported(&PositionError::Unsupported);
        assert!(!t.is_tracking);
        assert_eq!(t.last_error, "Geolocation is not supported by this device");
    }

    #[test]
    fn zoom_is_clamped() {
        let mut t = tracker();
        t.zoom_by(10.0);
        assert_eq!(t.viewport.zoom, MAX_ZOOM);
        t.zoom_by(-100.0);
        assert_eq!(t.viewport.zoom, MIN_ZOOM);
    }
}
