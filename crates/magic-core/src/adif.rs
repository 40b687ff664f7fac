//! Aircraft Data Interface snapshot.
//!
//! The policy engine consumes flight phase, weight-on-wheels and position
//! from here. Position is fed by the extended parameter reports on the
//! south side; flight phase and altitude also arrive in MCCR requests.
//! When the feed is degraded or absent, coverage and WoW checks are
//! skipped rather than guessed.

use std::sync::RwLock;

/// One consistent view of the aircraft data.
#[derive(Debug, Clone, Default)]
pub struct AdifSnapshot {
    pub flight_phase: Option<String>,
    pub on_ground: Option<bool>,
    pub latitude_deg: Option<f64>,
    pub longitude_deg: Option<f64>,
    pub altitude_m: Option<f64>,
    /// Degraded mode: inputs present but untrustworthy.
    pub degraded: bool,
}

impl AdifSnapshot {
    /// Position usable for coverage checks.
    pub fn has_position(&self) -> bool {
        !self.degraded && self.latitude_deg.is_some() && self.longitude_deg.is_some()
    }
}

/// Shared, last-writer-wins aircraft state.
#[derive(Debug, Default)]
pub struct AdifState {
    inner: RwLock<AdifSnapshot>,
}

impl AdifState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AdifSnapshot {
        self.inner.read().expect("adif lock").clone()
    }

    pub fn update_position(&self, latitude_deg: f64, longitude_deg: f64, altitude_m: f64) {
        let mut inner = self.inner.write().expect("adif lock");
        inner.latitude_deg = Some(latitude_deg);
        inner.longitude_deg = Some(longitude_deg);
        inner.altitude_m = Some(altitude_m);
    }

    pub fn update_flight(&self, phase: Option<&str>, altitude_m: Option<f64>) {
        let mut inner = self.inner.write().expect("adif lock");
        if let Some(phase) = phase {
            inner.flight_phase = Some(phase.to_owned());
            // Weight-on-wheels follows the phase unless a direct WoW input
            // has set it.
            inner.on_ground = Some(matches!(
                phase.to_ascii_uppercase().as_str(),
                "GROUND" | "TAXI"
            ));
        }
        if let Some(alt) = altitude_m {
            inner.altitude_m = Some(alt);
        }
    }

    pub fn set_on_ground(&self, on_ground: bool) {
        self.inner.write().expect("adif lock").on_ground = Some(on_ground);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.inner.write().expect("adif lock").degraded = degraded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_requires_fix_and_health() {
        let adif = AdifState::new();
        assert!(!adif.snapshot().has_position());

        adif.update_position(48.85, 2.35, 10_000.0);
        assert!(adif.snapshot().has_position());

        adif.set_degraded(true);
        assert!(!adif.snapshot().has_position());
    }

    #[test]
    fn flight_phase_drives_wow() {
        let adif = AdifState::new();
        adif.update_flight(Some("TAXI"), None);
        assert_eq!(adif.snapshot().on_ground, Some(true));
        adif.update_flight(Some("CRUISE"), Some(10_668.0));
        let snap = adif.snapshot();
        assert_eq!(snap.on_ground, Some(false));
        assert_eq!(snap.altitude_m, Some(10_668.0));
    }
}
