//! Tidal constituents and the time basis of the design matrix.
//!
//! Each constituent contributes a `cos(ωt)` / `sin(ωt)` pair. Because every
//! observation is a *difference* between two epochs, the design entries are
//!
//! - `cos(ω t_s) − cos(ω t_m)`
//! - `sin(ω t_s) − sin(ω t_m)`
//!
//! with `t` measured in days since 2000-01-01T00:00:00.

use chrono::NaiveDateTime;

/// A named tidal constituent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constituent {
    pub name: &'static str,
    pub period_hours: f64,
}

/// Built-in constituent table (periods in solar hours).
const CONSTITUENTS: [Constituent; 12] = [
    Constituent { name: "M2", period_hours: 12.420_601_2 },
    Constituent { name: "S2", period_hours: 12.0 },
    Constituent { name: "N2", period_hours: 12.658_347_5 },
    Constituent { name: "K2", period_hours: 11.967_236_1 },
    Constituent { name: "K1", period_hours: 23.934_472_1 },
    Constituent { name: "O1", period_hours: 25.819_338_7 },
    Constituent { name: "P1", period_hours: 24.065_887_7 },
    Constituent { name: "Q1", period_hours: 26.868_350_0 },
    Constituent { name: "Mf", period_hours: 327.859_938_7 },
    Constituent { name: "Msf", period_hours: 354.367_066_6 },
    Constituent { name: "Mm", period_hours: 661.311_165_5 },
    Constituent { name: "Ssa", period_hours: 4_383.076_325 },
];

impl Constituent {
    /// Case-insensitive lookup in the built-in table.
    pub fn lookup(name: &str) -> Option<Constituent> {
        CONSTITUENTS
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
            .copied()
    }

    /// Angular frequency in radians per day.
    pub fn omega_per_day(&self) -> f64 {
        2.0 * std::f64::consts::PI * 24.0 / self.period_hours
    }

    /// `(cos ωt_s − cos ωt_m, sin ωt_s − sin ωt_m)` for a pair of epochs in days.
    pub fn differential(&self, t_master: f64, t_slave: f64) -> (f64, f64) {
        let w = self.omega_per_day();
        (
            (w * t_slave).cos() - (w * t_master).cos(),
            (w * t_slave).sin() - (w * t_master).sin(),
        )
    }
}

/// Unix milliseconds of the reference instant 2000-01-01T00:00:00.
pub const REFERENCE_EPOCH_MS: i64 = 946_684_800_000;

/// Fractional days since 2000-01-01T00:00:00.
pub fn days_since_reference(t: NaiveDateTime) -> f64 {
    (t.and_utc().timestamp_millis() - REFERENCE_EPOCH_MS) as f64 / 86_400_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn lookup_is_case_insensitive() {
        let m2 = Constituent::lookup("m2").unwrap();
        assert_eq!(m2.name, "M2");
        assert!(Constituent::lookup("Z0").is_none());
    }

    #[test]
    fn differential_vanishes_after_whole_periods() {
        let s2 = Constituent::lookup("S2").unwrap();
        // S2 has a 12h period, so one day later the phase is unchanged.
        let (c, s) = s2.differential(10.0, 11.0);
        assert!(c.abs() < 1e-9 && s.abs() < 1e-9, "got ({c}, {s})");
    }

    #[test]
    fn reference_epoch_is_day_zero() {
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(days_since_reference(epoch), 0.0);
        let later = NaiveDate::from_ymd_opt(2000, 1, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert!((days_since_reference(later) - 1.5).abs() < 1e-12);
    }
}
