//! Synthetic TLE generation.
//!
//! Produces well-formed element sets with valid checksums for fixtures,
//! demos, and the integration tests of downstream stages. Field layout
//! follows the NORAD two-line format column by column.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::catalog::tle_checksum;
use crate::{Constellation, TleRecord};

/// Builder for one synthetic element set.
#[derive(Debug, Clone)]
pub struct SyntheticTle {
    norad_id: u32,
    name: String,
    epoch: DateTime<Utc>,
    inclination_deg: f64,
    raan_deg: f64,
    eccentricity: f64,
    argument_of_perigee_deg: f64,
    mean_anomaly_deg: f64,
    mean_motion: f64,
}

impl SyntheticTle {
    /// Defaults describe a Starlink-class shell: 53° inclination,
    /// 15.3 rev/day (≈94 min period, ≈520 km altitude).
    pub fn new(norad_id: u32, name: &str) -> Self {
        Self {
            norad_id,
            name: name.to_string(),
            epoch: Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap(),
            inclination_deg: 53.0,
            raan_deg: 0.0,
            eccentricity: 0.001,
            argument_of_perigee_deg: 0.0,
            mean_anomaly_deg: 0.0,
            mean_motion: 15.3,
        }
    }

    pub fn epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn inclination_deg(mut self, v: f64) -> Self {
        self.inclination_deg = v;
        self
    }

    pub fn raan_deg(mut self, v: f64) -> Self {
        self.raan_deg = v;
        self
    }

    pub fn mean_anomaly_deg(mut self, v: f64) -> Self {
        self.mean_anomaly_deg = v;
        self
    }

    pub fn mean_motion(mut self, rev_per_day: f64) -> Self {
        self.mean_motion = rev_per_day;
        self
    }

    /// Render the two 69-character lines.
    pub fn build_lines(&self) -> (String, String) {
        let epoch_year = (self.epoch.year() % 100) as u8;
        let epoch_day = self.epoch.ordinal() as f64
            + self.epoch.hour() as f64 / 24.0
            + self.epoch.minute() as f64 / 1440.0
            + self.epoch.second() as f64 / 86_400.0
            + self.epoch.nanosecond() as f64 / 86_400.0e9;

        let line1 = format!(
            "1 {:05}U 00000A   {:02}{:012.8}  .00000000  00000-0  00000-0 0    1",
            self.norad_id, epoch_year, epoch_day
        );
        let ecc_field = (self.eccentricity * 10_000_000.0).round() as u64;
        let line2 = format!(
            "2 {:05} {:>8.4} {:>8.4} {:07} {:>8.4} {:>8.4} {:>11.8}{:05}",
            self.norad_id,
            self.inclination_deg,
            self.raan_deg,
            ecc_field,
            self.argument_of_perigee_deg,
            self.mean_anomaly_deg,
            self.mean_motion,
            1u32,
        );

        (
            format!("{line1}{}", tle_checksum(&line1)),
            format!("{line2}{}", tle_checksum(&line2)),
        )
    }

    /// Build the corresponding catalog record directly.
    pub fn build_record(&self) -> TleRecord {
        let (tle_line1, tle_line2) = self.build_lines();
        TleRecord {
            satellite_id: self.norad_id.to_string(),
            name: self.name.clone(),
            norad_id: self.norad_id,
            constellation: Constellation::from_name(&self.name),
            tle_line1,
            tle_line2,
            epoch_datetime: self.epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    #[test]
    fn test_lines_are_valid_tle() {
        let (line1, line2) = SyntheticTle::new(44713, "STARLINK-1007").build_lines();
        assert_eq!(line1.len(), 69);
        assert_eq!(line2.len(), 69);

        let record = catalog::parse_record("STARLINK-1007", &line1, &line2).unwrap();
        assert_eq!(record.norad_id, 44713);
        assert_eq!(record.constellation, Constellation::Starlink);
    }

    #[test]
    fn test_sgp4_accepts_synthetic_elements() {
        let (line1, line2) = SyntheticTle::new(48000, "ONEWEB-0001")
            .mean_motion(13.0)
            .inclination_deg(87.9)
            .build_lines();
        let elements = sgp4::Elements::from_tle(None, line1.as_bytes(), line2.as_bytes());
        assert!(elements.is_ok(), "{:?}", elements.err());
    }

    #[test]
    fn test_epoch_round_trips_through_lines() {
        let epoch = Utc.with_ymd_and_hms(2025, 10, 5, 0, 0, 0).unwrap();
        let tle = SyntheticTle::new(48000, "ONEWEB-0001").epoch(epoch);
        let (line1, _) = tle.build_lines();
        let parsed = catalog::parse_epoch(&line1).unwrap();
        assert!((parsed - epoch).num_milliseconds().abs() < 10);
    }
}
