//! Time scales: UTC → TAI → TT, and UT1 from the IERS offset.
//!
//! TAI−UTC comes from the embedded leap-second table (no leap second has
//! been scheduled since 2017-01-01, TAI−UTC = 37 s). TT = TAI + 32.184 s.

use chrono::{DateTime, Utc};

pub const JD_UNIX_EPOCH: f64 = 2_440_587.5;
pub const JD_J2000: f64 = 2_451_545.0;
pub const MJD_OFFSET: f64 = 2_400_000.5;
pub const TT_MINUS_TAI_S: f64 = 32.184;

/// (MJD of effectivity, TAI−UTC seconds). Covers the span the LEO
/// catalogs can realistically carry.
const LEAP_SECONDS: &[(f64, f64)] = &[
    (51_179.0, 32.0), // 1999-01-01
    (53_736.0, 33.0), // 2006-01-01
    (54_832.0, 34.0), // 2009-01-01
    (56_109.0, 35.0), // 2012-07-01
    (57_204.0, 36.0), // 2015-07-01
    (57_754.0, 37.0), // 2017-01-01
];

/// Julian date of a UTC instant, sub-second resolution.
pub fn jd_utc(t: DateTime<Utc>) -> f64 {
    let seconds = t.timestamp() as f64 + t.timestamp_subsec_nanos() as f64 / 1e9;
    seconds / 86_400.0 + JD_UNIX_EPOCH
}

pub fn mjd_utc(t: DateTime<Utc>) -> f64 {
    jd_utc(t) - MJD_OFFSET
}

/// TAI−UTC in seconds at the given MJD.
pub fn tai_minus_utc(mjd: f64) -> f64 {
    let mut offset = LEAP_SECONDS[0].1;
    for &(threshold, value) in LEAP_SECONDS {
        if mjd >= threshold {
            offset = value;
        }
    }
    offset
}

/// The Julian dates of one instant on the scales the rotation chain needs.
#[derive(Debug, Clone, Copy)]
pub struct TimeScales {
    pub jd_utc: f64,
    pub jd_ut1: f64,
    pub jd_tt: f64,
}

impl TimeScales {
    /// `dut1_s` is UT1−UTC from the IERS table.
    pub fn from_utc(t: DateTime<Utc>, dut1_s: f64) -> Self {
        let jd = jd_utc(t);
        let mjd = jd - MJD_OFFSET;
        let tai_utc = tai_minus_utc(mjd);
        Self {
            jd_utc: jd,
            jd_ut1: jd + dut1_s / 86_400.0,
            jd_tt: jd + (tai_utc + TT_MINUS_TAI_S) / 86_400.0,
        }
    }

    /// Julian centuries of TT since J2000.0.
    pub fn t_tt(&self) -> f64 {
        (self.jd_tt - JD_J2000) / 36_525.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_jd_at_j2000() {
        // J2000.0 = 2000-01-01 12:00 TT ≈ 11:58:55.816 UTC; the UTC noon
        // JD is the round value.
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((jd_utc(t) - JD_J2000).abs() < 1e-9);
    }

    #[test]
    fn test_leap_second_table() {
        assert_eq!(tai_minus_utc(57_753.0), 36.0);
        assert_eq!(tai_minus_utc(57_754.0), 37.0);
        assert_eq!(tai_minus_utc(60_953.0), 37.0); // 2025-10-05
    }

    #[test]
    fn test_tt_offset() {
        let t = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        let scales = TimeScales::from_utc(t, -0.048);
        // TT − UTC = 37 + 32.184 s.
        assert!(((scales.jd_tt - scales.jd_utc) * 86_400.0 - 69.184).abs() < 1e-6);
        assert!(((scales.jd_ut1 - scales.jd_utc) * 86_400.0 + 0.048).abs() < 1e-9);
    }

    #[test]
    fn test_mjd_2025_10_05() {
        let t = Utc.with_ymd_and_hms(2025, 10, 5, 0, 0, 0).unwrap();
        assert!((mjd_utc(t) - 60_953.0).abs() < 1e-9);
    }
}
