//! Ku-band downlink budget.
//!
//! RSRP is the per-resource-block received power: satellite EIRP plus
//! receive gain, minus free-space path loss, atmospheric attenuation, and
//! miscellaneous losses. RSRQ and SINR follow from the configured noise
//! and interference floors.

use serde::Deserialize;

use crate::SignalSample;
use chrono::{DateTime, Utc};

/// Boltzmann noise density at 290 K, dBm/Hz.
const THERMAL_NOISE_DBM_HZ: f64 = -174.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkBudgetParams {
    /// Downlink carrier, GHz.
    pub frequency_ghz: f64,
    /// Satellite EIRP per resource block, dBm.
    pub eirp_per_rb_dbm: f64,
    /// Ground terminal receive gain, dB.
    pub rx_gain_db: f64,
    /// Pointing and polarization losses, dB.
    pub misc_loss_db: f64,
    /// Zenith atmospheric attenuation at the carrier, dB.
    pub zenith_attenuation_db: f64,
    /// Resource-block bandwidth, kHz.
    pub rb_bandwidth_khz: f64,
    /// Receiver noise figure, dB.
    pub noise_figure_db: f64,
    /// Co-channel interference floor, dBm per resource block.
    pub interference_floor_dbm: f64,
}

impl Default for LinkBudgetParams {
    fn default() -> Self {
        Self {
            frequency_ghz: 12.5,
            eirp_per_rb_dbm: 40.0,
            rx_gain_db: 35.0,
            misc_loss_db: 1.0,
            zenith_attenuation_db: 0.5,
            rb_bandwidth_khz: 180.0,
            noise_figure_db: 7.0,
            interference_floor_dbm: -110.0,
        }
    }
}

pub struct LinkBudget {
    params: LinkBudgetParams,
    noise_dbm: f64,
}

impl LinkBudget {
    pub fn new(params: LinkBudgetParams) -> Self {
        let noise_dbm = THERMAL_NOISE_DBM_HZ
            + 10.0 * (params.rb_bandwidth_khz * 1000.0).log10()
            + params.noise_figure_db;
        Self { params, noise_dbm }
    }

    /// Free-space path loss, dB, with range in km and carrier in GHz.
    pub fn fspl_db(&self, range_km: f64) -> f64 {
        92.45 + 20.0 * range_km.log10() + 20.0 * self.params.frequency_ghz.log10()
    }

    /// Atmospheric attenuation scaled by air mass (Kasten-Young).
    pub fn atmospheric_loss_db(&self, elevation_deg: f64) -> f64 {
        let zenith_deg = 90.0 - elevation_deg.clamp(0.0, 90.0);
        let zenith_rad = zenith_deg.to_radians();
        let air_mass =
            1.0 / (zenith_rad.cos() + 0.50572 * (96.07995 - zenith_deg).powf(-1.6364));
        self.params.zenith_attenuation_db * air_mass
    }

    /// Full measurement triplet at one connectable sample.
    pub fn measure(
        &self,
        timestamp: DateTime<Utc>,
        elevation_deg: f64,
        distance_km: f64,
    ) -> SignalSample {
        let fspl_db = self.fspl_db(distance_km);
        let atmospheric_loss_db = self.atmospheric_loss_db(elevation_deg);
        let rsrp_dbm = self.params.eirp_per_rb_dbm + self.params.rx_gain_db
            - fspl_db
            - atmospheric_loss_db
            - self.params.misc_loss_db;

        let rsrp_mw = dbm_to_mw(rsrp_dbm);
        let floor_mw = dbm_to_mw(self.noise_dbm) + dbm_to_mw(self.params.interference_floor_dbm);
        let sinr_db = 10.0 * (rsrp_mw / floor_mw).log10();
        let rsrq_db = 10.0 * (rsrp_mw / (rsrp_mw + floor_mw)).log10();

        SignalSample {
            timestamp,
            elevation_deg,
            distance_km,
            fspl_db,
            atmospheric_loss_db,
            rsrp_dbm,
            rsrq_db,
            sinr_db,
        }
    }
}

fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn budget() -> LinkBudget {
        LinkBudget::new(LinkBudgetParams::default())
    }

    #[test]
    fn test_fspl_at_reference_range() {
        // 1000 km at 12.5 GHz: 92.45 + 60 + 21.94 ≈ 174.4 dB.
        let fspl = budget().fspl_db(1000.0);
        assert!((fspl - 174.4).abs() < 0.1, "fspl {fspl}");
    }

    #[test]
    fn test_fspl_monotonic_in_range() {
        let b = budget();
        assert!(b.fspl_db(500.0) < b.fspl_db(1000.0));
        assert!(b.fspl_db(1000.0) < b.fspl_db(2000.0));
    }

    #[test]
    fn test_atmospheric_loss_grows_toward_horizon() {
        let b = budget();
        let zenith = b.atmospheric_loss_db(90.0);
        let low = b.atmospheric_loss_db(5.0);
        assert!((zenith - 0.5).abs() < 0.01);
        assert!(low > zenith * 5.0, "low-elevation loss {low}");
    }

    #[test]
    fn test_rsrp_in_reporting_range_for_leo_geometry() {
        let b = budget();
        let t = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        for (elevation, distance) in [(90.0, 550.0), (30.0, 1000.0), (5.0, 2300.0)] {
            let sample = b.measure(t, elevation, distance);
            assert!(
                (crate::RSRP_MIN_DBM..=crate::RSRP_MAX_DBM).contains(&sample.rsrp_dbm),
                "rsrp {} at {distance} km",
                sample.rsrp_dbm
            );
            assert!(sample.sinr_db < crate::SINR_MAX_DB);
            assert!(sample.rsrq_db < 0.0);
        }
    }
}
