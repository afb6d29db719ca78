//! Candidate extraction and service-window summarization.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tle_ingest::Constellation;

use pipeline_core::MIN_SLANT_RANGE_KM;

use crate::{CandidateEntry, ServiceWindow, VisibilitySample};

/// The connectability rule: at or above the constellation elevation mask
/// and at least 200 km of slant range. No upper range bound; the link
/// margin decision belongs to signal analysis.
pub fn is_connectable(elevation_deg: f64, distance_km: f64, threshold_deg: f64) -> bool {
    elevation_deg >= threshold_deg && distance_km >= MIN_SLANT_RANGE_KM
}

/// Visibility series for one satellite out of the stage-3 payload entry.
/// The connectability flag is recomputed from the rule so a stale upstream
/// flag cannot leak through.
pub fn extract_samples(entry: &Value, constellation: Constellation) -> Vec<VisibilitySample> {
    let threshold = constellation.elevation_threshold_deg();
    entry
        .get("time_series")
        .and_then(Value::as_array)
        .map(|series| {
            series
                .iter()
                .filter_map(|state| {
                    let timestamp: DateTime<Utc> = state
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|t| t.with_timezone(&Utc))?;
                    let metrics = state.get("visibility_metrics")?;
                    let elevation_deg = metrics.get("elevation_deg")?.as_f64()?;
                    let azimuth_deg = metrics.get("azimuth_deg")?.as_f64()?;
                    let distance_km = metrics.get("distance_km")?.as_f64()?;
                    Some(VisibilitySample {
                        timestamp,
                        elevation_deg,
                        azimuth_deg,
                        distance_km,
                        is_connectable: is_connectable(elevation_deg, distance_km, threshold),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Service-window summary: total connectable minutes, first/last
/// connectable instants, and a continuity score defined as the longest
/// connectable run over the total connectable count.
pub fn service_window(samples: &[VisibilitySample], step_seconds: u64) -> ServiceWindow {
    let connectable: Vec<&VisibilitySample> =
        samples.iter().filter(|s| s.is_connectable).collect();
    let total = connectable.len();

    let mut longest_run = 0usize;
    let mut run = 0usize;
    for sample in samples {
        if sample.is_connectable {
            run += 1;
            longest_run = longest_run.max(run);
        } else {
            run = 0;
        }
    }

    ServiceWindow {
        total_connectable_minutes: total as f64 * step_seconds as f64 / 60.0,
        first_connectable: connectable.first().map(|s| s.timestamp),
        last_connectable: connectable.last().map(|s| s.timestamp),
        continuity_score: if total == 0 {
            0.0
        } else {
            longest_run as f64 / total as f64
        },
    }
}

/// A satellite is a candidate iff it is connectable at least once.
pub fn candidate_from_samples(
    satellite_id: &str,
    constellation: Constellation,
    samples: Vec<VisibilitySample>,
    step_seconds: u64,
) -> Option<CandidateEntry> {
    if !samples.iter().any(|s| s.is_connectable) {
        return None;
    }
    Some(CandidateEntry {
        satellite_id: satellite_id.to_string(),
        constellation: constellation.as_str().to_string(),
        service_window: service_window(&samples, step_seconds),
        visibility: samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn samples_from_elevations(elevations: &[f64], threshold: f64) -> Vec<VisibilitySample> {
        let start = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        elevations
            .iter()
            .enumerate()
            .map(|(i, &elevation_deg)| VisibilitySample {
                timestamp: start + chrono::Duration::seconds(30 * i as i64),
                elevation_deg,
                azimuth_deg: 180.0,
                distance_km: 900.0,
                is_connectable: is_connectable(elevation_deg, 900.0, threshold),
            })
            .collect()
    }

    #[test]
    fn test_constellation_filter_starlink_vs_oneweb() {
        let elevations = [4.9, 5.0, 5.1, 4.0];

        let starlink = samples_from_elevations(
            &elevations,
            Constellation::Starlink.elevation_threshold_deg(),
        );
        let flags: Vec<bool> = starlink.iter().map(|s| s.is_connectable).collect();
        assert_eq!(flags, vec![false, true, true, false]);

        let oneweb = samples_from_elevations(
            &elevations,
            Constellation::OneWeb.elevation_threshold_deg(),
        );
        assert!(oneweb.iter().all(|s| !s.is_connectable));
        assert!(candidate_from_samples("48000", Constellation::OneWeb, oneweb, 30).is_none());
    }

    #[test]
    fn test_range_floor_blocks_near_pass() {
        assert!(!is_connectable(45.0, 199.9, 5.0));
        assert!(is_connectable(45.0, 200.0, 5.0));
        // No upper bound on slant range.
        assert!(is_connectable(5.0, 25_000.0, 5.0));
    }

    #[test]
    fn test_service_window_summary() {
        let samples = samples_from_elevations(&[2.0, 8.0, 9.0, 3.0, 7.0], 5.0);
        let window = service_window(&samples, 30);
        assert!((window.total_connectable_minutes - 1.5).abs() < 1e-9);
        assert_eq!(window.first_connectable, Some(samples[1].timestamp));
        assert_eq!(window.last_connectable, Some(samples[4].timestamp));
        // Longest run 2 of 3 connectable samples.
        assert!((window.continuity_score - 2.0 / 3.0).abs() < 1e-9);
    }
}
