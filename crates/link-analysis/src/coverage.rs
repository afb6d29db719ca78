//! Coverage statistics over an optimized pool.
//!
//! Gap runs are maximal stretches of timestamps with the visible count
//! outside the target band, annotated with a severity triage; the NTPU
//! analysis aggregates raw candidate visibility across constellations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::set_cover::{coverage_rate, PoolTargets};
use crate::CandidateEntry;

/// Gap below which the NTPU zero-visibility analysis stays silent.
pub const NTPU_GAP_THRESHOLD_MIN: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSeverity {
    Minor,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageGap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_min: f64,
    pub min_visible: usize,
    pub severity: GapSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageStats {
    pub coverage_rate: f64,
    pub coverage_gaps: Vec<CoverageGap>,
    /// Longest in-band run, hours.
    pub continuous_coverage_hours: f64,
}

fn severity(min_visible: usize, duration_min: f64, targets: &PoolTargets) -> GapSeverity {
    if min_visible == 0 || duration_min > 10.0 {
        GapSeverity::Critical
    } else if min_visible < targets.target_min / 2 || duration_min > 5.0 {
        GapSeverity::Warning
    } else {
        GapSeverity::Minor
    }
}

/// Analyze a visible-count series against the target band.
pub fn analyze(
    counts: &[usize],
    timestamps: &[DateTime<Utc>],
    targets: &PoolTargets,
    step_seconds: u64,
) -> CoverageStats {
    let in_band =
        |v: usize| -> bool { v >= targets.target_min && v <= targets.target_max };
    let step_min = step_seconds as f64 / 60.0;

    let mut gaps = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &v) in counts.iter().enumerate() {
        if !in_band(v) {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take() {
            gaps.push(make_gap(start, i, counts, timestamps, step_min, targets));
        }
    }
    if let Some(start) = run_start {
        gaps.push(make_gap(start, counts.len(), counts, timestamps, step_min, targets));
    }

    let mut longest_in_band = 0usize;
    let mut run = 0usize;
    for &v in counts {
        if in_band(v) {
            run += 1;
            longest_in_band = longest_in_band.max(run);
        } else {
            run = 0;
        }
    }

    CoverageStats {
        coverage_rate: coverage_rate(counts, targets),
        coverage_gaps: gaps,
        continuous_coverage_hours: longest_in_band as f64 * step_min / 60.0,
    }
}

fn make_gap(
    start: usize,
    end: usize,
    counts: &[usize],
    timestamps: &[DateTime<Utc>],
    step_min: f64,
    targets: &PoolTargets,
) -> CoverageGap {
    let min_visible = counts[start..end].iter().copied().min().unwrap_or(0);
    let duration_min = (end - start) as f64 * step_min;
    let fallback = Utc::now();
    CoverageGap {
        start: timestamps.get(start).copied().unwrap_or(fallback),
        end: timestamps.get(end - 1).copied().unwrap_or(fallback),
        duration_min,
        min_visible,
        severity: severity(min_visible, duration_min, targets),
    }
}

/// Ground-station aggregate over raw candidates (not the optimized pool):
/// timestamps covered, visible-count statistics, and zero-visibility gaps
/// at or above the reporting threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpuAnalysis {
    pub timestamps_total: usize,
    pub timestamps_covered: usize,
    pub average_visible: f64,
    pub max_visible: usize,
    pub min_visible: usize,
    pub zero_visibility_gaps: Vec<CoverageGap>,
}

pub fn ntpu_analysis(
    candidates: &[&CandidateEntry],
    timestamps: &[DateTime<Utc>],
    step_seconds: u64,
) -> NtpuAnalysis {
    let n = timestamps.len();
    let mut counts = vec![0usize; n];
    for candidate in candidates {
        for (i, sample) in candidate.visibility.iter().take(n).enumerate() {
            if sample.is_connectable {
                counts[i] += 1;
            }
        }
    }

    let covered = counts.iter().filter(|&&v| v > 0).count();
    let average = if n == 0 {
        0.0
    } else {
        counts.iter().sum::<usize>() as f64 / n as f64
    };

    // Zero-visibility runs, reported only at the 5-minute threshold.
    let zero_targets = PoolTargets {
        target_min: 1,
        target_max: usize::MAX,
        max_pool_size: 0,
        required_coverage_rate: 0.0,
    };
    let gaps = analyze(&counts, timestamps, &zero_targets, step_seconds)
        .coverage_gaps
        .into_iter()
        .filter(|gap| gap.duration_min >= NTPU_GAP_THRESHOLD_MIN)
        .collect();

    NtpuAnalysis {
        timestamps_total: n,
        timestamps_covered: covered,
        average_visible: average,
        max_visible: counts.iter().copied().max().unwrap_or(0),
        min_visible: counts.iter().copied().min().unwrap_or(0),
        zero_visibility_gaps: gaps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn timestamps(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        (0..n).map(|i| start + Duration::seconds(30 * i as i64)).collect()
    }

    fn targets() -> PoolTargets {
        PoolTargets {
            target_min: 10,
            target_max: 15,
            max_pool_size: 15,
            required_coverage_rate: 0.95,
        }
    }

    #[test]
    fn test_single_critical_gap() {
        // 40 in-band, 5 empty, 55 in-band: rate 0.95, one critical gap.
        let mut counts = vec![10usize; 40];
        counts.extend(vec![0usize; 5]);
        counts.extend(vec![10usize; 55]);

        let stats = analyze(&counts, &timestamps(100), &targets(), 30);
        assert!((stats.coverage_rate - 0.95).abs() < 1e-12);
        assert_eq!(stats.coverage_gaps.len(), 1);

        let gap = &stats.coverage_gaps[0];
        assert_eq!(gap.min_visible, 0);
        assert!((gap.duration_min - 2.5).abs() < 1e-12);
        assert_eq!(gap.severity, GapSeverity::Critical);
    }

    #[test]
    fn test_severity_triage() {
        let t = targets();
        assert_eq!(severity(0, 1.0, &t), GapSeverity::Critical);
        assert_eq!(severity(3, 11.0, &t), GapSeverity::Critical);
        assert_eq!(severity(4, 1.0, &t), GapSeverity::Warning); // below min/2
        assert_eq!(severity(8, 6.0, &t), GapSeverity::Warning); // over 5 min
        assert_eq!(severity(8, 1.0, &t), GapSeverity::Minor);
    }

    #[test]
    fn test_continuous_coverage_hours() {
        let mut counts = vec![12usize; 120]; // one hour at 30 s
        counts.push(0);
        counts.extend(vec![12usize; 30]);
        let stats = analyze(&counts, &timestamps(counts.len()), &targets(), 30);
        assert!((stats.continuous_coverage_hours - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ntpu_gap_threshold() {
        use crate::visibility::service_window;
        use crate::VisibilitySample;

        let n = 40;
        let ts = timestamps(n);
        // Connectable everywhere except a 12-sample (6-minute) hole.
        let visibility: Vec<VisibilitySample> = ts
            .iter()
            .enumerate()
            .map(|(i, &timestamp)| VisibilitySample {
                timestamp,
                elevation_deg: 30.0,
                azimuth_deg: 10.0,
                distance_km: 700.0,
                is_connectable: !(10..22).contains(&i),
            })
            .collect();
        let candidate = CandidateEntry {
            satellite_id: "44713".to_string(),
            constellation: "starlink".to_string(),
            service_window: service_window(&visibility, 30),
            visibility,
        };

        let analysis = ntpu_analysis(&[&candidate], &ts, 30);
        assert_eq!(analysis.timestamps_covered, n - 12);
        assert_eq!(analysis.zero_visibility_gaps.len(), 1);
        assert!((analysis.zero_visibility_gaps[0].duration_min - 6.0).abs() < 1e-9);
    }
}
