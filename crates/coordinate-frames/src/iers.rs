//! IERS Earth-orientation parameters.
//!
//! Polar motion (xp, yp) and UT1−UTC come from IERS Bulletin A
//! (`finals2000A` format). The table is fetched once per run: on-disk
//! cache first, optional download second, and an embedded 2024–2026
//! monthly table as the offline fallback. Lookups interpolate linearly
//! between tabulated days and are O(log n) against the sorted table.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{FrameError, Result};

pub const DEFAULT_BULLETIN_URL: &str = "https://datacenter.iers.org/data/9/finals2000A.all";
pub const CACHE_FILE_NAME: &str = "finals2000A.daily";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IersEntry {
    pub mjd: f64,
    pub xp_arcsec: f64,
    pub yp_arcsec: f64,
    pub ut1_utc_s: f64,
}

/// Where the active table came from, recorded in stage metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IersSource {
    CacheFile,
    Download,
    Embedded,
}

impl IersSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFile => "cache",
            Self::Download => "download",
            Self::Embedded => "embedded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IersTable {
    entries: Vec<IersEntry>,
    pub source: IersSource,
}

/// Embedded monthly values spanning 2024-01 through 2026-07
/// (MJD, xp ″, yp ″, UT1−UTC s).
#[rustfmt::skip]
const EMBEDDED: &[(f64, f64, f64, f64)] = &[
    (60310.0, 0.034, 0.253,  0.0145),
    (60340.0, 0.012, 0.286,  0.0082),
    (60370.0, 0.010, 0.331,  0.0021),
    (60400.0, 0.023, 0.370, -0.0036),
    (60430.0, 0.055, 0.398, -0.0090),
    (60460.0, 0.098, 0.410, -0.0132),
    (60490.0, 0.145, 0.404, -0.0168),
    (60520.0, 0.185, 0.381, -0.0193),
    (60550.0, 0.213, 0.345, -0.0214),
    (60580.0, 0.224, 0.302, -0.0236),
    (60610.0, 0.217, 0.260, -0.0260),
    (60640.0, 0.195, 0.225, -0.0288),
    (60670.0, 0.162, 0.203, -0.0316),
    (60700.0, 0.124, 0.196, -0.0342),
    (60730.0, 0.089, 0.205, -0.0364),
    (60760.0, 0.063, 0.228, -0.0382),
    (60790.0, 0.050, 0.261, -0.0396),
    (60820.0, 0.053, 0.298, -0.0408),
    (60850.0, 0.071, 0.333, -0.0420),
    (60880.0, 0.100, 0.358, -0.0433),
    (60910.0, 0.127, 0.369, -0.0447),
    (60940.0, 0.150, 0.370, -0.0460),
    (60970.0, 0.160, 0.380, -0.0500),
    (61000.0, 0.158, 0.372, -0.0536),
    (61030.0, 0.140, 0.350, -0.0568),
    (61060.0, 0.115, 0.322, -0.0596),
    (61090.0, 0.088, 0.295, -0.0620),
    (61120.0, 0.064, 0.274, -0.0642),
    (61150.0, 0.048, 0.263, -0.0663),
    (61180.0, 0.043, 0.263, -0.0684),
    (61210.0, 0.049, 0.274, -0.0706),
];

impl IersTable {
    pub fn embedded() -> Self {
        let entries = EMBEDDED
            .iter()
            .map(|&(mjd, xp_arcsec, yp_arcsec, ut1_utc_s)| IersEntry {
                mjd,
                xp_arcsec,
                yp_arcsec,
                ut1_utc_s,
            })
            .collect();
        Self {
            entries,
            source: IersSource::Embedded,
        }
    }

    /// Parse the fixed-column `finals2000A` text format. Lines without
    /// Bulletin-A values (the far-future tail) are skipped.
    pub fn parse_finals2000a(text: &str, source: IersSource) -> Result<Self> {
        let mut entries = Vec::new();
        for line in text.lines() {
            let field = |range: std::ops::Range<usize>| {
                line.get(range)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .and_then(|s| s.parse::<f64>().ok())
            };
            let (Some(mjd), Some(xp), Some(yp), Some(dut1)) =
                (field(7..15), field(18..27), field(37..46), field(58..68))
            else {
                continue;
            };
            entries.push(IersEntry {
                mjd,
                xp_arcsec: xp,
                yp_arcsec: yp,
                ut1_utc_s: dut1,
            });
        }
        if entries.is_empty() {
            return Err(FrameError::Iers("no usable rows in bulletin".to_string()));
        }
        entries.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));
        Ok(Self { entries, source })
    }

    /// Resolve the table for a run: cached file, then (optionally) a fresh
    /// download persisted into the cache, then the embedded fallback when
    /// it covers the window. Fails with a resource-class error only when
    /// nothing covers [mjd_start, mjd_end].
    pub fn load(
        cache_dir: &Path,
        auto_download: bool,
        url: &str,
        mjd_start: f64,
        mjd_end: f64,
    ) -> Result<Self> {
        let cache_path = cache_dir.join(CACHE_FILE_NAME);

        if let Some(table) = Self::from_cache(&cache_path) {
            if table.covers(mjd_start, mjd_end) {
                info!("IERS table loaded from {}", cache_path.display());
                return Ok(table);
            }
            warn!("cached IERS table does not cover the window");
        }

        if auto_download {
            match Self::download(url, &cache_path) {
                Ok(table) if table.covers(mjd_start, mjd_end) => {
                    info!("IERS bulletin downloaded from {url}");
                    return Ok(table);
                }
                Ok(_) => warn!("downloaded IERS table does not cover the window"),
                Err(e) => warn!("IERS download failed: {e}"),
            }
        }

        let embedded = Self::embedded();
        if embedded.covers(mjd_start, mjd_end) {
            warn!("falling back to embedded IERS table");
            return Ok(embedded);
        }

        Err(FrameError::Iers(format!(
            "no IERS data covers MJD {mjd_start:.1}..{mjd_end:.1}"
        )))
    }

    fn from_cache(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        Self::parse_finals2000a(&text, IersSource::CacheFile).ok()
    }

    fn download(url: &str, cache_path: &Path) -> Result<Self> {
        let text = reqwest::blocking::get(url)
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| FrameError::Iers(format!("fetch {url}: {e}")))?;
        let table = Self::parse_finals2000a(&text, IersSource::Download)?;
        if let Some(parent) = cache_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(cache_path, &text) {
            warn!("could not cache IERS bulletin: {e}");
        }
        Ok(table)
    }

    pub fn covers(&self, mjd_start: f64, mjd_end: f64) -> bool {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => first.mjd <= mjd_start && last.mjd >= mjd_end,
            _ => false,
        }
    }

    /// Linear interpolation between the bracketing tabulated days.
    pub fn lookup(&self, mjd: f64) -> Result<IersEntry> {
        if self.entries.is_empty() {
            return Err(FrameError::Iers("empty table".to_string()));
        }
        let idx = self
            .entries
            .partition_point(|e| e.mjd <= mjd);
        if idx == 0 || idx == self.entries.len() {
            return Err(FrameError::Iers(format!("MJD {mjd:.2} outside table")));
        }
        let a = self.entries[idx - 1];
        let b = self.entries[idx];
        let f = (mjd - a.mjd) / (b.mjd - a.mjd);
        Ok(IersEntry {
            mjd,
            xp_arcsec: a.xp_arcsec + f * (b.xp_arcsec - a.xp_arcsec),
            yp_arcsec: a.yp_arcsec + f * (b.yp_arcsec - a.yp_arcsec),
            ut1_utc_s: a.ut1_utc_s + f * (b.ut1_utc_s - a.ut1_utc_s),
        })
    }

    pub fn cache_path(cache_dir: &Path) -> PathBuf {
        cache_dir.join(CACHE_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_covers_october_2025() {
        let table = IersTable::embedded();
        let entry = table.lookup(60_953.0).unwrap(); // 2025-10-05
        assert!((entry.xp_arcsec - 0.154).abs() < 0.01);
        assert!((entry.yp_arcsec - 0.374).abs() < 0.01);
        assert!((entry.ut1_utc_s + 0.048).abs() < 0.005);
    }

    #[test]
    fn test_lookup_outside_range_errors() {
        let table = IersTable::embedded();
        assert!(table.lookup(10_000.0).is_err());
        assert!(table.lookup(99_999.0).is_err());
    }

    #[test]
    fn test_parse_finals_columns() {
        // Two rows in finals2000A fixed-column layout.
        let text = concat!(
            "2510 5 60953.00 I  0.150000 0.000050  0.370000 0.000050  I-0.0480000 0.0000100\n",
            "2510 6 60954.00 I  0.151000 0.000050  0.371000 0.000050  I-0.0482000 0.0000100\n",
            "2512 1 61010.00\n", // predicted tail without values
        );
        let table = IersTable::parse_finals2000a(text, IersSource::CacheFile).unwrap();
        let entry = table.lookup(60_953.5).unwrap();
        assert!((entry.xp_arcsec - 0.1505).abs() < 1e-9);
        assert!((entry.ut1_utc_s + 0.0481).abs() < 1e-9);
    }

    #[test]
    fn test_load_falls_back_to_embedded() {
        let tmp = tempfile::tempdir().unwrap();
        let table = IersTable::load(tmp.path(), false, DEFAULT_BULLETIN_URL, 60_900.0, 60_960.0)
            .unwrap();
        assert_eq!(table.source, IersSource::Embedded);
    }
}
