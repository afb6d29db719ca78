//! Content-addressed stage-3 cache.
//!
//! The cache key is a SHA-256 over the canonicalized tuple of sorted
//! satellite ids with their element lines, the time grid, and the stage
//! config. A hit short-circuits the whole transformation; a miss writes
//! one HDF5 file of per-satellite tensors plus a JSON sidecar index that
//! carries everything needed to rebuild the payload byte-for-byte.
//! Eviction is LRU above the size cap, restricted to entries older than
//! the minimum age; the entry written by the current run is never evicted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use pipeline_core::error::{PipelineError, Result};

use orbital_propagation::TimeGrid;

use crate::{EcefKm, GeodeticPosition, GeodeticState, VisibilityMetrics};

/// Values per (satellite, timestamp) row in the cached tensor:
/// lat, lon, alt_km, ecef x/y/z km, elevation, azimuth, distance_km.
const ROW_WIDTH: usize = 9;

fn h5_err(e: hdf5::Error) -> PipelineError {
    PipelineError::Resource(format!("stage3 cache hdf5: {e}"))
}

/// SHA-256 hex over the canonical JSON of the cache inputs. Satellite ids
/// are sorted, so insertion order cannot perturb the key.
pub fn cache_key(
    tles: &BTreeMap<String, (String, String)>,
    grid: &TimeGrid,
    config_echo: &Value,
) -> String {
    let canonical = json!({
        "satellites": tles
            .iter()
            .map(|(id, (l1, l2))| json!([id, l1, l2]))
            .collect::<Vec<_>>(),
        "grid": {
            "start": grid.start.to_rfc3339(),
            "step_seconds": grid.step_seconds,
            "point_count": grid.point_count,
        },
        "config": config_echo,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
pub struct Stage3Cache {
    dir: PathBuf,
    max_size_mb: u64,
    min_age_hours: u64,
}

impl Stage3Cache {
    pub fn new(cache_root: &Path, max_size_mb: u64, min_age_hours: u64) -> Self {
        Self {
            dir: cache_root.join("stage3"),
            max_size_mb,
            min_age_hours,
        }
    }

    fn h5_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("stage3_cache_{key}.h5"))
    }

    fn index_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("stage3_cache_{key}.json"))
    }

    /// Rebuild the stage-3 satellite map from a cached entry, or `None` on
    /// a miss. A corrupt entry is treated as a miss.
    pub fn lookup(&self, key: &str) -> Option<(BTreeMap<String, Value>, Value)> {
        let h5_path = self.h5_path(key);
        let index_path = self.index_path(key);
        if !h5_path.exists() || !index_path.exists() {
            return None;
        }
        match self.read_entry(&h5_path, &index_path) {
            Ok(hit) => {
                info!("stage 3 cache hit: {}", h5_path.display());
                Some(hit)
            }
            Err(e) => {
                warn!("unreadable cache entry {key}: {e}");
                None
            }
        }
    }

    fn read_entry(
        &self,
        h5_path: &Path,
        index_path: &Path,
    ) -> Result<(BTreeMap<String, Value>, Value)> {
        let index: Value = serde_json::from_str(&fs::read_to_string(index_path)?)?;
        let metadata = index
            .get("metadata")
            .cloned()
            .ok_or_else(|| PipelineError::Resource("cache index missing metadata".to_string()))?;
        let constellations: BTreeMap<String, String> = serde_json::from_value(
            index
                .get("satellites")
                .cloned()
                .unwrap_or(Value::Null),
        )?;
        let thresholds: BTreeMap<String, f64> = serde_json::from_value(
            index
                .get("thresholds")
                .cloned()
                .unwrap_or(Value::Null),
        )?;
        let timestamps: Vec<DateTime<Utc>> = serde_json::from_value(
            index
                .get("timestamps")
                .cloned()
                .unwrap_or(Value::Null),
        )?;

        let file = hdf5::File::open(h5_path).map_err(h5_err)?;
        let mut satellites = BTreeMap::new();
        for (id, constellation) in &constellations {
            let raw = file
                .dataset(id)
                .map_err(h5_err)?
                .read_raw::<f64>()
                .map_err(h5_err)?;
            if raw.len() != timestamps.len() * ROW_WIDTH {
                return Err(PipelineError::Resource(format!(
                    "cache tensor for {id} has wrong shape"
                )));
            }
            let threshold = thresholds.get(constellation).copied().unwrap_or(0.0);
            let series: Vec<GeodeticState> = raw
                .chunks_exact(ROW_WIDTH)
                .zip(timestamps.iter())
                .map(|(row, &timestamp)| GeodeticState {
                    timestamp,
                    position: GeodeticPosition {
                        lat: row[0],
                        lon: row[1],
                        alt_km: row[2],
                    },
                    ecef: EcefKm {
                        x_km: row[3],
                        y_km: row[4],
                        z_km: row[5],
                    },
                    visibility_metrics: VisibilityMetrics {
                        elevation_deg: row[6],
                        azimuth_deg: row[7],
                        distance_km: row[8],
                        is_connectable: row[6] >= threshold
                            && row[8] >= pipeline_core::MIN_SLANT_RANGE_KM,
                        threshold_applied: threshold,
                    },
                })
                .collect();
            satellites.insert(
                id.clone(),
                json!({
                    "constellation": constellation,
                    "time_series": series,
                }),
            );
        }

        Ok((satellites, metadata))
    }

    /// Persist a freshly computed result, then evict. Returns the HDF5
    /// path, which is protected from this run's eviction sweep.
    pub fn store(
        &self,
        key: &str,
        satellites: &BTreeMap<String, Value>,
        metadata: &Value,
        grid: &TimeGrid,
        thresholds: &BTreeMap<String, f64>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let h5_path = self.h5_path(key);

        let file = hdf5::File::create(&h5_path).map_err(h5_err)?;
        let mut constellations: BTreeMap<String, String> = BTreeMap::new();
        for (id, entry) in satellites {
            let constellation = entry
                .get("constellation")
                .and_then(Value::as_str)
                .unwrap_or("other")
                .to_string();
            let series: Vec<GeodeticState> =
                serde_json::from_value(entry.get("time_series").cloned().unwrap_or(Value::Null))?;

            let mut rows = Vec::with_capacity(series.len() * ROW_WIDTH);
            for state in &series {
                rows.extend_from_slice(&[
                    state.position.lat,
                    state.position.lon,
                    state.position.alt_km,
                    state.ecef.x_km,
                    state.ecef.y_km,
                    state.ecef.z_km,
                    state.visibility_metrics.elevation_deg,
                    state.visibility_metrics.azimuth_deg,
                    state.visibility_metrics.distance_km,
                ]);
            }
            file.new_dataset_builder()
                .with_data(&rows)
                .create(id.as_str())
                .map_err(h5_err)?;
            constellations.insert(id.clone(), constellation);
        }
        drop(file);

        let timestamps: Vec<String> = grid.timestamps().map(|t| t.to_rfc3339()).collect();
        let index = json!({
            "key": key,
            "created": Utc::now().to_rfc3339(),
            "satellites": constellations,
            "thresholds": thresholds,
            "timestamps": timestamps,
            "metadata": metadata,
        });
        fs::write(self.index_path(key), serde_json::to_string_pretty(&index)?)?;

        self.evict(&h5_path)?;
        Ok(h5_path)
    }

    /// LRU eviction above the size cap: oldest-modified entries go first,
    /// but only once they are older than the minimum age, and never the
    /// protected (just-written) entry.
    pub fn evict(&self, protect: &Path) -> Result<usize> {
        if !self.dir.is_dir() {
            return Ok(0);
        }
        let mut entries: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut total_bytes = 0u64;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "h5").unwrap_or(false) {
                let meta = fs::metadata(&path)?;
                let modified = meta.modified()?;
                total_bytes += meta.len();
                entries.push((path, meta.len(), modified));
            }
        }

        let cap_bytes = self.max_size_mb * 1024 * 1024;
        if total_bytes <= cap_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|(_, _, modified)| *modified);
        let min_age = std::time::Duration::from_secs(self.min_age_hours * 3600);
        let now = std::time::SystemTime::now();
        let mut evicted = 0;

        for (path, size, modified) in entries {
            if total_bytes <= cap_bytes {
                break;
            }
            if path == protect {
                continue;
            }
            let age = now.duration_since(modified).unwrap_or_default();
            if age < min_age {
                continue;
            }
            debug!("evicting cache entry {}", path.display());
            fs::remove_file(&path)?;
            let _ = fs::remove_file(path.with_extension("json"));
            total_bytes = total_bytes.saturating_sub(size);
            evicted += 1;
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_grid() -> TimeGrid {
        TimeGrid::new(Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap(), 30, 3)
    }

    fn sample_satellites(grid: &TimeGrid) -> BTreeMap<String, Value> {
        let series: Vec<GeodeticState> = grid
            .timestamps()
            .enumerate()
            .map(|(i, timestamp)| GeodeticState {
                timestamp,
                position: GeodeticPosition {
                    lat: 25.0 + i as f64,
                    lon: 121.0,
                    alt_km: 550.0,
                },
                ecef: EcefKm {
                    x_km: -3000.0,
                    y_km: 5000.0,
                    z_km: 2500.0,
                },
                visibility_metrics: VisibilityMetrics {
                    elevation_deg: 10.0 * i as f64,
                    azimuth_deg: 180.0,
                    distance_km: 800.0,
                    is_connectable: i > 0,
                    threshold_applied: 5.0,
                },
            })
            .collect();
        let mut map = BTreeMap::new();
        map.insert(
            "44713".to_string(),
            json!({"constellation": "starlink", "time_series": series}),
        );
        map
    }

    fn thresholds() -> BTreeMap<String, f64> {
        BTreeMap::from([("starlink".to_string(), 5.0), ("oneweb".to_string(), 10.0)])
    }

    #[test]
    fn test_key_deterministic_and_input_sensitive() {
        let grid = sample_grid();
        let mut tles = BTreeMap::new();
        tles.insert("44713".to_string(), ("l1".to_string(), "l2".to_string()));
        let config = json!({"nutation_model": "IAU2000A"});

        let k1 = cache_key(&tles, &grid, &config);
        let k2 = cache_key(&tles, &grid, &config);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);

        let other_grid = TimeGrid::new(grid.start, 60, 3);
        assert_ne!(k1, cache_key(&tles, &other_grid, &config));
    }

    #[test]
    fn test_store_then_lookup_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Stage3Cache::new(tmp.path(), 500, 24);
        let grid = sample_grid();
        let satellites = sample_satellites(&grid);
        let metadata = json!({"coordinate_system": "WGS84"});

        let key = "a".repeat(64);
        cache
            .store(&key, &satellites, &metadata, &grid, &thresholds())
            .unwrap();

        let (restored, meta) = cache.lookup(&key).unwrap();
        assert_eq!(meta, metadata);
        let original: Vec<GeodeticState> =
            serde_json::from_value(satellites["44713"]["time_series"].clone()).unwrap();
        let rebuilt: Vec<GeodeticState> =
            serde_json::from_value(restored["44713"]["time_series"].clone()).unwrap();
        assert_eq!(original.len(), rebuilt.len());
        for (a, b) in original.iter().zip(&rebuilt) {
            assert_eq!(a.timestamp, b.timestamp);
            assert!((a.position.lat - b.position.lat).abs() < 1e-12);
            assert_eq!(
                a.visibility_metrics.is_connectable,
                b.visibility_metrics.is_connectable
            );
        }
    }

    #[test]
    fn test_eviction_protects_fresh_entry() {
        let tmp = tempfile::tempdir().unwrap();
        // Zero cap forces eviction pressure; zero min-age allows it.
        let cache = Stage3Cache::new(tmp.path(), 0, 0);
        let grid = sample_grid();
        let satellites = sample_satellites(&grid);
        let metadata = json!({});

        let old_key = "b".repeat(64);
        let protected = cache
            .store(&old_key, &satellites, &metadata, &grid, &thresholds())
            .unwrap();
        // Storing a second entry must evict the older one, not itself.
        let new_key = "c".repeat(64);
        let fresh = cache
            .store(&new_key, &satellites, &metadata, &grid, &thresholds())
            .unwrap();

        assert!(fresh.exists());
        assert!(!protected.exists());
    }

    #[test]
    fn test_min_age_blocks_eviction() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Stage3Cache::new(tmp.path(), 0, 24);
        let grid = sample_grid();
        let satellites = sample_satellites(&grid);

        let k1 = "d".repeat(64);
        let k2 = "e".repeat(64);
        let first = cache
            .store(&k1, &satellites, &json!({}), &grid, &thresholds())
            .unwrap();
        cache
            .store(&k2, &satellites, &json!({}), &grid, &thresholds())
            .unwrap();

        // Young entries survive even over the cap.
        assert!(first.exists());
    }
}
