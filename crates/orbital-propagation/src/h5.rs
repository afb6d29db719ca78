//! HDF5 bulk tensor for stage 2 output.
//!
//! The JSON artifact stays the canonical stage boundary; the HDF5 file
//! carries the same numbers as flat per-satellite datasets for cheap bulk
//! reads. Layout: one group per satellite id with `position` (3·n),
//! `velocity` (3·n) and `minutes_since_epoch` (n) datasets, plus a shared
//! `timestamps` dataset of UTC epoch seconds.

use std::collections::BTreeMap;
use std::path::Path;

use pipeline_core::error::{PipelineError, Result};

use crate::{SatelliteTrack, TimeGrid};

fn h5_err(e: hdf5::Error) -> PipelineError {
    PipelineError::Resource(format!("hdf5: {e}"))
}

pub fn write_bulk(
    path: &Path,
    tracks: &BTreeMap<String, SatelliteTrack>,
    grid: &TimeGrid,
) -> Result<()> {
    let file = hdf5::File::create(path).map_err(h5_err)?;

    let timestamps: Vec<i64> = grid.timestamps().map(|t| t.timestamp()).collect();
    file.new_dataset_builder()
        .with_data(&timestamps)
        .create("timestamps")
        .map_err(h5_err)?;

    for (id, track) in tracks {
        let group = file.create_group(id).map_err(h5_err)?;

        let mut position = Vec::with_capacity(track.time_series.len() * 3);
        let mut velocity = Vec::with_capacity(track.time_series.len() * 3);
        let mut minutes = Vec::with_capacity(track.time_series.len());
        for state in &track.time_series {
            position.extend_from_slice(&[state.x, state.y, state.z]);
            velocity.extend_from_slice(&[state.vx, state.vy, state.vz]);
            minutes.push(state.minutes_since_epoch);
        }

        group
            .new_dataset_builder()
            .with_data(&position)
            .create("position")
            .map_err(h5_err)?;
        group
            .new_dataset_builder()
            .with_data(&velocity)
            .create("velocity")
            .map_err(h5_err)?;
        group
            .new_dataset_builder()
            .with_data(&minutes)
            .create("minutes_since_epoch")
            .map_err(h5_err)?;
    }

    Ok(())
}

/// Flat per-satellite tensors, keyed by satellite id.
pub struct BulkTensors {
    pub timestamps: Vec<i64>,
    pub satellites: BTreeMap<String, SatelliteTensor>,
}

pub struct SatelliteTensor {
    pub position: Vec<f64>,
    pub velocity: Vec<f64>,
    pub minutes_since_epoch: Vec<f64>,
}

pub fn read_bulk(path: &Path) -> Result<BulkTensors> {
    let file = hdf5::File::open(path).map_err(h5_err)?;
    let timestamps = file
        .dataset("timestamps")
        .map_err(h5_err)?
        .read_raw::<i64>()
        .map_err(h5_err)?;

    let mut satellites = BTreeMap::new();
    for name in file.member_names().map_err(h5_err)? {
        if name == "timestamps" {
            continue;
        }
        let group = file.group(&name).map_err(h5_err)?;
        let tensor = SatelliteTensor {
            position: group
                .dataset("position")
                .map_err(h5_err)?
                .read_raw::<f64>()
                .map_err(h5_err)?,
            velocity: group
                .dataset("velocity")
                .map_err(h5_err)?
                .read_raw::<f64>()
                .map_err(h5_err)?,
            minutes_since_epoch: group
                .dataset("minutes_since_epoch")
                .map_err(h5_err)?
                .read_raw::<f64>()
                .map_err(h5_err)?,
        };
        satellites.insert(name, tensor);
    }

    Ok(BulkTensors {
        timestamps,
        satellites,
    })
}
