//! Task descriptors.
//!
//! A task's callable is a tagged [`Op`] value rather than a closure. The
//! descriptor serializes structurally, so task identity can be hashed from
//! the operation's actual numeric content — no function-pointer comparison,
//! no source introspection. Changing a parameter or bumping a kernel formula
//! revision changes the identity and invalidates the persisted cache token.

use std::collections::BTreeMap;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::hash::Hash32;
use crate::kernel::{INDEX_NODATA, KernelSpec};
use crate::raster;
use crate::vector::{self, FarmAttribute, FarmVector};

/// Scheduler-visible lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// One schedulable unit of work. Targets are written only by `run`, and only
/// for the task that owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Map integer landcover codes through a lookup table.
    Reclassify {
        base: Utf8PathBuf,
        value_map: BTreeMap<i64, f64>,
        values_required: bool,
    },

    /// Apply a per-pixel kernel across aligned input bands.
    RasterCalc {
        bands: Vec<Utf8PathBuf>,
        kernel: KernelSpec,
    },

    /// Spatial convolution of a signal raster with a kernel raster.
    Convolve {
        signal: Utf8PathBuf,
        kernel: Utf8PathBuf,
        ignore_nodata: bool,
        mask_nodata: bool,
        normalize_kernel: bool,
    },

    /// Build an exponential decay kernel raster for one flight distance.
    DecayKernel {
        alpha_pixels: f64,
        pixel_size: f64,
        projection: String,
    },

    /// Build a linear decay kernel raster reaching zero at `max_dist_pixels`.
    LinearDecayKernel {
        max_dist_pixels: f64,
        pixel_size: f64,
        projection: String,
    },

    /// Per-code rarity of `cover` relative to the `base` landcover.
    RarityIndex {
        base: Utf8PathBuf,
        cover: Utf8PathBuf,
    },

    /// Copy of a base raster filled with a constant.
    BlankFromBase { base: Utf8PathBuf, fill: f32 },

    /// Rewrite the farm vector into the landcover projection.
    ReprojectVector {
        source: Utf8PathBuf,
        projection: String,
    },

    /// Burn a farm attribute onto a copy of a base raster.
    RasterizeAttribute {
        base: Utf8PathBuf,
        vector: Utf8PathBuf,
        attribute: FarmAttribute,
        filter_season: Option<String>,
    },

    /// Zonal aggregation of yield and abundance rasters per farm feature,
    /// producing the farm result vector. Expressed as a task with declared
    /// dependencies rather than a blocking read mid-registration, so the
    /// whole pipeline stays declarative.
    AggregateFarms {
        vector: Utf8PathBuf,
        total_yield: Utf8PathBuf,
        wild_yield: Utf8PathBuf,
        abundance_by_season: BTreeMap<String, Utf8PathBuf>,
    },
}

impl Op {
    /// Input artifact paths read during execution, in declaration order.
    pub fn inputs(&self) -> Vec<Utf8PathBuf> {
        match self {
            Op::Reclassify { base, .. } => vec![base.clone()],
            Op::RasterCalc { bands, .. } => bands.clone(),
            Op::Convolve { signal, kernel, .. } => vec![signal.clone(), kernel.clone()],
            Op::DecayKernel { .. } => vec![],
            Op::LinearDecayKernel { .. } => vec![],
            Op::RarityIndex { base, cover } => vec![base.clone(), cover.clone()],
            Op::BlankFromBase { base, .. } => vec![base.clone()],
            Op::ReprojectVector { source, .. } => vec![source.clone()],
            Op::RasterizeAttribute { base, vector, .. } => vec![base.clone(), vector.clone()],
            Op::AggregateFarms {
                vector,
                total_yield,
                wild_yield,
                abundance_by_season,
            } => {
                let mut inputs = vec![vector.clone(), total_yield.clone(), wild_yield.clone()];
                inputs.extend(abundance_by_season.values().cloned());
                inputs
            }
        }
    }

    /// Identity of the callable itself, covering the operation tag, its
    /// parameters, and (for kernels) the formula revision.
    pub fn identity(&self) -> Hash32 {
        let revision: u16 = match self {
            Op::RasterCalc { kernel, .. } => kernel.revision(),
            _ => 0,
        };
        Hash32::hash_value(&(self, revision))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Op::Reclassify { .. } => "reclassify",
            Op::RasterCalc { .. } => "raster_calc",
            Op::Convolve { .. } => "convolve_2d",
            Op::DecayKernel { .. } => "decay_kernel",
            Op::LinearDecayKernel { .. } => "linear_decay_kernel",
            Op::RarityIndex { .. } => "rarity_index",
            Op::BlankFromBase { .. } => "blank_from_base",
            Op::ReprojectVector { .. } => "reproject_vector",
            Op::RasterizeAttribute { .. } => "rasterize_attribute",
            Op::AggregateFarms { .. } => "aggregate_farms",
        }
    }

    /// Execute against the declared target outputs.
    pub fn run(&self, targets: &[Utf8PathBuf]) -> anyhow::Result<()> {
        let target = targets
            .first()
            .context("task registered without target outputs")?;

        match self {
            Op::Reclassify {
                base,
                value_map,
                values_required,
            } => {
                raster::reclassify(base, value_map, target, INDEX_NODATA, *values_required)?;
            }

            Op::RasterCalc { bands, kernel } => {
                raster::raster_calculator(bands, kernel, target, INDEX_NODATA)?;
            }

            Op::Convolve {
                signal,
                kernel,
                ignore_nodata,
                mask_nodata,
                normalize_kernel,
            } => {
                raster::convolve_2d(
                    signal,
                    kernel,
                    target,
                    *ignore_nodata,
                    *mask_nodata,
                    *normalize_kernel,
                )?;
            }

            Op::DecayKernel {
                alpha_pixels,
                pixel_size,
                projection,
            } => {
                raster::exponential_decay_kernel(*alpha_pixels, target, *pixel_size, projection)?;
            }

            Op::LinearDecayKernel {
                max_dist_pixels,
                pixel_size,
                projection,
            } => {
                raster::linear_decay_kernel(*max_dist_pixels, target, *pixel_size, projection)?;
            }

            Op::RarityIndex { base, cover } => {
                raster::rarity_index(base, cover, target)?;
            }

            Op::BlankFromBase { base, fill } => {
                raster::new_raster_from_base(base, target, *fill)?;
            }

            Op::ReprojectVector { source, projection } => {
                vector::reproject_vector(source, projection, target)?;
            }

            Op::RasterizeAttribute {
                base,
                vector,
                attribute,
                filter_season,
            } => {
                vector::rasterize_vector_attribute(
                    base,
                    vector,
                    attribute,
                    target,
                    filter_season.as_deref(),
                )?;
            }

            Op::AggregateFarms {
                vector,
                total_yield,
                wild_yield,
                abundance_by_season,
            } => {
                aggregate_farms(vector, total_yield, wild_yield, abundance_by_season, target)?;
            }
        }

        Ok(())
    }
}

/// Per-farm yield aggregation: zonal means of total yield, wild yield, and
/// the farm season's total pollinator abundance, combined with the farm's
/// pollinator dependence `nu`.
fn aggregate_farms(
    vector_path: &Utf8Path,
    total_yield: &Utf8Path,
    wild_yield: &Utf8Path,
    abundance_by_season: &BTreeMap<String, Utf8PathBuf>,
    target: &Utf8Path,
) -> anyhow::Result<()> {
    let mut farms = FarmVector::load(vector_path)?;

    let pyt_stats = vector::zonal_statistics(total_yield, vector_path)?;
    let pyw_stats = vector::zonal_statistics(wild_yield, vector_path)?;
    let mut abundance_stats = BTreeMap::new();
    for (season, path) in abundance_by_season {
        abundance_stats.insert(season.clone(), vector::zonal_statistics(path, vector_path)?);
    }

    for (idx, feature) in farms.features.iter_mut().enumerate() {
        let Some(pyt_mean) = pyt_stats[idx].mean() else {
            continue;
        };
        let pyw_mean = pyw_stats[idx].mean().unwrap_or(0.0);
        let p_abund = abundance_stats
            .get(&feature.season)
            .and_then(|stats| stats[idx].mean())
            .unwrap_or(0.0);

        let nu = feature.p_dep;
        feature.results = Some(vector::FarmResults {
            y_tot: 1.0 - nu * (1.0 - pyt_mean),
            y_wild: nu * pyw_mean,
            pdep_y_w: pyw_mean,
            p_abund,
        });
    }

    farms.save(target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_tracks_kernel_parameters() {
        let a = Op::RasterCalc {
            bands: vec!["a.bsr".into()],
            kernel: KernelSpec::MultiplyScalar { scalar: 0.25 },
        };
        let b = Op::RasterCalc {
            bands: vec!["a.bsr".into()],
            kernel: KernelSpec::MultiplyScalar { scalar: 0.5 },
        };
        assert_ne!(a.identity(), b.identity());
        assert_eq!(a.identity(), a.clone().identity());
    }

    #[test]
    fn identity_tracks_input_paths() {
        let a = Op::Reclassify {
            base: "lulc.bsr".into(),
            value_map: BTreeMap::from([(1, 0.5)]),
            values_required: true,
        };
        let b = Op::Reclassify {
            base: "other.bsr".into(),
            value_map: BTreeMap::from([(1, 0.5)]),
            values_required: true,
        };
        assert_ne!(a.identity(), b.identity());
    }
}
