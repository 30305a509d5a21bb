//! The habitat suitability model.
//!
//! A thin second pipeline over the same task graph: each biophysical
//! criterion raster is mapped through a piecewise-linear suitability range,
//! the per-criterion rasters are combined by geometric mean, and the score is
//! optionally thresholded into a 0/1 mask.

use std::fs;

use camino::Utf8PathBuf;
use console::style;
use tracing::info;

use crate::artifact::{ArtifactKey, ArtifactStore};
use crate::error::{ConfigError, GeoError, ModelError};
use crate::graph::TaskGraph;
use crate::kernel::KernelSpec;
use crate::pipeline::RunSummary;
use crate::raster;
use crate::task::Op;

/// One input raster with its suitability range.
#[derive(Debug, Clone)]
pub struct HabitatCriterion {
    /// Used in the per-criterion artifact name.
    pub name: String,
    pub raster_path: Utf8PathBuf,
    /// Non-decreasing `(t0, o0, o1, t1)`: suitability is 0 outside
    /// `(t0, t1)`, 1 inside `[o0, o1]`, linear in between.
    pub suitability_range: [f64; 4],
}

#[derive(Debug, Clone)]
pub struct HabitatSuitabilityConfig {
    pub workspace_dir: Utf8PathBuf,
    pub results_suffix: String,
    pub criteria: Vec<HabitatCriterion>,
    /// When set, also emit a 0/1 mask of pixels at or above the threshold.
    pub mask_threshold: Option<f64>,
    pub n_workers: usize,
}

/// Run the habitat suitability model end to end.
pub fn execute(config: &HabitatSuitabilityConfig) -> Result<RunSummary, ModelError> {
    eprintln!(
        "Running {} model {}.",
        style("habitat suitability").green(),
        style(&config.workspace_dir).blue()
    );

    let store = ArtifactStore::new(&config.workspace_dir, &config.results_suffix);
    fs::create_dir_all(store.intermediate_dir().as_std_path())?;

    if config.criteria.is_empty() {
        return Err(ModelError::Geo(GeoError::EmptyBandList));
    }
    for criterion in &config.criteria {
        if !criterion.raster_path.exists() {
            return Err(ConfigError::MissingFile(criterion.raster_path.clone()).into());
        }
    }

    // The native backend has no resampling, so criterion grids must align.
    let first = raster::get_raster_metadata(&config.criteria[0].raster_path)?;
    for criterion in &config.criteria[1..] {
        let meta = raster::get_raster_metadata(&criterion.raster_path)?;
        if (meta.rows, meta.cols) != (first.rows, first.cols) {
            return Err(ModelError::Geo(GeoError::ShapeMismatch(
                first.rows, first.cols, meta.rows, meta.cols,
            )));
        }
    }

    info!(criteria = config.criteria.len(), "wiring suitability graph");
    let graph = TaskGraph::new(&store.token_dir(), config.n_workers)?;

    let mut suitability_bands = Vec::new();
    let mut suitability_tasks = Vec::new();
    for criterion in &config.criteria {
        let target = store.path(&ArtifactKey::CriterionSuitability {
            criterion: criterion.name.clone(),
        });
        let handle = graph.add_task(
            Op::RasterCalc {
                bands: vec![criterion.raster_path.clone()],
                kernel: KernelSpec::SuitabilityRange {
                    range: criterion.suitability_range,
                },
            },
            vec![target.clone()],
            &[],
        )?;
        suitability_bands.push(target);
        suitability_tasks.push(handle);
    }

    let score = store.path(&ArtifactKey::SuitabilityScore);
    let score_task = graph.add_task(
        Op::RasterCalc {
            bands: suitability_bands,
            kernel: KernelSpec::GeometricMean,
        },
        vec![score.clone()],
        &suitability_tasks,
    )?;

    if let Some(limit) = config.mask_threshold {
        let mask = store.path(&ArtifactKey::SuitabilityMask);
        graph.add_task(
            Op::RasterCalc {
                bands: vec![score],
                kernel: KernelSpec::Threshold { limit },
            },
            vec![mask],
            &[score_task],
        )?;
    }

    graph.close();
    graph.join()?;

    Ok(RunSummary {
        workspace: store.workspace().to_owned(),
        diagnostics: graph.diagnostics(),
        farm_results: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::INDEX_NODATA;
    use crate::raster::{Raster, test_raster};
    use camino::Utf8PathBuf;
    use ndarray::array;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn scores_and_masks_criteria() {
        let (_guard, dir) = scratch();
        let depth_path = dir.join("depth.bsr");
        let salinity_path = dir.join("salinity.bsr");
        test_raster(array![[-30.0f32, -5.0], [INDEX_NODATA, -20.0]])
            .save(&depth_path)
            .unwrap();
        test_raster(array![[30.0f32, 30.0], [30.0, 10.0]])
            .save(&salinity_path)
            .unwrap();

        let config = HabitatSuitabilityConfig {
            workspace_dir: dir.join("ws"),
            results_suffix: String::new(),
            criteria: vec![
                HabitatCriterion {
                    name: "depth".into(),
                    raster_path: depth_path,
                    suitability_range: [-50.0, -30.0, -10.0, 0.0],
                },
                HabitatCriterion {
                    name: "salinity".into(),
                    raster_path: salinity_path,
                    suitability_range: [20.0, 25.0, 35.0, 40.0],
                },
            ],
            mask_threshold: Some(0.5),
            n_workers: 0,
        };

        let summary = execute(&config).unwrap();
        assert_eq!(summary.diagnostics.executed, 4);

        let score = Raster::load(&summary.workspace.join("habitat_suitability.bsr")).unwrap();
        // both criteria optimal at (0, 0)
        assert!((score.data[(0, 0)] - 1.0).abs() < 1e-6);
        // depth ramps down toward 0 at (0, 1)
        assert!(score.data[(0, 1)] < 1.0);
        assert_eq!(score.data[(1, 0)], INDEX_NODATA);

        let mask = Raster::load(&summary.workspace.join("habitat_suitability_mask.bsr")).unwrap();
        assert_eq!(mask.data[(0, 0)], 1.0);
        assert_eq!(mask.data[(1, 0)], INDEX_NODATA);
    }

    #[test]
    fn mismatched_grids_are_rejected_up_front() {
        let (_guard, dir) = scratch();
        let a = dir.join("a.bsr");
        let b = dir.join("b.bsr");
        test_raster(array![[1.0f32, 2.0]]).save(&a).unwrap();
        test_raster(array![[1.0f32]]).save(&b).unwrap();

        let config = HabitatSuitabilityConfig {
            workspace_dir: dir.join("ws"),
            results_suffix: String::new(),
            criteria: vec![
                HabitatCriterion {
                    name: "a".into(),
                    raster_path: a,
                    suitability_range: [0.0, 1.0, 2.0, 3.0],
                },
                HabitatCriterion {
                    name: "b".into(),
                    raster_path: b,
                    suitability_range: [0.0, 1.0, 2.0, 3.0],
                },
            ],
            mask_threshold: None,
            n_workers: 0,
        };

        let err = execute(&config).unwrap_err();
        assert!(matches!(err, ModelError::Geo(GeoError::ShapeMismatch(..))));
    }
}
