//! The habitat quality model.
//!
//! Degradation sources ("threats") are blurred over their effect distance,
//! weighted by per-landcover sensitivity and by relative protection, and
//! summed into a degradation score. Habitat quality follows a half-saturation
//! response: pristine habitat scores 1, quality falls toward 0 as degradation
//! grows. With a baseline landcover the run also emits a rarity index, the
//! per-code loss of area relative to that baseline.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use tracing::info;

use crate::artifact::{ArtifactKey, ArtifactStore};
use crate::error::{ConfigError, GeoError, ModelError, TableKind};
use crate::graph::TaskGraph;
use crate::kernel::KernelSpec;
use crate::pipeline::RunSummary;
use crate::raster::Raster;
use crate::scenario::Table;
use crate::task::Op;

/// How a threat's influence falls off with distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayShape {
    Linear,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct HabitatQualityConfig {
    pub workspace_dir: Utf8PathBuf,
    pub results_suffix: String,
    pub landcover_raster_path: Utf8PathBuf,
    /// Baseline landcover; providing one enables the rarity output.
    pub baseline_raster_path: Option<Utf8PathBuf>,
    /// Relative protection against threats in `[0, 1]`; absent means fully
    /// accessible everywhere.
    pub access_raster_path: Option<Utf8PathBuf>,
    /// Rows of `threat,max_dist,weight,decay`; distances are in map units.
    pub threats_table_path: Utf8PathBuf,
    /// Rows of `lucode,habitat,l_<threat>...`, one sensitivity column per
    /// threat named in the threats table.
    pub sensitivity_table_path: Utf8PathBuf,
    /// Intensity raster per threat named in the threats table.
    pub threat_rasters: BTreeMap<String, Utf8PathBuf>,
    /// Degradation level at which quality drops to half.
    pub half_saturation: f64,
    pub n_workers: usize,
}

#[derive(Debug, Clone)]
struct Threat {
    name: String,
    max_dist: f64,
    /// Normalized so all threat weights sum to 1.
    weight: f64,
    decay: DecayShape,
}

/// Parsed and cross-validated threat and sensitivity tables.
#[derive(Debug, Clone)]
struct ThreatVariables {
    threats: Vec<Threat>,
    /// Habitat presence per landcover code.
    habitat: BTreeMap<i64, f64>,
    /// Per-threat sensitivity per landcover code.
    sensitivity: BTreeMap<String, BTreeMap<i64, f64>>,
}

impl ThreatVariables {
    fn build(
        threats_table_path: &Utf8Path,
        sensitivity_table_path: &Utf8Path,
    ) -> Result<Self, ConfigError> {
        let threats_table = Table::read(threats_table_path, TableKind::Threats)?;
        let sens_table = Table::read(sensitivity_table_path, TableKind::Sensitivity)?;

        let mut threats: Vec<Threat> = Vec::with_capacity(threats_table.len());
        for row in 0..threats_table.len() {
            let name = threats_table.text(row, "threat")?.to_lowercase();
            if threats.iter().any(|t| t.name == name) {
                return Err(ConfigError::DuplicateKey {
                    table: TableKind::Threats,
                    key: name,
                });
            }
            let decay = match threats_table.text(row, "decay")?.to_lowercase().as_str() {
                "linear" => DecayShape::Linear,
                "exponential" => DecayShape::Exponential,
                other => {
                    return Err(ConfigError::UnknownDecay {
                        threat: name,
                        value: other.to_owned(),
                    });
                }
            };
            threats.push(Threat {
                max_dist: threats_table.number(row, "max_dist")?,
                weight: threats_table.number(row, "weight")?,
                name,
                decay,
            });
        }

        let weight_sum: f64 = threats.iter().map(|t| t.weight).sum();
        if weight_sum.abs() < crate::scenario::NORMALIZATION_TOLERANCE {
            return Err(ConfigError::ZeroWeightSum {
                table: TableKind::Threats,
                column: "weight".into(),
            });
        }
        for threat in &mut threats {
            threat.weight /= weight_sum;
        }

        let mut habitat = BTreeMap::new();
        let mut sensitivity: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();
        for row in 0..sens_table.len() {
            let raw = sens_table.text(row, "lucode")?;
            let lucode: i64 = raw.parse().map_err(|_| ConfigError::InvalidNumber {
                table: TableKind::Sensitivity,
                column: "lucode".into(),
                value: raw.to_owned(),
            })?;
            if habitat.contains_key(&lucode) {
                return Err(ConfigError::DuplicateKey {
                    table: TableKind::Sensitivity,
                    key: raw.to_owned(),
                });
            }
            habitat.insert(lucode, sens_table.number(row, "habitat")?);
            for threat in &threats {
                let column = format!("l_{}", threat.name);
                sensitivity
                    .entry(threat.name.clone())
                    .or_default()
                    .insert(lucode, sens_table.number(row, &column)?);
            }
        }

        Ok(Self {
            threats,
            habitat,
            sensitivity,
        })
    }
}

/// Run the habitat quality model end to end.
pub fn execute(config: &HabitatQualityConfig) -> Result<RunSummary, ModelError> {
    eprintln!(
        "Running {} model {}.",
        style("habitat quality").green(),
        style(&config.workspace_dir).blue()
    );

    let store = ArtifactStore::new(&config.workspace_dir, &config.results_suffix);
    fs::create_dir_all(store.intermediate_dir().as_std_path())?;

    let mut required = vec![
        &config.landcover_raster_path,
        &config.threats_table_path,
        &config.sensitivity_table_path,
    ];
    required.extend(config.threat_rasters.values());
    required.extend(&config.baseline_raster_path);
    required.extend(&config.access_raster_path);
    for path in required {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.clone()).into());
        }
    }

    let vars = ThreatVariables::build(&config.threats_table_path, &config.sensitivity_table_path)?;
    for threat in &vars.threats {
        if !config.threat_rasters.contains_key(&threat.name) {
            return Err(ConfigError::MissingThreatRaster(threat.name.clone()).into());
        }
    }

    // The native backend has no resampling, so every grid must align with
    // the landcover, and every landcover code must be in the table.
    let landcover = Raster::load(&config.landcover_raster_path)?;
    let mut aligned: Vec<&Utf8PathBuf> = config.threat_rasters.values().collect();
    aligned.extend(&config.baseline_raster_path);
    aligned.extend(&config.access_raster_path);
    for path in aligned {
        let other = Raster::load(path)?;
        if other.data.dim() != landcover.data.dim() {
            return Err(ModelError::Geo(GeoError::ShapeMismatch(
                landcover.rows(),
                landcover.cols(),
                other.rows(),
                other.cols(),
            )));
        }
    }
    for &value in &landcover.data {
        if value == landcover.nodata {
            continue;
        }
        let code = value.round() as i64;
        if !vars.habitat.contains_key(&code) {
            return Err(ConfigError::UnmappedLandcover { code }.into());
        }
    }

    info!(threats = vars.threats.len(), "wiring habitat quality graph");
    let graph = TaskGraph::new(&store.token_dir(), config.n_workers)?;

    let habitat_path = store.path(&ArtifactKey::HabitatArea);
    let habitat_task = graph.add_task(
        Op::Reclassify {
            base: config.landcover_raster_path.clone(),
            value_map: vars.habitat.clone(),
            values_required: false,
        },
        vec![habitat_path.clone()],
        &[],
    )?;

    // Protection defaults to a raster of ones when no access layer is given.
    let (access_path, access_task) = match &config.access_raster_path {
        Some(path) => (path.clone(), None),
        None => {
            let path = store.path(&ArtifactKey::AccessLayer);
            let task = graph.add_task(
                Op::BlankFromBase {
                    base: config.landcover_raster_path.clone(),
                    fill: 1.0,
                },
                vec![path.clone()],
                &[],
            )?;
            (path, Some(task))
        }
    };

    let mut degradation_bands = Vec::new();
    let mut degradation_deps = Vec::new();
    let mut weights = Vec::new();
    for threat in &vars.threats {
        let kernel_path = store.path(&ArtifactKey::ThreatKernel {
            threat: threat.name.clone(),
        });
        let max_dist_pixels = threat.max_dist / landcover.pixel_size;
        let kernel_op = match threat.decay {
            DecayShape::Linear => Op::LinearDecayKernel {
                max_dist_pixels,
                pixel_size: landcover.pixel_size,
                projection: landcover.projection.clone(),
            },
            DecayShape::Exponential => Op::DecayKernel {
                alpha_pixels: max_dist_pixels,
                pixel_size: landcover.pixel_size,
                projection: landcover.projection.clone(),
            },
        };
        let kernel_task = graph.add_task(kernel_op, vec![kernel_path.clone()], &[])?;

        let filtered_path = store.path(&ArtifactKey::FilteredThreat {
            threat: threat.name.clone(),
        });
        let filtered_task = graph.add_task(
            Op::Convolve {
                signal: config.threat_rasters[&threat.name].clone(),
                kernel: kernel_path,
                ignore_nodata: true,
                mask_nodata: false,
                normalize_kernel: false,
            },
            vec![filtered_path.clone()],
            &[kernel_task],
        )?;

        let sens_path = store.path(&ArtifactKey::ThreatSensitivity {
            threat: threat.name.clone(),
        });
        let sens_task = graph.add_task(
            Op::Reclassify {
                base: config.landcover_raster_path.clone(),
                value_map: vars.sensitivity[&threat.name].clone(),
                values_required: true,
            },
            vec![sens_path.clone()],
            &[],
        )?;

        degradation_bands.push(filtered_path);
        degradation_bands.push(sens_path);
        degradation_deps.push(filtered_task);
        degradation_deps.push(sens_task);
        weights.push(threat.weight);
    }

    degradation_bands.push(access_path);
    degradation_deps.extend(access_task);

    let degradation_path = store.path(&ArtifactKey::DegradationSum);
    let degradation_task = graph.add_task(
        Op::RasterCalc {
            bands: degradation_bands,
            kernel: KernelSpec::Degradation { weights },
        },
        vec![degradation_path.clone()],
        &degradation_deps,
    )?;

    graph.add_task(
        Op::RasterCalc {
            bands: vec![degradation_path, habitat_path],
            kernel: KernelSpec::HabitatQuality {
                half_saturation: config.half_saturation,
            },
        },
        vec![store.path(&ArtifactKey::HabitatQuality)],
        &[degradation_task, habitat_task],
    )?;

    if let Some(baseline) = &config.baseline_raster_path {
        graph.add_task(
            Op::RarityIndex {
                base: baseline.clone(),
                cover: config.landcover_raster_path.clone(),
            },
            vec![store.path(&ArtifactKey::RarityIndex)],
            &[],
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
