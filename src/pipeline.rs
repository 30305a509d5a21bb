//! The pollination model.
//!
//! [`execute`] parses and validates the scenario, then registers the full
//! dependency graph on a [`TaskGraph`] before anything runs: nesting substrate
//! and floral reclassifications, farm overrides, per-species supply and
//! abundance, per-season totals, and the on-farm yield tail. Output paths come
//! from [`ArtifactStore`], so a rerun with identical inputs resolves to
//! identical paths and the persisted cache tokens short-circuit every task.
//!
//! Stage wiring, per species `s` and season `j`:
//!
//! ```text
//! landcover --reclassify--> N(substrate) --max--> HN(s)
//! landcover --reclassify--> RFA(j) --*fa(s,j)--> foraged(s,j) --sum--> FE(s)
//! FE(s) --convolve(alpha_s)--> FR(s)
//! HN(s), FR(s) --*sa(s)--> PS(s) --convolve(alpha_s)--> convPS(s)
//! foraged(s,j), FR(s), convPS(s) --> PA(s,j) --sum over s--> PAT(j)
//! ```
//!
//! With a farm vector the tail continues through half saturation, on-farm
//! pollinators, managed pollinators, total and wild yield, and finishes with
//! one declared aggregation task producing the farm result vector.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use tracing::info;

use crate::artifact::{ArtifactKey, ArtifactStore};
use crate::error::{ConfigError, ModelError};
use crate::graph::{Diagnostics, TaskGraph, TaskHandle};
use crate::kernel::{INDEX_NODATA, KernelSpec};
use crate::raster::{self, RasterMeta};
use crate::scenario::ScenarioVariables;
use crate::task::Op;
use crate::vector::{FarmAttribute, FarmVector};

/// Everything a pollination run needs, passed explicitly.
#[derive(Debug, Clone)]
pub struct PollinationConfig {
    pub workspace_dir: Utf8PathBuf,
    /// Appended to every artifact file name, to keep runs apart in a shared
    /// workspace.
    pub results_suffix: String,
    pub landcover_raster_path: Utf8PathBuf,
    pub guild_table_path: Utf8PathBuf,
    pub biophysical_table_path: Utf8PathBuf,
    pub farm_vector_path: Option<Utf8PathBuf>,
    /// Worker threads for the task graph; 0 runs everything synchronously.
    pub n_workers: usize,
}

/// A problem found by [`validate`], tied to the config field it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub field: &'static str,
    pub message: String,
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub workspace: Utf8PathBuf,
    pub diagnostics: Diagnostics,
    /// Path of the farm result vector, when the run had farms.
    pub farm_results: Option<Utf8PathBuf>,
}

/// Check a configuration without scheduling anything. Returns an empty list
/// when the run would start cleanly.
pub fn validate(config: &PollinationConfig) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let mut check = |field: &'static str, path: &Utf8Path| {
        if !path.exists() {
            warnings.push(ValidationWarning {
                field,
                message: format!("file not found: {path}"),
            });
        }
    };
    check("landcover_raster_path", &config.landcover_raster_path);
    check("guild_table_path", &config.guild_table_path);
    check("biophysical_table_path", &config.biophysical_table_path);
    if let Some(path) = &config.farm_vector_path {
        check("farm_vector_path", path);
    }
    if !warnings.is_empty() {
        return warnings;
    }

    let farm = match &config.farm_vector_path {
        Some(path) => match FarmVector::load(path) {
            Ok(farm) => Some(farm),
            Err(err) => {
                warnings.push(ValidationWarning {
                    field: "farm_vector_path",
                    message: err.to_string(),
                });
                return warnings;
            }
        },
        None => None,
    };

    if let Err(err) = ScenarioVariables::build(
        &config.guild_table_path,
        &config.biophysical_table_path,
        farm.as_ref(),
    ) {
        warnings.push(ValidationWarning {
            field: "guild_table_path",
            message: err.to_string(),
        });
    }
    warnings
}

/// Run the pollination model end to end.
pub fn execute(config: &PollinationConfig) -> Result<RunSummary, ModelError> {
    eprintln!(
        "Running {} model {}.",
        style("pollination").green(),
        style(&config.workspace_dir).blue()
    );

    let store = ArtifactStore::new(&config.workspace_dir, &config.results_suffix);
    fs::create_dir_all(store.intermediate_dir().as_std_path())?;

    if !config.landcover_raster_path.exists() {
        return Err(ConfigError::MissingFile(config.landcover_raster_path.clone()).into());
    }

    let farm = match &config.farm_vector_path {
        Some(path) => Some(FarmVector::load(path).map_err(|err| {
            ModelError::Config(ConfigError::FarmVector(path.clone(), err))
        })?),
        None => None,
    };
    let vars = ScenarioVariables::build(
        &config.guild_table_path,
        &config.biophysical_table_path,
        farm.as_ref(),
    )?;
    let meta = raster::get_raster_metadata(&config.landcover_raster_path)?;

    info!(
        species = vars.species.len(),
        seasons = vars.seasons.len(),
        substrates = vars.substrates.len(),
        farms = farm.as_ref().map_or(0, |f| f.features.len()),
        "scenario validated, wiring task graph"
    );

    let graph = TaskGraph::new(&store.token_dir(), config.n_workers)?;
    let builder = PipelineBuilder {
        config,
        store: &store,
        vars: &vars,
        meta: &meta,
        graph: &graph,
    };
    let farm_results = builder.wire()?;

    graph.close();
    graph.join()?;

    let diagnostics = graph.diagnostics();
    info!(
        executed = diagnostics.executed,
        cache_hits = diagnostics.cache_hits,
        "run complete"
    );
    Ok(RunSummary {
        workspace: store.workspace().to_owned(),
        diagnostics,
        farm_results,
    })
}

/// An artifact under construction: its resolved path and the task producing
/// it, carried together so downstream registrations can declare both the
/// input path and the dependency edge.
type Staged = (Utf8PathBuf, TaskHandle);

struct PipelineBuilder<'a> {
    config: &'a PollinationConfig,
    store: &'a ArtifactStore,
    vars: &'a ScenarioVariables,
    meta: &'a RasterMeta,
    graph: &'a TaskGraph,
}

impl PipelineBuilder<'_> {
    /// Register every task of the run. Returns the farm result path when the
    /// run has a farm vector.
    fn wire(&self) -> Result<Option<Utf8PathBuf>, ModelError> {
        let farm = self.wire_farm_reprojection()?;
        let substrates = self.wire_nesting_substrates(farm.as_ref())?;
        let floral = self.wire_floral_abundance(farm.as_ref())?;

        let mut kernels: BTreeMap<u64, Staged> = BTreeMap::new();
        let mut abundance: BTreeMap<(String, String), Staged> = BTreeMap::new();

        for species in &self.vars.species {
            let nesting = self.wire_habitat_nesting(species, &substrates)?;
            let foraged = self.wire_foraged_flowers(species, &floral)?;
            let kernel = self.wire_decay_kernel(species, &mut kernels)?;
            let resources = self.wire_floral_resources(species, &foraged, &kernel)?;
            let supply = self.wire_pollinator_supply(species, &nesting, &resources)?;
            let convolved = self.wire_convolved_supply(species, &supply, &kernel)?;

            for season in &self.vars.seasons {
                let staged = self.wire_pollinator_abundance(
                    species,
                    season,
                    &foraged[season],
                    &resources,
                    &convolved,
                )?;
                abundance.insert((species.clone(), season.clone()), staged);
            }
        }

        let totals = self.wire_abundance_totals(&abundance)?;

        match farm {
            Some(farm) => Ok(Some(self.wire_farm_tail(&farm, &totals)?)),
            None => Ok(None),
        }
    }

    fn wire_farm_reprojection(&self) -> Result<Option<Staged>, ModelError> {
        let Some(source) = &self.config.farm_vector_path else {
            return Ok(None);
        };
        let target = self.store.path(&ArtifactKey::ReprojectedFarmVector);
        let handle = self.graph.add_task(
            Op::ReprojectVector {
                source: source.clone(),
                projection: self.meta.projection.clone(),
            },
            vec![target.clone()],
            &[],
        )?;
        Ok(Some((target, handle)))
    }

    /// Per-substrate availability from the landcover, with the farm's
    /// nesting overrides burned on top when present.
    fn wire_nesting_substrates(
        &self,
        farm: Option<&Staged>,
    ) -> Result<BTreeMap<String, Staged>, ModelError> {
        let mut out = BTreeMap::new();
        for substrate in &self.vars.substrates {
            let base = self.store.path(&ArtifactKey::NestingSubstrateIndex {
                substrate: substrate.clone(),
            });
            let base_task = self.graph.add_task(
                Op::Reclassify {
                    base: self.config.landcover_raster_path.clone(),
                    value_map: self.vars.landcover_substrate[substrate].clone(),
                    values_required: true,
                },
                vec![base.clone()],
                &[],
            )?;

            let staged = match farm {
                None => (base, base_task),
                Some((farm_path, farm_task)) => {
                    let target = self.store.path(&ArtifactKey::FarmNestingSubstrateIndex {
                        substrate: substrate.clone(),
                    });
                    let handle = self.graph.add_task(
                        Op::RasterizeAttribute {
                            base: base.clone(),
                            vector: farm_path.clone(),
                            attribute: FarmAttribute::NestingSubstrate {
                                substrate: substrate.clone(),
                            },
                            filter_season: None,
                        },
                        vec![target.clone()],
                        &[base_task, *farm_task],
                    )?;
                    (target, handle)
                }
            };
            out.insert(substrate.clone(), staged);
        }
        Ok(out)
    }

    /// Per-season relative floral abundance, with farm `fr_<season>`
    /// overrides burned on top when present.
    fn wire_floral_abundance(
        &self,
        farm: Option<&Staged>,
    ) -> Result<BTreeMap<String, Staged>, ModelError> {
        let mut out = BTreeMap::new();
        for season in &self.vars.seasons {
            let base = self.store.path(&ArtifactKey::RelativeFloralAbundance {
                season: season.clone(),
            });
            let base_task = self.graph.add_task(
                Op::Reclassify {
                    base: self.config.landcover_raster_path.clone(),
                    value_map: self.vars.landcover_floral[season].clone(),
                    values_required: true,
                },
                vec![base.clone()],
                &[],
            )?;

            let staged = match farm {
                None => (base, base_task),
                Some((farm_path, farm_task)) => {
                    let target = self.store.path(&ArtifactKey::FarmRelativeFloralAbundance {
                        season: season.clone(),
                    });
                    let handle = self.graph.add_task(
                        Op::RasterizeAttribute {
                            base: base.clone(),
                            vector: farm_path.clone(),
                            attribute: FarmAttribute::FloralResources {
                                season: season.clone(),
                            },
                            filter_season: None,
                        },
                        vec![target.clone()],
                        &[base_task, *farm_task],
                    )?;
                    (target, handle)
                }
            };
            out.insert(season.clone(), staged);
        }
        Ok(out)
    }

    /// `HN(x,s) = max_n(N(x,n) * ns(s,n))` across substrates.
    fn wire_habitat_nesting(
        &self,
        species: &str,
        substrates: &BTreeMap<String, Staged>,
    ) -> Result<Staged, ModelError> {
        let mut bands = Vec::new();
        let mut suitability = Vec::new();
        let mut deps = Vec::new();
        for substrate in &self.vars.substrates {
            let (path, handle) = &substrates[substrate];
            bands.push(path.clone());
            deps.push(*handle);
            suitability.push(self.vars.species_substrate[&(species.to_owned(), substrate.clone())]);
        }

        let target = self.store.path(&ArtifactKey::HabitatNestingIndex {
            species: species.to_owned(),
        });
        let handle = self.graph.add_task(
            Op::RasterCalc {
                bands,
                kernel: KernelSpec::HabitatNesting {
                    substrate_suitability: suitability,
                },
            },
            vec![target.clone()],
            &deps,
        )?;
        Ok((target, handle))
    }

    /// `foraged(x,s,j) = RA(x,j) * fa(s,j)` per season, plus their season sum
    /// `FE(x,s)`. The per-season rasters are returned so the abundance stage
    /// can reuse them.
    fn wire_foraged_flowers(
        &self,
        species: &str,
        floral: &BTreeMap<String, Staged>,
    ) -> Result<BTreeMap<String, Staged>, ModelError> {
        let mut out = BTreeMap::new();
        for season in &self.vars.seasons {
            let (rfa_path, rfa_task) = &floral[season];
            let activity =
                self.vars.foraging_activity[&(species.to_owned(), season.clone())];
            let target = self.store.path(&ArtifactKey::ForagedFlowersIndex {
                species: species.to_owned(),
                season: season.clone(),
            });
            let handle = self.graph.add_task(
                Op::RasterCalc {
                    bands: vec![rfa_path.clone()],
                    kernel: KernelSpec::MultiplyScalar { scalar: activity },
                },
                vec![target.clone()],
                &[*rfa_task],
            )?;
            out.insert(season.clone(), (target, handle));
        }
        Ok(out)
    }

    /// One decay kernel per distinct flight distance; species sharing an
    /// alpha share the artifact and the task.
    fn wire_decay_kernel(
        &self,
        species: &str,
        kernels: &mut BTreeMap<u64, Staged>,
    ) -> Result<Staged, ModelError> {
        let alpha_pixels = self.vars.alpha[species] / self.meta.pixel_size;
        let alpha_bits = alpha_pixels.to_bits();
        if let Some(staged) = kernels.get(&alpha_bits) {
            return Ok(staged.clone());
        }

        let target = self.store.path(&ArtifactKey::DecayKernel { alpha_bits });
        let handle = self.graph.add_task(
            Op::DecayKernel {
                alpha_pixels,
                pixel_size: self.meta.pixel_size,
                projection: self.meta.projection.clone(),
            },
            vec![target.clone()],
            &[],
        )?;
        kernels.insert(alpha_bits, (target.clone(), handle));
        Ok((target, handle))
    }

    /// `FR(x,s) = convolve(FE(·,s), kernel_alpha_s)`.
    fn wire_floral_resources(
        &self,
        species: &str,
        foraged: &BTreeMap<String, Staged>,
        kernel: &Staged,
    ) -> Result<Staged, ModelError> {
        let effectiveness = self.store.path(&ArtifactKey::LocalForagingEffectiveness {
            species: species.to_owned(),
        });
        let (bands, deps): (Vec<_>, Vec<_>) = self
            .vars
            .seasons
            .iter()
            .map(|season| {
                let (path, handle) = &foraged[season];
                (path.clone(), *handle)
            })
            .unzip();
        let effectiveness_task = self.graph.add_task(
            Op::RasterCalc {
                bands,
                kernel: KernelSpec::SumIgnoringNodata,
            },
            vec![effectiveness.clone()],
            &deps,
        )?;

        let target = self.store.path(&ArtifactKey::FloralResourcesIndex {
            species: species.to_owned(),
        });
        let handle = self.graph.add_task(
            Op::Convolve {
                signal: effectiveness,
                kernel: kernel.0.clone(),
                ignore_nodata: true,
                mask_nodata: true,
                normalize_kernel: false,
            },
            vec![target.clone()],
            &[effectiveness_task, kernel.1],
        )?;
        Ok((target, handle))
    }

    /// `PS(x,s) = FR(x,s) * HN(x,s) * sa(s)`.
    fn wire_pollinator_supply(
        &self,
        species: &str,
        nesting: &Staged,
        resources: &Staged,
    ) -> Result<Staged, ModelError> {
        let target = self.store.path(&ArtifactKey::PollinatorSupply {
            species: species.to_owned(),
        });
        let handle = self.graph.add_task(
            Op::RasterCalc {
                bands: vec![nesting.0.clone(), resources.0.clone()],
                kernel: KernelSpec::PollinatorSupply {
                    species_abundance: self.vars.species_abundance[species],
                },
            },
            vec![target.clone()],
            &[nesting.1, resources.1],
        )?;
        Ok((target, handle))
    }

    fn wire_convolved_supply(
        &self,
        species: &str,
        supply: &Staged,
        kernel: &Staged,
    ) -> Result<Staged, ModelError> {
        let target = self.store.path(&ArtifactKey::ConvolvedSupply {
            species: species.to_owned(),
        });
        let handle = self.graph.add_task(
            Op::Convolve {
                signal: supply.0.clone(),
                kernel: kernel.0.clone(),
                ignore_nodata: true,
                mask_nodata: true,
                normalize_kernel: false,
            },
            vec![target.clone()],
            &[supply.1, kernel.1],
        )?;
        Ok((target, handle))
    }

    /// `PA(x,s,j) = foraged(x,s,j) / FR(x,s) * convPS(x,s)`.
    fn wire_pollinator_abundance(
        &self,
        species: &str,
        season: &str,
        foraged: &Staged,
        resources: &Staged,
        convolved: &Staged,
    ) -> Result<Staged, ModelError> {
        let target = self.store.path(&ArtifactKey::PollinatorAbundance {
            species: species.to_owned(),
            season: season.to_owned(),
        });
        let handle = self.graph.add_task(
            Op::RasterCalc {
                bands: vec![foraged.0.clone(), resources.0.clone(), convolved.0.clone()],
                kernel: KernelSpec::PollinatorAbundance,
            },
            vec![target.clone()],
            &[foraged.1, resources.1, convolved.1],
        )?;
        Ok((target, handle))
    }

    /// `PAT(x,j) = Σ_s PA(x,s,j)`.
    fn wire_abundance_totals(
        &self,
        abundance: &BTreeMap<(String, String), Staged>,
    ) -> Result<BTreeMap<String, Staged>, ModelError> {
        let mut out = BTreeMap::new();
        for season in &self.vars.seasons {
            let (bands, deps): (Vec<_>, Vec<_>) = self
                .vars
                .species
                .iter()
                .map(|species| {
                    let (path, handle) = &abundance[&(species.clone(), season.clone())];
                    (path.clone(), *handle)
                })
                .unzip();
            let target = self.store.path(&ArtifactKey::TotalPollinatorAbundance {
                season: season.clone(),
            });
            let handle = self.graph.add_task(
                Op::RasterCalc {
                    bands,
                    kernel: KernelSpec::SumIgnoringNodata,
                },
                vec![target.clone()],
                &deps,
            )?;
            out.insert(season.clone(), (target, handle));
        }
        Ok(out)
    }

    /// Half saturation, on-farm and managed pollinators, total and wild
    /// yield, and the final aggregation into the farm result vector.
    fn wire_farm_tail(
        &self,
        farm: &Staged,
        totals: &BTreeMap<String, Staged>,
    ) -> Result<Utf8PathBuf, ModelError> {
        let blank = self.store.path(&ArtifactKey::BlankBase);
        let blank_task = self.graph.add_task(
            Op::BlankFromBase {
                base: self.config.landcover_raster_path.clone(),
                fill: INDEX_NODATA,
            },
            vec![blank.clone()],
            &[],
        )?;

        // FP(x,j) = PAT*(1-h) / (h*(1-2*PAT)+PAT) on farms of season j
        let mut season_pollinators = Vec::new();
        for season in &self.vars.seasons {
            let half_sat = self.store.path(&ArtifactKey::HalfSaturation {
                season: season.clone(),
            });
            let half_sat_task = self.graph.add_task(
                Op::RasterizeAttribute {
                    base: blank.clone(),
                    vector: farm.0.clone(),
                    attribute: FarmAttribute::HalfSaturation,
                    filter_season: Some(season.clone()),
                },
                vec![half_sat.clone()],
                &[blank_task, farm.1],
            )?;

            let (total_path, total_task) = &totals[season];
            let target = self.store.path(&ArtifactKey::FarmPollinatorSeason {
                season: season.clone(),
            });
            let handle = self.graph.add_task(
                Op::RasterCalc {
                    bands: vec![half_sat, total_path.clone()],
                    kernel: KernelSpec::OnFarmAbundance,
                },
                vec![target.clone()],
                &[half_sat_task, *total_task],
            )?;
            season_pollinators.push((target, handle));
        }

        let farm_pollinators = self.store.path(&ArtifactKey::FarmPollinators);
        let (bands, deps): (Vec<_>, Vec<_>) = season_pollinators.into_iter().unzip();
        let farm_pollinators_task = self.graph.add_task(
            Op::RasterCalc {
                bands,
                kernel: KernelSpec::SumIgnoringNodata,
            },
            vec![farm_pollinators.clone()],
            &deps,
        )?;

        let managed = self.store.path(&ArtifactKey::ManagedPollinators);
        let managed_task = self.graph.add_task(
            Op::RasterizeAttribute {
                base: blank.clone(),
                vector: farm.0.clone(),
                attribute: FarmAttribute::ManagedPollinators,
                filter_season: None,
            },
            vec![managed.clone()],
            &[blank_task, farm.1],
        )?;

        let total_yield = self.store.path(&ArtifactKey::TotalPollinatorYield);
        let total_yield_task = self.graph.add_task(
            Op::RasterCalc {
                bands: vec![managed.clone(), farm_pollinators],
                kernel: KernelSpec::TotalYield,
            },
            vec![total_yield.clone()],
            &[managed_task, farm_pollinators_task],
        )?;

        let wild_yield = self.store.path(&ArtifactKey::WildPollinatorYield);
        let wild_yield_task = self.graph.add_task(
            Op::RasterCalc {
                bands: vec![managed, total_yield.clone()],
                kernel: KernelSpec::WildYield,
            },
            vec![wild_yield.clone()],
            &[managed_task, total_yield_task],
        )?;

        let results = self.store.path(&ArtifactKey::FarmResults);
        let mut abundance_by_season = BTreeMap::new();
        let mut aggregate_deps = vec![farm.1, total_yield_task, wild_yield_task];
        for (season, (path, handle)) in totals {
            abundance_by_season.insert(season.clone(), path.clone());
            aggregate_deps.push(*handle);
        }
        self.graph.add_task(
            Op::AggregateFarms {
                vector: farm.0.clone(),
                total_yield,
                wild_yield,
                abundance_by_season,
            },
            vec![results.clone()],
            &aggregate_deps,
        )?;

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn validate_reports_missing_inputs() {
        let (_guard, dir) = scratch();
        let config = PollinationConfig {
            workspace_dir: dir.join("ws"),
            results_suffix: String::new(),
            landcover_raster_path: dir.join("absent.bsr"),
            guild_table_path: dir.join("absent_guild.csv"),
            biophysical_table_path: dir.join("absent_bio.csv"),
            farm_vector_path: None,
            n_workers: 0,
        };
        let warnings = validate(&config);
        let fields: Vec<_> = warnings.iter().map(|w| w.field).collect();
        assert_eq!(
            fields,
            vec![
                "landcover_raster_path",
                "guild_table_path",
                "biophysical_table_path"
            ]
        );
    }

    #[test]
    fn execute_fails_before_scheduling_on_missing_landcover() {
        let (_guard, dir) = scratch();
        let config = PollinationConfig {
            workspace_dir: dir.join("ws"),
            results_suffix: String::new(),
            landcover_raster_path: dir.join("absent.bsr"),
            guild_table_path: dir.join("guild.csv"),
            biophysical_table_path: dir.join("bio.csv"),
            farm_vector_path: None,
            n_workers: 0,
        };
        let err = execute(&config).unwrap_err();
        assert!(matches!(
            err,
            ModelError::Config(ConfigError::MissingFile(_))
        ));
        // the workspace is created, but holds no artifacts
        assert!(dir.join("ws").exists());
    }
}
