//! Structured artifact identity.
//!
//! Every intermediate and final file a pipeline produces is identified by an
//! [`ArtifactKey`], a tuple of semantic fields. The key is what tasks and
//! cache fingerprints reason about; the mapping to an on-disk location is a
//! detail of [`ArtifactStore`]. Reruns with identical inputs resolve to
//! identical paths, which is what makes the on-disk memoization effective.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKey {
    NestingSubstrateIndex { substrate: String },
    FarmNestingSubstrateIndex { substrate: String },
    HabitatNestingIndex { species: String },
    RelativeFloralAbundance { season: String },
    FarmRelativeFloralAbundance { season: String },
    ForagedFlowersIndex { species: String, season: String },
    LocalForagingEffectiveness { species: String },
    FloralResourcesIndex { species: String },
    /// Exponential decay kernel for one flight distance, keyed by the bit
    /// pattern of alpha in pixels. Species sharing an alpha share the kernel.
    DecayKernel { alpha_bits: u64 },
    PollinatorSupply { species: String },
    ConvolvedSupply { species: String },
    PollinatorAbundance { species: String, season: String },
    TotalPollinatorAbundance { season: String },
    HalfSaturation { season: String },
    FarmPollinatorSeason { season: String },
    FarmPollinators,
    ManagedPollinators,
    BlankBase,
    ReprojectedFarmVector,
    TotalPollinatorYield,
    WildPollinatorYield,
    FarmResults,
    // habitat suitability model
    CriterionSuitability { criterion: String },
    SuitabilityScore,
    SuitabilityMask,
    // habitat quality model
    ThreatKernel { threat: String },
    FilteredThreat { threat: String },
    ThreatSensitivity { threat: String },
    HabitatArea,
    AccessLayer,
    DegradationSum,
    HabitatQuality,
    RarityIndex,
}

impl ArtifactKey {
    /// Final artifacts land in the workspace root, intermediates under
    /// `intermediate_outputs/`.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ArtifactKey::PollinatorSupply { .. }
                | ArtifactKey::PollinatorAbundance { .. }
                | ArtifactKey::TotalPollinatorAbundance { .. }
                | ArtifactKey::FarmPollinators
                | ArtifactKey::TotalPollinatorYield
                | ArtifactKey::WildPollinatorYield
                | ArtifactKey::FarmResults
                | ArtifactKey::SuitabilityScore
                | ArtifactKey::SuitabilityMask
                | ArtifactKey::DegradationSum
                | ArtifactKey::HabitatQuality
                | ArtifactKey::RarityIndex
        )
    }

    fn stem(&self) -> String {
        match self {
            ArtifactKey::NestingSubstrateIndex { substrate } => {
                format!("nesting_substrate_index_{substrate}")
            }
            ArtifactKey::FarmNestingSubstrateIndex { substrate } => {
                format!("farm_nesting_substrate_index_{substrate}")
            }
            ArtifactKey::HabitatNestingIndex { species } => {
                format!("habitat_nesting_index_{species}")
            }
            ArtifactKey::RelativeFloralAbundance { season } => {
                format!("relative_floral_abundance_index_{season}")
            }
            ArtifactKey::FarmRelativeFloralAbundance { season } => {
                format!("farm_relative_floral_abundance_index_{season}")
            }
            ArtifactKey::ForagedFlowersIndex { species, season } => {
                format!("foraged_flowers_index_{species}_{season}")
            }
            ArtifactKey::LocalForagingEffectiveness { species } => {
                format!("local_foraging_effectiveness_{species}")
            }
            ArtifactKey::FloralResourcesIndex { species } => {
                format!("floral_resources_{species}")
            }
            // the bit pattern, not a rounded decimal: alphas that agree only
            // to a few places must not collide on one path
            ArtifactKey::DecayKernel { alpha_bits } => format!("kernel_{alpha_bits:016x}"),
            ArtifactKey::PollinatorSupply { species } => {
                format!("pollinator_supply_{species}")
            }
            ArtifactKey::ConvolvedSupply { species } => format!("convolve_ps_{species}"),
            ArtifactKey::PollinatorAbundance { species, season } => {
                format!("pollinator_abundance_{species}_{season}")
            }
            ArtifactKey::TotalPollinatorAbundance { season } => {
                format!("total_pollinator_abundance_{season}")
            }
            ArtifactKey::HalfSaturation { season } => format!("half_saturation_{season}"),
            ArtifactKey::FarmPollinatorSeason { season } => {
                format!("farm_pollinator_{season}")
            }
            ArtifactKey::FarmPollinators => "farm_pollinators".into(),
            ArtifactKey::ManagedPollinators => "managed_pollinators".into(),
            ArtifactKey::BlankBase => "blank_raster".into(),
            ArtifactKey::ReprojectedFarmVector => "reprojected_farm_vector".into(),
            ArtifactKey::TotalPollinatorYield => "total_pollinator_yield".into(),
            ArtifactKey::WildPollinatorYield => "wild_pollinator_yield".into(),
            ArtifactKey::FarmResults => "farm_results".into(),
            ArtifactKey::CriterionSuitability { criterion } => {
                format!("suitability_{criterion}")
            }
            ArtifactKey::SuitabilityScore => "habitat_suitability".into(),
            ArtifactKey::SuitabilityMask => "habitat_suitability_mask".into(),
            ArtifactKey::ThreatKernel { threat } => format!("kernel_{threat}"),
            ArtifactKey::FilteredThreat { threat } => format!("filtered_{threat}"),
            ArtifactKey::ThreatSensitivity { threat } => format!("sens_{threat}"),
            ArtifactKey::HabitatArea => "habitat".into(),
            ArtifactKey::AccessLayer => "access_layer".into(),
            ArtifactKey::DegradationSum => "deg_sum".into(),
            ArtifactKey::HabitatQuality => "quality".into(),
            ArtifactKey::RarityIndex => "rarity".into(),
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ArtifactKey::ReprojectedFarmVector | ArtifactKey::FarmResults => "json",
            _ => "bsr",
        }
    }
}

/// Resolves artifact keys to workspace locations for one model run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    workspace: Utf8PathBuf,
    intermediate: Utf8PathBuf,
    suffix: String,
}

impl ArtifactStore {
    pub fn new(workspace: &Utf8Path, results_suffix: &str) -> Self {
        let suffix = if results_suffix.is_empty() {
            String::new()
        } else {
            format!("_{}", results_suffix.trim_start_matches('_'))
        };
        Self {
            workspace: workspace.to_owned(),
            intermediate: workspace.join("intermediate_outputs"),
            suffix,
        }
    }

    pub fn workspace(&self) -> &Utf8Path {
        &self.workspace
    }

    pub fn intermediate_dir(&self) -> &Utf8Path {
        &self.intermediate
    }

    pub fn token_dir(&self) -> Utf8PathBuf {
        self.intermediate.join("_taskgraph_tokens")
    }

    pub fn path(&self, key: &ArtifactKey) -> Utf8PathBuf {
        let dir = if key.is_final() {
            &self.workspace
        } else {
            &self.intermediate
        };
        dir.join(format!(
            "{}{}.{}",
            key.stem(),
            self.suffix,
            key.extension()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_is_deterministic_and_suffixed() {
        let store = ArtifactStore::new(Utf8Path::new("/tmp/ws"), "run1");
        let key = ArtifactKey::HabitatNestingIndex {
            species: "apis".into(),
        };
        assert_eq!(
            store.path(&key),
            Utf8PathBuf::from("/tmp/ws/intermediate_outputs/habitat_nesting_index_apis_run1.bsr")
        );
        assert_eq!(store.path(&key), store.path(&key.clone()));
    }

    #[test]
    fn final_artifacts_live_in_workspace_root() {
        let store = ArtifactStore::new(Utf8Path::new("/tmp/ws"), "");
        assert_eq!(
            store.path(&ArtifactKey::TotalPollinatorYield),
            Utf8PathBuf::from("/tmp/ws/total_pollinator_yield.bsr")
        );
    }

    #[test]
    fn equal_alphas_share_a_kernel_artifact() {
        let store = ArtifactStore::new(Utf8Path::new("/tmp/ws"), "");
        let a = ArtifactKey::DecayKernel {
            alpha_bits: 1.25f64.to_bits(),
        };
        let b = ArtifactKey::DecayKernel {
            alpha_bits: 1.25f64.to_bits(),
        };
        assert_eq!(store.path(&a), store.path(&b));
    }

    #[test]
    fn nearly_equal_alphas_get_distinct_kernel_artifacts() {
        let store = ArtifactStore::new(Utf8Path::new("/tmp/ws"), "");
        let a = ArtifactKey::DecayKernel {
            alpha_bits: 1.25f64.to_bits(),
        };
        let b = ArtifactKey::DecayKernel {
            alpha_bits: (1.25f64 + 1e-9).to_bits(),
        };
        assert_ne!(store.path(&a), store.path(&b));
    }
}
