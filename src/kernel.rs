//! The per-pixel transfer function library.
//!
//! Every kernel is a pure function over one or more equal-shaped 2D arrays
//! plus a no-data sentinel. Kernels are described by [`KernelSpec`], a tagged
//! parameter record rather than a closure, so a task's cache fingerprint can
//! be derived structurally: the variant tag, the parameters, and a per-variant
//! formula revision all feed the hash. Bump the revision whenever the formula
//! itself changes so stale artifacts are recomputed.
//!
//! No-data contract: a no-data pixel in any required input makes the output
//! pixel no-data. [`KernelSpec::SumIgnoringNodata`] is the one sanctioned
//! exception, treating no-data inputs as zero unless the entire stack is
//! no-data at that pixel.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Reserved value marking an invalid/missing pixel.
pub const INDEX_NODATA: f32 = -1.0;

/// Exponent shaping the degradation-to-quality response.
const DEGRADATION_SCALE: f64 = 2.5;

/// A tagged descriptor of one per-pixel numeric transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelSpec {
    /// `HN(x,s) = max_n(N(x,n) * ns(s,n))`, one input band per substrate,
    /// scaled by the per-species substrate suitability scalars in band order.
    /// No-data follows the first substrate band.
    HabitatNesting { substrate_suitability: Vec<f64> },

    /// `raster * scalar`, masking through no-data.
    MultiplyScalar { scalar: f64 },

    /// Sum of all input bands where no-data counts as zero, unless every band
    /// is no-data at that pixel.
    SumIgnoringNodata,

    /// `PS(x,s) = FR(x,s) * HN(x,s) * sa(s)`; inputs are `[HN, FR]`.
    PollinatorSupply { species_abundance: f64 },

    /// `PA(x,s,j) = foraged / FR * convolve(PS)`; inputs are
    /// `[foraged, FR, convolved PS]`. Zero floral resources yields exactly 0
    /// instead of a division error; that choice can mask genuine data gaps
    /// (see DESIGN.md).
    PollinatorAbundance,

    /// `FP = PAT*(1-h) / (h*(1-2*PAT)+PAT)`; inputs are `[h, PAT]`.
    OnFarmAbundance,

    /// `PYT = min(mp + FP, 1)`; inputs are `[mp, FP]`.
    TotalYield,

    /// `PYW = max(0, PYT - mp)`; inputs are `[mp, PYT]`.
    WildYield,

    /// `D(x) = access * sum_r(filtered_r * sens_r * w_r)` over interleaved
    /// `[filtered_1, sens_1, ..., filtered_n, sens_n, access]` bands, with one
    /// normalized weight per threat. No-data in any band is no-data out.
    Degradation { weights: Vec<f64> },

    /// `Q = H * (1 - D^z / (D^z + k^z))` with `z = 2.5`; inputs are
    /// `[D, H]`. Negative degradation is clamped to zero first.
    HabitatQuality { half_saturation: f64 },

    /// Piecewise-linear suitability of a biophysical criterion given a
    /// non-decreasing `(t0, o0, o1, t1)` range: 0 outside `(t0, t1)`,
    /// 1 inside `[o0, o1]`, linear in between.
    SuitabilityRange { range: [f64; 4] },

    /// Geometric mean across all input bands.
    GeometricMean,

    /// 0/1 mask of pixels at or above `limit`.
    Threshold { limit: f64 },
}

impl KernelSpec {
    /// Formula revision folded into the cache fingerprint. Bumping a variant's
    /// revision invalidates every cached artifact produced by that kernel.
    pub fn revision(&self) -> u16 {
        match self {
            KernelSpec::HabitatNesting { .. } => 1,
            KernelSpec::MultiplyScalar { .. } => 1,
            KernelSpec::SumIgnoringNodata => 1,
            KernelSpec::PollinatorSupply { .. } => 1,
            KernelSpec::PollinatorAbundance => 1,
            KernelSpec::OnFarmAbundance => 1,
            KernelSpec::TotalYield => 1,
            KernelSpec::WildYield => 1,
            KernelSpec::Degradation { .. } => 1,
            KernelSpec::HabitatQuality { .. } => 1,
            KernelSpec::SuitabilityRange { .. } => 1,
            KernelSpec::GeometricMean => 1,
            KernelSpec::Threshold { .. } => 1,
        }
    }

    /// How many input bands the kernel requires, if fixed.
    pub fn arity(&self) -> Option<usize> {
        match self {
            KernelSpec::HabitatNesting {
                substrate_suitability,
            } => Some(substrate_suitability.len()),
            KernelSpec::MultiplyScalar { .. } => Some(1),
            KernelSpec::SumIgnoringNodata => None,
            KernelSpec::PollinatorSupply { .. } => Some(2),
            KernelSpec::PollinatorAbundance => Some(3),
            KernelSpec::OnFarmAbundance => Some(2),
            KernelSpec::TotalYield => Some(2),
            KernelSpec::WildYield => Some(2),
            KernelSpec::Degradation { weights } => Some(weights.len() * 2 + 1),
            KernelSpec::HabitatQuality { .. } => Some(2),
            KernelSpec::SuitabilityRange { .. } => Some(1),
            KernelSpec::GeometricMean => None,
            KernelSpec::Threshold { .. } => Some(1),
        }
    }

    /// Apply the kernel to equal-shaped input bands. Panics on shape or arity
    /// mismatch; callers validate shapes before dispatch.
    pub fn apply(&self, bands: &[ArrayView2<f32>], nodata: f32) -> Array2<f32> {
        assert!(!bands.is_empty(), "kernel applied to empty band list");
        if let Some(arity) = self.arity() {
            assert_eq!(bands.len(), arity, "kernel arity mismatch");
        }
        let shape = bands[0].dim();
        for band in bands {
            assert_eq!(band.dim(), shape, "kernel band shape mismatch");
        }

        match self {
            KernelSpec::HabitatNesting {
                substrate_suitability,
            } => Array2::from_shape_fn(shape, |idx| {
                if bands[0][idx] == nodata {
                    return nodata;
                }
                bands
                    .iter()
                    .zip(substrate_suitability)
                    .map(|(band, &ns)| band[idx] * ns as f32)
                    .fold(f32::MIN, f32::max)
            }),

            KernelSpec::MultiplyScalar { scalar } => bands[0].mapv(|v| {
                if v == nodata {
                    nodata
                } else {
                    v * *scalar as f32
                }
            }),

            KernelSpec::SumIgnoringNodata => Array2::from_shape_fn(shape, |idx| {
                let mut acc = 0.0;
                let mut any_valid = false;
                for band in bands {
                    let v = band[idx];
                    if v != nodata {
                        acc += v;
                        any_valid = true;
                    }
                }
                if any_valid { acc } else { nodata }
            }),

            KernelSpec::PollinatorSupply { species_abundance } => {
                let (hn, fr) = (&bands[0], &bands[1]);
                Array2::from_shape_fn(shape, |idx| {
                    if fr[idx] == nodata || hn[idx] == nodata {
                        nodata
                    } else {
                        fr[idx] * hn[idx] * *species_abundance as f32
                    }
                })
            }

            KernelSpec::PollinatorAbundance => {
                let (foraged, fr, conv_ps) = (&bands[0], &bands[1], &bands[2]);
                Array2::from_shape_fn(shape, |idx| {
                    if foraged[idx] == nodata {
                        nodata
                    } else if fr[idx] == 0.0 {
                        0.0
                    } else {
                        foraged[idx] / fr[idx] * conv_ps[idx]
                    }
                })
            }

            KernelSpec::OnFarmAbundance => {
                let (h, pat) = (&bands[0], &bands[1]);
                Array2::from_shape_fn(shape, |idx| {
                    if h[idx] == nodata || pat[idx] == nodata {
                        nodata
                    } else {
                        let (h, pat) = (h[idx], pat[idx]);
                        let fp = (pat * (1.0 - h)) / (h * (1.0 - 2.0 * pat) + pat);
                        fp.clamp(0.0, 1.0)
                    }
                })
            }

            KernelSpec::TotalYield => {
                let (mp, fp) = (&bands[0], &bands[1]);
                Array2::from_shape_fn(shape, |idx| {
                    if mp[idx] == nodata || fp[idx] == nodata {
                        nodata
                    } else {
                        (mp[idx] + fp[idx]).min(1.0)
                    }
                })
            }

            KernelSpec::WildYield => {
                let (mp, pyt) = (&bands[0], &bands[1]);
                Array2::from_shape_fn(shape, |idx| {
                    if mp[idx] == nodata || pyt[idx] == nodata {
                        nodata
                    } else {
                        (pyt[idx] - mp[idx]).max(0.0)
                    }
                })
            }

            KernelSpec::Degradation { weights } => {
                let access = &bands[bands.len() - 1];
                Array2::from_shape_fn(shape, |idx| {
                    if bands.iter().any(|band| band[idx] == nodata) {
                        return nodata;
                    }
                    let total: f64 = weights
                        .iter()
                        .enumerate()
                        .map(|(i, &w)| {
                            bands[2 * i][idx] as f64 * bands[2 * i + 1][idx] as f64 * w
                        })
                        .sum();
                    (total * access[idx] as f64) as f32
                })
            }

            KernelSpec::HabitatQuality { half_saturation } => {
                let ksq = half_saturation.powf(DEGRADATION_SCALE);
                let (deg, habitat) = (&bands[0], &bands[1]);
                Array2::from_shape_fn(shape, |idx| {
                    if deg[idx] == nodata || habitat[idx] == nodata {
                        nodata
                    } else {
                        let d = (deg[idx].max(0.0) as f64).powf(DEGRADATION_SCALE);
                        (habitat[idx] as f64 * (1.0 - d / (d + ksq))) as f32
                    }
                })
            }

            KernelSpec::SuitabilityRange { range } => {
                let [t0, o0, o1, t1] = range.map(|v| v as f32);
                bands[0].mapv(|v| {
                    if v == nodata {
                        nodata
                    } else if v <= t0 || v >= t1 {
                        0.0
                    } else if v >= o0 && v <= o1 {
                        1.0
                    } else if v < o0 {
                        (v - t0) / (o0 - t0)
                    } else {
                        (t1 - v) / (t1 - o1)
                    }
                })
            }

            KernelSpec::GeometricMean => {
                let n = bands.len() as f32;
                Array2::from_shape_fn(shape, |idx| {
                    let mut product = 1.0f64;
                    for band in bands {
                        let v = band[idx];
                        if v == nodata || v < 0.0 {
                            return nodata;
                        }
                        product *= v as f64;
                    }
                    product.powf(1.0 / n as f64) as f32
                })
            }

            KernelSpec::Threshold { limit } => {
                let limit = *limit as f32;
                bands[0].mapv(|v| {
                    if v == nodata {
                        nodata
                    } else if v >= limit {
                        1.0
                    } else {
                        0.0
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const ND: f32 = INDEX_NODATA;

    fn apply(spec: &KernelSpec, bands: &[&Array2<f32>]) -> Array2<f32> {
        let views: Vec<ArrayView2<f32>> = bands.iter().map(|b| b.view()).collect();
        spec.apply(&views, ND)
    }

    #[test]
    fn habitat_nesting_takes_scaled_max() {
        let cavity = array![[0.2f32]];
        let ground = array![[0.8f32]];
        let spec = KernelSpec::HabitatNesting {
            substrate_suitability: vec![0.5, 1.0],
        };
        let out = apply(&spec, &[&cavity, &ground]);
        assert!((out[(0, 0)] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn habitat_nesting_follows_first_band_nodata() {
        let cavity = array![[ND]];
        let ground = array![[0.8f32]];
        let spec = KernelSpec::HabitatNesting {
            substrate_suitability: vec![0.5, 1.0],
        };
        let out = apply(&spec, &[&cavity, &ground]);
        assert_eq!(out[(0, 0)], ND);
    }

    #[test]
    fn multiply_scalar_masks_nodata() {
        let band = array![[0.5f32, ND]];
        let spec = KernelSpec::MultiplyScalar { scalar: 0.4 };
        let out = apply(&spec, &[&band]);
        assert!((out[(0, 0)] - 0.2).abs() < 1e-6);
        assert_eq!(out[(0, 1)], ND);
    }

    #[test]
    fn sum_treats_nodata_as_zero_unless_all_nodata() {
        let a = array![[1.0f32, ND, ND]];
        let b = array![[2.0f32, 3.0, ND]];
        let out = apply(&KernelSpec::SumIgnoringNodata, &[&a, &b]);
        assert_eq!(out[(0, 0)], 3.0);
        assert_eq!(out[(0, 1)], 3.0);
        assert_eq!(out[(0, 2)], ND);
    }

    #[test]
    fn pollinator_supply_scales_by_abundance() {
        let hn = array![[0.5f32]];
        let fr = array![[0.6f32]];
        let spec = KernelSpec::PollinatorSupply {
            species_abundance: 0.5,
        };
        let out = apply(&spec, &[&hn, &fr]);
        assert!((out[(0, 0)] - 0.15).abs() < 1e-6);
    }

    #[test]
    fn pollinator_abundance_zero_floral_special_case() {
        let foraged = array![[0.4f32, 0.4, ND]];
        let fr = array![[0.0f32, 0.8, 0.8]];
        let conv = array![[0.9f32, 0.9, 0.9]];
        let out = apply(&KernelSpec::PollinatorAbundance, &[&foraged, &fr, &conv]);
        assert_eq!(out[(0, 0)], 0.0);
        assert!((out[(0, 1)] - 0.45).abs() < 1e-6);
        assert_eq!(out[(0, 2)], ND);
    }

    #[test]
    fn total_yield_clamps_to_one() {
        let mp = array![[0.9f32]];
        let fp = array![[0.3f32]];
        let out = apply(&KernelSpec::TotalYield, &[&mp, &fp]);
        assert_eq!(out[(0, 0)], 1.0);
    }

    #[test]
    fn wild_yield_floors_at_zero() {
        let mp = array![[0.9f32, 1.0]];
        let pyt = array![[1.0f32, 0.5]];
        let out = apply(&KernelSpec::WildYield, &[&mp, &pyt]);
        assert!((out[(0, 0)] - 0.1).abs() < 1e-6);
        assert_eq!(out[(0, 1)], 0.0);
    }

    #[test]
    fn degradation_weights_threat_pairs_and_scales_by_access() {
        let filtered_a = array![[0.5f32, ND]];
        let sens_a = array![[1.0f32, 1.0]];
        let filtered_b = array![[0.2f32, 0.2]];
        let sens_b = array![[0.5f32, 0.5]];
        let access = array![[0.5f32, 1.0]];
        let spec = KernelSpec::Degradation {
            weights: vec![0.75, 0.25],
        };
        let out = apply(&spec, &[&filtered_a, &sens_a, &filtered_b, &sens_b, &access]);
        // (0.5*1.0*0.75 + 0.2*0.5*0.25) * 0.5
        assert!((out[(0, 0)] - 0.2).abs() < 1e-6);
        assert_eq!(out[(0, 1)], ND);
    }

    #[test]
    fn habitat_quality_decays_with_degradation() {
        let deg = array![[0.0f32, 0.5, -0.3, ND]];
        let habitat = array![[1.0f32, 1.0, 1.0, 1.0]];
        let spec = KernelSpec::HabitatQuality {
            half_saturation: 0.5,
        };
        let out = apply(&spec, &[&deg, &habitat]);
        assert_eq!(out[(0, 0)], 1.0);
        // at D == k the response is exactly half
        assert!((out[(0, 1)] - 0.5).abs() < 1e-6);
        // negative degradation clamps to pristine
        assert_eq!(out[(0, 2)], 1.0);
        assert_eq!(out[(0, 3)], ND);
    }

    #[test]
    fn suitability_range_interpolates() {
        let band = array![[-60.0f32, -50.0, -40.0, -20.0, -10.0, -5.0]];
        let spec = KernelSpec::SuitabilityRange {
            range: [-50.0, -30.0, -10.0, -10.0],
        };
        let out = apply(&spec, &[&band]);
        assert_eq!(out[(0, 0)], 0.0);
        assert_eq!(out[(0, 1)], 0.0);
        assert!((out[(0, 2)] - 0.5).abs() < 1e-6);
        assert!((out[(0, 3)] - 1.0).abs() < 1e-6);
        // t1 == o1 collapses the upper ramp
        assert_eq!(out[(0, 5)], 0.0);
    }

    #[test]
    fn geometric_mean_of_two_bands() {
        let a = array![[0.25f32]];
        let b = array![[1.0f32]];
        let out = apply(&KernelSpec::GeometricMean, &[&a, &b]);
        assert!((out[(0, 0)] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn threshold_masks_at_limit() {
        let band = array![[0.2f32, 0.5, 0.8, ND]];
        let out = apply(&KernelSpec::Threshold { limit: 0.5 }, &[&band]);
        assert_eq!(out, array![[0.0f32, 1.0, 1.0, ND]]);
    }

    #[test]
    fn specs_with_different_params_hash_differently() {
        use crate::hash::Hash32;
        let a = Hash32::hash_value(&KernelSpec::MultiplyScalar { scalar: 0.3 });
        let b = Hash32::hash_value(&KernelSpec::MultiplyScalar { scalar: 0.6 });
        assert_ne!(a, b);
    }
}
