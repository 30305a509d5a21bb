//! Native farm vector backend.
//!
//! Farm features are polygons with per-farm model attributes, stored as a
//! JSON feature collection. Rasterization burns an attribute onto a copy of a
//! base raster by testing pixel centers against the polygon (even-odd rule);
//! zonal statistics aggregate raster values per feature the same way.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::GeoError;
use crate::raster::Raster;

/// Numeric results appended to a farm feature by the aggregation stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FarmResults {
    /// Total yield index `y_tot = 1 - p_dep * (1 - mean(PYT))`.
    pub y_tot: f64,
    /// Wild-pollinator share of yield `y_wild = p_dep * mean(PYW)`.
    pub y_wild: f64,
    /// Mean wild yield over the pollinator-dependent part, `pdep_y_w`.
    pub pdep_y_w: f64,
    /// Mean total pollinator abundance for the farm's season, `p_abund`.
    pub p_abund: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmFeature {
    /// Season in which the farm needs pollination.
    pub season: String,
    pub crop_type: String,
    /// Proportion of wild pollinators achieving a 50% yield.
    pub half_sat: f64,
    /// Proportion of yield dependent on pollinators.
    pub p_dep: f64,
    /// Proportion of pollinators from managed hives.
    pub p_managed: f64,
    /// Per-season floral resource overrides (the `fr_<season>` attributes).
    #[serde(default)]
    pub floral_resources: BTreeMap<String, f64>,
    /// Per-substrate nesting overrides (the `n_<substrate>` attributes).
    #[serde(default)]
    pub nesting_substrates: BTreeMap<String, f64>,
    /// Polygon ring in map coordinates; implicitly closed.
    pub polygon: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<FarmResults>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmVector {
    pub projection: String,
    pub features: Vec<FarmFeature>,
}

/// A farm attribute that can be rasterized. Using a tag instead of a raw
/// column name keeps attribute access checked at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FarmAttribute {
    HalfSaturation,
    ManagedPollinators,
    FloralResources { season: String },
    NestingSubstrate { substrate: String },
}

impl FarmAttribute {
    fn value(&self, feature: &FarmFeature) -> Option<f64> {
        match self {
            FarmAttribute::HalfSaturation => Some(feature.half_sat),
            FarmAttribute::ManagedPollinators => Some(feature.p_managed),
            FarmAttribute::FloralResources { season } => {
                feature.floral_resources.get(season).copied()
            }
            FarmAttribute::NestingSubstrate { substrate } => {
                feature.nesting_substrates.get(substrate).copied()
            }
        }
    }
}

/// Per-feature zonal aggregation result.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ZonalStats {
    pub count: usize,
    pub sum: f64,
}

impl ZonalStats {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

impl FarmVector {
    pub fn load(path: &Utf8Path) -> Result<Self, GeoError> {
        let file = fs::File::open(path.as_std_path()).map_err(GeoError::Io)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| GeoError::Vector {
            path: path.to_owned(),
            source,
        })
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), GeoError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir.as_std_path())?;
        }
        let tmp = path.with_extension("part");
        let file = fs::File::create(tmp.as_std_path())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|source| {
            GeoError::Vector {
                path: path.to_owned(),
                source,
            }
        })?;
        fs::rename(tmp.as_std_path(), path.as_std_path())?;
        Ok(())
    }

    /// Even-odd point-in-polygon test against a single feature.
    fn contains(feature: &FarmFeature, x: f64, y: f64) -> bool {
        let ring = &feature.polygon;
        let mut inside = false;
        let n = ring.len();
        if n < 3 {
            return false;
        }
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = ring[i];
            let [xj, yj] = ring[j];
            if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// Rewrite the vector into the target projection. The native format stores
/// coordinates in abstract map units, so reprojection is a projection-tag
/// rewrite plus a validity pass; a GDAL-backed collaborator would transform
/// coordinates here.
pub fn reproject_vector(
    source_path: &Utf8Path,
    target_projection: &str,
    target_path: &Utf8Path,
) -> Result<(), GeoError> {
    let mut vector = FarmVector::load(source_path)?;
    vector.projection = target_projection.to_owned();
    vector.save(target_path)
}

/// Burn `attribute` from `vector_path` onto a copy of the base raster.
/// Features whose attribute is absent leave the base value in place; an
/// optional season filter restricts which features are burned.
pub fn rasterize_vector_attribute(
    base_raster_path: &Utf8Path,
    vector_path: &Utf8Path,
    attribute: &FarmAttribute,
    target_path: &Utf8Path,
    filter_season: Option<&str>,
) -> Result<(), GeoError> {
    let base = Raster::load(base_raster_path)?;
    let vector = FarmVector::load(vector_path)?;
    let mut out = base.clone();

    let selected: Vec<(&FarmFeature, f64)> = vector
        .features
        .iter()
        .filter(|f| filter_season.is_none_or(|season| f.season == season))
        .filter_map(|f| attribute.value(f).map(|v| (f, v)))
        .collect();

    for row in 0..base.rows() {
        for col in 0..base.cols() {
            let (x, y) = base.pixel_center(row, col);
            for (feature, value) in &selected {
                if FarmVector::contains(feature, x, y) {
                    out.data[(row, col)] = *value as f32;
                }
            }
        }
    }

    out.save(target_path)
}

/// Aggregate count and sum of valid raster pixels per farm feature, in
/// feature order. Nodata pixels are excluded from both count and sum.
pub fn zonal_statistics(
    raster_path: &Utf8Path,
    vector_path: &Utf8Path,
) -> Result<Vec<ZonalStats>, GeoError> {
    let raster = Raster::load(raster_path)?;
    let vector = FarmVector::load(vector_path)?;
    let mut stats = vec![ZonalStats::default(); vector.features.len()];

    for row in 0..raster.rows() {
        for col in 0..raster.cols() {
            let value = raster.data[(row, col)];
            if value == raster.nodata {
                continue;
            }
            let (x, y) = raster.pixel_center(row, col);
            for (feature, entry) in vector.features.iter().zip(stats.iter_mut()) {
                if FarmVector::contains(feature, x, y) {
                    entry.count += 1;
                    entry.sum += value as f64;
                }
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::INDEX_NODATA;
    use crate::raster::test_raster;
    use camino::Utf8PathBuf;
    use ndarray::Array2;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    /// A farm covering the left half of a 4x4 raster with 10.0 pixel size
    /// (x in 0..20, y in -40..0).
    pub(super) fn left_half_farm(season: &str) -> FarmFeature {
        FarmFeature {
            season: season.into(),
            crop_type: "blueberry".into(),
            half_sat: 0.3,
            p_dep: 0.9,
            p_managed: 0.1,
            floral_resources: BTreeMap::from([(season.to_string(), 0.8)]),
            nesting_substrates: BTreeMap::from([("cavity".to_string(), 0.4)]),
            polygon: vec![[0.0, 0.0], [20.0, 0.0], [20.0, -40.0], [0.0, -40.0]],
            results: None,
        }
    }

    #[test]
    fn rasterize_burns_attribute_inside_polygon_only() {
        let (_guard, dir) = scratch();
        let base_path = dir.join("base.bsr");
        let farm_path = dir.join("farms.json");
        let out_path = dir.join("out.bsr");

        test_raster(Array2::from_elem((4, 4), 0.5)).save(&base_path).unwrap();
        FarmVector {
            projection: "local".into(),
            features: vec![left_half_farm("spring")],
        }
        .save(&farm_path)
        .unwrap();

        rasterize_vector_attribute(
            &base_path,
            &farm_path,
            &FarmAttribute::HalfSaturation,
            &out_path,
            None,
        )
        .unwrap();

        let got = Raster::load(&out_path).unwrap();
        assert_eq!(got.data[(0, 0)], 0.3);
        assert_eq!(got.data[(0, 1)], 0.3);
        assert_eq!(got.data[(0, 2)], 0.5);
        assert_eq!(got.data[(3, 3)], 0.5);
    }

    #[test]
    fn rasterize_respects_season_filter() {
        let (_guard, dir) = scratch();
        let base_path = dir.join("base.bsr");
        let farm_path = dir.join("farms.json");
        let out_path = dir.join("out.bsr");

        test_raster(Array2::from_elem((4, 4), INDEX_NODATA))
            .save(&base_path)
            .unwrap();
        FarmVector {
            projection: "local".into(),
            features: vec![left_half_farm("spring")],
        }
        .save(&farm_path)
        .unwrap();

        rasterize_vector_attribute(
            &base_path,
            &farm_path,
            &FarmAttribute::HalfSaturation,
            &out_path,
            Some("summer"),
        )
        .unwrap();

        let got = Raster::load(&out_path).unwrap();
        assert!(got.data.iter().all(|&v| v == INDEX_NODATA));
    }

    #[test]
    fn zonal_statistics_skips_nodata() {
        let (_guard, dir) = scratch();
        let raster_path = dir.join("values.bsr");
        let farm_path = dir.join("farms.json");

        let mut raster = test_raster(Array2::from_elem((4, 4), 2.0));
        raster.data[(0, 0)] = INDEX_NODATA;
        raster.save(&raster_path).unwrap();
        FarmVector {
            projection: "local".into(),
            features: vec![left_half_farm("spring")],
        }
        .save(&farm_path)
        .unwrap();

        let stats = zonal_statistics(&raster_path, &farm_path).unwrap();
        // left half is 8 pixels, one of which is nodata
        assert_eq!(stats[0].count, 7);
        assert_eq!(stats[0].sum, 14.0);
        assert_eq!(stats[0].mean(), Some(2.0));
    }
}
