//! Native raster backend.
//!
//! Rasters are ndarray-backed f32 grids with north-up georeferencing,
//! serialized to disk as CBOR. This module implements the geoprocessing
//! primitives the pipeline consumes: reclassification, the raster calculator,
//! nodata-aware spatial convolution, and decay-kernel construction.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};

use camino::{Utf8Path, Utf8PathBuf};
use ndarray::{Array2, ArrayView2};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::error::GeoError;
use crate::kernel::KernelSpec;

/// A georeferenced 2D raster grid, row-major, north-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Raster {
    pub data: Array2<f32>,
    /// Square pixel edge length in map units.
    pub pixel_size: f64,
    /// Map coordinates of the top-left corner of pixel (0, 0).
    pub origin_x: f64,
    pub origin_y: f64,
    pub projection: String,
    pub nodata: f32,
}

/// Metadata subset exposed without loading the full grid.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMeta {
    pub pixel_size: f64,
    pub projection: String,
    pub nodata: f32,
    pub rows: usize,
    pub cols: usize,
}

impl Raster {
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Map coordinates of a pixel center.
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_size,
            self.origin_y - (row as f64 + 0.5) * self.pixel_size,
        )
    }

    /// A raster with identical georeferencing, filled with `value`.
    pub fn filled_like(&self, value: f32) -> Self {
        Self {
            data: Array2::from_elem(self.data.dim(), value),
            ..self.clone()
        }
    }

    pub fn load(path: &Utf8Path) -> Result<Self, GeoError> {
        let file = fs::File::open(path.as_std_path()).map_err(GeoError::Io)?;
        ciborium::from_reader(BufReader::new(file)).map_err(|err| GeoError::Decode {
            path: path.to_owned(),
            message: err.to_string(),
        })
    }

    /// Write the raster. The write goes through a sibling temp file and an
    /// atomic rename so a crashed task never leaves a partial artifact that
    /// a later cache check could mistake for a complete one.
    pub fn save(&self, path: &Utf8Path) -> Result<(), GeoError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir.as_std_path())?;
        }
        let tmp = path.with_extension("part");
        let file = fs::File::create(tmp.as_std_path())?;
        ciborium::into_writer(self, BufWriter::new(file)).map_err(|err| GeoError::Encode {
            path: path.to_owned(),
            message: err.to_string(),
        })?;
        fs::rename(tmp.as_std_path(), path.as_std_path())?;
        Ok(())
    }
}

pub fn get_raster_metadata(path: &Utf8Path) -> Result<RasterMeta, GeoError> {
    let raster = Raster::load(path)?;
    Ok(RasterMeta {
        pixel_size: raster.pixel_size,
        projection: raster.projection.clone(),
        nodata: raster.nodata,
        rows: raster.rows(),
        cols: raster.cols(),
    })
}

/// Map integer codes of `base` through `value_map`. With `values_required`
/// set, a code absent from the map is an error rather than nodata.
pub fn reclassify(
    base_path: &Utf8Path,
    value_map: &BTreeMap<i64, f64>,
    target_path: &Utf8Path,
    target_nodata: f32,
    values_required: bool,
) -> Result<(), GeoError> {
    let base = Raster::load(base_path)?;
    let mut out = base.filled_like(target_nodata);
    out.nodata = target_nodata;

    for (src, dst) in base.data.iter().zip(out.data.iter_mut()) {
        if *src == base.nodata {
            continue;
        }
        let code = src.round() as i64;
        match value_map.get(&code) {
            Some(&value) => *dst = value as f32,
            None if values_required => return Err(GeoError::UnmappedCode { code }),
            None => {}
        }
    }

    out.save(target_path)
}

/// Load all input bands, check shapes, apply `kernel`, save the result.
pub fn raster_calculator(
    band_paths: &[Utf8PathBuf],
    kernel: &KernelSpec,
    target_path: &Utf8Path,
    target_nodata: f32,
) -> Result<(), GeoError> {
    if band_paths.is_empty() {
        return Err(GeoError::EmptyBandList);
    }
    let mut bands = Vec::with_capacity(band_paths.len());
    for path in band_paths {
        bands.push(Raster::load(path)?);
    }
    let shape = bands[0].data.dim();
    for band in &bands[1..] {
        if band.data.dim() != shape {
            return Err(GeoError::ShapeMismatch(
                shape.0,
                shape.1,
                band.data.nrows(),
                band.data.ncols(),
            ));
        }
    }

    let views: Vec<ArrayView2<f32>> = bands.iter().map(|b| b.data.view()).collect();
    let data = kernel.apply(&views, target_nodata);

    let out = Raster {
        data,
        nodata: target_nodata,
        ..bands.swap_remove(0)
    };
    out.save(target_path)
}

/// Nodata-aware spatial convolution of `signal` with `kernel`.
///
/// `ignore_nodata` drops nodata signal pixels from the weighted sum;
/// `mask_nodata` carries the signal's nodata footprint to the output. The
/// kernel raster's georeferencing is ignored, only its weights matter.
pub fn convolve_2d(
    signal_path: &Utf8Path,
    kernel_path: &Utf8Path,
    target_path: &Utf8Path,
    ignore_nodata: bool,
    mask_nodata: bool,
    normalize_kernel: bool,
) -> Result<(), GeoError> {
    let signal = Raster::load(signal_path)?;
    let kernel = Raster::load(kernel_path)?;

    let mut weights = kernel.data.clone();
    if normalize_kernel {
        let total: f32 = weights.sum();
        if total != 0.0 {
            weights.mapv_inplace(|w| w / total);
        }
    }

    let (rows, cols) = signal.data.dim();
    let (krows, kcols) = weights.dim();
    let (kr0, kc0) = (krows as isize / 2, kcols as isize / 2);
    let nodata = signal.nodata;

    let out_rows: Vec<Vec<f32>> = (0..rows)
        .into_par_iter()
        .map(|r| {
            let mut out_row = vec![0.0f32; cols];
            for (c, out) in out_row.iter_mut().enumerate() {
                if mask_nodata && signal.data[(r, c)] == nodata {
                    *out = nodata;
                    continue;
                }
                let mut acc = 0.0f64;
                let mut hit_nodata = false;
                'window: for kr in 0..krows {
                    let sr = r as isize + kr as isize - kr0;
                    if sr < 0 || sr >= rows as isize {
                        continue;
                    }
                    for kc in 0..kcols {
                        let sc = c as isize + kc as isize - kc0;
                        if sc < 0 || sc >= cols as isize {
                            continue;
                        }
                        let v = signal.data[(sr as usize, sc as usize)];
                        if v == nodata {
                            if ignore_nodata {
                                continue;
                            }
                            hit_nodata = true;
                            break 'window;
                        }
                        acc += v as f64 * weights[(kr, kc)] as f64;
                    }
                }
                *out = if hit_nodata { nodata } else { acc as f32 };
            }
            out_row
        })
        .collect();

    let mut data = Array2::zeros((rows, cols));
    for (r, row) in out_rows.into_iter().enumerate() {
        for (c, v) in row.into_iter().enumerate() {
            data[(r, c)] = v;
        }
    }

    let out = Raster { data, ..signal };
    out.save(target_path)
}

/// Build an exponential decay convolution kernel raster for a species'
/// expected flight distance (in pixels). Weights are `exp(-d / alpha)`,
/// truncated at five alpha, normalized to sum 1.
pub fn exponential_decay_kernel(
    alpha_pixels: f64,
    target_path: &Utf8Path,
    pixel_size: f64,
    projection: &str,
) -> Result<(), GeoError> {
    let radius = (alpha_pixels * 5.0).ceil().max(1.0) as usize;
    let size = radius * 2 + 1;
    let mut data = Array2::zeros((size, size));
    let mut total = 0.0f64;

    for r in 0..size {
        for c in 0..size {
            let dr = r as f64 - radius as f64;
            let dc = c as f64 - radius as f64;
            let dist = (dr * dr + dc * dc).sqrt();
            if dist > radius as f64 {
                continue;
            }
            let weight = (-dist / alpha_pixels).exp();
            data[(r, c)] = weight as f32;
            total += weight;
        }
    }
    if total > 0.0 {
        data.mapv_inplace(|w| (w as f64 / total) as f32);
    }

    let out = Raster {
        data,
        pixel_size,
        origin_x: 0.0,
        origin_y: 0.0,
        projection: projection.to_owned(),
        nodata: crate::kernel::INDEX_NODATA,
    };
    out.save(target_path)
}

/// Build a linear decay convolution kernel raster: weights fall from 1 at
/// the center to 0 at `max_dist_pixels`, normalized to sum 1.
pub fn linear_decay_kernel(
    max_dist_pixels: f64,
    target_path: &Utf8Path,
    pixel_size: f64,
    projection: &str,
) -> Result<(), GeoError> {
    let radius = max_dist_pixels.ceil().max(1.0) as usize;
    let size = radius * 2 + 1;
    let mut data = Array2::zeros((size, size));
    let mut total = 0.0f64;

    for r in 0..size {
        for c in 0..size {
            let dr = r as f64 - radius as f64;
            let dc = c as f64 - radius as f64;
            let dist = (dr * dr + dc * dc).sqrt();
            if dist > max_dist_pixels {
                continue;
            }
            let weight = (max_dist_pixels - dist) / max_dist_pixels;
            data[(r, c)] = weight as f32;
            total += weight;
        }
    }
    if total > 0.0 {
        data.mapv_inplace(|w| (w as f64 / total) as f32);
    }

    let out = Raster {
        data,
        pixel_size,
        origin_x: 0.0,
        origin_y: 0.0,
        projection: projection.to_owned(),
        nodata: crate::kernel::INDEX_NODATA,
    };
    out.save(target_path)
}

/// No-data sentinel for rarity rasters. Rarity ratios can legitimately reach
/// any value below 1, so the shared index sentinel is not usable.
pub const RARITY_NODATA: f32 = -64329.0;

/// Per-code rarity of `cover` relative to `base`: `1 - area_x / area_b` for
/// each landcover code, 0 for codes absent from the baseline. The cover is
/// first trimmed to the baseline's valid footprint.
pub fn rarity_index(
    base_path: &Utf8Path,
    cover_path: &Utf8Path,
    target_path: &Utf8Path,
) -> Result<(), GeoError> {
    let base = Raster::load(base_path)?;
    let cover = Raster::load(cover_path)?;
    if base.data.dim() != cover.data.dim() {
        return Err(GeoError::ShapeMismatch(
            base.rows(),
            base.cols(),
            cover.rows(),
            cover.cols(),
        ));
    }

    let mut base_counts: BTreeMap<i64, u64> = BTreeMap::new();
    for &v in &base.data {
        if v != base.nodata {
            *base_counts.entry(v.round() as i64).or_default() += 1;
        }
    }
    let mut cover_counts: BTreeMap<i64, u64> = BTreeMap::new();
    for (&b, &c) in base.data.iter().zip(&cover.data) {
        if b != base.nodata && c != cover.nodata {
            *cover_counts.entry(c.round() as i64).or_default() += 1;
        }
    }

    let base_area = base.pixel_size * base.pixel_size;
    let cover_area = cover.pixel_size * cover.pixel_size;
    let ratios: BTreeMap<i64, f64> = cover_counts
        .iter()
        .map(|(&code, &count)| {
            let ratio = match base_counts.get(&code) {
                Some(&base_count) => {
                    1.0 - (count as f64 * cover_area) / (base_count as f64 * base_area)
                }
                None => 0.0,
            };
            (code, ratio)
        })
        .collect();

    let mut out = cover.filled_like(RARITY_NODATA);
    out.nodata = RARITY_NODATA;
    for ((&b, &c), dst) in base.data.iter().zip(&cover.data).zip(out.data.iter_mut()) {
        if b != base.nodata && c != cover.nodata {
            *dst = ratios[&(c.round() as i64)] as f32;
        }
    }
    out.save(target_path)
}

/// A copy of `base` with every pixel set to `fill`, used as the base layer
/// for farm attribute rasterization.
pub fn new_raster_from_base(
    base_path: &Utf8Path,
    target_path: &Utf8Path,
    fill: f32,
) -> Result<(), GeoError> {
    let base = Raster::load(base_path)?;
    base.filled_like(fill).save(target_path)
}

#[cfg(test)]
pub(crate) fn test_raster(data: Array2<f32>) -> Raster {
    Raster {
        data,
        pixel_size: 10.0,
        origin_x: 0.0,
        origin_y: 0.0,
        projection: "local".into(),
        nodata: crate::kernel::INDEX_NODATA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::INDEX_NODATA;
    use camino::Utf8PathBuf;
    use ndarray::array;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn save_load_roundtrip() {
        let (_guard, dir) = scratch();
        let path = dir.join("grid.bsr");
        let raster = test_raster(array![[1.0f32, 2.0], [3.0, INDEX_NODATA]]);
        raster.save(&path).unwrap();
        let loaded = Raster::load(&path).unwrap();
        assert_eq!(loaded.data, raster.data);
        assert_eq!(loaded.pixel_size, 10.0);
    }

    #[test]
    fn reclassify_maps_codes_and_keeps_nodata() {
        let (_guard, dir) = scratch();
        let base = dir.join("lulc.bsr");
        let out = dir.join("out.bsr");
        test_raster(array![[1.0f32, 2.0], [INDEX_NODATA, 1.0]])
            .save(&base)
            .unwrap();

        let map = BTreeMap::from([(1, 0.5), (2, 0.9)]);
        reclassify(&base, &map, &out, INDEX_NODATA, true).unwrap();

        let got = Raster::load(&out).unwrap();
        assert_eq!(got.data, array![[0.5f32, 0.9], [INDEX_NODATA, 0.5]]);
    }

    #[test]
    fn reclassify_rejects_unmapped_code_when_required() {
        let (_guard, dir) = scratch();
        let base = dir.join("lulc.bsr");
        let out = dir.join("out.bsr");
        test_raster(array![[7.0f32]]).save(&base).unwrap();

        let map = BTreeMap::from([(1, 0.5)]);
        let err = reclassify(&base, &map, &out, INDEX_NODATA, true).unwrap_err();
        assert!(matches!(err, GeoError::UnmappedCode { code: 7 }));
    }

    #[test]
    fn convolution_masks_but_ignores_nodata() {
        let (_guard, dir) = scratch();
        let signal_path = dir.join("signal.bsr");
        let kernel_path = dir.join("kernel.bsr");
        let out_path = dir.join("out.bsr");

        test_raster(array![
            [1.0f32, INDEX_NODATA, 1.0],
            [1.0, 1.0, 1.0],
            [1.0, 1.0, 1.0]
        ])
        .save(&signal_path)
        .unwrap();
        // identity kernel
        test_raster(array![[0.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]])
            .save(&kernel_path)
            .unwrap();

        convolve_2d(&signal_path, &kernel_path, &out_path, true, true, false).unwrap();
        let got = Raster::load(&out_path).unwrap();
        assert_eq!(got.data[(0, 1)], INDEX_NODATA);
        assert_eq!(got.data[(1, 1)], 1.0);
    }

    #[test]
    fn linear_kernel_reaches_zero_at_max_distance() {
        let (_guard, dir) = scratch();
        let path = dir.join("kernel.bsr");
        linear_decay_kernel(2.0, &path, 10.0, "local").unwrap();
        let kernel = Raster::load(&path).unwrap();
        assert!((kernel.data.sum() - 1.0).abs() < 1e-4);
        let center = kernel.rows() / 2;
        // corners sit beyond max distance
        assert_eq!(kernel.data[(0, 0)], 0.0);
        let max = kernel.data.iter().cloned().fold(f32::MIN, f32::max);
        assert_eq!(kernel.data[(center, center)], max);
    }

    #[test]
    fn rarity_scores_shrinking_covers_higher() {
        let (_guard, dir) = scratch();
        let base_path = dir.join("base.bsr");
        let cover_path = dir.join("cover.bsr");
        let out_path = dir.join("rarity.bsr");
        test_raster(array![[1.0f32, 1.0], [2.0, 2.0]])
            .save(&base_path)
            .unwrap();
        test_raster(array![[1.0f32, 1.0], [1.0, 2.0]])
            .save(&cover_path)
            .unwrap();

        rarity_index(&base_path, &cover_path, &out_path).unwrap();
        let got = Raster::load(&out_path).unwrap();
        // code 1 expanded from 2 to 3 pixels, code 2 shrank from 2 to 1
        assert!((got.data[(0, 0)] + 0.5).abs() < 1e-6);
        assert!((got.data[(1, 1)] - 0.5).abs() < 1e-6);
        assert_eq!(got.nodata, RARITY_NODATA);
    }

    #[test]
    fn decay_kernel_is_normalized() {
        let (_guard, dir) = scratch();
        let path = dir.join("kernel.bsr");
        exponential_decay_kernel(1.5, &path, 10.0, "local").unwrap();
        let kernel = Raster::load(&path).unwrap();
        let total: f32 = kernel.data.sum();
        assert!((total - 1.0).abs() < 1e-4);
        // center carries the largest weight
        let center = kernel.rows() / 2;
        let max = kernel.data.iter().cloned().fold(f32::MIN, f32::max);
        assert_eq!(kernel.data[(center, center)], max);
    }
}
