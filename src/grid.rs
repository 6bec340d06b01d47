//! Numeric grids with geotransform metadata.
//!
//! Row 0 is the northern edge. All grids consumed together by one stage must
//! share shape and pixel size; derived grids copy the source geotransform.

use ndarray::{Array2, ArrayView2, Zip};
use ndarray_stats::QuantileExt;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolarError};

/// Nodata sentinel used by every raster this crate reads or writes.
pub const NODATA: f64 = -9999.0;

/// Affine transformation in GDAL coefficient order.
///
/// ```text
/// x = origin_x + col * pixel_width + row * row_rotation
/// y = origin_y + col * col_rotation + row * pixel_height
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    /// Usually negative for north-up rasters.
    pub pixel_height: f64,
    pub row_rotation: f64,
    pub col_rotation: f64,
}

impl GeoTransform {
    /// North-up transform with no rotation.
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            row_rotation: 0.0,
            col_rotation: 0.0,
        }
    }

    pub fn from_gdal(coeffs: [f64; 6]) -> Self {
        Self {
            origin_x: coeffs[0],
            pixel_width: coeffs[1],
            row_rotation: coeffs[2],
            origin_y: coeffs[3],
            col_rotation: coeffs[4],
            pixel_height: coeffs[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            self.row_rotation,
            self.origin_y,
            self.col_rotation,
            self.pixel_height,
        ]
    }

    /// Pixels per ground unit, the `scale` the raster kernels work in.
    pub fn scale(&self) -> Result<f64> {
        if !(self.pixel_width.is_finite() && self.pixel_width > 0.0) {
            return Err(SolarError::Precondition(format!(
                "pixel width must be positive, got {}",
                self.pixel_width
            )));
        }
        Ok(1.0 / self.pixel_width)
    }

    pub fn cell_size(&self) -> f64 {
        self.pixel_width.abs()
    }

    /// Centre of pixel (col, row) in ground coordinates.
    pub fn pixel_to_geo(&self, col: usize, row: usize) -> (f64, f64) {
        let col_f = col as f64 + 0.5;
        let row_f = row as f64 + 0.5;
        (
            self.origin_x + col_f * self.pixel_width + row_f * self.row_rotation,
            self.origin_y + col_f * self.col_rotation + row_f * self.pixel_height,
        )
    }

    /// Lower-left corner (minx, miny) of a `rows` x `cols` raster.
    pub fn lower_left(&self, rows: usize, cols: usize) -> (f64, f64) {
        let miny =
            self.origin_y + cols as f64 * self.col_rotation + rows as f64 * self.pixel_height;
        (self.origin_x, miny)
    }
}

/// Integer ground-unit bounding box of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub xmin: i64,
    pub xmax: i64,
    pub ymin: i64,
    pub ymax: i64,
}

impl Extent {
    pub fn new(xmin: i64, xmax: i64, ymin: i64, ymax: i64) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// Coordinates truncate toward zero.
    pub fn from_transform(transform: &GeoTransform, rows: usize, cols: usize) -> Self {
        let x0 = transform.origin_x;
        let x1 = transform.origin_x + cols as f64 * transform.pixel_width;
        let y0 = transform.origin_y;
        let y1 = transform.origin_y + rows as f64 * transform.pixel_height;
        Self {
            xmin: x0.min(x1) as i64,
            xmax: x0.max(x1) as i64,
            ymin: y0.min(y1) as i64,
            ymax: y0.max(y1) as i64,
        }
    }

    pub fn width(&self) -> i64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> i64 {
        self.ymax - self.ymin
    }

    pub fn covers(&self, other: &Extent) -> bool {
        self.xmin <= other.xmin
            && self.xmax >= other.xmax
            && self.ymin <= other.ymin
            && self.ymax >= other.ymax
    }
}

/// Ground bounding box of a raster at full precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Bounds {
    pub fn from_transform(transform: &GeoTransform, rows: usize, cols: usize) -> Self {
        let x0 = transform.origin_x;
        let x1 = transform.origin_x + cols as f64 * transform.pixel_width;
        let y0 = transform.origin_y;
        let y1 = transform.origin_y + rows as f64 * transform.pixel_height;
        Self {
            xmin: x0.min(x1),
            xmax: x0.max(x1),
            ymin: y0.min(y1),
            ymax: y0.max(y1),
        }
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }
}

impl From<Extent> for Bounds {
    fn from(e: Extent) -> Self {
        Self {
            xmin: e.xmin as f64,
            xmax: e.xmax as f64,
            ymin: e.ymin as f64,
            ymax: e.ymax as f64,
        }
    }
}

/// A single-band raster: values, geotransform and nodata sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    data: Array2<f64>,
    transform: GeoTransform,
    nodata: f64,
}

impl Grid {
    pub fn new(data: Array2<f64>, transform: GeoTransform) -> Self {
        Self {
            data,
            transform,
            nodata: NODATA,
        }
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = nodata;
        self
    }

    /// New grid on the same raster frame as `self`.
    pub fn derive(&self, data: Array2<f64>) -> Result<Grid> {
        if data.dim() != self.data.dim() {
            return Err(SolarError::ShapeMismatch {
                name: "derived grid".into(),
                expected: self.data.dim(),
                actual: data.dim(),
            });
        }
        Ok(Grid {
            data,
            transform: self.transform,
            nodata: self.nodata,
        })
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn into_data(self) -> Array2<f64> {
        self.data
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn nodata(&self) -> f64 {
        self.nodata
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn scale(&self) -> Result<f64> {
        self.transform.scale()
    }

    pub fn extent(&self) -> Extent {
        let (rows, cols) = self.dim();
        Extent::from_transform(&self.transform, rows, cols)
    }

    /// Untruncated ground bounds, for aligning grids of different resolution.
    pub fn bounds(&self) -> Bounds {
        let (rows, cols) = self.dim();
        Bounds::from_transform(&self.transform, rows, cols)
    }

    pub fn is_nodata(&self, v: f64) -> bool {
        v.is_nan() || v == self.nodata
    }

    /// Fails with a shape mismatch unless `other` has the same dimensions
    /// and pixel size.
    pub fn ensure_same_frame(&self, other: &Grid, name: &str) -> Result<()> {
        ensure_same_shape(self.view(), other.view(), name)?;
        if (self.transform.pixel_width - other.transform.pixel_width).abs() > 1e-9
            || (self.transform.pixel_height - other.transform.pixel_height).abs() > 1e-9
        {
            return Err(SolarError::Precondition(format!(
                "grid '{name}' has pixel size {}x{}, expected {}x{}",
                other.transform.pixel_width,
                other.transform.pixel_height,
                self.transform.pixel_width,
                self.transform.pixel_height
            )));
        }
        Ok(())
    }

    /// Surface model ready for ray casting: nodata becomes 0 and, if any
    /// value is negative, the whole grid is lifted so the minimum is 0.
    pub fn prepared_surface(&self) -> Grid {
        let nodata = self.nodata;
        let mut data = self
            .data
            .mapv(|v| if v.is_nan() || v == nodata { 0.0 } else { v });
        if let Ok(&min) = data.min() {
            if min < 0.0 {
                let shift = min.abs();
                data.par_mapv_inplace(|v| v + shift);
            }
        }
        Grid {
            data,
            transform: self.transform,
            nodata,
        }
    }

    /// Median of the valid cells, averaging the middle pair for even counts.
    pub fn median(&self) -> Option<f64> {
        let mut values: Vec<f64> = self
            .data
            .iter()
            .copied()
            .filter(|v| !self.is_nodata(*v))
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            Some((values[mid - 1] + values[mid]) / 2.0)
        } else {
            Some(values[mid])
        }
    }

    pub fn max_value(&self) -> Option<f64> {
        self.data.max().ok().copied()
    }
}

pub(crate) fn ensure_same_shape(
    reference: ArrayView2<f64>,
    other: ArrayView2<f64>,
    name: &str,
) -> Result<()> {
    if reference.dim() != other.dim() {
        return Err(SolarError::ShapeMismatch {
            name: name.to_string(),
            expected: reference.dim(),
            actual: other.dim(),
        });
    }
    Ok(())
}

/// One reclassification rule: values in `(min, max]` become `value`.
///
/// A missing bound is open on that side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReclassRule {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub value: f64,
}

impl ReclassRule {
    pub fn new(min: Option<f64>, max: Option<f64>, value: f64) -> Self {
        Self { min, max, value }
    }

    fn matches(&self, v: f64) -> bool {
        self.min.map_or(true, |lo| v > lo) && self.max.map_or(true, |hi| v <= hi)
    }
}

/// Reclassify by table. The first matching rule wins; values that match no
/// rule are kept, as is nodata.
pub fn reclassify(data: ArrayView2<f64>, rules: &[ReclassRule], nodata: f64) -> Array2<f64> {
    let mut out = data.to_owned();
    Zip::from(&mut out).par_for_each(|v| {
        if v.is_nan() || *v == nodata {
            return;
        }
        if let Some(rule) = rules.iter().find(|r| r.matches(*v)) {
            *v = rule.value;
        }
    });
    out
}
