//! Interfaces to the external geoprocessing engine.
//!
//! Vector operations and CRS transforms are delegated to whatever GIS engine
//! hosts the crate. The roof pipeline depends only on these traits. Zonal
//! means and polygon masking have in-crate defaults that sample pixel
//! centres.

use std::collections::BTreeMap;

use geo::{Area, BoundingRect, Centroid, Contains, Point, Polygon};
use ndarray::Array2;
use rayon::prelude::*;

use crate::error::Result;
use crate::grid::Grid;

/// A polygon with numeric attributes. Features whose geometry could not be
/// produced or repaired carry `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Feature {
    pub geometry: Option<Polygon<f64>>,
    pub attributes: BTreeMap<String, f64>,
}

impl Feature {
    pub fn new(geometry: Polygon<f64>) -> Self {
        Self {
            geometry: Some(geometry),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: f64) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).copied()
    }

    /// Planar area in squared ground units; 0 without geometry.
    pub fn area(&self) -> f64 {
        self.geometry.as_ref().map_or(0.0, |g| g.unsigned_area())
    }

    pub fn centroid(&self) -> Option<Point<f64>> {
        self.geometry.as_ref().and_then(|g| g.centroid())
    }

    /// Missing, empty or non-finite geometry.
    pub fn is_degenerate(&self) -> bool {
        let area = self.area();
        !(area.is_finite() && area > 0.0) || self.centroid().is_none()
    }
}

/// Vector operations of the host engine.
pub trait GeometryEngine: Sync {
    /// One feature per connected region of equal value, with the value
    /// stored under `field`.
    fn polygonize(&self, raster: &Grid, field: &str) -> Result<Vec<Feature>>;

    fn buffer(&self, features: &[Feature], distance: f64) -> Result<Vec<Feature>>;

    /// Pairwise overlaps of two layers, carrying the attributes of both.
    fn intersection(&self, a: &[Feature], b: &[Feature]) -> Result<Vec<Feature>>;

    fn fix_geometries(&self, features: &[Feature]) -> Result<Vec<Feature>>;

    fn clip(&self, features: &[Feature], boundary: &[Feature]) -> Result<Vec<Feature>>;

    /// Split multi-part features into one feature per part.
    fn to_single_parts(&self, features: &[Feature]) -> Result<Vec<Feature>>;

    fn reproject(&self, features: &[Feature], from_epsg: u32, to_epsg: u32) -> Result<Vec<Feature>>;
}

/// Raster operations of the host engine.
pub trait RasterEngine: Sync {
    /// Replace connected regions smaller than `threshold` pixels with their
    /// largest neighbour.
    fn sieve(&self, raster: &Grid, threshold: usize) -> Result<Grid>;

    /// Nodata outside the union of `mask`.
    fn clip_to_polygons(&self, raster: &Grid, mask: &[Feature]) -> Result<Grid> {
        Ok(clip_to_polygons(raster, mask))
    }

    /// Mean of the valid pixels whose centres fall inside each zone, or
    /// `None` where a zone covers no valid pixel.
    fn zonal_mean(&self, raster: &Grid, zones: &[Feature]) -> Result<Vec<Option<f64>>> {
        Ok(zonal_mean(raster, zones))
    }
}

/// Projected ground coordinates to WGS84 (longitude, latitude).
pub trait CoordinateTransform {
    fn to_wgs84(&self, x: f64, y: f64) -> Result<(f64, f64)>;
}

/// Pixel index window covering a polygon's bounding box.
fn pixel_window(raster: &Grid, polygon: &Polygon<f64>) -> Option<(usize, usize, usize, usize)> {
    let rect = polygon.bounding_rect()?;
    let gt = raster.transform();
    let (rows, cols) = raster.dim();
    let cw = gt.pixel_width.abs();
    let ch = gt.pixel_height.abs();
    if !(cw > 0.0 && ch > 0.0) {
        return None;
    }
    let c0 = ((rect.min().x - gt.origin_x) / cw).floor().max(0.0) as usize;
    let c1 = (((rect.max().x - gt.origin_x) / cw).ceil().max(0.0) as usize).min(cols);
    let r0 = ((gt.origin_y - rect.max().y) / ch).floor().max(0.0) as usize;
    let r1 = (((gt.origin_y - rect.min().y) / ch).ceil().max(0.0) as usize).min(rows);
    (c0 < c1 && r0 < r1).then_some((r0, r1, c0, c1))
}

/// Zonal mean by pixel-centre sampling.
pub fn zonal_mean(raster: &Grid, zones: &[Feature]) -> Vec<Option<f64>> {
    zones
        .par_iter()
        .map(|zone| {
            let polygon = zone.geometry.as_ref()?;
            let (r0, r1, c0, c1) = pixel_window(raster, polygon)?;
            let mut sum = 0.0;
            let mut count = 0usize;
            for row in r0..r1 {
                for col in c0..c1 {
                    let v = raster.data()[[row, col]];
                    if raster.is_nodata(v) {
                        continue;
                    }
                    let (x, y) = raster.transform().pixel_to_geo(col, row);
                    if polygon.contains(&Point::new(x, y)) {
                        sum += v;
                        count += 1;
                    }
                }
            }
            (count > 0).then(|| sum / count as f64)
        })
        .collect()
}

/// Keep only pixels whose centres fall inside one of `mask`.
pub fn clip_to_polygons(raster: &Grid, mask: &[Feature]) -> Grid {
    let mut inside = Array2::<bool>::from_elem(raster.dim(), false);
    for polygon in mask.iter().filter_map(|f| f.geometry.as_ref()) {
        let Some((r0, r1, c0, c1)) = pixel_window(raster, polygon) else {
            continue;
        };
        for row in r0..r1 {
            for col in c0..c1 {
                if !inside[[row, col]] {
                    let (x, y) = raster.transform().pixel_to_geo(col, row);
                    inside[[row, col]] = polygon.contains(&Point::new(x, y));
                }
            }
        }
    }
    let nodata = raster.nodata();
    let mut data = raster.data().clone();
    ndarray::Zip::from(&mut data)
        .and(&inside)
        .par_for_each(|v, &keep| {
            if !keep {
                *v = nodata;
            }
        });
    Grid::new(data, *raster.transform()).with_nodata(nodata)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::grid::{GeoTransform, NODATA};
    use geo::polygon;
    use ndarray::array;

    pub(crate) fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
            (x: x0, y: y0),
        ]
    }

    fn grid() -> Grid {
        // 4x4, origin (0, 4), 1 m pixels
        Grid::new(
            array![
                [1.0, 2.0, 3.0, 4.0],
                [5.0, 6.0, 7.0, 8.0],
                [9.0, 10.0, NODATA, 12.0],
                [13.0, 14.0, 15.0, 16.0]
            ],
            GeoTransform::new(0.0, 4.0, 1.0, -1.0),
        )
    }

    #[test]
    fn feature_geometry_helpers() {
        let f = Feature::new(square(0.0, 0.0, 4.0)).with_attribute("id", 3.0);
        assert_eq!(f.area(), 16.0);
        assert_eq!(f.centroid(), Some(Point::new(2.0, 2.0)));
        assert_eq!(f.attribute("id"), Some(3.0));
        assert!(!f.is_degenerate());
        assert!(Feature::default().is_degenerate());
        let sliver = Feature::new(polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0)]);
        assert!(sliver.is_degenerate());
    }

    #[test]
    fn zonal_mean_samples_pixel_centres() {
        let zones = vec![
            // top-left 2x2: rows 0-1, cols 0-1
            Feature::new(square(0.0, 2.0, 2.0)),
            // bottom-right 2x2 with one nodata cell
            Feature::new(square(2.0, 0.0, 2.0)),
            // outside the grid
            Feature::new(square(10.0, 10.0, 1.0)),
            Feature::default(),
        ];
        let means = zonal_mean(&grid(), &zones);
        assert_eq!(means[0], Some(3.5));
        assert_eq!(means[1], Some((12.0 + 15.0 + 16.0) / 3.0));
        assert_eq!(means[2], None);
        assert_eq!(means[3], None);
    }

    #[test]
    fn clip_masks_outside() {
        let clipped = clip_to_polygons(&grid(), &[Feature::new(square(0.0, 3.0, 1.0))]);
        assert_eq!(clipped.data()[[0, 0]], 1.0);
        assert_eq!(clipped.data()[[0, 1]], NODATA);
        assert_eq!(clipped.data()[[3, 3]], NODATA);
        assert_eq!(clipped.transform(), grid().transform());
    }
}
