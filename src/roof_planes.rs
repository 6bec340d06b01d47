//! Roof-plane extraction.
//!
//! Raster preparation (height above terrain, Horn slope and aspect, class
//! tables) runs in-crate. Sieving, polygon work and clipping go through the
//! engine traits. The result is one feature per roof plane carrying the
//! zonal means the suitability filter needs.

use crate::engine::{Feature, GeometryEngine, RasterEngine};
use crate::error::Result;
use crate::grid::Grid;
use crate::progress::{Completion, RunContext};
use crate::roofs::{attr, RoofPlane};
use crate::terrain::{
    above_threshold, aspect_classes, aspect_components, elevation_difference, horn_aspect,
    horn_slope, slope_classes,
};

/// Minimum region size, in pixels, kept by the aspect sieve.
pub const ASPECT_SIEVE_PIXELS: usize = 2;
pub const SLOPE_SIEVE_PIXELS: usize = 12;
/// Buffer around building footprints before rasters are clipped, metres.
pub const BUILDING_BUFFER: f64 = 2.0;
/// Inward-then-outward buffer that strips slivers from plane outlines.
pub const SLIVER_BUFFER: f64 = 0.8;
/// Outward-then-inward buffer that closes small gaps.
pub const GAP_BUFFER: f64 = 1.0;

const ASPECT_FIELD: &str = "aspect_class";
const SLOPE_FIELD: &str = "slope_class";

/// Inputs clipped to the study area.
pub struct RoofSources<'a> {
    pub dsm: &'a Grid,
    pub dtm: &'a Grid,
    pub buildings: &'a [Feature],
    pub boundary: &'a [Feature],
}

fn add_zonal_means(
    raster: &dyn RasterEngine,
    planes: &mut [Feature],
    grid: &Grid,
    name: &str,
) -> Result<()> {
    let means = raster.zonal_mean(grid, planes)?;
    for (plane, mean) in planes.iter_mut().zip(means) {
        if let Some(m) = mean {
            plane.attributes.insert(name.to_string(), m);
        }
    }
    Ok(())
}

/// Run the roof-plane chain. Each returned feature carries `C_mean`,
/// `S_mean` and `Slope_mean` where its zone covered valid pixels.
pub fn extract_roof_planes(
    sources: &RoofSources<'_>,
    height_threshold: f64,
    geometry: &dyn GeometryEngine,
    raster: &dyn RasterEngine,
    ctx: &RunContext<'_>,
) -> Result<Completion<Vec<Feature>>> {
    macro_rules! step {
        ($fraction:expr) => {
            if ctx.is_cancelled() {
                return Ok(Completion::Cancelled(Vec::new()));
            }
            ctx.report($fraction);
        };
    }

    let ndsm = elevation_difference(sources.dsm, sources.dtm)?;
    let aspect = horn_aspect(&ndsm);
    let slope = horn_slope(&ndsm);

    let raised = above_threshold(&ndsm, height_threshold)?;
    let aspect_raised = aspect_classes(&horn_aspect(&raised))?;
    let slope_raised = slope_classes(&horn_slope(&raised))?;
    step!(0.1);

    let aspect_sieved = raster.sieve(&aspect_raised, ASPECT_SIEVE_PIXELS)?;
    let slope_sieved = raster.sieve(&slope_raised, SLOPE_SIEVE_PIXELS)?;
    let (sin, cos) = aspect_components(&aspect)?;
    step!(0.2);

    let local_buildings = geometry.clip(sources.buildings, sources.boundary)?;
    let buffered = geometry.buffer(&local_buildings, BUILDING_BUFFER)?;
    step!(0.3);

    let aspect_roofs = raster.clip_to_polygons(&aspect_sieved, &buffered)?;
    let slope_roofs = raster.clip_to_polygons(&slope_sieved, &buffered)?;
    let aspect_polys = geometry.fix_geometries(&geometry.polygonize(&aspect_roofs, ASPECT_FIELD)?)?;
    let slope_polys = geometry.fix_geometries(&geometry.polygonize(&slope_roofs, SLOPE_FIELD)?)?;
    step!(0.5);

    let planes = geometry.intersection(&aspect_polys, &slope_polys)?;
    let planes = geometry.buffer(&geometry.buffer(&planes, -SLIVER_BUFFER)?, SLIVER_BUFFER)?;
    let planes = geometry.to_single_parts(&planes)?;
    let mut planes = geometry.buffer(&geometry.buffer(&planes, GAP_BUFFER)?, -GAP_BUFFER)?;
    step!(0.7);

    add_zonal_means(raster, &mut planes, &cos, attr::COS_MEAN)?;
    add_zonal_means(raster, &mut planes, &sin, attr::SIN_MEAN)?;
    add_zonal_means(raster, &mut planes, &slope, attr::SLOPE_MEAN)?;
    ctx.report(1.0);

    tracing::info!(
        buildings = local_buildings.len(),
        planes = planes.len(),
        "roof planes extracted"
    );
    Ok(Completion::Finished(planes))
}

/// Add seasonal shade and annual energy means and convert to roof planes.
pub fn attach_energy_statistics(
    planes: &[Feature],
    shade: &Grid,
    energy: &Grid,
    raster: &dyn RasterEngine,
) -> Result<Vec<RoofPlane>> {
    shade.ensure_same_frame(energy, "energy")?;
    let mut planes = planes.to_vec();
    add_zonal_means(raster, &mut planes, shade, attr::SHADE_MEAN)?;
    add_zonal_means(raster, &mut planes, energy, attr::IRRAD_MEAN)?;
    Ok(planes.iter().map(RoofPlane::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::square;
    use crate::grid::GeoTransform;
    use crate::progress::{CancelToken, NoProgress};
    use geo::{BoundingRect, Polygon};
    use ndarray::{s, Array2};
    use std::sync::Mutex;

    /// Records calls; polygonize yields the raster's full frame.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn frame(grid: &Grid) -> Polygon<f64> {
        let e = grid.extent();
        square(e.xmin as f64, e.ymin as f64, e.width() as f64)
    }

    impl GeometryEngine for Recorder {
        fn polygonize(&self, raster: &Grid, field: &str) -> Result<Vec<Feature>> {
            self.log(format!("polygonize {field}"));
            let value = raster
                .data()
                .iter()
                .copied()
                .find(|v| !raster.is_nodata(*v))
                .unwrap_or(0.0);
            Ok(vec![Feature::new(frame(raster)).with_attribute(field, value)])
        }
        fn buffer(&self, f: &[Feature], distance: f64) -> Result<Vec<Feature>> {
            self.log(format!("buffer {distance}"));
            Ok(f.to_vec())
        }
        fn intersection(&self, a: &[Feature], b: &[Feature]) -> Result<Vec<Feature>> {
            self.log("intersection".into());
            let mut out = Vec::new();
            for fa in a {
                for fb in b {
                    let mut f = fa.clone();
                    f.attributes.extend(fb.attributes.clone());
                    out.push(f);
                }
            }
            Ok(out)
        }
        fn fix_geometries(&self, f: &[Feature]) -> Result<Vec<Feature>> {
            self.log("fix".into());
            Ok(f.to_vec())
        }
        fn clip(&self, f: &[Feature], _: &[Feature]) -> Result<Vec<Feature>> {
            self.log("clip".into());
            Ok(f.to_vec())
        }
        fn to_single_parts(&self, f: &[Feature]) -> Result<Vec<Feature>> {
            self.log("single parts".into());
            Ok(f.to_vec())
        }
        fn reproject(&self, f: &[Feature], _: u32, _: u32) -> Result<Vec<Feature>> {
            Ok(f.to_vec())
        }
    }

    impl RasterEngine for Recorder {
        fn sieve(&self, raster: &Grid, threshold: usize) -> Result<Grid> {
            self.log(format!("sieve {threshold}"));
            Ok(raster.clone())
        }
    }

    fn gable_roof() -> (Grid, Grid) {
        // 12x12 at 1 m, a south-facing lean-to on rows 3..9, cols 3..9
        let mut dsm = Array2::<f64>::zeros((12, 12));
        for r in 3..9 {
            dsm.slice_mut(s![r, 3..9]).fill(5.0 + (9 - r) as f64 * 0.5);
        }
        let gt = GeoTransform::new(0.0, 12.0, 1.0, -1.0);
        (Grid::new(dsm, gt), Grid::new(Array2::zeros((12, 12)), gt))
    }

    #[test]
    fn extraction_runs_the_engine_chain() {
        let (dsm, dtm) = gable_roof();
        let building = Feature::new(square(3.0, 3.0, 6.0));
        let sources = RoofSources {
            dsm: &dsm,
            dtm: &dtm,
            buildings: std::slice::from_ref(&building),
            boundary: std::slice::from_ref(&building),
        };
        let engine = Recorder::default();
        let cancel = CancelToken::new();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let planes = extract_roof_planes(&sources, 2.0, &engine, &engine, &ctx)
            .unwrap()
            .finished()
            .unwrap();

        assert_eq!(
            engine.calls(),
            vec![
                "sieve 2",
                "sieve 12",
                "clip",
                "buffer 2",
                "polygonize aspect_class",
                "fix",
                "polygonize slope_class",
                "fix",
                "intersection",
                "buffer -0.8",
                "buffer 0.8",
                "single parts",
                "buffer 1",
                "buffer -1",
            ]
        );
        assert_eq!(planes.len(), 1);
        let plane = &planes[0];
        assert!(plane.attribute(attr::COS_MEAN).is_some());
        assert!(plane.attribute(attr::SIN_MEAN).is_some());
        assert!(plane.attribute(attr::SLOPE_MEAN).unwrap() > 0.0);
        assert!(plane.attribute(ASPECT_FIELD).is_some());
        assert!(plane.attribute(SLOPE_FIELD).is_some());
        let rect = plane.geometry.as_ref().and_then(|g| g.bounding_rect()).unwrap();
        assert_eq!(rect.width(), 12.0);
    }

    #[test]
    fn cancelled_extraction_yields_nothing() {
        let (dsm, dtm) = gable_roof();
        let sources = RoofSources {
            dsm: &dsm,
            dtm: &dtm,
            buildings: &[],
            boundary: &[],
        };
        let engine = Recorder::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let out = extract_roof_planes(&sources, 2.0, &engine, &engine, &ctx).unwrap();
        assert!(out.is_cancelled());
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn energy_statistics_become_roof_planes() {
        let gt = GeoTransform::new(0.0, 4.0, 1.0, -1.0);
        let shade = Grid::new(Array2::from_elem((4, 4), 1.0), gt);
        let mut energy = Array2::from_elem((4, 4), 800.0);
        energy.slice_mut(s![0..2, ..]).fill(1000.0);
        let energy = Grid::new(energy, gt);

        let planes = vec![
            Feature::new(square(0.0, 0.0, 4.0))
                .with_attribute(attr::COS_MEAN, -1.0)
                .with_attribute(attr::SIN_MEAN, 0.0)
                .with_attribute(attr::SLOPE_MEAN, 5.0),
            Feature::default(),
        ];
        let roofs = attach_energy_statistics(&planes, &shade, &energy, &Recorder::default()).unwrap();
        assert_eq!(roofs.len(), 2);
        assert_eq!(roofs[0].shade_mean, 1.0);
        assert_eq!(roofs[0].irradiance_mean, 900.0);
        assert_eq!(roofs[0].cos_mean, -1.0);
        assert!(roofs[1].geometry.is_none());
        assert!(roofs[1].irradiance_mean.is_nan());
    }
}
