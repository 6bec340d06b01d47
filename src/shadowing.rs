//! Heightfield shadow casting.
//!
//! The surface is shifted step by step along the sun's ground direction,
//! lowered by the sun's rise over that distance, and the running maximum is
//! kept. A cell is shadowed where that maximum stands above it. Outputs use
//! 1 for sunlit and 0 for shadowed.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, TAU};

use ndarray::{par_azip, s, Array2, ArrayView2, Zip};

#[cfg(feature = "python")]
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
#[cfg(feature = "python")]
use pyo3::prelude::*;

use crate::error::{Result, SolarError};
use crate::grid::ensure_same_shape;

const THREE_PI_OVER_4: f64 = 3.0 * FRAC_PI_4;
const FIVE_PI_OVER_4: f64 = 5.0 * FRAC_PI_4;
const SEVEN_PI_OVER_4: f64 = 7.0 * FRAC_PI_4;
/// Due north is nudged off zero so the quadrant arithmetic stays defined.
const NORTH_AZIMUTH: f64 = 1e-12;

/// Sunlit masks for the ground and wall heights for one sun position.
#[derive(Debug, Clone, PartialEq)]
pub struct WallShadowResult {
    /// 1 where the surface is sunlit.
    pub ground: Array2<f64>,
    /// Sunlit part of each wall, metres.
    pub wall_sun: Array2<f64>,
    /// Shadowed part of each wall, metres.
    pub wall_sh: Array2<f64>,
    /// 1 on wall pixels whose face points away from the sun.
    pub face_sh: Array2<f64>,
    /// 1 on wall pixels whose face points toward the sun.
    pub face_sun: Array2<f64>,
}

/// Shadow caster bound to one surface grid.
///
/// Surfaces are cast many times per run (once per time step or sky patch),
/// so the relief used to bound the march is computed once.
#[derive(Debug, Clone, Copy)]
pub struct ShadowCaster<'a> {
    dsm: ArrayView2<'a, f64>,
    scale: f64,
    relief: f64,
}

impl<'a> ShadowCaster<'a> {
    /// `scale` is pixels per metre.
    pub fn new(dsm: ArrayView2<'a, f64>, scale: f64) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(SolarError::invalid("scale", scale, "must be positive"));
        }
        let (lo, hi) = dsm
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let relief = if hi >= lo { hi - lo } else { 0.0 };
        Ok(Self { dsm, scale, relief })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dsm.dim()
    }

    /// Highest shadow-casting surface seen from each cell toward the sun.
    fn propagate(&self, azimuth_deg: f64, altitude_deg: f64) -> Result<Array2<f64>> {
        if !(altitude_deg > 0.0 && altitude_deg <= 90.0) {
            return Err(SolarError::invalid(
                "altitude",
                altitude_deg,
                "sun must be above the horizon",
            ));
        }
        if !azimuth_deg.is_finite() {
            return Err(SolarError::invalid("azimuth", azimuth_deg, "must be finite"));
        }
        let azimuth_deg = azimuth_deg.rem_euclid(360.0);
        let azimuth_deg = if azimuth_deg == 0.0 { NORTH_AZIMUTH } else { azimuth_deg };

        let dsm = self.dsm;
        let (rows, cols) = dsm.dim();
        let mut propagated = dsm.to_owned();

        let azimuth = azimuth_deg.to_radians();
        let (sin_azimuth, cos_azimuth) = azimuth.sin_cos();
        let tan_azimuth = azimuth.tan();
        let sign_sin = sin_azimuth.signum();
        let sign_cos = cos_azimuth.signum();
        let ds_sin = (1.0 / sin_azimuth).abs();
        let ds_cos = (1.0 / cos_azimuth).abs();
        let rise_per_pixel = altitude_deg.to_radians().tan() / self.scale;
        let steep_quadrant = (FRAC_PI_4..THREE_PI_OVER_4).contains(&azimuth)
            || (FIVE_PI_OVER_4..SEVEN_PI_OVER_4).contains(&azimuth);

        let mut dx = 0.0_f64;
        let mut dy = 0.0_f64;
        let mut dz = 0.0_f64;
        let mut index = 0.0_f64;

        while self.relief >= dz && dx.abs() < rows as f64 && dy.abs() < cols as f64 {
            let ds = if steep_quadrant {
                dy = sign_sin * index;
                dx = -sign_cos * (index / tan_azimuth).round().abs();
                ds_sin
            } else {
                dy = sign_sin * (index * tan_azimuth).round().abs();
                dx = -sign_cos * index;
                ds_cos
            };
            dz = ds * index * rise_per_pixel;

            // overlapping source/destination windows for the (dx, dy) shift
            let absdx = dx.abs();
            let absdy = dy.abs();
            let clamp_r = |v: f64| (v as isize).clamp(0, rows as isize) as usize;
            let clamp_c = |v: f64| (v as isize).clamp(0, cols as isize) as usize;
            let xc1 = clamp_r((dx + absdx) / 2.0);
            let xc2 = clamp_r(rows as f64 + (dx - absdx) / 2.0);
            let yc1 = clamp_c((dy + absdy) / 2.0);
            let yc2 = clamp_c(cols as f64 + (dy - absdy) / 2.0);
            let xp1 = clamp_r(-(dx - absdx) / 2.0);
            let xp2 = clamp_r(rows as f64 - (dx + absdx) / 2.0);
            let yp1 = clamp_c(-(dy - absdy) / 2.0);
            let yp2 = clamp_c(cols as f64 - (dy + absdy) / 2.0);

            if xc2 > xc1 && yc2 > yc1 && xp2 > xp1 && yp2 > yp1 {
                let h = (xc2 - xc1).min(xp2 - xp1);
                let w = (yc2 - yc1).min(yp2 - yp1);
                let src = dsm.slice(s![xc1..xc1 + h, yc1..yc1 + w]);
                let mut dst = propagated.slice_mut(s![xp1..xp1 + h, yp1..yp1 + w]);
                par_azip!((p in &mut dst, &z in &src) {
                    *p = p.max(z - dz);
                });
            }

            index += 1.0;
        }

        Ok(propagated)
    }

    /// Sunlit mask (1 lit, 0 shadowed) for a sun position in degrees.
    ///
    /// Fails with `InvalidParameter` when the sun is at or below the horizon.
    pub fn cast(&self, azimuth_deg: f64, altitude_deg: f64) -> Result<Array2<f64>> {
        let propagated = self.propagate(azimuth_deg, altitude_deg)?;
        Ok(sunlit_mask(self.dsm, &propagated))
    }

    /// Ground mask plus wall shading. `wall_aspect` is in radians.
    pub fn cast_with_walls(
        &self,
        walls: ArrayView2<f64>,
        wall_aspect: ArrayView2<f64>,
        azimuth_deg: f64,
        altitude_deg: f64,
    ) -> Result<WallShadowResult> {
        ensure_same_shape(self.dsm, walls, "walls")?;
        ensure_same_shape(self.dsm, wall_aspect, "wall aspect")?;
        let propagated = self.propagate(azimuth_deg, altitude_deg)?;
        let ground = sunlit_mask(self.dsm, &propagated);
        let azimuth = azimuth_deg.rem_euclid(360.0).to_radians();
        let walls = shade_on_walls(azimuth, wall_aspect, walls, self.dsm, propagated.view());
        Ok(WallShadowResult { ground, ..walls })
    }
}

fn sunlit_mask(dsm: ArrayView2<f64>, propagated: &Array2<f64>) -> Array2<f64> {
    let mut sh = Array2::<f64>::zeros(dsm.dim());
    par_azip!((out in &mut sh, &p in propagated, &z in &dsm) {
        *out = if p > z { 0.0 } else { 1.0 };
    });
    sh
}

/// Whether a wall facing `aspect` turns away from a sun at `azimuth` (both
/// radians clockwise from north).
fn faces_away(aspect: f64, azimuth: f64) -> bool {
    let low = azimuth - FRAC_PI_2;
    let high = azimuth + FRAC_PI_2;
    if low >= 0.0 && high < TAU {
        aspect < low || aspect >= high
    } else if low < 0.0 && high <= TAU {
        !(aspect > low + TAU || aspect <= high)
    } else {
        !(aspect > low || aspect <= high - TAU)
    }
}

fn shade_on_walls(
    azimuth: f64,
    aspect: ArrayView2<f64>,
    walls: ArrayView2<f64>,
    dsm: ArrayView2<f64>,
    propagated: ArrayView2<f64>,
) -> WallShadowResult {
    let shape = walls.dim();
    let mut face_sh = Array2::<f64>::zeros(shape);
    let mut face_sun = Array2::<f64>::zeros(shape);
    let mut wall_sun = Array2::<f64>::zeros(shape);
    let mut wall_sh = Array2::<f64>::zeros(shape);

    Zip::from(&mut face_sh)
        .and(&mut face_sun)
        .and(aspect)
        .and(walls)
        .par_for_each(|f_sh, f_sun, &asp, &wall_h| {
            if wall_h > 0.0 {
                let away = faces_away(asp, azimuth);
                *f_sh = if away { 1.0 } else { 0.0 };
                *f_sun = 1.0 - *f_sh;
            }
        });

    Zip::from(&mut wall_sun)
        .and(&mut wall_sh)
        .and(&face_sh)
        .and(walls)
        .and(dsm)
        .and(propagated)
        .par_for_each(|w_sun, w_sh, &f_sh, &wall_h, &z, &p| {
            if wall_h <= 0.0 {
                return;
            }
            // height of the shadow volume standing on this cell
            let shadow_depth = p - z;
            *w_sun = if f_sh == 1.0 { 0.0 } else { (wall_h - shadow_depth).max(0.0) };
            *w_sh = wall_h - *w_sun;
        });

    WallShadowResult {
        ground: Array2::zeros(shape),
        wall_sun,
        wall_sh,
        face_sh,
        face_sun,
    }
}

/// Sunlit mask for a surface grid; see [`ShadowCaster::cast`].
pub fn cast_shadows(
    dsm: ArrayView2<f64>,
    azimuth_deg: f64,
    altitude_deg: f64,
    scale: f64,
) -> Result<Array2<f64>> {
    ShadowCaster::new(dsm, scale)?.cast(azimuth_deg, altitude_deg)
}

/// Ground mask and wall shading; see [`ShadowCaster::cast_with_walls`].
pub fn cast_shadows_with_walls(
    dsm: ArrayView2<f64>,
    walls: ArrayView2<f64>,
    wall_aspect: ArrayView2<f64>,
    azimuth_deg: f64,
    altitude_deg: f64,
    scale: f64,
) -> Result<WallShadowResult> {
    ShadowCaster::new(dsm, scale)?.cast_with_walls(walls, wall_aspect, azimuth_deg, altitude_deg)
}

#[cfg(feature = "python")]
#[pyclass]
/// Shadow maps for one sun position.
pub struct WallShading {
    #[pyo3(get)]
    pub ground: Py<PyArray2<f64>>,
    #[pyo3(get)]
    pub wall_sun: Py<PyArray2<f64>>,
    #[pyo3(get)]
    pub wall_sh: Py<PyArray2<f64>>,
    #[pyo3(get)]
    pub face_sh: Py<PyArray2<f64>>,
    #[pyo3(get)]
    pub face_sun: Py<PyArray2<f64>>,
}

#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(name = "cast_shadows")]
/// Sunlit mask (1 lit) for a DSM, sun azimuth/altitude in degrees and
/// `scale` in pixels per metre.
pub fn cast_shadows_py(
    py: Python<'_>,
    dsm: PyReadonlyArray2<f64>,
    azimuth: f64,
    altitude: f64,
    scale: f64,
) -> PyResult<Py<PyArray2<f64>>> {
    let dsm = dsm.as_array().to_owned();
    let sh = py.allow_threads(|| cast_shadows(dsm.view(), azimuth, altitude, scale))?;
    Ok(sh.into_pyarray(py).unbind())
}

#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(name = "cast_wall_shadows")]
/// Ground and wall shading. `wall_aspect` is in degrees.
pub fn cast_wall_shadows_py(
    py: Python<'_>,
    dsm: PyReadonlyArray2<f64>,
    walls: PyReadonlyArray2<f64>,
    wall_aspect: PyReadonlyArray2<f64>,
    azimuth: f64,
    altitude: f64,
    scale: f64,
) -> PyResult<WallShading> {
    let dsm = dsm.as_array().to_owned();
    let walls = walls.as_array().to_owned();
    let aspect_rad = wall_aspect.as_array().mapv(f64::to_radians);
    let result = py.allow_threads(|| {
        cast_shadows_with_walls(
            dsm.view(),
            walls.view(),
            aspect_rad.view(),
            azimuth,
            altitude,
            scale,
        )
    })?;
    Ok(WallShading {
        ground: result.ground.into_pyarray(py).unbind(),
        wall_sun: result.wall_sun.into_pyarray(py).unbind(),
        wall_sh: result.wall_sh.into_pyarray(py).unbind(),
        face_sh: result.face_sh.into_pyarray(py).unbind(),
        face_sun: result.face_sun.into_pyarray(py).unbind(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn block_dsm() -> Array2<f64> {
        let mut dsm = Array2::zeros((20, 20));
        dsm.slice_mut(s![8..12, 8..12]).fill(5.0);
        dsm
    }

    #[test]
    fn southern_sun_shadows_fall_north() {
        let sh = cast_shadows(block_dsm().view(), 180.0, 45.0, 1.0).unwrap();
        for r in 4..8 {
            for c in 8..12 {
                assert_eq!(sh[[r, c]], 0.0, "row {r} col {c} should be shadowed");
            }
        }
        // row 3 sits exactly on the shadow tip and is left unasserted
        for c in 0..20 {
            assert_eq!(sh[[2, c]], 1.0);
            for r in 12..20 {
                assert_eq!(sh[[r, c]], 1.0);
            }
        }
        // beside the shadow strip and on the roof
        assert_eq!(sh[[6, 7]], 1.0);
        assert_eq!(sh[[6, 12]], 1.0);
        assert_eq!(sh[[9, 9]], 1.0);
    }

    #[test]
    fn eastern_sun_shadows_fall_west() {
        let sh = cast_shadows(block_dsm().view(), 90.0, 45.0, 1.0).unwrap();
        assert_eq!(sh[[9, 4]], 0.0);
        assert_eq!(sh[[9, 7]], 0.0);
        assert_eq!(sh[[9, 2]], 1.0);
        assert_eq!(sh[[9, 13]], 1.0);
        assert_eq!(sh[[7, 5]], 1.0);
    }

    #[test]
    fn lower_sun_casts_longer_shadows() {
        let high = cast_shadows(block_dsm().view(), 180.0, 60.0, 1.0).unwrap();
        let low = cast_shadows(block_dsm().view(), 180.0, 20.0, 1.0).unwrap();
        let shaded = |a: &Array2<f64>| a.iter().filter(|&&v| v == 0.0).count();
        assert!(shaded(&low) > shaded(&high));
    }

    #[test]
    fn north_azimuth_is_supported() {
        let sh = cast_shadows(block_dsm().view(), 0.0, 45.0, 1.0).unwrap();
        assert_eq!(sh[[12, 9]], 0.0);
        assert_eq!(sh[[7, 9]], 1.0);
    }

    #[test]
    fn flat_ground_is_fully_lit() {
        let sh = cast_shadows(Array2::from_elem((8, 8), 3.0).view(), 200.0, 10.0, 2.0).unwrap();
        assert!(sh.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn sun_below_horizon_is_rejected() {
        let dsm = block_dsm();
        assert!(matches!(
            cast_shadows(dsm.view(), 180.0, 0.0, 1.0),
            Err(SolarError::InvalidParameter { .. })
        ));
        assert!(cast_shadows(dsm.view(), 180.0, -5.0, 1.0).is_err());
        assert!(cast_shadows(dsm.view(), 180.0, 30.0, 0.0).is_err());
    }

    #[test]
    fn wall_faces_follow_the_sun() {
        let dsm = block_dsm();
        let mut walls = Array2::zeros((20, 20));
        let mut aspect = Array2::zeros((20, 20));
        // south-facing wall below the block, north-facing wall above it
        walls[[12, 9]] = 5.0;
        aspect[[12, 9]] = 180f64.to_radians();
        walls[[7, 9]] = 5.0;
        aspect[[7, 9]] = 0.0;

        let result = cast_shadows_with_walls(dsm.view(), walls.view(), aspect.view(), 180.0, 45.0, 1.0)
            .unwrap();
        assert_eq!(result.face_sun[[12, 9]], 1.0);
        assert_eq!(result.face_sh[[12, 9]], 0.0);
        assert_eq!(result.wall_sun[[12, 9]], 5.0);
        assert_eq!(result.wall_sh[[12, 9]], 0.0);

        assert_eq!(result.face_sh[[7, 9]], 1.0);
        assert_eq!(result.wall_sun[[7, 9]], 0.0);
        assert_eq!(result.wall_sh[[7, 9]], 5.0);

        assert_eq!(result.ground, cast_shadows(dsm.view(), 180.0, 45.0, 1.0).unwrap());
        assert_eq!(result.face_sh[[0, 0]], 0.0);
    }

    #[test]
    fn partly_shaded_wall() {
        // a tall block to the south throws a 4 m deep shadow onto a wall face
        let mut dsm = Array2::zeros((20, 20));
        dsm.slice_mut(s![14..16, 5..15]).fill(6.0);
        let mut walls = Array2::zeros((20, 20));
        let mut aspect = Array2::zeros((20, 20));
        walls[[12, 9]] = 8.0;
        aspect[[12, 9]] = 180f64.to_radians();
        let result = cast_shadows_with_walls(dsm.view(), walls.view(), aspect.view(), 180.0, 45.0, 1.0)
            .unwrap();
        assert_abs_diff_eq!(result.wall_sh[[12, 9]], 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.wall_sun[[12, 9]], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn faces_away_handles_wraparound() {
        let d = f64::to_radians;
        assert!(faces_away(d(0.0), d(180.0)));
        assert!(!faces_away(d(180.0), d(180.0)));
        // sun in the north-east
        assert!(!faces_away(d(350.0), d(30.0)));
        assert!(faces_away(d(200.0), d(30.0)));
        // sun in the north-west
        assert!(!faces_away(d(10.0), d(330.0)));
        assert!(faces_away(d(150.0), d(330.0)));
    }

    #[test]
    fn rejects_mismatched_walls() {
        let dsm = block_dsm();
        let walls = Array2::zeros((10, 10));
        let err = cast_shadows_with_walls(dsm.view(), walls.view(), walls.view(), 180.0, 45.0, 1.0)
            .unwrap_err();
        assert!(matches!(err, SolarError::ShapeMismatch { .. }));
    }

    proptest! {
        #[test]
        fn output_is_binary(
            heights in proptest::collection::vec(0.0f64..30.0, 64),
            azimuth in 0.0f64..360.0,
            altitude in 1.0f64..89.0,
        ) {
            let dsm = Array2::from_shape_vec((8, 8), heights).unwrap();
            let sh = cast_shadows(dsm.view(), azimuth, altitude, 1.0).unwrap();
            prop_assert!(sh.iter().all(|&v| v == 0.0 || v == 1.0));
            // the highest cell can never be shadowed
            let (idx, _) = dsm.indexed_iter().fold(((0, 0), f64::MIN), |best, (i, &v)| {
                if v > best.1 { (i, v) } else { best }
            });
            prop_assert_eq!(sh[idx], 1.0);
        }
    }
}
