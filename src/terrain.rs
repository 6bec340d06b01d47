//! Surface derivatives: gradients, slope and aspect.
//!
//! Two flavours are needed. The wall and energy kernels use the
//! numpy-gradient derivatives (`slope_aspect`, radians). Roof-plane
//! attributes use Horn's 3x3 method in degrees, with edges left as nodata.

use std::f64::consts::PI;

use ndarray::{Array2, ArrayView2, Zip};

use crate::error::{Result, SolarError};
use crate::grid::{reclassify, Grid, ReclassRule};

/// Gradients along rows (`fy`) and columns (`fx`) with spacing `dx`.
///
/// Central differences inside, one-sided differences on the edges.
pub fn gradient(dsm: ArrayView2<f64>, dx: f64) -> (Array2<f64>, Array2<f64>) {
    let (rows, cols) = dsm.dim();
    let mut fy = Array2::<f64>::zeros((rows, cols));
    let mut fx = Array2::<f64>::zeros((rows, cols));

    if rows > 1 {
        Zip::indexed(&mut fy).par_for_each(|(i, j), g| {
            *g = if i == 0 {
                (dsm[[1, j]] - dsm[[0, j]]) / dx
            } else if i == rows - 1 {
                (dsm[[rows - 1, j]] - dsm[[rows - 2, j]]) / dx
            } else {
                (dsm[[i + 1, j]] - dsm[[i - 1, j]]) / (2.0 * dx)
            };
        });
    }
    if cols > 1 {
        Zip::indexed(&mut fx).par_for_each(|(i, j), g| {
            *g = if j == 0 {
                (dsm[[i, 1]] - dsm[[i, 0]]) / dx
            } else if j == cols - 1 {
                (dsm[[i, cols - 1]] - dsm[[i, cols - 2]]) / dx
            } else {
                (dsm[[i, j + 1]] - dsm[[i, j - 1]]) / (2.0 * dx)
            };
        });
    }

    (fy, fx)
}

/// Slope and aspect in radians for a surface with `scale` pixels per metre.
///
/// Aspect is `-atan2(fx, fy)` wrapped into `[0, 2π)`.
pub fn slope_aspect(dsm: ArrayView2<f64>, scale: f64) -> Result<(Array2<f64>, Array2<f64>)> {
    if !(scale > 0.0) {
        return Err(SolarError::invalid("scale", scale, "must be positive"));
    }
    let (fy, fx) = gradient(dsm, 1.0 / scale);

    let mut slope = Array2::<f64>::zeros(dsm.dim());
    let mut aspect = Array2::<f64>::zeros(dsm.dim());
    Zip::from(&mut slope)
        .and(&mut aspect)
        .and(&fy)
        .and(&fx)
        .par_for_each(|s, a, &gy, &gx| {
            *s = gy.hypot(gx).atan();
            let mut theta = -gx.atan2(gy);
            if theta < 0.0 {
                theta += 2.0 * PI;
            }
            if theta >= 2.0 * PI {
                theta -= 2.0 * PI;
            }
            *a = theta;
        });

    Ok((slope, aspect))
}

fn horn_window(dem: ArrayView2<f64>, row: usize, col: usize, nodata: f64) -> Option<(f64, f64)> {
    let mut w = [0.0f64; 9];
    for (k, v) in w.iter_mut().enumerate() {
        let value = dem[[row + k / 3 - 1, col + k % 3 - 1]];
        if value.is_nan() || value == nodata {
            return None;
        }
        *v = value;
    }
    let [a, b, c, d, _, f, g, h, i] = w;
    let dz_dx = (c + 2.0 * f + i) - (a + 2.0 * d + g);
    let dz_dy = (g + 2.0 * h + i) - (a + 2.0 * b + c);
    Some((dz_dx, dz_dy))
}

/// Horn slope in degrees. Edge and nodata-adjacent cells are nodata.
pub fn horn_slope(dem: &Grid) -> Grid {
    let (rows, cols) = dem.dim();
    let cell = dem.transform().cell_size();
    let nodata = dem.nodata();
    let view = dem.view();
    let mut out = Array2::from_elem((rows, cols), nodata);

    Zip::indexed(&mut out).par_for_each(|(r, c), v| {
        if r == 0 || c == 0 || r + 1 >= rows || c + 1 >= cols {
            return;
        }
        if let Some((dz_dx, dz_dy)) = horn_window(view, r, c, nodata) {
            let gx = dz_dx / (8.0 * cell);
            let gy = dz_dy / (8.0 * cell);
            *v = gx.hypot(gy).atan().to_degrees();
        }
    });

    Grid::new(out, *dem.transform()).with_nodata(nodata)
}

/// Horn aspect in compass degrees (0 = north, clockwise). Flat cells are
/// nodata, like edge cells.
pub fn horn_aspect(dem: &Grid) -> Grid {
    let (rows, cols) = dem.dim();
    let nodata = dem.nodata();
    let view = dem.view();
    let mut out = Array2::from_elem((rows, cols), nodata);

    Zip::indexed(&mut out).par_for_each(|(r, c), v| {
        if r == 0 || c == 0 || r + 1 >= rows || c + 1 >= cols {
            return;
        }
        if let Some((dz_dx, dz_dy)) = horn_window(view, r, c, nodata) {
            if dz_dx.abs() < 1e-10 && dz_dy.abs() < 1e-10 {
                return;
            }
            let mut bearing = (-dz_dx).atan2(dz_dy).to_degrees();
            if bearing < 0.0 {
                bearing += 360.0;
            }
            *v = bearing;
        }
    });

    Grid::new(out, *dem.transform()).with_nodata(nodata)
}

/// Surface minus terrain. Nodata in either input gives nodata.
pub fn elevation_difference(dsm: &Grid, dtm: &Grid) -> Result<Grid> {
    dsm.ensure_same_frame(dtm, "dtm")?;
    let nodata = dsm.nodata();
    let mut out = Array2::<f64>::zeros(dsm.dim());
    Zip::from(&mut out)
        .and(dsm.data())
        .and(dtm.data())
        .par_for_each(|o, &s, &t| {
            *o = if dsm.is_nodata(s) || dtm.is_nodata(t) {
                nodata
            } else {
                s - t
            };
        });
    dsm.derive(out)
}

/// Sine and cosine grids of an aspect grid given in degrees.
pub fn aspect_components(aspect_deg: &Grid) -> Result<(Grid, Grid)> {
    let nodata = aspect_deg.nodata();
    let sin = aspect_deg.data().mapv(|a| {
        if a.is_nan() || a == nodata {
            nodata
        } else {
            a.to_radians().sin()
        }
    });
    let cos = aspect_deg.data().mapv(|a| {
        if a.is_nan() || a == nodata {
            nodata
        } else {
            a.to_radians().cos()
        }
    });
    Ok((aspect_deg.derive(sin)?, aspect_deg.derive(cos)?))
}

/// Heights at or below `threshold` become nodata.
pub fn above_threshold(ndsm: &Grid, threshold: f64) -> Result<Grid> {
    let nodata = ndsm.nodata();
    let rules = [ReclassRule::new(None, Some(threshold), nodata)];
    ndsm.derive(reclassify(ndsm.view(), &rules, nodata))
}

/// Four compass classes; north (315..45) shares class 1.
pub fn aspect_classes(aspect_deg: &Grid) -> Result<Grid> {
    let nodata = aspect_deg.nodata();
    let rules = [
        ReclassRule::new(Some(0.0), Some(45.0), 1.0),
        ReclassRule::new(Some(45.0), Some(135.0), 2.0),
        ReclassRule::new(Some(135.0), Some(225.0), 3.0),
        ReclassRule::new(Some(225.0), Some(315.0), 4.0),
        ReclassRule::new(Some(315.0), Some(360.0), 1.0),
        ReclassRule::new(None, Some(0.0), nodata),
        ReclassRule::new(Some(360.0), None, nodata),
    ];
    aspect_deg.derive(reclassify(aspect_deg.view(), &rules, nodata))
}

/// Slope bands 0-20, 20-40 and 40-60 degrees; steeper is nodata.
pub fn slope_classes(slope_deg: &Grid) -> Result<Grid> {
    let nodata = slope_deg.nodata();
    let rules = [
        ReclassRule::new(Some(0.0), Some(20.0), 1.0),
        ReclassRule::new(Some(20.0), Some(40.0), 2.0),
        ReclassRule::new(Some(40.0), Some(60.0), 3.0),
        ReclassRule::new(None, Some(0.0), nodata),
        ReclassRule::new(Some(60.0), None, nodata),
    ];
    slope_deg.derive(reclassify(slope_deg.view(), &rules, nodata))
}
