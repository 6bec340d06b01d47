//! Wall detection from an elevation grid.
//!
//! A wall pixel is a cell whose highest 4-connected neighbour stands at least
//! `wall_limit` metres above it; the pixel value is that height difference.

use ndarray::{s, Array2, ArrayView2, Zip};

#[cfg(feature = "python")]
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
#[cfg(feature = "python")]
use pyo3::prelude::*;

use crate::error::{Result, SolarError};
use crate::grid::Grid;

const CROSS: [(i32, i32); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// Source start, destination start and overlap length for a shift.
#[inline]
fn shift_range(offset: i32, size: usize) -> (usize, usize, usize) {
    let n = size as i32;
    if offset >= 0 {
        (0, offset as usize, (n - offset).max(0) as usize)
    } else {
        ((-offset) as usize, 0, (n + offset).max(0) as usize)
    }
}

/// Grey dilation with the 4-neighbour cross (centre excluded).
///
/// Cells without a neighbour in some direction just ignore it.
pub(crate) fn neighbour_max(input: ArrayView2<f64>) -> Array2<f64> {
    let (rows, cols) = input.dim();
    let mut out = Array2::from_elem((rows, cols), f64::NEG_INFINITY);

    for &(dr, dc) in &CROSS {
        let (src_r, dst_r, h) = shift_range(dr, rows);
        let (src_c, dst_c, w) = shift_range(dc, cols);
        if h == 0 || w == 0 {
            continue;
        }
        Zip::from(out.slice_mut(s![dst_r..dst_r + h, dst_c..dst_c + w]))
            .and(input.slice(s![src_r..src_r + h, src_c..src_c + w]))
            .par_for_each(|dst, &src| *dst = dst.max(src));
    }

    out
}

/// Wall heights for a height grid, 0 where there is no wall.
///
/// The outermost ring of cells is always 0.
pub fn find_walls(heights: ArrayView2<f64>, wall_limit: f64) -> Array2<f64> {
    let (rows, cols) = heights.dim();
    let mut walls = Array2::<f64>::zeros((rows, cols));
    if rows < 3 || cols < 3 {
        return walls;
    }

    let highest = neighbour_max(heights);
    Zip::indexed(&mut walls)
        .and(&highest)
        .and(heights)
        .par_for_each(|(r, c), w, &hi, &h| {
            if r == 0 || c == 0 || r == rows - 1 || c == cols - 1 {
                return;
            }
            let diff = hi - h;
            *w = if diff >= wall_limit { diff } else { 0.0 };
        });

    walls
}

/// Wall raster for an elevation-difference (or prepared surface) grid.
pub fn detect_walls(heights: &Grid, wall_limit: f64) -> Result<Grid> {
    if !(wall_limit > 0.0) {
        return Err(SolarError::invalid("wall_limit", wall_limit, "must be positive"));
    }
    let surface = heights.prepared_surface();
    let walls = find_walls(surface.view(), wall_limit);
    let count = walls.iter().filter(|&&v| v > 0.0).count();
    tracing::info!(wall_pixels = count, wall_limit, "wall detection finished");
    heights.derive(walls)
}

#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(name = "find_walls")]
/// Wall heights (metres) above `wall_limit`, 0 elsewhere.
pub fn find_walls_py(
    py: Python<'_>,
    heights: PyReadonlyArray2<f64>,
    wall_limit: f64,
) -> PyResult<Py<PyArray2<f64>>> {
    let result = find_walls(heights.as_array(), wall_limit);
    Ok(result.into_pyarray(py).unbind())
}
