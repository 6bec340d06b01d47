//! Wall aspect (orientation) detection using the Goodwin filter algorithm.
//!
//! Determines wall orientation from a wall grid and DSM by rotating a linear
//! filter through 180 angles and keeping, per wall pixel, the angle along
//! which the most wall pixels line up. The building side of the wall is the
//! half of the neighbourhood with the larger summed elevation.
//!
//! References:
//! - Goodwin NR, Coops NC, Tooke TR, Christen A, Voogt JA (2009)
//! - Lindberg F., Jonsson, P. & Honjo, T. and Wästberg, D. (2015b)

use ndarray::{Array2, ArrayView2, Zip};

#[cfg(feature = "python")]
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(feature = "python")]
use std::sync::Arc;

#[cfg(feature = "python")]
use crate::config::WALL_KERNEL_FACTOR;
use crate::error::{Result, SolarError};
use crate::grid::{ensure_same_shape, Grid};
use crate::progress::{Completion, RunContext};
use crate::terrain::slope_aspect;

const ROTATIONS: usize = 180;

/// Turn a kernel about its centre by `angle_deg`. Each output cell samples
/// the input at its back-rotated position, edges clamped; `order` 0 takes
/// the nearest cell, anything else blends the four neighbours.
fn rotate_2d(arr: &Array2<f64>, angle_deg: f64, order: u8) -> Array2<f64> {
    let (rows, cols) = arr.dim();
    let center_y = (rows as f64 - 1.0) / 2.0;
    let center_x = (cols as f64 - 1.0) / 2.0;

    let theta = angle_deg.to_radians();
    let (sin_t, cos_t) = theta.sin_cos();

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let xc = c as f64 - center_x;
        let yc = r as f64 - center_y;
        let src_x = cos_t * xc - sin_t * yc + center_x;
        let src_y = sin_t * xc + cos_t * yc + center_y;

        let clamp_col = |v: i64| v.clamp(0, cols as i64 - 1) as usize;
        let clamp_row = |v: i64| v.clamp(0, rows as i64 - 1) as usize;

        if order == 0 {
            arr[[clamp_row(src_y.round() as i64), clamp_col(src_x.round() as i64)]]
        } else {
            let x0 = src_x.floor() as i64;
            let y0 = src_y.floor() as i64;
            let wx = (src_x - x0 as f64).clamp(0.0, 1.0);
            let wy = (src_y - y0 as f64).clamp(0.0, 1.0);
            let (x0c, x1c) = (clamp_col(x0), clamp_col(x0 + 1));
            let (y0c, y1c) = (clamp_row(y0), clamp_row(y0 + 1));

            arr[[y0c, x0c]] * (1.0 - wx) * (1.0 - wy)
                + arr[[y0c, x1c]] * wx * (1.0 - wy)
                + arr[[y1c, x0c]] * (1.0 - wx) * wy
                + arr[[y1c, x1c]] * wx * wy
        }
    })
}

/// Odd kernel size for `scale` pixels per metre, at least 3.
pub(crate) fn filter_size(scale: f64, kernel_factor: f64) -> usize {
    let mut size = ((scale + 1e-10) * kernel_factor).floor() as usize;
    if size <= 2 {
        size = 3;
    } else if size != 9 && size % 2 == 0 {
        size += 1;
    }
    size
}

/// Line kernel and two-sided marker kernel for one scan angle.
struct RotatedFilter {
    line: Array2<f64>,
    sides: Array2<f64>,
    /// Compass index before side disambiguation.
    index: f64,
}

struct FilterBank {
    size: usize,
    half_floor: usize,
    half_ceil: usize,
    rotations: Vec<RotatedFilter>,
}

impl FilterBank {
    fn new(size: usize) -> Self {
        let half_ceil = (size as f64 / 2.0).ceil() as usize;
        let half_floor = (size as f64 / 2.0).floor() as usize;
        let n = size - 1;

        let mut line = Array2::<f64>::zeros((size, size));
        line.column_mut(half_ceil - 1).fill(1.0);

        let mut sides = Array2::<f64>::zeros((size, size));
        for c in 0..half_floor {
            sides[[half_ceil - 1, c]] = 1.0;
        }
        for c in half_ceil..size {
            sides[[half_ceil - 1, c]] = 2.0;
        }

        let rotations = (0..ROTATIONS)
            .map(|h| {
                let mut fm = rotate_2d(&line, h as f64, 1);
                fm.mapv_inplace(f64::round);
                let mut bf = rotate_2d(&sides, h as f64, 0);
                bf.mapv_inplace(f64::round);

                let index = 270.0 - h as f64;

                // rotation drops cells at these angles
                if h == 30 || h == 150 {
                    bf.column_mut(n).fill(0.0);
                }
                if index == 225.0 {
                    fm[[0, 0]] = 1.0;
                    fm[[n, n]] = 1.0;
                }
                if index == 135.0 {
                    fm[[0, n]] = 1.0;
                    fm[[n, 0]] = 1.0;
                }

                RotatedFilter {
                    line: fm,
                    sides: bf,
                    index,
                }
            })
            .collect();

        Self {
            size,
            half_floor,
            half_ceil,
            rotations,
        }
    }
}

/// Per-pixel best-so-far state, one array per quantity.
struct AspectAccumulator {
    best: Array2<f64>,
    side: Array2<u8>,
    compass: Array2<f64>,
}

impl AspectAccumulator {
    fn new(dim: (usize, usize)) -> Self {
        Self {
            best: Array2::zeros(dim),
            side: Array2::zeros(dim),
            compass: Array2::zeros(dim),
        }
    }

    /// Fold one rotated filter into the state of every interior wall pixel.
    fn update(
        &mut self,
        filter: &RotatedFilter,
        bank: &FilterBank,
        walls: ArrayView2<f64>,
        dsm: ArrayView2<f64>,
    ) {
        let (rows, cols) = walls.dim();
        let lo = bank.half_ceil - 1;
        let i_end = rows.saturating_sub(bank.half_ceil + 1);
        let j_end = cols.saturating_sub(bank.half_ceil + 1);
        let hf = bank.half_floor;
        let size = bank.size;

        Zip::indexed(&mut self.best)
            .and(&mut self.side)
            .and(&mut self.compass)
            .par_for_each(|(i, j), best, side, compass| {
                if i < lo || i >= i_end || j < lo || j >= j_end || walls[[i, j]] != 1.0 {
                    return;
                }

                let mut run = 0.0;
                for di in 0..size {
                    for dj in 0..size {
                        run += walls[[i - hf + di, j - hf + dj]] * filter.line[[di, dj]];
                    }
                }
                if run <= *best {
                    return;
                }
                *best = run;

                let mut side1 = 0.0;
                let mut side2 = 0.0;
                for di in 0..size {
                    for dj in 0..size {
                        let h = dsm[[i - hf + di, j - hf + dj]];
                        match filter.sides[[di, dj]] as u8 {
                            1 => side1 += h,
                            2 => side2 += h,
                            _ => {}
                        }
                    }
                }
                *side = if side1 > side2 { 1 } else { 2 };
                *compass = filter.index;
            });
    }

    /// Resolve recorded indices into compass degrees.
    fn finish(self) -> Array2<f64> {
        let mut aspect = self.compass;
        Zip::from(&mut aspect).and(&self.side).par_for_each(|a, &s| {
            if s == 1 {
                *a -= 180.0;
            }
            if *a < 0.0 {
                *a += 360.0;
            }
        });
        aspect
    }
}

/// Compute wall aspect in degrees using the Goodwin filter algorithm.
///
/// `walls` holds wall heights (any value > 0 is a wall), `scale` is pixels
/// per metre. The cancellation flag is polled before each of the 180
/// rotations and progress moves linearly across them.
pub fn compute_wall_aspect_pure(
    walls_in: ArrayView2<f64>,
    scale: f64,
    dsm: ArrayView2<f64>,
    kernel_factor: f64,
    ctx: &RunContext<'_>,
) -> Result<Completion<Array2<f64>>> {
    ensure_same_shape(walls_in, dsm, "dsm")?;
    if !(scale > 0.0) {
        return Err(SolarError::invalid("scale", scale, "must be positive"));
    }

    let walls = walls_in.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
    let bank = FilterBank::new(filter_size(scale, kernel_factor));
    tracing::debug!(filter_size = bank.size, "wall aspect filters ready");

    let mut acc = AspectAccumulator::new(walls.dim());
    for (h, filter) in bank.rotations.iter().enumerate() {
        if ctx.is_cancelled() {
            tracing::info!(rotation = h, "wall aspect cancelled");
            return Ok(Completion::Cancelled(acc.finish()));
        }
        acc.update(filter, &bank, walls.view(), dsm);
        ctx.report((h + 1) as f64 / ROTATIONS as f64);
    }

    let mut aspect = acc.finish();

    // isolated wall pixels fall back to the surface aspect
    let (_, surface_aspect) = slope_aspect(dsm, scale)?;
    Zip::from(&mut aspect)
        .and(&walls)
        .and(&surface_aspect)
        .par_for_each(|a, &w, &asp| {
            if w == 1.0 && *a == 0.0 {
                let deg = asp.to_degrees();
                *a = if deg >= 360.0 { deg - 360.0 } else { deg };
            }
        });

    Ok(Completion::Finished(aspect))
}

/// Wall aspect raster for a wall raster and its surface model.
pub fn wall_aspect(
    walls: &Grid,
    dsm: &Grid,
    kernel_factor: f64,
    ctx: &RunContext<'_>,
) -> Result<Completion<Grid>> {
    dsm.ensure_same_frame(walls, "walls")?;
    let scale = dsm.scale()?;
    let result = compute_wall_aspect_pure(walls.view(), scale, dsm.view(), kernel_factor, ctx)?;
    if let Completion::Finished(ref a) = result {
        let resolved = a.iter().filter(|&&v| v != 0.0).count();
        tracing::info!(resolved, "wall aspect finished");
    }
    Ok(match result {
        Completion::Finished(a) => Completion::Finished(dsm.derive(a)?),
        Completion::Cancelled(a) => Completion::Cancelled(dsm.derive(a)?),
    })
}

/// PyO3 wrapper for wall aspect computation (no progress reporting).
#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(signature = (walls, scale, dsm, kernel_factor = WALL_KERNEL_FACTOR))]
pub fn compute_wall_aspect(
    py: Python<'_>,
    walls: PyReadonlyArray2<f64>,
    scale: f64,
    dsm: PyReadonlyArray2<f64>,
    kernel_factor: f64,
) -> PyResult<Py<PyArray2<f64>>> {
    let cancel = crate::progress::CancelToken::new();
    let ctx = RunContext::new(&cancel, &crate::progress::NoProgress);
    let result =
        compute_wall_aspect_pure(walls.as_array(), scale, dsm.as_array(), kernel_factor, &ctx)?;
    Ok(result.into_inner().into_pyarray(py).unbind())
}

/// Runner that exposes pollable progress() and cancel() methods for wall aspect computation.
///
/// Usage from Python:
///   runner = WallAspectRunner()
///   # launch runner.compute(...) in a thread
///   # poll runner.progress() from main thread (returns 0..100)
///   # call runner.cancel() to request early termination
#[cfg(feature = "python")]
#[pyclass]
pub struct WallAspectRunner {
    progress: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

#[cfg(feature = "python")]
impl Default for WallAspectRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl WallAspectRunner {
    #[new]
    pub fn new() -> Self {
        Self {
            progress: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Compute wall aspect, releasing the GIL so progress()/cancel() can be called.
    #[pyo3(signature = (walls, scale, dsm, kernel_factor = WALL_KERNEL_FACTOR))]
    pub fn compute(
        &self,
        py: Python<'_>,
        walls: PyReadonlyArray2<f64>,
        scale: f64,
        dsm: PyReadonlyArray2<f64>,
        kernel_factor: f64,
    ) -> PyResult<Py<PyArray2<f64>>> {
        self.progress.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);

        // Copy to owned arrays so we can release the GIL
        let walls_owned = walls.as_array().to_owned();
        let dsm_owned = dsm.as_array().to_owned();
        let cancel = crate::progress::CancelToken::from_flag(self.cancelled.clone());
        let progress = crate::progress::AtomicProgress::from_counter(self.progress.clone());

        let result = py.allow_threads(|| {
            let ctx = RunContext::new(&cancel, &progress);
            compute_wall_aspect_pure(
                walls_owned.view(),
                scale,
                dsm_owned.view(),
                kernel_factor,
                &ctx,
            )
        })?;

        match result {
            Completion::Finished(arr) => Ok(arr.into_pyarray(py).unbind()),
            Completion::Cancelled(_) => Err(pyo3::exceptions::PyInterruptedError::new_err(
                "Wall aspect computation cancelled",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WALL_KERNEL_FACTOR;
    use crate::progress::{AtomicProgress, CancelToken, NoProgress};
    use ndarray::s;
    use proptest::prelude::*;

    #[test]
    fn kernel_rotation_samples_back_rotated_cells() {
        let mut line = Array2::<f64>::zeros((3, 3));
        line.row_mut(1).fill(1.0);

        let quarter = rotate_2d(&line, 90.0, 0);
        assert_eq!(quarter.column(1).to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(quarter.sum(), 3.0);

        assert_eq!(rotate_2d(&line, 0.0, 1), line);
        let diagonal = rotate_2d(&line, 45.0, 1);
        assert!((diagonal[[1, 1]] - 1.0).abs() < 1e-12);
        assert!(diagonal.iter().all(|v| (0.0..=1.0 + 1e-12).contains(v)));
    }

    fn run(walls: &Array2<f64>, dsm: &Array2<f64>) -> Array2<f64> {
        let cancel = CancelToken::new();
        let ctx = RunContext::new(&cancel, &NoProgress);
        compute_wall_aspect_pure(walls.view(), 1.0, dsm.view(), WALL_KERNEL_FACTOR, &ctx)
            .unwrap()
            .finished()
            .unwrap()
    }

    /// 30x30 ground with a building occupying columns 15.. and a wall line
    /// on column 14 facing west.
    fn west_facing_wall() -> (Array2<f64>, Array2<f64>) {
        let mut dsm = Array2::<f64>::zeros((30, 30));
        dsm.slice_mut(s![.., 15..]).fill(8.0);
        let mut walls = Array2::<f64>::zeros((30, 30));
        walls.slice_mut(s![5..25, 14]).fill(8.0);
        (walls, dsm)
    }

    #[test]
    fn filter_sizes() {
        assert_eq!(filter_size(1.0, 9.0), 9);
        assert_eq!(filter_size(0.5, 9.0), 5);
        assert_eq!(filter_size(0.2, 9.0), 3);
        assert_eq!(filter_size(2.0, 9.0), 19);
        assert_eq!(filter_size(0.25, 9.0), 3);
    }

    #[test]
    fn unrotated_kernels() {
        let bank = FilterBank::new(9);
        let first = &bank.rotations[0];
        assert_eq!(first.index, 270.0);
        assert_eq!(first.line.column(4).sum(), 9.0);
        assert_eq!(first.line.sum(), 9.0);
        assert_eq!(first.sides.row(4).iter().filter(|&&v| v == 1.0).count(), 4);
        assert_eq!(first.sides.row(4).iter().filter(|&&v| v == 2.0).count(), 4);
        assert_eq!(bank.rotations.len(), 180);
    }

    #[test]
    fn straight_wall_faces_away_from_building() {
        let (walls, dsm) = west_facing_wall();
        let aspect = run(&walls, &dsm);
        for r in 10..20 {
            assert_eq!(aspect[[r, 14]], 270.0, "row {r}");
        }
        assert_eq!(aspect[[0, 0]], 0.0);
    }

    #[test]
    fn mirrored_wall_faces_east() {
        let mut dsm = Array2::<f64>::zeros((30, 30));
        dsm.slice_mut(s![.., ..15]).fill(8.0);
        let mut walls = Array2::<f64>::zeros((30, 30));
        walls.slice_mut(s![5..25, 15]).fill(8.0);
        let aspect = run(&walls, &dsm);
        for r in 10..20 {
            assert_eq!(aspect[[r, 15]], 90.0, "row {r}");
        }
    }

    #[test]
    fn cancellation_before_first_rotation() {
        let (walls, dsm) = west_facing_wall();
        let cancel = CancelToken::new();
        cancel.cancel();
        let progress = AtomicProgress::new();
        let ctx = RunContext::new(&cancel, &progress);
        let out =
            compute_wall_aspect_pure(walls.view(), 1.0, dsm.view(), WALL_KERNEL_FACTOR, &ctx)
                .unwrap();
        assert!(out.is_cancelled());
        assert_eq!(progress.get(), 0);
    }

    #[test]
    fn progress_spans_rotations() {
        let (walls, dsm) = west_facing_wall();
        let cancel = CancelToken::new();
        let progress = AtomicProgress::new();
        let ctx = RunContext::new(&cancel, &progress);
        let stage = ctx.stage(0.0, 50.0);
        compute_wall_aspect_pure(walls.view(), 1.0, dsm.view(), WALL_KERNEL_FACTOR, &stage)
            .unwrap();
        assert_eq!(progress.get(), 50);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let cancel = CancelToken::new();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let err = compute_wall_aspect_pure(
            Array2::zeros((5, 5)).view(),
            1.0,
            Array2::zeros((5, 6)).view(),
            WALL_KERNEL_FACTOR,
            &ctx,
        );
        assert!(matches!(err, Err(SolarError::ShapeMismatch { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn aspect_stays_in_compass_range(
            cells in proptest::collection::vec((0.0f64..12.0, any::<bool>()), 144)
        ) {
            let dsm = Array2::from_shape_vec((12, 12), cells.iter().map(|c| c.0).collect()).unwrap();
            let walls = Array2::from_shape_vec(
                (12, 12),
                cells.iter().map(|c| if c.1 { 4.0 } else { 0.0 }).collect(),
            ).unwrap();
            let cancel = CancelToken::new();
            let ctx = RunContext::new(&cancel, &NoProgress);
            let aspect = compute_wall_aspect_pure(walls.view(), 0.5, dsm.view(), WALL_KERNEL_FACTOR, &ctx)
                .unwrap()
                .into_inner();
            for &a in aspect.iter() {
                prop_assert!((0.0..360.0).contains(&a));
            }
            for (a, w) in aspect.iter().zip(walls.iter()) {
                if *w == 0.0 {
                    prop_assert_eq!(*a, 0.0);
                }
            }
        }
    }
}
