//! Day-long and seasonal shadow aggregation.
//!
//! A day is sampled at a fixed interval; every step with the sun above the
//! horizon contributes one sunlit mask and the day's result is their mean.
//! Four representative dates are binarised at their own thresholds and
//! multiplied into a single year-round acceptability grid.

use chrono::{NaiveDate, NaiveDateTime};
use ndarray::{s, Array2, ArrayView2, Zip};

#[cfg(feature = "python")]
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(feature = "python")]
use std::sync::Arc;

use crate::config::{SeasonalDate, SolarConfig};
use crate::error::{Result, SolarError};
use crate::grid::{reclassify, Bounds, Grid, ReclassRule};
use crate::progress::{Completion, RunContext};
use crate::shadowing::ShadowCaster;
use crate::sun_position::{local_to_utc, sun_position, Location};

const MINUTES_PER_DAY: u32 = 1440;
/// Share of the seasonal run spent on the per-date passes.
const DATES_PROGRESS: f64 = 80.0;

/// Sampling of one civil day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub dst_hours: i32,
    /// Hours east of UTC.
    pub utc_offset: f64,
    pub interval_minutes: u32,
}

impl DaySchedule {
    pub fn steps(&self) -> Result<u32> {
        let interval = self.interval_minutes;
        if interval == 0 || MINUTES_PER_DAY % interval != 0 {
            return Err(SolarError::invalid(
                "time_interval_minutes",
                interval,
                "must divide a day (1440 minutes)",
            ));
        }
        Ok(MINUTES_PER_DAY / interval)
    }

    /// UTC instant of step `i`.
    pub fn utc_at(&self, step: u32) -> NaiveDateTime {
        local_to_utc(
            self.date,
            step * self.interval_minutes,
            self.utc_offset,
            self.dst_hours,
        )
    }
}

/// Coarse surface covering a wider area than the local grid, used for
/// distant horizon shading.
#[derive(Debug, Clone, PartialEq)]
pub struct WideArea {
    surface: Grid,
}

impl WideArea {
    /// `surface` is the resampled wide-area DSM, already prepared.
    pub fn new(surface: Grid) -> Self {
        Self { surface }
    }

    /// Prepare a resampled wide-area DSM against the local DSM: the local
    /// footprint is flattened to the local maximum height so the coarse pass
    /// only contributes shading from outside it.
    pub fn prepare(coarse: &Grid, local: &Grid) -> Result<Self> {
        let coarse = coarse.prepared_surface();
        let local_max = local.prepared_surface().max_value().unwrap_or(0.0);
        let surface = mask_local_footprint(&coarse, &local.bounds(), local_max)?;
        Ok(Self { surface })
    }

    pub fn surface(&self) -> &Grid {
        &self.surface
    }

    pub fn bounds(&self) -> Bounds {
        self.surface.bounds()
    }
}

/// Offset of the local grid inside the upsampled wide-area grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

/// Overwrite the coarse cells covering `local` with `height`.
pub fn mask_local_footprint(coarse: &Grid, local: &Bounds, height: f64) -> Result<Grid> {
    let gt = coarse.transform();
    let cell_x = gt.pixel_width.abs();
    let cell_y = gt.pixel_height.abs();
    let (rows, cols) = coarse.dim();

    let col0 = ((local.xmin - gt.origin_x) / cell_x).floor().max(0.0) as usize;
    let col1 = (((local.xmax - gt.origin_x) / cell_x).ceil().max(0.0) as usize).min(cols);
    let row0 = ((gt.origin_y - local.ymax) / cell_y).floor().max(0.0) as usize;
    let row1 = (((gt.origin_y - local.ymin) / cell_y).ceil().max(0.0) as usize).min(rows);
    if col0 >= col1 || row0 >= row1 {
        return Err(SolarError::Precondition(format!(
            "local bounds {local:?} do not overlap the wide area {:?}",
            coarse.bounds()
        )));
    }

    let mut data = coarse.data().clone();
    data.slice_mut(s![row0..row1, col0..col1]).fill(height);
    coarse.derive(data)
}

/// Nearest-neighbour resampling: output cell `i` reads input cell
/// `floor((i + 0.5) * in / out)`.
pub fn upsample_nearest(input: ArrayView2<f64>, shape: (usize, usize)) -> Array2<f64> {
    let (in_rows, in_cols) = input.dim();
    let (out_rows, out_cols) = shape;
    let pick = |i: usize, n_in: usize, n_out: usize| {
        let j = ((i as f64 + 0.5) * n_in as f64 / n_out as f64).floor() as usize;
        j.min(n_in.saturating_sub(1))
    };
    let row_map: Vec<usize> = (0..out_rows).map(|r| pick(r, in_rows, out_rows)).collect();
    let col_map: Vec<usize> = (0..out_cols).map(|c| pick(c, in_cols, out_cols)).collect();

    let mut out = Array2::<f64>::zeros(shape);
    if in_rows == 0 || in_cols == 0 {
        return out;
    }
    Zip::indexed(&mut out).par_for_each(|(r, c), v| {
        *v = input[[row_map[r], col_map[c]]];
    });
    out
}

/// Shape the wide area takes at the local pixel size.
fn upsampled_shape(wide: &Bounds, local_cell: f64) -> (usize, usize) {
    (
        (wide.height() / local_cell).round() as usize,
        (wide.width() / local_cell).round() as usize,
    )
}

/// Where the local grid sits inside the upsampled wide area. Offsets are
/// ground offsets rounded to whole local pixels.
pub fn local_window(
    wide: &Bounds,
    local: &Bounds,
    local_cell: f64,
    local_shape: (usize, usize),
) -> Result<Window> {
    if !(local_cell > 0.0) {
        return Err(SolarError::invalid("local pixel size", local_cell, "must be positive"));
    }
    let (up_rows, up_cols) = upsampled_shape(wide, local_cell);
    let col = ((local.xmin - wide.xmin) / local_cell).round();
    let row = ((wide.ymax - local.ymax) / local_cell).round();
    let (rows, cols) = local_shape;
    if col < 0.0 || row < 0.0 || row as usize + rows > up_rows || col as usize + cols > up_cols {
        return Err(SolarError::Precondition(format!(
            "local grid ({rows}x{cols} at row {row}, col {col}) falls outside the \
             {up_rows}x{up_cols} wide area"
        )));
    }
    Ok(Window {
        row: row as usize,
        col: col as usize,
        rows,
        cols,
    })
}

/// Mean sunlit fraction over the sun-up steps of one day.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyShadow {
    pub mean: Grid,
    pub sun_up_steps: usize,
}

/// Average sunlit mask for one day over a prepared local surface.
pub fn daily_shading(
    dsm: &Grid,
    location: &Location,
    schedule: &DaySchedule,
    wide: Option<&WideArea>,
    ctx: &RunContext,
) -> Result<Completion<DailyShadow>> {
    let steps = schedule.steps()?;
    let surface = dsm.prepared_surface();
    let caster = ShadowCaster::new(surface.view(), surface.scale()?)?;

    let wide_pass = match wide {
        Some(w) => {
            let window = local_window(
                &w.bounds(),
                &surface.bounds(),
                surface.transform().cell_size(),
                surface.dim(),
            )?;
            let shape = upsampled_shape(&w.bounds(), surface.transform().cell_size());
            let coarse = ShadowCaster::new(w.surface().view(), w.surface().scale()?)?;
            Some((coarse, window, shape))
        }
        None => None,
    };

    let mut total = Array2::<f64>::zeros(surface.dim());
    let mut sun_up = 0usize;
    let mut cancelled = false;

    for step in 0..steps {
        if ctx.is_cancelled() {
            cancelled = true;
            break;
        }
        let utc = schedule.utc_at(step);
        let sun = sun_position(utc, location);
        if sun.is_up() {
            let mut sh = caster.cast(sun.azimuth, sun.altitude)?;
            if let Some((coarse, window, shape)) = &wide_pass {
                let coarse_sh = coarse.cast(sun.azimuth, sun.altitude)?;
                let fine = upsample_nearest(coarse_sh.view(), *shape);
                let clip = fine.slice(s![
                    window.row..window.row + window.rows,
                    window.col..window.col + window.cols
                ]);
                sh *= &clip;
            }
            total += &sh;
            sun_up += 1;
            tracing::debug!(%utc, altitude = sun.altitude, azimuth = sun.azimuth, "shadow step");
        }
        ctx.report(f64::from(step + 1) / f64::from(steps));
    }

    if sun_up > 0 {
        total /= sun_up as f64;
    } else if !cancelled {
        tracing::warn!(date = %schedule.date, "sun never rises; day treated as fully shaded");
    }

    let result = DailyShadow {
        mean: surface.derive(total)?,
        sun_up_steps: sun_up,
    };
    Ok(if cancelled {
        Completion::Cancelled(result)
    } else {
        Completion::Finished(result)
    })
}

/// 1 where the mean sunlit fraction exceeds `threshold`, 0 elsewhere.
pub fn binarize(mean: ArrayView2<f64>, threshold: f64) -> Array2<f64> {
    let rules = [
        ReclassRule::new(None, Some(threshold), 0.0),
        ReclassRule::new(Some(threshold), None, 1.0),
    ];
    reclassify(mean, &rules, f64::NAN)
}

/// Elementwise product of binary grids.
pub fn composite(binaries: &[ArrayView2<f64>]) -> Result<Array2<f64>> {
    let (first, rest) = binaries
        .split_first()
        .ok_or_else(|| SolarError::Precondition("no shadow grids to combine".into()))?;
    let mut out = first.to_owned();
    for (i, b) in rest.iter().enumerate() {
        crate::grid::ensure_same_shape(out.view(), *b, &format!("binary shadow {}", i + 1))?;
        out *= b;
    }
    Ok(out)
}

/// Per-date means and binaries plus the year-round composite.
#[derive(Debug, Clone, PartialEq)]
pub struct SeasonalShadow {
    pub dates: Vec<SeasonalDate>,
    pub daily: Vec<Grid>,
    pub binary: Vec<Grid>,
    /// 1 where the surface is sunlit above threshold on every date.
    pub composite: Grid,
}

/// Run the daily aggregator over the configured seasonal dates.
///
/// Progress runs to 80% over the dates and to 100% over binarisation. A
/// cancelled run returns the dates finished so far.
pub fn seasonal_shadow(
    dsm: &Grid,
    location: &Location,
    config: &SolarConfig,
    wide: Option<&WideArea>,
    ctx: &RunContext,
) -> Result<Completion<SeasonalShadow>> {
    let seasons = &config.seasons;
    if seasons.is_empty() {
        return Err(SolarError::Config("at least one seasonal date is required".into()));
    }
    let n = seasons.len() as f64;
    let mut daily = Vec::with_capacity(seasons.len());
    let mut cancelled = false;

    for (k, season) in seasons.iter().enumerate() {
        let schedule = DaySchedule {
            date: season.date(config.shadow_year)?,
            dst_hours: season.dst_hours,
            utc_offset: config.utc_offset,
            interval_minutes: config.time_interval_minutes,
        };
        let stage = ctx.stage(
            DATES_PROGRESS * k as f64 / n,
            DATES_PROGRESS * (k + 1) as f64 / n,
        );
        match daily_shading(dsm, location, &schedule, wide, &stage)? {
            Completion::Finished(day) => {
                tracing::info!(
                    date = %schedule.date,
                    label = %season.label,
                    sun_up_steps = day.sun_up_steps,
                    "seasonal date finished"
                );
                daily.push(day.mean);
            }
            Completion::Cancelled(_) => {
                cancelled = true;
                break;
            }
        }
    }

    let finishing = ctx.stage(DATES_PROGRESS, 100.0);
    let mut binary = Vec::with_capacity(daily.len());
    for (i, (mean, season)) in daily.iter().zip(seasons).enumerate() {
        binary.push(mean.derive(binarize(mean.view(), season.threshold))?);
        finishing.report((i + 1) as f64 / daily.len() as f64);
    }

    let composite = if binary.is_empty() {
        dsm.derive(Array2::zeros(dsm.dim()))?
    } else {
        let views: Vec<ArrayView2<f64>> = binary.iter().map(Grid::view).collect();
        dsm.derive(composite(&views)?)?
    };

    let result = SeasonalShadow {
        dates: seasons[..daily.len()].to_vec(),
        daily,
        binary,
        composite,
    };
    if cancelled {
        return Ok(Completion::Cancelled(result));
    }
    let sunlit = result.composite.data().iter().filter(|&&v| v == 1.0).count();
    tracing::info!(sunlit_cells = sunlit, "seasonal shadow composite finished");
    ctx.report(1.0);
    Ok(Completion::Finished(result))
}

/// Runner that exposes pollable progress() and cancel() for the seasonal
/// shadow composite.
#[cfg(feature = "python")]
#[pyclass]
pub struct SeasonalShadowRunner {
    progress: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

#[cfg(feature = "python")]
impl Default for SeasonalShadowRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl SeasonalShadowRunner {
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

    /// Returns `(composite, [daily means])` for the four reference dates.
    #[pyo3(signature = (dsm, scale, longitude, latitude, utc_offset = 0.0, time_interval = 60, year = 2020))]
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &self,
        py: Python<'_>,
        dsm: PyReadonlyArray2<f64>,
        scale: f64,
        longitude: f64,
        latitude: f64,
        utc_offset: f64,
        time_interval: u32,
        year: i32,
    ) -> PyResult<(Py<PyArray2<f64>>, Vec<Py<PyArray2<f64>>>)> {
        self.progress.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);

        if !(scale > 0.0) {
            return Err(SolarError::invalid("scale", scale, "must be positive").into());
        }
        let cell = 1.0 / scale;
        let grid = Grid::new(
            dsm.as_array().to_owned(),
            crate::grid::GeoTransform::new(0.0, 0.0, cell, -cell),
        );
        let altitude = grid.median().filter(|m| *m >= 0.0).unwrap_or(3.0);
        let location = Location::new(longitude, latitude, altitude)?;
        let config = SolarConfig {
            utc_offset,
            time_interval_minutes: time_interval,
            shadow_year: year,
            ..SolarConfig::default()
        };
        config.validate()?;

        let cancel = crate::progress::CancelToken::from_flag(self.cancelled.clone());
        let progress = crate::progress::AtomicProgress::from_counter(self.progress.clone());
        let result = py.allow_threads(|| {
            let ctx = RunContext::new(&cancel, &progress);
            seasonal_shadow(&grid, &location, &config, None, &ctx)
        })?;

        match result {
            Completion::Finished(seasonal) => {
                let daily = seasonal
                    .daily
                    .into_iter()
                    .map(|g| g.into_data().into_pyarray(py).unbind())
                    .collect();
                Ok((seasonal.composite.into_data().into_pyarray(py).unbind(), daily))
            }
            Completion::Cancelled(_) => Err(pyo3::exceptions::PyInterruptedError::new_err(
                "Seasonal shadow computation cancelled",
            )),
        }
    }
}
