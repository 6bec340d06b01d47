//! Annual roof irradiance.
//!
//! Every sky patch contributes its direct, diffuse and ground-reflected
//! energy to each pixel, gated by whether the pixel sees that patch. Patches
//! are visited in table order so the sums are reproducible.

use ndarray::{Array2, ArrayView2, Zip};

#[cfg(feature = "python")]
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(feature = "python")]
use std::sync::Arc;

use crate::error::Result;
use crate::grid::{ensure_same_shape, Grid};
use crate::progress::{Completion, RunContext};
use crate::shadowing::ShadowCaster;
use crate::sky_patches::{PatchIrradiance, SkyIrradiance};
use crate::terrain::slope_aspect;

const WH_PER_KWH: f64 = 1000.0;

/// Cosine of the incidence angle between a patch direction and each pixel's
/// surface normal, clamped at 0. Angles in radians except the patch, which is
/// in degrees.
pub fn incidence(
    slope: ArrayView2<f64>,
    aspect: ArrayView2<f64>,
    patch_altitude: f64,
    patch_azimuth: f64,
) -> Array2<f64> {
    let (sin_alt, cos_alt) = patch_altitude.to_radians().sin_cos();
    let azimuth = patch_azimuth.to_radians();
    let mut out = Array2::<f64>::zeros(slope.dim());
    Zip::from(&mut out)
        .and(slope)
        .and(aspect)
        .par_for_each(|o, &s, &a| {
            let c = s.sin() * cos_alt * (azimuth - a).cos() + s.cos() * sin_alt;
            *o = c.max(0.0);
        });
    out
}

/// Add one patch's energy (Wh/m²) into `total`.
fn add_patch(total: &mut Array2<f64>, sunlit: &Array2<f64>, cos_i: &Array2<f64>, patch: &PatchIrradiance) {
    let direct = if patch.direct > 0.0 { patch.direct } else { 0.0 };
    Zip::from(total)
        .and(sunlit)
        .and(cos_i)
        .par_for_each(|t, &lit, &ci| {
            *t += lit * direct * ci + patch.diffuse * lit + patch.reflected * (1.0 - lit);
        });
}

/// Annual energy in kWh/m² for a prepared surface.
///
/// `wall_aspect` is in degrees. The cancellation flag is polled before each
/// patch and progress moves linearly across the table.
pub fn accumulate_energy_pure(
    dsm: ArrayView2<f64>,
    walls: ArrayView2<f64>,
    wall_aspect: ArrayView2<f64>,
    scale: f64,
    sky: &SkyIrradiance,
    ctx: &RunContext<'_>,
) -> Result<Completion<Array2<f64>>> {
    ensure_same_shape(dsm, walls, "walls")?;
    ensure_same_shape(dsm, wall_aspect, "wall aspect")?;

    let (slope, aspect) = slope_aspect(dsm, scale)?;
    let aspect_rad = wall_aspect.mapv(f64::to_radians);
    let caster = ShadowCaster::new(dsm, scale)?;

    let mut total = Array2::<f64>::zeros(dsm.dim());
    let n = sky.len();
    for (index, patch) in sky.patches().iter().enumerate() {
        if ctx.is_cancelled() {
            tracing::info!(patch = index, "energy accumulation cancelled");
            total.par_mapv_inplace(|v| v / WH_PER_KWH);
            return Ok(Completion::Cancelled(total));
        }
        let cos_i = incidence(slope.view(), aspect.view(), patch.altitude, patch.azimuth);
        let shading =
            caster.cast_with_walls(walls, aspect_rad.view(), patch.azimuth, patch.altitude)?;
        add_patch(&mut total, &shading.ground, &cos_i, patch);
        tracing::debug!(patch = index, altitude = patch.altitude, azimuth = patch.azimuth, "patch added");
        ctx.report((index + 1) as f64 / n as f64);
    }

    total.par_mapv_inplace(|v| v / WH_PER_KWH);
    Ok(Completion::Finished(total))
}

/// Annual energy grid for a surface, its walls and wall aspect (degrees).
pub fn annual_energy(
    dsm: &Grid,
    walls: &Grid,
    wall_aspect: &Grid,
    sky: &SkyIrradiance,
    ctx: &RunContext<'_>,
) -> Result<Completion<Grid>> {
    dsm.ensure_same_frame(walls, "walls")?;
    dsm.ensure_same_frame(wall_aspect, "wall aspect")?;
    let surface = dsm.prepared_surface();
    let scale = surface.scale()?;
    let result = accumulate_energy_pure(
        surface.view(),
        walls.view(),
        wall_aspect.view(),
        scale,
        sky,
        ctx,
    )?;
    if let Completion::Finished(ref e) = result {
        let peak = e.iter().copied().fold(0.0_f64, f64::max);
        tracing::info!(patches = sky.len(), peak_kwh = peak, "annual energy accumulated");
    }
    Ok(match result {
        Completion::Finished(e) => Completion::Finished(dsm.derive(e)?),
        Completion::Cancelled(e) => Completion::Cancelled(dsm.derive(e)?),
    })
}

#[cfg(feature = "python")]
fn sky_from_table(table: ArrayView2<f64>) -> PyResult<SkyIrradiance> {
    if table.ncols() != 5 {
        return Err(pyo3::exceptions::PyValueError::new_err(format!(
            "sky table must have 5 columns [altitude, azimuth, direct, diffuse, reflected], got {}",
            table.ncols()
        )));
    }
    Ok(SkyIrradiance::from_patches(
        table
            .rows()
            .into_iter()
            .map(|r| PatchIrradiance {
                altitude: r[0],
                azimuth: r[1],
                direct: r[2],
                diffuse: r[3],
                reflected: r[4],
            })
            .collect(),
    ))
}

/// Runner that exposes pollable progress() and cancel() for the annual
/// energy accumulation.
#[cfg(feature = "python")]
#[pyclass]
pub struct SolarEnergyRunner {
    progress: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

#[cfg(feature = "python")]
impl Default for SolarEnergyRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl SolarEnergyRunner {
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

    /// Annual kWh/m². `sky` is the table from `sky.sky_irradiance_table`,
    /// `wall_aspect` is in degrees.
    pub fn compute(
        &self,
        py: Python<'_>,
        dsm: PyReadonlyArray2<f64>,
        walls: PyReadonlyArray2<f64>,
        wall_aspect: PyReadonlyArray2<f64>,
        scale: f64,
        sky: PyReadonlyArray2<f64>,
    ) -> PyResult<Py<PyArray2<f64>>> {
        self.progress.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);

        let sky = sky_from_table(sky.as_array())?;
        let dsm_owned = dsm.as_array().to_owned();
        let walls_owned = walls.as_array().to_owned();
        let aspect_owned = wall_aspect.as_array().to_owned();
        let cancel = crate::progress::CancelToken::from_flag(self.cancelled.clone());
        let progress = crate::progress::AtomicProgress::from_counter(self.progress.clone());

        let result = py.allow_threads(|| {
            let ctx = RunContext::new(&cancel, &progress);
            accumulate_energy_pure(
                dsm_owned.view(),
                walls_owned.view(),
                aspect_owned.view(),
                scale,
                &sky,
                &ctx,
            )
        })?;

        match result {
            Completion::Finished(arr) => Ok(arr.into_pyarray(py).unbind()),
            Completion::Cancelled(_) => Err(pyo3::exceptions::PyInterruptedError::new_err(
                "Solar energy computation cancelled",
            )),
        }
    }
}
