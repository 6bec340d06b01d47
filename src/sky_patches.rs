//! Sky vault decomposition and per-patch annual irradiance.
//!
//! The vault is split into 145 patches (Robinson & Stone layout). Each hour
//! of the meteorological series distributes its beam, diffuse and
//! ground-reflected shortwave over the patches; the sums are the annual
//! Wh/m² each patch delivers.
//!
//! Diffuse luminance follows Perez, Seals & Michalsky (1993), Solar Energy
//! 50(3), 235-245.

use std::sync::OnceLock;

use chrono::Duration;
#[cfg(feature = "python")]
use ndarray::Array2;

#[cfg(feature = "python")]
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
#[cfg(feature = "python")]
use pyo3::prelude::*;

use crate::error::{Result, SolarError};
use crate::metdata::MetSeries;
use crate::sun_position::{sun_position, Location};

pub const PATCH_COUNT: usize = 145;
const BAND_ALTITUDES: [f64; 8] = [6., 18., 30., 42., 54., 66., 78., 90.];
const BAND_AZIMUTH_START: [f64; 8] = [0., 4., 2., 5., 8., 0., 10., 0.];
const PATCHES_IN_BAND: [usize; 8] = [30, 30, 24, 24, 18, 12, 6, 1];
const MIN_SUN_ELEVATION_DEG: f64 = 3.0;
const MIN_DIFFUSE: f64 = 10.0;

// Perez coefficients, 8 clearness bins x 4 polynomial terms.
const M_A1: [f64; 8] = [1.3525, -1.2219, -1.1000, -0.5484, -0.6000, -1.0156, -1.0000, -1.0500];
const M_A2: [f64; 8] = [-0.2576, -0.7730, -0.2515, -0.6654, -0.3566, -0.3670, 0.0211, 0.0289];
const M_A3: [f64; 8] = [-0.2690, 1.4148, 0.8952, -0.2672, -2.5000, 1.0078, 0.5025, 0.4260];
const M_A4: [f64; 8] = [-1.4366, 1.1016, 0.0156, 0.7117, 2.3250, 1.4051, -0.5119, 0.3590];
const M_B1: [f64; 8] = [-0.7670, -0.2054, 0.2782, 0.7234, 0.2937, 0.2875, -0.3000, -0.3250];
const M_B2: [f64; 8] = [0.0007, 0.0367, -0.1812, -0.6219, 0.0496, -0.5328, 0.1922, 0.1156];
const M_B3: [f64; 8] = [1.2734, -3.9128, -4.5000, -5.6812, -5.6812, -3.8500, 0.7023, 0.7781];
const M_B4: [f64; 8] = [-0.1233, 0.9156, 1.1766, 2.6297, 1.8415, 3.3750, -1.6317, 0.0025];
const M_C1: [f64; 8] = [2.8000, 6.9750, 24.7219, 33.3389, 21.0000, 14.0000, 19.0000, 31.0625];
const M_C2: [f64; 8] = [0.6004, 0.1774, -13.0812, -18.3000, -4.7656, -0.9999, -5.0000, -14.5000];
const M_C3: [f64; 8] = [1.2375, 6.4477, -37.7000, -62.2500, -21.5906, -7.1406, 1.2438, -46.1148];
const M_C4: [f64; 8] = [1.0000, -0.1239, 34.8438, 52.0781, 7.2492, 7.5469, -1.9094, 55.3750];
const M_D1: [f64; 8] = [1.8734, -1.5798, -5.0000, -3.5000, -3.5000, -3.4000, -4.0000, -7.2312];
const M_D2: [f64; 8] = [0.6297, -0.5081, 1.5218, 0.0016, -0.1554, -0.1078, 0.0250, 0.4050];
const M_D3: [f64; 8] = [0.9738, -1.7812, 3.9229, 1.1477, 1.4062, -1.0750, 0.3844, 13.3500];
const M_D4: [f64; 8] = [0.2809, 0.1080, -2.6204, 0.1062, 0.3988, 1.5702, 0.2656, 0.6234];
const M_E1: [f64; 8] = [0.0356, 0.2624, -0.0156, 0.4659, 0.0032, -0.0672, 1.0468, 1.5000];
const M_E2: [f64; 8] = [-0.1246, 0.0672, 0.1597, -0.3296, 0.0766, 0.4016, -0.3788, -0.6426];
const M_E3: [f64; 8] = [-0.5718, -0.2190, 0.4199, -0.0876, -0.0656, 0.3017, -2.4517, 1.8564];
const M_E4: [f64; 8] = [0.9938, -0.4285, -0.5562, -0.0329, -0.1294, -0.4844, 1.4656, 0.5636];

/// Centre of one sky patch and its solid angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPatch {
    pub altitude: f64,
    pub azimuth: f64,
    pub steradian: f64,
}

/// The 145-patch layout, ordered by altitude band then azimuth.
pub fn patch_layout() -> &'static [SkyPatch] {
    static LAYOUT: OnceLock<Vec<SkyPatch>> = OnceLock::new();
    LAYOUT.get_or_init(|| {
        let mut altitudes = Vec::with_capacity(PATCH_COUNT);
        let mut azimuths = Vec::with_capacity(PATCH_COUNT);
        for (band, &alt) in BAND_ALTITUDES.iter().enumerate() {
            let n = PATCHES_IN_BAND[band];
            let step = 360.0 / n as f64;
            for k in 0..n {
                altitudes.push(alt);
                azimuths.push(k as f64 * step + BAND_AZIMUTH_START[band]);
            }
        }
        let steradians = compute_steradians(&altitudes);
        altitudes
            .into_iter()
            .zip(azimuths)
            .zip(steradians)
            .map(|((altitude, azimuth), steradian)| SkyPatch {
                altitude,
                azimuth,
                steradian,
            })
            .collect()
    })
}

/// Solid angle of each patch given the per-patch altitude list.
pub(crate) fn compute_steradians(altitudes: &[f64]) -> Vec<f64> {
    let Some(&first_alt) = altitudes.first() else {
        return Vec::new();
    };
    let band_count = |alt: f64| altitudes.iter().filter(|&&a| (a - alt).abs() < 1e-9).count();

    altitudes
        .iter()
        .enumerate()
        .map(|(i, &alt)| {
            let count = band_count(alt);
            let width = (360.0 / count as f64).to_radians();
            if count > 1 || i == 0 {
                width * ((alt + first_alt).to_radians().sin() - (alt - first_alt).to_radians().sin())
            } else {
                let prev = altitudes[i - 1];
                width * (alt.to_radians().sin() - (prev + first_alt).to_radians().sin())
            }
        })
        .collect()
}

/// Normalised Perez all-weather luminance of each patch.
///
/// Falls back to a uniform sky for a low sun, weak diffuse light, or
/// coefficients that produce negative luminance.
pub(crate) fn perez_luminance(
    zenith_deg: f64,
    azimuth_deg: f64,
    diffuse: f64,
    direct: f64,
    day_of_year: u32,
    patches: &[SkyPatch],
) -> Vec<f64> {
    let n = patches.len();
    let uniform = vec![1.0 / n as f64; n];
    let altitude_deg = 90.0 - zenith_deg;
    if altitude_deg < MIN_SUN_ELEVATION_DEG || diffuse < MIN_DIFFUSE {
        return uniform;
    }

    let zen = zenith_deg.to_radians();
    let azimuth = azimuth_deg.to_radians();
    let altitude = altitude_deg.to_radians();

    let idh = diffuse.max(1.0);
    let clearness = ((idh + direct) / idh + 1.041 * zen.powi(3)) / (1.0 + 1.041 * zen.powi(3));

    // Extra-terrestrial irradiance
    let day_angle = f64::from(day_of_year) * 2.0 * std::f64::consts::PI / 365.0;
    let i0 = 1367.0
        * (1.00011
            + 0.034221 * day_angle.cos()
            + 0.00128 * day_angle.sin()
            + 0.000719 * (2.0 * day_angle).cos()
            + 0.000077 * (2.0 * day_angle).sin());

    // Kasten & Young (1989)
    let air_mass = if altitude_deg >= 10.0 {
        1.0 / altitude.sin()
    } else {
        1.0 / (altitude.sin() + 0.50572 * (altitude_deg + 6.07995).powf(-1.6364))
    }
    .min(40.0);
    let brightness = if diffuse <= MIN_DIFFUSE { 0.0 } else { air_mass * diffuse / i0 };

    let bin = [1.065, 1.230, 1.500, 1.950, 2.800, 4.500, 6.200]
        .iter()
        .position(|&edge| clearness < edge)
        .unwrap_or(7);

    let term = |c1: &[f64; 8], c2: &[f64; 8], c3: &[f64; 8], c4: &[f64; 8]| {
        c1[bin] + c2[bin] * zen + brightness * (c3[bin] + c4[bin] * zen)
    };
    let m_a = term(&M_A1, &M_A2, &M_A3, &M_A4);
    let m_b = term(&M_B1, &M_B2, &M_B3, &M_B4);
    let m_e = term(&M_E1, &M_E2, &M_E3, &M_E4);
    let (m_c, m_d) = if bin > 0 {
        (term(&M_C1, &M_C2, &M_C3, &M_C4), term(&M_D1, &M_D2, &M_D3, &M_D4))
    } else {
        let c = (brightness * (M_C1[0] + M_C2[0] * zen)).powf(M_C3[0]).exp() - 1.0;
        let d = -(brightness * (M_D1[0] + M_D2[0] * zen)).exp() + M_D3[0] + brightness * M_D4[0];
        (c, d)
    };

    let (sin_alt, cos_alt) = altitude.sin_cos();
    let luminance: Vec<f64> = patches
        .iter()
        .map(|p| {
            let pa = p.altitude.to_radians();
            let cos_sky_sun =
                pa.sin() * sin_alt + cos_alt * pa.cos() * (p.azimuth.to_radians() - azimuth).abs().cos();
            let horizon = 1.0 + m_a * (m_b / (90.0 - p.altitude).to_radians().cos()).exp();
            let ang = cos_sky_sun.clamp(-1.0, 1.0).acos();
            let circumsolar = 1.0 + m_c * (m_d * ang).exp() + m_e * cos_sky_sun * cos_sky_sun;
            horizon * circumsolar
        })
        .collect();

    let sum: f64 = luminance.iter().sum();
    if !sum.is_finite() || sum <= 0.0 || luminance.iter().any(|&v| v < 0.0) {
        return uniform;
    }
    luminance.into_iter().map(|v| v / sum).collect()
}

/// Index of the patch closest in angle to a sun position.
pub fn nearest_patch(altitude_deg: f64, azimuth_deg: f64, patches: &[SkyPatch]) -> usize {
    let (s_alt, c_alt) = altitude_deg.to_radians().sin_cos();
    let azi = azimuth_deg.to_radians();
    let mut best = 0;
    let mut best_cos = f64::NEG_INFINITY;
    for (i, p) in patches.iter().enumerate() {
        let (ps, pc) = p.altitude.to_radians().sin_cos();
        let cos_angle = s_alt * ps + c_alt * pc * (p.azimuth.to_radians() - azi).cos();
        if cos_angle > best_cos {
            best_cos = cos_angle;
            best = i;
        }
    }
    best
}

/// Annual Wh/m² delivered by one sky patch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchIrradiance {
    pub altitude: f64,
    pub azimuth: f64,
    pub direct: f64,
    pub diffuse: f64,
    pub reflected: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkyIrradiance {
    patches: Vec<PatchIrradiance>,
}

impl SkyIrradiance {
    /// Accumulate a meteorological series over the sky vault.
    ///
    /// Rows are stamped at the end of their hour in local standard time;
    /// each is evaluated at its midpoint in UTC.
    pub fn from_met(
        met: &MetSeries,
        location: &Location,
        utc_offset: f64,
        albedo: f64,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&albedo) {
            return Err(SolarError::invalid("albedo", albedo, "must be in [0, 1]"));
        }
        let layout = patch_layout();
        let mut patches: Vec<PatchIrradiance> = layout
            .iter()
            .map(|p| PatchIrradiance {
                altitude: p.altitude,
                azimuth: p.azimuth,
                direct: 0.0,
                diffuse: 0.0,
                reflected: 0.0,
            })
            .collect();

        let shift = Duration::minutes((utc_offset * 60.0).round() as i64 + 30);
        let reflected_share = 1.0 / layout.len() as f64;
        let mut clamped = 0usize;
        let mut sun_up = 0usize;

        for record in met.records() {
            let utc = record.timestamp - shift;
            let sun = sun_position(utc, location);
            if !sun.is_up() {
                continue;
            }
            sun_up += 1;

            let clamp = |v: f64, clamped: &mut usize| {
                if v < 0.0 {
                    *clamped += 1;
                    0.0
                } else {
                    v
                }
            };
            let kdir = clamp(record.kdir, &mut clamped);
            let kdiff = clamp(record.kdiff, &mut clamped);
            let kdown = clamp(record.kdown, &mut clamped);

            if kdir > 0.0 {
                let i = nearest_patch(sun.altitude, sun.azimuth, layout);
                patches[i].direct += kdir;
            }
            if kdiff > 0.0 {
                let day = chrono::Datelike::ordinal(&utc);
                let lv = perez_luminance(sun.zenith, sun.azimuth, kdiff, kdir, day, layout);
                for (p, w) in patches.iter_mut().zip(lv) {
                    p.diffuse += kdiff * w;
                }
            }
            if kdown > 0.0 {
                let r = albedo * kdown * reflected_share;
                for p in patches.iter_mut() {
                    p.reflected += r;
                }
            }
        }

        if clamped > 0 {
            tracing::warn!(values = clamped, "negative or missing irradiance clamped to 0");
        }
        tracing::info!(rows = met.len(), sun_up, "sky irradiance table built");
        Ok(Self { patches })
    }

    pub fn from_patches(patches: Vec<PatchIrradiance>) -> Self {
        Self { patches }
    }

    pub fn patches(&self) -> &[PatchIrradiance] {
        &self.patches
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Sum of all components over all patches, Wh/m².
    pub fn total(&self) -> f64 {
        self.patches
            .iter()
            .map(|p| p.direct + p.diffuse + p.reflected)
            .sum()
    }
}

#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(signature = (met, longitude, latitude, altitude, utc_offset = 0.0, albedo = 0.15))]
/// Per-patch `[altitude, azimuth, direct, diffuse, reflected]` table from a
/// UMEP-layout meteorological array.
pub fn sky_irradiance_table(
    py: Python<'_>,
    met: PyReadonlyArray2<f64>,
    longitude: f64,
    latitude: f64,
    altitude: f64,
    utc_offset: f64,
    albedo: f64,
) -> PyResult<Py<PyArray2<f64>>> {
    let series = MetSeries::from_array(met.as_array().to_owned())?;
    let location = Location::new(longitude, latitude, altitude)?;
    let sky = py.allow_threads(|| SkyIrradiance::from_met(&series, &location, utc_offset, albedo))?;
    let mut table = Array2::<f64>::zeros((sky.len(), 5));
    for (mut row, p) in table.outer_iter_mut().zip(sky.patches()) {
        row[0] = p.altitude;
        row[1] = p.azimuth;
        row[2] = p.direct;
        row[3] = p.diffuse;
        row[4] = p.reflected;
    }
    Ok(table.into_pyarray(py).unbind())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metdata::{col, MET_COLUMNS, MISSING};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn london() -> Location {
        Location::new(-0.12, 51.5, 20.0).unwrap()
    }

    /// One day of hourly rows with constant radiation during daylight hours.
    fn one_day(doy: f64, kdown: f64, kdiff: f64, kdir: f64) -> MetSeries {
        let mut data = Array2::from_elem((24, MET_COLUMNS), MISSING);
        for h in 0..24 {
            let mut row = data.row_mut(h);
            row[col::YEAR] = 2020.0;
            row[col::DOY] = doy;
            row[col::HOUR] = h as f64;
            row[col::MINUTE] = 0.0;
            let day = (7..=19).contains(&h);
            row[col::KDOWN] = if day { kdown } else { 0.0 };
            row[col::KDIFF] = if day { kdiff } else { 0.0 };
            row[col::KDIR] = if day { kdir } else { 0.0 };
        }
        MetSeries::from_array(data).unwrap()
    }

    #[test]
    fn layout_has_145_patches() {
        let layout = patch_layout();
        assert_eq!(layout.len(), PATCH_COUNT);
        assert_eq!(layout[0].altitude, 6.0);
        assert_eq!(layout[30].azimuth, 4.0);
        assert_eq!(layout[144].altitude, 90.0);
        assert!(layout.iter().all(|p| p.steradian > 0.0));
    }

    #[test]
    fn steradians_cover_the_hemisphere() {
        let total: f64 = patch_layout().iter().map(|p| p.steradian).sum();
        assert_relative_eq!(total, 2.0 * std::f64::consts::PI, max_relative = 0.02);
    }

    #[test]
    fn perez_is_normalised() {
        let lv = perez_luminance(30.0, 180.0, 200.0, 400.0, 180, patch_layout());
        assert_relative_eq!(lv.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        // brighter toward the sun than away from it
        let towards = nearest_patch(60.0, 180.0, patch_layout());
        let away = nearest_patch(60.0, 0.0, patch_layout());
        assert!(lv[towards] > lv[away]);
    }

    #[test]
    fn perez_low_sun_is_uniform() {
        let lv = perez_luminance(89.0, 180.0, 50.0, 10.0, 180, patch_layout());
        assert!(lv.iter().all(|&v| (v - 1.0 / PATCH_COUNT as f64).abs() < 1e-12));
    }

    #[test]
    fn nearest_patch_of_zenith_is_top() {
        assert_eq!(nearest_patch(89.0, 10.0, patch_layout()), PATCH_COUNT - 1);
        assert_eq!(nearest_patch(6.0, 0.0, patch_layout()), 0);
    }

    #[test]
    fn night_only_series_gives_no_direct() {
        let mut data = Array2::from_elem((3, MET_COLUMNS), 0.0);
        for (i, h) in [0.0, 1.0, 2.0].iter().enumerate() {
            data[[i, col::YEAR]] = 2020.0;
            data[[i, col::DOY]] = 355.0;
            data[[i, col::HOUR]] = *h;
            data[[i, col::KDIR]] = 500.0;
        }
        let met = MetSeries::from_array(data).unwrap();
        let sky = SkyIrradiance::from_met(&met, &london(), 0.0, 0.15).unwrap();
        assert_eq!(sky.len(), PATCH_COUNT);
        assert!(sky.patches().iter().all(|p| p.direct == 0.0));
    }

    #[test]
    fn values_are_non_negative_and_conserved() {
        let met = one_day(172.0, 600.0, 200.0, 500.0);
        let sky = SkyIrradiance::from_met(&met, &london(), 0.0, 0.2).unwrap();
        assert!(sky
            .patches()
            .iter()
            .all(|p| p.direct >= 0.0 && p.diffuse >= 0.0 && p.reflected >= 0.0));

        let direct: f64 = sky.patches().iter().map(|p| p.direct).sum();
        let diffuse: f64 = sky.patches().iter().map(|p| p.diffuse).sum();
        let reflected: f64 = sky.patches().iter().map(|p| p.reflected).sum();
        // 13 daylight rows, all with the sun up at midsummer
        assert_relative_eq!(direct, 13.0 * 500.0, epsilon = 1e-6);
        assert_relative_eq!(diffuse, 13.0 * 200.0, epsilon = 1e-6);
        assert_relative_eq!(reflected, 13.0 * 600.0 * 0.2, epsilon = 1e-6);
    }

    #[test]
    fn negative_and_missing_values_are_clamped() {
        let met = one_day(172.0, 600.0, MISSING, -20.0);
        let sky = SkyIrradiance::from_met(&met, &london(), 0.0, 0.15).unwrap();
        assert!(sky.patches().iter().all(|p| p.direct == 0.0 && p.diffuse == 0.0));
        assert!(sky.total() > 0.0);
    }

    #[test]
    fn table_is_deterministic() {
        let met = one_day(80.0, 400.0, 150.0, 300.0);
        let a = SkyIrradiance::from_met(&met, &london(), 1.0, 0.15).unwrap();
        let b = SkyIrradiance::from_met(&met, &london(), 1.0, 0.15).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_bad_albedo() {
        let met = one_day(80.0, 400.0, 150.0, 300.0);
        assert!(SkyIrradiance::from_met(&met, &london(), 0.0, 1.5).is_err());
    }
}
