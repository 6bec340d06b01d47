//! End-to-end runs: annual energy, seasonal shadow and roof energy.
//!
//! Each run validates the configuration once, then chains the kernels with
//! progress split across stages. All intermediate grids stay in Rust.

use std::fs;

use ndarray::Array2;

use crate::config::SolarConfig;
use crate::daily_shading::{seasonal_shadow, SeasonalShadow, WideArea};
use crate::error::{Result, SolarError};
use crate::grid::Grid;
use crate::irradiance::annual_energy;
use crate::metdata::MetSeries;
use crate::progress::{Completion, RunContext};
use crate::roofs::{
    assess_roofs, rank_roofs, write_rejected_csv_file, write_roofs_csv_file, RejectedRoof,
    RoofPlane, SuitableRoof, CSV_OUTPUT_FILENAME, REJECTED_CSV_FILENAME,
    SORTED_CSV_OUTPUT_FILENAME,
};
use crate::sky_patches::SkyIrradiance;
use crate::sun_position::Location;
use crate::wall_aspect::wall_aspect;
use crate::walls::detect_walls;

/// Grids produced by the annual energy run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolarOutputs {
    pub walls: Grid,
    /// Degrees clockwise from north; 0 off walls.
    pub wall_aspect: Grid,
    pub sky: SkyIrradiance,
    /// kWh/m² over the series.
    pub energy: Grid,
}

/// Walls, wall aspect (0–50%) and annual energy (50–100%) for a surface.
///
/// A cancelled run returns what finished; later grids are all zero.
pub fn run_solar_calculation(
    dsm: &Grid,
    met: &MetSeries,
    location: &Location,
    config: &SolarConfig,
    ctx: &RunContext<'_>,
) -> Result<Completion<SolarOutputs>> {
    config.validate()?;
    let surface = dsm.prepared_surface();
    let walls = detect_walls(&surface, config.wall_limit)?;
    let sky = SkyIrradiance::from_met(met, location, config.utc_offset, config.albedo)?;
    let zeros = || surface.derive(Array2::zeros(surface.dim()));

    let aspect = match wall_aspect(&walls, &surface, config.wall_kernel_factor, &ctx.stage(0.0, 50.0))? {
        Completion::Finished(a) => a,
        Completion::Cancelled(a) => {
            return Ok(Completion::Cancelled(SolarOutputs {
                walls,
                wall_aspect: a,
                sky,
                energy: zeros()?,
            }))
        }
    };

    let energy = annual_energy(&surface, &walls, &aspect, &sky, &ctx.stage(50.0, 100.0))?;
    let cancelled = energy.is_cancelled();
    let outputs = SolarOutputs {
        walls,
        wall_aspect: aspect,
        sky,
        energy: energy.into_inner(),
    };
    Ok(if cancelled {
        Completion::Cancelled(outputs)
    } else {
        Completion::Finished(outputs)
    })
}

/// Seasonal shadow composite. `wide` must be given when the configuration
/// asks for wide-area shading.
pub fn run_shadow_calculation(
    dsm: &Grid,
    location: &Location,
    config: &SolarConfig,
    wide: Option<&WideArea>,
    ctx: &RunContext<'_>,
) -> Result<Completion<SeasonalShadow>> {
    config.validate()?;
    if config.use_wide_area && wide.is_none() {
        return Err(SolarError::Precondition(
            "wide-area shading is enabled but no wide-area surface was supplied".into(),
        ));
    }
    let wide = if config.use_wide_area { wide } else { None };
    seasonal_shadow(dsm, location, config, wide, ctx)
}

/// Roof tables written by [`run_roof_energy`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoofEnergyReport {
    /// Accepted roofs, highest output first.
    pub ranked: Vec<SuitableRoof>,
    pub rejected: Vec<RejectedRoof>,
    pub skipped: usize,
    pub total_output_kwh: f64,
}

/// Assess roof planes and write the unsorted, sorted and rejected tables
/// under the results directory. Nothing is written when cancelled.
pub fn run_roof_energy(
    planes: &[RoofPlane],
    config: &SolarConfig,
    ctx: &RunContext<'_>,
) -> Result<Completion<RoofEnergyReport>> {
    config.validate()?;
    let assessment = match assess_roofs(planes, &config.roof, ctx) {
        Completion::Finished(a) => a,
        Completion::Cancelled(a) => {
            return Ok(Completion::Cancelled(RoofEnergyReport {
                ranked: a.suitable,
                rejected: a.rejected,
                skipped: a.skipped,
                total_output_kwh: a.total_output_kwh,
            }))
        }
    };

    fs::create_dir_all(&config.results_directory)?;
    write_roofs_csv_file(config.results_path(CSV_OUTPUT_FILENAME), &assessment.suitable)?;
    write_rejected_csv_file(config.results_path(REJECTED_CSV_FILENAME), &assessment.rejected)?;
    let ranked = rank_roofs(assessment.suitable);
    write_roofs_csv_file(config.results_path(SORTED_CSV_OUTPUT_FILENAME), &ranked)?;
    tracing::info!(
        directory = %config.results_directory.display(),
        roofs = ranked.len(),
        "roof tables written"
    );

    Ok(Completion::Finished(RoofEnergyReport {
        ranked,
        rejected: assessment.rejected,
        skipped: assessment.skipped,
        total_output_kwh: assessment.total_output_kwh,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GeoTransform;
    use crate::metdata::col;
    use crate::progress::{AtomicProgress, CancelToken, NoProgress};
    use geo::polygon;
    use ndarray::s;
    use std::path::PathBuf;

    fn block() -> Grid {
        // 20x20 at 1 m, a 10 m block on rows 8..12, cols 8..12
        let mut dsm = Array2::<f64>::zeros((20, 20));
        dsm.slice_mut(s![8..12, 8..12]).fill(10.0);
        Grid::new(dsm, GeoTransform::new(0.0, 20.0, 1.0, -1.0))
    }

    fn midsummer_noon() -> MetSeries {
        let mut data = Array2::<f64>::from_elem((1, 24), -999.0);
        let mut row = data.row_mut(0);
        row[col::YEAR] = 2020.0;
        row[col::DOY] = 173.0;
        row[col::HOUR] = 13.0;
        row[col::MINUTE] = 0.0;
        row[col::KDOWN] = 600.0;
        row[col::KDIFF] = 100.0;
        row[col::KDIR] = 800.0;
        MetSeries::from_array(data).unwrap()
    }

    fn location() -> Location {
        Location::new(-1.5, 51.5, 3.0).unwrap()
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rooftop_solar_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn solar_run_reaches_full_progress() {
        let cancel = CancelToken::new();
        let progress = AtomicProgress::new();
        let ctx = RunContext::new(&cancel, &progress);
        let out = run_solar_calculation(&block(), &midsummer_noon(), &location(), &SolarConfig::default(), &ctx)
            .unwrap()
            .finished()
            .unwrap();

        assert_eq!(progress.get(), 100);
        assert_eq!(out.sky.len(), 145);
        assert!(out.walls.data().iter().any(|&w| w >= 3.0));
        assert!(out.energy.data().iter().all(|&e| e >= 0.0));
        let roof = out.energy.data()[[10, 10]];
        let north_ground = out.energy.data()[[6, 10]];
        assert!(roof > north_ground, "roof {roof} vs ground {north_ground}");
        assert_eq!(out.energy.transform(), block().transform());
    }

    #[test]
    fn cancelled_solar_run_has_empty_energy() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let out = run_solar_calculation(&block(), &midsummer_noon(), &location(), &SolarConfig::default(), &ctx)
            .unwrap();
        assert!(out.is_cancelled());
        assert!(out.into_inner().energy.data().iter().all(|&e| e == 0.0));
    }

    #[test]
    fn invalid_config_is_rejected_before_work() {
        let config = SolarConfig {
            time_interval_minutes: 7,
            ..SolarConfig::default()
        };
        let cancel = CancelToken::new();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let err = run_shadow_calculation(&block(), &location(), &config, None, &ctx).unwrap_err();
        assert!(matches!(err, SolarError::InvalidParameter { .. }));
    }

    #[test]
    fn wide_area_flag_needs_a_surface() {
        let config = SolarConfig {
            use_wide_area: true,
            ..SolarConfig::default()
        };
        let cancel = CancelToken::new();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let err = run_shadow_calculation(&block(), &location(), &config, None, &ctx).unwrap_err();
        assert!(matches!(err, SolarError::Precondition(_)));
    }

    #[test]
    fn shadow_run_produces_a_composite() {
        let cancel = CancelToken::new();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let shadow = run_shadow_calculation(&block(), &location(), &SolarConfig::default(), None, &ctx)
            .unwrap()
            .finished()
            .unwrap();
        assert_eq!(shadow.daily.len(), 4);
        assert_eq!(shadow.composite.data()[[10, 10]], 1.0);
        assert_eq!(shadow.composite.data()[[7, 10]], 0.0);
    }

    fn roof(x0: f64, irradiance: f64) -> RoofPlane {
        RoofPlane {
            geometry: Some(polygon![
                (x: x0, y: 0.0),
                (x: x0 + 4.0, y: 0.0),
                (x: x0 + 4.0, y: 5.0),
                (x: x0, y: 5.0),
                (x: x0, y: 0.0),
            ]),
            cos_mean: -1.0,
            sin_mean: 0.0,
            slope_mean: 5.0,
            shade_mean: 0.9,
            irradiance_mean: irradiance,
        }
    }

    #[test]
    fn roof_run_writes_three_tables() {
        let dir = scratch_dir("roof_tables");
        let config = SolarConfig {
            results_directory: dir.clone(),
            ..SolarConfig::default()
        };
        let mut north = roof(20.0, 900.0);
        north.cos_mean = 1.0;
        north.slope_mean = 30.0;
        let planes = vec![
            roof(0.0, 800.0),
            roof(10.0, 1000.0),
            north,
            RoofPlane {
                geometry: None,
                ..roof(30.0, 1.0)
            },
        ];
        let cancel = CancelToken::new();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let report = run_roof_energy(&planes, &config, &ctx).unwrap().finished().unwrap();

        assert_eq!(report.ranked.len(), 2);
        assert_eq!(report.ranked[0].irradiance_mean, 1000.0);
        assert_eq!(report.ranked[0].id, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.skipped, 1);

        let unsorted = fs::read_to_string(dir.join(CSV_OUTPUT_FILENAME)).unwrap();
        let sorted = fs::read_to_string(dir.join(SORTED_CSV_OUTPUT_FILENAME)).unwrap();
        let rejected = fs::read_to_string(dir.join(REJECTED_CSV_FILENAME)).unwrap();
        assert_eq!(unsorted.lines().count(), 3);
        assert!(sorted.lines().nth(1).unwrap().contains(",1000.0,"));
        assert!(unsorted.lines().nth(1).unwrap().contains(",800.0,"));
        assert!(rejected.lines().nth(1).unwrap().ends_with("north facing"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cancelled_roof_run_writes_nothing() {
        let dir = scratch_dir("roof_cancelled");
        let config = SolarConfig {
            results_directory: dir.clone(),
            ..SolarConfig::default()
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = RunContext::new(&cancel, &NoProgress);
        let out = run_roof_energy(&[roof(0.0, 800.0)], &config, &ctx).unwrap();
        assert!(out.is_cancelled());
        assert!(!dir.exists());
    }
}
