//! Run configuration.
//!
//! One immutable record carries every tunable constant of a run. It is built
//! once (usually from TOML) and passed by reference into each stage.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolarError};
use crate::grid::NODATA;

/// Default wall height threshold in metres.
pub const WALL_LIMIT: f64 = 3.0;
/// Wall-orientation kernel size as a multiple of pixels per metre.
pub const WALL_KERNEL_FACTOR: f64 = 9.0;
/// Pixel size of the resampled wide-area surface, metres.
pub const WIDE_SCALE_FACTOR: f64 = 10.0;
pub const BRITISH_NATIONAL_GRID: u32 = 27700;
pub const WEB_MERCATOR: u32 = 3857;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolarConfig {
    pub data_directory: PathBuf,
    pub results_directory: PathBuf,
    pub local_extent: Option<PathBuf>,
    pub buildings: Option<PathBuf>,
    pub dsm: Option<PathBuf>,
    pub dtm: Option<PathBuf>,
    pub met_file: Option<PathBuf>,
    pub use_wide_area: bool,
    pub wide_area_boundary: Option<PathBuf>,

    /// Minimum wall height, metres.
    pub wall_limit: f64,
    /// Hours east of UTC.
    pub utc_offset: f64,
    pub albedo: f64,
    /// Canopy transmissivity. Vegetation is never modelled, so this is
    /// carried for completeness only.
    pub transmissivity: f64,
    pub time_interval_minutes: u32,
    pub shadow_year: i32,
    pub wide_scale_factor: f64,
    pub wall_kernel_factor: f64,
    pub nodata: f64,
    pub epsg: u32,
    /// Heights at or below this (above terrain) are not roofs.
    pub roof_height_threshold: f64,

    pub seasons: Vec<SeasonalDate>,
    pub roof: RoofCriteria,
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("DATA"),
            results_directory: PathBuf::from("RESULTS"),
            local_extent: None,
            buildings: None,
            dsm: None,
            dtm: None,
            met_file: None,
            use_wide_area: false,
            wide_area_boundary: None,
            wall_limit: WALL_LIMIT,
            utc_offset: 0.0,
            albedo: 0.15,
            transmissivity: 0.03,
            time_interval_minutes: 60,
            shadow_year: 2020,
            wide_scale_factor: WIDE_SCALE_FACTOR,
            wall_kernel_factor: WALL_KERNEL_FACTOR,
            nodata: NODATA,
            epsg: BRITISH_NATIONAL_GRID,
            roof_height_threshold: 2.0,
            seasons: SeasonalDate::reference_dates().to_vec(),
            roof: RoofCriteria::default(),
        }
    }
}

impl SolarConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SolarConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.albedo) {
            return Err(SolarError::invalid("albedo", self.albedo, "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.transmissivity) {
            return Err(SolarError::invalid(
                "transmissivity",
                self.transmissivity,
                "must be in [0, 1]",
            ));
        }
        if self.time_interval_minutes == 0 || 1440 % self.time_interval_minutes != 0 {
            return Err(SolarError::invalid(
                "time_interval_minutes",
                self.time_interval_minutes,
                "must divide a day (1440 minutes)",
            ));
        }
        if !(self.wall_limit > 0.0) {
            return Err(SolarError::invalid("wall_limit", self.wall_limit, "must be positive"));
        }
        if !(self.wide_scale_factor > 0.0) {
            return Err(SolarError::invalid(
                "wide_scale_factor",
                self.wide_scale_factor,
                "must be positive",
            ));
        }
        if !(self.wall_kernel_factor > 0.0) {
            return Err(SolarError::invalid(
                "wall_kernel_factor",
                self.wall_kernel_factor,
                "must be positive",
            ));
        }
        if !(-14.0..=14.0).contains(&self.utc_offset) {
            return Err(SolarError::invalid("utc_offset", self.utc_offset, "must be within ±14 h"));
        }
        if self.use_wide_area && self.wide_area_boundary.is_none() {
            return Err(SolarError::Config(
                "use_wide_area is set but wide_area_boundary is missing".into(),
            ));
        }
        if self.seasons.is_empty() {
            return Err(SolarError::Config("at least one seasonal date is required".into()));
        }
        for season in &self.seasons {
            season.date(self.shadow_year)?;
            if !(0.0..=1.0).contains(&season.threshold) {
                return Err(SolarError::invalid(
                    format!("seasons.{}.threshold", season.label),
                    season.threshold,
                    "must be in [0, 1]",
                ));
            }
        }
        self.roof.validate()
    }

    pub fn results_path(&self, file_name: &str) -> PathBuf {
        self.results_directory.join(file_name)
    }
}

/// A representative calendar date for the seasonal shadow composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalDate {
    pub label: String,
    pub month: u32,
    pub day: u32,
    /// Daylight-saving offset in whole hours.
    pub dst_hours: i32,
    /// Daily mean sunlit fraction must exceed this to count as sunlit.
    pub threshold: f64,
}

impl SeasonalDate {
    fn new(label: &str, month: u32, day: u32, dst_hours: i32, threshold: f64) -> Self {
        Self {
            label: label.to_string(),
            month,
            day,
            dst_hours,
            threshold,
        }
    }

    /// Equinoxes and solstices, with their empirically tuned thresholds.
    pub fn reference_dates() -> [SeasonalDate; 4] {
        [
            SeasonalDate::new("March", 3, 20, 0, 0.5),
            SeasonalDate::new("June", 6, 21, 1, 0.5),
            SeasonalDate::new("September", 9, 23, 1, 0.6),
            SeasonalDate::new("December", 12, 22, 0, 0.4),
        ]
    }

    pub fn date(&self, year: i32) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day).ok_or_else(|| {
            SolarError::invalid(
                format!("seasons.{}", self.label),
                format!("{year}-{}-{}", self.month, self.day),
                "not a calendar date",
            )
        })
    }
}

/// Thresholds and panel constants for the roof suitability filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoofCriteria {
    /// Roofs must be strictly larger than this (m², true area).
    pub min_true_area: f64,
    pub max_slope: f64,
    /// Roofs flatter than this (degrees) count as flat.
    pub flat_slope: f64,
    /// Pitched roofs facing between `north_max_aspect` and
    /// `north_min_aspect` (through north) are rejected.
    pub north_min_aspect: f64,
    pub north_max_aspect: f64,
    pub min_shade: f64,
    pub flat_fit: f64,
    pub pitched_fit: f64,
    /// Roof area one installed panel occupies, m².
    pub panel_footprint: f64,
    /// Active area of one panel, m².
    pub panel_area: f64,
    pub panel_rating: f64,
    pub system_efficiency: f64,
}

impl Default for RoofCriteria {
    fn default() -> Self {
        Self {
            min_true_area: 16.0,
            max_slope: 60.0,
            flat_slope: 10.0,
            north_min_aspect: 67.5,
            north_max_aspect: 292.5,
            min_shade: 0.5,
            flat_fit: 0.7,
            pitched_fit: 0.7284,
            panel_footprint: 1.75,
            panel_area: 1.65,
            panel_rating: 0.2,
            system_efficiency: 0.789,
        }
    }
}

impl RoofCriteria {
    pub fn validate(&self) -> Result<()> {
        if !(self.panel_footprint > 0.0) {
            return Err(SolarError::invalid(
                "roof.panel_footprint",
                self.panel_footprint,
                "must be positive",
            ));
        }
        if !(0.0..90.0).contains(&self.max_slope) {
            return Err(SolarError::invalid(
                "roof.max_slope",
                self.max_slope,
                "must be in [0, 90)",
            ));
        }
        if self.north_min_aspect > self.north_max_aspect {
            return Err(SolarError::invalid(
                "roof.north_min_aspect",
                self.north_min_aspect,
                "must not exceed north_max_aspect",
            ));
        }
        Ok(())
    }
}
