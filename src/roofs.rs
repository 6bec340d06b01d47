//! Roof suitability, panel yield and result tables.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use geo::Polygon;
use serde::{Serialize, Serializer};

#[cfg(feature = "python")]
use pyo3::prelude::*;

use crate::config::{RoofCriteria, WEB_MERCATOR};
use crate::engine::{Feature, GeometryEngine};
use crate::error::{Result, SolarError};
use crate::progress::{Completion, RunContext};

pub const CSV_OUTPUT_FILENAME: &str = "SOLAR_PV_ROOF_ENERGY_OUTPUT.csv";
pub const SORTED_CSV_OUTPUT_FILENAME: &str = "SORTED_SOLAR_PV_ROOF_ENERGY_OUTPUT.csv";
pub const REJECTED_CSV_FILENAME: &str = "REJECTED_SOLAR_ROOFS.csv";

/// Attribute names of the zonal statistics on a roof-plane feature.
pub mod attr {
    pub const COS_MEAN: &str = "C_mean";
    pub const SIN_MEAN: &str = "S_mean";
    pub const SLOPE_MEAN: &str = "Slope_mean";
    pub const SHADE_MEAN: &str = "Shade_mean";
    pub const IRRAD_MEAN: &str = "Irrad_mean";
}

const ROOF_COLUMNS: [&str; 12] = [
    "id",
    "latitude",
    "longitude",
    "area_plan",
    "area_true",
    "Aspect_mean",
    "Slope_mean",
    "Shade_mean",
    "Irrad_mean",
    "Num_panels",
    "Roof_flat",
    "Output_kwh",
];

const REJECTED_COLUMNS: [&str; 10] = [
    "id",
    "latitude",
    "longitude",
    "area_plan",
    "area_true",
    "Aspect_mean",
    "Slope_mean",
    "Shade_mean",
    "Irrad_mean",
    "reason",
];

/// A roof plane with its zonal means. Slope is in degrees, shade is the
/// seasonal sunlit fraction, irradiance is annual kWh/m².
#[derive(Debug, Clone, PartialEq)]
pub struct RoofPlane {
    pub geometry: Option<Polygon<f64>>,
    pub cos_mean: f64,
    pub sin_mean: f64,
    pub slope_mean: f64,
    pub shade_mean: f64,
    pub irradiance_mean: f64,
}

impl From<&Feature> for RoofPlane {
    /// Missing attributes become NaN and the plane is later skipped.
    fn from(feature: &Feature) -> Self {
        let get = |name| feature.attribute(name).unwrap_or(f64::NAN);
        Self {
            geometry: feature.geometry.clone(),
            cos_mean: get(attr::COS_MEAN),
            sin_mean: get(attr::SIN_MEAN),
            slope_mean: get(attr::SLOPE_MEAN),
            shade_mean: get(attr::SHADE_MEAN),
            irradiance_mean: get(attr::IRRAD_MEAN),
        }
    }
}

/// Compass aspect in degrees from mean sine and cosine components,
/// in `(0, 360]`: due north is 360, not 0. Both components zero gives 0.
pub fn aspect_from_components(sin_mean: f64, cos_mean: f64) -> f64 {
    let radians = if cos_mean == 0.0 {
        if sin_mean > 0.0 {
            std::f64::consts::FRAC_PI_2
        } else if sin_mean < 0.0 {
            3.0 * std::f64::consts::FRAC_PI_2
        } else {
            0.0
        }
    } else {
        let a = (sin_mean / cos_mean).atan();
        if cos_mean > 0.0 && sin_mean > 0.0 {
            a
        } else if cos_mean < 0.0 {
            a + std::f64::consts::PI
        } else {
            a + std::f64::consts::TAU
        }
    };
    radians.to_degrees()
}

/// Sloped surface area of a plan area.
pub fn true_area(area_plan: f64, slope_deg: f64) -> f64 {
    area_plan / slope_deg.to_radians().cos()
}

/// Why a roof plane was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooSmall,
    TooSteep,
    NorthFacing,
    TooShaded,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::TooSmall => "too small",
            Rejection::TooSteep => "too steep",
            Rejection::NorthFacing => "north facing",
            Rejection::TooShaded => "too shaded",
        }
    }
}

/// First failed criterion, or `None` when the roof is suitable.
pub fn rejection(
    criteria: &RoofCriteria,
    area_true: f64,
    slope: f64,
    aspect: f64,
    shade: f64,
) -> Option<Rejection> {
    let north_facing = slope > criteria.flat_slope
        && (aspect < criteria.north_min_aspect || aspect > criteria.north_max_aspect);
    if !(area_true > criteria.min_true_area) {
        Some(Rejection::TooSmall)
    } else if !(slope <= criteria.max_slope) {
        Some(Rejection::TooSteep)
    } else if north_facing {
        Some(Rejection::NorthFacing)
    } else if !(shade >= criteria.min_shade) {
        Some(Rejection::TooShaded)
    } else {
        None
    }
}

/// Panel count, flatness and annual output (kWh) for an accepted roof.
pub fn panel_yield(criteria: &RoofCriteria, area_true: f64, slope: f64, irradiance: f64) -> (u32, bool, f64) {
    let flat = slope < criteria.flat_slope;
    let fit = if flat { criteria.flat_fit } else { criteria.pitched_fit };
    let panels = (area_true * fit / criteria.panel_footprint).floor().max(0.0) as u32;
    let output = criteria.panel_area
        * f64::from(panels)
        * criteria.panel_rating
        * criteria.system_efficiency
        * irradiance;
    (panels, flat, output)
}

fn yes_no<S: Serializer>(flag: &bool, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(if *flag { "Y" } else { "N" })
}

/// One accepted roof, in output column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuitableRoof {
    pub id: usize,
    /// Centroid x (easting), kept under the legacy column name.
    pub latitude: f64,
    /// Centroid y (northing).
    pub longitude: f64,
    pub area_plan: f64,
    pub area_true: f64,
    #[serde(rename = "Aspect_mean")]
    pub aspect_mean: f64,
    #[serde(rename = "Slope_mean")]
    pub slope_mean: f64,
    #[serde(rename = "Shade_mean")]
    pub shade_mean: f64,
    #[serde(rename = "Irrad_mean")]
    pub irradiance_mean: f64,
    #[serde(rename = "Num_panels")]
    pub num_panels: u32,
    #[serde(rename = "Roof_flat", serialize_with = "yes_no")]
    pub roof_flat: bool,
    #[serde(rename = "Output_kwh")]
    pub output_kwh: f64,
    #[serde(skip)]
    pub geometry: Option<Polygon<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRoof {
    pub id: usize,
    pub latitude: f64,
    pub longitude: f64,
    pub area_plan: f64,
    pub area_true: f64,
    #[serde(rename = "Aspect_mean")]
    pub aspect_mean: f64,
    #[serde(rename = "Slope_mean")]
    pub slope_mean: f64,
    #[serde(rename = "Shade_mean")]
    pub shade_mean: f64,
    #[serde(rename = "Irrad_mean")]
    pub irradiance_mean: f64,
    #[serde(serialize_with = "reason_str")]
    pub reason: Rejection,
    #[serde(skip)]
    pub geometry: Option<Polygon<f64>>,
}

fn reason_str<S: Serializer>(r: &Rejection, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(r.as_str())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    Suitable(SuitableRoof),
    Rejected(RejectedRoof),
}

fn has_finite_means(plane: &RoofPlane) -> bool {
    [
        plane.cos_mean,
        plane.sin_mean,
        plane.slope_mean,
        plane.shade_mean,
        plane.irradiance_mean,
    ]
    .iter()
    .all(|v| v.is_finite())
}

/// Assess one roof plane. Returns `None` for a null or degenerate plane.
/// The id is left at 0 for the caller to assign.
pub fn assess_roof(plane: &RoofPlane, criteria: &RoofCriteria) -> Option<Assessment> {
    let feature = Feature::new(plane.geometry.clone()?);
    if feature.is_degenerate() || !has_finite_means(plane) {
        return None;
    }
    let centroid = feature.centroid()?;
    let area_plan = feature.area();
    let area_true = true_area(area_plan, plane.slope_mean);
    let aspect = aspect_from_components(plane.sin_mean, plane.cos_mean);

    if let Some(reason) = rejection(criteria, area_true, plane.slope_mean, aspect, plane.shade_mean) {
        return Some(Assessment::Rejected(RejectedRoof {
            id: 0,
            latitude: centroid.x(),
            longitude: centroid.y(),
            area_plan,
            area_true,
            aspect_mean: aspect,
            slope_mean: plane.slope_mean,
            shade_mean: plane.shade_mean,
            irradiance_mean: plane.irradiance_mean,
            reason,
            geometry: feature.geometry,
        }));
    }

    let (num_panels, roof_flat, output_kwh) =
        panel_yield(criteria, area_true, plane.slope_mean, plane.irradiance_mean);
    Some(Assessment::Suitable(SuitableRoof {
        id: 0,
        latitude: centroid.x(),
        longitude: centroid.y(),
        area_plan,
        area_true,
        aspect_mean: aspect,
        slope_mean: plane.slope_mean,
        shade_mean: plane.shade_mean,
        irradiance_mean: plane.irradiance_mean,
        num_panels,
        roof_flat,
        output_kwh,
        geometry: feature.geometry,
    }))
}

/// Result of filtering a roof-plane set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoofAssessment {
    pub suitable: Vec<SuitableRoof>,
    pub rejected: Vec<RejectedRoof>,
    /// Null or degenerate planes that were skipped.
    pub skipped: usize,
    pub total_output_kwh: f64,
}

/// Filter all roof planes. Accepted and rejected roofs are numbered from 1
/// in input order.
pub fn assess_roofs(
    planes: &[RoofPlane],
    criteria: &RoofCriteria,
    ctx: &RunContext<'_>,
) -> Completion<RoofAssessment> {
    let mut out = RoofAssessment::default();
    let n = planes.len().max(1) as f64;
    for (i, plane) in planes.iter().enumerate() {
        if ctx.is_cancelled() {
            return Completion::Cancelled(out);
        }
        match assess_roof(plane, criteria) {
            Some(Assessment::Suitable(mut roof)) => {
                roof.id = out.suitable.len() + 1;
                out.total_output_kwh += roof.output_kwh;
                out.suitable.push(roof);
            }
            Some(Assessment::Rejected(mut roof)) => {
                roof.id = out.rejected.len() + 1;
                out.rejected.push(roof);
            }
            None => {
                tracing::warn!(index = i, "skipping null or degenerate roof plane");
                out.skipped += 1;
            }
        }
        ctx.report((i + 1) as f64 / n);
    }
    tracing::info!(
        accepted = out.suitable.len(),
        rejected = out.rejected.len(),
        skipped = out.skipped,
        total_output_kwh = out.total_output_kwh,
        "roof assessment finished"
    );
    Completion::Finished(out)
}

/// Sort by output, highest first, and renumber ids from 1.
pub fn rank_roofs(mut roofs: Vec<SuitableRoof>) -> Vec<SuitableRoof> {
    roofs.sort_by(|a, b| b.output_kwh.total_cmp(&a.output_kwh));
    for (i, roof) in roofs.iter_mut().enumerate() {
        roof.id = i + 1;
    }
    roofs
}

fn csv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(writer)
}

/// Write roofs as CSV with a header row, one `\n`-terminated row per roof.
pub fn write_roofs_csv<W: Write>(writer: W, roofs: &[SuitableRoof]) -> Result<()> {
    let mut wtr = csv_writer(writer);
    wtr.write_record(ROOF_COLUMNS)?;
    for roof in roofs {
        wtr.serialize(roof)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_rejected_csv<W: Write>(writer: W, roofs: &[RejectedRoof]) -> Result<()> {
    let mut wtr = csv_writer(writer);
    wtr.write_record(REJECTED_COLUMNS)?;
    for roof in roofs {
        wtr.serialize(roof)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_roofs_csv_file(path: impl AsRef<Path>, roofs: &[SuitableRoof]) -> Result<()> {
    write_roofs_csv(File::create(path)?, roofs)
}

pub fn write_rejected_csv_file(path: impl AsRef<Path>, roofs: &[RejectedRoof]) -> Result<()> {
    write_rejected_csv(File::create(path)?, roofs)
}

/// Round to `sig` significant figures. Zero stays zero.
pub fn round_sig(x: f64, sig: i32) -> f64 {
    if x == 0.0 || !x.is_finite() {
        return x;
    }
    let decimals = sig - x.abs().log10().floor() as i32 - 1;
    let factor = 10f64.powi(decimals);
    (x * factor).round() / factor
}

/// Roof record for web maps.
#[derive(Debug, Clone, PartialEq)]
pub struct WebRoof {
    pub id: usize,
    pub latitude: i64,
    pub longitude: i64,
    pub num_panels: u32,
    pub output_kwh: f64,
    /// Web Mercator outline.
    pub geometry: Option<Polygon<f64>>,
}

/// Reproject accepted roofs to Web Mercator and reduce them to the fields a
/// web map shows. Roofs without geometry are dropped.
pub fn web_export(
    roofs: &[SuitableRoof],
    engine: &dyn GeometryEngine,
    source_epsg: u32,
) -> Result<Vec<WebRoof>> {
    let kept: Vec<&SuitableRoof> = roofs.iter().filter(|r| r.geometry.is_some()).collect();
    let features: Vec<Feature> = kept
        .iter()
        .map(|r| Feature {
            geometry: r.geometry.clone(),
            attributes: Default::default(),
        })
        .collect();
    let projected = engine.reproject(&features, source_epsg, WEB_MERCATOR)?;
    if projected.len() != kept.len() {
        return Err(SolarError::Engine(format!(
            "reprojection returned {} features for {} roofs",
            projected.len(),
            kept.len()
        )));
    }
    Ok(kept
        .into_iter()
        .zip(projected)
        .map(|(roof, feature)| WebRoof {
            id: roof.id,
            latitude: roof.latitude as i64,
            longitude: roof.longitude as i64,
            num_panels: roof.num_panels,
            output_kwh: round_sig(roof.output_kwh, 2),
            geometry: feature.geometry,
        })
        .collect())
}

/// Buildings inside the local study boundary.
pub fn clip_buildings_for_web(
    buildings: &[Feature],
    boundary: &[Feature],
    engine: &dyn GeometryEngine,
) -> Result<Vec<Feature>> {
    engine.clip(buildings, boundary)
}

/// Panels, flatness and output for one roof, or `None` when it fails a
/// suitability test. Uses the default criteria.
#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(name = "assess_roof")]
pub fn assess_roof_py(
    area_plan: f64,
    cos_mean: f64,
    sin_mean: f64,
    slope_mean: f64,
    shade_mean: f64,
    irradiance_mean: f64,
) -> Option<(u32, bool, f64)> {
    let criteria = RoofCriteria::default();
    let area_true = true_area(area_plan, slope_mean);
    let aspect = aspect_from_components(sin_mean, cos_mean);
    match rejection(&criteria, area_true, slope_mean, aspect, shade_mean) {
        Some(_) => None,
        None => Some(panel_yield(&criteria, area_true, slope_mean, irradiance_mean)),
    }
}

#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(name = "round_sig", signature = (x, sig = 2))]
pub fn round_sig_py(x: f64, sig: i32) -> f64 {
    round_sig(x, sig)
}
