//! Solar position and civil-time handling.
//!
//! Positions come from Grena's algorithm no. 3 (2012), which is accurate to
//! about 0.01° between 2010 and 2110 and degrades slowly outside that range.
//!
//! Reference: Grena, R. (2012). Five new algorithms for the computation of sun
//! position from 2010 to 2110. Solar Energy, 86(5), 1323-1337.

#![allow(clippy::unreadable_literal)]

use std::f64::consts::PI;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};

use crate::engine::CoordinateTransform;
use crate::error::{Result, SolarError};
use crate::grid::Grid;

/// ΔT (TT - UT1) in seconds.
pub const DELTA_T: f64 = 69.0;
const PRESSURE_HPA: f64 = 1013.25;
const TEMPERATURE_C: f64 = 15.0;
/// Site altitude used when the surface median is below sea level.
const FALLBACK_ALTITUDE: f64 = 3.0;

/// Observer position in WGS84 degrees, altitude in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
    pub altitude: f64,
}

impl Location {
    pub fn new(longitude: f64, latitude: f64, altitude: f64) -> Result<Self> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(SolarError::invalid("latitude", latitude, "must be within ±90°"));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(SolarError::invalid("longitude", longitude, "must be within ±180°"));
        }
        Ok(Self {
            longitude,
            latitude,
            altitude,
        })
    }

    /// Location of a surface grid: its lower-left corner in WGS84 and its
    /// median height.
    pub fn from_grid(dsm: &Grid, crs: &dyn CoordinateTransform) -> Result<Self> {
        let (rows, cols) = dsm.dim();
        let (minx, miny) = dsm.transform().lower_left(rows, cols);
        let (longitude, latitude) = crs.to_wgs84(minx, miny)?;
        let altitude = match dsm.median() {
            Some(m) if m >= 0.0 => m,
            _ => FALLBACK_ALTITUDE,
        };
        Location::new(longitude, latitude, altitude)
    }
}

/// Sun position in degrees; azimuth clockwise from north.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    pub altitude: f64,
    pub azimuth: f64,
    pub zenith: f64,
}

impl SunPosition {
    pub fn is_up(&self) -> bool {
        self.altitude > 0.0
    }
}

/// Days since 2000-01-01 12:00 TT, Grena's `t`.
fn calc_t(utc: &NaiveDateTime) -> f64 {
    let mut m = utc.month() as i32;
    let mut y = utc.year();
    let d = utc.day() as i32;
    let h = f64::from(utc.hour())
        + f64::from(utc.minute()) / 60.0
        + f64::from(utc.second()) / 3600.0;

    if m <= 2 {
        m += 12;
        y -= 1;
    }

    f64::from((365.25 * f64::from(y - 2000)) as i32)
        + f64::from((30.6001 * f64::from(m + 1)) as i32)
        - f64::from((0.01 * f64::from(y)) as i32)
        + f64::from(d)
        + 0.0416667 * h
        - 21958.0
}

/// Topocentric sun position at a UTC instant, with standard refraction.
pub fn sun_position(utc: NaiveDateTime, location: &Location) -> SunPosition {
    let t = calc_t(&utc);
    let t_e = t + 1.1574e-5 * DELTA_T;
    let omega_at_e = 0.0172019715 * t_e;

    let lambda = -1.388803
        + 1.720279216e-2 * t_e
        + 3.3366e-2 * (omega_at_e - 0.06172).sin()
        + 3.53e-4 * (2.0 * omega_at_e - 0.1163).sin();
    let epsilon = 4.089567e-1 - 6.19e-9 * t_e;

    let (s_lambda, c_lambda) = lambda.sin_cos();
    let s_epsilon = epsilon.sin();
    let c_epsilon = (1.0 - s_epsilon * s_epsilon).sqrt();

    let mut alpha = (s_lambda * c_epsilon).atan2(c_lambda);
    if alpha < 0.0 {
        alpha += 2.0 * PI;
    }
    let delta = (s_lambda * s_epsilon).asin();

    let mut h = 1.7528311 + 6.300388099 * t + location.longitude.to_radians() - alpha;
    h = ((h + PI) % (2.0 * PI)) - PI;
    if h < -PI {
        h += 2.0 * PI;
    }

    let s_phi = location.latitude.to_radians().sin();
    let c_phi = (1.0 - s_phi * s_phi).sqrt();
    let s_delta = delta.sin();
    let c_delta = (1.0 - s_delta * s_delta).sqrt();
    let (s_h, c_h) = h.sin_cos();

    let s_epsilon0 = s_phi * s_delta + c_phi * c_delta * c_h;
    let e_p = s_epsilon0.asin() - 4.26e-5 * (1.0 - s_epsilon0 * s_epsilon0).sqrt();
    let gamma = s_h.atan2(c_h * s_phi - s_delta * c_phi / c_delta);

    let refraction = if e_p > 0.0 {
        (0.08422 * (PRESSURE_HPA / 1000.0))
            / ((273.0 + TEMPERATURE_C) * (e_p + 0.003138 / (e_p + 0.08919)).tan())
    } else {
        0.0
    };

    let zenith = (PI / 2.0 - e_p - refraction).to_degrees();
    let azimuth = (gamma + PI).to_degrees().rem_euclid(360.0);

    SunPosition {
        altitude: 90.0 - zenith,
        azimuth,
        zenith,
    }
}

/// UTC instant for a local civil time `minutes` after midnight on `date`.
///
/// `utc_offset` is hours east of UTC; `dst_hours` is added on top of it.
/// Early-morning times can roll back into the previous day or year.
pub fn local_to_utc(date: NaiveDate, minutes: u32, utc_offset: f64, dst_hours: i32) -> NaiveDateTime {
    let offset_minutes = ((utc_offset + f64::from(dst_hours)) * 60.0).round() as i64;
    date.and_time(chrono::NaiveTime::MIN) + Duration::minutes(i64::from(minutes) - offset_minutes)
}

/// Fractional day of year (0-based) of a UTC instant.
pub fn decimal_day_of_year(utc: &NaiveDateTime) -> f64 {
    f64::from(utc.ordinal0())
        + f64::from(utc.hour()) / 24.0
        + f64::from(utc.minute()) / 1440.0
        + f64::from(utc.second()) / 86400.0
}
