//! Hourly meteorological series in the UMEP 24-column layout.
//!
//! Two sources are understood: UMEP text files (whitespace separated, one
//! header line) and EnergyPlus weather files, which are converted on import.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ndarray::{Array2, ArrayView1, Axis};

use crate::error::{Result, SolarError};

pub const MET_COLUMNS: usize = 24;
/// Value of a column the source does not provide.
pub const MISSING: f64 = -999.0;
/// Upper bound accepted for global shortwave radiation, W/m².
pub const KDOWN_MAX: f64 = 1300.0;

/// Column indices of the UMEP table.
pub mod col {
    pub const YEAR: usize = 0;
    pub const DOY: usize = 1;
    pub const HOUR: usize = 2;
    pub const MINUTE: usize = 3;
    pub const WIND_SPEED: usize = 9;
    pub const RH: usize = 10;
    pub const TA: usize = 11;
    pub const PRESSURE: usize = 12;
    pub const RAIN: usize = 13;
    pub const KDOWN: usize = 14;
    pub const LDOWN: usize = 16;
    pub const KDIFF: usize = 21;
    pub const KDIR: usize = 22;
    pub const WIND_DIR: usize = 23;
}

const EPW_HEADER_LINES: usize = 8;
const EPW_MIN_COLUMNS: usize = 34;
const EPW_YEAR: f64 = 1985.0;
const EPW_MISSING_RAIN: f64 = 999.0;
/// EPW source column -> UMEP column, with a divisor.
const EPW_MAPPING: [(usize, usize, f64); 10] = [
    (6, col::TA, 1.0),
    (8, col::RH, 1.0),
    (9, col::PRESSURE, 1000.0),
    (12, col::LDOWN, 1.0),
    (13, col::KDOWN, 1.0),
    (14, col::KDIR, 1.0),
    (15, col::KDIFF, 1.0),
    (20, col::WIND_DIR, 1.0),
    (21, col::WIND_SPEED, 1.0),
    (33, col::RAIN, 1.0),
];
const DAYS_BEFORE_MONTH: [u32; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

const UMEP_HEADER: &str = "%iy  id  it imin   Q*      QH      QE      Qs      Qf    Wind    RH     Td     \
press   rain    Kdn    snow    ldown   fcld    wuh     xsmd    lai_hr  Kdiff   Kdir    Wd";

/// One row of the series with the fields the radiation model reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetRecord {
    /// Local standard time at the end of the averaging period.
    pub timestamp: NaiveDateTime,
    pub kdown: f64,
    pub kdiff: f64,
    pub kdir: f64,
    pub ta: f64,
    pub rh: f64,
    pub pressure: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetSeries {
    data: Array2<f64>,
    timestamps: Vec<NaiveDateTime>,
}

impl MetSeries {
    /// Validate a raw `rows x 24` table.
    pub fn from_array(data: Array2<f64>) -> Result<Self> {
        if data.ncols() != MET_COLUMNS {
            return Err(SolarError::data_format(
                None,
                format!("expected {MET_COLUMNS} columns, found {}", data.ncols()),
            ));
        }
        if data.nrows() == 0 {
            return Err(SolarError::data_format(None, "meteorological series is empty"));
        }
        let timestamps = data
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(i, row)| {
                check_kdown(row, Some(i + 1))?;
                row_timestamp(row).ok_or_else(|| {
                    SolarError::data_format(
                        Some(i + 1),
                        format!(
                            "invalid time {} {} {} {}",
                            row[col::YEAR],
                            row[col::DOY],
                            row[col::HOUR],
                            row[col::MINUTE]
                        ),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { data, timestamps })
    }

    /// Parse a UMEP text table: one header line, then exactly 24
    /// whitespace-separated numbers per row.
    pub fn from_umep_str(text: &str) -> Result<Self> {
        let mut values = Vec::new();
        let mut rows = 0;
        for (idx, line) in text.lines().enumerate().skip(1) {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != MET_COLUMNS {
                return Err(SolarError::data_format(
                    Some(line_no),
                    format!("expected {MET_COLUMNS} columns, found {}", fields.len()),
                ));
            }
            for field in fields {
                let v: f64 = field.parse().map_err(|_| {
                    SolarError::data_format(Some(line_no), format!("'{field}' is not a number"))
                })?;
                values.push(v);
            }
            let row_start = values.len() - MET_COLUMNS;
            let kdown = values[row_start + col::KDOWN];
            if !(0.0..=KDOWN_MAX).contains(&kdown) {
                return Err(kdown_error(kdown, Some(line_no)));
            }
            rows += 1;
        }
        let data = Array2::from_shape_vec((rows, MET_COLUMNS), values)
            .map_err(|e| SolarError::data_format(None, e.to_string()))?;
        let series = Self::from_array(data)?;
        tracing::debug!(rows, "UMEP meteorological file parsed");
        Ok(series)
    }

    /// Convert an EnergyPlus weather file into the UMEP layout.
    pub fn from_epw_str(text: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut raw: Vec<(u64, csv::StringRecord)> = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record?;
            if i < EPW_HEADER_LINES {
                continue;
            }
            let line = record.position().map_or(i as u64 + 1, |p| p.line());
            raw.push((line, record));
        }
        if raw.is_empty() {
            return Err(SolarError::data_format(None, "EPW file has no data rows"));
        }

        let n = raw.len();
        let mut data = Array2::from_elem((n, MET_COLUMNS), MISSING);
        for (i, (line, record)) in raw.iter().enumerate() {
            let line_no = Some(*line as usize);
            if record.len() < EPW_MIN_COLUMNS {
                return Err(SolarError::data_format(
                    line_no,
                    format!("expected at least {EPW_MIN_COLUMNS} columns, found {}", record.len()),
                ));
            }
            let field = |c: usize| epw_number(record, c, line_no);

            let mut row = data.row_mut(i);
            let last = i == n - 1;
            row[col::YEAR] = if last { EPW_YEAR + 1.0 } else { EPW_YEAR };

            let month = field(1)?;
            let day = field(2)?;
            if !(1.0..=12.0).contains(&month) {
                return Err(SolarError::data_format(line_no, format!("invalid month {month}")));
            }
            let mut doy = f64::from(DAYS_BEFORE_MONTH[month as usize - 1]) + day;
            let mut hour = field(3)?;
            if hour == 24.0 {
                hour = 0.0;
                doy += 1.0;
            }
            if last {
                doy = 1.0;
            }
            row[col::DOY] = doy;
            row[col::HOUR] = hour;
            row[col::MINUTE] = 0.0;

            for &(src, dst, divisor) in &EPW_MAPPING {
                row[dst] = field(src)? / divisor;
            }
            if row[col::RAIN] == EPW_MISSING_RAIN {
                row[col::RAIN] = 0.0;
            }
        }

        let series = Self::from_array(data)?;
        tracing::info!(rows = n, "EPW file converted to UMEP layout");
        Ok(series)
    }

    pub fn load_umep(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_umep_str(&std::fs::read_to_string(path)?)
    }

    pub fn load_epw(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_epw_str(&std::fs::read_to_string(path)?)
    }

    /// UMEP text rendering: time columns as integers, the rest to 2 d.p.
    pub fn to_umep_string(&self) -> String {
        let mut out = String::with_capacity(self.data.nrows() * 160);
        out.push_str(UMEP_HEADER);
        out.push('\n');
        for row in self.data.axis_iter(Axis(0)) {
            for (c, v) in row.iter().enumerate() {
                if c > 0 {
                    out.push(' ');
                }
                // infallible for String
                let _ = if c <= col::MINUTE {
                    write!(out, "{}", *v as i64)
                } else {
                    write!(out, "{v:.2}")
                };
            }
            out.push('\n');
        }
        out
    }

    pub fn write_umep(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_umep_string())?;
        Ok(())
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn column(&self, index: usize) -> ArrayView1<'_, f64> {
        self.data.column(index)
    }

    pub fn records(&self) -> impl Iterator<Item = MetRecord> + '_ {
        self.data
            .axis_iter(Axis(0))
            .zip(&self.timestamps)
            .map(|(row, &timestamp)| MetRecord {
                timestamp,
                kdown: row[col::KDOWN],
                kdiff: row[col::KDIFF],
                kdir: row[col::KDIR],
                ta: row[col::TA],
                rh: row[col::RH],
                pressure: row[col::PRESSURE],
            })
    }
}

fn epw_number(record: &csv::StringRecord, c: usize, line: Option<usize>) -> Result<f64> {
    let raw = record.get(c).unwrap_or("").trim();
    raw.parse::<f64>()
        .map_err(|_| SolarError::data_format(line, format!("column {c}: '{raw}' is not a number")))
}

fn kdown_error(kdown: f64, line: Option<usize>) -> SolarError {
    SolarError::data_format(
        line,
        format!("Kdown {kdown} outside [0, {KDOWN_MAX}] W/m²"),
    )
}

fn check_kdown(row: ArrayView1<f64>, line: Option<usize>) -> Result<()> {
    let kdown = row[col::KDOWN];
    if (0.0..=KDOWN_MAX).contains(&kdown) {
        Ok(())
    } else {
        Err(kdown_error(kdown, line))
    }
}

fn row_timestamp(row: ArrayView1<f64>) -> Option<NaiveDateTime> {
    let (year, doy, hour, minute) = (row[col::YEAR], row[col::DOY], row[col::HOUR], row[col::MINUTE]);
    if !(1.0..=367.0).contains(&doy) || !(0.0..=24.0).contains(&hour) || !(0.0..60.0).contains(&minute)
    {
        return None;
    }
    let jan1 = NaiveDate::from_ymd_opt(year as i32, 1, 1)?;
    let start = jan1.and_hms_opt(0, 0, 0)?;
    start.checked_add_signed(
        Duration::days(doy as i64 - 1) + Duration::hours(hour as i64) + Duration::minutes(minute as i64),
    )
}
