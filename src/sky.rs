//! Sky positions, WSClean source lists and masking sources near the target.

use std::{
    f64::consts::TAU,
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, Timelike, Utc};
use lazy_static::lazy_static;
use log::{debug, warn};
use marlu::{
    hifitime::Epoch,
    sexagesimal::{sexagesimal_dms_to_degrees, sexagesimal_hms_to_float},
    RADec,
};
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref RE_RA_HMS: Regex =
        Regex::new(r"^\s*(\d+):(\d+):(\d+(?:\.\d*)?)\s*$").unwrap();
    static ref RE_DEC_DMS: Regex =
        Regex::new(r"^\s*([+-]?)(\d+)[.:](\d+)[.:](\d+(?:\.\d*)?)\s*$").unwrap();
    /// LWA file names carry the observation start, e.g. `20240519_173002_55MHz.ms`
    static ref RE_OBS_TIME: Regex =
        Regex::new(r"(\d{4})(\d{2})(\d{2})_(\d{2})(\d{2})(\d{2})").unwrap();
}

#[derive(Error, Debug)]
/// Errors from reading sky positions and source lists
pub enum SkyError {
    /// io failure on a source list
    #[error("could not access source list {path:?}: {source}")]
    Io {
        /// file
        path: PathBuf,
        /// cause
        source: std::io::Error,
    },

    /// The file has no `Format = ...` line.
    #[error("{0:?} is not a WSClean source list, no Format header")]
    MissingHeader(PathBuf),

    /// A coordinate string could not be parsed.
    #[error("could not parse {kind} coordinate {value:?}")]
    BadCoordinate {
        /// `RA` or `Dec`
        kind: &'static str,
        /// the offending text
        value: String,
    },

    /// No time was configured and none could be found in the file name.
    #[error("no observation time configured and none found in {0:?}")]
    NoObservationTime(PathBuf),
}

/// A position from degrees, with RA wrapped into \[0, 360).
pub fn radec_from_degrees(ra_deg: f64, dec_deg: f64) -> RADec {
    RADec::new(ra_deg.rem_euclid(360.0).to_radians(), dec_deg.to_radians())
}

/// `RA 57.000000° Dec 20.000000°`
pub fn fmt_radec(radec: RADec) -> String {
    format!(
        "RA {:.6}° Dec {:.6}°",
        radec.ra.to_degrees(),
        radec.dec.to_degrees()
    )
}

/// Great-circle distance between two positions in degrees.
pub fn separation_deg(a: RADec, b: RADec) -> f64 {
    a.separation(b).to_degrees()
}

/// Parse WSClean's `hh:mm:ss.s` right ascension into degrees.
///
/// # Errors
///
/// [`SkyError::BadCoordinate`] if the text doesn't match.
pub fn parse_ra_hms(text: &str) -> Result<f64, SkyError> {
    let bad = || SkyError::BadCoordinate {
        kind: "RA",
        value: text.to_string(),
    };
    let caps = RE_RA_HMS.captures(text).ok_or_else(bad)?;
    let parse = |i: usize| caps[i].parse::<f64>().map_err(|_| bad());
    Ok(sexagesimal_hms_to_float(parse(1)?, parse(2)?, parse(3)?))
}

/// Parse WSClean's `±dd.mm.ss.s` declination into degrees.
///
/// The sign is read separately so that `-00.30.00` stays negative.
///
/// # Errors
///
/// [`SkyError::BadCoordinate`] if the text doesn't match.
pub fn parse_dec_dms(text: &str) -> Result<f64, SkyError> {
    let bad = || SkyError::BadCoordinate {
        kind: "Dec",
        value: text.to_string(),
    };
    let caps = RE_DEC_DMS.captures(text).ok_or_else(bad)?;
    let parse = |i: usize| caps[i].parse::<f64>().map_err(|_| bad());
    let magnitude = sexagesimal_dms_to_degrees(parse(2)?, parse(3)?, parse(4)?);
    Ok(if &caps[1] == "-" { -magnitude } else { magnitude })
}

/// One component of a WSClean source list.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// component name
    pub name: String,
    /// position
    pub position: RADec,
    /// Stokes I flux density \[Jy\], if present
    pub flux_jy: Option<f64>,
    /// the row exactly as read, written back unchanged
    pub line: String,
}

/// A WSClean `-save-source-list` file.
///
/// Rows are kept verbatim so that spectral terms survive a read/write cycle
/// untouched.
#[derive(Debug, Clone)]
pub struct SourceList {
    /// the `Format = ...` line
    pub header: String,
    /// the components in file order
    pub sources: Vec<SourceEntry>,
}

impl SourceList {
    /// Parse source list text. Rows that can't be parsed are skipped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// [`SkyError::MissingHeader`] if there is no `Format` line; `path` is only
    /// used for the message.
    pub fn parse(text: &str, path: &Path) -> Result<Self, SkyError> {
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let header = match lines.next() {
            Some(line) if line.trim_start().starts_with("Format") => line.to_string(),
            _ => return Err(SkyError::MissingHeader(path.to_path_buf())),
        };

        let mut sources = vec![];
        for line in lines {
            if line.trim_start().starts_with('#') {
                continue;
            }
            match Self::parse_row(line) {
                Ok(entry) => sources.push(entry),
                Err(err) => warn!("skipping source list row {line:?}: {err}"),
            }
        }
        Ok(Self { header, sources })
    }

    fn parse_row(line: &str) -> Result<SourceEntry, SkyError> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 4 {
            return Err(SkyError::BadCoordinate {
                kind: "RA",
                value: line.to_string(),
            });
        }
        let position = radec_from_degrees(parse_ra_hms(parts[2])?, parse_dec_dms(parts[3])?);
        Ok(SourceEntry {
            name: parts[0].to_string(),
            position,
            flux_jy: parts.get(4).and_then(|flux| flux.parse().ok()),
            line: line.to_string(),
        })
    }

    /// Read a source list from disk.
    ///
    /// # Errors
    ///
    /// [`SkyError::Io`] or [`SkyError::MissingHeader`]
    pub fn read(path: &Path) -> Result<Self, SkyError> {
        let text = fs::read_to_string(path).map_err(|source| SkyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Render back to WSClean's text format.
    pub fn render(&self) -> String {
        let mut text = self.header.clone();
        text.push('\n');
        for source in &self.sources {
            text.push_str(&source.line);
            text.push('\n');
        }
        text
    }

    /// Write to disk.
    ///
    /// # Errors
    ///
    /// [`SkyError::Io`]
    pub fn write(&self, path: &Path) -> Result<(), SkyError> {
        fs::write(path, self.render()).map_err(|source| SkyError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Drop every source within `radius_deg` of `centre`, returning what was
    /// removed.
    pub fn remove_within(&mut self, centre: RADec, radius_deg: f64) -> Vec<SourceEntry> {
        let radius = radius_deg.to_radians();
        let (removed, kept) = self
            .sources
            .drain(..)
            .partition(|source| source.position.separation(centre) <= radius);
        self.sources = kept;
        removed
    }
}

/// Counts from a masking pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskSummary {
    /// sources written out
    pub kept: usize,
    /// sources within the radius
    pub removed: usize,
    /// summed Stokes I of the removed sources \[Jy\], rows without a flux
    /// density count as zero
    pub removed_flux_jy: f64,
}

/// Copy the source list at `input` to `output` without the sources within
/// `radius_deg` of `target`.
///
/// # Errors
///
/// Any [`SkyError`] from reading or writing.
pub fn mask_sources(
    input: &Path,
    output: &Path,
    target: RADec,
    radius_deg: f64,
) -> Result<MaskSummary, SkyError> {
    let mut list = SourceList::read(input)?;
    let removed = list.remove_within(target, radius_deg);
    list.write(output)?;
    let summary = MaskSummary {
        kept: list.sources.len(),
        removed: removed.len(),
        removed_flux_jy: removed.iter().filter_map(|source| source.flux_jy).sum(),
    };
    for source in &removed {
        debug!(
            "masked {} ({:.3}° from target)",
            source.name,
            separation_deg(source.position, target)
        );
    }
    Ok(summary)
}

/// Finds where the data should finally be phased to.
pub trait TargetLocator: Debug {
    /// Position of the target for the measurement set at `ms`.
    ///
    /// # Errors
    ///
    /// [`SkyError`] when the position can't be determined.
    fn locate(&self, ms: &Path) -> Result<RADec, SkyError>;

    /// Short human-readable description
    fn describe(&self) -> String;
}

/// A target at fixed coordinates
#[derive(Debug, Clone, Copy)]
pub struct FixedTarget(pub RADec);

impl TargetLocator for FixedTarget {
    fn locate(&self, _ms: &Path) -> Result<RADec, SkyError> {
        Ok(self.0)
    }

    fn describe(&self) -> String {
        format!("fixed ({})", fmt_radec(self.0))
    }
}

/// The Sun, at `time` or at the time in the measurement set's file name.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolarTarget {
    /// observation time override
    pub time: Option<Epoch>,
}

impl TargetLocator for SolarTarget {
    fn locate(&self, ms: &Path) -> Result<RADec, SkyError> {
        let time = match self.time {
            Some(time) => time,
            None => obs_time_from_path(ms)
                .ok_or_else(|| SkyError::NoObservationTime(ms.to_path_buf()))?,
        };
        let position = sun_radec(time);
        debug!("Sun at {time}: {}", fmt_radec(position));
        Ok(position)
    }

    fn describe(&self) -> String {
        match self.time {
            Some(time) => format!("Sun at {time}"),
            None => "Sun at observation time".to_string(),
        }
    }
}

/// Observation start from an LWA style `YYYYMMDD_HHMMSS` file name.
pub fn obs_time_from_path(path: &Path) -> Option<Epoch> {
    let name = path.file_name()?.to_str()?;
    let caps = RE_OBS_TIME.captures(name)?;
    let field = |i: usize| caps[i].parse::<u8>().ok();
    Epoch::maybe_from_gregorian_utc(
        caps[1].parse().ok()?,
        field(2)?,
        field(3)?,
        field(4)?,
        field(5)?,
        field(6)?,
        0,
    )
    .ok()
}

/// The same instant as a UTC [`Epoch`].
pub fn epoch_from_datetime(time: DateTime<Utc>) -> Epoch {
    Epoch::from_gregorian_utc(
        time.year(),
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond(),
    )
}

/// Apparent geocentric position of the Sun.
///
/// Low precision (about 0.01°) series from the Astronomical Almanac, plenty
/// for masking a few degrees around the disc.
pub fn sun_radec(time: Epoch) -> RADec {
    let n = time.as_jde_utc_days() - 2_451_545.0;
    let mean_longitude = (280.460 + 0.985_647_4 * n).to_radians();
    let mean_anomaly = (357.528 + 0.985_600_3 * n).to_radians();
    let ecliptic_longitude = mean_longitude
        + 1.915_f64.to_radians() * mean_anomaly.sin()
        + 0.020_f64.to_radians() * (2.0 * mean_anomaly).sin();
    let obliquity = (23.439 - 0.000_000_4 * n).to_radians();

    let (sin_l, cos_l) = ecliptic_longitude.sin_cos();
    let ra = (obliquity.cos() * sin_l).atan2(cos_l).rem_euclid(TAU);
    let dec = (obliquity.sin() * sin_l).asin();
    RADec::new(ra, dec)
}
