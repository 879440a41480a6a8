//! Coordinate reference systems and reprojection.
//!
//! Source systems are converted to geographic longitude/latitude (degrees)
//! and from there onto an ellipsoidal Lambert azimuthal equal-area plane
//! centred on the request region. Areas are measured in that plane;
//! distances are measured on the ellipsoid.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use geo_types::Coord;
use serde::{Deserialize, Serialize};

use crate::errors::{EchoError, EchoResult};

/// WGS84 / GRS80 semi-major axis (metres).
const SEMI_MAJOR: f64 = 6_378_137.0;

/// GRS80 flattening. WGS84 differs in the ninth significant digit.
const FLATTENING: f64 = 1.0 / 298.257_222_101;

/// UTM / MGA scale factor on the central meridian.
const TM_SCALE: f64 = 0.9996;
const TM_FALSE_EASTING: f64 = 500_000.0;
const TM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// A coordinate reference system understood by the join engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Crs {
    /// Geographic longitude/latitude. `epsg` keeps the declared code
    /// (4326, 4283 or 7844); datum shifts between them are ignored.
    Geographic { epsg: u32 },
    /// Spherical web mercator (EPSG:3857).
    WebMercator,
    /// Transverse mercator UTM-style zone, as used by UTM and MGA.
    TransverseMercator { epsg: u32, zone: u8, south: bool },
    /// Lambert azimuthal equal-area plane centred on (`lon0`, `lat0`).
    EqualArea { lon0: f64, lat0: f64 },
}

impl Crs {
    pub const WGS84: Crs = Crs::Geographic { epsg: 4326 };

    pub fn from_epsg(code: u32) -> EchoResult<Crs> {
        let crs = match code {
            4326 | 4283 | 7844 => Crs::Geographic { epsg: code },
            3857 | 900_913 => Crs::WebMercator,
            32601..=32660 => Crs::TransverseMercator {
                epsg: code,
                zone: (code - 32600) as u8,
                south: false,
            },
            32701..=32760 => Crs::TransverseMercator {
                epsg: code,
                zone: (code - 32700) as u8,
                south: true,
            },
            // GDA94 / MGA zones 46-59.
            28346..=28359 => Crs::TransverseMercator {
                epsg: code,
                zone: (code - 28300) as u8,
                south: true,
            },
            // GDA2020 / MGA zones 46-59.
            7846..=7859 => Crs::TransverseMercator {
                epsg: code,
                zone: (code - 7800) as u8,
                south: true,
            },
            other => {
                return Err(EchoError::Format(format!(
                    "unsupported coordinate reference system EPSG:{other}"
                )))
            }
        };
        Ok(crs)
    }

    /// EPSG code, when the system has one.
    pub fn epsg(&self) -> Option<u32> {
        match self {
            Crs::Geographic { epsg } => Some(*epsg),
            Crs::WebMercator => Some(3857),
            Crs::TransverseMercator { epsg, .. } => Some(*epsg),
            Crs::EqualArea { .. } => None,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Geographic { .. })
    }

    /// Equal-area plane centred on a geographic point.
    pub fn equal_area_at(lon: f64, lat: f64) -> Crs {
        Crs::EqualArea {
            lon0: lon,
            lat0: lat.clamp(-89.999, 89.999),
        }
    }

    /// Convert a coordinate in this system to geographic lon/lat degrees.
    pub fn to_geographic(&self, c: Coord<f64>) -> EchoResult<Coord<f64>> {
        let out = match *self {
            Crs::Geographic { .. } => c,
            Crs::WebMercator => Coord {
                x: (c.x / SEMI_MAJOR).to_degrees(),
                y: (2.0 * (c.y / SEMI_MAJOR).exp().atan() - PI / 2.0).to_degrees(),
            },
            Crs::TransverseMercator { zone, south, .. } => tm_inverse(c, zone, south),
            Crs::EqualArea { lon0, lat0 } => Laea::new(lon0, lat0).inverse(c),
        };
        if !(out.x.is_finite() && out.y.is_finite()) || out.y.abs() > 90.0 + 1e-9 {
            return Err(EchoError::JoinComputation(format!(
                "coordinate ({}, {}) is outside the valid range of {self}",
                c.x, c.y
            )));
        }
        Ok(out)
    }

    /// Convert geographic lon/lat degrees into this system.
    pub fn from_geographic(&self, c: Coord<f64>) -> EchoResult<Coord<f64>> {
        if !(c.x.is_finite() && c.y.is_finite()) || c.y.abs() > 90.0 + 1e-9 {
            return Err(EchoError::JoinComputation(format!(
                "invalid geographic coordinate ({}, {})",
                c.x, c.y
            )));
        }
        let out = match *self {
            Crs::Geographic { .. } => c,
            Crs::WebMercator => {
                let lat = c.y.clamp(-85.051_128_78, 85.051_128_78).to_radians();
                Coord {
                    x: SEMI_MAJOR * c.x.to_radians(),
                    y: SEMI_MAJOR * (PI / 4.0 + lat / 2.0).tan().ln(),
                }
            }
            Crs::TransverseMercator { zone, south, .. } => tm_forward(c, zone, south),
            Crs::EqualArea { lon0, lat0 } => Laea::new(lon0, lat0).forward(c),
        };
        Ok(out)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::EqualArea { lon0, lat0 } => {
                write!(f, "LAEA({lon0:.6},{lat0:.6})")
            }
            other => write!(f, "EPSG:{}", other.epsg().unwrap_or_default()),
        }
    }
}

impl FromStr for Crs {
    type Err = EchoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        if trimmed.eq_ignore_ascii_case("wgs84") || trimmed.eq_ignore_ascii_case("crs84") {
            return Ok(Crs::WGS84);
        }
        let code: u32 = code
            .parse()
            .map_err(|_| EchoError::Format(format!("unrecognised CRS `{s}`")))?;
        Crs::from_epsg(code)
    }
}

impl TryFrom<String> for Crs {
    type Error = EchoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> String {
        crs.to_string()
    }
}

// ---------------------------------------------------------------------------
// Lambert azimuthal equal-area (ellipsoidal, EPSG method 9820)
// ---------------------------------------------------------------------------

fn eccentricity_squared() -> f64 {
    FLATTENING * (2.0 - FLATTENING)
}

/// Authalic function q(φ): the ellipsoidal area between the equator and φ
/// is `a² Δλ q(φ) / 2`.
fn authalic_q(phi: f64) -> f64 {
    let e2 = eccentricity_squared();
    let e = e2.sqrt();
    let s = phi.sin();
    (1.0 - e2) * (s / (1.0 - e2 * s * s) - ((1.0 - e * s) / (1.0 + e * s)).ln() / (2.0 * e))
}

struct Laea {
    lon0: f64,
    beta0: f64,
    /// Radius of the authalic sphere.
    rq: f64,
    /// Stretch that makes the projection true to scale at the centre.
    d: f64,
}

impl Laea {
    fn new(lon0: f64, lat0: f64) -> Laea {
        let e2 = eccentricity_squared();
        let q_pole = authalic_q(PI / 2.0);
        let rq = SEMI_MAJOR * (q_pole / 2.0).sqrt();
        let phi0 = lat0.to_radians();
        let beta0 = (authalic_q(phi0) / q_pole).clamp(-1.0, 1.0).asin();
        let d = SEMI_MAJOR * phi0.cos() / (1.0 - e2 * phi0.sin().powi(2)).sqrt() / (rq * beta0.cos());
        Laea { lon0, beta0, rq, d }
    }

    fn authalic_latitude(phi: f64) -> f64 {
        (authalic_q(phi) / authalic_q(PI / 2.0)).clamp(-1.0, 1.0).asin()
    }

    fn forward(&self, c: Coord<f64>) -> Coord<f64> {
        let beta = Self::authalic_latitude(c.y.to_radians());
        let lam = (c.x - self.lon0).to_radians();
        let (sb0, cb0) = self.beta0.sin_cos();
        let denom = 1.0 + sb0 * beta.sin() + cb0 * beta.cos() * lam.cos();
        // Antipode of the centre: no finite image.
        let b = self.rq * (2.0 / denom.max(1e-12)).sqrt();
        Coord {
            x: b * self.d * beta.cos() * lam.sin(),
            y: b / self.d * (cb0 * beta.sin() - sb0 * beta.cos() * lam.cos()),
        }
    }

    fn inverse(&self, c: Coord<f64>) -> Coord<f64> {
        let rho = ((c.x / self.d).powi(2) + (self.d * c.y).powi(2)).sqrt();
        if rho < 1e-9 {
            return Coord {
                x: self.lon0,
                y: geodetic_from_authalic(self.beta0).to_degrees(),
            };
        }
        let (sb0, cb0) = self.beta0.sin_cos();
        let cang = 2.0 * (rho / (2.0 * self.rq)).min(1.0).asin();
        let (sc, cc) = cang.sin_cos();
        let beta = (cc * sb0 + self.d * c.y * sc * cb0 / rho).clamp(-1.0, 1.0).asin();
        let lam = (c.x * sc).atan2(self.d * rho * cb0 * cc - self.d * self.d * c.y * sb0 * sc);
        Coord {
            x: self.lon0 + lam.to_degrees(),
            y: geodetic_from_authalic(beta).to_degrees(),
        }
    }
}

fn geodetic_from_authalic(beta: f64) -> f64 {
    let e2 = eccentricity_squared();
    let (e4, e6) = (e2 * e2, e2 * e2 * e2);
    beta + (e2 / 3.0 + 31.0 * e4 / 180.0 + 517.0 * e6 / 5040.0) * (2.0 * beta).sin()
        + (23.0 * e4 / 360.0 + 251.0 * e6 / 3780.0) * (4.0 * beta).sin()
        + (761.0 * e6 / 45360.0) * (6.0 * beta).sin()
}

// ---------------------------------------------------------------------------
// Transverse mercator (Krüger series, third order in n)
// ---------------------------------------------------------------------------

struct TmSeries {
    a_hat: f64,
    e: f64,
    alpha: [f64; 3],
    beta: [f64; 3],
    delta: [f64; 3],
}

fn tm_series() -> TmSeries {
    let n = FLATTENING / (2.0 - FLATTENING);
    let (n2, n3) = (n * n, n * n * n);
    TmSeries {
        a_hat: SEMI_MAJOR / (1.0 + n) * (1.0 + n2 / 4.0 + n2 * n2 / 64.0),
        e: 2.0 * n.sqrt() / (1.0 + n),
        alpha: [
            n / 2.0 - 2.0 * n2 / 3.0 + 5.0 * n3 / 16.0,
            13.0 * n2 / 48.0 - 3.0 * n3 / 5.0,
            61.0 * n3 / 240.0,
        ],
        beta: [
            n / 2.0 - 2.0 * n2 / 3.0 + 37.0 * n3 / 96.0,
            n2 / 48.0 + n3 / 15.0,
            17.0 * n3 / 480.0,
        ],
        delta: [
            2.0 * n - 2.0 * n2 / 3.0 - 2.0 * n3,
            7.0 * n2 / 3.0 - 8.0 * n3 / 5.0,
            56.0 * n3 / 15.0,
        ],
    }
}

fn central_meridian(zone: u8) -> f64 {
    f64::from(zone) * 6.0 - 183.0
}

fn tm_forward(c: Coord<f64>, zone: u8, south: bool) -> Coord<f64> {
    let s = tm_series();
    let phi = c.y.to_radians();
    let lam = (c.x - central_meridian(zone)).to_radians();
    let t = (phi.sin().atanh() - s.e * (s.e * phi.sin()).atanh()).sinh();
    let xi_p = t.atan2(lam.cos());
    let eta_p = (lam.sin() / (1.0 + t * t).sqrt()).atanh();
    let mut xi = xi_p;
    let mut eta = eta_p;
    for (j, a) in s.alpha.iter().enumerate() {
        let k = 2.0 * (j as f64 + 1.0);
        xi += a * (k * xi_p).sin() * (k * eta_p).cosh();
        eta += a * (k * xi_p).cos() * (k * eta_p).sinh();
    }
    let northing0 = if south { TM_FALSE_NORTHING_SOUTH } else { 0.0 };
    Coord {
        x: TM_FALSE_EASTING + TM_SCALE * s.a_hat * eta,
        y: northing0 + TM_SCALE * s.a_hat * xi,
    }
}

fn tm_inverse(c: Coord<f64>, zone: u8, south: bool) -> Coord<f64> {
    let s = tm_series();
    let northing0 = if south { TM_FALSE_NORTHING_SOUTH } else { 0.0 };
    let xi = (c.y - northing0) / (TM_SCALE * s.a_hat);
    let eta = (c.x - TM_FALSE_EASTING) / (TM_SCALE * s.a_hat);
    let mut xi_p = xi;
    let mut eta_p = eta;
    for (j, b) in s.beta.iter().enumerate() {
        let k = 2.0 * (j as f64 + 1.0);
        xi_p -= b * (k * xi).sin() * (k * eta).cosh();
        eta_p -= b * (k * xi).cos() * (k * eta).sinh();
    }
    let chi = (xi_p.sin() / eta_p.cosh()).asin();
    let mut phi = chi;
    for (j, d) in s.delta.iter().enumerate() {
        let k = 2.0 * (j as f64 + 1.0);
        phi += d * (k * chi).sin();
    }
    let lam = eta_p.sinh().atan2(xi_p.cos());
    Coord {
        x: central_meridian(zone) + lam.to_degrees(),
        y: phi.to_degrees(),
    }
}
