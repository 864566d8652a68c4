use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A mass error tolerance, either relative (parts-per-million) or
/// absolute (Daltons). Relative tolerances scale with the query mass,
/// which is the natural unit for high resolution instruments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Tolerance {
    PPM(f64),
    Da(f64),
}

impl Tolerance {
    /// The lower and upper bounds of the window around `query`.
    pub fn bounds(&self, query: f64) -> (f64, f64) {
        match self {
            Self::PPM(tol) => {
                let width = query * *tol * 1e-6;
                (query - width, query + width)
            }
            Self::Da(tol) => (query - *tol, query + *tol),
        }
    }

    /// The half-width of the window around `query` in Daltons.
    pub fn width(&self, query: f64) -> f64 {
        match self {
            Self::PPM(tol) => query * *tol * 1e-6,
            Self::Da(tol) => *tol,
        }
    }

    /// Test whether `alt` falls within the tolerance window around `query`.
    pub fn test(&self, query: f64, alt: f64) -> bool {
        let (lo, hi) = self.bounds(query);
        lo <= alt && alt <= hi
    }

    /// The signed error of `alt` relative to `query` in this tolerance's units.
    pub fn call(&self, query: f64, alt: f64) -> f64 {
        match self {
            Self::PPM(_) => (query - alt) / alt * 1e6,
            Self::Da(_) => query - alt,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Self::PPM(v) | Self::Da(v) => *v,
        }
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PPM(v) => write!(f, "{v}ppm"),
            Self::Da(v) => write!(f, "{v}da"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToleranceParsingError {
    #[error("A tolerance must be a magnitude followed by a unit, e.g. \"10ppm\"")]
    UnparsedMagnitude,
    #[error("Unrecognized tolerance unit {0:?}")]
    UnknownUnit(String),
}

impl FromStr for Tolerance {
    type Err = ToleranceParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s.find(|c: char| c.is_alphabetic()).unwrap_or(s.len());
        let magnitude: f64 = s[..split]
            .parse()
            .map_err(|_| ToleranceParsingError::UnparsedMagnitude)?;
        match s[split..].to_ascii_lowercase().as_str() {
            "ppm" | "" => Ok(Self::PPM(magnitude)),
            "da" | "dalton" => Ok(Self::Da(magnitude)),
            unit => Err(ToleranceParsingError::UnknownUnit(unit.to_string())),
        }
    }
}

impl From<f64> for Tolerance {
    fn from(value: f64) -> Self {
        Self::PPM(value)
    }
}
