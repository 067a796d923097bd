use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_TRUNCATION: f64 = 0.98;
pub const DEFAULT_MAX_STEPLENGTH: f64 = 0.60;
pub const DEFAULT_MIN_STEPLENGTH: f64 = 0.30;
pub const DEFAULT_DEC_STEPLENGTH: f64 = 2.5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),
    #[error("truncation fraction must lie in (0, 1], got {0}")]
    TruncationFraction(f64),
    #[error("subspace dimension must be at least 1, got {0}")]
    SubspaceDimension(i64),
    #[error("unknown inversion tag {0}")]
    UnknownInversion(i64),
    #[error("step lengths must satisfy max >= min > 0, got max {max} min {min}")]
    SteplengthBounds { max: f64, min: f64 },
    #[error("step length decline must be greater than 1, got {0}")]
    SteplengthDecline(f64),
    #[error("iteration number must be non-negative, got {0}")]
    IterationNumber(i64),
    #[error("cannot open logfile '{path}': {source}")]
    Logfile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// How the coefficient-update equation `S'(SS' + R)^{-1} H` is inverted.
///
/// `Exact` assumes `R = I` and solves `(S'S + I)^{-1} S' H` directly; the
/// three subspace variants work in the truncated left singular space of `S`
/// and differ only in how the measurement-error term enters: the exact `R`,
/// the sample covariance `EE'`, or `E` itself (cheapest when there are far
/// more observations than realizations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InversionType {
    Exact,
    SubspaceExactR,
    SubspaceEeR,
    SubspaceRe,
}

impl InversionType {
    pub fn tag(self) -> i64 {
        match self {
            InversionType::Exact => 0,
            InversionType::SubspaceExactR => 1,
            InversionType::SubspaceEeR => 2,
            InversionType::SubspaceRe => 3,
        }
    }
}

impl TryFrom<i64> for InversionType {
    type Error = ConfigError;

    fn try_from(tag: i64) -> Result<Self, ConfigError> {
        match tag {
            0 => Ok(InversionType::Exact),
            1 => Ok(InversionType::SubspaceExactR),
            2 => Ok(InversionType::SubspaceEeR),
            3 => Ok(InversionType::SubspaceRe),
            other => Err(ConfigError::UnknownInversion(other)),
        }
    }
}

/// SVD truncation: either an energy fraction in (0, 1] or a fixed subspace
/// dimension. Setting one branch discards the other; queries for the wrong
/// branch return a negative sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Truncation {
    Fraction(f64),
    Dimension(usize),
}

impl Truncation {
    /// The energy fraction, or -1.0 when a fixed dimension is configured.
    pub fn fraction(&self) -> f64 {
        match self {
            Truncation::Fraction(f) => *f,
            Truncation::Dimension(_) => -1.0,
        }
    }

    /// The subspace dimension, or -1 when an energy fraction is configured.
    pub fn dimension(&self) -> i64 {
        match self {
            Truncation::Fraction(_) => -1,
            Truncation::Dimension(k) => *k as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    inversion: InversionType,
    truncation: Truncation,
    max_steplength: f64,
    min_steplength: f64,
    dec_steplength: f64,
    aa_projection: bool,
    logfile: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inversion: InversionType::SubspaceExactR,
            truncation: Truncation::Fraction(DEFAULT_TRUNCATION),
            max_steplength: DEFAULT_MAX_STEPLENGTH,
            min_steplength: DEFAULT_MIN_STEPLENGTH,
            dec_steplength: DEFAULT_DEC_STEPLENGTH,
            aa_projection: true,
            logfile: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inversion(&self) -> InversionType {
        self.inversion
    }

    pub fn set_inversion(&mut self, inversion: InversionType) {
        self.inversion = inversion;
    }

    pub fn truncation(&self) -> Truncation {
        self.truncation
    }

    /// Switch the truncation to an energy fraction, replacing any configured
    /// subspace dimension.
    pub fn set_truncation(&mut self, fraction: f64) -> Result<(), ConfigError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::TruncationFraction(fraction));
        }
        self.truncation = Truncation::Fraction(fraction);
        Ok(())
    }

    /// Switch the truncation to a fixed subspace dimension, replacing any
    /// configured energy fraction.
    pub fn set_subspace_dimension(&mut self, dimension: i64) -> Result<(), ConfigError> {
        if dimension < 1 {
            return Err(ConfigError::SubspaceDimension(dimension));
        }
        self.truncation = Truncation::Dimension(dimension as usize);
        Ok(())
    }

    pub fn max_steplength(&self) -> f64 {
        self.max_steplength
    }

    pub fn set_max_steplength(&mut self, max: f64) -> Result<(), ConfigError> {
        if !(max >= self.min_steplength && self.min_steplength > 0.0) {
            return Err(ConfigError::SteplengthBounds {
                max,
                min: self.min_steplength,
            });
        }
        self.max_steplength = max;
        Ok(())
    }

    pub fn min_steplength(&self) -> f64 {
        self.min_steplength
    }

    pub fn set_min_steplength(&mut self, min: f64) -> Result<(), ConfigError> {
        if !(min > 0.0 && min <= self.max_steplength) {
            return Err(ConfigError::SteplengthBounds {
                max: self.max_steplength,
                min,
            });
        }
        self.min_steplength = min;
        Ok(())
    }

    pub fn dec_steplength(&self) -> f64 {
        self.dec_steplength
    }

    pub fn set_dec_steplength(&mut self, dec: f64) -> Result<(), ConfigError> {
        if !(dec > 1.0) {
            return Err(ConfigError::SteplengthDecline(dec));
        }
        self.dec_steplength = dec;
        Ok(())
    }

    pub fn aa_projection(&self) -> bool {
        self.aa_projection
    }

    pub fn set_aa_projection(&mut self, enabled: bool) {
        self.aa_projection = enabled;
    }

    pub fn logfile(&self) -> Option<&Path> {
        self.logfile.as_deref()
    }

    pub fn set_logfile(&mut self, path: impl Into<PathBuf>) {
        self.logfile = Some(path.into());
    }

    /// Step length for the given iteration (1-based): a geometric decline
    /// from `max` toward `min`,
    /// `gamma = min + (max - min) * 2^(-(iter - 1) / (dec - 1))`.
    pub fn calculate_steplength(&self, iteration_nr: usize) -> f64 {
        let exponent = -((iteration_nr as f64) - 1.0) / (self.dec_steplength - 1.0);
        self.min_steplength + (self.max_steplength - self.min_steplength) * 2f64.powf(exponent)
    }
}
