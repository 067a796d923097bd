//! Driver-facing surface of the analysis module: an owned state object plus
//! the named-key configuration interface the host consumes.

use crate::config::{Config, ConfigError, InversionType};
use crate::data::Data;
use crate::mask::Mask;
use crate::update::{self, IesError};
use ndarray::{Array1, Array2};
use rand::RngCore;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const MODULE_NAME: &str = "IES_ENKF";

pub const ENKF_SUBSPACE_DIMENSION_KEY: &str = "ENKF_SUBSPACE_DIMENSION";
pub const ENKF_TRUNCATION_KEY: &str = "ENKF_TRUNCATION";
pub const IES_MAX_STEPLENGTH_KEY: &str = "IES_MAX_STEPLENGTH";
pub const IES_MIN_STEPLENGTH_KEY: &str = "IES_MIN_STEPLENGTH";
pub const IES_DEC_STEPLENGTH_KEY: &str = "IES_DEC_STEPLENGTH";
pub const ITER_KEY: &str = "ITER";
pub const IES_INVERSION_KEY: &str = "IES_INVERSION";
pub const IES_LOGFILE_KEY: &str = "IES_LOGFILE";
pub const IES_AAPROJECTION_KEY: &str = "IES_AAPROJECTION";
pub const IES_DEBUG_KEY: &str = "IES_DEBUG";

/// Option flag bits reported through [`AnalysisModule::get_options`].
pub const ANALYSIS_NEED_ED: u32 = 1;
pub const ANALYSIS_USE_A: u32 = 4;
pub const ANALYSIS_UPDATE_A: u32 = 8;
pub const ANALYSIS_SCALE_DATA: u32 = 16;
pub const ANALYSIS_ITERABLE: u32 = 32;

/// Sink for the per-iteration textual record. Injected into the module so no
/// process-wide logger state is involved.
pub trait IterationLog {
    fn record(&mut self, iteration_nr: usize, costf: f64);
}

/// Appends newline-terminated iteration records to a file.
pub struct FileLog {
    writer: BufWriter<File>,
}

impl FileLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl IterationLog for FileLog {
    fn record(&mut self, iteration_nr: usize, costf: f64) {
        let _ = writeln!(self.writer, "IES iter:{iteration_nr} cost function: {costf}");
        let _ = self.writer.flush();
    }
}

/// The iterative-smoother analysis module: owns the iteration state and the
/// configuration, and exposes the update entry points plus typed get/set
/// access to the recognized configuration keys.
///
/// One module instance serves one iteration chain; drivers running several
/// chains in parallel hold one instance per chain.
pub struct AnalysisModule {
    config: Config,
    data: Data,
    sink: Option<Box<dyn IterationLog + Send>>,
}

impl Default for AnalysisModule {
    fn default() -> Self {
        Self::alloc()
    }
}

impl AnalysisModule {
    pub fn alloc() -> Self {
        Self {
            config: Config::new(),
            data: Data::new(),
            sink: None,
        }
    }

    pub fn name(&self) -> &'static str {
        MODULE_NAME
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    /// Replace the iteration-log sink. Configuring `IES_LOGFILE` installs a
    /// [`FileLog`] through the same slot.
    pub fn set_log_sink(&mut self, sink: Box<dyn IterationLog + Send>) {
        self.sink = Some(sink);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init_update(
        &mut self,
        ens_mask: &Mask,
        obs_mask: &Mask,
        s: &Array2<f64>,
        r: &Array2<f64>,
        d_obs: &Array1<f64>,
        e: &Array2<f64>,
        d: &Array2<f64>,
        _rng: &mut dyn RngCore,
    ) -> Result<(), IesError> {
        update::init_update(&mut self.data, ens_mask, obs_mask, s, r, d_obs, e, d)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_a(
        &mut self,
        a: &mut Array2<f64>,
        y: &Array2<f64>,
        r: &Array2<f64>,
        d_obs: &Array1<f64>,
        e: &Array2<f64>,
        d: &Array2<f64>,
        _rng: &mut dyn RngCore,
    ) -> Result<(), IesError> {
        let costf = update::update_a(&mut self.data, &self.config, a, y, r, d_obs, e, d)?;
        let iteration_nr = self.data.iteration_nr();
        log::info!("IES iter:{iteration_nr} cost function: {costf}");
        if let Some(sink) = &mut self.sink {
            sink.record(iteration_nr, costf);
        }
        Ok(())
    }

    /// Stateless convenience: compute a transform matrix from the current
    /// configuration without touching the iteration state.
    pub fn init_x(
        &self,
        y: &Array2<f64>,
        r: &Array2<f64>,
        e: &Array2<f64>,
        d: &Array2<f64>,
    ) -> Result<Array2<f64>, IesError> {
        update::init_x(&self.config, y, r, e, d)
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> Result<(), IesError> {
        match name {
            ENKF_SUBSPACE_DIMENSION_KEY => {
                self.config.set_subspace_dimension(value)?;
            }
            ITER_KEY => {
                if value < 0 {
                    return Err(ConfigError::IterationNumber(value).into());
                }
                self.data.set_iteration_nr(value as usize);
            }
            IES_INVERSION_KEY => {
                self.config.set_inversion(InversionType::try_from(value)?);
            }
            _ => return Err(ConfigError::UnknownKey(name.to_string()).into()),
        }
        Ok(())
    }

    /// Integer queries return -1 for unknown names and for the subspace
    /// dimension when an energy fraction is configured instead.
    pub fn get_int(&self, name: &str) -> i64 {
        match name {
            ITER_KEY => self.data.iteration_nr() as i64,
            ENKF_SUBSPACE_DIMENSION_KEY => self.config.truncation().dimension(),
            IES_INVERSION_KEY => self.config.inversion().tag(),
            _ => -1,
        }
    }

    pub fn set_double(&mut self, name: &str, value: f64) -> Result<(), IesError> {
        match name {
            ENKF_TRUNCATION_KEY => self.config.set_truncation(value)?,
            IES_MAX_STEPLENGTH_KEY => self.config.set_max_steplength(value)?,
            IES_MIN_STEPLENGTH_KEY => self.config.set_min_steplength(value)?,
            IES_DEC_STEPLENGTH_KEY => self.config.set_dec_steplength(value)?,
            _ => return Err(ConfigError::UnknownKey(name.to_string()).into()),
        }
        Ok(())
    }

    /// Double queries return -1.0 for unknown names and for the truncation
    /// fraction when a subspace dimension is configured instead.
    pub fn get_double(&self, name: &str) -> f64 {
        match name {
            ENKF_TRUNCATION_KEY => self.config.truncation().fraction(),
            IES_MAX_STEPLENGTH_KEY => self.config.max_steplength(),
            IES_MIN_STEPLENGTH_KEY => self.config.min_steplength(),
            IES_DEC_STEPLENGTH_KEY => self.config.dec_steplength(),
            _ => -1.0,
        }
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<(), IesError> {
        match name {
            IES_AAPROJECTION_KEY => self.config.set_aa_projection(value),
            IES_DEBUG_KEY => {
                log::warn!("The key {IES_DEBUG_KEY} is ignored");
            }
            _ => return Err(ConfigError::UnknownKey(name.to_string()).into()),
        }
        Ok(())
    }

    pub fn get_bool(&self, name: &str) -> bool {
        match name {
            IES_AAPROJECTION_KEY => self.config.aa_projection(),
            _ => false,
        }
    }

    pub fn set_string(&mut self, name: &str, value: &str) -> Result<(), IesError> {
        match name {
            IES_LOGFILE_KEY => {
                let sink = FileLog::create(Path::new(value)).map_err(|source| {
                    ConfigError::Logfile {
                        path: value.to_string(),
                        source,
                    }
                })?;
                self.config.set_logfile(value);
                self.sink = Some(Box::new(sink));
                Ok(())
            }
            _ => Err(ConfigError::UnknownKey(name.to_string()).into()),
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match name {
            IES_LOGFILE_KEY => self.config.logfile().and_then(|p| p.to_str()),
            _ => None,
        }
    }

    pub fn has_var(&self, name: &str) -> bool {
        matches!(
            name,
            ENKF_SUBSPACE_DIMENSION_KEY
                | ENKF_TRUNCATION_KEY
                | IES_MAX_STEPLENGTH_KEY
                | IES_MIN_STEPLENGTH_KEY
                | IES_DEC_STEPLENGTH_KEY
                | ITER_KEY
                | IES_INVERSION_KEY
                | IES_LOGFILE_KEY
                | IES_AAPROJECTION_KEY
                | IES_DEBUG_KEY
        )
    }

    pub fn get_options(&self) -> u32 {
        ANALYSIS_NEED_ED | ANALYSIS_UPDATE_A | ANALYSIS_SCALE_DATA | ANALYSIS_ITERABLE
    }
}
