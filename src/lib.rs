#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod data;
pub mod faer_ndarray;
pub mod linalg;
pub mod mask;
pub mod module;
pub mod update;

pub use config::{
    Config, ConfigError, DEFAULT_DEC_STEPLENGTH, DEFAULT_MAX_STEPLENGTH, DEFAULT_MIN_STEPLENGTH,
    DEFAULT_TRUNCATION, InversionType, Truncation,
};
pub use data::Data;
pub use mask::{Mask, alloc_active};
pub use module::{
    ANALYSIS_ITERABLE, ANALYSIS_NEED_ED, ANALYSIS_SCALE_DATA, ANALYSIS_UPDATE_A, ANALYSIS_USE_A,
    AnalysisModule, ENKF_SUBSPACE_DIMENSION_KEY, ENKF_TRUNCATION_KEY, FileLog,
    IES_AAPROJECTION_KEY, IES_DEBUG_KEY, IES_DEC_STEPLENGTH_KEY, IES_INVERSION_KEY,
    IES_LOGFILE_KEY, IES_MAX_STEPLENGTH_KEY, IES_MIN_STEPLENGTH_KEY, ITER_KEY, IterationLog,
    MODULE_NAME,
};
pub use update::{IesError, init_update, init_x, update_a};
