//! Persistent state carried across smoother iterations.
//!
//! The number of realizations can only shrink between iterations, while the
//! active observation set may both shrink and grow. The coefficient matrix
//! `W` therefore stays at its original size with inactive rows and columns
//! pinned to zero, the initial parameter ensemble `A0` is scattered into
//! original-size columns, and the initial perturbation matrix `E` grows a row
//! for every observation the first time that observation becomes active.

use crate::mask::{Mask, alloc_active};
use crate::update::IesError;
use ndarray::{Array2, ArrayBase, Data as NdData, Ix2, s};

#[derive(Debug, Clone, Default)]
pub struct Data {
    iteration_nr: usize,
    state_size: Option<usize>,
    ens_mask: Option<Mask>,
    obs_mask: Option<Mask>,
    obs_mask0: Option<Mask>,
    w: Option<Array2<f64>>,
    e: Option<Array2<f64>>,
    /// Row of `e` holding each observation's initial perturbations, `None`
    /// until the observation first becomes active. Indexed by the full
    /// observation mask.
    e_row_of_obs: Vec<Option<usize>>,
    a0: Option<Array2<f64>>,
}

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iteration_nr(&self) -> usize {
        self.iteration_nr
    }

    pub fn set_iteration_nr(&mut self, iteration_nr: usize) {
        self.iteration_nr = iteration_nr;
    }

    /// Pre-increment: the first returned value is 1.
    pub fn inc_iteration_nr(&mut self) -> usize {
        self.iteration_nr += 1;
        self.iteration_nr
    }

    pub fn state_size(&self) -> Option<usize> {
        self.state_size
    }

    pub fn update_state_size(&mut self, state_size: usize) {
        self.state_size = Some(state_size);
    }

    pub fn ens_mask(&self) -> Option<&Mask> {
        self.ens_mask.as_ref()
    }

    pub fn obs_mask(&self) -> Option<&Mask> {
        self.obs_mask.as_ref()
    }

    pub fn obs_mask0(&self) -> Option<&Mask> {
        self.obs_mask0.as_ref()
    }

    pub fn w(&self) -> Option<&Array2<f64>> {
        self.w.as_ref()
    }

    pub fn e(&self) -> Option<&Array2<f64>> {
        self.e.as_ref()
    }

    pub fn a0(&self) -> Option<&Array2<f64>> {
        self.a0.as_ref()
    }

    /// Refresh the realization mask. The mask length is fixed by the first
    /// call, and a realization that has dropped out can never re-enter.
    pub fn update_ens_mask(&mut self, mask: &Mask) -> Result<(), IesError> {
        if let Some(current) = &self.ens_mask {
            if current.len() != mask.len() {
                return Err(IesError::Mask(format!(
                    "ensemble mask length changed from {} to {}",
                    current.len(),
                    mask.len()
                )));
            }
            for i in 0..mask.len() {
                if mask.get(i) && !current.get(i) {
                    return Err(IesError::Mask(format!(
                        "realization {i} cannot be reactivated"
                    )));
                }
            }
        }
        self.ens_mask = Some(mask.clone());
        Ok(())
    }

    /// Freeze the first-iteration observation mask; a no-op afterwards.
    pub fn store_initial_obs_mask(&mut self, mask: &Mask) {
        if self.obs_mask0.is_none() {
            self.obs_mask0 = Some(mask.clone());
            self.e_row_of_obs = vec![None; mask.len()];
        }
    }

    /// Refresh the per-iteration observation mask; observations may drop out
    /// and come back, but the mask length is fixed by the first iteration.
    pub fn update_obs_mask(&mut self, mask: &Mask) -> Result<(), IesError> {
        if let Some(initial) = &self.obs_mask0 {
            if initial.len() != mask.len() {
                return Err(IesError::Mask(format!(
                    "observation mask length changed from {} to {}",
                    initial.len(),
                    mask.len()
                )));
            }
        }
        self.obs_mask = Some(mask.clone());
        Ok(())
    }

    /// Size the coefficient matrix to the full ensemble and zero-fill it, if
    /// not already allocated.
    pub fn allocate_w(&mut self) -> Result<(), IesError> {
        let ens_mask = self.ens_mask.as_ref().ok_or_else(|| {
            IesError::State("coefficient matrix requested before the ensemble mask".to_string())
        })?;
        if self.w.is_none() {
            let n0 = ens_mask.len();
            self.w = Some(Array2::zeros((n0, n0)));
        }
        Ok(())
    }

    /// Record the first-iteration perturbations: one row per observation
    /// active in the initial mask, scattered into full-size columns. A no-op
    /// once `E` exists.
    pub fn store_initial_e<S: NdData<Elem = f64>>(
        &mut self,
        e_in: &ArrayBase<S, Ix2>,
    ) -> Result<(), IesError> {
        if self.e.is_some() {
            return Ok(());
        }
        let (obs_mask0, ens_mask) = match (&self.obs_mask0, &self.ens_mask) {
            (Some(obs), Some(ens)) => (obs, ens),
            _ => {
                return Err(IesError::State(
                    "initial perturbations stored before masks".to_string(),
                ));
            }
        };
        if e_in.nrows() != obs_mask0.active_count() || e_in.ncols() != ens_mask.active_count() {
            return Err(IesError::Shape(format!(
                "initial perturbations are {}x{}, expected {}x{} from the masks",
                e_in.nrows(),
                e_in.ncols(),
                obs_mask0.active_count(),
                ens_mask.active_count()
            )));
        }

        let mut e = Array2::<f64>::zeros((obs_mask0.active_count(), ens_mask.len()));
        for (row, iobs) in obs_mask0.active_indices().enumerate() {
            self.e_row_of_obs[iobs] = Some(row);
            for (col, iens) in ens_mask.active_indices().enumerate() {
                e[[row, iens]] = e_in[[row, col]];
            }
        }
        self.e = Some(e);
        Ok(())
    }

    /// Append perturbation rows for observations that became active after the
    /// first iteration. Rows already held are never rewritten, so the initial
    /// perturbations stay fixed for the lifetime of the iteration chain.
    pub fn augment_initial_e<S: NdData<Elem = f64>>(
        &mut self,
        e_in: &ArrayBase<S, Ix2>,
    ) -> Result<(), IesError> {
        let (obs_mask, ens_mask, e) = match (&self.obs_mask, &self.ens_mask, &self.e) {
            (Some(obs), Some(ens), Some(e)) => (obs, ens, e),
            _ => {
                return Err(IesError::State(
                    "perturbations augmented before the first iteration".to_string(),
                ));
            }
        };
        if e_in.nrows() != obs_mask.active_count() || e_in.ncols() != ens_mask.active_count() {
            return Err(IesError::Shape(format!(
                "perturbations are {}x{}, expected {}x{} from the masks",
                e_in.nrows(),
                e_in.ncols(),
                obs_mask.active_count(),
                ens_mask.active_count()
            )));
        }

        let new_obs: Vec<usize> = obs_mask
            .active_indices()
            .filter(|iobs| self.e_row_of_obs[*iobs].is_none())
            .collect();
        if new_obs.is_empty() {
            return Ok(());
        }

        let old_rows = e.nrows();
        let mut grown = Array2::<f64>::zeros((old_rows + new_obs.len(), ens_mask.len()));
        grown.slice_mut(s![..old_rows, ..]).assign(e);

        let mut next_row = old_rows;
        for (input_row, iobs) in obs_mask.active_indices().enumerate() {
            if self.e_row_of_obs[iobs].is_some() {
                continue;
            }
            for (col, iens) in ens_mask.active_indices().enumerate() {
                grown[[next_row, iens]] = e_in[[input_row, col]];
            }
            self.e_row_of_obs[iobs] = Some(next_row);
            next_row += 1;
        }
        self.e = Some(grown);
        Ok(())
    }

    /// Record the first-iteration parameter ensemble, scattered into
    /// full-size columns. A no-op once stored.
    pub fn store_initial_a<S: NdData<Elem = f64>>(
        &mut self,
        a: &ArrayBase<S, Ix2>,
    ) -> Result<(), IesError> {
        if self.a0.is_some() {
            return Ok(());
        }
        let ens_mask = self.ens_mask.as_ref().ok_or_else(|| {
            IesError::State("initial parameters stored before the ensemble mask".to_string())
        })?;
        if a.ncols() != ens_mask.active_count() {
            return Err(IesError::Shape(format!(
                "parameter ensemble has {} columns, expected {} active realizations",
                a.ncols(),
                ens_mask.active_count()
            )));
        }

        let mut a0 = Array2::<f64>::zeros((a.nrows(), ens_mask.len()));
        for (col, iens) in ens_mask.active_indices().enumerate() {
            a0.column_mut(iens).assign(&a.column(col));
        }
        self.a0 = Some(a0);
        Ok(())
    }

    /// Active slice of the coefficient matrix (active realizations on both
    /// axes).
    pub fn active_w(&self) -> Result<Array2<f64>, IesError> {
        let (w, ens_mask) = match (&self.w, &self.ens_mask) {
            (Some(w), Some(ens)) => (w, ens),
            _ => {
                return Err(IesError::State(
                    "coefficient matrix requested before initialization".to_string(),
                ));
            }
        };
        alloc_active(w, ens_mask, ens_mask)
    }

    /// Initial perturbations for the currently active observations and
    /// realizations, rows in observation-mask order.
    pub fn active_e(&self) -> Result<Array2<f64>, IesError> {
        let (e, obs_mask, ens_mask) = match (&self.e, &self.obs_mask, &self.ens_mask) {
            (Some(e), Some(obs), Some(ens)) => (e, obs, ens),
            _ => {
                return Err(IesError::State(
                    "perturbations requested before the first iteration".to_string(),
                ));
            }
        };

        let mut active = Array2::<f64>::zeros((obs_mask.active_count(), ens_mask.active_count()));
        for (row, iobs) in obs_mask.active_indices().enumerate() {
            let stored_row = self.e_row_of_obs[iobs].ok_or_else(|| {
                IesError::State(format!(
                    "observation {iobs} is active but has no stored perturbations"
                ))
            })?;
            for (col, iens) in ens_mask.active_indices().enumerate() {
                active[[row, col]] = e[[stored_row, iens]];
            }
        }
        Ok(active)
    }

    /// Initial parameters restricted to the currently active realizations.
    pub fn active_a(&self) -> Result<Array2<f64>, IesError> {
        let (a0, ens_mask) = match (&self.a0, &self.ens_mask) {
            (Some(a0), Some(ens)) => (a0, ens),
            _ => {
                return Err(IesError::State(
                    "initial parameters requested before the first iteration".to_string(),
                ));
            }
        };

        let mut active = Array2::<f64>::zeros((a0.nrows(), ens_mask.active_count()));
        for (col, iens) in ens_mask.active_indices().enumerate() {
            active.column_mut(col).assign(&a0.column(iens));
        }
        Ok(active)
    }

    /// Write the updated active coefficients back through the realization
    /// mask. Inactive rows and columns are reset to exactly zero. An active
    /// matrix of the wrong size is rejected outright.
    pub fn store_active_w<S: NdData<Elem = f64>>(
        &mut self,
        w_active: &ArrayBase<S, Ix2>,
    ) -> Result<(), IesError> {
        let ens_mask = self.ens_mask.as_ref().ok_or_else(|| {
            IesError::State("coefficients stored before the ensemble mask".to_string())
        })?;
        let active_count = ens_mask.active_count();
        if w_active.nrows() != active_count || w_active.ncols() != active_count {
            return Err(IesError::Shape(format!(
                "active coefficients are {}x{}, expected {}x{}",
                w_active.nrows(),
                w_active.ncols(),
                active_count,
                active_count
            )));
        }
        let w = self.w.as_mut().ok_or_else(|| {
            IesError::State("coefficients stored before allocation".to_string())
        })?;

        w.fill(0.0);
        for (row, iens) in ens_mask.active_indices().enumerate() {
            for (col, jens) in ens_mask.active_indices().enumerate() {
                w[[iens, jens]] = w_active[[row, col]];
            }
        }
        Ok(())
    }
}
