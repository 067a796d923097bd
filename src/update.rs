//! The per-iteration update: refresh masks, carry the coefficient matrix
//! forward, invert the update equation in the configured mode, and move the
//! parameter ensemble toward the observations.

use crate::config::{Config, ConfigError, InversionType, Truncation};
use crate::data::Data;
use crate::faer_ndarray::{FaerLinalgError, FaerSvd, fast_ab, fast_abt, fast_ata, fast_atb, lu_solve};
use crate::linalg::{gen_x3, lowrank_cinv, lowrank_e, subtract_row_mean};
use crate::mask::Mask;
use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IesError {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("mask violation: {0}")]
    Mask(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("numerical failure: {0}")]
    Numerical(String),
    #[error("invalid module state: {0}")]
    State(String),
}

impl From<FaerLinalgError> for IesError {
    fn from(err: FaerLinalgError) -> Self {
        IesError::Numerical(err.to_string())
    }
}

/// Per-iteration entry point: refresh the realization mask, make sure the
/// coefficient matrix exists, and record the observation mask (frozen on the
/// first call, updated every call thereafter).
///
/// The matrix arguments are part of the driver-facing signature but are not
/// consumed here; the driver supplies them again to [`update_a`].
#[allow(clippy::too_many_arguments)]
pub fn init_update(
    data: &mut Data,
    ens_mask: &Mask,
    obs_mask: &Mask,
    _s: &Array2<f64>,
    _r: &Array2<f64>,
    _d_obs: &Array1<f64>,
    _e: &Array2<f64>,
    _d: &Array2<f64>,
) -> Result<(), IesError> {
    data.update_ens_mask(ens_mask)?;
    data.allocate_w()?;
    data.store_initial_obs_mask(obs_mask);
    data.update_obs_mask(obs_mask)?;
    Ok(())
}

/// One smoother iteration: compute the transform `X` from the current
/// coefficient matrix and the supplied measurements, commit the updated
/// state, and overwrite `a` with `A0_active * X`.
///
/// All state mutations (`W`, `E`, `A0`, the iteration counter) are staged on
/// a copy and committed only after every numerical step has succeeded, so a
/// failed iteration leaves both the caller's ensemble and the iteration
/// state exactly as they were.
///
/// Returns the cost function value for the iteration.
#[allow(clippy::too_many_arguments)]
pub fn update_a(
    data: &mut Data,
    config: &Config,
    a: &mut Array2<f64>,
    y_in: &Array2<f64>,
    r_in: &Array2<f64>,
    d_obs: &Array1<f64>,
    e_in: &Array2<f64>,
    d_in: &Array2<f64>,
) -> Result<f64, IesError> {
    let ens_size = y_in.ncols();
    let obs_size = y_in.nrows();
    let state_size = a.nrows();

    {
        let (ens_mask, obs_mask) = match (data.ens_mask(), data.obs_mask()) {
            (Some(ens), Some(obs)) => (ens, obs),
            _ => {
                return Err(IesError::State(
                    "update_a called before init_update".to_string(),
                ));
            }
        };
        if ens_mask.active_count() != ens_size {
            return Err(IesError::Shape(format!(
                "measurements have {ens_size} columns but {} realizations are active",
                ens_mask.active_count()
            )));
        }
        if obs_mask.active_count() != obs_size {
            return Err(IesError::Shape(format!(
                "measurements have {obs_size} rows but {} observations are active",
                obs_mask.active_count()
            )));
        }
    }
    if a.ncols() != ens_size {
        return Err(IesError::Shape(format!(
            "parameter ensemble has {} columns, measurements have {ens_size}",
            a.ncols()
        )));
    }
    if r_in.nrows() != obs_size || r_in.ncols() != obs_size {
        return Err(IesError::Shape(format!(
            "error covariance is {}x{}, expected {obs_size}x{obs_size}",
            r_in.nrows(),
            r_in.ncols()
        )));
    }
    if d_obs.len() != obs_size {
        return Err(IesError::Shape(format!(
            "observation vector has length {}, expected {obs_size}",
            d_obs.len()
        )));
    }
    for (name, matrix) in [("perturbations", e_in), ("residuals", d_in)] {
        if matrix.nrows() != obs_size || matrix.ncols() != ens_size {
            return Err(IesError::Shape(format!(
                "{name} are {}x{}, expected {obs_size}x{ens_size}",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
    }

    let iteration_nr = data.iteration_nr() + 1;
    let steplength = config.calculate_steplength(iteration_nr);

    // Stage every state change on a copy; commit only on full success.
    let mut staged = data.clone();
    staged.update_state_size(state_size);
    if staged.iteration_nr() == 0 {
        staged.store_initial_e(e_in)?;
    } else {
        staged.augment_initial_e(e_in)?;
    }
    staged.store_initial_a(&*a)?;

    // Bring the residuals onto the basis of the initial perturbations:
    // D = D - E_in + E0.
    let e0 = staged.active_e()?;
    let mut d = d_in.clone();
    d -= e_in;
    d += &e0;

    let (x, costf) = compute_transform(
        if config.aa_projection() { Some(&*a) } else { None },
        y_in,
        r_in,
        &e0,
        &d,
        config.inversion(),
        config.truncation(),
        config.aa_projection(),
        &mut staged,
        steplength,
    )?;

    // A' = A0_active * X, written back only once the iteration has committed.
    let a0 = staged.active_a()?;
    let a_new = fast_ab(&a0, &x);
    if !a_new.iter().all(|v| v.is_finite()) {
        return Err(IesError::Numerical(
            "updated ensemble contains non-finite values".to_string(),
        ));
    }

    staged.inc_iteration_nr();
    *data = staged;
    a.assign(&a_new);
    Ok(costf)
}

/// Stateless transform computation: one update with an all-active mask, unit
/// step length, and no projection. Useful for drivers that want the `X`
/// matrix without maintaining iteration state.
pub fn init_x(
    config: &Config,
    y0: &Array2<f64>,
    r: &Array2<f64>,
    e: &Array2<f64>,
    d: &Array2<f64>,
) -> Result<Array2<f64>, IesError> {
    let ens_size = y0.ncols();
    let obs_size = y0.nrows();
    if r.nrows() != obs_size || r.ncols() != obs_size {
        return Err(IesError::Shape(format!(
            "error covariance is {}x{}, expected {obs_size}x{obs_size}",
            r.nrows(),
            r.ncols()
        )));
    }
    for (name, matrix) in [("perturbations", e), ("residuals", d)] {
        if matrix.nrows() != obs_size || matrix.ncols() != ens_size {
            return Err(IesError::Shape(format!(
                "{name} are {}x{}, expected {obs_size}x{ens_size}",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
    }

    let mut data = Data::new();
    data.update_ens_mask(&Mask::new_active(ens_size))?;
    data.allocate_w()?;
    let obs_mask = Mask::new_active(obs_size);
    data.store_initial_obs_mask(&obs_mask);
    data.update_obs_mask(&obs_mask)?;

    let (x, _costf) = compute_transform(
        None,
        y0,
        r,
        e,
        d,
        config.inversion(),
        config.truncation(),
        false,
        &mut data,
        1.0,
    )?;
    Ok(x)
}

/// Core of the iteration: scale the measurement anomalies, solve for `S`
/// through the Omega system, update the coefficient matrix in the configured
/// inversion mode, and assemble `X = I + W / sqrt(N - 1)`.
///
/// Also evaluates the cost function `(1/N) sum_i (|W_i|^2 + |D_i|^2)`
/// against the pre-update coefficients.
#[allow(clippy::too_many_arguments)]
fn compute_transform(
    a: Option<&Array2<f64>>,
    y0: &Array2<f64>,
    r: &Array2<f64>,
    e: &Array2<f64>,
    d: &Array2<f64>,
    inversion: InversionType,
    truncation: Truncation,
    use_aa_projection: bool,
    data: &mut Data,
    steplength: f64,
) -> Result<(Array2<f64>, f64), IesError> {
    let ens_size = y0.ncols();
    let nsc = 1.0 / ((ens_size as f64) - 1.0).sqrt();

    // Y = (Y0 - row_mean(Y0)) / sqrt(N - 1): predicted anomaly matrix.
    let mut y = y0.clone();
    subtract_row_mean(&mut y);
    y *= nsc;

    // Project Y onto the span of the demeaned parameter anomalies. Only
    // meaningful when the parameter space is smaller than the ensemble span.
    if let Some(a) = a {
        if use_aa_projection && a.nrows() + 1 <= ens_size {
            compute_aa_projection(a, &mut y)?;
        }
    }

    let mut w0 = data.active_w()?;

    let s = solve_s(&w0, &y)?;

    // Innovation H = S * W + D.
    let mut h = d.clone();
    h += &fast_ab(&s, &w0);

    // Keep the previous coefficients for the cost function.
    let w_prev = w0.clone();

    match inversion {
        InversionType::Exact => exact_inversion(&mut w0, &s, &h, steplength)?,
        _ => subspace_inversion(&mut w0, inversion, e, r, &s, &h, truncation, steplength)?,
    }
    if !w0.iter().all(|v| v.is_finite()) {
        return Err(IesError::Numerical(
            "updated coefficients contain non-finite values".to_string(),
        ));
    }

    data.store_active_w(&w0)?;

    // X = I + W / sqrt(N - 1).
    let mut x = &w0 * nsc;
    for i in 0..ens_size {
        x[[i, i]] += 1.0;
    }

    let mut costf = 0.0;
    for i in 0..ens_size {
        let w_col = w_prev.column(i);
        let d_col = d.column(i);
        costf += w_col.dot(&w_col) + d_col.dot(&d_col);
    }
    costf /= ens_size as f64;

    Ok((x, costf))
}

/// Restrict `Y` to the column space of the demeaned parameter anomalies:
/// `Y = Y * (V^T)' * V^T` with `V^T` from the thin SVD of `A - row_mean(A)`.
fn compute_aa_projection(a: &Array2<f64>, y: &mut Array2<f64>) -> Result<(), IesError> {
    let mut ai = a.clone();
    subtract_row_mean(&mut ai);
    let (_, _sig, vt_opt) = ai.thin_svd(false, true)?;
    let vt = match vt_opt {
        Some(vt) => vt,
        None => {
            return Err(IesError::Numerical(
                "SVD did not return right singular vectors".to_string(),
            ));
        }
    };
    let projector = fast_ata(&vt);
    *y = fast_ab(y, &projector);
    Ok(())
}

/// Solve `S = Y * Omega^{-1}` with `Omega = I + W (I - 11'/N) / sqrt(N - 1)`,
/// posed as the transposed system `Omega^T S^T = Y^T`.
fn solve_s(w0: &Array2<f64>, y: &Array2<f64>) -> Result<Array2<f64>, IesError> {
    let ens_size = w0.ncols();
    let nsc = 1.0 / ((ens_size as f64) - 1.0).sqrt();

    let mut omega = w0.clone();
    subtract_row_mean(&mut omega);
    omega *= nsc;
    let mut omega_t = omega.t().to_owned();
    for i in 0..ens_size {
        omega_t[[i, i]] += 1.0;
    }

    let st = lu_solve(&omega_t, &y.t())?;
    Ok(st.t().to_owned())
}

/// Subspace form of the coefficient update,
/// `W = (1 - gamma) W + gamma S' (S S' + R)^{-1} H`,
/// with the error term entering as exact `R`, as `E E'`, or as `E` itself.
#[allow(clippy::too_many_arguments)]
fn subspace_inversion(
    w0: &mut Array2<f64>,
    inversion: InversionType,
    e: &Array2<f64>,
    r: &Array2<f64>,
    s: &Array2<f64>,
    h: &Array2<f64>,
    truncation: Truncation,
    steplength: f64,
) -> Result<(), IesError> {
    let ens_size = s.ncols() as f64;
    let nsc = 1.0 / (ens_size - 1.0).sqrt();

    let (x1, eig) = match inversion {
        InversionType::SubspaceRe => {
            let scaled_e = e * nsc;
            lowrank_e(s, &scaled_e, truncation)?
        }
        InversionType::SubspaceEeR => {
            let cee = fast_abt(e, e) * (1.0 / ((ens_size - 1.0) * (ens_size - 1.0)));
            lowrank_cinv(s, &cee, truncation)?
        }
        InversionType::SubspaceExactR => {
            let scaled_r = r * (nsc * nsc);
            lowrank_cinv(s, &scaled_r, truncation)?
        }
        InversionType::Exact => unreachable!("exact inversion is dispatched separately"),
    };

    let x3 = gen_x3(&x1, h, &eig);
    let update = fast_atb(s, &x3);
    w0.zip_mut_with(&update, |w, &u| {
        *w = (1.0 - steplength) * *w + steplength * u;
    });
    Ok(())
}

/// Exact form of the coefficient update for `R = I`:
/// `W = (1 - gamma) W + gamma (S'S + I)^{-1} S' H`
/// via the spectral decomposition of `S'S + I`.
fn exact_inversion(
    w0: &mut Array2<f64>,
    s: &Array2<f64>,
    h: &Array2<f64>,
    steplength: f64,
) -> Result<(), IesError> {
    let ens_size = s.ncols();

    let mut sts = fast_ata(s);
    for i in 0..ens_size {
        sts[[i, i]] += 1.0;
    }
    let (z_opt, eig, _) = sts.thin_svd(true, false)?;
    let z = match z_opt {
        Some(z) => z,
        None => {
            return Err(IesError::Numerical(
                "SVD did not return left singular vectors".to_string(),
            ));
        }
    };

    let mut zt_st_h = fast_atb(&z, &fast_atb(s, h));
    // Eigenvalues of S'S + I are bounded below by 1.
    for ((i, _), value) in zt_st_h.indexed_iter_mut() {
        *value /= eig[i];
    }
    let update = fast_ab(&z, &zt_st_h);
    w0.zip_mut_with(&update, |w, &u| {
        *w = (1.0 - steplength) * *w + steplength * u;
    });
    Ok(())
}
