//! Dense kernels for the ensemble update: row-mean centering, the truncated
//! SVD of the scaled anomaly matrix, and the low-rank pseudo-inverse forms
//! used by the subspace inversions.

use crate::config::Truncation;
use crate::faer_ndarray::{FaerEigh, FaerSvd, fast_ab, fast_atb};
use crate::update::IesError;
use faer::Side;
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Subtract each row's mean from the row, i.e. right-multiply by
/// `I - 11'/N`. Centers ensemble anomalies around zero.
pub fn subtract_row_mean(matrix: &mut Array2<f64>) {
    if matrix.ncols() == 0 {
        return;
    }
    let inv_n = 1.0 / matrix.ncols() as f64;
    for mut row in matrix.rows_mut() {
        let mean = row.sum() * inv_n;
        row -= mean;
    }
}

/// Number of leading singular values retained under the truncation rule.
///
/// The fraction rule keeps adding values while the energy accumulated so far
/// stays below the requested fraction of the total; the dimension rule keeps
/// exactly `k` values. Neither retains zero singular values.
fn num_significant(sig: &[f64], truncation: Truncation) -> usize {
    match truncation {
        Truncation::Fraction(fraction) => {
            let total: f64 = sig.iter().map(|s| s * s).sum();
            if total <= 0.0 {
                return 0;
            }
            let mut running = 0.0;
            let mut count = 0;
            for &s in sig {
                if s <= 0.0 || running / total >= fraction {
                    break;
                }
                count += 1;
                running += s * s;
            }
            count
        }
        Truncation::Dimension(k) => sig.iter().take_while(|s| **s > 0.0).count().min(k),
    }
}

/// Truncated SVD of the scaled anomaly matrix `S` (m x N).
///
/// Returns the thin left singular vectors `U0` (m x min(m, N)) and the
/// inverted singular values, with entries past the truncation point zeroed.
/// Downstream products therefore see the insignificant directions as exact
/// zeros rather than amplified noise.
pub fn svd_s<S: Data<Elem = f64>>(
    s: &ArrayBase<S, Ix2>,
    truncation: Truncation,
) -> Result<(Array2<f64>, Vec<f64>), IesError> {
    let (u0_opt, sig, _) = s.thin_svd(true, false)?;
    let u0 = match u0_opt {
        Some(u0) => u0,
        None => {
            return Err(IesError::Numerical(
                "SVD did not return left singular vectors".to_string(),
            ));
        }
    };

    let sig: Vec<f64> = sig.to_vec();
    let significant = num_significant(&sig, truncation);
    let mut inv_sig = vec![0.0; sig.len()];
    for i in 0..significant {
        inv_sig[i] = 1.0 / sig[i];
    }
    Ok((u0, inv_sig))
}

/// Low-rank factorization of `(S S' + (N-1) C)^{-1}` for a positive
/// semi-definite error covariance `C`.
///
/// Returns `(X1, eig)` with `X1 * diag(eig) * X1' ~= (S S' + (N-1) C)^{-1}`
/// up to the SVD truncation: project `C` into the retained singular space of
/// `S`, eigendecompose, and fold the inverted spectrum back out.
pub fn lowrank_cinv<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    s: &ArrayBase<S1, Ix2>,
    c: &ArrayBase<S2, Ix2>,
    truncation: Truncation,
) -> Result<(Array2<f64>, Vec<f64>), IesError> {
    let nrens = s.ncols() as f64;
    let (u0, inv_sig) = svd_s(s, truncation)?;

    // B = (N-1) * Sigma^{-1} * U0' * C * U0 * Sigma^{-1}
    let mut b = fast_atb(&u0, &fast_ab(c, &u0));
    for ((i, j), value) in b.indexed_iter_mut() {
        *value *= (nrens - 1.0) * inv_sig[i] * inv_sig[j];
    }

    let (lambda, mut z) = b.eigh(Side::Lower)?;
    let eig: Vec<f64> = lambda.iter().map(|l| 1.0 / (1.0 + l)).collect();

    // X1 = U0 * Sigma^{-1} * Z
    for ((i, _), value) in z.indexed_iter_mut() {
        *value *= inv_sig[i];
    }
    let x1 = fast_ab(&u0, &z);
    Ok((x1, eig))
}

/// Low-rank factorization of `(S S' + E E')^{-1}` with the error term given
/// by its perturbation ensemble `E` instead of a covariance matrix.
///
/// Same contract as [`lowrank_cinv`], but O(N^2 m) instead of O(N m^2):
/// preferred when observations far outnumber realizations.
pub fn lowrank_e<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    s: &ArrayBase<S1, Ix2>,
    e: &ArrayBase<S2, Ix2>,
    truncation: Truncation,
) -> Result<(Array2<f64>, Vec<f64>), IesError> {
    let (u0, inv_sig) = svd_s(s, truncation)?;

    // X0 = Sigma^{-1} * U0' * E
    let mut x0 = fast_atb(&u0, e);
    for ((i, _), value) in x0.indexed_iter_mut() {
        *value *= inv_sig[i];
    }

    let (u1_opt, sig1, _) = x0.thin_svd(true, false)?;
    let mut u1 = match u1_opt {
        Some(u1) => u1,
        None => {
            return Err(IesError::Numerical(
                "SVD did not return left singular vectors".to_string(),
            ));
        }
    };

    let eig: Vec<f64> = sig1.iter().map(|l| 1.0 / (1.0 + l * l)).collect();

    // X1 = U0 * Sigma^{-1} * U1
    for ((i, _), value) in u1.indexed_iter_mut() {
        *value *= inv_sig[i];
    }
    let x1 = fast_ab(&u0, &u1);
    Ok((x1, eig))
}

/// `X3 = X1 * diag(eig) * X1' * H`, the application of a low-rank inverse to
/// the innovation matrix.
pub fn gen_x3<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    x1: &ArrayBase<S1, Ix2>,
    h: &ArrayBase<S2, Ix2>,
    eig: &[f64],
) -> Array2<f64> {
    let mut x2 = fast_atb(x1, h);
    for ((i, _), value) in x2.indexed_iter_mut() {
        *value *= eig[i];
    }
    fast_ab(x1, &x2)
}
