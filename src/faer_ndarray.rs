use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::matmul::matmul;
use faer::linalg::solvers::{self, PartialPivLu, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Accum, Mat, MatRef, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Linear solve produced non-finite values (singular system)")]
    SingularSystem,
}

/// faer view of an ndarray matrix: borrowed when the layout permits, copied
/// into a compact faer matrix otherwise.
///
/// Everything this crate builds has positive strides (owned arrays and plain
/// transposes of them), so the copy arm only fires for exotic caller-supplied
/// views such as reversed slices, which faer kernels must not traverse
/// through raw strides.
enum FaerMat<'a> {
    Borrowed(MatRef<'a, f64>),
    Copied(Mat<f64>),
}

impl FaerMat<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerMat::Borrowed(mat) => *mat,
            FaerMat::Copied(mat) => mat.as_ref(),
        }
    }
}

fn to_faer<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> FaerMat<'_> {
    let (rows, cols) = array.dim();
    let row_stride = array.strides()[0];
    let col_stride = array.strides()[1];
    if row_stride > 0 && col_stride > 0 {
        // SAFETY: pointer, shape and strides describe a live ndarray borrow,
        // and positive strides keep the traversal inside that borrow.
        let mat = unsafe {
            MatRef::from_raw_parts(array.as_ptr(), rows, cols, row_stride, col_stride)
        };
        return FaerMat::Borrowed(mat);
    }
    let mut copied = Mat::<f64>::zeros(rows, cols);
    for j in 0..cols {
        for i in 0..rows {
            copied[(i, j)] = array[[i, j]];
        }
    }
    FaerMat::Copied(copied)
}

fn to_ndarray(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_ndarray(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let col = diag.column_vector().as_mat();
    Array1::from_shape_fn(col.nrows(), |i| col[(i, 0)])
}

/// The smoother mixes mask-sized products over a handful of realizations
/// with anomaly GEMMs over thousands of observations. Only the latter repay
/// faer's kernel setup; below a few thousand flops ndarray's plain loop wins.
#[inline]
fn large_product(m: usize, n: usize, k: usize) -> bool {
    m.saturating_mul(n).saturating_mul(k) > 8_192
}

/// `lhs * rhs` through faer, parallelized per the global faer setting (the
/// host driver owns that knob; the core itself stays single-threaded).
fn gemm(lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Array2<f64> {
    let mut product = Mat::<f64>::zeros(lhs.nrows(), rhs.ncols());
    matmul(
        product.as_mut(),
        Accum::Replace,
        lhs,
        rhs,
        1.0,
        get_global_parallelism(),
    );
    to_ndarray(product.as_ref())
}

/// `A * B`.
#[inline]
pub fn fast_ab<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (n, p) = a.dim();
    let q = b.ncols();
    debug_assert_eq!(p, b.nrows(), "inner dimensions must agree");
    if !large_product(n, q, p) {
        return a.dot(b);
    }
    let a_view = to_faer(a);
    let b_view = to_faer(b);
    gemm(a_view.as_ref(), b_view.as_ref())
}

/// `A' * B`.
#[inline]
pub fn fast_atb<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (k, p) = a.dim();
    let q = b.ncols();
    debug_assert_eq!(k, b.nrows(), "inner dimensions must agree");
    if !large_product(p, q, k) {
        return a.t().dot(b);
    }
    let a_view = to_faer(a);
    let b_view = to_faer(b);
    gemm(a_view.as_ref().transpose(), b_view.as_ref())
}

/// `A * B'`.
#[inline]
pub fn fast_abt<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (n, p) = a.dim();
    let q = b.nrows();
    debug_assert_eq!(p, b.ncols(), "inner dimensions must agree");
    if !large_product(n, q, p) {
        return a.dot(&b.t());
    }
    let a_view = to_faer(a);
    let b_view = to_faer(b);
    gemm(a_view.as_ref(), b_view.as_ref().transpose())
}

/// `A' * A`.
#[inline]
pub fn fast_ata<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let (k, p) = a.dim();
    if !large_product(p, p, k) {
        return a.t().dot(a);
    }
    let view = to_faer(a);
    gemm(view.as_ref().transpose(), view.as_ref())
}

pub trait FaerSvd {
    /// Thin SVD: `U` is rows x min, singular values non-increasing, `V^T` is
    /// min x cols. Vector outputs are `None` when not requested.
    fn thin_svd(
        &self,
        compute_u: bool,
        compute_vt: bool,
    ) -> Result<(Option<Array2<f64>>, Array1<f64>, Option<Array2<f64>>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn thin_svd(
        &self,
        compute_u: bool,
        compute_vt: bool,
    ) -> Result<(Option<Array2<f64>>, Array1<f64>, Option<Array2<f64>>), FaerLinalgError> {
        let view = to_faer(self);
        let mat = view.as_ref();
        let (rows, cols) = mat.shape();
        let size = rows.min(cols);

        let compute_u_flag = if compute_u {
            ComputeSvdVectors::Thin
        } else {
            ComputeSvdVectors::No
        };
        let compute_v_flag = if compute_vt {
            ComputeSvdVectors::Thin
        } else {
            ComputeSvdVectors::No
        };

        let mut singular = Diag::<f64>::zeros(size);
        let mut u_storage = compute_u.then(|| Mat::<f64>::zeros(rows, size));
        let mut v_storage = compute_vt.then(|| Mat::<f64>::zeros(cols, size));

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            compute_u_flag,
            compute_v_flag,
            par,
            Default::default(),
        ));
        let stack = MemStack::new(&mut mem);

        svd::svd(
            mat,
            singular.as_mut(),
            u_storage.as_mut().map(|u| u.as_mut()),
            v_storage.as_mut().map(|v| v.as_mut()),
            par,
            stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence)?;

        let singular_values = diag_to_ndarray(singular.as_ref());
        let u_opt = u_storage.map(|u| to_ndarray(u.as_ref()));
        // faer hands back V; callers want V^T.
        let vt_opt = v_storage.map(|v| {
            let v = v.as_ref();
            Array2::from_shape_fn((v.ncols(), v.nrows()), |(i, j)| v[(j, i)])
        });

        Ok((u_opt, singular_values, vt_opt))
    }
}

pub trait FaerEigh {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let view = to_faer(self);
        let eigen = view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_ndarray(eigen.S());
        let vectors = to_ndarray(eigen.U());
        Ok((values, vectors))
    }
}

/// Solve `A * X = B` for square `A` via dense LU with partial pivoting.
///
/// Partial-pivot LU always factorizes; singularity surfaces as non-finite
/// entries in the solution, which are rejected here.
pub fn lu_solve<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Result<Array2<f64>, FaerLinalgError> {
    let a_view = to_faer(a);
    let b_view = to_faer(b);
    let lu = PartialPivLu::new(a_view.as_ref());
    let solution = lu.solve(b_view.as_ref());
    let out = to_ndarray(solution.as_ref());
    if !out.iter().all(|v| v.is_finite()) {
        return Err(FaerLinalgError::SingularSystem);
    }
    Ok(out)
}
