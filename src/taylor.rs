//! Normal approximation of the target built from the L-BFGS inverse-Hessian
//! estimate at one iterate.
//!
//! The covariance is represented either by a dense `D×D` Cholesky factor or,
//! when the parameter dimension dominates the history, by a low-rank-plus-
//! diagonal factorization assembled from a thin QR of the scaled history.

use crate::faer_ndarray::{FaerCholesky, FaerLinalgError, FaerQr, fast_ab, fast_ata, fast_atb, fast_atv};
use faer::Side;
use ndarray::{Array1, Array2, s};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaylorError {
    #[error("covariance factorization failed: {0}")]
    Factorization(#[from] FaerLinalgError),
}

/// Covariance representation of the approximation.
pub enum ApproxForm {
    /// Dense factor over the whole parameter space.
    Full,
    /// Low-rank-plus-diagonal with the orthonormal range basis `q` (`D×m`).
    Sparse { q: Array2<f64> },
}

/// Multivariate normal `N(x_center, H)` with `H` the quasi-Newton
/// inverse-Hessian estimate at one optimization iterate.
pub struct TaylorApproximation {
    pub x_center: Array1<f64>,
    /// `log |L|` of the Cholesky-like factor; half the covariance log-det.
    pub log_det_chol: f64,
    /// Upper-triangular factor: `D×D` (full) or `m×m` (sparse).
    pub l_approx: Array2<f64>,
    /// Diagonal inverse-Hessian scaling the factorization was built around.
    pub alpha: Array1<f64>,
    pub form: ApproxForm,
}

impl TaylorApproximation {
    pub fn is_full(&self) -> bool {
        matches!(self.form, ApproxForm::Full)
    }

    pub fn dims(&self) -> usize {
        self.x_center.len()
    }
}

/// Back substitution solving `R X = B` in place for upper-triangular `R`.
fn solve_upper_triangular_in_place(r: &Array2<f64>, rhs: &mut Array2<f64>) {
    let m = r.nrows();
    debug_assert_eq!(r.ncols(), m);
    debug_assert_eq!(rhs.nrows(), m);
    for col in 0..rhs.ncols() {
        for i in (0..m).rev() {
            let mut v = rhs[[i, col]];
            for j in i + 1..m {
                v -= r[[i, j]] * rhs[[j, col]];
            }
            let d = r[[i, i]];
            rhs[[i, col]] = if d.abs() > 1e-14 { v / d } else { 0.0 };
        }
    }
}

/// Build the approximation at `point` from the assembled history.
///
/// `y_mat` and `s_mat` are `D×m` with one column per retained `(Δg, Δx)`
/// pair, oldest first; `grad` is the gradient of the minimized objective at
/// `point`. `s_mat` is consumed: its transpose buffer is overwritten by the
/// in-place triangular solve that produces `-R⁻¹Sᵀ`.
pub fn taylor_approximation(
    y_mat: &Array2<f64>,
    s_mat: Array2<f64>,
    alpha: &Array1<f64>,
    point: &Array1<f64>,
    grad: &Array1<f64>,
) -> Result<TaylorApproximation, TaylorError> {
    let dims = y_mat.nrows();
    let m = y_mat.ncols();

    // R = upper triangle of SᵀY (diagonal included); Dk = diag(R).
    let st_y = fast_atb(&s_mat, y_mat);
    let mut rk = Array2::<f64>::zeros((m, m));
    for i in 0..m {
        for j in i..m {
            rk[[i, j]] = st_y[[i, j]];
        }
    }
    let dk = rk.diag().to_owned();

    // Solve R X = Sᵀ in place on the transpose buffer, then negate.
    let mut ninv_rst = s_mat.reversed_axes();
    solve_upper_triangular_in_place(&rk, &mut ninv_rst);
    ninv_rst.mapv_inplace(|v| -v);

    // When twice the history covers the parameter dimension the dense form is
    // affordable; otherwise the low-rank representation wins.
    if 2 * m >= dims {
        taylor_full(y_mat, alpha, &dk, &ninv_rst, point, grad)
    } else {
        taylor_sparse(y_mat, alpha, &dk, &ninv_rst, point, grad)
    }
}

/// `T = (diag(√α)Y)ᵀ(diag(√α)Y) + diag(Dk)`, shared by both forms.
fn history_gram(
    y_mat: &Array2<f64>,
    sqrt_alpha: &Array1<f64>,
    dk: &Array1<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let (dims, m) = y_mat.dim();
    let mut w = y_mat.to_owned();
    for j in 0..m {
        for i in 0..dims {
            w[[i, j]] *= sqrt_alpha[i];
        }
    }
    let mut t_mat = fast_ata(&w);
    for i in 0..m {
        t_mat[[i, i]] += dk[i];
    }
    (w, t_mat)
}

fn taylor_full(
    y_mat: &Array2<f64>,
    alpha: &Array1<f64>,
    dk: &Array1<f64>,
    ninv_rst: &Array2<f64>,
    point: &Array1<f64>,
    grad: &Array1<f64>,
) -> Result<TaylorApproximation, TaylorError> {
    let dims = y_mat.nrows();
    let m = y_mat.ncols();
    let sqrt_alpha = alpha.mapv(f64::sqrt);
    let (_, t_mat) = history_gram(y_mat, &sqrt_alpha, dk);

    // M = Yᵀ diag(α), stored m×D.
    let mut y_alpha_t = y_mat.t().to_owned();
    for i in 0..m {
        for j in 0..dims {
            y_alpha_t[[i, j]] *= alpha[j];
        }
    }

    // H = Mᵀ·N + Nᵀ·(M + T·N) + diag(α) with N = -R⁻¹Sᵀ.
    let inner = &y_alpha_t + &fast_ab(&t_mat, ninv_rst);
    let mut h = fast_atb(&y_alpha_t, ninv_rst) + fast_atb(ninv_rst, &inner);
    for i in 0..dims {
        h[[i, i]] += alpha[i];
    }

    let chol = h.cholesky(Side::Lower)?;
    let log_det_chol = chol.diag().iter().map(|v| v.abs().ln()).sum::<f64>();
    let l_approx = chol.lower_triangular().reversed_axes();
    let x_center = point - &fast_atv(&h, grad);

    Ok(TaylorApproximation {
        x_center,
        log_det_chol,
        l_approx,
        alpha: alpha.clone(),
        form: ApproxForm::Full,
    })
}

fn taylor_sparse(
    y_mat: &Array2<f64>,
    alpha: &Array1<f64>,
    dk: &Array1<f64>,
    ninv_rst: &Array2<f64>,
    point: &Array1<f64>,
    grad: &Array1<f64>,
) -> Result<TaylorApproximation, TaylorError> {
    let dims = y_mat.nrows();
    let m = y_mat.ncols();
    let two_m = 2 * m;
    let sqrt_alpha = alpha.mapv(f64::sqrt);
    let (w, t_mat) = history_gram(y_mat, &sqrt_alpha, dk);

    // Scaled low-rank factor: columns [diag(√α)Y | diag(1/√α)·Nᵀ].
    let mut wkbar = Array2::<f64>::zeros((dims, two_m));
    for j in 0..m {
        for i in 0..dims {
            wkbar[[i, j]] = w[[i, j]];
            wkbar[[i, m + j]] = ninv_rst[[j, i]] / sqrt_alpha[i];
        }
    }

    // Block matrix [[0, I], [I, T]].
    let mut mkbar = Array2::<f64>::zeros((two_m, two_m));
    for i in 0..m {
        mkbar[[i, m + i]] = 1.0;
        mkbar[[m + i, i]] = 1.0;
        for j in 0..m {
            mkbar[[m + i, m + j]] = t_mat[[i, j]];
        }
    }

    let (q_all, r_all) = wkbar.qr();
    let rank = dims.min(two_m);
    let q = q_all.slice(s![.., ..rank]).to_owned();
    let r = r_all.slice(s![..rank, ..]).to_owned();

    let rm = fast_ab(&r, &mkbar);
    let mut inner = fast_ab(&rm, &r.t());
    for i in 0..rank {
        inner[[i, i]] += 1.0;
    }

    let chol = inner.cholesky(Side::Lower)?;
    let log_det_chol = chol.diag().iter().map(|v| v.abs().ln()).sum::<f64>()
        + 0.5 * alpha.iter().map(|v| v.ln()).sum::<f64>();
    let l_approx = chol.lower_triangular().reversed_axes();

    // x_center = point − H·grad with H applied in factored form.
    let v = ninv_rst.dot(grad);
    let ag = alpha * grad;
    let y_v = y_mat.dot(&v);
    let small = fast_atv(y_mat, &ag) + t_mat.dot(&v);
    let back = fast_atv(ninv_rst, &small);
    let mut x_center = point.clone();
    for i in 0..dims {
        x_center[i] -= ag[i] + alpha[i] * y_v[i] + back[i];
    }

    Ok(TaylorApproximation {
        x_center,
        log_det_chol,
        l_approx,
        alpha: alpha.clone(),
        form: ApproxForm::Sparse { q },
    })
}

/// Push a matrix of standard-normal columns through the approximation; each
/// output column is one unconstrained draw.
pub fn approximate_samples(u: &Array2<f64>, approx: &TaylorApproximation) -> Array2<f64> {
    let dims = approx.dims();
    debug_assert_eq!(u.nrows(), dims);
    let mut draws = match &approx.form {
        ApproxForm::Full => fast_atb(&approx.l_approx, u),
        ApproxForm::Sparse { q } => {
            let u1 = fast_atb(q, u);
            let mut l_minus_i = approx.l_approx.clone();
            for i in 0..l_minus_i.nrows() {
                l_minus_i[[i, i]] -= 1.0;
            }
            let lifted = fast_ab(q, &fast_ab(&l_minus_i, &u1));
            let mut out = Array2::<f64>::zeros(u.dim());
            for k in 0..u.ncols() {
                for i in 0..dims {
                    out[[i, k]] = approx.alpha[i].sqrt() * (lifted[[i, k]] + u[[i, k]]);
                }
            }
            out
        }
    };
    for k in 0..draws.ncols() {
        for i in 0..dims {
            draws[[i, k]] += approx.x_center[i];
        }
    }
    draws
}
