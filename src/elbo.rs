//! Monte-Carlo ELBO estimation for one Taylor approximation.

use crate::model::LogDensityModel;
use crate::taylor::{TaylorApproximation, approximate_samples};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

const LOG_TWO_PI: f64 = 1.837_877_066_409_345_3;

/// Draws, log densities, and the resulting ELBO for one approximation.
///
/// `lp_mat` column 0 holds `log q` (the approximation's density of the draw),
/// column 1 holds `log p` (the target); `lp_ratio = log p − log q`.
pub struct ElboEstimate {
    pub elbo: f64,
    /// Number of `log_prob` invocations made for this estimate.
    pub fn_calls: usize,
    /// Unconstrained draws, one column each (`D × K`).
    pub repeat_draws: Array2<f64>,
    pub lp_mat: Array2<f64>,
    pub lp_ratio: Array1<f64>,
}

impl Default for ElboEstimate {
    fn default() -> Self {
        Self {
            elbo: f64::NEG_INFINITY,
            fn_calls: 0,
            repeat_draws: Array2::zeros((0, 0)),
            lp_mat: Array2::zeros((0, 2)),
            lp_ratio: Array1::zeros(0),
        }
    }
}

/// Draw `num_samples` from the approximation and evaluate the target at each.
///
/// A failed or diverging `log_prob` contributes `−∞` for that draw; it never
/// aborts the estimate. The ELBO is the mean log ratio over all draws.
pub fn estimate_approx_draws<M: LogDensityModel>(
    model: &M,
    rng: &mut StdRng,
    approx: &TaylorApproximation,
    num_samples: usize,
    label: &str,
) -> ElboEstimate {
    let dims = approx.dims();
    let unit: Array2<f64> =
        Array2::from_shape_simple_fn((dims, num_samples), || rng.sample(StandardNormal));

    let mut lp_mat = Array2::<f64>::zeros((num_samples, 2));
    for k in 0..num_samples {
        let col = unit.column(k);
        let sq_norm = col.dot(&col);
        lp_mat[[k, 0]] = -approx.log_det_chol - 0.5 * (sq_norm + dims as f64 * LOG_TWO_PI);
    }

    let draws = approximate_samples(&unit, approx);
    let mut fn_calls = 0usize;
    for k in 0..num_samples {
        fn_calls += 1;
        lp_mat[[k, 1]] = match model.log_prob(draws.column(k)) {
            Ok(lp) => lp,
            Err(e) => {
                log::debug!("{label}log density evaluation failed for a draw: {e}");
                f64::NEG_INFINITY
            }
        };
    }

    let lp_ratio = &lp_mat.column(1) - &lp_mat.column(0);
    let elbo = lp_ratio.mean().unwrap_or(f64::NEG_INFINITY);
    ElboEstimate {
        elbo,
        fn_calls,
        repeat_draws: draws,
        lp_mat,
        lp_ratio,
    }
}
