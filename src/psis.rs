//! Pareto-smoothed importance sampling weights.
//!
//! The upper tail of the importance ratios is replaced by quantiles of a
//! Generalized Pareto distribution fitted with the Zhang & Stephens (2009)
//! estimator, stabilizing the weight distribution when the proposal is a poor
//! match for the target.

use ndarray::Array1;

/// Normalized importance weights plus the fitted Pareto shape, when a tail
/// fit was performed.
pub struct PsisResult {
    pub weights: Array1<f64>,
    /// Shape estimate `k̂` of the fitted Generalized Pareto; `None` when the
    /// tail was too short or too degenerate to fit.
    pub pareto_k: Option<f64>,
}

fn log_sum_exp(values: &Array1<f64>) -> f64 {
    let max = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|&v| (v - max).exp()).sum::<f64>().ln()
}

/// Indices of the `n` largest entries, in ascending value order.
///
/// Quick-select partitions the candidates, then only the selected slice is
/// sorted.
fn largest_with_indices(values: &Array1<f64>, n: usize) -> Vec<usize> {
    let len = values.len();
    let mut order: Vec<usize> = (0..len).collect();
    if n < len {
        order.select_nth_unstable_by(len - n, |&a, &b| values[a].total_cmp(&values[b]));
        order.drain(..len - n);
    }
    order.sort_unstable_by(|&a, &b| values[a].total_cmp(&values[b]));
    order
}

/// Inverse CDF of the Generalized Pareto distribution with location 0.
fn gpd_quantile(p: f64, k: f64, sigma: f64) -> f64 {
    sigma * (-k * (-p).ln_1p()).exp_m1() / k
}

/// Zhang & Stephens (2009) estimate of `(σ, k)` for a Generalized Pareto
/// distribution with location 0, with the weakly informative `k ~ N(0.5)`
/// shrinkage prior.
///
/// `x` must be sorted ascending. The grid has `min_grid_pts + ⌊√N⌋` points.
pub fn gpdfit(x: &Array1<f64>, min_grid_pts: usize) -> (f64, f64) {
    let n = x.len();
    debug_assert!(n >= 2, "gpdfit needs at least two samples");
    const PRIOR: f64 = 3.0;
    let m = min_grid_pts + (n as f64).sqrt().floor() as usize;
    // First-quartile order statistic.
    let x_star = x[(n as f64 / 4.0 + 0.5).floor() as usize - 1];
    let x_max = x[n - 1];

    let n_f = n as f64;
    let m_f = m as f64;
    let mut l_theta = Array1::<f64>::zeros(m);
    let mut theta = Array1::<f64>::zeros(m);
    for j in 1..=m {
        let t = 1.0 / x_max + (1.0 - (m_f / (j as f64 - 0.5)).sqrt()) / (PRIOR * x_star);
        // Profile log-likelihood of theta over the sample.
        let k_of_t = x.iter().map(|&v| (-t * v).ln_1p()).sum::<f64>() / n_f;
        theta[j - 1] = t;
        l_theta[j - 1] = n_f * ((-t / k_of_t).ln() - k_of_t - 1.0);
    }

    let lse = log_sum_exp(&l_theta);
    let mut theta_hat = 0.0;
    for j in 0..m {
        theta_hat += (l_theta[j] - lse).exp() * theta[j];
    }

    let k = x.iter().map(|&v| (-theta_hat * v).ln_1p()).sum::<f64>() / n_f;
    let sigma = -k / theta_hat;
    // Bayesian shrinkage of the shape toward 0.5.
    const A: f64 = 10.0;
    let k = k * n_f / (n_f + A) + A * 0.5 / (n_f + A);
    (sigma, k)
}

/// Compute PSIS weights for a vector of log importance ratios.
///
/// With `tail_len >= 5` the largest ratios are replaced by fitted Generalized
/// Pareto quantiles before normalization; shorter tails get a plain
/// normalized softmax. Weights are truncated at the pre-normalization maximum
/// and normalized with log-sum-exp.
pub fn psis_weights(log_ratios: &Array1<f64>, tail_len: usize) -> PsisResult {
    let size = log_ratios.len();
    if size == 0 {
        return PsisResult {
            weights: Array1::zeros(0),
            pareto_k: None,
        };
    }
    // Shift for safe exponentiation.
    let max_log_ratio = log_ratios.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let mut lw = log_ratios.mapv(|v| v - max_log_ratio);
    let mut pareto_k = None;

    if tail_len >= 5 && tail_len < size {
        // The `tail_len` largest entries plus the cutoff just below them.
        let order = largest_with_indices(&lw, tail_len + 1);
        let cutoff = lw[order[0]];
        let tail_idx = &order[1..];
        let tail_min = lw[tail_idx[0]];
        let tail_max = lw[tail_idx[tail_len - 1]];
        if tail_max - tail_min <= f64::MIN_POSITIVE * 10.0 {
            log::warn!("PSIS tail is effectively constant; skipping tail smoothing");
        } else {
            let exp_cutoff = cutoff.exp();
            let excess =
                Array1::from_iter(tail_idx.iter().map(|&i| lw[i].exp() - exp_cutoff));
            let (sigma, k) = gpdfit(&excess, 30);
            pareto_k = Some(k);
            if k.is_finite() {
                for (pos, &i) in tail_idx.iter().enumerate() {
                    let p = (pos as f64 + 0.5) / tail_len as f64;
                    lw[i] = (gpd_quantile(p, k, sigma) + exp_cutoff).ln();
                }
            }
        }
    }

    // Truncate at the raw maximum (0 after the shift), then normalize.
    lw.mapv_inplace(|v| if v > 0.0 { 0.0 } else { v });
    let adjusted = lw.mapv(|v| v + max_log_ratio);
    let lse = log_sum_exp(&adjusted);
    PsisResult {
        weights: adjusted.mapv(|v| (v - lse).exp()),
        pareto_k,
    }
}
