//! Single-path Pathfinder orchestration.
//!
//! One call traces an L-BFGS path from a (possibly random) initialization,
//! builds a normal approximation at every successful iterate, keeps the one
//! with the best Monte-Carlo ELBO, and returns draws from it together with
//! the log importance ratios.

use crate::elbo::{ElboEstimate, estimate_approx_draws};
use crate::history::{HistoryWindow, check_curvature, update_diagonal_scaling};
use crate::lbfgs::{Lbfgs, LbfgsConfig};
use crate::model::{LogDensityModel, ModelError};
use crate::taylor::{TaylorApproximation, taylor_approximation};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Random initializations attempted before giving up on the path.
const INIT_RETRIES: usize = 100;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("pathfinder was interrupted")]
    Interrupted,
}

/// Service-level return code, sysexits-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnCode {
    Ok,
    Software,
}

impl ReturnCode {
    pub fn code(self) -> i32 {
        match self {
            ReturnCode::Ok => 0,
            ReturnCode::Software => 70,
        }
    }
}

/// Tuning knobs for one path. Defaults match the reference service
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathfinderConfig {
    /// Uniform `(-r, r)` range for random initialization of parameters.
    pub init_radius: f64,
    /// L-BFGS memory.
    pub history_size: usize,
    /// Initial line-search step size.
    pub init_alpha: f64,
    pub tol_obj: f64,
    pub tol_rel_obj: f64,
    pub tol_grad: f64,
    pub tol_rel_grad: f64,
    pub tol_param: f64,
    /// Maximum number of L-BFGS iterations.
    pub num_iterations: usize,
    /// Stream every iterate and gradient to the diagnostic sink.
    pub save_iterations: bool,
    /// Iteration logging cadence; 0 disables iteration logging.
    pub refresh: usize,
    /// Monte-Carlo sample count for each per-iterate ELBO estimate.
    pub num_elbo_draws: usize,
    /// Total number of approximate posterior draws to return.
    pub num_draws: usize,
}

impl Default for PathfinderConfig {
    fn default() -> Self {
        Self {
            init_radius: 2.0,
            history_size: 5,
            init_alpha: 0.001,
            tol_obj: 1e-12,
            tol_rel_obj: 1e4,
            tol_grad: 1e-8,
            tol_rel_grad: 1e7,
            tol_param: 1e-8,
            num_iterations: 1000,
            save_iterations: false,
            refresh: 100,
            num_elbo_draws: 25,
            num_draws: 1000,
        }
    }
}

/// Everything a caller (or the multi-path driver) needs from one path.
pub struct PathResult {
    pub return_code: ReturnCode,
    /// `log p − log q` per returned draw, aligned with `draws` columns.
    pub lp_ratio: Array1<f64>,
    /// Constrained draws, one column each; rows follow the emitted names
    /// (constrained parameters, then `lp_approx__` and `lp__`).
    pub draws: Array2<f64>,
    /// Total number of log-density evaluations spent on this path.
    pub fn_calls: usize,
}

/// Output surface for one path. All methods default to no-ops so callers only
/// implement the records they care about.
pub trait PathSink {
    fn column_names(&mut self, _names: &[String]) {}
    fn draw_block(&mut self, _block: ArrayView2<'_, f64>) {}
    /// Per-iterate `(point, ∇ log p)` record, emitted when `save_iterations`.
    fn diagnostic(&mut self, _point: ArrayView1<'_, f64>, _grad: ArrayView1<'_, f64>) {}
    fn message(&mut self, _text: &str) {}
    fn blank(&mut self) {}
}

/// Sink that drops every record.
pub struct NullSink;

impl PathSink for NullSink {}

/// Cooperative cancellation, checked once per optimizer iteration.
pub trait Interrupt {
    fn stop_requested(&mut self) -> bool;
}

/// Interrupt source that never fires.
pub struct NeverInterrupt;

impl Interrupt for NeverInterrupt {
    fn stop_requested(&mut self) -> bool {
        false
    }
}

/// Dedicated RNG stream per `(seed, path id)` pair.
fn path_rng(random_seed: u64, path_id: u64) -> StdRng {
    StdRng::seed_from_u64(
        random_seed ^ 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(path_id.wrapping_add(1)),
    )
}

fn empty_result(return_code: ReturnCode, fn_calls: usize) -> PathResult {
    PathResult {
        return_code,
        lp_ratio: Array1::zeros(0),
        draws: Array2::zeros((0, 0)),
        fn_calls,
    }
}

/// Find a starting point with finite log density and gradient. User-supplied
/// values are verified but never redrawn; random initialization retries up to
/// the budget.
fn initialize_params<M: LogDensityModel>(
    model: &M,
    init: Option<&Array1<f64>>,
    radius: f64,
    rng: &mut StdRng,
    fn_calls: &mut usize,
) -> Option<(Array1<f64>, f64, Array1<f64>)> {
    let dims = model.dims();
    let mut grad = Array1::<f64>::zeros(dims);
    if let Some(x0) = init {
        *fn_calls += 1;
        return match model.log_prob_grad(x0.view(), &mut grad) {
            Ok(lp) if lp.is_finite() && grad.iter().all(|v| v.is_finite()) => {
                Some((x0.clone(), lp, grad))
            }
            _ => None,
        };
    }
    for _ in 0..INIT_RETRIES {
        let x0 = Array1::from_shape_fn(dims, |_| rng.random_range(-radius..=radius));
        *fn_calls += 1;
        match model.log_prob_grad(x0.view(), &mut grad) {
            Ok(lp) if lp.is_finite() && grad.iter().all(|v| v.is_finite()) => {
                return Some((x0, lp, grad));
            }
            _ => continue,
        }
    }
    None
}

/// Constrain a block of unconstrained draws into `out` starting at
/// `col_offset`, appending the `(log q, log p)` pair per draw.
fn constrain_into<M: LogDensityModel>(
    model: &M,
    rng: &mut StdRng,
    draws: &Array2<f64>,
    lp_mat: &Array2<f64>,
    out: &mut Array2<f64>,
    col_offset: usize,
) -> Result<(), ModelError> {
    let n_rows = out.nrows();
    let n_constrained = n_rows - 2;
    for j in 0..draws.ncols() {
        let constrained = model.write_array(rng, draws.column(j))?;
        debug_assert_eq!(constrained.len(), n_constrained);
        for i in 0..n_constrained {
            out[[i, col_offset + j]] = constrained[i];
        }
        out[[n_rows - 2, col_offset + j]] = lp_mat[[j, 0]];
        out[[n_rows - 1, col_offset + j]] = lp_mat[[j, 1]];
    }
    Ok(())
}

/// Run single-path Pathfinder against `model`.
///
/// Returns `Err` only on cooperative interruption; every numerical failure
/// mode is folded into the `ReturnCode` of the result. A path that never
/// produced a usable iterate reports `ReturnCode::Software` with empty draws.
pub fn pathfinder_single<M: LogDensityModel>(
    model: &M,
    init: Option<&Array1<f64>>,
    random_seed: u64,
    path_id: u64,
    config: &PathfinderConfig,
    interrupt: &mut dyn Interrupt,
    sink: &mut dyn PathSink,
) -> Result<PathResult, PathError> {
    let start = Instant::now();
    let path_tag = format!("Path: [{path_id}] ");
    let mut rng = path_rng(random_seed, path_id);
    let mut fn_calls = 0usize;
    let dims = model.dims();

    let Some((x0, lp0, grad0)) =
        initialize_params(model, init, config.init_radius, &mut rng, &mut fn_calls)
    else {
        log::warn!(
            "{path_tag}initialization failed: log density or gradient not finite after {INIT_RETRIES} attempts"
        );
        return Ok(empty_result(ReturnCode::Software, fn_calls));
    };

    let mut names = model.constrained_param_names();
    names.push("lp_approx__".to_string());
    names.push("lp__".to_string());
    sink.column_names(&names);

    let lbfgs_cfg = LbfgsConfig {
        history_size: config.history_size,
        init_alpha: config.init_alpha,
        tol_obj: config.tol_obj,
        tol_rel_obj: config.tol_rel_obj,
        tol_grad: config.tol_grad,
        tol_rel_grad: config.tol_rel_grad,
        tol_param: config.tol_param,
        max_iters: config.num_iterations,
    };
    // The driver is seeded from the accepted initialization evaluation, so
    // `fn_calls` and the driver's own counter never overlap.
    let mut lbfgs = Lbfgs::from_evaluated(model, x0.clone(), lp0, &grad0, lbfgs_cfg);
    if config.refresh != 0 {
        log::info!("{path_tag}Initial log joint density = {:.6}", lbfgs.logp());
    }
    if config.save_iterations {
        sink.diagnostic(x0.view(), grad0.view());
    }

    let mut window = HistoryWindow::new(config.history_size);
    let mut alpha = Array1::<f64>::ones(dims);
    let mut prev_x = x0;
    // Objective-space gradient (-∇ log p), matching the driver's convention.
    let mut prev_g = grad0.mapv(|v| -v);
    let mut best_elbo = ElboEstimate::default();
    let mut best_approx: Option<TaylorApproximation> = None;
    let mut best_iter: Option<usize> = None;

    loop {
        if interrupt.stop_requested() {
            return Err(PathError::Interrupted);
        }
        let step = lbfgs.step();
        if config.refresh > 0
            && (step.termination.is_some()
                || !lbfgs.note().is_empty()
                || lbfgs.iter_num() == 0
                || (lbfgs.iter_num() + 1) % config.refresh == 0)
        {
            log::info!(
                "{path_tag}    Iter      log prob        ||dx||      ||grad||       alpha      alpha0  # evals  Notes "
            );
            log::info!(
                "{path_tag} {:>7}  {:>12.6}  {:>12.6}  {:>12.6}  {:>10.4}  {:>10.4}  {:>7}  {}",
                lbfgs.iter_num(),
                lbfgs.logp(),
                lbfgs.prev_step_norm(),
                lbfgs.grad_norm(),
                lbfgs.step_size(),
                lbfgs.initial_step_size(),
                lbfgs.grad_evals(),
                lbfgs.note()
            );
        }

        if step.advanced {
            let dx = lbfgs.curr_x() - &prev_x;
            let dg = lbfgs.curr_g() - &prev_g;
            prev_x.assign(lbfgs.curr_x());
            prev_g.assign(lbfgs.curr_g());
            if check_curvature(&dg, &dx) {
                alpha = update_diagonal_scaling(&alpha, &dg, &dx);
            }
            window.push(dx, dg);
            let (s_mat, y_mat) = window.assemble();
            let iter_tag = format!("{path_tag}Iter: [{}] ", lbfgs.iter_num());
            match taylor_approximation(&y_mat, s_mat, &alpha, lbfgs.curr_x(), lbfgs.curr_g()) {
                Ok(approx) => {
                    let est = estimate_approx_draws(
                        model,
                        &mut rng,
                        &approx,
                        config.num_elbo_draws,
                        &iter_tag,
                    );
                    fn_calls += est.fn_calls;
                    let elbo = est.elbo;
                    if elbo > best_elbo.elbo {
                        best_elbo = est;
                        best_approx = Some(approx);
                        best_iter = Some(lbfgs.iter_num());
                    }
                    if config.refresh > 0
                        && (lbfgs.iter_num() == 0 || lbfgs.iter_num() % config.refresh == 0)
                    {
                        log::info!("{iter_tag}ELBO ({elbo:.6})");
                    }
                }
                Err(e) => {
                    log::warn!("{iter_tag}ELBO estimation failed with error: {e}");
                }
            }
        }

        if config.save_iterations {
            let grad_lp = lbfgs.curr_g().mapv(|v| -v);
            sink.diagnostic(lbfgs.curr_x().view(), grad_lp.view());
        }

        if let Some(reason) = step.termination {
            if reason.is_failure() {
                log::info!("{path_tag}Optimization terminated with error: {reason}");
            } else {
                log::info!("{path_tag}Optimization terminated normally: {reason}");
            }
            break;
        }
    }

    let mut total_evals = fn_calls + lbfgs.grad_evals();
    let Some(best_approx) = best_approx else {
        log::warn!("{path_tag}Failure: none of the L-BFGS iterations completed successfully");
        return Ok(empty_result(ReturnCode::Software, total_evals));
    };
    if config.refresh != 0 {
        if let Some(iter) = best_iter {
            log::info!(
                "{path_tag}Best Iter: [{iter}] ELBO ({:.6}) evaluations: ({total_evals})",
                best_elbo.elbo
            );
        }
    }

    // Top up to the requested draw count from the winning approximation, then
    // constrain everything. ELBO-phase draws always come first.
    let elbo_cols = best_elbo.repeat_draws.ncols();
    let remaining = config.num_draws.saturating_sub(best_elbo.lp_ratio.len());
    let mut constrained = Array2::<f64>::zeros((names.len(), elbo_cols + remaining));
    let mut lp_ratio =
        Array1::<f64>::zeros(best_elbo.lp_ratio.len() + remaining);
    lp_ratio
        .slice_mut(ndarray::s![..best_elbo.lp_ratio.len()])
        .assign(&best_elbo.lp_ratio);

    let mut topped_up = false;
    if remaining > 0 {
        let est = estimate_approx_draws(model, &mut rng, &best_approx, remaining, &path_tag);
        total_evals += est.fn_calls;
        match constrain_into(
            model,
            &mut rng,
            &est.repeat_draws,
            &est.lp_mat,
            &mut constrained,
            elbo_cols,
        ) {
            Ok(()) => {
                lp_ratio
                    .slice_mut(ndarray::s![best_elbo.lp_ratio.len()..])
                    .assign(&est.lp_ratio);
                topped_up = true;
            }
            Err(e) => {
                log::warn!("{path_tag}Final sampling approximation failed with error: {e}");
                log::warn!(
                    "{path_tag}Returning the approximate samples used for ELBO calculation"
                );
            }
        }
    }
    if !topped_up {
        // Either nothing was left to draw or the top-up failed; keep only the
        // ELBO-phase draws.
        constrained = Array2::<f64>::zeros((names.len(), elbo_cols));
        lp_ratio = best_elbo.lp_ratio.clone();
    }
    if let Err(e) = constrain_into(
        model,
        &mut rng,
        &best_elbo.repeat_draws,
        &best_elbo.lp_mat,
        &mut constrained,
        0,
    ) {
        log::warn!("{path_tag}constraining the ELBO-phase draws failed: {e}");
        return Ok(empty_result(ReturnCode::Software, total_evals));
    }

    sink.draw_block(constrained.view());
    sink.blank();
    let elapsed = start.elapsed().as_secs_f64();
    sink.message(&format!("Elapsed Time: {elapsed:.3} seconds (Pathfinder)"));
    sink.blank();

    Ok(PathResult {
        return_code: ReturnCode::Ok,
        lp_ratio,
        draws: constrained,
        fn_calls: total_evals,
    })
}
