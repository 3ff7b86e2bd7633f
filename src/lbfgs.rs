//! Stepwise L-BFGS driver.
//!
//! Unlike a run-to-completion optimizer, the driver exposes one quasi-Newton
//! step at a time so the caller can inspect the iterate, gradient, and step
//! metadata between steps. Internally it maintains a bounded history of
//! curvature pairs for the two-loop recursion and a strong-Wolfe line search
//! with a single Hessian-reset retry when the search stalls.

use crate::model::LogDensityModel;
use ndarray::Array1;
use std::collections::VecDeque;
use std::fmt;

/// Sufficient-decrease constant for the Wolfe conditions.
const WOLFE_C1: f64 = 1e-4;
/// Curvature constant for the strong Wolfe conditions.
const WOLFE_C2: f64 = 0.9;
/// Smallest step the line search will consider before giving up.
const MIN_STEP: f64 = 1e-12;
const MAX_EXPANSIONS: usize = 50;
const MAX_ZOOM_STEPS: usize = 64;

/// Line-search and convergence options for the driver.
///
/// The relative tolerances are expressed in units of machine epsilon, so the
/// effective thresholds are `tol_rel_obj * EPS` and `tol_rel_grad * EPS`.
#[derive(Debug, Clone)]
pub struct LbfgsConfig {
    /// Number of curvature pairs retained for the two-loop recursion.
    pub history_size: usize,
    /// Initial step size tried on the first iteration (and after a reset).
    pub init_alpha: f64,
    /// Absolute tolerance on the change in objective value.
    pub tol_obj: f64,
    /// Relative tolerance on the change in objective value, in EPS units.
    pub tol_rel_obj: f64,
    /// Absolute tolerance on the gradient norm.
    pub tol_grad: f64,
    /// Relative tolerance on the gradient magnitude, in EPS units.
    pub tol_rel_grad: f64,
    /// Absolute tolerance on the step norm.
    pub tol_param: f64,
    /// Iteration budget.
    pub max_iters: usize,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            history_size: 5,
            init_alpha: 0.001,
            tol_obj: 1e-12,
            tol_rel_obj: 1e4,
            tol_grad: 1e-8,
            tol_rel_grad: 1e7,
            tol_param: 1e-8,
            max_iters: 1000,
        }
    }
}

/// Why the driver stopped stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    AbsObj,
    RelObj,
    AbsGrad,
    RelGrad,
    AbsParam,
    MaxIterations,
    LineSearchFailed,
}

impl TerminationReason {
    /// Failures leave the current iterate equal to the previous one.
    pub fn is_failure(self) -> bool {
        matches!(self, TerminationReason::LineSearchFailed)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TerminationReason::AbsObj => {
                "Convergence detected: absolute change in objective function was below tolerance"
            }
            TerminationReason::RelObj => {
                "Convergence detected: relative change in objective function was below tolerance"
            }
            TerminationReason::AbsGrad => {
                "Convergence detected: gradient norm is below tolerance"
            }
            TerminationReason::RelGrad => {
                "Convergence detected: relative gradient magnitude is below tolerance"
            }
            TerminationReason::AbsParam => {
                "Convergence detected: absolute parameter change was below tolerance"
            }
            TerminationReason::MaxIterations => {
                "Maximum number of iterations hit, may not be at an optima"
            }
            TerminationReason::LineSearchFailed => {
                "Line search failed to achieve a sufficient decrease, no more progress can be made"
            }
        };
        f.write_str(msg)
    }
}

/// Outcome of one `step()` call.
///
/// `advanced` reports whether a new iterate was produced; a step can both
/// advance and terminate (a convergence criterion fired on the fresh iterate).
/// Line-search failure and an already-spent iteration budget never advance.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub advanced: bool,
    pub termination: Option<TerminationReason>,
}

struct CurvaturePair {
    s: Array1<f64>,
    y: Array1<f64>,
    rho: f64,
}

/// L-BFGS minimizer of `-log_prob` with stepwise control.
pub struct Lbfgs<'a, M: LogDensityModel> {
    model: &'a M,
    opts: LbfgsConfig,
    /// Current iterate.
    x: Array1<f64>,
    /// Gradient of the objective (`-∇ log p`) at `x`.
    g: Array1<f64>,
    /// Objective value (`-log p`) at `x`.
    f: f64,
    pairs: VecDeque<CurvaturePair>,
    gamma: f64,
    iter: usize,
    fn_evals: usize,
    note: String,
    step_size: f64,
    initial_step: f64,
    prev_step_norm: f64,
    trial_x: Array1<f64>,
    trial_g: Array1<f64>,
    trial_f: f64,
    grad_lp: Array1<f64>,
}

impl<'a, M: LogDensityModel> Lbfgs<'a, M> {
    /// Start the driver at `x0`. Fails if the objective or gradient is not
    /// finite there.
    pub fn new(model: &'a M, x0: Array1<f64>, opts: LbfgsConfig) -> Result<Self, String> {
        let dims = model.dims();
        let mut grad_lp = Array1::<f64>::zeros(dims);
        let lp = model
            .log_prob_grad(x0.view(), &mut grad_lp)
            .map_err(|e| e.to_string())?;
        if !lp.is_finite() || !grad_lp.iter().all(|v| v.is_finite()) {
            return Err("objective or gradient not finite at the initial point".to_string());
        }
        let mut driver = Self::from_evaluated(model, x0, lp, &grad_lp, opts);
        driver.fn_evals = 1;
        Ok(driver)
    }

    /// Start the driver at a point whose log density and gradient are already
    /// known. No model evaluation is performed, and `grad_evals` starts at
    /// zero; the caller accounts for the seeding evaluation.
    pub fn from_evaluated(
        model: &'a M,
        x0: Array1<f64>,
        logp: f64,
        grad_lp: &Array1<f64>,
        opts: LbfgsConfig,
    ) -> Self {
        let dims = x0.len();
        Self {
            model,
            opts,
            g: grad_lp.mapv(|v| -v),
            f: -logp,
            x: x0,
            pairs: VecDeque::new(),
            gamma: 1.0,
            iter: 0,
            fn_evals: 0,
            note: String::new(),
            step_size: 0.0,
            initial_step: 0.0,
            prev_step_norm: 0.0,
            trial_x: Array1::zeros(dims),
            trial_g: Array1::zeros(dims),
            trial_f: f64::INFINITY,
            grad_lp: grad_lp.clone(),
        }
    }

    /// Log density at the current iterate.
    pub fn logp(&self) -> f64 {
        -self.f
    }

    pub fn curr_x(&self) -> &Array1<f64> {
        &self.x
    }

    /// Gradient of the minimized objective (`-∇ log p`) at the current
    /// iterate. All curvature bookkeeping downstream uses this convention.
    pub fn curr_g(&self) -> &Array1<f64> {
        &self.g
    }

    pub fn iter_num(&self) -> usize {
        self.iter
    }

    /// Number of objective/gradient evaluations performed so far.
    pub fn grad_evals(&self) -> usize {
        self.fn_evals
    }

    /// Breadcrumb from the last step ("LS failed, Hessian reset" and the like).
    pub fn note(&self) -> &str {
        &self.note
    }

    /// Norm of the last accepted step.
    pub fn prev_step_norm(&self) -> f64 {
        self.prev_step_norm
    }

    /// Step size accepted by the last line search.
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Step size the last line search started from.
    pub fn initial_step_size(&self) -> f64 {
        self.initial_step
    }

    pub fn grad_norm(&self) -> f64 {
        self.g.dot(&self.g).sqrt()
    }

    /// Take one quasi-Newton step.
    pub fn step(&mut self) -> Step {
        self.note.clear();
        if self.iter >= self.opts.max_iters {
            return Step {
                advanced: false,
                termination: Some(TerminationReason::MaxIterations),
            };
        }

        let mut p = self.search_direction();
        let mut dphi0 = p.dot(&self.g);
        if !(dphi0 < 0.0) {
            // Not a descent direction; fall back to steepest descent.
            self.reset_curvature();
            self.note = "non-descent direction, Hessian reset".to_string();
            p = self.g.mapv(|v| -v);
            dphi0 = -self.g.dot(&self.g);
            if !(dphi0 < 0.0) {
                return Step {
                    advanced: false,
                    termination: Some(TerminationReason::LineSearchFailed),
                };
            }
        }

        // Conservative first step; unit step once curvature information exists.
        let alpha0 = if self.iter == 0 || self.pairs.is_empty() {
            self.opts.init_alpha
        } else {
            1.0
        };
        self.initial_step = alpha0;

        let mut accepted = self.line_search(&p, dphi0, alpha0);
        if accepted.is_none() && !self.pairs.is_empty() {
            // Discard curvature history and retry along steepest descent.
            self.reset_curvature();
            self.note = "LS failed, Hessian reset".to_string();
            p = self.g.mapv(|v| -v);
            dphi0 = -self.g.dot(&self.g);
            self.initial_step = self.opts.init_alpha;
            if dphi0 < 0.0 {
                accepted = self.line_search(&p, dphi0, self.opts.init_alpha);
            }
        }
        let Some(alpha) = accepted else {
            return Step {
                advanced: false,
                termination: Some(TerminationReason::LineSearchFailed),
            };
        };

        self.accept(&p, alpha)
    }

    fn reset_curvature(&mut self) {
        self.pairs.clear();
        self.gamma = 1.0;
    }

    /// Two-loop recursion: `p = -H g` with `H0 = gamma I`.
    fn search_direction(&self) -> Array1<f64> {
        let mut q = self.g.mapv(|v| -v);
        if self.pairs.is_empty() {
            return q;
        }
        let mut coeffs = vec![0.0; self.pairs.len()];
        for (idx, pair) in self.pairs.iter().enumerate().rev() {
            let a = pair.rho * pair.s.dot(&q);
            coeffs[idx] = a;
            q.scaled_add(-a, &pair.y);
        }
        q *= self.gamma;
        for (idx, pair) in self.pairs.iter().enumerate() {
            let b = pair.rho * pair.y.dot(&q);
            q.scaled_add(coeffs[idx] - b, &pair.s);
        }
        q
    }

    /// Evaluate the objective at `x + alpha p` into the trial buffers.
    /// Returns the directional derivative there, or `None` when the point is
    /// infeasible (model error or non-finite value/gradient).
    fn try_point(&mut self, p: &Array1<f64>, alpha: f64) -> Option<f64> {
        for i in 0..self.x.len() {
            self.trial_x[i] = self.x[i] + alpha * p[i];
        }
        self.fn_evals += 1;
        match self.model.log_prob_grad(self.trial_x.view(), &mut self.grad_lp) {
            Ok(lp) if lp.is_finite() && self.grad_lp.iter().all(|v| v.is_finite()) => {
                self.trial_f = -lp;
                for i in 0..self.trial_g.len() {
                    self.trial_g[i] = -self.grad_lp[i];
                }
                Some(self.trial_g.dot(p))
            }
            _ => None,
        }
    }

    /// Strong-Wolfe line search (bracket then zoom). Returns the accepted step
    /// size with the accepted point left in the trial buffers.
    fn line_search(&mut self, p: &Array1<f64>, dphi0: f64, alpha0: f64) -> Option<f64> {
        let f0 = self.f;
        let mut a_prev = 0.0;
        let mut f_prev = f0;
        let mut a = alpha0;
        for round in 0..MAX_EXPANSIONS {
            match self.try_point(p, a) {
                None => {
                    // Infeasible trial: everything past `a` is suspect, so
                    // bracket between the last feasible step and here.
                    return self.zoom(p, f0, dphi0, a_prev, f_prev, a);
                }
                Some(dphi) => {
                    let f_a = self.trial_f;
                    if f_a > f0 + WOLFE_C1 * a * dphi0 || (round > 0 && f_a >= f_prev) {
                        return self.zoom(p, f0, dphi0, a_prev, f_prev, a);
                    }
                    if dphi.abs() <= -WOLFE_C2 * dphi0 {
                        return Some(a);
                    }
                    if dphi >= 0.0 {
                        return self.zoom(p, f0, dphi0, a, f_a, a_prev);
                    }
                    a_prev = a;
                    f_prev = f_a;
                    a *= 2.0;
                }
            }
        }
        None
    }

    /// Bisection zoom between a feasible low point and a high bound that may
    /// be infeasible. Invariant: `a_lo` satisfies sufficient decrease.
    fn zoom(
        &mut self,
        p: &Array1<f64>,
        f0: f64,
        dphi0: f64,
        mut a_lo: f64,
        mut f_lo: f64,
        mut a_hi: f64,
    ) -> Option<f64> {
        for _ in 0..MAX_ZOOM_STEPS {
            if (a_hi - a_lo).abs() <= MIN_STEP {
                return None;
            }
            let a = 0.5 * (a_lo + a_hi);
            let Some(dphi) = self.try_point(p, a) else {
                a_hi = a;
                continue;
            };
            let f_a = self.trial_f;
            if f_a > f0 + WOLFE_C1 * a * dphi0 || f_a >= f_lo {
                a_hi = a;
            } else {
                if dphi.abs() <= -WOLFE_C2 * dphi0 {
                    return Some(a);
                }
                if dphi * (a_hi - a_lo) >= 0.0 {
                    a_hi = a_lo;
                }
                a_lo = a;
                f_lo = f_a;
            }
        }
        None
    }

    /// Commit the trial point, refresh the curvature history, and run the
    /// convergence checks.
    fn accept(&mut self, p: &Array1<f64>, alpha: f64) -> Step {
        let f_prev = self.f;

        let mut s = p.clone();
        s *= alpha;
        let mut y = self.trial_g.clone();
        y -= &self.g;

        std::mem::swap(&mut self.x, &mut self.trial_x);
        std::mem::swap(&mut self.g, &mut self.trial_g);
        self.f = self.trial_f;

        let step_norm = s.dot(&s).sqrt();
        self.step_size = alpha;
        self.prev_step_norm = step_norm;
        self.iter += 1;

        let sy = s.dot(&y);
        let yy = y.dot(&y);
        if sy > f64::EPSILON * yy && yy > 0.0 {
            self.gamma = sy / yy;
            if self.pairs.len() == self.opts.history_size {
                self.pairs.pop_front();
            }
            self.pairs.push_back(CurvaturePair {
                rho: 1.0 / sy,
                s,
                y,
            });
        }

        let termination = self.convergence(f_prev, step_norm);
        Step {
            advanced: true,
            termination,
        }
    }

    fn convergence(&self, f_prev: f64, step_norm: f64) -> Option<TerminationReason> {
        let o = &self.opts;
        let delta_f = (f_prev - self.f).abs();
        let f_scale = self.f.abs().max(f_prev.abs()).max(1.0);
        let gnorm = self.grad_norm();
        if o.tol_obj > 0.0 && delta_f < o.tol_obj {
            return Some(TerminationReason::AbsObj);
        }
        if o.tol_rel_obj > 0.0 && delta_f / f_scale < o.tol_rel_obj * f64::EPSILON {
            return Some(TerminationReason::RelObj);
        }
        if o.tol_grad > 0.0 && gnorm < o.tol_grad {
            return Some(TerminationReason::AbsGrad);
        }
        if o.tol_rel_grad > 0.0 && gnorm / self.f.abs().max(1.0) < o.tol_rel_grad * f64::EPSILON {
            return Some(TerminationReason::RelGrad);
        }
        if o.tol_param > 0.0 && step_norm < o.tol_param {
            return Some(TerminationReason::AbsParam);
        }
        if self.iter >= o.max_iters {
            return Some(TerminationReason::MaxIterations);
        }
        None
    }
}
