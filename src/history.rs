//! Bounded curvature history owned by the path orchestrator, and the diagonal
//! inverse-Hessian scaling it feeds.

use ndarray::{Array1, Array2};
use std::collections::VecDeque;

/// Largest admissible curvature ratio `|y·y| / (y·s)` for a scaling update.
const CURVATURE_RATIO_CAP: f64 = 1e12;

/// Ordered window of the most recent `(Δx, Δg)` pairs, oldest evicted first.
///
/// Holds at most `capacity` pairs; the contents are exactly the most recent
/// successful optimizer steps, in step order.
pub struct HistoryWindow {
    dx: VecDeque<Array1<f64>>,
    dg: VecDeque<Array1<f64>>,
    capacity: usize,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "history capacity must be at least 1");
        Self {
            dx: VecDeque::with_capacity(capacity),
            dg: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, dx: Array1<f64>, dg: Array1<f64>) {
        if self.dx.len() == self.capacity {
            self.dx.pop_front();
            self.dg.pop_front();
        }
        self.dx.push_back(dx);
        self.dg.push_back(dg);
    }

    pub fn len(&self) -> usize {
        self.dx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dx.is_empty()
    }

    /// Most recent pair, `(Δx, Δg)`.
    pub fn latest(&self) -> Option<(&Array1<f64>, &Array1<f64>)> {
        Some((self.dx.back()?, self.dg.back()?))
    }

    /// Copy the window into contiguous `(S, Y)` matrices, one column per pair,
    /// oldest first. `S` holds parameter differences, `Y` gradient differences.
    pub fn assemble(&self) -> (Array2<f64>, Array2<f64>) {
        let m = self.len();
        debug_assert!(m > 0, "assemble called on an empty window");
        let dims = self.dx[0].len();
        let mut s_mat = Array2::<f64>::zeros((dims, m));
        let mut y_mat = Array2::<f64>::zeros((dims, m));
        for (j, (dx, dg)) in self.dx.iter().zip(self.dg.iter()).enumerate() {
            s_mat.column_mut(j).assign(dx);
            y_mat.column_mut(j).assign(dg);
        }
        (s_mat, y_mat)
    }
}

/// Whether the newest pair carries usable positive curvature: `y·s > 0` and
/// `|y·y| / (y·s) ≤ 1e12`.
pub fn check_curvature(yk: &Array1<f64>, sk: &Array1<f64>) -> bool {
    let dk = yk.dot(sk);
    if dk <= 0.0 {
        return false;
    }
    (yk.dot(yk) / dk).abs() <= CURVATURE_RATIO_CAP
}

/// Gilbert & Lemaréchal (1989) eq. 4.9 diagonal inverse-Hessian update.
///
/// Only call after `check_curvature` accepted the pair. The result is strictly
/// positive for positive-curvature input; a numerically degenerate update is
/// discarded in favor of the previous scaling.
pub fn update_diagonal_scaling(
    alpha: &Array1<f64>,
    yk: &Array1<f64>,
    sk: &Array1<f64>,
) -> Array1<f64> {
    let dims = alpha.len();
    let mut y_alpha_y = 0.0;
    let mut s_inv_alpha_s = 0.0;
    for i in 0..dims {
        y_alpha_y += alpha[i] * yk[i] * yk[i];
        s_inv_alpha_s += sk[i] * sk[i] / alpha[i];
    }
    let y_s = yk.dot(sk);

    let mut updated = Array1::<f64>::zeros(dims);
    for i in 0..dims {
        let s_over_alpha = sk[i] / alpha[i];
        let denom =
            y_alpha_y / alpha[i] + yk[i] * yk[i] - (y_alpha_y / s_inv_alpha_s) * s_over_alpha * s_over_alpha;
        updated[i] = y_s / denom;
    }

    debug_assert!(
        updated.iter().all(|&a| a.is_finite() && a > 0.0),
        "diagonal scaling update must stay strictly positive"
    );
    if updated.iter().all(|&a| a.is_finite() && a > 0.0) {
        updated
    } else {
        log::warn!("degenerate diagonal scaling update discarded; keeping previous scaling");
        alpha.clone()
    }
}
