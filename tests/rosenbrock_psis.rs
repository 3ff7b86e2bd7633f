use ndarray::{Array1, ArrayView1};
use pathfinder::{
    LogDensityModel, ModelError, NeverInterrupt, NullSink, PathfinderConfig, ReturnCode,
    pathfinder_single, psis_weights,
};
use rand::rngs::StdRng;

/// Rosenbrock banana density: `log p(x, y) = -((1-x)^2 + 100 (y - x^2)^2)`.
struct Rosenbrock;

impl LogDensityModel for Rosenbrock {
    fn dims(&self) -> usize {
        2
    }

    fn log_prob(&self, u: ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        let (x, y) = (u[0], u[1]);
        let a = 1.0 - x;
        let b = y - x * x;
        Ok(-(a * a + 100.0 * b * b))
    }

    fn log_prob_grad(
        &self,
        u: ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        let (x, y) = (u[0], u[1]);
        let b = y - x * x;
        grad[0] = 2.0 * (1.0 - x) + 400.0 * x * b;
        grad[1] = -200.0 * b;
        self.log_prob(u)
    }

    fn write_array(
        &self,
        _rng: &mut StdRng,
        u: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, ModelError> {
        Ok(u.to_owned())
    }

    fn constrained_param_names(&self) -> Vec<String> {
        vec!["x".to_string(), "y".to_string()]
    }
}

#[test]
fn banana_target_yields_a_usable_importance_tail() {
    let config = PathfinderConfig {
        num_iterations: 200,
        num_elbo_draws: 100,
        num_draws: 1000,
        refresh: 0,
        ..PathfinderConfig::default()
    };
    let result = pathfinder_single(
        &Rosenbrock,
        None,
        42,
        0,
        &config,
        &mut NeverInterrupt,
        &mut NullSink,
    )
    .unwrap();

    // At least one iterate must have produced a valid approximation.
    assert_eq!(result.return_code, ReturnCode::Ok);
    assert_eq!(result.lp_ratio.len(), 1000);
    assert!(result.lp_ratio.iter().all(|v| !v.is_nan()));

    let tail_len = (3.0 * (result.lp_ratio.len() as f64).sqrt()).ceil() as usize;
    let psis = psis_weights(&result.lp_ratio, tail_len);
    let total: f64 = psis.weights.iter().sum();
    assert!((total - 1.0).abs() < 1e-8, "weights sum to {total}");

    let khat = psis.pareto_k.expect("tail smoothing should have run");
    assert!(khat < 1.0, "Pareto k̂ = {khat}");
}

#[test]
fn smoothing_flattens_the_extreme_weights() {
    let config = PathfinderConfig {
        num_iterations: 200,
        num_elbo_draws: 100,
        num_draws: 1000,
        refresh: 0,
        ..PathfinderConfig::default()
    };
    let result = pathfinder_single(
        &Rosenbrock,
        None,
        11,
        4,
        &config,
        &mut NeverInterrupt,
        &mut NullSink,
    )
    .unwrap();
    assert_eq!(result.return_code, ReturnCode::Ok);

    let tail_len = (3.0 * (result.lp_ratio.len() as f64).sqrt()).ceil() as usize;
    let smoothed = psis_weights(&result.lp_ratio, tail_len);
    let raw = psis_weights(&result.lp_ratio, 0);

    assert!(smoothed.pareto_k.is_some());
    assert!(raw.pareto_k.is_none());
    let total: f64 = smoothed.weights.iter().sum();
    assert!((total - 1.0).abs() < 1e-8);
    assert!(smoothed.weights.iter().all(|&w| w > 0.0 && w <= 1.0));
    // The fitted quantiles replace the observed tail, so the weight vector
    // must actually change.
    let changed = smoothed
        .weights
        .iter()
        .zip(raw.weights.iter())
        .any(|(s, r)| (s - r).abs() > 1e-14);
    assert!(changed, "tail smoothing left every weight untouched");
}
