use ndarray::{Array1, ArrayView1, ArrayView2, array};
use pathfinder::{
    Interrupt, LogDensityModel, ModelError, NeverInterrupt, NullSink, PathError, PathSink,
    PathfinderConfig, ReturnCode, pathfinder_single,
};
use rand::rngs::StdRng;

const LOG_TWO_PI: f64 = 1.837_877_066_409_345_3;

/// Standard normal shifted to `mu`.
struct ShiftedNormal {
    mu: Array1<f64>,
}

impl LogDensityModel for ShiftedNormal {
    fn dims(&self) -> usize {
        self.mu.len()
    }

    fn log_prob(&self, u: ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        let d = &u - &self.mu;
        Ok(-0.5 * (d.dot(&d) + self.dims() as f64 * LOG_TWO_PI))
    }

    fn log_prob_grad(
        &self,
        u: ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        let d = &u - &self.mu;
        grad.assign(&d.mapv(|v| -v));
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
        (0..self.dims()).map(|i| format!("theta.{i}")).collect()
    }
}

/// Same target, but every evaluation with `u[0] < 0` fails.
struct HalfPlaneNormal {
    inner: ShiftedNormal,
}

impl LogDensityModel for HalfPlaneNormal {
    fn dims(&self) -> usize {
        self.inner.dims()
    }

    fn log_prob(&self, u: ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        if u[0] < 0.0 {
            return Err(ModelError::LogProbFailed(
                "log density undefined for negative first coordinate".to_string(),
            ));
        }
        self.inner.log_prob(u)
    }

    fn log_prob_grad(
        &self,
        u: ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        if u[0] < 0.0 {
            return Err(ModelError::GradientFailed(
                "gradient undefined for negative first coordinate".to_string(),
            ));
        }
        self.inner.log_prob_grad(u, grad)
    }

    fn write_array(
        &self,
        rng: &mut StdRng,
        u: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, ModelError> {
        self.inner.write_array(rng, u)
    }

    fn constrained_param_names(&self) -> Vec<String> {
        self.inner.constrained_param_names()
    }
}

fn base_config() -> PathfinderConfig {
    PathfinderConfig {
        num_iterations: 20,
        num_elbo_draws: 100,
        num_draws: 1000,
        refresh: 0,
        ..PathfinderConfig::default()
    }
}

#[test]
fn zero_iteration_budget_fails_without_draws() {
    let model = ShiftedNormal {
        mu: Array1::zeros(2),
    };
    let config = PathfinderConfig {
        num_iterations: 0,
        ..base_config()
    };
    let result =
        pathfinder_single(&model, None, 42, 0, &config, &mut NeverInterrupt, &mut NullSink)
            .unwrap();
    assert_eq!(result.return_code, ReturnCode::Software);
    assert_eq!(result.draws.ncols(), 0);
    assert_eq!(result.lp_ratio.len(), 0);
    assert!(result.fn_calls > 0);
}

#[test]
fn minimal_history_and_single_iteration_still_produce_a_path() {
    let model = ShiftedNormal {
        mu: array![0.5, -0.25],
    };
    let config = PathfinderConfig {
        history_size: 1,
        num_iterations: 1,
        ..base_config()
    };
    let result =
        pathfinder_single(&model, None, 42, 0, &config, &mut NeverInterrupt, &mut NullSink)
            .unwrap();
    assert_eq!(result.return_code, ReturnCode::Ok);
    assert_eq!(result.draws.ncols(), 1000);
    assert_eq!(result.lp_ratio.len(), 1000);
}

#[test]
fn matching_draw_counts_skip_top_up() {
    let model = ShiftedNormal {
        mu: Array1::zeros(2),
    };
    let config = PathfinderConfig {
        num_elbo_draws: 120,
        num_draws: 120,
        ..base_config()
    };
    let result =
        pathfinder_single(&model, None, 7, 3, &config, &mut NeverInterrupt, &mut NullSink)
            .unwrap();
    assert_eq!(result.return_code, ReturnCode::Ok);
    assert_eq!(result.draws.ncols(), 120);
    assert_eq!(result.lp_ratio.len(), 120);
}

#[test]
fn draw_budget_below_elbo_count_returns_elbo_draws() {
    let model = ShiftedNormal {
        mu: Array1::zeros(2),
    };
    let config = PathfinderConfig {
        num_elbo_draws: 80,
        num_draws: 50,
        ..base_config()
    };
    let result =
        pathfinder_single(&model, None, 7, 0, &config, &mut NeverInterrupt, &mut NullSink)
            .unwrap();
    assert_eq!(result.return_code, ReturnCode::Ok);
    assert_eq!(result.draws.ncols(), 80);
}

#[test]
fn paths_are_deterministic_per_seed_and_distinct_per_path_id() {
    let model = ShiftedNormal {
        mu: array![1.0, 2.0],
    };
    let config = base_config();
    let a = pathfinder_single(&model, None, 99, 1, &config, &mut NeverInterrupt, &mut NullSink)
        .unwrap();
    let b = pathfinder_single(&model, None, 99, 1, &config, &mut NeverInterrupt, &mut NullSink)
        .unwrap();
    let c = pathfinder_single(&model, None, 99, 2, &config, &mut NeverInterrupt, &mut NullSink)
        .unwrap();

    assert_eq!(a.lp_ratio.len(), b.lp_ratio.len());
    for i in 0..a.lp_ratio.len() {
        assert_eq!(a.lp_ratio[i], b.lp_ratio[i]);
    }
    assert_eq!(a.draws, b.draws);
    assert_ne!(a.draws, c.draws);
}

#[test]
fn divergent_half_plane_still_returns_ok_with_mostly_finite_draws() {
    let model = HalfPlaneNormal {
        inner: ShiftedNormal {
            mu: array![2.0, 0.0],
        },
    };
    let result = pathfinder_single(
        &model,
        None,
        42,
        0,
        &base_config(),
        &mut NeverInterrupt,
        &mut NullSink,
    )
    .unwrap();
    assert_eq!(result.return_code, ReturnCode::Ok);
    assert!(result.draws.ncols() > 0);

    // lp__ is the last emitted row; most draws near the mode are feasible.
    let lp_row = result.draws.nrows() - 1;
    let finite = (0..result.draws.ncols())
        .filter(|&k| result.draws[[lp_row, k]].is_finite())
        .count();
    assert!(
        finite * 2 >= result.draws.ncols(),
        "only {finite} of {} draws were finite",
        result.draws.ncols()
    );
}

struct CancelImmediately;

impl Interrupt for CancelImmediately {
    fn stop_requested(&mut self) -> bool {
        true
    }
}

#[test]
fn interrupt_cancels_the_path() {
    let model = ShiftedNormal {
        mu: Array1::zeros(2),
    };
    let result = pathfinder_single(
        &model,
        None,
        42,
        0,
        &base_config(),
        &mut CancelImmediately,
        &mut NullSink,
    );
    assert!(matches!(result, Err(PathError::Interrupted)));
}

#[derive(Default)]
struct RecordingSink {
    events: Vec<String>,
    names: Vec<String>,
    diagnostics: usize,
    block_shape: Option<(usize, usize)>,
}

impl PathSink for RecordingSink {
    fn column_names(&mut self, names: &[String]) {
        self.names = names.to_vec();
        self.events.push("names".to_string());
    }

    fn draw_block(&mut self, block: ArrayView2<'_, f64>) {
        self.block_shape = Some(block.dim());
        self.events.push("block".to_string());
    }

    fn diagnostic(&mut self, _point: ArrayView1<'_, f64>, _grad: ArrayView1<'_, f64>) {
        self.diagnostics += 1;
        self.events.push("diagnostic".to_string());
    }

    fn message(&mut self, text: &str) {
        self.events.push(format!("message: {text}"));
    }

    fn blank(&mut self) {
        self.events.push("blank".to_string());
    }
}

#[test]
fn sink_receives_header_draws_and_timing_records_in_order() {
    let model = ShiftedNormal {
        mu: array![0.3, -0.7],
    };
    let config = PathfinderConfig {
        save_iterations: true,
        ..base_config()
    };
    let mut sink = RecordingSink::default();
    let result =
        pathfinder_single(&model, None, 5, 0, &config, &mut NeverInterrupt, &mut sink).unwrap();
    assert_eq!(result.return_code, ReturnCode::Ok);

    assert_eq!(sink.events.first().map(String::as_str), Some("names"));
    assert_eq!(
        sink.names,
        vec![
            "theta.0".to_string(),
            "theta.1".to_string(),
            "lp_approx__".to_string(),
            "lp__".to_string()
        ]
    );
    // Initial point plus one record per iteration.
    assert!(sink.diagnostics >= 2);
    assert_eq!(sink.block_shape, Some((4, 1000)));

    // Tail of the stream: draws, blank, elapsed-time line, blank.
    let tail: Vec<&str> = sink
        .events
        .iter()
        .rev()
        .take(4)
        .map(String::as_str)
        .collect();
    assert_eq!(tail[3], "block");
    assert_eq!(tail[2], "blank");
    assert!(tail[1].starts_with("message: Elapsed Time:"));
    assert!(tail[1].ends_with("seconds (Pathfinder)"));
    assert_eq!(tail[0], "blank");
}
