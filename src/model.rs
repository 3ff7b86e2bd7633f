use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use thiserror::Error;

/// Failure raised by a model evaluation.
///
/// Log-density divergence is expected and frequent (draws can land outside the
/// support of the constrained parameterization), so evaluations return a
/// `Result` instead of unwinding across the sampling loops.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("log density evaluation failed: {0}")]
    LogProbFailed(String),
    #[error("gradient evaluation failed: {0}")]
    GradientFailed(String),
    #[error("constraining transform failed: {0}")]
    ConstrainFailed(String),
}

/// Differentiable target density over an unconstrained parameter vector.
///
/// The density may be unnormalized. `write_array` maps an unconstrained draw
/// to the constrained space reported to sinks; the RNG parameter mirrors the
/// generated-quantities convention of probabilistic-programming backends where
/// the constraining transform may itself sample.
pub trait LogDensityModel {
    /// Dimension of the unconstrained parameter space.
    fn dims(&self) -> usize;

    /// Unnormalized log density at `u`.
    fn log_prob(&self, u: ArrayView1<'_, f64>) -> Result<f64, ModelError>;

    /// Log density and its gradient at `u`. `grad` has length `dims()` and is
    /// overwritten.
    fn log_prob_grad(
        &self,
        u: ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError>;

    /// Transform an unconstrained draw to the constrained space.
    fn write_array(
        &self,
        rng: &mut StdRng,
        u: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, ModelError>;

    /// Names of the constrained parameters, in `write_array` output order.
    fn constrained_param_names(&self) -> Vec<String>;
}
