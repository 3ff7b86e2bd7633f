#![deny(dead_code)]
#![deny(unused_imports)]

pub mod elbo;
pub mod faer_ndarray;
pub mod history;
pub mod lbfgs;
pub mod model;
pub mod path;
pub mod psis;
pub mod taylor;

pub use elbo::{ElboEstimate, estimate_approx_draws};
pub use history::{HistoryWindow, check_curvature, update_diagonal_scaling};
pub use lbfgs::{Lbfgs, LbfgsConfig, Step, TerminationReason};
pub use model::{LogDensityModel, ModelError};
pub use path::{
    Interrupt, NeverInterrupt, NullSink, PathError, PathResult, PathSink, PathfinderConfig,
    ReturnCode, pathfinder_single,
};
pub use psis::{PsisResult, gpdfit, psis_weights};
pub use taylor::{
    ApproxForm, TaylorApproximation, TaylorError, approximate_samples, taylor_approximation,
};
