//! Parameter blocks handed to the bundle adjuster.

use serde::{Deserialize, Serialize};

/// Robust loss applied to reprojection residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossFunction {
    /// Plain squared error.
    Trivial,
    /// `2 * (sqrt(1 + s) - 1)`.
    SoftL1,
    /// `log(1 + s)`.
    Cauchy,
}

impl Default for LossFunction {
    fn default() -> Self {
        Self::Trivial
    }
}

/// Nonlinear solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub function_tolerance: f64,
    pub gradient_tolerance: f64,
    pub parameter_tolerance: f64,
    pub max_num_iterations: usize,
    pub max_linear_solver_iterations: usize,
    /// Worker threads for the solve; `-1` lets the engine decide.
    pub num_threads: i32,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            function_tolerance: 0.0,
            gradient_tolerance: 1e-4,
            parameter_tolerance: 0.0,
            max_num_iterations: 100,
            max_linear_solver_iterations: 200,
            num_threads: -1,
        }
    }
}

/// Full set of options for one bundle adjustment call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentOptions {
    pub solver: SolverOptions,

    pub loss_function: LossFunction,

    /// Scale of the robust loss, in pixels.
    pub loss_function_scale: f64,

    pub refine_focal_length: bool,
    pub refine_principal_point: bool,
    pub refine_extra_params: bool,

    /// Residual count below which the solve runs single-threaded.
    pub min_num_residuals_for_multi_threading: usize,

    /// Registered-image count below which intrinsics stay fixed.
    pub min_num_reg_images: usize,
}

impl Default for BundleAdjustmentOptions {
    fn default() -> Self {
        Self {
            solver: SolverOptions::default(),
            loss_function: LossFunction::Trivial,
            loss_function_scale: 1.0,
            refine_focal_length: true,
            refine_principal_point: false,
            refine_extra_params: true,
            min_num_residuals_for_multi_threading: 50_000,
            min_num_reg_images: 0,
        }
    }
}
