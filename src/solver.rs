//! Nonlinear least squares over the free variables of the factor graph.
//!
//! The graph is flattened into a [`Problem`]: every free variable receives a
//! contiguous block of the parameter vector, frozen variables are read from
//! the trajectory as constants, and factors touching only frozen variables
//! are dropped. Robust losses are handled by iteratively re-weighting the
//! whitened residuals between Levenberg-Marquardt runs.

use crate::{
    factor::{Factor, Linearization, RobustLoss},
    state::{StateKey, Trajectory},
};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, storage::Owned};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How much effort a single solve may spend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SolveMode {
    /// A handful of iterations, enough to track the newest states.
    Bounded,
    /// Iterate until convergence.
    Full,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SolverConfig {
    /// Levenberg-Marquardt patience of a full solve.
    pub full_patience: usize,
    /// Levenberg-Marquardt patience of a bounded solve.
    pub bounded_patience: usize,
    /// Re-weighting passes of a full solve when robust losses are present.
    pub robust_iterations: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            full_patience: 100,
            bounded_patience: 2,
            robust_iterations: 3,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
        }
    }
}

/// Outcome of one solve. A solve that did not converge is not an error;
/// the run continues with whatever estimate the solver reached.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveReport {
    pub mode: SolveMode,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
    pub duration: Duration,
}

impl SolveReport {
    fn skipped(mode: SolveMode, cost: f64) -> Self {
        Self {
            mode,
            iterations: 0,
            initial_cost: cost,
            final_cost: cost,
            converged: true,
            duration: Duration::ZERO,
        }
    }
}

pub struct SolveOutcome {
    /// Stacked values of [`Problem::free_keys`].
    pub solution: DVector<f64>,
    pub report: SolveReport,
}

pub trait Solver: Sync {
    fn solve(&self, problem: &Problem<'_>, mode: SolveMode) -> SolveOutcome;
}

struct Block<'a> {
    factor: &'a Factor,
    keys: &'a [StateKey],
    row: usize,
}

/// The factor graph flattened into a dense least-squares problem.
pub struct Problem<'a> {
    trajectory: &'a Trajectory,
    blocks: Vec<Block<'a>>,
    free: Vec<StateKey>,
    offsets: Vec<Option<usize>>,
    dim: usize,
    residual_dim: usize,
}

impl<'a> Problem<'a> {
    pub fn new<I>(trajectory: &'a Trajectory, factors: I) -> Self
    where
        I: IntoIterator<Item = (&'a Factor, &'a [StateKey])>,
    {
        let mut offsets = vec![None; trajectory.len()];
        let mut free = Vec::new();
        let mut dim = 0;
        for (key, state) in trajectory.iter() {
            if !state.is_constant() {
                offsets[key.index()] = Some(dim);
                free.push(key);
                dim += state.name().dim();
            }
        }

        let mut blocks = Vec::new();
        let mut residual_dim = 0;
        for (factor, keys) in factors {
            if keys.iter().all(|k| offsets[k.index()].is_none()) {
                continue;
            }
            blocks.push(Block {
                factor,
                keys,
                row: residual_dim,
            });
            residual_dim += factor.kind().residual_dim();
        }

        Self {
            trajectory,
            blocks,
            free,
            offsets,
            dim,
            residual_dim,
        }
    }

    /// Number of free parameters.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn residual_dim(&self) -> usize {
        self.residual_dim
    }

    /// Factors that touch at least one free variable.
    pub fn factor_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_keys(&self) -> &[StateKey] {
        &self.free
    }

    fn has_robust_loss(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| b.factor.loss() != RobustLoss::None)
    }

    /// Current means of the free variables, stacked.
    pub fn initial(&self) -> DVector<f64> {
        let mut x = DVector::zeros(self.dim);
        for key in &self.free {
            let mean = self.trajectory.get(*key).mean();
            if let Some(offset) = self.offsets[key.index()] {
                x.rows_mut(offset, mean.len()).copy_from(mean);
            }
        }
        x
    }

    /// Splits a stacked solution back into per-variable means.
    pub fn unpack<'x>(
        &'x self,
        x: &'x DVector<f64>,
    ) -> impl Iterator<Item = (StateKey, DVector<f64>)> + 'x {
        self.free.iter().filter_map(move |key| {
            let offset = self.offsets[key.index()]?;
            let dim = self.trajectory.get(*key).name().dim();
            Some((*key, x.rows(offset, dim).clone_owned()))
        })
    }

    fn value(&self, x: &DVector<f64>, key: StateKey) -> DVector<f64> {
        match self.offsets[key.index()] {
            Some(offset) => x.rows(offset, key_dim(self.trajectory, key)).clone_owned(),
            None => self.trajectory.get(key).mean().clone(),
        }
    }

    fn linearize(&self, x: &DVector<f64>) -> Vec<Linearization> {
        self.blocks
            .par_iter()
            .map(|block| {
                let values: Vec<DVector<f64>> =
                    block.keys.iter().map(|k| self.value(x, *k)).collect();
                block.factor.linearize(&values.iter().collect::<Vec<_>>())
            })
            .collect()
    }

    /// `½ Σ ρ(‖rᵢ‖²)` over the whitened residuals.
    pub fn cost(&self, x: &DVector<f64>) -> f64 {
        0.5 * self
            .linearize(x)
            .iter()
            .zip(&self.blocks)
            .map(|(lin, block)| block.factor.loss().rho_and_weight(lin.residual.norm_squared()).0)
            .sum::<f64>()
    }

    fn weights(&self, x: &DVector<f64>) -> Vec<f64> {
        self.linearize(x)
            .iter()
            .zip(&self.blocks)
            .map(|(lin, block)| block.factor.loss().rho_and_weight(lin.residual.norm_squared()).1)
            .collect()
    }

    fn residuals(&self, x: &DVector<f64>, weights: &[f64]) -> DVector<f64> {
        let mut stacked = DVector::zeros(self.residual_dim);
        for ((lin, block), weight) in self.linearize(x).iter().zip(&self.blocks).zip(weights) {
            stacked
                .rows_mut(block.row, lin.residual.len())
                .copy_from(&(&lin.residual * weight.sqrt()));
        }
        stacked
    }

    fn jacobian(&self, x: &DVector<f64>, weights: &[f64]) -> DMatrix<f64> {
        let mut stacked = DMatrix::zeros(self.residual_dim, self.dim);
        for ((lin, block), weight) in self.linearize(x).iter().zip(&self.blocks).zip(weights) {
            let scale = weight.sqrt();
            for (key, jacobian) in block.keys.iter().zip(&lin.jacobians) {
                if let Some(offset) = self.offsets[key.index()] {
                    let mut target = stacked.view_mut((block.row, offset), jacobian.shape());
                    target += jacobian * scale;
                }
            }
        }
        stacked
    }
}

fn key_dim(trajectory: &Trajectory, key: StateKey) -> usize {
    trajectory.get(key).name().dim()
}

/// Adapts a [`Problem`] with frozen robust weights to the
/// `levenberg_marquardt` interface.
struct Weighted<'p, 'a> {
    problem: &'p Problem<'a>,
    weights: Vec<f64>,
    params: DVector<f64>,
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for Weighted<'_, '_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.problem.residuals(&self.params, &self.weights))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        Some(self.problem.jacobian(&self.params, &self.weights))
    }
}

#[derive(Clone, Debug, Default)]
pub struct LevenbergMarquardtSolver {
    config: SolverConfig,
}

impl LevenbergMarquardtSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }
}

impl Solver for LevenbergMarquardtSolver {
    fn solve(&self, problem: &Problem<'_>, mode: SolveMode) -> SolveOutcome {
        let started = Instant::now();
        let mut x = problem.initial();
        let initial_cost = problem.cost(&x);
        if problem.dim() == 0 || problem.residual_dim() == 0 {
            return SolveOutcome {
                solution: x,
                report: SolveReport::skipped(mode, initial_cost),
            };
        }

        let (patience, passes) = match mode {
            SolveMode::Bounded => (self.config.bounded_patience, 1),
            SolveMode::Full => (self.config.full_patience, self.config.robust_iterations),
        };
        let passes = if problem.has_robust_loss() { passes.max(1) } else { 1 };

        let mut iterations = 0;
        let mut converged = true;
        for pass in 0..passes {
            let lm = LevenbergMarquardt::new()
                .with_ftol(self.config.ftol)
                .with_xtol(self.config.xtol)
                .with_gtol(self.config.gtol)
                .with_patience(patience.max(1));
            let weighted = Weighted {
                problem,
                weights: problem.weights(&x),
                params: x.clone(),
            };
            let (weighted, report) = lm.minimize(weighted);
            iterations += report.number_of_evaluations;
            converged = report.termination.was_successful();
            debug!(pass, ?mode, termination = ?report.termination, "levenberg-marquardt pass");

            if weighted.params.iter().any(|v| !v.is_finite()) {
                warn!(?mode, "solver diverged, keeping previous estimate");
                converged = false;
                break;
            }
            x = weighted.params;
        }

        let final_cost = problem.cost(&x);
        SolveOutcome {
            solution: x,
            report: SolveReport {
                mode,
                iterations,
                initial_cost,
                final_cost,
                converged,
                duration: started.elapsed(),
            },
        }
    }
}
