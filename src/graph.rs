use crate::{
    error::Error,
    factor::Factor,
    measurement::Timestamp,
    model::Increment,
    solver::{Problem, SolveMode, SolveReport, Solver},
    state::{StateId, StateKey, Trajectory},
};
use nalgebra::DVector;
use tracing::trace;

/// States plus the factors constraining them.
///
/// Factors refer to states by [`StateId`]; the graph resolves those to
/// [`StateKey`]s once, when the factor is added, and rejects factors that
/// name missing states or carry mismatched dimensions.
#[derive(Clone, Debug, Default)]
pub struct FactorGraph {
    trajectory: Trajectory,
    factors: Vec<(Factor, Vec<StateKey>)>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }

    pub fn add_state(&mut self, id: StateId, mean: DVector<f64>) -> Result<StateKey, Error> {
        trace!(state = %id, "adding state");
        self.trajectory.add(id.name, id.timestamp, mean)
    }

    pub fn add_factor(&mut self, factor: Factor) -> Result<(), Error> {
        let keys = factor
            .states()
            .iter()
            .map(|id| self.trajectory.require(id.name, id.timestamp))
            .collect::<Result<Vec<_>, _>>()?;
        trace!(kind = factor.kind().label(), states = keys.len(), "adding factor");
        self.factors.push((factor, keys));
        Ok(())
    }

    /// Adds the states of `increment`, then its factors.
    pub fn apply(&mut self, increment: Increment) -> Result<(), Error> {
        for (id, mean) in increment.states {
            self.add_state(id, mean)?;
        }
        for factor in increment.factors {
            self.add_factor(factor)?;
        }
        Ok(())
    }

    /// Freezes every state older than `reference - window`. Returns how many
    /// states were newly frozen.
    pub fn freeze(&mut self, window: f64, reference: Timestamp) -> usize {
        self.trajectory.freeze_before(reference - window)
    }

    /// Flattens the graph into a least-squares problem over its free states.
    pub fn problem(&self) -> Problem<'_> {
        Problem::new(
            &self.trajectory,
            self.factors.iter().map(|(factor, keys)| (factor, keys.as_slice())),
        )
    }

    /// Optimizes the free states in place. Frozen states are never written.
    pub fn solve(&mut self, solver: &dyn Solver, mode: SolveMode) -> SolveReport {
        let (updates, report) = {
            let problem = self.problem();
            let outcome = solver.solve(&problem, mode);
            let updates: Vec<_> = problem.unpack(&outcome.solution).collect();
            (updates, outcome.report)
        };
        for (key, mean) in &updates {
            self.trajectory.set_mean(*key, mean);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        factor::{FactorKind, GaussianNoise},
        solver::LevenbergMarquardtSolver,
        state::StateName,
    };
    use nalgebra::Vector3;

    fn position(x: f64) -> DVector<f64> {
        DVector::from_vec(vec![x, 0.0, 0.0])
    }

    fn fix(t: f64, x: f64) -> Factor {
        Factor::new(
            FactorKind::Gnss { mean: position(x) },
            vec![StateId::new(StateName::Position, t)],
            GaussianNoise::isotropic(3, 1.0).unwrap(),
        )
        .unwrap()
    }

    fn odometry(from: f64, to: f64, speed: f64) -> Factor {
        Factor::new(
            FactorKind::Odometry {
                velocity: Vector3::new(speed, 0.0, 0.0),
                yaw_rate: 0.0,
                dt: to - from,
            },
            vec![
                StateId::new(StateName::Position, from),
                StateId::new(StateName::Yaw, from),
                StateId::new(StateName::Position, to),
                StateId::new(StateName::Yaw, to),
            ],
            GaussianNoise::from_std_devs(&[0.1, 0.1, 0.1, 0.01]).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn factor_on_missing_state_is_rejected() {
        let mut graph = FactorGraph::new();
        assert!(matches!(
            graph.add_factor(fix(0.0, 1.0)),
            Err(Error::UnknownState { .. })
        ));
        assert_eq!(graph.factor_count(), 0);
    }

    #[test]
    fn frozen_states_do_not_move() {
        let solver = LevenbergMarquardtSolver::default();
        let mut graph = FactorGraph::new();
        for t in [0.0, 1.0, 2.0] {
            graph.add_state(StateId::new(StateName::Position, t), position(0.0)).unwrap();
            graph.add_state(StateId::new(StateName::Yaw, t), DVector::zeros(1)).unwrap();
            graph.add_factor(fix(t, t)).unwrap();
        }
        graph.add_factor(odometry(0.0, 1.0, 1.0)).unwrap();
        graph.add_factor(odometry(1.0, 2.0, 1.0)).unwrap();
        graph.solve(&solver, SolveMode::Full);

        assert_eq!(graph.freeze(1.0, 2.0), 2);
        let frozen: Vec<_> = graph
            .trajectory()
            .iter()
            .filter(|(_, s)| s.is_constant())
            .map(|(key, s)| (key, s.mean().clone()))
            .collect();

        // Pull the free end hard away from its fix.
        graph.add_factor(fix(2.0, 50.0)).unwrap();
        graph.solve(&solver, SolveMode::Full);

        for (key, mean) in frozen {
            assert_eq!(graph.trajectory().get(key).mean(), &mean);
        }
        let end = graph.trajectory().require(StateName::Position, 2.0).unwrap();
        assert!(graph.trajectory().get(end).mean()[0] > 2.0);
    }

    #[test]
    fn chain_recovers_fixes() {
        let mut graph = FactorGraph::new();
        for t in [0.0, 1.0, 2.0] {
            graph.add_state(StateId::new(StateName::Position, t), position(0.0)).unwrap();
            graph.add_state(StateId::new(StateName::Yaw, t), DVector::zeros(1)).unwrap();
            graph.add_factor(fix(t, 2.0 * t)).unwrap();
        }
        graph.add_factor(odometry(0.0, 1.0, 2.0)).unwrap();
        graph.add_factor(odometry(1.0, 2.0, 2.0)).unwrap();

        let report = graph.solve(&LevenbergMarquardtSolver::default(), SolveMode::Full);
        assert!(report.final_cost < 1e-6, "{report:?}");
        for (t, x) in [(0.0, 0.0), (1.0, 2.0), (2.0, 4.0)] {
            let key = graph.trajectory().require(StateName::Position, t).unwrap();
            approx::assert_relative_eq!(graph.trajectory().get(key).mean()[0], x, epsilon = 1e-4);
        }
    }
}
