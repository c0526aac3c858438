//! The time-stepped estimation loop.
//!
//! Each step advances to the next measurement time, lets the motion models
//! propagate the states, attaches the measurements of the elapsed interval,
//! solves and mirrors the result into the output trajectory. Old states are
//! frozen by a sliding window; a full solve is forced on the first and last
//! steps and once per period, with cheaper bounded solves in between.

use crate::{
    config::FactorGraphConfig,
    context::RunContext,
    error::Error,
    frame::TangentPlaneConverter,
    graph::FactorGraph,
    init,
    measurement::{MeasurementSet, SensorKind, Timestamp},
    model::{self, ModelContext},
    sink::{Artifact, ResultSink},
    solver::{LevenbergMarquardtSolver, SolveMode, SolveReport, Solver},
    state::{StateName, StateVariable, Trajectory},
};
use std::{
    borrow::Cow,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Diagnostics of a single step.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationSummary {
    pub step: usize,
    pub timestamp: Timestamp,
    pub solve: SolveReport,
    pub free_states: usize,
    pub frozen_states: usize,
    pub factors: usize,
    /// Wall time of the whole step, solve included.
    pub duration: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Stopped between two steps; the trajectory holds every step until then.
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct Estimate {
    /// Final trajectory, in the global frame when an anchor was found.
    pub trajectory: Trajectory,
    pub summaries: Vec<IterationSummary>,
    pub frame: Option<TangentPlaneConverter>,
    pub status: RunStatus,
}

pub struct Estimator<S = LevenbergMarquardtSolver> {
    config: FactorGraphConfig,
    solver: S,
}

impl Estimator {
    pub fn new(config: FactorGraphConfig) -> Self {
        let solver = LevenbergMarquardtSolver::new(config.solver.clone());
        Self { config, solver }
    }
}

impl<S: Solver> Estimator<S> {
    pub fn with_solver(config: FactorGraphConfig, solver: S) -> Self {
        Self { config, solver }
    }

    pub fn config(&self) -> &FactorGraphConfig {
        &self.config
    }

    /// Estimates a trajectory from `source` and hands it to `sink`.
    ///
    /// An empty source or one without any timestamp for the active sensors
    /// aborts before anything is written.
    pub fn run(
        &self,
        source: &MeasurementSet,
        sink: &mut impl ResultSink,
        ctx: &mut RunContext<'_>,
    ) -> Result<Estimate, Error> {
        let span = ctx.span().clone();
        let _entered = span.enter();

        self.config.validate()?;
        if source.is_empty() {
            return Err(Error::EmptySource);
        }
        let kinds = self.config.active_kinds();
        let measurements = self.prepare(source, &kinds)?;
        let (first, last) = time_span(&measurements, &kinds)?;
        info!(first, last, kinds = ?kinds, "starting run");

        let mut graph = FactorGraph::new();
        let frame = init::initialize(&mut graph, &measurements, &self.config, first)?;

        let mut output = Trajectory::new();
        let mut summaries = Vec::new();
        let mut progress = Progress::default();
        let mut previous = first - 1.0;
        let mut now = first;

        let status = loop {
            let started = Instant::now();
            let step = summaries.len();

            if step > 0 {
                for kind in kinds.iter().copied().filter(|k| k.is_motion()) {
                    let model_ctx = self.model_context(&graph, &measurements, frame.as_ref());
                    let increment = model::predict(kind, &model_ctx, previous, now)?;
                    graph.apply(increment)?;
                }
            }
            for kind in &kinds {
                let model_ctx = self.model_context(&graph, &measurements, frame.as_ref());
                let increment = model::measure(*kind, &model_ctx, previous, now)?;
                graph.apply(increment)?;
            }
            if step == 0 && self.config.is_active(SensorKind::Prior) {
                let model_ctx = self.model_context(&graph, &measurements, frame.as_ref());
                let increment = model::position_prior(&model_ctx, now)?;
                graph.apply(increment)?;
            }

            let next = self.next_timestamp(&measurements, &kinds, now).filter(|t| *t <= last);
            let mode = if step == 0 || next.is_none() || self.crosses_period(previous, now) {
                SolveMode::Full
            } else {
                SolveMode::Bounded
            };

            if let Some(window) = self.config.window {
                graph.freeze(window, now);
            }
            let report = graph.solve(&self.solver, mode);
            if !report.converged && mode == SolveMode::Full {
                warn!(step, t = now, cost = report.final_cost, "full solve did not converge");
            }
            debug!(
                step,
                t = now,
                ?mode,
                iterations = report.iterations,
                cost = report.final_cost,
                "solved"
            );

            output.persist_from(graph.trajectory());
            summaries.push(IterationSummary {
                step,
                timestamp: now,
                solve: report,
                free_states: graph.trajectory().free_count(),
                frozen_states: graph.trajectory().frozen_count(),
                factors: graph.factor_count(),
                duration: started.elapsed(),
            });

            let fraction = if last > first { (now - first) / (last - first) } else { 1.0 };
            progress.report(fraction, ctx);

            let Some(next) = next else {
                break RunStatus::Completed;
            };
            if ctx.is_cancelled() {
                warn!(t = now, "run cancelled");
                break RunStatus::Cancelled;
            }
            previous = now;
            now = next;
        };

        if let Some(frame) = &frame {
            let local: Vec<StateVariable> = output.states(StateName::Position).cloned().collect();
            sink.write(Artifact::LocalFrame, StateName::Position, &local)?;
            frame.convert_all_to_global(&mut output, StateName::Position);
        }
        let names: Vec<StateName> = output.names().collect();
        for name in names {
            let states: Vec<StateVariable> = output.states(name).cloned().collect();
            sink.write(Artifact::Final, name, &states)?;
        }
        sink.write_summaries(&summaries)?;

        info!(steps = summaries.len(), states = output.len(), ?status, "run finished");
        Ok(Estimate {
            trajectory: output,
            summaries,
            frame,
            status,
        })
    }

    fn model_context<'a>(
        &'a self,
        graph: &'a FactorGraph,
        measurements: &'a MeasurementSet,
        frame: Option<&'a TangentPlaneConverter>,
    ) -> ModelContext<'a> {
        ModelContext {
            trajectory: graph.trajectory(),
            measurements,
            config: &self.config,
            frame,
        }
    }

    /// Resamples the active streams that ask for it.
    fn prepare<'m>(
        &self,
        source: &'m MeasurementSet,
        kinds: &[SensorKind],
    ) -> Result<Cow<'m, MeasurementSet>, Error> {
        let mut measurements = Cow::Borrowed(source);
        for kind in kinds {
            if let Some(bucket) = self.config.resample_bucket(*kind)
                && !source.stream(*kind).is_empty()
            {
                measurements.to_mut().resample(*kind, bucket)?;
                debug!(%kind, bucket, samples = measurements.stream(*kind).len(), "resampled");
            }
        }
        Ok(measurements)
    }

    /// Earliest measurement strictly after `now`, capped by the prediction
    /// tick when one is configured.
    fn next_timestamp(
        &self,
        measurements: &MeasurementSet,
        kinds: &[SensorKind],
        now: Timestamp,
    ) -> Option<Timestamp> {
        let data = kinds
            .iter()
            .filter_map(|kind| measurements.next_timestamp_after(*kind, now))
            .min_by(f64::total_cmp);
        match (data, self.config.prediction_tick) {
            (Some(data), Some(tick)) => Some(data.min(now + tick)),
            (None, Some(tick)) => Some(now + tick),
            (data, None) => data,
        }
    }

    fn crosses_period(&self, previous: Timestamp, now: Timestamp) -> bool {
        now.rem_euclid(self.config.full_solve_period) < (now - previous) * 1.1
    }
}

/// First and last timestamp over the active streams that hold data.
fn time_span(
    measurements: &MeasurementSet,
    kinds: &[SensorKind],
) -> Result<(Timestamp, Timestamp), Error> {
    let first = kinds
        .iter()
        .filter_map(|kind| measurements.first_timestamp(*kind).ok())
        .min_by(f64::total_cmp)
        .ok_or(Error::NoTimestamp("first"))?;
    let last = kinds
        .iter()
        .filter_map(|kind| measurements.last_timestamp(*kind).ok())
        .max_by(f64::total_cmp)
        .ok_or(Error::NoTimestamp("last"))?;
    Ok((first, last))
}

/// Forwards progress to the run context and logs every tenth of the run.
#[derive(Default)]
struct Progress {
    logged: u32,
}

impl Progress {
    fn report(&mut self, fraction: f64, ctx: &mut RunContext<'_>) {
        ctx.report_progress(fraction);
        let decile = (fraction * 10.0).floor().clamp(0.0, 10.0) as u32;
        if decile > self.logged {
            self.logged = decile;
            info!("{}% done", decile * 10);
        }
    }
}
