//! Sensor models.
//!
//! Each model reads the current trajectory and the measurement source and
//! returns the states and factors to add as an [`Increment`]. Models never
//! touch the graph themselves; the estimation loop applies what they return.

pub mod gnss;
pub mod imu;
pub mod odometry;

use crate::{
    config::FactorGraphConfig,
    error::Error,
    factor::{Factor, FactorKind, GaussianNoise},
    frame::TangentPlaneConverter,
    measurement::{MeasurementSet, SensorKind, Timestamp},
    state::{StateId, StateName, Trajectory},
};
use nalgebra::{DVector, Vector3};

/// What a model sees of the estimation problem.
#[derive(Clone, Copy)]
pub struct ModelContext<'a> {
    pub trajectory: &'a Trajectory,
    pub measurements: &'a MeasurementSet,
    pub config: &'a FactorGraphConfig,
    pub frame: Option<&'a TangentPlaneConverter>,
}

impl ModelContext<'_> {
    /// Mean of the state `name` at exactly `timestamp`.
    pub fn mean(&self, name: StateName, timestamp: Timestamp) -> Result<&DVector<f64>, Error> {
        let key = self.trajectory.require(name, timestamp)?;
        Ok(self.trajectory.get(key).mean())
    }

    /// Maps a global position into the working frame. Without an anchor the
    /// working frame is the global one.
    pub fn to_working(&self, global: &Vector3<f64>) -> Vector3<f64> {
        match self.frame {
            Some(frame) => frame.to_local(global),
            None => *global,
        }
    }
}

/// New states and factors produced by a model.
#[derive(Clone, Debug, Default)]
pub struct Increment {
    pub states: Vec<(StateId, DVector<f64>)>,
    pub factors: Vec<Factor>,
}

impl Increment {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty() && self.factors.is_empty()
    }

    /// Queues `id` for creation unless it already exists in `trajectory` or
    /// in this increment.
    pub fn seed<F>(&mut self, trajectory: &Trajectory, id: StateId, mean: F)
    where
        F: FnOnce() -> DVector<f64>,
    {
        let queued = self.states.iter().any(|(queued, _)| *queued == id);
        if !queued && !trajectory.contains(id.name, id.timestamp) {
            self.states.push((id, mean()));
        }
    }

    pub fn append(&mut self, other: Increment) {
        self.states.extend(other.states);
        self.factors.extend(other.factors);
    }
}

/// Propagates the motion states of `kind` from `previous` to `now`.
pub fn predict(
    kind: SensorKind,
    ctx: &ModelContext<'_>,
    previous: Timestamp,
    now: Timestamp,
) -> Result<Increment, Error> {
    match kind {
        SensorKind::Imu => imu::predict(ctx, previous, now),
        SensorKind::Odometry => odometry::predict(ctx, previous, now),
        SensorKind::Gnss | SensorKind::Pseudorange | SensorKind::Prior => Ok(Increment::default()),
    }
}

/// Attaches the measurements of `kind` with `previous < t <= now` to the
/// states at `now`.
pub fn measure(
    kind: SensorKind,
    ctx: &ModelContext<'_>,
    previous: Timestamp,
    now: Timestamp,
) -> Result<Increment, Error> {
    match kind {
        SensorKind::Gnss => gnss::measure_fixes(ctx, previous, now),
        SensorKind::Pseudorange => gnss::measure_pseudoranges(ctx, previous, now),
        SensorKind::Imu | SensorKind::Odometry | SensorKind::Prior => Ok(Increment::default()),
    }
}

/// Absolute prior on the position at `now`, with the configured height in
/// place of the vertical component.
pub fn position_prior(ctx: &ModelContext<'_>, now: Timestamp) -> Result<Increment, Error> {
    let mut mean = ctx.mean(StateName::Position, now)?.clone();
    mean[2] = ctx.config.prior.height;

    let factor = Factor::new(
        FactorKind::Prior { mean },
        vec![StateId::new(StateName::Position, now)],
        GaussianNoise::from_sqrt_information_diagonal(&ctx.config.prior.sqrt_information)?,
    )?;
    Ok(Increment {
        states: Vec::new(),
        factors: vec![factor],
    })
}

/// Mean of the newest `name` state at or before `timestamp`, or zeros.
pub(crate) fn latest_or_zero(
    trajectory: &Trajectory,
    name: StateName,
    timestamp: Timestamp,
) -> DVector<f64> {
    trajectory
        .latest_at_or_before(name, timestamp)
        .map(|state| state.mean().clone())
        .unwrap_or_else(|| DVector::zeros(name.dim()))
}

pub(crate) fn vec3(value: &DVector<f64>) -> Vector3<f64> {
    Vector3::new(value[0], value[1], value[2])
}

pub(crate) fn dvec(value: &Vector3<f64>) -> DVector<f64> {
    DVector::from_column_slice(value.as_slice())
}
