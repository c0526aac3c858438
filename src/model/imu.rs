//! Inertial propagation.
//!
//! Specific force samples are expressed in the working frame and averaged
//! over each step. Position, velocity and bias at both ends of the step are
//! linked by a constant-acceleration model; the biases follow a random walk.

use super::{Increment, ModelContext, dvec, vec3};
use crate::{
    config::{FactorGraphConfig, ImuConfig},
    error::Error,
    factor::{Factor, FactorKind, GaussianNoise},
    measurement::{Measurement, MeasurementSet, SensorKind, Timestamp},
    state::{StateId, StateName},
};
use nalgebra::{DVector, Vector3};

pub(crate) fn predict(
    ctx: &ModelContext<'_>,
    previous: Timestamp,
    now: Timestamp,
) -> Result<Increment, Error> {
    let config = &ctx.config.imu;
    let p = vec3(ctx.mean(StateName::Position, previous)?);
    let v = vec3(ctx.mean(StateName::Velocity, previous)?);
    let bias = ctx.mean(StateName::ImuBias, previous)?.clone();

    let (specific_force, accel_std) = mean_specific_force(ctx.measurements, config, previous, now);
    let dt = now - previous;
    let acceleration = specific_force
        - Vector3::new(bias[0], bias[1], bias[2])
        - Vector3::new(0.0, 0.0, config.gravity);

    let mut increment = Increment::default();
    let ids = [StateName::Position, StateName::Velocity, StateName::ImuBias]
        .map(|name| StateId::new(name, now));
    increment.seed(ctx.trajectory, ids[0], || dvec(&(p + v * dt + acceleration * (0.5 * dt * dt))));
    increment.seed(ctx.trajectory, ids[1], || dvec(&(v + acceleration * dt)));
    increment.seed(ctx.trajectory, ids[2], || bias.clone());

    let mut std_devs = Vec::with_capacity(12);
    std_devs.extend(accel_std.iter().map(|s| 0.5 * s * dt * dt));
    std_devs.extend(accel_std.iter().map(|s| s * dt));
    std_devs.extend([config.bias_random_walk * dt.sqrt(); 6]);

    let factor = Factor::new(
        FactorKind::Imu {
            specific_force,
            gravity: config.gravity,
            dt,
        },
        vec![
            StateId::new(StateName::Position, previous),
            StateId::new(StateName::Velocity, previous),
            StateId::new(StateName::ImuBias, previous),
            ids[0],
            ids[1],
            ids[2],
        ],
        GaussianNoise::from_std_devs(&std_devs)?,
    )?
    .with_loss(config.sensor.loss);
    increment.factors.push(factor);

    Ok(increment)
}

/// Average specific force over `previous < t <= now` and its per-axis
/// standard deviation. Holds the last sample when the interval is empty and
/// assumes rest when there is none at all.
fn mean_specific_force(
    measurements: &MeasurementSet,
    config: &ImuConfig,
    previous: Timestamp,
    now: Timestamp,
) -> (Vector3<f64>, Vector3<f64>) {
    let samples = measurements.between(SensorKind::Imu, previous, now);
    let samples = match samples {
        [] => match measurements.latest_at_or_before(SensorKind::Imu, previous) {
            Some(last) => std::slice::from_ref(last),
            None => {
                return (
                    Vector3::new(0.0, 0.0, config.gravity),
                    Vector3::repeat(config.accel_noise),
                );
            }
        },
        samples => samples,
    };

    let count = samples.len() as f64;
    let force = samples.iter().map(|m| vec3(m.mean())).sum::<Vector3<f64>>() / count;
    let variance = samples
        .iter()
        .map(|m| {
            let covariance = m.covariance();
            Vector3::new(covariance[(0, 0)], covariance[(1, 1)], covariance[(2, 2)])
        })
        .sum::<Vector3<f64>>()
        / count;
    let std = variance.map(|v| if v > 0.0 { v.sqrt() } else { config.accel_noise });
    (force, std)
}

/// Stationary start-up: biases from the mean specific force and angular
/// rate over the initial window, plus zero-velocity and bias priors.
pub fn initialize(
    measurements: &MeasurementSet,
    config: &FactorGraphConfig,
    start: Timestamp,
) -> Result<Increment, Error> {
    let imu = &config.imu;
    let samples = measurements.window(SensorKind::Imu, start, start + config.init.imu_window);
    let bias = stationary_bias(samples, imu.gravity);

    let velocity = StateId::new(StateName::Velocity, start);
    let bias_id = StateId::new(StateName::ImuBias, start);
    let factors = vec![
        Factor::new(
            FactorKind::Prior {
                mean: DVector::zeros(3),
            },
            vec![velocity],
            GaussianNoise::isotropic(3, imu.velocity_prior_std)?,
        )?,
        Factor::new(
            FactorKind::Prior { mean: bias.clone() },
            vec![bias_id],
            GaussianNoise::isotropic(6, imu.bias_prior_std)?,
        )?,
    ];

    Ok(Increment {
        states: vec![(velocity, DVector::zeros(3)), (bias_id, bias)],
        factors,
    })
}

fn stationary_bias(samples: &[Measurement], gravity: f64) -> DVector<f64> {
    if samples.is_empty() {
        return DVector::zeros(6);
    }
    let mean = samples.iter().map(Measurement::mean).sum::<DVector<f64>>() / samples.len() as f64;
    let mut bias = mean;
    bias[2] -= gravity;
    bias
}
