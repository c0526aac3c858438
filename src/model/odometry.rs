use super::{Increment, ModelContext, dvec, vec3};
use crate::{
    error::Error,
    factor::{Factor, FactorKind, GaussianNoise, yaw_rotation},
    measurement::{SensorKind, Timestamp},
    state::{StateId, StateName},
};
use nalgebra::{DMatrix, DVector};

/// Dead-reckons position and heading from body velocity and yaw rate.
///
/// A heading without history is created at `previous` and pinned by a prior,
/// which anchors the chain when odometry runs alongside other sensors.
pub(crate) fn predict(
    ctx: &ModelContext<'_>,
    previous: Timestamp,
    now: Timestamp,
) -> Result<Increment, Error> {
    let config = &ctx.config.odometry;
    let p = vec3(ctx.mean(StateName::Position, previous)?);
    let mut increment = Increment::default();

    let yaw_previous = StateId::new(StateName::Yaw, previous);
    let yaw = match ctx.trajectory.key(StateName::Yaw, previous) {
        Some(key) => ctx.trajectory.get(key).mean()[0],
        None => {
            increment.append(orientation_prior(previous, config.yaw_prior_std)?);
            0.0
        }
    };

    let samples = ctx.measurements.between(SensorKind::Odometry, previous, now);
    let (mean, covariance) = match samples {
        [] => match ctx.measurements.latest_at_or_before(SensorKind::Odometry, previous) {
            Some(last) => (last.mean().clone(), last.covariance().clone()),
            None => {
                let variances = config.fallback_std.iter().map(|s| s * s);
                (
                    DVector::zeros(4),
                    DMatrix::from_diagonal(&DVector::from_iterator(4, variances)),
                )
            }
        },
        samples => {
            let count = samples.len() as f64;
            (
                samples.iter().map(|m| m.mean()).sum::<DVector<f64>>() / count,
                samples.iter().map(|m| m.covariance()).sum::<DMatrix<f64>>() / count,
            )
        }
    };

    let dt = now - previous;
    let velocity = vec3(&mean);
    let yaw_rate = mean[3];
    let rotation = yaw_rotation(yaw);

    increment.seed(ctx.trajectory, StateId::new(StateName::Position, now), || {
        dvec(&(p + rotation * velocity * dt))
    });
    increment.seed(ctx.trajectory, StateId::new(StateName::Yaw, now), || {
        DVector::from_element(1, yaw + yaw_rate * dt)
    });

    // Maps the velocity and yaw-rate noise onto the step residual.
    let mut jacobian = DMatrix::zeros(4, 4);
    jacobian
        .view_mut((0, 0), (3, 3))
        .copy_from(&(rotation * dt));
    jacobian[(3, 3)] = dt;
    let step_covariance = &jacobian * covariance * jacobian.transpose();

    let factor = Factor::new(
        FactorKind::Odometry {
            velocity,
            yaw_rate,
            dt,
        },
        vec![
            StateId::new(StateName::Position, previous),
            yaw_previous,
            StateId::new(StateName::Position, now),
            StateId::new(StateName::Yaw, now),
        ],
        GaussianNoise::from_covariance(&step_covariance)?,
    )?
    .with_loss(config.sensor.loss);
    increment.factors.push(factor);

    Ok(increment)
}

/// Heading state at `timestamp` held near zero.
pub fn orientation_prior(timestamp: Timestamp, std_dev: f64) -> Result<Increment, Error> {
    let yaw = StateId::new(StateName::Yaw, timestamp);
    Ok(Increment {
        states: vec![(yaw, DVector::zeros(1))],
        factors: vec![Factor::new(
            FactorKind::Prior {
                mean: DVector::zeros(1),
            },
            vec![yaw],
            GaussianNoise::isotropic(1, std_dev)?,
        )?],
    })
}
