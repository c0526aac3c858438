//! Position fixes and pseudoranges.
//!
//! Fixes arrive in ECEF and are rotated into the working frame together with
//! their covariance. Pseudoranges carry the satellite ECEF position as
//! auxiliary data and constrain the position and a per-epoch clock bias.

use super::{Increment, ModelContext, dvec, latest_or_zero, vec3};
use crate::{
    config::FactorGraphConfig,
    error::Error,
    factor::{Factor, FactorKind, GaussianNoise},
    measurement::{Measurement, MeasurementSet, SensorKind, Timestamp},
    state::{StateId, StateName},
};
use nalgebra::{DMatrix, DVector, Matrix4, Vector3, Vector4};
use tracing::debug;

const POINT_SOLUTION_ITERATIONS: usize = 20;

pub(crate) fn measure_fixes(
    ctx: &ModelContext<'_>,
    previous: Timestamp,
    now: Timestamp,
) -> Result<Increment, Error> {
    let mut increment = Increment::default();
    let position = StateId::new(StateName::Position, now);
    let rotation = ctx
        .frame
        .map(|frame| DMatrix::from_column_slice(3, 3, frame.rotation_to_local().as_slice()));

    for fix in ctx.measurements.between(SensorKind::Gnss, previous, now) {
        let local = ctx.to_working(&vec3(fix.mean()));
        increment.seed(ctx.trajectory, position, || dvec(&local));

        let covariance = match &rotation {
            Some(rotation) => rotation * fix.covariance() * rotation.transpose(),
            None => fix.covariance().clone(),
        };
        let factor = Factor::new(
            FactorKind::Gnss { mean: dvec(&local) },
            vec![position],
            GaussianNoise::from_covariance(&covariance)?,
        )?
        .with_loss(ctx.config.loss(SensorKind::Gnss));
        increment.factors.push(factor);
    }

    Ok(increment)
}

pub(crate) fn measure_pseudoranges(
    ctx: &ModelContext<'_>,
    previous: Timestamp,
    now: Timestamp,
) -> Result<Increment, Error> {
    let epoch = ctx.measurements.between(SensorKind::Pseudorange, previous, now);
    let mut increment = Increment::default();
    if epoch.is_empty() {
        return Ok(increment);
    }

    let position = StateId::new(StateName::Position, now);
    let clock = StateId::new(StateName::ClockBias, now);
    let p = match ctx.trajectory.latest_at_or_before(StateName::Position, now) {
        Some(state) => vec3(state.mean()),
        None => point_solution(epoch)
            .map(|global| ctx.to_working(&global))
            .unwrap_or_else(Vector3::zeros),
    };
    increment.seed(ctx.trajectory, position, || dvec(&p));

    let satellites = epoch
        .iter()
        .map(|m| satellite(m).map(|s| ctx.to_working(&s)))
        .collect::<Result<Vec<_>, _>>()?;
    increment.seed(ctx.trajectory, clock, || {
        if ctx.trajectory.states(StateName::ClockBias).next().is_some() {
            return latest_or_zero(ctx.trajectory, StateName::ClockBias, now);
        }
        let mean_offset = epoch
            .iter()
            .zip(&satellites)
            .map(|(m, s)| m.mean()[0] - (p - s).norm())
            .sum::<f64>()
            / epoch.len() as f64;
        DVector::from_element(1, mean_offset)
    });

    for (measurement, satellite) in epoch.iter().zip(satellites) {
        let factor = Factor::new(
            FactorKind::Pseudorange {
                range: measurement.mean()[0],
                satellite,
            },
            vec![position, clock],
            GaussianNoise::from_covariance(measurement.covariance())?,
        )?
        .with_loss(ctx.config.loss(SensorKind::Pseudorange));
        increment.factors.push(factor);
    }

    Ok(increment)
}

fn satellite(measurement: &Measurement) -> Result<Vector3<f64>, Error> {
    let aux = measurement.aux();
    if aux.len() != 3 {
        return Err(Error::DimensionMismatch {
            what: format!("satellite position of pseudorange at t={}", measurement.timestamp()),
            expected: 3,
            actual: aux.len(),
        });
    }
    Ok(vec3(aux))
}

/// Single-epoch least-squares receiver position in ECEF, started from the
/// earth's center. Needs at least four satellites.
pub fn point_solution(epoch: &[Measurement]) -> Option<Vector3<f64>> {
    if epoch.len() < 4 {
        return None;
    }
    let satellites: Vec<Vector3<f64>> = epoch.iter().map(satellite).collect::<Result<_, _>>().ok()?;

    let mut x = Vector4::<f64>::zeros();
    for _ in 0..POINT_SOLUTION_ITERATIONS {
        let receiver = x.fixed_rows::<3>(0).into_owned();
        let mut normal = Matrix4::<f64>::zeros();
        let mut rhs = Vector4::<f64>::zeros();
        for (measurement, satellite) in epoch.iter().zip(&satellites) {
            let offset = receiver - satellite;
            let distance = offset.norm();
            if distance == 0.0 {
                return None;
            }
            let row = Vector4::new(
                offset.x / distance,
                offset.y / distance,
                offset.z / distance,
                1.0,
            );
            let residual = measurement.mean()[0] - (distance + x[3]);
            normal += row * row.transpose();
            rhs += row * residual;
        }

        let step = normal.try_inverse()? * rhs;
        x += step;
        if step.norm() < 1e-4 {
            break;
        }
    }

    x.iter().all(|v| v.is_finite()).then(|| x.fixed_rows::<3>(0).into_owned())
}

/// ECEF anchor for the tangent plane: the mean of the fixes within the
/// initial window, or a pseudorange point solution when only ranges are
/// available.
pub fn initial_anchor(
    measurements: &MeasurementSet,
    config: &FactorGraphConfig,
) -> Option<Vector3<f64>> {
    if config.gnss.active
        && let Ok(first) = measurements.first_timestamp(SensorKind::Gnss)
    {
        let fixes = measurements.window(SensorKind::Gnss, first, first + config.init.gnss_window);
        let sum = fixes
            .iter()
            .fold(Vector3::zeros(), |sum, fix| sum + vec3(fix.mean()));
        debug!(fixes = fixes.len(), "anchoring on averaged fixes");
        return Some(sum / fixes.len() as f64);
    }

    if config.pseudorange.active
        && let Ok(first) = measurements.first_timestamp(SensorKind::Pseudorange)
    {
        let until = first + config.init.gnss_window;
        let epoch = measurements.window(SensorKind::Pseudorange, first, until);
        let anchor = point_solution(epoch);
        debug!(ranges = epoch.len(), solved = anchor.is_some(), "anchoring on point solution");
        return anchor;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame::TangentPlaneConverter, state::Trajectory};
    use approx::assert_relative_eq;

    const RECEIVER: [f64; 3] = [1_130_000.0, -4_720_000.0, 4_420_000.0];

    fn satellites() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(15_600_000.0, 7_540_000.0, 20_140_000.0),
            Vector3::new(18_760_000.0, 2_750_000.0, 18_610_000.0),
            Vector3::new(17_610_000.0, 14_630_000.0, 13_480_000.0),
            Vector3::new(19_170_000.0, 610_000.0, 18_390_000.0),
            Vector3::new(-5_000_000.0, -20_000_000.0, 16_000_000.0),
        ]
    }

    fn epoch(t: f64, clock: f64) -> Vec<Measurement> {
        let receiver = Vector3::from(RECEIVER);
        satellites()
            .into_iter()
            .map(|s| {
                let range = (receiver - s).norm() + clock;
                Measurement::from_std_devs(SensorKind::Pseudorange, t, &[range], &[5.0])
                    .unwrap()
                    .with_aux(dvec(&s))
            })
            .collect()
    }

    #[test]
    fn point_solution_recovers_receiver() {
        let solution = point_solution(&epoch(0.0, 300.0)).unwrap();
        assert_relative_eq!(solution, Vector3::from(RECEIVER), epsilon = 1e-3);
    }

    #[test]
    fn point_solution_needs_four_satellites() {
        assert!(point_solution(&epoch(0.0, 0.0)[..3]).is_none());
    }

    #[test]
    fn anchor_averages_initial_window() {
        let fix = |t: f64, x: f64| {
            Measurement::from_std_devs(SensorKind::Gnss, t, &[x, 0.0, 0.0], &[1.0; 3]).unwrap()
        };
        let set: MeasurementSet = [fix(0.0, 1.0), fix(0.05, 3.0), fix(0.5, 100.0)]
            .into_iter()
            .collect();
        let anchor = initial_anchor(&set, &FactorGraphConfig::default()).unwrap();
        assert_relative_eq!(anchor, Vector3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn pseudoranges_share_position_and_clock() {
        let set: MeasurementSet = epoch(1.0, 300.0).into_iter().collect();
        let mut config = FactorGraphConfig::default();
        config.pseudorange.active = true;
        let frame = TangentPlaneConverter::from_ecef(&Vector3::from(RECEIVER));
        let trajectory = Trajectory::new();
        let ctx = ModelContext {
            trajectory: &trajectory,
            measurements: &set,
            config: &config,
            frame: Some(&frame),
        };

        let increment = measure_pseudoranges(&ctx, 0.0, 1.0).unwrap();
        assert_eq!(increment.states.len(), 2);
        assert_eq!(increment.factors.len(), 5);
        let (_, clock) = &increment.states[1];
        assert_relative_eq!(clock[0], 300.0, epsilon = 1.0);
    }
}
