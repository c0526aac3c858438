use crate::{
    config::FactorGraphConfig,
    error::Error,
    factor::{Factor, FactorKind, GaussianNoise},
    frame::TangentPlaneConverter,
    graph::FactorGraph,
    measurement::{MeasurementSet, Timestamp},
    model::{gnss, imu, odometry},
    state::{StateId, StateName},
};
use nalgebra::DVector;
use tracing::info;
use uom::si::angle::degree;

/// Bootstraps `graph` at `start` and returns the tangent-plane anchor, if
/// the active sensors provide one.
///
/// GNSS (fixes or pseudoranges) anchors the frame and seeds the first
/// position at the local origin. An IMU is calibrated on its initial window;
/// odometry on its own only receives a heading prior. Without an anchor the
/// first position is pinned to the origin and everything before `start` is
/// frozen.
pub fn initialize(
    graph: &mut FactorGraph,
    measurements: &MeasurementSet,
    config: &FactorGraphConfig,
    start: Timestamp,
) -> Result<Option<TangentPlaneConverter>, Error> {
    let frame = gnss::initial_anchor(measurements, config)
        .map(|anchor| TangentPlaneConverter::from_ecef(&anchor));
    if let Some(frame) = &frame {
        info!(
            latitude = frame.anchor().latitude().get::<degree>(),
            longitude = frame.anchor().longitude().get::<degree>(),
            "anchored tangent plane"
        );
        graph.add_state(StateId::new(StateName::Position, start), DVector::zeros(3))?;
    }

    if config.imu.sensor.active {
        graph.apply(imu::initialize(measurements, config, start)?)?;
        info!("calibrated inertial biases");
    } else if config.odometry.sensor.active {
        graph.apply(odometry::orientation_prior(start, config.odometry.yaw_prior_std)?)?;
    }

    if frame.is_none() {
        let origin = StateId::new(StateName::Position, start);
        graph.add_state(origin, DVector::zeros(3))?;
        graph.add_factor(Factor::new(
            FactorKind::Prior {
                mean: DVector::zeros(3),
            },
            vec![origin],
            GaussianNoise::isotropic(3, config.init.origin_std)?,
        )?)?;
        graph.freeze(config.init.origin_freeze, start);
        info!("no anchor available, pinned the origin");
    }

    Ok(frame)
}
