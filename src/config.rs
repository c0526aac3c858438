use crate::{error::Error, factor::RobustLoss, measurement::SensorKind, solver::SolverConfig};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Settings shared by every sensor stream.
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SensorConfig {
    pub active: bool,
    pub loss: RobustLoss,
    /// Bucket length in seconds the stream is down-sampled to before the run.
    pub resample: Option<f64>,
}

impl SensorConfig {
    pub fn enabled() -> Self {
        Self {
            active: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ImuConfig {
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub sensor: SensorConfig,
    /// Local gravity magnitude in m/s².
    pub gravity: f64,
    /// Accelerometer standard deviation used when samples carry none.
    pub accel_noise: f64,
    /// Bias random walk in units per √s.
    pub bias_random_walk: f64,
    pub bias_prior_std: f64,
    /// Standard deviation of the zero-velocity prior at start-up.
    pub velocity_prior_std: f64,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            sensor: SensorConfig::default(),
            gravity: 9.81,
            accel_noise: 0.1,
            bias_random_walk: 1e-3,
            bias_prior_std: 0.1,
            velocity_prior_std: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OdometryConfig {
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub sensor: SensorConfig,
    /// Standard deviation of the heading prior anchoring an odometry chain.
    pub yaw_prior_std: f64,
    /// Velocity and yaw-rate standard deviations used when no sample
    /// covers an interval.
    pub fallback_std: [f64; 4],
}

impl Default for OdometryConfig {
    fn default() -> Self {
        Self {
            sensor: SensorConfig::default(),
            yaw_prior_std: 0.1,
            fallback_std: [1.0, 1.0, 1.0, 0.1],
        }
    }
}

/// A synthetic absolute prior on the first position.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PriorConfig {
    pub active: bool,
    /// Replaces the vertical component of the prior mean.
    pub height: f64,
    /// Diagonal of the square-root information matrix.
    pub sqrt_information: [f64; 3],
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            active: false,
            height: 0.0,
            sqrt_information: [1.0, 1.0, 1.0],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct InitConfig {
    /// GNSS fixes within this many seconds of the first one define the anchor.
    pub gnss_window: f64,
    /// IMU samples within this many seconds of the start estimate the biases.
    pub imu_window: f64,
    /// Standard deviation of the origin prior used when no anchor exists.
    pub origin_std: f64,
    /// Window of the one-off freeze following an origin prior.
    pub origin_freeze: f64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            gnss_window: 0.1,
            imu_window: 2.0,
            origin_std: 1.0,
            origin_freeze: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FactorGraphConfig {
    pub gnss: SensorConfig,
    pub pseudorange: SensorConfig,
    pub imu: ImuConfig,
    pub odometry: OdometryConfig,
    pub prior: PriorConfig,
    pub init: InitConfig,
    pub solver: SolverConfig,
    /// States older than `now - window` are frozen before each solve.
    pub window: Option<f64>,
    /// Upper bound on the step between two processed timestamps.
    pub prediction_tick: Option<f64>,
    /// A full solve is forced whenever the run crosses a multiple of this
    /// many seconds.
    pub full_solve_period: f64,
}

impl Default for FactorGraphConfig {
    fn default() -> Self {
        Self {
            gnss: SensorConfig::enabled(),
            pseudorange: SensorConfig::default(),
            imu: ImuConfig::default(),
            odometry: OdometryConfig::default(),
            prior: PriorConfig::default(),
            init: InitConfig::default(),
            solver: SolverConfig::default(),
            window: None,
            prediction_tick: None,
            full_solve_period: 60.0,
        }
    }
}

impl FactorGraphConfig {
    fn sensor(&self, kind: SensorKind) -> Option<&SensorConfig> {
        match kind {
            SensorKind::Gnss => Some(&self.gnss),
            SensorKind::Pseudorange => Some(&self.pseudorange),
            SensorKind::Imu => Some(&self.imu.sensor),
            SensorKind::Odometry => Some(&self.odometry.sensor),
            SensorKind::Prior => None,
        }
    }

    pub fn is_active(&self, kind: SensorKind) -> bool {
        match kind {
            SensorKind::Prior => self.prior.active,
            kind => self.sensor(kind).is_some_and(|s| s.active),
        }
    }

    /// Sensor streams that are read from the measurement source, in
    /// processing order. Motion kinds come first.
    pub fn active_kinds(&self) -> Vec<SensorKind> {
        [
            SensorKind::Imu,
            SensorKind::Odometry,
            SensorKind::Gnss,
            SensorKind::Pseudorange,
        ]
        .into_iter()
        .filter(|kind| self.is_active(*kind))
        .collect()
    }

    pub fn loss(&self, kind: SensorKind) -> RobustLoss {
        self.sensor(kind).map(|s| s.loss).unwrap_or_default()
    }

    pub fn resample_bucket(&self, kind: SensorKind) -> Option<f64> {
        self.sensor(kind).and_then(|s| s.resample)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.active_kinds().is_empty() {
            return Err(Error::Config("no sensor stream is active".into()));
        }
        let positive = [
            ("window", self.window),
            ("prediction_tick", self.prediction_tick),
            ("full_solve_period", Some(self.full_solve_period)),
            ("init.gnss_window", Some(self.init.gnss_window)),
            ("init.imu_window", Some(self.init.imu_window)),
            ("init.origin_std", Some(self.init.origin_std)),
            ("imu.gravity", Some(self.imu.gravity)),
            ("imu.accel_noise", Some(self.imu.accel_noise)),
            ("imu.bias_random_walk", Some(self.imu.bias_random_walk)),
            ("imu.bias_prior_std", Some(self.imu.bias_prior_std)),
            ("imu.velocity_prior_std", Some(self.imu.velocity_prior_std)),
            ("odometry.yaw_prior_std", Some(self.odometry.yaw_prior_std)),
        ];
        for (name, value) in positive {
            if let Some(value) = value
                && !(value > 0.0 && value.is_finite())
            {
                return Err(Error::Config(format!("{name} must be positive, got {value}")));
            }
        }
        for kind in SensorKind::ALL {
            if let Some(bucket) = self.resample_bucket(kind)
                && !(bucket > 0.0)
            {
                return Err(Error::Config(format!(
                    "{kind} resample bucket must be positive, got {bucket}"
                )));
            }
        }
        if self.odometry.fallback_std.iter().any(|s| !(*s > 0.0)) {
            return Err(Error::Config("odometry.fallback_std must be positive".into()));
        }
        if self.prior.active && self.prior.sqrt_information.iter().any(|w| !(*w > 0.0)) {
            return Err(Error::Config("prior.sqrt_information must be positive".into()));
        }
        Ok(())
    }
}
