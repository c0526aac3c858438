//! Residual terms of the estimation problem.
//!
//! Every factor evaluates to a whitened residual and one Jacobian block per
//! connected state. Robust losses are applied on top of the whitened
//! residual by the solver through iteratively re-weighted least squares.

use crate::{
    error::Error,
    state::{StateId, StateName},
};
use nalgebra::{Cholesky, DMatrix, DVector, Matrix3, Vector3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Robust loss applied to the squared norm of a whitened residual.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum RobustLoss {
    #[default]
    None,
    Huber {
        scale: f64,
    },
    Cauchy {
        scale: f64,
    },
}

impl RobustLoss {
    /// Returns the loss `rho(r^2)` and the IRLS weight for a squared residual.
    pub fn rho_and_weight(self, r2: f64) -> (f64, f64) {
        match self {
            RobustLoss::None => (r2, 1.0),
            RobustLoss::Huber { scale } => {
                let r = r2.sqrt();
                if r <= scale {
                    (r2, 1.0)
                } else {
                    (2.0 * scale * r - scale * scale, scale / r)
                }
            }
            RobustLoss::Cauchy { scale } => {
                let c2 = scale * scale;
                let t = r2 / c2;
                (c2 * (1.0 + t).ln(), 1.0 / (1.0 + t))
            }
        }
    }
}

/// Gaussian noise stored as an upper-triangular square root of the
/// information matrix, so that `‖S r‖²` is the Mahalanobis norm of `r`.
#[derive(Clone, Debug, PartialEq)]
pub struct GaussianNoise {
    sqrt_information: DMatrix<f64>,
}

impl GaussianNoise {
    pub fn from_covariance(covariance: &DMatrix<f64>) -> Result<Self, Error> {
        let singular = || {
            let (rows, cols) = covariance.shape();
            Error::SingularCovariance(format!("{rows}x{cols} noise model"))
        };
        let information = covariance.clone().try_inverse().ok_or_else(singular)?;
        let cholesky = Cholesky::new(information).ok_or_else(singular)?;
        Ok(Self {
            sqrt_information: cholesky.l().transpose(),
        })
    }

    pub fn from_std_devs(std_devs: &[f64]) -> Result<Self, Error> {
        if std_devs.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return Err(Error::SingularCovariance(format!(
                "standard deviations {std_devs:?}"
            )));
        }
        Self::from_sqrt_information_diagonal(&std_devs.iter().map(|s| 1.0 / s).collect::<Vec<_>>())
    }

    /// Isotropic noise of dimension `dim`.
    pub fn isotropic(dim: usize, std_dev: f64) -> Result<Self, Error> {
        Self::from_std_devs(&vec![std_dev; dim])
    }

    pub fn from_sqrt_information_diagonal(diagonal: &[f64]) -> Result<Self, Error> {
        if diagonal.iter().any(|w| !(*w > 0.0) || !w.is_finite()) {
            return Err(Error::SingularCovariance(format!(
                "square-root information {diagonal:?}"
            )));
        }
        Ok(Self {
            sqrt_information: DMatrix::from_diagonal(&DVector::from_column_slice(diagonal)),
        })
    }

    pub fn dim(&self) -> usize {
        self.sqrt_information.nrows()
    }

    pub fn sqrt_information(&self) -> &DMatrix<f64> {
        &self.sqrt_information
    }
}

/// The closed set of constraint types the estimator understands.
#[derive(Clone, Debug, PartialEq)]
pub enum FactorKind {
    /// Absolute prior on a single state of any kind.
    Prior { mean: DVector<f64> },
    /// GNSS position fix, already expressed in the working frame.
    Gnss { mean: DVector<f64> },
    /// Range to a satellite plus receiver clock offset.
    Pseudorange { range: f64, satellite: Vector3<f64> },
    /// Body-frame velocity and yaw rate held over `dt`.
    Odometry {
        velocity: Vector3<f64>,
        yaw_rate: f64,
        dt: f64,
    },
    /// Mean specific force over `dt`, resolved in the working frame.
    Imu {
        specific_force: Vector3<f64>,
        gravity: f64,
        dt: f64,
    },
}

impl FactorKind {
    /// States the factor expects, in order. `None` for single-state priors,
    /// which accept any state name.
    pub fn layout(&self) -> Option<&'static [StateName]> {
        use StateName::*;
        match self {
            FactorKind::Prior { .. } => None,
            FactorKind::Gnss { .. } => Some(&[Position]),
            FactorKind::Pseudorange { .. } => Some(&[Position, ClockBias]),
            FactorKind::Odometry { .. } => Some(&[Position, Yaw, Position, Yaw]),
            FactorKind::Imu { .. } => {
                Some(&[Position, Velocity, ImuBias, Position, Velocity, ImuBias])
            }
        }
    }

    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::Prior { mean } | FactorKind::Gnss { mean } => mean.len(),
            FactorKind::Pseudorange { .. } => 1,
            FactorKind::Odometry { .. } => 4,
            FactorKind::Imu { .. } => 12,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FactorKind::Prior { .. } => "prior",
            FactorKind::Gnss { .. } => "gnss",
            FactorKind::Pseudorange { .. } => "pseudorange",
            FactorKind::Odometry { .. } => "odometry",
            FactorKind::Imu { .. } => "imu",
        }
    }
}

/// Whitened residual and per-state Jacobian blocks at a linearization point.
#[derive(Clone, Debug)]
pub struct Linearization {
    pub residual: DVector<f64>,
    pub jacobians: Vec<DMatrix<f64>>,
}

/// A constraint over one or more states.
#[derive(Clone, Debug)]
pub struct Factor {
    kind: FactorKind,
    states: Vec<StateId>,
    noise: GaussianNoise,
    loss: RobustLoss,
}

impl Factor {
    pub fn new(
        kind: FactorKind,
        states: Vec<StateId>,
        noise: GaussianNoise,
    ) -> Result<Self, Error> {
        if noise.dim() != kind.residual_dim() {
            return Err(Error::DimensionMismatch {
                what: format!("{} noise model", kind.label()),
                expected: kind.residual_dim(),
                actual: noise.dim(),
            });
        }

        let expected = kind.layout().map_or(1, <[StateName]>::len);
        if states.len() != expected {
            return Err(Error::DimensionMismatch {
                what: format!("{} state count", kind.label()),
                expected,
                actual: states.len(),
            });
        }

        if let Some(layout) = kind.layout()
            && let Some((want, got)) = layout
                .iter()
                .zip(&states)
                .find(|(want, got)| **want != got.name)
        {
            return Err(Error::MalformedFactor(format!(
                "{} factor expects {want} but was given {got}",
                kind.label()
            )));
        }

        if let FactorKind::Prior { mean } = &kind
            && mean.len() != states[0].name.dim()
        {
            return Err(Error::DimensionMismatch {
                what: format!("prior on {}", states[0].name),
                expected: states[0].name.dim(),
                actual: mean.len(),
            });
        }

        Ok(Self {
            kind,
            states,
            noise,
            loss: RobustLoss::None,
        })
    }

    pub fn with_loss(mut self, loss: RobustLoss) -> Self {
        self.loss = loss;
        self
    }

    pub fn kind(&self) -> &FactorKind {
        &self.kind
    }

    pub fn states(&self) -> &[StateId] {
        &self.states
    }

    pub fn loss(&self) -> RobustLoss {
        self.loss
    }

    /// Evaluates the whitened residual at `values`, given in the order of
    /// [`Factor::states`].
    pub fn linearize(&self, values: &[&DVector<f64>]) -> Linearization {
        let (residual, jacobians) = self.raw(values);
        let sqrt_information = self.noise.sqrt_information();
        Linearization {
            residual: sqrt_information * residual,
            jacobians: jacobians.iter().map(|j| sqrt_information * j).collect(),
        }
    }

    fn raw(&self, values: &[&DVector<f64>]) -> (DVector<f64>, Vec<DMatrix<f64>>) {
        match &self.kind {
            FactorKind::Prior { mean } | FactorKind::Gnss { mean } => {
                (values[0] - mean, vec![DMatrix::identity(mean.len(), mean.len())])
            }
            FactorKind::Pseudorange { range, satellite } => {
                let offset = vec3(values[0]) - satellite;
                let distance = offset.norm();
                let direction = if distance > 0.0 {
                    offset / distance
                } else {
                    Vector3::zeros()
                };
                (
                    DVector::from_element(1, distance + values[1][0] - range),
                    vec![
                        DMatrix::from_row_slice(1, 3, direction.as_slice()),
                        DMatrix::from_element(1, 1, 1.0),
                    ],
                )
            }
            FactorKind::Odometry {
                velocity,
                yaw_rate,
                dt,
            } => {
                let (p_i, yaw_i, p_j, yaw_j) =
                    (vec3(values[0]), values[1][0], vec3(values[2]), values[3][0]);
                let delta = yaw_rotation(yaw_i) * velocity * *dt;
                let delta_dyaw = yaw_rotation_derivative(yaw_i) * velocity * *dt;

                let mut residual = DVector::zeros(4);
                residual
                    .fixed_rows_mut::<3>(0)
                    .copy_from(&(p_j - p_i - delta));
                residual[3] = yaw_j - yaw_i - yaw_rate * dt;

                let mut d_p_i = DMatrix::zeros(4, 3);
                d_p_i.view_mut((0, 0), (3, 3)).fill_with_identity();
                d_p_i *= -1.0;
                let mut d_yaw_i = DMatrix::zeros(4, 1);
                d_yaw_i.view_mut((0, 0), (3, 1)).copy_from(&(-delta_dyaw));
                d_yaw_i[(3, 0)] = -1.0;
                let mut d_p_j = DMatrix::zeros(4, 3);
                d_p_j.view_mut((0, 0), (3, 3)).fill_with_identity();
                let mut d_yaw_j = DMatrix::zeros(4, 1);
                d_yaw_j[(3, 0)] = 1.0;

                (residual, vec![d_p_i, d_yaw_i, d_p_j, d_yaw_j])
            }
            FactorKind::Imu {
                specific_force,
                gravity,
                dt,
            } => {
                let (p_i, v_i, b_i) = (vec3(values[0]), vec3(values[1]), values[2]);
                let (p_j, v_j, b_j) = (vec3(values[3]), vec3(values[4]), values[5]);
                let accel_bias = Vector3::new(b_i[0], b_i[1], b_i[2]);
                let acceleration = specific_force - accel_bias - Vector3::new(0.0, 0.0, *gravity);

                let mut residual = DVector::zeros(12);
                residual
                    .fixed_rows_mut::<3>(0)
                    .copy_from(&(p_j - p_i - v_i * *dt - acceleration * (0.5 * dt * dt)));
                residual
                    .fixed_rows_mut::<3>(3)
                    .copy_from(&(v_j - v_i - acceleration * *dt));
                residual.rows_mut(6, 6).copy_from(&(b_j - b_i));

                let identity = Matrix3::<f64>::identity();
                let mut d_p_i = DMatrix::zeros(12, 3);
                d_p_i.view_mut((0, 0), (3, 3)).copy_from(&(-identity));
                let mut d_v_i = DMatrix::zeros(12, 3);
                d_v_i.view_mut((0, 0), (3, 3)).copy_from(&(-identity * *dt));
                d_v_i.view_mut((3, 0), (3, 3)).copy_from(&(-identity));
                let mut d_b_i = DMatrix::zeros(12, 6);
                d_b_i.view_mut((0, 0), (3, 3)).copy_from(&(identity * (0.5 * dt * dt)));
                d_b_i.view_mut((3, 0), (3, 3)).copy_from(&(identity * *dt));
                d_b_i.view_mut((6, 0), (6, 6)).copy_from(&(-DMatrix::<f64>::identity(6, 6)));
                let mut d_p_j = DMatrix::zeros(12, 3);
                d_p_j.view_mut((0, 0), (3, 3)).copy_from(&identity);
                let mut d_v_j = DMatrix::zeros(12, 3);
                d_v_j.view_mut((3, 0), (3, 3)).copy_from(&identity);
                let mut d_b_j = DMatrix::zeros(12, 6);
                d_b_j.view_mut((6, 0), (6, 6)).fill_with_identity();

                (residual, vec![d_p_i, d_v_i, d_b_i, d_p_j, d_v_j, d_b_j])
            }
        }
    }
}

fn vec3(value: &DVector<f64>) -> Vector3<f64> {
    Vector3::new(value[0], value[1], value[2])
}

/// Rotation about the up axis, yaw counter-clockwise from east.
pub(crate) fn yaw_rotation(yaw: f64) -> Matrix3<f64> {
    let (s, c) = yaw.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

fn yaw_rotation_derivative(yaw: f64) -> Matrix3<f64> {
    let (s, c) = yaw.sin_cos();
    Matrix3::new(-s, -c, 0.0, c, -s, 0.0, 0.0, 0.0, 0.0)
}
