use crate::state::{StateName, Trajectory};
use nalgebra::{DVector, Matrix3, Vector3};
use sguaba::{
    Coordinate,
    math::RigidBodyTransform,
    system,
    systems::{Ecef, Wgs84},
};
use uom::si::{f64::Length, length::meter};

system!(pub struct LocalEnu using ENU);

/// Maps positions between the earth-centered (ECEF) frame and an
/// East-North-Up tangent plane anchored at a fixed point.
///
/// The anchor is chosen once at construction and never moves, so every
/// local position produced during a run shares the same origin.
#[derive(Clone, Debug)]
pub struct TangentPlaneConverter {
    anchor: Wgs84,
}

impl TangentPlaneConverter {
    pub fn from_wgs84(anchor: Wgs84) -> Self {
        Self { anchor }
    }

    /// Anchors the tangent plane at an ECEF position given in meters.
    pub fn from_ecef(anchor: &Vector3<f64>) -> Self {
        Self::from_wgs84(ecef_coordinate(anchor).to_wgs84())
    }

    pub fn anchor(&self) -> &Wgs84 {
        &self.anchor
    }

    fn ecef_to_local(&self) -> RigidBodyTransform<Ecef, LocalEnu> {
        // SAFETY: LocalEnu is only ever used with its origin at `self.anchor`.
        unsafe { RigidBodyTransform::ecef_to_enu_at(&self.anchor) }
    }

    /// ECEF meters to local east, north, up meters.
    pub fn to_local(&self, global: &Vector3<f64>) -> Vector3<f64> {
        let local = self.ecef_to_local().transform(ecef_coordinate(global));
        to_vector(local.to_cartesian())
    }

    /// Local east, north, up meters to ECEF meters.
    pub fn to_global(&self, local: &Vector3<f64>) -> Vector3<f64> {
        let local = Coordinate::<LocalEnu>::builder()
            .enu_east(Length::new::<meter>(local.x))
            .enu_north(Length::new::<meter>(local.y))
            .enu_up(Length::new::<meter>(local.z))
            .build();
        to_vector(self.ecef_to_local().inverse().transform(local).to_cartesian())
    }

    /// Rotation taking ECEF offsets to local offsets, e.g. to carry a
    /// covariance into the tangent plane.
    pub fn rotation_to_local(&self) -> Matrix3<f64> {
        let origin = self.to_global(&Vector3::zeros());
        let base = self.to_local(&origin);
        Matrix3::from_columns(&[
            self.to_local(&(origin + Vector3::x())) - base,
            self.to_local(&(origin + Vector3::y())) - base,
            self.to_local(&(origin + Vector3::z())) - base,
        ])
    }

    /// Rewrites every `name` entry of `trajectory` from the local frame into
    /// the global frame.
    pub fn convert_all_to_global(&self, trajectory: &mut Trajectory, name: StateName) {
        trajectory.map_means(name, |mean| {
            let global = self.to_global(&Vector3::new(mean[0], mean[1], mean[2]));
            DVector::from_column_slice(global.as_slice())
        });
    }
}

/// ECEF position in meters of a geodetic point.
pub fn wgs84_to_ecef(position: &Wgs84) -> Vector3<f64> {
    to_vector(Coordinate::<Ecef>::from_wgs84(position).to_cartesian())
}

fn ecef_coordinate(position: &Vector3<f64>) -> Coordinate<Ecef> {
    Coordinate::<Ecef>::builder()
        .x(Length::new::<meter>(position.x))
        .y(Length::new::<meter>(position.y))
        .z(Length::new::<meter>(position.z))
        .build()
}

fn to_vector(cartesian: [Length; 3]) -> Vector3<f64> {
    let [x, y, z] = cartesian;
    Vector3::new(x.get::<meter>(), y.get::<meter>(), z.get::<meter>())
}
