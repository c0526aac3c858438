use crate::error::Error;
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// A point on the estimation timeline, in seconds.
pub type Timestamp = f64;

/// The sensor a [`Measurement`] originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SensorKind {
    /// A GNSS position fix in the global (ECEF) frame.
    Gnss,
    /// A single satellite pseudorange. The satellite's ECEF position is
    /// carried as auxiliary data.
    Pseudorange,
    /// Specific force and angular rate, both resolved in the local frame.
    Imu,
    /// Body-frame velocity and yaw rate.
    Odometry,
    /// An absolute prior on a state, synthesised from configuration.
    Prior,
}

impl SensorKind {
    pub const ALL: [SensorKind; 5] = [
        SensorKind::Gnss,
        SensorKind::Pseudorange,
        SensorKind::Imu,
        SensorKind::Odometry,
        SensorKind::Prior,
    ];

    /// Dimension of the mean vector a measurement of this kind carries.
    pub fn mean_dim(self) -> usize {
        match self {
            SensorKind::Gnss | SensorKind::Prior => 3,
            SensorKind::Pseudorange => 1,
            SensorKind::Imu => 6,
            SensorKind::Odometry => 4,
        }
    }

    /// Dimension of the auxiliary data vector.
    pub fn aux_dim(self) -> usize {
        match self {
            SensorKind::Pseudorange => 3,
            _ => 0,
        }
    }

    /// Whether this kind drives state propagation between timestamps.
    pub fn is_motion(self) -> bool {
        matches!(self, SensorKind::Imu | SensorKind::Odometry)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Gnss => "gnss",
            SensorKind::Pseudorange => "pseudorange",
            SensorKind::Imu => "imu",
            SensorKind::Odometry => "odometry",
            SensorKind::Prior => "prior",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown sensor kind `{s}`"))
    }
}

/// A timestamped observation with a Gaussian uncertainty.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    kind: SensorKind,
    timestamp: Timestamp,
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    aux: DVector<f64>,
    meta: Option<String>,
}

impl Measurement {
    /// Creates a measurement from a mean and a full covariance matrix.
    ///
    /// The timestamp and every entry of the mean and covariance must be
    /// finite.
    pub fn new(
        kind: SensorKind,
        timestamp: Timestamp,
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<Self, Error> {
        if covariance.nrows() != mean.len() || covariance.ncols() != mean.len() {
            return Err(Error::DimensionMismatch {
                what: format!("{kind} covariance"),
                expected: mean.len(),
                actual: covariance.nrows().max(covariance.ncols()),
            });
        }
        if !timestamp.is_finite() {
            return Err(Error::NonFinite(format!("{kind} timestamp")));
        }
        if mean.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return Err(Error::NonFinite(format!("{kind} at t={timestamp}")));
        }

        Ok(Self {
            kind,
            timestamp,
            mean,
            covariance,
            aux: DVector::zeros(0),
            meta: None,
        })
    }

    /// Creates a measurement with independent components.
    pub fn from_std_devs(
        kind: SensorKind,
        timestamp: Timestamp,
        mean: &[f64],
        std_devs: &[f64],
    ) -> Result<Self, Error> {
        if std_devs.len() != mean.len() {
            return Err(Error::DimensionMismatch {
                what: format!("{kind} standard deviations"),
                expected: mean.len(),
                actual: std_devs.len(),
            });
        }

        let variances = DVector::from_iterator(std_devs.len(), std_devs.iter().map(|s| s * s));
        Self::new(
            kind,
            timestamp,
            DVector::from_column_slice(mean),
            DMatrix::from_diagonal(&variances),
        )
    }

    pub fn with_aux(mut self, aux: DVector<f64>) -> Self {
        self.aux = aux;
        self
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn aux(&self) -> &DVector<f64> {
        &self.aux
    }

    pub fn meta(&self) -> Option<&str> {
        self.meta.as_deref()
    }

    /// Inverse of the covariance.
    pub fn information(&self) -> Result<DMatrix<f64>, Error> {
        self.covariance
            .clone()
            .try_inverse()
            .ok_or_else(|| {
                Error::SingularCovariance(format!("{} at t={}", self.kind, self.timestamp))
            })
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    pub(crate) fn set_mean(&mut self, mean: DVector<f64>) {
        self.mean = mean;
    }

    pub(crate) fn set_covariance(&mut self, covariance: DMatrix<f64>) {
        self.covariance = covariance;
    }
}

/// Time-ordered measurement sequences, one per sensor kind.
#[derive(Clone, Debug, Default)]
pub struct MeasurementSet {
    streams: BTreeMap<SensorKind, Vec<Measurement>>,
}

impl MeasurementSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `measurement` behind every measurement of its kind with an
    /// equal or earlier timestamp.
    pub fn push(&mut self, measurement: Measurement) {
        let stream = self.streams.entry(measurement.kind()).or_default();
        let at = stream.partition_point(|m| m.timestamp() <= measurement.timestamp());
        stream.insert(at, measurement);
    }

    pub fn is_empty(&self) -> bool {
        self.streams.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }

    pub fn stream(&self, kind: SensorKind) -> &[Measurement] {
        self.streams.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replaces the sequence of `kind`, e.g. with a resampled one.
    pub fn replace_stream(&mut self, kind: SensorKind, mut stream: Vec<Measurement>) {
        stream.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));
        self.streams.insert(kind, stream);
    }

    pub fn first_timestamp(&self, kind: SensorKind) -> Result<Timestamp, Error> {
        self.stream(kind)
            .first()
            .map(Measurement::timestamp)
            .ok_or(Error::NoMeasurements(kind))
    }

    pub fn last_timestamp(&self, kind: SensorKind) -> Result<Timestamp, Error> {
        self.stream(kind)
            .last()
            .map(Measurement::timestamp)
            .ok_or(Error::NoMeasurements(kind))
    }

    /// Measurements with `after < t <= until`.
    pub fn between(&self, kind: SensorKind, after: Timestamp, until: Timestamp) -> &[Measurement] {
        let stream = self.stream(kind);
        let start = stream.partition_point(|m| m.timestamp() <= after);
        let end = stream.partition_point(|m| m.timestamp() <= until);
        &stream[start..end.max(start)]
    }

    /// Measurements with `from <= t <= until`.
    pub fn window(&self, kind: SensorKind, from: Timestamp, until: Timestamp) -> &[Measurement] {
        let stream = self.stream(kind);
        let start = stream.partition_point(|m| m.timestamp() < from);
        let end = stream.partition_point(|m| m.timestamp() <= until);
        &stream[start..end.max(start)]
    }

    /// Earliest timestamp of `kind` strictly after `t`.
    pub fn next_timestamp_after(&self, kind: SensorKind, t: Timestamp) -> Option<Timestamp> {
        let stream = self.stream(kind);
        stream
            .get(stream.partition_point(|m| m.timestamp() <= t))
            .map(Measurement::timestamp)
    }

    /// Most recent measurement of `kind` at or before `t`.
    pub fn latest_at_or_before(&self, kind: SensorKind, t: Timestamp) -> Option<&Measurement> {
        let stream = self.stream(kind);
        stream
            .partition_point(|m| m.timestamp() <= t)
            .checked_sub(1)
            .map(|idx| &stream[idx])
    }
}

impl FromIterator<Measurement> for MeasurementSet {
    fn from_iter<I: IntoIterator<Item = Measurement>>(iter: I) -> Self {
        let mut set = Self::new();
        iter.into_iter().for_each(|m| set.push(m));
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(t: f64) -> Measurement {
        Measurement::from_std_devs(SensorKind::Gnss, t, &[t, 0., 0.], &[1., 1., 1.]).unwrap()
    }

    #[test]
    fn push_keeps_streams_sorted() {
        let set: MeasurementSet = [2.0, 0.0, 1.0].into_iter().map(fix).collect();
        let times: Vec<f64> = set.stream(SensorKind::Gnss).iter().map(|m| m.timestamp()).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn empty_kind_has_no_timestamps() {
        let set = MeasurementSet::new();
        assert!(set.is_empty());
        assert!(matches!(
            set.first_timestamp(SensorKind::Imu),
            Err(Error::NoMeasurements(SensorKind::Imu))
        ));
        assert!(set.last_timestamp(SensorKind::Imu).is_err());
    }

    #[test]
    fn between_is_half_open() {
        let set: MeasurementSet = [0.0, 1.0, 2.0, 3.0].into_iter().map(fix).collect();
        let slice = set.between(SensorKind::Gnss, 1.0, 3.0);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].timestamp(), 2.0);
        assert_eq!(set.between(SensorKind::Gnss, -1.0, 0.0).len(), 1);
        assert_eq!(set.window(SensorKind::Gnss, 1.0, 2.0).len(), 2);
    }

    #[test]
    fn next_and_latest() {
        let set: MeasurementSet = [0.0, 1.0, 2.0].into_iter().map(fix).collect();
        assert_eq!(set.next_timestamp_after(SensorKind::Gnss, 0.5), Some(1.0));
        assert_eq!(set.next_timestamp_after(SensorKind::Gnss, 2.0), None);
        assert_eq!(
            set.latest_at_or_before(SensorKind::Gnss, 1.5).map(|m| m.timestamp()),
            Some(1.0)
        );
        assert!(set.latest_at_or_before(SensorKind::Gnss, -0.1).is_none());
    }

    #[test]
    fn kind_parses_from_its_name() {
        for kind in SensorKind::ALL {
            assert_eq!(kind.as_str().parse::<SensorKind>(), Ok(kind));
        }
        assert!("lidar".parse::<SensorKind>().is_err());
    }

    #[test]
    fn covariance_must_match_mean() {
        let result = Measurement::new(
            SensorKind::Gnss,
            0.0,
            DVector::zeros(3),
            DMatrix::identity(2, 2),
        );
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let at_nan = Measurement::from_std_devs(SensorKind::Gnss, f64::NAN, &[0.; 3], &[1.; 3]);
        assert!(matches!(at_nan, Err(Error::NonFinite(_))));

        let infinite_mean =
            Measurement::from_std_devs(SensorKind::Gnss, 0.0, &[f64::INFINITY, 0., 0.], &[1.; 3]);
        assert!(matches!(infinite_mean, Err(Error::NonFinite(_))));

        let nan_std = Measurement::from_std_devs(SensorKind::Gnss, 0.0, &[0.; 3], &[f64::NAN; 3]);
        assert!(matches!(nan_std, Err(Error::NonFinite(_))));
    }
}
