//! Bucketed down-sampling of high-rate measurement streams.
//!
//! Measurements are fused in information form: covariances combine as
//! `(Σ Cᵢ⁻¹)⁻¹` under an independence assumption. The fused mean is the plain
//! arithmetic mean of the members, not the information-weighted mean the
//! covariance implies.

use crate::{
    error::Error,
    measurement::{Measurement, MeasurementSet, SensorKind},
};
use nalgebra::{DMatrix, DVector};

/// Aggregates `input` into one measurement per `bucket` seconds.
///
/// A window opens at the first timestamp. It is flushed before consuming the
/// first measurement at or beyond its end, and always after the last
/// measurement. Each flush advances the window end by exactly one `bucket`,
/// counted from the first timestamp, regardless of gaps in the data.
pub fn sample_down(input: &[Measurement], bucket: f64) -> Result<Vec<Measurement>, Error> {
    let first = input.first().ok_or(Error::EmptyInput)?;
    if !(bucket > 0.0) {
        return Err(Error::Config(format!(
            "bucket length must be positive, got {bucket}"
        )));
    }

    let mut output = Vec::new();
    let mut window_end = first.timestamp() + bucket;
    let mut start = 0;

    for (idx, measurement) in input.iter().enumerate() {
        if idx > start && measurement.timestamp() >= window_end {
            output.push(average_measurement(&input[start..idx])?);
            start = idx;
            window_end += bucket;
        }
    }
    output.push(average_measurement(&input[start..])?);

    Ok(output)
}

/// Fuses `window` into a single measurement.
///
/// A single member is returned unchanged. Otherwise the result carries the
/// mean timestamp, the arithmetic mean of the means and the inverse of the
/// summed information matrices; auxiliary data and metadata come from the
/// last member.
pub fn average_measurement(window: &[Measurement]) -> Result<Measurement, Error> {
    let last = window.last().ok_or(Error::EmptyInput)?;
    if window.len() == 1 {
        return Ok(last.clone());
    }

    let dim = last.mean().len();
    let mut timestamp = 0.0;
    let mut mean = DVector::zeros(dim);
    let mut information = DMatrix::zeros(dim, dim);

    for member in window {
        if member.mean().len() != dim {
            return Err(Error::DimensionMismatch {
                what: format!("{} mean", member.kind()),
                expected: dim,
                actual: member.mean().len(),
            });
        }
        timestamp += member.timestamp();
        mean += member.mean();
        information += member.information()?;
    }

    let count = window.len() as f64;
    let covariance = information.try_inverse().ok_or_else(|| {
        Error::SingularCovariance(format!(
            "fused {} window ending at t={}",
            last.kind(),
            last.timestamp()
        ))
    })?;

    let mut fused = last.clone();
    fused.set_timestamp(timestamp / count);
    fused.set_mean(mean / count);
    fused.set_covariance(covariance);
    Ok(fused)
}

impl MeasurementSet {
    /// Replaces the stream of `kind` with its down-sampled version.
    pub fn resample(&mut self, kind: SensorKind, bucket: f64) -> Result<(), Error> {
        let resampled = sample_down(self.stream(kind), bucket)?;
        self.replace_stream(kind, resampled);
        Ok(())
    }
}
