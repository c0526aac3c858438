// #![warn(missing_docs)]

//! Incremental sliding-window factor-graph estimation for GNSS, inertial and
//! odometry navigation.
//!
//! Measurements are (optionally) down-sampled by [`resample`], then fed to
//! the [`estimator::Estimator`], which grows a [`graph::FactorGraph`] one
//! timestamp at a time, freezes states that fall out of the sliding window
//! and re-solves with Levenberg-Marquardt. Positions are estimated in an
//! East-North-Up tangent plane anchored on the first GNSS data and converted
//! back to ECEF once the run completes.
//!
//! ```no_run
//! use sextant::prelude::*;
//!
//! let measurements = sextant::io::read_measurements_file("drive.txt")?;
//! let mut sink = MemorySink::new();
//! let estimate = Estimator::new(FactorGraphConfig::default())
//!     .run(&measurements, &mut sink, &mut RunContext::default())?;
//! println!("{} states", estimate.trajectory.len());
//! # Ok::<(), sextant::error::Error>(())
//! ```

pub mod config;
pub mod context;
#[allow(missing_docs)]
pub mod error;
pub mod estimator;
pub mod factor;
pub mod frame;
pub mod graph;
pub mod init;
pub mod io;
pub mod measurement;
pub mod model;
pub mod resample;
pub mod sink;
pub mod solver;
pub mod state;

pub mod prelude {
    pub use crate::{
        config::FactorGraphConfig,
        context::{CancelFlag, RunContext},
        estimator::{Estimate, Estimator, IterationSummary, RunStatus},
        measurement::{Measurement, MeasurementSet, SensorKind, Timestamp},
        sink::{Artifact, MemorySink, ResultSink},
        solver::SolveMode,
        state::{StateName, Trajectory},
    };
}
