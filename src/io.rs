//! Whitespace separated text files.
//!
//! Input holds one measurement per line, `#` starts a comment:
//!
//! ```text
//! <kind> <t> <mean...> <std...> [aux...] [meta]
//! gnss 0.0 1130000.0 -4720000.0 4420000.0 1.5 1.5 3.0
//! pseudorange 0.0 21000000.0 5.0 15600000.0 7540000.0 20140000.0 G05
//! ```
//!
//! Output holds one state per line as `<state> <t> <mean...>`.

use crate::{
    error::Error,
    estimator::IterationSummary,
    measurement::{Measurement, MeasurementSet, SensorKind},
    sink::{Artifact, ResultSink},
    state::{StateName, StateVariable},
};
use chrono::{DateTime, Utc};
use nalgebra::DVector;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

pub fn read_measurements<R: BufRead>(reader: R) -> Result<MeasurementSet, Error> {
    let mut measurements = MeasurementSet::new();
    for (idx, line) in reader.lines().enumerate() {
        if let Some(measurement) = parse_line(&line?, idx + 1)? {
            measurements.push(measurement);
        }
    }
    Ok(measurements)
}

pub fn read_measurements_file(path: impl AsRef<Path>) -> Result<MeasurementSet, Error> {
    read_measurements(BufReader::new(File::open(path)?))
}

/// Parses line number `line`. Blank and comment lines yield `None`.
pub fn parse_line(text: &str, line: usize) -> Result<Option<Measurement>, Error> {
    let parse_error = |reason: String| Error::Parse { line, reason };
    let content = text.split('#').next().unwrap_or_default();
    let mut tokens = content.split_whitespace();
    let Some(kind) = tokens.next() else {
        return Ok(None);
    };

    let kind: SensorKind = kind.parse().map_err(parse_error)?;
    if kind == SensorKind::Prior {
        return Err(parse_error("priors come from the configuration, not the input".into()));
    }

    let tokens: Vec<&str> = tokens.collect();
    let dim = kind.mean_dim();
    let numeric = 1 + 2 * dim + kind.aux_dim();
    if tokens.len() < numeric || tokens.len() > numeric + 1 {
        return Err(parse_error(format!(
            "{kind} expects {numeric} numeric fields and an optional tag, got {} fields",
            tokens.len()
        )));
    }

    let values = tokens[..numeric]
        .iter()
        .map(|token| {
            match token.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(value),
                Ok(_) => Err(parse_error(format!("`{token}` is not a finite number"))),
                Err(err) => Err(parse_error(format!("`{token}`: {err}"))),
            }
        })
        .collect::<Result<Vec<f64>, Error>>()?;

    let mean = &values[1..1 + dim];
    let std_devs = &values[1 + dim..1 + 2 * dim];
    let mut measurement = Measurement::from_std_devs(kind, values[0], mean, std_devs)?;
    if kind.aux_dim() > 0 {
        measurement = measurement.with_aux(DVector::from_column_slice(&values[1 + 2 * dim..]));
    }
    if let Some(meta) = tokens.get(numeric) {
        measurement = measurement.with_meta(*meta);
    }
    Ok(Some(measurement))
}

pub fn write_states<W: Write>(
    writer: &mut W,
    name: StateName,
    states: &[StateVariable],
) -> Result<(), Error> {
    for state in states {
        write!(writer, "{name} {:.6}", state.timestamp())?;
        for value in state.mean().iter() {
            write!(writer, " {value:.6}")?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

const SUMMARY_COLUMNS: &str =
    "# step t mode iterations initial_cost final_cost converged free frozen factors step_s solve_s";

pub fn write_summaries<W: Write>(
    writer: &mut W,
    summaries: &[IterationSummary],
) -> Result<(), Error> {
    writeln!(writer, "{SUMMARY_COLUMNS}")?;
    for summary in summaries {
        let solve = &summary.solve;
        writeln!(
            writer,
            "{} {:.6} {:?} {} {:.6e} {:.6e} {} {} {} {} {:.6} {:.6}",
            summary.step,
            summary.timestamp,
            solve.mode,
            solve.iterations,
            solve.initial_cost,
            solve.final_cost,
            solve.converged,
            summary.free_states,
            summary.frozen_states,
            summary.factors,
            summary.duration.as_secs_f64(),
            solve.duration.as_secs_f64(),
        )?;
    }
    Ok(())
}

/// Writes each artifact into its own file next to `path`: the final
/// trajectory into `path` itself, the local-frame positions into
/// `path_local` and the step diagnostics into `path_summary`.
pub struct FileSink {
    path: PathBuf,
    created: DateTime<Utc>,
    writers: HashMap<Artifact, BufWriter<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: Utc::now(),
            writers: HashMap::new(),
        }
    }

    pub fn path(&self, artifact: Artifact) -> PathBuf {
        match artifact {
            Artifact::Final => self.path.clone(),
            Artifact::LocalFrame => suffixed(&self.path, "_local"),
        }
    }

    fn writer(&mut self, artifact: Artifact) -> Result<&mut BufWriter<File>, Error> {
        if !self.writers.contains_key(&artifact) {
            let mut writer = BufWriter::new(File::create(self.path(artifact))?);
            writeln!(writer, "# sextant {artifact:?} trajectory, {}", self.created.to_rfc3339())?;
            self.writers.insert(artifact, writer);
        }
        self.writers
            .get_mut(&artifact)
            .ok_or_else(|| Error::Io(std::io::Error::other("output writer vanished")))
    }

    /// Flushes every file written so far.
    pub fn finish(mut self) -> Result<(), Error> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl ResultSink for FileSink {
    fn write(
        &mut self,
        artifact: Artifact,
        name: StateName,
        states: &[StateVariable],
    ) -> Result<(), Error> {
        write_states(self.writer(artifact)?, name, states)
    }

    fn write_summaries(&mut self, summaries: &[IterationSummary]) -> Result<(), Error> {
        let mut writer = BufWriter::new(File::create(suffixed(&self.path, "_summary"))?);
        writeln!(writer, "# sextant step summaries, {}", self.created.to_rfc3339())?;
        write_summaries(&mut writer, summaries)?;
        writer.flush()?;
        Ok(())
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Trajectory;
    use rstest::rstest;

    #[test]
    fn reads_kinds_and_skips_comments() {
        let input = "\
# t x y z sx sy sz
gnss 0.0 1.0 2.0 3.0 0.5 0.5 1.0

pseudorange 0.5 2.1e7 5.0 1.5e7 7.5e6 2.0e7 G05 # trailing
odometry 0.25 1.0 0.0 0.0 0.1 0.1 0.1 0.1 0.01
";
        let set = read_measurements(input.as_bytes()).unwrap();

        assert_eq!(set.len(), 3);
        let range = &set.stream(SensorKind::Pseudorange)[0];
        assert_eq!(range.meta(), Some("G05"));
        assert_eq!(range.aux().len(), 3);
        let fix = &set.stream(SensorKind::Gnss)[0];
        assert_eq!(fix.covariance()[(2, 2)], 1.0);
    }

    #[rstest]
    #[case("lidar 0.0 1.0")]
    #[case("gnss 0.0 1.0 2.0 3.0 0.5 0.5")]
    #[case("gnss zero 1.0 2.0 3.0 0.5 0.5 1.0")]
    #[case("gnss 0.0 1.0 2.0 3.0 0.5 0.5 1.0 tag extra")]
    #[case("prior 0.0 1.0 2.0 3.0 0.5 0.5 1.0")]
    #[case("gnss NaN 1 2 3 1 1 1")]
    #[case("gnss 0.0 inf 2.0 3.0 0.5 0.5 1.0")]
    #[case("pseudorange 0.0 2.0e7 5.0 1.0 -infinity 3.0")]
    fn malformed_lines_report_their_number(#[case] text: &str) {
        let input = format!("# header\n{text}\n");
        assert!(matches!(
            read_measurements(input.as_bytes()),
            Err(Error::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn writes_one_state_per_line() {
        let mut trajectory = Trajectory::new();
        trajectory
            .add(StateName::Position, 0.0, DVector::from_vec(vec![1.0, 2.0, 3.0]))
            .unwrap();
        trajectory
            .add(StateName::Position, 1.5, DVector::from_vec(vec![-0.5, 0.0, 0.25]))
            .unwrap();
        let states: Vec<StateVariable> = trajectory.states(StateName::Position).cloned().collect();

        let mut buffer = Vec::new();
        write_states(&mut buffer, StateName::Position, &states).unwrap();
        insta::assert_snapshot!(String::from_utf8(buffer).unwrap(), @r"
        position 0.000000 1.000000 2.000000 3.000000
        position 1.500000 -0.500000 0.000000 0.250000
        ");
    }

    #[test]
    fn local_artifact_is_suffixed() {
        let sink = FileSink::new("/tmp/out.txt");
        assert_eq!(sink.path(Artifact::LocalFrame), PathBuf::from("/tmp/out.txt_local"));
        assert_eq!(sink.path(Artifact::Final), PathBuf::from("/tmp/out.txt"));
    }
}
