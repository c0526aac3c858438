use crate::{
    error::Error,
    estimator::IterationSummary,
    state::{StateName, StateVariable},
};

/// Which output a batch of states belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Artifact {
    /// Positions in the tangent plane, written before the global conversion.
    LocalFrame,
    /// The final trajectory.
    Final,
}

/// Receives the results of a run, one state name at a time.
pub trait ResultSink {
    fn write(
        &mut self,
        artifact: Artifact,
        name: StateName,
        states: &[StateVariable],
    ) -> Result<(), Error>;

    fn write_summaries(&mut self, _summaries: &[IterationSummary]) -> Result<(), Error> {
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub written: Vec<(Artifact, StateName, Vec<StateVariable>)>,
    pub summaries: Vec<IterationSummary>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, artifact: Artifact, name: StateName) -> Option<&[StateVariable]> {
        self.written
            .iter()
            .find(|(a, n, _)| *a == artifact && *n == name)
            .map(|(_, _, states)| states.as_slice())
    }
}

impl ResultSink for MemorySink {
    fn write(
        &mut self,
        artifact: Artifact,
        name: StateName,
        states: &[StateVariable],
    ) -> Result<(), Error> {
        self.written.push((artifact, name, states.to_vec()));
        Ok(())
    }

    fn write_summaries(&mut self, summaries: &[IterationSummary]) -> Result<(), Error> {
        self.summaries.extend_from_slice(summaries);
        Ok(())
    }
}
