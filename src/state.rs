use crate::{error::Error, measurement::Timestamp};
use nalgebra::DVector;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The named unknowns the estimator solves for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StateName {
    /// Position in the working frame, in meters.
    Position,
    /// Velocity in the working frame, in meters per second.
    Velocity,
    /// Accelerometer bias followed by gyroscope bias.
    ImuBias,
    /// Heading about the local up axis, in radians.
    Yaw,
    /// Receiver clock offset expressed as a range, in meters.
    ClockBias,
}

impl StateName {
    pub fn dim(self) -> usize {
        match self {
            StateName::Position | StateName::Velocity => 3,
            StateName::ImuBias => 6,
            StateName::Yaw | StateName::ClockBias => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StateName::Position => "position",
            StateName::Velocity => "velocity",
            StateName::ImuBias => "imu_bias",
            StateName::Yaw => "yaw",
            StateName::ClockBias => "clock_bias",
        }
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable handle to a [`StateVariable`] inside the [`Trajectory`] that
/// created it. Handles stay valid for the lifetime of the trajectory since
/// entries are never removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(usize);

impl StateKey {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A state name at a point in time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateId {
    pub name: StateName,
    pub timestamp: Timestamp,
}

impl StateId {
    pub fn new(name: StateName, timestamp: Timestamp) -> Self {
        Self { name, timestamp }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.timestamp)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateVariable {
    name: StateName,
    timestamp: Timestamp,
    mean: DVector<f64>,
    constant: bool,
}

impl StateVariable {
    pub fn name(&self) -> StateName {
        self.name
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn id(&self) -> StateId {
        StateId::new(self.name, self.timestamp)
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Whether the variable has been frozen out of the optimization.
    pub fn is_constant(&self) -> bool {
        self.constant
    }
}

/// Append-only, time-indexed store of state variables.
///
/// All variables live in one arena; a per-name index keeps them in time
/// order. Freezing flips a flag in place, so [`StateKey`]s held by factors
/// remain valid for the whole run.
#[derive(Clone, Debug, Default)]
pub struct Trajectory {
    entries: Vec<StateVariable>,
    index: BTreeMap<StateName, Vec<StateKey>>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a new free variable.
    pub fn add(
        &mut self,
        name: StateName,
        timestamp: Timestamp,
        mean: DVector<f64>,
    ) -> Result<StateKey, Error> {
        if mean.len() != name.dim() {
            return Err(Error::DimensionMismatch {
                what: format!("state {name}"),
                expected: name.dim(),
                actual: mean.len(),
            });
        }
        if self.key(name, timestamp).is_some() {
            return Err(Error::DuplicateState { name, timestamp });
        }

        let key = StateKey(self.entries.len());
        self.entries.push(StateVariable {
            name,
            timestamp,
            mean,
            constant: false,
        });
        self.insert_index(key);
        Ok(key)
    }

    fn insert_index(&mut self, key: StateKey) {
        let StateVariable {
            name, timestamp, ..
        } = self.entries[key.0];
        let keys = self.index.entry(name).or_default();
        let at = keys.partition_point(|k| self.entries[k.0].timestamp <= timestamp);
        keys.insert(at, key);
    }

    /// Looks up the variable `name` at exactly `timestamp`.
    pub fn key(&self, name: StateName, timestamp: Timestamp) -> Option<StateKey> {
        let keys = self.index.get(&name)?;
        let at = keys.partition_point(|k| self.entries[k.0].timestamp < timestamp);
        keys.get(at)
            .copied()
            .filter(|k| self.entries[k.0].timestamp == timestamp)
    }

    pub fn require(&self, name: StateName, timestamp: Timestamp) -> Result<StateKey, Error> {
        self.key(name, timestamp)
            .ok_or(Error::UnknownState { name, timestamp })
    }

    pub fn contains(&self, name: StateName, timestamp: Timestamp) -> bool {
        self.key(name, timestamp).is_some()
    }

    /// # Panics
    /// If `key` was not issued by this trajectory.
    pub fn get(&self, key: StateKey) -> &StateVariable {
        &self.entries[key.0]
    }

    /// Variables of `name` in time order.
    pub fn states(&self, name: StateName) -> impl Iterator<Item = &StateVariable> + '_ {
        self.index
            .get(&name)
            .into_iter()
            .flatten()
            .map(|k| &self.entries[k.0])
    }

    /// Names with at least one variable.
    pub fn names(&self) -> impl Iterator<Item = StateName> + '_ {
        self.index.keys().copied()
    }

    /// All variables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (StateKey, &StateVariable)> + '_ {
        self.entries.iter().enumerate().map(|(i, s)| (StateKey(i), s))
    }

    /// Most recent variable of `name` at or before `timestamp`.
    pub fn latest_at_or_before(
        &self,
        name: StateName,
        timestamp: Timestamp,
    ) -> Option<&StateVariable> {
        let keys = self.index.get(&name)?;
        keys.partition_point(|k| self.entries[k.0].timestamp <= timestamp)
            .checked_sub(1)
            .map(|at| &self.entries[keys[at].0])
    }

    pub fn free_count(&self) -> usize {
        self.entries.iter().filter(|s| !s.constant).count()
    }

    pub fn frozen_count(&self) -> usize {
        self.entries.len() - self.free_count()
    }

    /// Marks every variable older than `threshold` as constant and returns
    /// how many were newly frozen. Frozen variables never become free again.
    pub fn freeze_before(&mut self, threshold: Timestamp) -> usize {
        let mut frozen = 0;
        for state in self
            .entries
            .iter_mut()
            .filter(|s| !s.constant && s.timestamp < threshold)
        {
            state.constant = true;
            frozen += 1;
        }
        frozen
    }

    /// Overwrites the mean of a free variable.
    pub(crate) fn set_mean(&mut self, key: StateKey, mean: &DVector<f64>) {
        let entry = &mut self.entries[key.0];
        debug_assert!(!entry.constant, "solver attempted to move frozen state {}", entry.id());
        if !entry.constant {
            entry.mean.copy_from(mean);
        }
    }

    /// Mirrors `source` into `self`, which must be an earlier mirror of the
    /// same trajectory. New variables are appended; free ones are refreshed.
    /// Variables already frozen in `self` are left alone since their means
    /// can no longer change.
    pub fn persist_from(&mut self, source: &Trajectory) {
        for (i, entry) in source.entries.iter().enumerate() {
            match self.entries.get_mut(i) {
                Some(mirror) if mirror.constant => {}
                Some(mirror) => mirror.clone_from(entry),
                None => {
                    self.entries.push(entry.clone());
                    self.insert_index(StateKey(i));
                }
            }
        }
    }

    /// Rewrites the mean of every variable of `name`, frozen or not.
    pub fn map_means<F>(&mut self, name: StateName, mut f: F)
    where
        F: FnMut(&DVector<f64>) -> DVector<f64>,
    {
        let Some(keys) = self.index.get(&name) else {
            return;
        };
        for key in keys {
            let entry = &mut self.entries[key.0];
            entry.mean = f(&entry.mean);
        }
    }
}
