use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::model::{EntityKind, Outcome, Record, Transition};
use crate::record_set::RecordSet;

/// Row of the metrics table: an entity kind, or provisional instances counted apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Entity(EntityKind),
    ProvisionalInstance,
}

impl Bucket {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity(kind) => kind.as_str(),
            Self::ProvisionalInstance => "PROVISIONAL_INSTANCE",
        }
    }

    fn always_shown(self) -> bool {
        matches!(self, Self::Entity(kind) if kind.is_core())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pending: u64,
}

impl Counts {
    #[must_use]
    pub fn total(self) -> u64 {
        self.completed + self.failed + self.skipped + self.pending
    }

    fn add(&mut self, outcome: Outcome, n: u64) {
        match outcome {
            Outcome::Completed => self.completed += n,
            Outcome::Failed => self.failed += n,
            Outcome::Skipped => self.skipped += n,
            Outcome::Pending => self.pending += n,
        }
    }

    fn get(self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Completed => self.completed,
            Outcome::Failed => self.failed,
            Outcome::Skipped => self.skipped,
            Outcome::Pending => self.pending,
        }
    }

    fn merge(&mut self, other: Self) {
        for outcome in Outcome::ALL {
            self.add(outcome, other.get(outcome));
        }
    }
}

/// Outcome counters keyed by entity and transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    table: BTreeMap<(Bucket, Transition), Counts>,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count every record of a planned and executed set. NONE and UNKNOWN are not counted.
    #[must_use]
    pub fn from_record_set(set: &RecordSet) -> Self {
        let mut metrics = Self::new();
        for record in set.records() {
            metrics.count(Bucket::Entity(record.kind), record);
        }
        for record in set.provisional_records() {
            metrics.count(Bucket::ProvisionalInstance, record);
        }
        metrics
    }

    fn count(&mut self, bucket: Bucket, record: &Record) {
        if Transition::COUNTED.contains(&record.transition) {
            self.add(bucket, record.transition, record.outcome, 1);
        }
    }

    pub fn add(&mut self, bucket: Bucket, transition: Transition, outcome: Outcome, n: u64) {
        self.table.entry((bucket, transition)).or_default().add(outcome, n);
    }

    pub fn merge(&mut self, other: &Self) {
        for (key, counts) in &other.table {
            self.table.entry(*key).or_default().merge(*counts);
        }
    }

    #[must_use]
    pub fn counts(&self, bucket: Bucket, transition: Transition) -> Counts {
        self.table.get(&(bucket, transition)).copied().unwrap_or_default()
    }

    /// Shorthand for the count of one entity/transition/outcome cell.
    #[must_use]
    pub fn get(&self, kind: EntityKind, transition: Transition, outcome: Outcome) -> u64 {
        self.counts(Bucket::Entity(kind), transition).get(outcome)
    }

    /// Every recorded operation across all buckets.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.table.values().map(|counts| counts.total()).sum()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let buckets = EntityKind::ALL
            .into_iter()
            .map(Bucket::Entity)
            .chain(std::iter::once(Bucket::ProvisionalInstance));
        let mut root = Map::new();
        for bucket in buckets {
            let active = Transition::COUNTED.iter().any(|transition| self.counts(bucket, *transition).total() > 0);
            if !active && !bucket.always_shown() {
                continue;
            }
            let mut transitions = Map::new();
            for transition in Transition::COUNTED {
                let counts = self.counts(bucket, transition);
                let mut outcomes = Map::new();
                for outcome in Outcome::ALL {
                    outcomes.insert(outcome.as_str().to_string(), Value::from(counts.get(outcome)));
                }
                transitions.insert(transition.as_str().to_string(), Value::Object(outcomes));
            }
            root.insert(bucket.as_str().to_string(), Value::Object(transitions));
        }
        Value::Object(root)
    }
}

impl Serialize for Metrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
