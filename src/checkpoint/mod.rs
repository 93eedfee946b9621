//! Index checkpoint generations.
//!
//! Checkpoints are cumulative: generation `n` always covers at least the cycles
//! generation `n - 1` covered. The tracker enforces that on every record and
//! answers which checkpoint anchors a given cycle.

use crate::core::{
    AgingError, Checkpoint, CheckpointId, CycleId, CycleRange, Generation, IndexDbId, Result,
};

#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    index_db: IndexDbId,
    /// Ordered by generation.
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointTracker {
    pub fn new(index_db: IndexDbId) -> Self {
        Self {
            index_db,
            checkpoints: Vec::new(),
        }
    }

    /// Rebuild a tracker from persisted checkpoints, re-checking generations and
    /// coverage. Entries of other index databases are ignored.
    pub fn from_checkpoints<'a, I>(index_db: IndexDbId, checkpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Checkpoint>,
    {
        let mut ordered: Vec<Checkpoint> = checkpoints
            .into_iter()
            .filter(|cp| cp.index_db == index_db)
            .cloned()
            .collect();
        ordered.sort_by_key(|cp| cp.generation);

        let mut tracker = Self::new(index_db);
        for checkpoint in ordered {
            checkpoint.covered.validate()?;
            if tracker.contains(checkpoint.checkpoint_id) {
                return Err(AgingError::InvalidInput(format!(
                    "{} recorded twice for {}",
                    checkpoint.checkpoint_id, index_db
                )));
            }
            if let Some(previous) = tracker.checkpoints.last() {
                if checkpoint.generation <= previous.generation {
                    return Err(AgingError::InvalidInput(format!(
                        "{} and {} share {} in {}",
                        previous.checkpoint_id,
                        checkpoint.checkpoint_id,
                        checkpoint.generation,
                        index_db
                    )));
                }
                tracker.check_coverage(checkpoint.checkpoint_id, previous.covered, checkpoint.covered)?;
            }
            tracker.checkpoints.push(checkpoint);
        }
        Ok(tracker)
    }

    /// Append the next generation. Fails if `covered` shrinks the previous
    /// generation's range.
    pub fn record_checkpoint(
        &mut self,
        checkpoint_id: CheckpointId,
        covered: CycleRange,
    ) -> Result<Generation> {
        covered.validate()?;
        if self.contains(checkpoint_id) {
            return Err(AgingError::InvalidInput(format!(
                "{} recorded twice for {}",
                checkpoint_id, self.index_db
            )));
        }

        let generation = match self.checkpoints.last() {
            Some(previous) => {
                self.check_coverage(checkpoint_id, previous.covered, covered)?;
                previous.generation.next()
            }
            None => Generation(1),
        };

        self.checkpoints.push(Checkpoint {
            checkpoint_id,
            index_db: self.index_db,
            generation,
            covered,
            aged: false,
        });
        Ok(generation)
    }

    fn check_coverage(
        &self,
        checkpoint: CheckpointId,
        previous: CycleRange,
        proposed: CycleRange,
    ) -> Result<()> {
        if proposed.contains_range(&previous) {
            Ok(())
        } else {
            Err(AgingError::NonMonotonicCoverage {
                checkpoint,
                previous,
                proposed,
            })
        }
    }

    /// The oldest live checkpoint whose range includes `cycle_id`: the one that
    /// has to survive for as long as that cycle is retained.
    pub fn latest_checkpoint_covering(&self, cycle_id: CycleId) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|cp| !cp.aged && cp.covered.contains(cycle_id))
    }

    pub fn mark_aged(&mut self, checkpoint_id: CheckpointId) -> Result<()> {
        let checkpoint = self
            .checkpoints
            .iter_mut()
            .find(|cp| cp.checkpoint_id == checkpoint_id)
            .ok_or_else(|| {
                AgingError::InvalidInput(format!("{} is not tracked", checkpoint_id))
            })?;
        checkpoint.aged = true;
        Ok(())
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn get(&self, checkpoint_id: CheckpointId) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|cp| cp.checkpoint_id == checkpoint_id)
    }

    pub fn contains(&self, checkpoint_id: CheckpointId) -> bool {
        self.get(checkpoint_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter()
    }

    pub fn index_db(&self) -> IndexDbId {
        self.index_db
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}
