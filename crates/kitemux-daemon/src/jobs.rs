//! Bounded job pile handing housekeeping work to the blocking workers.
//!
//! The pile is a multiset: `take` returns any queued job, not the oldest.
//! Producers never wait; a full pile rejects the job and the next tick
//! tries again.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Work a blocking worker can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Noop,
    /// Full re-evaluation: DNS, latency probes, then a tunnel check.
    CheckWorld,
    /// Lighter tunnel check: DNS, selection, reconnects, DDNS.
    CheckFrontends,
    /// Stop. Each worker puts this back before exiting so every worker
    /// sees it.
    Quit,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job pile full (capacity {0})")]
    Full(usize),
}

#[derive(Debug)]
struct Pile {
    slots: Vec<Option<JobKind>>,
    count: usize,
}

#[derive(Debug)]
pub struct JobPile {
    pile: Mutex<Pile>,
    available: Condvar,
}

impl JobPile {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pile: Mutex::new(Pile {
                slots: vec![None; capacity],
                count: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pile> {
        self.pile.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a job without blocking.
    pub fn submit(&self, kind: JobKind) -> Result<(), JobError> {
        let mut pile = self.lock();
        let capacity = pile.slots.len();
        let slot = pile
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(JobError::Full(capacity))?;
        *slot = Some(kind);
        pile.count += 1;
        drop(pile);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a job is available and take it.
    pub fn take(&self) -> JobKind {
        let pile = self.lock();
        let mut pile = self
            .available
            .wait_while(pile, |p| p.count == 0)
            .unwrap_or_else(PoisonError::into_inner);
        Self::claim(&mut pile).unwrap_or(JobKind::Noop)
    }

    /// Like [`Self::take`], giving up after `timeout`.
    #[cfg(test)]
    pub fn take_timeout(&self, timeout: std::time::Duration) -> Option<JobKind> {
        let pile = self.lock();
        let (mut pile, _) = self
            .available
            .wait_timeout_while(pile, timeout, |p| p.count == 0)
            .unwrap_or_else(PoisonError::into_inner);
        Self::claim(&mut pile)
    }

    fn claim(pile: &mut Pile) -> Option<JobKind> {
        let kind = pile.slots.iter_mut().find_map(Option::take)?;
        pile.count -= 1;
        Some(kind)
    }
}
