use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::debug;

use crate::config::ConcurrencyPolicy;
use crate::error::ExtractError;
use crate::types::PaperId;

/// At most one extraction per paper at a time.
#[derive(Debug, Default)]
pub struct PaperLocks {
    active: Mutex<HashSet<PaperId>>,
    released: Condvar,
}

/// Held for the duration of one extraction; releases on drop.
#[derive(Debug)]
pub struct PaperGuard<'a> {
    locks: &'a PaperLocks,
    paper_id: PaperId,
}

impl PaperLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashSet<PaperId>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock for `paper_id`. `Queue` waits for a running
    /// extraction to finish; `Reject` fails with `Busy`.
    pub fn acquire(
        &self,
        paper_id: PaperId,
        policy: ConcurrencyPolicy,
    ) -> Result<PaperGuard<'_>, ExtractError> {
        let mut active = self.active();
        while active.contains(&paper_id) {
            match policy {
                ConcurrencyPolicy::Reject => return Err(ExtractError::Busy(paper_id)),
                ConcurrencyPolicy::Queue => {
                    debug!(paper_id, "waiting for running extraction");
                    active = self
                        .released
                        .wait(active)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
        active.insert(paper_id);
        Ok(PaperGuard { locks: self, paper_id })
    }

    pub fn is_locked(&self, paper_id: PaperId) -> bool {
        self.active().contains(&paper_id)
    }
}

impl Drop for PaperGuard<'_> {
    fn drop(&mut self) {
        self.locks.active().remove(&self.paper_id);
        self.locks.released.notify_all();
    }
}
