use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, instrument};

const PRUNE_THRESHOLD: usize = 1024;

/// In-process advisory locks keyed by (user, course).
///
/// Every mutating engine operation for a pair holds its lock for the whole
/// operation, so a reset can never interleave with a completion or a quiz
/// submission for the same learner and course.
#[derive(Default)]
pub struct CourseLocks {
    entries: Mutex<HashMap<(i64, i64), Arc<AsyncMutex<()>>>>,
}

impl CourseLocks {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self))]
    pub async fn lock(&self, user_id: i64, course_id: i64) -> OwnedMutexGuard<()> {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

            if entries.len() >= PRUNE_THRESHOLD {
                entries.retain(|_, lock| Arc::strong_count(lock) > 1);
                debug!(remaining = entries.len(), "Pruned idle course locks");
            }

            entries.entry((user_id, course_id)).or_default().clone()
        };

        entry.lock_owned().await
    }
}
