use crate::{
    config::RetentionConfig,
    types::{JobId, JobSnapshot},
};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// One job's record. Every mutation happens under this lock as a single closure, so a
/// reader never sees a half-applied transition.
pub type JobRecord = Arc<Mutex<JobSnapshot>>;

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    retention: RetentionConfig,
}

impl JobRegistry {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Adds a record, evicting expired terminal jobs first.
    pub fn insert(&self, snapshot: JobSnapshot) -> JobRecord {
        self.evict();
        let id = snapshot.id.clone();
        let record = Arc::new(Mutex::new(snapshot));
        self.jobs.write().insert(id, Arc::clone(&record));
        record
    }

    pub fn record(&self, id: &JobId) -> Option<JobRecord> {
        self.jobs.read().get(id).cloned()
    }

    pub fn snapshot(&self, id: &JobId) -> Option<JobSnapshot> {
        let record = self.record(id)?;
        let snap = record.lock().clone();
        Some(snap)
    }

    pub fn remove(&self, id: &JobId) -> Option<JobSnapshot> {
        let record = self.jobs.write().remove(id)?;
        let snap = record.lock().clone();
        Some(snap)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops terminal jobs older than the TTL, then the oldest terminal jobs while the
    /// registry is at capacity. Pending and running jobs are never evicted.
    pub fn evict(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.retention.ttl())
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let now = Utc::now();

        let mut jobs = self.jobs.write();
        let mut finished: Vec<(JobId, chrono::DateTime<Utc>)> = jobs
            .iter()
            .filter_map(|(id, rec)| {
                let snap = rec.lock();
                if !snap.is_terminal() {
                    return None;
                }
                let at = snap.finished_at.unwrap_or(snap.created_at);
                Some((id.clone(), at))
            })
            .collect();
        finished.sort_by_key(|(_, at)| *at);

        let before = jobs.len();
        let mut survivors = Vec::with_capacity(finished.len());
        for (id, at) in finished {
            if now.signed_duration_since(at) > ttl {
                jobs.remove(&id);
            } else {
                survivors.push(id);
            }
        }
        for id in survivors {
            if jobs.len() < self.retention.max_jobs {
                break;
            }
            jobs.remove(&id);
        }

        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!(evicted, remaining = jobs.len(), "evicted finished jobs");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobState, QualityProfile, StemCount};

    fn pending(id: &str) -> JobSnapshot {
        JobSnapshot::pending(
            JobId::from(id),
            "song.mp3",
            StemCount::Four,
            QualityProfile::Basic,
        )
    }

    fn finish(reg: &JobRegistry, id: &str, secs_ago: i64) {
        let record = reg.record(&JobId::from(id)).unwrap();
        let mut s = record.lock();
        s.state = JobState::Failed;
        s.message = "x".into();
        s.finished_at = Some(Utc::now() - chrono::Duration::seconds(secs_ago));
    }

    #[test]
    fn record_changes_are_visible_in_snapshots() {
        let reg = JobRegistry::new(RetentionConfig::default());
        let record = reg.insert(pending("a"));
        record.lock().percentage = 42;
        assert_eq!(reg.snapshot(&JobId::from("a")).unwrap().percentage, 42);
        assert!(reg.snapshot(&JobId::from("zz")).is_none());
        assert_eq!(reg.remove(&JobId::from("a")).unwrap().percentage, 42);
        assert!(reg.is_empty());
    }

    #[test]
    fn ttl_evicts_only_terminal_jobs() {
        let reg = JobRegistry::new(RetentionConfig {
            max_jobs: 100,
            ttl_secs: 60,
        });
        reg.insert(pending("old"));
        reg.insert(pending("fresh"));
        reg.insert(pending("running"));
        finish(&reg, "old", 3600);
        finish(&reg, "fresh", 1);
        {
            let record = reg.record(&JobId::from("running")).unwrap();
            let mut s = record.lock();
            s.state = JobState::Running;
            s.created_at = Utc::now() - chrono::Duration::days(1);
        }

        assert_eq!(reg.evict(), 1);
        assert!(reg.snapshot(&JobId::from("old")).is_none());
        assert!(reg.snapshot(&JobId::from("fresh")).is_some());
        assert!(reg.snapshot(&JobId::from("running")).is_some());
    }

    #[test]
    fn capacity_evicts_oldest_terminal_first() {
        let reg = JobRegistry::new(RetentionConfig {
            max_jobs: 3,
            ttl_secs: 3600,
        });
        for id in ["a", "b", "c"] {
            reg.insert(pending(id));
        }
        finish(&reg, "b", 30);
        finish(&reg, "c", 10);

        reg.insert(pending("d"));
        assert_eq!(reg.len(), 3);
        assert!(reg.snapshot(&JobId::from("b")).is_none());
        assert!(reg.snapshot(&JobId::from("a")).is_some());
        assert!(reg.snapshot(&JobId::from("c")).is_some());
    }

    #[test]
    fn active_jobs_can_exceed_capacity() {
        let reg = JobRegistry::new(RetentionConfig {
            max_jobs: 1,
            ttl_secs: 3600,
        });
        reg.insert(pending("a"));
        reg.insert(pending("b"));
        assert_eq!(reg.len(), 2);
    }
}
