use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;

use crate::job::JobStat;

/// Primary store: job id -> record, plus the tx id -> job id index.
///
/// Each operation is atomic on its map. Records go in and come out by value,
/// so a reader never observes a half-written record.
#[derive(Debug, Default)]
pub struct JobStatStore {
    stats: DashMap<String, JobStat>,
    tx_index: DashMap<String, String>,
}

impl JobStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by job id and index the transaction id on first sight.
    ///
    /// The record is stored before its index entry, so an indexed tx id always
    /// resolves.
    pub fn set(&self, stat: JobStat) {
        let job_id = stat.job_id.clone();
        let tx_id = stat.tx_id.clone();
        self.stats.insert(job_id.clone(), stat);

        if tx_id.is_empty() {
            return;
        }
        match self.tx_index.entry(tx_id) {
            Entry::Vacant(slot) => {
                slot.insert(job_id);
            }
            Entry::Occupied(existing) if existing.get() != &job_id => {
                warn!(
                    "txid {} already indexed for job {}, ignoring job {}",
                    existing.key(),
                    existing.get(),
                    job_id
                );
            }
            Entry::Occupied(_) => {}
        }
    }

    pub fn get(&self, job_id: &str) -> Option<JobStat> {
        self.stats.get(job_id).map(|s| s.value().clone())
    }

    pub fn get_by_tx_id(&self, tx_id: &str) -> Option<JobStat> {
        let job_id = self.tx_index.get(tx_id)?.value().clone();
        self.get(&job_id)
    }

    /// Swap the record owning `tx_id` for the one `replace` builds from it.
    ///
    /// Runs under the record's shard lock, so two concurrent replacements of
    /// the same record cannot both see the old value. Returns the new record,
    /// or `None` if the tx id is unknown or `replace` declined.
    pub fn replace_by_tx_id<F>(&self, tx_id: &str, replace: F) -> Option<JobStat>
    where
        F: FnOnce(&JobStat) -> Option<JobStat>,
    {
        let job_id = self.tx_index.get(tx_id)?.value().clone();
        let mut current = self.stats.get_mut(&job_id)?;
        let next = replace(current.value())?;
        *current = next.clone();
        Some(next)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn indexed_tx_count(&self) -> usize {
        self.tx_index.len()
    }

    /// Copy of every record, ordered by submission time.
    pub fn snapshot(&self) -> Vec<JobStat> {
        let mut stats: Vec<JobStat> = self.stats.iter().map(|s| s.value().clone()).collect();
        stats.sort_by(|a, b| {
            a.submit_time
                .cmp(&b.submit_time)
                .then_with(|| a.name.cmp(&b.name))
        });
        stats
    }
}

/// Confirmed records keyed by tx id. Written only by the listener.
#[derive(Debug, Default)]
pub struct TxStatStore {
    stats: DashMap<String, JobStat>,
}

impl TxStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, stat: JobStat) {
        if stat.tx_id.is_empty() {
            return;
        }
        self.stats.insert(stat.tx_id.clone(), stat);
    }

    pub fn get(&self, tx_id: &str) -> Option<JobStat> {
        self.stats.get(tx_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}
