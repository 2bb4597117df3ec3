use futures::Stream;
use herald_types::{JobEvent, JobEventSink, JobPatch, JobStatus, ProcessingJob};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// Snapshot after an insert or merge
    Upserted(ProcessingJob),
    Removed { job_id: String },
}

#[derive(Default)]
struct Jobs {
    order: Vec<String>,
    by_id: HashMap<String, ProcessingJob>,
}

/// Collection of jobs keyed by id, each id present at most once
#[derive(Clone)]
pub struct JobStore {
    jobs: Arc<Mutex<Jobs>>,
    updates: broadcast::Sender<JobUpdate>,
}

enum Routed {
    Upsert(JobPatch),
    Remove(String),
}

impl JobStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            jobs: Arc::new(Mutex::new(Jobs::default())),
            updates,
        }
    }

    /// Apply one lifecycle event.
    ///
    /// Returns the resulting snapshot, or `None` when the event was ignored or
    /// removed the job. Jobs in a terminal status keep that status and their
    /// progress; a later terminal event for them is ignored.
    pub fn apply(&self, event: JobEvent) -> Option<ProcessingJob> {
        match route(event) {
            Routed::Upsert(patch) => self.upsert(patch),
            Routed::Remove(job_id) => {
                if self.remove(&job_id).is_none() {
                    tracing::debug!(job_id = %job_id, "Removal of unknown job ignored");
                }
                None
            }
        }
    }

    fn upsert(&self, mut patch: JobPatch) -> Option<ProcessingJob> {
        let mut jobs = self.lock();
        let job_id = patch.job_id.clone();

        if let Some(job) = jobs.by_id.get_mut(&job_id) {
            if job.status.is_terminal() {
                if patch.status.map_or(false, JobStatus::is_terminal) {
                    tracing::debug!(job_id = %job_id, status = ?job.status, "Job already finished, terminal event ignored");
                    return None;
                }
                patch.status = None;
                patch.progress = None;
                if !has_fields(&patch) {
                    tracing::debug!(job_id = %job_id, status = ?job.status, "Update for finished job ignored");
                    return None;
                }
            }
            job.merge(&patch);
            let snapshot = job.clone();
            // sent under the lock so subscribers see snapshots in apply order
            let _ = self.updates.send(JobUpdate::Upserted(snapshot.clone()));
            return Some(snapshot);
        }

        let job = ProcessingJob::from_patch(&patch);
        tracing::debug!(job_id = %job_id, status = ?job.status, "Tracking new job");
        jobs.order.push(job_id.clone());
        jobs.by_id.insert(job_id, job.clone());
        let _ = self.updates.send(JobUpdate::Upserted(job.clone()));
        Some(job)
    }

    pub fn get(&self, job_id: &str) -> Option<ProcessingJob> {
        self.lock().by_id.get(job_id).cloned()
    }

    /// All jobs in the order they were first seen
    pub fn list(&self) -> Vec<ProcessingJob> {
        let jobs = self.lock();
        jobs.order
            .iter()
            .filter_map(|id| jobs.by_id.get(id).cloned())
            .collect()
    }

    pub fn active(&self) -> Vec<ProcessingJob> {
        self.list()
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, job_id: &str) -> Option<ProcessingJob> {
        let mut jobs = self.lock();
        let removed = jobs.by_id.remove(job_id);
        if removed.is_some() {
            jobs.order.retain(|id| id != job_id);
            let _ = self.updates.send(JobUpdate::Removed {
                job_id: job_id.to_string(),
            });
        }
        removed
    }

    /// Drop every finished job, returning how many were removed
    pub fn clear_finished(&self) -> usize {
        let finished: Vec<String> = self
            .list()
            .into_iter()
            .filter(|job| job.status.is_terminal())
            .map(|job| job.job_id)
            .collect();
        finished.iter().filter(|id| self.remove(id).is_some()).count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }

    /// Follow one job.
    ///
    /// Nothing happens until the stream is first polled. It then yields the
    /// current snapshot (if the job is known) and every later snapshot, and
    /// ends after the first terminal one or when the job is removed. Dropping
    /// the stream releases its subscription. Call again to start over.
    pub fn monitor(&self, job_id: impl Into<String>) -> impl Stream<Item = ProcessingJob> + Send + 'static {
        let store = self.clone();
        let job_id = job_id.into();

        async_stream::stream! {
            let mut updates = store.subscribe();

            if let Some(job) = store.get(&job_id) {
                let finished = job.status.is_terminal();
                yield job;
                if finished {
                    return;
                }
            }

            loop {
                match updates.recv().await {
                    Ok(JobUpdate::Upserted(job)) if job.job_id == job_id => {
                        let finished = job.status.is_terminal();
                        yield job;
                        if finished {
                            break;
                        }
                    }
                    Ok(JobUpdate::Removed { job_id: removed }) if removed == job_id => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(job_id = %job_id, skipped, "Job monitor lagged, resuming from snapshot");
                        match store.get(&job_id) {
                            Some(job) => {
                                let finished = job.status.is_terminal();
                                yield job;
                                if finished {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobEventSink for JobStore {
    fn dispatch(&self, event: JobEvent) {
        self.apply(event);
    }
}

/// Narrow each event to the fields it is allowed to change
fn route(event: JobEvent) -> Routed {
    match event {
        JobEvent::Created(patch) | JobEvent::Updated(patch) => Routed::Upsert(patch),
        JobEvent::Started(patch) => Routed::Upsert(patch.status(JobStatus::Running)),
        JobEvent::Progress(patch) => Routed::Upsert(JobPatch {
            progress: patch.progress,
            current_step: patch.current_step,
            estimated_completion: patch.estimated_completion,
            ..JobPatch::new(patch.job_id)
        }),
        JobEvent::Completed(patch) => {
            Routed::Upsert(JobPatch::new(patch.job_id).status(JobStatus::Completed).progress(100.0))
        }
        JobEvent::Failed(patch) => Routed::Upsert(JobPatch {
            error_message: patch.error_message,
            ..JobPatch::new(patch.job_id).status(JobStatus::Failed)
        }),
        JobEvent::Cancelled(patch) => Routed::Upsert(JobPatch::new(patch.job_id).status(JobStatus::Cancelled)),
        JobEvent::Removed { job_id } => Routed::Remove(job_id),
    }
}

fn has_fields(patch: &JobPatch) -> bool {
    patch.status.is_some()
        || patch.progress.is_some()
        || patch.current_step.is_some()
        || patch.error_message.is_some()
        || patch.estimated_completion.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn created(id: &str) -> JobEvent {
        JobEvent::Created(JobPatch::new(id).status(JobStatus::Pending))
    }

    fn progress(id: &str, value: f64) -> JobEvent {
        JobEvent::Progress(JobPatch::new(id).progress(value).current_step("extracting"))
    }

    #[test]
    fn test_created_progress_completed_is_one_job() {
        let store = JobStore::new();
        store.apply(created("a"));
        store.apply(progress("a", 50.0));
        store.apply(JobEvent::Completed(JobPatch::new("a")));

        let jobs = store.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].progress, 100.0);
        assert_eq!(jobs[0].current_step, "extracting");
    }

    #[test]
    fn test_progress_for_unknown_job_inserts_pending() {
        let store = JobStore::new();
        let job = store.apply(progress("b", 10.0)).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 10.0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_progress_ignores_status_field() {
        let store = JobStore::new();
        store.apply(created("a"));
        let patch = JobPatch::new("a").status(JobStatus::Completed).progress(20.0);
        let job = store.apply(JobEvent::Progress(patch)).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 20.0);
    }

    #[test]
    fn test_terminal_job_does_not_regress() {
        let store = JobStore::new();
        store.apply(created("a"));
        store.apply(JobEvent::Completed(JobPatch::new("a")));

        assert!(store.apply(progress("a", 30.0)).is_some());
        assert!(store.apply(JobEvent::Started(JobPatch::new("a"))).is_none());
        assert!(store.apply(JobEvent::Failed(JobPatch::new("a").error_message("late"))).is_none());

        let job = store.get("a").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn test_failed_records_error_message() {
        let store = JobStore::new();
        store.apply(JobEvent::Started(JobPatch::new("a")));
        assert_eq!(store.get("a").unwrap().status, JobStatus::Running);

        store.apply(JobEvent::Failed(JobPatch::new("a").error_message("disk full").progress(80.0)));
        let job = store.get("a").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("disk full"));
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn test_removed_and_order() {
        let store = JobStore::new();
        store.apply(created("a"));
        store.apply(created("b"));
        store.apply(created("c"));
        store.apply(JobEvent::Removed { job_id: "b".to_string() });
        store.apply(JobEvent::Removed { job_id: "zzz".to_string() });

        let ids: Vec<String> = store.list().into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_progress_is_clamped() {
        let store = JobStore::new();
        assert_eq!(store.apply(progress("a", 140.0)).unwrap().progress, 100.0);
        assert_eq!(store.apply(progress("a", -5.0)).unwrap().progress, 0.0);
    }

    #[test]
    fn test_clear_finished() {
        let store = JobStore::new();
        store.apply(created("a"));
        store.apply(created("b"));
        store.apply(JobEvent::Cancelled(JobPatch::new("b")));

        assert_eq!(store.clear_finished(), 1);
        assert_eq!(store.active().len(), 1);
        assert!(store.get("b").is_none());
    }

    #[tokio::test]
    async fn test_monitor_ends_after_terminal_snapshot() {
        let store = JobStore::new();
        store.apply(created("a"));

        let monitor = store.monitor("a");
        tokio::pin!(monitor);

        let first = monitor.next().await.unwrap();
        assert_eq!(first.status, JobStatus::Pending);

        store.apply(created("other"));
        store.apply(progress("a", 40.0));
        store.apply(JobEvent::Completed(JobPatch::new("a")));

        assert_eq!(monitor.next().await.unwrap().progress, 40.0);
        assert_eq!(monitor.next().await.unwrap().status, JobStatus::Completed);
        assert!(monitor.next().await.is_none());
    }

    #[tokio::test]
    async fn test_monitor_of_finished_job_yields_once() {
        let store = JobStore::new();
        store.apply(JobEvent::Cancelled(JobPatch::new("a")));

        let snapshots: Vec<ProcessingJob> = store.monitor("a").collect().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status, JobStatus::Cancelled);

        // restartable
        let again: Vec<ProcessingJob> = store.monitor("a").collect().await;
        assert_eq!(again, snapshots);
    }

    #[tokio::test]
    async fn test_monitor_ends_on_removal() {
        let store = JobStore::new();
        store.apply(created("a"));
        let monitor = store.monitor("a");
        tokio::pin!(monitor);
        monitor.next().await.unwrap();

        store.remove("a");
        assert!(monitor.next().await.is_none());
    }

    #[tokio::test]
    async fn test_monitor_is_lazy_and_releases_on_drop() {
        let store = JobStore::new();
        store.apply(created("a"));

        let monitor = store.monitor("a");
        assert_eq!(store.subscriber_count(), 0);

        let mut monitor = Box::pin(monitor);
        monitor.next().await.unwrap();
        assert_eq!(store.subscriber_count(), 1);

        drop(monitor);
        assert_eq!(store.subscriber_count(), 0);
    }
}
