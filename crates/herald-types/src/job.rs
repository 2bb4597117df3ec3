use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Completed, failed and cancelled jobs never change status again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    pub job_id: String,
    pub status: JobStatus,
    /// Percentage in `0.0..=100.0`
    pub progress: f64,
    pub current_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            progress: 0.0,
            current_step: String::new(),
            error_message: None,
            estimated_completion: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a job from the first patch seen for its id
    pub fn from_patch(patch: &JobPatch) -> Self {
        let mut job = Self::new(patch.job_id.clone());
        job.merge(patch);
        job
    }

    /// Shallow merge: every field present in the patch overwrites the current value
    pub fn merge(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = clamp_progress(progress);
        }
        if let Some(step) = &patch.current_step {
            self.current_step = step.clone();
        }
        if let Some(message) = &patch.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(eta) = &patch.estimated_completion {
            self.estimated_completion = Some(eta.clone());
        }
        self.updated_at = Utc::now();
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

/// Partial update of a [`ProcessingJob`], keyed by `job_id`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    #[serde(alias = "job_id")]
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, alias = "current_step", skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, alias = "error_message", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(
        default,
        alias = "estimated_completion",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_completion: Option<String>,
}

impl JobPatch {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// A decoded job lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Created(JobPatch),
    Started(JobPatch),
    Progress(JobPatch),
    Completed(JobPatch),
    Failed(JobPatch),
    Cancelled(JobPatch),
    /// Generic partial update (`job_update` or an unnamed data line)
    Updated(JobPatch),
    Removed { job_id: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default, rename = "type", alias = "event")]
    kind: Option<String>,
    #[serde(flatten)]
    patch: JobPatch,
}

impl JobEvent {
    /// Decode a job event from an SSE event name and its JSON payload.
    ///
    /// Returns `Ok(None)` when the name does not belong to the job protocol.
    /// Without an event name, a `type` field inside the payload picks the
    /// variant and anything else is treated as a generic update.
    pub fn decode(event_name: Option<&str>, payload: &str) -> Result<Option<Self>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        let kind = match event_name {
            Some(name) => name.to_string(),
            None => envelope.kind.clone().unwrap_or_else(|| "job_update".to_string()),
        };
        Ok(Self::from_kind(&kind, envelope.patch))
    }

    fn from_kind(kind: &str, patch: JobPatch) -> Option<Self> {
        let kind = kind.strip_prefix("job_").unwrap_or(kind);
        let event = match kind {
            "created" => Self::Created(patch),
            "started" => Self::Started(patch),
            "progress" => Self::Progress(patch),
            "completed" => Self::Completed(patch),
            "failed" => Self::Failed(patch),
            "cancelled" | "canceled" => Self::Cancelled(patch),
            "update" | "updated" => Self::Updated(patch),
            "removed" | "deleted" => Self::Removed { job_id: patch.job_id },
            _ => return None,
        };
        Some(event)
    }

    /// Whether an SSE event name is part of the job protocol
    pub fn is_job_event_name(name: &str) -> bool {
        name.starts_with("job_")
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Created(p)
            | Self::Started(p)
            | Self::Progress(p)
            | Self::Completed(p)
            | Self::Failed(p)
            | Self::Cancelled(p)
            | Self::Updated(p) => &p.job_id,
            Self::Removed { job_id } => job_id,
        }
    }
}

/// Receiver of decoded job events, implemented by the job store
pub trait JobEventSink: Send + Sync {
    fn dispatch(&self, event: JobEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_merge_is_shallow() {
        let mut job = ProcessingJob::from_patch(&JobPatch::new("a").current_step("extract"));
        job.merge(&JobPatch::new("a").progress(40.0));
        assert_eq!(job.current_step, "extract");
        assert_eq!(job.progress, 40.0);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_progress_is_clamped() {
        let job = ProcessingJob::from_patch(&JobPatch::new("a").progress(250.0));
        assert_eq!(job.progress, 100.0);
        let job = ProcessingJob::from_patch(&JobPatch::new("a").progress(-3.0));
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn test_decode_named_progress() {
        let event = JobEvent::decode(Some("job_progress"), r#"{"jobId":"j1","progress":30}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event, JobEvent::Progress(JobPatch::new("j1").progress(30.0)));
    }

    #[test]
    fn test_decode_snake_case_payload() {
        let event = JobEvent::decode(
            Some("job_failed"),
            r#"{"job_id":"j2","error_message":"disk full"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.job_id(), "j2");
        match event {
            JobEvent::Failed(patch) => assert_eq!(patch.error_message.as_deref(), Some("disk full")),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unnamed_uses_type_field() {
        let event = JobEvent::decode(None, r#"{"type":"created","jobId":"j3","status":"pending"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(event, JobEvent::Created(_)));

        let event = JobEvent::decode(None, r#"{"jobId":"j3","progress":5}"#).unwrap().unwrap();
        assert!(matches!(event, JobEvent::Updated(_)));
    }

    #[test]
    fn test_decode_removed_and_foreign_names() {
        let event = JobEvent::decode(Some("job_removed"), r#"{"jobId":"j4"}"#).unwrap().unwrap();
        assert_eq!(event, JobEvent::Removed { job_id: "j4".to_string() });

        assert!(JobEvent::decode(Some("message"), r#"{"jobId":"j4"}"#).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_missing_job_id() {
        assert!(JobEvent::decode(Some("job_progress"), r#"{"progress":3}"#).is_err());
        assert!(JobEvent::decode(Some("job_progress"), "not-json").is_err());
    }
}
