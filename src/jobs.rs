use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    VideoGeneration,
    AiPrefill,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::VideoGeneration => "video_generation",
            JobKind::AiPrefill => "ai_prefill",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One persisted record of a long-running external-service invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub credits_charged: i64,
    pub credits_refunded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(user_id: &str, kind: JobKind, credits_charged: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind,
            status: JobStatus::Pending,
            credits_charged,
            credits_refunded: false,
            error_message: None,
            result_payload: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields a transition may change. Everything is optional so a patch only
/// touches what it names.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub error_message: Option<String>,
    pub result_payload: Option<serde_json::Value>,
    pub credits_refunded: Option<bool>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Persistence seam for job rows. `transition` applies the patch only while
/// the stored status is one of `from` and reports whether a row matched;
/// terminal states are excluded from every `from` list, which is what keeps
/// `completed` and `failed` final and makes replayed callbacks no-ops.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> anyhow::Result<()>;
    async fn fetch(&self, id: Uuid) -> anyhow::Result<Option<Job>>;
    async fn transition(&self, id: Uuid, from: &[JobStatus], patch: JobPatch)
        -> anyhow::Result<bool>;
}

/// States a job may leave on its way to `to`. Used as the `from` filter for
/// every transition so the state machine lives in one place.
pub fn admissible_sources(to: JobStatus) -> &'static [JobStatus] {
    match to {
        JobStatus::Pending => &[],
        JobStatus::Processing => &[JobStatus::Pending],
        JobStatus::Completed => &[JobStatus::Pending, JobStatus::Processing],
        JobStatus::Failed => &[JobStatus::Pending, JobStatus::Processing],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exit() {
        for target in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let sources = admissible_sources(target);
            assert!(sources.iter().all(|source| !source.is_terminal()));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn new_job_starts_pending_and_unrefunded() {
        let job = Job::new("user-1", JobKind::VideoGeneration, 10);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.credits_refunded);
        assert_eq!(job.credits_charged, 10);
    }
}
