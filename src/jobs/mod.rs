use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Lower runs first
    pub fn rank(&self) -> u8 {
        match self {
            JobPriority::Urgent => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

/// Prioritized unit of crawl work, one per seed URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    /// Crawl configuration the job runs with
    pub config: Value,
    /// Job this one retries
    pub parent_job_id: Option<String>,
}

impl Job {
    pub fn new(url: impl Into<String>, priority: JobPriority, config: Value, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            error: None,
            config,
            parent_job_id: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Cannot {action} job {id} while it is {status:?}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: JobStatus,
    },

    #[error("Job {id} has used all {max_retries} retries")]
    RetriesExhausted { id: String, max_retries: u32 },
}

/// Order by priority, then oldest first
pub fn sort_by_priority(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.priority
            .rank()
            .cmp(&b.priority.rank())
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// In-process job registry with status transitions and retry-as-new-job
pub struct JobManager {
    jobs: Mutex<HashMap<String, Job>>,
    default_max_retries: u32,
}

impl JobManager {
    pub fn new(default_max_retries: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            default_max_retries,
        }
    }

    pub async fn create(&self, url: &str, priority: JobPriority, config: Value) -> Job {
        let job = Job::new(url, priority, config, self.default_max_retries);
        info!("Created {:?} priority job {} for {}", priority, job.id, url);
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        job
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.lock().await.get(id).cloned()
    }

    /// Jobs, optionally filtered by status, in priority order
    pub async fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        sort_by_priority(&mut jobs);
        jobs
    }

    /// Highest priority pending job
    pub async fn next_pending(&self) -> Option<Job> {
        self.list(Some(JobStatus::Pending)).await.into_iter().next()
    }

    async fn transition(
        &self,
        id: &str,
        action: &'static str,
        allowed: &[JobStatus],
        to: JobStatus,
        error: Option<String>,
    ) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if !allowed.contains(&job.status) {
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                action,
                status: job.status,
            });
        }

        debug!("Job {} {:?} -> {:?}", id, job.status, to);
        job.status = to;
        job.updated_at = Utc::now();
        if error.is_some() {
            job.error = error;
        }

        Ok(job.clone())
    }

    pub async fn start(&self, id: &str) -> Result<Job, JobError> {
        self.transition(id, "start", &[JobStatus::Pending], JobStatus::Running, None)
            .await
    }

    pub async fn pause(&self, id: &str) -> Result<Job, JobError> {
        self.transition(id, "pause", &[JobStatus::Running], JobStatus::Paused, None)
            .await
    }

    pub async fn resume(&self, id: &str) -> Result<Job, JobError> {
        self.transition(id, "resume", &[JobStatus::Paused], JobStatus::Running, None)
            .await
    }

    pub async fn cancel(&self, id: &str) -> Result<Job, JobError> {
        self.transition(
            id,
            "cancel",
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Paused],
            JobStatus::Cancelled,
            None,
        )
        .await
    }

    pub async fn complete(&self, id: &str) -> Result<Job, JobError> {
        self.transition(id, "complete", &[JobStatus::Running], JobStatus::Completed, None)
            .await
    }

    pub async fn fail(&self, id: &str, error: &str) -> Result<Job, JobError> {
        self.transition(
            id,
            "fail",
            &[JobStatus::Running, JobStatus::Paused],
            JobStatus::Failed,
            Some(error.to_string()),
        )
        .await
    }

    /// Queue a fresh copy of a failed or cancelled job.
    ///
    /// The original keeps its terminal status.
    pub async fn retry(&self, id: &str) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let original = jobs.get(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                action: "retry",
                status: original.status,
            });
        }
        if original.retry_count >= original.max_retries {
            return Err(JobError::RetriesExhausted {
                id: id.to_string(),
                max_retries: original.max_retries,
            });
        }

        let mut retry = Job::new(
            original.url.clone(),
            original.priority,
            original.config.clone(),
            original.max_retries,
        );
        retry.retry_count = original.retry_count + 1;
        retry.parent_job_id = Some(original.id.clone());

        info!(
            "Retrying job {} as {} (attempt {}/{})",
            id, retry.id, retry.retry_count, retry.max_retries
        );
        jobs.insert(retry.id.clone(), retry.clone());

        Ok(retry)
    }
}
