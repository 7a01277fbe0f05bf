use chrono::{DateTime, Utc};
use nodetag_core::rebuild::RebuildReport;
use serde::Serialize;
use uuid::Uuid;

/// Jobs kept in the registry before old finished ones are dropped.
const MAX_JOBS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// One background global rebuild, observable by polling.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildJob {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RebuildReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// In-memory registry of global rebuild jobs. At most one may be running at
/// a time; a second trigger is refused while one is in flight.
#[derive(Debug, Default)]
pub struct RebuildRegistry {
    jobs: Vec<RebuildJob>,
}

impl RebuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new running job. Returns `None` when one is already running.
    pub fn start(&mut self) -> Option<Uuid> {
        if self.jobs.iter().any(|j| j.status == JobStatus::Running) {
            return None;
        }
        let id = Uuid::new_v4();
        self.jobs.push(RebuildJob {
            id,
            started_at: Utc::now(),
            finished_at: None,
            status: JobStatus::Running,
            report: None,
            error: None,
        });
        self.trim();
        Some(id)
    }

    pub fn finish(&mut self, id: Uuid, outcome: Result<RebuildReport, String>) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
            job.finished_at = Some(Utc::now());
            match outcome {
                Ok(report) => {
                    job.status = JobStatus::Completed;
                    job.report = Some(report);
                }
                Err(error) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(error);
                }
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&RebuildJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<RebuildJob> {
        let mut jobs = self.jobs.clone();
        jobs.reverse();
        jobs
    }

    fn trim(&mut self) {
        while self.jobs.len() > MAX_JOBS {
            // Drop the oldest finished job; never a running one.
            match self
                .jobs
                .iter()
                .position(|j| j.status != JobStatus::Running)
            {
                Some(idx) => {
                    self.jobs.remove(idx);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_report() -> RebuildReport {
        RebuildReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn only_one_running_job_at_a_time() {
        let mut registry = RebuildRegistry::new();
        let id = registry.start().unwrap();
        assert!(registry.start().is_none());

        registry.finish(id, Ok(empty_report()));
        assert!(registry.start().is_some());
    }

    #[test]
    fn finish_records_failure() {
        let mut registry = RebuildRegistry::new();
        let id = registry.start().unwrap();
        registry.finish(id, Err("disk gone".to_string()));

        let job = registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("disk gone"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn list_is_newest_first() {
        let mut registry = RebuildRegistry::new();
        let first = registry.start().unwrap();
        registry.finish(first, Ok(empty_report()));
        let second = registry.start().unwrap();

        let jobs = registry.list();
        assert_eq!(jobs[0].id, second);
        assert_eq!(jobs[1].id, first);
    }
}
