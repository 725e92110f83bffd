//! Kubernetes adapters for run and build jobs
//! 运行和构建作业的Kubernetes适配器

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use serde::{Deserialize, Serialize};

pub mod jobs;
pub mod kaniko;

/// Convert a k8s-openapi `Time` (backed by `jiff::Timestamp`) into a chrono `DateTime<Utc>`
/// 将 k8s-openapi 的 `Time`（底层为 `jiff::Timestamp`）转换为 chrono 的 `DateTime<Utc>`
pub(crate) fn jiff_timestamp_to_chrono(ts: k8s_openapi::jiff::Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.as_second(), ts.subsec_nanosecond() as u32)
        .unwrap_or_else(Utc::now)
}

pub use jobs::{K8sJobService, RunJobApi, RunJobRequest};
pub use kaniko::{BuildJobApi, BuildJobRequest, KanikoBuildService};

/// Label applied to every resource this control plane creates
/// 此控制平面创建的每个资源都带有的标签
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const PART_OF_VALUE: &str = "mellea";
pub const ENVIRONMENT_ID_LABEL: &str = "mellea.io/environment-id";
pub const PROGRAM_ID_LABEL: &str = "mellea.io/program-id";
pub const JOB_TYPE_LABEL: &str = "mellea.io/job-type";
pub const IMAGE_TAG_ANNOTATION: &str = "mellea.io/image-tag";

/// Coarse job status derived from cluster state / 从集群状态派生的粗粒度作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Snapshot of a Kubernetes Job / Kubernetes作业的快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub namespace: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Derive a [`JobStatus`] from Job conditions and counters
/// 从作业条件和计数器派生[`JobStatus`]
///
/// Conditions win over counters: a `Complete`/`Failed` condition with status
/// "True" is authoritative; otherwise active/succeeded/failed counts decide.
/// 条件优先于计数器：状态为"True"的`Complete`/`Failed`条件具有权威性；
/// 否则由active/succeeded/failed计数决定。
pub fn derive_job_status(job: &Job) -> JobStatus {
    let Some(status) = job.status.as_ref() else {
        return JobStatus::Pending;
    };

    if let Some(conditions) = status.conditions.as_ref() {
        for condition in conditions {
            if condition.type_ == "Complete" && condition.status == "True" {
                return JobStatus::Succeeded;
            }
            if condition.type_ == "Failed" && condition.status == "True" {
                return JobStatus::Failed;
            }
        }
    }

    if status.active.unwrap_or(0) > 0 {
        return JobStatus::Running;
    }
    if status.succeeded.unwrap_or(0) > 0 {
        return JobStatus::Succeeded;
    }
    if status.failed.unwrap_or(0) > 0 {
        return JobStatus::Failed;
    }

    JobStatus::Pending
}

/// Lowercased short id used in resource names / 资源名称中使用的小写短id
pub fn short_id(id: &str) -> String {
    let end = id.char_indices().nth(8).map(|(i, _)| i).unwrap_or(id.len());
    id[..end].to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus as K8sJobStatus};

    fn job_with_status(status: K8sJobStatus) -> Job {
        Job {
            status: Some(status),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_no_status_is_pending() {
        assert_eq!(derive_job_status(&Job::default()), JobStatus::Pending);
    }

    #[test]
    fn test_status_conditions_win() {
        let job = job_with_status(K8sJobStatus {
            conditions: Some(vec![condition("Complete", "True")]),
            active: Some(1),
            ..Default::default()
        });
        assert_eq!(derive_job_status(&job), JobStatus::Succeeded);

        let job = job_with_status(K8sJobStatus {
            conditions: Some(vec![condition("Failed", "True")]),
            active: Some(1),
            ..Default::default()
        });
        assert_eq!(derive_job_status(&job), JobStatus::Failed);

        // A condition that is not "True" does not decide / 非"True"的条件不决定状态
        let job = job_with_status(K8sJobStatus {
            conditions: Some(vec![condition("Complete", "False")]),
            active: Some(1),
            ..Default::default()
        });
        assert_eq!(derive_job_status(&job), JobStatus::Running);
    }

    #[test]
    fn test_status_counters() {
        let job = job_with_status(K8sJobStatus {
            active: Some(1),
            ..Default::default()
        });
        assert_eq!(derive_job_status(&job), JobStatus::Running);

        let job = job_with_status(K8sJobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(derive_job_status(&job), JobStatus::Succeeded);

        let job = job_with_status(K8sJobStatus {
            failed: Some(1),
            ..Default::default()
        });
        assert_eq!(derive_job_status(&job), JobStatus::Failed);

        let job = job_with_status(K8sJobStatus::default());
        assert_eq!(derive_job_status(&job), JobStatus::Pending);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("ABCDEF1234567890"), "abcdef12");
        assert_eq!(short_id("ab"), "ab");
    }
}
