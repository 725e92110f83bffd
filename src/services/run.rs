//! Run lifecycle state machine and service
//! 运行生命周期状态机和服务

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::services::error::{ControlError, ControlResult};
use crate::storage::{Document, JsonStore};

/// Run execution states / 运行执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are absorbing / 终态是吸收态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether a transition to `target` is allowed / 是否允许转换到`target`
    pub fn can_transition_to(self, target: RunStatus) -> bool {
        use RunStatus::*;

        if self == target {
            return true;
        }
        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, target),
            (Queued, Starting)
                | (Queued, Cancelled)
                // Submission rejected before a job was created
                // 在创建作业之前提交被拒绝
                | (Queued, Failed)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// A single execution of a program inside an environment
/// 程序在环境中的单次执行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub environment_id: String,
    pub program_id: String,
    #[serde(default)]
    pub credential_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Document for Run {
    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Service owning the run state machine / 拥有运行状态机的服务
#[derive(Clone)]
pub struct RunService {
    store: Arc<JsonStore<Run>>,
}

impl RunService {
    pub async fn new(storage: &StorageConfig) -> ControlResult<Self> {
        let store = JsonStore::open(storage.metadata_dir().join("runs.json"), "runs").await?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Create a run in QUEUED state / 创建处于QUEUED状态的运行
    pub async fn create_run(
        &self,
        environment_id: impl Into<String>,
        program_id: impl Into<String>,
        credential_ids: Vec<String>,
    ) -> ControlResult<Run> {
        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4().to_string(),
            environment_id: environment_id.into(),
            program_id: program_id.into(),
            credential_ids,
            job_name: None,
            status: RunStatus::Queued,
            exit_code: None,
            error_message: None,
            output_path: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        let created = self.store.create(run).await?;
        info!(run_id = %created.id, environment_id = %created.environment_id, "created run");
        Ok(created)
    }

    pub async fn get_run(&self, id: &str) -> Option<Run> {
        self.store.get(id).await
    }

    pub async fn require_run(&self, id: &str) -> ControlResult<Run> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| ControlError::not_found("run", id))
    }

    /// List runs, optionally filtered / 列出运行，可选过滤
    pub async fn list_runs(
        &self,
        environment_id: Option<&str>,
        status: Option<RunStatus>,
    ) -> Vec<Run> {
        self.store
            .find(|run| {
                if let Some(environment_id) = environment_id {
                    if run.environment_id != environment_id {
                        return false;
                    }
                }
                if let Some(status) = status {
                    if run.status != status {
                        return false;
                    }
                }
                true
            })
            .await
    }

    /// Validate and apply a status transition, stamping timestamps
    /// 验证并应用状态转换，并记录时间戳
    async fn transition(
        &self,
        id: &str,
        target: RunStatus,
        mutate: impl FnOnce(&mut Run),
    ) -> ControlResult<Run> {
        let mut run = self.require_run(id).await?;

        if !run.status.can_transition_to(target) {
            return Err(ControlError::InvalidStateTransition {
                entity: "run".to_string(),
                from: run.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }

        // Self-transition is a no-op; nothing is rewritten.
        // 自转换是空操作；不重写任何内容。
        if run.status == target {
            return Ok(run);
        }

        debug!(run_id = %id, from = run.status.as_str(), to = target.as_str(), "run transition");
        run.status = target;

        if target == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        if target.is_terminal() {
            run.completed_at = Some(Utc::now());
        }

        mutate(&mut run);
        self.store.update(id, run).await
    }

    /// QUEUED -> STARTING with the generated job name / QUEUED -> STARTING并记录作业名
    pub async fn start_run(&self, id: &str, job_name: &str) -> ControlResult<Run> {
        let job_name = job_name.to_string();
        self.transition(id, RunStatus::Starting, move |run| {
            run.job_name = Some(job_name);
        })
        .await
    }

    /// STARTING -> RUNNING once the pod is active / Pod活跃后STARTING -> RUNNING
    pub async fn mark_running(&self, id: &str) -> ControlResult<Run> {
        self.transition(id, RunStatus::Running, |_| {}).await
    }

    /// RUNNING -> SUCCEEDED / RUNNING -> SUCCEEDED
    pub async fn mark_succeeded(
        &self,
        id: &str,
        exit_code: Option<i32>,
        output_path: Option<String>,
    ) -> ControlResult<Run> {
        self.transition(id, RunStatus::Succeeded, move |run| {
            run.exit_code = exit_code;
            run.output_path = output_path;
        })
        .await
    }

    /// STARTING/RUNNING -> FAILED / STARTING/RUNNING -> FAILED
    pub async fn mark_failed(
        &self,
        id: &str,
        exit_code: Option<i32>,
        error: &str,
    ) -> ControlResult<Run> {
        let error = error.to_string();
        self.transition(id, RunStatus::Failed, move |run| {
            run.exit_code = exit_code;
            run.error_message = Some(error);
        })
        .await
    }

    /// Any non-terminal state -> CANCELLED / 任何非终态 -> CANCELLED
    pub async fn cancel_run(&self, id: &str) -> ControlResult<Run> {
        self.transition(id, RunStatus::Cancelled, |_| {}).await
    }

    /// Remove a run record / 删除运行记录
    pub async fn delete_run(&self, id: &str) -> ControlResult<bool> {
        self.store.delete(id).await
    }

    /// Direct store access for tests that need to backdate records
    /// 供需要回溯记录时间的测试直接访问存储
    #[cfg(test)]
    pub(crate) fn store_for_tests(&self) -> &JsonStore<Run> {
        &self.store
    }
}
