//! Environment lifecycle state machine and service
//! 环境生命周期状态机和服务

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::services::error::{ControlError, ControlResult};
use crate::storage::{Document, JsonStore};

/// Environment lifecycle states / 环境生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Creating,
    Ready,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Deleting,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Creating => "creating",
            EnvironmentStatus::Ready => "ready",
            EnvironmentStatus::Starting => "starting",
            EnvironmentStatus::Running => "running",
            EnvironmentStatus::Stopping => "stopping",
            EnvironmentStatus::Stopped => "stopped",
            EnvironmentStatus::Failed => "failed",
            EnvironmentStatus::Deleting => "deleting",
        }
    }

    /// Whether a transition to `target` is allowed / 是否允许转换到`target`
    ///
    /// Self-transitions are no-ops and always allowed; DELETING has no
    /// outbound transitions.
    /// 自转换是空操作且始终允许；DELETING没有出站转换。
    pub fn can_transition_to(self, target: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;

        if self == target {
            return true;
        }

        matches!(
            (self, target),
            (Creating, Ready)
                | (Creating, Failed)
                | (Ready, Starting)
                | (Ready, Deleting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopped, Deleting)
                | (Failed, Deleting)
        )
    }
}

/// Resource constraints for one environment / 单个环境的资源约束
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores (limit; request is half) / CPU核数（限制；请求为一半）
    pub cpu_cores: f64,
    /// Memory in MiB / 内存（MiB）
    pub memory_mb: u64,
    /// Active deadline for runs in seconds / 运行的活动截止时间（秒）
    pub timeout_seconds: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 512,
            timeout_seconds: 300,
        }
    }
}

/// A container sandbox bound to a program image / 绑定到程序镜像的容器沙箱
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub program_id: String,
    pub image_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub resource_limits: ResourceLimits,
    pub status: EnvironmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Document for Environment {
    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Service owning the environment state machine / 拥有环境状态机的服务
#[derive(Clone)]
pub struct EnvironmentService {
    store: Arc<JsonStore<Environment>>,
}

impl EnvironmentService {
    pub async fn new(storage: &StorageConfig) -> ControlResult<Self> {
        let store = JsonStore::open(
            storage.metadata_dir().join("environments.json"),
            "environments",
        )
        .await?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Create an environment in CREATING state / 创建处于CREATING状态的环境
    pub async fn create_environment(
        &self,
        program_id: impl Into<String>,
        image_tag: impl Into<String>,
        resource_limits: Option<ResourceLimits>,
    ) -> ControlResult<Environment> {
        let now = Utc::now();
        let env = Environment {
            id: Uuid::new_v4().to_string(),
            program_id: program_id.into(),
            image_tag: image_tag.into(),
            container_id: None,
            resource_limits: resource_limits.unwrap_or_default(),
            status: EnvironmentStatus::Creating,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        };
        let created = self.store.create(env).await?;
        info!(environment_id = %created.id, program_id = %created.program_id, "created environment");
        Ok(created)
    }

    pub async fn get_environment(&self, id: &str) -> Option<Environment> {
        self.store.get(id).await
    }

    pub async fn require_environment(&self, id: &str) -> ControlResult<Environment> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| ControlError::not_found("environment", id))
    }

    /// List environments, optionally filtered / 列出环境，可选过滤
    pub async fn list_environments(
        &self,
        program_id: Option<&str>,
        status: Option<EnvironmentStatus>,
    ) -> Vec<Environment> {
        self.store
            .find(|env| {
                if let Some(program_id) = program_id {
                    if env.program_id != program_id {
                        return false;
                    }
                }
                if let Some(status) = status {
                    if env.status != status {
                        return false;
                    }
                }
                true
            })
            .await
    }

    /// Validate and apply a status transition / 验证并应用状态转换
    ///
    /// Stamps `started_at` on entry to RUNNING, `stopped_at` on entry to
    /// STOPPED and records `error_message` on FAILED.
    /// 进入RUNNING时记录`started_at`，进入STOPPED时记录`stopped_at`，
    /// FAILED时记录`error_message`。
    pub async fn update_status(
        &self,
        id: &str,
        target: EnvironmentStatus,
        error: Option<&str>,
        container_id: Option<&str>,
    ) -> ControlResult<Environment> {
        let mut env = self.require_environment(id).await?;

        if !env.status.can_transition_to(target) {
            return Err(ControlError::InvalidStateTransition {
                entity: "environment".to_string(),
                from: env.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }

        let entered = env.status != target;
        debug!(environment_id = %id, from = env.status.as_str(), to = target.as_str(), "environment transition");
        env.status = target;

        if entered && target == EnvironmentStatus::Running {
            env.started_at = Some(Utc::now());
        }
        if entered && target == EnvironmentStatus::Stopped {
            env.stopped_at = Some(Utc::now());
        }
        if target == EnvironmentStatus::Failed {
            env.error_message = error.map(|e| e.to_string());
        }
        if let Some(container_id) = container_id {
            env.container_id = Some(container_id.to_string());
        }

        self.store.update(id, env).await
    }

    /// CREATING -> READY after a successful build / 构建成功后CREATING -> READY
    pub async fn mark_ready(&self, id: &str) -> ControlResult<Environment> {
        self.update_status(id, EnvironmentStatus::Ready, None, None)
            .await
    }

    /// READY -> STARTING / READY -> STARTING
    pub async fn start_environment(&self, id: &str) -> ControlResult<Environment> {
        self.update_status(id, EnvironmentStatus::Starting, None, None)
            .await
    }

    /// STARTING -> RUNNING once the container is observed / 观察到容器后STARTING -> RUNNING
    pub async fn mark_running(
        &self,
        id: &str,
        container_id: Option<&str>,
    ) -> ControlResult<Environment> {
        self.update_status(id, EnvironmentStatus::Running, None, container_id)
            .await
    }

    /// RUNNING -> STOPPING / RUNNING -> STOPPING
    pub async fn stop_environment(&self, id: &str) -> ControlResult<Environment> {
        self.update_status(id, EnvironmentStatus::Stopping, None, None)
            .await
    }

    /// STOPPING -> STOPPED / STOPPING -> STOPPED
    pub async fn mark_stopped(&self, id: &str) -> ControlResult<Environment> {
        self.update_status(id, EnvironmentStatus::Stopped, None, None)
            .await
    }

    /// Any failable state -> FAILED / 任何可失败状态 -> FAILED
    pub async fn mark_failed(&self, id: &str, error: &str) -> ControlResult<Environment> {
        self.update_status(id, EnvironmentStatus::Failed, Some(error), None)
            .await
    }

    /// Enforce the DELETING transition, then remove the record
    /// 强制执行DELETING转换，然后删除记录
    pub async fn delete_environment(&self, id: &str) -> ControlResult<bool> {
        self.update_status(id, EnvironmentStatus::Deleting, None, None)
            .await?;
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!(environment_id = %id, "deleted environment");
        }
        Ok(deleted)
    }
}
