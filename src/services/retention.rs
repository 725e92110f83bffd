//! Retention policies and their cleanup controller
//! 保留策略及其清理控制器
//!
//! User-defined rules over artifacts, runs and environments, evaluated
//! periodically by priority. Four system policies are seeded exactly once,
//! when the policy store is empty.
//! 针对工件、运行和环境的用户定义规则，按优先级定期评估。四个系统策略仅在
//! 策略存储为空时播种一次。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{RetentionConfig, StorageConfig};
use crate::services::artifact::{Artifact, ArtifactCollectorService};
use crate::services::environment::{Environment, EnvironmentService, EnvironmentStatus};
use crate::services::error::{ControlError, ControlResult};
use crate::services::run::{Run, RunService};
use crate::storage::{Document, JsonStore};

/// Resource kinds a policy can target / 策略可针对的资源种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Artifact,
    Run,
    Environment,
    Log,
}

/// Conditions a policy can evaluate / 策略可评估的条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionCondition {
    AgeDays,
    SizeBytes,
    Status,
    UnusedDays,
}

/// A retention rule / 一条保留规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub resource_type: ResourceType,
    pub condition: RetentionCondition,
    pub threshold: i64,
    /// Required when condition is `Status` / 条件为`Status`时必需
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_value: Option<String>,
    pub enabled: bool,
    /// Higher priority evaluates first / 优先级高的先评估
    pub priority: i32,
    /// None = system-wide / None = 全系统
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document for RetentionPolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Metrics from one retention cycle / 单次保留周期的指标
#[derive(Debug, Clone, Default)]
pub struct RetentionMetrics {
    pub policies_evaluated: usize,
    pub artifacts_deleted: usize,
    pub runs_deleted: usize,
    pub environments_cleaned: usize,
    pub storage_freed_bytes: u64,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

/// Dry-run result of a policy / 策略的试运行结果
#[derive(Debug, Clone)]
pub struct PolicyPreviewResult {
    pub policy_id: String,
    pub resource_type: ResourceType,
    pub matching_count: usize,
    pub total_size_bytes: u64,
    pub resource_ids: Vec<String>,
}

/// Field updates for a policy / 策略的字段更新
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub threshold: Option<i64>,
    pub status_value: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

struct SeedPolicy {
    name: &'static str,
    description: &'static str,
    resource_type: ResourceType,
    condition: RetentionCondition,
    threshold: i64,
    status_value: Option<&'static str>,
    priority: i32,
}

/// Policies seeded into an empty store / 播种到空存储中的策略
const DEFAULT_POLICIES: [SeedPolicy; 4] = [
    SeedPolicy {
        name: "artifact-30-day",
        description: "Delete artifacts older than 30 days",
        resource_type: ResourceType::Artifact,
        condition: RetentionCondition::AgeDays,
        threshold: 30,
        status_value: None,
        priority: 0,
    },
    SeedPolicy {
        name: "run-7-day",
        description: "Delete completed runs older than 7 days",
        resource_type: ResourceType::Run,
        condition: RetentionCondition::AgeDays,
        threshold: 7,
        status_value: None,
        priority: 0,
    },
    SeedPolicy {
        name: "failed-run-3-day",
        description: "Delete failed runs older than 3 days",
        resource_type: ResourceType::Run,
        condition: RetentionCondition::Status,
        threshold: 3,
        status_value: Some("failed"),
        priority: 1,
    },
    SeedPolicy {
        name: "large-artifact-7-day",
        description: "Delete artifacts larger than 500MB after 7 days",
        resource_type: ResourceType::Artifact,
        condition: RetentionCondition::SizeBytes,
        threshold: 500 * 1024 * 1024,
        status_value: None,
        priority: 1,
    },
];

fn age_days(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_days()
}

/// Service owning retention policies / 拥有保留策略的服务
#[derive(Clone)]
pub struct RetentionPolicyService {
    store: Arc<JsonStore<RetentionPolicy>>,
    artifacts: ArtifactCollectorService,
    runs: RunService,
    environments: EnvironmentService,
    last_metrics: Arc<parking_lot::RwLock<Option<RetentionMetrics>>>,
}

impl RetentionPolicyService {
    /// Open the policy store, seeding defaults when it is empty
    /// 打开策略存储，为空时播种默认策略
    pub async fn new(
        storage: &StorageConfig,
        artifacts: ArtifactCollectorService,
        runs: RunService,
        environments: EnvironmentService,
    ) -> ControlResult<Self> {
        let store = JsonStore::open(
            storage.metadata_dir().join("retention_policies.json"),
            "policies",
        )
        .await?;

        let service = Self {
            store: Arc::new(store),
            artifacts,
            runs,
            environments,
            last_metrics: Arc::new(parking_lot::RwLock::new(None)),
        };
        service.seed_default_policies().await?;
        Ok(service)
    }

    async fn seed_default_policies(&self) -> ControlResult<()> {
        if self.store.count().await > 0 {
            return Ok(());
        }

        info!("seeding default retention policies");
        for seed in &DEFAULT_POLICIES {
            let now = Utc::now();
            let policy = RetentionPolicy {
                id: Uuid::new_v4().to_string(),
                name: seed.name.to_string(),
                description: Some(seed.description.to_string()),
                resource_type: seed.resource_type,
                condition: seed.condition,
                threshold: seed.threshold,
                status_value: seed.status_value.map(|s| s.to_string()),
                enabled: true,
                priority: seed.priority,
                user_id: None,
                created_at: now,
                updated_at: now,
            };
            self.store.create(policy).await?;
            info!(name = %seed.name, "created default policy");
        }
        Ok(())
    }

    /// Create a custom policy / 创建自定义策略
    #[allow(clippy::too_many_arguments)]
    pub async fn create_policy(
        &self,
        name: impl Into<String>,
        resource_type: ResourceType,
        condition: RetentionCondition,
        threshold: i64,
        status_value: Option<String>,
        priority: i32,
        user_id: Option<String>,
    ) -> ControlResult<RetentionPolicy> {
        let now = Utc::now();
        let policy = RetentionPolicy {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            resource_type,
            condition,
            threshold,
            status_value,
            enabled: true,
            priority,
            user_id,
            created_at: now,
            updated_at: now,
        };
        let created = self.store.create(policy).await?;
        info!(policy_id = %created.id, name = %created.name, "created retention policy");
        Ok(created)
    }

    pub async fn get_policy(&self, policy_id: &str) -> Option<RetentionPolicy> {
        self.store.get(policy_id).await
    }

    /// List policies, highest priority first / 列出策略，优先级最高的在前
    pub async fn list_policies(
        &self,
        resource_type: Option<ResourceType>,
        enabled_only: bool,
        user_id: Option<&str>,
    ) -> Vec<RetentionPolicy> {
        let mut policies = self
            .store
            .find(|policy| {
                if let Some(resource_type) = resource_type {
                    if policy.resource_type != resource_type {
                        return false;
                    }
                }
                if enabled_only && !policy.enabled {
                    return false;
                }
                if let Some(user_id) = user_id {
                    // User policies plus system-wide ones / 用户策略加全系统策略
                    if !matches!(policy.user_id.as_deref(), Some(owner) if owner == user_id)
                        && policy.user_id.is_some()
                    {
                        return false;
                    }
                }
                true
            })
            .await;

        policies.sort_by(|a, b| b.priority.cmp(&a.priority));
        policies
    }

    pub async fn update_policy(
        &self,
        policy_id: &str,
        update: PolicyUpdate,
    ) -> ControlResult<RetentionPolicy> {
        let mut policy = self
            .store
            .get(policy_id)
            .await
            .ok_or_else(|| ControlError::not_found("policy", policy_id))?;

        if let Some(name) = update.name {
            policy.name = name;
        }
        if let Some(description) = update.description {
            policy.description = Some(description);
        }
        if let Some(threshold) = update.threshold {
            policy.threshold = threshold;
        }
        if let Some(status_value) = update.status_value {
            policy.status_value = Some(status_value);
        }
        if let Some(enabled) = update.enabled {
            policy.enabled = enabled;
        }
        if let Some(priority) = update.priority {
            policy.priority = priority;
        }

        let updated = self.store.update(policy_id, policy).await?;
        info!(policy_id = %policy_id, "updated retention policy");
        Ok(updated)
    }

    pub async fn delete_policy(&self, policy_id: &str) -> ControlResult<bool> {
        let deleted = self.store.delete(policy_id).await?;
        if deleted {
            info!(policy_id = %policy_id, "deleted retention policy");
        }
        Ok(deleted)
    }

    /// Artifacts matching a policy / 匹配策略的工件
    async fn evaluate_artifact_policy(&self, policy: &RetentionPolicy) -> Vec<Artifact> {
        let now = Utc::now();
        self.artifacts
            .list_artifacts(None, None, None, None)
            .await
            .into_iter()
            .filter(|artifact| match policy.condition {
                RetentionCondition::AgeDays => {
                    age_days(artifact.created_at, now) >= policy.threshold
                }
                RetentionCondition::SizeBytes => {
                    // Size policies still require a minimum age
                    // 大小策略仍要求最小年龄
                    artifact.size_bytes >= policy.threshold as u64
                        && age_days(artifact.created_at, now) >= 7
                }
                RetentionCondition::UnusedDays => {
                    // created_at stands in for last access / created_at代替最后访问时间
                    age_days(artifact.created_at, now) >= policy.threshold
                }
                RetentionCondition::Status => false,
            })
            .collect()
    }

    /// Terminal runs matching a policy / 匹配策略的终态运行
    async fn evaluate_run_policy(&self, policy: &RetentionPolicy) -> Vec<Run> {
        let now = Utc::now();
        self.runs
            .list_runs(None, None)
            .await
            .into_iter()
            .filter(|run| {
                if !run.status.is_terminal() {
                    return false;
                }
                let completed_at = run.completed_at.unwrap_or(run.created_at);
                match policy.condition {
                    RetentionCondition::AgeDays => age_days(completed_at, now) >= policy.threshold,
                    RetentionCondition::Status => match policy.status_value.as_deref() {
                        Some(status_value) => {
                            run.status.as_str() == status_value
                                && age_days(completed_at, now) >= policy.threshold
                        }
                        None => false,
                    },
                    _ => false,
                }
            })
            .collect()
    }

    /// STOPPED or FAILED environments matching a policy
    /// 匹配策略的STOPPED或FAILED环境
    async fn evaluate_environment_policy(&self, policy: &RetentionPolicy) -> Vec<Environment> {
        let now = Utc::now();
        self.environments
            .list_environments(None, None)
            .await
            .into_iter()
            .filter(|env| {
                if !matches!(
                    env.status,
                    EnvironmentStatus::Stopped | EnvironmentStatus::Failed
                ) {
                    return false;
                }
                match policy.condition {
                    RetentionCondition::AgeDays => {
                        age_days(env.updated_at, now) >= policy.threshold
                    }
                    RetentionCondition::Status => match policy.status_value.as_deref() {
                        Some(status_value) => {
                            env.status.as_str() == status_value
                                && age_days(env.updated_at, now) >= policy.threshold
                        }
                        None => false,
                    },
                    RetentionCondition::UnusedDays => {
                        age_days(env.updated_at, now) >= policy.threshold
                    }
                    RetentionCondition::SizeBytes => false,
                }
            })
            .collect()
    }

    /// What a policy would delete right now / 策略现在会删除什么
    pub async fn preview_policy(&self, policy_id: &str) -> ControlResult<PolicyPreviewResult> {
        let policy = self
            .store
            .get(policy_id)
            .await
            .ok_or_else(|| ControlError::not_found("policy", policy_id))?;

        let (resource_ids, total_size_bytes) = match policy.resource_type {
            ResourceType::Artifact => {
                let artifacts = self.evaluate_artifact_policy(&policy).await;
                let size = artifacts.iter().map(|a| a.size_bytes).sum();
                (artifacts.into_iter().map(|a| a.id).collect::<Vec<_>>(), size)
            }
            ResourceType::Run => (
                self.evaluate_run_policy(&policy)
                    .await
                    .into_iter()
                    .map(|r| r.id)
                    .collect(),
                0,
            ),
            ResourceType::Environment => (
                self.evaluate_environment_policy(&policy)
                    .await
                    .into_iter()
                    .map(|e| e.id)
                    .collect(),
                0,
            ),
            ResourceType::Log => (Vec::new(), 0),
        };

        Ok(PolicyPreviewResult {
            policy_id: policy.id,
            resource_type: policy.resource_type,
            matching_count: resource_ids.len(),
            total_size_bytes,
            resource_ids,
        })
    }

    async fn apply_artifact_policy(
        &self,
        policy: &RetentionPolicy,
        metrics: &mut RetentionMetrics,
    ) {
        for artifact in self.evaluate_artifact_policy(policy).await {
            let size = artifact.size_bytes;
            match self.artifacts.delete_artifact(&artifact.id).await {
                Ok(true) => {
                    metrics.artifacts_deleted += 1;
                    metrics.storage_freed_bytes += size;
                    debug!(policy = %policy.name, artifact_id = %artifact.id, "policy deleted artifact");
                }
                Ok(false) => {}
                Err(e) => {
                    metrics
                        .errors
                        .push(format!("failed to delete artifact {}: {e}", artifact.id));
                }
            }
        }
    }

    async fn apply_run_policy(&self, policy: &RetentionPolicy, metrics: &mut RetentionMetrics) {
        for run in self.evaluate_run_policy(policy).await {
            match self.runs.delete_run(&run.id).await {
                Ok(true) => {
                    metrics.runs_deleted += 1;
                    debug!(policy = %policy.name, run_id = %run.id, "policy deleted run");
                }
                Ok(false) => {}
                Err(e) => {
                    metrics
                        .errors
                        .push(format!("failed to delete run {}: {e}", run.id));
                }
            }
        }
    }

    async fn apply_environment_policy(
        &self,
        policy: &RetentionPolicy,
        metrics: &mut RetentionMetrics,
    ) {
        for environment in self.evaluate_environment_policy(policy).await {
            match self.environments.delete_environment(&environment.id).await {
                Ok(true) => {
                    metrics.environments_cleaned += 1;
                    debug!(policy = %policy.name, environment_id = %environment.id, "policy cleaned environment");
                }
                Ok(false) => {}
                Err(e) => {
                    metrics.errors.push(format!(
                        "failed to clean environment {}: {e}",
                        environment.id
                    ));
                }
            }
        }
    }

    /// One cleanup cycle over all enabled policies / 针对所有启用策略的一次清理周期
    pub async fn run_cleanup_cycle(&self) -> RetentionMetrics {
        let start = std::time::Instant::now();
        let mut metrics = RetentionMetrics::default();

        info!("starting retention policy cleanup cycle");

        let policies = self.list_policies(None, true, None).await;
        metrics.policies_evaluated = policies.len();

        for policy in &policies {
            match policy.resource_type {
                ResourceType::Artifact => self.apply_artifact_policy(policy, &mut metrics).await,
                ResourceType::Run => self.apply_run_policy(policy, &mut metrics).await,
                ResourceType::Environment => {
                    self.apply_environment_policy(policy, &mut metrics).await
                }
                // Log cleanup is handled by the logging stack itself
                // 日志清理由日志栈自行处理
                ResourceType::Log => {}
            }
        }

        metrics.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            policies = metrics.policies_evaluated,
            artifacts = metrics.artifacts_deleted,
            runs = metrics.runs_deleted,
            environments = metrics.environments_cleaned,
            freed_bytes = metrics.storage_freed_bytes,
            duration = metrics.duration_seconds,
            "retention cleanup cycle complete"
        );

        *self.last_metrics.write() = Some(metrics.clone());
        metrics
    }

    pub fn last_metrics(&self) -> Option<RetentionMetrics> {
        self.last_metrics.read().clone()
    }
}

/// Background controller applying retention policies / 应用保留策略的后台控制器
pub struct RetentionPolicyController {
    config: RetentionConfig,
    service: Arc<RetentionPolicyService>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl RetentionPolicyController {
    pub fn new(config: RetentionConfig, service: Arc<RetentionPolicyService>) -> Self {
        Self {
            config,
            service,
            task: parking_lot::Mutex::new(None),
            cancel: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn start(&self) {
        if !self.config.enabled {
            info!("retention policy controller is disabled");
            return;
        }
        if self.is_running() {
            warn!("retention policy controller is already running");
            return;
        }

        let cancel = CancellationToken::new();
        let service = self.service.clone();
        let interval = std::time::Duration::from_secs(self.config.interval_seconds);
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            info!(interval_seconds = interval.as_secs(), "retention policy controller started");
            loop {
                let metrics = service.run_cleanup_cycle().await;
                for err in &metrics.errors {
                    error!(error = %err, "retention cleanup error");
                }

                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("retention policy controller stopped");
        });

        *self.cancel.lock() = Some(cancel);
        *self.task.lock() = Some(task);
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifactConfig;
    use crate::services::artifact::{CollectOptions, UserQuotas};
    use chrono::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: StorageConfig,
        artifacts: ArtifactCollectorService,
        runs: RunService,
        environments: EnvironmentService,
        service: RetentionPolicyService,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            data_dir: dir.path().to_path_buf(),
        };
        let artifacts = ArtifactCollectorService::new(&storage, ArtifactConfig::default())
            .await
            .unwrap();
        let runs = RunService::new(&storage).await.unwrap();
        let environments = EnvironmentService::new(&storage).await.unwrap();
        let service = RetentionPolicyService::new(
            &storage,
            artifacts.clone(),
            runs.clone(),
            environments.clone(),
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            storage,
            artifacts,
            runs,
            environments,
            service,
        }
    }

    #[tokio::test]
    async fn test_default_policies_seeded_once() {
        let fixture = fixture().await;
        let policies = fixture.service.list_policies(None, false, None).await;
        let mut names: Vec<&str> = policies.iter().map(|p| p.name.as_str()).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "artifact-30-day",
                "failed-run-3-day",
                "large-artifact-7-day",
                "run-7-day"
            ]
        );

        // Delete one and re-open the service over the same store: the
        // deleted policy must not come back.
        // 删除一个并在同一存储上重新打开服务：被删除的策略不得回来。
        let doomed = policies.iter().find(|p| p.name == "run-7-day").unwrap();
        assert!(fixture.service.delete_policy(&doomed.id).await.unwrap());

        let reopened = RetentionPolicyService::new(
            &fixture.storage,
            fixture.artifacts.clone(),
            fixture.runs.clone(),
            fixture.environments.clone(),
        )
        .await
        .unwrap();
        let names: Vec<String> = reopened
            .list_policies(None, false, None)
            .await
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names.len(), 3);
        assert!(!names.contains(&"run-7-day".to_string()));
    }

    #[tokio::test]
    async fn test_list_policies_priority_and_filters() {
        let fixture = fixture().await;
        let policies = fixture.service.list_policies(None, true, None).await;
        // Priority 1 policies come first / 优先级1的策略在前
        assert_eq!(policies[0].priority, 1);
        assert_eq!(policies[1].priority, 1);

        let artifact_policies = fixture
            .service
            .list_policies(Some(ResourceType::Artifact), false, None)
            .await;
        assert_eq!(artifact_policies.len(), 2);

        // User filter keeps system-wide policies visible
        // 用户过滤器仍显示全系统策略
        fixture
            .service
            .create_policy(
                "user-logs",
                ResourceType::Artifact,
                RetentionCondition::AgeDays,
                14,
                None,
                0,
                Some("user-1".to_string()),
            )
            .await
            .unwrap();
        let for_user = fixture
            .service
            .list_policies(None, false, Some("user-1"))
            .await;
        assert_eq!(for_user.len(), 5);
        let for_other = fixture
            .service
            .list_policies(None, false, Some("user-2"))
            .await;
        assert_eq!(for_other.len(), 4);
    }

    async fn backdated_artifact(
        fixture: &Fixture,
        name: &str,
        size: usize,
        age_days: i64,
    ) -> Artifact {
        let artifact = fixture
            .artifacts
            .collect_artifact_from_bytes(
                "run-1",
                "user-1",
                &vec![0u8; size],
                name,
                &UserQuotas {
                    max_storage_mb: 10_000,
                },
                CollectOptions::default(),
            )
            .await
            .unwrap();
        // Backdate through the store / 通过存储回溯时间
        let mut aged = fixture.artifacts.get_artifact(&artifact.id).await.unwrap();
        aged.created_at = Utc::now() - Duration::days(age_days);
        fixture
            .artifacts
            .artifact_store_for_tests()
            .update(&artifact.id, aged)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_age_policy_deletes_old_artifacts() {
        let fixture = fixture().await;
        let old = backdated_artifact(&fixture, "old.bin", 10, 45).await;
        backdated_artifact(&fixture, "new.bin", 10, 1).await;

        let metrics = fixture.service.run_cleanup_cycle().await;
        assert_eq!(metrics.artifacts_deleted, 1);
        assert_eq!(metrics.storage_freed_bytes, 10);
        assert!(fixture.artifacts.get_artifact(&old.id).await.is_none());
    }

    #[tokio::test]
    async fn test_preview_does_not_delete() {
        let fixture = fixture().await;
        let old = backdated_artifact(&fixture, "old.bin", 10, 45).await;

        let policy = fixture
            .service
            .list_policies(Some(ResourceType::Artifact), false, None)
            .await
            .into_iter()
            .find(|p| p.name == "artifact-30-day")
            .unwrap();

        let preview = fixture.service.preview_policy(&policy.id).await.unwrap();
        assert_eq!(preview.matching_count, 1);
        assert_eq!(preview.total_size_bytes, 10);
        assert_eq!(preview.resource_ids, vec![old.id.clone()]);

        // Still there / 仍然存在
        assert!(fixture.artifacts.get_artifact(&old.id).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_policy_matches_status_and_age() {
        let fixture = fixture().await;

        // An old failed run / 一个旧的失败运行
        let failed = fixture
            .runs
            .create_run("env-1", "prog-1", vec![])
            .await
            .unwrap();
        fixture
            .runs
            .start_run(&failed.id, "job-1")
            .await
            .unwrap();
        fixture
            .runs
            .mark_failed(&failed.id, Some(1), "boom")
            .await
            .unwrap();
        let mut backdated = fixture.runs.get_run(&failed.id).await.unwrap();
        backdated.completed_at = Some(Utc::now() - Duration::days(5));
        fixture
            .runs
            .store_for_tests()
            .update(&failed.id, backdated)
            .await
            .unwrap();

        // A fresh failed run stays / 新的失败运行保留
        let fresh = fixture
            .runs
            .create_run("env-1", "prog-1", vec![])
            .await
            .unwrap();
        fixture.runs.start_run(&fresh.id, "job-2").await.unwrap();
        fixture
            .runs
            .mark_failed(&fresh.id, Some(1), "boom")
            .await
            .unwrap();

        let metrics = fixture.service.run_cleanup_cycle().await;
        assert_eq!(metrics.runs_deleted, 1);
        assert!(fixture.runs.get_run(&failed.id).await.is_none());
        assert!(fixture.runs.get_run(&fresh.id).await.is_some());
    }

    #[tokio::test]
    async fn test_environment_policy_cleans_stopped_and_failed() {
        let fixture = fixture().await;
        fixture
            .service
            .create_policy(
                "env-sweep",
                ResourceType::Environment,
                RetentionCondition::AgeDays,
                0,
                None,
                0,
                None,
            )
            .await
            .unwrap();

        let stopped = fixture
            .environments
            .create_environment("prog-1", "image:1", None)
            .await
            .unwrap();
        fixture.environments.mark_ready(&stopped.id).await.unwrap();
        fixture
            .environments
            .start_environment(&stopped.id)
            .await
            .unwrap();
        fixture
            .environments
            .mark_running(&stopped.id, None)
            .await
            .unwrap();
        fixture
            .environments
            .stop_environment(&stopped.id)
            .await
            .unwrap();
        fixture.environments.mark_stopped(&stopped.id).await.unwrap();

        let ready = fixture
            .environments
            .create_environment("prog-2", "image:2", None)
            .await
            .unwrap();
        fixture.environments.mark_ready(&ready.id).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let metrics = fixture.service.run_cleanup_cycle().await;

        assert_eq!(metrics.environments_cleaned, 1);
        assert!(fixture
            .environments
            .get_environment(&stopped.id)
            .await
            .is_none());
        // READY environments are never policy targets / READY环境绝不是策略目标
        assert!(fixture
            .environments
            .get_environment(&ready.id)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_cycle_idempotent_and_metrics_recorded() {
        let fixture = fixture().await;
        backdated_artifact(&fixture, "old.bin", 10, 45).await;

        let first = fixture.service.run_cleanup_cycle().await;
        assert_eq!(first.artifacts_deleted, 1);
        assert_eq!(first.policies_evaluated, 4);

        let second = fixture.service.run_cleanup_cycle().await;
        assert_eq!(second.artifacts_deleted, 0);
        assert_eq!(second.runs_deleted, 0);

        assert!(fixture.service.last_metrics().is_some());
    }

    #[tokio::test]
    async fn test_update_policy() {
        let fixture = fixture().await;
        let policy = fixture
            .service
            .list_policies(None, false, None)
            .await
            .into_iter()
            .find(|p| p.name == "artifact-30-day")
            .unwrap();

        let updated = fixture
            .service
            .update_policy(
                &policy.id,
                PolicyUpdate {
                    threshold: Some(60),
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.threshold, 60);
        assert!(!updated.enabled);
        assert!(updated.updated_at >= policy.updated_at);

        // Disabled policies are skipped by cycles / 周期跳过禁用的策略
        let enabled = fixture.service.list_policies(None, true, None).await;
        assert_eq!(enabled.len(), 3);
    }
}
