//! Idle-timeout detection and cleanup
//! 空闲超时检测和清理
//!
//! Reclaims environments with no recent activity and deletes terminal run
//! records past retention. The controller wraps the service in a periodic
//! background task whose sleep a stop signal can interrupt.
//! 回收没有近期活动的环境并删除超过保留期的终态运行记录。控制器将服务
//! 包装为周期性后台任务，其休眠可被停止信号打断。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IdleConfig;
use crate::services::environment::{Environment, EnvironmentService, EnvironmentStatus};
use crate::services::error::ControlResult;
use crate::services::run::{Run, RunService, RunStatus};

/// A resource identified as idle or stale / 被识别为空闲或陈旧的资源
#[derive(Debug, Clone)]
pub struct IdleResource {
    pub resource_type: &'static str,
    pub resource_id: String,
    pub idle_since: DateTime<Utc>,
    pub idle_duration_minutes: f64,
}

/// Metrics from one cleanup cycle / 单次清理周期的指标
#[derive(Debug, Clone, Default)]
pub struct ControllerMetrics {
    pub environments_checked: usize,
    pub environments_stopped: usize,
    pub runs_checked: usize,
    pub runs_deleted: usize,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

/// Latest activity over an environment and its runs. Monotonic for a fixed
/// run set: only maxima are taken.
/// 环境及其运行的最近活动。对固定的运行集合是单调的：只取最大值。
fn last_activity(environment: &Environment, runs: &[Run]) -> DateTime<Utc> {
    let mut latest = environment.updated_at;
    for run in runs {
        if let Some(completed_at) = run.completed_at {
            latest = latest.max(completed_at);
        }
        if let Some(started_at) = run.started_at {
            latest = latest.max(started_at);
        }
    }
    latest
}

/// Service finding and reclaiming idle resources / 查找和回收空闲资源的服务
#[derive(Clone)]
pub struct IdleTimeoutService {
    config: IdleConfig,
    environments: EnvironmentService,
    runs: RunService,
    last_metrics: Arc<parking_lot::RwLock<Option<ControllerMetrics>>>,
}

impl IdleTimeoutService {
    pub fn new(config: IdleConfig, environments: EnvironmentService, runs: RunService) -> Self {
        Self {
            config,
            environments,
            runs,
            last_metrics: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    /// READY or RUNNING environments idle beyond the threshold
    /// 超过阈值的空闲READY或RUNNING环境
    pub async fn find_idle_environments(&self) -> Vec<IdleResource> {
        let threshold = Duration::minutes(self.config.environment_idle_timeout_minutes);
        let now = Utc::now();
        let mut idle = Vec::new();

        for status in [EnvironmentStatus::Ready, EnvironmentStatus::Running] {
            for environment in self.environments.list_environments(None, Some(status)).await {
                let runs = self.runs.list_runs(Some(&environment.id), None).await;
                let activity = last_activity(&environment, &runs);
                if now - activity > threshold {
                    idle.push(IdleResource {
                        resource_type: "environment",
                        resource_id: environment.id.clone(),
                        idle_since: activity,
                        idle_duration_minutes: (now - activity).num_seconds() as f64 / 60.0,
                    });
                }
            }
        }

        idle
    }

    /// Terminal runs older than the retention window / 超过保留窗口的终态运行
    pub async fn find_stale_runs(&self) -> Vec<IdleResource> {
        let threshold = Duration::days(self.config.run_retention_days);
        let now = Utc::now();
        let mut stale = Vec::new();

        for status in [
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            for run in self.runs.list_runs(None, Some(status)).await {
                let completed_at = run.completed_at.unwrap_or(run.created_at);
                if now - completed_at > threshold {
                    stale.push(IdleResource {
                        resource_type: "run",
                        resource_id: run.id.clone(),
                        idle_since: completed_at,
                        idle_duration_minutes: (now - completed_at).num_seconds() as f64 / 60.0,
                    });
                }
            }
        }

        stale
    }

    /// Stop a RUNNING idle environment or delete a READY one
    /// 停止RUNNING的空闲环境或删除READY的环境
    pub async fn stop_idle_environment(&self, environment_id: &str) -> ControlResult<()> {
        let Some(environment) = self.environments.get_environment(environment_id).await else {
            return Ok(());
        };

        match environment.status {
            EnvironmentStatus::Running => {
                self.environments.stop_environment(environment_id).await?;
                self.environments.mark_stopped(environment_id).await?;
                info!(environment_id = %environment_id, "stopped idle environment");
            }
            EnvironmentStatus::Ready => {
                self.environments.delete_environment(environment_id).await?;
                info!(environment_id = %environment_id, "deleted idle ready environment");
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn delete_stale_run(&self, run_id: &str) -> ControlResult<bool> {
        let deleted = self.runs.delete_run(run_id).await?;
        if deleted {
            info!(run_id = %run_id, "deleted stale run");
        }
        Ok(deleted)
    }

    /// One full cleanup cycle. Per-resource failures land in
    /// `metrics.errors`, never abort the cycle.
    /// 一次完整清理周期。单个资源的失败进入`metrics.errors`，绝不中止周期。
    pub async fn run_cleanup_cycle(&self) -> ControllerMetrics {
        let start = std::time::Instant::now();
        let mut metrics = ControllerMetrics::default();

        info!("starting idle timeout cleanup cycle");

        let ready = self
            .environments
            .list_environments(None, Some(EnvironmentStatus::Ready))
            .await
            .len();
        let running = self
            .environments
            .list_environments(None, Some(EnvironmentStatus::Running))
            .await
            .len();
        metrics.environments_checked = ready + running;

        for idle in self.find_idle_environments().await {
            match self.stop_idle_environment(&idle.resource_id).await {
                Ok(()) => metrics.environments_stopped += 1,
                Err(e) => {
                    metrics
                        .errors
                        .push(format!("failed to stop env {}: {e}", idle.resource_id));
                }
            }
        }

        metrics.runs_checked = self.runs.list_runs(None, None).await.len();
        for stale in self.find_stale_runs().await {
            match self.delete_stale_run(&stale.resource_id).await {
                Ok(true) => metrics.runs_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    metrics
                        .errors
                        .push(format!("failed to delete run {}: {e}", stale.resource_id));
                }
            }
        }

        metrics.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            stopped = metrics.environments_stopped,
            deleted = metrics.runs_deleted,
            duration = metrics.duration_seconds,
            "cleanup cycle complete"
        );

        *self.last_metrics.write() = Some(metrics.clone());
        metrics
    }

    pub fn last_metrics(&self) -> Option<ControllerMetrics> {
        self.last_metrics.read().clone()
    }
}

/// Background controller looping cleanup cycles / 循环清理周期的后台控制器
pub struct IdleTimeoutController {
    config: IdleConfig,
    service: Arc<IdleTimeoutService>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl IdleTimeoutController {
    pub fn new(config: IdleConfig, service: Arc<IdleTimeoutService>) -> Self {
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

    /// Start the loop; a no-op when disabled or already running
    /// 启动循环；禁用或已运行时为空操作
    pub fn start(&self) {
        if !self.config.enabled {
            info!("idle timeout controller is disabled");
            return;
        }
        if self.is_running() {
            warn!("idle timeout controller is already running");
            return;
        }

        let cancel = CancellationToken::new();
        let service = self.service.clone();
        let interval = std::time::Duration::from_secs(self.config.interval_seconds);
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            info!(interval_seconds = interval.as_secs(), "idle timeout controller started");
            loop {
                let metrics = service.run_cleanup_cycle().await;
                for err in &metrics.errors {
                    error!(error = %err, "idle cleanup error");
                }

                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("idle timeout controller stopped");
        });

        *self.cancel.lock() = Some(cancel);
        *self.task.lock() = Some(task);
    }

    /// Signal the loop to stop and wait for it to exit
    /// 通知循环停止并等待其退出
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
    use crate::config::StorageConfig;

    async fn services(dir: &std::path::Path) -> (EnvironmentService, RunService) {
        let storage = StorageConfig {
            data_dir: dir.to_path_buf(),
        };
        (
            EnvironmentService::new(&storage).await.unwrap(),
            RunService::new(&storage).await.unwrap(),
        )
    }

    fn config(idle_minutes: i64, retention_days: i64) -> IdleConfig {
        IdleConfig {
            enabled: true,
            interval_seconds: 60,
            environment_idle_timeout_minutes: idle_minutes,
            run_retention_days: retention_days,
        }
    }

    #[tokio::test]
    async fn test_fresh_environment_is_not_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (environments, runs) = services(dir.path()).await;
        let service = IdleTimeoutService::new(config(30, 7), environments.clone(), runs);

        let env = environments
            .create_environment("prog-1", "image:1", None)
            .await
            .unwrap();
        environments.mark_ready(&env.id).await.unwrap();

        assert!(service.find_idle_environments().await.is_empty());
    }

    #[tokio::test]
    async fn test_idle_ready_environment_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (environments, runs) = services(dir.path()).await;
        // Zero threshold: anything is idle / 零阈值：一切都算空闲
        let service = IdleTimeoutService::new(config(0, 7), environments.clone(), runs);

        let env = environments
            .create_environment("prog-1", "image:1", None)
            .await
            .unwrap();
        environments.mark_ready(&env.id).await.unwrap();

        // Give updated_at a moment to fall behind now / 让updated_at稍微落后于当前时间
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let metrics = service.run_cleanup_cycle().await;
        assert_eq!(metrics.environments_checked, 1);
        assert_eq!(metrics.environments_stopped, 1);
        assert!(environments.get_environment(&env.id).await.is_none());
    }

    #[tokio::test]
    async fn test_idle_running_environment_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (environments, runs) = services(dir.path()).await;
        let service = IdleTimeoutService::new(config(0, 7), environments.clone(), runs);

        let env = environments
            .create_environment("prog-1", "image:1", None)
            .await
            .unwrap();
        environments.mark_ready(&env.id).await.unwrap();
        environments.start_environment(&env.id).await.unwrap();
        environments.mark_running(&env.id, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        service.run_cleanup_cycle().await;

        let stopped = environments.get_environment(&env.id).await.unwrap();
        assert_eq!(stopped.status, EnvironmentStatus::Stopped);
        assert!(stopped.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_recent_run_activity_keeps_environment() {
        let dir = tempfile::tempdir().unwrap();
        let (environments, runs) = services(dir.path()).await;
        let service =
            IdleTimeoutService::new(config(30, 7), environments.clone(), runs.clone());

        let env = environments
            .create_environment("prog-1", "image:1", None)
            .await
            .unwrap();
        environments.mark_ready(&env.id).await.unwrap();

        // A just-completed run counts as activity / 刚完成的运行算作活动
        let run = runs.create_run(&env.id, "prog-1", vec![]).await.unwrap();
        runs.start_run(&run.id, "job").await.unwrap();
        runs.mark_running(&run.id).await.unwrap();
        runs.mark_succeeded(&run.id, Some(0), None).await.unwrap();

        assert!(service.find_idle_environments().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_terminal_runs_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (environments, runs) = services(dir.path()).await;
        // Zero retention: every terminal run is stale / 零保留：每个终态运行都陈旧
        let service =
            IdleTimeoutService::new(config(10_000, 0), environments, runs.clone());

        let done = runs.create_run("env-1", "prog-1", vec![]).await.unwrap();
        runs.cancel_run(&done.id).await.unwrap();

        let active = runs.create_run("env-1", "prog-1", vec![]).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let metrics = service.run_cleanup_cycle().await;

        assert_eq!(metrics.runs_deleted, 1);
        assert!(runs.get_run(&done.id).await.is_none());
        // Non-terminal runs survive / 非终态运行保留
        assert!(runs.get_run(&active.id).await.is_some());
    }

    #[tokio::test]
    async fn test_cycle_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (environments, runs) = services(dir.path()).await;
        let service =
            IdleTimeoutService::new(config(0, 0), environments.clone(), runs.clone());

        let env = environments
            .create_environment("prog-1", "image:1", None)
            .await
            .unwrap();
        environments.mark_ready(&env.id).await.unwrap();
        let run = runs.create_run(&env.id, "prog-1", vec![]).await.unwrap();
        runs.cancel_run(&run.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let first = service.run_cleanup_cycle().await;
        assert_eq!(first.environments_stopped, 1);
        assert_eq!(first.runs_deleted, 1);

        // Second cycle finds nothing / 第二次周期一无所获
        let second = service.run_cleanup_cycle().await;
        assert_eq!(second.environments_stopped, 0);
        assert_eq!(second.runs_deleted, 0);
        assert!(second.errors.is_empty());

        assert!(service.last_metrics().is_some());
    }

    #[tokio::test]
    async fn test_controller_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (environments, runs) = services(dir.path()).await;
        let service = Arc::new(IdleTimeoutService::new(
            config(30, 7),
            environments,
            runs,
        ));

        let controller = IdleTimeoutController::new(config(30, 7), service);
        assert!(!controller.is_running());

        controller.start();
        assert!(controller.is_running());

        // Stop unblocks the interval sleep / 停止会打断间隔休眠
        controller.stop().await;
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_disabled_controller_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let (environments, runs) = services(dir.path()).await;
        let service = Arc::new(IdleTimeoutService::new(
            config(30, 7),
            environments,
            runs,
        ));

        let mut disabled = config(30, 7);
        disabled.enabled = false;
        let controller = IdleTimeoutController::new(disabled, service);
        controller.start();
        assert!(!controller.is_running());
    }
}
