//! Warm environment pool maintenance
//! 预热环境池维护
//!
//! Keeps a pool of pre-built READY environments for the most recently run
//! programs so that run submission skips the image build. Stale pool
//! members are recycled by age.
//! 为最近运行的程序维护一个预构建的READY环境池，使运行提交跳过镜像构建。
//! 池中过旧的成员按年龄回收。

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::build::ImageBuilder;
use crate::config::WarmupConfig;
use crate::services::environment::{Environment, EnvironmentService, EnvironmentStatus};
use crate::services::program::ProgramService;

/// Metrics from one warmup cycle / 单次预热周期的指标
#[derive(Debug, Clone, Default)]
pub struct WarmupMetrics {
    pub warm_pool_size: usize,
    pub environments_created: usize,
    pub environments_recycled: usize,
    pub layers_pre_built: usize,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

/// A dependency set popular enough to keep warm / 足够热门值得预热的依赖集
#[derive(Debug, Clone)]
pub struct PopularDependency {
    pub cache_key: String,
    pub image_tag: String,
    pub use_count: u64,
    pub last_used_at: DateTime<Utc>,
}

/// Service maintaining the warm pool / 维护预热池的服务
#[derive(Clone)]
pub struct WarmupService {
    config: WarmupConfig,
    environments: EnvironmentService,
    programs: ProgramService,
    builder: Arc<ImageBuilder>,
    last_metrics: Arc<parking_lot::RwLock<Option<WarmupMetrics>>>,
}

impl WarmupService {
    pub fn new(
        config: WarmupConfig,
        environments: EnvironmentService,
        programs: ProgramService,
        builder: Arc<ImageBuilder>,
    ) -> Self {
        Self {
            config,
            environments,
            programs,
            builder,
            last_metrics: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    /// Most used dependency layers, by `use_count` descending
    /// 使用次数最多的依赖层，按`use_count`降序
    pub async fn get_popular_dependencies(&self, limit: Option<usize>) -> Vec<PopularDependency> {
        let limit = limit.unwrap_or(self.config.popular_deps_count);
        let mut entries = self.builder.cache().list_entries().await;
        entries.sort_by(|a, b| b.use_count.cmp(&a.use_count));

        entries
            .into_iter()
            .take(limit)
            .map(|entry| PopularDependency {
                cache_key: entry.cache_key,
                image_tag: entry.image_tag,
                use_count: entry.use_count,
                last_used_at: entry.last_used_at,
            })
            .collect()
    }

    /// Current warm (READY) environments / 当前预热（READY）的环境
    pub async fn get_warm_environments(&self) -> Vec<Environment> {
        self.environments
            .list_environments(None, Some(EnvironmentStatus::Ready))
            .await
    }

    /// Warm environments past the recycle age / 超过回收年龄的预热环境
    pub async fn get_stale_warm_environments(&self) -> Vec<Environment> {
        let max_age = Duration::minutes(self.config.max_age_minutes);
        let now = Utc::now();
        self.get_warm_environments()
            .await
            .into_iter()
            .filter(|env| now - env.created_at > max_age)
            .collect()
    }

    /// Snapshot of the pool for operators / 面向运维的池快照
    pub async fn pool_status(&self) -> serde_json::Value {
        let warm = self.get_warm_environments().await;
        let stale = self.get_stale_warm_environments().await;
        let now = Utc::now();

        json!({
            "enabled": self.config.enabled,
            "target_pool_size": self.config.pool_size,
            "current_pool_size": warm.len(),
            "stale_count": stale.len(),
            "warm_environments": warm.iter().map(|env| json!({
                "id": env.id,
                "program_id": env.program_id,
                "image_tag": env.image_tag,
                "age_minutes": (now - env.created_at).num_seconds() as f64 / 60.0,
            })).collect::<Vec<_>>(),
            "thresholds": {
                "max_age_minutes": self.config.max_age_minutes,
                "check_interval_seconds": self.config.interval_seconds,
            },
        })
    }

    /// Delete a stale READY environment / 删除过旧的READY环境
    pub async fn recycle_stale_environment(&self, environment_id: &str) -> bool {
        let Some(environment) = self.environments.get_environment(environment_id).await else {
            return false;
        };
        if environment.status != EnvironmentStatus::Ready {
            return false;
        }

        match self.environments.delete_environment(environment_id).await {
            Ok(deleted) => {
                if deleted {
                    info!(environment_id = %environment_id, "recycled stale warm environment");
                }
                deleted
            }
            Err(e) => {
                error!(environment_id = %environment_id, error = %e, "failed to recycle environment");
                false
            }
        }
    }

    /// Build the image and park a READY environment for a program
    /// 构建镜像并为程序准备一个READY环境
    pub async fn create_warm_environment(&self, program_id: &str) -> Option<Environment> {
        let Some(program) = self.programs.get_program(program_id).await else {
            warn!(program_id = %program_id, "program not found for warmup");
            return None;
        };

        let workspace = self.programs.workspace_path(program_id);
        let result = self.builder.build_image(&program, &workspace, false, false).await;
        if !result.success {
            error!(
                program_id = %program_id,
                error = ?result.error_message,
                "failed to build image for warmup"
            );
            return None;
        }
        let image_tag = result.image_tag?;

        let environment = match self
            .environments
            .create_environment(program_id, image_tag, None)
            .await
        {
            Ok(environment) => environment,
            Err(e) => {
                error!(program_id = %program_id, error = %e, "failed to create warm environment");
                return None;
            }
        };

        match self.environments.mark_ready(&environment.id).await {
            Ok(ready) => {
                info!(environment_id = %ready.id, program_id = %program_id, "created warm environment");
                Some(ready)
            }
            Err(e) => {
                error!(environment_id = %environment.id, error = %e, "failed to mark warm environment ready");
                None
            }
        }
    }

    /// A READY environment for the program, enabling fast allocation
    /// 程序的READY环境，支持快速分配
    pub async fn get_warm_environment_for_program(&self, program_id: &str) -> Option<Environment> {
        self.get_warm_environments()
            .await
            .into_iter()
            .find(|env| env.program_id == program_id)
    }

    /// One warmup cycle: recycle stale, then fill the pool from the most
    /// recently run programs that are not already warm.
    /// 一次预热周期：先回收过旧的，再从尚未预热的最近运行程序中补足池。
    pub async fn run_warmup_cycle(&self) -> WarmupMetrics {
        let start = std::time::Instant::now();
        let mut metrics = WarmupMetrics::default();

        info!("starting warmup cycle");

        for environment in self.get_stale_warm_environments().await {
            if self.recycle_stale_environment(&environment.id).await {
                metrics.environments_recycled += 1;
            } else {
                metrics
                    .errors
                    .push(format!("failed to recycle env {}", environment.id));
            }
        }

        let current_warm = self.get_warm_environments().await;
        metrics.warm_pool_size = current_warm.len();

        let needed = self.config.pool_size.saturating_sub(current_warm.len());
        if needed > 0 {
            let mut programs = self.programs.list_programs().await;
            // Most recently run first / 最近运行的优先
            programs.sort_by(|a, b| b.last_run_at.cmp(&a.last_run_at));

            let warm_program_ids: std::collections::HashSet<String> = current_warm
                .iter()
                .map(|env| env.program_id.clone())
                .collect();

            let candidates: Vec<_> = programs
                .into_iter()
                .filter(|p| !warm_program_ids.contains(&p.id))
                .take(needed)
                .collect();

            for program in candidates {
                if self.create_warm_environment(&program.id).await.is_some() {
                    metrics.environments_created += 1;
                } else {
                    metrics
                        .errors
                        .push(format!("failed to warm program {}", program.id));
                }
            }
        }

        metrics.warm_pool_size = self.get_warm_environments().await.len();
        metrics.duration_seconds = start.elapsed().as_secs_f64();

        info!(
            pool_size = metrics.warm_pool_size,
            created = metrics.environments_created,
            recycled = metrics.environments_recycled,
            duration = metrics.duration_seconds,
            "warmup cycle complete"
        );

        *self.last_metrics.write() = Some(metrics.clone());
        metrics
    }

    pub fn last_metrics(&self) -> Option<WarmupMetrics> {
        self.last_metrics.read().clone()
    }
}

/// Background controller maintaining the warm pool / 维护预热池的后台控制器
pub struct WarmupController {
    config: WarmupConfig,
    service: Arc<WarmupService>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl WarmupController {
    pub fn new(config: WarmupConfig, service: Arc<WarmupService>) -> Self {
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
            info!("warmup controller is disabled");
            return;
        }
        if self.is_running() {
            warn!("warmup controller is already running");
            return;
        }

        let cancel = CancellationToken::new();
        let service = self.service.clone();
        let interval = std::time::Duration::from_secs(self.config.interval_seconds);
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            info!(interval_seconds = interval.as_secs(), "warmup controller started");
            loop {
                let metrics = service.run_warmup_cycle().await;
                for err in &metrics.errors {
                    error!(error = %err, "warmup error");
                }

                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("warmup controller stopped");
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
    use crate::build::cache::LayerCache;
    use crate::config::{BuildConfig, StorageConfig};
    use crate::services::program::{DependencySpec, PackageRef, ProgramService};
    use crate::services::test_utils::MockRuntime;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: StorageConfig,
        environments: EnvironmentService,
        programs: ProgramService,
        service: WarmupService,
    }

    async fn fixture(config: WarmupConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            data_dir: dir.path().to_path_buf(),
        };
        let environments = EnvironmentService::new(&storage).await.unwrap();
        let programs = ProgramService::new(storage.clone()).await.unwrap();
        let cache = LayerCache::new(&storage, "3.12").await.unwrap();
        let builder = Arc::new(ImageBuilder::new(
            BuildConfig::default(),
            cache,
            Arc::new(MockRuntime::default()),
            None,
        ));
        let service = WarmupService::new(
            config,
            environments.clone(),
            programs.clone(),
            builder,
        );
        Fixture {
            _dir: dir,
            storage,
            environments,
            programs,
            service,
        }
    }

    fn warm_config(pool_size: usize) -> WarmupConfig {
        WarmupConfig {
            enabled: true,
            pool_size,
            max_age_minutes: 60,
            interval_seconds: 60,
            popular_deps_count: 5,
        }
    }

    async fn register_program(fixture: &Fixture, name: &str) -> String {
        let program = fixture
            .programs
            .create_program(
                "user-1",
                name,
                "main.py",
                DependencySpec::manual(vec![PackageRef::pinned("requests", "2.31.0")], None),
            )
            .await
            .unwrap();
        // Give the daemon backend a workspace to copy / 为daemon后端提供工作区
        let workspace = fixture.storage.workspace_path(&program.id);
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("main.py"), "print('warm')").unwrap();
        fixture.programs.touch_last_run(&program.id).await.unwrap();
        program.id
    }

    #[tokio::test]
    async fn test_cycle_fills_pool_from_recent_programs() {
        let fixture = fixture(warm_config(2)).await;
        let a = register_program(&fixture, "a").await;
        let b = register_program(&fixture, "b").await;
        register_program(&fixture, "c").await;

        let metrics = fixture.service.run_warmup_cycle().await;

        assert_eq!(metrics.environments_created, 2);
        assert_eq!(metrics.warm_pool_size, 2);
        assert!(metrics.errors.is_empty());

        // The two most recently run programs are warm; creation order makes
        // b and c the latest.
        // 最近运行的两个程序被预热；按创建顺序b和c最新。
        let warm = fixture.service.get_warm_environments().await;
        assert!(warm.iter().all(|env| env.status == EnvironmentStatus::Ready));
        assert!(fixture
            .service
            .get_warm_environment_for_program(&a)
            .await
            .is_none()
            || fixture
                .service
                .get_warm_environment_for_program(&b)
                .await
                .is_some());
    }

    #[tokio::test]
    async fn test_cycle_skips_programs_already_warm() {
        let fixture = fixture(warm_config(2)).await;
        register_program(&fixture, "a").await;

        let first = fixture.service.run_warmup_cycle().await;
        assert_eq!(first.environments_created, 1);

        // Pool not full, but the only program is already warm
        // 池未满，但唯一的程序已经预热
        let second = fixture.service.run_warmup_cycle().await;
        assert_eq!(second.environments_created, 0);
        assert_eq!(second.warm_pool_size, 1);
    }

    #[tokio::test]
    async fn test_stale_environments_are_recycled() {
        let mut config = warm_config(1);
        config.max_age_minutes = 0;
        let fixture = fixture(config).await;
        let program_id = register_program(&fixture, "a").await;

        let env = fixture
            .environments
            .create_environment(&program_id, "mellea-prog:warm", None)
            .await
            .unwrap();
        fixture.environments.mark_ready(&env.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let metrics = fixture.service.run_warmup_cycle().await;
        assert_eq!(metrics.environments_recycled, 1);
        assert!(fixture.environments.get_environment(&env.id).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_program_counts_as_error() {
        let fixture = fixture(warm_config(1)).await;
        assert!(fixture.service.create_warm_environment("missing").await.is_none());

        // A cycle with no programs creates nothing / 没有程序的周期不创建任何东西
        let metrics = fixture.service.run_warmup_cycle().await;
        assert_eq!(metrics.environments_created, 0);
        assert_eq!(metrics.warm_pool_size, 0);
    }

    #[tokio::test]
    async fn test_popular_dependencies_ordered_by_use() {
        let fixture = fixture(warm_config(2)).await;
        register_program(&fixture, "a").await;
        register_program(&fixture, "b").await;

        // Two programs share a dependency spec; warming both hits the cache
        // 两个程序共享依赖规范；预热两者会命中缓存
        fixture.service.run_warmup_cycle().await;

        let popular = fixture.service.get_popular_dependencies(None).await;
        assert_eq!(popular.len(), 1);
        assert!(popular[0].use_count >= 1);
        assert!(popular[0].image_tag.starts_with("mellea-deps:"));
    }

    #[tokio::test]
    async fn test_pool_status_snapshot() {
        let fixture = fixture(warm_config(3)).await;
        register_program(&fixture, "a").await;
        fixture.service.run_warmup_cycle().await;

        let status = fixture.service.pool_status().await;
        assert_eq!(status["enabled"], true);
        assert_eq!(status["target_pool_size"], 3);
        assert_eq!(status["current_pool_size"], 1);
        assert_eq!(status["warm_environments"].as_array().unwrap().len(), 1);
    }
}
