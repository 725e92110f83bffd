//! Control plane daemon entry point
//! 控制平面守护进程主入口点

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use mellea_control::services::run::RunStatus;

use mellea_control::build::{ContainerCli, ImageBuilder, LayerCache};
use mellea_control::config::{init_tracing, CliArgs, ControlConfig};
use mellea_control::k8s::{K8sJobService, KanikoBuildService};
use mellea_control::services::idle_timeout::{IdleTimeoutController, IdleTimeoutService};
use mellea_control::services::retention::{RetentionPolicyController, RetentionPolicyService};
use mellea_control::services::warmup::{WarmupController, WarmupService};
use mellea_control::services::{
    ArtifactCollectorService, CredentialService, EnvironmentService, ProgramService, RunExecutor,
    RunService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments / 解析命令行参数
    let args = CliArgs::parse();

    // Load configuration (defaults < file < env < CLI) / 加载配置
    let config = ControlConfig::load_with_cli(&args)?;

    // Initialize logging with configuration / 使用配置初始化日志
    init_tracing(&config.log)?;

    tracing::info!("starting mellea control plane");
    tracing::info!("  - data dir: {}", config.storage.data_dir.display());
    tracing::info!("  - build backend: {}", config.build.build_backend);
    tracing::info!("  - runs namespace: {}", config.cluster.runs_namespace);
    tracing::info!("  - builds namespace: {}", config.cluster.builds_namespace);

    config.ensure_data_dirs()?;

    // Initialize stores and services / 初始化存储和服务
    let programs = ProgramService::new(config.storage.clone()).await?;
    let environments = EnvironmentService::new(&config.storage).await?;
    let runs = RunService::new(&config.storage).await?;
    let credentials = CredentialService::with_store(&config.storage).await?;
    let artifacts =
        ArtifactCollectorService::new(&config.storage, config.artifact.clone()).await?;

    // Cluster adapters / 集群适配器
    let job_api = Arc::new(K8sJobService::new(config.cluster.runs_namespace.clone()));
    let kaniko = Arc::new(KanikoBuildService::new(
        config.build.clone(),
        config.cluster.builds_namespace.clone(),
    ));

    // Build engine / 构建引擎
    let layer_cache =
        LayerCache::new(&config.storage, config.build.default_interpreter.clone()).await?;
    let builder = Arc::new(ImageBuilder::new(
        config.build.clone(),
        layer_cache,
        Arc::new(ContainerCli::new()),
        Some(kaniko.clone()),
    ));

    // Run executor / 运行执行器
    let executor = RunExecutor::new(
        runs.clone(),
        environments.clone(),
        credentials.clone(),
        job_api.clone(),
        config.cluster.runs_namespace.clone(),
    );

    // Periodic sync reconciles active runs with the cluster
    // 周期性同步将活跃运行与集群调和
    let sync_cancel = CancellationToken::new();
    let sync_task = {
        let executor = executor.clone();
        let runs = runs.clone();
        let cancel = sync_cancel.clone();
        let interval = std::time::Duration::from_secs(config.cluster.sync_interval_seconds);
        tokio::spawn(async move {
            loop {
                for status in [RunStatus::Starting, RunStatus::Running] {
                    for run in runs.list_runs(None, Some(status)).await {
                        if let Err(e) = executor.sync_run_status(&run.id).await {
                            tracing::warn!(run_id = %run.id, error = %e, "run sync failed");
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    };

    // Background controllers / 后台控制器
    let warmup_service = Arc::new(WarmupService::new(
        config.warmup.clone(),
        environments.clone(),
        programs.clone(),
        builder.clone(),
    ));
    let warmup_controller = WarmupController::new(config.warmup.clone(), warmup_service);

    let idle_service = Arc::new(IdleTimeoutService::new(
        config.idle.clone(),
        environments.clone(),
        runs.clone(),
    ));
    let idle_controller = IdleTimeoutController::new(config.idle.clone(), idle_service);

    let retention_service = Arc::new(
        RetentionPolicyService::new(
            &config.storage,
            artifacts.clone(),
            runs.clone(),
            environments.clone(),
        )
        .await?,
    );
    let retention_controller =
        RetentionPolicyController::new(config.retention.clone(), retention_service);

    warmup_controller.start();
    idle_controller.start();
    retention_controller.start();

    tracing::info!("control plane started");

    // Wait for shutdown signal / 等待关闭信号
    tokio::signal::ctrl_c().await?;
    tracing::info!("control plane shutting down");

    // Stop controllers first, then drop service handles / 先停止控制器，再释放服务句柄
    warmup_controller.stop().await;
    idle_controller.stop().await;
    retention_controller.stop().await;
    sync_cancel.cancel();
    let _ = sync_task.await;

    tracing::info!("control plane stopped");
    Ok(())
}
