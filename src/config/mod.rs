//! Configuration management for the Mellea control plane
//! Mellea控制平面的配置管理
//!
//! This module provides a layered configuration framework supporting:
//! - Command line arguments / 命令行参数
//! - Environment variables / 环境变量
//! - Configuration files (TOML) / 配置文件（TOML）
//!
//! Precedence order (highest to lowest): CLI arguments, `MELLEA_*`
//! environment variables, the configuration file, built-in defaults.
//! 优先级顺序（从高到低）：命令行参数、`MELLEA_*`环境变量、配置文件、内置默认值。

use anyhow::{Context, Result};
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Base configuration shared by the services / 服务共享的基础配置
pub mod base;
pub use base::*;

static FILE_LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Command line arguments for the control plane daemon / 控制平面守护进程的命令行参数
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "controld", about = "Mellea execution control plane")]
pub struct CliArgs {
    /// Path to a TOML configuration file / TOML配置文件的路径
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,

    /// Root data directory / 根数据目录
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Build backend ("daemon" or "kaniko") / 构建后端
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_backend: Option<String>,

    /// Log level override / 日志级别覆盖
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Top-level control plane configuration / 顶层控制平面配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Storage layout / 存储布局
    pub storage: StorageConfig,
    /// Image build settings / 镜像构建设置
    pub build: BuildConfig,
    /// Artifact collector settings / 工件收集器设置
    pub artifact: ArtifactConfig,
    /// Idle-timeout controller settings / 空闲超时控制器设置
    pub idle: IdleConfig,
    /// Warmup controller settings / 预热控制器设置
    pub warmup: WarmupConfig,
    /// Retention policy controller settings / 保留策略控制器设置
    pub retention: RetentionConfig,
    /// Kubernetes namespaces / Kubernetes命名空间
    pub cluster: ClusterConfig,
    /// Logging settings / 日志设置
    pub log: LoggingConfig,
}

impl ControlConfig {
    /// Load configuration from defaults, file, environment and CLI overrides
    /// 从默认值、文件、环境变量和CLI覆盖加载配置
    pub fn load_with_cli(args: &CliArgs) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(ControlConfig::default()));

        if let Some(path) = args.config.as_ref() {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("config.toml"));
        }

        figment = figment.merge(Env::prefixed("MELLEA_").split("__"));

        let mut config: ControlConfig = figment
            .extract()
            .context("Failed to load control plane configuration")?;

        // Apply CLI overrides last / 最后应用CLI覆盖
        if let Some(data_dir) = args.data_dir.as_ref() {
            config.storage.data_dir = data_dir.clone();
        }
        if let Some(backend) = args.build_backend.as_ref() {
            config.build.build_backend = backend.clone();
        }
        if let Some(level) = args.log_level.as_ref() {
            config.log.level = level.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration / 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.build.build_backend != "daemon" && self.build.build_backend != "kaniko" {
            anyhow::bail!(
                "unsupported build backend: {} (expected \"daemon\" or \"kaniko\")",
                self.build.build_backend
            );
        }
        if self.artifact.max_single_size_mb == 0 {
            anyhow::bail!("artifact.max_single_size_mb must be greater than zero");
        }
        if self.warmup.interval_seconds == 0
            || self.idle.interval_seconds == 0
            || self.retention.interval_seconds == 0
        {
            anyhow::bail!("controller intervals must be greater than zero");
        }
        Ok(())
    }

    /// Create the data directory layout / 创建数据目录布局
    pub fn ensure_data_dirs(&self) -> Result<()> {
        for dir in [
            self.storage.metadata_dir(),
            self.storage.workspaces_dir(),
            self.storage.artifacts_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create data dir: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Initialize tracing based on logging configuration
/// 基于日志配置初始化跟踪
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.level.trim().is_empty() {
            EnvFilter::new("info")
        } else {
            EnvFilter::new(config.level.clone())
        }
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let file_writer = if config.file_enabled {
        if let Some(path) = config.file_path.as_ref() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir: {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file: {}", path.display()))?;
            let (file_writer, guard) = tracing_appender::non_blocking(file);
            let _ = FILE_LOG_GUARD.set(guard);
            Some(file_writer)
        } else {
            None
        }
    } else {
        None
    };

    match (config.format.as_str(), file_writer) {
        ("json", Some(file_writer)) => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_level(true);
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_level(true)
                .with_writer(file_writer);
            registry.with(stdout_layer).with(file_layer).init();
        }
        (_, Some(file_writer)) => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_level(true);
            let file_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_level(true)
                .with_writer(file_writer);
            registry.with(stdout_layer).with(file_layer).init();
        }
        ("json", None) => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_level(true);
            registry.with(stdout_layer).init();
        }
        ("compact", None) => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_level(true);
            registry.with(stdout_layer).init();
        }
        (_, None) => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_level(true);
            registry.with(stdout_layer).init();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControlConfig::default();
        assert_eq!(config.build.build_backend, "daemon");
        assert_eq!(config.cluster.runs_namespace, "mellea-runs");
        assert_eq!(config.artifact.retention_days, 30);
        assert_eq!(config.idle.environment_idle_timeout_minutes, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let mut config = ControlConfig::default();
        config.build.build_backend = "podman".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_layout() {
        let config = StorageConfig {
            data_dir: PathBuf::from("/var/lib/mellea"),
        };
        assert_eq!(
            config.workspace_path("prog-1"),
            PathBuf::from("/var/lib/mellea/workspaces/prog-1")
        );
        assert_eq!(
            config.metadata_dir(),
            PathBuf::from("/var/lib/mellea/metadata")
        );
    }

    #[test]
    fn test_toml_overrides_defaults() {
        // Layered load: file over defaults / 分层加载：文件覆盖默认值
        let figment = Figment::new()
            .merge(Serialized::defaults(ControlConfig::default()))
            .merge(Toml::string(
                r#"
                [build]
                build_backend = "kaniko"

                [warmup]
                enabled = true
                pool_size = 5
                "#,
            ));
        let config: ControlConfig = figment.extract().unwrap();
        assert_eq!(config.build.build_backend, "kaniko");
        assert!(config.warmup.enabled);
        assert_eq!(config.warmup.pool_size, 5);
        // Untouched sections keep defaults / 未触及的部分保持默认值
        assert_eq!(config.cluster.builds_namespace, "mellea-builds");
    }
}
