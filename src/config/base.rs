//! Base configuration structures for the control plane
//! 控制平面的基础配置结构

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Storage configuration / 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for stores, workspaces and artifacts / 存储、工作区和工件的根目录
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    /// Directory holding the JSON collection files / 保存JSON集合文件的目录
    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    /// Directory holding program workspaces / 保存程序工作区的目录
    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    /// Workspace directory for one program / 单个程序的工作区目录
    pub fn workspace_path(&self, program_id: &str) -> PathBuf {
        self.workspaces_dir().join(program_id)
    }

    /// Directory holding artifact payloads / 保存工件内容的目录
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

/// Image build configuration / 镜像构建配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build backend: "daemon" or "kaniko" / 构建后端："daemon"或"kaniko"
    pub build_backend: String,
    /// Optional registry push destination / 可选的镜像仓库推送目标
    pub registry_url: Option<String>,
    /// Registry username / 镜像仓库用户名
    pub registry_username: Option<String>,
    /// Registry password / 镜像仓库密码
    pub registry_password: Option<String>,
    /// Kaniko executor image / Kaniko执行器镜像
    pub kaniko_image: String,
    /// Active deadline for build jobs in seconds / 构建作业的活动截止时间（秒）
    pub build_timeout_seconds: i64,
    /// CPU limit for build jobs / 构建作业的CPU限制
    pub build_cpu_limit: String,
    /// Memory limit for build jobs / 构建作业的内存限制
    pub build_memory_limit: String,
    /// Base images keyed by interpreter version / 按解释器版本索引的基础镜像
    pub base_images: BTreeMap<String, String>,
    /// Interpreter version used when the spec has none / 规范未指定时使用的解释器版本
    pub default_interpreter: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let mut base_images = BTreeMap::new();
        base_images.insert("3.11".to_string(), "mellea-python:3.11".to_string());
        base_images.insert("3.12".to_string(), "mellea-python:3.12".to_string());
        Self {
            build_backend: "daemon".to_string(),
            registry_url: None,
            registry_username: None,
            registry_password: None,
            kaniko_image: "gcr.io/kaniko-project/executor:latest".to_string(),
            build_timeout_seconds: 600,
            build_cpu_limit: "2".to_string(),
            build_memory_limit: "2Gi".to_string(),
            base_images,
            default_interpreter: "3.12".to_string(),
        }
    }
}

/// Artifact collector configuration / 工件收集器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Default retention in days (0 = permanent) / 默认保留天数（0=永久）
    pub retention_days: i64,
    /// Maximum size of a single artifact in MiB / 单个工件的最大大小（MiB）
    pub max_single_size_mb: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_single_size_mb: 100,
        }
    }
}

/// Idle-timeout controller configuration / 空闲超时控制器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Master switch / 总开关
    pub enabled: bool,
    /// Seconds between cleanup cycles / 清理周期之间的秒数
    pub interval_seconds: u64,
    /// Minutes of inactivity before an environment is idle / 环境被视为空闲前的不活动分钟数
    pub environment_idle_timeout_minutes: i64,
    /// Days to keep terminal run records / 终态运行记录的保留天数
    pub run_retention_days: i64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            environment_idle_timeout_minutes: 30,
            run_retention_days: 7,
        }
    }
}

/// Warmup controller configuration / 预热控制器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Master switch / 总开关
    pub enabled: bool,
    /// Target number of warm READY environments / 预热READY环境的目标数量
    pub pool_size: usize,
    /// Age in minutes after which a warm environment is recycled / 预热环境被回收的年龄（分钟）
    pub max_age_minutes: i64,
    /// Seconds between warmup cycles / 预热周期之间的秒数
    pub interval_seconds: u64,
    /// Number of popular dependency sets to report / 报告的热门依赖集数量
    pub popular_deps_count: usize,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: 3,
            max_age_minutes: 60,
            interval_seconds: 600,
            popular_deps_count: 5,
        }
    }
}

/// Retention policy controller configuration / 保留策略控制器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Master switch / 总开关
    pub enabled: bool,
    /// Seconds between cleanup cycles / 清理周期之间的秒数
    pub interval_seconds: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 3600,
        }
    }
}

/// Kubernetes namespace layout / Kubernetes命名空间布局
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Namespace for run jobs / 运行作业的命名空间
    pub runs_namespace: String,
    /// Namespace for build jobs / 构建作业的命名空间
    pub builds_namespace: String,
    /// Namespace for credential secrets / 凭证密钥的命名空间
    pub credentials_namespace: String,
    /// Seconds between run status sync passes / 运行状态同步间隔（秒）
    pub sync_interval_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            runs_namespace: "mellea-runs".to_string(),
            builds_namespace: "mellea-builds".to_string(),
            credentials_namespace: "mellea-credentials".to_string(),
            sync_interval_seconds: 30,
        }
    }
}

/// Logging configuration / 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) / 日志级别
    pub level: String,
    /// Log format (json, compact, pretty) / 日志格式
    pub format: String,
    /// Enable file logging / 启用文件日志
    pub file_enabled: bool,
    /// Log file path / 日志文件路径
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_enabled: false,
            file_path: None,
        }
    }
}
