//! Error types for control plane services
//! 控制平面服务的错误类型

use thiserror::Error;

/// Control plane error types / 控制平面错误类型
#[derive(Error, Debug)]
pub enum ControlError {
    /// State machine rejected a transition / 状态机拒绝了转换
    #[error("invalid state transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Entity not found / 实体未找到
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    /// Environment has no usable image / 环境没有可用镜像
    #[error("environment {environment_id} is not ready: {reason}")]
    EnvironmentNotReady {
        environment_id: String,
        reason: String,
    },

    /// Credential missing or expired at submission time / 提交时凭证缺失或已过期
    #[error("credential validation failed: {message}")]
    CredentialValidation { message: String },

    /// Storing an artifact would exceed the owner quota / 存储工件将超出配额
    #[error(
        "storage quota exceeded: current usage {current_usage} bytes, \
         quota {quota_limit} bytes, requested {requested} bytes"
    )]
    QuotaExceeded {
        current_usage: u64,
        quota_limit: u64,
        requested: u64,
    },

    /// Single artifact exceeds the per-file size cap / 单个工件超过单文件大小上限
    #[error("artifact size {size} bytes exceeds maximum allowed size {max_size} bytes")]
    ArtifactTooLarge { size: u64, max_size: u64 },

    /// Image build failure / 镜像构建失败
    #[error("image build failed: {0}")]
    ImageBuild(String),

    /// Registry push failure (non-fatal for builds) / 镜像仓库推送失败（构建非致命）
    #[error("registry push failed: {0}")]
    RegistryPush(String),

    /// Kubernetes API error / Kubernetes API错误
    #[error("{0} (kube error: {1})")]
    Cluster(String, #[source] Box<kube::Error>),

    /// Cluster interaction failed without an underlying kube error
    /// 集群交互失败（无底层kube错误）
    #[error("cluster error: {0}")]
    ClusterState(String),

    /// Operation did not finish in time / 操作未在规定时间内完成
    #[error("timed out: {0}")]
    Timeout(String),

    /// Persistent store failure / 持久存储失败
    #[error("store error: {0}")]
    Store(String),

    /// Serialization error / 序列化错误
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error / 配置错误
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// IO error / IO错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Wrap a kube error with context / 用上下文包装kube错误
    pub fn cluster(message: impl Into<String>, err: kube::Error) -> Self {
        ControlError::Cluster(message.into(), Box::new(err))
    }

    /// Shorthand for a missing entity / 缺失实体的简写
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        ControlError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Result type alias for control plane operations / 控制平面操作的结果类型别名
pub type ControlResult<T> = Result<T, ControlError>;
