//! Artifact collection with per-owner storage quotas
//! 带每所有者存储配额的工件收集
//!
//! Stores run-produced files under `{artifacts_root}/{run_id}/{artifact_id}/
//! {name}`, enforcing a single-file size cap and an aggregate per-owner
//! quota on every collect call. Usage counters are reconcilable from the
//! artifact records themselves.
//! 将运行产生的文件存储在`{artifacts_root}/{run_id}/{artifact_id}/{name}`
//! 下，在每次收集调用时强制执行单文件大小上限和每所有者总配额。用量计数器
//! 可以从工件记录本身对账。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ArtifactConfig, StorageConfig};
use crate::services::error::{ControlError, ControlResult};
use crate::storage::{Document, JsonStore};

/// Kind of artifact / 工件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    File,
    Log,
    Output,
    Other,
}

impl Default for ArtifactType {
    fn default() -> Self {
        ArtifactType::File
    }
}

/// Stored artifact metadata / 存储的工件元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub owner_id: String,
    pub name: String,
    pub artifact_type: ArtifactType,
    pub size_bytes: u64,
    /// Relative path: `{run_id}/{artifact_id}/{name}` / 相对路径
    pub storage_path: String,
    /// SHA-256 hex of the content / 内容的SHA-256十六进制
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Document for Artifact {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Per-owner storage accounting / 每所有者存储核算
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactUsage {
    pub owner_id: String,
    pub total_bytes: u64,
    pub artifact_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl ArtifactUsage {
    pub fn empty(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            total_bytes: 0,
            artifact_count: 0,
            last_updated: Utc::now(),
        }
    }
}

impl Document for ArtifactUsage {
    fn id(&self) -> &str {
        &self.owner_id
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Quota limits supplied by the owning platform / 外围平台提供的配额限制
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuotas {
    /// Aggregate storage cap in MiB / 总存储上限（MiB）
    pub max_storage_mb: u64,
}

/// Optional knobs for a collect call / 收集调用的可选参数
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    pub artifact_type: ArtifactType,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// None = configured default; 0 = permanent / None=配置默认值；0=永久
    pub retention_days: Option<i64>,
}

/// Guess a MIME type from the file name extension / 根据文件扩展名猜测MIME类型
fn guess_mime_type(name: &str) -> Option<String> {
    let extension = Path::new(name).extension()?.to_str()?.to_lowercase();
    let mime = match extension.as_str() {
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "html" => "text/html",
        "md" => "text/markdown",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "py" => "text/x-python",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Service collecting and serving run artifacts / 收集和提供运行工件的服务
#[derive(Clone)]
pub struct ArtifactCollectorService {
    config: ArtifactConfig,
    artifacts_root: PathBuf,
    artifact_store: Arc<JsonStore<Artifact>>,
    usage_store: Arc<JsonStore<ArtifactUsage>>,
}

impl ArtifactCollectorService {
    pub async fn new(storage: &StorageConfig, config: ArtifactConfig) -> ControlResult<Self> {
        let artifact_store =
            JsonStore::open(storage.metadata_dir().join("artifacts.json"), "artifacts").await?;
        let usage_store =
            JsonStore::open(storage.metadata_dir().join("artifact_usage.json"), "usage").await?;
        Ok(Self {
            config,
            artifacts_root: storage.artifacts_dir(),
            artifact_store: Arc::new(artifact_store),
            usage_store: Arc::new(usage_store),
        })
    }

    /// Validate size caps and the owner quota / 验证大小上限和所有者配额
    async fn check_quota(
        &self,
        owner_id: &str,
        size_bytes: u64,
        quotas: &UserQuotas,
    ) -> ControlResult<()> {
        let max_single = self.config.max_single_size_mb * 1024 * 1024;
        if size_bytes > max_single {
            return Err(ControlError::ArtifactTooLarge {
                size: size_bytes,
                max_size: max_single,
            });
        }

        let usage = self.get_user_usage(owner_id).await;
        let quota_bytes = quotas.max_storage_mb * 1024 * 1024;
        if usage.total_bytes + size_bytes > quota_bytes {
            return Err(ControlError::QuotaExceeded {
                current_usage: usage.total_bytes,
                quota_limit: quota_bytes,
                requested: size_bytes,
            });
        }
        Ok(())
    }

    /// Apply a usage delta, clamping at zero / 应用用量增量，下限为零
    async fn update_usage(
        &self,
        owner_id: &str,
        delta_bytes: i64,
        delta_count: i64,
    ) -> ControlResult<()> {
        match self.usage_store.get(owner_id).await {
            Some(mut usage) => {
                usage.total_bytes = add_clamped(usage.total_bytes, delta_bytes);
                usage.artifact_count = add_clamped(usage.artifact_count, delta_count);
                self.usage_store.update(owner_id, usage).await?;
            }
            None => {
                let usage = ArtifactUsage {
                    owner_id: owner_id.to_string(),
                    total_bytes: add_clamped(0, delta_bytes),
                    artifact_count: add_clamped(0, delta_count),
                    last_updated: Utc::now(),
                };
                self.usage_store.create(usage).await?;
            }
        }
        Ok(())
    }

    /// Collect an artifact from a file on disk / 从磁盘文件收集工件
    pub async fn collect_artifact(
        &self,
        run_id: &str,
        owner_id: &str,
        source_path: &Path,
        name: &str,
        quotas: &UserQuotas,
        options: CollectOptions,
    ) -> ControlResult<Artifact> {
        if !source_path.exists() {
            return Err(ControlError::not_found(
                "source file",
                source_path.to_string_lossy(),
            ));
        }
        let content = tokio::fs::read(source_path).await?;
        self.collect_artifact_from_bytes(run_id, owner_id, &content, name, quotas, options)
            .await
    }

    /// Collect an artifact from in-memory content / 从内存内容收集工件
    pub async fn collect_artifact_from_bytes(
        &self,
        run_id: &str,
        owner_id: &str,
        content: &[u8],
        name: &str,
        quotas: &UserQuotas,
        options: CollectOptions,
    ) -> ControlResult<Artifact> {
        let size_bytes = content.len() as u64;
        self.check_quota(owner_id, size_bytes, quotas).await?;

        let artifact_id = Uuid::new_v4().to_string();
        let storage_path = format!("{run_id}/{artifact_id}/{name}");

        let checksum = format!("{:x}", Sha256::digest(content));

        let retention_days = options
            .retention_days
            .unwrap_or(self.config.retention_days);
        let expires_at = if retention_days > 0 {
            Some(Utc::now() + Duration::days(retention_days))
        } else {
            None
        };

        // Content first, then metadata: a crash in between leaves an
        // orphaned file, never a dangling record.
        // 先内容后元数据：中途崩溃只会留下孤立文件，不会留下悬空记录。
        let dest_path = self.artifacts_root.join(&storage_path);
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest_path, content).await?;

        let artifact = Artifact {
            id: artifact_id,
            run_id: run_id.to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            artifact_type: options.artifact_type,
            size_bytes,
            storage_path,
            checksum,
            mime_type: guess_mime_type(name),
            tags: options.tags,
            metadata: options.metadata,
            created_at: Utc::now(),
            expires_at,
        };

        let created = self.artifact_store.create(artifact).await?;
        self.update_usage(owner_id, size_bytes as i64, 1).await?;

        info!(
            artifact_id = %created.id,
            name = %name,
            size_bytes,
            run_id = %run_id,
            owner_id = %owner_id,
            "collected artifact"
        );
        Ok(created)
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> Option<Artifact> {
        self.artifact_store.get(artifact_id).await
    }

    /// Raw content of an artifact / 工件的原始内容
    pub async fn get_artifact_content(&self, artifact_id: &str) -> ControlResult<Vec<u8>> {
        let artifact = self
            .artifact_store
            .get(artifact_id)
            .await
            .ok_or_else(|| ControlError::not_found("artifact", artifact_id))?;

        let file_path = self.artifacts_root.join(&artifact.storage_path);
        if !file_path.exists() {
            return Err(ControlError::not_found(
                "artifact file",
                file_path.to_string_lossy(),
            ));
        }
        Ok(tokio::fs::read(&file_path).await?)
    }

    /// Filesystem path of an artifact / 工件的文件系统路径
    pub async fn get_artifact_path(&self, artifact_id: &str) -> ControlResult<PathBuf> {
        let artifact = self
            .artifact_store
            .get(artifact_id)
            .await
            .ok_or_else(|| ControlError::not_found("artifact", artifact_id))?;
        Ok(self.artifacts_root.join(&artifact.storage_path))
    }

    /// List artifacts; all supplied filters are ANDed, the tag filter
    /// requires every listed tag.
    /// 列出工件；提供的过滤器取与，标签过滤器要求包含每个列出的标签。
    pub async fn list_artifacts(
        &self,
        owner_id: Option<&str>,
        run_id: Option<&str>,
        artifact_type: Option<ArtifactType>,
        tags: Option<&[String]>,
    ) -> Vec<Artifact> {
        self.artifact_store
            .find(|artifact| {
                if let Some(owner_id) = owner_id {
                    if artifact.owner_id != owner_id {
                        return false;
                    }
                }
                if let Some(run_id) = run_id {
                    if artifact.run_id != run_id {
                        return false;
                    }
                }
                if let Some(artifact_type) = artifact_type {
                    if artifact.artifact_type != artifact_type {
                        return false;
                    }
                }
                if let Some(tags) = tags {
                    if !tags.iter().all(|tag| artifact.tags.contains(tag)) {
                        return false;
                    }
                }
                true
            })
            .await
    }

    /// Delete an artifact's file and metadata / 删除工件的文件和元数据
    pub async fn delete_artifact(&self, artifact_id: &str) -> ControlResult<bool> {
        let Some(artifact) = self.artifact_store.get(artifact_id).await else {
            return Ok(false);
        };

        let file_path = self.artifacts_root.join(&artifact.storage_path);
        if file_path.exists() {
            tokio::fs::remove_file(&file_path).await?;
            // Best-effort cleanup of empty parents / 尽力清理空的父目录
            if let Some(parent) = file_path.parent() {
                let _ = tokio::fs::remove_dir(parent).await;
                if let Some(grandparent) = parent.parent() {
                    let _ = tokio::fs::remove_dir(grandparent).await;
                }
            }
        }

        self.update_usage(&artifact.owner_id, -(artifact.size_bytes as i64), -1)
            .await?;

        let deleted = self.artifact_store.delete(artifact_id).await?;
        if deleted {
            info!(artifact_id = %artifact_id, "deleted artifact");
        }
        Ok(deleted)
    }

    /// Delete every artifact of a run and its directory tree
    /// 删除运行的所有工件及其目录树
    pub async fn delete_artifacts_for_run(&self, run_id: &str) -> ControlResult<usize> {
        let artifacts = self.list_artifacts(None, Some(run_id), None, None).await;
        let mut deleted = 0;
        for artifact in artifacts {
            if self.delete_artifact(&artifact.id).await? {
                deleted += 1;
            }
        }

        let run_dir = self.artifacts_root.join(run_id);
        if run_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
                warn!(run_id = %run_id, error = %e, "failed to remove run artifact directory");
            }
        }

        info!(run_id = %run_id, deleted, "deleted artifacts for run");
        Ok(deleted)
    }

    /// Current usage for an owner (zeros when unknown) / 所有者的当前用量（未知时为零）
    pub async fn get_user_usage(&self, owner_id: &str) -> ArtifactUsage {
        self.usage_store
            .get(owner_id)
            .await
            .unwrap_or_else(|| ArtifactUsage::empty(owner_id))
    }

    /// Overwrite usage with the actual sum over stored artifacts
    /// 用存储工件的实际总和覆盖用量
    pub async fn recalculate_user_usage(&self, owner_id: &str) -> ControlResult<ArtifactUsage> {
        let artifacts = self.list_artifacts(Some(owner_id), None, None, None).await;
        let total_bytes: u64 = artifacts.iter().map(|a| a.size_bytes).sum();
        let artifact_count = artifacts.len() as u64;

        let usage = ArtifactUsage {
            owner_id: owner_id.to_string(),
            total_bytes,
            artifact_count,
            last_updated: Utc::now(),
        };
        let usage = match self.usage_store.get(owner_id).await {
            Some(_) => self.usage_store.update(owner_id, usage).await?,
            None => self.usage_store.create(usage).await?,
        };

        info!(owner_id = %owner_id, total_bytes, artifact_count, "recalculated usage");
        Ok(usage)
    }

    /// Direct store access for tests that need to backdate records
    /// 供需要回溯记录时间的测试直接访问存储
    #[cfg(test)]
    pub(crate) fn artifact_store_for_tests(&self) -> &JsonStore<Artifact> {
        &self.artifact_store
    }

    /// Delete artifacts past their expiry / 删除已过期的工件
    pub async fn cleanup_expired_artifacts(&self) -> ControlResult<usize> {
        let now = Utc::now();
        let expired = self
            .artifact_store
            .find(|a| matches!(a.expires_at, Some(expires_at) if expires_at < now))
            .await;

        let mut deleted = 0;
        for artifact in expired {
            if self.delete_artifact(&artifact.id).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "cleaned up expired artifacts");
        }
        Ok(deleted)
    }
}

fn add_clamped(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
