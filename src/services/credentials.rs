//! Credential gateway consumed by the run executor
//! 运行执行器使用的凭证网关
//!
//! The core only needs three things from the credential subsystem: resolve a
//! credential reference to secret material, compute the in-cluster Secret
//! name for a reference, and check validity/expiration. The storage backend
//! is opaque behind the [`CredentialBackend`] trait.
//! 核心只需要凭证子系统的三件事：将凭证引用解析为密钥材料、计算引用对应的
//! 集群内Secret名称、检查有效性/过期。存储后端隐藏在[`CredentialBackend`]
//! trait之后。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::services::error::ControlResult;
use crate::storage::{Document, JsonStore};

/// Credential metadata; secret material is never stored here
/// 凭证元数据；密钥材料从不存储在这里
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < Utc::now(),
            None => false,
        }
    }
}

impl Document for Credential {
    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Storage backend for credential material / 凭证材料的存储后端
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn create(
        &self,
        credential: Credential,
        secret_data: HashMap<String, String>,
    ) -> ControlResult<Credential>;

    async fn get(&self, credential_id: &str) -> Option<Credential>;

    async fn get_secret(&self, credential_id: &str) -> Option<HashMap<String, String>>;

    async fn delete(&self, credential_id: &str) -> ControlResult<bool>;

    async fn update_last_accessed(&self, credential_id: &str) -> ControlResult<()>;
}

/// Store-backed backend: metadata in the document store, material in memory.
/// Encryption-at-rest belongs to the surrounding platform, not the core.
/// 基于存储的后端：元数据在文档存储中，材料在内存中。
/// 静态加密属于外围平台，不属于核心。
pub struct StoreCredentialBackend {
    store: JsonStore<Credential>,
    secrets: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl StoreCredentialBackend {
    pub async fn new(storage: &StorageConfig) -> ControlResult<Self> {
        let store = JsonStore::open(
            storage.metadata_dir().join("credentials.json"),
            "credentials",
        )
        .await?;
        Ok(Self {
            store,
            secrets: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl CredentialBackend for StoreCredentialBackend {
    async fn create(
        &self,
        credential: Credential,
        secret_data: HashMap<String, String>,
    ) -> ControlResult<Credential> {
        let created = self.store.create(credential).await?;
        self.secrets
            .write()
            .await
            .insert(created.id.clone(), secret_data);
        Ok(created)
    }

    async fn get(&self, credential_id: &str) -> Option<Credential> {
        self.store.get(credential_id).await
    }

    async fn get_secret(&self, credential_id: &str) -> Option<HashMap<String, String>> {
        self.secrets.read().await.get(credential_id).cloned()
    }

    async fn delete(&self, credential_id: &str) -> ControlResult<bool> {
        self.secrets.write().await.remove(credential_id);
        self.store.delete(credential_id).await
    }

    async fn update_last_accessed(&self, credential_id: &str) -> ControlResult<()> {
        if let Some(mut credential) = self.store.get(credential_id).await {
            credential.last_accessed_at = Some(Utc::now());
            self.store.update(credential_id, credential).await?;
        }
        Ok(())
    }
}

/// Gateway service over the credential backend / 凭证后端之上的网关服务
#[derive(Clone)]
pub struct CredentialService {
    backend: Arc<dyn CredentialBackend>,
}

impl CredentialService {
    pub fn new(backend: Arc<dyn CredentialBackend>) -> Self {
        Self { backend }
    }

    pub async fn with_store(storage: &StorageConfig) -> ControlResult<Self> {
        Ok(Self::new(Arc::new(
            StoreCredentialBackend::new(storage).await?,
        )))
    }

    /// Create a credential with its secret material / 创建凭证及其密钥材料
    pub async fn create_credential(
        &self,
        name: impl Into<String>,
        secret_data: HashMap<String, String>,
        provider: Option<String>,
        owner_id: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ControlResult<Credential> {
        let now = Utc::now();
        let credential = Credential {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            provider,
            owner_id,
            expires_at,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        };
        let created = self.backend.create(credential, secret_data).await?;
        info!(credential_id = %created.id, "created credential");
        Ok(created)
    }

    pub async fn get_credential(&self, credential_id: &str) -> Option<Credential> {
        self.backend.get(credential_id).await
    }

    /// Check that a credential exists and has not expired
    /// 检查凭证存在且未过期
    pub async fn validate_credential(&self, credential_id: &str) -> bool {
        match self.backend.get(credential_id).await {
            Some(credential) => !credential.is_expired(),
            None => false,
        }
    }

    /// Resolve a credential reference to its secret material
    /// 将凭证引用解析为其密钥材料
    pub async fn resolve_secret(
        &self,
        credential_id: &str,
    ) -> Option<HashMap<String, String>> {
        let secret = self.backend.get_secret(credential_id).await?;
        let _ = self.backend.update_last_accessed(credential_id).await;
        Some(secret)
    }

    /// In-cluster Secret name for a credential reference. The id is hashed
    /// so the result is always a valid Kubernetes name.
    /// 凭证引用对应的集群内Secret名称。对id做哈希以保证结果始终是合法的
    /// Kubernetes名称。
    pub async fn k8s_secret_name(&self, credential_id: &str) -> Option<String> {
        self.backend.get(credential_id).await?;
        Some(secret_name_for(credential_id))
    }

    pub async fn delete_credential(&self, credential_id: &str) -> ControlResult<bool> {
        self.backend.delete(credential_id).await
    }
}

/// `mellea-cred-<first 8 hex chars of sha256(id)>`
pub fn secret_name_for(credential_id: &str) -> String {
    let digest = Sha256::digest(credential_id.as_bytes());
    let hex = format!("{digest:x}");
    format!("mellea-cred-{}", &hex[..8])
}
