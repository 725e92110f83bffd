//! Cache key canonicalization and the layer cache store
//! 缓存键规范化和层缓存存储
//!
//! The cache key identifies a reusable dependency layer. Two semantically
//! identical dependency specs must hash to the same key, so the spec is
//! canonicalized first: package names lowercased, extras sorted, packages
//! sorted by name, versions defaulted to the empty string, and the result
//! serialized as compact JSON with sorted keys. The byte layout is frozen by
//! tests; changing it silently invalidates every existing cache entry.
//! 缓存键标识可重用的依赖层。两个语义相同的依赖规范必须哈希到相同的键，
//! 因此先对规范进行规范化：包名小写、extras排序、包按名称排序、版本缺省为
//! 空字符串，结果序列化为键排序的紧凑JSON。字节布局由测试冻结；改变它会
//! 悄悄使所有现有缓存条目失效。

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::LayerCacheEntry;
use crate::config::StorageConfig;
use crate::services::error::ControlResult;
use crate::services::program::DependencySpec;
use crate::storage::JsonStore;

/// Canonical JSON form of a dependency spec / 依赖规范的规范JSON形式
///
/// serde_json's default map is ordered, so object keys serialize sorted.
/// serde_json的默认映射是有序的，因此对象键按排序序列化。
pub fn canonical_spec_json(deps: &DependencySpec, default_interpreter: &str) -> String {
    let interpreter = deps
        .interpreter_version
        .as_deref()
        .unwrap_or(default_interpreter);

    let mut packages: Vec<serde_json::Value> = deps
        .packages
        .iter()
        .map(|pkg| {
            let mut extras: Vec<String> = pkg.extras.clone();
            extras.sort();
            json!({
                "name": pkg.name.to_lowercase(),
                "version": pkg.version.clone().unwrap_or_default(),
                "extras": extras,
            })
        })
        .collect();
    packages.sort_by(|a, b| {
        a["name"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["name"].as_str().unwrap_or_default())
    });

    json!({
        "interpreter_version": interpreter,
        "packages": packages,
    })
    .to_string()
}

/// Hex SHA-256 of the canonical form / 规范形式的十六进制SHA-256
pub fn compute_cache_key(deps: &DependencySpec, default_interpreter: &str) -> String {
    let canonical = canonical_spec_json(deps, default_interpreter);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}")
}

/// Short digest over the sorted lowercased package names
/// 排序小写包名的短摘要
pub fn compute_packages_hash(deps: &DependencySpec) -> String {
    let mut names: Vec<String> = deps
        .packages
        .iter()
        .map(|pkg| pkg.name.to_lowercase())
        .collect();
    names.sort();
    let digest = Sha256::digest(names.join(",").as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// Store of cached dependency layers / 缓存依赖层的存储
#[derive(Clone)]
pub struct LayerCache {
    store: Arc<JsonStore<LayerCacheEntry>>,
    default_interpreter: String,
}

impl LayerCache {
    pub async fn new(
        storage: &StorageConfig,
        default_interpreter: impl Into<String>,
    ) -> ControlResult<Self> {
        let store = JsonStore::open(
            storage.metadata_dir().join("layer_cache.json"),
            "layer_cache",
        )
        .await?;
        Ok(Self {
            store: Arc::new(store),
            default_interpreter: default_interpreter.into(),
        })
    }

    /// Look up a layer by cache key; a hit bumps `use_count` and
    /// `last_used_at`. / 按缓存键查找层；命中时增加`use_count`并更新
    /// `last_used_at`。
    pub async fn get_cached_layer(&self, cache_key: &str) -> ControlResult<Option<LayerCacheEntry>> {
        let matches = self.store.find(|e| e.cache_key == cache_key).await;
        let Some(mut entry) = matches.into_iter().next() else {
            return Ok(None);
        };

        entry.last_used_at = Utc::now();
        entry.use_count += 1;
        let entry = self.store.update(&entry.id.clone(), entry).await?;
        debug!(cache_key = %cache_key, use_count = entry.use_count, "layer cache hit");
        Ok(Some(entry))
    }

    /// Record a freshly built dependency layer. At most one entry exists
    /// per key: rebuilding refreshes the existing entry.
    /// 记录新构建的依赖层。每个键最多存在一个条目：重建会刷新现有条目。
    pub async fn create_entry(
        &self,
        cache_key: &str,
        image_tag: &str,
        deps: &DependencySpec,
        size_bytes: Option<u64>,
    ) -> ControlResult<LayerCacheEntry> {
        let existing = self.store.find(|e| e.cache_key == cache_key).await;
        if let Some(mut entry) = existing.into_iter().next() {
            entry.image_tag = image_tag.to_string();
            entry.size_bytes = size_bytes;
            entry.last_used_at = Utc::now();
            entry.use_count += 1;
            let id = entry.id.clone();
            return self.store.update(&id, entry).await;
        }

        let entry = LayerCacheEntry {
            id: Uuid::new_v4().to_string(),
            cache_key: cache_key.to_string(),
            image_tag: image_tag.to_string(),
            interpreter_version: deps
                .interpreter_version
                .clone()
                .unwrap_or_else(|| self.default_interpreter.clone()),
            packages_hash: compute_packages_hash(deps),
            package_count: deps.packages.len(),
            size_bytes,
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            // Building the layer is its first use / 构建该层即是其首次使用
            use_count: 1,
        };
        self.store.create(entry).await
    }

    /// Drop the entry for a key, e.g. when its image disappeared
    /// 删除某键的条目，例如其镜像已消失
    pub async fn invalidate(&self, cache_key: &str) -> ControlResult<bool> {
        let matches = self.store.find(|e| e.cache_key == cache_key).await;
        match matches.into_iter().next() {
            Some(entry) => self.store.delete(&entry.id).await,
            None => Ok(false),
        }
    }

    pub async fn list_entries(&self) -> Vec<LayerCacheEntry> {
        self.store.list_all().await
    }

    /// Entries not used since the cutoff / 截止时间后未使用的条目
    pub async fn find_stale(&self, max_age_days: i64) -> Vec<LayerCacheEntry> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        self.store.find(|e| e.last_used_at < cutoff).await
    }

    pub async fn delete_entry(&self, id: &str) -> ControlResult<bool> {
        self.store.delete(id).await
    }
}
