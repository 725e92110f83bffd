//! Keyed JSON document store
//! 键控JSON文档存储
//!
//! Each collection is a single JSON file shaped `{collection_key: [entities]}`.
//! Rewrites are atomic: the new content is written to a temporary file in the
//! same directory and renamed over the original.
//! 每个集合是一个形如`{collection_key: [entities]}`的JSON文件。
//! 重写是原子的：新内容先写入同目录的临时文件，再重命名覆盖原文件。

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::services::error::{ControlError, ControlResult};

/// A persistable entity with a stable identifier / 具有稳定标识符的可持久化实体
pub trait Document: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique identifier of the entity / 实体的唯一标识符
    fn id(&self) -> &str;

    /// Stamp the entity as modified. Entities without an `updated_at`
    /// field keep the default no-op.
    /// 将实体标记为已修改。没有`updated_at`字段的实体保持默认空操作。
    fn touch(&mut self) {}
}

/// JSON-file-backed document store for one collection / 单个集合的JSON文件文档存储
#[derive(Debug)]
pub struct JsonStore<T: Document> {
    file_path: PathBuf,
    collection_key: String,
    entries: RwLock<BTreeMap<String, T>>,
}

impl<T: Document> JsonStore<T> {
    /// Open a store, loading the collection file if it exists
    /// 打开存储，如果集合文件存在则加载
    pub async fn open(
        file_path: impl Into<PathBuf>,
        collection_key: impl Into<String>,
    ) -> ControlResult<Self> {
        let file_path = file_path.into();
        let collection_key = collection_key.into();
        let mut entries = BTreeMap::new();

        if file_path.exists() {
            let raw = tokio::fs::read(&file_path).await?;
            let mut document: BTreeMap<String, Vec<T>> = serde_json::from_slice(&raw)
                .map_err(|e| {
                    ControlError::Store(format!(
                        "failed to parse {}: {}",
                        file_path.display(),
                        e
                    ))
                })?;
            for entity in document.remove(&collection_key).unwrap_or_default() {
                entries.insert(entity.id().to_string(), entity);
            }
        }

        Ok(Self {
            file_path,
            collection_key,
            entries: RwLock::new(entries),
        })
    }

    /// Path of the backing file / 后备文件的路径
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Create a new entity; fails if the id already exists
    /// 创建新实体；如果id已存在则失败
    pub async fn create(&self, entity: T) -> ControlResult<T> {
        let mut entries = self.entries.write().await;
        let id = entity.id().to_string();
        if entries.contains_key(&id) {
            return Err(ControlError::Store(format!(
                "entity {} already exists in {}",
                id, self.collection_key
            )));
        }
        entries.insert(id, entity.clone());
        self.persist(&entries).await?;
        Ok(entity)
    }

    /// Get an entity by id / 根据id获取实体
    pub async fn get(&self, id: &str) -> Option<T> {
        let entries = self.entries.read().await;
        entries.get(id).cloned()
    }

    /// Replace an entity, stamping its modification time
    /// 替换实体，并更新其修改时间
    pub async fn update(&self, id: &str, mut entity: T) -> ControlResult<T> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(id) {
            return Err(ControlError::not_found(self.collection_key.clone(), id));
        }
        entity.touch();
        entries.insert(id.to_string(), entity.clone());
        self.persist(&entries).await?;
        Ok(entity)
    }

    /// Delete an entity by id / 根据id删除实体
    pub async fn delete(&self, id: &str) -> ControlResult<bool> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(id).is_some();
        if removed {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    /// List every entity in the collection / 列出集合中的每个实体
    pub async fn list_all(&self) -> Vec<T> {
        let entries = self.entries.read().await;
        entries.values().cloned().collect()
    }

    /// Find entities matching a predicate / 查找匹配谓词的实体
    pub async fn find<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let entries = self.entries.read().await;
        entries.values().filter(|e| predicate(e)).cloned().collect()
    }

    /// Count entities in the collection / 统计集合中的实体数量
    pub async fn count(&self) -> usize {
        let entries = self.entries.read().await;
        entries.len()
    }

    /// Write the collection file atomically. Called with the write lock held
    /// so concurrent mutations serialize.
    /// 原子地写入集合文件。持有写锁调用，因此并发修改会串行化。
    async fn persist(&self, entries: &BTreeMap<String, T>) -> ControlResult<()> {
        if let Some(parent) = self.file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut document = BTreeMap::new();
        document.insert(
            self.collection_key.clone(),
            entries.values().cloned().collect::<Vec<T>>(),
        );
        let raw = serde_json::to_vec_pretty(&document)
            .map_err(|e| ControlError::Serialization(e.to_string()))?;

        let tmp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &raw).await?;
        tokio::fs::rename(&tmp_path, &self.file_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: String,
        value: u32,
        revision: u32,
    }

    impl Document for Record {
        fn id(&self) -> &str {
            &self.id
        }

        fn touch(&mut self) {
            self.revision += 1;
        }
    }

    fn record(id: &str, value: u32) -> Record {
        Record {
            id: id.to_string(),
            value,
            revision: 0,
        }
    }

    async fn open_store(dir: &Path) -> JsonStore<Record> {
        JsonStore::open(dir.join("records.json"), "records")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let created = store.create(record("r1", 42)).await.unwrap();
        assert_eq!(created.value, 42);

        let fetched = store.get("r1").await.unwrap();
        assert_eq!(fetched, created);
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.create(record("r1", 1)).await.unwrap();
        let err = store.create(record("r1", 2)).await.unwrap_err();
        assert!(matches!(err, ControlError::Store(_)));

        // Original entity unchanged / 原实体未更改
        assert_eq!(store.get("r1").await.unwrap().value, 1);
    }

    #[tokio::test]
    async fn test_update_touches_and_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.create(record("r1", 1)).await.unwrap();
        let updated = store.update("r1", record("r1", 9)).await.unwrap();
        assert_eq!(updated.value, 9);
        assert_eq!(updated.revision, 1);

        let err = store.update("nope", record("nope", 0)).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.create(record("r1", 1)).await.unwrap();
        assert!(store.delete("r1").await.unwrap());
        assert!(!store.delete("r1").await.unwrap());
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_find_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for i in 0..5 {
            store.create(record(&format!("r{i}"), i)).await.unwrap();
        }

        assert_eq!(store.list_all().await.len(), 5);
        let even = store.find(|r| r.value % 2 == 0).await;
        assert_eq!(even.len(), 3);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path()).await;
            store.create(record("r1", 7)).await.unwrap();
            store.create(record("r2", 8)).await.unwrap();
            store.delete("r2").await.unwrap();
        }

        let reopened = open_store(dir.path()).await;
        assert_eq!(reopened.count().await, 1);
        assert_eq!(reopened.get("r1").await.unwrap().value, 7);
    }

    #[tokio::test]
    async fn test_file_shape_is_keyed_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.create(record("r1", 7)).await.unwrap();

        let raw = std::fs::read(dir.path().join("records.json")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(value.get("records").unwrap().is_array());
        assert_eq!(value["records"].as_array().unwrap().len(), 1);
    }
}
