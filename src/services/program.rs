//! Program assets and their dependency specifications
//! 程序资产及其依赖规范

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::services::error::{ControlError, ControlResult};
use crate::storage::{Document, JsonStore};

/// Where a dependency specification came from / 依赖规范的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencySource {
    Pyproject,
    Requirements,
    Manual,
}

/// A single package reference / 单个包引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub extras: Vec<String>,
}

impl PackageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            extras: Vec::new(),
        }
    }

    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
            extras: Vec::new(),
        }
    }

    /// Requirement line as it appears in a requirements file
    /// 需求文件中的需求行
    pub fn requirement_line(&self) -> String {
        let mut line = self.name.clone();
        if !self.extras.is_empty() {
            line.push('[');
            line.push_str(&self.extras.join(","));
            line.push(']');
        }
        if let Some(version) = self.version.as_ref() {
            line.push_str("==");
            line.push_str(version);
        }
        line
    }
}

/// Dependency specification of a program / 程序的依赖规范
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub source: DependencySource,
    #[serde(default)]
    pub packages: Vec<PackageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_version: Option<String>,
}

impl DependencySpec {
    pub fn manual(packages: Vec<PackageRef>, interpreter_version: Option<String>) -> Self {
        Self {
            source: DependencySource::Manual,
            packages,
            interpreter_version,
        }
    }
}

impl Default for DependencySpec {
    fn default() -> Self {
        Self {
            source: DependencySource::Manual,
            packages: Vec::new(),
            interpreter_version: None,
        }
    }
}

/// Build lifecycle of a program's container image / 程序容器镜像的构建生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageBuildStatus {
    Pending,
    Building,
    Ready,
    Failed,
}

/// A user program registered with the platform / 平台上注册的用户程序
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramAsset {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// Entry point file relative to the project root / 相对于项目根目录的入口文件
    pub entrypoint: String,
    pub project_root: String,
    pub dependencies: DependencySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    pub image_build_status: ImageBuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_build_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document for ProgramAsset {
    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Service managing program assets / 管理程序资产的服务
#[derive(Clone)]
pub struct ProgramService {
    store: Arc<JsonStore<ProgramAsset>>,
    storage: StorageConfig,
}

impl ProgramService {
    pub async fn new(storage: StorageConfig) -> ControlResult<Self> {
        let store =
            JsonStore::open(storage.metadata_dir().join("programs.json"), "programs").await?;
        Ok(Self {
            store: Arc::new(store),
            storage,
        })
    }

    /// Register a new program / 注册新程序
    pub async fn create_program(
        &self,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        entrypoint: impl Into<String>,
        dependencies: DependencySpec,
    ) -> ControlResult<ProgramAsset> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let program = ProgramAsset {
            id: id.clone(),
            owner_id: owner_id.into(),
            name: name.into(),
            entrypoint: entrypoint.into(),
            project_root: ".".to_string(),
            dependencies,
            image_tag: None,
            image_build_status: ImageBuildStatus::Pending,
            image_build_error: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        let created = self.store.create(program).await?;
        info!(program_id = %created.id, name = %created.name, "registered program");
        Ok(created)
    }

    pub async fn get_program(&self, id: &str) -> Option<ProgramAsset> {
        self.store.get(id).await
    }

    pub async fn require_program(&self, id: &str) -> ControlResult<ProgramAsset> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| ControlError::not_found("program", id))
    }

    pub async fn list_programs(&self) -> Vec<ProgramAsset> {
        self.store.list_all().await
    }

    /// Record the outcome of an image build / 记录镜像构建的结果
    pub async fn set_build_status(
        &self,
        id: &str,
        status: ImageBuildStatus,
        image_tag: Option<String>,
        error: Option<String>,
    ) -> ControlResult<ProgramAsset> {
        let mut program = self.require_program(id).await?;
        program.image_build_status = status;
        if image_tag.is_some() {
            program.image_tag = image_tag;
        }
        program.image_build_error = error;
        self.store.update(id, program).await
    }

    /// Record that the program has just been run / 记录程序刚刚被运行
    pub async fn touch_last_run(&self, id: &str) -> ControlResult<ProgramAsset> {
        let mut program = self.require_program(id).await?;
        program.last_run_at = Some(Utc::now());
        self.store.update(id, program).await
    }

    /// Workspace directory for a program's sources / 程序源码的工作区目录
    pub fn workspace_path(&self, program_id: &str) -> PathBuf {
        self.storage.workspace_path(program_id)
    }
}
