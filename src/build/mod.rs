//! Build and cache engine for program images
//! 程序镜像的构建和缓存引擎
//!
//! Produces an image tag for a program, reusing a cached dependency layer
//! whenever the canonicalized dependency specification hashes to a known key.
//! 为程序生成镜像标签，只要规范化的依赖规范哈希到已知键就重用缓存的依赖层。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod daemon;
pub mod dockerfile;
pub mod engine;

pub use cache::{compute_cache_key, compute_packages_hash, LayerCache};
pub use daemon::{ContainerCli, ContainerRuntime};
pub use engine::ImageBuilder;

use crate::storage::Document;

/// Image tag prefixes / 镜像标签前缀
pub const DEPS_IMAGE_PREFIX: &str = "mellea-deps";
pub const PROGRAM_IMAGE_PREFIX: &str = "mellea-prog";

/// Stages of a build / 构建的各个阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Preparing,
    CacheLookup,
    BuildingDeps,
    BuildingProgram,
    Complete,
    Failed,
}

/// Mutable bookkeeping for one build / 单次构建的可变记录
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub program_id: String,
    pub stage: BuildStage,
    pub cache_key: Option<String>,
    pub cache_hit: bool,
    pub dependency_image_tag: Option<String>,
    pub final_image_tag: Option<String>,
    pub deps_build_duration_seconds: Option<f64>,
    pub program_build_duration_seconds: Option<f64>,
    pub error_message: Option<String>,
}

impl BuildContext {
    pub fn new(program_id: impl Into<String>) -> Self {
        Self {
            program_id: program_id.into(),
            stage: BuildStage::Preparing,
            cache_key: None,
            cache_hit: false,
            dependency_image_tag: None,
            final_image_tag: None,
            deps_build_duration_seconds: None,
            program_build_duration_seconds: None,
            error_message: None,
        }
    }
}

/// Outcome of a build request / 构建请求的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub program_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub total_duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps_build_duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_build_duration_seconds: Option<f64>,
    /// Set by the Kaniko backend; poll the build job for the final state
    /// 由Kaniko后端设置；轮询构建作业以获取最终状态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_job_name: Option<String>,
}

impl BuildResult {
    /// A blank unsuccessful result to fill in / 用于填充的空白失败结果
    pub fn empty(program_id: &str) -> Self {
        Self {
            program_id: program_id.to_string(),
            success: false,
            image_tag: None,
            cache_hit: false,
            error_message: None,
            total_duration_seconds: 0.0,
            deps_build_duration_seconds: None,
            program_build_duration_seconds: None,
            build_job_name: None,
        }
    }
}

/// A cached dependency image layer / 缓存的依赖镜像层
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerCacheEntry {
    pub id: String,
    /// SHA-256 hex of the canonical dependency spec / 规范依赖规范的SHA-256十六进制
    pub cache_key: String,
    pub image_tag: String,
    pub interpreter_version: String,
    /// Short digest over sorted package names / 排序包名的短摘要
    pub packages_hash: String,
    pub package_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
}

impl Document for LayerCacheEntry {
    fn id(&self) -> &str {
        &self.id
    }
}
