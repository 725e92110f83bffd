//! Image build engine with dependency-layer caching
//! 带依赖层缓存的镜像构建引擎
//!
//! Two backends share the algorithm: the daemon backend builds deps and
//! program layers synchronously against the local container runtime; the
//! Kaniko backend submits an in-cluster build job and returns immediately,
//! leaving the caller to poll for the final state.
//! 两个后端共享该算法：daemon后端针对本地容器运行时同步构建依赖层和程序层；
//! Kaniko后端提交集群内构建作业并立即返回，由调用方轮询最终状态。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cache::{compute_cache_key, LayerCache};
use super::daemon::ContainerRuntime;
use super::dockerfile::{
    generate_deps_dockerfile, generate_kaniko_dockerfile, generate_program_dockerfile,
};
use super::{BuildContext, BuildResult, BuildStage, DEPS_IMAGE_PREFIX, PROGRAM_IMAGE_PREFIX};
use crate::config::BuildConfig;
use crate::k8s::kaniko::{BuildJobApi, BuildJobRequest};
use crate::services::error::{ControlError, ControlResult};
use crate::services::program::{DependencySpec, ProgramAsset};

/// Registry used for image delivery on local clusters without a configured
/// registry. / 未配置仓库的本地集群用于镜像交付的仓库。
const LOCAL_CLUSTER_REGISTRY: &str = "localhost:5001";

fn truncate_id(id: &str, len: usize) -> &str {
    let end = id
        .char_indices()
        .nth(len)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Image builder shared by foreground requests and the warmup controller
/// 前台请求和预热控制器共享的镜像构建器
pub struct ImageBuilder {
    config: BuildConfig,
    cache: LayerCache,
    runtime: Arc<dyn ContainerRuntime>,
    kaniko: Option<Arc<dyn BuildJobApi>>,
    registry_logged_in: Mutex<bool>,
}

impl ImageBuilder {
    pub fn new(
        config: BuildConfig,
        cache: LayerCache,
        runtime: Arc<dyn ContainerRuntime>,
        kaniko: Option<Arc<dyn BuildJobApi>>,
    ) -> Self {
        Self {
            config,
            cache,
            runtime,
            kaniko,
            registry_logged_in: Mutex::new(false),
        }
    }

    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    /// Prefix a tag with the registry when one is configured
    /// 配置了仓库时为标签添加仓库前缀
    pub fn full_image_tag(&self, image_tag: &str) -> String {
        match self.config.registry_url.as_ref() {
            Some(registry) => format!("{registry}/{image_tag}"),
            None => image_tag.to_string(),
        }
    }

    /// Probe for a cached image. With a registry configured the
    /// registry-prefixed tag is checked so a hit on one node is a hit
    /// everywhere; otherwise the local runtime decides.
    /// 探测缓存镜像。配置了仓库时检查带仓库前缀的标签，使一个节点的命中
    /// 在所有节点都有效；否则由本地运行时决定。
    pub async fn verify_cached_image_exists(&self, image_tag: &str) -> bool {
        let probe_tag = if self.config.registry_url.is_some() {
            self.full_image_tag(image_tag)
        } else {
            image_tag.to_string()
        };
        match self.runtime.image_exists(&probe_tag).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(image_tag = %probe_tag, error = %e, "error checking image");
                false
            }
        }
    }

    async fn login_to_registry(&self) -> bool {
        let Some(registry) = self.config.registry_url.as_ref() else {
            return true;
        };

        let mut logged_in = self.registry_logged_in.lock().await;
        if *logged_in {
            return true;
        }

        let (Some(username), Some(password)) = (
            self.config.registry_username.as_ref(),
            self.config.registry_password.as_ref(),
        ) else {
            warn!(registry = %registry, "registry configured but no credentials provided");
            return false;
        };

        match self.runtime.login(registry, username, password).await {
            Ok(()) => {
                *logged_in = true;
                info!(registry = %registry, "logged in to registry");
                true
            }
            Err(e) => {
                warn!(registry = %registry, error = %e, "failed to login to registry");
                false
            }
        }
    }

    /// Push an image; failures are warnings, never build failures
    /// 推送镜像；失败只是警告，绝不是构建失败
    pub async fn push_image(&self, image_tag: &str) -> bool {
        if self.config.registry_url.is_none() {
            debug!("no registry configured, skipping push");
            return false;
        }
        if !self.login_to_registry().await {
            warn!("cannot push: registry login failed");
            return false;
        }

        let full_tag = self.full_image_tag(image_tag);
        let outcome: ControlResult<()> = async {
            self.runtime.tag_image(image_tag, &full_tag).await?;
            self.runtime.push(&full_tag).await
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(tag = %full_tag, "pushed image");
                true
            }
            Err(e) => {
                warn!(tag = %full_tag, error = %e, "failed to push image");
                false
            }
        }
    }

    /// Pull an image and retag it locally / 拉取镜像并在本地重新打标签
    pub async fn pull_image(&self, image_tag: &str) -> bool {
        if self.config.registry_url.is_none() {
            debug!("no registry configured, skipping pull");
            return false;
        }
        if !self.login_to_registry().await {
            warn!("cannot pull: registry login failed");
            return false;
        }

        let full_tag = self.full_image_tag(image_tag);
        let outcome: ControlResult<()> = async {
            self.runtime.pull(&full_tag).await?;
            self.runtime.tag_image(&full_tag, image_tag).await
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(tag = %image_tag, "pulled and tagged image");
                true
            }
            Err(e) => {
                warn!(tag = %full_tag, error = %e, "failed to pull image");
                false
            }
        }
    }

    /// Build an image for a program / 为程序构建镜像
    pub async fn build_image(
        &self,
        program: &ProgramAsset,
        workspace_path: &Path,
        force_rebuild: bool,
        push: bool,
    ) -> BuildResult {
        if self.config.build_backend == "kaniko" {
            return self.build_with_kaniko(program, workspace_path).await;
        }
        self.build_with_daemon(program, workspace_path, force_rebuild, push)
            .await
    }

    async fn build_with_daemon(
        &self,
        program: &ProgramAsset,
        workspace_path: &Path,
        force_rebuild: bool,
        push: bool,
    ) -> BuildResult {
        let start = Instant::now();
        let mut context = BuildContext::new(&program.id);

        let outcome = self
            .run_daemon_stages(program, workspace_path, force_rebuild, push, &mut context)
            .await;

        let total = start.elapsed().as_secs_f64();
        match outcome {
            Ok(final_tag) => {
                context.stage = BuildStage::Complete;
                info!(
                    program_id = %program.id,
                    image_tag = %final_tag,
                    cache_hit = context.cache_hit,
                    duration = total,
                    "build complete"
                );
                BuildResult {
                    program_id: program.id.clone(),
                    success: true,
                    image_tag: Some(final_tag),
                    cache_hit: context.cache_hit,
                    error_message: None,
                    total_duration_seconds: total,
                    deps_build_duration_seconds: context.deps_build_duration_seconds,
                    program_build_duration_seconds: context.program_build_duration_seconds,
                    build_job_name: None,
                }
            }
            Err(e) => {
                context.stage = BuildStage::Failed;
                warn!(program_id = %program.id, error = %e, "build failed");
                BuildResult {
                    program_id: program.id.clone(),
                    success: false,
                    image_tag: None,
                    cache_hit: context.cache_hit,
                    error_message: Some(e.to_string()),
                    total_duration_seconds: total,
                    deps_build_duration_seconds: context.deps_build_duration_seconds,
                    program_build_duration_seconds: context.program_build_duration_seconds,
                    build_job_name: None,
                }
            }
        }
    }

    async fn run_daemon_stages(
        &self,
        program: &ProgramAsset,
        workspace_path: &Path,
        force_rebuild: bool,
        push: bool,
        context: &mut BuildContext,
    ) -> ControlResult<String> {
        context.stage = BuildStage::Preparing;
        let cache_key = compute_cache_key(&program.dependencies, &self.config.default_interpreter);
        context.cache_key = Some(cache_key.clone());
        info!(program_id = %program.id, cache_key = %truncate_id(&cache_key, 12), "build started");

        context.stage = BuildStage::CacheLookup;
        let mut deps_image_tag: Option<String> = None;
        if !force_rebuild {
            if let Some(cached) = self.cache.get_cached_layer(&cache_key).await? {
                if self.verify_cached_image_exists(&cached.image_tag).await {
                    context.cache_hit = true;
                    deps_image_tag = Some(cached.image_tag.clone());
                    info!(image_tag = %cached.image_tag, "cache hit, reusing dependency layer");
                } else {
                    // The image is gone; the entry is stale / 镜像已消失；条目已陈旧
                    warn!(image_tag = %cached.image_tag, "cached image missing, invalidating entry");
                    self.cache.invalidate(&cache_key).await?;
                }
            }
        }

        let deps_build_start = Instant::now();
        let deps_image_tag = match deps_image_tag {
            Some(tag) => tag,
            None => {
                context.stage = BuildStage::BuildingDeps;
                let tag = self
                    .build_dependency_layer(&program.dependencies, &cache_key)
                    .await?;
                if push {
                    self.push_image(&tag).await;
                }
                tag
            }
        };
        context.deps_build_duration_seconds = Some(deps_build_start.elapsed().as_secs_f64());
        context.dependency_image_tag = Some(deps_image_tag.clone());

        context.stage = BuildStage::BuildingProgram;
        let program_build_start = Instant::now();
        let final_tag = self
            .build_program_layer(program, &deps_image_tag, workspace_path)
            .await?;
        context.program_build_duration_seconds = Some(program_build_start.elapsed().as_secs_f64());
        context.final_image_tag = Some(final_tag.clone());

        if push {
            self.push_image(&final_tag).await;
        }

        Ok(final_tag)
    }

    /// Build the dependency layer and record it in the cache
    /// 构建依赖层并记录到缓存
    async fn build_dependency_layer(
        &self,
        deps: &DependencySpec,
        cache_key: &str,
    ) -> ControlResult<String> {
        let image_tag = format!("{DEPS_IMAGE_PREFIX}:{}", truncate_id(cache_key, 12));
        let (dockerfile, requirements) = generate_deps_dockerfile(
            deps,
            &self.config.base_images,
            &self.config.default_interpreter,
        );

        let build_dir = tempfile::tempdir()?;
        tokio::fs::write(build_dir.path().join("Dockerfile"), dockerfile).await?;
        tokio::fs::write(build_dir.path().join("requirements.txt"), requirements).await?;

        info!(image_tag = %image_tag, "building dependency layer");
        self.runtime.build(build_dir.path(), &image_tag).await?;

        let size_bytes = self.runtime.image_size(&image_tag).await.unwrap_or(None);
        self.cache
            .create_entry(cache_key, &image_tag, deps, size_bytes)
            .await?;
        info!(image_tag = %image_tag, "dependency layer cached");

        Ok(image_tag)
    }

    /// Build the program layer on top of the dependency image
    /// 在依赖镜像之上构建程序层
    async fn build_program_layer(
        &self,
        program: &ProgramAsset,
        deps_image_tag: &str,
        workspace_path: &Path,
    ) -> ControlResult<String> {
        let image_tag = format!("{PROGRAM_IMAGE_PREFIX}:{}", truncate_id(&program.id, 12));

        if !workspace_path.exists() {
            return Err(ControlError::ImageBuild(format!(
                "workspace not found: {}",
                workspace_path.display()
            )));
        }

        let dockerfile = generate_program_dockerfile(program, deps_image_tag);
        let dockerfile_path = workspace_path.join("Dockerfile");
        tokio::fs::write(&dockerfile_path, dockerfile).await?;

        info!(image_tag = %image_tag, "building program layer");
        let result = self.runtime.build(workspace_path, &image_tag).await;

        // The workspace is not ours; leave it as found
        // 工作区不属于我们；保持原样
        let _ = tokio::fs::remove_file(&dockerfile_path).await;
        result?;

        Ok(image_tag)
    }

    /// Submit an in-cluster build and return immediately
    /// 提交集群内构建并立即返回
    async fn build_with_kaniko(
        &self,
        program: &ProgramAsset,
        workspace_path: &Path,
    ) -> BuildResult {
        let Some(kaniko) = self.kaniko.as_ref() else {
            return BuildResult {
                error_message: Some("kaniko backend not configured".to_string()),
                ..BuildResult::empty(&program.id)
            };
        };

        let dockerfile = generate_kaniko_dockerfile(
            program,
            &self.config.base_images,
            &self.config.default_interpreter,
        );
        let context_files = collect_context_files(workspace_path);

        // Kaniko must push somewhere the cluster can pull from
        // Kaniko必须推送到集群能拉取的位置
        let registry = self
            .config
            .registry_url
            .as_deref()
            .unwrap_or(LOCAL_CLUSTER_REGISTRY);
        let image_tag = format!(
            "{registry}/{PROGRAM_IMAGE_PREFIX}:{}",
            truncate_id(&program.id, 12)
        );

        info!(program_id = %program.id, image_tag = %image_tag, "starting Kaniko build");
        kaniko
            .create_build_job(&BuildJobRequest {
                program_id: program.id.clone(),
                dockerfile,
                context_files,
                image_tag,
            })
            .await
    }

    /// Remove cache entries unused for longer than `max_age_days`,
    /// deleting the underlying images best-effort.
    /// 删除超过`max_age_days`未使用的缓存条目，并尽力删除底层镜像。
    pub async fn prune_stale_cache_entries(&self, max_age_days: i64) -> ControlResult<usize> {
        let stale = self.cache.find_stale(max_age_days).await;
        let mut pruned = 0;

        for entry in stale {
            if let Err(e) = self.runtime.remove_image(&entry.image_tag).await {
                debug!(image_tag = %entry.image_tag, error = %e, "could not remove image");
            }
            if self.cache.delete_entry(&entry.id).await? {
                pruned += 1;
                info!(cache_key = %truncate_id(&entry.cache_key, 12), "pruned stale cache entry");
            }
        }

        Ok(pruned)
    }
}

/// Read the workspace into ConfigMap-sized context files, skipping hidden
/// paths, `__pycache__` and binary content.
/// 将工作区读取为ConfigMap大小的上下文文件，跳过隐藏路径、`__pycache__`
/// 和二进制内容。
pub fn collect_context_files(workspace_path: &Path) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    if !workspace_path.exists() {
        return files;
    }
    collect_dir(workspace_path, workspace_path, &mut files);
    files
}

fn collect_dir(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "__pycache__" {
            continue;
        }
        if path.is_dir() {
            collect_dir(root, &path, files);
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(relative) = path.strip_prefix(root) {
                files.insert(relative.to_string_lossy().into_owned(), content);
            }
        } else {
            debug!(path = %path.display(), "skipping binary file");
        }
    }
}
