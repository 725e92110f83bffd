//! In-cluster image builds with Kaniko
//! 使用Kaniko的集群内镜像构建
//!
//! Builds container images inside the cluster without a local container
//! daemon: the build context travels in a ConfigMap, a Job runs the Kaniko
//! executor, and callers poll the Job for the outcome.
//! 在集群内构建容器镜像，无需本地容器守护进程：构建上下文放在ConfigMap中，
//! 作业运行Kaniko执行器，调用者轮询作业以获取结果。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, Pod, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{
    derive_job_status, short_id, JobStatus, IMAGE_TAG_ANNOTATION, JOB_TYPE_LABEL, PART_OF_LABEL,
    PART_OF_VALUE, PROGRAM_ID_LABEL,
};
use crate::build::BuildResult;
use crate::config::BuildConfig;
use crate::services::error::{ControlError, ControlResult};

/// Secret holding registry auth for Kaniko / 保存Kaniko仓库认证的Secret
const DOCKER_CONFIG_SECRET: &str = "kaniko-docker-config";
const KANIKO_CONTAINER: &str = "kaniko";
const DEFAULT_TTL_SECONDS: i32 = 3600;
/// One retry for transient failures / 瞬时失败允许一次重试
const BUILD_BACKOFF_LIMIT: i32 = 1;
const CONFIGMAP_ANNOTATION: &str = "mellea.io/configmap";

/// A build submission / 构建提交
#[derive(Debug, Clone)]
pub struct BuildJobRequest {
    pub program_id: String,
    pub dockerfile: String,
    /// Context file name -> content / 上下文文件名 -> 内容
    pub context_files: BTreeMap<String, String>,
    /// Full destination tag including registry / 包含仓库的完整目标标签
    pub image_tag: String,
}

/// Status view over a Kaniko build Job / Kaniko构建作业的状态视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub job_name: String,
    pub program_id: String,
    pub image_tag: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Cluster operations for image builds / 镜像构建的集群操作
#[async_trait]
pub trait BuildJobApi: Send + Sync {
    /// Submit a build; returns immediately / 提交构建；立即返回
    async fn create_build_job(&self, request: &BuildJobRequest) -> BuildResult;

    async fn get_build_status(&self, job_name: &str) -> ControlResult<BuildJob>;

    async fn get_build_logs(&self, job_name: &str, tail_lines: i64) -> ControlResult<String>;

    /// Delete the Job and its ConfigMap / 删除作业及其ConfigMap
    async fn delete_build_job(&self, job_name: &str) -> ControlResult<bool>;

    /// Poll until terminal or timeout / 轮询直到终态或超时
    async fn wait_for_build(
        &self,
        job_name: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> ControlResult<BuildJob>;
}

/// Deterministic build job name for a program / 程序的确定性构建作业名
pub fn build_job_name(program_id: &str) -> String {
    format!("mellea-build-{}", short_id(program_id))
}

/// ConfigMap name holding the build context / 保存构建上下文的ConfigMap名称
pub fn build_context_name(program_id: &str) -> String {
    format!("build-context-{}", short_id(program_id))
}

fn build_labels(program_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string());
    labels.insert(PROGRAM_ID_LABEL.to_string(), program_id.to_string());
    labels.insert(JOB_TYPE_LABEL.to_string(), "build".to_string());
    labels
}

/// Kaniko executor arguments for a destination tag / 目标标签对应的Kaniko执行器参数
pub fn kaniko_args(image_tag: &str, registry_url: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--dockerfile=/workspace/Dockerfile".to_string(),
        "--context=dir:///workspace".to_string(),
        format!("--destination={image_tag}"),
        "--cache=true".to_string(),
        "--snapshot-mode=redo".to_string(),
        "--use-new-run".to_string(),
    ];
    if let Some(registry) = registry_url {
        args.push(format!("--cache-repo={registry}/mellea-cache"));
    }
    args
}

/// Build the Kaniko Job object / 构建Kaniko作业对象
pub fn build_kaniko_job(
    request: &BuildJobRequest,
    config: &BuildConfig,
    namespace: &str,
) -> Job {
    let job_name = build_job_name(&request.program_id);
    let configmap_name = build_context_name(&request.program_id);
    let labels = build_labels(&request.program_id);

    let volume_mounts = vec![
        VolumeMount {
            name: "build-context".to_string(),
            mount_path: "/workspace".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "docker-config".to_string(),
            mount_path: "/kaniko/.docker".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];

    let volumes = vec![
        Volume {
            name: "build-context".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: configmap_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        // Missing registry auth is tolerated / 容忍缺失的仓库认证
        Volume {
            name: "docker-config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(DOCKER_CONFIG_SECRET.to_string()),
                optional: Some(true),
                default_mode: Some(0o400),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity("500m".to_string()));
    requests.insert("memory".to_string(), Quantity("512Mi".to_string()));
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(config.build_cpu_limit.clone()));
    limits.insert(
        "memory".to_string(),
        Quantity(config.build_memory_limit.clone()),
    );

    let container = Container {
        name: KANIKO_CONTAINER.to_string(),
        image: Some(config.kaniko_image.clone()),
        args: Some(kaniko_args(
            &request.image_tag,
            config.registry_url.as_deref(),
        )),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    let mut annotations = BTreeMap::new();
    annotations.insert(IMAGE_TAG_ANNOTATION.to_string(), request.image_tag.clone());
    annotations.insert(CONFIGMAP_ANNOTATION.to_string(), configmap_name);

    Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(DEFAULT_TTL_SECONDS),
            active_deadline_seconds: Some(config.build_timeout_seconds),
            backoff_limit: Some(BUILD_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the ConfigMap carrying the Dockerfile and context files
/// 构建携带Dockerfile和上下文文件的ConfigMap
pub fn build_context_configmap(request: &BuildJobRequest, namespace: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert("Dockerfile".to_string(), request.dockerfile.clone());
    for (path, content) in &request.context_files {
        data.insert(path.clone(), content.clone());
    }

    let mut labels = build_labels(&request.program_id);
    labels.insert(
        "mellea.io/resource-type".to_string(),
        "build-context".to_string(),
    );

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(build_context_name(&request.program_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Kaniko build adapter backed by the cluster API / 基于集群API的Kaniko构建适配器
pub struct KanikoBuildService {
    config: BuildConfig,
    builds_namespace: String,
    client: OnceCell<Client>,
}

impl KanikoBuildService {
    pub fn new(config: BuildConfig, builds_namespace: impl Into<String>) -> Self {
        Self {
            config,
            builds_namespace: builds_namespace.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> ControlResult<Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                Client::try_default()
                    .await
                    .map_err(|e| ControlError::cluster("failed to create Kubernetes client", e))
            })
            .await?;
        Ok(client.clone())
    }

    /// Best-effort removal of a previous build for the program
    /// 尽力删除该程序此前的构建
    async fn cleanup_existing_build(
        &self,
        job_name: &str,
        configmap_name: &str,
    ) -> ControlResult<()> {
        let client = self.client().await?;

        let jobs: Api<Job> = Api::namespaced(client.clone(), &self.builds_namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match jobs.delete(job_name, &params).await {
            Ok(_) => debug!(job_name = %job_name, "deleted existing build job"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(job_name = %job_name, error = %e, "failed to delete existing build job"),
        }

        let configmaps: Api<ConfigMap> = Api::namespaced(client, &self.builds_namespace);
        match configmaps.delete(configmap_name, &DeleteParams::default()).await {
            Ok(_) => debug!(configmap = %configmap_name, "deleted existing build context"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                warn!(configmap = %configmap_name, error = %e, "failed to delete existing build context")
            }
        }

        Ok(())
    }

    /// Create the context ConfigMap, replacing it on conflict
    /// 创建上下文ConfigMap，冲突时替换
    async fn create_context_configmap(&self, request: &BuildJobRequest) -> ControlResult<()> {
        let configmap = build_context_configmap(request, &self.builds_namespace);
        let name = build_context_name(&request.program_id);

        let client = self.client().await?;
        let configmaps: Api<ConfigMap> = Api::namespaced(client, &self.builds_namespace);
        match configmaps.create(&PostParams::default(), &configmap).await {
            Ok(_) => {
                info!(configmap = %name, "created build context");
                Ok(())
            }
            Err(e) if is_conflict(&e) => {
                configmaps
                    .replace(&name, &PostParams::default(), &configmap)
                    .await
                    .map_err(|e| {
                        ControlError::cluster(format!("failed to replace ConfigMap {name}"), e)
                    })?;
                info!(configmap = %name, "replaced existing build context");
                Ok(())
            }
            Err(e) => Err(ControlError::cluster(
                format!("failed to create ConfigMap {name}"),
                e,
            )),
        }
    }

    async fn find_build_pod(&self, job_name: &str) -> ControlResult<Option<Pod>> {
        let client = self.client().await?;
        let pods: Api<Pod> = Api::namespaced(client, &self.builds_namespace);
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        let pod_list = pods
            .list(&params)
            .await
            .map_err(|e| ControlError::cluster(format!("failed to list pods for {job_name}"), e))?;
        Ok(pod_list.items.into_iter().next())
    }

    /// `reason: message` of the first terminated container, if any
    /// 第一个已终止容器的`reason: message`（如有）
    async fn failure_reason(&self, job_name: &str) -> Option<String> {
        let pod = self.find_build_pod(job_name).await.ok().flatten()?;
        let terminated = pod
            .status
            .as_ref()?
            .container_statuses
            .as_ref()?
            .first()?
            .state
            .as_ref()?
            .terminated
            .as_ref()?;

        let reason = terminated.reason.clone().unwrap_or_default();
        match terminated.message.as_ref() {
            Some(message) => Some(format!("{reason}: {message}")),
            None if reason.is_empty() => None,
            None => Some(reason),
        }
    }
}

#[async_trait]
impl BuildJobApi for KanikoBuildService {
    async fn create_build_job(&self, request: &BuildJobRequest) -> BuildResult {
        let job_name = build_job_name(&request.program_id);
        let configmap_name = build_context_name(&request.program_id);

        let outcome: ControlResult<()> = async {
            self.cleanup_existing_build(&job_name, &configmap_name)
                .await?;
            self.create_context_configmap(request).await?;

            let job = build_kaniko_job(request, &self.config, &self.builds_namespace);
            let client = self.client().await?;
            let jobs: Api<Job> = Api::namespaced(client, &self.builds_namespace);
            jobs.create(&PostParams::default(), &job).await.map_err(|e| {
                ControlError::cluster(format!("failed to create build job {job_name}"), e)
            })?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(job_name = %job_name, program_id = %request.program_id, "created Kaniko build job");
                BuildResult {
                    program_id: request.program_id.clone(),
                    success: true,
                    image_tag: Some(request.image_tag.clone()),
                    cache_hit: false,
                    build_job_name: Some(job_name),
                    ..BuildResult::empty(&request.program_id)
                }
            }
            Err(e) => {
                warn!(job_name = %job_name, error = %e, "failed to create build job");
                BuildResult {
                    success: false,
                    error_message: Some(e.to_string()),
                    ..BuildResult::empty(&request.program_id)
                }
            }
        }
    }

    async fn get_build_status(&self, job_name: &str) -> ControlResult<BuildJob> {
        let client = self.client().await?;
        let jobs: Api<Job> = Api::namespaced(client, &self.builds_namespace);
        let job = jobs.get(job_name).await.map_err(|e| {
            if is_not_found(&e) {
                ControlError::not_found("build job", job_name)
            } else {
                ControlError::cluster(format!("failed to get build job {job_name}"), e)
            }
        })?;

        let status = derive_job_status(&job);

        let error_message = if status == JobStatus::Failed {
            self.failure_reason(job_name).await
        } else {
            None
        };

        let image_tag = job
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(IMAGE_TAG_ANNOTATION))
            .cloned()
            .unwrap_or_default();
        let program_id = job
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(PROGRAM_ID_LABEL))
            .cloned()
            .unwrap_or_default();

        Ok(BuildJob {
            job_name: job_name.to_string(),
            program_id,
            image_tag,
            status,
            started_at: job
                .status
                .as_ref()
                .and_then(|s| s.start_time.as_ref())
                .map(|t| super::jiff_timestamp_to_chrono(t.0)),
            completed_at: job
                .status
                .as_ref()
                .and_then(|s| s.completion_time.as_ref())
                .map(|t| super::jiff_timestamp_to_chrono(t.0)),
            error_message,
        })
    }

    async fn get_build_logs(&self, job_name: &str, tail_lines: i64) -> ControlResult<String> {
        let Some(pod) = self.find_build_pod(job_name).await? else {
            return Ok("No pod found for build job".to_string());
        };
        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControlError::ClusterState("pod has no name".to_string()))?;

        let client = self.client().await?;
        let pods: Api<Pod> = Api::namespaced(client, &self.builds_namespace);
        let params = LogParams {
            container: Some(KANIKO_CONTAINER.to_string()),
            tail_lines: Some(tail_lines),
            ..Default::default()
        };
        match pods.logs(&pod_name, &params).await {
            Ok(logs) => Ok(logs),
            Err(e) if is_not_found(&e) => Ok("Pod not found or logs not available yet".to_string()),
            Err(e) => Err(ControlError::cluster(
                format!("failed to get build logs for {job_name}"),
                e,
            )),
        }
    }

    async fn delete_build_job(&self, job_name: &str) -> ControlResult<bool> {
        let configmap_name = job_name.replace("mellea-build-", "build-context-");
        let client = self.client().await?;

        let mut deleted = false;
        let jobs: Api<Job> = Api::namespaced(client.clone(), &self.builds_namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match jobs.delete(job_name, &params).await {
            Ok(_) => {
                info!(job_name = %job_name, "deleted build job");
                deleted = true;
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(job_name = %job_name, error = %e, "failed to delete build job"),
        }

        let configmaps: Api<ConfigMap> = Api::namespaced(client, &self.builds_namespace);
        match configmaps.delete(&configmap_name, &DeleteParams::default()).await {
            Ok(_) => info!(configmap = %configmap_name, "deleted build context"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                warn!(configmap = %configmap_name, error = %e, "failed to delete build context")
            }
        }

        Ok(deleted)
    }

    async fn wait_for_build(
        &self,
        job_name: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> ControlResult<BuildJob> {
        let started = std::time::Instant::now();
        loop {
            let build = self.get_build_status(job_name).await?;
            if build.status.is_terminal() {
                return Ok(build);
            }

            if started.elapsed() > timeout {
                return Err(ControlError::Timeout(format!(
                    "build job {job_name} did not complete within {}s",
                    timeout.as_secs()
                )));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
