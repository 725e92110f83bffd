//! Kubernetes Job adapter for program runs
//! 程序运行的Kubernetes作业适配器
//!
//! Translates a run submission into a `batch/v1` Job executing a single
//! process with resource limits, a locked-down security context and optional
//! projected credential secrets, then tracks, cancels and tears it down.
//! 将运行提交转换为执行单个进程的`batch/v1`作业，带有资源限制、收紧的安全
//! 上下文和可选的投射凭证密钥，然后跟踪、取消和清理它。

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, Pod, PodSecurityContext, PodSpec,
    PodTemplateSpec, ProjectedVolumeSource, ResourceRequirements, SeccompProfile,
    SecretProjection, SecurityContext, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::Client;
use std::collections::BTreeMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{
    derive_job_status, short_id, JobInfo, ENVIRONMENT_ID_LABEL, JOB_TYPE_LABEL, PART_OF_LABEL,
    PART_OF_VALUE,
};
use crate::services::environment::ResourceLimits;
use crate::services::error::{ControlError, ControlResult};

/// Mount path for projected credential secrets / 投射凭证密钥的挂载路径
pub const SECRETS_MOUNT_PATH: &str = "/var/run/secrets/mellea";

/// Name of the container running the program / 运行程序的容器名称
pub const PROGRAM_CONTAINER: &str = "program";

const DEFAULT_TTL_SECONDS: i32 = 3600;
const DEFAULT_BACKOFF_LIMIT: i32 = 0;
const DEFAULT_USER_ID: i64 = 1000;
const DEFAULT_GROUP_ID: i64 = 1000;
const RUN_SERVICE_ACCOUNT: &str = "mellea-run";
const TERMINATION_GRACE_PERIOD: i64 = 30;

/// Everything needed to submit a run job / 提交运行作业所需的全部信息
#[derive(Debug, Clone)]
pub struct RunJobRequest {
    pub environment_id: String,
    pub image_tag: String,
    pub resource_limits: ResourceLimits,
    pub entrypoint: String,
    pub secret_names: Vec<String>,
}

/// Cluster operations the run executor depends on / 运行执行器依赖的集群操作
#[async_trait]
pub trait RunJobApi: Send + Sync {
    /// Create a Job for a run; returns the job name / 为运行创建作业；返回作业名
    async fn create_run_job(&self, request: &RunJobRequest) -> ControlResult<String>;

    /// Read the current status of a Job / 读取作业的当前状态
    async fn get_job_status(&self, job_name: &str, namespace: &str) -> ControlResult<JobInfo>;

    /// Logs of the program container, None before the pod starts
    /// 程序容器的日志，Pod启动前为None
    async fn get_pod_logs(
        &self,
        job_name: &str,
        namespace: &str,
        tail_lines: Option<i64>,
    ) -> ControlResult<Option<String>>;

    /// Idempotent delete; 404 is not an error / 幂等删除；404不是错误
    async fn delete_job(
        &self,
        job_name: &str,
        namespace: &str,
        propagation: PropagationPolicy,
        grace_period_seconds: Option<i64>,
    ) -> ControlResult<()>;

    /// Cancel with graceful or immediate termination / 以优雅或立即终止方式取消
    async fn cancel_job(&self, job_name: &str, namespace: &str, force: bool) -> ControlResult<()>;

    /// List jobs, optionally filtered by environment / 列出作业，可按环境过滤
    async fn list_jobs(
        &self,
        namespace: &str,
        environment_id: Option<&str>,
    ) -> ControlResult<Vec<JobInfo>>;
}

/// Deterministic job name for an environment / 环境的确定性作业名
pub fn run_job_name(environment_id: &str) -> String {
    format!("mellea-run-{}", short_id(environment_id))
}

fn run_labels(environment_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string());
    labels.insert(
        ENVIRONMENT_ID_LABEL.to_string(),
        environment_id.to_string(),
    );
    labels.insert(JOB_TYPE_LABEL.to_string(), "run".to_string());
    labels
}

/// Build the Job object for a run submission / 为运行提交构建作业对象
pub fn build_run_job(request: &RunJobRequest, namespace: &str) -> Job {
    let limits = &request.resource_limits;
    let cpu_request = format!("{}", limits.cpu_cores * 0.5);
    let cpu_limit = format!("{}", limits.cpu_cores);
    let memory_request = format!("{}Mi", limits.memory_mb / 2);
    let memory_limit = format!("{}Mi", limits.memory_mb);

    let mut volume_mounts = vec![
        VolumeMount {
            name: "tmp".to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "output".to_string(),
            mount_path: "/output".to_string(),
            ..Default::default()
        },
    ];
    let mut volumes = vec![
        Volume {
            name: "tmp".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "output".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    if !request.secret_names.is_empty() {
        volume_mounts.push(VolumeMount {
            name: "mellea-secrets".to_string(),
            mount_path: SECRETS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });

        // One projected volume assembling every named Secret
        // 一个汇集所有指定Secret的投射卷
        let sources = request
            .secret_names
            .iter()
            .map(|secret_name| VolumeProjection {
                secret: Some(SecretProjection {
                    name: secret_name.clone(),
                    items: None,
                    optional: None,
                }),
                ..Default::default()
            })
            .collect();
        volumes.push(Volume {
            name: "mellea-secrets".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(sources),
                default_mode: Some(0o400),
            }),
            ..Default::default()
        });
    }

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(cpu_request));
    requests.insert("memory".to_string(), Quantity(memory_request));
    let mut limits_map = BTreeMap::new();
    limits_map.insert("cpu".to_string(), Quantity(cpu_limit));
    limits_map.insert("memory".to_string(), Quantity(memory_limit));

    let container = Container {
        name: PROGRAM_CONTAINER.to_string(),
        image: Some(request.image_tag.clone()),
        command: Some(vec!["python".to_string(), request.entrypoint.clone()]),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits_map),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    // Service account only when secrets must be readable / 仅在需要读取密钥时绑定服务账户
    let service_account = if request.secret_names.is_empty() {
        None
    } else {
        Some(RUN_SERVICE_ACCOUNT.to_string())
    };

    let pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        service_account_name: service_account,
        termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
        security_context: Some(PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(DEFAULT_USER_ID),
            fs_group: Some(DEFAULT_GROUP_ID),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        containers: vec![container],
        volumes: Some(volumes),
        ..Default::default()
    };

    let labels = run_labels(&request.environment_id);

    Job {
        metadata: ObjectMeta {
            name: Some(run_job_name(&request.environment_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(DEFAULT_TTL_SECONDS),
            active_deadline_seconds: Some(limits.timeout_seconds),
            backoff_limit: Some(DEFAULT_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Run-job adapter backed by the cluster API / 基于集群API的运行作业适配器
pub struct K8sJobService {
    runs_namespace: String,
    client: OnceCell<Client>,
}

impl K8sJobService {
    pub fn new(runs_namespace: impl Into<String>) -> Self {
        Self {
            runs_namespace: runs_namespace.into(),
            client: OnceCell::new(),
        }
    }

    /// Lazily initialized cluster client (in-cluster config first, then
    /// kubeconfig). / 延迟初始化的集群客户端（优先集群内配置，其次kubeconfig）。
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

    /// First pod belonging to a job, if any / 属于作业的第一个Pod（如有）
    async fn find_job_pod(&self, job_name: &str, namespace: &str) -> ControlResult<Option<Pod>> {
        let client = self.client().await?;
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        let pod_list = pods
            .list(&params)
            .await
            .map_err(|e| ControlError::cluster(format!("failed to list pods for {job_name}"), e))?;
        Ok(pod_list.items.into_iter().next())
    }
}

/// Exit code and failure reason from a terminated program container
/// 从已终止程序容器提取退出码和失败原因
fn pod_termination(pod: &Pod) -> (Option<i32>, Option<String>) {
    let terminated = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|cs| cs.state.as_ref())
        .and_then(|state| state.terminated.as_ref());

    match terminated {
        Some(terminated) => {
            let exit_code = Some(terminated.exit_code);
            let error_message = if terminated.exit_code != 0 {
                terminated.reason.clone()
            } else {
                None
            };
            (exit_code, error_message)
        }
        None => (None, None),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl RunJobApi for K8sJobService {
    async fn create_run_job(&self, request: &RunJobRequest) -> ControlResult<String> {
        let job = build_run_job(request, &self.runs_namespace);
        let job_name = run_job_name(&request.environment_id);

        let client = self.client().await?;
        let jobs: Api<Job> = Api::namespaced(client, &self.runs_namespace);
        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(|e| ControlError::cluster(format!("failed to create run job {job_name}"), e))?;

        info!(job_name = %job_name, environment_id = %request.environment_id, "created run job");
        Ok(job_name)
    }

    async fn get_job_status(&self, job_name: &str, namespace: &str) -> ControlResult<JobInfo> {
        let client = self.client().await?;
        let jobs: Api<Job> = Api::namespaced(client, namespace);
        let job = jobs.get(job_name).await.map_err(|e| {
            if is_not_found(&e) {
                ControlError::not_found("job", job_name)
            } else {
                ControlError::cluster(format!("failed to get job {job_name}"), e)
            }
        })?;

        let status = derive_job_status(&job);
        let job_status = job.status.as_ref();

        let mut info = JobInfo {
            name: job_name.to_string(),
            namespace: namespace.to_string(),
            status,
            start_time: job_status
                .and_then(|s| s.start_time.as_ref())
                .map(|t| super::jiff_timestamp_to_chrono(t.0)),
            completion_time: job_status
                .and_then(|s| s.completion_time.as_ref())
                .map(|t| super::jiff_timestamp_to_chrono(t.0)),
            pod_name: None,
            exit_code: None,
            error_message: None,
        };

        // Pod details are best-effort / Pod详细信息尽力而为
        match self.find_job_pod(job_name, namespace).await {
            Ok(Some(pod)) => {
                info.pod_name = pod.metadata.name.clone();
                let (exit_code, error_message) = pod_termination(&pod);
                info.exit_code = exit_code;
                info.error_message = error_message;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(job_name = %job_name, error = %e, "failed to get pod info for job");
            }
        }

        Ok(info)
    }

    async fn get_pod_logs(
        &self,
        job_name: &str,
        namespace: &str,
        tail_lines: Option<i64>,
    ) -> ControlResult<Option<String>> {
        let Some(pod) = self.find_job_pod(job_name, namespace).await? else {
            debug!(job_name = %job_name, "no pods found for job");
            return Ok(None);
        };

        // Logs are only available once containers have started
        // 只有容器启动后才有日志
        let has_container_status = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| !statuses.is_empty())
            .unwrap_or(false);
        if !has_container_status {
            return Ok(None);
        }

        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControlError::ClusterState("pod has no name".to_string()))?;

        let client = self.client().await?;
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let params = LogParams {
            container: Some(PROGRAM_CONTAINER.to_string()),
            tail_lines,
            ..Default::default()
        };
        match pods.logs(&pod_name, &params).await {
            Ok(logs) => Ok(Some(logs)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => {
                warn!(job_name = %job_name, error = %e, "failed to get pod logs");
                Ok(None)
            }
        }
    }

    async fn delete_job(
        &self,
        job_name: &str,
        namespace: &str,
        propagation: PropagationPolicy,
        grace_period_seconds: Option<i64>,
    ) -> ControlResult<()> {
        let client = self.client().await?;
        let jobs: Api<Job> = Api::namespaced(client, namespace);

        let mut params = DeleteParams {
            propagation_policy: Some(propagation),
            ..Default::default()
        };
        params.grace_period_seconds = grace_period_seconds.map(|g| g as u32);

        match jobs.delete(job_name, &params).await {
            Ok(_) => {
                info!(job_name = %job_name, namespace = %namespace, ?grace_period_seconds, "deleted job");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                warn!(job_name = %job_name, "job not found, already deleted?");
                Ok(())
            }
            Err(e) => Err(ControlError::cluster(
                format!("failed to delete job {job_name}"),
                e,
            )),
        }
    }

    async fn cancel_job(&self, job_name: &str, namespace: &str, force: bool) -> ControlResult<()> {
        if force {
            // Immediate termination, SIGKILL / 立即终止，SIGKILL
            info!(job_name = %job_name, "force cancelling job");
            self.delete_job(job_name, namespace, PropagationPolicy::Foreground, Some(0))
                .await
        } else {
            // Graceful: the pod's configured grace period applies
            // 优雅取消：使用Pod配置的宽限期
            info!(job_name = %job_name, "gracefully cancelling job");
            self.delete_job(job_name, namespace, PropagationPolicy::Foreground, None)
                .await
        }
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        environment_id: Option<&str>,
    ) -> ControlResult<Vec<JobInfo>> {
        let mut selector = format!("{PART_OF_LABEL}={PART_OF_VALUE}");
        if let Some(environment_id) = environment_id {
            selector.push_str(&format!(",{ENVIRONMENT_ID_LABEL}={environment_id}"));
        }

        let client = self.client().await?;
        let jobs: Api<Job> = Api::namespaced(client, namespace);
        let job_list = jobs
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| ControlError::cluster("failed to list jobs", e))?;

        Ok(job_list
            .items
            .iter()
            .map(|job| JobInfo {
                name: job.metadata.name.clone().unwrap_or_default(),
                namespace: namespace.to_string(),
                status: derive_job_status(job),
                start_time: job
                    .status
                    .as_ref()
                    .and_then(|s| s.start_time.as_ref())
                    .map(|t| super::jiff_timestamp_to_chrono(t.0)),
                completion_time: job
                    .status
                    .as_ref()
                    .and_then(|s| s.completion_time.as_ref())
                    .map(|t| super::jiff_timestamp_to_chrono(t.0)),
                pod_name: None,
                exit_code: None,
                error_message: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(secret_names: Vec<String>) -> RunJobRequest {
        RunJobRequest {
            environment_id: "ENV12345-rest".to_string(),
            image_tag: "mellea-prog:abc".to_string(),
            resource_limits: ResourceLimits {
                cpu_cores: 2.0,
                memory_mb: 1024,
                timeout_seconds: 600,
            },
            entrypoint: "main.py".to_string(),
            secret_names,
        }
    }

    #[test]
    fn test_run_job_name_deterministic() {
        let name = run_job_name("ABCDEF1234567890");
        assert_eq!(name, "mellea-run-abcdef12");
        assert_eq!(name, run_job_name("ABCDEF1234567890"));
    }

    #[test]
    fn test_build_run_job_resources_and_labels() {
        let job = build_run_job(&request(vec![]), "mellea-runs");

        assert_eq!(job.metadata.name.as_deref(), Some("mellea-run-env12345"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("mellea-runs"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(PART_OF_LABEL).unwrap(), PART_OF_VALUE);
        assert_eq!(labels.get(JOB_TYPE_LABEL).unwrap(), "run");

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.active_deadline_seconds, Some(600));
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));

        let pod_spec = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.termination_grace_period_seconds, Some(30));
        assert!(pod_spec.service_account_name.is_none());

        let container = &pod_spec.containers[0];
        assert_eq!(container.name, PROGRAM_CONTAINER);
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["python".to_string(), "main.py".to_string()]
        );

        // Requests are half of limits / 请求是限制的一半
        let resources = container.resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests.get("cpu").unwrap().0, "1");
        assert_eq!(limits.get("cpu").unwrap().0, "2");
        assert_eq!(requests.get("memory").unwrap().0, "512Mi");
        assert_eq!(limits.get("memory").unwrap().0, "1024Mi");
    }

    #[test]
    fn test_build_run_job_security_context() {
        let job = build_run_job(&request(vec![]), "mellea-runs");
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        let pod_security = pod_spec.security_context.as_ref().unwrap();
        assert_eq!(pod_security.run_as_non_root, Some(true));
        assert_eq!(pod_security.run_as_user, Some(1000));
        assert_eq!(pod_security.fs_group, Some(1000));
        assert_eq!(
            pod_security.seccomp_profile.as_ref().unwrap().type_,
            "RuntimeDefault"
        );

        let container_security = pod_spec.containers[0].security_context.as_ref().unwrap();
        assert_eq!(container_security.allow_privilege_escalation, Some(false));
        assert_eq!(container_security.read_only_root_filesystem, Some(true));
        assert_eq!(
            container_security
                .capabilities
                .as_ref()
                .unwrap()
                .drop
                .as_ref()
                .unwrap(),
            &vec!["ALL".to_string()]
        );
    }

    #[test]
    fn test_build_run_job_without_secrets_has_two_volumes() {
        let job = build_run_job(&request(vec![]), "mellea-runs");
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volumes = pod_spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().all(|v| v.empty_dir.is_some()));
    }

    #[test]
    fn test_build_run_job_with_secrets_projects_them() {
        let job = build_run_job(
            &request(vec!["mellea-cred-aaa".to_string(), "mellea-cred-bbb".to_string()]),
            "mellea-runs",
        );
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        // Service account bound for secret access / 为密钥访问绑定服务账户
        assert_eq!(pod_spec.service_account_name.as_deref(), Some("mellea-run"));

        let volumes = pod_spec.volumes.as_ref().unwrap();
        let secret_volume = volumes
            .iter()
            .find(|v| v.name == "mellea-secrets")
            .expect("projected secret volume");
        let projected = secret_volume.projected.as_ref().unwrap();
        assert_eq!(projected.default_mode, Some(0o400));
        assert_eq!(projected.sources.as_ref().unwrap().len(), 2);

        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        let secret_mount = mounts
            .iter()
            .find(|m| m.name == "mellea-secrets")
            .expect("secret mount");
        assert_eq!(secret_mount.mount_path, SECRETS_MOUNT_PATH);
        assert_eq!(secret_mount.read_only, Some(true));
    }
}
